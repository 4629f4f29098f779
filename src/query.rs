//! Predicate assembly: template strings with positional markers plus typed
//! argument slices, rendered into a single SQL fragment.
//!
//! Arguments are spliced in as literals produced by [`codec::to_literal`],
//! not bound through the prepared-statement protocol. Markers that appear
//! inside quoted literals, quoted identifiers or `--` / `/* */` comments are
//! left alone.

use crate::codec;
use crate::error::{Error, Result};
use crate::value::Value;

/// Default substitution marker.
pub const DEFAULT_MARKER: &str = "?";

/// Maximum identifier length accepted by [`quote_identifier`].
const MAX_IDENTIFIER_LENGTH: usize = 128;

/// Build a fixed-size argument array for predicate rendering.
///
/// ```ignore
/// store.all_where::<User>("age > ? AND name <> ?", &sql_args![18, "Bob"])?;
/// ```
#[macro_export]
macro_rules! sql_args {
    () => {{
        let args: [$crate::Value; 0] = [];
        args
    }};
    ($($arg:expr),+ $(,)?) => {
        [$($crate::Value::from($arg)),+]
    };
}

/// Renders predicate templates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryBuilder {
    marker: String,
}

impl Default for QueryBuilder {
    fn default() -> Self {
        Self {
            marker: DEFAULT_MARKER.to_string(),
        }
    }
}

/// Lexical state of the scanner: plain SQL, inside a quoted literal or
/// identifier, or inside a comment.
#[derive(Clone, Copy, PartialEq, Eq)]
enum Lex {
    Code,
    Single,
    Double,
    LineComment,
    BlockComment,
}

impl Lex {
    /// Consume the first character (or two-character token) of `rest`.
    /// Returns the state after it and the number of bytes consumed.
    fn step(self, rest: &str) -> (Lex, usize) {
        let Some(ch) = rest.chars().next() else {
            return (self, 0);
        };
        match self {
            Lex::Code if rest.starts_with("--") => (Lex::LineComment, 2),
            Lex::Code if rest.starts_with("/*") => (Lex::BlockComment, 2),
            Lex::Code if ch == '\'' => (Lex::Single, 1),
            Lex::Code if ch == '"' => (Lex::Double, 1),
            Lex::Single if ch == '\'' => (Lex::Code, 1),
            Lex::Double if ch == '"' => (Lex::Code, 1),
            Lex::LineComment if ch == '\n' => (Lex::Code, 1),
            Lex::BlockComment if rest.starts_with("*/") => (Lex::Code, 2),
            state => (state, ch.len_utf8()),
        }
    }
}

impl QueryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use a custom substitution marker, e.g. `"%@"` or `":?"`.
    pub fn with_marker(mut self, marker: impl Into<String>) -> Self {
        self.marker = marker.into();
        self
    }

    pub fn marker(&self) -> &str {
        &self.marker
    }

    /// Substitute `args` into `template`, one argument per marker, in order.
    pub fn render(&self, template: &str, args: &[Value]) -> Result<String> {
        if self.marker.is_empty() {
            return Err(Error::Config("substitution marker cannot be empty".to_string()));
        }
        let mut out = String::with_capacity(template.len() + args.len() * 8);
        let mut markers = 0;
        let mut lex = Lex::Code;
        let mut i = 0;
        while i < template.len() {
            let rest = &template[i..];
            if lex == Lex::Code && rest.starts_with(self.marker.as_str()) {
                if let Some(arg) = args.get(markers) {
                    out.push_str(&codec::to_literal(arg));
                }
                markers += 1;
                i += self.marker.len();
                continue;
            }
            let (next, width) = lex.step(rest);
            if width == 0 {
                break;
            }
            out.push_str(&rest[..width]);
            lex = next;
            i += width;
        }
        if markers != args.len() {
            return Err(Error::ArgumentCount {
                expected: markers,
                actual: args.len(),
            });
        }
        Ok(out)
    }
}

/// Whether `fragment` contains the keyword sequence at the top level.
pub(crate) fn has_clause(fragment: &str, keywords: &[&str]) -> bool {
    find_clause(fragment, keywords).is_some()
}

/// Byte offset of the first top-level occurrence of the keyword sequence
/// (case-insensitive). Words inside parentheses, quotes or comments do not
/// count, so a subquery's `LIMIT` is not the fragment's `LIMIT`.
pub(crate) fn find_clause(fragment: &str, keywords: &[&str]) -> Option<usize> {
    if keywords.is_empty() {
        return None;
    }
    top_level_words(fragment)
        .windows(keywords.len())
        .find(|window| {
            window
                .iter()
                .zip(keywords)
                .all(|((_, word), keyword)| word.eq_ignore_ascii_case(keyword))
        })
        .map(|window| window[0].0)
}

fn top_level_words(fragment: &str) -> Vec<(usize, &str)> {
    let mut words = Vec::new();
    let mut lex = Lex::Code;
    let mut depth = 0usize;
    let mut start = None;
    let mut i = 0;
    while i < fragment.len() {
        let rest = &fragment[i..];
        let (next, width) = lex.step(rest);
        if width == 0 {
            break;
        }
        let plain = lex == Lex::Code && next == Lex::Code;
        let ch = rest.chars().next().unwrap_or(' ');
        if plain && ch == '(' {
            depth += 1;
        } else if plain && ch == ')' {
            depth = depth.saturating_sub(1);
        }
        if plain && depth == 0 && (ch.is_alphanumeric() || ch == '_') {
            start.get_or_insert(i);
        } else if let Some(from) = start.take() {
            words.push((from, &fragment[from..i]));
        }
        lex = next;
        i += width;
    }
    if let Some(from) = start {
        words.push((from, &fragment[from..]));
    }
    words
}

/// Validate and double-quote a table or column name.
pub fn quote_identifier(name: &str) -> Result<String> {
    if name.is_empty() {
        return Err(Error::Config("identifier cannot be empty".to_string()));
    }
    if name.contains('\0') {
        return Err(Error::Config(format!("identifier contains a null byte: {name:?}")));
    }
    if name.len() > MAX_IDENTIFIER_LENGTH {
        return Err(Error::Config(format!(
            "identifier exceeds {MAX_IDENTIFIER_LENGTH} bytes: {name:?}"
        )));
    }
    Ok(format!("\"{}\"", name.replace('"', "\"\"")))
}
