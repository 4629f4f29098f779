//! Change notifications.
//!
//! Observers subscribe to an event mask for one entity type under an
//! [`ObserverContext`]. The context owns its subscriptions until it is handed
//! back to [`ObserverRegistry::remove_observer`]; dropping a context does not
//! unsubscribe anything.

use std::any::{Any, TypeId};
use std::fmt;
use std::ops::{BitAnd, BitOr, BitOrAssign};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use tracing::{debug, warn};

use crate::entity::Entity;

/// Bit mask of mutation events.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Events(u8);

impl Events {
    pub const NONE: Events = Events(0);
    pub const INSERTION: Events = Events(1 << 0);
    pub const DELETION: Events = Events(1 << 1);
    pub const MODIFICATION: Events = Events(1 << 2);
    pub const ALL: Events = Events(0b111);

    pub const fn bits(self) -> u8 {
        self.0
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub const fn contains(self, other: Events) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn intersects(self, other: Events) -> bool {
        self.0 & other.0 != 0
    }
}

impl BitOr for Events {
    type Output = Events;

    fn bitor(self, rhs: Events) -> Events {
        Events(self.0 | rhs.0)
    }
}

impl BitOrAssign for Events {
    fn bitor_assign(&mut self, rhs: Events) {
        self.0 |= rhs.0;
    }
}

impl BitAnd for Events {
    type Output = Events;

    fn bitand(self, rhs: Events) -> Events {
        Events(self.0 & rhs.0)
    }
}

impl fmt::Debug for Events {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = [
            (Events::INSERTION, "INSERTION"),
            (Events::DELETION, "DELETION"),
            (Events::MODIFICATION, "MODIFICATION"),
        ]
        .iter()
        .filter(|(flag, _)| self.contains(*flag))
        .map(|(_, name)| *name)
        .collect();
        if names.is_empty() {
            f.write_str("Events(NONE)")
        } else {
            write!(f, "Events({})", names.join(" | "))
        }
    }
}

static NEXT_CONTEXT: AtomicU64 = AtomicU64::new(1);

/// Owner of a group of subscriptions.
///
/// Not `Clone`: releasing it through [`ObserverRegistry::remove_observer`]
/// consumes it, so a released context cannot subscribe again.
#[derive(Debug, PartialEq, Eq, Hash)]
pub struct ObserverContext {
    id: u64,
}

impl ObserverContext {
    pub fn new() -> Self {
        Self {
            id: NEXT_CONTEXT.fetch_add(1, Ordering::Relaxed),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }
}

impl Default for ObserverContext {
    fn default() -> Self {
        Self::new()
    }
}

type Callback = Arc<dyn Fn(&dyn Any, Events) -> anyhow::Result<()> + Send + Sync>;

struct Subscription {
    context: u64,
    type_id: TypeId,
    events: Events,
    callback: Callback,
}

/// Table of (event mask, context, callback) subscriptions.
#[derive(Default)]
pub struct ObserverRegistry {
    subscriptions: RwLock<Vec<Subscription>>,
}

impl ObserverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe `callback` to `events` on entities of type `E`.
    pub fn add_observer<E, F>(&self, events: Events, context: &ObserverContext, callback: F)
    where
        E: Entity,
        F: Fn(&E, Events) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let callback: Callback = Arc::new(move |entity: &dyn Any, event: Events| {
            match entity.downcast_ref::<E>() {
                Some(entity) => callback(entity, event),
                None => Ok(()),
            }
        });
        debug!(context = context.id, ?events, entity = std::any::type_name::<E>(), "observer added");
        self.subscriptions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Subscription {
                context: context.id,
                type_id: TypeId::of::<E>(),
                events,
                callback,
            });
    }

    /// Release every subscription owned by `context`. Returns how many were
    /// removed.
    pub fn remove_observer(&self, context: ObserverContext) -> usize {
        let mut subscriptions = self
            .subscriptions
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let before = subscriptions.len();
        subscriptions.retain(|subscription| subscription.context != context.id);
        let removed = before - subscriptions.len();
        debug!(context = context.id, removed, "observer context released");
        removed
    }

    /// Number of live subscriptions.
    pub fn len(&self) -> usize {
        self.subscriptions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Deliver `event` for `entity` to every matching subscription.
    pub fn notify<E: Entity>(&self, entity: &E, event: Events) {
        self.notify_any(TypeId::of::<E>(), entity, event);
    }

    /// Callbacks run on the caller's thread without the registry lock held.
    /// A failing or panicking callback is logged and does not affect the
    /// others.
    pub(crate) fn notify_any(&self, type_id: TypeId, entity: &dyn Any, event: Events) {
        let callbacks: Vec<Callback> = self
            .subscriptions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|subscription| {
                subscription.type_id == type_id && subscription.events.intersects(event)
            })
            .map(|subscription| Arc::clone(&subscription.callback))
            .collect();
        for callback in callbacks {
            match catch_unwind(AssertUnwindSafe(|| callback(entity, event))) {
                Ok(Ok(())) => {}
                Ok(Err(err)) => warn!(?event, error = %err, "observer failed"),
                Err(_) => warn!(?event, "observer panicked"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn masks_combine() {
        let mask = Events::INSERTION | Events::DELETION;
        assert!(mask.contains(Events::INSERTION));
        assert!(!mask.contains(Events::MODIFICATION));
        assert!(mask.intersects(Events::DELETION | Events::MODIFICATION));
        assert!(Events::NONE.is_empty());
        assert_eq!(Events::ALL, Events::INSERTION | Events::DELETION | Events::MODIFICATION);
        assert_eq!(format!("{mask:?}"), "Events(INSERTION | DELETION)");
    }

    #[test]
    fn contexts_are_unique() {
        assert_ne!(ObserverContext::new().id(), ObserverContext::new().id());
    }
}
