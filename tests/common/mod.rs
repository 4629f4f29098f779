#![allow(dead_code)]

use std::sync::Arc;

use chrono::{DateTime, Utc};
use rust_sqlite_records::codec::{self, CodecError};
use rust_sqlite_records::{
    Database, DatabaseConfig, Entity, FieldTable, SchemaRegistry, Store, Value, ValueKind,
};
use tempfile::TempDir;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct User {
    pub id: Option<String>,
    pub name: String,
    pub age: i64,
}

impl User {
    pub fn new(name: &str, age: i64) -> Self {
        Self {
            id: None,
            name: name.to_string(),
            age,
        }
    }
}

impl Entity for User {
    fn table_name() -> String {
        "users".to_string()
    }

    fn fields(fields: &mut FieldTable<Self>) {
        fields
            .field("name", |u| u.name.clone(), |u, v| u.name = v)
            .field("age", |u| u.age, |u, v| u.age = v);
    }

    fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    fn set_id(&mut self, id: String) {
        self.id = Some(id);
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Order {
    pub id: Option<String>,
    pub user_id: String,
    pub total: f64,
}

impl Entity for Order {
    fn table_name() -> String {
        "orders".to_string()
    }

    fn fields(fields: &mut FieldTable<Self>) {
        fields
            .field("user_id", |o| o.user_id.clone(), |o, v| o.user_id = v)
            .field("total", |o| o.total, |o, v| o.total = v);
    }

    fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    fn set_id(&mut self, id: String) {
        self.id = Some(id);
    }
}

/// Exercises every value kind; uses the derived table name `profile`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Profile {
    pub id: Option<String>,
    pub active: bool,
    pub joined: DateTime<Utc>,
    pub avatar: Vec<u8>,
    pub tags: serde_json::Value,
    pub nickname: Option<String>,
    pub score: f64,
    pub visits: u32,
}

impl Entity for Profile {
    fn fields(fields: &mut FieldTable<Self>) {
        fields
            .field("active", |p| p.active, |p, v| p.active = v)
            .field("joined", |p| p.joined, |p, v| p.joined = v)
            .field("avatar", |p| p.avatar.clone(), |p, v| p.avatar = v)
            .field("tags", |p| p.tags.clone(), |p, v| p.tags = v)
            .field("nickname", |p| p.nickname.clone(), |p, v| p.nickname = v)
            .field("score", |p| p.score, |p, v| p.score = v)
            .field("visits", |p| p.visits, |p, v| p.visits = v);
    }

    fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    fn set_id(&mut self, id: String) {
        self.id = Some(id);
    }
}

/// Stores `labels` as comma-joined text instead of JSON.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Note {
    pub id: Option<String>,
    pub title: String,
    pub labels: serde_json::Value,
}

impl Entity for Note {
    fn table_name() -> String {
        "notes".to_string()
    }

    fn fields(fields: &mut FieldTable<Self>) {
        fields
            .field("title", |n| n.title.clone(), |n, v| n.title = v)
            .field("labels", |n| n.labels.clone(), |n, v| n.labels = v);
    }

    fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    fn set_id(&mut self, id: String) {
        self.id = Some(id);
    }

    fn serialize_property(&self, name: &str, value: &Value) -> Option<String> {
        match (name, value) {
            ("labels", Value::Json(serde_json::Value::Array(items))) => Some(
                items
                    .iter()
                    .filter_map(serde_json::Value::as_str)
                    .collect::<Vec<_>>()
                    .join(","),
            ),
            ("labels", _) => None,
            _ => codec::encode(value),
        }
    }

    fn deserialize_property(
        name: &str,
        kind: ValueKind,
        text: Option<&str>,
    ) -> Result<Value, CodecError> {
        match (name, text) {
            ("labels", Some(text)) => Ok(Value::Json(
                text.split(',').filter(|label| !label.is_empty()).collect(),
            )),
            _ => codec::decode(kind, text),
        }
    }
}

pub fn registry() -> SchemaRegistry {
    let mut schema = SchemaRegistry::new();
    schema
        .register::<User>()
        .register::<Order>()
        .register::<Profile>()
        .register::<Note>();
    schema
}

// Helper function to create an in-memory store for testing
pub fn create_test_store() -> Store {
    let db = Database::open_in_memory().unwrap();
    Store::open(Arc::new(db), registry()).unwrap()
}

// Helper function to create a store backed by a temporary database file
pub fn create_temp_store() -> (Store, TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let db = Database::open(DatabaseConfig::new(dir.path().join("records.db"))).unwrap();
    (Store::open(Arc::new(db), registry()).unwrap(), dir)
}
