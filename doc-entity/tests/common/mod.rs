#![allow(dead_code)]

use std::sync::Arc;

use doc_entity::{DB, Document, Model, Schema, SchemaValidator, ValidationErrors, store::MemoryStore};

pub fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// A database on a fresh memory store, plus the store for inspection.
pub fn memory_db() -> (DB, MemoryStore) {
    init_logger();
    let store = MemoryStore::new();
    (DB::new(Arc::new(store.clone())), store)
}

#[derive(Debug, Clone, PartialEq, Model)]
pub struct Location {
    pub city: String,
    pub lane: i64,
}

#[derive(Debug, Clone, PartialEq, Model)]
#[model(collection = "booths", rename_all = "camelCase")]
pub struct Booth {
    pub name: String,
    pub total_passed: i64,
    pub location: Location,
    pub x: Option<i64>,
    pub y: Option<i64>,
    pub z: Option<i64>,
}

pub fn booth(name: &str) -> Booth {
    Booth {
        name: name.to_string(),
        total_passed: 0,
        location: Location {
            city: "Pune".to_string(),
            lane: 1,
        },
        x: None,
        y: None,
        z: None,
    }
}

/// Schema rules plus "totalPassed is never negative".
pub struct NonNegativeTotals(pub Schema);

impl NonNegativeTotals {
    pub fn new() -> Arc<Self> {
        Arc::new(Self(Booth::schema()))
    }

    fn check(doc: &Document) -> Result<(), ValidationErrors> {
        match doc.get("totalPassed").and_then(|value| value.as_i64()) {
            Some(total) if total < 0 => Err(ValidationErrors::single("totalPassed", "must not be negative")),
            _ => Ok(()),
        }
    }
}

impl SchemaValidator for NonNegativeTotals {
    fn validate_full(&self, doc: &Document) -> Result<Document, ValidationErrors> {
        Self::check(doc)?;
        self.0.validate_full(doc)
    }

    fn validate_partial(&self, doc: &Document) -> Result<Document, ValidationErrors> {
        Self::check(doc)?;
        self.0.validate_partial(doc)
    }

    fn field_type(&self, path: &str) -> Option<doc_entity::FieldType> {
        self.0.field_type(path)
    }
}
