//! The document-store capability consumed by the repositories, plus the
//! evaluation helpers shared by the bundled backends.

mod codec;
mod memory;
mod pool;
mod tikv;

use std::sync::Arc;

use async_trait::async_trait;

use crate::{
    Document, Error, Filter, KEY_FIELD, Projection, Sort, SortOrder, Value, utils::generate_key,
};

pub use memory::MemoryStore;
pub use pool::PooledStore;
pub use tikv::TikvStore;

#[derive(Debug, Clone, Default)]
pub struct FindOptions {
    pub sort: Sort,
    pub skip: Option<u64>,
    pub limit: Option<u64>,
    pub projection: Option<Projection>,
}

/// Field-level modifications. `set` and `inc` hold flattened dot paths.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Update {
    pub set: Document,
    pub inc: Document,
    pub set_on_insert: Document,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpdateOutcome {
    pub matched: u64,
    pub modified: u64,
    pub upserted: u64,
}

impl UpdateOutcome {
    /// Something matched, changed or was inserted.
    pub fn changed(&self) -> bool {
        self.matched > 0 || self.modified > 0 || self.upserted > 0
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct IndexOptions {
    pub name: Option<String>,
    pub unique: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct IndexSpec {
    pub keys: Vec<(String, SortOrder)>,
    pub options: IndexOptions,
}

impl IndexSpec {
    pub fn new(keys: Vec<(String, SortOrder)>) -> Self {
        Self {
            keys,
            options: IndexOptions::default(),
        }
    }

    pub fn ascending(path: impl Into<String>) -> Self {
        Self::new(vec![(path.into(), SortOrder::Ascending)])
    }

    pub fn unique(mut self) -> Self {
        self.options.unique = true;
        self
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.options.name = Some(name.into());
        self
    }

    /// Explicit name, or `field_1_other_-1` built from the keys.
    pub fn name(&self) -> String {
        if let Some(name) = &self.options.name {
            return name.clone();
        }
        self.keys
            .iter()
            .map(|(path, order)| match order {
                SortOrder::Ascending => format!("{path}_1"),
                SortOrder::Descending => format!("{path}_-1"),
            })
            .collect::<Vec<_>>()
            .join("_")
    }
}

/// Per-collection operations of a document store.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Returns the key of the stored document, generating one when the
    /// document carries none.
    async fn insert_one(&self, collection: &str, doc: Document) -> Result<String, Error>;

    /// All or nothing: a duplicate key rejects the whole batch.
    async fn insert_many(&self, collection: &str, docs: Vec<Document>) -> Result<u64, Error>;

    async fn find_one(
        &self,
        collection: &str,
        filter: &Filter,
        projection: Option<&Projection>,
    ) -> Result<Option<Document>, Error>;

    async fn find(
        &self,
        collection: &str,
        filter: &Filter,
        options: &FindOptions,
    ) -> Result<Vec<Document>, Error>;

    async fn update_one(
        &self,
        collection: &str,
        filter: &Filter,
        update: &Update,
        upsert: bool,
    ) -> Result<UpdateOutcome, Error>;

    async fn update_many(
        &self,
        collection: &str,
        filter: &Filter,
        update: &Update,
        upsert: bool,
    ) -> Result<UpdateOutcome, Error>;

    async fn delete_one(&self, collection: &str, filter: &Filter) -> Result<u64, Error>;

    async fn delete_many(&self, collection: &str, filter: &Filter) -> Result<u64, Error>;

    async fn count(&self, collection: &str, filter: &Filter) -> Result<u64, Error>;

    /// Returns the index name. Creating an identical index again is a no-op.
    async fn create_index(&self, collection: &str, index: &IndexSpec) -> Result<String, Error>;

    async fn start_session(&self) -> Result<Box<dyn StoreSession>, Error>;

    /// Releases backend resources.
    async fn close(&self) -> Result<(), Error> {
        Ok(())
    }
}

/// A transaction scope. Writes made through [`StoreSession::store`] become
/// visible to others only after [`StoreSession::commit`].
#[async_trait]
pub trait StoreSession: Send + Sync {
    fn store(&self) -> Arc<dyn DocumentStore>;

    async fn commit(&self) -> Result<(), Error>;

    async fn abort(&self) -> Result<(), Error>;

    /// Releases the session. Called exactly once, from a drop guard, so it
    /// cannot await.
    fn end(&self);
}

/// Filters, sorts, pages and projects an in-memory candidate set.
pub(crate) fn select<'a>(
    docs: impl Iterator<Item = &'a Document>,
    filter: &Filter,
    options: &FindOptions,
) -> Result<Vec<Document>, Error> {
    let mut matched: Vec<&Document> = docs.filter(|doc| filter.matches(doc)).collect();
    if !options.sort.is_empty() {
        matched.sort_by(|a, b| options.sort.compare(a, b));
    }
    // zero skip/limit mean "not set"
    let skip = options.skip.unwrap_or(0) as usize;
    let limit = match options.limit {
        Some(0) | None => usize::MAX,
        Some(limit) => limit as usize,
    };
    matched
        .into_iter()
        .skip(skip)
        .take(limit)
        .map(|doc| match &options.projection {
            Some(projection) => projection.apply(doc),
            None => Ok(doc.clone()),
        })
        .collect()
}

pub(crate) fn document_key(doc: &Document) -> Result<String, Error> {
    match doc.get(KEY_FIELD) {
        Some(Value::String(key)) => Ok(key.clone()),
        Some(other) => Err(Error::InvalidKey(format!(
            "key must be a string, found {}",
            other.type_name()
        ))),
        None => Err(Error::InvalidKey("document has no key".to_string())),
    }
}

/// Makes sure the document carries a key, generating one if needed.
pub(crate) fn ensure_key(doc: &mut Document) -> Result<String, Error> {
    if doc.contains_key(KEY_FIELD) {
        return document_key(doc);
    }
    let key = generate_key();
    doc.insert(KEY_FIELD, key.clone());
    Ok(key)
}

/// Applies `update` to `doc` in place. Returns whether anything changed.
pub(crate) fn apply_update(doc: &mut Document, update: &Update) -> Result<bool, Error> {
    let before = doc.clone();
    for (path, value) in update.set.iter() {
        if path == KEY_FIELD {
            if doc.get(KEY_FIELD) != Some(value) {
                return Err(Error::Store("the key field is immutable".to_string()));
            }
            continue;
        }
        doc.set_path(path, value.clone()).map_err(Error::Store)?;
    }
    for (path, delta) in update.inc.iter() {
        let next = match (doc.get_path(path), delta) {
            (None | Some(Value::Null), delta) if delta.is_numeric() => delta.clone(),
            (Some(Value::Int(current)), Value::Int(delta)) => Value::Int(
                current
                    .checked_add(*delta)
                    .ok_or_else(|| Error::Store(format!("increment of `{path}` overflows")))?,
            ),
            (Some(current), delta) if current.is_numeric() && delta.is_numeric() => {
                Value::Float(current.as_f64().unwrap_or_default() + delta.as_f64().unwrap_or_default())
            }
            (Some(current), _) => {
                return Err(Error::Store(format!(
                    "cannot increment `{path}` holding a {} value",
                    current.type_name()
                )));
            }
            (None, delta) => {
                return Err(Error::Store(format!(
                    "cannot increment `{path}` by a {} value",
                    delta.type_name()
                )));
            }
        };
        doc.set_path(path, next).map_err(Error::Store)?;
    }
    Ok(*doc != before)
}

/// The document an upsert inserts when nothing matched: equality
/// conditions of the filter, then the update itself.
pub(crate) fn upsert_document(filter: &Filter, update: &Update) -> Result<Document, Error> {
    let mut doc = Document::new();
    for (path, value) in filter.equality_fields() {
        doc.set_path(path.as_str(), value.clone()).map_err(Error::Store)?;
    }
    for (path, value) in update.set_on_insert.iter() {
        doc.set_path(path, value.clone()).map_err(Error::Store)?;
    }
    let mut set = update.set.clone();
    // the seeded key wins over anything in the set clause
    set.remove(KEY_FIELD);
    apply_update(
        &mut doc,
        &Update {
            set,
            inc: update.inc.clone(),
            set_on_insert: Document::new(),
        },
    )?;
    ensure_key(&mut doc)?;
    Ok(doc)
}

/// The values `doc` holds for the keys of `index`, missing ones as null.
pub(crate) fn index_values(index: &IndexSpec, doc: &Document) -> Vec<Value> {
    index
        .keys
        .iter()
        .map(|(path, _)| doc.get_path(path).cloned().unwrap_or(Value::Null))
        .collect()
}

/// Rejects `candidate` if it collides with another document on a unique
/// index. `others` must not contain the candidate itself.
pub(crate) fn check_unique<'a>(
    indexes: impl Iterator<Item = &'a IndexSpec>,
    others: impl Iterator<Item = &'a Document> + Clone,
    candidate: &Document,
) -> Result<(), Error> {
    for index in indexes.filter(|index| index.options.unique) {
        let wanted = index_values(index, candidate);
        if others.clone().any(|doc| index_values(index, doc) == wanted) {
            return Err(Error::DuplicateKey(format!(
                "unique index `{}` violated",
                index.name()
            )));
        }
    }
    Ok(())
}
