use std::{fmt, marker::PhantomData, sync::Arc};

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use log::{debug, error, warn};
use serde::{Serialize, Serializer};

use crate::{
    CREATED_ON_FIELD, Collection, DB, Document, DocumentHandle, Error, FieldPath, Filter,
    KEY_FIELD, Projection, RepoResult, RequestContext, SchemaValidator, Sort, Value,
    flatten::flatten,
    schema::ValidationErrors,
    store::{DocumentStore, FindOptions, IndexSpec, Update, document_key},
    utils::{is_generated_key, now},
};

/// A stored model with its key and creation timestamp.
#[derive(Debug, Clone, PartialEq)]
pub struct Record<T> {
    pub key: String,
    pub created_on: Option<DateTime<Utc>>,
    pub data: T,
}

impl<T: Collection> Record<T> {
    /// The persisted form, key and timestamp included.
    pub fn to_document(&self) -> Document {
        let mut doc = self.data.to_document();
        doc.insert(KEY_FIELD, self.key.clone());
        if let Some(created_on) = self.created_on {
            doc.insert(CREATED_ON_FIELD, created_on);
        }
        doc
    }
}

impl<T: Collection> Serialize for Record<T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_document().serialize(serializer)
    }
}

/// Limit and offset of a list read. `None` or zero means unbounded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Page {
    pub limit: Option<u64>,
    pub offset: Option<u64>,
}

impl Page {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn new(limit: u64, offset: u64) -> Self {
        Self {
            limit: Some(limit),
            offset: Some(offset),
        }
    }

    pub fn limit(limit: u64) -> Self {
        Self {
            limit: Some(limit),
            offset: None,
        }
    }
}

/// Query of [`CollectionRepository::filter_and_sort`]: `filter AND (or[0] OR or[1] ...)`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FilterAndSort {
    pub filter: Filter,
    pub or: Vec<Filter>,
    pub sort: Sort,
    pub page: Page,
}

impl FilterAndSort {
    pub fn query(&self) -> Filter {
        if self.or.is_empty() {
            self.filter.clone()
        } else {
            self.filter.clone().and(Filter::any_of(self.or.clone()))
        }
    }
}

/// Typed access to one collection.
pub struct CollectionRepository<T> {
    pub(crate) db: DB,
    pub(crate) validator: Arc<dyn SchemaValidator>,
    pub(crate) context: RequestContext,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Clone for CollectionRepository<T> {
    fn clone(&self) -> Self {
        Self {
            db: self.db.clone(),
            validator: self.validator.clone(),
            context: self.context.clone(),
            _marker: PhantomData,
        }
    }
}

impl<T: Collection> CollectionRepository<T> {
    /// Validates with the model's own schema.
    pub fn new(db: &DB) -> Self {
        Self::with_validator(db, Arc::new(T::schema()))
    }

    pub fn with_validator(db: &DB, validator: Arc<dyn SchemaValidator>) -> Self {
        Self {
            db: db.clone(),
            validator,
            context: RequestContext::default(),
            _marker: PhantomData,
        }
    }

    pub fn name(&self) -> &'static str {
        T::collection_name()
    }

    /// A copy whose log lines carry `context`.
    pub fn with_context(&self, context: RequestContext) -> Self {
        Self {
            context,
            ..self.clone()
        }
    }

    /// A copy running against `db`, usually the transactional handle passed
    /// to [`DB::transaction`].
    pub fn in_transaction(&self, db: &DB) -> Self {
        Self {
            db: db.clone(),
            ..self.clone()
        }
    }

    pub fn doc(&self, key: impl Into<String>) -> DocumentHandle<T> {
        DocumentHandle::new(self.clone(), key.into())
    }

    pub(crate) fn store(&self) -> &Arc<dyn DocumentStore> {
        self.db.store()
    }

    fn failed(&self, op: &str, input: &dyn fmt::Debug, err: Error) -> Error {
        error!(
            "{}{} collection: {op} failed for {input:?}: {err}",
            self.context,
            self.name()
        );
        err
    }

    /// Full-validates a stored document and builds the record.
    pub(crate) fn decode(&self, doc: &Document) -> Result<Record<T>, Error> {
        let cleaned = self.validator.validate_full(doc).map_err(Error::Validation)?;
        Ok(Record {
            key: document_key(&cleaned)?,
            created_on: cleaned
                .get(CREATED_ON_FIELD)
                .and_then(Value::as_datetime)
                .copied(),
            data: T::from_document(&cleaned)?,
        })
    }

    fn decode_all(&self, docs: Vec<Document>) -> Vec<Record<T>> {
        docs.iter()
            .filter_map(|doc| match self.decode(doc) {
                Ok(record) => Some(record),
                Err(err) => {
                    warn!(
                        "{}{} collection: skipping stored document {:?}: {err}",
                        self.context,
                        self.name(),
                        doc.get(KEY_FIELD)
                    );
                    None
                }
            })
            .collect()
    }

    /// Stamps, full-validates and cleans a model about to be inserted.
    pub(crate) fn prepare_insert(&self, key: Option<&str>, value: &T) -> Result<Document, Error> {
        let mut doc = value.to_document();
        doc.insert(CREATED_ON_FIELD, now());
        if let Some(key) = key {
            if key.is_empty() {
                return Err(Error::InvalidKey("key must not be empty".to_string()));
            }
            doc.insert(KEY_FIELD, key);
        }
        self.validator.validate_full(&doc).map_err(Error::Validation)
    }

    /// Partial-validates and flattens an update. The key never reaches the
    /// set clause and the creation timestamp is only written on insert.
    pub(crate) fn prepare_set(&self, partial: &Document) -> Result<Update, Error> {
        let cleaned = self.validator.validate_partial(partial).map_err(Error::Validation)?;
        let mut set = flatten(&cleaned)?;
        set.remove(KEY_FIELD);
        let created_on = set
            .remove(CREATED_ON_FIELD)
            .unwrap_or_else(|| Value::DateTime(now()));
        let mut set_on_insert = Document::new();
        set_on_insert.insert(CREATED_ON_FIELD, created_on);
        Ok(Update {
            set,
            inc: Document::new(),
            set_on_insert,
        })
    }

    /// Partial-validates and flattens numeric deltas.
    pub(crate) fn prepare_increment(&self, deltas: &Document) -> Result<Update, Error> {
        let cleaned = self.validator.validate_partial(deltas).map_err(Error::Validation)?;
        let mut inc = flatten(&cleaned)?;
        inc.remove(KEY_FIELD);
        inc.remove(CREATED_ON_FIELD);
        let mut errors = ValidationErrors::default();
        for (path, value) in inc.iter() {
            if !value.is_numeric() {
                errors.push(path.as_str(), format!("cannot increment by a {} value", value.type_name()));
            }
        }
        if !errors.is_empty() {
            return Err(Error::Validation(errors));
        }
        let mut set_on_insert = Document::new();
        set_on_insert.insert(CREATED_ON_FIELD, now());
        Ok(Update {
            set: Document::new(),
            inc,
            set_on_insert,
        })
    }

    fn find_options(&self, sort: &Sort, page: Page, projection: Option<&Projection>) -> Result<FindOptions, Error> {
        sort.validate(self.validator.as_ref())?;
        if let Some(projection) = projection {
            projection.validate(self.validator.as_ref())?;
        }
        Ok(FindOptions {
            sort: sort.clone(),
            skip: page.offset,
            limit: page.limit,
            projection: projection.cloned(),
        })
    }

    async fn find(&self, filter: &Filter, sort: &Sort, page: Page, projection: Option<&Projection>) -> Result<Vec<Document>, Error> {
        filter.validate(self.validator.as_ref())?;
        let options = self.find_options(sort, page, projection)?;
        let docs = self.store().find(self.name(), filter, &options).await?;
        debug!(
            "{}{} collection: {} documents for {filter:?}",
            self.context,
            self.name(),
            docs.len()
        );
        Ok(docs)
    }

    pub async fn insert(&self, value: &T) -> RepoResult<Record<T>> {
        self.insert_document(None, value).await
    }

    /// Inserts under a caller-chosen key.
    pub async fn insert_with_key(&self, key: impl AsRef<str>, value: &T) -> RepoResult<Record<T>> {
        self.insert_document(Some(key.as_ref()), value).await
    }

    async fn insert_document(&self, key: Option<&str>, value: &T) -> RepoResult<Record<T>> {
        let input = value.to_document();
        let doc = self
            .prepare_insert(key, value)
            .map_err(|err| self.failed("insert", &input, err))?;
        let key = self
            .store()
            .insert_one(self.name(), doc.clone())
            .await
            .map_err(|err| self.failed("insert", &input, err))?;
        debug!("{}{} collection: inserted {key}", self.context, self.name());
        let mut stored = doc;
        stored.insert(KEY_FIELD, key);
        self.decode(&stored)
            .map_err(|err| self.failed("insert", &input, err))
    }

    /// Validates every item before writing any. The first invalid item
    /// aborts the batch.
    pub async fn insert_many(&self, values: &[T]) -> RepoResult<u64> {
        let mut docs = Vec::with_capacity(values.len());
        for (index, value) in values.iter().enumerate() {
            match self.prepare_insert(None, value) {
                Ok(doc) => docs.push(doc),
                Err(Error::Validation(errors)) => {
                    return Err(self.failed(
                        "insert_many",
                        &value.to_document(),
                        Error::BatchAbort { index, errors },
                    ));
                }
                Err(err) => return Err(self.failed("insert_many", &value.to_document(), err)),
            }
        }
        if docs.is_empty() {
            return Ok(0);
        }
        let count = docs.len();
        let inserted = self
            .store()
            .insert_many(self.name(), docs)
            .await
            .map_err(|err| self.failed("insert_many", &format!("{count} documents"), err))?;
        debug!("{}{} collection: inserted {inserted} documents", self.context, self.name());
        Ok(inserted)
    }

    /// `id` must be a generated key.
    pub async fn get_by_primary_key(&self, id: &str) -> RepoResult<Record<T>> {
        if !is_generated_key(id) {
            return Err(self.failed(
                "get_by_primary_key",
                &id,
                Error::InvalidKey(format!("`{id}` is not a generated key")),
            ));
        }
        self.get_by_custom_key(id).await
    }

    pub async fn get_by_custom_key(&self, id: &str) -> RepoResult<Record<T>> {
        let found = self
            .store()
            .find_one(self.name(), &Filter::by_key(id), None)
            .await
            .map_err(|err| self.failed("get", &id, err))?;
        let Some(doc) = found else {
            return Err(self.failed("get", &id, Error::DoesNotExist));
        };
        self.decode(&doc).map_err(|err| self.failed("get", &id, err))
    }

    /// Absence is `Ok(false)`, not an error.
    pub async fn exists_by_key(&self, id: &str) -> RepoResult<bool> {
        let count = self
            .store()
            .count(self.name(), &Filter::by_key(id))
            .await
            .map_err(|err| self.failed("exists", &id, err))?;
        Ok(count > 0)
    }

    pub async fn get_all(&self, page: Page) -> RepoResult<Vec<Record<T>>> {
        self.get_by_filter(&Filter::All, page).await
    }

    pub async fn get_by_filter(&self, filter: &Filter, page: Page) -> RepoResult<Vec<Record<T>>> {
        let docs = self
            .find(filter, &Sort::default(), page, None)
            .await
            .map_err(|err| self.failed("get_by_filter", filter, err))?;
        Ok(self.decode_all(docs))
    }

    /// Projected documents are returned as-is since excluded fields may be
    /// required by the model.
    pub async fn get_by_filter_projected(
        &self,
        filter: &Filter,
        projection: &Projection,
        page: Page,
    ) -> RepoResult<Vec<Document>> {
        let docs = self
            .find(filter, &Sort::default(), page, Some(projection))
            .await
            .map_err(|err| self.failed("get_by_filter_projected", filter, err))?;
        Ok(docs
            .into_iter()
            .filter_map(|doc| match self.validator.validate_partial(&doc) {
                Ok(cleaned) => Some(cleaned),
                Err(err) => {
                    warn!(
                        "{}{} collection: skipping stored document {:?}: {err}",
                        self.context,
                        self.name(),
                        doc.get(KEY_FIELD)
                    );
                    None
                }
            })
            .collect())
    }

    /// Records keyed by document key, in query order.
    pub async fn get_by_filter_as_map(
        &self,
        filter: &Filter,
        page: Page,
    ) -> RepoResult<IndexMap<String, Record<T>>> {
        Ok(self
            .get_by_filter(filter, page)
            .await?
            .into_iter()
            .map(|record| (record.key.clone(), record))
            .collect())
    }

    pub async fn filter_and_sort(&self, query: &FilterAndSort) -> RepoResult<Vec<Record<T>>> {
        let filter = query.query();
        let docs = self
            .find(&filter, &query.sort, query.page, None)
            .await
            .map_err(|err| self.failed("filter_and_sort", query, err))?;
        Ok(self.decode_all(docs))
    }

    /// Counts without materializing documents.
    pub async fn get_count_by_field(&self, filter: &Filter) -> RepoResult<u64> {
        let count = async {
            filter.validate(self.validator.as_ref())?;
            self.store().count(self.name(), filter).await
        }
        .await
        .map_err(|err| self.failed("count", filter, err))?;
        Ok(count)
    }

    pub async fn delete_by_key(&self, id: &str) -> RepoResult<bool> {
        let deleted = self
            .store()
            .delete_one(self.name(), &Filter::by_key(id))
            .await
            .map_err(|err| self.failed("delete", &id, err))?;
        debug!("{}{} collection: deleted {deleted} for {id}", self.context, self.name());
        Ok(deleted > 0)
    }

    pub async fn delete_many(&self, filter: &Filter) -> RepoResult<bool> {
        let deleted = async {
            filter.validate(self.validator.as_ref())?;
            self.store().delete_many(self.name(), filter).await
        }
        .await
        .map_err(|err| self.failed("delete_many", filter, err))?;
        debug!("{}{} collection: deleted {deleted} for {filter:?}", self.context, self.name());
        Ok(deleted > 0)
    }

    pub async fn update_by_key(&self, id: &str, partial: &Document, upsert: bool) -> RepoResult<bool> {
        self.update(&Filter::by_key(id), partial, upsert, false).await
    }

    pub async fn update_one(&self, filter: &Filter, partial: &Document, upsert: bool) -> RepoResult<bool> {
        self.update(filter, partial, upsert, false).await
    }

    pub async fn update_many(&self, filter: &Filter, partial: &Document, upsert: bool) -> RepoResult<bool> {
        self.update(filter, partial, upsert, true).await
    }

    async fn update(&self, filter: &Filter, partial: &Document, upsert: bool, many: bool) -> RepoResult<bool> {
        let outcome = async {
            filter.validate(self.validator.as_ref())?;
            let update = self.prepare_set(partial)?;
            if many {
                self.store().update_many(self.name(), filter, &update, upsert).await
            } else {
                self.store().update_one(self.name(), filter, &update, upsert).await
            }
        }
        .await
        .map_err(|err| self.failed("update", partial, err))?;
        debug!("{}{} collection: update {outcome:?} for {filter:?}", self.context, self.name());
        Ok(outcome.changed())
    }

    /// Adds numeric deltas to the document under `id`.
    pub async fn increment_one(&self, id: &str, deltas: &Document, upsert: bool) -> RepoResult<bool> {
        let outcome = async {
            let update = self.prepare_increment(deltas)?;
            self.store()
                .update_one(self.name(), &Filter::by_key(id), &update, upsert)
                .await
        }
        .await
        .map_err(|err| self.failed("increment", deltas, err))?;
        debug!("{}{} collection: increment {outcome:?} for {id}", self.context, self.name());
        Ok(outcome.changed())
    }

    /// Creates indexes one after another. Failures are logged and skipped;
    /// the names of the indexes that exist afterwards are returned.
    pub async fn create_indexes(&self, specs: &[IndexSpec]) -> RepoResult<Vec<String>> {
        let mut names = Vec::with_capacity(specs.len());
        for spec in specs {
            let created = async {
                for (path, _) in &spec.keys {
                    FieldPath::new(path.as_str()).validate(self.validator.as_ref())?;
                }
                self.store().create_index(self.name(), spec).await
            }
            .await;
            match created {
                Ok(name) => {
                    debug!("{}{} collection: index {name} ready", self.context, self.name());
                    names.push(name);
                }
                Err(err) => warn!(
                    "{}{} collection: index {} failed: {err}",
                    self.context,
                    self.name(),
                    spec.name()
                ),
            }
        }
        Ok(names)
    }
}
