use std::{fmt, future::Future};

use log::{debug, error};

use crate::{
    Collection, CollectionRepository, DB, Document, Error, Filter, Projection, Record, RepoResult,
};

/// Operations on the document stored under one key.
pub struct DocumentHandle<T> {
    repo: CollectionRepository<T>,
    key: String,
    filter: Filter,
}

impl<T: Collection> DocumentHandle<T> {
    pub(crate) fn new(repo: CollectionRepository<T>, key: String) -> Self {
        let filter = Filter::by_key(key.as_str());
        Self { repo, key, filter }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    fn failed(&self, op: &str, input: &dyn fmt::Debug, err: Error) -> Error {
        error!(
            "{}{} doc ({}): {op} failed for {input:?}: {err}",
            self.repo.context,
            self.key,
            self.repo.name()
        );
        err
    }

    /// The stored document, partially validated, optionally projected.
    pub async fn get(&self, projection: Option<&Projection>) -> RepoResult<Document> {
        let found = async {
            if let Some(projection) = projection {
                projection.validate(self.repo.validator.as_ref())?;
            }
            self.repo
                .store()
                .find_one(self.repo.name(), &self.filter, projection)
                .await
        }
        .await
        .map_err(|err| self.failed("get", &projection, err))?;
        let Some(doc) = found else {
            return Err(self.failed("get", &projection, Error::DoesNotExist));
        };
        self.repo
            .validator
            .validate_partial(&doc)
            .map_err(|errors| self.failed("get", &doc, Error::Validation(errors)))
    }

    /// The stored document decoded into its model.
    pub async fn fetch(&self) -> RepoResult<Record<T>> {
        let found = self
            .repo
            .store()
            .find_one(self.repo.name(), &self.filter, None)
            .await
            .map_err(|err| self.failed("fetch", &self.key, err))?;
        let Some(doc) = found else {
            return Err(self.failed("fetch", &self.key, Error::DoesNotExist));
        };
        self.repo
            .decode(&doc)
            .map_err(|err| self.failed("fetch", &doc, err))
    }

    /// Inserts `value` under this key. An existing document is a
    /// [`Error::DuplicateKey`].
    pub async fn create(&self, value: &T) -> RepoResult<Record<T>> {
        let input = value.to_document();
        let doc = self
            .repo
            .prepare_insert(Some(&self.key), value)
            .map_err(|err| self.failed("create", &input, err))?;
        self.repo
            .store()
            .insert_one(self.repo.name(), doc.clone())
            .await
            .map_err(|err| self.failed("create", &input, err))?;
        debug!("{}{} doc: created", self.repo.context, self.key);
        self.repo
            .decode(&doc)
            .map_err(|err| self.failed("create", &input, err))
    }

    /// Field-level set. On insert the creation timestamp comes from
    /// `partial` when it carries one.
    pub async fn update(&self, partial: &Document, upsert: bool) -> RepoResult<bool> {
        let outcome = async {
            let update = self.repo.prepare_set(partial)?;
            self.repo
                .store()
                .update_one(self.repo.name(), &self.filter, &update, upsert)
                .await
        }
        .await
        .map_err(|err| self.failed("update", partial, err))?;
        debug!("{}{} doc: update {outcome:?}", self.repo.context, self.key);
        Ok(outcome.changed())
    }

    /// Adds numeric deltas, creating the document when absent.
    pub async fn increment(&self, deltas: &Document) -> RepoResult<bool> {
        let outcome = async {
            let update = self.repo.prepare_increment(deltas)?;
            self.repo
                .store()
                .update_one(self.repo.name(), &self.filter, &update, true)
                .await
        }
        .await
        .map_err(|err| self.failed("increment", deltas, err))?;
        debug!("{}{} doc: increment {outcome:?}", self.repo.context, self.key);
        Ok(outcome.changed())
    }

    pub async fn delete(&self) -> RepoResult<bool> {
        let deleted = self
            .repo
            .store()
            .delete_one(self.repo.name(), &self.filter)
            .await
            .map_err(|err| self.failed("delete", &self.key, err))?;
        debug!("{}{} doc: deleted {deleted}", self.repo.context, self.key);
        Ok(deleted > 0)
    }

    /// Runs `op` in a transaction on this handle's database.
    pub async fn transaction<F, Fut, R>(&self, op: F) -> RepoResult<R>
    where
        F: FnOnce(DB) -> Fut,
        Fut: Future<Output = RepoResult<R>>,
    {
        self.repo.db.transaction(op).await
    }
}
