use std::sync::Arc;

use async_trait::async_trait;
use log::debug;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use super::{DocumentStore, FindOptions, IndexSpec, StoreSession, Update, UpdateOutcome};
use crate::{Document, Error, Filter, Projection};

/// Bounds the number of store operations in flight. Callers beyond the
/// limit wait for a permit; a session keeps one for its whole lifetime.
#[derive(Clone)]
pub struct PooledStore {
    inner: Arc<dyn DocumentStore>,
    permits: Arc<Semaphore>,
    max_size: usize,
}

impl PooledStore {
    pub fn new(inner: Arc<dyn DocumentStore>, max_size: usize) -> Self {
        let max_size = max_size.max(1);
        Self {
            inner,
            permits: Arc::new(Semaphore::new(max_size)),
            max_size,
        }
    }

    /// Permits not currently held.
    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    async fn acquire(&self) -> Result<OwnedSemaphorePermit, Error> {
        self.permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| Error::Store("connection pool closed".to_string()))
    }
}

#[async_trait]
impl DocumentStore for PooledStore {
    async fn insert_one(&self, collection: &str, doc: Document) -> Result<String, Error> {
        let _permit = self.acquire().await?;
        self.inner.insert_one(collection, doc).await
    }

    async fn insert_many(&self, collection: &str, docs: Vec<Document>) -> Result<u64, Error> {
        let _permit = self.acquire().await?;
        self.inner.insert_many(collection, docs).await
    }

    async fn find_one(
        &self,
        collection: &str,
        filter: &Filter,
        projection: Option<&Projection>,
    ) -> Result<Option<Document>, Error> {
        let _permit = self.acquire().await?;
        self.inner.find_one(collection, filter, projection).await
    }

    async fn find(
        &self,
        collection: &str,
        filter: &Filter,
        options: &FindOptions,
    ) -> Result<Vec<Document>, Error> {
        let _permit = self.acquire().await?;
        self.inner.find(collection, filter, options).await
    }

    async fn update_one(
        &self,
        collection: &str,
        filter: &Filter,
        update: &Update,
        upsert: bool,
    ) -> Result<UpdateOutcome, Error> {
        let _permit = self.acquire().await?;
        self.inner.update_one(collection, filter, update, upsert).await
    }

    async fn update_many(
        &self,
        collection: &str,
        filter: &Filter,
        update: &Update,
        upsert: bool,
    ) -> Result<UpdateOutcome, Error> {
        let _permit = self.acquire().await?;
        self.inner.update_many(collection, filter, update, upsert).await
    }

    async fn delete_one(&self, collection: &str, filter: &Filter) -> Result<u64, Error> {
        let _permit = self.acquire().await?;
        self.inner.delete_one(collection, filter).await
    }

    async fn delete_many(&self, collection: &str, filter: &Filter) -> Result<u64, Error> {
        let _permit = self.acquire().await?;
        self.inner.delete_many(collection, filter).await
    }

    async fn count(&self, collection: &str, filter: &Filter) -> Result<u64, Error> {
        let _permit = self.acquire().await?;
        self.inner.count(collection, filter).await
    }

    async fn create_index(&self, collection: &str, index: &IndexSpec) -> Result<String, Error> {
        let _permit = self.acquire().await?;
        self.inner.create_index(collection, index).await
    }

    async fn start_session(&self) -> Result<Box<dyn StoreSession>, Error> {
        let permit = self.acquire().await?;
        let session = self.inner.start_session().await?;
        Ok(Box::new(PooledSession {
            session,
            permit: parking_lot::Mutex::new(Some(permit)),
        }))
    }

    async fn close(&self) -> Result<(), Error> {
        self.permits.close();
        debug!("connection pool closed");
        self.inner.close().await
    }
}

struct PooledSession {
    session: Box<dyn StoreSession>,
    permit: parking_lot::Mutex<Option<OwnedSemaphorePermit>>,
}

#[async_trait]
impl StoreSession for PooledSession {
    fn store(&self) -> Arc<dyn DocumentStore> {
        self.session.store()
    }

    async fn commit(&self) -> Result<(), Error> {
        self.session.commit().await
    }

    async fn abort(&self) -> Result<(), Error> {
        self.session.abort().await
    }

    fn end(&self) {
        self.session.end();
        self.permit.lock().take();
    }
}
