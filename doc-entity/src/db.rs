use std::{any::Any, future::Future, panic::AssertUnwindSafe, sync::Arc};

use futures::FutureExt;
use log::{debug, error, info, warn};

use crate::{
    Backend, Collection, CollectionRepository, Error, RepoResult, StoreConfig,
    store::{DocumentStore, MemoryStore, PooledStore, StoreSession, TikvStore},
};

/// Handle to a document store. Cheap to clone.
#[derive(Clone)]
pub struct DB {
    store: Arc<dyn DocumentStore>,
    in_transaction: bool,
}

/// Ends the session when dropped, whatever path left the transaction.
struct SessionGuard(Box<dyn StoreSession>);

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.0.end();
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "operation panicked".to_string()
    }
}

impl DB {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self {
            store,
            in_transaction: false,
        }
    }

    /// A fresh in-process store.
    pub fn memory() -> Self {
        Self::new(Arc::new(MemoryStore::new()))
    }

    /// Builds the configured backend behind a bounded pool.
    pub async fn connect(config: &StoreConfig) -> Result<Self, Error> {
        config.validate()?;
        let inner: Arc<dyn DocumentStore> = match config.backend {
            Backend::Memory => Arc::new(MemoryStore::new()),
            Backend::Tikv => Arc::new(
                TikvStore::connect(
                    config.pd_endpoints.clone(),
                    config.database.clone(),
                    config.request_timeout(),
                )
                .await?,
            ),
        };
        info!(
            "connected to {:?} store `{}` with pool {}..={}",
            config.backend, config.database, config.min_pool_size, config.max_pool_size
        );
        Ok(Self::new(Arc::new(PooledStore::new(
            inner,
            config.max_pool_size,
        ))))
    }

    pub fn store(&self) -> &Arc<dyn DocumentStore> {
        &self.store
    }

    /// `true` for the handle passed to a [`DB::transaction`] operation.
    pub fn is_transaction(&self) -> bool {
        self.in_transaction
    }

    pub fn collection<T: Collection>(&self) -> CollectionRepository<T> {
        CollectionRepository::new(self)
    }

    pub async fn close(&self) -> Result<(), Error> {
        self.store.close().await?;
        info!("store closed");
        Ok(())
    }

    /// Runs `op` against a transactional handle. `Ok` commits; `Err` or a
    /// panic aborts. The session ends exactly once either way, also when the
    /// returned future is dropped early.
    pub async fn transaction<F, Fut, R>(&self, op: F) -> RepoResult<R>
    where
        F: FnOnce(DB) -> Fut,
        Fut: Future<Output = RepoResult<R>>,
    {
        if self.in_transaction {
            error!("transaction requested inside a transaction");
            return Err(Error::NestedTransaction);
        }
        let session = SessionGuard(self.store.start_session().await?);
        let tx_db = DB {
            store: session.0.store(),
            in_transaction: true,
        };
        match AssertUnwindSafe(op(tx_db)).catch_unwind().await {
            Ok(Ok(value)) => {
                session.0.commit().await.map_err(|err| {
                    error!("transaction commit failed: {err}");
                    err
                })?;
                debug!("transaction committed");
                Ok(value)
            }
            Ok(Err(err)) => {
                if let Err(abort_err) = session.0.abort().await {
                    warn!("transaction abort failed: {abort_err}");
                }
                debug!("transaction aborted: {err}");
                Err(err)
            }
            Err(panic) => {
                if let Err(abort_err) = session.0.abort().await {
                    warn!("transaction abort failed: {abort_err}");
                }
                let message = panic_message(panic.as_ref());
                error!("transaction operation panicked: {message}");
                Err(Error::TransactionAborted(message))
            }
        }
    }
}
