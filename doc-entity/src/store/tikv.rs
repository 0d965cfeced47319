use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use futures::lock::{Mutex, MutexGuard};
use log::{debug, warn};
use tikv_client::{CheckLevel, Config, Key, Transaction, TransactionClient, TransactionOptions};

use super::{
    DocumentStore, FindOptions, IndexSpec, StoreSession, Update, UpdateOutcome, apply_update,
    check_unique, codec, document_key, ensure_key, index_values, select, upsert_document,
};
use crate::{
    Document, Error, Filter, Projection,
    utils::{
        collection_prefix, document_path, index_path, index_prefix, key_after, next_key,
        unique_prefix,
    },
};

const PAGE_SIZE: u32 = 128;

/// Documents stored in TiKV, one key per document.
///
/// Every value held by a unique index also gets a guard key pointing at its
/// document, so two transactions claiming the same value conflict on commit.
#[derive(Clone)]
pub struct TikvStore {
    client: TransactionClient,
    database: Arc<str>,
    session: Option<Arc<TikvSessionState>>,
}

struct TikvSessionState {
    txn: Mutex<Option<Transaction>>,
    ended: AtomicBool,
}

enum TxnScope<'a> {
    Owned(Transaction),
    Session(MutexGuard<'a, Option<Transaction>>),
}

impl TxnScope<'_> {
    fn txn(&mut self) -> Result<&mut Transaction, Error> {
        match self {
            TxnScope::Owned(txn) => Ok(txn),
            TxnScope::Session(guard) => guard.as_mut().ok_or(Error::SessionEnded),
        }
    }

    /// Commits or rolls back an owned transaction. Session transactions are
    /// resolved by the session itself.
    async fn finish<R>(self, result: Result<R, Error>, write: bool) -> Result<R, Error> {
        let TxnScope::Owned(mut txn) = self else {
            return result;
        };
        match result {
            Ok(value) if write => {
                txn.commit().await.map_err(Error::TikvError)?;
                Ok(value)
            }
            result => {
                if let Err(err) = txn.rollback().await {
                    warn!("rollback failed: {err}");
                }
                result
            }
        }
    }
}

fn transaction_options() -> TransactionOptions {
    TransactionOptions::new_optimistic().drop_check(CheckLevel::Warn)
}

impl TikvStore {
    pub async fn connect(
        pd_endpoints: Vec<String>,
        database: impl Into<String>,
        request_timeout: Duration,
    ) -> Result<Self, Error> {
        let client = TransactionClient::new_with_config(
            pd_endpoints,
            Config::default().with_timeout(request_timeout),
        )
        .await
        .map_err(Error::TikvError)?;
        let database: String = database.into();
        Ok(Self {
            client,
            database: database.into(),
            session: None,
        })
    }

    /// Deletes every document and index of this database.
    pub async fn drop_all(&self) -> Result<(), Error> {
        let mut txn = self
            .client
            .begin_with_options(transaction_options())
            .await
            .map_err(Error::TikvError)?;
        for prefix in [
            format!("document/{}/", self.database),
            format!("index/{}/", self.database),
            format!("unique/{}/", self.database),
        ] {
            for key in scan_keys(&mut txn, prefix).await? {
                txn.delete(key).await.map_err(Error::TikvError)?;
            }
        }
        txn.commit().await.map_err(Error::TikvError)?;
        Ok(())
    }

    async fn scope(&self) -> Result<TxnScope<'_>, Error> {
        match &self.session {
            None => Ok(TxnScope::Owned(
                self.client
                    .begin_with_options(transaction_options())
                    .await
                    .map_err(Error::TikvError)?,
            )),
            Some(session) => {
                if session.ended.load(Ordering::SeqCst) {
                    return Err(Error::SessionEnded);
                }
                Ok(TxnScope::Session(session.txn.lock().await))
            }
        }
    }

    async fn load_documents(&self, txn: &mut Transaction, collection: &str) -> Result<Vec<Document>, Error> {
        let mut docs = Vec::new();
        for (_, data) in scan(txn, collection_prefix(&self.database, collection)).await? {
            docs.push(codec::decode_document(&data)?);
        }
        Ok(docs)
    }

    /// The documents `filter` can match: one point read when it pins a key,
    /// the whole collection otherwise.
    async fn candidates(&self, txn: &mut Transaction, collection: &str, filter: &Filter) -> Result<Vec<Document>, Error> {
        let Some(key) = filter.key_lookup() else {
            return self.load_documents(txn, collection).await;
        };
        match txn
            .get(document_path(&self.database, collection, key))
            .await
            .map_err(Error::TikvError)?
        {
            Some(data) => Ok(vec![codec::decode_document(&data)?]),
            None => Ok(Vec::new()),
        }
    }

    async fn load_indexes(&self, txn: &mut Transaction, collection: &str) -> Result<Vec<IndexSpec>, Error> {
        let mut indexes = Vec::new();
        for (_, data) in scan(txn, index_prefix(&self.database, collection)).await? {
            indexes.push(codec::decode_index(&data)?);
        }
        Ok(indexes)
    }

    fn guard_key(&self, collection: &str, index: &IndexSpec, doc: &Document) -> Key {
        let mut key = unique_prefix(&self.database, collection, &index.name()).into_bytes();
        key.extend(codec::encode_values(&index_values(index, doc)));
        Key::from(key)
    }

    /// Stores `next` under `key` and moves its unique guards over from
    /// `previous`.
    async fn write_document(
        &self,
        txn: &mut Transaction,
        collection: &str,
        indexes: &[IndexSpec],
        key: &str,
        previous: Option<&Document>,
        next: &Document,
    ) -> Result<(), Error> {
        for index in indexes.iter().filter(|index| index.options.unique) {
            let guard = self.guard_key(collection, index, next);
            if let Some(previous) = previous {
                let stale = self.guard_key(collection, index, previous);
                if stale != guard {
                    txn.delete(stale).await.map_err(Error::TikvError)?;
                }
            }
            txn.put(guard, key.to_string()).await.map_err(Error::TikvError)?;
        }
        txn.put(
            document_path(&self.database, collection, key),
            codec::encode_document(next),
        )
        .await
        .map_err(Error::TikvError)
    }

    async fn insert_in(&self, txn: &mut Transaction, collection: &str, docs: Vec<Document>) -> Result<Vec<String>, Error> {
        let indexes = self.load_indexes(txn, collection).await?;
        let existing = if indexes.iter().any(|index| index.options.unique) {
            self.load_documents(txn, collection).await?
        } else {
            Vec::new()
        };
        let mut prepared: Vec<(String, Document)> = Vec::with_capacity(docs.len());
        for mut doc in docs {
            let key = ensure_key(&mut doc)?;
            let taken = txn
                .key_exists(document_path(&self.database, collection, &key))
                .await
                .map_err(Error::TikvError)?;
            if taken || prepared.iter().any(|(other, _)| *other == key) {
                return Err(Error::DuplicateKey(key));
            }
            let others = existing.iter().chain(prepared.iter().map(|(_, doc)| doc));
            check_unique(indexes.iter(), others, &doc)?;
            prepared.push((key, doc));
        }
        let mut keys = Vec::with_capacity(prepared.len());
        for (key, doc) in prepared {
            self.write_document(txn, collection, &indexes, &key, None, &doc).await?;
            keys.push(key);
        }
        Ok(keys)
    }

    async fn update_in(
        &self,
        txn: &mut Transaction,
        collection: &str,
        filter: &Filter,
        update: &Update,
        upsert: bool,
        limit: Option<usize>,
    ) -> Result<UpdateOutcome, Error> {
        let indexes = self.load_indexes(txn, collection).await?;
        let targets: Vec<Document> = self
            .candidates(txn, collection, filter)
            .await?
            .into_iter()
            .filter(|doc| filter.matches(doc))
            .take(limit.unwrap_or(usize::MAX))
            .collect();
        let mut outcome = UpdateOutcome {
            matched: targets.len() as u64,
            ..Default::default()
        };
        let others: Vec<Document> = if indexes.iter().any(|index| index.options.unique) {
            let keys = targets.iter().map(document_key).collect::<Result<Vec<_>, _>>()?;
            self.load_documents(txn, collection)
                .await?
                .into_iter()
                .filter(|doc| document_key(doc).map_or(true, |key| !keys.contains(&key)))
                .collect()
        } else {
            Vec::new()
        };

        // every target is checked before anything is written
        let mut nexts: Vec<Option<Document>> = Vec::with_capacity(targets.len());
        for doc in &targets {
            let mut next = doc.clone();
            nexts.push(apply_update(&mut next, update)?.then_some(next));
        }
        for (i, next) in nexts.iter().enumerate() {
            let Some(next) = next else {
                continue;
            };
            let siblings = targets
                .iter()
                .zip(&nexts)
                .enumerate()
                .filter(|(j, _)| *j != i)
                .map(|(_, (doc, next))| next.as_ref().unwrap_or(doc));
            check_unique(indexes.iter(), others.iter().chain(siblings), next)?;
        }
        for (doc, next) in targets.iter().zip(&nexts) {
            let Some(next) = next else {
                continue;
            };
            let key = document_key(next)?;
            self.write_document(txn, collection, &indexes, &key, Some(doc), next)
                .await?;
            outcome.modified += 1;
        }

        if outcome.matched == 0 && upsert {
            let doc = upsert_document(filter, update)?;
            self.insert_in(txn, collection, vec![doc]).await?;
            outcome.upserted = 1;
        }
        Ok(outcome)
    }

    async fn delete_in(
        &self,
        txn: &mut Transaction,
        collection: &str,
        filter: &Filter,
        limit: Option<usize>,
    ) -> Result<u64, Error> {
        let indexes = self.load_indexes(txn, collection).await?;
        let docs = self.candidates(txn, collection, filter).await?;
        let mut deleted = 0;
        for doc in docs
            .iter()
            .filter(|doc| filter.matches(doc))
            .take(limit.unwrap_or(usize::MAX))
        {
            let key = document_key(doc)?;
            for index in indexes.iter().filter(|index| index.options.unique) {
                txn.delete(self.guard_key(collection, index, doc))
                    .await
                    .map_err(Error::TikvError)?;
            }
            txn.delete(document_path(&self.database, collection, &key))
                .await
                .map_err(Error::TikvError)?;
            deleted += 1;
        }
        Ok(deleted)
    }

    async fn create_index_in(&self, txn: &mut Transaction, collection: &str, index: &IndexSpec) -> Result<String, Error> {
        let name = index.name();
        let path = index_path(&self.database, collection, &name);
        if let Some(data) = txn.get(path.clone()).await.map_err(Error::TikvError)? {
            let existing = codec::decode_index(&data)?;
            if existing.keys == index.keys && existing.options.unique == index.options.unique {
                return Ok(name);
            }
            return Err(Error::Store(format!(
                "index `{name}` already exists with different options"
            )));
        }
        if index.options.unique {
            let docs = self.load_documents(txn, collection).await?;
            for (i, doc) in docs.iter().enumerate() {
                check_unique(std::iter::once(index), docs[..i].iter(), doc)?;
            }
            for doc in &docs {
                txn.put(self.guard_key(collection, index, doc), document_key(doc)?)
                    .await
                    .map_err(Error::TikvError)?;
            }
        }
        txn.put(path, codec::encode_index(index))
            .await
            .map_err(Error::TikvError)?;
        debug!("created index {name} on {}/{collection}", self.database);
        Ok(name)
    }
}

/// Every pair under `prefix`, fetched in pages.
async fn scan(txn: &mut Transaction, prefix: String) -> Result<Vec<(Key, Vec<u8>)>, Error> {
    let mut start_key: Key = prefix.into();
    let end_key = next_key(&start_key);
    let mut pairs = Vec::new();
    loop {
        let kvs: Vec<_> = txn
            .scan(start_key.clone()..end_key.clone(), PAGE_SIZE)
            .await
            .map_err(Error::TikvError)?
            .collect();
        let full_page = kvs.len() == PAGE_SIZE as usize;
        for kv in kvs {
            pairs.push((kv.key().clone(), kv.value().clone()));
        }
        match pairs.last() {
            Some((last, _)) if full_page => start_key = key_after(last),
            _ => break,
        }
    }
    Ok(pairs)
}

async fn scan_keys(txn: &mut Transaction, prefix: String) -> Result<Vec<Key>, Error> {
    let mut start_key: Key = prefix.into();
    let end_key = next_key(&start_key);
    let mut keys = Vec::new();
    loop {
        let page: Vec<Key> = txn
            .scan_keys(start_key.clone()..end_key.clone(), PAGE_SIZE)
            .await
            .map_err(Error::TikvError)?
            .collect();
        let full_page = page.len() == PAGE_SIZE as usize;
        keys.extend(page);
        match keys.last() {
            Some(last) if full_page => start_key = key_after(last),
            _ => break,
        }
    }
    Ok(keys)
}

#[async_trait]
impl DocumentStore for TikvStore {
    async fn insert_one(&self, collection: &str, doc: Document) -> Result<String, Error> {
        let mut scope = self.scope().await?;
        let result = match scope.txn() {
            Ok(txn) => self.insert_in(txn, collection, vec![doc]).await,
            Err(err) => Err(err),
        };
        let keys = scope.finish(result, true).await?;
        keys.into_iter()
            .next()
            .ok_or_else(|| Error::Store("insert produced no key".to_string()))
    }

    async fn insert_many(&self, collection: &str, docs: Vec<Document>) -> Result<u64, Error> {
        let mut scope = self.scope().await?;
        let result = match scope.txn() {
            Ok(txn) => self.insert_in(txn, collection, docs).await,
            Err(err) => Err(err),
        };
        Ok(scope.finish(result, true).await?.len() as u64)
    }

    async fn find_one(
        &self,
        collection: &str,
        filter: &Filter,
        projection: Option<&Projection>,
    ) -> Result<Option<Document>, Error> {
        let options = FindOptions {
            limit: Some(1),
            projection: projection.cloned(),
            ..Default::default()
        };
        Ok(self.find(collection, filter, &options).await?.into_iter().next())
    }

    async fn find(
        &self,
        collection: &str,
        filter: &Filter,
        options: &FindOptions,
    ) -> Result<Vec<Document>, Error> {
        let mut scope = self.scope().await?;
        let result = match scope.txn() {
            Ok(txn) => match self.candidates(txn, collection, filter).await {
                Ok(docs) => select(docs.iter(), filter, options),
                Err(err) => Err(err),
            },
            Err(err) => Err(err),
        };
        scope.finish(result, false).await
    }

    async fn update_one(
        &self,
        collection: &str,
        filter: &Filter,
        update: &Update,
        upsert: bool,
    ) -> Result<UpdateOutcome, Error> {
        let mut scope = self.scope().await?;
        let result = match scope.txn() {
            Ok(txn) => self.update_in(txn, collection, filter, update, upsert, Some(1)).await,
            Err(err) => Err(err),
        };
        scope.finish(result, true).await
    }

    async fn update_many(
        &self,
        collection: &str,
        filter: &Filter,
        update: &Update,
        upsert: bool,
    ) -> Result<UpdateOutcome, Error> {
        let mut scope = self.scope().await?;
        let result = match scope.txn() {
            Ok(txn) => self.update_in(txn, collection, filter, update, upsert, None).await,
            Err(err) => Err(err),
        };
        scope.finish(result, true).await
    }

    async fn delete_one(&self, collection: &str, filter: &Filter) -> Result<u64, Error> {
        let mut scope = self.scope().await?;
        let result = match scope.txn() {
            Ok(txn) => self.delete_in(txn, collection, filter, Some(1)).await,
            Err(err) => Err(err),
        };
        scope.finish(result, true).await
    }

    async fn delete_many(&self, collection: &str, filter: &Filter) -> Result<u64, Error> {
        let mut scope = self.scope().await?;
        let result = match scope.txn() {
            Ok(txn) => self.delete_in(txn, collection, filter, None).await,
            Err(err) => Err(err),
        };
        scope.finish(result, true).await
    }

    async fn count(&self, collection: &str, filter: &Filter) -> Result<u64, Error> {
        let mut scope = self.scope().await?;
        let result = match scope.txn() {
            Ok(txn) => self
                .candidates(txn, collection, filter)
                .await
                .map(|docs| docs.iter().filter(|doc| filter.matches(doc)).count() as u64),
            Err(err) => Err(err),
        };
        scope.finish(result, false).await
    }

    async fn create_index(&self, collection: &str, index: &IndexSpec) -> Result<String, Error> {
        let mut scope = self.scope().await?;
        let result = match scope.txn() {
            Ok(txn) => self.create_index_in(txn, collection, index).await,
            Err(err) => Err(err),
        };
        scope.finish(result, true).await
    }

    async fn start_session(&self) -> Result<Box<dyn StoreSession>, Error> {
        if self.session.is_some() {
            return Err(Error::NestedTransaction);
        }
        let txn = self
            .client
            .begin_with_options(transaction_options())
            .await
            .map_err(Error::TikvError)?;
        Ok(Box::new(TikvSession {
            store: TikvStore {
                client: self.client.clone(),
                database: self.database.clone(),
                session: Some(Arc::new(TikvSessionState {
                    txn: Mutex::new(Some(txn)),
                    ended: AtomicBool::new(false),
                })),
            },
        }))
    }
}

struct TikvSession {
    store: TikvStore,
}

impl TikvSession {
    fn state(&self) -> Result<&Arc<TikvSessionState>, Error> {
        match &self.store.session {
            Some(state) if !state.ended.load(Ordering::SeqCst) => Ok(state),
            _ => Err(Error::SessionEnded),
        }
    }
}

#[async_trait]
impl StoreSession for TikvSession {
    fn store(&self) -> Arc<dyn DocumentStore> {
        Arc::new(self.store.clone())
    }

    async fn commit(&self) -> Result<(), Error> {
        let mut guard = self.state()?.txn.lock().await;
        let txn = guard.as_mut().ok_or(Error::SessionEnded)?;
        txn.commit().await.map_err(Error::TikvError)?;
        Ok(())
    }

    async fn abort(&self) -> Result<(), Error> {
        let mut guard = self.state()?.txn.lock().await;
        let txn = guard.as_mut().ok_or(Error::SessionEnded)?;
        txn.rollback().await.map_err(Error::TikvError)
    }

    fn end(&self) {
        let Some(state) = &self.store.session else {
            return;
        };
        if state.ended.swap(true, Ordering::SeqCst) {
            return;
        }
        // an operation still holding the lock drops the transaction with it
        if let Some(mut guard) = state.txn.try_lock() {
            guard.take();
        }
    }
}
