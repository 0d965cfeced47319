use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
};

use async_trait::async_trait;
use indexmap::{IndexMap, IndexSet};
use parking_lot::{Mutex, RwLock};

use super::{
    DocumentStore, FindOptions, IndexSpec, StoreSession, Update, UpdateOutcome, apply_update,
    check_unique, ensure_key, select, upsert_document,
};
use crate::{Document, Error, Filter, Projection};

#[derive(Debug, Clone, Default)]
struct CollectionState {
    docs: IndexMap<String, Document>,
    indexes: IndexMap<String, IndexSpec>,
    /// Bumped on every committed write of a key, deletes included.
    versions: HashMap<String, u64>,
}

impl CollectionState {
    fn version(&self, key: &str) -> u64 {
        self.versions.get(key).copied().unwrap_or(0)
    }

    fn bump(&mut self, key: &str) {
        *self.versions.entry(key.to_string()).or_default() += 1;
    }
}

type State = IndexMap<String, CollectionState>;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum Touch {
    Doc(String, String),
    Index(String, String),
}

#[derive(Default)]
struct Shared {
    state: RwLock<State>,
    sessions_ended: AtomicUsize,
}

struct SessionState {
    view: RwLock<State>,
    touched: Mutex<IndexSet<Touch>>,
    ended: AtomicBool,
}

/// In-process document store. Collections keep insertion order.
///
/// A session works on a snapshot of the whole store and, on commit, writes
/// back the documents and indexes it touched. A touched document that was
/// committed by someone else after the snapshot fails the commit with
/// [`Error::WriteConflict`].
#[derive(Clone, Default)]
pub struct MemoryStore {
    shared: Arc<Shared>,
    session: Option<Arc<SessionState>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of sessions ended so far.
    pub fn sessions_ended(&self) -> usize {
        self.shared.sessions_ended.load(Ordering::SeqCst)
    }

    fn read<R>(&self, op: impl FnOnce(&State) -> R) -> Result<R, Error> {
        match &self.session {
            None => Ok(op(&*self.shared.state.read())),
            Some(session) => {
                if session.ended.load(Ordering::SeqCst) {
                    return Err(Error::SessionEnded);
                }
                Ok(op(&*session.view.read()))
            }
        }
    }

    fn write<R>(
        &self,
        op: impl FnOnce(&mut State, &mut Vec<Touch>) -> Result<R, Error>,
    ) -> Result<R, Error> {
        let mut touched = Vec::new();
        match &self.session {
            None => {
                let mut state = self.shared.state.write();
                let result = op(&mut *state, &mut touched)?;
                for touch in &touched {
                    if let Touch::Doc(collection, key) = touch {
                        state.entry(collection.clone()).or_default().bump(key);
                    }
                }
                Ok(result)
            }
            Some(session) => {
                if session.ended.load(Ordering::SeqCst) {
                    return Err(Error::SessionEnded);
                }
                let result = op(&mut *session.view.write(), &mut touched);
                session.touched.lock().extend(touched);
                result
            }
        }
    }
}

fn matching_keys(coll: &CollectionState, filter: &Filter, limit: Option<usize>) -> Vec<String> {
    coll.docs
        .iter()
        .filter(|(_, doc)| filter.matches(doc))
        .map(|(key, _)| key.clone())
        .take(limit.unwrap_or(usize::MAX))
        .collect()
}

fn insert_into(
    coll: &mut CollectionState,
    collection: &str,
    mut doc: Document,
    touched: &mut Vec<Touch>,
) -> Result<String, Error> {
    let key = ensure_key(&mut doc)?;
    if coll.docs.contains_key(&key) {
        return Err(Error::DuplicateKey(key));
    }
    check_unique(coll.indexes.values(), coll.docs.values(), &doc)?;
    coll.docs.insert(key.clone(), doc);
    touched.push(Touch::Doc(collection.to_string(), key.clone()));
    Ok(key)
}

fn update_in(
    state: &mut State,
    collection: &str,
    filter: &Filter,
    update: &Update,
    upsert: bool,
    limit: Option<usize>,
    touched: &mut Vec<Touch>,
) -> Result<UpdateOutcome, Error> {
    let coll = state.entry(collection.to_string()).or_default();
    let keys = matching_keys(coll, filter, limit);
    let mut outcome = UpdateOutcome {
        matched: keys.len() as u64,
        ..Default::default()
    };
    // nothing is written until every matched document passed
    let mut staged: IndexMap<String, Document> = IndexMap::new();
    for key in keys {
        let Some(current) = coll.docs.get(&key) else {
            continue;
        };
        let mut next = current.clone();
        if !apply_update(&mut next, update)? {
            continue;
        }
        let others = coll
            .docs
            .iter()
            .filter(|(other, _)| **other != key && !staged.contains_key(*other))
            .map(|(_, doc)| doc)
            .chain(staged.values());
        check_unique(coll.indexes.values(), others, &next)?;
        staged.insert(key, next);
    }
    for (key, next) in staged {
        coll.docs.insert(key.clone(), next);
        touched.push(Touch::Doc(collection.to_string(), key));
        outcome.modified += 1;
    }
    if outcome.matched == 0 && upsert {
        let doc = upsert_document(filter, update)?;
        insert_into(coll, collection, doc, touched)?;
        outcome.upserted = 1;
    }
    Ok(outcome)
}

fn delete_in(
    state: &mut State,
    collection: &str,
    filter: &Filter,
    limit: Option<usize>,
    touched: &mut Vec<Touch>,
) -> u64 {
    let Some(coll) = state.get_mut(collection) else {
        return 0;
    };
    let keys = matching_keys(coll, filter, limit);
    for key in &keys {
        coll.docs.shift_remove(key);
        touched.push(Touch::Doc(collection.to_string(), key.clone()));
    }
    keys.len() as u64
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn insert_one(&self, collection: &str, doc: Document) -> Result<String, Error> {
        self.write(|state, touched| {
            let coll = state.entry(collection.to_string()).or_default();
            insert_into(coll, collection, doc, touched)
        })
    }

    async fn insert_many(&self, collection: &str, docs: Vec<Document>) -> Result<u64, Error> {
        self.write(|state, touched| {
            let coll = state.entry(collection.to_string()).or_default();
            let mut prepared: Vec<(String, Document)> = Vec::with_capacity(docs.len());
            for mut doc in docs {
                let key = ensure_key(&mut doc)?;
                if coll.docs.contains_key(&key) || prepared.iter().any(|(other, _)| *other == key) {
                    return Err(Error::DuplicateKey(key));
                }
                check_unique(
                    coll.indexes.values(),
                    coll.docs.values().chain(prepared.iter().map(|(_, doc)| doc)),
                    &doc,
                )?;
                prepared.push((key, doc));
            }
            let count = prepared.len() as u64;
            for (key, doc) in prepared {
                touched.push(Touch::Doc(collection.to_string(), key.clone()));
                coll.docs.insert(key, doc);
            }
            Ok(count)
        })
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
        let found = self.read(|state| match state.get(collection) {
            Some(coll) => select(coll.docs.values(), filter, &options),
            None => Ok(Vec::new()),
        })??;
        Ok(found.into_iter().next())
    }

    async fn find(
        &self,
        collection: &str,
        filter: &Filter,
        options: &FindOptions,
    ) -> Result<Vec<Document>, Error> {
        self.read(|state| match state.get(collection) {
            Some(coll) => select(coll.docs.values(), filter, options),
            None => Ok(Vec::new()),
        })?
    }

    async fn update_one(
        &self,
        collection: &str,
        filter: &Filter,
        update: &Update,
        upsert: bool,
    ) -> Result<UpdateOutcome, Error> {
        self.write(|state, touched| update_in(state, collection, filter, update, upsert, Some(1), touched))
    }

    async fn update_many(
        &self,
        collection: &str,
        filter: &Filter,
        update: &Update,
        upsert: bool,
    ) -> Result<UpdateOutcome, Error> {
        self.write(|state, touched| update_in(state, collection, filter, update, upsert, None, touched))
    }

    async fn delete_one(&self, collection: &str, filter: &Filter) -> Result<u64, Error> {
        self.write(|state, touched| Ok(delete_in(state, collection, filter, Some(1), touched)))
    }

    async fn delete_many(&self, collection: &str, filter: &Filter) -> Result<u64, Error> {
        self.write(|state, touched| Ok(delete_in(state, collection, filter, None, touched)))
    }

    async fn count(&self, collection: &str, filter: &Filter) -> Result<u64, Error> {
        self.read(|state| {
            state
                .get(collection)
                .map(|coll| coll.docs.values().filter(|doc| filter.matches(doc)).count() as u64)
                .unwrap_or(0)
        })
    }

    async fn create_index(&self, collection: &str, index: &IndexSpec) -> Result<String, Error> {
        let name = index.name();
        self.write(|state, touched| {
            let coll = state.entry(collection.to_string()).or_default();
            if let Some(existing) = coll.indexes.get(&name) {
                if existing.keys == index.keys && existing.options.unique == index.options.unique {
                    return Ok(name);
                }
                return Err(Error::Store(format!(
                    "index `{name}` already exists with different options"
                )));
            }
            let docs: Vec<&Document> = coll.docs.values().collect();
            for (i, doc) in docs.iter().enumerate() {
                check_unique(std::iter::once(index), docs[..i].iter().copied(), doc)?;
            }
            coll.indexes.insert(name.clone(), index.clone());
            touched.push(Touch::Index(collection.to_string(), name.clone()));
            Ok(name)
        })
    }

    async fn start_session(&self) -> Result<Box<dyn StoreSession>, Error> {
        if self.session.is_some() {
            return Err(Error::NestedTransaction);
        }
        let view = self.shared.state.read().clone();
        Ok(Box::new(MemorySession {
            store: MemoryStore {
                shared: self.shared.clone(),
                session: Some(Arc::new(SessionState {
                    view: RwLock::new(view),
                    touched: Mutex::new(IndexSet::new()),
                    ended: AtomicBool::new(false),
                })),
            },
        }))
    }
}

/// Fails when a touched key or index moved on since the snapshot was taken.
fn check_conflicts(view: &State, shared: &State, touched: &[Touch]) -> Result<(), Error> {
    for touch in touched {
        match touch {
            Touch::Doc(collection, key) => {
                let seen = view.get(collection).map_or(0, |coll| coll.version(key));
                let current = shared.get(collection).map_or(0, |coll| coll.version(key));
                if seen != current {
                    return Err(Error::WriteConflict(format!(
                        "`{collection}/{key}` was written after the transaction started"
                    )));
                }
            }
            Touch::Index(collection, name) => {
                let mine = view.get(collection).and_then(|coll| coll.indexes.get(name));
                let theirs = shared.get(collection).and_then(|coll| coll.indexes.get(name));
                if let (Some(mine), Some(theirs)) = (mine, theirs) {
                    if mine != theirs {
                        return Err(Error::WriteConflict(format!(
                            "index `{name}` on `{collection}` was created concurrently with other options"
                        )));
                    }
                }
            }
        }
    }
    Ok(())
}

struct MemorySession {
    store: MemoryStore,
}

impl MemorySession {
    fn state(&self) -> Result<&Arc<SessionState>, Error> {
        match &self.store.session {
            Some(session) if !session.ended.load(Ordering::SeqCst) => Ok(session),
            _ => Err(Error::SessionEnded),
        }
    }
}

#[async_trait]
impl StoreSession for MemorySession {
    fn store(&self) -> Arc<dyn DocumentStore> {
        Arc::new(self.store.clone())
    }

    async fn commit(&self) -> Result<(), Error> {
        let session = self.state()?;
        let touched: Vec<Touch> = session.touched.lock().drain(..).collect();
        let view = session.view.read();
        let mut shared = self.store.shared.state.write();
        check_conflicts(&view, &shared, &touched)?;

        let mut staged: State = IndexMap::new();
        for touch in &touched {
            let (Touch::Doc(collection, _) | Touch::Index(collection, _)) = touch;
            if !staged.contains_key(collection) {
                let current = shared.get(collection).cloned().unwrap_or_default();
                staged.insert(collection.clone(), current);
            }
        }
        let mut written = Vec::new();
        for touch in &touched {
            match touch {
                Touch::Doc(collection, key) => {
                    let committed = view.get(collection).and_then(|coll| coll.docs.get(key));
                    let Some(target) = staged.get_mut(collection) else {
                        continue;
                    };
                    match committed {
                        Some(doc) => {
                            target.docs.insert(key.clone(), doc.clone());
                            written.push((collection, key));
                        }
                        None => {
                            target.docs.shift_remove(key);
                        }
                    }
                    target.bump(key);
                }
                Touch::Index(collection, name) => {
                    let index = view.get(collection).and_then(|coll| coll.indexes.get(name));
                    if let (Some(index), Some(target)) = (index, staged.get_mut(collection)) {
                        target.indexes.insert(name.clone(), index.clone());
                    }
                }
            }
        }
        // others may have committed colliding values to untouched keys
        for (collection, key) in written {
            let Some(coll) = staged.get(collection) else {
                continue;
            };
            let Some(doc) = coll.docs.get(key) else {
                continue;
            };
            let others = coll
                .docs
                .iter()
                .filter(|(other, _)| *other != key)
                .map(|(_, doc)| doc);
            check_unique(coll.indexes.values(), others, doc)?;
        }
        shared.extend(staged);
        Ok(())
    }

    async fn abort(&self) -> Result<(), Error> {
        let session = self.state()?;
        session.touched.lock().clear();
        Ok(())
    }

    fn end(&self) {
        if let Some(session) = &self.store.session {
            if !session.ended.swap(true, Ordering::SeqCst) {
                self.store.shared.sessions_ended.fetch_add(1, Ordering::SeqCst);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Value, doc};

    #[tokio::test]
    async fn keeps_insertion_order() {
        let store = MemoryStore::new();
        for key in ["c", "a", "b"] {
            store.insert_one("t", doc! { "_id" => key }).await.unwrap();
        }
        let docs = store.find("t", &Filter::All, &FindOptions::default()).await.unwrap();
        let keys: Vec<_> = docs.iter().filter_map(|doc| doc.get("_id").and_then(Value::as_str)).collect();
        assert_eq!(keys, ["c", "a", "b"]);
    }

    #[tokio::test]
    async fn insert_many_is_all_or_nothing() {
        let store = MemoryStore::new();
        store.insert_one("t", doc! { "_id" => "b" }).await.unwrap();
        let result = store
            .insert_many("t", vec![doc! { "_id" => "a" }, doc! { "_id" => "b" }])
            .await;
        assert!(matches!(result, Err(Error::DuplicateKey(_))));
        assert_eq!(store.count("t", &Filter::All).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn session_writes_land_on_commit() {
        let store = MemoryStore::new();
        let session = store.start_session().await.unwrap();
        session.store().insert_one("t", doc! { "_id" => "a" }).await.unwrap();
        assert_eq!(store.count("t", &Filter::All).await.unwrap(), 0);
        session.commit().await.unwrap();
        assert_eq!(store.count("t", &Filter::All).await.unwrap(), 1);
        session.end();
        session.end();
        assert_eq!(store.sessions_ended(), 1);
    }

    #[tokio::test]
    async fn aborted_session_leaves_no_trace() {
        let store = MemoryStore::new();
        store.insert_one("t", doc! { "_id" => "a", "n" => 1 }).await.unwrap();
        let session = store.start_session().await.unwrap();
        let scoped = session.store();
        scoped.delete_one("t", &Filter::by_key("a")).await.unwrap();
        session.abort().await.unwrap();
        session.end();
        assert_eq!(store.count("t", &Filter::All).await.unwrap(), 1);
        assert!(matches!(
            scoped.count("t", &Filter::All).await,
            Err(Error::SessionEnded)
        ));
        assert!(matches!(session.commit().await, Err(Error::SessionEnded)));
    }

    #[tokio::test]
    async fn sessions_do_not_nest() {
        let store = MemoryStore::new();
        let session = store.start_session().await.unwrap();
        assert!(matches!(
            session.store().start_session().await,
            Err(Error::NestedTransaction)
        ));
    }

    #[tokio::test]
    async fn unique_index_rejects_duplicates() {
        let store = MemoryStore::new();
        let name = store
            .create_index("t", &IndexSpec::ascending("uid").unique())
            .await
            .unwrap();
        assert_eq!(name, "uid_1");
        store.insert_one("t", doc! { "uid" => "u1" }).await.unwrap();
        assert!(matches!(
            store.insert_one("t", doc! { "uid" => "u1" }).await,
            Err(Error::DuplicateKey(_))
        ));
        assert_eq!(
            store.create_index("t", &IndexSpec::ascending("uid").unique()).await.unwrap(),
            "uid_1"
        );
    }

    fn inc(n: i64) -> Update {
        Update {
            inc: doc! { "n" => n },
            ..Default::default()
        }
    }

    async fn n_of(store: &MemoryStore, key: &str) -> Option<Value> {
        let doc = store.find_one("t", &Filter::by_key(key), None).await.unwrap()?;
        doc.get("n").cloned()
    }

    #[tokio::test]
    async fn commit_fails_when_a_touched_document_moved_on() {
        let store = MemoryStore::new();
        store.insert_one("t", doc! { "_id" => "g", "n" => 0 }).await.unwrap();
        let session = store.start_session().await.unwrap();
        store.update_one("t", &Filter::by_key("g"), &inc(5), false).await.unwrap();
        session
            .store()
            .update_one("t", &Filter::by_key("g"), &inc(1), false)
            .await
            .unwrap();
        assert!(matches!(session.commit().await, Err(Error::WriteConflict(_))));
        assert_eq!(n_of(&store, "g").await, Some(Value::Int(5)));
    }

    #[tokio::test]
    async fn overlapping_sessions_on_one_document() {
        let store = MemoryStore::new();
        store.insert_one("t", doc! { "_id" => "g", "n" => 0 }).await.unwrap();
        let first = store.start_session().await.unwrap();
        let second = store.start_session().await.unwrap();
        for session in [&first, &second] {
            session
                .store()
                .update_one("t", &Filter::by_key("g"), &inc(1), false)
                .await
                .unwrap();
        }
        first.commit().await.unwrap();
        assert!(matches!(second.commit().await, Err(Error::WriteConflict(_))));
        assert_eq!(n_of(&store, "g").await, Some(Value::Int(1)));
    }

    #[tokio::test]
    async fn writes_to_other_documents_do_not_conflict() {
        let store = MemoryStore::new();
        let session = store.start_session().await.unwrap();
        session.store().insert_one("t", doc! { "_id" => "a", "n" => 1 }).await.unwrap();
        store.insert_one("t", doc! { "_id" => "b", "n" => 2 }).await.unwrap();
        session.commit().await.unwrap();
        assert_eq!(store.count("t", &Filter::All).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn commit_rechecks_unique_indexes() {
        let store = MemoryStore::new();
        store
            .create_index("t", &IndexSpec::ascending("uid").unique())
            .await
            .unwrap();
        let session = store.start_session().await.unwrap();
        session.store().insert_one("t", doc! { "_id" => "a", "uid" => "u1" }).await.unwrap();
        store.insert_one("t", doc! { "_id" => "b", "uid" => "u1" }).await.unwrap();
        assert!(matches!(session.commit().await, Err(Error::DuplicateKey(_))));
        assert_eq!(store.count("t", &Filter::All).await.unwrap(), 1);
    }

    async fn clashing_update_many(store: &dyn DocumentStore) -> Result<UpdateOutcome, Error> {
        let update = Update {
            set: doc! { "uid" => 5 },
            ..Default::default()
        };
        store.update_many("t", &Filter::eq("g", "x"), &update, false).await
    }

    async fn seed_clash(store: &MemoryStore) {
        store
            .create_index("t", &IndexSpec::ascending("uid").unique())
            .await
            .unwrap();
        store.insert_one("t", doc! { "_id" => "a", "uid" => 1, "g" => "x" }).await.unwrap();
        store.insert_one("t", doc! { "_id" => "b", "uid" => 2, "g" => "x" }).await.unwrap();
    }

    #[tokio::test]
    async fn failed_update_many_changes_nothing() {
        let store = MemoryStore::new();
        seed_clash(&store).await;
        assert!(matches!(clashing_update_many(&store).await, Err(Error::DuplicateKey(_))));
        let uids: Vec<_> = store
            .find("t", &Filter::All, &FindOptions::default())
            .await
            .unwrap()
            .iter()
            .filter_map(|doc| doc.get("uid").cloned())
            .collect();
        assert_eq!(uids, [Value::Int(1), Value::Int(2)]);
    }

    #[tokio::test]
    async fn failed_update_many_inside_a_session_changes_nothing() {
        let store = MemoryStore::new();
        seed_clash(&store).await;
        let session = store.start_session().await.unwrap();
        let scoped = session.store();
        assert!(matches!(
            clashing_update_many(scoped.as_ref()).await,
            Err(Error::DuplicateKey(_))
        ));
        let seen = scoped.find_one("t", &Filter::by_key("a"), None).await.unwrap().unwrap();
        assert_eq!(seen.get("uid"), Some(&Value::Int(1)));
        session.commit().await.unwrap();
        let stored = store.find_one("t", &Filter::by_key("a"), None).await.unwrap().unwrap();
        assert_eq!(stored.get("uid"), Some(&Value::Int(1)));
    }

    #[tokio::test]
    async fn upsert_reports_insertion() {
        let store = MemoryStore::new();
        let update = Update {
            set: doc! { "n" => 1 },
            ..Default::default()
        };
        let outcome = store.update_one("t", &Filter::by_key("k"), &update, true).await.unwrap();
        assert_eq!(outcome, UpdateOutcome { matched: 0, modified: 0, upserted: 1 });
        let outcome = store.update_one("t", &Filter::by_key("k"), &update, true).await.unwrap();
        assert_eq!(outcome, UpdateOutcome { matched: 1, modified: 0, upserted: 0 });
        assert!(outcome.changed());
    }
}
