//! In-memory collaborators with failure injection and write journals.
//!
//! Used by the test suite and by anything that needs an engine without a real
//! backend.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use futures::StreamExt;
use futures::future::BoxFuture;
use futures::stream::BoxStream;
use tokio::sync::mpsc;

use crate::error::{FallbackError, RemoteError};

use super::fallback::FallbackStore;
use super::remote::{
    ChangeKind, CollectionSnapshot, DocumentChange, DocumentStream, Fields, RawDocument, RemoteStore,
    SnapshotStream, parent_collection,
};

/// A write the store accepted.
#[derive(Debug, Clone, PartialEq)]
pub enum WriteRecord {
    Set { path: String, fields: Fields, merge: bool },
    Add { path: String, fields: Fields },
    Delete { path: String },
}

impl WriteRecord {
    pub fn path(&self) -> &str {
        match self {
            Self::Set { path, .. } | Self::Add { path, .. } | Self::Delete { path } => path,
        }
    }
}

type SnapshotSender = mpsc::UnboundedSender<Result<CollectionSnapshot, RemoteError>>;
type DocumentSender = mpsc::UnboundedSender<Result<Option<RawDocument>, RemoteError>>;

#[derive(Default)]
struct Inner {
    docs: BTreeMap<String, Fields>,
    next_id: u64,
    writes: Vec<WriteRecord>,
    /// Paths of every write attempt, failed or not.
    attempts: Vec<String>,
    write_failure: Option<RemoteError>,
    next_write_failures: VecDeque<RemoteError>,
    read_failure: Option<RemoteError>,
    subscribe_failure: Option<RemoteError>,
    latency: Duration,
    ack_latency: Duration,
    collection_subs: Vec<(String, SnapshotSender)>,
    document_subs: Vec<(String, DocumentSender)>,
}

impl Inner {
    fn take_write_failure(&mut self) -> Option<RemoteError> {
        self.next_write_failures
            .pop_front()
            .or_else(|| self.write_failure.clone())
    }

    fn collection_snapshot(&self, collection: &str, changes: Vec<DocumentChange>) -> CollectionSnapshot {
        let documents = self
            .docs
            .iter()
            .filter(|(path, _)| parent_collection(path) == Some(collection))
            .map(|(path, fields)| RawDocument::new(doc_id(path), fields.clone()))
            .collect();
        CollectionSnapshot { documents, changes }
    }

    fn document(&self, path: &str) -> Option<RawDocument> {
        self.docs
            .get(path)
            .map(|fields| RawDocument::new(doc_id(path), fields.clone()))
    }

    fn notify(&mut self, path: &str, kind: ChangeKind) {
        if let Some(collection) = parent_collection(path) {
            let change = DocumentChange {
                kind,
                id: doc_id(path).to_string(),
            };
            let snapshot = self.collection_snapshot(collection, vec![change]);
            self.collection_subs
                .retain(|(c, tx)| c != collection || tx.send(Ok(snapshot.clone())).is_ok());
        }
        let doc = self.document(path);
        self.document_subs
            .retain(|(p, tx)| p != path || tx.send(Ok(doc.clone())).is_ok());
    }

    fn set(&mut self, path: &str, fields: Fields, merge: bool) {
        let kind = match self.docs.get_mut(path) {
            Some(existing) if merge => {
                existing.extend(fields);
                ChangeKind::Modified
            }
            Some(existing) => {
                *existing = fields;
                ChangeKind::Modified
            }
            None => {
                self.docs.insert(path.to_string(), fields);
                ChangeKind::Added
            }
        };
        self.notify(path, kind);
    }
}

fn doc_id(path: &str) -> &str {
    path.rsplit_once('/').map(|(_, id)| id).unwrap_or(path)
}

fn receiver_stream<T: Send + 'static>(rx: mpsc::UnboundedReceiver<T>) -> BoxStream<'static, T> {
    futures::stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|item| (item, rx)) }).boxed()
}

/// Remote store held in memory. Clones share state.
#[derive(Clone, Default)]
pub struct MemoryRemote {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryRemote {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Seed a document without journaling or notifying.
    pub fn insert_raw(&self, path: &str, fields: Fields) {
        self.lock().docs.insert(path.to_string(), fields);
    }

    pub fn document(&self, path: &str) -> Option<Fields> {
        self.lock().docs.get(path).cloned()
    }

    pub fn writes(&self) -> Vec<WriteRecord> {
        self.lock().writes.clone()
    }

    pub fn writes_to(&self, path: &str) -> Vec<WriteRecord> {
        self.lock()
            .writes
            .iter()
            .filter(|w| w.path() == path)
            .cloned()
            .collect()
    }

    pub fn attempts(&self) -> Vec<String> {
        self.lock().attempts.clone()
    }

    /// Every write fails with `err` until [`heal`](Self::heal).
    pub fn fail_writes_with(&self, err: RemoteError) {
        self.lock().write_failure = Some(err);
    }

    /// The next write fails with `err`; later ones behave normally.
    pub fn fail_next_write(&self, err: RemoteError) {
        self.lock().next_write_failures.push_back(err);
    }

    pub fn fail_reads_with(&self, err: RemoteError) {
        self.lock().read_failure = Some(err);
    }

    /// New subscriptions yield `err` instead of an initial snapshot.
    pub fn fail_subscriptions_with(&self, err: RemoteError) {
        self.lock().subscribe_failure = Some(err);
    }

    pub fn heal(&self) {
        let mut inner = self.lock();
        inner.write_failure = None;
        inner.next_write_failures.clear();
        inner.read_failure = None;
        inner.subscribe_failure = None;
    }

    /// Delay applied to every operation.
    pub fn set_latency(&self, latency: Duration) {
        self.lock().latency = latency;
    }

    /// Delay between a write landing (and subscribers seeing it) and the
    /// writer getting its result.
    pub fn set_ack_latency(&self, latency: Duration) {
        self.lock().ack_latency = latency;
    }

    /// Deliver an error on every live collection subscription.
    pub fn push_error(&self, err: RemoteError) {
        self.lock()
            .collection_subs
            .retain(|(_, tx)| tx.send(Err(err.clone())).is_ok());
    }

    /// Change a document as another client would: not journaled, but
    /// subscribers see it.
    pub fn external_set(&self, path: &str, fields: Fields, merge: bool) {
        self.lock().set(path, fields, merge);
    }

    pub fn external_delete(&self, path: &str) {
        let mut inner = self.lock();
        if inner.docs.remove(path).is_some() {
            inner.notify(path, ChangeKind::Removed);
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.lock()
            .collection_subs
            .iter()
            .filter(|(_, tx)| !tx.is_closed())
            .count()
    }

    async fn delay(inner: &Arc<Mutex<Inner>>) {
        let latency = inner.lock().map(|i| i.latency).unwrap_or_default();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
    }

    fn write_op<T, F>(&self, path: &str, op: F) -> BoxFuture<'static, Result<T, RemoteError>>
    where
        T: Send + 'static,
        F: FnOnce(&mut Inner) -> T + Send + 'static,
    {
        let inner = self.inner.clone();
        let path = path.to_string();
        Box::pin(async move {
            Self::delay(&inner).await;
            let (result, ack_latency) = {
                let mut guard = inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
                guard.attempts.push(path);
                if let Some(err) = guard.take_write_failure() {
                    return Err(err);
                }
                (op(&mut *guard), guard.ack_latency)
            };
            if !ack_latency.is_zero() {
                tokio::time::sleep(ack_latency).await;
            }
            Ok(result)
        })
    }
}

impl RemoteStore for MemoryRemote {
    fn get_document(&self, path: &str) -> BoxFuture<'static, Result<Option<RawDocument>, RemoteError>> {
        let inner = self.inner.clone();
        let path = path.to_string();
        Box::pin(async move {
            Self::delay(&inner).await;
            let guard = inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            if let Some(err) = &guard.read_failure {
                return Err(err.clone());
            }
            Ok(guard.document(&path))
        })
    }

    fn set_document(&self, path: &str, fields: Fields, merge: bool) -> BoxFuture<'static, Result<(), RemoteError>> {
        let target = path.to_string();
        self.write_op(path, move |inner| {
            inner.writes.push(WriteRecord::Set {
                path: target.clone(),
                fields: fields.clone(),
                merge,
            });
            inner.set(&target, fields, merge)
        })
    }

    fn add_document(&self, collection: &str, fields: Fields) -> BoxFuture<'static, Result<String, RemoteError>> {
        let collection = collection.to_string();
        self.write_op(&collection.clone(), move |inner| {
            inner.next_id += 1;
            let id = format!("doc{:04}", inner.next_id);
            let path = format!("{}/{}", collection, id);
            inner.docs.insert(path.clone(), fields.clone());
            inner.writes.push(WriteRecord::Add {
                path: path.clone(),
                fields,
            });
            inner.notify(&path, ChangeKind::Added);
            id
        })
    }

    fn delete_document(&self, path: &str) -> BoxFuture<'static, Result<(), RemoteError>> {
        let target = path.to_string();
        self.write_op(path, move |inner| {
            let existed = inner.docs.remove(&target).is_some();
            inner.writes.push(WriteRecord::Delete { path: target.clone() });
            if existed {
                inner.notify(&target, ChangeKind::Removed);
            }
        })
    }

    fn subscribe_collection(&self, collection: &str) -> SnapshotStream {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.lock();
        if let Some(err) = inner.subscribe_failure.clone() {
            let _ = tx.send(Err(err));
        } else {
            let initial = inner.collection_snapshot(collection, Vec::new());
            let changes = initial
                .documents
                .iter()
                .map(|d| DocumentChange {
                    kind: ChangeKind::Added,
                    id: d.id.clone(),
                })
                .collect();
            let _ = tx.send(Ok(CollectionSnapshot {
                documents: initial.documents,
                changes,
            }));
            inner.collection_subs.push((collection.to_string(), tx));
        }
        receiver_stream(rx)
    }

    fn subscribe_document(&self, path: &str) -> DocumentStream {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.lock();
        if let Some(err) = inner.subscribe_failure.clone() {
            let _ = tx.send(Err(err));
        } else {
            let _ = tx.send(Ok(inner.document(path)));
            inner.document_subs.push((path.to_string(), tx));
        }
        receiver_stream(rx)
    }
}

/// Fallback store held in memory. Clones share state.
#[derive(Clone, Default)]
pub struct MemoryFallback {
    values: Arc<Mutex<HashMap<String, String>>>,
}

impl MemoryFallback {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, String>> {
        self.values.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.lock().keys().cloned().collect();
        keys.sort();
        keys
    }
}

impl FallbackStore for MemoryFallback {
    fn get(&self, key: &str) -> Result<Option<String>, FallbackError> {
        Ok(self.lock().get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<(), FallbackError> {
        self.lock().insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), FallbackError> {
        self.lock().remove(key);
        Ok(())
    }
}
