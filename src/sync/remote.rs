//! The remote document store as seen by the engine.
//!
//! The store itself lives elsewhere; this is the surface the engine consumes:
//! point reads, merged writes, server-id inserts, deletes and push subscriptions.

use futures::future::BoxFuture;
use futures::stream::BoxStream;
use serde_json::{Map, Value};

use crate::error::RemoteError;

pub type Fields = Map<String, Value>;

/// A document as delivered by the store, before any normalization.
#[derive(Debug, Clone, PartialEq)]
pub struct RawDocument {
    pub id: String,
    pub fields: Fields,
}

impl RawDocument {
    pub fn new(id: impl Into<String>, fields: Fields) -> Self {
        Self {
            id: id.into(),
            fields,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Added,
    Modified,
    Removed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentChange {
    pub kind: ChangeKind,
    pub id: String,
}

/// Full state of a collection plus the changes that produced it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CollectionSnapshot {
    pub documents: Vec<RawDocument>,
    pub changes: Vec<DocumentChange>,
}

pub type SnapshotStream = BoxStream<'static, Result<CollectionSnapshot, RemoteError>>;
pub type DocumentStream = BoxStream<'static, Result<Option<RawDocument>, RemoteError>>;

/// Remote store collaborator. Futures are `'static` so the engine can hand them
/// to spawned tasks.
pub trait RemoteStore: Send + Sync {
    fn get_document(&self, path: &str) -> BoxFuture<'static, Result<Option<RawDocument>, RemoteError>>;

    /// Write fields to a document. With `merge` only the given fields change.
    fn set_document(
        &self,
        path: &str,
        fields: Fields,
        merge: bool,
    ) -> BoxFuture<'static, Result<(), RemoteError>>;

    /// Insert into a collection; the store assigns and returns the id.
    fn add_document(&self, collection: &str, fields: Fields) -> BoxFuture<'static, Result<String, RemoteError>>;

    fn delete_document(&self, path: &str) -> BoxFuture<'static, Result<(), RemoteError>>;

    /// Stream of collection snapshots; errors arrive in-band. Dropping the
    /// stream ends the subscription.
    fn subscribe_collection(&self, collection: &str) -> SnapshotStream;

    fn subscribe_document(&self, path: &str) -> DocumentStream;
}

/// One durable remote operation.
#[derive(Debug, Clone, PartialEq)]
pub enum RemoteWrite {
    Set { path: String, fields: Fields, merge: bool },
    Add { collection: String, fields: Fields },
    Delete { path: String },
}

/// Outcome of a single [`RemoteWrite`]; `Added` carries the assigned id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteAck {
    Done,
    Added(String),
}

impl RemoteWrite {
    pub fn execute(self, store: &dyn RemoteStore) -> BoxFuture<'static, Result<WriteAck, RemoteError>> {
        match self {
            Self::Set { path, fields, merge } => {
                let fut = store.set_document(&path, fields, merge);
                Box::pin(async move { fut.await.map(|()| WriteAck::Done) })
            }
            Self::Add { collection, fields } => {
                let fut = store.add_document(&collection, fields);
                Box::pin(async move { fut.await.map(WriteAck::Added) })
            }
            Self::Delete { path } => {
                let fut = store.delete_document(&path);
                Box::pin(async move { fut.await.map(|()| WriteAck::Done) })
            }
        }
    }
}

/// Run writes in order, stopping at the first failure.
pub async fn execute_all(
    store: &dyn RemoteStore,
    writes: Vec<RemoteWrite>,
) -> Result<Vec<WriteAck>, RemoteError> {
    let mut acks = Vec::with_capacity(writes.len());
    for write in writes {
        acks.push(write.execute(store).await?);
    }
    Ok(acks)
}

/// Parent collection of a document path (`users/u/tasks/x` -> `users/u/tasks`).
pub fn parent_collection(path: &str) -> Option<&str> {
    path.rsplit_once('/').map(|(parent, _)| parent)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parent_of_nested_path() {
        assert_eq!(parent_collection("users/u1/tasks/abc"), Some("users/u1/tasks"));
        assert_eq!(parent_collection("tasks/abc"), Some("tasks"));
        assert_eq!(parent_collection("tasks"), None);
    }
}
