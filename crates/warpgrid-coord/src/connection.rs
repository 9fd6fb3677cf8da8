//! The coordination store contract.
//!
//! A [`Connection`] is one session against a hierarchical key/value
//! store with ZooKeeper-style semantics: slash-separated paths, opaque
//! node data with a version counter, ephemeral nodes owned by the
//! session, and one-shot watches that fire on the next change.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use async_trait::async_trait;
use tokio::sync::oneshot;

use crate::error::CoordResult;

/// Optimistic concurrency token carried by every node.
pub type Version = u64;

/// What happened to a watched node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    NodeCreated,
    NodeDeleted,
    NodeDataChanged,
    NodeChildrenChanged,
    /// The owning session ended; the watch will never fire again.
    Session,
    /// The store dropped the watch without an event.
    NotWatching,
}

/// A fired watch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    pub kind: EventKind,
    pub path: String,
}

/// One-shot watch on a node or its children.
///
/// Resolves exactly once. Dropping the watch cancels it.
#[derive(Debug)]
pub struct Watch {
    path: String,
    rx: oneshot::Receiver<Event>,
}

impl Watch {
    pub fn new(path: impl Into<String>, rx: oneshot::Receiver<Event>) -> Self {
        Self {
            path: path.into(),
            rx,
        }
    }

    /// Path the watch was registered on.
    pub fn path(&self) -> &str {
        &self.path
    }
}

impl Future for Watch {
    type Output = Event;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Event> {
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(Ok(event)) => Poll::Ready(event),
            Poll::Ready(Err(_)) => Poll::Ready(Event {
                kind: EventKind::NotWatching,
                path: self.path.clone(),
            }),
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Await an optional watch; pends forever when there is none.
///
/// Lets a `select!` loop carry a watch that only exists in some states.
pub async fn next_event(watch: &mut Option<Watch>) -> Event {
    match watch.as_mut() {
        Some(w) => w.await,
        None => std::future::pending().await,
    }
}

/// Node payload plus its current version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeData {
    pub data: Vec<u8>,
    pub version: Version,
}

/// Lifetime of a created node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateMode {
    Persistent,
    /// Removed when the creating session ends.
    Ephemeral,
    /// Ephemeral, with a 10-digit per-parent sequence appended to the path.
    EphemeralSequential,
}

/// One step of an atomic [`Connection::commit`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Op {
    Create { path: String, data: Vec<u8> },
    Set {
        path: String,
        data: Vec<u8>,
        version: Option<Version>,
    },
    Delete { path: String },
}

/// A session against the coordination store.
#[async_trait]
pub trait Connection: Send + Sync {
    /// Create a node, creating missing parents as empty persistent nodes.
    /// Returns the path actually created.
    async fn create(&self, path: &str, data: Vec<u8>, mode: CreateMode) -> CoordResult<String>;

    /// Create a persistent directory node; succeeds if it already exists.
    async fn create_dir(&self, path: &str) -> CoordResult<()>;

    async fn exists(&self, path: &str) -> CoordResult<bool>;

    /// Existence check plus a watch that fires on create, delete or data change.
    async fn exists_w(&self, path: &str) -> CoordResult<(bool, Watch)>;

    async fn get(&self, path: &str) -> CoordResult<NodeData>;

    async fn get_w(&self, path: &str) -> CoordResult<(NodeData, Watch)>;

    /// Overwrite node data. `Some(version)` makes this a compare-and-swap.
    async fn set(&self, path: &str, data: Vec<u8>, version: Option<Version>)
    -> CoordResult<Version>;

    /// Child names, sorted.
    async fn children(&self, path: &str) -> CoordResult<Vec<String>>;

    async fn children_w(&self, path: &str) -> CoordResult<(Vec<String>, Watch)>;

    /// Delete a node and everything below it.
    async fn delete(&self, path: &str) -> CoordResult<()>;

    /// Apply all operations atomically, or none of them.
    async fn commit(&self, ops: Vec<Op>) -> CoordResult<()>;

    /// End the session, reaping its ephemeral nodes.
    async fn close(&self);
}
