//! Coordination-store capability consumed by the discovery engine.
//!
//! The engine never talks to a concrete ZooKeeper client; it depends on the
//! [`CoordinationStore`] trait only. Watches follow ZooKeeper semantics: each
//! one fires at most once and must be registered again after it fired.

pub mod memory;

pub use memory::{CreateMode, MemoryStore};

use async_trait::async_trait;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::oneshot;

/// Result type alias for store operations
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Errors returned by a coordination store.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// The path does not exist
    #[error("Node does not exist: {path}")]
    NoNode { path: String },

    /// The path already exists
    #[error("Node already exists: {path}")]
    NodeExists { path: String },

    /// The node still has children
    #[error("Node has children: {path}")]
    NotEmpty { path: String },

    /// The connection to the ensemble was lost
    #[error("Connection to the coordination store lost: {0}")]
    ConnectionLoss(String),

    /// The store session expired; all watches are gone
    #[error("Coordination store session expired")]
    SessionExpired,

    /// The operation did not complete in time
    #[error("Store operation '{operation}' on {path} timed out after {timeout_ms}ms")]
    Timeout {
        operation: String,
        path: String,
        timeout_ms: u64,
    },

    /// The client was closed
    #[error("Coordination store client is closed")]
    Closed,
}

impl StoreError {
    /// Creates a no node error.
    pub fn no_node(path: impl Into<String>) -> Self {
        Self::NoNode { path: path.into() }
    }

    /// Returns true if the operation can be retried once the connection recovers.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            StoreError::ConnectionLoss(_) | StoreError::SessionExpired | StoreError::Timeout { .. }
        )
    }
}

/// What caused a watch to fire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchEventKind {
    NodeCreated,
    NodeDeleted,
    NodeDataChanged,
    NodeChildrenChanged,
    /// The store dropped the watch (connection or session loss, close)
    NotWatching,
}

/// A fired watch notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchEvent {
    pub path: String,
    pub kind: WatchEventKind,
}

impl WatchEvent {
    pub fn new(path: impl Into<String>, kind: WatchEventKind) -> Self {
        Self {
            path: path.into(),
            kind,
        }
    }
}

/// A single-fire watch registration.
#[derive(Debug)]
pub struct Watch {
    path: String,
    rx: oneshot::Receiver<WatchEvent>,
}

impl Watch {
    /// Creates a watch on `path` together with the sender that fires it.
    pub fn channel(path: impl Into<String>) -> (oneshot::Sender<WatchEvent>, Watch) {
        let (tx, rx) = oneshot::channel();
        (
            tx,
            Watch {
                path: path.into(),
                rx,
            },
        )
    }

    /// Path the watch was registered on.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Waits for the watch to fire. A watch the store dropped without firing
    /// resolves as [`WatchEventKind::NotWatching`].
    pub async fn fired(self) -> WatchEvent {
        match self.rx.await {
            Ok(event) => event,
            Err(_) => WatchEvent::new(self.path, WatchEventKind::NotWatching),
        }
    }
}

/// Read and watch primitives of a hierarchical coordination store.
///
/// Implementations must be safe for concurrent use; the engine shares one
/// instance across all sources.
#[async_trait]
pub trait CoordinationStore: Send + Sync {
    /// Lists the child names of `path`.
    async fn children(&self, path: &str) -> StoreResult<Vec<String>>;

    /// Lists the child names of `path` and registers a children watch in the
    /// same operation.
    async fn children_watch(&self, path: &str) -> StoreResult<(Vec<String>, Watch)>;

    /// Reads the payload of `path`.
    async fn get(&self, path: &str) -> StoreResult<Vec<u8>>;

    /// Reads the payload of `path` and registers a data watch in the same
    /// operation.
    async fn get_watch(&self, path: &str) -> StoreResult<(Vec<u8>, Watch)>;

    /// Reports whether `path` exists and registers a watch that fires on its
    /// creation, deletion or data change.
    async fn exists_watch(&self, path: &str) -> StoreResult<(bool, Watch)>;

    /// Releases the connection. Outstanding watches resolve as `NotWatching`.
    async fn close(&self);
}

/// Bounds a store operation by `timeout`, mapping expiry to [`StoreError::Timeout`].
pub async fn bounded<T, F>(timeout: Duration, operation: &str, path: &str, fut: F) -> StoreResult<T>
where
    F: Future<Output = StoreResult<T>>,
{
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result,
        Err(_) => Err(StoreError::Timeout {
            operation: operation.to_string(),
            path: path.to_string(),
            timeout_ms: timeout.as_millis() as u64,
        }),
    }
}

/// Joins a parent path and a child name.
pub fn join_path(parent: &str, child: &str) -> String {
    if parent == "/" {
        format!("/{}", child)
    } else {
        format!("{}/{}", parent, child)
    }
}

/// Returns the parent of `path`, or None for the store root.
pub fn parent_path(path: &str) -> Option<&str> {
    if path == "/" {
        return None;
    }
    match path.rfind('/') {
        Some(0) => Some("/"),
        Some(idx) => Some(&path[..idx]),
        None => None,
    }
}

/// Returns the last segment of `path`.
pub fn node_name(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}
