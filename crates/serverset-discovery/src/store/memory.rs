//! In-memory coordination store with ZooKeeper watch semantics.
//!
//! Used by the test suites and by the dry-run mode of the binary. Cloning a
//! `MemoryStore` yields another handle on the same tree, so a test can mutate
//! the tree while the engine watches it.

use super::{
    join_path, node_name, parent_path, CoordinationStore, StoreError, StoreResult, Watch,
    WatchEvent, WatchEventKind,
};
use crate::error::{DiscoveryError, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::debug;

type Subscribers = HashMap<String, Vec<oneshot::Sender<WatchEvent>>>;

/// How a node is created.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateMode {
    Persistent,
    PersistentSequential,
    Ephemeral,
    EphemeralSequential,
}

impl CreateMode {
    fn is_sequential(self) -> bool {
        matches!(
            self,
            CreateMode::PersistentSequential | CreateMode::EphemeralSequential
        )
    }

    fn is_ephemeral(self) -> bool {
        matches!(self, CreateMode::Ephemeral | CreateMode::EphemeralSequential)
    }
}

#[derive(Debug, Default)]
struct ZNode {
    data: Vec<u8>,
    ephemeral: bool,
    children: BTreeSet<String>,
    sequence: u32,
}

struct Inner {
    nodes: HashMap<String, ZNode>,
    data_watches: Subscribers,
    child_watches: Subscribers,
    connected: bool,
    closed: bool,
}

impl Inner {
    fn check(&self) -> StoreResult<()> {
        if self.closed {
            return Err(StoreError::Closed);
        }
        if !self.connected {
            return Err(StoreError::ConnectionLoss("not connected".to_string()));
        }
        Ok(())
    }

    fn fire(subscribers: &mut Subscribers, path: &str, kind: WatchEventKind) {
        if let Some(senders) = subscribers.remove(path) {
            for tx in senders {
                let _ = tx.send(WatchEvent::new(path, kind));
            }
        }
    }

    fn fire_all(&mut self, kind: WatchEventKind) {
        for (path, senders) in self.data_watches.drain().chain(self.child_watches.drain()) {
            for tx in senders {
                let _ = tx.send(WatchEvent::new(path.clone(), kind));
            }
        }
    }

    fn remove(&mut self, path: &str) -> StoreResult<()> {
        let node = self.nodes.get(path).ok_or_else(|| StoreError::no_node(path))?;
        if !node.children.is_empty() {
            return Err(StoreError::NotEmpty {
                path: path.to_string(),
            });
        }
        self.nodes.remove(path);

        if let Some(parent) = parent_path(path) {
            if let Some(parent_node) = self.nodes.get_mut(parent) {
                parent_node.children.remove(node_name(path));
            }
            Self::fire(&mut self.data_watches, path, WatchEventKind::NodeDeleted);
            Self::fire(&mut self.child_watches, path, WatchEventKind::NodeDeleted);
            Self::fire(
                &mut self.child_watches,
                parent,
                WatchEventKind::NodeChildrenChanged,
            );
        }
        Ok(())
    }
}

/// A watch-capable hierarchical store kept entirely in memory.
#[derive(Clone)]
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    /// Creates a store holding only the root node `/`.
    pub fn new() -> Self {
        let mut nodes = HashMap::new();
        nodes.insert("/".to_string(), ZNode::default());
        Self {
            inner: Arc::new(Mutex::new(Inner {
                nodes,
                data_watches: HashMap::new(),
                child_watches: HashMap::new(),
                connected: true,
                closed: false,
            })),
        }
    }

    /// Creates a node and returns its actual path (sequential nodes get a
    /// ten digit suffix).
    pub fn create(&self, path: &str, data: &[u8], mode: CreateMode) -> StoreResult<String> {
        let mut inner = self.inner.lock();
        inner.check()?;

        let parent = parent_path(path).ok_or_else(|| StoreError::NodeExists {
            path: path.to_string(),
        })?;
        let parent_node = inner
            .nodes
            .get_mut(parent)
            .ok_or_else(|| StoreError::no_node(parent))?;

        let name = if mode.is_sequential() {
            let name = format!("{}{:010}", node_name(path), parent_node.sequence);
            parent_node.sequence += 1;
            name
        } else {
            node_name(path).to_string()
        };
        let actual = join_path(parent, &name);

        if inner.nodes.contains_key(&actual) {
            return Err(StoreError::NodeExists { path: actual });
        }

        if let Some(parent_node) = inner.nodes.get_mut(parent) {
            parent_node.children.insert(name);
        }
        inner.nodes.insert(
            actual.clone(),
            ZNode {
                data: data.to_vec(),
                ephemeral: mode.is_ephemeral(),
                ..Default::default()
            },
        );

        Inner::fire(&mut inner.data_watches, &actual, WatchEventKind::NodeCreated);
        Inner::fire(
            &mut inner.child_watches,
            parent,
            WatchEventKind::NodeChildrenChanged,
        );

        debug!(path = %actual, ?mode, "Created node");
        Ok(actual)
    }

    /// Creates `path` and every missing ancestor as persistent empty nodes.
    pub fn create_all(&self, path: &str) -> StoreResult<()> {
        let mut current = String::new();
        for segment in path.split('/').filter(|s| !s.is_empty()) {
            current.push('/');
            current.push_str(segment);
            match self.create(&current, &[], CreateMode::Persistent) {
                Ok(_) | Err(StoreError::NodeExists { .. }) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Replaces the payload of `path`.
    pub fn set(&self, path: &str, data: &[u8]) -> StoreResult<()> {
        let mut inner = self.inner.lock();
        inner.check()?;
        let node = inner
            .nodes
            .get_mut(path)
            .ok_or_else(|| StoreError::no_node(path))?;
        node.data = data.to_vec();
        Inner::fire(&mut inner.data_watches, path, WatchEventKind::NodeDataChanged);
        Ok(())
    }

    /// Deletes a childless node.
    pub fn delete(&self, path: &str) -> StoreResult<()> {
        let mut inner = self.inner.lock();
        inner.check()?;
        inner.remove(path)?;
        debug!(path = %path, "Deleted node");
        Ok(())
    }

    /// Deletes `path` and its whole subtree, children first. A missing path
    /// is not an error.
    pub fn delete_all(&self, path: &str) -> StoreResult<()> {
        let children = match self.list(path) {
            Ok(children) => children,
            Err(StoreError::NoNode { .. }) => return Ok(()),
            Err(e) => return Err(e),
        };

        for child in children {
            self.delete_all(&join_path(path, &child))?;
        }

        match self.delete(path) {
            Ok(()) | Err(StoreError::NoNode { .. }) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Returns true if `path` exists.
    pub fn exists(&self, path: &str) -> bool {
        self.inner.lock().nodes.contains_key(path)
    }

    /// Drops every ephemeral node, as the expiry of their owning session would.
    pub fn expire_ephemerals(&self) {
        let ephemeral: Vec<String> = {
            let inner = self.inner.lock();
            inner
                .nodes
                .iter()
                .filter(|(_, node)| node.ephemeral)
                .map(|(path, _)| path.clone())
                .collect()
        };
        let mut inner = self.inner.lock();
        for path in ephemeral {
            let _ = inner.remove(&path);
        }
    }

    /// Simulates a lost connection: every call fails with `ConnectionLoss`
    /// and all outstanding watches fire `NotWatching`.
    pub fn disconnect(&self) {
        let mut inner = self.inner.lock();
        inner.connected = false;
        inner.fire_all(WatchEventKind::NotWatching);
    }

    /// Restores the connection after [`disconnect`](Self::disconnect).
    pub fn reconnect(&self) {
        self.inner.lock().connected = true;
    }

    /// Returns true once [`CoordinationStore::close`] was called.
    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    /// Number of live watches registered on `path`.
    pub fn watch_count(&self, path: &str) -> usize {
        let inner = self.inner.lock();
        [&inner.data_watches, &inner.child_watches]
            .iter()
            .filter_map(|subscribers| subscribers.get(path))
            .flatten()
            .filter(|tx| !tx.is_closed())
            .count()
    }

    /// Seeds the store from a YAML fixture mapping container paths to the
    /// member payloads published under them. Every payload becomes an
    /// ephemeral sequential node named after `member_prefix`. Returns the
    /// number of members created.
    ///
    /// ```yaml
    /// /aurora/prod/web:
    ///   - serviceEndpoint: { host: 10.0.0.1, port: 8080 }
    ///     status: ALIVE
    /// ```
    pub fn seed_from_yaml(&self, yaml: &str, member_prefix: &str) -> Result<usize> {
        let fixture: BTreeMap<String, Vec<serde_json::Value>> = serde_yaml::from_str(yaml)
            .map_err(|e| DiscoveryError::Other(anyhow::Error::new(e).context("invalid seed fixture")))?;

        let mut created = 0;
        for (container, members) in fixture {
            self.create_all(&container)?;
            for member in members {
                let payload = serde_json::to_vec(&member).map_err(|e| {
                    DiscoveryError::Internal(format!("encoding seed member: {}", e))
                })?;
                self.create(
                    &join_path(&container, member_prefix),
                    &payload,
                    CreateMode::EphemeralSequential,
                )?;
                created += 1;
            }
        }
        Ok(created)
    }

    fn list(&self, path: &str) -> StoreResult<Vec<String>> {
        let inner = self.inner.lock();
        inner.check()?;
        inner
            .nodes
            .get(path)
            .map(|node| node.children.iter().cloned().collect())
            .ok_or_else(|| StoreError::no_node(path))
    }
}

#[async_trait]
impl CoordinationStore for MemoryStore {
    async fn children(&self, path: &str) -> StoreResult<Vec<String>> {
        self.list(path)
    }

    async fn children_watch(&self, path: &str) -> StoreResult<(Vec<String>, Watch)> {
        let mut inner = self.inner.lock();
        inner.check()?;
        let children = inner
            .nodes
            .get(path)
            .map(|node| node.children.iter().cloned().collect())
            .ok_or_else(|| StoreError::no_node(path))?;
        let (tx, watch) = Watch::channel(path);
        inner
            .child_watches
            .entry(path.to_string())
            .or_default()
            .push(tx);
        Ok((children, watch))
    }

    async fn get(&self, path: &str) -> StoreResult<Vec<u8>> {
        let inner = self.inner.lock();
        inner.check()?;
        inner
            .nodes
            .get(path)
            .map(|node| node.data.clone())
            .ok_or_else(|| StoreError::no_node(path))
    }

    async fn get_watch(&self, path: &str) -> StoreResult<(Vec<u8>, Watch)> {
        let mut inner = self.inner.lock();
        inner.check()?;
        let data = inner
            .nodes
            .get(path)
            .map(|node| node.data.clone())
            .ok_or_else(|| StoreError::no_node(path))?;
        let (tx, watch) = Watch::channel(path);
        inner
            .data_watches
            .entry(path.to_string())
            .or_default()
            .push(tx);
        Ok((data, watch))
    }

    async fn exists_watch(&self, path: &str) -> StoreResult<(bool, Watch)> {
        let mut inner = self.inner.lock();
        inner.check()?;
        let exists = inner.nodes.contains_key(path);
        let (tx, watch) = Watch::channel(path);
        inner
            .data_watches
            .entry(path.to_string())
            .or_default()
            .push(tx);
        Ok((exists, watch))
    }

    async fn close(&self) {
        let mut inner = self.inner.lock();
        inner.closed = true;
        inner.data_watches.clear();
        inner.child_watches.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_sequential_create() {
        let store = MemoryStore::new();
        store.create_all("/svc").unwrap();

        let first = store
            .create("/svc/member_", b"a", CreateMode::EphemeralSequential)
            .unwrap();
        let second = store
            .create("/svc/member_", b"b", CreateMode::EphemeralSequential)
            .unwrap();

        assert_eq!(first, "/svc/member_0000000000");
        assert_eq!(second, "/svc/member_0000000001");
        assert_eq!(
            store.children("/svc").await.unwrap(),
            vec!["member_0000000000", "member_0000000001"]
        );
        assert_eq!(store.get(&second).await.unwrap(), b"b");
    }

    #[tokio::test]
    async fn test_create_requires_parent() {
        let store = MemoryStore::new();
        let result = store.create("/missing/child", b"", CreateMode::Persistent);
        assert_eq!(result, Err(StoreError::no_node("/missing")));

        store.create_all("/a/b/c").unwrap();
        store.create_all("/a/b/c").unwrap();
        assert!(store.exists("/a/b"));
        assert!(matches!(
            store.create("/a/b", b"", CreateMode::Persistent),
            Err(StoreError::NodeExists { .. })
        ));
    }

    #[tokio::test]
    async fn test_children_watch_fires_once() {
        let store = MemoryStore::new();
        store.create_all("/svc").unwrap();

        let (children, watch) = store.children_watch("/svc").await.unwrap();
        assert!(children.is_empty());
        assert_eq!(store.watch_count("/svc"), 1);

        store.create("/svc/a", b"", CreateMode::Persistent).unwrap();
        let event = watch.fired().await;
        assert_eq!(event.kind, WatchEventKind::NodeChildrenChanged);
        assert_eq!(store.watch_count("/svc"), 0);
    }

    #[tokio::test]
    async fn test_delete_fires_node_and_parent_watches() {
        let store = MemoryStore::new();
        store.create_all("/svc/a").unwrap();

        let (_, parent_watch) = store.children_watch("/svc").await.unwrap();
        let (_, node_watch) = store.children_watch("/svc/a").await.unwrap();
        let (_, data_watch) = store.get_watch("/svc/a").await.unwrap();

        assert!(matches!(store.delete("/svc"), Err(StoreError::NotEmpty { .. })));
        store.delete("/svc/a").unwrap();

        assert_eq!(parent_watch.fired().await.kind, WatchEventKind::NodeChildrenChanged);
        assert_eq!(node_watch.fired().await.kind, WatchEventKind::NodeDeleted);
        assert_eq!(data_watch.fired().await.kind, WatchEventKind::NodeDeleted);
    }

    #[tokio::test]
    async fn test_exists_watch_fires_on_create() {
        let store = MemoryStore::new();
        let (exists, watch) = store.exists_watch("/svc").await.unwrap();
        assert!(!exists);

        store.create_all("/svc").unwrap();
        assert_eq!(watch.fired().await, WatchEvent::new("/svc", WatchEventKind::NodeCreated));
    }

    #[tokio::test]
    async fn test_data_watch_fires_on_set() {
        let store = MemoryStore::new();
        store.create("/svc", b"old", CreateMode::Persistent).unwrap();
        let (data, watch) = store.get_watch("/svc").await.unwrap();
        assert_eq!(data, b"old");

        store.set("/svc", b"new").unwrap();
        assert_eq!(watch.fired().await.kind, WatchEventKind::NodeDataChanged);
    }

    #[tokio::test]
    async fn test_delete_all_recursive() {
        let store = MemoryStore::new();
        store.create_all("/retrieval/discovery/serverset_1").unwrap();
        store.create_all("/retrieval/discovery/serverset_2").unwrap();
        store
            .create(
                "/retrieval/discovery/serverset_1/member_",
                b"{}",
                CreateMode::EphemeralSequential,
            )
            .unwrap();

        store.delete_all("/retrieval/discovery").unwrap();
        assert!(store.exists("/retrieval"));
        assert!(!store.exists("/retrieval/discovery"));
        assert!(store.delete_all("/retrieval/discovery").is_ok());
    }

    #[tokio::test]
    async fn test_disconnect_and_reconnect() {
        let store = MemoryStore::new();
        store.create_all("/svc").unwrap();
        let (_, watch) = store.children_watch("/svc").await.unwrap();

        store.disconnect();
        assert_eq!(watch.fired().await.kind, WatchEventKind::NotWatching);
        assert!(matches!(
            store.children("/svc").await,
            Err(StoreError::ConnectionLoss(_))
        ));

        store.reconnect();
        assert!(store.children("/svc").await.is_ok());
    }

    #[tokio::test]
    async fn test_expire_ephemerals() {
        let store = MemoryStore::new();
        store.create_all("/svc").unwrap();
        let member = store
            .create("/svc/member_", b"{}", CreateMode::EphemeralSequential)
            .unwrap();

        store.expire_ephemerals();
        assert!(!store.exists(&member));
        assert!(store.exists("/svc"));
    }

    #[tokio::test]
    async fn test_close() {
        let store = MemoryStore::new();
        let (_, watch) = store.exists_watch("/svc").await.unwrap();

        store.close().await;
        assert!(store.is_closed());
        assert_eq!(watch.fired().await.kind, WatchEventKind::NotWatching);
        assert_eq!(store.children("/").await, Err(StoreError::Closed));
    }

    #[tokio::test]
    async fn test_seed_from_yaml() {
        let store = MemoryStore::new();
        let yaml = r#"
/aurora/prod/web:
  - serviceEndpoint: { host: 10.0.0.1, port: 8080 }
  - serviceEndpoint: { host: 10.0.0.2, port: 8080 }
/aurora/prod/api: []
"#;
        assert_eq!(store.seed_from_yaml(yaml, "member_").unwrap(), 2);
        assert!(store.exists("/aurora/prod/api"));
        assert_eq!(store.children("/aurora/prod/web").await.unwrap().len(), 2);

        assert!(store.seed_from_yaml("- not a map", "member_").is_err());
    }
}
