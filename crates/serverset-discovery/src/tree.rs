//! Recursive tree watcher
//!
//! Mirrors the subtree under one configured root. Every container below the
//! root holds a children watch and every member node a data watch, so any
//! change at any depth produces a notification. A [`TreeWatcher`] owns its
//! [`Tree`] outright and is the only task that ever touches it; snapshots of
//! the decoded state are handed to the coordinator by value.
//!
//! When the store connection is lost the tree is rebuilt from scratch once
//! the store answers again. The old tree stays in place (and keeps being
//! reported) until a fresh one has been fully listed.

use crate::error::DiscoveryError;
use crate::member::{self, is_member_node};
use crate::metrics::DiscoveryMetrics;
use crate::node::{Fired, Listing, NodeKind, PathNode, WatchContext};
use crate::store::{join_path, node_name, CoordinationStore, StoreError, StoreResult, WatchEventKind};
use crate::types::{SourceUpdate, SubtreeSnapshot};
use serverset_core::{RetryConfig, ServersetConfig, Source};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

/// The watched subtree of one root, keyed by absolute path.
#[derive(Debug)]
pub struct Tree {
    root: String,
    member_prefix: String,
    metrics: Arc<DiscoveryMetrics>,
    nodes: HashMap<String, PathNode>,
}

impl Tree {
    pub fn new(root: impl Into<String>, member_prefix: impl Into<String>, metrics: Arc<DiscoveryMetrics>) -> Self {
        let root = root.into();
        let mut nodes = HashMap::new();
        nodes.insert(root.clone(), PathNode::new(root.clone(), NodeKind::Container, None));
        Self {
            root,
            member_prefix: member_prefix.into(),
            metrics,
            nodes,
        }
    }

    pub fn root(&self) -> &str {
        &self.root
    }

    pub fn node(&self, path: &str) -> Option<&PathNode> {
        self.nodes.get(path)
    }

    /// Number of tracked paths, the root included.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Lists `start` and everything new below it, registering a watch on
    /// every path visited.
    pub async fn sync(&mut self, start: &str, ctx: &WatchContext) -> StoreResult<()> {
        let mut queue = VecDeque::from([start.to_string()]);

        while let Some(path) = queue.pop_front() {
            let listing = match self.nodes.get_mut(&path) {
                Some(node) => node.refresh(ctx).await?,
                // removed earlier in this pass
                None => continue,
            };

            match listing {
                Listing::Absent if path == self.root => {
                    debug!(root = %self.root, "Root path does not exist");
                    self.clear_descendants(&path);
                }
                Listing::Absent => {
                    trace!(path = %path, "Path vanished");
                    self.remove_subtree(&path);
                }
                Listing::Data(bytes) => {
                    let decoded = match member::decode(&bytes) {
                        Ok(member) => Some(member),
                        Err(e) => {
                            warn!(root = %self.root, path = %path, error = %e, "Skipping malformed serverset member");
                            self.metrics.record_malformed_member(&self.root);
                            None
                        }
                    };
                    if let Some(node) = self.nodes.get_mut(&path) {
                        node.member = decoded;
                    }
                }
                Listing::Children(names) => {
                    let known = self
                        .nodes
                        .get(&path)
                        .map(|node| node.children.clone())
                        .unwrap_or_default();

                    for gone in known.difference(&names) {
                        self.remove_subtree(&join_path(&path, gone));
                    }

                    for added in names.difference(&known) {
                        let child = join_path(&path, added);
                        let kind = if is_member_node(added, &self.member_prefix) {
                            NodeKind::Member
                        } else {
                            NodeKind::Container
                        };
                        self.nodes
                            .insert(child.clone(), PathNode::new(child.clone(), kind, Some(path.clone())));
                        queue.push_back(child);
                    }

                    if let Some(node) = self.nodes.get_mut(&path) {
                        node.children = names;
                    }
                }
            }
        }

        Ok(())
    }

    /// Applies one fired watch. Returns false if the notification belongs to
    /// a watch the tree no longer holds.
    pub async fn handle(&mut self, fired: &Fired, ctx: &WatchContext) -> StoreResult<bool> {
        let current = self
            .nodes
            .get_mut(&fired.path)
            .is_some_and(|node| node.consume(fired));
        if !current {
            trace!(path = %fired.path, generation = fired.generation, "Ignoring stale notification");
            return Ok(false);
        }

        if fired.kind == WatchEventKind::NotWatching {
            return Err(StoreError::ConnectionLoss(format!(
                "store dropped the watch on {}",
                fired.path
            )));
        }

        trace!(path = %fired.path, kind = ?fired.kind, "Refreshing path");
        self.sync(&fired.path, ctx).await?;
        Ok(true)
    }

    /// Current decoded state of the tree.
    pub fn snapshot(&self) -> SubtreeSnapshot {
        let mut snapshot = SubtreeSnapshot::absent(self.root.clone());
        snapshot.root_exists = self.nodes.get(&self.root).is_some_and(|node| node.exists);

        for node in self.nodes.values().filter(|node| node.exists) {
            match (node.kind, &node.member) {
                (NodeKind::Member, Some(member)) => {
                    snapshot.members.insert(node.path.clone(), member.clone());
                }
                (NodeKind::Member, None) => {}
                (NodeKind::Container, _) => {
                    snapshot.containers.insert(node.path.clone());
                }
            }
        }
        snapshot
    }

    /// Drops `path` and everything below it along with their watches.
    fn remove_subtree(&mut self, path: &str) {
        let Some(node) = self.nodes.remove(path) else {
            return;
        };
        if let Some(parent) = node.parent.as_ref().and_then(|p| self.nodes.get_mut(p)) {
            parent.children.remove(node_name(path));
        }

        let mut stack: Vec<String> = node.children.iter().map(|c| join_path(path, c)).collect();
        while let Some(descendant) = stack.pop() {
            if let Some(removed) = self.nodes.remove(&descendant) {
                stack.extend(removed.children.iter().map(|c| join_path(&descendant, c)));
            }
        }
    }

    fn clear_descendants(&mut self, path: &str) {
        let children: Vec<String> = self
            .nodes
            .get(path)
            .map(|node| node.children.iter().map(|c| join_path(path, c)).collect())
            .unwrap_or_default();
        for child in children {
            self.remove_subtree(&child);
        }
        if let Some(node) = self.nodes.get_mut(path) {
            node.children.clear();
        }
    }
}

/// Per-source settings taken from the serverset configuration.
#[derive(Debug, Clone)]
pub struct WatcherSettings {
    pub member_prefix: String,
    pub retry: RetryConfig,
}

impl From<&ServersetConfig> for WatcherSettings {
    fn from(config: &ServersetConfig) -> Self {
        Self {
            member_prefix: config.member_prefix.clone(),
            retry: config.retry.clone(),
        }
    }
}

/// Watches one source and reports its snapshots to the coordinator.
pub struct TreeWatcher {
    source: Source,
    settings: WatcherSettings,
    metrics: Arc<DiscoveryMetrics>,
    ctx: WatchContext,
    events: mpsc::UnboundedReceiver<Fired>,
    tree: Tree,
    last_reported: Option<SubtreeSnapshot>,
}

impl TreeWatcher {
    pub fn new(
        source: Source,
        store: Arc<dyn CoordinationStore>,
        settings: WatcherSettings,
        metrics: Arc<DiscoveryMetrics>,
    ) -> Self {
        let (tx, events) = mpsc::unbounded_channel();
        let ctx = WatchContext::new(store, tx, source.ensemble.timeout());
        let tree = Tree::new(source.root.clone(), settings.member_prefix.clone(), metrics.clone());
        Self {
            source,
            settings,
            metrics,
            ctx,
            events,
            tree,
            last_reported: None,
        }
    }

    pub fn root(&self) -> &str {
        &self.source.root
    }

    /// Runs until `cancel` fires, the coordinator goes away, or the store
    /// stays unreachable past the retry policy.
    pub async fn run(mut self, updates: mpsc::Sender<SourceUpdate>, cancel: CancellationToken) {
        info!(root = %self.source.root, ensemble = %self.source.ensemble, "Starting tree watcher");

        let mut failures: u32 = 0;
        let mut retry_at: Option<Instant> = Some(Instant::now());

        loop {
            let pending_retry = retry_at;
            let retry = async move {
                match pending_retry {
                    Some(at) => tokio::time::sleep_until(at).await,
                    None => std::future::pending().await,
                }
            };

            let outcome = tokio::select! {
                biased;

                _ = cancel.cancelled() => break,

                _ = retry => {
                    match self.resync().await {
                        Ok(()) => {
                            if failures > 0 {
                                info!(root = %self.source.root, attempts = failures, "Resynchronized with the coordination store");
                            }
                            failures = 0;
                            retry_at = None;
                            Ok(true)
                        }
                        Err(e) => Err(e),
                    }
                }

                Some(fired) = self.events.recv() => {
                    self.metrics.record_watch_event(&self.source.root);
                    if retry_at.is_some() {
                        // a full resync is already scheduled
                        continue;
                    }
                    self.tree.handle(&fired, &self.ctx).await
                }
            };

            match outcome {
                Ok(true) => {
                    if !self.report(&updates, &cancel).await {
                        break;
                    }
                }
                Ok(false) => {}
                Err(e) => match self.on_failure(&mut failures, e) {
                    Ok(at) => retry_at = Some(at),
                    Err(fatal) => {
                        error!(root = %self.source.root, error = %fatal, "Giving up on source");
                        let update = SourceUpdate::Fatal {
                            root: self.source.root.clone(),
                            error: fatal,
                        };
                        tokio::select! {
                            biased;
                            _ = cancel.cancelled() => {}
                            _ = updates.send(update) => {}
                        }
                        break;
                    }
                },
            }
        }

        debug!(root = %self.source.root, "Tree watcher stopped");
    }

    /// Rebuilds the tree from scratch, replacing the current one only once
    /// the new listing completed.
    async fn resync(&mut self) -> StoreResult<()> {
        let mut fresh = Tree::new(
            self.source.root.clone(),
            self.settings.member_prefix.clone(),
            self.metrics.clone(),
        );
        fresh.sync(&self.source.root, &self.ctx).await?;
        debug!(root = %self.source.root, paths = fresh.len(), "Listed subtree");
        self.tree = fresh;
        Ok(())
    }

    /// Schedules the next resync, or returns the fatal error once the retry
    /// policy is exhausted.
    fn on_failure(&self, failures: &mut u32, error: StoreError) -> Result<Instant, DiscoveryError> {
        self.metrics.record_store_failure(&self.source.root);
        let attempts = *failures + 1;

        if !error.is_transient() || self.settings.retry.exhausted(attempts) {
            return Err(DiscoveryError::ConnectionFatal {
                root: self.source.root.clone(),
                attempts,
                last_error: error,
            });
        }

        let delay = self.settings.retry.backoff(*failures);
        *failures = attempts;
        warn!(
            root = %self.source.root,
            error = %error,
            attempt = attempts,
            retry_in_ms = delay.as_millis() as u64,
            "Coordination store failure, resynchronizing after backoff"
        );
        Ok(Instant::now() + delay)
    }

    /// Sends the current snapshot if it differs from the last one sent.
    /// Returns false once the watcher should stop.
    async fn report(&mut self, updates: &mpsc::Sender<SourceUpdate>, cancel: &CancellationToken) -> bool {
        let snapshot = self.tree.snapshot();
        if self.last_reported.as_ref() == Some(&snapshot) {
            return true;
        }

        debug!(
            root = %snapshot.root,
            exists = snapshot.root_exists,
            members = snapshot.members.len(),
            "Subtree changed"
        );
        self.last_reported = Some(snapshot.clone());

        tokio::select! {
            biased;
            _ = cancel.cancelled() => false,
            sent = updates.send(SourceUpdate::Snapshot(snapshot)) => sent.is_ok(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::member::{encode, ServersetMember};
    use crate::store::{CreateMode, MemoryStore};
    use serverset_core::ServerEnsemble;
    use std::time::Duration;

    fn context(store: &MemoryStore) -> (WatchContext, mpsc::UnboundedReceiver<Fired>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let ctx = WatchContext::new(Arc::new(store.clone()), tx, Duration::from_secs(1));
        (ctx, rx)
    }

    fn add_member(store: &MemoryStore, parent: &str, port: u16) -> String {
        let payload = encode(&ServersetMember::new("127.0.0.1", port)).unwrap();
        store
            .create(&join_path(parent, "member_"), &payload, CreateMode::EphemeralSequential)
            .unwrap()
    }

    async fn settle(tree: &mut Tree, ctx: &WatchContext, rx: &mut mpsc::UnboundedReceiver<Fired>) {
        while let Ok(Some(fired)) = tokio::time::timeout(Duration::from_millis(50), rx.recv()).await {
            tree.handle(&fired, ctx).await.unwrap();
        }
    }

    fn ports(snapshot: &SubtreeSnapshot) -> Vec<u16> {
        snapshot
            .members
            .values()
            .map(|m| m.service_endpoint.port)
            .collect()
    }

    #[tokio::test]
    async fn test_initial_sync_finds_nested_members() {
        let store = MemoryStore::new();
        store.create_all("/retrieval/discovery/serverset_1").unwrap();
        store.create_all("/retrieval/discovery/serverset_2").unwrap();
        add_member(&store, "/retrieval/discovery/serverset_1", 1111);
        add_member(&store, "/retrieval/discovery/serverset_2", 2222);
        let (ctx, _rx) = context(&store);

        let mut tree = Tree::new("/retrieval", "member_", Arc::default());
        tree.sync("/retrieval", &ctx).await.unwrap();

        let snapshot = tree.snapshot();
        assert!(snapshot.root_exists);
        assert_eq!(ports(&snapshot), vec![1111, 2222]);
        assert!(snapshot.containers.contains("/retrieval/discovery"));
        assert_eq!(tree.len(), 6);
        assert_eq!(store.watch_count("/retrieval/discovery/serverset_1"), 1);
        assert_eq!(store.watch_count("/retrieval/discovery/serverset_1/member_0000000000"), 1);
    }

    #[tokio::test]
    async fn test_intermediate_delete_and_recreate() {
        let store = MemoryStore::new();
        store.create_all("/retrieval/discovery/serverset_1").unwrap();
        add_member(&store, "/retrieval/discovery/serverset_1", 1111);
        let (ctx, mut rx) = context(&store);

        let mut tree = Tree::new("/retrieval", "member_", Arc::default());
        tree.sync("/retrieval", &ctx).await.unwrap();

        store.delete_all("/retrieval/discovery").unwrap();
        settle(&mut tree, &ctx, &mut rx).await;
        let snapshot = tree.snapshot();
        assert!(snapshot.root_exists);
        assert!(snapshot.members.is_empty());
        assert_eq!(tree.len(), 1);

        store.create_all("/retrieval/discovery/serverset_1").unwrap();
        add_member(&store, "/retrieval/discovery/serverset_1", 3333);
        settle(&mut tree, &ctx, &mut rx).await;
        assert_eq!(ports(&tree.snapshot()), vec![3333]);
    }

    #[tokio::test]
    async fn test_malformed_member_is_skipped() {
        let store = MemoryStore::new();
        store.create_all("/svc").unwrap();
        add_member(&store, "/svc", 1111);
        let bad = store
            .create("/svc/member_", b"not json", CreateMode::EphemeralSequential)
            .unwrap();
        let (ctx, mut rx) = context(&store);
        let metrics = Arc::new(DiscoveryMetrics::new());

        let mut tree = Tree::new("/svc", "member_", metrics.clone());
        tree.sync("/svc", &ctx).await.unwrap();
        assert_eq!(ports(&tree.snapshot()), vec![1111]);
        assert_eq!(metrics.malformed_members(), 1);

        // still watched: fixing the payload brings the member in
        store
            .set(&bad, &encode(&ServersetMember::new("127.0.0.1", 2222)).unwrap())
            .unwrap();
        settle(&mut tree, &ctx, &mut rx).await;
        assert_eq!(ports(&tree.snapshot()), vec![1111, 2222]);
    }

    #[tokio::test]
    async fn test_root_vanishes_and_returns() {
        let store = MemoryStore::new();
        store.create_all("/svc").unwrap();
        add_member(&store, "/svc", 1111);
        let (ctx, mut rx) = context(&store);

        let mut tree = Tree::new("/svc", "member_", Arc::default());
        tree.sync("/svc", &ctx).await.unwrap();

        store.delete_all("/svc").unwrap();
        settle(&mut tree, &ctx, &mut rx).await;
        let snapshot = tree.snapshot();
        assert!(!snapshot.root_exists);
        assert!(snapshot.members.is_empty());
        assert!(snapshot.containers.is_empty());

        store.create_all("/svc").unwrap();
        add_member(&store, "/svc", 2222);
        settle(&mut tree, &ctx, &mut rx).await;
        let snapshot = tree.snapshot();
        assert!(snapshot.root_exists);
        assert_eq!(ports(&snapshot), vec![2222]);
    }

    #[tokio::test]
    async fn test_non_member_leaf_is_a_container() {
        let store = MemoryStore::new();
        store.create_all("/svc/config").unwrap();
        let (ctx, _rx) = context(&store);

        let mut tree = Tree::new("/svc", "member_", Arc::default());
        tree.sync("/svc", &ctx).await.unwrap();
        assert_eq!(tree.node("/svc/config").unwrap().kind, NodeKind::Container);
        assert!(tree.snapshot().members.is_empty());
    }

    #[tokio::test]
    async fn test_stale_notification_is_ignored() {
        let store = MemoryStore::new();
        store.create_all("/svc").unwrap();
        let (ctx, _rx) = context(&store);

        let mut tree = Tree::new("/svc", "member_", Arc::default());
        tree.sync("/svc", &ctx).await.unwrap();

        let stale = Fired {
            path: "/svc".to_string(),
            generation: 0,
            kind: WatchEventKind::NodeChildrenChanged,
        };
        assert!(!tree.handle(&stale, &ctx).await.unwrap());
    }

    #[tokio::test]
    async fn test_dropped_watch_is_a_failure() {
        let store = MemoryStore::new();
        store.create_all("/svc").unwrap();
        let (ctx, mut rx) = context(&store);

        let mut tree = Tree::new("/svc", "member_", Arc::default());
        tree.sync("/svc", &ctx).await.unwrap();

        store.disconnect();
        let fired = rx.recv().await.unwrap();
        assert_eq!(fired.kind, WatchEventKind::NotWatching);
        let err = tree.handle(&fired, &ctx).await.unwrap_err();
        assert!(err.is_transient());
    }

    fn watcher(store: &MemoryStore, root: &str, retry: RetryConfig) -> TreeWatcher {
        let ensemble = Arc::new(ServerEnsemble::new(vec!["localhost:2181".to_string()], Duration::from_secs(1)));
        TreeWatcher::new(
            Source::new(ensemble, root),
            Arc::new(store.clone()),
            WatcherSettings {
                member_prefix: "member_".to_string(),
                retry,
            },
            Arc::default(),
        )
    }

    fn fast_retry(max_attempts: Option<u32>) -> RetryConfig {
        RetryConfig {
            initial_backoff_ms: 10,
            max_backoff_ms: 20,
            multiplier: 2.0,
            max_attempts,
        }
    }

    async fn next_snapshot(rx: &mut mpsc::Receiver<SourceUpdate>) -> SubtreeSnapshot {
        match tokio::time::timeout(Duration::from_secs(2), rx.recv()).await {
            Ok(Some(SourceUpdate::Snapshot(snapshot))) => snapshot,
            other => panic!("expected a snapshot, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_watcher_reports_changes() {
        let store = MemoryStore::new();
        store.create_all("/svc").unwrap();
        let (tx, mut rx) = mpsc::channel(16);
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(watcher(&store, "/svc", fast_retry(Some(3))).run(tx, cancel.clone()));

        let snapshot = next_snapshot(&mut rx).await;
        assert!(snapshot.root_exists);
        assert!(snapshot.members.is_empty());

        add_member(&store, "/svc", 1111);
        assert_eq!(ports(&next_snapshot(&mut rx).await), vec![1111]);

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_watcher_recovers_after_disconnect() {
        let store = MemoryStore::new();
        store.create_all("/svc").unwrap();
        add_member(&store, "/svc", 1111);
        let (tx, mut rx) = mpsc::channel(16);
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(watcher(&store, "/svc", fast_retry(None)).run(tx, cancel.clone()));
        assert_eq!(ports(&next_snapshot(&mut rx).await), vec![1111]);

        store.disconnect();
        tokio::time::sleep(Duration::from_millis(50)).await;
        store.reconnect();
        add_member(&store, "/svc", 2222);

        assert_eq!(ports(&next_snapshot(&mut rx).await), vec![1111, 2222]);

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_watcher_escalates_when_retries_run_out() {
        let store = MemoryStore::new();
        store.create_all("/svc").unwrap();
        let (tx, mut rx) = mpsc::channel(16);
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(watcher(&store, "/svc", fast_retry(Some(3))).run(tx, cancel));
        next_snapshot(&mut rx).await;

        store.disconnect();
        match tokio::time::timeout(Duration::from_secs(2), rx.recv()).await {
            Ok(Some(SourceUpdate::Fatal { root, error })) => {
                assert_eq!(root, "/svc");
                assert!(matches!(error, DiscoveryError::ConnectionFatal { attempts: 3, .. }));
            }
            other => panic!("expected a fatal update, got {:?}", other),
        }
        handle.await.unwrap();
    }
}
