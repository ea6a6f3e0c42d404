//! Discovery coordinator
//!
//! Fans the configured roots out to one tree watcher each, merges their
//! snapshots, and delivers a complete [`TargetGroup`] to the consumer every
//! time one source changes. The coordinator's event loop is the only writer
//! of the source registry and of the per-source snapshots.

use crate::error::{DiscoveryError, Result};
use crate::metrics::DiscoveryMetrics;
use crate::store::CoordinationStore;
use crate::tree::{TreeWatcher, WatcherSettings};
use crate::types::{SourceUpdate, SubtreeSnapshot};
use async_channel::Sender;
use dashmap::DashSet;
use serverset_core::{ServerEnsemble, ServersetConfig, Source, TargetGroup};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Watches every configured serverset root on one ensemble.
pub struct DiscoveryCoordinator {
    /// Configuration
    config: ServersetConfig,

    /// Ensemble shared by all sources
    ensemble: Arc<ServerEnsemble>,

    /// Store client shared by all tree watchers
    store: Arc<dyn CoordinationStore>,

    /// Roots that currently exist
    sources: Arc<DashSet<String>>,

    /// Discovery metrics
    metrics: Arc<DiscoveryMetrics>,

    /// Running state
    running: Arc<AtomicBool>,

    /// Cancelled by [`stop`](Self::stop)
    shutdown: CancellationToken,
}

impl DiscoveryCoordinator {
    /// Creates a coordinator for `config` on top of `store`.
    pub fn new(config: ServersetConfig, store: Arc<dyn CoordinationStore>) -> Result<Self> {
        config.validate()?;
        let ensemble = Arc::new(config.ensemble());

        info!(
            ensemble = %ensemble,
            paths = ?config.paths,
            "Discovery coordinator created"
        );

        Ok(Self {
            config,
            ensemble,
            store,
            sources: Arc::new(DashSet::new()),
            metrics: Arc::new(DiscoveryMetrics::new()),
            running: Arc::new(AtomicBool::new(false)),
            shutdown: CancellationToken::new(),
        })
    }

    /// Configured roots that currently exist, sorted.
    pub fn sources(&self) -> Vec<String> {
        let mut sources: Vec<String> = self.sources.iter().map(|root| root.key().clone()).collect();
        sources.sort();
        sources
    }

    /// Returns whether the event loop is running
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn metrics(&self) -> Arc<DiscoveryMetrics> {
        self.metrics.clone()
    }

    /// Spawns the event loop. Target groups go to `output` until `done` is
    /// cancelled, [`stop`](Self::stop) is called, or a source fails fatally;
    /// the handle resolves with the fatal error in the last case.
    pub fn start(&self, output: Sender<TargetGroup>, done: CancellationToken) -> Result<JoinHandle<Result<()>>> {
        let event_loop = self.event_loop(output, done)?;
        Ok(tokio::spawn(event_loop.run()))
    }

    /// Runs the event loop on the current task. Same contract as
    /// [`start`](Self::start).
    pub async fn run(&self, output: Sender<TargetGroup>, done: CancellationToken) -> Result<()> {
        self.event_loop(output, done)?.run().await
    }

    /// Stops discovery. Idempotent; a stopped coordinator cannot be started
    /// again.
    pub fn stop(&self) {
        if !self.shutdown.is_cancelled() {
            info!("Stopping discovery coordinator");
            self.shutdown.cancel();
        }
    }

    fn event_loop(&self, output: Sender<TargetGroup>, done: CancellationToken) -> Result<EventLoop> {
        if self.shutdown.is_cancelled() {
            return Err(DiscoveryError::Stopped);
        }
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(DiscoveryError::AlreadyStarted);
        }

        Ok(EventLoop {
            config: self.config.clone(),
            ensemble: self.ensemble.clone(),
            store: self.store.clone(),
            sources: self.sources.clone(),
            metrics: self.metrics.clone(),
            running: self.running.clone(),
            shutdown: self.shutdown.clone(),
            done,
            output,
            snapshots: HashMap::new(),
        })
    }
}

impl Drop for DiscoveryCoordinator {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

struct EventLoop {
    config: ServersetConfig,
    ensemble: Arc<ServerEnsemble>,
    store: Arc<dyn CoordinationStore>,
    sources: Arc<DashSet<String>>,
    metrics: Arc<DiscoveryMetrics>,
    running: Arc<AtomicBool>,
    shutdown: CancellationToken,
    done: CancellationToken,
    output: Sender<TargetGroup>,
    snapshots: HashMap<String, SubtreeSnapshot>,
}

impl EventLoop {
    async fn run(mut self) -> Result<()> {
        let cancel = self.shutdown.child_token();
        let (updates_tx, mut updates) = mpsc::channel(self.config.queue_depth);

        let mut watchers = JoinSet::new();
        for root in &self.config.paths {
            let watcher = TreeWatcher::new(
                Source::new(self.ensemble.clone(), root.clone()),
                self.store.clone(),
                WatcherSettings::from(&self.config),
                self.metrics.clone(),
            );
            watchers.spawn(watcher.run(updates_tx.clone(), cancel.clone()));
        }
        drop(updates_tx);

        info!(
            ensemble = %self.ensemble,
            sources = self.config.paths.len(),
            "Discovery coordinator started"
        );

        let result = loop {
            let update = tokio::select! {
                biased;
                _ = self.done.cancelled() => break Ok(()),
                _ = self.shutdown.cancelled() => break Ok(()),
                update = updates.recv() => update,
            };

            match update {
                Some(SourceUpdate::Snapshot(snapshot)) => {
                    let group = self.apply(snapshot);
                    if !self.emit(group).await {
                        break Ok(());
                    }
                }
                Some(SourceUpdate::Fatal { root, error }) => {
                    error!(root = %root, error = %error, "Discovery halted");
                    break Err(error);
                }
                None => {
                    warn!("All tree watchers exited");
                    break Ok(());
                }
            }
        };

        cancel.cancel();
        while watchers.join_next().await.is_some() {}
        self.store.close().await;

        self.sources.clear();
        self.metrics.set_sources(0);
        self.running.store(false, Ordering::SeqCst);
        info!("Discovery coordinator stopped");

        result
    }

    /// Records a new snapshot and returns the target group to deliver.
    fn apply(&mut self, snapshot: SubtreeSnapshot) -> TargetGroup {
        let root = snapshot.root.clone();

        if snapshot.root_exists {
            if self.sources.insert(root.clone()) {
                info!(root = %root, "Source appeared");
            }
        } else if self.sources.remove(&root).is_some() {
            info!(root = %root, "Source vanished");
        }
        self.metrics.set_sources(self.sources.len());

        let (added, removed) = snapshot.member_changes(self.snapshots.get(&root));
        debug!(
            root = %root,
            members = snapshot.members.len(),
            added,
            removed,
            "Source updated"
        );

        let group = snapshot.target_group();
        self.snapshots.insert(root, snapshot);
        group
    }

    /// Delivers `group`, blocking until the consumer takes it. Returns false
    /// if discovery ended first.
    async fn emit(&self, group: TargetGroup) -> bool {
        let source = group.source.clone();
        let targets = group.targets.len();

        tokio::select! {
            biased;
            _ = self.done.cancelled() => false,
            _ = self.shutdown.cancelled() => false,
            sent = self.output.send(group) => match sent {
                Ok(()) => {
                    self.metrics.record_target_group(&source);
                    debug!(source = %source, targets, "Delivered target group");
                    true
                }
                Err(_) => {
                    warn!("Target group consumer went away");
                    false
                }
            },
        }
    }
}
