//! Path Watch Node: one watched path, its last known listing and the single
//! watch registered on it.
//!
//! A node moves through `Unwatched -> Watching -> PendingRefresh -> Watching`.
//! Listing the path and registering the next watch happen in one store
//! operation, so no change can slip in between consuming a notification and
//! re-arming.

use crate::member::ServersetMember;
use crate::store::{bounded, CoordinationStore, StoreError, StoreResult, Watch, WatchEventKind};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tracing::trace;

/// Watch registration state of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchState {
    /// No watch registered
    Unwatched,
    /// A watch is outstanding
    Watching,
    /// The watch fired and the path must be listed again
    PendingRefresh,
}

/// What a path holds in the serverset tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    /// Any non-member path; watched for child changes
    Container,
    /// An ephemeral member node; watched for data changes
    Member,
}

/// A notification forwarded from the store, tagged with the generation of
/// the watch that produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fired {
    pub path: String,
    pub generation: u64,
    pub kind: WatchEventKind,
}

/// Result of listing a path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Listing {
    /// Child names of a container
    Children(BTreeSet<String>),
    /// Payload of a member
    Data(Vec<u8>),
    /// The path does not exist
    Absent,
}

/// Everything a node needs to register watches: the store, the queue fired
/// notifications go to, and the generation counter shared by one tree watcher.
#[derive(Clone)]
pub struct WatchContext {
    pub store: Arc<dyn CoordinationStore>,
    pub events: mpsc::UnboundedSender<Fired>,
    pub timeout: Duration,
    generations: Arc<AtomicU64>,
}

impl WatchContext {
    pub fn new(
        store: Arc<dyn CoordinationStore>,
        events: mpsc::UnboundedSender<Fired>,
        timeout: Duration,
    ) -> Self {
        Self {
            store,
            events,
            timeout,
            generations: Arc::new(AtomicU64::new(0)),
        }
    }

    fn next_generation(&self) -> u64 {
        self.generations.fetch_add(1, Ordering::Relaxed) + 1
    }
}

/// Aborts the task forwarding a watch when dropped, which drops the watch.
#[derive(Debug)]
struct WatchGuard(AbortHandle);

impl Drop for WatchGuard {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// One watched path.
#[derive(Debug)]
pub struct PathNode {
    pub path: String,
    pub kind: NodeKind,
    pub parent: Option<String>,
    /// Child names last listed (containers only)
    pub children: BTreeSet<String>,
    /// Last successfully decoded payload (members only)
    pub member: Option<ServersetMember>,
    pub exists: bool,
    state: WatchState,
    generation: u64,
    guard: Option<WatchGuard>,
}

impl PathNode {
    pub fn new(path: impl Into<String>, kind: NodeKind, parent: Option<String>) -> Self {
        Self {
            path: path.into(),
            kind,
            parent,
            children: BTreeSet::new(),
            member: None,
            exists: false,
            state: WatchState::Unwatched,
            generation: 0,
            guard: None,
        }
    }

    pub fn state(&self) -> WatchState {
        self.state
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn is_root(&self) -> bool {
        self.parent.is_none()
    }

    /// Lists the path and registers the next watch on it.
    ///
    /// Containers register a children watch and members a data watch. A
    /// missing path returns [`Listing::Absent`]: a root then keeps an exists
    /// watch to learn about its recreation, any other node stays unwatched
    /// because its parent's children watch covers it.
    pub async fn refresh(&mut self, ctx: &WatchContext) -> StoreResult<Listing> {
        let store = ctx.store.as_ref();
        loop {
            let result = match self.kind {
                NodeKind::Container => {
                    bounded(ctx.timeout, "children_watch", &self.path, store.children_watch(&self.path))
                        .await
                        .map(|(children, watch)| (Listing::Children(children.into_iter().collect()), watch))
                }
                NodeKind::Member => {
                    bounded(ctx.timeout, "get_watch", &self.path, store.get_watch(&self.path))
                        .await
                        .map(|(data, watch)| (Listing::Data(data), watch))
                }
            };

            match result {
                Ok((listing, watch)) => {
                    self.exists = true;
                    self.arm(watch, ctx);
                    return Ok(listing);
                }
                Err(StoreError::NoNode { .. }) => {
                    self.exists = false;
                    if !self.is_root() {
                        self.abandon();
                        return Ok(Listing::Absent);
                    }

                    let (exists, watch) =
                        bounded(ctx.timeout, "exists_watch", &self.path, store.exists_watch(&self.path))
                            .await?;
                    if exists {
                        // recreated between the two calls
                        drop(watch);
                        continue;
                    }
                    self.arm(watch, ctx);
                    return Ok(Listing::Absent);
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Marks the outstanding watch as consumed. Returns false for
    /// notifications of a watch this node no longer holds.
    pub fn consume(&mut self, fired: &Fired) -> bool {
        if self.state != WatchState::Watching || fired.generation != self.generation {
            return false;
        }
        self.state = WatchState::PendingRefresh;
        self.guard = None;
        true
    }

    /// Drops the outstanding watch, if any.
    pub fn abandon(&mut self) {
        self.guard = None;
        self.state = WatchState::Unwatched;
    }

    fn arm(&mut self, watch: Watch, ctx: &WatchContext) {
        let generation = ctx.next_generation();
        let events = ctx.events.clone();
        let path = self.path.clone();

        let task = tokio::spawn(async move {
            let event = watch.fired().await;
            trace!(path = %path, kind = ?event.kind, generation, "Watch fired");
            let _ = events.send(Fired {
                path,
                generation,
                kind: event.kind,
            });
        });

        self.guard = Some(WatchGuard(task.abort_handle()));
        self.generation = generation;
        self.state = WatchState::Watching;
    }
}
