//! Serverset service discovery over a watch-based coordination store
//!
//! Services register themselves as ephemeral member nodes somewhere below a
//! configured root path. This crate keeps an in-memory mirror of every root's
//! subtree and turns it into target groups:
//! - Decode the JSON payload of each member node
//! - Keep exactly one single-fire watch per known path, re-armed on every
//!   notification
//! - Follow containers and members appearing and disappearing at any depth
//! - Resynchronize from scratch after connection loss, with backoff
//! - Deliver the complete target group of a source every time it changes
//!
//! # Architecture
//!
//! One [`TreeWatcher`] task per root owns that root's [`Tree`] and reports
//! [`SubtreeSnapshot`]s to the [`DiscoveryCoordinator`], which keeps the set
//! of live sources and forwards [`TargetGroup`](serverset_core::TargetGroup)s
//! to the consumer. The store itself sits behind the [`CoordinationStore`]
//! trait; [`MemoryStore`] implements it in memory.
//!
//! # Example
//!
//! ```no_run
//! use serverset_discovery::{DiscoveryCoordinator, MemoryStore, ServersetConfig};
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = ServersetConfig::new(["zk1:2181"], ["/aurora/prod/web"]);
//!     let coordinator = DiscoveryCoordinator::new(config, Arc::new(MemoryStore::new()))?;
//!
//!     let (tx, rx) = async_channel::bounded(16);
//!     let handle = coordinator.start(tx, CancellationToken::new())?;
//!
//!     while let Ok(group) = rx.recv().await {
//!         println!("{}: {:?}", group.source, group.addresses());
//!     }
//!
//!     coordinator.stop();
//!     handle.await??;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod member;
pub mod metrics;
pub mod node;
pub mod service;
pub mod store;
pub mod tree;
pub mod types;

pub use config::{RetryConfig, ServersetConfig};
pub use error::{DiscoveryError, Result};
pub use member::{Endpoint, MemberStatus, ServersetMember};
pub use metrics::DiscoveryMetrics;
pub use service::DiscoveryCoordinator;
pub use store::{CoordinationStore, CreateMode, MemoryStore, StoreError, WatchEvent, WatchEventKind};
pub use tree::{Tree, TreeWatcher, WatcherSettings};
pub use types::{SourceUpdate, SubtreeSnapshot};
