//! Core data model: coordination-store ensembles, discovery sources and the
//! target groups handed to the downstream consumer.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Label carrying the `host:port` of a member's primary service endpoint.
pub const ADDRESS_LABEL: &str = "address";

/// Prefix of every auxiliary label derived from a serverset member.
pub const META_LABEL_PREFIX: &str = "__meta_serverset_";

/// A set of labels describing one target.
pub type LabelSet = BTreeMap<String, String>;

/// One logical coordination-store cluster.
///
/// Immutable after construction; shared by every [`Source`] of a discovery
/// instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerEnsemble {
    servers: Vec<String>,
    timeout: Duration,
}

impl ServerEnsemble {
    /// Creates an ensemble from its ordered server addresses and request timeout.
    pub fn new(servers: Vec<String>, timeout: Duration) -> Self {
        Self { servers, timeout }
    }

    /// Ordered store-server addresses.
    pub fn servers(&self) -> &[String] {
        &self.servers
    }

    /// Upper bound applied to every store operation.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

impl fmt::Display for ServerEnsemble {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.servers.join(","))
    }
}

/// A configured `(ensemble, root path)` pair. The root path is the unique key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Source {
    pub ensemble: Arc<ServerEnsemble>,
    pub root: String,
}

impl Source {
    pub fn new(ensemble: Arc<ServerEnsemble>, root: impl Into<String>) -> Self {
        Self {
            ensemble,
            root: root.into(),
        }
    }
}

/// The complete current target set of one source.
///
/// A consumer replaces whatever it knew about `source` with `targets`
/// wholesale; a group is never a partial diff.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetGroup {
    /// Identifier of the source, the configured root path
    pub source: String,

    /// One label set per live member, ordered by member path
    pub targets: Vec<LabelSet>,
}

impl TargetGroup {
    /// Creates a target group for `source`.
    pub fn new(source: impl Into<String>, targets: Vec<LabelSet>) -> Self {
        Self {
            source: source.into(),
            targets,
        }
    }

    /// Returns true if the source currently has no live members.
    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }

    /// Returns the `address` label of every target, in target order.
    pub fn addresses(&self) -> Vec<&str> {
        self.targets
            .iter()
            .filter_map(|labels| labels.get(ADDRESS_LABEL).map(String::as_str))
            .collect()
    }
}
