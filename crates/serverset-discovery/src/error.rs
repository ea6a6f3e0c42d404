//! Error types for the discovery engine

use crate::store::StoreError;
use thiserror::Error;

/// Result type alias for discovery operations
pub type Result<T> = std::result::Result<T, DiscoveryError>;

/// Errors that can occur during serverset discovery.
///
/// A vanished path is not an error: it is an ordinary state transition of the
/// watched tree.
#[derive(Debug, Error)]
pub enum DiscoveryError {
    /// A member node's payload does not decode; the member is skipped
    #[error("Malformed serverset member payload: {reason}")]
    MalformedPayload { reason: String },

    /// Network or session hiccup during a store call; retried with backoff
    #[error("Transient store error: {0}")]
    TransientStore(#[from] StoreError),

    /// The store stayed unreachable through every configured retry
    #[error("Lost connection to the coordination store while watching '{root}' after {attempts} attempts: {last_error}")]
    ConnectionFatal {
        root: String,
        attempts: u32,
        last_error: StoreError,
    },

    /// Invalid discovery configuration
    #[error("Invalid discovery configuration: {0}")]
    InvalidConfig(String),

    /// Discovery coordinator already started
    #[error("Discovery coordinator is already running")]
    AlreadyStarted,

    /// Discovery coordinator was stopped and cannot run again
    #[error("Discovery coordinator has been stopped")]
    Stopped,

    /// Internal error
    #[error("Internal discovery error: {0}")]
    Internal(String),

    /// Generic error
    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl DiscoveryError {
    /// Returns true if this error ends discovery for its ensemble.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            DiscoveryError::ConnectionFatal { .. } | DiscoveryError::InvalidConfig(_)
        )
    }
}

impl From<serverset_core::ServersetError> for DiscoveryError {
    fn from(err: serverset_core::ServersetError) -> Self {
        DiscoveryError::InvalidConfig(err.to_string())
    }
}
