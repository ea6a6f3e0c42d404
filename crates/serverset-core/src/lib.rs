//! # serverset-core
//!
//! Core types, error handling, and configuration for serverset discovery.
//!
//! - **Types**: `ServerEnsemble`, `Source` and the `TargetGroup` snapshots
//!   emitted to downstream consumers.
//! - **Errors**: configuration errors using `thiserror`.
//! - **Configuration**: YAML files with environment variable overrides and
//!   validation.
//!
//! ## Example
//!
//! ```
//! use serverset_core::config::ServersetConfig;
//!
//! let config = ServersetConfig::new(["zk1:2181"], ["/aurora/prod"]);
//! assert!(config.validate().is_ok());
//! assert_eq!(config.ensemble().servers(), &["zk1:2181".to_string()]);
//! ```

pub mod config;
pub mod error;
pub mod types;

// Re-export commonly used types for convenience
pub use config::{AppConfig, LogFormat, LoggingConfig, RetryConfig, ServersetConfig};
pub use error::{ConfigError, Result, ServersetError};
pub use types::{LabelSet, ServerEnsemble, Source, TargetGroup, ADDRESS_LABEL, META_LABEL_PREFIX};
