//! Configuration types for serverset discovery
//!
//! Re-exports configuration from serverset-core so the binary and the engine
//! share one definition

pub use serverset_core::config::{RetryConfig, ServersetConfig};
