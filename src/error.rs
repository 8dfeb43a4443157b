//! Error types for the Smart Cache engine
//!
//! Provides structured error types for every cache component: the codec,
//! both tiers, the circuit breaker, the strategy registry and the
//! background maintainer.

use std::time::Duration;
use thiserror::Error;

/// Unified error type for the cache engine
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Internal Errors
    // =========================================================================
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    // =========================================================================
    // Codec Errors
    // =========================================================================
    #[error("Failed to encode value for key {key}: {reason}")]
    Encode { key: String, reason: String },

    #[error("Failed to decode value for key {key}: {reason}")]
    Decode { key: String, reason: String },

    #[error("Failed to decompress {algorithm} payload: {reason}")]
    Decompress { algorithm: String, reason: String },

    // =========================================================================
    // Remote Tier Errors
    // =========================================================================
    #[error("Remote store unavailable: {0}")]
    RemoteUnavailable(String),

    #[error("Remote operation {operation} timed out after {timeout:?}")]
    Timeout { operation: String, timeout: Duration },

    #[error("Circuit breaker is open, remote call rejected")]
    CircuitOpen,

    // =========================================================================
    // Local Tier Errors
    // =========================================================================
    #[error("Entry {key} of {size} bytes exceeds local tier capacity of {max} bytes")]
    CapacityRejected { key: String, size: u64, max: u64 },

    // =========================================================================
    // Strategy Errors
    // =========================================================================
    #[error("Strategy already registered: {0}")]
    StrategyExists(String),

    // =========================================================================
    // Caller Errors
    // =========================================================================
    #[error("Value computation failed: {0}")]
    Compute(#[from] anyhow::Error),

    // =========================================================================
    // Parse / IO Errors
    // =========================================================================
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Check if this error is transient (the remote tier may recover)
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::RemoteUnavailable(_) | Error::Timeout { .. } | Error::CircuitOpen
        )
    }

    /// Check if the circuit breaker should count this error as a remote failure
    ///
    /// A rejected call never reached the remote store, so `CircuitOpen` is
    /// not counted.
    pub fn counts_as_remote_failure(&self) -> bool {
        matches!(self, Error::RemoteUnavailable(_) | Error::Timeout { .. })
    }

    /// Check if this error comes from a stored payload that cannot be read
    pub fn is_corrupt_payload(&self) -> bool {
        matches!(self, Error::Decode { .. } | Error::Decompress { .. })
    }
}

/// Result type alias for the cache engine
pub type Result<T> = std::result::Result<T, Error>;
