//! Error types for the RPC session pool.
//!
//! This module defines the pool and registry errors using `thiserror`. Errors raised
//! by the RPC client itself are carried through unchanged in [`PoolError::Remote`], so
//! a caller always observes exactly what its remote call produced.

use crate::client::RpcError;
use crate::pool::PoolState;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PoolError {
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    #[error("Pool '{pool}' is exhausted: no session available")]
    Exhausted { pool: String },

    #[error("Timeout: no session available in pool '{pool}' after {waited_ms}ms")]
    Timeout { pool: String, waited_ms: u64 },

    #[error("Pool '{pool}' is not accepting checkouts (state: {state})")]
    Closed { pool: String, state: PoolState },

    #[error("'{operation}' is not available outside of a checkout scope")]
    StaleHandle { operation: String },

    #[error(transparent)]
    Remote(#[from] RpcError),
}

impl PoolError {
    /// Create a configuration error.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create an exhausted error for a non-blocking fetch.
    pub fn exhausted(pool: impl Into<String>) -> Self {
        Self::Exhausted { pool: pool.into() }
    }

    /// Create a timeout error for a blocking fetch.
    pub fn timeout(pool: impl Into<String>, waited: std::time::Duration) -> Self {
        Self::Timeout {
            pool: pool.into(),
            waited_ms: u64::try_from(waited.as_millis()).unwrap_or(u64::MAX),
        }
    }

    /// Create a closed-pool error.
    pub fn closed(pool: impl Into<String>, state: PoolState) -> Self {
        Self::Closed {
            pool: pool.into(),
            state,
        }
    }

    /// Create a stale handle error naming the rejected operation.
    pub fn stale_handle(operation: impl Into<String>) -> Self {
        Self::StaleHandle {
            operation: operation.into(),
        }
    }

    /// The RPC error behind this error, if it came from the session layer.
    pub fn as_remote(&self) -> Option<&RpcError> {
        match self {
            Self::Remote(err) => Some(err),
            _ => None,
        }
    }

    /// Check if retrying the same operation later may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Exhausted { .. } | Self::Timeout { .. } => true,
            Self::Remote(err) => err.fault().is_some(),
            _ => false,
        }
    }
}

/// Result type alias for pool operations.
pub type PoolResult<T> = Result<T, PoolError>;
