//! Error kinds the engine distinguishes, and their recovery policy.

use thiserror::Error;

/// Errors surfaced by the swap engine and the layers beneath it.
///
/// Each variant carries its own recovery policy: transient chain errors are
/// retried with backoff, permanent ones park the swap for the operator,
/// invariant violations fail the swap immediately.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("transient chain error ({chain}): {message}")]
    TransientChain { chain: &'static str, message: String },

    #[error("permanent chain error ({chain}): {message}")]
    PermanentChain { chain: &'static str, message: String },

    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    #[error("peer unreachable after {attempts} attempts: {url}")]
    PeerUnreachable { url: String, attempts: u32 },

    #[error("reorg rolled back {evidence} on {chain}")]
    ReorgRollback { chain: &'static str, evidence: String },

    #[error("refund unrecoverable: {0}")]
    UnrecoverableRefund(String),

    #[error("unknown swap: {0}")]
    UnknownSwap(String),

    #[error("swap {swap_id} is in state {state}, cannot {operation}")]
    BadState {
        swap_id: String,
        state: String,
        operation: &'static str,
    },

    #[error("state conflict: {0}")]
    StateConflict(String),
}

impl EngineError {
    pub fn invariant(msg: impl Into<String>) -> Self {
        Self::InvariantViolation(msg.into())
    }

    pub fn transient(chain: &'static str, err: impl std::fmt::Display) -> Self {
        Self::TransientChain {
            chain,
            message: err.to_string(),
        }
    }

    pub fn permanent(chain: &'static str, err: impl std::fmt::Display) -> Self {
        Self::PermanentChain {
            chain,
            message: err.to_string(),
        }
    }

    /// True when a retry with backoff may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::TransientChain { .. })
    }
}

pub type EngineResult<T> = Result<T, EngineError>;
