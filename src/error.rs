//! Error types for the batching layer.

use thiserror::Error;

/// Main error type for submit and transport operations.
///
/// Errors are cloneable so that a single stream failure can terminate
/// every request that was multiplexed onto it.
#[derive(Debug, Clone, Error)]
pub enum Error {
    /// The batch connection was closed, or reclaimed after going idle.
    #[error("connection closed")]
    Closed,

    /// A submit deadline fired before the terminal event arrived.
    ///
    /// The reason distinguishes where the wait was spent:
    /// `"wait sendLoop"` when the entry never reached the send loop,
    /// `"wait recvLoop timeout, timeout=…, send=…, recv=…"` when it was
    /// dispatched but the response did not come back in time.
    #[error("deadline exceeded: {reason}")]
    DeadlineExceeded { reason: String },

    /// The caller went away before a terminal event was delivered.
    #[error("request canceled")]
    Canceled,

    /// Every stream client was skipped during dispatch.
    #[error("no available connections")]
    NoAvailableConnections,

    /// Error surfaced by the underlying transport.
    #[error("transport error: {0}")]
    Transport(String),
}

impl Error {
    pub(crate) fn deadline(reason: impl Into<String>) -> Self {
        Error::DeadlineExceeded {
            reason: reason.into(),
        }
    }

    /// Whether resubmitting may succeed.
    ///
    /// Transport failures and capacity exhaustion are transient: the
    /// stream recovers in the background and capacity frees up as
    /// responses drain. Deadlines and closure are terminal for the caller.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Transport(_) | Error::NoAvailableConnections)
    }
}
