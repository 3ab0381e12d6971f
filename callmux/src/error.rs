//! Error types for the call engine.
//!
//! Two layers of failure exist:
//! - [`CallError`]: one call failed. Recoverable; it degrades a single peer
//!   entry or a single handler and is never escalated.
//! - [`EngineError`]: the engine itself cannot continue (queue torn down,
//!   broken tag bookkeeping). Propagated to the caller of the dispatch or the
//!   multiplex loop.

use serde::{Deserialize, Serialize};

use crate::tag::CallTag;

/// Failure outcome of a single remote call.
///
/// Serializable so a transport can carry it back to the caller, the same way
/// a reply payload would be carried.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CallError {
    /// The call was cancelled by the peer or the substrate.
    Cancelled,

    /// No peer is reachable under the requested identity.
    Unavailable,

    /// The call's deadline expired before a reply arrived.
    DeadlineExceeded,

    /// The peer has nothing for the requested item.
    NotFound,

    /// The transport failed to carry the request or the reply.
    Transport {
        /// Human-readable error message.
        message: String,
    },

    /// The peer failed while computing the reply.
    Internal {
        /// Human-readable error message.
        message: String,
    },
}

impl CallError {
    /// Shorthand for a [`CallError::Transport`] failure.
    pub fn transport(message: impl Into<String>) -> Self {
        CallError::Transport {
            message: message.into(),
        }
    }

    /// Shorthand for a [`CallError::Internal`] failure.
    pub fn internal(message: impl Into<String>) -> Self {
        CallError::Internal {
            message: message.into(),
        }
    }
}

impl std::fmt::Display for CallError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CallError::Cancelled => write!(f, "call cancelled"),
            CallError::Unavailable => write!(f, "peer unavailable"),
            CallError::DeadlineExceeded => write!(f, "deadline exceeded"),
            CallError::NotFound => write!(f, "not found"),
            CallError::Transport { message } => write!(f, "transport error: {}", message),
            CallError::Internal { message } => write!(f, "internal error: {}", message),
        }
    }
}

impl std::error::Error for CallError {}

/// Errors that stop a dispatch or a multiplex loop.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// The completion queue was shut down while work was still expected on it.
    #[error("completion queue shut down")]
    QueueShutdown,

    /// A completion arrived for a tag nobody is waiting on.
    #[error("unknown call tag: {tag}")]
    UnknownTag {
        /// The orphaned tag.
        tag: CallTag,
    },

    /// A tag was registered twice on the same queue.
    #[error("duplicate call tag: {tag}")]
    DuplicateTag {
        /// The reused tag.
        tag: CallTag,
    },

    /// A handler received an event its current state cannot accept.
    #[error("unexpected event for {tag} in state {state}")]
    UnexpectedEvent {
        /// Tag of the handler.
        tag: CallTag,
        /// Name of the state the handler was in.
        state: &'static str,
    },

    /// No completion arrived within the configured stall timeout.
    #[error("dispatch stalled with {pending} calls pending")]
    Stalled {
        /// Number of calls still outstanding.
        pending: usize,
    },

    /// The multiplexer left the one-acceptor invariant.
    #[error("acceptance capacity broken: {accepting} handlers accepting")]
    AcceptCapacity {
        /// Number of handlers found in the accepting state.
        accepting: usize,
    },

    /// The substrate refused a new acceptor and will deliver no more calls.
    #[error("substrate closed")]
    SubstrateClosed,

    /// `serve` was called on a multiplexer that already served.
    #[error("multiplexer already serving")]
    AlreadyServing,

    /// A multiplexer worker task panicked or was aborted.
    #[error("multiplexer worker failed: {message}")]
    WorkerPanicked {
        /// Details from the join error.
        message: String,
    },
}
