//! Boundary with the call substrate.
//!
//! The substrate is whatever actually moves requests and replies between
//! processes. The engine only needs three primitives from it:
//!
//! - [`OutboundSubstrate::issue_async`]: start a call, report its end later
//! - [`InboundSubstrate::register_acceptor`]: ask for the next inbound call
//! - [`InboundSubstrate::respond_async`]: send a reply, report delivery later
//!
//! Every primitive is fire-and-forget. Outcomes arrive as tagged events on a
//! [`CompletionQueue`](crate::queue::CompletionQueue) through the
//! [`CompletionSender`] handed in by the engine.
//!
//! [`mem`] provides an in-process substrate used by tests and demos.

pub mod mem;

use std::sync::Arc;

use crate::error::{CallError, EngineError};
use crate::peer::PeerId;
use crate::queue::CompletionSender;
use crate::tag::CallTag;

/// Client side of the substrate.
pub trait OutboundSubstrate: Send + Sync {
    /// Request payload sent to a peer.
    type Request: Send;

    /// Reply payload returned by a peer.
    type Response: Send;

    /// Start a call to `peer`. Must not wait for the reply.
    ///
    /// Exactly one completion tagged `tag` must eventually be pushed to
    /// `completions`, carrying the reply or the failure.
    fn issue_async(
        &self,
        peer: &PeerId,
        request: Self::Request,
        tag: CallTag,
        completions: &CompletionSender<Self::Response>,
    );
}

/// Event delivered to a server-side completion queue.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerEvent<Req> {
    /// An inbound call arrived for the acceptor registered under the tag.
    Accepted(Req),

    /// The reply submitted under the tag reached the caller.
    Delivered,
}

/// Server side of the substrate.
pub trait InboundSubstrate: Send + Sync {
    /// Request payload received from callers.
    type Request: Send;

    /// Reply payload sent back to callers.
    type Response: Send;

    /// Deliver the next inbound call as an [`ServerEvent::Accepted`] event
    /// tagged `tag`.
    ///
    /// If the substrate gives up on an acceptor it already holds (for example
    /// because it is shutting down) it pushes a failed completion instead.
    ///
    /// # Errors
    ///
    /// [`EngineError::SubstrateClosed`] if the substrate will never deliver
    /// another call; nothing is pushed for `tag` in that case.
    fn register_acceptor(
        &self,
        tag: CallTag,
        completions: &CompletionSender<ServerEvent<Self::Request>>,
    ) -> Result<(), EngineError>;

    /// Send the reply for the call accepted under `tag`.
    ///
    /// Pushes [`ServerEvent::Delivered`] once the caller has it, or a failed
    /// completion if the reply could not be delivered.
    fn respond_async(
        &self,
        tag: CallTag,
        reply: Result<Self::Response, CallError>,
        completions: &CompletionSender<ServerEvent<Self::Request>>,
    );
}

impl<S: OutboundSubstrate + ?Sized> OutboundSubstrate for Arc<S> {
    type Request = S::Request;
    type Response = S::Response;

    fn issue_async(
        &self,
        peer: &PeerId,
        request: Self::Request,
        tag: CallTag,
        completions: &CompletionSender<Self::Response>,
    ) {
        (**self).issue_async(peer, request, tag, completions);
    }
}

impl<S: InboundSubstrate + ?Sized> InboundSubstrate for Arc<S> {
    type Request = S::Request;
    type Response = S::Response;

    fn register_acceptor(
        &self,
        tag: CallTag,
        completions: &CompletionSender<ServerEvent<Self::Request>>,
    ) -> Result<(), EngineError> {
        (**self).register_acceptor(tag, completions)
    }

    fn respond_async(
        &self,
        tag: CallTag,
        reply: Result<Self::Response, CallError>,
        completions: &CompletionSender<ServerEvent<Self::Request>>,
    ) {
        (**self).respond_async(tag, reply, completions);
    }
}
