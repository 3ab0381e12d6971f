//! In-process call substrate.
//!
//! Requests and replies are handed over as values, without serialization.
//! A [`MemoryNetwork`] maps peer identities to [`MemoryServer`]s; the network
//! is the outbound side used by the fan-out dispatcher and each server is the
//! inbound side used by a multiplexer.
//!
//! # Characteristics
//!
//! - A call arriving while an acceptor is registered is handed to it at once
//! - Otherwise the call waits in a backlog (optionally bounded) until the next
//!   acceptor registers; such arrivals are counted, since they mean callers
//!   outpaced the serving side
//! - Replies are routed back to the caller by a closure captured at issue
//!   time and keyed by the acceptor's queue and tag, so each reply reaches
//!   exactly one caller even when several multiplexers share a server
//! - Once closed, the server refuses new acceptors with
//!   [`EngineError::SubstrateClosed`]
//!
//! # Usage
//!
//! ```ignore
//! let server = Arc::new(MemoryServer::new());
//! let network = MemoryNetwork::new();
//! network.bind(PeerId::from("Amazon"), Arc::clone(&server));
//!
//! let mux = Arc::new(Multiplexer::new(Arc::clone(&server), service));
//! let fan_out = FanOut::new(network);
//! ```

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::oneshot;

use crate::error::{CallError, EngineError};
use crate::peer::PeerId;
use crate::queue::CompletionSender;
use crate::tag::CallTag;

use super::{InboundSubstrate, OutboundSubstrate, ServerEvent};

/// Delivers a reply to whoever issued the call.
type ReplyRoute<Resp> = Box<dyn FnOnce(Result<Resp, CallError>) -> Result<(), CallError> + Send>;

/// Reply routes are addressed by the acceptor's queue and tag; tags alone
/// repeat across multiplexers.
type RouteKey = (u64, CallTag);

/// Configuration for a [`MemoryServer`].

#[derive(Clone, Debug, Default)]
pub struct MemoryServerConfig {
    /// Maximum number of calls waiting for an acceptor.
    /// None means unbounded.
    pub max_backlog: Option<usize>,
}

impl MemoryServerConfig {
    /// Bound the backlog; calls beyond it are refused with
    /// [`CallError::Unavailable`].
    pub fn with_max_backlog(mut self, max_backlog: usize) -> Self {
        self.max_backlog = Some(max_backlog);
        self
    }
}

/// Counters kept by a [`MemoryServer`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MemoryServerStats {
    /// Calls that reached the server.
    pub calls_received: u64,

    /// Calls handed to an acceptor.
    pub calls_dispatched: u64,

    /// Calls that arrived while no acceptor was registered, whether they
    /// then waited in the backlog or were refused.
    pub arrivals_without_acceptor: u64,

    /// Calls refused (full backlog or closed server).
    pub calls_rejected: u64,

    /// Replies routed back to their caller.
    pub replies_routed: u64,

    /// Replies that could not be routed.
    pub replies_failed: u64,
}

struct InboundCall<Req, Resp> {
    request: Req,
    reply: ReplyRoute<Resp>,
}

struct Acceptor<Req> {
    tag: CallTag,
    completions: CompletionSender<ServerEvent<Req>>,
}

impl<Req> Acceptor<Req> {
    fn route_key(&self) -> RouteKey {
        (self.completions.queue_id(), self.tag)
    }
}

struct ServerState<Req, Resp> {
    acceptors: VecDeque<Acceptor<Req>>,
    backlog: VecDeque<InboundCall<Req, Resp>>,
    in_flight: HashMap<RouteKey, ReplyRoute<Resp>>,
    closed: bool,
    stats: MemoryServerStats,
}

/// Result of trying to hand a call to a registered acceptor.
enum Handoff<Req, Resp> {
    Dispatched,
    NoAcceptor(InboundCall<Req, Resp>),
    Refused(ReplyRoute<Resp>),
}

/// Inbound side of the in-process substrate.
pub struct MemoryServer<Req, Resp> {
    config: MemoryServerConfig,
    state: Mutex<ServerState<Req, Resp>>,
}

impl<Req, Resp> Default for MemoryServer<Req, Resp>
where
    Req: Send + 'static,
    Resp: Send + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<Req, Resp> MemoryServer<Req, Resp>
where
    Req: Send + 'static,
    Resp: Send + 'static,
{
    /// Create a server with an unbounded backlog.
    pub fn new() -> Self {
        Self::with_config(MemoryServerConfig::default())
    }

    /// Create a server with the given configuration.
    pub fn with_config(config: MemoryServerConfig) -> Self {
        Self {
            config,
            state: Mutex::new(ServerState {
                acceptors: VecDeque::new(),
                backlog: VecDeque::new(),
                in_flight: HashMap::new(),
                closed: false,
                stats: MemoryServerStats::default(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ServerState<Req, Resp>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Hand `call` to the oldest usable acceptor.
    fn hand_off(
        state: &mut ServerState<Req, Resp>,
        call: InboundCall<Req, Resp>,
    ) -> Handoff<Req, Resp> {
        while let Some(acceptor) = state.acceptors.pop_front() {
            if !acceptor.completions.is_open() {
                continue;
            }
            return Self::accept(state, acceptor, call);
        }
        Handoff::NoAcceptor(call)
    }

    fn accept(
        state: &mut ServerState<Req, Resp>,
        acceptor: Acceptor<Req>,
        call: InboundCall<Req, Resp>,
    ) -> Handoff<Req, Resp> {
        let key = acceptor.route_key();
        state.in_flight.insert(key, call.reply);
        let pushed = acceptor
            .completions
            .succeed(acceptor.tag, ServerEvent::Accepted(call.request));
        match pushed {
            Ok(()) => {
                state.stats.calls_dispatched += 1;
                Handoff::Dispatched
            }
            Err(_) => match state.in_flight.remove(&key) {
                Some(reply) => Handoff::Refused(reply),
                None => Handoff::Dispatched,
            },
        }
    }

    /// Deliver an inbound call whose reply is sent through `reply`.
    fn deliver(&self, request: Req, reply: ReplyRoute<Resp>) {
        let refused = {
            let mut state = self.lock();
            state.stats.calls_received += 1;
            if state.closed {
                state.stats.calls_rejected += 1;
                Some(reply)
            } else {
                match Self::hand_off(&mut state, InboundCall { request, reply }) {
                    Handoff::Dispatched => None,
                    Handoff::Refused(reply) => {
                        state.stats.calls_rejected += 1;
                        Some(reply)
                    }
                    Handoff::NoAcceptor(call) => {
                        state.stats.arrivals_without_acceptor += 1;
                        let full = self
                            .config
                            .max_backlog
                            .is_some_and(|max| state.backlog.len() >= max);
                        if full {
                            state.stats.calls_rejected += 1;
                            Some(call.reply)
                        } else {
                            state.backlog.push_back(call);
                            None
                        }
                    }
                }
            }
        };

        if let Some(reply) = refused {
            tracing::debug!("inbound call refused");
            let _ = reply(Err(CallError::Unavailable));
        }
    }

    /// Submit a call directly, bypassing any network.
    ///
    /// The receiver resolves with the reply once a handler has answered.
    pub fn submit(&self, request: Req) -> oneshot::Receiver<Result<Resp, CallError>> {
        let (tx, rx) = oneshot::channel();
        self.deliver(
            request,
            Box::new(move |reply| {
                tx.send(reply)
                    .map_err(|_| CallError::transport("caller dropped the reply channel"))
            }),
        );
        rx
    }

    /// Refuse new calls, cancel registered acceptors and fail the backlog.
    pub fn close(&self) {
        let (acceptors, backlog) = {
            let mut state = self.lock();
            state.closed = true;
            let acceptors: Vec<_> = state.acceptors.drain(..).collect();
            let backlog: Vec<_> = state.backlog.drain(..).collect();
            state.stats.calls_rejected += backlog.len() as u64;
            (acceptors, backlog)
        };

        for acceptor in acceptors {
            let _ = acceptor.completions.fail(acceptor.tag, CallError::Cancelled);
        }
        for call in backlog {
            let _ = (call.reply)(Err(CallError::Unavailable));
        }
    }

    /// Whether [`close`](Self::close) has been called.
    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Acceptors currently registered and waiting for a call.
    pub fn registered_acceptors(&self) -> usize {
        self.lock().acceptors.len()
    }

    /// Calls waiting for an acceptor.
    pub fn backlog_len(&self) -> usize {
        self.lock().backlog.len()
    }

    /// Calls handed to an acceptor and not yet answered.
    pub fn in_flight(&self) -> usize {
        self.lock().in_flight.len()
    }

    /// Snapshot of the counters.
    pub fn stats(&self) -> MemoryServerStats {
        self.lock().stats.clone()
    }
}

impl<Req, Resp> InboundSubstrate for MemoryServer<Req, Resp>
where
    Req: Send + 'static,
    Resp: Send + 'static,
{
    type Request = Req;
    type Response = Resp;

    fn register_acceptor(
        &self,
        tag: CallTag,
        completions: &CompletionSender<ServerEvent<Req>>,
    ) -> Result<(), EngineError> {
        let refused = {
            let mut state = self.lock();
            if state.closed {
                return Err(EngineError::SubstrateClosed);
            }
            let acceptor = Acceptor {
                tag,
                completions: completions.clone(),
            };
            match state.backlog.pop_front() {
                Some(call) => match Self::accept(&mut state, acceptor, call) {
                    Handoff::Refused(reply) => {
                        state.stats.calls_rejected += 1;
                        Some(reply)
                    }
                    Handoff::Dispatched | Handoff::NoAcceptor(_) => None,
                },
                None => {
                    state.acceptors.push_back(acceptor);
                    None
                }
            }
        };

        if let Some(reply) = refused {
            let _ = reply(Err(CallError::Unavailable));
        }
        Ok(())
    }

    fn respond_async(
        &self,
        tag: CallTag,
        reply: Result<Resp, CallError>,
        completions: &CompletionSender<ServerEvent<Req>>,
    ) {
        let route = self
            .lock()
            .in_flight
            .remove(&(completions.queue_id(), tag));
        let delivered = match route {
            Some(route) => route(reply),
            None => Err(CallError::transport(format!("no inbound call for {tag}"))),
        };

        {
            let mut state = self.lock();
            match delivered {
                Ok(()) => state.stats.replies_routed += 1,
                Err(_) => state.stats.replies_failed += 1,
            }
        }

        let pushed = match delivered {
            Ok(()) => completions.succeed(tag, ServerEvent::Delivered),
            Err(error) => completions.fail(tag, error),
        };
        if pushed.is_err() {
            tracing::debug!(%tag, "server queue closed before delivery report");
        }
    }
}

struct NetworkState<Req, Resp> {
    servers: HashMap<PeerId, Arc<MemoryServer<Req, Resp>>>,
    failing: HashMap<PeerId, CallError>,
}

/// Outbound side of the in-process substrate: a peer directory.
///
/// Several peers may be bound to the same server.
pub struct MemoryNetwork<Req, Resp> {
    state: Arc<Mutex<NetworkState<Req, Resp>>>,
}

impl<Req, Resp> Clone for MemoryNetwork<Req, Resp> {
    fn clone(&self) -> Self {
        Self {
            state: Arc::clone(&self.state),
        }
    }
}

impl<Req, Resp> Default for MemoryNetwork<Req, Resp>
where
    Req: Send + 'static,
    Resp: Send + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<Req, Resp> MemoryNetwork<Req, Resp>
where
    Req: Send + 'static,
    Resp: Send + 'static,
{
    /// Create an empty network.
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(NetworkState {
                servers: HashMap::new(),
                failing: HashMap::new(),
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, NetworkState<Req, Resp>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Route calls for `peer` to `server`.
    pub fn bind(&self, peer: PeerId, server: Arc<MemoryServer<Req, Resp>>) {
        self.lock().servers.insert(peer, server);
    }

    /// Stop routing calls for `peer`; later calls fail with
    /// [`CallError::Unavailable`].
    pub fn unbind(&self, peer: &PeerId) -> Option<Arc<MemoryServer<Req, Resp>>> {
        self.lock().servers.remove(peer)
    }

    /// Make every call to `peer` fail with `error` at the transport.
    pub fn fail_peer(&self, peer: PeerId, error: CallError) {
        self.lock().failing.insert(peer, error);
    }

    /// Undo [`fail_peer`](Self::fail_peer).
    pub fn heal_peer(&self, peer: &PeerId) {
        self.lock().failing.remove(peer);
    }
}

impl<Req, Resp> OutboundSubstrate for MemoryNetwork<Req, Resp>
where
    Req: Send + 'static,
    Resp: Send + 'static,
{
    type Request = Req;
    type Response = Resp;

    fn issue_async(
        &self,
        peer: &PeerId,
        request: Req,
        tag: CallTag,
        completions: &CompletionSender<Resp>,
    ) {
        let target = {
            let state = self.lock();
            match state.failing.get(peer) {
                Some(error) => Err(error.clone()),
                None => state
                    .servers
                    .get(peer)
                    .cloned()
                    .ok_or(CallError::Unavailable),
            }
        };

        match target {
            Ok(server) => {
                let completions = completions.clone();
                server.deliver(
                    request,
                    Box::new(move |reply| {
                        completions
                            .complete(tag, reply)
                            .map_err(|_| CallError::transport("caller no longer waiting"))
                    }),
                );
            }
            Err(error) => {
                tracing::debug!(%peer, %tag, %error, "call failed before reaching a server");
                let _ = completions.fail(tag, error);
            }
        }
    }
}
