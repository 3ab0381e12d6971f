//! Server-side request multiplexer.
//!
//! A small fixed set of workers drains one shared completion queue. Every
//! inbound call is served by its own [`HandlerState`] machine in an arena keyed
//! by tag; the workers only route events to handlers.
//!
//! # Acceptance capacity
//!
//! While running, exactly one handler is ACCEPTING. When a call arrives the
//! accepting handler moves to PROCESSING and its replacement is inserted in the
//! same arena critical section, then registered with the substrate before the
//! reply is computed. A second call arriving during processing therefore
//! always finds an acceptor.
//!
//! # Shutdown
//!
//! Cancelling the token passed to [`Multiplexer::serve`] stops the workers
//! from waiting for new events. Each worker then processes a bounded number of
//! already-queued events without creating new acceptors, and `serve` returns
//! the final [`MultiplexerStats`].

mod config;
mod handler;
mod stats;

pub use config::MultiplexerConfig;
pub use handler::HandlerState;
pub use stats::MultiplexerStats;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::error::{CallError, EngineError};
use crate::fault::{FaultPolicy, NoFaults};
use crate::providers::{TimeProvider, TokioTimeProvider};
use crate::queue::{Completion, CompletionQueue};
use crate::service::Service;
use crate::substrate::{InboundSubstrate, ServerEvent};
use crate::tag::{CallTag, TagFactory};

use handler::HandlerArena;
use stats::{bump, StatsCounters};

/// Non-blocking server for one kind of inbound call.
pub struct Multiplexer<I, S, T = TokioTimeProvider>
where
    S: Service,
{
    substrate: I,
    service: S,
    faults: Arc<dyn FaultPolicy<S::Request>>,
    time: T,
    config: MultiplexerConfig,
    queue: CompletionQueue<ServerEvent<S::Request>>,
    arena: Mutex<HandlerArena>,
    tags: TagFactory,
    stats: StatsCounters,
    started: AtomicBool,
    shutting_down: AtomicBool,
}

impl<I, S> Multiplexer<I, S, TokioTimeProvider>
where
    I: InboundSubstrate<Request = S::Request, Response = S::Response> + 'static,
    S: Service,
{
    /// Create a multiplexer on the Tokio clock, without fault injection.
    pub fn new(substrate: I, service: S) -> Self {
        Self::with_time(substrate, service, TokioTimeProvider::new())
    }
}

impl<I, S, T> Multiplexer<I, S, T>
where
    I: InboundSubstrate<Request = S::Request, Response = S::Response> + 'static,
    S: Service,
    T: TimeProvider,
{
    /// Create a multiplexer sleeping through `time` for injected delays.
    pub fn with_time(substrate: I, service: S, time: T) -> Self {
        Self {
            substrate,
            service,
            faults: Arc::new(NoFaults),
            time,
            config: MultiplexerConfig::default(),
            queue: CompletionQueue::new(),
            arena: Mutex::new(HandlerArena::new()),
            tags: TagFactory::new(),
            stats: StatsCounters::default(),
            started: AtomicBool::new(false),
            shutting_down: AtomicBool::new(false),
        }
    }

    /// Replace the configuration.
    pub fn with_config(mut self, config: MultiplexerConfig) -> Self {
        self.config = config;
        self
    }

    /// Inject delays and failures decided by `faults`.
    pub fn with_faults(mut self, faults: impl FaultPolicy<S::Request>) -> Self {
        self.faults = Arc::new(faults);
        self
    }

    /// The shared completion queue the workers drain.
    pub fn queue(&self) -> &CompletionQueue<ServerEvent<S::Request>> {
        &self.queue
    }

    /// The substrate calls are accepted from.
    pub fn substrate(&self) -> &I {
        &self.substrate
    }

    /// Counters so far.
    pub fn stats(&self) -> MultiplexerStats {
        let live = self.arena().len();
        self.stats.snapshot(live)
    }

    /// Handlers currently ACCEPTING.
    pub fn accepting_handlers(&self) -> usize {
        self.arena().accepting()
    }

    /// Handlers currently alive in any state.
    pub fn live_handlers(&self) -> usize {
        self.arena().len()
    }

    fn arena(&self) -> MutexGuard<'_, HandlerArena> {
        self.arena.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Acquire)
    }

    /// Next acceptor tag, or None once shutdown started.
    fn replacement_tag(&self) -> Option<CallTag> {
        (!self.is_shutting_down()).then(|| self.tags.next())
    }

    /// Check and record the acceptor count after an arena change.
    fn check_capacity(&self, arena: &HandlerArena) -> Result<(), EngineError> {
        if self.is_shutting_down() {
            return Ok(());
        }
        let accepting = arena.accepting();
        self.stats.observe_accepting(accepting);
        if accepting != 1 {
            tracing::error!(accepting, "acceptance capacity broken");
            return Err(EngineError::AcceptCapacity { accepting });
        }
        Ok(())
    }

    fn register(&self, tag: CallTag) -> Result<(), EngineError> {
        bump(&self.stats.handlers_created);
        if let Err(error) = self.substrate.register_acceptor(tag, &self.queue.sender()) {
            tracing::warn!(%tag, %error, "substrate refused acceptor");
            return Err(error);
        }
        tracing::trace!(%tag, "acceptor registered");
        Ok(())
    }

    /// Serve inbound calls until `shutdown` is cancelled.
    ///
    /// Runs one worker on the calling task, or spawns
    /// [`MultiplexerConfig::workers`] tasks on the current runtime.
    ///
    /// # Errors
    ///
    /// Invariant violations ([`EngineError::UnknownTag`],
    /// [`EngineError::UnexpectedEvent`], [`EngineError::AcceptCapacity`]), the
    /// queue being shut down underneath a running loop, a substrate refusing
    /// acceptors ([`EngineError::SubstrateClosed`]), a failed worker task, or
    /// a second call to `serve`.
    pub async fn serve(
        self: Arc<Self>,
        shutdown: CancellationToken,
    ) -> Result<MultiplexerStats, EngineError> {
        if self.started.swap(true, Ordering::AcqRel) {
            return Err(EngineError::AlreadyServing);
        }

        // cancelled by a failing worker so its siblings stop too
        let token = shutdown.child_token();

        let first = self.tags.next();
        {
            let mut arena = self.arena();
            arena.insert_acceptor(first)?;
            self.check_capacity(&arena)?;
        }

        let workers = self.config.workers.max(1);
        tracing::info!(workers, "multiplexer serving");

        let result = if let Err(error) = self.register(first) {
            Err(error)
        } else if workers == 1 {
            let span = tracing::info_span!("mux_worker", worker = 0);
            self.worker_loop(&token).instrument(span).await
        } else {
            self.run_workers(workers, &token).await
        };

        self.queue.shutdown();
        let stats = self.stats();
        match &result {
            Ok(()) => tracing::info!(?stats, "multiplexer stopped"),
            Err(error) => tracing::error!(%error, "multiplexer failed"),
        }
        result.map(|()| stats)
    }

    async fn run_workers(
        self: &Arc<Self>,
        workers: usize,
        token: &CancellationToken,
    ) -> Result<(), EngineError> {
        let mut set = JoinSet::new();
        for worker in 0..workers {
            let this = Arc::clone(self);
            let token = token.clone();
            let span = tracing::info_span!("mux_worker", worker);
            set.spawn(async move { this.worker_loop(&token).await }.instrument(span));
        }

        let mut first_error = None;
        while let Some(joined) = set.join_next().await {
            let outcome = match joined {
                Ok(outcome) => outcome,
                Err(join_error) => Err(EngineError::WorkerPanicked {
                    message: join_error.to_string(),
                }),
            };
            if let Err(error) = outcome {
                token.cancel();
                first_error.get_or_insert(error);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    async fn worker_loop(&self, shutdown: &CancellationToken) -> Result<(), EngineError> {
        loop {
            let event = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                event = self.queue.next() => event?,
            };
            self.proceed(event).await?;
        }

        self.shutting_down.store(true, Ordering::Release);
        self.flush().await
    }

    /// Process at most `shutdown_flush_iterations` more events.
    async fn flush(&self) -> Result<(), EngineError> {
        for _ in 0..self.config.shutdown_flush_iterations {
            let next = self
                .time
                .timeout(self.config.flush_poll_timeout, self.queue.next())
                .await;
            match next {
                Ok(Ok(event)) => self.proceed(event).await?,
                Ok(Err(_)) | Err(_) => break,
            }
        }
        Ok(())
    }

    /// Route one event to the handler it is tagged for.
    async fn proceed(
        &self,
        event: Completion<ServerEvent<S::Request>>,
    ) -> Result<(), EngineError> {
        let (tag, result) = event.into_parts();
        let state = self.arena().state(tag);
        let Some(state) = state else {
            tracing::error!(%tag, "event for unknown handler");
            return Err(EngineError::UnknownTag { tag });
        };

        match (state, result) {
            (HandlerState::Accepting, Ok(ServerEvent::Accepted(request))) => {
                self.process(tag, request).await
            }
            (HandlerState::Accepting, Err(error)) => self.on_accept_cancelled(tag, error),
            (HandlerState::Finishing, Ok(ServerEvent::Delivered)) => {
                bump(&self.stats.replies_delivered);
                self.release(tag)
            }
            (HandlerState::Finishing, Err(error)) => {
                tracing::warn!(%tag, %error, "reply delivery failed");
                bump(&self.stats.failed_deliveries);
                self.release(tag)
            }
            (state, _) => {
                tracing::error!(%tag, %state, "event does not match handler state");
                Err(EngineError::UnexpectedEvent {
                    tag,
                    state: state.name(),
                })
            }
        }
    }

    /// PROCESSING: replace the acceptor, compute the reply, submit it.
    async fn process(&self, tag: CallTag, request: S::Request) -> Result<(), EngineError> {
        let replacement = self.replacement_tag();
        {
            let mut arena = self.arena();
            arena.accept(tag, replacement)?;
            self.check_capacity(&arena)?;
        }
        bump(&self.stats.calls_accepted);
        // a refused replacement stops the loop once this call is answered
        let registered = match replacement {
            Some(replacement) => self.register(replacement),
            None => Ok(()),
        };
        tracing::debug!(%tag, "call accepted");

        let decision = self.faults.decide(&request);
        if !decision.delay.is_zero() {
            self.time.sleep(decision.delay).await;
        }
        let reply = match decision.failure {
            Some(error) => {
                bump(&self.stats.manufactured_failures);
                tracing::debug!(%tag, %error, "injected failure");
                Err(error)
            }
            None => {
                let reply = self.service.call(&request).await;
                if reply.is_err() {
                    bump(&self.stats.service_failures);
                }
                reply
            }
        };
        drop(request);

        self.arena().finish(tag)?;
        bump(&self.stats.replies_sent);
        self.substrate.respond_async(tag, reply, &self.queue.sender());
        registered
    }

    fn on_accept_cancelled(&self, tag: CallTag, error: CallError) -> Result<(), EngineError> {
        tracing::debug!(%tag, %error, "acceptor cancelled by substrate");
        bump(&self.stats.accept_cancellations);

        let replacement = self.replacement_tag();
        {
            let mut arena = self.arena();
            arena.replace_acceptor(tag, replacement)?;
            self.check_capacity(&arena)?;
        }
        bump(&self.stats.handlers_released);
        match replacement {
            Some(replacement) => self.register(replacement),
            None => Ok(()),
        }
    }

    /// FINISHING: the handler ends here.
    fn release(&self, tag: CallTag) -> Result<(), EngineError> {
        {
            let mut arena = self.arena();
            arena.release(tag)?;
            self.check_capacity(&arena)?;
        }
        bump(&self.stats.handlers_released);
        tracing::trace!(%tag, "handler released");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::service_fn;
    use crate::substrate::mem::MemoryServer;

    fn echo() -> impl Service<Request = u32, Response = u32> {
        service_fn(|x: &u32| Ok::<_, CallError>(*x))
    }

    #[tokio::test(start_paused = true)]
    async fn test_serve_twice_is_refused() {
        let server = Arc::new(MemoryServer::<u32, u32>::new());
        let mux = Arc::new(Multiplexer::new(Arc::clone(&server), echo()));

        let token = CancellationToken::new();
        token.cancel();
        let stats = Arc::clone(&mux).serve(token.clone()).await.expect("serve");
        assert_eq!(stats.handlers_created, 1);
        assert_eq!(stats.min_accepting, Some(1));

        let again = mux.serve(token).await;
        assert!(matches!(again, Err(EngineError::AlreadyServing)));
    }

    #[tokio::test]
    async fn test_serving_a_closed_substrate_fails() {
        let server = Arc::new(MemoryServer::<u32, u32>::new());
        server.close();
        let mux = Arc::new(Multiplexer::new(Arc::clone(&server), echo()));

        let result = Arc::clone(&mux).serve(CancellationToken::new()).await;
        assert!(matches!(result, Err(EngineError::SubstrateClosed)));
        assert!(mux.queue().is_shutdown());
    }

    #[tokio::test]
    async fn test_event_for_unknown_handler_stops_the_loop() {
        let server = Arc::new(MemoryServer::<u32, u32>::new());
        let mux = Arc::new(Multiplexer::new(Arc::clone(&server), echo()));
        mux.queue()
            .sender()
            .succeed(CallTag::from_raw(999), ServerEvent::Delivered)
            .expect("queue open");

        let result = mux.serve(CancellationToken::new()).await;
        assert!(matches!(result, Err(EngineError::UnknownTag { tag }) if tag.as_u64() == 999));
    }

    #[tokio::test]
    async fn test_delivered_before_reply_is_unexpected() {
        let server = Arc::new(MemoryServer::<u32, u32>::new());
        let mux = Arc::new(Multiplexer::new(Arc::clone(&server), echo()));
        // the first acceptor gets tag 1
        mux.queue()
            .sender()
            .succeed(CallTag::from_raw(1), ServerEvent::Delivered)
            .expect("queue open");

        let result = mux.serve(CancellationToken::new()).await;
        assert!(matches!(
            result,
            Err(EngineError::UnexpectedEvent { state: "ACCEPTING", .. })
        ));
    }

    #[tokio::test]
    async fn test_serves_one_call() {
        let server = Arc::new(MemoryServer::<u32, u32>::new());
        let mux = Arc::new(Multiplexer::new(Arc::clone(&server), echo()));
        let token = CancellationToken::new();
        let serving = tokio::spawn(Arc::clone(&mux).serve(token.clone()));

        let reply = server.submit(5).await.expect("reply channel");
        assert_eq!(reply, Ok(5));

        token.cancel();
        let stats = serving.await.expect("join").expect("serve");
        assert_eq!(stats.calls_accepted, 1);
        assert_eq!(stats.replies_sent, 1);
        assert_eq!(stats.max_accepting, 1);
    }
}
