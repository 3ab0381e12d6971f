//! Shared helpers for the integration tests.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use callmux::{
    CallError, CallTag, CompletionSender, EngineError, MemoryServer, Multiplexer,
    MultiplexerStats, OutboundSubstrate, PeerId, Service,
};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .try_init();
}

pub fn peers(names: &[&str]) -> Vec<PeerId> {
    names.iter().map(|name| PeerId::from(*name)).collect()
}

/// Outbound substrate answering `request + 1` after a per-peer delay.
///
/// Peers in `failing` answer with [`CallError::Unavailable`]. Every issued
/// call is logged with its tag.
#[derive(Default)]
pub struct ScriptedPeers {
    failing: HashSet<PeerId>,
    delays: HashMap<PeerId, Duration>,
    issued: Mutex<Vec<(PeerId, CallTag)>>,
}

impl ScriptedPeers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing(mut self, peer: &str) -> Self {
        self.failing.insert(PeerId::from(peer));
        self
    }

    pub fn delay(mut self, peer: &str, delay: Duration) -> Self {
        self.delays.insert(PeerId::from(peer), delay);
        self
    }

    pub fn issued(&self) -> Vec<(PeerId, CallTag)> {
        self.issued.lock().expect("lock").clone()
    }
}

impl OutboundSubstrate for ScriptedPeers {
    type Request = u32;
    type Response = u32;

    fn issue_async(
        &self,
        peer: &PeerId,
        request: u32,
        tag: CallTag,
        completions: &CompletionSender<u32>,
    ) {
        self.issued.lock().expect("lock").push((peer.clone(), tag));

        let result = if self.failing.contains(peer) {
            Err(CallError::Unavailable)
        } else {
            Ok(request + 1)
        };
        let delay = self.delays.get(peer).copied().unwrap_or(Duration::ZERO);
        let completions = completions.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = completions.complete(tag, result);
        });
    }
}

/// Multiplexer over an in-memory server.
pub type MemoryMux<S> =
    Multiplexer<Arc<MemoryServer<<S as Service>::Request, <S as Service>::Response>>, S>;

/// A multiplexer serving on its own task.
pub struct Running<S: Service> {
    pub mux: Arc<MemoryMux<S>>,
    pub shutdown: CancellationToken,
    pub task: JoinHandle<Result<MultiplexerStats, EngineError>>,
}

impl<S: Service> Running<S> {
    /// Stop serving and return the final stats.
    pub async fn stop(self) -> MultiplexerStats {
        self.shutdown.cancel();
        self.task.await.expect("join").expect("serve")
    }
}

/// Start serving `mux` on a new task.
pub fn spawn_mux<S: Service>(mux: MemoryMux<S>) -> Running<S> {
    let mux = Arc::new(mux);
    let shutdown = CancellationToken::new();
    let task = tokio::spawn(Arc::clone(&mux).serve(shutdown.clone()));
    Running {
        mux,
        shutdown,
        task,
    }
}

/// Yield until `condition` holds.
pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    while !condition() {
        tokio::task::yield_now().await;
    }
}
