//! # callmux
//!
//! Asynchronous multiplexed call engine.
//!
//! This crate provides:
//! - **Fan-out dispatcher**: issue one call per peer without waiting, drain a
//!   completion queue and return a complete peer -> outcome map, tolerating
//!   per-peer failure
//! - **Request multiplexer**: serve many concurrent inbound calls from a few
//!   workers using per-call handler state machines and a shared completion
//!   queue
//! - **Completion queue**: tagged event channel between a call substrate and
//!   the engine
//! - **Substrate traits** plus an in-memory substrate for tests and demos
//! - **Food price services**: catalog, vendor and supplier services and the
//!   price finder flow
//!
//! ```ignore
//! let catalog = Arc::new(InMemoryCatalog::new().with_item("Amazon", "eggs", 2.5));
//!
//! let vendor = Arc::new(MemoryServer::new());
//! let prices = Multiplexer::new(Arc::clone(&vendor), PriceService::new(Arc::clone(&catalog)));
//! tokio::spawn(Arc::new(prices).serve(shutdown.clone()));
//!
//! let supplier = Arc::new(MemoryServer::new());
//! let listings = Multiplexer::new(Arc::clone(&supplier), SupplierService::new(catalog));
//! tokio::spawn(Arc::new(listings).serve(shutdown.clone()));
//!
//! let vendors = MemoryNetwork::new();
//! vendors.bind(PeerId::from("Amazon"), vendor);
//! let directory = MemoryNetwork::new();
//! directory.bind(PeerId::from("supplier"), supplier);
//!
//! let finder = PriceFinder::new(
//!     PeerId::from("supplier"),
//!     FanOut::new(directory),
//!     FanOut::new(vendors),
//! );
//! let prices = finder.lookup("eggs").await?;
//! ```

#![deny(missing_docs)]
#![deny(clippy::unwrap_used)]

// =============================================================================
// Modules
// =============================================================================

pub mod catalog;
pub mod error;
pub mod fanout;
pub mod fault;
pub mod metrics;
pub mod mux;
pub mod peer;
pub mod providers;
pub mod queue;
pub mod service;
pub mod substrate;
pub mod tag;

// =============================================================================
// Public API Re-exports
// =============================================================================

pub use catalog::{
    Catalog, InMemoryCatalog, PriceFinder, PriceQuote, PriceRequest, PriceService, SupplierList,
    SupplierRequest, SupplierService,
};
pub use error::{CallError, EngineError};
pub use fanout::{DispatchReport, FanOut, FanOutConfig, PeerOutcome};
pub use fault::{
    FaultDecision, FaultPolicy, NoFaults, RandomFaults, RandomFaultsConfig, ScriptedFaults,
};
pub use metrics::{InMemoryMetrics, LatencyHistogram, MetricsSink, NoopMetrics, TracingMetrics};
pub use mux::{HandlerState, Multiplexer, MultiplexerConfig, MultiplexerStats};
pub use peer::PeerId;
pub use providers::{
    RandomProvider, SeededRandomProvider, TimeError, TimeProvider, TokioRandomProvider,
    TokioTimeProvider,
};
pub use queue::{Completion, CompletionQueue, CompletionSender};
pub use service::{service_fn, Service, ServiceFn};
pub use substrate::mem::{MemoryNetwork, MemoryServer, MemoryServerConfig, MemoryServerStats};
pub use substrate::{InboundSubstrate, OutboundSubstrate, ServerEvent};
pub use tag::{CallTag, TagFactory};
