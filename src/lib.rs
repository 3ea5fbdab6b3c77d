//! # syncmesh
//!
//! Distributed in-network model averaging. Learner processes (workers) train
//! on local data streams while a central coordinator aggregates their
//! parameters into a shared reference model, periodically or in reaction to
//! divergence.
//!
//! ## Architecture
//!
//! - **Transport**: topic-based pub/sub over a broker; two exchanges per
//!   run, one per direction. In-process and TCP broker implementations.
//! - **Coordinator**: tracks registered and active nodes and drives
//!   balancing rounds through a pluggable synchronizer.
//! - **Worker**: gates training against the control plane, buffers the data
//!   stream, reports violations, answers parameter requests at most once
//!   per round.
//! - **Synchronizers**: periodic, dynamic, dynamic-hedge (incremental
//!   balancing with a full-sync fallback), no-sync, aggregation-at-end.
//! - **Aggregators**: arithmetic mean and geometric median over an opaque
//!   parameter algebra.
//!
//! Every process is a single-threaded drain loop; all coupling between them
//! is explicit message passing.

pub mod aggregation;
pub mod config;
pub mod coordinator;
pub mod data;
pub mod error;
pub mod init;
pub mod learning;
pub mod params;
pub mod protocol;
pub mod stopping;
pub mod sync;
pub mod transport;
pub mod types;
pub mod worker;

pub use aggregation::Aggregator;
pub use config::BrokerConfig;
pub use coordinator::{Coordinator, CoordinatorConfig};
pub use error::{Result, SyncError};
pub use init::InitHandler;
pub use learning::{Learner, LearningLogger, TrainStep};
pub use params::Parameters;
pub use stopping::StoppingCriterion;
pub use sync::Synchronizer;
pub use transport::{Broker, MemoryBroker, TcpBroker, Transport};
pub use types::{Example, ModelFlags, NodeId};
pub use worker::{TrainingMode, Worker, WorkerConfig};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Install a tracing subscriber honoring `RUST_LOG`
pub fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(true)
        .init();
}
