//! querystate - live execution-state snapshots
//!
//! A requester asks a running process for the state of whatever it is
//! executing right now. The target answers at its next safe point by
//! rendering its stack of active queries and streaming the result back over a
//! shared, chunked byte channel. Helper processes launched by the target are
//! asked in turn, so the caller sees the whole parallel job.
//!
//! # Modules
//!
//! - [`host`] - process registry, trigger delivery and safe points
//! - [`channel`] - bounded byte queue and length-prefixed framing
//! - [`shmem`] - request lock, epochs and peer accounting
//! - [`coordinator`] - the requester side of a snapshot request
//! - [`producer`] - the target side of a snapshot request
//! - [`progress`] - completion estimates derived from snapshots
//! - [`sim`] - a simulated leader/helper workload
//! - [`config`] - configuration types and loading

pub mod channel;
pub mod cli;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod host;
pub mod identity;
pub mod instrument;
pub mod producer;
pub mod progress;
pub mod shmem;
pub mod signal;
pub mod sim;
pub mod stack;
pub mod wire;
pub mod workers;

// Re-export commonly used types
pub use config::{Config, ModuleConfig, TransportConfig};
pub use coordinator::{QueryStateReport, QueryStateRequest, StateRow, pg_query_state};
pub use error::{QueryStateError, Result};
pub use host::{Backend, BackendState, Host, HostBuilder, Pid, UserId};
pub use instrument::{ExplainFormat, ExplainOptions, Explainer, PlanNode, RuntimeExplainer};
pub use progress::{ALMOST_DONE, NO_ESTIMATE, progress_bar, progress_bar_visual};
pub use sim::{RunningJob, SimulatedJob};
