//! Weight Tracker - Reactive derived-metrics engine for body-weight goals
//!
//! A user's starting, current and goal weights come from a record store as live
//! queries. The metrics engine turns them into total loss, target loss, remaining
//! loss and a loss percentage, recomputing only what changed whenever the store
//! republishes.
//!
//! ## Modules
//!
//! - **Engine**: The input/metric dependency graph and the observables it drives
//! - **Store**: Record persistence (SQLite or in-memory) with live per-user queries
//! - **Session**: Login, input validation and record edits on top of the engine

pub mod config;
pub mod engine;
pub mod error;
pub mod goal;
pub mod graph;
pub mod metrics;
pub mod observable;
pub mod session;
pub mod store;
pub mod types;

// FFI bindings for C interop (always available for cdylib/staticlib builds)
pub mod ffi;

pub use config::TrackerConfig;
pub use engine::MetricsEngine;
pub use error::{ConfigError, InputError, SessionError, StoreError};
pub use goal::goal_reached;
pub use observable::{EventSignal, Observable, Subscription};
pub use session::{SampleOutcome, TrackerSession};
pub use store::{MemoryStore, RecordStore, SqliteStore};
pub use types::{
    GoalId, GoalWeight, InputKind, MetricKind, MetricsSnapshot, SampleId, User, UserId,
    WeightSample,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
