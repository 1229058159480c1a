//! Enphase Envoy telemetry engine
//!
//! Reads the gateway's live meter stream, polls its cumulative counters and
//! optional status documents, estimates grid import/export energy, and keeps
//! a consistent snapshot for downstream publishers.

pub mod config;
pub mod energy_accumulator;
pub mod engine;
pub mod error;
pub mod gateway_client;
pub mod historic_counters;
pub mod model;
pub mod persistence;
pub mod poll_scheduler;
pub mod shutdown;
pub mod snapshot_bus;
pub mod stream_reader;
pub mod token_manager;

// Re-export commonly used types for easier access
pub use config::Config;
pub use engine::{Engine, EngineState};
pub use error::{EnvoyError, Result};
pub use shutdown::Shutdown;
pub use snapshot_bus::{Channel, PublishMode, Snapshot, SnapshotBus};
