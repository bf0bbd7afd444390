//! pewma-sentry: streaming per-station anomaly detection
//!
//! Online anomaly detection over per-entity numeric time series using a
//! Probabilistic Exponentially Weighted Moving Average (PEWMA). Each
//! incoming reading for a tracked key is scored against a continuously
//! updated probabilistic model of "normal" for that key; low-likelihood
//! readings are flagged anomalous.
//!
//! ## Architecture
//!
//! - **Engine**: pure recursive PEWMA update — mean/second-moment
//!   estimates, adaptive smoothing factor, Z-score and Gaussian likelihood
//! - **StateStore**: pluggable per-key state persistence (in-memory, sled)
//! - **Processor**: fetch → engine → save → project, one observation at a
//!   time, serialized per key

pub mod config;
pub mod engine;
pub mod pipeline;
pub mod store;
pub mod types;

// Re-export configuration
pub use config::{ConfigError, EngineConfig};

// Re-export the engine surface
pub use engine::{cold_start, observation_key, project, update, EngineError};

// Re-export pipeline
pub use pipeline::{Processor, ReplayStats};

// Re-export storage
pub use store::{InMemoryStore, SledStore, StateStore, StoreError};

// Re-export commonly used types
pub use types::{
    ColumnScore, ColumnState, DiagnosticsRecord, FieldValue, KeyState, Observation,
};
