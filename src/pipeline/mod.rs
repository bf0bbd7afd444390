//! Per-observation processing pipeline.
//!
//! Ties the collaborators together around the engine: extract the key,
//! fetch prior state, cold-start or update, persist, project diagnostics.
//! The [`Processor`] takes `&mut self` per observation, so same-key updates
//! run strictly one at a time by construction — the read-modify-write
//! cycle must never interleave for a key or the recursive state is
//! corrupted. Distinct keys may be handled in parallel by giving each
//! partition its own processor over a shared (or partitioned) store.

use crate::config::{ConfigError, EngineConfig};
use crate::engine::{self, EngineError};
use crate::store::StateStore;
use crate::types::{DiagnosticsRecord, Observation};
use std::collections::BTreeMap;
use tracing::{debug, warn};

/// Drives one observation at a time through fetch → engine → save → project.
pub struct Processor<S: StateStore> {
    store: S,
    config: EngineConfig,
}

impl<S: StateStore> Processor<S> {
    /// Build a processor over a store, validating the config up front.
    pub fn new(store: S, config: EngineConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self { store, config })
    }

    /// The engine configuration this processor runs with.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Access the underlying store (e.g. to flush at shutdown).
    pub fn store(&self) -> &S {
        &self.store
    }

    /// Process one observation: returns the flattened diagnostics record.
    ///
    /// An unreachable store on fetch degrades to a cold start (the same
    /// semantics as a never-seen key); a failed save is logged and the
    /// diagnostics still returned — this update is dropped and the key
    /// resumes from its last persisted state on the next observation.
    /// Validation errors leave the stored state untouched.
    pub fn process(&mut self, obs: &Observation) -> Result<DiagnosticsRecord, EngineError> {
        let key = engine::observation_key(obs, &self.config)?;

        let prior = match self.store.fetch(&key) {
            Ok(prior) => prior,
            Err(e) => {
                warn!(key = %key, error = %e, "state fetch failed — treating as cold start");
                None
            }
        };

        let state = match prior {
            Some(state) => engine::update(&key, state, obs, &self.config)?,
            None => {
                debug!(key = %key, "first observation for key — cold start");
                engine::cold_start(&key, obs, &self.config)?
            }
        };

        if let Err(e) = self.store.save(&key, &state) {
            warn!(
                key = %key,
                error = %e,
                "state save failed — update dropped; key resumes from last persisted state"
            );
        }

        Ok(engine::project(&state))
    }
}

// ============================================================================
// Replay statistics
// ============================================================================

/// Counters accumulated over a replay or ingest run.
#[derive(Debug, Default)]
pub struct ReplayStats {
    /// Observations processed successfully
    pub records: u64,
    /// Observations rejected by validation
    pub rejected: u64,
    /// Anomalies flagged, per tracked column
    pub anomalies: BTreeMap<String, u64>,
}

impl ReplayStats {
    /// Fold one diagnostics record into the counters.
    pub fn record(&mut self, record: &DiagnosticsRecord, config: &EngineConfig) {
        self.records += 1;
        for col in &config.tracked_columns {
            if record.flag(&format!("{col}_is_anomaly")) == Some(true) {
                *self.anomalies.entry(col.clone()).or_insert(0) += 1;
            }
        }
    }

    /// Count an observation the engine rejected.
    pub fn record_rejected(&mut self) {
        self.rejected += 1;
    }

    /// Total anomalies across all columns.
    pub fn total_anomalies(&self) -> u64 {
        self.anomalies.values().sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{InMemoryStore, StoreError};
    use std::collections::{BTreeSet, VecDeque};
    use std::sync::atomic::{AtomicBool, Ordering};

    fn test_config() -> EngineConfig {
        EngineConfig {
            warmup_window: 3,
            tracked_columns: BTreeSet::from(["x".to_string()]),
            key_field: "station".to_string(),
            ..EngineConfig::default()
        }
    }

    fn obs(key: &str, value: f64) -> Observation {
        let mut o = Observation::new();
        o.set("station", key).set("x", value);
        o
    }

    #[test]
    fn test_new_rejects_invalid_config() {
        let mut config = test_config();
        config.tracked_columns.clear();
        assert!(Processor::new(InMemoryStore::new(), config).is_err());
    }

    #[test]
    fn test_first_observation_cold_starts_and_persists() {
        let mut processor = Processor::new(InMemoryStore::new(), test_config()).unwrap();

        let record = processor.process(&obs("SF36", 1.353)).unwrap();
        assert_eq!(record.number("x"), Some(1.353));
        assert!(record.get("x_is_anomaly").is_none());

        let stored = processor.store().fetch("SF36").unwrap().unwrap();
        assert_eq!(stored.column("x").unwrap().s1, 1.353);
    }

    #[test]
    fn test_keys_are_tracked_independently() {
        let mut processor = Processor::new(InMemoryStore::new(), test_config()).unwrap();

        for v in [10.0, 10.4, 10.2] {
            processor.process(&obs("A", v)).unwrap();
        }
        // B only just started; its window must not see A's history
        processor.process(&obs("B", 500.0)).unwrap();

        let a = processor.store().fetch("A").unwrap().unwrap();
        let b = processor.store().fetch("B").unwrap().unwrap();
        assert_eq!(a.column("x").unwrap().count(), 3);
        assert_eq!(b.column("x").unwrap().count(), 1);
        assert!(b.column("x").unwrap().score.is_none());
    }

    #[test]
    fn test_validation_error_leaves_state_untouched() {
        let mut processor = Processor::new(InMemoryStore::new(), test_config()).unwrap();
        processor.process(&obs("A", 1.0)).unwrap();
        processor.process(&obs("A", 2.0)).unwrap();
        let before = processor.store().fetch("A").unwrap().unwrap();

        let mut bad = Observation::new();
        bad.set("station", "A").set("x", "broken-sensor");
        assert!(processor.process(&bad).is_err());

        let after = processor.store().fetch("A").unwrap().unwrap();
        assert_eq!(after, before);
    }

    /// Store whose saves can be switched off, for exercising degraded paths.
    struct FlakyStore {
        inner: InMemoryStore,
        fail_saves: AtomicBool,
    }

    impl FlakyStore {
        fn new() -> Self {
            Self {
                inner: InMemoryStore::new(),
                fail_saves: AtomicBool::new(false),
            }
        }
    }

    impl StateStore for FlakyStore {
        fn fetch(&self, key: &str) -> Result<Option<crate::types::KeyState>, StoreError> {
            self.inner.fetch(key)
        }

        fn save(&self, key: &str, state: &crate::types::KeyState) -> Result<(), StoreError> {
            if self.fail_saves.load(Ordering::SeqCst) {
                return Err(StoreError::Storage("saves disabled".to_string()));
            }
            self.inner.save(key, state)
        }

        fn count(&self) -> usize {
            self.inner.count()
        }

        fn backend_name(&self) -> &'static str {
            "Flaky"
        }
    }

    #[test]
    fn test_failed_save_drops_update_and_resumes_from_persisted_state() {
        let mut processor = Processor::new(FlakyStore::new(), test_config()).unwrap();

        processor.process(&obs("A", 10.0)).unwrap();

        // the unpersisted update still yields diagnostics for the caller
        processor.store().fail_saves.store(true, Ordering::SeqCst);
        let record = processor.process(&obs("A", 10.4)).unwrap();
        assert_eq!(record.number("x"), Some(10.4));

        processor.store().fail_saves.store(false, Ordering::SeqCst);
        processor.process(&obs("A", 10.2)).unwrap();

        // the dropped update never reached the store: the key resumed from
        // its last persisted state, not from a cold start
        let state = processor.store().fetch("A").unwrap().unwrap();
        let col = state.column("x").unwrap();
        assert_eq!(col.count(), 2);
        assert_eq!(col.window, VecDeque::from([10.0, 10.2]));
    }

    #[test]
    fn test_replay_stats_counts_anomalies() {
        let config = test_config();
        let mut processor = Processor::new(InMemoryStore::new(), config.clone()).unwrap();
        let mut stats = ReplayStats::default();

        for v in [10.0, 10.4, 10.2, 9.9, 100.0] {
            match processor.process(&obs("A", v)) {
                Ok(record) => stats.record(&record, &config),
                Err(_) => stats.record_rejected(),
            }
        }

        assert_eq!(stats.records, 5);
        assert_eq!(stats.rejected, 0);
        assert_eq!(stats.anomalies.get("x"), Some(&1));
        assert_eq!(stats.total_anomalies(), 1);
    }
}
