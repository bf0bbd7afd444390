//! PEWMA update engine — the algorithmic core.
//!
//! Implements the Probabilistic Exponentially Weighted Moving Average of
//! Carter & Streilein ("Probabilistic reasoning for streaming anomaly
//! detection", IEEE SSP 2012) as pure functions over per-key state:
//!
//! - [`cold_start`] builds the first [`KeyState`] for a key (not scored)
//! - [`update`] runs the recursive moment update and scores each tracked
//!   column present in the observation
//! - [`project`] flattens an updated state into a [`DiagnosticsRecord`]
//!
//! The engine holds no state of its own; everything lives in the `KeyState`
//! passed in and returned. All computation is bounded-time arithmetic, so
//! the per-key sequencing discipline (one in-flight update per key) is the
//! caller's only concurrency obligation.

use crate::config::EngineConfig;
use crate::types::{ColumnScore, ColumnState, DiagnosticsRecord, FieldValue, KeyState, Observation};
use statrs::distribution::{Continuous, Normal};
use thiserror::Error;
use tracing::warn;

// ============================================================================
// Errors
// ============================================================================

/// Caller contract violations. The only fault the algorithm recovers from
/// internally is the zero-variance standardization (Z is defined as 0 there).
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("observation is missing key field '{0}'")]
    MissingKeyField(String),

    #[error("key field '{field}' must be a string or number")]
    InvalidKeyField { field: String },

    #[error("non-numeric value for tracked column '{column}' (key '{key}')")]
    NonNumericColumn { key: String, column: String },

    #[error("non-finite value {value} for tracked column '{column}' (key '{key}')")]
    NonFiniteValue {
        key: String,
        column: String,
        value: f64,
    },
}

// ============================================================================
// Key Extraction
// ============================================================================

/// Extract the entity key from an observation.
///
/// String keys are used verbatim; numeric keys are stringified. Anything
/// else (or an absent field) is a contract violation.
pub fn observation_key(obs: &Observation, config: &EngineConfig) -> Result<String, EngineError> {
    match obs.get(&config.key_field) {
        Some(FieldValue::Text(s)) if !s.is_empty() => Ok(s.clone()),
        Some(FieldValue::Number(n)) => Ok(n.to_string()),
        Some(_) => Err(EngineError::InvalidKeyField {
            field: config.key_field.clone(),
        }),
        None => Err(EngineError::MissingKeyField(config.key_field.clone())),
    }
}

// ============================================================================
// Validation
// ============================================================================

/// Collect the numeric values of every tracked column present in the
/// observation, failing before any state is touched. A single NaN would
/// permanently corrupt the recursive moments, so non-finite values are
/// rejected alongside non-numeric ones.
fn numeric_tracked<'a>(
    key: &str,
    obs: &Observation,
    config: &'a EngineConfig,
) -> Result<Vec<(&'a str, f64)>, EngineError> {
    let mut values = Vec::new();
    for col in &config.tracked_columns {
        let Some(field) = obs.get(col) else {
            // missing tracked column: simply not updated this cycle
            continue;
        };
        match field {
            FieldValue::Number(n) if n.is_finite() => values.push((col.as_str(), *n)),
            FieldValue::Number(n) => {
                return Err(EngineError::NonFiniteValue {
                    key: key.to_string(),
                    column: col.clone(),
                    value: *n,
                })
            }
            _ => {
                return Err(EngineError::NonNumericColumn {
                    key: key.to_string(),
                    column: col.clone(),
                })
            }
        }
    }
    Ok(values)
}

// ============================================================================
// Cold Start
// ============================================================================

/// Build the first state for a key from its first observation.
///
/// Each tracked column present seeds its window, moments, and a zero
/// standard deviation; `alpha` starts at 0. The record is not scored —
/// there is nothing to compare the first point against.
pub fn cold_start(
    key: &str,
    obs: &Observation,
    config: &EngineConfig,
) -> Result<KeyState, EngineError> {
    let tracked = numeric_tracked(key, obs, config)?;

    let mut state = KeyState::default();
    for (col, value) in tracked {
        state
            .columns
            .insert(col.to_string(), ColumnState::cold_start(value));
    }
    copy_passthrough(&mut state, obs, config);
    Ok(state)
}

// ============================================================================
// Recursive Update
// ============================================================================

/// Advance a key's state by one observation.
///
/// Validation runs before any mutation, so an `Err` means the input state
/// (still held by the caller or the store) is untouched. Tracked columns
/// absent from the observation keep their state as-is; a tracked column
/// appearing for the first time mid-stream cold-starts inside the existing
/// key state.
pub fn update(
    key: &str,
    mut state: KeyState,
    obs: &Observation,
    config: &EngineConfig,
) -> Result<KeyState, EngineError> {
    let tracked = numeric_tracked(key, obs, config)?;

    for (col, value) in tracked {
        if let Some(column) = state.columns.get_mut(col) {
            update_column(key, col, column, value, config);
        } else {
            state
                .columns
                .insert(col.to_string(), ColumnState::cold_start(value));
        }
    }
    copy_passthrough(&mut state, obs, config);
    Ok(state)
}

/// One PEWMA step for a single column.
fn update_column(
    key: &str,
    col: &str,
    column: &mut ColumnState,
    value: f64,
    config: &EngineConfig,
) {
    // Window maintenance: append, then evict the single oldest entry once
    // the cap is exceeded. `t` counts this point.
    column.window.push_back(value);
    if column.window.len() > config.warmup_window {
        column.window.pop_front();
    }
    let t = column.window.len();
    debug_assert!(t >= 1, "cold start guarantees a non-empty window");

    // One-step lag: the mean and std derived at the end of the previous
    // update standardize this value.
    let mean_prev = column.s1;
    let std_prev = column.std;

    // Zero variance is a defined case, not a fault: Z = 0.
    let z = if std_prev == 0.0 {
        0.0
    } else {
        (value - mean_prev) / std_prev
    };
    let p = standard_normal_pdf(z);

    let alpha = if t < config.warmup_window {
        // Warm-up: cumulative-average schedule, 1 - 1/t.
        1.0 - 1.0 / t as f64
    } else {
        // Steady state: a surprising point (low P) shrinks the weight on
        // history, so the model adapts faster right after it.
        (1.0 - config.beta * p) * config.alpha_0
    };

    let s1 = alpha * mean_prev + (1.0 - alpha) * value;
    let s2 = alpha * column.s2 + (1.0 - alpha) * value * value;

    // The radicand is non-negative in exact arithmetic. Anything below
    // rounding noise is numerical degeneracy: clamp, warn, and flag it.
    let radicand = s2 - s1 * s1;
    let degenerate = radicand < -(f64::EPSILON * s2.abs().max(1.0));
    if degenerate {
        warn!(
            key = %key,
            column = %col,
            radicand,
            "negative variance radicand beyond rounding noise — clamping to zero"
        );
    }

    column.alpha = alpha;
    column.s1 = s1;
    column.s2 = s2;
    column.std = radicand.max(0.0).sqrt();
    column.score = Some(ColumnScore {
        z,
        p,
        is_anomaly: p <= config.threshold,
        variance_clamped: degenerate,
    });
}

/// Overwrite passthrough fields with the observation's current values.
fn copy_passthrough(state: &mut KeyState, obs: &Observation, config: &EngineConfig) {
    for (field, value) in &obs.fields {
        if !config.is_tracked(field) {
            state.passthrough.insert(field.clone(), value.clone());
        }
    }
}

/// Standard normal density at `z`: `(1/sqrt(2*pi)) * exp(-z^2 / 2)`.
fn standard_normal_pdf(z: f64) -> f64 {
    // Normal::new(0, 1) cannot fail; the fallback is unreachable.
    Normal::new(0.0, 1.0).map_or(0.0, |n| n.pdf(z))
}

// ============================================================================
// Diagnostics Projection
// ============================================================================

/// Project an updated state into its externally-reportable flat record.
///
/// Passthrough fields are copied verbatim; each tracked column contributes
/// its *latest* raw value under its own name (never the full window) plus
/// its suffixed model fields and, once scored, its Z/P/anomaly fields and
/// a `<col>_variance_clamped` marker whenever the update had to clamp a
/// degenerate variance. Read-only: the persisted state is not touched.
pub fn project(state: &KeyState) -> DiagnosticsRecord {
    let mut record = DiagnosticsRecord::default();

    for (field, value) in &state.passthrough {
        record.fields.insert(field.clone(), value.clone());
    }

    for (col, column) in &state.columns {
        if let Some(latest) = column.latest() {
            record.fields.insert(col.clone(), FieldValue::Number(latest));
        }
        record.fields.insert(format!("{col}_alpha"), column.alpha.into());
        record.fields.insert(format!("{col}_s1"), column.s1.into());
        record.fields.insert(format!("{col}_s2"), column.s2.into());
        record.fields.insert(format!("{col}_std"), column.std.into());

        if let Some(score) = &column.score {
            record.fields.insert(format!("{col}_z"), score.z.into());
            record.fields.insert(format!("{col}_p"), score.p.into());
            record
                .fields
                .insert(format!("{col}_is_anomaly"), score.is_anomaly.into());
            // degeneracy is a diagnostic signal, not just a log line
            if score.variance_clamped {
                record
                    .fields
                    .insert(format!("{col}_variance_clamped"), true.into());
            }
        }
    }

    record
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    const P_MAX: f64 = 0.398_942_280_401_432_7; // 1/sqrt(2*pi)

    fn config(warmup_window: usize) -> EngineConfig {
        EngineConfig {
            warmup_window,
            alpha_0: 0.95,
            beta: 0.5,
            threshold: 0.05,
            tracked_columns: BTreeSet::from(["x".to_string()]),
            key_field: "station".to_string(),
        }
    }

    fn obs(value: f64) -> Observation {
        let mut o = Observation::new();
        o.set("station", "A").set("x", value);
        o
    }

    /// Run a value sequence from cold start, returning the final state.
    fn run(values: &[f64], config: &EngineConfig) -> KeyState {
        let mut iter = values.iter();
        let first = iter.next().expect("need at least one value");
        let mut state = cold_start("A", &obs(*first), config).unwrap();
        for v in iter {
            state = update("A", state, &obs(*v), config).unwrap();
        }
        state
    }

    #[test]
    fn test_observation_key_extraction() {
        let config = config(3);

        assert_eq!(observation_key(&obs(1.0), &config).unwrap(), "A");

        let mut numeric_key = Observation::new();
        numeric_key.set("station", 36.0).set("x", 1.0);
        assert_eq!(observation_key(&numeric_key, &config).unwrap(), "36");

        let mut no_key = Observation::new();
        no_key.set("x", 1.0);
        assert!(matches!(
            observation_key(&no_key, &config),
            Err(EngineError::MissingKeyField(_))
        ));

        let mut bool_key = Observation::new();
        bool_key.set("station", true).set("x", 1.0);
        assert!(matches!(
            observation_key(&bool_key, &config),
            Err(EngineError::InvalidKeyField { .. })
        ));
    }

    #[test]
    fn test_cold_start_determinism() {
        let config = config(30);
        let state = cold_start("A", &obs(1.353), &config).unwrap();

        let col = state.column("x").unwrap();
        assert_eq!(col.s1, 1.353);
        assert_eq!(col.s2, 1.353 * 1.353);
        assert_eq!(col.std, 0.0);
        assert_eq!(col.alpha, 0.0);
        assert!(col.score.is_none());
        assert_eq!(col.window.len(), 1);

        // key field rides through as passthrough
        assert_eq!(
            state.passthrough.get("station"),
            Some(&FieldValue::Text("A".to_string()))
        );
    }

    #[test]
    fn test_warmup_alpha_schedule() {
        // With a long warm-up, alpha after the t-th point is 1 - 1/t:
        // strictly increasing and in [0, 1).
        let config = config(30);
        let mut state = cold_start("A", &obs(5.0), &config).unwrap();
        let mut prev_alpha = state.column("x").unwrap().alpha;
        assert_eq!(prev_alpha, 0.0);

        for t in 2..=10u32 {
            state = update("A", state, &obs(5.0), &config).unwrap();
            let alpha = state.column("x").unwrap().alpha;
            assert!((alpha - (1.0 - 1.0 / f64::from(t))).abs() < 1e-12);
            assert!(alpha > prev_alpha);
            assert!((0.0..1.0).contains(&alpha));
            prev_alpha = alpha;
        }
    }

    #[test]
    fn test_steady_state_alpha_is_constant_when_beta_zero() {
        // beta = 0 degrades to a fixed-weight EWMA: alpha == alpha_0 no
        // matter how surprising the values are.
        let mut cfg = config(2);
        cfg.beta = 0.0;

        let state = run(&[1.0, 2.0, 50.0, -30.0, 2.0], &cfg);
        assert_eq!(state.column("x").unwrap().alpha, cfg.alpha_0);
    }

    #[test]
    fn test_steady_state_alpha_bounded_by_likelihood() {
        let cfg = config(2);
        let state = run(&[1.0, 2.0, 3.0], &cfg);
        let col = state.column("x").unwrap();
        let p = col.score.as_ref().unwrap().p;
        assert!(p > 0.0 && p <= P_MAX);
        assert!((col.alpha - (1.0 - cfg.beta * p) * cfg.alpha_0).abs() < 1e-15);
    }

    #[test]
    fn test_window_cap_and_arrival_order() {
        let config = config(3);
        let state = run(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0], &config);
        let col = state.column("x").unwrap();
        assert_eq!(col.window.len(), 3);
        assert_eq!(col.window, std::collections::VecDeque::from([4.0, 5.0, 6.0]));
    }

    #[test]
    fn test_zero_variance_never_faults() {
        // Identical values keep the variance at exactly zero, so every
        // standardization hits the zero-division case — including the final
        // spike, which by definition gets Z = 0 against a zero std.
        let config = config(3);
        let state = run(&[10.0, 10.0, 10.0, 10.0, 100.0], &config);

        let col = state.column("x").unwrap();
        let score = col.score.as_ref().unwrap();
        assert_eq!(score.z, 0.0);
        assert!((score.p - P_MAX).abs() < 1e-12);
        assert!(!score.is_anomaly);
    }

    #[test]
    fn test_spike_after_stable_series_is_flagged() {
        // T=3, alpha_0=0.95, beta=0.5, threshold=0.05. A stable-but-jittered
        // series keeps P well above the cutoff; the spike to 100 against a
        // mean near 10 produces a huge |Z| and a vanishing P.
        let config = config(3);
        let values = [10.0, 10.4, 10.2, 9.9, 100.0];

        let mut state = cold_start("A", &obs(values[0]), &config).unwrap();
        for v in &values[1..4] {
            state = update("A", state, &obs(*v), &config).unwrap();
            let score = state.column("x").unwrap().score.as_ref().unwrap();
            assert!(!score.is_anomaly, "stable value {v} should not be flagged");
        }

        state = update("A", state, &obs(values[4]), &config).unwrap();
        let score = state.column("x").unwrap().score.as_ref().unwrap();
        assert!(score.z.abs() > 100.0);
        assert!(score.p < 1e-9);
        assert!(score.is_anomaly);
    }

    #[test]
    fn test_threshold_boundary_equality_is_anomalous() {
        // Identical values give P exactly 1/sqrt(2*pi); with the threshold
        // set to the same bits, P == threshold must flag.
        let mut cfg = config(3);
        cfg.threshold = standard_normal_pdf(0.0);

        let state = run(&[7.0, 7.0, 7.0], &cfg);
        let score = state.column("x").unwrap().score.as_ref().unwrap();
        assert_eq!(score.p, cfg.threshold);
        assert!(score.is_anomaly);
    }

    #[test]
    fn test_missing_tracked_column_left_untouched() {
        let mut cfg = config(3);
        cfg.tracked_columns.insert("y".to_string());

        let mut first = Observation::new();
        first.set("station", "A").set("x", 1.0).set("y", 2.0);
        let state = cold_start("A", &first, &cfg).unwrap();

        // second observation carries only x
        let state = update("A", state, &obs(1.5), &cfg).unwrap();

        let y = state.column("y").unwrap();
        assert_eq!(y.window.len(), 1);
        assert!(y.score.is_none());

        let x = state.column("x").unwrap();
        assert_eq!(x.window.len(), 2);
        assert!(x.score.is_some());
    }

    #[test]
    fn test_mid_stream_new_column_cold_starts() {
        let mut cfg = config(3);
        cfg.tracked_columns.insert("y".to_string());

        // y is absent at cold start, appears on the second observation
        let state = cold_start("A", &obs(1.0), &cfg).unwrap();
        assert!(state.column("y").is_none());

        let mut second = Observation::new();
        second.set("station", "A").set("x", 1.5).set("y", 9.0);
        let state = update("A", state, &second, &cfg).unwrap();

        let y = state.column("y").unwrap();
        assert_eq!(y.s1, 9.0);
        assert_eq!(y.alpha, 0.0);
        assert!(y.score.is_none());
    }

    #[test]
    fn test_non_numeric_tracked_value_fails() {
        let config = config(3);
        let state = run(&[1.0, 2.0], &config);

        let mut bad = Observation::new();
        bad.set("station", "A").set("x", "not-a-number");
        let err = update("A", state.clone(), &bad, &config).unwrap_err();
        assert!(matches!(
            err,
            EngineError::NonNumericColumn { ref key, ref column } if key == "A" && column == "x"
        ));

        let mut nan = Observation::new();
        nan.set("station", "A").set("x", f64::NAN);
        assert!(matches!(
            update("A", state, &nan, &config),
            Err(EngineError::NonFiniteValue { .. })
        ));
    }

    #[test]
    fn test_degenerate_variance_is_clamped_and_surfaced() {
        // A corrupted second moment drives the radicand deeply negative —
        // far beyond rounding noise. The update must clamp the std to zero
        // rather than fault, flag the score, and carry the flag through to
        // the projected record.
        let config = config(3);
        let mut state = run(&[10.0, 10.4, 10.2], &config);
        state.columns.get_mut("x").unwrap().s2 = 0.0;

        let state = update("A", state, &obs(10.0), &config).unwrap();
        let col = state.column("x").unwrap();
        assert_eq!(col.std, 0.0);
        let score = col.score.as_ref().unwrap();
        assert!(score.variance_clamped);

        let record = project(&state);
        assert_eq!(record.flag("x_variance_clamped"), Some(true));
    }

    #[test]
    fn test_replay_determinism() {
        // Same sequence, fresh key, twice: bit-identical states.
        let config = config(5);
        let values = [3.1, 4.1, 5.9, 2.6, 5.3, 5.8, 9.7, 9.3];
        let a = run(&values, &config);
        let b = run(&values, &config);

        assert_eq!(
            serde_json::to_string(&a).unwrap(),
            serde_json::to_string(&b).unwrap()
        );
    }

    #[test]
    fn test_projection_is_flat_and_read_only() {
        let config = config(3);
        let state = run(&[10.0, 10.4, 10.2], &config);
        let before = state.clone();

        let record = project(&state);
        assert_eq!(state, before);

        // latest value, not the window
        assert_eq!(record.number("x"), Some(10.2));
        assert!(record.number("x_z").is_some());
        assert!(record.number("x_p").is_some());
        assert!(record.number("x_s1").is_some());
        assert!(record.number("x_s2").is_some());
        assert!(record.number("x_std").is_some());
        assert!(record.number("x_alpha").is_some());
        assert_eq!(record.flag("x_is_anomaly"), Some(false));
        assert_eq!(record.get("station"), Some(&FieldValue::Text("A".to_string())));
        // healthy variance: no degeneracy marker
        assert!(record.get("x_variance_clamped").is_none());

        // flat: serializes to a single-level JSON object
        let json: serde_json::Value = serde_json::to_value(&record).unwrap();
        let map = json.as_object().unwrap();
        assert!(map.values().all(|v| !v.is_object() && !v.is_array()));
    }

    #[test]
    fn test_cold_start_projection_has_no_scores() {
        let config = config(3);
        let state = cold_start("A", &obs(2.0), &config).unwrap();
        let record = project(&state);

        assert_eq!(record.number("x"), Some(2.0));
        assert!(record.get("x_z").is_none());
        assert!(record.get("x_p").is_none());
        assert!(record.get("x_is_anomaly").is_none());
    }
}
