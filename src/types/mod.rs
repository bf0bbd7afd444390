//! Core data model: observations, per-key model state, and diagnostics.
//!
//! Observations are flat field maps (station telemetry rarely agrees on a
//! schema), while model state is fully structured: each tracked column gets
//! its own [`ColumnState`] record instead of suffix-mangled field names.
//! Flattening back to a suffix-keyed record happens only at the egress
//! boundary, in [`DiagnosticsRecord`].

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};

// ============================================================================
// Field Values
// ============================================================================

/// A leaf value carried by an observation or a diagnostics record.
///
/// Diagnostics egress is restricted to these three shapes (numeric, string,
/// boolean) so any downstream consumer can treat records as flat key-value
/// payloads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    /// Boolean flag (anomaly markers, passthrough flags)
    Bool(bool),
    /// Numeric value — all numbers are modeled as f64
    Number(f64),
    /// String value (station names, timestamps as text, labels)
    Text(String),
}

impl FieldValue {
    /// Numeric view of the value, if it is a number.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            FieldValue::Number(n) => Some(*n),
            _ => None,
        }
    }

    /// Boolean view of the value, if it is a flag.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            FieldValue::Bool(b) => Some(*b),
            _ => None,
        }
    }
}

impl std::fmt::Display for FieldValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FieldValue::Bool(b) => write!(f, "{b}"),
            FieldValue::Number(n) => write!(f, "{n}"),
            FieldValue::Text(s) => write!(f, "{s}"),
        }
    }
}

impl From<f64> for FieldValue {
    fn from(v: f64) -> Self {
        FieldValue::Number(v)
    }
}

impl From<bool> for FieldValue {
    fn from(v: bool) -> Self {
        FieldValue::Bool(v)
    }
}

impl From<&str> for FieldValue {
    fn from(v: &str) -> Self {
        FieldValue::Text(v.to_string())
    }
}

// ============================================================================
// Observation
// ============================================================================

/// One incoming reading: a flat mapping of field name to value.
///
/// Must contain the configured key field and may contain any subset of the
/// tracked columns; everything else rides through as passthrough. Immutable
/// input to one update cycle.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Observation {
    pub fields: BTreeMap<String, FieldValue>,
}

impl Observation {
    /// Empty observation, for incremental construction in tests and tools.
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up a field by name.
    pub fn get(&self, field: &str) -> Option<&FieldValue> {
        self.fields.get(field)
    }

    /// Set a field, replacing any previous value.
    pub fn set(&mut self, field: impl Into<String>, value: impl Into<FieldValue>) -> &mut Self {
        self.fields.insert(field.into(), value.into());
        self
    }
}

// ============================================================================
// Per-Column Model State
// ============================================================================

/// Scores computed for a column during the most recent update.
///
/// Absent on a freshly cold-started column — the first point has nothing to
/// be compared against.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnScore {
    /// Standardized deviation of the latest value: `(value - s1) / std`
    pub z: f64,
    /// Gaussian density at `z` — a relative surprise measure in
    /// `(0, 1/sqrt(2*pi)]`, not a calibrated probability
    pub p: f64,
    /// Whether `p <= threshold` (equality counts as anomalous)
    pub is_anomaly: bool,
    /// Whether the variance radicand went negative beyond f64 noise and had
    /// to be clamped — repeated occurrences mean the model is degenerate
    /// for this column
    pub variance_clamped: bool,
}

/// Recursive PEWMA state for one tracked column of one key.
///
/// The window holds raw values for warm-up counting and reporting only; the
/// recursion itself runs on the O(1) summary fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnState {
    /// Most recent raw values, oldest first, capped at the warm-up length
    pub window: VecDeque<f64>,
    /// Smoothing factor used in the most recent update (0 at cold start)
    pub alpha: f64,
    /// Exponentially-weighted mean estimate
    pub s1: f64,
    /// Exponentially-weighted second-raw-moment estimate
    pub s2: f64,
    /// Standard deviation derived at the end of the last update; the
    /// denominator for the *next* standardization (one-step lag is
    /// intentional)
    pub std: f64,
    /// Scores from the most recent update, if the column has been scored
    pub score: Option<ColumnScore>,
}

impl ColumnState {
    /// Initialize from the first value seen for this column.
    pub fn cold_start(value: f64) -> Self {
        let s1 = value;
        let s2 = value * value;
        Self {
            window: VecDeque::from([value]),
            alpha: 0.0,
            s1,
            s2,
            std: (s2 - s1 * s1).max(0.0).sqrt(),
            score: None,
        }
    }

    /// Number of points currently in the window (the warm-up counter `t`).
    pub fn count(&self) -> usize {
        self.window.len()
    }

    /// Most recent raw value, if any.
    pub fn latest(&self) -> Option<f64> {
        self.window.back().copied()
    }
}

// ============================================================================
// Per-Key State
// ============================================================================

/// Complete persisted state for one key (station/sensor).
///
/// Created on the first observation for the key, mutated by every subsequent
/// one, never deleted. Tracked columns are independent; no cross-column
/// state is shared.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct KeyState {
    /// Model state per tracked column
    pub columns: BTreeMap<String, ColumnState>,
    /// Non-tracked observation fields, copied verbatim from the most recent
    /// observation that carried them
    pub passthrough: BTreeMap<String, FieldValue>,
}

impl KeyState {
    /// State for a tracked column, if it has been seen at least once.
    pub fn column(&self, name: &str) -> Option<&ColumnState> {
        self.columns.get(name)
    }
}

// ============================================================================
// Diagnostics Record
// ============================================================================

/// Externally-reportable projection of an updated [`KeyState`].
///
/// Flat key-value shape: passthrough fields verbatim, the *latest* raw value
/// under each tracked column's own name (never the full window), and the
/// per-column scores under suffixed names (`<col>_z`, `<col>_p`,
/// `<col>_alpha`, `<col>_s1`, `<col>_s2`, `<col>_std`, `<col>_is_anomaly`).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DiagnosticsRecord {
    pub fields: BTreeMap<String, FieldValue>,
}

impl DiagnosticsRecord {
    /// Look up a field by name.
    pub fn get(&self, field: &str) -> Option<&FieldValue> {
        self.fields.get(field)
    }

    /// Numeric field accessor.
    pub fn number(&self, field: &str) -> Option<f64> {
        self.get(field).and_then(FieldValue::as_f64)
    }

    /// Boolean field accessor.
    pub fn flag(&self, field: &str) -> Option<bool> {
        self.get(field).and_then(FieldValue::as_bool)
    }
}
