//! Engine configuration, loaded from TOML with built-in defaults.
//!
//! ## Loading Order
//!
//! 1. `PEWMA_CONFIG` environment variable (path to TOML file)
//! 2. `pewma.toml` in the current working directory
//! 3. Built-in defaults
//!
//! There is no process-global config: an [`EngineConfig`] value is passed
//! explicitly into every engine call, so two processors with different
//! tunings can coexist in one process.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{info, warn};

// ============================================================================
// Defaults
// ============================================================================

/// Default warm-up window length (points used for the initial average)
pub const DEFAULT_WARMUP_WINDOW: usize = 30;

/// Default base retained weight on history
pub const DEFAULT_ALPHA_0: f64 = 0.95;

/// Default outlier sensitivity (0 = fixed-weight EWMA)
pub const DEFAULT_BETA: f64 = 0.5;

/// Default anomaly likelihood cutoff
pub const DEFAULT_THRESHOLD: f64 = 0.05;

/// Default field identifying the entity a reading belongs to
pub const DEFAULT_KEY_FIELD: &str = "station_id";

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {0}: {1}")]
    Io(PathBuf, #[source] std::io::Error),

    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config value for {field}: {message}")]
    InvalidValue { field: &'static str, message: String },
}

impl ConfigError {
    fn invalid(field: &'static str, message: impl Into<String>) -> Self {
        ConfigError::InvalidValue {
            field,
            message: message.into(),
        }
    }
}

// ============================================================================
// Engine Config
// ============================================================================

/// Tuning parameters for the PEWMA engine.
///
/// `warmup_window` is both the warm-up point count and the cap on each
/// column's raw-value window. `alpha_0` and `beta` shape the steady-state
/// adaptive weight `(1 - beta * P) * alpha_0`; `threshold` is the likelihood
/// cutoff below (or at) which a reading is flagged anomalous.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Warm-up window length `T` (integer >= 1)
    #[serde(default = "default_warmup_window")]
    pub warmup_window: usize,

    /// Base retained weight `alpha_0`, in (0, 1)
    #[serde(default = "default_alpha_0")]
    pub alpha_0: f64,

    /// Outlier sensitivity `beta`, >= 0; set to 0 for a fixed-weight EWMA
    #[serde(default = "default_beta")]
    pub beta: f64,

    /// Anomaly likelihood cutoff, in (0, 1)
    #[serde(default = "default_threshold")]
    pub threshold: f64,

    /// Columns to model; every other observation field is passthrough
    #[serde(default)]
    pub tracked_columns: BTreeSet<String>,

    /// Observation field identifying the entity (station/sensor)
    #[serde(default = "default_key_field")]
    pub key_field: String,
}

fn default_warmup_window() -> usize {
    DEFAULT_WARMUP_WINDOW
}

fn default_alpha_0() -> f64 {
    DEFAULT_ALPHA_0
}

fn default_beta() -> f64 {
    DEFAULT_BETA
}

fn default_threshold() -> f64 {
    DEFAULT_THRESHOLD
}

fn default_key_field() -> String {
    DEFAULT_KEY_FIELD.to_string()
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            warmup_window: DEFAULT_WARMUP_WINDOW,
            alpha_0: DEFAULT_ALPHA_0,
            beta: DEFAULT_BETA,
            threshold: DEFAULT_THRESHOLD,
            tracked_columns: BTreeSet::new(),
            key_field: DEFAULT_KEY_FIELD.to_string(),
        }
    }
}

impl EngineConfig {
    /// Load configuration using the standard search order:
    /// 1. `$PEWMA_CONFIG` environment variable
    /// 2. `./pewma.toml` in the current working directory
    /// 3. Built-in defaults
    pub fn load() -> Self {
        if let Ok(path) = std::env::var("PEWMA_CONFIG") {
            let p = PathBuf::from(&path);
            if p.exists() {
                match Self::load_from_file(&p) {
                    Ok(config) => {
                        info!(path = %p.display(), "Loaded engine config from PEWMA_CONFIG");
                        return config;
                    }
                    Err(e) => {
                        warn!(path = %p.display(), error = %e, "Failed to load config from PEWMA_CONFIG, falling back");
                    }
                }
            } else {
                warn!(path = %path, "PEWMA_CONFIG points to non-existent file, falling back");
            }
        }

        let local = PathBuf::from("pewma.toml");
        if local.exists() {
            match Self::load_from_file(&local) {
                Ok(config) => {
                    info!("Loaded engine config from ./pewma.toml");
                    return config;
                }
                Err(e) => {
                    warn!(error = %e, "Failed to load ./pewma.toml, using defaults");
                }
            }
        }

        info!("No pewma.toml found — using built-in defaults");
        Self::default()
    }

    /// Load from a specific TOML file path.
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Io(path.to_path_buf(), e))?;
        let config: Self = toml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Range-check every tunable. Called automatically by the file loaders
    /// and by `Processor::new`; call directly when building a config in code.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.warmup_window < 1 {
            return Err(ConfigError::invalid(
                "warmup_window",
                format!("must be >= 1, got {}", self.warmup_window),
            ));
        }
        if !(self.alpha_0 > 0.0 && self.alpha_0 < 1.0) {
            return Err(ConfigError::invalid(
                "alpha_0",
                format!("must be in (0, 1), got {}", self.alpha_0),
            ));
        }
        if !(self.beta >= 0.0 && self.beta.is_finite()) {
            return Err(ConfigError::invalid(
                "beta",
                format!("must be finite and >= 0, got {}", self.beta),
            ));
        }
        if !(self.threshold > 0.0 && self.threshold < 1.0) {
            return Err(ConfigError::invalid(
                "threshold",
                format!("must be in (0, 1), got {}", self.threshold),
            ));
        }
        if self.tracked_columns.is_empty() {
            return Err(ConfigError::invalid(
                "tracked_columns",
                "at least one tracked column is required",
            ));
        }
        if self.key_field.is_empty() {
            return Err(ConfigError::invalid("key_field", "must not be empty"));
        }
        if self.tracked_columns.contains(&self.key_field) {
            return Err(ConfigError::invalid(
                "key_field",
                format!("'{}' cannot also be a tracked column", self.key_field),
            ));
        }
        Ok(())
    }

    /// Whether a field is one of the modeled columns.
    pub fn is_tracked(&self, field: &str) -> bool {
        self.tracked_columns.contains(field)
    }
}
