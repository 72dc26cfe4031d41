use std::{
    fs,
    path::{Path, PathBuf},
};

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use crate::{decision::Metric, telemetry::LogLevel};

/// Engine configuration, usually loaded from a TOML document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FusionConfig {
    /// Calibration settings.
    #[serde(default)]
    pub calibration: CalibrationSettings,
    /// Combination settings.
    #[serde(default)]
    pub combination: CombinationSettings,
    /// Decision settings.
    #[serde(default)]
    pub decision: DecisionSettings,
    /// Batch orchestration settings.
    #[serde(default)]
    pub batch: BatchSettings,
    /// Structured logging settings.
    #[serde(default)]
    pub telemetry: TelemetrySettings,
}

impl FusionConfig {
    /// Loads and validates a TOML configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path)
            .with_context(|| format!("reading fusion config {}", path.display()))?;
        let mut config = Self::from_toml(&raw).with_context(|| format!("parsing {}", path.display()))?;
        let source_dir = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        if let Some(log_path) = config.telemetry.log_path.as_mut() {
            if log_path.is_relative() {
                *log_path = source_dir.join(&*log_path);
            }
        }
        Ok(config)
    }

    /// Parses and validates a TOML document.
    pub fn from_toml(raw: &str) -> Result<Self> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Checks numeric bounds.
    pub fn validate(&self) -> Result<()> {
        let prior = self.calibration.ignorance_prior;
        if !prior.is_finite() || prior < 0.0 {
            bail!("calibration.ignorance_prior must be a finite value >= 0, got {prior}");
        }
        let tolerance = self.calibration.tolerance;
        if !(tolerance > 0.0 && tolerance <= 1e-3) {
            bail!("calibration.tolerance must lie in (0, 1e-3], got {tolerance}");
        }
        let epsilon = self.combination.conflict_epsilon;
        if !(0.0..0.5).contains(&epsilon) {
            bail!("combination.conflict_epsilon must lie in [0, 0.5), got {epsilon}");
        }
        if self.batch.workers == Some(0) {
            bail!("batch.workers must be at least 1");
        }
        Ok(())
    }
}

/// How held-out confusion counts become mass.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CalibrationSettings {
    /// Pseudo-count of evidence reserved for Θ in every calibration row.
    #[serde(default = "default_ignorance_prior")]
    pub ignorance_prior: f64,
    /// Tolerance used when validating that a BPA sums to one.
    #[serde(default = "default_tolerance")]
    pub tolerance: f64,
}

impl Default for CalibrationSettings {
    fn default() -> Self {
        Self {
            ignorance_prior: default_ignorance_prior(),
            tolerance: default_tolerance(),
        }
    }
}

/// Dempster combination settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CombinationSettings {
    /// Conflict K at or above `1 - conflict_epsilon` counts as total conflict.
    #[serde(default = "default_conflict_epsilon")]
    pub conflict_epsilon: f64,
    /// What the orchestrator does when a model is in total conflict.
    #[serde(default)]
    pub conflict_policy: ConflictPolicy,
}

impl Default for CombinationSettings {
    fn default() -> Self {
        Self {
            conflict_epsilon: default_conflict_epsilon(),
            conflict_policy: ConflictPolicy::default(),
        }
    }
}

/// Orchestrator reaction to total conflict.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictPolicy {
    /// Report `TotalConflict` for the instance.
    #[default]
    Fail,
    /// Drop the conflicting model's evidence and keep folding.
    SkipConflicting,
}

/// Decision defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DecisionSettings {
    /// Metric used when the caller does not pick one.
    #[serde(default)]
    pub metric: Metric,
}

/// Batch failure handling.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchFailurePolicy {
    /// Report failures per instance and keep going.
    #[default]
    Isolate,
    /// Stop at the first failing instance.
    Abort,
}

/// Batch orchestration settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BatchSettings {
    /// Failure policy.
    #[serde(default)]
    pub failure_policy: BatchFailurePolicy,
    /// Worker bound for parallel prediction; defaults to the available cores.
    #[serde(default)]
    pub workers: Option<usize>,
}

impl BatchSettings {
    /// Effective worker count.
    #[must_use]
    pub fn effective_workers(&self) -> usize {
        self.workers.unwrap_or_else(|| {
            std::thread::available_parallelism().map_or(1, std::num::NonZeroUsize::get)
        })
    }
}

/// Structured log sink settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetrySettings {
    /// JSON-lines log file; logging is disabled when absent.
    #[serde(default)]
    pub log_path: Option<PathBuf>,
    /// Records below this level are dropped.
    #[serde(default = "default_min_level")]
    pub min_level: LogLevel,
}

impl Default for TelemetrySettings {
    fn default() -> Self {
        Self {
            log_path: None,
            min_level: default_min_level(),
        }
    }
}

const fn default_ignorance_prior() -> f64 {
    1.0
}

const fn default_tolerance() -> f64 {
    crate::mass::DEFAULT_TOLERANCE
}

const fn default_conflict_epsilon() -> f64 {
    1e-9
}

const fn default_min_level() -> LogLevel {
    LogLevel::Info
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn defaults_are_valid() {
        let config = FusionConfig::default();
        config.validate().unwrap();
        assert_eq!(config.calibration.ignorance_prior, 1.0);
        assert_eq!(config.combination.conflict_policy, ConflictPolicy::Fail);
        assert_eq!(config.batch.failure_policy, BatchFailurePolicy::Isolate);
        assert!(config.batch.effective_workers() >= 1);
    }

    #[test]
    fn loads_and_resolves_log_path() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("fusion.toml");
        fs::write(
            &path,
            r#"
[calibration]
ignorance_prior = 0.5

[combination]
conflict_policy = "skip_conflicting"

[decision]
metric = "plausibility"

[batch]
failure_policy = "abort"
workers = 2

[telemetry]
log_path = "logs/fusion.log"
min_level = "DEBUG"
"#,
        )
        .unwrap();
        let config = FusionConfig::load(&path).unwrap();
        assert_eq!(config.calibration.ignorance_prior, 0.5);
        assert_eq!(config.combination.conflict_policy, ConflictPolicy::SkipConflicting);
        assert_eq!(config.decision.metric, Metric::Plausibility);
        assert_eq!(config.batch.effective_workers(), 2);
        assert_eq!(config.telemetry.min_level, LogLevel::Debug);
        assert!(config.telemetry.log_path.unwrap().is_absolute());
    }

    #[test]
    fn rejects_out_of_range_values() {
        assert!(FusionConfig::from_toml("[calibration]\nignorance_prior = -1.0\n").is_err());
        assert!(FusionConfig::from_toml("[combination]\nconflict_epsilon = 0.7\n").is_err());
        assert!(FusionConfig::from_toml("[batch]\nworkers = 0\n").is_err());
    }
}
