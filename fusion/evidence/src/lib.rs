#![deny(
    clippy::all,
    clippy::pedantic,
    clippy::nursery,
    missing_docs,
    rust_2018_idioms
)]

//! Dempster-Shafer fusion of independently trained, calibrated classifiers.

/// Focal combination via Dempster's rule.
#[path = "../combination.rs"]
pub mod combination;

/// Confusion tables and the calibration-to-mass builder.
#[path = "../builder.rs"]
pub mod builder;

/// TOML configuration.
#[path = "../config.rs"]
pub mod config;

/// Label extraction from a fused BPA.
#[path = "../decision.rs"]
pub mod decision;

/// Batch orchestration over calibrated models.
#[path = "../ensemble.rs"]
pub mod ensemble;

/// Error taxonomy.
#[path = "../error.rs"]
pub mod error;

/// Frames of discernment and focal sets.
#[path = "../frame.rs"]
pub mod frame;

/// Basic probability assignments.
#[path = "../mass.rs"]
pub mod mass;

/// Model wrapper and calibration lifecycle.
#[path = "../model.rs"]
pub mod model;

/// Predictor capability and adapters.
#[path = "../predictor.rs"]
pub mod predictor;

/// Telemetry helpers.
#[path = "../telemetry.rs"]
pub mod telemetry;

pub use builder::{build_masses, ConfusionTable};
pub use combination::{Combination, CombinationEngine, CombinationStats};
pub use config::{
    BatchFailurePolicy, BatchSettings, CalibrationSettings, CombinationSettings, ConflictPolicy,
    DecisionSettings, FusionConfig, TelemetrySettings,
};
pub use decision::{decide, scores, Decision, Metric};
pub use ensemble::{Ensemble, FusedBelief, InstanceOutcome, ModelVote};
pub use error::{FusionError, Result};
pub use frame::{FocalSet, Frame, MAX_LABELS};
pub use mass::{FocalMass, MassFunction, DEFAULT_TOLERANCE};
pub use model::{CalibrationTable, Calibrated, Model, Uncalibrated};
pub use predictor::{FnPredictor, Predictor, Preprocess, RawOutput, ScorePredictor};
pub use telemetry::{FusionTelemetry, FusionTelemetryBuilder, LogLevel, LogRecord};
