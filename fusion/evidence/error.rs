use thiserror::Error;

/// Errors raised by the fusion engine.
#[derive(Debug, Error)]
pub enum FusionError {
    /// The caller-supplied preprocessing step failed.
    #[error("preprocessing failed for model `{model}`")]
    Preprocessing {
        /// Model whose preprocessing failed.
        model: String,
        /// Underlying failure.
        #[source]
        source: anyhow::Error,
    },
    /// The wrapped predictor failed.
    #[error("predictor of model `{model}` failed")]
    Predictor {
        /// Model whose predictor failed.
        model: String,
        /// Underlying failure.
        #[source]
        source: anyhow::Error,
    },
    /// A calibration snapshot carried no usable evidence.
    #[error("model `{model}` has not been calibrated")]
    UncalibratedModel {
        /// Model name.
        model: String,
    },
    /// Calibration was attempted without held-out samples.
    #[error("calibration set for model `{model}` is empty")]
    EmptyCalibrationSet {
        /// Model name.
        model: String,
    },
    /// Calibration inputs and labels differ in length.
    #[error("calibration inputs ({inputs}) and labels ({labels}) differ in length")]
    CalibrationLengthMismatch {
        /// Number of inputs.
        inputs: usize,
        /// Number of labels.
        labels: usize,
    },
    /// A label is not part of the frame or has no calibrated evidence.
    #[error("unknown label `{label}`")]
    UnknownLabel {
        /// Offending label.
        label: String,
    },
    /// Every focal element of one BPA is disjoint from every focal element of the other.
    #[error("total conflict between evidence sources (K = {conflict:.6})")]
    TotalConflict {
        /// Conflict mass K.
        conflict: f64,
    },
    /// Two frames cannot be reconciled.
    #[error("frame mismatch: expected {expected:?}, found {found:?}")]
    FrameMismatch {
        /// Labels of the reference frame.
        expected: Vec<String>,
        /// Labels of the offending frame.
        found: Vec<String>,
    },
    /// Frame construction failed.
    #[error("invalid frame: {0}")]
    InvalidFrame(String),
    /// A mass function violates the BPA invariants.
    #[error("invalid mass function: {0}")]
    InvalidMass(String),
    /// Nothing to combine.
    #[error("no evidence to combine")]
    NoEvidence,
    /// The batch was interrupted before this instance was processed.
    #[error("batch cancelled before instance was processed")]
    Cancelled,
    /// An instance failed under the abort policy.
    #[error("batch aborted at instance {index}")]
    BatchAborted {
        /// Position of the failing instance.
        index: usize,
        /// Failure of that instance.
        #[source]
        source: Box<FusionError>,
    },
    /// A parallel worker panicked or was torn down.
    #[error("worker failed: {0}")]
    Worker(String),
    /// Calibration snapshot could not be (de)serialized.
    #[error("calibration snapshot error")]
    Snapshot(#[from] serde_json::Error),
}

impl FusionError {
    /// Returns true for failures local to a single model invocation.
    #[must_use]
    pub const fn is_model_local(&self) -> bool {
        matches!(self, Self::Preprocessing { .. } | Self::Predictor { .. })
    }
}

/// Result alias used across the engine.
pub type Result<T> = std::result::Result<T, FusionError>;
