use std::{fmt, sync::Arc};

use anyhow::Result;

use crate::frame::Frame;

/// Native output of a wrapped classifier.
#[derive(Debug, Clone, PartialEq)]
pub enum RawOutput {
    /// Label drawn from the declared label set.
    Label(String),
    /// Numeric class id, interpreted as a position in the declared label set.
    Index(usize),
    /// One score per declared label; the highest wins.
    Scores(Vec<f64>),
}

impl RawOutput {
    /// Resolves the output to a label of `frame`, or `None` when it names
    /// nothing in the frame. Score ties go to the lowest index.
    #[must_use]
    pub fn resolve<'a>(&self, frame: &'a Frame) -> Option<&'a str> {
        match self {
            Self::Label(label) => frame.index_of(label).and_then(|idx| frame.label(idx)),
            Self::Index(idx) => frame.label(*idx),
            Self::Scores(scores) => {
                if scores.len() != frame.len() {
                    return None;
                }
                let mut best: Option<(usize, f64)> = None;
                for (idx, score) in scores.iter().copied().enumerate() {
                    if score.is_nan() {
                        continue;
                    }
                    if best.map_or(true, |(_, top)| score > top) {
                        best = Some((idx, score));
                    }
                }
                best.and_then(|(idx, _)| frame.label(idx))
            }
        }
    }

    /// Human-readable form used in error messages.
    #[must_use]
    pub fn describe(&self) -> String {
        match self {
            Self::Label(label) => label.clone(),
            Self::Index(idx) => format!("#{idx}"),
            Self::Scores(scores) => format!("scores{scores:?}"),
        }
    }
}

/// Capability implemented by every trained classifier the engine can wrap.
///
/// The engine never inspects the predictor; it only asks for one output per input.
pub trait Predictor<I>: Send + Sync {
    /// Short name of the predictor family, e.g. `"knn"`.
    fn family(&self) -> &str;

    /// Produces the native output for one input.
    fn predict(&self, input: &I) -> Result<RawOutput>;
}

/// Caller-supplied transform applied before the predictor.
///
/// It borrows the input and returns a fresh value, so caller data is never
/// modified in place.
pub type Preprocess<I> = Arc<dyn Fn(&I) -> Result<I> + Send + Sync>;

/// Adapter for classifiers exposed as a label-producing closure.
pub struct FnPredictor<F> {
    family: String,
    predict: F,
}

impl<F> FnPredictor<F> {
    /// Wraps `predict` under the given family name.
    pub fn new(family: impl Into<String>, predict: F) -> Self {
        Self {
            family: family.into(),
            predict,
        }
    }
}

impl<I, F> Predictor<I> for FnPredictor<F>
where
    F: Fn(&I) -> Result<String> + Send + Sync,
{
    fn family(&self) -> &str {
        &self.family
    }

    fn predict(&self, input: &I) -> Result<RawOutput> {
        (self.predict)(input).map(RawOutput::Label)
    }
}

impl<F> fmt::Debug for FnPredictor<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnPredictor").field("family", &self.family).finish()
    }
}

/// Adapter for classifiers that emit one score per class.
pub struct ScorePredictor<F> {
    family: String,
    score: F,
}

impl<F> ScorePredictor<F> {
    /// Wraps `score` under the given family name.
    pub fn new(family: impl Into<String>, score: F) -> Self {
        Self {
            family: family.into(),
            score,
        }
    }
}

impl<I, F> Predictor<I> for ScorePredictor<F>
where
    F: Fn(&I) -> Result<Vec<f64>> + Send + Sync,
{
    fn family(&self) -> &str {
        &self.family
    }

    fn predict(&self, input: &I) -> Result<RawOutput> {
        (self.score)(input).map(RawOutput::Scores)
    }
}

impl<F> fmt::Debug for ScorePredictor<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScorePredictor").field("family", &self.family).finish()
    }
}
