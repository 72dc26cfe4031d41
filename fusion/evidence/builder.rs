use indexmap::IndexMap;
use ndarray::Array2;
use serde::{Deserialize, Serialize};

use crate::{
    config::CalibrationSettings,
    error::{FusionError, Result},
    frame::{FocalSet, Frame},
    mass::MassFunction,
};

/// Counts of (predicted label, true label) pairs over a held-out set.
///
/// Rows are predicted labels, columns true labels, both in frame order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfusionTable {
    counts: Array2<u64>,
}

impl ConfusionTable {
    /// Zeroed table for a frame.
    #[must_use]
    pub fn new(frame: &Frame) -> Self {
        Self {
            counts: Array2::zeros((frame.len(), frame.len())),
        }
    }

    /// Number of labels per axis.
    #[must_use]
    pub fn size(&self) -> usize {
        self.counts.nrows()
    }

    /// Rows by columns.
    #[must_use]
    pub fn shape(&self) -> (usize, usize) {
        self.counts.dim()
    }

    /// Whether the table is square with one row and column per frame label.
    #[must_use]
    pub fn fits(&self, frame: &Frame) -> bool {
        self.counts.nrows() == frame.len() && self.counts.ncols() == frame.len()
    }

    /// Records one prediction.
    pub fn record(&mut self, predicted: usize, truth: usize) {
        self.counts[[predicted, truth]] += 1;
    }

    /// Times `predicted` was emitted when `truth` was correct.
    #[must_use]
    pub fn count(&self, predicted: usize, truth: usize) -> u64 {
        self.counts[[predicted, truth]]
    }

    /// Times `predicted` was emitted.
    #[must_use]
    pub fn row_total(&self, predicted: usize) -> u64 {
        self.counts.row(predicted).sum()
    }

    /// Number of recorded predictions.
    #[must_use]
    pub fn total(&self) -> u64 {
        self.counts.sum()
    }

    /// Fraction of predictions on the diagonal.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn accuracy(&self) -> f64 {
        let total = self.total();
        if total == 0 {
            return 0.0;
        }
        self.counts.diag().sum() as f64 / total as f64
    }
}

/// Turns each confusion row into the BPA used when the model predicts that row's label.
///
/// For a row `p` with total `n` and ignorance prior `α`:
/// `m({p}) = c[p][p] / (n + α)`, `m({p, t}) = c[p][t] / (n + α)` for every
/// confused true label `t`, and `m(Θ) = α / (n + α)`. A row that was never
/// predicted yields the vacuous BPA.
#[allow(clippy::cast_precision_loss)]
pub fn build_masses(
    table: &ConfusionTable,
    frame: &Frame,
    settings: &CalibrationSettings,
) -> Result<IndexMap<String, MassFunction>> {
    if !table.fits(frame) {
        let (rows, columns) = table.shape();
        return Err(FusionError::InvalidMass(format!(
            "confusion table of shape {rows}x{columns} does not match a frame of {} labels",
            frame.len()
        )));
    }
    let prior = settings.ignorance_prior;
    let mut masses = IndexMap::with_capacity(frame.len());
    for (predicted, label) in frame.labels().enumerate() {
        let row_total = table.row_total(predicted) as f64;
        let denominator = row_total + prior;
        let mass = if row_total == 0.0 || denominator <= 0.0 {
            MassFunction::vacuous(frame)
        } else {
            let own = FocalSet::singleton(predicted);
            let mut mass = MassFunction::accumulator(frame.clone());
            for truth in 0..frame.len() {
                let share = table.count(predicted, truth) as f64 / denominator;
                let set = if truth == predicted { own } else { own.with(truth) };
                mass.add(set, share);
            }
            mass.add(frame.full_set(), prior / denominator);
            mass
        };
        mass.validate(settings.tolerance)?;
        masses.insert(label.to_owned(), mass);
    }
    Ok(masses)
}
