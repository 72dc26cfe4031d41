use serde::Serialize;

use crate::{
    config::CombinationSettings,
    error::{FusionError, Result},
    mass::{MassFunction, DEFAULT_TOLERANCE},
};

/// Fused BPA together with the conflict that was renormalised away.
#[derive(Debug, Clone)]
pub struct Combination {
    /// Combined, renormalised BPA.
    pub mass: MassFunction,
    /// Conflict mass K. For a fold this is `1 - Π(1 - K_i)`, the share of the
    /// unnormalised product mass that landed on ∅ across every step.
    pub conflict: f64,
}

/// Summary of a combination, suitable for logs.
#[derive(Debug, Clone, Serialize)]
pub struct CombinationStats {
    /// Number of BPAs folded.
    pub sources: usize,
    /// Focal elements in the result.
    pub focal_elements: usize,
    /// Accumulated conflict.
    pub conflict: f64,
}

/// Dempster's rule of combination.
#[derive(Debug, Clone)]
pub struct CombinationEngine {
    conflict_epsilon: f64,
    tolerance: f64,
}

impl CombinationEngine {
    /// Engine treating K ≥ `1 - conflict_epsilon` as total conflict.
    #[must_use]
    pub const fn new(conflict_epsilon: f64) -> Self {
        Self {
            conflict_epsilon,
            tolerance: DEFAULT_TOLERANCE,
        }
    }

    /// Engine built from the `[combination]` config section.
    #[must_use]
    pub const fn from_settings(settings: &CombinationSettings) -> Self {
        Self::new(settings.conflict_epsilon)
    }

    /// Conflict threshold margin.
    #[must_use]
    pub const fn conflict_epsilon(&self) -> f64 {
        self.conflict_epsilon
    }

    /// Combines two BPAs defined over the same frame.
    pub fn combine(&self, left: &MassFunction, right: &MassFunction) -> Result<Combination> {
        if left.frame() != right.frame() {
            return Err(left.frame().mismatch(right.frame()));
        }
        let mut joint = MassFunction::accumulator(left.frame().clone());
        let mut conflict = 0.0;
        for (b, mass_b) in left.focal_elements() {
            for (c, mass_c) in right.focal_elements() {
                let product = mass_b * mass_c;
                let meet = b.intersect(c);
                if meet.is_empty() {
                    conflict += product;
                } else {
                    joint.add(meet, product);
                }
            }
        }
        // Compare the surviving mass rather than 1 - K so rounding in K cannot
        // hide a degenerate split.
        let agreement = joint.total();
        if agreement <= self.conflict_epsilon || conflict >= 1.0 - self.conflict_epsilon {
            return Err(FusionError::TotalConflict {
                conflict: conflict.min(1.0),
            });
        }
        joint.scale(1.0 / agreement);
        joint.validate(self.tolerance)?;
        Ok(Combination {
            mass: joint,
            conflict,
        })
    }

    /// Folds every BPA pairwise from the left.
    ///
    /// Dempster's rule is commutative and associative, so any ordering of
    /// the same BPAs yields the same result up to rounding.
    pub fn combine_all(&self, masses: &[MassFunction]) -> Result<Combination> {
        let (first, rest) = masses.split_first().ok_or(FusionError::NoEvidence)?;
        first.validate(self.tolerance)?;
        let mut fused = first.clone();
        let mut agreement = 1.0;
        for next in rest {
            let step = self.combine(&fused, next)?;
            agreement *= 1.0 - step.conflict;
            fused = step.mass;
        }
        Ok(Combination {
            mass: fused,
            conflict: 1.0 - agreement,
        })
    }

    /// Stats for logging.
    #[must_use]
    pub fn stats(combination: &Combination, sources: usize) -> CombinationStats {
        CombinationStats {
            sources,
            focal_elements: combination.mass.focal_count(),
            conflict: combination.conflict,
        }
    }
}

impl Default for CombinationEngine {
    fn default() -> Self {
        Self::from_settings(&CombinationSettings::default())
    }
}
