use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::{
    error::{FusionError, Result},
    frame::{FocalSet, Frame},
};

/// Default tolerance when checking that masses sum to one.
pub const DEFAULT_TOLERANCE: f64 = 1e-9;

/// Basic probability assignment over the subsets of a frame.
///
/// Only focal elements (subsets with nonzero mass) are stored, keyed by their
/// bitset encoding, so the power set is never materialised. Iteration order is
/// the ascending bitset order, which keeps every derived computation
/// deterministic.
#[derive(Debug, Clone, PartialEq)]
pub struct MassFunction {
    frame: Frame,
    focal: BTreeMap<FocalSet, f64>,
}

impl MassFunction {
    /// Accumulator with no mass at all. Not a valid BPA until filled.
    pub(crate) fn accumulator(frame: Frame) -> Self {
        Self {
            frame,
            focal: BTreeMap::new(),
        }
    }

    /// Total ignorance: all mass on Θ.
    #[must_use]
    pub fn vacuous(frame: &Frame) -> Self {
        let mut mass = Self::accumulator(frame.clone());
        mass.add(frame.full_set(), 1.0);
        mass
    }

    /// Full commitment to a single label.
    pub fn certain(frame: &Frame, label: &str) -> Result<Self> {
        let mut mass = Self::accumulator(frame.clone());
        mass.add(frame.singleton(label)?, 1.0);
        Ok(mass)
    }

    /// Builds a validated BPA from encoded focal sets.
    pub fn from_focal(frame: &Frame, focal: impl IntoIterator<Item = (FocalSet, f64)>) -> Result<Self> {
        let mut mass = Self::accumulator(frame.clone());
        for (set, value) in focal {
            if !value.is_finite() || value < 0.0 {
                return Err(FusionError::InvalidMass(format!(
                    "mass {value} on {:?} is not a finite non-negative number",
                    frame.labels_of(set)
                )));
            }
            if set.is_empty() && value > 0.0 {
                return Err(FusionError::InvalidMass("mass assigned to the empty set".into()));
            }
            mass.add(set, value);
        }
        mass.validate(DEFAULT_TOLERANCE)?;
        Ok(mass)
    }

    /// Builds a validated BPA from label lists, e.g. `(["0", "1"], 0.3)`.
    pub fn from_labeled<L, S>(frame: &Frame, focal: impl IntoIterator<Item = (L, f64)>) -> Result<Self>
    where
        L: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let encoded = focal
            .into_iter()
            .map(|(labels, value)| Ok((frame.set_of(labels)?, value)))
            .collect::<Result<Vec<_>>>()?;
        Self::from_focal(frame, encoded)
    }

    pub(crate) fn add(&mut self, set: FocalSet, value: f64) {
        if value > 0.0 {
            *self.focal.entry(set).or_insert(0.0) += value;
        }
    }

    pub(crate) fn scale(&mut self, factor: f64) {
        for value in self.focal.values_mut() {
            *value *= factor;
        }
    }

    /// Checks the BPA invariants: finite non-negative masses, nothing on ∅,
    /// every focal set inside Θ, and a total of one within `tolerance`.
    pub fn validate(&self, tolerance: f64) -> Result<()> {
        let theta = self.frame.full_set();
        for (set, value) in &self.focal {
            if !value.is_finite() || *value < 0.0 {
                return Err(FusionError::InvalidMass(format!(
                    "mass {value} on {:?}",
                    self.frame.labels_of(*set)
                )));
            }
            if set.is_empty() {
                return Err(FusionError::InvalidMass("mass assigned to the empty set".into()));
            }
            if !set.is_subset_of(theta) {
                return Err(FusionError::InvalidMass(format!(
                    "focal set {:#x} lies outside the frame",
                    set.bits()
                )));
            }
        }
        let total = self.total();
        if (total - 1.0).abs() > tolerance {
            return Err(FusionError::InvalidMass(format!("masses sum to {total}, expected 1")));
        }
        Ok(())
    }

    /// Frame the BPA is defined over.
    #[must_use]
    pub const fn frame(&self) -> &Frame {
        &self.frame
    }

    /// Sum of every focal mass.
    #[must_use]
    pub fn total(&self) -> f64 {
        self.focal.values().sum()
    }

    /// Focal elements in ascending bitset order.
    pub fn focal_elements(&self) -> impl Iterator<Item = (FocalSet, f64)> + '_ {
        self.focal.iter().map(|(set, value)| (*set, *value))
    }

    /// Number of focal elements.
    #[must_use]
    pub fn focal_count(&self) -> usize {
        self.focal.len()
    }

    /// m(A).
    #[must_use]
    pub fn mass_of(&self, set: FocalSet) -> f64 {
        self.focal.get(&set).copied().unwrap_or(0.0)
    }

    /// Bel(A): mass of every focal set contained in A.
    #[must_use]
    pub fn belief(&self, set: FocalSet) -> f64 {
        self.focal
            .iter()
            .filter(|(focal, _)| focal.is_subset_of(set))
            .map(|(_, value)| value)
            .sum()
    }

    /// Pl(A): mass of every focal set intersecting A.
    #[must_use]
    pub fn plausibility(&self, set: FocalSet) -> f64 {
        self.focal
            .iter()
            .filter(|(focal, _)| !focal.intersect(set).is_empty())
            .map(|(_, value)| value)
            .sum()
    }

    /// Whether both BPAs share a frame and agree on every focal mass within `tolerance`.
    #[must_use]
    pub fn approx_eq(&self, other: &Self, tolerance: f64) -> bool {
        if self.frame != other.frame {
            return false;
        }
        self.focal
            .keys()
            .chain(other.focal.keys())
            .all(|set| (self.mass_of(*set) - other.mass_of(*set)).abs() <= tolerance)
    }

    /// Carries the BPA over to a frame this one injects into.
    ///
    /// Θ of the source maps to Θ of the target: a model that cannot name a
    /// label has no evidence against it.
    pub fn remap(&self, target: &Frame) -> Result<Self> {
        if self.frame == *target {
            return Ok(self.clone());
        }
        if !self.frame.injects_into(target) {
            return Err(target.mismatch(&self.frame));
        }
        let source_theta = self.frame.full_set();
        let mut remapped = Self::accumulator(target.clone());
        for (set, value) in &self.focal {
            let mapped = if *set == source_theta {
                target.full_set()
            } else {
                target.set_of(self.frame.labels_of(*set))?
            };
            remapped.add(mapped, *value);
        }
        Ok(remapped)
    }

    /// Serializable form keyed by label lists.
    #[must_use]
    pub fn to_snapshot(&self) -> Vec<FocalMass> {
        self.focal
            .iter()
            .map(|(set, value)| FocalMass {
                labels: self.frame.labels_of(*set),
                mass: *value,
            })
            .collect()
    }

    /// Rebuilds a BPA from its snapshot form.
    pub fn from_snapshot(frame: &Frame, snapshot: &[FocalMass]) -> Result<Self> {
        Self::from_labeled(
            frame,
            snapshot
                .iter()
                .map(|entry| (entry.labels.iter().map(String::as_str), entry.mass)),
        )
    }
}

/// One focal element in snapshot form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FocalMass {
    /// Labels of the focal set.
    pub labels: Vec<String>,
    /// Mass carried by the set.
    pub mass: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame() -> Frame {
        Frame::new(["0", "1", "2"]).unwrap()
    }

    #[test]
    fn vacuous_bpa_is_valid() {
        let frame = frame();
        let vacuous = MassFunction::vacuous(&frame);
        vacuous.validate(DEFAULT_TOLERANCE).unwrap();
        assert_eq!(vacuous.mass_of(frame.full_set()), 1.0);
        assert_eq!(vacuous.focal_count(), 1);
    }

    #[test]
    fn rejects_broken_assignments() {
        let frame = frame();
        assert!(MassFunction::from_labeled(&frame, [(vec!["0"], 0.5)]).is_err());
        assert!(MassFunction::from_labeled(&frame, [(vec!["0"], -0.5), (vec!["1"], 1.5)]).is_err());
        assert!(MassFunction::from_focal(&frame, [(FocalSet::EMPTY, 1.0)]).is_err());
        assert!(MassFunction::from_labeled(&frame, [(vec!["9"], 1.0)]).is_err());
        assert!(MassFunction::from_labeled(&frame, [(vec!["0"], f64::NAN)]).is_err());
    }

    #[test]
    fn belief_and_plausibility_bracket_each_label() {
        let frame = frame();
        let bpa = MassFunction::from_labeled(
            &frame,
            [
                (vec!["0"], 0.5),
                (vec!["0", "1"], 0.2),
                (vec!["0", "1", "2"], 0.3),
            ],
        )
        .unwrap();
        let zero = frame.singleton("0").unwrap();
        let one = frame.singleton("1").unwrap();
        assert!((bpa.belief(zero) - 0.5).abs() < 1e-12);
        assert!((bpa.plausibility(zero) - 1.0).abs() < 1e-12);
        assert!((bpa.belief(one) - 0.0).abs() < 1e-12);
        assert!((bpa.plausibility(one) - 0.5).abs() < 1e-12);
        let pair = frame.set_of(["0", "1"]).unwrap();
        assert!((bpa.belief(pair) - 0.7).abs() < 1e-12);
    }

    #[test]
    fn remap_keeps_ignorance_total() {
        let small = Frame::new(["1", "0"]).unwrap();
        let large = frame();
        let bpa = MassFunction::from_labeled(&small, [(vec!["0"], 0.6), (vec!["1", "0"], 0.4)]).unwrap();
        let remapped = bpa.remap(&large).unwrap();
        assert!((remapped.mass_of(large.singleton("0").unwrap()) - 0.6).abs() < 1e-12);
        assert!((remapped.mass_of(large.full_set()) - 0.4).abs() < 1e-12);
        assert!(matches!(
            MassFunction::vacuous(&large).remap(&small),
            Err(FusionError::FrameMismatch { .. })
        ));
    }

    #[test]
    fn snapshot_restores_masses() {
        let frame = frame();
        let bpa = MassFunction::from_labeled(&frame, [(vec!["2"], 0.25), (vec!["0", "1", "2"], 0.75)]).unwrap();
        let snapshot = bpa.to_snapshot();
        assert_eq!(snapshot[0].labels, vec!["2"]);
        let restored = MassFunction::from_snapshot(&frame, &snapshot).unwrap();
        assert!(restored.approx_eq(&bpa, 0.0));
    }
}
