use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::{
    error::{FusionError, Result},
    frame::FocalSet,
    mass::MassFunction,
};

/// Score used to rank singleton labels.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Metric {
    /// Bel({x}).
    #[default]
    #[serde(alias = "bel")]
    Belief,
    /// Pl({x}).
    #[serde(alias = "pl")]
    Plausibility,
    /// m({x}).
    #[serde(alias = "mass")]
    RawMass,
}

impl Metric {
    /// Short name as accepted on the command line.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Belief => "bel",
            Self::Plausibility => "pl",
            Self::RawMass => "mass",
        }
    }

    /// Evaluates the metric on a subset.
    #[must_use]
    pub fn score(self, mass: &MassFunction, set: FocalSet) -> f64 {
        match self {
            Self::Belief => mass.belief(set),
            Self::Plausibility => mass.plausibility(set),
            Self::RawMass => mass.mass_of(set),
        }
    }
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Metric {
    type Err = String;

    fn from_str(value: &str) -> std::result::Result<Self, Self::Err> {
        match value.to_ascii_lowercase().as_str() {
            "bel" | "belief" => Ok(Self::Belief),
            "pl" | "plausibility" => Ok(Self::Plausibility),
            "mass" | "raw_mass" => Ok(Self::RawMass),
            other => Err(format!("unknown decision metric `{other}` (expected bel, pl or mass)")),
        }
    }
}

/// Final output for one inference instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    /// Winning label.
    pub label: String,
    /// Position of the label in the frame.
    pub index: usize,
    /// Metric that ranked the labels.
    pub metric: Metric,
    /// Metric value of the winning label.
    pub value: f64,
}

/// Metric value of every singleton, in frame order.
#[must_use]
pub fn scores(mass: &MassFunction, metric: Metric) -> Vec<f64> {
    (0..mass.frame().len())
        .map(|idx| metric.score(mass, FocalSet::singleton(idx)))
        .collect()
}

/// Picks the label with the highest metric value.
///
/// Several labels can share the top score (e.g. plausibility when most mass
/// sits on Θ); the lowest frame index wins.
pub fn decide(mass: &MassFunction, metric: Metric) -> Result<Decision> {
    let scored = scores(mass, metric);
    let mut best: Option<(usize, f64)> = None;
    for (idx, value) in scored.into_iter().enumerate() {
        if best.map_or(true, |(_, top)| value > top) {
            best = Some((idx, value));
        }
    }
    let (index, value) = best.ok_or(FusionError::NoEvidence)?;
    let label = mass
        .frame()
        .label(index)
        .ok_or(FusionError::NoEvidence)?
        .to_owned();
    Ok(Decision {
        label,
        index,
        metric,
        value,
    })
}
