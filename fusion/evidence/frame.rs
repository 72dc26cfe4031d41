use std::{fmt, sync::Arc};

use indexmap::IndexSet;

use crate::error::{FusionError, Result};

/// Largest frame representable by the `u128` focal-set encoding.
pub const MAX_LABELS: usize = 128;

/// Subset of a frame encoded as a bitset over label indices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct FocalSet(u128);

impl FocalSet {
    /// The empty set.
    pub const EMPTY: Self = Self(0);

    /// Set holding a single label index; empty when the index is not
    /// below [`MAX_LABELS`].
    #[must_use]
    pub const fn singleton(index: usize) -> Self {
        Self::EMPTY.with(index)
    }

    /// Raw bitset.
    #[must_use]
    pub const fn bits(self) -> u128 {
        self.0
    }

    /// Whether the index is a member.
    #[must_use]
    pub const fn contains(self, index: usize) -> bool {
        index < MAX_LABELS && self.0 & (1u128 << index) != 0
    }

    /// Adds a label index. Indices at or past [`MAX_LABELS`] leave the set
    /// unchanged.
    #[must_use]
    pub const fn with(self, index: usize) -> Self {
        if index < MAX_LABELS {
            Self(self.0 | (1u128 << index))
        } else {
            self
        }
    }

    /// Set intersection.
    #[must_use]
    pub const fn intersect(self, other: Self) -> Self {
        Self(self.0 & other.0)
    }

    /// Set union.
    #[must_use]
    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    /// Whether every member of `self` is in `other`.
    #[must_use]
    pub const fn is_subset_of(self, other: Self) -> bool {
        self.0 & !other.0 == 0
    }

    /// Whether the set is empty.
    #[must_use]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Cardinality.
    #[must_use]
    pub const fn len(self) -> usize {
        self.0.count_ones() as usize
    }

    /// Member indices in ascending order.
    pub fn indices(self) -> impl Iterator<Item = usize> {
        (0..MAX_LABELS).filter(move |idx| self.contains(*idx))
    }
}

/// Ordered set of mutually exclusive class labels shared by an ensemble run.
///
/// Cloning is cheap: the label set lives behind an `Arc`, and every mass
/// function built over the frame keeps a clone.
#[derive(Clone)]
pub struct Frame {
    labels: Arc<IndexSet<String>>,
}

impl Frame {
    /// Builds a frame, rejecting empty, duplicated or oversized label sets.
    pub fn new<S: Into<String>>(labels: impl IntoIterator<Item = S>) -> Result<Self> {
        let mut set = IndexSet::new();
        for label in labels {
            let label = label.into();
            if !set.insert(label.clone()) {
                return Err(FusionError::InvalidFrame(format!("duplicate label `{label}`")));
            }
        }
        if set.is_empty() {
            return Err(FusionError::InvalidFrame("frame has no labels".into()));
        }
        if set.len() > MAX_LABELS {
            return Err(FusionError::InvalidFrame(format!(
                "{} labels exceed the limit of {MAX_LABELS}",
                set.len()
            )));
        }
        Ok(Self {
            labels: Arc::new(set),
        })
    }

    /// Number of labels.
    #[must_use]
    pub fn len(&self) -> usize {
        self.labels.len()
    }

    /// Frames are never empty; provided for clippy symmetry with `len`.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    /// Labels in frame order.
    pub fn labels(&self) -> impl Iterator<Item = &str> {
        self.labels.iter().map(String::as_str)
    }

    /// Position of a label.
    #[must_use]
    pub fn index_of(&self, label: &str) -> Option<usize> {
        self.labels.get_index_of(label)
    }

    /// Label at a position.
    #[must_use]
    pub fn label(&self, index: usize) -> Option<&str> {
        self.labels.get_index(index).map(String::as_str)
    }

    /// Θ, the set of every label.
    #[must_use]
    pub fn full_set(&self) -> FocalSet {
        (0..self.len()).fold(FocalSet::EMPTY, FocalSet::with)
    }

    /// Singleton for a label.
    pub fn singleton(&self, label: &str) -> Result<FocalSet> {
        self.index_of(label)
            .map(FocalSet::singleton)
            .ok_or_else(|| FusionError::UnknownLabel {
                label: label.into(),
            })
    }

    /// Subset holding the given labels.
    pub fn set_of<S: AsRef<str>>(&self, labels: impl IntoIterator<Item = S>) -> Result<FocalSet> {
        labels.into_iter().try_fold(FocalSet::EMPTY, |set, label| {
            Ok(set.union(self.singleton(label.as_ref())?))
        })
    }

    /// Labels of a subset in frame order.
    #[must_use]
    pub fn labels_of(&self, set: FocalSet) -> Vec<String> {
        set.indices()
            .filter_map(|idx| self.label(idx).map(str::to_owned))
            .collect()
    }

    /// Whether every label of `self` also belongs to `other`.
    #[must_use]
    pub fn injects_into(&self, other: &Self) -> bool {
        self.labels().all(|label| other.index_of(label).is_some())
    }

    pub(crate) fn mismatch(&self, found: &Self) -> FusionError {
        FusionError::FrameMismatch {
            expected: self.labels().map(str::to_owned).collect(),
            found: found.labels().map(str::to_owned).collect(),
        }
    }
}

impl PartialEq for Frame {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.labels, &other.labels) || self.labels().eq(other.labels())
    }
}

impl Eq for Frame {}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.labels.iter()).finish()
    }
}
