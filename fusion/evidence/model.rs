//! Classifier wrapper with a calibrate-once lifecycle.
//!
//! A [`Model`] starts [`Uncalibrated`]; [`Model::calibrate`] consumes it and
//! returns a [`Calibrated`] model whose reliability table is frozen. Only the
//! calibrated state can hand out evidence, so prediction before calibration
//! does not type-check:
//!
//! ```compile_fail
//! use ds_evidence::{FnPredictor, Frame, Model};
//!
//! let frame = Frame::new(["0", "1"]).unwrap();
//! let predictor = FnPredictor::new("const", |_: &u8| Ok::<_, anyhow::Error>("0".to_string()));
//! let model = Model::new("const", predictor, frame);
//! let _ = model.belief_for("0");
//! ```

use std::{fmt, sync::Arc};

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::json;
use uuid::Uuid;

use crate::{
    builder::{build_masses, ConfusionTable},
    config::CalibrationSettings,
    error::{FusionError, Result},
    frame::Frame,
    mass::{FocalMass, MassFunction},
    predictor::{Predictor, Preprocess, RawOutput},
    telemetry::{emit, FusionTelemetry, LogLevel},
};

/// Lifecycle marker: no reliability table yet.
#[derive(Debug, Clone, Copy, Default)]
pub struct Uncalibrated;

/// Lifecycle marker: reliability table frozen.
#[derive(Debug, Clone)]
pub struct Calibrated {
    table: CalibrationTable,
}

/// Predicted label → BPA table derived from held-out data.
#[derive(Debug, Clone)]
pub struct CalibrationTable {
    frame: Frame,
    rows: IndexMap<String, MassFunction>,
    fallback: Option<MassFunction>,
    confusion: Option<ConfusionTable>,
}

#[derive(Debug, Serialize, Deserialize)]
struct CalibrationSnapshot {
    frame: Vec<String>,
    rows: IndexMap<String, Vec<FocalMass>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    fallback: Option<Vec<FocalMass>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    confusion: Option<ConfusionTable>,
}

impl CalibrationTable {
    /// Table as produced by calibration: one row per label plus the
    /// total-ignorance fallback.
    fn calibrated(frame: &Frame, rows: IndexMap<String, MassFunction>, confusion: ConfusionTable) -> Self {
        Self {
            frame: frame.clone(),
            rows,
            fallback: Some(MassFunction::vacuous(frame)),
            confusion: Some(confusion),
        }
    }

    /// Frame of every row.
    #[must_use]
    pub const fn frame(&self) -> &Frame {
        &self.frame
    }

    /// BPA for a predicted label, falling back to total ignorance.
    pub fn get(&self, label: &str) -> Result<&MassFunction> {
        self.rows
            .get(label)
            .or(self.fallback.as_ref())
            .ok_or_else(|| FusionError::UnknownLabel {
                label: label.into(),
            })
    }

    /// Calibrated rows in frame order.
    pub fn rows(&self) -> impl Iterator<Item = (&str, &MassFunction)> {
        self.rows.iter().map(|(label, mass)| (label.as_str(), mass))
    }

    /// Ignorance fallback, if stored.
    #[must_use]
    pub const fn fallback(&self) -> Option<&MassFunction> {
        self.fallback.as_ref()
    }

    /// Confusion counts the rows were built from.
    #[must_use]
    pub const fn confusion(&self) -> Option<&ConfusionTable> {
        self.confusion.as_ref()
    }

    /// Serializes the table to JSON.
    pub fn to_json(&self) -> Result<String> {
        let snapshot = CalibrationSnapshot {
            frame: self.frame.labels().map(str::to_owned).collect(),
            rows: self
                .rows
                .iter()
                .map(|(label, mass)| (label.clone(), mass.to_snapshot()))
                .collect(),
            fallback: self.fallback.as_ref().map(MassFunction::to_snapshot),
            confusion: self.confusion.clone(),
        };
        Ok(serde_json::to_string_pretty(&snapshot)?)
    }

    /// Rebuilds a table from [`CalibrationTable::to_json`] output, validating every BPA.
    pub fn from_json(raw: &str) -> Result<Self> {
        let snapshot: CalibrationSnapshot = serde_json::from_str(raw)?;
        let frame = Frame::new(snapshot.frame)?;
        let mut rows = IndexMap::with_capacity(snapshot.rows.len());
        for (label, focal) in &snapshot.rows {
            frame.singleton(label)?;
            rows.insert(label.clone(), MassFunction::from_snapshot(&frame, focal)?);
        }
        let fallback = snapshot
            .fallback
            .as_deref()
            .map(|focal| MassFunction::from_snapshot(&frame, focal))
            .transpose()?;
        if let Some(confusion) = &snapshot.confusion {
            if !confusion.fits(&frame) {
                let (rows, columns) = confusion.shape();
                return Err(FusionError::InvalidMass(format!(
                    "stored confusion table of shape {rows}x{columns} does not match a frame of {} labels",
                    frame.len()
                )));
            }
        }
        Ok(Self {
            frame,
            rows,
            fallback,
            confusion: snapshot.confusion,
        })
    }
}

/// Trained classifier plus optional preprocessing and, once calibrated, its
/// reliability table.
pub struct Model<I, S = Uncalibrated> {
    id: Uuid,
    name: String,
    frame: Frame,
    predictor: Arc<dyn Predictor<I>>,
    preprocess: Option<Preprocess<I>>,
    telemetry: Option<FusionTelemetry>,
    state: S,
}

impl<I, S> Model<I, S> {
    /// Unique id assigned at construction.
    #[must_use]
    pub const fn id(&self) -> Uuid {
        self.id
    }

    /// Display name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Declared output labels.
    #[must_use]
    pub const fn frame(&self) -> &Frame {
        &self.frame
    }

    /// Family reported by the wrapped predictor.
    #[must_use]
    pub fn family(&self) -> &str {
        self.predictor.family()
    }

    /// Runs preprocessing (if any) and the predictor; returns the native output.
    pub fn predict_raw(&self, input: &I) -> Result<RawOutput> {
        let output = match &self.preprocess {
            Some(preprocess) => {
                let prepared = preprocess(input).map_err(|source| FusionError::Preprocessing {
                    model: self.name.clone(),
                    source,
                })?;
                self.predictor.predict(&prepared)
            }
            None => self.predictor.predict(input),
        };
        output.map_err(|source| FusionError::Predictor {
            model: self.name.clone(),
            source,
        })
    }

    fn into_state<T>(self, state: T) -> Model<I, T> {
        Model {
            id: self.id,
            name: self.name,
            frame: self.frame,
            predictor: self.predictor,
            preprocess: self.preprocess,
            telemetry: self.telemetry,
            state,
        }
    }
}

impl<I> Model<I, Uncalibrated> {
    /// Wraps a trained predictor whose outputs are drawn from `frame`.
    pub fn new(name: impl Into<String>, predictor: impl Predictor<I> + 'static, frame: Frame) -> Self {
        Self::from_shared(name, Arc::new(predictor), frame)
    }

    /// Wraps a predictor that is already shared.
    pub fn from_shared(name: impl Into<String>, predictor: Arc<dyn Predictor<I>>, frame: Frame) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            frame,
            predictor,
            preprocess: None,
            telemetry: None,
            state: Uncalibrated,
        }
    }

    /// Applies `preprocess` to every input before it reaches the predictor.
    #[must_use]
    pub fn with_preprocess<F>(mut self, preprocess: F) -> Self
    where
        F: Fn(&I) -> anyhow::Result<I> + Send + Sync + 'static,
    {
        self.preprocess = Some(Arc::new(preprocess));
        self
    }

    /// Attaches structured logging.
    #[must_use]
    pub fn with_telemetry(mut self, telemetry: FusionTelemetry) -> Self {
        self.telemetry = Some(telemetry);
        self
    }

    /// Calibrates with default settings. See [`Model::calibrate_with`].
    pub fn calibrate<L: AsRef<str>>(self, inputs: &[I], labels: &[L]) -> Result<Model<I, Calibrated>> {
        self.calibrate_with(inputs, labels, &CalibrationSettings::default())
    }

    /// Predicts every held-out input, tabulates predicted against true labels
    /// and freezes one BPA per predicted label.
    pub fn calibrate_with<L: AsRef<str>>(
        self,
        inputs: &[I],
        labels: &[L],
        settings: &CalibrationSettings,
    ) -> Result<Model<I, Calibrated>> {
        if inputs.is_empty() {
            return Err(FusionError::EmptyCalibrationSet { model: self.name });
        }
        if inputs.len() != labels.len() {
            return Err(FusionError::CalibrationLengthMismatch {
                inputs: inputs.len(),
                labels: labels.len(),
            });
        }
        let mut confusion = ConfusionTable::new(&self.frame);
        for (input, truth) in inputs.iter().zip(labels) {
            let raw = self.predict_raw(input)?;
            let predicted = raw
                .resolve(&self.frame)
                .and_then(|label| self.frame.index_of(label))
                .ok_or_else(|| FusionError::UnknownLabel {
                    label: raw.describe(),
                })?;
            let truth = self
                .frame
                .index_of(truth.as_ref())
                .ok_or_else(|| FusionError::UnknownLabel {
                    label: truth.as_ref().into(),
                })?;
            confusion.record(predicted, truth);
        }
        let rows = build_masses(&confusion, &self.frame, settings)?;
        emit(
            self.telemetry.as_ref(),
            LogLevel::Info,
            "fusion.model.calibrated",
            json!({
                "model": self.name,
                "model_id": self.id,
                "family": self.family(),
                "samples": confusion.total(),
                "accuracy": confusion.accuracy(),
            }),
        );
        let table = CalibrationTable::calibrated(&self.frame, rows, confusion);
        Ok(self.into_state(Calibrated { table }))
    }

    /// Reuses a previously exported calibration table instead of recalibrating.
    pub fn restore(self, table: CalibrationTable) -> Result<Model<I, Calibrated>> {
        if table.frame != self.frame {
            return Err(self.frame.mismatch(&table.frame));
        }
        if table.rows.is_empty() && table.fallback.is_none() {
            return Err(FusionError::UncalibratedModel { model: self.name });
        }
        Ok(self.into_state(Calibrated { table }))
    }
}

impl<I> Model<I, Calibrated> {
    /// Frozen reliability table.
    #[must_use]
    pub const fn calibration(&self) -> &CalibrationTable {
        &self.state.table
    }

    /// BPA the model contributes when it predicts `label`.
    pub fn belief_for(&self, label: &str) -> Result<&MassFunction> {
        self.state.table.get(label)
    }

    /// Label predicted for `input`, resolved against the frame.
    pub fn predict_label(&self, input: &I) -> Result<String> {
        let raw = self.predict_raw(input)?;
        Ok(raw
            .resolve(&self.frame)
            .map_or_else(|| raw.describe(), str::to_owned))
    }

    /// Predicts `input` and looks up the matching BPA. Outputs outside the
    /// calibrated rows resolve to the ignorance fallback.
    pub fn evidence_for(&self, input: &I) -> Result<(String, &MassFunction)> {
        let label = self.predict_label(input)?;
        let mass = self.belief_for(&label)?;
        Ok((label, mass))
    }

    pub(crate) const fn telemetry(&self) -> Option<&FusionTelemetry> {
        self.telemetry.as_ref()
    }
}

impl<I, S: fmt::Debug> fmt::Debug for Model<I, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Model")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("family", &self.predictor.family())
            .field("frame", &self.frame)
            .field("preprocess", &self.preprocess.is_some())
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::predictor::FnPredictor;

    fn frame() -> Frame {
        Frame::new(["0", "1", "2"]).unwrap()
    }

    /// Predicts the integer part of the input, clamped into the frame.
    fn floor_model() -> Model<f64> {
        let predictor = FnPredictor::new("floor", |x: &f64| {
            Ok::<_, anyhow::Error>(x.floor().clamp(0.0, 2.0).to_string())
        });
        Model::new("floor", predictor, frame())
    }

    #[test]
    fn calibration_builds_rows_and_fallback() {
        let inputs = [0.1, 0.2, 1.5, 1.7, 2.2];
        let labels = ["0", "0", "1", "2", "2"];
        let model = floor_model().calibrate(&inputs, &labels).unwrap();
        let one = model.belief_for("1").unwrap();
        let frame = model.frame().clone();
        assert!((one.mass_of(frame.singleton("1").unwrap()) - 1.0 / 3.0).abs() < 1e-12);
        assert!((one.mass_of(frame.set_of(["1", "2"]).unwrap()) - 1.0 / 3.0).abs() < 1e-12);
        assert!((one.mass_of(frame.full_set()) - 1.0 / 3.0).abs() < 1e-12);
        assert!(model.calibration().fallback().is_some());
        assert_eq!(model.calibration().confusion().unwrap().total(), 5);
        assert!(model.belief_for("unseen").unwrap().approx_eq(&MassFunction::vacuous(&frame), 0.0));
    }

    #[test]
    fn empty_or_mismatched_calibration_sets_fail() {
        let err = floor_model().calibrate::<&str>(&[], &[]).unwrap_err();
        assert!(matches!(err, FusionError::EmptyCalibrationSet { .. }));
        let err = floor_model().calibrate(&[0.5], &["0", "1"]).unwrap_err();
        assert!(matches!(err, FusionError::CalibrationLengthMismatch { inputs: 1, labels: 2 }));
        let err = floor_model().calibrate(&[0.5], &["9"]).unwrap_err();
        assert!(matches!(err, FusionError::UnknownLabel { .. }));
    }

    #[test]
    fn preprocessing_runs_before_the_predictor() {
        let model = floor_model().with_preprocess(|x: &f64| Ok(x + 1.0));
        assert_eq!(model.predict_raw(&0.5).unwrap(), RawOutput::Label("1".into()));

        let failing = floor_model().with_preprocess(|_: &f64| Err(anyhow::anyhow!("bad scale")));
        assert!(matches!(
            failing.predict_raw(&0.5),
            Err(FusionError::Preprocessing { .. })
        ));
    }

    #[test]
    fn predictor_failures_are_tagged_with_the_model() {
        let predictor = FnPredictor::new("broken", |_: &f64| -> anyhow::Result<String> {
            anyhow::bail!("weights missing")
        });
        let model = Model::new("broken", predictor, frame());
        match model.predict_raw(&0.0) {
            Err(FusionError::Predictor { model, .. }) => assert_eq!(model, "broken"),
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn calibration_table_round_trips_through_json() {
        let model = floor_model().calibrate(&[0.1, 1.1, 1.9], &["0", "1", "2"]).unwrap();
        let json = model.calibration().to_json().unwrap();
        let table = CalibrationTable::from_json(&json).unwrap();
        let restored = floor_model().restore(table).unwrap();
        for label in ["0", "1", "2"] {
            assert!(restored
                .belief_for(label)
                .unwrap()
                .approx_eq(model.belief_for(label).unwrap(), 1e-12));
        }
    }

    #[test]
    fn restore_rejects_empty_tables_and_foreign_frames() {
        let empty = CalibrationTable::from_json(r#"{ "frame": ["0", "1", "2"], "rows": {} }"#).unwrap();
        assert!(matches!(
            floor_model().restore(empty),
            Err(FusionError::UncalibratedModel { .. })
        ));

        let foreign = CalibrationTable::from_json(r#"{ "frame": ["a", "b"], "rows": {} }"#).unwrap();
        assert!(matches!(
            floor_model().restore(foreign),
            Err(FusionError::FrameMismatch { .. })
        ));
    }

    #[test]
    fn stored_confusion_must_match_the_frame() {
        let narrow = r#"{ "frame": ["0", "1", "2"],
            "rows": { "0": [{ "labels": ["0"], "mass": 1.0 }] },
            "confusion": { "counts": { "v": 1, "dim": [3, 1], "data": [1, 0, 0] } } }"#;
        assert!(matches!(
            CalibrationTable::from_json(narrow),
            Err(FusionError::InvalidMass(_))
        ));

        let square = r#"{ "frame": ["0", "1"],
            "rows": { "0": [{ "labels": ["0"], "mass": 1.0 }] },
            "confusion": { "counts": { "v": 1, "dim": [2, 2], "data": [1, 0, 0, 0] } } }"#;
        let table = CalibrationTable::from_json(square).unwrap();
        assert_eq!(table.confusion().unwrap().shape(), (2, 2));
    }

    #[test]
    fn tables_without_fallback_surface_unknown_labels() {
        let raw = r#"{ "frame": ["0", "1", "2"], "rows": { "0": [{ "labels": ["0"], "mass": 1.0 }] } }"#;
        let model = floor_model().restore(CalibrationTable::from_json(raw).unwrap()).unwrap();
        assert!(model.belief_for("0").is_ok());
        assert!(matches!(
            model.belief_for("2"),
            Err(FusionError::UnknownLabel { .. })
        ));
    }
}
