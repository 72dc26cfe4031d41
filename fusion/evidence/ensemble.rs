use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use futures::future::join_all;
use serde::Serialize;
use serde_json::json;
use tokio::sync::Semaphore;
use uuid::Uuid;

use crate::{
    combination::{Combination, CombinationEngine},
    config::{BatchFailurePolicy, ConflictPolicy, FusionConfig},
    decision::{decide, Decision, Metric},
    error::{FusionError, Result},
    frame::Frame,
    mass::MassFunction,
    model::{Calibrated, Model},
    telemetry::{emit, FusionTelemetry, LogLevel},
};

/// Outcome of one instance in a batch.
pub type InstanceOutcome = Result<Decision>;

/// Label a single model predicted for an instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ModelVote {
    /// Model name.
    pub model: String,
    /// Predicted label (or a description of an out-of-frame output).
    pub label: String,
}

/// Combined evidence for one instance.
#[derive(Debug, Clone)]
pub struct FusedBelief {
    /// Fused BPA over the ensemble frame.
    pub mass: MassFunction,
    /// Accumulated conflict renormalised away.
    pub conflict: f64,
    /// Per-model predictions, in model order.
    pub votes: Vec<ModelVote>,
    /// Models dropped under [`ConflictPolicy::SkipConflicting`].
    pub skipped: Vec<String>,
}

/// Calibrated models fused with Dempster's rule.
///
/// Models are read-only once calibrated, so an ensemble can be shared across
/// threads (see [`Ensemble::predict_parallel`]) and reused across batches.
#[derive(Debug)]
pub struct Ensemble<I> {
    id: Uuid,
    frame: Frame,
    models: Vec<Model<I, Calibrated>>,
    engine: CombinationEngine,
    config: FusionConfig,
    telemetry: Option<FusionTelemetry>,
}

impl<I> Ensemble<I> {
    /// Builds an ensemble over the largest model frame. Every other model
    /// frame must inject into it.
    pub fn new(models: Vec<Model<I, Calibrated>>, config: FusionConfig) -> Result<Self> {
        let reference = models
            .iter()
            .enumerate()
            .max_by(|(left_idx, left), (right_idx, right)| {
                left.frame()
                    .len()
                    .cmp(&right.frame().len())
                    .then(right_idx.cmp(left_idx))
            })
            .map(|(_, model)| model.frame().clone())
            .ok_or(FusionError::NoEvidence)?;
        if let Some(model) = models.iter().find(|model| !model.frame().injects_into(&reference)) {
            return Err(reference.mismatch(model.frame()));
        }
        let telemetry = models.iter().find_map(|model| model.telemetry().cloned());
        Ok(Self {
            id: Uuid::new_v4(),
            frame: reference,
            engine: CombinationEngine::from_settings(&config.combination),
            models,
            config,
            telemetry,
        })
    }

    /// Replaces the structured logging handle.
    #[must_use]
    pub fn with_telemetry(mut self, telemetry: FusionTelemetry) -> Self {
        self.telemetry = Some(telemetry);
        self
    }

    /// Ensemble frame.
    #[must_use]
    pub const fn frame(&self) -> &Frame {
        &self.frame
    }

    /// Member models in fold order.
    #[must_use]
    pub fn models(&self) -> &[Model<I, Calibrated>] {
        &self.models
    }

    /// Active configuration.
    #[must_use]
    pub const fn config(&self) -> &FusionConfig {
        &self.config
    }

    /// Metric configured under `[decision]`.
    #[must_use]
    pub const fn default_metric(&self) -> Metric {
        self.config.decision.metric
    }

    /// Queries every model and fuses their evidence for one input.
    pub fn fuse(&self, input: &I) -> Result<FusedBelief> {
        let mut votes = Vec::with_capacity(self.models.len());
        let mut evidence = Vec::with_capacity(self.models.len());
        for model in &self.models {
            let (label, mass) = model.evidence_for(input)?;
            evidence.push(mass.remap(&self.frame)?);
            votes.push(ModelVote {
                model: model.name().to_owned(),
                label,
            });
        }
        let (combination, skipped) = match self.config.combination.conflict_policy {
            ConflictPolicy::Fail => (self.engine.combine_all(&evidence)?, Vec::new()),
            ConflictPolicy::SkipConflicting => self.fold_skipping(&evidence)?,
        };
        Ok(FusedBelief {
            mass: combination.mass,
            conflict: combination.conflict,
            votes,
            skipped,
        })
    }

    /// Fuses and decides one input.
    pub fn predict_one(&self, input: &I, metric: Metric) -> Result<Decision> {
        decide(&self.fuse(input)?.mass, metric)
    }

    /// Decides every input in order. Failures stay local to their instance
    /// unless the batch policy is [`BatchFailurePolicy::Abort`].
    pub fn predict(&self, inputs: &[I], metric: Metric) -> Result<Vec<InstanceOutcome>> {
        self.run_batch(inputs, metric, None)
    }

    /// Like [`Ensemble::predict`], checking `cancel` between instances.
    /// Instances left after cancellation report [`FusionError::Cancelled`].
    pub fn predict_cancellable(
        &self,
        inputs: &[I],
        metric: Metric,
        cancel: &AtomicBool,
    ) -> Result<Vec<InstanceOutcome>> {
        self.run_batch(inputs, metric, Some(cancel))
    }

    fn run_batch(
        &self,
        inputs: &[I],
        metric: Metric,
        cancel: Option<&AtomicBool>,
    ) -> Result<Vec<InstanceOutcome>> {
        let batch_id = Uuid::new_v4();
        self.log(
            LogLevel::Info,
            "fusion.batch.started",
            json!({ "batch_id": batch_id, "ensemble_id": self.id, "instances": inputs.len(), "metric": metric }),
        );
        let mut outcomes = Vec::with_capacity(inputs.len());
        for (index, input) in inputs.iter().enumerate() {
            if cancel.is_some_and(|flag| flag.load(Ordering::Relaxed)) {
                outcomes.push(Err(FusionError::Cancelled));
                continue;
            }
            match self.predict_one(input, metric) {
                Ok(decision) => outcomes.push(Ok(decision)),
                Err(err) => {
                    self.log_failure(batch_id, index, &err);
                    if self.config.batch.failure_policy == BatchFailurePolicy::Abort {
                        self.log_aborted(batch_id, index);
                        return Err(FusionError::BatchAborted {
                            index,
                            source: Box::new(err),
                        });
                    }
                    outcomes.push(Err(err));
                }
            }
        }
        self.log_summary(batch_id, &outcomes);
        Ok(outcomes)
    }

    /// Drops the most conflicting model until the remaining evidence fuses.
    ///
    /// The candidate is the model in total conflict with the most other
    /// models; ties go to the removal leaving the least residual conflict,
    /// then to the later model.
    fn fold_skipping(&self, evidence: &[MassFunction]) -> Result<(Combination, Vec<String>)> {
        let mut active: Vec<usize> = (0..evidence.len()).collect();
        let mut skipped = Vec::new();
        loop {
            match self.fold_members(evidence, &active) {
                Ok(combination) => return Ok((combination, skipped)),
                Err(FusionError::TotalConflict { conflict }) if active.len() > 1 => {
                    let (dropped, clashes) = self
                        .most_conflicting(evidence, &active)
                        .ok_or(FusionError::NoEvidence)?;
                    let name = self.models.get(dropped).map_or("?", |model| model.name());
                    self.log(
                        LogLevel::Warn,
                        "fusion.model.skipped",
                        json!({ "model": name, "conflict": conflict, "clashes": clashes }),
                    );
                    skipped.push(name.to_owned());
                    active.retain(|idx| *idx != dropped);
                }
                Err(err) => return Err(err),
            }
        }
    }

    fn fold_members(&self, evidence: &[MassFunction], members: &[usize]) -> Result<Combination> {
        let subset: Vec<MassFunction> = members.iter().map(|idx| evidence[*idx].clone()).collect();
        self.engine.combine_all(&subset)
    }

    /// Returns the removal candidate and the number of models it totally
    /// conflicts with.
    fn most_conflicting(&self, evidence: &[MassFunction], active: &[usize]) -> Option<(usize, usize)> {
        active
            .iter()
            .map(|&candidate| {
                let clashes = active
                    .iter()
                    .filter(|&&other| {
                        other != candidate
                            && matches!(
                                self.engine.combine(&evidence[candidate], &evidence[other]),
                                Err(FusionError::TotalConflict { .. })
                            )
                    })
                    .count();
                let rest: Vec<usize> = active.iter().copied().filter(|idx| *idx != candidate).collect();
                let residual = self
                    .fold_members(evidence, &rest)
                    .map_or(f64::INFINITY, |combination| combination.conflict);
                (candidate, clashes, residual)
            })
            .max_by(|left, right| {
                left.1
                    .cmp(&right.1)
                    .then(right.2.total_cmp(&left.2))
                    .then(left.0.cmp(&right.0))
            })
            .map(|(candidate, clashes, _)| (candidate, clashes))
    }

    fn log_summary(&self, batch_id: Uuid, outcomes: &[InstanceOutcome]) {
        let failed = outcomes.iter().filter(|outcome| outcome.is_err()).count();
        self.log(
            LogLevel::Info,
            "fusion.batch.completed",
            json!({
                "batch_id": batch_id,
                "instances": outcomes.len(),
                "decided": outcomes.len() - failed,
                "failed": failed,
            }),
        );
    }

    fn log_failure(&self, batch_id: Uuid, index: usize, err: &FusionError) {
        self.log(
            LogLevel::Warn,
            "fusion.instance.failed",
            json!({ "batch_id": batch_id, "index": index, "error": err.to_string() }),
        );
    }

    fn log_aborted(&self, batch_id: Uuid, index: usize) {
        self.log(
            LogLevel::Error,
            "fusion.batch.aborted",
            json!({ "batch_id": batch_id, "index": index }),
        );
    }

    fn log(&self, level: LogLevel, message: &str, metadata: serde_json::Value) {
        emit(self.telemetry.as_ref(), level, message, metadata);
    }
}

impl<I: Send + 'static> Ensemble<I> {
    /// Decides every input on blocking worker tasks, at most
    /// `batch.workers` at a time, returning outcomes in input order.
    ///
    /// Under [`BatchFailurePolicy::Abort`] the first failing index is reported
    /// after all workers finish.
    pub async fn predict_parallel(self: Arc<Self>, inputs: Vec<I>, metric: Metric) -> Result<Vec<InstanceOutcome>> {
        let workers = self.config.batch.effective_workers();
        let semaphore = Arc::new(Semaphore::new(workers));
        let batch_id = Uuid::new_v4();
        self.log(
            LogLevel::Info,
            "fusion.batch.started",
            json!({ "batch_id": batch_id, "ensemble_id": self.id, "instances": inputs.len(), "workers": workers, "metric": metric }),
        );
        let tasks = inputs.into_iter().map(|input| {
            let ensemble = Arc::clone(&self);
            let semaphore = Arc::clone(&semaphore);
            async move {
                let _permit = semaphore
                    .acquire_owned()
                    .await
                    .map_err(|_| FusionError::Worker("semaphore closed".into()))?;
                tokio::task::spawn_blocking(move || ensemble.predict_one(&input, metric))
                    .await
                    .map_err(|err| FusionError::Worker(err.to_string()))?
            }
        });
        let outcomes: Vec<InstanceOutcome> = join_all(tasks).await;
        for (index, outcome) in outcomes.iter().enumerate() {
            if let Err(err) = outcome {
                self.log_failure(batch_id, index, err);
            }
        }
        if self.config.batch.failure_policy == BatchFailurePolicy::Abort {
            if let Some(index) = outcomes.iter().position(Result::is_err) {
                self.log_aborted(batch_id, index);
                let source = outcomes
                    .into_iter()
                    .nth(index)
                    .and_then(Result::err)
                    .unwrap_or(FusionError::NoEvidence);
                return Err(FusionError::BatchAborted {
                    index,
                    source: Box::new(source),
                });
            }
        }
        self.log_summary(batch_id, &outcomes);
        Ok(outcomes)
    }
}
