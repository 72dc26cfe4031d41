use std::{
    fs,
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use ds_evidence::{
    decide, scores, Calibrated, CombinationEngine, ConfusionTable, Ensemble, FocalMass, Frame,
    FusionConfig, FusionTelemetry, MassFunction, Metric, Model, Predictor, RawOutput,
};
use rand::{rngs::SmallRng, Rng, SeedableRng};
use serde::Deserialize;
use serde_json::json;
use tokio::runtime::Runtime;

const CLASSES: [&str; 3] = ["0", "1", "2"];

/// Class centres; the second feature lives on a much larger scale.
const CENTRES: [[f64; 2]; 3] = [[0.0, 0.0], [2.5, 10.0], [1.0, 25.0]];

#[derive(Parser, Debug)]
#[command(name = "dse", version, about = "Dempster-Shafer ensemble fusion")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Calibrates two classifiers on synthetic data and fuses their evidence.
    Demo(DemoArgs),
    /// Combines BPAs read from a JSON document.
    Combine {
        /// File holding `{ "frame": [...], "masses": [[{ "labels": [...], "mass": 0.5 }, ...], ...] }`.
        input: PathBuf,
        /// Decision metric: bel, pl or mass.
        #[arg(long)]
        metric: Option<Metric>,
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

#[derive(Parser, Debug)]
struct DemoArgs {
    /// Number of synthetic samples, split into train, calibration and test thirds.
    #[arg(long, default_value_t = 300)]
    samples: usize,
    #[arg(long, default_value_t = 7)]
    seed: u64,
    /// Decision metric: bel, pl or mass.
    #[arg(long)]
    metric: Option<Metric>,
    #[arg(long)]
    config: Option<PathBuf>,
    /// Predict on a worker pool instead of sequentially.
    #[arg(long)]
    parallel: bool,
}

#[derive(Debug, Deserialize)]
struct CombineInput {
    frame: Vec<String>,
    masses: Vec<Vec<FocalMass>>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Commands::Demo(args) => handle_demo(&args),
        Commands::Combine {
            input,
            metric,
            config,
        } => handle_combine(&input, metric, config),
    }
}

fn load_config(path: Option<PathBuf>) -> Result<FusionConfig> {
    path.map_or_else(|| Ok(FusionConfig::default()), FusionConfig::load)
}

fn handle_combine(input: &Path, metric: Option<Metric>, config: Option<PathBuf>) -> Result<()> {
    let config = load_config(config)?;
    let metric = metric.unwrap_or(config.decision.metric);
    let raw = fs::read_to_string(input).with_context(|| format!("reading {}", input.display()))?;
    let document: CombineInput =
        serde_json::from_str(&raw).with_context(|| format!("parsing {}", input.display()))?;
    let frame = Frame::new(document.frame)?;
    let masses = document
        .masses
        .iter()
        .enumerate()
        .map(|(idx, focal)| {
            MassFunction::from_snapshot(&frame, focal).with_context(|| format!("mass function #{idx}"))
        })
        .collect::<Result<Vec<_>>>()?;

    let engine = CombinationEngine::from_settings(&config.combination);
    let combined = engine.combine_all(&masses)?;
    let decision = decide(&combined.mass, metric)?;
    let per_label: serde_json::Map<String, serde_json::Value> = frame
        .labels()
        .zip(scores(&combined.mass, metric))
        .map(|(label, value)| (label.to_owned(), json!(value)))
        .collect();
    let report = json!({
        "stats": CombinationEngine::stats(&combined, masses.len()),
        "focal": combined.mass.to_snapshot(),
        "scores": per_label,
        "decision": decision,
    });
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

fn handle_demo(args: &DemoArgs) -> Result<()> {
    if args.samples < 30 {
        bail!("need at least 30 samples, got {}", args.samples);
    }
    let config = load_config(args.config.clone())?;
    let metric = args.metric.unwrap_or(config.decision.metric);
    let telemetry = FusionTelemetry::from_settings("dse", &config.telemetry)?;

    let mut rng = SmallRng::seed_from_u64(args.seed);
    let data = synthesize(&mut rng, args.samples);
    let third = args.samples / 3;
    let (train, rest) = data.split_at(third);
    let (calibration, test) = rest.split_at(third);
    let (cal_x, cal_y) = unzip(calibration);
    let (test_x, test_y) = unzip(test);

    let frame = Frame::new(CLASSES)?;
    let centroid = Model::new("nearest-centroid", NearestCentroid::fit(train), frame.clone())
        .with_telemetry(telemetry.clone())
        .calibrate_with(&cal_x, &cal_y, &config.calibration)?;
    let scaler = Standardizer::fit(train);
    let knn = Model::new("3-nn", Knn::fit(train, &scaler, 3), frame.clone())
        .with_preprocess(move |x: &Vec<f64>| Ok(scaler.apply(x)))
        .with_telemetry(telemetry.clone())
        .calibrate_with(&cal_x, &cal_y, &config.calibration)?;

    let singles: Vec<(String, f64)> = [&centroid, &knn]
        .iter()
        .map(|model| -> Result<(String, f64)> {
            Ok((model.name().to_owned(), model_accuracy(model, &test_x, &test_y)?))
        })
        .collect::<Result<_>>()?;

    let ensemble = Ensemble::new(vec![centroid, knn], config.clone())?.with_telemetry(telemetry);
    let outcomes = if args.parallel {
        let runtime = Runtime::new()?;
        runtime.block_on(Arc::new(ensemble).predict_parallel(test_x, metric))?
    } else {
        ensemble.predict(&test_x, metric)?
    };

    let mut confusion = ConfusionTable::new(&frame);
    let mut correct = 0_usize;
    for (outcome, truth) in outcomes.iter().zip(&test_y) {
        match outcome {
            Ok(decision) => {
                println!("Pred: {}, True: {truth}", decision.label);
                if let Some(truth_idx) = frame.index_of(truth) {
                    confusion.record(decision.index, truth_idx);
                }
                if decision.label == *truth {
                    correct += 1;
                }
            }
            Err(err) => println!("Pred: <{err}>, True: {truth}"),
        }
    }

    println!("\nConfusion matrix (rows predicted, columns true):");
    println!("      {}", CLASSES.map(|label| format!("{label:>5}")).join(""));
    for (row, label) in CLASSES.iter().enumerate() {
        let cells: String = (0..CLASSES.len())
            .map(|col| format!("{:>5}", confusion.count(row, col)))
            .collect();
        println!("{label:>5} {cells}");
    }

    println!("\nAccuracy ({metric}):");
    for (name, accuracy) in &singles {
        println!("  {name:<18} {accuracy:.3}");
    }
    println!("  {:<18} {:.3}", "ensemble", ratio(correct, test_y.len()));
    Ok(())
}

fn model_accuracy(model: &Model<Vec<f64>, Calibrated>, inputs: &[Vec<f64>], labels: &[String]) -> Result<f64> {
    let mut correct = 0;
    for (input, truth) in inputs.iter().zip(labels) {
        if model.predict_label(input)? == *truth {
            correct += 1;
        }
    }
    Ok(ratio(correct, labels.len()))
}

#[allow(clippy::cast_precision_loss)]
fn ratio(part: usize, whole: usize) -> f64 {
    if whole == 0 {
        0.0
    } else {
        part as f64 / whole as f64
    }
}

/// Gaussian-ish blobs around [`CENTRES`], shuffled by construction.
fn synthesize(rng: &mut SmallRng, count: usize) -> Vec<(Vec<f64>, String)> {
    (0..count)
        .map(|_| {
            let class = rng.gen_range(0..CENTRES.len());
            let [cx, cy] = CENTRES[class];
            let x = cx + noise(rng);
            let y = cy + 8.0 * noise(rng);
            (vec![x, y], CLASSES[class].to_owned())
        })
        .collect()
}

/// Sum of three uniforms: roughly normal with unit spread.
fn noise(rng: &mut SmallRng) -> f64 {
    (0..3).map(|_| rng.gen_range(-1.0_f64..1.0)).sum()
}

fn unzip(rows: &[(Vec<f64>, String)]) -> (Vec<Vec<f64>>, Vec<String>) {
    rows.iter().cloned().unzip()
}

fn squared_distance(left: &[f64], right: &[f64]) -> f64 {
    left.iter().zip(right).map(|(a, b)| (a - b).powi(2)).sum()
}

fn class_index(label: &str) -> Result<usize> {
    CLASSES
        .iter()
        .position(|class| *class == label)
        .with_context(|| format!("unknown class {label}"))
}

/// Per-class mean on raw features.
struct NearestCentroid {
    centroids: Vec<Vec<f64>>,
}

impl NearestCentroid {
    fn fit(train: &[(Vec<f64>, String)]) -> Self {
        let width = train.first().map_or(0, |(x, _)| x.len());
        let mut sums = vec![vec![0.0; width]; CLASSES.len()];
        let mut counts = vec![0_u32; CLASSES.len()];
        for (x, label) in train {
            if let Ok(class) = class_index(label) {
                counts[class] += 1;
                for (sum, value) in sums[class].iter_mut().zip(x) {
                    *sum += value;
                }
            }
        }
        let centroids = sums
            .into_iter()
            .zip(counts)
            .map(|(sum, count)| sum.into_iter().map(|value| value / f64::from(count.max(1))).collect())
            .collect();
        Self { centroids }
    }
}

impl Predictor<Vec<f64>> for NearestCentroid {
    fn family(&self) -> &str {
        "nearest-centroid"
    }

    fn predict(&self, input: &Vec<f64>) -> Result<RawOutput> {
        let distances = self
            .centroids
            .iter()
            .map(|centroid| -squared_distance(centroid, input))
            .collect();
        Ok(RawOutput::Scores(distances))
    }
}

/// Column-wise z-score fitted on the training split.
#[derive(Clone)]
struct Standardizer {
    means: Vec<f64>,
    stds: Vec<f64>,
}

impl Standardizer {
    #[allow(clippy::cast_precision_loss)]
    fn fit(train: &[(Vec<f64>, String)]) -> Self {
        let width = train.first().map_or(0, |(x, _)| x.len());
        let n = train.len().max(1) as f64;
        let means: Vec<f64> = (0..width)
            .map(|col| train.iter().map(|(x, _)| x[col]).sum::<f64>() / n)
            .collect();
        let stds = (0..width)
            .map(|col| {
                let var = train.iter().map(|(x, _)| (x[col] - means[col]).powi(2)).sum::<f64>() / n;
                if var > 0.0 {
                    var.sqrt()
                } else {
                    1.0
                }
            })
            .collect();
        Self { means, stds }
    }

    fn apply(&self, x: &[f64]) -> Vec<f64> {
        x.iter()
            .zip(self.means.iter().zip(&self.stds))
            .map(|(value, (mean, std))| (value - mean) / std)
            .collect()
    }
}

/// Majority vote among the `k` nearest standardized training points.
struct Knn {
    points: Vec<(Vec<f64>, usize)>,
    k: usize,
}

impl Knn {
    fn fit(train: &[(Vec<f64>, String)], scaler: &Standardizer, k: usize) -> Self {
        let points = train
            .iter()
            .filter_map(|(x, label)| class_index(label).ok().map(|class| (scaler.apply(x), class)))
            .collect();
        Self { points, k }
    }
}

impl Predictor<Vec<f64>> for Knn {
    fn family(&self) -> &str {
        "knn"
    }

    fn predict(&self, input: &Vec<f64>) -> Result<RawOutput> {
        if self.points.is_empty() {
            bail!("knn has no training points");
        }
        let mut nearest: Vec<(f64, usize)> = self
            .points
            .iter()
            .map(|(point, class)| (squared_distance(point, input), *class))
            .collect();
        nearest.sort_by(|a, b| a.0.total_cmp(&b.0));
        let mut votes = [0_usize; CLASSES.len()];
        for (_, class) in nearest.iter().take(self.k) {
            votes[*class] += 1;
        }
        let winner = nearest
            .iter()
            .take(self.k)
            .map(|(_, class)| *class)
            .max_by_key(|class| (votes[*class], std::cmp::Reverse(*class)))
            .unwrap_or_default();
        Ok(RawOutput::Index(winner))
    }
}
