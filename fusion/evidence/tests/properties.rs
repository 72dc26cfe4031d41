use std::sync::Arc;

use ds_evidence::{
    decide, CalibrationTable, Calibrated, CombinationEngine, Ensemble, FnPredictor, FocalSet, Frame,
    FusionConfig, FusionError, MassFunction, Metric, Model, ScorePredictor,
};
use rand::{rngs::SmallRng, seq::SliceRandom, Rng, SeedableRng};

const TOLERANCE: f64 = 1e-9;

fn frame() -> Frame {
    Frame::new(["0", "1", "2", "3"]).unwrap()
}

/// Random BPA with a handful of non-empty focal sets, always including Θ so
/// that any two random BPAs are combinable.
fn random_mass(rng: &mut SmallRng, frame: &Frame) -> MassFunction {
    let theta = frame.full_set().bits();
    let mut focal = vec![(frame.full_set(), rng.gen_range(0.05..1.0))];
    for _ in 0..rng.gen_range(1..4) {
        let bits = rng.gen_range(1..=theta);
        let set = frame.set_of(
            (0..frame.len())
                .filter(|idx| (bits >> *idx) & 1 == 1)
                .filter_map(|idx| frame.label(idx)),
        )
        .unwrap();
        focal.push((set, rng.gen_range(0.0..1.0)));
    }
    let total: f64 = focal.iter().map(|(_, mass)| mass).sum();
    MassFunction::from_focal(frame, focal.into_iter().map(|(set, mass)| (set, mass / total))).unwrap()
}

#[test]
fn combined_masses_are_valid_bpas() {
    let frame = frame();
    let mut rng = SmallRng::seed_from_u64(7);
    let engine = CombinationEngine::default();
    for _ in 0..200 {
        let a = random_mass(&mut rng, &frame);
        let b = random_mass(&mut rng, &frame);
        let fused = engine.combine(&a, &b).unwrap();
        assert!(fused.mass.focal_elements().all(|(set, mass)| mass >= 0.0 && !set.is_empty()));
        assert!((fused.mass.total() - 1.0).abs() < TOLERANCE);
        assert!((0.0..1.0).contains(&fused.conflict));
    }
}

#[test]
fn belief_never_exceeds_plausibility() {
    let frame = frame();
    let mut rng = SmallRng::seed_from_u64(11);
    for _ in 0..100 {
        let mass = random_mass(&mut rng, &frame);
        for bits in 1..=frame.full_set().bits() {
            let set = frame
                .set_of((0..frame.len()).filter(|idx| (bits >> *idx) & 1 == 1).filter_map(|idx| frame.label(idx)))
                .unwrap();
            assert!(mass.belief(set) <= mass.plausibility(set) + TOLERANCE);
        }
        let theta = frame.full_set();
        assert!((mass.belief(theta) - 1.0).abs() < TOLERANCE);
        assert!((mass.plausibility(theta) - 1.0).abs() < TOLERANCE);
    }
}

#[test]
fn fold_order_does_not_change_the_result() {
    let frame = frame();
    let mut rng = SmallRng::seed_from_u64(23);
    let engine = CombinationEngine::default();
    for _ in 0..50 {
        let mut masses: Vec<MassFunction> = (0..4).map(|_| random_mass(&mut rng, &frame)).collect();
        let forward = engine.combine_all(&masses).unwrap();
        masses.shuffle(&mut rng);
        let shuffled = engine.combine_all(&masses).unwrap();
        assert!(forward.mass.approx_eq(&shuffled.mass, 1e-9));
        assert!((forward.conflict - shuffled.conflict).abs() < 1e-9);
    }
}

#[test]
fn vacuous_evidence_is_neutral() {
    let frame = frame();
    let mut rng = SmallRng::seed_from_u64(31);
    let engine = CombinationEngine::default();
    let vacuous = MassFunction::vacuous(&frame);
    for _ in 0..50 {
        let mass = random_mass(&mut rng, &frame);
        let fused = engine.combine(&mass, &vacuous).unwrap();
        assert!(fused.mass.approx_eq(&mass, 1e-12));
        assert!(fused.conflict.abs() < 1e-12);
    }
}

#[test]
fn two_reliable_sources_reinforce_each_other() {
    let frame = Frame::new(["0", "1", "2"]).unwrap();
    let a = MassFunction::from_labeled(&frame, [(vec!["0"], 0.8), (vec!["0", "1", "2"], 0.2)]).unwrap();
    let b = MassFunction::from_labeled(&frame, [(vec!["0"], 0.6), (vec!["0", "1", "2"], 0.4)]).unwrap();
    let fused = CombinationEngine::default().combine(&a, &b).unwrap();
    assert!((fused.mass.mass_of(frame.singleton("0").unwrap()) - 0.92).abs() < 1e-12);
    assert!((fused.mass.mass_of(frame.full_set()) - 0.08).abs() < 1e-12);
    for metric in [Metric::Belief, Metric::Plausibility, Metric::RawMass] {
        assert_eq!(decide(&fused.mass, metric).unwrap().label, "0");
    }
    let decision = decide(&fused.mass, Metric::Belief).unwrap();
    assert!((decision.value - 0.92).abs() < 1e-12);
}

fn restored(name: &str, reliability: f64) -> Model<u8, Calibrated> {
    let frame = Frame::new(["0", "1", "2"]).unwrap();
    let table = format!(
        r#"{{ "frame": ["0", "1", "2"], "rows": {{ "0": [
            {{ "labels": ["0"], "mass": {reliability} }},
            {{ "labels": ["0", "1", "2"], "mass": {ignorance} }}
        ] }}, "fallback": [{{ "labels": ["0", "1", "2"], "mass": 1.0 }}] }}"#,
        ignorance = 1.0 - reliability
    );
    let predictor = FnPredictor::new("zero", |_: &u8| Ok::<_, anyhow::Error>("0".to_string()));
    Model::new(name, predictor, frame)
        .restore(CalibrationTable::from_json(&table).unwrap())
        .unwrap()
}

#[test]
fn ensemble_fuses_restored_calibration_tables() {
    let ensemble = Ensemble::new(vec![restored("a", 0.8), restored("b", 0.6)], FusionConfig::default()).unwrap();
    let fused = ensemble.fuse(&0).unwrap();
    let frame = ensemble.frame();
    assert!((fused.mass.mass_of(frame.singleton("0").unwrap()) - 0.92).abs() < 1e-12);
    assert!((fused.mass.mass_of(frame.full_set()) - 0.08).abs() < 1e-12);
    assert!(fused.conflict.abs() < 1e-12);
    let decision = ensemble.predict_one(&0, Metric::Belief).unwrap();
    assert_eq!(decision.label, "0");
    assert!((decision.value - 0.92).abs() < 1e-12);
}

#[test]
fn contradictory_certainties_cannot_be_fused() {
    let frame = Frame::new(["0", "1", "2"]).unwrap();
    let a = MassFunction::certain(&frame, "0").unwrap();
    let b = MassFunction::certain(&frame, "1").unwrap();
    assert!(matches!(
        CombinationEngine::default().combine_all(&[a, b]),
        Err(FusionError::TotalConflict { .. })
    ));
}

#[test]
fn ties_go_to_the_lowest_index() {
    let frame = Frame::new(["a", "b", "c"]).unwrap();
    let split = MassFunction::from_focal(&frame, [(FocalSet::singleton(1), 0.5), (FocalSet::singleton(2), 0.5)]).unwrap();
    assert_eq!(decide(&split, Metric::Belief).unwrap().label, "b");
    assert_eq!(decide(&MassFunction::vacuous(&frame), Metric::Plausibility).unwrap().label, "a");
}

/// Synthetic one-dimensional, three-class data: class `k` centred on `k`.
fn samples(rng: &mut SmallRng, count: usize) -> (Vec<f64>, Vec<String>) {
    (0..count)
        .map(|_| {
            let class = rng.gen_range(0..3_u8);
            (f64::from(class) + rng.gen_range(-0.6..0.6), class.to_string())
        })
        .unzip()
}

/// Nearest class centre, with everything below 0.5 (negatives included)
/// mapped to "0".
fn nearest_class(x: f64) -> &'static str {
    if x < 0.5 {
        "0"
    } else if x < 1.5 {
        "1"
    } else {
        "2"
    }
}

#[test]
fn nearest_class_stays_inside_the_frame() {
    let frame = Frame::new(["0", "1", "2"]).unwrap();
    for x in [-0.6, -0.4, -0.0, 0.0, 0.49, 0.5, 1.49, 1.5, 2.6] {
        assert!(frame.index_of(nearest_class(x)).is_some(), "{x} left the frame");
    }
    assert_eq!(nearest_class(-0.3), "0");
}

fn three_models(rng: &mut SmallRng) -> Vec<Model<f64, Calibrated>> {
    let frame = Frame::new(["0", "1", "2"]).unwrap();
    let (held_x, held_y) = samples(rng, 120);

    let rounding = FnPredictor::new("round", |x: &f64| Ok::<_, anyhow::Error>(nearest_class(*x).to_string()));
    let threshold = FnPredictor::new("threshold", |x: &f64| {
        let label = if *x < 0.8 {
            "0"
        } else if *x < 1.2 {
            "1"
        } else {
            "2"
        };
        Ok::<_, anyhow::Error>(label.to_string())
    });
    let scores = ScorePredictor::new("distance", |x: &f64| {
        Ok::<_, anyhow::Error>((0..3_u8).map(|c| -(x - f64::from(c)).abs()).collect::<Vec<f64>>())
    });

    vec![
        Model::new("round", rounding, frame.clone()).calibrate(&held_x, &held_y).unwrap(),
        Model::new("threshold", threshold, frame.clone())
            .calibrate(&held_x, &held_y)
            .unwrap(),
        Model::new("distance", scores, frame)
            .with_preprocess(|x: &f64| Ok(x.clamp(-1.0, 3.0)))
            .calibrate(&held_x, &held_y)
            .unwrap(),
    ]
}

#[test]
fn batch_of_one_hundred_returns_ordered_decisions() {
    let mut rng = SmallRng::seed_from_u64(42);
    let ensemble = Ensemble::new(three_models(&mut rng), FusionConfig::default()).unwrap();
    let (inputs, truth) = samples(&mut rng, 100);
    let outcomes = ensemble.predict(&inputs, Metric::Belief).unwrap();
    assert_eq!(outcomes.len(), 100);
    let labels: Vec<&str> = outcomes
        .iter()
        .map(|outcome| outcome.as_ref().unwrap().label.as_str())
        .collect();
    assert!(labels.iter().all(|label| ["0", "1", "2"].contains(label)));
    for (input, outcome) in inputs.iter().zip(&outcomes) {
        let single = ensemble.predict_one(input, Metric::Belief).unwrap();
        assert_eq!(&single, outcome.as_ref().unwrap());
    }
    let correct = labels.iter().zip(&truth).filter(|(label, truth)| **label == truth.as_str()).count();
    assert!(correct >= 70, "ensemble accuracy too low: {correct}/100");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn parallel_batch_matches_sequential_batch() {
    let mut rng = SmallRng::seed_from_u64(99);
    let ensemble = Arc::new(Ensemble::new(three_models(&mut rng), FusionConfig::default()).unwrap());
    let (inputs, _) = samples(&mut rng, 64);
    let sequential = ensemble.predict(&inputs, Metric::Plausibility).unwrap();
    let parallel = Arc::clone(&ensemble)
        .predict_parallel(inputs, Metric::Plausibility)
        .await
        .unwrap();
    assert_eq!(sequential.len(), parallel.len());
    for (left, right) in sequential.iter().zip(&parallel) {
        assert_eq!(left.as_ref().unwrap(), right.as_ref().unwrap());
    }
}
