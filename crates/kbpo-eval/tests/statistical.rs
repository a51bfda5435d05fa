//! Statistical behaviour of the sampler, estimators and intervals on
//! synthetic systems whose true scores are known

use kbpo_core::{
    DistributionKind, KnowledgeBase, Mention, MentionType, Provenance, RelationInstance,
    RelationLabel, ScoringMode, WeightMethod,
};
use kbpo_eval::estimators::{weighted_precision, weighted_recall};
use kbpo_eval::{
    submission_distribution, Bootstrap, Distribution, Estimator, Flat, Labeled, Sampler,
    TruthItem,
};

// ============================================================================
// Fixtures
// ============================================================================

/// Two overlapping systems over items `0..2000`.
///
/// System 0 emits `0..1000`, system 1 emits `500..1500`. An item is true when
/// `x % 5 != 0` below 1000 and when it is even above; the truth pool is every
/// true item in `0..2000`.
struct Synthetic {
    ps: Vec<Distribution<u32>>,
    outputs: Vec<Vec<Labeled<u32>>>,
    truth: Vec<TruthItem<u32>>,
    truth_dist: Distribution<u32>,
}

fn is_true(x: u32) -> bool {
    if x < 1000 {
        x % 5 != 0
    } else {
        x % 2 == 0
    }
}

fn synthetic() -> Synthetic {
    let ranges = [0..1000u32, 500..1500u32];
    let ps: Vec<Distribution<u32>> = ranges
        .iter()
        .map(|r| Distribution::uniform(r.clone()).unwrap())
        .collect();
    let outputs = ranges
        .iter()
        .map(|r| r.clone().map(|x| (x, if is_true(x) { 1.0 } else { 0.0 })).collect())
        .collect();
    let truth: Vec<TruthItem<u32>> = (0..2000u32)
        .filter(|&x| is_true(x))
        .map(|y| TruthItem::new(y, ranges.iter().map(|r| r.contains(&y)).collect()))
        .collect();
    let truth_dist = Distribution::uniform(truth.iter().map(|y| y.item)).unwrap();
    Synthetic {
        ps,
        outputs,
        truth,
        truth_dist,
    }
}

impl Synthetic {
    fn label(&self, x: u32) -> f64 {
        if is_true(x) {
            1.0
        } else {
            0.0
        }
    }

    /// One sampling epoch: `n` draws per system and `n` truth items
    fn epoch(&self, sampler: &mut Sampler, n: usize) -> Estimator<u32> {
        let xhs: Vec<Vec<Labeled<u32>>> = self
            .ps
            .iter()
            .map(|p| {
                sampler
                    .with_replacement(p, n)
                    .unwrap()
                    .into_iter()
                    .map(|x| (x, self.label(x)))
                    .collect()
            })
            .collect();
        let y0: Vec<TruthItem<u32>> = sampler
            .without_replacement(&self.truth_dist, n)
            .unwrap()
            .into_iter()
            .map(|y| TruthItem::new(y, vec![y < 1000, (500..1500).contains(&y)]))
            .collect();
        Estimator::new(&self.ps, &xhs, &y0, &Flat, WeightMethod::Heuristic).unwrap()
    }
}

fn mean_sd(values: &[f64]) -> (f64, f64) {
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let var = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (n - 1.0);
    (mean, var.sqrt())
}

fn variance(values: &[f64]) -> f64 {
    let (_, sd) = mean_sd(values);
    sd * sd
}

// ============================================================================
// Reproducibility
// ============================================================================

fn small_kb() -> KnowledgeBase {
    let mut kb = KnowledgeBase::new();
    let people: Vec<Provenance> = (0..6).map(|i| Provenance::new("d1", i * 10, i * 10 + 5)).collect();
    let org = Provenance::new("d1", 100, 110);
    kb.mentions
        .insert(org.clone(), Mention::new(org.clone(), MentionType::Org, "Acme"));
    for p in &people {
        kb.mentions
            .insert(p.clone(), Mention::new(p.clone(), MentionType::Per, "someone"));
        let r = RelationInstance::new(p.clone(), RelationLabel::PerEmployeeOrMemberOf, org.clone());
        kb.relations.insert(r.pair(), r);
    }
    kb
}

#[test]
fn test_fixed_seed_sampling_is_idempotent() {
    let kb = small_kb();
    for kind in DistributionKind::ALL {
        let p = submission_distribution(&kb, kind).unwrap();
        assert!((p.total() - 1.0).abs() < 1e-6);
        for with_replacement in [true, false] {
            let a = Sampler::seeded(2017).draw(&p, 4, with_replacement).unwrap();
            let b = Sampler::seeded(2017).draw(&p, 4, with_replacement).unwrap();
            assert_eq!(a, b);
        }
    }
}

// ============================================================================
// Unbiasedness and coverage
// ============================================================================

#[test]
fn test_estimators_are_unbiased() {
    let setup = synthetic();
    let true_precision = weighted_precision(&setup.ps, &setup.outputs);
    let true_recall = weighted_recall(&Flat, &setup.truth, 2);
    assert!((true_precision[0] - 0.8).abs() < 1e-9);
    assert!((true_precision[1] - 0.65).abs() < 1e-9);
    assert!((true_recall[0] - 800.0 / 1300.0).abs() < 1e-9);
    assert!((true_recall[1] - 0.5).abs() < 1e-9);

    let epochs = 1000;
    let mut sampler = Sampler::seeded(1234);
    let mut simple_p = vec![Vec::new(); 2];
    let mut simple_r = vec![Vec::new(); 2];
    let mut joint_p = vec![Vec::new(); 2];
    for _ in 0..epochs {
        let est = setup.epoch(&mut sampler, 500);
        for i in 0..2 {
            simple_p[i].push(est.simple_precision()[i]);
            simple_r[i].push(est.simple_recall()[i]);
            joint_p[i].push(est.joint_precision()[i]);
        }
    }

    let within = |values: &[f64], truth: f64| {
        let (mean, sd) = mean_sd(values);
        (mean - truth).abs() <= 3.0 * sd / (epochs as f64).sqrt()
    };
    for i in 0..2 {
        assert!(within(&simple_p[i], true_precision[i]), "simple precision {i}");
        assert!(within(&joint_p[i], true_precision[i]), "joint precision {i}");
        assert!(within(&simple_r[i], true_recall[i]), "simple recall {i}");
    }
}

#[test]
fn test_joint_recall_is_consistent() {
    let setup = synthetic();
    let true_recall = weighted_recall(&Flat, &setup.truth, 2);
    let mut sampler = Sampler::seeded(99);
    let mut recalls = vec![Vec::new(); 2];
    for _ in 0..200 {
        let est = setup.epoch(&mut sampler, 500);
        for (i, r) in est.joint_recall().into_iter().enumerate() {
            recalls[i].push(r);
        }
    }
    for i in 0..2 {
        let (mean, _) = mean_sd(&recalls[i]);
        assert!((mean - true_recall[i]).abs() < 0.02, "joint recall {i}: {mean}");
    }
}

#[test]
#[ignore = "slow; coverage statistic itself has wide sampling error"]
fn test_interval_coverage() {
    let setup = synthetic();
    let truth = weighted_precision(&setup.ps, &setup.outputs)[0];
    let bootstrap = Bootstrap::new(1000, 0.95).unwrap();
    let mut sampler = Sampler::seeded(7);
    let replicates = 200;
    let mut covered = 0;
    for _ in 0..replicates {
        let est = setup.epoch(&mut sampler, 500);
        let intervals = bootstrap.score_intervals(&est, ScoringMode::Simple, &mut sampler);
        if intervals[0].precision().contains(truth) {
            covered += 1;
        }
    }
    let rate = covered as f64 / replicates as f64;
    assert!((0.93..=0.97).contains(&rate), "coverage {rate}");
}

// ============================================================================
// Scenarios
// ============================================================================

#[test]
fn test_uniform_instance_precision() {
    // 100 instances, 30 of them correct
    let p = Distribution::uniform(0..100u32).unwrap();
    let mut sampler = Sampler::seeded(30);
    let trials = 200;
    let mut inside = 0;
    for _ in 0..trials {
        let xh: Vec<Labeled<u32>> = sampler
            .with_replacement(&p, 50)
            .unwrap()
            .into_iter()
            .map(|x| (x, if x < 30 { 1.0 } else { 0.0 }))
            .collect();
        let est = Estimator::new(&[p.clone()], &[xh], &[], &Flat, WeightMethod::Uniform).unwrap();
        let precision = est.simple_precision()[0];
        if (0.20..=0.40).contains(&precision) {
            inside += 1;
        }
    }
    assert!(inside as f64 / trials as f64 >= 0.85, "{inside} of {trials}");
}

#[test]
fn test_pooled_estimator_reduces_variance() {
    // Both systems find the same 20 of 40 true items; system 1 adds 2 wrong
    // items (precision ~0.9), system 2 adds 47 (precision ~0.3)
    let shared: Vec<u32> = (0..20).collect();
    let sys1: Vec<u32> = shared.iter().copied().chain(100..102).collect();
    let sys2: Vec<u32> = shared.iter().copied().chain(200..247).collect();
    let ps = vec![
        Distribution::uniform(sys1).unwrap(),
        Distribution::uniform(sys2).unwrap(),
    ];
    let y0: Vec<TruthItem<u32>> = shared
        .iter()
        .map(|&y| TruthItem::new(y, vec![true, true]))
        .chain((300..320).map(|y| TruthItem::new(y, vec![false, false])))
        .collect();
    let label = |x: u32| if x < 20 { 1.0 } else { 0.0 };

    let mut sampler = Sampler::seeded(500);
    let mut simple = vec![Vec::new(); 2];
    let mut joint = vec![Vec::new(); 2];
    for _ in 0..500 {
        let xhs: Vec<Vec<Labeled<u32>>> = ps
            .iter()
            .map(|p| {
                sampler
                    .with_replacement(p, 100)
                    .unwrap()
                    .into_iter()
                    .map(|x| (x, label(x)))
                    .collect()
            })
            .collect();
        let est = Estimator::new(&ps, &xhs, &y0, &Flat, WeightMethod::Heuristic).unwrap();
        for (i, s) in est.simple_score().into_iter().enumerate() {
            assert!((s.recall - 0.5).abs() < 1e-9);
            simple[i].push(s.f1);
        }
        for (i, s) in est.joint_score().into_iter().enumerate() {
            assert!((s.recall - 0.5).abs() < 1e-9);
            joint[i].push(s.f1);
        }
    }

    let simple_var: Vec<f64> = simple.iter().map(|v| variance(v)).collect();
    let joint_var: Vec<f64> = joint.iter().map(|v| variance(v)).collect();
    assert!(joint_var[1] < simple_var[1], "{joint_var:?} vs {simple_var:?}");
    assert!(
        joint_var.iter().sum::<f64>() < simple_var.iter().sum::<f64>(),
        "{joint_var:?} vs {simple_var:?}"
    );
}
