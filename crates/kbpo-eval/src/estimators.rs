//! Precision and recall estimators
//!
//! Notation follows the sampling setup: system `i` defines a distribution
//! `Pᵢ` over its output and contributes a sample `X̂ᵢ` of labeled items;
//! `Y⁰` is a sample of the exhaustively judged truth, drawn from `U`, with
//! one found-by flag per system.
//!
//! * simple precision: mean label of `X̂ᵢ`
//! * simple recall: `Σ U(y)·gᵢ(y) / Σ U(y)` over `Y⁰`
//! * joint precision: `πᵢ = Σⱼ wᵢⱼ · mean_{x∈X̂ⱼ} Pᵢ(x)/Qᵢ(x)·f(x)` with the
//!   proposal `Qᵢ = Σₖ wᵢₖ Pₖ`
//! * joint recall: `ρᵢ = θ·νᵢ`, the recall `θ` of the pooled output times the
//!   pooled relative recall `νᵢ`
//!
//! Zero denominators give 0, never an error.

use std::collections::HashMap;
use std::hash::Hash;

use kbpo_core::{KbpoError, Result, Score, ScoringMode, WeightMethod};
use ndarray::Array2;
use tracing::debug;

use crate::distribution::{Distribution, Mass};
use crate::sampler::Sampler;

/// A sampled item with its label `f(x)` in [0, 1]
pub type Labeled<K> = (K, f64);

/// One item of the truth sample and which systems found it
#[derive(Debug, Clone, PartialEq)]
pub struct TruthItem<K> {
    pub item: K,
    /// `found[i]` holds when system `i` emits the item correctly
    pub found: Vec<bool>,
}

impl<K> TruthItem<K> {
    pub fn new(item: K, found: Vec<bool>) -> Self {
        Self { item, found }
    }

    pub fn found_by(&self, system: usize) -> bool {
        self.found.get(system).copied().unwrap_or(false)
    }

    pub fn found_by_any(&self) -> bool {
        self.found.iter().any(|&f| f)
    }
}

fn ratio(numerator: f64, denominator: f64) -> f64 {
    if denominator > 0.0 {
        numerator / denominator
    } else {
        0.0
    }
}

// ============================================================================
// Exact Estimators
// ============================================================================

/// `Σₓ Pᵢ(x)·f(x)` over each system's full labeled output
pub fn weighted_precision<K: Eq + Hash + Clone>(
    ps: &[Distribution<K>],
    outputs: &[Vec<Labeled<K>>],
) -> Vec<f64> {
    ps.iter()
        .zip(outputs)
        .map(|(p, output)| output.iter().map(|(x, fx)| p.prob(x) * fx).sum())
        .collect()
}

/// `Σ U(y)·gᵢ(y) / Σ U(y)` over the full truth
pub fn weighted_recall<K, U: Mass<K>>(u: &U, truth: &[TruthItem<K>], systems: usize) -> Vec<f64> {
    let z: f64 = truth.iter().map(|y| u.mass(&y.item)).sum();
    (0..systems)
        .map(|i| {
            let found: f64 = truth
                .iter()
                .filter(|y| y.found_by(i))
                .map(|y| u.mass(&y.item))
                .sum();
            ratio(found, z)
        })
        .collect()
}

// ============================================================================
// Weights
// ============================================================================

/// Mixture weights `wᵢⱼ`, one row per system, each row summing to 1
///
/// * `uniform`: `1/m`
/// * `heuristic`: `∝ nⱼ Σₓ Pᵢ(x)Pⱼ(x)`
/// * `size`: `∝ nⱼ`
///
/// Rows with no mass at all stay zero.
pub fn compute_weights<K: Eq + Hash + Clone>(
    ps: &[Distribution<K>],
    sizes: &[usize],
    method: WeightMethod,
) -> Array2<f64> {
    let m = ps.len();
    let n = |j: usize| sizes.get(j).copied().unwrap_or(0) as f64;

    let mut w = match method {
        WeightMethod::Uniform => return Array2::from_elem((m, m), 1.0 / m.max(1) as f64),
        WeightMethod::Heuristic => {
            let mut w = Array2::<f64>::zeros((m, m));
            for i in 0..m {
                for j in i..m {
                    let overlap = ps[i].overlap(&ps[j]);
                    w[[i, j]] = overlap;
                    w[[j, i]] = overlap;
                }
            }
            for ((_, j), v) in w.indexed_iter_mut() {
                *v *= n(j);
            }
            w
        }
        WeightMethod::Size => Array2::from_shape_fn((m, m), |(_, j)| n(j)),
    };

    for mut row in w.rows_mut() {
        let total = row.sum();
        if total > 0.0 {
            row.mapv_inplace(|v| v / total);
        }
    }
    w
}

// ============================================================================
// Indexed Estimator
// ============================================================================

/// Index draw over the samples: which rows of each system's sample and of
/// the truth sample take part. The identity draw uses every row once.
#[derive(Debug, Clone, PartialEq)]
pub struct Replicate {
    pub samples: Vec<Vec<usize>>,
    pub truth: Vec<usize>,
}

/// All systems' samples, indexed once so that repeated estimation (the
/// bootstrap) only touches numbers
#[derive(Debug, Clone)]
pub struct Estimator<K> {
    items: Vec<K>,
    /// item × system: `Pₖ(x)`
    probs: Array2<f64>,
    /// item × system: `Qᵢ(x)`
    proposals: Array2<f64>,
    /// system × system
    weights: Array2<f64>,
    /// `U(x)` per item
    item_mass: Vec<f64>,
    /// Per system: `(item index, label)`
    samples: Vec<Vec<(usize, f64)>>,
    /// Per truth row: `(U(y), found-by flags)`
    truth: Vec<(f64, Vec<bool>)>,
}

impl<K: Eq + Hash + Clone> Estimator<K> {
    pub fn new<U: Mass<K>>(
        ps: &[Distribution<K>],
        xhs: &[Vec<Labeled<K>>],
        y0: &[TruthItem<K>],
        u: &U,
        method: WeightMethod,
    ) -> Result<Self> {
        let sizes: Vec<usize> = xhs.iter().map(Vec::len).collect();
        let weights = compute_weights(ps, &sizes, method);
        Self::with_weights(ps, xhs, y0, u, weights)
    }

    pub fn with_weights<U: Mass<K>>(
        ps: &[Distribution<K>],
        xhs: &[Vec<Labeled<K>>],
        y0: &[TruthItem<K>],
        u: &U,
        weights: Array2<f64>,
    ) -> Result<Self> {
        let m = ps.len();
        if m == 0 {
            return Err(KbpoError::Scoring("no systems to score".to_string()));
        }
        if xhs.len() != m {
            return Err(KbpoError::Scoring(format!(
                "{m} distributions but {} samples",
                xhs.len()
            )));
        }
        if weights.dim() != (m, m) {
            return Err(KbpoError::Scoring(format!(
                "weight matrix is {:?}, expected ({m}, {m})",
                weights.dim()
            )));
        }

        let mut items = Vec::new();
        let mut index: HashMap<K, usize> = HashMap::new();
        let samples: Vec<Vec<(usize, f64)>> = xhs
            .iter()
            .map(|xh| {
                xh.iter()
                    .map(|(x, fx)| {
                        let id = *index.entry(x.clone()).or_insert_with(|| {
                            items.push(x.clone());
                            items.len() - 1
                        });
                        (id, *fx)
                    })
                    .collect()
            })
            .collect();

        let probs = Array2::from_shape_fn((items.len(), m), |(x, k)| ps[k].prob(&items[x]));
        let proposals = probs.dot(&weights.t());
        let item_mass = items.iter().map(|x| u.mass(x)).collect();
        let truth = y0
            .iter()
            .map(|y| {
                let mut found = y.found.clone();
                found.resize(m, false);
                (u.mass(&y.item), found)
            })
            .collect();

        debug!(
            systems = m,
            items = items.len(),
            truth = y0.len(),
            "indexed samples for estimation"
        );
        Ok(Self {
            items,
            probs,
            proposals,
            weights,
            item_mass,
            samples,
            truth,
        })
    }

    pub fn num_systems(&self) -> usize {
        self.weights.nrows()
    }

    pub fn weights(&self) -> &Array2<f64> {
        &self.weights
    }

    pub fn sample_sizes(&self) -> Vec<usize> {
        self.samples.iter().map(Vec::len).collect()
    }

    pub fn truth_size(&self) -> usize {
        self.truth.len()
    }

    /// Distinct sampled items
    pub fn items(&self) -> &[K] {
        &self.items
    }

    /// Every row once
    pub fn identity(&self) -> Replicate {
        Replicate {
            samples: self.samples.iter().map(|s| (0..s.len()).collect()).collect(),
            truth: (0..self.truth.len()).collect(),
        }
    }

    /// Rows resampled with replacement; both strata are redrawn together
    pub fn resample(&self, sampler: &mut Sampler) -> Replicate {
        Replicate {
            samples: self
                .samples
                .iter()
                .map(|s| sampler.resample_indices(s.len(), s.len()))
                .collect(),
            truth: sampler.resample_indices(self.truth.len(), self.truth.len()),
        }
    }

    // ------------------------------------------------------------------------
    // Simple estimators
    // ------------------------------------------------------------------------

    pub fn simple_precision(&self) -> Vec<f64> {
        self.simple_precision_on(&self.identity())
    }

    pub fn simple_recall(&self) -> Vec<f64> {
        self.simple_recall_on(&self.identity())
    }

    pub(crate) fn simple_precision_on(&self, draw: &Replicate) -> Vec<f64> {
        self.samples
            .iter()
            .zip(&draw.samples)
            .map(|(sample, rows)| {
                let total: f64 = rows.iter().map(|&r| sample[r].1).sum();
                ratio(total, rows.len() as f64)
            })
            .collect()
    }

    pub(crate) fn simple_recall_on(&self, draw: &Replicate) -> Vec<f64> {
        let z: f64 = draw.truth.iter().map(|&r| self.truth[r].0).sum();
        (0..self.num_systems())
            .map(|i| {
                let found: f64 = draw
                    .truth
                    .iter()
                    .map(|&r| &self.truth[r])
                    .filter(|(_, found)| found[i])
                    .map(|(mass, _)| mass)
                    .sum();
                ratio(found, z)
            })
            .collect()
    }

    // ------------------------------------------------------------------------
    // Joint estimators
    // ------------------------------------------------------------------------

    pub fn joint_precision(&self) -> Vec<f64> {
        self.joint_precision_on(&self.identity())
    }

    /// `θ`, the share of truth mass found by any system
    pub fn pool_recall(&self) -> f64 {
        self.pool_recall_on(&self.identity())
    }

    /// `νᵢ`, the share of the pooled correct output found by system `i`
    pub fn pooled_recall(&self) -> Vec<f64> {
        self.pooled_recall_on(&self.identity())
    }

    pub fn joint_recall(&self) -> Vec<f64> {
        self.joint_recall_on(&self.identity())
    }

    pub(crate) fn joint_precision_on(&self, draw: &Replicate) -> Vec<f64> {
        (0..self.num_systems())
            .map(|i| {
                self.weighted_means(i, draw, |x, fx| {
                    ratio(self.probs[[x, i]], self.proposals[[x, i]]) * fx
                })
            })
            .collect()
    }

    pub(crate) fn pool_recall_on(&self, draw: &Replicate) -> f64 {
        let (found, z) = draw
            .truth
            .iter()
            .map(|&r| &self.truth[r])
            .fold((0.0, 0.0), |(found, z), (mass, flags)| {
                let any = if flags.iter().any(|&f| f) { *mass } else { 0.0 };
                (found + any, z + mass)
            });
        ratio(found, z)
    }

    pub(crate) fn pooled_recall_on(&self, draw: &Replicate) -> Vec<f64> {
        (0..self.num_systems())
            .map(|i| {
                let scaled = |x: usize| ratio(self.item_mass[x], self.proposals[[x, i]]);
                let found = self.weighted_means(i, draw, |x, fx| {
                    if fx > 0.0 && self.probs[[x, i]] > 0.0 {
                        scaled(x)
                    } else {
                        0.0
                    }
                });
                let pooled = self.weighted_means(i, draw, |x, fx| {
                    if fx > 0.0 {
                        scaled(x)
                    } else {
                        0.0
                    }
                });
                ratio(found, pooled)
            })
            .collect()
    }

    pub(crate) fn joint_recall_on(&self, draw: &Replicate) -> Vec<f64> {
        let theta = self.pool_recall_on(draw);
        self.pooled_recall_on(draw)
            .into_iter()
            .map(|nu| theta * nu)
            .collect()
    }

    /// `Σⱼ wᵢⱼ · mean over X̂ⱼ of term(x, f(x))`, skipping zero weights
    fn weighted_means(&self, i: usize, draw: &Replicate, term: impl Fn(usize, f64) -> f64) -> f64 {
        self.samples
            .iter()
            .zip(&draw.samples)
            .enumerate()
            .filter(|(j, (_, rows))| self.weights[[i, *j]] > 0.0 && !rows.is_empty())
            .map(|(j, (sample, rows))| {
                let total: f64 = rows
                    .iter()
                    .map(|&r| {
                        let (x, fx) = sample[r];
                        term(x, fx)
                    })
                    .sum();
                self.weights[[i, j]] * total / rows.len() as f64
            })
            .sum()
    }

    // ------------------------------------------------------------------------
    // Scores
    // ------------------------------------------------------------------------

    pub fn simple_score(&self) -> Vec<Score> {
        self.score_on(ScoringMode::Simple, &self.identity())
    }

    pub fn joint_score(&self) -> Vec<Score> {
        self.score_on(ScoringMode::Joint, &self.identity())
    }

    pub fn score(&self, mode: ScoringMode) -> Vec<Score> {
        self.score_on(mode, &self.identity())
    }

    pub(crate) fn score_on(&self, mode: ScoringMode, draw: &Replicate) -> Vec<Score> {
        let (precision, recall) = match mode {
            ScoringMode::Simple => (self.simple_precision_on(draw), self.simple_recall_on(draw)),
            ScoringMode::Joint => (self.joint_precision_on(draw), self.joint_recall_on(draw)),
        };
        precision
            .into_iter()
            .zip(recall)
            .map(|(p, r)| Score::new(p, r))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distribution::Flat;

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    fn labeled(items: &[(&'static str, f64)]) -> Vec<Labeled<&'static str>> {
        items.to_vec()
    }

    #[test]
    fn test_weights_uniform() {
        let ps = vec![
            Distribution::uniform(["a"]).unwrap(),
            Distribution::uniform(["b"]).unwrap(),
            Distribution::uniform(["c"]).unwrap(),
        ];
        let w = compute_weights(&ps, &[10, 50, 100], WeightMethod::Uniform);
        assert!(w.iter().all(|&v| close(v, 1.0 / 3.0)));
    }

    #[test]
    fn test_weights_disjoint_is_identity() {
        let ps = vec![
            Distribution::uniform(["a"]).unwrap(),
            Distribution::uniform(["b"]).unwrap(),
            Distribution::uniform(["c"]).unwrap(),
        ];
        let w = compute_weights(&ps, &[10, 50, 100], WeightMethod::Heuristic);
        for ((i, j), &v) in w.indexed_iter() {
            assert!(close(v, if i == j { 1.0 } else { 0.0 }));
        }
    }

    #[test]
    fn test_weights_identical_follow_sizes() {
        let p = Distribution::from_masses([("a", 0.3), ("b", 0.2), ("c", 0.5)]).unwrap();
        let ps = vec![p.clone(), p.clone(), p];
        for method in [WeightMethod::Heuristic, WeightMethod::Size] {
            let w = compute_weights(&ps, &[10, 50, 100], method);
            for row in w.rows() {
                assert!(close(row[0], 10.0 / 160.0));
                assert!(close(row[1], 50.0 / 160.0));
                assert!(close(row[2], 100.0 / 160.0));
            }
        }
    }

    #[test]
    fn test_proposal_mixes_distributions() {
        let ps = vec![
            Distribution::uniform(["a"]).unwrap(),
            Distribution::uniform(["b"]).unwrap(),
            Distribution::uniform(["c"]).unwrap(),
        ];
        let w = ndarray::arr2(&[[0.0, 1.0, 0.0], [0.5, 0.3, 0.2], [0.2, 0.5, 0.3]]);
        let xhs = vec![
            labeled(&[("a", 1.0)]),
            labeled(&[("b", 1.0)]),
            labeled(&[("c", 1.0)]),
        ];
        let est = Estimator::with_weights(&ps, &xhs, &[], &Flat, w).unwrap();
        // Row x of the proposal matrix holds Qᵢ(x) for every i
        let a = est.items().iter().position(|&x| x == "a").unwrap();
        assert!(close(est.proposals[[a, 0]], 0.0));
        assert!(close(est.proposals[[a, 1]], 0.5));
        assert!(close(est.proposals[[a, 2]], 0.2));
    }

    #[test]
    fn test_simple_estimators() {
        let ps = vec![Distribution::uniform(["a", "b", "c", "d"]).unwrap()];
        let xhs = vec![labeled(&[("a", 1.0), ("b", 0.0), ("a", 1.0), ("d", 0.0)])];
        let y0 = vec![
            TruthItem::new("a", vec![true]),
            TruthItem::new("x", vec![false]),
            TruthItem::new("y", vec![false]),
            TruthItem::new("b", vec![true]),
        ];
        let est = Estimator::new(&ps, &xhs, &y0, &Flat, WeightMethod::Heuristic).unwrap();
        assert!(close(est.simple_precision()[0], 0.5));
        assert!(close(est.simple_recall()[0], 0.5));
        let score = est.simple_score()[0];
        assert!(close(score.f1, 0.5));
    }

    #[test]
    fn test_single_system_joint_matches_simple_precision() {
        let ps = vec![Distribution::uniform(["a", "b", "c", "d"]).unwrap()];
        let xhs = vec![labeled(&[("a", 1.0), ("b", 0.0), ("c", 1.0), ("c", 1.0)])];
        let est = Estimator::new(&ps, &xhs, &[], &Flat, WeightMethod::Heuristic).unwrap();
        assert!(close(est.joint_precision()[0], est.simple_precision()[0]));
    }

    #[test]
    fn test_pooled_precision_reuses_other_samples() {
        // System 1 covers {a, b}; system 0 only ever sampled "a"
        let ps = vec![
            Distribution::uniform(["a", "b"]).unwrap(),
            Distribution::uniform(["a", "b"]).unwrap(),
        ];
        let xhs = vec![
            labeled(&[("a", 1.0), ("a", 1.0)]),
            labeled(&[("b", 0.0), ("b", 0.0)]),
        ];
        let est = Estimator::new(&ps, &xhs, &[], &Flat, WeightMethod::Heuristic).unwrap();
        let joint = est.joint_precision();
        assert!(close(joint[0], 0.5));
        assert!(close(joint[1], 0.5));
        assert!(close(est.simple_precision()[0], 1.0));
    }

    #[test]
    fn test_pool_and_joint_recall() {
        let ps = vec![
            Distribution::uniform(["a", "b"]).unwrap(),
            Distribution::uniform(["b", "c"]).unwrap(),
        ];
        let xhs = vec![
            labeled(&[("a", 1.0), ("b", 1.0)]),
            labeled(&[("b", 1.0), ("c", 1.0)]),
        ];
        let y0 = vec![
            TruthItem::new("a", vec![true, false]),
            TruthItem::new("b", vec![true, true]),
            TruthItem::new("c", vec![false, true]),
            TruthItem::new("z", vec![false, false]),
        ];
        let est = Estimator::new(&ps, &xhs, &y0, &Flat, WeightMethod::Uniform).unwrap();
        assert!(close(est.pool_recall(), 0.75));
        let nu = est.pooled_recall();
        // Q(a) = Q(c) = 1/4 and Q(b) = 1/2, so the terms are 4, 2, 2, 4;
        // system 0 misses "c": (4 + 2 + 2 + 0) / (4 + 2 + 2 + 4)
        assert!(close(nu[0], 2.0 / 3.0));
        assert!(close(nu[1], 2.0 / 3.0));
        let rho = est.joint_recall();
        assert!(close(rho[0], 0.75 * nu[0]));
        assert!(close(rho[1], 0.75 * nu[1]));
    }

    #[test]
    fn test_zero_denominators() {
        let ps = vec![Distribution::uniform(["a"]).unwrap()];
        let xhs: Vec<Vec<Labeled<&str>>> = vec![vec![]];
        let est = Estimator::new(&ps, &xhs, &[], &Flat, WeightMethod::Heuristic).unwrap();
        assert_eq!(est.simple_precision(), vec![0.0]);
        assert_eq!(est.simple_recall(), vec![0.0]);
        assert_eq!(est.joint_precision(), vec![0.0]);
        assert_eq!(est.joint_recall(), vec![0.0]);
        assert_eq!(est.joint_score()[0].f1, 0.0);
    }

    #[test]
    fn test_mismatched_inputs() {
        let ps = vec![Distribution::uniform(["a"]).unwrap()];
        let xhs: Vec<Vec<Labeled<&str>>> = vec![vec![], vec![]];
        assert!(Estimator::new(&ps, &xhs, &[], &Flat, WeightMethod::Heuristic).is_err());
        let none: Vec<Distribution<&str>> = vec![];
        assert!(Estimator::new(&none, &[], &[], &Flat, WeightMethod::Heuristic).is_err());
    }

    #[test]
    fn test_exact_estimators() {
        let ps = vec![Distribution::uniform(["a", "b", "c", "d"]).unwrap()];
        let outputs = vec![labeled(&[("a", 1.0), ("b", 1.0), ("c", 0.0), ("d", 1.0)])];
        assert!(close(weighted_precision(&ps, &outputs)[0], 0.75));

        let truth = vec![
            TruthItem::new("a", vec![true]),
            TruthItem::new("e", vec![false]),
        ];
        assert!(close(weighted_recall(&Flat, &truth, 1)[0], 0.5));
    }
}
