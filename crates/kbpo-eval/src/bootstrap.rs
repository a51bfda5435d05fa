//! Bootstrap confidence intervals
//!
//! Replicates resample the unit of analysis with replacement: sampled
//! items for precision, truth rows for recall, both at once for the joint
//! estimators, and query entities for official-style scores.

use kbpo_core::{KbpoError, Result, Score, ScoringConfig, ScoringMode};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::estimators::Estimator;
use crate::sampler::Sampler;

/// Default number of replicates
pub const DEFAULT_SAMPLES: usize = 5000;

/// Default interval coverage
pub const DEFAULT_CONFIDENCE: f64 = 0.95;

/// Replicate mean and percentile bounds of one metric
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Interval {
    pub mean: f64,
    pub left: f64,
    pub right: f64,
}

impl Interval {
    pub fn contains(&self, value: f64) -> bool {
        self.left <= value && value <= self.right
    }

    pub fn width(&self) -> f64 {
        self.right - self.left
    }
}

/// Point estimate of one system with its intervals
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScoreInterval {
    /// Estimate on the full sample
    pub estimate: Score,
    /// Replicate means
    pub mean: Score,
    pub left: Score,
    pub right: Score,
}

impl ScoreInterval {
    pub fn precision(&self) -> Interval {
        Interval {
            mean: self.mean.precision,
            left: self.left.precision,
            right: self.right.precision,
        }
    }

    pub fn recall(&self) -> Interval {
        Interval {
            mean: self.mean.recall,
            left: self.left.recall,
            right: self.right.recall,
        }
    }

    pub fn f1(&self) -> Interval {
        Interval {
            mean: self.mean.f1,
            left: self.left.f1,
            right: self.right.f1,
        }
    }
}

/// Linear-interpolated quantile of sorted values, `q` in [0, 1]
pub fn percentile(sorted: &[f64], q: f64) -> f64 {
    match sorted.len() {
        0 => 0.0,
        1 => sorted[0],
        n => {
            let position = q.clamp(0.0, 1.0) * (n - 1) as f64;
            let lower = position.floor() as usize;
            let upper = position.ceil() as usize;
            sorted[lower] + (sorted[upper] - sorted[lower]) * (position - lower as f64)
        }
    }
}

/// Mean and central `confidence` interval of replicate values
pub fn interval(values: &[f64], confidence: f64) -> Interval {
    if values.is_empty() {
        return Interval::default();
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(f64::total_cmp);
    let alpha = 1.0 - confidence;
    Interval {
        mean: values.iter().sum::<f64>() / values.len() as f64,
        left: percentile(&sorted, alpha / 2.0),
        right: percentile(&sorted, 1.0 - alpha / 2.0),
    }
}

// ============================================================================
// Bootstrap
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Bootstrap {
    samples: usize,
    confidence: f64,
}

impl Default for Bootstrap {
    fn default() -> Self {
        Self {
            samples: DEFAULT_SAMPLES,
            confidence: DEFAULT_CONFIDENCE,
        }
    }
}

impl Bootstrap {
    pub fn new(samples: usize, confidence: f64) -> Result<Self> {
        if samples == 0 {
            return Err(KbpoError::Scoring("bootstrap needs at least one replicate".to_string()));
        }
        if !(confidence > 0.0 && confidence < 1.0) {
            return Err(KbpoError::Scoring(format!(
                "confidence must lie in (0, 1), got {confidence}"
            )));
        }
        Ok(Self {
            samples,
            confidence,
        })
    }

    pub fn from_config(config: &ScoringConfig) -> Result<Self> {
        Self::new(config.bootstrap_samples, config.confidence)
    }

    pub fn samples(&self) -> usize {
        self.samples
    }

    pub fn confidence(&self) -> f64 {
        self.confidence
    }

    /// Intervals for every system's precision, recall and F1
    pub fn score_intervals<K>(
        &self,
        estimator: &Estimator<K>,
        mode: ScoringMode,
        sampler: &mut Sampler,
    ) -> Vec<ScoreInterval>
    where
        K: Eq + std::hash::Hash + Clone,
    {
        let estimates = estimator.score(mode);
        let m = estimates.len();
        let mut precision = vec![Vec::with_capacity(self.samples); m];
        let mut recall = vec![Vec::with_capacity(self.samples); m];
        let mut f1 = vec![Vec::with_capacity(self.samples); m];

        for _ in 0..self.samples {
            let draw = estimator.resample(sampler);
            for (i, score) in estimator.score_on(mode, &draw).into_iter().enumerate() {
                precision[i].push(score.precision);
                recall[i].push(score.recall);
                f1[i].push(score.f1);
            }
        }
        debug!(
            systems = m,
            replicates = self.samples,
            mode = %mode,
            "bootstrapped scores"
        );

        estimates
            .into_iter()
            .enumerate()
            .map(|(i, estimate)| {
                let (p, r, f) = (
                    interval(&precision[i], self.confidence),
                    interval(&recall[i], self.confidence),
                    interval(&f1[i], self.confidence),
                );
                ScoreInterval {
                    estimate,
                    mean: Score::with_f1(p.mean, r.mean, f.mean),
                    left: Score::with_f1(p.left, r.left, f.left),
                    right: Score::with_f1(p.right, r.right, f.right),
                }
            })
            .collect()
    }

    /// Intervals of a statistic vector computed over resampled units
    pub fn intervals<T, F>(&self, units: &[T], sampler: &mut Sampler, statistic: F) -> Vec<Interval>
    where
        F: Fn(&[&T]) -> Vec<f64>,
    {
        let mut replicates: Vec<Vec<f64>> = Vec::new();
        for _ in 0..self.samples {
            let draw: Vec<&T> = sampler
                .resample_indices(units.len(), units.len())
                .into_iter()
                .map(|i| &units[i])
                .collect();
            for (k, value) in statistic(&draw).into_iter().enumerate() {
                if replicates.len() <= k {
                    replicates.push(Vec::with_capacity(self.samples));
                }
                replicates[k].push(value);
            }
        }
        replicates
            .iter()
            .map(|values| interval(values, self.confidence))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distribution::{Distribution, Flat};
    use crate::estimators::{Labeled, TruthItem};
    use kbpo_core::WeightMethod;

    #[test]
    fn test_percentile_interpolates() {
        let sorted = [1.0, 2.0, 3.0, 4.0, 5.0];
        assert_eq!(percentile(&sorted, 0.0), 1.0);
        assert_eq!(percentile(&sorted, 1.0), 5.0);
        assert!((percentile(&sorted, 0.5) - 3.0).abs() < 1e-12);
        assert!((percentile(&sorted, 0.1) - 1.4).abs() < 1e-12);
        assert_eq!(percentile(&[], 0.5), 0.0);
    }

    #[test]
    fn test_interval_of_constant_values() {
        let i = interval(&[0.3; 10], 0.95);
        assert!((i.mean - 0.3).abs() < 1e-12);
        assert!((i.width()).abs() < 1e-12);
    }

    #[test]
    fn test_invalid_settings() {
        assert!(Bootstrap::new(0, 0.95).is_err());
        assert!(Bootstrap::new(10, 1.0).is_err());
        assert!(Bootstrap::from_config(&ScoringConfig::default()).is_ok());
    }

    #[test]
    fn test_score_intervals_bracket_estimate() {
        let items: Vec<u32> = (0..200).collect();
        let ps = vec![Distribution::uniform(items.clone()).unwrap()];
        let xhs: Vec<Vec<Labeled<u32>>> =
            vec![items.iter().map(|&x| (x, if x % 4 == 0 { 1.0 } else { 0.0 })).collect()];
        let y0: Vec<TruthItem<u32>> = (0..100)
            .map(|y| TruthItem::new(1000 + y, vec![y % 2 == 0]))
            .collect();
        let est = Estimator::new(&ps, &xhs, &y0, &Flat, WeightMethod::Heuristic).unwrap();

        let bootstrap = Bootstrap::new(500, 0.95).unwrap();
        let mut sampler = Sampler::seeded(42);
        let result = bootstrap.score_intervals(&est, ScoringMode::Simple, &mut sampler);
        assert_eq!(result.len(), 1);
        let s = result[0];
        assert!((s.estimate.precision - 0.25).abs() < 1e-12);
        assert!((s.estimate.recall - 0.5).abs() < 1e-12);
        assert!(s.precision().contains(0.25));
        assert!(s.recall().contains(0.5));
        assert!(s.f1().contains(s.estimate.f1));
        assert!(s.precision().width() > 0.0);
    }

    #[test]
    fn test_generic_intervals() {
        let units: Vec<f64> = (0..100).map(|x| x as f64).collect();
        let bootstrap = Bootstrap::new(300, 0.9).unwrap();
        let mut sampler = Sampler::seeded(3);
        let result = bootstrap.intervals(&units, &mut sampler, |draw| {
            vec![draw.iter().copied().sum::<f64>() / draw.len() as f64]
        });
        assert_eq!(result.len(), 1);
        assert!(result[0].contains(49.5));
        assert!((result[0].mean - 49.5).abs() < 3.0);
    }
}
