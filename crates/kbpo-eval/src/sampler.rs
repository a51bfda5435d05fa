//! Draws from discrete distributions
//!
//! With replacement is a plain multinomial draw. Without replacement uses
//! exponential clocks: each item `i` gets `-ln(Uᵢ)/pᵢ` and the `n` earliest
//! clocks win, which is a correctly weighted draw in one pass.

use std::hash::Hash;

use kbpo_core::{KbpoError, Result};
use rand::distributions::{Distribution as _, WeightedIndex};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{debug, warn};

use crate::distribution::Distribution;

/// Seeded source of draws; equal seeds give equal samples
#[derive(Debug, Clone)]
pub struct Sampler {
    seed: u64,
    rng: StdRng,
}

impl Sampler {
    pub fn seeded(seed: u64) -> Self {
        Self {
            seed,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Seed from the configured value, or a fresh random one
    pub fn from_option(seed: Option<u64>) -> Self {
        Self::seeded(seed.unwrap_or_else(rand::random::<u64>))
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    pub fn rng(&mut self) -> &mut StdRng {
        &mut self.rng
    }

    /// `n` independent draws
    pub fn with_replacement<K: Eq + Hash + Clone>(
        &mut self,
        distribution: &Distribution<K>,
        n: usize,
    ) -> Result<Vec<K>> {
        if distribution.is_empty() {
            return Err(KbpoError::Sampling("empty support".to_string()));
        }
        let index = WeightedIndex::new(distribution.weights())
            .map_err(|e| KbpoError::Sampling(format!("invalid weights: {e}")))?;
        let support = distribution.support();
        let draws: Vec<K> = (0..n)
            .map(|_| support[index.sample(&mut self.rng)].clone())
            .collect();
        debug!(n, support = support.len(), "drew with replacement");
        Ok(draws)
    }

    /// `n` distinct items; the full support when `n` is at least its size
    pub fn without_replacement<K: Eq + Hash + Clone>(
        &mut self,
        distribution: &Distribution<K>,
        n: usize,
    ) -> Result<Vec<K>> {
        if distribution.is_empty() {
            return Err(KbpoError::Sampling("empty support".to_string()));
        }
        if n >= distribution.len() {
            warn!(
                requested = n,
                available = distribution.len(),
                "not enough elements to sample without replacement, returning the full support"
            );
            return Ok(distribution.support().to_vec());
        }

        let mut clocks: Vec<(f64, usize)> = distribution
            .weights()
            .iter()
            .enumerate()
            .map(|(i, &p)| {
                // 1 - U lies in (0, 1], so the log is finite
                let u: f64 = 1.0 - self.rng.gen::<f64>();
                (-u.ln() / p, i)
            })
            .collect();
        clocks.sort_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)));

        let support = distribution.support();
        let draws: Vec<K> = clocks
            .into_iter()
            .take(n)
            .map(|(_, i)| support[i].clone())
            .collect();
        debug!(n, support = support.len(), "drew without replacement");
        Ok(draws)
    }

    pub fn draw<K: Eq + Hash + Clone>(
        &mut self,
        distribution: &Distribution<K>,
        n: usize,
        with_replacement: bool,
    ) -> Result<Vec<K>> {
        if with_replacement {
            self.with_replacement(distribution, n)
        } else {
            self.without_replacement(distribution, n)
        }
    }

    /// `n` indices drawn uniformly with replacement from `0..len`
    pub fn resample_indices(&mut self, len: usize, n: usize) -> Vec<usize> {
        if len == 0 {
            return Vec::new();
        }
        (0..n).map(|_| self.rng.gen_range(0..len)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn skewed() -> Distribution<u32> {
        Distribution::from_masses([(0, 0.7), (1, 0.2), (2, 0.05), (3, 0.05)]).unwrap()
    }

    #[test]
    fn test_fixed_seed_is_reproducible() {
        let p = Distribution::uniform(0..100u32).unwrap();
        let a = Sampler::seeded(7).without_replacement(&p, 10).unwrap();
        let b = Sampler::seeded(7).without_replacement(&p, 10).unwrap();
        let c = Sampler::seeded(8).without_replacement(&p, 10).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);

        let a = Sampler::seeded(7).with_replacement(&p, 10).unwrap();
        let b = Sampler::seeded(7).with_replacement(&p, 10).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_without_replacement_is_distinct() {
        let p = Distribution::uniform(0..50u32).unwrap();
        let draws = Sampler::seeded(1).without_replacement(&p, 20).unwrap();
        assert_eq!(draws.len(), 20);
        assert_eq!(draws.iter().collect::<HashSet<_>>().len(), 20);
    }

    #[test]
    fn test_short_support_returns_everything() {
        let p = skewed();
        let draws = Sampler::seeded(1).without_replacement(&p, 10).unwrap();
        assert_eq!(draws, vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_with_replacement_follows_weights() {
        let p = skewed();
        let draws = Sampler::seeded(3).with_replacement(&p, 20_000).unwrap();
        assert_eq!(draws.len(), 20_000);
        let zeros = draws.iter().filter(|&&x| x == 0).count() as f64 / 20_000.0;
        assert!((zeros - 0.7).abs() < 0.02);
    }

    #[test]
    fn test_without_replacement_prefers_heavy_items() {
        let p = skewed();
        let mut sampler = Sampler::seeded(11);
        let mut first = 0;
        for _ in 0..2_000 {
            if sampler.without_replacement(&p, 1).unwrap()[0] == 0 {
                first += 1;
            }
        }
        let rate = first as f64 / 2_000.0;
        assert!((rate - 0.7).abs() < 0.05);
    }

    #[test]
    fn test_resample_indices() {
        let mut sampler = Sampler::seeded(5);
        let idx = sampler.resample_indices(4, 100);
        assert_eq!(idx.len(), 100);
        assert!(idx.iter().all(|&i| i < 4));
        assert!(sampler.resample_indices(0, 10).is_empty());
    }
}
