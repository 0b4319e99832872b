//! Next-token selection from logits.

use super::GenerationConfig;
use crate::error::{EmberError, Result};
use rand::distributions::{Distribution, WeightedIndex};
use rand::rngs::StdRng;
use rand::SeedableRng;

/// Picks the next token from a row of logits.
///
/// Greedy when sampling is disabled or the temperature is zero; otherwise a
/// seeded draw from `softmax(logits / temperature)`, optionally restricted
/// to the `top_k` most likely tokens.
#[derive(Debug, Clone)]
pub struct Sampler {
    temperature: f32,
    do_sample: bool,
    top_k: Option<usize>,
    rng: StdRng,
}

impl Sampler {
    /// Create a sampler for a generation config.
    pub fn new(config: &GenerationConfig, seed: u64) -> Self {
        Self {
            temperature: config.temperature,
            do_sample: config.do_sample,
            top_k: config.top_k,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Always pick the most likely token.
    pub fn greedy() -> Self {
        Self {
            temperature: 0.0,
            do_sample: false,
            top_k: None,
            rng: StdRng::seed_from_u64(0),
        }
    }

    /// Whether this sampler always takes the argmax.
    pub fn is_greedy(&self) -> bool {
        !self.do_sample || self.temperature <= 0.0
    }

    /// Select a token.
    ///
    /// `step` is only used to report non-finite logits.
    pub fn sample(&mut self, logits: &[f32], step: usize) -> Result<u32> {
        if logits.is_empty() || logits.iter().any(|l| !l.is_finite()) {
            return Err(EmberError::NonFiniteLogits { step });
        }

        if self.is_greedy() {
            return Ok(argmax(logits));
        }

        let mut candidates: Vec<(u32, f32)> = logits
            .iter()
            .enumerate()
            .map(|(i, &l)| (i as u32, l))
            .collect();

        if let Some(k) = self.top_k.filter(|&k| k > 0 && k < candidates.len()) {
            candidates.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
            candidates.truncate(k);
        }

        // Shift before scaling so a tiny temperature cannot overflow
        let max_logit = candidates
            .iter()
            .map(|(_, l)| *l)
            .fold(f32::NEG_INFINITY, f32::max);
        let weights: Vec<f32> = candidates
            .iter()
            .map(|(_, l)| ((l - max_logit) / self.temperature).exp())
            .collect();

        let dist = WeightedIndex::new(&weights).map_err(|_| EmberError::NonFiniteLogits { step })?;
        Ok(candidates[dist.sample(&mut self.rng)].0)
    }
}

/// Index of the largest logit; the first one wins ties.
pub fn argmax(logits: &[f32]) -> u32 {
    let mut best = 0;
    for (i, &l) in logits.iter().enumerate() {
        if l > logits[best] {
            best = i;
        }
    }
    best as u32
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn sampling(temperature: f32, top_k: Option<usize>) -> GenerationConfig {
        GenerationConfig {
            max_new_tokens: 8,
            temperature,
            do_sample: true,
            top_k,
        }
    }

    #[test]
    fn greedy_takes_argmax() {
        let mut sampler = Sampler::greedy();
        assert_eq!(sampler.sample(&[0.1, 2.0, -1.0, 1.9], 0).unwrap(), 1);
    }

    #[test]
    fn argmax_first_wins_ties() {
        assert_eq!(argmax(&[1.0, 3.0, 3.0]), 1);
    }

    #[test]
    fn zero_temperature_is_greedy() {
        let mut sampler = Sampler::new(&sampling(0.0, None), 9);
        assert!(sampler.is_greedy());
        for _ in 0..10 {
            assert_eq!(sampler.sample(&[0.0, 0.5, 0.4], 0).unwrap(), 1);
        }
    }

    #[test]
    fn do_sample_false_is_greedy() {
        let config = GenerationConfig {
            do_sample: false,
            ..sampling(1.5, None)
        };
        assert!(Sampler::new(&config, 1).is_greedy());
    }

    #[test]
    fn non_finite_logits_rejected() {
        let mut sampler = Sampler::greedy();
        let result = sampler.sample(&[0.0, f32::NAN], 3);
        assert!(matches!(result, Err(EmberError::NonFiniteLogits { step: 3 })));

        let mut sampler = Sampler::new(&sampling(1.0, None), 0);
        let result = sampler.sample(&[f32::INFINITY, 0.0], 0);
        assert!(matches!(result, Err(EmberError::NonFiniteLogits { step: 0 })));
    }

    #[test]
    fn tiny_temperature_picks_the_argmax() {
        let mut sampler = Sampler::new(&sampling(1e-38, None), 4);
        assert!(!sampler.is_greedy());
        for _ in 0..10 {
            assert_eq!(sampler.sample(&[10.0, 5.0, -3.0], 0).unwrap(), 0);
        }
    }

    #[test]
    fn top_k_one_is_greedy() {
        let mut sampler = Sampler::new(&sampling(1.0, Some(1)), 5);
        for _ in 0..20 {
            assert_eq!(sampler.sample(&[0.3, 0.2, 0.9, 0.1], 0).unwrap(), 2);
        }
    }

    #[test]
    fn same_seed_same_draws() {
        let logits: Vec<f32> = (0..50).map(|i| (i as f32 * 0.37).sin()).collect();
        let draw = |seed| {
            let mut sampler = Sampler::new(&sampling(1.0, None), seed);
            (0..32).map(|_| sampler.sample(&logits, 0).unwrap()).collect::<Vec<_>>()
        };
        assert_eq!(draw(17), draw(17));
        assert_ne!(draw(17), draw(18));
    }

    proptest! {
        /// Top-k draws never leave the k most likely tokens.
        #[test]
        fn top_k_restricts_support(
            logits in prop::collection::vec(-5.0f32..5.0, 8..32),
            k in 1usize..5,
            seed in any::<u64>(),
        ) {
            let mut ranked: Vec<f32> = logits.clone();
            ranked.sort_by(|a, b| b.partial_cmp(a).unwrap());
            let threshold = ranked[k - 1];

            let mut sampler = Sampler::new(&sampling(1.0, Some(k)), seed);
            for _ in 0..8 {
                let token = sampler.sample(&logits, 0).unwrap() as usize;
                prop_assert!(logits[token] >= threshold);
            }
        }
    }
}
