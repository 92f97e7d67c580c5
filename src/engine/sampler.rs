//! Per-slot token sampler
//!
//! Penalties, then greedy argmax or temperature / top-k / top-p sampling
//! over the raw logits of one batch position.

use std::collections::{HashMap, VecDeque};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::backend::{argmax, TokenId};
use crate::config::GenerationConfig;

pub struct Sampler {
    params: GenerationConfig,
    rng: StdRng,
    /// Recent accepted tokens, bounded by `repeat_last_n`
    history: VecDeque<TokenId>,
    counts: HashMap<TokenId, usize>,
}

impl Sampler {
    pub fn new(params: &GenerationConfig) -> Self {
        let rng = match params.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            params: params.clone(),
            rng,
            history: VecDeque::with_capacity(params.repeat_last_n),
            counts: HashMap::new(),
        }
    }

    /// Sample the next token from one position's logits.
    pub fn sample(&mut self, logits: &[f32]) -> TokenId {
        let mut logits = logits.to_vec();
        if self.params.has_penalties() {
            self.apply_penalties(&mut logits);
        }

        if self.params.is_greedy() {
            return argmax(&logits);
        }

        let probs = softmax(&logits, self.params.temperature);
        if self.params.top_p < 1.0 {
            self.top_p_sample(&probs, self.params.top_p)
        } else if let Some(k) = self.params.top_k {
            self.top_k_sample(&probs, k)
        } else {
            self.multinomial_sample(&probs)
        }
    }

    /// Greedy choice over penalized logits, the token plain greedy decoding
    /// would pick next. Draft verification compares against this.
    pub fn predict(&self, logits: &[f32]) -> TokenId {
        if !self.params.has_penalties() {
            return argmax(logits);
        }
        let mut logits = logits.to_vec();
        self.apply_penalties(&mut logits);
        argmax(&logits)
    }

    /// Record a token that became part of the output.
    pub fn accept(&mut self, token: TokenId) {
        if self.params.repeat_last_n == 0 {
            return;
        }
        if self.history.len() == self.params.repeat_last_n {
            if let Some(old) = self.history.pop_front() {
                if let Some(count) = self.counts.get_mut(&old) {
                    *count -= 1;
                    if *count == 0 {
                        self.counts.remove(&old);
                    }
                }
            }
        }
        self.history.push_back(token);
        *self.counts.entry(token).or_insert(0) += 1;
    }

    fn apply_penalties(&self, logits: &mut [f32]) {
        for (&token, &count) in &self.counts {
            let Some(logit) = logits.get_mut(token as usize) else {
                continue;
            };
            if *logit > 0.0 {
                *logit /= self.params.repeat_penalty;
            } else {
                *logit *= self.params.repeat_penalty;
            }
            *logit -= count as f32 * self.params.frequency_penalty + self.params.presence_penalty;
        }
    }

    fn multinomial_sample(&mut self, probs: &[f32]) -> TokenId {
        let sample: f32 = self.rng.gen();

        let mut cumsum = 0.0;
        for (i, &p) in probs.iter().enumerate() {
            cumsum += p;
            if cumsum > sample {
                return i as TokenId;
            }
        }

        probs.len().saturating_sub(1) as TokenId
    }

    fn top_k_sample(&mut self, probs: &[f32], k: usize) -> TokenId {
        let mut indexed: Vec<(usize, f32)> = probs.iter().copied().enumerate().collect();
        indexed.sort_by(|a, b| b.1.total_cmp(&a.1));
        indexed.truncate(k.max(1));

        // Renormalize
        let sum: f32 = indexed.iter().map(|(_, p)| p).sum();
        let sample: f32 = self.rng.gen();

        let mut cumsum = 0.0;
        for (i, p) in &indexed {
            cumsum += p / sum;
            if cumsum > sample {
                return *i as TokenId;
            }
        }

        indexed.last().map(|(i, _)| *i as TokenId).unwrap_or(0)
    }

    fn top_p_sample(&mut self, probs: &[f32], p: f32) -> TokenId {
        let mut indexed: Vec<(usize, f32)> = probs.iter().copied().enumerate().collect();
        indexed.sort_by(|a, b| b.1.total_cmp(&a.1));
        if let Some(k) = self.params.top_k {
            indexed.truncate(k.max(1));
        }

        // Find nucleus (cumsum > p)
        let mut cumsum = 0.0;
        let mut nucleus = Vec::new();
        for (i, prob) in indexed {
            cumsum += prob;
            nucleus.push((i, prob));
            if cumsum > p {
                break;
            }
        }

        let sum: f32 = nucleus.iter().map(|(_, prob)| prob).sum();
        let sample: f32 = self.rng.gen();

        let mut cumsum = 0.0;
        for (i, prob) in &nucleus {
            cumsum += prob / sum;
            if cumsum > sample {
                return *i as TokenId;
            }
        }

        nucleus.last().map(|(i, _)| *i as TokenId).unwrap_or(0)
    }
}

fn softmax(logits: &[f32], temperature: f32) -> Vec<f32> {
    let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let exps: Vec<f32> = logits
        .iter()
        .map(|l| ((l - max) / temperature).exp())
        .collect();
    let sum: f32 = exps.iter().sum();
    exps.into_iter().map(|e| e / sum).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peaked(vocab: usize, hot: usize) -> Vec<f32> {
        let mut logits = vec![0.0; vocab];
        logits[hot] = 10.0;
        logits
    }

    #[test]
    fn greedy_picks_argmax() {
        let mut sampler = Sampler::new(&GenerationConfig::greedy());
        assert_eq!(sampler.sample(&peaked(8, 5)), 5);
    }

    #[test]
    fn seeded_sampling_is_reproducible() {
        let params = GenerationConfig {
            temperature: 1.0,
            seed: Some(42),
            ..Default::default()
        };
        let logits: Vec<f32> = (0..16).map(|i| i as f32 * 0.1).collect();
        let mut a = Sampler::new(&params);
        let mut b = Sampler::new(&params);
        for _ in 0..20 {
            assert_eq!(a.sample(&logits), b.sample(&logits));
        }
    }

    #[test]
    fn top_k_one_is_greedy() {
        let params = GenerationConfig {
            temperature: 0.8,
            top_k: Some(1),
            ..Default::default()
        };
        let mut sampler = Sampler::new(&params);
        for _ in 0..10 {
            assert_eq!(sampler.sample(&peaked(8, 3)), 3);
        }
    }

    #[test]
    fn repeat_penalty_suppresses_accepted_tokens() {
        let params = GenerationConfig {
            repeat_penalty: 100.0,
            ..GenerationConfig::greedy()
        };
        let mut sampler = Sampler::new(&params);
        let mut logits = vec![0.0; 4];
        logits[1] = 5.0;
        logits[2] = 4.0;
        assert_eq!(sampler.sample(&logits), 1);
        sampler.accept(1);
        assert_eq!(sampler.sample(&logits), 2);
    }

    #[test]
    fn predict_sees_penalties_without_touching_history() {
        let params = GenerationConfig {
            presence_penalty: 20.0,
            ..GenerationConfig::greedy()
        };
        let mut sampler = Sampler::new(&params);
        assert_eq!(sampler.predict(&peaked(8, 5)), 5);
        sampler.accept(5);
        assert_ne!(sampler.predict(&peaked(8, 5)), 5);
        assert_eq!(sampler.history.len(), 1);
        let predicted = sampler.predict(&peaked(8, 5));
        assert_eq!(sampler.sample(&peaked(8, 5)), predicted);
    }

    #[test]
    fn history_is_bounded() {
        let params = GenerationConfig {
            repeat_last_n: 2,
            ..Default::default()
        };
        let mut sampler = Sampler::new(&params);
        for token in [1, 2, 3] {
            sampler.accept(token);
        }
        assert_eq!(sampler.history.len(), 2);
        assert!(!sampler.counts.contains_key(&1));
    }
}
