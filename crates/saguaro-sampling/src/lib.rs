//! # saguaro-sampling
//!
//! Token sampling for the saguaro generation controller.
//!
//! The controller consumes sampling through the [`Sampler`] trait: given the
//! logits for the current position it returns one token id (plus, optionally,
//! the top-N candidate probabilities), and it is told about every accepted
//! token so it can maintain repetition-penalty state. [`SoftmaxSampler`] is
//! the built-in implementation:
//! - Greedy (argmax) at near-zero temperature
//! - Temperature scaling
//! - Top-k filtering
//! - Top-p (nucleus) filtering
//! - Repetition penalty over a bounded window of accepted tokens
//! - Deterministic seeded RNG for reproducible generation

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

/// Token id type (i32 for FFI compat; logically non-negative).
pub type TokenId = i32;

/// Sampling error type.
#[derive(Debug, Clone, PartialEq)]
pub enum SamplingError {
    InvalidLogits,
    InvalidTemperature,
    NoValidTokens,
}

impl std::fmt::Display for SamplingError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SamplingError::InvalidLogits => write!(f, "Invalid logits array"),
            SamplingError::InvalidTemperature => write!(f, "Temperature must be > 0"),
            SamplingError::NoValidTokens => write!(f, "No valid tokens after filtering"),
        }
    }
}

impl std::error::Error for SamplingError {}

pub type SamplingResult<T> = std::result::Result<T, SamplingError>;

/// A candidate token with its post-filtering probability.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TokenProb {
    pub id: TokenId,
    pub prob: f32,
}

/// One sampled token, with the top-N candidate probabilities when the
/// sampler was configured with `n_probs > 0`.
#[derive(Debug, Clone, Default)]
pub struct SampledToken {
    pub id: TokenId,
    pub probs: Vec<TokenProb>,
}

/// The sampler capability consumed by the generation loop.
///
/// `accept` is called for every token that enters the context: prompt tokens
/// with `generated = false`, sampled tokens with `generated = true`. Only
/// generated tokens should feed penalty state that is meant to discourage the
/// model from repeating its own output, but implementations are free to use
/// prompt tokens too.
pub trait Sampler: Send {
    /// Pick the next token from the logits of the current position.
    fn sample(&mut self, logits: &[f32]) -> SamplingResult<SampledToken>;

    /// Record an accepted token for penalty bookkeeping.
    fn accept(&mut self, token: TokenId, generated: bool);

    /// Clear all per-episode state (penalty history, RNG is kept).
    fn reset(&mut self);
}

/// Deterministic RNG for reproducible sampling.
///
/// Uses a simple xorshift64 algorithm for fast, reproducible random numbers.
#[derive(Debug, Clone)]
pub struct SeededRng {
    state: u64,
}

impl SeededRng {
    pub fn new(seed: u64) -> Self {
        // Avoid zero state which would produce all zeros
        Self {
            state: if seed == 0 { 1 } else { seed },
        }
    }

    /// Generate next random float in [0, 1).
    pub fn next_f32(&mut self) -> f32 {
        // xorshift64
        self.state ^= self.state << 13;
        self.state ^= self.state >> 7;
        self.state ^= self.state << 17;
        (self.state >> 40) as f32 / (1u64 << 24) as f32
    }
}

/// Configuration for [`SoftmaxSampler`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SamplerConfig {
    /// Temperature for softmax scaling. Values below `1e-3` mean greedy.
    pub temperature: f32,

    /// Top-k: only sample from the top k logits. `None` disables.
    pub top_k: Option<usize>,

    /// Top-p (nucleus): sample from the smallest set of tokens with
    /// cumulative probability >= p. `None` disables.
    pub top_p: Option<f32>,

    /// Repetition penalty over recently accepted tokens. `None` disables.
    pub repetition_penalty: Option<f32>,

    /// How many accepted tokens the penalty window remembers.
    pub penalty_last_n: usize,

    /// How many candidate probabilities to report per sampled token.
    pub n_probs: usize,

    /// RNG seed.
    pub seed: u64,
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self {
            temperature: 1.0,
            top_k: None,
            top_p: None,
            repetition_penalty: None,
            penalty_last_n: 64,
            n_probs: 0,
            seed: 42,
        }
    }
}

/// Built-in sampler: penalties, temperature, top-k, top-p over a softmax.
#[derive(Debug, Clone)]
pub struct SoftmaxSampler {
    config: SamplerConfig,
    rng: SeededRng,
    /// Recently accepted tokens, oldest first, bounded by `penalty_last_n`.
    recent: VecDeque<TokenId>,
}

impl SoftmaxSampler {
    pub fn new(config: SamplerConfig) -> Self {
        let rng = SeededRng::new(config.seed);
        Self {
            config,
            rng,
            recent: VecDeque::new(),
        }
    }

    pub fn config(&self) -> &SamplerConfig {
        &self.config
    }

    fn apply_repetition_penalty(&self, logits: &mut [f32]) {
        let Some(penalty) = self.config.repetition_penalty else {
            return;
        };
        // Dividing positive logits and multiplying negative ones always makes
        // repeated tokens less likely regardless of sign.
        for &token in &self.recent {
            let idx = token as usize;
            if idx < logits.len() {
                if logits[idx] > 0.0 {
                    logits[idx] /= penalty;
                } else {
                    logits[idx] *= penalty;
                }
            }
        }
    }

    fn apply_top_k(logits: &mut [f32], k: usize) {
        if k == 0 || k >= logits.len() {
            return;
        }

        let mut sorted: Vec<f32> = logits.to_vec();
        sorted.sort_by(|a, b| b.partial_cmp(a).unwrap_or(std::cmp::Ordering::Equal));

        let threshold = sorted[k - 1];
        for logit in logits.iter_mut() {
            if *logit < threshold {
                *logit = f32::NEG_INFINITY;
            }
        }
    }

    fn apply_top_p(probs: &[f32], p: f32) -> Vec<f32> {
        let mut indexed: Vec<(usize, f32)> =
            probs.iter().enumerate().map(|(i, &pr)| (i, pr)).collect();
        indexed.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));

        let mut cumsum = 0.0;
        let mut cutoff_idx = 0;
        for (idx, (_, prob)) in indexed.iter().enumerate() {
            cumsum += prob;
            cutoff_idx = idx;
            if cumsum >= p {
                break;
            }
        }

        let cutoff_prob = indexed[cutoff_idx].1;
        let mut result = vec![0.0; probs.len()];
        for (i, &pr) in probs.iter().enumerate() {
            if pr >= cutoff_prob {
                result[i] = pr;
            }
        }

        let sum: f32 = result.iter().sum();
        if sum > 0.0 {
            for p in &mut result {
                *p /= sum;
            }
        }

        result
    }

    fn softmax(logits: &[f32]) -> Vec<f32> {
        let max_logit = logits.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
        let exps: Vec<f32> = logits.iter().map(|&l| (l - max_logit).exp()).collect();
        let sum: f32 = exps.iter().sum();

        if sum > 0.0 {
            exps.iter().map(|&e| e / sum).collect()
        } else {
            vec![1.0 / logits.len() as f32; logits.len()]
        }
    }

    fn argmax(probs: &[f32]) -> usize {
        probs
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.partial_cmp(b.1).unwrap_or(std::cmp::Ordering::Equal))
            .map(|(idx, _)| idx)
            .unwrap_or(0)
    }

    fn top_n_probs(probs: &[f32], n: usize) -> Vec<TokenProb> {
        if n == 0 {
            return Vec::new();
        }
        let mut indexed: Vec<(usize, f32)> =
            probs.iter().enumerate().map(|(i, &pr)| (i, pr)).collect();
        indexed.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        indexed
            .into_iter()
            .take(n)
            .map(|(i, prob)| TokenProb {
                id: i as TokenId,
                prob,
            })
            .collect()
    }

    fn pick_from_distribution(&mut self, probs: &[f32]) -> SamplingResult<usize> {
        let r = self.rng.next_f32();
        let mut cumsum = 0.0;

        for (i, &prob) in probs.iter().enumerate() {
            cumsum += prob;
            if r < cumsum {
                return Ok(i);
            }
        }

        // Fallback to last token with nonzero probability
        for (i, &prob) in probs.iter().enumerate().rev() {
            if prob > 0.0 {
                return Ok(i);
            }
        }

        Err(SamplingError::NoValidTokens)
    }
}

impl Sampler for SoftmaxSampler {
    fn sample(&mut self, logits: &[f32]) -> SamplingResult<SampledToken> {
        if logits.is_empty() {
            return Err(SamplingError::InvalidLogits);
        }
        if self.config.temperature <= 0.0 {
            return Err(SamplingError::InvalidTemperature);
        }

        let mut work = logits.to_vec();
        self.apply_repetition_penalty(&mut work);

        if (self.config.temperature - 1.0).abs() > 1e-6 {
            for logit in &mut work {
                *logit /= self.config.temperature;
            }
        }

        if let Some(k) = self.config.top_k {
            Self::apply_top_k(&mut work, k);
        }

        let probs = Self::softmax(&work);
        let top_probs = Self::top_n_probs(&probs, self.config.n_probs);

        // Near-greedy temperatures collapse to argmax.
        if self.config.temperature < 1e-3 {
            return Ok(SampledToken {
                id: Self::argmax(&probs) as TokenId,
                probs: top_probs,
            });
        }

        let probs = if let Some(p) = self.config.top_p {
            Self::apply_top_p(&probs, p)
        } else {
            probs
        };

        let idx = self.pick_from_distribution(&probs)?;
        Ok(SampledToken {
            id: idx as TokenId,
            probs: top_probs,
        })
    }

    fn accept(&mut self, token: TokenId, _generated: bool) {
        if self.config.penalty_last_n == 0 {
            return;
        }
        self.recent.push_back(token);
        while self.recent.len() > self.config.penalty_last_n {
            self.recent.pop_front();
        }
    }

    fn reset(&mut self) {
        self.recent.clear();
    }
}
