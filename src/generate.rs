use std::cmp::Ordering;

use anyhow::{bail, Result};
use rand::distributions::{Distribution, WeightedIndex};
use rand::Rng;
use tracing::trace;

use crate::config::GenerationConfig;

/// One autoregressive forward step over a model with per-sequence state
/// (typically a KV cache). `State` is cloned whenever a beam forks.
pub trait StepModel {
    type State: Clone;

    fn start(&self) -> Result<Self::State>;

    /// Feeds `tokens` starting at absolute position `index_pos` and returns
    /// the next-token logits.
    fn step(&self, tokens: &[u32], index_pos: usize, state: &mut Self::State)
        -> Result<Vec<f32>>;

    fn eos_token_id(&self) -> u32;
}

/// Prompt in, decoded beams out (best first, prompt echo included).
pub trait CandidateGenerator {
    fn generate(&mut self, prompt: &str, cfg: &GenerationConfig) -> Result<Vec<String>>;
}

pub fn log_softmax(logits: &[f32]) -> Vec<f64> {
    let max = logits
        .iter()
        .copied()
        .fold(f32::NEG_INFINITY, f32::max) as f64;
    let sum: f64 = logits.iter().map(|&l| (l as f64 - max).exp()).sum();
    let log_z = max + sum.ln();
    logits.iter().map(|&l| l as f64 - log_z).collect()
}

pub fn apply_temperature(scores: &mut [f64], temperature: f64) {
    if temperature == 1.0 {
        return;
    }
    for s in scores.iter_mut() {
        *s /= temperature;
    }
}

/// Masks everything strictly below the k-th largest score.
pub fn apply_top_k(scores: &mut [f64], top_k: usize, min_keep: usize) {
    if top_k == 0 {
        return;
    }
    let k = top_k.max(min_keep).min(scores.len());
    if k == scores.len() {
        return;
    }
    let mut sorted = scores.to_vec();
    sorted.sort_by(|a, b| b.partial_cmp(a).unwrap_or(Ordering::Equal));
    let threshold = sorted[k - 1];
    for s in scores.iter_mut() {
        if *s < threshold {
            *s = f64::NEG_INFINITY;
        }
    }
}

/// Nucleus filter: drops the low-probability tail whose mass is at most
/// `1 - top_p`, never keeping fewer than `min_keep` tokens.
pub fn apply_top_p(scores: &mut [f64], top_p: f64, min_keep: usize) {
    if top_p >= 1.0 {
        return;
    }
    let probs = softmax(scores);
    let mut order: Vec<usize> = (0..scores.len()).collect();
    order.sort_by(|&a, &b| probs[a].partial_cmp(&probs[b]).unwrap_or(Ordering::Equal));

    let removable = scores.len().saturating_sub(min_keep);
    let mut cumulative = 0.0;
    for (pos, &idx) in order.iter().enumerate() {
        cumulative += probs[idx];
        if cumulative > 1.0 - top_p || pos >= removable {
            break;
        }
        scores[idx] = f64::NEG_INFINITY;
    }
}

pub fn softmax(scores: &[f64]) -> Vec<f64> {
    let max = scores.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    if max == f64::NEG_INFINITY {
        return vec![0.0; scores.len()];
    }
    let exps: Vec<f64> = scores.iter().map(|&s| (s - max).exp()).collect();
    let sum: f64 = exps.iter().sum();
    exps.into_iter().map(|e| e / sum).collect()
}

/// Draws up to `n` distinct indices proportionally to `weights`.
pub fn sample_without_replacement<R: Rng>(
    weights: &[f64],
    n: usize,
    rng: &mut R,
) -> Vec<usize> {
    let n = n.min(weights.iter().filter(|&&w| w > 0.0).count());
    let mut picked = Vec::with_capacity(n);
    if n == 0 {
        return picked;
    }
    let Ok(mut dist) = WeightedIndex::new(weights) else {
        return picked;
    };
    loop {
        let i = dist.sample(rng);
        picked.push(i);
        if picked.len() == n || dist.update_weights(&[(i, &0.0)]).is_err() {
            break;
        }
    }
    picked
}

fn top_n_indices(scores: &[f64], n: usize) -> Vec<usize> {
    let mut order: Vec<usize> = (0..scores.len())
        .filter(|&i| scores[i] > f64::NEG_INFINITY)
        .collect();
    order.sort_by(|&a, &b| scores[b].partial_cmp(&scores[a]).unwrap_or(Ordering::Equal));
    order.truncate(n);
    order
}

/// Finished sequences, capped at `capacity` best by length-normalized score.
#[derive(Debug)]
struct Hypotheses {
    capacity: usize,
    length_penalty: f64,
    entries: Vec<(f64, Vec<u32>)>,
}

impl Hypotheses {
    fn new(capacity: usize, length_penalty: f64) -> Self {
        Self {
            capacity,
            length_penalty,
            entries: Vec::with_capacity(capacity + 1),
        }
    }

    fn normalized(&self, sum_logprobs: f64, len: usize) -> f64 {
        sum_logprobs / (len as f64).powf(self.length_penalty)
    }

    fn worst(&self) -> f64 {
        self.entries
            .iter()
            .map(|(s, _)| *s)
            .fold(f64::INFINITY, f64::min)
    }

    fn add(&mut self, tokens: Vec<u32>, sum_logprobs: f64) {
        let score = self.normalized(sum_logprobs, tokens.len());
        if self.entries.len() < self.capacity || score > self.worst() {
            self.entries.push((score, tokens));
            if self.entries.len() > self.capacity {
                let worst_idx = self
                    .entries
                    .iter()
                    .enumerate()
                    .min_by(|a, b| a.1 .0.partial_cmp(&b.1 .0).unwrap_or(Ordering::Equal))
                    .map(|(i, _)| i);
                if let Some(i) = worst_idx {
                    self.entries.remove(i);
                }
            }
        }
    }

    /// No running beam scoring `best_running` at `cur_len` can still enter.
    fn is_done(&self, best_running: f64, cur_len: usize) -> bool {
        self.entries.len() >= self.capacity
            && self.worst() >= self.normalized(best_running, cur_len)
    }

    fn into_sorted(mut self) -> Vec<Vec<u32>> {
        self.entries.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(Ordering::Equal));
        self.entries.into_iter().map(|(_, t)| t).collect()
    }
}

struct Beam<S> {
    tokens: Vec<u32>,
    score: f64,
    state: S,
    logits: Vec<f32>,
}

/// Beam search over `model`; with `do_sample` the expansion candidates are
/// drawn from the warped joint distribution over all beams instead of taken
/// greedily. Returns up to `num_return_sequences` full sequences
/// (prompt + continuation, EOS stripped), best first.
pub fn beam_sample<M, R>(
    model: &M,
    prompt_ids: &[u32],
    cfg: &GenerationConfig,
    rng: &mut R,
) -> Result<Vec<Vec<u32>>>
where
    M: StepModel + ?Sized,
    R: Rng,
{
    cfg.validate()?;
    if prompt_ids.is_empty() {
        bail!("prompt_ids is empty");
    }
    let num_beams = cfg.num_beams;
    let eos = model.eos_token_id();
    let min_keep = if num_beams > 1 { 2 } else { 1 };

    let mut state = model.start()?;
    let logits = model.step(prompt_ids, 0, &mut state)?;
    let mut beams = vec![Beam {
        tokens: prompt_ids.to_vec(),
        score: 0.0,
        state,
        logits,
    }];
    let mut hyps = Hypotheses::new(num_beams, cfg.length_penalty);
    let mut done = false;

    for step in 0..cfg.max_new_tokens {
        let vocab = beams[0].logits.len();
        let mut flat = Vec::with_capacity(beams.len() * vocab);
        for beam in &beams {
            if beam.logits.len() != vocab {
                bail!("beam logits width {} != {vocab}", beam.logits.len());
            }
            let mut scores = log_softmax(&beam.logits);
            for s in scores.iter_mut() {
                *s += beam.score;
            }
            if cfg.do_sample {
                apply_temperature(&mut scores, cfg.temperature);
                apply_top_k(&mut scores, cfg.top_k, min_keep);
                apply_top_p(&mut scores, cfg.top_p, min_keep);
            }
            flat.extend(scores);
        }

        let mut picked = if cfg.do_sample {
            sample_without_replacement(&softmax(&flat), 2 * num_beams, rng)
        } else {
            top_n_indices(&flat, 2 * num_beams)
        };
        picked.sort_by(|&a, &b| flat[b].partial_cmp(&flat[a]).unwrap_or(Ordering::Equal));

        let cur_len = beams[0].tokens.len();
        let mut next: Vec<(usize, u32, f64)> = Vec::with_capacity(num_beams);
        for (rank, &idx) in picked.iter().enumerate() {
            let (beam_idx, token) = (idx / vocab, (idx % vocab) as u32);
            let score = flat[idx];
            if token == eos {
                if rank < num_beams {
                    hyps.add(beams[beam_idx].tokens.clone(), score);
                }
            } else {
                next.push((beam_idx, token, score));
            }
            if next.len() == num_beams {
                break;
            }
        }
        trace!(step, running = next.len(), finished = hyps.entries.len(), "beam step");

        let best_candidate = picked.first().map_or(f64::NEG_INFINITY, |&i| flat[i]);
        if next.is_empty() || hyps.is_done(best_candidate, cur_len) {
            done = true;
            break;
        }

        let last_step = step + 1 == cfg.max_new_tokens;
        let mut forked = Vec::with_capacity(next.len());
        for (beam_idx, token, score) in next {
            let parent = &beams[beam_idx];
            let mut tokens = parent.tokens.clone();
            tokens.push(token);
            let mut state = parent.state.clone();
            let logits = if last_step {
                Vec::new()
            } else {
                model.step(&[token], tokens.len() - 1, &mut state)?
            };
            forked.push(Beam {
                tokens,
                score,
                state,
                logits,
            });
        }
        beams = forked;
    }

    if !done {
        for beam in beams {
            hyps.add(beam.tokens, beam.score);
        }
    }

    let mut out = hyps.into_sorted();
    out.truncate(cfg.num_return_sequences);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    const EOS: u32 = 3;

    /// Next-token logits depend only on the last token.
    struct TableModel {
        table: fn(u32) -> Vec<f32>,
    }

    impl StepModel for TableModel {
        type State = usize;

        fn start(&self) -> Result<usize> {
            Ok(0)
        }

        fn step(&self, tokens: &[u32], index_pos: usize, state: &mut usize) -> Result<Vec<f32>> {
            assert_eq!(index_pos, *state, "positions must be contiguous per beam");
            *state += tokens.len();
            Ok((self.table)(*tokens.last().expect("non-empty")))
        }

        fn eos_token_id(&self) -> u32 {
            EOS
        }
    }

    fn cfg(num_beams: usize, do_sample: bool, max_new_tokens: usize) -> GenerationConfig {
        GenerationConfig {
            temperature: 1.0,
            top_p: 1.0,
            top_k: 0,
            num_beams,
            num_return_sequences: num_beams,
            do_sample,
            max_new_tokens,
            length_penalty: 1.0,
        }
    }

    #[test]
    fn greedy_beams_prefer_highest_likelihood() -> Result<()> {
        let model = TableModel {
            table: |_| vec![2.0, 1.0, 0.5, f32::NEG_INFINITY],
        };
        let mut rng = StdRng::seed_from_u64(0);
        let out = beam_sample(&model, &[0], &cfg(2, false, 3), &mut rng)?;
        assert_eq!(out.len(), 2);
        assert_eq!(out[0], vec![0, 0, 0, 0]);
        assert_ne!(out[0], out[1]);
        assert!(out.iter().all(|s| s.len() == 4 && s[0] == 0));
        Ok(())
    }

    #[test]
    fn eos_finishes_hypotheses_without_eos_token() -> Result<()> {
        let model = TableModel {
            table: |last| match last {
                0 => vec![0.0, 5.0, 4.0, 0.0],
                _ => vec![0.0, 0.0, 0.0, 10.0],
            },
        };
        let mut rng = StdRng::seed_from_u64(0);
        let out = beam_sample(&model, &[0], &cfg(2, false, 10), &mut rng)?;
        assert_eq!(out, vec![vec![0, 1], vec![0, 2]]);
        Ok(())
    }

    #[test]
    fn sampling_is_reproducible_for_a_seed() -> Result<()> {
        let model = TableModel {
            table: |last| {
                let mut v = vec![1.0, 1.2, 0.8, -1.0];
                v[(last as usize) % 3] += 0.5;
                v
            },
        };
        let c = GenerationConfig {
            temperature: 0.7,
            top_p: 0.9,
            top_k: 3,
            ..cfg(3, true, 4)
        };
        let a = beam_sample(&model, &[1, 2], &c, &mut StdRng::seed_from_u64(7))?;
        let b = beam_sample(&model, &[1, 2], &c, &mut StdRng::seed_from_u64(7))?;
        assert_eq!(a, b);
        assert!(!a.is_empty() && a.len() <= 3);
        assert!(a.iter().all(|s| s.starts_with(&[1, 2]) && !s.contains(&EOS)));
        Ok(())
    }

    #[test]
    fn returns_at_most_num_return_sequences() -> Result<()> {
        let model = TableModel {
            table: |_| vec![1.0, 1.0, 1.0, f32::NEG_INFINITY],
        };
        let c = GenerationConfig {
            num_return_sequences: 2,
            ..cfg(4, false, 2)
        };
        let out = beam_sample(&model, &[0], &c, &mut StdRng::seed_from_u64(0))?;
        assert_eq!(out.len(), 2);
        Ok(())
    }

    #[test]
    fn empty_prompt_is_error() {
        let model = TableModel {
            table: |_| vec![0.0; 4],
        };
        let err = beam_sample(&model, &[], &cfg(1, false, 1), &mut StdRng::seed_from_u64(0));
        assert!(err.is_err());
    }

    #[test]
    fn log_softmax_normalizes() {
        let lp = log_softmax(&[1.0, 2.0, 3.0]);
        let total: f64 = lp.iter().map(|v| v.exp()).sum();
        assert!((total - 1.0).abs() < 1e-9);
        assert!(lp[2] > lp[1] && lp[1] > lp[0]);
    }

    #[test]
    fn top_k_keeps_ties_and_min_keep() {
        let mut s = vec![3.0, 1.0, 2.0, 2.0];
        apply_top_k(&mut s, 2, 1);
        assert_eq!(s, vec![3.0, f64::NEG_INFINITY, 2.0, 2.0]);

        let mut s = vec![3.0, 1.0, 2.0];
        apply_top_k(&mut s, 1, 2);
        assert_eq!(s, vec![3.0, f64::NEG_INFINITY, 2.0]);
    }

    #[test]
    fn top_p_drops_low_mass_tail() {
        // probabilities ~ [0.665, 0.245, 0.090]
        let mut s = vec![2.0, 1.0, 0.0];
        apply_top_p(&mut s, 0.75, 1);
        assert_eq!(s, vec![2.0, 1.0, f64::NEG_INFINITY]);

        let mut s = vec![2.0, 1.0, 0.0];
        apply_top_p(&mut s, 0.5, 2);
        assert_eq!(s, vec![2.0, 1.0, f64::NEG_INFINITY]);

        let mut s = vec![2.0, 1.0, 0.0];
        apply_top_p(&mut s, 0.5, 1);
        assert_eq!(s, vec![2.0, f64::NEG_INFINITY, f64::NEG_INFINITY]);
    }

    #[test]
    fn finished_best_candidate_keeps_search_open() -> Result<()> {
        // Step 2 puts EOS at rank 0; its score, not the best running one,
        // decides whether the pool is done.
        let model = TableModel {
            table: |last| match last {
                0 => vec![f32::NEG_INFINITY, 0.0, -2.9, f32::NEG_INFINITY],
                1 => vec![f32::NEG_INFINITY, f32::NEG_INFINITY, 0.0, -1.9],
                _ => vec![-3.0, f32::NEG_INFINITY, f32::NEG_INFINITY, 0.0],
            },
        };
        let out = beam_sample(&model, &[0], &cfg(2, false, 3), &mut StdRng::seed_from_u64(0))?;
        assert_eq!(out, vec![vec![0, 1, 2], vec![0, 1, 2, 0]]);
        Ok(())
    }

    #[test]
    fn sampling_without_replacement_is_distinct() {
        let mut rng = StdRng::seed_from_u64(11);
        let picked = sample_without_replacement(&[0.1, 0.2, 0.3, 0.4], 3, &mut rng);
        assert_eq!(picked.len(), 3);
        let mut sorted = picked.clone();
        sorted.sort();
        sorted.dedup();
        assert_eq!(sorted.len(), 3);
        assert!(sample_without_replacement(&[0.0, 0.0], 2, &mut rng).is_empty());
    }

    #[test]
    fn sampling_without_replacement_skips_zero_weights() {
        let mut rng = StdRng::seed_from_u64(3);
        let picked = sample_without_replacement(&[0.0, 0.5, 0.0, 0.5], 4, &mut rng);
        let mut sorted = picked.clone();
        sorted.sort();
        assert_eq!(sorted, vec![1, 3]);
    }
}
