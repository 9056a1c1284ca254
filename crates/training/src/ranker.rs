//! Per-example difficulty scoring for boosted training.
//!
//! Each example is scored by the mean per-token perplexity of its target
//! under the current model. Scores accumulate over a training epoch; at the
//! end the highest-scoring fraction becomes the hard pool that the boosted
//! dataset builder appends to the next epoch.

use std::collections::HashMap;

use candle_core::{DType, Tensor};
use tracing::info;

use crate::{config::to_runtime_error, data::TrainingExample, loss::token_nll, TrainingError};

/// Number of examples surfaced at each end of the ranking.
pub const REPORTED_EXTREMES: usize = 10;

/// Mean per-token perplexity of every example in a batch.
///
/// `log_probs` is `[batch * seq_len, vocab]` and `targets` is
/// `[batch * seq_len]`, both flattened row-major from `[batch, seq_len]`.
/// Padding positions are scored like any other token.
pub fn score_batch(
    log_probs: &Tensor,
    targets: &Tensor,
    batch_size: usize,
    seq_len: usize,
) -> Result<Vec<f64>, TrainingError> {
    if seq_len == 0 {
        return Err(TrainingError::runtime(
            "cannot score examples with an empty target sequence",
        ));
    }
    let rows = log_probs.dim(0).map_err(to_runtime_error)?;
    if rows != batch_size * seq_len {
        return Err(TrainingError::ShapeMismatch {
            output: rows,
            target: batch_size * seq_len,
        });
    }

    token_nll(log_probs, targets)?
        .exp()
        .map_err(to_runtime_error)?
        .reshape((batch_size, seq_len))
        .map_err(to_runtime_error)?
        .mean(1)
        .map_err(to_runtime_error)?
        .to_dtype(DType::F64)
        .map_err(to_runtime_error)?
        .to_vec1::<f64>()
        .map_err(to_runtime_error)
}

#[derive(Debug, Clone, Copy)]
struct Entry {
    score: f64,
    order: usize,
}

/// Accumulates the most recent score of every example seen in an epoch.
#[derive(Debug, Default)]
pub struct DifficultyRanker {
    entries: HashMap<TrainingExample, Entry>,
}

impl DifficultyRanker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Later scores overwrite earlier ones; ordering keeps first insertion.
    pub fn record(&mut self, example: TrainingExample, score: f64) {
        let order = self.entries.len();
        self.entries
            .entry(example)
            .and_modify(|entry| entry.score = score)
            .or_insert(Entry { score, order });
    }

    pub fn record_batch(
        &mut self,
        examples: Vec<TrainingExample>,
        scores: &[f64],
    ) -> Result<(), TrainingError> {
        if examples.len() != scores.len() {
            return Err(TrainingError::ShapeMismatch {
                output: scores.len(),
                target: examples.len(),
            });
        }
        for (example, &score) in examples.into_iter().zip(scores) {
            self.record(example, score);
        }
        Ok(())
    }

    /// Hardest first. Ties keep insertion order.
    pub fn ranked(&self) -> Vec<(&TrainingExample, f64)> {
        let mut ranked: Vec<(&TrainingExample, Entry)> =
            self.entries.iter().map(|(ex, entry)| (ex, *entry)).collect();
        ranked.sort_by_key(|(_, entry)| entry.order);
        ranked.sort_by(|a, b| b.1.score.total_cmp(&a.1.score));
        ranked
            .into_iter()
            .map(|(ex, entry)| (ex, entry.score))
            .collect()
    }

    /// Consumes the epoch's scores and returns the top `boost_percent`
    /// fraction, exactly `floor(boost_percent * N)` examples.
    pub fn into_hard_pool(self, boost_percent: f64) -> Vec<TrainingExample> {
        let ranked = self.ranked();
        log_extremes(&ranked);

        let take = hard_pool_size(ranked.len(), boost_percent);
        ranked
            .into_iter()
            .take(take)
            .map(|(ex, _)| ex.clone())
            .collect()
    }
}

pub fn hard_pool_size(total: usize, boost_percent: f64) -> usize {
    let fraction = boost_percent.clamp(0.0, 1.0);
    ((fraction * total as f64).floor() as usize).min(total)
}

fn log_extremes(ranked: &[(&TrainingExample, f64)]) {
    if ranked.is_empty() {
        return;
    }
    info!("top {} hardest examples:", REPORTED_EXTREMES.min(ranked.len()));
    for (example, score) in ranked.iter().take(REPORTED_EXTREMES) {
        info!("  {:>10.3}  {}", score, render(example));
    }
    info!("top {} easiest examples:", REPORTED_EXTREMES.min(ranked.len()));
    for (example, score) in ranked.iter().rev().take(REPORTED_EXTREMES) {
        info!("  {:>10.3}  {}", score, render(example));
    }
}

fn render(example: &TrainingExample) -> String {
    format!(
        "{} => {}",
        example.source().join(" "),
        example.target().join(" ")
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn example(tag: usize) -> TrainingExample {
        TrainingExample::new(vec![format!("src{tag}")], vec![format!("tgt{tag}")])
    }

    #[test]
    fn hard_pool_takes_floor_of_fraction() {
        let mut ranker = DifficultyRanker::new();
        for i in 0..100 {
            ranker.record(example(i), i as f64);
        }
        let pool = ranker.into_hard_pool(0.1);
        assert_eq!(pool.len(), 10);
        let expected: Vec<_> = (90..100).rev().map(example).collect();
        assert_eq!(pool, expected);

        assert_eq!(hard_pool_size(7, 0.5), 3);
        assert_eq!(hard_pool_size(7, 0.0), 0);
        assert_eq!(hard_pool_size(7, 1.0), 7);
    }

    #[test]
    fn ties_keep_insertion_order() {
        let mut ranker = DifficultyRanker::new();
        ranker.record(example(3), 2.0);
        ranker.record(example(1), 5.0);
        ranker.record(example(2), 2.0);
        ranker.record(example(0), 2.0);

        let order: Vec<_> = ranker.ranked().into_iter().map(|(ex, _)| ex.clone()).collect();
        assert_eq!(order, vec![example(1), example(3), example(2), example(0)]);
    }

    #[test]
    fn duplicate_examples_keep_latest_score() {
        let mut ranker = DifficultyRanker::new();
        ranker.record(example(0), 9.0);
        ranker.record(example(1), 5.0);
        ranker.record(example(0), 1.0);

        assert_eq!(ranker.len(), 2);
        let ranked = ranker.ranked();
        assert_eq!(ranked[0], (&example(1), 5.0));
        assert_eq!(ranked[1], (&example(0), 1.0));
    }

    #[test]
    fn record_batch_requires_one_score_per_example() {
        let mut ranker = DifficultyRanker::new();
        assert!(ranker
            .record_batch(vec![example(0), example(1)], &[1.0])
            .is_err());
    }

    #[test]
    fn batch_scores_average_token_perplexity() {
        // Two examples, two positions each, uniform over four tokens except
        // the last position of the second example.
        let uniform = (0.25f32).ln();
        let mut rows = vec![uniform; 16];
        rows[12..16].copy_from_slice(&[0.5f32.ln(), 0.5f32.ln(), 1e-9f32.ln(), 1e-9f32.ln()]);
        let log_probs = Tensor::from_vec(rows, (4, 4), &Device::Cpu).unwrap();
        let targets = Tensor::new(&[0u32, 1, 2, 0], &Device::Cpu).unwrap();

        let scores = score_batch(&log_probs, &targets, 2, 2).unwrap();
        assert_eq!(scores.len(), 2);
        assert!((scores[0] - 4.0).abs() < 1e-4);
        assert!((scores[1] - 3.0).abs() < 1e-4);
    }

    #[test]
    fn batch_scoring_rejects_bad_geometry() {
        let log_probs = Tensor::zeros((3, 4), DType::F32, &Device::Cpu).unwrap();
        let targets = Tensor::new(&[0u32, 1, 2], &Device::Cpu).unwrap();
        assert!(score_batch(&log_probs, &targets, 2, 2).is_err());
        assert!(score_batch(&log_probs, &targets, 3, 0).is_err());
    }
}
