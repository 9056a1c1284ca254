use std::time::{Duration, Instant};

use crate::TrainingError;

#[derive(Debug, Clone)]
pub struct ExponentialMovingAverage {
    alpha: f64,
    value: Option<f64>,
}

impl ExponentialMovingAverage {
    pub fn new(alpha: f64) -> Self {
        Self { alpha, value: None }
    }

    pub fn update(&mut self, sample: f64) -> f64 {
        let v = match self.value {
            Some(prev) => self.alpha * sample + (1.0 - self.alpha) * prev,
            None => sample,
        };
        self.value = Some(v);
        v
    }

    pub fn value(&self) -> Option<f64> {
        self.value
    }
}

/// Running sums of summed batch losses and non-padding target tokens.
#[derive(Debug, Default, Clone)]
pub struct LossAccumulator {
    total_loss: f64,
    tokens: u64,
    batches: usize,
}

impl LossAccumulator {
    pub fn update(&mut self, batch_loss: f64, tokens: usize) {
        self.total_loss += batch_loss;
        self.tokens += tokens as u64;
        self.batches += 1;
    }

    pub fn total_loss(&self) -> f64 {
        self.total_loss
    }

    pub fn tokens(&self) -> u64 {
        self.tokens
    }

    pub fn batches(&self) -> usize {
        self.batches
    }

    /// Loss per word; `what` names the stream in the empty-dataset error.
    pub fn finalize(self, what: &str) -> Result<LossSummary, TrainingError> {
        if self.tokens == 0 {
            return Err(TrainingError::EmptyDataset(what.to_string()));
        }
        let loss_per_word = self.total_loss / self.tokens as f64;
        Ok(LossSummary {
            loss_per_word,
            perplexity: loss_per_word.exp(),
            total_loss: self.total_loss,
            tokens: self.tokens,
            batches: self.batches,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LossSummary {
    pub loss_per_word: f64,
    pub perplexity: f64,
    pub total_loss: f64,
    pub tokens: u64,
    pub batches: usize,
}

#[derive(Debug)]
pub struct EpochTimer {
    start: Instant,
}

impl EpochTimer {
    pub fn start() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}

/// Whole minutes and leftover seconds of `elapsed`.
pub fn minutes_seconds(elapsed: Duration) -> (u64, u64) {
    let secs = elapsed.as_secs();
    (secs / 60, secs % 60)
}
