use std::collections::VecDeque;

use tracing::info;

use crate::{
    config::{BoostGrowth, BoostingConfig},
    data::{BucketIterator, TrainingExample},
};

/// Appends previously hard examples to the base training set.
#[derive(Debug, Clone)]
pub struct BoostedDatasetBuilder {
    warmup_epochs: usize,
    growth: BoostGrowth,
    max_boosted: Option<usize>,
    boosted: VecDeque<TrainingExample>,
}

impl BoostedDatasetBuilder {
    pub fn new(warmup_epochs: usize, growth: BoostGrowth, max_boosted: Option<usize>) -> Self {
        Self {
            warmup_epochs,
            growth,
            max_boosted,
            boosted: VecDeque::new(),
        }
    }

    pub fn from_config(config: &BoostingConfig) -> Self {
        Self::new(
            config.warmup_epochs,
            config.growth,
            config.max_boosted_examples,
        )
    }

    /// Whether the 0-based `epoch` trains on a boosted set: the first
    /// `warmup_epochs` epochs never do.
    pub fn is_active(&self, epoch: usize) -> bool {
        epoch >= self.warmup_epochs
    }

    pub fn boosted_len(&self) -> usize {
        self.boosted.len()
    }

    /// Folds in the latest hard pool and returns the base stream extended
    /// with every retained boosted example, re-batched under the same policy.
    pub fn build(&mut self, base: &BucketIterator, hard_pool: Vec<TrainingExample>) -> BucketIterator {
        if self.growth == BoostGrowth::ResetEachEpoch {
            self.boosted.clear();
        }
        self.boosted.extend(hard_pool);
        if let Some(cap) = self.max_boosted {
            while self.boosted.len() > cap {
                self.boosted.pop_front();
            }
        }

        let mut boosted = base.with_examples(base.examples().to_vec());
        boosted.extend(self.boosted.iter().cloned());
        info!(
            "boosted training set: {} base + {} hard examples",
            base.len(),
            self.boosted.len()
        );
        boosted
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use candle_core::Device;

    use super::*;
    use crate::data::Vocab;

    fn example(tag: usize) -> TrainingExample {
        TrainingExample::new(vec![format!("s{tag}")], vec![format!("t{tag}")])
    }

    fn base(n: usize) -> BucketIterator {
        let examples: Vec<_> = (0..n).map(example).collect();
        let vocab = Arc::new(Vocab::from_tokens(Vec::<String>::new()));
        BucketIterator::new(examples, vocab, Device::Cpu, 64, true, 0).unwrap()
    }

    #[test]
    fn warmup_delays_first_boost() {
        let builder = BoostedDatasetBuilder::new(2, BoostGrowth::Accumulate, None);
        let active: Vec<bool> = (0..4).map(|epoch| builder.is_active(epoch)).collect();
        // Epochs 1 and 2 train on the base set, epoch 3 is the first boosted one.
        assert_eq!(active, vec![false, false, true, true]);
    }

    #[test]
    fn accumulate_keeps_every_pool() {
        let base = base(10);
        let mut builder = BoostedDatasetBuilder::new(0, BoostGrowth::Accumulate, None);
        let first = builder.build(&base, vec![example(1)]);
        assert_eq!(first.len(), 11);
        let second = builder.build(&base, vec![example(2), example(3)]);
        assert_eq!(second.len(), 13);
        assert_eq!(base.len(), 10);
        assert_eq!(&second.examples()[10..], &[example(1), example(2), example(3)]);
    }

    #[test]
    fn cap_evicts_oldest_boosted_examples() {
        let base = base(4);
        let mut builder = BoostedDatasetBuilder::new(0, BoostGrowth::Accumulate, Some(2));
        builder.build(&base, vec![example(1), example(2)]);
        let boosted = builder.build(&base, vec![example(3)]);
        assert_eq!(builder.boosted_len(), 2);
        assert_eq!(&boosted.examples()[4..], &[example(2), example(3)]);
    }

    #[test]
    fn reset_keeps_only_latest_pool() {
        let base = base(4);
        let mut builder = BoostedDatasetBuilder::new(0, BoostGrowth::ResetEachEpoch, None);
        builder.build(&base, vec![example(1), example(2)]);
        let boosted = builder.build(&base, vec![example(3)]);
        assert_eq!(&boosted.examples()[4..], &[example(3)]);
    }
}
