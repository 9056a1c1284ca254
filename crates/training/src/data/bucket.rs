use std::{mem, sync::Arc};

use candle_core::Device;
use rand::{rngs::StdRng, seq::SliceRandom, SeedableRng};

use super::{Batch, Result, TrainingExample, Vocab};
use crate::TrainingError;

/// Examples per shuffling pool, as a multiple of the token budget.
const POOL_MULTIPLIER: usize = 100;

/// Length-bucketing batch stream with a token budget per batch.
///
/// Training streams shuffle once per epoch, sort each pool of examples by
/// length, cut it into batches and shuffle the batches. Validation streams
/// sort the whole collection and never shuffle.
#[derive(Debug, Clone)]
pub struct BucketIterator {
    examples: Vec<TrainingExample>,
    vocab: Arc<Vocab>,
    device: Device,
    batch_tokens: usize,
    train: bool,
    seed: u64,
}

impl BucketIterator {
    pub fn new(
        examples: Vec<TrainingExample>,
        vocab: Arc<Vocab>,
        device: Device,
        batch_tokens: usize,
        train: bool,
        seed: u64,
    ) -> Result<Self> {
        if batch_tokens == 0 {
            return Err(TrainingError::initialization(
                "batch_tokens must be greater than zero",
            ));
        }
        Ok(Self {
            examples,
            vocab,
            device,
            batch_tokens,
            train,
            seed,
        })
    }

    pub fn examples(&self) -> &[TrainingExample] {
        &self.examples
    }

    pub fn len(&self) -> usize {
        self.examples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.examples.is_empty()
    }

    pub fn vocab(&self) -> &Arc<Vocab> {
        &self.vocab
    }

    /// Appends to the underlying collection; the next epoch re-batches it.
    pub fn extend<I>(&mut self, examples: I)
    where
        I: IntoIterator<Item = TrainingExample>,
    {
        self.examples.extend(examples);
    }

    /// Same batching policy over a different collection.
    pub fn with_examples(&self, examples: Vec<TrainingExample>) -> Self {
        Self {
            examples,
            vocab: Arc::clone(&self.vocab),
            device: self.device.clone(),
            batch_tokens: self.batch_tokens,
            train: self.train,
            seed: self.seed,
        }
    }

    /// Example indices of every batch for `epoch`, in iteration order.
    pub fn plan(&self, epoch: usize) -> Vec<Vec<usize>> {
        let mut batches = if self.train {
            self.plan_shuffled(epoch)
        } else {
            let mut order: Vec<usize> = (0..self.examples.len()).collect();
            order.sort_by_key(|&idx| self.sort_key(idx));
            chunk_by_budget(&order, &self.examples, self.batch_tokens)
        };

        for batch in &mut batches {
            batch.sort_by(|a, b| self.sort_key(*b).cmp(&self.sort_key(*a)));
        }
        batches
    }

    fn plan_shuffled(&self, epoch: usize) -> Vec<Vec<usize>> {
        let mut rng = StdRng::seed_from_u64(self.seed.wrapping_add(epoch as u64));
        let mut order: Vec<usize> = (0..self.examples.len()).collect();
        order.shuffle(&mut rng);

        let pool_size = self.batch_tokens.saturating_mul(POOL_MULTIPLIER);
        let mut batches = Vec::new();
        for pool in order.chunks(pool_size) {
            let mut pool = pool.to_vec();
            pool.sort_by_key(|&idx| self.sort_key(idx));
            let mut pool_batches = chunk_by_budget(&pool, &self.examples, self.batch_tokens);
            pool_batches.shuffle(&mut rng);
            batches.extend(pool_batches);
        }
        batches
    }

    fn sort_key(&self, idx: usize) -> (usize, usize) {
        let example = &self.examples[idx];
        (example.source().len(), example.target().len())
    }

    pub fn batches(&self, epoch: usize) -> EpochBatches<'_> {
        EpochBatches {
            source: self,
            plan: self.plan(epoch).into_iter(),
        }
    }
}

/// Lazily materialises the batches of one epoch.
pub struct EpochBatches<'a> {
    source: &'a BucketIterator,
    plan: std::vec::IntoIter<Vec<usize>>,
}

impl Iterator for EpochBatches<'_> {
    type Item = Result<Batch>;

    fn next(&mut self) -> Option<Self::Item> {
        let indices = self.plan.next()?;
        let examples = indices
            .iter()
            .map(|&idx| self.source.examples[idx].clone())
            .collect();
        Some(Batch::from_examples(
            examples,
            &self.source.vocab,
            &self.source.device,
        ))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.plan.size_hint()
    }
}

impl ExactSizeIterator for EpochBatches<'_> {}

/// Running maxima behind the token-budget batch cost.
#[derive(Debug, Default)]
struct TokenBudget {
    max_src: usize,
    max_tgt: usize,
}

impl TokenBudget {
    /// Cost of a batch of `count` examples whose newest member is `example`.
    fn admit(&mut self, example: &TrainingExample, count: usize) -> usize {
        if count == 1 {
            self.max_src = 0;
            self.max_tgt = 0;
        }
        self.max_src = self.max_src.max(example.source().len());
        // Target side carries <s> and </s>.
        self.max_tgt = self.max_tgt.max(example.target().len() + 2);
        count * self.max_src.max(self.max_tgt)
    }
}

fn chunk_by_budget(
    order: &[usize],
    examples: &[TrainingExample],
    budget: usize,
) -> Vec<Vec<usize>> {
    let mut batches = Vec::new();
    let mut current: Vec<usize> = Vec::new();
    let mut tracker = TokenBudget::default();

    for &idx in order {
        current.push(idx);
        let cost = tracker.admit(&examples[idx], current.len());
        if cost == budget {
            batches.push(mem::take(&mut current));
        } else if cost > budget {
            current.pop();
            if !current.is_empty() {
                batches.push(mem::take(&mut current));
            }
            current.push(idx);
            tracker.admit(&examples[idx], 1);
        }
    }
    if !current.is_empty() {
        batches.push(current);
    }
    batches
}
