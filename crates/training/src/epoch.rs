use indicatif::{ProgressBar, ProgressStyle};
use nmt_model::Seq2SeqModel;
use tracing::debug;

use crate::{
    checkpoint::EpochState,
    config::to_runtime_error,
    data::{Batch, TrainingExample, Vocab},
    logging::MetricsSink,
    loss::NllLoss,
    metrics::{ExponentialMovingAverage, LossAccumulator, LossSummary},
    optimizer::Optimizer,
    ranker::DifficultyRanker,
    step::{BatchStepExecutor, StepMode},
    TrainingError,
};

#[derive(Debug, Clone)]
pub struct EpochOutcome {
    pub summary: LossSummary,
    /// Hardest examples of the epoch, present when ranking was requested.
    pub hard_pool: Option<Vec<TrainingExample>>,
}

/// Drives one pass over a batch stream in training or validation mode.
pub struct EpochDriver<'a> {
    executor: BatchStepExecutor<'a>,
    vocab: &'a Vocab,
    progress: bool,
}

impl<'a> EpochDriver<'a> {
    pub fn new(
        model: &'a dyn Seq2SeqModel,
        criterion: &'a NllLoss,
        vocab: &'a Vocab,
        progress: bool,
    ) -> Self {
        Self {
            executor: BatchStepExecutor::new(model, criterion, vocab.pad_id()),
            vocab,
            progress,
        }
    }

    /// Trains on every batch of `batches`. With `boost_percent` set, each
    /// example is scored and the hardest fraction is returned.
    pub fn train<I>(
        &self,
        batches: I,
        optimizer: &mut dyn Optimizer,
        state: &mut EpochState,
        sink: &mut dyn MetricsSink,
        boost_percent: Option<f64>,
    ) -> Result<EpochOutcome, TrainingError>
    where
        I: ExactSizeIterator<Item = Result<Batch, TrainingError>>,
    {
        let bar = self.progress_bar(batches.len(), "train");
        let mut accumulator = LossAccumulator::default();
        let mut smoothed = ExponentialMovingAverage::new(0.1);
        let mut ranker = boost_percent.map(|_| DifficultyRanker::new());

        for batch in batches {
            let batch = batch?;
            let mode = StepMode::Train {
                optimizer: &mut *optimizer,
                state: &mut *state,
            };
            let output = self.executor.execute(&batch, mode, ranker.is_some())?;
            accumulator.update(output.loss, output.tokens);

            if let (Some(ranker), Some(scores)) = (ranker.as_mut(), output.scores.as_ref()) {
                let keys = self.ranker_keys(&batch)?;
                ranker.record_batch(keys, scores)?;
            }

            let step = state.iterations;
            if output.tokens > 0 {
                let per_word = output.loss / output.tokens as f64;
                sink.add_scalar("train/loss_per_iteration", per_word, step);
                sink.add_scalar("train/perplexity_per_iteration", per_word.exp(), step);
                bar.set_message(format!("loss {:.4}", smoothed.update(per_word)));
            }
            if let Some(lr) = optimizer.lr_scale() {
                sink.add_scalar("train/lr", lr, step);
            }
            bar.inc(1);
        }
        bar.finish_and_clear();

        let summary = accumulator.finalize("training data")?;
        let hard_pool = match (ranker, boost_percent) {
            (Some(ranker), Some(percent)) => {
                debug!("ranked {} distinct training examples", ranker.len());
                Some(ranker.into_hard_pool(percent))
            }
            _ => None,
        };
        Ok(EpochOutcome { summary, hard_pool })
    }

    /// Scores every batch without touching parameters or optimizer state.
    pub fn validate<I>(&self, batches: I) -> Result<LossSummary, TrainingError>
    where
        I: ExactSizeIterator<Item = Result<Batch, TrainingError>>,
    {
        let bar = self.progress_bar(batches.len(), "valid");
        let mut accumulator = LossAccumulator::default();
        for batch in batches {
            let batch = batch?;
            let output = self.executor.execute(&batch, StepMode::Eval, false)?;
            accumulator.update(output.loss, output.tokens);
            bar.inc(1);
        }
        bar.finish_and_clear();
        accumulator.finalize("validation data")
    }

    /// Rebuilds each row's example from its ids.
    fn ranker_keys(&self, batch: &Batch) -> Result<Vec<TrainingExample>, TrainingError> {
        let sources = batch.src.to_vec2::<u32>().map_err(to_runtime_error)?;
        let targets = batch.tgt.to_vec2::<u32>().map_err(to_runtime_error)?;
        Ok(sources
            .iter()
            .zip(&targets)
            .map(|(src, tgt)| {
                TrainingExample::new(
                    self.vocab.reverse_tokenize(src),
                    self.vocab.reverse_tokenize(tgt),
                )
            })
            .collect())
    }

    fn progress_bar(&self, len: usize, prefix: &'static str) -> ProgressBar {
        if !self.progress {
            return ProgressBar::hidden();
        }
        let bar = ProgressBar::new(len as u64);
        if let Ok(style) = ProgressStyle::default_bar()
            .template("{prefix} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}")
        {
            bar.set_style(style.progress_chars("#>-"));
        }
        bar.set_prefix(prefix);
        bar
    }
}
