use nmt_model::{build_source_mask, build_target_mask, Seq2SeqInputs, Seq2SeqModel};

use crate::{
    checkpoint::EpochState, config::to_runtime_error, data::Batch, loss::NllLoss,
    optimizer::Optimizer, ranker, TrainingError,
};

/// What a step is allowed to mutate.
pub enum StepMode<'o> {
    Train {
        optimizer: &'o mut dyn Optimizer,
        state: &'o mut EpochState,
    },
    Eval,
}

impl StepMode<'_> {
    pub fn is_train(&self) -> bool {
        matches!(self, StepMode::Train { .. })
    }
}

#[derive(Debug, Clone)]
pub struct StepOutput {
    /// Summed loss over the batch's non-padding target tokens.
    pub loss: f64,
    pub tokens: usize,
    /// Difficulty score per example, in batch row order, when requested.
    pub scores: Option<Vec<f64>>,
}

/// Runs one batch through the model under teacher forcing.
///
/// The model sees `tgt[:, :-1]` and its predictions are scored against
/// `tgt[:, 1:]`.
pub struct BatchStepExecutor<'a> {
    model: &'a dyn Seq2SeqModel,
    criterion: &'a NllLoss,
    pad_id: u32,
}

impl<'a> BatchStepExecutor<'a> {
    pub fn new(model: &'a dyn Seq2SeqModel, criterion: &'a NllLoss, pad_id: u32) -> Self {
        Self {
            model,
            criterion,
            pad_id,
        }
    }

    pub fn execute(
        &self,
        batch: &Batch,
        mode: StepMode<'_>,
        score_examples: bool,
    ) -> Result<StepOutput, TrainingError> {
        let (batch_size, tgt_len) = batch.tgt.dims2().map_err(to_runtime_error)?;
        if tgt_len < 2 {
            return Err(TrainingError::runtime(format!(
                "target sequences need at least two positions, got {tgt_len}"
            )));
        }
        let train = mode.is_train();
        self.model.set_training(train);

        let tgt_input = batch.tgt.narrow(1, 0, tgt_len - 1).map_err(to_runtime_error)?;
        let tgt_output = batch.tgt.narrow(1, 1, tgt_len - 1).map_err(to_runtime_error)?;
        let input_lengths: Vec<usize> = batch
            .tgt_lengths
            .iter()
            .map(|len| len.saturating_sub(1))
            .collect();

        let src_mask = build_source_mask(&batch.src, self.pad_id).map_err(to_runtime_error)?;
        let tgt_mask = build_target_mask(&tgt_input, self.pad_id).map_err(to_runtime_error)?;
        let inputs = Seq2SeqInputs {
            src: &batch.src,
            tgt: &tgt_input,
            src_mask: &src_mask,
            tgt_mask: &tgt_mask,
            src_lengths: &batch.src_lengths,
            tgt_lengths: &input_lengths,
        };

        let output = self.model.forward(&inputs).map_err(to_runtime_error)?;
        let output = if train {
            output
        } else {
            output.detach()
        };
        let vocab_size = *output.dims().last().unwrap_or(&0);
        let positions = if vocab_size == 0 {
            0
        } else {
            output.elem_count() / vocab_size
        };
        let targets = tgt_output.flatten_all().map_err(to_runtime_error)?;
        if positions != targets.elem_count() {
            return Err(TrainingError::ShapeMismatch {
                output: positions,
                target: targets.elem_count(),
            });
        }
        let log_probs = output
            .reshape((positions, vocab_size))
            .map_err(to_runtime_error)?;

        let scores = if score_examples {
            let detached = log_probs.detach();
            Some(ranker::score_batch(
                &detached,
                &targets,
                batch_size,
                tgt_len - 1,
            )?)
        } else {
            None
        };

        let loss = self.criterion.compute(&log_probs, &targets)?;

        if let StepMode::Train { optimizer, state } = mode {
            let mut grads = loss.loss.backward().map_err(to_runtime_error)?;
            optimizer.step(&mut grads)?;
            state.iterations += 1;
        }

        Ok(StepOutput {
            loss: loss.total,
            tokens: loss.tokens,
            scores,
        })
    }
}
