//! Greedy decoding and the periodic sample-translation hook.

use candle_core::{Device, Tensor};
use nmt_model::{build_source_mask, build_target_mask, Seq2SeqInputs, Seq2SeqModel};
use tracing::info;

use crate::{
    config::{to_runtime_error, DecodeConfig},
    data::{BucketIterator, Vocab},
    logging::MetricsSink,
    TrainingError,
};

pub const TRANSLATION_TAG: &str = "transformer/translation";

/// Arg-max decoding from `<s>` until `</s>` or `max_len` generated tokens.
#[derive(Debug, Clone, Copy)]
pub struct GreedyDecoder {
    max_len: usize,
}

impl GreedyDecoder {
    pub fn new(max_len: usize) -> Self {
        Self { max_len }
    }

    /// Decodes one source row, given as `[1, src_len]` ids.
    pub fn decode(
        &self,
        model: &dyn Seq2SeqModel,
        vocab: &Vocab,
        src: &Tensor,
    ) -> Result<Vec<String>, TrainingError> {
        let (rows, src_len) = src.dims2().map_err(to_runtime_error)?;
        if rows != 1 {
            return Err(TrainingError::runtime(format!(
                "greedy decoding expects a single source row, got {rows}"
            )));
        }
        model.set_training(false);
        let device = model.device();
        let src_mask = build_source_mask(src, vocab.pad_id()).map_err(to_runtime_error)?;
        let src_lengths = [src_len];

        let mut ys = vec![vocab.bos_id()];
        for _ in 0..self.max_len {
            let next = self.next_token(model, vocab, device, src, &src_mask, &src_lengths, &ys)?;
            ys.push(next);
            if next == vocab.eos_id() {
                break;
            }
        }
        Ok(vocab.reverse_tokenize(&ys))
    }

    #[allow(clippy::too_many_arguments)]
    fn next_token(
        &self,
        model: &dyn Seq2SeqModel,
        vocab: &Vocab,
        device: &Device,
        src: &Tensor,
        src_mask: &Tensor,
        src_lengths: &[usize],
        prefix: &[u32],
    ) -> Result<u32, TrainingError> {
        let tgt = Tensor::new(prefix, device)
            .and_then(|t| t.unsqueeze(0))
            .map_err(to_runtime_error)?;
        let tgt_mask = build_target_mask(&tgt, vocab.pad_id()).map_err(to_runtime_error)?;
        let tgt_lengths = [prefix.len()];
        let inputs = Seq2SeqInputs {
            src,
            tgt: &tgt,
            src_mask,
            tgt_mask: &tgt_mask,
            src_lengths,
            tgt_lengths: &tgt_lengths,
        };
        model
            .forward(&inputs)
            .and_then(|out| out.detach().get(0))
            .and_then(|out| out.get(prefix.len() - 1))
            .and_then(|last| last.argmax(0))
            .and_then(|id| id.to_scalar::<u32>())
            .map_err(to_runtime_error)
    }
}

/// What a post-epoch hook may read and emit.
pub struct EpochContext<'a> {
    /// 0-based index of the epoch that just finished.
    pub epoch: usize,
    pub model: &'a dyn Seq2SeqModel,
    pub vocab: &'a Vocab,
    pub validation: &'a BucketIterator,
    pub sink: &'a mut dyn MetricsSink,
}

/// Runs after validation; errors and panics are logged, never fatal.
pub trait EpochHook {
    fn name(&self) -> &str;

    fn after_epoch(&mut self, ctx: &mut EpochContext<'_>) -> Result<(), TrainingError>;
}

/// Every `every_n_epochs` epochs, greedily translates the first sentence of
/// the first `num_translations` validation batches.
#[derive(Debug, Clone)]
pub struct SampleTranslationHook {
    every_n_epochs: usize,
    num_translations: usize,
    decoder: GreedyDecoder,
}

impl SampleTranslationHook {
    pub fn new(every_n_epochs: usize, num_translations: usize, max_len: usize) -> Self {
        Self {
            every_n_epochs: every_n_epochs.max(1),
            num_translations,
            decoder: GreedyDecoder::new(max_len),
        }
    }

    pub fn from_config(config: &DecodeConfig) -> Self {
        Self::new(config.every_n_epochs, config.num_translations, config.max_len)
    }

    pub fn is_due(&self, epoch: usize) -> bool {
        (epoch + 1) % self.every_n_epochs == 0
    }

    pub fn translate(
        &self,
        model: &dyn Seq2SeqModel,
        vocab: &Vocab,
        validation: &BucketIterator,
    ) -> Result<Vec<String>, TrainingError> {
        let mut translations = Vec::with_capacity(self.num_translations);
        for batch in validation.batches(0).take(self.num_translations) {
            let batch = batch?;
            let len = batch.src_lengths.first().copied().unwrap_or(0);
            let src = batch
                .src
                .narrow(0, 0, 1)
                .and_then(|row| row.narrow(1, 0, len))
                .map_err(to_runtime_error)?;
            let words = self.decoder.decode(model, vocab, &src)?;
            translations.push(words.join(" "));
        }
        Ok(translations)
    }
}

impl EpochHook for SampleTranslationHook {
    fn name(&self) -> &str {
        "sample-translation"
    }

    fn after_epoch(&mut self, ctx: &mut EpochContext<'_>) -> Result<(), TrainingError> {
        if !self.is_due(ctx.epoch) {
            return Ok(());
        }
        info!("performing greedy decoding");
        let translations = self.translate(ctx.model, ctx.vocab, ctx.validation)?;
        for translation in &translations {
            ctx.sink.add_text(TRANSLATION_TAG, translation, ctx.epoch);
        }
        Ok(())
    }
}
