use std::sync::atomic::{AtomicBool, Ordering};

use candle_core::{DType, Device, Error, Module, Result, Tensor, Var, D};
use candle_nn::{ops, Embedding, Linear, VarBuilder, VarMap};

use crate::config::ModelConfig;

/// Tensors handed to a sequence-to-sequence forward pass.
///
/// `src` and `tgt` are `[batch, len]` token-id matrices; the masks come from
/// [`crate::masks`]. Lengths are the unpadded sizes of each row.
#[derive(Debug, Clone, Copy)]
pub struct Seq2SeqInputs<'a> {
    pub src: &'a Tensor,
    pub tgt: &'a Tensor,
    pub src_mask: &'a Tensor,
    pub tgt_mask: &'a Tensor,
    pub src_lengths: &'a [usize],
    pub tgt_lengths: &'a [usize],
}

/// Contract between the training loop and any encoder-decoder model.
///
/// `forward` returns log-probabilities shaped `[batch, tgt_len, vocab]` where
/// position `i` may only depend on target positions `0..=i`.
pub trait Seq2SeqModel {
    fn forward(&self, inputs: &Seq2SeqInputs<'_>) -> Result<Tensor>;

    /// Toggles dropout and other train-only behaviour.
    fn set_training(&self, training: bool);

    fn is_training(&self) -> bool;

    /// Trainable parameters keyed by a stable, unique name.
    fn parameters(&self) -> Vec<(String, Var)>;

    fn device(&self) -> &Device;
}

/// Compact encoder-decoder used as the default model.
///
/// The source is summarised by masked mean pooling, every target position by
/// a causal mean over its visible prefix; both are combined and projected to
/// the vocabulary.
pub struct PooledContextModel {
    config: ModelConfig,
    varmap: VarMap,
    embedding: Embedding,
    context_proj: Linear,
    generator: Linear,
    training: AtomicBool,
}

impl PooledContextModel {
    pub fn new(config: ModelConfig) -> Result<Self> {
        config.validate()?;

        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, config.dtype, &config.device);
        let embedding = candle_nn::embedding(config.vocab_size, config.hidden_dim, vb.pp("embedding"))?;
        let context_proj =
            candle_nn::linear(config.hidden_dim, config.hidden_dim, vb.pp("context_proj"))?;
        let generator = candle_nn::linear(config.hidden_dim, config.vocab_size, vb.pp("generator"))?;

        Ok(Self {
            config,
            varmap,
            embedding,
            context_proj,
            generator,
            training: AtomicBool::new(true),
        })
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }
}

impl Seq2SeqModel for PooledContextModel {
    fn forward(&self, inputs: &Seq2SeqInputs<'_>) -> Result<Tensor> {
        let (batch, src_len) = inputs.src.dims2()?;
        let (tgt_batch, tgt_len) = inputs.tgt.dims2()?;
        if batch != tgt_batch {
            return Err(Error::Msg(format!(
                "source batch {} does not match target batch {}",
                batch, tgt_batch
            )));
        }
        if inputs.src_mask.dims() != [batch, 1, src_len] {
            return Err(Error::Msg(format!(
                "source mask expected [{}, 1, {}] got {:?}",
                batch,
                src_len,
                inputs.src_mask.dims()
            )));
        }
        if inputs.tgt_mask.dims() != [batch, tgt_len, tgt_len] {
            return Err(Error::Msg(format!(
                "target mask expected [{}, {}, {}] got {:?}",
                batch,
                tgt_len,
                tgt_len,
                inputs.tgt_mask.dims()
            )));
        }

        let dtype = self.config.dtype;

        let src_emb = self.embedding.forward(inputs.src)?;
        let src_weights = row_normalized(inputs.src_mask, dtype)?;
        let context = src_weights.matmul(&src_emb)?;
        let context = self.context_proj.forward(&context)?.tanh()?;

        let tgt_emb = self.embedding.forward(inputs.tgt)?;
        let tgt_weights = row_normalized(inputs.tgt_mask, dtype)?;
        let prefix = tgt_weights.matmul(&tgt_emb)?;

        let mut hidden = prefix.broadcast_add(&context)?;
        if self.is_training() {
            if let Some(p) = self.config.dropout_p.filter(|p| *p > 0.0) {
                hidden = ops::dropout(&hidden, p)?;
            }
        }

        let logits = self.generator.forward(&hidden)?;
        ops::log_softmax(&logits, D::Minus1)
    }

    fn set_training(&self, training: bool) {
        self.training.store(training, Ordering::Relaxed);
    }

    fn is_training(&self) -> bool {
        self.training.load(Ordering::Relaxed)
    }

    fn parameters(&self) -> Vec<(String, Var)> {
        let data = match self.varmap.data().lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let mut named: Vec<(String, Var)> = data
            .iter()
            .map(|(name, var)| (name.clone(), var.clone()))
            .collect();
        named.sort_by(|a, b| a.0.cmp(&b.0));
        named
    }

    fn device(&self) -> &Device {
        &self.config.device
    }
}

/// Turns a 0/1 mask into averaging weights; all-zero rows stay zero.
fn row_normalized(mask: &Tensor, dtype: DType) -> Result<Tensor> {
    let weights = mask.to_dtype(dtype)?;
    let counts = weights.sum_keepdim(D::Minus1)?.maximum(1f64)?;
    weights.broadcast_div(&counts)
}
