use candle_core::{DType, Tensor};

use crate::{config::to_runtime_error, TrainingError};

/// Negative log-likelihood over log-probabilities, summed over non-padding
/// targets, with optional label smoothing.
#[derive(Debug, Clone)]
pub struct NllLoss {
    label_smoothing: f32,
    ignore_index: Option<u32>,
}

impl NllLoss {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_label_smoothing(mut self, smoothing: f32) -> Result<Self, TrainingError> {
        if !(0.0..1.0).contains(&smoothing) {
            return Err(TrainingError::initialization(
                "label smoothing must be in [0, 1)",
            ));
        }
        self.label_smoothing = smoothing;
        Ok(self)
    }

    pub fn with_ignore_index(mut self, ignore_index: Option<u32>) -> Self {
        self.ignore_index = ignore_index;
        self
    }

    /// `log_probs` is `[N, vocab]`, `targets` is `[N]`.
    pub fn compute(&self, log_probs: &Tensor, targets: &Tensor) -> Result<LossOutput, TrainingError> {
        let (rows, vocab_size) = log_probs.dims2().map_err(to_runtime_error)?;
        if vocab_size == 0 {
            return Err(TrainingError::runtime(
                "log-probability vocabulary dimension must be greater than zero",
            ));
        }
        if targets.dims() != [rows] {
            return Err(TrainingError::ShapeMismatch {
                output: rows,
                target: targets.elem_count(),
            });
        }

        let device = log_probs.device();
        if rows == 0 {
            let loss = Tensor::zeros((), log_probs.dtype(), device).map_err(to_runtime_error)?;
            return Ok(LossOutput {
                loss,
                total: 0.0,
                tokens: 0,
            });
        }

        let targets = as_u32(targets)?;
        let valid_mask = match self.ignore_index {
            Some(ignore_index) => targets
                .ne(ignore_index)
                .map_err(to_runtime_error)?
                .to_dtype(log_probs.dtype())
                .map_err(to_runtime_error)?,
            None => Tensor::ones(rows, log_probs.dtype(), device).map_err(to_runtime_error)?,
        };
        let tokens = valid_mask
            .sum_all()
            .map_err(to_runtime_error)?
            .to_dtype(DType::F64)
            .map_err(to_runtime_error)?
            .to_scalar::<f64>()
            .map_err(to_runtime_error)?
            .round() as usize;

        let nll = token_nll(log_probs, &targets)?;
        let per_token = if self.label_smoothing > 0.0 {
            let smoothing = self.label_smoothing as f64;
            let uniform = log_probs
                .mean(1)
                .map_err(to_runtime_error)?
                .neg()
                .map_err(to_runtime_error)?;
            let smoothed = nll.affine(1.0 - smoothing, 0.0).map_err(to_runtime_error)?;
            let uniform_term = uniform.affine(smoothing, 0.0).map_err(to_runtime_error)?;
            (smoothed + uniform_term).map_err(to_runtime_error)?
        } else {
            nll
        };

        let loss = (&per_token * &valid_mask)
            .map_err(to_runtime_error)?
            .sum_all()
            .map_err(to_runtime_error)?;
        let total = loss
            .to_dtype(DType::F64)
            .map_err(to_runtime_error)?
            .to_scalar::<f64>()
            .map_err(to_runtime_error)?;

        Ok(LossOutput {
            loss,
            total,
            tokens,
        })
    }
}

impl Default for NllLoss {
    fn default() -> Self {
        Self {
            label_smoothing: 0.0,
            ignore_index: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct LossOutput {
    /// Scalar summed loss, still attached to the autograd graph.
    pub loss: Tensor,
    pub total: f64,
    /// Targets that contributed to `loss`.
    pub tokens: usize,
}

impl LossOutput {
    pub fn per_token(&self) -> Option<f64> {
        (self.tokens > 0).then(|| self.total / self.tokens as f64)
    }
}

/// Unreduced negative log-likelihood of each target, shaped `[N]`.
pub fn token_nll(log_probs: &Tensor, targets: &Tensor) -> Result<Tensor, TrainingError> {
    let targets = as_u32(targets)?;
    log_probs
        .gather(&targets.unsqueeze(1).map_err(to_runtime_error)?, 1)
        .map_err(to_runtime_error)?
        .squeeze(1)
        .map_err(to_runtime_error)?
        .neg()
        .map_err(to_runtime_error)
}

fn as_u32(targets: &Tensor) -> Result<Tensor, TrainingError> {
    match targets.dtype() {
        DType::U32 => Ok(targets.clone()),
        DType::I64 | DType::U8 => targets.to_dtype(DType::U32).map_err(to_runtime_error),
        dtype => Err(TrainingError::runtime(format!(
            "unsupported target dtype {:?}",
            dtype
        ))),
    }
}
