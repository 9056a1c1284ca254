use candle_core::{DType, Device, Error, Result};

/// Hyperparameters for the reference encoder-decoder model.
#[derive(Debug, Clone)]
pub struct ModelConfig {
    pub vocab_size: usize,
    pub hidden_dim: usize,
    pub dtype: DType,
    pub device: Device,
    pub dropout_p: Option<f32>,
}

impl ModelConfig {
    /// Validate structural invariants before any parameter is allocated.
    pub fn validate(&self) -> Result<()> {
        if self.vocab_size == 0 {
            return Err(Error::Msg("vocab_size must be greater than zero".into()));
        }
        if self.hidden_dim == 0 {
            return Err(Error::Msg("hidden_dim must be greater than zero".into()));
        }
        if !self.dtype.is_float() {
            return Err(Error::Msg(format!(
                "model parameters must use a floating dtype (got {:?})",
                self.dtype
            )));
        }
        if let Some(p) = self.dropout_p {
            if !(0.0..1.0).contains(&p) {
                return Err(Error::Msg("dropout_p must be in [0, 1)".into()));
            }
        }
        Ok(())
    }
}
