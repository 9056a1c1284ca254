//! Parameter update rules used by the training loop.

use candle_core::{backprop::GradStore, Tensor, Var};

use crate::{
    config::{self, LearningRateSchedule},
    scheduler::NoamSchedule,
    TrainingError,
};

mod adamw;
mod scheduled;

pub use adamw::{AdamW, AdamWConfig};
pub use scheduled::ScheduledOptimizer;

/// Update rule driven by the batch step executor.
pub trait Optimizer {
    /// Applies one update from `grads`, consuming the gradients it uses.
    fn step(&mut self, grads: &mut GradStore) -> Result<(), TrainingError>;

    fn learning_rate(&self) -> f64;

    fn set_learning_rate(&mut self, lr: f64);

    /// Current value of a per-iteration schedule, when the optimizer has one.
    fn lr_scale(&self) -> Option<f64> {
        None
    }

    /// Stable label stored alongside checkpointed state.
    fn kind(&self) -> &'static str;

    fn state(&self) -> Result<OptimizerState, TrainingError>;

    /// Restores `state`; on error the optimizer is left untouched.
    fn load_state(&mut self, state: OptimizerState) -> Result<(), TrainingError>;
}

#[derive(Debug, Clone)]
pub struct OptimizerState {
    pub kind: String,
    pub step: usize,
    pub learning_rate: f64,
    /// Multiplier of a per-iteration schedule, if any.
    pub schedule_factor: Option<f64>,
    /// Position of that schedule; tracked apart from `step`, which drives
    /// bias correction.
    pub schedule_step: Option<usize>,
    pub parameters: Vec<ParameterState>,
}

#[derive(Debug, Clone)]
pub struct ParameterState {
    pub name: String,
    pub first_moment: Tensor,
    pub second_moment: Tensor,
}

/// Builds the optimizer selected by `config` over `parameters`.
///
/// `model_size` feeds the Noam schedule when it does not set its own.
pub fn build_optimizer(
    config: &config::OptimizerConfig,
    parameters: Vec<(String, Var)>,
    model_size: usize,
) -> Result<Box<dyn Optimizer>, TrainingError> {
    let adam = AdamWConfig::from(config);
    let max_grad_norm = config.max_grad_norm.map(f64::from);
    match config.schedule {
        LearningRateSchedule::Constant => {
            Ok(Box::new(AdamW::new(parameters, adam, max_grad_norm)?))
        }
        LearningRateSchedule::Noam => {
            let schedule = NoamSchedule::new(
                config.noam.factor,
                config.noam.model_size.unwrap_or(model_size),
                config.noam.warmup_steps,
            )?;
            let inner = AdamW::new(parameters, adam, max_grad_norm)?;
            Ok(Box::new(ScheduledOptimizer::new(inner, schedule)))
        }
    }
}
