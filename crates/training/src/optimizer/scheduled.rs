use candle_core::backprop::GradStore;

use super::{AdamW, Optimizer, OptimizerState};
use crate::{
    scheduler::{LRScheduler, NoamSchedule},
    TrainingError,
};

/// AdamW whose learning rate is set from a Noam schedule before every update.
#[derive(Debug)]
pub struct ScheduledOptimizer {
    inner: AdamW,
    schedule: NoamSchedule,
}

impl ScheduledOptimizer {
    pub fn new(mut inner: AdamW, schedule: NoamSchedule) -> Self {
        inner.set_learning_rate(schedule.learning_rate());
        Self { inner, schedule }
    }

    pub fn schedule(&self) -> &NoamSchedule {
        &self.schedule
    }
}

impl Optimizer for ScheduledOptimizer {
    fn step(&mut self, grads: &mut GradStore) -> Result<(), TrainingError> {
        let lr = self.schedule.step();
        self.inner.set_learning_rate(lr);
        self.inner.step(grads)
    }

    fn learning_rate(&self) -> f64 {
        self.inner.learning_rate()
    }

    /// Rescales the schedule so its current rate becomes `lr`.
    fn set_learning_rate(&mut self, lr: f64) {
        let current = self.schedule.learning_rate();
        if current > 0.0 {
            let factor = self.schedule.factor() * lr / current;
            self.schedule.set_factor(factor);
        }
        self.inner.set_learning_rate(lr);
    }

    fn lr_scale(&self) -> Option<f64> {
        Some(self.schedule.learning_rate())
    }

    fn kind(&self) -> &'static str {
        "noam_adamw"
    }

    fn state(&self) -> Result<OptimizerState, TrainingError> {
        let mut state = self.inner.export_state(self.kind());
        state.schedule_factor = Some(self.schedule.factor());
        state.schedule_step = Some(self.schedule.step_count());
        Ok(state)
    }

    fn load_state(&mut self, state: OptimizerState) -> Result<(), TrainingError> {
        if state.kind != self.kind() {
            return Err(TrainingError::checkpoint(format!(
                "optimizer state was saved by '{}' but the configured optimizer is '{}'",
                state.kind,
                self.kind()
            )));
        }
        let factor = state.schedule_factor.ok_or_else(|| {
            TrainingError::checkpoint("scheduled optimizer state is missing its schedule factor")
        })?;
        // Older checkpoints stored a single shared counter.
        let schedule_step = state.schedule_step.unwrap_or(state.step);
        self.inner.import_state(state)?;
        self.schedule.restore(schedule_step, factor);
        self.inner.set_learning_rate(self.schedule.learning_rate());
        Ok(())
    }
}
