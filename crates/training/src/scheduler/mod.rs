use crate::{config::PlateauConfig, TrainingError};

/// Per-iteration learning-rate schedule.
pub trait LRScheduler: Send {
    /// Advances one iteration and returns the rate to use for it.
    fn step(&mut self) -> f64;
    fn learning_rate(&self) -> f64;
}

/// Inverse square-root schedule with linear warmup:
/// `factor * d_model^-0.5 * min(step^-0.5, step * warmup^-1.5)`.
#[derive(Debug, Clone)]
pub struct NoamSchedule {
    factor: f64,
    model_size: usize,
    warmup_steps: usize,
    step: usize,
    current_lr: f64,
}

impl NoamSchedule {
    pub fn new(factor: f64, model_size: usize, warmup_steps: usize) -> Result<Self, TrainingError> {
        if factor <= 0.0 {
            return Err(TrainingError::initialization(
                "noam schedule requires factor > 0",
            ));
        }
        if model_size == 0 || warmup_steps == 0 {
            return Err(TrainingError::initialization(
                "noam schedule requires model_size and warmup_steps greater than zero",
            ));
        }
        Ok(Self {
            factor,
            model_size,
            warmup_steps,
            step: 0,
            current_lr: 0.0,
        })
    }

    pub fn rate(&self, step: usize) -> f64 {
        if step == 0 {
            return 0.0;
        }
        let step = step as f64;
        let warmup = self.warmup_steps as f64;
        self.factor
            * (self.model_size as f64).powf(-0.5)
            * step.powf(-0.5).min(step * warmup.powf(-1.5))
    }

    pub fn factor(&self) -> f64 {
        self.factor
    }

    pub fn set_factor(&mut self, factor: f64) {
        self.factor = factor;
        self.current_lr = self.rate(self.step);
    }

    pub fn step_count(&self) -> usize {
        self.step
    }

    /// Jumps to `step` iterations, as after a resume.
    pub fn restore(&mut self, step: usize, factor: f64) {
        self.step = step;
        self.set_factor(factor);
    }
}

impl LRScheduler for NoamSchedule {
    fn step(&mut self) -> f64 {
        self.step = self.step.saturating_add(1);
        self.current_lr = self.rate(self.step);
        self.current_lr
    }

    fn learning_rate(&self) -> f64 {
        self.current_lr
    }
}

/// Epoch-level schedule reacting to the validation loss.
pub trait PlateauScheduler: Send {
    /// Feeds one validation metric; returns the reduced rate when
    /// `current_lr` should change.
    fn step(&mut self, metric: f64, current_lr: f64) -> Option<f64>;

    /// Copy used to evaluate a step before committing to it.
    fn boxed_clone(&self) -> Box<dyn PlateauScheduler>;
}

/// Multiplies the rate by `factor` once the metric has not improved by a
/// relative `threshold` for more than `patience` epochs.
#[derive(Debug, Clone)]
pub struct ReduceOnPlateau {
    factor: f64,
    patience: usize,
    threshold: f64,
    min_lr: f64,
    cooldown: usize,
    best: f64,
    bad_epochs: usize,
    cooldown_counter: usize,
}

impl ReduceOnPlateau {
    pub fn new(config: &PlateauConfig) -> Result<Self, TrainingError> {
        if !(0.0 < config.factor && config.factor < 1.0) {
            return Err(TrainingError::initialization(
                "plateau factor must be in (0, 1)",
            ));
        }
        Ok(Self {
            factor: config.factor,
            patience: config.patience,
            threshold: config.threshold,
            min_lr: config.min_lr,
            cooldown: config.cooldown,
            best: f64::INFINITY,
            bad_epochs: 0,
            cooldown_counter: 0,
        })
    }

    fn is_improvement(&self, metric: f64) -> bool {
        metric < self.best * (1.0 - self.threshold)
    }
}

impl PlateauScheduler for ReduceOnPlateau {
    fn step(&mut self, metric: f64, current_lr: f64) -> Option<f64> {
        if self.is_improvement(metric) {
            self.best = metric;
            self.bad_epochs = 0;
        } else {
            self.bad_epochs += 1;
        }

        if self.cooldown_counter > 0 {
            self.cooldown_counter -= 1;
            self.bad_epochs = 0;
        }

        if self.bad_epochs <= self.patience {
            return None;
        }

        self.cooldown_counter = self.cooldown;
        self.bad_epochs = 0;
        let reduced = (current_lr * self.factor).max(self.min_lr);
        (current_lr - reduced > 1e-8).then_some(reduced)
    }

    fn boxed_clone(&self) -> Box<dyn PlateauScheduler> {
        Box::new(self.clone())
    }
}

pub fn build_plateau(
    config: Option<&PlateauConfig>,
) -> Result<Option<Box<dyn PlateauScheduler>>, TrainingError> {
    match config {
        Some(cfg) => Ok(Some(Box::new(ReduceOnPlateau::new(cfg)?))),
        None => Ok(None),
    }
}
