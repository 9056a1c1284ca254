use std::collections::HashMap;

use candle_core::{backprop::GradStore, DType, Tensor, Var};

use super::{Optimizer, OptimizerState, ParameterState};
use crate::{
    config::{self, to_runtime_error},
    TrainingError,
};

const EPS: f64 = 1e-12;

#[derive(Debug, Clone, Copy)]
pub struct AdamWConfig {
    pub learning_rate: f64,
    pub beta1: f64,
    pub beta2: f64,
    pub epsilon: f64,
    pub weight_decay: f64,
}

impl From<&config::OptimizerConfig> for AdamWConfig {
    fn from(value: &config::OptimizerConfig) -> Self {
        Self {
            learning_rate: value.learning_rate as f64,
            beta1: value.beta1 as f64,
            beta2: value.beta2 as f64,
            epsilon: value.epsilon as f64,
            weight_decay: value.weight_decay as f64,
        }
    }
}

/// Adam with decoupled weight decay; `weight_decay = 0` is plain Adam.
#[derive(Debug)]
pub struct AdamW {
    config: AdamWConfig,
    params: Vec<ParameterSlot>,
    step: usize,
    max_grad_norm: Option<f64>,
}

#[derive(Debug)]
struct ParameterSlot {
    name: String,
    param: Var,
    first_moment: Tensor,
    second_moment: Tensor,
}

struct ProcessedGradient {
    index: usize,
    grad: Tensor,
    norm: f64,
}

impl AdamW {
    pub fn new(
        named_parameters: Vec<(String, Var)>,
        config: AdamWConfig,
        max_grad_norm: Option<f64>,
    ) -> Result<Self, TrainingError> {
        if named_parameters.is_empty() {
            return Err(TrainingError::initialization(
                "optimizer requires at least one parameter",
            ));
        }

        let mut params = Vec::with_capacity(named_parameters.len());
        for (name, var) in named_parameters {
            let tensor = var.as_tensor();
            if !tensor.dtype().is_float() {
                return Err(TrainingError::initialization(format!(
                    "optimizer received non-floating parameter '{}'",
                    name
                )));
            }
            let first_moment =
                Tensor::zeros(tensor.dims(), DType::F32, tensor.device()).map_err(to_runtime_error)?;
            let second_moment =
                Tensor::zeros(tensor.dims(), DType::F32, tensor.device()).map_err(to_runtime_error)?;
            params.push(ParameterSlot {
                name,
                param: var,
                first_moment,
                second_moment,
            });
        }

        Ok(Self {
            config,
            params,
            step: 0,
            max_grad_norm,
        })
    }

    pub fn step_count(&self) -> usize {
        self.step
    }

    pub(super) fn export_state(&self, kind: &str) -> OptimizerState {
        OptimizerState {
            kind: kind.to_string(),
            step: self.step,
            learning_rate: self.config.learning_rate,
            schedule_factor: None,
            schedule_step: None,
            parameters: self
                .params
                .iter()
                .map(|slot| ParameterState {
                    name: slot.name.clone(),
                    first_moment: slot.first_moment.clone(),
                    second_moment: slot.second_moment.clone(),
                })
                .collect(),
        }
    }

    /// Validates every moment against the registered parameters, then
    /// installs them.
    pub(super) fn import_state(&mut self, state: OptimizerState) -> Result<(), TrainingError> {
        let mut by_name: HashMap<String, ParameterState> = state
            .parameters
            .into_iter()
            .map(|param| (param.name.clone(), param))
            .collect();

        let mut staged = Vec::with_capacity(self.params.len());
        for slot in &self.params {
            let saved = by_name.remove(&slot.name).ok_or_else(|| {
                TrainingError::checkpoint(format!(
                    "optimizer state missing parameter '{}'",
                    slot.name
                ))
            })?;
            let dims = slot.param.as_tensor().dims();
            if saved.first_moment.dims() != dims || saved.second_moment.dims() != dims {
                return Err(TrainingError::checkpoint(format!(
                    "optimizer state shape mismatch for '{}': expected {:?}",
                    slot.name, dims
                )));
            }
            let device = slot.param.as_tensor().device();
            let first = saved
                .first_moment
                .to_device(device)
                .and_then(|t| t.to_dtype(DType::F32))
                .map_err(to_runtime_error)?;
            let second = saved
                .second_moment
                .to_device(device)
                .and_then(|t| t.to_dtype(DType::F32))
                .map_err(to_runtime_error)?;
            staged.push((first, second));
        }

        if !by_name.is_empty() {
            let mut extra: Vec<_> = by_name.into_keys().collect();
            extra.sort();
            return Err(TrainingError::checkpoint(format!(
                "optimizer state has parameters not present in the model: {}",
                extra.join(", ")
            )));
        }

        for (slot, (first, second)) in self.params.iter_mut().zip(staged) {
            slot.first_moment = first;
            slot.second_moment = second;
        }
        self.step = state.step;
        self.config.learning_rate = state.learning_rate;
        Ok(())
    }

    fn clip(&self, processed: &mut [ProcessedGradient]) -> Result<(), TrainingError> {
        let Some(max_norm) = self.max_grad_norm else {
            return Ok(());
        };
        let total_norm_sq: f64 = processed.iter().map(|g| g.norm * g.norm).sum();
        let total_norm = total_norm_sq.sqrt();
        if total_norm > max_norm {
            let scale = max_norm / (total_norm + EPS);
            for item in processed.iter_mut() {
                item.grad = item.grad.affine(scale, 0.0).map_err(to_runtime_error)?;
                item.norm *= scale;
            }
        }
        Ok(())
    }

    fn apply(&mut self, processed: Vec<ProcessedGradient>) -> Result<(), TrainingError> {
        let cfg = self.config;
        let bias_correction1 = 1.0 - cfg.beta1.powi(self.step as i32);
        let bias_correction2 = 1.0 - cfg.beta2.powi(self.step as i32);
        let scale_m = if bias_correction1.abs() < EPS {
            1.0
        } else {
            1.0 / bias_correction1
        };
        let scale_v = if bias_correction2.abs() < EPS {
            1.0
        } else {
            1.0 / bias_correction2
        };

        for item in processed {
            let slot = &mut self.params[item.index];

            let new_m = (slot
                .first_moment
                .affine(cfg.beta1, 0.0)
                .map_err(to_runtime_error)?
                + item.grad.affine(1.0 - cfg.beta1, 0.0).map_err(to_runtime_error)?)
            .map_err(to_runtime_error)?;
            let new_v = (slot
                .second_moment
                .affine(cfg.beta2, 0.0)
                .map_err(to_runtime_error)?
                + item
                    .grad
                    .sqr()
                    .and_then(|g| g.affine(1.0 - cfg.beta2, 0.0))
                    .map_err(to_runtime_error)?)
            .map_err(to_runtime_error)?;

            let m_hat = new_m.affine(scale_m, 0.0).map_err(to_runtime_error)?;
            let denom = new_v
                .affine(scale_v, 0.0)
                .and_then(|v| v.sqrt())
                .and_then(|v| v.affine(1.0, cfg.epsilon))
                .map_err(to_runtime_error)?;
            let update = m_hat
                .div(&denom)
                .and_then(|u| u.affine(cfg.learning_rate, 0.0))
                .map_err(to_runtime_error)?;

            let dtype = slot.param.as_tensor().dtype();
            let base = slot
                .param
                .as_tensor()
                .to_dtype(DType::F32)
                .map_err(to_runtime_error)?;
            let decayed = if cfg.weight_decay != 0.0 {
                base.affine(1.0 - cfg.learning_rate * cfg.weight_decay, 0.0)
                    .map_err(to_runtime_error)?
            } else {
                base
            };
            let next = decayed
                .sub(&update)
                .and_then(|t| t.to_dtype(dtype))
                .map_err(to_runtime_error)?;
            slot.param.set(&next).map_err(to_runtime_error)?;

            slot.first_moment = new_m;
            slot.second_moment = new_v;
        }
        Ok(())
    }
}

impl Optimizer for AdamW {
    fn step(&mut self, grads: &mut GradStore) -> Result<(), TrainingError> {
        let mut processed = Vec::new();
        for (index, slot) in self.params.iter().enumerate() {
            let Some(grad) = grads.remove(slot.param.as_tensor()) else {
                continue;
            };
            let grad = grad.to_dtype(DType::F32).map_err(to_runtime_error)?;
            let norm = tensor_l2_norm(&grad)?;
            processed.push(ProcessedGradient { index, grad, norm });
        }

        if processed.is_empty() {
            return Ok(());
        }

        self.clip(&mut processed)?;
        self.step += 1;
        self.apply(processed)
    }

    fn learning_rate(&self) -> f64 {
        self.config.learning_rate
    }

    fn set_learning_rate(&mut self, lr: f64) {
        self.config.learning_rate = lr;
    }

    fn kind(&self) -> &'static str {
        "adamw"
    }

    fn state(&self) -> Result<OptimizerState, TrainingError> {
        Ok(self.export_state(self.kind()))
    }

    fn load_state(&mut self, state: OptimizerState) -> Result<(), TrainingError> {
        if state.kind != self.kind() {
            return Err(TrainingError::checkpoint(format!(
                "optimizer state was saved by '{}' but the configured optimizer is '{}'",
                state.kind,
                self.kind()
            )));
        }
        self.import_state(state)
    }
}

fn tensor_l2_norm(tensor: &Tensor) -> Result<f64, TrainingError> {
    let squared = tensor
        .sqr()
        .and_then(|t| t.sum_all())
        .and_then(|t| t.to_scalar::<f32>())
        .map_err(to_runtime_error)?;
    Ok((squared as f64).sqrt())
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn config(lr: f64) -> AdamWConfig {
        AdamWConfig {
            learning_rate: lr,
            beta1: 0.9,
            beta2: 0.999,
            epsilon: 1e-8,
            weight_decay: 0.0,
        }
    }

    fn quadratic_var() -> Var {
        Var::from_tensor(&Tensor::new(&[3f32, -2.0], &Device::Cpu).unwrap()).unwrap()
    }

    #[test]
    fn minimises_a_quadratic() {
        let var = quadratic_var();
        let mut optimizer = AdamW::new(vec![("w".into(), var.clone())], config(0.1), None).unwrap();
        for _ in 0..200 {
            let loss = var.as_tensor().sqr().unwrap().sum_all().unwrap();
            let mut grads = loss.backward().unwrap();
            optimizer.step(&mut grads).unwrap();
        }
        let values = var.as_tensor().to_vec1::<f32>().unwrap();
        assert!(values.iter().all(|v| v.abs() < 0.5), "{values:?}");
        assert_eq!(optimizer.step_count(), 200);
    }

    #[test]
    fn clipping_bounds_first_update() {
        // With bias correction the first Adam step moves each coordinate by
        // roughly `lr` regardless of the gradient, so compare moments instead.
        let var = quadratic_var();
        let mut optimizer =
            AdamW::new(vec![("w".into(), var.clone())], config(0.01), Some(1.0)).unwrap();
        let loss = var.as_tensor().sqr().unwrap().sum_all().unwrap();
        let mut grads = loss.backward().unwrap();
        optimizer.step(&mut grads).unwrap();

        let state = optimizer.state().unwrap();
        let m = state.parameters[0].first_moment.to_vec1::<f32>().unwrap();
        // Raw gradient [6, -4] has norm ~7.2; clipped to unit norm then scaled by 0.1.
        let norm = (m[0] * m[0] + m[1] * m[1]).sqrt();
        assert!((norm - 0.1).abs() < 1e-4, "{norm}");
    }

    #[test]
    fn state_round_trips_and_rejects_mismatches() {
        let var = quadratic_var();
        let mut optimizer = AdamW::new(vec![("w".into(), var.clone())], config(0.1), None).unwrap();
        let loss = var.as_tensor().sqr().unwrap().sum_all().unwrap();
        let mut grads = loss.backward().unwrap();
        optimizer.step(&mut grads).unwrap();
        let state = optimizer.state().unwrap();

        let other_var = quadratic_var();
        let mut restored =
            AdamW::new(vec![("w".into(), other_var)], config(0.5), None).unwrap();
        restored.load_state(state.clone()).unwrap();
        assert_eq!(restored.step_count(), 1);
        assert_eq!(restored.learning_rate(), 0.1);

        let mut wrong_name =
            AdamW::new(vec![("v".into(), quadratic_var())], config(0.5), None).unwrap();
        assert!(wrong_name.load_state(state.clone()).is_err());
        assert_eq!(wrong_name.step_count(), 0);

        let mut wrong_kind = state;
        wrong_kind.kind = "sgd".into();
        assert!(restored.load_state(wrong_kind).is_err());
    }
}
