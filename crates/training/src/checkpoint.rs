use std::{
    collections::{BTreeMap, HashMap},
    fs,
    ops::RangeInclusive,
    path::{Path, PathBuf},
};

use candle_core::{DType, Tensor};
use hex::encode as hex_encode;
use nmt_model::Seq2SeqModel;
use safetensors::SafeTensors;
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use crate::{
    config::to_runtime_error,
    optimizer::{Optimizer, OptimizerState, ParameterState},
    TrainingConfig, TrainingError,
};

pub const CHECKPOINT_FORMAT_VERSION: u32 = 2;
pub const BEST_CHECKPOINT_FILENAME: &str = "best.safetensors";
const CHECKPOINT_PREFIX: &str = "epoch_";
const CHECKPOINT_EXTENSION: &str = "safetensors";
const MODEL_PREFIX: &str = "model.";
const OPTIMIZER_PREFIX: &str = "optimizer.";
const FIRST_MOMENT_SUFFIX: &str = ".exp_avg";
const SECOND_MOMENT_SUFFIX: &str = ".exp_avg_sq";

/// Loop progress owned by the trainer and persisted with every checkpoint.
#[derive(Debug, Clone, PartialEq)]
pub struct EpochState {
    /// Index of the next epoch to run (0-based), equal to completed epochs.
    pub epoch: usize,
    pub iterations: usize,
    pub best_val_loss: f64,
}

impl Default for EpochState {
    fn default() -> Self {
        Self {
            epoch: 0,
            iterations: 0,
            best_val_loss: f64::INFINITY,
        }
    }
}

impl EpochState {
    /// Returns whether `val_loss` strictly improves on every earlier value.
    pub fn record_validation(&mut self, val_loss: f64) -> bool {
        if val_loss < self.best_val_loss {
            self.best_val_loss = val_loss;
            true
        } else {
            false
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyPattern {
    Suffix(&'static str),
    Exact(&'static str),
}

impl KeyPattern {
    fn matches(&self, key: &str) -> bool {
        match self {
            KeyPattern::Suffix(suffix) => key.ends_with(suffix),
            KeyPattern::Exact(name) => key == *name,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyAction {
    Drop,
    /// Replaces the matched part of the key.
    Rename(&'static str),
}

/// One entry of the checkpoint key migration table.
#[derive(Debug, Clone)]
pub struct LegacyKeyRule {
    /// Checkpoint format versions the rule applies to.
    pub versions: RangeInclusive<u32>,
    pub pattern: KeyPattern,
    pub action: KeyAction,
    pub reason: &'static str,
}

/// Migrations applied to every loaded checkpoint.
pub fn legacy_key_rules() -> Vec<LegacyKeyRule> {
    vec![LegacyKeyRule {
        versions: 0..=CHECKPOINT_FORMAT_VERSION,
        pattern: KeyPattern::Suffix("weight_hh_l0"),
        action: KeyAction::Drop,
        reason: "hidden-to-hidden weights of the removed weight-drop wrapper",
    }]
}

/// Rewrites checkpoint keys written by format `version` under `rules`.
///
/// Returns the migrated map and the keys that were dropped.
pub fn apply_migrations(
    tensors: HashMap<String, Tensor>,
    version: u32,
    rules: &[LegacyKeyRule],
) -> (HashMap<String, Tensor>, Vec<String>) {
    let active: Vec<&LegacyKeyRule> = rules
        .iter()
        .filter(|rule| rule.versions.contains(&version))
        .collect();
    let mut migrated = HashMap::with_capacity(tensors.len());
    let mut dropped = Vec::new();

    'keys: for (key, tensor) in tensors {
        for rule in &active {
            if !rule.pattern.matches(&key) {
                continue;
            }
            match rule.action {
                KeyAction::Drop => {
                    debug!("dropping checkpoint key {} ({})", key, rule.reason);
                    dropped.push(key);
                    continue 'keys;
                }
                KeyAction::Rename(replacement) => {
                    let renamed = match rule.pattern {
                        KeyPattern::Suffix(suffix) => {
                            format!("{}{}", &key[..key.len() - suffix.len()], replacement)
                        }
                        KeyPattern::Exact(_) => replacement.to_string(),
                    };
                    debug!("renaming checkpoint key {} -> {} ({})", key, renamed, rule.reason);
                    migrated.insert(renamed, tensor);
                    continue 'keys;
                }
            }
        }
        migrated.insert(key, tensor);
    }
    dropped.sort();
    (migrated, dropped)
}

pub struct SaveRequest<'a> {
    pub directory: &'a Path,
    pub state: &'a EpochState,
    pub model: &'a dyn Seq2SeqModel,
    pub optimizer: &'a dyn Optimizer,
    /// Fingerprinted into the metadata when present.
    pub config: Option<&'a TrainingConfig>,
    pub is_best: bool,
}

#[derive(Debug, Clone)]
pub struct SavedCheckpoint {
    pub path: PathBuf,
    pub best: Option<PathBuf>,
}

pub fn checkpoint_filename(epoch: usize) -> String {
    format!("{CHECKPOINT_PREFIX}{epoch}.{CHECKPOINT_EXTENSION}")
}

/// Writes `epoch_{n}.safetensors` for `state.epoch`, and copies it to
/// `best.safetensors` when `is_best`.
pub fn save_checkpoint(request: SaveRequest<'_>) -> Result<SavedCheckpoint, TrainingError> {
    fs::create_dir_all(request.directory).map_err(|err| {
        TrainingError::checkpoint(format!(
            "failed to create checkpoint directory {}: {err}",
            request.directory.display()
        ))
    })?;

    let mut tensors: BTreeMap<String, Tensor> = BTreeMap::new();
    let parameters = request.model.parameters();
    if parameters.is_empty() {
        return Err(TrainingError::checkpoint(
            "model contains no parameters to checkpoint",
        ));
    }
    for (name, var) in parameters {
        tensors.insert(format!("{MODEL_PREFIX}{name}"), var.as_tensor().detach());
    }

    let optimizer_state = request.optimizer.state()?;
    for param in &optimizer_state.parameters {
        tensors.insert(
            format!("{OPTIMIZER_PREFIX}{}{FIRST_MOMENT_SUFFIX}", param.name),
            param.first_moment.clone(),
        );
        tensors.insert(
            format!("{OPTIMIZER_PREFIX}{}{SECOND_MOMENT_SUFFIX}", param.name),
            param.second_moment.clone(),
        );
    }

    let mut metadata = HashMap::new();
    metadata.insert("format_version".to_string(), CHECKPOINT_FORMAT_VERSION.to_string());
    metadata.insert("epoch".to_string(), request.state.epoch.to_string());
    metadata.insert("iterations".to_string(), request.state.iterations.to_string());
    metadata.insert(
        "best_val_loss".to_string(),
        request.state.best_val_loss.to_string(),
    );
    metadata.insert("optimizer_kind".to_string(), optimizer_state.kind.clone());
    metadata.insert("optimizer_step".to_string(), optimizer_state.step.to_string());
    metadata.insert(
        "learning_rate".to_string(),
        optimizer_state.learning_rate.to_string(),
    );
    if let Some(factor) = optimizer_state.schedule_factor {
        metadata.insert("schedule_factor".to_string(), factor.to_string());
    }
    if let Some(step) = optimizer_state.schedule_step {
        metadata.insert("schedule_step".to_string(), step.to_string());
    }
    if let Some(config) = request.config {
        metadata.insert("config_sha256".to_string(), fingerprint_config(config)?);
    }

    let path = request.directory.join(checkpoint_filename(request.state.epoch));
    let staging = path.with_extension("safetensors.tmp");
    safetensors::serialize_to_file(&tensors, &Some(metadata), &staging).map_err(|err| {
        TrainingError::checkpoint(format!("failed to write {}: {err}", staging.display()))
    })?;
    fs::rename(&staging, &path).map_err(|err| {
        TrainingError::checkpoint(format!(
            "failed to move checkpoint into place at {}: {err}",
            path.display()
        ))
    })?;
    info!("saved checkpoint {}", path.display());

    let best = if request.is_best {
        let best_path = request.directory.join(BEST_CHECKPOINT_FILENAME);
        let best_staging = best_path.with_extension("safetensors.tmp");
        fs::copy(&path, &best_staging)
            .and_then(|_| fs::rename(&best_staging, &best_path))
            .map_err(|err| {
                TrainingError::checkpoint(format!(
                    "failed to update {}: {err}",
                    best_path.display()
                ))
            })?;
        info!("new best checkpoint (val loss {:.4})", request.state.best_val_loss);
        Some(best_path)
    } else {
        None
    };

    Ok(SavedCheckpoint { path, best })
}

#[derive(Debug, Clone)]
pub struct LoadedCheckpoint {
    pub state: EpochState,
    pub format_version: u32,
    pub optimizer_kind: Option<String>,
    pub config_sha256: Option<String>,
    /// Keys removed by the migration table.
    pub dropped_keys: Vec<String>,
}

/// Restores model parameters (and optimizer state when given) from `path`.
///
/// Every key and shape is checked before anything is written, so a failed
/// load leaves the model and optimizer untouched.
pub fn load_checkpoint(
    path: &Path,
    model: &dyn Seq2SeqModel,
    optimizer: Option<&mut dyn Optimizer>,
) -> Result<LoadedCheckpoint, TrainingError> {
    load_checkpoint_with_rules(path, model, optimizer, &legacy_key_rules())
}

pub fn load_checkpoint_with_rules(
    path: &Path,
    model: &dyn Seq2SeqModel,
    optimizer: Option<&mut dyn Optimizer>,
    rules: &[LegacyKeyRule],
) -> Result<LoadedCheckpoint, TrainingError> {
    if !path.is_file() {
        return Err(TrainingError::CheckpointNotFound(path.to_path_buf()));
    }
    let buffer = fs::read(path)?;
    let (_, header) = SafeTensors::read_metadata(&buffer).map_err(|err| {
        TrainingError::checkpoint(format!("failed to read {}: {err}", path.display()))
    })?;
    let metadata = header.metadata().clone().unwrap_or_default();

    let format_version: u32 = parse_field(&metadata, "format_version")?.unwrap_or(1);
    if format_version > CHECKPOINT_FORMAT_VERSION {
        return Err(TrainingError::checkpoint(format!(
            "checkpoint format {} is newer than supported format {}",
            format_version, CHECKPOINT_FORMAT_VERSION
        )));
    }
    let state = EpochState {
        epoch: parse_field(&metadata, "epoch")?.unwrap_or(0),
        iterations: parse_field(&metadata, "iterations")?.unwrap_or(0),
        best_val_loss: parse_field(&metadata, "best_val_loss")?.unwrap_or(f64::INFINITY),
    };

    let device = model.device();
    let tensors = candle_core::safetensors::load_buffer(&buffer, device).map_err(to_runtime_error)?;
    let (tensors, dropped_keys) = apply_migrations(tensors, format_version, rules);

    let mut model_tensors = HashMap::new();
    let mut first_moments = HashMap::new();
    let mut second_moments = HashMap::new();
    for (key, tensor) in tensors {
        if let Some(name) = key.strip_prefix(MODEL_PREFIX) {
            model_tensors.insert(name.to_string(), tensor);
        } else if let Some(rest) = key.strip_prefix(OPTIMIZER_PREFIX) {
            if let Some(name) = rest.strip_suffix(SECOND_MOMENT_SUFFIX) {
                second_moments.insert(name.to_string(), tensor);
            } else if let Some(name) = rest.strip_suffix(FIRST_MOMENT_SUFFIX) {
                first_moments.insert(name.to_string(), tensor);
            } else {
                return Err(TrainingError::checkpoint(format!(
                    "unrecognised optimizer key '{key}'"
                )));
            }
        } else {
            return Err(TrainingError::checkpoint(format!(
                "unrecognised checkpoint key '{key}'"
            )));
        }
    }

    let mut staged = Vec::new();
    for (name, var) in model.parameters() {
        let tensor = model_tensors
            .remove(&name)
            .ok_or_else(|| TrainingError::MissingParameter(name.clone()))?;
        let expected = var.as_tensor().dims();
        if tensor.dims() != expected {
            return Err(TrainingError::checkpoint(format!(
                "parameter '{}' has shape {:?} in the checkpoint but {:?} in the model",
                name,
                tensor.dims(),
                expected
            )));
        }
        let tensor = match var.as_tensor().dtype() {
            dtype if dtype == tensor.dtype() => tensor,
            dtype => tensor.to_dtype(dtype).map_err(to_runtime_error)?,
        };
        staged.push((var, tensor));
    }
    if !model_tensors.is_empty() {
        let mut extra: Vec<_> = model_tensors.into_keys().collect();
        extra.sort();
        return Err(TrainingError::checkpoint(format!(
            "checkpoint has parameters the model does not: {}",
            extra.join(", ")
        )));
    }

    let optimizer_kind = metadata.get("optimizer_kind").cloned();
    if let Some(optimizer) = optimizer {
        let state = optimizer_state(&metadata, first_moments, second_moments)?;
        optimizer.load_state(state)?;
    }

    for (var, tensor) in staged {
        var.set(&tensor).map_err(to_runtime_error)?;
    }

    if !dropped_keys.is_empty() {
        debug!("ignored {} legacy checkpoint keys", dropped_keys.len());
    }
    Ok(LoadedCheckpoint {
        state,
        format_version,
        optimizer_kind,
        config_sha256: metadata.get("config_sha256").cloned(),
        dropped_keys,
    })
}

fn optimizer_state(
    metadata: &HashMap<String, String>,
    mut first_moments: HashMap<String, Tensor>,
    mut second_moments: HashMap<String, Tensor>,
) -> Result<OptimizerState, TrainingError> {
    let kind = metadata
        .get("optimizer_kind")
        .cloned()
        .ok_or_else(|| TrainingError::checkpoint("checkpoint has no optimizer state"))?;

    let mut names: Vec<String> = first_moments.keys().cloned().collect();
    names.sort();
    let mut parameters = Vec::with_capacity(names.len());
    for name in names {
        let first_moment = first_moments.remove(&name).ok_or_else(|| {
            TrainingError::MissingParameter(format!("{OPTIMIZER_PREFIX}{name}{FIRST_MOMENT_SUFFIX}"))
        })?;
        let second_moment = second_moments.remove(&name).ok_or_else(|| {
            TrainingError::MissingParameter(format!(
                "{OPTIMIZER_PREFIX}{name}{SECOND_MOMENT_SUFFIX}"
            ))
        })?;
        parameters.push(ParameterState {
            name,
            first_moment: first_moment.to_dtype(DType::F32).map_err(to_runtime_error)?,
            second_moment: second_moment.to_dtype(DType::F32).map_err(to_runtime_error)?,
        });
    }
    if let Some(name) = second_moments.into_keys().next() {
        return Err(TrainingError::MissingParameter(format!(
            "{OPTIMIZER_PREFIX}{name}{FIRST_MOMENT_SUFFIX}"
        )));
    }

    Ok(OptimizerState {
        kind,
        step: parse_field(metadata, "optimizer_step")?.unwrap_or(0),
        learning_rate: parse_field(metadata, "learning_rate")?.unwrap_or(0.0),
        schedule_factor: parse_field(metadata, "schedule_factor")?,
        schedule_step: parse_field(metadata, "schedule_step")?,
        parameters,
    })
}

fn parse_field<T>(metadata: &HashMap<String, String>, key: &str) -> Result<Option<T>, TrainingError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    metadata
        .get(key)
        .map(|raw| {
            raw.parse::<T>().map_err(|err| {
                TrainingError::checkpoint(format!("invalid metadata '{key}' = '{raw}': {err}"))
            })
        })
        .transpose()
}

/// Highest-numbered `epoch_{n}.safetensors` in `directory`, if any.
pub fn latest_checkpoint(directory: &Path) -> Result<Option<PathBuf>, TrainingError> {
    if !directory.exists() {
        return Ok(None);
    }
    let mut latest: Option<(usize, PathBuf)> = None;
    for entry in fs::read_dir(directory)? {
        let path = entry?.path();
        if path.extension().and_then(|ext| ext.to_str()) != Some(CHECKPOINT_EXTENSION) {
            continue;
        }
        let Some(epoch) = path
            .file_stem()
            .and_then(|stem| stem.to_str())
            .and_then(|stem| stem.strip_prefix(CHECKPOINT_PREFIX))
            .and_then(|n| n.parse::<usize>().ok())
        else {
            continue;
        };
        if latest.as_ref().map_or(true, |(best, _)| epoch > *best) {
            latest = Some((epoch, path));
        }
    }
    Ok(latest.map(|(_, path)| path))
}

pub fn fingerprint_config(config: &TrainingConfig) -> Result<String, TrainingError> {
    let json = serde_json::to_vec(config)
        .map_err(|err| TrainingError::runtime(format!("failed to hash config: {err}")))?;
    Ok(hex_encode(Sha256::digest(json)))
}
