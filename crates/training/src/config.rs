use serde::{Deserialize, Serialize};
use std::{
    fmt, fs,
    path::{Path, PathBuf},
};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingConfig {
    pub data: DataConfig,
    #[serde(default)]
    pub vocab: VocabConfig,
    #[serde(default)]
    pub model: ModelSettings,
    #[serde(default)]
    pub loss: LossConfig,
    #[serde(default)]
    pub optimizer: OptimizerConfig,
    #[serde(default)]
    pub scheduler: Option<PlateauConfig>,
    #[serde(default)]
    pub boosting: BoostingConfig,
    #[serde(default)]
    pub runtime: RuntimeConfig,
}

impl TrainingConfig {
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, TrainingError> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)?;
        let mut config: TrainingConfig = match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => serde_json::from_str(&contents)?,
            Some("toml") | Some("tml") | None => toml::from_str(&contents)?,
            Some(other) => {
                return Err(TrainingError::ConfigFormat(format!(
                    "unsupported configuration extension '{}'",
                    other
                )));
            }
        };

        let base_dir = path.parent().unwrap_or_else(|| Path::new("."));
        config.apply_base_path(base_dir);
        config.validate()?;

        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, TrainingError> {
        Self::from_path(path)
    }

    /// Collects every violation instead of stopping at the first one.
    pub fn validate(&self) -> Result<(), TrainingError> {
        let mut errors = Vec::new();

        if self.data.batch_tokens == 0 {
            errors.push("data.batch_tokens must be greater than 0".to_string());
        }

        if let Some(0) = self.data.validation_batch_tokens {
            errors.push("data.validation_batch_tokens must be greater than 0".to_string());
        }

        if let Some(0) = self.data.max_len {
            errors.push("data.max_len must be greater than 0".to_string());
        }

        if self.vocab.min_freq == 0 {
            errors.push("vocab.min_freq must be at least 1".to_string());
        }

        if self.model.hidden_size == 0 {
            errors.push("model.hidden_size must be greater than 0".to_string());
        }

        if !(0.0..1.0).contains(&self.model.dropout) {
            errors.push("model.dropout must be in [0, 1)".to_string());
        }

        if !(0.0..1.0).contains(&self.loss.label_smoothing) {
            errors.push("loss.label_smoothing must be in [0, 1)".to_string());
        }

        if self.optimizer.learning_rate <= 0.0 {
            errors.push("optimizer.learning_rate must be greater than 0".to_string());
        }

        if self.optimizer.weight_decay < 0.0 {
            errors.push("optimizer.weight_decay must be >= 0".to_string());
        }

        if !(0.0 < self.optimizer.beta1 && self.optimizer.beta1 < 1.0) {
            errors.push("optimizer.beta1 must be in (0, 1)".to_string());
        }

        if !(0.0 < self.optimizer.beta2 && self.optimizer.beta2 < 1.0) {
            errors.push("optimizer.beta2 must be in (0, 1)".to_string());
        }

        if let Some(norm) = self.optimizer.max_grad_norm {
            if norm <= 0.0 {
                errors.push("optimizer.max_grad_norm must be greater than 0".to_string());
            }
        }

        if self.optimizer.schedule == LearningRateSchedule::Noam {
            if self.optimizer.noam.warmup_steps == 0 {
                errors.push("optimizer.noam.warmup_steps must be greater than 0".to_string());
            }
            if self.optimizer.noam.factor <= 0.0 {
                errors.push("optimizer.noam.factor must be greater than 0".to_string());
            }
            if let Some(0) = self.optimizer.noam.model_size {
                errors.push("optimizer.noam.model_size must be greater than 0".to_string());
            }
        }

        if let Some(plateau) = &self.scheduler {
            if !(0.0 < plateau.factor && plateau.factor < 1.0) {
                errors.push("scheduler.factor must be in (0, 1)".to_string());
            }
            if plateau.threshold < 0.0 {
                errors.push("scheduler.threshold must be >= 0".to_string());
            }
            if plateau.min_lr < 0.0 {
                errors.push("scheduler.min_lr must be >= 0".to_string());
            }
        }

        if !(0.0..=1.0).contains(&self.boosting.boost_percent) {
            errors.push("boosting.boost_percent must be in [0, 1]".to_string());
        }

        if let Some(0) = self.boosting.max_boosted_examples {
            errors.push("boosting.max_boosted_examples must be greater than 0".to_string());
        }

        if self.runtime.max_epochs == 0 {
            errors.push("runtime.max_epochs must be greater than 0".to_string());
        }

        if self.runtime.checkpoint.directory.as_os_str().is_empty() {
            errors.push("runtime.checkpoint.directory must not be empty".to_string());
        }

        if self.runtime.decode.every_n_epochs == 0 {
            errors.push("runtime.decode.every_n_epochs must be greater than 0".to_string());
        }

        if self.runtime.decode.max_len == 0 {
            errors.push("runtime.decode.max_len must be greater than 0".to_string());
        }

        if !errors.is_empty() {
            return Err(TrainingError::validation(errors));
        }

        Ok(())
    }

    fn apply_base_path(&mut self, base: &Path) {
        self.data.apply_base_path(base);
        self.runtime.apply_base_path(base);
    }

    /// Token budget used for validation batches.
    pub fn validation_batch_tokens(&self) -> usize {
        self.data
            .validation_batch_tokens
            .unwrap_or(self.data.batch_tokens)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataConfig {
    pub train_source: PathBuf,
    pub train_target: PathBuf,
    pub validation_source: PathBuf,
    pub validation_target: PathBuf,
    #[serde(default = "default_batch_tokens")]
    pub batch_tokens: usize,
    #[serde(default)]
    pub validation_batch_tokens: Option<usize>,
    #[serde(default = "default_max_len")]
    pub max_len: Option<usize>,
    #[serde(default)]
    pub lowercase: bool,
}

impl DataConfig {
    fn apply_base_path(&mut self, base: &Path) {
        for path in [
            &mut self.train_source,
            &mut self.train_target,
            &mut self.validation_source,
            &mut self.validation_target,
        ] {
            absolutize_in_place(path, base);
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VocabConfig {
    #[serde(default = "default_min_freq")]
    pub min_freq: usize,
    #[serde(default)]
    pub max_size: Option<usize>,
}

impl Default for VocabConfig {
    fn default() -> Self {
        Self {
            min_freq: default_min_freq(),
            max_size: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelSettings {
    #[serde(default = "default_hidden_size")]
    pub hidden_size: usize,
    #[serde(default = "default_dropout")]
    pub dropout: f32,
}

impl Default for ModelSettings {
    fn default() -> Self {
        Self {
            hidden_size: default_hidden_size(),
            dropout: default_dropout(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LossConfig {
    #[serde(default)]
    pub label_smoothing: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizerConfig {
    #[serde(default = "default_learning_rate")]
    pub learning_rate: f32,
    #[serde(default)]
    pub weight_decay: f32,
    #[serde(default = "default_beta1")]
    pub beta1: f32,
    #[serde(default = "default_beta2")]
    pub beta2: f32,
    #[serde(default = "default_adam_eps")]
    pub epsilon: f32,
    #[serde(default)]
    pub max_grad_norm: Option<f32>,
    #[serde(default)]
    pub schedule: LearningRateSchedule,
    #[serde(default)]
    pub noam: NoamConfig,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            learning_rate: default_learning_rate(),
            weight_decay: 0.0,
            beta1: default_beta1(),
            beta2: default_beta2(),
            epsilon: default_adam_eps(),
            max_grad_norm: None,
            schedule: LearningRateSchedule::default(),
            noam: NoamConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LearningRateSchedule {
    #[default]
    Constant,
    Noam,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NoamConfig {
    #[serde(default = "default_noam_factor")]
    pub factor: f64,
    #[serde(default = "default_noam_warmup")]
    pub warmup_steps: usize,
    /// Defaults to `model.hidden_size`.
    #[serde(default)]
    pub model_size: Option<usize>,
}

impl Default for NoamConfig {
    fn default() -> Self {
        Self {
            factor: default_noam_factor(),
            warmup_steps: default_noam_warmup(),
            model_size: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlateauConfig {
    #[serde(default = "default_plateau_factor")]
    pub factor: f64,
    #[serde(default = "default_plateau_patience")]
    pub patience: usize,
    #[serde(default = "default_plateau_threshold")]
    pub threshold: f64,
    #[serde(default)]
    pub min_lr: f64,
    #[serde(default)]
    pub cooldown: usize,
}

impl Default for PlateauConfig {
    fn default() -> Self {
        Self {
            factor: default_plateau_factor(),
            patience: default_plateau_patience(),
            threshold: default_plateau_threshold(),
            min_lr: 0.0,
            cooldown: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BoostingConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_boost_percent")]
    pub boost_percent: f64,
    #[serde(default)]
    pub warmup_epochs: usize,
    #[serde(default)]
    pub growth: BoostGrowth,
    #[serde(default)]
    pub max_boosted_examples: Option<usize>,
}

impl Default for BoostingConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            boost_percent: default_boost_percent(),
            warmup_epochs: 0,
            growth: BoostGrowth::default(),
            max_boosted_examples: None,
        }
    }
}

/// How hard examples carry over between boosted epochs.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BoostGrowth {
    /// Every epoch's hard pool stays appended to the training set.
    #[default]
    Accumulate,
    /// Only the most recent hard pool is appended.
    ResetEachEpoch,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default = "default_seed")]
    pub seed: u64,
    #[serde(default = "default_max_epochs")]
    pub max_epochs: usize,
    #[serde(default)]
    pub device: DeviceKind,
    #[serde(default)]
    pub checkpoint: CheckpointConfig,
    #[serde(default)]
    pub decode: DecodeConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            seed: default_seed(),
            max_epochs: default_max_epochs(),
            device: DeviceKind::default(),
            checkpoint: CheckpointConfig::default(),
            decode: DecodeConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl RuntimeConfig {
    fn apply_base_path(&mut self, base: &Path) {
        absolutize_in_place(&mut self.checkpoint.directory, base);
        if let Some(dir) = self.logging.tensorboard_dir.as_mut() {
            absolutize_in_place(dir, base);
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DeviceKind {
    #[default]
    Cpu,
    Cuda,
    Metal,
    Auto,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointConfig {
    #[serde(default = "default_checkpoint_dir")]
    pub directory: PathBuf,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            directory: default_checkpoint_dir(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecodeConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_decode_every")]
    pub every_n_epochs: usize,
    #[serde(default = "default_num_translations")]
    pub num_translations: usize,
    #[serde(default = "default_decode_max_len")]
    pub max_len: usize,
}

impl Default for DecodeConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            every_n_epochs: default_decode_every(),
            num_translations: default_num_translations(),
            max_len: default_decode_max_len(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_true")]
    pub enable_stdout: bool,
    #[serde(default)]
    pub tensorboard_dir: Option<PathBuf>,
    #[serde(default = "default_tensorboard_flush")]
    pub tensorboard_flush_every_n: usize,
    #[serde(default = "default_true")]
    pub progress_bar: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            enable_stdout: true,
            tensorboard_dir: None,
            tensorboard_flush_every_n: default_tensorboard_flush(),
            progress_bar: true,
        }
    }
}

fn absolutize_in_place(path: &mut PathBuf, base: &Path) {
    if path.is_relative() {
        *path = base.join(&*path);
    }
}

fn default_batch_tokens() -> usize {
    4_096
}

fn default_max_len() -> Option<usize> {
    Some(100)
}

fn default_min_freq() -> usize {
    2
}

fn default_hidden_size() -> usize {
    256
}

fn default_dropout() -> f32 {
    0.1
}

fn default_learning_rate() -> f32 {
    3e-4
}

fn default_beta1() -> f32 {
    0.9
}

fn default_beta2() -> f32 {
    0.98
}

fn default_adam_eps() -> f32 {
    1e-9
}

fn default_noam_factor() -> f64 {
    1.0
}

fn default_noam_warmup() -> usize {
    4_000
}

fn default_plateau_factor() -> f64 {
    0.1
}

fn default_plateau_patience() -> usize {
    10
}

fn default_plateau_threshold() -> f64 {
    1e-4
}

fn default_boost_percent() -> f64 {
    0.1
}

fn default_seed() -> u64 {
    42
}

fn default_max_epochs() -> usize {
    10
}

fn default_checkpoint_dir() -> PathBuf {
    PathBuf::from("checkpoints")
}

fn default_true() -> bool {
    true
}

fn default_decode_every() -> usize {
    3
}

fn default_num_translations() -> usize {
    5
}

fn default_decode_max_len() -> usize {
    100
}

fn default_tensorboard_flush() -> usize {
    1
}

#[derive(Debug)]
pub enum TrainingError {
    Io(std::io::Error),
    ConfigFormat(String),
    Validation(Vec<String>),
    Initialization(String),
    Runtime(String),
    ShapeMismatch { output: usize, target: usize },
    EmptyDataset(String),
    CheckpointNotFound(PathBuf),
    MissingParameter(String),
    Checkpoint(String),
}

impl TrainingError {
    pub fn initialization(message: impl Into<String>) -> Self {
        Self::Initialization(message.into())
    }

    pub fn runtime(message: impl Into<String>) -> Self {
        Self::Runtime(message.into())
    }

    pub fn validation(messages: Vec<String>) -> Self {
        Self::Validation(messages)
    }

    pub fn checkpoint(message: impl Into<String>) -> Self {
        Self::Checkpoint(message.into())
    }
}

impl fmt::Display for TrainingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrainingError::Io(err) => write!(f, "i/o error: {}", err),
            TrainingError::ConfigFormat(err) => write!(f, "failed to parse config: {}", err),
            TrainingError::Validation(messages) => {
                write!(f, "invalid configuration: {}", messages.join("; "))
            }
            TrainingError::Initialization(msg) => {
                write!(f, "trainer initialization failed: {}", msg)
            }
            TrainingError::Runtime(msg) => write!(f, "training failed: {}", msg),
            TrainingError::ShapeMismatch { output, target } => write!(
                f,
                "flattened output has {} positions but flattened target has {}",
                output, target
            ),
            TrainingError::EmptyDataset(what) => {
                write!(f, "{} contained no non-padding target tokens", what)
            }
            TrainingError::CheckpointNotFound(path) => {
                write!(f, "no checkpoint found at {}", path.display())
            }
            TrainingError::MissingParameter(name) => {
                write!(f, "checkpoint is missing parameter '{}'", name)
            }
            TrainingError::Checkpoint(msg) => write!(f, "checkpoint error: {}", msg),
        }
    }
}

impl std::error::Error for TrainingError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            TrainingError::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<std::io::Error> for TrainingError {
    fn from(value: std::io::Error) -> Self {
        TrainingError::Io(value)
    }
}

impl From<toml::de::Error> for TrainingError {
    fn from(value: toml::de::Error) -> Self {
        TrainingError::ConfigFormat(value.to_string())
    }
}

impl From<serde_json::Error> for TrainingError {
    fn from(value: serde_json::Error) -> Self {
        TrainingError::ConfigFormat(value.to_string())
    }
}

/// Maps candle failures onto the crate error.
pub(crate) fn to_runtime_error(err: candle_core::Error) -> TrainingError {
    TrainingError::runtime(err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
        [data]
        train_source = "train.src"
        train_target = "train.trg"
        validation_source = "valid.src"
        validation_target = "valid.trg"
    "#;

    #[test]
    fn minimal_toml_uses_defaults() {
        let config: TrainingConfig = toml::from_str(MINIMAL).unwrap();
        assert_eq!(config.data.batch_tokens, 4_096);
        assert_eq!(config.data.max_len, Some(100));
        assert!(!config.boosting.enabled);
        assert_eq!(config.boosting.growth, BoostGrowth::Accumulate);
        assert_eq!(config.runtime.decode.every_n_epochs, 3);
        assert_eq!(config.runtime.decode.num_translations, 5);
        assert_eq!(config.optimizer.schedule, LearningRateSchedule::Constant);
        assert!(config.scheduler.is_none());
        config.validate().unwrap();
    }

    #[test]
    fn validation_reports_every_violation() {
        let mut config: TrainingConfig = toml::from_str(MINIMAL).unwrap();
        config.data.batch_tokens = 0;
        config.boosting.boost_percent = 1.5;
        config.runtime.max_epochs = 0;

        match config.validate() {
            Err(TrainingError::Validation(errors)) => {
                assert_eq!(errors.len(), 3, "{errors:?}");
                assert!(errors.iter().any(|e| e.contains("boost_percent")));
            }
            other => panic!("expected validation error, got {other:?}"),
        }
    }

    #[test]
    fn loads_json_and_resolves_relative_paths() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("train.json");
        fs::write(
            &path,
            r#"{
                "data": {
                    "train_source": "corpus/train.src",
                    "train_target": "corpus/train.trg",
                    "validation_source": "corpus/valid.src",
                    "validation_target": "corpus/valid.trg"
                },
                "boosting": { "enabled": true, "growth": "reset_each_epoch" }
            }"#,
        )
        .unwrap();

        let config = TrainingConfig::load(&path).unwrap();
        assert_eq!(
            config.data.train_source,
            dir.path().join("corpus/train.src")
        );
        assert_eq!(
            config.runtime.checkpoint.directory,
            dir.path().join("checkpoints")
        );
        assert_eq!(config.boosting.growth, BoostGrowth::ResetEachEpoch);
    }

    #[test]
    fn rejects_unknown_extension() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("train.yaml");
        fs::write(&path, "data: {}").unwrap();
        assert!(matches!(
            TrainingConfig::load(&path),
            Err(TrainingError::ConfigFormat(_))
        ));
    }
}
