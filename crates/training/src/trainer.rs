use std::{
    panic::{self, AssertUnwindSafe},
    path::{Path, PathBuf},
    sync::Arc,
};

use candle_core::{
    utils::{cuda_is_available, metal_is_available},
    DType, Device,
};
use nmt_model::{ModelConfig, PooledContextModel, Seq2SeqModel};
use tracing::{info, warn};

use crate::{
    boost::BoostedDatasetBuilder,
    checkpoint::{self, EpochState, LoadedCheckpoint, SaveRequest},
    config::{BoostingConfig, DeviceKind},
    data::{load_parallel_corpus, BucketIterator, CorpusOptions, TrainingExample, Vocab},
    decode::{EpochContext, EpochHook, SampleTranslationHook},
    epoch::EpochDriver,
    logging::{Logger, LoggingSettings, MetricsSink},
    loss::NllLoss,
    metrics::{minutes_seconds, EpochTimer, LossSummary},
    optimizer::{build_optimizer, Optimizer},
    scheduler::{build_plateau, PlateauScheduler},
    TrainingConfig, TrainingError,
};

/// Everything the training loop needs, already constructed.
pub struct TrainerParts {
    pub model: Box<dyn Seq2SeqModel>,
    pub optimizer: Box<dyn Optimizer>,
    pub plateau: Option<Box<dyn PlateauScheduler>>,
    pub criterion: NllLoss,
    pub vocab: Arc<Vocab>,
    pub train_data: BucketIterator,
    pub validation_data: BucketIterator,
    pub boosting: BoostingConfig,
    pub checkpoint_dir: PathBuf,
    pub max_epochs: usize,
    pub sink: Box<dyn MetricsSink>,
    pub progress_bar: bool,
    /// Fingerprinted into checkpoints when present.
    pub config: Option<TrainingConfig>,
}

/// Statistics of one finished epoch.
#[derive(Debug, Clone)]
pub struct EpochReport {
    /// 0-based epoch index.
    pub epoch: usize,
    pub train: LossSummary,
    pub validation: LossSummary,
    pub is_best: bool,
    /// Size of the collection the epoch trained on.
    pub train_examples: usize,
    pub learning_rate: f64,
    pub checkpoint: PathBuf,
}

struct Boosting {
    boost_percent: f64,
    builder: BoostedDatasetBuilder,
}

pub struct Trainer {
    config: Option<TrainingConfig>,
    model: Box<dyn Seq2SeqModel>,
    optimizer: Box<dyn Optimizer>,
    plateau: Option<Box<dyn PlateauScheduler>>,
    criterion: NllLoss,
    vocab: Arc<Vocab>,
    train_data: BucketIterator,
    validation_data: BucketIterator,
    boosting: Option<Boosting>,
    hard_pool: Option<Vec<TrainingExample>>,
    hooks: Vec<Box<dyn EpochHook>>,
    sink: Box<dyn MetricsSink>,
    checkpoint_dir: PathBuf,
    max_epochs: usize,
    progress_bar: bool,
    state: EpochState,
}

impl Trainer {
    /// Loads the corpora, builds the vocabulary, model and optimizer
    /// described by `config`.
    pub fn new(config: TrainingConfig) -> Result<Self, TrainingError> {
        config.validate()?;
        let device = select_device(config.runtime.device)?;

        let options = CorpusOptions {
            max_len: config.data.max_len,
            lowercase: config.data.lowercase,
        };
        let train_examples =
            load_parallel_corpus(&config.data.train_source, &config.data.train_target, &options)?;
        let validation_examples = load_parallel_corpus(
            &config.data.validation_source,
            &config.data.validation_target,
            &options,
        )?;
        if train_examples.is_empty() {
            return Err(TrainingError::EmptyDataset("training corpus".to_string()));
        }

        let vocab = Arc::new(Vocab::build(
            &train_examples,
            config.vocab.min_freq,
            config.vocab.max_size,
        ));
        info!("vocabulary size: {}", vocab.len());

        let dropout = config.model.dropout;
        let model = PooledContextModel::new(ModelConfig {
            vocab_size: vocab.len(),
            hidden_dim: config.model.hidden_size,
            dtype: DType::F32,
            device: device.clone(),
            dropout_p: (dropout > 0.0).then_some(dropout),
        })
        .map_err(|err| TrainingError::initialization(format!("failed to build model: {err}")))?;

        let optimizer = build_optimizer(
            &config.optimizer,
            model.parameters(),
            config.model.hidden_size,
        )?;
        let plateau = build_plateau(config.scheduler.as_ref())?;
        let criterion = NllLoss::new()
            .with_label_smoothing(config.loss.label_smoothing)?
            .with_ignore_index(Some(vocab.pad_id()));

        let train_data = BucketIterator::new(
            train_examples,
            Arc::clone(&vocab),
            device.clone(),
            config.data.batch_tokens,
            true,
            config.runtime.seed,
        )?;
        let validation_data = BucketIterator::new(
            validation_examples,
            Arc::clone(&vocab),
            device,
            config.validation_batch_tokens(),
            false,
            config.runtime.seed,
        )?;

        let logger = Logger::new(LoggingSettings::from_config(&config.runtime.logging))?;

        let mut trainer = Self::from_parts(TrainerParts {
            model: Box::new(model),
            optimizer,
            plateau,
            criterion,
            vocab,
            train_data,
            validation_data,
            boosting: config.boosting.clone(),
            checkpoint_dir: config.runtime.checkpoint.directory.clone(),
            max_epochs: config.runtime.max_epochs,
            sink: Box::new(logger),
            progress_bar: config.runtime.logging.progress_bar
                && config.runtime.logging.enable_stdout,
            config: Some(config.clone()),
        });
        if config.runtime.decode.enabled {
            trainer.add_hook(Box::new(SampleTranslationHook::from_config(
                &config.runtime.decode,
            )));
        }
        Ok(trainer)
    }

    pub fn from_parts(parts: TrainerParts) -> Self {
        let boosting = parts.boosting.enabled.then(|| Boosting {
            boost_percent: parts.boosting.boost_percent,
            builder: BoostedDatasetBuilder::from_config(&parts.boosting),
        });
        Self {
            config: parts.config,
            model: parts.model,
            optimizer: parts.optimizer,
            plateau: parts.plateau,
            criterion: parts.criterion,
            vocab: parts.vocab,
            train_data: parts.train_data,
            validation_data: parts.validation_data,
            boosting,
            hard_pool: None,
            hooks: Vec::new(),
            sink: parts.sink,
            checkpoint_dir: parts.checkpoint_dir,
            max_epochs: parts.max_epochs,
            progress_bar: parts.progress_bar,
            state: EpochState::default(),
        }
    }

    pub fn add_hook(&mut self, hook: Box<dyn EpochHook>) {
        self.hooks.push(hook);
    }

    pub fn set_metrics_sink(&mut self, sink: Box<dyn MetricsSink>) {
        self.sink = sink;
    }

    pub fn state(&self) -> &EpochState {
        &self.state
    }

    pub fn model(&self) -> &dyn Seq2SeqModel {
        self.model.as_ref()
    }

    pub fn optimizer(&self) -> &dyn Optimizer {
        self.optimizer.as_ref()
    }

    pub fn vocab(&self) -> &Arc<Vocab> {
        &self.vocab
    }

    pub fn checkpoint_dir(&self) -> &Path {
        &self.checkpoint_dir
    }

    pub fn config(&self) -> Option<&TrainingConfig> {
        self.config.as_ref()
    }

    /// Restores model, optimizer and loop state from `path`.
    pub fn resume_from(&mut self, path: &Path) -> Result<LoadedCheckpoint, TrainingError> {
        let loaded =
            checkpoint::load_checkpoint(path, self.model.as_ref(), Some(self.optimizer.as_mut()))?;
        if let (Some(saved), Some(config)) = (loaded.config_sha256.as_ref(), self.config.as_ref())
        {
            let current = checkpoint::fingerprint_config(config)?;
            if *saved != current {
                warn!("checkpoint {} was written under a different configuration", path.display());
            }
        }
        self.state = loaded.state.clone();
        self.hard_pool = None;
        info!(
            "resumed from {} at epoch {} ({} iterations, best val loss {:.4})",
            path.display(),
            self.state.epoch + 1,
            self.state.iterations,
            self.state.best_val_loss
        );
        Ok(loaded)
    }

    /// Resumes from the newest `epoch_{n}` checkpoint, if there is one.
    pub fn resume_from_latest(&mut self) -> Result<Option<LoadedCheckpoint>, TrainingError> {
        let Some(path) = checkpoint::latest_checkpoint(&self.checkpoint_dir)? else {
            return Ok(None);
        };
        self.resume_from(&path).map(Some)
    }

    /// Loss of the current model on the validation stream.
    pub fn evaluate(&self) -> Result<LossSummary, TrainingError> {
        let driver = EpochDriver::new(self.model.as_ref(), &self.criterion, &self.vocab, false);
        driver.validate(self.validation_data.batches(self.state.epoch))
    }

    pub fn train(&mut self) -> Result<Vec<EpochReport>, TrainingError> {
        self.train_with_shutdown(|| false)
    }

    /// Runs epochs until `max_epochs`; `should_stop` is polled between epochs.
    pub fn train_with_shutdown<F>(&mut self, mut should_stop: F) -> Result<Vec<EpochReport>, TrainingError>
    where
        F: FnMut() -> bool,
    {
        info!(
            "starting training at epoch {} of {} ({} training examples, vocab={})",
            self.state.epoch + 1,
            self.max_epochs,
            self.train_data.len(),
            self.vocab.len()
        );
        let mut reports = Vec::new();
        while self.state.epoch < self.max_epochs {
            if should_stop() {
                info!("stop requested; halting before epoch {}", self.state.epoch + 1);
                break;
            }
            reports.push(self.run_epoch()?);
        }
        self.sink.flush();
        Ok(reports)
    }

    fn run_epoch(&mut self) -> Result<EpochReport, TrainingError> {
        let epoch = self.state.epoch;
        let timer = EpochTimer::start();

        let hard_pool = self.hard_pool.take();
        let boosted = match (self.boosting.as_mut(), hard_pool) {
            (Some(boosting), Some(pool)) if boosting.builder.is_active(epoch) => {
                Some(boosting.builder.build(&self.train_data, pool))
            }
            _ => None,
        };
        // Only rank when a following epoch will consume the pool.
        let rank_percent = self
            .boosting
            .as_ref()
            .filter(|boosting| {
                epoch + 1 < self.max_epochs && boosting.builder.is_active(epoch + 1)
            })
            .map(|boosting| boosting.boost_percent);

        let stream = boosted.as_ref().unwrap_or(&self.train_data);
        let driver = EpochDriver::new(
            self.model.as_ref(),
            &self.criterion,
            &self.vocab,
            self.progress_bar,
        );
        let outcome = driver.train(
            stream.batches(epoch),
            self.optimizer.as_mut(),
            &mut self.state,
            self.sink.as_mut(),
            rank_percent,
        )?;
        let train_examples = stream.len();
        let train = outcome.summary;

        self.sink
            .add_scalar("train/avg_loss_per_epoch", train.loss_per_word, epoch);
        self.sink
            .add_scalar("train/avg_perplexity_epoch", train.perplexity, epoch);
        let (mins, secs) = minutes_seconds(timer.elapsed());
        info!(
            "Epoch: {:02} | Avg Train Loss: {:.4} | Perplexity: {:.4} | Time: {}m {}s",
            epoch + 1,
            train.loss_per_word,
            train.perplexity,
            mins,
            secs
        );

        let val_timer = EpochTimer::start();
        let validation = driver.validate(self.validation_data.batches(epoch))?;
        self.sink.add_scalar("val/loss", validation.loss_per_word, epoch);
        self.sink.add_scalar("val/perplexity", validation.perplexity, epoch);
        let (mins, secs) = minutes_seconds(val_timer.elapsed());
        info!(
            "Avg Val Loss: {:.4} | Val Perplexity: {:.4} | Time: {}m {}s",
            validation.loss_per_word, validation.perplexity, mins, secs
        );

        self.run_hooks(epoch);

        // Epoch bookkeeping is staged and only committed once the
        // checkpoint is on disk.
        let previous_lr = self.optimizer.learning_rate();
        let mut next_plateau = self.plateau.as_ref().map(|plateau| plateau.boxed_clone());
        let reduced_lr = next_plateau
            .as_mut()
            .and_then(|plateau| plateau.step(validation.loss_per_word, previous_lr));
        if let Some(lr) = reduced_lr {
            self.optimizer.set_learning_rate(lr);
        }
        let mut next_state = self.state.clone();
        let is_best = next_state.record_validation(validation.loss_per_word);
        next_state.epoch += 1;

        let saved = match checkpoint::save_checkpoint(SaveRequest {
            directory: &self.checkpoint_dir,
            state: &next_state,
            model: self.model.as_ref(),
            optimizer: self.optimizer.as_ref(),
            config: self.config.as_ref(),
            is_best,
        }) {
            Ok(saved) => saved,
            Err(err) => {
                if reduced_lr.is_some() {
                    self.optimizer.set_learning_rate(previous_lr);
                }
                return Err(err);
            }
        };

        if let Some(lr) = reduced_lr {
            info!("validation loss plateaued; learning rate -> {:.3e}", lr);
        }
        self.plateau = next_plateau;
        self.state = next_state;
        self.hard_pool = outcome.hard_pool;
        if is_best {
            info!("- Found new lowest loss!");
        }
        self.sink.flush();

        Ok(EpochReport {
            epoch,
            train,
            validation,
            is_best,
            train_examples,
            learning_rate: self.optimizer.learning_rate(),
            checkpoint: saved.path,
        })
    }

    /// Runs post-epoch hooks; a failing or panicking hook is only logged.
    fn run_hooks(&mut self, epoch: usize) {
        for hook in self.hooks.iter_mut() {
            let mut ctx = EpochContext {
                epoch,
                model: self.model.as_ref(),
                vocab: &self.vocab,
                validation: &self.validation_data,
                sink: self.sink.as_mut(),
            };
            let result = panic::catch_unwind(AssertUnwindSafe(|| hook.after_epoch(&mut ctx)));
            match result {
                Ok(Ok(())) => {}
                Ok(Err(err)) => warn!("epoch hook '{}' failed: {}", hook.name(), err),
                Err(_) => warn!("epoch hook '{}' panicked", hook.name()),
            }
        }
    }
}

fn select_device(kind: DeviceKind) -> Result<Device, TrainingError> {
    match kind {
        DeviceKind::Cpu => Ok(Device::Cpu),
        DeviceKind::Cuda => Device::new_cuda(0).map_err(|err| {
            TrainingError::initialization(format!("failed to initialize CUDA device: {err}"))
        }),
        DeviceKind::Metal => Device::new_metal(0).map_err(|err| {
            TrainingError::initialization(format!("failed to initialize Metal device: {err}"))
        }),
        DeviceKind::Auto => {
            if metal_is_available() {
                match Device::new_metal(0) {
                    Ok(device) => return Ok(device),
                    Err(err) => warn!("failed to initialize metal device, falling back: {err}"),
                }
            }
            if cuda_is_available() {
                match Device::new_cuda(0) {
                    Ok(device) => return Ok(device),
                    Err(err) => warn!("cuda reported available but initialization failed: {err}"),
                }
            }
            info!("no GPU backend available; using CPU");
            Ok(Device::Cpu)
        }
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use crate::{
        config::{BoostGrowth, PlateauConfig},
        optimizer::{AdamW, AdamWConfig},
        scheduler::ReduceOnPlateau,
    };

    use super::*;

    struct NullSink;

    impl MetricsSink for NullSink {
        fn add_scalar(&mut self, _tag: &str, _value: f64, _step: usize) {}
        fn add_text(&mut self, _tag: &str, _text: &str, _step: usize) {}
    }

    fn tokens(text: &str) -> Vec<String> {
        text.split_whitespace().map(str::to_string).collect()
    }

    fn corpus() -> Vec<TrainingExample> {
        [("a b", "x y"), ("b c", "y z"), ("c a", "z x"), ("a", "x"), ("b", "y")]
            .iter()
            .map(|(src, tgt)| TrainingExample::new(tokens(src), tokens(tgt)))
            .collect()
    }

    fn trainer(
        checkpoint_dir: PathBuf,
        boosting: BoostingConfig,
        plateau: Option<PlateauConfig>,
        max_epochs: usize,
    ) -> Trainer {
        let vocab = Arc::new(Vocab::from_tokens(tokens("a b c x y z")));
        let model = PooledContextModel::new(ModelConfig {
            vocab_size: vocab.len(),
            hidden_dim: 8,
            dtype: DType::F32,
            device: Device::Cpu,
            dropout_p: None,
        })
        .unwrap();
        let optimizer = AdamW::new(
            model.parameters(),
            AdamWConfig {
                learning_rate: 1e-2,
                beta1: 0.9,
                beta2: 0.98,
                epsilon: 1e-9,
                weight_decay: 0.0,
            },
            None,
        )
        .unwrap();
        let plateau = plateau.map(|config| {
            Box::new(ReduceOnPlateau::new(&config).unwrap()) as Box<dyn PlateauScheduler>
        });
        let criterion = NllLoss::new().with_ignore_index(Some(vocab.pad_id()));
        let train_data =
            BucketIterator::new(corpus(), Arc::clone(&vocab), Device::Cpu, 12, true, 7).unwrap();
        let validation_data =
            BucketIterator::new(corpus(), Arc::clone(&vocab), Device::Cpu, 12, false, 7).unwrap();

        Trainer::from_parts(TrainerParts {
            model: Box::new(model),
            optimizer: Box::new(optimizer),
            plateau,
            criterion,
            vocab,
            train_data,
            validation_data,
            boosting,
            checkpoint_dir,
            max_epochs,
            sink: Box::new(NullSink),
            progress_bar: false,
            config: None,
        })
    }

    fn boosting(boost_percent: f64) -> BoostingConfig {
        BoostingConfig {
            enabled: true,
            boost_percent,
            warmup_epochs: 0,
            growth: BoostGrowth::Accumulate,
            max_boosted_examples: None,
        }
    }

    #[test]
    fn final_epoch_builds_no_hard_pool() {
        let dir = tempfile::tempdir().unwrap();
        let mut trainer = trainer(dir.path().to_path_buf(), boosting(0.4), None, 2);

        let mut polls = 0;
        let first = trainer
            .train_with_shutdown(|| {
                polls += 1;
                polls > 1
            })
            .unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(trainer.hard_pool.as_ref().map(Vec::len), Some(2));

        let last = trainer.train().unwrap();
        assert_eq!(last.len(), 1);
        assert_eq!(last[0].train_examples, corpus().len() + 2);
        assert!(trainer.hard_pool.is_none());
    }

    #[test]
    fn failed_checkpoint_commits_no_epoch_bookkeeping() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("blocker");
        fs::write(&blocker, b"not a directory").unwrap();
        let plateau = PlateauConfig {
            factor: 0.5,
            patience: 0,
            threshold: 10.0,
            min_lr: 0.0,
            cooldown: 0,
        };
        let mut trainer = trainer(
            blocker.join("checkpoints"),
            boosting(0.4),
            Some(plateau),
            1,
        );
        let lr_before = trainer.optimizer().learning_rate();

        assert!(trainer.train().is_err());
        assert_eq!(trainer.state().epoch, 0);
        assert_eq!(trainer.state().best_val_loss, f64::INFINITY);
        assert_eq!(trainer.optimizer().learning_rate(), lr_before);
        assert!(trainer.hard_pool.is_none());

        trainer.checkpoint_dir = dir.path().join("checkpoints");
        let reports = trainer.train().unwrap();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].learning_rate, lr_before * 0.5);
        assert_eq!(trainer.state().epoch, 1);
        assert_eq!(trainer.state().best_val_loss, reports[0].validation.loss_per_word);
        assert!(reports[0].checkpoint.exists());
    }
}
