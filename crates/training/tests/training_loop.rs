use std::{
    fs,
    path::Path,
    sync::{Arc, Mutex},
};

use nmt_training::{
    checkpoint::{self, BEST_CHECKPOINT_FILENAME},
    config::LearningRateSchedule,
    decode::TRANSLATION_TAG,
    EpochContext, EpochHook, MetricsSink, Trainer, TrainingConfig, TrainingError,
};
use tempfile::{tempdir, TempDir};

const SUBJECTS: [&str; 4] = ["the cat", "a dog", "my bird", "one fox"];
const VERBS: [&str; 3] = ["sees", "likes", "finds"];
const OBJECTS: [&str; 2] = ["the house", "a tree"];

fn write_corpus(dir: &Path) {
    let mut source = Vec::new();
    let mut target = Vec::new();
    for (s, subject) in SUBJECTS.iter().enumerate() {
        for (v, verb) in VERBS.iter().enumerate() {
            for (o, object) in OBJECTS.iter().enumerate() {
                source.push(format!("{subject} {verb} {object}"));
                target.push(format!("s{s} v{v} o{o} ."));
            }
        }
    }
    fs::write(dir.join("train.src"), source.join("\n")).expect("write train.src");
    fs::write(dir.join("train.tgt"), target.join("\n")).expect("write train.tgt");
    fs::write(dir.join("valid.src"), source[..8].join("\n")).expect("write valid.src");
    fs::write(dir.join("valid.tgt"), target[..8].join("\n")).expect("write valid.tgt");
}

fn corpus_size() -> usize {
    SUBJECTS.len() * VERBS.len() * OBJECTS.len()
}

fn write_config(dir: &Path, extra: &str) -> TrainingConfig {
    let config = format!(
        r#"
[data]
train_source = "train.src"
train_target = "train.tgt"
validation_source = "valid.src"
validation_target = "valid.tgt"
batch_tokens = 30

[vocab]
min_freq = 1

[model]
hidden_size = 16
dropout = 0.0

[optimizer]
learning_rate = 0.01

[runtime]
seed = 7
max_epochs = 3

[runtime.checkpoint]
directory = "checkpoints"

[runtime.decode]
enabled = true
every_n_epochs = 1
num_translations = 2
max_len = 6

[runtime.logging]
enable_stdout = false
progress_bar = false

{extra}
"#
    );
    let path = dir.join("config.toml");
    fs::write(&path, config).expect("write config");
    TrainingConfig::load(&path).expect("load config")
}

fn workspace(extra: &str) -> (TempDir, TrainingConfig) {
    let dir = tempdir().expect("tempdir");
    write_corpus(dir.path());
    let config = write_config(dir.path(), extra);
    (dir, config)
}

#[derive(Default)]
struct Recorded {
    scalars: Vec<(String, f64, usize)>,
    texts: Vec<(String, String, usize)>,
}

impl Recorded {
    fn scalars(&self, tag: &str) -> Vec<(f64, usize)> {
        self.scalars
            .iter()
            .filter(|(t, _, _)| t == tag)
            .map(|(_, value, step)| (*value, *step))
            .collect()
    }
}

#[derive(Clone, Default)]
struct RecordingSink(Arc<Mutex<Recorded>>);

impl MetricsSink for RecordingSink {
    fn add_scalar(&mut self, tag: &str, value: f64, step: usize) {
        self.0
            .lock()
            .unwrap()
            .scalars
            .push((tag.to_string(), value, step));
    }

    fn add_text(&mut self, tag: &str, text: &str, step: usize) {
        self.0
            .lock()
            .unwrap()
            .texts
            .push((tag.to_string(), text.to_string(), step));
    }
}

#[test]
fn trains_checkpoints_and_resumes() {
    let (dir, config) = workspace("");
    let mut trainer = Trainer::new(config.clone()).expect("trainer");
    let sink = RecordingSink::default();
    trainer.set_metrics_sink(Box::new(sink.clone()));

    let initial = trainer.evaluate().expect("initial evaluation");
    assert!(initial.loss_per_word.is_finite());
    assert_eq!(initial.tokens, 8 * 5);

    let reports = trainer.train().expect("training");
    assert_eq!(reports.len(), 3);
    assert!(reports[0].is_best);
    for (index, report) in reports.iter().enumerate() {
        assert_eq!(report.epoch, index);
        assert_eq!(report.train_examples, corpus_size());
        assert_eq!(report.train.tokens as usize, corpus_size() * 5);
        assert!(report.validation.perplexity >= 1.0);
        assert!(report.checkpoint.ends_with(format!("epoch_{}.safetensors", index + 1)));
        assert!(report.checkpoint.exists());
    }
    let checkpoints = dir.path().join("checkpoints");
    assert!(checkpoints.join(BEST_CHECKPOINT_FILENAME).exists());
    assert_eq!(
        checkpoint::latest_checkpoint(&checkpoints).expect("scan"),
        Some(checkpoints.join("epoch_3.safetensors"))
    );

    let final_loss = trainer.evaluate().expect("final evaluation");
    assert!(final_loss.loss_per_word < initial.loss_per_word);
    assert_eq!(trainer.state().epoch, 3);
    let best = reports
        .iter()
        .map(|report| report.validation.loss_per_word)
        .fold(f64::INFINITY, f64::min);
    assert_eq!(trainer.state().best_val_loss, best);

    {
        let recorded = sink.0.lock().unwrap();
        let val_steps: Vec<usize> = recorded.scalars("val/loss").iter().map(|(_, s)| *s).collect();
        assert_eq!(val_steps, vec![0, 1, 2]);
        let per_iteration = recorded.scalars("train/loss_per_iteration");
        assert_eq!(per_iteration.len(), trainer.state().iterations);
        assert_eq!(per_iteration.last().map(|(_, step)| *step), Some(trainer.state().iterations));
        let translations: Vec<usize> = recorded
            .texts
            .iter()
            .filter(|(tag, _, _)| tag == TRANSLATION_TAG)
            .map(|(_, _, step)| *step)
            .collect();
        assert_eq!(translations, vec![0, 0, 1, 1, 2, 2]);
    }

    let mut resumed = Trainer::new(config).expect("second trainer");
    resumed.set_metrics_sink(Box::new(RecordingSink::default()));
    let loaded = resumed
        .resume_from_latest()
        .expect("resume")
        .expect("checkpoint present");
    assert!(loaded.config_sha256.is_some());
    assert_eq!(resumed.state(), trainer.state());
    let restored = resumed.evaluate().expect("resumed evaluation");
    assert!((restored.loss_per_word - final_loss.loss_per_word).abs() < 1e-9);
    assert!(resumed.train().expect("nothing left").is_empty());
}

#[test]
fn boosting_appends_hard_examples_after_warmup() {
    let (_dir, config) = workspace(
        r#"
[boosting]
enabled = true
boost_percent = 0.25
warmup_epochs = 1
"#,
    );
    let mut trainer = Trainer::new(config).expect("trainer");
    trainer.set_metrics_sink(Box::new(RecordingSink::default()));

    let reports = trainer.train().expect("training");
    let sizes: Vec<usize> = reports.iter().map(|report| report.train_examples).collect();
    let hard = corpus_size() / 4;
    assert_eq!(sizes, vec![corpus_size(), corpus_size() + hard, corpus_size() + 2 * hard]);
    // Boosted copies carry target tokens too.
    assert_eq!(reports[1].train.tokens as usize, (corpus_size() + hard) * 5);
}

#[test]
fn reset_growth_keeps_only_the_latest_pool() {
    let (_dir, config) = workspace(
        r#"
[boosting]
enabled = true
boost_percent = 0.5
warmup_epochs = 1
growth = "reset_each_epoch"
"#,
    );
    let mut trainer = Trainer::new(config).expect("trainer");
    trainer.set_metrics_sink(Box::new(RecordingSink::default()));

    let sizes: Vec<usize> = trainer
        .train()
        .expect("training")
        .iter()
        .map(|report| report.train_examples)
        .collect();
    let hard = corpus_size() / 2;
    assert_eq!(sizes, vec![corpus_size(), corpus_size() + hard, corpus_size() + hard]);
}

#[test]
fn stop_request_halts_between_epochs() {
    let (dir, config) = workspace("");
    let mut trainer = Trainer::new(config).expect("trainer");
    trainer.set_metrics_sink(Box::new(RecordingSink::default()));

    let mut polls = 0;
    let reports = trainer
        .train_with_shutdown(|| {
            polls += 1;
            polls > 1
        })
        .expect("training");
    assert_eq!(reports.len(), 1);
    assert_eq!(trainer.state().epoch, 1);
    let checkpoints = dir.path().join("checkpoints");
    assert!(checkpoints.join("epoch_1.safetensors").exists());
    assert!(!checkpoints.join("epoch_2.safetensors").exists());
}

struct FailingHook;

impl EpochHook for FailingHook {
    fn name(&self) -> &str {
        "failing"
    }

    fn after_epoch(&mut self, _ctx: &mut EpochContext<'_>) -> Result<(), TrainingError> {
        Err(TrainingError::runtime("hook failure"))
    }
}

struct PanickingHook;

impl EpochHook for PanickingHook {
    fn name(&self) -> &str {
        "panicking"
    }

    fn after_epoch(&mut self, _ctx: &mut EpochContext<'_>) -> Result<(), TrainingError> {
        panic!("hook panic");
    }
}

/// Records which epochs it observed.
struct CountingHook(Arc<Mutex<Vec<usize>>>);

impl EpochHook for CountingHook {
    fn name(&self) -> &str {
        "counting"
    }

    fn after_epoch(&mut self, ctx: &mut EpochContext<'_>) -> Result<(), TrainingError> {
        self.0.lock().unwrap().push(ctx.epoch);
        ctx.sink.add_text("hooks/counting", "seen", ctx.epoch);
        Ok(())
    }
}

#[test]
fn failing_hooks_do_not_abort_training() {
    let (_dir, config) = workspace("");
    let mut trainer = Trainer::new(config).expect("trainer");
    let sink = RecordingSink::default();
    trainer.set_metrics_sink(Box::new(sink.clone()));
    let seen = Arc::new(Mutex::new(Vec::new()));
    trainer.add_hook(Box::new(FailingHook));
    trainer.add_hook(Box::new(PanickingHook));
    trainer.add_hook(Box::new(CountingHook(Arc::clone(&seen))));

    let reports = trainer.train().expect("training survives hooks");
    assert_eq!(reports.len(), 3);
    assert_eq!(*seen.lock().unwrap(), vec![0, 1, 2]);
    let counted = sink
        .0
        .lock()
        .unwrap()
        .texts
        .iter()
        .filter(|(tag, _, _)| tag == "hooks/counting")
        .count();
    assert_eq!(counted, 3);
}

#[test]
fn noam_schedule_logs_a_rate_every_iteration() {
    let (_dir, config) = workspace(
        r#"
[optimizer.noam]
factor = 1.0
warmup_steps = 4
"#,
    );
    let mut config = config;
    config.optimizer.schedule = LearningRateSchedule::Noam;
    let mut trainer = Trainer::new(config).expect("trainer");
    let sink = RecordingSink::default();
    trainer.set_metrics_sink(Box::new(sink.clone()));

    let reports = trainer.train().expect("training");
    let lr = sink.0.lock().unwrap().scalars("train/lr");
    assert_eq!(lr.len(), trainer.state().iterations);
    assert!(lr.iter().all(|(value, _)| *value > 0.0));
    assert!((reports[2].learning_rate - lr[lr.len() - 1].0).abs() < 1e-12);
}

#[test]
fn plateau_halves_a_constant_rate() {
    let (_dir, config) = workspace(
        r#"
[scheduler]
factor = 0.5
patience = 0
threshold = 10.0
"#,
    );
    let mut trainer = Trainer::new(config).expect("trainer");
    let sink = RecordingSink::default();
    trainer.set_metrics_sink(Box::new(sink.clone()));

    // No epoch can beat a relative threshold above 1, so every epoch reduces.
    let rates: Vec<f64> = trainer
        .train()
        .expect("training")
        .iter()
        .map(|report| report.learning_rate)
        .collect();
    let base = f64::from(0.01f32);
    for (rate, expected) in rates.iter().zip([base / 2.0, base / 4.0, base / 8.0]) {
        assert!((rate - expected).abs() < 1e-12, "{rate} != {expected}");
    }
    assert!(sink.0.lock().unwrap().scalars("train/lr").is_empty());
}

#[test]
fn missing_corpus_is_an_initialization_error() {
    let dir = tempdir().expect("tempdir");
    write_corpus(dir.path());
    let config = write_config(dir.path(), "");
    fs::remove_file(dir.path().join("train.tgt")).expect("remove");
    assert!(Trainer::new(config).is_err());
}
