use std::{
    path::PathBuf,
    str::FromStr,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use clap::Parser;
use nmt_training::{Trainer, TrainingConfig, TrainingError};
use serde_json::{Map, Number, Value};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

fn main() {
    init_tracing();
    if let Err(err) = run() {
        eprintln!("training failed: {}", err);
        std::process::exit(1);
    }
}

fn init_tracing() {
    let env_filter = EnvFilter::builder()
        .with_default_directive(tracing::Level::INFO.into())
        .from_env_lossy();
    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Boosted sequence-to-sequence training CLI", long_about = None)]
struct Args {
    #[arg(
        short,
        long,
        value_name = "PATH",
        help = "Path to training config file (TOML or JSON)"
    )]
    config: PathBuf,

    #[arg(
        long = "override",
        value_name = "KEY=VALUE",
        help = "Override configuration value using dot-separated paths"
    )]
    overrides: Vec<OverrideArg>,

    #[arg(long, help = "Resume from the latest checkpoint if available")]
    resume: bool,

    #[arg(
        long,
        value_name = "PATH",
        conflicts_with = "resume",
        help = "Resume from a specific checkpoint file"
    )]
    checkpoint: Option<PathBuf>,
}

#[derive(Debug, Clone)]
struct OverrideArg {
    path: String,
    value: String,
}

impl FromStr for OverrideArg {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (path, value) = s
            .split_once('=')
            .ok_or_else(|| "override must be in the form key=value".to_string())?;
        if path.trim().is_empty() {
            return Err("override key must not be empty".into());
        }
        Ok(Self {
            path: path.trim().to_string(),
            value: value.trim().to_string(),
        })
    }
}

fn run() -> Result<(), TrainingError> {
    let args = Args::parse();

    let mut config = TrainingConfig::load(&args.config)?;
    if !args.overrides.is_empty() {
        config = apply_overrides(config, &args.overrides)?;
        config.validate()?;
    }

    let mut trainer = Trainer::new(config)?;

    if let Some(path) = args.checkpoint.as_deref() {
        trainer.resume_from(path)?;
    } else if args.resume && trainer.resume_from_latest()?.is_none() {
        info!(
            "no checkpoint found in {}; starting fresh",
            trainer.checkpoint_dir().display()
        );
    }

    let shutdown_flag = Arc::new(AtomicBool::new(false));
    let handler_flag = shutdown_flag.clone();
    ctrlc::set_handler(move || {
        handler_flag.store(true, Ordering::Relaxed);
    })
    .map_err(|err| TrainingError::runtime(format!("failed to install signal handler: {err}")))?;

    let reports = trainer.train_with_shutdown(|| shutdown_flag.load(Ordering::Relaxed))?;
    if let Some(best) = reports.iter().filter(|report| report.is_best).last() {
        info!(
            "best validation loss {:.4} after epoch {}",
            best.validation.loss_per_word,
            best.epoch + 1
        );
    }

    Ok(())
}

fn apply_overrides(
    config: TrainingConfig,
    overrides: &[OverrideArg],
) -> Result<TrainingConfig, TrainingError> {
    let mut value = serde_json::to_value(config).map_err(|err| {
        TrainingError::runtime(format!("failed to serialize config for overrides: {err}"))
    })?;

    for override_arg in overrides {
        let new_value = parse_override_value(&override_arg.value);
        set_value_at_path(&mut value, &override_arg.path, new_value)?;
    }

    serde_json::from_value(value).map_err(|err| {
        TrainingError::ConfigFormat(format!(
            "failed to deserialize config after overrides: {err}"
        ))
    })
}

fn parse_override_value(raw: &str) -> Value {
    let trimmed = raw.trim();
    if trimmed.eq_ignore_ascii_case("true") {
        return Value::Bool(true);
    }
    if trimmed.eq_ignore_ascii_case("false") {
        return Value::Bool(false);
    }
    if trimmed.eq_ignore_ascii_case("null") {
        return Value::Null;
    }
    if let Ok(int_val) = trimmed.parse::<i64>() {
        return Value::Number(Number::from(int_val));
    }
    if let Ok(float_val) = trimmed.parse::<f64>() {
        if let Some(number) = Number::from_f64(float_val) {
            return Value::Number(number);
        }
    }
    if trimmed.starts_with('[') || trimmed.starts_with('{') {
        if let Ok(json_val) = serde_json::from_str::<Value>(trimmed) {
            return json_val;
        }
    }
    Value::String(trimmed.to_string())
}

/// Sets `path` (e.g. `boosting.boost_percent`) inside `value`, creating
/// intermediate objects as needed.
fn set_value_at_path(value: &mut Value, path: &str, new_value: Value) -> Result<(), TrainingError> {
    let segments: Vec<&str> = path.split('.').map(str::trim).collect();
    if segments.iter().any(|segment| segment.is_empty()) {
        return Err(TrainingError::ConfigFormat(format!(
            "invalid override path '{path}'"
        )));
    }

    let (last, parents) = match segments.split_last() {
        Some(split) => split,
        None => {
            return Err(TrainingError::ConfigFormat(
                "override path must not be empty".to_string(),
            ))
        }
    };

    let mut current = value;
    for segment in parents {
        current = object_mut(current, segment)?
            .entry(segment.to_string())
            .or_insert(Value::Null);
    }
    object_mut(current, last)?.insert(last.to_string(), new_value);
    Ok(())
}

fn object_mut<'v>(value: &'v mut Value, segment: &str) -> Result<&'v mut Map<String, Value>, TrainingError> {
    if value.is_null() {
        *value = Value::Object(Map::new());
    }
    value.as_object_mut().ok_or_else(|| {
        TrainingError::ConfigFormat(format!(
            "override path segment '{segment}' points into a non-object value"
        ))
    })
}
