pub mod boost;
pub mod checkpoint;
pub mod config;
pub mod data;
pub mod decode;
pub mod epoch;
pub mod logging;
pub mod loss;
pub mod metrics;
pub mod optimizer;
pub mod ranker;
pub mod scheduler;
pub mod step;
pub mod trainer;

pub use boost::BoostedDatasetBuilder;
pub use checkpoint::{
    latest_checkpoint, load_checkpoint, save_checkpoint, EpochState, LoadedCheckpoint,
    SaveRequest,
};
pub use config::{TrainingConfig, TrainingError};
pub use data::{Batch, BucketIterator, TrainingExample, Vocab};
pub use decode::{EpochContext, EpochHook, GreedyDecoder, SampleTranslationHook};
pub use epoch::{EpochDriver, EpochOutcome};
pub use logging::{Logger, LoggingSettings, MetricsSink};
pub use loss::{LossOutput, NllLoss};
pub use metrics::LossSummary;
pub use optimizer::{build_optimizer, AdamW, Optimizer, OptimizerState, ScheduledOptimizer};
pub use ranker::DifficultyRanker;
pub use scheduler::{LRScheduler, NoamSchedule, PlateauScheduler, ReduceOnPlateau};
pub use step::{BatchStepExecutor, StepMode, StepOutput};
pub use trainer::{EpochReport, Trainer, TrainerParts};
