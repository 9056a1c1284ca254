pub mod config;
pub mod masks;
pub mod model;

pub use config::ModelConfig;
pub use masks::{build_causal_mask, build_source_mask, build_target_mask, MASK_DTYPE};
pub use model::{PooledContextModel, Seq2SeqInputs, Seq2SeqModel};
