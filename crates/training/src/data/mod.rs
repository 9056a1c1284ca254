use std::{
    fs::File,
    io::{BufRead, BufReader},
    path::Path,
};

use candle_core::{Device, Tensor};
use tracing::{debug, info};

use crate::{config::to_runtime_error, TrainingError};

pub mod bucket;
pub mod vocab;

pub use bucket::{BucketIterator, EpochBatches};
pub use vocab::{Vocab, BOS_TOKEN, EOS_TOKEN, PAD_TOKEN, UNK_TOKEN};

/// Result alias for data pipeline fallible operations.
pub type Result<T> = std::result::Result<T, TrainingError>;

/// One source/target sentence pair, compared and hashed by value.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TrainingExample {
    source: Vec<String>,
    target: Vec<String>,
}

impl TrainingExample {
    pub fn new(source: Vec<String>, target: Vec<String>) -> Self {
        Self { source, target }
    }

    pub fn source(&self) -> &[String] {
        &self.source
    }

    pub fn target(&self) -> &[String] {
        &self.target
    }
}

/// Padded id matrices for a group of examples, ready for a forward pass.
#[derive(Debug)]
pub struct Batch {
    /// `[batch, src_len]` u32 ids, `<s>`/`</s>` wrapped and right padded.
    pub src: Tensor,
    pub src_lengths: Vec<usize>,
    /// `[batch, tgt_len]` u32 ids, `<s>`/`</s>` wrapped and right padded.
    pub tgt: Tensor,
    pub tgt_lengths: Vec<usize>,
    pub examples: Vec<TrainingExample>,
}

impl Batch {
    pub fn from_examples(
        examples: Vec<TrainingExample>,
        vocab: &Vocab,
        device: &Device,
    ) -> Result<Self> {
        if examples.is_empty() {
            return Err(TrainingError::runtime("cannot build an empty batch"));
        }
        let sources: Vec<Vec<u32>> = examples
            .iter()
            .map(|ex| vocab.numericalize(ex.source()))
            .collect();
        let targets: Vec<Vec<u32>> = examples
            .iter()
            .map(|ex| vocab.numericalize(ex.target()))
            .collect();

        let (src, src_lengths) = pad_rows(&sources, vocab.pad_id(), device)?;
        let (tgt, tgt_lengths) = pad_rows(&targets, vocab.pad_id(), device)?;

        Ok(Self {
            src,
            src_lengths,
            tgt,
            tgt_lengths,
            examples,
        })
    }

    pub fn size(&self) -> usize {
        self.examples.len()
    }
}

fn pad_rows(rows: &[Vec<u32>], pad_id: u32, device: &Device) -> Result<(Tensor, Vec<usize>)> {
    let lengths: Vec<usize> = rows.iter().map(Vec::len).collect();
    let width = lengths.iter().copied().max().unwrap_or(0);
    let mut data = Vec::with_capacity(rows.len() * width);
    for row in rows {
        data.extend_from_slice(row);
        data.extend(std::iter::repeat(pad_id).take(width - row.len()));
    }
    let tensor = Tensor::from_vec(data, (rows.len(), width), device).map_err(to_runtime_error)?;
    Ok((tensor, lengths))
}

/// Options applied while reading a parallel corpus.
#[derive(Debug, Clone, Default)]
pub struct CorpusOptions {
    /// Pairs with either side longer than this many tokens are dropped.
    pub max_len: Option<usize>,
    pub lowercase: bool,
}

/// Reads line-aligned source and target files into examples.
///
/// Lines are split on whitespace. Pairs where either side is empty are
/// skipped; differing line counts are an initialization error.
pub fn load_parallel_corpus(
    source: &Path,
    target: &Path,
    options: &CorpusOptions,
) -> Result<Vec<TrainingExample>> {
    let source_lines = read_lines(source)?;
    let target_lines = read_lines(target)?;
    if source_lines.len() != target_lines.len() {
        return Err(TrainingError::initialization(format!(
            "{} has {} lines but {} has {}",
            source.display(),
            source_lines.len(),
            target.display(),
            target_lines.len()
        )));
    }

    let mut examples = Vec::with_capacity(source_lines.len());
    let mut filtered = 0usize;
    for (src_line, tgt_line) in source_lines.into_iter().zip(target_lines) {
        let src = tokenize(&src_line, options.lowercase);
        let tgt = tokenize(&tgt_line, options.lowercase);
        if src.is_empty() || tgt.is_empty() {
            filtered += 1;
            continue;
        }
        if let Some(max_len) = options.max_len {
            if src.len() > max_len || tgt.len() > max_len {
                filtered += 1;
                continue;
            }
        }
        examples.push(TrainingExample::new(src, tgt));
    }

    info!(
        "loaded {} examples from {} ({} filtered)",
        examples.len(),
        source.display(),
        filtered
    );
    Ok(examples)
}

fn read_lines(path: &Path) -> Result<Vec<String>> {
    let file = File::open(path).map_err(|err| {
        TrainingError::initialization(format!("failed to open {}: {err}", path.display()))
    })?;
    let lines = BufReader::new(file)
        .lines()
        .collect::<std::io::Result<Vec<_>>>()?;
    debug!("read {} lines from {}", lines.len(), path.display());
    Ok(lines)
}

fn tokenize(line: &str, lowercase: bool) -> Vec<String> {
    line.split_whitespace()
        .map(|token| {
            if lowercase {
                token.to_lowercase()
            } else {
                token.to_string()
            }
        })
        .collect()
}
