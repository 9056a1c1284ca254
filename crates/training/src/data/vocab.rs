use std::collections::HashMap;

use super::TrainingExample;

pub const UNK_TOKEN: &str = "<unk>";
pub const PAD_TOKEN: &str = "<pad>";
pub const BOS_TOKEN: &str = "<s>";
pub const EOS_TOKEN: &str = "</s>";

const SPECIALS: [&str; 4] = [UNK_TOKEN, PAD_TOKEN, BOS_TOKEN, EOS_TOKEN];

/// Token table shared by source and target sides.
///
/// Specials occupy the first four ids in a fixed order: `<unk>`, `<pad>`,
/// `<s>`, `</s>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Vocab {
    itos: Vec<String>,
    stoi: HashMap<String, u32>,
}

impl Vocab {
    /// Counts tokens across both sides of `examples`, keeps those seen at
    /// least `min_freq` times, most frequent first with lexicographic ties.
    pub fn build<'a, I>(examples: I, min_freq: usize, max_size: Option<usize>) -> Self
    where
        I: IntoIterator<Item = &'a TrainingExample>,
    {
        let mut counts: HashMap<&'a str, usize> = HashMap::new();
        for example in examples {
            for token in example.source().iter().chain(example.target()) {
                *counts.entry(token.as_str()).or_insert(0) += 1;
            }
        }

        let mut ranked: Vec<(&str, usize)> = counts
            .into_iter()
            .filter(|(token, count)| *count >= min_freq.max(1) && !SPECIALS.contains(token))
            .collect();
        ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(b.0)));
        if let Some(limit) = max_size {
            ranked.truncate(limit);
        }

        Self::from_tokens(ranked.into_iter().map(|(token, _)| token.to_string()))
    }

    /// Builds a table from an explicit token list; specials are prepended and
    /// duplicates ignored.
    pub fn from_tokens<I>(tokens: I) -> Self
    where
        I: IntoIterator<Item = String>,
    {
        let mut vocab = Self {
            itos: Vec::new(),
            stoi: HashMap::new(),
        };
        for special in SPECIALS {
            vocab.push(special.to_string());
        }
        for token in tokens {
            vocab.push(token);
        }
        vocab
    }

    fn push(&mut self, token: String) {
        if self.stoi.contains_key(&token) {
            return;
        }
        self.stoi.insert(token.clone(), self.itos.len() as u32);
        self.itos.push(token);
    }

    pub fn len(&self) -> usize {
        self.itos.len()
    }

    pub fn is_empty(&self) -> bool {
        self.itos.is_empty()
    }

    pub fn unk_id(&self) -> u32 {
        0
    }

    pub fn pad_id(&self) -> u32 {
        1
    }

    pub fn bos_id(&self) -> u32 {
        2
    }

    pub fn eos_id(&self) -> u32 {
        3
    }

    pub fn token_to_id(&self, token: &str) -> u32 {
        self.stoi.get(token).copied().unwrap_or(self.unk_id())
    }

    pub fn id_to_token(&self, id: u32) -> &str {
        self.itos
            .get(id as usize)
            .map(String::as_str)
            .unwrap_or(UNK_TOKEN)
    }

    /// `<s>` + ids + `</s>`.
    pub fn numericalize(&self, tokens: &[String]) -> Vec<u32> {
        let mut ids = Vec::with_capacity(tokens.len() + 2);
        ids.push(self.bos_id());
        ids.extend(tokens.iter().map(|token| self.token_to_id(token)));
        ids.push(self.eos_id());
        ids
    }

    /// Maps ids back to tokens up to the first `</s>`, dropping the leading
    /// start symbol.
    pub fn reverse_tokenize(&self, ids: &[u32]) -> Vec<String> {
        ids.iter()
            .take_while(|&&id| id != self.eos_id())
            .skip(1)
            .map(|&id| self.id_to_token(id).to_string())
            .collect()
    }
}
