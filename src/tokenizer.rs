use anyhow::{Context, Result};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tiktoken_rs::{CoreBPE, cl100k_base, o200k_base};
use tracing::debug;

/// Tokenizer encoding families supported by the counter.
///
/// `o200k_base` covers the gpt-4o generation; `cl100k_base` covers
/// gpt-4/gpt-3.5 and the text-embedding-3 models.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Encoding {
    O200kBase,
    Cl100kBase,
}

fn encoding_for_model(model: &str) -> Encoding {
    if model.starts_with("gpt-4o")
        || model.starts_with("gpt-4.1")
        || model.starts_with("o1")
        || model.starts_with("o3")
    {
        Encoding::O200kBase
    } else {
        Encoding::Cl100kBase
    }
}

/// Deterministic token counter with cached BPE instances per encoding.
///
/// Loading a BPE vocabulary is expensive, so instances are built on first
/// use and shared afterwards. Counting itself never suspends.
pub struct TokenCounter {
    encodings: RwLock<HashMap<Encoding, Arc<CoreBPE>>>,
}

impl TokenCounter {
    pub fn new() -> Self {
        Self {
            encodings: RwLock::new(HashMap::new()),
        }
    }

    /// Count tokens in `text` under the encoding used by `model`.
    pub fn count(&self, model: &str, text: &str) -> Result<usize> {
        let bpe = self.bpe_for(encoding_for_model(model))?;
        Ok(bpe.encode_with_special_tokens(text).len())
    }

    fn bpe_for(&self, encoding: Encoding) -> Result<Arc<CoreBPE>> {
        if let Ok(cache) = self.encodings.read()
            && let Some(bpe) = cache.get(&encoding)
        {
            return Ok(bpe.clone());
        }

        let built = match encoding {
            Encoding::O200kBase => o200k_base().context("failed to load o200k_base encoding")?,
            Encoding::Cl100kBase => cl100k_base().context("failed to load cl100k_base encoding")?,
        };
        let bpe = Arc::new(built);
        debug!("loaded tokenizer encoding {:?}", encoding);

        let mut cache = self
            .encodings
            .write()
            .map_err(|e| anyhow::anyhow!("tokenizer cache lock poisoned: {}", e))?;
        let entry = cache.entry(encoding).or_insert_with(|| bpe.clone());
        Ok(entry.clone())
    }
}

impl Default for TokenCounter {
    fn default() -> Self {
        Self::new()
    }
}
