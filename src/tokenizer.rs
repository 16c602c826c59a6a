use std::path::Path;

use anyhow::{bail, Context, Result};
use tokenizers::Tokenizer;

use crate::config::SpecialTokens;

pub struct PromptTokenizer {
    inner: Tokenizer,
    special: SpecialTokens,
}

pub fn load_tokenizer(model_dir: &Path, special: SpecialTokens) -> Result<PromptTokenizer> {
    let tok_json = model_dir.join("tokenizer.json");
    if !tok_json.exists() {
        bail!(
            "missing tokenizer.json at {tok_json:?} (export the Llama tokenizer into the base model directory)"
        );
    }
    let inner = Tokenizer::from_file(&tok_json)
        .map_err(|e| anyhow::anyhow!("{e}"))
        .with_context(|| format!("load {tok_json:?}"))?;
    Ok(PromptTokenizer { inner, special })
}

impl PromptTokenizer {
    /// Encodes with special tokens; the sequence always starts with BOS.
    pub fn encode(&self, text: &str) -> Result<Vec<u32>> {
        let enc = self
            .inner
            .encode(text, true)
            .map_err(|e| anyhow::anyhow!("{e}"))?;
        let mut ids = enc.get_ids().to_vec();
        if ids.first() != Some(&self.special.bos) {
            ids.insert(0, self.special.bos);
        }
        Ok(ids)
    }

    /// Decodes, dropping special tokens and padding.
    pub fn decode(&self, ids: &[u32]) -> Result<String> {
        let kept: Vec<u32> = ids
            .iter()
            .copied()
            .filter(|&id| id != self.special.pad)
            .collect();
        self.inner
            .decode(&kept, true)
            .map_err(|e| anyhow::anyhow!("{e}"))
    }
}
