use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use candle_transformers::models::llama::LlamaConfig;
use serde::Deserialize;

/// Run configuration. Defaults reproduce the reference checkpoint evaluation.
#[derive(Debug, Clone)]
pub struct EvalConfig {
    pub model_name: String,
    pub lora_checkpoint: PathBuf,
    pub data_path: PathBuf,
    pub temperature: f64,
    pub top_p: f64,
    pub top_k: usize,
    pub num_beams: usize,
    pub max_new_tokens: usize,
    pub seed: u64,
}

impl Default for EvalConfig {
    fn default() -> Self {
        Self {
            model_name: "final_model".to_string(),
            lora_checkpoint: PathBuf::from("./mycheckpoint/checkpoint-12"),
            data_path: PathBuf::from("train_data_copy.json"),
            temperature: 0.1,
            top_p: 0.75,
            top_k: 40,
            num_beams: 4,
            max_new_tokens: 128,
            seed: 42,
        }
    }
}

impl EvalConfig {
    pub fn model_dir(&self) -> &Path {
        Path::new(&self.model_name)
    }

    /// Beam-sample search returning every beam, as used for ranking.
    pub fn generation_config(&self) -> GenerationConfig {
        GenerationConfig {
            temperature: self.temperature,
            top_p: self.top_p,
            top_k: self.top_k,
            num_beams: self.num_beams,
            num_return_sequences: self.num_beams,
            do_sample: true,
            max_new_tokens: self.max_new_tokens,
            length_penalty: 1.0,
        }
    }

    /// Single-prompt prediction runs plain beam search.
    pub fn predict_generation_config(&self) -> GenerationConfig {
        GenerationConfig {
            do_sample: false,
            ..self.generation_config()
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct GenerationConfig {
    pub temperature: f64,
    pub top_p: f64,
    pub top_k: usize,
    pub num_beams: usize,
    pub num_return_sequences: usize,
    pub do_sample: bool,
    pub max_new_tokens: usize,
    pub length_penalty: f64,
}

impl GenerationConfig {
    pub fn validate(&self) -> Result<()> {
        if self.num_beams == 0 {
            bail!("num_beams must be at least 1");
        }
        if self.num_return_sequences == 0 || self.num_return_sequences > self.num_beams {
            bail!(
                "num_return_sequences {} must be in 1..={}",
                self.num_return_sequences,
                self.num_beams
            );
        }
        if self.do_sample {
            if !(self.top_p > 0.0 && self.top_p <= 1.0) {
                bail!("top_p {} must be in (0, 1]", self.top_p);
            }
            if self.temperature <= 0.0 {
                bail!("temperature {} must be positive when sampling", self.temperature);
            }
        }
        Ok(())
    }
}

/// Token ids forced onto the tokenizer and model (pad shares the unk id).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpecialTokens {
    pub pad: u32,
    pub bos: u32,
    pub eos: u32,
}

impl Default for SpecialTokens {
    fn default() -> Self {
        Self {
            pad: 0,
            bos: 1,
            eos: 2,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AdapterConfig {
    pub r: usize,
    pub lora_alpha: f64,
    #[serde(default)]
    pub target_modules: Vec<String>,
    #[serde(default)]
    pub fan_in_fan_out: bool,
}

impl AdapterConfig {
    pub fn scaling(&self) -> f64 {
        self.lora_alpha / self.r as f64
    }

    /// Whether `weight_key` (e.g. `model.layers.0.self_attn.q_proj.weight`)
    /// belongs to a listed target module. An empty list accepts everything.
    pub fn targets(&self, weight_key: &str) -> bool {
        if self.target_modules.is_empty() {
            return true;
        }
        let module = weight_key.strip_suffix(".weight").unwrap_or(weight_key);
        self.target_modules
            .iter()
            .any(|t| module == t || module.ends_with(&format!(".{t}")))
    }
}

pub fn load_llama_config(model_dir: &Path) -> Result<LlamaConfig> {
    let path = model_dir.join("config.json");
    let bytes = std::fs::read(&path).with_context(|| format!("read {path:?}"))?;
    let spec: LlamaConfig =
        serde_json::from_slice(&bytes).with_context(|| format!("parse {path:?}"))?;
    Ok(spec)
}

pub fn load_adapter_config(adapter_dir: &Path) -> Result<AdapterConfig> {
    let path = adapter_dir.join("adapter_config.json");
    let bytes = std::fs::read(&path).with_context(|| format!("read {path:?}"))?;
    let cfg: AdapterConfig =
        serde_json::from_slice(&bytes).with_context(|| format!("parse {path:?}"))?;
    if cfg.r == 0 {
        bail!("adapter rank r must be positive in {path:?}");
    }
    Ok(cfg)
}
