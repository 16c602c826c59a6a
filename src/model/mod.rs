use std::path::Path;

use anyhow::{bail, Context, Result};
use candle_core::{DType, Device, Tensor};
use candle_nn::VarBuilder;
use candle_transformers::models::llama::{Cache, Config, Llama, LlamaEosToks};
use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::{debug, info};

use crate::config::{self, GenerationConfig, SpecialTokens};
use crate::generate::{beam_sample, CandidateGenerator, StepModel};
use crate::loader;
use crate::tokenizer::PromptTokenizer;
use crate::Runtime;

pub mod lora;

/// Base Llama with the adapter folded into its weights. Read-only after load.
pub struct LlamaModel {
    llama: Llama,
    config: Config,
    device: Device,
    dtype: DType,
    eos: u32,
}

impl LlamaModel {
    pub fn load(
        model_dir: &Path,
        adapter_dir: &Path,
        special: SpecialTokens,
        rt: &Runtime,
    ) -> Result<Self> {
        let spec = config::load_llama_config(model_dir).context("load config.json")?;
        let mut llama_cfg = spec.into_config(false);
        llama_cfg.bos_token_id = Some(special.bos);
        llama_cfg.eos_token_id = Some(LlamaEosToks::Single(special.eos));

        let mut weights =
            loader::load_base_weights(model_dir, &rt.device).context("load base weights")?;
        let adapter_cfg =
            config::load_adapter_config(adapter_dir).context("load adapter config")?;
        debug!(?adapter_cfg, "loaded adapter config");
        let adapter = loader::load_adapter_weights(adapter_dir, &rt.device)
            .context("load adapter weights")?;
        let merged = lora::merge_adapter(&mut weights, adapter, &adapter_cfg, rt.dtype)
            .context("merge adapter")?;
        info!(
            merged,
            r = adapter_cfg.r,
            alpha = adapter_cfg.lora_alpha,
            "adapter merged into base weights"
        );

        let vb = VarBuilder::from_tensors(weights, rt.dtype, &rt.device);
        let llama = Llama::load(vb, &llama_cfg).context("build llama")?;
        Ok(Self {
            llama,
            config: llama_cfg,
            device: rt.device.clone(),
            dtype: rt.dtype,
            eos: special.eos,
        })
    }

    pub fn n_ctx(&self) -> usize {
        self.config.max_position_embeddings
    }
}

impl StepModel for LlamaModel {
    type State = Cache;

    fn start(&self) -> Result<Cache> {
        Cache::new(true, self.dtype, &self.config, &self.device).context("create kv cache")
    }

    fn step(&self, tokens: &[u32], index_pos: usize, cache: &mut Cache) -> Result<Vec<f32>> {
        if tokens.is_empty() {
            bail!("input_ids is empty");
        }
        let total_len = index_pos + tokens.len();
        if total_len > self.n_ctx() {
            bail!("total_len {total_len} exceeds n_ctx {}", self.n_ctx());
        }
        let input = Tensor::new(tokens, &self.device)
            .context("create input_ids tensor")?
            .unsqueeze(0)?;
        let logits = self
            .llama
            .forward(&input, index_pos, cache)
            .context("llama forward")?;
        let logits = logits.squeeze(0)?.to_dtype(DType::F32)?;
        logits.to_vec1().context("logits to_vec1")
    }

    fn eos_token_id(&self) -> u32 {
        self.eos
    }
}

/// Tokenize, beam-sample, decode. The RNG is seeded once per run and advances
/// across calls.
pub struct LlamaGenerator {
    model: LlamaModel,
    tokenizer: PromptTokenizer,
    rng: StdRng,
}

impl LlamaGenerator {
    pub fn new(model: LlamaModel, tokenizer: PromptTokenizer, seed: u64) -> Self {
        Self {
            model,
            tokenizer,
            rng: StdRng::seed_from_u64(seed),
        }
    }
}

impl CandidateGenerator for LlamaGenerator {
    fn generate(&mut self, prompt: &str, cfg: &GenerationConfig) -> Result<Vec<String>> {
        let ids = self.tokenizer.encode(prompt).context("tokenize prompt")?;
        let need = ids.len() + cfg.max_new_tokens;
        if need > self.model.n_ctx() {
            bail!(
                "prompt too long for context window ({} + {} > {})",
                ids.len(),
                cfg.max_new_tokens,
                self.model.n_ctx()
            );
        }
        let sequences =
            beam_sample(&self.model, &ids, cfg, &mut self.rng).context("beam search")?;
        sequences
            .iter()
            .map(|seq| self.tokenizer.decode(seq).context("decode beam"))
            .collect()
    }
}
