pub mod config;
pub mod dataset;
pub mod error;
pub mod evaluate;
pub mod generate;
pub mod loader;
pub mod metrics;
pub mod model;
pub mod prompt;
pub mod tokenizer;

use anyhow::{Context, Result};
use candle_core::{DType, Device};
use tracing::{debug, info};

use crate::config::{EvalConfig, SpecialTokens};
use crate::metrics::EvalSummary;
use crate::model::{LlamaGenerator, LlamaModel};

pub struct Runtime {
    pub device: Device,
    pub dtype: DType,
}

impl Runtime {
    pub fn cpu_f32() -> Self {
        Self {
            device: Device::Cpu,
            dtype: DType::F32,
        }
    }

    /// CUDA 0 when available (unless `cpu`), half precision on GPU and f32 on
    /// CPU unless `dtype` overrides it.
    pub fn select(cpu: bool, dtype: Option<DType>) -> Result<Self> {
        let device = if cpu {
            Device::Cpu
        } else {
            Device::cuda_if_available(0).context("select device")?
        };
        let dtype = dtype.unwrap_or(if device.is_cuda() {
            DType::F16
        } else {
            DType::F32
        });
        Ok(Self { device, dtype })
    }
}

pub fn init(cfg: &EvalConfig, rt: &Runtime) -> Result<LlamaGenerator> {
    let special = SpecialTokens::default();
    debug!(device = ?rt.device, dtype = ?rt.dtype, ?special, "initializing runtime");
    let tokenizer =
        tokenizer::load_tokenizer(cfg.model_dir(), special).context("load tokenizer")?;
    let model = LlamaModel::load(cfg.model_dir(), &cfg.lora_checkpoint, special, rt)
        .with_context(|| {
            format!(
                "load {} with adapter {:?}",
                cfg.model_name, cfg.lora_checkpoint
            )
        })?;
    Ok(LlamaGenerator::new(model, tokenizer, cfg.seed))
}

pub fn run_evaluation(cfg: &EvalConfig, rt: &Runtime) -> Result<EvalSummary> {
    let generation = cfg.generation_config();
    generation.validate().context("generation config")?;
    let mut generator = init(cfg, rt)?;
    let examples = dataset::load_examples(&cfg.data_path).context("load dataset")?;
    info!(examples = examples.len(), path = ?cfg.data_path, "loaded dataset");
    evaluate::evaluate(&examples, &cfg.model_name, &mut generator, &generation)
}

pub fn run_predict(
    cfg: &EvalConfig,
    rt: &Runtime,
    instruction: &str,
    input: Option<&str>,
) -> Result<String> {
    let generation = cfg.predict_generation_config();
    generation.validate().context("generation config")?;
    let mut generator = init(cfg, rt)?;
    evaluate::predict(&mut generator, instruction, input, &generation)
}
