use std::path::PathBuf;

use anyhow::{Context, Result};
use candle_core::DType;
use clap::{Parser, ValueEnum};
use tracing::Level;

use recbeam::config::EvalConfig;
use recbeam::Runtime;

#[derive(Parser, Debug)]
#[command(
    name = "recbeam",
    version,
    about = "Hit@K / NDCG@K evaluation of a LoRA-tuned Llama recommender (Candle backend)"
)]
struct Args {
    /// Base model directory (config.json, tokenizer.json, safetensors).
    #[arg(long, default_value = "final_model")]
    model_name: String,

    /// PEFT adapter directory (adapter_config.json, adapter_model.safetensors).
    #[arg(long, default_value = "./mycheckpoint/checkpoint-12")]
    lora_checkpoint: PathBuf,

    /// JSON or JSON-lines dataset with instruction/input/output rows.
    #[arg(long, default_value = "train_data_copy.json", conflicts_with = "instruction")]
    data_path: PathBuf,

    /// Predict a single instruction instead of evaluating a dataset.
    #[arg(long)]
    instruction: Option<String>,

    #[arg(long, requires = "instruction")]
    input: Option<String>,

    #[arg(long, default_value_t = 0.1)]
    temperature: f64,

    #[arg(long, default_value_t = 0.75)]
    top_p: f64,

    #[arg(long, default_value_t = 40)]
    top_k: usize,

    #[arg(long, default_value_t = 4)]
    num_beams: usize,

    #[arg(long, default_value_t = 128)]
    max_new_tokens: usize,

    #[arg(long, default_value_t = 42)]
    seed: u64,

    /// Weight precision; defaults to f16 on GPU and f32 on CPU.
    #[arg(long, value_enum)]
    dtype: Option<Precision>,

    #[arg(long, default_value_t = false)]
    cpu: bool,

    /// Also write the summary JSON to this file.
    #[arg(long, conflicts_with = "instruction")]
    report: Option<PathBuf>,

    #[arg(long, value_enum, default_value_t = LogLevel::Info)]
    log_level: LogLevel,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Precision {
    F16,
    Bf16,
    F32,
}

impl From<Precision> for DType {
    fn from(value: Precision) -> Self {
        match value {
            Precision::F16 => DType::F16,
            Precision::Bf16 => DType::BF16,
            Precision::F32 => DType::F32,
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl From<LogLevel> for Level {
    fn from(value: LogLevel) -> Self {
        match value {
            LogLevel::Error => Level::ERROR,
            LogLevel::Warn => Level::WARN,
            LogLevel::Info => Level::INFO,
            LogLevel::Debug => Level::DEBUG,
            LogLevel::Trace => Level::TRACE,
        }
    }
}

impl Args {
    fn eval_config(&self) -> EvalConfig {
        EvalConfig {
            model_name: self.model_name.clone(),
            lora_checkpoint: self.lora_checkpoint.clone(),
            data_path: self.data_path.clone(),
            temperature: self.temperature,
            top_p: self.top_p,
            top_k: self.top_k,
            num_beams: self.num_beams,
            max_new_tokens: self.max_new_tokens,
            seed: self.seed,
        }
    }
}

fn main() -> Result<()> {
    let args = Args::parse();
    tracing_subscriber::fmt()
        .with_max_level(Level::from(args.log_level))
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cfg = args.eval_config();
    let rt = Runtime::select(args.cpu, args.dtype.map(DType::from))?;

    if let Some(instruction) = args.instruction.as_deref() {
        let out = recbeam::run_predict(&cfg, &rt, instruction, args.input.as_deref())?;
        print!("{out}");
        return Ok(());
    }

    let summary = recbeam::run_evaluation(&cfg, &rt)?;
    let line = serde_json::to_string(&summary).context("serialize summary")?;
    println!("{line}");
    if let Some(path) = &args.report {
        std::fs::write(path, format!("{line}\n")).with_context(|| format!("write {path:?}"))?;
    }
    Ok(())
}
