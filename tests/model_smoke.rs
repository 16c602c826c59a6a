mod common;

use anyhow::{bail, Result};
use recbeam::config::{EvalConfig, SpecialTokens};
use recbeam::generate::StepModel;
use recbeam::model::LlamaModel;
use recbeam::prompt::{generate_prompt, RESPONSE_MARKER};
use recbeam::tokenizer::load_tokenizer;
use recbeam::Runtime;

#[test]
#[ignore = "requires a local Llama base model and LoRA adapter"]
fn tokenizer_prepends_bos_and_round_trips_prompt() -> Result<()> {
    let Some((model_dir, _)) = common::maybe_model_dirs() else {
        eprintln!("SKIP: set RECBEAM_MODEL_DIR and RECBEAM_ADAPTER_DIR to run this test");
        return Ok(());
    };
    let special = SpecialTokens::default();
    let tok = load_tokenizer(&model_dir, special)?;
    let prompt = generate_prompt("Recommend the next item.", Some("A, B"));
    let ids = tok.encode(&prompt)?;
    assert_eq!(ids.first(), Some(&special.bos));
    let text = tok.decode(&ids)?;
    assert!(text.contains(RESPONSE_MARKER));
    Ok(())
}

#[test]
#[ignore = "requires a local Llama base model and LoRA adapter"]
fn cached_decode_matches_full_prefill() -> Result<()> {
    let Some((model_dir, adapter_dir)) = common::maybe_model_dirs() else {
        eprintln!("SKIP: set RECBEAM_MODEL_DIR and RECBEAM_ADAPTER_DIR to run this test");
        return Ok(());
    };
    let rt = Runtime::cpu_f32();
    let special = SpecialTokens::default();
    let tok = load_tokenizer(&model_dir, special)?;
    let model = LlamaModel::load(&model_dir, &adapter_dir, special, &rt)?;

    let mut ids = tok.encode(&generate_prompt("Recommend the next item.", None))?;
    let mut cache = model.start()?;
    let prefill = model.step(&ids, 0, &mut cache)?;
    let next = argmax(&prefill);
    ids.push(next);
    let cached = model.step(&[next], ids.len() - 1, &mut cache)?;

    let mut fresh = model.start()?;
    let full = model.step(&ids, 0, &mut fresh)?;

    if full.len() != cached.len() {
        bail!("logits length mismatch: {} vs {}", full.len(), cached.len());
    }
    for (f, c) in full.iter().zip(cached.iter()) {
        let abs = (f - c).abs();
        let rel = abs / c.abs().max(1e-6);
        if abs > 1e-3 && rel > 1e-3 {
            bail!("decode mismatch: abs {abs} rel {rel}");
        }
    }
    Ok(())
}

#[test]
#[ignore = "requires a local Llama base model and LoRA adapter"]
fn predict_output_is_newline_terminated() -> Result<()> {
    let Some((model_dir, adapter_dir)) = common::maybe_model_dirs() else {
        eprintln!("SKIP: set RECBEAM_MODEL_DIR and RECBEAM_ADAPTER_DIR to run this test");
        return Ok(());
    };
    let cfg = EvalConfig {
        model_name: model_dir.to_string_lossy().into_owned(),
        lora_checkpoint: adapter_dir,
        num_beams: 2,
        max_new_tokens: 8,
        ..EvalConfig::default()
    };
    let out = recbeam::run_predict(&cfg, &Runtime::cpu_f32(), "Recommend the next item.", None)?;
    assert!(out.ends_with('\n'), "{out:?}");
    assert!(out.lines().count() >= 1, "{out:?}");
    Ok(())
}

fn argmax(v: &[f32]) -> u32 {
    let (mut best_idx, mut best_val) = (0usize, f32::NEG_INFINITY);
    for (idx, val) in v.iter().enumerate() {
        if *val > best_val {
            best_val = *val;
            best_idx = idx;
        }
    }
    best_idx as u32
}
