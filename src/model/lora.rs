use std::collections::BTreeMap;

use anyhow::{bail, Context, Result};
use candle_core::{DType, Tensor};
use tracing::debug;

use crate::config::AdapterConfig;
use crate::loader::WeightMap;

const PEFT_PREFIX: &str = "base_model.model.";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoraPart {
    A,
    B,
}

/// Maps a PEFT adapter key to the base weight it patches, e.g.
/// `base_model.model.model.layers.0.self_attn.q_proj.lora_A.weight`
/// (optionally with an adapter name before `weight`) to
/// `model.layers.0.self_attn.q_proj.weight`.
pub fn adapter_target(key: &str) -> Option<(String, LoraPart)> {
    let key = key.strip_prefix(PEFT_PREFIX).unwrap_or(key);
    let (module, part, rest) = if let Some((m, r)) = key.split_once(".lora_A.") {
        (m, LoraPart::A, r)
    } else if let Some((m, r)) = key.split_once(".lora_B.") {
        (m, LoraPart::B, r)
    } else {
        return None;
    };
    let is_weight = rest == "weight"
        || rest
            .strip_suffix(".weight")
            .is_some_and(|name| !name.is_empty() && !name.contains('.'));
    is_weight.then(|| (format!("{module}.weight"), part))
}

#[derive(Default)]
struct Pair {
    a: Option<Tensor>,
    b: Option<Tensor>,
}

/// Folds every LoRA pair into its base weight: `W += scaling * B @ A`
/// (transposed for `fan_in_fan_out`). Patched weights come back in `dtype`,
/// the precision the model runs at. Returns the number of patched weights.
pub fn merge_adapter(
    base: &mut WeightMap,
    adapter: WeightMap,
    cfg: &AdapterConfig,
    dtype: DType,
) -> Result<usize> {
    let mut pairs: BTreeMap<String, Pair> = BTreeMap::new();
    for (key, tensor) in adapter {
        let Some((target, part)) = adapter_target(&key) else {
            bail!("unsupported adapter tensor {key} (only LoRA A/B weights can be merged)");
        };
        if !cfg.targets(&target) {
            bail!(
                "adapter tensor {key} patches a module outside target_modules {:?}",
                cfg.target_modules
            );
        }
        let pair = pairs.entry(target).or_default();
        match part {
            LoraPart::A => pair.a = Some(tensor),
            LoraPart::B => pair.b = Some(tensor),
        }
    }

    let scaling = cfg.scaling();
    for (target, pair) in &pairs {
        let (Some(a), Some(b)) = (&pair.a, &pair.b) else {
            bail!("adapter for {target} is missing its lora_A or lora_B half");
        };
        let w = base.get(target).with_context(|| {
            format!("adapter targets {target}, which the base model does not have")
        })?;
        let merged = merge_pair(w, a, b, scaling, cfg.fan_in_fan_out, dtype)
            .with_context(|| format!("merge adapter into {target}"))?;
        base.insert(target.clone(), merged);
    }
    debug!(merged = pairs.len(), scaling, "merged LoRA adapter");
    Ok(pairs.len())
}

fn merge_pair(
    w: &Tensor,
    a: &Tensor,
    b: &Tensor,
    scaling: f64,
    fan_in_fan_out: bool,
    dtype: DType,
) -> Result<Tensor> {
    let (r_a, in_dim) = a.dims2().context("lora_A must be rank 2")?;
    let (out_dim, r_b) = b.dims2().context("lora_B must be rank 2")?;
    if r_a != r_b {
        bail!("lora rank mismatch: A has {r_a}, B has {r_b}");
    }
    let expected = if fan_in_fan_out {
        [in_dim, out_dim]
    } else {
        [out_dim, in_dim]
    };
    if w.dims() != expected {
        bail!("base weight has shape {:?}, adapter expects {expected:?}", w.dims());
    }

    let delta = b
        .to_dtype(DType::F32)?
        .matmul(&a.to_dtype(DType::F32)?)?
        .affine(scaling, 0.0)?;
    let delta = if fan_in_fan_out {
        delta.t()?.contiguous()?
    } else {
        delta
    };
    let merged = w.to_dtype(DType::F32)?.add(&delta)?;
    Ok(merged.to_dtype(dtype)?)
}
