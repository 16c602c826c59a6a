use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use candle_core::safetensors::Load;
use candle_core::{Device, Tensor};
use memmap2::Mmap;
use safetensors::SafeTensors;
use serde::Deserialize;
use tracing::debug;

pub type WeightMap = HashMap<String, Tensor>;

#[derive(Debug, Deserialize)]
struct ShardIndex {
    weight_map: HashMap<String, String>,
}

/// Base model weights from `model.safetensors`, a sharded
/// `model.safetensors.index.json`, or a lone `*.safetensors` file.
pub fn load_base_weights(model_dir: &Path, device: &Device) -> Result<WeightMap> {
    let files = find_base_safetensors(model_dir)?;
    let mut weights = HashMap::new();
    for file in &files {
        read_safetensors(file, device, &mut weights)?;
    }
    debug!(files = files.len(), tensors = weights.len(), "loaded base weights");
    Ok(weights)
}

pub fn load_adapter_weights(adapter_dir: &Path, device: &Device) -> Result<WeightMap> {
    let file = adapter_dir.join("adapter_model.safetensors");
    if !file.exists() {
        if adapter_dir.join("adapter_model.bin").exists() {
            bail!(
                "{adapter_dir:?} only has adapter_model.bin; re-save the adapter with safe_serialization"
            );
        }
        bail!("missing adapter_model.safetensors under {adapter_dir:?}");
    }
    let mut weights = HashMap::new();
    read_safetensors(&file, device, &mut weights)?;
    debug!(tensors = weights.len(), "loaded adapter weights");
    Ok(weights)
}

fn find_base_safetensors(model_dir: &Path) -> Result<Vec<PathBuf>> {
    let candidate = model_dir.join("model.safetensors");
    if candidate.exists() {
        return Ok(vec![candidate]);
    }

    let index = model_dir.join("model.safetensors.index.json");
    if index.exists() {
        let bytes = std::fs::read(&index).with_context(|| format!("read {index:?}"))?;
        let index: ShardIndex =
            serde_json::from_slice(&bytes).with_context(|| format!("parse {index:?}"))?;
        let shards: BTreeSet<&String> = index.weight_map.values().collect();
        if shards.is_empty() {
            bail!("empty weight_map in shard index under {model_dir:?}");
        }
        return Ok(shards.into_iter().map(|s| model_dir.join(s)).collect());
    }

    let mut found = vec![];
    for entry in std::fs::read_dir(model_dir).with_context(|| format!("read_dir {model_dir:?}"))? {
        let entry = entry?;
        let path = entry.path();
        if path.extension().and_then(|s| s.to_str()) == Some("safetensors") {
            found.push(path);
        }
    }
    match found.len() {
        1 => Ok(found),
        0 => bail!("no .safetensors found under {model_dir:?} (expected model.safetensors)"),
        _ => bail!(
            "multiple .safetensors found under {model_dir:?} without model.safetensors.index.json"
        ),
    }
}

fn read_safetensors(path: &Path, device: &Device, into: &mut WeightMap) -> Result<()> {
    let f = std::fs::File::open(path).with_context(|| format!("open {path:?}"))?;
    let mmap = unsafe { Mmap::map(&f).with_context(|| format!("mmap {path:?}"))? };
    let st = SafeTensors::deserialize(&mmap).with_context(|| format!("deserialize {path:?}"))?;
    for (name, view) in st.tensors() {
        let t = view
            .load(device)
            .with_context(|| format!("load tensor {name} from {path:?}"))?;
        into.insert(name, t);
    }
    Ok(())
}
