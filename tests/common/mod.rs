#![allow(dead_code)]

use std::collections::VecDeque;
use std::path::PathBuf;

use anyhow::{bail, Result};
use recbeam::config::GenerationConfig;
use recbeam::generate::CandidateGenerator;

/// Replays canned responses per prompt, echoing the prompt the way a causal
/// decoder does. `None` stands for a beam that lost the response marker.
pub struct ScriptedGenerator {
    script: VecDeque<Vec<Option<String>>>,
    pub calls: usize,
}

impl ScriptedGenerator {
    pub fn new<I, B, S>(script: I) -> Self
    where
        I: IntoIterator<Item = B>,
        B: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let script = script
            .into_iter()
            .map(|beams| beams.into_iter().map(|s| Some(s.into())).collect())
            .collect();
        Self { script, calls: 0 }
    }

    pub fn push_malformed(&mut self, beams: Vec<Option<&str>>) {
        self.script
            .push_back(beams.into_iter().map(|b| b.map(Into::into)).collect());
    }
}

impl CandidateGenerator for ScriptedGenerator {
    fn generate(&mut self, prompt: &str, _cfg: &GenerationConfig) -> Result<Vec<String>> {
        self.calls += 1;
        let Some(beams) = self.script.pop_front() else {
            bail!("scripted generator exhausted after {} calls", self.calls - 1);
        };
        Ok(beams
            .into_iter()
            .map(|b| match b {
                Some(resp) => format!("{prompt}{resp}"),
                None => "Below is an instruction that describes a task.".to_string(),
            })
            .collect())
    }
}

pub fn maybe_model_dirs() -> Option<(PathBuf, PathBuf)> {
    let model = std::env::var_os("RECBEAM_MODEL_DIR")?;
    let adapter = std::env::var_os("RECBEAM_ADAPTER_DIR")?;
    Some((PathBuf::from(model), PathBuf::from(adapter)))
}
