use std::path::Path;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use crate::prompt::generate_prompt;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Example {
    pub instruction: String,
    #[serde(default)]
    pub input: Option<String>,
    pub output: String,
}

impl Example {
    /// Copy of this row with `output` replaced.
    pub fn with_output(&self, output: impl Into<String>) -> Self {
        Self {
            output: output.into(),
            ..self.clone()
        }
    }

    pub fn context(&self) -> Option<&str> {
        self.input.as_deref().filter(|s| !s.is_empty())
    }

    /// The generation prompt for this row. Only `instruction` and `input`
    /// reach the template.
    pub fn prompt(&self) -> String {
        generate_prompt(&self.instruction, self.context())
    }
}

/// Loads either a JSON array of rows or JSON lines (one object per line).
pub fn load_examples(path: &Path) -> Result<Vec<Example>> {
    let text = std::fs::read_to_string(path).with_context(|| format!("read {path:?}"))?;
    parse_examples(&text).with_context(|| format!("parse {path:?}"))
}

pub fn parse_examples(text: &str) -> Result<Vec<Example>> {
    let trimmed = text.trim_start();
    if trimmed.is_empty() {
        return Ok(Vec::new());
    }
    if trimmed.starts_with('[') {
        return serde_json::from_str(trimmed).context("parse JSON array of examples");
    }

    let mut rows = Vec::new();
    for (lineno, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if !line.starts_with('{') {
            bail!("line {}: expected a JSON object", lineno + 1);
        }
        let row: Example =
            serde_json::from_str(line).with_context(|| format!("line {}", lineno + 1))?;
        rows.push(row);
    }
    Ok(rows)
}
