use thiserror::Error;

/// Failures that abort an evaluation run. Everything else (I/O, model
/// loading, candle) travels as plain `anyhow` context.
#[derive(Debug, Error)]
pub enum EvalError {
    #[error("decoded sequence has no `### Response:` marker: {text:?}")]
    MalformedResponse { text: String },

    #[error("cannot compute rates over an empty dataset (total == 0)")]
    EmptyDataset,
}
