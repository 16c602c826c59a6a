use crate::error::EvalError;

pub const RESPONSE_MARKER: &str = "### Response:";

/// SentencePiece renders the unknown token as this glyph; anything after it
/// in a candidate is decode debris.
pub const UNK_GLYPH: char = '⁇';

pub fn generate_prompt(instruction: &str, input: Option<&str>) -> String {
    match input.filter(|s| !s.is_empty()) {
        Some(input) => format!(
            "Below is an instruction that describes a task, paired with an input that provides further context. Write a response that appropriately completes the request.\n\
             \n\
             ### Instruction:\n\
             {instruction}\n\
             \n\
             ### Input:\n\
             {input}\n\
             \n\
             {RESPONSE_MARKER}\n"
        ),
        None => format!(
            "Below is an instruction that describes a task. Write a response that appropriately completes the request.\n\
             \n\
             ### Instruction:\n\
             {instruction}\n\
             \n\
             {RESPONSE_MARKER}\n"
        ),
    }
}

/// The first response segment: text between the first response marker and
/// the next one (or the end), trimmed.
pub fn extract_response(decoded: &str) -> Result<&str, EvalError> {
    decoded
        .split(RESPONSE_MARKER)
        .nth(1)
        .map(str::trim)
        .ok_or_else(|| EvalError::MalformedResponse {
            text: decoded.to_string(),
        })
}

pub fn clean_candidate(response: &str) -> &str {
    match response.split_once(UNK_GLYPH) {
        Some((head, _)) => head.trim(),
        None => response.trim(),
    }
}
