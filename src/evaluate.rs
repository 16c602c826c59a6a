use anyhow::{Context, Result};
use tracing::{debug, info, trace};

use crate::config::GenerationConfig;
use crate::dataset::Example;
use crate::generate::CandidateGenerator;
use crate::metrics::{EvalSummary, MetricAccumulator};
use crate::prompt::{clean_candidate, extract_response, generate_prompt};

const PROGRESS_EVERY: usize = 50;

/// Decoded beams to cleaned candidates, in beam order. Fails on the first
/// beam without a response marker.
pub fn rank_candidates<G>(
    generator: &mut G,
    prompt: &str,
    cfg: &GenerationConfig,
) -> Result<Vec<String>>
where
    G: CandidateGenerator + ?Sized,
{
    let decoded = generator.generate(prompt, cfg).context("generate")?;
    decoded
        .iter()
        .enumerate()
        .map(|(beam, text)| {
            extract_response(text)
                .map(|resp| clean_candidate(resp).to_string())
                .with_context(|| format!("beam {beam}"))
        })
        .collect()
}

pub fn evaluate<G>(
    examples: &[Example],
    model_nm: &str,
    generator: &mut G,
    cfg: &GenerationConfig,
) -> Result<EvalSummary>
where
    G: CandidateGenerator + ?Sized,
{
    let mut acc = MetricAccumulator::new();
    for (i, example) in examples.iter().enumerate() {
        let label = example.output.as_str();
        let prompt = example.with_output("").prompt();

        let candidates = rank_candidates(generator, &prompt, cfg)
            .with_context(|| format!("example {i}"))?;
        debug!(index = i, label, ?candidates, "generated candidates");

        if let Some(hit) = acc.record(label, &candidates) {
            trace!(index = i, rank = hit.rank, top5 = hit.in_top5, "label hit");
        }
        if (i + 1) % PROGRESS_EVERY == 0 {
            info!(done = i + 1, of = examples.len(), hit10 = acc.hit10, "progress");
        }
    }

    let summary = acc.finish(model_nm)?;
    info!(
        total = acc.total,
        hit5 = summary.hit5,
        hit10 = summary.hit10,
        ndcg5 = summary.ndcg5,
        ndcg10 = summary.ndcg10,
        "evaluation finished"
    );
    Ok(summary)
}

/// One prompt, every beam's response (untrimmed of `⁇`), newline-terminated.
pub fn predict<G>(
    generator: &mut G,
    instruction: &str,
    input: Option<&str>,
    cfg: &GenerationConfig,
) -> Result<String>
where
    G: CandidateGenerator + ?Sized,
{
    let prompt = generate_prompt(instruction, input);
    let decoded = generator.generate(&prompt, cfg).context("generate")?;
    let mut output = String::new();
    for (beam, text) in decoded.iter().enumerate() {
        let resp = extract_response(text).with_context(|| format!("beam {beam}"))?;
        output.push_str(resp);
        output.push('\n');
    }
    Ok(output)
}
