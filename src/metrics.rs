use serde::Serialize;

use crate::error::EvalError;

pub const TOP_K_SHORT: usize = 5;

/// Discounted gain of a hit at 0-based `rank`.
pub fn rank_gain(rank: usize) -> f64 {
    1.0 / ((rank + 2) as f64).log2()
}

/// Where the label landed in one candidate list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Hit {
    pub rank: usize,
    pub in_top5: bool,
}

/// Running counters for one pass over the dataset. The "NDCG" sums are raw
/// DCG: no ideal-ranking normalization is applied.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MetricAccumulator {
    pub hit5: usize,
    pub hit10: usize,
    pub ndcg5: f64,
    pub ndcg10: f64,
    pub total: usize,
}

impl MetricAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Scores `candidates` (beam order) against `label` and counts the example.
    pub fn record<S: AsRef<str>>(&mut self, label: &str, candidates: &[S]) -> Option<Hit> {
        let first = candidates.iter().position(|c| c.as_ref() == label);
        if let Some(rank) = first.filter(|&r| r < TOP_K_SHORT) {
            self.hit5 += 1;
            self.ndcg5 += rank_gain(rank);
        }
        if let Some(rank) = first {
            self.hit10 += 1;
            self.ndcg10 += rank_gain(rank);
        }
        self.total += 1;
        first.map(|rank| Hit {
            rank,
            in_top5: rank < TOP_K_SHORT,
        })
    }

    pub fn finish(&self, model_nm: &str) -> Result<EvalSummary, EvalError> {
        if self.total == 0 {
            return Err(EvalError::EmptyDataset);
        }
        let total = self.total as f64;
        Ok(EvalSummary {
            model_nm: model_nm.to_string(),
            hit5: self.hit5 as f64 / total,
            hit10: self.hit10 as f64 / total,
            ndcg5: self.ndcg5 / total,
            ndcg10: self.ndcg10 / total,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EvalSummary {
    pub model_nm: String,
    #[serde(rename = "Hit@5")]
    pub hit5: f64,
    #[serde(rename = "Hit@10")]
    pub hit10: f64,
    #[serde(rename = "NDCG@5")]
    pub ndcg5: f64,
    #[serde(rename = "NDCG@10")]
    pub ndcg10: f64,
}
