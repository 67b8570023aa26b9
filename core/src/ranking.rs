//! Ranking Engine
//!
//! Filters passing verifications, scores each survivor on four axes in
//! [0,1], and emits a deterministic total order. Readability may come
//! from an AI score; when unavailable its weight is redistributed
//! proportionally across the other axes rather than defaulted silently.

use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::compiler::extract_json;
use crate::config::{RankingConfig, ScoreWeights};
use crate::gateway::{prompts, AiGateway, CompletionRequest, Purpose};
use crate::store::types::{Attempt, ScoreCard, Survivor, Verification};

/// Neutral readability when no AI score exists
const NEUTRAL_READABILITY: f64 = 0.5;

/// One scoring candidate: a passing attempt and its verification
pub struct RankInput {
    pub attempt: Attempt,
    pub verification: Verification,
    /// AI-assessed readability, when the scorer produced one
    pub readability: Option<f64>,
}

/// Scores and orders survivors
pub struct RankingEngine {
    config: RankingConfig,
    gateway: Option<Arc<dyn AiGateway>>,
    ai_deadline: Duration,
}

impl RankingEngine {
    pub fn new(
        config: RankingConfig,
        gateway: Option<Arc<dyn AiGateway>>,
        ai_deadline: Duration,
    ) -> Self {
        Self {
            config,
            gateway,
            ai_deadline,
        }
    }

    /// Optionally fetch an AI readability score for one attempt.
    ///
    /// Failure is never fatal: ranking degrades to the neutral value with
    /// redistributed weight.
    pub async fn readability_score(
        &self,
        attempt: &Attempt,
        cancel: &CancellationToken,
    ) -> Option<f64> {
        if !self.config.ai_readability {
            return None;
        }
        let gateway = self.gateway.as_ref()?;
        let summary: String = attempt
            .changes
            .iter()
            .filter_map(|c| c.content.as_deref().map(|content| (c.path.as_str(), content)))
            .map(|(path, content)| format!("// {path}\n{content}\n"))
            .collect();
        let completion = gateway
            .complete(
                CompletionRequest {
                    purpose: Purpose::Score,
                    prompt: prompts::score_prompt(&summary),
                    deadline: self.ai_deadline,
                },
                cancel,
            )
            .await;
        match completion {
            Ok(completion) => {
                #[derive(Deserialize)]
                struct ReadabilityWire {
                    readability: f64,
                }
                match extract_json::<ReadabilityWire>(&completion.text, "score") {
                    Ok(wire) => Some(wire.readability.clamp(0.0, 1.0)),
                    Err(e) => {
                        warn!(error = %e, "Unusable readability score; using neutral");
                        None
                    }
                }
            }
            Err(e) => {
                warn!(error = %e, "Readability scoring failed; using neutral");
                None
            }
        }
    }

    /// Rank the candidates and emit the top K as survivors with ranks 1..K.
    pub fn rank(&self, intent_id: &str, mut inputs: Vec<RankInput>) -> Vec<Survivor> {
        inputs.retain(|input| input.verification.passed);

        let mut scored: Vec<(RankInput, ScoreCard)> = inputs
            .into_iter()
            .map(|input| {
                let score = score_attempt(&self.config.weights, &input);
                (input, score)
            })
            .collect();

        // Total order: overall desc, then confidence desc, fewer changed
        // lines, then earlier attempt id
        scored.sort_by(|(a, sa), (b, sb)| {
            sb.overall
                .total_cmp(&sa.overall)
                .then(b.attempt.confidence.total_cmp(&a.attempt.confidence))
                .then(a.attempt.changed_line_count().cmp(&b.attempt.changed_line_count()))
                .then(a.attempt.id.cmp(&b.attempt.id))
        });

        scored
            .into_iter()
            .take(self.config.top_k)
            .enumerate()
            .map(|(i, (input, score))| Survivor {
                id: uuid::Uuid::new_v4().to_string(),
                intent_id: intent_id.to_string(),
                attempt_id: input.attempt.id,
                verification_id: input.verification.id,
                rank: i as u32 + 1,
                score,
                presented: false,
            })
            .collect()
    }
}

/// Compose the per-axis scores into an overall score.
fn score_attempt(weights: &ScoreWeights, input: &RankInput) -> ScoreCard {
    let assertions = if input.verification.assertions_total == 0 {
        1.0
    } else {
        input.verification.assertions_passed as f64 / input.verification.assertions_total as f64
    };
    let simplicity = simplicity_score(
        input.attempt.changed_line_count(),
        max_nesting_depth(&input.attempt),
    );
    // Performance is reserved: 1.0 until benchmark data exists
    let performance = 1.0;

    let (readability, weights) = match input.readability {
        Some(score) => (score.clamp(0.0, 1.0), *weights),
        None => (NEUTRAL_READABILITY, redistribute_readability(weights)),
    };

    let overall = assertions * weights.assertions
        + simplicity * weights.simplicity
        + readability * weights.readability
        + performance * weights.performance;
    debug!(
        assertions,
        simplicity, readability, performance, overall, "Scored attempt"
    );
    ScoreCard {
        assertions,
        simplicity,
        readability,
        performance,
        overall: overall.clamp(0.0, 1.0),
    }
}

/// Monotonically decreasing in changed lines and maximum brace nesting,
/// bounded in (0, 1].
fn simplicity_score(changed_lines: usize, max_depth: usize) -> f64 {
    1.0 / (1.0 + changed_lines as f64 / 100.0 + max_depth as f64 / 4.0)
}

/// Deepest brace nesting across the attempt's written content
fn max_nesting_depth(attempt: &Attempt) -> usize {
    attempt
        .changes
        .iter()
        .filter_map(|c| c.content.as_deref())
        .map(brace_depth)
        .max()
        .unwrap_or(0)
}

fn brace_depth(content: &str) -> usize {
    let mut depth = 0usize;
    let mut max = 0usize;
    for ch in content.chars() {
        match ch {
            '{' => {
                depth += 1;
                max = max.max(depth);
            }
            '}' => depth = depth.saturating_sub(1),
            _ => {}
        }
    }
    max
}

/// Fold the readability weight into the other axes proportionally, so a
/// missing AI score neither inflates nor sinks the overall.
fn redistribute_readability(weights: &ScoreWeights) -> ScoreWeights {
    let remainder = weights.assertions + weights.simplicity + weights.performance;
    if remainder <= f64::EPSILON {
        return *weights;
    }
    let scale = (remainder + weights.readability) / remainder;
    ScoreWeights {
        assertions: weights.assertions * scale,
        simplicity: weights.simplicity * scale,
        readability: 0.0,
        performance: weights.performance * scale,
    }
}
