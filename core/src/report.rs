//! Run reporting
//!
//! The user-visible outcome of a pipeline run: which phase it ended in,
//! what happened per phase, aggregated failure reasons for the
//! no-survivors case, and an actionable suggestion where one exists.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::store::types::{IntentStatus, Survivor, Verification};

/// How a run ended
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RunOutcome {
    /// Survivors are presented and await a judgment
    AwaitingJudgment { survivor_count: usize },
    /// Parsing surfaced open questions; the pipeline waits for answers
    ClarificationNeeded { questions: Vec<String> },
    /// Every attempt failed verification; a first-class outcome, not an error
    NoSurvivors { top_failures: Vec<FailureCategory> },
    /// An accepted survivor was applied
    Applied { survivor_id: String },
    /// The run failed with a pipeline error
    Failed { kind: String, message: String },
    /// The run was aborted
    Aborted,
}

/// One aggregated failure reason across the batch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureCategory {
    /// Stage and condition, e.g. "typecheck: exit code 1"
    pub reason: String,
    /// Attempts that failed this way
    pub count: usize,
}

/// The final report handed to the human
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub intent_id: String,
    pub session_id: String,
    /// Phase the run ended in
    pub phase: IntentStatus,
    pub outcome: RunOutcome,
    /// Attempts generated (after validation and dedup)
    pub attempts_generated: usize,
    /// Attempts that passed verification
    pub attempts_passed: usize,
    /// Dollars spent on AI calls
    pub cost_usd: f64,
    /// Non-fatal notices (low diversity, refinement-loop warning, ...)
    pub warnings: Vec<String>,
    /// Actionable next step, when one exists
    pub suggestion: Option<String>,
}

impl RunReport {
    /// One-line summary for logs and the CLI
    pub fn summary(&self) -> String {
        let outcome = match &self.outcome {
            RunOutcome::AwaitingJudgment { survivor_count } => {
                format!("{survivor_count} survivor(s) awaiting judgment")
            }
            RunOutcome::ClarificationNeeded { questions } => {
                format!("clarification needed ({} question(s))", questions.len())
            }
            RunOutcome::NoSurvivors { top_failures } => {
                let reasons: Vec<&str> = top_failures
                    .iter()
                    .take(3)
                    .map(|f| f.reason.as_str())
                    .collect();
                format!("no survivors ({})", reasons.join("; "))
            }
            RunOutcome::Applied { survivor_id } => format!("applied survivor {survivor_id}"),
            RunOutcome::Failed { kind, .. } => format!("failed ({kind})"),
            RunOutcome::Aborted => "aborted".into(),
        };
        format!(
            "[{}] {} | {} generated, {} passed, ${:.2} spent",
            self.phase, outcome, self.attempts_generated, self.attempts_passed, self.cost_usd
        )
    }
}

/// Aggregate the failing verifications into the top failure categories,
/// most frequent first.
pub fn aggregate_failures(verifications: &[Verification], top: usize) -> Vec<FailureCategory> {
    let mut counts: HashMap<String, usize> = HashMap::new();
    for verification in verifications.iter().filter(|v| !v.passed) {
        let reason = verification
            .first_failure
            .clone()
            .unwrap_or_else(|| "unknown failure".into());
        *counts.entry(reason).or_insert(0) += 1;
    }
    let mut categories: Vec<FailureCategory> = counts
        .into_iter()
        .map(|(reason, count)| FailureCategory { reason, count })
        .collect();
    categories.sort_by(|a, b| b.count.cmp(&a.count).then(a.reason.cmp(&b.reason)));
    categories.truncate(top);
    categories
}

/// Suggestion for a no-survivors outcome, built from the dominant failure
pub fn no_survivors_suggestion(top_failures: &[FailureCategory]) -> Option<String> {
    let dominant = top_failures.first()?;
    let stage = dominant.reason.split(':').next().unwrap_or("verification");
    Some(format!(
        "{} attempt(s) failed at {}; review the condition \"{}\" and consider tightening the \
         request or relaxing the failing constraint.",
        dominant.count, stage, dominant.reason
    ))
}

/// Survivor lines for presentation
pub fn present_survivors(survivors: &[Survivor]) -> Vec<String> {
    survivors
        .iter()
        .map(|s| {
            format!(
                "#{} attempt {} (overall {:.2}: assertions {:.2}, simplicity {:.2}, \
                 readability {:.2}, performance {:.2})",
                s.rank,
                s.attempt_id,
                s.score.overall,
                s.score.assertions,
                s.score.simplicity,
                s.score.readability,
                s.score.performance
            )
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::types::{CheckResult, Stage, Verification};

    fn failing_verification(stage: Stage, error: &str) -> Verification {
        let result = CheckResult {
            stage,
            passed: false,
            exit_code: Some(1),
            output: String::new(),
            errors: vec![error.to_string()],
            duration_ms: 1,
            timed_out: false,
            skipped: false,
        };
        Verification::from_stages("att".into(), vec![result], 0, 3, 10)
    }

    #[test]
    fn test_aggregate_failures_counts_and_orders() {
        let verifications = vec![
            failing_verification(Stage::Typecheck, "error[E0308]: mismatched types"),
            failing_verification(Stage::Typecheck, "error[E0308]: mismatched types"),
            failing_verification(Stage::Lint, "error: unused variable"),
        ];
        let categories = aggregate_failures(&verifications, 3);
        assert_eq!(categories.len(), 2);
        assert_eq!(categories[0].count, 2);
        assert!(categories[0].reason.contains("typecheck"));
    }

    #[test]
    fn test_aggregate_skips_passing() {
        let passing = Verification::from_stages(
            "att".into(),
            vec![CheckResult {
                stage: Stage::Typecheck,
                passed: true,
                exit_code: Some(0),
                output: String::new(),
                errors: Vec::new(),
                duration_ms: 1,
                timed_out: false,
                skipped: false,
            }],
            0,
            1,
            10,
        );
        assert!(aggregate_failures(&[passing], 3).is_empty());
    }

    #[test]
    fn test_no_survivors_suggestion_names_phase_and_condition() {
        let failures = vec![FailureCategory {
            reason: "typecheck: error[E0308]: mismatched types".into(),
            count: 3,
        }];
        let suggestion = no_survivors_suggestion(&failures).unwrap();
        assert!(suggestion.contains("3 attempt(s)"));
        assert!(suggestion.contains("typecheck"));
    }

    #[test]
    fn test_summary_shapes() {
        let report = RunReport {
            intent_id: "i-1".into(),
            session_id: "s-1".into(),
            phase: IntentStatus::Judging,
            outcome: RunOutcome::AwaitingJudgment { survivor_count: 3 },
            attempts_generated: 4,
            attempts_passed: 3,
            cost_usd: 0.42,
            warnings: Vec::new(),
            suggestion: None,
        };
        let summary = report.summary();
        assert!(summary.contains("judging"));
        assert!(summary.contains("3 survivor(s)"));
        assert!(summary.contains("$0.42"));
    }
}
