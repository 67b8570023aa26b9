//! Generation Swarm
//!
//! Fans one specification out into N candidate attempts across the
//! configured strategy distribution, with bounded in-flight calls,
//! per-attempt validation against the spec's path sets, content-hash
//! dedup, and cost-ceiling backpressure. Partial failure is acceptable:
//! the batch returns whatever survived.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Deserialize;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::compiler::extract_json;
use crate::config::{GenerationConfig, StrategyDistribution};
use crate::gateway::{prompts, AiGateway, CompletionRequest, GatewayError, Purpose};
use crate::store::types::{Attempt, FileAction, FileChange, Specification, Strategy};

/// Outcome of one generation batch
#[derive(Debug, Default)]
pub struct GenerationReport {
    /// Valid, deduplicated attempts in arrival order
    pub attempts: Vec<Attempt>,
    /// Attempts dropped for invalid paths, malformed output, or duplication
    pub discarded: usize,
    /// Task-level failures (AI errors), one message each
    pub failures: Vec<String>,
    /// Whether the cost ceiling stopped submission mid-batch
    pub cost_stopped: bool,
    /// All kept attempts collapsed to a single implementation
    pub low_diversity: bool,
}

enum TaskOutcome {
    Kept(Box<Attempt>),
    Discarded(String),
    Failed(String),
}

/// Expand the distribution into an ordered list of N strategy slots.
///
/// The distribution fills first; a shortfall pads with vanilla and an
/// excess is truncated, so `n` always wins.
pub fn expand_plan(distribution: &StrategyDistribution, n: u32) -> Vec<Strategy> {
    let mut plan = Vec::with_capacity(n as usize);
    for strategy in Strategy::all() {
        for _ in 0..distribution.count_for(*strategy) {
            plan.push(*strategy);
        }
    }
    plan.truncate(n as usize);
    while plan.len() < n as usize {
        plan.push(Strategy::Vanilla);
    }
    plan
}

#[derive(Deserialize)]
struct ImplementWire {
    #[serde(default)]
    approach: String,
    #[serde(default = "default_confidence")]
    confidence: f64,
    changes: Vec<FileChangeWire>,
}

fn default_confidence() -> f64 {
    0.5
}

#[derive(Deserialize)]
struct FileChangeWire {
    path: String,
    action: FileAction,
    #[serde(default)]
    content: Option<String>,
}

/// Fans out generation attempts under a bounded pool
pub struct GenerationSwarm {
    gateway: Arc<dyn AiGateway>,
    config: GenerationConfig,
    /// In-flight task cap; tracks the gateway's outstanding-call ceiling
    pool_size: usize,
}

impl GenerationSwarm {
    pub fn new(gateway: Arc<dyn AiGateway>, config: GenerationConfig, pool_size: usize) -> Self {
        Self {
            gateway,
            config,
            pool_size: pool_size.max(1),
        }
    }

    /// Generate up to `n` attempts for `spec`.
    ///
    /// Stops submitting once the cost ceiling is hit or the run is
    /// cancelled, drains outstanding tasks either way, and never raises
    /// for a partial batch.
    pub async fn generate(
        &self,
        spec: Arc<Specification>,
        n: u32,
        cancel: &CancellationToken,
    ) -> GenerationReport {
        let n = n.min(self.config.max_count).max(1);
        let plan = expand_plan(&self.config.distribution, n);
        info!(batch = plan.len(), "Starting generation batch");

        let ceiling_hit = Arc::new(AtomicBool::new(false));
        let completed: Arc<Mutex<Vec<Attempt>>> = Arc::new(Mutex::new(Vec::new()));
        let deadline = Duration::from_secs(self.config.ai_call_timeout_secs);

        let mut report = GenerationReport::default();
        let mut kept_raw: Vec<Attempt> = Vec::new();
        let mut tasks: JoinSet<TaskOutcome> = JoinSet::new();
        let mut slots = plan.into_iter();

        loop {
            // Keep the pool full unless backpressure stops submission
            while tasks.len() < self.pool_size
                && !ceiling_hit.load(Ordering::SeqCst)
                && !cancel.is_cancelled()
            {
                let Some(strategy) = slots.next() else { break };
                tasks.spawn(Self::run_slot(
                    Arc::clone(&self.gateway),
                    Arc::clone(&spec),
                    strategy,
                    deadline,
                    Arc::clone(&ceiling_hit),
                    Arc::clone(&completed),
                    cancel.clone(),
                ));
            }

            let Some(joined) = tasks.join_next().await else { break };
            match joined {
                Ok(TaskOutcome::Kept(attempt)) => kept_raw.push(*attempt),
                Ok(TaskOutcome::Discarded(reason)) => {
                    debug!(reason = %reason, "Attempt discarded");
                    report.discarded += 1;
                }
                Ok(TaskOutcome::Failed(message)) => report.failures.push(message),
                Err(e) => report.failures.push(format!("generation task panicked: {e}")),
            }
        }

        report.cost_stopped = ceiling_hit.load(Ordering::SeqCst);

        // Dedup by content hash, keeping the earliest arrival
        let pre_dedup = kept_raw.len();
        let mut seen: HashSet<String> = HashSet::new();
        for attempt in kept_raw {
            if seen.insert(attempt.content_hash()) {
                report.attempts.push(attempt);
            } else {
                report.discarded += 1;
            }
        }
        report.low_diversity = pre_dedup > 1 && report.attempts.len() == 1;

        info!(
            kept = report.attempts.len(),
            discarded = report.discarded,
            failed = report.failures.len(),
            cost_stopped = report.cost_stopped,
            "Generation batch finished"
        );
        report
    }

    async fn run_slot(
        gateway: Arc<dyn AiGateway>,
        spec: Arc<Specification>,
        strategy: Strategy,
        deadline: Duration,
        ceiling_hit: Arc<AtomicBool>,
        completed: Arc<Mutex<Vec<Attempt>>>,
        cancel: CancellationToken,
    ) -> TaskOutcome {
        // Mutation needs a completed sibling to vary; without one it
        // downgrades to vanilla rather than failing the slot.
        let (effective, sibling_json, downgraded) = if strategy == Strategy::Mutation {
            let sibling = completed
                .lock()
                .ok()
                .and_then(|done| done.first().map(|a| changes_json(&a.changes)));
            match sibling {
                Some(json) => (Strategy::Mutation, Some(json), false),
                None => (Strategy::Vanilla, None, true),
            }
        } else {
            (strategy, None, false)
        };

        let prompt = prompts::implement_prompt(&spec, effective, sibling_json.as_deref());
        let completion = match gateway
            .complete(
                CompletionRequest {
                    purpose: Purpose::Implement,
                    prompt,
                    deadline,
                },
                &cancel,
            )
            .await
        {
            Ok(completion) => completion,
            Err(GatewayError::CostCeilingReached { spent, ceiling }) => {
                ceiling_hit.store(true, Ordering::SeqCst);
                return TaskOutcome::Failed(format!(
                    "cost ceiling reached (${spent:.2}/${ceiling:.2})"
                ));
            }
            Err(e) => return TaskOutcome::Failed(format!("{strategy}: {e}")),
        };

        let wire: ImplementWire = match extract_json(&completion.text, "implement") {
            Ok(wire) => wire,
            Err(e) => return TaskOutcome::Discarded(format!("{strategy}: {e}")),
        };
        if wire.changes.is_empty() {
            return TaskOutcome::Discarded(format!("{strategy}: no file changes"));
        }

        let mut changes = Vec::with_capacity(wire.changes.len());
        for change in wire.changes {
            let change = FileChange {
                path: change.path.trim_start_matches("./").to_string(),
                // Content on a delete is dropped rather than rejected
                content: match change.action {
                    FileAction::Delete => None,
                    _ => change.content,
                },
                action: change.action,
            };
            if !change.is_well_formed() {
                return TaskOutcome::Discarded(format!(
                    "{strategy}: {} has no content",
                    change.path
                ));
            }
            if !spec.path_allowed(&change.path) {
                return TaskOutcome::Discarded(format!(
                    "{strategy}: path {} outside allowed set",
                    change.path
                ));
            }
            changes.push(change);
        }

        let approach = if downgraded {
            format!("{} (downgraded from mutation: no completed sibling)", wire.approach)
        } else {
            wire.approach
        };
        let attempt = Attempt::new(
            spec.id.clone(),
            spec.version,
            effective,
            changes,
            approach,
            wire.confidence,
        );
        if let Ok(mut done) = completed.lock() {
            done.push(attempt.clone());
        } else {
            warn!("completed-attempts lock poisoned; mutation siblings unavailable");
        }
        TaskOutcome::Kept(Box::new(attempt))
    }
}

fn changes_json(changes: &[FileChange]) -> String {
    serde_json::to_string_pretty(changes).unwrap_or_default()
}
