//! AI Gateway
//!
//! Single request/response surface to the external completion provider.
//! Tags every call with a purpose for cost and quota accounting, retries
//! transient failures with jittered backoff, halves effective concurrency
//! under rate-limit pressure with linear recovery, and refuses outright
//! once the next call would cross the cost ceiling.

pub mod prompts;

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::GatewayConfig;

/// What a completion call is for; opaque to the Gateway beyond accounting
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Purpose {
    Parse,
    Analyze,
    Spec,
    Implement,
    Score,
}

impl std::fmt::Display for Purpose {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Purpose::Parse => "parse",
            Purpose::Analyze => "analyze",
            Purpose::Spec => "spec",
            Purpose::Implement => "implement",
            Purpose::Score => "score",
        };
        write!(f, "{s}")
    }
}

/// One completion request
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub purpose: Purpose,
    pub prompt: String,
    pub deadline: Duration,
}

/// One completion response with its accounted cost
#[derive(Debug, Clone)]
pub struct Completion {
    pub text: String,
    pub cost_usd: f64,
}

/// Error type for gateway operations
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("backend unavailable: {message}")]
    Unavailable { message: String },

    #[error("transient backend error: {message}")]
    Transient { message: String },

    #[error("rate limited by backend")]
    RateLimited,

    #[error("call exceeded its {secs}s deadline")]
    Timeout { secs: u64 },

    #[error("cost ceiling reached: spent ${spent:.2} of ${ceiling:.2}")]
    CostCeilingReached { spent: f64, ceiling: f64 },

    #[error("unusable backend response: {message}")]
    Malformed { message: String },

    #[error("cancelled")]
    Cancelled,
}

impl GatewayError {
    /// Whether a retry within the same call is worthwhile
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Transient { .. } | Self::RateLimited | Self::Timeout { .. }
        )
    }
}

/// The completion surface the pipeline depends on
#[async_trait]
pub trait AiGateway: Send + Sync {
    /// Exchange a prompt for text, honoring the deadline and cancellation
    async fn complete(
        &self,
        request: CompletionRequest,
        cancel: &CancellationToken,
    ) -> Result<Completion, GatewayError>;

    /// Dollars spent so far across all purposes
    fn total_cost_usd(&self) -> f64;
}

// =============================================================================
// Cost ledger
// =============================================================================

/// Monotonic run-cost counter with a submission-time ceiling check.
///
/// Internally tracks micro-dollars in an atomic so concurrent callers
/// never observe a decreasing total.
pub struct CostLedger {
    spent_micros: AtomicU64,
    ceiling_usd: f64,
}

impl CostLedger {
    pub fn new(ceiling_usd: f64) -> Self {
        Self {
            spent_micros: AtomicU64::new(0),
            ceiling_usd,
        }
    }

    /// Dollars spent so far
    pub fn spent_usd(&self) -> f64 {
        self.spent_micros.load(Ordering::SeqCst) as f64 / 1e6
    }

    /// Refuse when the estimated next call would cross the ceiling
    pub fn check_next(&self, estimate_usd: f64) -> Result<(), GatewayError> {
        let spent = self.spent_usd();
        if spent + estimate_usd > self.ceiling_usd + 1e-9 {
            return Err(GatewayError::CostCeilingReached {
                spent,
                ceiling: self.ceiling_usd,
            });
        }
        Ok(())
    }

    /// Record the actual cost of a finished call
    pub fn record(&self, cost_usd: f64) {
        let micros = (cost_usd.max(0.0) * 1e6) as u64;
        self.spent_micros.fetch_add(micros, Ordering::SeqCst);
    }
}

// =============================================================================
// Rate governor
// =============================================================================

/// Bounds outstanding AI calls, halving the effective limit on a
/// rate-limit signal and restoring it one permit at a time after the
/// cooldown window.
pub struct RateGovernor {
    semaphore: Arc<Semaphore>,
    base: usize,
    withheld: Arc<AtomicUsize>,
    recovering: Arc<AtomicBool>,
    cooldown: Duration,
}

impl RateGovernor {
    pub fn new(base: usize, cooldown: Duration) -> Self {
        let base = base.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(base)),
            base,
            withheld: Arc::new(AtomicUsize::new(0)),
            recovering: Arc::new(AtomicBool::new(false)),
            cooldown,
        }
    }

    /// Effective outstanding-call ceiling right now
    pub fn effective_limit(&self) -> usize {
        self.base - self.withheld.load(Ordering::SeqCst)
    }

    /// Acquire one outstanding-call slot, or bail on cancellation
    pub async fn acquire(
        &self,
        cancel: &CancellationToken,
    ) -> Result<OwnedSemaphorePermit, GatewayError> {
        tokio::select! {
            _ = cancel.cancelled() => Err(GatewayError::Cancelled),
            permit = self.semaphore.clone().acquire_owned() => {
                permit.map_err(|_| GatewayError::Cancelled)
            }
        }
    }

    /// Halve the effective limit and schedule linear recovery.
    ///
    /// Permits are withheld by acquiring and forgetting them, so calls
    /// already in flight are unaffected.
    pub fn on_rate_limit(&self) {
        let effective = self.effective_limit();
        let target = effective / 2;
        let mut taken = 0usize;
        for _ in 0..(effective - target.max(1)) {
            match self.semaphore.try_acquire() {
                Ok(permit) => {
                    permit.forget();
                    taken += 1;
                }
                Err(_) => break,
            }
        }
        if taken == 0 {
            return;
        }
        let withheld_now = self.withheld.fetch_add(taken, Ordering::SeqCst) + taken;
        warn!(
            withheld = withheld_now,
            effective = self.base - withheld_now,
            "Rate limit signal: reduced outstanding-call ceiling"
        );

        if self
            .recovering
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }
        let semaphore = Arc::clone(&self.semaphore);
        let withheld = Arc::clone(&self.withheld);
        let recovering = Arc::clone(&self.recovering);
        let cooldown = self.cooldown;
        tokio::spawn(async move {
            tokio::time::sleep(cooldown).await;
            // Linear recovery: one permit per tick until fully restored
            let tick = (cooldown / 4).max(Duration::from_millis(10));
            while withheld.load(Ordering::SeqCst) > 0 {
                withheld.fetch_sub(1, Ordering::SeqCst);
                semaphore.add_permits(1);
                tokio::time::sleep(tick).await;
            }
            recovering.store(false, Ordering::SeqCst);
            debug!("Outstanding-call ceiling fully restored");
        });
    }
}

// =============================================================================
// HTTP gateway
// =============================================================================

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
    #[serde(default)]
    usage: Option<ChatUsage>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatResponseMessage,
}

#[derive(Deserialize)]
struct ChatResponseMessage {
    content: String,
}

#[derive(Deserialize)]
struct ChatUsage {
    #[serde(default)]
    total_tokens: u64,
}

/// Reqwest-backed gateway speaking an OpenAI-style chat completions API
pub struct HttpGateway {
    client: reqwest::Client,
    config: GatewayConfig,
    ledger: CostLedger,
    governor: RateGovernor,
}

impl HttpGateway {
    pub fn new(config: GatewayConfig, cost_ceiling_usd: f64) -> Self {
        let governor = RateGovernor::new(
            config.ai_concurrency,
            Duration::from_secs(config.rate_limit_cooldown_secs),
        );
        Self {
            client: reqwest::Client::new(),
            ledger: CostLedger::new(cost_ceiling_usd),
            governor,
            config,
        }
    }

    async fn send_once(&self, request: &CompletionRequest) -> Result<Completion, GatewayError> {
        let url = format!("{}/chat/completions", self.config.base_url.trim_end_matches('/'));
        let body = ChatRequest {
            model: &self.config.model,
            messages: vec![ChatMessage {
                role: "user",
                content: &request.prompt,
            }],
        };

        let mut req = self.client.post(&url).json(&body).timeout(request.deadline);
        if let Ok(key) = std::env::var(&self.config.api_key_env) {
            if !key.is_empty() {
                req = req.bearer_auth(key);
            }
        }

        let resp = req.send().await.map_err(|e| {
            if e.is_timeout() {
                GatewayError::Timeout {
                    secs: request.deadline.as_secs(),
                }
            } else if e.is_connect() {
                GatewayError::Transient {
                    message: format!("connect: {e}"),
                }
            } else {
                GatewayError::Unavailable {
                    message: e.to_string(),
                }
            }
        })?;

        let status = resp.status();
        if status.as_u16() == 429 {
            return Err(GatewayError::RateLimited);
        }
        if status.is_server_error() {
            return Err(GatewayError::Transient {
                message: format!("status {status}"),
            });
        }
        if !status.is_success() {
            return Err(GatewayError::Unavailable {
                message: format!("status {status}"),
            });
        }

        let parsed: ChatResponse = resp.json().await.map_err(|e| GatewayError::Malformed {
            message: e.to_string(),
        })?;
        let text = parsed
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| GatewayError::Malformed {
                message: "empty choices".into(),
            })?;

        let cost_usd = match parsed.usage {
            Some(usage) if usage.total_tokens > 0 => {
                usage.total_tokens as f64 / 1000.0 * self.config.cost_per_1k_tokens_usd
            }
            _ => self.config.estimated_call_cost_usd,
        };

        Ok(Completion { text, cost_usd })
    }

    /// Exponential backoff with jitter: 2s, 4s, 8s... plus up to 500ms
    fn backoff(attempt: u32) -> Duration {
        let base = Duration::from_secs(2u64.saturating_pow(attempt + 1).min(60));
        let jitter = rand::thread_rng().gen_range(0..500);
        base + Duration::from_millis(jitter)
    }
}

#[async_trait]
impl AiGateway for HttpGateway {
    async fn complete(
        &self,
        request: CompletionRequest,
        cancel: &CancellationToken,
    ) -> Result<Completion, GatewayError> {
        self.ledger.check_next(self.config.estimated_call_cost_usd)?;
        let _permit = self.governor.acquire(cancel).await?;

        let mut last_err = GatewayError::Unavailable {
            message: "no attempt made".into(),
        };
        for attempt in 0..=self.config.max_retries {
            if cancel.is_cancelled() {
                return Err(GatewayError::Cancelled);
            }
            let outcome = tokio::select! {
                _ = cancel.cancelled() => return Err(GatewayError::Cancelled),
                outcome = self.send_once(&request) => outcome,
            };
            match outcome {
                Ok(completion) => {
                    self.ledger.record(completion.cost_usd);
                    info!(
                        purpose = %request.purpose,
                        cost_usd = completion.cost_usd,
                        total_usd = self.ledger.spent_usd(),
                        "AI call complete"
                    );
                    return Ok(completion);
                }
                Err(e) => {
                    if matches!(e, GatewayError::RateLimited) {
                        self.governor.on_rate_limit();
                    }
                    if e.is_transient() && attempt < self.config.max_retries {
                        let delay = Self::backoff(attempt);
                        warn!(
                            purpose = %request.purpose,
                            attempt,
                            delay_ms = delay.as_millis() as u64,
                            error = %e,
                            "Transient AI error, backing off"
                        );
                        tokio::select! {
                            _ = cancel.cancelled() => return Err(GatewayError::Cancelled),
                            _ = tokio::time::sleep(delay) => {}
                        }
                        last_err = e;
                        continue;
                    }
                    return Err(e);
                }
            }
        }
        Err(last_err)
    }

    fn total_cost_usd(&self) -> f64 {
        self.ledger.spent_usd()
    }
}
