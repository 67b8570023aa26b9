//! Pipeline error taxonomy
//!
//! One structured error type per failure kind named in the pipeline
//! contract, with machine-readable codes, retryability, and an actionable
//! suggestion for the human report.

use thiserror::Error;

use crate::gateway::GatewayError;
use crate::store::StoreError;

/// Result type alias for pipeline operations
pub type PipelineResult<T> = Result<T, PipelineError>;

/// Errors raised by the pipeline and its components
#[derive(Error, Debug)]
pub enum PipelineError {
    /// The raw message was empty or whitespace
    #[error("empty message: nothing to compile")]
    EmptyMessage,

    /// The AI backend could not be reached after the retry budget
    #[error("AI backend unavailable: {message}")]
    AiUnavailable { message: String },

    /// The AI response could not be parsed into the expected structure
    #[error("malformed AI response during {step}: {message}")]
    MalformedAiResponse { step: String, message: String },

    /// The configured cost ceiling would be exceeded by the next call
    #[error("cost ceiling reached: spent ${spent:.2} of ${ceiling:.2}")]
    CostCeilingReached { spent: f64, ceiling: f64 },

    /// The parsed intent has no done-when conditions to turn into assertions
    #[error("no testable conditions in intent")]
    NoTestableConditions,

    /// The spec's touchable and forbidden path sets overlap
    #[error("contradictory constraints: {paths:?} both allowed and forbidden")]
    ContradictoryConstraints { paths: Vec<String> },

    /// The project tree could not be enumerated
    #[error("codebase unreadable: {message}")]
    CodebaseUnreadable { message: String },

    /// A workspace directory could not be created or populated
    #[error("workspace creation failed for attempt {attempt_id}: {message}")]
    WorkspaceCreationFailed { attempt_id: String, message: String },

    /// The data directory or workspace root ran out of space
    #[error("disk full: {message}")]
    DiskFull { message: String },

    /// A verification stage exceeded its deadline
    #[error("stage {stage} timed out after {secs}s")]
    StageTimeout { stage: String, secs: u64 },

    /// A verification stage's subprocess could not be spawned
    #[error("stage {stage} crashed: {message}")]
    StageCrashed { stage: String, message: String },

    /// Store contention persisted past the retry budget
    #[error("storage contention: {0}")]
    StorageContention(String),

    /// The store failed its integrity check
    #[error("storage corruption: {0}")]
    StorageCorruption(String),

    /// The run was cancelled (abort or shutdown)
    #[error("cancelled")]
    Cancelled,

    /// Invalid phase transition requested
    #[error("invalid phase transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },

    /// Referenced entity does not exist in the store
    #[error("not found: {0}")]
    NotFound(String),

    /// Applying accepted changes to the real tree failed (rolled back)
    #[error("apply failed on {path}: {message}")]
    ApplyFailed { path: String, message: String },

    /// Configuration invalid at load time
    #[error("configuration error: {0}")]
    Config(String),

    /// Wrapped IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl PipelineError {
    /// Machine-readable code for reports and logs
    pub fn kind(&self) -> &'static str {
        match self {
            Self::EmptyMessage => "empty_message",
            Self::AiUnavailable { .. } => "ai_unavailable",
            Self::MalformedAiResponse { .. } => "malformed_ai_response",
            Self::CostCeilingReached { .. } => "cost_ceiling_reached",
            Self::NoTestableConditions => "no_testable_conditions",
            Self::ContradictoryConstraints { .. } => "contradictory_constraints",
            Self::CodebaseUnreadable { .. } => "codebase_unreadable",
            Self::WorkspaceCreationFailed { .. } => "workspace_creation_failed",
            Self::DiskFull { .. } => "disk_full",
            Self::StageTimeout { .. } => "stage_timeout",
            Self::StageCrashed { .. } => "stage_crashed",
            Self::StorageContention(_) => "storage_contention",
            Self::StorageCorruption(_) => "storage_corruption",
            Self::Cancelled => "cancelled",
            Self::InvalidTransition { .. } => "invalid_transition",
            Self::NotFound(_) => "not_found",
            Self::ApplyFailed { .. } => "apply_failed",
            Self::Config(_) => "config_error",
            Self::Io(_) => "io_error",
        }
    }

    /// Whether a retry at the same level can reasonably succeed
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::StorageContention(_) => true,
            Self::AiUnavailable { .. } => true,
            Self::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::WouldBlock
                    | std::io::ErrorKind::Interrupted
                    | std::io::ErrorKind::TimedOut
            ),
            _ => false,
        }
    }

    /// Actionable suggestion for the final human-facing report
    pub fn suggestion(&self) -> Option<String> {
        match self {
            Self::EmptyMessage => {
                Some("Describe the change you want, e.g. \"add retry to the upload client\".".into())
            }
            Self::NoTestableConditions => Some(
                "Add at least one observable success condition (\"done when ...\") to the request."
                    .into(),
            ),
            Self::ContradictoryConstraints { paths } => Some(format!(
                "Paths {paths:?} are both required and forbidden; drop one of the constraints."
            )),
            Self::CostCeilingReached { ceiling, .. } => Some(format!(
                "Raise the cost ceiling (currently ${ceiling:.2}) or reduce the generation count."
            )),
            Self::CodebaseUnreadable { .. } => {
                Some("Check that the project root exists and is readable.".into())
            }
            Self::DiskFull { .. } => Some(
                "Free disk space or lower the workspace disk cap, then re-run the intent.".into(),
            ),
            Self::StorageCorruption(_) => Some(
                "The database failed its integrity check; restore it from a backup or remove it \
                 to start a fresh history."
                    .into(),
            ),
            _ => None,
        }
    }
}

impl From<StoreError> for PipelineError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Busy(msg) => Self::StorageContention(msg),
            StoreError::Corrupt(msg) => Self::StorageCorruption(msg),
            StoreError::DiskFull(msg) => Self::DiskFull { message: msg },
            StoreError::NotFound(what) => Self::NotFound(what),
            schema @ StoreError::SchemaTooNew { .. } => {
                Self::StorageCorruption(schema.to_string())
            }
            other => Self::StorageContention(other.to_string()),
        }
    }
}

impl From<GatewayError> for PipelineError {
    fn from(e: GatewayError) -> Self {
        match e {
            GatewayError::CostCeilingReached { spent, ceiling } => {
                Self::CostCeilingReached { spent, ceiling }
            }
            GatewayError::Cancelled => Self::Cancelled,
            other => Self::AiUnavailable {
                message: other.to_string(),
            },
        }
    }
}
