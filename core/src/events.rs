//! Pipeline events
//!
//! A closed tagged union covering every observable transition of a run.
//! Events are appended to the store and mirrored to an append-only JSONL
//! log per intent under `<data_dir>/logs/` for replay and debugging.

use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::store::types::{Decision, IntentStatus, Strategy};

/// All pipeline events
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PipelineEvent {
    /// An intent entered the pipeline
    IntentReceived {
        intent_id: String,
        session_id: String,
        message_preview: String,
        timestamp: DateTime<Utc>,
    },

    /// The intent moved to a new phase
    PhaseEntered {
        intent_id: String,
        phase: IntentStatus,
        timestamp: DateTime<Utc>,
    },

    /// Parsing surfaced open questions
    ClarificationRequested {
        intent_id: String,
        questions: Vec<String>,
        timestamp: DateTime<Utc>,
    },

    /// A specification version was compiled
    SpecCompiled {
        intent_id: String,
        spec_id: String,
        version: u32,
        assertion_count: usize,
        timestamp: DateTime<Utc>,
    },

    /// One generation attempt finished (kept or discarded)
    AttemptGenerated {
        intent_id: String,
        attempt_id: String,
        strategy: Strategy,
        kept: bool,
        timestamp: DateTime<Utc>,
    },

    /// The generation batch finished
    GenerationFinished {
        intent_id: String,
        kept: usize,
        discarded: usize,
        failed: usize,
        cost_stopped: bool,
        timestamp: DateTime<Utc>,
    },

    /// One verification finished
    VerificationFinished {
        intent_id: String,
        attempt_id: String,
        verification_id: String,
        passed: bool,
        first_failure: Option<String>,
        timestamp: DateTime<Utc>,
    },

    /// Survivors were ranked and recorded
    SurvivorsRanked {
        intent_id: String,
        count: usize,
        low_diversity: bool,
        timestamp: DateTime<Utc>,
    },

    /// A judgment was recorded
    JudgmentRecorded {
        intent_id: String,
        decision: Decision,
        survivor_id: Option<String>,
        timestamp: DateTime<Utc>,
    },

    /// An accepted survivor's changes were applied to the project tree
    ChangesApplied {
        intent_id: String,
        survivor_id: String,
        file_count: usize,
        timestamp: DateTime<Utc>,
    },

    /// The intent reached a terminal state
    IntentFinished {
        intent_id: String,
        status: IntentStatus,
        reason: Option<String>,
        timestamp: DateTime<Utc>,
    },
}

impl PipelineEvent {
    /// Timestamp of this event
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            Self::IntentReceived { timestamp, .. } => *timestamp,
            Self::PhaseEntered { timestamp, .. } => *timestamp,
            Self::ClarificationRequested { timestamp, .. } => *timestamp,
            Self::SpecCompiled { timestamp, .. } => *timestamp,
            Self::AttemptGenerated { timestamp, .. } => *timestamp,
            Self::GenerationFinished { timestamp, .. } => *timestamp,
            Self::VerificationFinished { timestamp, .. } => *timestamp,
            Self::SurvivorsRanked { timestamp, .. } => *timestamp,
            Self::JudgmentRecorded { timestamp, .. } => *timestamp,
            Self::ChangesApplied { timestamp, .. } => *timestamp,
            Self::IntentFinished { timestamp, .. } => *timestamp,
        }
    }

    /// Intent this event belongs to
    pub fn intent_id(&self) -> &str {
        match self {
            Self::IntentReceived { intent_id, .. } => intent_id,
            Self::PhaseEntered { intent_id, .. } => intent_id,
            Self::ClarificationRequested { intent_id, .. } => intent_id,
            Self::SpecCompiled { intent_id, .. } => intent_id,
            Self::AttemptGenerated { intent_id, .. } => intent_id,
            Self::GenerationFinished { intent_id, .. } => intent_id,
            Self::VerificationFinished { intent_id, .. } => intent_id,
            Self::SurvivorsRanked { intent_id, .. } => intent_id,
            Self::JudgmentRecorded { intent_id, .. } => intent_id,
            Self::ChangesApplied { intent_id, .. } => intent_id,
            Self::IntentFinished { intent_id, .. } => intent_id,
        }
    }
}

/// Append-only JSONL event log, one file per intent
pub struct IntentLog {
    dir: PathBuf,
}

impl IntentLog {
    /// Create a log rooted at `<data_dir>/logs/`
    pub fn new(data_dir: impl AsRef<Path>) -> std::io::Result<Self> {
        let dir = data_dir.as_ref().join("logs");
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    /// Path of the log file for one intent
    pub fn path_for(&self, intent_id: &str) -> PathBuf {
        self.dir.join(format!("{intent_id}.jsonl"))
    }

    /// Append an event line. Log failures are non-fatal and only warned;
    /// the store copy is the durable one.
    pub fn append(&self, event: &PipelineEvent) {
        let path = self.path_for(event.intent_id());
        let line = match serde_json::to_string(event) {
            Ok(line) => line,
            Err(e) => {
                warn!(error = %e, "Failed to serialize event for intent log");
                return;
            }
        };
        let result = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .and_then(|mut f| writeln!(f, "{line}"));
        if let Err(e) = result {
            warn!(path = %path.display(), error = %e, "Failed to append intent log");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_event_json_round_trip() {
        let event = PipelineEvent::PhaseEntered {
            intent_id: "intent-1".into(),
            phase: IntentStatus::Generating,
            timestamp: Utc::now(),
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"type\":\"phase_entered\""));
        let parsed: PipelineEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.intent_id(), "intent-1");
    }

    #[test]
    fn test_intent_log_appends_lines() {
        let dir = tempdir().unwrap();
        let log = IntentLog::new(dir.path()).unwrap();

        for phase in [IntentStatus::Parsing, IntentStatus::Compiling] {
            log.append(&PipelineEvent::PhaseEntered {
                intent_id: "intent-1".into(),
                phase,
                timestamp: Utc::now(),
            });
        }

        let contents = std::fs::read_to_string(log.path_for("intent-1")).unwrap();
        assert_eq!(contents.lines().count(), 2);
        for line in contents.lines() {
            let _: PipelineEvent = serde_json::from_str(line).unwrap();
        }
    }
}
