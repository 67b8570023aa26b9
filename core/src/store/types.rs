//! Domain types for the pipeline lineage
//!
//! Every entity the store persists: Intent, Specification, Attempt,
//! Verification, Survivor, Judgment. Constructors enforce the invariants
//! the rest of the pipeline relies on (disjoint path sets, delete-only
//! absent content, clamped weights and confidences).

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::PipelineError;

/// Unique identifier for intents
pub type IntentId = String;

/// Unique identifier for specifications
pub type SpecId = String;

/// Unique identifier for attempts
pub type AttemptId = String;

/// Phase of an intent's pipeline run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntentStatus {
    /// The raw message is being parsed into structured form
    Parsing,
    /// Parsing surfaced open questions; waiting on the human
    Clarifying,
    /// The structured intent is being compiled into a Specification
    Compiling,
    /// Candidate attempts are being generated
    Generating,
    /// Attempts are being verified in isolated workspaces
    Verifying,
    /// Passing attempts are being scored and ordered
    Ranking,
    /// Survivors are presented; waiting on a Judgment
    Judging,
    /// A survivor was accepted and applied
    Complete,
    /// The pipeline terminated without an applied change
    Failed,
    /// The human or a shutdown cancelled the run
    Aborted,
}

impl IntentStatus {
    /// Whether this status ends the intent's lifecycle
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::Failed | Self::Aborted)
    }

    /// Position in the forward phase order; terminal states share the top slot
    pub fn ordinal(&self) -> u8 {
        match self {
            Self::Parsing => 0,
            Self::Clarifying => 1,
            Self::Compiling => 2,
            Self::Generating => 3,
            Self::Verifying => 4,
            Self::Ranking => 5,
            Self::Judging => 6,
            Self::Complete | Self::Failed | Self::Aborted => 7,
        }
    }

    /// Whether moving to `next` is a legal transition.
    ///
    /// Progression is monotonic, with two sanctioned loops: clarifying
    /// re-enters parsing once answers arrive, and a refine judgment
    /// re-enters compiling. Terminal states accept nothing.
    pub fn can_transition_to(&self, next: IntentStatus) -> bool {
        if self.is_terminal() {
            return false;
        }
        match (self, next) {
            (Self::Clarifying, Self::Parsing) => true,
            (Self::Compiling, Self::Clarifying) => true,
            (Self::Judging, Self::Compiling) => true,
            _ => next.ordinal() >= self.ordinal(),
        }
    }
}

impl std::fmt::Display for IntentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Parsing => "parsing",
            Self::Clarifying => "clarifying",
            Self::Compiling => "compiling",
            Self::Generating => "generating",
            Self::Verifying => "verifying",
            Self::Ranking => "ranking",
            Self::Judging => "judging",
            Self::Complete => "complete",
            Self::Failed => "failed",
            Self::Aborted => "aborted",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for IntentStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "parsing" => Ok(Self::Parsing),
            "clarifying" => Ok(Self::Clarifying),
            "compiling" => Ok(Self::Compiling),
            "generating" => Ok(Self::Generating),
            "verifying" => Ok(Self::Verifying),
            "ranking" => Ok(Self::Ranking),
            "judging" => Ok(Self::Judging),
            "complete" => Ok(Self::Complete),
            "failed" => Ok(Self::Failed),
            "aborted" => Ok(Self::Aborted),
            other => Err(format!("unknown intent status: {other}")),
        }
    }
}

/// Structured form of a raw feature request
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ParsedIntent {
    /// One-sentence core of the request
    pub core: String,
    /// Hard requirements, in stated order
    #[serde(default)]
    pub must: Vec<String>,
    /// Hard prohibitions, in stated order
    #[serde(default)]
    pub must_not: Vec<String>,
    /// Observable completion conditions, one assertion each
    #[serde(default)]
    pub done_when: Vec<String>,
    /// Open questions that block compilation
    #[serde(default)]
    pub unclear: Vec<String>,
    /// Free-text scope hint
    #[serde(default)]
    pub scope: Option<String>,
}

impl ParsedIntent {
    /// Whether open questions block compilation
    pub fn needs_clarification(&self) -> bool {
        !self.unclear.is_empty()
    }
}

/// One pipeline run, from raw message to judgment
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Intent {
    /// Unique intent identifier
    pub id: IntentId,
    /// Session this intent belongs to
    pub session_id: String,
    /// The raw human message, with refinements appended
    pub raw_message: String,
    /// Structured form, present once parsing succeeded
    pub parsed: Option<ParsedIntent>,
    /// Current pipeline phase
    pub status: IntentStatus,
    /// Number of refine judgments applied so far
    pub refinement_count: u32,
    /// Creation timestamp
    pub created_at: DateTime<Utc>,
    /// Last status change timestamp
    pub updated_at: DateTime<Utc>,
}

impl Intent {
    /// Create a new intent at the parsing phase
    pub fn new(session_id: impl Into<String>, raw_message: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            session_id: session_id.into(),
            raw_message: raw_message.into(),
            parsed: None,
            status: IntentStatus::Parsing,
            refinement_count: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// Append refinement text to the raw message and count it
    pub fn apply_refinement(&mut self, text: &str) {
        self.raw_message.push_str("\n\n");
        self.raw_message.push_str(text);
        self.refinement_count += 1;
        self.updated_at = Utc::now();
    }
}

/// One testable success criterion
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Assertion {
    /// Stable identifier within the spec
    pub id: String,
    /// Human-readable description of the criterion
    pub description: String,
    /// Executable test text
    pub test: String,
    /// Importance weight, 1..=10
    pub weight: u8,
}

impl Assertion {
    /// Create an assertion, clamping the weight into 1..=10
    pub fn new(
        id: impl Into<String>,
        description: impl Into<String>,
        test: impl Into<String>,
        weight: u8,
    ) -> Self {
        Self {
            id: id.into(),
            description: description.into(),
            test: test.into(),
            weight: weight.clamp(1, 10),
        }
    }
}

/// The executable, testable definition of "done" for one intent version
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Specification {
    /// Content-derived identifier (stable for identical inputs)
    pub id: SpecId,
    /// Owning intent
    pub intent_id: IntentId,
    /// Monotonic version, bumped on refinement
    pub version: u32,
    /// Ordered success criteria
    pub assertions: Vec<Assertion>,
    /// Complete test-suite text written into each workspace
    pub test_suite: String,
    /// Type contract text handed to generators
    pub type_contract: String,
    /// Paths an attempt may create or modify
    pub may_touch: BTreeSet<String>,
    /// Paths an attempt must not touch
    pub must_not_touch: BTreeSet<String>,
    /// Codebase patterns generators should follow
    pub patterns: Vec<String>,
    /// Creation timestamp
    pub created_at: DateTime<Utc>,
}

impl Specification {
    /// Construct a specification, enforcing its invariants.
    ///
    /// Rejects an empty assertion set, an assertion with a blank test, and
    /// any overlap between `may_touch` and `must_not_touch`.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: SpecId,
        intent_id: IntentId,
        version: u32,
        assertions: Vec<Assertion>,
        test_suite: String,
        type_contract: String,
        may_touch: BTreeSet<String>,
        must_not_touch: BTreeSet<String>,
        patterns: Vec<String>,
    ) -> Result<Self, PipelineError> {
        if assertions.is_empty() {
            return Err(PipelineError::NoTestableConditions);
        }
        if let Some(blank) = assertions.iter().find(|a| a.test.trim().is_empty()) {
            return Err(PipelineError::MalformedAiResponse {
                step: "spec".into(),
                message: format!("assertion {} has no executable test", blank.id),
            });
        }
        let overlap: Vec<String> = may_touch.intersection(&must_not_touch).cloned().collect();
        if !overlap.is_empty() {
            return Err(PipelineError::ContradictoryConstraints { paths: overlap });
        }
        Ok(Self {
            id,
            intent_id,
            version,
            assertions,
            test_suite,
            type_contract,
            may_touch,
            must_not_touch,
            patterns,
            created_at: Utc::now(),
        })
    }

    /// Whether `path` is inside the allowed set and outside the forbidden set.
    ///
    /// Set entries match exactly or as directory prefixes.
    pub fn path_allowed(&self, path: &str) -> bool {
        let denied = Self::set_covers(&self.must_not_touch, path);
        let allowed = Self::set_covers(&self.may_touch, path);
        allowed && !denied
    }

    fn set_covers(set: &BTreeSet<String>, path: &str) -> bool {
        set.iter().any(|entry| {
            let entry = entry.trim_end_matches('/');
            path == entry || path.starts_with(&format!("{entry}/"))
        })
    }
}

/// Generation strategy of an attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    /// Straightforward implementation
    Vanilla,
    /// Fewest lines that satisfy the spec
    Minimal,
    /// Maximum input validation and error handling
    Defensive,
    /// Match the codebase's existing style and patterns
    Patterned,
    /// Variation of a completed sibling in the same batch
    Mutation,
    /// Literal satisfaction of the tests only
    Adversarial,
}

impl Strategy {
    /// All strategies, in distribution order
    pub fn all() -> &'static [Strategy] {
        &[
            Strategy::Vanilla,
            Strategy::Minimal,
            Strategy::Defensive,
            Strategy::Patterned,
            Strategy::Mutation,
            Strategy::Adversarial,
        ]
    }
}

impl std::fmt::Display for Strategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Strategy::Vanilla => "vanilla",
            Strategy::Minimal => "minimal",
            Strategy::Defensive => "defensive",
            Strategy::Patterned => "patterned",
            Strategy::Mutation => "mutation",
            Strategy::Adversarial => "adversarial",
        };
        write!(f, "{s}")
    }
}

/// What an attempt does to one file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileAction {
    Create,
    Modify,
    Delete,
}

/// One file-level change within an attempt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileChange {
    /// Project-relative path
    pub path: String,
    /// Create, modify, or delete
    pub action: FileAction,
    /// New content; absent exactly when the action is delete
    pub content: Option<String>,
}

impl FileChange {
    /// A create change with content
    pub fn create(path: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            action: FileAction::Create,
            content: Some(content.into()),
        }
    }

    /// A modify change with content
    pub fn modify(path: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            action: FileAction::Modify,
            content: Some(content.into()),
        }
    }

    /// A delete change (no content)
    pub fn delete(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            action: FileAction::Delete,
            content: None,
        }
    }

    /// Content present iff the action is not delete
    pub fn is_well_formed(&self) -> bool {
        match self.action {
            FileAction::Delete => self.content.is_none(),
            _ => self.content.is_some(),
        }
    }
}

/// Lifecycle status of an attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptStatus {
    Pending,
    Verifying,
    Passed,
    Failed,
    Discarded,
}

impl std::fmt::Display for AttemptStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Verifying => "verifying",
            Self::Passed => "passed",
            Self::Failed => "failed",
            Self::Discarded => "discarded",
        };
        write!(f, "{s}")
    }
}

/// One candidate implementation produced by one generation call
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Attempt {
    /// Unique attempt identifier
    pub id: AttemptId,
    /// Owning specification
    pub spec_id: SpecId,
    /// Specification version this attempt targets
    pub spec_version: u32,
    /// Strategy that produced it
    pub strategy: Strategy,
    /// Ordered file changes
    pub changes: Vec<FileChange>,
    /// Short self-description of the approach
    pub approach: String,
    /// Self-reported confidence in [0,1]
    pub confidence: f64,
    /// Lifecycle status
    pub status: AttemptStatus,
    /// Creation timestamp
    pub created_at: DateTime<Utc>,
}

impl Attempt {
    /// Create a pending attempt, clamping confidence into [0,1]
    pub fn new(
        spec_id: SpecId,
        spec_version: u32,
        strategy: Strategy,
        changes: Vec<FileChange>,
        approach: impl Into<String>,
        confidence: f64,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            spec_id,
            spec_version,
            strategy,
            changes,
            approach: approach.into(),
            confidence: confidence.clamp(0.0, 1.0),
            status: AttemptStatus::Pending,
            created_at: Utc::now(),
        }
    }

    /// Content hash over the ordered (path, action, content) triples.
    ///
    /// Identical hashes collapse to one attempt during dedup.
    pub fn content_hash(&self) -> String {
        let mut hasher = blake3::Hasher::new();
        for change in &self.changes {
            hasher.update(change.path.as_bytes());
            hasher.update(&[match change.action {
                FileAction::Create => 0u8,
                FileAction::Modify => 1,
                FileAction::Delete => 2,
            }]);
            if let Some(content) = &change.content {
                hasher.update(content.as_bytes());
            }
            hasher.update(&[0xff]);
        }
        hasher.finalize().to_hex().to_string()
    }

    /// Total lines across created and modified content
    pub fn changed_line_count(&self) -> usize {
        self.changes
            .iter()
            .filter_map(|c| c.content.as_deref())
            .map(|content| content.lines().count())
            .sum()
    }
}

/// Verification stage identifiers, in execution order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Typecheck,
    Lint,
    UnitTests,
    SpecTests,
}

impl Stage {
    /// All stages, in execution order
    pub fn all() -> &'static [Stage] {
        &[Stage::Typecheck, Stage::Lint, Stage::UnitTests, Stage::SpecTests]
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Stage::Typecheck => "typecheck",
            Stage::Lint => "lint",
            Stage::UnitTests => "unit_tests",
            Stage::SpecTests => "spec_tests",
        };
        write!(f, "{s}")
    }
}

/// Outcome of one verification stage
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckResult {
    /// Which stage ran
    pub stage: Stage,
    /// Whether the stage passed
    pub passed: bool,
    /// Exit code; None for spawn failure or kill
    pub exit_code: Option<i32>,
    /// Captured output (truncated to the configured cap)
    pub output: String,
    /// Extracted error lines
    pub errors: Vec<String>,
    /// Wall-clock duration in milliseconds
    pub duration_ms: u64,
    /// Whether the stage was stopped at its deadline
    pub timed_out: bool,
    /// Whether the stage was skipped after an earlier hard failure
    pub skipped: bool,
}

impl CheckResult {
    /// A skipped stage record (earlier stage failed hard)
    pub fn skipped(stage: Stage) -> Self {
        Self {
            stage,
            passed: false,
            exit_code: None,
            output: String::new(),
            errors: Vec::new(),
            duration_ms: 0,
            timed_out: false,
            skipped: true,
        }
    }
}

/// The stage-by-stage reality check of one attempt
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Verification {
    /// Unique verification identifier
    pub id: String,
    /// Attempt this verification judged
    pub attempt_id: AttemptId,
    /// Conjunction of all executed stages' outcomes
    pub passed: bool,
    /// Per-stage results, in execution order
    pub stages: Vec<CheckResult>,
    /// Assertions that passed (weighted count source)
    pub assertions_passed: u32,
    /// Total assertions in the owning spec
    pub assertions_total: u32,
    /// Total verification duration in milliseconds
    pub duration_ms: u64,
    /// Summary of the first failing stage, if any
    pub first_failure: Option<String>,
    /// Creation timestamp
    pub created_at: DateTime<Utc>,
}

impl Verification {
    /// Assemble a verification from stage results, deriving `passed`,
    /// `first_failure`, and the full-success assertion count.
    pub fn from_stages(
        attempt_id: AttemptId,
        stages: Vec<CheckResult>,
        assertions_passed: u32,
        assertions_total: u32,
        duration_ms: u64,
    ) -> Self {
        let passed = !stages.is_empty() && stages.iter().all(|s| s.passed && !s.skipped);
        let first_failure = stages
            .iter()
            .find(|s| !s.passed && !s.skipped)
            .map(|s| {
                let reason = if s.timed_out {
                    "deadline exceeded".to_string()
                } else if s.exit_code.is_none() {
                    "failed to launch".to_string()
                } else {
                    s.errors
                        .first()
                        .cloned()
                        .unwrap_or_else(|| format!("exit code {}", s.exit_code.unwrap()))
                };
                format!("{}: {}", s.stage, reason)
            });
        let assertions_passed = if passed {
            assertions_total
        } else {
            assertions_passed.min(assertions_total)
        };
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            attempt_id,
            passed,
            stages,
            assertions_passed,
            assertions_total,
            duration_ms,
            first_failure,
            created_at: Utc::now(),
        }
    }
}

/// Per-axis and overall scores, each in [0,1]
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScoreCard {
    pub assertions: f64,
    pub simplicity: f64,
    pub readability: f64,
    pub performance: f64,
    pub overall: f64,
}

/// A passing attempt, ranked among its peers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Survivor {
    /// Unique survivor identifier
    pub id: String,
    /// Intent presentation this survivor belongs to
    pub intent_id: IntentId,
    /// The passing attempt
    pub attempt_id: AttemptId,
    /// The verification that admitted it
    pub verification_id: String,
    /// 1-based rank within the presentation
    pub rank: u32,
    /// Score breakdown
    pub score: ScoreCard,
    /// Whether it has been shown to the human
    pub presented: bool,
}

/// The human's decision over presented survivors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Accept,
    Refine,
    Redirect,
    Abort,
}

impl std::fmt::Display for Decision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Decision::Accept => "accept",
            Decision::Refine => "refine",
            Decision::Redirect => "redirect",
            Decision::Abort => "abort",
        };
        write!(f, "{s}")
    }
}

/// A recorded judgment over an intent's presentation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Judgment {
    /// Unique judgment identifier
    pub id: String,
    /// Intent judged
    pub intent_id: IntentId,
    /// Accepted survivor; present exactly for accept
    pub survivor_id: Option<String>,
    /// Decision kind
    pub decision: Decision,
    /// Refinement text; present exactly for refine
    pub refinement: Option<String>,
    /// Redirect text; present exactly for redirect
    pub redirect: Option<String>,
    /// Decision timestamp
    pub created_at: DateTime<Utc>,
}

impl Judgment {
    fn base(intent_id: IntentId, decision: Decision) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            intent_id,
            survivor_id: None,
            decision,
            refinement: None,
            redirect: None,
            created_at: Utc::now(),
        }
    }

    /// Accept a specific survivor
    pub fn accept(intent_id: IntentId, survivor_id: impl Into<String>) -> Self {
        let mut j = Self::base(intent_id, Decision::Accept);
        j.survivor_id = Some(survivor_id.into());
        j
    }

    /// Refine the intent with additional text
    pub fn refine(intent_id: IntentId, text: impl Into<String>) -> Self {
        let mut j = Self::base(intent_id, Decision::Refine);
        j.refinement = Some(text.into());
        j
    }

    /// Redirect the session to a new request
    pub fn redirect(intent_id: IntentId, text: impl Into<String>) -> Self {
        let mut j = Self::base(intent_id, Decision::Redirect);
        j.redirect = Some(text.into());
        j
    }

    /// Abort the intent
    pub fn abort(intent_id: IntentId) -> Self {
        Self::base(intent_id, Decision::Abort)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec_with_paths(
        may: &[&str],
        must_not: &[&str],
    ) -> Result<Specification, PipelineError> {
        Specification::new(
            "spec-1".into(),
            "intent-1".into(),
            1,
            vec![Assertion::new("a1", "it works", "assert(works)", 5)],
            "suite".into(),
            "contract".into(),
            may.iter().map(|s| s.to_string()).collect(),
            must_not.iter().map(|s| s.to_string()).collect(),
            Vec::new(),
        )
    }

    #[test]
    fn test_status_progression_is_monotonic() {
        assert!(IntentStatus::Parsing.can_transition_to(IntentStatus::Compiling));
        assert!(IntentStatus::Generating.can_transition_to(IntentStatus::Verifying));
        assert!(!IntentStatus::Verifying.can_transition_to(IntentStatus::Generating));
        assert!(!IntentStatus::Complete.can_transition_to(IntentStatus::Parsing));
    }

    #[test]
    fn test_status_sanctioned_loops() {
        assert!(IntentStatus::Clarifying.can_transition_to(IntentStatus::Parsing));
        assert!(IntentStatus::Compiling.can_transition_to(IntentStatus::Clarifying));
        assert!(IntentStatus::Judging.can_transition_to(IntentStatus::Compiling));
    }

    #[test]
    fn test_status_round_trips_through_str() {
        for status in [
            IntentStatus::Parsing,
            IntentStatus::Clarifying,
            IntentStatus::Judging,
            IntentStatus::Aborted,
        ] {
            let parsed: IntentStatus = status.to_string().parse().unwrap();
            assert_eq!(parsed, status);
        }
    }

    #[test]
    fn test_spec_rejects_overlapping_path_sets() {
        let err = spec_with_paths(&["src/auth.rs", "src/db.rs"], &["src/db.rs"]).unwrap_err();
        assert_eq!(err.kind(), "contradictory_constraints");
    }

    #[test]
    fn test_spec_rejects_empty_assertions() {
        let err = Specification::new(
            "spec-1".into(),
            "intent-1".into(),
            1,
            Vec::new(),
            "suite".into(),
            "contract".into(),
            BTreeSet::new(),
            BTreeSet::new(),
            Vec::new(),
        )
        .unwrap_err();
        assert_eq!(err.kind(), "no_testable_conditions");
    }

    #[test]
    fn test_spec_rejects_blank_test() {
        let err = Specification::new(
            "spec-1".into(),
            "intent-1".into(),
            1,
            vec![Assertion::new("a1", "desc", "   ", 5)],
            "suite".into(),
            "contract".into(),
            BTreeSet::new(),
            BTreeSet::new(),
            Vec::new(),
        )
        .unwrap_err();
        assert_eq!(err.kind(), "malformed_ai_response");
    }

    #[test]
    fn test_path_allowed_with_prefixes() {
        let spec = spec_with_paths(&["src/auth"], &["migrations"]).unwrap();
        assert!(spec.path_allowed("src/auth/login.rs"));
        assert!(spec.path_allowed("src/auth"));
        assert!(!spec.path_allowed("migrations/0001_init.sql"));
        assert!(!spec.path_allowed("src/other.rs"));
    }

    #[test]
    fn test_assertion_weight_clamped() {
        assert_eq!(Assertion::new("a", "d", "t", 0).weight, 1);
        assert_eq!(Assertion::new("a", "d", "t", 50).weight, 10);
    }

    #[test]
    fn test_file_change_well_formed() {
        assert!(FileChange::create("a.rs", "fn main() {}").is_well_formed());
        assert!(FileChange::delete("a.rs").is_well_formed());
        let bad = FileChange {
            path: "a.rs".into(),
            action: FileAction::Delete,
            content: Some("x".into()),
        };
        assert!(!bad.is_well_formed());
    }

    #[test]
    fn test_content_hash_detects_duplicates() {
        let a = Attempt::new(
            "spec-1".into(),
            1,
            Strategy::Vanilla,
            vec![FileChange::create("a.rs", "fn a() {}")],
            "direct",
            0.8,
        );
        let b = Attempt::new(
            "spec-1".into(),
            1,
            Strategy::Minimal,
            vec![FileChange::create("a.rs", "fn a() {}")],
            "terse",
            0.6,
        );
        let c = Attempt::new(
            "spec-1".into(),
            1,
            Strategy::Vanilla,
            vec![FileChange::create("a.rs", "fn a() { /* different */ }")],
            "direct",
            0.8,
        );
        assert_eq!(a.content_hash(), b.content_hash());
        assert_ne!(a.content_hash(), c.content_hash());
    }

    #[test]
    fn test_verification_passed_is_conjunction() {
        let ok = CheckResult {
            stage: Stage::Typecheck,
            passed: true,
            exit_code: Some(0),
            output: String::new(),
            errors: Vec::new(),
            duration_ms: 10,
            timed_out: false,
            skipped: false,
        };
        let mut bad = ok.clone();
        bad.stage = Stage::Lint;
        bad.passed = false;
        bad.exit_code = Some(1);
        bad.errors = vec!["unused variable".into()];

        let v = Verification::from_stages("att-1".into(), vec![ok.clone(), bad], 1, 3, 100);
        assert!(!v.passed);
        assert!(v.first_failure.unwrap().contains("lint"));
        assert_eq!(v.assertions_passed, 1);

        let v = Verification::from_stages("att-1".into(), vec![ok], 0, 3, 100);
        assert!(v.passed);
        // Full success implies all assertions passed
        assert_eq!(v.assertions_passed, 3);
    }

    #[test]
    fn test_judgment_constructors_enforce_payloads() {
        let j = Judgment::accept("i".into(), "s-1");
        assert_eq!(j.decision, Decision::Accept);
        assert!(j.survivor_id.is_some());

        let j = Judgment::refine("i".into(), "add rate limiting");
        assert!(j.refinement.is_some());
        assert!(j.survivor_id.is_none());

        let j = Judgment::redirect("i".into(), "do something else");
        assert!(j.redirect.is_some());

        let j = Judgment::abort("i".into());
        assert!(j.survivor_id.is_none() && j.refinement.is_none() && j.redirect.is_none());
    }

    #[test]
    fn test_intent_refinement_appends() {
        let mut intent = Intent::new("sess", "add auth");
        intent.apply_refinement("must use bcrypt");
        assert!(intent.raw_message.contains("add auth"));
        assert!(intent.raw_message.contains("bcrypt"));
        assert_eq!(intent.refinement_count, 1);
    }
}
