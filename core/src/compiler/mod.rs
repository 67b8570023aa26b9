//! Intent Compiler
//!
//! Converts a raw feature request into a Specification ready for
//! generation: parse the message, analyze the codebase, compile an
//! executable spec, validate it. A non-empty `unclear` list halts
//! compilation with a clarification request instead of a spec.

pub mod walker;

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::{PipelineError, PipelineResult};
use crate::gateway::{prompts, AiGateway, CompletionRequest, Purpose};
use crate::store::types::{Assertion, Intent, ParsedIntent, Specification};
use self::walker::ProjectScan;

/// Result of a compilation pass
#[derive(Debug)]
pub enum CompileOutcome {
    /// A validated specification, ready for generation
    Ready(Box<Specification>),
    /// Open questions the human must answer before compilation can proceed
    Clarify(Vec<String>),
}

/// What the analyzer learned about the codebase
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CodebaseAnalysis {
    /// Files most relevant to the intent
    #[serde(default)]
    pub relevant_files: Vec<String>,
    /// Conventions generators should follow
    #[serde(default)]
    pub patterns: Vec<String>,
    /// Paths the change must not touch
    #[serde(default)]
    pub forbidden_zones: Vec<String>,
    /// Files or directories the change may create or modify
    #[serde(default)]
    pub integration_points: Vec<String>,
}

#[derive(Deserialize)]
struct SpecWire {
    assertions: Vec<AssertionWire>,
    #[serde(default)]
    test_suite: String,
    #[serde(default)]
    type_contract: String,
}

#[derive(Deserialize)]
struct AssertionWire {
    description: String,
    test: String,
    #[serde(default = "default_weight")]
    weight: u8,
}

fn default_weight() -> u8 {
    5
}

/// Compiles raw messages into specifications
pub struct IntentCompiler {
    gateway: Arc<dyn AiGateway>,
    project_root: PathBuf,
    analysis_excludes: Vec<String>,
    max_file_bytes: u64,
    call_deadline: Duration,
}

impl IntentCompiler {
    pub fn new(
        gateway: Arc<dyn AiGateway>,
        project_root: impl Into<PathBuf>,
        analysis_excludes: Vec<String>,
        max_file_bytes: u64,
        call_deadline: Duration,
    ) -> Self {
        Self {
            gateway,
            project_root: project_root.into(),
            analysis_excludes,
            max_file_bytes,
            call_deadline,
        }
    }

    /// Parse the raw message into structured intent fields.
    ///
    /// Fails with `empty_message` before spending an AI call on blank input.
    pub async fn parse(
        &self,
        raw_message: &str,
        cancel: &CancellationToken,
    ) -> PipelineResult<ParsedIntent> {
        if raw_message.trim().is_empty() {
            return Err(PipelineError::EmptyMessage);
        }
        let completion = self
            .gateway
            .complete(
                CompletionRequest {
                    purpose: Purpose::Parse,
                    prompt: prompts::parse_prompt(raw_message),
                    deadline: self.call_deadline,
                },
                cancel,
            )
            .await?;
        let parsed: ParsedIntent = extract_json(&completion.text, "parse")?;
        if parsed.core.trim().is_empty() {
            return Err(PipelineError::MalformedAiResponse {
                step: "parse".into(),
                message: "empty core sentence".into(),
            });
        }
        debug!(
            done_when = parsed.done_when.len(),
            unclear = parsed.unclear.len(),
            "Parsed intent"
        );
        Ok(parsed)
    }

    /// Enumerate the project and ask the analyzer where the change lands
    pub async fn analyze(
        &self,
        parsed: &ParsedIntent,
        cancel: &CancellationToken,
    ) -> PipelineResult<(ProjectScan, CodebaseAnalysis)> {
        let scan = ProjectScan::scan(
            &self.project_root,
            &self.analysis_excludes,
            self.max_file_bytes,
        )?;
        let completion = self
            .gateway
            .complete(
                CompletionRequest {
                    purpose: Purpose::Analyze,
                    prompt: prompts::analyze_prompt(parsed, &scan.tree_summary()),
                    deadline: self.call_deadline,
                },
                cancel,
            )
            .await?;
        let analysis: CodebaseAnalysis = extract_json(&completion.text, "analyze")?;
        info!(
            relevant = analysis.relevant_files.len(),
            integration_points = analysis.integration_points.len(),
            forbidden = analysis.forbidden_zones.len(),
            "Codebase analyzed"
        );
        Ok((scan, analysis))
    }

    /// Compile the full pipeline: parse, analyze, generate spec, validate.
    pub async fn compile(
        &self,
        intent: &Intent,
        version: u32,
        cancel: &CancellationToken,
    ) -> PipelineResult<CompileOutcome> {
        let parsed = match &intent.parsed {
            Some(parsed) => parsed.clone(),
            None => self.parse(&intent.raw_message, cancel).await?,
        };
        if parsed.needs_clarification() {
            return Ok(CompileOutcome::Clarify(parsed.unclear));
        }
        if parsed.done_when.is_empty() {
            return Err(PipelineError::NoTestableConditions);
        }

        let (scan, analysis) = self.analyze(&parsed, cancel).await?;
        let spec = self
            .generate_spec(&intent.id, version, &parsed, &scan, &analysis, cancel)
            .await?;
        Ok(CompileOutcome::Ready(Box::new(spec)))
    }

    /// One Spec-purpose call turns done-when conditions into assertions,
    /// a test suite, and a type contract; path sets come from the analysis.
    async fn generate_spec(
        &self,
        intent_id: &str,
        version: u32,
        parsed: &ParsedIntent,
        scan: &ProjectScan,
        analysis: &CodebaseAnalysis,
        cancel: &CancellationToken,
    ) -> PipelineResult<Specification> {
        let completion = self
            .gateway
            .complete(
                CompletionRequest {
                    purpose: Purpose::Spec,
                    prompt: prompts::spec_prompt(
                        parsed,
                        &analysis.relevant_files,
                        &analysis.patterns,
                    ),
                    deadline: self.call_deadline,
                },
                cancel,
            )
            .await?;
        let wire: SpecWire = extract_json(&completion.text, "spec")?;
        if wire.assertions.is_empty() {
            return Err(PipelineError::NoTestableConditions);
        }

        let assertions: Vec<Assertion> = wire
            .assertions
            .into_iter()
            .enumerate()
            .map(|(i, a)| Assertion::new(format!("a{}", i + 1), a.description, a.test, a.weight))
            .collect();

        // may_touch = integration points plus relevant files (new files land
        // under integration points); must_not_touch = forbidden zones
        let may_touch: BTreeSet<String> = analysis
            .integration_points
            .iter()
            .chain(analysis.relevant_files.iter())
            .map(|s| normalize_path(s))
            .collect();
        let must_not_touch: BTreeSet<String> = analysis
            .forbidden_zones
            .iter()
            .map(|s| normalize_path(s))
            .collect();
        if may_touch.is_empty() {
            return Err(PipelineError::MalformedAiResponse {
                step: "analyze".into(),
                message: "no integration points identified".into(),
            });
        }

        let id = spec_id(parsed, &scan.paths(), &assertions);
        let spec = Specification::new(
            id,
            intent_id.to_string(),
            version,
            assertions,
            wire.test_suite,
            wire.type_contract,
            may_touch,
            must_not_touch,
            analysis.patterns.clone(),
        )?;
        info!(
            spec_id = %spec.id,
            version,
            assertions = spec.assertions.len(),
            "Specification compiled"
        );
        Ok(spec)
    }
}

/// Deterministic spec id: a stable hash of the normalized intent, the
/// relevant-files set, and the assertion texts.
fn spec_id(parsed: &ParsedIntent, files: &[String], assertions: &[Assertion]) -> String {
    let mut hasher = blake3::Hasher::new();
    hasher.update(normalize_text(&parsed.core).as_bytes());
    for item in parsed.must.iter().chain(&parsed.must_not).chain(&parsed.done_when) {
        hasher.update(normalize_text(item).as_bytes());
        hasher.update(&[0xfe]);
    }
    for file in files {
        hasher.update(file.as_bytes());
        hasher.update(&[0xfd]);
    }
    for assertion in assertions {
        hasher.update(assertion.test.as_bytes());
        hasher.update(&[0xfc]);
    }
    format!("spec-{}", &hasher.finalize().to_hex()[..16])
}

fn normalize_text(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ").to_lowercase()
}

fn normalize_path(s: &str) -> String {
    s.trim().trim_start_matches("./").trim_end_matches('/').to_string()
}

/// Pull the first balanced JSON object out of a completion, tolerating
/// code fences and surrounding prose.
pub fn extract_json<T: serde::de::DeserializeOwned>(
    text: &str,
    step: &str,
) -> PipelineResult<T> {
    let start = text.find('{').ok_or_else(|| PipelineError::MalformedAiResponse {
        step: step.to_string(),
        message: "no JSON object in response".into(),
    })?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (offset, ch) in text[start..].char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match ch {
            '\\' if in_string => escaped = true,
            '"' => in_string = !in_string,
            '{' if !in_string => depth += 1,
            '}' if !in_string => {
                depth -= 1;
                if depth == 0 {
                    let candidate = &text[start..start + offset + ch.len_utf8()];
                    return serde_json::from_str(candidate).map_err(|e| {
                        PipelineError::MalformedAiResponse {
                            step: step.to_string(),
                            message: e.to_string(),
                        }
                    });
                }
            }
            _ => {}
        }
    }
    Err(PipelineError::MalformedAiResponse {
        step: step.to_string(),
        message: "unbalanced JSON object".into(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_json_from_fenced_response() {
        let text = "Here is the result:\n```json\n{\"core\": \"add auth\", \"done_when\": [\"login works\"]}\n```\nDone.";
        let parsed: ParsedIntent = extract_json(text, "parse").unwrap();
        assert_eq!(parsed.core, "add auth");
        assert_eq!(parsed.done_when, vec!["login works"]);
    }

    #[test]
    fn test_extract_json_handles_nested_braces_and_strings() {
        let text = r#"{"core": "set {x} to \"y\"", "must": []}"#;
        let parsed: ParsedIntent = extract_json(text, "parse").unwrap();
        assert_eq!(parsed.core, "set {x} to \"y\"");
    }

    #[test]
    fn test_extract_json_rejects_prose() {
        let err = extract_json::<ParsedIntent>("no json here", "parse").unwrap_err();
        assert_eq!(err.kind(), "malformed_ai_response");
    }

    #[test]
    fn test_spec_id_is_stable_and_input_sensitive() {
        let parsed = ParsedIntent {
            core: "Add   email auth".into(),
            done_when: vec!["login works".into()],
            ..Default::default()
        };
        let files = vec!["src/auth.rs".to_string()];
        let assertions = vec![Assertion::new("a1", "login", "assert(login())", 5)];

        let id1 = spec_id(&parsed, &files, &assertions);
        // Whitespace and case differences normalize away
        let reworded = ParsedIntent {
            core: "add email  auth".into(),
            ..parsed.clone()
        };
        assert_eq!(id1, spec_id(&reworded, &files, &assertions));

        let other_assertions = vec![Assertion::new("a1", "login", "assert(!login())", 5)];
        assert_ne!(id1, spec_id(&parsed, &files, &other_assertions));
    }

    #[test]
    fn test_normalize_path() {
        assert_eq!(normalize_path("./src/auth/"), "src/auth");
        assert_eq!(normalize_path(" migrations "), "migrations");
    }
}
