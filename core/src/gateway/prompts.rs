//! Prompt templates for each gateway purpose.
//!
//! Prompt versioning: bump `PROMPT_VERSION` whenever template content
//! changes. The version is part of the release artifact, so a recorded run
//! can always be traced to the exact prompt text that produced it.

use crate::store::types::{ParsedIntent, Specification, Strategy};

/// Prompt version. Bump on any template content change.
pub const PROMPT_VERSION: &str = "1.2.0";

/// Parse a raw feature request into structured intent fields.
pub fn parse_prompt(raw_message: &str) -> String {
    format!(
        "You are the intent parser of a code-change pipeline. Turn the feature request \
         below into structured form.\n\n\
         Respond with STRICT JSON ONLY using schema: \
         {{\"core\":\"one sentence\",\"must\":[...],\"must_not\":[...],\
         \"done_when\":[...],\"unclear\":[...],\"scope\":\"short hint or null\"}}.\n\n\
         Rules:\n\
         - `done_when` entries must be observable, testable conditions.\n\
         - Put every genuinely ambiguous point into `unclear` as a question; leave it \
         empty when the request is actionable as written.\n\
         - Do not invent requirements the request does not state.\n\n\
         Request:\n{raw_message}"
    )
}

/// Identify relevant files, patterns, forbidden zones, and integration points.
pub fn analyze_prompt(parsed: &ParsedIntent, tree_summary: &str) -> String {
    let mut prompt = String::new();
    prompt.push_str(
        "You are the codebase analyst of a code-change pipeline. Given an intent and the \
         project file tree, identify where the change lands.\n\n\
         Respond with STRICT JSON ONLY using schema: \
         {\"relevant_files\":[...],\"patterns\":[...],\"forbidden_zones\":[...],\
         \"integration_points\":[...]}.\n\n\
         Rules:\n\
         - `integration_points` are files or directories the change may create or modify.\n\
         - `forbidden_zones` are paths the change must not touch.\n\
         - `patterns` are short descriptions of conventions the change should follow.\n\n",
    );
    prompt.push_str(&format!("Intent: {}\n", parsed.core));
    if !parsed.must.is_empty() {
        prompt.push_str(&format!("Must: {}\n", parsed.must.join("; ")));
    }
    if !parsed.must_not.is_empty() {
        prompt.push_str(&format!("Must not: {}\n", parsed.must_not.join("; ")));
    }
    prompt.push_str(&format!("\nProject tree:\n{tree_summary}\n"));
    prompt
}

/// Compile the parsed intent and analysis into an executable specification.
pub fn spec_prompt(parsed: &ParsedIntent, relevant_files: &[String], patterns: &[String]) -> String {
    let mut prompt = String::new();
    prompt.push_str(
        "You are the spec compiler of a code-change pipeline. Produce an executable \
         specification for the intent below.\n\n\
         Respond with STRICT JSON ONLY using schema: \
         {\"assertions\":[{\"description\":\"...\",\"test\":\"executable test text\",\
         \"weight\":1-10}],\"test_suite\":\"complete test file text\",\
         \"type_contract\":\"signatures the change must provide\"}.\n\n\
         Rules:\n\
         - Emit exactly one assertion per done-when condition, in order.\n\
         - Every assertion's `test` must be runnable test code, not prose.\n\
         - `test_suite` must contain every assertion's test and compile on its own.\n\n",
    );
    prompt.push_str(&format!("Core: {}\n", parsed.core));
    for (i, condition) in parsed.done_when.iter().enumerate() {
        prompt.push_str(&format!("Done-when {}: {}\n", i + 1, condition));
    }
    if !parsed.must.is_empty() {
        prompt.push_str(&format!("Must: {}\n", parsed.must.join("; ")));
    }
    if !parsed.must_not.is_empty() {
        prompt.push_str(&format!("Must not: {}\n", parsed.must_not.join("; ")));
    }
    if !relevant_files.is_empty() {
        prompt.push_str(&format!("Relevant files: {}\n", relevant_files.join(", ")));
    }
    if !patterns.is_empty() {
        prompt.push_str(&format!("Codebase patterns: {}\n", patterns.join("; ")));
    }
    prompt
}

/// Strategy-specific guidance embedded in the implement prompt.
fn strategy_guidance(strategy: Strategy) -> &'static str {
    match strategy {
        Strategy::Vanilla => "Implement the most straightforward solution that satisfies the spec.",
        Strategy::Minimal => {
            "Implement the solution in the fewest lines that still satisfy every assertion. \
             No speculative abstractions."
        }
        Strategy::Defensive => {
            "Implement with maximum validation: check every input, handle every error path, \
             and fail loudly on contract violations."
        }
        Strategy::Patterned => {
            "Match the codebase's existing style exactly: naming, module layout, error \
             handling idioms, and test placement."
        }
        Strategy::Mutation => {
            "Start from the sibling implementation included below and produce a meaningful \
             variation: a different algorithm, data structure, or decomposition that still \
             satisfies every assertion."
        }
        Strategy::Adversarial => {
            "Satisfy the provided tests literally. Nothing beyond what the tests observe is \
             required."
        }
    }
}

/// Generate one candidate implementation for a spec under a strategy.
pub fn implement_prompt(
    spec: &Specification,
    strategy: Strategy,
    sibling_changes: Option<&str>,
) -> String {
    let mut prompt = String::new();
    prompt.push_str(
        "You are an implementer in a code-change pipeline. Produce one complete candidate \
         implementation of the specification below.\n\n\
         Respond with STRICT JSON ONLY using schema: \
         {\"approach\":\"one sentence\",\"confidence\":0.0-1.0,\
         \"changes\":[{\"path\":\"relative/path\",\"action\":\"create|modify|delete\",\
         \"content\":\"full file text, omitted for delete\"}]}.\n\n",
    );
    prompt.push_str(&format!("## Strategy: {strategy}\n{}\n\n", strategy_guidance(strategy)));

    prompt.push_str("## Assertions\n");
    for assertion in &spec.assertions {
        prompt.push_str(&format!(
            "- [w{}] {}\n  test: {}\n",
            assertion.weight, assertion.description, assertion.test
        ));
    }
    prompt.push_str(&format!("\n## Type contract\n{}\n", spec.type_contract));

    prompt.push_str("\n## Path constraints\n");
    prompt.push_str(&format!(
        "May touch: {}\n",
        spec.may_touch.iter().cloned().collect::<Vec<_>>().join(", ")
    ));
    prompt.push_str(&format!(
        "Must NOT touch: {}\n",
        spec.must_not_touch.iter().cloned().collect::<Vec<_>>().join(", ")
    ));
    if !spec.patterns.is_empty() {
        prompt.push_str(&format!("\n## Patterns\n{}\n", spec.patterns.join("\n")));
    }
    if let Some(sibling) = sibling_changes {
        prompt.push_str(&format!("\n## Sibling implementation to vary\n{sibling}\n"));
    }
    prompt.push_str("\nEvery `content` must be the complete file text, never a fragment.\n");
    prompt
}

/// Score the readability of one attempt's changes.
pub fn score_prompt(changes_summary: &str) -> String {
    format!(
        "You are a readability judge. Score the code change below for readability on \
         [0.0, 1.0]: naming clarity, control-flow simplicity, and how quickly a maintainer \
         could review it.\n\n\
         Respond with STRICT JSON ONLY: {{\"readability\":0.0-1.0}}.\n\n\
         ```\n{changes_summary}\n```"
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::types::Assertion;
    use std::collections::BTreeSet;

    fn sample_spec() -> Specification {
        Specification::new(
            "spec-1".into(),
            "intent-1".into(),
            1,
            vec![Assertion::new("a1", "login works", "assert(login())", 5)],
            "suite".into(),
            "fn login() -> bool".into(),
            BTreeSet::from(["src/auth.rs".to_string()]),
            BTreeSet::from(["migrations".to_string()]),
            vec!["snake_case modules".into()],
        )
        .unwrap()
    }

    #[test]
    fn test_parse_prompt_includes_message() {
        let prompt = parse_prompt("add email auth");
        assert!(prompt.contains("add email auth"));
        assert!(prompt.contains("done_when"));
    }

    #[test]
    fn test_implement_prompt_carries_constraints() {
        let prompt = implement_prompt(&sample_spec(), Strategy::Minimal, None);
        assert!(prompt.contains("fewest lines"));
        assert!(prompt.contains("src/auth.rs"));
        assert!(prompt.contains("Must NOT touch: migrations"));
        assert!(!prompt.contains("Sibling implementation"));
    }

    #[test]
    fn test_mutation_prompt_embeds_sibling() {
        let prompt = implement_prompt(&sample_spec(), Strategy::Mutation, Some("fn a() {}"));
        assert!(prompt.contains("Sibling implementation"));
        assert!(prompt.contains("fn a() {}"));
    }

    #[test]
    fn test_every_strategy_has_distinct_guidance() {
        let mut seen = std::collections::HashSet::new();
        for strategy in Strategy::all() {
            assert!(seen.insert(strategy_guidance(*strategy)));
        }
    }
}
