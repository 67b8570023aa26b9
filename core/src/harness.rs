//! Verification Harness
//!
//! Runs one attempt through the staged reality check inside an isolated
//! workspace: apply changes, write the spec suite, then typecheck, lint,
//! unit tests, and spec tests as external subprocesses. Hard failures
//! short-circuit the remaining stages; flaky test stages may be re-run
//! with a majority rule. The workspace is released on every exit path.

use std::sync::Arc;
use std::time::{Duration, Instant};

use regex::Regex;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::VerificationConfig;
use crate::error::{PipelineError, PipelineResult};
use crate::runner::{RunOutput, SubprocessRunner};
use crate::store::types::{Attempt, CheckResult, Specification, Stage, Verification};
use crate::workspace::{apply_changes, WorkspaceManager};

/// Runs staged verification with a concurrency cap independent of the
/// swarm's AI pool
pub struct VerificationHarness {
    runner: SubprocessRunner,
    workspaces: Arc<WorkspaceManager>,
    config: VerificationConfig,
    permits: Arc<Semaphore>,
}

impl VerificationHarness {
    pub fn new(workspaces: Arc<WorkspaceManager>, config: VerificationConfig) -> Self {
        let permits = Arc::new(Semaphore::new(config.harness_concurrency.max(1)));
        Self {
            runner: SubprocessRunner::default(),
            workspaces,
            config,
            permits,
        }
    }

    /// Verify one attempt against its owning specification.
    ///
    /// Always produces a Verification when the workspace could be
    /// acquired; stage failures are recorded, not raised.
    pub async fn verify(
        &self,
        attempt: &Attempt,
        spec: &Specification,
        cancel: &CancellationToken,
    ) -> PipelineResult<Verification> {
        let _permit = Arc::clone(&self.permits)
            .acquire_owned()
            .await
            .map_err(|_| PipelineError::Cancelled)?;
        if cancel.is_cancelled() {
            return Err(PipelineError::Cancelled);
        }

        let start = Instant::now();
        let attempt_id = attempt.id.clone();
        let changes = attempt.changes.clone();
        let suite = spec.test_suite.clone();
        let suite_path = self.config.spec_suite_path.clone();
        let config = self.config.clone();
        let runner = self.runner.clone();
        let cancel = cancel.clone();
        let assertions_total = spec.assertions.len() as u32;

        let stages = self
            .workspaces
            .with_workspace(&attempt.id, move |root| async move {
                apply_changes(&root, &changes)?;

                // The spec suite lives at a reserved path the unit-test
                // command does not pick up
                let suite_file = root.join(&suite_path);
                if let Some(parent) = suite_file.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                std::fs::write(&suite_file, &suite)?;

                let envs = vec![(
                    "MANIFEST_ALLOW_NETWORK".to_string(),
                    if config.allow_network_in_tests { "1" } else { "0" }.to_string(),
                )];

                // Dependency install is advisory: a failure shows up in
                // the stages that needed the dependencies
                if config.auto_install_dependencies {
                    if let Some(install_argv) = shlex::split(&config.dependency_install_cmd) {
                        let deadline =
                            Duration::from_secs(config.stage_timeout(&Stage::Typecheck.to_string()));
                        let out = runner.run(&install_argv, &root, &envs, deadline, &cancel).await;
                        if !out.success() {
                            warn!(
                                cmd = %config.dependency_install_cmd,
                                "Dependency install failed; continuing to stages"
                            );
                        }
                    }
                }

                // Per-stage deadlines cascade: no stage may outlive what
                // remains of the whole verification's budget
                let mut remaining: Duration = Stage::all()
                    .iter()
                    .map(|s| Duration::from_secs(config.stage_timeout(&s.to_string())))
                    .sum();
                let mut results: Vec<CheckResult> = Vec::with_capacity(Stage::all().len());
                let mut short_circuited = false;
                for stage in Stage::all() {
                    if short_circuited {
                        results.push(CheckResult::skipped(*stage));
                        continue;
                    }
                    let limit = Duration::from_secs(config.stage_timeout(&stage.to_string()));
                    let deadline = limit.min(remaining);
                    let result =
                        run_stage(&runner, &config, *stage, deadline, &envs, &root, &cancel).await;
                    remaining = remaining.saturating_sub(Duration::from_millis(result.duration_ms));
                    let failed = !result.passed;
                    results.push(result);
                    if failed {
                        short_circuited = true;
                    }
                }
                Ok(results)
            })
            .await?;

        let assertions_passed = parse_spec_assertions(&stages);
        let verification = Verification::from_stages(
            attempt_id,
            stages,
            assertions_passed,
            assertions_total,
            start.elapsed().as_millis() as u64,
        );
        info!(
            attempt_id = %verification.attempt_id,
            passed = verification.passed,
            first_failure = verification.first_failure.as_deref().unwrap_or("-"),
            duration_ms = verification.duration_ms,
            "Verification finished"
        );
        Ok(verification)
    }
}

/// Run one stage, with flaky re-runs for the two test stages.
async fn run_stage(
    runner: &SubprocessRunner,
    config: &VerificationConfig,
    stage: Stage,
    deadline: Duration,
    envs: &[(String, String)],
    root: &std::path::Path,
    cancel: &CancellationToken,
) -> CheckResult {
    let command = match stage {
        Stage::Typecheck => &config.typecheck_cmd,
        Stage::Lint => &config.lint_cmd,
        Stage::UnitTests => &config.unit_test_cmd,
        Stage::SpecTests => &config.spec_test_cmd,
    };
    let Some(argv) = shlex::split(command) else {
        return CheckResult {
            stage,
            passed: false,
            exit_code: None,
            output: format!("unparsable command: {command}"),
            errors: vec![format!("unparsable command: {command}")],
            duration_ms: 0,
            timed_out: false,
            skipped: false,
        };
    };

    let flaky = matches!(stage, Stage::UnitTests | Stage::SpecTests);
    let first = runner.run(&argv, root, envs, deadline, cancel).await;

    // Flaky handling: after a failure, re-run up to the configured count;
    // the stage passes iff passes strictly exceed half the runs.
    if flaky && !first.success() && !first.spawn_failed && config.flaky_retries > 0 {
        let mut runs = vec![first];
        for retry in 1..=config.flaky_retries {
            if cancel.is_cancelled() {
                break;
            }
            warn!(stage = %stage, retry, "Re-running flaky test stage");
            runs.push(runner.run(&argv, root, envs, deadline, cancel).await);
        }
        let passes = runs.iter().filter(|r| r.success()).count();
        let passed = passes * 2 > runs.len();
        // Report the last failing run, or the last run when passing
        let representative = if passed {
            runs.iter().rev().find(|r| r.success()).unwrap_or(&runs[0])
        } else {
            runs.iter().rev().find(|r| !r.success()).unwrap_or(&runs[0])
        };
        return to_check_result(stage, representative, passed);
    }

    let passed = first.success();
    to_check_result(stage, &first, passed)
}

fn to_check_result(stage: Stage, output: &RunOutput, passed: bool) -> CheckResult {
    let combined = if output.stderr.is_empty() {
        output.stdout.clone()
    } else if output.stdout.is_empty() {
        output.stderr.clone()
    } else {
        format!("{}\n{}", output.stdout, output.stderr)
    };
    CheckResult {
        stage,
        passed,
        exit_code: output.exit_code,
        errors: extract_errors(&combined),
        output: combined,
        duration_ms: output.duration.as_millis() as u64,
        timed_out: output.timed_out,
        skipped: false,
    }
}

/// First few `error...` lines from captured output
fn extract_errors(output: &str) -> Vec<String> {
    output
        .lines()
        .filter(|line| {
            let trimmed = line.trim_start();
            trimmed.starts_with("error") || trimmed.starts_with("FAILED")
        })
        .take(10)
        .map(|line| line.trim().to_string())
        .collect()
}

/// Parse the spec-test stage's structured summary into a passed count.
///
/// Recognizes the standard harness line
/// `test result: <ok|FAILED>. N passed; M failed; ...`; unparsable
/// failure output counts as zero.
fn parse_spec_assertions(stages: &[CheckResult]) -> u32 {
    let Some(spec_stage) = stages.iter().find(|s| s.stage == Stage::SpecTests) else {
        return 0;
    };
    if spec_stage.skipped {
        return 0;
    }
    let re = Regex::new(r"test result: \w+\. (\d+) passed; (\d+) failed").expect("static regex");
    let mut passed = 0u32;
    for caps in re.captures_iter(&spec_stage.output) {
        if let Some(n) = caps.get(1).and_then(|m| m.as_str().parse::<u32>().ok()) {
            passed += n;
        }
    }
    passed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WorkspaceConfig;
    use crate::store::types::{Assertion, FileChange, Strategy};
    use std::collections::BTreeSet;
    use tempfile::tempdir;

    fn stub_config(pass: bool) -> VerificationConfig {
        // Stages are opaque argv commands, so true/false stand in for
        // real checkers
        let cmd = if pass { "true" } else { "false" };
        VerificationConfig {
            typecheck_cmd: cmd.into(),
            lint_cmd: cmd.into(),
            unit_test_cmd: cmd.into(),
            spec_test_cmd: cmd.into(),
            flaky_retries: 0,
            harness_concurrency: 2,
            ..VerificationConfig::default()
        }
    }

    fn sample_spec() -> Specification {
        Specification::new(
            "spec-1".into(),
            "intent-1".into(),
            1,
            vec![
                Assertion::new("a1", "works", "assert(works)", 5),
                Assertion::new("a2", "still works", "assert(still_works)", 5),
            ],
            "// spec suite".into(),
            "contract".into(),
            BTreeSet::from(["src".to_string(), "tests".to_string()]),
            BTreeSet::new(),
            Vec::new(),
        )
        .unwrap()
    }

    fn sample_attempt() -> Attempt {
        Attempt::new(
            "spec-1".into(),
            1,
            Strategy::Vanilla,
            vec![FileChange::create("src/feature.rs", "pub fn feature() {}")],
            "direct",
            0.8,
        )
    }

    async fn run_harness(config: VerificationConfig) -> Verification {
        let project = tempdir().unwrap();
        let ws_root = tempdir().unwrap();
        std::fs::write(project.path().join("README.md"), "project").unwrap();
        let workspaces = Arc::new(
            WorkspaceManager::new(project.path(), ws_root.path(), &WorkspaceConfig::default())
                .unwrap(),
        );
        let harness = VerificationHarness::new(workspaces, config);
        harness
            .verify(&sample_attempt(), &sample_spec(), &CancellationToken::new())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_all_stages_pass() {
        let verification = run_harness(stub_config(true)).await;
        assert!(verification.passed);
        assert_eq!(verification.stages.len(), 4);
        // Full success implies every assertion passed
        assert_eq!(verification.assertions_passed, verification.assertions_total);
    }

    #[tokio::test]
    async fn test_first_failure_short_circuits() {
        let mut config = stub_config(true);
        config.typecheck_cmd = "false".into();
        let verification = run_harness(config).await;
        assert!(!verification.passed);
        assert!(verification.first_failure.unwrap().contains("typecheck"));
        // The remaining stages were skipped, not run
        assert!(verification.stages[1..].iter().all(|s| s.skipped));
        assert_eq!(verification.assertions_passed, 0);
    }

    #[tokio::test]
    async fn test_spawn_failure_marks_stage_crashed() {
        let mut config = stub_config(true);
        config.lint_cmd = "no-such-linter-9c4f".into();
        let verification = run_harness(config).await;
        assert!(!verification.passed);
        let lint = &verification.stages[1];
        assert_eq!(lint.exit_code, None);
        assert!(!lint.passed);
    }

    #[tokio::test]
    async fn test_flaky_majority_rule() {
        // A command that fails once then passes: majority of 3 runs passes
        let project = tempdir().unwrap();
        let marker = project.path().join("flaky-marker");
        let script = format!(
            "if [ -f {m} ]; then exit 0; else touch {m}; exit 1; fi",
            m = marker.display()
        );
        let mut config = stub_config(true);
        config.unit_test_cmd = format!("sh -c \"{script}\"");
        config.flaky_retries = 2;

        let ws_root = tempdir().unwrap();
        std::fs::write(project.path().join("README.md"), "project").unwrap();
        let workspaces = Arc::new(
            WorkspaceManager::new(project.path(), ws_root.path(), &WorkspaceConfig::default())
                .unwrap(),
        );
        let harness = VerificationHarness::new(workspaces, config);
        let verification = harness
            .verify(&sample_attempt(), &sample_spec(), &CancellationToken::new())
            .await
            .unwrap();
        // Runs: fail, pass, pass -> 2/3 passes
        assert!(verification.stages[2].passed);
        assert!(verification.passed);
    }

    #[tokio::test]
    async fn test_workspace_gone_after_verification() {
        let project = tempdir().unwrap();
        let ws_root = tempdir().unwrap();
        std::fs::write(project.path().join("README.md"), "project").unwrap();
        let workspaces = Arc::new(
            WorkspaceManager::new(project.path(), ws_root.path(), &WorkspaceConfig::default())
                .unwrap(),
        );
        let harness = VerificationHarness::new(workspaces, stub_config(false));
        let attempt = sample_attempt();
        let _ = harness
            .verify(&attempt, &sample_spec(), &CancellationToken::new())
            .await
            .unwrap();
        assert!(!ws_root.path().join(&attempt.id).exists());
    }

    #[test]
    fn test_parse_spec_assertions() {
        let stage = CheckResult {
            stage: Stage::SpecTests,
            passed: false,
            exit_code: Some(101),
            output: "running 3 tests\ntest a ... ok\ntest b ... FAILED\n\
                     test result: FAILED. 2 passed; 1 failed; 0 ignored"
                .into(),
            errors: Vec::new(),
            duration_ms: 5,
            timed_out: false,
            skipped: false,
        };
        assert_eq!(parse_spec_assertions(&[stage]), 2);
    }

    #[test]
    fn test_parse_spec_assertions_unparsable_is_zero() {
        let stage = CheckResult {
            stage: Stage::SpecTests,
            passed: false,
            exit_code: Some(1),
            output: "segmentation fault".into(),
            errors: Vec::new(),
            duration_ms: 5,
            timed_out: false,
            skipped: false,
        };
        assert_eq!(parse_spec_assertions(&[stage]), 0);
        assert_eq!(parse_spec_assertions(&[]), 0);
    }

    #[test]
    fn test_extract_errors() {
        let output = "warning: unused\nerror[E0308]: mismatched types\nnote: hint\nerror: aborting";
        let errors = extract_errors(output);
        assert_eq!(errors.len(), 2);
        assert!(errors[0].contains("E0308"));
    }
}
