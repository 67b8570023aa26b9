//! End-to-end pipeline tests against a scripted gateway and stub checkers.
//!
//! The AI backend is replaced by a queue of canned responses per purpose;
//! verification stages run `true`/`false` so the staged harness executes
//! real subprocesses without real toolchains.

use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use manifest_core::config::ManifestConfig;
use manifest_core::gateway::{
    AiGateway, Completion, CompletionRequest, CostLedger, GatewayError, Purpose,
};
use manifest_core::orchestrator::Orchestrator;
use manifest_core::report::RunOutcome;
use manifest_core::store::types::{IntentStatus, Judgment};
use manifest_core::store::{SharedStore, Store};
use manifest_core::swarm::GenerationSwarm;

/// Scripted gateway: pops one canned response per call, per purpose.
struct FakeGateway {
    responses: Mutex<HashMap<Purpose, VecDeque<String>>>,
    ledger: CostLedger,
    cost_per_call: f64,
    calls: Mutex<Vec<Purpose>>,
}

impl FakeGateway {
    fn new(ceiling_usd: f64, cost_per_call: f64) -> Self {
        Self {
            responses: Mutex::new(HashMap::new()),
            ledger: CostLedger::new(ceiling_usd),
            cost_per_call,
            calls: Mutex::new(Vec::new()),
        }
    }

    fn push(&self, purpose: Purpose, response: &str) {
        self.responses
            .lock()
            .unwrap()
            .entry(purpose)
            .or_default()
            .push_back(response.to_string());
    }

    fn call_count(&self, purpose: Purpose) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|p| **p == purpose)
            .count()
    }
}

#[async_trait]
impl AiGateway for FakeGateway {
    async fn complete(
        &self,
        request: CompletionRequest,
        _cancel: &CancellationToken,
    ) -> Result<Completion, GatewayError> {
        self.ledger.check_next(self.cost_per_call)?;
        self.calls.lock().unwrap().push(request.purpose);
        let response = self
            .responses
            .lock()
            .unwrap()
            .get_mut(&request.purpose)
            .and_then(|queue| queue.pop_front());
        match response {
            Some(text) => {
                self.ledger.record(self.cost_per_call);
                Ok(Completion {
                    text,
                    cost_usd: self.cost_per_call,
                })
            }
            None => Err(GatewayError::Unavailable {
                message: format!("no scripted response for {}", request.purpose),
            }),
        }
    }

    fn total_cost_usd(&self) -> f64 {
        self.ledger.spent_usd()
    }
}

const PARSE_OK: &str = r#"{"core":"add email auth","must":["use bcrypt"],
    "must_not":["touch migrations"],"done_when":["login succeeds","bad password rejected"],
    "unclear":[],"scope":"auth"}"#;

const ANALYZE_OK: &str = r#"{"relevant_files":["src/lib.rs"],"patterns":["module per feature"],
    "forbidden_zones":["migrations"],"integration_points":["src","tests"]}"#;

const SPEC_OK: &str = r#"{"assertions":[
    {"description":"login succeeds","test":"assert!(login(\"u\",\"p\"))","weight":8},
    {"description":"bad password rejected","test":"assert!(!login(\"u\",\"x\"))","weight":5}],
    "test_suite":"// spec suite\n","type_contract":"fn login(user: &str, pass: &str) -> bool"}"#;

fn implement_response(content: &str) -> String {
    format!(
        r#"{{"approach":"direct","confidence":0.8,"changes":[
            {{"path":"src/auth.rs","action":"create","content":"{content}"}}]}}"#
    )
}

struct Fixture {
    project: TempDir,
    data: TempDir,
    store: SharedStore,
    gateway: Arc<FakeGateway>,
}

impl Fixture {
    fn new(ceiling_usd: f64, cost_per_call: f64) -> Self {
        let project = TempDir::new().unwrap();
        std::fs::create_dir_all(project.path().join("src")).unwrap();
        std::fs::write(project.path().join("src/lib.rs"), "pub fn lib() {}").unwrap();
        std::fs::create_dir_all(project.path().join("migrations")).unwrap();
        std::fs::write(project.path().join("migrations/0001.sql"), "-- init").unwrap();

        let data = TempDir::new().unwrap();
        let store = Store::open(data.path().join("manifest.db")).unwrap().shared();
        let gateway = Arc::new(FakeGateway::new(ceiling_usd, cost_per_call));
        Self {
            project,
            data,
            store,
            gateway,
        }
    }

    fn config(&self, stages_pass: bool) -> ManifestConfig {
        let mut config = ManifestConfig::default();
        config.generation.default_count = 4;
        config.generation.distribution.vanilla = 2;
        config.generation.distribution.minimal = 1;
        config.generation.distribution.defensive = 1;
        config.generation.distribution.patterned = 0;
        let cmd = if stages_pass { "true" } else { "false" };
        config.verification.typecheck_cmd = cmd.into();
        config.verification.lint_cmd = "true".into();
        config.verification.unit_test_cmd = "true".into();
        config.verification.spec_test_cmd = "true".into();
        config.verification.flaky_retries = 0;
        config
    }

    fn orchestrator(&self, config: ManifestConfig) -> Orchestrator {
        Orchestrator::new(
            Arc::clone(&self.store),
            self.gateway.clone(),
            config,
            self.data.path(),
            self.project.path(),
        )
        .unwrap()
    }

    fn script_compile(&self) {
        self.gateway.push(Purpose::Parse, PARSE_OK);
        self.gateway.push(Purpose::Analyze, ANALYZE_OK);
        self.gateway.push(Purpose::Spec, SPEC_OK);
    }

    fn script_implementations(&self, contents: &[&str]) {
        for content in contents {
            self.gateway
                .push(Purpose::Implement, &implement_response(content));
        }
    }

    fn workspaces_dir(&self) -> std::path::PathBuf {
        self.data.path().join("workspaces")
    }
}

fn assert_no_workspaces(dir: &Path) {
    if dir.exists() {
        let leftover: Vec<_> = std::fs::read_dir(dir).unwrap().flatten().collect();
        assert!(leftover.is_empty(), "leftover workspaces: {leftover:?}");
    }
}

#[tokio::test]
async fn test_happy_path_reaches_judgment_with_ranked_survivors() {
    let fx = Fixture::new(50.0, 0.05);
    fx.script_compile();
    fx.script_implementations(&[
        "pub fn login_a() {}",
        "pub fn login_b() {}",
        "pub fn login_c() {}",
        "pub fn login_d() {}",
    ]);

    let orchestrator = fx.orchestrator(fx.config(true));
    orchestrator.startup().await.unwrap();
    let report = orchestrator.submit("add email auth", "sess-1").await.unwrap();

    assert_eq!(report.phase, IntentStatus::Judging);
    assert!(matches!(
        report.outcome,
        RunOutcome::AwaitingJudgment { survivor_count: 3 }
    ));
    assert_eq!(report.attempts_generated, 4);
    assert_eq!(report.attempts_passed, 4);

    let survivors = fx.store.list_survivors_for_intent(&report.intent_id).unwrap();
    // top_k = 3 of 4 passing attempts, ranks 1..3, all presented
    assert_eq!(survivors.len(), 3);
    let mut ranks: Vec<u32> = survivors.iter().map(|s| s.rank).collect();
    ranks.sort_unstable();
    assert_eq!(ranks, vec![1, 2, 3]);
    assert!(survivors.iter().all(|s| s.presented));

    // Spec id is derived, version 1, with both assertions
    let spec = fx.store.latest_spec(&report.intent_id).unwrap().unwrap();
    assert_eq!(spec.version, 1);
    assert_eq!(spec.assertions.len(), 2);
    assert!(spec.must_not_touch.contains("migrations"));

    // Workspaces are gone once verification completes
    assert_no_workspaces(&fx.workspaces_dir());
}

#[tokio::test]
async fn test_unclear_intent_waits_in_clarifying() {
    let fx = Fixture::new(50.0, 0.05);
    fx.gateway.push(
        Purpose::Parse,
        r#"{"core":"make it better","must":[],"must_not":[],"done_when":[],
            "unclear":["better in what way?","which component?"],"scope":null}"#,
    );

    let orchestrator = fx.orchestrator(fx.config(true));
    let report = orchestrator.submit("make it better", "sess-1").await.unwrap();

    assert_eq!(report.phase, IntentStatus::Clarifying);
    match &report.outcome {
        RunOutcome::ClarificationNeeded { questions } => assert_eq!(questions.len(), 2),
        other => panic!("expected clarification, got {other:?}"),
    }
    // No specification was created and no generation call was made
    assert!(fx.store.latest_spec(&report.intent_id).unwrap().is_none());
    assert_eq!(fx.gateway.call_count(Purpose::Implement), 0);

    // Supplying answers re-enters parsing and completes the run
    fx.script_compile();
    fx.script_implementations(&["pub fn login() {}"]);
    let report = orchestrator
        .clarify(&report.intent_id, "faster logins in the auth module")
        .await
        .unwrap();
    assert_eq!(report.phase, IntentStatus::Judging);
}

#[tokio::test]
async fn test_failing_checks_yield_no_survivors_with_reasons() {
    let fx = Fixture::new(50.0, 0.05);
    fx.script_compile();
    fx.script_implementations(&[
        "pub fn a() {}",
        "pub fn b() {}",
        "pub fn c() {}",
        "pub fn d() {}",
    ]);

    let orchestrator = fx.orchestrator(fx.config(false));
    let report = orchestrator.submit("add email auth", "sess-1").await.unwrap();

    // No survivors is a first-class outcome, not an error
    match &report.outcome {
        RunOutcome::NoSurvivors { top_failures } => {
            assert!(!top_failures.is_empty());
            assert!(top_failures[0].reason.contains("typecheck"));
            assert_eq!(top_failures[0].count, 4);
        }
        other => panic!("expected no survivors, got {other:?}"),
    }
    assert!(report.suggestion.is_some());
    let intent = fx.store.get_intent(&report.intent_id).unwrap().unwrap();
    assert_eq!(intent.status, IntentStatus::Failed);
    assert_no_workspaces(&fx.workspaces_dir());
}

#[tokio::test]
async fn test_identical_attempts_collapse_to_single_survivor() {
    let fx = Fixture::new(50.0, 0.05);
    fx.script_compile();
    fx.script_implementations(&["pub fn same() {}"; 4]);

    let orchestrator = fx.orchestrator(fx.config(true));
    let report = orchestrator.submit("add email auth", "sess-1").await.unwrap();

    assert!(matches!(
        report.outcome,
        RunOutcome::AwaitingJudgment { survivor_count: 1 }
    ));
    let survivors = fx.store.list_survivors_for_intent(&report.intent_id).unwrap();
    assert_eq!(survivors.len(), 1);
    assert_eq!(survivors[0].rank, 1);
    assert!(report.warnings.iter().any(|w| w.contains("low diversity")));
}

#[tokio::test]
async fn test_attempts_touching_forbidden_paths_are_discarded() {
    let fx = Fixture::new(50.0, 0.05);
    fx.script_compile();
    // One attempt writes into the forbidden migrations directory
    fx.gateway.push(
        Purpose::Implement,
        r#"{"approach":"sneaky","confidence":0.9,"changes":[
            {"path":"migrations/0002.sql","action":"create","content":"drop table users"}]}"#,
    );
    fx.script_implementations(&["pub fn ok_a() {}", "pub fn ok_b() {}", "pub fn ok_c() {}"]);

    let orchestrator = fx.orchestrator(fx.config(true));
    let report = orchestrator.submit("add email auth", "sess-1").await.unwrap();

    // The invalid attempt is discarded, not fatal; the rest proceed
    assert_eq!(report.attempts_generated, 3);
    let survivors = fx.store.list_survivors_for_intent(&report.intent_id).unwrap();
    for survivor in survivors {
        let attempt = fx.store.get_attempt(&survivor.attempt_id).unwrap().unwrap();
        assert!(attempt.changes.iter().all(|c| !c.path.starts_with("migrations")));
    }
}

#[tokio::test]
async fn test_cost_ceiling_bounds_swarm_submission() {
    // Ceiling $1.00 at $0.30 per call admits at most 3 implement calls
    let fx = Fixture::new(1.0, 0.30);
    for i in 0..10 {
        fx.gateway
            .push(Purpose::Implement, &implement_response(&format!("pub fn v{i}() {{}}")));
    }
    let spec = manifest_core::store::types::Specification::new(
        "spec-1".into(),
        "intent-1".into(),
        1,
        vec![manifest_core::store::types::Assertion::new(
            "a1",
            "works",
            "assert(works)",
            5,
        )],
        "// suite".into(),
        "contract".into(),
        ["src".to_string()].into_iter().collect(),
        Default::default(),
        Vec::new(),
    )
    .unwrap();

    let generation = manifest_core::config::GenerationConfig {
        max_count: 10,
        ..Default::default()
    };
    let swarm = GenerationSwarm::new(fx.gateway.clone(), generation, 2);
    let report = swarm
        .generate(Arc::new(spec), 10, &CancellationToken::new())
        .await;

    assert!(report.attempts.len() <= 3);
    assert!(!report.attempts.is_empty());
    assert!(report.cost_stopped);
    assert!(fx.gateway.call_count(Purpose::Implement) <= 3);
    assert!(fx.gateway.total_cost_usd() <= 1.0 + 1e-9);
}

#[tokio::test]
async fn test_accept_applies_atomically_and_is_idempotent() {
    let fx = Fixture::new(50.0, 0.05);
    fx.script_compile();
    fx.script_implementations(&["pub fn accepted() {}"]);

    let orchestrator = fx.orchestrator(fx.config(true));
    let report = orchestrator.submit("add email auth", "sess-1").await.unwrap();
    let survivors = fx.store.list_survivors_for_intent(&report.intent_id).unwrap();
    let winner = &survivors[0];

    let applied = orchestrator
        .judge(Judgment::accept(report.intent_id.clone(), winner.id.clone()))
        .await
        .unwrap();
    assert!(matches!(applied.outcome, RunOutcome::Applied { .. }));
    assert_eq!(
        std::fs::read_to_string(fx.project.path().join("src/auth.rs")).unwrap(),
        "pub fn accepted() {}"
    );
    let intent = fx.store.get_intent(&report.intent_id).unwrap().unwrap();
    assert_eq!(intent.status, IntentStatus::Complete);

    // A second accept is refused as a no-op, not re-applied
    let again = orchestrator
        .judge(Judgment::accept(report.intent_id.clone(), winner.id.clone()))
        .await
        .unwrap();
    assert!(again.warnings.iter().any(|w| w.contains("already complete")));
}

#[tokio::test]
async fn test_refine_bumps_spec_version_and_preserves_survivors() {
    let fx = Fixture::new(50.0, 0.05);
    fx.script_compile();
    fx.script_implementations(&["pub fn v1() {}"]);

    let orchestrator = fx.orchestrator(fx.config(true));
    let report = orchestrator.submit("add email auth", "sess-1").await.unwrap();
    let first_survivors = fx.store.list_survivors_for_intent(&report.intent_id).unwrap();
    assert_eq!(first_survivors.len(), 1);

    // The refine pass re-parses and recompiles the appended message
    fx.script_compile();
    fx.script_implementations(&["pub fn v2() {}"]);
    let refined = orchestrator
        .judge(Judgment::refine(report.intent_id.clone(), "add rate limiting"))
        .await
        .unwrap();
    assert_eq!(refined.phase, IntentStatus::Judging);

    let spec = fx.store.latest_spec(&report.intent_id).unwrap().unwrap();
    assert_eq!(spec.version, 2);

    let intent = fx.store.get_intent(&report.intent_id).unwrap().unwrap();
    assert!(intent.raw_message.contains("add rate limiting"));
    assert_eq!(intent.refinement_count, 1);

    // Prior survivors remain in the store, presented but not reused
    let all = fx.store.list_survivors_for_intent(&report.intent_id).unwrap();
    assert!(all.len() > first_survivors.len());
    assert!(all
        .iter()
        .any(|s| s.attempt_id == first_survivors[0].attempt_id && s.presented));

    let judgments = fx.store.list_judgments(&report.intent_id).unwrap();
    assert_eq!(judgments.len(), 1);
    assert_eq!(judgments[0].refinement.as_deref(), Some("add rate limiting"));
}

#[tokio::test]
async fn test_redirect_starts_fresh_intent_and_aborts_current() {
    let fx = Fixture::new(50.0, 0.05);
    fx.script_compile();
    fx.script_implementations(&["pub fn v1() {}"]);

    let orchestrator = fx.orchestrator(fx.config(true));
    let report = orchestrator.submit("add email auth", "sess-1").await.unwrap();

    fx.script_compile();
    fx.script_implementations(&["pub fn other() {}"]);
    let redirected = orchestrator
        .judge(Judgment::redirect(
            report.intent_id.clone(),
            "add audit logging instead",
        ))
        .await
        .unwrap();

    assert_ne!(redirected.intent_id, report.intent_id);
    assert_eq!(redirected.session_id, "sess-1");
    let old = fx.store.get_intent(&report.intent_id).unwrap().unwrap();
    assert_eq!(old.status, IntentStatus::Aborted);
}

#[tokio::test]
async fn test_startup_sweeps_orphans_and_resumes_verifying() {
    let fx = Fixture::new(50.0, 0.05);
    fx.script_compile();
    fx.script_implementations(&["pub fn v1() {}", "pub fn v2() {}"]);

    let orchestrator = fx.orchestrator(fx.config(true));
    let report = orchestrator.submit("add email auth", "sess-1").await.unwrap();
    assert_eq!(report.phase, IntentStatus::Judging);

    // Simulate a crash mid-verification: rewind the persisted phase and
    // leave a stale workspace directory behind
    let mut intent = fx.store.get_intent(&report.intent_id).unwrap().unwrap();
    intent.status = IntentStatus::Verifying;
    fx.store.update_intent_status(&intent).unwrap();
    let stale = fx.workspaces_dir().join("stale-attempt");
    std::fs::create_dir_all(&stale).unwrap();

    // A fresh orchestrator (no scripted AI responses needed) resumes from
    // the persisted attempt set
    let orchestrator2 = fx.orchestrator(fx.config(true));
    let reports = orchestrator2.startup().await.unwrap();
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].phase, IntentStatus::Judging);
    assert!(!stale.exists());
    assert_no_workspaces(&fx.workspaces_dir());

    let intent = fx.store.get_intent(&report.intent_id).unwrap().unwrap();
    assert_eq!(intent.status, IntentStatus::Judging);
}

#[tokio::test]
async fn test_cancellation_during_verification_releases_everything() {
    let fx = Fixture::new(50.0, 0.05);
    fx.script_compile();
    fx.script_implementations(&["pub fn slow() {}"]);

    let mut config = fx.config(true);
    // A spec-test stage that would run far past the test's patience
    config.verification.spec_test_cmd = "sleep 30".into();
    let orchestrator = Arc::new(fx.orchestrator(config));
    let cancel = orchestrator.cancel_handle();

    let runner = Arc::clone(&orchestrator);
    let handle =
        tokio::spawn(async move { runner.submit("add email auth", "sess-1").await });

    // Let the run reach the sleeping stage, then cancel
    tokio::time::sleep(std::time::Duration::from_millis(1500)).await;
    cancel.cancel();

    let report = tokio::time::timeout(std::time::Duration::from_secs(20), handle)
        .await
        .expect("cancelled run must finish promptly")
        .unwrap()
        .unwrap();
    assert!(matches!(report.outcome, RunOutcome::Aborted));

    let intent = fx.store.get_intent(&report.intent_id).unwrap().unwrap();
    assert_eq!(intent.status, IntentStatus::Aborted);
    // Every workspace is gone and no subprocess kept the directory busy
    assert_no_workspaces(&fx.workspaces_dir());
}

#[tokio::test]
async fn test_aborted_intent_stops_at_phase_boundary() {
    let fx = Fixture::new(50.0, 0.05);
    fx.script_compile();
    fx.script_implementations(&["pub fn v1() {}"]);

    let orchestrator = fx.orchestrator(fx.config(true));
    let report = orchestrator.submit("add email auth", "sess-1").await.unwrap();
    assert_eq!(report.phase, IntentStatus::Judging);

    // An abort recorded in the store (e.g. by the CLI) is honored at the
    // next phase boundary of a judgment-driven re-run
    let mut intent = fx.store.get_intent(&report.intent_id).unwrap().unwrap();
    intent.status = IntentStatus::Aborted;
    fx.store.update_intent_status(&intent).unwrap();

    let result = orchestrator
        .judge(Judgment::refine(report.intent_id.clone(), "more"))
        .await;
    assert!(result.is_err());
}
