//! Manifest command surface
//!
//! `run` delivers a feature request to the orchestrator; `status`,
//! `abort`, and `history` inspect or cancel the current session; `judge`
//! records the human's decision over presented survivors. Exit code 0
//! means the command dispatched; non-zero is reserved for startup
//! failures (unreadable config, corrupt store).

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;

use manifest_core::prelude::*;
use manifest_core::report::present_survivors;

#[derive(Parser)]
#[command(name = "manifest", about = "Intent-to-change pipeline", version)]
struct Cli {
    /// Data directory (store, workspaces, logs, manifest.toml)
    #[arg(long, default_value = ".manifest")]
    data_dir: PathBuf,

    /// Project root the pipeline reads and, on accept, mutates
    #[arg(long, default_value = ".")]
    project_root: PathBuf,

    /// Session id grouping related intents
    #[arg(long, default_value = "default")]
    session: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a feature request through the pipeline
    Run {
        /// The natural-language feature request
        message: String,
    },
    /// Answer the open questions of a clarifying intent
    Clarify {
        intent_id: String,
        /// Answers to the parser's questions
        answers: String,
    },
    /// Record a judgment over an intent's presented survivors
    Judge {
        intent_id: String,
        #[command(subcommand)]
        decision: JudgeCommand,
    },
    /// Show the current phase and counters for the session
    Status,
    /// Cancel an in-flight intent (the most recent one when omitted)
    Abort {
        intent_id: Option<String>,
    },
    /// List past intents of the session
    History,
}

#[derive(Subcommand)]
enum JudgeCommand {
    /// Apply a survivor's changes to the project tree
    Accept { survivor_id: String },
    /// Refine the request and re-run generation
    Refine { text: String },
    /// Abandon this intent and start over with a new request
    Redirect { text: String },
    /// Abandon this intent
    Abort,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "manifest_core=info,manifest=info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    std::fs::create_dir_all(&cli.data_dir)
        .with_context(|| format!("create data dir {}", cli.data_dir.display()))?;

    let config = ManifestConfig::load(&cli.data_dir).context("load configuration")?;
    let store = Store::open(cli.data_dir.join("manifest.db"))
        .context("open store")?
        .shared();

    match cli.command {
        Command::Run { ref message } => {
            let orchestrator = build_orchestrator(&cli, config, Arc::clone(&store))?;
            let resumed = orchestrator.startup().await?;
            for report in &resumed {
                info!(summary = %report.summary(), "Resumed prior intent");
            }
            let report = orchestrator.submit(&message, &cli.session).await?;
            print_report(&store, &report)?;
        }
        Command::Clarify { ref intent_id, ref answers } => {
            let orchestrator = build_orchestrator(&cli, config, Arc::clone(&store))?;
            orchestrator.startup().await?;
            let report = orchestrator.clarify(intent_id, answers).await?;
            print_report(&store, &report)?;
        }
        Command::Judge {
            ref intent_id,
            ref decision,
        } => {
            let judgment = match decision {
                JudgeCommand::Accept { survivor_id } => {
                    Judgment::accept(intent_id.clone(), survivor_id.clone())
                }
                JudgeCommand::Refine { text } => Judgment::refine(intent_id.clone(), text.clone()),
                JudgeCommand::Redirect { text } => {
                    Judgment::redirect(intent_id.clone(), text.clone())
                }
                JudgeCommand::Abort => Judgment::abort(intent_id.clone()),
            };
            let orchestrator = build_orchestrator(&cli, config, Arc::clone(&store))?;
            orchestrator.startup().await?;
            let report = orchestrator.judge(judgment).await?;
            print_report(&store, &report)?;
        }
        Command::Status => {
            let intents = store.list_intents_for_session(&cli.session)?;
            match intents.first() {
                None => println!("no intents in session '{}'", cli.session),
                Some(current) => {
                    println!("intent {} [{}]", current.id, current.status);
                    println!("  message: {}", first_line(&current.raw_message));
                    println!("  refinements: {}", current.refinement_count);
                    let survivors = store.list_survivors_for_intent(&current.id)?;
                    if !survivors.is_empty() {
                        println!("  survivors:");
                        for line in present_survivors(&survivors) {
                            println!("    {line}");
                        }
                    }
                }
            }
        }
        Command::Abort { intent_id } => {
            let mut intent = match intent_id {
                Some(id) => store
                    .get_intent(&id)?
                    .with_context(|| format!("no intent {id}"))?,
                None => {
                    let intents = store.list_intents_for_session(&cli.session)?;
                    match intents.into_iter().find(|i| !i.status.is_terminal()) {
                        Some(intent) => intent,
                        None => bail!("no in-flight intent in session '{}'", cli.session),
                    }
                }
            };
            if intent.status.is_terminal() {
                println!("intent {} already {}", intent.id, intent.status);
            } else {
                intent.status = IntentStatus::Aborted;
                intent.updated_at = chrono::Utc::now();
                store.update_intent_status(&intent)?;
                println!("intent {} aborted", intent.id);
            }
        }
        Command::History => {
            let intents = store.list_intents_for_session(&cli.session)?;
            if intents.is_empty() {
                println!("no intents in session '{}'", cli.session);
            }
            for intent in intents {
                let survivors = store.list_survivors_for_intent(&intent.id)?;
                println!(
                    "{}  [{}]  survivors={}  {}",
                    intent.created_at.format("%Y-%m-%d %H:%M:%S"),
                    intent.status,
                    survivors.len(),
                    first_line(&intent.raw_message),
                );
            }
        }
    }

    Ok(())
}

fn build_orchestrator(
    cli: &Cli,
    config: ManifestConfig,
    store: SharedStore,
) -> Result<Orchestrator> {
    let gateway = Arc::new(HttpGateway::new(
        config.gateway.clone(),
        config.generation.cost_ceiling_usd,
    ));
    Orchestrator::new(store, gateway, config, &cli.data_dir, &cli.project_root)
        .context("build orchestrator")
}

fn print_report(store: &SharedStore, report: &RunReport) -> Result<()> {
    println!("{}", report.summary());
    for warning in &report.warnings {
        println!("warning: {warning}");
    }
    if let RunOutcome::AwaitingJudgment { .. } = &report.outcome {
        let survivors = store.list_survivors_for_intent(&report.intent_id)?;
        for line in present_survivors(&survivors) {
            println!("  {line}");
        }
        println!(
            "judge with: manifest judge {} accept|refine|redirect|abort ...",
            report.intent_id
        );
    }
    if let RunOutcome::ClarificationNeeded { questions } = &report.outcome {
        for question in questions {
            println!("  ? {question}");
        }
        println!("answer with: manifest clarify {} \"...\"", report.intent_id);
    }
    if let Some(suggestion) = &report.suggestion {
        println!("suggestion: {suggestion}");
    }
    Ok(())
}

fn first_line(message: &str) -> &str {
    message.lines().next().unwrap_or("")
}
