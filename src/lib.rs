// src/lib.rs

pub mod cli;
pub mod config;
pub mod dag;
pub mod engine;
pub mod errors;
pub mod exec;
pub mod gate;
pub mod logging;
pub mod notify;
pub mod report;
pub mod state;
pub mod workflow;

use std::path::Path;

use anyhow::{Context, Result};
use tokio::sync::watch;
use tracing::info;
use uuid::Uuid;

use crate::cli::CliArgs;
use crate::config::load_and_validate;
use crate::engine::{EngineOptions, Orchestrator, RunSummary};
use crate::exec::{ProcessBackend, StepRunner};
use crate::notify::{LogSink, NotificationDispatcher};
use crate::report::{PlaceholderPolicy, ReportValidator};
use crate::state::{RunState, StateStore};
use crate::workflow::{load_workflow, Workflow};

/// High-level entry point used by `main.rs`.
///
/// Wires together config + workflow loading, the run directory layout,
/// state resume, the wrapper backend, gates, notifications, and Ctrl-C
/// handling, then drives the orchestrator to completion.
pub async fn run(args: CliArgs) -> Result<RunSummary> {
    let config = load_and_validate(&args.config)?;
    let workflow = load_workflow(&args.workflow)?;

    if args.dry_run {
        print_dry_run(&workflow);
        return Ok(RunSummary {
            run_id: String::new(),
            success: true,
        });
    }

    let repo_dir = std::fs::canonicalize(&args.repo)
        .with_context(|| format!("resolving repo dir {:?}", args.repo))?;
    let workflow_root = args
        .workflow
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| repo_dir.clone());

    let run_id = args.run_id.clone().unwrap_or_else(new_run_id);
    let run_dir = repo_dir.join(".agents").join("runs").join(&run_id);
    let reports_dir = run_dir.join("reports");
    let logs_dir = run_dir.join("logs");
    let artifacts_dir = run_dir.join("artifacts");
    let manual_inputs_dir = run_dir.join("manual_inputs");

    std::fs::create_dir_all(&reports_dir)?;
    std::fs::create_dir_all(&logs_dir)?;
    std::fs::create_dir_all(&artifacts_dir)?;
    if config.pause_for_human_input {
        std::fs::create_dir_all(&manual_inputs_dir)?;
    }

    let store = StateStore::new(run_dir.join("run_state.json"));
    let state = match store.load()? {
        Some(prior) => {
            info!(run_id = %run_id, "resuming persisted run state");
            prior
        }
        None => RunState::new(
            run_id.clone(),
            workflow.name.clone(),
            repo_dir.clone(),
            reports_dir,
            manual_inputs_dir,
            workflow.steps.iter().map(|s| s.id.clone()),
        ),
    };

    let runner = StepRunner::new(
        Box::new(ProcessBackend),
        config.wrapper_argv.clone(),
        repo_dir,
        workflow_root,
        &run_dir,
        config.env_overrides.clone(),
    );
    let validator = ReportValidator::new(PlaceholderPolicy::with_extra_phrases(
        &config.placeholder_phrases,
    ));
    let gates = gate::evaluator_from_config(config.gate_state_path.clone());
    let notifier = NotificationDispatcher::spawn(Box::new(LogSink));

    let options = EngineOptions {
        poll_interval: config.poll_interval,
        max_attempts: config.max_attempts,
        max_iterations: config.max_iterations,
        pause_for_human_input: config.pause_for_human_input,
        grace_period: config.grace_period,
    };

    // Ctrl-C flips the cancellation flag; the orchestrator observes it at
    // the top of its loop and between sleeps.
    let (cancel_tx, cancel_rx) = watch::channel(false);
    tokio::spawn(async move {
        if let Err(err) = tokio::signal::ctrl_c().await {
            eprintln!("failed to listen for Ctrl+C: {err}");
            return;
        }
        let _ = cancel_tx.send(true);
    });

    let mut orchestrator = Orchestrator::new(
        workflow, state, store, runner, validator, gates, notifier, options, cancel_rx,
    );

    if let Some(start_at) = &args.start_at {
        orchestrator.reset_from(start_at)?;
    }

    let summary = orchestrator.run().await?;
    Ok(summary)
}

/// Short unique run id.
pub fn new_run_id() -> String {
    Uuid::new_v4().simple().to_string()[..8].to_string()
}

/// Simple dry-run output: print steps, dependencies and gates.
fn print_dry_run(workflow: &Workflow) {
    println!("agentdag dry-run");
    println!("workflow: {}", workflow.name);
    if !workflow.description.is_empty() {
        println!("  {}", workflow.description);
    }
    println!();

    println!("steps ({}):", workflow.steps.len());
    for step in &workflow.steps {
        println!("  - {}", step.id);
        println!("      agent: {}", step.agent);
        println!("      prompt: {}", step.prompt);
        if !step.needs.is_empty() {
            println!("      needs: {:?}", step.needs);
        }
        if !step.gates.is_empty() {
            println!("      gates: {:?}", step.gates);
        }
        if let Some(target) = &step.loop_back_to {
            println!("      loop_back_to: {target}");
        }
        if step.human_in_the_loop {
            println!("      human_in_the_loop: true");
        }
        if step.loop_spec.is_some() {
            println!("      loop: yes");
        }
        if let Some(timeout) = step.timeout_secs {
            println!("      timeout_secs: {timeout}");
        }
    }
}
