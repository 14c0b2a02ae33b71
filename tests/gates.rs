// tests/gates.rs

mod common;

use std::time::Duration;

use agentdag::engine::EngineOptions;
use agentdag::gate::FileBackedGates;
use agentdag::state::StepStatus;

use crate::common::builders::{build_harness_gated, StepBuilder, WorkflowBuilder};
use crate::common::fake::Script;
use crate::common::{drive_to_completion, init_tracing, status_of};

#[tokio::test]
async fn gated_step_waits_until_the_gate_flips_open() {
    init_tracing();

    let gate_dir = tempfile::tempdir().unwrap();
    let gate_path = gate_dir.path().join("gates.json");

    let workflow = WorkflowBuilder::new("gated")
        .step(StepBuilder::new("deploy").gate("ci_green"))
        .build();

    let options = EngineOptions {
        poll_interval: Duration::from_millis(10),
        ..Default::default()
    };
    let mut harness = build_harness_gated(
        workflow,
        Script::new(),
        options,
        Box::new(FileBackedGates::new(&gate_path)),
    );

    // No gate file yet: the step stays pending tick after tick.
    for _ in 0..3 {
        harness.orchestrator.tick().await;
    }
    assert_eq!(status_of(&harness.orchestrator, "deploy"), StepStatus::Pending);
    assert!(harness.launched_step_ids().is_empty());

    // An external system opens the gate; the very next tick admits.
    std::fs::write(&gate_path, r#"{"ci_green": true}"#).unwrap();
    harness.orchestrator.tick().await;
    assert_eq!(harness.launched_step_ids(), vec!["deploy"]);

    drive_to_completion(&mut harness.orchestrator).await;
    assert_eq!(status_of(&harness.orchestrator, "deploy"), StepStatus::Completed);
}

#[tokio::test]
async fn closed_gate_only_blocks_the_gated_step() {
    init_tracing();

    let gate_dir = tempfile::tempdir().unwrap();
    let gate_path = gate_dir.path().join("gates.json");
    std::fs::write(&gate_path, r#"{"release_ok": false}"#).unwrap();

    let workflow = WorkflowBuilder::new("partial")
        .step(StepBuilder::new("build"))
        .step(StepBuilder::new("release").needs("build").gate("release_ok"))
        .build();

    let options = EngineOptions {
        poll_interval: Duration::from_millis(10),
        ..Default::default()
    };
    let mut harness = build_harness_gated(
        workflow,
        Script::new(),
        options,
        Box::new(FileBackedGates::new(&gate_path)),
    );

    for _ in 0..4 {
        harness.orchestrator.tick().await;
    }
    assert_eq!(status_of(&harness.orchestrator, "build"), StepStatus::Completed);
    assert_eq!(status_of(&harness.orchestrator, "release"), StepStatus::Pending);

    std::fs::write(&gate_path, r#"{"release_ok": true}"#).unwrap();
    drive_to_completion(&mut harness.orchestrator).await;
    assert_eq!(status_of(&harness.orchestrator, "release"), StepStatus::Completed);
}
