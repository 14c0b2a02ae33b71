// tests/loop_expansion.rs

mod common;

use std::time::Duration;

use serde_json::json;

use agentdag::engine::EngineOptions;
use agentdag::state::StepStatus;

use crate::common::builders::{build_harness, StepBuilder, WorkflowBuilder};
use crate::common::fake::{Script, Scripted};
use crate::common::{drive_to_completion, init_tracing, status_of};

fn fast_options() -> EngineOptions {
    EngineOptions {
        poll_interval: Duration::from_millis(10),
        ..Default::default()
    }
}

#[tokio::test]
async fn items_from_predecessor_artifact_expand_into_serial_instances() {
    init_tracing();

    // plan emits stories.json; impl iterates over its entries.
    let workflow = WorkflowBuilder::new("stories")
        .step(StepBuilder::new("plan"))
        .step(StepBuilder::new("impl").needs("plan").loop_from_step("plan"))
        .build();
    let script =
        Script::new().step("plan", vec![Scripted::ok_with_artifacts(&["stories.json"])]);

    let mut harness = build_harness(workflow, script, fast_options());
    std::fs::write(
        harness.repo_dir.join("stories.json"),
        r#"["a", "b", "c"]"#,
    )
    .unwrap();

    drive_to_completion(&mut harness.orchestrator).await;

    for child in ["impl__00", "impl__01", "impl__02"] {
        assert_eq!(status_of(&harness.orchestrator, child), StepStatus::Completed);
    }
    // All instances completed, so the declared step is completed.
    let parent = harness.orchestrator.state().steps.get("impl").unwrap();
    assert_eq!(parent.status, StepStatus::Completed);
    assert_eq!(parent.loop_children.len(), 3);
    assert_eq!(parent.loop_items, Some(vec![json!("a"), json!("b"), json!("c")]));
    assert!(parent.report_path.is_some());

    // Instances ran strictly in order, one at a time.
    assert_eq!(
        harness.launched_step_ids(),
        vec!["plan", "impl__00", "impl__01", "impl__02"]
    );

    // Each instance saw its index and its raw scalar item.
    for (index, item) in ["a", "b", "c"].iter().enumerate() {
        let launch = harness.launch_for(&format!("impl__{index:02}"));
        assert_eq!(launch.env["LOOP_INDEX"], index.to_string());
        assert_eq!(launch.env["LOOP_ITEM"], *item);
    }
}

#[tokio::test]
async fn complex_items_are_json_encoded_in_the_env() {
    init_tracing();

    let workflow = WorkflowBuilder::new("objects")
        .step(StepBuilder::new("fan").loop_items(vec![json!({"id": 1}), json!(2)]))
        .build();

    let mut harness = build_harness(workflow, Script::new(), fast_options());
    drive_to_completion(&mut harness.orchestrator).await;

    assert_eq!(
        harness.launch_for("fan__00").env["LOOP_ITEM"],
        r#"{"id":1}"#
    );
    assert_eq!(harness.launch_for("fan__01").env["LOOP_ITEM"], "2");
}

#[tokio::test]
async fn empty_item_list_skips_the_step_and_unblocks_downstream() {
    init_tracing();

    let workflow = WorkflowBuilder::new("empty")
        .step(StepBuilder::new("a"))
        .step(StepBuilder::new("fan").needs("a").loop_items(vec![]))
        .step(StepBuilder::new("after").needs("fan"))
        .build();

    let mut harness = build_harness(workflow, Script::new(), fast_options());
    drive_to_completion(&mut harness.orchestrator).await;

    assert_eq!(status_of(&harness.orchestrator, "fan"), StepStatus::Skipped);
    assert_eq!(status_of(&harness.orchestrator, "after"), StepStatus::Completed);
    assert_eq!(harness.launched_step_ids(), vec!["a", "after"]);
}

#[tokio::test]
async fn items_can_come_from_a_metrics_entry() {
    init_tracing();

    let workflow = WorkflowBuilder::new("metric-items")
        .step(StepBuilder::new("plan"))
        .step(
            StepBuilder::new("impl")
                .needs("plan")
                .loop_from_metric("plan", "stories"),
        )
        .build();
    let script = Script::new().step(
        "plan",
        vec![Scripted::ok_with_metric("stories", json!(["u", "v"]))],
    );

    let mut harness = build_harness(workflow, script, fast_options());
    drive_to_completion(&mut harness.orchestrator).await;

    let parent = harness.orchestrator.state().steps.get("impl").unwrap();
    assert_eq!(parent.status, StepStatus::Completed);
    assert_eq!(parent.loop_children.len(), 2);
}

#[tokio::test]
async fn items_can_come_from_a_repo_artifact() {
    init_tracing();

    let workflow = WorkflowBuilder::new("artifact-items")
        .step(StepBuilder::new("fan").loop_from_artifact("items.json"))
        .build();

    let mut harness = build_harness(workflow, Script::new(), fast_options());
    std::fs::write(harness.repo_dir.join("items.json"), r#"{"items": ["p", "q"]}"#).unwrap();

    drive_to_completion(&mut harness.orchestrator).await;

    assert_eq!(status_of(&harness.orchestrator, "fan"), StepStatus::Completed);
    assert_eq!(
        harness.launched_step_ids(),
        vec!["fan__00", "fan__01"]
    );
}

#[tokio::test]
async fn gate_failure_from_an_instance_rewinds_the_whole_group() {
    init_tracing();

    let workflow = WorkflowBuilder::new("group-rewind")
        .step(StepBuilder::new("code"))
        .step(
            StepBuilder::new("fan")
                .needs("code")
                .loop_items(vec![json!("x"), json!("y")])
                .loop_back_to("code"),
        )
        .build();
    // The second instance flags a gate failure once, then passes.
    let script = Script::new().step(
        "fan__01",
        vec![Scripted::gate_failure(), Scripted::ok()],
    );

    let mut harness = build_harness(workflow, script, fast_options());
    drive_to_completion(&mut harness.orchestrator).await;

    let state = harness.orchestrator.state();
    assert_eq!(state.steps["fan"].status, StepStatus::Completed);
    assert_eq!(state.steps["code"].iteration_count, 1);
    assert_eq!(state.steps["fan"].iteration_count, 1);
    assert_eq!(state.steps["fan__00"].iteration_count, 1);
    assert_eq!(state.steps["fan__01"].iteration_count, 1);

    // The rewind replayed the original item list, not a re-resolved one.
    assert_eq!(
        state.steps["fan"].loop_items,
        Some(vec![json!("x"), json!("y")])
    );
    assert_eq!(
        harness.launched_step_ids(),
        vec!["code", "fan__00", "fan__01", "code", "fan__00", "fan__01"]
    );
}

#[tokio::test]
async fn failing_instance_fails_the_group_and_later_instances() {
    init_tracing();

    let workflow = WorkflowBuilder::new("group-failure")
        .step(
            StepBuilder::new("fan").loop_items(vec![json!("x"), json!("y"), json!("z")]),
        )
        .step(StepBuilder::new("after").needs("fan"))
        .build();
    let script = Script::new().step("fan__01", vec![Scripted::failed("instance broke")]);

    let options = EngineOptions {
        poll_interval: Duration::from_millis(10),
        max_attempts: 1,
        ..Default::default()
    };
    let mut harness = build_harness(workflow, script, options);
    drive_to_completion(&mut harness.orchestrator).await;

    let state = harness.orchestrator.state();
    assert_eq!(state.steps["fan__00"].status, StepStatus::Completed);
    assert_eq!(state.steps["fan__01"].status, StepStatus::Failed);
    assert_eq!(state.steps["fan__02"].status, StepStatus::Failed);
    assert_eq!(state.steps["fan"].status, StepStatus::Failed);
    assert_eq!(state.steps["after"].status, StepStatus::Failed);

    // The third instance never launched.
    assert!(!harness
        .launched_step_ids()
        .contains(&"fan__02".to_string()));
}
