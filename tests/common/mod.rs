#![allow(dead_code)]

pub mod builders;
pub mod fake;

use std::sync::Once;

use tracing_subscriber::{fmt, EnvFilter};

use agentdag::engine::Orchestrator;
use agentdag::state::StepStatus;

static INIT: Once = Once::new();

/// Initialise tracing for tests.
///
/// - Uses `with_test_writer()`, so logs are captured per-test.
/// - The Rust test harness only prints captured output for **failing**
///   tests (unless you run with `-- --nocapture`).
///
/// Enable levels with e.g.:
/// `RUST_LOG=debug cargo test`
pub fn init_tracing() {
    INIT.call_once(|| {
        let filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

        fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .with_target(true)
            .init();
    });
}

/// Tick the orchestrator until every step settles, with an upper bound so
/// a scheduling bug fails the test instead of hanging it.
pub async fn drive_to_completion(orchestrator: &mut Orchestrator) {
    for _ in 0..100 {
        orchestrator.tick().await;
        if all_settled(orchestrator) {
            return;
        }
    }
    panic!("orchestrator did not settle within 100 ticks");
}

pub fn all_settled(orchestrator: &Orchestrator) -> bool {
    orchestrator
        .state()
        .steps
        .values()
        .all(|rt| rt.status.is_terminal())
}

pub fn status_of(orchestrator: &Orchestrator, step: &str) -> StepStatus {
    orchestrator
        .state()
        .steps
        .get(step)
        .unwrap_or_else(|| panic!("no runtime record for step '{step}'"))
        .status
}
