//! Integration tests for the loop controller against on-disk state.

use std::fs;
use std::sync::{Arc, Mutex};

use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use ralph_codex::testing::MockBackendRunner;
use ralph_codex::{
    BreakerState, EventSink, FileStateStore, LoopConfig, LoopController, LoopEvent, LoopStatus,
    ProjectContext, RalphError, StateStore,
};

const PROGRESS: &str =
    "Edited src/lib.rs\n---RALPH_STATUS---\nSTATUS: IN_PROGRESS\nFILES_MODIFIED: 1\n---END_RALPH_STATUS---";

const DONE: &str = "---RALPH_STATUS---\nSTATUS: COMPLETE\nFILES_MODIFIED: 2\nEXIT_SIGNAL: true\n---END_RALPH_STATUS---";

fn project(plan: &str) -> TempDir {
    let temp = TempDir::new().unwrap();
    fs::write(temp.path().join("PROMPT.md"), "Work through @fix_plan.md").unwrap();
    fs::write(temp.path().join("@fix_plan.md"), plan).unwrap();
    temp
}

fn controller(
    temp: &TempDir,
    runner: Arc<MockBackendRunner>,
    config: LoopConfig,
) -> (LoopController, Arc<FileStateStore>) {
    let store = Arc::new(FileStateStore::for_project(temp.path()));
    let context = Arc::new(ProjectContext::new(temp.path()));
    let ctrl = LoopController::new(config, runner, context, store.clone());
    (ctrl, store)
}

#[tokio::test]
async fn test_finished_plan_completes_without_backend_call() {
    let temp = project("- [x] parse\n- [x] test\n");
    let runner = Arc::new(MockBackendRunner::new().with_output(PROGRESS));
    let (mut ctrl, _) = controller(&temp, runner.clone(), LoopConfig::default());

    assert!(ctrl.check_completion());
    assert_eq!(runner.call_count(), 0);
}

#[tokio::test]
async fn test_exit_signal_persists_across_restarts() {
    let temp = project("- [ ] parse\n");
    let runner = Arc::new(MockBackendRunner::new().with_output(DONE));

    let (mut ctrl, store) = controller(&temp, runner.clone(), LoopConfig::default());
    ctrl.run(&CancellationToken::new()).await.unwrap();

    assert!(temp.path().join(".ralph").join("exit_signals.json").exists());
    assert_eq!(store.load_exit_signals().unwrap(), vec!["loop_1"]);

    // A new process sees the earlier signal and does not duplicate it.
    let (mut ctrl, store) = controller(&temp, runner.clone(), LoopConfig::default());
    ctrl.run(&CancellationToken::new()).await.unwrap();
    assert_eq!(store.load_exit_signals().unwrap(), vec!["loop_1"]);
    assert!(ctrl.last_analysis().unwrap().confidence > 0.85);

    assert_eq!(store.load_call_budget().unwrap().unwrap().calls_made, 2);
}

#[tokio::test]
async fn test_breaker_opens_across_runs_and_reset_reopens_loop() {
    let temp = project("- [ ] parse\n");
    let failing = Arc::new(MockBackendRunner::new().with_error("segfault"));

    for _ in 0..3 {
        let (mut ctrl, _) = controller(&temp, failing.clone(), LoopConfig::default());
        let err = ctrl.run(&CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, RalphError::Backend { .. }));
    }

    let (mut ctrl, store) = controller(&temp, failing.clone(), LoopConfig::default());
    assert_eq!(ctrl.breaker().state(), BreakerState::Halted);
    let err = ctrl.run(&CancellationToken::new()).await.unwrap_err();
    assert!(matches!(err, RalphError::CircuitHalted { .. }));
    assert_eq!(failing.call_count(), 3);

    ctrl.graceful_exit().await.unwrap();
    assert_eq!(
        store.load_breaker().unwrap().unwrap().state,
        BreakerState::Stable
    );

    let healthy = Arc::new(MockBackendRunner::new().with_output(DONE));
    let (mut ctrl, _) = controller(&temp, healthy.clone(), LoopConfig::default());
    ctrl.run(&CancellationToken::new()).await.unwrap();
    assert_eq!(healthy.call_count(), 1);
}

#[tokio::test]
async fn test_corrupt_state_files_fall_back_to_defaults() {
    let temp = project("- [ ] parse\n");
    let state = temp.path().join(".ralph");
    fs::create_dir_all(&state).unwrap();
    fs::write(state.join("circuit_breaker.json"), "{ broken").unwrap();
    fs::write(state.join("call_budget.json"), "[1, 2").unwrap();
    fs::write(state.join("exit_signals.json"), "nope").unwrap();

    let runner = Arc::new(MockBackendRunner::new().with_output(DONE));
    let (mut ctrl, store) = controller(&temp, runner.clone(), LoopConfig::default());
    assert_eq!(ctrl.breaker().state(), BreakerState::Stable);
    assert_eq!(ctrl.limiter().calls_made(), 0);

    ctrl.run(&CancellationToken::new()).await.unwrap();
    assert_eq!(runner.call_count(), 1);
    assert_eq!(store.load_exit_signals().unwrap(), vec!["loop_1"]);
}

#[tokio::test]
async fn test_event_stream_order() {
    let temp = project("- [ ] parse\n");
    let runner = Arc::new(MockBackendRunner::new().with_output(DONE));

    let statuses = Arc::new(Mutex::new(Vec::new()));
    let captured = Arc::clone(&statuses);
    let sink: EventSink = Arc::new(move |event: LoopEvent| {
        if let LoopEvent::LoopUpdate { status, .. } = event {
            captured.lock().unwrap().push(status);
        }
    });

    let (ctrl, _) = controller(&temp, runner, LoopConfig::default());
    let mut ctrl = ctrl.with_event_sink(sink);
    ctrl.run(&CancellationToken::new()).await.unwrap();

    let statuses = statuses.lock().unwrap().clone();
    assert_eq!(
        statuses,
        vec![
            LoopStatus::Starting,
            LoopStatus::Running,
            LoopStatus::Executing,
            LoopStatus::BackendRunning,
            LoopStatus::ExecutionComplete,
            LoopStatus::Stopped,
        ]
    );
}

#[tokio::test]
async fn test_plan_checked_off_between_loops_completes() {
    let temp = project("- [ ] parse\n- [ ] test\n");
    let runner = Arc::new(MockBackendRunner::new().with_output(PROGRESS));
    let (mut ctrl, _) = controller(&temp, runner.clone(), LoopConfig::default());

    let cancel = CancellationToken::new();
    ctrl.execute_loop(&cancel).await.unwrap();
    assert!(!ctrl.check_completion());

    fs::write(temp.path().join("@fix_plan.md"), "- [x] parse\n- [x] test\n").unwrap();
    assert!(ctrl.check_completion());
    assert_eq!(runner.call_count(), 1);
    assert!(ctrl.session().should_stop);
}
