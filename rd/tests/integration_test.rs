//! Integration tests for robotd
//!
//! These drive the public API end to end with the embedded SQLite backend
//! and fake robots built from `sh`.

#![cfg(unix)]

use std::os::unix::fs::PermissionsExt;
use std::os::unix::process::ExitStatusExt;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use robotd::agent::AgentContext;
use robotd::config::{Config, ProcessConfig};
use robotd::domain::{ExecutionSpec, ExecutionStatus, ExecutionUpdate, ServerStatus};
use robotd::orchestrator::DisabledOrchestrator;
use robotd::process::{OutputLine, ProcessController, ProcessTable};
use robotd::state::{ORPHANED_ERROR, SqliteBackend, StateBackend, StateCoordinator, pause_control_key};
use serial_test::serial;
use tempfile::TempDir;
use tokio::sync::mpsc;

fn test_config(temp: &TempDir) -> Config {
    let mut config = Config::default();
    config.machine_id = "it-machine".to_string();
    config.robot.work_dir = temp.path().join("runs");
    config.process.stop_timeout_ms = 1000;
    config.process.settle_delay_ms = 100;
    config.process.driver_names.clear();
    config
}

fn open_backend(temp: &TempDir) -> Arc<dyn StateBackend> {
    Arc::new(SqliteBackend::open(temp.path().join("state.db")).expect("Failed to open sqlite"))
}

async fn start_agent(temp: &TempDir) -> AgentContext {
    AgentContext::start_with(&test_config(temp), open_backend(temp), Arc::new(DisabledOrchestrator)).await
}

async fn wait_for_status(ctx: &AgentContext, id: &str, status: ExecutionStatus) -> robotd::ExecutionRecord {
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        if let Some(record) = ctx.query_execution(id).await
            && record.status == Some(status)
        {
            return record;
        }
        assert!(Instant::now() < deadline, "{} never reached {}", id, status);
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

fn process_gone(pid: u32) -> bool {
    // Zombies are filtered out of the table
    !ProcessTable::snapshot().contains(pid)
}

async fn wait_for_descendants(root: u32, count: usize) -> Vec<u32> {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let descendants = ProcessTable::snapshot().descendants(root);
        if descendants.len() >= count {
            return descendants;
        }
        assert!(Instant::now() < deadline, "children of {} never appeared", root);
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

// =============================================================================
// Recovery
// =============================================================================

#[tokio::test]
async fn test_recovery_marks_orphans_failed() {
    let temp = TempDir::new().unwrap();
    {
        let state = StateCoordinator::new(open_backend(&temp));
        state
            .save_execution_state("was-running", ExecutionUpdate::new().status(ExecutionStatus::Running).pid(4242))
            .await;
        state
            .save_execution_state("was-paused", ExecutionUpdate::new().status(ExecutionStatus::Paused))
            .await;
        state.request_pause("was-paused").await;
        state
            .save_execution_state(
                "done",
                ExecutionUpdate::new().status(ExecutionStatus::Completed).exit_code(0),
            )
            .await;
        state.close().await;
    }

    let ctx = start_agent(&temp).await;
    assert_eq!(ctx.recovery().recovered, 2);
    assert_eq!(ctx.query_status().await, Some(ServerStatus::Free));

    for id in ["was-running", "was-paused"] {
        let record = ctx.query_execution(id).await.unwrap();
        assert_eq!(record.status, Some(ExecutionStatus::Failed));
        assert_eq!(record.error.as_deref(), Some(ORPHANED_ERROR));
        assert!(record.finished_at.is_some());
    }
    let done = ctx.query_execution("done").await.unwrap();
    assert_eq!(done.status, Some(ExecutionStatus::Completed));

    let leftover = ctx.state().backend().keys(&pause_control_key("was-paused")).await.unwrap();
    assert!(leftover.is_empty());
}

#[tokio::test]
async fn test_state_merge_preserves_fields() {
    let temp = TempDir::new().unwrap();
    let state = StateCoordinator::new(open_backend(&temp));

    state
        .save_execution_state("m-1", ExecutionUpdate::new().status(ExecutionStatus::Running).pid(100))
        .await;
    state
        .save_execution_state("m-1", ExecutionUpdate::new().status(ExecutionStatus::Completed).exit_code(0))
        .await;

    let record = state.get_execution("m-1").await.unwrap();
    assert_eq!(record.status, Some(ExecutionStatus::Completed));
    assert_eq!(record.pid, Some(100));
    assert_eq!(record.exit_code, Some(0));
}

// =============================================================================
// Process tree stop
// =============================================================================

fn controller(stop_timeout_ms: u64) -> ProcessController {
    ProcessController::new(ProcessConfig {
        stop_timeout_ms,
        settle_delay_ms: 100,
        driver_names: Vec::new(),
        ..Default::default()
    })
}

fn argv(script: &str) -> Vec<String> {
    vec!["sh".to_string(), "-c".to_string(), script.to_string()]
}

#[tokio::test]
#[serial]
async fn test_cooperative_stop_takes_children_down() {
    let controller = controller(2000);
    let (handle, _output) = controller
        .start(&argv("sleep 30 & sleep 30 & wait"), Path::new("."), &[])
        .await
        .unwrap();
    let children = wait_for_descendants(handle.pid(), 2).await;

    let outcome = controller.stop(handle).await;
    assert!(!outcome.forced);
    assert!(outcome.exit_code.is_some());

    assert!(process_gone(handle.pid()));
    for pid in children {
        assert!(process_gone(pid), "child {} survived", pid);
    }

    // Second stop is a no-op
    let again = controller.stop(handle).await;
    assert!(again.already_stopped);
}

#[tokio::test]
#[serial]
async fn test_graceless_stop_force_kills_tree() {
    let controller = controller(500);
    let (handle, _output) = controller
        .start(&argv("trap '' TERM; sleep 30 & sleep 30 & wait"), Path::new("."), &[])
        .await
        .unwrap();
    let children = wait_for_descendants(handle.pid(), 2).await;

    let started = Instant::now();
    let outcome = controller.stop(handle).await;
    assert!(outcome.forced);
    assert!(started.elapsed() < Duration::from_secs(5));

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(process_gone(handle.pid()));
    for pid in children {
        assert!(process_gone(pid), "child {} survived", pid);
    }
}

/// Collect output lines for `window`
async fn lines_within(output: &mut mpsc::Receiver<OutputLine>, window: Duration) -> Vec<String> {
    let deadline = tokio::time::Instant::now() + window;
    let mut lines = Vec::new();
    while let Ok(Some(line)) = tokio::time::timeout_at(deadline, output.recv()).await {
        lines.push(line.text);
    }
    lines
}

#[tokio::test]
#[serial]
async fn test_pause_silences_whole_tree_until_resume() {
    let controller = controller(1000);
    let script = "(while true; do echo child; sleep 0.1; done) & while true; do echo parent; sleep 0.1; done";
    let (handle, mut output) = controller.start(&argv(script), Path::new("."), &[]).await.unwrap();
    wait_for_descendants(handle.pid(), 1).await;

    let before = lines_within(&mut output, Duration::from_millis(500)).await;
    assert!(before.iter().any(|l| l == "parent"));
    assert!(before.iter().any(|l| l == "child"));

    // Root and the looping subshell at least
    assert!(controller.pause(handle).await >= 2);
    lines_within(&mut output, Duration::from_millis(200)).await;
    let while_paused = lines_within(&mut output, Duration::from_secs(1)).await;
    assert!(while_paused.is_empty(), "output while paused: {:?}", while_paused);

    assert!(controller.resume(handle).await >= 2);
    let after = lines_within(&mut output, Duration::from_secs(1)).await;
    assert!(after.iter().any(|l| l == "parent"));
    assert!(after.iter().any(|l| l == "child"));

    controller.stop(handle).await;
}

#[tokio::test]
#[serial]
async fn test_stop_sweeps_detached_automation_driver() {
    let temp = TempDir::new().unwrap();
    let driver = temp.path().join("fake-driver");
    std::fs::write(&driver, "#!/bin/sh\nwhile true; do sleep 1; done\n").unwrap();
    std::fs::set_permissions(&driver, std::fs::Permissions::from_mode(0o755)).unwrap();

    let controller = ProcessController::new(ProcessConfig {
        stop_timeout_ms: 1000,
        settle_delay_ms: 100,
        driver_names: vec!["fake-driver".to_string()],
        ..Default::default()
    });
    let (handle, _output) = controller.start(&argv("sleep 30"), temp.path(), &[]).await.unwrap();

    // Started outside the robot's tree, as a detached driver would be
    let mut detached = std::process::Command::new(&driver).spawn().unwrap();
    let driver_pid = detached.id();
    let deadline = Instant::now() + Duration::from_secs(5);
    while ProcessTable::snapshot().get(driver_pid).is_none_or(|p| p.name != "fake-driver") {
        assert!(Instant::now() < deadline, "driver never showed up");
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    let outcome = controller.stop(handle).await;
    assert!(outcome.orphans_killed >= 1);

    let status = detached.wait().unwrap();
    assert_eq!(status.signal(), Some(9));
}

// =============================================================================
// Agent lifecycle
// =============================================================================

#[tokio::test]
#[serial]
async fn test_pause_resume_stop_through_agent() {
    let temp = TempDir::new().unwrap();
    let ctx = start_agent(&temp).await;

    let submitted = ctx
        .submit_run(
            ExecutionSpec::new("bot")
                .with_execution_id("pr-1")
                .with_command(["sleep", "30"]),
        )
        .await
        .unwrap();
    wait_for_status(&ctx, "pr-1", ExecutionStatus::Running).await;

    assert!(ctx.request_pause("pr-1").await.unwrap());
    let paused = wait_for_status(&ctx, "pr-1", ExecutionStatus::Paused).await;
    assert!(paused.paused_at.is_some());
    assert_eq!(ctx.local_status().await, ServerStatus::Paused);

    assert!(ctx.request_resume("pr-1").await.unwrap());
    let resumed = wait_for_status(&ctx, "pr-1", ExecutionStatus::Running).await;
    assert!(resumed.resumed_at >= resumed.paused_at);
    assert!(ctx.state().get_pause_control("pr-1").await.is_empty());

    let report = ctx.request_stop("pr-1").await.unwrap();
    assert!(!report.noop);
    let record = ctx.query_execution("pr-1").await.unwrap();
    assert_eq!(record.status, Some(ExecutionStatus::Completed));
    assert!(record.stopped);
    assert!(record.exit_code.is_some());
    assert_eq!(record.task_handle, Some(submitted.task_handle.to_string()));
    assert_eq!(ctx.local_status().await, ServerStatus::Free);

    ctx.shutdown().await;
}

#[tokio::test]
#[serial]
async fn test_failing_robot_is_recorded() {
    let temp = TempDir::new().unwrap();
    let ctx = start_agent(&temp).await;

    let submitted = ctx
        .submit_run(
            ExecutionSpec::new("bot")
                .with_execution_id("fail-1")
                .with_command(["sh", "-c", "echo boom >&2; exit 3"]),
        )
        .await
        .unwrap();
    ctx.wait_run(submitted.task_handle).await.unwrap();

    let record = ctx.query_execution("fail-1").await.unwrap();
    assert_eq!(record.status, Some(ExecutionStatus::Failed));
    assert_eq!(record.exit_code, Some(3));
    assert_eq!(ctx.query_status().await, Some(ServerStatus::Free));
}

#[tokio::test]
#[serial]
async fn test_setup_failure_never_spawns() {
    let temp = TempDir::new().unwrap();
    let ctx = start_agent(&temp).await;

    let submitted = ctx
        .submit_run(
            ExecutionSpec::new("bot")
                .with_execution_id("setup-1")
                .with_param("file", "base64:../escape.txt:aGk=")
                .with_command(["sh", "-c", "touch spawned"]),
        )
        .await
        .unwrap();
    ctx.wait_run(submitted.task_handle).await.unwrap();

    let record = ctx.query_execution("setup-1").await.unwrap();
    assert_eq!(record.status, Some(ExecutionStatus::Failed));
    assert!(record.pid.is_none());
    assert!(record.error.is_some());
    assert!(!temp.path().join("runs").join("setup-1").join("spawned").exists());
    assert_eq!(ctx.local_status().await, ServerStatus::Free);
}

#[tokio::test]
#[serial]
async fn test_inline_file_reaches_robot() {
    let temp = TempDir::new().unwrap();
    let ctx = start_agent(&temp).await;

    // "hello" in base64
    let submitted = ctx
        .submit_run(
            ExecutionSpec::new("bot")
                .with_execution_id("file-1")
                .with_param("greeting", "base64:greeting.txt:aGVsbG8=")
                .with_command(["sh", "-c", "cp files/greeting.txt copied.txt"]),
        )
        .await
        .unwrap();
    ctx.wait_run(submitted.task_handle).await.unwrap();

    let record = ctx.query_execution("file-1").await.unwrap();
    assert_eq!(record.status, Some(ExecutionStatus::Completed));
    let copied = temp.path().join("runs").join("file-1").join("copied.txt");
    assert_eq!(std::fs::read_to_string(copied).unwrap(), "hello");
}
