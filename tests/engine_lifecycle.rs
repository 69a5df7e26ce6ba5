//! End-to-end lifecycle scenarios through the public engine API.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::timeout;

use runlet::auth::Permission;
use runlet::broadcast::{ChannelSink, ExecutionEvent};
use runlet::config::types::{AuthConfig, AuthMode, RunletConfig, StaticToken};
use runlet::gateway::{Engine, StatusReport, SubmitRequest};
use runlet::registry::{ExecutionId, ExecutionState};

const TOKEN: &str = "it-token";

fn test_config(root: &std::path::Path) -> RunletConfig {
    let mut config = RunletConfig::default();
    config.workspace.root = Some(root.join("workspaces"));
    config.auth = AuthConfig {
        mode: AuthMode::Static,
        verify_url: None,
        tokens: vec![StaticToken {
            token: TOKEN.to_string(),
            requester_id: "it".to_string(),
            permissions: vec![Permission::Execute, Permission::Admin],
        }],
    };
    config
}

fn engine(root: &std::path::Path) -> (Engine, mpsc::Receiver<ExecutionEvent>) {
    let (sink, events) = ChannelSink::new(1024);
    let engine = Engine::new(&test_config(root), Arc::new(sink)).unwrap();
    (engine, events)
}

async fn submit_line(engine: &Engine, line: &str, timeout_seconds: u64) -> ExecutionId {
    engine
        .submit(
            TOKEN,
            SubmitRequest {
                command: line.to_string(),
                args: vec![],
                working_dir: None,
                timeout_seconds: Some(timeout_seconds),
            },
        )
        .await
        .unwrap()
        .execution_id
}

async fn wait_terminal(engine: &Engine, id: &ExecutionId) -> StatusReport {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(15);
    loop {
        let report = engine.status(TOKEN, id).await.unwrap();
        if report.state.is_terminal() {
            return report;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "execution {} stuck in {}",
            id,
            report.state
        );
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

async fn events_for(
    events: &mut mpsc::Receiver<ExecutionEvent>,
    id: ExecutionId,
) -> Vec<ExecutionEvent> {
    let mut seen = Vec::new();
    loop {
        let event = timeout(Duration::from_secs(10), events.recv())
            .await
            .expect("event stream stalled")
            .expect("event stream closed");
        if event.execution_id != id {
            continue;
        }
        let terminal = event.terminal;
        seen.push(event);
        if terminal {
            return seen;
        }
    }
}

#[tokio::test]
async fn echo_completes_with_output_and_ordered_events() {
    let root = tempfile::tempdir().unwrap();
    let (engine, mut events) = engine(root.path());

    let id = submit_line(&engine, "echo hello", 5).await;
    let report = wait_terminal(&engine, &id).await;

    assert_eq!(report.state, ExecutionState::Completed);
    assert_eq!(report.exit_code, Some(0));
    assert!(report.output_so_far.contains("hello"));
    assert!(report.finished_at.unwrap() >= report.started_at.unwrap());

    let stream = events_for(&mut events, id).await;
    let seqs: Vec<u64> = stream.iter().map(|e| e.seq).collect();
    for pair in seqs.windows(2) {
        assert!(pair[0] < pair[1], "seq must strictly increase: {:?}", seqs);
    }
    let terminals: Vec<_> = stream.iter().filter(|e| e.terminal).collect();
    assert_eq!(terminals.len(), 1, "exactly one terminal event");
    assert!(stream.last().unwrap().terminal, "terminal event is last");
    assert_eq!(stream.last().unwrap().state, ExecutionState::Completed);
}

#[tokio::test]
async fn long_command_times_out_without_exit_code() {
    let root = tempfile::tempdir().unwrap();
    let (engine, mut events) = engine(root.path());

    let started = tokio::time::Instant::now();
    let id = submit_line(&engine, "sleep 30", 1).await;
    let report = wait_terminal(&engine, &id).await;

    assert_eq!(report.state, ExecutionState::TimedOut);
    assert_eq!(report.exit_code, None);
    assert!(
        started.elapsed() < Duration::from_secs(10),
        "timeout must fire near the configured limit"
    );

    let stream = events_for(&mut events, id).await;
    assert_eq!(stream.last().unwrap().state, ExecutionState::TimedOut);
}

#[tokio::test]
async fn cancel_beats_timeout_and_is_reported_as_canceled() {
    let root = tempfile::tempdir().unwrap();
    let (engine, mut events) = engine(root.path());

    let id = submit_line(&engine, "sleep 30", 60).await;
    tokio::time::sleep(Duration::from_millis(200)).await;

    let cancel = engine.cancel(TOKEN, &id).await.unwrap();
    assert!(cancel.accepted);

    let report = wait_terminal(&engine, &id).await;
    assert_eq!(report.state, ExecutionState::Canceled);
    assert_eq!(report.exit_code, None);
    assert!(report.cancel_requested);

    let stream = events_for(&mut events, id).await;
    assert_eq!(stream.last().unwrap().state, ExecutionState::Canceled);
}

#[tokio::test]
async fn concurrent_executions_use_isolated_workspaces() {
    let root = tempfile::tempdir().unwrap();
    let (engine, _events) = engine(root.path());

    let a = submit_line(&engine, "pwd", 5).await;
    let b = submit_line(&engine, "pwd", 5).await;
    assert_ne!(a, b);

    let report_a = wait_terminal(&engine, &a).await;
    let report_b = wait_terminal(&engine, &b).await;

    assert_eq!(report_a.state, ExecutionState::Completed);
    assert_eq!(report_b.state, ExecutionState::Completed);
    let dir_a = report_a.output_so_far.trim().to_string();
    let dir_b = report_b.output_so_far.trim().to_string();
    assert_ne!(dir_a, dir_b, "each execution runs in its own directory");

    // A listing of a fresh workspace sees nothing of the sibling execution.
    let c = submit_line(&engine, "ls", 5).await;
    let report_c = wait_terminal(&engine, &c).await;
    assert_eq!(report_c.state, ExecutionState::Completed);
    assert_eq!(report_c.output_so_far.trim(), "");
}

#[tokio::test]
async fn workspaces_are_removed_after_terminal_states() {
    let root = tempfile::tempdir().unwrap();
    let (engine, _events) = engine(root.path());
    let ws_root = root.path().join("workspaces");

    let done = submit_line(&engine, "echo bye", 5).await;
    let timed = submit_line(&engine, "sleep 30", 1).await;
    wait_terminal(&engine, &done).await;
    wait_terminal(&engine, &timed).await;

    // Terminal paths always release their workspace, even on timeout. The
    // release happens just after the state flips, so allow it a moment.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let leftover = std::fs::read_dir(&ws_root).unwrap().count();
        if leftover == 0 {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "{} workspace(s) outlived their executions",
            leftover
        );
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

#[tokio::test]
async fn retained_status_remains_queryable_after_completion() {
    let root = tempfile::tempdir().unwrap();
    let (engine, _events) = engine(root.path());

    let id = submit_line(&engine, "echo kept", 5).await;
    wait_terminal(&engine, &id).await;

    // Well after completion the record still answers status queries.
    tokio::time::sleep(Duration::from_millis(100)).await;
    let report = engine.status(TOKEN, &id).await.unwrap();
    assert_eq!(report.state, ExecutionState::Completed);
    assert!(report.output_so_far.contains("kept"));

    let health = engine.health().unwrap();
    assert_eq!(health.retained_terminal, 1);
    assert_eq!(health.running, 0);
}
