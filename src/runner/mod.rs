//! Process supervision: spawn, capture, timeout, cancel.
//!
//! Every execution gets one supervisor task that exclusively owns the child
//! process. Two pump tasks feed captured stdout/stderr into the supervisor
//! over a bounded channel; if the engine falls behind, the child blocks on
//! its pipes, which is acceptable up to the deadline. The supervisor selects
//! over output, child exit, the deadline, and the cancel signal, and exactly
//! one of those decides the terminal state:
//!
//! - natural exit: `COMPLETED` on zero, `FAILED` otherwise
//! - deadline: the process group is killed outright, state `TIMED_OUT`
//! - cancel: SIGTERM, a grace period, then SIGKILL, state `CANCELED`
//!
//! Whatever the cause, the supervisor drains buffered output, records the
//! terminal transition, publishes the terminal event, and releases the
//! workspace. The child never outlives its supervisor: the process group is
//! signaled on every path and `kill_on_drop` backstops panics.

use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::broadcast::{Broadcaster, ExecutionEvent};
use crate::config::types::RunnerConfig;
use crate::registry::execution::{ExecutionState, StreamTag};
use crate::registry::store::ExecutionCell;
use crate::registry::ExecutionId;
use crate::workspace::WorkspaceManager;

/// Handle to a supervised execution. Dropping it detaches; the supervisor
/// keeps running until the execution is terminal.
pub struct RunHandle {
    pub id: ExecutionId,
    join: JoinHandle<()>,
}

impl RunHandle {
    /// Wait until the supervisor has finished, terminal event included.
    pub async fn wait(self) {
        let _ = self.join.await;
    }
}

/// What decided the end of the run.
enum TerminalCause {
    Exited(Result<std::process::ExitStatus, std::io::Error>),
    Deadline,
    Cancel,
}

pub struct ProcessRunner {
    config: RunnerConfig,
    broadcaster: Broadcaster,
    workspaces: Arc<WorkspaceManager>,
}

impl ProcessRunner {
    pub fn new(
        config: RunnerConfig,
        broadcaster: Broadcaster,
        workspaces: Arc<WorkspaceManager>,
    ) -> Self {
        Self {
            config,
            broadcaster,
            workspaces,
        }
    }

    /// Spawn the supervisor for a freshly registered execution and return
    /// immediately; the caller never blocks on the child.
    pub fn start(&self, cell: Arc<ExecutionCell>) -> RunHandle {
        let id = match cell.with(|exec| exec.id) {
            Ok(id) => id,
            Err(_) => ExecutionId::new(),
        };
        let join = tokio::spawn(supervise(
            cell,
            self.config.clone(),
            self.broadcaster.clone(),
            self.workspaces.clone(),
        ));
        RunHandle { id, join }
    }
}

async fn supervise(
    cell: Arc<ExecutionCell>,
    config: RunnerConfig,
    broadcaster: Broadcaster,
    workspaces: Arc<WorkspaceManager>,
) {
    let Ok((id, spec, workspace, working_dir, timeout)) = cell.with(|exec| {
        (
            exec.id,
            exec.spec.clone(),
            exec.workspace.clone(),
            exec.working_dir.clone(),
            exec.timeout,
        )
    }) else {
        error!("execution record unreadable, supervisor aborting");
        return;
    };

    let mut seq: u64 = 0;
    broadcaster.publish_progress(ExecutionEvent::state_change(
        id,
        next(&mut seq),
        ExecutionState::Queued,
    ));

    info!(execution_id = %id, command = %spec.line, "starting execution");

    let mut cmd = Command::new(&spec.program);
    cmd.args(&spec.args)
        .current_dir(&working_dir)
        .env_clear()
        .env("PATH", &config.env_path)
        .env("HOME", &workspace)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    for (key, value) in &config.env_vars {
        cmd.env(key, value);
    }
    // Own process group, so timeouts and cancels reach descendants too.
    #[cfg(unix)]
    cmd.process_group(0);

    let mut child = match cmd.spawn() {
        Ok(child) => child,
        Err(e) => {
            let detail = format!("cannot spawn '{}': {}", spec.program, e);
            warn!(execution_id = %id, error = %e, "spawn failed");
            record(&cell, |exec| exec.fail(detail.clone()));
            finish(&cell, &broadcaster, &mut seq, id).await;
            workspaces.release(&workspace);
            return;
        }
    };
    let pid = child.id();

    record(&cell, |exec| exec.mark_running());
    broadcaster.publish_progress(ExecutionEvent::state_change(
        id,
        next(&mut seq),
        ExecutionState::Running,
    ));

    // Pumps own the pipe ends; the channel closes when both hit EOF.
    let (chunk_tx, mut chunk_rx) = mpsc::channel(config.channel_capacity.max(1));
    if let Some(stdout) = child.stdout.take() {
        tokio::spawn(pump(
            stdout,
            StreamTag::Stdout,
            chunk_tx.clone(),
            config.read_chunk_bytes.max(1),
        ));
    }
    if let Some(stderr) = child.stderr.take() {
        tokio::spawn(pump(
            stderr,
            StreamTag::Stderr,
            chunk_tx.clone(),
            config.read_chunk_bytes.max(1),
        ));
    }
    drop(chunk_tx);

    let mut cancel_rx = cell.subscribe_cancel();
    let deadline = tokio::time::sleep(timeout);
    tokio::pin!(deadline);
    let grace = Duration::from_millis(config.grace_period_ms);

    // Exactly one branch decides the terminal cause. `biased` puts the
    // deadline first, so a command at its limit times out even if exit or
    // output is ready in the same tick.
    let mut pipes_open = true;
    let mut cancel_live = true;
    let cause = loop {
        tokio::select! {
            biased;

            () = &mut deadline => break TerminalCause::Deadline,

            // `wait_for` also observes a flag raised before this task first
            // polled, which `changed` alone would treat as already seen.
            waited = cancel_rx.wait_for(|canceled| *canceled), if cancel_live => {
                match waited {
                    Ok(_) => break TerminalCause::Cancel,
                    // Sender gone means the record was evicted mid-run;
                    // keep running under the deadline alone.
                    Err(_) => cancel_live = false,
                }
            }

            maybe_chunk = chunk_rx.recv(), if pipes_open => {
                match maybe_chunk {
                    Some((tag, data)) => {
                        capture(&cell, &broadcaster, &mut seq, id, tag, data);
                    }
                    // Both pipes closed; keep selecting so the deadline
                    // still bounds a child that lingers after EOF.
                    None => pipes_open = false,
                }
            }

            status = child.wait() => break TerminalCause::Exited(status),
        }
    };

    match cause {
        TerminalCause::Exited(status) => {
            // Descendants holding the pipes must not outlive the run.
            kill_group(pid, &mut child, true).await;
            drain(&cell, &broadcaster, &mut seq, id, &mut chunk_rx, grace).await;
            match status {
                Ok(status) => {
                    debug!(execution_id = %id, code = ?status.code(), "child exited");
                    record(&cell, |exec| exec.finish_with_exit(status.code()));
                }
                Err(e) => {
                    warn!(execution_id = %id, error = %e, "wait on child failed");
                    record(&cell, |exec| exec.fail(format!("wait failed: {}", e)));
                }
            }
        }
        TerminalCause::Deadline => {
            info!(execution_id = %id, timeout_secs = timeout.as_secs_f64(), "deadline reached, killing process group");
            kill_group(pid, &mut child, true).await;
            let _ = child.wait().await;
            drain(&cell, &broadcaster, &mut seq, id, &mut chunk_rx, grace).await;
            record(&cell, |exec| exec.mark_timed_out());
        }
        TerminalCause::Cancel => {
            info!(execution_id = %id, "cancel requested, terminating process group");
            kill_group(pid, &mut child, false).await;
            let exited = tokio::time::timeout(grace, child.wait()).await.is_ok();
            if !exited {
                debug!(execution_id = %id, "grace period expired, killing process group");
                kill_group(pid, &mut child, true).await;
                let _ = child.wait().await;
            }
            drain(&cell, &broadcaster, &mut seq, id, &mut chunk_rx, grace).await;
            record(&cell, |exec| exec.mark_canceled());
        }
    }

    finish(&cell, &broadcaster, &mut seq, id).await;
    workspaces.release(&workspace);
}

fn next(seq: &mut u64) -> u64 {
    let current = *seq;
    *seq += 1;
    current
}

/// Apply a transition under the record lock, surfacing violations loudly;
/// a failed transition here means the state machine was driven from outside
/// the supervisor, which must never happen.
fn record<F>(cell: &ExecutionCell, f: F)
where
    F: FnOnce(&mut crate::registry::Execution) -> crate::error::Result<()>,
{
    match cell.with_mut(f) {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!(error = %e, "illegal execution transition"),
        Err(e) => error!(error = %e, "execution record lock failed"),
    }
}

fn capture(
    cell: &ExecutionCell,
    broadcaster: &Broadcaster,
    seq: &mut u64,
    id: ExecutionId,
    tag: StreamTag,
    data: String,
) {
    let appended = cell
        .with_mut(|exec| exec.append_output(tag, data.clone()))
        .unwrap_or(false);
    if appended {
        broadcaster.publish_progress(ExecutionEvent::output(
            id,
            next(seq),
            ExecutionState::Running,
            tag,
            data,
        ));
    }
}

/// Pull whatever the pumps still hold, bounded so a straggler descendant
/// keeping a pipe open cannot wedge the terminal path.
async fn drain(
    cell: &ExecutionCell,
    broadcaster: &Broadcaster,
    seq: &mut u64,
    id: ExecutionId,
    chunk_rx: &mut mpsc::Receiver<(StreamTag, String)>,
    bound: Duration,
) {
    let deadline = tokio::time::Instant::now() + bound;
    loop {
        match tokio::time::timeout_at(deadline, chunk_rx.recv()).await {
            Ok(Some((tag, data))) => capture(cell, broadcaster, seq, id, tag, data),
            Ok(None) => break,
            Err(_) => {
                debug!(execution_id = %id, "output drain window expired");
                break;
            }
        }
    }
}

/// Publish the terminal event for whatever state the record reached.
async fn finish(cell: &ExecutionCell, broadcaster: &Broadcaster, seq: &mut u64, id: ExecutionId) {
    let Ok((state, exit_code, detail)) =
        cell.with(|exec| (exec.state(), exec.exit_code(), exec.failure_detail.clone()))
    else {
        error!(execution_id = %id, "execution record unreadable at finish");
        return;
    };
    if !state.is_terminal() {
        error!(execution_id = %id, state = %state, "finish reached without terminal state");
        return;
    }
    broadcaster
        .publish_terminal(ExecutionEvent::terminal(
            id,
            next(seq),
            state,
            exit_code,
            detail,
        ))
        .await;
    info!(execution_id = %id, state = %state, exit_code = ?exit_code, "execution finished");
}

/// Read one pipe to EOF in fixed-size chunks. Reads land on arbitrary byte
/// boundaries, so a multibyte sequence split across two reads must be held
/// back until its remainder arrives; only genuinely invalid bytes become
/// replacement characters.
async fn pump<R>(mut reader: R, tag: StreamTag, tx: mpsc::Sender<(StreamTag, String)>, chunk: usize)
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut buf = vec![0u8; chunk];
    let mut pending = Vec::new();
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                pending.extend_from_slice(&buf[..n]);
                let data = take_complete_utf8(&mut pending);
                if !data.is_empty() && tx.send((tag, data)).await.is_err() {
                    return;
                }
            }
            Err(e) => {
                debug!(error = %e, "pipe read ended");
                break;
            }
        }
    }
    // A partial sequence dangling at EOF really is invalid output.
    if !pending.is_empty() {
        let _ = tx
            .send((tag, String::from_utf8_lossy(&pending).into_owned()))
            .await;
    }
}

/// Split off the longest decodable prefix of `pending`, leaving at most one
/// incomplete trailing sequence (under four bytes) behind. Invalid bytes
/// anywhere else decode to U+FFFD right away, so the carry never grows.
fn take_complete_utf8(pending: &mut Vec<u8>) -> String {
    let mut out = String::new();
    loop {
        match std::str::from_utf8(pending) {
            Ok(text) => {
                out.push_str(text);
                pending.clear();
                return out;
            }
            Err(e) => {
                let valid_up_to = e.valid_up_to();
                out.push_str(&String::from_utf8_lossy(&pending[..valid_up_to]));
                match e.error_len() {
                    Some(bad) => {
                        out.push(char::REPLACEMENT_CHARACTER);
                        pending.drain(..valid_up_to + bad);
                    }
                    // Incomplete tail: hold it for the next read.
                    None => {
                        pending.drain(..valid_up_to);
                        return out;
                    }
                }
            }
        }
    }
}

/// Signal the child's process group; ESRCH just means it is already gone.
/// Falls back to killing the direct child where groups are unavailable.
async fn kill_group(pid: Option<u32>, child: &mut Child, force: bool) {
    #[cfg(unix)]
    {
        use nix::errno::Errno;
        use nix::sys::signal::{killpg, Signal};
        use nix::unistd::Pid;

        if let Some(pid) = pid {
            let signal = if force { Signal::SIGKILL } else { Signal::SIGTERM };
            match killpg(Pid::from_raw(pid as i32), signal) {
                Ok(()) | Err(Errno::ESRCH) => return,
                Err(e) => warn!(pid, error = %e, "failed to signal process group"),
            }
        }
    }
    let _ = pid;
    if force {
        let _ = child.kill().await;
    } else {
        let _ = child.start_kill();
    }
}
