//! The execution entity and its state machine.
//!
//! All state here is plain data; the concurrency-safe store in
//! [`super::store`] owns the locking. Transition methods enforce the legal
//! state graph and reject everything else, so a caller holding the lock can
//! never corrupt an execution record.

use std::collections::VecDeque;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Result, RunletError};
use crate::policy::CommandSpec;

/// Sentinel exit code recorded when the OS gives us none: spawn failures and
/// processes torn down by an unrelated signal.
pub const EXIT_CODE_UNKNOWN: i32 = -1;

/// Unique identifier for one execution, assigned at submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExecutionId(Uuid);

impl ExecutionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ExecutionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ExecutionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl std::str::FromStr for ExecutionId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// Lifecycle states. `Queued` and `Running` are the only non-terminal ones;
/// every terminal state is final.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionState {
    Queued,
    Running,
    Completed,
    Failed,
    Canceled,
    TimedOut,
}

impl ExecutionState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Queued | Self::Running)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "QUEUED",
            Self::Running => "RUNNING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::Canceled => "CANCELED",
            Self::TimedOut => "TIMED_OUT",
        }
    }
}

impl fmt::Display for ExecutionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which stream a captured chunk came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamTag {
    Stdout,
    Stderr,
}

/// One captured piece of child output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputChunk {
    pub tag: StreamTag,
    pub data: String,
    pub captured_at: DateTime<Utc>,
}

/// Append-only, size-capped output store. When the cap is exceeded the
/// oldest chunks are evicted; the count of evicted bytes is retained so a
/// status reader can tell the head of the output is gone.
#[derive(Debug, Clone)]
pub struct OutputBuffer {
    chunks: VecDeque<OutputChunk>,
    bytes: usize,
    capacity: usize,
    dropped_bytes: u64,
}

impl OutputBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            chunks: VecDeque::new(),
            bytes: 0,
            capacity,
            dropped_bytes: 0,
        }
    }

    pub fn push(&mut self, tag: StreamTag, data: String) {
        self.bytes += data.len();
        self.chunks.push_back(OutputChunk {
            tag,
            data,
            captured_at: Utc::now(),
        });
        // Keep at least the newest chunk even if it alone exceeds the cap.
        while self.bytes > self.capacity && self.chunks.len() > 1 {
            if let Some(evicted) = self.chunks.pop_front() {
                self.bytes -= evicted.data.len();
                self.dropped_bytes += evicted.data.len() as u64;
            }
        }
    }

    pub fn chunks(&self) -> impl Iterator<Item = &OutputChunk> {
        self.chunks.iter()
    }

    /// All retained output in capture order, streams interleaved.
    pub fn combined(&self) -> String {
        self.chunks.iter().map(|c| c.data.as_str()).collect()
    }

    pub fn byte_len(&self) -> usize {
        self.bytes
    }

    pub fn dropped_bytes(&self) -> u64 {
        self.dropped_bytes
    }
}

/// The central entity: one submitted command and everything known about it.
#[derive(Debug)]
pub struct Execution {
    pub id: ExecutionId,
    pub requester_id: String,
    pub spec: CommandSpec,
    /// Directory owned exclusively by this execution for its whole life.
    pub workspace: PathBuf,
    /// Effective working directory of the child; inside the workspace root.
    pub working_dir: PathBuf,
    pub timeout: Duration,
    state: ExecutionState,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    exit_code: Option<i32>,
    /// Diagnostic for failures that never produced an exit status.
    pub failure_detail: Option<String>,
    cancel_requested: bool,
    output: OutputBuffer,
}

impl Execution {
    pub fn new(
        id: ExecutionId,
        requester_id: String,
        spec: CommandSpec,
        workspace: PathBuf,
        working_dir: PathBuf,
        timeout: Duration,
        output_capacity: usize,
    ) -> Self {
        Self {
            id,
            requester_id,
            spec,
            workspace,
            working_dir,
            timeout,
            state: ExecutionState::Queued,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            exit_code: None,
            failure_detail: None,
            cancel_requested: false,
            output: OutputBuffer::new(output_capacity),
        }
    }

    pub fn state(&self) -> ExecutionState {
        self.state
    }

    pub fn exit_code(&self) -> Option<i32> {
        self.exit_code
    }

    pub fn cancel_requested(&self) -> bool {
        self.cancel_requested
    }

    pub fn output(&self) -> &OutputBuffer {
        &self.output
    }

    /// `QUEUED -> RUNNING`, stamping `started_at`.
    pub fn mark_running(&mut self) -> Result<()> {
        self.guard(ExecutionState::Queued, ExecutionState::Running)?;
        self.state = ExecutionState::Running;
        self.started_at = Some(Utc::now());
        Ok(())
    }

    /// Natural child exit: zero becomes `COMPLETED`, anything else `FAILED`.
    /// `exit_code` is `None` when the OS reported no code (killed by an
    /// unrelated signal); the sentinel is recorded instead.
    pub fn finish_with_exit(&mut self, exit_code: Option<i32>) -> Result<()> {
        let code = exit_code.unwrap_or(EXIT_CODE_UNKNOWN);
        let target = if code == 0 {
            ExecutionState::Completed
        } else {
            ExecutionState::Failed
        };
        self.guard(ExecutionState::Running, target)?;
        self.state = target;
        self.exit_code = Some(code);
        self.finished_at = Some(Utc::now());
        Ok(())
    }

    /// Failure before or during the run that produced no exit status, e.g.
    /// the spawn itself failing. Legal from `QUEUED` as well as `RUNNING`.
    pub fn fail(&mut self, detail: String) -> Result<()> {
        if self.state != ExecutionState::Queued {
            self.guard(ExecutionState::Running, ExecutionState::Failed)?;
        }
        self.state = ExecutionState::Failed;
        self.exit_code = Some(EXIT_CODE_UNKNOWN);
        self.failure_detail = Some(detail);
        self.finished_at = Some(Utc::now());
        Ok(())
    }

    /// Terminal outcome of the cancel path. Never carries an exit code.
    pub fn mark_canceled(&mut self) -> Result<()> {
        self.guard(ExecutionState::Running, ExecutionState::Canceled)?;
        self.state = ExecutionState::Canceled;
        self.finished_at = Some(Utc::now());
        Ok(())
    }

    /// Terminal outcome of the deadline path. Never carries an exit code.
    pub fn mark_timed_out(&mut self) -> Result<()> {
        self.guard(ExecutionState::Running, ExecutionState::TimedOut)?;
        self.state = ExecutionState::TimedOut;
        self.finished_at = Some(Utc::now());
        Ok(())
    }

    /// Raise the cancel flag. Returns `false` if it was already raised; the
    /// flag never goes back down.
    pub fn request_cancel(&mut self) -> bool {
        if self.cancel_requested {
            return false;
        }
        self.cancel_requested = true;
        true
    }

    /// Append captured output. Refused once terminal: the buffer is frozen
    /// the moment a terminal state is recorded.
    pub fn append_output(&mut self, tag: StreamTag, data: String) -> bool {
        if self.state.is_terminal() {
            return false;
        }
        self.output.push(tag, data);
        true
    }

    fn guard(&self, from: ExecutionState, to: ExecutionState) -> Result<()> {
        if self.state != from {
            return Err(RunletError::IllegalTransition {
                id: self.id.to_string(),
                from: self.state.as_str(),
                to: to.as_str(),
            });
        }
        Ok(())
    }
}
