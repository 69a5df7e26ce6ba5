//! The request gateway: submit, status, cancel.
//!
//! Every operation authenticates through the token verifier before touching
//! any other component. Submissions are validated against policy before a
//! record or workspace exists, so rejected commands leave no trace. The
//! gateway blocks only to validate and register; the spawned supervisor does
//! the rest.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::auth::{create_verifier, Identity, Permission, TokenVerifier, Verdict};
use crate::broadcast::{Broadcaster, EventSink};
use crate::config::loader::get_data_dir;
use crate::config::types::RunletConfig;
use crate::error::{Result, RunletError};
use crate::policy::PolicyValidator;
use crate::registry::{
    spawn_retention_sweeper, Execution, ExecutionId, ExecutionRegistry, ExecutionState,
};
use crate::runner::ProcessRunner;
use crate::workspace::WorkspaceManager;

/// A submission as it arrives on the wire.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SubmitRequest {
    pub command: String,
    /// Extra arguments appended to `command` after quoting.
    pub args: Vec<String>,
    /// Where the command should run; defaults to the fresh workspace.
    pub working_dir: Option<PathBuf>,
    /// Per-execution limit; clamped to the configured maximum.
    pub timeout_seconds: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitResponse {
    pub execution_id: ExecutionId,
    pub state: ExecutionState,
}

/// Point-in-time answer to a status query.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusReport {
    pub execution_id: ExecutionId,
    pub command: String,
    pub state: ExecutionState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    pub output_so_far: String,
    /// Bytes evicted from the head of the capped output buffer.
    pub output_dropped_bytes: u64,
    pub cancel_requested: bool,
    pub created_at: chrono::DateTime<chrono::Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<chrono::DateTime<chrono::Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<chrono::DateTime<chrono::Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelResponse {
    pub accepted: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Thin health surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    pub status: String,
    pub queued: usize,
    pub running: usize,
    pub retained_terminal: usize,
    pub shed_events: u64,
    pub uptime_secs: u64,
    pub verifier: String,
}

/// The engine facade: owns the validator, workspaces, registry, runner and
/// broadcaster, and exposes the three caller-facing operations.
pub struct Engine {
    verifier: Arc<dyn TokenVerifier>,
    policy: PolicyValidator,
    workspaces: Arc<WorkspaceManager>,
    registry: Arc<ExecutionRegistry>,
    runner: ProcessRunner,
    broadcaster: Broadcaster,
    max_timeout: Duration,
    output_capacity: usize,
    started: std::time::Instant,
}

impl Engine {
    /// Wire up an engine from configuration. Must be called from within the
    /// runtime: the broadcaster and retention sweeper spawn tasks.
    pub fn new(config: &RunletConfig, sink: Arc<dyn EventSink>) -> Result<Self> {
        let verifier = create_verifier(&config.auth)?;

        let workspace_root = match &config.workspace.root {
            Some(root) => root.clone(),
            None => get_data_dir().join("workspaces"),
        };
        let workspaces = Arc::new(WorkspaceManager::new(workspace_root)?);
        // Only the exclusive holder of the root may sweep: under a shared
        // root, any directory here may belong to another live engine.
        if workspaces.owns_root() {
            let swept = workspaces.sweep_orphans(|_| false);
            if swept > 0 {
                info!(swept, "removed orphaned workspaces from a previous run");
            }
        } else {
            info!("workspace root not exclusively held; skipping orphan sweep");
        }

        let policy = PolicyValidator::new(&config.policy, workspaces.root())?;

        let registry = Arc::new(ExecutionRegistry::new(Duration::from_secs(
            config.retention.window_seconds,
        )));
        spawn_retention_sweeper(
            registry.clone(),
            Duration::from_secs(config.retention.sweep_interval_seconds),
        );

        let broadcaster = Broadcaster::start(&config.broadcast, sink);
        let runner = ProcessRunner::new(
            config.runner.clone(),
            broadcaster.clone(),
            workspaces.clone(),
        );

        Ok(Self {
            verifier,
            policy,
            workspaces,
            registry,
            runner,
            broadcaster,
            max_timeout: Duration::from_secs(config.runner.timeout_seconds.max(1)),
            output_capacity: config.runner.output_buffer_bytes.max(1),
            started: std::time::Instant::now(),
        })
    }

    /// Validate, register and start a command. Fails closed: no workspace or
    /// record exists unless the caller is authenticated, authorized and the
    /// command passes policy.
    pub async fn submit(&self, token: &str, request: SubmitRequest) -> Result<SubmitResponse> {
        let identity = self.authenticate(token).await?;
        if !identity.can(Permission::Execute) {
            return Err(RunletError::Unauthorized {
                action: "submit commands".to_string(),
            });
        }

        let line = if request.args.is_empty() {
            request.command.clone()
        } else {
            format!(
                "{} {}",
                request.command,
                shell_words::join(request.args.iter().map(String::as_str))
            )
        };
        let spec = self.policy.validate(&line, request.working_dir.as_deref())?;

        let timeout = request
            .timeout_seconds
            .map(Duration::from_secs)
            .unwrap_or(self.max_timeout)
            .min(self.max_timeout);

        let id = ExecutionId::new();
        let workspace = self.workspaces.allocate(&id)?;
        // Store the absolute form containment approved; a relative directory
        // handed to the OS would resolve against the engine's own cwd.
        let working_dir = match request.working_dir.as_deref() {
            Some(dir) => self.policy.resolve_working_dir(dir),
            None => workspace.clone(),
        };

        let exec = Execution::new(
            id,
            identity.requester_id.clone(),
            spec,
            workspace.clone(),
            working_dir,
            timeout,
            self.output_capacity,
        );
        let cell = match self.registry.create(exec) {
            Ok(cell) => cell,
            Err(e) => {
                self.workspaces.release(&workspace);
                return Err(e);
            }
        };

        info!(
            execution_id = %id,
            requester = %identity.requester_id,
            command = %line,
            timeout_secs = timeout.as_secs_f64(),
            "execution submitted"
        );
        self.runner.start(cell);

        Ok(SubmitResponse {
            execution_id: id,
            state: ExecutionState::Queued,
        })
    }

    /// Current state of one execution, for its owner or an admin.
    pub async fn status(&self, token: &str, id: &ExecutionId) -> Result<StatusReport> {
        let identity = self.authenticate(token).await?;
        let cell = self.registry.get_authorized(id, &identity)?;
        let snapshot = cell.snapshot()?;
        Ok(StatusReport {
            execution_id: snapshot.id,
            command: snapshot.command_line,
            state: snapshot.state,
            exit_code: snapshot.exit_code,
            detail: snapshot.failure_detail,
            output_so_far: snapshot.output,
            output_dropped_bytes: snapshot.output_dropped_bytes,
            cancel_requested: snapshot.cancel_requested,
            created_at: snapshot.created_at,
            started_at: snapshot.started_at,
            finished_at: snapshot.finished_at,
        })
    }

    /// Ask a running execution to stop. The response distinguishes the first
    /// accepted request from repeats and from post-terminal requests.
    pub async fn cancel(&self, token: &str, id: &ExecutionId) -> Result<CancelResponse> {
        let identity = self.authenticate(token).await?;
        let outcome = self.registry.request_cancel(id, &identity)?;
        Ok(CancelResponse {
            accepted: outcome.accepted(),
            reason: outcome.reason().map(str::to_string),
        })
    }

    pub fn health(&self) -> Result<HealthReport> {
        let counts = self.registry.counts()?;
        Ok(HealthReport {
            status: "ok".to_string(),
            queued: counts.queued,
            running: counts.running,
            retained_terminal: counts.terminal,
            shed_events: self.broadcaster.shed_events(),
            uptime_secs: self.started.elapsed().as_secs(),
            verifier: self.verifier.name().to_string(),
        })
    }

    /// The registry, for callers that watch executions directly.
    pub fn registry(&self) -> &Arc<ExecutionRegistry> {
        &self.registry
    }

    async fn authenticate(&self, token: &str) -> Result<Identity> {
        match self.verifier.verify(token).await? {
            Verdict::Valid(identity) => Ok(identity),
            Verdict::Invalid => {
                warn!(verifier = self.verifier.name(), "token rejected");
                Err(RunletError::Unauthenticated)
            }
        }
    }
}
