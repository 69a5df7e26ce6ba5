//! Concurrency-safe store of in-flight and recently finished executions.
//!
//! The registry is the single authority for execution records: supervisors,
//! the gateway, and the retention sweeper all reach state through it. Each
//! record lives in its own [`ExecutionCell`] so unrelated executions never
//! contend; the outer map lock is only held for lookup, insert, and evict.
//!
//! Lock order is always map before cell, and no lock is held across an
//! await.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tracing::{debug, info};

use crate::auth::Identity;
use crate::error::{Result, RunletError};
use crate::registry::execution::{Execution, ExecutionId, ExecutionState};

/// One execution record plus its cancel signal, individually locked.
pub struct ExecutionCell {
    exec: Mutex<Execution>,
    cancel_tx: watch::Sender<bool>,
}

impl ExecutionCell {
    fn new(exec: Execution) -> Self {
        let (cancel_tx, _) = watch::channel(false);
        Self {
            exec: Mutex::new(exec),
            cancel_tx,
        }
    }

    /// Run a closure against the record under its lock.
    pub fn with<R>(&self, f: impl FnOnce(&Execution) -> R) -> Result<R> {
        let exec = self
            .exec
            .lock()
            .map_err(|_| RunletError::Other(anyhow::anyhow!("execution record lock poisoned")))?;
        Ok(f(&exec))
    }

    /// Run a mutating closure against the record under its lock. All state
    /// transitions go through here; the record's own guards keep them legal.
    pub fn with_mut<R>(&self, f: impl FnOnce(&mut Execution) -> R) -> Result<R> {
        let mut exec = self
            .exec
            .lock()
            .map_err(|_| RunletError::Other(anyhow::anyhow!("execution record lock poisoned")))?;
        Ok(f(&mut exec))
    }

    /// Receiver the supervisor selects on; flips to `true` exactly once.
    pub fn subscribe_cancel(&self) -> watch::Receiver<bool> {
        self.cancel_tx.subscribe()
    }

    /// Point-in-time copy for status reporting.
    pub fn snapshot(&self) -> Result<ExecutionSnapshot> {
        self.with(ExecutionSnapshot::of)
    }
}

/// Immutable view of one execution, safe to hand out without holding locks.
#[derive(Debug, Clone)]
pub struct ExecutionSnapshot {
    pub id: ExecutionId,
    pub requester_id: String,
    pub command_line: String,
    pub state: ExecutionState,
    pub exit_code: Option<i32>,
    pub failure_detail: Option<String>,
    pub output: String,
    pub output_dropped_bytes: u64,
    pub cancel_requested: bool,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl ExecutionSnapshot {
    fn of(exec: &Execution) -> Self {
        Self {
            id: exec.id,
            requester_id: exec.requester_id.clone(),
            command_line: exec.spec.line.clone(),
            state: exec.state(),
            exit_code: exec.exit_code(),
            failure_detail: exec.failure_detail.clone(),
            output: exec.output().combined(),
            output_dropped_bytes: exec.output().dropped_bytes(),
            cancel_requested: exec.cancel_requested(),
            created_at: exec.created_at,
            started_at: exec.started_at,
            finished_at: exec.finished_at,
        }
    }
}

/// Result of a cancel request, distinguishing the first request from
/// repeats and from requests that arrived after the execution finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    Accepted,
    AlreadyRequested,
    AlreadyTerminal,
}

impl CancelOutcome {
    pub fn accepted(&self) -> bool {
        matches!(self, Self::Accepted)
    }

    pub fn reason(&self) -> Option<&'static str> {
        match self {
            Self::Accepted => None,
            Self::AlreadyRequested => Some("already_requested"),
            Self::AlreadyTerminal => Some("already_terminal"),
        }
    }
}

/// Live counts for the health surface.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegistryCounts {
    pub queued: usize,
    pub running: usize,
    pub terminal: usize,
}

pub struct ExecutionRegistry {
    cells: RwLock<HashMap<ExecutionId, Arc<ExecutionCell>>>,
    retention: Duration,
}

impl ExecutionRegistry {
    pub fn new(retention: Duration) -> Self {
        Self {
            cells: RwLock::new(HashMap::new()),
            retention,
        }
    }

    /// Insert a freshly built record (state `QUEUED`) and return its cell.
    pub fn create(&self, exec: Execution) -> Result<Arc<ExecutionCell>> {
        let id = exec.id;
        let cell = Arc::new(ExecutionCell::new(exec));
        let mut cells = self.write_map()?;
        cells.insert(id, cell.clone());
        debug!(execution_id = %id, "execution registered");
        Ok(cell)
    }

    /// Look up a cell without authorization; for internal callers.
    pub fn get(&self, id: &ExecutionId) -> Result<Arc<ExecutionCell>> {
        let cells = self.read_map()?;
        cells
            .get(id)
            .cloned()
            .ok_or_else(|| RunletError::NotFound { id: id.to_string() })
    }

    /// Look up a cell for a caller: the owner or an admin, nobody else.
    pub fn get_authorized(&self, id: &ExecutionId, caller: &Identity) -> Result<Arc<ExecutionCell>> {
        let cell = self.get(id)?;
        let owner = cell.with(|exec| exec.requester_id.clone())?;
        if owner != caller.requester_id && !caller.is_admin() {
            return Err(RunletError::Unauthorized {
                action: "access execution".to_string(),
            });
        }
        Ok(cell)
    }

    /// Raise the cancel flag for an execution, if the caller may.
    ///
    /// The decision is serialized under the record's lock, so concurrent
    /// duplicate requests resolve to exactly one `Accepted`.
    pub fn request_cancel(&self, id: &ExecutionId, caller: &Identity) -> Result<CancelOutcome> {
        let cell = self.get_authorized(id, caller)?;
        let outcome = cell.with_mut(|exec| {
            if exec.state().is_terminal() {
                CancelOutcome::AlreadyTerminal
            } else if exec.request_cancel() {
                CancelOutcome::Accepted
            } else {
                CancelOutcome::AlreadyRequested
            }
        })?;
        if outcome == CancelOutcome::Accepted {
            // Wake the supervisor; if it is already gone the flag alone
            // stands as the record of the request.
            let _ = cell.cancel_tx.send(true);
            info!(execution_id = %id, requester = %caller.requester_id, "cancel requested");
        }
        Ok(outcome)
    }

    /// Ids of executions still in the registry, terminal or not.
    pub fn live_ids(&self) -> Result<Vec<ExecutionId>> {
        let cells = self.read_map()?;
        Ok(cells.keys().copied().collect())
    }

    pub fn counts(&self) -> Result<RegistryCounts> {
        let cells = self.read_map()?;
        let mut counts = RegistryCounts::default();
        for cell in cells.values() {
            match cell.with(|exec| exec.state())? {
                ExecutionState::Queued => counts.queued += 1,
                ExecutionState::Running => counts.running += 1,
                _ => counts.terminal += 1,
            }
        }
        Ok(counts)
    }

    /// Drop terminal records whose retention window has passed. Holding the
    /// map write lock here means eviction never interleaves with a lookup.
    pub fn evict_expired(&self) -> Result<usize> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(self.retention)
                .unwrap_or_else(|_| chrono::Duration::seconds(900));
        let mut cells = self.write_map()?;
        let before = cells.len();
        cells.retain(|_, cell| {
            cell.with(|exec| match exec.finished_at {
                Some(finished) if exec.state().is_terminal() => finished > cutoff,
                _ => true,
            })
            .unwrap_or(true)
        });
        let evicted = before - cells.len();
        if evicted > 0 {
            debug!(evicted, "expired executions evicted");
        }
        Ok(evicted)
    }

    fn read_map(
        &self,
    ) -> Result<std::sync::RwLockReadGuard<'_, HashMap<ExecutionId, Arc<ExecutionCell>>>> {
        self.cells
            .read()
            .map_err(|_| RunletError::Other(anyhow::anyhow!("registry map lock poisoned")))
    }

    fn write_map(
        &self,
    ) -> Result<std::sync::RwLockWriteGuard<'_, HashMap<ExecutionId, Arc<ExecutionCell>>>> {
        self.cells
            .write()
            .map_err(|_| RunletError::Other(anyhow::anyhow!("registry map lock poisoned")))
    }
}

/// Periodically evict expired records until the registry is dropped.
pub fn spawn_retention_sweeper(registry: Arc<ExecutionRegistry>, interval: Duration) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval.max(Duration::from_secs(1)));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if let Err(e) = registry.evict_expired() {
                tracing::warn!(error = %e, "retention sweep failed");
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::Permission;
    use crate::policy::CommandSpec;
    use std::path::PathBuf;

    fn sample_exec(requester: &str) -> Execution {
        Execution::new(
            ExecutionId::new(),
            requester.to_string(),
            CommandSpec {
                program: "echo".to_string(),
                args: vec![],
                line: "echo".to_string(),
            },
            PathBuf::from("/tmp/ws/a"),
            PathBuf::from("/tmp/ws/a"),
            Duration::from_secs(5),
            1024,
        )
    }

    fn owner() -> Identity {
        Identity::new("alice", &[Permission::Execute])
    }

    fn stranger() -> Identity {
        Identity::new("mallory", &[Permission::Execute])
    }

    fn admin() -> Identity {
        Identity::new("root", &[Permission::Execute, Permission::Admin])
    }

    #[test]
    fn create_then_get_round_trips() {
        let registry = ExecutionRegistry::new(Duration::from_secs(900));
        let exec = sample_exec("alice");
        let id = exec.id;
        registry.create(exec).unwrap();

        let cell = registry.get(&id).unwrap();
        let snapshot = cell.snapshot().unwrap();
        assert_eq!(snapshot.id, id);
        assert_eq!(snapshot.state, ExecutionState::Queued);
    }

    #[test]
    fn unknown_id_is_not_found() {
        let registry = ExecutionRegistry::new(Duration::from_secs(900));
        let Err(err) = registry.get(&ExecutionId::new()) else {
            panic!("an unknown id must not resolve to a record");
        };
        assert!(matches!(err, RunletError::NotFound { .. }));
        assert_eq!(err.code(), "not_found");
    }

    #[test]
    fn access_is_owner_or_admin_only() {
        let registry = ExecutionRegistry::new(Duration::from_secs(900));
        let exec = sample_exec("alice");
        let id = exec.id;
        registry.create(exec).unwrap();

        assert!(registry.get_authorized(&id, &owner()).is_ok());
        assert!(registry.get_authorized(&id, &admin()).is_ok());
        let Err(err) = registry.get_authorized(&id, &stranger()) else {
            panic!("a stranger must not read another requester's execution");
        };
        assert!(matches!(err, RunletError::Unauthorized { .. }));
    }

    #[test]
    fn cancel_accepted_once_then_already_requested() {
        let registry = ExecutionRegistry::new(Duration::from_secs(900));
        let exec = sample_exec("alice");
        let id = exec.id;
        let cell = registry.create(exec).unwrap();
        cell.with_mut(|e| e.mark_running().unwrap()).unwrap();

        let mut cancel_rx = cell.subscribe_cancel();
        assert!(!*cancel_rx.borrow());

        let first = registry.request_cancel(&id, &owner()).unwrap();
        assert_eq!(first, CancelOutcome::Accepted);
        assert!(*cancel_rx.borrow_and_update());

        let second = registry.request_cancel(&id, &owner()).unwrap();
        assert_eq!(second, CancelOutcome::AlreadyRequested);
        assert_eq!(second.reason(), Some("already_requested"));
    }

    #[test]
    fn cancel_after_terminal_reports_already_terminal() {
        let registry = ExecutionRegistry::new(Duration::from_secs(900));
        let exec = sample_exec("alice");
        let id = exec.id;
        let cell = registry.create(exec).unwrap();
        cell.with_mut(|e| {
            e.mark_running().unwrap();
            e.finish_with_exit(Some(0)).unwrap();
        })
        .unwrap();

        let outcome = registry.request_cancel(&id, &owner()).unwrap();
        assert_eq!(outcome, CancelOutcome::AlreadyTerminal);
        assert!(!outcome.accepted());
    }

    #[test]
    fn cancel_by_stranger_is_unauthorized_and_leaves_flag_down() {
        let registry = ExecutionRegistry::new(Duration::from_secs(900));
        let exec = sample_exec("alice");
        let id = exec.id;
        let cell = registry.create(exec).unwrap();

        assert!(registry.request_cancel(&id, &stranger()).is_err());
        assert!(!cell.with(|e| e.cancel_requested()).unwrap());

        // Admin override is allowed.
        cell.with_mut(|e| e.mark_running().unwrap()).unwrap();
        let outcome = registry.request_cancel(&id, &admin()).unwrap();
        assert_eq!(outcome, CancelOutcome::Accepted);
    }

    #[test]
    fn eviction_drops_only_expired_terminal_records() {
        let registry = ExecutionRegistry::new(Duration::from_secs(60));

        let old_done = sample_exec("alice");
        let old_done_id = old_done.id;
        let cell = registry.create(old_done).unwrap();
        cell.with_mut(|e| {
            e.mark_running().unwrap();
            e.finish_with_exit(Some(0)).unwrap();
            e.finished_at = Some(Utc::now() - chrono::Duration::seconds(120));
        })
        .unwrap();

        let fresh_done = sample_exec("alice");
        let fresh_done_id = fresh_done.id;
        let cell = registry.create(fresh_done).unwrap();
        cell.with_mut(|e| {
            e.mark_running().unwrap();
            e.finish_with_exit(Some(0)).unwrap();
        })
        .unwrap();

        let still_running = sample_exec("alice");
        let still_running_id = still_running.id;
        let cell = registry.create(still_running).unwrap();
        cell.with_mut(|e| e.mark_running().unwrap()).unwrap();

        let evicted = registry.evict_expired().unwrap();
        assert_eq!(evicted, 1);
        assert!(registry.get(&old_done_id).is_err());
        assert!(registry.get(&fresh_done_id).is_ok());
        assert!(registry.get(&still_running_id).is_ok());
    }

    #[test]
    fn snapshot_survives_eviction() {
        let registry = ExecutionRegistry::new(Duration::from_secs(60));
        let exec = sample_exec("alice");
        let id = exec.id;
        let cell = registry.create(exec).unwrap();
        cell.with_mut(|e| {
            e.mark_running().unwrap();
            e.finish_with_exit(Some(0)).unwrap();
            e.finished_at = Some(Utc::now() - chrono::Duration::seconds(120));
        })
        .unwrap();

        let held = registry.get(&id).unwrap();
        registry.evict_expired().unwrap();
        assert!(registry.get(&id).is_err());
        // A handle obtained before eviction still reads consistently.
        assert_eq!(held.snapshot().unwrap().state, ExecutionState::Completed);
    }

    #[test]
    fn counts_reflect_states() {
        let registry = ExecutionRegistry::new(Duration::from_secs(900));
        registry.create(sample_exec("a")).unwrap();
        let cell = registry.create(sample_exec("b")).unwrap();
        cell.with_mut(|e| e.mark_running().unwrap()).unwrap();

        let counts = registry.counts().unwrap();
        assert_eq!(
            counts,
            RegistryCounts {
                queued: 1,
                running: 1,
                terminal: 0
            }
        );
    }
}
