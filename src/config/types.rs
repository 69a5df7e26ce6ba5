use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::auth::Permission;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RunletConfig {
    pub policy: PolicyConfig,
    pub workspace: WorkspaceConfig,
    pub runner: RunnerConfig,
    pub retention: RetentionConfig,
    pub broadcast: BroadcastConfig,
    pub auth: AuthConfig,
}

/// What callers are allowed to run and where.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyConfig {
    /// Commands callers may execute. Matching is an exact match on the
    /// executable's base name; anything not listed is rejected.
    pub allowed_commands: Vec<CommandRule>,
    /// Root directory that working directories and path arguments must stay
    /// inside. Defaults to the workspace root when unset.
    pub permitted_root: Option<PathBuf>,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            allowed_commands: [
                "echo", "ls", "cat", "pwd", "head", "tail", "wc", "date", "sleep",
            ]
            .iter()
            .map(|name| CommandRule::Name((*name).to_string()))
            .collect(),
            permitted_root: None,
        }
    }
}

/// A single allowlist entry: either a bare executable name or a name plus
/// flags that are denied for it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CommandRule {
    Name(String),
    Detailed {
        name: String,
        #[serde(default)]
        deny_flags: Vec<String>,
    },
}

impl CommandRule {
    pub fn name(&self) -> &str {
        match self {
            Self::Name(name) => name,
            Self::Detailed { name, .. } => name,
        }
    }

    pub fn deny_flags(&self) -> &[String] {
        match self {
            Self::Name(_) => &[],
            Self::Detailed { deny_flags, .. } => deny_flags,
        }
    }
}

/// Where per-execution workspaces live.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkspaceConfig {
    /// Parent directory for per-execution workspaces. Defaults to
    /// `<data dir>/workspaces`.
    pub root: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerConfig {
    /// Maximum execution duration in seconds; the process group is killed
    /// once it elapses.
    pub timeout_seconds: u64,
    /// How long a cancelled process gets between the interrupt signal and
    /// the forced kill.
    pub grace_period_ms: u64,
    /// Cap on the retained output per execution; oldest chunks are evicted
    /// beyond this.
    pub output_buffer_bytes: usize,
    /// Read size for each stdout/stderr pump iteration.
    pub read_chunk_bytes: usize,
    /// Capacity of the pump-to-supervisor channel. When full, the child
    /// blocks on its pipes until drained (bounded by the timeout).
    pub channel_capacity: usize,
    /// PATH handed to the child. The rest of the environment is never
    /// inherited.
    pub env_path: String,
    /// Extra environment variables [(KEY, VALUE), ...] added to the minimal
    /// child environment.
    pub env_vars: Vec<(String, String)>,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            timeout_seconds: 300,
            grace_period_ms: 2000,
            output_buffer_bytes: 1024 * 1024,
            read_chunk_bytes: 8192,
            channel_capacity: 64,
            env_path: "/usr/local/bin:/usr/bin:/bin".to_string(),
            env_vars: Vec::new(),
        }
    }
}

/// How long finished executions stay queryable.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionConfig {
    /// Seconds a terminal execution remains in the registry before eviction.
    pub window_seconds: u64,
    /// Interval between eviction sweeps.
    pub sweep_interval_seconds: u64,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            window_seconds: 900,
            sweep_interval_seconds: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BroadcastConfig {
    /// Capacity of the hand-off queue between the runner and the event sink.
    /// Progress events are shed (visible as seq gaps) when it is full.
    pub queue_capacity: usize,
    /// Delivery attempts per event before it is dropped with a warning.
    pub delivery_attempts: u32,
    /// Upper bound on a single delivery attempt, so one wedged sink cannot
    /// stall the forwarding task.
    pub delivery_timeout_ms: u64,
}

impl Default for BroadcastConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 256,
            delivery_attempts: 3,
            delivery_timeout_ms: 1_000,
        }
    }
}

/// How tokens are verified.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    pub mode: AuthMode,
    /// Verification endpoint for `remote` mode.
    pub verify_url: Option<String>,
    /// Token table for `static` mode.
    pub tokens: Vec<StaticToken>,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            mode: AuthMode::Static,
            verify_url: None,
            tokens: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthMode {
    /// Tokens resolved from the local config table.
    #[default]
    Static,
    /// Tokens verified against an external auth service.
    Remote,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StaticToken {
    pub token: String,
    pub requester_id: String,
    #[serde(default)]
    pub permissions: Vec<Permission>,
}
