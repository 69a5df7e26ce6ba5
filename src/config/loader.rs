use std::path::{Path, PathBuf};

use crate::config::types::RunletConfig;
use crate::error::{Result, RunletError};

/// Get the default configuration file path
pub fn get_config_path() -> PathBuf {
    if let Some(proj_dirs) = directories::ProjectDirs::from("com", "runlet", "runlet") {
        proj_dirs.config_dir().join("config.toml")
    } else {
        // Fallback to home directory
        dirs_fallback().join(".runlet").join("config.toml")
    }
}

fn dirs_fallback() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("."))
}

/// Load configuration from file, with defaults for missing values.
///
/// A missing file at the default location is fine (first run). A missing
/// file at an explicitly requested path is an error, since silently falling
/// back to defaults would mask a typo.
pub fn load_config(config_path: Option<&Path>) -> Result<RunletConfig> {
    let path = config_path
        .map(PathBuf::from)
        .unwrap_or_else(get_config_path);

    if !path.exists() {
        if config_path.is_some() {
            return Err(RunletError::ConfigNotFound {
                path: path.display().to_string(),
            });
        }
        return Ok(RunletConfig::default());
    }

    let content = std::fs::read_to_string(&path)?;
    let config: RunletConfig =
        toml::from_str(&content).map_err(|e| RunletError::TomlParse(e.to_string()))?;

    Ok(config)
}

/// Get the data directory for workspace storage
pub fn get_data_dir() -> PathBuf {
    if let Some(proj_dirs) = directories::ProjectDirs::from("com", "runlet", "runlet") {
        proj_dirs.data_dir().to_path_buf()
    } else {
        dirs_fallback().join(".local").join("share").join("runlet")
    }
}

/// Commented starter configuration written by `runlet init`.
pub fn default_config_toml() -> String {
    r#"# runlet configuration

[policy]
# Executables callers may run, matched exactly on base name.
# Entries may also carry denied flags:
#   [[policy.allowed_commands]]
#   name = "git"
#   deny_flags = ["--force"]
allowed_commands = ["echo", "ls", "cat", "pwd", "head", "tail", "wc", "date", "sleep"]
# Working directories and path arguments must resolve inside this root.
# Defaults to the workspace root when unset.
# permitted_root = "/srv/runlet"

[workspace]
# Parent directory for per-execution workspaces.
# root = "/srv/runlet/workspaces"

[runner]
timeout_seconds = 300
grace_period_ms = 2000
output_buffer_bytes = 1048576

[retention]
# How long finished executions stay queryable, and how often eviction runs.
window_seconds = 900
sweep_interval_seconds = 60

[broadcast]
queue_capacity = 256
delivery_attempts = 3

[auth]
# "static" resolves tokens from the table below; "remote" asks verify_url.
mode = "static"
# verify_url = "https://auth.internal/verify"

[[auth.tokens]]
token = "local-dev"
requester_id = "local"
permissions = ["execute", "admin"]
"#
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::types::{AuthMode, CommandRule};

    #[test]
    fn default_template_parses_back() {
        let config: RunletConfig = toml::from_str(&default_config_toml()).unwrap();
        assert_eq!(config.auth.mode, AuthMode::Static);
        assert_eq!(config.auth.tokens.len(), 1);
        assert!(config
            .policy
            .allowed_commands
            .iter()
            .any(|rule| rule.name() == "echo"));
    }

    #[test]
    fn explicit_missing_path_is_an_error() {
        let err = load_config(Some(std::path::Path::new("/nonexistent/runlet.toml"))).unwrap_err();
        assert!(matches!(err, RunletError::ConfigNotFound { .. }));
    }

    #[test]
    fn empty_document_yields_defaults() {
        let config: RunletConfig = toml::from_str("").unwrap();
        assert_eq!(config.runner.timeout_seconds, 300);
        assert_eq!(config.retention.window_seconds, 900);
        assert!(config.auth.tokens.is_empty());
    }

    #[test]
    fn detailed_command_rule_parses() {
        let config: RunletConfig = toml::from_str(
            r#"
[[policy.allowed_commands]]
name = "git"
deny_flags = ["--force"]
"#,
        )
        .unwrap();
        match &config.policy.allowed_commands[0] {
            CommandRule::Detailed { name, deny_flags } => {
                assert_eq!(name, "git");
                assert_eq!(deny_flags, &["--force".to_string()]);
            }
            CommandRule::Name(_) => panic!("expected detailed rule"),
        }
    }
}
