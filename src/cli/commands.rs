use std::io::Write;
use std::sync::Arc;

use tracing::info;

use crate::auth::Permission;
use crate::broadcast::ChannelSink;
use crate::cli::args::{CheckArgs, ConfigAction, ConfigArgs, InitArgs, OutputFormat, RunArgs};
use crate::config::loader::{default_config_toml, get_config_path, get_data_dir};
use crate::config::types::{AuthMode, RunletConfig, StaticToken};
use crate::error::{Result, RunletError};
use crate::gateway::{Engine, SubmitRequest};
use crate::policy::PolicyValidator;
use crate::registry::{ExecutionState, StreamTag};

// ============================================================================
// Run
// ============================================================================

/// Submit a command to a locally wired engine and stream its events until
/// the terminal one, then exit with a code reflecting the outcome.
pub async fn run(args: RunArgs, config: RunletConfig, format: OutputFormat) -> Result<()> {
    let (config, token) = resolve_token(config, args.token)?;

    let (sink, mut events) = ChannelSink::new(256);
    let engine = Engine::new(&config, Arc::new(sink))?;

    let response = engine
        .submit(
            &token,
            SubmitRequest {
                command: args.command,
                args: args.args,
                working_dir: args.workdir,
                timeout_seconds: args.timeout,
            },
        )
        .await?;
    let id = response.execution_id;
    info!(execution_id = %id, "execution submitted");

    // The terminal event is always the last one for the id.
    let code = loop {
        let Some(event) = events.recv().await else {
            return Err(RunletError::SinkDelivery(
                "event stream ended before the terminal event".to_string(),
            ));
        };
        if event.execution_id != id {
            continue;
        }
        match format {
            OutputFormat::Text => {
                if let (Some(stream), Some(chunk)) = (event.stream, &event.chunk) {
                    match stream {
                        StreamTag::Stdout => {
                            let mut out = std::io::stdout();
                            out.write_all(chunk.as_bytes())?;
                            out.flush()?;
                        }
                        StreamTag::Stderr => {
                            let mut err = std::io::stderr();
                            err.write_all(chunk.as_bytes())?;
                            err.flush()?;
                        }
                    }
                }
                if event.terminal && event.state != ExecutionState::Completed {
                    match &event.detail {
                        Some(detail) => eprintln!("runlet: {}: {}", event.state, detail),
                        None => eprintln!("runlet: {}", event.state),
                    }
                }
            }
            OutputFormat::Json => {
                println!("{}", serde_json::to_string(&event)?);
            }
        }
        if event.terminal {
            break exit_code_for(event.state, event.exit_code);
        }
    };

    if code != 0 {
        std::process::exit(code);
    }
    Ok(())
}

/// Map a terminal state to a shell-friendly exit code.
fn exit_code_for(state: ExecutionState, exit_code: Option<i32>) -> i32 {
    match state {
        ExecutionState::Completed => 0,
        ExecutionState::Failed => match exit_code {
            Some(code) if code > 0 => code,
            _ => 1,
        },
        ExecutionState::TimedOut => 124,
        ExecutionState::Canceled => 130,
        ExecutionState::Queued | ExecutionState::Running => 1,
    }
}

/// Pick the token to present. Without a configured token table the local
/// driver trusts its invoker and mints a one-shot identity.
fn resolve_token(
    mut config: RunletConfig,
    explicit: Option<String>,
) -> Result<(RunletConfig, String)> {
    if let Some(token) = explicit {
        return Ok((config, token));
    }
    if config.auth.mode == AuthMode::Static && config.auth.tokens.is_empty() {
        let token = uuid::Uuid::new_v4().to_string();
        config.auth.tokens.push(StaticToken {
            token: token.clone(),
            requester_id: "local".to_string(),
            permissions: vec![Permission::Execute, Permission::Admin],
        });
        return Ok((config, token));
    }
    Err(RunletError::Config(
        "no token provided; pass --token or set RUNLET_TOKEN".to_string(),
    ))
}

// ============================================================================
// Check
// ============================================================================

/// Validate a command line against policy without running anything.
pub async fn check(args: CheckArgs, config: RunletConfig, format: OutputFormat) -> Result<()> {
    let fallback_root = match &config.workspace.root {
        Some(root) => root.clone(),
        None => get_data_dir().join("workspaces"),
    };
    let validator = PolicyValidator::new(&config.policy, &fallback_root)?;

    match validator.validate(&args.command, args.workdir.as_deref()) {
        Ok(spec) => {
            match format {
                OutputFormat::Text => {
                    println!("allowed: {}", spec.line);
                }
                OutputFormat::Json => {
                    println!(
                        "{}",
                        serde_json::json!({
                            "allowed": true,
                            "program": spec.program,
                            "args": spec.args,
                        })
                    );
                }
            }
            Ok(())
        }
        Err(RunletError::PolicyRejected { reason }) => {
            match format {
                OutputFormat::Text => {
                    println!("rejected: {}", reason);
                }
                OutputFormat::Json => {
                    println!(
                        "{}",
                        serde_json::json!({
                            "allowed": false,
                            "reason": reason,
                        })
                    );
                }
            }
            std::process::exit(1);
        }
        Err(other) => Err(other),
    }
}

// ============================================================================
// Config Commands
// ============================================================================

pub async fn init(args: InitArgs) -> Result<()> {
    let config_path = get_config_path();

    if config_path.exists() && !args.force {
        println!("Configuration already exists at: {}", config_path.display());
        println!("Use --force to overwrite");
        return Ok(());
    }

    if let Some(parent) = config_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    std::fs::write(&config_path, default_config_toml())?;

    println!("Created configuration at: {}", config_path.display());
    println!("\nQuick start:");
    println!("  # Run an allowlisted command in a fresh workspace");
    println!("  runlet run \"echo hello\"");
    println!();
    println!("  # Bound a long command to five seconds");
    println!("  runlet run --timeout 5 \"sleep 30\"");
    println!();
    println!("  # See what policy would say without running");
    println!("  runlet check \"cat /etc/passwd\"");

    Ok(())
}

pub async fn config(args: ConfigArgs, config: RunletConfig) -> Result<()> {
    match args.action {
        ConfigAction::Show => {
            let toml_str = toml::to_string_pretty(&config)
                .map_err(|e| RunletError::Config(e.to_string()))?;
            println!("{}", toml_str);
        }
        ConfigAction::Path => {
            println!("{}", get_config_path().display());
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_reflect_terminal_states() {
        assert_eq!(exit_code_for(ExecutionState::Completed, Some(0)), 0);
        assert_eq!(exit_code_for(ExecutionState::Failed, Some(3)), 3);
        assert_eq!(exit_code_for(ExecutionState::Failed, Some(-1)), 1);
        assert_eq!(exit_code_for(ExecutionState::TimedOut, None), 124);
        assert_eq!(exit_code_for(ExecutionState::Canceled, None), 130);
    }

    #[test]
    fn token_resolution_prefers_explicit_then_local_fallback() {
        let config = RunletConfig::default();
        let (_, token) = resolve_token(config.clone(), Some("abc".to_string())).unwrap();
        assert_eq!(token, "abc");

        let (with_local, minted) = resolve_token(config.clone(), None).unwrap();
        assert_eq!(with_local.auth.tokens.len(), 1);
        assert_eq!(with_local.auth.tokens[0].token, minted);
        assert_eq!(with_local.auth.tokens[0].requester_id, "local");

        let mut remote = config;
        remote.auth.mode = AuthMode::Remote;
        assert!(resolve_token(remote, None).is_err());
    }
}
