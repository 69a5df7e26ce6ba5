//! Command policy validation.
//!
//! The validator decides, for every submitted command line, whether the
//! engine may run it. The decision is total: every input yields an explicit
//! allow or a typed rejection, never a silent default.
//!
//! Matching rules:
//! - The program must be a bare executable name (no `/`); resolution happens
//!   through the engine's scrubbed PATH, never the caller's.
//! - Allowlisting is an exact match on that name. No prefixes, no patterns.
//! - An allowlist entry may carry `deny_flags`; a matching argument (exact or
//!   `flag=value`) rejects the command.
//! - The working directory and every path-like argument must resolve inside
//!   the permitted root after `.`/`..` normalization and, for paths that
//!   exist, symlink resolution.
//!
//! Commands are parsed into argv with `shell_words` and executed argv-style;
//! no shell is ever involved, so metacharacters in arguments are inert data.

use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::config::types::PolicyConfig;
use crate::error::{Result, RunletError};

/// A command line that passed validation, ready to spawn argv-style.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandSpec {
    /// Bare executable name, resolved via the engine's PATH.
    pub program: String,
    /// Arguments exactly as parsed; never re-interpreted by a shell.
    pub args: Vec<String>,
    /// The original command line, kept for display and audit.
    pub line: String,
}

impl CommandSpec {
    pub fn display_line(&self) -> &str {
        &self.line
    }
}

/// Immutable policy snapshot.
///
/// Built once from configuration; safe to share across concurrent
/// submissions because it holds no mutable state. Reloading policy means
/// building a new validator, never mutating this one in place.
pub struct PolicyValidator {
    /// Executable base name -> denied flags for it.
    rules: HashMap<String, Vec<String>>,
    /// Containment root after symlink resolution (lexical if it does not
    /// exist yet).
    permitted_root: PathBuf,
}

impl PolicyValidator {
    /// Build a validator from configuration. `fallback_root` (the workspace
    /// root) is used when the policy does not name its own permitted root.
    pub fn new(config: &PolicyConfig, fallback_root: &Path) -> Result<Self> {
        let mut rules = HashMap::new();
        for rule in &config.allowed_commands {
            let name = rule.name().trim();
            if name.is_empty() || name.contains('/') {
                return Err(RunletError::Config(format!(
                    "allowlist entry '{}' must be a bare executable name",
                    rule.name()
                )));
            }
            rules.insert(name.to_string(), rule.deny_flags().to_vec());
        }

        let root = config
            .permitted_root
            .clone()
            .unwrap_or_else(|| fallback_root.to_path_buf());
        let permitted_root = resolve_existing(&normalize_lexically(&root, Path::new("/")));

        Ok(Self {
            rules,
            permitted_root,
        })
    }

    /// Validate a raw command line against the allowlist and path policy.
    ///
    /// `working_dir` is where the command would run; relative path arguments
    /// are resolved against it. `None` means the execution's own workspace,
    /// which is inside the permitted root by construction.
    pub fn validate(&self, command_line: &str, working_dir: Option<&Path>) -> Result<CommandSpec> {
        let line = command_line.trim();
        if line.is_empty() {
            return Err(rejected("empty command"));
        }

        let argv = shell_words::split(line)
            .map_err(|_| rejected("malformed command (unbalanced quotes)"))?;
        let Some((program, args)) = argv.split_first() else {
            return Err(rejected("empty command"));
        };

        if program.contains('/') {
            return Err(rejected(
                "program must be a bare executable name, not a path",
            ));
        }
        if !program.chars().any(|c| c.is_ascii_alphanumeric()) {
            return Err(rejected(&format!("'{}' is not an executable name", program)));
        }

        let Some(deny_flags) = self.rules.get(program.as_str()) else {
            return Err(rejected(&format!(
                "executable '{}' is not allowlisted",
                program
            )));
        };

        for arg in args {
            for flag in deny_flags {
                if arg == flag || arg.starts_with(&format!("{}=", flag)) {
                    return Err(rejected(&format!(
                        "flag '{}' is denied for '{}'",
                        flag, program
                    )));
                }
            }
        }

        let resolve_base = match working_dir {
            Some(dir) => {
                if !self.contains(dir, &self.permitted_root) {
                    return Err(rejected(&format!(
                        "working directory '{}' escapes the permitted root",
                        dir.display()
                    )));
                }
                normalize_lexically(dir, &self.permitted_root)
            }
            None => self.permitted_root.clone(),
        };

        for arg in args {
            for candidate in path_candidates(arg) {
                if !self.contains(Path::new(candidate), &resolve_base) {
                    return Err(rejected(&format!(
                        "path argument '{}' escapes the permitted root",
                        candidate
                    )));
                }
            }
        }

        Ok(CommandSpec {
            program: program.clone(),
            args: args.to_vec(),
            line: line.to_string(),
        })
    }

    /// The root all paths must stay inside.
    pub fn permitted_root(&self) -> &Path {
        &self.permitted_root
    }

    /// The absolute directory a validated `working_dir` denotes: relative
    /// directories anchor at the permitted root, exactly as containment
    /// treated them. Spawning must use this form; a relative path handed to
    /// the OS would resolve against the engine process's own cwd instead.
    pub fn resolve_working_dir(&self, dir: &Path) -> PathBuf {
        normalize_lexically(dir, &self.permitted_root)
    }

    /// Whether `path` (resolved against `base` if relative) stays inside the
    /// permitted root. `.` and `..` are folded away first, then symlinks in
    /// whatever prefix of the path exists are resolved, so neither traversal
    /// nor a link pointing outside the root can slip through. The root held
    /// here is already in resolved form.
    fn contains(&self, path: &Path, base: &Path) -> bool {
        let normalized = normalize_lexically(path, base);
        resolve_existing(&normalized).starts_with(&self.permitted_root)
    }
}

fn rejected(reason: &str) -> RunletError {
    RunletError::PolicyRejected {
        reason: reason.to_string(),
    }
}

/// Path-like fragments of an argument that must pass containment: the
/// argument itself and, independently, the value of a `flag=value` pair.
/// A `--flag=/abs` argument normalizes to a harmless relative path as a
/// whole; the escape is only visible in the value, so both are checked.
fn path_candidates(arg: &str) -> Vec<&str> {
    let mut candidates = Vec::new();
    if looks_like_path(arg) {
        candidates.push(arg);
    }
    if let Some((_, value)) = arg.split_once('=') {
        if looks_like_path(value) {
            candidates.push(value);
        }
    }
    candidates
}

fn looks_like_path(s: &str) -> bool {
    s.starts_with('/')
        || s.starts_with("./")
        || s.starts_with("../")
        || s == "."
        || s == ".."
        || s.contains('/')
}

/// Resolve `.` and `..` without touching the filesystem. Relative paths are
/// anchored at `base`; `..` at the root stays at the root.
fn normalize_lexically(path: &Path, base: &Path) -> PathBuf {
    let anchored = if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    };

    let mut normalized = PathBuf::new();
    for component in anchored.components() {
        match component {
            Component::Prefix(p) => normalized.push(p.as_os_str()),
            Component::RootDir => normalized.push(Component::RootDir.as_os_str()),
            Component::CurDir => {}
            Component::ParentDir => {
                normalized.pop();
            }
            Component::Normal(part) => normalized.push(part),
        }
    }
    normalized
}

/// Canonicalize the deepest existing ancestor of `path` and re-attach the
/// non-existing tail, so symlinks are resolved even for paths that are about
/// to be created.
fn resolve_existing(path: &Path) -> PathBuf {
    if let Ok(resolved) = path.canonicalize() {
        return resolved;
    }

    let mut tail = Vec::new();
    let mut cursor = path;
    while let Some(parent) = cursor.parent() {
        if let Some(name) = cursor.file_name() {
            tail.push(name.to_os_string());
        }
        if let Ok(resolved) = parent.canonicalize() {
            let mut result = resolved;
            for part in tail.iter().rev() {
                result.push(part);
            }
            return result;
        }
        cursor = parent;
    }
    path.to_path_buf()
}
