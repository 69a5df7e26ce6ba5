use clap::{Args, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[clap(name = "runlet")]
#[clap(version, about = "Policy-guarded command execution engine")]
#[clap(propagate_version = true)]
pub struct Cli {
    #[clap(flatten)]
    pub global_opts: GlobalOpts,

    #[clap(subcommand)]
    pub command: Commands,
}

#[derive(Args, Debug)]
pub struct GlobalOpts {
    /// Configuration file path
    #[clap(short, long, global = true, env = "RUNLET_CONFIG")]
    pub config: Option<PathBuf>,

    /// Verbosity level (-v, -vv, -vvv)
    #[clap(short, long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Output format
    #[clap(long, global = true, default_value = "text", value_enum)]
    pub format: OutputFormat,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run a command through the engine and stream its output
    Run(RunArgs),

    /// Check a command against policy without running it
    Check(CheckArgs),

    /// Initialize a new runlet configuration
    Init(InitArgs),

    /// Manage configuration
    Config(ConfigArgs),
}

#[derive(Args, Debug)]
pub struct RunArgs {
    /// Command to execute (a quoted line, or a program followed by args)
    pub command: String,

    /// Additional arguments for the command
    #[clap(trailing_var_arg = true, allow_hyphen_values = true)]
    pub args: Vec<String>,

    /// Working directory for the command; defaults to a fresh workspace
    #[clap(long)]
    pub workdir: Option<PathBuf>,

    /// Time limit in seconds (clamped to the configured maximum)
    #[clap(long)]
    pub timeout: Option<u64>,

    /// Token presented to the engine
    #[clap(long, env = "RUNLET_TOKEN")]
    pub token: Option<String>,
}

#[derive(Args, Debug)]
pub struct CheckArgs {
    /// Command line to validate
    pub command: String,

    /// Working directory the command would run in
    #[clap(long)]
    pub workdir: Option<PathBuf>,
}

#[derive(Args, Debug)]
pub struct InitArgs {
    /// Overwrite an existing configuration file
    #[clap(long)]
    pub force: bool,
}

#[derive(Args, Debug)]
pub struct ConfigArgs {
    #[clap(subcommand)]
    pub action: ConfigAction,
}

#[derive(Subcommand, Debug)]
pub enum ConfigAction {
    /// Print the effective configuration
    Show,
    /// Print the configuration file path
    Path,
}

#[derive(Debug, Clone, Default, ValueEnum)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_accepts_trailing_hyphen_arguments() {
        let cli = Cli::parse_from(["runlet", "run", "ls", "-la", "sub"]);
        let Commands::Run(args) = cli.command else {
            panic!("expected run subcommand");
        };
        assert_eq!(args.command, "ls");
        assert_eq!(args.args, vec!["-la", "sub"]);
        assert!(args.timeout.is_none());
    }

    #[test]
    fn verbosity_counts_and_format_defaults_to_text() {
        let cli = Cli::parse_from(["runlet", "-vv", "check", "echo hi"]);
        assert_eq!(cli.global_opts.verbose, 2);
        assert!(matches!(cli.global_opts.format, OutputFormat::Text));
        assert!(matches!(cli.command, Commands::Check(_)));
    }

    // Engine options go before the command; everything after it belongs to
    // the command itself.
    #[test]
    fn run_options_precede_the_command() {
        let cli = Cli::parse_from([
            "runlet",
            "run",
            "--timeout",
            "5",
            "--token",
            "tok",
            "--format",
            "json",
            "sleep 30",
        ]);
        let Commands::Run(args) = cli.command else {
            panic!("expected run subcommand");
        };
        assert_eq!(args.command, "sleep 30");
        assert!(args.args.is_empty());
        assert_eq!(args.timeout, Some(5));
        assert_eq!(args.token.as_deref(), Some("tok"));
        assert!(matches!(cli.global_opts.format, OutputFormat::Json));
    }

    #[test]
    fn hyphen_options_after_the_command_belong_to_it() {
        let cli = Cli::parse_from(["runlet", "run", "sleep", "30", "--invalid"]);
        let Commands::Run(args) = cli.command else {
            panic!("expected run subcommand");
        };
        assert_eq!(args.command, "sleep");
        assert_eq!(args.args, vec!["30", "--invalid"]);
        assert!(args.timeout.is_none());
    }
}
