// src/cli.rs

//! CLI argument parsing using `clap`.

use clap::{Parser, Subcommand, ValueEnum};

use crate::workflow::Decision;

/// Command-line arguments for `stepflow`.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "stepflow",
    version,
    about = "Durable, resumable travel-planning workflow runner.",
    long_about = None
)]
pub struct CliArgs {
    /// Path to the config file (TOML).
    ///
    /// Default: `Stepflow.toml` in the current working directory; a
    /// missing default file means built-in defaults.
    #[arg(long, global = true, value_name = "PATH", default_value = "Stepflow.toml")]
    pub config: String,

    /// Logging level (error, warn, info, debug, trace).
    ///
    /// If omitted, `STEPFLOW_LOG` or a default level will be used.
    #[arg(long, global = true, value_enum, value_name = "LEVEL")]
    pub log_level: Option<LogLevel>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Clone, Subcommand)]
pub enum Command {
    /// Start a new run from a free-text request.
    Run {
        /// e.g. "5 days in Beijing, budget 8000 yuan"
        request: String,

        /// Prompt on the terminal whenever the run needs input.
        #[arg(long)]
        interactive: bool,

        /// Keep checkpoints in memory only; the run cannot be resumed later.
        #[arg(long)]
        no_persistence: bool,
    },

    /// Continue a suspended or interrupted run.
    Resume {
        /// Run to resume. Without it, resumable runs are listed for
        /// selection.
        #[arg(long, value_name = "ID")]
        run_id: Option<String>,

        /// Answer to a pending confirmation.
        #[arg(long, value_enum)]
        decision: Option<DecisionArg>,

        /// Free-text answer (e.g. a missing trip detail).
        #[arg(long, value_name = "TEXT")]
        message: Option<String>,

        /// Prompt on the terminal if the run suspends again.
        #[arg(long)]
        interactive: bool,
    },

    /// List runs that can be resumed.
    Runs,

    /// Show the checkpoint history of a run.
    History {
        #[arg(long, value_name = "ID")]
        run_id: String,
    },

    /// Validate the workflow graph and print its nodes and edges.
    Graph,
}

/// Log level as exposed on the CLI.
#[derive(Debug, Copy, Clone, ValueEnum)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, ValueEnum)]
pub enum DecisionArg {
    Accept,
    Keep,
    Terminate,
}

impl From<DecisionArg> for Decision {
    fn from(arg: DecisionArg) -> Self {
        match arg {
            DecisionArg::Accept => Decision::Accept,
            DecisionArg::Keep => Decision::Keep,
            DecisionArg::Terminate => Decision::Terminate,
        }
    }
}

/// Convenience wrapper around `CliArgs::parse()`.
pub fn parse() -> CliArgs {
    CliArgs::parse()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_run_with_flags() {
        let args = CliArgs::try_parse_from([
            "stepflow",
            "run",
            "3 days in Xian",
            "--interactive",
            "--log-level",
            "debug",
        ])
        .unwrap();
        match args.command {
            Command::Run {
                request,
                interactive,
                no_persistence,
            } => {
                assert_eq!(request, "3 days in Xian");
                assert!(interactive);
                assert!(!no_persistence);
            }
            other => panic!("unexpected command: {other:?}"),
        }
        assert!(matches!(args.log_level, Some(LogLevel::Debug)));
        assert_eq!(args.config, "Stepflow.toml");
    }

    #[test]
    fn parses_resume_decision() {
        let args = CliArgs::try_parse_from([
            "stepflow",
            "--config",
            "alt.toml",
            "resume",
            "--run-id",
            "run_1234abcd",
            "--decision",
            "keep",
        ])
        .unwrap();
        match args.command {
            Command::Resume {
                run_id, decision, ..
            } => {
                assert_eq!(run_id.as_deref(), Some("run_1234abcd"));
                assert_eq!(decision.map(Decision::from), Some(Decision::Keep));
            }
            other => panic!("unexpected command: {other:?}"),
        }
        assert_eq!(args.config, "alt.toml");
    }

    #[test]
    fn rejects_unknown_decision() {
        assert!(
            CliArgs::try_parse_from(["stepflow", "resume", "--decision", "maybe"]).is_err()
        );
    }
}
