//! Command-line and shell grammar
//!
//! `Cli` is the process entry point parsed with clap. `parse_command` reads
//! one line typed at the interactive shell: `ACTION TARGET [NUMBER]`.

use crate::species::Species;
use clap::{Args, Parser, Subcommand};
use std::ffi::OsString;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Parser, Debug)]
#[command(
    name = "circle-of-life",
    version,
    about = "Predator/prey ecosystem of cooperating processes over shared memory"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Args, Debug, Clone, Default, PartialEq, Eq)]
pub struct LogArgs {
    /// Log filter (trace, debug, info, warn, error or an EnvFilter directive)
    #[arg(long, value_name = "LEVEL")]
    pub log_level: Option<String>,

    /// Append logs to this file instead of stderr
    #[arg(long, value_name = "PATH")]
    pub log_file: Option<PathBuf>,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Commands {
    /// Start the environment and the interactive shell (default)
    Run {
        /// TOML file layered over the built-in defaults
        #[arg(long, value_name = "FILE")]
        config: Option<PathBuf>,

        #[command(flatten)]
        log: LogArgs,
    },

    /// Run one individual until it dies
    Agent {
        /// prey or predator
        species: Species,

        /// Slot reserved by the environment when it spawned this agent
        #[arg(long, value_name = "SLOT")]
        ticket: Option<usize>,

        #[command(flatten)]
        log: LogArgs,
    },
}

impl Cli {
    pub fn parse_command() -> Commands {
        Self::parse_command_from(std::env::args_os())
    }

    pub fn try_parse_command_from<I, T>(iter: I) -> Result<Commands, clap::Error>
    where
        I: IntoIterator<Item = T>,
        T: Into<OsString> + Clone,
    {
        let mut cli = Cli::try_parse_from(iter)?;
        Ok(cli.command.take().unwrap_or(Commands::Run {
            config: None,
            log: LogArgs::default(),
        }))
    }

    pub fn parse_command_from<I, T>(iter: I) -> Commands
    where
        I: IntoIterator<Item = T>,
        T: Into<OsString> + Clone,
    {
        match Self::try_parse_command_from(iter) {
            Ok(command) => command,
            Err(err) => err.exit(),
        }
    }
}

const QUIT_TOKENS: [&str; 3] = ["quit", "exit", "stop"];
const HELP_TOKENS: [&str; 2] = ["help", "?"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Add,
    List,
    Delete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    Species(Species),
    /// Prey first, then predators.
    All,
    Grass,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShellCommand {
    Run {
        action: Action,
        target: Target,
        /// Defaults to 1; ignored by `list`.
        count: u32,
    },
    Help,
    Quit,
    Empty,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CommandError {
    #[error("Action token expected, got {0}")]
    Action(String),
    #[error("Target token expected, got {0}")]
    Target(String),
    #[error("Target token expected, got nothing")]
    MissingTarget,
    #[error("Integer expected, got {0}")]
    Integer(String),
    #[error("3 words expected, got more")]
    TooManyWords,
}

fn parse_action(word: &str) -> Result<Action, CommandError> {
    match word {
        "add" => Ok(Action::Add),
        "list" => Ok(Action::List),
        "delete" => Ok(Action::Delete),
        other => Err(CommandError::Action(other.to_string())),
    }
}

fn parse_target(word: &str) -> Result<Target, CommandError> {
    match word {
        "prey" | "preys" => Ok(Target::Species(Species::Prey)),
        "predator" | "predators" => Ok(Target::Species(Species::Predator)),
        "all" => Ok(Target::All),
        "grass" => Ok(Target::Grass),
        other => Err(CommandError::Target(other.to_string())),
    }
}

fn parse_count(word: &str) -> Result<u32, CommandError> {
    if word.is_empty() || !word.bytes().all(|b| b.is_ascii_digit()) {
        return Err(CommandError::Integer(word.to_string()));
    }
    word.parse()
        .map_err(|_| CommandError::Integer(word.to_string()))
}

/// Parse one shell line. Tokens are case-insensitive; no partial matches.
pub fn parse_command(line: &str) -> Result<ShellCommand, CommandError> {
    let words: Vec<String> = line.split_whitespace().map(str::to_lowercase).collect();
    let Some(first) = words.first() else {
        return Ok(ShellCommand::Empty);
    };
    if QUIT_TOKENS.contains(&first.as_str()) {
        return Ok(ShellCommand::Quit);
    }
    if HELP_TOKENS.contains(&first.as_str()) {
        return Ok(ShellCommand::Help);
    }

    let action = parse_action(first)?;
    let target = parse_target(words.get(1).ok_or(CommandError::MissingTarget)?)?;
    let count = match words.get(2) {
        Some(word) => parse_count(word)?,
        None => 1,
    };
    if words.len() > 3 {
        return Err(CommandError::TooManyWords);
    }
    Ok(ShellCommand::Run {
        action,
        target,
        count,
    })
}
