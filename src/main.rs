use anyhow::{Context, Result};
use circle_of_life::agent;
use circle_of_life::commands::{Cli, Commands, LogArgs};
use circle_of_life::config::{SimConfig, DRAIN_ACK_TIMEOUT};
use circle_of_life::shell::{self, ShellExit};
use circle_of_life::signal;
use circle_of_life::supervisor::ProcessLauncher;
use circle_of_life::utils::logger::init_logger;
use circle_of_life::{EnvironmentManager, SlotId};
use std::io;
use std::path::PathBuf;
use std::process::ExitCode;

fn main() -> ExitCode {
    let outcome = match Cli::parse_command() {
        Commands::Run { config, log } => run_controller(config, log),
        Commands::Agent {
            species,
            ticket,
            log,
        } => run_agent(species, ticket.map(SlotId), log),
    };
    match outcome {
        Ok(code) => code,
        Err(err) => {
            eprintln!("circle-of-life: {err:#}");
            ExitCode::from(1)
        }
    }
}

fn run_controller(config_path: Option<PathBuf>, log: LogArgs) -> Result<ExitCode> {
    init_logger(log.log_level.as_deref(), log.log_file.clone())?;
    let config = SimConfig::load(config_path.as_deref()).context("loading configuration")?;
    signal::install().context("installing signal handlers")?;

    let launcher = ProcessLauncher::current_exe(&config)?.with_logging(log.log_level, log.log_file);
    let manager = EnvironmentManager::start(config, launcher).context("starting environment")?;
    let (bus, dispatcher) = shell::spawn_dispatcher(manager)?;
    shell::spawn_signal_watcher(bus.clone(), DRAIN_ACK_TIMEOUT)?;

    let exit = shell::run_shell(io::stdin().lock(), io::stdout(), &bus)?;
    let drained = match exit {
        ShellExit::Quit => true,
        ShellExit::EndOfInput => shell::request_drain(&bus, DRAIN_ACK_TIMEOUT),
        ShellExit::DispatcherGone => false,
    };
    if drained && dispatcher.join().is_err() {
        tracing::error!("dispatcher thread panicked");
    }
    Ok(ExitCode::SUCCESS)
}

fn run_agent(
    species: circle_of_life::Species,
    ticket: Option<SlotId>,
    log: LogArgs,
) -> Result<ExitCode> {
    init_logger(log.log_level.as_deref(), log.log_file)?;
    let config = SimConfig::from_agent_env().context("reading configuration from environment")?;
    let exit = agent::run(&config, species, ticket);
    tracing::debug!(?exit, "agent finished");
    Ok(ExitCode::from(exit.exit_code() as u8))
}
