use crate::config::{ConfigError, SimConfig, CONFIG_ENV};
use crate::core::layout::SlotId;
use crate::platform;
use crate::species::Species;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::io;
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

/// A running agent the controller can poll and terminate.
pub trait AgentHandle: Send {
    fn pid(&self) -> u32;

    /// Non-blocking check whether the agent has exited (and reap it if so).
    fn has_exited(&mut self) -> io::Result<bool>;

    /// Forced termination followed by a blocking wait.
    fn kill_and_wait(&mut self) -> io::Result<()>;
}

/// Starts agent processes for reserved slots.
pub trait AgentLauncher: Send + Sync {
    type Handle: AgentHandle + 'static;

    fn launch(&self, species: Species, ticket: SlotId) -> Result<Self::Handle, ProcessError>;
}

#[derive(Debug)]
pub struct ChildAgent {
    child: Child,
}

impl AgentHandle for ChildAgent {
    fn pid(&self) -> u32 {
        self.child.id()
    }

    fn has_exited(&mut self) -> io::Result<bool> {
        Ok(self.child.try_wait()?.is_some())
    }

    fn kill_and_wait(&mut self) -> io::Result<()> {
        match self.child.kill() {
            Ok(()) => {}
            // already exited and reaped
            Err(err) if err.kind() == io::ErrorKind::InvalidInput => {}
            Err(err) => return Err(err),
        }
        self.child.wait()?;
        Ok(())
    }
}

/// Re-executes this binary as `agent <species> --ticket <slot>`.
#[derive(Debug, Clone)]
pub struct ProcessLauncher {
    program: PathBuf,
    config_payload: String,
    log_level: Option<String>,
    log_file: Option<PathBuf>,
}

impl ProcessLauncher {
    pub fn new(program: PathBuf, config: &SimConfig) -> Result<Self, ProcessError> {
        Ok(Self {
            program,
            config_payload: config.to_agent_env()?,
            log_level: None,
            log_file: None,
        })
    }

    pub fn current_exe(config: &SimConfig) -> Result<Self, ProcessError> {
        Self::new(std::env::current_exe()?, config)
    }

    pub fn with_logging(mut self, log_level: Option<String>, log_file: Option<PathBuf>) -> Self {
        self.log_level = log_level;
        self.log_file = log_file;
        self
    }

    fn command(&self, species: Species, ticket: SlotId) -> Command {
        let mut command = Command::new(&self.program);
        command
            .arg("agent")
            .arg(species.token())
            .arg("--ticket")
            .arg(ticket.to_string())
            .env(CONFIG_ENV, &self.config_payload)
            .stdin(Stdio::null())
            .stdout(Stdio::null());
        if let Some(level) = &self.log_level {
            command.arg("--log-level").arg(level);
        }
        if let Some(file) = &self.log_file {
            command.arg("--log-file").arg(file);
        }
        platform::prepare_command(&mut command);
        command
    }
}

impl AgentLauncher for ProcessLauncher {
    type Handle = ChildAgent;

    fn launch(&self, species: Species, ticket: SlotId) -> Result<ChildAgent, ProcessError> {
        let child = self.command(species, ticket).spawn()?;
        debug!(%species, slot = ticket.index(), pid = child.id(), "agent process started");
        Ok(ChildAgent { child })
    }
}

#[derive(Debug)]
pub struct TrackedAgent<H> {
    pub handle: H,
    pub spawned_at: DateTime<Utc>,
}

/// Spawned agents keyed by slot id, one map per species.
#[derive(Debug)]
pub struct ProcessTable<H> {
    prey: BTreeMap<SlotId, TrackedAgent<H>>,
    predators: BTreeMap<SlotId, TrackedAgent<H>>,
}

impl<H> Default for ProcessTable<H> {
    fn default() -> Self {
        Self {
            prey: BTreeMap::new(),
            predators: BTreeMap::new(),
        }
    }
}

impl<H: AgentHandle> ProcessTable<H> {
    pub fn new() -> Self {
        Self::default()
    }

    fn partition(&self, species: Species) -> &BTreeMap<SlotId, TrackedAgent<H>> {
        match species {
            Species::Prey => &self.prey,
            Species::Predator => &self.predators,
        }
    }

    fn partition_mut(&mut self, species: Species) -> &mut BTreeMap<SlotId, TrackedAgent<H>> {
        match species {
            Species::Prey => &mut self.prey,
            Species::Predator => &mut self.predators,
        }
    }

    pub fn insert(&mut self, species: Species, slot: SlotId, handle: H) {
        self.partition_mut(species).insert(
            slot,
            TrackedAgent {
                handle,
                spawned_at: Utc::now(),
            },
        );
    }

    pub fn remove(&mut self, species: Species, slot: SlotId) -> Option<TrackedAgent<H>> {
        self.partition_mut(species).remove(&slot)
    }

    pub fn len(&self, species: Species) -> usize {
        self.partition(species).len()
    }

    pub fn is_empty(&self) -> bool {
        self.prey.is_empty() && self.predators.is_empty()
    }

    pub fn contains(&self, species: Species, slot: SlotId) -> bool {
        self.partition(species).contains_key(&slot)
    }

    /// Up to `count` tracked slots of one species, lowest id first.
    pub fn oldest(&self, species: Species, count: usize) -> Vec<SlotId> {
        self.partition(species).keys().take(count).copied().collect()
    }

    /// Remove and return every agent whose process has exited.
    pub fn take_exited(&mut self) -> Vec<(Species, SlotId, TrackedAgent<H>)> {
        let mut exited = Vec::new();
        for species in Species::ALL {
            let partition = self.partition_mut(species);
            let finished: Vec<SlotId> = partition
                .iter_mut()
                .filter_map(|(slot, tracked)| match tracked.handle.has_exited() {
                    Ok(true) => Some(*slot),
                    Ok(false) => None,
                    Err(err) => {
                        debug!(slot = slot.index(), error = %err, "agent status check failed");
                        None
                    }
                })
                .collect();
            for slot in finished {
                if let Some(tracked) = partition.remove(&slot) {
                    exited.push((species, slot, tracked));
                }
            }
        }
        exited
    }

    /// Remove every tracked agent.
    pub fn drain(&mut self) -> Vec<(Species, SlotId, TrackedAgent<H>)> {
        let mut all = Vec::new();
        for species in Species::ALL {
            let partition = std::mem::take(self.partition_mut(species));
            all.extend(
                partition
                    .into_iter()
                    .map(|(slot, tracked)| (species, slot, tracked)),
            );
        }
        all
    }
}
