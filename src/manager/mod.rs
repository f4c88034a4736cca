//! Environment manager
//!
//! The controller side of the simulation. It owns the population table, the
//! slot allocator, the process table of spawned agents, the background
//! tickers and the rendezvous listener, and answers administrative commands.

mod report;
mod state;
mod tickers;

pub use report::{grass_total, population_listing};
pub use state::{BareJoin, ControllerState, SweepReport};
pub use tickers::grow_once;

use crate::commands::{Action, Target};
use crate::config::SimConfig;
use crate::core::layout::SlotId;
use crate::core::shared_table::{ResourceNames, SharedMemoryTable};
use crate::error::SimResult;
use crate::rendezvous::{Admission, JoinRequest, RendezvousHandle, RendezvousListener};
use crate::species::Species;
use crate::storage::{PopulationStore, TableError};
use crate::supervisor::{AgentHandle, AgentLauncher};
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tickers::Tickers;
use tracing::{error, info, warn};

/// State reachable from every controller thread.
pub struct Shared<S, H> {
    pub store: S,
    pub config: SimConfig,
    pub state: Mutex<ControllerState<H>>,
    /// Growth ticks still to skip; armed by the drought ticker.
    pub drought: Mutex<u32>,
}

impl<S: PopulationStore, H: AgentHandle> Shared<S, H> {
    pub fn new(store: S, config: SimConfig) -> Self {
        Self {
            state: Mutex::new(ControllerState::new(store.population_limit())),
            drought: Mutex::new(0),
            store,
            config,
        }
    }

    /// One reaper pass. Lock order: state, then table.
    pub fn sweep(&self) -> Result<SweepReport, TableError> {
        let mut state = self.state.lock();
        let join_grace = self.config.join_grace();
        self.store
            .with_table(|view| state.sweep(view, Instant::now(), join_grace))
    }
}

impl<S: PopulationStore, H: AgentHandle> Admission for Shared<S, H> {
    fn admit(&self, request: &JoinRequest) -> Option<SlotId> {
        self.state.lock().admit(request, Instant::now())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Running,
    Draining,
    Terminated,
}

pub struct EnvironmentManager<S, L>
where
    S: PopulationStore + 'static,
    L: AgentLauncher,
{
    shared: Arc<Shared<S, L::Handle>>,
    launcher: L,
    rendezvous: Option<RendezvousHandle>,
    tickers: Option<Tickers>,
    phase: Phase,
}

impl<L: AgentLauncher> EnvironmentManager<SharedMemoryTable, L> {
    /// Create the shared table and start every background thread.
    pub fn start(config: SimConfig, launcher: L) -> SimResult<Self> {
        let names = ResourceNames::new(&config.shm_name, &config.mutex_name);
        // The bound port is the single-instance lock. Stale regions are only
        // reclaimed once it is held, so a second controller fails here
        // without touching the running one's names.
        let listener = RendezvousListener::bind(config.listen_socket())?;
        let store = SharedMemoryTable::create(
            &names,
            config.population_limit,
            config.initial_resources,
        )?;
        let mut manager = Self::new(store, config, launcher);
        manager.serve_rendezvous(listener, names)?;
        manager.start_tickers()?;
        info!(
            population_limit = manager.config().population_limit,
            port = manager.config().listen_port,
            "environment ready"
        );
        Ok(manager)
    }
}

impl<S, L> EnvironmentManager<S, L>
where
    S: PopulationStore + 'static,
    L: AgentLauncher,
{
    /// Manager over an existing store; background threads are started
    /// separately.
    pub fn new(store: S, config: SimConfig, launcher: L) -> Self {
        Self {
            shared: Arc::new(Shared::new(store, config)),
            launcher,
            rendezvous: None,
            tickers: None,
            phase: Phase::Running,
        }
    }

    pub fn start_rendezvous(&mut self, names: ResourceNames) -> SimResult<()> {
        let listener = RendezvousListener::bind(self.config().listen_socket())?;
        self.serve_rendezvous(listener, names)
    }

    /// Answer joins on an already bound listener.
    pub fn serve_rendezvous(
        &mut self,
        listener: RendezvousListener,
        names: ResourceNames,
    ) -> SimResult<()> {
        self.rendezvous = Some(listener.spawn(Arc::clone(&self.shared), names)?);
        Ok(())
    }

    pub fn start_tickers(&mut self) -> SimResult<()> {
        self.tickers = Some(Tickers::spawn(Arc::clone(&self.shared))?);
        Ok(())
    }

    pub fn shared(&self) -> &Arc<Shared<S, L::Handle>> {
        &self.shared
    }

    pub fn config(&self) -> &SimConfig {
        &self.shared.config
    }

    pub fn store(&self) -> &S {
        &self.shared.store
    }

    pub fn launcher(&self) -> &L {
        &self.launcher
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Bound address of the rendezvous listener, once started.
    pub fn rendezvous_addr(&self) -> Option<SocketAddr> {
        self.rendezvous.as_ref().map(RendezvousHandle::local_addr)
    }

    /// Run one administrative command and render its report.
    pub fn execute(&self, action: Action, target: Target, count: u32) -> String {
        let result = match (action, target) {
            (Action::Add, Target::Species(species)) => Ok(self.add(species, count)),
            (Action::Add, Target::All) => {
                each_species("\n", |species| Ok(self.add(species, count)))
            }
            (Action::Add, Target::Grass) => self.grass_add(count),
            (Action::List, Target::Species(species)) => self.list(species),
            (Action::List, Target::All) => each_species("\n\n", |species| self.list(species)),
            (Action::List, Target::Grass) => self.grass_count().map(grass_total),
            (Action::Delete, Target::Species(species)) => self.delete(species, count),
            (Action::Delete, Target::All) => {
                each_species("\n", |species| self.delete(species, count))
            }
            (Action::Delete, Target::Grass) => self.grass_delete(count),
        };

        result.unwrap_or_else(|err| {
            error!(error = %err, "population table access failed");
            format!("***Population table unavailable: {err}")
        })
    }

    /// Spawn up to `count` agents, stopping early when the table is full.
    pub fn add(&self, species: Species, count: u32) -> String {
        let mut lines = Vec::new();
        let mut added = 0;
        let mut state = self.shared.state.lock();
        for _ in 0..count {
            let Some(slot) = state.reserve(species) else {
                lines.push("Cannot add more individuals".to_string());
                break;
            };
            match self.launcher.launch(species, slot) {
                Ok(handle) => {
                    info!(%species, slot = slot.index(), pid = handle.pid(), "agent spawned");
                    state.agents.insert(species, slot, handle);
                    added += 1;
                }
                Err(err) => {
                    state.cancel(slot);
                    warn!(%species, error = %err, "failed to spawn agent");
                    lines.push(format!("***Failed to start {species}: {err}"));
                    break;
                }
            }
        }
        lines.push(format!("{added} {species}(s) added"));
        lines.join("\n")
    }

    pub fn list(&self, species: Species) -> Result<String, TableError> {
        let living = self
            .shared
            .store
            .with_table(|view| Ok::<_, TableError>(view.living(species)?))?;
        Ok(population_listing(species, &living))
    }

    /// Stop up to `count` tracked agents of one species, lowest id first.
    pub fn delete(&self, species: Species, count: u32) -> Result<String, TableError> {
        let mut state = self.shared.state.lock();
        if state.agents.len(species) == 0 {
            return Ok(format!("No {}s to delete.", species.token()));
        }
        let removed = self
            .shared
            .store
            .with_table(|view| state.remove_agents(view, species, count as usize))?;
        info!(%species, count = removed.len(), "agents removed");
        Ok(format!("Removed {} {species}(s).", removed.len()))
    }

    /// Administrative addition; not capped by the resource limit.
    pub fn grass_add(&self, amount: u32) -> Result<String, TableError> {
        let total = self.shared.store.with_table(|view| {
            let current = view.resource_count()?;
            let total = current
                .saturating_add(i32::try_from(amount).unwrap_or(i32::MAX))
                .max(0);
            view.set_resource_count(total)?;
            Ok::<_, TableError>(total)
        })?;
        info!(amount, total, "grass added");
        Ok(format!("Added {amount} grass."))
    }

    pub fn grass_delete(&self, amount: u32) -> Result<String, TableError> {
        let removed = self.shared.store.with_table(|view| {
            let current = view.resource_count()?.max(0);
            let removed = current.min(i32::try_from(amount).unwrap_or(i32::MAX));
            view.set_resource_count(current - removed)?;
            Ok::<_, TableError>(removed)
        })?;
        Ok(format!("Removed {removed} grass."))
    }

    pub fn grass_count(&self) -> Result<i32, TableError> {
        self.shared
            .store
            .with_table(|view| Ok::<_, TableError>(view.resource_count()?))
    }

    /// Stop the background threads, then every agent, then clear the table.
    /// Shared names are unlinked when the manager (and its store) drops.
    pub fn drain(&mut self) -> Result<(), TableError> {
        if self.phase != Phase::Running {
            return Ok(());
        }
        self.phase = Phase::Draining;
        info!("draining environment");

        if let Some(mut tickers) = self.tickers.take() {
            tickers.stop();
        }
        if let Some(mut rendezvous) = self.rendezvous.take() {
            rendezvous.shutdown();
        }

        let mut state = self.shared.state.lock();
        let stopped = self
            .shared
            .store
            .with_table(|view| state.remove_all(view))?;
        drop(state);

        self.phase = Phase::Terminated;
        info!(stopped, "environment drained");
        Ok(())
    }

    pub fn shutdown(mut self) -> Result<(), TableError> {
        self.drain()
    }
}

/// Prey first, then predators.
fn each_species(
    separator: &str,
    op: impl Fn(Species) -> Result<String, TableError>,
) -> Result<String, TableError> {
    let parts = Species::ALL
        .into_iter()
        .map(op)
        .collect::<Result<Vec<_>, _>>()?;
    Ok(parts.join(separator))
}

impl<S, L> Drop for EnvironmentManager<S, L>
where
    S: PopulationStore + 'static,
    L: AgentLauncher,
{
    fn drop(&mut self) {
        if let Err(err) = self.drain() {
            error!(error = %err, "drain on drop failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::InProcessTable;
    use crate::supervisor::testing::FakeLauncher;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::Ordering;

    fn manager(population_limit: usize, grass: i32) -> EnvironmentManager<InProcessTable, FakeLauncher> {
        let config = SimConfig {
            population_limit,
            ..SimConfig::default()
        };
        EnvironmentManager::new(
            InProcessTable::new(population_limit, grass),
            config,
            FakeLauncher::default(),
        )
    }

    #[test]
    fn test_add_stops_at_capacity() {
        let manager = manager(2, 0);
        assert_eq!(
            manager.add(Species::Prey, 3),
            "Cannot add more individuals\n2 prey(s) added"
        );
        assert_eq!(manager.launcher().launched.lock().len(), 2);
        let bare = manager.shared().admit(&JoinRequest::bare(Species::Prey));
        assert_eq!(bare, None);
    }

    #[test]
    fn test_failed_spawn_returns_the_slot() {
        let manager = manager(2, 0);
        manager.launcher().fail.store(true, Ordering::SeqCst);
        let report = manager.add(Species::Predator, 1);
        assert!(report.ends_with("0 predator(s) added"));
        assert_eq!(manager.shared().state.lock().allocator().outstanding(), 0);
    }

    #[test]
    fn test_list_reports_none_distinctly() {
        let manager = manager(3, 0);
        assert_eq!(
            manager.list(Species::Predator).unwrap(),
            "Predators in the simulation (Shared Memory View):\nNo active predators found in shared memory."
        );
    }

    #[test]
    fn test_delete_without_agents() {
        let manager = manager(1, 0);
        assert_eq!(manager.delete(Species::Prey, 1).unwrap(), "No preys to delete.");
    }

    #[test]
    fn test_grass_add_ignores_limit_and_delete_clamps() {
        let manager = manager(1, 4);
        assert_eq!(manager.grass_add(12).unwrap(), "Added 12 grass.");
        assert_eq!(manager.grass_count().unwrap(), 16);
        assert_eq!(manager.grass_delete(20).unwrap(), "Removed 16 grass.");
        assert_eq!(manager.grass_count().unwrap(), 0);
        assert_eq!(manager.execute(Action::List, Target::Grass, 1), "Total: 0 grass");
    }

    #[test]
    fn test_all_target_runs_prey_first() {
        let manager = manager(4, 0);
        assert_eq!(
            manager.execute(Action::Add, Target::All, 1),
            "1 prey(s) added\n1 predator(s) added"
        );
        let launched = manager.launcher().launched.lock();
        assert_eq!(launched[0].0, Species::Prey);
        assert_eq!(launched[1].0, Species::Predator);
    }

    #[test]
    fn test_drain_kills_agents_once() {
        let mut manager = manager(2, 0);
        manager.add(Species::Prey, 2);
        manager.drain().unwrap();
        assert_eq!(manager.phase(), Phase::Terminated);
        for (_, _, agent) in manager.launcher().launched.lock().iter() {
            assert!(agent.killed.load(Ordering::SeqCst));
        }
        assert_eq!(manager.shared().state.lock().allocator().outstanding(), 0);
        // second drain is a no-op
        manager.drain().unwrap();
    }
}
