//! Individual agent
//!
//! One process per individual: join through the rendezvous, attach to the
//! population table, then tick until death. Every exit path is an ordinary
//! return; nothing in the join path panics.

use crate::config::{SimConfig, SpeciesConfig, HANDSHAKE_TIMEOUT};
use crate::core::layout::{SlotId, SlotKind, SlotRecord};
use crate::core::shared_table::SharedMemoryTable;
use crate::rendezvous::{join, JoinRequest};
use crate::species::Species;
use crate::storage::{PopulationStore, TableError, TableView};
use rand::Rng;
use std::time::Duration;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeathCause {
    Starved,
    Eaten,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    Alive {
        energy: i32,
        /// Energy gained from a meal this tick.
        meal: Option<i32>,
        reproduction_attempted: bool,
    },
    Died(DeathCause),
}

/// How an agent process ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentExit {
    /// The rendezvous could not be reached.
    Unreachable,
    /// Admitted without a slot: the table is full or the ticket was stale.
    Rejected,
    Died(DeathCause),
    Failed(String),
}

impl AgentExit {
    pub fn exit_code(&self) -> i32 {
        match self {
            AgentExit::Failed(_) => 1,
            _ => 0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Agent {
    species: Species,
    slot: SlotId,
    settings: SpeciesConfig,
    max_energy: i32,
    /// Prey below this energy can be caught by a predator.
    weakness_threshold: i32,
}

impl Agent {
    pub fn new(config: &SimConfig, species: Species, slot: SlotId) -> Self {
        Self {
            species,
            slot,
            settings: species.settings(config).clone(),
            max_energy: config.max_energy,
            weakness_threshold: config.prey.hunger_threshold,
        }
    }

    pub fn species(&self) -> Species {
        self.species
    }

    pub fn slot(&self) -> SlotId {
        self.slot
    }

    fn own_record(&self, energy: i32) -> SlotRecord {
        SlotRecord::occupied(self.species, energy)
    }

    /// Claim the slot at full energy.
    pub fn attach<S: PopulationStore>(&self, store: &S) -> Result<(), TableError> {
        store.with_table(|view| {
            view.set_slot(self.slot, self.own_record(self.max_energy))?;
            Ok::<_, TableError>(())
        })?;
        info!(species = %self.species, slot = self.slot.index(), energy = self.max_energy, "attached");
        Ok(())
    }

    /// One metabolic step: decay, maybe reproduce, maybe feed, write back.
    pub fn tick<S: PopulationStore, R: Rng>(
        &self,
        store: &S,
        rng: &mut R,
    ) -> Result<TickOutcome, TableError> {
        let energy = store.read_own_energy(self.slot)? - rng.gen_range(self.settings.cost_range());

        if energy <= 0 {
            let cause = store.with_table(|view| {
                let cause = if self.is_gone(view)? {
                    DeathCause::Eaten
                } else {
                    view.clear_slot(self.slot)?;
                    DeathCause::Starved
                };
                Ok::<_, TableError>(cause)
            })?;
            return Ok(TickOutcome::Died(cause));
        }

        let reproduction_attempted = energy > self.settings.reproduction_threshold
            && rng.gen_bool(self.settings.reproduction_probability);
        if reproduction_attempted {
            // offspring mechanics are not defined; the attempt is only recorded
            debug!(species = %self.species, slot = self.slot.index(), energy, "reproduction attempt");
        }

        let hungry = energy < self.settings.hunger_threshold;
        store.with_table(|view| -> Result<TickOutcome, TableError> {
            if self.is_gone(view)? {
                return Ok(TickOutcome::Died(DeathCause::Eaten));
            }
            let meal = if hungry { self.feed(view)? } else { None };
            let energy = match meal {
                Some(nutrient) => (energy + nutrient).min(self.max_energy),
                None => energy,
            };
            view.set_slot(self.slot, self.own_record(energy))?;
            Ok(TickOutcome::Alive {
                energy,
                meal,
                reproduction_attempted,
            })
        })
    }

    /// A predator emptied this slot since the last write.
    fn is_gone(&self, view: &TableView<'_>) -> Result<bool, TableError> {
        Ok(view.slot(self.slot)?.kind != SlotKind::Occupied(self.species))
    }

    /// Runs under the guard.
    fn feed(&self, view: &mut TableView<'_>) -> Result<Option<i32>, TableError> {
        match self.species {
            Species::Prey => {
                let grass = view.resource_count()?;
                if grass <= 0 {
                    return Ok(None);
                }
                view.set_resource_count(grass - 1)?;
                Ok(Some(self.settings.nutrient))
            }
            Species::Predator => {
                let mut victim = None;
                for slot in view.slot_ids() {
                    let record = view.slot(slot)?;
                    if record.kind == SlotKind::Occupied(Species::Prey)
                        && record.energy != 0
                        && record.energy < self.weakness_threshold
                    {
                        victim = Some(slot);
                        break;
                    }
                }
                let Some(victim) = victim else {
                    return Ok(None);
                };
                view.clear_slot(victim)?;
                view.set_event_flag(true)?;
                info!(predator = self.slot.index(), prey = victim.index(), "prey caught");
                Ok(Some(self.settings.nutrient))
            }
        }
    }

    pub fn next_pause<R: Rng>(&self, rng: &mut R) -> Duration {
        Duration::from_millis(rng.gen_range(self.settings.tick_interval.range()))
    }

    /// Attach and tick until death, pausing between ticks with `pause`.
    pub fn live<S, R, P>(&self, store: &S, rng: &mut R, mut pause: P) -> Result<DeathCause, TableError>
    where
        S: PopulationStore,
        R: Rng,
        P: FnMut(Duration),
    {
        self.attach(store)?;
        loop {
            match self.tick(store, rng)? {
                TickOutcome::Died(cause) => {
                    info!(species = %self.species, slot = self.slot.index(), ?cause, "died");
                    return Ok(cause);
                }
                TickOutcome::Alive { energy, meal, .. } => {
                    debug!(species = %self.species, slot = self.slot.index(), energy, ?meal, "tick");
                }
            }
            pause(self.next_pause(rng));
        }
    }
}

/// Whole life of an agent process.
pub fn run(config: &SimConfig, species: Species, ticket: Option<SlotId>) -> AgentExit {
    let request = match ticket {
        Some(ticket) => JoinRequest::with_ticket(species, ticket),
        None => JoinRequest::bare(species),
    };

    let reply = match join(config.listen_socket(), &request, HANDSHAKE_TIMEOUT) {
        Ok(reply) => reply,
        Err(err) => {
            warn!(%species, error = %err, "could not join the environment");
            return AgentExit::Unreachable;
        }
    };
    let Some(slot) = reply.slot else {
        info!(%species, "no slot available");
        return AgentExit::Rejected;
    };

    let store = match SharedMemoryTable::open(&reply.names, config.population_limit) {
        Ok(store) => store,
        Err(err) => {
            warn!(%species, slot = slot.index(), error = %err, "could not attach");
            return AgentExit::Failed(err.to_string());
        }
    };

    let agent = Agent::new(config, species, slot);
    match agent.live(&store, &mut rand::thread_rng(), std::thread::sleep) {
        Ok(cause) => AgentExit::Died(cause),
        Err(err) => {
            warn!(%species, slot = slot.index(), error = %err, "table access failed");
            AgentExit::Failed(err.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::InProcessTable;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn config() -> SimConfig {
        SimConfig {
            population_limit: 4,
            ..SimConfig::default()
        }
    }

    fn record(table: &InProcessTable, slot: SlotId) -> SlotRecord {
        table
            .with_table(|view| Ok::<_, TableError>(view.slot(slot)?))
            .unwrap()
    }

    fn put(table: &InProcessTable, slot: SlotId, record: SlotRecord) {
        table
            .with_table(|view| {
                view.set_slot(slot, record)?;
                Ok::<_, TableError>(())
            })
            .unwrap();
    }

    #[test]
    fn test_attach_claims_slot_at_full_energy() {
        let table = InProcessTable::new(4, 0);
        let agent = Agent::new(&config(), Species::Predator, SlotId(2));
        agent.attach(&table).unwrap();
        assert_eq!(record(&table, SlotId(2)), SlotRecord::occupied(Species::Predator, 100));
    }

    #[test]
    fn test_sated_tick_only_decays() {
        let table = InProcessTable::new(4, 3);
        let agent = Agent::new(&config(), Species::Prey, SlotId(0));
        agent.attach(&table).unwrap();
        let mut rng = StdRng::seed_from_u64(7);
        match agent.tick(&table, &mut rng).unwrap() {
            TickOutcome::Alive { energy, meal, .. } => {
                assert!((95..=99).contains(&energy));
                assert_eq!(meal, None);
                assert_eq!(record(&table, SlotId(0)).energy, energy);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_starvation_empties_own_slot() {
        let table = InProcessTable::new(4, 0);
        let agent = Agent::new(&config(), Species::Prey, SlotId(1));
        put(&table, SlotId(1), SlotRecord::occupied(Species::Prey, 1));
        let outcome = agent.tick(&table, &mut StdRng::seed_from_u64(1)).unwrap();
        assert_eq!(outcome, TickOutcome::Died(DeathCause::Starved));
        assert_eq!(record(&table, SlotId(1)), SlotRecord::EMPTY);
    }

    #[test]
    fn test_emptied_slot_means_eaten() {
        let table = InProcessTable::new(4, 0);
        let agent = Agent::new(&config(), Species::Prey, SlotId(1));
        put(&table, SlotId(1), SlotRecord::occupied(Species::Prey, 30));
        // a predator zeroes the kind but the stale energy is still readable
        table
            .with_table(|view| {
                view.set_slot(SlotId(1), SlotRecord { kind: SlotKind::Empty, energy: 30 })?;
                Ok::<_, TableError>(())
            })
            .unwrap();
        let outcome = agent.tick(&table, &mut StdRng::seed_from_u64(3)).unwrap();
        assert_eq!(outcome, TickOutcome::Died(DeathCause::Eaten));
        assert_eq!(record(&table, SlotId(1)).kind, SlotKind::Empty);
    }

    #[test]
    fn test_live_runs_until_starved() {
        let table = InProcessTable::new(4, 0);
        let agent = Agent::new(&config(), Species::Predator, SlotId(3));
        let mut pauses = 0;
        let cause = agent
            .live(&table, &mut StdRng::seed_from_u64(11), |_| pauses += 1)
            .unwrap();
        assert_eq!(cause, DeathCause::Starved);
        assert!(pauses >= 100 / 6);
        assert_eq!(record(&table, SlotId(3)), SlotRecord::EMPTY);
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(AgentExit::Rejected.exit_code(), 0);
        assert_eq!(AgentExit::Died(DeathCause::Eaten).exit_code(), 0);
        assert_eq!(AgentExit::Failed("x".into()).exit_code(), 1);
    }
}
