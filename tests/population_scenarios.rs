//! Population scenarios against the in-process table
//!
//! The table uses the same byte layout as the shared-memory backend; agent
//! processes are replaced by handles whose exit the test controls.

use circle_of_life::agent::{Agent, DeathCause, TickOutcome};
use circle_of_life::commands::{parse_command, ShellCommand};
use circle_of_life::rendezvous::{Admission, JoinRequest};
use circle_of_life::supervisor::{AgentHandle, AgentLauncher, ProcessError};
use circle_of_life::{
    EnvironmentManager, InProcessTable, PopulationStore, SimConfig, SlotId, SlotRecord, Species,
    TableError,
};
use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[derive(Debug, Clone, Default)]
struct ScriptedAgent {
    killed: Arc<AtomicBool>,
    exited: Arc<AtomicBool>,
}

impl AgentHandle for ScriptedAgent {
    fn pid(&self) -> u32 {
        4242
    }

    fn has_exited(&mut self) -> io::Result<bool> {
        Ok(self.exited.load(Ordering::SeqCst))
    }

    fn kill_and_wait(&mut self) -> io::Result<()> {
        self.killed.store(true, Ordering::SeqCst);
        self.exited.store(true, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Debug, Default)]
struct ScriptedLauncher {
    launched: Mutex<Vec<(Species, SlotId, ScriptedAgent)>>,
}

impl AgentLauncher for ScriptedLauncher {
    type Handle = ScriptedAgent;

    fn launch(&self, species: Species, ticket: SlotId) -> Result<ScriptedAgent, ProcessError> {
        let agent = ScriptedAgent::default();
        self.launched.lock().push((species, ticket, agent.clone()));
        Ok(agent)
    }
}

fn environment(population_limit: usize, grass: i32) -> EnvironmentManager<InProcessTable, ScriptedLauncher> {
    let config = SimConfig {
        population_limit,
        initial_resources: grass.min(4),
        ..SimConfig::default()
    };
    EnvironmentManager::new(
        InProcessTable::new(population_limit, grass),
        config,
        ScriptedLauncher::default(),
    )
}

fn run(manager: &EnvironmentManager<InProcessTable, ScriptedLauncher>, line: &str) -> String {
    match parse_command(line).unwrap() {
        ShellCommand::Run {
            action,
            target,
            count,
        } => manager.execute(action, target, count),
        other => panic!("not an administrative command: {other:?}"),
    }
}

fn assert_invariants(table: &InProcessTable) {
    table
        .with_table(|view| {
            view.verify_invariants()
                .map_err(|violation| TableError::LockGuard(violation.to_string()))
        })
        .unwrap();
}

fn put(table: &InProcessTable, slot: SlotId, record: SlotRecord) {
    table
        .with_table(|view| {
            view.set_slot(slot, record)?;
            Ok::<_, TableError>(())
        })
        .unwrap();
}

fn read(table: &InProcessTable, slot: SlotId) -> SlotRecord {
    table
        .with_table(|view| Ok::<_, TableError>(view.slot(slot)?))
        .unwrap()
}

#[test]
fn adding_past_the_population_limit_stops_early() {
    let manager = environment(2, 0);
    assert_eq!(
        run(&manager, "add prey 3"),
        "Cannot add more individuals\n2 prey(s) added"
    );

    let launched = manager.launcher().launched.lock().clone();
    let ids: Vec<SlotId> = launched.iter().map(|(_, slot, _)| *slot).collect();
    assert_eq!(ids, vec![SlotId(0), SlotId(1)]);

    // the spawned agents join with their tickets, a third joiner gets nothing
    for (species, slot, _) in &launched {
        let request = JoinRequest::with_ticket(*species, *slot);
        assert_eq!(manager.shared().admit(&request), Some(*slot));
    }
    assert_eq!(manager.shared().admit(&JoinRequest::bare(Species::Prey)), None);
}

#[test]
fn hungry_prey_without_grass_cannot_feed() {
    let config = SimConfig::default();
    let table = InProcessTable::new(config.population_limit, 0);
    let prey = Agent::new(&config, Species::Prey, SlotId(0));
    put(&table, SlotId(0), SlotRecord::occupied(Species::Prey, 30));

    let outcome = prey.tick(&table, &mut StdRng::seed_from_u64(5)).unwrap();
    let TickOutcome::Alive { energy, meal, .. } = outcome else {
        panic!("prey should survive one tick, got {outcome:?}");
    };
    assert_eq!(meal, None);
    assert!((25..=29).contains(&energy));
    let grass = table
        .with_table(|view| Ok::<_, TableError>(view.resource_count()?))
        .unwrap();
    assert_eq!(grass, 0);
    assert_invariants(&table);
}

#[test]
fn hungry_prey_eats_one_grass_unit() {
    let config = SimConfig::default();
    let table = InProcessTable::new(config.population_limit, 2);
    let prey = Agent::new(&config, Species::Prey, SlotId(0));
    put(&table, SlotId(0), SlotRecord::occupied(Species::Prey, 30));

    let outcome = prey.tick(&table, &mut StdRng::seed_from_u64(9)).unwrap();
    let TickOutcome::Alive { energy, meal, .. } = outcome else {
        panic!("prey should survive one tick, got {outcome:?}");
    };
    assert_eq!(meal, Some(config.prey.nutrient));
    assert!((45..=49).contains(&energy));
    assert_eq!(
        table
            .with_table(|view| Ok::<_, TableError>(view.resource_count()?))
            .unwrap(),
        1
    );
}

#[test]
fn predator_kills_a_weak_prey_once() {
    let config = SimConfig::default();
    let table = InProcessTable::new(config.population_limit, 0);
    let predator = Agent::new(&config, Species::Predator, SlotId(1));
    put(&table, SlotId(0), SlotRecord::occupied(Species::Prey, 10));
    put(&table, SlotId(1), SlotRecord::occupied(Species::Predator, 20));
    // strong prey is left alone
    put(&table, SlotId(2), SlotRecord::occupied(Species::Prey, 90));

    let mut rng = StdRng::seed_from_u64(21);
    let TickOutcome::Alive { energy, meal, .. } = predator.tick(&table, &mut rng).unwrap() else {
        panic!("predator should survive");
    };
    assert_eq!(meal, Some(config.predator.nutrient));
    assert!((64..=68).contains(&energy));
    assert_eq!(read(&table, SlotId(0)), SlotRecord::EMPTY);
    assert_eq!(read(&table, SlotId(2)), SlotRecord::occupied(Species::Prey, 90));
    assert!(table
        .with_table(|view| Ok::<_, TableError>(view.event_flag()?))
        .unwrap());
    assert_invariants(&table);

    // still hungry, but the emptied slot is not found again
    put(&table, SlotId(1), SlotRecord::occupied(Species::Predator, 20));
    let TickOutcome::Alive { meal, .. } = predator.tick(&table, &mut rng).unwrap() else {
        panic!("predator should survive");
    };
    assert_eq!(meal, None);
}

#[test]
fn eaten_prey_notices_on_its_next_tick() {
    let config = SimConfig::default();
    let table = InProcessTable::new(config.population_limit, 0);
    let prey = Agent::new(&config, Species::Prey, SlotId(0));
    let predator = Agent::new(&config, Species::Predator, SlotId(1));
    put(&table, SlotId(0), SlotRecord::occupied(Species::Prey, 30));
    put(&table, SlotId(1), SlotRecord::occupied(Species::Predator, 10));

    let mut rng = StdRng::seed_from_u64(2);
    predator.tick(&table, &mut rng).unwrap();
    assert_eq!(
        prey.tick(&table, &mut rng).unwrap(),
        TickOutcome::Died(DeathCause::Eaten)
    );
    assert_eq!(read(&table, SlotId(0)), SlotRecord::EMPTY);
    assert_invariants(&table);
}

#[test]
fn deleting_a_prey_frees_its_slot_for_the_next_join() {
    let manager = environment(3, 0);
    run(&manager, "add prey 1");
    let (_, slot, agent) = manager.launcher().launched.lock()[0].clone();
    assert_eq!(
        manager.shared().admit(&JoinRequest::with_ticket(Species::Prey, slot)),
        Some(slot)
    );
    put(manager.store(), slot, SlotRecord::occupied(Species::Prey, 100));

    assert_eq!(run(&manager, "delete prey 1"), "Removed 1 prey(s).");
    assert!(agent.killed.load(Ordering::SeqCst));
    assert_eq!(read(manager.store(), slot), SlotRecord::EMPTY);
    assert_invariants(manager.store());

    let rejoined = manager.shared().admit(&JoinRequest::bare(Species::Prey));
    assert_eq!(rejoined, Some(slot));
}

#[test]
fn listing_shows_living_entries_only() {
    let manager = environment(4, 0);
    put(manager.store(), SlotId(1), SlotRecord::occupied(Species::Predator, 55));
    put(manager.store(), SlotId(3), SlotRecord::occupied(Species::Predator, 7));
    put(manager.store(), SlotId(2), SlotRecord::occupied(Species::Prey, 12));

    assert_eq!(
        run(&manager, "list predators"),
        "Predators in the simulation (Shared Memory View):\n - ID 1: Energy 55\n - ID 3: Energy 7\nTotal: 2 predator(s)."
    );
    let both = run(&manager, "list all");
    assert!(both.starts_with("Preys in the simulation"));
    assert!(both.contains("\n\nPredators in the simulation"));
}

#[test]
fn self_exited_agents_are_reaped() {
    let manager = environment(2, 0);
    run(&manager, "add predator 1");
    let (_, slot, agent) = manager.launcher().launched.lock()[0].clone();
    manager
        .shared()
        .admit(&JoinRequest::with_ticket(Species::Predator, slot));
    put(manager.store(), slot, SlotRecord::occupied(Species::Predator, 3));

    // the agent starves: it clears its own slot and exits
    put(manager.store(), slot, SlotRecord::EMPTY);
    agent.exited.store(true, Ordering::SeqCst);

    let report = manager.shared().sweep().unwrap();
    assert_eq!(report.exited, vec![slot]);
    assert_eq!(run(&manager, "delete predator 1"), "No predators to delete.");
    assert!(manager.shared().state.lock().allocator().is_free(slot));
}

#[test]
fn grass_commands_follow_the_admin_rules() {
    let manager = environment(1, 4);
    assert_eq!(run(&manager, "add grass 12"), "Added 12 grass.");
    assert_eq!(run(&manager, "list grass"), "Total: 16 grass");
    assert_eq!(run(&manager, "delete grass 3"), "Removed 3 grass.");
    assert_eq!(run(&manager, "delete grass 50"), "Removed 13 grass.");
    assert_eq!(run(&manager, "list grass"), "Total: 0 grass");
}
