use crate::allocator::SlotAllocator;
use crate::core::layout::{SlotId, SlotRecord};
use crate::rendezvous::JoinRequest;
use crate::species::Species;
use crate::storage::{TableError, TableView};
use crate::supervisor::{AgentHandle, ProcessTable};
use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// A slot admitted to an agent the controller did not spawn.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BareJoin {
    pub species: Species,
    pub admitted_at: Instant,
    pub attached_seen: bool,
    pub empty_since: Option<Instant>,
}

/// Everything the controller owns besides the table itself. Lives behind one
/// lock shared by the rendezvous thread, the command dispatcher and the
/// reaper. Lock order: this state first, then the table guard.
#[derive(Debug)]
pub struct ControllerState<H> {
    pub(crate) allocator: SlotAllocator,
    /// Slots reserved by `add` for agents that have not joined yet.
    pub(crate) reservations: HashMap<SlotId, Species>,
    pub(crate) agents: ProcessTable<H>,
    pub(crate) unmanaged: BTreeMap<SlotId, BareJoin>,
    pub(crate) kills_reconciled: u64,
}

/// Slots handed back to the allocator by one reaper pass.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SweepReport {
    pub exited: Vec<SlotId>,
    pub reclaimed: Vec<SlotId>,
    pub kill_reconciled: bool,
}

impl<H: AgentHandle> ControllerState<H> {
    pub fn new(population_limit: usize) -> Self {
        Self {
            allocator: SlotAllocator::new(population_limit),
            reservations: HashMap::new(),
            agents: ProcessTable::new(),
            unmanaged: BTreeMap::new(),
            kills_reconciled: 0,
        }
    }

    pub fn allocator(&self) -> &SlotAllocator {
        &self.allocator
    }

    pub fn agents(&self) -> &ProcessTable<H> {
        &self.agents
    }

    pub fn kills_reconciled(&self) -> u64 {
        self.kills_reconciled
    }

    pub fn is_reserved(&self, slot: SlotId) -> bool {
        self.reservations.contains_key(&slot)
    }

    pub fn bare_join(&self, slot: SlotId) -> Option<&BareJoin> {
        self.unmanaged.get(&slot)
    }

    /// Slot for a join request. A ticket must match an outstanding
    /// reservation for the same species and is consumed; a bare request
    /// takes the lowest free id.
    pub fn admit(&mut self, request: &JoinRequest, now: Instant) -> Option<SlotId> {
        match request.ticket {
            Some(ticket) => match self.reservations.get(&ticket) {
                Some(reserved) if *reserved == request.species => {
                    self.reservations.remove(&ticket);
                    Some(ticket)
                }
                _ => {
                    warn!(species = %request.species, slot = ticket.index(), "join ticket not reserved");
                    None
                }
            },
            None => {
                let slot = self.allocator.acquire()?;
                self.unmanaged.insert(
                    slot,
                    BareJoin {
                        species: request.species,
                        admitted_at: now,
                        attached_seen: false,
                        empty_since: None,
                    },
                );
                Some(slot)
            }
        }
    }

    /// Reserve a slot for an agent about to be spawned.
    pub fn reserve(&mut self, species: Species) -> Option<SlotId> {
        let slot = self.allocator.acquire()?;
        self.reservations.insert(slot, species);
        Some(slot)
    }

    /// Undo a reservation whose agent never started.
    pub fn cancel(&mut self, slot: SlotId) {
        if self.reservations.remove(&slot).is_some() {
            self.allocator.release(slot);
        }
    }

    /// Terminate the oldest tracked agents of one species and free their
    /// slots. Runs under the table guard so no victim dies holding it.
    pub fn remove_agents(
        &mut self,
        view: &mut TableView<'_>,
        species: Species,
        count: usize,
    ) -> Result<Vec<SlotId>, TableError> {
        let targets = self.agents.oldest(species, count);
        for &slot in &targets {
            if let Some(mut tracked) = self.agents.remove(species, slot) {
                let pid = tracked.handle.pid();
                if let Err(err) = tracked.handle.kill_and_wait() {
                    warn!(%species, slot = slot.index(), pid, error = %err, "failed to stop agent");
                }
                debug!(%species, slot = slot.index(), pid, "agent stopped");
            }
            self.free_slot(view, slot)?;
        }
        Ok(targets)
    }

    /// Terminate every tracked agent and clear every outstanding slot.
    pub fn remove_all(&mut self, view: &mut TableView<'_>) -> Result<usize, TableError> {
        let drained = self.agents.drain();
        let count = drained.len();
        for (species, slot, mut tracked) in drained {
            if let Err(err) = tracked.handle.kill_and_wait() {
                warn!(%species, slot = slot.index(), error = %err, "failed to stop agent");
            }
            self.free_slot(view, slot)?;
        }
        let unmanaged: Vec<SlotId> = self.unmanaged.keys().copied().collect();
        for slot in unmanaged {
            self.free_slot(view, slot)?;
        }
        let reserved: Vec<SlotId> = self.reservations.keys().copied().collect();
        for slot in reserved {
            self.free_slot(view, slot)?;
        }
        Ok(count)
    }

    fn free_slot(&mut self, view: &mut TableView<'_>, slot: SlotId) -> Result<(), TableError> {
        view.clear_slot(slot)?;
        self.reservations.remove(&slot);
        self.unmanaged.remove(&slot);
        self.allocator.release(slot);
        Ok(())
    }

    /// One reaper pass: recycle slots of exited agents, reclaim abandoned
    /// bare joins and reconcile the event flag.
    pub fn sweep(
        &mut self,
        view: &mut TableView<'_>,
        now: Instant,
        join_grace: Duration,
    ) -> Result<SweepReport, TableError> {
        let mut report = SweepReport::default();

        for (species, slot, tracked) in self.agents.take_exited() {
            debug!(
                %species,
                slot = slot.index(),
                pid = tracked.handle.pid(),
                lived_ms = (chrono::Utc::now() - tracked.spawned_at).num_milliseconds(),
                "agent exited"
            );
            self.free_slot(view, slot)?;
            report.exited.push(slot);
        }

        let mut abandoned = Vec::new();
        for (&slot, bare) in self.unmanaged.iter_mut() {
            let record = view.slot(slot)?;
            if record != SlotRecord::EMPTY {
                bare.attached_seen = true;
                bare.empty_since = None;
                continue;
            }
            let since = if bare.attached_seen {
                *bare.empty_since.get_or_insert(now)
            } else {
                bare.admitted_at
            };
            if now.saturating_duration_since(since) >= join_grace {
                abandoned.push(slot);
            }
        }
        for slot in abandoned {
            debug!(slot = slot.index(), "bare join reclaimed");
            self.free_slot(view, slot)?;
            report.reclaimed.push(slot);
        }

        if view.event_flag()? {
            view.set_event_flag(false)?;
            self.kills_reconciled += 1;
            report.kill_reconciled = true;
            info!(kills = self.kills_reconciled, "predation event reconciled");
        }

        Ok(report)
    }
}
