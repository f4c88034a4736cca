use crate::core::layout::{
    read_i32, slot_offset, table_size, Header, LayoutError, SlotId, SlotRecord, ENERGY_OFFSET,
    HEADER_SIZE, SLOT_SIZE,
};
use crate::species::Species;
use parking_lot::Mutex;
use shared_memory::ShmemError;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TableError {
    #[error("shared memory region too small: expected {expected} bytes, found {actual}")]
    RegionTooSmall { expected: usize, actual: usize },
    #[error("shared memory error ({name}): {source}")]
    Shmem {
        name: String,
        #[source]
        source: ShmemError,
    },
    #[error("shared lock init failed: {0}")]
    LockInit(String),
    #[error("shared lock access failed: {0}")]
    LockGuard(String),
    #[error(transparent)]
    Layout(#[from] LayoutError),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InvariantViolation {
    #[error("slot {0} is empty but holds energy {1}")]
    EmptyWithEnergy(SlotId, i32),
    #[error("slot {0} is occupied with non-positive energy {1}")]
    LivingWithoutEnergy(SlotId, i32),
    #[error("resource count {0} is negative")]
    NegativeResources(i32),
    #[error(transparent)]
    Layout(#[from] LayoutError),
}

/// Typed access to the table bytes. Only handed out while the guard is held.
pub struct TableView<'a> {
    bytes: &'a mut [u8],
    population_limit: usize,
}

impl<'a> TableView<'a> {
    pub(crate) fn new(bytes: &'a mut [u8], population_limit: usize) -> Self {
        debug_assert!(bytes.len() >= table_size(population_limit));
        Self {
            bytes,
            population_limit,
        }
    }

    pub fn population_limit(&self) -> usize {
        self.population_limit
    }

    pub fn slot_ids(&self) -> impl Iterator<Item = SlotId> {
        (0..self.population_limit).map(SlotId)
    }

    pub fn header(&self) -> Result<Header, LayoutError> {
        let mut raw = [0u8; HEADER_SIZE];
        raw.copy_from_slice(&self.bytes[..HEADER_SIZE]);
        Header::decode(&raw)
    }

    pub fn set_header(&mut self, header: Header) {
        self.bytes[..HEADER_SIZE].copy_from_slice(&header.encode());
    }

    pub fn resource_count(&self) -> Result<i32, LayoutError> {
        Ok(self.header()?.resource_count)
    }

    pub fn set_resource_count(&mut self, resource_count: i32) -> Result<(), LayoutError> {
        let header = self.header()?;
        self.set_header(Header {
            resource_count,
            ..header
        });
        Ok(())
    }

    pub fn event_flag(&self) -> Result<bool, LayoutError> {
        Ok(self.header()?.event_flag)
    }

    pub fn set_event_flag(&mut self, event_flag: bool) -> Result<(), LayoutError> {
        let header = self.header()?;
        self.set_header(Header {
            event_flag,
            ..header
        });
        Ok(())
    }

    fn slot_range(&self, slot: SlotId) -> Result<std::ops::Range<usize>, LayoutError> {
        if slot.index() >= self.population_limit {
            return Err(LayoutError::OutOfRange {
                slot,
                limit: self.population_limit,
            });
        }
        let start = slot_offset(slot);
        Ok(start..start + SLOT_SIZE)
    }

    pub fn slot(&self, slot: SlotId) -> Result<SlotRecord, LayoutError> {
        let range = self.slot_range(slot)?;
        let mut raw = [0u8; SLOT_SIZE];
        raw.copy_from_slice(&self.bytes[range]);
        SlotRecord::decode(slot, &raw)
    }

    pub fn set_slot(&mut self, slot: SlotId, record: SlotRecord) -> Result<(), LayoutError> {
        let range = self.slot_range(slot)?;
        self.bytes[range].copy_from_slice(&record.encode());
        Ok(())
    }

    pub fn clear_slot(&mut self, slot: SlotId) -> Result<(), LayoutError> {
        self.set_slot(slot, SlotRecord::EMPTY)
    }

    /// Ids and energies of living entries of one species, ascending by id.
    pub fn living(&self, species: Species) -> Result<Vec<(SlotId, i32)>, LayoutError> {
        let mut found = Vec::new();
        for slot in self.slot_ids() {
            let record = self.slot(slot)?;
            if record.is_alive_as(species) {
                found.push((slot, record.energy));
            }
        }
        Ok(found)
    }

    /// Header to its startup state, every slot empty.
    pub fn reset(&mut self, resource_count: i32) {
        self.bytes.fill(0);
        self.set_header(Header {
            resource_count,
            event_flag: false,
        });
    }

    pub fn verify_invariants(&self) -> Result<(), InvariantViolation> {
        let resources = self.resource_count()?;
        if resources < 0 {
            return Err(InvariantViolation::NegativeResources(resources));
        }
        for slot in self.slot_ids() {
            let record = self.slot(slot)?;
            if record.is_empty() && record.energy != 0 {
                return Err(InvariantViolation::EmptyWithEnergy(slot, record.energy));
            }
            if !record.is_empty() && record.energy <= 0 {
                return Err(InvariantViolation::LivingWithoutEnergy(slot, record.energy));
            }
        }
        Ok(())
    }
}

/// Population table storage.
///
/// Every access that spans more than one field, or reads a field another
/// process may write, goes through `with_table`, which holds the guard for
/// exactly the duration of the closure and releases it on every path.
pub trait PopulationStore: Send + Sync {
    fn population_limit(&self) -> usize;

    fn with_table<T, E, F>(&self, f: F) -> Result<T, E>
    where
        F: FnOnce(&mut TableView<'_>) -> Result<T, E>,
        E: From<TableError>;

    /// Unguarded read of an agent's own energy field. Only the owning agent
    /// writes that range outside the guard, so it cannot observe a lost
    /// update of its own; external readers must use `with_table`.
    fn read_own_energy(&self, slot: SlotId) -> Result<i32, TableError>;
}

/// In-process table with the same byte layout, for tests and tooling.
#[derive(Debug, Clone)]
pub struct InProcessTable {
    bytes: Arc<Mutex<Vec<u8>>>,
    population_limit: usize,
}

impl InProcessTable {
    pub fn new(population_limit: usize, initial_resources: i32) -> Self {
        let mut bytes = vec![0u8; table_size(population_limit)];
        TableView::new(&mut bytes, population_limit).reset(initial_resources);
        Self {
            bytes: Arc::new(Mutex::new(bytes)),
            population_limit,
        }
    }
}

impl PopulationStore for InProcessTable {
    fn population_limit(&self) -> usize {
        self.population_limit
    }

    fn with_table<T, E, F>(&self, f: F) -> Result<T, E>
    where
        F: FnOnce(&mut TableView<'_>) -> Result<T, E>,
        E: From<TableError>,
    {
        let mut guard = self.bytes.lock();
        let mut view = TableView::new(guard.as_mut_slice(), self.population_limit);
        f(&mut view)
    }

    fn read_own_energy(&self, slot: SlotId) -> Result<i32, TableError> {
        if slot.index() >= self.population_limit {
            return Err(LayoutError::OutOfRange {
                slot,
                limit: self.population_limit,
            }
            .into());
        }
        let guard = self.bytes.lock();
        Ok(read_i32(&guard, slot_offset(slot) + ENERGY_OFFSET))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_table_is_empty_with_seed_resources() {
        let table = InProcessTable::new(3, 4);
        table
            .with_table(|view| {
                assert_eq!(view.header()?, Header { resource_count: 4, event_flag: false });
                for slot in view.slot_ids() {
                    assert!(view.slot(slot)?.is_empty());
                }
                view.verify_invariants().map_err(|e| TableError::LockGuard(e.to_string()))?;
                Ok::<_, TableError>(())
            })
            .unwrap();
    }

    #[test]
    fn test_slot_write_read_back_through_layout() {
        let table = InProcessTable::new(4, 0);
        let record = SlotRecord::occupied(Species::Predator, 73);
        table
            .with_table(|view| {
                view.set_slot(SlotId(2), record)?;
                assert_eq!(view.slot(SlotId(2))?, record);
                Ok::<_, TableError>(())
            })
            .unwrap();
        assert_eq!(table.read_own_energy(SlotId(2)).unwrap(), 73);
    }

    #[test]
    fn test_out_of_range_slot_is_rejected() {
        let table = InProcessTable::new(2, 0);
        let result = table.with_table(|view| {
            view.set_slot(SlotId(2), SlotRecord::occupied(Species::Prey, 1))?;
            Ok::<_, TableError>(())
        });
        assert!(matches!(
            result,
            Err(TableError::Layout(LayoutError::OutOfRange { limit: 2, .. }))
        ));
        assert!(table.read_own_energy(SlotId(5)).is_err());
    }

    #[test]
    fn test_header_updates_keep_other_field() {
        let table = InProcessTable::new(1, 3);
        table
            .with_table(|view| {
                view.set_event_flag(true)?;
                view.set_resource_count(9)?;
                assert_eq!(view.header()?, Header { resource_count: 9, event_flag: true });
                view.set_event_flag(false)?;
                assert_eq!(view.resource_count()?, 9);
                Ok::<_, TableError>(())
            })
            .unwrap();
    }

    #[test]
    fn test_living_filters_species_and_dead_entries() {
        let table = InProcessTable::new(4, 0);
        let living = table
            .with_table(|view| {
                view.set_slot(SlotId(0), SlotRecord::occupied(Species::Prey, 10))?;
                view.set_slot(SlotId(1), SlotRecord::occupied(Species::Predator, 20))?;
                view.set_slot(SlotId(3), SlotRecord::occupied(Species::Prey, 30))?;
                Ok::<_, TableError>(view.living(Species::Prey)?)
            })
            .unwrap();
        assert_eq!(living, vec![(SlotId(0), 10), (SlotId(3), 30)]);
    }

    #[test]
    fn test_invariant_check_flags_empty_slot_with_energy() {
        let mut bytes = vec![0u8; table_size(2)];
        let mut view = TableView::new(&mut bytes, 2);
        view.reset(0);
        // corrupt slot 1 directly: kind empty, energy 5
        let offset = slot_offset(SlotId(1)) + ENERGY_OFFSET;
        view.bytes[offset] = 5;
        assert_eq!(
            view.verify_invariants(),
            Err(InvariantViolation::EmptyWithEnergy(SlotId(1), 5))
        );
    }
}
