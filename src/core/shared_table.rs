use crate::core::layout::{slot_offset, table_size, LayoutError, SlotId, ENERGY_OFFSET};
use crate::storage::{PopulationStore, TableError, TableView};
use raw_sync::locks::{LockImpl, LockInit, Mutex};
use serde::{Deserialize, Serialize};
use shared_memory::{Shmem, ShmemConf, ShmemError};
use tracing::{debug, warn};

/// Names of the two OS-level resources an agent attaches to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceNames {
    pub shm: String,
    pub mutex: String,
}

impl ResourceNames {
    pub fn new(shm: impl Into<String>, mutex: impl Into<String>) -> Self {
        Self {
            shm: shm.into(),
            mutex: mutex.into(),
        }
    }
}

/// Population table in named shared memory, guarded by a process-shared
/// mutex that lives in its own named region.
///
/// The creating controller owns both names: dropping its handle unlinks
/// them. Agents open the names and never unlink.
pub struct SharedMemoryTable {
    // Field order is drop order: the lock goes before the memory it lives in.
    lock: Box<dyn LockImpl>,
    lock_region: Shmem,
    table_region: Shmem,
    population_limit: usize,
    names: ResourceNames,
}

// SAFETY: the raw pointers inside `Shmem` and the lock refer to process-shared
// mappings that stay valid for the lifetime of this value. Table bytes are
// only mutated through `with_table`, which holds the cross-process mutex;
// `read_own_energy` is a volatile read of a single-writer field.
unsafe impl Send for SharedMemoryTable {}
unsafe impl Sync for SharedMemoryTable {}

impl std::fmt::Debug for SharedMemoryTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedMemoryTable")
            .field("names", &self.names)
            .field("population_limit", &self.population_limit)
            .field("owner", &self.table_region.is_owner())
            .finish()
    }
}

fn lock_region_size() -> usize {
    (Mutex::size_of(None) + 63) & !63
}

impl SharedMemoryTable {
    /// Create both regions, initialise the lock and seed the header.
    /// Regions left behind by a crashed run are reclaimed first.
    pub fn create(
        names: &ResourceNames,
        population_limit: usize,
        initial_resources: i32,
    ) -> Result<Self, TableError> {
        let table_region = create_region(&names.shm, table_size(population_limit))?;
        let lock_region = create_region(&names.mutex, lock_region_size())?;

        let lock = {
            let mut retry_count = 0;
            let max_retries = 3;
            loop {
                match unsafe { Mutex::new(lock_region.as_ptr(), table_region.as_ptr()) } {
                    Ok(mutex) => break mutex.0,
                    Err(e) => {
                        retry_count += 1;
                        if retry_count >= max_retries {
                            return Err(TableError::LockInit(format!(
                                "failed to create mutex after {} retries: {}",
                                max_retries, e
                            )));
                        }
                        std::thread::sleep(std::time::Duration::from_millis(10));
                    }
                }
            }
        };

        let table = Self {
            lock,
            lock_region,
            table_region,
            population_limit,
            names: names.clone(),
        };
        table.with_table(|view| {
            view.reset(initial_resources);
            Ok::<_, TableError>(())
        })?;
        debug!(shm = %names.shm, mutex = %names.mutex, population_limit, "population table created");
        Ok(table)
    }

    /// Attach to regions created by the controller.
    pub fn open(names: &ResourceNames, population_limit: usize) -> Result<Self, TableError> {
        let expected = table_size(population_limit);
        let table_region = ShmemConf::new()
            .os_id(&names.shm)
            .open()
            .map_err(|source| shmem_error(&names.shm, source))?;
        if table_region.len() < expected {
            return Err(TableError::RegionTooSmall {
                expected,
                actual: table_region.len(),
            });
        }
        let lock_region = ShmemConf::new()
            .os_id(&names.mutex)
            .open()
            .map_err(|source| shmem_error(&names.mutex, source))?;

        let lock = match unsafe { Mutex::from_existing(lock_region.as_ptr(), table_region.as_ptr()) }
        {
            Ok(mutex) => mutex.0,
            Err(e) => {
                return Err(TableError::LockInit(format!(
                    "failed to open existing mutex {}: {}",
                    names.mutex, e
                )))
            }
        };

        Ok(Self {
            lock,
            lock_region,
            table_region,
            population_limit,
            names: names.clone(),
        })
    }

    pub fn names(&self) -> &ResourceNames {
        &self.names
    }

    pub fn is_owner(&self) -> bool {
        self.table_region.is_owner() && self.lock_region.is_owner()
    }
}

impl PopulationStore for SharedMemoryTable {
    fn population_limit(&self) -> usize {
        self.population_limit
    }

    fn with_table<T, E, F>(&self, f: F) -> Result<T, E>
    where
        F: FnOnce(&mut TableView<'_>) -> Result<T, E>,
        E: From<TableError>,
    {
        let guard = self
            .lock
            .lock()
            .map_err(|e| TableError::LockGuard(e.to_string()))?;

        // SAFETY: the guard's data pointer is the start of the table mapping,
        // which is at least `table_size(population_limit)` bytes (checked at
        // create/open). The cross-process mutex is held until `guard` drops,
        // which also happens when `f` unwinds.
        let bytes = unsafe {
            std::slice::from_raw_parts_mut(*guard, table_size(self.population_limit))
        };
        let mut view = TableView::new(bytes, self.population_limit);
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
        let base = self.table_region.as_ptr();
        let offset = slot_offset(slot) + ENERGY_OFFSET;
        let mut word = [0u8; 4];
        for (i, byte) in word.iter_mut().enumerate() {
            // SAFETY: offset + i lies inside the mapping (range checked above).
            *byte = unsafe { std::ptr::read_volatile(base.add(offset + i)) };
        }
        Ok(i32::from_le_bytes(word))
    }
}

fn create_region(name: &str, size: usize) -> Result<Shmem, TableError> {
    match ShmemConf::new().os_id(name).size(size).create() {
        Ok(shm) => Ok(shm),
        Err(ShmemError::MappingIdExists) => {
            warn!(name, "reclaiming shared memory left by a previous run");
            reclaim(name);
            ShmemConf::new()
                .os_id(name)
                .size(size)
                .create()
                .map_err(|source| shmem_error(name, source))
        }
        Err(source) => Err(shmem_error(name, source)),
    }
}

/// Unlink a named region by taking ownership of it and dropping the handle.
fn reclaim(name: &str) {
    if let Ok(mut stale) = ShmemConf::new().os_id(name).open() {
        let _ = stale.set_owner(true);
    }
}

fn shmem_error(name: &str, source: ShmemError) -> TableError {
    TableError::Shmem {
        name: name.to_string(),
        source,
    }
}
