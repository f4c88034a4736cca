//! Circle of Life
//!
//! A predator/prey ecosystem run by cooperating OS processes: a controller
//! owns a population table in named shared memory, guarded by a
//! cross-process mutex, and admits agent processes through a loopback TCP
//! rendezvous.

pub mod agent;
pub mod allocator;
pub mod commands;
pub mod config;
pub mod core;
pub mod error;
pub mod help;
pub mod manager;
pub mod platform;
pub mod rendezvous;
pub mod shell;
pub mod signal;
pub mod species;
pub mod storage;
pub mod supervisor;
pub mod utils;

// Re-export commonly used types for convenience
pub use config::SimConfig;
pub use core::layout::{Header, SlotId, SlotKind, SlotRecord};
pub use core::shared_table::{ResourceNames, SharedMemoryTable};
pub use error::{SimError, SimResult};
pub use manager::EnvironmentManager;
pub use species::Species;
pub use storage::{InProcessTable, PopulationStore, TableError, TableView};
pub use supervisor::ProcessError;
