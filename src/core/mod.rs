//! Shared population table
//!
//! Byte layout and the named shared-memory backend

pub mod layout;
pub mod shared_table;
