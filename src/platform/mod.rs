//! OS process helpers for spawned agents

#[cfg(unix)]
mod unix;

#[cfg(unix)]
pub use unix::*;
