//! Unified error handling for circle-of-life
//!
//! Subsystems keep their own `thiserror` enums; `SimError` classifies them
//! so callers can tell recoverable conditions (capacity, connection) from
//! resource failures that should stop the process.

use crate::commands::parser::CommandError;
use crate::config::ConfigError;
use crate::core::layout::LayoutError;
use crate::rendezvous::{JoinError, ProtocolError};
use crate::storage::TableError;
use crate::supervisor::ProcessError;
use std::io;
use thiserror::Error;

pub type SimResult<T> = Result<T, SimError>;

#[derive(Error, Debug)]
pub enum SimError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Population table error: {0}")]
    Table(#[from] TableError),

    #[error("Layout error: {0}")]
    Layout(#[from] LayoutError),

    #[error("Join failed: {0}")]
    Join(#[from] JoinError),

    #[error("Protocol violation: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Process error: {0}")]
    Process(#[from] ProcessError),

    #[error("Command error: {0}")]
    Command(#[from] CommandError),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    Configuration,
    Resource,
    Network,
    Protocol,
    Process,
    Validation,
}

impl ErrorCategory {
    pub fn display_name(&self) -> &'static str {
        match self {
            ErrorCategory::Configuration => "Configuration",
            ErrorCategory::Resource => "Resource",
            ErrorCategory::Network => "Network",
            ErrorCategory::Protocol => "Protocol",
            ErrorCategory::Process => "Process",
            ErrorCategory::Validation => "Validation",
        }
    }
}

impl SimError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            SimError::Config(_) => ErrorCategory::Configuration,
            SimError::Table(_) | SimError::Layout(_) => ErrorCategory::Resource,
            SimError::Join(_) | SimError::Io(_) => ErrorCategory::Network,
            SimError::Protocol(_) => ErrorCategory::Protocol,
            SimError::Process(_) => ErrorCategory::Process,
            SimError::Command(_) => ErrorCategory::Validation,
        }
    }

    /// Connection failures and rejected input never take a process down.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self.category(),
            ErrorCategory::Network | ErrorCategory::Protocol | ErrorCategory::Validation
        )
    }
}
