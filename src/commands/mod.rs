//! Command parsing and routing

pub mod parser;

pub use parser::*;
