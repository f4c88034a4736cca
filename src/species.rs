use crate::config::{SimConfig, SpeciesConfig};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Species {
    Prey,
    Predator,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown species token: {0:?}")]
pub struct UnknownSpecies(pub String);

impl Species {
    pub const ALL: [Species; 2] = [Species::Prey, Species::Predator];

    /// Join-protocol token.
    pub fn token(&self) -> &'static str {
        match self {
            Species::Prey => "prey",
            Species::Predator => "predator",
        }
    }

    /// Kind byte stored in the population table.
    pub fn code(&self) -> u8 {
        match self {
            Species::Prey => 1,
            Species::Predator => 2,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(Species::Prey),
            2 => Some(Species::Predator),
            _ => None,
        }
    }

    pub fn plural(&self) -> &'static str {
        match self {
            Species::Prey => "preys",
            Species::Predator => "predators",
        }
    }

    pub fn settings<'a>(&self, config: &'a SimConfig) -> &'a SpeciesConfig {
        match self {
            Species::Prey => &config.prey,
            Species::Predator => &config.predator,
        }
    }
}

impl fmt::Display for Species {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.token())
    }
}

impl FromStr for Species {
    type Err = UnknownSpecies;

    /// Exact tokens only; the shell handles plurals and casing.
    fn from_str(token: &str) -> Result<Self, Self::Err> {
        match token {
            "prey" => Ok(Species::Prey),
            "predator" => Ok(Species::Predator),
            other => Err(UnknownSpecies(other.to_string())),
        }
    }
}
