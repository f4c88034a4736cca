use serde::{Deserialize, Serialize};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::ops::RangeInclusive;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

pub const SHM_NAME: &str = "/circle_of_life_shm";
pub const MUTEX_NAME: &str = "/circle_of_life_sem";
pub const LISTEN_ADDRESS: Ipv4Addr = Ipv4Addr::LOCALHOST;
pub const LISTEN_PORT: u16 = 15789;

pub const POPULATION_LIMIT: usize = 10;
pub const GRASS_LIMIT: i32 = 4;
pub const MAX_ENERGY: i32 = 100;

// Agents receive the controller's effective configuration through this variable
pub const CONFIG_ENV: &str = "CIRCLE_OF_LIFE_CONFIG";
pub const ENV_PREFIX: &str = "CIRCLE_OF_LIFE";

pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
pub const DRAIN_ACK_TIMEOUT: Duration = Duration::from_secs(5);
pub const MAX_REQUEST_BYTES: u64 = 1024;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),
    #[error("invalid {CONFIG_ENV} payload: {0}")]
    Payload(#[from] serde_json::Error),
    #[error("invalid configuration: {field} {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// Inclusive millisecond interval, sampled uniformly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntervalMs {
    pub min: u64,
    pub max: u64,
}

impl IntervalMs {
    pub const fn new(min: u64, max: u64) -> Self {
        Self { min, max }
    }

    pub fn range(&self) -> RangeInclusive<u64> {
        self.min..=self.max
    }
}

/// Per-species metabolism settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpeciesConfig {
    /// Energy lost per tick, sampled from `[cost_min, cost_max]`.
    pub cost_min: i32,
    pub cost_max: i32,
    /// Below this energy the individual tries to feed. For prey it is also
    /// the weakness threshold predators hunt for.
    pub hunger_threshold: i32,
    /// Above this energy a reproduction attempt may trigger.
    pub reproduction_threshold: i32,
    pub reproduction_probability: f64,
    /// Energy gained by one successful meal.
    pub nutrient: i32,
    pub tick_interval: IntervalMs,
}

impl SpeciesConfig {
    pub fn prey() -> Self {
        Self {
            cost_min: 1,
            cost_max: 5,
            hunger_threshold: 40,
            reproduction_threshold: 80,
            reproduction_probability: 0.05,
            nutrient: 20,
            tick_interval: IntervalMs::new(500, 1500),
        }
    }

    pub fn predator() -> Self {
        Self {
            cost_min: 2,
            cost_max: 6,
            hunger_threshold: 40,
            reproduction_threshold: 85,
            reproduction_probability: 0.03,
            nutrient: 50,
            tick_interval: IntervalMs::new(800, 2000),
        }
    }

    pub fn cost_range(&self) -> RangeInclusive<i32> {
        self.cost_min..=self.cost_max
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimConfig {
    pub population_limit: usize,
    pub resource_limit: i32,
    pub initial_resources: i32,
    pub max_energy: i32,
    pub shm_name: String,
    pub mutex_name: String,
    pub listen_address: Ipv4Addr,
    pub listen_port: u16,
    pub growth_interval: IntervalMs,
    /// How often a drought window is armed.
    pub drought_period_ms: u64,
    /// Growth ticks skipped once a drought is armed.
    pub drought_ticks: u32,
    pub reaper_interval_ms: u64,
    /// Time a bare-joined slot may stay unattached before it is reclaimed.
    pub join_grace_ms: u64,
    pub prey: SpeciesConfig,
    pub predator: SpeciesConfig,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            population_limit: POPULATION_LIMIT,
            resource_limit: GRASS_LIMIT,
            initial_resources: GRASS_LIMIT,
            max_energy: MAX_ENERGY,
            shm_name: SHM_NAME.to_string(),
            mutex_name: MUTEX_NAME.to_string(),
            listen_address: LISTEN_ADDRESS,
            listen_port: LISTEN_PORT,
            growth_interval: IntervalMs::new(1000, 3000),
            drought_period_ms: 30_000,
            drought_ticks: 5,
            reaper_interval_ms: 250,
            join_grace_ms: 2 * HANDSHAKE_TIMEOUT.as_millis() as u64,
            prey: SpeciesConfig::prey(),
            predator: SpeciesConfig::predator(),
        }
    }
}

impl SimConfig {
    /// Layer defaults, an optional TOML file and `CIRCLE_OF_LIFE__*`
    /// environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut builder =
            config::Config::builder().add_source(config::Config::try_from(&Self::default())?);
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }
        let loaded: Self = builder
            .add_source(config::Environment::with_prefix(ENV_PREFIX).separator("__"))
            .build()?
            .try_deserialize()?;
        loaded.validate()?;
        Ok(loaded)
    }

    /// Configuration handed down by the controller, or the compiled-in
    /// defaults when the agent was started by hand.
    pub fn from_agent_env() -> Result<Self, ConfigError> {
        match std::env::var(CONFIG_ENV) {
            Ok(payload) => {
                let config: Self = serde_json::from_str(&payload)?;
                config.validate()?;
                Ok(config)
            }
            Err(_) => Ok(Self::default()),
        }
    }

    pub fn to_agent_env(&self) -> Result<String, ConfigError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn listen_socket(&self) -> SocketAddr {
        SocketAddr::V4(SocketAddrV4::new(self.listen_address, self.listen_port))
    }

    pub fn reaper_interval(&self) -> Duration {
        Duration::from_millis(self.reaper_interval_ms)
    }

    pub fn drought_period(&self) -> Duration {
        Duration::from_millis(self.drought_period_ms)
    }

    pub fn join_grace(&self) -> Duration {
        Duration::from_millis(self.join_grace_ms)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        fn invalid(field: &'static str, reason: impl Into<String>) -> ConfigError {
            ConfigError::Invalid {
                field,
                reason: reason.into(),
            }
        }

        if self.population_limit == 0 {
            return Err(invalid("population_limit", "must be at least 1"));
        }
        if self.resource_limit < 0 {
            return Err(invalid("resource_limit", "must not be negative"));
        }
        if !(0..=self.resource_limit).contains(&self.initial_resources) {
            return Err(invalid(
                "initial_resources",
                format!("must lie in [0, {}]", self.resource_limit),
            ));
        }
        if self.max_energy <= 0 {
            return Err(invalid("max_energy", "must be positive"));
        }
        if self.shm_name.is_empty() || self.mutex_name.is_empty() {
            return Err(invalid("shm_name/mutex_name", "must not be empty"));
        }
        if self.shm_name.contains(char::is_whitespace)
            || self.mutex_name.contains(char::is_whitespace)
        {
            return Err(invalid("shm_name/mutex_name", "must not contain whitespace"));
        }
        if self.growth_interval.min > self.growth_interval.max {
            return Err(invalid("growth_interval", "min exceeds max"));
        }
        for (field, species) in [("prey", &self.prey), ("predator", &self.predator)] {
            if species.cost_min <= 0 || species.cost_min > species.cost_max {
                return Err(invalid(field, "energy cost range must be positive and ordered"));
            }
            if species.hunger_threshold > self.max_energy
                || species.reproduction_threshold > self.max_energy
            {
                return Err(invalid(field, "thresholds must not exceed max_energy"));
            }
            if !(0.0..=1.0).contains(&species.reproduction_probability) {
                return Err(invalid(field, "reproduction_probability must lie in [0, 1]"));
            }
            if species.nutrient < 0 {
                return Err(invalid(field, "nutrient must not be negative"));
            }
            if species.tick_interval.min > species.tick_interval.max {
                return Err(invalid(field, "tick interval min exceeds max"));
            }
        }
        Ok(())
    }
}
