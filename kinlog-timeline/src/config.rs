//! Engine configuration.

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use kinlog_crypto::{KdfParams, DEFAULT_ITERATIONS, MIN_ITERATIONS};
use serde::{Deserialize, Serialize};

use crate::error::{TimelineError, TimelineResult};

pub const ENV_KDF_ITERATIONS: &str = "KINLOG_KDF_ITERATIONS";
pub const ENV_PROBE_SIZE: &str = "KINLOG_PROBE_SIZE";
pub const ENV_DISCOVERY: &str = "KINLOG_DISCOVERY";
pub const ENV_SESSION_IDLE_SECS: &str = "KINLOG_SESSION_IDLE_SECS";

/// How candidate timelines are probed during discovery.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiscoveryStrategy {
    /// One candidate at a time, stopping at the first match.
    #[default]
    Sequential,
    /// Every candidate probed concurrently; the winner is still chosen in
    /// priority order.
    Parallel,
}

impl FromStr for DiscoveryStrategy {
    type Err = TimelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "sequential" => Ok(Self::Sequential),
            "parallel" => Ok(Self::Parallel),
            other => Err(TimelineError::Config(format!(
                "unknown discovery strategy {other:?}"
            ))),
        }
    }
}

/// Configuration for the timeline engine.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// PBKDF2 iterations for newly derived keys.
    pub kdf_iterations: u32,

    /// Most recent entries tried per candidate during discovery.
    pub probe_size: usize,

    pub discovery: DiscoveryStrategy,

    /// Session passwords are dropped after this much inactivity.
    pub session_idle_timeout_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            kdf_iterations: DEFAULT_ITERATIONS,
            probe_size: 3,
            discovery: DiscoveryStrategy::Sequential,
            session_idle_timeout_secs: 900, // 15 minutes
        }
    }
}

impl EngineConfig {
    /// Parses a JSON config. Missing fields take their defaults.
    pub fn from_json_str(json: &str) -> TimelineResult<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> TimelineResult<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| TimelineError::Config(format!("{}: {e}", path.display())))?;
        Self::from_json_str(&raw)
    }

    /// Applies `KINLOG_*` environment overrides.
    pub fn with_env_overrides(self) -> TimelineResult<Self> {
        self.apply_overrides(|name| std::env::var(name).ok())
    }

    /// Applies overrides from `lookup`, keyed by the `KINLOG_*` variable names.
    pub fn apply_overrides(
        mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> TimelineResult<Self> {
        if let Some(v) = lookup(ENV_KDF_ITERATIONS) {
            self.kdf_iterations = parse_number(ENV_KDF_ITERATIONS, &v)?;
        }
        if let Some(v) = lookup(ENV_PROBE_SIZE) {
            self.probe_size = parse_number(ENV_PROBE_SIZE, &v)?;
        }
        if let Some(v) = lookup(ENV_DISCOVERY) {
            self.discovery = v.parse()?;
        }
        if let Some(v) = lookup(ENV_SESSION_IDLE_SECS) {
            self.session_idle_timeout_secs = parse_number(ENV_SESSION_IDLE_SECS, &v)?;
        }
        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> TimelineResult<()> {
        if self.probe_size == 0 {
            return Err(TimelineError::Config("probe_size must be at least 1".into()));
        }
        if self.kdf_iterations < MIN_ITERATIONS {
            return Err(TimelineError::Config(format!(
                "kdf_iterations must be at least {MIN_ITERATIONS}, got {}",
                self.kdf_iterations
            )));
        }
        Ok(())
    }

    pub fn kdf_params(&self) -> KdfParams {
        KdfParams::new(self.kdf_iterations)
    }

    pub fn session_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.session_idle_timeout_secs)
    }
}

fn parse_number<T: FromStr>(name: &str, value: &str) -> TimelineResult<T>
where
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e| TimelineError::Config(format!("{name}={value:?}: {e}")))
}
