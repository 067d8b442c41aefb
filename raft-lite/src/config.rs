//! Tunable timing and sizing parameters for a replica.
//!
//! Every field has a default, so a JSON file only needs to name the values it
//! overrides. The binary layers command-line flags on top of the file.

use std::fs;
use std::path::Path;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors produced while loading or validating a [`RaftConfig`].
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Configuration surface of a replica.
///
/// Durations are stored as milliseconds so the JSON form stays flat.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RaftConfig {
    /// Lower bound of the randomized election timeout.
    pub election_timeout_min_ms: u64,
    /// Upper bound (inclusive) of the randomized election timeout.
    pub election_timeout_max_ms: u64,
    /// Interval between leader heartbeats.
    pub heartbeat_interval_ms: u64,
    /// How long a client request may stay unresolved before it is rejected.
    pub request_timeout_ms: u64,
    /// Largest serialized mutation accepted into the log.
    pub max_entry_bytes: usize,
    /// Largest number of entries carried by one AppendEntries message.
    pub max_entries_per_append: usize,
    /// Initial lower bound on the cluster size. Only ever grows at runtime.
    pub cluster_size_hint: usize,
    /// Append a no-op entry when a replica wins an election.
    pub noop_on_election: bool,
    /// Buffer size of the event bus channel.
    pub event_capacity: usize,
}

impl Default for RaftConfig {
    fn default() -> Self {
        Self {
            election_timeout_min_ms: 1500,
            election_timeout_max_ms: 3000,
            heartbeat_interval_ms: 500,
            request_timeout_ms: 15_000,
            max_entry_bytes: 48 * 1024,
            max_entries_per_append: 64,
            cluster_size_hint: 1,
            noop_on_election: false,
            event_capacity: 256,
        }
    }
}

impl RaftConfig {
    /// Loads a config from a JSON file, filling unspecified fields with defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let config: Self = serde_json::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Checks the invariants the replica relies on.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.election_timeout_min_ms == 0 {
            return Err(ConfigError::Invalid(
                "election_timeout_min_ms must be positive".into(),
            ));
        }
        if self.election_timeout_min_ms > self.election_timeout_max_ms {
            return Err(ConfigError::Invalid(format!(
                "election timeout range {}..{} is inverted",
                self.election_timeout_min_ms, self.election_timeout_max_ms
            )));
        }
        if self.heartbeat_interval_ms == 0
            || self.heartbeat_interval_ms >= self.election_timeout_min_ms
        {
            return Err(ConfigError::Invalid(format!(
                "heartbeat interval {}ms must be positive and shorter than the minimum election timeout {}ms",
                self.heartbeat_interval_ms, self.election_timeout_min_ms
            )));
        }
        if self.request_timeout_ms == 0 {
            return Err(ConfigError::Invalid("request_timeout_ms must be positive".into()));
        }
        if self.max_entry_bytes == 0 || self.max_entries_per_append == 0 {
            return Err(ConfigError::Invalid(
                "max_entry_bytes and max_entries_per_append must be positive".into(),
            ));
        }
        if self.cluster_size_hint == 0 {
            return Err(ConfigError::Invalid("cluster_size_hint must be at least 1".into()));
        }
        Ok(())
    }

    /// Draws a fresh election timeout, uniformly from the configured window.
    pub fn random_election_timeout(&self) -> Duration {
        let ms = rand::thread_rng()
            .gen_range(self.election_timeout_min_ms..=self.election_timeout_max_ms);
        Duration::from_millis(ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}
