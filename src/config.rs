// configuration for a distributed shot run.
//
// values come from built-in defaults, then an optional json file, then
// environment variables (QB_SHOTS_* and the rank/size variables exported by
// common mpi launchers).

use std::env;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// receive timeout per peer probe.
pub const DEFAULT_RECEIVE_TIMEOUT_MS: u64 = 30_000;

// message substrate used between processes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    Local,
    Tcp,
    Mpi,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DistributedConfig {
    pub process_id: usize,
    pub total_processes: usize,
    pub supervisor_address: String,
    pub port: u16,
    pub backend: Backend,
    pub receive_timeout_ms: u64,
    pub poll_interval_ms: u64,
    pub connect_retries: u32,
    pub connect_retry_delay_ms: u64,
}

impl Default for DistributedConfig {
    fn default() -> Self {
        Self {
            process_id: 0,
            total_processes: 1,
            supervisor_address: "localhost".to_string(),
            port: 9000,
            backend: Backend::Tcp,
            receive_timeout_ms: DEFAULT_RECEIVE_TIMEOUT_MS,
            poll_interval_ms: 1,
            connect_retries: 5,
            connect_retry_delay_ms: 2000,
        }
    }
}

impl DistributedConfig {
    /// loads `path` (json) if given, then applies environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => {
                let content = std::fs::read_to_string(path)?;
                serde_json::from_str(&content)?
            }
            None => DistributedConfig::default(),
        };
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self) -> Result<()> {
        // launcher variables first so explicit QB_SHOTS_* settings win
        for (rank_var, size_var) in [
            ("OMPI_COMM_WORLD_RANK", "OMPI_COMM_WORLD_SIZE"),
            ("PMI_RANK", "PMI_SIZE"),
        ] {
            if let Some(rank) = env_parse(rank_var)? {
                self.process_id = rank;
            }
            if let Some(size) = env_parse(size_var)? {
                self.total_processes = size;
            }
        }

        if let Some(rank) = env_parse("QB_SHOTS_RANK")? {
            self.process_id = rank;
        }
        if let Some(size) = env_parse("QB_SHOTS_SIZE")? {
            self.total_processes = size;
        }
        if let Ok(addr) = env::var("QB_SHOTS_SUPERVISOR") {
            self.supervisor_address = addr;
        }
        if let Some(port) = env_parse("QB_SHOTS_PORT")? {
            self.port = port;
        }
        if let Some(timeout) = env_parse("QB_SHOTS_TIMEOUT_MS")? {
            self.receive_timeout_ms = timeout;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.total_processes == 0 {
            return Err(Error::Config("total_processes must be at least 1".into()));
        }
        if self.process_id >= self.total_processes {
            return Err(Error::Config(format!(
                "process_id {} is outside a run of {} processes",
                self.process_id, self.total_processes
            )));
        }
        if self.receive_timeout_ms == 0 {
            return Err(Error::Config("receive_timeout_ms must be non-zero".into()));
        }
        Ok(())
    }

    pub fn receive_timeout(&self) -> Duration {
        Duration::from_millis(self.receive_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Result<Option<T>> {
    match env::var(name) {
        Ok(val) => val
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| Error::Config(format!("{} has an invalid value '{}'", name, val))),
        Err(_) => Ok(None),
    }
}
