use crate::error::ConfigError;
use crate::protocol::WorkerId;
use anyhow::{Context as AnyhowContext, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

pub const DEFAULT_RELAY_ADDR: &str = "127.0.0.1:1337";
pub const DEFAULT_SCHEDULER_URL: &str = "http://127.0.0.1:5000";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Proposed id; the scheduler may hand back a different one.
    pub worker_id: Option<WorkerId>,
    pub scheduler_url: String,
    pub relay_addr: String,
    /// Where the direct-channel listener binds.
    pub data_bind: SocketAddr,
    /// Address offered to peers during the handshake, if not `data_bind`.
    pub advertise_addr: Option<SocketAddr>,
    pub n_cores: usize,
    pub batch_delay_ms: u64,
    pub resend_delay_ms: u64,
    pub heartbeat_interval_ms: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_id: None,
            scheduler_url: DEFAULT_SCHEDULER_URL.to_string(),
            relay_addr: DEFAULT_RELAY_ADDR.to_string(),
            data_bind: SocketAddr::from(([127, 0, 0, 1], 0)),
            advertise_addr: None,
            n_cores: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
            batch_delay_ms: 1000,
            resend_delay_ms: 500,
            heartbeat_interval_ms: 5000,
        }
    }
}

impl WorkerConfig {
    pub fn from_yaml_str(content: &str) -> Result<Self, ConfigError> {
        let config: WorkerConfig = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.batch_delay_ms == 0 {
            return Err(ConfigError::ZeroInterval("batch_delay_ms"));
        }
        if self.resend_delay_ms == 0 {
            return Err(ConfigError::ZeroInterval("resend_delay_ms"));
        }
        if self.heartbeat_interval_ms == 0 {
            return Err(ConfigError::ZeroInterval("heartbeat_interval_ms"));
        }
        if self.resend_delay_ms >= self.batch_delay_ms {
            return Err(ConfigError::ResendNotShorter {
                resend_ms: self.resend_delay_ms,
                batch_ms: self.batch_delay_ms,
            });
        }
        if self.data_bind.ip().is_unspecified() && self.advertise_addr.is_none() {
            return Err(ConfigError::MissingAdvertiseAddr(self.data_bind));
        }
        Ok(())
    }

    pub fn batch_delay(&self) -> Duration {
        Duration::from_millis(self.batch_delay_ms)
    }

    pub fn resend_delay(&self) -> Duration {
        Duration::from_millis(self.resend_delay_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }
}

pub fn load_worker_config(path: impl AsRef<Path>) -> Result<WorkerConfig> {
    let path = path.as_ref();
    let yaml_content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read worker config from {}", path.display()))?;

    let config = WorkerConfig::from_yaml_str(&yaml_content)
        .with_context(|| format!("Failed to load worker config from {}", path.display()))?;

    Ok(config)
}
