//! TOML configuration for the agent.
//!
//! Every field has a default, so an empty file (or no file at all) yields a
//! working agent listening on port 9000.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::proto::MAX_CMD_LEN;
use crate::traffic::{EngineOptions, MAX_RECORDS, MAX_STREAMS};

pub const CONFIG_ENV: &str = "CAPI_AGENT_CONFIG";
const SYSTEM_CONFIG: &str = "/etc/capi-agent/agent.toml";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub traffic: TrafficConfig,
    #[serde(default)]
    pub device: DeviceConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl AgentConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let config: Self = toml::from_str(&content)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?;
        config.validate()?;
        info!(path = %path.display(), "loaded agent configuration");
        Ok(config)
    }

    /// Resolve the configuration, in order:
    /// 1. `explicit` (an error if it cannot be loaded),
    /// 2. the file named by `CAPI_AGENT_CONFIG`,
    /// 3. `/etc/capi-agent/agent.toml`,
    /// 4. compiled-in defaults.
    pub fn resolve(explicit: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit {
            return Self::load(path);
        }

        if let Ok(env_path) = std::env::var(CONFIG_ENV) {
            let path = PathBuf::from(env_path);
            match Self::load(&path) {
                Ok(cfg) => return Ok(cfg),
                Err(e) => warn!(
                    path = %path.display(),
                    error = %e,
                    "{} set but file could not be loaded, trying fallback",
                    CONFIG_ENV
                ),
            }
        }

        let system_path = Path::new(SYSTEM_CONFIG);
        if system_path.exists() {
            match Self::load(system_path) {
                Ok(cfg) => return Ok(cfg),
                Err(e) => warn!(
                    path = %system_path.display(),
                    error = %e,
                    "system config file could not be loaded, using defaults"
                ),
            }
        }

        debug!("no config file found, using compiled-in defaults");
        Ok(Self::default())
    }

    pub fn validate(&self) -> Result<()> {
        let t = &self.traffic;
        if t.max_streams == 0 || t.max_streams > MAX_STREAMS {
            bail!("traffic.max_streams must be 1..={}", MAX_STREAMS);
        }
        if t.max_records == 0 {
            bail!("traffic.max_records must be positive");
        }
        if t.recv_poll_ms == 0 || t.uapsd_retry_wait_ms == 0 {
            bail!("traffic poll intervals must be positive");
        }
        if self.server.max_cmd_len < 16 {
            bail!("server.max_cmd_len too small");
        }
        Ok(())
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.server.listen_address, self.server.port)
    }

    pub fn engine_options(&self) -> EngineOptions {
        let t = &self.traffic;
        EngineOptions {
            max_streams: t.max_streams,
            max_records: t.max_records,
            stop_grace: Duration::from_millis(t.stop_grace_ms),
            recv_poll: Duration::from_millis(t.recv_poll_ms),
            uapsd_retry_wait: Duration::from_millis(t.uapsd_retry_wait_ms),
            uapsd_max_retry: t.uapsd_max_retry,
            no_timestamps: t.no_timestamps,
            payload_override: t.throughput_pktsize,
        }
    }
}

// ---------------------------------------------------------------------------
// Server
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub listen_address: String,
    pub port: u16,
    /// Longest accepted command line in bytes.
    pub max_cmd_len: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_address: "0.0.0.0".to_string(),
            port: 9000,
            max_cmd_len: MAX_CMD_LEN,
        }
    }
}

// ---------------------------------------------------------------------------
// Traffic
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrafficConfig {
    pub max_streams: usize,
    pub max_records: usize,
    pub stop_grace_ms: u64,
    pub recv_poll_ms: u64,
    pub uapsd_retry_wait_ms: u64,
    pub uapsd_max_retry: u32,
    /// Send zeroed timestamp words.
    pub no_timestamps: bool,
    /// Payload size for file-transfer senders, 0 = use the command's value.
    pub throughput_pktsize: usize,
    /// Where `e2e<id>.txt` record dumps go; unset = not written.
    pub stats_dir: Option<PathBuf>,
}

impl Default for TrafficConfig {
    fn default() -> Self {
        Self {
            max_streams: MAX_STREAMS,
            max_records: MAX_RECORDS,
            stop_grace_ms: 5_000,
            recv_poll_ms: 100,
            uapsd_retry_wait_ms: 100,
            uapsd_max_retry: 300,
            no_timestamps: false,
            throughput_pktsize: 0,
            stats_dir: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Device
// ---------------------------------------------------------------------------

/// Identity reported by `device_get_info`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    pub vendor: String,
    pub model: String,
    pub interface: Option<String>,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            vendor: "Generic".to_string(),
            model: "DUT".to_string(),
            interface: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Logging
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `tracing` filter directive, overridden by `RUST_LOG`.
    pub level: String,
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let cfg = AgentConfig::default();
        cfg.validate().unwrap();
        assert_eq!(cfg.listen_addr(), "0.0.0.0:9000");
        let opts = cfg.engine_options();
        assert_eq!(opts.max_streams, 16);
        assert_eq!(opts.max_records, 6000);
        assert_eq!(opts.stop_grace, Duration::from_secs(5));
    }

    #[test]
    fn partial_file_keeps_defaults() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("agent.toml");
        std::fs::write(
            &path,
            "[server]\nport = 9100\n\n[traffic]\nno_timestamps = true\nstats_dir = \"/tmp/e2e\"\n",
        )
        .unwrap();

        let cfg = AgentConfig::resolve(Some(&path)).unwrap();
        assert_eq!(cfg.server.port, 9100);
        assert_eq!(cfg.server.max_cmd_len, MAX_CMD_LEN);
        assert!(cfg.traffic.no_timestamps);
        assert_eq!(cfg.traffic.stats_dir, Some(PathBuf::from("/tmp/e2e")));
        assert_eq!(cfg.device.vendor, "Generic");
    }

    #[test]
    fn explicit_missing_file_is_an_error() {
        let dir = tempfile::TempDir::new().unwrap();
        assert!(AgentConfig::resolve(Some(&dir.path().join("nope.toml"))).is_err());
    }

    #[test]
    fn out_of_range_streams_rejected() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("agent.toml");
        std::fs::write(&path, "[traffic]\nmax_streams = 32\n").unwrap();
        assert!(AgentConfig::load(&path).is_err());
    }
}
