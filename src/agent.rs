use std::path::PathBuf;

use tracing::error;

use crate::config::{AgentConfig, DeviceConfig};
use crate::traffic::StreamRegistry;

/// Everything command processors accumulate across commands.
///
/// Owned by the control loop and handed to one processor at a time.
pub struct AgentState {
    pub streams: StreamRegistry,
    pub device: DeviceConfig,
    /// Where `traffic_agent_receive_stop` dumps frame records, if anywhere.
    pub stats_dir: Option<PathBuf>,
    fatal: Option<String>,
}

impl AgentState {
    pub fn new(config: &AgentConfig) -> Self {
        Self {
            streams: StreamRegistry::new(config.engine_options()),
            device: config.device.clone(),
            stats_dir: config.traffic.stats_dir.clone(),
            fatal: None,
        }
    }

    /// Record an internal failure the process cannot recover from. The
    /// control loop shuts down after the current response is sent.
    pub fn set_fatal(&mut self, why: String) {
        error!(reason = %why, "fatal internal error");
        self.fatal.get_or_insert(why);
    }

    pub fn take_fatal(&mut self) -> Option<String> {
        self.fatal.take()
    }
}

impl Default for AgentState {
    fn default() -> Self {
        Self::new(&AgentConfig::default())
    }
}
