use clap::Parser;
use std::path::PathBuf;

use crate::config::AgentConfig;

#[derive(Parser, Debug, Clone)]
#[command(
    name = "capi-agent",
    version,
    about = "Test-control agent: line-oriented command server with a UDP traffic engine"
)]
pub struct Cli {
    /// Configuration file (TOML). Falls back to $CAPI_AGENT_CONFIG, then
    /// /etc/capi-agent/agent.toml, then built-in defaults.
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Control port, overrides [server].port
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Listen address, overrides [server].listen_address
    #[arg(long)]
    pub listen: Option<String>,

    /// Log filter (e.g. "debug", "capi_agent=trace"); RUST_LOG wins if set
    #[arg(long)]
    pub log_level: Option<String>,

    /// Emit logs as JSON lines
    #[arg(long, default_value_t = false)]
    pub json_logs: bool,

    /// Directory for per-stream frame record dumps, overrides [traffic].stats_dir
    #[arg(long)]
    pub stats_dir: Option<PathBuf>,
}

impl Cli {
    /// Fold command-line overrides into the loaded configuration.
    pub fn apply(&self, cfg: &mut AgentConfig) {
        if let Some(port) = self.port {
            cfg.server.port = port;
        }
        if let Some(addr) = &self.listen {
            cfg.server.listen_address = addr.clone();
        }
        if let Some(level) = &self.log_level {
            cfg.logging.level = level.clone();
        }
        if self.json_logs {
            cfg.logging.json = true;
        }
        if let Some(dir) = &self.stats_dir {
            cfg.traffic.stats_dir = Some(dir.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overrides_applied() {
        let cli = Cli::parse_from([
            "capi-agent",
            "--port",
            "9100",
            "--log-level",
            "debug",
            "--json-logs",
        ]);
        let mut cfg = AgentConfig::default();
        cli.apply(&mut cfg);
        assert_eq!(cfg.server.port, 9100);
        assert_eq!(cfg.server.listen_address, "0.0.0.0");
        assert_eq!(cfg.logging.level, "debug");
        assert!(cfg.logging.json);
        assert_eq!(cfg.traffic.stats_dir, None);
    }
}
