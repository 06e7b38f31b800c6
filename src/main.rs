use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;

use capi_agent::agent::AgentState;
use capi_agent::cli::Cli;
use capi_agent::config::AgentConfig;
use capi_agent::dispatch::{Dispatcher, RegistryBuilder};
use capi_agent::handlers::register_builtin;
use capi_agent::logging;
use capi_agent::server::Server;

fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut cfg = logging::with_startup(cli.log_level.as_deref(), || {
        AgentConfig::resolve(cli.config.as_deref())
    })?;
    cli.apply(&mut cfg);
    logging::init(&cfg.logging);
    cfg.validate()?;

    let mut builder = RegistryBuilder::new();
    register_builtin(&mut builder).context("registering built-in commands")?;
    let registry = builder.build();
    info!(commands = registry.len(), "command table ready");

    let server = Server::bind(
        &cfg.listen_addr(),
        Dispatcher::new(registry),
        AgentState::new(&cfg),
        cfg.server.max_cmd_len,
    )?;
    server.run()
}
