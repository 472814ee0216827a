use anyhow::Context;
use chatflow::config::{ConfigManager, EngineConfig};
use chatflow::logger::{LogConfig, init_tracing};
use clap::Parser;
use tracing::info;

mod cli;

use cli::{Cli, CliContext};

#[tokio::main(flavor = "multi_thread", worker_threads = 4)]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    init_tracing(&LogConfig::new(cli.log_level, cli.log_dir.clone()))?;

    let config = ConfigManager::env(cli.env_file.clone());
    let engine = EngineConfig::load(&config)
        .await
        .context("invalid engine configuration")?;
    info!(?engine, "configuration loaded");

    let context = CliContext::new(config, engine);
    cli::execute(&context, cli.command).await
}
