//! Escrow CLI entry point

use anyhow::Context;
use clap::Parser;
use tracing::info;

use escrow_cli::{cli::Cli, commands::CommandDispatcher, config::CliAppConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    setup_logging(cli.verbose, cli.log_level.as_deref())?;

    let config = CliAppConfig::load(cli.config.as_deref()).context("loading configuration")?;

    CommandDispatcher::execute(cli, config)
        .await
        .context("command failed")?;

    info!("Escrow CLI exited successfully");
    Ok(())
}

/// Setup logging from `--log-level`, falling back to `--verbose`
fn setup_logging(verbose: bool, log_level: Option<&str>) -> anyhow::Result<()> {
    let level = match log_level {
        Some(level) => level
            .parse::<tracing::Level>()
            .map_err(|_| anyhow::anyhow!("unknown log level '{}'", level))?,
        None if verbose => tracing::Level::DEBUG,
        None => tracing::Level::WARN,
    };

    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .with_writer(std::io::stderr)
        .init();
    Ok(())
}
