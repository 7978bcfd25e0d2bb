//! Sockmux CLI entry point

use anyhow::Context;
use clap::Parser;
use tracing::{error, info};

use sockmux_cli::{
    app::SockmuxApp, cli::Cli, commands::CommandDispatcher, config::CliAppConfig, error::Result,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse command line arguments
    let cli = Cli::parse();

    // Load configuration, then let flags override it
    let mut config = load_configuration(&cli).context("failed to load configuration")?;
    config
        .apply_overrides(&cli)
        .context("invalid command-line overrides")?;

    // Initialize logging
    setup_logging(config.cli.verbose);

    let app = SockmuxApp::new(config);

    if let Err(e) = CommandDispatcher::execute(cli, app).await {
        error!("Command execution failed: {}", e);
        std::process::exit(1);
    }

    info!("sockmux exited successfully");
    Ok(())
}

/// Setup logging based on verbosity level
fn setup_logging(verbose: bool) {
    let log_level = if verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };

    tracing_subscriber::fmt()
        .with_max_level(log_level)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .init();
}

/// Load configuration from file or use defaults
fn load_configuration(cli: &Cli) -> Result<CliAppConfig> {
    match &cli.config {
        Some(config_path) => CliAppConfig::load_from_file(config_path),
        None => Ok(CliAppConfig::default()),
    }
}
