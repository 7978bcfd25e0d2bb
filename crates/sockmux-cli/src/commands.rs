//! Command handlers for the sockmux CLI

use tracing::info;

use crate::app::SockmuxApp;
use crate::cli::{Cli, Commands};
use crate::error::Result;

/// Command dispatcher for handling CLI commands
pub struct CommandDispatcher;

impl CommandDispatcher {
    /// Execute a CLI command
    pub async fn execute(cli: Cli, app: SockmuxApp) -> Result<()> {
        match cli.command {
            Commands::Serve { port, .. } => Self::handle_serve_command(&app, port).await,
            Commands::Connect {
                host,
                port,
                message,
                hex,
                ..
            } => {
                let payload = message
                    .map(|m| Self::encode_message(&app, &m, hex))
                    .transpose()?;
                Self::handle_connect_command(&app, &host, port, payload).await
            }
        }
    }

    async fn handle_serve_command(app: &SockmuxApp, port: u32) -> Result<()> {
        info!("Starting server on port {}", port);
        app.serve(port).await
    }

    async fn handle_connect_command(
        app: &SockmuxApp,
        host: &str,
        port: u32,
        payload: Option<Vec<u8>>,
    ) -> Result<()> {
        info!("Connecting to {}:{}", host, port);
        app.connect(host, port, payload).await
    }

    /// Turn the `--message` argument into bytes
    pub fn encode_message(app: &SockmuxApp, message: &str, is_hex: bool) -> Result<Vec<u8>> {
        if is_hex {
            let digits: String = message.chars().filter(|c| !c.is_whitespace()).collect();
            let digits = digits.strip_prefix("0x").unwrap_or(&digits);
            return Ok(hex::decode(digits)?);
        }
        Ok(app.config().cli.encoding.encode(message).into_owned())
    }
}
