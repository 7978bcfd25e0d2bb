//! Sockmux CLI configuration
//!
//! Configuration is read from an optional TOML file and then overridden by
//! command-line flags:
//!
//! ```toml
//! [session]
//! timeout = 30000
//! read_buffer_size = 1024
//! nodelay = true
//!
//! [cli]
//! echo = false
//! always_hex = false
//! encoding = "utf-8"
//! ```

use std::path::Path;

use serde::{Deserialize, Serialize};
use sockmux_core::SessionConfig;
use sockmux_runtime::TextEncoding;

use crate::cli::{Cli, Commands};
use crate::error::{CliError, Result};

// ----------------------------------------------------------------------------
// CLI Application Configuration
// ----------------------------------------------------------------------------

/// Complete configuration for the sockmux CLI
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CliAppConfig {
    /// Engine configuration shared by `serve` and `connect`
    pub session: SessionConfig,

    /// CLI-specific configuration
    pub cli: CliConfig,
}

/// CLI-specific configuration options
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CliConfig {
    /// Enable verbose logging output
    pub verbose: bool,

    /// Echo received payloads back when serving
    pub echo: bool,

    /// Print payloads as hex even when they are valid UTF-8
    pub always_hex: bool,

    /// Encoding for text messages given on the command line
    pub encoding: TextEncoding,
}

impl Default for CliConfig {
    fn default() -> Self {
        Self {
            verbose: false,
            echo: false,
            always_hex: false,
            encoding: TextEncoding::Utf8,
        }
    }
}

// ----------------------------------------------------------------------------
// Configuration Loading Logic
// ----------------------------------------------------------------------------

impl CliAppConfig {
    /// Load configuration from a specific file path
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            CliError::Config(format!("Failed to read {}: {}", path.as_ref().display(), e))
        })?;
        Self::from_toml(&text)
    }

    pub fn from_toml(text: &str) -> Result<Self> {
        let config: CliAppConfig = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a specific file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent)?;
        }
        let text = toml::to_string_pretty(self)?;
        std::fs::write(path.as_ref(), text)?;
        Ok(())
    }

    /// Apply command-line flags on top of the loaded values
    pub fn apply_overrides(&mut self, cli: &Cli) -> Result<()> {
        if cli.verbose {
            self.cli.verbose = true;
        }
        if let Some(ms) = cli.timeout_ms {
            self.session.timeout = std::time::Duration::from_millis(ms);
        }

        match &cli.command {
            Commands::Serve { bind, echo, .. } => {
                if let Some(address) = bind {
                    self.session.bind_address = Some(*address);
                }
                if *echo {
                    self.cli.echo = true;
                }
            }
            Commands::Connect { encoding, .. } => {
                if let Some(name) = encoding {
                    self.cli.encoding = name.parse()?;
                }
            }
        }

        self.validate()
    }

    /// Validate the configuration for consistency and correctness
    pub fn validate(&self) -> Result<()> {
        self.session
            .validate()
            .map_err(|e| CliError::Config(e.to_string()))
    }
}
