//! Sockmux CLI library
//!
//! Argument parsing, configuration loading and the event-printing application
//! behind the `sockmux` binary.

pub mod app;
pub mod cli;
pub mod commands;
pub mod config;
pub mod error;

pub use app::SockmuxApp;
pub use cli::{Cli, Commands};
pub use config::{CliAppConfig, CliConfig};
pub use error::{CliError, Result};
