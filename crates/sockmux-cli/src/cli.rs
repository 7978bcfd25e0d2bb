//! Command-line interface definitions and parsing

use std::net::IpAddr;

use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,

    /// Configuration file path
    #[arg(short, long)]
    pub config: Option<String>,

    /// Deadline for connect and send, in milliseconds
    #[arg(short, long)]
    pub timeout_ms: Option<u64>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Listen for clients and print their traffic
    Serve {
        /// Port to listen on (0 picks a free port)
        #[arg(short, long)]
        port: u32,
        /// Address to bind instead of the dual-stack any-address
        #[arg(short, long)]
        bind: Option<IpAddr>,
        /// Send every received payload back to its sender
        #[arg(short, long)]
        echo: bool,
    },
    /// Connect to a server and print its traffic
    Connect {
        /// Server host name or IP address
        #[arg(long, default_value = "127.0.0.1")]
        host: String,
        /// Server port
        #[arg(short, long)]
        port: u32,
        /// Message to send once connected
        #[arg(short, long)]
        message: Option<String>,
        /// Treat the message as hex-encoded bytes
        #[arg(long)]
        hex: bool,
        /// Text encoding for the message (utf-8, ascii, latin1)
        #[arg(short, long)]
        encoding: Option<String>,
    },
}
