//! The sockmux CLI application: runs a session and prints its events

use sockmux_runtime::{Session, SessionEvent};
use tracing::{info, warn};

use crate::config::CliAppConfig;
use crate::error::Result;

// ----------------------------------------------------------------------------
// Application
// ----------------------------------------------------------------------------

pub struct SockmuxApp {
    config: CliAppConfig,
}

impl SockmuxApp {
    pub fn new(config: CliAppConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &CliAppConfig {
        &self.config
    }

    /// Listen on `port` until interrupted
    pub async fn serve(&self, port: u32) -> Result<()> {
        let builder = Session::builder(self.config.session.clone());
        let mut events = builder.subscribe();
        let session = builder.listen(port).await?;

        if let Some(addr) = session.local_addr() {
            println!("Listening on {}", addr);
        }

        loop {
            tokio::select! {
                event = events.recv() => {
                    let Some(event) = event else { break };
                    println!("{}", self.describe(&event));

                    if let (true, SessionEvent::Received(received)) = (self.config.cli.echo, &event) {
                        if let Err(e) = session.send(&received.bytes, Some(received.endpoint)).await {
                            warn!("Echo to {} failed: {}", received.endpoint, e);
                        }
                    }
                }
                _ = tokio::signal::ctrl_c() => {
                    info!("Interrupted, closing server");
                    break;
                }
            }
        }

        session.close();
        Ok(())
    }

    /// Connect to `host:port`, optionally send `payload`, and print traffic
    /// until the server goes away or the user interrupts
    pub async fn connect(&self, host: &str, port: u32, payload: Option<Vec<u8>>) -> Result<()> {
        let builder = Session::builder(self.config.session.clone());
        let mut events = builder.subscribe();
        let session = builder.connect(host, port).await?;

        if let Some(payload) = payload {
            session.send(&payload, None).await?;
        }

        loop {
            tokio::select! {
                event = events.recv() => {
                    let Some(event) = event else { break };
                    println!("{}", self.describe(&event));
                    if matches!(event, SessionEvent::Disconnected(_)) {
                        break;
                    }
                }
                _ = tokio::signal::ctrl_c() => {
                    info!("Interrupted, closing connection");
                    break;
                }
            }
        }

        session.close();
        Ok(())
    }

    /// One-line rendering of an event
    pub fn describe(&self, event: &SessionEvent) -> String {
        match event {
            SessionEvent::Connected(e) => format!("connected    {}", e.endpoint),
            SessionEvent::Accepted(e) => format!("accepted     {}", e.endpoint),
            SessionEvent::Sent(e) => format!("sent         {}", e.endpoint),
            SessionEvent::Received(e) => format!(
                "received     {} ({} bytes): {}",
                e.endpoint,
                e.bytes.len(),
                format_payload(&e.bytes, self.config.cli.always_hex)
            ),
            SessionEvent::Disconnected(e) => format!("disconnected {}", e.endpoint),
            SessionEvent::TimedOut(e) => format!("timed out    {} ({})", e.endpoint, e.operation),
        }
    }
}

/// Payload as UTF-8 text when it is valid, hex otherwise
pub fn format_payload(bytes: &[u8], always_hex: bool) -> String {
    match std::str::from_utf8(bytes) {
        Ok(text) if !always_hex => text.escape_debug().to_string(),
        _ => format!("0x{}", hex::encode(bytes)),
    }
}
