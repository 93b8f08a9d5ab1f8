use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use tokio::time::{timeout, Duration, Instant};
use tracing::debug;

use callbridge::protocol::{ClientFrame, ServerFrame};
use callbridge::relay::{RelayConnector, WebSocketConnector};

#[derive(Parser, Debug)]
#[command(name = "callbridge-relay")]
#[command(about = "Call signaling relay and link probe")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the relay server (default)
    Serve {
        /// Listen port; overrides CALLBRIDGE_RELAY_PORT
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Connect to a relay, wait for its welcome and measure a ping round trip
    Probe {
        /// Relay base URL (http, https, ws or wss)
        #[arg(short, long, default_value = "ws://localhost:8090")]
        url: String,

        /// Seconds to wait for each step
        #[arg(short, long, default_value_t = 5)]
        timeout_secs: u64,
    },
}

pub async fn run_probe(url: String, timeout_secs: u64) -> Result<()> {
    let wait = Duration::from_secs(timeout_secs.max(1));
    let connector = WebSocketConnector::new(&url, wait)?;
    debug!("probing {}", connector.url());

    let started = Instant::now();
    let mut conn = connector.connect().await?;

    let relay_instance = timeout(wait, async {
        while let Some(frame) = conn.inbound.recv().await {
            if let ServerFrame::Welcome { relay_instance } = frame {
                return Ok(relay_instance);
            }
        }
        Err(anyhow!("relay closed the connection before welcome"))
    })
    .await
    .map_err(|_| anyhow!("no welcome within {timeout_secs}s"))??;
    let welcomed = started.elapsed();

    let ping_sent = Instant::now();
    conn.outbound
        .send(ClientFrame::Ping)
        .map_err(|_| anyhow!("relay link closed"))?;
    timeout(wait, async {
        while let Some(frame) = conn.inbound.recv().await {
            if matches!(frame, ServerFrame::Pong) {
                return Ok(());
            }
        }
        Err(anyhow!("relay closed the connection before pong"))
    })
    .await
    .map_err(|_| anyhow!("no pong within {timeout_secs}s"))??;

    println!("relay instance: {relay_instance}");
    println!("welcome after:  {} ms", welcomed.as_millis());
    println!("ping rtt:       {} ms", ping_sent.elapsed().as_millis());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_timeout::timeout]
    fn no_subcommand_means_serve() {
        let cli = Cli::try_parse_from(["callbridge-relay"]).unwrap();
        assert!(cli.command.is_none());

        let cli = Cli::try_parse_from(["callbridge-relay", "probe", "-u", "https://relay.example"])
            .unwrap();
        match cli.command {
            Some(Commands::Probe { url, timeout_secs }) => {
                assert_eq!(url, "https://relay.example");
                assert_eq!(timeout_secs, 5);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }
}
