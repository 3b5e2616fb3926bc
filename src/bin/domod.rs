//! domod: the broker daemon.
//!
//! Binds the TCP router, then drives the broker loop until the process is
//! signalled.
//!
//! ## Configuration
//! - `domo.yaml` in the current directory, or the file named by
//!   `DOMO_CONFIG`
//! - `DOMO_`-prefixed environment variables (e.g. `DOMO_BROKER__HEARTBEAT`)
//! - `DOMO_LOG`: log filter (default: info)

use tracing::info;

use domo::bootstrap::init_tracing;
use domo::transport::{frame_channel, TcpRouter};
use domo::{Broker, Config};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let config = Config::load()?;

    let (inbound_tx, inbound_rx) = frame_channel();
    let (outbound_tx, outbound_rx) = frame_channel();

    let router = TcpRouter::bind(&config.transport, inbound_tx, outbound_rx).await?;
    info!(address = %router.local_addr()?, "domod started");
    tokio::spawn(router.run());

    let broker = Broker::new(config.broker, outbound_tx);
    tokio::select! {
        _ = broker.run(inbound_rx) => {}
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received");
        }
    }

    Ok(())
}
