//! Notification relay: logs each message and rebroadcasts it.
//!
//! ```text
//! ARIA_PORT=8080 cargo run -p aria-server --example notification
//! ```

use anyhow::Context;
use aria_core::{Broker, CompressionMode};
use aria_server::logging::init_json_subscriber;
use aria_server::{AriaServer, load_config};
use tracing::{debug, error, info};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_json_subscriber("info");
    let config = load_config().context("failed to load config")?;

    let options = config
        .accept_options()
        .with_compression_mode(CompressionMode::Disabled);

    let broker = Broker::builder()
        .on_connect(|_, conn| async move {
            info!(conn_id = %conn.id(), "new connection");
            Ok(())
        })
        .on_message(|broker, _, text| async move {
            info!(received = %text, "relaying");
            if let Err(err) = broker.broadcast_all(&text).await {
                debug!(error = %err, "relay incomplete");
            }
            Ok(())
        })
        .on_error(|_, conn, err| {
            error!(conn_id = %conn.id(), error = %err, "connection error");
        })
        .accept_options(options)
        .build();

    let server = AriaServer::new(config, broker);
    server.run_until_ctrl_c().await.context("server failed")?;
    Ok(())
}
