//! Chat room: every message goes to everyone, with join and leave notices.
//!
//! ```text
//! cargo run -p aria-server --example chat
//! ```

use anyhow::Context;
use aria_core::Broker;
use aria_server::logging::init_subscriber;
use aria_server::{AriaServer, load_config};
use tracing::{debug, info};
use uuid::Uuid;

fn display_id(conn: &aria_core::Connection) -> String {
    conn.get_as::<String>("id")
        .map_or_else(|| "someone".to_string(), |id| id.as_str().to_owned())
}

/// Broadcast to the room. Peers that miss it are reported through on-error
/// and evicted by their own read-loops, so the sender carries on.
async fn announce(broker: &Broker, message: &str) {
    if let Err(err) = broker.broadcast_all(message).await {
        debug!(error = %err, "broadcast incomplete");
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_subscriber("info");
    let config = load_config().context("failed to load config")?;

    let broker = Broker::builder()
        .on_connect(|broker, conn| async move {
            let uid = Uuid::now_v7().to_string();
            info!(%uid, "connected");
            conn.set("id", uid.clone());
            announce(&broker, &format!("{uid} has connected")).await;
            Ok(())
        })
        .on_message(|broker, _, text| async move {
            announce(&broker, &text).await;
            Ok(())
        })
        .on_close(|broker, conn| async move {
            let uid = display_id(&conn);
            announce(&broker, &format!("{uid} has left")).await;
            Ok(())
        })
        .on_disconnect(|broker, conn| async move {
            let uid = display_id(&conn);
            info!(%uid, "disconnected");
            announce(&broker, &format!("{uid} has disconnected")).await;
            Ok(())
        })
        .accept_options(config.accept_options())
        .build();

    let server = AriaServer::new(config, broker);
    server.run_until_ctrl_c().await.context("server failed")?;
    Ok(())
}
