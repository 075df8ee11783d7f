//! Mist Host: standalone session relay.
//!
//! Binds a WebSocket listener, signs outgoing frames with a fresh Ed25519
//! key and announces that key in the local directory.
//!
//! Environment:
//! - `MIST_BIND_ADDR`: listen address (default `127.0.0.1:9090`)
//! - `MIST_MAX_PEERS`: connection cap (default 100)
//! - `RUST_LOG`: log filter for `env_logger`

use log::{error, info, warn};

use mist_collab::{
    announce_host, Ed25519Signer, EventKind, InMemoryDirectory, MessageSigner, ServerConfig,
    SessionHub, SyncServer,
};

fn config_from_env() -> ServerConfig {
    let mut config = ServerConfig::default();

    if let Ok(addr) = std::env::var("MIST_BIND_ADDR") {
        config.bind_addr = addr;
    }
    if let Ok(raw) = std::env::var("MIST_MAX_PEERS") {
        match raw.parse() {
            Ok(max) => config.max_peers = max,
            Err(e) => warn!("Ignoring MIST_MAX_PEERS={raw:?}: {e}"),
        }
    }

    config
}

#[tokio::main]
async fn main() {
    env_logger::init();

    info!("Starting Mist Host...");

    let config = config_from_env();
    let signer = Ed25519Signer::generate();
    let public_key = signer.public_key();

    let directory = InMemoryDirectory::new();
    if let Err(e) = announce_host(&public_key, &directory).await {
        warn!("Host announcement failed: {e}");
    }

    let mut hub = SessionHub::new(config.hub.clone()).with_signer(signer);
    for kind in EventKind::ALL {
        hub.subscribe(kind, move |data, sender| {
            log::debug!("{kind} from {sender}: {data}");
            Ok(())
        });
    }

    let server = SyncServer::with_hub(config, hub);
    if let Err(e) = server.run().await {
        error!("Host stopped: {e}");
        std::process::exit(1);
    }
}
