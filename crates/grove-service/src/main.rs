// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Grove node daemon: binds the Unix socket and serves the sync protocol.

use std::sync::Arc;

use anyhow::Result;
use grove_service::{config, serve, HubState};
use tokio::net::UnixListener;
use tokio::sync::Mutex;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let prefs = config::load();
    // Persist defaults once so first-run users find the file.
    config::save(&prefs);

    // Remove stale socket if present
    let _ = std::fs::remove_file(&prefs.socket_path);
    let listener = UnixListener::bind(&prefs.socket_path)?;
    info!("grove node listening at {}", prefs.socket_path);

    let hub = Arc::new(Mutex::new(HubState::new()));
    serve(listener, hub, prefs.max_frame_bytes).await
}
