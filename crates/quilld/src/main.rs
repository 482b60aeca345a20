//! quilld — the Quill relay daemon.

use std::sync::Arc;

use anyhow::{Context, Result};

use quill_core::config::QuillConfig;
use quill_server::{NullSink, RelayServer};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialise tracing — RUST_LOG controls verbosity
    // e.g. RUST_LOG=debug cargo run -p quilld
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config_path = QuillConfig::write_default_if_missing().context("writing default config")?;
    let config = QuillConfig::load().context("loading config")?;
    tracing::info!(config = %config_path.display(), "quilld starting");

    let relay = RelayServer::start(config.relay, Arc::new(NullSink))
        .await
        .context("starting relay")?;

    tracing::info!(
        addr = %relay.local_addr(),
        fingerprint = hex::encode(relay.fingerprint()),
        queues = relay.queue_count(),
        "relay ready"
    );

    // Run until interrupted, then let sessions drain.
    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    tracing::info!("shutdown requested");

    if let Err(e) = relay.compact_store() {
        tracing::warn!(error = %e, "final store compaction failed");
    }
    relay.stop().await;
    Ok(())
}
