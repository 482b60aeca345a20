//! Quill integration test harness.
//!
//! Everything runs in-process: relays listen on ephemeral localhost ports
//! with stores in per-test temp directories, and agents talk to them over
//! real TCP sessions. No external environment is required.
//!
//!   cargo test --test integration

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use quill_agent::agent::AgentEvent;
use quill_core::addr::RelayAddr;
use quill_core::config::{AgentConfig, RelayConfig};
use quill_server::{NtfSink, NullSink, RelayServer};

mod files;
mod messaging;
mod recovery;

/// How long any single expected event may take to arrive.
pub const EVENT_TIMEOUT: Duration = Duration::from_secs(20);

// ── Relay helpers ─────────────────────────────────────────────────────────────

/// Start a relay with its store under `dir`, listening on an ephemeral
/// localhost port.
pub async fn start_relay(dir: &Path, quota: usize) -> (RelayServer, RelayAddr) {
    start_relay_with_sink(dir, quota, Arc::new(NullSink)).await
}

pub async fn start_relay_with_sink(
    dir: &Path,
    quota: usize,
    sink: Arc<dyn NtfSink>,
) -> (RelayServer, RelayAddr) {
    let config = RelayConfig {
        listen_addr: "127.0.0.1:0".into(),
        store_dir: dir.join("store"),
        keypair_path: dir.join("relay_keypair"),
        quota,
        // Sweeps are driven manually in tests that need them.
        check_interval_secs: 3600,
        ..RelayConfig::default()
    };
    let relay = RelayServer::start(config, sink)
        .await
        .expect("relay failed to start");
    let addr = relay.relay_addr("127.0.0.1");
    (relay, addr)
}

// ── Agent helpers ─────────────────────────────────────────────────────────────

/// An agent with an in-memory store, configured for fast test retries.
pub fn start_agent(
    relays: &[&RelayAddr],
) -> (
    quill_agent::ConnectionAgent,
    tokio::sync::mpsc::Receiver<AgentEvent>,
) {
    let mut config = AgentConfig {
        relays: relays.iter().map(|r| r.to_string()).collect(),
        hello_timeout_secs: 15,
        ..AgentConfig::default()
    };
    config.retry_fast.initial_ms = 50;
    config.retry_fast.max_ms = 500;
    quill_agent::ConnectionAgent::new(config, Arc::new(quill_agent::MemStore::new()))
}

/// Wait for the first event `pred` accepts, discarding others.
pub async fn expect_event<T>(
    rx: &mut tokio::sync::mpsc::Receiver<AgentEvent>,
    mut pred: impl FnMut(AgentEvent) -> Option<T>,
) -> T {
    let deadline = tokio::time::Instant::now() + EVENT_TIMEOUT;
    loop {
        let event = tokio::time::timeout_at(deadline, rx.recv())
            .await
            .expect("timed out waiting for agent event")
            .expect("agent event stream closed");
        if let Some(out) = pred(event) {
            return out;
        }
    }
}
