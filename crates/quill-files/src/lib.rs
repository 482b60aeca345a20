//! quill-files — chunked file transfer over relay queues.
//!
//! Large objects travel as fixed-size encrypted chunks, each uploaded to a
//! relay under throwaway credentials. The sender ends up with a compact
//! YAML description per recipient; any recipient can reassemble the file
//! from her description alone, and the relays never learn who talks to
//! whom or what the chunks contain.

pub mod chunks;
pub mod description;
pub mod receive;
pub mod send;

use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use rand::RngCore;
use tokio::sync::{mpsc, Semaphore};

use quill_agent::client::{BrokerClient, BrokerError};
use quill_core::addr::RelayAddr;
use quill_core::command::ErrorCode;
use quill_core::config::FilesConfig;

pub use chunks::{prepare_chunks, ChunkError, FileHeader};
pub use description::{
    ChunkSpec, DescriptionError, FileDescription, FileParty, ParsedDescription, RedirectInfo,
    Replica,
};

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum FileError {
    #[error(transparent)]
    Broker(#[from] BrokerError),

    #[error(transparent)]
    Chunk(#[from] ChunkError),

    #[error(transparent)]
    Description(#[from] DescriptionError),

    #[error("file I/O: {0}")]
    Io(#[from] std::io::Error),

    #[error("chunk digest does not match the description")]
    Digest,

    #[error("assembled size does not match the description")]
    Size,

    #[error("relay refused the replica credentials")]
    Auth,

    #[error("redirect target does not match its declared size or digest")]
    RedirectMismatch,

    #[error("descriptor redirects more than one level")]
    RedirectLoop,

    #[error("no relay is configured for file transfer")]
    NoRelay,

    #[error("every replica failed; last error: {0}")]
    ReplicasExhausted(String),

    #[error("upload plan is corrupt or incomplete")]
    BadPlan,
}

impl FileError {
    /// Permanent errors abort the transfer; transient ones rotate replicas.
    pub fn is_transient(&self) -> bool {
        match self {
            FileError::Broker(e) => e.is_transient(),
            FileError::Io(_) => true,
            _ => false,
        }
    }
}

pub(crate) fn broker_error_kind(e: &BrokerError) -> Option<ErrorCode> {
    match e {
        BrokerError::Protocol(code) => Some(*code),
        _ => None,
    }
}

// ── Events ────────────────────────────────────────────────────────────────────

/// Progress stream for file operations.
#[derive(Debug)]
pub enum FileEvent {
    /// Upload progress in encrypted-stream bytes.
    SfProg { sent: u64, total: u64 },
    /// An upload finished; one description (YAML) per recipient.
    SfDone { descriptions: Vec<String> },
    SfErr { reason: String },
    /// Download progress in encrypted-stream bytes. A redirect prefetch
    /// counts toward the total.
    RfProg { received: u64, total: u64 },
    RfDone { path: PathBuf },
    RfErr { reason: String },
}

// ── Transfer core ─────────────────────────────────────────────────────────────

/// Shared state of the file subsystem: configuration, the relay pool, a
/// session cache, and the in-flight byte ceiling.
pub struct FileTransfer {
    pub(crate) config: FilesConfig,
    pub(crate) relays: Vec<RelayAddr>,
    pub(crate) clients: DashMap<RelayAddr, Arc<BrokerClient>>,
    /// Byte-denominated permits; an upload holds its chunk size while the
    /// chunk is in flight.
    pub(crate) inflight: Arc<Semaphore>,
    pub(crate) events_tx: mpsc::Sender<FileEvent>,
}

impl FileTransfer {
    /// Build the transfer core over a relay pool. Returns the handle and
    /// the progress event stream.
    pub fn new(
        config: FilesConfig,
        relays: Vec<RelayAddr>,
    ) -> (Arc<Self>, mpsc::Receiver<FileEvent>) {
        let (events_tx, events_rx) = mpsc::channel(256);
        let permits = (config.max_inflight_bytes as usize).min(Semaphore::MAX_PERMITS);
        (
            Arc::new(Self {
                config,
                relays,
                clients: DashMap::new(),
                inflight: Arc::new(Semaphore::new(permits)),
                events_tx,
            }),
            events_rx,
        )
    }

    pub(crate) async fn client(&self, relay: &RelayAddr) -> Result<Arc<BrokerClient>, FileError> {
        if let Some(existing) = self.clients.get(relay) {
            if !existing.is_closed() {
                return Ok(existing.clone());
            }
        }
        // File sessions carry no subscriptions; the event stream is unused.
        let (client, _events) = BrokerClient::connect(relay).await?;
        self.clients.insert(relay.clone(), client.clone());
        Ok(client)
    }

    pub(crate) async fn emit(&self, event: FileEvent) {
        let _ = self.events_tx.send(event).await;
    }

    /// A fresh random path under the temp prefix.
    pub(crate) fn temp_path(&self, suffix: &str) -> PathBuf {
        let mut bytes = [0u8; 12];
        rand::thread_rng().fill_bytes(&mut bytes);
        self.config
            .temp_dir
            .join(format!("{}{}", hex::encode(bytes), suffix))
    }
}
