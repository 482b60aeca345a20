//! quill-server — the message relay: queue store, session handling, and
//! file chunk storage.
//!
//! The relay owns unidirectional queues addressed by unrelated opaque ids,
//! verifies per-queue signatures, streams deliveries to subscribers, and
//! stores encrypted file chunks. It never sees plaintext and holds no
//! record linking a queue's recipient to its sender.

pub mod ntf;
pub mod server;
pub mod store;
pub mod transport;

pub use ntf::{ChannelSink, NtfSink, NullSink, PushNotification};
pub use server::{RelayServer, ServerError};
pub use store::{
    FileRecord, FileStore, FilesError, JournalConfig, MessageJournal, NotifierRecord, QueueRecord,
    QueueStatus, QueueStore, StoreError, WriteOutcome,
};
pub use transport::{
    client_handshake, server_handshake, BlockReader, BlockWriter, SecureTransport, TransportError,
};
