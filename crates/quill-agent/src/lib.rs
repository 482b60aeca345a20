//! quill-agent — the client-side orchestrator of duplex connections.
//!
//! Pairs two unidirectional relay queues into one end-to-end encrypted
//! channel: key agreement over an out-of-band invitation, a per-message
//! double ratchet, ordered surfacing with integrity metadata, and durable
//! state behind the [`store::AgentStateStore`] port.

pub mod agent;
pub mod client;
pub mod envelope;
pub mod ratchet;
pub mod store;

pub use agent::{AgentError, AgentEvent, ConnectionAgent};
pub use client::{BrokerClient, BrokerError, BrokerEvent};
pub use envelope::{AgentMsg, Envelope, Integrity};
pub use ratchet::{Ratchet, RatchetError};
pub use store::{AgentStateStore, ConnMode, ConnStatus, MemStore};
