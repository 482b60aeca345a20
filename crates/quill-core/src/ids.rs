//! Opaque entity identifiers and queue roles.
//!
//! Every addressable entity on a relay — a queue endpoint, a notifier
//! binding, a stored message, a file chunk replica — is named by an
//! independent 24-byte random id. Ids carry no structure: knowing one id of
//! a queue must not let the holder derive any other id of the same queue.

use rand::RngCore;
use serde::{Deserialize, Serialize};

/// Length of every entity id in bytes.
pub const ENTITY_ID_LEN: usize = 24;

/// A 24-byte opaque identifier.
///
/// Rendered as unpadded base64 in URIs and as lowercase hex in store paths
/// and log records.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityId(pub [u8; ENTITY_ID_LEN]);

impl EntityId {
    /// Generate a fresh random id from OS entropy.
    pub fn random() -> Self {
        let mut bytes = [0u8; ENTITY_ID_LEN];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; ENTITY_ID_LEN] {
        &self.0
    }

    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        let arr: [u8; ENTITY_ID_LEN] = bytes.try_into().ok()?;
        Some(Self(arr))
    }

    /// Lowercase hex, used for store paths and journal records.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Option<Self> {
        let bytes = hex::decode(s).ok()?;
        Self::from_slice(&bytes)
    }

    /// Unpadded URL-safe base64, used in URIs and descriptors.
    pub fn to_base64(&self) -> String {
        use base64::Engine;
        base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(self.0)
    }

    pub fn from_base64(s: &str) -> Option<Self> {
        use base64::Engine;
        let bytes = base64::engine::general_purpose::URL_SAFE_NO_PAD
            .decode(s)
            .ok()?;
        Self::from_slice(&bytes)
    }
}

impl std::fmt::Debug for EntityId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Only a prefix — full ids do not belong in logs.
        write!(f, "EntityId({}…)", &self.to_hex()[..8])
    }
}

impl std::fmt::Display for EntityId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_base64())
    }
}

impl AsRef<[u8]> for EntityId {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

// ── Queue roles ───────────────────────────────────────────────────────────────

/// The party a command claims to act as.
///
/// Each queue has up to three independent credentials; the role selects
/// which lookup index and which verification key apply to a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum QueueRole {
    /// The queue owner: reads, acknowledges, configures.
    Recipient,
    /// The anonymous writer: appends messages.
    Sender,
    /// The push-notification subscriber bound by NKEY.
    Notifier,
}

impl QueueRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueRole::Recipient => "recipient",
            QueueRole::Sender => "sender",
            QueueRole::Notifier => "notifier",
        }
    }
}
