//! Push-notification hand-off.
//!
//! When a SEND with the notification flag lands on a queue with a notifier
//! bound, the relay seals a minimal token — message id and timestamp, never
//! the body — under the notifier's DH secret and hands it to the external
//! fan-out service behind [`NtfSink`]. The relay does not know or care how
//! it reaches a device.

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use quill_core::crypto::{self, CryptoError};
use quill_core::ids::EntityId;

/// What the fan-out service receives per notified message.
#[derive(Debug, Clone)]
pub struct PushNotification {
    pub notifier_id: EntityId,
    /// `nonce || sealed token` under the notifier DH secret.
    pub sealed_token: Vec<u8>,
}

/// The sealed token payload. Only the notifier can open it, and it reveals
/// nothing beyond "a message arrived at time T".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NtfToken {
    pub msg_id: String,
    pub ts: u64,
}

/// Seal a token for a queue's notifier.
pub fn seal_token(dh_secret: &[u8; 32], msg_id: &EntityId, ts: u64) -> Vec<u8> {
    let token = NtfToken {
        msg_id: msg_id.to_hex(),
        ts,
    };
    let plain = serde_json::to_vec(&token).expect("token serialization is infallible");
    let nonce = crypto::generate_seal_nonce();
    let mut out = nonce.to_vec();
    out.extend_from_slice(&crypto::seal(dh_secret, &nonce, &plain));
    out
}

/// Open a sealed token (notifier side).
pub fn open_token(dh_secret: &[u8; 32], sealed: &[u8]) -> Result<NtfToken, CryptoError> {
    if sealed.len() < crypto::SEAL_NONCE_LEN {
        return Err(CryptoError::TooShort);
    }
    let nonce: [u8; crypto::SEAL_NONCE_LEN] = sealed[..crypto::SEAL_NONCE_LEN]
        .try_into()
        .expect("nonce prefix");
    let plain = crypto::open(dh_secret, &nonce, &sealed[crypto::SEAL_NONCE_LEN..])?;
    serde_json::from_slice(&plain).map_err(|_| CryptoError::TagMismatch)
}

/// Where sealed notifications go. Implemented by the external push fan-out;
/// in-process tests use [`ChannelSink`].
pub trait NtfSink: Send + Sync {
    fn deliver(&self, ntf: PushNotification);
}

/// Drops every notification. The default when push is not configured.
pub struct NullSink;

impl NtfSink for NullSink {
    fn deliver(&self, _ntf: PushNotification) {}
}

/// Forwards notifications into an unbounded channel.
pub struct ChannelSink(pub mpsc::UnboundedSender<PushNotification>);

impl NtfSink for ChannelSink {
    fn deliver(&self, ntf: PushNotification) {
        let _ = self.0.send(ntf);
    }
}
