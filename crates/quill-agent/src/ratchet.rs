//! Per-connection double ratchet.
//!
//! Three interlocking schedules:
//!   1. **Symmetric ratchet** — HMAC-SHA256 chain key evolution, one message
//!      key per message, deleted after use.
//!   2. **DH ratchet** — an X25519 step on every direction change, giving
//!      post-compromise recovery.
//!   3. **Skipped keys** — message keys for gaps, bounded and handed to the
//!      caller for persistence so out-of-order messages decrypt after a
//!      restart.
//!
//! The ratchet owns no I/O. The agent serializes it with [`Ratchet::to_blob`]
//! and commits the blob together with the message it produced — either both
//! land in the store or neither does.

use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use thiserror::Error;
use zeroize::Zeroize;

use quill_core::crypto::{DhKeyPair, DhPublic, SharedSecret};

type HmacSha256 = Hmac<Sha256>;

/// Skipped message keys kept per connection. Bounds memory against a peer
/// that claims an absurd gap.
pub const MAX_SKIP: u64 = 512;

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum RatchetError {
    #[error("message authentication failed")]
    Decrypt,

    #[error("too many skipped messages")]
    TooManySkipped,

    #[error("no receiving chain for this message")]
    NoChain,

    #[error("ratchet state blob is corrupt")]
    BadBlob,
}

// ── Header ────────────────────────────────────────────────────────────────────

/// Sent alongside every ratchet message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RatchetHeader {
    /// Sender's current DH ratchet public key.
    pub dh_public: [u8; 32],
    /// Messages in the sender's previous sending chain.
    pub prev_chain_len: u64,
    /// Message number within the current sending chain.
    pub msg_number: u64,
}

impl RatchetHeader {
    pub const LEN: usize = 32 + 8 + 8;

    pub fn encode(&self) -> [u8; Self::LEN] {
        let mut out = [0u8; Self::LEN];
        out[..32].copy_from_slice(&self.dh_public);
        out[32..40].copy_from_slice(&self.prev_chain_len.to_le_bytes());
        out[40..48].copy_from_slice(&self.msg_number.to_le_bytes());
        out
    }

    pub fn decode(data: &[u8]) -> Option<Self> {
        if data.len() != Self::LEN {
            return None;
        }
        Some(Self {
            dh_public: data[..32].try_into().ok()?,
            prev_chain_len: u64::from_le_bytes(data[32..40].try_into().ok()?),
            msg_number: u64::from_le_bytes(data[40..48].try_into().ok()?),
        })
    }
}

/// A message key skipped over for an out-of-order message, to be persisted
/// by the caller keyed by (header DH key, message number).
#[derive(Debug, Clone)]
pub struct SkippedKey {
    pub header_key: [u8; 32],
    pub msg_number: u64,
    pub message_key: [u8; 32],
}

impl Drop for SkippedKey {
    fn drop(&mut self) {
        self.message_key.zeroize();
    }
}

// ── State ─────────────────────────────────────────────────────────────────────

#[derive(Serialize, Deserialize)]
struct RatchetBlob {
    root_key: String,
    dh_private: String,
    dh_remote: Option<String>,
    chain_send: Option<String>,
    chain_recv: Option<String>,
    ns: u64,
    nr: u64,
    pn: u64,
}

/// The double-ratchet state of one connection.
pub struct Ratchet {
    root_key: [u8; 32],
    dh_self: DhKeyPair,
    dh_remote: Option<[u8; 32]>,
    chain_send: Option<[u8; 32]>,
    chain_recv: Option<[u8; 32]>,
    /// Message number in the sending chain.
    ns: u64,
    /// Message number in the receiving chain.
    nr: u64,
    /// Length of the previous sending chain.
    pn: u64,
}

impl Ratchet {
    /// Initialize as the party that sends first (the joiner): it knows the
    /// peer's ratchet key from the invitation and can start a sending chain
    /// immediately.
    pub fn init_sender(shared: &SharedSecret, remote_dh: &DhPublic) -> Self {
        let mut ratchet = Self {
            root_key: *shared.as_bytes(),
            dh_self: DhKeyPair::generate(),
            dh_remote: Some(remote_dh.0),
            chain_send: None,
            chain_recv: None,
            ns: 0,
            nr: 0,
            pn: 0,
        };
        let dh = ratchet.dh_self.shared_secret(remote_dh);
        let (root, chain) = kdf_root(&ratchet.root_key, dh.as_bytes());
        ratchet.root_key = root;
        ratchet.chain_send = Some(chain);
        ratchet
    }

    /// Initialize as the party that receives first (the inviter): its own
    /// ratchet key was published in the invitation; chains start on the
    /// first incoming header.
    pub fn init_receiver(shared: &SharedSecret, own_dh: DhKeyPair) -> Self {
        Self {
            root_key: *shared.as_bytes(),
            dh_self: own_dh,
            dh_remote: None,
            chain_send: None,
            chain_recv: None,
            ns: 0,
            nr: 0,
            pn: 0,
        }
    }

    /// Encrypt one message, advancing the sending chain.
    pub fn encrypt(&mut self, plaintext: &[u8]) -> Result<(RatchetHeader, Vec<u8>), RatchetError> {
        let chain = self.chain_send.as_mut().ok_or(RatchetError::NoChain)?;
        let (next_chain, message_key) = kdf_chain(chain);
        *chain = next_chain;

        let header = RatchetHeader {
            dh_public: self.dh_self.public().0,
            prev_chain_len: self.pn,
            msg_number: self.ns,
        };
        self.ns += 1;

        // Each message key is used exactly once, so a fixed nonce is sound.
        let ciphertext = quill_core::crypto::seal(&message_key, &[0u8; 12], plaintext);
        Ok((header, ciphertext))
    }

    /// Decrypt one message, performing a DH step on a direction change and
    /// collecting skipped keys for the caller to persist.
    pub fn decrypt(
        &mut self,
        header: &RatchetHeader,
        ciphertext: &[u8],
    ) -> Result<(Vec<u8>, Vec<SkippedKey>), RatchetError> {
        let mut skipped = Vec::new();

        if self.dh_remote != Some(header.dh_public) {
            // Close out the old receiving chain first.
            self.skip_to(header.prev_chain_len, &mut skipped)?;
            self.dh_step(&header.dh_public);
        }
        self.skip_to(header.msg_number, &mut skipped)?;

        let chain = self.chain_recv.as_mut().ok_or(RatchetError::NoChain)?;
        let (next_chain, message_key) = kdf_chain(chain);
        *chain = next_chain;
        self.nr += 1;

        let plaintext = quill_core::crypto::open(&message_key, &[0u8; 12], ciphertext)
            .map_err(|_| RatchetError::Decrypt)?;
        Ok((plaintext, skipped))
    }

    /// Decrypt with a previously persisted skipped key. Does not touch the
    /// ratchet state.
    pub fn decrypt_skipped(message_key: &[u8; 32], ciphertext: &[u8]) -> Result<Vec<u8>, RatchetError> {
        quill_core::crypto::open(message_key, &[0u8; 12], ciphertext)
            .map_err(|_| RatchetError::Decrypt)
    }

    /// Derive and stash message keys up to (excluding) `until`.
    fn skip_to(&mut self, until: u64, skipped: &mut Vec<SkippedKey>) -> Result<(), RatchetError> {
        if self.chain_recv.is_none() {
            // No chain yet (first message from this side); nothing to skip.
            return if until == 0 || self.dh_remote.is_none() {
                Ok(())
            } else {
                Err(RatchetError::NoChain)
            };
        }
        if until > self.nr + MAX_SKIP {
            return Err(RatchetError::TooManySkipped);
        }
        let header_key = self.dh_remote.unwrap_or_default();
        while self.nr < until {
            let chain = self.chain_recv.as_mut().expect("chain checked above");
            let (next_chain, message_key) = kdf_chain(chain);
            *chain = next_chain;
            skipped.push(SkippedKey {
                header_key,
                msg_number: self.nr,
                message_key,
            });
            self.nr += 1;
        }
        Ok(())
    }

    /// A full DH step: new receiving chain from the peer's key, fresh own
    /// keypair, new sending chain.
    fn dh_step(&mut self, remote: &[u8; 32]) {
        let remote_pub = DhPublic(*remote);

        let dh_recv = self.dh_self.shared_secret(&remote_pub);
        let (root, chain_recv) = kdf_root(&self.root_key, dh_recv.as_bytes());
        self.root_key = root;
        self.chain_recv = Some(chain_recv);
        self.dh_remote = Some(*remote);
        self.pn = self.ns;
        self.ns = 0;
        self.nr = 0;

        self.dh_self = DhKeyPair::generate();
        let dh_send = self.dh_self.shared_secret(&remote_pub);
        let (root, chain_send) = kdf_root(&self.root_key, dh_send.as_bytes());
        self.root_key = root;
        self.chain_send = Some(chain_send);
    }

    // ── Persistence ───────────────────────────────────────────────────────

    /// Serialize for the agent store. Opaque to everything but this module.
    pub fn to_blob(&self) -> Vec<u8> {
        let blob = RatchetBlob {
            root_key: hex::encode(self.root_key),
            dh_private: hex::encode(*self.dh_self.private_bytes()),
            dh_remote: self.dh_remote.map(hex::encode),
            chain_send: self.chain_send.map(hex::encode),
            chain_recv: self.chain_recv.map(hex::encode),
            ns: self.ns,
            nr: self.nr,
            pn: self.pn,
        };
        serde_json::to_vec(&blob).expect("ratchet blob serialization is infallible")
    }

    pub fn from_blob(data: &[u8]) -> Result<Self, RatchetError> {
        let blob: RatchetBlob = serde_json::from_slice(data).map_err(|_| RatchetError::BadBlob)?;
        let hex32 = |s: &str| -> Result<[u8; 32], RatchetError> {
            hex::decode(s)
                .ok()
                .and_then(|b| b.try_into().ok())
                .ok_or(RatchetError::BadBlob)
        };
        Ok(Self {
            root_key: hex32(&blob.root_key)?,
            dh_self: DhKeyPair::from_private(hex32(&blob.dh_private)?),
            dh_remote: blob.dh_remote.as_deref().map(hex32).transpose()?,
            chain_send: blob.chain_send.as_deref().map(hex32).transpose()?,
            chain_recv: blob.chain_recv.as_deref().map(hex32).transpose()?,
            ns: blob.ns,
            nr: blob.nr,
            pn: blob.pn,
        })
    }
}

// ── KDFs ──────────────────────────────────────────────────────────────────────

/// Root KDF: mix a DH output into the root key, yielding the next root key
/// and a fresh chain key.
fn kdf_root(root: &[u8; 32], dh: &[u8; 32]) -> ([u8; 32], [u8; 32]) {
    (tagged_hmac(root, dh, 0x01), tagged_hmac(root, dh, 0x02))
}

/// Chain KDF: evolve the chain key and derive this message's key.
fn kdf_chain(chain: &[u8; 32]) -> ([u8; 32], [u8; 32]) {
    (tagged_hmac(chain, &[], 0x02), tagged_hmac(chain, &[], 0x01))
}

fn tagged_hmac(key: &[u8; 32], data: &[u8], tag: u8) -> [u8; 32] {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(key).expect("HMAC accepts any key length");
    mac.update(data);
    mac.update(&[tag]);
    let mut out = [0u8; 32];
    out.copy_from_slice(&mac.finalize().into_bytes());
    out
}

// ── Tests ─────────────────────────────────────────────────────────────────────
