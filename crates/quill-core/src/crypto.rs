//! Cryptographic primitives for Quill.
//!
//! Provides four things:
//!   1. BLAKE3 hashing — content hashes, hash chains, session ID derivation
//!   2. SHA-512 digests — file and chunk integrity in descriptors
//!   3. Ed25519 / X25519 keys — per-queue command signatures and DH agreement
//!   4. Noise_XX transport sessions — the secured channel between a client
//!      and a relay, plus a ChaCha20-Poly1305 sealed box for payloads that
//!      travel outside a session (push tokens, chunk bodies, confirmations)
//!
//! All private key material is zeroized on drop. There is no unsafe code in
//! this module.

use ed25519_dalek::Signer;
use rand::RngCore;
use snow::{Builder, HandshakeState, StatelessTransportState};
use thiserror::Error;
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

// ── BLAKE3 ────────────────────────────────────────────────────────────────────

/// Hash a byte slice, returning a 32-byte BLAKE3 digest.
///
/// Used for message hash chains, server key fingerprints, and session ID
/// derivation. File digests use SHA-512 (see [`sha512`]).
pub fn hash(data: &[u8]) -> [u8; 32] {
    *blake3::hash(data).as_bytes()
}

/// Incremental BLAKE3 hasher for payloads that arrive in pieces.
pub struct Hasher(blake3::Hasher);

impl Hasher {
    pub fn new() -> Self {
        Self(blake3::Hasher::new())
    }

    pub fn update(&mut self, data: &[u8]) {
        self.0.update(data);
    }

    pub fn finalize(self) -> [u8; 32] {
        *self.0.finalize().as_bytes()
    }
}

impl Default for Hasher {
    fn default() -> Self {
        Self::new()
    }
}

// ── SHA-512 ───────────────────────────────────────────────────────────────────

/// One-shot SHA-512, used for file and chunk digests in descriptors.
pub fn sha512(data: &[u8]) -> [u8; 64] {
    use sha2::Digest;
    let mut out = [0u8; 64];
    out.copy_from_slice(&sha2::Sha512::digest(data));
    out
}

/// Incremental SHA-512 for streamed file bodies.
pub struct Sha512Stream(sha2::Sha512);

impl Sha512Stream {
    pub fn new() -> Self {
        use sha2::Digest;
        Self(sha2::Sha512::new())
    }

    pub fn update(&mut self, data: &[u8]) {
        use sha2::Digest;
        self.0.update(data);
    }

    pub fn finalize(self) -> [u8; 64] {
        use sha2::Digest;
        let mut out = [0u8; 64];
        out.copy_from_slice(&self.0.finalize());
        out
    }
}

impl Default for Sha512Stream {
    fn default() -> Self {
        Self::new()
    }
}

// ── Signing keys ──────────────────────────────────────────────────────────────

/// An Ed25519 verifying key as it appears in queue records and commands.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct VerifyKey(pub [u8; 32]);

impl VerifyKey {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        bytes.try_into().ok().map(Self)
    }

    /// Verify `signature` over `data`. Malformed keys and signatures verify
    /// as false rather than erroring — a forged credential is not an
    /// exceptional state for a relay.
    pub fn verify(&self, data: &[u8], signature: &CommandSignature) -> bool {
        use ed25519_dalek::Verifier;
        let Ok(key) = ed25519_dalek::VerifyingKey::from_bytes(&self.0) else {
            return false;
        };
        let sig = ed25519_dalek::Signature::from_bytes(&signature.0);
        key.verify(data, &sig).is_ok()
    }
}

impl std::fmt::Debug for VerifyKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "VerifyKey({}…)", &hex::encode(self.0)[..8])
    }
}

/// A detached Ed25519 signature over the canonical transmission bytes.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct CommandSignature(pub [u8; 64]);

impl CommandSignature {
    pub fn as_bytes(&self) -> &[u8; 64] {
        &self.0
    }

    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        bytes.try_into().ok().map(Self)
    }
}

impl std::fmt::Debug for CommandSignature {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("CommandSignature(..)")
    }
}

/// An Ed25519 keypair used to sign queue commands.
///
/// Generated per queue endpoint and per file replica; never shared across
/// entities, so a relay cannot correlate two queues by key reuse.
pub struct SignKeyPair {
    signing: ed25519_dalek::SigningKey,
}

impl SignKeyPair {
    pub fn generate() -> Self {
        Self {
            signing: ed25519_dalek::SigningKey::generate(&mut rand::rngs::OsRng),
        }
    }

    pub fn from_private(private: [u8; 32]) -> Self {
        Self {
            signing: ed25519_dalek::SigningKey::from_bytes(&private),
        }
    }

    pub fn verify_key(&self) -> VerifyKey {
        VerifyKey(self.signing.verifying_key().to_bytes())
    }

    pub fn private_bytes(&self) -> Zeroizing<[u8; 32]> {
        Zeroizing::new(self.signing.to_bytes())
    }

    pub fn sign(&self, data: &[u8]) -> CommandSignature {
        CommandSignature(self.signing.sign(data).to_bytes())
    }
}

impl std::fmt::Debug for SignKeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SignKeyPair({:?})", self.verify_key())
    }
}

// ── DH keys ───────────────────────────────────────────────────────────────────

/// An X25519 public key on the wire.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct DhPublic(pub [u8; 32]);

impl DhPublic {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        bytes.try_into().ok().map(Self)
    }
}

impl std::fmt::Debug for DhPublic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "DhPublic({}…)", &hex::encode(self.0)[..8])
    }
}

/// An X25519 keypair for one DH agreement.
///
/// Used for the queue push secret (relay ↔ recipient), ratchet steps, and
/// per-chunk download keys.
pub struct DhKeyPair {
    secret: StaticSecret,
    public: DhPublic,
}

impl DhKeyPair {
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(rand::thread_rng());
        let public = DhPublic(*PublicKey::from(&secret).as_bytes());
        Self { secret, public }
    }

    pub fn from_private(private: [u8; 32]) -> Self {
        let secret = StaticSecret::from(private);
        let public = DhPublic(*PublicKey::from(&secret).as_bytes());
        Self { secret, public }
    }

    pub fn public(&self) -> DhPublic {
        self.public
    }

    pub fn private_bytes(&self) -> Zeroizing<[u8; 32]> {
        Zeroizing::new(self.secret.to_bytes())
    }

    /// The raw X25519 shared secret with `their` public key.
    pub fn shared_secret(&self, their: &DhPublic) -> SharedSecret {
        let pk = PublicKey::from(their.0);
        SharedSecret(Zeroizing::new(*self.secret.diffie_hellman(&pk).as_bytes()))
    }
}

/// A derived DH secret, zeroized on drop.
pub struct SharedSecret(Zeroizing<[u8; 32]>);

impl SharedSecret {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(Zeroizing::new(bytes))
    }
}

// ── Sealed box ────────────────────────────────────────────────────────────────

/// Poly1305 tag length appended by [`seal`].
pub const SEAL_TAG_LEN: usize = 16;

/// Nonce length for sealed boxes.
pub const SEAL_NONCE_LEN: usize = 12;

/// Encrypt `plaintext` under `key`/`nonce` with ChaCha20-Poly1305,
/// returning ciphertext with the 16-byte tag appended.
///
/// The Poly1305 key is the first 32 bytes of the block-0 keystream; the
/// payload keystream starts at block 1; the tag covers the ciphertext.
/// Both sides of every sealed payload in Quill use this exact construction,
/// so there is no associated data.
pub fn seal(key: &[u8; 32], nonce: &[u8; SEAL_NONCE_LEN], plaintext: &[u8]) -> Vec<u8> {
    use chacha20::cipher::{KeyIvInit, StreamCipher};

    let mut cipher = chacha20::ChaCha20::new(key.into(), nonce.into());
    let mut mac_key = [0u8; 64];
    cipher.apply_keystream(&mut mac_key);

    let mut out = plaintext.to_vec();
    cipher.apply_keystream(&mut out);

    let tag = poly1305_tag(&mac_key[..32], &out);
    out.extend_from_slice(&tag);
    mac_key.zeroize();
    out
}

/// Authenticate and decrypt a [`seal`]ed payload.
pub fn open(
    key: &[u8; 32],
    nonce: &[u8; SEAL_NONCE_LEN],
    ciphertext: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    use chacha20::cipher::{KeyIvInit, StreamCipher};

    if ciphertext.len() < SEAL_TAG_LEN {
        return Err(CryptoError::TooShort);
    }
    let (body, tag) = ciphertext.split_at(ciphertext.len() - SEAL_TAG_LEN);

    let mut cipher = chacha20::ChaCha20::new(key.into(), nonce.into());
    let mut mac_key = [0u8; 64];
    cipher.apply_keystream(&mut mac_key);

    let expected = poly1305_tag(&mac_key[..32], body);
    mac_key.zeroize();
    if !ct_eq(&expected, tag) {
        return Err(CryptoError::TagMismatch);
    }

    let mut out = body.to_vec();
    cipher.apply_keystream(&mut out);
    Ok(out)
}

/// One-shot Poly1305 over `data`.
pub fn poly1305_tag(key: &[u8], data: &[u8]) -> [u8; 16] {
    use poly1305::universal_hash::KeyInit;
    let mac = poly1305::Poly1305::new(poly1305::Key::from_slice(key));
    let tag = mac.compute_unpadded(data);
    tag.into()
}

/// Constant-time byte comparison.
pub fn ct_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

/// Generate a random sealed-box nonce.
pub fn generate_seal_nonce() -> [u8; SEAL_NONCE_LEN] {
    let mut nonce = [0u8; SEAL_NONCE_LEN];
    rand::thread_rng().fill_bytes(&mut nonce);
    nonce
}

// ── Transport keypair ─────────────────────────────────────────────────────────

/// The Noise protocol pattern Quill transport sessions use.
///
/// Noise_XX: mutual authentication, both static keys transmitted encrypted.
/// The server's static key fingerprint is pinned out-of-band via the
/// invitation / server address URI.
const NOISE_PATTERN: &str = "Noise_XX_25519_ChaChaPoly_BLAKE2s";

/// A relay's (or client's) long-term static X25519 transport keypair.
///
/// The BLAKE3 hash of the public key is the server fingerprint that appears
/// in `quill://` addresses.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct TransportKeypair {
    private: Zeroizing<[u8; 32]>,
    pub public: [u8; 32],
}

impl TransportKeypair {
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(rand::thread_rng());
        let public = PublicKey::from(&secret);
        Self {
            private: Zeroizing::new(secret.to_bytes()),
            public: *public.as_bytes(),
        }
    }

    /// Reconstruct from stored private key bytes. The public key is derived
    /// deterministically.
    pub fn from_private(private_bytes: [u8; 32]) -> Self {
        let secret = StaticSecret::from(private_bytes);
        let public = PublicKey::from(&secret);
        Self {
            private: Zeroizing::new(private_bytes),
            public: *public.as_bytes(),
        }
    }

    pub fn private_bytes(&self) -> Zeroizing<[u8; 32]> {
        Zeroizing::new(*self.private)
    }

    /// The fingerprint pinned by clients: BLAKE3 of the static public key.
    pub fn fingerprint(&self) -> [u8; 32] {
        hash(&self.public)
    }
}

// ── Noise handshake ───────────────────────────────────────────────────────────

/// Generate a cryptographically random 16-byte handshake nonce.
pub fn generate_nonce() -> [u8; 16] {
    let mut nonce = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut nonce);
    nonce
}

/// Derive a session ID from the two handshake nonces.
///
/// Neither party controls the session ID unilaterally; signed commands bind
/// to it, so a transmission captured on one session cannot be replayed on
/// another.
///
///   session_id = BLAKE3(initiator_nonce || responder_nonce)
pub fn derive_session_id(initiator_nonce: &[u8; 16], responder_nonce: &[u8; 16]) -> [u8; 32] {
    let mut combined = [0u8; 32];
    combined[..16].copy_from_slice(initiator_nonce);
    combined[16..].copy_from_slice(responder_nonce);
    hash(&combined)
}

/// Initiator (client) side of the Noise_XX handshake.
///
/// Message 1 carries the initiator nonce and the client's supported version
/// range as cleartext payload; message 2 returns the negotiated version
/// under encryption.
pub struct NoiseInitiator {
    state: HandshakeState,
    initiator_nonce: [u8; 16],
}

impl NoiseInitiator {
    /// Begin a handshake. Returns the state and the message-1 bytes, with
    /// `payload` (the client hello) attached.
    pub fn new(keypair: &TransportKeypair, payload: &[u8]) -> Result<(Self, Vec<u8>), CryptoError> {
        let state = Builder::new(NOISE_PATTERN.parse().map_err(|_| CryptoError::BadPattern)?)
            .local_private_key(&*keypair.private)
            .build_initiator()
            .map_err(CryptoError::Noise)?;

        let mut initiator = Self {
            state,
            initiator_nonce: generate_nonce(),
        };

        let mut msg1 = vec![0u8; 128 + payload.len()];
        let len = initiator
            .state
            .write_message(payload, &mut msg1)
            .map_err(CryptoError::Noise)?;
        msg1.truncate(len);

        Ok((initiator, msg1))
    }

    pub fn nonce(&self) -> &[u8; 16] {
        &self.initiator_nonce
    }

    /// Process message 2 and complete the handshake.
    ///
    /// Returns the completed session, the message-3 bytes to send, and the
    /// responder's message-2 payload (the negotiated version).
    pub fn finish(
        mut self,
        msg2: &[u8],
        responder_nonce: &[u8; 16],
    ) -> Result<(TransportSession, Vec<u8>, Vec<u8>), CryptoError> {
        let mut payload = vec![0u8; msg2.len()];
        let payload_len = self
            .state
            .read_message(msg2, &mut payload)
            .map_err(CryptoError::Noise)?;
        payload.truncate(payload_len);

        let mut msg3 = vec![0u8; 128];
        let len = self
            .state
            .write_message(&[], &mut msg3)
            .map_err(CryptoError::Noise)?;
        msg3.truncate(len);

        let remote_static = self.state.get_remote_static().map(|s| {
            let mut key = [0u8; 32];
            key.copy_from_slice(s);
            key
        });

        let transport = self
            .state
            .into_stateless_transport_mode()
            .map_err(CryptoError::Noise)?;
        let session_id = derive_session_id(&self.initiator_nonce, responder_nonce);

        Ok((
            TransportSession {
                session_id,
                remote_static,
                transport,
                send_nonce: 0,
                recv_window: ReplayWindow::new(),
            },
            msg3,
            payload,
        ))
    }
}

/// Responder (relay) side of the Noise_XX handshake.
pub struct NoiseResponder {
    state: HandshakeState,
    responder_nonce: [u8; 16],
}

impl NoiseResponder {
    pub fn new(keypair: &TransportKeypair) -> Result<Self, CryptoError> {
        let state = Builder::new(NOISE_PATTERN.parse().map_err(|_| CryptoError::BadPattern)?)
            .local_private_key(&*keypair.private)
            .build_responder()
            .map_err(CryptoError::Noise)?;

        Ok(Self {
            state,
            responder_nonce: generate_nonce(),
        })
    }

    pub fn nonce(&self) -> &[u8; 16] {
        &self.responder_nonce
    }

    /// Process message 1 and write message 2 with `payload` (the server
    /// hello) attached. Returns the pending state, the message-2 bytes, and
    /// the initiator's message-1 payload (the client hello).
    pub fn respond(
        mut self,
        msg1: &[u8],
        initiator_nonce: &[u8; 16],
        payload: &[u8],
    ) -> Result<(ResponderPending, Vec<u8>, Vec<u8>), CryptoError> {
        let mut hello = vec![0u8; msg1.len()];
        let hello_len = self
            .state
            .read_message(msg1, &mut hello)
            .map_err(CryptoError::Noise)?;
        hello.truncate(hello_len);

        let mut msg2 = vec![0u8; 160 + payload.len()];
        let len = self
            .state
            .write_message(payload, &mut msg2)
            .map_err(CryptoError::Noise)?;
        msg2.truncate(len);

        Ok((
            ResponderPending {
                state: self.state,
                responder_nonce: self.responder_nonce,
                initiator_nonce: *initiator_nonce,
            },
            msg2,
            hello,
        ))
    }
}

/// Responder waiting for message 3 from the initiator.
pub struct ResponderPending {
    state: HandshakeState,
    responder_nonce: [u8; 16],
    initiator_nonce: [u8; 16],
}

impl ResponderPending {
    pub fn finish(mut self, msg3: &[u8]) -> Result<TransportSession, CryptoError> {
        let mut payload = vec![0u8; msg3.len()];
        self.state
            .read_message(msg3, &mut payload)
            .map_err(CryptoError::Noise)?;

        let remote_static = self.state.get_remote_static().map(|s| {
            let mut key = [0u8; 32];
            key.copy_from_slice(s);
            key
        });

        let transport = self
            .state
            .into_stateless_transport_mode()
            .map_err(CryptoError::Noise)?;
        let session_id = derive_session_id(&self.initiator_nonce, &self.responder_nonce);

        Ok(TransportSession {
            session_id,
            remote_static,
            transport,
            send_nonce: 0,
            recv_window: ReplayWindow::new(),
        })
    }
}

// ── Replay window ─────────────────────────────────────────────────────────────

/// Sliding-window replay protection (RFC 6479 style).
///
/// Tracks the highest seen nonce and a bitmap of the last 2048 nonces.
const WINDOW_SIZE: u64 = 2048;

pub struct ReplayWindow {
    highest: u64,
    bitmap: Vec<u64>,
}

impl Default for ReplayWindow {
    fn default() -> Self {
        Self::new()
    }
}

impl ReplayWindow {
    pub fn new() -> Self {
        Self {
            highest: 0,
            bitmap: vec![0u64; (WINDOW_SIZE / 64) as usize],
        }
    }

    /// Returns true if the nonce is acceptable (not replayed, not too old).
    pub fn check(&self, nonce: u64) -> bool {
        if nonce + WINDOW_SIZE < self.highest {
            return false;
        }
        if nonce > self.highest {
            return true;
        }
        let diff = self.highest - nonce;
        let (word, bit) = ((diff / 64) as usize, (diff % 64) as u32);
        self.bitmap[word] & (1u64 << bit) == 0
    }

    /// Mark a nonce as seen. Call after successful decrypt.
    pub fn mark(&mut self, nonce: u64) {
        if nonce > self.highest {
            let shift = nonce - self.highest;
            self.shift_window(shift);
            self.highest = nonce;
        }
        let diff = self.highest - nonce;
        let (word, bit) = ((diff / 64) as usize, (diff % 64) as u32);
        self.bitmap[word] |= 1u64 << bit;
    }

    fn shift_window(&mut self, shift: u64) {
        if shift >= WINDOW_SIZE {
            self.bitmap.fill(0);
            return;
        }
        let word_shift = (shift / 64) as usize;
        let bit_shift = (shift % 64) as u32;
        if word_shift > 0 {
            self.bitmap.rotate_right(word_shift);
            for w in &mut self.bitmap[..word_shift] {
                *w = 0;
            }
        }
        if bit_shift > 0 {
            let len = self.bitmap.len();
            for i in (1..len).rev() {
                self.bitmap[i] =
                    (self.bitmap[i] >> bit_shift) | (self.bitmap[i - 1] << (64 - bit_shift));
            }
            self.bitmap[0] >>= bit_shift;
        }
    }
}

// ── Transport session ─────────────────────────────────────────────────────────

/// A completed Noise_XX session carrying padded transport blocks.
///
/// Uses StatelessTransportState with explicit nonces; each encrypted frame
/// carries an 8-byte LE nonce prefix, so a frame replayed or reflected by
/// the network is rejected regardless of transport ordering.
///
/// Wire format per frame:
///   [u64 nonce LE (8 bytes)] [Noise ciphertext (payload + 16-byte MAC)]
///
/// Not Sync — send_nonce and recv_window require exclusive access.
pub struct TransportSession {
    pub session_id: [u8; 32],
    remote_static: Option<[u8; 32]>,
    transport: StatelessTransportState,
    send_nonce: u64,
    recv_window: ReplayWindow,
}

impl TransportSession {
    /// The peer's static transport key, if transmitted during the handshake.
    /// Clients pin `hash(remote_static)` against the server fingerprint.
    pub fn remote_static(&self) -> Option<&[u8; 32]> {
        self.remote_static.as_ref()
    }

    /// Encrypt plaintext into `out`. Prepends an 8-byte LE nonce and appends
    /// a 16-byte MAC.
    pub fn encrypt(&mut self, plaintext: &[u8], out: &mut Vec<u8>) -> Result<(), CryptoError> {
        let nonce = self.send_nonce;
        self.send_nonce += 1;

        out.clear();
        out.extend_from_slice(&nonce.to_le_bytes());

        let offset = 8;
        out.resize(offset + plaintext.len() + 16, 0);
        let written = self
            .transport
            .write_message(nonce, plaintext, &mut out[offset..])
            .map_err(CryptoError::Noise)?;
        out.truncate(offset + written);
        Ok(())
    }

    /// Decrypt ciphertext into `out`, checking the replay window and MAC.
    pub fn decrypt(&mut self, ciphertext: &[u8], out: &mut Vec<u8>) -> Result<(), CryptoError> {
        if ciphertext.len() < 8 + 16 {
            return Err(CryptoError::TooShort);
        }

        let nonce = u64::from_le_bytes(ciphertext[..8].try_into().expect("8-byte prefix"));

        if !self.recv_window.check(nonce) {
            return Err(CryptoError::Replay);
        }

        out.resize(ciphertext.len() - 8, 0);
        let written = self
            .transport
            .read_message(nonce, &ciphertext[8..], out)
            .map_err(CryptoError::Noise)?;
        out.truncate(written);

        self.recv_window.mark(nonce);
        Ok(())
    }

    /// Split into independent read and write halves.
    ///
    /// The stateless Noise cipher takes `&self`, so both halves share it;
    /// the send nonce goes to the writer and the replay window to the
    /// reader. This lets a session be driven by separate reader and writer
    /// tasks without a shared lock.
    pub fn split(self) -> (SessionReader, SessionWriter) {
        let transport = std::sync::Arc::new(self.transport);
        (
            SessionReader {
                session_id: self.session_id,
                transport: transport.clone(),
                recv_window: self.recv_window,
            },
            SessionWriter {
                session_id: self.session_id,
                transport,
                send_nonce: self.send_nonce,
            },
        )
    }
}

/// Receiving half of a split [`TransportSession`].
pub struct SessionReader {
    pub session_id: [u8; 32],
    transport: std::sync::Arc<StatelessTransportState>,
    recv_window: ReplayWindow,
}

impl SessionReader {
    pub fn decrypt(&mut self, ciphertext: &[u8], out: &mut Vec<u8>) -> Result<(), CryptoError> {
        if ciphertext.len() < 8 + 16 {
            return Err(CryptoError::TooShort);
        }
        let nonce = u64::from_le_bytes(ciphertext[..8].try_into().expect("8-byte prefix"));
        if !self.recv_window.check(nonce) {
            return Err(CryptoError::Replay);
        }
        out.resize(ciphertext.len() - 8, 0);
        let written = self
            .transport
            .read_message(nonce, &ciphertext[8..], out)
            .map_err(CryptoError::Noise)?;
        out.truncate(written);
        self.recv_window.mark(nonce);
        Ok(())
    }
}

/// Sending half of a split [`TransportSession`].
pub struct SessionWriter {
    pub session_id: [u8; 32],
    transport: std::sync::Arc<StatelessTransportState>,
    send_nonce: u64,
}

impl SessionWriter {
    pub fn encrypt(&mut self, plaintext: &[u8], out: &mut Vec<u8>) -> Result<(), CryptoError> {
        let nonce = self.send_nonce;
        self.send_nonce += 1;
        out.clear();
        out.extend_from_slice(&nonce.to_le_bytes());
        let offset = 8;
        out.resize(offset + plaintext.len() + 16, 0);
        let written = self
            .transport
            .write_message(nonce, plaintext, &mut out[offset..])
            .map_err(CryptoError::Noise)?;
        out.truncate(offset + written);
        Ok(())
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("invalid Noise pattern string — this is a bug")]
    BadPattern,

    #[error("Noise protocol error: {0}")]
    Noise(#[from] snow::Error),

    #[error("ciphertext too short")]
    TooShort,

    #[error("AEAD tag mismatch")]
    TagMismatch,

    #[error("replayed or too-old nonce")]
    Replay,

    #[error("key agreement failed")]
    Agreement,
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    /// Run a complete handshake, negotiating payloads both ways.
    fn completed_sessions() -> (TransportSession, TransportSession) {
        let ckp = TransportKeypair::generate();
        let skp = TransportKeypair::generate();

        let (initiator, msg1) = NoiseInitiator::new(&ckp, b"client-hello").unwrap();
        let i_nonce = *initiator.nonce();

        let responder = NoiseResponder::new(&skp).unwrap();
        let r_nonce = *responder.nonce();
        let (pending, msg2, hello) = responder.respond(&msg1, &i_nonce, b"server-hello").unwrap();
        assert_eq!(hello, b"client-hello");

        let (c_session, msg3, server_hello) = initiator.finish(&msg2, &r_nonce).unwrap();
        assert_eq!(server_hello, b"server-hello");

        let s_session = pending.finish(&msg3).unwrap();

        (c_session, s_session)
    }

    #[test]
    fn hash_is_deterministic() {
        assert_eq!(hash(b"quill"), hash(b"quill"));
        assert_ne!(hash(b"quill"), hash(b"Quill"));
    }

    #[test]
    fn sha512_stream_matches_oneshot() {
        let mut s = Sha512Stream::new();
        s.update(b"hello ");
        s.update(b"world");
        assert_eq!(s.finalize(), sha512(b"hello world"));
    }

    #[test]
    fn incremental_hasher_matches_oneshot() {
        let mut h = Hasher::new();
        h.update(b"hello ");
        h.update(b"world");
        assert_eq!(h.finalize(), hash(b"hello world"));
    }

    #[test]
    fn sign_verify_round_trip() {
        let kp = SignKeyPair::generate();
        let sig = kp.sign(b"canonical bytes");
        assert!(kp.verify_key().verify(b"canonical bytes", &sig));
        assert!(!kp.verify_key().verify(b"other bytes", &sig));
    }

    #[test]
    fn signature_rejected_under_wrong_key() {
        let kp1 = SignKeyPair::generate();
        let kp2 = SignKeyPair::generate();
        let sig = kp1.sign(b"data");
        assert!(!kp2.verify_key().verify(b"data", &sig));
    }

    #[test]
    fn sign_keypair_round_trip_via_private_bytes() {
        let kp1 = SignKeyPair::generate();
        let kp2 = SignKeyPair::from_private(*kp1.private_bytes());
        assert_eq!(kp1.verify_key(), kp2.verify_key());
    }

    #[test]
    fn dh_agreement_is_symmetric() {
        let a = DhKeyPair::generate();
        let b = DhKeyPair::generate();
        let ab = a.shared_secret(&b.public());
        let ba = b.shared_secret(&a.public());
        assert_eq!(ab.as_bytes(), ba.as_bytes());
    }

    #[test]
    fn seal_open_round_trip() {
        let key = [7u8; 32];
        let nonce = generate_seal_nonce();
        let sealed = seal(&key, &nonce, b"push token payload");
        assert_eq!(sealed.len(), 18 + SEAL_TAG_LEN);
        let opened = open(&key, &nonce, &sealed).unwrap();
        assert_eq!(opened, b"push token payload");
    }

    #[test]
    fn seal_detects_tamper() {
        let key = [7u8; 32];
        let nonce = [1u8; SEAL_NONCE_LEN];
        let mut sealed = seal(&key, &nonce, b"payload");
        sealed[2] ^= 0xff;
        assert!(matches!(
            open(&key, &nonce, &sealed),
            Err(CryptoError::TagMismatch)
        ));
    }

    #[test]
    fn open_rejects_wrong_key() {
        let nonce = [1u8; SEAL_NONCE_LEN];
        let sealed = seal(&[1u8; 32], &nonce, b"payload");
        assert!(open(&[2u8; 32], &nonce, &sealed).is_err());
    }

    #[test]
    fn session_id_uses_both_nonces() {
        let n1 = [0x01u8; 16];
        let n2 = [0x02u8; 16];
        // Order matters — client and relay must agree on who initiated
        assert_ne!(derive_session_id(&n1, &n2), derive_session_id(&n2, &n1));
    }

    #[test]
    fn noise_handshake_completes_with_payloads() {
        let (c, s) = completed_sessions();
        assert_eq!(c.session_id, s.session_id);
    }

    #[test]
    fn client_sees_server_static_key() {
        let skp = TransportKeypair::generate();
        let ckp = TransportKeypair::generate();

        let (initiator, msg1) = NoiseInitiator::new(&ckp, b"").unwrap();
        let i_nonce = *initiator.nonce();
        let responder = NoiseResponder::new(&skp).unwrap();
        let r_nonce = *responder.nonce();
        let (pending, msg2, _) = responder.respond(&msg1, &i_nonce, b"").unwrap();
        let (c_session, msg3, _) = initiator.finish(&msg2, &r_nonce).unwrap();
        let _ = pending.finish(&msg3).unwrap();

        assert_eq!(c_session.remote_static(), Some(&skp.public));
        assert_eq!(hash(&skp.public), skp.fingerprint());
    }

    #[test]
    fn session_encrypt_decrypt_round_trip() {
        let (mut c, mut s) = completed_sessions();

        let mut ct = Vec::new();
        let mut pt = Vec::new();
        c.encrypt(b"block bytes", &mut ct).unwrap();
        assert_ne!(ct.as_slice(), b"block bytes");
        s.decrypt(&ct, &mut pt).unwrap();
        assert_eq!(pt, b"block bytes");

        // And back
        s.encrypt(b"response", &mut ct).unwrap();
        c.decrypt(&ct, &mut pt).unwrap();
        assert_eq!(pt, b"response");
    }

    #[test]
    fn session_rejects_replay() {
        let (mut c, mut s) = completed_sessions();
        let mut ct = Vec::new();
        let mut pt = Vec::new();
        c.encrypt(b"once", &mut ct).unwrap();
        s.decrypt(&ct, &mut pt).unwrap();
        assert!(matches!(s.decrypt(&ct, &mut pt), Err(CryptoError::Replay)));
    }

    #[test]
    fn session_rejects_tamper() {
        let (mut c, mut s) = completed_sessions();
        let mut ct = Vec::new();
        let mut pt = Vec::new();
        c.encrypt(b"important", &mut ct).unwrap();
        ct[12] ^= 0xff;
        assert!(s.decrypt(&ct, &mut pt).is_err());
    }

    #[test]
    fn split_halves_stay_compatible() {
        let (c, s) = completed_sessions();
        let (mut c_read, mut c_write) = c.split();
        let (mut s_read, mut s_write) = s.split();

        let mut ct = Vec::new();
        let mut pt = Vec::new();
        c_write.encrypt(b"to server", &mut ct).unwrap();
        s_read.decrypt(&ct, &mut pt).unwrap();
        assert_eq!(pt, b"to server");

        s_write.encrypt(b"to client", &mut ct).unwrap();
        c_read.decrypt(&ct, &mut pt).unwrap();
        assert_eq!(pt, b"to client");
    }

    #[test]
    fn replay_window_basics() {
        let mut w = ReplayWindow::new();
        for i in 0..100 {
            assert!(w.check(i));
            w.mark(i);
        }
        assert!(!w.check(5));
        w.mark(WINDOW_SIZE + 200);
        assert!(!w.check(0));
        assert!(w.check(WINDOW_SIZE + 199));
    }

    #[test]
    fn ct_eq_basics() {
        assert!(ct_eq(b"abc", b"abc"));
        assert!(!ct_eq(b"abc", b"abd"));
        assert!(!ct_eq(b"abc", b"ab"));
    }
}
