//! The agent message envelope carried inside relay message bodies.
//!
//! After ratchet decryption, every agent message has the same shape:
//!
//! ```text
//!   <seq> SP <iso_ts> SP <prev_hash b64> CRLF
//!   <agent_msg> CRLF
//!   <padding>
//! ```
//!
//! The envelope is padded to a constant size before encryption so relay
//! operators and observers cannot correlate message lengths across queues.
//! `prev_hash` chains each message to the BLAKE3 hash of the previous
//! body in the same direction; the receiver classifies every incoming
//! sequence number and hash against its own counters.

use base64::Engine;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use quill_core::ids::EntityId;

const B64: base64::engine::GeneralPurpose = base64::engine::general_purpose::STANDARD_NO_PAD;
const CRLF: &[u8] = b"\r\n";

/// Every envelope is padded to exactly this many bytes. Must not exceed the
/// relay's maximum message body.
pub const ENVELOPE_SIZE: usize = 15000;

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum EnvelopeError {
    #[error("agent message too large for the envelope")]
    TooLarge,

    #[error("malformed envelope")]
    Malformed,

    #[error("unknown agent message token")]
    UnknownToken,
}

// ── Agent messages ────────────────────────────────────────────────────────────

/// Messages exchanged between two agents over a queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentMsg {
    /// Proves the sending side can produce signed SENDs; carries the
    /// sender's queue verify key for auditability.
    Hello { verify_key: [u8; 32], flags: u8 },
    /// The joiner's own invitation, turning one queue into a duplex pair.
    Reply { invitation: String },
    /// An application payload.
    Msg { body: Vec<u8> },
    /// Application-level acknowledgment of a received message.
    Ack { msg_id: u64, ok: bool },
    /// The peer is deleting the connection.
    Del,
}

impl AgentMsg {
    fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        match self {
            AgentMsg::Hello { verify_key, flags } => {
                out.extend_from_slice(b"HELLO ");
                out.extend_from_slice(verify_key);
                out.push(*flags);
            }
            AgentMsg::Reply { invitation } => {
                out.extend_from_slice(b"REPLY ");
                out.extend_from_slice(&(invitation.len() as u16).to_le_bytes());
                out.extend_from_slice(invitation.as_bytes());
            }
            AgentMsg::Msg { body } => {
                out.extend_from_slice(b"MSG ");
                out.extend_from_slice(&(body.len() as u32).to_le_bytes());
                out.extend_from_slice(body);
            }
            AgentMsg::Ack { msg_id, ok } => {
                out.extend_from_slice(b"ACK ");
                out.extend_from_slice(&msg_id.to_le_bytes());
                out.push(*ok as u8);
            }
            AgentMsg::Del => out.extend_from_slice(b"DEL"),
        }
        out
    }

    fn decode(data: &[u8]) -> Result<Self, EnvelopeError> {
        let (token, rest) = match data.iter().position(|&b| b == b' ') {
            Some(sp) => (&data[..sp], &data[sp + 1..]),
            None => (data, &[][..]),
        };
        match token {
            b"HELLO" => {
                if rest.len() != 33 {
                    return Err(EnvelopeError::Malformed);
                }
                Ok(AgentMsg::Hello {
                    verify_key: rest[..32].try_into().expect("32 bytes"),
                    flags: rest[32],
                })
            }
            b"REPLY" => {
                if rest.len() < 2 {
                    return Err(EnvelopeError::Malformed);
                }
                let len = u16::from_le_bytes(rest[..2].try_into().expect("2 bytes")) as usize;
                if rest.len() != 2 + len {
                    return Err(EnvelopeError::Malformed);
                }
                let invitation = std::str::from_utf8(&rest[2..])
                    .map_err(|_| EnvelopeError::Malformed)?
                    .to_string();
                Ok(AgentMsg::Reply { invitation })
            }
            b"MSG" => {
                if rest.len() < 4 {
                    return Err(EnvelopeError::Malformed);
                }
                let len = u32::from_le_bytes(rest[..4].try_into().expect("4 bytes")) as usize;
                if rest.len() != 4 + len {
                    return Err(EnvelopeError::Malformed);
                }
                Ok(AgentMsg::Msg {
                    body: rest[4..].to_vec(),
                })
            }
            b"ACK" => {
                if rest.len() != 9 {
                    return Err(EnvelopeError::Malformed);
                }
                Ok(AgentMsg::Ack {
                    msg_id: u64::from_le_bytes(rest[..8].try_into().expect("8 bytes")),
                    ok: rest[8] != 0,
                })
            }
            b"DEL" => {
                if !rest.is_empty() {
                    return Err(EnvelopeError::Malformed);
                }
                Ok(AgentMsg::Del)
            }
            _ => Err(EnvelopeError::UnknownToken),
        }
    }
}

// ── Envelope ──────────────────────────────────────────────────────────────────

/// A decoded envelope: sequence header plus the agent message.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    /// Sender's per-direction sequence number, starting at 1.
    pub seq: u64,
    /// Sender wall time.
    pub ts: DateTime<Utc>,
    /// BLAKE3 of the previous envelope's encoding in this direction.
    pub prev_hash: [u8; 32],
    pub msg: AgentMsg,
}

impl Envelope {
    /// Encode and pad to [`ENVELOPE_SIZE`]. The returned buffer hashes into
    /// the next envelope's `prev_hash`.
    pub fn encode(&self) -> Result<Vec<u8>, EnvelopeError> {
        let mut out = Vec::with_capacity(ENVELOPE_SIZE);
        out.extend_from_slice(self.seq.to_string().as_bytes());
        out.push(b' ');
        out.extend_from_slice(
            self.ts
                .to_rfc3339_opts(SecondsFormat::Secs, true)
                .as_bytes(),
        );
        out.push(b' ');
        out.extend_from_slice(B64.encode(self.prev_hash).as_bytes());
        out.extend_from_slice(CRLF);
        out.extend_from_slice(&self.msg.encode());
        out.extend_from_slice(CRLF);
        if out.len() > ENVELOPE_SIZE {
            return Err(EnvelopeError::TooLarge);
        }
        out.resize(ENVELOPE_SIZE, 0);
        Ok(out)
    }

    pub fn decode(data: &[u8]) -> Result<Self, EnvelopeError> {
        let header_end = find_crlf(data, 0).ok_or(EnvelopeError::Malformed)?;
        let header =
            std::str::from_utf8(&data[..header_end]).map_err(|_| EnvelopeError::Malformed)?;
        let mut parts = header.splitn(3, ' ');
        let seq: u64 = parts
            .next()
            .and_then(|s| s.parse().ok())
            .ok_or(EnvelopeError::Malformed)?;
        let ts = parts
            .next()
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|t| t.with_timezone(&Utc))
            .ok_or(EnvelopeError::Malformed)?;
        let prev_hash: [u8; 32] = parts
            .next()
            .and_then(|s| B64.decode(s).ok())
            .and_then(|b| b.try_into().ok())
            .ok_or(EnvelopeError::Malformed)?;

        let msg_start = header_end + 2;
        let msg_end = find_msg_end(data, msg_start).ok_or(EnvelopeError::Malformed)?;
        let msg = AgentMsg::decode(&data[msg_start..msg_end])?;
        // Everything after the closing CRLF is padding and is ignored.

        Ok(Self {
            seq,
            ts,
            prev_hash,
            msg,
        })
    }
}

fn find_crlf(data: &[u8], from: usize) -> Option<usize> {
    data[from..]
        .windows(2)
        .position(|w| w == CRLF)
        .map(|p| from + p)
}

/// The agent message may contain CRLF in its binary fields, so scan for the
/// terminator from the message's own self-delimiting length.
fn find_msg_end(data: &[u8], start: usize) -> Option<usize> {
    let rest = data.get(start..)?;
    let (token, after_token) = match rest.iter().position(|&b| b == b' ') {
        Some(sp) => (&rest[..sp], sp + 1),
        None => {
            // Tokens without fields (DEL) end at the next CRLF.
            let end = find_crlf(data, start)?;
            return Some(end);
        }
    };
    let field_len = match token {
        b"HELLO" => 33,
        b"ACK" => 9,
        b"REPLY" => {
            let len_bytes = rest.get(after_token..after_token + 2)?;
            2 + u16::from_le_bytes(len_bytes.try_into().ok()?) as usize
        }
        b"MSG" => {
            let len_bytes = rest.get(after_token..after_token + 4)?;
            4 + u32::from_le_bytes(len_bytes.try_into().ok()?) as usize
        }
        _ => return None,
    };
    let end = start + after_token + field_len;
    if data.get(end..end + 2)? == CRLF {
        Some(end)
    } else {
        None
    }
}

// ── Integrity ─────────────────────────────────────────────────────────────────

/// Receive-side verdict for one incoming envelope. Surfaced as message
/// metadata, never as an error — the connection continues either way.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Integrity {
    Ok,
    /// Messages `from..=to` were never received.
    Skipped { from: u64, to: u64 },
    /// Sequence went backwards or repeated; `expected` is the last good id.
    BadId { expected: u64 },
    /// Sequence is right but the hash chain does not connect.
    BadHash,
}

/// Classify an incoming (seq, prev_hash) against the receiver's counters.
pub fn classify(last_seq: u64, last_hash: &[u8; 32], seq: u64, prev_hash: &[u8; 32]) -> Integrity {
    if seq == last_seq + 1 {
        if prev_hash == last_hash {
            Integrity::Ok
        } else {
            Integrity::BadHash
        }
    } else if seq > last_seq + 1 {
        Integrity::Skipped {
            from: last_seq + 1,
            to: seq - 1,
        }
    } else {
        Integrity::BadId { expected: last_seq }
    }
}

/// Hash an encoded envelope for the chain.
pub fn chain_hash(encoded: &[u8]) -> [u8; 32] {
    quill_core::crypto::hash(encoded)
}

// ── Client-level message framing ──────────────────────────────────────────────

/// What actually travels in a relay SEND body: either the one unsigned
/// confirmation that keys a queue, or a ratchet-encrypted envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientMsg {
    /// `eph_dh_pub (32) || nonce (12) || sealed Confirmation`
    Confirmation(Vec<u8>),
    /// `ratchet header (48) || sealed envelope`
    Ratchet(Vec<u8>),
}

impl ClientMsg {
    pub fn encode(&self) -> Vec<u8> {
        match self {
            ClientMsg::Confirmation(data) => {
                let mut out = vec![b'C'];
                out.extend_from_slice(data);
                out
            }
            ClientMsg::Ratchet(data) => {
                let mut out = vec![b'R'];
                out.extend_from_slice(data);
                out
            }
        }
    }

    pub fn decode(data: &[u8]) -> Result<Self, EnvelopeError> {
        match data.split_first() {
            Some((b'C', rest)) => Ok(ClientMsg::Confirmation(rest.to_vec())),
            Some((b'R', rest)) => Ok(ClientMsg::Ratchet(rest.to_vec())),
            _ => Err(EnvelopeError::Malformed),
        }
    }
}

/// The sealed payload of the one allowed unsigned SEND: the sender key that
/// will secure the queue, the sender's ratchet key, and application info.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Confirmation {
    /// Hex Ed25519 verify key for KEY.
    pub sender_key: String,
    /// Hex X25519 ratchet key.
    pub dh_key: String,
    /// Opaque application bytes (base64).
    pub info: String,
}

impl Confirmation {
    pub fn new(sender_key: &[u8; 32], dh_key: &[u8; 32], info: &[u8]) -> Self {
        Self {
            sender_key: hex::encode(sender_key),
            dh_key: hex::encode(dh_key),
            info: B64.encode(info),
        }
    }

    pub fn sender_key_bytes(&self) -> Option<[u8; 32]> {
        hex::decode(&self.sender_key).ok()?.try_into().ok()
    }

    pub fn dh_key_bytes(&self) -> Option<[u8; 32]> {
        hex::decode(&self.dh_key).ok()?.try_into().ok()
    }

    pub fn info_bytes(&self) -> Option<Vec<u8>> {
        B64.decode(&self.info).ok()
    }
}

/// A random id naming a pending confirmation in CONF events.
pub fn new_confirmation_id() -> EntityId {
    EntityId::random()
}

/// Confirmation plaintext is padded to a constant so the one unsigned SEND
/// is indistinguishable in size from every ratchet envelope that follows.
/// `1 (tag) + 32 (eph key) + 12 (nonce) + CONF_PLAINTEXT_SIZE + 16 (seal
/// tag)` equals the encrypted envelope body length.
pub const CONF_PLAINTEXT_SIZE: usize = ENVELOPE_SIZE + 1 + 48 + 16 - 1 - 32 - 12 - 16;

/// Length-prefix and zero-pad a confirmation's JSON bytes.
pub fn pad_confirmation(json: &[u8]) -> Result<Vec<u8>, EnvelopeError> {
    if json.len() + 2 > CONF_PLAINTEXT_SIZE {
        return Err(EnvelopeError::TooLarge);
    }
    let mut out = Vec::with_capacity(CONF_PLAINTEXT_SIZE);
    out.extend_from_slice(&(json.len() as u16).to_le_bytes());
    out.extend_from_slice(json);
    out.resize(CONF_PLAINTEXT_SIZE, 0);
    Ok(out)
}

pub fn unpad_confirmation(data: &[u8]) -> Result<&[u8], EnvelopeError> {
    if data.len() < 2 {
        return Err(EnvelopeError::Malformed);
    }
    let len = u16::from_le_bytes(data[..2].try_into().expect("2 bytes")) as usize;
    data.get(2..2 + len).ok_or(EnvelopeError::Malformed)
}

/// Derive the sealing key for a confirmation from the DH agreement. Domain
/// separated from the ratchet root, which starts from the same secret.
pub fn confirmation_seal_key(shared: &quill_core::crypto::SharedSecret) -> [u8; 32] {
    let mut input = Vec::with_capacity(32 + 10);
    input.extend_from_slice(shared.as_bytes());
    input.extend_from_slice(b"quill-conf");
    quill_core::crypto::hash(&input)
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn envelope(msg: AgentMsg) -> Envelope {
        Envelope {
            seq: 3,
            ts: Utc::now(),
            prev_hash: [7u8; 32],
            msg,
        }
    }

    #[test]
    fn envelope_round_trip_all_messages() {
        let msgs = vec![
            AgentMsg::Hello {
                verify_key: [1u8; 32],
                flags: 0x01,
            },
            AgentMsg::Reply {
                invitation: "quill://abc@host:1/xyz?v=1-2#def".into(),
            },
            AgentMsg::Msg {
                body: b"hello world".to_vec(),
            },
            AgentMsg::Msg { body: Vec::new() },
            AgentMsg::Ack {
                msg_id: 42,
                ok: true,
            },
            AgentMsg::Del,
        ];
        for msg in msgs {
            let env = envelope(msg);
            let encoded = env.encode().unwrap();
            assert_eq!(encoded.len(), ENVELOPE_SIZE, "constant-size padding");
            let decoded = Envelope::decode(&encoded).unwrap();
            assert_eq!(decoded.seq, env.seq);
            assert_eq!(decoded.prev_hash, env.prev_hash);
            assert_eq!(decoded.msg, env.msg);
            // Seconds-resolution timestamps survive the trip.
            assert_eq!(decoded.ts.timestamp(), env.ts.timestamp());
        }
    }

    #[test]
    fn body_containing_crlf_round_trips() {
        let env = envelope(AgentMsg::Msg {
            body: b"line one\r\nline two\r\n".to_vec(),
        });
        let decoded = Envelope::decode(&env.encode().unwrap()).unwrap();
        assert_eq!(decoded.msg, env.msg);
    }

    #[test]
    fn oversized_message_is_rejected() {
        let env = envelope(AgentMsg::Msg {
            body: vec![0u8; ENVELOPE_SIZE],
        });
        assert_eq!(env.encode(), Err(EnvelopeError::TooLarge));
    }

    #[test]
    fn classify_matches_protocol_table() {
        let hash = [1u8; 32];
        let other = [2u8; 32];
        assert_eq!(classify(4, &hash, 5, &hash), Integrity::Ok);
        assert_eq!(
            classify(4, &hash, 8, &hash),
            Integrity::Skipped { from: 5, to: 7 }
        );
        assert_eq!(classify(4, &hash, 4, &hash), Integrity::BadId { expected: 4 });
        assert_eq!(classify(4, &hash, 2, &hash), Integrity::BadId { expected: 4 });
        assert_eq!(classify(4, &hash, 5, &other), Integrity::BadHash);
    }

    #[test]
    fn client_msg_tagging() {
        let conf = ClientMsg::Confirmation(vec![1, 2, 3]);
        assert_eq!(ClientMsg::decode(&conf.encode()).unwrap(), conf);
        let ratchet = ClientMsg::Ratchet(vec![4, 5]);
        assert_eq!(ClientMsg::decode(&ratchet.encode()).unwrap(), ratchet);
        assert!(ClientMsg::decode(b"").is_err());
        assert!(ClientMsg::decode(b"Xabc").is_err());
    }

    #[test]
    fn confirmation_padding_round_trip() {
        let json = br#"{"sender_key":"aa","dh_key":"bb","info":""}"#;
        let padded = pad_confirmation(json).unwrap();
        assert_eq!(padded.len(), CONF_PLAINTEXT_SIZE);
        assert_eq!(unpad_confirmation(&padded).unwrap(), json);
        assert!(pad_confirmation(&vec![0u8; CONF_PLAINTEXT_SIZE]).is_err());
    }

    #[test]
    fn confirmation_round_trip() {
        let conf = Confirmation::new(&[3u8; 32], &[4u8; 32], b"profile");
        let json = serde_json::to_vec(&conf).unwrap();
        let back: Confirmation = serde_json::from_slice(&json).unwrap();
        assert_eq!(back.sender_key_bytes(), Some([3u8; 32]));
        assert_eq!(back.dh_key_bytes(), Some([4u8; 32]));
        assert_eq!(back.info_bytes(), Some(b"profile".to_vec()));
    }
}
