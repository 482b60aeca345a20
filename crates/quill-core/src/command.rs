//! Relay commands and responses — the body bytes of a transmission.
//!
//! Encoding is an ASCII token, one space, then the command's fields:
//! fixed-size fields (keys, ids, integers) raw, variable-size fields
//! length-prefixed. The same codec runs on both sides, so
//! `decode(encode(x)) == x` is the contract every variant upholds.

use crate::crypto::{DhPublic, VerifyKey};
use crate::ids::EntityId;

/// Largest message body a relay accepts in SEND. One byte more is rejected
/// with `ERR LARGE`. Chosen so a maximal message plus framing still fits a
/// single transport block; file bodies (FPUT) are exempt and span blocks.
pub const MAX_MESSAGE_BODY: usize = 16000;

// ── Message flags ─────────────────────────────────────────────────────────────

/// Per-message flag bits. Bit 0: notify the bound notifier on delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MsgFlags {
    pub notification: bool,
}

impl MsgFlags {
    pub fn to_byte(self) -> u8 {
        self.notification as u8
    }

    pub fn from_byte(b: u8) -> Self {
        Self {
            notification: b & 0x01 != 0,
        }
    }
}

// ── Commands ──────────────────────────────────────────────────────────────────

/// Metadata of one encrypted file chunk, declared at FNEW and checked at
/// FPUT time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileInfo {
    /// Exact size of the chunk body in bytes.
    pub size: u64,
    /// SHA-512 of the chunk body.
    pub digest: [u8; 64],
}

/// A client command addressed to a queue, a file chunk, or the session.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// Create a queue. Signed by the fresh recipient key.
    New {
        recipient_key: VerifyKey,
        dh_key: DhPublic,
        basic_auth: Option<Vec<u8>>,
    },
    /// Subscribe to messages on a queue.
    Sub,
    /// Secure the queue with the sender's key.
    Key { sender_key: VerifyKey },
    /// Bind a notifier for push notifications.
    NKey {
        notifier_key: VerifyKey,
        dh_key: DhPublic,
    },
    /// Remove the notifier binding.
    NDel,
    /// Suspend the queue: writes refused, reads still drain.
    Off,
    /// Delete the queue and its messages.
    Del,
    /// Append a message. Unsigned only while the queue has no sender key.
    Send { flags: MsgFlags, body: Vec<u8> },
    /// Consume the currently delivered message.
    Ack { msg_id: EntityId },
    /// Session liveness.
    Ping,
    /// Create a file chunk slot with recipient credentials. Signed by the
    /// fresh chunk sender key.
    FNew {
        sender_key: VerifyKey,
        info: FileInfo,
        recipient_keys: Vec<VerifyKey>,
    },
    /// Upload the chunk body. Signed by the chunk sender key.
    FPut { body: Vec<u8> },
    /// Download the chunk body, supplying a fresh DH key for the reply.
    FGet { dh_key: DhPublic },
    /// Acknowledge receipt; deletes this recipient's replica.
    FAck,
    /// Delete the chunk and all replicas. Sender only.
    FDel,
}

impl Command {
    /// True if this command is allowed without a signature: PING always,
    /// SEND only while the queue is unsecured (checked by the server).
    pub fn may_be_unsigned(&self) -> bool {
        matches!(self, Command::Ping | Command::Send { .. })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        match self {
            Command::New {
                recipient_key,
                dh_key,
                basic_auth,
            } => {
                out.extend_from_slice(b"NEW ");
                out.extend_from_slice(recipient_key.as_bytes());
                out.extend_from_slice(dh_key.as_bytes());
                match basic_auth {
                    Some(auth) => {
                        out.push(auth.len() as u8);
                        out.extend_from_slice(auth);
                    }
                    None => out.push(0),
                }
            }
            Command::Sub => out.extend_from_slice(b"SUB"),
            Command::Key { sender_key } => {
                out.extend_from_slice(b"KEY ");
                out.extend_from_slice(sender_key.as_bytes());
            }
            Command::NKey {
                notifier_key,
                dh_key,
            } => {
                out.extend_from_slice(b"NKEY ");
                out.extend_from_slice(notifier_key.as_bytes());
                out.extend_from_slice(dh_key.as_bytes());
            }
            Command::NDel => out.extend_from_slice(b"NDEL"),
            Command::Off => out.extend_from_slice(b"OFF"),
            Command::Del => out.extend_from_slice(b"DEL"),
            Command::Send { flags, body } => {
                out.extend_from_slice(b"SEND ");
                out.push(flags.to_byte());
                out.extend_from_slice(&(body.len() as u32).to_le_bytes());
                out.extend_from_slice(body);
            }
            Command::Ack { msg_id } => {
                out.extend_from_slice(b"ACK ");
                out.extend_from_slice(msg_id.as_bytes());
            }
            Command::Ping => out.extend_from_slice(b"PING"),
            Command::FNew {
                sender_key,
                info,
                recipient_keys,
            } => {
                out.extend_from_slice(b"FNEW ");
                out.extend_from_slice(sender_key.as_bytes());
                out.extend_from_slice(&info.size.to_le_bytes());
                out.extend_from_slice(&info.digest);
                out.push(recipient_keys.len() as u8);
                for key in recipient_keys {
                    out.extend_from_slice(key.as_bytes());
                }
            }
            Command::FPut { body } => {
                out.extend_from_slice(b"FPUT ");
                out.extend_from_slice(&(body.len() as u32).to_le_bytes());
                out.extend_from_slice(body);
            }
            Command::FGet { dh_key } => {
                out.extend_from_slice(b"FGET ");
                out.extend_from_slice(dh_key.as_bytes());
            }
            Command::FAck => out.extend_from_slice(b"FACK"),
            Command::FDel => out.extend_from_slice(b"FDEL"),
        }
        out
    }

    pub fn decode(data: &[u8]) -> Result<Self, CodecError> {
        let (token, mut cur) = split_token(data);
        match token {
            b"NEW" => {
                let recipient_key = cur.verify_key()?;
                let dh_key = cur.dh_key()?;
                let auth = cur.short_bytes()?;
                cur.end()?;
                Ok(Command::New {
                    recipient_key,
                    dh_key,
                    basic_auth: (!auth.is_empty()).then_some(auth),
                })
            }
            b"SUB" => cur.end().map(|_| Command::Sub),
            b"KEY" => {
                let sender_key = cur.verify_key()?;
                cur.end()?;
                Ok(Command::Key { sender_key })
            }
            b"NKEY" => {
                let notifier_key = cur.verify_key()?;
                let dh_key = cur.dh_key()?;
                cur.end()?;
                Ok(Command::NKey {
                    notifier_key,
                    dh_key,
                })
            }
            b"NDEL" => cur.end().map(|_| Command::NDel),
            b"OFF" => cur.end().map(|_| Command::Off),
            b"DEL" => cur.end().map(|_| Command::Del),
            b"SEND" => {
                let flags = MsgFlags::from_byte(cur.u8()?);
                let body = cur.long_bytes()?;
                cur.end()?;
                Ok(Command::Send { flags, body })
            }
            b"ACK" => {
                let msg_id = cur.entity_id()?;
                cur.end()?;
                Ok(Command::Ack { msg_id })
            }
            b"PING" => cur.end().map(|_| Command::Ping),
            b"FNEW" => {
                let sender_key = cur.verify_key()?;
                let size = cur.u64()?;
                let digest = cur.digest()?;
                let count = cur.u8()? as usize;
                let mut recipient_keys = Vec::with_capacity(count);
                for _ in 0..count {
                    recipient_keys.push(cur.verify_key()?);
                }
                cur.end()?;
                Ok(Command::FNew {
                    sender_key,
                    info: FileInfo { size, digest },
                    recipient_keys,
                })
            }
            b"FPUT" => {
                let body = cur.long_bytes()?;
                cur.end()?;
                Ok(Command::FPut { body })
            }
            b"FGET" => {
                let dh_key = cur.dh_key()?;
                cur.end()?;
                Ok(Command::FGet { dh_key })
            }
            b"FACK" => cur.end().map(|_| Command::FAck),
            b"FDEL" => cur.end().map(|_| Command::FDel),
            _ => Err(CodecError::UnknownToken),
        }
    }
}

// ── Messages ──────────────────────────────────────────────────────────────────

/// A message as delivered to a subscriber.
///
/// The quota marker is a distinguishable shape carrying only id and
/// timestamp — it tells the reader that writes were refused after it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayMessage {
    Content {
        msg_id: EntityId,
        ts: u64,
        flags: MsgFlags,
        body: Vec<u8>,
    },
    QuotaMarker {
        msg_id: EntityId,
        ts: u64,
    },
}

impl RelayMessage {
    pub fn msg_id(&self) -> EntityId {
        match self {
            RelayMessage::Content { msg_id, .. } => *msg_id,
            RelayMessage::QuotaMarker { msg_id, .. } => *msg_id,
        }
    }

    pub fn ts(&self) -> u64 {
        match self {
            RelayMessage::Content { ts, .. } => *ts,
            RelayMessage::QuotaMarker { ts, .. } => *ts,
        }
    }
}

// ── Responses ─────────────────────────────────────────────────────────────────

/// A relay response correlated to a command, or a pushed delivery.
#[derive(Debug, Clone, PartialEq)]
pub enum Response {
    /// Queue created: both ids and the relay's DH half for push payloads.
    Ids {
        recipient_id: EntityId,
        sender_id: EntityId,
        srv_dh: DhPublic,
    },
    /// Notifier bound.
    NtfId {
        notifier_id: EntityId,
        srv_dh: DhPublic,
    },
    Ok,
    /// A delivered message (response to SUB, or pushed on arrival).
    Msg(RelayMessage),
    /// This subscriber was replaced by a newer SUB.
    End,
    Pong,
    /// File chunk slot created.
    FileIds {
        sender_id: EntityId,
        recipient_ids: Vec<EntityId>,
    },
    /// Chunk body, sealed under the DH agreement with the requester.
    FileData { srv_dh: DhPublic, body: Vec<u8> },
    Err(ErrorCode),
}

impl Response {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        match self {
            Response::Ids {
                recipient_id,
                sender_id,
                srv_dh,
            } => {
                out.extend_from_slice(b"IDS ");
                out.extend_from_slice(recipient_id.as_bytes());
                out.extend_from_slice(sender_id.as_bytes());
                out.extend_from_slice(srv_dh.as_bytes());
            }
            Response::NtfId {
                notifier_id,
                srv_dh,
            } => {
                out.extend_from_slice(b"NID ");
                out.extend_from_slice(notifier_id.as_bytes());
                out.extend_from_slice(srv_dh.as_bytes());
            }
            Response::Ok => out.extend_from_slice(b"OK"),
            Response::Msg(msg) => {
                out.extend_from_slice(b"MSG ");
                match msg {
                    RelayMessage::Content {
                        msg_id,
                        ts,
                        flags,
                        body,
                    } => {
                        out.push(1);
                        out.extend_from_slice(msg_id.as_bytes());
                        out.extend_from_slice(&ts.to_le_bytes());
                        out.push(flags.to_byte());
                        out.extend_from_slice(&(body.len() as u32).to_le_bytes());
                        out.extend_from_slice(body);
                    }
                    RelayMessage::QuotaMarker { msg_id, ts } => {
                        out.push(2);
                        out.extend_from_slice(msg_id.as_bytes());
                        out.extend_from_slice(&ts.to_le_bytes());
                    }
                }
            }
            Response::End => out.extend_from_slice(b"END"),
            Response::Pong => out.extend_from_slice(b"PONG"),
            Response::FileIds {
                sender_id,
                recipient_ids,
            } => {
                out.extend_from_slice(b"FIDS ");
                out.extend_from_slice(sender_id.as_bytes());
                out.push(recipient_ids.len() as u8);
                for id in recipient_ids {
                    out.extend_from_slice(id.as_bytes());
                }
            }
            Response::FileData { srv_dh, body } => {
                out.extend_from_slice(b"FDAT ");
                out.extend_from_slice(srv_dh.as_bytes());
                out.extend_from_slice(&(body.len() as u32).to_le_bytes());
                out.extend_from_slice(body);
            }
            Response::Err(code) => {
                out.extend_from_slice(b"ERR ");
                out.extend_from_slice(code.as_token().as_bytes());
            }
        }
        out
    }

    pub fn decode(data: &[u8]) -> Result<Self, CodecError> {
        let (token, mut cur) = split_token(data);
        match token {
            b"IDS" => {
                let recipient_id = cur.entity_id()?;
                let sender_id = cur.entity_id()?;
                let srv_dh = cur.dh_key()?;
                cur.end()?;
                Ok(Response::Ids {
                    recipient_id,
                    sender_id,
                    srv_dh,
                })
            }
            b"NID" => {
                let notifier_id = cur.entity_id()?;
                let srv_dh = cur.dh_key()?;
                cur.end()?;
                Ok(Response::NtfId {
                    notifier_id,
                    srv_dh,
                })
            }
            b"OK" => cur.end().map(|_| Response::Ok),
            b"MSG" => {
                let tag = cur.u8()?;
                let msg = match tag {
                    1 => {
                        let msg_id = cur.entity_id()?;
                        let ts = cur.u64()?;
                        let flags = MsgFlags::from_byte(cur.u8()?);
                        let body = cur.long_bytes()?;
                        RelayMessage::Content {
                            msg_id,
                            ts,
                            flags,
                            body,
                        }
                    }
                    2 => {
                        let msg_id = cur.entity_id()?;
                        let ts = cur.u64()?;
                        RelayMessage::QuotaMarker { msg_id, ts }
                    }
                    _ => return Err(CodecError::Malformed),
                };
                cur.end()?;
                Ok(Response::Msg(msg))
            }
            b"END" => cur.end().map(|_| Response::End),
            b"PONG" => cur.end().map(|_| Response::Pong),
            b"FIDS" => {
                let sender_id = cur.entity_id()?;
                let count = cur.u8()? as usize;
                let mut recipient_ids = Vec::with_capacity(count);
                for _ in 0..count {
                    recipient_ids.push(cur.entity_id()?);
                }
                cur.end()?;
                Ok(Response::FileIds {
                    sender_id,
                    recipient_ids,
                })
            }
            b"FDAT" => {
                let srv_dh = cur.dh_key()?;
                let body = cur.long_bytes()?;
                cur.end()?;
                Ok(Response::FileData { srv_dh, body })
            }
            b"ERR" => {
                let code = ErrorCode::from_token(std::str::from_utf8(cur.rest()).map_err(|_| CodecError::Malformed)?)?;
                Ok(Response::Err(code))
            }
            _ => Err(CodecError::UnknownToken),
        }
    }
}

// ── Error codes ───────────────────────────────────────────────────────────────

/// Protocol-level error responses. Kinds, not causes — a relay never
/// explains *why* authentication failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    /// Signature failure, wrong role, unknown queue, revoked credentials.
    Auth,
    /// Queue over quota; retry after the reader drains.
    Quota,
    /// ACK with no delivered message, or mismatched message id.
    NoMsg,
    /// Body exceeds [`MAX_MESSAGE_BODY`].
    Large,
    /// No mutually supported protocol version.
    Version,
    /// Entity id already exists.
    Duplicate,
    /// File body size differs from its declaration.
    Size,
    /// File body digest differs from its declaration.
    Digest,
    /// Command not allowed in this context (wrong role or queue state).
    Prohibited,
    /// Entity missing where required, or present where forbidden.
    NoEntity,
    /// Unparseable command.
    Syntax,
    /// Relay-side failure unrelated to the request.
    Internal,
}

impl ErrorCode {
    pub fn as_token(&self) -> &'static str {
        match self {
            ErrorCode::Auth => "AUTH",
            ErrorCode::Quota => "QUOTA",
            ErrorCode::NoMsg => "NO_MSG",
            ErrorCode::Large => "LARGE",
            ErrorCode::Version => "VERSION",
            ErrorCode::Duplicate => "DUPLICATE",
            ErrorCode::Size => "SIZE",
            ErrorCode::Digest => "DIGEST",
            ErrorCode::Prohibited => "PROHIBITED",
            ErrorCode::NoEntity => "NO_ENTITY",
            ErrorCode::Syntax => "SYNTAX",
            ErrorCode::Internal => "INTERNAL",
        }
    }

    pub fn from_token(token: &str) -> Result<Self, CodecError> {
        match token {
            "AUTH" => Ok(ErrorCode::Auth),
            "QUOTA" => Ok(ErrorCode::Quota),
            "NO_MSG" => Ok(ErrorCode::NoMsg),
            "LARGE" => Ok(ErrorCode::Large),
            "VERSION" => Ok(ErrorCode::Version),
            "DUPLICATE" => Ok(ErrorCode::Duplicate),
            "SIZE" => Ok(ErrorCode::Size),
            "DIGEST" => Ok(ErrorCode::Digest),
            "PROHIBITED" => Ok(ErrorCode::Prohibited),
            "NO_ENTITY" => Ok(ErrorCode::NoEntity),
            "SYNTAX" => Ok(ErrorCode::Syntax),
            "INTERNAL" => Ok(ErrorCode::Internal),
            _ => Err(CodecError::UnknownToken),
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_token())
    }
}

// ── Codec plumbing ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    #[error("unknown command or response token")]
    UnknownToken,

    #[error("malformed or truncated fields")]
    Malformed,

    #[error("trailing bytes after command")]
    Trailing,
}

fn split_token(data: &[u8]) -> (&[u8], Cursor<'_>) {
    match data.iter().position(|&b| b == b' ') {
        Some(sp) => (&data[..sp], Cursor::new(&data[sp + 1..])),
        None => (data, Cursor::new(&[])),
    }
}

struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], CodecError> {
        if self.pos + n > self.data.len() {
            return Err(CodecError::Malformed);
        }
        let s = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(s)
    }

    fn u8(&mut self) -> Result<u8, CodecError> {
        Ok(self.take(1)?[0])
    }

    fn u64(&mut self) -> Result<u64, CodecError> {
        Ok(u64::from_le_bytes(
            self.take(8)?.try_into().expect("8 bytes"),
        ))
    }

    fn verify_key(&mut self) -> Result<VerifyKey, CodecError> {
        VerifyKey::from_slice(self.take(32)?).ok_or(CodecError::Malformed)
    }

    fn dh_key(&mut self) -> Result<DhPublic, CodecError> {
        DhPublic::from_slice(self.take(32)?).ok_or(CodecError::Malformed)
    }

    fn entity_id(&mut self) -> Result<EntityId, CodecError> {
        EntityId::from_slice(self.take(24)?).ok_or(CodecError::Malformed)
    }

    fn digest(&mut self) -> Result<[u8; 64], CodecError> {
        self.take(64)?.try_into().map_err(|_| CodecError::Malformed)
    }

    /// u8-length-prefixed bytes.
    fn short_bytes(&mut self) -> Result<Vec<u8>, CodecError> {
        let len = self.u8()? as usize;
        Ok(self.take(len)?.to_vec())
    }

    /// u32-length-prefixed bytes.
    fn long_bytes(&mut self) -> Result<Vec<u8>, CodecError> {
        let len =
            u32::from_le_bytes(self.take(4)?.try_into().expect("4 bytes")) as usize;
        Ok(self.take(len)?.to_vec())
    }

    fn rest(&mut self) -> &'a [u8] {
        let s = &self.data[self.pos..];
        self.pos = self.data.len();
        s
    }

    fn end(&mut self) -> Result<(), CodecError> {
        if self.pos == self.data.len() {
            Ok(())
        } else {
            Err(CodecError::Trailing)
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
