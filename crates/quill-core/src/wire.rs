//! Quill wire format — padded transport blocks and transmission framing.
//!
//! Everything a client and a relay exchange after the handshake travels in
//! fixed-size blocks. A block is padded to [`BLOCK_SIZE`] before transport
//! encryption, so a passive observer sees a uniform stream of equal-length
//! ciphertexts regardless of how many commands are in flight or how large
//! message bodies are.
//!
//! Block layout:
//!
//! ```text
//!   [BlockHeader (40 bytes)] [content (content_len bytes)] [zero padding]
//! ```
//!
//! Content is a sequence of transmissions. Short transmissions are batched
//! several-per-block; a transmission whose body does not fit (file chunks)
//! spans the remainder in continuation blocks.
//!
//! Transmission layout:
//!
//! ```text
//!   [sig_len u8] [signature] [corr_len u8] [corr_id]
//!   [entity_len u8] [entity_id] [body_len u32 LE] [body]
//! ```
//!
//! The header is `#[repr(C, packed)]` with zerocopy derives for
//! deterministic layout. There is no unsafe code in this module.

use static_assertions::assert_eq_size;
use zerocopy::{AsBytes, FromBytes, FromZeroes};

use crate::crypto::CommandSignature;
use crate::ids::EntityId;

// ── Constants ─────────────────────────────────────────────────────────────────

/// Padded plaintext size of every transport block.
pub const BLOCK_SIZE: usize = 16384;

/// Bytes of content a single block can carry.
pub const BLOCK_CAPACITY: usize = BLOCK_SIZE - HEADER_LEN;

/// Size of the block header.
pub const HEADER_LEN: usize = 40;

/// Oldest protocol version this build understands.
pub const VERSION_MIN: u16 = 1;

/// Newest protocol version this build speaks.
pub const VERSION_MAX: u16 = 2;

/// Upper bound on a single transmission body. File chunks stay well under
/// this; anything larger is a framing error, not a buffering request.
pub const MAX_TX_BODY: usize = 32 * 1024 * 1024;

// ── Block header ──────────────────────────────────────────────────────────────

/// Fixed header of every transport block.
///
/// The session id is repeated in each block and checked against the
/// session established at handshake; a block carried over from another
/// session is dropped before any command parsing.
///
/// Wire size: 40 bytes.
#[derive(Debug, Clone, AsBytes, FromBytes, FromZeroes)]
#[repr(C, packed)]
pub struct BlockHeader {
    /// Session id derived from the handshake nonces.
    pub session_id: [u8; 32],

    /// Length of the content following this header. The rest of the block
    /// is zero padding.
    pub content_len: u32,

    /// 1 = transmissions, 2 = continuation of an oversized body.
    pub kind: u8,

    /// Number of transmissions in a kind-1 block. 0 for continuations.
    pub tx_count: u8,

    /// Reserved, must be zero.
    pub reserved: [u8; 2],
}

assert_eq_size!(BlockHeader, [u8; HEADER_LEN]);

/// Block content discriminator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum BlockKind {
    Transmissions = 1,
    Continuation = 2,
}

impl TryFrom<u8> for BlockKind {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(BlockKind::Transmissions),
            2 => Ok(BlockKind::Continuation),
            other => Err(WireError::UnknownBlockKind(other)),
        }
    }
}

// ── Transmission ──────────────────────────────────────────────────────────────

/// One framed command or response.
#[derive(Debug, Clone, PartialEq)]
pub struct Transmission {
    /// Signature over the canonical bytes; absent for responses and for the
    /// single allowed unsigned SEND.
    pub signature: Option<CommandSignature>,

    /// Client-chosen correlation id echoed in the response. Opaque,
    /// at most 255 bytes.
    pub corr_id: Vec<u8>,

    /// The queue/file entity the command addresses. Absent for PING and
    /// session-level responses.
    pub entity_id: Option<EntityId>,

    /// Encoded command or response.
    pub body: Vec<u8>,
}

impl Transmission {
    /// The bytes a command signature covers: the session id followed by the
    /// frame fields. Binding the session id prevents cross-session replay.
    pub fn signed_bytes(session_id: &[u8; 32], corr_id: &[u8], entity_id: &[u8], body: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(32 + 2 + corr_id.len() + entity_id.len() + body.len());
        out.extend_from_slice(session_id);
        out.push(corr_id.len() as u8);
        out.extend_from_slice(corr_id);
        out.push(entity_id.len() as u8);
        out.extend_from_slice(entity_id);
        out.extend_from_slice(body);
        out
    }

    /// Encoded size of this transmission inside a block.
    fn encoded_len(&self) -> usize {
        let sig_len = self.signature.as_ref().map(|s| s.0.len()).unwrap_or(0);
        let entity_len = self.entity_id.as_ref().map(|_| 24).unwrap_or(0);
        1 + sig_len + 1 + self.corr_id.len() + 1 + entity_len + 4 + self.body.len()
    }

    fn encode_into(&self, out: &mut Vec<u8>) {
        match &self.signature {
            Some(sig) => {
                out.push(sig.0.len() as u8);
                out.extend_from_slice(&sig.0);
            }
            None => out.push(0),
        }
        out.push(self.corr_id.len() as u8);
        out.extend_from_slice(&self.corr_id);
        match &self.entity_id {
            Some(id) => {
                out.push(24);
                out.extend_from_slice(id.as_bytes());
            }
            None => out.push(0),
        }
        out.extend_from_slice(&(self.body.len() as u32).to_le_bytes());
        out.extend_from_slice(&self.body);
    }
}

// ── Encoding ──────────────────────────────────────────────────────────────────

/// Encode transmissions into padded blocks under one session.
///
/// Short transmissions are batched greedily; a transmission that does not
/// fit in the remainder of the current block starts a new one; a
/// transmission larger than a whole block spills into continuation blocks.
pub fn encode_blocks(session_id: &[u8; 32], txs: &[Transmission]) -> Result<Vec<Vec<u8>>, WireError> {
    let mut blocks = Vec::new();
    let mut content: Vec<u8> = Vec::with_capacity(BLOCK_CAPACITY);
    let mut count: u8 = 0;

    let flush = |blocks: &mut Vec<Vec<u8>>, content: &mut Vec<u8>, count: &mut u8| {
        if *count > 0 {
            blocks.push(build_block(session_id, BlockKind::Transmissions, *count, content));
            content.clear();
            *count = 0;
        }
    };

    for tx in txs {
        if tx.corr_id.len() > u8::MAX as usize {
            return Err(WireError::CorrIdTooLong(tx.corr_id.len()));
        }
        let len = tx.encoded_len();

        if len <= BLOCK_CAPACITY - content.len() && count < u8::MAX {
            tx.encode_into(&mut content);
            count += 1;
            continue;
        }

        flush(&mut blocks, &mut content, &mut count);

        if len <= BLOCK_CAPACITY {
            tx.encode_into(&mut content);
            count = 1;
            continue;
        }

        // Oversized: first block carries the prefix and the body head,
        // continuations carry the rest.
        let mut encoded = Vec::with_capacity(len);
        tx.encode_into(&mut encoded);
        blocks.push(build_block(
            session_id,
            BlockKind::Transmissions,
            1,
            &encoded[..BLOCK_CAPACITY],
        ));
        let mut rest = &encoded[BLOCK_CAPACITY..];
        while !rest.is_empty() {
            let take = rest.len().min(BLOCK_CAPACITY);
            blocks.push(build_block(session_id, BlockKind::Continuation, 0, &rest[..take]));
            rest = &rest[take..];
        }
    }

    flush(&mut blocks, &mut content, &mut count);
    Ok(blocks)
}

fn build_block(session_id: &[u8; 32], kind: BlockKind, tx_count: u8, content: &[u8]) -> Vec<u8> {
    debug_assert!(content.len() <= BLOCK_CAPACITY);
    let header = BlockHeader {
        session_id: *session_id,
        content_len: content.len() as u32,
        kind: kind as u8,
        tx_count,
        reserved: [0; 2],
    };
    let mut block = vec![0u8; BLOCK_SIZE];
    block[..HEADER_LEN].copy_from_slice(header.as_bytes());
    block[HEADER_LEN..HEADER_LEN + content.len()].copy_from_slice(content);
    block
}

// ── Decoding ──────────────────────────────────────────────────────────────────

/// Reassembles transmissions from a stream of blocks.
///
/// Holds the partial state of an oversized transmission between blocks.
/// One assembler per session; blocks from other sessions are rejected.
pub struct BlockAssembler {
    session_id: [u8; 32],
    /// Encoded bytes of a transmission still waiting for continuations,
    /// plus the total encoded length it will reach.
    partial: Option<(Vec<u8>, usize)>,
}

impl BlockAssembler {
    pub fn new(session_id: [u8; 32]) -> Self {
        Self {
            session_id,
            partial: None,
        }
    }

    /// Feed one padded block; returns all transmissions completed by it.
    pub fn feed(&mut self, block: &[u8]) -> Result<Vec<Transmission>, WireError> {
        if block.len() != BLOCK_SIZE {
            return Err(WireError::BadBlockSize(block.len()));
        }
        let header = BlockHeader::read_from_prefix(block).ok_or(WireError::Truncated)?;
        if header.session_id != self.session_id {
            return Err(WireError::SessionMismatch);
        }
        let content_len = header.content_len as usize;
        if content_len > BLOCK_CAPACITY {
            return Err(WireError::Truncated);
        }
        let content = &block[HEADER_LEN..HEADER_LEN + content_len];
        let kind = BlockKind::try_from(header.kind)?;

        match kind {
            BlockKind::Continuation => {
                let (buf, total) = self.partial.as_mut().ok_or(WireError::OrphanContinuation)?;
                buf.extend_from_slice(content);
                if buf.len() > *total {
                    return Err(WireError::Truncated);
                }
                if buf.len() == *total {
                    let (buf, _) = self.partial.take().expect("partial present");
                    let (tx, consumed) = decode_transmission(&buf)?;
                    if consumed != buf.len() {
                        return Err(WireError::Truncated);
                    }
                    return Ok(vec![tx]);
                }
                Ok(Vec::new())
            }
            BlockKind::Transmissions => {
                if self.partial.is_some() {
                    return Err(WireError::OrphanContinuation);
                }
                let mut txs = Vec::with_capacity(header.tx_count as usize);
                let mut rest = content;
                for i in 0..header.tx_count {
                    match try_decode_transmission(rest)? {
                        Decoded::Complete(tx, consumed) => {
                            txs.push(tx);
                            rest = &rest[consumed..];
                        }
                        Decoded::NeedsMore(total) => {
                            // Only the final transmission of a block may spill.
                            if i != header.tx_count - 1 {
                                return Err(WireError::Truncated);
                            }
                            self.partial = Some((rest.to_vec(), total));
                            rest = &[];
                        }
                    }
                }
                if !rest.is_empty() {
                    return Err(WireError::Truncated);
                }
                Ok(txs)
            }
        }
    }
}

enum Decoded {
    Complete(Transmission, usize),
    /// Not enough bytes yet; the full encoded transmission will be this long.
    NeedsMore(usize),
}

fn take<'a>(data: &'a [u8], pos: &mut usize, n: usize) -> Result<&'a [u8], WireError> {
    if *pos + n > data.len() {
        return Err(WireError::Truncated);
    }
    let s = &data[*pos..*pos + n];
    *pos += n;
    Ok(s)
}

fn try_decode_transmission(data: &[u8]) -> Result<Decoded, WireError> {
    let mut pos = 0usize;

    let sig_len = take(data, &mut pos, 1)?[0] as usize;
    if sig_len != 0 && sig_len != 64 {
        return Err(WireError::BadSignatureLength(sig_len));
    }
    let sig_bytes = take(data, &mut pos, sig_len)?.to_vec();
    let corr_len = take(data, &mut pos, 1)?[0] as usize;
    let corr_id = take(data, &mut pos, corr_len)?.to_vec();
    let entity_len = take(data, &mut pos, 1)?[0] as usize;
    if entity_len != 0 && entity_len != 24 {
        return Err(WireError::BadEntityLength(entity_len));
    }
    let entity_bytes = take(data, &mut pos, entity_len)?.to_vec();
    let body_len =
        u32::from_le_bytes(take(data, &mut pos, 4)?.try_into().expect("4 bytes")) as usize;
    if body_len > MAX_TX_BODY {
        return Err(WireError::Truncated);
    }

    let total = pos + body_len;
    if data.len() < total {
        return Ok(Decoded::NeedsMore(total));
    }
    let body = data[pos..total].to_vec();

    Ok(Decoded::Complete(
        Transmission {
            signature: if sig_len == 0 {
                None
            } else {
                CommandSignature::from_slice(&sig_bytes)
            },
            corr_id,
            entity_id: if entity_len == 0 {
                None
            } else {
                EntityId::from_slice(&entity_bytes)
            },
            body,
        },
        total,
    ))
}

fn decode_transmission(data: &[u8]) -> Result<(Transmission, usize), WireError> {
    match try_decode_transmission(data)? {
        Decoded::Complete(tx, consumed) => Ok((tx, consumed)),
        Decoded::NeedsMore(_) => Err(WireError::Truncated),
    }
}

// ── Version hellos ────────────────────────────────────────────────────────────

/// Client handshake payload: the supported version range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientHello {
    pub v_min: u16,
    pub v_max: u16,
}

impl ClientHello {
    pub fn current() -> Self {
        Self {
            v_min: VERSION_MIN,
            v_max: VERSION_MAX,
        }
    }

    pub fn encode(&self) -> [u8; 4] {
        let mut out = [0u8; 4];
        out[..2].copy_from_slice(&self.v_min.to_le_bytes());
        out[2..].copy_from_slice(&self.v_max.to_le_bytes());
        out
    }

    pub fn decode(data: &[u8]) -> Result<Self, WireError> {
        if data.len() != 4 {
            return Err(WireError::BadHello);
        }
        Ok(Self {
            v_min: u16::from_le_bytes(data[..2].try_into().expect("2 bytes")),
            v_max: u16::from_le_bytes(data[2..].try_into().expect("2 bytes")),
        })
    }

    /// Pick the highest mutually supported version, if any.
    pub fn negotiate(&self) -> Option<u16> {
        let lo = self.v_min.max(VERSION_MIN);
        let hi = self.v_max.min(VERSION_MAX);
        (lo <= hi).then_some(hi)
    }
}

/// Server handshake payload: the negotiated version.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServerHello {
    pub version: u16,
}

impl ServerHello {
    pub fn encode(&self) -> [u8; 2] {
        self.version.to_le_bytes()
    }

    pub fn decode(data: &[u8]) -> Result<Self, WireError> {
        if data.len() != 2 {
            return Err(WireError::BadHello);
        }
        Ok(Self {
            version: u16::from_le_bytes(data.try_into().expect("2 bytes")),
        })
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

/// Errors that can arise when interpreting wire-format data.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    #[error("unknown block kind: 0x{0:02x}")]
    UnknownBlockKind(u8),

    #[error("block has wrong size: {0}")]
    BadBlockSize(usize),

    #[error("block session id does not match this session")]
    SessionMismatch,

    #[error("truncated or malformed block content")]
    Truncated,

    #[error("continuation without a pending transmission")]
    OrphanContinuation,

    #[error("signature length {0} is not 0 or 64")]
    BadSignatureLength(usize),

    #[error("entity id length {0} is not 0 or 24")]
    BadEntityLength(usize),

    #[error("correlation id too long: {0}")]
    CorrIdTooLong(usize),

    #[error("malformed handshake hello")]
    BadHello,
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn tx(corr: &[u8], body: Vec<u8>) -> Transmission {
        Transmission {
            signature: None,
            corr_id: corr.to_vec(),
            entity_id: Some(EntityId([9u8; 24])),
            body,
        }
    }

    #[test]
    fn header_size_is_fixed() {
        assert_eq!(std::mem::size_of::<BlockHeader>(), HEADER_LEN);
    }

    #[test]
    fn single_transmission_round_trip() {
        let session = [3u8; 32];
        let t = tx(b"1", b"PING".to_vec());
        let blocks = encode_blocks(&session, std::slice::from_ref(&t)).unwrap();
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].len(), BLOCK_SIZE);

        let mut asm = BlockAssembler::new(session);
        let out = asm.feed(&blocks[0]).unwrap();
        assert_eq!(out, vec![t]);
    }

    #[test]
    fn short_transmissions_batch_into_one_block() {
        let session = [3u8; 32];
        let txs: Vec<_> = (0..10u8).map(|i| tx(&[i], vec![i; 100])).collect();
        let blocks = encode_blocks(&session, &txs).unwrap();
        assert_eq!(blocks.len(), 1, "10 small transmissions must batch");

        let mut asm = BlockAssembler::new(session);
        assert_eq!(asm.feed(&blocks[0]).unwrap(), txs);
    }

    #[test]
    fn oversized_body_spans_continuation_blocks() {
        let session = [3u8; 32];
        let big = tx(b"big", vec![0xAB; 3 * BLOCK_CAPACITY]);
        let blocks = encode_blocks(&session, std::slice::from_ref(&big)).unwrap();
        assert!(blocks.len() >= 3);

        let mut asm = BlockAssembler::new(session);
        let mut out = Vec::new();
        for b in &blocks {
            out.extend(asm.feed(b).unwrap());
        }
        assert_eq!(out, vec![big]);
    }

    #[test]
    fn signed_transmission_round_trip() {
        use crate::crypto::SignKeyPair;

        let session = [5u8; 32];
        let key = SignKeyPair::generate();
        let entity = EntityId::random();
        let body = b"SEND payload".to_vec();
        let signed = Transmission::signed_bytes(&session, b"c1", entity.as_bytes(), &body);
        let t = Transmission {
            signature: Some(key.sign(&signed)),
            corr_id: b"c1".to_vec(),
            entity_id: Some(entity),
            body,
        };

        let blocks = encode_blocks(&session, std::slice::from_ref(&t)).unwrap();
        let mut asm = BlockAssembler::new(session);
        let out = asm.feed(&blocks[0]).unwrap();
        assert_eq!(out.len(), 1);

        let rx = &out[0];
        let recheck = Transmission::signed_bytes(
            &session,
            &rx.corr_id,
            rx.entity_id.as_ref().map(|e| e.as_bytes().as_slice()).unwrap_or(&[]),
            &rx.body,
        );
        assert!(key.verify_key().verify(&recheck, rx.signature.as_ref().unwrap()));
    }

    #[test]
    fn assembler_rejects_foreign_session() {
        let blocks = encode_blocks(&[1u8; 32], &[tx(b"x", vec![1])]).unwrap();
        let mut asm = BlockAssembler::new([2u8; 32]);
        assert_eq!(asm.feed(&blocks[0]), Err(WireError::SessionMismatch));
    }

    #[test]
    fn assembler_rejects_orphan_continuation() {
        let session = [1u8; 32];
        let big = tx(b"big", vec![0; 2 * BLOCK_CAPACITY]);
        let blocks = encode_blocks(&session, std::slice::from_ref(&big)).unwrap();
        // Feed a continuation without its head block.
        let mut asm = BlockAssembler::new(session);
        assert_eq!(asm.feed(&blocks[1]), Err(WireError::OrphanContinuation));
    }

    #[test]
    fn version_negotiation() {
        let hello = ClientHello { v_min: 1, v_max: 9 };
        assert_eq!(hello.negotiate(), Some(VERSION_MAX));

        let disjoint = ClientHello {
            v_min: VERSION_MAX + 1,
            v_max: VERSION_MAX + 5,
        };
        assert_eq!(disjoint.negotiate(), None);

        let round = ClientHello::decode(&ClientHello::current().encode()).unwrap();
        assert_eq!(round, ClientHello::current());
    }

    #[test]
    fn server_hello_round_trip() {
        let hello = ServerHello { version: 2 };
        assert_eq!(ServerHello::decode(&hello.encode()).unwrap(), hello);
        assert!(ServerHello::decode(&[1, 2, 3]).is_err());
    }
}
