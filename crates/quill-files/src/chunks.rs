//! File chunking and tail-tag stream encryption.
//!
//! A file is prepared for transfer in two steps:
//!
//!   1. The plaintext is prefixed with a fixed 1024-byte header carrying
//!      the filename, then encrypted as one continuous ChaCha20 stream
//!      with a single Poly1305 tag over the whole ciphertext appended at
//!      the end ("tail tag"), so `encrypted_size = 1024 + plaintext + 16`.
//!   2. The encrypted stream is split into chunks: default-size chunks
//!      while they fit, and a tail handled by [`prepare_chunks`].
//!
//! Chunks are numbered from 1. Chunk digests are SHA-512, matching the
//! relay's declaration check.

use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;

use chacha20::cipher::{KeyIvInit, StreamCipher};
use chacha20::ChaCha20;
use poly1305::universal_hash::{KeyInit, UniversalHash};
use poly1305::Poly1305;
use serde::{Deserialize, Serialize};

use quill_core::crypto::{ct_eq, Sha512Stream};

/// Fixed size of the encrypted file header.
pub const FILE_HEADER_SIZE: usize = 1024;

/// Tag appended after the ciphertext.
pub const TAIL_TAG_SIZE: usize = 16;

/// Streaming buffer. A multiple of the Poly1305 block size, so incremental
/// MAC updates equal the one-shot computation.
const IO_BUF: usize = 64 * 1024;

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ChunkError {
    #[error("file I/O: {0}")]
    Io(#[from] std::io::Error),

    #[error("stream authentication failed")]
    TagMismatch,

    #[error("encrypted stream shorter than header and tag")]
    TooShort,

    #[error("file header is malformed")]
    BadHeader,

    #[error("filename too long for the header")]
    NameTooLong,
}

// ── Chunk planning ────────────────────────────────────────────────────────────

/// Split an encrypted stream size into chunk sizes.
///
/// Default-size chunks while the remainder holds a full one. A tail
/// smaller than half a default chunk is split into small-chunk pieces
/// (the last piece absorbs the odd bytes); a larger tail travels as one
/// default-class chunk. The sizes always sum to `encrypted_size`.
pub fn prepare_chunks(encrypted_size: u64, default_size: u64, small_size: u64) -> Vec<u64> {
    debug_assert!(default_size >= small_size && small_size > 0);
    let mut sizes = Vec::new();
    let mut remaining = encrypted_size;
    while remaining >= default_size {
        sizes.push(default_size);
        remaining -= default_size;
    }
    if remaining == 0 {
        return sizes;
    }
    if remaining < default_size / 2 {
        let pieces = (remaining / small_size).max(1);
        for _ in 0..pieces - 1 {
            sizes.push(small_size);
        }
        sizes.push(remaining - (pieces - 1) * small_size);
    } else {
        sizes.push(remaining);
    }
    sizes
}

// ── File header ───────────────────────────────────────────────────────────────

/// The 1024-byte header prefixed to the plaintext before encryption.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileHeader {
    pub filename: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extra: Option<String>,
}

impl FileHeader {
    fn encode(&self) -> Result<[u8; FILE_HEADER_SIZE], ChunkError> {
        let json = serde_json::to_vec(self).expect("header serialization is infallible");
        if json.len() + 2 > FILE_HEADER_SIZE {
            return Err(ChunkError::NameTooLong);
        }
        let mut out = [0u8; FILE_HEADER_SIZE];
        out[..2].copy_from_slice(&(json.len() as u16).to_le_bytes());
        out[2..2 + json.len()].copy_from_slice(&json);
        Ok(out)
    }

    fn decode(data: &[u8]) -> Result<Self, ChunkError> {
        if data.len() != FILE_HEADER_SIZE {
            return Err(ChunkError::BadHeader);
        }
        let len = u16::from_le_bytes(data[..2].try_into().expect("2 bytes")) as usize;
        let json = data.get(2..2 + len).ok_or(ChunkError::BadHeader)?;
        serde_json::from_slice(json).map_err(|_| ChunkError::BadHeader)
    }
}

// ── Tail-tag stream ───────────────────────────────────────────────────────────

struct StreamCipherState {
    cipher: ChaCha20,
    mac: Poly1305,
}

impl StreamCipherState {
    /// The Poly1305 key is the first 32 bytes of keystream block 0; the
    /// payload keystream starts at block 1.
    fn new(key: &[u8; 32], nonce: &[u8; 12]) -> Self {
        let mut cipher = ChaCha20::new(key.into(), nonce.into());
        let mut mac_key = [0u8; 64];
        cipher.apply_keystream(&mut mac_key);
        let mac = Poly1305::new(poly1305::Key::from_slice(&mac_key[..32]));
        Self { cipher, mac }
    }
}

/// Encrypt `src` into `dst`: header, ciphertext, tail tag.
///
/// Returns `(encrypted_size, sha512 of the encrypted stream)` — exactly
/// what goes into the file description.
pub fn encrypt_file(
    src: &Path,
    dst: &Path,
    key: &[u8; 32],
    nonce: &[u8; 12],
    filename: &str,
) -> Result<(u64, [u8; 64]), ChunkError> {
    let mut input = File::open(src)?;
    let mut output = File::create(dst)?;
    let mut state = StreamCipherState::new(key, nonce);
    let mut digest = Sha512Stream::new();
    let mut written: u64 = 0;

    let emit =
        |state: &mut StreamCipherState, digest: &mut Sha512Stream, out: &mut File, buf: &mut [u8]| -> Result<u64, ChunkError> {
            state.cipher.apply_keystream(buf);
            state.mac.update_padded(buf);
            digest.update(buf);
            out.write_all(buf)?;
            Ok(buf.len() as u64)
        };

    let mut header = FileHeader {
        filename: filename.to_string(),
        extra: None,
    }
    .encode()?;
    written += emit(&mut state, &mut digest, &mut output, &mut header)?;

    let mut buf = vec![0u8; IO_BUF];
    loop {
        let n = input.read(&mut buf)?;
        if n == 0 {
            break;
        }
        written += emit(&mut state, &mut digest, &mut output, &mut buf[..n])?;
    }

    let tag: [u8; TAIL_TAG_SIZE] = state.mac.finalize().into();
    digest.update(&tag);
    output.write_all(&tag)?;
    output.flush()?;
    written += TAIL_TAG_SIZE as u64;

    Ok((written, digest.finalize()))
}

/// Decrypt an encrypted stream file into `dst`, returning the header.
///
/// The tag is verified over the full ciphertext before any plaintext is
/// trusted; the output file is written during the same pass but removed
/// again if the tag fails.
pub fn decrypt_file(
    src: &Path,
    dst: &Path,
    key: &[u8; 32],
    nonce: &[u8; 12],
) -> Result<FileHeader, ChunkError> {
    let total = std::fs::metadata(src)?.len();
    if total < (FILE_HEADER_SIZE + TAIL_TAG_SIZE) as u64 {
        return Err(ChunkError::TooShort);
    }
    let body_len = total - TAIL_TAG_SIZE as u64;

    let mut input = File::open(src)?;
    let mut state = StreamCipherState::new(key, nonce);

    // First pass: header bytes.
    let mut header_buf = [0u8; FILE_HEADER_SIZE];
    input.read_exact(&mut header_buf)?;
    state.mac.update_padded(&header_buf);
    state.cipher.apply_keystream(&mut header_buf);
    let header = FileHeader::decode(&header_buf)?;

    // Remaining ciphertext into the destination.
    let mut output = File::create(dst)?;
    let mut remaining = body_len - FILE_HEADER_SIZE as u64;
    let mut buf = vec![0u8; IO_BUF];
    while remaining > 0 {
        let take = remaining.min(IO_BUF as u64) as usize;
        input.read_exact(&mut buf[..take])?;
        state.mac.update_padded(&buf[..take]);
        state.cipher.apply_keystream(&mut buf[..take]);
        output.write_all(&buf[..take])?;
        remaining -= take as u64;
    }
    output.flush()?;

    let mut tag = [0u8; TAIL_TAG_SIZE];
    input.read_exact(&mut tag)?;
    let computed: [u8; TAIL_TAG_SIZE] = state.mac.finalize().into();
    if !ct_eq(&computed, &tag) {
        drop(output);
        let _ = std::fs::remove_file(dst);
        return Err(ChunkError::TagMismatch);
    }
    Ok(header)
}

/// Read one chunk span out of an encrypted stream file.
pub fn read_chunk(path: &Path, offset: u64, size: u64) -> Result<Vec<u8>, ChunkError> {
    use std::io::{Seek, SeekFrom};
    let mut file = File::open(path)?;
    file.seek(SeekFrom::Start(offset))?;
    let mut buf = vec![0u8; size as usize];
    file.read_exact(&mut buf)?;
    Ok(buf)
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    const MIB: u64 = 1024 * 1024;

    #[test]
    fn exact_multiple_uses_only_default_chunks() {
        let sizes = prepare_chunks(16 * MIB, 8 * MIB, MIB);
        assert_eq!(sizes, vec![8 * MIB, 8 * MIB]);
    }

    #[test]
    fn small_tail_splits_into_small_chunks() {
        // 17 MiB file → header + tag pushes the tail just over 1 MiB;
        // the tail becomes one small-class chunk absorbing the odd bytes.
        let encrypted = 17 * MIB + 1040;
        let sizes = prepare_chunks(encrypted, 8 * MIB, MIB);
        assert_eq!(sizes.len(), 3);
        assert_eq!(sizes[0], 8 * MIB);
        assert_eq!(sizes[1], 8 * MIB);
        assert_eq!(sizes.iter().sum::<u64>(), encrypted);
    }

    #[test]
    fn large_tail_is_one_chunk() {
        // 5 MiB tail ≥ half of 8 MiB → single default-class chunk.
        let sizes = prepare_chunks(8 * MIB + 5 * MIB, 8 * MIB, MIB);
        assert_eq!(sizes, vec![8 * MIB, 5 * MIB]);
    }

    #[test]
    fn multi_piece_small_tail() {
        // 2.5 MiB tail < 4 MiB → small pieces, last absorbs the half.
        let sizes = prepare_chunks(8 * MIB + 2 * MIB + MIB / 2, 8 * MIB, MIB);
        assert_eq!(sizes, vec![8 * MIB, MIB, MIB + MIB / 2]);
    }

    #[test]
    fn prepare_chunks_is_deterministic_and_sums() {
        for size in [1u64, 1000, MIB, 9 * MIB + 17, 33 * MIB] {
            let a = prepare_chunks(size, 8 * MIB, MIB);
            let b = prepare_chunks(size, 8 * MIB, MIB);
            assert_eq!(a, b);
            assert_eq!(a.iter().sum::<u64>(), size);
            assert!(!a.is_empty());
        }
    }

    #[test]
    fn encrypt_decrypt_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("plain.bin");
        let enc = dir.path().join("enc.bin");
        let out = dir.path().join("out.bin");

        let data: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
        std::fs::write(&src, &data).unwrap();

        let key = [7u8; 32];
        let nonce = [8u8; 12];
        let (size, digest) = encrypt_file(&src, &enc, &key, &nonce, "plain.bin").unwrap();
        assert_eq!(
            size,
            data.len() as u64 + FILE_HEADER_SIZE as u64 + TAIL_TAG_SIZE as u64
        );
        assert_eq!(std::fs::metadata(&enc).unwrap().len(), size);
        // The declared digest matches the bytes on disk.
        assert_eq!(
            digest.to_vec(),
            quill_core::crypto::sha512(&std::fs::read(&enc).unwrap()).to_vec()
        );

        let header = decrypt_file(&enc, &out, &key, &nonce).unwrap();
        assert_eq!(header.filename, "plain.bin");
        assert_eq!(std::fs::read(&out).unwrap(), data);
    }

    #[test]
    fn tampered_stream_is_rejected_and_output_removed() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("plain.bin");
        let enc = dir.path().join("enc.bin");
        let out = dir.path().join("out.bin");
        std::fs::write(&src, b"secret content").unwrap();

        let key = [1u8; 32];
        let nonce = [2u8; 12];
        encrypt_file(&src, &enc, &key, &nonce, "plain.bin").unwrap();

        let mut bytes = std::fs::read(&enc).unwrap();
        let mid = bytes.len() / 2;
        bytes[mid] ^= 0xff;
        std::fs::write(&enc, bytes).unwrap();

        assert!(matches!(
            decrypt_file(&enc, &out, &key, &nonce),
            Err(ChunkError::TagMismatch)
        ));
        assert!(!out.exists(), "unauthenticated output must not remain");
    }

    #[test]
    fn wrong_key_fails() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("plain.bin");
        let enc = dir.path().join("enc.bin");
        std::fs::write(&src, b"data").unwrap();
        encrypt_file(&src, &enc, &[1u8; 32], &[0u8; 12], "x").unwrap();
        assert!(decrypt_file(&enc, &dir.path().join("out"), &[2u8; 32], &[0u8; 12]).is_err());
    }

    #[test]
    fn read_chunk_extracts_spans() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stream.bin");
        let data: Vec<u8> = (0..1000u16).map(|i| (i % 256) as u8).collect();
        std::fs::write(&path, &data).unwrap();

        let chunk = read_chunk(&path, 100, 50).unwrap();
        assert_eq!(chunk, &data[100..150]);
    }
}
