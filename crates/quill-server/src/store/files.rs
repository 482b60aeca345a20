//! Relay-side file chunk storage.
//!
//! Chunks are stored under a two-level directory derived from the hex
//! sender id:
//!
//! ```text
//!   files/{sid[0..2]}/{sid[2..4]}/{full_hex_sid}.chunk   the body
//!   files/{sid[0..2]}/{sid[2..4]}/{full_hex_sid}.meta    JSON sidecar
//! ```
//!
//! The sidecar holds everything needed to rebuild the in-memory registry
//! after a restart; chunk bodies are immutable once stored and read via
//! mmap so concurrent downloads share the page cache.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;
use memmap2::Mmap;
use serde::{Deserialize, Serialize};

use quill_core::command::FileInfo;
use quill_core::crypto::{sha512, VerifyKey};
use quill_core::ids::EntityId;

use super::log::now_secs;

// ── Records ───────────────────────────────────────────────────────────────────

/// One recipient credential of a chunk.
#[derive(Debug, Clone)]
pub struct FileRecipient {
    pub recipient_id: EntityId,
    pub key: VerifyKey,
    pub acked: bool,
}

/// A chunk slot: declared metadata, credentials, and body state.
#[derive(Debug, Clone)]
pub struct FileRecord {
    pub sender_id: EntityId,
    pub sender_key: VerifyKey,
    pub size: u64,
    pub digest: [u8; 64],
    pub recipients: Vec<FileRecipient>,
    pub received: bool,
    pub created_at: u64,
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum FilesError {
    #[error("chunk not found")]
    NotFound,

    #[error("credential mismatch")]
    Auth,

    #[error("body size does not match declaration")]
    SizeMismatch,

    #[error("body digest does not match declaration")]
    DigestMismatch,

    #[error("chunk larger than this relay accepts")]
    TooLarge,

    #[error("chunk body already stored")]
    AlreadyStored,

    #[error("chunk body not uploaded yet")]
    NotReceived,

    #[error("file store I/O error: {0}")]
    Io(#[from] std::io::Error),
}

// ── Sidecar ───────────────────────────────────────────────────────────────────

#[derive(Serialize, Deserialize)]
struct MetaRecipient {
    id: String,
    key: String,
    acked: bool,
}

#[derive(Serialize, Deserialize)]
struct MetaLine {
    skey: String,
    size: u64,
    digest: String,
    recipients: Vec<MetaRecipient>,
    received: bool,
    ts: u64,
}

fn hex32(s: &str) -> Option<[u8; 32]> {
    hex::decode(s).ok()?.try_into().ok()
}

fn hex64(s: &str) -> Option<[u8; 64]> {
    hex::decode(s).ok()?.try_into().ok()
}

impl MetaLine {
    fn from_record(rec: &FileRecord) -> Self {
        Self {
            skey: hex::encode(rec.sender_key.as_bytes()),
            size: rec.size,
            digest: hex::encode(rec.digest),
            recipients: rec
                .recipients
                .iter()
                .map(|r| MetaRecipient {
                    id: r.recipient_id.to_hex(),
                    key: hex::encode(r.key.as_bytes()),
                    acked: r.acked,
                })
                .collect(),
            received: rec.received,
            ts: rec.created_at,
        }
    }

    fn into_record(self, sender_id: EntityId) -> Option<FileRecord> {
        Some(FileRecord {
            sender_id,
            sender_key: VerifyKey(hex32(&self.skey)?),
            size: self.size,
            digest: hex64(&self.digest)?,
            recipients: self
                .recipients
                .into_iter()
                .map(|r| {
                    Some(FileRecipient {
                        recipient_id: EntityId::from_hex(&r.id)?,
                        key: VerifyKey(hex32(&r.key)?),
                        acked: r.acked,
                    })
                })
                .collect::<Option<Vec<_>>>()?,
            received: self.received,
            created_at: self.ts,
        })
    }
}

// ── File store ────────────────────────────────────────────────────────────────

/// Registry and body storage of relayed file chunks.
pub struct FileStore {
    root: PathBuf,
    max_chunk_size: u64,
    chunks: DashMap<EntityId, Arc<tokio::sync::Mutex<FileRecord>>>,
    by_recipient: DashMap<EntityId, EntityId>,
}

impl FileStore {
    /// Open the store under `root/files`, rebuilding the registry from the
    /// sidecar files on disk.
    pub fn open(root: &Path, max_chunk_size: u64) -> Result<Self, FilesError> {
        let root = root.join("files");
        fs::create_dir_all(&root)?;
        let store = Self {
            root,
            max_chunk_size,
            chunks: DashMap::new(),
            by_recipient: DashMap::new(),
        };
        store.scan()?;
        Ok(store)
    }

    fn scan(&self) -> Result<(), FilesError> {
        let mut restored = 0usize;
        for level1 in read_dirs(&self.root)? {
            for level2 in read_dirs(&level1)? {
                for entry in fs::read_dir(&level2)? {
                    let path = entry?.path();
                    if path.extension().map(|e| e == "meta") != Some(true) {
                        continue;
                    }
                    let Some(sid) = path
                        .file_stem()
                        .and_then(|s| s.to_str())
                        .and_then(EntityId::from_hex)
                    else {
                        continue;
                    };
                    let Ok(text) = fs::read_to_string(&path) else {
                        continue;
                    };
                    let Some(rec) = serde_json::from_str::<MetaLine>(&text)
                        .ok()
                        .and_then(|m| m.into_record(sid))
                    else {
                        tracing::warn!(path = %path.display(), "skipping unreadable chunk sidecar");
                        continue;
                    };
                    for r in &rec.recipients {
                        self.by_recipient.insert(r.recipient_id, sid);
                    }
                    self.chunks
                        .insert(sid, Arc::new(tokio::sync::Mutex::new(rec)));
                    restored += 1;
                }
            }
        }
        if restored > 0 {
            tracing::info!(chunks = restored, "file store restored from disk");
        }
        Ok(())
    }

    /// Number of registered chunks.
    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    fn chunk_paths(&self, sid: &EntityId) -> (PathBuf, PathBuf) {
        let hex = sid.to_hex();
        let dir = self.root.join(&hex[0..2]).join(&hex[2..4]);
        (dir.join(format!("{hex}.chunk")), dir.join(format!("{hex}.meta")))
    }

    fn persist(&self, rec: &FileRecord) -> Result<(), FilesError> {
        let (_, meta) = self.chunk_paths(&rec.sender_id);
        if let Some(parent) = meta.parent() {
            fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string(&MetaLine::from_record(rec))
            .expect("sidecar serialization is infallible");
        fs::write(meta, json)?;
        Ok(())
    }

    /// Create a chunk slot. Returns the sender id and one recipient id per
    /// supplied key, in order.
    pub fn create(
        &self,
        sender_key: VerifyKey,
        info: FileInfo,
        recipient_keys: &[VerifyKey],
    ) -> Result<(EntityId, Vec<EntityId>), FilesError> {
        if info.size > self.max_chunk_size {
            return Err(FilesError::TooLarge);
        }
        let sender_id = EntityId::random();
        let recipients: Vec<FileRecipient> = recipient_keys
            .iter()
            .map(|key| FileRecipient {
                recipient_id: EntityId::random(),
                key: *key,
                acked: false,
            })
            .collect();
        let recipient_ids: Vec<EntityId> = recipients.iter().map(|r| r.recipient_id).collect();

        let rec = FileRecord {
            sender_id,
            sender_key,
            size: info.size,
            digest: info.digest,
            recipients,
            received: false,
            created_at: now_secs(),
        };
        self.persist(&rec)?;
        for rid in &recipient_ids {
            self.by_recipient.insert(*rid, sender_id);
        }
        self.chunks
            .insert(sender_id, Arc::new(tokio::sync::Mutex::new(rec)));
        Ok((sender_id, recipient_ids))
    }

    /// The per-chunk lock for a sender id.
    pub fn by_sender(
        &self,
        sid: &EntityId,
    ) -> Result<Arc<tokio::sync::Mutex<FileRecord>>, FilesError> {
        self.chunks
            .get(sid)
            .map(|c| c.clone())
            .ok_or(FilesError::NotFound)
    }

    /// The per-chunk lock for a recipient id, plus the owning sender id.
    pub fn by_recipient(
        &self,
        rid: &EntityId,
    ) -> Result<(EntityId, Arc<tokio::sync::Mutex<FileRecord>>), FilesError> {
        let sid = *self.by_recipient.get(rid).ok_or(FilesError::NotFound)?;
        Ok((sid, self.by_sender(&sid)?))
    }

    /// Store the chunk body after validating it against the declaration.
    /// The caller holds the record lock.
    pub fn put_body(&self, rec: &mut FileRecord, body: &[u8]) -> Result<(), FilesError> {
        if rec.received {
            return Err(FilesError::AlreadyStored);
        }
        if body.len() as u64 != rec.size {
            return Err(FilesError::SizeMismatch);
        }
        if sha512(body) != rec.digest {
            return Err(FilesError::DigestMismatch);
        }
        let (chunk, _) = self.chunk_paths(&rec.sender_id);
        if let Some(parent) = chunk.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&chunk, body)?;
        rec.received = true;
        self.persist(rec)?;
        Ok(())
    }

    /// Read the chunk body. Mmap-backed: concurrent readers share pages.
    pub fn read_body(&self, rec: &FileRecord) -> Result<Bytes, FilesError> {
        if !rec.received {
            return Err(FilesError::NotReceived);
        }
        let (chunk, _) = self.chunk_paths(&rec.sender_id);
        let file = fs::File::open(&chunk)?;
        // Safety: chunk files are immutable once written.
        let mmap = unsafe { Mmap::map(&file)? };
        Ok(Bytes::copy_from_slice(&mmap))
    }

    /// Mark one recipient's replica acknowledged; removes the chunk when
    /// every recipient has acknowledged. The caller holds the record lock.
    pub fn ack(&self, rec: &mut FileRecord, rid: &EntityId) -> Result<(), FilesError> {
        let recipient = rec
            .recipients
            .iter_mut()
            .find(|r| r.recipient_id == *rid)
            .ok_or(FilesError::NotFound)?;
        recipient.acked = true;
        self.by_recipient.remove(rid);

        if rec.recipients.iter().all(|r| r.acked) {
            self.remove_files(rec)?;
            self.chunks.remove(&rec.sender_id);
        } else {
            self.persist(rec)?;
        }
        Ok(())
    }

    /// Delete the chunk and all replicas. The caller holds the record lock.
    pub fn delete(&self, rec: &FileRecord) -> Result<(), FilesError> {
        self.remove_files(rec)?;
        for r in &rec.recipients {
            self.by_recipient.remove(&r.recipient_id);
        }
        self.chunks.remove(&rec.sender_id);
        Ok(())
    }

    fn remove_files(&self, rec: &FileRecord) -> Result<(), FilesError> {
        let (chunk, meta) = self.chunk_paths(&rec.sender_id);
        if chunk.exists() {
            fs::remove_file(chunk)?;
        }
        if meta.exists() {
            fs::remove_file(meta)?;
        }
        Ok(())
    }

    /// Drop chunks created before `cutoff`. Returns how many were removed.
    pub async fn delete_expired(&self, cutoff: u64) -> usize {
        let expired: Vec<EntityId> = {
            let mut ids = Vec::new();
            for entry in self.chunks.iter() {
                // try_lock: a chunk busy with a transfer is simply skipped
                // until the next sweep.
                if let Ok(rec) = entry.value().try_lock() {
                    if rec.created_at < cutoff {
                        ids.push(*entry.key());
                    }
                }
            }
            ids
        };
        let mut removed = 0;
        for sid in expired {
            if let Ok(lock) = self.by_sender(&sid) {
                let rec = lock.lock().await;
                if self.delete(&rec).is_ok() {
                    removed += 1;
                }
            }
        }
        if removed > 0 {
            tracing::info!(removed, "expired file chunks deleted");
        }
        removed
    }
}

fn read_dirs(path: &Path) -> Result<Vec<PathBuf>, FilesError> {
    let mut dirs = Vec::new();
    for entry in fs::read_dir(path)? {
        let path = entry?.path();
        if path.is_dir() {
            dirs.push(path);
        }
    }
    Ok(dirs)
}

// ── Tests ─────────────────────────────────────────────────────────────────────
