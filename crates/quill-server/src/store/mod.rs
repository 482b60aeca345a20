//! Durable home for queue metadata and per-queue message journals.
//!
//! The store keeps two mutually consistent representations: a memory index
//! of queue records keyed by recipient, sender, and notifier id, and a
//! write-ahead log replayed on startup (see [`log`]). Message bodies live
//! in per-queue journal files (see [`journal`]).
//!
//! The relay owns this store exclusively; per-queue serialization is done
//! by the journal locks handed out by [`QueueStore::journal`].

mod files;
mod journal;
mod log;

pub use files::{FileRecipient, FileRecord, FileStore, FilesError};
pub use journal::{JournalConfig, MessageJournal, WriteOutcome};
pub use log::StoreLog;

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use dashmap::DashMap;

use quill_core::crypto::VerifyKey;
use quill_core::ids::{EntityId, QueueRole};

pub(crate) use log::now_secs;

// ── Records ───────────────────────────────────────────────────────────────────

/// Queue lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueStatus {
    Active,
    /// Writes refused; reads still drain.
    Suspended,
}

/// Push-notification credentials bound to a queue.
#[derive(Debug, Clone)]
pub struct NotifierRecord {
    pub notifier_id: EntityId,
    pub notifier_key: VerifyKey,
    /// DH secret between relay and notifier, sealing notification tokens.
    pub dh_secret: [u8; 32],
}

/// Everything the relay knows about one queue. Nothing here links the
/// recipient to the sender beyond this record itself.
#[derive(Debug, Clone)]
pub struct QueueRecord {
    pub recipient_id: EntityId,
    pub sender_id: EntityId,
    pub recipient_key: VerifyKey,
    /// Set by the first KEY command; unsigned SENDs are refused after that.
    pub sender_key: Option<VerifyKey>,
    /// DH secret between relay and recipient, sealing push payloads.
    pub recipient_dh: [u8; 32],
    pub status: QueueStatus,
    pub notifier: Option<NotifierRecord>,
    pub updated_at: u64,
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("entity id already exists")]
    Duplicate,

    #[error("queue not found")]
    NotFound,

    #[error("credential mismatch")]
    Auth,

    #[error("store I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("corrupt store data: {0}")]
    Corrupt(String),
}

// ── Queue store ───────────────────────────────────────────────────────────────

/// The relay's queue database: memory index + write-ahead log + journals.
pub struct QueueStore {
    root: PathBuf,
    journal_config: JournalConfig,
    log: Mutex<StoreLog>,
    queues: DashMap<EntityId, QueueRecord>,
    by_sender: DashMap<EntityId, EntityId>,
    by_notifier: DashMap<EntityId, EntityId>,
    journals: DashMap<EntityId, Arc<tokio::sync::Mutex<MessageJournal>>>,
}

impl QueueStore {
    /// Open the store under `root`, replaying the log.
    pub fn open(root: &Path, journal_config: JournalConfig) -> Result<Self, StoreError> {
        let (log, records) = StoreLog::open(root)?;
        let store = Self {
            root: root.to_path_buf(),
            journal_config,
            log: Mutex::new(log),
            queues: DashMap::new(),
            by_sender: DashMap::new(),
            by_notifier: DashMap::new(),
            journals: DashMap::new(),
        };
        for rec in records {
            store.index(&rec);
            store.queues.insert(rec.recipient_id, rec);
        }
        tracing::info!(queues = store.queues.len(), "queue store opened");
        Ok(store)
    }

    fn index(&self, rec: &QueueRecord) {
        self.by_sender.insert(rec.sender_id, rec.recipient_id);
        if let Some(ntf) = &rec.notifier {
            self.by_notifier.insert(ntf.notifier_id, rec.recipient_id);
        }
    }

    /// Number of live queues.
    pub fn len(&self) -> usize {
        self.queues.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queues.is_empty()
    }

    /// Create a queue. Fails with [`StoreError::Duplicate`] if either id is
    /// already taken in any index.
    pub fn create(&self, rec: QueueRecord) -> Result<(), StoreError> {
        let taken = |id: &EntityId| {
            self.queues.contains_key(id)
                || self.by_sender.contains_key(id)
                || self.by_notifier.contains_key(id)
        };
        if taken(&rec.recipient_id) || taken(&rec.sender_id) {
            return Err(StoreError::Duplicate);
        }
        self.log.lock().expect("store log lock").log_create(&rec)?;
        self.index(&rec);
        self.queues.insert(rec.recipient_id, rec);
        Ok(())
    }

    /// Look up a queue by id, selecting the index matching `role`.
    pub fn get(&self, role: QueueRole, id: &EntityId) -> Result<QueueRecord, StoreError> {
        let rid = match role {
            QueueRole::Recipient => *id,
            QueueRole::Sender => *self.by_sender.get(id).ok_or(StoreError::NotFound)?,
            QueueRole::Notifier => *self.by_notifier.get(id).ok_or(StoreError::NotFound)?,
        };
        self.queues
            .get(&rid)
            .map(|r| r.clone())
            .ok_or(StoreError::NotFound)
    }

    /// Set the sender key. Idempotent when the key matches; an attempt to
    /// replace an established key is a credential failure.
    pub fn secure(&self, rid: &EntityId, sender_key: VerifyKey) -> Result<(), StoreError> {
        let mut rec = self.queues.get_mut(rid).ok_or(StoreError::NotFound)?;
        match rec.sender_key {
            Some(existing) if existing == sender_key => Ok(()),
            Some(_) => Err(StoreError::Auth),
            None => {
                self.log
                    .lock()
                    .expect("store log lock")
                    .log_secure(*rid, &sender_key)?;
                rec.sender_key = Some(sender_key);
                rec.updated_at = now_secs();
                Ok(())
            }
        }
    }

    /// Bind a notifier, replacing any prior binding.
    pub fn add_notifier(&self, rid: &EntityId, ntf: NotifierRecord) -> Result<(), StoreError> {
        let mut rec = self.queues.get_mut(rid).ok_or(StoreError::NotFound)?;
        self.log
            .lock()
            .expect("store log lock")
            .log_notifier(*rid, &ntf)?;
        if let Some(old) = rec.notifier.take() {
            self.by_notifier.remove(&old.notifier_id);
        }
        self.by_notifier.insert(ntf.notifier_id, *rid);
        rec.notifier = Some(ntf);
        rec.updated_at = now_secs();
        Ok(())
    }

    pub fn delete_notifier(&self, rid: &EntityId) -> Result<(), StoreError> {
        let mut rec = self.queues.get_mut(rid).ok_or(StoreError::NotFound)?;
        self.log.lock().expect("store log lock").log_ndelete(*rid)?;
        if let Some(old) = rec.notifier.take() {
            self.by_notifier.remove(&old.notifier_id);
        }
        rec.updated_at = now_secs();
        Ok(())
    }

    pub fn suspend(&self, rid: &EntityId) -> Result<(), StoreError> {
        let mut rec = self.queues.get_mut(rid).ok_or(StoreError::NotFound)?;
        self.log.lock().expect("store log lock").log_suspend(*rid)?;
        rec.status = QueueStatus::Suspended;
        rec.updated_at = now_secs();
        Ok(())
    }

    /// Delete the queue, its indexes, and its journal files.
    pub fn delete(&self, rid: &EntityId) -> Result<(), StoreError> {
        let (_, rec) = self.queues.remove(rid).ok_or(StoreError::NotFound)?;
        self.log.lock().expect("store log lock").log_delete(*rid)?;
        self.by_sender.remove(&rec.sender_id);
        if let Some(ntf) = &rec.notifier {
            self.by_notifier.remove(&ntf.notifier_id);
        }
        if let Some((_, journal)) = self.journals.remove(rid) {
            drop(journal); // queue lock holders finish before files go
        }
        let dir = MessageJournal::dir_for(&self.root, rid);
        if dir.exists() {
            std::fs::remove_dir_all(dir)?;
        }
        Ok(())
    }

    /// The journal of one queue, behind its per-queue lock. Opened lazily;
    /// the map entry guards against two sessions opening it concurrently.
    pub fn journal(
        &self,
        rid: &EntityId,
    ) -> Result<Arc<tokio::sync::Mutex<MessageJournal>>, StoreError> {
        use dashmap::mapref::entry::Entry;
        if !self.queues.contains_key(rid) {
            return Err(StoreError::NotFound);
        }
        match self.journals.entry(*rid) {
            Entry::Occupied(entry) => Ok(entry.get().clone()),
            Entry::Vacant(slot) => {
                let journal = MessageJournal::open(&self.root, rid, self.journal_config)?;
                let arc = Arc::new(tokio::sync::Mutex::new(journal));
                slot.insert(arc.clone());
                Ok(arc)
            }
        }
    }

    /// Snapshot of all live queue records (for compaction and sweeps).
    pub fn active_queues(&self) -> Vec<QueueRecord> {
        self.queues.iter().map(|r| r.clone()).collect()
    }

    /// Rewrite the store log as a snapshot of the live queue set.
    pub fn compact(&self) -> Result<(), StoreError> {
        let active = self.active_queues();
        self.log.lock().expect("store log lock").compact(&active)
    }

    /// Lines appended to the store log since open or last compaction.
    pub fn log_appended(&self) -> u64 {
        self.log.lock().expect("store log lock").appended()
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use quill_core::command::MsgFlags;
    use quill_core::crypto::SignKeyPair;

    fn record() -> QueueRecord {
        QueueRecord {
            recipient_id: EntityId::random(),
            sender_id: EntityId::random(),
            recipient_key: SignKeyPair::generate().verify_key(),
            sender_key: None,
            recipient_dh: [3u8; 32],
            status: QueueStatus::Active,
            notifier: None,
            updated_at: now_secs(),
        }
    }

    fn open(root: &Path) -> QueueStore {
        QueueStore::open(root, JournalConfig::default()).unwrap()
    }

    #[test]
    fn create_and_lookup_by_each_role() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(dir.path());
        let rec = record();
        store.create(rec.clone()).unwrap();

        let by_rid = store.get(QueueRole::Recipient, &rec.recipient_id).unwrap();
        assert_eq!(by_rid.sender_id, rec.sender_id);

        let by_sid = store.get(QueueRole::Sender, &rec.sender_id).unwrap();
        assert_eq!(by_sid.recipient_id, rec.recipient_id);

        assert!(matches!(
            store.get(QueueRole::Notifier, &rec.sender_id),
            Err(StoreError::NotFound)
        ));
    }

    #[test]
    fn duplicate_ids_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(dir.path());
        let rec = record();
        store.create(rec.clone()).unwrap();

        let mut clash = record();
        clash.sender_id = rec.sender_id;
        assert!(matches!(store.create(clash), Err(StoreError::Duplicate)));

        let mut clash = record();
        clash.recipient_id = rec.recipient_id;
        assert!(matches!(store.create(clash), Err(StoreError::Duplicate)));
    }

    #[test]
    fn secure_is_idempotent_for_same_key() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(dir.path());
        let rec = record();
        store.create(rec.clone()).unwrap();

        let key = SignKeyPair::generate().verify_key();
        store.secure(&rec.recipient_id, key).unwrap();
        store.secure(&rec.recipient_id, key).unwrap();

        let other = SignKeyPair::generate().verify_key();
        assert!(matches!(
            store.secure(&rec.recipient_id, other),
            Err(StoreError::Auth)
        ));
    }

    #[test]
    fn notifier_replacement_updates_index() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(dir.path());
        let rec = record();
        store.create(rec.clone()).unwrap();

        let n1 = NotifierRecord {
            notifier_id: EntityId::random(),
            notifier_key: SignKeyPair::generate().verify_key(),
            dh_secret: [1u8; 32],
        };
        let n2 = NotifierRecord {
            notifier_id: EntityId::random(),
            notifier_key: SignKeyPair::generate().verify_key(),
            dh_secret: [2u8; 32],
        };
        store.add_notifier(&rec.recipient_id, n1.clone()).unwrap();
        store.add_notifier(&rec.recipient_id, n2.clone()).unwrap();

        assert!(store.get(QueueRole::Notifier, &n1.notifier_id).is_err());
        assert!(store.get(QueueRole::Notifier, &n2.notifier_id).is_ok());

        store.delete_notifier(&rec.recipient_id).unwrap();
        assert!(store.get(QueueRole::Notifier, &n2.notifier_id).is_err());
    }

    #[test]
    fn delete_removes_queue_journal_and_indexes() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(dir.path());
        let rec = record();
        store.create(rec.clone()).unwrap();

        {
            let journal = store.journal(&rec.recipient_id).unwrap();
            journal
                .blocking_lock()
                .write(MsgFlags::default(), b"msg".to_vec())
                .unwrap();
        }
        store.delete(&rec.recipient_id).unwrap();

        assert!(store.get(QueueRole::Recipient, &rec.recipient_id).is_err());
        assert!(store.get(QueueRole::Sender, &rec.sender_id).is_err());
        assert!(!MessageJournal::dir_for(dir.path(), &rec.recipient_id).exists());
    }

    #[test]
    fn restart_restores_queue_set_and_messages() {
        let dir = tempfile::tempdir().unwrap();
        let rec = record();
        {
            let store = open(dir.path());
            store.create(rec.clone()).unwrap();
            let journal = store.journal(&rec.recipient_id).unwrap();
            let mut j = journal.blocking_lock();
            j.write(MsgFlags::default(), b"one".to_vec()).unwrap();
            j.write(MsgFlags::default(), b"two".to_vec()).unwrap();
        }
        let store = open(dir.path());
        assert_eq!(store.len(), 1);
        let journal = store.journal(&rec.recipient_id).unwrap();
        assert_eq!(journal.blocking_lock().size(), 2);
    }

    #[test]
    fn compaction_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let keep = record();
        {
            let store = open(dir.path());
            store.create(keep.clone()).unwrap();
            let gone = record();
            store.create(gone.clone()).unwrap();
            store.delete(&gone.recipient_id).unwrap();
            store.compact().unwrap();
            assert_eq!(store.log_appended(), 0);
        }
        let store = open(dir.path());
        assert_eq!(store.len(), 1);
        assert!(store.get(QueueRole::Recipient, &keep.recipient_id).is_ok());
    }
}
