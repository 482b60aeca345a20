//! Write-ahead store log for queue metadata.
//!
//! Every mutation of the queue set appends one line before the memory index
//! changes, so a relay restarted at any point replays to the exact queue set
//! it held. Lines are a record tag followed by a JSON payload:
//!
//! ```text
//!   CREATE {"rid":"…","sid":"…","rkey":"…","dh":"…","ts":…}
//!   SECURE {"rid":"…","skey":"…"}
//!   NOTIFIER {"rid":"…","nid":"…","nkey":"…","ndh":"…"}
//!   NDELETE {"rid":"…"}
//!   SUSPEND {"rid":"…"}
//!   DELETE {"rid":"…"}
//!   TIME {"ts":…}
//! ```
//!
//! Compaction writes a snapshot of the active queues to `store.log.tmp`
//! under a `store.log.compacting` marker, renames the old log to a
//! timestamped backup, then renames the snapshot into place. A torn tail
//! (crash mid-append) is truncated on replay.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use quill_core::crypto::VerifyKey;
use quill_core::ids::EntityId;

use super::{NotifierRecord, QueueRecord, QueueStatus, StoreError};

const LOG_NAME: &str = "store.log";
const TMP_NAME: &str = "store.log.tmp";
const MARKER_NAME: &str = "store.log.compacting";

// ── Records ───────────────────────────────────────────────────────────────────

#[derive(Debug, Serialize, Deserialize)]
struct CreateLine {
    rid: String,
    sid: String,
    rkey: String,
    dh: String,
    #[serde(default)]
    skey: Option<String>,
    #[serde(default)]
    suspended: bool,
    ts: u64,
}

#[derive(Debug, Serialize, Deserialize)]
struct SecureLine {
    rid: String,
    skey: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct NotifierLine {
    rid: String,
    nid: String,
    nkey: String,
    ndh: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct RidLine {
    rid: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct TimeLine {
    ts: u64,
}

fn hex32(s: &str) -> Option<[u8; 32]> {
    hex::decode(s).ok()?.try_into().ok()
}

impl CreateLine {
    fn from_record(rec: &QueueRecord) -> Self {
        Self {
            rid: rec.recipient_id.to_hex(),
            sid: rec.sender_id.to_hex(),
            rkey: hex::encode(rec.recipient_key.as_bytes()),
            dh: hex::encode(rec.recipient_dh),
            skey: rec.sender_key.map(|k| hex::encode(k.as_bytes())),
            suspended: rec.status == QueueStatus::Suspended,
            ts: rec.updated_at,
        }
    }

    fn into_record(self) -> Option<QueueRecord> {
        Some(QueueRecord {
            recipient_id: EntityId::from_hex(&self.rid)?,
            sender_id: EntityId::from_hex(&self.sid)?,
            recipient_key: VerifyKey(hex32(&self.rkey)?),
            sender_key: match self.skey {
                Some(k) => Some(VerifyKey(hex32(&k)?)),
                None => None,
            },
            recipient_dh: hex32(&self.dh)?,
            status: if self.suspended {
                QueueStatus::Suspended
            } else {
                QueueStatus::Active
            },
            notifier: None,
            updated_at: self.ts,
        })
    }
}

// ── Store log ─────────────────────────────────────────────────────────────────

/// Append-only log of queue mutations with snapshot compaction.
pub struct StoreLog {
    dir: PathBuf,
    writer: BufWriter<File>,
    /// Lines appended since the last compaction.
    appended: u64,
}

impl StoreLog {
    /// Open the log in `dir`, finishing any interrupted compaction, and
    /// replay it into the queue set that was live at the last shutdown.
    pub fn open(dir: &Path) -> Result<(Self, Vec<QueueRecord>), StoreError> {
        fs::create_dir_all(dir)?;
        recover_interrupted_compaction(dir)?;

        let path = dir.join(LOG_NAME);
        let records = if path.exists() {
            replay(&path)?
        } else {
            Vec::new()
        };

        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let mut log = Self {
            dir: dir.to_path_buf(),
            writer: BufWriter::new(file),
            appended: 0,
        };
        log.append("TIME", &TimeLine { ts: now_secs() })?;
        Ok((log, records))
    }

    pub fn log_create(&mut self, rec: &QueueRecord) -> Result<(), StoreError> {
        self.append("CREATE", &CreateLine::from_record(rec))
    }

    pub fn log_secure(&mut self, rid: EntityId, skey: &VerifyKey) -> Result<(), StoreError> {
        self.append(
            "SECURE",
            &SecureLine {
                rid: rid.to_hex(),
                skey: hex::encode(skey.as_bytes()),
            },
        )
    }

    pub fn log_notifier(&mut self, rid: EntityId, ntf: &NotifierRecord) -> Result<(), StoreError> {
        self.append(
            "NOTIFIER",
            &NotifierLine {
                rid: rid.to_hex(),
                nid: ntf.notifier_id.to_hex(),
                nkey: hex::encode(ntf.notifier_key.as_bytes()),
                ndh: hex::encode(ntf.dh_secret),
            },
        )
    }

    pub fn log_ndelete(&mut self, rid: EntityId) -> Result<(), StoreError> {
        self.append("NDELETE", &RidLine { rid: rid.to_hex() })
    }

    pub fn log_suspend(&mut self, rid: EntityId) -> Result<(), StoreError> {
        self.append("SUSPEND", &RidLine { rid: rid.to_hex() })
    }

    pub fn log_delete(&mut self, rid: EntityId) -> Result<(), StoreError> {
        self.append("DELETE", &RidLine { rid: rid.to_hex() })
    }

    /// Lines appended since open or the last compaction.
    pub fn appended(&self) -> u64 {
        self.appended
    }

    fn append<T: Serialize>(&mut self, tag: &str, line: &T) -> Result<(), StoreError> {
        let json = serde_json::to_string(line).map_err(|e| StoreError::Corrupt(e.to_string()))?;
        self.writer.write_all(tag.as_bytes())?;
        self.writer.write_all(b" ")?;
        self.writer.write_all(json.as_bytes())?;
        self.writer.write_all(b"\n")?;
        self.writer.flush()?;
        self.appended += 1;
        Ok(())
    }

    /// Rewrite the log as a snapshot of `active` queues.
    ///
    /// Sequence: marker → snapshot to tmp → old log to timestamped backup →
    /// tmp into place → marker removed. A crash at any point is recovered
    /// by [`StoreLog::open`].
    pub fn compact(&mut self, active: &[QueueRecord]) -> Result<(), StoreError> {
        let marker = self.dir.join(MARKER_NAME);
        let tmp = self.dir.join(TMP_NAME);
        let primary = self.dir.join(LOG_NAME);

        File::create(&marker)?;

        {
            let mut w = BufWriter::new(File::create(&tmp)?);
            for rec in active {
                let json = serde_json::to_string(&CreateLine::from_record(rec))
                    .map_err(|e| StoreError::Corrupt(e.to_string()))?;
                writeln!(w, "CREATE {json}")?;
                if let Some(ntf) = &rec.notifier {
                    let json = serde_json::to_string(&NotifierLine {
                        rid: rec.recipient_id.to_hex(),
                        nid: ntf.notifier_id.to_hex(),
                        nkey: hex::encode(ntf.notifier_key.as_bytes()),
                        ndh: hex::encode(ntf.dh_secret),
                    })
                    .map_err(|e| StoreError::Corrupt(e.to_string()))?;
                    writeln!(w, "NOTIFIER {json}")?;
                }
            }
            let json = serde_json::to_string(&TimeLine { ts: now_secs() })
                .map_err(|e| StoreError::Corrupt(e.to_string()))?;
            writeln!(w, "TIME {json}")?;
            w.flush()?;
            w.get_ref().sync_all()?;
        }

        self.writer.flush()?;
        let backup = self.dir.join(format!("{LOG_NAME}.{}.bak", now_secs()));
        fs::rename(&primary, &backup)?;
        fs::rename(&tmp, &primary)?;
        fs::remove_file(&marker)?;

        let file = OpenOptions::new().append(true).open(&primary)?;
        self.writer = BufWriter::new(file);
        self.appended = 0;

        tracing::info!(queues = active.len(), "store log compacted");
        Ok(())
    }
}

/// Finish or roll back a compaction that crashed mid-sequence.
fn recover_interrupted_compaction(dir: &Path) -> Result<(), StoreError> {
    let marker = dir.join(MARKER_NAME);
    if !marker.exists() {
        return Ok(());
    }
    let tmp = dir.join(TMP_NAME);
    let primary = dir.join(LOG_NAME);

    // The snapshot is adopted only if it parses end-to-end; a torn snapshot
    // means the crash happened while writing it, and the old log is intact.
    let tmp_ok = tmp.exists() && replay(&tmp).map(|r| !r.is_empty()).unwrap_or(false);
    if tmp_ok {
        if primary.exists() {
            let backup = dir.join(format!("{LOG_NAME}.{}.bak", now_secs()));
            fs::rename(&primary, &backup)?;
        }
        fs::rename(&tmp, &primary)?;
        tracing::warn!("adopted snapshot from interrupted compaction");
    } else {
        if tmp.exists() {
            fs::remove_file(&tmp)?;
        }
        tracing::warn!("discarded torn snapshot from interrupted compaction");
    }
    fs::remove_file(&marker)?;
    Ok(())
}

/// Replay a log file into the surviving queue records, truncating a torn
/// tail in place.
fn replay(path: &Path) -> Result<Vec<QueueRecord>, StoreError> {
    let data = fs::read(path)?;
    let mut queues: HashMap<EntityId, QueueRecord> = HashMap::new();
    // Order of creation matters for deterministic iteration in tests.
    let mut order: Vec<EntityId> = Vec::new();
    let mut valid_len = 0usize;

    for line in LineIter::new(&data) {
        let (text, end) = match line {
            LineResult::Complete(text, end) => (text, end),
            LineResult::Torn => break,
        };
        if apply_line(text, &mut queues, &mut order).is_none() {
            tracing::warn!(offset = valid_len, "unparseable store log line, truncating");
            break;
        }
        valid_len = end;
    }

    if valid_len < data.len() {
        let file = OpenOptions::new().write(true).open(path)?;
        file.set_len(valid_len as u64)?;
        tracing::warn!(
            dropped = data.len() - valid_len,
            "truncated torn store log tail"
        );
    }

    Ok(order
        .into_iter()
        .filter_map(|rid| queues.remove(&rid))
        .collect())
}

fn apply_line(
    text: &str,
    queues: &mut HashMap<EntityId, QueueRecord>,
    order: &mut Vec<EntityId>,
) -> Option<()> {
    let (tag, json) = text.split_once(' ').unwrap_or((text, ""));
    match tag {
        "CREATE" => {
            let rec = serde_json::from_str::<CreateLine>(json).ok()?.into_record()?;
            let rid = rec.recipient_id;
            if queues.insert(rid, rec).is_none() {
                order.push(rid);
            }
        }
        "SECURE" => {
            let line: SecureLine = serde_json::from_str(json).ok()?;
            let rid = EntityId::from_hex(&line.rid)?;
            if let Some(rec) = queues.get_mut(&rid) {
                rec.sender_key = Some(VerifyKey(hex32(&line.skey)?));
            }
        }
        "NOTIFIER" => {
            let line: NotifierLine = serde_json::from_str(json).ok()?;
            let rid = EntityId::from_hex(&line.rid)?;
            if let Some(rec) = queues.get_mut(&rid) {
                rec.notifier = Some(NotifierRecord {
                    notifier_id: EntityId::from_hex(&line.nid)?,
                    notifier_key: VerifyKey(hex32(&line.nkey)?),
                    dh_secret: hex32(&line.ndh)?,
                });
            }
        }
        "NDELETE" => {
            let line: RidLine = serde_json::from_str(json).ok()?;
            let rid = EntityId::from_hex(&line.rid)?;
            if let Some(rec) = queues.get_mut(&rid) {
                rec.notifier = None;
            }
        }
        "SUSPEND" => {
            let line: RidLine = serde_json::from_str(json).ok()?;
            let rid = EntityId::from_hex(&line.rid)?;
            if let Some(rec) = queues.get_mut(&rid) {
                rec.status = QueueStatus::Suspended;
            }
        }
        "DELETE" => {
            let line: RidLine = serde_json::from_str(json).ok()?;
            queues.remove(&EntityId::from_hex(&line.rid)?);
        }
        "TIME" => {
            serde_json::from_str::<TimeLine>(json).ok()?;
        }
        _ => return None,
    }
    Some(())
}

// ── Line iteration ────────────────────────────────────────────────────────────

pub(crate) enum LineResult<'a> {
    /// Line text and the byte offset just past its newline.
    Complete(&'a str, usize),
    /// Bytes after the final newline — a write that did not finish.
    Torn,
}

pub(crate) struct LineIter<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> LineIter<'a> {
    pub(crate) fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }
}

impl<'a> Iterator for LineIter<'a> {
    type Item = LineResult<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.pos >= self.data.len() {
            return None;
        }
        match self.data[self.pos..].iter().position(|&b| b == b'\n') {
            Some(nl) => {
                let start = self.pos;
                let end = self.pos + nl + 1;
                self.pos = end;
                match std::str::from_utf8(&self.data[start..end - 1]) {
                    Ok(text) => Some(LineResult::Complete(text, end)),
                    Err(_) => {
                        self.pos = self.data.len();
                        Some(LineResult::Torn)
                    }
                }
            }
            None => {
                self.pos = self.data.len();
                Some(LineResult::Torn)
            }
        }
    }
}

pub(crate) fn now_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use quill_core::crypto::SignKeyPair;

    fn record() -> QueueRecord {
        QueueRecord {
            recipient_id: EntityId::random(),
            sender_id: EntityId::random(),
            recipient_key: SignKeyPair::generate().verify_key(),
            sender_key: None,
            recipient_dh: [7u8; 32],
            status: QueueStatus::Active,
            notifier: None,
            updated_at: now_secs(),
        }
    }

    #[test]
    fn replay_restores_created_queues() {
        let dir = tempfile::tempdir().unwrap();
        let r1 = record();
        let r2 = record();
        {
            let (mut log, initial) = StoreLog::open(dir.path()).unwrap();
            assert!(initial.is_empty());
            log.log_create(&r1).unwrap();
            log.log_create(&r2).unwrap();
        }
        let (_, replayed) = StoreLog::open(dir.path()).unwrap();
        assert_eq!(replayed.len(), 2);
        assert_eq!(replayed[0].recipient_id, r1.recipient_id);
        assert_eq!(replayed[1].recipient_id, r2.recipient_id);
    }

    #[test]
    fn replay_applies_secure_suspend_delete() {
        let dir = tempfile::tempdir().unwrap();
        let r1 = record();
        let r2 = record();
        let skey = SignKeyPair::generate().verify_key();
        {
            let (mut log, _) = StoreLog::open(dir.path()).unwrap();
            log.log_create(&r1).unwrap();
            log.log_create(&r2).unwrap();
            log.log_secure(r1.recipient_id, &skey).unwrap();
            log.log_suspend(r1.recipient_id).unwrap();
            log.log_delete(r2.recipient_id).unwrap();
        }
        let (_, replayed) = StoreLog::open(dir.path()).unwrap();
        assert_eq!(replayed.len(), 1);
        assert_eq!(replayed[0].sender_key, Some(skey));
        assert_eq!(replayed[0].status, QueueStatus::Suspended);
    }

    #[test]
    fn notifier_add_and_delete_replay() {
        let dir = tempfile::tempdir().unwrap();
        let r1 = record();
        let r2 = record();
        let ntf = NotifierRecord {
            notifier_id: EntityId::random(),
            notifier_key: SignKeyPair::generate().verify_key(),
            dh_secret: [9u8; 32],
        };
        {
            let (mut log, _) = StoreLog::open(dir.path()).unwrap();
            log.log_create(&r1).unwrap();
            log.log_create(&r2).unwrap();
            log.log_notifier(r1.recipient_id, &ntf).unwrap();
            log.log_notifier(r2.recipient_id, &ntf).unwrap();
            log.log_ndelete(r2.recipient_id).unwrap();
        }
        let (_, replayed) = StoreLog::open(dir.path()).unwrap();
        assert_eq!(
            replayed[0].notifier.as_ref().map(|n| n.notifier_id),
            Some(ntf.notifier_id)
        );
        assert!(replayed[1].notifier.is_none());
    }

    #[test]
    fn torn_tail_is_truncated() {
        let dir = tempfile::tempdir().unwrap();
        let r1 = record();
        {
            let (mut log, _) = StoreLog::open(dir.path()).unwrap();
            log.log_create(&r1).unwrap();
        }
        // Simulate a crash mid-append: bytes with no trailing newline.
        {
            let mut f = OpenOptions::new()
                .append(true)
                .open(dir.path().join(LOG_NAME))
                .unwrap();
            f.write_all(b"CREATE {\"rid\":\"deadbeef").unwrap();
        }
        let (_, replayed) = StoreLog::open(dir.path()).unwrap();
        assert_eq!(replayed.len(), 1);
        assert_eq!(replayed[0].recipient_id, r1.recipient_id);
    }

    #[test]
    fn compaction_preserves_active_set() {
        let dir = tempfile::tempdir().unwrap();
        let r1 = record();
        let r2 = record();
        {
            let (mut log, _) = StoreLog::open(dir.path()).unwrap();
            log.log_create(&r1).unwrap();
            log.log_create(&r2).unwrap();
            log.log_delete(r2.recipient_id).unwrap();
            log.compact(std::slice::from_ref(&r1)).unwrap();
        }
        let (_, replayed) = StoreLog::open(dir.path()).unwrap();
        assert_eq!(replayed.len(), 1);
        assert_eq!(replayed[0].recipient_id, r1.recipient_id);
        // Old log kept as a timestamped backup
        let backups = fs::read_dir(dir.path())
            .unwrap()
            .filter(|e| {
                e.as_ref()
                    .unwrap()
                    .file_name()
                    .to_string_lossy()
                    .ends_with(".bak")
            })
            .count();
        assert_eq!(backups, 1);
    }

    #[test]
    fn interrupted_compaction_with_good_snapshot_is_adopted() {
        let dir = tempfile::tempdir().unwrap();
        let r1 = record();
        let r2 = record();
        {
            let (mut log, _) = StoreLog::open(dir.path()).unwrap();
            log.log_create(&r1).unwrap();
            log.log_create(&r2).unwrap();
        }
        // Fake a crash after the snapshot was fully written but before the
        // renames: marker + complete tmp + old primary all present.
        {
            let mut w = File::create(dir.path().join(TMP_NAME)).unwrap();
            let json = serde_json::to_string(&CreateLine::from_record(&r1)).unwrap();
            writeln!(w, "CREATE {json}").unwrap();
        }
        File::create(dir.path().join(MARKER_NAME)).unwrap();

        let (_, replayed) = StoreLog::open(dir.path()).unwrap();
        assert_eq!(replayed.len(), 1);
        assert_eq!(replayed[0].recipient_id, r1.recipient_id);
        assert!(!dir.path().join(MARKER_NAME).exists());
    }

    #[test]
    fn interrupted_compaction_with_torn_snapshot_keeps_old_log() {
        let dir = tempfile::tempdir().unwrap();
        let r1 = record();
        {
            let (mut log, _) = StoreLog::open(dir.path()).unwrap();
            log.log_create(&r1).unwrap();
        }
        fs::write(dir.path().join(TMP_NAME), b"CREATE {\"rid\":").unwrap();
        File::create(dir.path().join(MARKER_NAME)).unwrap();

        let (_, replayed) = StoreLog::open(dir.path()).unwrap();
        assert_eq!(replayed.len(), 1);
        assert_eq!(replayed[0].recipient_id, r1.recipient_id);
        assert!(!dir.path().join(TMP_NAME).exists());
    }
}
