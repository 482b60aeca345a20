//! The agent's persistence port.
//!
//! The agent never touches a database directly: everything it must remember
//! across restarts goes through [`AgentStateStore`]. Operations are
//! transactional — in particular [`AgentStateStore::commit_rcv`] and
//! [`AgentStateStore::commit_snd`] persist a ratchet step together with the
//! message it produced, so a crash can never leave the ratchet advanced
//! past a message (or the reverse).
//!
//! [`MemStore`] is the reference implementation used by the agent by
//! default and by every test; database-backed stores are external
//! collaborators implementing the same trait.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use quill_core::addr::RelayAddr;
use quill_core::ids::EntityId;

use crate::envelope::Integrity;
use crate::ratchet::SkippedKey;

// ── Records ───────────────────────────────────────────────────────────────────

/// How this side entered the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnMode {
    /// Created the invitation.
    Invitation,
    /// Joined someone else's invitation.
    Contact,
}

/// Connection lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnStatus {
    New,
    Joined,
    Confirmed,
    Active,
    Suspended,
}

/// The queue this side reads: created on our relay, owned by us.
#[derive(Debug, Clone)]
pub struct RcvQueue {
    pub relay: RelayAddr,
    /// Our read credential.
    pub recipient_id: EntityId,
    pub recipient_sign_key: [u8; 32],
    /// What the peer writes to; published in our invitation or reply.
    pub queue_sender_id: EntityId,
    /// The ratchet seed key whose public half went out-of-band.
    pub dh_private: [u8; 32],
}

/// The queue this side writes: the peer's queue on their relay.
#[derive(Debug, Clone)]
pub struct SndQueue {
    pub relay: RelayAddr,
    pub sender_id: EntityId,
    /// Our write credential; its public half secures the queue via KEY.
    pub sender_sign_key: [u8; 32],
    /// A signed SEND has succeeded — the peer has secured the queue.
    pub secured: bool,
}

/// Everything persisted about one connection (ratchet aside).
#[derive(Debug, Clone)]
pub struct ConnRecord {
    pub conn_id: EntityId,
    pub mode: ConnMode,
    pub status: ConnStatus,
    pub rcv_queue: Option<RcvQueue>,
    pub snd_queue: Option<SndQueue>,

    /// Last internal id handed out (both directions share one sequence).
    pub last_internal_id: u64,
    /// Our per-direction wire sequence.
    pub last_snd_seq: u64,
    /// Peer's last accepted wire sequence.
    pub last_rcv_seq: u64,
    /// Hash chain heads, one per direction.
    pub last_snd_hash: [u8; 32],
    pub last_rcv_hash: [u8; 32],

    /// Duplex-handshake progress.
    pub own_hello_sent: bool,
    pub peer_hello_received: bool,
    pub reply_sent: bool,
    pub con_emitted: bool,
}

impl ConnRecord {
    pub fn new(conn_id: EntityId, mode: ConnMode) -> Self {
        Self {
            conn_id,
            mode,
            status: ConnStatus::New,
            rcv_queue: None,
            snd_queue: None,
            last_internal_id: 0,
            last_snd_seq: 0,
            last_rcv_seq: 0,
            last_snd_hash: [0u8; 32],
            last_rcv_hash: [0u8; 32],
            own_hello_sent: false,
            peer_hello_received: false,
            reply_sent: false,
            con_emitted: false,
        }
    }
}

/// A received message with its relay and sender metadata.
#[derive(Debug, Clone)]
pub struct RcvMsg {
    pub internal_id: u64,
    pub server_msg_id: EntityId,
    pub server_ts: u64,
    pub sender_seq: u64,
    pub sender_ts: i64,
    pub body: Vec<u8>,
    pub integrity: Integrity,
    pub acked: bool,
}

/// A message pending or confirmed on the send side.
#[derive(Debug, Clone)]
pub struct SndMsg {
    pub internal_id: u64,
    pub seq: u64,
    /// Ratchet-encrypted body, kept until the relay accepts it.
    pub wire_body: Vec<u8>,
    pub sent: bool,
    pub retries: u32,
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum AgentStoreError {
    #[error("connection not found")]
    NotFound,

    #[error("connection already exists")]
    Duplicate,

    #[error("message not found")]
    MsgNotFound,

    #[error("store backend failure: {0}")]
    Backend(String),
}

// ── Port ──────────────────────────────────────────────────────────────────────

/// Atomic persistence operations for agent state.
pub trait AgentStateStore: Send + Sync {
    fn create_conn(&self, rec: ConnRecord) -> Result<(), AgentStoreError>;
    fn get_conn(&self, conn_id: &EntityId) -> Result<ConnRecord, AgentStoreError>;
    /// Read-modify-write under the connection's lock.
    fn update_conn(
        &self,
        conn_id: &EntityId,
        f: &mut dyn FnMut(&mut ConnRecord),
    ) -> Result<ConnRecord, AgentStoreError>;
    fn delete_conn(&self, conn_id: &EntityId) -> Result<(), AgentStoreError>;
    fn list_conns(&self) -> Vec<EntityId>;

    fn save_ratchet(&self, conn_id: &EntityId, blob: Vec<u8>) -> Result<(), AgentStoreError>;
    fn load_ratchet(&self, conn_id: &EntityId) -> Result<Option<Vec<u8>>, AgentStoreError>;

    /// Look up and consume a skipped message key.
    fn take_skipped_key(
        &self,
        conn_id: &EntityId,
        header_key: &[u8; 32],
        msg_number: u64,
    ) -> Result<Option<[u8; 32]>, AgentStoreError>;

    /// Atomically: advance counters, save the ratchet, store newly skipped
    /// keys, and insert the received message. Returns the internal id.
    fn commit_rcv(
        &self,
        conn_id: &EntityId,
        ratchet_blob: Option<Vec<u8>>,
        skipped: &[SkippedKey],
        sender_seq: u64,
        sender_ts: i64,
        server_msg_id: EntityId,
        server_ts: u64,
        body: Vec<u8>,
        integrity: Integrity,
        rcv_hash: [u8; 32],
    ) -> Result<u64, AgentStoreError>;

    /// Atomically: advance counters, save the ratchet, and insert the
    /// pending send. Returns (internal id, wire seq).
    fn commit_snd(
        &self,
        conn_id: &EntityId,
        ratchet_blob: Vec<u8>,
        wire_body: Vec<u8>,
        snd_hash: [u8; 32],
    ) -> Result<(u64, u64), AgentStoreError>;

    fn mark_snd_sent(&self, conn_id: &EntityId, internal_id: u64) -> Result<(), AgentStoreError>;
    fn mark_rcv_acked(&self, conn_id: &EntityId, internal_id: u64) -> Result<(), AgentStoreError>;
    fn get_rcv_msg(&self, conn_id: &EntityId, internal_id: u64) -> Result<RcvMsg, AgentStoreError>;
    /// Pending sends in seq order, for retry after restart.
    fn pending_snd(&self, conn_id: &EntityId) -> Result<Vec<SndMsg>, AgentStoreError>;
}

// ── Reference implementation ──────────────────────────────────────────────────

#[derive(Default)]
struct ConnState {
    record: Option<ConnRecord>,
    ratchet: Option<Vec<u8>>,
    skipped: HashMap<([u8; 32], u64), [u8; 32]>,
    rcv_msgs: BTreeMap<u64, RcvMsg>,
    snd_msgs: BTreeMap<u64, SndMsg>,
}

/// In-memory [`AgentStateStore`]. One `Mutex<ConnState>` per connection is
/// the transaction boundary; readers get cloned snapshots.
#[derive(Default)]
pub struct MemStore {
    conns: DashMap<EntityId, Mutex<ConnState>>,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn with<R>(
        &self,
        conn_id: &EntityId,
        f: impl FnOnce(&mut ConnState) -> Result<R, AgentStoreError>,
    ) -> Result<R, AgentStoreError> {
        let entry = self.conns.get(conn_id).ok_or(AgentStoreError::NotFound)?;
        let mut state = entry.lock().expect("conn state lock");
        if state.record.is_none() {
            return Err(AgentStoreError::NotFound);
        }
        f(&mut state)
    }
}

impl AgentStateStore for MemStore {
    fn create_conn(&self, rec: ConnRecord) -> Result<(), AgentStoreError> {
        use dashmap::mapref::entry::Entry;
        match self.conns.entry(rec.conn_id) {
            Entry::Occupied(_) => Err(AgentStoreError::Duplicate),
            Entry::Vacant(slot) => {
                slot.insert(Mutex::new(ConnState {
                    record: Some(rec),
                    ..Default::default()
                }));
                Ok(())
            }
        }
    }

    fn get_conn(&self, conn_id: &EntityId) -> Result<ConnRecord, AgentStoreError> {
        self.with(conn_id, |state| {
            Ok(state.record.clone().expect("checked in with()"))
        })
    }

    fn update_conn(
        &self,
        conn_id: &EntityId,
        f: &mut dyn FnMut(&mut ConnRecord),
    ) -> Result<ConnRecord, AgentStoreError> {
        self.with(conn_id, |state| {
            let rec = state.record.as_mut().expect("checked in with()");
            f(rec);
            Ok(rec.clone())
        })
    }

    fn delete_conn(&self, conn_id: &EntityId) -> Result<(), AgentStoreError> {
        self.conns
            .remove(conn_id)
            .map(|_| ())
            .ok_or(AgentStoreError::NotFound)
    }

    fn list_conns(&self) -> Vec<EntityId> {
        self.conns.iter().map(|e| *e.key()).collect()
    }

    fn save_ratchet(&self, conn_id: &EntityId, blob: Vec<u8>) -> Result<(), AgentStoreError> {
        self.with(conn_id, |state| {
            state.ratchet = Some(blob);
            Ok(())
        })
    }

    fn load_ratchet(&self, conn_id: &EntityId) -> Result<Option<Vec<u8>>, AgentStoreError> {
        self.with(conn_id, |state| Ok(state.ratchet.clone()))
    }

    fn take_skipped_key(
        &self,
        conn_id: &EntityId,
        header_key: &[u8; 32],
        msg_number: u64,
    ) -> Result<Option<[u8; 32]>, AgentStoreError> {
        self.with(conn_id, |state| {
            Ok(state.skipped.remove(&(*header_key, msg_number)))
        })
    }

    #[allow(clippy::too_many_arguments)]
    fn commit_rcv(
        &self,
        conn_id: &EntityId,
        ratchet_blob: Option<Vec<u8>>,
        skipped: &[SkippedKey],
        sender_seq: u64,
        sender_ts: i64,
        server_msg_id: EntityId,
        server_ts: u64,
        body: Vec<u8>,
        integrity: Integrity,
        rcv_hash: [u8; 32],
    ) -> Result<u64, AgentStoreError> {
        self.with(conn_id, |state| {
            let rec = state.record.as_mut().expect("checked in with()");
            rec.last_internal_id += 1;
            let internal_id = rec.last_internal_id;
            // BadId and BadHash messages do not advance the chain — the
            // chain tracks the last *accepted* position.
            match integrity {
                Integrity::Ok | Integrity::Skipped { .. } => {
                    rec.last_rcv_seq = sender_seq;
                    rec.last_rcv_hash = rcv_hash;
                }
                Integrity::BadId { .. } | Integrity::BadHash => {}
            }
            if let Some(blob) = ratchet_blob {
                state.ratchet = Some(blob);
            }
            for key in skipped {
                state
                    .skipped
                    .insert((key.header_key, key.msg_number), key.message_key);
            }
            state.rcv_msgs.insert(
                internal_id,
                RcvMsg {
                    internal_id,
                    server_msg_id,
                    server_ts,
                    sender_seq,
                    sender_ts,
                    body,
                    integrity,
                    acked: false,
                },
            );
            Ok(internal_id)
        })
    }

    fn commit_snd(
        &self,
        conn_id: &EntityId,
        ratchet_blob: Vec<u8>,
        wire_body: Vec<u8>,
        snd_hash: [u8; 32],
    ) -> Result<(u64, u64), AgentStoreError> {
        self.with(conn_id, |state| {
            let rec = state.record.as_mut().expect("checked in with()");
            rec.last_internal_id += 1;
            rec.last_snd_seq += 1;
            rec.last_snd_hash = snd_hash;
            let internal_id = rec.last_internal_id;
            let seq = rec.last_snd_seq;
            state.ratchet = Some(ratchet_blob);
            state.snd_msgs.insert(
                internal_id,
                SndMsg {
                    internal_id,
                    seq,
                    wire_body,
                    sent: false,
                    retries: 0,
                },
            );
            Ok((internal_id, seq))
        })
    }

    fn mark_snd_sent(&self, conn_id: &EntityId, internal_id: u64) -> Result<(), AgentStoreError> {
        self.with(conn_id, |state| {
            let msg = state
                .snd_msgs
                .get_mut(&internal_id)
                .ok_or(AgentStoreError::MsgNotFound)?;
            msg.sent = true;
            // The wire body has served its purpose.
            msg.wire_body = Vec::new();
            Ok(())
        })
    }

    fn mark_rcv_acked(&self, conn_id: &EntityId, internal_id: u64) -> Result<(), AgentStoreError> {
        self.with(conn_id, |state| {
            let msg = state
                .rcv_msgs
                .get_mut(&internal_id)
                .ok_or(AgentStoreError::MsgNotFound)?;
            msg.acked = true;
            Ok(())
        })
    }

    fn get_rcv_msg(&self, conn_id: &EntityId, internal_id: u64) -> Result<RcvMsg, AgentStoreError> {
        self.with(conn_id, |state| {
            state
                .rcv_msgs
                .get(&internal_id)
                .cloned()
                .ok_or(AgentStoreError::MsgNotFound)
        })
    }

    fn pending_snd(&self, conn_id: &EntityId) -> Result<Vec<SndMsg>, AgentStoreError> {
        self.with(conn_id, |state| {
            let mut pending: Vec<SndMsg> =
                state.snd_msgs.values().filter(|m| !m.sent).cloned().collect();
            pending.sort_by_key(|m| m.seq);
            Ok(pending)
        })
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn conn() -> ConnRecord {
        ConnRecord::new(EntityId::random(), ConnMode::Invitation)
    }

    #[test]
    fn create_get_update_delete() {
        let store = MemStore::new();
        let rec = conn();
        let id = rec.conn_id;
        store.create_conn(rec).unwrap();
        assert!(matches!(
            store.create_conn(ConnRecord::new(id, ConnMode::Contact)),
            Err(AgentStoreError::Duplicate)
        ));

        let got = store.get_conn(&id).unwrap();
        assert_eq!(got.status, ConnStatus::New);

        let updated = store
            .update_conn(&id, &mut |rec| rec.status = ConnStatus::Active)
            .unwrap();
        assert_eq!(updated.status, ConnStatus::Active);

        store.delete_conn(&id).unwrap();
        assert!(matches!(store.get_conn(&id), Err(AgentStoreError::NotFound)));
    }

    #[test]
    fn internal_ids_are_one_sequence_across_directions() {
        let store = MemStore::new();
        let rec = conn();
        let id = rec.conn_id;
        store.create_conn(rec).unwrap();

        let (snd1, seq1) = store
            .commit_snd(&id, b"r1".to_vec(), b"w1".to_vec(), [1; 32])
            .unwrap();
        let rcv = store
            .commit_rcv(
                &id,
                Some(b"r2".to_vec()),
                &[],
                1,
                0,
                EntityId::random(),
                100,
                b"hello".to_vec(),
                Integrity::Ok,
                [2; 32],
            )
            .unwrap();
        let (snd2, seq2) = store
            .commit_snd(&id, b"r3".to_vec(), b"w2".to_vec(), [3; 32])
            .unwrap();

        assert_eq!((snd1, rcv, snd2), (1, 2, 3));
        assert_eq!((seq1, seq2), (1, 2), "wire seq counts only sends");
    }

    #[test]
    fn commit_rcv_updates_chain_only_when_accepted() {
        let store = MemStore::new();
        let rec = conn();
        let id = rec.conn_id;
        store.create_conn(rec).unwrap();

        store
            .commit_rcv(
                &id,
                None,
                &[],
                1,
                0,
                EntityId::random(),
                1,
                b"ok".to_vec(),
                Integrity::Ok,
                [9; 32],
            )
            .unwrap();
        assert_eq!(store.get_conn(&id).unwrap().last_rcv_seq, 1);

        // A BadId message is stored but does not move the chain.
        store
            .commit_rcv(
                &id,
                None,
                &[],
                1,
                0,
                EntityId::random(),
                2,
                b"dup".to_vec(),
                Integrity::BadId { expected: 1 },
                [8; 32],
            )
            .unwrap();
        let rec = store.get_conn(&id).unwrap();
        assert_eq!(rec.last_rcv_seq, 1);
        assert_eq!(rec.last_rcv_hash, [9; 32]);
    }

    #[test]
    fn skipped_keys_are_consumed_once() {
        let store = MemStore::new();
        let rec = conn();
        let id = rec.conn_id;
        store.create_conn(rec).unwrap();

        let skipped = vec![SkippedKey {
            header_key: [5; 32],
            msg_number: 3,
            message_key: [6; 32],
        }];
        store
            .commit_rcv(
                &id,
                None,
                &skipped,
                4,
                0,
                EntityId::random(),
                1,
                b"x".to_vec(),
                Integrity::Skipped { from: 3, to: 3 },
                [1; 32],
            )
            .unwrap();

        assert_eq!(
            store.take_skipped_key(&id, &[5; 32], 3).unwrap(),
            Some([6; 32])
        );
        assert_eq!(store.take_skipped_key(&id, &[5; 32], 3).unwrap(), None);
    }

    #[test]
    fn pending_snd_lists_unsent_in_order() {
        let store = MemStore::new();
        let rec = conn();
        let id = rec.conn_id;
        store.create_conn(rec).unwrap();

        let (id1, _) = store
            .commit_snd(&id, b"r".to_vec(), b"first".to_vec(), [0; 32])
            .unwrap();
        store
            .commit_snd(&id, b"r".to_vec(), b"second".to_vec(), [0; 32])
            .unwrap();

        assert_eq!(store.pending_snd(&id).unwrap().len(), 2);
        store.mark_snd_sent(&id, id1).unwrap();
        let pending = store.pending_snd(&id).unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].wire_body, b"second");
    }

    #[test]
    fn rcv_ack_marks_consumed() {
        let store = MemStore::new();
        let rec = conn();
        let id = rec.conn_id;
        store.create_conn(rec).unwrap();

        let internal = store
            .commit_rcv(
                &id,
                None,
                &[],
                1,
                0,
                EntityId::random(),
                1,
                b"m".to_vec(),
                Integrity::Ok,
                [0; 32],
            )
            .unwrap();
        assert!(!store.get_rcv_msg(&id, internal).unwrap().acked);
        store.mark_rcv_acked(&id, internal).unwrap();
        assert!(store.get_rcv_msg(&id, internal).unwrap().acked);
    }
}
