//! The connection agent: turns pairs of unidirectional queues into duplex
//! connections.
//!
//! For each logical connection the agent owns a receive queue on its own
//! relay and a send credential for the peer's queue. It performs the key
//! agreement, runs the per-message ratchet, enforces in-order surfacing
//! with integrity metadata, and persists every step through the
//! [`AgentStateStore`] port before anything touches the network.
//!
//! Delivery runs through per-connection send workers: a worker exists only
//! while its connection has pending messages, drains them in sequence
//! order with bounded exponential backoff, and deregisters itself when the
//! queue is empty.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use dashmap::DashMap;
use tokio::sync::mpsc;

use quill_core::addr::{AddrError, Invitation, RelayAddr};
use quill_core::command::{ErrorCode, MsgFlags, RelayMessage};
use quill_core::crypto::{self, DhKeyPair, DhPublic, SignKeyPair, VerifyKey};
use quill_core::config::AgentConfig;
use quill_core::ids::EntityId;

use crate::client::{BrokerClient, BrokerError, BrokerEvent};
use crate::envelope::{
    chain_hash, classify, confirmation_seal_key, new_confirmation_id, pad_confirmation,
    unpad_confirmation, AgentMsg, ClientMsg, Confirmation, Envelope, EnvelopeError, Integrity,
};
use crate::ratchet::{Ratchet, RatchetError, RatchetHeader};
use crate::store::{
    AgentStateStore, AgentStoreError, ConnMode, ConnRecord, ConnStatus, RcvQueue, SndQueue,
};

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error(transparent)]
    Broker(#[from] BrokerError),

    #[error(transparent)]
    Store(#[from] AgentStoreError),

    #[error(transparent)]
    Ratchet(#[from] RatchetError),

    #[error(transparent)]
    Envelope(#[from] EnvelopeError),

    #[error(transparent)]
    Addr(#[from] AddrError),

    #[error("connection handshake not accepted in time")]
    NotAccepted,

    #[error("no relay configured")]
    NoRelay,

    #[error("connection is in the wrong state: {0}")]
    BadState(&'static str),

    #[error("confirmation could not be decrypted")]
    BadConfirmation,
}

// ── Events ────────────────────────────────────────────────────────────────────

/// What the agent surfaces to the application.
#[derive(Debug)]
pub enum AgentEvent {
    /// A joiner asked to connect; answer with [`ConnectionAgent::allow_conn`].
    Conf {
        conn_id: EntityId,
        confirmation_id: EntityId,
        info: Vec<u8>,
    },
    /// The duplex handshake completed.
    Con { conn_id: EntityId },
    /// An application message arrived.
    Msg {
        conn_id: EntityId,
        internal_id: u64,
        body: Vec<u8>,
        integrity: Integrity,
        server_ts: u64,
        sender_ts: i64,
    },
    /// A message handed to [`ConnectionAgent::send`] reached the relay.
    Sent { conn_id: EntityId, internal_id: u64 },
    /// The peer acknowledged one of our messages at the agent level.
    MsgAck {
        conn_id: EntityId,
        internal_id: u64,
        ok: bool,
    },
    /// The peer's queue refused writes; data was lost at the relay.
    QuotaExceeded { conn_id: EntityId },
    /// HELLO retries exhausted the handshake window.
    NotAccepted { conn_id: EntityId },
    /// The connection ended: peer deleted it or the subscription was lost.
    End { conn_id: EntityId },
    /// A delivery worker gave up; the error is permanent.
    DeliveryFailed { conn_id: EntityId, reason: String },
}

// ── Agent ─────────────────────────────────────────────────────────────────────

struct PendingConf {
    conn_id: EntityId,
    sender_key: VerifyKey,
}

struct AgentInner {
    config: AgentConfig,
    store: Arc<dyn AgentStateStore>,
    clients: DashMap<RelayAddr, Arc<BrokerClient>>,
    conn_locks: DashMap<EntityId, Arc<tokio::sync::Mutex<()>>>,
    by_rcv_queue: DashMap<EntityId, EntityId>,
    pending_confs: DashMap<EntityId, PendingConf>,
    /// Connections with a live send worker. Absence = no pending work.
    snd_workers: DashMap<EntityId, ()>,
    /// When the first (unsecured) delivery attempt of a connection began.
    hello_started: DashMap<EntityId, Instant>,
    events_tx: mpsc::Sender<AgentEvent>,
}

/// Client-side orchestrator of duplex connections.
pub struct ConnectionAgent {
    inner: Arc<AgentInner>,
}

impl ConnectionAgent {
    /// Create an agent over a state store. Returns the agent and the
    /// application event stream.
    pub fn new(
        config: AgentConfig,
        store: Arc<dyn AgentStateStore>,
    ) -> (Self, mpsc::Receiver<AgentEvent>) {
        let (events_tx, events_rx) = mpsc::channel(256);
        let inner = Arc::new(AgentInner {
            config,
            store,
            clients: DashMap::new(),
            conn_locks: DashMap::new(),
            by_rcv_queue: DashMap::new(),
            pending_confs: DashMap::new(),
            snd_workers: DashMap::new(),
            hello_started: DashMap::new(),
            events_tx,
        });
        (Self { inner }, events_rx)
    }

    /// Create the receiving side of a new connection and return the
    /// out-of-band invitation.
    pub async fn new_conn(&self, mode: ConnMode) -> Result<(EntityId, Invitation), AgentError> {
        let relay = self.inner.choose_relay()?;
        let client = self.inner.client(&relay).await?;

        let rcv_key = SignKeyPair::generate();
        let dh = DhKeyPair::generate();
        let (rid, sid, _srv_dh) = client.create_queue(&rcv_key, dh.public()).await?;

        let conn_id = EntityId::random();
        let mut rec = ConnRecord::new(conn_id, mode);
        rec.rcv_queue = Some(RcvQueue {
            relay: relay.clone(),
            recipient_id: rid,
            recipient_sign_key: *rcv_key.private_bytes(),
            queue_sender_id: sid,
            dh_private: *dh.private_bytes(),
        });
        self.inner.store.create_conn(rec)?;
        self.inner.by_rcv_queue.insert(rid, conn_id);

        client.subscribe(&rcv_key, rid).await?;

        let invitation = Invitation::new(relay, sid, dh.public());
        tracing::info!(conn = ?conn_id, "connection created, invitation ready");
        Ok((conn_id, invitation))
    }

    /// Join a peer's invitation. With `reply` set, a reply queue is created
    /// so the connection becomes duplex.
    pub async fn join_conn(
        &self,
        invitation: &Invitation,
        reply: bool,
        info: &[u8],
    ) -> Result<EntityId, AgentError> {
        let conn_id = EntityId::random();
        let snd_key = SignKeyPair::generate();
        let eph = DhKeyPair::generate();
        let inviter_dh = invitation.dh_key;

        let shared = eph.shared_secret(&inviter_dh);
        let ratchet = Ratchet::init_sender(&shared, &inviter_dh);

        let mut rec = ConnRecord::new(conn_id, ConnMode::Contact);
        rec.status = ConnStatus::Joined;
        rec.snd_queue = Some(SndQueue {
            relay: invitation.relay.clone(),
            sender_id: invitation.sender_id,
            sender_sign_key: *snd_key.private_bytes(),
            secured: false,
        });

        // The reply queue, when requested, exists before the confirmation
        // goes out so the REPLY can follow HELLO without further setup.
        let mut rcv_key_for_sub = None;
        if reply {
            let relay = self.inner.choose_relay()?;
            let client = self.inner.client(&relay).await?;
            let rcv_key = SignKeyPair::generate();
            let dh = DhKeyPair::generate();
            let (rid, sid, _srv_dh) = client.create_queue(&rcv_key, dh.public()).await?;
            rec.rcv_queue = Some(RcvQueue {
                relay,
                recipient_id: rid,
                recipient_sign_key: *rcv_key.private_bytes(),
                queue_sender_id: sid,
                dh_private: *dh.private_bytes(),
            });
            rcv_key_for_sub = Some((rid, rcv_key));
        }

        self.inner.store.create_conn(rec)?;
        self.inner.store.save_ratchet(&conn_id, ratchet.to_blob())?;
        if let Some((rid, rcv_key)) = rcv_key_for_sub {
            self.inner.by_rcv_queue.insert(rid, conn_id);
            let rcv_relay = self
                .inner
                .store
                .get_conn(&conn_id)?
                .rcv_queue
                .expect("created above")
                .relay;
            self.inner
                .client(&rcv_relay)
                .await?
                .subscribe(&rcv_key, rid)
                .await?;
        }

        // The one allowed unsigned SEND: the confirmation that keys the
        // peer's queue and seeds the ratchet.
        let conf = Confirmation::new(
            snd_key.verify_key().as_bytes(),
            eph.public().as_bytes(),
            info,
        );
        let payload = seal_confirmation(&eph, &inviter_dh, &conf)?;
        let client = self.inner.client(&invitation.relay).await?;
        client
            .send_msg(
                None,
                invitation.sender_id,
                MsgFlags::default(),
                ClientMsg::Confirmation(payload).encode(),
            )
            .await?;

        // HELLO starts retrying immediately; it succeeds once the inviter
        // secures the queue.
        {
            let lock = self.inner.conn_lock(&conn_id);
            let _guard = lock.lock().await;
            self.inner.enqueue_agent_msg(
                &conn_id,
                AgentMsg::Hello {
                    verify_key: snd_key.verify_key().0,
                    flags: 0,
                },
            )?;
        }
        self.inner.hello_started.insert(conn_id, Instant::now());
        self.inner.ensure_snd_worker(conn_id);

        tracing::info!(conn = ?conn_id, "joined invitation");
        Ok(conn_id)
    }

    /// Accept a pending confirmation: secures the queue so the joiner's
    /// signed traffic is admitted.
    pub async fn allow_conn(
        &self,
        conn_id: EntityId,
        confirmation_id: EntityId,
        _info: &[u8],
    ) -> Result<(), AgentError> {
        let (_, pending) = self
            .inner
            .pending_confs
            .remove(&confirmation_id)
            .ok_or(AgentError::BadState("no such confirmation"))?;
        if pending.conn_id != conn_id {
            return Err(AgentError::BadState("confirmation belongs elsewhere"));
        }
        let rec = self.inner.store.get_conn(&conn_id)?;
        let rcv = rec
            .rcv_queue
            .as_ref()
            .ok_or(AgentError::BadState("no receive queue"))?;
        let rcv_key = SignKeyPair::from_private(rcv.recipient_sign_key);
        let client = self.inner.client(&rcv.relay).await?;
        client
            .secure_queue(&rcv_key, rcv.recipient_id, pending.sender_key)
            .await?;
        self.inner
            .store
            .update_conn(&conn_id, &mut |rec| rec.status = ConnStatus::Confirmed)?;
        tracing::info!(conn = ?conn_id, "connection allowed");
        Ok(())
    }

    /// Re-attach the receive queue subscription (after restart or END).
    pub async fn subscribe(&self, conn_id: EntityId) -> Result<(), AgentError> {
        let rec = self.inner.store.get_conn(&conn_id)?;
        let rcv = rec
            .rcv_queue
            .as_ref()
            .ok_or(AgentError::BadState("no receive queue"))?;
        self.inner.by_rcv_queue.insert(rcv.recipient_id, conn_id);
        let rcv_key = SignKeyPair::from_private(rcv.recipient_sign_key);
        let client = self.inner.client(&rcv.relay).await?;
        client.subscribe(&rcv_key, rcv.recipient_id).await?;
        self.inner.ensure_snd_worker(conn_id);
        Ok(())
    }

    /// Suspend the receive queue: the relay refuses writes, reads drain.
    pub async fn suspend(&self, conn_id: EntityId) -> Result<(), AgentError> {
        let rec = self.inner.store.get_conn(&conn_id)?;
        let rcv = rec
            .rcv_queue
            .as_ref()
            .ok_or(AgentError::BadState("no receive queue"))?;
        let rcv_key = SignKeyPair::from_private(rcv.recipient_sign_key);
        let client = self.inner.client(&rcv.relay).await?;
        client.suspend_queue(&rcv_key, rcv.recipient_id).await?;
        self.inner
            .store
            .update_conn(&conn_id, &mut |rec| rec.status = ConnStatus::Suspended)?;
        Ok(())
    }

    /// Delete the connection on both sides: best-effort DEL to the peer,
    /// queue deletion at the relay, then the local state.
    pub async fn delete(&self, conn_id: EntityId) -> Result<(), AgentError> {
        let rec = self.inner.store.get_conn(&conn_id)?;
        if rec.status == ConnStatus::Active {
            let lock = self.inner.conn_lock(&conn_id);
            let _guard = lock.lock().await;
            if self.inner.enqueue_agent_msg(&conn_id, AgentMsg::Del).is_ok() {
                self.inner.ensure_snd_worker(conn_id);
            }
        }
        if let Some(rcv) = &rec.rcv_queue {
            let rcv_key = SignKeyPair::from_private(rcv.recipient_sign_key);
            if let Ok(client) = self.inner.client(&rcv.relay).await {
                let _ = client.delete_queue(&rcv_key, rcv.recipient_id).await;
            }
            self.inner.by_rcv_queue.remove(&rcv.recipient_id);
        }
        self.inner.store.delete_conn(&conn_id)?;
        tracing::info!(conn = ?conn_id, "connection deleted");
        Ok(())
    }

    /// Queue an application message. Returns its internal id; `Sent` is
    /// emitted when the relay accepts it.
    pub async fn send(&self, conn_id: EntityId, body: Vec<u8>) -> Result<u64, AgentError> {
        let rec = self.inner.store.get_conn(&conn_id)?;
        if rec.status != ConnStatus::Active {
            return Err(AgentError::BadState("connection not active"));
        }
        let internal_id = {
            let lock = self.inner.conn_lock(&conn_id);
            let _guard = lock.lock().await;
            self.inner
                .enqueue_agent_msg(&conn_id, AgentMsg::Msg { body })?
        };
        self.inner.ensure_snd_worker(conn_id);
        Ok(internal_id)
    }

    /// Mark a received message consumed and send the agent-level receipt.
    pub async fn ack(&self, conn_id: EntityId, internal_id: u64) -> Result<(), AgentError> {
        self.inner.store.mark_rcv_acked(&conn_id, internal_id)?;
        let rec = self.inner.store.get_conn(&conn_id)?;
        if rec.status == ConnStatus::Active {
            let lock = self.inner.conn_lock(&conn_id);
            let _guard = lock.lock().await;
            self.inner.enqueue_agent_msg(
                &conn_id,
                AgentMsg::Ack {
                    msg_id: internal_id,
                    ok: true,
                },
            )?;
            drop(_guard);
            self.inner.ensure_snd_worker(conn_id);
        }
        Ok(())
    }

    /// Resubscribe every stored connection (startup path).
    pub async fn resume_all(&self) -> Result<(), AgentError> {
        for conn_id in self.inner.store.list_conns() {
            if let Err(e) = self.subscribe(conn_id).await {
                tracing::warn!(conn = ?conn_id, error = %e, "resume failed");
            }
        }
        Ok(())
    }
}

// ── Inner mechanics ───────────────────────────────────────────────────────────

impl AgentInner {
    fn choose_relay(&self) -> Result<RelayAddr, AgentError> {
        let first = self.config.relays.first().ok_or(AgentError::NoRelay)?;
        first.parse().map_err(AgentError::Addr)
    }

    fn conn_lock(&self, conn_id: &EntityId) -> Arc<tokio::sync::Mutex<()>> {
        self.conn_locks
            .entry(*conn_id)
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    /// The session to a relay, dialing on first use. Each live client has a
    /// pump task feeding its events into the agent.
    fn client<'a>(
        self: &'a Arc<Self>,
        relay: &'a RelayAddr,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<Arc<BrokerClient>, AgentError>> + Send + 'a>> {
        Box::pin(async move {
        if let Some(existing) = self.clients.get(relay) {
            if !existing.is_closed() {
                return Ok(existing.clone());
            }
        }
        let (client, events) = BrokerClient::connect(relay).await?;
        self.clients.insert(relay.clone(), client.clone());

        let inner = self.clone();
        let relay = relay.clone();
        tokio::spawn(async move {
            let mut events = events;
            while let Some(event) = events.recv().await {
                inner.process_relay_event(&relay, event).await;
            }
        });
        Ok(client)
        })
    }

    async fn emit(&self, event: AgentEvent) {
        if self.events_tx.send(event).await.is_err() {
            tracing::warn!("application dropped the event stream");
        }
    }

    // ── Receive path ──────────────────────────────────────────────────────

    async fn process_relay_event(self: &Arc<Self>, relay: &RelayAddr, event: BrokerEvent) {
        match event {
            BrokerEvent::Msg { queue_id, msg } => {
                let Some(conn_id) = self.by_rcv_queue.get(&queue_id).map(|c| *c) else {
                    tracing::debug!(rid = ?queue_id, "delivery for unknown queue");
                    return;
                };
                let lock = self.conn_lock(&conn_id);
                let _guard = lock.lock().await;
                if let Err(e) = self.handle_delivery(conn_id, msg).await {
                    tracing::warn!(conn = ?conn_id, error = %e, "delivery processing failed");
                }
            }
            BrokerEvent::End { queue_id } => {
                if let Some(conn_id) = self.by_rcv_queue.get(&queue_id).map(|c| *c) {
                    self.emit(AgentEvent::End { conn_id }).await;
                }
            }
            BrokerEvent::Closed => {
                tracing::debug!(relay = %relay, "relay session closed");
                self.clients.remove(relay);
            }
        }
    }

    async fn handle_delivery(
        self: &Arc<Self>,
        conn_id: EntityId,
        msg: RelayMessage,
    ) -> Result<(), AgentError> {
        let (msg_id, server_ts) = (msg.msg_id(), msg.ts());
        match msg {
            RelayMessage::QuotaMarker { .. } => {
                self.emit(AgentEvent::QuotaExceeded { conn_id }).await;
            }
            RelayMessage::Content { body, .. } => {
                match ClientMsg::decode(&body)? {
                    ClientMsg::Confirmation(payload) => {
                        self.handle_confirmation(conn_id, &payload).await?;
                    }
                    ClientMsg::Ratchet(payload) => {
                        self.handle_ratchet_msg(conn_id, &payload, msg_id, server_ts)
                            .await?;
                    }
                }
            }
        }
        // Durably processed — consume it at the relay so the next one flows.
        self.relay_ack(conn_id, msg_id).await
    }

    async fn relay_ack(self: &Arc<Self>, conn_id: EntityId, msg_id: EntityId) -> Result<(), AgentError> {
        let rec = self.store.get_conn(&conn_id)?;
        let rcv = rec
            .rcv_queue
            .as_ref()
            .ok_or(AgentError::BadState("no receive queue"))?;
        let rcv_key = SignKeyPair::from_private(rcv.recipient_sign_key);
        let client = self.client(&rcv.relay).await?;
        match client.ack_msg(&rcv_key, rcv.recipient_id, msg_id).await {
            Ok(()) | Err(BrokerError::Protocol(ErrorCode::NoMsg)) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// The unsigned confirmation. On the inviter it starts the ratchet and
    /// surfaces CONF for `allow_conn`; on the joiner's reply queue it is
    /// auto-accepted, because joining was already consent.
    async fn handle_confirmation(
        self: &Arc<Self>,
        conn_id: EntityId,
        payload: &[u8],
    ) -> Result<(), AgentError> {
        let rec = self.store.get_conn(&conn_id)?;
        let rcv = rec
            .rcv_queue
            .as_ref()
            .ok_or(AgentError::BadState("no receive queue"))?;
        let own_dh = DhKeyPair::from_private(rcv.dh_private);
        let conf = open_confirmation(&own_dh, payload)?;
        let sender_key = conf
            .sender_key_bytes()
            .map(VerifyKey)
            .ok_or(AgentError::BadConfirmation)?;

        match rec.mode {
            ConnMode::Invitation => {
                let their_dh = conf
                    .dh_key_bytes()
                    .map(DhPublic)
                    .ok_or(AgentError::BadConfirmation)?;
                let shared = own_dh.shared_secret(&their_dh);
                let ratchet = Ratchet::init_receiver(&shared, own_dh);
                self.store.save_ratchet(&conn_id, ratchet.to_blob())?;

                let confirmation_id = new_confirmation_id();
                self.pending_confs.insert(
                    confirmation_id,
                    PendingConf {
                        conn_id,
                        sender_key,
                    },
                );
                let info = conf.info_bytes().unwrap_or_default();
                self.emit(AgentEvent::Conf {
                    conn_id,
                    confirmation_id,
                    info,
                })
                .await;
            }
            ConnMode::Contact => {
                // The reply-queue confirmation carries the inviter's send
                // credential for our queue; secure it right away.
                let rcv_key = SignKeyPair::from_private(rcv.recipient_sign_key);
                let client = self.client(&rcv.relay).await?;
                client
                    .secure_queue(&rcv_key, rcv.recipient_id, sender_key)
                    .await?;
                tracing::debug!(conn = ?conn_id, "reply queue secured");
            }
        }
        Ok(())
    }

    async fn handle_ratchet_msg(
        self: &Arc<Self>,
        conn_id: EntityId,
        payload: &[u8],
        server_msg_id: EntityId,
        server_ts: u64,
    ) -> Result<(), AgentError> {
        if payload.len() < RatchetHeader::LEN {
            return Err(AgentError::Envelope(EnvelopeError::Malformed));
        }
        let header = RatchetHeader::decode(&payload[..RatchetHeader::LEN])
            .ok_or(AgentError::Envelope(EnvelopeError::Malformed))?;
        let ciphertext = &payload[RatchetHeader::LEN..];

        // Old message whose key was skipped earlier: decrypt without
        // touching the live ratchet.
        let (plaintext, skipped, blob) = match self
            .store
            .take_skipped_key(&conn_id, &header.dh_public, header.msg_number)?
        {
            Some(mk) => (Ratchet::decrypt_skipped(&mk, ciphertext)?, Vec::new(), None),
            None => {
                let stored = self
                    .store
                    .load_ratchet(&conn_id)?
                    .ok_or(AgentError::BadState("no ratchet yet"))?;
                let mut ratchet = Ratchet::from_blob(&stored)?;
                let (pt, skipped) = ratchet.decrypt(&header, ciphertext)?;
                (pt, skipped, Some(ratchet.to_blob()))
            }
        };

        let envelope = Envelope::decode(&plaintext)?;
        let rec = self.store.get_conn(&conn_id)?;
        let integrity = classify(
            rec.last_rcv_seq,
            &rec.last_rcv_hash,
            envelope.seq,
            &envelope.prev_hash,
        );
        let rcv_hash = chain_hash(&plaintext);

        let stored_body = match &envelope.msg {
            AgentMsg::Msg { body } => body.clone(),
            _ => Vec::new(),
        };
        let internal_id = self.store.commit_rcv(
            &conn_id,
            blob,
            &skipped,
            envelope.seq,
            envelope.ts.timestamp(),
            server_msg_id,
            server_ts,
            stored_body,
            integrity,
            rcv_hash,
        )?;

        match envelope.msg {
            AgentMsg::Hello { .. } => {
                self.store
                    .update_conn(&conn_id, &mut |rec| rec.peer_hello_received = true)?;
                self.con_check(conn_id).await?;
            }
            AgentMsg::Reply { invitation } => {
                let invitation: Invitation = invitation.parse()?;
                self.handle_reply(conn_id, invitation).await?;
            }
            AgentMsg::Msg { body } => {
                self.emit(AgentEvent::Msg {
                    conn_id,
                    internal_id,
                    body,
                    integrity,
                    server_ts,
                    sender_ts: envelope.ts.timestamp(),
                })
                .await;
            }
            AgentMsg::Ack { msg_id, ok } => {
                self.emit(AgentEvent::MsgAck {
                    conn_id,
                    internal_id: msg_id,
                    ok,
                })
                .await;
            }
            AgentMsg::Del => {
                self.emit(AgentEvent::End { conn_id }).await;
            }
        }
        Ok(())
    }

    /// The joiner's REPLY: build our sending side toward their queue and
    /// run the symmetric confirmation + HELLO.
    async fn handle_reply(
        self: &Arc<Self>,
        conn_id: EntityId,
        invitation: Invitation,
    ) -> Result<(), AgentError> {
        let rec = self.store.get_conn(&conn_id)?;
        if rec.snd_queue.is_some() {
            tracing::debug!(conn = ?conn_id, "duplicate REPLY ignored");
            return Ok(());
        }

        // Confirmation to the reply queue; auto-accepted by the joiner.
        // The sending side is committed only after this send succeeds, so a
        // redelivered REPLY retries the whole sequence.
        let snd_key = SignKeyPair::generate();
        let eph = DhKeyPair::generate();
        let conf = Confirmation::new(snd_key.verify_key().as_bytes(), eph.public().as_bytes(), &[]);
        let payload = seal_confirmation(&eph, &invitation.dh_key, &conf)?;
        let client = self.client(&invitation.relay).await?;
        client
            .send_msg(
                None,
                invitation.sender_id,
                MsgFlags::default(),
                ClientMsg::Confirmation(payload).encode(),
            )
            .await?;

        self.store.update_conn(&conn_id, &mut |rec| {
            rec.snd_queue = Some(SndQueue {
                relay: invitation.relay.clone(),
                sender_id: invitation.sender_id,
                sender_sign_key: *snd_key.private_bytes(),
                secured: false,
            });
        })?;

        self.enqueue_agent_msg(
            &conn_id,
            AgentMsg::Hello {
                verify_key: snd_key.verify_key().0,
                flags: 0,
            },
        )?;
        self.hello_started.insert(conn_id, Instant::now());
        self.ensure_snd_worker(conn_id);
        Ok(())
    }

    /// Emit CON once this side's HELLO went through and, where a receive
    /// queue exists, the peer's HELLO arrived.
    async fn con_check(self: &Arc<Self>, conn_id: EntityId) -> Result<(), AgentError> {
        let rec = self.store.get_conn(&conn_id)?;
        let duplex_ready = rec.own_hello_sent
            && (rec.peer_hello_received || rec.rcv_queue.is_none());
        if duplex_ready && !rec.con_emitted {
            self.store.update_conn(&conn_id, &mut |rec| {
                rec.con_emitted = true;
                rec.status = ConnStatus::Active;
            })?;
            self.emit(AgentEvent::Con { conn_id }).await;
            tracing::info!(conn = ?conn_id, "duplex connection established");
        }
        Ok(())
    }

    // ── Send path ─────────────────────────────────────────────────────────

    /// Ratchet-encrypt an agent message and persist it as pending, in one
    /// transaction. The caller holds the connection lock.
    fn enqueue_agent_msg(&self, conn_id: &EntityId, msg: AgentMsg) -> Result<u64, AgentError> {
        let rec = self.store.get_conn(conn_id)?;
        let stored = self
            .store
            .load_ratchet(conn_id)?
            .ok_or(AgentError::BadState("no ratchet yet"))?;
        let mut ratchet = Ratchet::from_blob(&stored)?;

        let envelope = Envelope {
            seq: rec.last_snd_seq + 1,
            ts: Utc::now(),
            prev_hash: rec.last_snd_hash,
            msg,
        };
        let encoded = envelope.encode()?;
        let snd_hash = chain_hash(&encoded);
        let (header, ciphertext) = ratchet.encrypt(&encoded)?;

        let mut wire = Vec::with_capacity(RatchetHeader::LEN + ciphertext.len());
        wire.extend_from_slice(&header.encode());
        wire.extend_from_slice(&ciphertext);
        let wire = ClientMsg::Ratchet(wire).encode();

        let (internal_id, _seq) =
            self.store
                .commit_snd(conn_id, ratchet.to_blob(), wire, snd_hash)?;
        Ok(internal_id)
    }

    /// Spawn the send worker for a connection unless one is already live.
    fn ensure_snd_worker(self: &Arc<Self>, conn_id: EntityId) {
        use dashmap::mapref::entry::Entry;
        match self.snd_workers.entry(conn_id) {
            Entry::Occupied(_) => {}
            Entry::Vacant(slot) => {
                slot.insert(());
                let inner = self.clone();
                tokio::spawn(async move {
                    inner.snd_worker_loop(conn_id).await;
                });
            }
        }
    }

    async fn snd_worker_loop(self: Arc<Self>, conn_id: EntityId) {
        loop {
            let next = match self.store.pending_snd(&conn_id) {
                Ok(pending) => pending.into_iter().next(),
                Err(_) => None,
            };
            let Some(msg) = next else {
                // Deregister, then re-check: an enqueue that raced the
                // empty read must not strand its message.
                self.snd_workers.remove(&conn_id);
                let refilled = self
                    .store
                    .pending_snd(&conn_id)
                    .map(|p| !p.is_empty())
                    .unwrap_or(false);
                if refilled {
                    use dashmap::mapref::entry::Entry;
                    match self.snd_workers.entry(conn_id) {
                        Entry::Occupied(_) => return, // someone else took it
                        Entry::Vacant(slot) => {
                            slot.insert(());
                            continue;
                        }
                    }
                }
                return;
            };

            if !self.deliver_one(conn_id, msg.internal_id, &msg.wire_body).await {
                self.snd_workers.remove(&conn_id);
                return;
            }
        }
    }

    /// Deliver one pending message with retries. Returns false when the
    /// worker should stop (permanent failure or retry ceiling).
    async fn deliver_one(self: &Arc<Self>, conn_id: EntityId, internal_id: u64, wire: &[u8]) -> bool {
        let mut attempt: u32 = 0;
        loop {
            let rec = match self.store.get_conn(&conn_id) {
                Ok(r) => r,
                Err(_) => return false,
            };
            let Some(snd) = rec.snd_queue.clone() else {
                return false;
            };
            let key = SignKeyPair::from_private(snd.sender_sign_key);

            let result = match self.client(&snd.relay).await {
                Ok(client) => {
                    client
                        .send_msg(
                            Some(&key),
                            snd.sender_id,
                            MsgFlags { notification: true },
                            wire.to_vec(),
                        )
                        .await
                }
                Err(AgentError::Broker(e)) => Err(e),
                Err(_) => Err(BrokerError::Closed),
            };

            match result {
                Ok(()) => {
                    let _ = self.store.mark_snd_sent(&conn_id, internal_id);
                    self.after_delivery(conn_id, internal_id).await;
                    return true;
                }
                Err(BrokerError::Protocol(ErrorCode::Auth)) if !snd.secured => {
                    // Expected until the peer secures the queue; bounded by
                    // the hello window, not the retry ceiling.
                    let started = self
                        .hello_started
                        .get(&conn_id)
                        .map(|t| *t)
                        .unwrap_or_else(Instant::now);
                    if started.elapsed() > Duration::from_secs(self.config.hello_timeout_secs) {
                        tracing::warn!(conn = ?conn_id, "hello window exhausted");
                        self.emit(AgentEvent::NotAccepted { conn_id }).await;
                        return false;
                    }
                    let delay = self.config.retry_fast.delay_ms(attempt);
                    attempt = attempt.saturating_add(1);
                    tokio::time::sleep(Duration::from_millis(delay)).await;
                }
                Err(e) if e.is_transient() => {
                    attempt += 1;
                    if attempt > self.config.retry_slow.max_consecutive_retries {
                        tracing::warn!(conn = ?conn_id, error = %e, "retry ceiling hit");
                        self.emit(AgentEvent::DeliveryFailed {
                            conn_id,
                            reason: e.to_string(),
                        })
                        .await;
                        return false;
                    }
                    let delay = self.config.retry_slow.delay_ms(attempt);
                    tokio::time::sleep(Duration::from_millis(delay)).await;
                }
                Err(e) => {
                    tracing::warn!(conn = ?conn_id, error = %e, "permanent delivery failure");
                    self.emit(AgentEvent::DeliveryFailed {
                        conn_id,
                        reason: e.to_string(),
                    })
                    .await;
                    return false;
                }
            }
        }
    }

    /// Bookkeeping after a successful send: the first success proves the
    /// peer secured the queue, which unlocks REPLY and CON.
    async fn after_delivery(self: &Arc<Self>, conn_id: EntityId, internal_id: u64) {
        let mut first_success = false;
        let rec = self.store.update_conn(&conn_id, &mut |rec| {
            if let Some(snd) = rec.snd_queue.as_mut() {
                if !snd.secured {
                    snd.secured = true;
                    first_success = true;
                }
            }
            if first_success {
                rec.own_hello_sent = true;
            }
        });
        let Ok(rec) = rec else { return };

        if first_success {
            self.hello_started.remove(&conn_id);
            // The joiner follows its HELLO with the reply invitation.
            if rec.mode == ConnMode::Contact && !rec.reply_sent {
                if let Some(rcv) = &rec.rcv_queue {
                    let own_dh = DhKeyPair::from_private(rcv.dh_private);
                    let invitation =
                        Invitation::new(rcv.relay.clone(), rcv.queue_sender_id, own_dh.public());
                    let lock = self.conn_lock(&conn_id);
                    let _guard = lock.lock().await;
                    let enqueued = self.enqueue_agent_msg(
                        &conn_id,
                        AgentMsg::Reply {
                            invitation: invitation.to_string(),
                        },
                    );
                    if enqueued.is_ok() {
                        let _ = self
                            .store
                            .update_conn(&conn_id, &mut |rec| rec.reply_sent = true);
                    }
                }
            }
            let _ = self.con_check(conn_id).await;
        } else {
            self.emit(AgentEvent::Sent {
                conn_id,
                internal_id,
            })
            .await;
        }
    }
}

// ── Confirmation sealing ──────────────────────────────────────────────────────

/// `eph_pub (32) || nonce (12) || sealed padded JSON`.
fn seal_confirmation(
    eph: &DhKeyPair,
    their_dh: &DhPublic,
    conf: &Confirmation,
) -> Result<Vec<u8>, AgentError> {
    let shared = eph.shared_secret(their_dh);
    let key = confirmation_seal_key(&shared);
    let json = serde_json::to_vec(conf).expect("confirmation serialization is infallible");
    let padded = pad_confirmation(&json)?;
    let nonce = crypto::generate_seal_nonce();

    let mut out = Vec::with_capacity(32 + 12 + padded.len() + 16);
    out.extend_from_slice(eph.public().as_bytes());
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&crypto::seal(&key, &nonce, &padded));
    Ok(out)
}

fn open_confirmation(own_dh: &DhKeyPair, payload: &[u8]) -> Result<Confirmation, AgentError> {
    if payload.len() < 32 + 12 {
        return Err(AgentError::BadConfirmation);
    }
    let eph = DhPublic::from_slice(&payload[..32]).ok_or(AgentError::BadConfirmation)?;
    let nonce: [u8; 12] = payload[32..44].try_into().expect("12-byte nonce");
    let shared = own_dh.shared_secret(&eph);
    let key = confirmation_seal_key(&shared);
    let padded =
        crypto::open(&key, &nonce, &payload[44..]).map_err(|_| AgentError::BadConfirmation)?;
    let json = unpad_confirmation(&padded)?;
    serde_json::from_slice(json).map_err(|_| AgentError::BadConfirmation)
}

// ── Tests ─────────────────────────────────────────────────────────────────────
