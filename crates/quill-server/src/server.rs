//! The relay server: accepts client sessions, authenticates per-queue
//! commands, routes them to the store, and pushes deliveries to
//! subscribers.
//!
//! Each session runs two tasks: a reader that parses blocks and dispatches
//! commands, and a writer that drains the session's bounded outbound queue.
//! Subscription pushes from other sessions land in the same outbound queue,
//! so backpressure is uniform: when a client stops draining, its reader
//! stops consuming inbound blocks.

use std::net::SocketAddr;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

use quill_core::addr::RelayAddr;
use quill_core::command::{Command, ErrorCode, RelayMessage, Response, MAX_MESSAGE_BODY};
use quill_core::config::RelayConfig;
use quill_core::crypto::{self, DhKeyPair, TransportKeypair, VerifyKey};
use quill_core::ids::{EntityId, QueueRole};
use quill_core::wire::{encode_blocks, BlockAssembler, Transmission};

use crate::ntf::{seal_token, NtfSink, PushNotification};
use crate::store::{
    now_secs, FileStore, FilesError, JournalConfig, NotifierRecord, QueueRecord, QueueStatus,
    QueueStore, StoreError, WriteOutcome,
};
use crate::transport::{server_handshake, BlockWriter, TransportError};

/// Store-log growth that triggers compaction during a sweep.
const COMPACT_THRESHOLD: u64 = 4096;

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("server I/O: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Files(#[from] FilesError),

    #[error(transparent)]
    Transport(#[from] TransportError),
}

// ── Outbound deliveries ───────────────────────────────────────────────────────

/// One response or push on its way to a session's writer.
#[derive(Debug)]
struct Delivery {
    corr_id: Vec<u8>,
    entity: Option<EntityId>,
    response: Response,
}

/// The active subscriber of a queue.
struct Subscriber {
    session_id: [u8; 32],
    tx: mpsc::Sender<Delivery>,
    /// Message id delivered and awaiting ACK. At most one at any time.
    delivered: Option<EntityId>,
}

// ── Server state ──────────────────────────────────────────────────────────────

struct ServerState {
    config: RelayConfig,
    keypair: TransportKeypair,
    store: QueueStore,
    files: FileStore,
    subscribers: DashMap<EntityId, Subscriber>,
    ntf: Arc<dyn NtfSink>,
}

impl ServerState {
    /// Remove every subscription owned by a finished session.
    fn drop_session_subscribers(&self, session_id: &[u8; 32]) {
        self.subscribers
            .retain(|_, sub| sub.session_id != *session_id);
    }
}

// ── Relay server ──────────────────────────────────────────────────────────────

/// A running relay. Dropping the handle leaves the tasks running; call
/// [`RelayServer::stop`] for an orderly shutdown.
pub struct RelayServer {
    state: Arc<ServerState>,
    local_addr: SocketAddr,
    shutdown: broadcast::Sender<()>,
    accept_task: JoinHandle<()>,
    sweep_task: JoinHandle<()>,
}

impl RelayServer {
    /// Open the stores, bind the listener, and start serving.
    pub async fn start(config: RelayConfig, ntf: Arc<dyn NtfSink>) -> Result<Self, ServerError> {
        let keypair = load_or_generate_keypair(&config.keypair_path)?;
        let journal_config = JournalConfig {
            quota: config.quota,
            max_msg_count: config.max_journal_msg_count,
            max_state_lines: config.max_state_lines,
        };
        let store = QueueStore::open(&config.store_dir, journal_config)?;
        let files = FileStore::open(&config.store_dir, config.max_chunk_size)?;

        let listener = TcpListener::bind(&config.listen_addr).await?;
        let local_addr = listener.local_addr()?;

        let state = Arc::new(ServerState {
            config,
            keypair,
            store,
            files,
            subscribers: DashMap::new(),
            ntf,
        });

        let (shutdown, _) = broadcast::channel(1);

        let accept_task = tokio::spawn(accept_loop(
            listener,
            state.clone(),
            shutdown.subscribe(),
        ));
        let sweep_task = tokio::spawn(sweep_loop(state.clone(), shutdown.subscribe()));

        tracing::info!(
            addr = %local_addr,
            fingerprint = hex::encode(state.keypair.fingerprint()),
            "relay started"
        );

        Ok(Self {
            state,
            local_addr,
            shutdown,
            accept_task,
            sweep_task,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// The fingerprint clients pin in `quill://` addresses.
    pub fn fingerprint(&self) -> [u8; 32] {
        self.state.keypair.fingerprint()
    }

    /// This relay's address for a given reachable host name.
    pub fn relay_addr(&self, host: &str) -> RelayAddr {
        RelayAddr::new(host, self.local_addr.port(), self.fingerprint())
    }

    /// Number of live queues (for operational introspection).
    pub fn queue_count(&self) -> usize {
        self.state.store.len()
    }

    /// Rewrite the store log as a snapshot.
    pub fn compact_store(&self) -> Result<(), StoreError> {
        self.state.store.compact()
    }

    /// Stop accepting, end the sweeper, and let sessions drain.
    pub async fn stop(self) {
        let _ = self.shutdown.send(());
        let _ = self.accept_task.await;
        let _ = self.sweep_task.await;
        tracing::info!("relay stopped");
    }
}

fn load_or_generate_keypair(path: &std::path::Path) -> Result<TransportKeypair, ServerError> {
    if path.exists() {
        let text = std::fs::read_to_string(path)?;
        let bytes: [u8; 32] = hex::decode(text.trim())
            .ok()
            .and_then(|b| b.try_into().ok())
            .ok_or_else(|| StoreError::Corrupt(format!("bad keypair file {}", path.display())))?;
        return Ok(TransportKeypair::from_private(bytes));
    }
    let keypair = TransportKeypair::generate();
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, hex::encode(*keypair.private_bytes()))?;
    Ok(keypair)
}

// ── Accept and sweep loops ────────────────────────────────────────────────────

async fn accept_loop(
    listener: TcpListener,
    state: Arc<ServerState>,
    mut shutdown: broadcast::Receiver<()>,
) {
    loop {
        tokio::select! {
            _ = shutdown.recv() => {
                tracing::info!("accept loop shutting down");
                return;
            }
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer)) => {
                        tracing::debug!(%peer, "session accepted");
                        tokio::spawn(handle_session(stream, state.clone()));
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "accept failed");
                    }
                }
            }
        }
    }
}

async fn sweep_loop(state: Arc<ServerState>, mut shutdown: broadcast::Receiver<()>) {
    let period =
        std::time::Duration::from_secs(state.config.check_interval_secs.max(1));
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The first tick fires immediately; skip it so startup is quiet.
    interval.tick().await;

    loop {
        tokio::select! {
            _ = shutdown.recv() => {
                tracing::debug!("sweeper shutting down");
                return;
            }
            _ = interval.tick() => {
                sweep_once(&state).await;
            }
        }
    }
}

async fn sweep_once(state: &Arc<ServerState>) {
    if state.config.ttl_secs > 0 {
        let cutoff = now_secs().saturating_sub(state.config.ttl_secs);
        let mut expired = 0usize;
        for rec in state.store.active_queues() {
            // The delivered-pending-ack message is the journal front; it
            // must stay put until the subscriber acknowledges it.
            let delivery_in_flight = state
                .subscribers
                .get(&rec.recipient_id)
                .map(|s| s.delivered.is_some())
                .unwrap_or(false);
            if delivery_in_flight {
                continue;
            }
            let Ok(journal) = state.store.journal(&rec.recipient_id) else {
                continue;
            };
            let mut journal_guard = journal.lock().await;
            match journal_guard.delete_expired(cutoff) {
                Ok(n) => expired += n,
                Err(e) => {
                    tracing::warn!(rid = ?rec.recipient_id, error = %e, "expiration failed")
                }
            }
        }
        if expired > 0 {
            tracing::info!(expired, "expired messages deleted");
        }
        state.files.delete_expired(cutoff).await;
    }

    if state.store.log_appended() > COMPACT_THRESHOLD {
        if let Err(e) = state.store.compact() {
            tracing::warn!(error = %e, "store compaction failed");
        }
    }
}

// ── Session handling ──────────────────────────────────────────────────────────

async fn handle_session(stream: TcpStream, state: Arc<ServerState>) {
    let transport = match server_handshake(stream, &state.keypair).await {
        Ok(t) => t,
        Err(TransportError::Version) => {
            tracing::debug!("client rejected: no common version");
            return;
        }
        Err(e) => {
            tracing::debug!(error = %e, "handshake failed");
            return;
        }
    };
    let session_id = transport.session_id();
    tracing::debug!(session = %hex::encode(&session_id[..8]), "session established");

    let (mut reader, writer) = transport.split();
    let (out_tx, out_rx) = mpsc::channel::<Delivery>(state.config.session_queue_len);
    let writer_task = tokio::spawn(write_loop(writer, out_rx, session_id));

    let mut assembler = BlockAssembler::new(session_id);
    loop {
        let block = match reader.read_block().await {
            Ok(b) => b,
            Err(TransportError::Closed) => break,
            Err(e) => {
                tracing::debug!(error = %e, "session read failed");
                break;
            }
        };
        let txs = match assembler.feed(&block) {
            Ok(txs) => txs,
            Err(e) => {
                tracing::warn!(error = %e, "malformed block, closing session");
                break;
            }
        };
        let mut closed = false;
        for tx in txs {
            let reply = dispatch(&state, &session_id, &out_tx, tx).await;
            // Backpressure: the reader waits here while the outbound
            // queue is full, which stops inbound consumption.
            if out_tx.send(reply).await.is_err() {
                closed = true;
                break;
            }
        }
        if closed {
            break;
        }
    }

    state.drop_session_subscribers(&session_id);
    drop(out_tx);
    let _ = writer_task.await;
    tracing::debug!(session = %hex::encode(&session_id[..8]), "session ended");
}

async fn write_loop(
    mut writer: BlockWriter<TcpStream>,
    mut out_rx: mpsc::Receiver<Delivery>,
    session_id: [u8; 32],
) {
    while let Some(first) = out_rx.recv().await {
        // Batch whatever is already queued into as few blocks as possible.
        let mut pending = vec![first];
        while pending.len() < 16 {
            match out_rx.try_recv() {
                Ok(d) => pending.push(d),
                Err(_) => break,
            }
        }
        let txs: Vec<Transmission> = pending
            .into_iter()
            .map(|d| Transmission {
                signature: None,
                corr_id: d.corr_id,
                entity_id: d.entity,
                body: d.response.encode(),
            })
            .collect();
        let blocks = match encode_blocks(&session_id, &txs) {
            Ok(b) => b,
            Err(e) => {
                tracing::error!(error = %e, "response encoding failed");
                continue;
            }
        };
        for block in blocks {
            if let Err(e) = writer.write_block(&block).await {
                tracing::debug!(error = %e, "session write failed");
                return;
            }
        }
    }
}

// ── Dispatch ──────────────────────────────────────────────────────────────────

async fn dispatch(
    state: &Arc<ServerState>,
    session_id: &[u8; 32],
    out_tx: &mpsc::Sender<Delivery>,
    tx: Transmission,
) -> Delivery {
    let corr_id = tx.corr_id.clone();
    let entity = tx.entity_id;
    let response = match Command::decode(&tx.body) {
        Ok(command) => handle_command(state, session_id, out_tx, &tx, command).await,
        Err(_) => Response::Err(ErrorCode::Syntax),
    };
    Delivery {
        corr_id,
        entity,
        response,
    }
}

/// Verify the transmission signature against `key`.
fn signed_ok(session_id: &[u8; 32], tx: &Transmission, key: &VerifyKey) -> bool {
    let Some(signature) = &tx.signature else {
        return false;
    };
    let entity_bytes = tx
        .entity_id
        .as_ref()
        .map(|e| e.as_bytes().as_slice())
        .unwrap_or(&[]);
    let data = Transmission::signed_bytes(session_id, &tx.corr_id, entity_bytes, &tx.body);
    key.verify(&data, signature)
}

async fn handle_command(
    state: &Arc<ServerState>,
    session_id: &[u8; 32],
    out_tx: &mpsc::Sender<Delivery>,
    tx: &Transmission,
    command: Command,
) -> Response {
    match command {
        Command::Ping => {
            if tx.entity_id.is_some() {
                return Response::Err(ErrorCode::NoEntity);
            }
            Response::Pong
        }

        Command::New {
            recipient_key,
            dh_key,
            basic_auth: _,
        } => {
            if tx.entity_id.is_some() {
                return Response::Err(ErrorCode::NoEntity);
            }
            // NEW is self-authenticating: signed by the key it registers.
            if !signed_ok(session_id, tx, &recipient_key) {
                return Response::Err(ErrorCode::Auth);
            }
            let server_dh = DhKeyPair::generate();
            let secret = server_dh.shared_secret(&dh_key);
            // Id collisions are astronomically unlikely but retried anyway.
            for _ in 0..3 {
                let rec = QueueRecord {
                    recipient_id: EntityId::random(),
                    sender_id: EntityId::random(),
                    recipient_key,
                    sender_key: None,
                    recipient_dh: *secret.as_bytes(),
                    status: QueueStatus::Active,
                    notifier: None,
                    updated_at: now_secs(),
                };
                let ids = (rec.recipient_id, rec.sender_id);
                match state.store.create(rec) {
                    Ok(()) => {
                        tracing::debug!(rid = ?ids.0, "queue created");
                        return Response::Ids {
                            recipient_id: ids.0,
                            sender_id: ids.1,
                            srv_dh: server_dh.public(),
                        };
                    }
                    Err(StoreError::Duplicate) => continue,
                    Err(e) => {
                        tracing::error!(error = %e, "queue create failed");
                        return Response::Err(ErrorCode::Internal);
                    }
                }
            }
            Response::Err(ErrorCode::Internal)
        }

        Command::Sub => with_recipient(state, session_id, tx, |rid, rec| {
            subscribe(state, session_id, out_tx, rid, rec)
        })
        .await,

        Command::Key { sender_key } => {
            with_recipient(state, session_id, tx, |rid, _| async move {
                match state.store.secure(&rid, sender_key) {
                    Ok(()) => Response::Ok,
                    Err(StoreError::Auth) => Response::Err(ErrorCode::Auth),
                    Err(_) => Response::Err(ErrorCode::Internal),
                }
            })
            .await
        }

        Command::NKey {
            notifier_key,
            dh_key,
        } => {
            with_recipient(state, session_id, tx, |rid, _| async move {
                let server_dh = DhKeyPair::generate();
                let secret = server_dh.shared_secret(&dh_key);
                let ntf = NotifierRecord {
                    notifier_id: EntityId::random(),
                    notifier_key,
                    dh_secret: *secret.as_bytes(),
                };
                let notifier_id = ntf.notifier_id;
                match state.store.add_notifier(&rid, ntf) {
                    Ok(()) => Response::NtfId {
                        notifier_id,
                        srv_dh: server_dh.public(),
                    },
                    Err(_) => Response::Err(ErrorCode::Internal),
                }
            })
            .await
        }

        Command::NDel => {
            with_recipient(state, session_id, tx, |rid, _| async move {
                match state.store.delete_notifier(&rid) {
                    Ok(()) => Response::Ok,
                    Err(_) => Response::Err(ErrorCode::Internal),
                }
            })
            .await
        }

        Command::Off => {
            with_recipient(state, session_id, tx, |rid, _| async move {
                match state.store.suspend(&rid) {
                    Ok(()) => Response::Ok,
                    Err(_) => Response::Err(ErrorCode::Internal),
                }
            })
            .await
        }

        Command::Del => {
            with_recipient(state, session_id, tx, |rid, _| async move {
                // The subscriber, if any, learns the queue is gone.
                if let Some((_, sub)) = state.subscribers.remove(&rid) {
                    let _ = sub.tx.try_send(Delivery {
                        corr_id: Vec::new(),
                        entity: Some(rid),
                        response: Response::End,
                    });
                }
                match state.store.delete(&rid) {
                    Ok(()) => Response::Ok,
                    Err(_) => Response::Err(ErrorCode::Internal),
                }
            })
            .await
        }

        Command::Ack { msg_id } => {
            with_recipient(state, session_id, tx, |rid, _| {
                acknowledge(state, session_id, rid, msg_id)
            })
            .await
        }

        Command::Send { flags, body } => handle_send(state, session_id, tx, flags, body).await,

        Command::FNew {
            sender_key,
            info,
            recipient_keys,
        } => {
            if tx.entity_id.is_some() {
                return Response::Err(ErrorCode::NoEntity);
            }
            if !signed_ok(session_id, tx, &sender_key) {
                return Response::Err(ErrorCode::Auth);
            }
            match state.files.create(sender_key, info, &recipient_keys) {
                Ok((sender_id, recipient_ids)) => Response::FileIds {
                    sender_id,
                    recipient_ids,
                },
                Err(FilesError::TooLarge) => Response::Err(ErrorCode::Large),
                Err(e) => {
                    tracing::error!(error = %e, "chunk create failed");
                    Response::Err(ErrorCode::Internal)
                }
            }
        }

        Command::FPut { body } => {
            let Some(sid) = tx.entity_id else {
                return Response::Err(ErrorCode::NoEntity);
            };
            let Ok(lock) = state.files.by_sender(&sid) else {
                return Response::Err(ErrorCode::Auth);
            };
            let mut rec = lock.lock().await;
            if !signed_ok(session_id, tx, &rec.sender_key) {
                return Response::Err(ErrorCode::Auth);
            }
            match state.files.put_body(&mut rec, &body) {
                Ok(()) => Response::Ok,
                Err(FilesError::SizeMismatch) => Response::Err(ErrorCode::Size),
                Err(FilesError::DigestMismatch) => Response::Err(ErrorCode::Digest),
                Err(FilesError::AlreadyStored) => Response::Err(ErrorCode::Prohibited),
                Err(e) => {
                    tracing::error!(error = %e, "chunk store failed");
                    Response::Err(ErrorCode::Internal)
                }
            }
        }

        Command::FGet { dh_key } => {
            let Some(rid) = tx.entity_id else {
                return Response::Err(ErrorCode::NoEntity);
            };
            let Ok((_, lock)) = state.files.by_recipient(&rid) else {
                return Response::Err(ErrorCode::Auth);
            };
            let rec = lock.lock().await;
            let Some(recipient) = rec.recipients.iter().find(|r| r.recipient_id == rid) else {
                return Response::Err(ErrorCode::Auth);
            };
            if !signed_ok(session_id, tx, &recipient.key) {
                return Response::Err(ErrorCode::Auth);
            }
            let body = match state.files.read_body(&rec) {
                Ok(b) => b,
                Err(FilesError::NotReceived) => return Response::Err(ErrorCode::NoMsg),
                Err(e) => {
                    tracing::error!(error = %e, "chunk read failed");
                    return Response::Err(ErrorCode::Internal);
                }
            };
            // Seal the body under a fresh DH agreement with the requester.
            let server_dh = DhKeyPair::generate();
            let secret = server_dh.shared_secret(&dh_key);
            let nonce = crypto::generate_seal_nonce();
            let mut sealed = nonce.to_vec();
            sealed.extend_from_slice(&crypto::seal(secret.as_bytes(), &nonce, &body));
            Response::FileData {
                srv_dh: server_dh.public(),
                body: sealed,
            }
        }

        Command::FAck => {
            let Some(rid) = tx.entity_id else {
                return Response::Err(ErrorCode::NoEntity);
            };
            let Ok((_, lock)) = state.files.by_recipient(&rid) else {
                return Response::Err(ErrorCode::Auth);
            };
            let mut rec = lock.lock().await;
            let Some(recipient) = rec.recipients.iter().find(|r| r.recipient_id == rid) else {
                return Response::Err(ErrorCode::Auth);
            };
            if !signed_ok(session_id, tx, &recipient.key) {
                return Response::Err(ErrorCode::Auth);
            }
            match state.files.ack(&mut rec, &rid) {
                Ok(()) => Response::Ok,
                Err(e) => {
                    tracing::error!(error = %e, "chunk ack failed");
                    Response::Err(ErrorCode::Internal)
                }
            }
        }

        Command::FDel => {
            let Some(sid) = tx.entity_id else {
                return Response::Err(ErrorCode::NoEntity);
            };
            let Ok(lock) = state.files.by_sender(&sid) else {
                return Response::Err(ErrorCode::Auth);
            };
            let rec = lock.lock().await;
            if !signed_ok(session_id, tx, &rec.sender_key) {
                return Response::Err(ErrorCode::Auth);
            }
            match state.files.delete(&rec) {
                Ok(()) => Response::Ok,
                Err(e) => {
                    tracing::error!(error = %e, "chunk delete failed");
                    Response::Err(ErrorCode::Internal)
                }
            }
        }
    }
}

/// Authenticate a recipient-role command and run `f` with the queue.
///
/// Unknown queues and bad signatures are the same `AUTH` failure — a relay
/// must not reveal which ids exist.
async fn with_recipient<F, Fut>(
    state: &Arc<ServerState>,
    session_id: &[u8; 32],
    tx: &Transmission,
    f: F,
) -> Response
where
    F: FnOnce(EntityId, QueueRecord) -> Fut,
    Fut: std::future::Future<Output = Response>,
{
    let Some(rid) = tx.entity_id else {
        return Response::Err(ErrorCode::NoEntity);
    };
    let Ok(rec) = state.store.get(QueueRole::Recipient, &rid) else {
        return Response::Err(ErrorCode::Auth);
    };
    if !signed_ok(session_id, tx, &rec.recipient_key) {
        return Response::Err(ErrorCode::Auth);
    }
    f(rid, rec).await
}

// ── Subscription and delivery ─────────────────────────────────────────────────

/// Register this session as the queue's subscriber, replacing any previous
/// one (which receives `END`). Responds with the front message if one is
/// already waiting.
async fn subscribe(
    state: &Arc<ServerState>,
    session_id: &[u8; 32],
    out_tx: &mpsc::Sender<Delivery>,
    rid: EntityId,
    _rec: QueueRecord,
) -> Response {
    let previous = state.subscribers.insert(
        rid,
        Subscriber {
            session_id: *session_id,
            tx: out_tx.clone(),
            delivered: None,
        },
    );
    if let Some(old) = previous {
        if old.session_id != *session_id {
            // Ordered after anything the old subscriber was sent, because
            // it goes through the same outbound queue.
            let _ = old
                .tx
                .send(Delivery {
                    corr_id: Vec::new(),
                    entity: Some(rid),
                    response: Response::End,
                })
                .await;
        }
    }

    let journal = match state.store.journal(&rid) {
        Ok(j) => j,
        Err(_) => return Response::Err(ErrorCode::Internal),
    };
    let front = {
        let mut journal = journal.lock().await;
        match journal.peek() {
            Ok(front) => front,
            Err(e) => {
                tracing::error!(error = %e, "journal peek failed");
                return Response::Err(ErrorCode::Internal);
            }
        }
    };
    match front {
        Some(msg) => {
            if let Some(mut sub) = state.subscribers.get_mut(&rid) {
                // A SEND racing this SUB may have pushed the message
                // already; answering with it again would double-deliver.
                if sub.delivered.is_some() {
                    return Response::Ok;
                }
                sub.delivered = Some(msg.msg_id());
            }
            Response::Msg(msg)
        }
        None => Response::Ok,
    }
}

/// Consume the delivered message and push the next one, if any.
async fn acknowledge(
    state: &Arc<ServerState>,
    session_id: &[u8; 32],
    rid: EntityId,
    msg_id: EntityId,
) -> Response {
    {
        let Some(sub) = state.subscribers.get(&rid) else {
            return Response::Err(ErrorCode::NoMsg);
        };
        if sub.session_id != *session_id || sub.delivered != Some(msg_id) {
            return Response::Err(ErrorCode::NoMsg);
        }
    }

    let journal = match state.store.journal(&rid) {
        Ok(j) => j,
        Err(_) => return Response::Err(ErrorCode::Internal),
    };
    let next = {
        let mut journal = journal.lock().await;
        // The front must still be the acknowledged message; anything else
        // (a racing expiration, a stale ack) leaves the journal untouched.
        match journal.peek() {
            Ok(Some(front)) if front.msg_id() == msg_id => {}
            Ok(_) => return Response::Err(ErrorCode::NoMsg),
            Err(e) => {
                tracing::error!(error = %e, "journal peek failed");
                return Response::Err(ErrorCode::Internal);
            }
        }
        if let Err(e) = journal.delete_peeked() {
            tracing::error!(error = %e, "journal delete failed");
            return Response::Err(ErrorCode::Internal);
        }
        match journal.peek() {
            Ok(next) => next,
            Err(e) => {
                tracing::error!(error = %e, "journal peek failed");
                return Response::Err(ErrorCode::Internal);
            }
        }
    };

    let push = {
        let Some(mut sub) = state.subscribers.get_mut(&rid) else {
            return Response::Ok;
        };
        sub.delivered = next.as_ref().map(|m| m.msg_id());
        next.map(|msg| (sub.tx.clone(), msg))
    };
    if let Some((tx, msg)) = push {
        let _ = tx
            .send(Delivery {
                corr_id: Vec::new(),
                entity: Some(rid),
                response: Response::Msg(msg),
            })
            .await;
    }
    Response::Ok
}

/// Append a message to a queue, enforcing auth, size, and quota; deliver to
/// the subscriber and fire the push notification when applicable.
async fn handle_send(
    state: &Arc<ServerState>,
    session_id: &[u8; 32],
    tx: &Transmission,
    flags: quill_core::command::MsgFlags,
    body: Vec<u8>,
) -> Response {
    let Some(sid) = tx.entity_id else {
        return Response::Err(ErrorCode::NoEntity);
    };
    let Ok(rec) = state.store.get(QueueRole::Sender, &sid) else {
        return Response::Err(ErrorCode::Auth);
    };

    // Unsigned SEND is allowed only while the queue has no sender key:
    // that one message carries the key that secures the queue.
    match (&rec.sender_key, &tx.signature) {
        (Some(key), Some(_)) => {
            if !signed_ok(session_id, tx, key) {
                return Response::Err(ErrorCode::Auth);
            }
        }
        (None, None) => {}
        _ => return Response::Err(ErrorCode::Auth),
    }

    if rec.status == QueueStatus::Suspended {
        return Response::Err(ErrorCode::Auth);
    }
    if body.len() > MAX_MESSAGE_BODY {
        return Response::Err(ErrorCode::Large);
    }

    let rid = rec.recipient_id;
    let journal = match state.store.journal(&rid) {
        Ok(j) => j,
        Err(_) => return Response::Err(ErrorCode::Internal),
    };
    let outcome = {
        let mut journal = journal.lock().await;
        match journal.write(flags, body) {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::error!(error = %e, "journal write failed");
                return Response::Err(ErrorCode::Internal);
            }
        }
    };

    match outcome {
        WriteOutcome::Written { msg, empty_before } => {
            if empty_before {
                deliver_front(state, &rid, &msg).await;
            }
            if flags.notification {
                if let Some(ntf) = &rec.notifier {
                    state.ntf.deliver(PushNotification {
                        notifier_id: ntf.notifier_id,
                        sealed_token: seal_token(&ntf.dh_secret, &msg.msg_id(), msg.ts()),
                    });
                }
            }
            Response::Ok
        }
        WriteOutcome::QuotaMarker | WriteOutcome::Refused => Response::Err(ErrorCode::Quota),
    }
}

/// Push a freshly written front message to the queue's subscriber, if it
/// has one and nothing is pending acknowledgment.
async fn deliver_front(state: &Arc<ServerState>, rid: &EntityId, msg: &RelayMessage) {
    let push = {
        let Some(mut sub) = state.subscribers.get_mut(rid) else {
            return;
        };
        if sub.delivered.is_some() {
            return;
        }
        sub.delivered = Some(msg.msg_id());
        sub.tx.clone()
    };
    let _ = push
        .send(Delivery {
            corr_id: Vec::new(),
            entity: Some(*rid),
            response: Response::Msg(msg.clone()),
        })
        .await;
}
