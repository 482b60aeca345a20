//! Broker client — one secured session to one relay.
//!
//! The client multiplexes concurrent requests over a single session by
//! correlation id and surfaces relay-initiated traffic (deliveries, END)
//! as [`BrokerEvent`]s. A reader task and a writer task own the split
//! transport; request futures park on oneshot channels until their
//! response lands.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};

use quill_core::addr::RelayAddr;
use quill_core::command::{Command, ErrorCode, RelayMessage, Response};
use quill_core::crypto::{DhPublic, SignKeyPair, TransportKeypair, VerifyKey};
use quill_core::ids::EntityId;
use quill_core::wire::{encode_blocks, BlockAssembler, Transmission};
use quill_server::transport::{client_handshake, TransportError};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("request timed out")]
    Timeout,

    #[error("session closed")]
    Closed,

    #[error("relay answered {0}")]
    Protocol(ErrorCode),

    #[error("unexpected response shape")]
    UnexpectedResponse,
}

impl BrokerError {
    /// Transient errors are retried with backoff and replica rotation;
    /// permanent ones surface immediately.
    pub fn is_transient(&self) -> bool {
        match self {
            BrokerError::Timeout | BrokerError::Closed => true,
            BrokerError::Transport(t) => !matches!(
                t,
                TransportError::Version | TransportError::Identity
            ),
            BrokerError::Protocol(code) => matches!(
                code,
                ErrorCode::Internal | ErrorCode::Quota
            ),
            BrokerError::UnexpectedResponse => false,
        }
    }
}

// ── Events ────────────────────────────────────────────────────────────────────

/// Relay-initiated traffic on this session.
#[derive(Debug)]
pub enum BrokerEvent {
    /// A message delivered to a subscribed queue.
    Msg {
        queue_id: EntityId,
        msg: RelayMessage,
    },
    /// This session's subscription was replaced or its queue deleted.
    End { queue_id: EntityId },
    /// The session is gone; a new client must be connected.
    Closed,
}

// ── Client ────────────────────────────────────────────────────────────────────

pub struct BrokerClient {
    addr: RelayAddr,
    session_id: [u8; 32],
    next_corr: AtomicU64,
    pending: Arc<DashMap<Vec<u8>, oneshot::Sender<Response>>>,
    out_tx: mpsc::Sender<Transmission>,
    closed: Arc<AtomicBool>,
}

impl BrokerClient {
    /// Dial the relay, run the handshake pinned to its fingerprint, and
    /// start the session tasks.
    pub async fn connect(
        addr: &RelayAddr,
    ) -> Result<(Arc<Self>, mpsc::Receiver<BrokerEvent>), BrokerError> {
        let stream = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(addr.socket_addr()))
            .await
            .map_err(|_| BrokerError::Timeout)?
            .map_err(TransportError::Io)?;

        let keypair = TransportKeypair::generate();
        let transport = client_handshake(stream, &keypair, Some(addr.key_hash)).await?;
        let session_id = transport.session_id();
        tracing::debug!(relay = %addr, session = %hex::encode(&session_id[..8]), "relay session open");

        let (mut reader, mut writer) = transport.split();
        let pending: Arc<DashMap<Vec<u8>, oneshot::Sender<Response>>> = Arc::new(DashMap::new());
        let closed = Arc::new(AtomicBool::new(false));
        let (out_tx, mut out_rx) = mpsc::channel::<Transmission>(64);
        let (event_tx, event_rx) = mpsc::channel::<BrokerEvent>(64);

        // Writer: drain outbound transmissions, batching ready ones.
        tokio::spawn(async move {
            while let Some(first) = out_rx.recv().await {
                let mut batch = vec![first];
                while batch.len() < 8 {
                    match out_rx.try_recv() {
                        Ok(tx) => batch.push(tx),
                        Err(_) => break,
                    }
                }
                let blocks = match encode_blocks(&session_id, &batch) {
                    Ok(b) => b,
                    Err(e) => {
                        tracing::error!(error = %e, "request encoding failed");
                        continue;
                    }
                };
                for block in blocks {
                    if writer.write_block(&block).await.is_err() {
                        return;
                    }
                }
            }
        });

        // Reader: route responses to their requests, pushes to events.
        {
            let pending = pending.clone();
            let closed = closed.clone();
            tokio::spawn(async move {
                let mut assembler = BlockAssembler::new(session_id);
                loop {
                    let block = match reader.read_block().await {
                        Ok(b) => b,
                        Err(_) => break,
                    };
                    let txs = match assembler.feed(&block) {
                        Ok(t) => t,
                        Err(e) => {
                            tracing::warn!(error = %e, "bad block from relay");
                            break;
                        }
                    };
                    for tx in txs {
                        let response = match Response::decode(&tx.body) {
                            Ok(r) => r,
                            Err(e) => {
                                tracing::warn!(error = %e, "unparseable response");
                                continue;
                            }
                        };
                        if !tx.corr_id.is_empty() {
                            if let Some((_, sender)) = pending.remove(&tx.corr_id) {
                                let _ = sender.send(response);
                            }
                            continue;
                        }
                        let event = match (tx.entity_id, response) {
                            (Some(queue_id), Response::Msg(msg)) => {
                                Some(BrokerEvent::Msg { queue_id, msg })
                            }
                            (Some(queue_id), Response::End) => {
                                Some(BrokerEvent::End { queue_id })
                            }
                            other => {
                                tracing::debug!(?other, "ignoring unsolicited response");
                                None
                            }
                        };
                        if let Some(event) = event {
                            if event_tx.send(event).await.is_err() {
                                break;
                            }
                        }
                    }
                }
                closed.store(true, Ordering::SeqCst);
                pending.clear();
                let _ = event_tx.send(BrokerEvent::Closed).await;
            });
        }

        Ok((
            Arc::new(Self {
                addr: addr.clone(),
                session_id,
                next_corr: AtomicU64::new(1),
                pending,
                out_tx,
                closed,
            }),
            event_rx,
        ))
    }

    pub fn addr(&self) -> &RelayAddr {
        &self.addr
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Send one command and await its correlated response.
    pub async fn request(
        &self,
        signer: Option<&SignKeyPair>,
        entity: Option<EntityId>,
        command: &Command,
    ) -> Result<Response, BrokerError> {
        if self.is_closed() {
            return Err(BrokerError::Closed);
        }
        let corr_id = self
            .next_corr
            .fetch_add(1, Ordering::SeqCst)
            .to_le_bytes()
            .to_vec();
        let body = command.encode();
        let signature = signer.map(|key| {
            let entity_bytes = entity
                .as_ref()
                .map(|e| e.as_bytes().as_slice())
                .unwrap_or(&[]);
            key.sign(&Transmission::signed_bytes(
                &self.session_id,
                &corr_id,
                entity_bytes,
                &body,
            ))
        });

        let (tx, rx) = oneshot::channel();
        self.pending.insert(corr_id.clone(), tx);

        let transmission = Transmission {
            signature,
            corr_id: corr_id.clone(),
            entity_id: entity,
            body,
        };
        if self.out_tx.send(transmission).await.is_err() {
            self.pending.remove(&corr_id);
            return Err(BrokerError::Closed);
        }

        match tokio::time::timeout(REQUEST_TIMEOUT, rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(BrokerError::Closed),
            Err(_) => {
                self.pending.remove(&corr_id);
                Err(BrokerError::Timeout)
            }
        }
    }

    // ── Typed helpers ─────────────────────────────────────────────────────

    /// NEW: create a queue; returns (recipient id, sender id, relay DH key).
    pub async fn create_queue(
        &self,
        recipient: &SignKeyPair,
        dh_key: DhPublic,
    ) -> Result<(EntityId, EntityId, DhPublic), BrokerError> {
        let command = Command::New {
            recipient_key: recipient.verify_key(),
            dh_key,
            basic_auth: None,
        };
        match self.request(Some(recipient), None, &command).await? {
            Response::Ids {
                recipient_id,
                sender_id,
                srv_dh,
            } => Ok((recipient_id, sender_id, srv_dh)),
            Response::Err(code) => Err(BrokerError::Protocol(code)),
            _ => Err(BrokerError::UnexpectedResponse),
        }
    }

    /// SUB: subscribe; returns the front message if one is waiting.
    pub async fn subscribe(
        &self,
        recipient: &SignKeyPair,
        rid: EntityId,
    ) -> Result<Option<RelayMessage>, BrokerError> {
        match self.request(Some(recipient), Some(rid), &Command::Sub).await? {
            Response::Ok => Ok(None),
            Response::Msg(msg) => Ok(Some(msg)),
            Response::Err(code) => Err(BrokerError::Protocol(code)),
            _ => Err(BrokerError::UnexpectedResponse),
        }
    }

    /// KEY: secure the queue with the sender's verify key.
    pub async fn secure_queue(
        &self,
        recipient: &SignKeyPair,
        rid: EntityId,
        sender_key: VerifyKey,
    ) -> Result<(), BrokerError> {
        self.expect_ok(Some(recipient), Some(rid), &Command::Key { sender_key })
            .await
    }

    /// SEND: append a message; `signer` is None only for the confirmation.
    pub async fn send_msg(
        &self,
        signer: Option<&SignKeyPair>,
        sid: EntityId,
        flags: quill_core::command::MsgFlags,
        body: Vec<u8>,
    ) -> Result<(), BrokerError> {
        self.expect_ok(signer, Some(sid), &Command::Send { flags, body })
            .await
    }

    /// ACK: consume the delivered message.
    pub async fn ack_msg(
        &self,
        recipient: &SignKeyPair,
        rid: EntityId,
        msg_id: EntityId,
    ) -> Result<(), BrokerError> {
        self.expect_ok(Some(recipient), Some(rid), &Command::Ack { msg_id })
            .await
    }

    pub async fn suspend_queue(
        &self,
        recipient: &SignKeyPair,
        rid: EntityId,
    ) -> Result<(), BrokerError> {
        self.expect_ok(Some(recipient), Some(rid), &Command::Off).await
    }

    pub async fn delete_queue(
        &self,
        recipient: &SignKeyPair,
        rid: EntityId,
    ) -> Result<(), BrokerError> {
        self.expect_ok(Some(recipient), Some(rid), &Command::Del).await
    }

    pub async fn ping(&self) -> Result<(), BrokerError> {
        match self.request(None, None, &Command::Ping).await? {
            Response::Pong => Ok(()),
            Response::Err(code) => Err(BrokerError::Protocol(code)),
            _ => Err(BrokerError::UnexpectedResponse),
        }
    }

    async fn expect_ok(
        &self,
        signer: Option<&SignKeyPair>,
        entity: Option<EntityId>,
        command: &Command,
    ) -> Result<(), BrokerError> {
        match self.request(signer, entity, command).await? {
            Response::Ok => Ok(()),
            Response::Err(code) => Err(BrokerError::Protocol(code)),
            _ => Err(BrokerError::UnexpectedResponse),
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
