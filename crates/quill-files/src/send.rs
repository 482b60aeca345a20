//! The upload pipeline: encrypt, chunk, fan out, describe.
//!
//! Every chunk gets throwaway credentials — a sender keypair plus one
//! recipient keypair per recipient — and goes to a relay picked from the
//! pool, rotating to a different relay on failure. Progress persists to a
//! plan file after every chunk, so an interrupted upload resumes with
//! [`FileTransfer::resume_send`] without re-uploading finished chunks.
//!
//! When a recipient description would not fit the QR budget, the full
//! description is itself uploaded as a small file and replaced by a tiny
//! redirect descriptor.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::task::JoinSet;

use quill_core::addr::RelayAddr;
use quill_core::command::{Command, FileInfo, Response};
use quill_core::crypto::{sha512, SignKeyPair};
use quill_core::ids::EntityId;

use crate::chunks::{encrypt_file, prepare_chunks, read_chunk};
use crate::description::{
    ChunkSpec, FileDescription, FileParty, RedirectInfo, Replica,
};
use crate::{FileError, FileEvent, FileTransfer};

use base64::Engine;
const B64: base64::engine::GeneralPurpose = base64::engine::general_purpose::STANDARD_NO_PAD;

/// Attempts across the relay pool before an upload gives up on a chunk.
const MAX_CHUNK_ATTEMPTS: u32 = 8;

// ── Result ────────────────────────────────────────────────────────────────────

/// What an upload hands back to the caller.
#[derive(Debug)]
pub struct SendResult {
    /// One description per recipient, redirect-wrapped when oversized.
    pub recipient_descriptions: Vec<FileDescription>,
    /// The sender's own description, for FDEL.
    pub sender_description: FileDescription,
}

// ── Plan ──────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
struct UploadedChunk {
    relay: String,
    sender_id: String,
    sender_key: String,
    /// (replica id, replica private key), one per recipient, in order.
    recipients: Vec<(String, String)>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ChunkPlan {
    chunk_no: u64,
    offset: u64,
    size: u64,
    digest: String,
    #[serde(default)]
    uploaded: Option<UploadedChunk>,
}

/// The persisted state of one upload. Everything needed to resume lives
/// here; the encrypted temp file sits next to it.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct UploadPlan {
    encrypted_path: PathBuf,
    encrypted_size: u64,
    digest: String,
    key: String,
    nonce: String,
    chunk_size: u64,
    num_recipients: usize,
    chunks: Vec<ChunkPlan>,
}

impl UploadPlan {
    fn save(&self, path: &Path) -> Result<(), FileError> {
        let json = serde_json::to_vec(self).expect("plan serialization is infallible");
        std::fs::write(path, json)?;
        Ok(())
    }

    fn load(path: &Path) -> Result<Self, FileError> {
        let json = std::fs::read(path)?;
        serde_json::from_slice(&json).map_err(|_| FileError::BadPlan)
    }
}

// ── Upload ────────────────────────────────────────────────────────────────────

impl FileTransfer {
    /// Encrypt and upload `src` for `num_recipients` receivers.
    pub async fn send_file(
        self: &Arc<Self>,
        src: &Path,
        num_recipients: usize,
    ) -> Result<SendResult, FileError> {
        self.send_file_impl(src, num_recipients, false).await
    }

    /// `internal` marks the redirect-descriptor upload: it reports progress
    /// but neither emits SfDone nor redirects again.
    async fn send_file_impl(
        self: &Arc<Self>,
        src: &Path,
        num_recipients: usize,
        internal: bool,
    ) -> Result<SendResult, FileError> {
        if self.relays.is_empty() {
            return Err(FileError::NoRelay);
        }
        std::fs::create_dir_all(&self.config.temp_dir)?;

        let mut key = [0u8; 32];
        let mut nonce = [0u8; 12];
        rand::Rng::fill(&mut rand::thread_rng(), &mut key);
        rand::Rng::fill(&mut rand::thread_rng(), &mut nonce);

        let filename = src
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("file")
            .to_string();
        let encrypted_path = self.temp_path(".enc");

        // Local prepare stage: streaming encrypt off the async threads.
        let (encrypted_size, digest) = {
            let src = src.to_path_buf();
            let dst = encrypted_path.clone();
            tokio::task::spawn_blocking(move || encrypt_file(&src, &dst, &key, &nonce, &filename))
                .await
                .expect("encrypt task panicked")?
        };

        let sizes = prepare_chunks(
            encrypted_size,
            self.config.default_chunk_size,
            self.config.small_chunk_size,
        );
        let mut chunks = Vec::with_capacity(sizes.len());
        let mut offset = 0u64;
        for (i, size) in sizes.iter().enumerate() {
            let body = read_chunk(&encrypted_path, offset, *size)?;
            chunks.push(ChunkPlan {
                chunk_no: i as u64 + 1,
                offset,
                size: *size,
                digest: B64.encode(sha512(&body)),
                uploaded: None,
            });
            offset += size;
        }

        let plan = UploadPlan {
            encrypted_path: encrypted_path.clone(),
            encrypted_size,
            digest: B64.encode(digest),
            key: B64.encode(key),
            nonce: B64.encode(nonce),
            chunk_size: self.config.default_chunk_size,
            num_recipients,
            chunks,
        };
        let plan_path = encrypted_path.with_extension("plan.json");
        plan.save(&plan_path)?;

        self.run_upload(plan, plan_path, internal).await
    }

    /// Continue an interrupted upload from its plan file.
    pub async fn resume_send(self: &Arc<Self>, plan_path: &Path) -> Result<SendResult, FileError> {
        let plan = UploadPlan::load(plan_path)?;
        if !plan.encrypted_path.exists() {
            return Err(FileError::BadPlan);
        }
        self.run_upload(plan, plan_path.to_path_buf(), false).await
    }

    async fn run_upload(
        self: &Arc<Self>,
        plan: UploadPlan,
        plan_path: PathBuf,
        internal: bool,
    ) -> Result<SendResult, FileError> {
        let total = plan.encrypted_size;
        let already_sent: u64 = plan
            .chunks
            .iter()
            .filter(|c| c.uploaded.is_some())
            .map(|c| c.size)
            .sum();
        let shared = Arc::new(Mutex::new((plan, already_sent)));

        // One task per pending chunk, bounded by the in-flight byte ceiling.
        let mut tasks = JoinSet::new();
        let pending: Vec<ChunkPlan> = {
            let guard = shared.lock().await;
            guard.0.chunks.iter().filter(|c| c.uploaded.is_none()).cloned().collect()
        };
        for chunk in pending {
            let this = self.clone();
            let shared = shared.clone();
            let plan_path = plan_path.clone();
            tasks.spawn(async move {
                let permit = this
                    .inflight
                    .clone()
                    .acquire_many_owned(chunk.size.min(u32::MAX as u64) as u32)
                    .await
                    .expect("inflight semaphore closed");
                let result = this.upload_chunk(&shared, &chunk).await;
                drop(permit);

                match result {
                    Ok(uploaded) => {
                        let mut guard = shared.lock().await;
                        let (plan, sent) = &mut *guard;
                        if let Some(slot) =
                            plan.chunks.iter_mut().find(|c| c.chunk_no == chunk.chunk_no)
                        {
                            slot.uploaded = Some(uploaded);
                        }
                        *sent += chunk.size;
                        let progress = (*sent, plan.save(&plan_path));
                        drop(guard);
                        this.emit(FileEvent::SfProg {
                            sent: progress.0,
                            total,
                        })
                        .await;
                        progress.1
                    }
                    Err(e) => Err(e),
                }
            });
        }
        while let Some(result) = tasks.join_next().await {
            match result {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    self.emit(FileEvent::SfErr {
                        reason: e.to_string(),
                    })
                    .await;
                    return Err(e);
                }
                Err(e) => {
                    self.emit(FileEvent::SfErr {
                        reason: e.to_string(),
                    })
                    .await;
                    return Err(FileError::BadPlan);
                }
            }
        }

        let (plan, _) = Arc::try_unwrap(shared)
            .map_err(|_| FileError::BadPlan)?
            .into_inner();
        let result = self.build_descriptions(&plan, internal).await?;

        // The encrypted artifact and its plan are no longer needed.
        let _ = std::fs::remove_file(&plan.encrypted_path);
        let _ = std::fs::remove_file(&plan_path);
        Ok(result)
    }

    /// Upload one chunk, rotating relays on failure. Never retries a relay
    /// it has already tried while others remain.
    async fn upload_chunk(
        self: &Arc<Self>,
        shared: &Arc<Mutex<(UploadPlan, u64)>>,
        chunk: &ChunkPlan,
    ) -> Result<UploadedChunk, FileError> {
        let (encrypted_path, num_recipients) = {
            let guard = shared.lock().await;
            (guard.0.encrypted_path.clone(), guard.0.num_recipients)
        };
        let body = read_chunk(&encrypted_path, chunk.offset, chunk.size)?;
        let digest: [u8; 64] = B64
            .decode(&chunk.digest)
            .ok()
            .and_then(|d| d.try_into().ok())
            .ok_or(FileError::BadPlan)?;

        let mut tried: HashSet<RelayAddr> = HashSet::new();
        let mut last_error = String::from("no relay reachable");
        for attempt in 0..MAX_CHUNK_ATTEMPTS {
            let untried = self.relays.iter().find(|r| !tried.contains(*r)).cloned();
            let relay = match untried {
                Some(relay) => relay,
                None => {
                    // Pool exhausted: start a fresh rotation.
                    tried.clear();
                    self.relays.first().cloned().ok_or(FileError::NoRelay)?
                }
            };
            tried.insert(relay.clone());

            match self
                .try_upload_to(&relay, &body, digest, chunk.size, num_recipients)
                .await
            {
                Ok(uploaded) => return Ok(uploaded),
                Err(e) if e.is_transient() => {
                    tracing::debug!(
                        chunk = chunk.chunk_no,
                        relay = %relay,
                        attempt,
                        error = %e,
                        "chunk upload retrying on another relay"
                    );
                    last_error = e.to_string();
                    tokio::time::sleep(std::time::Duration::from_millis(
                        100 * (attempt as u64 + 1),
                    ))
                    .await;
                }
                Err(e) => return Err(e),
            }
        }
        Err(FileError::ReplicasExhausted(last_error))
    }

    async fn try_upload_to(
        self: &Arc<Self>,
        relay: &RelayAddr,
        body: &[u8],
        digest: [u8; 64],
        size: u64,
        num_recipients: usize,
    ) -> Result<UploadedChunk, FileError> {
        let client = self.client(relay).await?;
        let sender_key = SignKeyPair::generate();
        let recipient_keys: Vec<SignKeyPair> =
            (0..num_recipients).map(|_| SignKeyPair::generate()).collect();

        let command = Command::FNew {
            sender_key: sender_key.verify_key(),
            info: FileInfo { size, digest },
            recipient_keys: recipient_keys.iter().map(|k| k.verify_key()).collect(),
        };
        let (sender_id, recipient_ids) =
            match client.request(Some(&sender_key), None, &command).await? {
                Response::FileIds {
                    sender_id,
                    recipient_ids,
                } => (sender_id, recipient_ids),
                Response::Err(code) => {
                    return Err(FileError::Broker(
                        quill_agent::client::BrokerError::Protocol(code),
                    ))
                }
                _ => return Err(FileError::BadPlan),
            };

        let put = Command::FPut {
            body: body.to_vec(),
        };
        match client
            .request(Some(&sender_key), Some(sender_id), &put)
            .await?
        {
            Response::Ok => {}
            Response::Err(code) => {
                // The slot is orphaned either way; tell the relay.
                let _ = client
                    .request(Some(&sender_key), Some(sender_id), &Command::FDel)
                    .await;
                return Err(FileError::Broker(
                    quill_agent::client::BrokerError::Protocol(code),
                ));
            }
            _ => return Err(FileError::BadPlan),
        }

        Ok(UploadedChunk {
            relay: relay.to_string(),
            sender_id: sender_id.to_base64(),
            sender_key: B64.encode(*sender_key.private_bytes()),
            recipients: recipient_ids
                .iter()
                .zip(recipient_keys.iter())
                .map(|(id, key)| (id.to_base64(), B64.encode(*key.private_bytes())))
                .collect(),
        })
    }

    // ── Descriptions ──────────────────────────────────────────────────────

    async fn build_descriptions(
        self: &Arc<Self>,
        plan: &UploadPlan,
        internal: bool,
    ) -> Result<SendResult, FileError> {
        let digest: [u8; 64] = decode64(&plan.digest).ok_or(FileError::BadPlan)?;
        let key: [u8; 32] = decode64(&plan.key).ok_or(FileError::BadPlan)?;
        let nonce: [u8; 12] = decode64(&plan.nonce).ok_or(FileError::BadPlan)?;

        let mut sender_chunks = Vec::with_capacity(plan.chunks.len());
        let mut recipient_chunks: Vec<Vec<ChunkSpec>> =
            vec![Vec::with_capacity(plan.chunks.len()); plan.num_recipients];

        for chunk in &plan.chunks {
            let uploaded = chunk.uploaded.as_ref().ok_or(FileError::BadPlan)?;
            let server: RelayAddr = uploaded.relay.parse().map_err(|_| FileError::BadPlan)?;
            let chunk_digest: [u8; 64] = decode64(&chunk.digest).ok_or(FileError::BadPlan)?;

            sender_chunks.push(ChunkSpec {
                chunk_no: chunk.chunk_no,
                digest: Some(chunk_digest),
                size: Some(chunk.size),
                replicas: vec![Replica {
                    server: server.clone(),
                    replica_id: EntityId::from_base64(&uploaded.sender_id)
                        .ok_or(FileError::BadPlan)?,
                    key: decode64(&uploaded.sender_key).ok_or(FileError::BadPlan)?,
                }],
            });

            // Demultiplex: recipient i gets her replica of every chunk.
            for (i, (id, replica_key)) in uploaded.recipients.iter().enumerate() {
                recipient_chunks[i].push(ChunkSpec {
                    chunk_no: chunk.chunk_no,
                    digest: Some(chunk_digest),
                    size: Some(chunk.size),
                    replicas: vec![Replica {
                        server: server.clone(),
                        replica_id: EntityId::from_base64(id).ok_or(FileError::BadPlan)?,
                        key: decode64(replica_key).ok_or(FileError::BadPlan)?,
                    }],
                });
            }
        }

        let sender_description = FileDescription::build(
            FileParty::Sender,
            plan.encrypted_size,
            &digest,
            &key,
            &nonce,
            plan.chunk_size,
            &sender_chunks,
            None,
        );

        let mut recipient_descriptions = Vec::with_capacity(plan.num_recipients);
        for chunks in &recipient_chunks {
            recipient_descriptions.push(FileDescription::build(
                FileParty::Recipient,
                plan.encrypted_size,
                &digest,
                &key,
                &nonce,
                plan.chunk_size,
                chunks,
                None,
            ));
        }

        if !internal {
            // Direct descriptors done; this is the first completion the
            // application sees even when a redirect pass follows.
            self.emit(FileEvent::SfDone {
                descriptions: recipient_descriptions.iter().map(|d| d.to_yaml()).collect(),
            })
            .await;

            let oversized = recipient_descriptions
                .iter()
                .any(|d| d.to_yaml().len() > self.config.qr_budget);
            if oversized {
                recipient_descriptions =
                    self.redirect_descriptions(recipient_descriptions).await?;
                self.emit(FileEvent::SfDone {
                    descriptions: recipient_descriptions.iter().map(|d| d.to_yaml()).collect(),
                })
                .await;
            }
        }

        Ok(SendResult {
            recipient_descriptions,
            sender_description,
        })
    }

    /// Upload each oversized description as a small file and hand out tiny
    /// redirect descriptors instead.
    async fn redirect_descriptions(
        self: &Arc<Self>,
        descriptions: Vec<FileDescription>,
    ) -> Result<Vec<FileDescription>, FileError> {
        let mut redirected = Vec::with_capacity(descriptions.len());
        for description in descriptions {
            let yaml = description.to_yaml();
            if yaml.len() <= self.config.qr_budget {
                redirected.push(description);
                continue;
            }
            let inner_size = yaml.len() as u64;
            let inner_digest = sha512(yaml.as_bytes());

            let path = self.temp_path(".desc");
            std::fs::write(&path, yaml.as_bytes())?;
            // Exactly one level: the inner upload never redirects again.
            let inner = Box::pin(self.send_file_impl(&path, 1, true)).await?;
            let _ = std::fs::remove_file(&path);

            let mut tiny = inner
                .recipient_descriptions
                .into_iter()
                .next()
                .ok_or(FileError::BadPlan)?;
            tiny.redirect = Some(RedirectInfo {
                size: inner_size,
                digest: B64.encode(inner_digest),
            });
            redirected.push(tiny);
        }
        Ok(redirected)
    }

    /// Delete every chunk named by a sender description.
    pub async fn delete_file(
        self: &Arc<Self>,
        sender_description: &FileDescription,
    ) -> Result<(), FileError> {
        let parsed = sender_description.parse()?;
        for chunk in &parsed.chunks {
            for replica in &chunk.replicas {
                let client = self.client(&replica.server).await?;
                let key = SignKeyPair::from_private(replica.key);
                match client
                    .request(Some(&key), Some(replica.replica_id), &Command::FDel)
                    .await?
                {
                    Response::Ok | Response::Err(_) => {}
                    _ => return Err(FileError::BadPlan),
                }
            }
        }
        Ok(())
    }
}

fn decode64<const N: usize>(text: &str) -> Option<[u8; N]> {
    B64.decode(text).ok()?.try_into().ok()
}
