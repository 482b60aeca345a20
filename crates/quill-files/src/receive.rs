//! The download pipeline: fetch, verify, reassemble, decrypt, acknowledge.
//!
//! Chunks are fetched in order into a temp prefix owned exclusively by
//! this operation. Every chunk is verified against the description before
//! it counts; the assembled stream is verified as a whole before the
//! streaming decrypt touches the destination; replicas are acknowledged
//! only after the file is complete, so an interrupted download can retry
//! from any replica. A permanent error removes the temp prefix and
//! surfaces; transient errors rotate replicas.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use quill_core::command::{Command, ErrorCode, Response};
use quill_core::crypto::{DhKeyPair, SignKeyPair, Sha512Stream};
use quill_core::ids::EntityId;

use crate::chunks::decrypt_file;
use crate::description::{ChunkSpec, FileDescription, ParsedDescription, Replica};
use crate::{broker_error_kind, FileError, FileEvent, FileTransfer};

/// Rotations through a chunk's replica list before giving up.
const MAX_REPLICA_ROUNDS: u32 = 3;

impl FileTransfer {
    /// Reassemble a file from its description into `dst`. Follows at most
    /// one redirect level, counting its bytes toward progress.
    pub async fn receive_file(
        self: &Arc<Self>,
        description: &FileDescription,
        dst: &Path,
    ) -> Result<PathBuf, FileError> {
        std::fs::create_dir_all(&self.config.temp_dir)?;
        let parsed = description.parse()?;

        let parsed = match parsed.redirect {
            None => parsed,
            Some((size, digest)) => {
                let inner = self.follow_redirect(&parsed, size, digest).await?;
                if inner.redirect.is_some() {
                    return Err(FileError::RedirectLoop);
                }
                inner
            }
        };

        let result = self.receive_parsed(&parsed, dst).await;
        match &result {
            Ok(path) => {
                self.emit(FileEvent::RfDone { path: path.clone() }).await;
            }
            Err(e) => {
                self.emit(FileEvent::RfErr {
                    reason: e.to_string(),
                })
                .await;
            }
        }
        result
    }

    /// Fetch the descriptor file a tiny redirect descriptor points at and
    /// parse the real description out of it.
    async fn follow_redirect(
        self: &Arc<Self>,
        redirect: &ParsedDescription,
        expected_size: u64,
        expected_digest: [u8; 64],
    ) -> Result<ParsedDescription, FileError> {
        let target = self.temp_path(".redirect");
        self.receive_parsed(redirect, &target).await?;

        let yaml = std::fs::read(&target)?;
        let _ = std::fs::remove_file(&target);
        if yaml.len() as u64 != expected_size {
            return Err(FileError::RedirectMismatch);
        }
        if quill_core::crypto::sha512(&yaml) != expected_digest {
            return Err(FileError::RedirectMismatch);
        }
        let text = String::from_utf8(yaml).map_err(|_| FileError::RedirectMismatch)?;
        let inner = FileDescription::from_yaml(&text)?;
        Ok(inner.parse()?)
    }

    async fn receive_parsed(
        self: &Arc<Self>,
        parsed: &ParsedDescription,
        dst: &Path,
    ) -> Result<PathBuf, FileError> {
        // The temp prefix belongs to this operation alone.
        let prefix = self.temp_path("");
        std::fs::create_dir_all(&prefix)?;

        let result = self.receive_into(parsed, dst, &prefix).await;
        // Success or failure, the prefix goes away; on success it only
        // held intermediate artifacts, on failure nothing valid remains.
        let _ = std::fs::remove_dir_all(&prefix);
        result
    }

    async fn receive_into(
        self: &Arc<Self>,
        parsed: &ParsedDescription,
        dst: &Path,
        prefix: &Path,
    ) -> Result<PathBuf, FileError> {
        let stream_path = prefix.join("stream.enc");
        let mut stream = std::fs::File::create(&stream_path)?;
        let mut digest = Sha512Stream::new();
        let mut received = 0u64;
        let total = parsed.size;
        let mut fetched: Vec<(EntityId, Replica)> = Vec::with_capacity(parsed.chunks.len());

        for chunk in &parsed.chunks {
            let (body, replica) = self.fetch_chunk(chunk).await?;
            digest.update(&body);
            stream.write_all(&body)?;
            received += body.len() as u64;
            fetched.push((replica.replica_id, replica));
            self.emit(FileEvent::RfProg { received, total }).await;
        }
        stream.flush()?;
        drop(stream);

        if received != parsed.size {
            return Err(FileError::Size);
        }
        if digest.finalize() != parsed.digest {
            return Err(FileError::Digest);
        }

        // Streaming decrypt to the destination.
        let header = {
            let src = stream_path.clone();
            let dst = dst.to_path_buf();
            let key = parsed.key;
            let nonce = parsed.nonce;
            tokio::task::spawn_blocking(move || decrypt_file(&src, &dst, &key, &nonce))
                .await
                .expect("decrypt task panicked")?
        };
        tracing::debug!(filename = %header.filename, "file decrypted");

        // Everything verified — release the replicas.
        for (replica_id, replica) in fetched {
            let key = SignKeyPair::from_private(replica.key);
            if let Ok(client) = self.client(&replica.server).await {
                let _ = client
                    .request(Some(&key), Some(replica_id), &Command::FAck)
                    .await;
            }
        }

        Ok(dst.to_path_buf())
    }

    /// Download one chunk, rotating replicas on transient failure.
    /// AUTH and digest mismatches are permanent.
    async fn fetch_chunk(
        self: &Arc<Self>,
        chunk: &ChunkSpec,
    ) -> Result<(Vec<u8>, Replica), FileError> {
        let mut last_transient = String::from("no replica reachable");
        for round in 0..MAX_REPLICA_ROUNDS {
            for replica in &chunk.replicas {
                match self.fetch_replica(chunk, replica).await {
                    Ok(body) => return Ok((body, replica.clone())),
                    Err(e) if e.is_transient() => {
                        tracing::debug!(
                            chunk = chunk.chunk_no,
                            server = %replica.server,
                            round,
                            error = %e,
                            "replica fetch retrying"
                        );
                        last_transient = e.to_string();
                    }
                    Err(e) => return Err(e),
                }
            }
            tokio::time::sleep(std::time::Duration::from_millis(200 * (round as u64 + 1))).await;
        }
        Err(FileError::ReplicasExhausted(last_transient))
    }

    async fn fetch_replica(
        self: &Arc<Self>,
        chunk: &ChunkSpec,
        replica: &Replica,
    ) -> Result<Vec<u8>, FileError> {
        let client = self.client(&replica.server).await?;
        let key = SignKeyPair::from_private(replica.key);
        let dh = DhKeyPair::generate();

        let command = Command::FGet {
            dh_key: dh.public(),
        };
        let (srv_dh, sealed) = match client
            .request(Some(&key), Some(replica.replica_id), &command)
            .await
        {
            Ok(Response::FileData { srv_dh, body }) => (srv_dh, body),
            Ok(Response::Err(ErrorCode::Auth)) => return Err(FileError::Auth),
            Ok(Response::Err(code)) => {
                return Err(FileError::Broker(
                    quill_agent::client::BrokerError::Protocol(code),
                ))
            }
            Ok(_) => return Err(FileError::BadPlan),
            Err(e) => {
                return Err(match broker_error_kind(&e) {
                    Some(ErrorCode::Auth) => FileError::Auth,
                    _ => FileError::Broker(e),
                })
            }
        };

        // The body is sealed under a DH agreement with our fresh key.
        if sealed.len() < 12 {
            return Err(FileError::Digest);
        }
        let secret = dh.shared_secret(&srv_dh);
        let nonce: [u8; 12] = sealed[..12].try_into().expect("12-byte nonce");
        let body = quill_core::crypto::open(secret.as_bytes(), &nonce, &sealed[12..])
            .map_err(|_| FileError::Digest)?;

        // Per-chunk validation against the description.
        if let Some(size) = chunk.size {
            if body.len() as u64 != size {
                return Err(FileError::Size);
            }
        }
        if let Some(expected) = &chunk.digest {
            if quill_core::crypto::sha512(&body) != *expected {
                return Err(FileError::Digest);
            }
        }
        Ok(body)
    }
}
