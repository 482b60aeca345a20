//! File descriptions — the serialized recipe for reassembling a file.
//!
//! A description is a small YAML document:
//!
//! ```yaml
//! party: recipient
//! size: 17826832
//! digest: <base64 sha512>
//! key: <base64>
//! nonce: <base64>
//! chunkSize: 8388608
//! replicas:
//!   - server: "quill://fp@host:5223"
//!     chunks: ["1:rid:rkey:digest:8388608", "2:rid:rkey:digest"]
//! redirect: { size: 1234, digest: <base64> }   # optional
//! ```
//!
//! Chunk entries are `<n>:<replica_id>:<replica_key>[:<digest>][:<size>]`,
//! all base64 except the numbers. Parsing validates that chunk numbers
//! form `1..N` and that replicas of the same chunk agree on the digest.
//! The optional redirect header points at a second descriptor uploaded as
//! a small file; recipients follow exactly one level.

use std::collections::BTreeMap;

use base64::Engine;
use serde::{Deserialize, Serialize};

use quill_core::addr::RelayAddr;
use quill_core::ids::EntityId;

const B64: base64::engine::GeneralPurpose = base64::engine::general_purpose::STANDARD_NO_PAD;

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum DescriptionError {
    #[error("descriptor YAML is malformed: {0}")]
    Yaml(String),

    #[error("descriptor field is malformed: {0}")]
    Field(&'static str),

    #[error("chunk numbers do not form 1..N")]
    ChunkNumbers,

    #[error("replicas of chunk {0} disagree on the digest")]
    DigestConflict(u64),

    #[error("descriptor URI is malformed")]
    Uri,
}

// ── Wire shape ────────────────────────────────────────────────────────────────

/// Which party's keys this description carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileParty {
    Sender,
    Recipient,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedirectInfo {
    pub size: u64,
    pub digest: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ServerChunks {
    server: String,
    chunks: Vec<String>,
}

/// The YAML document as serialized.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileDescription {
    pub party: FileParty,
    pub size: u64,
    pub digest: String,
    pub key: String,
    pub nonce: String,
    #[serde(rename = "chunkSize")]
    pub chunk_size: u64,
    replicas: Vec<ServerChunks>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub redirect: Option<RedirectInfo>,
}

// ── Parsed shape ──────────────────────────────────────────────────────────────

/// One replica of one chunk: where it lives and the key that signs for it.
#[derive(Debug, Clone)]
pub struct Replica {
    pub server: RelayAddr,
    pub replica_id: EntityId,
    /// Ed25519 private key authorized for this replica.
    pub key: [u8; 32],
}

/// One chunk with its replicas in descriptor order (primary first).
#[derive(Debug, Clone)]
pub struct ChunkSpec {
    pub chunk_no: u64,
    pub digest: Option<[u8; 64]>,
    pub size: Option<u64>,
    pub replicas: Vec<Replica>,
}

/// A validated description ready for the transfer pipelines.
#[derive(Debug, Clone)]
pub struct ParsedDescription {
    pub party: FileParty,
    pub size: u64,
    pub digest: [u8; 64],
    pub key: [u8; 32],
    pub nonce: [u8; 12],
    pub chunk_size: u64,
    pub chunks: Vec<ChunkSpec>,
    pub redirect: Option<(u64, [u8; 64])>,
}

impl FileDescription {
    /// Build the YAML shape from parsed chunks, grouping replicas by
    /// server and keeping insertion order within each chunk.
    pub fn build(
        party: FileParty,
        size: u64,
        digest: &[u8; 64],
        key: &[u8; 32],
        nonce: &[u8; 12],
        chunk_size: u64,
        chunks: &[ChunkSpec],
        redirect: Option<RedirectInfo>,
    ) -> Self {
        let mut by_server: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for chunk in chunks {
            for replica in &chunk.replicas {
                let mut entry = format!(
                    "{}:{}:{}",
                    chunk.chunk_no,
                    replica.replica_id.to_base64(),
                    B64.encode(replica.key),
                );
                if let Some(digest) = &chunk.digest {
                    entry.push(':');
                    entry.push_str(&B64.encode(digest));
                    if let Some(size) = chunk.size {
                        entry.push(':');
                        entry.push_str(&size.to_string());
                    }
                }
                by_server
                    .entry(replica.server.to_string())
                    .or_default()
                    .push(entry);
            }
        }
        Self {
            party,
            size,
            digest: B64.encode(digest),
            key: B64.encode(key),
            nonce: B64.encode(nonce),
            chunk_size,
            replicas: by_server
                .into_iter()
                .map(|(server, chunks)| ServerChunks { server, chunks })
                .collect(),
            redirect,
        }
    }

    pub fn to_yaml(&self) -> String {
        serde_yaml::to_string(self).expect("description serialization is infallible")
    }

    pub fn from_yaml(text: &str) -> Result<Self, DescriptionError> {
        serde_yaml::from_str(text).map_err(|e| DescriptionError::Yaml(e.to_string()))
    }

    /// Validate and resolve into the parsed form.
    pub fn parse(&self) -> Result<ParsedDescription, DescriptionError> {
        let digest = decode64(&self.digest).ok_or(DescriptionError::Field("digest"))?;
        let key: [u8; 32] = decode64(&self.key).ok_or(DescriptionError::Field("key"))?;
        let nonce: [u8; 12] = decode64(&self.nonce).ok_or(DescriptionError::Field("nonce"))?;

        let mut chunks: BTreeMap<u64, ChunkSpec> = BTreeMap::new();
        for group in &self.replicas {
            let server: RelayAddr = group
                .server
                .parse()
                .map_err(|_| DescriptionError::Field("server"))?;
            for entry in &group.chunks {
                let (chunk_no, replica, digest, size) = parse_chunk_entry(entry, &server)?;
                let slot = chunks.entry(chunk_no).or_insert_with(|| ChunkSpec {
                    chunk_no,
                    digest,
                    size,
                    replicas: Vec::new(),
                });
                match (&slot.digest, &digest) {
                    (Some(a), Some(b)) if a != b => {
                        return Err(DescriptionError::DigestConflict(chunk_no))
                    }
                    (None, Some(_)) => slot.digest = digest,
                    _ => {}
                }
                if slot.size.is_none() {
                    slot.size = size;
                }
                slot.replicas.push(replica);
            }
        }

        // Chunk numbers must form exactly 1..N.
        let ordered: Vec<ChunkSpec> = chunks.into_values().collect();
        for (i, chunk) in ordered.iter().enumerate() {
            if chunk.chunk_no != i as u64 + 1 {
                return Err(DescriptionError::ChunkNumbers);
            }
        }
        if ordered.is_empty() {
            return Err(DescriptionError::ChunkNumbers);
        }

        let redirect = match &self.redirect {
            Some(r) => Some((
                r.size,
                decode64::<64>(&r.digest).ok_or(DescriptionError::Field("redirect digest"))?,
            )),
            None => None,
        };

        Ok(ParsedDescription {
            party: self.party,
            size: self.size,
            digest,
            key,
            nonce,
            chunk_size: self.chunk_size,
            chunks: ordered,
            redirect,
        })
    }

    // ── URI form ──────────────────────────────────────────────────────────

    /// `qftp://<base64 yaml>` — the out-of-band form of a descriptor.
    pub fn to_uri(&self) -> String {
        format!("qftp://{}", B64.encode(self.to_yaml().as_bytes()))
    }

    pub fn from_uri(uri: &str) -> Result<Self, DescriptionError> {
        let encoded = uri.strip_prefix("qftp://").ok_or(DescriptionError::Uri)?;
        let bytes = B64.decode(encoded).map_err(|_| DescriptionError::Uri)?;
        let text = String::from_utf8(bytes).map_err(|_| DescriptionError::Uri)?;
        Self::from_yaml(&text)
    }
}

fn decode64<const N: usize>(text: &str) -> Option<[u8; N]> {
    B64.decode(text).ok()?.try_into().ok()
}

/// `<n>:<replica_id>:<key>[:<digest>][:<size>]`
fn parse_chunk_entry(
    entry: &str,
    server: &RelayAddr,
) -> Result<(u64, Replica, Option<[u8; 64]>, Option<u64>), DescriptionError> {
    let mut parts = entry.split(':');
    let chunk_no: u64 = parts
        .next()
        .and_then(|s| s.parse().ok())
        .ok_or(DescriptionError::Field("chunk number"))?;
    let replica_id = parts
        .next()
        .and_then(EntityId::from_base64)
        .ok_or(DescriptionError::Field("replica id"))?;
    let key: [u8; 32] = parts
        .next()
        .and_then(decode64)
        .ok_or(DescriptionError::Field("replica key"))?;
    let digest = match parts.next() {
        Some(text) => Some(decode64::<64>(text).ok_or(DescriptionError::Field("chunk digest"))?),
        None => None,
    };
    let size = match parts.next() {
        Some(text) => Some(
            text.parse()
                .map_err(|_| DescriptionError::Field("chunk size"))?,
        ),
        None => None,
    };
    if parts.next().is_some() {
        return Err(DescriptionError::Field("trailing chunk fields"));
    }
    Ok((
        chunk_no,
        Replica {
            server: server.clone(),
            replica_id,
            key,
        },
        digest,
        size,
    ))
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(host: &str) -> RelayAddr {
        RelayAddr::new(host, 5223, [0x11; 32])
    }

    fn chunk(no: u64, server: &RelayAddr) -> ChunkSpec {
        ChunkSpec {
            chunk_no: no,
            digest: Some([no as u8; 64]),
            size: Some(1024 * no),
            replicas: vec![Replica {
                server: server.clone(),
                replica_id: EntityId::random(),
                key: [no as u8; 32],
            }],
        }
    }

    fn build(chunks: &[ChunkSpec]) -> FileDescription {
        FileDescription::build(
            FileParty::Recipient,
            4096,
            &[9u8; 64],
            &[1u8; 32],
            &[2u8; 12],
            1024,
            chunks,
            None,
        )
    }

    #[test]
    fn yaml_round_trip() {
        let server = addr("relay.example.org");
        let desc = build(&[chunk(1, &server), chunk(2, &server)]);
        let yaml = desc.to_yaml();
        assert!(yaml.contains("chunkSize"));

        let back = FileDescription::from_yaml(&yaml).unwrap();
        let parsed = back.parse().unwrap();
        assert_eq!(parsed.size, 4096);
        assert_eq!(parsed.chunks.len(), 2);
        assert_eq!(parsed.chunks[0].chunk_no, 1);
        assert_eq!(parsed.chunks[1].size, Some(2048));
        assert_eq!(parsed.chunks[0].replicas[0].server, server);
    }

    #[test]
    fn uri_round_trip() {
        let server = addr("relay.example.org");
        let desc = build(&[chunk(1, &server)]);
        let uri = desc.to_uri();
        assert!(uri.starts_with("qftp://"));
        let back = FileDescription::from_uri(&uri).unwrap();
        assert_eq!(back.size, desc.size);
    }

    #[test]
    fn non_sequential_chunks_rejected() {
        let server = addr("relay.example.org");
        let desc = build(&[chunk(1, &server), chunk(3, &server)]);
        assert!(matches!(
            desc.parse(),
            Err(DescriptionError::ChunkNumbers)
        ));
    }

    #[test]
    fn digest_conflict_rejected() {
        // Two replicas of chunk 1 claiming different digests.
        let conflict = FileDescription::from_yaml(&format!(
            "party: recipient\nsize: 10\ndigest: {d}\nkey: {k}\nnonce: {n}\nchunkSize: 10\nreplicas:\n- server: \"{s}\"\n  chunks: [\"1:{r1}:{k1}:{d1}\", \"1:{r2}:{k2}:{d2}\"]\n",
            d = B64.encode([9u8; 64]),
            k = B64.encode([1u8; 32]),
            n = B64.encode([2u8; 12]),
            s = addr("relay.example.org"),
            r1 = EntityId::random().to_base64(),
            k1 = B64.encode([1u8; 32]),
            d1 = B64.encode([3u8; 64]),
            r2 = EntityId::random().to_base64(),
            k2 = B64.encode([2u8; 32]),
            d2 = B64.encode([4u8; 64]),
        ))
        .unwrap();
        assert!(matches!(
            conflict.parse(),
            Err(DescriptionError::DigestConflict(1))
        ));
    }

    #[test]
    fn replicas_across_servers_merge_per_chunk() {
        let s1 = addr("one.example.org");
        let s2 = addr("two.example.org");
        let mut c1 = chunk(1, &s1);
        c1.replicas.push(Replica {
            server: s2.clone(),
            replica_id: EntityId::random(),
            key: [7u8; 32],
        });
        let desc = build(std::slice::from_ref(&c1));
        let parsed = desc.parse().unwrap();
        assert_eq!(parsed.chunks[0].replicas.len(), 2);
        let servers: Vec<String> = parsed.chunks[0]
            .replicas
            .iter()
            .map(|r| r.server.host.clone())
            .collect();
        assert!(servers.contains(&"one.example.org".to_string()));
        assert!(servers.contains(&"two.example.org".to_string()));
    }

    #[test]
    fn redirect_round_trip() {
        let server = addr("relay.example.org");
        let desc = FileDescription::build(
            FileParty::Recipient,
            512,
            &[9u8; 64],
            &[1u8; 32],
            &[2u8; 12],
            512,
            &[chunk(1, &server)],
            Some(RedirectInfo {
                size: 9000,
                digest: B64.encode([0xAB; 64]),
            }),
        );
        let parsed = FileDescription::from_yaml(&desc.to_yaml())
            .unwrap()
            .parse()
            .unwrap();
        assert_eq!(parsed.redirect, Some((9000, [0xAB; 64])));
    }
}
