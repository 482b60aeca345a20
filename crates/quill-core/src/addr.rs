//! Relay addresses and out-of-band connection invitations.
//!
//! A relay address pins the server's transport key fingerprint next to its
//! network location, so the first connection already authenticates the
//! server. An invitation extends the address with the queue sender id and
//! an ephemeral DH key — everything a joiner needs, nothing a relay could
//! use to link the two parties.

use base64::Engine;

use crate::crypto::DhPublic;
use crate::ids::EntityId;
use crate::wire::{VERSION_MAX, VERSION_MIN};

const B64: base64::engine::GeneralPurpose = base64::engine::general_purpose::URL_SAFE_NO_PAD;

/// A relay's location plus its pinned transport key fingerprint.
///
/// Rendered as `quill://<base64 fingerprint>@<host>:<port>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RelayAddr {
    pub host: String,
    pub port: u16,
    /// BLAKE3 of the relay's static transport public key.
    pub key_hash: [u8; 32],
}

impl RelayAddr {
    pub fn new(host: impl Into<String>, port: u16, key_hash: [u8; 32]) -> Self {
        Self {
            host: host.into(),
            port,
            key_hash,
        }
    }

    pub fn socket_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl std::fmt::Display for RelayAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "quill://{}@{}:{}",
            B64.encode(self.key_hash),
            self.host,
            self.port
        )
    }
}

impl std::str::FromStr for RelayAddr {
    type Err = AddrError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let rest = s.strip_prefix("quill://").ok_or(AddrError::Scheme)?;
        let (fingerprint, location) = rest.split_once('@').ok_or(AddrError::Malformed)?;
        let key_hash: [u8; 32] = B64
            .decode(fingerprint)
            .ok()
            .and_then(|b| b.try_into().ok())
            .ok_or(AddrError::Fingerprint)?;
        let (host, port) = location.rsplit_once(':').ok_or(AddrError::Malformed)?;
        let port: u16 = port.parse().map_err(|_| AddrError::Malformed)?;
        if host.is_empty() {
            return Err(AddrError::Malformed);
        }
        Ok(Self {
            host: host.to_string(),
            port,
            key_hash,
        })
    }
}

// ── Invitation ────────────────────────────────────────────────────────────────

/// Out-of-band invitation to join a connection.
///
/// Rendered as
/// `quill://<fp>@<host>:<port>/<base64 sender_id>?v=<min>-<max>#<base64 dh>`.
/// The sender id addresses the inviter's receive queue; the DH key seeds
/// the key agreement; the version range guards against downgrade.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invitation {
    pub relay: RelayAddr,
    pub sender_id: EntityId,
    pub dh_key: DhPublic,
    pub v_min: u16,
    pub v_max: u16,
}

impl Invitation {
    pub fn new(relay: RelayAddr, sender_id: EntityId, dh_key: DhPublic) -> Self {
        Self {
            relay,
            sender_id,
            dh_key,
            v_min: VERSION_MIN,
            v_max: VERSION_MAX,
        }
    }
}

impl std::fmt::Display for Invitation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}/{}?v={}-{}#{}",
            self.relay,
            self.sender_id.to_base64(),
            self.v_min,
            self.v_max,
            B64.encode(self.dh_key.as_bytes()),
        )
    }
}

impl std::str::FromStr for Invitation {
    type Err = AddrError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (rest, fragment) = s.split_once('#').ok_or(AddrError::Malformed)?;
        let dh_bytes = B64.decode(fragment).map_err(|_| AddrError::Malformed)?;
        let dh_key = DhPublic::from_slice(&dh_bytes).ok_or(AddrError::Malformed)?;

        let (rest, query) = rest.split_once('?').ok_or(AddrError::Malformed)?;
        let versions = query.strip_prefix("v=").ok_or(AddrError::Malformed)?;
        let (v_min, v_max) = versions.split_once('-').ok_or(AddrError::Malformed)?;
        let v_min: u16 = v_min.parse().map_err(|_| AddrError::Malformed)?;
        let v_max: u16 = v_max.parse().map_err(|_| AddrError::Malformed)?;
        if v_min > v_max {
            return Err(AddrError::Malformed);
        }

        let (addr, sender) = rest.rsplit_once('/').ok_or(AddrError::Malformed)?;
        let relay: RelayAddr = addr.parse()?;
        let sender_id = EntityId::from_base64(sender).ok_or(AddrError::Malformed)?;

        Ok(Self {
            relay,
            sender_id,
            dh_key,
            v_min,
            v_max,
        })
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum AddrError {
    #[error("URI scheme is not quill://")]
    Scheme,

    #[error("malformed address or invitation")]
    Malformed,

    #[error("fingerprint is not 32 base64 bytes")]
    Fingerprint,
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::DhKeyPair;

    fn addr() -> RelayAddr {
        RelayAddr::new("relay.example.org", 5223, [0x42; 32])
    }

    #[test]
    fn relay_addr_round_trip() {
        let a = addr();
        let parsed: RelayAddr = a.to_string().parse().unwrap();
        assert_eq!(parsed, a);
    }

    #[test]
    fn relay_addr_rejects_bad_scheme() {
        assert_eq!(
            "smtp://abc@host:1".parse::<RelayAddr>(),
            Err(AddrError::Scheme)
        );
    }

    #[test]
    fn relay_addr_supports_ipv6_hosts() {
        let a = RelayAddr::new("[::1]", 7000, [1; 32]);
        let parsed: RelayAddr = a.to_string().parse().unwrap();
        assert_eq!(parsed.host, "[::1]");
        assert_eq!(parsed.port, 7000);
    }

    #[test]
    fn invitation_round_trip() {
        let inv = Invitation::new(addr(), EntityId::random(), DhKeyPair::generate().public());
        let uri = inv.to_string();
        assert!(uri.starts_with("quill://"));
        let parsed: Invitation = uri.parse().unwrap();
        assert_eq!(parsed, inv);
    }

    #[test]
    fn invitation_rejects_inverted_versions() {
        let mut inv = Invitation::new(addr(), EntityId::random(), DhKeyPair::generate().public());
        inv.v_min = 5;
        inv.v_max = 2;
        assert!(inv.to_string().parse::<Invitation>().is_err());
    }
}
