//! Network keys, invite links and the joined-network store
//!
//! A network is identified by a shared 32-byte symmetric key plus a
//! human-readable name. Invite links carry the key, the name and a list of
//! bootstrap endpoints in a URL-safe form:
//!
//! ```text
//! omerta://join/<base64url(canonical-json)>
//! ```

use std::path::{Path, PathBuf};

use base64::engine::general_purpose::{STANDARD as BASE64, URL_SAFE_NO_PAD};
use base64::Engine;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{CoreError, CoreResult};

/// The URI scheme prefix for invite links
pub const INVITE_PREFIX: &str = "omerta://join/";

/// Size of the shared network key
pub const NETWORK_KEY_SIZE: usize = 32;

/// A joinable network: shared symmetric key, name and bootstrap endpoints
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkKey {
    /// Human-readable network name
    pub name: String,
    /// Shared 32-byte symmetric key used for the envelope cipher
    #[serde(with = "key_base64")]
    pub key: [u8; NETWORK_KEY_SIZE],
    /// Endpoint strings of well-known peers to contact first
    pub bootstrap_peers: Vec<String>,
}

impl NetworkKey {
    /// Create a network with a freshly generated key
    pub fn generate(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            key: rand::random(),
            bootstrap_peers: Vec::new(),
        }
    }

    /// Create a network from explicit parts
    pub fn new(name: impl Into<String>, key: [u8; NETWORK_KEY_SIZE]) -> Self {
        Self {
            name: name.into(),
            key,
            bootstrap_peers: Vec::new(),
        }
    }

    /// Add bootstrap endpoints
    pub fn with_bootstrap_peers(mut self, peers: Vec<String>) -> Self {
        self.bootstrap_peers = peers;
        self
    }

    /// Deterministic network identifier: hex of the first 8 bytes of
    /// BLAKE3(key || name)
    pub fn network_id(&self) -> String {
        let mut hasher = blake3::Hasher::new();
        hasher.update(&self.key);
        hasher.update(self.name.as_bytes());
        hex::encode(&hasher.finalize().as_bytes()[..8])
    }

    /// Encode this network as a shareable invite link
    pub fn encode_invite(&self) -> String {
        let payload = InvitePayload {
            bootstrap_peers: self.bootstrap_peers.clone(),
            network_key: BASE64.encode(self.key),
            network_name: self.name.clone(),
        };
        // serde_json's default map is ordered, so this is canonical.
        let json = serde_json::to_vec(&payload).expect("invite serialization cannot fail");
        format!("{}{}", INVITE_PREFIX, URL_SAFE_NO_PAD.encode(json))
    }

    /// Parse an invite link back into a network key
    pub fn from_invite(invite: &str) -> CoreResult<Self> {
        let invite = invite.trim();
        let encoded = invite
            .strip_prefix(INVITE_PREFIX)
            .ok_or_else(|| CoreError::InvalidInvite(format!("unknown scheme: {:?}", invite)))?;

        let json = URL_SAFE_NO_PAD
            .decode(encoded)
            .map_err(|e| CoreError::InvalidInvite(format!("bad base64: {}", e)))?;

        let payload: InvitePayload = serde_json::from_slice(&json)
            .map_err(|e| CoreError::InvalidInvite(format!("bad payload: {}", e)))?;

        let key_bytes = BASE64
            .decode(&payload.network_key)
            .map_err(|e| CoreError::InvalidInvite(format!("bad network key: {}", e)))?;
        if key_bytes.len() != NETWORK_KEY_SIZE {
            return Err(CoreError::InvalidInvite(format!(
                "network key must be {} bytes, got {}",
                NETWORK_KEY_SIZE,
                key_bytes.len()
            )));
        }
        let mut key = [0u8; NETWORK_KEY_SIZE];
        key.copy_from_slice(&key_bytes);

        Ok(Self {
            name: payload.network_name,
            key,
            bootstrap_peers: payload.bootstrap_peers,
        })
    }
}

/// Wire shape of the invite payload (canonical JSON, camelCase keys)
#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct InvitePayload {
    bootstrap_peers: Vec<String>,
    network_key: String,
    network_name: String,
}

mod key_base64 {
    use super::*;
    use serde::{Deserializer, Serializer};

    pub fn serialize<S: Serializer>(key: &[u8; NETWORK_KEY_SIZE], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&BASE64.encode(key))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<[u8; NETWORK_KEY_SIZE], D::Error> {
        let text = String::deserialize(d)?;
        let bytes = BASE64.decode(&text).map_err(serde::de::Error::custom)?;
        if bytes.len() != NETWORK_KEY_SIZE {
            return Err(serde::de::Error::custom(format!(
                "expected {} key bytes, got {}",
                NETWORK_KEY_SIZE,
                bytes.len()
            )));
        }
        let mut key = [0u8; NETWORK_KEY_SIZE];
        key.copy_from_slice(&bytes);
        Ok(key)
    }
}

/// A joined network plus its activation flag
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredNetwork {
    pub network: NetworkKey,
    pub active: bool,
}

/// On-disk store of joined networks (`networks.json`)
///
/// At most one network is active at a time; the node joins the active one
/// at startup.
pub struct NetworkStore {
    path: PathBuf,
    networks: Vec<StoredNetwork>,
}

impl NetworkStore {
    /// Load the store from disk, or start empty if the file is missing
    pub fn load(path: impl Into<PathBuf>) -> CoreResult<Self> {
        let path = path.into();
        let networks = if path.exists() {
            let text = std::fs::read_to_string(&path).map_err(|e| CoreError::Io(e.to_string()))?;
            serde_json::from_str(&text).map_err(|e| CoreError::Serialization(e.to_string()))?
        } else {
            Vec::new()
        };
        debug!(path = %path.display(), count = networks.len(), "Loaded network store");
        Ok(Self { path, networks })
    }

    /// All joined networks
    pub fn networks(&self) -> &[StoredNetwork] {
        &self.networks
    }

    /// The currently active network, if any
    pub fn active_network(&self) -> Option<&NetworkKey> {
        self.networks.iter().find(|n| n.active).map(|n| &n.network)
    }

    /// Join a network. The first joined network becomes active.
    pub fn add(&mut self, network: NetworkKey) -> CoreResult<()> {
        let id = network.network_id();
        if self.networks.iter().any(|n| n.network.network_id() == id) {
            return Ok(());
        }
        let active = self.networks.is_empty();
        self.networks.push(StoredNetwork { network, active });
        self.save()
    }

    /// Mark the network with the given id active, deactivating the rest
    pub fn activate(&mut self, network_id: &str) -> CoreResult<()> {
        let mut found = false;
        for stored in &mut self.networks {
            stored.active = stored.network.network_id() == network_id;
            found |= stored.active;
        }
        if !found {
            return Err(CoreError::InvalidConfiguration(format!(
                "unknown network id: {}",
                network_id
            )));
        }
        self.save()
    }

    /// Leave a network
    pub fn remove(&mut self, network_id: &str) -> CoreResult<()> {
        self.networks.retain(|n| n.network.network_id() != network_id);
        self.save()
    }

    /// Persist the store with an atomic rewrite
    fn save(&self) -> CoreResult<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| CoreError::Io(e.to_string()))?;
        }
        let json = serde_json::to_string_pretty(&self.networks)
            .map_err(|e| CoreError::Serialization(e.to_string()))?;
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, json).map_err(|e| CoreError::Io(e.to_string()))?;
        std::fs::rename(&tmp, &self.path).map_err(|e| CoreError::Io(e.to_string()))?;
        info!(path = %self.path.display(), count = self.networks.len(), "Saved network store");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invite_roundtrip() {
        let network = NetworkKey::generate("test-net")
            .with_bootstrap_peers(vec!["203.0.113.7:4800".to_string()]);

        let invite = network.encode_invite();
        assert!(invite.starts_with(INVITE_PREFIX));

        let parsed = NetworkKey::from_invite(&invite).unwrap();
        assert_eq!(parsed, network);
        assert_eq!(parsed.network_id(), network.network_id());
    }

    #[test]
    fn test_invite_rejects_wrong_scheme() {
        assert!(NetworkKey::from_invite("https://join/abc").is_err());
        assert!(NetworkKey::from_invite("omerta://other/abc").is_err());
    }

    #[test]
    fn test_invite_rejects_garbage() {
        assert!(NetworkKey::from_invite("omerta://join/!!!not-base64!!!").is_err());

        // Valid base64 of invalid JSON
        let bad = format!("{}{}", INVITE_PREFIX, URL_SAFE_NO_PAD.encode(b"{\"x\":1"));
        assert!(NetworkKey::from_invite(&bad).is_err());

        // Missing fields
        let bad = format!("{}{}", INVITE_PREFIX, URL_SAFE_NO_PAD.encode(b"{}"));
        assert!(NetworkKey::from_invite(&bad).is_err());
    }

    #[test]
    fn test_invite_rejects_short_key() {
        let payload = serde_json::json!({
            "bootstrapPeers": [],
            "networkKey": BASE64.encode([0u8; 16]),
            "networkName": "short",
        });
        let invite = format!(
            "{}{}",
            INVITE_PREFIX,
            URL_SAFE_NO_PAD.encode(serde_json::to_vec(&payload).unwrap())
        );
        assert!(NetworkKey::from_invite(&invite).is_err());
    }

    #[test]
    fn test_network_id_depends_on_key_and_name() {
        let a = NetworkKey::new("alpha", [1u8; 32]);
        let b = NetworkKey::new("alpha", [2u8; 32]);
        let c = NetworkKey::new("beta", [1u8; 32]);
        assert_ne!(a.network_id(), b.network_id());
        assert_ne!(a.network_id(), c.network_id());
        assert_eq!(a.network_id(), NetworkKey::new("alpha", [1u8; 32]).network_id());
        assert_eq!(a.network_id().len(), 16);
    }

    #[test]
    fn test_network_store_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("networks.json");

        let mut store = NetworkStore::load(&path).unwrap();
        let first = NetworkKey::generate("first");
        let second = NetworkKey::generate("second");
        store.add(first.clone()).unwrap();
        store.add(second.clone()).unwrap();

        // First joined network is active
        assert_eq!(store.active_network().unwrap().name, "first");

        store.activate(&second.network_id()).unwrap();

        let reloaded = NetworkStore::load(&path).unwrap();
        assert_eq!(reloaded.networks().len(), 2);
        assert_eq!(reloaded.active_network().unwrap().name, "second");
    }
}
