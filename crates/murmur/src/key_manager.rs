//! Cluster-wide encryption key management.
//!
//! The transport encrypts gossip with a symmetric [`Keyring`]: one
//! primary key encrypts outbound traffic, every installed key may
//! decrypt inbound. Rotation is a three-step dance run through internal
//! queries so the cluster never partitions on key mismatch:
//!
//! 1. `install_key(new)` everywhere (nodes can now decrypt it),
//! 2. `use_key(new)` everywhere (nodes start encrypting with it),
//! 3. `remove_key(old)` everywhere.
//!
//! Each responder applies the mutation, persists its keyring file when
//! one is configured, and reports success or an error message. The
//! manager aggregates the per-node outcomes.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use murmur_types::MemberStatus;
use murmur_wire::{KeyRequestMessage, MessageType, decode_body, peek_type};
use tracing::warn;

use crate::internal_query::internal_query_name;
use crate::query::QueryParams;
use crate::{Error, Murmur, Result};

// ============================================================================
// Keyring
// ============================================================================

/// Errors from keyring mutations.
#[derive(Debug, thiserror::Error)]
pub enum KeyringError {
    /// Keys must be 16, 24, or 32 bytes (AES-128/192/256).
    #[error("key length {0} is invalid, expected 16, 24, or 32 bytes")]
    InvalidLength(usize),

    /// The referenced key is not installed.
    #[error("key is not installed")]
    NotFound,

    /// The primary key cannot be removed; switch first.
    #[error("removing the primary key is not allowed")]
    RemovePrimary,

    /// A keyring needs at least one key.
    #[error("keyring must hold at least one key")]
    Empty,
}

/// An ordered set of symmetric keys; the first is primary.
#[derive(Debug)]
pub struct Keyring {
    /// `keys[0]` encrypts outbound traffic; all entries may decrypt.
    keys: Mutex<Vec<Vec<u8>>>,
}

impl Keyring {
    /// Creates a keyring with `primary` first, followed by any extra
    /// decrypt-only keys.
    pub fn new(primary: Vec<u8>, extra: Vec<Vec<u8>>) -> std::result::Result<Self, KeyringError> {
        Self::validate(&primary)?;
        let mut keys = vec![primary];
        for key in extra {
            Self::validate(&key)?;
            if !keys.contains(&key) {
                keys.push(key);
            }
        }
        Ok(Self {
            keys: Mutex::new(keys),
        })
    }

    fn validate(key: &[u8]) -> std::result::Result<(), KeyringError> {
        match key.len() {
            16 | 24 | 32 => Ok(()),
            other => Err(KeyringError::InvalidLength(other)),
        }
    }

    /// Adds a key without making it primary. Installing an existing key
    /// is a no-op.
    pub fn install(&self, key: &[u8]) -> std::result::Result<(), KeyringError> {
        Self::validate(key)?;
        let mut keys = self.keys.lock().expect("keyring lock poisoned");
        if !keys.iter().any(|k| k == key) {
            keys.push(key.to_vec());
        }
        Ok(())
    }

    /// Makes an installed key primary.
    pub fn use_key(&self, key: &[u8]) -> std::result::Result<(), KeyringError> {
        let mut keys = self.keys.lock().expect("keyring lock poisoned");
        let pos = keys
            .iter()
            .position(|k| k == key)
            .ok_or(KeyringError::NotFound)?;
        let key = keys.remove(pos);
        keys.insert(0, key);
        Ok(())
    }

    /// Removes a non-primary key.
    pub fn remove(&self, key: &[u8]) -> std::result::Result<(), KeyringError> {
        let mut keys = self.keys.lock().expect("keyring lock poisoned");
        let pos = keys
            .iter()
            .position(|k| k == key)
            .ok_or(KeyringError::NotFound)?;
        if pos == 0 {
            return Err(KeyringError::RemovePrimary);
        }
        keys.remove(pos);
        Ok(())
    }

    /// The current primary key.
    pub fn primary(&self) -> Vec<u8> {
        self.keys.lock().expect("keyring lock poisoned")[0].clone()
    }

    /// All installed keys, primary first.
    pub fn keys(&self) -> Vec<Vec<u8>> {
        self.keys.lock().expect("keyring lock poisoned").clone()
    }

    /// All installed keys, base64-encoded, primary first.
    pub fn keys_base64(&self) -> Vec<String> {
        self.keys()
            .iter()
            .map(|k| BASE64.encode(k))
            .collect()
    }

    /// Persists the keyring as a JSON list of base64 keys, written to a
    /// sibling temp file and renamed into place.
    pub fn save(&self, path: &Path) -> std::io::Result<()> {
        let encoded = self.keys_base64();
        let json = serde_json::to_string_pretty(&encoded).map_err(std::io::Error::other)?;

        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }

    /// Loads a keyring persisted by [`save`](Keyring::save); the first
    /// listed key is primary.
    pub fn load(path: &Path) -> std::io::Result<Self> {
        let json = std::fs::read_to_string(path)?;
        let encoded: Vec<String> = serde_json::from_str(&json).map_err(std::io::Error::other)?;

        let mut keys = Vec::with_capacity(encoded.len());
        for entry in &encoded {
            let key = BASE64
                .decode(entry)
                .map_err(|e| std::io::Error::other(format!("bad key in keyring file: {e}")))?;
            keys.push(key);
        }
        let mut iter = keys.into_iter();
        let primary = iter
            .next()
            .ok_or_else(|| std::io::Error::other(KeyringError::Empty))?;
        Keyring::new(primary, iter.collect()).map_err(std::io::Error::other)
    }
}

// ============================================================================
// Manager
// ============================================================================

/// Aggregated outcome of a cluster-wide key operation.
#[derive(Debug, Clone, Default)]
pub struct KeyResponse {
    /// Failure message per node that reported an error.
    pub messages: HashMap<String, String>,

    /// Cluster members the query could have reached.
    pub num_nodes: usize,

    /// Nodes that responded at all.
    pub num_resp: usize,

    /// Nodes that responded with an error.
    pub num_err: usize,

    /// For `list_keys`: installed key (base64) to how many nodes hold
    /// it.
    pub keys: HashMap<String, usize>,
}

/// Runs cluster-wide key operations over internal queries.
#[derive(Debug, Clone)]
pub struct KeyManager {
    murmur: Murmur,
}

impl KeyManager {
    pub(crate) fn new(murmur: Murmur) -> Self {
        Self { murmur }
    }

    /// Installs a base64-encoded key cluster-wide (decrypt-only until
    /// [`use_key`](KeyManager::use_key)).
    pub async fn install_key(&self, key: &str) -> Result<KeyResponse> {
        self.key_request("install-key", Some(key)).await
    }

    /// Makes an installed key the primary everywhere.
    pub async fn use_key(&self, key: &str) -> Result<KeyResponse> {
        self.key_request("use-key", Some(key)).await
    }

    /// Removes a non-primary key everywhere.
    pub async fn remove_key(&self, key: &str) -> Result<KeyResponse> {
        self.key_request("remove-key", Some(key)).await
    }

    /// Collects the installed keys of every node.
    pub async fn list_keys(&self) -> Result<KeyResponse> {
        self.key_request("list-keys", None).await
    }

    async fn key_request(&self, op: &str, key: Option<&str>) -> Result<KeyResponse> {
        let payload = match key {
            Some(encoded) => {
                let key = BASE64
                    .decode(encoded)
                    .map_err(|e| Error::InvalidKey(e.to_string()))?;
                postcard::to_allocvec(&KeyRequestMessage { key })
                    .map_err(|e| Error::InvalidKey(e.to_string()))?
            }
            None => Vec::new(),
        };

        let num_nodes = self
            .murmur
            .members()
            .into_iter()
            .filter(|m| m.status == MemberStatus::Alive)
            .count();

        let mut handle = self
            .murmur
            .query(&internal_query_name(op), &payload, QueryParams::default())
            .await?;

        let mut response = KeyResponse {
            num_nodes,
            ..KeyResponse::default()
        };

        while let Some(node_resp) = handle.next_response().await {
            let decoded = match peek_type(&node_resp.payload) {
                Ok((MessageType::KeyResponse, body)) => {
                    decode_body::<murmur_wire::KeyResponseMessage>(body)
                }
                _ => {
                    warn!(from = %node_resp.from, "bad key response framing");
                    continue;
                }
            };
            let decoded = match decoded {
                Ok(msg) => msg,
                Err(e) => {
                    warn!(from = %node_resp.from, error = %e, "bad key response");
                    continue;
                }
            };

            response.num_resp += 1;
            if !decoded.result {
                response.num_err += 1;
                response
                    .messages
                    .insert(node_resp.from.clone(), decoded.message);
            }
            for key in decoded.keys {
                *response.keys.entry(key).or_insert(0) += 1;
            }
        }

        if response.num_err > 0 {
            return Err(Error::KeyOperation {
                failures: response.num_err,
                responses: response.num_resp,
                response: Box::new(response),
            });
        }
        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(byte: u8) -> Vec<u8> {
        vec![byte; 32]
    }

    #[test]
    fn new_keyring_puts_primary_first() {
        let ring = Keyring::new(key(1), vec![key(2)]).unwrap();
        assert_eq!(ring.primary(), key(1));
        assert_eq!(ring.keys().len(), 2);
    }

    #[test]
    fn invalid_key_length_rejected() {
        assert!(matches!(
            Keyring::new(vec![0; 5], Vec::new()),
            Err(KeyringError::InvalidLength(5))
        ));
    }

    #[test]
    fn install_then_use_switches_primary() {
        let ring = Keyring::new(key(1), Vec::new()).unwrap();
        ring.install(&key(2)).unwrap();
        assert_eq!(ring.primary(), key(1));

        ring.use_key(&key(2)).unwrap();
        assert_eq!(ring.primary(), key(2));
        assert_eq!(ring.keys().len(), 2);
    }

    #[test]
    fn install_is_idempotent() {
        let ring = Keyring::new(key(1), Vec::new()).unwrap();
        ring.install(&key(2)).unwrap();
        ring.install(&key(2)).unwrap();
        assert_eq!(ring.keys().len(), 2);
    }

    #[test]
    fn remove_primary_refused() {
        let ring = Keyring::new(key(1), vec![key(2)]).unwrap();
        assert!(matches!(
            ring.remove(&key(1)),
            Err(KeyringError::RemovePrimary)
        ));

        // After switching, the old primary is removable.
        ring.use_key(&key(2)).unwrap();
        ring.remove(&key(1)).unwrap();
        assert_eq!(ring.keys(), vec![key(2)]);
    }

    #[test]
    fn remove_unknown_key_errors() {
        let ring = Keyring::new(key(1), Vec::new()).unwrap();
        assert!(matches!(ring.remove(&key(9)), Err(KeyringError::NotFound)));
    }

    #[test]
    fn save_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keyring.json");

        let ring = Keyring::new(key(1), vec![key(2)]).unwrap();
        ring.save(&path).unwrap();

        let loaded = Keyring::load(&path).unwrap();
        assert_eq!(loaded.primary(), key(1));
        assert_eq!(loaded.keys(), ring.keys());
    }
}
