//! Per-peer trust state
//!
//! A peer is trusted once its public key has been exchanged and stored.
//! Trust gates encryption: the pipeline only seals messages for peers whose
//! key is known here.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock};

use crate::crypto::PublicKey;
use crate::error::LinkError;
use crate::identity::short_id;

/// The trust/contact store consumed by the message pipeline
pub trait TrustStore: Send + Sync {
    fn peer_public_key(&self, peer_id: &str) -> Option<PublicKey>;

    fn store_peer_public_key(&self, peer_id: &str, key: PublicKey) -> Result<(), LinkError>;

    /// Forget a peer; returns whether it was known
    fn remove_peer(&self, peer_id: &str) -> Result<bool, LinkError>;

    fn trusted_peer_ids(&self) -> Vec<String>;

    fn is_trusted(&self, peer_id: &str) -> bool {
        self.peer_public_key(peer_id).is_some()
    }
}

// ============================================================================
// In-Memory Store
// ============================================================================

/// Trust store that lives only as long as the process
#[derive(Default)]
pub struct MemoryTrustStore {
    keys: RwLock<HashMap<String, PublicKey>>,
}

impl MemoryTrustStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl TrustStore for MemoryTrustStore {
    fn peer_public_key(&self, peer_id: &str) -> Option<PublicKey> {
        self.keys
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(peer_id)
            .cloned()
    }

    fn store_peer_public_key(&self, peer_id: &str, key: PublicKey) -> Result<(), LinkError> {
        self.keys
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(peer_id.to_string(), key);
        log::debug!("Stored public key for {}", short_id(peer_id));
        Ok(())
    }

    fn remove_peer(&self, peer_id: &str) -> Result<bool, LinkError> {
        Ok(self
            .keys
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(peer_id)
            .is_some())
    }

    fn trusted_peer_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .keys
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        ids.sort();
        ids
    }
}

// ============================================================================
// File-Backed Store
// ============================================================================

/// JSON file trust store, rewritten on every mutation
pub struct FileTrustStore {
    path: PathBuf,
    keys: RwLock<HashMap<String, PublicKey>>,
}

impl FileTrustStore {
    /// Open (or start) a store at `path`
    pub fn open(path: impl AsRef<Path>) -> Result<Self, LinkError> {
        let path = path.as_ref().to_path_buf();
        let keys = if path.exists() {
            let data = fs::read_to_string(&path)?;
            if data.trim().is_empty() {
                HashMap::new()
            } else {
                serde_json::from_str(&data)?
            }
        } else {
            HashMap::new()
        };

        log::info!(
            "Trust store {} loaded ({} peers)",
            path.display(),
            keys.len()
        );
        Ok(Self {
            path,
            keys: RwLock::new(keys),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn persist(&self, keys: &HashMap<String, PublicKey>) -> Result<(), LinkError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        // Write-then-rename so a crash never leaves a truncated store
        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, serde_json::to_vec_pretty(keys)?)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

impl TrustStore for FileTrustStore {
    fn peer_public_key(&self, peer_id: &str) -> Option<PublicKey> {
        self.keys
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(peer_id)
            .cloned()
    }

    fn store_peer_public_key(&self, peer_id: &str, key: PublicKey) -> Result<(), LinkError> {
        let mut keys = self.keys.write().unwrap_or_else(PoisonError::into_inner);
        keys.insert(peer_id.to_string(), key);
        self.persist(&keys)?;
        log::debug!("Stored public key for {}", short_id(peer_id));
        Ok(())
    }

    fn remove_peer(&self, peer_id: &str) -> Result<bool, LinkError> {
        let mut keys = self.keys.write().unwrap_or_else(PoisonError::into_inner);
        let removed = keys.remove(peer_id).is_some();
        if removed {
            self.persist(&keys)?;
        }
        Ok(removed)
    }

    fn trusted_peer_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .keys
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        ids.sort();
        ids
    }
}
