//! Device identity and role negotiation
//!
//! Every installation derives one stable device ID. Two peers that discover
//! each other feed both IDs into [`negotiate_role`] and, without exchanging
//! anything else, agree on who listens and who dials.
//!
//! # Negotiation
//!
//! ```text
//! hash(local) > hash(remote)  →  Responder  (opens the listening endpoint)
//! hash(local) < hash(remote)  →  Initiator  (sends HANDSHAKE, dials PORT)
//! hash(local) == hash(remote) →  lexicographic compare of the raw IDs
//! local == remote             →  Undecided  (self-connection, reject)
//! ```
//!
//! The hash is 32-bit FNV-1a over the UTF-8 bytes of the ID. It must be the
//! same on every implementation that speaks this protocol, so it is pinned
//! here rather than borrowed from any standard library hasher.

use std::fs;
use std::io;
use std::path::Path;

use ring::digest;

/// FNV-1a 32-bit offset basis
const FNV_OFFSET_BASIS: u32 = 0x811c_9dc5;

/// FNV-1a 32-bit prime
const FNV_PRIME: u32 = 0x0100_0193;

/// Length of the display form of a device ID
pub const SHORT_ID_LEN: usize = 8;

/// Role this device takes for one peer link
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    /// Dials the peer after learning its port
    Initiator,
    /// Opens a listening endpoint and announces its port
    Responder,
    /// Both identities are equal
    Undecided,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Initiator => write!(f, "initiator"),
            Role::Responder => write!(f, "responder"),
            Role::Undecided => write!(f, "undecided"),
        }
    }
}

/// Stable per-installation device identity
pub struct DeviceIdentity;

impl DeviceIdentity {
    /// Derive a device ID from durable local attributes
    ///
    /// Attributes are joined with `:` and hashed with SHA-256; the result is
    /// lowercase hex (64 chars).
    pub fn derive(attributes: &[&str]) -> String {
        let combined = attributes.join(":");
        let hash = digest::digest(&digest::SHA256, combined.as_bytes());
        to_hex(hash.as_ref())
    }

    /// Derive a device ID from this host's machine ID, host name, OS and arch
    pub fn from_host() -> String {
        let machine_id = fs::read_to_string("/etc/machine-id")
            .map(|s| s.trim().to_string())
            .unwrap_or_else(|_| "unknown".to_string());
        let host = std::env::var("HOSTNAME")
            .ok()
            .or_else(|| {
                fs::read_to_string("/etc/hostname")
                    .ok()
                    .map(|s| s.trim().to_string())
            })
            .unwrap_or_else(|| "localhost".to_string());

        let id = Self::derive(&[
            &machine_id,
            &host,
            std::env::consts::OS,
            std::env::consts::ARCH,
        ]);
        log::debug!("Generated device ID: {}...", short_id(&id));
        id
    }

    /// Load the persisted device ID, deriving and persisting it on first use
    pub fn load_or_create(path: &Path) -> io::Result<String> {
        if let Ok(existing) = fs::read_to_string(path) {
            let existing = existing.trim();
            if is_valid_device_id(existing) {
                return Ok(existing.to_string());
            }
            log::warn!("Ignoring malformed device ID file {}", path.display());
        }

        let id = Self::from_host();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        fs::write(path, &id)?;
        log::info!("Persisted new device ID {} to {}", short_id(&id), path.display());
        Ok(id)
    }
}

/// 32-bit FNV-1a hash of an identity string
pub fn identity_hash(id: &str) -> u32 {
    id.as_bytes().iter().fold(FNV_OFFSET_BASIS, |hash, byte| {
        (hash ^ u32::from(*byte)).wrapping_mul(FNV_PRIME)
    })
}

/// Decide this device's role towards `remote_id`
///
/// Symmetric: `negotiate_role(a, b)` and `negotiate_role(b, a)` are always
/// complementary for `a != b`.
pub fn negotiate_role(local_id: &str, remote_id: &str) -> Role {
    role_from_hashes(
        identity_hash(local_id),
        identity_hash(remote_id),
        local_id,
        remote_id,
    )
}

fn role_from_hashes(local_hash: u32, remote_hash: u32, local_id: &str, remote_id: &str) -> Role {
    if local_id == remote_id {
        return Role::Undecided;
    }

    match local_hash.cmp(&remote_hash) {
        std::cmp::Ordering::Greater => Role::Responder,
        std::cmp::Ordering::Less => Role::Initiator,
        std::cmp::Ordering::Equal => {
            log::debug!(
                "Hash collision between {} and {}, using lexicographic tie-break",
                short_id(local_id),
                short_id(remote_id)
            );
            if local_id > remote_id {
                Role::Responder
            } else {
                Role::Initiator
            }
        }
    }
}

/// Display form of a device ID (first 8 characters)
pub fn short_id(id: &str) -> &str {
    match id.char_indices().nth(SHORT_ID_LEN) {
        Some((idx, _)) => &id[..idx],
        None => id,
    }
}

/// Check that a device ID is usable on the wire
pub fn is_valid_device_id(id: &str) -> bool {
    !id.is_empty() && !id.chars().any(|c| c.is_whitespace() || c.is_control())
}

fn to_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}
