//! Asymmetric crypto used by the message pipeline
//!
//! The pipeline only sees the [`CryptoProvider`] trait: sign, verify,
//! public-key encrypt and private-key decrypt, plus the local identity key
//! pair. [`SealedBoxCrypto`] is the implementation shipped with the crate.
//!
//! # Sealed Box Layout
//!
//! ```text
//! ┌──────────────────────┬─────────────┬──────────────────────────────┐
//! │ Ephemeral X25519 (32)│ Nonce (12)  │ ChaCha20-Poly1305 ct + tag   │
//! └──────────────────────┴─────────────┴──────────────────────────────┘
//!
//! key = HKDF-SHA256(salt = ephemeral_pub ‖ recipient_pub,
//!                   ikm  = X25519(ephemeral, recipient),
//!                   info = "peerlink sealed box v1")
//! ```
//!
//! Signing keys are Ed25519; a public key travels as 64 bytes,
//! `exchange ‖ verifying`.

use std::fs;
use std::io::Write;
use std::path::Path;

use ring::aead::{self, Aad, LessSafeKey, Nonce, UnboundKey, NONCE_LEN};
use ring::hkdf;
use ring::rand::{SecureRandom, SystemRandom};
use ring::signature::{self, Ed25519KeyPair, KeyPair, UnparsedPublicKey};
use serde::{Deserialize, Serialize};
use x25519_dalek::{PublicKey as X25519Public, StaticSecret};

use crate::error::LinkError;

// ============================================================================
// Constants
// ============================================================================

/// Scheme tag placed in encrypted envelopes
pub const SEALED_BOX_SCHEME: &str = "x25519-chacha20poly1305-v1";

/// Key length for both X25519 and Ed25519 seeds
pub const KEY_LEN: usize = 32;

/// Wire length of a [`PublicKey`]
pub const PUBLIC_KEY_LEN: usize = 2 * KEY_LEN;

const HKDF_INFO: &[u8] = b"peerlink sealed box v1";

const TAG_LEN: usize = 16;

// ============================================================================
// Key Types
// ============================================================================

/// A peer's public identity: X25519 for encryption, Ed25519 for signatures
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PublicKey {
    pub exchange: [u8; KEY_LEN],
    pub verifying: [u8; KEY_LEN],
}

impl PublicKey {
    /// 64-byte wire form
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(PUBLIC_KEY_LEN);
        out.extend_from_slice(&self.exchange);
        out.extend_from_slice(&self.verifying);
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != PUBLIC_KEY_LEN {
            return None;
        }
        let mut exchange = [0u8; KEY_LEN];
        let mut verifying = [0u8; KEY_LEN];
        exchange.copy_from_slice(&bytes[..KEY_LEN]);
        verifying.copy_from_slice(&bytes[KEY_LEN..]);
        Some(Self {
            exchange,
            verifying,
        })
    }
}

impl std::fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let prefix: String = self.exchange[..4].iter().map(|b| format!("{:02x}", b)).collect();
        write!(f, "PublicKey({}…)", prefix)
    }
}

/// Private half of an identity
#[derive(Clone, Serialize, Deserialize)]
pub struct PrivateKey {
    exchange: [u8; KEY_LEN],
    signing_seed: [u8; KEY_LEN],
}

impl std::fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("PrivateKey(***)")
    }
}

impl PrivateKey {
    fn public_key(&self) -> Result<PublicKey, CryptoError> {
        let exchange = X25519Public::from(&StaticSecret::from(self.exchange)).to_bytes();
        let signing = Ed25519KeyPair::from_seed_unchecked(&self.signing_seed)
            .map_err(|_| CryptoError::InvalidKey)?;
        let mut verifying = [0u8; KEY_LEN];
        verifying.copy_from_slice(signing.public_key().as_ref());
        Ok(PublicKey {
            exchange,
            verifying,
        })
    }
}

/// This device's identity key pair
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentityKeyPair {
    pub public: PublicKey,
    pub private: PrivateKey,
}

impl IdentityKeyPair {
    /// Generate a fresh key pair from the system CSPRNG
    pub fn generate() -> Result<Self, CryptoError> {
        let rng = SystemRandom::new();
        let private = PrivateKey {
            exchange: random_bytes(&rng)?,
            signing_seed: random_bytes(&rng)?,
        };
        let public = private.public_key()?;
        Ok(Self { public, private })
    }

    /// Load a persisted key pair or generate and persist a new one
    pub fn load_or_generate(path: &Path) -> Result<Self, LinkError> {
        if path.exists() {
            let data = fs::read_to_string(path)?;
            let pair: IdentityKeyPair = serde_json::from_str(&data)?;
            // Refuse a file whose halves do not belong together
            if pair.private.public_key()? != pair.public {
                return Err(LinkError::Crypto(CryptoError::InvalidKey));
            }
            return Ok(pair);
        }

        let pair = Self::generate()?;
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let json = serde_json::to_string_pretty(&pair)?;
        write_private_file(path, json.as_bytes())?;
        log::info!("Generated new identity key pair at {}", path.display());
        Ok(pair)
    }
}

#[cfg(unix)]
fn write_private_file(path: &Path, data: &[u8]) -> std::io::Result<()> {
    use std::os::unix::fs::OpenOptionsExt;
    let mut file = fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)?;
    file.write_all(data)
}

#[cfg(not(unix))]
fn write_private_file(path: &Path, data: &[u8]) -> std::io::Result<()> {
    let mut file = fs::File::create(path)?;
    file.write_all(data)
}

fn random_bytes(rng: &SystemRandom) -> Result<[u8; KEY_LEN], CryptoError> {
    let mut buf = [0u8; KEY_LEN];
    rng.fill(&mut buf).map_err(|_| CryptoError::Random)?;
    Ok(buf)
}

// ============================================================================
// Errors
// ============================================================================

/// Errors from the crypto collaborator
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CryptoError {
    /// CSPRNG failure
    Random,
    /// Key material is unusable
    InvalidKey,
    /// Key agreement produced a non-contributory secret
    WeakKeyAgreement,
    /// HKDF expansion failed
    KeyDerivation,
    /// Ciphertext too short to contain header and tag
    Malformed,
    /// Authentication failed (wrong key or tampered data)
    Decrypt,
    /// Sealing failed
    Encrypt,
    /// No local identity key pair has been provisioned
    MissingIdentity,
}

impl std::fmt::Display for CryptoError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CryptoError::Random => write!(f, "random number generator failed"),
            CryptoError::InvalidKey => write!(f, "invalid key"),
            CryptoError::WeakKeyAgreement => write!(f, "non-contributory key agreement"),
            CryptoError::KeyDerivation => write!(f, "key derivation failed"),
            CryptoError::Malformed => write!(f, "malformed ciphertext"),
            CryptoError::Decrypt => write!(f, "authentication failed"),
            CryptoError::Encrypt => write!(f, "encryption failed"),
            CryptoError::MissingIdentity => write!(f, "no local identity key"),
        }
    }
}

impl std::error::Error for CryptoError {}

// ============================================================================
// Provider Trait
// ============================================================================

/// The asymmetric signer/encryptor consumed by the message pipeline
pub trait CryptoProvider: Send + Sync {
    /// This device's key pair, if one has been provisioned
    fn identity_keypair(&self) -> Option<IdentityKeyPair>;

    fn sign(&self, private: &PrivateKey, data: &[u8]) -> Result<Vec<u8>, CryptoError>;

    fn verify(&self, public: &PublicKey, data: &[u8], signature: &[u8]) -> bool;

    fn encrypt(&self, recipient: &PublicKey, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError>;

    fn decrypt(&self, private: &PrivateKey, ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError>;

    /// Scheme tag recorded in encrypted envelopes
    fn scheme(&self) -> &'static str;
}

// ============================================================================
// Sealed Box Implementation
// ============================================================================

/// X25519 + HKDF-SHA256 + ChaCha20-Poly1305 sealed boxes, Ed25519 signatures
pub struct SealedBoxCrypto {
    identity: Option<IdentityKeyPair>,
    rng: SystemRandom,
}

impl SealedBoxCrypto {
    pub fn new(identity: IdentityKeyPair) -> Self {
        Self {
            identity: Some(identity),
            rng: SystemRandom::new(),
        }
    }

    /// Provider with a freshly generated identity
    pub fn generate() -> Result<Self, CryptoError> {
        Ok(Self::new(IdentityKeyPair::generate()?))
    }

    /// Provider that has no identity yet (can encrypt, cannot decrypt)
    pub fn without_identity() -> Self {
        Self {
            identity: None,
            rng: SystemRandom::new(),
        }
    }
}

impl CryptoProvider for SealedBoxCrypto {
    fn identity_keypair(&self) -> Option<IdentityKeyPair> {
        self.identity.clone()
    }

    fn sign(&self, private: &PrivateKey, data: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let pair = Ed25519KeyPair::from_seed_unchecked(&private.signing_seed)
            .map_err(|_| CryptoError::InvalidKey)?;
        Ok(pair.sign(data).as_ref().to_vec())
    }

    fn verify(&self, public: &PublicKey, data: &[u8], sig: &[u8]) -> bool {
        UnparsedPublicKey::new(&signature::ED25519, &public.verifying)
            .verify(data, sig)
            .is_ok()
    }

    fn encrypt(&self, recipient: &PublicKey, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let ephemeral = StaticSecret::from(random_bytes(&self.rng)?);
        let ephemeral_public = X25519Public::from(&ephemeral);

        let shared = ephemeral.diffie_hellman(&X25519Public::from(recipient.exchange));
        if !shared.was_contributory() {
            return Err(CryptoError::WeakKeyAgreement);
        }

        let key = derive_key(shared.as_bytes(), ephemeral_public.as_bytes(), &recipient.exchange)?;

        let mut nonce = [0u8; NONCE_LEN];
        self.rng.fill(&mut nonce).map_err(|_| CryptoError::Random)?;

        let mut sealed = plaintext.to_vec();
        key.seal_in_place_append_tag(
            Nonce::assume_unique_for_key(nonce),
            Aad::from(SEALED_BOX_SCHEME.as_bytes()),
            &mut sealed,
        )
        .map_err(|_| CryptoError::Encrypt)?;

        let mut out = Vec::with_capacity(KEY_LEN + NONCE_LEN + sealed.len());
        out.extend_from_slice(ephemeral_public.as_bytes());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&sealed);
        Ok(out)
    }

    fn decrypt(&self, private: &PrivateKey, ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if ciphertext.len() < KEY_LEN + NONCE_LEN + TAG_LEN {
            return Err(CryptoError::Malformed);
        }

        let mut ephemeral = [0u8; KEY_LEN];
        ephemeral.copy_from_slice(&ciphertext[..KEY_LEN]);
        let mut nonce = [0u8; NONCE_LEN];
        nonce.copy_from_slice(&ciphertext[KEY_LEN..KEY_LEN + NONCE_LEN]);

        let secret = StaticSecret::from(private.exchange);
        let own_public = X25519Public::from(&secret);
        let shared = secret.diffie_hellman(&X25519Public::from(ephemeral));
        if !shared.was_contributory() {
            return Err(CryptoError::WeakKeyAgreement);
        }

        let key = derive_key(shared.as_bytes(), &ephemeral, own_public.as_bytes())?;

        let mut sealed = ciphertext[KEY_LEN + NONCE_LEN..].to_vec();
        let plaintext = key
            .open_in_place(
                Nonce::assume_unique_for_key(nonce),
                Aad::from(SEALED_BOX_SCHEME.as_bytes()),
                &mut sealed,
            )
            .map_err(|_| CryptoError::Decrypt)?;
        Ok(plaintext.to_vec())
    }

    fn scheme(&self) -> &'static str {
        SEALED_BOX_SCHEME
    }
}

fn derive_key(
    shared: &[u8],
    ephemeral: &[u8; KEY_LEN],
    recipient: &[u8; KEY_LEN],
) -> Result<LessSafeKey, CryptoError> {
    let mut salt_bytes = [0u8; 2 * KEY_LEN];
    salt_bytes[..KEY_LEN].copy_from_slice(ephemeral);
    salt_bytes[KEY_LEN..].copy_from_slice(recipient);

    let prk = hkdf::Salt::new(hkdf::HKDF_SHA256, &salt_bytes).extract(shared);
    let okm = prk
        .expand(&[HKDF_INFO], &aead::CHACHA20_POLY1305)
        .map_err(|_| CryptoError::KeyDerivation)?;
    Ok(LessSafeKey::new(UnboundKey::from(okm)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encrypt_decrypt_roundtrip() {
        let alice = SealedBoxCrypto::generate().unwrap();
        let bob = SealedBoxCrypto::generate().unwrap();
        let bob_pair = bob.identity_keypair().unwrap();

        let plaintext = b"meet at the north entrance".to_vec();
        let sealed = alice.encrypt(&bob_pair.public, &plaintext).unwrap();
        assert_ne!(&sealed[KEY_LEN + NONCE_LEN..], &plaintext[..]);

        let opened = bob.decrypt(&bob_pair.private, &sealed).unwrap();
        assert_eq!(opened, plaintext);
    }

    #[test]
    fn test_ciphertexts_differ_per_message() {
        let crypto = SealedBoxCrypto::generate().unwrap();
        let pair = crypto.identity_keypair().unwrap();
        let a = crypto.encrypt(&pair.public, b"same").unwrap();
        let b = crypto.encrypt(&pair.public, b"same").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_wrong_key_fails_to_decrypt() {
        let crypto = SealedBoxCrypto::generate().unwrap();
        let bob = IdentityKeyPair::generate().unwrap();
        let eve = IdentityKeyPair::generate().unwrap();

        let sealed = crypto.encrypt(&bob.public, b"secret").unwrap();
        assert_eq!(
            crypto.decrypt(&eve.private, &sealed),
            Err(CryptoError::Decrypt)
        );
    }

    #[test]
    fn test_tampered_ciphertext_fails() {
        let crypto = SealedBoxCrypto::generate().unwrap();
        let pair = crypto.identity_keypair().unwrap();
        let mut sealed = crypto.encrypt(&pair.public, b"secret").unwrap();
        let last = sealed.len() - 1;
        sealed[last] ^= 0x01;
        assert_eq!(
            crypto.decrypt(&pair.private, &sealed),
            Err(CryptoError::Decrypt)
        );
    }

    #[test]
    fn test_short_ciphertext_is_malformed() {
        let crypto = SealedBoxCrypto::generate().unwrap();
        let pair = crypto.identity_keypair().unwrap();
        assert_eq!(
            crypto.decrypt(&pair.private, &[0u8; 20]),
            Err(CryptoError::Malformed)
        );
    }

    #[test]
    fn test_sign_and_verify() {
        let crypto = SealedBoxCrypto::generate().unwrap();
        let pair = crypto.identity_keypair().unwrap();
        let other = IdentityKeyPair::generate().unwrap();

        let sig = crypto.sign(&pair.private, b"HANDSHAKE:abc").unwrap();
        assert!(crypto.verify(&pair.public, b"HANDSHAKE:abc", &sig));
        assert!(!crypto.verify(&pair.public, b"HANDSHAKE:abd", &sig));
        assert!(!crypto.verify(&other.public, b"HANDSHAKE:abc", &sig));
    }

    #[test]
    fn test_public_key_wire_form() {
        let pair = IdentityKeyPair::generate().unwrap();
        let bytes = pair.public.to_bytes();
        assert_eq!(bytes.len(), PUBLIC_KEY_LEN);
        assert_eq!(PublicKey::from_bytes(&bytes), Some(pair.public));
        assert_eq!(PublicKey::from_bytes(&bytes[..10]), None);
    }

    #[test]
    fn test_private_key_debug_is_redacted() {
        let pair = IdentityKeyPair::generate().unwrap();
        assert_eq!(format!("{:?}", pair.private), "PrivateKey(***)");
    }

    #[test]
    fn test_load_or_generate_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keys").join("identity.json");

        let first = IdentityKeyPair::load_or_generate(&path).unwrap();
        let second = IdentityKeyPair::load_or_generate(&path).unwrap();
        assert_eq!(first.public, second.public);
    }

    #[test]
    fn test_provider_without_identity() {
        let crypto = SealedBoxCrypto::without_identity();
        assert!(crypto.identity_keypair().is_none());
        assert_eq!(crypto.scheme(), SEALED_BOX_SCHEME);
    }
}
