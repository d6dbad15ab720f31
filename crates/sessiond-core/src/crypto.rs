//! Cryptographic capability surface.
//!
//! The stores and services in this crate treat key material as opaque byte
//! blobs; everything that actually interprets those bytes goes through the
//! [`Crypto`] trait. The production implementation keeps Ed25519 seeds in a
//! per-user keystore directory with 0600 permissions and hands out borrowed
//! [`SigningKeyHandle`]s that zeroize on drop.

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};

use ed25519_dalek::{Signer, SigningKey, Verifier, VerifyingKey};
use sha2::{Digest, Sha256};
use zeroize::Zeroizing;

/// Size of an Ed25519 seed in bytes.
const SEED_SIZE: usize = 32;

/// Subdirectory of a user's home that holds their keystore slot.
const KEYSTORE_SUBDIR: &str = ".sessiond/keystore";

/// Errors from keystore and signing operations.
#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    /// I/O failure touching the keystore.
    #[error("keystore I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The keystore directory or a key file is readable by others.
    #[error("insecure permissions on {path}")]
    InsecurePermissions {
        /// Offending path.
        path: String,
    },

    /// A stored seed did not produce the expected public key.
    #[error("stored key does not match its file name")]
    KeyMismatch,

    /// The key blob is not a valid public key.
    #[error("malformed public key blob")]
    MalformedKey,
}

/// An opened per-user keystore slot.
///
/// Owned by the `UserSession` that opened it; dropping the session releases
/// the slot.
#[derive(Debug)]
pub struct KeystoreSlot {
    dir: PathBuf,
}

impl KeystoreSlot {
    /// Directory backing this slot.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

/// A borrowed private key usable for signing.
///
/// Handles are created for the duration of one signing operation chain and
/// are not retained by any store.
pub struct SigningKeyHandle {
    key: SigningKey,
}

impl SigningKeyHandle {
    /// Public half of this keypair, as an opaque blob.
    #[must_use]
    pub fn public_key_blob(&self) -> Vec<u8> {
        self.key.verifying_key().to_bytes().to_vec()
    }
}

impl std::fmt::Debug for SigningKeyHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SigningKeyHandle").finish_non_exhaustive()
    }
}

/// Narrow crypto capability used by the key store, the policy services, and
/// the key-generation worker.
pub trait Crypto: Send + Sync {
    /// Whether `blob` parses as a public key.
    fn check_public_key(&self, blob: &[u8]) -> bool;

    /// Verify `signature` over `data` with the public key in `blob`.
    fn verify(&self, blob: &[u8], data: &[u8], signature: &[u8]) -> bool;

    /// Open (creating if necessary) the keystore slot under `homedir`.
    fn open_user_slot(&self, homedir: &Path) -> Result<KeystoreSlot, CryptoError>;

    /// Locate the private half of `public_key` in `slot`, if present.
    fn find_private_key(&self, slot: &KeystoreSlot, public_key: &[u8])
        -> Option<SigningKeyHandle>;

    /// Generate a fresh keypair inside `slot` and return a signing handle.
    fn generate_keypair(&self, slot: &KeystoreSlot) -> Result<SigningKeyHandle, CryptoError>;

    /// Sign `data` with `key`.
    fn sign(&self, key: &SigningKeyHandle, data: &[u8]) -> Vec<u8>;
}

/// Production Ed25519 keystore.
#[derive(Debug, Default)]
pub struct OwnerKeystore;

impl OwnerKeystore {
    /// Create a production keystore handle.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    fn key_path(slot: &KeystoreSlot, public_key: &[u8]) -> PathBuf {
        slot.dir.join(format!("{}.key", to_hex(public_key)))
    }

    fn load_seed(path: &Path) -> Result<SigningKey, CryptoError> {
        let metadata = fs::metadata(path)?;
        if metadata.permissions().mode() & 0o077 != 0 {
            return Err(CryptoError::InsecurePermissions {
                path: path.display().to_string(),
            });
        }
        let mut file = File::open(path)?;
        let mut seed = Zeroizing::new([0u8; SEED_SIZE]);
        file.read_exact(&mut *seed)?;
        Ok(SigningKey::from_bytes(&seed))
    }

    fn store_seed(path: &Path, key: &SigningKey) -> Result<(), CryptoError> {
        let seed = Zeroizing::new(key.to_bytes());
        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .mode(0o600)
            .open(path)?;
        file.write_all(&*seed)?;
        file.sync_all()?;
        Ok(())
    }
}

impl Crypto for OwnerKeystore {
    fn check_public_key(&self, blob: &[u8]) -> bool {
        parse_verifying_key(blob).is_some()
    }

    fn verify(&self, blob: &[u8], data: &[u8], signature: &[u8]) -> bool {
        let Some(key) = parse_verifying_key(blob) else {
            return false;
        };
        let Ok(sig) = ed25519_dalek::Signature::from_slice(signature) else {
            return false;
        };
        key.verify(data, &sig).is_ok()
    }

    fn open_user_slot(&self, homedir: &Path) -> Result<KeystoreSlot, CryptoError> {
        let dir = homedir.join(KEYSTORE_SUBDIR);
        if !dir.exists() {
            fs::create_dir_all(&dir)?;
            fs::set_permissions(&dir, fs::Permissions::from_mode(0o700))?;
        }
        let mode = fs::metadata(&dir)?.permissions().mode();
        if mode & 0o077 != 0 {
            return Err(CryptoError::InsecurePermissions {
                path: dir.display().to_string(),
            });
        }
        Ok(KeystoreSlot { dir })
    }

    fn find_private_key(
        &self,
        slot: &KeystoreSlot,
        public_key: &[u8],
    ) -> Option<SigningKeyHandle> {
        let path = Self::key_path(slot, public_key);
        if !path.exists() {
            return None;
        }
        let key = Self::load_seed(&path).ok()?;
        if key.verifying_key().to_bytes() != *public_key {
            tracing::warn!(path = %path.display(), "keystore entry does not match its name");
            return None;
        }
        Some(SigningKeyHandle { key })
    }

    fn generate_keypair(&self, slot: &KeystoreSlot) -> Result<SigningKeyHandle, CryptoError> {
        let mut rng = rand::thread_rng();
        let key = SigningKey::generate(&mut rng);
        let path = Self::key_path(slot, &key.verifying_key().to_bytes());
        Self::store_seed(&path, &key)?;
        Ok(SigningKeyHandle { key })
    }

    fn sign(&self, key: &SigningKeyHandle, data: &[u8]) -> Vec<u8> {
        key.key.sign(data).to_bytes().to_vec()
    }
}

fn parse_verifying_key(blob: &[u8]) -> Option<VerifyingKey> {
    let bytes: &[u8; 32] = blob.try_into().ok()?;
    VerifyingKey::from_bytes(bytes).ok()
}

/// Stable, path-safe identifier for a username or device-local account id:
/// lowercase hex of the SHA-256 digest.
#[must_use]
pub fn sanitize_account_id(id: &str) -> String {
    let digest = Sha256::digest(id.as_bytes());
    to_hex(&digest)
}

fn to_hex(bytes: &[u8]) -> String {
    use std::fmt::Write as _;
    bytes.iter().fold(String::with_capacity(bytes.len() * 2), |mut s, b| {
        let _ = write!(s, "{b:02x}");
        s
    })
}
