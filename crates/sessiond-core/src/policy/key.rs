//! Owner-key store.
//!
//! Holds the device owner's public key blob and guards every mutation. If a
//! key exists on disk it is loaded once and may only be replaced by an
//! explicit rotation (signed by the prior key) or by a clobber during
//! owner-key-loss mitigation. Persisting refuses to overwrite an on-disk key
//! that was never explicitly replaced.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::crypto::{Crypto, KeystoreSlot, SigningKeyHandle};
use crate::error::{Error, ErrorKind};
use crate::system::{SystemError, SystemOps};

/// Errors from owner-key store operations.
#[derive(Debug, thiserror::Error)]
pub enum KeyError {
    /// The on-disk key is oversized, unreadable, or not a public key.
    #[error("owner key on disk is corrupt: {0}")]
    CorruptKey(String),

    /// The store already holds a key (or the on-disk file would be
    /// overwritten without an explicit replacement).
    #[error("owner key is already loaded")]
    AlreadyLoaded,

    /// The store holds no key yet.
    #[error("no owner key loaded")]
    NotLoaded,

    /// Disk has not been checked for a key yet.
    #[error("disk has not been checked for an owner key")]
    NotCheckedDisk,

    /// A signature failed to verify.
    #[error("signature verification failed")]
    SignatureInvalid,

    /// No private half of the current key is discoverable in the slot.
    #[error("no private key for the owner key in this keystore slot")]
    NoPrivateKey,

    /// File I/O failed.
    #[error("owner key I/O failure: {0}")]
    IoFailure(#[from] SystemError),
}

impl From<KeyError> for Error {
    fn from(err: KeyError) -> Self {
        let kind = match err {
            KeyError::CorruptKey(_) => ErrorKind::CorruptKey,
            KeyError::SignatureInvalid => ErrorKind::VerifySignature,
            KeyError::NoPrivateKey | KeyError::NotLoaded => ErrorKind::NoOwnerKey,
            KeyError::AlreadyLoaded | KeyError::NotCheckedDisk => ErrorKind::IllegalPubKey,
            KeyError::IoFailure(_) => ErrorKind::Io,
        };
        Self::new(kind, err.to_string())
    }
}

/// The device owner-key store.
pub struct PolicyKey {
    key_file: PathBuf,
    key: Vec<u8>,
    have_checked_disk: bool,
    have_replaced: bool,
    system: Arc<dyn SystemOps>,
    crypto: Arc<dyn Crypto>,
}

impl PolicyKey {
    /// Create an empty store bound to `key_file`.
    pub fn new(
        key_file: impl Into<PathBuf>,
        system: Arc<dyn SystemOps>,
        crypto: Arc<dyn Crypto>,
    ) -> Self {
        Self {
            key_file: key_file.into(),
            key: Vec::new(),
            have_checked_disk: false,
            have_replaced: false,
            system,
            crypto,
        }
    }

    /// Path of the on-disk key file.
    #[must_use]
    pub fn key_file(&self) -> &Path {
        &self.key_file
    }

    /// Whether disk has been checked for a key.
    #[must_use]
    pub const fn have_checked_disk(&self) -> bool {
        self.have_checked_disk
    }

    /// Whether the store holds key material.
    #[must_use]
    pub fn is_populated(&self) -> bool {
        !self.key.is_empty()
    }

    /// Current public key blob (empty if unpopulated).
    #[must_use]
    pub fn public_key(&self) -> &[u8] {
        &self.key
    }

    /// Equality against another blob: equal iff both are empty, or the
    /// lengths match and the bytes compare equal.
    #[must_use]
    pub fn equals(&self, other: &[u8]) -> bool {
        self.key == other
    }

    /// Load the key from disk if the file exists. Idempotent; always marks
    /// disk as checked, even on failure.
    ///
    /// # Errors
    ///
    /// Returns [`KeyError::CorruptKey`] for oversized, short-read, or
    /// unparseable key files.
    pub fn load_from_disk_if_possible(&mut self) -> Result<(), KeyError> {
        self.have_checked_disk = true;
        if !self.system.exists(&self.key_file) {
            tracing::info!(file = %self.key_file.display(), "no owner key on disk");
            return Ok(());
        }

        self.system
            .safe_file_size(&self.key_file)
            .map_err(|e| KeyError::CorruptKey(e.to_string()))?;
        let data = self
            .system
            .read_file(&self.key_file)
            .map_err(|e| KeyError::CorruptKey(e.to_string()))?;
        if !self.crypto.check_public_key(&data) {
            return Err(KeyError::CorruptKey(format!(
                "{} does not contain a public key",
                self.key_file.display()
            )));
        }
        self.key = data;
        Ok(())
    }

    /// Install `public_key` into an empty store.
    ///
    /// # Errors
    ///
    /// Fails unless disk has been checked and the store is empty.
    pub fn populate_from_buffer(&mut self, public_key: &[u8]) -> Result<(), KeyError> {
        if !self.have_checked_disk {
            return Err(KeyError::NotCheckedDisk);
        }
        if self.is_populated() {
            return Err(KeyError::AlreadyLoaded);
        }
        self.key = public_key.to_vec();
        Ok(())
    }

    /// Install the public half of `keypair` into an empty store.
    ///
    /// # Errors
    ///
    /// Same conditions as [`PolicyKey::populate_from_buffer`].
    pub fn populate_from_keypair(&mut self, keypair: &SigningKeyHandle) -> Result<(), KeyError> {
        self.populate_from_buffer(&keypair.public_key_blob())
    }

    /// Replace the key with `new_key`, authorized by `signature` from the
    /// current key.
    ///
    /// # Errors
    ///
    /// Fails if the store is empty or the signature does not verify.
    pub fn rotate(&mut self, new_key: &[u8], signature: &[u8]) -> Result<(), KeyError> {
        if !self.is_populated() {
            return Err(KeyError::NotLoaded);
        }
        self.verify(new_key, signature)?;
        self.key = new_key.to_vec();
        self.have_replaced = true;
        Ok(())
    }

    /// Unconditionally replace the key. Only valid while owner-key-loss
    /// mitigation is in progress; the device policy service enforces that.
    ///
    /// # Errors
    ///
    /// Fails unless disk has been checked and the store is populated.
    pub fn clobber_compromised_key(&mut self, new_key: &[u8]) -> Result<(), KeyError> {
        if !self.have_checked_disk {
            return Err(KeyError::NotCheckedDisk);
        }
        if !self.is_populated() {
            return Err(KeyError::NotLoaded);
        }
        self.key = new_key.to_vec();
        self.have_replaced = true;
        Ok(())
    }

    /// Write the key to disk atomically, or remove the file if the store is
    /// empty. Refuses to overwrite an on-disk key that has not been
    /// explicitly replaced.
    ///
    /// # Errors
    ///
    /// Returns [`KeyError::NotCheckedDisk`], [`KeyError::AlreadyLoaded`] on
    /// an overwrite refusal, or an I/O failure.
    pub fn persist(&mut self) -> Result<(), KeyError> {
        if !self.have_checked_disk {
            return Err(KeyError::NotCheckedDisk);
        }
        if !self.have_replaced && self.system.exists(&self.key_file) {
            tracing::error!(file = %self.key_file.display(), "refusing to overwrite owner key");
            return Err(KeyError::AlreadyLoaded);
        }

        if self.key.is_empty() {
            self.system.remove_file(&self.key_file)?;
            return Ok(());
        }

        self.system.atomic_write(&self.key_file, &self.key)?;
        tracing::debug!(
            bytes = self.key.len(),
            file = %self.key_file.display(),
            "wrote owner key"
        );
        Ok(())
    }

    /// Verify `signature` over `data` with the current key.
    ///
    /// # Errors
    ///
    /// Returns [`KeyError::NotLoaded`] for an empty store or
    /// [`KeyError::SignatureInvalid`] on mismatch.
    pub fn verify(&self, data: &[u8], signature: &[u8]) -> Result<(), KeyError> {
        if !self.is_populated() {
            return Err(KeyError::NotLoaded);
        }
        if self.crypto.verify(&self.key, data, signature) {
            Ok(())
        } else {
            Err(KeyError::SignatureInvalid)
        }
    }

    /// Sign `data` with the private half of the current key, located through
    /// the user's keystore slot.
    ///
    /// # Errors
    ///
    /// Returns [`KeyError::NotLoaded`] for an empty store or
    /// [`KeyError::NoPrivateKey`] if the slot lacks the private half.
    pub fn sign(&self, slot: &KeystoreSlot, data: &[u8]) -> Result<Vec<u8>, KeyError> {
        if !self.is_populated() {
            return Err(KeyError::NotLoaded);
        }
        let handle = self
            .crypto
            .find_private_key(slot, &self.key)
            .ok_or(KeyError::NoPrivateKey)?;
        Ok(self.crypto.sign(&handle, data))
    }
}

impl std::fmt::Debug for PolicyKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PolicyKey")
            .field("key_file", &self.key_file)
            .field("populated", &self.is_populated())
            .field("have_checked_disk", &self.have_checked_disk)
            .field("have_replaced", &self.have_replaced)
            .finish()
    }
}
