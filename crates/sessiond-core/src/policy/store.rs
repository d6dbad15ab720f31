//! On-disk store for a single policy envelope.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::policy::envelope::PolicyEnvelope;
use crate::system::{SystemError, SystemOps};

/// File name of the pre-envelope schema, reported for metrics only.
const LEGACY_FILE_NAME: &str = "preferences";

/// Errors from policy store operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The on-disk record failed to decode.
    #[error("policy file {file} is malformed: {source}")]
    Malformed {
        /// Offending file.
        file: PathBuf,
        /// Decode failure.
        #[source]
        source: prost::DecodeError,
    },

    /// File I/O failed.
    #[error("policy store I/O failure: {0}")]
    Io(#[from] SystemError),
}

/// Owns the current policy envelope and its file.
pub struct PolicyStore {
    policy_file: PathBuf,
    envelope: PolicyEnvelope,
    system: Arc<dyn SystemOps>,
}

impl PolicyStore {
    /// Create a store bound to `policy_file`, initially empty.
    pub fn new(policy_file: impl Into<PathBuf>, system: Arc<dyn SystemOps>) -> Self {
        Self {
            policy_file: policy_file.into(),
            envelope: PolicyEnvelope::default(),
            system,
        }
    }

    /// Path of the on-disk policy file.
    #[must_use]
    pub fn policy_file(&self) -> &Path {
        &self.policy_file
    }

    /// Load the stored envelope, or start empty if no file exists.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Malformed`] if a file exists but does not
    /// decode, or an I/O error. The in-memory record stays empty in both
    /// cases.
    pub fn load_or_create(&mut self) -> Result<(), StoreError> {
        if !self.system.exists(&self.policy_file) {
            self.envelope = PolicyEnvelope::default();
            return Ok(());
        }
        let data = self.system.read_file(&self.policy_file)?;
        self.envelope =
            PolicyEnvelope::parse(&data).map_err(|source| StoreError::Malformed {
                file: self.policy_file.clone(),
                source,
            })?;
        Ok(())
    }

    /// Current envelope.
    #[must_use]
    pub const fn get(&self) -> &PolicyEnvelope {
        &self.envelope
    }

    /// Replace the in-memory envelope. Persistence is a separate step.
    pub fn set(&mut self, envelope: PolicyEnvelope) {
        self.envelope = envelope;
    }

    /// Write the current envelope to disk atomically.
    ///
    /// # Errors
    ///
    /// Returns an I/O error; the in-memory record is unaffected.
    pub fn persist(&self) -> Result<(), StoreError> {
        self.system
            .atomic_write(&self.policy_file, &self.envelope.to_bytes())?;
        Ok(())
    }

    /// Whether a file from the pre-envelope schema is still present next to
    /// the policy file. Metrics only.
    #[must_use]
    pub fn legacy_file_present(&self) -> bool {
        self.policy_file
            .parent()
            .is_some_and(|dir| self.system.exists(&dir.join(LEGACY_FILE_NAME)))
    }
}

impl std::fmt::Debug for PolicyStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PolicyStore")
            .field("policy_file", &self.policy_file)
            .field("empty", &self.envelope.is_empty())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use tempfile::TempDir;

    use super::*;
    use crate::system::RealSystem;

    fn new_store(dir: &TempDir) -> PolicyStore {
        PolicyStore::new(dir.path().join("policy"), Arc::new(RealSystem::new()))
    }

    #[test]
    fn load_or_create_with_no_file_is_empty() {
        let dir = TempDir::new().unwrap();
        let mut store = new_store(&dir);

        store.load_or_create().unwrap();
        assert!(store.get().is_empty());
    }

    #[test]
    fn set_persist_load_round_trip() {
        let dir = TempDir::new().unwrap();
        let mut store = new_store(&dir);
        store.load_or_create().unwrap();

        let envelope = PolicyEnvelope {
            policy_data: Some(b"payload".to_vec()),
            policy_data_signature: Some(b"sig".to_vec()),
            ..PolicyEnvelope::default()
        };
        store.set(envelope.clone());
        store.persist().unwrap();

        let mut reloaded = new_store(&dir);
        reloaded.load_or_create().unwrap();
        assert_eq!(*reloaded.get(), envelope);
    }

    #[test]
    fn malformed_file_reports_error_and_stays_empty() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("policy"), [0x08]).unwrap();
        let mut store = new_store(&dir);

        assert!(matches!(
            store.load_or_create(),
            Err(StoreError::Malformed { .. })
        ));
        assert!(store.get().is_empty());
    }

    #[test]
    fn legacy_file_detection() {
        let dir = TempDir::new().unwrap();
        let store = new_store(&dir);
        assert!(!store.legacy_file_present());

        fs::write(dir.path().join("preferences"), b"old").unwrap();
        assert!(store.legacy_file_present());
    }
}
