//! One-shot owner-key generation.
//!
//! This is the body of the forked worker child: create a keypair in the
//! calling user's keystore and write the public half atomically to the
//! output path handed down by the supervisor. The daemon picks the file up
//! when the child exits 0.

use std::os::unix::fs::MetadataExt;
use std::path::Path;
use std::sync::Arc;

use crate::crypto::{Crypto, CryptoError};
use crate::policy::key::{KeyError, PolicyKey};
use crate::system::SystemOps;

/// Errors from the key-generation worker.
#[derive(Debug, thiserror::Error)]
pub enum KeygenError {
    /// The output path already holds a key.
    #[error("existing owner key at {0}")]
    ExistingKey(String),

    /// The output path holds something unreadable.
    #[error("corrupt key on disk: {0}")]
    CorruptKey(#[source] KeyError),

    /// The user's home directory is missing or not exclusively theirs.
    #[error("user home directory cannot be used: {0}")]
    BadHomedir(String),

    /// Keystore or keypair trouble.
    #[error("keystore failure: {0}")]
    Crypto(#[from] CryptoError),

    /// Writing the public key failed.
    #[error("could not persist generated key: {0}")]
    Persist(#[source] KeyError),
}

/// Generate an owner keypair in the keystore under `user_homedir` and write
/// the public half to `output_file`.
///
/// # Errors
///
/// Fails (and the worker child must exit non-zero) if a key already exists
/// at `output_file`, the home directory is not exclusively owned by the
/// calling uid, or any keystore step fails.
pub fn generate_owner_key(
    output_file: &Path,
    user_homedir: &Path,
    system: &Arc<dyn SystemOps>,
    crypto: &Arc<dyn Crypto>,
) -> Result<(), KeygenError> {
    let mut key = PolicyKey::new(output_file, Arc::clone(system), Arc::clone(crypto));
    key.load_from_disk_if_possible()
        .map_err(KeygenError::CorruptKey)?;
    if key.is_populated() {
        return Err(KeygenError::ExistingKey(output_file.display().to_string()));
    }

    verify_homedir_ownership(user_homedir)?;

    let slot = crypto.open_user_slot(user_homedir)?;
    tracing::info!(homedir = %user_homedir.display(), "generating owner key");
    let keypair = crypto.generate_keypair(&slot)?;

    key.populate_from_keypair(&keypair)
        .map_err(KeygenError::Persist)?;
    tracing::info!(file = %output_file.display(), "writing owner public key");
    key.persist().map_err(KeygenError::Persist)
}

/// The home directory must exist, belong to the calling uid, and grant no
/// write access to group or others.
fn verify_homedir_ownership(user_homedir: &Path) -> Result<(), KeygenError> {
    let metadata = std::fs::metadata(user_homedir)
        .map_err(|e| KeygenError::BadHomedir(format!("{}: {e}", user_homedir.display())))?;
    let uid = nix::unistd::getuid().as_raw();
    if metadata.uid() != uid {
        return Err(KeygenError::BadHomedir(format!(
            "{} is owned by uid {}, not {uid}",
            user_homedir.display(),
            metadata.uid()
        )));
    }
    if metadata.mode() & 0o022 != 0 {
        return Err(KeygenError::BadHomedir(format!(
            "{} is writable by group or others",
            user_homedir.display()
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::os::unix::fs::PermissionsExt;

    use tempfile::TempDir;

    use super::*;
    use crate::crypto::OwnerKeystore;
    use crate::system::RealSystem;

    fn deps() -> (Arc<dyn SystemOps>, Arc<dyn Crypto>) {
        (Arc::new(RealSystem::new()), Arc::new(OwnerKeystore::new()))
    }

    #[test]
    fn generates_and_writes_a_usable_public_key() {
        let home = TempDir::new().unwrap();
        let out = TempDir::new().unwrap();
        let output = out.path().join("generated.pub");
        let (system, crypto) = deps();

        generate_owner_key(&output, home.path(), &system, &crypto).unwrap();

        let blob = fs::read(&output).unwrap();
        assert!(crypto.check_public_key(&blob));

        // The private half is discoverable through the user's slot.
        let slot = crypto.open_user_slot(home.path()).unwrap();
        assert!(crypto.find_private_key(&slot, &blob).is_some());
    }

    #[test]
    fn refuses_to_replace_an_existing_key() {
        let home = TempDir::new().unwrap();
        let out = TempDir::new().unwrap();
        let output = out.path().join("generated.pub");
        let (system, crypto) = deps();

        generate_owner_key(&output, home.path(), &system, &crypto).unwrap();
        let err = generate_owner_key(&output, home.path(), &system, &crypto).unwrap_err();
        assert!(matches!(err, KeygenError::ExistingKey(_)));
    }

    #[test]
    fn refuses_group_writable_homedir() {
        let home = TempDir::new().unwrap();
        fs::set_permissions(home.path(), fs::Permissions::from_mode(0o777)).unwrap();
        let out = TempDir::new().unwrap();
        let (system, crypto) = deps();

        let err = generate_owner_key(&out.path().join("k"), home.path(), &system, &crypto)
            .unwrap_err();
        assert!(matches!(err, KeygenError::BadHomedir(_)));
    }

    #[test]
    fn refuses_missing_homedir() {
        let out = TempDir::new().unwrap();
        let (system, crypto) = deps();

        let err = generate_owner_key(
            &out.path().join("k"),
            Path::new("/nonexistent/home"),
            &system,
            &crypto,
        )
        .unwrap_err();
        assert!(matches!(err, KeygenError::BadHomedir(_)));
    }
}
