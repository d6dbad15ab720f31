//! Policy service: binds a key store and a policy store, validates inbound
//! envelopes, and persists them.
//!
//! Store operations update the in-memory record synchronously; the disk
//! write and the caller's acknowledgement are deferred to the next loop tick
//! as a single pending persist task. A second store while one is pending is
//! rejected with `Busy`.
//!
//! Mutex poisoning indicates a panic on this loop, which is unrecoverable.

#![allow(clippy::missing_panics_doc)]

use std::ops::BitOr;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use tokio::sync::oneshot;

use crate::bus::{Signal, SignalBus};
use crate::crypto::Crypto;
use crate::error::{Error, ErrorKind, Result};
use crate::policy::envelope::PolicyEnvelope;
use crate::policy::key::PolicyKey;
use crate::policy::store::PolicyStore;
use crate::system::SystemOps;

/// Key-handling permissions for a store operation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct KeyFlags {
    /// Allow installing a key into an empty store.
    pub install_new: bool,
    /// Allow rotating a populated store with a signed replacement.
    pub rotate: bool,
    /// Allow clobbering a populated store (mitigation recovery).
    pub clobber: bool,
}

impl KeyFlags {
    /// No key changes permitted.
    pub const NONE: Self = Self {
        install_new: false,
        rotate: false,
        clobber: false,
    };
    /// Permit first-time key installation.
    pub const INSTALL_NEW: Self = Self {
        install_new: true,
        rotate: false,
        clobber: false,
    };
    /// Permit signed key rotation.
    pub const ROTATE: Self = Self {
        install_new: false,
        rotate: true,
        clobber: false,
    };
    /// Permit unconditional key replacement.
    pub const CLOBBER: Self = Self {
        install_new: false,
        rotate: false,
        clobber: true,
    };
}

impl BitOr for KeyFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self {
            install_new: self.install_new || rhs.install_new,
            rotate: self.rotate || rhs.rotate,
            clobber: self.clobber || rhs.clobber,
        }
    }
}

/// Asynchronous acknowledgement for a store operation.
pub type Completion = oneshot::Sender<Result<()>>;

/// Pending deferred-persist state; at most one per service.
#[derive(Default)]
struct Pending {
    ack: Option<Completion>,
    key_dirty: bool,
    policy_dirty: bool,
}

enum KeyAction {
    None,
    Install(Vec<u8>),
    Rotate(Vec<u8>, Vec<u8>),
    Clobber(Vec<u8>),
}

/// A key store + policy store binding.
#[derive(Clone)]
pub struct PolicyService {
    key: Arc<Mutex<PolicyKey>>,
    store: Arc<Mutex<PolicyStore>>,
    pending: Arc<Mutex<Pending>>,
    crypto: Arc<dyn Crypto>,
    // Set only on the device service; announces persist outcomes.
    bus: Option<Arc<dyn SignalBus>>,
}

impl PolicyService {
    /// Create a service over the given stores.
    pub fn new(
        key: Arc<Mutex<PolicyKey>>,
        store: Arc<Mutex<PolicyStore>>,
        crypto: Arc<dyn Crypto>,
        bus: Option<Arc<dyn SignalBus>>,
    ) -> Self {
        Self {
            key,
            store,
            pending: Arc::new(Mutex::new(Pending::default())),
            crypto,
            bus,
        }
    }

    /// Shared key store backing this service.
    #[must_use]
    pub fn key(&self) -> Arc<Mutex<PolicyKey>> {
        Arc::clone(&self.key)
    }

    /// Shared policy store backing this service.
    #[must_use]
    pub fn store(&self) -> Arc<Mutex<PolicyStore>> {
        Arc::clone(&self.store)
    }

    /// Validate `blob` and store it. The outcome is always delivered through
    /// `completion`; persistence is deferred to the next loop tick.
    pub fn store_blob(&self, blob: &[u8], flags: KeyFlags, completion: Completion) {
        {
            let pending = self.pending.lock().unwrap();
            if pending.ack.is_some() {
                let _ = completion.send(Err(Error::new(
                    ErrorKind::Busy,
                    "a policy store is already in flight on this service",
                )));
                return;
            }
        }

        match self.validate_and_apply(blob, flags) {
            Ok(key_changed) => {
                {
                    let mut pending = self.pending.lock().unwrap();
                    pending.ack = Some(completion);
                    pending.key_dirty |= key_changed;
                    pending.policy_dirty = true;
                }
                let service = self.clone();
                tokio::spawn(async move {
                    service.flush_persist();
                });
            },
            Err(err) => {
                let _ = completion.send(Err(err));
            },
        }
    }

    /// Return the stored envelope verbatim.
    #[must_use]
    pub fn retrieve(&self) -> Vec<u8> {
        self.store.lock().unwrap().get().to_bytes()
    }

    /// Flush any deferred persist immediately. Used on daemon shutdown.
    pub fn persist_policy_sync(&self) {
        self.flush_persist();
    }

    /// Mark the policy record dirty and schedule its persist, announcing the
    /// outcome when it lands. Used by the device service after rewriting
    /// owner properties.
    pub fn schedule_policy_persist(&self) {
        self.pending.lock().unwrap().policy_dirty = true;
        let service = self.clone();
        tokio::spawn(async move {
            service.flush_persist();
        });
    }

    /// Persist the key store now, announcing the outcome.
    pub fn persist_key(&self) -> bool {
        let result = self.key.lock().unwrap().persist();
        if let Err(ref err) = result {
            tracing::error!(error = %err, "owner key persist failed");
        }
        if let Some(bus) = &self.bus {
            bus.emit(Signal::OwnerKeySet(result.is_ok()));
        }
        result.is_ok()
    }

    fn validate_and_apply(&self, blob: &[u8], flags: KeyFlags) -> Result<bool> {
        let envelope = PolicyEnvelope::parse(blob)
            .map_err(|e| Error::new(ErrorKind::Decode, format!("malformed envelope: {e}")))?;
        let (Some(policy_data), Some(signature)) =
            (&envelope.policy_data, &envelope.policy_data_signature)
        else {
            return Err(Error::new(
                ErrorKind::Decode,
                "envelope is missing policy data or its signature",
            ));
        };

        let mut key = self.key.lock().unwrap();

        // Decide what happens to the key before touching anything, so a
        // failing request leaves no state behind.
        let action = match &envelope.new_public_key {
            Some(new_key) => {
                if flags.clobber && key.is_populated() {
                    KeyAction::Clobber(new_key.clone())
                } else if !key.is_populated() && flags.install_new {
                    // A fresh install must be self-signed: the envelope
                    // signature has to verify under the key it carries.
                    if !self.crypto.verify(new_key, policy_data, signature) {
                        return Err(Error::new(
                            ErrorKind::VerifySignature,
                            "new key does not verify the envelope it arrived in",
                        ));
                    }
                    KeyAction::Install(new_key.clone())
                } else if key.is_populated() && flags.rotate {
                    let rotation_sig = envelope
                        .new_public_key_signature
                        .clone()
                        .unwrap_or_default();
                    if key.verify(new_key, &rotation_sig).is_err() {
                        return Err(Error::new(
                            ErrorKind::VerifySignature,
                            "replacement key is not signed by the current key",
                        ));
                    }
                    KeyAction::Rotate(new_key.clone(), rotation_sig)
                } else {
                    return Err(Error::new(
                        ErrorKind::VerifySignature,
                        "envelope carries a key this service may not accept",
                    ));
                }
            },
            None => KeyAction::None,
        };

        let effective_key: &[u8] = match &action {
            KeyAction::None => key.public_key(),
            KeyAction::Install(k) | KeyAction::Rotate(k, _) | KeyAction::Clobber(k) => k,
        };
        if !self.crypto.verify(effective_key, policy_data, signature) {
            return Err(Error::new(
                ErrorKind::VerifySignature,
                "policy data signature does not verify",
            ));
        }

        let key_changed = !matches!(action, KeyAction::None);
        match action {
            KeyAction::None => {},
            KeyAction::Install(k) => key.populate_from_buffer(&k)?,
            KeyAction::Rotate(k, sig) => key.rotate(&k, &sig)?,
            KeyAction::Clobber(k) => key.clobber_compromised_key(&k)?,
        }
        drop(key);

        self.store.lock().unwrap().set(envelope);
        Ok(key_changed)
    }

    fn flush_persist(&self) {
        let (ack, key_dirty, policy_dirty) = {
            let mut pending = self.pending.lock().unwrap();
            (
                pending.ack.take(),
                std::mem::take(&mut pending.key_dirty),
                std::mem::take(&mut pending.policy_dirty),
            )
        };
        if ack.is_none() && !key_dirty && !policy_dirty {
            return;
        }

        let mut ok = true;
        if key_dirty {
            ok &= self.persist_key();
        }
        if policy_dirty {
            let result = self.store.lock().unwrap().persist();
            if let Err(ref err) = result {
                tracing::error!(error = %err, "policy persist failed");
            }
            if let Some(bus) = &self.bus {
                bus.emit(Signal::PropertyChangeComplete(result.is_ok()));
            }
            ok &= result.is_ok();
        }

        if let Some(ack) = ack {
            let outcome = if ok {
                Ok(())
            } else {
                Err(Error::new(ErrorKind::Io, "policy persistence failed"))
            };
            let _ = ack.send(outcome);
        }
    }
}

impl std::fmt::Debug for PolicyService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PolicyService").finish_non_exhaustive()
    }
}

/// Factory for per-user policy services.
///
/// Each user gets a root-only directory inside their home (named by the
/// sanitized username) holding a signing-key file and a policy file.
pub struct UserPolicyFactory {
    home_root: PathBuf,
    system: Arc<dyn SystemOps>,
    crypto: Arc<dyn Crypto>,
}

impl UserPolicyFactory {
    /// Create a factory rooted at `home_root`.
    pub fn new(
        home_root: impl Into<PathBuf>,
        system: Arc<dyn SystemOps>,
        crypto: Arc<dyn Crypto>,
    ) -> Self {
        Self {
            home_root: home_root.into(),
            system,
            crypto,
        }
    }

    /// Home directory for a sanitized username.
    #[must_use]
    pub fn user_home(&self, sanitized: &str) -> PathBuf {
        self.home_root.join(sanitized)
    }

    /// Build the policy service for `sanitized`, loading any existing key
    /// and policy from its directory.
    ///
    /// # Errors
    ///
    /// Returns `PolicyInitFail` if the user's key cannot be loaded.
    pub fn create(&self, sanitized: &str) -> Result<PolicyService> {
        let dir = self.user_home(sanitized).join("policy");
        if !dir.exists() {
            std::fs::create_dir_all(&dir).map_err(|e| {
                Error::new(
                    ErrorKind::PolicyInitFail,
                    format!("cannot create user policy directory: {e}"),
                )
            })?;
            let _ = std::fs::set_permissions(
                &dir,
                std::os::unix::fs::PermissionsExt::from_mode(0o700),
            );
        }

        let mut key = PolicyKey::new(
            dir.join("key"),
            Arc::clone(&self.system),
            Arc::clone(&self.crypto),
        );
        key.load_from_disk_if_possible().map_err(|e| {
            Error::new(
                ErrorKind::PolicyInitFail,
                format!("user policy key failed to load: {e}"),
            )
        })?;

        let mut store = PolicyStore::new(dir.join("policy"), Arc::clone(&self.system));
        if let Err(err) = store.load_or_create() {
            tracing::warn!(user = sanitized, error = %err, "user policy unreadable, starting empty");
        }

        Ok(PolicyService::new(
            Arc::new(Mutex::new(key)),
            Arc::new(Mutex::new(store)),
            Arc::clone(&self.crypto),
            None,
        ))
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;
    use crate::crypto::{OwnerKeystore, SigningKeyHandle};
    use crate::system::RealSystem;

    struct Fixture {
        _dir: TempDir,
        service: PolicyService,
        crypto: Arc<OwnerKeystore>,
        owner: SigningKeyHandle,
    }

    fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let system: Arc<dyn SystemOps> = Arc::new(RealSystem::new());
        let crypto = Arc::new(OwnerKeystore::new());
        let slot = crypto.open_user_slot(dir.path()).unwrap();
        let owner = crypto.generate_keypair(&slot).unwrap();

        let mut key = PolicyKey::new(
            dir.path().join("pub"),
            Arc::clone(&system),
            crypto.clone() as Arc<dyn Crypto>,
        );
        key.load_from_disk_if_possible().unwrap();

        let mut store = PolicyStore::new(dir.path().join("policy"), Arc::clone(&system));
        store.load_or_create().unwrap();

        let service = PolicyService::new(
            Arc::new(Mutex::new(key)),
            Arc::new(Mutex::new(store)),
            crypto.clone() as Arc<dyn Crypto>,
            None,
        );
        Fixture {
            _dir: dir,
            service,
            crypto,
            owner,
        }
    }

    fn signed_envelope(fx: &Fixture, data: &[u8], with_key: bool) -> Vec<u8> {
        PolicyEnvelope {
            policy_data: Some(data.to_vec()),
            policy_data_signature: Some(fx.crypto.sign(&fx.owner, data)),
            new_public_key: with_key.then(|| fx.owner.public_key_blob()),
            new_public_key_signature: None,
        }
        .to_bytes()
    }

    async fn store_and_wait(fx: &Fixture, blob: &[u8], flags: KeyFlags) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        fx.service.store_blob(blob, flags, tx);
        rx.await.unwrap()
    }

    #[tokio::test]
    async fn install_new_key_then_retrieve_round_trips() {
        let fx = fixture();
        let blob = signed_envelope(&fx, b"policy-v1", true);

        store_and_wait(&fx, &blob, KeyFlags::INSTALL_NEW)
            .await
            .unwrap();

        assert_eq!(fx.service.retrieve(), blob);
        assert!(fx.service.key().lock().unwrap().is_populated());
    }

    #[tokio::test]
    async fn malformed_blob_fails_with_decode() {
        let fx = fixture();
        let err = store_and_wait(&fx, &[0x08], KeyFlags::INSTALL_NEW)
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Decode);
    }

    #[tokio::test]
    async fn flipped_signature_bit_fails_and_leaves_store_unchanged() {
        let fx = fixture();
        let good = signed_envelope(&fx, b"policy-v1", true);
        store_and_wait(&fx, &good, KeyFlags::INSTALL_NEW)
            .await
            .unwrap();

        let mut envelope = PolicyEnvelope::parse(&good).unwrap();
        envelope.policy_data = Some(b"policy-v2".to_vec());
        let mut sig = fx.crypto.sign(&fx.owner, b"policy-v2");
        sig[0] ^= 0x01;
        envelope.policy_data_signature = Some(sig);
        envelope.new_public_key = None;

        let err = store_and_wait(&fx, &envelope.to_bytes(), KeyFlags::NONE)
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::VerifySignature);
        assert_eq!(fx.service.retrieve(), good);
    }

    #[tokio::test]
    async fn key_install_requires_flag() {
        let fx = fixture();
        let blob = signed_envelope(&fx, b"policy-v1", true);

        let err = store_and_wait(&fx, &blob, KeyFlags::ROTATE).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::VerifySignature);
        assert!(!fx.service.key().lock().unwrap().is_populated());
    }

    #[tokio::test]
    async fn rotation_needs_signature_by_current_key() {
        let fx = fixture();
        let first = signed_envelope(&fx, b"policy-v1", true);
        store_and_wait(&fx, &first, KeyFlags::INSTALL_NEW)
            .await
            .unwrap();

        // New keypair, rotation signature produced by the *old* key.
        let slot_dir = TempDir::new().unwrap();
        let slot = fx.crypto.open_user_slot(slot_dir.path()).unwrap();
        let next = fx.crypto.generate_keypair(&slot).unwrap();
        let next_blob = next.public_key_blob();

        let data = b"policy-v2".to_vec();
        let envelope = PolicyEnvelope {
            policy_data: Some(data.clone()),
            policy_data_signature: Some(fx.crypto.sign(&next, &data)),
            new_public_key: Some(next_blob.clone()),
            new_public_key_signature: Some(fx.crypto.sign(&fx.owner, &next_blob)),
        };

        store_and_wait(&fx, &envelope.to_bytes(), KeyFlags::ROTATE)
            .await
            .unwrap();
        assert!(fx.service.key().lock().unwrap().equals(&next_blob));
    }

    #[tokio::test]
    async fn second_store_while_pending_is_busy() {
        let fx = fixture();
        let blob = signed_envelope(&fx, b"policy-v1", true);

        let (tx1, rx1) = oneshot::channel();
        fx.service.store_blob(&blob, KeyFlags::INSTALL_NEW, tx1);

        // The first persist has not run yet; a second store must bounce.
        let (tx2, rx2) = oneshot::channel();
        fx.service.store_blob(&blob, KeyFlags::INSTALL_NEW, tx2);
        let err = rx2.await.unwrap().unwrap_err();
        assert_eq!(err.kind, ErrorKind::Busy);

        rx1.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn user_policy_factory_creates_working_service() {
        let root = TempDir::new().unwrap();
        let system: Arc<dyn SystemOps> = Arc::new(RealSystem::new());
        let crypto = Arc::new(OwnerKeystore::new());
        let factory = UserPolicyFactory::new(
            root.path(),
            Arc::clone(&system),
            crypto.clone() as Arc<dyn Crypto>,
        );

        let service = factory.create("abc123").unwrap();
        assert!(service.retrieve().is_empty());
        assert!(root.path().join("abc123").join("policy").exists());
    }
}
