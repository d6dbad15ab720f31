//! Policy storage for device-local accounts.
//!
//! Device-local accounts (kiosk-style, no real user) carry policy blobs
//! validated against the *device* owner key. Each account gets its own
//! store under a common directory, keyed by the sanitized account id.
//!
//! Mutex poisoning indicates a panic on this loop, which is unrecoverable.

#![allow(clippy::missing_panics_doc)]

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use crate::crypto::sanitize_account_id;
use crate::error::{Error, ErrorKind};
use crate::policy::envelope::PolicyEnvelope;
use crate::policy::key::PolicyKey;
use crate::policy::service::Completion;
use crate::policy::store::PolicyStore;
use crate::system::SystemOps;

/// Policy service for device-local accounts.
#[derive(Clone)]
pub struct DeviceLocalAccountService {
    inner: Arc<Inner>,
}

struct Inner {
    accounts_dir: PathBuf,
    key: Arc<Mutex<PolicyKey>>,
    stores: Mutex<HashMap<String, PolicyStore>>,
    pending: Mutex<HashSet<String>>,
    system: Arc<dyn SystemOps>,
}

impl DeviceLocalAccountService {
    /// Create a service rooted at `accounts_dir`, validating against the
    /// shared device owner key.
    pub fn new(
        accounts_dir: impl Into<PathBuf>,
        key: Arc<Mutex<PolicyKey>>,
        system: Arc<dyn SystemOps>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                accounts_dir: accounts_dir.into(),
                key,
                stores: Mutex::new(HashMap::new()),
                pending: Mutex::new(HashSet::new()),
                system,
            }),
        }
    }

    /// Validate and store a policy envelope for `account_id`. Outcome is
    /// delivered through `completion`; the disk write is deferred.
    pub fn store_blob(&self, account_id: &str, blob: &[u8], completion: Completion) {
        let sanitized = sanitize_account_id(account_id);
        {
            let pending = self.inner.pending.lock().unwrap();
            if pending.contains(&sanitized) {
                let _ = completion.send(Err(Error::new(
                    ErrorKind::Busy,
                    "a policy store is already in flight for this account",
                )));
                return;
            }
        }

        let envelope = match PolicyEnvelope::parse(blob) {
            Ok(envelope) => envelope,
            Err(e) => {
                let _ = completion.send(Err(Error::new(
                    ErrorKind::Decode,
                    format!("malformed envelope: {e}"),
                )));
                return;
            },
        };
        let (Some(policy_data), Some(signature)) =
            (&envelope.policy_data, &envelope.policy_data_signature)
        else {
            let _ = completion.send(Err(Error::new(
                ErrorKind::Decode,
                "envelope is missing policy data or its signature",
            )));
            return;
        };

        if self
            .inner
            .key
            .lock()
            .unwrap()
            .verify(policy_data, signature)
            .is_err()
        {
            let _ = completion.send(Err(Error::new(
                ErrorKind::VerifySignature,
                "account policy is not signed by the owner key",
            )));
            return;
        }

        {
            let mut stores = self.inner.stores.lock().unwrap();
            let store = self.store_entry(&mut stores, &sanitized);
            store.set(envelope);
        }
        self.inner.pending.lock().unwrap().insert(sanitized.clone());

        let service = self.clone();
        tokio::spawn(async move {
            service.flush_persist(&sanitized, completion);
        });
    }

    /// Return the stored envelope for `account_id` verbatim (empty if the
    /// account has none).
    #[must_use]
    pub fn retrieve(&self, account_id: &str) -> Vec<u8> {
        let sanitized = sanitize_account_id(account_id);
        let mut stores = self.inner.stores.lock().unwrap();
        self.store_entry(&mut stores, &sanitized).get().to_bytes()
    }

    /// Flush every account's pending persist immediately.
    pub fn persist_policy_sync(&self) {
        let pending: Vec<String> = self.inner.pending.lock().unwrap().drain().collect();
        for sanitized in pending {
            let mut stores = self.inner.stores.lock().unwrap();
            if let Some(store) = stores.get_mut(&sanitized) {
                if let Err(err) = store.persist() {
                    tracing::error!(account = sanitized, error = %err, "account policy persist failed");
                }
            }
        }
    }

    fn flush_persist(&self, sanitized: &str, completion: Completion) {
        if !self.inner.pending.lock().unwrap().remove(sanitized) {
            // Already flushed by a synchronous drain.
            let _ = completion.send(Ok(()));
            return;
        }
        let result = {
            let mut stores = self.inner.stores.lock().unwrap();
            self.store_entry(&mut stores, sanitized).persist()
        };
        let outcome = result.map_err(|e| {
            tracing::error!(account = sanitized, error = %e, "account policy persist failed");
            Error::new(ErrorKind::Io, "account policy persistence failed")
        });
        let _ = completion.send(outcome);
    }

    /// Look up (lazily creating and loading) the store for an account.
    fn store_entry<'a>(
        &self,
        stores: &'a mut HashMap<String, PolicyStore>,
        sanitized: &str,
    ) -> &'a mut PolicyStore {
        stores.entry(sanitized.to_string()).or_insert_with(|| {
            let file = self
                .inner
                .accounts_dir
                .join(sanitized)
                .join("policy");
            let mut store = PolicyStore::new(file, Arc::clone(&self.inner.system));
            if let Err(err) = store.load_or_create() {
                tracing::warn!(account = sanitized, error = %err, "account policy unreadable, starting empty");
            }
            store
        })
    }
}

impl std::fmt::Debug for DeviceLocalAccountService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceLocalAccountService")
            .field("accounts_dir", &self.inner.accounts_dir)
            .finish_non_exhaustive()
    }
}
