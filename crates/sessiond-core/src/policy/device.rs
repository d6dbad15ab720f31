//! Device policy service.
//!
//! Specializes the generic policy service with everything that makes the
//! *device* policy special: deciding who the device owner is, recovering
//! from owner-key loss, the serial-recovery marker, and the decoded settings
//! other components act on.
//!
//! Mutex poisoning indicates a panic on this loop, which is unrecoverable.

#![allow(clippy::missing_panics_doc)]

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use crate::bus::{FileState, Metrics, Signal, SignalBus};
use crate::crypto::{Crypto, KeystoreSlot, SigningKeyHandle};
use crate::error::{Error, ErrorKind, Result};
use crate::mitigator::Mitigator;
use crate::policy::envelope::{
    DEVICE_POLICY_TYPE, DeviceSettings, PolicyData, PolicyEnvelope,
};
use crate::policy::service::{Completion, KeyFlags, PolicyService};
use crate::system::SystemOps;

/// Sentinel flag opening the policy-provided switch block.
const POLICY_SWITCHES_BEGIN: &str = "--policy-switches-begin";
/// Sentinel flag closing the policy-provided switch block.
const POLICY_SWITCHES_END: &str = "--policy-switches-end";

/// The device policy service.
pub struct DevicePolicyService {
    service: PolicyService,
    mitigator: Arc<dyn Mitigator>,
    crypto: Arc<dyn Crypto>,
    system: Arc<dyn SystemOps>,
    bus: Arc<dyn SignalBus>,
    metrics: Arc<dyn Metrics>,
    serial_recovery_file: PathBuf,
    settings_cache: Mutex<Option<DeviceSettings>>,
}

impl DevicePolicyService {
    /// Create the device policy service.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        service: PolicyService,
        mitigator: Arc<dyn Mitigator>,
        crypto: Arc<dyn Crypto>,
        system: Arc<dyn SystemOps>,
        bus: Arc<dyn SignalBus>,
        metrics: Arc<dyn Metrics>,
        serial_recovery_file: impl Into<PathBuf>,
    ) -> Self {
        Self {
            service,
            mitigator,
            crypto,
            system,
            bus,
            metrics,
            serial_recovery_file: serial_recovery_file.into(),
            settings_cache: Mutex::new(None),
        }
    }

    /// The underlying policy service.
    #[must_use]
    pub const fn service(&self) -> &PolicyService {
        &self.service
    }

    /// Load key and policy from disk, report their states, and refresh the
    /// serial-recovery marker.
    ///
    /// # Errors
    ///
    /// An unreadable or oversized owner key is fatal and propagates.
    pub fn initialize(&self) -> Result<()> {
        let key_result = self.service.key().lock().unwrap().load_from_disk_if_possible();
        match &key_result {
            Ok(()) => {
                let populated = self.service.key().lock().unwrap().is_populated();
                self.metrics.report_key_file_state(if populated {
                    FileState::Good
                } else {
                    FileState::NotPresent
                });
            },
            Err(err) => {
                tracing::error!(error = %err, "owner key failed to load");
                self.metrics.report_key_file_state(FileState::Malformed);
            },
        }
        key_result.map_err(Error::from)?;

        {
            let store = self.service.store();
            let mut store = store.lock().unwrap();
            let present = self.system.exists(store.policy_file());
            match store.load_or_create() {
                Ok(()) => {
                    self.metrics.report_policy_file_state(if present {
                        FileState::Good
                    } else {
                        FileState::NotPresent
                    });
                },
                Err(err) => {
                    tracing::warn!(error = %err, "device policy unreadable, starting empty");
                    self.metrics.report_policy_file_state(FileState::Malformed);
                },
            }
            if store.legacy_file_present() {
                self.metrics.record_event("legacy-policy-file-present");
            }
        }

        self.update_serial_recovery_marker();
        Ok(())
    }

    /// Whether disk was checked and no owner key was found.
    #[must_use]
    pub fn key_missing(&self) -> bool {
        let key = self.service.key();
        let key = key.lock().unwrap();
        key.have_checked_disk() && !key.is_populated()
    }

    /// Whether owner-key-loss mitigation is in progress.
    #[must_use]
    pub fn mitigating(&self) -> bool {
        self.mitigator.mitigating()
    }

    /// Record that an in-flight mitigation finished.
    pub fn mitigation_finished(&self) {
        self.mitigator.finish();
    }

    /// Validate and store a device policy envelope. See
    /// [`PolicyService::store_blob`] for the async-ack contract.
    pub fn store_blob(&self, blob: &[u8], flags: KeyFlags, completion: Completion) {
        self.invalidate_settings();
        self.service.store_blob(blob, flags, completion);
    }

    /// Return the stored envelope verbatim.
    #[must_use]
    pub fn retrieve(&self) -> Vec<u8> {
        self.service.retrieve()
    }

    /// Flush any deferred persist immediately.
    pub fn persist_policy_sync(&self) {
        self.service.persist_policy_sync();
    }

    /// Handle an owner login: re-assert owner properties if the user holds
    /// the owner private key, and trigger mitigation if policy says they are
    /// the owner but the key is gone.
    ///
    /// Returns whether the user is the device owner.
    ///
    /// # Errors
    ///
    /// Propagates a mitigation failure.
    pub fn check_and_handle_owner_login(
        &self,
        username: &str,
        slot: &KeystoreSlot,
    ) -> Result<bool> {
        let key_blob = {
            let key = self.service.key();
            let key = key.lock().unwrap();
            key.public_key().to_vec()
        };
        let signing_key = if key_blob.is_empty() {
            None
        } else {
            self.crypto.find_private_key(slot, &key_blob)
        };

        if let Some(handle) = &signing_key {
            if let Err(err) = self.store_owner_properties(username, handle) {
                tracing::warn!(user = username, error = %err, "could not refresh owner properties");
            }
        }

        let is_owner = self.user_is_owner(username);
        if is_owner && signing_key.is_none() {
            self.mitigator.mitigate(username)?;
        }
        Ok(is_owner)
    }

    /// Accept the public key produced by the key-generation worker.
    ///
    /// While mitigating, the compromised key is replaced; otherwise this is
    /// first-time ownership of an unmanaged device, so the policy record is
    /// wiped before the new owner properties are written.
    ///
    /// # Errors
    ///
    /// Fails if the user does not hold the generated private key or the key
    /// store rejects the replacement. An `OwnerKeySet(false)` broadcast
    /// accompanies every failure.
    pub fn validate_and_store_owner_key(
        &self,
        username: &str,
        public_key: &[u8],
        slot: &KeystoreSlot,
    ) -> Result<()> {
        let Some(signing_key) = self.crypto.find_private_key(slot, public_key) else {
            self.bus.emit(Signal::OwnerKeySet(false));
            return Err(Error::new(
                ErrorKind::IllegalPubKey,
                "generated key is not present in the user's keystore",
            ));
        };

        let mitigating = self.mitigator.mitigating();
        if !mitigating {
            // Re-establishing ownership of an unmanaged device: the old
            // policy record no longer has an authority behind it.
            self.service
                .store()
                .lock()
                .unwrap()
                .set(PolicyEnvelope::default());
            self.invalidate_settings();
        }
        let install = {
            let key = self.service.key();
            let mut key = key.lock().unwrap();
            if mitigating && key.is_populated() {
                key.clobber_compromised_key(public_key)
            } else {
                key.populate_from_buffer(public_key)
            }
        };
        if let Err(err) = install {
            self.bus.emit(Signal::OwnerKeySet(false));
            return Err(err.into());
        }

        self.store_owner_properties(username, &signing_key)?;
        self.service.persist_key();
        self.service.schedule_policy_persist();
        Ok(())
    }

    /// Make sure `username` is whitelisted and recorded as the device owner
    /// inside policy, re-signing with `signing_key` if anything changed.
    ///
    /// # Errors
    ///
    /// Currently infallible beyond signing, which cannot fail with a held
    /// handle; kept fallible for parity with the storage path.
    pub fn store_owner_properties(
        &self,
        username: &str,
        signing_key: &SigningKeyHandle,
    ) -> Result<()> {
        let store = self.service.store();
        let mut store = store.lock().unwrap();
        let envelope = store.get().clone();

        let mut poldata = envelope
            .policy_data
            .as_deref()
            .and_then(|d| PolicyData::parse(d).ok())
            .unwrap_or_default();
        if poldata.policy_type.as_deref() != Some(DEVICE_POLICY_TYPE) {
            poldata = PolicyData {
                policy_type: Some(DEVICE_POLICY_TYPE.to_string()),
                ..PolicyData::default()
            };
        }
        let mut settings = poldata
            .policy_value
            .as_deref()
            .and_then(|v| DeviceSettings::parse(v).ok())
            .unwrap_or_default();

        let mut on_list = false;
        for entry in &settings.user_whitelist {
            if entry == username {
                on_list = true;
                break;
            }
        }

        {
            let key = self.service.key();
            let key = key.lock().unwrap();
            let stored_key = envelope.new_public_key.as_deref().unwrap_or_default();
            if poldata.username.as_deref() == Some(username)
                && on_list
                && key.equals(stored_key)
            {
                return Ok(());
            }
        }

        if !on_list {
            settings.user_whitelist.push(username.to_string());
            if settings.allow_new_users.is_none() {
                settings.allow_new_users = Some(true);
            }
        }
        poldata.username = Some(username.to_string());
        poldata.policy_value = Some(settings.to_bytes());

        let new_data = poldata.to_bytes();
        let signature = self.crypto.sign(signing_key, &new_data);
        let current_key = {
            let key = self.service.key();
            let key = key.lock().unwrap();
            key.public_key().to_vec()
        };

        let mut new_envelope = envelope;
        new_envelope.policy_data = Some(new_data);
        new_envelope.policy_data_signature = Some(signature);
        new_envelope.new_public_key = Some(current_key);
        store.set(new_envelope);
        drop(store);

        self.invalidate_settings();
        Ok(())
    }

    /// Write or remove the serial-recovery marker according to the current
    /// policy record.
    pub fn update_serial_recovery_marker(&self) {
        let needs_marker = {
            let store = self.service.store();
            let store = store.lock().unwrap();
            let absent_or_empty =
                !self.system.exists(store.policy_file()) || store.get().is_empty();
            let poldata = store
                .get()
                .policy_data
                .as_deref()
                .and_then(|d| PolicyData::parse(d).ok());
            let serial_lost = poldata.as_ref().is_some_and(|p| {
                p.request_token.is_some() && p.valid_serial_number_missing == Some(true)
            });
            absent_or_empty || serial_lost
        };

        let result = if needs_marker {
            self.system.atomic_write(&self.serial_recovery_file, b"")
        } else {
            self.system.remove_file(&self.serial_recovery_file).map(|_| ())
        };
        if let Err(err) = result {
            tracing::warn!(error = %err, "could not update serial recovery marker");
        }
    }

    /// Decoded device settings, recomputed lazily after each store.
    #[must_use]
    pub fn settings(&self) -> DeviceSettings {
        let mut cache = self.settings_cache.lock().unwrap();
        if let Some(settings) = cache.as_ref() {
            return settings.clone();
        }
        let settings = {
            let store = self.service.store();
            let store = store.lock().unwrap();
            store
                .get()
                .policy_data
                .as_deref()
                .and_then(|d| PolicyData::parse(d).ok())
                .and_then(|p| p.policy_value.as_deref().and_then(|v| DeviceSettings::parse(v).ok()))
                .unwrap_or_default()
        };
        *cache = Some(settings.clone());
        settings
    }

    /// Policy-provided browser flags, bracketed by the well-known sentinels
    /// and normalized to switch syntax.
    #[must_use]
    pub fn start_up_flags(&self) -> Vec<String> {
        let settings = self.settings();
        if settings.start_up_flags.is_empty() {
            return Vec::new();
        }

        let mut flags = Vec::with_capacity(settings.start_up_flags.len() + 2);
        flags.push(POLICY_SWITCHES_BEGIN.to_string());
        for flag in &settings.start_up_flags {
            let normalized = if flag.is_empty() || flag == "-" || flag.starts_with("--") {
                flag.clone()
            } else if flag.starts_with('-') {
                format!("-{flag}")
            } else {
                format!("--{flag}")
            };
            flags.push(normalized);
        }
        flags.push(POLICY_SWITCHES_END.to_string());
        flags
    }

    fn user_is_owner(&self, username: &str) -> bool {
        let store = self.service.store();
        let store = store.lock().unwrap();
        let Some(data) = store.get().policy_data.as_deref() else {
            return false;
        };
        let Ok(poldata) = PolicyData::parse(data) else {
            return false;
        };
        poldata.request_token.is_none() && poldata.username.as_deref() == Some(username)
    }

    fn invalidate_settings(&self) {
        *self.settings_cache.lock().unwrap() = None;
    }
}

impl std::fmt::Debug for DevicePolicyService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DevicePolicyService")
            .field("serial_recovery_file", &self.serial_recovery_file)
            .finish_non_exhaustive()
    }
}
