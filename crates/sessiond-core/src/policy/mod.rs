//! Ownership and policy: the owner-key store, the policy record stores, and
//! the services that validate and persist signed policy envelopes.

pub mod accounts;
pub mod device;
pub mod envelope;
pub mod key;
pub mod service;
pub mod store;

pub use accounts::DeviceLocalAccountService;
pub use device::DevicePolicyService;
pub use envelope::{DEVICE_POLICY_TYPE, DeviceSettings, PolicyData, PolicyEnvelope};
pub use key::{KeyError, PolicyKey};
pub use service::{Completion, KeyFlags, PolicyService, UserPolicyFactory};
pub use store::{PolicyStore, StoreError};
