//! Wire types for policy blobs.
//!
//! A stored policy is a signed envelope: opaque policy-data bytes, a
//! detached signature over them, and optionally a replacement public key
//! plus a signature of that key by the prior key. The inner policy data and
//! the decoded device settings are only interpreted for the handful of
//! fields the daemon acts on.

use prost::Message;

/// Policy type tag carried by device policy data.
pub const DEVICE_POLICY_TYPE: &str = "sessiond/device";

/// Signed policy envelope, stored verbatim.
#[derive(Clone, PartialEq, Message)]
pub struct PolicyEnvelope {
    /// Serialized [`PolicyData`].
    #[prost(bytes = "vec", optional, tag = "1")]
    pub policy_data: Option<Vec<u8>>,

    /// Detached signature over `policy_data`.
    #[prost(bytes = "vec", optional, tag = "2")]
    pub policy_data_signature: Option<Vec<u8>>,

    /// Replacement public key, if this envelope installs or rotates one.
    #[prost(bytes = "vec", optional, tag = "3")]
    pub new_public_key: Option<Vec<u8>>,

    /// Signature of `new_public_key` by the prior key (rotation only).
    #[prost(bytes = "vec", optional, tag = "4")]
    pub new_public_key_signature: Option<Vec<u8>>,
}

impl PolicyEnvelope {
    /// Whether this envelope carries no data at all.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.policy_data.is_none()
            && self.policy_data_signature.is_none()
            && self.new_public_key.is_none()
            && self.new_public_key_signature.is_none()
    }

    /// Decode an envelope from bytes.
    ///
    /// # Errors
    ///
    /// Returns a decode error if the bytes are not a valid envelope.
    pub fn parse(blob: &[u8]) -> Result<Self, prost::DecodeError> {
        Self::decode(blob)
    }

    /// Serialize the envelope.
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        self.encode_to_vec()
    }
}

/// Inner policy data: the fields the daemon acts on.
#[derive(Clone, PartialEq, Message)]
pub struct PolicyData {
    /// Policy type tag; [`DEVICE_POLICY_TYPE`] for device policy.
    #[prost(string, optional, tag = "1")]
    pub policy_type: Option<String>,

    /// Device-owner username (device policy) or subject user (user policy).
    #[prost(string, optional, tag = "2")]
    pub username: Option<String>,

    /// Enrollment token; present iff the device is managed.
    #[prost(string, optional, tag = "3")]
    pub request_token: Option<String>,

    /// Serialized [`DeviceSettings`].
    #[prost(bytes = "vec", optional, tag = "4")]
    pub policy_value: Option<Vec<u8>>,

    /// Set when the server could not validate the machine serial number.
    #[prost(bool, optional, tag = "5")]
    pub valid_serial_number_missing: Option<bool>,
}

impl PolicyData {
    /// Decode policy data from bytes.
    ///
    /// # Errors
    ///
    /// Returns a decode error if the bytes are not valid policy data.
    pub fn parse(blob: &[u8]) -> Result<Self, prost::DecodeError> {
        Self::decode(blob)
    }

    /// Serialize the policy data.
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        self.encode_to_vec()
    }
}

/// Decoded device settings.
#[derive(Clone, PartialEq, Message)]
pub struct DeviceSettings {
    /// Users allowed to sign in.
    #[prost(string, repeated, tag = "1")]
    pub user_whitelist: Vec<String>,

    /// Whether users outside the whitelist may sign in. Unset means the
    /// policy has not been decided either way.
    #[prost(bool, optional, tag = "2")]
    pub allow_new_users: Option<bool>,

    /// Extra command-line flags to hand the browser at startup.
    #[prost(string, repeated, tag = "3")]
    pub start_up_flags: Vec<String>,
}

impl DeviceSettings {
    /// Decode settings from bytes.
    ///
    /// # Errors
    ///
    /// Returns a decode error if the bytes are not valid settings.
    pub fn parse(blob: &[u8]) -> Result<Self, prost::DecodeError> {
        Self::decode(blob)
    }

    /// Serialize the settings.
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        self.encode_to_vec()
    }
}
