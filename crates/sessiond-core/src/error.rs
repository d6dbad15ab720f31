//! Request-boundary error type.
//!
//! Every operation exposed over the remote method surface reports failure as
//! a `(kind, message)` pair. Component-local error enums (key store, crypto,
//! supervisor) convert into this type at the boundary.

use serde::{Deserialize, Serialize};

/// Semantic failure kinds surfaced at the request boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// The supplied email address failed validation.
    InvalidEmail,
    /// A session already exists for the user (or any user, for wipe).
    SessionExists,
    /// A per-user operation referenced a user without an active session.
    SessionDoesNotExist,
    /// A login has already completed on this boot.
    AlreadySession,
    /// The pid is not a supervised child (or not the browser).
    UnknownPid,
    /// The requested property is not known.
    UnknownProperty,
    /// Key material could not be used or installed.
    IllegalPubKey,
    /// No owner key is available for the requested operation.
    NoOwnerKey,
    /// The user's keystore could not be opened.
    NoUserKeystore,
    /// A signature did not verify.
    VerifySignature,
    /// An inbound blob could not be decoded.
    Decode,
    /// An outbound blob could not be encoded.
    EncodeFail,
    /// Emitting an init-system event failed.
    EmitFailed,
    /// A per-user policy service could not be created.
    PolicyInitFail,
    /// The caller failed cookie authentication.
    IllegalService,
    /// An I/O operation failed.
    Io,
    /// The on-disk key is unreadable or oversized.
    CorruptKey,
    /// An argument string could not be parsed.
    ParseArgs,
    /// A previous store on this service is still being acknowledged.
    Busy,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::InvalidEmail => "invalid_email",
            Self::SessionExists => "session_exists",
            Self::SessionDoesNotExist => "session_does_not_exist",
            Self::AlreadySession => "already_session",
            Self::UnknownPid => "unknown_pid",
            Self::UnknownProperty => "unknown_property",
            Self::IllegalPubKey => "illegal_pub_key",
            Self::NoOwnerKey => "no_owner_key",
            Self::NoUserKeystore => "no_user_keystore",
            Self::VerifySignature => "verify_signature",
            Self::Decode => "decode",
            Self::EncodeFail => "encode_fail",
            Self::EmitFailed => "emit_failed",
            Self::PolicyInitFail => "policy_init_fail",
            Self::IllegalService => "illegal_service",
            Self::Io => "io",
            Self::CorruptKey => "corrupt_key",
            Self::ParseArgs => "parse_args",
            Self::Busy => "busy",
        };
        f.write_str(name)
    }
}

/// Boundary error: a semantic kind plus a human-readable message.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, Serialize, Deserialize)]
#[error("{kind}: {message}")]
pub struct Error {
    /// Semantic failure kind.
    pub kind: ErrorKind,
    /// Human-readable description, suitable for logs.
    pub message: String,
}

impl Error {
    /// Create a new boundary error.
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

/// Convenience alias used throughout the request-handling paths.
pub type Result<T> = std::result::Result<T, Error>;
