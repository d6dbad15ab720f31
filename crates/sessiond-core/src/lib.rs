//! # sessiond-core
//!
//! Core library for sessiond, the privileged session-supervisor daemon of a
//! consumer operating system. It owns three tightly coupled concerns:
//!
//! - **Ownership & policy**: the signed device-policy record and the device
//!   owner key on disk, owner determination, owner-key-loss mitigation, and
//!   validation/persistence of device, per-user, and device-local-account
//!   policy blobs.
//! - **Session lifecycle**: supervising the user-facing browser child,
//!   starting and stopping user sessions, broadcasting state transitions,
//!   and screen-lock state.
//! - **Liveness and crash policy**: periodic browser liveness probes and
//!   the decide-restart-or-shut-down pipeline for child exits.
//!
//! The daemon binary lives in the `sessiond-daemon` crate; everything here
//! is transport-agnostic and reaches the outside world only through the
//! narrow capability traits in [`system`], [`bus`], and [`crypto`].

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod bus;
pub mod crypto;
pub mod error;
pub mod keygen;
pub mod liveness;
pub mod mitigator;
pub mod policy;
pub mod session;
pub mod supervisor;
pub mod system;

pub use bus::{SessionState, Signal};
pub use error::{Error, ErrorKind};
pub use session::SessionManager;
pub use supervisor::{ChildJob, ChildSupervisor, SupervisorHandle};
