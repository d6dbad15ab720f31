//! Outbound capability seams: broadcast signals, init-system events, the
//! power manager, and the metrics reporter.
//!
//! The wire encoding of all four lives outside this crate. Components hold a
//! narrow trait object and never learn how a signal actually leaves the
//! process; production implementations here log and hand off, tests record.

use std::process::Command;
use std::sync::Mutex;

/// Session-state values carried by [`Signal::SessionStateChanged`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No session has started.
    Stopped,
    /// A session is active.
    Started,
    /// Shutdown has been announced but not completed.
    Stopping,
}

impl SessionState {
    /// Stable string form used on the wire and in `RetrieveSessionState`.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Stopped => "stopped",
            Self::Started => "started",
            Self::Stopping => "stopping",
        }
    }
}

/// Broadcast signals observable by the user-facing browser and the UI stack.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Signal {
    /// The global session state moved to a new value.
    SessionStateChanged(SessionState),
    /// The lock screen is now shown.
    ScreenIsLocked,
    /// The lock screen was dismissed.
    ScreenIsUnlocked,
    /// The session manager asks the browser to show the lock screen.
    LockScreenRequested,
    /// The owner key was persisted (or failed to persist).
    OwnerKeySet(bool),
    /// A policy write was persisted (or failed to persist).
    PropertyChangeComplete(bool),
    /// The liveness checker asks the browser to confirm it is alive.
    LivenessRequested,
    /// The login prompt is on screen.
    LoginPromptVisible,
}

/// Broadcast capability. One method, per the inverted-dependency design:
/// policy services receive this instead of a back-pointer to the session
/// manager.
pub trait SignalBus: Send + Sync {
    /// Emit a broadcast signal.
    fn emit(&self, signal: Signal);
}

/// Production bus: traces the signal for the transport adapter to pick up.
#[derive(Debug, Default)]
pub struct TracingBus;

impl SignalBus for TracingBus {
    fn emit(&self, signal: Signal) {
        tracing::info!(?signal, "broadcast signal");
    }
}

/// Recording bus for tests. Kept public so integration tests can assert on
/// emitted signals, the same way the crypto keystore exposes an in-memory
/// variant.
#[derive(Debug, Default)]
pub struct RecordingBus {
    signals: Mutex<Vec<Signal>>,
}

impl RecordingBus {
    /// Create an empty recording bus.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of everything emitted so far.
    ///
    /// # Panics
    ///
    /// Panics if a previous holder of the lock panicked.
    #[must_use]
    pub fn emitted(&self) -> Vec<Signal> {
        self.signals.lock().unwrap().clone()
    }

    /// Count of emitted signals matching `pred`.
    ///
    /// # Panics
    ///
    /// Panics if a previous holder of the lock panicked.
    pub fn count(&self, pred: impl Fn(&Signal) -> bool) -> usize {
        self.signals.lock().unwrap().iter().filter(|s| pred(s)).count()
    }
}

impl SignalBus for RecordingBus {
    fn emit(&self, signal: Signal) {
        self.signals.lock().unwrap().push(signal);
    }
}

/// Error from the init-system emitter.
#[derive(Debug, thiserror::Error)]
#[error("failed to emit init event '{event}': {message}")]
pub struct EmitError {
    /// Event name that failed to emit.
    pub event: String,
    /// Failure description.
    pub message: String,
}

/// Init-system event emitter (e.g. `start-user-session`).
pub trait InitEmitter: Send + Sync {
    /// Emit `event` with `KEY=VALUE` environment parameters.
    fn emit(&self, event: &str, env: &[(String, String)]) -> Result<(), EmitError>;
}

/// Production emitter: shells out to `initctl emit`.
#[derive(Debug)]
pub struct InitctlEmitter {
    initctl: String,
}

impl Default for InitctlEmitter {
    fn default() -> Self {
        Self {
            initctl: "/sbin/initctl".to_string(),
        }
    }
}

impl InitctlEmitter {
    /// Create an emitter using the given `initctl` binary path.
    #[must_use]
    pub fn new(initctl: impl Into<String>) -> Self {
        Self {
            initctl: initctl.into(),
        }
    }
}

impl InitEmitter for InitctlEmitter {
    fn emit(&self, event: &str, env: &[(String, String)]) -> Result<(), EmitError> {
        let mut cmd = Command::new(&self.initctl);
        cmd.arg("emit").arg(event);
        for (key, value) in env {
            cmd.arg(format!("{key}={value}"));
        }
        let status = cmd.status().map_err(|e| EmitError {
            event: event.to_string(),
            message: e.to_string(),
        })?;
        if status.success() {
            Ok(())
        } else {
            Err(EmitError {
                event: event.to_string(),
                message: format!("initctl exited with {status}"),
            })
        }
    }
}

/// Power-manager capability: the only call the daemon makes is a restart
/// request after arming a device wipe.
pub trait PowerManager: Send + Sync {
    /// Ask the platform power manager to restart the machine.
    fn request_restart(&self);
}

/// Production power manager handle; the actual method call is made by the
/// transport adapter listening on this trace point.
#[derive(Debug, Default)]
pub struct TracingPowerManager;

impl PowerManager for TracingPowerManager {
    fn request_restart(&self) {
        tracing::warn!("requesting machine restart from power manager");
    }
}

/// Observed state of a persisted file, for boot metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileState {
    /// Present and well-formed.
    Good,
    /// Present but unreadable or failing validation.
    Malformed,
    /// Absent.
    NotPresent,
}

/// Metrics reporter capability.
pub trait Metrics: Send + Sync {
    /// Record a named bootstrap event (e.g. `login-prompt-visible`).
    fn record_event(&self, name: &str);

    /// Report the state of the owner-key file observed at initialization.
    fn report_key_file_state(&self, state: FileState);

    /// Report the state of the policy file observed at initialization.
    fn report_policy_file_state(&self, state: FileState);
}

/// Production metrics reporter: structured log records scraped downstream.
#[derive(Debug, Default)]
pub struct TracingMetrics;

impl Metrics for TracingMetrics {
    fn record_event(&self, name: &str) {
        tracing::info!(event = name, "bootstrap event");
    }

    fn report_key_file_state(&self, state: FileState) {
        tracing::info!(?state, "owner key file state");
    }

    fn report_policy_file_state(&self, state: FileState) {
        tracing::info!(?state, "policy file state");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_state_strings_are_stable() {
        assert_eq!(SessionState::Stopped.as_str(), "stopped");
        assert_eq!(SessionState::Started.as_str(), "started");
        assert_eq!(SessionState::Stopping.as_str(), "stopping");
    }

    #[test]
    fn recording_bus_captures_in_order() {
        let bus = RecordingBus::new();
        bus.emit(Signal::ScreenIsLocked);
        bus.emit(Signal::OwnerKeySet(true));

        assert_eq!(
            bus.emitted(),
            vec![Signal::ScreenIsLocked, Signal::OwnerKeySet(true)]
        );
        assert_eq!(bus.count(|s| matches!(s, Signal::OwnerKeySet(_))), 1);
    }
}
