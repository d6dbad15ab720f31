//! Cooperative browser liveness checking.
//!
//! Every interval the checker broadcasts a liveness request; the browser is
//! expected to confirm before the next tick. An unconfirmed ping means a
//! hang, and with aborting enabled the browser is SIGABRTed so the regular
//! exit pipeline can deal with it.
//!
//! Mutex poisoning indicates a panic on this loop, which is unrecoverable.

#![allow(clippy::missing_panics_doc)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;

use crate::bus::{Signal, SignalBus};
use crate::supervisor::ProcessManager;

/// Default probe interval.
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(60);

/// Periodic liveness checker for the browser child.
pub struct LivenessChecker {
    inner: Arc<Inner>,
}

struct Inner {
    manager: Arc<dyn ProcessManager>,
    bus: Arc<dyn SignalBus>,
    interval: Duration,
    enable_aborting: bool,
    state: Mutex<State>,
}

#[derive(Default)]
struct State {
    outstanding_ping: bool,
    tick: Option<JoinHandle<()>>,
}

impl LivenessChecker {
    /// Create a checker probing every `interval`.
    pub fn new(
        manager: Arc<dyn ProcessManager>,
        bus: Arc<dyn SignalBus>,
        interval: Duration,
        enable_aborting: bool,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                manager,
                bus,
                interval,
                enable_aborting,
                state: Mutex::new(State::default()),
            }),
        }
    }

    /// Start (or restart) the periodic probe.
    pub fn start(&self) {
        self.stop();
        let mut state = self.inner.state.lock().unwrap();
        state.outstanding_ping = false;
        state.tick = Some(tokio::spawn(run_ticks(Arc::clone(&self.inner))));
    }

    /// Cancel the scheduled tick and forget any outstanding ping.
    pub fn stop(&self) {
        let mut state = self.inner.state.lock().unwrap();
        if let Some(tick) = state.tick.take() {
            tick.abort();
        }
        state.outstanding_ping = false;
    }

    /// The browser confirmed it is alive.
    pub fn handle_confirmed(&self) {
        tracing::info!("browser liveness confirmed");
        self.inner.state.lock().unwrap().outstanding_ping = false;
    }

    /// Whether a tick is currently scheduled.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.inner
            .state
            .lock()
            .unwrap()
            .tick
            .as_ref()
            .is_some_and(|tick| !tick.is_finished())
    }

    /// Whether a ping is awaiting confirmation.
    #[must_use]
    pub fn outstanding_ping(&self) -> bool {
        self.inner.state.lock().unwrap().outstanding_ping
    }
}

async fn run_ticks(inner: Arc<Inner>) {
    loop {
        tokio::time::sleep(inner.interval).await;

        let outstanding = inner.state.lock().unwrap().outstanding_ping;
        if outstanding {
            tracing::warn!("browser hang detected");
            if inner.enable_aborting {
                tracing::warn!("aborting browser process");
                inner.manager.abort_browser();
                // The exit pipeline reaps the child and restarts if needed.
                let mut state = inner.state.lock().unwrap();
                state.tick = None;
                state.outstanding_ping = false;
                return;
            }
        }

        tracing::info!("sending liveness ping to the browser");
        inner.state.lock().unwrap().outstanding_ping = true;
        inner.bus.emit(Signal::LivenessRequested);
    }
}

impl std::fmt::Debug for LivenessChecker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LivenessChecker")
            .field("running", &self.is_running())
            .field("outstanding_ping", &self.outstanding_ping())
            .finish_non_exhaustive()
    }
}
