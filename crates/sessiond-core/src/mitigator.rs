//! Owner-key-loss mitigation.
//!
//! When policy names the current user as the device owner but their keystore
//! lacks the owner private key, the only way back is to regenerate the
//! keypair and re-sign policy under it. The mitigator kicks off that forked
//! key-generation job and tracks that mitigation is in progress until the
//! daemon observes the worker's outcome.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::error::{Error, ErrorKind, Result};

/// Capability to start the forked key-generation worker for a user.
pub trait KeyGenerator: Send + Sync {
    /// Fork the worker as the session user's uid. Returns `true` if the
    /// fork succeeded; key arrival is asynchronous.
    fn start(&self, username: &str) -> bool;
}

/// Strategy interface for recovering from owner-key loss.
pub trait Mitigator: Send + Sync {
    /// Begin mitigation for `username`.
    ///
    /// # Errors
    ///
    /// Fails if the key-generation job could not be started.
    fn mitigate(&self, username: &str) -> Result<()>;

    /// Whether a mitigation is in progress.
    fn mitigating(&self) -> bool;

    /// Record that the in-flight mitigation finished (either a validated key
    /// arrived or the worker failed).
    fn finish(&self);
}

/// Mitigator that regenerates the owner keypair via the key generator.
pub struct RegenMitigator {
    generator: Arc<dyn KeyGenerator>,
    mitigating: AtomicBool,
}

impl RegenMitigator {
    /// Create a mitigator over `generator`.
    pub fn new(generator: Arc<dyn KeyGenerator>) -> Self {
        Self {
            generator,
            mitigating: AtomicBool::new(false),
        }
    }
}

impl Mitigator for RegenMitigator {
    fn mitigate(&self, username: &str) -> Result<()> {
        tracing::warn!(user = username, "owner key lost, regenerating");
        if !self.generator.start(username) {
            return Err(Error::new(
                ErrorKind::IllegalPubKey,
                "could not start owner key regeneration",
            ));
        }
        self.mitigating.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn mitigating(&self) -> bool {
        self.mitigating.load(Ordering::SeqCst)
    }

    fn finish(&self) {
        self.mitigating.store(false, Ordering::SeqCst);
    }
}

impl std::fmt::Debug for RegenMitigator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegenMitigator")
            .field("mitigating", &self.mitigating())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    struct FakeGenerator {
        started: Mutex<Vec<String>>,
        succeed: bool,
    }

    impl KeyGenerator for FakeGenerator {
        fn start(&self, username: &str) -> bool {
            self.started.lock().unwrap().push(username.to_string());
            self.succeed
        }
    }

    #[test]
    fn mitigate_starts_generator_and_sets_flag() {
        let generator = Arc::new(FakeGenerator {
            started: Mutex::new(Vec::new()),
            succeed: true,
        });
        let mitigator = RegenMitigator::new(Arc::clone(&generator) as Arc<dyn KeyGenerator>);

        assert!(!mitigator.mitigating());
        mitigator.mitigate("user@x").unwrap();
        assert!(mitigator.mitigating());
        assert_eq!(*generator.started.lock().unwrap(), vec!["user@x"]);

        mitigator.finish();
        assert!(!mitigator.mitigating());
    }

    #[test]
    fn failed_start_reports_error_and_stays_idle() {
        let generator = Arc::new(FakeGenerator {
            started: Mutex::new(Vec::new()),
            succeed: false,
        });
        let mitigator = RegenMitigator::new(generator as Arc<dyn KeyGenerator>);

        let err = mitigator.mitigate("user@x").unwrap_err();
        assert_eq!(err.kind, ErrorKind::IllegalPubKey);
        assert!(!mitigator.mitigating());
    }
}
