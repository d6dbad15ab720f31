//! End-to-end session manager scenarios over real stores and crypto, with
//! recording fakes at the process-management and broadcast seams.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tempfile::TempDir;

use sessiond_core::bus::{
    EmitError, InitEmitter, PowerManager, RecordingBus, SessionState, Signal, TracingMetrics,
};
use sessiond_core::crypto::{Crypto, OwnerKeystore, sanitize_account_id};
use sessiond_core::error::ErrorKind;
use sessiond_core::keygen::generate_owner_key;
use sessiond_core::mitigator::{KeyGenerator, Mitigator, RegenMitigator};
use sessiond_core::policy::{
    DEVICE_POLICY_TYPE, DeviceLocalAccountService, DevicePolicyService, DeviceSettings,
    PolicyData, PolicyEnvelope, PolicyKey, PolicyService, PolicyStore, UserPolicyFactory,
};
use sessiond_core::session::{GUEST_USER, SessionManager, SessionPaths};
use sessiond_core::supervisor::ProcessManager;
use sessiond_core::system::{RealSystem, SystemOps};

#[derive(Default)]
struct FakeManager {
    keygen_requests: Mutex<Vec<String>>,
    mitigation_starts: Mutex<Vec<String>>,
    restarts: Mutex<Vec<(Vec<String>, bool)>>,
    session_users: Mutex<Vec<String>>,
    shutdowns: AtomicUsize,
    aborts: AtomicUsize,
    browser_pid: i32,
}

impl ProcessManager for FakeManager {
    fn is_browser(&self, pid: i32) -> bool {
        pid == self.browser_pid
    }
    fn restart_browser_with_args(&self, args: Vec<String>, args_are_extra: bool) -> bool {
        self.restarts.lock().unwrap().push((args, args_are_extra));
        true
    }
    fn set_browser_session(&self, username: &str) {
        self.session_users.lock().unwrap().push(username.to_string());
    }
    fn set_flags_for_user(&self, _username: &str, _flags: Vec<String>) {}
    fn run_key_generator(&self, username: &str) -> bool {
        self.keygen_requests.lock().unwrap().push(username.to_string());
        true
    }
    fn schedule_shutdown(&self) {
        self.shutdowns.fetch_add(1, Ordering::SeqCst);
    }
    fn abort_browser(&self) {
        self.aborts.fetch_add(1, Ordering::SeqCst);
    }
}

impl KeyGenerator for FakeManager {
    fn start(&self, username: &str) -> bool {
        self.mitigation_starts.lock().unwrap().push(username.to_string());
        true
    }
}

#[derive(Default)]
struct FakeInit {
    events: Mutex<Vec<String>>,
    fail: AtomicBool,
}

impl InitEmitter for FakeInit {
    fn emit(&self, event: &str, _env: &[(String, String)]) -> Result<(), EmitError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(EmitError {
                event: event.to_string(),
                message: "init system unavailable".to_string(),
            });
        }
        self.events.lock().unwrap().push(event.to_string());
        Ok(())
    }
}

#[derive(Default)]
struct FakePower {
    restarts: AtomicUsize,
}

impl PowerManager for FakePower {
    fn request_restart(&self) {
        self.restarts.fetch_add(1, Ordering::SeqCst);
    }
}

struct Fixture {
    root: TempDir,
    session: SessionManager,
    device: Arc<DevicePolicyService>,
    manager: Arc<FakeManager>,
    bus: Arc<RecordingBus>,
    init: Arc<FakeInit>,
    power: Arc<FakePower>,
    crypto: Arc<OwnerKeystore>,
    system: Arc<dyn SystemOps>,
}

impl Fixture {
    fn new() -> Self {
        let root = TempDir::new().unwrap();
        let system: Arc<dyn SystemOps> = Arc::new(RealSystem::new());
        let crypto = Arc::new(OwnerKeystore::new());
        let bus = Arc::new(RecordingBus::new());
        let manager = Arc::new(FakeManager {
            browser_pid: 4321,
            ..FakeManager::default()
        });
        let init = Arc::new(FakeInit::default());
        let power = Arc::new(FakePower::default());

        let key = Arc::new(Mutex::new(PolicyKey::new(
            root.path().join("whitelist/pub"),
            Arc::clone(&system),
            crypto.clone() as Arc<dyn Crypto>,
        )));
        let store = Arc::new(Mutex::new(PolicyStore::new(
            root.path().join("whitelist/policy"),
            Arc::clone(&system),
        )));
        let service = PolicyService::new(
            Arc::clone(&key),
            store,
            crypto.clone() as Arc<dyn Crypto>,
            Some(bus.clone() as _),
        );
        let mitigator = Arc::new(RegenMitigator::new(manager.clone() as Arc<dyn KeyGenerator>));
        let device = Arc::new(DevicePolicyService::new(
            service,
            mitigator as Arc<dyn Mitigator>,
            crypto.clone() as Arc<dyn Crypto>,
            Arc::clone(&system),
            bus.clone() as _,
            Arc::new(TracingMetrics),
            root.path().join("serial_recovery"),
        ));
        device.initialize().unwrap();

        let factory = UserPolicyFactory::new(
            root.path().join("home"),
            Arc::clone(&system),
            crypto.clone() as Arc<dyn Crypto>,
        );
        let accounts = DeviceLocalAccountService::new(
            root.path().join("device_local_accounts"),
            key,
            Arc::clone(&system),
        );
        let paths = SessionPaths {
            logged_in_flag: root.path().join("run/logged_in"),
            reset_file: root.path().join("factory_install_reset"),
        };
        let session = SessionManager::new(
            Arc::clone(&device),
            factory,
            accounts,
            manager.clone() as Arc<dyn ProcessManager>,
            bus.clone() as _,
            init.clone() as _,
            power.clone() as _,
            Arc::new(TracingMetrics),
            Arc::clone(&system),
            crypto.clone() as Arc<dyn Crypto>,
            paths,
        );

        Self {
            root,
            session,
            device,
            manager,
            bus,
            init,
            power,
            crypto,
            system,
        }
    }

    fn alice_home(&self) -> PathBuf {
        self.root
            .path()
            .join("home")
            .join(sanitize_account_id("alice@x"))
    }
}

#[tokio::test]
async fn fresh_device_first_user_bootstraps_ownership() {
    let mut fx = Fixture::new();

    let done = fx.session.start_session("alice@x", "").unwrap();
    assert!(done);

    // State signal, init event, logged-in marker, keygen request.
    assert_eq!(
        fx.bus.count(
            |s| matches!(s, Signal::SessionStateChanged(SessionState::Started))
        ),
        1
    );
    assert!(
        fx.init
            .events
            .lock()
            .unwrap()
            .contains(&"start-user-session".to_string())
    );
    assert!(fx.root.path().join("run/logged_in").exists());
    assert_eq!(*fx.manager.keygen_requests.lock().unwrap(), vec!["alice@x"]);
    assert_eq!(fx.session.retrieve_session_state(), "started");

    // The worker runs (simulated in-process) and its output is imported:
    // the owner-key file holds the generated public key bytes.
    let temp_key = fx.root.path().join("generated.pub");
    generate_owner_key(&temp_key, &fx.alice_home(), &fx.system, &(fx.crypto.clone() as _))
        .unwrap();
    let generated = std::fs::read(&temp_key).unwrap();

    fx.session.handle_keygen_exit("alice@x", &temp_key, true);

    assert_eq!(
        std::fs::read(fx.root.path().join("whitelist/pub")).unwrap(),
        generated
    );
    assert_eq!(fx.bus.count(|s| matches!(s, Signal::OwnerKeySet(true))), 1);
    assert!(!temp_key.exists());
    assert!(!fx.device.key_missing());
}

#[tokio::test]
async fn second_session_for_same_user_fails_and_keeps_table() {
    let mut fx = Fixture::new();
    fx.session.start_session("alice@x", "").unwrap();

    let err = fx.session.start_session("alice@x", "").unwrap_err();
    assert_eq!(err.kind, ErrorKind::SessionExists);

    let sessions = fx.session.retrieve_active_sessions();
    assert_eq!(sessions.len(), 1);
    assert_eq!(
        sessions.get("alice@x"),
        Some(&sanitize_account_id("alice@x"))
    );
}

#[tokio::test]
async fn email_validation_gates_sessions_but_not_sentinels() {
    let mut fx = Fixture::new();

    for bad in ["a", "a@b@c", "a b@c", ""] {
        let err = fx.session.start_session(bad, "").unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidEmail, "for {bad:?}");
    }
    assert!(fx.session.retrieve_active_sessions().is_empty());

    fx.session.start_session(GUEST_USER, "").unwrap();
    fx.session.start_session("demouser@", "").unwrap();
    assert_eq!(fx.session.retrieve_active_sessions().len(), 2);

    // Guest-only sessions never bootstrap ownership.
    assert!(fx.manager.keygen_requests.lock().unwrap().is_empty());
}

#[tokio::test]
async fn failed_init_emission_records_no_session() {
    let mut fx = Fixture::new();
    fx.init.fail.store(true, Ordering::SeqCst);

    let err = fx.session.start_session("alice@x", "").unwrap_err();
    assert_eq!(err.kind, ErrorKind::EmitFailed);
    assert!(fx.session.retrieve_active_sessions().is_empty());
    assert_eq!(fx.session.retrieve_session_state(), "stopped");
}

#[tokio::test]
async fn owner_without_private_key_starts_mitigation() {
    let mut fx = Fixture::new();

    // Policy claims alice owns this unmanaged device; the key store holds a
    // key she cannot sign with.
    let stranger_home = TempDir::new().unwrap();
    let slot = fx.crypto.open_user_slot(stranger_home.path()).unwrap();
    let stranger = fx.crypto.generate_keypair(&slot).unwrap();
    {
        let key = fx.device.service().key();
        key.lock()
            .unwrap()
            .populate_from_buffer(&stranger.public_key_blob())
            .unwrap();
    }
    let poldata = PolicyData {
        policy_type: Some(DEVICE_POLICY_TYPE.to_string()),
        username: Some("alice@x".to_string()),
        policy_value: Some(
            DeviceSettings {
                user_whitelist: vec!["alice@x".to_string()],
                allow_new_users: Some(true),
                start_up_flags: Vec::new(),
            }
            .to_bytes(),
        ),
        ..PolicyData::default()
    };
    {
        let store = fx.device.service().store();
        store.lock().unwrap().set(PolicyEnvelope {
            policy_data: Some(poldata.to_bytes()),
            ..PolicyEnvelope::default()
        });
    }

    fx.session.start_session("alice@x", "").unwrap();

    assert_eq!(*fx.manager.mitigation_starts.lock().unwrap(), vec!["alice@x"]);
    assert!(fx.device.mitigating());
    // The ownership-bootstrap path must not also fire.
    assert!(fx.manager.keygen_requests.lock().unwrap().is_empty());
}

#[tokio::test]
async fn restart_job_demands_browser_pid_and_parsable_args() {
    let mut fx = Fixture::new();

    let err = fx.session.restart_job(7, "browser --flag").unwrap_err();
    assert_eq!(err.kind, ErrorKind::UnknownPid);

    let err = fx.session.restart_job(4321, "browser 'unterminated").unwrap_err();
    assert_eq!(err.kind, ErrorKind::ParseArgs);
    assert!(fx.manager.restarts.lock().unwrap().is_empty());

    let done = fx.session.restart_job(4321, "browser --incognito 'a b'").unwrap();
    assert!(done);
    {
        let restarts = fx.manager.restarts.lock().unwrap();
        assert_eq!(
            restarts.as_slice(),
            &[(
                vec![
                    "browser".to_string(),
                    "--incognito".to_string(),
                    "a b".to_string()
                ],
                false
            )]
        );
    }
    // The restart carries a guest session with it.
    assert!(fx.session.retrieve_active_sessions().contains_key(GUEST_USER));
}

#[tokio::test]
async fn restart_job_with_auth_is_constant_time_cookie_gated() {
    let mut fx = Fixture::new();

    let good = fx.session.cookie().to_string();
    let mut bad = good.clone().into_bytes();
    bad[0] ^= 0x01;
    let bad = String::from_utf8(bad).unwrap();

    let err = fx
        .session
        .restart_job_with_auth(4321, &bad, "browser")
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::IllegalService);

    let err = fx
        .session
        .restart_job_with_auth(4321, "short", "browser")
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::IllegalService);

    let done = fx
        .session
        .restart_job_with_auth(4321, &good, "browser")
        .unwrap();
    assert!(done);
}

#[tokio::test]
async fn device_wipe_is_refused_after_any_login() {
    let fx = Fixture::new();

    assert!(fx.session.start_device_wipe().unwrap());
    assert_eq!(
        std::fs::read(fx.root.path().join("factory_install_reset")).unwrap(),
        b"fast safe"
    );
    assert_eq!(fx.power.restarts.load(Ordering::SeqCst), 1);

    std::fs::create_dir_all(fx.root.path().join("run")).unwrap();
    std::fs::write(fx.root.path().join("run/logged_in"), b"1").unwrap();
    let err = fx.session.start_device_wipe().unwrap_err();
    assert_eq!(err.kind, ErrorKind::AlreadySession);
}

#[tokio::test]
async fn lock_screen_needs_a_real_session() {
    let mut fx = Fixture::new();

    assert!(!fx.session.lock_screen());

    fx.session.start_session(GUEST_USER, "").unwrap();
    assert!(!fx.session.lock_screen(), "guest-only sessions cannot lock");

    fx.session.start_session("alice@x", "").unwrap();
    assert!(fx.session.lock_screen());
    assert!(fx.session.screen_locked());
    assert_eq!(fx.bus.count(|s| matches!(s, Signal::LockScreenRequested)), 1);

    // Idempotent: no second request.
    assert!(fx.session.lock_screen());
    assert_eq!(fx.bus.count(|s| matches!(s, Signal::LockScreenRequested)), 1);

    fx.session.handle_lock_screen_shown();
    assert_eq!(fx.bus.count(|s| matches!(s, Signal::ScreenIsLocked)), 1);

    fx.session.handle_lock_screen_dismissed();
    assert!(!fx.session.screen_locked());
    assert_eq!(fx.bus.count(|s| matches!(s, Signal::ScreenIsUnlocked)), 1);
}

#[tokio::test]
async fn user_policy_requires_an_active_session() {
    let mut fx = Fixture::new();

    let err = fx.session.retrieve_policy_for_user("alice@x").unwrap_err();
    assert_eq!(err.kind, ErrorKind::SessionDoesNotExist);

    let (tx, rx) = tokio::sync::oneshot::channel();
    fx.session.store_policy_for_user("alice@x", &[], tx);
    assert_eq!(
        rx.await.unwrap().unwrap_err().kind,
        ErrorKind::SessionDoesNotExist
    );

    fx.session.start_session("alice@x", "").unwrap();

    // First store installs the user signing key for later rotations.
    let user_home = TempDir::new().unwrap();
    let slot = fx.crypto.open_user_slot(user_home.path()).unwrap();
    let signer = fx.crypto.generate_keypair(&slot).unwrap();
    let data = b"user-policy".to_vec();
    let blob = PolicyEnvelope {
        policy_data: Some(data.clone()),
        policy_data_signature: Some(fx.crypto.sign(&signer, &data)),
        new_public_key: Some(signer.public_key_blob()),
        new_public_key_signature: None,
    }
    .to_bytes();

    let (tx, rx) = tokio::sync::oneshot::channel();
    fx.session.store_policy_for_user("alice@x", &blob, tx);
    rx.await.unwrap().unwrap();

    assert_eq!(fx.session.retrieve_policy_for_user("alice@x").unwrap(), blob);
}

#[tokio::test]
async fn stop_session_schedules_daemon_shutdown() {
    let mut fx = Fixture::new();
    fx.session.start_session("alice@x", "").unwrap();

    assert!(fx.session.stop_session(""));
    assert_eq!(fx.manager.shutdowns.load(Ordering::SeqCst), 1);

    fx.session.announce_stopping();
    assert_eq!(fx.session.retrieve_session_state(), "stopping");
    fx.session.announce_stopped();
    assert_eq!(fx.session.retrieve_session_state(), "stopped");
    assert_eq!(
        fx.bus.count(
            |s| matches!(s, Signal::SessionStateChanged(SessionState::Stopping))
        ),
        1
    );
    assert_eq!(
        fx.bus.count(
            |s| matches!(s, Signal::SessionStateChanged(SessionState::Stopped))
        ),
        1
    );
}

#[tokio::test]
async fn browser_testing_channel_is_sticky_until_forced() {
    let mut fx = Fixture::new();

    let first = fx
        .session
        .enable_browser_testing(false, vec!["--extra".to_string()])
        .unwrap();
    {
        let restarts = fx.manager.restarts.lock().unwrap();
        assert_eq!(restarts.len(), 1);
        let (args, extra_only) = &restarts[0];
        assert!(*extra_only);
        assert_eq!(args[0], "--extra");
        assert!(
            args[1].starts_with("--testing-channel=NamedTestingInterface:"),
            "{args:?}"
        );
    }

    // Re-enabling without force reuses the path and skips the relaunch.
    let second = fx.session.enable_browser_testing(false, Vec::new()).unwrap();
    assert_eq!(first, second);
    assert_eq!(fx.manager.restarts.lock().unwrap().len(), 1);

    // Forcing relaunches on the same channel.
    let third = fx.session.enable_browser_testing(true, Vec::new()).unwrap();
    assert_eq!(first, third);
    assert_eq!(fx.manager.restarts.lock().unwrap().len(), 2);
}

#[tokio::test]
async fn device_policy_key_install_is_only_open_before_first_session() {
    let mut fx = Fixture::new();

    let owner_home = TempDir::new().unwrap();
    let slot = fx.crypto.open_user_slot(owner_home.path()).unwrap();
    let owner = fx.crypto.generate_keypair(&slot).unwrap();
    let data = b"device-policy".to_vec();
    let blob = PolicyEnvelope {
        policy_data: Some(data.clone()),
        policy_data_signature: Some(fx.crypto.sign(&owner, &data)),
        new_public_key: Some(owner.public_key_blob()),
        new_public_key_signature: None,
    }
    .to_bytes();

    // No session yet: an unenrolled fresh device may install the key.
    let (tx, rx) = tokio::sync::oneshot::channel();
    fx.session.store_policy(&blob, tx);
    rx.await.unwrap().unwrap();
    assert_eq!(fx.session.retrieve_policy(), blob);

    // After a session starts, the same self-signed install is refused; only
    // rotation by the current key is acceptable.
    fx.session.start_session("bob@x", "").unwrap();
    let other_home = TempDir::new().unwrap();
    let slot = fx.crypto.open_user_slot(other_home.path()).unwrap();
    let intruder = fx.crypto.generate_keypair(&slot).unwrap();
    let data2 = b"hostile".to_vec();
    let hostile = PolicyEnvelope {
        policy_data: Some(data2.clone()),
        policy_data_signature: Some(fx.crypto.sign(&intruder, &data2)),
        new_public_key: Some(intruder.public_key_blob()),
        new_public_key_signature: Some(fx.crypto.sign(&intruder, &intruder.public_key_blob())),
    }
    .to_bytes();

    let (tx, rx) = tokio::sync::oneshot::channel();
    fx.session.store_policy(&hostile, tx);
    assert_eq!(
        rx.await.unwrap().unwrap_err().kind,
        ErrorKind::VerifySignature
    );
    assert_eq!(fx.session.retrieve_policy(), blob);
}

#[tokio::test]
async fn device_local_account_policy_round_trips() {
    let fx = Fixture::new();

    // Install an owner key so account blobs can verify.
    let owner_home = TempDir::new().unwrap();
    let slot = fx.crypto.open_user_slot(owner_home.path()).unwrap();
    let owner = fx.crypto.generate_keypair(&slot).unwrap();
    {
        let key = fx.device.service().key();
        key.lock()
            .unwrap()
            .populate_from_buffer(&owner.public_key_blob())
            .unwrap();
    }

    let data = b"kiosk".to_vec();
    let blob = PolicyEnvelope {
        policy_data: Some(data.clone()),
        policy_data_signature: Some(fx.crypto.sign(&owner, &data)),
        ..PolicyEnvelope::default()
    }
    .to_bytes();

    let (tx, rx) = tokio::sync::oneshot::channel();
    fx.session.store_device_local_account_policy("kiosk-1", &blob, tx);
    rx.await.unwrap().unwrap();

    assert_eq!(fx.session.retrieve_device_local_account_policy("kiosk-1"), blob);
    assert!(
        fx.session
            .retrieve_device_local_account_policy("kiosk-2")
            .is_empty()
    );
}
