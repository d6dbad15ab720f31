//! Session lifecycle state machine.
//!
//! Validates identities, creates per-user session records, runs the
//! owner-login check, routes policy traffic to the right service, owns
//! screen-lock state, and fields the restart/wipe/testing requests coming in
//! over the remote method surface.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use subtle::ConstantTimeEq;

use crate::bus::{InitEmitter, Metrics, PowerManager, SessionState, Signal, SignalBus};
use crate::crypto::{Crypto, KeystoreSlot, sanitize_account_id};
use crate::error::{Error, ErrorKind, Result};
use crate::policy::{
    Completion, DeviceLocalAccountService, DevicePolicyService, KeyFlags, PolicyService,
    UserPolicyFactory,
};
use crate::supervisor::ProcessManager;
use crate::system::SystemOps;

/// Sentinel username for guest sessions.
pub const GUEST_USER: &str = "$guest";
/// Sentinel username for demo sessions.
pub const DEMO_USER: &str = "demouser@";

/// Entropy of the process-scoped auth cookie.
const COOKIE_ENTROPY_BYTES: usize = 16;

/// Characters permitted in an email address.
const LEGAL_EMAIL_CHARS: &str =
    "abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789.+_@-";

/// Browser flag announcing the testing channel.
const TESTING_CHANNEL_FLAG: &str = "--testing-channel=NamedTestingInterface:";

/// Files the session manager touches directly.
#[derive(Debug, Clone)]
pub struct SessionPaths {
    /// Marker recording that a login completed on this boot.
    pub logged_in_flag: PathBuf,
    /// File armed to request a factory reset on next boot.
    pub reset_file: PathBuf,
}

/// One signed-in user.
struct UserSession {
    sanitized: String,
    is_incognito: bool,
    slot: KeystoreSlot,
    policy_service: PolicyService,
}

/// The session manager.
pub struct SessionManager {
    state: SessionState,
    screen_locked: bool,
    cookie: String,
    sessions: BTreeMap<String, UserSession>,
    testing_channel: Option<PathBuf>,
    device_policy: Arc<DevicePolicyService>,
    user_policy_factory: UserPolicyFactory,
    device_local_accounts: DeviceLocalAccountService,
    manager: Arc<dyn ProcessManager>,
    bus: Arc<dyn SignalBus>,
    init_emitter: Arc<dyn InitEmitter>,
    power: Arc<dyn PowerManager>,
    metrics: Arc<dyn Metrics>,
    system: Arc<dyn SystemOps>,
    crypto: Arc<dyn Crypto>,
    paths: SessionPaths,
}

impl SessionManager {
    /// Create the session manager and generate the process auth cookie.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        device_policy: Arc<DevicePolicyService>,
        user_policy_factory: UserPolicyFactory,
        device_local_accounts: DeviceLocalAccountService,
        manager: Arc<dyn ProcessManager>,
        bus: Arc<dyn SignalBus>,
        init_emitter: Arc<dyn InitEmitter>,
        power: Arc<dyn PowerManager>,
        metrics: Arc<dyn Metrics>,
        system: Arc<dyn SystemOps>,
        crypto: Arc<dyn Crypto>,
        paths: SessionPaths,
    ) -> Self {
        let mut entropy = [0u8; COOKIE_ENTROPY_BYTES];
        system.random_bytes(&mut entropy);
        let cookie = entropy.iter().map(|b| format!("{b:02x}")).collect();

        Self {
            state: SessionState::Stopped,
            screen_locked: false,
            cookie,
            sessions: BTreeMap::new(),
            testing_channel: None,
            device_policy,
            user_policy_factory,
            device_local_accounts,
            manager,
            bus,
            init_emitter,
            power,
            metrics,
            system,
            crypto,
            paths,
        }
    }

    /// The process-scoped auth cookie (for handing to the browser child).
    #[must_use]
    pub fn cookie(&self) -> &str {
        &self.cookie
    }

    /// Current screen-lock state.
    #[must_use]
    pub const fn screen_locked(&self) -> bool {
        self.screen_locked
    }

    /// Whether any session has started this daemon lifetime.
    #[must_use]
    pub fn session_started(&self) -> bool {
        self.state != SessionState::Stopped
    }

    /// Emit the `login-prompt-ready` init event.
    ///
    /// # Errors
    ///
    /// `EmitFailed` if the init system rejects the event.
    pub fn emit_login_prompt_ready(&self) -> Result<bool> {
        self.metrics.record_event("login-prompt-ready");
        self.init_emitter
            .emit("login-prompt-ready", &[])
            .map_err(|e| Error::new(ErrorKind::EmitFailed, e.to_string()))?;
        Ok(true)
    }

    /// Emit the `login-prompt-visible` init event and broadcast.
    ///
    /// # Errors
    ///
    /// `EmitFailed` if the init system rejects the event.
    pub fn emit_login_prompt_visible(&self) -> Result<()> {
        self.metrics.record_event("login-prompt-visible");
        self.bus.emit(Signal::LoginPromptVisible);
        self.init_emitter
            .emit("login-prompt-visible", &[])
            .map_err(|e| Error::new(ErrorKind::EmitFailed, e.to_string()))
    }

    /// Set up (or reuse) the browser testing channel and relaunch the
    /// browser pointing at it.
    ///
    /// # Errors
    ///
    /// `Io` if the channel file cannot be staged.
    pub fn enable_browser_testing(
        &mut self,
        force_relaunch: bool,
        extra_args: Vec<String>,
    ) -> Result<PathBuf> {
        let already_enabled = self.testing_channel.is_some();
        if !already_enabled {
            let path = self
                .system
                .unique_file_in_temp_dir()
                .map_err(|e| Error::new(ErrorKind::Io, e.to_string()))?;
            self.testing_channel = Some(path);
        }
        let channel = self.testing_channel.clone().unwrap_or_default();

        if already_enabled && !force_relaunch {
            return Ok(channel);
        }

        // Replace any stale channel file.
        let _ = self.system.remove_file(&channel);

        let mut args = extra_args;
        args.push(format!("{TESTING_CHANNEL_FLAG}{}", channel.display()));
        self.manager.restart_browser_with_args(args, true);
        Ok(channel)
    }

    /// Start a session for `email`.
    ///
    /// # Errors
    ///
    /// `InvalidEmail`, `SessionExists`, `PolicyInitFail`, `NoUserKeystore`,
    /// owner-login failures, or `EmitFailed`; no state is recorded on any of
    /// them.
    pub fn start_session(&mut self, email: &str, _unique_identifier: &str) -> Result<bool> {
        let username = email.to_ascii_lowercase();
        let is_incognito = username == GUEST_USER || username == DEMO_USER;
        if !is_incognito && !validate_email(&username) {
            return Err(Error::new(
                ErrorKind::InvalidEmail,
                "provided email address is not valid, ASCII only",
            ));
        }

        if self.sessions.contains_key(&username) {
            return Err(Error::new(
                ErrorKind::SessionExists,
                "provided email address already started a session",
            ));
        }

        let session = self.create_user_session(&username, is_incognito)?;

        let is_owner = self
            .device_policy
            .check_and_handle_owner_login(&username, &session.slot)?;
        tracing::debug!(user = %username, is_owner, "owner login check complete");

        let is_first_real_user =
            self.sessions.values().all(|s| s.is_incognito) && !is_incognito;

        self.init_emitter
            .emit(
                "start-user-session",
                &[("SESSION_USER".to_string(), username.clone())],
            )
            .map_err(|e| Error::new(ErrorKind::EmitFailed, e.to_string()))?;

        tracing::info!(user = %username, "starting user session");
        self.manager.set_browser_session(&username);
        self.sessions.insert(username.clone(), session);
        self.state = SessionState::Started;
        self.bus
            .emit(Signal::SessionStateChanged(SessionState::Started));

        if self.device_policy.key_missing()
            && !self.device_policy.mitigating()
            && is_first_real_user
        {
            // First sign-in on an unmanaged device: take ownership.
            self.manager.run_key_generator(&username);
        }

        if let Err(err) = self.system.atomic_write(&self.paths.logged_in_flag, b"1") {
            tracing::warn!(error = %err, "could not record logged-in marker");
        }
        Ok(true)
    }

    /// Stop all sessions by scheduling daemon shutdown.
    pub fn stop_session(&self, _unique_identifier: &str) -> bool {
        tracing::info!("stopping all sessions");
        self.manager.schedule_shutdown();
        true
    }

    /// Store a device policy blob; acknowledgement arrives via `completion`.
    pub fn store_policy(&self, blob: &[u8], completion: Completion) {
        // Before any session starts, an unenrolled fresh device may install
        // or clobber the owner key; afterwards only signed rotation is
        // acceptable.
        let mut flags = KeyFlags::ROTATE;
        if !self.session_started() {
            flags = flags | KeyFlags::INSTALL_NEW | KeyFlags::CLOBBER;
        }
        self.device_policy.store_blob(blob, flags, completion);
    }

    /// Retrieve the stored device policy envelope.
    #[must_use]
    pub fn retrieve_policy(&self) -> Vec<u8> {
        self.device_policy.retrieve()
    }

    /// Store a user policy blob for `email`.
    pub fn store_policy_for_user(&self, email: &str, blob: &[u8], completion: Completion) {
        match self.user_policy_service(email) {
            Some(service) => {
                service.store_blob(blob, KeyFlags::INSTALL_NEW | KeyFlags::ROTATE, completion);
            },
            None => {
                let _ = completion.send(Err(no_session_error()));
            },
        }
    }

    /// Retrieve the stored user policy envelope for `email`.
    ///
    /// # Errors
    ///
    /// `SessionDoesNotExist` if the user has no active session.
    pub fn retrieve_policy_for_user(&self, email: &str) -> Result<Vec<u8>> {
        self.user_policy_service(email)
            .map(|service| service.retrieve())
            .ok_or_else(no_session_error)
    }

    /// Store a device-local account policy blob.
    pub fn store_device_local_account_policy(
        &self,
        account_id: &str,
        blob: &[u8],
        completion: Completion,
    ) {
        self.device_local_accounts
            .store_blob(account_id, blob, completion);
    }

    /// Retrieve a device-local account policy envelope.
    #[must_use]
    pub fn retrieve_device_local_account_policy(&self, account_id: &str) -> Vec<u8> {
        self.device_local_accounts.retrieve(account_id)
    }

    /// Current session state string.
    #[must_use]
    pub const fn retrieve_session_state(&self) -> &'static str {
        self.state.as_str()
    }

    /// Map of active sessions: email to sanitized username.
    #[must_use]
    pub fn retrieve_active_sessions(&self) -> BTreeMap<String, String> {
        self.sessions
            .iter()
            .map(|(email, session)| (email.clone(), session.sanitized.clone()))
            .collect()
    }

    /// Request the lock screen. Refused outside a session and for
    /// guest-only sessions; idempotent once locked.
    pub fn lock_screen(&mut self) -> bool {
        if !self.session_started() {
            tracing::warn!("attempt to lock screen outside of a user session");
            return false;
        }
        if self.sessions.values().all(|s| s.is_incognito) {
            tracing::warn!("attempt to lock screen during a guest session");
            return false;
        }
        if !self.screen_locked {
            self.screen_locked = true;
            self.bus.emit(Signal::LockScreenRequested);
        }
        tracing::info!("lock screen requested");
        true
    }

    /// The browser reports the lock screen is visible.
    pub fn handle_lock_screen_shown(&mut self) {
        tracing::info!("lock screen shown");
        self.bus.emit(Signal::ScreenIsLocked);
    }

    /// The browser reports the lock screen was dismissed.
    pub fn handle_lock_screen_dismissed(&mut self) {
        self.screen_locked = false;
        tracing::info!("lock screen dismissed");
        self.bus.emit(Signal::ScreenIsUnlocked);
    }

    /// Restart the browser with a replacement argument vector, starting a
    /// guest session as part of the restart.
    ///
    /// # Errors
    ///
    /// `UnknownPid` if `pid` is not the running browser, `ParseArgs` for a
    /// malformed argument string, or any `start_session` failure.
    pub fn restart_job(&mut self, pid: i32, args: &str) -> Result<bool> {
        if !self.manager.is_browser(pid) {
            return Err(Error::new(ErrorKind::UnknownPid, "provided pid is unknown"));
        }
        let argv = parse_shell_words(args)?;

        // Sets logged-in state for the browse-without-signing-in flow.
        let session_result = self.start_session(GUEST_USER, "");
        self.manager.restart_browser_with_args(argv, false);
        session_result
    }

    /// [`SessionManager::restart_job`] behind cookie authentication.
    ///
    /// # Errors
    ///
    /// `IllegalService` for a cookie mismatch, then as `restart_job`.
    pub fn restart_job_with_auth(&mut self, pid: i32, cookie: &str, args: &str) -> Result<bool> {
        let matches: bool = cookie
            .as_bytes()
            .ct_eq(self.cookie.as_bytes())
            .into();
        if !matches {
            return Err(Error::new(ErrorKind::IllegalService, "invalid auth cookie"));
        }
        self.restart_job(pid, args)
    }

    /// Arm a factory reset and restart, unless a login already happened on
    /// this boot.
    ///
    /// # Errors
    ///
    /// `AlreadySession` once any login has completed this boot.
    pub fn start_device_wipe(&self) -> Result<bool> {
        if self.system.exists(&self.paths.logged_in_flag) {
            return Err(Error::new(
                ErrorKind::AlreadySession,
                "a user has already logged in this boot",
            ));
        }
        if let Err(err) = self.system.atomic_write(&self.paths.reset_file, b"fast safe") {
            return Err(Error::new(ErrorKind::Io, err.to_string()));
        }
        self.power.request_restart();
        Ok(true)
    }

    /// Stash flags applied to `email`'s next in-session browser restart.
    pub fn set_flags_for_user(&self, email: &str, flags: Vec<String>) {
        self.manager
            .set_flags_for_user(&email.to_ascii_lowercase(), flags);
    }

    /// The key-generation worker finished; import its output.
    pub fn handle_keygen_exit(&mut self, username: &str, temp_key_file: &Path, success: bool) {
        let result = if success {
            self.import_generated_key(username, temp_key_file)
        } else {
            Err(Error::new(
                ErrorKind::IllegalPubKey,
                "key generation worker failed",
            ))
        };
        if let Err(err) = result {
            tracing::error!(user = username, error = %err, "owner key generation failed");
            self.bus.emit(Signal::OwnerKeySet(false));
        }
        self.device_policy.mitigation_finished();
    }

    /// Flush all deferred policy writes; used at daemon shutdown.
    pub fn finalize(&self) {
        self.device_policy.persist_policy_sync();
        for session in self.sessions.values() {
            session.policy_service.persist_policy_sync();
        }
        self.device_local_accounts.persist_policy_sync();
    }

    /// Broadcast that the session is stopping, once.
    pub fn announce_stopping(&mut self) {
        if self.state == SessionState::Started {
            self.state = SessionState::Stopping;
            self.bus
                .emit(Signal::SessionStateChanged(SessionState::Stopping));
        }
    }

    /// Broadcast that the session stopped.
    pub fn announce_stopped(&mut self) {
        if self.state != SessionState::Stopped {
            self.state = SessionState::Stopped;
            self.bus
                .emit(Signal::SessionStateChanged(SessionState::Stopped));
        }
    }

    fn import_generated_key(&mut self, username: &str, temp_key_file: &Path) -> Result<()> {
        let key = self
            .system
            .read_file(temp_key_file)
            .map_err(|e| Error::new(ErrorKind::Io, e.to_string()))?;
        if let Err(err) = self.system.remove_file(temp_key_file) {
            tracing::warn!(error = %err, "cannot delete temporary key file");
        }
        let session = self.sessions.get(username).ok_or_else(|| {
            Error::new(
                ErrorKind::SessionDoesNotExist,
                "key arrived for a user without a session",
            )
        })?;
        self.device_policy
            .validate_and_store_owner_key(username, &key, &session.slot)
    }

    fn create_user_session(&self, username: &str, is_incognito: bool) -> Result<UserSession> {
        let sanitized = sanitize_account_id(username);
        let policy_service = self.user_policy_factory.create(&sanitized)?;
        let slot = self
            .crypto
            .open_user_slot(&self.user_policy_factory.user_home(&sanitized))
            .map_err(|e| {
                Error::new(
                    ErrorKind::NoUserKeystore,
                    format!("could not open the user's keystore: {e}"),
                )
            })?;
        Ok(UserSession {
            sanitized,
            is_incognito,
            slot,
            policy_service,
        })
    }

    fn user_policy_service(&self, email: &str) -> Option<PolicyService> {
        self.sessions
            .get(&email.to_ascii_lowercase())
            .map(|session| session.policy_service.clone())
    }
}

impl std::fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionManager")
            .field("state", &self.state.as_str())
            .field("screen_locked", &self.screen_locked)
            .field("sessions", &self.sessions.len())
            .finish_non_exhaustive()
    }
}

fn no_session_error() -> Error {
    Error::new(
        ErrorKind::SessionDoesNotExist,
        "no session is active for that user",
    )
}

/// Validate an email address: legal characters and exactly one `@`.
#[must_use]
pub fn validate_email(email: &str) -> bool {
    if email.is_empty() {
        return false;
    }
    if email.chars().any(|c| !LEGAL_EMAIL_CHARS.contains(c)) {
        return false;
    }
    email.chars().filter(|&c| c == '@').count() == 1
}

/// Split a command string into words, honoring single quotes, double quotes,
/// and backslash escapes.
///
/// # Errors
///
/// `ParseArgs` on an unterminated quote or trailing backslash.
pub fn parse_shell_words(input: &str) -> Result<Vec<String>> {
    let mut words = Vec::new();
    let mut current = String::new();
    let mut in_word = false;
    let mut chars = input.chars();

    'outer: loop {
        let Some(c) = chars.next() else { break };
        match c {
            ' ' | '\t' | '\n' => {
                if in_word {
                    words.push(std::mem::take(&mut current));
                    in_word = false;
                }
            },
            '\'' => {
                in_word = true;
                loop {
                    match chars.next() {
                        Some('\'') => continue 'outer,
                        Some(inner) => current.push(inner),
                        None => {
                            return Err(Error::new(
                                ErrorKind::ParseArgs,
                                "unterminated single quote",
                            ));
                        },
                    }
                }
            },
            '"' => {
                in_word = true;
                loop {
                    match chars.next() {
                        Some('"') => continue 'outer,
                        Some('\\') => match chars.next() {
                            Some(escaped) => current.push(escaped),
                            None => {
                                return Err(Error::new(
                                    ErrorKind::ParseArgs,
                                    "unterminated double quote",
                                ));
                            },
                        },
                        Some(inner) => current.push(inner),
                        None => {
                            return Err(Error::new(
                                ErrorKind::ParseArgs,
                                "unterminated double quote",
                            ));
                        },
                    }
                }
            },
            '\\' => {
                in_word = true;
                match chars.next() {
                    Some(escaped) => current.push(escaped),
                    None => {
                        return Err(Error::new(ErrorKind::ParseArgs, "trailing backslash"));
                    },
                }
            },
            other => {
                in_word = true;
                current.push(other);
            },
        }
    }
    if in_word {
        words.push(current);
    }
    Ok(words)
}
