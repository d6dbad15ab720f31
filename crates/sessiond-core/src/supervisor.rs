//! Child supervision.
//!
//! Tracks the user-facing browser (and any auxiliary children) by pid,
//! restarts or stops restarting per child policy, forks the one-shot
//! key-generation worker, and drives the graceful termination pipeline.
//!
//! Mutex poisoning indicates a panic on this loop, which is unrecoverable.

#![allow(clippy::missing_panics_doc)]

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::ExitStatus;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use nix::sys::signal::Signal;
use tokio::process::Command;
use tokio::sync::Notify;
use tokio::sync::mpsc;

use crate::crypto::sanitize_account_id;
use crate::mitigator::KeyGenerator;
use crate::system::SystemOps;

/// A child that exited this fast after launch is flapping; stop restarting.
const RESTART_WINDOW_SECS: u64 = 1;

/// Errors from supervision operations.
#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    /// Failed to spawn a child process.
    #[error("failed to spawn child '{name}': {message}")]
    SpawnFailed {
        /// Job name.
        name: String,
        /// Failure description.
        message: String,
    },
}

/// Notification that a supervised child exited.
#[derive(Debug)]
pub struct ChildExit {
    /// OS process id of the child.
    pub pid: i32,
    /// Its exit status.
    pub status: ExitStatus,
}

/// What the daemon loop must do after a child exit was handled.
#[derive(Debug)]
pub enum ExitAction {
    /// Nothing; the supervisor already did whatever was needed.
    None,
    /// Tear the daemon down.
    Shutdown,
    /// The key-generation worker finished; route its output to the session
    /// manager.
    KeygenDone {
        /// User the key was generated for.
        username: String,
        /// File holding the exported public key (on success).
        temp_key_file: PathBuf,
        /// Whether the worker exited cleanly.
        success: bool,
    },
}

/// A supervised child job.
#[derive(Debug)]
pub struct ChildJob {
    /// Job name, for logs and stats files.
    pub name: String,
    argv: Vec<String>,
    extra_args: Vec<String>,
    policy_args: Vec<String>,
    session_user: Option<String>,
    user_flags: HashMap<String, Vec<String>>,
    desired_uid: Option<u32>,
    never_kill: bool,
    is_browser: bool,
    pid: Option<i32>,
    last_start: u64,
}

impl ChildJob {
    /// Create a job from its command line.
    #[must_use]
    pub fn new(name: impl Into<String>, argv: Vec<String>) -> Self {
        Self {
            name: name.into(),
            argv,
            extra_args: Vec::new(),
            policy_args: Vec::new(),
            session_user: None,
            user_flags: HashMap::new(),
            desired_uid: None,
            never_kill: false,
            is_browser: false,
            pid: None,
            last_start: 0,
        }
    }

    /// Mark this job as the user-facing browser.
    #[must_use]
    pub fn browser(mut self) -> Self {
        self.is_browser = true;
        self
    }

    /// Run the child as `uid`.
    #[must_use]
    pub const fn with_uid(mut self, uid: u32) -> Self {
        self.desired_uid = Some(uid);
        self
    }

    /// Never signal this child during teardown.
    #[must_use]
    pub const fn never_kill(mut self) -> Self {
        self.never_kill = true;
        self
    }

    /// Pid of the running child, if any.
    #[must_use]
    pub const fn pid(&self) -> Option<i32> {
        self.pid
    }

    /// Whether restart attempts should stop: the child died inside the
    /// flapping window after its last launch.
    fn should_stop(&self, now: u64) -> bool {
        now.saturating_sub(self.last_start) < RESTART_WINDOW_SECS
    }

    fn build_argv(&self) -> Vec<String> {
        let mut argv = self.argv.clone();
        argv.extend(self.policy_args.iter().cloned());
        if let Some(user) = &self.session_user {
            argv.push(format!("--login-user={user}"));
            if let Some(flags) = self.user_flags.get(user) {
                argv.extend(flags.iter().cloned());
            }
        }
        argv.extend(self.extra_args.iter().cloned());
        argv
    }
}

/// Paths and identity for the key-generation worker child.
#[derive(Debug, Clone)]
pub struct KeygenSpec {
    /// Worker binary.
    pub binary: PathBuf,
    /// Root of per-user home directories.
    pub home_root: PathBuf,
    /// Uid to run the worker as.
    pub uid: Option<u32>,
}

#[derive(Debug)]
struct KeygenChild {
    pid: i32,
    username: String,
    temp_key_file: PathBuf,
}

/// The child supervisor.
pub struct ChildSupervisor {
    jobs: Vec<ChildJob>,
    keygen: Option<KeygenChild>,
    keygen_spec: KeygenSpec,
    exit_tx: mpsc::UnboundedSender<ChildExit>,
    gate_file: Option<PathBuf>,
    stats_dir: PathBuf,
    kill_timeout: Duration,
    shutting_down: bool,
    exit_when_done: bool,
    session_started: bool,
    system: Arc<dyn SystemOps>,
}

impl ChildSupervisor {
    /// Create a supervisor over `jobs`. Exit notifications are delivered on
    /// the paired receiver.
    pub fn new(
        jobs: Vec<ChildJob>,
        keygen_spec: KeygenSpec,
        gate_file: Option<PathBuf>,
        kill_timeout: Duration,
        system: Arc<dyn SystemOps>,
    ) -> (Self, mpsc::UnboundedReceiver<ChildExit>) {
        let (exit_tx, exit_rx) = mpsc::unbounded_channel();
        (
            Self {
                jobs,
                keygen: None,
                keygen_spec,
                exit_tx,
                gate_file,
                stats_dir: PathBuf::from("/tmp"),
                kill_timeout,
                shutting_down: false,
                exit_when_done: false,
                session_started: false,
                system,
            },
            exit_rx,
        )
    }

    /// Redirect launch-stat snapshots (tests).
    pub fn set_stats_dir(&mut self, dir: impl Into<PathBuf>) {
        self.stats_dir = dir.into();
    }

    /// Whether children should be running at all: the gate file, when
    /// configured and present, suppresses them.
    #[must_use]
    pub fn should_run_children(&self) -> bool {
        self.gate_file
            .as_ref()
            .map_or(true, |gate| !self.system.exists(gate))
    }

    /// Launch every job (used at startup).
    ///
    /// # Errors
    ///
    /// Returns the first spawn failure.
    pub fn run_children(&mut self) -> Result<(), SupervisorError> {
        for index in 0..self.jobs.len() {
            self.record_launch_stats(index);
            self.spawn_job(index)?;
        }
        Ok(())
    }

    /// Arm exit-when-idle: once no children remain, the daemon may leave.
    pub fn allow_graceful_exit(&mut self) -> ExitAction {
        self.exit_when_done = true;
        if self.running_pids().is_empty() && self.keygen.is_none() {
            ExitAction::Shutdown
        } else {
            ExitAction::None
        }
    }

    /// Whether the browser job currently runs under `pid`.
    #[must_use]
    pub fn is_browser(&self, pid: i32) -> bool {
        self.jobs
            .iter()
            .any(|job| job.is_browser && job.pid == Some(pid))
    }

    /// Record the active session user on the browser job.
    pub fn set_browser_session(&mut self, username: &str) {
        self.session_started = true;
        for job in &mut self.jobs {
            if job.is_browser {
                job.session_user = Some(username.to_string());
            }
        }
    }

    /// Stash per-user flags applied on the next browser restart.
    pub fn set_flags_for_user(&mut self, username: &str, flags: Vec<String>) {
        for job in &mut self.jobs {
            if job.is_browser {
                job.user_flags.insert(username.to_string(), flags.clone());
            }
        }
    }

    /// Drop all stashed per-user flags.
    pub fn clear_user_flags(&mut self) {
        for job in &mut self.jobs {
            job.user_flags.clear();
        }
    }

    /// Install policy-provided startup flags on the browser job.
    pub fn set_browser_policy_args(&mut self, args: Vec<String>) {
        for job in &mut self.jobs {
            if job.is_browser {
                job.policy_args = args.clone();
            }
        }
    }

    /// Kill the running browser immediately and relaunch it. `args` replaces
    /// the whole argument vector, or only the extra arguments when
    /// `args_are_extra` is set.
    ///
    /// # Errors
    ///
    /// Returns the spawn failure, with the old child already gone.
    pub fn restart_browser_with_args(
        &mut self,
        args: Vec<String>,
        args_are_extra: bool,
    ) -> Result<(), SupervisorError> {
        let Some(index) = self.jobs.iter().position(|job| job.is_browser) else {
            return Ok(());
        };
        if let Some(pid) = self.jobs[index].pid.take() {
            let uid = self.jobs[index].desired_uid.unwrap_or_else(nix_uid);
            let _ = self.system.kill_as(-pid, uid, Signal::SIGKILL);
        }
        if args_are_extra {
            self.jobs[index].extra_args = args;
        } else {
            self.jobs[index].argv = args;
            self.jobs[index].extra_args.clear();
        }
        self.spawn_job(index)
    }

    /// Send SIGABRT to the running browser. The regular exit path restarts
    /// it if appropriate.
    pub fn abort_browser(&self) {
        for job in &self.jobs {
            if job.is_browser {
                if let Some(pid) = job.pid {
                    let uid = job.desired_uid.unwrap_or_else(nix_uid);
                    let _ = self.system.kill_as(pid, uid, Signal::SIGABRT);
                }
            }
        }
    }

    /// Fork the key-generation worker for `username`. At most one worker
    /// runs at a time.
    pub fn run_key_generator(&mut self, username: &str) -> bool {
        if self.keygen.is_some() {
            tracing::warn!("key generation already in progress");
            return false;
        }
        let temp_key_file = match self.system.unique_file_in_temp_dir() {
            Ok(path) => path,
            Err(err) => {
                tracing::error!(error = %err, "cannot stage key output file");
                return false;
            },
        };
        let homedir = self
            .keygen_spec
            .home_root
            .join(sanitize_account_id(username));

        let mut cmd = Command::new(&self.keygen_spec.binary);
        cmd.arg("--file")
            .arg(&temp_key_file)
            .arg("--homedir")
            .arg(&homedir);
        if let Some(uid) = self.keygen_spec.uid {
            cmd.uid(uid);
        }
        match self.spawn_command(cmd, "keygen") {
            Ok(pid) => {
                tracing::info!(user = username, pid, "key generation started");
                self.keygen = Some(KeygenChild {
                    pid,
                    username: username.to_string(),
                    temp_key_file,
                });
                true
            },
            Err(err) => {
                tracing::error!(error = %err, "failed to start key generation");
                false
            },
        }
    }

    /// Handle a child exit: sweep descendants, then decide between restart,
    /// daemon shutdown, and graceful exit. `screen_locked` is the session
    /// manager's current lock state.
    pub fn handle_child_exit(&mut self, exit: &ChildExit, screen_locked: bool) -> ExitAction {
        // Sweep any descendants the child left behind.
        let _ = self.system.kill_as(-exit.pid, nix_uid(), Signal::SIGKILL);

        if let Some(keygen) = self.keygen.take() {
            if keygen.pid == exit.pid {
                let success = exit.status.success();
                tracing::info!(user = %keygen.username, success, "key generation finished");
                return ExitAction::KeygenDone {
                    username: keygen.username,
                    temp_key_file: keygen.temp_key_file,
                    success,
                };
            }
            self.keygen = Some(keygen);
        }

        if self.shutting_down {
            return ExitAction::None;
        }

        let Some(index) = self.jobs.iter().position(|job| job.pid == Some(exit.pid)) else {
            tracing::error!(pid = exit.pid, "exit from an unknown child");
            return ExitAction::None;
        };
        self.jobs[index].pid = None;
        tracing::warn!(
            name = %self.jobs[index].name,
            pid = exit.pid,
            status = ?exit.status,
            "child exited"
        );

        if screen_locked && self.jobs[index].is_browser {
            tracing::error!("browser died while the screen was locked, shutting down");
            return ExitAction::Shutdown;
        }
        if self.jobs[index].should_stop(self.system.unix_time()) {
            tracing::warn!(name = %self.jobs[index].name, "child is flapping, shutting down");
            return ExitAction::Shutdown;
        }
        if self.should_run_children() {
            tracing::info!(name = %self.jobs[index].name, "restarting child");
            if let Err(err) = self.spawn_job(index) {
                tracing::error!(error = %err, "restart failed");
                return ExitAction::Shutdown;
            }
            return ExitAction::None;
        }
        self.allow_graceful_exit()
    }

    /// Enter shutdown: signal every killable child's process group and
    /// return the pids whose exits must be awaited. SIGTERM once a session
    /// has run, SIGKILL otherwise.
    pub fn begin_shutdown(&mut self) -> Vec<i32> {
        self.shutting_down = true;

        let mut waiting: Vec<i32> = Vec::new();
        let signal = if self.session_started {
            Signal::SIGTERM
        } else {
            Signal::SIGKILL
        };
        for job in &mut self.jobs {
            if job.never_kill {
                continue;
            }
            let Some(pid) = job.pid.take() else { continue };
            let uid = job.desired_uid.unwrap_or_else(nix_uid);
            let _ = self.system.kill_as(-pid, uid, signal);
            waiting.push(pid);
        }
        if let Some(keygen) = self.keygen.take() {
            let _ = self.system.kill_as(
                -keygen.pid,
                self.keygen_spec.uid.unwrap_or_else(nix_uid),
                signal,
            );
            waiting.push(keygen.pid);
        }
        waiting
    }

    /// Configured per-child kill timeout.
    #[must_use]
    pub const fn kill_timeout(&self) -> Duration {
        self.kill_timeout
    }

    /// SIGABRT children that ignored the shutdown signal.
    pub fn abort_stragglers(&self, pids: &[i32]) {
        for &pid in pids {
            tracing::warn!(pid, "child ignored shutdown signal, aborting it");
            let _ = self.system.kill_as(-pid, nix_uid(), Signal::SIGABRT);
        }
    }

    /// Pids of all currently running children.
    #[must_use]
    pub fn running_pids(&self) -> Vec<i32> {
        self.jobs.iter().filter_map(|job| job.pid).collect()
    }

    fn spawn_job(&mut self, index: usize) -> Result<(), SupervisorError> {
        let job = &self.jobs[index];
        let argv = job.build_argv();
        if argv.is_empty() {
            return Err(SupervisorError::SpawnFailed {
                name: job.name.clone(),
                message: "empty command line".to_string(),
            });
        }
        let mut cmd = Command::new(&argv[0]);
        cmd.args(&argv[1..]);
        if let Some(uid) = job.desired_uid {
            cmd.uid(uid);
        }
        let name = job.name.clone();
        let pid = self.spawn_command(cmd, &name)?;
        tracing::info!(name = %name, pid, "child started");
        let job = &mut self.jobs[index];
        job.pid = Some(pid);
        job.last_start = self.system.unix_time();
        Ok(())
    }

    fn spawn_command(&self, mut cmd: Command, name: &str) -> Result<i32, SupervisorError> {
        cmd.kill_on_drop(false);
        // New session so the whole descendant tree is addressable as -pid.
        unsafe {
            cmd.pre_exec(|| {
                nix::unistd::setsid().map_err(std::io::Error::from)?;
                Ok(())
            });
        }
        let mut child = cmd.spawn().map_err(|e| SupervisorError::SpawnFailed {
            name: name.to_string(),
            message: e.to_string(),
        })?;
        let pid = child.id().ok_or_else(|| SupervisorError::SpawnFailed {
            name: name.to_string(),
            message: "child has no pid".to_string(),
        })?;
        #[allow(clippy::cast_possible_wrap)]
        let pid = pid as i32;

        let exit_tx = self.exit_tx.clone();
        tokio::spawn(async move {
            match child.wait().await {
                Ok(status) => {
                    let _ = exit_tx.send(ChildExit { pid, status });
                },
                Err(err) => {
                    tracing::error!(pid, error = %err, "failed to reap child");
                },
            }
        });
        Ok(pid)
    }

    /// First-launch uptime/disk snapshots, best effort.
    fn record_launch_stats(&self, index: usize) {
        const PROC_UPTIME: &str = "/proc/uptime";
        const DISK_STAT: &str = "/sys/block/sda/stat";

        let name = &self.jobs[index].name;
        for (prefix, source) in [("uptime", PROC_UPTIME), ("disk", DISK_STAT)] {
            let target = self.stats_dir.join(format!("{prefix}-{name}-exec"));
            if self.system.exists(&target) {
                continue;
            }
            match self.system.read_file(Path::new(source)) {
                Ok(data) => {
                    if let Err(err) = self.system.atomic_write(&target, &data) {
                        tracing::debug!(error = %err, "could not record launch stats");
                    }
                },
                Err(err) => tracing::debug!(error = %err, "could not read {source}"),
            }
        }
    }
}

impl std::fmt::Debug for ChildSupervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChildSupervisor")
            .field("jobs", &self.jobs.len())
            .field("shutting_down", &self.shutting_down)
            .finish_non_exhaustive()
    }
}

fn nix_uid() -> u32 {
    nix::unistd::getuid().as_raw()
}

/// Drive the full termination pipeline: signal every child, wait out the
/// kill timeout on the exit channel, escalate to SIGABRT for stragglers.
pub async fn shutdown_children(
    supervisor: &Arc<Mutex<ChildSupervisor>>,
    exits: &mut mpsc::UnboundedReceiver<ChildExit>,
) {
    let (mut waiting, timeout) = {
        let mut sup = supervisor.lock().unwrap();
        (sup.begin_shutdown(), sup.kill_timeout())
    };

    let deadline = tokio::time::Instant::now() + timeout;
    while !waiting.is_empty() {
        let Ok(received) = tokio::time::timeout_at(deadline, exits.recv()).await else {
            break;
        };
        match received {
            Some(exit) => waiting.retain(|&pid| pid != exit.pid),
            None => break,
        }
    }
    if !waiting.is_empty() {
        supervisor.lock().unwrap().abort_stragglers(&waiting);
    }
}

/// Narrow process-management capability handed to the session manager and
/// the liveness checker instead of the supervisor itself.
pub trait ProcessManager: Send + Sync {
    /// Whether `pid` is the running browser.
    fn is_browser(&self, pid: i32) -> bool;

    /// Kill and relaunch the browser with new arguments.
    fn restart_browser_with_args(&self, args: Vec<String>, args_are_extra: bool) -> bool;

    /// Record the active session user on the browser job.
    fn set_browser_session(&self, username: &str);

    /// Stash per-user flags for the next browser restart.
    fn set_flags_for_user(&self, username: &str, flags: Vec<String>);

    /// Start the key-generation worker for `username`.
    fn run_key_generator(&self, username: &str) -> bool;

    /// Ask the daemon to shut down gracefully.
    fn schedule_shutdown(&self);

    /// SIGABRT the browser (liveness escalation).
    fn abort_browser(&self);
}

/// Shared handle over the supervisor implementing [`ProcessManager`] and
/// [`KeyGenerator`].
#[derive(Clone)]
pub struct SupervisorHandle {
    inner: Arc<Mutex<ChildSupervisor>>,
    shutdown: Arc<Notify>,
}

impl SupervisorHandle {
    /// Wrap a supervisor. `shutdown` is notified when any component asks the
    /// daemon to stop.
    pub fn new(inner: Arc<Mutex<ChildSupervisor>>, shutdown: Arc<Notify>) -> Self {
        Self { inner, shutdown }
    }

    /// The wrapped supervisor.
    #[must_use]
    pub fn supervisor(&self) -> Arc<Mutex<ChildSupervisor>> {
        Arc::clone(&self.inner)
    }
}

impl ProcessManager for SupervisorHandle {
    fn is_browser(&self, pid: i32) -> bool {
        self.inner.lock().unwrap().is_browser(pid)
    }

    fn restart_browser_with_args(&self, args: Vec<String>, args_are_extra: bool) -> bool {
        match self
            .inner
            .lock()
            .unwrap()
            .restart_browser_with_args(args, args_are_extra)
        {
            Ok(()) => true,
            Err(err) => {
                tracing::error!(error = %err, "browser restart failed");
                false
            },
        }
    }

    fn set_browser_session(&self, username: &str) {
        self.inner.lock().unwrap().set_browser_session(username);
    }

    fn set_flags_for_user(&self, username: &str, flags: Vec<String>) {
        self.inner.lock().unwrap().set_flags_for_user(username, flags);
    }

    fn run_key_generator(&self, username: &str) -> bool {
        self.inner.lock().unwrap().run_key_generator(username)
    }

    fn schedule_shutdown(&self) {
        self.inner.lock().unwrap().clear_user_flags();
        self.shutdown.notify_one();
    }

    fn abort_browser(&self) {
        self.inner.lock().unwrap().abort_browser();
    }
}

impl KeyGenerator for SupervisorHandle {
    fn start(&self, username: &str) -> bool {
        self.run_key_generator(username)
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;
    use crate::system::RealSystem;

    fn keygen_spec(dir: &TempDir) -> KeygenSpec {
        KeygenSpec {
            binary: PathBuf::from("/bin/true"),
            home_root: dir.path().join("home"),
            uid: None,
        }
    }

    fn supervisor(
        dir: &TempDir,
        jobs: Vec<ChildJob>,
    ) -> (ChildSupervisor, mpsc::UnboundedReceiver<ChildExit>) {
        let (mut sup, rx) = ChildSupervisor::new(
            jobs,
            keygen_spec(dir),
            None,
            Duration::from_secs(3),
            Arc::new(RealSystem::new()),
        );
        sup.set_stats_dir(dir.path());
        (sup, rx)
    }

    #[tokio::test]
    async fn spawned_child_reports_exit() {
        let dir = TempDir::new().unwrap();
        let job = ChildJob::new("noop", vec!["/bin/true".to_string()]);
        let (mut sup, mut rx) = supervisor(&dir, vec![job]);

        sup.run_children().unwrap();
        let pids = sup.running_pids();
        assert_eq!(pids.len(), 1);

        let exit = rx.recv().await.unwrap();
        assert_eq!(exit.pid, pids[0]);
        assert!(exit.status.success());
    }

    #[tokio::test]
    async fn browser_exit_under_lock_requests_shutdown() {
        let dir = TempDir::new().unwrap();
        let job = ChildJob::new("browser", vec!["/bin/true".to_string()]).browser();
        let (mut sup, mut rx) = supervisor(&dir, vec![job]);

        sup.run_children().unwrap();
        let exit = rx.recv().await.unwrap();

        assert!(matches!(
            sup.handle_child_exit(&exit, true),
            ExitAction::Shutdown
        ));
    }

    #[tokio::test]
    async fn flapping_child_requests_shutdown() {
        let dir = TempDir::new().unwrap();
        let job = ChildJob::new("browser", vec!["/bin/true".to_string()]).browser();
        let (mut sup, mut rx) = supervisor(&dir, vec![job]);

        sup.run_children().unwrap();
        let exit = rx.recv().await.unwrap();

        // /bin/true exits within the flapping window.
        assert!(matches!(
            sup.handle_child_exit(&exit, false),
            ExitAction::Shutdown
        ));
    }

    #[tokio::test]
    async fn keygen_exit_is_routed_with_its_output_file() {
        let dir = TempDir::new().unwrap();
        let (mut sup, mut rx) = supervisor(&dir, Vec::new());

        assert!(sup.run_key_generator("alice@x"));
        let exit = rx.recv().await.unwrap();

        match sup.handle_child_exit(&exit, false) {
            ExitAction::KeygenDone {
                username, success, ..
            } => {
                assert_eq!(username, "alice@x");
                assert!(success);
            },
            other => panic!("unexpected action: {other:?}"),
        }
    }

    #[tokio::test]
    async fn shutdown_children_reaps_or_escalates() {
        let dir = TempDir::new().unwrap();
        let job = ChildJob::new(
            "sleeper",
            vec!["/bin/sleep".to_string(), "30".to_string()],
        );
        let (mut sup, mut rx) = supervisor(&dir, vec![job]);
        sup.run_children().unwrap();
        sup.session_started = true;
        let sup = Arc::new(Mutex::new(sup));

        tokio::time::timeout(
            Duration::from_secs(10),
            shutdown_children(&sup, &mut rx),
        )
        .await
        .expect("shutdown should finish inside the kill timeout");
        assert!(sup.lock().unwrap().running_pids().is_empty());
    }

    #[tokio::test]
    async fn graceful_exit_waits_for_children() {
        let dir = TempDir::new().unwrap();
        let job = ChildJob::new("noop", vec!["/bin/true".to_string()]);
        let (mut sup, mut rx) = supervisor(&dir, vec![job]);

        sup.run_children().unwrap();
        assert!(matches!(sup.allow_graceful_exit(), ExitAction::None));

        let exit = rx.recv().await.unwrap();
        // Outside the flapping window, with the gate file present, the exit
        // arms graceful exit; no children remain so it resolves immediately.
        sup.jobs[0].last_start = 0;
        sup.gate_file = Some(dir.path().join("gate"));
        std::fs::write(dir.path().join("gate"), b"").unwrap();
        assert!(matches!(
            sup.handle_child_exit(&exit, false),
            ExitAction::Shutdown
        ));
    }

    #[test]
    fn build_argv_layers_policy_session_and_extra_args() {
        let mut job = ChildJob::new("browser", vec!["browser".to_string()]).browser();
        job.policy_args = vec!["--policy-switches-begin".to_string()];
        job.session_user = Some("alice@x".to_string());
        job.user_flags
            .insert("alice@x".to_string(), vec!["--fancy".to_string()]);
        job.extra_args = vec!["--testing-channel=chan".to_string()];

        assert_eq!(
            job.build_argv(),
            vec![
                "browser",
                "--policy-switches-begin",
                "--login-user=alice@x",
                "--fancy",
                "--testing-channel=chan",
            ]
        );
    }
}
