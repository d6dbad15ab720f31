//! sessiond - privileged session-supervisor daemon.
//!
//! Owns the device ownership/policy state, supervises the user-facing
//! browser child, and runs the liveness checker. Everything executes on a
//! single-threaded cooperative event loop; forked children communicate only
//! through exit status and files at well-known paths.

mod config;
mod ipc;
mod signals;

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use sessiond_core::SessionManager;
use sessiond_core::bus::{
    InitctlEmitter, TracingBus, TracingMetrics, TracingPowerManager,
};
use sessiond_core::crypto::OwnerKeystore;
use sessiond_core::liveness::LivenessChecker;
use sessiond_core::mitigator::RegenMitigator;
use sessiond_core::policy::{
    DeviceLocalAccountService, DevicePolicyService, PolicyKey, PolicyService, PolicyStore,
    UserPolicyFactory,
};
use sessiond_core::session::SessionPaths;
use sessiond_core::supervisor::{
    ChildJob, ChildSupervisor, ExitAction, KeygenSpec, SupervisorHandle, shutdown_children,
};
use tokio::sync::Notify;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::config::DaemonConfig;
use crate::ipc::DispatchState;
use crate::signals::ShutdownPipe;

/// sessiond - session supervisor daemon
#[derive(Parser, Debug)]
#[command(name = "sessiond")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to the configuration file
    #[arg(short, long, default_value = "/etc/sessiond/sessiond.toml")]
    config: PathBuf,

    /// Unix socket for the method surface (overrides the config file)
    #[arg(long)]
    socket: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Log to file instead of stdout
    #[arg(long)]
    log_file: Option<PathBuf>,
}

fn main() -> Result<()> {
    let args = Args::parse();

    // Single-threaded cooperative loop: every component in the core runs on
    // it, so none of them contend on their locks.
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to create the main event loop")?;
    runtime.block_on(async_main(args))
}

#[allow(clippy::too_many_lines)]
async fn async_main(args: Args) -> Result<()> {
    init_tracing(&args)?;

    let config = if args.config.exists() {
        DaemonConfig::from_file(&args.config).context("failed to load configuration")?
    } else {
        info!("no config file at {:?}, using defaults", args.config);
        DaemonConfig::default()
    };
    let socket_path = args
        .socket
        .clone()
        .unwrap_or_else(|| config.daemon.socket.clone());

    // Capability seams. Production implementations all the way down; tests
    // substitute these at the core-crate level.
    let system: Arc<dyn sessiond_core::system::SystemOps> =
        Arc::new(sessiond_core::system::RealSystem::new());
    let crypto: Arc<dyn sessiond_core::crypto::Crypto> = Arc::new(OwnerKeystore::new());
    let bus: Arc<dyn sessiond_core::bus::SignalBus> = Arc::new(TracingBus);
    let init_emitter: Arc<dyn sessiond_core::bus::InitEmitter> =
        Arc::new(InitctlEmitter::new(config.daemon.initctl.clone()));
    let power: Arc<dyn sessiond_core::bus::PowerManager> = Arc::new(TracingPowerManager);
    let metrics: Arc<dyn sessiond_core::bus::Metrics> = Arc::new(TracingMetrics);

    // Child supervision.
    let mut browser = ChildJob::new("browser", config.browser.command.clone()).browser();
    if let Some(uid) = config.browser.uid {
        browser = browser.with_uid(uid);
    }
    let keygen_spec = KeygenSpec {
        binary: config.paths.keygen_binary.clone(),
        home_root: config.paths.home_root.clone(),
        uid: config.browser.uid,
    };
    let (supervisor, mut exit_rx) = ChildSupervisor::new(
        vec![browser],
        keygen_spec,
        config.daemon.gate_file.clone(),
        Duration::from_secs(config.daemon.kill_timeout_secs),
        Arc::clone(&system),
    );
    let supervisor = Arc::new(Mutex::new(supervisor));
    let shutdown = Arc::new(Notify::new());
    let handle = SupervisorHandle::new(Arc::clone(&supervisor), Arc::clone(&shutdown));

    // Ownership and policy.
    let owner_key = Arc::new(Mutex::new(PolicyKey::new(
        config.paths.owner_key_file.clone(),
        Arc::clone(&system),
        Arc::clone(&crypto),
    )));
    let device_store = Arc::new(Mutex::new(PolicyStore::new(
        config.paths.policy_file.clone(),
        Arc::clone(&system),
    )));
    let device_service = PolicyService::new(
        Arc::clone(&owner_key),
        device_store,
        Arc::clone(&crypto),
        Some(Arc::clone(&bus)),
    );
    let mitigator = Arc::new(RegenMitigator::new(Arc::new(handle.clone())));
    let device_policy = Arc::new(DevicePolicyService::new(
        device_service,
        mitigator,
        Arc::clone(&crypto),
        Arc::clone(&system),
        Arc::clone(&bus),
        Arc::clone(&metrics),
        config.paths.serial_recovery_file.clone(),
    ));
    device_policy
        .initialize()
        .context("device policy initialization failed")?;
    supervisor
        .lock()
        .unwrap()
        .set_browser_policy_args(device_policy.start_up_flags());

    let user_policy_factory = UserPolicyFactory::new(
        config.paths.home_root.clone(),
        Arc::clone(&system),
        Arc::clone(&crypto),
    );
    let device_local_accounts = DeviceLocalAccountService::new(
        config.paths.device_local_accounts_dir.clone(),
        owner_key,
        Arc::clone(&system),
    );

    let session = Arc::new(Mutex::new(SessionManager::new(
        Arc::clone(&device_policy),
        user_policy_factory,
        device_local_accounts,
        Arc::new(handle.clone()),
        Arc::clone(&bus),
        init_emitter,
        power,
        metrics,
        Arc::clone(&system),
        Arc::clone(&crypto),
        SessionPaths {
            logged_in_flag: config.paths.logged_in_flag.clone(),
            reset_file: config.paths.reset_file.clone(),
        },
    )));

    let liveness = Arc::new(LivenessChecker::new(
        Arc::new(handle.clone()),
        Arc::clone(&bus),
        Duration::from_secs(config.daemon.liveness_interval_secs),
        config.daemon.enable_liveness_abort,
    ));

    // The self-pipe must exist before any child can run.
    let pipe = ShutdownPipe::install().context("failed to install signal handlers")?;

    let mut run_loop = true;
    {
        let mut sup = supervisor.lock().unwrap();
        if sup.should_run_children() {
            sup.run_children().context("failed to start children")?;
            liveness.start();
        } else {
            info!("gate file present, not running children");
            if matches!(sup.allow_graceful_exit(), ExitAction::Shutdown) {
                run_loop = false;
            }
        }
    }

    let ipc_state = DispatchState {
        session: Arc::clone(&session),
        liveness: Arc::clone(&liveness),
    };
    let ipc_socket = socket_path.clone();
    let ipc_task = tokio::spawn(async move {
        if let Err(e) = ipc::run(&ipc_socket, ipc_state).await {
            error!("method surface error: {e}");
        }
    });

    info!(pid = std::process::id(), socket = ?socket_path, "sessiond started");

    while run_loop {
        tokio::select! {
            signo = pipe.recv() => {
                info!(signo, "received shutdown signal");
                break;
            }
            () = shutdown.notified() => {
                info!("shutdown scheduled");
                break;
            }
            Some(exit) = exit_rx.recv() => {
                let screen_locked = session.lock().unwrap().screen_locked();
                let action = supervisor
                    .lock()
                    .unwrap()
                    .handle_child_exit(&exit, screen_locked);
                match action {
                    ExitAction::None => {},
                    ExitAction::Shutdown => break,
                    ExitAction::KeygenDone { username, temp_key_file, success } => {
                        session.lock().unwrap().handle_keygen_exit(
                            &username,
                            &temp_key_file,
                            success,
                        );
                    },
                }
            }
        }
    }

    // Teardown: announce, terminate children, drain deferred persists.
    liveness.stop();
    ipc_task.abort();
    session.lock().unwrap().announce_stopping();
    shutdown_children(&supervisor, &mut exit_rx).await;
    session.lock().unwrap().finalize();
    session.lock().unwrap().announce_stopped();
    if socket_path.exists() {
        if let Err(e) = std::fs::remove_file(&socket_path) {
            warn!("failed to remove socket: {e}");
        }
    }
    info!("sessiond exiting");
    Ok(())
}

fn init_tracing(args: &Args) -> Result<()> {
    let filter = EnvFilter::try_new(&args.log_level).unwrap_or_else(|_| EnvFilter::new("info"));

    if let Some(log_file) = &args.log_file {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_file)
            .context("failed to open log file")?;
        tracing_subscriber::registry()
            .with(filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .with_writer(file)
                    .with_ansi(false),
            )
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
    Ok(())
}
