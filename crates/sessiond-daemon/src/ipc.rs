//! Remote method surface.
//!
//! A thin transport adapter: length-prefixed JSON requests over a Unix
//! socket, dispatched onto the session manager. The core never sees this
//! layer; errors cross it as `(kind, message)` pairs.

use std::path::Path;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sessiond_core::SessionManager;
use sessiond_core::error::{Error, ErrorKind};
use sessiond_core::liveness::LivenessChecker;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

/// Maximum request/response size (64 KiB of policy plus framing slack).
const MAX_MESSAGE_SIZE: usize = 256 * 1024;

/// State shared with every connection handler.
#[derive(Clone)]
pub struct DispatchState {
    /// The session manager.
    pub session: Arc<Mutex<SessionManager>>,
    /// The liveness checker (for confirmations).
    pub liveness: Arc<LivenessChecker>,
}

/// A remote method call.
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "method", content = "params", rename_all = "snake_case")]
pub enum Request {
    /// Emit the `login-prompt-ready` init event.
    EmitLoginPromptReady,
    /// Emit the `login-prompt-visible` init event and broadcast.
    EmitLoginPromptVisible,
    /// Set up the browser testing channel.
    EnableBrowserTesting {
        /// Relaunch even if already enabled.
        force_relaunch: bool,
        /// Extra browser arguments.
        extra_args: Vec<String>,
    },
    /// Start a user session.
    StartSession {
        /// User email address.
        email: String,
    },
    /// Stop all sessions (schedules daemon shutdown).
    StopSession,
    /// Store the device policy blob.
    StorePolicy {
        /// Serialized policy envelope.
        blob: Vec<u8>,
    },
    /// Retrieve the device policy blob.
    RetrievePolicy,
    /// Store a user policy blob.
    StorePolicyForUser {
        /// User email address.
        email: String,
        /// Serialized policy envelope.
        blob: Vec<u8>,
    },
    /// Retrieve a user policy blob.
    RetrievePolicyForUser {
        /// User email address.
        email: String,
    },
    /// Store a device-local account policy blob.
    StoreDeviceLocalAccountPolicy {
        /// Account identifier.
        account_id: String,
        /// Serialized policy envelope.
        blob: Vec<u8>,
    },
    /// Retrieve a device-local account policy blob.
    RetrieveDeviceLocalAccountPolicy {
        /// Account identifier.
        account_id: String,
    },
    /// Current session state string.
    RetrieveSessionState,
    /// Active sessions as email-to-sanitized-name pairs.
    RetrieveActiveSessions,
    /// Request the lock screen.
    LockScreen,
    /// The lock screen is now visible.
    HandleLockScreenShown,
    /// The lock screen was dismissed.
    HandleLockScreenDismissed,
    /// The browser answered a liveness ping.
    HandleLivenessConfirmed,
    /// Restart the browser with new arguments.
    RestartJob {
        /// Pid the caller believes is the browser.
        pid: i32,
        /// Replacement command line, shell-quoted.
        args: String,
    },
    /// Cookie-authenticated restart.
    RestartJobWithAuth {
        /// Pid the caller believes is the browser.
        pid: i32,
        /// Process auth cookie.
        cookie: String,
        /// Replacement command line, shell-quoted.
        args: String,
    },
    /// Arm a factory reset and restart.
    StartDeviceWipe,
    /// Stash per-user browser flags.
    SetFlagsForUser {
        /// User email address.
        email: String,
        /// Flags for the next in-session restart.
        flags: Vec<String>,
    },
}

/// Reply to a [`Request`].
#[derive(Debug, Serialize, Deserialize)]
pub struct Response {
    /// Whether the call succeeded.
    pub done: bool,
    /// Method-specific payload.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<serde_json::Value>,
    /// Failure, when `done` is false.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<Error>,
}

impl Response {
    fn done() -> Self {
        Self {
            done: true,
            value: None,
            error: None,
        }
    }

    fn value(value: impl Serialize) -> Self {
        match serde_json::to_value(value) {
            Ok(value) => Self {
                done: true,
                value: Some(value),
                error: None,
            },
            Err(e) => Self::failure(Error::new(ErrorKind::EncodeFail, e.to_string())),
        }
    }

    fn failure(error: Error) -> Self {
        Self {
            done: false,
            value: None,
            error: Some(error),
        }
    }

    fn from_result<T: Serialize>(result: Result<T, Error>) -> Self {
        match result {
            Ok(value) => Self::value(value),
            Err(error) => Self::failure(error),
        }
    }
}

/// Handle one request.
pub async fn dispatch(request: Request, state: &DispatchState) -> Response {
    match request {
        Request::EmitLoginPromptReady => {
            Response::from_result(state.session.lock().unwrap().emit_login_prompt_ready())
        },
        Request::EmitLoginPromptVisible => {
            Response::from_result(state.session.lock().unwrap().emit_login_prompt_visible())
        },
        Request::EnableBrowserTesting {
            force_relaunch,
            extra_args,
        } => {
            let result = state
                .session
                .lock()
                .unwrap()
                .enable_browser_testing(force_relaunch, extra_args);
            Response::from_result(result.map(|path| path.display().to_string()))
        },
        Request::StartSession { email } => {
            Response::from_result(state.session.lock().unwrap().start_session(&email, ""))
        },
        Request::StopSession => {
            state.session.lock().unwrap().stop_session("");
            Response::done()
        },
        Request::StorePolicy { blob } => {
            let rx = {
                let (tx, rx) = oneshot::channel();
                state.session.lock().unwrap().store_policy(&blob, tx);
                rx
            };
            await_ack(rx).await
        },
        Request::RetrievePolicy => {
            Response::value(state.session.lock().unwrap().retrieve_policy())
        },
        Request::StorePolicyForUser { email, blob } => {
            let rx = {
                let (tx, rx) = oneshot::channel();
                state
                    .session
                    .lock()
                    .unwrap()
                    .store_policy_for_user(&email, &blob, tx);
                rx
            };
            await_ack(rx).await
        },
        Request::RetrievePolicyForUser { email } => {
            Response::from_result(state.session.lock().unwrap().retrieve_policy_for_user(&email))
        },
        Request::StoreDeviceLocalAccountPolicy { account_id, blob } => {
            let rx = {
                let (tx, rx) = oneshot::channel();
                state
                    .session
                    .lock()
                    .unwrap()
                    .store_device_local_account_policy(&account_id, &blob, tx);
                rx
            };
            await_ack(rx).await
        },
        Request::RetrieveDeviceLocalAccountPolicy { account_id } => Response::value(
            state
                .session
                .lock()
                .unwrap()
                .retrieve_device_local_account_policy(&account_id),
        ),
        Request::RetrieveSessionState => {
            Response::value(state.session.lock().unwrap().retrieve_session_state())
        },
        Request::RetrieveActiveSessions => {
            Response::value(state.session.lock().unwrap().retrieve_active_sessions())
        },
        Request::LockScreen => {
            if state.session.lock().unwrap().lock_screen() {
                Response::done()
            } else {
                Response {
                    done: false,
                    value: None,
                    error: None,
                }
            }
        },
        Request::HandleLockScreenShown => {
            state.session.lock().unwrap().handle_lock_screen_shown();
            Response::done()
        },
        Request::HandleLockScreenDismissed => {
            state.session.lock().unwrap().handle_lock_screen_dismissed();
            Response::done()
        },
        Request::HandleLivenessConfirmed => {
            state.liveness.handle_confirmed();
            Response::done()
        },
        Request::RestartJob { pid, args } => {
            Response::from_result(state.session.lock().unwrap().restart_job(pid, &args))
        },
        Request::RestartJobWithAuth { pid, cookie, args } => Response::from_result(
            state
                .session
                .lock()
                .unwrap()
                .restart_job_with_auth(pid, &cookie, &args),
        ),
        Request::StartDeviceWipe => {
            Response::from_result(state.session.lock().unwrap().start_device_wipe())
        },
        Request::SetFlagsForUser { email, flags } => {
            state.session.lock().unwrap().set_flags_for_user(&email, flags);
            Response::done()
        },
    }
}

async fn await_ack(rx: oneshot::Receiver<Result<(), Error>>) -> Response {
    match rx.await {
        Ok(Ok(())) => Response::done(),
        Ok(Err(error)) => Response::failure(error),
        Err(_) => Response::failure(Error::new(
            ErrorKind::Io,
            "policy acknowledgement was dropped",
        )),
    }
}

/// Run the method-surface server until the task is cancelled.
///
/// # Errors
///
/// Returns an error if the socket cannot be bound.
pub async fn run(socket_path: &Path, state: DispatchState) -> Result<()> {
    if socket_path.exists() {
        std::fs::remove_file(socket_path).context("failed to remove stale socket")?;
    }
    if let Some(parent) = socket_path.parent() {
        std::fs::create_dir_all(parent).context("failed to create socket directory")?;
    }

    let listener = UnixListener::bind(socket_path).context("failed to bind Unix socket")?;
    info!("method surface listening on {:?}", socket_path);

    loop {
        match listener.accept().await {
            Ok((stream, _addr)) => {
                let state = state.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(stream, state).await {
                        debug!("connection handler error: {e}");
                    }
                });
            },
            Err(e) => error!("failed to accept connection: {e}"),
        }
    }
}

async fn handle_connection(mut stream: UnixStream, state: DispatchState) -> Result<()> {
    debug!("new method-surface connection");
    loop {
        let request = match read_request(&mut stream).await {
            Ok(Some(request)) => request,
            Ok(None) => {
                debug!("connection closed");
                break;
            },
            Err(e) => {
                warn!("failed to read request: {e}");
                break;
            },
        };

        debug!(?request, "dispatching request");
        let response = dispatch(request, &state).await;

        if let Err(e) = send_response(&mut stream, &response).await {
            warn!("failed to send response: {e}");
            break;
        }
    }
    Ok(())
}

async fn read_request(stream: &mut UnixStream) -> Result<Option<Request>> {
    let mut len_buf = [0u8; 4];
    match stream.read_exact(&mut len_buf).await {
        Ok(_) => {},
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_MESSAGE_SIZE {
        anyhow::bail!("request of {len} bytes exceeds maximum");
    }
    let mut payload = vec![0u8; len];
    stream.read_exact(&mut payload).await?;
    serde_json::from_slice(&payload)
        .map(Some)
        .context("malformed request")
}

async fn send_response(stream: &mut UnixStream, response: &Response) -> Result<()> {
    let payload = serde_json::to_vec(response)?;
    let len = u32::try_from(payload.len()).context("response too large")?;
    stream.write_all(&len.to_be_bytes()).await?;
    stream.write_all(&payload).await?;
    stream.flush().await?;
    Ok(())
}
