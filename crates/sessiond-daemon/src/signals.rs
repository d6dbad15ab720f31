//! Graceful-shutdown signal plumbing.
//!
//! SIGHUP, SIGINT, and SIGTERM get one shot at graceful shutdown: the
//! handler writes the signal number into a process-global self-pipe and
//! reinstalls `SIG_DFL`, so a second identical signal terminates the process
//! immediately. SIGUSR1 and SIGALRM are ignored. The pipe's file
//! descriptors are initialized exactly once and live until process exit.

use std::os::fd::{AsRawFd, OwnedFd};
use std::os::unix::io::IntoRawFd;
use std::sync::atomic::{AtomicI32, Ordering};

use anyhow::Context;
use nix::fcntl::OFlag;
use nix::sys::signal::{SaFlags, SigAction, SigHandler, SigSet, Signal, sigaction};
use tokio::io::Interest;
use tokio::io::unix::AsyncFd;

static SHUTDOWN_PIPE_WRITE_FD: AtomicI32 = AtomicI32::new(-1);

extern "C" fn graceful_shutdown_handler(signo: libc::c_int) {
    // One shot at graceful shutdown: restore the default disposition first.
    let action = SigAction::new(SigHandler::SigDfl, SaFlags::empty(), SigSet::empty());
    if let Ok(signal) = Signal::try_from(signo) {
        unsafe {
            let _ = sigaction(signal, &action);
        }
    }

    let fd = SHUTDOWN_PIPE_WRITE_FD.load(Ordering::SeqCst);
    if fd < 0 {
        return;
    }
    let bytes = signo.to_ne_bytes();
    let mut written = 0;
    while written < bytes.len() {
        // Only async-signal-safe calls from here on.
        let rv = unsafe {
            libc::write(
                fd,
                bytes.as_ptr().add(written).cast(),
                bytes.len() - written,
            )
        };
        if rv < 0 {
            if std::io::Error::last_os_error().kind() == std::io::ErrorKind::Interrupted {
                continue;
            }
            return;
        }
        #[allow(clippy::cast_sign_loss)]
        {
            written += rv as usize;
        }
    }
}

/// Read side of the shutdown self-pipe, integrated with the event loop.
pub struct ShutdownPipe {
    read: AsyncFd<OwnedFd>,
}

impl ShutdownPipe {
    /// Create the pipe and install all signal handlers. Call exactly once.
    ///
    /// # Errors
    ///
    /// Returns an error if the pipe or any handler cannot be installed.
    pub fn install() -> anyhow::Result<Self> {
        let (read, write) = nix::unistd::pipe2(OFlag::O_CLOEXEC | OFlag::O_NONBLOCK)
            .context("cannot create pipe")?;
        // The write end stays open for the whole process lifetime.
        SHUTDOWN_PIPE_WRITE_FD.store(write.into_raw_fd(), Ordering::SeqCst);

        let graceful = SigAction::new(
            SigHandler::Handler(graceful_shutdown_handler),
            SaFlags::SA_RESTART,
            SigSet::empty(),
        );
        let ignore = SigAction::new(SigHandler::SigIgn, SaFlags::empty(), SigSet::empty());
        unsafe {
            for signal in [Signal::SIGHUP, Signal::SIGINT, Signal::SIGTERM] {
                sigaction(signal, &graceful)
                    .with_context(|| format!("cannot install handler for {signal}"))?;
            }
            for signal in [Signal::SIGUSR1, Signal::SIGALRM] {
                sigaction(signal, &ignore)
                    .with_context(|| format!("cannot ignore {signal}"))?;
            }
        }

        let read = AsyncFd::with_interest(read, Interest::READABLE)
            .context("cannot register pipe with the event loop")?;
        Ok(Self { read })
    }

    /// Wait for a shutdown signal and return its number.
    pub async fn recv(&self) -> i32 {
        let mut buf = [0u8; 4];
        let mut filled = 0;
        loop {
            let mut guard = match self.read.readable().await {
                Ok(guard) => guard,
                Err(err) => {
                    tracing::error!(error = %err, "shutdown pipe poll failed");
                    return 0;
                },
            };
            match guard.try_io(|fd| {
                let rv = unsafe {
                    libc::read(
                        fd.as_raw_fd(),
                        buf[filled..].as_mut_ptr().cast(),
                        buf.len() - filled,
                    )
                };
                if rv < 0 {
                    Err(std::io::Error::last_os_error())
                } else {
                    #[allow(clippy::cast_sign_loss)]
                    Ok(rv as usize)
                }
            }) {
                Ok(Ok(n)) => {
                    filled += n;
                    if filled == buf.len() {
                        return i32::from_ne_bytes(buf);
                    }
                },
                Ok(Err(err)) => {
                    tracing::error!(error = %err, "shutdown pipe read failed");
                    return 0;
                },
                Err(_would_block) => {},
            }
        }
    }
}
