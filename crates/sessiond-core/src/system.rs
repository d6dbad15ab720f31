//! System capability surface.
//!
//! Everything the daemon asks of the operating system that is worth mocking
//! goes through [`SystemOps`]: atomic file writes, existence/size checks,
//! signal delivery, wall-clock time, and random bytes. Production code uses
//! [`RealSystem`]; tests substitute their own implementations.

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use nix::sys::signal::Signal;
use nix::unistd::Pid;
use rand::RngCore;

/// Upper bound for any file the daemon reads whole. Policy blobs stay well
/// under 64 KiB and key blobs under 16 KiB; anything larger is hostile.
pub const MAX_SAFE_FILE_SIZE: u64 = 64 * 1024;

/// Errors from system capability operations.
#[derive(Debug, thiserror::Error)]
pub enum SystemError {
    /// File exceeds the safe read ceiling.
    #[error("file too large: {size} bytes exceeds maximum of {max} bytes")]
    FileTooLarge {
        /// Actual size in bytes.
        size: u64,
        /// Allowed maximum in bytes.
        max: u64,
    },

    /// The target path has no parent directory to stage a temp file in.
    #[error("path has no parent directory: {}", path.display())]
    NoParentDirectory {
        /// Path with no parent.
        path: PathBuf,
    },

    /// Signal delivery failed.
    #[error("failed to send signal {signal} to {pid}: {source}")]
    SignalFailed {
        /// Target process id (negative for a process group).
        pid: i32,
        /// Signal that was being sent.
        signal: Signal,
        /// Underlying errno.
        source: nix::Error,
    },

    /// An I/O error occurred.
    #[error("I/O error during {context}: {source}")]
    Io {
        /// Operation that failed.
        context: String,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },
}

impl SystemError {
    fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }
}

/// Narrow, mockable interface to the operating system.
pub trait SystemOps: Send + Sync {
    /// Write `data` to `path` atomically (temp file + fsync + rename).
    fn atomic_write(&self, path: &Path, data: &[u8]) -> Result<(), SystemError>;

    /// Whether `path` exists.
    fn exists(&self, path: &Path) -> bool;

    /// Size of the file at `path`, enforcing [`MAX_SAFE_FILE_SIZE`].
    fn safe_file_size(&self, path: &Path) -> Result<u64, SystemError>;

    /// Read the whole file at `path`, enforcing [`MAX_SAFE_FILE_SIZE`].
    fn read_file(&self, path: &Path) -> Result<Vec<u8>, SystemError>;

    /// Remove the file at `path`. Returns `Ok(false)` if it was not there.
    fn remove_file(&self, path: &Path) -> Result<bool, SystemError>;

    /// Send `signal` to `pid` on behalf of `as_uid`.
    ///
    /// A negative `pid` targets the process group, as with `kill(2)`.
    fn kill_as(&self, pid: i32, as_uid: u32, signal: Signal) -> Result<(), SystemError>;

    /// Seconds since the Unix epoch.
    fn unix_time(&self) -> u64;

    /// Fill `buf` with cryptographically secure random bytes.
    fn random_bytes(&self, buf: &mut [u8]);

    /// Create a unique, empty file in a fresh write-only temp directory and
    /// return its path. Used for the browser testing channel.
    fn unique_file_in_temp_dir(&self) -> Result<PathBuf, SystemError>;
}

/// Production [`SystemOps`] implementation.
#[derive(Debug, Default)]
pub struct RealSystem;

impl RealSystem {
    /// Create a production system handle.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

impl SystemOps for RealSystem {
    fn atomic_write(&self, path: &Path, data: &[u8]) -> Result<(), SystemError> {
        let parent = path
            .parent()
            .ok_or_else(|| SystemError::NoParentDirectory {
                path: path.to_path_buf(),
            })?;

        if !parent.exists() {
            fs::create_dir_all(parent)
                .map_err(|e| SystemError::io("create parent directory", e))?;
        }

        // Temp file in the same directory so the rename stays on one
        // filesystem and is atomic.
        let mut tmp = tempfile::NamedTempFile::new_in(parent)
            .map_err(|e| SystemError::io("create temp file", e))?;
        tmp.write_all(data)
            .map_err(|e| SystemError::io("write temp file", e))?;
        tmp.flush()
            .map_err(|e| SystemError::io("flush temp file", e))?;
        tmp.as_file()
            .sync_all()
            .map_err(|e| SystemError::io("fsync temp file", e))?;
        tmp.persist(path)
            .map_err(|e| SystemError::io("rename to final path", e.error))?;

        // fsync the directory so the rename itself is durable.
        if let Ok(dir) = File::open(parent) {
            let _ = dir.sync_all();
        }
        Ok(())
    }

    fn exists(&self, path: &Path) -> bool {
        path.exists()
    }

    fn safe_file_size(&self, path: &Path) -> Result<u64, SystemError> {
        let size = fs::metadata(path)
            .map_err(|e| SystemError::io("stat file", e))?
            .len();
        if size > MAX_SAFE_FILE_SIZE {
            return Err(SystemError::FileTooLarge {
                size,
                max: MAX_SAFE_FILE_SIZE,
            });
        }
        Ok(size)
    }

    fn read_file(&self, path: &Path) -> Result<Vec<u8>, SystemError> {
        self.safe_file_size(path)?;
        fs::read(path).map_err(|e| SystemError::io("read file", e))
    }

    fn remove_file(&self, path: &Path) -> Result<bool, SystemError> {
        match fs::remove_file(path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(SystemError::io("remove file", e)),
        }
    }

    fn kill_as(&self, pid: i32, as_uid: u32, signal: Signal) -> Result<(), SystemError> {
        tracing::debug!(pid, as_uid, %signal, "sending signal");
        nix::sys::signal::kill(Pid::from_raw(pid), signal).map_err(|source| {
            SystemError::SignalFailed {
                pid,
                signal,
                source,
            }
        })
    }

    fn unix_time(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0)
    }

    fn random_bytes(&self, buf: &mut [u8]) {
        rand::thread_rng().fill_bytes(buf);
    }

    fn unique_file_in_temp_dir(&self) -> Result<PathBuf, SystemError> {
        let dir = tempfile::Builder::new()
            .prefix("sessiond-testing-")
            .tempdir()
            .map_err(|e| SystemError::io("create temp dir", e))?
            // Leak the directory on purpose; the channel file must outlive
            // this call and is cleaned up on replacement.
            .into_path();
        let file = tempfile::Builder::new()
            .prefix("channel-")
            .keep(true)
            .tempfile_in(&dir)
            .map_err(|e| SystemError::io("create temp file", e))?;
        Ok(file.path().to_path_buf())
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    #[test]
    fn atomic_write_creates_file_with_contents() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("sub").join("target");
        let sys = RealSystem::new();

        sys.atomic_write(&path, b"payload").unwrap();

        assert_eq!(fs::read(&path).unwrap(), b"payload");
    }

    #[test]
    fn atomic_write_replaces_existing_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("target");
        let sys = RealSystem::new();

        sys.atomic_write(&path, b"old").unwrap();
        sys.atomic_write(&path, b"new").unwrap();

        assert_eq!(fs::read(&path).unwrap(), b"new");
    }

    #[test]
    fn safe_file_size_rejects_oversized_files() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("big");
        fs::write(&path, vec![0u8; (MAX_SAFE_FILE_SIZE + 1) as usize]).unwrap();

        let sys = RealSystem::new();
        assert!(matches!(
            sys.safe_file_size(&path),
            Err(SystemError::FileTooLarge { .. })
        ));
    }

    #[test]
    fn remove_file_reports_absence() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("gone");
        let sys = RealSystem::new();

        assert!(!sys.remove_file(&path).unwrap());

        fs::write(&path, b"x").unwrap();
        assert!(sys.remove_file(&path).unwrap());
        assert!(!path.exists());
    }

    #[test]
    fn random_bytes_are_not_constant() {
        let sys = RealSystem::new();
        let mut a = [0u8; 16];
        let mut b = [0u8; 16];
        sys.random_bytes(&mut a);
        sys.random_bytes(&mut b);
        assert_ne!(a, b);
    }

    #[test]
    fn unique_file_in_temp_dir_exists() {
        let sys = RealSystem::new();
        let path = sys.unique_file_in_temp_dir().unwrap();
        assert!(path.exists());
        let _ = fs::remove_file(&path);
    }
}
