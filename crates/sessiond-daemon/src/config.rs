//! Daemon configuration.
//!
//! Loaded from a TOML file; command-line flags override the file. Every
//! persisted-file path has its production default here so tests and
//! development setups can re-root the whole tree.

use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::Deserialize;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DaemonConfig {
    /// Daemon behavior knobs.
    pub daemon: DaemonSection,
    /// The supervised browser child.
    pub browser: BrowserConfig,
    /// Locations of persisted files.
    pub paths: PathsConfig,
}

impl DaemonConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("cannot read config file {}", path.display()))?;
        toml::from_str(&raw).with_context(|| format!("cannot parse {}", path.display()))
    }
}

/// Daemon behavior settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DaemonSection {
    /// Unix socket the method surface listens on.
    pub socket: PathBuf,
    /// Seconds to wait for a signalled child before escalating.
    pub kill_timeout_secs: u64,
    /// Seconds between browser liveness probes.
    pub liveness_interval_secs: u64,
    /// Abort the browser after an unanswered liveness probe.
    pub enable_liveness_abort: bool,
    /// If this file exists, children are not (re)started.
    pub gate_file: Option<PathBuf>,
    /// Path of the `initctl` binary used for init-system events.
    pub initctl: String,
}

impl Default for DaemonSection {
    fn default() -> Self {
        Self {
            socket: PathBuf::from("/run/sessiond/sessiond.sock"),
            kill_timeout_secs: 3,
            liveness_interval_secs: 60,
            enable_liveness_abort: true,
            gate_file: None,
            initctl: "/sbin/initctl".to_string(),
        }
    }
}

/// Browser child settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BrowserConfig {
    /// Command line of the browser child.
    pub command: Vec<String>,
    /// Uid to run the browser (and the key-generation worker) as.
    pub uid: Option<u32>,
}

impl Default for BrowserConfig {
    fn default() -> Self {
        Self {
            command: vec!["/opt/browser/browser".to_string()],
            uid: None,
        }
    }
}

/// Locations of every file the daemon persists or consults.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PathsConfig {
    /// Owner public key.
    pub owner_key_file: PathBuf,
    /// Device policy record.
    pub policy_file: PathBuf,
    /// Per-account policy tree for device-local accounts.
    pub device_local_accounts_dir: PathBuf,
    /// Marker recording a completed login on this boot.
    pub logged_in_flag: PathBuf,
    /// Factory-reset request file.
    pub reset_file: PathBuf,
    /// Serial-number recovery marker.
    pub serial_recovery_file: PathBuf,
    /// Root of per-user home directories.
    pub home_root: PathBuf,
    /// Key-generation worker binary.
    pub keygen_binary: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            owner_key_file: PathBuf::from("/var/lib/whitelist/pub"),
            policy_file: PathBuf::from("/var/lib/whitelist/policy"),
            device_local_accounts_dir: PathBuf::from("/var/lib/device_local_accounts"),
            logged_in_flag: PathBuf::from("/var/run/session_manager/logged_in"),
            reset_file: PathBuf::from("/mnt/stateful_partition/factory_install_reset"),
            serial_recovery_file: PathBuf::from("/var/lib/enterprise_serial_number_recovery"),
            home_root: PathBuf::from("/home/user"),
            keygen_binary: PathBuf::from("/usr/sbin/sessiond-keygen"),
        }
    }
}
