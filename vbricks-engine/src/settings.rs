//! Engine settings, constructed once at startup and shared by reference.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::Result;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Runtime directory for sockets, PID files, key files and disk overlays
    pub base_dir: PathBuf,
    /// Install directory of the VDE tools
    pub vde_dir: PathBuf,
    /// Install directory of qemu, kvm and qemu-img
    pub qemu_dir: PathBuf,
    /// Privilege elevation wrapper; `None` runs everything unprivileged
    pub sudo: Option<String>,
    /// Raise `LinkLoop` from `connected()` instead of returning false
    pub erroronloop: bool,
    pub console_attempts: u32,
    pub console_interval_ms: u64,
    pub recv_window_ms: u64,
    pub pidfile_attempts: u32,
    pub pidfile_interval_ms: u64,
    pub stop_timeout_ms: u64,
    pub watch_interval_ms: u64,
}

impl Default for Settings {
    fn default() -> Self {
        let base_dir = dirs::home_dir()
            .map(|home| home.join(".virtualbricks"))
            .unwrap_or_else(|| std::env::temp_dir().join("virtualbricks"));

        Self {
            base_dir,
            vde_dir: PathBuf::from("/usr/bin"),
            qemu_dir: PathBuf::from("/usr/bin"),
            sudo: Some("sudo".to_string()),
            erroronloop: false,
            console_attempts: 10,
            console_interval_ms: 200,
            recv_window_ms: 100,
            pidfile_attempts: 50,
            pidfile_interval_ms: 100,
            stop_timeout_ms: 5000,
            watch_interval_ms: 1000,
        }
    }
}

impl Settings {
    /// Load settings from a JSON file. Missing fields keep their defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        serde_json::from_str(&text).map_err(|e| crate::error::EngineError::Persistence {
            line: e.line(),
            reason: e.to_string(),
        })
    }

    /// Settings rooted in `base_dir` with elevation disabled and short
    /// timeouts. Used by tests and by sandboxed runs.
    pub fn unprivileged(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
            sudo: None,
            console_attempts: 3,
            console_interval_ms: 20,
            pidfile_attempts: 10,
            pidfile_interval_ms: 20,
            stop_timeout_ms: 2000,
            watch_interval_ms: 100,
            ..Self::default()
        }
    }

    pub fn vde_bin(&self, name: &str) -> PathBuf {
        self.vde_dir.join(name)
    }

    pub fn qemu_bin(&self, name: &str) -> PathBuf {
        self.qemu_dir.join(name)
    }

    /// Data socket of a brick (switch ports live here).
    pub fn sock_path(&self, brick: &str) -> PathBuf {
        self.base_dir.join(format!("{brick}.ctl"))
    }

    /// Management console socket of a brick.
    pub fn mgmt_path(&self, brick: &str) -> PathBuf {
        self.base_dir.join(format!("{brick}.mgmt"))
    }

    pub fn pidfile_path(&self, brick: &str) -> PathBuf {
        self.base_dir.join(format!("{brick}.pid"))
    }

    pub fn keyfile_path(&self, brick: &str) -> PathBuf {
        self.base_dir.join(format!("{brick}.key"))
    }

    pub fn console_interval(&self) -> Duration {
        Duration::from_millis(self.console_interval_ms)
    }

    pub fn recv_window(&self) -> Duration {
        Duration::from_millis(self.recv_window_ms)
    }

    pub fn pidfile_interval(&self) -> Duration {
        Duration::from_millis(self.pidfile_interval_ms)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }

    pub fn watch_interval(&self) -> Duration {
        Duration::from_millis(self.watch_interval_ms)
    }
}
