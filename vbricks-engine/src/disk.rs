//! VM disk images and copy-on-write overlays.

use std::path::{Path, PathBuf};

use crate::process::HostCommand;
use crate::settings::Settings;

/// A disk attached to a VM slot (`hda`, `hdb`, ...).
///
/// With `cow` set the VM never writes to `base`: it boots from a private
/// qcow2 overlay in the runtime directory, synthesized on first use.
#[derive(Debug, Clone, PartialEq)]
pub struct VmDisk {
    slot: String,
    base: PathBuf,
    cow: bool,
}

impl VmDisk {
    pub fn new(slot: &str, base: impl Into<PathBuf>) -> Self {
        Self {
            slot: slot.to_string(),
            base: base.into(),
            cow: false,
        }
    }

    pub fn slot(&self) -> &str {
        &self.slot
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    pub fn cow(&self) -> bool {
        self.cow
    }

    pub fn set_cow(&mut self, cow: bool) {
        self.cow = cow;
    }

    pub fn is_empty(&self) -> bool {
        self.base.as_os_str().is_empty()
    }

    pub fn overlay_path(&self, owner: &str, dir: &Path) -> PathBuf {
        dir.join(format!("{owner}_{}.cow", self.slot))
    }

    /// Path handed to the VM: the overlay for private disks, the base image otherwise.
    pub fn effective_path(&self, owner: &str, dir: &Path) -> Option<PathBuf> {
        if self.is_empty() {
            None
        } else if self.cow {
            Some(self.overlay_path(owner, dir))
        } else {
            Some(self.base.clone())
        }
    }

    /// Command creating the overlay, if one is needed and missing.
    pub fn overlay_command(&self, owner: &str, settings: &Settings) -> Option<HostCommand> {
        if self.is_empty() || !self.cow {
            return None;
        }
        let overlay = self.overlay_path(owner, &settings.base_dir);
        if overlay.exists() {
            return None;
        }

        let base_format = match self.base.extension().and_then(|e| e.to_str()) {
            Some("qcow2") | Some("qcow") => "qcow2",
            _ => "raw",
        };

        Some(HostCommand::new(settings.qemu_bin("qemu-img")).args([
            "create".to_string(),
            "-f".to_string(),
            "qcow2".to_string(),
            "-b".to_string(),
            self.base.display().to_string(),
            "-F".to_string(),
            base_format.to_string(),
            overlay.display().to_string(),
        ]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_effective_path() {
        let dir = Path::new("/run/vb");
        let mut disk = VmDisk::new("hda", "/images/debian.qcow2");
        assert_eq!(
            disk.effective_path("vm1", dir),
            Some(PathBuf::from("/images/debian.qcow2"))
        );

        disk.set_cow(true);
        assert_eq!(
            disk.effective_path("vm1", dir),
            Some(PathBuf::from("/run/vb/vm1_hda.cow"))
        );

        assert_eq!(VmDisk::new("hdb", "").effective_path("vm1", dir), None);
    }

    #[test]
    fn test_overlay_command_only_when_missing() {
        let tmp = tempfile::TempDir::new().unwrap();
        let settings = Settings::unprivileged(tmp.path());

        let mut disk = VmDisk::new("hda", "/images/base.img");
        assert!(disk.overlay_command("vm1", &settings).is_none());

        disk.set_cow(true);
        let cmd = disk.overlay_command("vm1", &settings).unwrap();
        let argv = cmd.argv();
        assert!(argv[0].ends_with("qemu-img"));
        assert!(argv.windows(2).any(|w| w == ["-F", "raw"]));
        assert_eq!(
            argv.last().unwrap(),
            &tmp.path().join("vm1_hda.cow").display().to_string()
        );

        std::fs::write(tmp.path().join("vm1_hda.cow"), b"").unwrap();
        assert!(disk.overlay_command("vm1", &settings).is_none());
    }
}
