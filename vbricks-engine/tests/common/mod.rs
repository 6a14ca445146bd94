#![allow(dead_code)]

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use tempfile::TempDir;
use vbricks_engine::Settings;

/// Write an executable shell script standing in for a host binary.
pub fn fake_bin(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

/// Long-running stand-in that ignores its arguments.
pub const SLEEPER: &str = "exec sleep 30";

/// Writes its own PID to the file following `--pidfile`, then sleeps.
pub const PIDFILE_WRITER: &str = r#"while [ $# -gt 0 ]; do
  if [ "$1" = "--pidfile" ]; then echo $$ > "$2"; fi
  shift
done
exec sleep 30"#;

pub struct Sandbox {
    pub dir: TempDir,
    pub bin: PathBuf,
    pub run: PathBuf,
}

impl Sandbox {
    pub fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let bin = dir.path().join("bin");
        let run = dir.path().join("run");
        std::fs::create_dir_all(&bin).unwrap();
        std::fs::create_dir_all(&run).unwrap();
        for name in [
            "vde_switch",
            "dpipe",
            "vde_plug",
            "wirefilter",
            "vde_cryptcab",
            "qemu-system-x86_64",
        ] {
            fake_bin(&bin, name, SLEEPER);
        }
        Self { dir, bin, run }
    }

    pub fn settings(&self) -> Settings {
        let mut settings = Settings::unprivileged(&self.run);
        settings.vde_dir = self.bin.clone();
        settings.qemu_dir = self.bin.clone();
        settings
    }
}
