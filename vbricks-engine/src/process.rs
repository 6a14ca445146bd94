//! External processes: one-shot host commands and long-running brick processes.

use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use nix::errno::Errno;
use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tracing::{debug, error, info, warn};

use crate::error::{EngineError, Result};
use crate::settings::Settings;

/// A short-lived helper command (`ip`, `dhclient`, `qemu-img`, ...) run to
/// completion around a brick's lifecycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostCommand {
    program: PathBuf,
    args: Vec<String>,
    elevated: bool,
}

impl HostCommand {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            elevated: false,
        }
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Run through the privilege wrapper when one is configured.
    pub fn elevated(mut self) -> Self {
        self.elevated = true;
        self
    }

    pub fn is_elevated(&self) -> bool {
        self.elevated
    }

    /// Program followed by its arguments, without any wrapper.
    pub fn argv(&self) -> Vec<String> {
        std::iter::once(self.program.display().to_string())
            .chain(self.args.iter().cloned())
            .collect()
    }

    pub async fn run(&self, settings: &Settings) -> Result<()> {
        self.run_wrapped(settings.sudo.as_deref()).await
    }

    async fn run_wrapped(&self, wrapper: Option<&str>) -> Result<()> {
        let mut cmd = match (wrapper, self.elevated) {
            (Some(wrapper), true) => {
                let mut cmd = Command::new(wrapper);
                cmd.arg(&self.program);
                cmd
            }
            _ => Command::new(&self.program),
        };
        cmd.args(&self.args).stdin(Stdio::null());

        debug!(cmd = ?self.argv(), elevated = self.elevated, "Running host command");
        let output = cmd.output().await?;
        if output.status.success() {
            Ok(())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            Err(EngineError::Process(format!(
                "{} exited with {}: {}",
                self.program.display(),
                output.status,
                stderr.trim()
            )))
        }
    }
}

/// Privilege wrapper details for an elevated start.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Elevation {
    pub wrapper: String,
    pub pidfile: PathBuf,
    pub pidfile_flag: &'static str,
}

/// Fully resolved invocation of a brick process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Launch {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub elevation: Option<Elevation>,
}

impl Launch {
    /// The command line exactly as executed, wrapper included.
    pub fn argv(&self) -> Vec<String> {
        let mut argv = Vec::with_capacity(self.args.len() + 4);
        if let Some(elevation) = &self.elevation {
            argv.push(elevation.wrapper.clone());
        }
        argv.push(self.program.display().to_string());
        argv.extend(self.args.iter().cloned());
        if let Some(elevation) = &self.elevation {
            argv.push(elevation.pidfile_flag.to_string());
            argv.push(elevation.pidfile.display().to_string());
        }
        argv
    }
}

/// A running brick process.
#[derive(Debug)]
pub struct BrickProcess {
    brick: String,
    child: Child,
    // Held open: some VDE tools exit when stdin closes
    stdin: Option<ChildStdin>,
    pid: Option<u32>,
    elevation: Option<Elevation>,
}

impl BrickProcess {
    pub async fn spawn(brick: &str, launch: &Launch, settings: &Settings) -> Result<Self> {
        let argv = launch.argv();
        let Some((program, args)) = argv.split_first() else {
            return Err(EngineError::Process(format!("Empty command line for {brick}")));
        };

        if let Some(elevation) = &launch.elevation {
            // A stale file would hand us the previous run's PID
            match tokio::fs::remove_file(&elevation.pidfile).await {
                Ok(()) => debug!(brick = %brick, "Removed stale PID file"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }

        info!(brick = %brick, cmd = ?argv, "Spawning brick process");

        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        if let Some(stdout) = child.stdout.take() {
            drain_output(brick.to_string(), "stdout", stdout);
        }
        if let Some(stderr) = child.stderr.take() {
            drain_output(brick.to_string(), "stderr", stderr);
        }

        let mut stdin = child.stdin.take();
        if let Some(pipe) = stdin.as_mut() {
            if let Err(e) = pipe.write_all(b"\n").await {
                warn!(brick = %brick, error = %e, "Failed to write to process stdin");
            }
        }

        let pid = match &launch.elevation {
            Some(elevation) => {
                wait_pidfile(brick, elevation, settings.pidfile_attempts, settings.pidfile_interval())
                    .await
            }
            None => child.id(),
        };

        info!(brick = %brick, pid = ?pid, "Brick process started");

        Ok(Self {
            brick: brick.to_string(),
            child,
            stdin,
            pid,
            elevation: launch.elevation.clone(),
        })
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn is_elevated(&self) -> bool {
        self.elevation.is_some()
    }

    /// Non-blocking exit check.
    pub fn try_exited(&mut self) -> Result<Option<ExitStatus>> {
        Ok(self.child.try_wait()?)
    }

    /// Deliver SIGTERM and wait for exit, escalating to SIGKILL after the stop
    /// timeout. The wait always happens, even when signalling failed.
    pub async fn terminate(mut self, settings: &Settings) -> Result<()> {
        let signalled = self.signal(Signal::SIGTERM).await;
        if let Err(e) = &signalled {
            warn!(brick = %self.brick, error = %e, "Failed to signal process");
        }

        match tokio::time::timeout(settings.stop_timeout(), self.child.wait()).await {
            Ok(Ok(status)) => {
                info!(brick = %self.brick, status = ?status, "Brick process exited");
            }
            Ok(Err(e)) => {
                error!(brick = %self.brick, error = %e, "Failed to wait for process");
            }
            Err(_) => {
                warn!(brick = %self.brick, "Timeout waiting for process exit, killing");
                if self.is_elevated() {
                    let _ = self.signal(Signal::SIGKILL).await;
                }
                self.child.kill().await?;
            }
        }

        drop(self.stdin.take());
        if let Some(elevation) = &self.elevation {
            let _ = tokio::fs::remove_file(&elevation.pidfile).await;
        }
        signalled
    }

    async fn signal(&mut self, signal: Signal) -> Result<()> {
        match (self.pid.and_then(target), &self.elevation) {
            (Some(pid), Some(elevation)) => match kill(pid, signal) {
                Ok(()) | Err(Errno::ESRCH) => Ok(()),
                Err(Errno::EPERM) => {
                    HostCommand::new("kill")
                        .args([
                            format!("-{}", signal.as_str().trim_start_matches("SIG")),
                            pid.to_string(),
                        ])
                        .elevated()
                        .run_wrapped(Some(&elevation.wrapper))
                        .await
                }
                Err(e) => Err(e.into()),
            },
            (Some(pid), None) => match kill(pid, signal) {
                Ok(()) | Err(Errno::ESRCH) => Ok(()),
                Err(e) => Err(e.into()),
            },
            (None, _) => {
                self.child.start_kill()?;
                Ok(())
            }
        }
    }
}

/// A PID that names exactly one process. Zero and anything past `i32::MAX`
/// would make `kill` address a process group or every process.
fn parse_pid(content: &str) -> Option<u32> {
    content
        .parse::<i32>()
        .ok()
        .filter(|pid| *pid > 0)
        .map(|pid| pid as u32)
}

fn target(pid: u32) -> Option<Pid> {
    i32::try_from(pid).ok().filter(|pid| *pid > 0).map(Pid::from_raw)
}

/// Poll the PID file an elevated process writes. Gives up after `attempts`.
async fn wait_pidfile(
    brick: &str,
    elevation: &Elevation,
    attempts: u32,
    interval: Duration,
) -> Option<u32> {
    for _ in 0..attempts {
        if let Ok(content) = tokio::fs::read_to_string(&elevation.pidfile).await {
            let content = content.trim();
            if !content.is_empty() {
                let pid = parse_pid(content);
                if pid.is_none() {
                    error!(
                        brick = %brick,
                        pidfile = %elevation.pidfile.display(),
                        content = %content,
                        "Invalid PID file"
                    );
                }
                return pid;
            }
        }
        tokio::time::sleep(interval).await;
    }
    error!(
        brick = %brick,
        pidfile = %elevation.pidfile.display(),
        attempts = attempts,
        "PID file never appeared"
    );
    None
}

fn drain_output<R>(brick: String, stream: &'static str, reader: R)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            debug!(brick = %brick, stream = stream, "{}", line);
        }
    });
}

/// Whether a process with `pid` exists. A process owned by another user
/// counts as alive.
pub fn is_process_alive(pid: u32) -> bool {
    target(pid).is_some_and(|pid| matches!(kill(pid, None), Ok(()) | Err(Errno::EPERM)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_launch_argv_with_elevation() {
        let launch = Launch {
            program: PathBuf::from("/usr/bin/vde_plug2tap"),
            args: vec!["-s".to_string(), "/run/vb/sw1.ctl".to_string()],
            elevation: Some(Elevation {
                wrapper: "sudo".to_string(),
                pidfile: PathBuf::from("/run/vb/tap0.pid"),
                pidfile_flag: "--pidfile",
            }),
        };
        assert_eq!(
            launch.argv(),
            vec![
                "sudo",
                "/usr/bin/vde_plug2tap",
                "-s",
                "/run/vb/sw1.ctl",
                "--pidfile",
                "/run/vb/tap0.pid"
            ]
        );
    }

    #[tokio::test]
    async fn test_host_command_reports_failure() {
        let settings = Settings::unprivileged("/tmp");
        HostCommand::new("true").run(&settings).await.unwrap();
        let err = HostCommand::new("false").run(&settings).await.unwrap_err();
        assert!(matches!(err, EngineError::Process(_)));
    }

    #[tokio::test]
    async fn test_spawn_and_terminate() {
        let settings = Settings::unprivileged("/tmp");
        let launch = Launch {
            program: PathBuf::from("sleep"),
            args: vec!["30".to_string()],
            elevation: None,
        };

        let mut process = BrickProcess::spawn("sleeper", &launch, &settings)
            .await
            .unwrap();
        let pid = process.pid().unwrap();
        assert!(is_process_alive(pid));
        assert!(process.try_exited().unwrap().is_none());

        process.terminate(&settings).await.unwrap();
        assert!(!is_process_alive(pid));
    }

    #[tokio::test]
    async fn test_missing_pidfile_leaves_pid_unknown() {
        let dir = tempfile::TempDir::new().unwrap();
        let settings = Settings::unprivileged(dir.path());
        let launch = Launch {
            program: PathBuf::from("sleep"),
            args: vec!["30".to_string()],
            elevation: Some(Elevation {
                wrapper: "env".to_string(),
                pidfile: dir.path().join("never.pid"),
                pidfile_flag: "--pidfile",
            }),
        };

        // `env sleep 30 --pidfile ...` fails fast; no PID file is written
        let process = BrickProcess::spawn("ghost", &launch, &settings).await.unwrap();
        assert_eq!(process.pid(), None);
        let _ = process.terminate(&settings).await;
    }

    #[test]
    fn test_parse_pid_rejects_group_targets() {
        assert_eq!(parse_pid("4242"), Some(4242));
        assert_eq!(parse_pid("0"), None);
        assert_eq!(parse_pid("-1"), None);
        assert_eq!(parse_pid("4294967295"), None);
        assert_eq!(parse_pid("12ab"), None);
        assert!(!is_process_alive(0));
        assert!(!is_process_alive(u32::MAX));
    }

    #[tokio::test]
    async fn test_zero_in_pidfile_leaves_pid_unknown() {
        let dir = tempfile::TempDir::new().unwrap();
        let settings = Settings::unprivileged(dir.path());
        // `sh -c <script> sh --pidfile <path>`
        let launch = Launch {
            program: PathBuf::from("-c"),
            args: vec![r#"echo 0 > "$2"; exec sleep 30"#.to_string(), "sh".to_string()],
            elevation: Some(Elevation {
                wrapper: "sh".to_string(),
                pidfile: dir.path().join("zero.pid"),
                pidfile_flag: "--pidfile",
            }),
        };

        let process = BrickProcess::spawn("zero", &launch, &settings).await.unwrap();
        assert_eq!(process.pid(), None);
        // Falls back to killing the direct child
        process.terminate(&settings).await.unwrap();
    }
}
