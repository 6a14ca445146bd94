//! Client for a brick's management console (unix stream socket).

use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::{EngineError, Result};

const MAX_RECV_WINDOWS: u32 = 20;
const MAX_REPLY_BYTES: usize = 64 * 1024;

#[derive(Debug)]
pub struct ManagementChannel {
    path: PathBuf,
    stream: UnixStream,
    recv_window: Duration,
}

impl ManagementChannel {
    /// Connect, retrying `attempts` times `interval` apart. Exhaustion is
    /// final: the caller logs it and carries on without a console.
    pub async fn open(
        path: &Path,
        attempts: u32,
        interval: Duration,
        recv_window: Duration,
    ) -> Result<Self> {
        for attempt in 1..=attempts {
            match UnixStream::connect(path).await {
                Ok(stream) => {
                    info!(path = %path.display(), attempt = attempt, "Connected to management console");
                    return Ok(Self {
                        path: path.to_path_buf(),
                        stream,
                        recv_window,
                    });
                }
                Err(e) => {
                    debug!(path = %path.display(), error = %e, "Console not ready yet, retrying...");
                    tokio::time::sleep(interval).await;
                }
            }
        }

        warn!(path = %path.display(), attempts = attempts, "Timeout waiting for management console");
        Err(EngineError::ConsoleUnavailable {
            path: path.to_path_buf(),
            attempts,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn send(&mut self, text: &str) -> Result<()> {
        debug!(path = %self.path.display(), text = %text.trim_end(), "Console send");
        self.stream.write_all(text.as_bytes()).await?;
        self.stream.flush().await?;
        Ok(())
    }

    /// Read everything that arrives until the line stays quiet for one
    /// receive window. A peer that never goes quiet is cut off after
    /// `MAX_RECV_WINDOWS` windows or `MAX_REPLY_BYTES` bytes.
    pub async fn recv(&mut self) -> Result<String> {
        let mut collected = Vec::new();
        let mut buf = [0u8; 4096];
        let deadline = Instant::now() + self.recv_window * MAX_RECV_WINDOWS;

        loop {
            let now = Instant::now();
            if now >= deadline || collected.len() >= MAX_REPLY_BYTES {
                warn!(path = %self.path.display(), bytes = collected.len(), "Console reply truncated");
                break;
            }
            let window = self.recv_window.min(deadline - now);
            match tokio::time::timeout(window, self.stream.read(&mut buf)).await {
                Ok(Ok(0)) => break,
                Ok(Ok(n)) => collected.extend_from_slice(&buf[..n]),
                Ok(Err(e)) => return Err(e.into()),
                Err(_) => break,
            }
        }

        Ok(String::from_utf8_lossy(&collected).into_owned())
    }

    /// Send one newline-terminated command and collect the reply.
    pub async fn request(&mut self, command: &str) -> Result<String> {
        let mut line = command.trim_end_matches('\n').to_string();
        line.push('\n');
        self.send(&line).await?;
        self.recv().await
    }

    pub async fn close(mut self) {
        if let Err(e) = self.stream.shutdown().await {
            debug!(path = %self.path.display(), error = %e, "Console shutdown failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncBufReadExt, BufReader};
    use tokio::net::UnixListener;

    use super::*;

    #[tokio::test]
    async fn test_request_round_trip() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("sw1.mgmt");
        let listener = UnixListener::bind(&path).unwrap();

        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (read, mut write) = stream.into_split();
            let mut lines = BufReader::new(read).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                write
                    .write_all(format!("0000 DATA END WITH '.'\n{line}\n.\n").as_bytes())
                    .await
                    .unwrap();
            }
        });

        let mut channel = ManagementChannel::open(
            &path,
            3,
            Duration::from_millis(10),
            Duration::from_millis(100),
        )
        .await
        .unwrap();

        let reply = channel.request("port/sethub 1").await.unwrap();
        assert!(reply.contains("port/sethub 1"));
        channel.close().await;
    }

    #[tokio::test]
    async fn test_recv_is_bounded_for_chatty_peer() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("vm1.mgmt");
        let listener = UnixListener::bind(&path).unwrap();

        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            loop {
                if stream.write_all(b"(qemu) spam\n").await.is_err() {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
        });

        let mut channel = ManagementChannel::open(
            &path,
            3,
            Duration::from_millis(10),
            Duration::from_millis(20),
        )
        .await
        .unwrap();

        let started = std::time::Instant::now();
        let reply = channel.recv().await.unwrap();
        assert!(started.elapsed() < Duration::from_secs(2));
        assert!(reply.starts_with("(qemu) spam"));
        channel.close().await;
    }

    #[tokio::test]
    async fn test_open_gives_up() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("missing.mgmt");

        let err = ManagementChannel::open(
            &path,
            2,
            Duration::from_millis(5),
            Duration::from_millis(10),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, EngineError::ConsoleUnavailable { attempts: 2, .. }));
    }
}
