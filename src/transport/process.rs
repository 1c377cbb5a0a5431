//! Child-process transport speaking to `hpctrl -i` over pipes.

use crate::config::{HpctrlSettings, TimeoutSettings};
use crate::error::{AppResult, VnaError};
use crate::transport::{Transport, EXIT_COMMAND};
use async_trait::async_trait;
use log::{debug, warn};
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Owns the hpctrl child and its pipes.
///
/// A dedicated reader task continuously drains the child's stdout into a
/// line FIFO; [`Transport::receive`] pulls a known number of lines out of it
/// under a deadline. The hpctrl response length is not self-delimiting in
/// general, so every caller must know how many lines its command produces.
pub struct HpctrlTransport {
    program: PathBuf,
    args: Vec<String>,
    settle: Duration,
    respawn: Duration,
    child: Option<Child>,
    stdin: Option<ChildStdin>,
    lines: Option<mpsc::UnboundedReceiver<String>>,
    reader: Option<JoinHandle<()>>,
}

impl HpctrlTransport {
    pub fn new(hpctrl: &HpctrlSettings, timeouts: &TimeoutSettings) -> Self {
        Self {
            program: hpctrl.program.clone(),
            args: hpctrl.args.clone(),
            settle: timeouts.settle,
            respawn: timeouts.respawn,
            child: None,
            stdin: None,
            lines: None,
            reader: None,
        }
    }

    fn running(&self) -> bool {
        self.child.is_some()
    }

    /// Raw write without the settle delay or the restart policy.
    async fn write_line(&mut self, line: &str) -> std::io::Result<()> {
        let stdin = self.stdin.as_mut().ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::BrokenPipe, "hpctrl stdin closed")
        })?;
        stdin.write_all(line.as_bytes()).await?;
        stdin.write_all(b"\n").await?;
        stdin.flush().await
    }

    async fn teardown(&mut self) {
        // Controlled shutdown first; the child may already be gone.
        let _ = self.write_line(EXIT_COMMAND).await;
        self.stdin = None;

        if let Some(handle) = self.reader.take() {
            handle.abort();
            let _ = handle.await;
        }
        if let Some(mut child) = self.child.take() {
            let _ = child.start_kill();
            let _ = child.wait().await;
        }
        // Discard the FIFO together with anything still queued in it.
        self.lines = None;
    }
}

#[async_trait]
impl Transport for HpctrlTransport {
    async fn start(&mut self) -> AppResult<()> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                VnaError::TransportFailed(format!(
                    "failed to launch {}: {}",
                    self.program.display(),
                    e
                ))
            })?;

        let stdin = child.stdin.take().ok_or_else(|| {
            VnaError::TransportFailed("hpctrl stdin pipe unavailable".to_string())
        })?;
        let stdout = child.stdout.take().ok_or_else(|| {
            VnaError::TransportFailed("hpctrl stdout pipe unavailable".to_string())
        })?;

        let (tx, rx) = mpsc::unbounded_channel();
        let reader = tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        let line = line.trim().to_string();
                        if line.is_empty() {
                            continue;
                        }
                        if tx.send(line).is_err() {
                            break;
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        warn!("hpctrl stdout read failed: {}", e);
                        break;
                    }
                }
            }
            debug!("hpctrl reader task finished");
        });

        debug!("hpctrl launched: {}", self.program.display());
        self.child = Some(child);
        self.stdin = Some(stdin);
        self.lines = Some(rx);
        self.reader = Some(reader);
        Ok(())
    }

    async fn send(&mut self, line: &str) -> AppResult<()> {
        if !self.running() {
            return Err(VnaError::TransportFailed(
                "hpctrl is not running".to_string(),
            ));
        }

        if let Err(e) = self.write_line(line).await {
            warn!("write to hpctrl failed ({}), process is gone", e);
            if line != EXIT_COMMAND {
                if let Err(restart_err) = self.restart().await {
                    warn!("hpctrl restart after write failure failed: {}", restart_err);
                }
            }
            return Err(VnaError::TransportFailed(format!(
                "write to hpctrl failed: {}",
                e
            )));
        }

        debug!("sent: {}", line);
        tokio::time::sleep(self.settle).await;
        Ok(())
    }

    async fn receive(&mut self, timeout: Duration, max_lines: usize) -> AppResult<String> {
        let rx = self
            .lines
            .as_mut()
            .ok_or_else(|| VnaError::TransportFailed("hpctrl is not running".to_string()))?;

        let deadline = Instant::now() + timeout;
        let mut collected: Vec<String> = Vec::new();
        let mut closed = false;

        while collected.len() < max_lines {
            match tokio::time::timeout_at(deadline, rx.recv()).await {
                Ok(Some(line)) => collected.push(line),
                Ok(None) => {
                    closed = true;
                    break;
                }
                Err(_) => break,
            }
        }

        if collected.is_empty() {
            if closed {
                return Err(VnaError::TransportFailed(
                    "hpctrl output stream closed".to_string(),
                ));
            }
            return Err(VnaError::NoData);
        }

        let text = collected.join("\n").trim().to_string();
        debug!("received {} line(s)", collected.len());
        Ok(text)
    }

    async fn restart(&mut self) -> AppResult<()> {
        warn!("restarting hpctrl");
        self.teardown().await;
        // Let OS resources settle before respawning; a single deliberate
        // delay, no backoff.
        tokio::time::sleep(self.respawn).await;
        self.start().await
    }

    async fn shutdown(&mut self) -> AppResult<()> {
        self.teardown().await;
        Ok(())
    }
}

impl Drop for HpctrlTransport {
    fn drop(&mut self) {
        if let Some(handle) = self.reader.take() {
            handle.abort();
        }
        // kill_on_drop takes care of the child itself.
    }
}
