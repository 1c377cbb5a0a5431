//! In-memory hpctrl simulator.
//!
//! Reproduces the bus program's observable line behavior closely enough to
//! drive the whole choreography without spawning a process: known menu
//! commands are consumed silently, unknown lines echo the
//! `!unknown command <line>` sentinel (which is exactly what the ping probe
//! relies on), `CMD`/`.` bracket command mode, `q POIN?` answers with the
//! (optionally snapped) point count, and `MEASURE`/`M+` emit queued sweep
//! texts. Everything sent is recorded for assertions.

use crate::error::{AppResult, VnaError};
use crate::transport::{Transport, EXIT_COMMAND};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

#[derive(Default)]
struct MockState {
    pending: VecDeque<String>,
    sent: Vec<String>,
    sweeps: VecDeque<String>,
    selected_params: Vec<String>,
    last_points: u32,
    snapped_points: Option<u32>,
    points_reply: Option<String>,
    ping_reply: Option<String>,
    state_text: Option<String>,
    calib_text: Option<String>,
    fail_sends: bool,
    in_cmd: bool,
    autosweep: bool,
    restarts: usize,
}

impl MockState {
    fn push_lines(&mut self, text: &str) {
        for line in text.lines() {
            let line = line.trim_end();
            if !line.is_empty() {
                self.pending.push_back(line.to_string());
            }
        }
    }

    fn emit_sweep(&mut self) {
        let Some(sweep) = self.sweeps.pop_front() else {
            return;
        };
        for param in self.selected_params.clone() {
            self.pending.push_back(format!("!{} done", param));
        }
        self.push_lines(&sweep);
    }

    fn handle_menu_command(&mut self, line: &str) {
        let keyword = line.split_whitespace().next().unwrap_or("");
        match keyword {
            "CMD" => self.in_cmd = true,
            "CONNECT" | "DISCONNECT" | "FMT" | "FREQ" | "SETSTATE" | "SETCALIB" | "RESET"
            | "FACTRESET" | "FILE" | EXIT_COMMAND => {}
            "CLEAR" => self.selected_params.clear(),
            "S11" | "S12" | "S21" | "S22" => self.selected_params.push(keyword.to_string()),
            "ALL" => {
                self.selected_params = ["S11", "S12", "S21", "S22"]
                    .iter()
                    .map(|s| s.to_string())
                    .collect()
            }
            "GETSTATE" => {
                if let Some(text) = self.state_text.clone() {
                    self.push_lines(&text);
                }
            }
            "GETCALIB" => {
                if let Some(text) = self.calib_text.clone() {
                    self.push_lines(&text);
                }
            }
            "MEASURE" => self.emit_sweep(),
            "M+" => {
                self.autosweep = true;
                // The simulator has no clock; every queued sweep becomes
                // visible at once and the line-counted reads pace them out.
                while !self.sweeps.is_empty() {
                    self.emit_sweep();
                }
            }
            "M-" => self.autosweep = false,
            _ => {
                let reply = match (&self.ping_reply, line) {
                    (Some(reply), "ping") => reply.clone(),
                    _ => format!("!unknown command {}", line),
                };
                self.pending.push_back(reply);
            }
        }
    }

    fn handle_cmd_mode(&mut self, line: &str) {
        if line == "." {
            self.in_cmd = false;
        } else if let Some(rest) = line.strip_prefix("s POIN ") {
            if let Ok(points) = rest.trim().parse() {
                self.last_points = points;
            }
        } else if line.starts_with("q POIN") {
            let reply = match &self.points_reply {
                Some(text) => text.clone(),
                None => self.snapped_points.unwrap_or(self.last_points).to_string(),
            };
            self.pending.push_back(reply);
        }
        // Other raw commands (`s …`, `q …`, `a`, `b`, `?`) are accepted
        // silently here.
    }
}

/// Clonable handle; clones share the simulator state, so tests can keep one
/// and inspect it after the session has taken ownership of another.
#[derive(Clone, Default)]
pub struct MockTransport {
    state: Arc<Mutex<MockState>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Queues one sweep text for the next `MEASURE` (or `M+` batch). While
    /// a free-running `M+` acquisition is active the sweep is emitted right
    /// away, as the real device would.
    pub fn queue_sweep(&self, raw: &str) {
        let mut state = self.lock();
        state.sweeps.push_back(raw.to_string());
        if state.autosweep {
            state.emit_sweep();
        }
    }

    /// Overrides the reply given to the `ping` probe.
    pub fn set_ping_reply(&self, reply: &str) {
        self.lock().ping_reply = Some(reply.to_string());
    }

    /// Makes `q POIN?` report a device-snapped point count.
    pub fn set_snapped_points(&self, points: u32) {
        self.lock().snapped_points = Some(points);
    }

    /// Makes `q POIN?` answer with arbitrary text, numeric or not.
    pub fn set_points_reply(&self, reply: &str) {
        self.lock().points_reply = Some(reply.to_string());
    }

    pub fn set_state_text(&self, text: &str) {
        self.lock().state_text = Some(text.to_string());
    }

    pub fn set_calib_text(&self, text: &str) {
        self.lock().calib_text = Some(text.to_string());
    }

    /// Makes every subsequent send fail as if the child process died.
    pub fn set_fail_sends(&self, fail: bool) {
        self.lock().fail_sends = fail;
    }

    /// Every line sent so far, in order.
    pub fn sent(&self) -> Vec<String> {
        self.lock().sent.clone()
    }

    pub fn restarts(&self) -> usize {
        self.lock().restarts
    }

    /// Parameter selectors currently configured in the simulator.
    pub fn selected_params(&self) -> Vec<String> {
        self.lock().selected_params.clone()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn start(&mut self) -> AppResult<()> {
        Ok(())
    }

    async fn send(&mut self, line: &str) -> AppResult<()> {
        let mut state = self.lock();
        state.sent.push(line.to_string());

        if state.fail_sends {
            if line != EXIT_COMMAND {
                state.restarts += 1;
            }
            return Err(VnaError::TransportFailed(
                "mock: hpctrl process gone".to_string(),
            ));
        }

        if state.in_cmd {
            state.handle_cmd_mode(line);
        } else {
            state.handle_menu_command(line);
        }
        Ok(())
    }

    async fn receive(&mut self, _timeout: Duration, max_lines: usize) -> AppResult<String> {
        let mut state = self.lock();
        let mut collected = Vec::new();
        while collected.len() < max_lines {
            match state.pending.pop_front() {
                Some(line) => collected.push(line),
                None => break,
            }
        }
        if collected.is_empty() {
            return Err(VnaError::NoData);
        }
        Ok(collected.join("\n").trim().to_string())
    }

    async fn restart(&mut self) -> AppResult<()> {
        let mut state = self.lock();
        state.restarts += 1;
        state.pending.clear();
        state.in_cmd = false;
        state.autosweep = false;
        state.selected_params.clear();
        Ok(())
    }

    async fn shutdown(&mut self) -> AppResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_unknown_command_sentinel() {
        let mock = MockTransport::new();
        let mut transport = mock.clone();
        transport.send("ping").await.unwrap();
        let reply = transport
            .receive(Duration::from_millis(10), 1)
            .await
            .unwrap();
        assert_eq!(reply, "!unknown command ping");
    }

    #[tokio::test]
    async fn test_cmd_mode_points_readback() {
        let mock = MockTransport::new();
        let mut transport = mock.clone();
        transport.send("CMD").await.unwrap();
        transport.send("s POIN 200").await.unwrap();
        transport.send("q POIN?").await.unwrap();
        transport.send(".").await.unwrap();

        let reply = transport
            .receive(Duration::from_millis(10), 1)
            .await
            .unwrap();
        assert_eq!(reply, "200");

        // Back in the menu: unknown lines echo the sentinel again.
        transport.send("q POIN?").await.unwrap();
        let reply = transport
            .receive(Duration::from_millis(10), 1)
            .await
            .unwrap();
        assert_eq!(reply, "!unknown command q POIN?");
    }

    #[tokio::test]
    async fn test_empty_queue_is_no_data() {
        let mut transport = MockTransport::new();
        let err = transport.receive(Duration::from_millis(10), 1).await;
        assert!(matches!(err, Err(VnaError::NoData)));
    }
}
