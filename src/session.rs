//! Instrument session: connection state machine and command choreography.
//!
//! `VnaSession` owns the transport and is the only place device commands are
//! assembled. All of its methods must be called from the task serializer
//! worker; the front end never touches the session directly.
//!
//! Operation results encode the tri-state contract of the session layer:
//! `Ok` on success; `Err(NotConnected)` (and input/parse rejects) leaves the
//! connection state untouched and is recoverable; `Err(TransportFailed)` or
//! `Err(ProtocolDesync)` means the transport died, the session has already
//! fallen back to Disconnected, and the caller must refresh to the
//! disconnected state.

use crate::config::{Settings, TimeoutSettings};
use crate::error::{AppResult, VnaError};
use crate::measurement::SParam;
use crate::transport::Transport;
use log::{debug, info, warn};

/// Probe command; hpctrl does not know it, so the reply is deterministic.
pub const PING_COMMAND: &str = "ping";
/// The sentinel hpctrl echoes for the probe.
pub const PING_SENTINEL: &str = "!unknown command ping";

/// Line budget for a raw terminal reply.
const TERMINAL_REPLY_LINES: usize = 8;
/// Line budget for state/calibration dumps.
const DUMP_LINES: usize = 4096;

/// Connection state of the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connected,
    /// Connected, with hpctrl in direct command mode (`CMD` … `.`).
    CommandMode,
}

pub struct VnaSession {
    transport: Box<dyn Transport>,
    state: ConnectionState,
    address: Option<u8>,
    timeouts: TimeoutSettings,
    max_header_lines: usize,
}

impl VnaSession {
    /// Wraps a transport. Timeout calibration constants are fixed at
    /// construction; the per-run sweep configuration arrives with each call.
    pub fn new(transport: Box<dyn Transport>, settings: &Settings) -> Self {
        Self {
            transport,
            state: ConnectionState::Disconnected,
            address: None,
            timeouts: settings.timeouts.clone(),
            max_header_lines: settings.hpctrl.max_header_lines,
        }
    }

    /// Launches the transport. Fatal if the bus program cannot be found.
    pub async fn start(&mut self) -> AppResult<()> {
        self.transport.start().await
    }

    pub async fn shutdown(&mut self) -> AppResult<()> {
        let _ = self.disconnect().await;
        self.transport.shutdown().await
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state != ConnectionState::Disconnected
    }

    pub fn address(&self) -> Option<u8> {
        self.address
    }

    /// Sends one line; a transport failure drops the session to
    /// Disconnected before the error propagates.
    async fn send(&mut self, line: &str) -> AppResult<()> {
        match self.transport.send(line).await {
            Ok(()) => Ok(()),
            Err(e) => {
                self.state = ConnectionState::Disconnected;
                self.address = None;
                Err(e)
            }
        }
    }

    async fn receive(
        &mut self,
        timeout: std::time::Duration,
        max_lines: usize,
    ) -> AppResult<String> {
        match self.transport.receive(timeout, max_lines).await {
            Ok(text) => Ok(text),
            Err(VnaError::NoData) => Err(VnaError::NoData),
            Err(e) => {
                self.state = ConnectionState::Disconnected;
                self.address = None;
                Err(e)
            }
        }
    }

    /// Forced teardown after a protocol desync: the session is already
    /// useless, so restart the transport and report Disconnected.
    async fn force_restart(&mut self) {
        self.state = ConnectionState::Disconnected;
        self.address = None;
        if let Err(e) = self.transport.restart().await {
            warn!("transport restart failed: {}", e);
        }
    }

    /// Health probe: `ping` must echo the unknown-command sentinel within
    /// the ping timeout. Any other outcome restarts the transport.
    pub async fn ping(&mut self) -> AppResult<()> {
        self.send(PING_COMMAND).await?;
        match self.receive(self.timeouts.ping, 1).await {
            Ok(reply) if reply == PING_SENTINEL => Ok(()),
            Ok(reply) => {
                warn!("ping sentinel mismatch: {:?}", reply);
                self.force_restart().await;
                Err(VnaError::ProtocolDesync {
                    expected: PING_SENTINEL.to_string(),
                    got: reply,
                })
            }
            Err(VnaError::NoData) => {
                warn!("ping probe got no reply");
                self.force_restart().await;
                Err(VnaError::ProtocolDesync {
                    expected: PING_SENTINEL.to_string(),
                    got: "(no reply)".to_string(),
                })
            }
            Err(e) => Err(e),
        }
    }

    /// Connects to the analyzer and verifies the link with the ping probe.
    /// On success a one-time `CLEAR` resets the channel selection.
    pub async fn connect(&mut self, address: u8) -> AppResult<()> {
        if self.state != ConnectionState::Disconnected {
            self.disconnect().await?;
        }

        self.send(&format!("CONNECT {}", address)).await?;
        self.ping().await?;
        self.send("CLEAR").await?;

        self.state = ConnectionState::Connected;
        self.address = Some(address);
        info!("connected to analyzer at GPIB address {}", address);
        Ok(())
    }

    /// Disconnects. Never fails and always ends Disconnected, even when the
    /// underlying sends do not go through.
    pub async fn disconnect(&mut self) -> AppResult<()> {
        if self.state == ConnectionState::CommandMode {
            if let Err(e) = self.transport.send(".").await {
                warn!("leaving command mode failed during disconnect: {}", e);
            }
        }
        if self.state != ConnectionState::Disconnected {
            if let Err(e) = self.transport.send("DISCONNECT").await {
                warn!("DISCONNECT failed, dropping session anyway: {}", e);
            }
        }
        self.state = ConnectionState::Disconnected;
        self.address = None;
        debug!("session disconnected");
        Ok(())
    }

    /// Enters direct command mode. No-op success when already there.
    pub async fn enter_command_mode(&mut self) -> AppResult<()> {
        match self.state {
            ConnectionState::CommandMode => Ok(()),
            ConnectionState::Disconnected => Err(VnaError::NotConnected),
            ConnectionState::Connected => {
                self.send("CMD").await?;
                self.state = ConnectionState::CommandMode;
                Ok(())
            }
        }
    }

    /// Leaves direct command mode. No-op success when already out.
    pub async fn exit_command_mode(&mut self) -> AppResult<()> {
        match self.state {
            ConnectionState::Connected => Ok(()),
            ConnectionState::Disconnected => Err(VnaError::NotConnected),
            ConnectionState::CommandMode => {
                self.send(".").await?;
                self.state = ConnectionState::Connected;
                Ok(())
            }
        }
    }

    /// Raw pass-through for the manual terminal: one line out, whatever
    /// reply text arrives within the short reply window back.
    pub async fn terminal_send(&mut self, line: &str) -> AppResult<String> {
        if self.state == ConnectionState::Disconnected {
            return Err(VnaError::NotConnected);
        }
        self.send(line).await?;
        match self.receive(self.timeouts.reply, TERMINAL_REPLY_LINES).await {
            Ok(text) => Ok(text),
            Err(VnaError::NoData) => Ok(String::new()),
            Err(e) => Err(e),
        }
    }

    /// Dumps the full instrument state (`GETSTATE`).
    pub async fn get_state(&mut self) -> AppResult<String> {
        if self.state == ConnectionState::Disconnected {
            return Err(VnaError::NotConnected);
        }
        self.send("GETSTATE").await?;
        self.receive(self.timeouts.dump, DUMP_LINES).await
    }

    /// Restores a previously dumped instrument state (`SETSTATE`).
    pub async fn set_state(&mut self, state_text: &str) -> AppResult<()> {
        if self.state == ConnectionState::Disconnected {
            return Err(VnaError::NotConnected);
        }
        self.send(&format!("SETSTATE\n{}", state_text.trim())).await
    }

    /// Fetches the device calibration (`GETCALIB`); may legitimately be
    /// empty when the device holds none.
    pub async fn get_calibration(&mut self) -> AppResult<String> {
        if self.state == ConnectionState::Disconnected {
            return Err(VnaError::NotConnected);
        }
        self.send("GETCALIB").await?;
        match self.receive(self.timeouts.dump, DUMP_LINES).await {
            Ok(text) => Ok(text),
            Err(VnaError::NoData) => Ok(String::new()),
            Err(e) => Err(e),
        }
    }

    /// Uploads a calibration blob (`SETCALIB`).
    pub async fn set_calibration(&mut self, calib_text: &str) -> AppResult<()> {
        if self.state == ConnectionState::Disconnected {
            return Err(VnaError::NotConnected);
        }
        self.send(&format!("SETCALIB\n{}", calib_text.trim())).await
    }

    /// Unique requested parameters, sorted, as the selectors are issued.
    fn unique_params(settings: &Settings) -> Vec<SParam> {
        let mut params = settings.parameters.clone();
        params.sort();
        params.dedup();
        params
    }

    /// Configures the analyzer for a sweep, strictly in order. The device
    /// needs a clean slate, so this always forces a disconnect + reconnect
    /// first. The first failing step short-circuits the chain; the point
    /// count is read back and reconciled since the device may snap it.
    pub async fn prepare_measurement(&mut self, settings: &mut Settings) -> AppResult<()> {
        settings.validate()?;

        self.disconnect().await?;
        self.connect(settings.address).await?;

        self.send(&format!("FMT {}", settings.format.command_arg()))
            .await?;

        self.send("CLEAR").await?;
        for param in Self::unique_params(settings) {
            self.send(param.as_str()).await?;
        }

        let unit = settings.frequency_unit.command_arg();
        self.send(&format!("FREQ {}", unit)).await?;

        self.enter_command_mode().await?;
        self.send(&format!("s STAR {} {}", settings.freq_start, unit))
            .await?;
        self.send(&format!("s STOP {} {}", settings.freq_stop, unit))
            .await?;
        self.send(&format!("s POIN {}", settings.points)).await?;

        self.send("q POIN?").await?;
        let reply = self.receive(self.timeouts.reply, 1).await?;
        match reply.trim().parse::<f64>() {
            Ok(points) if points >= 1.0 => {
                let snapped = points as u32;
                if snapped != settings.points {
                    info!(
                        "device snapped point count {} -> {}",
                        settings.points, snapped
                    );
                    settings.points = snapped;
                }
            }
            _ => {
                return Err(VnaError::Parse(format!(
                    "unexpected POIN? reply: {:?}",
                    reply
                )))
            }
        }

        self.send(&format!("s PORT1 {}", settings.port1_length))
            .await?;
        self.send(&format!("s PORT2 {}", settings.port2_length))
            .await?;
        self.send(&format!("s VELOFACT {}", settings.velocity_factor))
            .await?;
        self.exit_command_mode().await?;

        info!(
            "analyzer configured: {} points, {} {} .. {} {}",
            settings.points, settings.freq_start, unit, settings.freq_stop, unit
        );
        Ok(())
    }

    /// Reads one complete sweep off the transport: one ready line per
    /// requested parameter, annotation lines until the `#` data marker, then
    /// exactly `points` sample lines. Fewer sample lines than expected is
    /// reported as `NoData` so the caller appends nothing.
    async fn read_sweep(
        &mut self,
        settings: &Settings,
        first_timeout: std::time::Duration,
    ) -> AppResult<String> {
        let mut raw = String::new();

        let n_params = Self::unique_params(settings).len();
        let status = self.receive(first_timeout, n_params).await?;
        for line in status.lines() {
            raw.push_str(line);
            raw.push('\n');
        }

        let mut marker_seen = false;
        for _ in 0..self.max_header_lines {
            let line = self.receive(self.timeouts.header_line, 1).await?;
            raw.push_str(&line);
            raw.push('\n');
            if line.starts_with('#') {
                marker_seen = true;
                break;
            }
        }
        if !marker_seen {
            warn!(
                "no data-section marker within {} header lines",
                self.max_header_lines
            );
            self.force_restart().await;
            return Err(VnaError::ProtocolDesync {
                expected: "# data-section marker".to_string(),
                got: "header overflow".to_string(),
            });
        }

        let points = settings.points as usize;
        let samples = self.receive(self.timeouts.points_read, points).await?;
        let collected = samples.lines().count();
        if collected < points {
            warn!("expected {} sample lines, got {}", points, collected);
            return Err(VnaError::NoData);
        }
        raw.push_str(&samples);
        raw.push('\n');
        Ok(raw)
    }

    /// Single-shot measurement: configure, `MEASURE`, read one sweep.
    /// Returns the raw text for the data model.
    pub async fn measure(&mut self, settings: &mut Settings) -> AppResult<String> {
        self.prepare_measurement(settings).await?;
        self.send("MEASURE").await?;
        let deadline = self.timeouts.status_line;
        self.read_sweep(settings, deadline).await
    }

    /// Starts a continuous sweep run: configure, then `M+`.
    pub async fn start_measurement(&mut self, settings: &mut Settings) -> AppResult<()> {
        self.prepare_measurement(settings).await?;
        self.send("M+").await
    }

    /// Reads the next sweep of a continuous run.
    pub async fn retrieve_measurement_data(&mut self, settings: &Settings) -> AppResult<String> {
        if self.state == ConnectionState::Disconnected {
            return Err(VnaError::NotConnected);
        }
        let deadline = self.timeouts.status_line;
        self.read_sweep(settings, deadline).await
    }

    /// Post-stop drain read: after `M-` the device may still emit one sweep
    /// it had already started. Bounded by the shorter drain timeout since
    /// most of the time there is nothing left.
    pub async fn drain_measurement_data(&mut self, settings: &Settings) -> AppResult<String> {
        if self.state == ConnectionState::Disconnected {
            return Err(VnaError::NotConnected);
        }
        let deadline = self.timeouts.drain;
        self.read_sweep(settings, deadline).await
    }

    /// Stops a continuous run (`M-`) and waits the grace delay so an
    /// in-flight sweep still being emitted by the device can drain.
    pub async fn end_measurement(&mut self) -> AppResult<()> {
        if self.state == ConnectionState::Disconnected {
            return Err(VnaError::NotConnected);
        }
        self.send("M-").await?;
        tokio::time::sleep(self.timeouts.grace).await;
        Ok(())
    }
}
