//! Instrument worker: owns the session and serializes all device access.
//!
//! `VnaActor` runs as a dedicated Tokio task. It is the single owner of the
//! [`VnaSession`] and the in-memory [`Project`], so every device interaction
//! is processed strictly in the order requests arrive and at most one
//! operation is ever in flight on the bus — no locks, no interleaving.
//!
//! While a continuous run is active the worker alternates between servicing
//! queued requests (`try_recv`, non-blocking) and reading the next sweep off
//! the transport, so a stop request is picked up between sweeps.

use crate::config::Settings;
use crate::error::{AppResult, VnaError};
use crate::measurement::Dataset;
use crate::messages::{VnaEvent, VnaRequest};
use crate::project::Project;
use crate::session::VnaSession;
use log::{debug, error, info, warn};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TryRecvError;

/// Capacity of the request channel; senders back-pressure past this.
pub const REQUEST_CHANNEL_CAPACITY: usize = 32;

/// Minimum spacing of `Redraw` events during a continuous run.
const REDRAW_COOLDOWN: Duration = Duration::from_millis(100);

/// Rate limiter for display refresh hints. Sweeps can complete faster than
/// a plot can usefully repaint, so redraws are coalesced.
struct RedrawThrottle {
    cooldown: Duration,
    last: Option<Instant>,
}

impl RedrawThrottle {
    fn new(cooldown: Duration) -> Self {
        Self {
            cooldown,
            last: None,
        }
    }

    /// True when enough time has passed since the last accepted redraw;
    /// accepting advances the window.
    fn ready(&mut self) -> bool {
        let now = Instant::now();
        match self.last {
            Some(last) if now.duration_since(last) < self.cooldown => false,
            _ => {
                self.last = Some(now);
                true
            }
        }
    }
}

/// State of an active free-running sweep loop.
struct ContinuousRun {
    settings: Settings,
    frames: usize,
}

pub struct VnaActor {
    session: VnaSession,
    project: Project,
    run: Option<ContinuousRun>,
    event_tx: mpsc::UnboundedSender<VnaEvent>,
    redraw: RedrawThrottle,
}

impl VnaActor {
    pub fn new(session: VnaSession, event_tx: mpsc::UnboundedSender<VnaEvent>) -> Self {
        Self {
            session,
            project: Project::new(),
            run: None,
            event_tx,
            redraw: RedrawThrottle::new(REDRAW_COOLDOWN),
        }
    }

    /// Builds the worker around a session and spawns it, returning the
    /// request sender, the event stream, and the task handle.
    pub fn spawn(
        session: VnaSession,
    ) -> (
        mpsc::Sender<VnaRequest>,
        mpsc::UnboundedReceiver<VnaEvent>,
        tokio::task::JoinHandle<()>,
    ) {
        let (request_tx, request_rx) = mpsc::channel(REQUEST_CHANNEL_CAPACITY);
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let actor = Self::new(session, event_tx);
        let handle = tokio::spawn(actor.run(request_rx));
        (request_tx, event_rx, handle)
    }

    /// Runs the worker until `Shutdown` arrives or all request senders are
    /// dropped. Consumes the actor; spawn it as a task.
    pub async fn run(mut self, mut request_rx: mpsc::Receiver<VnaRequest>) {
        info!("instrument worker started");

        if let Err(e) = self.session.start().await {
            error!("bus program failed to start: {}", e);
            self.emit(VnaEvent::Warning(format!("bus program failed to start: {}", e)));
        }

        loop {
            if self.run.is_some() {
                match request_rx.try_recv() {
                    Ok(request) => {
                        if self.handle_request(request).await {
                            break;
                        }
                        continue;
                    }
                    Err(TryRecvError::Empty) => {}
                    Err(TryRecvError::Disconnected) => break,
                }
                self.continuous_step().await;
            } else {
                match request_rx.recv().await {
                    Some(request) => {
                        if self.handle_request(request).await {
                            break;
                        }
                    }
                    None => break,
                }
            }
        }

        if let Err(e) = self.session.shutdown().await {
            warn!("transport shutdown failed: {}", e);
        }
        info!("instrument worker stopped");
    }

    fn emit(&self, event: VnaEvent) {
        let _ = self.event_tx.send(event);
    }

    /// After a fatal error the session has already dropped to Disconnected;
    /// mirror that to the front end and abandon any active run.
    fn note_failure(&mut self, err: &VnaError) {
        if err.is_fatal() {
            if self.run.take().is_some() {
                warn!("continuous run aborted: {}", err);
                self.emit(VnaEvent::RunFinished { frames: self.project.frames() });
            }
            self.emit(VnaEvent::Disconnected);
        }
    }

    /// Processes one request; returns true when the worker should exit.
    async fn handle_request(&mut self, request: VnaRequest) -> bool {
        match request {
            VnaRequest::Connect { address, response } => {
                let result = self.connect(address).await;
                let _ = response.send(result);
            }

            VnaRequest::Disconnect { response } => {
                let result = self.disconnect().await;
                let _ = response.send(result);
            }

            VnaRequest::TerminalSend { line, response } => {
                let result = self.terminal_send(&line).await;
                let _ = response.send(result);
            }

            VnaRequest::SetCommandMode { enabled, response } => {
                let result = self.set_command_mode(enabled).await;
                let _ = response.send(result);
            }

            VnaRequest::Measure { settings, response } => {
                let result = self.measure(settings).await;
                let _ = response.send(result);
            }

            VnaRequest::StartContinuous { settings, response } => {
                let result = self.start_continuous(settings).await;
                let _ = response.send(result);
            }

            VnaRequest::StopContinuous { response } => {
                let result = self.stop_continuous().await;
                let _ = response.send(result);
            }

            VnaRequest::FetchState { response } => {
                let result = self.fetch_state().await;
                let _ = response.send(result);
            }

            VnaRequest::ApplyState { response } => {
                let result = self.apply_state().await;
                let _ = response.send(result);
            }

            VnaRequest::FetchCalibration { response } => {
                let result = self.fetch_calibration().await;
                let _ = response.send(result);
            }

            VnaRequest::ApplyCalibration { response } => {
                let result = self.apply_calibration().await;
                let _ = response.send(result);
            }

            VnaRequest::SetDescription { text, response } => {
                self.project.description = text;
                let _ = response.send(());
            }

            VnaRequest::SaveProject {
                path,
                settings,
                response,
            } => {
                let result = self.project.save(&path, &settings);
                let _ = response.send(result);
            }

            VnaRequest::LoadProject { path, response } => {
                let result = self.load_project(&path);
                let _ = response.send(result);
            }

            VnaRequest::PrintSweep { frame, response } => {
                let result = self.print_sweep(frame);
                let _ = response.send(result);
            }

            VnaRequest::QueryState { response } => {
                let _ = response.send(self.session.state());
            }

            VnaRequest::Shutdown { response } => {
                let result = self.shutdown_sequence().await;
                let _ = response.send(result);
                return true;
            }
        }
        false
    }

    async fn connect(&mut self, address: u8) -> AppResult<()> {
        if self.run.is_some() {
            return Err(VnaError::RunActive);
        }
        match self.session.connect(address).await {
            Ok(()) => {
                self.emit(VnaEvent::Connected { address });
                Ok(())
            }
            Err(e) => {
                self.note_failure(&e);
                Err(e)
            }
        }
    }

    async fn disconnect(&mut self) -> AppResult<()> {
        if self.run.is_some() {
            self.stop_continuous().await?;
        }
        let result = self.session.disconnect().await;
        self.emit(VnaEvent::Disconnected);
        result
    }

    async fn set_command_mode(&mut self, enabled: bool) -> AppResult<()> {
        if self.run.is_some() {
            return Err(VnaError::RunActive);
        }
        let result = if enabled {
            self.session.enter_command_mode().await
        } else {
            self.session.exit_command_mode().await
        };
        match result {
            Ok(()) => {
                self.emit(VnaEvent::CommandMode { enabled });
                Ok(())
            }
            Err(e) => {
                self.note_failure(&e);
                Err(e)
            }
        }
    }

    async fn measure(&mut self, mut settings: Settings) -> AppResult<usize> {
        if self.run.is_some() {
            return Err(VnaError::RunActive);
        }
        let raw = match self.session.measure(&mut settings).await {
            Ok(raw) => raw,
            Err(e) => {
                self.note_failure(&e);
                return Err(e);
            }
        };
        if let Some(address) = self.session.address() {
            self.emit(VnaEvent::Connected { address });
        }

        let mut dataset = Dataset::new(&settings.parameters)?;
        let frame = dataset.add_measurement(&raw)?;
        self.project.dataset = Some(dataset);
        self.emit(VnaEvent::SweepAppended { frame });
        self.emit(VnaEvent::Redraw);
        Ok(frame)
    }

    async fn start_continuous(&mut self, mut settings: Settings) -> AppResult<()> {
        if self.run.is_some() {
            return Err(VnaError::RunActive);
        }
        if let Err(e) = self.session.start_measurement(&mut settings).await {
            self.note_failure(&e);
            return Err(e);
        }
        if let Some(address) = self.session.address() {
            self.emit(VnaEvent::Connected { address });
        }

        self.project.dataset = Some(Dataset::new(&settings.parameters)?);
        self.run = Some(ContinuousRun { settings, frames: 0 });
        info!("continuous run started");
        Ok(())
    }

    /// One iteration of the free-running loop: read a sweep if the device
    /// has one ready. A missed deadline is normal pacing; anything fatal
    /// abandons the run.
    async fn continuous_step(&mut self) {
        let settings = match &self.run {
            Some(run) => run.settings.clone(),
            None => return,
        };
        match self.session.retrieve_measurement_data(&settings).await {
            Ok(raw) => self.append_sweep(&raw),
            Err(VnaError::NoData) => {
                // Sweep not ready yet; back off so stop requests get polled.
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            Err(e) => {
                warn!("continuous read failed: {}", e);
                self.note_failure(&e);
                if !e.is_fatal() {
                    // Recoverable but the loop cannot continue blind.
                    if self.run.take().is_some() {
                        self.emit(VnaEvent::RunFinished { frames: self.project.frames() });
                    }
                    self.emit(VnaEvent::Warning(format!("continuous run stopped: {}", e)));
                }
            }
        }
    }

    fn append_sweep(&mut self, raw: &str) {
        let dataset = match self.project.dataset.as_mut() {
            Some(d) => d,
            None => return,
        };
        match dataset.add_measurement(raw) {
            Ok(frame) => {
                if let Some(run) = self.run.as_mut() {
                    run.frames += 1;
                }
                debug!("sweep appended at frame {}", frame);
                self.emit(VnaEvent::SweepAppended { frame });
                if self.redraw.ready() {
                    self.emit(VnaEvent::Redraw);
                }
            }
            Err(e) => {
                warn!("discarding malformed sweep: {}", e);
                self.emit(VnaEvent::Warning(format!("discarded malformed sweep: {}", e)));
            }
        }
    }

    /// Stops the free-running loop: `M-`, grace delay, then one drain read
    /// for a sweep the device had already started. No-op when idle.
    async fn stop_continuous(&mut self) -> AppResult<usize> {
        let run = match self.run.take() {
            Some(run) => run,
            None => {
                debug!("stop requested with no active run");
                return Ok(0);
            }
        };

        if let Err(e) = self.session.end_measurement().await {
            self.note_failure(&e);
            self.emit(VnaEvent::RunFinished { frames: run.frames });
            return Err(e);
        }

        let mut frames = run.frames;
        match self.session.drain_measurement_data(&run.settings).await {
            Ok(raw) => {
                self.append_sweep(&raw);
                frames = self.project.frames().max(frames);
            }
            Err(VnaError::NoData) => {}
            Err(e) => {
                self.note_failure(&e);
                self.emit(VnaEvent::RunFinished { frames });
                return Err(e);
            }
        }

        info!("continuous run finished with {} frames", frames);
        self.emit(VnaEvent::RunFinished { frames });
        self.emit(VnaEvent::Redraw);
        Ok(frames)
    }

    async fn fetch_state(&mut self) -> AppResult<String> {
        if self.run.is_some() {
            return Err(VnaError::RunActive);
        }
        match self.session.get_state().await {
            Ok(text) => {
                self.project.set_state(text.clone());
                Ok(text)
            }
            Err(e) => {
                self.note_failure(&e);
                Err(e)
            }
        }
    }

    async fn apply_state(&mut self) -> AppResult<()> {
        if self.run.is_some() {
            return Err(VnaError::RunActive);
        }
        let state = self
            .project
            .state
            .clone()
            .ok_or_else(|| VnaError::Configuration("project holds no instrument state".into()))?;
        match self.session.set_state(&state).await {
            Ok(()) => Ok(()),
            Err(e) => {
                self.note_failure(&e);
                Err(e)
            }
        }
    }

    async fn fetch_calibration(&mut self) -> AppResult<String> {
        if self.run.is_some() {
            return Err(VnaError::RunActive);
        }
        match self.session.get_calibration().await {
            Ok(text) => {
                self.project.set_calibration(text.clone());
                Ok(text)
            }
            Err(e) => {
                self.note_failure(&e);
                Err(e)
            }
        }
    }

    async fn apply_calibration(&mut self) -> AppResult<()> {
        if self.run.is_some() {
            return Err(VnaError::RunActive);
        }
        let calibration = self
            .project
            .calibration
            .clone()
            .ok_or_else(|| VnaError::Configuration("project holds no calibration".into()))?;
        match self.session.set_calibration(&calibration).await {
            Ok(()) => Ok(()),
            Err(e) => {
                self.note_failure(&e);
                Err(e)
            }
        }
    }

    fn load_project(&mut self, path: &std::path::Path) -> AppResult<Option<Settings>> {
        let (project, settings) = Project::load(path)?;
        self.project = project;
        self.emit(VnaEvent::Redraw);
        Ok(settings)
    }

    fn print_sweep(&self, frame: usize) -> AppResult<String> {
        match &self.project.dataset {
            Some(dataset) => dataset.print_measurement(frame),
            None => Err(VnaError::FrameOutOfRange(frame)),
        }
    }

    async fn terminal_send(&mut self, line: &str) -> AppResult<String> {
        if self.run.is_some() {
            return Err(VnaError::RunActive);
        }
        match self.session.terminal_send(line).await {
            Ok(reply) => Ok(reply),
            Err(e) => {
                self.note_failure(&e);
                Err(e)
            }
        }
    }

    async fn shutdown_sequence(&mut self) -> AppResult<()> {
        if self.run.is_some() {
            let _ = self.stop_continuous().await;
        }
        self.session.disconnect().await?;
        self.emit(VnaEvent::Disconnected);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_redraw_throttle_coalesces() {
        let mut throttle = RedrawThrottle::new(Duration::from_secs(60));
        assert!(throttle.ready());
        assert!(!throttle.ready());
    }

    #[test]
    fn test_redraw_throttle_reopens_after_cooldown() {
        let mut throttle = RedrawThrottle::new(Duration::from_millis(0));
        assert!(throttle.ready());
        assert!(throttle.ready());
    }
}
