//! Message types for the instrument worker.
//!
//! The front end never calls the session directly. Every device operation is
//! a [`VnaRequest`] sent over an mpsc channel to the [`crate::actor::VnaActor`]
//! worker, which processes requests strictly in arrival order. Each request
//! variant embeds a `oneshot::Sender` for its reply; the helper constructors
//! build the variant together with the matching receiver:
//!
//! ```rust
//! use vna_daq::messages::VnaRequest;
//!
//! let (req, rx) = VnaRequest::connect(16);
//! // req_tx.send(req).await?;
//! // let result = rx.await?;
//! ```
//!
//! Unsolicited progress (sweeps appended during a continuous run, state
//! transitions) is pushed on a separate [`VnaEvent`] channel that the front
//! end drains without blocking.

use crate::config::Settings;
use crate::error::AppResult;
use crate::session::ConnectionState;
use std::path::PathBuf;
use tokio::sync::oneshot;

/// Requests processed one at a time by the `VnaActor` worker.
#[derive(Debug)]
pub enum VnaRequest {
    /// Connect to the analyzer at the given GPIB address and verify the
    /// link with the ping probe.
    Connect {
        address: u8,
        response: oneshot::Sender<AppResult<()>>,
    },

    /// Drop the connection. Always leaves the session Disconnected.
    Disconnect {
        response: oneshot::Sender<AppResult<()>>,
    },

    /// Forward one raw line to the bus program and return whatever reply
    /// text arrives within the short reply window.
    TerminalSend {
        line: String,
        response: oneshot::Sender<AppResult<String>>,
    },

    /// Enter or leave hpctrl's direct command mode.
    SetCommandMode {
        enabled: bool,
        response: oneshot::Sender<AppResult<()>>,
    },

    /// Single-shot sweep: configure the analyzer per `settings`, trigger one
    /// measurement, parse the result into the dataset. Replies with the
    /// frame index of the appended sweep.
    Measure {
        settings: Settings,
        response: oneshot::Sender<AppResult<usize>>,
    },

    /// Configure the analyzer and start a free-running sweep loop. Sweeps
    /// are appended to the dataset as they complete and announced via
    /// [`VnaEvent::SweepAppended`].
    StartContinuous {
        settings: Settings,
        response: oneshot::Sender<AppResult<()>>,
    },

    /// Stop the free-running loop; replies after the final drain read with
    /// the number of frames collected during the run.
    StopContinuous {
        response: oneshot::Sender<AppResult<usize>>,
    },

    /// Dump the full instrument state into the project.
    FetchState {
        response: oneshot::Sender<AppResult<String>>,
    },

    /// Restore the project's saved instrument state to the device.
    ApplyState {
        response: oneshot::Sender<AppResult<()>>,
    },

    /// Fetch the device calibration into the project (may be empty).
    FetchCalibration {
        response: oneshot::Sender<AppResult<String>>,
    },

    /// Upload the project's saved calibration to the device.
    ApplyCalibration {
        response: oneshot::Sender<AppResult<()>>,
    },

    /// Replace the project description text.
    SetDescription {
        text: String,
        response: oneshot::Sender<()>,
    },

    /// Persist the whole project (settings, state, calibration, sweeps) to
    /// a directory.
    SaveProject {
        path: PathBuf,
        settings: Settings,
        response: oneshot::Sender<AppResult<()>>,
    },

    /// Load a project directory, replacing the in-memory project. Replies
    /// with the settings stored alongside it, if any.
    LoadProject {
        path: PathBuf,
        response: oneshot::Sender<AppResult<Option<Settings>>>,
    },

    /// Render one collected sweep back to its on-wire text.
    PrintSweep {
        frame: usize,
        response: oneshot::Sender<AppResult<String>>,
    },

    /// Read-only query of the current connection state.
    QueryState {
        response: oneshot::Sender<ConnectionState>,
    },

    /// Tear the worker down: stop any continuous run, disconnect, terminate
    /// the bus program. The worker exits after replying.
    Shutdown {
        response: oneshot::Sender<AppResult<()>>,
    },
}

impl VnaRequest {
    pub fn connect(address: u8) -> (Self, oneshot::Receiver<AppResult<()>>) {
        let (tx, rx) = oneshot::channel();
        (Self::Connect { address, response: tx }, rx)
    }

    pub fn disconnect() -> (Self, oneshot::Receiver<AppResult<()>>) {
        let (tx, rx) = oneshot::channel();
        (Self::Disconnect { response: tx }, rx)
    }

    pub fn terminal_send(line: String) -> (Self, oneshot::Receiver<AppResult<String>>) {
        let (tx, rx) = oneshot::channel();
        (Self::TerminalSend { line, response: tx }, rx)
    }

    pub fn set_command_mode(enabled: bool) -> (Self, oneshot::Receiver<AppResult<()>>) {
        let (tx, rx) = oneshot::channel();
        (Self::SetCommandMode { enabled, response: tx }, rx)
    }

    pub fn measure(settings: Settings) -> (Self, oneshot::Receiver<AppResult<usize>>) {
        let (tx, rx) = oneshot::channel();
        (Self::Measure { settings, response: tx }, rx)
    }

    pub fn start_continuous(settings: Settings) -> (Self, oneshot::Receiver<AppResult<()>>) {
        let (tx, rx) = oneshot::channel();
        (Self::StartContinuous { settings, response: tx }, rx)
    }

    pub fn stop_continuous() -> (Self, oneshot::Receiver<AppResult<usize>>) {
        let (tx, rx) = oneshot::channel();
        (Self::StopContinuous { response: tx }, rx)
    }

    pub fn fetch_state() -> (Self, oneshot::Receiver<AppResult<String>>) {
        let (tx, rx) = oneshot::channel();
        (Self::FetchState { response: tx }, rx)
    }

    pub fn apply_state() -> (Self, oneshot::Receiver<AppResult<()>>) {
        let (tx, rx) = oneshot::channel();
        (Self::ApplyState { response: tx }, rx)
    }

    pub fn fetch_calibration() -> (Self, oneshot::Receiver<AppResult<String>>) {
        let (tx, rx) = oneshot::channel();
        (Self::FetchCalibration { response: tx }, rx)
    }

    pub fn apply_calibration() -> (Self, oneshot::Receiver<AppResult<()>>) {
        let (tx, rx) = oneshot::channel();
        (Self::ApplyCalibration { response: tx }, rx)
    }

    pub fn set_description(text: String) -> (Self, oneshot::Receiver<()>) {
        let (tx, rx) = oneshot::channel();
        (Self::SetDescription { text, response: tx }, rx)
    }

    pub fn save_project(
        path: PathBuf,
        settings: Settings,
    ) -> (Self, oneshot::Receiver<AppResult<()>>) {
        let (tx, rx) = oneshot::channel();
        (
            Self::SaveProject {
                path,
                settings,
                response: tx,
            },
            rx,
        )
    }

    pub fn load_project(path: PathBuf) -> (Self, oneshot::Receiver<AppResult<Option<Settings>>>) {
        let (tx, rx) = oneshot::channel();
        (Self::LoadProject { path, response: tx }, rx)
    }

    pub fn print_sweep(frame: usize) -> (Self, oneshot::Receiver<AppResult<String>>) {
        let (tx, rx) = oneshot::channel();
        (Self::PrintSweep { frame, response: tx }, rx)
    }

    pub fn query_state() -> (Self, oneshot::Receiver<ConnectionState>) {
        let (tx, rx) = oneshot::channel();
        (Self::QueryState { response: tx }, rx)
    }

    pub fn shutdown() -> (Self, oneshot::Receiver<AppResult<()>>) {
        let (tx, rx) = oneshot::channel();
        (Self::Shutdown { response: tx }, rx)
    }
}

/// Unsolicited notifications from the worker to the front end.
#[derive(Debug, Clone, PartialEq)]
pub enum VnaEvent {
    /// Connection established at the given address.
    Connected { address: u8 },
    /// Session fell back to Disconnected, voluntarily or after a transport
    /// failure.
    Disconnected,
    /// Direct command mode toggled.
    CommandMode { enabled: bool },
    /// A sweep was appended to the dataset at this frame index.
    SweepAppended { frame: usize },
    /// A continuous run finished; total frames collected.
    RunFinished { frames: usize },
    /// Display refresh hint, rate-limited by the worker.
    Redraw,
    /// Non-fatal problem worth surfacing to the operator.
    Warning(String),
}
