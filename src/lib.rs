//! # VNA DAQ Core Library
//!
//! Core library for the `vna-daq` bench controller, which drives an HP-8753
//! vector network analyzer through the external `hpctrl` bus program. All
//! device I/O is plain text over the child process's stdin/stdout; this crate
//! turns that line protocol into a typed async API.
//!
//! ## Crate Structure
//!
//! - **`config`**: sweep settings, hpctrl launch options and timeout
//!   calibration, loaded from TOML profiles. See `config::Settings`.
//! - **`error`**: the `VnaError` enum and the recoverable/fatal contract the
//!   session layer exposes.
//! - **`transport`**: the `Transport` trait plus the real child-process
//!   implementation and an in-memory hpctrl simulator for tests.
//! - **`session`**: the connection state machine and command choreography —
//!   the only place device command strings are assembled.
//! - **`measurement`**: the sweep dataset, parameter wire-order handling and
//!   byte-exact sweep rendering.
//! - **`project`**: directory-based persistence of settings, instrument
//!   state, calibration and collected sweeps.
//! - **`messages`**: request/response and event types for the worker.
//! - **`actor`**: the worker task that owns the session and serializes all
//!   device access.

pub mod actor;
pub mod config;
pub mod error;
pub mod measurement;
pub mod messages;
pub mod project;
pub mod session;
pub mod transport;

pub use error::{AppResult, VnaError};
