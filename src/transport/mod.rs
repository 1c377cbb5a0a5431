//! Line transport to the hpctrl bus program.
//!
//! The [`Transport`] trait is the seam between the command choreography and
//! the actual I/O: a line-buffered send and a bounded-time, line-counted
//! receive. Two implementations exist and are selected at construction time:
//! [`process::HpctrlTransport`] owns the real child process, while
//! [`mock::MockTransport`] is an in-memory hpctrl simulator used by the
//! tests.

use crate::error::AppResult;
use async_trait::async_trait;
use std::time::Duration;

pub mod mock;
pub mod process;

pub use mock::MockTransport;
pub use process::HpctrlTransport;

/// The controlled-shutdown line understood by hpctrl.
pub const EXIT_COMMAND: &str = "exit";

/// Bidirectional line-oriented channel to the bus program.
///
/// At most one exchange may be in flight per transport instance at any time.
/// That invariant is enforced by the task serializer, not here.
#[async_trait]
pub trait Transport: Send {
    /// Launches the backing process (or resets the simulator).
    async fn start(&mut self) -> AppResult<()>;

    /// Writes `line` + newline, flushes, and waits the settle delay the bus
    /// program needs before it accepts the next command.
    ///
    /// On an I/O failure the transport restarts itself (unless `line` is the
    /// [`EXIT_COMMAND`]) and returns `TransportFailed`.
    async fn send(&mut self, line: &str) -> AppResult<()>;

    /// Collects up to `max_lines` lines within `timeout`.
    ///
    /// Returns the trimmed, newline-joined text. A timeout with partial data
    /// still returns `Ok`; only a timeout with nothing collected at all is
    /// `Err(NoData)`. Always returns within `timeout` plus scheduling slack.
    async fn receive(&mut self, timeout: Duration, max_lines: usize) -> AppResult<String>;

    /// Tears the backing process down and launches it again. The session
    /// must reconnect and reconfigure afterwards.
    async fn restart(&mut self) -> AppResult<()>;

    /// Controlled shutdown; best-effort `exit` followed by process teardown.
    async fn shutdown(&mut self) -> AppResult<()>;
}
