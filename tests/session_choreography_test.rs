//! Session choreography tests against the in-memory analyzer simulator.
//!
//! These exercise the full command sequences the session emits (connect
//! handshake, measurement preparation, sweep readout) and the recovery
//! behavior around probe mismatches and dead transports.

use std::time::Duration;
use vna_daq::config::Settings;
use vna_daq::error::VnaError;
use vna_daq::measurement::SParam;
use vna_daq::session::{ConnectionState, VnaSession};
use vna_daq::transport::MockTransport;

/// Two-parameter sweep body as queued into the simulator; the simulator
/// prepends one ready line per selected parameter when it emits it.
const QUEUED_SWEEP: &str = "\
!    Params: S11 S21
# HZ S RI R 50
1000000000 0.1 0.2 0.3 0.4
2000000000 0.5 0.6 0.7 0.8
";

/// The same sweep as the session assembles it off the wire.
const FULL_SWEEP: &str = "\
!S11 done
!S21 done
!    Params: S11 S21
# HZ S RI R 50
1000000000 0.1 0.2 0.3 0.4
2000000000 0.5 0.6 0.7 0.8
";

fn fast_settings() -> Settings {
    let mut settings = Settings::default();
    settings.address = 16;
    settings.points = 2;
    settings.parameters = vec![SParam::S11, SParam::S21];
    settings.timeouts.grace = Duration::from_millis(10);
    settings
}

fn session_with(mock: &MockTransport, settings: &Settings) -> VnaSession {
    VnaSession::new(Box::new(mock.clone()), settings)
}

#[tokio::test]
async fn test_connect_probes_then_clears() {
    let mock = MockTransport::new();
    let settings = fast_settings();
    let mut session = session_with(&mock, &settings);
    session.start().await.unwrap();

    session.connect(16).await.unwrap();

    assert_eq!(session.state(), ConnectionState::Connected);
    assert_eq!(session.address(), Some(16));
    assert_eq!(mock.sent(), vec!["CONNECT 16", "ping", "CLEAR"]);
}

#[tokio::test]
async fn test_ping_sentinel_mismatch_restarts_exactly_once() {
    let mock = MockTransport::new();
    mock.set_ping_reply("!unknown command pong");
    let settings = fast_settings();
    let mut session = session_with(&mock, &settings);
    session.start().await.unwrap();

    let err = session.connect(16).await.unwrap_err();

    assert!(matches!(err, VnaError::ProtocolDesync { .. }));
    assert!(err.is_fatal());
    assert_eq!(mock.restarts(), 1);
    assert_eq!(session.state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn test_single_shot_measure_emits_full_choreography() {
    let mock = MockTransport::new();
    mock.queue_sweep(QUEUED_SWEEP);
    let mut settings = fast_settings();
    let mut session = session_with(&mock, &settings);
    session.start().await.unwrap();

    let raw = session.measure(&mut settings).await.unwrap();
    assert_eq!(raw, FULL_SWEEP);

    assert_eq!(
        mock.sent(),
        vec![
            "CONNECT 16",
            "ping",
            "CLEAR",
            "FMT RI",
            "CLEAR",
            "S11",
            "S21",
            "FREQ GHZ",
            "CMD",
            "s STAR 1 GHZ",
            "s STOP 2 GHZ",
            "s POIN 2",
            "q POIN?",
            "s PORT1 0",
            "s PORT2 0",
            "s VELOFACT 1",
            ".",
            "MEASURE",
        ]
    );
    assert_eq!(session.state(), ConnectionState::Connected);
}

#[tokio::test]
async fn test_device_snapped_point_count_is_adopted() {
    let mock = MockTransport::new();
    mock.set_snapped_points(801);
    let mut settings = fast_settings();
    settings.points = 1000;
    let mut session = session_with(&mock, &settings);
    session.start().await.unwrap();

    session.prepare_measurement(&mut settings).await.unwrap();

    assert_eq!(settings.points, 801);
}

#[tokio::test]
async fn test_garbled_points_readback_stops_the_chain() {
    let mock = MockTransport::new();
    mock.set_points_reply("*whirr*");
    let mut settings = fast_settings();
    let mut session = session_with(&mock, &settings);
    session.start().await.unwrap();

    let err = session.prepare_measurement(&mut settings).await.unwrap_err();

    assert!(matches!(err, VnaError::Parse(_)));
    assert!(!err.is_fatal());
    assert_eq!(session.state(), ConnectionState::CommandMode);

    // Nothing past the readback went out.
    let sent = mock.sent();
    assert!(sent.iter().any(|l| l == "q POIN?"));
    assert!(!sent.iter().any(|l| l.starts_with("s PORT1")));
    assert!(!sent.iter().any(|l| l.starts_with("s PORT2")));
    assert!(!sent.iter().any(|l| l.starts_with("s VELOFACT")));
    assert!(!sent.iter().any(|l| l == "."));

    // Still on the bus; the caller can back out normally.
    session.exit_command_mode().await.unwrap();
    assert_eq!(session.state(), ConnectionState::Connected);
}

#[tokio::test]
async fn test_partial_sweep_is_no_data_and_session_survives() {
    let mock = MockTransport::new();
    // Two sample lines where three are expected.
    mock.queue_sweep(QUEUED_SWEEP);
    let mut settings = fast_settings();
    settings.points = 3;
    let mut session = session_with(&mock, &settings);
    session.start().await.unwrap();

    let err = session.measure(&mut settings).await.unwrap_err();

    assert!(matches!(err, VnaError::NoData));
    assert!(!err.is_fatal());
    assert_eq!(session.state(), ConnectionState::Connected);
}

#[tokio::test]
async fn test_command_mode_toggles_are_idempotent() {
    let mock = MockTransport::new();
    let settings = fast_settings();
    let mut session = session_with(&mock, &settings);
    session.start().await.unwrap();
    session.connect(16).await.unwrap();

    session.enter_command_mode().await.unwrap();
    session.enter_command_mode().await.unwrap();
    assert_eq!(session.state(), ConnectionState::CommandMode);

    session.exit_command_mode().await.unwrap();
    session.exit_command_mode().await.unwrap();
    assert_eq!(session.state(), ConnectionState::Connected);

    let sent = mock.sent();
    assert_eq!(sent.iter().filter(|l| l.as_str() == "CMD").count(), 1);
    assert_eq!(sent.iter().filter(|l| l.as_str() == ".").count(), 1);
}

#[tokio::test]
async fn test_command_mode_requires_connection() {
    let mock = MockTransport::new();
    let settings = fast_settings();
    let mut session = session_with(&mock, &settings);
    session.start().await.unwrap();

    let err = session.enter_command_mode().await.unwrap_err();
    assert!(matches!(err, VnaError::NotConnected));
}

#[tokio::test]
async fn test_disconnect_always_lands_disconnected() {
    let mock = MockTransport::new();
    let settings = fast_settings();
    let mut session = session_with(&mock, &settings);
    session.start().await.unwrap();
    session.connect(16).await.unwrap();

    // A dead bus program must not keep the session stuck in Connected.
    mock.set_fail_sends(true);
    session.disconnect().await.unwrap();

    assert_eq!(session.state(), ConnectionState::Disconnected);
    assert_eq!(session.address(), None);
}

#[tokio::test]
async fn test_terminal_send_requires_connection() {
    let mock = MockTransport::new();
    let settings = fast_settings();
    let mut session = session_with(&mock, &settings);
    session.start().await.unwrap();

    let err = session.terminal_send("IDN?").await.unwrap_err();
    assert!(matches!(err, VnaError::NotConnected));
}

#[tokio::test]
async fn test_terminal_send_returns_reply_text() {
    let mock = MockTransport::new();
    let settings = fast_settings();
    let mut session = session_with(&mock, &settings);
    session.start().await.unwrap();
    session.connect(16).await.unwrap();

    let reply = session.terminal_send("BOGUS").await.unwrap();
    assert_eq!(reply, "!unknown command BOGUS");
}

#[tokio::test]
async fn test_state_and_calibration_dumps() {
    let mock = MockTransport::new();
    mock.set_state_text("OPC?;PRES;\nPOIN201;");
    mock.set_calib_text("CALIFUL2\n1.0 2.0 3.0");
    let settings = fast_settings();
    let mut session = session_with(&mock, &settings);
    session.start().await.unwrap();
    session.connect(16).await.unwrap();

    let state = session.get_state().await.unwrap();
    assert_eq!(state, "OPC?;PRES;\nPOIN201;");

    let calib = session.get_calibration().await.unwrap();
    assert_eq!(calib, "CALIFUL2\n1.0 2.0 3.0");
}

#[tokio::test]
async fn test_empty_calibration_is_not_an_error() {
    let mock = MockTransport::new();
    let settings = fast_settings();
    let mut session = session_with(&mock, &settings);
    session.start().await.unwrap();
    session.connect(16).await.unwrap();

    let calib = session.get_calibration().await.unwrap();
    assert_eq!(calib, "");
}

#[tokio::test]
async fn test_transport_failure_is_fatal_and_disconnects() {
    let mock = MockTransport::new();
    let settings = fast_settings();
    let mut session = session_with(&mock, &settings);
    session.start().await.unwrap();
    session.connect(16).await.unwrap();

    mock.set_fail_sends(true);
    let err = session.terminal_send("S11").await.unwrap_err();

    assert!(matches!(err, VnaError::TransportFailed(_)));
    assert!(err.is_fatal());
    assert_eq!(session.state(), ConnectionState::Disconnected);
}
