//! Worker-level tests: request serialization, continuous runs, and the
//! project operations routed through the actor.

use std::time::Duration;
use tokio::sync::mpsc;
use vna_daq::actor::VnaActor;
use vna_daq::config::Settings;
use vna_daq::error::VnaError;
use vna_daq::measurement::SParam;
use vna_daq::messages::{VnaEvent, VnaRequest};
use vna_daq::session::{ConnectionState, VnaSession};
use vna_daq::transport::MockTransport;

const QUEUED_SWEEP: &str = "\
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

fn spawn_worker(
    mock: &MockTransport,
    settings: &Settings,
) -> (
    mpsc::Sender<VnaRequest>,
    mpsc::UnboundedReceiver<VnaEvent>,
    tokio::task::JoinHandle<()>,
) {
    let session = VnaSession::new(Box::new(mock.clone()), settings);
    VnaActor::spawn(session)
}

async fn shutdown(
    tx: &mpsc::Sender<VnaRequest>,
    worker: tokio::task::JoinHandle<()>,
) {
    let (req, rx) = VnaRequest::shutdown();
    tx.send(req).await.unwrap();
    rx.await.unwrap().unwrap();
    worker.await.unwrap();
}

/// Waits for a specific number of `SweepAppended` events, ignoring the rest.
async fn await_sweeps(event_rx: &mut mpsc::UnboundedReceiver<VnaEvent>, count: usize) -> Vec<usize> {
    let mut frames = Vec::new();
    while frames.len() < count {
        match tokio::time::timeout(Duration::from_secs(5), event_rx.recv()).await {
            Ok(Some(VnaEvent::SweepAppended { frame })) => frames.push(frame),
            Ok(Some(_)) => {}
            Ok(None) => panic!("event channel closed early"),
            Err(_) => panic!("timed out waiting for sweep events"),
        }
    }
    frames
}

#[tokio::test]
async fn test_requests_are_processed_in_arrival_order() {
    let mock = MockTransport::new();
    let settings = fast_settings();
    let (tx, _events, worker) = spawn_worker(&mock, &settings);

    // Queue three requests back to back before awaiting any reply.
    let (req1, rx1) = VnaRequest::connect(16);
    let (req2, rx2) = VnaRequest::terminal_send("BOGUS".to_string());
    let (req3, rx3) = VnaRequest::disconnect();
    tx.send(req1).await.unwrap();
    tx.send(req2).await.unwrap();
    tx.send(req3).await.unwrap();

    rx1.await.unwrap().unwrap();
    let reply = rx2.await.unwrap().unwrap();
    assert_eq!(reply, "!unknown command BOGUS");
    rx3.await.unwrap().unwrap();

    assert_eq!(
        mock.sent(),
        vec!["CONNECT 16", "ping", "CLEAR", "BOGUS", "DISCONNECT"]
    );

    shutdown(&tx, worker).await;
}

#[tokio::test]
async fn test_measure_appends_frame_and_announces_it() {
    let mock = MockTransport::new();
    mock.queue_sweep(QUEUED_SWEEP);
    let settings = fast_settings();
    let (tx, mut events, worker) = spawn_worker(&mock, &settings);

    let (req, rx) = VnaRequest::measure(settings.clone());
    tx.send(req).await.unwrap();
    let frame = rx.await.unwrap().unwrap();
    assert_eq!(frame, 0);

    let frames = await_sweeps(&mut events, 1).await;
    assert_eq!(frames, vec![0]);

    let (req, rx) = VnaRequest::print_sweep(0);
    tx.send(req).await.unwrap();
    let text = rx.await.unwrap().unwrap();
    assert!(text.contains("1000000000 0.1 0.2 0.3 0.4"));

    shutdown(&tx, worker).await;
}

#[tokio::test]
async fn test_continuous_run_collects_and_stops() {
    let mock = MockTransport::new();
    for _ in 0..3 {
        mock.queue_sweep(QUEUED_SWEEP);
    }
    let settings = fast_settings();
    let (tx, mut events, worker) = spawn_worker(&mock, &settings);

    let (req, rx) = VnaRequest::start_continuous(settings.clone());
    tx.send(req).await.unwrap();
    rx.await.unwrap().unwrap();

    let frames = await_sweeps(&mut events, 3).await;
    assert_eq!(frames, vec![0, 1, 2]);

    let (req, rx) = VnaRequest::stop_continuous();
    tx.send(req).await.unwrap();
    let collected = rx.await.unwrap().unwrap();
    assert_eq!(collected, 3);

    // The stop must have gone out as M- after the M+ start.
    let sent = mock.sent();
    let start = sent.iter().position(|l| l == "M+");
    let stop = sent.iter().position(|l| l == "M-");
    assert!(start.is_some() && stop.is_some() && start < stop);

    shutdown(&tx, worker).await;
}

#[tokio::test]
async fn test_device_operations_rejected_while_run_active() {
    let mock = MockTransport::new();
    mock.queue_sweep(QUEUED_SWEEP);
    let settings = fast_settings();
    let (tx, _events, worker) = spawn_worker(&mock, &settings);

    let (req, rx) = VnaRequest::start_continuous(settings.clone());
    tx.send(req).await.unwrap();
    rx.await.unwrap().unwrap();

    let (req, rx) = VnaRequest::measure(settings.clone());
    tx.send(req).await.unwrap();
    assert!(matches!(rx.await.unwrap(), Err(VnaError::RunActive)));

    let (req, rx) = VnaRequest::start_continuous(settings.clone());
    tx.send(req).await.unwrap();
    assert!(matches!(rx.await.unwrap(), Err(VnaError::RunActive)));

    let (req, rx) = VnaRequest::stop_continuous();
    tx.send(req).await.unwrap();
    rx.await.unwrap().unwrap();

    shutdown(&tx, worker).await;
}

#[tokio::test]
async fn test_stop_without_active_run_is_a_noop() {
    let mock = MockTransport::new();
    let settings = fast_settings();
    let (tx, _events, worker) = spawn_worker(&mock, &settings);

    let (req, rx) = VnaRequest::stop_continuous();
    tx.send(req).await.unwrap();
    assert_eq!(rx.await.unwrap().unwrap(), 0);

    shutdown(&tx, worker).await;
}

#[tokio::test]
async fn test_fetch_state_lands_in_saved_project() {
    let mock = MockTransport::new();
    mock.set_state_text("OPC?;PRES;\nPOIN201;");
    let settings = fast_settings();
    let (tx, _events, worker) = spawn_worker(&mock, &settings);

    let (req, rx) = VnaRequest::connect(16);
    tx.send(req).await.unwrap();
    rx.await.unwrap().unwrap();

    let (req, rx) = VnaRequest::fetch_state();
    tx.send(req).await.unwrap();
    let state = rx.await.unwrap().unwrap();
    assert_eq!(state, "OPC?;PRES;\nPOIN201;");

    let dir = tempfile::tempdir().unwrap();
    let (req, rx) = VnaRequest::save_project(dir.path().to_path_buf(), settings.clone());
    tx.send(req).await.unwrap();
    rx.await.unwrap().unwrap();

    let saved = std::fs::read_to_string(dir.path().join("state.txt")).unwrap();
    assert_eq!(saved, "OPC?;PRES;\nPOIN201;");

    shutdown(&tx, worker).await;
}

#[tokio::test]
async fn test_apply_state_without_one_is_recoverable() {
    let mock = MockTransport::new();
    let settings = fast_settings();
    let (tx, _events, worker) = spawn_worker(&mock, &settings);

    let (req, rx) = VnaRequest::connect(16);
    tx.send(req).await.unwrap();
    rx.await.unwrap().unwrap();

    let (req, rx) = VnaRequest::apply_state();
    tx.send(req).await.unwrap();
    let err = rx.await.unwrap().unwrap_err();
    assert!(matches!(err, VnaError::Configuration(_)));
    assert!(!err.is_fatal());

    shutdown(&tx, worker).await;
}

#[tokio::test]
async fn test_connection_events_mirror_state() {
    let mock = MockTransport::new();
    let settings = fast_settings();
    let (tx, mut events, worker) = spawn_worker(&mock, &settings);

    let (req, rx) = VnaRequest::connect(16);
    tx.send(req).await.unwrap();
    rx.await.unwrap().unwrap();
    assert_eq!(events.recv().await, Some(VnaEvent::Connected { address: 16 }));

    let (req, rx) = VnaRequest::query_state();
    tx.send(req).await.unwrap();
    assert_eq!(rx.await.unwrap(), ConnectionState::Connected);

    let (req, rx) = VnaRequest::disconnect();
    tx.send(req).await.unwrap();
    rx.await.unwrap().unwrap();
    assert_eq!(events.recv().await, Some(VnaEvent::Disconnected));

    shutdown(&tx, worker).await;
}

#[tokio::test]
async fn test_print_sweep_out_of_range() {
    let mock = MockTransport::new();
    let settings = fast_settings();
    let (tx, _events, worker) = spawn_worker(&mock, &settings);

    let (req, rx) = VnaRequest::print_sweep(7);
    tx.send(req).await.unwrap();
    assert!(matches!(rx.await.unwrap(), Err(VnaError::FrameOutOfRange(7))));

    shutdown(&tx, worker).await;
}
