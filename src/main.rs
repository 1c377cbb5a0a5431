//! CLI entry point for vna-daq.
//!
//! Provides a command-line interface for:
//! - Running a single sweep and printing/saving it
//! - Free-running sweep acquisition for a fixed time
//! - A raw interactive terminal to the hpctrl bus program
//!
//! # Usage
//!
//! Single sweep against the simulator:
//! ```bash
//! vna-daq --mock measure
//! ```
//!
//! Ten seconds of continuous sweeps, saved as a project:
//! ```bash
//! vna-daq sweep --seconds 10 --output runs/monday
//! ```

use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, oneshot};
use vna_daq::actor::VnaActor;
use vna_daq::config::Settings;
use vna_daq::measurement::{Dataset, SParam};
use vna_daq::messages::{VnaEvent, VnaRequest};
use vna_daq::session::VnaSession;
use vna_daq::transport::{HpctrlTransport, MockTransport, Transport};

#[derive(Parser)]
#[command(name = "vna-daq")]
#[command(about = "HP-8753 network analyzer bench controller", long_about = None)]
struct Cli {
    /// Configuration profile name (loaded from config/<name>.toml)
    #[arg(long)]
    config: Option<String>,

    /// Use the in-process analyzer simulator instead of launching hpctrl
    #[arg(long)]
    mock: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one sweep and print it
    Measure {
        /// GPIB address override
        #[arg(long)]
        address: Option<u8>,

        /// Save the resulting project to this directory
        #[arg(long)]
        output: Option<PathBuf>,
    },

    /// Free-running sweeps for a fixed time
    Sweep {
        /// How long to acquire before stopping
        #[arg(long, default_value = "10")]
        seconds: u64,

        /// Save the resulting project to this directory
        #[arg(long)]
        output: Option<PathBuf>,
    },

    /// Interactive raw terminal to the bus program
    Terminal {
        /// GPIB address override
        #[arg(long)]
        address: Option<u8>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();

    let cli = Cli::parse();
    let mut settings = Settings::new(cli.config.as_deref())?;
    settings.validate()?;

    let (mock, transport): (Option<MockTransport>, Box<dyn Transport>) = if cli.mock {
        let mock = MockTransport::new();
        (Some(mock.clone()), Box::new(mock))
    } else {
        (
            None,
            Box::new(HpctrlTransport::new(&settings.hpctrl, &settings.timeouts)),
        )
    };

    let session = VnaSession::new(transport, &settings);
    let (request_tx, event_rx, worker) = VnaActor::spawn(session);

    let outcome = match cli.command {
        Commands::Measure { address, output } => {
            if let Some(address) = address {
                settings.address = address;
            }
            if let Some(mock) = &mock {
                seed_simulator(mock, &settings, 1);
            }
            run_measure(&request_tx, settings.clone(), output).await
        }
        Commands::Sweep { seconds, output } => {
            if let Some(mock) = &mock {
                seed_simulator(mock, &settings, 5);
            }
            run_sweep(&request_tx, event_rx, settings.clone(), seconds, output).await
        }
        Commands::Terminal { address } => {
            if let Some(address) = address {
                settings.address = address;
            }
            run_terminal(&request_tx, settings.address).await
        }
    };

    let (req, rx) = VnaRequest::shutdown();
    if request_tx.send(req).await.is_ok() {
        let _ = rx.await;
    }
    worker.await?;

    outcome
}

/// Sends a request and awaits its oneshot reply.
async fn request<T>(
    tx: &mpsc::Sender<VnaRequest>,
    req: VnaRequest,
    rx: oneshot::Receiver<T>,
) -> Result<T> {
    tx.send(req)
        .await
        .map_err(|_| anyhow!("instrument worker stopped"))?;
    rx.await
        .map_err(|_| anyhow!("instrument worker dropped the request"))
}

async fn run_measure(
    tx: &mpsc::Sender<VnaRequest>,
    settings: Settings,
    output: Option<PathBuf>,
) -> Result<()> {
    let (req, rx) = VnaRequest::measure(settings.clone());
    let frame = request(tx, req, rx).await??;
    println!("sweep collected (frame {})", frame);

    let (req, rx) = VnaRequest::print_sweep(frame);
    let text = request(tx, req, rx).await??;
    println!("{}", text);

    if let Some(dir) = output {
        let (req, rx) = VnaRequest::save_project(dir.clone(), settings);
        request(tx, req, rx).await??;
        println!("project saved to {}", dir.display());
    }
    Ok(())
}

async fn run_sweep(
    tx: &mpsc::Sender<VnaRequest>,
    mut event_rx: mpsc::UnboundedReceiver<VnaEvent>,
    settings: Settings,
    seconds: u64,
    output: Option<PathBuf>,
) -> Result<()> {
    let (req, rx) = VnaRequest::start_continuous(settings.clone());
    request(tx, req, rx).await??;
    println!("continuous run started, acquiring for {}s", seconds);

    let deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(seconds);
    loop {
        match tokio::time::timeout_at(deadline, event_rx.recv()).await {
            Ok(Some(VnaEvent::SweepAppended { frame })) => {
                println!("sweep {} collected", frame + 1);
            }
            Ok(Some(VnaEvent::Warning(text))) => eprintln!("warning: {}", text),
            Ok(Some(VnaEvent::Disconnected)) => {
                return Err(anyhow!("connection lost during continuous run"));
            }
            Ok(Some(_)) => {}
            Ok(None) => return Err(anyhow!("instrument worker stopped")),
            Err(_) => break,
        }
    }

    let (req, rx) = VnaRequest::stop_continuous();
    let frames = request(tx, req, rx).await??;
    println!("continuous run finished with {} sweeps", frames);

    if let Some(dir) = output {
        let (req, rx) = VnaRequest::save_project(dir.clone(), settings);
        request(tx, req, rx).await??;
        println!("project saved to {}", dir.display());
    }
    Ok(())
}

async fn run_terminal(tx: &mpsc::Sender<VnaRequest>, address: u8) -> Result<()> {
    let (req, rx) = VnaRequest::connect(address);
    request(tx, req, rx).await??;
    println!("connected at GPIB address {}; type commands, 'quit' to leave", address);

    let mut stdout = tokio::io::stdout();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        stdout.write_all(b"> ").await?;
        stdout.flush().await?;
        let line = match lines.next_line().await? {
            Some(line) => line,
            None => break,
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if line == "quit" {
            break;
        }
        let (req, rx) = VnaRequest::terminal_send(line.to_string());
        match request(tx, req, rx).await? {
            Ok(reply) if reply.is_empty() => {}
            Ok(reply) => println!("{}", reply),
            Err(e) => eprintln!("error: {}", e),
        }
    }

    let (req, rx) = VnaRequest::disconnect();
    request(tx, req, rx).await??;
    Ok(())
}

/// Loads the simulator with synthetic sweeps shaped like real hpctrl output
/// so `--mock` runs end to end without hardware.
fn seed_simulator(mock: &MockTransport, settings: &Settings, sweeps: usize) {
    let mut params = settings.parameters.clone();
    params.sort();
    params.dedup();
    // Value pairs go out in the same column order the dataset reads them,
    // with the S12/S21 swap the device applies.
    let columns = Dataset::wire_order(&params);

    for n in 0..sweeps {
        let mut raw = String::new();
        for param in &params {
            raw.push_str(&format!("!{} sweep done\n", param));
        }
        let names: Vec<&str> = params.iter().map(|p| p.as_str()).collect();
        raw.push_str(&format!("!    Params: {}\n", names.join(" ")));
        raw.push_str("# HZ S RI R 50\n");

        let points = settings.points.max(1);
        let start = settings.freq_start * settings.frequency_unit.hertz();
        let stop = settings.freq_stop * settings.frequency_unit.hertz();
        for i in 0..points {
            let fraction = f64::from(i) / f64::from(points.max(2) - 1);
            let freq = start + (stop - start) * fraction;
            raw.push_str(&format!("{:.0}", freq));
            for param in &columns {
                raw.push_str(&format!(
                    " {:.6} {:.6}",
                    0.5 - 0.01 * n as f64,
                    0.001 * param_tag(*param)
                ));
            }
            raw.push('\n');
        }
        mock.queue_sweep(&raw);
    }
}

/// Small per-parameter offset so simulator traces are told apart.
fn param_tag(param: SParam) -> f64 {
    match param {
        SParam::S11 => 0.0,
        SParam::S12 => 1.0,
        SParam::S21 => 2.0,
        SParam::S22 => 3.0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    // Both transmission parameters: the device sends S21 before S12, and
    // the dataset reads the columns that way. Seeded data has to agree.
    #[tokio::test]
    async fn test_seeded_columns_match_dataset_attribution() {
        let mock = MockTransport::new();
        let mut settings = Settings::default();
        settings.points = 3;
        settings.parameters = vec![SParam::S12, SParam::S21];
        seed_simulator(&mock, &settings, 1);

        let mut transport: Box<dyn Transport> = Box::new(mock.clone());
        transport.send("S12").await.unwrap();
        transport.send("S21").await.unwrap();
        transport.send("MEASURE").await.unwrap();
        let raw = transport
            .receive(Duration::from_millis(10), 64)
            .await
            .unwrap();

        let mut dataset = Dataset::new(&settings.parameters).unwrap();
        dataset.add_measurement(&raw).unwrap();

        let s21 = dataset.get_measurement(SParam::S21, 0).unwrap();
        let s12 = dataset.get_measurement(SParam::S12, 0).unwrap();
        assert_eq!(s21.len(), 3);
        for (_, (_, im)) in &s21 {
            assert!((im - 0.002).abs() < 1e-9);
        }
        for (_, (_, im)) in &s12 {
            assert!((im - 0.001).abs() < 1e-9);
        }
    }
}
