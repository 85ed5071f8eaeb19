use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use imc_core::{
    decode_inbound, Coordinates, Fingerprint, FingerprintSignals, InboundEvent, InboundFrame,
};
use imc_reconcile::{RecordingLayer, ReportListDocument, ReportNode};
use imc_session::{MapSession, MapSurface, SessionConfig};
use tokio::sync::mpsc;
use tracing::{debug, info};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "imc-cli")]
#[command(about = "Incident map client driver")]
struct Cli {
    /// Session config file; environment variables apply otherwise.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log filter, e.g. `debug` or `imc_reconcile=trace`. Falls back to RUST_LOG.
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Replay inbound events (one JSON envelope per line) against a simulated map.
    Replay {
        events: PathBuf,
        /// JSON array of report nodes already rendered before mount.
        #[arg(long)]
        document: Option<PathBuf>,
        #[arg(long, default_value = "replay")]
        fingerprint: String,
        /// Run one expiry sweep at this instant after the last event.
        #[arg(long)]
        sweep_at: Option<DateTime<Utc>>,
    },
    /// Print the device fingerprint for a signals file.
    Fingerprint { signals: PathBuf },
    /// Print the local bounding-box decision for a point.
    Fallback {
        #[arg(long, allow_negative_numbers = true)]
        lat: f64,
        #[arg(long, allow_negative_numbers = true)]
        lng: f64,
    },
}

fn init_tracing(log_level: Option<&str>) {
    let filter = match log_level {
        Some(level) => EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("warn")),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
    };
    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .init();
}

fn load_config(path: Option<&Path>) -> Result<SessionConfig> {
    match path {
        Some(path) => SessionConfig::from_yaml_file(path),
        None => Ok(SessionConfig::from_env()),
    }
}

fn read_events(path: &Path) -> Result<Vec<InboundEvent>> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    parse_events(&text, &path.display().to_string())
}

/// One envelope per line. Events this client does not handle are skipped.
fn parse_events(text: &str, origin: &str) -> Result<Vec<InboundEvent>> {
    let mut events = Vec::new();
    for (idx, line) in text.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let frame = decode_inbound(line)
            .with_context(|| format!("{}:{}: not an inbound event", origin, idx + 1))?;
        match frame {
            InboundFrame::Event(event) => events.push(event),
            InboundFrame::Unrecognized(name) => {
                debug!(event = %name, line = idx + 1, "unhandled event skipped");
            }
        }
    }
    Ok(events)
}

fn read_document(path: Option<&Path>) -> Result<ReportListDocument> {
    let Some(path) = path else {
        return Ok(ReportListDocument::default());
    };
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    let nodes: Vec<ReportNode> = serde_json::from_str(&text)
        .with_context(|| format!("parsing report nodes in {}", path.display()))?;
    Ok(ReportListDocument::new(nodes))
}

async fn replay(
    config: SessionConfig,
    events: &Path,
    document: Option<&Path>,
    fingerprint: Fingerprint,
    sweep_at: Option<DateTime<Utc>>,
) -> Result<serde_json::Value> {
    let events = read_events(events)?;
    let surface = MapSurface {
        layer: Box::new(RecordingLayer::new()),
        document: Box::new(read_document(document)?),
    };
    let (outbound, mut bus) = mpsc::unbounded_channel();
    let mut session = MapSession::mount(config, fingerprint, Some(surface), outbound)?;

    let total = events.len();
    for event in events {
        session.handle_inbound(event).await;
    }
    let swept = sweep_at.map(|at| session.sweep(at)).unwrap_or_default();
    info!(events = total, swept = swept.len(), "replay finished");

    let snapshot = session.snapshot();
    session.dispose();

    let mut sent = Vec::new();
    while let Ok(event) = bus.try_recv() {
        sent.push(event);
    }
    Ok(serde_json::json!({
        "snapshot": snapshot,
        "swept": swept,
        "outbound": sent,
    }))
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_level.as_deref());
    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Replay {
            events,
            document,
            fingerprint,
            sweep_at,
        } => {
            let output = replay(
                config,
                &events,
                document.as_deref(),
                Fingerprint::new(fingerprint),
                sweep_at,
            )
            .await?;
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        Commands::Fingerprint { signals } => {
            let text = std::fs::read_to_string(&signals)
                .with_context(|| format!("reading {}", signals.display()))?;
            let signals: FingerprintSignals =
                serde_json::from_str(&text).context("parsing fingerprint signals")?;
            println!("{}", Fingerprint::from_signals(&signals));
        }
        Commands::Fallback { lat, lng } => {
            let at = Coordinates::new(lat, lng);
            let valid = config.validator.fallback.contains(&at);
            println!(
                "{}",
                serde_json::json!({ "latitude": lat, "longitude": lng, "valid": valid })
            );
        }
    }

    Ok(())
}
