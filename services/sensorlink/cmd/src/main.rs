//! Sensorlink command line tool.
//!
//! Replays captured device traffic through the retrieval state machine and
//! decodes individual records or packets for inspection.

use anyhow::Context;
use clap::{Parser, Subcommand};
use sensorlink_session::{load_capture, DeviceSession, DeviceSessionReport, ScriptedTransport, SessionConfig};
use sensorlink_storage::{open_sink, DeviceId, MemorySink, Sink, SinkMode};
use sensorlink_wire::{
    decode_record, hex, Packet, PacketOutcome, PacketProcessor, TimestampPolicy, PACKET_SIZE,
};
use std::path::{Path, PathBuf};
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::EnvFilter;

mod config;
mod logging;

use config::{SensorLinkConfig, SinkKind};
use logging::SensorLinkLogFormatter;

/// Sensor telemetry decoder and retrieval driver
#[derive(Parser, Debug)]
#[command(name = "sensorlink", version, about = "Sensor telemetry decoder and retrieval driver")]
struct Args {
    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", global = true)]
    log_level: String,

    /// Configuration file path
    #[arg(long, default_value = "sensorlink.yaml", global = true)]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a device session against a capture file
    Replay(ReplayArgs),
    /// Decode one 30-byte record or one 240-byte packet given as hex
    Decode(DecodeArgs),
}

#[derive(clap::Args, Debug)]
struct ReplayArgs {
    /// Capture file
    capture: PathBuf,

    /// Device id records are stored under
    #[arg(long)]
    device_id: Option<String>,

    /// Packet budget
    #[arg(long)]
    max_packets: Option<u32>,

    /// Fragment reads per packet
    #[arg(long)]
    max_reads: Option<u32>,

    /// Wait for the handoff notification, e.g. 10s
    #[arg(long)]
    handoff_timeout: Option<humantime::Duration>,

    /// Reject implausible timestamps instead of substituting
    #[arg(long)]
    reject_implausible: bool,

    /// Stream live notifications after the retrieval
    #[arg(long)]
    live: bool,

    /// Skip the historical log
    #[arg(long, requires = "live")]
    skip_history: bool,

    /// Sink mode: memory, file
    #[arg(long)]
    sink: Option<SinkKind>,

    /// Data directory for the file sink
    #[arg(long)]
    data_dir: Option<PathBuf>,
}

#[derive(clap::Args, Debug)]
struct DecodeArgs {
    /// Hex bytes, whitespace allowed
    hex: Vec<String>,

    /// Reject implausible timestamps instead of substituting
    #[arg(long)]
    reject_implausible: bool,
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let env_filter = EnvFilter::new("warn")
        .add_directive(format!("sensorlink={}", args.log_level).parse()?)
        .add_directive(format!("sensorlink_session={}", args.log_level).parse()?)
        .add_directive(format!("sensorlink_storage={}", args.log_level).parse()?)
        .add_directive(format!("sensorlink_wire={}", args.log_level).parse()?);

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .with_ansi(true)
        .event_format(SensorLinkLogFormatter::new("sensorlink".to_string()))
        .init();

    match args.command {
        Command::Replay(replay_args) => replay(&args.config, replay_args).await,
        Command::Decode(decode_args) => decode(decode_args),
    }
}

async fn replay(config_path: &Path, args: ReplayArgs) -> anyhow::Result<()> {
    info!("Starting sensorlink v{}", env!("CARGO_PKG_VERSION"));

    let mut config = SensorLinkConfig::load_from_file(config_path);
    if let Some(sink) = args.sink {
        config.sink.mode = sink;
    }
    if let Some(data_dir) = args.data_dir.clone() {
        config.sink.data_dir = data_dir;
    }
    let session_config = apply_cli_overrides(config.session_config()?, &args);

    let mut transport = load_capture(&args.capture)
        .await
        .with_context(|| format!("Failed to load capture {:?}", args.capture))?
        .notify_capacity(config.streaming.notification_buffer);
    component_info!(
        "replay",
        "Replaying {:?} for device {}",
        args.capture,
        session_config.device_id
    );

    let (stop_tx, stop_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            component_info!("replay", "Interrupt received, stopping");
            let _ = stop_tx.send(true);
        }
    });

    let report = match config.sink.sink_mode() {
        SinkMode::InMemory => {
            let sink = MemorySink::new();
            let report = run_session(&mut transport, &sink, session_config, stop_rx).await?;
            print_records(&sink)?;
            report
        }
        mode => {
            let sink = open_sink(mode).await.context("Failed to open sink")?;
            run_session(&mut transport, sink.as_ref(), session_config, stop_rx).await?
        }
    };

    print_summary(&report);
    Ok(())
}

fn apply_cli_overrides(mut session: SessionConfig, args: &ReplayArgs) -> SessionConfig {
    if let Some(device_id) = &args.device_id {
        session.device_id = DeviceId::new(device_id.clone());
    }
    if let Some(max_packets) = args.max_packets {
        session.max_packets = max_packets;
    }
    if let Some(max_reads) = args.max_reads {
        session.max_reads_per_packet = max_reads;
    }
    if let Some(timeout) = args.handoff_timeout {
        session.handoff_timeout = timeout.into();
    }
    if args.reject_implausible {
        session.timestamp_policy = TimestampPolicy::Reject;
    }
    session.live_streaming |= args.live;
    session.skip_history = args.skip_history;
    session
}

async fn run_session(
    transport: &mut ScriptedTransport,
    sink: &dyn Sink,
    config: SessionConfig,
    stop: watch::Receiver<bool>,
) -> anyhow::Result<DeviceSessionReport> {
    let device_id = config.device_id.clone();
    DeviceSession::run(transport, sink, config, stop)
        .await
        .with_context(|| format!("Session for {} failed", device_id))
}

fn print_records(sink: &MemorySink) -> anyhow::Result<()> {
    for device in sink.devices() {
        for record in sink.records(&device) {
            let line = serde_json::json!({ "device": device, "record": record });
            println!("{}", serde_json::to_string(&line)?);
        }
    }
    Ok(())
}

fn print_summary(report: &DeviceSessionReport) {
    if let Some(retrieval) = &report.retrieval {
        component_info!(
            "replay",
            "Retrieval {}: {} records, {} packets, {} duplicate packets, {} fragment reads",
            retrieval.final_state,
            retrieval.stats.records_emitted,
            retrieval.stats.packets,
            retrieval.stats.duplicate_packets,
            retrieval.stats.fragment_reads
        );
        if retrieval.is_aborted() {
            component_warn!("replay", "Retrieval did not complete");
        }
    }
    if let Some(stream) = &report.stream {
        component_info!(
            "replay",
            "Live stream ended ({:?}): {} records from {} notifications",
            stream.end,
            stream.stats.records_emitted,
            stream.stats.notifications
        );
    }
}

fn decode(args: DecodeArgs) -> anyhow::Result<()> {
    let text: String = args
        .hex
        .concat()
        .chars()
        .filter(|c| !c.is_whitespace())
        .collect();
    let bytes = hex::decode(&text).context("Invalid hex input")?;
    let policy = if args.reject_implausible {
        TimestampPolicy::Reject
    } else {
        TimestampPolicy::Substitute
    };
    let now = sensorlink_session::wall_clock_secs();

    let output = if bytes.len() == PACKET_SIZE {
        let packet = Packet::new(bytes.into())?;
        component_debug!("decode", "Decoding packet {}", packet.to_hex());
        match PacketProcessor::new(policy).process(&packet, now) {
            PacketOutcome::Terminal => serde_json::json!({ "terminal": true }),
            PacketOutcome::Duplicate => serde_json::json!({ "duplicate": true }),
            PacketOutcome::Records(summary) => serde_json::json!({
                "records": summary.records,
                "empty_slots": summary.empty_slots,
                "duplicate_timestamps": summary.duplicate_timestamps,
                "rejected_slots": summary.rejected_slots,
            }),
        }
    } else {
        let record = decode_record(&bytes, now, policy)?;
        serde_json::json!({ "record": record })
    };

    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}
