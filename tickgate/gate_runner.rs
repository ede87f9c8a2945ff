use std::{fs, path::PathBuf, sync::Arc, time::Duration};

use anyhow::{bail, Context, Result};
use clap::Parser;
use serde_json::json;
use shared_event_bus::{
    FanoutPublisher, FileSamplePublisher, MemoryTelemetryBus, SamplePublisher, TelemetryValue,
};
use tickgate_gates::{GateDocument, GateTelemetry, PortInputs, ThresholdGate};
use tickgate_telemetry_source::{
    ParameterStore, SourceDocument, SourceTelemetry, TelemetryPublisher,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(
    name = "tickgate",
    version,
    about = "Runs a telemetry source and threshold gates against a fixed tick loop"
)]
struct Cli {
    /// TOML file describing the telemetry source.
    #[arg(long)]
    source_config: Option<PathBuf>,
    /// TOML file describing the gates.
    #[arg(long)]
    gate_config: Option<PathBuf>,
    /// Number of ticks to run.
    #[arg(long, default_value_t = 10)]
    ticks: u32,
    /// Milliseconds between ticks.
    #[arg(long, default_value_t = 500)]
    tick_ms: u64,
    /// Field override applied halfway through the run, as `name=value`.
    #[arg(long = "set", value_parser = parse_override)]
    overrides: Vec<(String, TelemetryValue)>,
    /// Directory for JSON-lines logs and the sample journal.
    #[arg(long)]
    log_dir: Option<PathBuf>,
}

fn parse_override(raw: &str) -> Result<(String, TelemetryValue), String> {
    let (name, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected name=value, got {raw:?}"))?;
    let name = name.trim();
    if name.is_empty() {
        return Err(format!("missing field name in {raw:?}"));
    }
    let value = value.parse::<TelemetryValue>().map_err(|err| err.to_string())?;
    Ok((name.to_string(), value))
}

struct RunContext {
    bus: MemoryTelemetryBus,
    transport: Arc<dyn SamplePublisher>,
    source_telemetry: SourceTelemetry,
    gate_telemetry: GateTelemetry,
}

impl RunContext {
    fn build(log_dir: Option<&PathBuf>) -> Result<Self> {
        let bus = MemoryTelemetryBus::new(256);
        let Some(dir) = log_dir else {
            return Ok(Self {
                transport: Arc::new(bus.clone()),
                bus,
                source_telemetry: SourceTelemetry::tracing_only("telemetry_source"),
                gate_telemetry: GateTelemetry::tracing_only("gates"),
            });
        };
        fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;
        let journal = FileSamplePublisher::new(dir.join("samples.jsonl"))
            .context("opening sample journal")?;
        let transport = FanoutPublisher::new()
            .with_target(Arc::new(bus.clone()))
            .with_target(Arc::new(journal));
        Ok(Self {
            bus,
            transport: Arc::new(transport),
            source_telemetry: SourceTelemetry::builder("telemetry_source")
                .log_path(dir.join("source.log.jsonl"))
                .build()?,
            gate_telemetry: GateTelemetry::builder("gates")
                .log_path(dir.join("gates.log.jsonl"))
                .build()?,
        })
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    if cli.tick_ms == 0 {
        bail!("--tick-ms must be positive");
    }
    let source = match &cli.source_config {
        Some(path) => SourceDocument::load(path)?,
        None => SourceDocument::default(),
    };
    let gate_doc = match &cli.gate_config {
        Some(path) => GateDocument::load(path)?,
        None => GateDocument::default(),
    };
    let ctx = RunContext::build(cli.log_dir.as_ref())?;

    let mut gates: Vec<(ThresholdGate, PortInputs)> = Vec::with_capacity(gate_doc.gates.len());
    for entry in &gate_doc.gates {
        let gate = ThresholdGate::builder(entry.spec())
            .telemetry(ctx.gate_telemetry.clone())
            .spawn(&ctx.bus)
            .await
            .with_context(|| format!("spawning gate {}", entry.name))?;
        gates.push((gate, entry.port_inputs()));
    }

    let publisher = source
        .channels
        .iter()
        .fold(
            TelemetryPublisher::builder(
                Arc::new(ParameterStore::new()),
                Arc::clone(&ctx.transport),
            )
            .channel_prefix(&source.channel_prefix)
            .telemetry(ctx.source_telemetry.clone()),
            |builder, (field, channel)| builder.channel_override(field, channel),
        )
        .build();
    let publisher = Arc::new(publisher);
    publisher
        .configure(&source.fields)
        .context("configuring telemetry source")?;
    let emitter = publisher
        .spawn(source.period())
        .context("starting telemetry source")?;

    let mut interval = tokio::time::interval(Duration::from_millis(cli.tick_ms));
    let halfway = cli.ticks / 2;
    for tick in 0..cli.ticks {
        interval.tick().await;
        if tick == halfway {
            for (name, value) in &cli.overrides {
                let ack = publisher.on_reconfigure(name, *value);
                println!(
                    "{}",
                    json!({ "tick": tick, "set": name, "value": value, "ack": ack })
                );
            }
        }
        for (gate, inputs) in &gates {
            let verdict = gate.evaluate(inputs);
            println!(
                "{}",
                json!({ "tick": tick, "gate": gate.spec().name, "verdict": verdict })
            );
        }
    }

    for (gate, _) in &gates {
        gate.shutdown().await;
    }
    emitter.shutdown().await;
    ctx.bus.close();
    tracing::info!(cycles = publisher.cycles(), "tickgate run finished");
    Ok(())
}
