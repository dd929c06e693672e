use std::{net::IpAddr, path::PathBuf, sync::Arc};

use anyhow::{Context, Result};
use clap::Parser;
use mpcstream::{
    catalog::SegmentCatalog,
    config::Settings,
    controller::RateController,
    playback::Player,
    session::SessionRegistry,
    simulator::StreamSimulator,
    table::QuantizedDecisionTable,
};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt};

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Segment metadata: `<bitrate> <frame> <layer> <size> <quality>` per line
    #[arg(short, long, env = "MPCSTREAM_METADATA")]
    metadata: PathBuf,

    /// FastMPC decision table: `<bandwidth>\t<buffer>\t<prerate>\t<next>` per line
    #[arg(short, long, env = "MPCSTREAM_TABLE")]
    table: PathBuf,

    /// TOML settings file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Number of segments to play (default: whole video)
    #[arg(short, long)]
    segments: Option<usize>,

    /// Pace deliveries to this many kbps
    #[arg(short, long)]
    rate_limit_kbps: Option<f64>,

    /// Buffer level the player starts with, in seconds
    #[arg(short, long)]
    buffer_level: Option<f64>,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("mpcstream=info"));
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_writer(std::io::stderr);
    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .init();

    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to build tokio runtime")?;
    rt.block_on(run(args))
}

async fn run(args: Args) -> Result<()> {
    let mut settings = Settings::load(args.config.as_deref()).context("failed to load settings")?;
    if args.segments.is_some() {
        settings.playback.segments = args.segments;
    }
    if args.rate_limit_kbps.is_some() {
        settings.delivery.rate_limit_kbps = args.rate_limit_kbps;
    }
    if let Some(buffer) = args.buffer_level {
        settings.playback.initial_buffer_secs = buffer;
    }
    settings.validate()?;

    let catalog = SegmentCatalog::from_path(&args.metadata)
        .with_context(|| format!("failed to load metadata {}", args.metadata.display()))?;
    let table = QuantizedDecisionTable::from_path(&args.table)
        .with_context(|| format!("failed to load decision table {}", args.table.display()))?;
    tracing::info!(
        bitrates = ?catalog.bitrates().collect::<Vec<_>>(),
        table_entries = table.len(),
        "inputs loaded"
    );

    let client: IpAddr = [127, 0, 0, 1].into();
    let mut registry = SessionRegistry::new(StreamSimulator::new(settings.delivery_config()));
    let session = registry.open(client, Arc::new(catalog));

    let mut player = Player::new(
        RateController::new(Arc::new(table)),
        settings.estimator(),
        settings.playback_config(),
    );

    let shutdown = CancellationToken::new();
    let ctrl_c = {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("interrupted, cancelling playback");
                shutdown.cancel();
            }
        })
    };

    let report = player
        .run(session, &mut tokio::io::sink(), &shutdown)
        .await
        .context("playback failed")?;
    ctrl_c.abort();

    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
