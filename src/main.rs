use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use serde::Serialize;
use tracing_subscriber::EnvFilter;

use post_many::config::{OptionOverrides, UploadOptions, MIB};
use post_many::scheduler::{Progress, Upload, Uploader};
use post_many::shutdown::install_shutdown_handler;
use post_many::sim::{MinerConfig, SimSource, SimTarget, SizeProfile};

#[derive(Parser, Debug)]
#[command(name = "post-many")]
#[command(version)]
#[command(about = "Simulate a quota-bounded upload to a ledger that mines and orphans blocks")]
struct Args {
    /// Number of items to upload
    #[arg(long, default_value = "20")]
    items: usize,

    /// Maximum MiB in flight (pending + mined)
    #[arg(long, default_value = "50")]
    max_pending_mib: u64,

    /// Maximum number of items in flight (pending + mined)
    #[arg(long, default_value = "12")]
    max_pending_txs: usize,

    /// Largest item size in MiB
    #[arg(long, default_value = "10")]
    max_item_mib: u64,

    /// Confirmations before an item is complete
    #[arg(long, default_value = "4")]
    confirmations: u32,

    /// Seconds between status checks, before time scaling
    #[arg(long, default_value = "20")]
    poll_secs: f64,

    /// Maximum seconds between simulated blocks, before time scaling
    #[arg(long, default_value = "120")]
    block_time_secs: f64,

    /// Multiplier applied to poll and block times
    #[arg(long, default_value = "0.1")]
    time_scale: f64,

    /// Chance that recent blocks are orphaned before each new block
    #[arg(long, default_value = "0.1")]
    orphan_chance: f64,

    /// Smallest simulated item in KiB
    #[arg(long, default_value = "256")]
    min_item_kib: u64,

    /// Snapshot file: resumed from if present, written on exit. The simulated
    /// chain is kept next to it with a `.chain.json` extension
    #[arg(long)]
    snapshot: Option<PathBuf>,

    /// Output format
    #[arg(long, short = 'o', default_value = "table")]
    output: OutputFormat,
}

#[derive(Debug, Clone, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

#[derive(Serialize)]
struct ProgressLine {
    phase: String,
    queued: usize,
    pending: usize,
    pending_bytes: u64,
    in_flight_bytes: u64,
    mined: usize,
    complete: usize,
}

impl From<&Progress> for ProgressLine {
    fn from(p: &Progress) -> Self {
        Self {
            phase: format!("{:?}", p.phase).to_lowercase(),
            queued: p.queued.len(),
            pending: p.pending.len(),
            pending_bytes: p.pending_bytes,
            in_flight_bytes: p.in_flight_bytes,
            mined: p.mined.len(),
            complete: p.complete.len(),
        }
    }
}

fn print_progress(progress: &Progress, format: &OutputFormat) -> Result<(), Box<dyn std::error::Error>> {
    let line = ProgressLine::from(progress);
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string(&line)?),
        OutputFormat::Table => println!(
            "[{:<10}] Queued: {:>4}, Pending: {:>4} ({:.2} MiB), Mined: {:>4}, Completed: {:>4}",
            line.phase,
            line.queued,
            line.pending,
            line.pending_bytes as f64 / MIB as f64,
            line.mined,
            line.complete,
        ),
    }
    Ok(())
}

fn options_from_args(args: &Args) -> UploadOptions {
    UploadOptions::default()
        .with_max_pending_bytes(args.max_pending_mib * MIB)
        .with_max_pending_txs(args.max_pending_txs)
        .with_max_item_size(args.max_item_mib * MIB)
        .with_confirmations_required(args.confirmations)
        .with_poll_interval(Duration::from_secs_f64(
            (args.poll_secs * args.time_scale).max(0.0),
        ))
}

async fn load_or_create(args: &Args, options: UploadOptions) -> post_many::Result<Upload> {
    if let Some(path) = &args.snapshot {
        if tokio::fs::try_exists(path).await? {
            let overrides = OptionOverrides {
                poll_interval: Some(options.poll_interval),
                ..Default::default()
            };
            let upload = Upload::load(path, &overrides).await?;
            tracing::info!(path = %path.display(), items = upload.len(), "Resuming from snapshot");
            return Ok(upload);
        }
    }
    let keys = (0..args.items).map(|i| format!("random_file_{}.bin", i));
    Upload::new(keys, options)
}

fn chain_path(snapshot: &Path) -> PathBuf {
    snapshot.with_extension("chain.json")
}

async fn load_or_create_target(args: &Args) -> Result<SimTarget, Box<dyn std::error::Error>> {
    if let Some(path) = &args.snapshot {
        let path = chain_path(path);
        if tokio::fs::try_exists(&path).await? {
            let json = tokio::fs::read_to_string(&path).await?;
            let target = SimTarget::from_chain_json(&json)?;
            tracing::info!(path = %path.display(), height = target.height().await, "Restored simulated chain");
            return Ok(target);
        }
    }
    Ok(SimTarget::new())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let options = options_from_args(&args);
    options.validate()?;

    let upload = load_or_create(&args, options).await?;
    let shutdown = install_shutdown_handler()?;

    println!(
        "Simulating {} items with random sizes, waiting for {} confirmations",
        upload.len(),
        upload.options.confirmations_required
    );
    println!(
        "Maximum of {:.2} MiB or {} items in flight at once",
        upload.options.max_pending_bytes as f64 / MIB as f64,
        upload.options.max_pending_txs
    );

    let source = SimSource::new(SizeProfile::Random {
        min: (args.min_item_kib * 1024).min(upload.options.max_item_size),
        max: upload.options.max_item_size,
    });
    let target = Arc::new(load_or_create_target(&args).await?);

    let miner_token = shutdown.child_token();
    let miner = tokio::spawn(target.clone().run_miner(
        MinerConfig {
            block_time: Duration::from_secs_f64((args.block_time_secs * args.time_scale).max(0.0)),
            orphan_chance: args.orphan_chance,
            ..Default::default()
        },
        miner_token.clone(),
    ));

    let mut uploader = Uploader::new(upload, source, target.clone());
    let outcome = loop {
        if shutdown.is_cancelled() {
            tracing::info!("Stopping before next step");
            break Ok(());
        }
        match uploader.step().await {
            Ok(Some(progress)) => print_progress(&progress, &args.output)?,
            Ok(None) => break Ok(()),
            Err(e) => break Err(e),
        }
    };

    miner_token.cancel();
    miner.await?;

    if let Some(path) = &args.snapshot {
        uploader.upload().save(path).await?;
        tokio::fs::write(chain_path(path), target.chain_to_json().await?).await?;
        tracing::info!(path = %path.display(), "Snapshot written");
    }

    outcome?;

    println!(
        "Posted {} submissions ({:.2} MiB) for {} items",
        target.posted(),
        target.posted_bytes() as f64 / MIB as f64,
        uploader.upload().len()
    );
    Ok(())
}
