//! StreamBlob command-line tool
//!
//! Inspect and edit a blob storage file:
//! - create a storage file
//! - put, get, rewrite and delete records
//! - show statistics and verify counters against a full scan
//! - compact into a new file
//!
//! # Examples
//!
//! ```bash
//! # Create a storage with the default configuration
//! streamblob --path data/blobs.sb init
//!
//! # Store a record from a file and read it back
//! streamblob --path data/blobs.sb put --input photo.jpg
//! streamblob --path data/blobs.sb get 1 --output copy.jpg
//!
//! # Statistics as JSON
//! streamblob --path data/blobs.sb stats --json
//!
//! # Drop tombstones and deleted slots
//! streamblob --path data/blobs.sb compact data/blobs-compacted.sb
//! ```

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use std::io::Write;
use std::path::{Path, PathBuf};
use streamblob::storage::{AnyPagedStorage, BlobStorage, RecordId, WriteOutcome};
use streamblob::StorageConfig;
use tracing::info;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// StreamBlob - page-backed blob storage
#[derive(Parser, Debug)]
#[command(name = "streamblob")]
#[command(version = streamblob::VERSION)]
#[command(about = "StreamBlob - page-backed blob storage with stable record ids", long_about = None)]
struct Cli {
    /// Subcommand to execute
    #[command(subcommand)]
    command: Commands,

    /// Storage file path
    #[arg(
        long,
        global = true,
        default_value = "data/streamblob.sb",
        env = "STREAMBLOB_PATH"
    )]
    path: PathBuf,

    /// TOML configuration file (environment overrides use STREAMBLOB__<FIELD>)
    #[arg(long, global = true, env = "STREAMBLOB_CONFIG")]
    config: Option<PathBuf>,

    /// Log directory path
    #[arg(long, global = true, default_value = "logs", env = "STREAMBLOB_LOG_DIR")]
    log_dir: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, default_value = "warn", env = "RUST_LOG")]
    log_level: String,

    /// Disable colored output
    #[arg(long, global = true)]
    no_color: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create the storage file if it does not exist
    Init,

    /// Store a new record and print its id
    Put(PayloadArgs),

    /// Print a record's payload
    Get {
        /// Record id
        id: u32,
        /// Write the payload to this file instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Replace a record's payload
    Write {
        /// Record id
        id: u32,
        #[command(flatten)]
        payload: PayloadArgs,
    },

    /// Delete a record
    Delete {
        /// Record id
        id: u32,
    },

    /// Show storage statistics
    Stats {
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },

    /// Recompute counters by a full scan and compare
    Verify,

    /// List live records in file order
    List {
        /// Stop after this many records
        #[arg(short, long)]
        limit: Option<u64>,
    },

    /// Copy live records into a new storage file
    Compact {
        /// Destination file (must not exist)
        dest: PathBuf,
    },

    /// Print the effective configuration as TOML
    Config,
}

/// Payload source: inline text or a file
#[derive(Args, Debug)]
struct PayloadArgs {
    /// Payload as UTF-8 text
    #[arg(conflicts_with = "input", required_unless_present = "input")]
    data: Option<String>,

    /// Read the payload from this file
    #[arg(short, long)]
    input: Option<PathBuf>,
}

impl PayloadArgs {
    fn load(&self) -> anyhow::Result<Vec<u8>> {
        match (&self.data, &self.input) {
            (_, Some(path)) => std::fs::read(path)
                .with_context(|| format!("Failed to read payload from {}", path.display())),
            (Some(data), None) => Ok(data.as_bytes().to_vec()),
            (None, None) => anyhow::bail!("No payload given"),
        }
    }
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let _log_guard = setup_logging(&cli)?;

    let config = StorageConfig::load(cli.config.as_deref()).context("Failed to load configuration")?;

    match cli.command {
        Commands::Init => init_command(&cli.path, &config),
        Commands::Put(payload) => put_command(&cli.path, &config, payload),
        Commands::Get { id, output } => get_command(&cli.path, &config, id, output),
        Commands::Write { id, payload } => write_command(&cli.path, &config, id, payload),
        Commands::Delete { id } => delete_command(&cli.path, &config, id),
        Commands::Stats { json } => stats_command(&cli.path, &config, json),
        Commands::Verify => verify_command(&cli.path, &config),
        Commands::List { limit } => list_command(&cli.path, &config, limit),
        Commands::Compact { dest } => compact_command(&cli.path, &config, &dest),
        Commands::Config => {
            print!("{}", config.to_toml()?);
            Ok(())
        }
    }
}

/// Setup logging with rolling files and console output
///
/// Console output goes to stderr so payloads written to stdout stay clean.
fn setup_logging(cli: &Cli) -> anyhow::Result<tracing_appender::non_blocking::WorkerGuard> {
    std::fs::create_dir_all(&cli.log_dir)?;

    let file_appender = RollingFileAppender::new(Rotation::DAILY, &cli.log_dir, "streamblob.log");
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);

    let log_level = cli
        .log_level
        .parse::<tracing::Level>()
        .unwrap_or(tracing::Level::WARN);

    tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_ansi(!cli.no_color)
                .compact(),
        )
        .with(fmt::layer().with_writer(file_writer).with_ansi(false))
        .with(EnvFilter::from_default_env().add_directive(log_level.into()))
        .init();

    Ok(guard)
}

fn open_storage(path: &Path, config: &StorageConfig) -> anyhow::Result<BlobStorage<AnyPagedStorage>> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    BlobStorage::open(path, config)
        .with_context(|| format!("Failed to open storage at {}", path.display()))
}

fn init_command(path: &Path, config: &StorageConfig) -> anyhow::Result<()> {
    let existed = path.exists();
    let storage = open_storage(path, config)?;
    let live = storage.live_records_count();
    storage.close()?;
    if existed {
        println!("Storage {} already exists ({} live records)", path.display(), live);
    } else {
        println!("✅ Created storage {}", path.display());
    }
    Ok(())
}

fn put_command(path: &Path, config: &StorageConfig, payload: PayloadArgs) -> anyhow::Result<()> {
    let bytes = payload.load()?;
    let storage = open_storage(path, config)?;
    let id = storage.allocate(&bytes)?;
    storage.close()?;
    info!(record = %id, bytes = bytes.len(), "Stored record");
    println!("{}", id.as_u32());
    Ok(())
}

fn get_command(
    path: &Path,
    config: &StorageConfig,
    id: u32,
    output: Option<PathBuf>,
) -> anyhow::Result<()> {
    let storage = open_storage(path, config)?;
    let payload = storage.read(RecordId(id))?;
    storage.close()?;

    match output {
        Some(output) => {
            std::fs::write(&output, &payload)
                .with_context(|| format!("Failed to write {}", output.display()))?;
            println!("✅ Wrote {} bytes to {}", payload.len(), output.display());
        }
        None => {
            let mut stdout = std::io::stdout().lock();
            stdout.write_all(&payload)?;
            stdout.flush()?;
        }
    }
    Ok(())
}

fn write_command(
    path: &Path,
    config: &StorageConfig,
    id: u32,
    payload: PayloadArgs,
) -> anyhow::Result<()> {
    let bytes = payload.load()?;
    let storage = open_storage(path, config)?;
    let outcome = storage.write(RecordId(id), &bytes)?;
    storage.close()?;
    match outcome {
        WriteOutcome::InPlace => println!("✅ Record {} rewritten in place", id),
        WriteOutcome::Relocated => println!("✅ Record {} relocated", id),
    }
    Ok(())
}

fn delete_command(path: &Path, config: &StorageConfig, id: u32) -> anyhow::Result<()> {
    let storage = open_storage(path, config)?;
    storage.delete(RecordId(id))?;
    storage.close()?;
    println!("✅ Record {} deleted", id);
    Ok(())
}

fn stats_command(path: &Path, config: &StorageConfig, json: bool) -> anyhow::Result<()> {
    let storage = open_storage(path, config)?;
    let stats = storage.stats();
    let reclaimable = storage.reclaimable_slots();
    let reclaimable_bytes = storage.reclaimable_capacity_bytes();
    storage.close()?;

    if json {
        println!("{}", serde_json::to_string_pretty(&stats)?);
        return Ok(());
    }

    println!("Storage {}", path.display());
    println!("───────────────────────────────");
    println!("  Records allocated:   {}", stats.records_allocated);
    println!("  Records relocated:   {}", stats.records_relocated);
    println!("  Records deleted:     {}", stats.records_deleted);
    println!("  Live records:        {}", stats.live_records);
    println!("  Live payload bytes:  {}", stats.live_payload_bytes);
    println!("  Live capacity bytes: {}", stats.live_capacity_bytes);
    println!("  Size in bytes:       {}", stats.size_in_bytes);
    println!("  Reclaimable slots:   {}", reclaimable);
    println!("  Reclaimable bytes:   {}", reclaimable_bytes);
    println!("  Payload utilization: {:.1}%", stats.payload_utilization() * 100.0);
    Ok(())
}

fn verify_command(path: &Path, config: &StorageConfig) -> anyhow::Result<()> {
    let storage = open_storage(path, config)?;
    let report = storage.verify()?;
    storage.close()?;

    println!("✅ Counters match a full scan");
    println!("  Actual:  {}", report.actual);
    println!("  Moved:   {}", report.moved);
    println!("  Deleted: {}", report.deleted);
    println!("  Padding: {}", report.padding);
    Ok(())
}

fn list_command(path: &Path, config: &StorageConfig, limit: Option<u64>) -> anyhow::Result<()> {
    let storage = open_storage(path, config)?;
    let limit = limit.unwrap_or(u64::MAX);

    println!("{:>10}  {:>10}  {:>10}", "ID", "LENGTH", "CAPACITY");
    let mut shown = 0u64;
    for record in storage.records() {
        if shown >= limit {
            break;
        }
        let record = record?;
        println!(
            "{:>10}  {:>10}  {:>10}",
            record.id.as_u32(),
            record.payload.len(),
            record.capacity
        );
        shown += 1;
    }
    storage.close()?;
    println!("({} records)", shown);
    Ok(())
}

fn compact_command(path: &Path, config: &StorageConfig, dest: &Path) -> anyhow::Result<()> {
    let storage = open_storage(path, config)?;
    info!(source = %path.display(), dest = %dest.display(), "Compacting storage...");
    let report = storage.compact_to_path(dest, config)?;
    storage.close()?;

    println!("✅ Compacted {} records into {}", report.records_copied, dest.display());
    println!(
        "  {} bytes → {} bytes ({} reclaimed)",
        report.bytes_before,
        report.bytes_after,
        report.bytes_reclaimed()
    );
    Ok(())
}
