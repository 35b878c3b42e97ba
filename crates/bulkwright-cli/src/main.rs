//! 🚀 bulkwright-cli: point it at an NDJSON bulk file and a cluster, watch the 429s get
//! handled by somebody else for once.
//!
//! 🎬 Two subcommands:
//! - `submit <file>` batches the file into pooled buffers and pushes them through a pool of
//!   workers, each running the bulk processor with whole-request retries.
//! - `shard <id>` prints which shard a document id routes to. Handy when a support ticket
//!   says "it's always shard 3".
//!
//! 🦆 The duck prefers `--workers 4`. The duck has never been asked.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use bulkwright::availability::{ClusterConfig, ClusterMetadata, ClusterRegistry, KeyedRateLimiter};
use bulkwright::backends::{FileQueue, InMemoryQueue, InMemoryStats, QueueBackend, ReqwestHttpClient};
use bulkwright::buffers::{BulkBufferPool, PooledBulkBuffer};
use bulkwright::processor::{BulkProcessor, BulkReport};
use bulkwright::routing::shard_id;
use bulkwright::walker::bulk_operations;
use clap::{Parser, Subcommand};
use comfy_table::{Cell, CellAlignment, Table};
use indicatif::{ProgressBar, ProgressStyle};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Parser)]
#[command(name = "bulkwright", version, about = "🚚 Resilient bulk writes for Elasticsearch")]
struct Cli {
    /// 🔧 TOML config file. Env vars (BULKWRIGHT_*) apply either way.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// 📦 Submit an NDJSON bulk file.
    Submit {
        file: PathBuf,
        /// Cluster id from the config. Defaults to the first configured cluster.
        #[arg(long)]
        cluster: Option<String>,
        /// Ad-hoc endpoint, used when the config has no clusters.
        #[arg(long)]
        endpoint: Option<String>,
        #[arg(long, default_value = "cli")]
        tag: String,
        #[arg(long, default_value_t = 4)]
        workers: usize,
        /// Write invalid items, dead letters and result records under this directory.
        #[arg(long)]
        queue_dir: Option<PathBuf>,
    },
    /// 🧭 Print the shard a document id routes to.
    Shard {
        id: String,
        #[arg(long)]
        shards: i32,
        #[arg(long, default_value_t = -1, allow_negative_numbers = true)]
        routing_shards: i32,
        #[arg(long, default_value_t = 1)]
        partition_offset: i32,
        #[arg(long, default_value_t = 7)]
        version: u32,
    },
}

/// 🧮 What one worker saw. Merged at the end.
#[derive(Debug, Default)]
struct Summary {
    batches: usize,
    failed_batches: usize,
    held_back_batches: usize,
    retries: u64,
    dead_lettered: usize,
    invalid: usize,
    status_counts: BTreeMap<u16, usize>,
}

impl Summary {
    fn record(&mut self, report: &BulkReport) {
        self.batches += 1;
        self.retries += u64::from(report.retries);
        self.dead_lettered += report.dead_lettered_items;
        self.invalid += report.non_retryable_items;
        for (status, count) in &report.status_counts {
            *self.status_counts.entry(*status).or_insert(0) += count;
        }
    }

    fn merge(&mut self, other: Summary) {
        self.batches += other.batches;
        self.failed_batches += other.failed_batches;
        self.held_back_batches += other.held_back_batches;
        self.retries += other.retries;
        self.dead_lettered += other.dead_lettered;
        self.invalid += other.invalid;
        for (status, count) in other.status_counts {
            *self.status_counts.entry(status).or_insert(0) += count;
        }
    }

    fn table(&self) -> Table {
        let mut table = Table::new();
        table.set_header(vec!["", "count"]);
        let mut row = |label: String, value: String| {
            table.add_row(vec![
                Cell::new(label),
                Cell::new(value).set_alignment(CellAlignment::Right),
            ]);
        };
        row("batches".into(), self.batches.to_string());
        row("failed batches".into(), self.failed_batches.to_string());
        row("held back (not written)".into(), self.held_back_batches.to_string());
        row("partial-failure retries".into(), self.retries.to_string());
        row("invalid items".into(), self.invalid.to_string());
        row("dead-lettered items".into(), self.dead_lettered.to_string());
        for (status, count) in &self.status_counts {
            row(format!("status {status}"), count.to_string());
        }
        table
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let result = match cli.command {
        Command::Shard {
            id,
            shards,
            routing_shards,
            partition_offset,
            version,
        } => {
            let shard = shard_id(id.as_bytes(), shards, routing_shards, partition_offset, version)
                .context("💀 Could not route that id. The shard settings don't add up.")?;
            println!("{shard}");
            Ok(())
        }
        Command::Submit {
            file,
            cluster,
            endpoint,
            tag,
            workers,
            queue_dir,
        } => {
            submit(
                cli.config.as_deref(),
                &file,
                cluster.as_deref(),
                endpoint,
                &tag,
                workers.max(1),
                queue_dir,
            )
            .await
        }
    };

    if let Err(err) = result {
        error!("💀 error: {}", err);
        for cause in err.chain().skip(1) {
            error!("⚠️  cause: {}", cause);
        }
        std::process::exit(1);
    }
    Ok(())
}

async fn submit(
    config_path: Option<&Path>,
    file: &Path,
    cluster_id: Option<&str>,
    endpoint: Option<String>,
    tag: &str,
    workers: usize,
    queue_dir: Option<PathBuf>,
) -> Result<()> {
    if let Some(path) = config_path {
        let exists = path.try_exists().with_context(|| {
            format!("💀 Could not check whether the config file '{}' exists.", path.display())
        })?;
        if !exists {
            bail!(
                "💀 Config file '{}' does not exist. Relative paths are relative to where you ran this, not where the file lives.",
                path.display()
            );
        }
    }
    let mut config = bulkwright::load_config(config_path)
        .context("💀 In bulkwright-cli, we couldn't load the config. Check the file and the BULKWRIGHT_* env vars.")?;
    if let Some(endpoint) = endpoint {
        config.clusters.push(ClusterConfig::new("default", vec![endpoint]));
    }

    let limiter = Arc::new(KeyedRateLimiter::new());
    let registry = ClusterRegistry::new(config.availability.clone(), Arc::clone(&limiter));
    for cluster in &config.clusters {
        registry.register(cluster.clone());
    }
    let cluster = match cluster_id {
        Some(id) => registry.get(id),
        None => config.clusters.first().and_then(|cluster| registry.get(&cluster.id)),
    }
    .context("💀 No cluster to write to. Add a [[clusters]] entry, pass --cluster with a configured id, or pass --endpoint.")?;

    let memory_queue = InMemoryQueue::new();
    let queue = match &queue_dir {
        Some(dir) => QueueBackend::File(FileQueue::new(dir)),
        None => QueueBackend::InMemory(memory_queue.clone()),
    };
    let stats = InMemoryStats::new();
    let processor = Arc::new(BulkProcessor::new(
        config.bulk.clone(),
        Arc::new(BulkBufferPool::new(config.pool.clone())),
        Arc::new(ReqwestHttpClient::new(CONNECT_TIMEOUT)?),
        Arc::new(queue),
        Arc::new(stats.clone()),
        limiter,
    ));

    let data = tokio::fs::read(file)
        .await
        .with_context(|| format!("💀 Could not read bulk file '{}'.", file.display()))?;
    let total_ops = bulk_operations("/_bulk", &data).count() as u64;
    info!(
        "📦 submitting {} operations from '{}' to [{}] with {} workers",
        total_ops,
        file.display(),
        cluster.name(),
        workers
    );

    let progress = ProgressBar::new(total_ops);
    progress.set_style(
        ProgressStyle::with_template("{msg} [{bar:40.cyan/blue}] {pos}/{len} ops ({per_sec})")
            .context("💀 The progress bar template did not parse.")?
            .progress_chars("=>-"),
    );
    progress.set_message(format!("bulk → {}", cluster.name()));

    let (sender, receiver) = async_channel::bounded::<PooledBulkBuffer>(workers * 2);
    let handles: Vec<_> = (0..workers)
        .map(|_| {
            tokio::spawn(run_worker(
                Arc::clone(&processor),
                Arc::clone(&cluster),
                tag.to_owned(),
                receiver.clone(),
                progress.clone(),
            ))
        })
        .collect();
    drop(receiver);

    let pool = Arc::clone(processor.pool());
    let mut batch = pool.acquire();
    for op in bulk_operations("/_bulk", &data) {
        let op = op.with_context(|| format!("💀 '{}' is not a valid bulk body.", file.display()))?;
        batch.add(&op.offset.to_string(), op.meta_line);
        if let Some(payload) = op.payload {
            batch.write_line(payload);
        }
        if processor.config().should_flush(&batch) {
            let full = std::mem::replace(&mut batch, pool.acquire());
            sender
                .send(full)
                .await
                .context("💀 Every worker hung up before the file was done.")?;
        }
    }
    if !batch.is_empty() {
        sender
            .send(batch)
            .await
            .context("💀 Every worker hung up before the last batch.")?;
    }
    drop(sender);

    let mut summary = Summary::default();
    for joined in futures::future::join_all(handles).await {
        summary.merge(joined.context("💀 A worker task panicked.")?);
    }
    progress.finish_with_message(format!("bulk → {} done", cluster.name()));

    println!("{}", summary.table());
    match &queue_dir {
        Some(dir) => println!("📁 queues written under {}", dir.display()),
        None => {
            for name in memory_queue.queue_names() {
                println!("📮 {name}: {} messages (in memory, gone on exit)", memory_queue.depth(&name));
            }
        }
    }
    if summary.held_back_batches > 0 {
        warn!(
            "🛑 {} batches were handed back unwritten. Re-run once [{}] is healthy.",
            summary.held_back_batches,
            cluster.name()
        );
    }
    Ok(())
}

async fn run_worker(
    processor: Arc<BulkProcessor>,
    cluster: Arc<ClusterMetadata>,
    tag: String,
    receiver: async_channel::Receiver<PooledBulkBuffer>,
    progress: ProgressBar,
) -> Summary {
    let mut summary = Summary::default();
    while let Ok(mut batch) = receiver.recv().await {
        let operations = batch.message_count() as u64;
        match processor
            .submit_with_retry(&tag, &cluster, None, &mut batch)
            .await
        {
            Ok(report) => summary.record(&report),
            Err(failure) => {
                summary.record(&failure.report);
                summary.failed_batches += 1;
                if !failure.continue_next() {
                    summary.held_back_batches += 1;
                }
                warn!("⚠️ batch of {} operations: {}", operations, failure);
            }
        }
        progress.inc(operations);
    }
    summary
}
