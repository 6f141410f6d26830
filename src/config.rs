//! Runtime configuration for balance-tier.
//!
//! Configuration is loaded from a JSON file or constructed programmatically.
//! Every section has defaults, so a partial file only overrides what it names.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::ensure;
use clap::Parser;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Command-line arguments.
#[derive(Parser, Debug, Clone)]
#[command(
    name = "balance-tier",
    about = "Tiered balance cache with a durable transfer queue"
)]
pub struct Cli {
    /// Path to configuration file (JSON).
    #[arg(short, long, default_value = "config.json")]
    pub config: PathBuf,

    /// HTTP listen address, overrides `server.listen`.
    #[arg(long)]
    pub listen: Option<String>,

    /// Data directory, overrides `store.data_dir`.
    #[arg(long)]
    pub data_dir: Option<PathBuf>,

    /// Enable verbose logging.
    #[arg(short, long)]
    pub verbose: bool,

    /// Emit logs as JSON lines.
    #[arg(long)]
    pub log_json: bool,
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub cache: CacheConfig,
    pub queue: QueueConfig,
    pub priority: PriorityConfig,
    pub processor: ProcessorConfig,
    pub store: StoreConfig,
}

/// HTTP server settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Listen address (e.g. "0.0.0.0:8080").
    pub listen: String,

    /// Capacity of the transfer event broadcast channel.
    pub event_buffer: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:8080".to_string(),
            event_buffer: 1024,
        }
    }
}

/// Capacity and TTL of one cache tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierConfig {
    /// Maximum entries across all shards.
    pub capacity: usize,

    /// Time an entry may sit in this tier without access.
    pub ttl_ms: u64,
}

/// Tiered balance cache settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub hot: TierConfig,
    pub warm: TierConfig,
    pub cold: TierConfig,

    /// Number of independently locked partitions.
    pub shards: usize,

    /// Interval of the background expiry sweep.
    pub sweep_interval_ms: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            hot: TierConfig {
                capacity: 10_000,
                ttl_ms: 5_000,
            },
            warm: TierConfig {
                capacity: 100_000,
                ttl_ms: 30_000,
            },
            cold: TierConfig {
                capacity: 1_000_000,
                ttl_ms: 300_000,
            },
            shards: 16,
            sweep_interval_ms: 10_000,
        }
    }
}

/// Exponential retry backoff.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub initial_ms: u64,
    pub max_ms: u64,
    pub multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_ms: 500,
            max_ms: 30_000,
            multiplier: 2.0,
        }
    }
}

/// Durable transfer queue settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Pending + claimed transfers above which new submissions are refused.
    pub max_outstanding: usize,

    /// Retryable failures allowed before a transfer is marked failed.
    pub max_retries: u32,

    /// How long a claim stays exclusive without renewal.
    pub lease_ttl_ms: u64,

    pub retry: RetryConfig,

    /// Completed transfers older than this are purged.
    pub completed_retention_ms: u64,

    /// Interval of the purge pass.
    pub purge_interval_ms: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_outstanding: 1_000_000,
            max_retries: 3,
            lease_ttl_ms: 30_000,
            retry: RetryConfig::default(),
            completed_retention_ms: 3_600_000,
            purge_interval_ms: 60_000,
        }
    }
}

/// Weights of the transfer priority score.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PriorityConfig {
    pub gas_weight: f64,
    pub amount_weight: f64,

    /// Amounts above this contribute as if they were exactly this.
    pub amount_cap: Decimal,
}

impl Default for PriorityConfig {
    fn default() -> Self {
        Self {
            gas_weight: 0.7,
            amount_weight: 0.3,
            amount_cap: Decimal::from(1000),
        }
    }
}

/// Batch processor settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessorConfig {
    /// Delay between batch cycles.
    pub interval_ms: u64,

    /// Maximum transfers claimed per cycle.
    pub batch_size: usize,

    /// Transfers processed concurrently within a batch.
    pub max_concurrency: usize,

    /// Window over which throughput is measured.
    pub throughput_window_ms: u64,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            interval_ms: 500,
            batch_size: 1000,
            max_concurrency: 32,
            throughput_window_ms: 60_000,
        }
    }
}

/// Durable store settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Directory holding the snapshot and log.
    pub data_dir: PathBuf,

    /// Sync every log record to disk before acknowledging it.
    pub fsync: bool,

    /// Compact after this many log records (0 = never).
    pub compact_every: usize,

    /// Deadline for a single store call.
    pub op_timeout_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            fsync: true,
            compact_every: 10_000,
            op_timeout_ms: 5_000,
        }
    }
}

impl StoreConfig {
    pub fn op_timeout(&self) -> Duration {
        Duration::from_millis(self.op_timeout_ms)
    }
}

impl Config {
    /// Load configuration from a JSON file, falling back to defaults for missing fields.
    pub fn load(path: &std::path::Path) -> anyhow::Result<Self> {
        if path.exists() {
            let data = std::fs::read_to_string(path)?;
            let config: Config = serde_json::from_str(&data)?;
            Ok(config)
        } else {
            tracing::warn!("Config file not found at {:?}, using defaults", path);
            Ok(Config::default())
        }
    }

    /// Apply command-line overrides.
    pub fn with_cli(mut self, cli: &Cli) -> Self {
        if let Some(listen) = &cli.listen {
            self.server.listen = listen.clone();
        }
        if let Some(dir) = &cli.data_dir {
            self.store.data_dir = dir.clone();
        }
        self
    }

    /// Reject configurations the cache and queue cannot run with.
    pub fn validate(&self) -> anyhow::Result<()> {
        let cache = &self.cache;
        for (name, tier) in [("hot", cache.hot), ("warm", cache.warm), ("cold", cache.cold)] {
            ensure!(tier.capacity > 0, "cache.{name}.capacity must be non-zero");
            ensure!(tier.ttl_ms > 0, "cache.{name}.ttl_ms must be non-zero");
        }
        ensure!(
            cache.hot.ttl_ms <= cache.warm.ttl_ms && cache.warm.ttl_ms <= cache.cold.ttl_ms,
            "cache TTLs must not decrease from hot to cold"
        );
        ensure!(cache.shards > 0, "cache.shards must be non-zero");
        ensure!(cache.sweep_interval_ms > 0, "cache.sweep_interval_ms must be non-zero");

        let queue = &self.queue;
        ensure!(queue.max_outstanding > 0, "queue.max_outstanding must be non-zero");
        ensure!(queue.max_retries > 0, "queue.max_retries must be non-zero");
        ensure!(queue.lease_ttl_ms > 0, "queue.lease_ttl_ms must be non-zero");
        ensure!(queue.purge_interval_ms > 0, "queue.purge_interval_ms must be non-zero");
        ensure!(
            queue.retry.multiplier >= 1.0,
            "queue.retry.multiplier must be at least 1"
        );
        ensure!(
            queue.retry.initial_ms <= queue.retry.max_ms,
            "queue.retry.initial_ms must not exceed queue.retry.max_ms"
        );

        let priority = &self.priority;
        ensure!(
            priority.gas_weight.is_finite() && priority.amount_weight.is_finite(),
            "priority weights must be finite"
        );
        ensure!(
            priority.amount_cap >= Decimal::ZERO,
            "priority.amount_cap must not be negative"
        );

        let processor = &self.processor;
        ensure!(processor.interval_ms > 0, "processor.interval_ms must be non-zero");
        ensure!(processor.batch_size > 0, "processor.batch_size must be non-zero");
        ensure!(
            processor.max_concurrency > 0,
            "processor.max_concurrency must be non-zero"
        );
        ensure!(
            processor.throughput_window_ms > 0,
            "processor.throughput_window_ms must be non-zero"
        );

        ensure!(self.store.op_timeout_ms > 0, "store.op_timeout_ms must be non-zero");
        ensure!(self.server.event_buffer > 0, "server.event_buffer must be non-zero");
        Ok(())
    }
}
