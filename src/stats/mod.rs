//! Hit-rate, throughput and queue-depth statistics.
//!
//! Every metric lives in a per-instance [`prometheus::Registry`], so several
//! ledgers (or tests) in one process never share counters. Recording never
//! fails; registration is the only fallible step.

use std::collections::VecDeque;

use parking_lot::Mutex;
use prometheus::{
    Encoder, Gauge, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGaugeVec, Opts,
    Registry, TextEncoder,
};
use serde::Serialize;

use crate::cache::tier::{Tier, TierSizes};
use crate::clock::Millis;
use crate::processor::BatchReport;
use crate::queue::transfer::StatusCounts;
use crate::store::EnqueueResult;

/// Weight of the newest batch in the batch-duration moving average.
const EMA_WEIGHT: f64 = 0.1;

/// Cache effectiveness since startup.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct CacheStats {
    pub hot_hits: u64,
    pub warm_hits: u64,
    pub cold_hits: u64,
    pub store_reads: u64,
    pub hit_rate: f64,
    pub sizes: TierSizes,
}

/// Batch processing figures.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ProcessingStats {
    /// Completed transfers per second over the sliding window.
    pub throughput: f64,
    pub peak_throughput: f64,
    pub avg_batch_ms: f64,
    pub batches: u64,
    pub completed: u64,
    pub retried: u64,
    pub failed: u64,
    pub abandoned: u64,
}

#[derive(Debug, Default)]
struct Window {
    /// (finished_at, completed) per batch, oldest first.
    samples: VecDeque<(Millis, u64)>,
    peak: f64,
    avg_batch_ms: Option<f64>,
    batches: u64,
}

impl Window {
    fn prune(&mut self, now: Millis, window_ms: u64) {
        let cutoff = now.saturating_sub(window_ms);
        while self.samples.front().is_some_and(|(at, _)| *at < cutoff) {
            self.samples.pop_front();
        }
    }

    fn rate(&self, window_ms: u64) -> f64 {
        let completed: u64 = self.samples.iter().map(|(_, n)| n).sum();
        completed as f64 / (window_ms as f64 / 1000.0)
    }
}

pub struct StatsCollector {
    registry: Registry,
    cache_hits: IntCounterVec,
    store_reads: IntCounter,
    cache_entries: IntGaugeVec,
    enqueued: IntCounterVec,
    transfers: IntCounterVec,
    queue_depth: IntGaugeVec,
    throughput: Gauge,
    batch_duration: Histogram,
    window: Mutex<Window>,
    window_ms: u64,
}

impl StatsCollector {
    pub fn new(window_ms: u64) -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let cache_hits = IntCounterVec::new(
            Opts::new("balance_cache_hits_total", "Cache hits by tier"),
            &["tier"],
        )?;
        let store_reads = IntCounter::new(
            "balance_cache_store_reads_total",
            "Lookups that missed every tier and read the store",
        )?;
        let cache_entries = IntGaugeVec::new(
            Opts::new("balance_cache_entries", "Live cache entries by tier"),
            &["tier"],
        )?;
        let enqueued = IntCounterVec::new(
            Opts::new("transfer_submissions_total", "Transfer submissions by outcome"),
            &["outcome"],
        )?;
        let transfers = IntCounterVec::new(
            Opts::new("transfers_processed_total", "Processed transfers by outcome"),
            &["outcome"],
        )?;
        let queue_depth = IntGaugeVec::new(
            Opts::new("transfer_queue_depth", "Queued transfers by status"),
            &["status"],
        )?;
        let throughput = Gauge::new(
            "transfer_throughput",
            "Completed transfers per second over the sliding window",
        )?;
        let batch_duration = Histogram::with_opts(
            HistogramOpts::new("transfer_batch_duration_seconds", "Batch processing time")
                .buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0]),
        )?;

        registry.register(Box::new(cache_hits.clone()))?;
        registry.register(Box::new(store_reads.clone()))?;
        registry.register(Box::new(cache_entries.clone()))?;
        registry.register(Box::new(enqueued.clone()))?;
        registry.register(Box::new(transfers.clone()))?;
        registry.register(Box::new(queue_depth.clone()))?;
        registry.register(Box::new(throughput.clone()))?;
        registry.register(Box::new(batch_duration.clone()))?;

        Ok(Self {
            registry,
            cache_hits,
            store_reads,
            cache_entries,
            enqueued,
            transfers,
            queue_depth,
            throughput,
            batch_duration,
            window: Mutex::new(Window::default()),
            window_ms: window_ms.max(1),
        })
    }

    pub fn record_cache_hit(&self, tier: Tier) {
        self.cache_hits.with_label_values(&[tier.as_str()]).inc();
    }

    pub fn record_store_read(&self) {
        self.store_reads.inc();
    }

    pub fn set_cache_sizes(&self, sizes: TierSizes) {
        for tier in Tier::ALL {
            self.cache_entries
                .with_label_values(&[tier.as_str()])
                .set(sizes.get(tier) as i64);
        }
    }

    pub fn record_enqueue(&self, result: &EnqueueResult) {
        let outcome = match result {
            EnqueueResult::Inserted(_) => "accepted",
            EnqueueResult::Duplicate(_) => "duplicate",
            EnqueueResult::Full { .. } => "queue_full",
        };
        self.enqueued.with_label_values(&[outcome]).inc();
    }

    pub fn set_queue_depth(&self, counts: &StatusCounts) {
        let rows = [
            ("pending", counts.pending),
            ("claimed", counts.claimed),
            ("completed", counts.completed),
            ("failed", counts.failed),
        ];
        for (status, count) in rows {
            self.queue_depth
                .with_label_values(&[status])
                .set(count as i64);
        }
    }

    pub fn record_batch(&self, now: Millis, report: &BatchReport) {
        let counts = [
            ("completed", report.completed),
            ("retried", report.retried),
            ("failed", report.failed),
            ("abandoned", report.abandoned),
        ];
        for (outcome, n) in counts {
            if n > 0 {
                self.transfers
                    .with_label_values(&[outcome])
                    .inc_by(n as u64);
            }
        }
        self.batch_duration.observe(report.duration.as_secs_f64());

        let mut window = self.window.lock();
        window.samples.push_back((now, report.completed as u64));
        window.prune(now, self.window_ms);
        let rate = window.rate(self.window_ms);
        window.peak = window.peak.max(rate);

        let ms = report.duration.as_secs_f64() * 1000.0;
        window.avg_batch_ms = Some(match window.avg_batch_ms {
            Some(avg) => avg * (1.0 - EMA_WEIGHT) + ms * EMA_WEIGHT,
            None => ms,
        });
        window.batches += 1;
        self.throughput.set(rate);
    }

    /// Completed transfers per second over the window ending at `now`.
    pub fn throughput(&self, now: Millis) -> f64 {
        let mut window = self.window.lock();
        window.prune(now, self.window_ms);
        let rate = window.rate(self.window_ms);
        self.throughput.set(rate);
        rate
    }

    pub fn cache_stats(&self, sizes: TierSizes) -> CacheStats {
        let hits = |tier: Tier| self.cache_hits.with_label_values(&[tier.as_str()]).get();
        let hot_hits = hits(Tier::Hot);
        let warm_hits = hits(Tier::Warm);
        let cold_hits = hits(Tier::Cold);
        let store_reads = self.store_reads.get();

        let total_hits = hot_hits + warm_hits + cold_hits;
        let lookups = total_hits + store_reads;
        let hit_rate = if lookups == 0 {
            0.0
        } else {
            total_hits as f64 / lookups as f64
        };

        CacheStats {
            hot_hits,
            warm_hits,
            cold_hits,
            store_reads,
            hit_rate,
            sizes,
        }
    }

    pub fn processing_stats(&self, now: Millis) -> ProcessingStats {
        let throughput = self.throughput(now);
        let outcome = |name: &str| self.transfers.with_label_values(&[name]).get();
        let window = self.window.lock();
        ProcessingStats {
            throughput,
            peak_throughput: window.peak,
            avg_batch_ms: window.avg_batch_ms.unwrap_or(0.0),
            batches: window.batches,
            completed: outcome("completed"),
            retried: outcome("retried"),
            failed: outcome("failed"),
            abandoned: outcome("abandoned"),
        }
    }

    /// Prometheus text exposition of every registered metric.
    pub fn render(&self) -> Result<String, prometheus::Error> {
        let mut buf = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buf)?;
        String::from_utf8(buf).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}
