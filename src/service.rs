//! The ledger facade: balance reads, transfer submission and statistics.
//!
//! [`Ledger`] wires one store, cache, queue, processor and stats collector
//! together. Nothing here is global; every instance is independent.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::cache::{sweeper, TieredCache};
use crate::clock::SharedClock;
use crate::config::Config;
use crate::ledger::{amount, validate_hash, Address, Balance, ValidationError};
use crate::processor::BatchProcessor;
use crate::queue::{
    EnqueueOutcome, PriorityPolicy, QueueError, QueuedTransfer, TransactionQueue, TransferEvent,
    TransferId, TransferRequest,
};
use crate::stats::{CacheStats, ProcessingStats, StatsCollector};
use crate::store::{BalanceWrite, Store, StoreError, TimedStore};

#[derive(Error, Debug)]
pub enum LedgerError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("Transfer queue is full ({capacity} outstanding), retry later")]
    QueueFull { capacity: usize },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),
}

impl From<QueueError> for LedgerError {
    fn from(err: QueueError) -> Self {
        match err {
            QueueError::QueueFull { capacity } => LedgerError::QueueFull { capacity },
            QueueError::Store(e) => LedgerError::Store(e),
        }
    }
}

/// A transfer as submitted by a caller, before validation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitRequest {
    /// Omitted for mint/genesis credits.
    #[serde(default)]
    pub from: Option<String>,
    pub to: String,
    pub amount: Balance,
    pub hash: String,
    #[serde(default)]
    pub gas_price: Option<Balance>,
}

pub type SubmitResponse = EnqueueOutcome;

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct QueueStats {
    pub pending: usize,
    pub claimed: usize,
    pub completed: usize,
    pub failed: usize,
    /// Completed transfers per second over the throughput window.
    pub throughput: f64,
}

pub struct Ledger {
    config: Config,
    clock: SharedClock,
    store: Arc<dyn Store>,
    stats: Arc<StatsCollector>,
    cache: Arc<TieredCache>,
    queue: Arc<TransactionQueue>,
    processor: Arc<BatchProcessor>,
}

impl Ledger {
    /// Build a ledger over `store`. Every store call gets the configured timeout.
    pub fn new(config: Config, store: Arc<dyn Store>, clock: SharedClock) -> Result<Self, LedgerError> {
        let store: Arc<dyn Store> = Arc::new(TimedStore::new(store, config.store.op_timeout()));
        let stats = Arc::new(StatsCollector::new(config.processor.throughput_window_ms)?);

        let cache = Arc::new(TieredCache::new(
            &config.cache,
            store.clone(),
            clock.clone(),
            stats.clone(),
        ));
        let queue = Arc::new(TransactionQueue::new(
            store.clone(),
            clock.clone(),
            config.queue.clone(),
            PriorityPolicy::new(config.priority),
            stats.clone(),
            config.server.event_buffer,
        ));
        let processor = Arc::new(BatchProcessor::new(
            queue.clone(),
            cache.clone(),
            stats.clone(),
            config.processor.clone(),
        ));

        Ok(Self {
            config,
            clock,
            store,
            stats,
            cache,
            queue,
            processor,
        })
    }

    pub async fn get_balance(&self, address: &str) -> Result<Balance, LedgerError> {
        let address = Address::parse(address)?;
        Ok(self.cache.get(&address).await?)
    }

    /// Validate and enqueue a transfer. Duplicates are answered with the
    /// original id and `accepted = false`.
    pub async fn submit_transfer(
        &self,
        request: SubmitRequest,
    ) -> Result<SubmitResponse, LedgerError> {
        let from = request
            .from
            .as_deref()
            .map(Address::parse)
            .transpose()?;
        let to = Address::parse(&request.to)?;
        let amount = amount::validate_amount(request.amount)?;
        let gas_price = amount::validate_gas_price(request.gas_price)?;
        let hash = validate_hash(&request.hash)?;

        let outcome = self
            .queue
            .enqueue(TransferRequest {
                hash,
                from,
                to,
                amount,
                gas_price,
            })
            .await?;
        Ok(outcome)
    }

    /// Queue a credit with no debited account.
    pub async fn mint(
        &self,
        to: &str,
        amount: Balance,
        hash: &str,
    ) -> Result<SubmitResponse, LedgerError> {
        self.submit_transfer(SubmitRequest {
            from: None,
            to: to.to_string(),
            amount,
            hash: hash.to_string(),
            gas_price: None,
        })
        .await
    }

    /// Overwrite a balance directly in the store, bypassing the queue.
    pub async fn seed_balance(&self, address: &str, balance: Balance) -> Result<(), LedgerError> {
        let address = Address::parse(address)?;
        let balance = amount::validate_balance(balance)?;
        self.store
            .write_balances(&[BalanceWrite {
                address: address.clone(),
                balance,
            }])
            .await?;
        self.cache.invalidate(&address);
        Ok(())
    }

    pub async fn queue_stats(&self) -> Result<QueueStats, LedgerError> {
        let counts = self.queue.status_counts().await?;
        Ok(QueueStats {
            pending: counts.pending,
            claimed: counts.claimed,
            completed: counts.completed,
            failed: counts.failed,
            throughput: self.stats.throughput(self.clock.now_ms()),
        })
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    pub fn processing_stats(&self) -> ProcessingStats {
        self.stats.processing_stats(self.clock.now_ms())
    }

    pub async fn transfer(&self, id: TransferId) -> Result<Option<QueuedTransfer>, LedgerError> {
        Ok(self.queue.get(id).await?)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TransferEvent> {
        self.queue.subscribe()
    }

    /// Prometheus text exposition.
    pub fn render_metrics(&self) -> Result<String, LedgerError> {
        self.stats.set_cache_sizes(self.cache.sizes());
        Ok(self.stats.render()?)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn cache(&self) -> &Arc<TieredCache> {
        &self.cache
    }

    pub fn queue(&self) -> &Arc<TransactionQueue> {
        &self.queue
    }

    pub fn processor(&self) -> &Arc<BatchProcessor> {
        &self.processor
    }

    pub fn stats(&self) -> &Arc<StatsCollector> {
        &self.stats
    }

    /// Start the batch processor and the cache sweeper. Both stop when
    /// `cancel` fires; the processor releases its claims first.
    pub fn spawn_background(&self, cancel: CancellationToken) -> Vec<JoinHandle<()>> {
        info!(owner = %self.queue.owner(), "Starting background tasks");
        let sweep_every = Duration::from_millis(self.config.cache.sweep_interval_ms);
        vec![
            tokio::spawn(self.processor.clone().run(cancel.clone())),
            tokio::spawn(sweeper::run(self.cache.clone(), sweep_every, cancel)),
        ]
    }
}
