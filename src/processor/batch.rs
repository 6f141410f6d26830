//! Periodic batch processing of queued transfers.
//!
//! Each cycle claims a batch, processes it with bounded concurrency, and
//! commits every transfer's balance changes and completion in one store
//! transaction. Transfers touching the same address are serialized by
//! [`AddressLocks`]; across processes the store's compare-and-swap on the
//! balances read keeps double-spends out.

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::stream::{self, StreamExt};
use thiserror::Error;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::locks::AddressLocks;
use crate::cache::{Tier, TieredCache};
use crate::config::ProcessorConfig;
use crate::ledger::{Address, Balance};
use crate::queue::{QueueError, QueuedTransfer, TransactionQueue, TransferStatus};
use crate::stats::StatsCollector;
use crate::store::{BalanceChange, StoreError};

/// Slots in the address lock table.
const LOCK_SLOTS: usize = 1024;

/// Why a single transfer attempt did not commit.
#[derive(Error, Debug)]
pub enum TransferFailure {
    #[error("insufficient balance: available {available}, required {required}")]
    InsufficientBalance {
        available: Balance,
        required: Balance,
    },

    #[error("balance overflow crediting {address}")]
    Overflow { address: Address },

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl TransferFailure {
    /// Failures that no retry can fix.
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            TransferFailure::InsufficientBalance { .. } | TransferFailure::Overflow { .. }
        )
    }

    /// Store failures after which the cached balances of the transfer's
    /// addresses can no longer be trusted.
    fn leaves_cache_unknown(&self) -> bool {
        matches!(self, TransferFailure::Store(_))
    }

    /// The claim was lost, so another owner is responsible for the transfer now.
    fn is_abandoned(&self) -> bool {
        matches!(
            self,
            TransferFailure::Store(StoreError::LeaseLost(_) | StoreError::NotFound(_))
        )
    }
}

impl From<QueueError> for TransferFailure {
    fn from(err: QueueError) -> Self {
        match err {
            QueueError::Store(e) => TransferFailure::Store(e),
            QueueError::QueueFull { capacity } => TransferFailure::Store(StoreError::Unavailable(
                format!("queue full ({capacity})"),
            )),
        }
    }
}

/// What happened to each transfer of one batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchReport {
    pub claimed: usize,
    pub completed: usize,
    /// Returned to pending for another attempt.
    pub retried: usize,
    pub failed: usize,
    /// Claim lost before the outcome could be recorded.
    pub abandoned: usize,
    pub duration: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Completed,
    Retried,
    Failed,
    Abandoned,
}

pub struct BatchProcessor {
    queue: Arc<TransactionQueue>,
    cache: Arc<TieredCache>,
    locks: AddressLocks,
    stats: Arc<StatsCollector>,
    config: ProcessorConfig,
}

impl BatchProcessor {
    pub fn new(
        queue: Arc<TransactionQueue>,
        cache: Arc<TieredCache>,
        stats: Arc<StatsCollector>,
        config: ProcessorConfig,
    ) -> Self {
        Self {
            queue,
            cache,
            locks: AddressLocks::new(LOCK_SLOTS),
            stats,
            config,
        }
    }

    pub fn queue(&self) -> &Arc<TransactionQueue> {
        &self.queue
    }

    /// Claim and process one batch.
    pub async fn run_once(&self) -> Result<BatchReport, QueueError> {
        let started = Instant::now();
        let claimed = self.queue.claim_batch(self.config.batch_size).await?;
        if claimed.is_empty() {
            return Ok(BatchReport::default());
        }

        let ids: Vec<_> = claimed.iter().map(|t| t.id).collect();
        let mut report = BatchReport {
            claimed: claimed.len(),
            ..BatchReport::default()
        };

        let work = stream::iter(claimed)
            .map(|transfer| self.process(transfer))
            .buffer_unordered(self.config.max_concurrency.max(1))
            .collect::<Vec<Outcome>>();
        tokio::pin!(work);

        let renew_every = Duration::from_millis((self.queue.config().lease_ttl_ms / 2).max(1));
        let mut renew = tokio::time::interval_at(
            tokio::time::Instant::now() + renew_every,
            renew_every,
        );
        renew.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let outcomes = loop {
            tokio::select! {
                outcomes = &mut work => break outcomes,
                _ = renew.tick() => {
                    if let Err(e) = self.queue.renew(&ids).await {
                        warn!(error = %e, "Lease renewal failed");
                    }
                }
            }
        };

        for outcome in outcomes {
            match outcome {
                Outcome::Completed => report.completed += 1,
                Outcome::Retried => report.retried += 1,
                Outcome::Failed => report.failed += 1,
                Outcome::Abandoned => report.abandoned += 1,
            }
        }
        report.duration = started.elapsed();
        self.stats.record_batch(self.queue.now(), &report);

        info!(
            claimed = report.claimed,
            completed = report.completed,
            retried = report.retried,
            failed = report.failed,
            abandoned = report.abandoned,
            duration_ms = report.duration.as_millis() as u64,
            "Processed batch"
        );
        Ok(report)
    }

    async fn process(&self, transfer: QueuedTransfer) -> Outcome {
        let mut addresses: Vec<&Address> = vec![&transfer.to];
        if let Some(from) = &transfer.from {
            addresses.push(from);
        }
        let _guards = self.locks.lock(&addresses).await;

        match self.apply(&transfer).await {
            Ok(writes) => {
                for (address, balance) in writes {
                    self.cache.set(&address, balance, Tier::Hot);
                }
                debug!(id = transfer.id, hash = %transfer.hash, "Transfer completed");
                Outcome::Completed
            }
            Err(failure) => self.record_failure(&transfer, failure).await,
        }
    }

    /// Compute and commit the balance changes. Returns the new balances to
    /// write through to the cache.
    async fn apply(
        &self,
        transfer: &QueuedTransfer,
    ) -> Result<Vec<(Address, Balance)>, TransferFailure> {
        let amount = transfer.amount;
        let to = &transfer.to;

        let changes = match &transfer.from {
            None => {
                let before = self.cache.get(to).await?;
                let after = credit(to, before, amount)?;
                vec![BalanceChange {
                    address: to.clone(),
                    expected: before,
                    new: after,
                }]
            }
            Some(from) => {
                let mut from_before = self.cache.get(from).await?;
                if from_before < amount {
                    // Only fail on a balance the store itself reports.
                    self.cache.invalidate(from);
                    from_before = self.cache.get(from).await?;
                }
                if from_before < amount {
                    return Err(TransferFailure::InsufficientBalance {
                        available: from_before,
                        required: amount,
                    });
                }
                if from == to {
                    Vec::new()
                } else {
                    let to_before = self.cache.get(to).await?;
                    vec![
                        BalanceChange {
                            address: from.clone(),
                            expected: from_before,
                            new: from_before - amount,
                        },
                        BalanceChange {
                            address: to.clone(),
                            expected: to_before,
                            new: credit(to, to_before, amount)?,
                        },
                    ]
                }
            }
        };

        let writes = changes
            .iter()
            .map(|change| (change.address.clone(), change.new))
            .collect();
        self.queue.commit(transfer, changes).await?;
        Ok(writes)
    }

    async fn record_failure(&self, transfer: &QueuedTransfer, failure: TransferFailure) -> Outcome {
        if failure.leaves_cache_unknown() {
            // A conflict means the cache was stale, and a timed-out commit may
            // have landed. Either way the next read goes to the store.
            self.cache.invalidate(&transfer.to);
            if let Some(from) = &transfer.from {
                self.cache.invalidate(from);
            }
        }

        if failure.is_abandoned() {
            debug!(id = transfer.id, error = %failure, "Claim lost, abandoning transfer");
            return Outcome::Abandoned;
        }

        let retryable = !failure.is_permanent();
        let reason = failure.to_string();
        match self.queue.mark_failed(transfer, &reason, retryable).await {
            Ok(updated) if updated.status == TransferStatus::Pending => Outcome::Retried,
            Ok(_) => Outcome::Failed,
            Err(e) => {
                warn!(id = transfer.id, error = %e, "Could not record transfer failure");
                Outcome::Abandoned
            }
        }
    }

    /// Process batches every `interval_ms` until `cancel` fires, purging old
    /// completed transfers along the way. Claims still held on exit are
    /// released.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        info!(
            interval_ms = self.config.interval_ms,
            batch_size = self.config.batch_size,
            max_concurrency = self.config.max_concurrency,
            owner = %self.queue.owner(),
            "Batch processor started"
        );

        let mut timer = tokio::time::interval(Duration::from_millis(self.config.interval_ms));
        timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let purge_every = Duration::from_millis(self.queue.config().purge_interval_ms);
        let mut purge =
            tokio::time::interval_at(tokio::time::Instant::now() + purge_every, purge_every);
        purge.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = timer.tick() => {
                    if let Err(e) = self.run_once().await {
                        warn!(error = %e, "Batch cycle failed");
                    }
                    if let Err(e) = self.queue.status_counts().await {
                        warn!(error = %e, "Could not refresh queue depth");
                    }
                }
                _ = purge.tick() => {
                    if let Err(e) = self.queue.purge_expired().await {
                        warn!(error = %e, "Purge of completed transfers failed");
                    }
                }
            }
        }

        match self.queue.release_claims().await {
            Ok(released) => info!(released, "Batch processor stopped"),
            Err(e) => warn!(error = %e, "Batch processor stopped without releasing claims"),
        }
    }
}

fn credit(address: &Address, before: Balance, amount: Balance) -> Result<Balance, TransferFailure> {
    before
        .checked_add(amount)
        .ok_or_else(|| TransferFailure::Overflow {
            address: address.clone(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal::Decimal;

    #[test]
    fn test_failure_classification() {
        let insufficient = TransferFailure::InsufficientBalance {
            available: Decimal::ZERO,
            required: Decimal::ONE,
        };
        assert!(insufficient.is_permanent());
        assert!(insufficient.to_string().starts_with("insufficient balance"));

        let lost = TransferFailure::Store(StoreError::LeaseLost(7));
        assert!(!lost.is_permanent());
        assert!(lost.is_abandoned());

        let timeout = TransferFailure::Store(StoreError::Timeout {
            op: "commit_transfer",
            timeout_ms: 10,
        });
        assert!(!timeout.is_permanent());
        assert!(!timeout.is_abandoned());
        assert!(timeout.leaves_cache_unknown());
        assert!(lost.leaves_cache_unknown());
        assert!(!insufficient.leaves_cache_unknown());
    }

    #[test]
    fn test_credit_overflow_is_reported() {
        let address = Address::parse("0x00000000000000000000000000000000000000ff").unwrap();
        assert!(matches!(
            credit(&address, Decimal::MAX, Decimal::ONE),
            Err(TransferFailure::Overflow { .. })
        ));
        assert_eq!(
            credit(&address, Decimal::ONE, Decimal::ONE).unwrap(),
            Decimal::from(2)
        );
    }
}
