//! Durable, deduplicating, priority-ordered transfer queue.

use std::sync::Arc;

use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::backoff::Backoff;
use super::priority::PriorityPolicy;
use super::transfer::{
    EnqueueOutcome, NewTransfer, QueuedTransfer, RejectReason, StatusCounts, TransferEvent,
    TransferId, TransferStatus,
};
use crate::clock::{Millis, SharedClock};
use crate::config::QueueConfig;
use crate::ledger::{Address, Balance};
use crate::stats::StatsCollector;
use crate::store::{
    BalanceChange, ClaimRequest, EnqueueResult, StatusUpdate, Store, StoreError, TransferCommit,
};

#[derive(Error, Debug)]
pub enum QueueError {
    #[error("Transfer queue is full ({capacity} outstanding)")]
    QueueFull { capacity: usize },

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// A validated submission.
#[derive(Debug, Clone, PartialEq)]
pub struct TransferRequest {
    pub hash: String,
    pub from: Option<Address>,
    pub to: Address,
    pub amount: Balance,
    pub gas_price: Balance,
}

/// Queue handle owned by one process. Claims it makes carry its `owner` id.
pub struct TransactionQueue {
    store: Arc<dyn Store>,
    clock: SharedClock,
    config: QueueConfig,
    policy: PriorityPolicy,
    backoff: Backoff,
    owner: Uuid,
    events: broadcast::Sender<TransferEvent>,
    stats: Arc<StatsCollector>,
}

impl TransactionQueue {
    pub fn new(
        store: Arc<dyn Store>,
        clock: SharedClock,
        config: QueueConfig,
        policy: PriorityPolicy,
        stats: Arc<StatsCollector>,
        event_buffer: usize,
    ) -> Self {
        let (events, _) = broadcast::channel(event_buffer.max(1));
        let backoff = Backoff::new(config.retry);
        Self {
            store,
            clock,
            config,
            policy,
            backoff,
            owner: Uuid::new_v4(),
            events,
            stats,
        }
    }

    pub fn owner(&self) -> Uuid {
        self.owner
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    pub fn now(&self) -> Millis {
        self.clock.now_ms()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TransferEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: TransferEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    /// Persist a transfer as pending, or report the existing id for its hash.
    pub async fn enqueue(&self, request: TransferRequest) -> Result<EnqueueOutcome, QueueError> {
        let now = self.now();
        let priority = self.policy.score(request.gas_price, request.amount);
        let hash = request.hash.clone();

        let result = self
            .store
            .enqueue(
                NewTransfer {
                    hash: request.hash,
                    from: request.from,
                    to: request.to,
                    amount: request.amount,
                    gas_price: request.gas_price,
                    priority,
                    created_at: now,
                },
                self.config.max_outstanding,
            )
            .await?;
        self.stats.record_enqueue(&result);

        match result {
            EnqueueResult::Inserted(id) => {
                debug!(id, hash = %hash, priority, "Queued transfer");
                self.emit(TransferEvent::Queued { id, hash, priority });
                Ok(EnqueueOutcome {
                    accepted: true,
                    id,
                    reason: None,
                })
            }
            EnqueueResult::Duplicate(id) => {
                debug!(id, hash = %hash, "Duplicate transfer submission");
                Ok(EnqueueOutcome {
                    accepted: false,
                    id,
                    reason: Some(RejectReason::Duplicate),
                })
            }
            EnqueueResult::Full { capacity } => {
                warn!(capacity, hash = %hash, "Transfer queue full, rejecting submission");
                Err(QueueError::QueueFull { capacity })
            }
        }
    }

    /// Claim up to `batch_size` transfers for this owner.
    pub async fn claim_batch(&self, batch_size: usize) -> Result<Vec<QueuedTransfer>, QueueError> {
        if batch_size == 0 {
            return Ok(Vec::new());
        }
        let now = self.now();
        let claimed = self
            .store
            .claim(ClaimRequest {
                owner: self.owner,
                batch_size,
                max_retries: self.config.max_retries,
                now,
                lease_expires_at: now + self.config.lease_ttl_ms,
            })
            .await?;
        if !claimed.is_empty() {
            debug!(count = claimed.len(), owner = %self.owner, "Claimed transfers");
        }
        Ok(claimed)
    }

    /// Extend the leases this owner still holds. Returns how many were renewed.
    pub async fn renew(&self, ids: &[TransferId]) -> Result<usize, QueueError> {
        if ids.is_empty() {
            return Ok(0);
        }
        let now = self.now();
        let renewed = self
            .store
            .renew_leases(self.owner, ids, now, now + self.config.lease_ttl_ms)
            .await?;
        debug!(requested = ids.len(), renewed, "Renewed leases");
        Ok(renewed)
    }

    /// Hand every claim of this owner back to pending.
    pub async fn release_claims(&self) -> Result<usize, QueueError> {
        let released = self.store.release_claims(self.owner).await?;
        if released > 0 {
            info!(released, owner = %self.owner, "Released claimed transfers");
        }
        Ok(released)
    }

    /// Apply balance changes and mark the transfer completed, atomically.
    pub async fn commit(
        &self,
        transfer: &QueuedTransfer,
        changes: Vec<BalanceChange>,
    ) -> Result<QueuedTransfer, QueueError> {
        let committed = self
            .store
            .commit_transfer(TransferCommit {
                id: transfer.id,
                owner: self.owner,
                now: self.now(),
                changes,
            })
            .await?;
        self.emit(TransferEvent::Completed {
            id: committed.id,
            hash: committed.hash.clone(),
            from: committed.from.clone(),
            to: committed.to.clone(),
            amount: committed.amount,
        });
        Ok(committed)
    }

    /// Mark a transfer completed without touching any balance.
    pub async fn mark_completed(
        &self,
        transfer: &QueuedTransfer,
    ) -> Result<QueuedTransfer, QueueError> {
        self.commit(transfer, Vec::new()).await
    }

    /// Record a failed attempt.
    ///
    /// Permanent failures go straight to `failed`. Retryable ones consume a
    /// retry and return to `pending` after a backoff, until `max_retries` is
    /// reached.
    pub async fn mark_failed(
        &self,
        transfer: &QueuedTransfer,
        reason: &str,
        retryable: bool,
    ) -> Result<QueuedTransfer, QueueError> {
        let now = self.now();
        let (status, retry_count, available_at) = if retryable {
            let retry_count = transfer.retry_count.saturating_add(1);
            if retry_count >= self.config.max_retries {
                (TransferStatus::Failed, retry_count, transfer.available_at)
            } else {
                let delay = self.backoff.delay(retry_count).as_millis() as Millis;
                (TransferStatus::Pending, retry_count, now + delay)
            }
        } else {
            (TransferStatus::Failed, transfer.retry_count, transfer.available_at)
        };

        let updated = self
            .store
            .update_status(StatusUpdate {
                id: transfer.id,
                owner: self.owner,
                now,
                status,
                retry_count,
                available_at,
                error: Some(reason.to_string()),
            })
            .await?;

        match updated.status {
            TransferStatus::Pending => {
                debug!(
                    id = updated.id,
                    retry_count,
                    available_at,
                    error = reason,
                    "Transfer scheduled for retry"
                );
                self.emit(TransferEvent::Retrying {
                    id: updated.id,
                    hash: updated.hash.clone(),
                    retry_count,
                    available_at,
                    error: reason.to_string(),
                });
            }
            _ => {
                warn!(id = updated.id, retry_count, error = reason, "Transfer failed");
                self.emit(TransferEvent::Failed {
                    id: updated.id,
                    hash: updated.hash.clone(),
                    retry_count,
                    error: reason.to_string(),
                });
            }
        }
        Ok(updated)
    }

    /// Delete completed transfers processed before `older_than`.
    pub async fn purge_completed(&self, older_than: Millis) -> Result<usize, QueueError> {
        let purged = self.store.purge_completed(older_than).await?;
        if purged > 0 {
            info!(purged, older_than, "Purged completed transfers");
        }
        Ok(purged)
    }

    /// Purge completed transfers past the configured retention.
    pub async fn purge_expired(&self) -> Result<usize, QueueError> {
        let cutoff = self
            .now()
            .saturating_sub(self.config.completed_retention_ms);
        self.purge_completed(cutoff).await
    }

    pub async fn status_counts(&self) -> Result<StatusCounts, QueueError> {
        let counts = self.store.status_counts().await?;
        self.stats.set_queue_depth(&counts);
        Ok(counts)
    }

    pub async fn get(&self, id: TransferId) -> Result<Option<QueuedTransfer>, QueueError> {
        Ok(self.store.get_transfer(id).await?)
    }
}
