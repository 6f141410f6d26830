//! Timeout wrapper for store calls.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use uuid::Uuid;

use super::{
    BalanceWrite, ClaimRequest, EnqueueResult, StatusUpdate, Store, StoreError, TransferCommit,
};
use crate::clock::Millis;
use crate::ledger::{Address, Balance};
use crate::queue::transfer::{NewTransfer, QueuedTransfer, StatusCounts, TransferId};

/// Fails any call that takes longer than `timeout` with [`StoreError::Timeout`].
///
/// A timed-out mutation may still complete in the background; callers treat a
/// timeout as "outcome unknown" and rely on lease and balance checks to stay safe.
pub struct TimedStore {
    inner: Arc<dyn Store>,
    timeout: Duration,
}

impl TimedStore {
    pub fn new(inner: Arc<dyn Store>, timeout: Duration) -> Self {
        Self { inner, timeout }
    }

    async fn timed<T>(
        &self,
        op: &'static str,
        fut: impl Future<Output = Result<T, StoreError>>,
    ) -> Result<T, StoreError> {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(StoreError::Timeout {
                op,
                timeout_ms: self.timeout.as_millis() as u64,
            }),
        }
    }
}

#[async_trait]
impl Store for TimedStore {
    async fn read_balance(&self, address: &Address) -> Result<Option<Balance>, StoreError> {
        self.timed("read_balance", self.inner.read_balance(address))
            .await
    }

    async fn write_balances(&self, writes: &[BalanceWrite]) -> Result<(), StoreError> {
        self.timed("write_balances", self.inner.write_balances(writes))
            .await
    }

    async fn enqueue(
        &self,
        transfer: NewTransfer,
        max_outstanding: usize,
    ) -> Result<EnqueueResult, StoreError> {
        self.timed("enqueue", self.inner.enqueue(transfer, max_outstanding))
            .await
    }

    async fn claim(&self, request: ClaimRequest) -> Result<Vec<QueuedTransfer>, StoreError> {
        self.timed("claim", self.inner.claim(request)).await
    }

    async fn renew_leases(
        &self,
        owner: Uuid,
        ids: &[TransferId],
        now: Millis,
        expires_at: Millis,
    ) -> Result<usize, StoreError> {
        self.timed(
            "renew_leases",
            self.inner.renew_leases(owner, ids, now, expires_at),
        )
        .await
    }

    async fn release_claims(&self, owner: Uuid) -> Result<usize, StoreError> {
        self.timed("release_claims", self.inner.release_claims(owner))
            .await
    }

    async fn commit_transfer(&self, commit: TransferCommit) -> Result<QueuedTransfer, StoreError> {
        self.timed("commit_transfer", self.inner.commit_transfer(commit))
            .await
    }

    async fn update_status(&self, update: StatusUpdate) -> Result<QueuedTransfer, StoreError> {
        self.timed("update_status", self.inner.update_status(update))
            .await
    }

    async fn get_transfer(&self, id: TransferId) -> Result<Option<QueuedTransfer>, StoreError> {
        self.timed("get_transfer", self.inner.get_transfer(id)).await
    }

    async fn status_counts(&self) -> Result<StatusCounts, StoreError> {
        self.timed("status_counts", self.inner.status_counts()).await
    }

    async fn purge_completed(&self, older_than: Millis) -> Result<usize, StoreError> {
        self.timed("purge_completed", self.inner.purge_completed(older_than))
            .await
    }
}
