//! Volatile store backend.
//!
//! Holds the ledger state behind a single mutex, which makes every call
//! trivially atomic. Nothing survives a restart.

use async_trait::async_trait;
use parking_lot::Mutex;
use uuid::Uuid;

use super::state::{LedgerState, LogRecord};
use super::{
    BalanceWrite, ClaimRequest, EnqueueResult, StatusUpdate, Store, StoreError, TransferCommit,
};
use crate::clock::Millis;
use crate::ledger::{Address, Balance};
use crate::queue::transfer::{NewTransfer, QueuedTransfer, StatusCounts, TransferId};

#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<LedgerState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a store pre-seeded with balances.
    pub fn with_balances(writes: &[BalanceWrite]) -> Self {
        let mut state = LedgerState::new();
        state.apply(&LogRecord::Balances {
            writes: writes.to_vec(),
        });
        Self {
            state: Mutex::new(state),
        }
    }

    fn run<T>(&self, plan: impl FnOnce(&LedgerState) -> (T, Option<LogRecord>)) -> T {
        let mut state = self.state.lock();
        let (out, record) = plan(&state);
        if let Some(record) = record {
            state.apply(&record);
        }
        out
    }

    fn try_run<T>(
        &self,
        plan: impl FnOnce(&LedgerState) -> Result<(T, LogRecord), StoreError>,
    ) -> Result<T, StoreError> {
        let mut state = self.state.lock();
        let (out, record) = plan(&state)?;
        state.apply(&record);
        Ok(out)
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn read_balance(&self, address: &Address) -> Result<Option<Balance>, StoreError> {
        Ok(self.state.lock().balance(address))
    }

    async fn write_balances(&self, writes: &[BalanceWrite]) -> Result<(), StoreError> {
        self.run(|state| ((), state.plan_write_balances(writes)));
        Ok(())
    }

    async fn enqueue(
        &self,
        transfer: NewTransfer,
        max_outstanding: usize,
    ) -> Result<EnqueueResult, StoreError> {
        Ok(self.run(|state| state.plan_enqueue(transfer, max_outstanding)))
    }

    async fn claim(&self, request: ClaimRequest) -> Result<Vec<QueuedTransfer>, StoreError> {
        Ok(self.run(|state| state.plan_claim(&request)))
    }

    async fn renew_leases(
        &self,
        owner: Uuid,
        ids: &[TransferId],
        now: Millis,
        expires_at: Millis,
    ) -> Result<usize, StoreError> {
        Ok(self.run(|state| state.plan_renew(owner, ids, now, expires_at)))
    }

    async fn release_claims(&self, owner: Uuid) -> Result<usize, StoreError> {
        Ok(self.run(|state| state.plan_release(owner)))
    }

    async fn commit_transfer(&self, commit: TransferCommit) -> Result<QueuedTransfer, StoreError> {
        self.try_run(|state| state.plan_commit(&commit))
    }

    async fn update_status(&self, update: StatusUpdate) -> Result<QueuedTransfer, StoreError> {
        self.try_run(|state| state.plan_update(&update))
    }

    async fn get_transfer(&self, id: TransferId) -> Result<Option<QueuedTransfer>, StoreError> {
        Ok(self.state.lock().transfer(id).cloned())
    }

    async fn status_counts(&self) -> Result<StatusCounts, StoreError> {
        Ok(self.state.lock().status_counts())
    }

    async fn purge_completed(&self, older_than: Millis) -> Result<usize, StoreError> {
        Ok(self.run(|state| state.plan_purge(older_than)))
    }
}
