//! Durable balance and queue storage.
//!
//! The [`Store`] trait is the persistence seam used by the cache, the queue and
//! the batch processor. Every mutating call is one atomic transaction: either
//! all of its effects are durable or none are.
//!
//! - [`state`]: the in-memory state machine both backends share
//! - [`memory`]: volatile backend for tests and embedding
//! - [`file`]: write-ahead-log backend with snapshots
//! - [`timed`]: wraps any store so every call carries a timeout

pub mod file;
pub mod memory;
pub mod state;
pub mod timed;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::clock::Millis;
use crate::ledger::{Address, Balance};
use crate::queue::transfer::{NewTransfer, QueuedTransfer, StatusCounts, TransferId, TransferStatus};

pub use file::FileStore;
pub use memory::MemoryStore;
pub use timed::TimedStore;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("Store operation {op} timed out after {timeout_ms}ms")]
    Timeout { op: &'static str, timeout_ms: u64 },

    #[error("Balance of {address} changed underneath: expected {expected}, found {actual}")]
    Conflict {
        address: Address,
        expected: Balance,
        actual: Balance,
    },

    #[error("Claim on transfer {0} is no longer held")]
    LeaseLost(TransferId),

    #[error("Transfer not found: {0}")]
    NotFound(TransferId),

    #[error("Corrupt log record at line {line}: {reason}")]
    Corrupt { line: usize, reason: String },

    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    /// Errors worth retrying on a later batch.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            StoreError::Io(_)
                | StoreError::Timeout { .. }
                | StoreError::Conflict { .. }
                | StoreError::Unavailable(_)
        )
    }
}

/// One balance row to write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BalanceWrite {
    pub address: Address,
    pub balance: Balance,
}

/// A compare-and-swap on one balance row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BalanceChange {
    pub address: Address,
    /// Balance the processor read; the commit fails with `Conflict` if the row differs.
    pub expected: Balance,
    pub new: Balance,
}

/// Outcome of a durable enqueue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueResult {
    Inserted(TransferId),
    Duplicate(TransferId),
    Full { capacity: usize },
}

#[derive(Debug, Clone, Copy)]
pub struct ClaimRequest {
    pub owner: Uuid,
    pub batch_size: usize,
    pub max_retries: u32,
    pub now: Millis,
    pub lease_expires_at: Millis,
}

/// Balance updates plus the `completed` transition, applied as one transaction.
#[derive(Debug, Clone)]
pub struct TransferCommit {
    pub id: TransferId,
    pub owner: Uuid,
    pub now: Millis,
    pub changes: Vec<BalanceChange>,
}

/// A status transition out of `claimed` by the lease owner.
#[derive(Debug, Clone)]
pub struct StatusUpdate {
    pub id: TransferId,
    pub owner: Uuid,
    pub now: Millis,
    pub status: TransferStatus,
    pub retry_count: u32,
    pub available_at: Millis,
    pub error: Option<String>,
}

#[async_trait]
pub trait Store: Send + Sync {
    /// Current balance, or `None` for an address that was never written.
    async fn read_balance(&self, address: &Address) -> Result<Option<Balance>, StoreError>;

    /// Unconditionally write balance rows (seeding, imports).
    async fn write_balances(&self, writes: &[BalanceWrite]) -> Result<(), StoreError>;

    /// Insert a pending transfer unless its hash exists or `max_outstanding` is reached.
    async fn enqueue(
        &self,
        transfer: NewTransfer,
        max_outstanding: usize,
    ) -> Result<EnqueueResult, StoreError>;

    /// Atomically claim up to `batch_size` claimable transfers, best priority first.
    async fn claim(&self, request: ClaimRequest) -> Result<Vec<QueuedTransfer>, StoreError>;

    /// Extend leases still held by `owner`. Returns how many were renewed.
    async fn renew_leases(
        &self,
        owner: Uuid,
        ids: &[TransferId],
        now: Millis,
        expires_at: Millis,
    ) -> Result<usize, StoreError>;

    /// Return every transfer claimed by `owner` to pending.
    async fn release_claims(&self, owner: Uuid) -> Result<usize, StoreError>;

    /// Write balances and mark the transfer completed in one transaction.
    async fn commit_transfer(&self, commit: TransferCommit) -> Result<QueuedTransfer, StoreError>;

    /// Move a claimed transfer to a new status.
    async fn update_status(&self, update: StatusUpdate) -> Result<QueuedTransfer, StoreError>;

    async fn get_transfer(&self, id: TransferId) -> Result<Option<QueuedTransfer>, StoreError>;

    async fn status_counts(&self) -> Result<StatusCounts, StoreError>;

    /// Delete completed transfers processed before `older_than`.
    async fn purge_completed(&self, older_than: Millis) -> Result<usize, StoreError>;
}
