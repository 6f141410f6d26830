//! Queued transfer records and their lifecycle states.

use std::fmt;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::clock::Millis;
use crate::ledger::{Address, Balance};

/// Store-assigned, monotonically increasing queue identity.
pub type TransferId = u64;

/// Lifecycle state of a queued transfer.
///
/// ```text
/// pending → claimed → completed
///                   → pending   (retryable failure, retries left)
///                   → failed    (permanent failure or retries exhausted)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferStatus {
    Pending,
    Claimed,
    Completed,
    Failed,
}

impl TransferStatus {
    /// Pending and claimed transfers count against the queue's capacity.
    pub fn is_outstanding(&self) -> bool {
        matches!(self, TransferStatus::Pending | TransferStatus::Claimed)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TransferStatus::Completed | TransferStatus::Failed)
    }
}

impl fmt::Display for TransferStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransferStatus::Pending => write!(f, "pending"),
            TransferStatus::Claimed => write!(f, "claimed"),
            TransferStatus::Completed => write!(f, "completed"),
            TransferStatus::Failed => write!(f, "failed"),
        }
    }
}

/// Exclusive, time-bounded ownership of a claimed transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub owner: Uuid,
    pub expires_at: Millis,
}

impl Lease {
    pub fn is_expired(&self, now: Millis) -> bool {
        now >= self.expires_at
    }
}

/// A validated transfer ready to be persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct NewTransfer {
    pub hash: String,
    /// `None` for mint/genesis credits.
    pub from: Option<Address>,
    pub to: Address,
    pub amount: Decimal,
    pub gas_price: Decimal,
    pub priority: f64,
    pub created_at: Millis,
}

/// A transfer as recorded by the durable queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedTransfer {
    pub id: TransferId,
    pub hash: String,
    pub from: Option<Address>,
    pub to: Address,
    pub amount: Decimal,
    pub gas_price: Decimal,
    pub priority: f64,
    pub status: TransferStatus,
    pub retry_count: u32,
    pub created_at: Millis,
    pub processed_at: Option<Millis>,
    /// Earliest time the transfer may be claimed again (retry backoff).
    pub available_at: Millis,
    pub lease: Option<Lease>,
    pub last_error: Option<String>,
}

impl QueuedTransfer {
    pub fn from_new(id: TransferId, new: NewTransfer) -> Self {
        Self {
            id,
            hash: new.hash,
            from: new.from,
            to: new.to,
            amount: new.amount,
            gas_price: new.gas_price,
            priority: new.priority,
            status: TransferStatus::Pending,
            retry_count: 0,
            created_at: new.created_at,
            processed_at: None,
            available_at: new.created_at,
            lease: None,
            last_error: None,
        }
    }

    /// Whether a claimer may take this transfer right now.
    pub fn is_claimable(&self, now: Millis, max_retries: u32) -> bool {
        match self.status {
            TransferStatus::Pending => self.retry_count < max_retries && self.available_at <= now,
            TransferStatus::Claimed => self.lease.map_or(true, |lease| lease.is_expired(now)),
            TransferStatus::Completed | TransferStatus::Failed => false,
        }
    }

    /// Whether `owner` holds an unexpired claim on this transfer.
    pub fn is_held_by(&self, owner: Uuid, now: Millis) -> bool {
        self.status == TransferStatus::Claimed
            && self
                .lease
                .is_some_and(|lease| lease.owner == owner && !lease.is_expired(now))
    }

    /// Whether this is a mint (no debited account).
    pub fn is_mint(&self) -> bool {
        self.from.is_none()
    }
}

/// Why an enqueue was not accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    Duplicate,
}

/// Result of an enqueue that did not hit an error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnqueueOutcome {
    pub accepted: bool,
    pub id: TransferId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<RejectReason>,
}

/// Per-status transfer counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusCounts {
    pub pending: usize,
    pub claimed: usize,
    pub completed: usize,
    pub failed: usize,
}

impl StatusCounts {
    pub fn outstanding(&self) -> usize {
        self.pending + self.claimed
    }

    pub fn add(&mut self, status: TransferStatus) {
        match status {
            TransferStatus::Pending => self.pending += 1,
            TransferStatus::Claimed => self.claimed += 1,
            TransferStatus::Completed => self.completed += 1,
            TransferStatus::Failed => self.failed += 1,
        }
    }
}

/// Notifications emitted as transfers move through the queue.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum TransferEvent {
    Queued {
        id: TransferId,
        hash: String,
        priority: f64,
    },
    Completed {
        id: TransferId,
        hash: String,
        from: Option<Address>,
        to: Address,
        amount: Balance,
    },
    Retrying {
        id: TransferId,
        hash: String,
        retry_count: u32,
        available_at: Millis,
        error: String,
    },
    Failed {
        id: TransferId,
        hash: String,
        retry_count: u32,
        error: String,
    },
}

impl TransferEvent {
    /// Event name, as used for the SSE `event:` field.
    pub fn kind(&self) -> &'static str {
        match self {
            TransferEvent::Queued { .. } => "queued",
            TransferEvent::Completed { .. } => "completed",
            TransferEvent::Retrying { .. } => "retrying",
            TransferEvent::Failed { .. } => "failed",
        }
    }

    pub fn id(&self) -> TransferId {
        match self {
            TransferEvent::Queued { id, .. }
            | TransferEvent::Completed { id, .. }
            | TransferEvent::Retrying { id, .. }
            | TransferEvent::Failed { id, .. } => *id,
        }
    }
}
