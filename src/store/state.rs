//! In-memory ledger state shared by the store backends.
//!
//! Every mutation is split into a *plan* step, which validates against the
//! current state and produces a [`LogRecord`] without touching anything, and
//! an [`LedgerState::apply`] step. A backend persists the record between the
//! two, so a failed write leaves the state untouched and replaying the log
//! reproduces the state exactly.

use std::cmp::{Ordering, Reverse};
use std::collections::{BTreeSet, HashMap};

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{
    BalanceWrite, ClaimRequest, EnqueueResult, StatusUpdate, StoreError, TransferCommit,
};
use crate::clock::Millis;
use crate::ledger::{Address, Balance};
use crate::queue::transfer::{
    Lease, NewTransfer, QueuedTransfer, StatusCounts, TransferId, TransferStatus,
};

/// One atomic unit of change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum LogRecord {
    Balances {
        writes: Vec<BalanceWrite>,
    },
    /// Upsert full transfer records.
    Transfers {
        transfers: Vec<QueuedTransfer>,
    },
    /// Balance rows and the completed transfer, together.
    Commit {
        writes: Vec<BalanceWrite>,
        transfer: QueuedTransfer,
    },
    Purge {
        ids: Vec<TransferId>,
    },
}

/// Full state image written by compaction.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Snapshot {
    pub next_id: TransferId,
    pub balances: Vec<BalanceWrite>,
    pub transfers: Vec<QueuedTransfer>,
    /// Hashes of purged transfers, kept so resubmissions stay deduplicated.
    pub purged: Vec<(String, TransferId)>,
}

/// Total order over priority scores.
#[derive(Debug, Clone, Copy)]
struct Score(f64);

impl PartialEq for Score {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Score {}

impl PartialOrd for Score {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Score {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.total_cmp(&other.0)
    }
}

/// Claim order: priority desc, then created_at asc, then id asc.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct OpenKey {
    priority: Reverse<Score>,
    created_at: Millis,
    id: TransferId,
}

impl OpenKey {
    fn of(transfer: &QueuedTransfer) -> Self {
        Self {
            priority: Reverse(Score(transfer.priority)),
            created_at: transfer.created_at,
            id: transfer.id,
        }
    }
}

#[derive(Debug)]
pub struct LedgerState {
    balances: HashMap<Address, Balance>,
    transfers: HashMap<TransferId, QueuedTransfer>,
    by_hash: HashMap<String, TransferId>,
    /// Pending and claimed transfers in claim order.
    open: BTreeSet<OpenKey>,
    counts: StatusCounts,
    next_id: TransferId,
}

impl Default for LedgerState {
    fn default() -> Self {
        Self::new()
    }
}

impl LedgerState {
    pub fn new() -> Self {
        Self {
            balances: HashMap::new(),
            transfers: HashMap::new(),
            by_hash: HashMap::new(),
            open: BTreeSet::new(),
            counts: StatusCounts::default(),
            next_id: 1,
        }
    }

    pub fn from_snapshot(snapshot: Snapshot) -> Self {
        let mut state = Self::new();
        for write in snapshot.balances {
            state.balances.insert(write.address, write.balance);
        }
        for transfer in snapshot.transfers {
            state.upsert(transfer);
        }
        for (hash, id) in snapshot.purged {
            state.by_hash.insert(hash, id);
        }
        state.next_id = state.next_id.max(snapshot.next_id);
        state
    }

    pub fn snapshot(&self) -> Snapshot {
        let mut transfers: Vec<QueuedTransfer> = self.transfers.values().cloned().collect();
        transfers.sort_by_key(|t| t.id);

        let mut balances: Vec<BalanceWrite> = self
            .balances
            .iter()
            .map(|(address, balance)| BalanceWrite {
                address: address.clone(),
                balance: *balance,
            })
            .collect();
        balances.sort_by(|a, b| a.address.cmp(&b.address));

        let purged = self
            .by_hash
            .iter()
            .filter(|(_, id)| !self.transfers.contains_key(id))
            .map(|(hash, id)| (hash.clone(), *id))
            .collect();

        Snapshot {
            next_id: self.next_id,
            balances,
            transfers,
            purged,
        }
    }

    pub fn balance(&self, address: &Address) -> Option<Balance> {
        self.balances.get(address).copied()
    }

    pub fn transfer(&self, id: TransferId) -> Option<&QueuedTransfer> {
        self.transfers.get(&id)
    }

    pub fn status_counts(&self) -> StatusCounts {
        self.counts
    }

    /// Number of pending + claimed transfers.
    pub fn outstanding(&self) -> usize {
        self.open.len()
    }

    // ─── Planning ──────────────────────────────────────────────────────────

    pub fn plan_write_balances(&self, writes: &[BalanceWrite]) -> Option<LogRecord> {
        if writes.is_empty() {
            return None;
        }
        Some(LogRecord::Balances {
            writes: writes.to_vec(),
        })
    }

    pub fn plan_enqueue(
        &self,
        transfer: NewTransfer,
        max_outstanding: usize,
    ) -> (EnqueueResult, Option<LogRecord>) {
        if let Some(&existing) = self.by_hash.get(&transfer.hash) {
            return (EnqueueResult::Duplicate(existing), None);
        }
        if self.outstanding() >= max_outstanding {
            return (
                EnqueueResult::Full {
                    capacity: max_outstanding,
                },
                None,
            );
        }

        let id = self.next_id;
        let record = QueuedTransfer::from_new(id, transfer);
        (
            EnqueueResult::Inserted(id),
            Some(LogRecord::Transfers {
                transfers: vec![record],
            }),
        )
    }

    pub fn plan_claim(&self, request: &ClaimRequest) -> (Vec<QueuedTransfer>, Option<LogRecord>) {
        let lease = Lease {
            owner: request.owner,
            expires_at: request.lease_expires_at,
        };

        let claimed: Vec<QueuedTransfer> = self
            .open
            .iter()
            .filter_map(|key| self.transfers.get(&key.id))
            .filter(|t| t.is_claimable(request.now, request.max_retries))
            .take(request.batch_size)
            .map(|t| {
                let mut t = t.clone();
                t.status = TransferStatus::Claimed;
                t.lease = Some(lease);
                t
            })
            .collect();

        if claimed.is_empty() {
            return (claimed, None);
        }
        let record = LogRecord::Transfers {
            transfers: claimed.clone(),
        };
        (claimed, Some(record))
    }

    pub fn plan_renew(
        &self,
        owner: Uuid,
        ids: &[TransferId],
        now: Millis,
        expires_at: Millis,
    ) -> (usize, Option<LogRecord>) {
        let renewed: Vec<QueuedTransfer> = ids
            .iter()
            .filter_map(|id| self.transfers.get(id))
            .filter(|t| t.is_held_by(owner, now))
            .map(|t| {
                let mut t = t.clone();
                t.lease = Some(Lease { owner, expires_at });
                t
            })
            .collect();

        let count = renewed.len();
        if count == 0 {
            return (0, None);
        }
        (count, Some(LogRecord::Transfers { transfers: renewed }))
    }

    pub fn plan_release(&self, owner: Uuid) -> (usize, Option<LogRecord>) {
        let released: Vec<QueuedTransfer> = self
            .open
            .iter()
            .filter_map(|key| self.transfers.get(&key.id))
            .filter(|t| {
                t.status == TransferStatus::Claimed && t.lease.is_some_and(|l| l.owner == owner)
            })
            .map(|t| {
                let mut t = t.clone();
                t.status = TransferStatus::Pending;
                t.lease = None;
                t
            })
            .collect();

        let count = released.len();
        if count == 0 {
            return (0, None);
        }
        (count, Some(LogRecord::Transfers { transfers: released }))
    }

    pub fn plan_commit(
        &self,
        commit: &TransferCommit,
    ) -> Result<(QueuedTransfer, LogRecord), StoreError> {
        let current = self.held_transfer(commit.id, commit.owner, commit.now)?;

        let mut writes = Vec::with_capacity(commit.changes.len());
        for change in &commit.changes {
            let actual = self.balance(&change.address).unwrap_or(Decimal::ZERO);
            if actual != change.expected {
                return Err(StoreError::Conflict {
                    address: change.address.clone(),
                    expected: change.expected,
                    actual,
                });
            }
            writes.push(BalanceWrite {
                address: change.address.clone(),
                balance: change.new,
            });
        }

        let mut transfer = current.clone();
        transfer.status = TransferStatus::Completed;
        transfer.processed_at = Some(commit.now);
        transfer.lease = None;
        transfer.last_error = None;

        let record = LogRecord::Commit {
            writes,
            transfer: transfer.clone(),
        };
        Ok((transfer, record))
    }

    pub fn plan_update(
        &self,
        update: &StatusUpdate,
    ) -> Result<(QueuedTransfer, LogRecord), StoreError> {
        let current = self.held_transfer(update.id, update.owner, update.now)?;

        let mut transfer = current.clone();
        transfer.status = update.status;
        transfer.retry_count = update.retry_count;
        transfer.available_at = update.available_at;
        transfer.last_error = update.error.clone();
        transfer.lease = None;
        if update.status.is_terminal() {
            transfer.processed_at = Some(update.now);
        }

        let record = LogRecord::Transfers {
            transfers: vec![transfer.clone()],
        };
        Ok((transfer, record))
    }

    pub fn plan_purge(&self, older_than: Millis) -> (usize, Option<LogRecord>) {
        let ids: Vec<TransferId> = self
            .transfers
            .values()
            .filter(|t| {
                t.status == TransferStatus::Completed
                    && t.processed_at.is_some_and(|at| at < older_than)
            })
            .map(|t| t.id)
            .collect();

        let count = ids.len();
        if count == 0 {
            return (0, None);
        }
        (count, Some(LogRecord::Purge { ids }))
    }

    fn held_transfer(
        &self,
        id: TransferId,
        owner: Uuid,
        now: Millis,
    ) -> Result<&QueuedTransfer, StoreError> {
        let transfer = self.transfers.get(&id).ok_or(StoreError::NotFound(id))?;
        if !transfer.is_held_by(owner, now) {
            return Err(StoreError::LeaseLost(id));
        }
        Ok(transfer)
    }

    // ─── Applying ──────────────────────────────────────────────────────────

    pub fn apply(&mut self, record: &LogRecord) {
        match record {
            LogRecord::Balances { writes } => self.write_balances(writes),
            LogRecord::Transfers { transfers } => {
                for transfer in transfers {
                    self.upsert(transfer.clone());
                }
            }
            LogRecord::Commit { writes, transfer } => {
                self.write_balances(writes);
                self.upsert(transfer.clone());
            }
            LogRecord::Purge { ids } => {
                for id in ids {
                    self.remove(*id);
                }
            }
        }
    }

    fn write_balances(&mut self, writes: &[BalanceWrite]) {
        for write in writes {
            self.balances.insert(write.address.clone(), write.balance);
        }
    }

    fn upsert(&mut self, transfer: QueuedTransfer) {
        if let Some(old) = self.transfers.remove(&transfer.id) {
            if old.status.is_outstanding() {
                self.open.remove(&OpenKey::of(&old));
            }
            decrement(&mut self.counts, old.status);
        }

        if transfer.status.is_outstanding() {
            self.open.insert(OpenKey::of(&transfer));
        }
        self.counts.add(transfer.status);
        self.by_hash.insert(transfer.hash.clone(), transfer.id);
        self.next_id = self.next_id.max(transfer.id + 1);
        self.transfers.insert(transfer.id, transfer);
    }

    /// Drop the record but keep its hash reserved.
    fn remove(&mut self, id: TransferId) {
        if let Some(old) = self.transfers.remove(&id) {
            if old.status.is_outstanding() {
                self.open.remove(&OpenKey::of(&old));
            }
            decrement(&mut self.counts, old.status);
        }
    }
}

fn decrement(counts: &mut StatusCounts, status: TransferStatus) {
    let slot = match status {
        TransferStatus::Pending => &mut counts.pending,
        TransferStatus::Claimed => &mut counts.claimed,
        TransferStatus::Completed => &mut counts.completed,
        TransferStatus::Failed => &mut counts.failed,
    };
    *slot = slot.saturating_sub(1);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::BalanceChange;

    fn addr(n: u8) -> Address {
        Address::parse(&format!("0x{:040x}", n)).unwrap()
    }

    fn new_transfer(hash: &str, priority: f64, created_at: Millis) -> NewTransfer {
        NewTransfer {
            hash: hash.to_string(),
            from: Some(addr(1)),
            to: addr(2),
            amount: Decimal::ONE,
            gas_price: Decimal::ZERO,
            priority,
            created_at,
        }
    }

    fn enqueue(state: &mut LedgerState, hash: &str, priority: f64, created_at: Millis) -> TransferId {
        let (result, record) = state.plan_enqueue(new_transfer(hash, priority, created_at), 100);
        if let Some(record) = record {
            state.apply(&record);
        }
        match result {
            EnqueueResult::Inserted(id) | EnqueueResult::Duplicate(id) => id,
            EnqueueResult::Full { .. } => panic!("unexpected full"),
        }
    }

    fn claim(state: &mut LedgerState, owner: Uuid, size: usize, now: Millis) -> Vec<QueuedTransfer> {
        let request = ClaimRequest {
            owner,
            batch_size: size,
            max_retries: 3,
            now,
            lease_expires_at: now + 1_000,
        };
        let (claimed, record) = state.plan_claim(&request);
        if let Some(record) = record {
            state.apply(&record);
        }
        claimed
    }

    #[test]
    fn test_claim_order_priority_then_fifo() {
        let mut state = LedgerState::new();
        let low = enqueue(&mut state, "low", 1.0, 10);
        let high_late = enqueue(&mut state, "high-late", 5.0, 30);
        let high_early = enqueue(&mut state, "high-early", 5.0, 20);

        let owner = Uuid::new_v4();
        let ids: Vec<_> = claim(&mut state, owner, 10, 100).iter().map(|t| t.id).collect();
        assert_eq!(ids, vec![high_early, high_late, low]);
    }

    #[test]
    fn test_duplicate_returns_original_id() {
        let mut state = LedgerState::new();
        let first = enqueue(&mut state, "h1", 1.0, 10);
        let (result, record) = state.plan_enqueue(new_transfer("h1", 9.0, 20), 100);
        assert_eq!(result, EnqueueResult::Duplicate(first));
        assert!(record.is_none());
        assert_eq!(state.status_counts().pending, 1);
    }

    #[test]
    fn test_full_queue_rejects_without_planning() {
        let mut state = LedgerState::new();
        enqueue(&mut state, "a", 1.0, 1);
        let (result, record) = state.plan_enqueue(new_transfer("b", 1.0, 2), 1);
        assert_eq!(result, EnqueueResult::Full { capacity: 1 });
        assert!(record.is_none());
    }

    #[test]
    fn test_claims_do_not_overlap_until_lease_expires() {
        let mut state = LedgerState::new();
        enqueue(&mut state, "a", 1.0, 1);
        enqueue(&mut state, "b", 1.0, 2);

        let first_owner = Uuid::new_v4();
        let second_owner = Uuid::new_v4();
        assert_eq!(claim(&mut state, first_owner, 1, 100).len(), 1);
        let second = claim(&mut state, second_owner, 10, 100);
        assert_eq!(second.len(), 1);
        assert!(claim(&mut state, second_owner, 10, 500).is_empty());

        // Both leases expire at 1100; a third claimer can take them over.
        let third = claim(&mut state, Uuid::new_v4(), 10, 1_100);
        assert_eq!(third.len(), 2);
    }

    #[test]
    fn test_commit_checks_expected_balance_and_lease() {
        let mut state = LedgerState::new();
        state.apply(&LogRecord::Balances {
            writes: vec![BalanceWrite {
                address: addr(1),
                balance: Decimal::from(10),
            }],
        });
        let id = enqueue(&mut state, "a", 1.0, 1);
        let owner = Uuid::new_v4();
        claim(&mut state, owner, 1, 100);

        let stale = TransferCommit {
            id,
            owner,
            now: 150,
            changes: vec![BalanceChange {
                address: addr(1),
                expected: Decimal::from(7),
                new: Decimal::from(6),
            }],
        };
        assert!(matches!(state.plan_commit(&stale), Err(StoreError::Conflict { .. })));

        let foreign = TransferCommit {
            owner: Uuid::new_v4(),
            ..stale.clone()
        };
        assert!(matches!(state.plan_commit(&foreign), Err(StoreError::LeaseLost(_))));

        let good = TransferCommit {
            changes: vec![
                BalanceChange {
                    address: addr(1),
                    expected: Decimal::from(10),
                    new: Decimal::from(9),
                },
                BalanceChange {
                    address: addr(2),
                    expected: Decimal::ZERO,
                    new: Decimal::ONE,
                },
            ],
            ..stale
        };
        let (transfer, record) = state.plan_commit(&good).unwrap();
        state.apply(&record);
        assert_eq!(transfer.status, TransferStatus::Completed);
        assert_eq!(state.balance(&addr(1)), Some(Decimal::from(9)));
        assert_eq!(state.balance(&addr(2)), Some(Decimal::ONE));
        assert_eq!(state.outstanding(), 0);
        assert_eq!(state.status_counts().completed, 1);
    }

    #[test]
    fn test_purge_keeps_hash_reserved() {
        let mut state = LedgerState::new();
        let id = enqueue(&mut state, "a", 1.0, 1);
        let owner = Uuid::new_v4();
        claim(&mut state, owner, 1, 10);
        let (_, record) = state
            .plan_commit(&TransferCommit {
                id,
                owner,
                now: 20,
                changes: vec![],
            })
            .unwrap();
        state.apply(&record);

        let (purged, record) = state.plan_purge(21);
        assert_eq!(purged, 1);
        state.apply(&record.unwrap());
        assert!(state.transfer(id).is_none());

        let (result, _) = state.plan_enqueue(new_transfer("a", 1.0, 30), 100);
        assert_eq!(result, EnqueueResult::Duplicate(id));

        let restored = LedgerState::from_snapshot(state.snapshot());
        let (result, _) = restored.plan_enqueue(new_transfer("a", 1.0, 30), 100);
        assert_eq!(result, EnqueueResult::Duplicate(id));
    }

    #[test]
    fn test_snapshot_roundtrip_preserves_indexes() {
        let mut state = LedgerState::new();
        enqueue(&mut state, "a", 2.0, 1);
        enqueue(&mut state, "b", 3.0, 2);
        let restored = LedgerState::from_snapshot(state.snapshot());
        assert_eq!(restored.outstanding(), 2);
        assert_eq!(restored.status_counts(), state.status_counts());
        let (result, _) = restored.plan_enqueue(new_transfer("c", 1.0, 3), 100);
        assert_eq!(result, EnqueueResult::Inserted(3));
    }
}
