//! Batch processing end to end over the in-memory store.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use proptest::prelude::*;
use rust_decimal::Decimal;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use balance_tier::cache::Tier;
use balance_tier::clock::{ManualClock, Millis};
use balance_tier::config::Config;
use balance_tier::ledger::{Address, Balance};
use balance_tier::processor::BatchReport;
use balance_tier::queue::transfer::{NewTransfer, QueuedTransfer, StatusCounts, TransferId};
use balance_tier::queue::TransferStatus;
use balance_tier::service::SubmitRequest;
use balance_tier::store::{
    BalanceWrite, ClaimRequest, EnqueueResult, MemoryStore, StatusUpdate, Store, StoreError,
    TransferCommit,
};
use balance_tier::Ledger;

const X: &str = "0x1111111111111111111111111111111111111111";
const Y: &str = "0x2222222222222222222222222222222222222222";

fn ledger_over(store: Arc<dyn Store>) -> (Arc<Ledger>, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::new(1_000_000));
    let ledger = Ledger::new(Config::default(), store, clock.clone()).unwrap();
    (Arc::new(ledger), clock)
}

fn transfer(from: &str, to: &str, amount: i64, hash: &str) -> SubmitRequest {
    SubmitRequest {
        from: Some(from.to_string()),
        to: to.to_string(),
        amount: Decimal::from(amount),
        hash: hash.to_string(),
        gas_price: None,
    }
}

async fn balance(ledger: &Ledger, address: &str) -> Balance {
    ledger.get_balance(address).await.unwrap()
}

async fn status(ledger: &Ledger, id: TransferId) -> QueuedTransfer {
    ledger.transfer(id).await.unwrap().unwrap()
}

#[tokio::test]
async fn test_transfer_moves_balance_and_writes_through() {
    let (ledger, _) = ledger_over(Arc::new(MemoryStore::new()));
    ledger.seed_balance(X, Decimal::from(10)).await.unwrap();

    let id = ledger
        .submit_transfer(transfer(X, Y, 10, "0x01"))
        .await
        .unwrap()
        .id;
    let report = ledger.processor().run_once().await.unwrap();
    assert_eq!(report.claimed, 1);
    assert_eq!(report.completed, 1);

    let x = Address::parse(X).unwrap();
    let y = Address::parse(Y).unwrap();
    assert_eq!(ledger.cache().peek(&x), Some((Tier::Hot, Decimal::ZERO)));
    assert_eq!(ledger.cache().peek(&y), Some((Tier::Hot, Decimal::from(10))));
    assert_eq!(balance(&ledger, X).await, Decimal::ZERO);
    assert_eq!(balance(&ledger, Y).await, Decimal::from(10));

    let done = status(&ledger, id).await;
    assert_eq!(done.status, TransferStatus::Completed);
    assert!(done.processed_at.is_some());
}

#[tokio::test]
async fn test_insufficient_balance_fails_without_retry() {
    let (ledger, _) = ledger_over(Arc::new(MemoryStore::new()));
    ledger.seed_balance(X, Decimal::from(5)).await.unwrap();

    let id = ledger
        .submit_transfer(transfer(X, Y, 10, "0x02"))
        .await
        .unwrap()
        .id;
    let report = ledger.processor().run_once().await.unwrap();
    assert_eq!(report.failed, 1);

    let failed = status(&ledger, id).await;
    assert_eq!(failed.status, TransferStatus::Failed);
    assert_eq!(failed.retry_count, 0);
    assert!(failed
        .last_error
        .as_deref()
        .is_some_and(|e| e.starts_with("insufficient balance")));
    assert_eq!(balance(&ledger, X).await, Decimal::from(5));
    assert_eq!(balance(&ledger, Y).await, Decimal::ZERO);
}

#[tokio::test]
async fn test_concurrent_duplicate_submissions_apply_once() {
    let (ledger, _) = ledger_over(Arc::new(MemoryStore::new()));
    ledger.seed_balance(X, Decimal::from(100)).await.unwrap();

    let mut handles = Vec::new();
    for _ in 0..16 {
        let ledger = ledger.clone();
        handles.push(tokio::spawn(async move {
            ledger
                .submit_transfer(transfer(X, Y, 10, "0xdup"))
                .await
                .unwrap()
        }));
    }
    let mut accepted = 0;
    let mut ids = Vec::new();
    for handle in handles {
        let outcome = handle.await.unwrap();
        accepted += usize::from(outcome.accepted);
        ids.push(outcome.id);
    }
    assert_eq!(accepted, 1);
    assert!(ids.windows(2).all(|w| w[0] == w[1]));

    ledger.processor().run_once().await.unwrap();
    assert_eq!(balance(&ledger, X).await, Decimal::from(90));
    assert_eq!(balance(&ledger, Y).await, Decimal::from(10));
}

#[tokio::test]
async fn test_mint_and_self_transfer() {
    let (ledger, _) = ledger_over(Arc::new(MemoryStore::new()));

    let mint = ledger.mint(X, Decimal::from(25), "0xmint").await.unwrap();
    ledger.processor().run_once().await.unwrap();
    assert_eq!(status(&ledger, mint.id).await.status, TransferStatus::Completed);
    assert_eq!(balance(&ledger, X).await, Decimal::from(25));

    let ok = ledger
        .submit_transfer(transfer(X, X, 20, "0xself-ok"))
        .await
        .unwrap();
    let broke = ledger
        .submit_transfer(transfer(X, X, 30, "0xself-broke"))
        .await
        .unwrap();
    ledger.processor().run_once().await.unwrap();

    assert_eq!(status(&ledger, ok.id).await.status, TransferStatus::Completed);
    assert_eq!(status(&ledger, broke.id).await.status, TransferStatus::Failed);
    assert_eq!(balance(&ledger, X).await, Decimal::from(25));
}

#[tokio::test]
async fn test_same_sender_transfers_in_one_batch_serialize() {
    let (ledger, _) = ledger_over(Arc::new(MemoryStore::new()));
    ledger.seed_balance(X, Decimal::from(30)).await.unwrap();

    for n in 0..5 {
        ledger
            .submit_transfer(transfer(X, Y, 10, &format!("0x{n:02}")))
            .await
            .unwrap();
    }
    let report = ledger.processor().run_once().await.unwrap();
    assert_eq!(report.claimed, 5);
    assert_eq!(report.completed, 3);
    assert_eq!(report.failed, 2);
    assert_eq!(balance(&ledger, X).await, Decimal::ZERO);
    assert_eq!(balance(&ledger, Y).await, Decimal::from(30));
}

#[tokio::test]
async fn test_stale_cache_conflict_is_retried() {
    let store = Arc::new(MemoryStore::new());
    let (ledger, clock) = ledger_over(store.clone());
    ledger.seed_balance(X, Decimal::from(10)).await.unwrap();
    assert_eq!(balance(&ledger, X).await, Decimal::from(10));

    // Another writer changes the row behind the cache.
    let x = Address::parse(X).unwrap();
    store
        .write_balances(&[BalanceWrite {
            address: x.clone(),
            balance: Decimal::from(20),
        }])
        .await
        .unwrap();

    let id = ledger
        .submit_transfer(transfer(X, Y, 5, "0xstale"))
        .await
        .unwrap()
        .id;
    let report = ledger.processor().run_once().await.unwrap();
    assert_eq!(report.retried, 1);
    assert_eq!(ledger.cache().peek(&x), None);
    assert_eq!(status(&ledger, id).await.retry_count, 1);

    clock.advance(Duration::from_millis(500));
    let report = ledger.processor().run_once().await.unwrap();
    assert_eq!(report.completed, 1);
    assert_eq!(balance(&ledger, X).await, Decimal::from(15));
    assert_eq!(balance(&ledger, Y).await, Decimal::from(5));
}

/// Memory store whose commits fail with an outage a fixed number of times.
/// With `lost_acks` set, commits land but still report a timeout.
struct FlakyStore {
    inner: MemoryStore,
    commit_failures: AtomicUsize,
    lost_acks: AtomicUsize,
}

#[async_trait]
impl Store for FlakyStore {
    async fn read_balance(&self, address: &Address) -> Result<Option<Balance>, StoreError> {
        self.inner.read_balance(address).await
    }
    async fn write_balances(&self, writes: &[BalanceWrite]) -> Result<(), StoreError> {
        self.inner.write_balances(writes).await
    }
    async fn enqueue(&self, t: NewTransfer, max: usize) -> Result<EnqueueResult, StoreError> {
        self.inner.enqueue(t, max).await
    }
    async fn claim(&self, request: ClaimRequest) -> Result<Vec<QueuedTransfer>, StoreError> {
        self.inner.claim(request).await
    }
    async fn renew_leases(
        &self,
        owner: Uuid,
        ids: &[TransferId],
        now: Millis,
        expires_at: Millis,
    ) -> Result<usize, StoreError> {
        self.inner.renew_leases(owner, ids, now, expires_at).await
    }
    async fn release_claims(&self, owner: Uuid) -> Result<usize, StoreError> {
        self.inner.release_claims(owner).await
    }
    async fn commit_transfer(&self, commit: TransferCommit) -> Result<QueuedTransfer, StoreError> {
        let remaining = self.commit_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.commit_failures.store(remaining - 1, Ordering::SeqCst);
            return Err(StoreError::Unavailable("disk offline".into()));
        }
        let committed = self.inner.commit_transfer(commit).await?;
        let lost = self.lost_acks.load(Ordering::SeqCst);
        if lost > 0 {
            self.lost_acks.store(lost - 1, Ordering::SeqCst);
            return Err(StoreError::Timeout {
                op: "commit_transfer",
                timeout_ms: 5_000,
            });
        }
        Ok(committed)
    }
    async fn update_status(&self, update: StatusUpdate) -> Result<QueuedTransfer, StoreError> {
        self.inner.update_status(update).await
    }
    async fn get_transfer(&self, id: TransferId) -> Result<Option<QueuedTransfer>, StoreError> {
        self.inner.get_transfer(id).await
    }
    async fn status_counts(&self) -> Result<StatusCounts, StoreError> {
        self.inner.status_counts().await
    }
    async fn purge_completed(&self, older_than: Millis) -> Result<usize, StoreError> {
        self.inner.purge_completed(older_than).await
    }
}

fn flaky(failures: usize) -> Arc<FlakyStore> {
    Arc::new(FlakyStore {
        inner: MemoryStore::with_balances(&[BalanceWrite {
            address: Address::parse(X).unwrap(),
            balance: Decimal::from(50),
        }]),
        commit_failures: AtomicUsize::new(failures),
        lost_acks: AtomicUsize::new(0),
    })
}

#[tokio::test]
async fn test_timed_out_commit_that_landed_refreshes_cache() {
    const Z: &str = "0x3333333333333333333333333333333333333333";
    let store = Arc::new(FlakyStore {
        inner: MemoryStore::with_balances(&[BalanceWrite {
            address: Address::parse(X).unwrap(),
            balance: Decimal::from(10),
        }]),
        commit_failures: AtomicUsize::new(0),
        lost_acks: AtomicUsize::new(1),
    });
    let (ledger, _) = ledger_over(store);
    // Warm the cache with the pre-commit balances.
    assert_eq!(balance(&ledger, X).await, Decimal::from(10));
    assert_eq!(balance(&ledger, Y).await, Decimal::ZERO);

    let first = ledger
        .submit_transfer(transfer(X, Y, 10, "0xlanded"))
        .await
        .unwrap()
        .id;
    let report = ledger.processor().run_once().await.unwrap();
    // The commit landed, so recording the timeout finds the claim gone.
    assert_eq!(report.abandoned, 1);
    assert_eq!(status(&ledger, first).await.status, TransferStatus::Completed);

    assert_eq!(balance(&ledger, X).await, Decimal::ZERO);
    assert_eq!(balance(&ledger, Y).await, Decimal::from(10));

    let second = ledger
        .submit_transfer(transfer(Y, Z, 10, "0xonward"))
        .await
        .unwrap()
        .id;
    let report = ledger.processor().run_once().await.unwrap();
    assert_eq!(report.completed, 1);
    assert_eq!(status(&ledger, second).await.status, TransferStatus::Completed);
    assert_eq!(balance(&ledger, Z).await, Decimal::from(10));
}

#[tokio::test]
async fn test_insufficient_balance_rechecks_the_store() {
    let store = Arc::new(MemoryStore::new());
    let (ledger, _) = ledger_over(store.clone());
    assert_eq!(balance(&ledger, X).await, Decimal::ZERO);

    // Funds arrive behind the cache.
    store
        .write_balances(&[BalanceWrite {
            address: Address::parse(X).unwrap(),
            balance: Decimal::from(7),
        }])
        .await
        .unwrap();

    let id = ledger
        .submit_transfer(transfer(X, Y, 7, "0xrecheck"))
        .await
        .unwrap()
        .id;
    let report = ledger.processor().run_once().await.unwrap();
    assert_eq!(report.completed, 1);
    assert_eq!(status(&ledger, id).await.status, TransferStatus::Completed);
    assert_eq!(balance(&ledger, Y).await, Decimal::from(7));
}

#[tokio::test]
async fn test_transient_commit_failure_retries_then_succeeds() {
    let (ledger, clock) = ledger_over(flaky(2));
    let id = ledger
        .submit_transfer(transfer(X, Y, 20, "0xflaky"))
        .await
        .unwrap()
        .id;

    let first = ledger.processor().run_once().await.unwrap();
    assert_eq!(first.retried, 1);
    clock.advance(Duration::from_millis(500));
    let second = ledger.processor().run_once().await.unwrap();
    assert_eq!(second.retried, 1);
    clock.advance(Duration::from_millis(1_000));
    let third = ledger.processor().run_once().await.unwrap();
    assert_eq!(third.completed, 1);

    let done = status(&ledger, id).await;
    assert_eq!(done.status, TransferStatus::Completed);
    assert_eq!(done.retry_count, 2);
    assert_eq!(balance(&ledger, X).await, Decimal::from(30));
    assert_eq!(balance(&ledger, Y).await, Decimal::from(20));

    let stats = ledger.processing_stats();
    assert_eq!(stats.completed, 1);
    assert_eq!(stats.retried, 2);
}

#[tokio::test]
async fn test_retries_exhausted_marks_failed() {
    let (ledger, clock) = ledger_over(flaky(usize::MAX));
    let id = ledger
        .submit_transfer(transfer(X, Y, 20, "0xdoomed"))
        .await
        .unwrap()
        .id;

    let mut last = BatchReport::default();
    for _ in 0..3 {
        last = ledger.processor().run_once().await.unwrap();
        clock.advance(Duration::from_secs(60));
    }
    assert_eq!(last.failed, 1);

    let failed = status(&ledger, id).await;
    assert_eq!(failed.status, TransferStatus::Failed);
    assert_eq!(failed.retry_count, 3);
    assert_eq!(ledger.processor().run_once().await.unwrap().claimed, 0);
    assert_eq!(balance(&ledger, X).await, Decimal::from(50));
}

#[tokio::test]
async fn test_shutdown_releases_held_claims() {
    let (ledger, _) = ledger_over(Arc::new(MemoryStore::new()));
    for n in 0..3 {
        ledger
            .mint(X, Decimal::ONE, &format!("0xrel{n}"))
            .await
            .unwrap();
    }
    // Claims taken under the processor's owner id and never finished.
    assert_eq!(ledger.queue().claim_batch(10).await.unwrap().len(), 3);

    let cancel = CancellationToken::new();
    cancel.cancel();
    ledger.processor().clone().run(cancel).await;

    let stats = ledger.queue_stats().await.unwrap();
    assert_eq!((stats.pending, stats.claimed), (3, 0));
}

#[tokio::test(start_paused = true)]
async fn test_background_loop_drains_queue() {
    let (ledger, _) = ledger_over(Arc::new(MemoryStore::new()));
    let cancel = CancellationToken::new();
    let tasks = ledger.spawn_background(cancel.clone());

    let id = ledger.mint(Y, Decimal::from(3), "0xbg").await.unwrap().id;
    for _ in 0..20 {
        tokio::time::sleep(Duration::from_millis(250)).await;
        if status(&ledger, id).await.status == TransferStatus::Completed {
            break;
        }
    }
    assert_eq!(status(&ledger, id).await.status, TransferStatus::Completed);
    assert_eq!(balance(&ledger, Y).await, Decimal::from(3));

    cancel.cancel();
    for task in tasks {
        task.await.unwrap();
    }
}

const ACCOUNTS: [&str; 4] = [
    "0x000000000000000000000000000000000000000a",
    "0x000000000000000000000000000000000000000b",
    "0x000000000000000000000000000000000000000c",
    "0x000000000000000000000000000000000000000d",
];

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn prop_transfers_conserve_total_balance(
        seeds in prop::collection::vec(0i64..100, 4),
        moves in prop::collection::vec((0usize..4, 0usize..4, 1i64..60), 1..40),
    ) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let (total_before, total_after, negatives) = runtime.block_on(async {
            let (ledger, clock) = ledger_over(Arc::new(MemoryStore::new()));
            for (account, seed) in ACCOUNTS.iter().zip(&seeds) {
                ledger.seed_balance(account, Decimal::from(*seed)).await.unwrap();
            }
            for (n, (from, to, amount)) in moves.iter().enumerate() {
                ledger
                    .submit_transfer(transfer(ACCOUNTS[*from], ACCOUNTS[*to], *amount, &format!("0xp{n}")))
                    .await
                    .unwrap();
            }
            for _ in 0..10 {
                if ledger.processor().run_once().await.unwrap().claimed == 0 {
                    break;
                }
                clock.advance(Duration::from_secs(60));
            }

            let mut after = Decimal::ZERO;
            let mut negatives = 0;
            for account in ACCOUNTS {
                let b = ledger.get_balance(account).await.unwrap();
                if b < Decimal::ZERO {
                    negatives += 1;
                }
                after += b;
            }
            let stats = ledger.queue_stats().await.unwrap();
            assert_eq!(stats.pending + stats.claimed, 0);
            (Decimal::from(seeds.iter().sum::<i64>()), after, negatives)
        });

        prop_assert_eq!(total_before, total_after);
        prop_assert_eq!(negatives, 0);
    }
}
