//! Write-ahead-log store backend.
//!
//! Layout under the data directory:
//!
//! ```text
//! ledger.snapshot.json   full state image written by compaction
//! ledger.log             one JSON `LogRecord` per line, appended after the snapshot
//! ```
//!
//! A mutation is planned against the in-memory state, appended to the log
//! (and synced when `fsync` is on), and only then applied. Readers never wait
//! on the log writer. Replaying a record twice is harmless, so a crash between
//! writing a snapshot and truncating the log loses nothing.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::fs::{self, File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::state::{LedgerState, LogRecord, Snapshot};
use super::{
    BalanceWrite, ClaimRequest, EnqueueResult, StatusUpdate, Store, StoreError, TransferCommit,
};
use crate::clock::Millis;
use crate::config::StoreConfig;
use crate::ledger::{Address, Balance};
use crate::queue::transfer::{NewTransfer, QueuedTransfer, StatusCounts, TransferId};

const SNAPSHOT_FILE: &str = "ledger.snapshot.json";
const LOG_FILE: &str = "ledger.log";

struct LogWriter {
    file: File,
    /// Length of the log up to the last complete record.
    len: u64,
    /// Records appended since the last compaction.
    records: usize,
}

struct Shared {
    dir: PathBuf,
    state: RwLock<LedgerState>,
    writer: Arc<Mutex<LogWriter>>,
    fsync: bool,
    compact_every: usize,
}

pub struct FileStore {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for FileStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileStore")
            .field("dir", &self.shared.dir)
            .field("fsync", &self.shared.fsync)
            .field("compact_every", &self.shared.compact_every)
            .finish()
    }
}

impl FileStore {
    /// Open (or create) the store in `config.data_dir`, replaying any log.
    pub async fn open(config: &StoreConfig) -> Result<Self, StoreError> {
        let dir = config.data_dir.clone();
        fs::create_dir_all(&dir).await?;

        let mut state = match fs::read(dir.join(SNAPSHOT_FILE)).await {
            Ok(bytes) => {
                let snapshot: Snapshot = serde_json::from_slice(&bytes)?;
                LedgerState::from_snapshot(snapshot)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => LedgerState::new(),
            Err(e) => return Err(e.into()),
        };

        let log_path = dir.join(LOG_FILE);
        let (len, records) = replay(&log_path, &mut state).await?;

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
            .await?;
        if file.metadata().await?.len() != len {
            file.set_len(len).await?;
        }

        let counts = state.status_counts();
        info!(
            dir = %dir.display(),
            replayed = records,
            pending = counts.pending,
            claimed = counts.claimed,
            completed = counts.completed,
            failed = counts.failed,
            "Opened file store"
        );

        Ok(Self {
            shared: Arc::new(Shared {
                dir,
                state: RwLock::new(state),
                writer: Arc::new(Mutex::new(LogWriter { file, len, records })),
                fsync: config.fsync,
                compact_every: config.compact_every,
            }),
        })
    }

    /// Write a fresh snapshot and truncate the log.
    pub async fn compact(&self) -> Result<(), StoreError> {
        let mut writer = self.shared.writer.lock().await;
        self.shared.compact_locked(&mut writer).await
    }

    /// Plan under a read lock, then append the record and apply it.
    ///
    /// The append and apply run on their own task holding the writer lock,
    /// so a caller that stops waiting (a timeout, a dropped request) cannot
    /// leave a record on disk that memory never saw.
    async fn execute<T>(
        &self,
        plan: impl FnOnce(&LedgerState) -> Result<(T, Option<LogRecord>), StoreError>,
    ) -> Result<T, StoreError> {
        let writer = self.shared.writer.clone().lock_owned().await;
        let (out, record) = {
            let state = self.shared.state.read();
            plan(&state)?
        };

        let Some(record) = record else {
            return Ok(out);
        };

        let shared = self.shared.clone();
        tokio::spawn(async move { shared.append_and_apply(writer, record).await })
            .await
            .map_err(|e| StoreError::Unavailable(format!("ledger log writer failed: {e}")))??;
        Ok(out)
    }
}

impl Shared {
    async fn append_and_apply(
        &self,
        mut writer: OwnedMutexGuard<LogWriter>,
        record: LogRecord,
    ) -> Result<(), StoreError> {
        let mut line = serde_json::to_vec(&record)?;
        line.push(b'\n');
        if let Err(e) = self.append(&mut writer, &line).await {
            // Drop whatever part of the record reached the file.
            if let Err(truncate) = writer.file.set_len(writer.len).await {
                warn!(error = %truncate, "Failed to roll back partial log record");
            }
            return Err(e);
        }
        writer.len += line.len() as u64;
        writer.records += 1;

        self.state.write().apply(&record);

        if self.compact_every > 0 && writer.records >= self.compact_every {
            if let Err(e) = self.compact_locked(&mut writer).await {
                warn!(error = %e, "Ledger compaction failed, continuing on the log");
            }
        }
        Ok(())
    }

    async fn append(&self, writer: &mut LogWriter, line: &[u8]) -> Result<(), StoreError> {
        writer.file.write_all(line).await?;
        if self.fsync {
            writer.file.sync_data().await?;
        } else {
            writer.file.flush().await?;
        }
        Ok(())
    }

    async fn compact_locked(&self, writer: &mut LogWriter) -> Result<(), StoreError> {
        let snapshot = self.state.read().snapshot();
        let bytes = serde_json::to_vec(&snapshot)?;

        let tmp = self.dir.join(format!("{SNAPSHOT_FILE}.tmp"));
        let mut file = File::create(&tmp).await?;
        file.write_all(&bytes).await?;
        file.sync_all().await?;
        drop(file);
        fs::rename(&tmp, self.dir.join(SNAPSHOT_FILE)).await?;

        writer.file.set_len(0).await?;
        writer.len = 0;
        let compacted = std::mem::take(&mut writer.records);

        debug!(
            records = compacted,
            transfers = snapshot.transfers.len(),
            balances = snapshot.balances.len(),
            size = bytes.len(),
            "Compacted ledger log"
        );
        Ok(())
    }
}

/// Apply every complete record in the log. Returns the length of the valid
/// prefix and the number of records applied.
async fn replay(path: &Path, state: &mut LedgerState) -> Result<(u64, usize), StoreError> {
    let bytes = match fs::read(path).await {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok((0, 0)),
        Err(e) => return Err(e.into()),
    };

    let mut offset = 0usize;
    let mut records = 0usize;
    let mut line_no = 0usize;

    while offset < bytes.len() {
        line_no += 1;
        let rest = &bytes[offset..];
        let Some(end) = rest.iter().position(|&b| b == b'\n') else {
            // An unterminated tail is a write that never completed.
            warn!(
                path = %path.display(),
                line = line_no,
                bytes = rest.len(),
                "Discarding torn record at end of ledger log"
            );
            break;
        };

        let line = &rest[..end];
        offset += end + 1;
        if line.iter().all(u8::is_ascii_whitespace) {
            continue;
        }

        let record: LogRecord =
            serde_json::from_slice(line).map_err(|e| StoreError::Corrupt {
                line: line_no,
                reason: e.to_string(),
            })?;
        state.apply(&record);
        records += 1;
    }

    Ok((offset as u64, records))
}

#[async_trait]
impl Store for FileStore {
    async fn read_balance(&self, address: &Address) -> Result<Option<Balance>, StoreError> {
        Ok(self.shared.state.read().balance(address))
    }

    async fn write_balances(&self, writes: &[BalanceWrite]) -> Result<(), StoreError> {
        self.execute(|state| Ok(((), state.plan_write_balances(writes))))
            .await
    }

    async fn enqueue(
        &self,
        transfer: NewTransfer,
        max_outstanding: usize,
    ) -> Result<EnqueueResult, StoreError> {
        self.execute(|state| Ok(state.plan_enqueue(transfer, max_outstanding)))
            .await
    }

    async fn claim(&self, request: ClaimRequest) -> Result<Vec<QueuedTransfer>, StoreError> {
        self.execute(|state| Ok(state.plan_claim(&request))).await
    }

    async fn renew_leases(
        &self,
        owner: Uuid,
        ids: &[TransferId],
        now: Millis,
        expires_at: Millis,
    ) -> Result<usize, StoreError> {
        self.execute(|state| Ok(state.plan_renew(owner, ids, now, expires_at)))
            .await
    }

    async fn release_claims(&self, owner: Uuid) -> Result<usize, StoreError> {
        self.execute(|state| Ok(state.plan_release(owner))).await
    }

    async fn commit_transfer(&self, commit: TransferCommit) -> Result<QueuedTransfer, StoreError> {
        self.execute(|state| {
            let (transfer, record) = state.plan_commit(&commit)?;
            Ok((transfer, Some(record)))
        })
        .await
    }

    async fn update_status(&self, update: StatusUpdate) -> Result<QueuedTransfer, StoreError> {
        self.execute(|state| {
            let (transfer, record) = state.plan_update(&update)?;
            Ok((transfer, Some(record)))
        })
        .await
    }

    async fn get_transfer(&self, id: TransferId) -> Result<Option<QueuedTransfer>, StoreError> {
        Ok(self.shared.state.read().transfer(id).cloned())
    }

    async fn status_counts(&self) -> Result<StatusCounts, StoreError> {
        Ok(self.shared.state.read().status_counts())
    }

    async fn purge_completed(&self, older_than: Millis) -> Result<usize, StoreError> {
        self.execute(|state| Ok(state.plan_purge(older_than))).await
    }
}
