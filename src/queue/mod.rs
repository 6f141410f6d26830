//! Transfer queue.
//!
//! - [`transfer`]: queued transfer records, statuses and events
//! - [`priority`]: priority score of a submission
//! - [`backoff`]: delay between retries
//! - [`transaction_queue`]: the queue handle used by the service and processor

pub mod backoff;
pub mod priority;
pub mod transaction_queue;
pub mod transfer;

pub use backoff::Backoff;
pub use priority::PriorityPolicy;
pub use transaction_queue::{QueueError, TransactionQueue, TransferRequest};
pub use transfer::{
    EnqueueOutcome, QueuedTransfer, RejectReason, StatusCounts, TransferEvent, TransferId,
    TransferStatus,
};
