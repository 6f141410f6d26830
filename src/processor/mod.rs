//! Transfer processing.
//!
//! - [`locks`]: per-address lock table
//! - [`batch`]: the periodic claim → process → commit loop

pub mod batch;
pub mod locks;

pub use batch::{BatchProcessor, BatchReport, TransferFailure};
pub use locks::AddressLocks;
