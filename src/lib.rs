//! balance-tier: tiered balance cache with a durable transfer queue.
//!
//! Keeps per-address balances fast to read through three in-memory tiers:
//!   hot (just written) → warm → cold (read-through) → durable store
//!
//! Balance-changing transfers go through a deduplicating, priority-ordered
//! queue and are applied in batches, each transfer committed atomically.

pub mod cache;
pub mod clock;
pub mod config;
pub mod ledger;
pub mod processor;
pub mod queue;
pub mod server;
pub mod service;
pub mod stats;
pub mod store;

pub use service::{Ledger, LedgerError};
