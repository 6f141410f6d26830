//! Tiered balance cache.
//!
//! - [`tier`]: Tier definitions and per-tier sizes
//! - [`tiered`]: the sharded hot/warm/cold cache with store read-through
//! - [`sweeper`]: background task that ages out expired entries

pub mod sweeper;
pub mod tier;
pub mod tiered;

pub use tier::{Tier, TierSizes};
pub use tiered::{SweepReport, TieredCache};
