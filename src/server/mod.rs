//! HTTP surface over the ledger.
//!
//! - [`api`]: routes, handlers and error mapping
//! - [`streaming`]: SSE stream of transfer events

pub mod api;
pub mod streaming;

pub use api::{build_router, AppState};
