//! Ledger primitives shared by every layer.
//!
//! - [`address`]: canonical, case-insensitive account addresses
//! - [`amount`]: fixed-precision balances and amount validation

pub mod address;
pub mod amount;

pub use address::Address;
pub use amount::{Balance, BALANCE_SCALE, MAX_AMOUNT};

use rust_decimal::Decimal;
use thiserror::Error;

/// Input that is rejected before it ever reaches the queue.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Malformed address: {0:?}")]
    MalformedAddress(String),

    #[error("Amount must be positive, got {0}")]
    NonPositiveAmount(Decimal),

    #[error("Amount {0} exceeds the maximum of {max}", max = MAX_AMOUNT)]
    AmountTooLarge(Decimal),

    #[error("Balance must be non-negative, got {0}")]
    NegativeBalance(Decimal),

    #[error("Gas price must be non-negative, got {0}")]
    NegativeGasPrice(Decimal),

    #[error("Invalid transfer hash: {0:?}")]
    InvalidHash(String),
}

/// Longest accepted idempotency key.
pub const MAX_HASH_LEN: usize = 128;

/// Validate a caller-supplied idempotency key.
pub fn validate_hash(hash: &str) -> Result<String, ValidationError> {
    let trimmed = hash.trim();
    if trimmed.is_empty() || trimmed.len() > MAX_HASH_LEN {
        return Err(ValidationError::InvalidHash(hash.to_string()));
    }
    Ok(trimmed.to_string())
}
