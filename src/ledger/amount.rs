//! Fixed-precision balances.

use rust_decimal::Decimal;

use super::ValidationError;

/// Balances and amounts are decimals with this many fractional digits.
pub const BALANCE_SCALE: u32 = 8;

/// Upper bound on a single transfer amount (10^18).
pub const MAX_AMOUNT: Decimal = Decimal::from_parts(2_808_348_672, 232_830_643, 0, false, 0);

/// A non-negative account balance.
pub type Balance = Decimal;

/// Round to the ledger precision.
pub fn round(value: Decimal) -> Decimal {
    value.round_dp(BALANCE_SCALE)
}

/// Validate a transfer amount: strictly positive after rounding, at most [`MAX_AMOUNT`].
pub fn validate_amount(amount: Decimal) -> Result<Decimal, ValidationError> {
    let rounded = round(amount);
    if rounded <= Decimal::ZERO {
        return Err(ValidationError::NonPositiveAmount(amount));
    }
    if rounded > MAX_AMOUNT {
        return Err(ValidationError::AmountTooLarge(amount));
    }
    Ok(rounded)
}

/// Validate a balance that is being written directly (seeding, imports).
pub fn validate_balance(balance: Decimal) -> Result<Balance, ValidationError> {
    let rounded = round(balance);
    if rounded < Decimal::ZERO {
        return Err(ValidationError::NegativeBalance(balance));
    }
    Ok(rounded)
}

/// Validate a fee hint. Missing hints count as zero.
pub fn validate_gas_price(gas_price: Option<Decimal>) -> Result<Decimal, ValidationError> {
    let price = gas_price.unwrap_or(Decimal::ZERO);
    if price < Decimal::ZERO {
        return Err(ValidationError::NegativeGasPrice(price));
    }
    Ok(price)
}
