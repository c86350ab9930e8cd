//! Integer minor-unit <-> decimal conversion.
//!
//! Scaling is done with quotient/remainder against `10^decimals` in U256, so
//! no value ever passes through `f64`.

use super::TvlError;
use alloy::primitives::U256;
use rust_decimal::Decimal;

/// Largest scale `Decimal` can represent.
pub const MAX_DECIMALS: u32 = 28;

fn pow10(decimals: u32) -> U256 {
    U256::from(10u64).pow(U256::from(decimals))
}

/// Scale a raw integer balance by `decimals`.
///
/// Exact or an error: a result needing more than 28 significant digits would
/// be rounded by `Decimal`, so it is rejected with [`TvlError::PrecisionLoss`].
pub fn scale_units(raw: U256, decimals: u32) -> Result<Decimal, TvlError> {
    if decimals > MAX_DECIMALS {
        return Err(TvlError::UnsupportedDecimals(decimals));
    }
    let divisor = pow10(decimals);
    let quotient = raw / divisor;
    let remainder = raw % divisor;

    let whole = u128::try_from(quotient)
        .ok()
        .and_then(|q| i128::try_from(q).ok())
        .and_then(|q| Decimal::try_from_i128_with_scale(q, 0).ok())
        .ok_or(TvlError::BalanceOverflow(raw))?;

    if remainder.is_zero() {
        return Ok(whole);
    }

    // remainder < 10^28 < 2^96, always representable
    let fraction = u128::try_from(remainder)
        .ok()
        .and_then(|r| i128::try_from(r).ok())
        .and_then(|r| Decimal::try_from_i128_with_scale(r, decimals).ok())
        .ok_or(TvlError::BalanceOverflow(raw))?;

    let scaled = whole
        .checked_add(fraction)
        .ok_or(TvlError::BalanceOverflow(raw))?;
    if to_units(scaled, decimals) != Some(raw) {
        return Err(TvlError::PrecisionLoss { raw, decimals });
    }
    Ok(scaled)
}

/// Inverse of [`scale_units`]. `None` for negative values or values with more
/// fractional digits than `decimals`.
pub fn to_units(value: Decimal, decimals: u32) -> Option<U256> {
    if value.is_sign_negative() && !value.is_zero() {
        return None;
    }
    let value = value.normalize();
    let scale = value.scale();
    if scale > decimals {
        return None;
    }
    let mantissa = u128::try_from(value.mantissa()).ok()?;
    Some(U256::from(mantissa) * pow10(decimals - scale))
}
