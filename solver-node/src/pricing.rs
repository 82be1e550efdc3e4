//! Constant product pricing with a basis-points margin.
//!
//! Pure functions over integer reserves in the asset's smallest unit. All
//! money math is exact: amounts are `BigUint`, the margin is integer basis
//! points and rounding is asymmetric by design. Outputs round toward zero
//! and required inputs round away from zero, so the pool never pays out more
//! value than its formula implies.
use num_bigint::BigUint;
use num_traits::Zero;
use thiserror::Error;

/// Basis points denominator, 100% == 10_000 bps.
pub const BPS: u32 = 10_000;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PricingError {
    /// The requested amount is zero or the margin leaves nothing to price.
    #[error("Invalid input amount")]
    InvalidInput,

    /// The pool cannot cover the requested trade.
    #[error("Insufficient liquidity")]
    InsufficientLiquidity,
}

/// Converts a percent margin (e.g. 0.3) into basis points, once at startup.
/// Money math never touches floats after this.
pub fn margin_bps_from_percent(percent: f64) -> u32 {
    (percent * 100.0).floor() as u32
}

/// How much of the output asset a taker receives for `amount_in`, after the
/// solver's margin. Rounds toward zero.
pub fn quote_out(
    amount_in: &BigUint,
    reserve_in: &BigUint,
    reserve_out: &BigUint,
    margin_bps: u32,
) -> Result<BigUint, PricingError> {
    if amount_in.is_zero() || margin_bps >= BPS {
        return Err(PricingError::InvalidInput);
    }
    if reserve_in.is_zero() || reserve_out.is_zero() {
        return Err(PricingError::InsufficientLiquidity);
    }
    let amount_in_after_margin = amount_in * BigUint::from(BPS - margin_bps);
    let numerator = &amount_in_after_margin * reserve_out;
    let denominator = reserve_in * BigUint::from(BPS) + &amount_in_after_margin;
    Ok(numerator / denominator)
}

/// How much of the input asset a taker must pay to receive exactly
/// `amount_out`, including the solver's margin. Rounds away from zero.
pub fn quote_in(
    amount_out: &BigUint,
    reserve_in: &BigUint,
    reserve_out: &BigUint,
    margin_bps: u32,
) -> Result<BigUint, PricingError> {
    if amount_out.is_zero() || margin_bps >= BPS {
        return Err(PricingError::InvalidInput);
    }
    if reserve_in.is_zero() || reserve_out <= amount_out {
        return Err(PricingError::InsufficientLiquidity);
    }
    let numerator = reserve_in * amount_out * BigUint::from(BPS);
    let denominator = (reserve_out - amount_out) * BigUint::from(BPS - margin_bps);
    Ok((&numerator + &denominator - 1u32) / denominator)
}
