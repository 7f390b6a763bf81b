//! 18-decimal fixed-point arithmetic.
//!
//! Every monetary quantity in the engine is a WAD-scaled (1e18) `u128`.
//! Products route through a 256-bit intermediate so share conversions never
//! overflow on realistic magnitudes. The transcendental helpers (`wad_ln`,
//! `wad_exp`) are fixed-iteration algorithms: their cost never depends on
//! the argument, which is what keeps interest accrual O(1) in elapsed time.

use crate::{LedgerError, Result};

/// One whole unit: 10^18.
pub const WAD: u128 = 1_000_000_000_000_000_000;

/// ln(2), WAD-scaled.
const LN2_WAD: u128 = 693_147_180_559_945_309;

/// Euler's number, WAD-scaled.
const E_WAD: u128 = 2_718_281_828_459_045_235;

/// Fractional bits extracted by the binary-logarithm loop.
const LOG2_FRAC_BITS: u32 = 60;

/// Taylor terms for e^f, f in [0, 1). Terms vanish well before this bound.
const EXP_TAYLOR_TERMS: u128 = 32;

/// Largest exponent accepted by [`wad_exp`]: e^44 is the last power whose
/// WAD representation fits in a `u128`.
pub const MAX_EXP_INPUT: u128 = 44 * WAD;

/// Explicit rounding direction for every conversion that can lose
/// precision. Call sites pick the direction that favors system solvency.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Rounding {
    Down,
    Up,
}

/// Full 256-bit product of two `u128`s as (hi, lo) limbs.
fn full_mul(a: u128, b: u128) -> (u128, u128) {
    const MASK: u128 = (1u128 << 64) - 1;
    let (a_hi, a_lo) = (a >> 64, a & MASK);
    let (b_hi, b_lo) = (b >> 64, b & MASK);

    let ll = a_lo * b_lo;
    let lh = a_lo * b_hi;
    let hl = a_hi * b_lo;
    let hh = a_hi * b_hi;

    let mid = (ll >> 64) + (lh & MASK) + (hl & MASK);
    let lo = (mid << 64) | (ll & MASK);
    let hi = hh + (lh >> 64) + (hl >> 64) + (mid >> 64);
    (hi, lo)
}

/// Divide the 256-bit value (hi, lo) by `d`, returning (quotient, remainder).
///
/// Restoring long division over the low limb; the loop invariant keeps the
/// running remainder below `d`, so the conceptual 129-bit intermediate
/// reduces to one carry bit. Errors when the quotient does not fit a `u128`
/// or `d` is zero.
fn div_wide(hi: u128, lo: u128, d: u128) -> Result<(u128, u128)> {
    if d == 0 {
        return Err(LedgerError::Overflow);
    }
    if hi == 0 {
        return Ok((lo / d, lo % d));
    }
    if hi >= d {
        return Err(LedgerError::Overflow);
    }
    let mut rem = hi;
    let mut quot: u128 = 0;
    for i in (0..128).rev() {
        let carry = rem >> 127;
        rem = (rem << 1) | ((lo >> i) & 1);
        if carry == 1 || rem >= d {
            rem = rem.wrapping_sub(d);
            quot |= 1 << i;
        }
    }
    Ok((quot, rem))
}

/// a * b / d with a 256-bit intermediate and explicit rounding.
pub fn mul_div(a: u128, b: u128, d: u128, rounding: Rounding) -> Result<u128> {
    let (hi, lo) = full_mul(a, b);
    let (q, r) = div_wide(hi, lo, d)?;
    match rounding {
        Rounding::Down => Ok(q),
        Rounding::Up => {
            if r > 0 {
                q.checked_add(1).ok_or(LedgerError::Overflow)
            } else {
                Ok(q)
            }
        }
    }
}

/// a * b / WAD.
pub fn wad_mul(a: u128, b: u128, rounding: Rounding) -> Result<u128> {
    mul_div(a, b, WAD, rounding)
}

/// a * WAD / b.
pub fn wad_div(a: u128, b: u128, rounding: Rounding) -> Result<u128> {
    mul_div(a, WAD, b, rounding)
}

/// Natural logarithm of a WAD-scaled value. Domain: x >= WAD (the engine
/// only ever takes logs of growth ratios, which are >= 1).
///
/// Binary logarithm by repeated squaring: normalize x into [1, 2), pull 60
/// fractional bits of log2, rescale by ln 2. Both loops have fixed bounds.
pub fn wad_ln(x: u128) -> Result<u128> {
    if x < WAD {
        return Err(LedgerError::Overflow);
    }
    let mut y = x;
    let mut int_bits: u128 = 0;
    while y >= 2 * WAD {
        y /= 2;
        int_bits += 1;
    }
    let mut frac: u128 = 0;
    for _ in 0..LOG2_FRAC_BITS {
        // y < 2*WAD, so y*y < 4e36 fits a u128 without widening
        y = y * y / WAD;
        frac <<= 1;
        if y >= 2 * WAD {
            y /= 2;
            frac |= 1;
        }
    }
    let int_part = int_bits
        .checked_mul(LN2_WAD)
        .ok_or(LedgerError::Overflow)?;
    let frac_part = mul_div(LN2_WAD, frac, 1u128 << LOG2_FRAC_BITS, Rounding::Down)?;
    int_part.checked_add(frac_part).ok_or(LedgerError::Overflow)
}

/// e^x for a WAD-scaled, non-negative x. Errors above [`MAX_EXP_INPUT`].
///
/// Splits x into whole and fractional parts: Taylor series on the fraction
/// (converges inside [`EXP_TAYLOR_TERMS`] for f < 1), repeated
/// multiplication by e for the whole part (at most 44 steps).
pub fn wad_exp(x: u128) -> Result<u128> {
    if x > MAX_EXP_INPUT {
        return Err(LedgerError::Overflow);
    }
    let n = x / WAD;
    let f = x % WAD;

    let mut sum = WAD;
    let mut term = WAD;
    for k in 1..=EXP_TAYLOR_TERMS {
        term = mul_div(term, f, WAD * k, Rounding::Down)?;
        if term == 0 {
            break;
        }
        sum += term;
    }

    let mut out = sum;
    for _ in 0..n {
        out = mul_div(out, E_WAD, WAD, Rounding::Down)?;
    }
    Ok(out)
}
