//! Per-value numeric state: modulus-chain level and CKKS scale.

use crate::error::{HeError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Relative scale tolerance (2^-20 of the larger scale).
pub const SCALE_TOLERANCE: f64 = 1.0 / (1u64 << 20) as f64;

/// `true` when `a` and `b` differ by at most `tol` relative to the larger one.
pub fn scales_close(a: f64, b: f64, tol: f64) -> bool {
    let hi = a.abs().max(b.abs());
    (a - b).abs() <= tol * hi
}

/// (level, scale)
///
/// `scale` is `Some` only for CKKS values.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct NumericState {
    chain_level: u32,
    scale: Option<f64>,
}

impl NumericState {
    /// State of a BFV/BGV value at `chain_level`.
    pub fn integer(chain_level: u32) -> Self {
        Self { chain_level, scale: None }
    }

    /// State of a CKKS value; fails on a non-positive scale.
    pub fn ckks(chain_level: u32, scale: f64) -> Result<Self> {
        let mut state = Self { chain_level, scale: None };
        state.set_scale(scale)?;
        Ok(state)
    }

    /// Primes dropped so far.
    pub fn chain_level(&self) -> u32 {
        self.chain_level
    }

    /// `None` outside CKKS.
    pub fn scale(&self) -> Option<f64> {
        self.scale
    }

    /// Advance one step down the modulus chain.
    pub fn bump_level(&mut self) {
        self.chain_level += 1;
    }

    /// Replace the scale; fails unless it is finite and positive.
    pub fn set_scale(&mut self, scale: f64) -> Result<()> {
        if !(scale.is_finite() && scale > 0.0) {
            return Err(HeError::InvalidScale(scale));
        }
        self.scale = Some(scale);
        Ok(())
    }

    /// Same level and, for CKKS, scales equal within [`SCALE_TOLERANCE`].
    pub fn matches(&self, other: &NumericState) -> bool {
        self.matches_within(other, SCALE_TOLERANCE)
    }

    /// [`NumericState::matches`] with an explicit relative tolerance.
    pub fn matches_within(&self, other: &NumericState, tol: f64) -> bool {
        if self.chain_level != other.chain_level {
            return false;
        }
        match (self.scale, other.scale) {
            (None, None) => true,
            (Some(a), Some(b)) => scales_close(a, b, tol),
            _ => false,
        }
    }

    /// Scale in bits.
    pub fn log2_scale(&self) -> Option<f64> {
        self.scale.map(f64::log2)
    }
}

impl fmt::Display for NumericState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "level {}", self.chain_level)?;
        if let Some(bits) = self.log2_scale() {
            write!(f, ", scale 2^{:.2}", bits)?;
        }
        Ok(())
    }
}
