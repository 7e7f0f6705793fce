//! Context parameters and modulus-chain construction.

use crate::error::{HeError, Result};
use crate::scheme::SchemeTag;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Encryption parameters of one context.
///
/// `coeff_modulus_bits` lists the chain primes by bit size; the last entry is
/// the special key-switching prime, the others are data primes consumed by
/// rescale / mod-switch from the end towards the front.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ContextParams {
    /// Scheme every value of the context is tagged with.
    pub scheme: SchemeTag,
    /// Ring degree `n`, a power of two.
    pub poly_degree: usize,
    /// BFV/BGV plaintext modulus `t`.
    #[serde(default)]
    pub plain_modulus: Option<u64>,
    /// Bit sizes of the chain primes, special prime last.
    pub coeff_modulus_bits: Vec<u32>,
    /// CKKS scale for encodings that do not name one.
    #[serde(default)]
    pub default_scale: Option<f64>,
}

impl ContextParams {
    /// BFV parameters.
    pub fn bfv(poly_degree: usize, plain_modulus: u64, coeff_modulus_bits: Vec<u32>) -> Self {
        Self {
            scheme: SchemeTag::Bfv,
            poly_degree,
            plain_modulus: Some(plain_modulus),
            coeff_modulus_bits,
            default_scale: None,
        }
    }

    /// BGV parameters.
    pub fn bgv(poly_degree: usize, plain_modulus: u64, coeff_modulus_bits: Vec<u32>) -> Self {
        Self { scheme: SchemeTag::Bgv, ..Self::bfv(poly_degree, plain_modulus, coeff_modulus_bits) }
    }

    /// CKKS parameters.
    pub fn ckks(poly_degree: usize, default_scale: f64, coeff_modulus_bits: Vec<u32>) -> Self {
        Self {
            scheme: SchemeTag::Ckks,
            poly_degree,
            plain_modulus: None,
            coeff_modulus_bits,
            default_scale: Some(default_scale),
        }
    }

    /// Parse and validate a JSON parameter set.
    pub fn from_json(s: &str) -> Result<Self> {
        let params: Self = serde_json::from_str(s)?;
        params.validate()?;
        Ok(params)
    }

    /// [`Self::from_json`] on the contents of `path`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => HeError::FileNotFound(path.to_path_buf()),
            _ => HeError::Io(e),
        })?;
        Self::from_json(&text)
    }

    /// Number of data primes (chain levels).
    pub fn chain_length(&self) -> u32 {
        self.coeff_modulus_bits.len().saturating_sub(1) as u32
    }

    /// BFV/BGV batch the full degree into two rows; CKKS packs n/2 complex slots.
    pub fn slot_count(&self) -> usize {
        match self.scheme {
            SchemeTag::Ckks => self.poly_degree / 2,
            _ => self.poly_degree,
        }
    }

    /// Reject degrees, chains and moduli no engine would accept.
    pub fn validate(&self) -> Result<()> {
        let n = self.poly_degree;
        if n < 8 || !n.is_power_of_two() {
            return Err(HeError::InvalidParams(format!(
                "poly_degree must be a power of two >= 8, got {}",
                n
            )));
        }
        let bits = &self.coeff_modulus_bits;
        if bits.len() < 2 || bits.len() > 16 {
            return Err(HeError::InvalidParams(format!(
                "coeff_modulus_bits needs 2..=16 entries, got {}",
                bits.len()
            )));
        }
        if let Some(b) = bits.iter().find(|&&b| !(20..=60).contains(&b)) {
            return Err(HeError::InvalidParams(format!(
                "chain primes must have 20..=60 bits, got {}",
                b
            )));
        }
        match self.scheme {
            SchemeTag::None => {
                return Err(HeError::InvalidParams("scheme must be bfv, bgv or ckks".into()))
            }
            SchemeTag::Bfv | SchemeTag::Bgv => {
                let t = self.plain_modulus.ok_or_else(|| {
                    HeError::InvalidParams(format!("{} requires a plain modulus", self.scheme))
                })?;
                if t < 2 || (t - 1) % (2 * n as u64) != 0 {
                    return Err(HeError::InvalidParams(format!(
                        "plain modulus {} must satisfy t = 1 mod {} for batching",
                        t,
                        2 * n
                    )));
                }
            }
            SchemeTag::Ckks => {
                let scale = self.default_scale.ok_or_else(|| {
                    HeError::InvalidParams("CKKS requires a default scale".into())
                })?;
                let data_min = bits[..bits.len() - 1].iter().copied().min().unwrap_or(0);
                if !(scale.is_finite() && scale > 1.0) || scale.log2() >= f64::from(data_min) + 1.0 {
                    return Err(HeError::InvalidParams(format!(
                        "default scale 2^{:.2} must lie in (1, 2^{}]",
                        scale.log2(),
                        data_min + 1
                    )));
                }
            }
        }
        Ok(())
    }

    /// One distinct NTT-friendly prime per entry of `coeff_modulus_bits`.
    pub fn chain_primes(&self) -> Result<Vec<u64>> {
        let step = 2 * self.poly_degree as u64;
        let mut primes: Vec<u64> = Vec::with_capacity(self.coeff_modulus_bits.len());
        for &bits in &self.coeff_modulus_bits {
            let upper = 1u64 << bits;
            // largest candidate below 2^bits with q = 1 mod 2n
            let mut q = upper - (upper - 1) % step;
            loop {
                if q <= step {
                    return Err(HeError::InvalidParams(format!(
                        "no {}-bit prime = 1 mod {}",
                        bits, step
                    )));
                }
                if !primes.contains(&q) && is_prime(q) {
                    break;
                }
                q -= step;
            }
            primes.push(q);
        }
        Ok(primes)
    }
}

#[inline]
fn mul_mod(a: u64, b: u64, m: u64) -> u64 {
    (a as u128 * b as u128 % m as u128) as u64
}

#[inline]
fn pow_mod(mut base: u64, mut exp: u64, m: u64) -> u64 {
    let mut res = 1u64;
    base %= m;
    while exp > 0 {
        if exp & 1 == 1 {
            res = mul_mod(res, base, m);
        }
        base = mul_mod(base, base, m);
        exp >>= 1;
    }
    res
}

/// Deterministic Miller-Rabin for 64-bit inputs.
pub(crate) fn is_prime(n: u64) -> bool {
    const WITNESSES: [u64; 12] = [2, 3, 5, 7, 11, 13, 17, 19, 23, 29, 31, 37];
    if n < 2 {
        return false;
    }
    for &p in &WITNESSES {
        if n % p == 0 {
            return n == p;
        }
    }
    let s = (n - 1).trailing_zeros();
    let d = (n - 1) >> s;
    'witness: for &a in &WITNESSES {
        let mut x = pow_mod(a, d, n);
        if x == 1 || x == n - 1 {
            continue;
        }
        for _ in 1..s {
            x = mul_mod(x, x, n);
            if x == n - 1 {
                continue 'witness;
            }
        }
        return false;
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_prime() {
        assert!(is_prime(65537));
        assert!(is_prime(2305843009213693951));
        assert!(!is_prime(65535));
        assert!(!is_prime(1));
        assert!(is_prime(2));
    }

    #[test]
    fn test_chain_primes_are_ntt_friendly_and_distinct() {
        let params = ContextParams::ckks(32, 2f64.powi(30), vec![40, 30, 30, 40]);
        let primes = params.chain_primes().unwrap();
        assert_eq!(primes.len(), 4);
        for (&q, &bits) in primes.iter().zip(&params.coeff_modulus_bits) {
            assert!(is_prime(q));
            assert_eq!(q % 64, 1);
            assert_eq!(64 - q.leading_zeros(), bits);
        }
        assert_ne!(primes[1], primes[2]);
        assert_ne!(primes[0], primes[3]);
    }

    #[test]
    fn test_validate_bfv() {
        assert!(ContextParams::bfv(16, 65537, vec![40, 40]).validate().is_ok());
        let bad_t = ContextParams::bfv(16, 65535, vec![40, 40]);
        assert!(matches!(bad_t.validate(), Err(HeError::InvalidParams(_))));
        let bad_n = ContextParams::bfv(12, 65537, vec![40, 40]);
        assert!(matches!(bad_n.validate(), Err(HeError::InvalidParams(_))));
        let short_chain = ContextParams::bfv(16, 65537, vec![40]);
        assert!(matches!(short_chain.validate(), Err(HeError::InvalidParams(_))));
    }

    #[test]
    fn test_validate_ckks_scale() {
        assert!(ContextParams::ckks(16, 2f64.powi(30), vec![60, 30, 60]).validate().is_ok());
        let too_big = ContextParams::ckks(16, 2f64.powi(40), vec![60, 30, 60]);
        assert!(matches!(too_big.validate(), Err(HeError::InvalidParams(_))));
    }

    #[test]
    fn test_from_json() {
        let json = r#"{
            "scheme": "ckks",
            "poly_degree": 16,
            "coeff_modulus_bits": [60, 30, 30, 60],
            "default_scale": 1073741824.0
        }"#;
        let params = ContextParams::from_json(json).unwrap();
        assert_eq!(params.scheme, SchemeTag::Ckks);
        assert_eq!(params.chain_length(), 3);
        assert_eq!(params.slot_count(), 8);
        assert!(params.plain_modulus.is_none());
    }

    #[test]
    fn test_load_missing_file() {
        let err = ContextParams::load("/nonexistent/he-params.json").unwrap_err();
        assert!(matches!(err, HeError::FileNotFound(_)));
    }
}
