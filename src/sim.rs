//! Cleartext simulation engine.
//!
//! `SimEngine` implements [`Engine`] over plain slot vectors so the dispatch
//! layer can be exercised without a native library. It is not secure. It does
//! enforce the bookkeeping rules a native engine enforces: operands must sit
//! at the same chain level, CKKS additive operands must carry the same scale,
//! products may not outgrow the remaining modulus, and the right keys must be
//! present.

use crate::engine::{Engine, KeyKind, NativeInfo, SlotValues};
use crate::error::{HeError, Result};
use crate::params::ContextParams;
use crate::scheme::{EncodingTag, SchemeTag};
use crate::state::scales_close;
use itertools::Itertools;
use num_complex::Complex64;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::Normal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use tracing::trace;

/// Standard deviation of the simulated encryption error.
const ERROR_STD_DEV: f64 = 3.2;
/// Relative tolerance of the engine's own scale check.
const NATIVE_SCALE_EPS: f64 = 1e-9;

#[derive(Clone, Copy)]
enum SlotOp {
    Add,
    Sub,
    Mul,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
enum Slots {
    /// BFV/BGV: residues mod t.
    Modular(Vec<u64>),
    /// CKKS: values pre-multiplied by the scale.
    Scaled(Vec<Complex64>),
}

/// Plaintext handle of the [`SimEngine`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SimPlain {
    slots: Slots,
    level: u32,
    scale: Option<f64>,
}

/// Ciphertext handle of the [`SimEngine`]: the slots plus simulated noise.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SimCipher {
    slots: Slots,
    level: u32,
    scale: Option<f64>,
    size: u32,
}

/// Which Galois keys exist.
#[derive(Clone, Debug, Default)]
pub enum RotationKeys {
    /// No rotation at all.
    #[default]
    None,
    /// Power-of-two keys; any step can be composed from them.
    PowersOfTwo,
    /// Only the listed (reduced) steps.
    Steps(BTreeSet<i32>),
}

/// Bookkeeping shared by a [`SimEngine`] across threads.
#[derive(Debug, Default)]
pub struct NativeStats {
    calls: AtomicU64,
    allocations: AtomicU64,
}

/// [`Engine`] that keeps slots in the clear and enforces the native checks.
pub struct SimEngine {
    params: ContextParams,
    primes: Vec<u64>,
    relin_key: bool,
    rotation_keys: RotationKeys,
    row_swap_key: bool,
    rng: Mutex<StdRng>,
    noise: Normal<f64>,
    stats: NativeStats,
}

impl SimEngine {
    /// Engine over validated `params`, without evaluation keys.
    pub fn new(params: ContextParams) -> Result<Self> {
        params.validate()?;
        let primes = params.chain_primes()?;
        let noise = Normal::new(0.0, ERROR_STD_DEV)
            .map_err(|e| HeError::InvalidParams(e.to_string()))?;
        Ok(Self {
            params,
            primes,
            relin_key: false,
            rotation_keys: RotationKeys::None,
            row_swap_key: false,
            rng: Mutex::new(StdRng::from_entropy()),
            noise,
            stats: NativeStats::default(),
        })
    }

    /// Deterministic noise.
    pub fn with_seed(self, seed: u64) -> Self {
        Self { rng: Mutex::new(StdRng::seed_from_u64(seed)), ..self }
    }

    /// Add the relinearization key.
    pub fn with_relin_keys(mut self) -> Self {
        self.relin_key = true;
        self
    }

    /// Power-of-two rotation keys plus the row-swap key.
    pub fn with_rotation_keys(mut self) -> Self {
        self.rotation_keys = RotationKeys::PowersOfTwo;
        self.row_swap_key = true;
        self
    }

    /// Keys for exactly `steps`, reduced into the rotation period.
    pub fn with_rotation_steps(mut self, steps: &[i32]) -> Self {
        let period = self.rotation_period() as i32;
        let set = steps.iter().map(|s| s.rem_euclid(period)).collect();
        self.rotation_keys = RotationKeys::Steps(set);
        self
    }

    /// Add the row-swap key alone.
    pub fn with_row_swap_key(mut self) -> Self {
        self.row_swap_key = true;
        self
    }

    /// Parameters the engine was built from.
    pub fn params(&self) -> &ContextParams {
        &self.params
    }

    /// Data primes of the chain, front first.
    pub fn primes(&self) -> &[u64] {
        &self.primes
    }

    /// Primitive calls issued so far.
    pub fn native_calls(&self) -> u64 {
        self.stats.calls.load(Ordering::Relaxed)
    }

    /// Handles created by encode/encrypt/decrypt/deserialize so far.
    pub fn allocations(&self) -> u64 {
        self.stats.allocations.load(Ordering::Relaxed)
    }

    fn call(&self, op: &'static str) {
        self.stats.calls.fetch_add(1, Ordering::Relaxed);
        trace!(op, "native call");
    }

    fn allocated(&self) {
        self.stats.allocations.fetch_add(1, Ordering::Relaxed);
    }

    fn t(&self) -> u64 {
        self.params.plain_modulus.unwrap_or(0)
    }

    /// Bits of the data primes still present at `level`.
    fn remaining_bits(&self, level: u32) -> f64 {
        let keep = (self.chain_length() - level) as usize;
        self.primes[..keep].iter().map(|&q| (q as f64).log2()).sum()
    }

    fn check_level(&self, op: &'static str, level: u32) -> Result<()> {
        if level >= self.chain_length() {
            return Err(HeError::engine(op, format!("level {} is outside the modulus chain", level)));
        }
        Ok(())
    }

    fn check_next_level(&self, op: &'static str, level: u32) -> Result<()> {
        if level + 1 >= self.chain_length() {
            return Err(HeError::engine(op, "end of modulus switching chain reached"));
        }
        Ok(())
    }

    fn check_same_level(op: &'static str, a: u32, b: u32) -> Result<()> {
        if a != b {
            return Err(HeError::engine(op, format!("operands at levels {} and {}", a, b)));
        }
        Ok(())
    }

    fn check_same_scale(op: &'static str, a: Option<f64>, b: Option<f64>) -> Result<()> {
        match (a, b) {
            (Some(x), Some(y)) if !scales_close(x, y, NATIVE_SCALE_EPS) => {
                Err(HeError::engine(op, format!("scale mismatch 2^{:.4} vs 2^{:.4}", x.log2(), y.log2())))
            }
            _ => Ok(()),
        }
    }

    fn product_scale(&self, op: &'static str, level: u32, a: Option<f64>, b: Option<f64>) -> Result<Option<f64>> {
        match (a, b) {
            (Some(x), Some(y)) => {
                let s = x * y;
                if s.log2() >= self.remaining_bits(level) {
                    return Err(HeError::engine(op, "scale out of bounds"));
                }
                Ok(Some(s))
            }
            _ => Ok(None),
        }
    }

    fn combine(&self, op: &'static str, slot_op: SlotOp, a: &mut Slots, b: &Slots) -> Result<()> {
        let t = self.t();
        match (a, b) {
            (Slots::Modular(x), Slots::Modular(y)) => {
                for (xi, &yi) in x.iter_mut().zip_eq(y) {
                    *xi = match slot_op {
                        SlotOp::Add => ((*xi as u128 + yi as u128) % t as u128) as u64,
                        SlotOp::Sub => ((*xi as u128 + t as u128 - yi as u128) % t as u128) as u64,
                        SlotOp::Mul => (*xi as u128 * yi as u128 % t as u128) as u64,
                    };
                }
                Ok(())
            }
            (Slots::Scaled(x), Slots::Scaled(y)) => {
                for (xi, yi) in x.iter_mut().zip_eq(y) {
                    *xi = match slot_op {
                        SlotOp::Add => *xi + yi,
                        SlotOp::Sub => *xi - yi,
                        SlotOp::Mul => *xi * yi,
                    };
                }
                Ok(())
            }
            _ => Err(HeError::engine(op, "operands from different schemes")),
        }
    }

    fn encrypt_slots(&self, slots: &Slots) -> Slots {
        match slots {
            Slots::Modular(v) => Slots::Modular(v.clone()),
            Slots::Scaled(v) => {
                let mut rng = self.rng.lock().unwrap_or_else(PoisonError::into_inner);
                let noisy = v
                    .iter()
                    .map(|z| {
                        let e_re: f64 = rng.sample(self.noise);
                        let e_im: f64 = rng.sample(self.noise);
                        Complex64::new((z.re + e_re).round(), (z.im + e_im).round())
                    })
                    .collect();
                Slots::Scaled(noisy)
            }
        }
    }

    fn is_zero_slots(slots: &Slots) -> bool {
        match slots {
            Slots::Modular(v) => v.iter().all(|&x| x == 0),
            Slots::Scaled(v) => v.iter().all(|z| z.re == 0.0 && z.im == 0.0),
        }
    }

    fn validate_slots(&self, op: &'static str, slots: &Slots) -> Result<()> {
        let ok = match (slots, self.params.scheme) {
            (Slots::Modular(v), SchemeTag::Bfv | SchemeTag::Bgv) => {
                v.len() == self.slot_count() && v.iter().all(|&x| x < self.t())
            }
            (Slots::Scaled(v), SchemeTag::Ckks) => v.len() == self.slot_count(),
            _ => false,
        };
        if !ok {
            return Err(HeError::engine(op, "blob does not belong to this parameter set"));
        }
        Ok(())
    }
}

impl Engine for SimEngine {
    type Plain = SimPlain;
    type Cipher = SimCipher;

    fn scheme(&self) -> SchemeTag {
        self.params.scheme
    }

    fn slot_count(&self) -> usize {
        self.params.slot_count()
    }

    fn chain_length(&self) -> u32 {
        self.params.chain_length()
    }

    fn chain_prime(&self, level: u32) -> Option<u64> {
        let len = self.chain_length();
        if level + 1 >= len {
            return None;
        }
        Some(self.primes[(len - 1 - level) as usize])
    }

    fn default_scale(&self) -> f64 {
        self.params.default_scale.unwrap_or(1.0)
    }

    fn plain_modulus(&self) -> Option<u64> {
        self.params.plain_modulus
    }

    fn has_key(&self, key: KeyKind) -> bool {
        match key {
            KeyKind::Secret => true,
            KeyKind::Relin => self.relin_key,
            KeyKind::RowSwap => self.row_swap_key,
            KeyKind::Rotation(step) => match &self.rotation_keys {
                RotationKeys::None => false,
                RotationKeys::PowersOfTwo => true,
                RotationKeys::Steps(set) => set.contains(&step),
            },
        }
    }

    fn encode(&self, values: &SlotValues, encoding: EncodingTag, scale: Option<f64>) -> Result<SimPlain> {
        self.call("encode");
        let capacity = self.capacity(encoding);
        if values.len() > capacity {
            return Err(HeError::engine("encode", format!("{} values for {} slots", values.len(), capacity)));
        }
        let n = self.slot_count();
        let plain = match self.params.scheme {
            SchemeTag::Bfv | SchemeTag::Bgv => {
                let t = self.t() as i128;
                let ints = match values {
                    SlotValues::Int(v) => v.clone(),
                    SlotValues::Real(v) if v.iter().all(|x| x.fract() == 0.0) => {
                        v.iter().map(|&x| x as i64).collect()
                    }
                    _ => return Err(HeError::engine("encode", "integer schemes take integral values")),
                };
                let mut slots: Vec<u64> = ints
                    .into_iter()
                    .map(|x| (x as i128).rem_euclid(t) as u64)
                    .collect();
                slots.resize(n, 0);
                SimPlain { slots: Slots::Modular(slots), level: 0, scale: None }
            }
            SchemeTag::Ckks => {
                let s = scale.unwrap_or_else(|| self.default_scale());
                if !(s.is_finite() && s > 0.0) {
                    return Err(HeError::InvalidScale(s));
                }
                let mut slots: Vec<Complex64> = values
                    .to_complex()
                    .into_iter()
                    .map(|z| Complex64::new((z.re * s).round(), (z.im * s).round()))
                    .collect();
                slots.resize(n, Complex64::new(0.0, 0.0));
                SimPlain { slots: Slots::Scaled(slots), level: 0, scale: Some(s) }
            }
            SchemeTag::None => return Err(HeError::engine("encode", "no scheme")),
        };
        self.allocated();
        Ok(plain)
    }

    fn decode(&self, plain: &SimPlain, encoding: EncodingTag) -> Result<SlotValues> {
        self.call("decode");
        self.check_level("decode", plain.level)?;
        let take = self.capacity(encoding);
        match &plain.slots {
            Slots::Modular(v) => {
                let t = self.t();
                let centred = v
                    .iter()
                    .take(take)
                    .map(|&x| if x > t / 2 { x as i64 - t as i64 } else { x as i64 })
                    .collect();
                Ok(SlotValues::Int(centred))
            }
            Slots::Scaled(v) => {
                let s = plain.scale.unwrap_or(1.0);
                let values = v.iter().take(take).map(|z| *z / s);
                match encoding {
                    EncodingTag::Complex => Ok(SlotValues::Complex(values.collect())),
                    _ => Ok(SlotValues::Real(values.map(|z| z.re).collect())),
                }
            }
        }
    }

    fn encrypt(&self, plain: &SimPlain) -> Result<SimCipher> {
        self.call("encrypt");
        self.check_level("encrypt", plain.level)?;
        let slots = self.encrypt_slots(&plain.slots);
        self.allocated();
        Ok(SimCipher { slots, level: plain.level, scale: plain.scale, size: 2 })
    }

    fn decrypt(&self, cipher: &SimCipher) -> Result<SimPlain> {
        self.call("decrypt");
        self.check_level("decrypt", cipher.level)?;
        self.allocated();
        Ok(SimPlain { slots: cipher.slots.clone(), level: cipher.level, scale: cipher.scale })
    }

    fn add(&self, a: &mut SimCipher, b: &SimCipher) -> Result<()> {
        self.call("add");
        Self::check_same_level("add", a.level, b.level)?;
        Self::check_same_scale("add", a.scale, b.scale)?;
        self.combine("add", SlotOp::Add, &mut a.slots, &b.slots)?;
        a.size = a.size.max(b.size);
        Ok(())
    }

    fn sub(&self, a: &mut SimCipher, b: &SimCipher) -> Result<()> {
        self.call("sub");
        Self::check_same_level("sub", a.level, b.level)?;
        Self::check_same_scale("sub", a.scale, b.scale)?;
        self.combine("sub", SlotOp::Sub, &mut a.slots, &b.slots)?;
        a.size = a.size.max(b.size);
        Ok(())
    }

    fn mul(&self, a: &mut SimCipher, b: &SimCipher) -> Result<()> {
        self.call("mul");
        Self::check_same_level("mul", a.level, b.level)?;
        let scale = self.product_scale("mul", a.level, a.scale, b.scale)?;
        self.combine("mul", SlotOp::Mul, &mut a.slots, &b.slots)?;
        a.scale = scale;
        a.size = a.size + b.size - 1;
        Ok(())
    }

    fn add_plain(&self, a: &mut SimCipher, b: &SimPlain) -> Result<()> {
        self.call("add_plain");
        Self::check_same_level("add_plain", a.level, b.level)?;
        Self::check_same_scale("add_plain", a.scale, b.scale)?;
        self.combine("add", SlotOp::Add, &mut a.slots, &b.slots)
    }

    fn sub_plain(&self, a: &mut SimCipher, b: &SimPlain) -> Result<()> {
        self.call("sub_plain");
        Self::check_same_level("sub_plain", a.level, b.level)?;
        Self::check_same_scale("sub_plain", a.scale, b.scale)?;
        self.combine("sub", SlotOp::Sub, &mut a.slots, &b.slots)
    }

    fn mul_plain(&self, a: &mut SimCipher, b: &SimPlain) -> Result<()> {
        self.call("mul_plain");
        Self::check_same_level("mul_plain", a.level, b.level)?;
        if Self::is_zero_slots(&b.slots) {
            return Err(HeError::engine("mul_plain", "result ciphertext is transparent"));
        }
        let scale = self.product_scale("mul_plain", a.level, a.scale, b.scale)?;
        self.combine("mul", SlotOp::Mul, &mut a.slots, &b.slots)?;
        a.scale = scale;
        Ok(())
    }

    fn negate(&self, a: &mut SimCipher) -> Result<()> {
        self.call("negate");
        let t = self.t();
        match &mut a.slots {
            Slots::Modular(v) => v.iter_mut().for_each(|x| *x = (t - *x) % t),
            Slots::Scaled(v) => v.iter_mut().for_each(|z| *z = -*z),
        }
        Ok(())
    }

    fn relinearize(&self, a: &mut SimCipher) -> Result<()> {
        self.call("relinearize");
        if !self.relin_key {
            return Err(HeError::engine("relinearize", "no relinearization key"));
        }
        a.size = 2;
        Ok(())
    }

    fn rotate(&self, a: &mut SimCipher, steps: i32) -> Result<()> {
        self.call("rotate");
        let period = self.rotation_period();
        let k = steps.rem_euclid(period as i32) as usize;
        if !self.has_key(KeyKind::Rotation(k as i32)) {
            return Err(HeError::engine("rotate", format!("no Galois key for step {}", k)));
        }
        if a.size != 2 {
            return Err(HeError::engine("rotate", "ciphertext must be relinearized"));
        }
        match &mut a.slots {
            Slots::Modular(v) => v.chunks_mut(period).for_each(|row| row.rotate_left(k)),
            Slots::Scaled(v) => v.rotate_left(k),
        }
        Ok(())
    }

    fn swap_rows(&self, a: &mut SimCipher) -> Result<()> {
        self.call("swap_rows");
        if !self.row_swap_key {
            return Err(HeError::engine("swap_rows", "no Galois key for row swap"));
        }
        match &mut a.slots {
            Slots::Modular(v) => {
                let half = v.len() / 2;
                v.rotate_left(half);
                Ok(())
            }
            Slots::Scaled(_) => Err(HeError::engine("swap_rows", "CKKS has no batching rows")),
        }
    }

    fn rescale_to_next(&self, a: &mut SimCipher) -> Result<()> {
        self.call("rescale_to_next");
        let q = self
            .chain_prime(a.level)
            .ok_or_else(|| HeError::engine("rescale_to_next", "end of modulus switching chain reached"))?
            as f64;
        match (&mut a.slots, a.scale) {
            (Slots::Scaled(v), Some(s)) => {
                v.iter_mut()
                    .for_each(|z| *z = Complex64::new((z.re / q).round(), (z.im / q).round()));
                a.scale = Some(s / q);
                a.level += 1;
                Ok(())
            }
            _ => Err(HeError::engine("rescale_to_next", "rescale is only defined for CKKS")),
        }
    }

    fn mod_switch_to_next(&self, a: &mut SimCipher) -> Result<()> {
        self.call("mod_switch_to_next");
        self.check_next_level("mod_switch_to_next", a.level)?;
        a.level += 1;
        Ok(())
    }

    fn mod_switch_plain_to_next(&self, p: &mut SimPlain) -> Result<()> {
        self.call("mod_switch_plain_to_next");
        self.check_next_level("mod_switch_plain_to_next", p.level)?;
        p.level += 1;
        Ok(())
    }

    fn override_scale(&self, a: &mut SimCipher, scale: f64) -> Result<()> {
        self.call("override_scale");
        match a.scale {
            Some(_) => {
                a.scale = Some(scale);
                Ok(())
            }
            None => Err(HeError::engine("override_scale", "scale is only defined for CKKS")),
        }
    }

    fn override_plain_scale(&self, p: &mut SimPlain, scale: f64) -> Result<()> {
        self.call("override_plain_scale");
        match p.scale {
            Some(_) => {
                p.scale = Some(scale);
                Ok(())
            }
            None => Err(HeError::engine("override_plain_scale", "scale is only defined for CKKS")),
        }
    }

    fn plain_is_zero(&self, p: &SimPlain) -> bool {
        self.call("plain_is_zero");
        Self::is_zero_slots(&p.slots)
    }

    fn cipher_is_transparent(&self, c: &SimCipher) -> bool {
        self.call("cipher_is_transparent");
        Self::is_zero_slots(&c.slots)
    }

    fn plain_eq(&self, a: &SimPlain, b: &SimPlain) -> bool {
        a == b
    }

    fn plain_info(&self, p: &SimPlain) -> NativeInfo {
        NativeInfo { level: p.level, scale: p.scale, size: 0 }
    }

    fn cipher_info(&self, c: &SimCipher) -> NativeInfo {
        NativeInfo { level: c.level, scale: c.scale, size: c.size }
    }

    fn serialize_plain(&self, p: &SimPlain) -> Result<Vec<u8>> {
        self.call("serialize_plain");
        Ok(bincode::serialize(p)?)
    }

    fn deserialize_plain(&self, bytes: &[u8]) -> Result<SimPlain> {
        self.call("deserialize_plain");
        let p: SimPlain = bincode::deserialize(bytes)?;
        self.check_level("deserialize_plain", p.level)?;
        self.validate_slots("deserialize_plain", &p.slots)?;
        self.allocated();
        Ok(p)
    }

    fn serialize_cipher(&self, c: &SimCipher) -> Result<Vec<u8>> {
        self.call("serialize_cipher");
        Ok(bincode::serialize(c)?)
    }

    fn deserialize_cipher(&self, bytes: &[u8]) -> Result<SimCipher> {
        self.call("deserialize_cipher");
        let c: SimCipher = bincode::deserialize(bytes)?;
        self.check_level("deserialize_cipher", c.level)?;
        self.validate_slots("deserialize_cipher", &c.slots)?;
        if c.size < 2 {
            return Err(HeError::engine("deserialize_cipher", "ciphertext size below 2"));
        }
        self.allocated();
        Ok(c)
    }
}
