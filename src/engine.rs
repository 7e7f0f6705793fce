//! Primitive interface of the native HE engine.
//!
//! Everything in this crate talks to the engine through [`Engine`]. The engine
//! owns all polynomial math; this layer only decides *which* primitive to call
//! and keeps the metadata straight. Handles are plain Rust values: dropping
//! one releases the native resource.
//!
//! Thread safety is the engine's business. A [`crate::Context`] may be shared
//! across threads only when the engine is `Sync`, and each primitive must then
//! be safe for concurrent calls on distinct handles.

use crate::error::Result;
use crate::scheme::{EncodingTag, SchemeTag};
use num_complex::Complex64;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Cleartext slot payload crossing the encode/decode boundary.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum SlotValues {
    /// BFV/BGV integers.
    Int(Vec<i64>),
    /// CKKS reals.
    Real(Vec<f64>),
    /// CKKS complex numbers.
    Complex(Vec<Complex64>),
}

impl SlotValues {
    /// Number of values.
    pub fn len(&self) -> usize {
        match self {
            SlotValues::Int(v) => v.len(),
            SlotValues::Real(v) => v.len(),
            SlotValues::Complex(v) => v.len(),
        }
    }

    /// No values at all.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Right-pad with zeros (or truncate) to `n` slots.
    pub fn resized(mut self, n: usize) -> Self {
        match &mut self {
            SlotValues::Int(v) => v.resize(n, 0),
            SlotValues::Real(v) => v.resize(n, 0.0),
            SlotValues::Complex(v) => v.resize(n, Complex64::new(0.0, 0.0)),
        }
        self
    }

    /// Real parts, whatever the representation.
    pub fn to_reals(&self) -> Vec<f64> {
        match self {
            SlotValues::Int(v) => v.iter().map(|&x| x as f64).collect(),
            SlotValues::Real(v) => v.clone(),
            SlotValues::Complex(v) => v.iter().map(|z| z.re).collect(),
        }
    }

    /// Complex view; reals get a zero imaginary part.
    pub fn to_complex(&self) -> Vec<Complex64> {
        match self {
            SlotValues::Complex(v) => v.clone(),
            _ => self.to_reals().into_iter().map(|x| Complex64::new(x, 0.0)).collect(),
        }
    }
}

/// Key material an operation may need.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum KeyKind {
    /// Secret key, needed to decrypt.
    Secret,
    /// Relinearization key.
    Relin,
    /// Galois key for a left rotation by the given (reduced) step.
    Rotation(i32),
    /// Galois key swapping the two BFV/BGV batching rows.
    RowSwap,
}

impl fmt::Display for KeyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyKind::Secret => f.write_str("secret"),
            KeyKind::Relin => f.write_str("relinearization"),
            KeyKind::Rotation(k) => write!(f, "rotation({})", k),
            KeyKind::RowSwap => f.write_str("row-swap"),
        }
    }
}

/// What the engine itself records about a handle.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct NativeInfo {
    /// Chain level.
    pub level: u32,
    /// CKKS scale.
    pub scale: Option<f64>,
    /// 0 for plaintexts.
    pub size: u32,
}

/// Narrow primitive interface of a BFV/BGV/CKKS engine bound to one parameter set.
///
/// Binary primitives mutate their first argument; a "new value" is obtained by
/// cloning the handle first. Primitives do not check scheme or encoding tags,
/// that is the dispatcher's job.
pub trait Engine {
    /// Native plaintext handle.
    type Plain: Clone + fmt::Debug;
    /// Native ciphertext handle.
    type Cipher: Clone + fmt::Debug;

    /// Scheme of the parameter set.
    fn scheme(&self) -> SchemeTag;
    /// Number of SIMD slots.
    fn slot_count(&self) -> usize;
    /// Number of data primes; valid levels are `0..chain_length()`.
    fn chain_length(&self) -> u32;
    /// Prime dropped when leaving `level`, `None` at the last level.
    fn chain_prime(&self, level: u32) -> Option<u64>;
    /// CKKS encoding scale; meaningless for BFV/BGV.
    fn default_scale(&self) -> f64;
    /// Plain modulus t, `None` for CKKS.
    fn plain_modulus(&self) -> Option<u64>;
    /// Whether key material for `key` was generated.
    fn has_key(&self, key: KeyKind) -> bool;

    /// Encode at level 0; `scale` is `Some` for CKKS only.
    fn encode(&self, values: &SlotValues, encoding: EncodingTag, scale: Option<f64>) -> Result<Self::Plain>;
    /// Decode every slot of the encoding's capacity.
    fn decode(&self, plain: &Self::Plain, encoding: EncodingTag) -> Result<SlotValues>;
    /// Encrypt with the public key; the result has size 2.
    fn encrypt(&self, plain: &Self::Plain) -> Result<Self::Cipher>;
    /// Decrypt with the secret key.
    fn decrypt(&self, cipher: &Self::Cipher) -> Result<Self::Plain>;

    /// `a += b`
    fn add(&self, a: &mut Self::Cipher, b: &Self::Cipher) -> Result<()>;
    /// `a -= b`
    fn sub(&self, a: &mut Self::Cipher, b: &Self::Cipher) -> Result<()>;
    /// `a *= b`, size grows to `a + b - 1`.
    fn mul(&self, a: &mut Self::Cipher, b: &Self::Cipher) -> Result<()>;
    /// `a += b` with a plaintext `b`.
    fn add_plain(&self, a: &mut Self::Cipher, b: &Self::Plain) -> Result<()>;
    /// `a -= b` with a plaintext `b`.
    fn sub_plain(&self, a: &mut Self::Cipher, b: &Self::Plain) -> Result<()>;
    /// `a *= b` with a plaintext `b`.
    fn mul_plain(&self, a: &mut Self::Cipher, b: &Self::Plain) -> Result<()>;
    /// `a = -a`
    fn negate(&self, a: &mut Self::Cipher) -> Result<()>;

    /// Back to size 2 with the relinearization key.
    fn relinearize(&self, a: &mut Self::Cipher) -> Result<()>;
    /// Left rotation by `steps`, already reduced into `1..period`.
    fn rotate(&self, a: &mut Self::Cipher, steps: i32) -> Result<()>;
    /// Swap the two BFV/BGV batching rows.
    fn swap_rows(&self, a: &mut Self::Cipher) -> Result<()>;
    /// Divide by the next chain prime and drop it.
    fn rescale_to_next(&self, a: &mut Self::Cipher) -> Result<()>;
    /// Drop the next chain prime, scale untouched.
    fn mod_switch_to_next(&self, a: &mut Self::Cipher) -> Result<()>;
    /// Plaintext counterpart of [`Engine::mod_switch_to_next`].
    fn mod_switch_plain_to_next(&self, p: &mut Self::Plain) -> Result<()>;
    /// Overwrite the recorded scale without touching the payload.
    fn override_scale(&self, a: &mut Self::Cipher, scale: f64) -> Result<()>;
    /// Plaintext counterpart of [`Engine::override_scale`].
    fn override_plain_scale(&self, p: &mut Self::Plain, scale: f64) -> Result<()>;

    /// All coefficients zero.
    fn plain_is_zero(&self, p: &Self::Plain) -> bool;
    /// Trivial encryption of zero.
    fn cipher_is_transparent(&self, c: &Self::Cipher) -> bool;
    /// Content equality of two plaintexts.
    fn plain_eq(&self, a: &Self::Plain, b: &Self::Plain) -> bool;
    /// The engine's record of a plaintext handle.
    fn plain_info(&self, p: &Self::Plain) -> NativeInfo;
    /// The engine's record of a ciphertext handle.
    fn cipher_info(&self, c: &Self::Cipher) -> NativeInfo;

    /// Native plaintext blob.
    fn serialize_plain(&self, p: &Self::Plain) -> Result<Vec<u8>>;
    /// Inverse of [`Engine::serialize_plain`].
    fn deserialize_plain(&self, bytes: &[u8]) -> Result<Self::Plain>;
    /// Native ciphertext blob.
    fn serialize_cipher(&self, c: &Self::Cipher) -> Result<Vec<u8>>;
    /// Inverse of [`Engine::serialize_cipher`].
    fn deserialize_cipher(&self, bytes: &[u8]) -> Result<Self::Cipher>;

    /// Period of a slot rotation: all slots for CKKS, one batching row otherwise.
    fn rotation_period(&self) -> usize {
        match self.scheme() {
            SchemeTag::Ckks => self.slot_count(),
            _ => self.slot_count() / 2,
        }
    }

    /// Number of values an encoding can hold.
    fn capacity(&self, encoding: EncodingTag) -> usize {
        match encoding {
            EncodingTag::Integer => 1,
            EncodingTag::Undefined => 0,
            _ => self.slot_count(),
        }
    }
}
