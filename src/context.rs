//! HE context: an engine plus the dispatch policy values consult.

use crate::cipher::Ciphertext;
use crate::engine::{Engine, KeyKind, SlotValues};
use crate::error::{HeError, Result};
use crate::plain::Plaintext;
use crate::scheme::{EncodingTag, SchemeTag};
use crate::state::SCALE_TOLERANCE;
use crate::value::{OpaqueValue, ValueMeta};
use num_complex::Complex64;
use tracing::debug;

/// How the dispatcher treats CKKS operands with different scales.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum AlignMode {
    /// Align level and scale; fail when the scales cannot be reconciled.
    #[default]
    Full,
    /// Align the level only and leave a scale mismatch to the caller.
    OnlyMod,
}

/// What `cumulative_add` does when some rotation keys are missing.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum CumulativeMode {
    /// Fail with `MissingKey` before any rotation runs.
    #[default]
    Strict,
    /// Skip the missing rotations and return a partial sum.
    AllowPartial,
}

/// Dispatch knobs shared by every value of a context.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Policy {
    /// Relative drift under which two CKKS scales count as equal.
    pub scale_tolerance: f64,
    /// Alignment of additive CKKS operands.
    pub align_mode: AlignMode,
    /// Behaviour of `cumulative_add` with missing rotation keys.
    pub cumulative_mode: CumulativeMode,
}

impl Default for Policy {
    fn default() -> Self {
        Self {
            scale_tolerance: SCALE_TOLERANCE,
            align_mode: AlignMode::Full,
            cumulative_mode: CumulativeMode::Strict,
        }
    }
}

/// Keys and default parameters shared read-only by every value created from it.
///
/// Values borrow the context, so it always outlives them.
pub struct Context<E: Engine> {
    engine: E,
    policy: Policy,
}

impl<E: Engine> Context<E> {
    /// Wrap `engine` with the default [`Policy`].
    pub fn new(engine: E) -> Self {
        Self { engine, policy: Policy::default() }
    }

    /// Replace the dispatch policy.
    pub fn with_policy(mut self, policy: Policy) -> Self {
        self.policy = policy;
        self
    }

    /// The underlying engine.
    pub fn engine(&self) -> &E {
        &self.engine
    }

    /// The dispatch policy.
    pub fn policy(&self) -> &Policy {
        &self.policy
    }

    /// Scheme of the engine's parameter set.
    pub fn scheme(&self) -> SchemeTag {
        self.engine.scheme()
    }

    /// Number of SIMD slots.
    pub fn slot_count(&self) -> usize {
        self.engine.slot_count()
    }

    /// Number of usable chain levels.
    pub fn chain_length(&self) -> u32 {
        self.engine.chain_length()
    }

    /// `None` outside CKKS.
    pub fn default_scale(&self) -> Option<f64> {
        match self.scheme() {
            SchemeTag::Ckks => Some(self.engine.default_scale()),
            _ => None,
        }
    }

    /// Whether the engine holds `key`.
    pub fn has_key(&self, key: KeyKind) -> bool {
        self.engine.has_key(key)
    }

    /// Encode `values` at the default scale (CKKS) under `encoding`.
    pub fn encode(&self, values: SlotValues, encoding: EncodingTag) -> Result<Plaintext<'_, E>> {
        self.encode_at(values, encoding, self.default_scale())
    }

    /// Encode CKKS values at an explicit scale.
    pub fn encode_with_scale(&self, values: SlotValues, encoding: EncodingTag, scale: f64) -> Result<Plaintext<'_, E>> {
        if self.scheme() != SchemeTag::Ckks {
            return Err(HeError::UnsupportedOperation {
                op: "encode_with_scale",
                operand: ValueMeta::new(self.scheme(), encoding, Default::default()).info(0),
                reason: "only CKKS values carry a scale".into(),
            });
        }
        self.encode_at(values, encoding, Some(scale))
    }

    pub(crate) fn encode_at(&self, values: SlotValues, encoding: EncodingTag, scale: Option<f64>) -> Result<Plaintext<'_, E>> {
        let scheme = self.scheme();
        if !scheme.allows(encoding) || encoding == EncodingTag::Undefined {
            return Err(HeError::UnsupportedOperation {
                op: "encode",
                operand: ValueMeta::new(scheme, encoding, Default::default()).info(0),
                reason: format!("{} cannot carry {} values", scheme, encoding),
            });
        }
        let capacity = self.engine.capacity(encoding);
        if values.len() > capacity {
            return Err(HeError::CapacityExceeded { len: values.len(), capacity });
        }
        if let Some(s) = scale {
            if !(s.is_finite() && s > 0.0) {
                return Err(HeError::InvalidScale(s));
            }
        }
        debug!(%scheme, %encoding, len = values.len(), "encode");
        let handle = self.engine.encode(&values, encoding, scale)?;
        let meta = ValueMeta::from_native(scheme, encoding, self.engine.plain_info(&handle))?;
        Ok(Plaintext::from_parts(self, meta, handle))
    }

    /// Encode at `scale` and mod-switch down to `level`.
    pub(crate) fn encode_at_level(
        &self,
        values: SlotValues,
        encoding: EncodingTag,
        scale: Option<f64>,
        level: u32,
    ) -> Result<Plaintext<'_, E>> {
        let mut plain = self.encode_at(values, encoding, scale)?;
        for _ in 0..level {
            plain.mod_switch_to_next()?;
        }
        Ok(plain)
    }

    /// Encode one integer (BFV/BGV).
    pub fn encode_int(&self, value: i64) -> Result<Plaintext<'_, E>> {
        self.encode(SlotValues::Int(vec![value]), EncodingTag::Integer)
    }

    /// Encode an integer slot vector (BFV/BGV).
    pub fn encode_batch(&self, values: &[i64]) -> Result<Plaintext<'_, E>> {
        self.encode(SlotValues::Int(values.to_vec()), EncodingTag::Batched)
    }

    /// Encode a real slot vector (CKKS).
    pub fn encode_frac(&self, values: &[f64]) -> Result<Plaintext<'_, E>> {
        self.encode(SlotValues::Real(values.to_vec()), EncodingTag::Fractional)
    }

    /// Encode a complex slot vector (CKKS).
    pub fn encode_complex(&self, values: &[Complex64]) -> Result<Plaintext<'_, E>> {
        self.encode(SlotValues::Complex(values.to_vec()), EncodingTag::Complex)
    }

    /// Encrypt a plaintext of this context's scheme; the result has size 2.
    pub fn encrypt(&self, plain: &Plaintext<'_, E>) -> Result<Ciphertext<'_, E>> {
        let handle = plain.handle().ok_or(HeError::EmptyValue { op: "encrypt" })?;
        if plain.scheme() != self.scheme() {
            return Err(HeError::SchemeMismatch {
                lhs: ValueMeta::new(self.scheme(), plain.encoding(), plain.state()).info(0),
                rhs: plain.info(),
            });
        }
        self.check_level("encrypt", plain)?;
        let cipher = self.engine.encrypt(handle)?;
        let size = self.engine.cipher_info(&cipher).size;
        Ok(Ciphertext::from_parts(self, *plain.meta(), size, cipher))
    }

    /// Encode and encrypt one integer.
    pub fn encrypt_int(&self, value: i64) -> Result<Ciphertext<'_, E>> {
        self.encrypt(&self.encode_int(value)?)
    }

    /// Encode and encrypt an integer slot vector.
    pub fn encrypt_batch(&self, values: &[i64]) -> Result<Ciphertext<'_, E>> {
        self.encrypt(&self.encode_batch(values)?)
    }

    /// Encode and encrypt reals at the default scale.
    pub fn encrypt_frac(&self, values: &[f64]) -> Result<Ciphertext<'_, E>> {
        self.encrypt(&self.encode_frac(values)?)
    }

    /// Encode and encrypt reals at `scale`.
    pub fn encrypt_frac_with_scale(&self, values: &[f64], scale: f64) -> Result<Ciphertext<'_, E>> {
        let plain = self.encode_with_scale(SlotValues::Real(values.to_vec()), EncodingTag::Fractional, scale)?;
        self.encrypt(&plain)
    }

    /// Encode and encrypt complex values at the default scale.
    pub fn encrypt_complex(&self, values: &[Complex64]) -> Result<Ciphertext<'_, E>> {
        self.encrypt(&self.encode_complex(values)?)
    }

    /// Read-only: the ciphertext is left untouched.
    pub fn decrypt(&self, cipher: &Ciphertext<'_, E>) -> Result<Plaintext<'_, E>> {
        let handle = cipher.handle().ok_or(HeError::EmptyValue { op: "decrypt" })?;
        if !self.has_key(KeyKind::Secret) {
            return Err(HeError::MissingKey { key: KeyKind::Secret, op: "decrypt" });
        }
        self.check_level("decrypt", cipher)?;
        let plain = self.engine.decrypt(handle)?;
        Ok(Plaintext::from_parts(self, *cipher.meta(), plain))
    }

    /// Decrypt and decode one integer.
    pub fn decrypt_int(&self, cipher: &Ciphertext<'_, E>) -> Result<i64> {
        self.decrypt(cipher)?.decode_int()
    }

    /// Decrypt and decode an integer slot vector.
    pub fn decrypt_batch(&self, cipher: &Ciphertext<'_, E>) -> Result<Vec<i64>> {
        self.decrypt(cipher)?.decode_batch()
    }

    /// Decrypt and decode reals.
    pub fn decrypt_frac(&self, cipher: &Ciphertext<'_, E>) -> Result<Vec<f64>> {
        self.decrypt(cipher)?.decode_frac()
    }

    /// Decrypt and decode complex values.
    pub fn decrypt_complex(&self, cipher: &Ciphertext<'_, E>) -> Result<Vec<Complex64>> {
        self.decrypt(cipher)?.decode_complex()
    }

    pub(crate) fn check_level(&self, op: &'static str, value: &impl OpaqueValue) -> Result<()> {
        if value.chain_level() >= self.chain_length() {
            return Err(HeError::ChainExhausted {
                operand: value.info(),
                chain_length: self.chain_length(),
            });
        }
        debug!(op, level = value.chain_level(), "level ok");
        Ok(())
    }
}
