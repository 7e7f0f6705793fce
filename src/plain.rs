//! Plaintext container.

use crate::context::Context;
use crate::engine::{Engine, SlotValues};
use crate::error::{HeError, Result};
use crate::scheme::{EncodingTag, SchemeTag};
use crate::value::{OpaqueValue, ValueMeta};
use num_complex::Complex64;
use std::fmt;

/// (tags, numeric state, native plaintext)
pub struct Plaintext<'ctx, E: Engine> {
    pub(crate) meta: ValueMeta,
    pub(crate) handle: Option<E::Plain>,
    pub(crate) ctx: Option<&'ctx Context<E>>,
}

impl<'ctx, E: Engine> Plaintext<'ctx, E> {
    /// Empty, detached plaintext.
    pub fn empty() -> Self {
        Self { meta: ValueMeta::default(), handle: None, ctx: None }
    }

    pub(crate) fn from_parts(ctx: &'ctx Context<E>, meta: ValueMeta, handle: E::Plain) -> Self {
        Self { meta, handle: Some(handle), ctx: Some(ctx) }
    }

    /// Bind an empty plaintext to `ctx`; it adopts the context's scheme.
    pub fn attach(&mut self, ctx: &'ctx Context<E>) -> Result<()> {
        if self.handle.is_some() {
            return Err(HeError::IllegalStateTransition {
                operand: self.info(),
                reason: "cannot re-attach a value that holds a handle",
            });
        }
        self.meta.set_scheme(ctx.scheme(), false, 0)?;
        self.ctx = Some(ctx);
        Ok(())
    }

    /// Context the value is bound to.
    pub fn context(&self) -> Option<&'ctx Context<E>> {
        self.ctx
    }

    /// Native handle, `None` while empty.
    pub fn handle(&self) -> Option<&E::Plain> {
        self.handle.as_ref()
    }

    pub(crate) fn require(&self, op: &'static str) -> Result<&'ctx Context<E>> {
        if self.handle.is_none() {
            return Err(HeError::EmptyValue { op });
        }
        self.ctx.ok_or(HeError::DetachedValue { op })
    }

    pub(crate) fn handle_mut(&mut self, op: &'static str) -> Result<&mut E::Plain> {
        self.handle.as_mut().ok_or(HeError::EmptyValue { op })
    }

    /// Decode as `encoding`; it must be the encoding the value was produced with.
    pub fn decode(&self, encoding: EncodingTag) -> Result<SlotValues> {
        let ctx = self.require("decode")?;
        if encoding != self.encoding() {
            return Err(HeError::UnsupportedDecode { requested: encoding, operand: self.info() });
        }
        ctx.check_level("decode", self)?;
        let handle = self.handle_ref("decode")?;
        ctx.engine().decode(handle, encoding)
    }

    /// Decode an `Integer` plaintext.
    pub fn decode_int(&self) -> Result<i64> {
        match self.decode(EncodingTag::Integer)? {
            SlotValues::Int(v) => Ok(v.first().copied().unwrap_or(0)),
            other => Ok(other.to_reals().first().map_or(0, |x| x.round() as i64)),
        }
    }

    /// Decode a `Batched` plaintext.
    pub fn decode_batch(&self) -> Result<Vec<i64>> {
        match self.decode(EncodingTag::Batched)? {
            SlotValues::Int(v) => Ok(v),
            other => Ok(other.to_reals().into_iter().map(|x| x.round() as i64).collect()),
        }
    }

    /// Decode a `Fractional` plaintext.
    pub fn decode_frac(&self) -> Result<Vec<f64>> {
        Ok(self.decode(EncodingTag::Fractional)?.to_reals())
    }

    /// Decode a `Complex` plaintext.
    pub fn decode_complex(&self) -> Result<Vec<Complex64>> {
        Ok(self.decode(EncodingTag::Complex)?.to_complex())
    }

    /// Drop one prime from the plaintext's modulus.
    pub fn mod_switch_to_next(&mut self) -> Result<()> {
        let ctx = self.require("mod_switch_to_next")?;
        if self.chain_level() + 1 >= ctx.chain_length() {
            return Err(HeError::ChainExhausted { operand: self.info(), chain_length: ctx.chain_length() });
        }
        ctx.engine().mod_switch_plain_to_next(self.handle_mut("mod_switch_to_next")?)?;
        self.meta.state_mut().bump_level();
        Ok(())
    }

    /// Encode the same cleartext again at `scale`, keeping the level.
    pub(crate) fn reencode(&mut self, scale: f64) -> Result<()> {
        let ctx = self.require("reencode")?;
        let values = self.decode(self.encoding())?;
        *self = ctx.encode_at_level(values, self.encoding(), Some(scale), self.chain_level())?;
        Ok(())
    }

    /// Replace the recorded scale; the metadata follows only once the engine accepted it.
    pub(crate) fn override_scale(&mut self, scale: f64) -> Result<()> {
        let ctx = self.require("override_scale")?;
        let mut state = self.meta.state();
        state.set_scale(scale)?;
        ctx.engine().override_plain_scale(self.handle_mut("override_scale")?, scale)?;
        *self.meta.state_mut() = state;
        Ok(())
    }

    fn handle_ref(&self, op: &'static str) -> Result<&E::Plain> {
        self.handle.as_ref().ok_or(HeError::EmptyValue { op })
    }
}

impl<E: Engine> OpaqueValue for Plaintext<'_, E> {
    fn meta(&self) -> &ValueMeta {
        &self.meta
    }

    fn size(&self) -> u32 {
        0
    }

    fn is_empty(&self) -> bool {
        self.handle.is_none()
    }

    fn is_zero(&self) -> Result<bool> {
        let ctx = self.require("is_zero")?;
        Ok(ctx.engine().plain_is_zero(self.handle_ref("is_zero")?))
    }

    fn set_scheme(&mut self, scheme: SchemeTag) -> Result<()> {
        self.meta.set_scheme(scheme, self.handle.is_some(), 0)
    }

    fn set_encoding(&mut self, encoding: EncodingTag) -> Result<()> {
        self.meta.set_encoding(encoding, self.handle.is_some(), 0)
    }

    fn reset(&mut self) {
        self.handle = None;
        self.meta = ValueMeta::default();
    }
}

impl<E: Engine> Default for Plaintext<'_, E> {
    fn default() -> Self {
        Self::empty()
    }
}

impl<E: Engine> Clone for Plaintext<'_, E> {
    fn clone(&self) -> Self {
        Self { meta: self.meta, handle: self.handle.clone(), ctx: self.ctx }
    }
}

impl<E: Engine> fmt::Debug for Plaintext<'_, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Plaintext")
            .field("meta", &self.meta)
            .field("handle", &self.handle)
            .field("attached", &self.ctx.is_some())
            .finish()
    }
}

/// Tags and native content must agree.
impl<E: Engine> PartialEq for Plaintext<'_, E> {
    fn eq(&self, other: &Self) -> bool {
        if self.meta != other.meta {
            return false;
        }
        match (&self.handle, &other.handle, self.ctx.or(other.ctx)) {
            (None, None, _) => true,
            (Some(a), Some(b), Some(ctx)) => ctx.engine().plain_eq(a, b),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::ContextParams;
    use crate::sim::SimEngine;

    fn bfv_ctx() -> Context<SimEngine> {
        Context::new(SimEngine::new(ContextParams::bfv(16, 65537, vec![40, 40, 40])).unwrap())
    }

    fn ckks_ctx() -> Context<SimEngine> {
        Context::new(SimEngine::new(ContextParams::ckks(16, 2f64.powi(30), vec![60, 30, 30, 60])).unwrap())
    }

    #[test]
    fn test_decode_requires_matching_encoding() {
        let ctx = bfv_ctx();
        let p = ctx.encode_int(-7).unwrap();
        assert_eq!(p.decode_int().unwrap(), -7);
        let err = p.decode_batch().unwrap_err();
        assert!(matches!(err, HeError::UnsupportedDecode { requested: EncodingTag::Batched, .. }));
    }

    #[test]
    fn test_empty_plaintext() {
        let p: Plaintext<'_, SimEngine> = Plaintext::empty();
        assert!(p.is_empty());
        assert_eq!(p.size(), 0);
        assert_eq!(p.scheme(), SchemeTag::None);
        assert!(matches!(p.is_zero(), Err(HeError::EmptyValue { .. })));
        assert!(matches!(p.decode_int(), Err(HeError::EmptyValue { .. })));
    }

    #[test]
    fn test_attach_adopts_scheme() {
        let ctx = ckks_ctx();
        let mut p = Plaintext::empty();
        p.attach(&ctx).unwrap();
        assert_eq!(p.scheme(), SchemeTag::Ckks);
        assert!(p.set_encoding(EncodingTag::Batched).is_err());
        p.set_encoding(EncodingTag::Fractional).unwrap();
        assert!(p.is_empty());
    }

    #[test]
    fn test_tags_frozen_after_encode() {
        let ctx = bfv_ctx();
        let mut p = ctx.encode_batch(&[1, 2, 3]).unwrap();
        assert!(matches!(
            p.set_scheme(SchemeTag::Bgv),
            Err(HeError::IllegalStateTransition { .. })
        ));
        assert!(p.set_encoding(EncodingTag::Integer).is_err());
        p.reset();
        assert!(p.is_empty());
        assert_eq!(p.encoding(), EncodingTag::Undefined);
        p.set_scheme(SchemeTag::Bgv).unwrap();
    }

    #[test]
    fn test_equality_is_deep() {
        let ctx = bfv_ctx();
        let a = ctx.encode_batch(&[1, 2, 3]).unwrap();
        let b = ctx.encode_batch(&[1, 2, 3]).unwrap();
        let c = ctx.encode_batch(&[1, 2, 4]).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_ne!(a, ctx.encode_int(1).unwrap());
    }

    #[test]
    fn test_zero_test() {
        let ctx = bfv_ctx();
        assert!(ctx.encode_batch(&[0, 0]).unwrap().is_zero().unwrap());
        assert!(!ctx.encode_batch(&[0, 1]).unwrap().is_zero().unwrap());
    }

    #[test]
    fn test_mod_switch_stops_at_last_level() {
        let ctx = ckks_ctx();
        let mut p = ctx.encode_frac(&[0.25]).unwrap();
        p.mod_switch_to_next().unwrap();
        p.mod_switch_to_next().unwrap();
        assert_eq!(p.chain_level(), 2);
        assert!(matches!(p.mod_switch_to_next(), Err(HeError::ChainExhausted { .. })));
        assert!((p.decode_frac().unwrap()[0] - 0.25).abs() < 1e-6);
    }

    #[test]
    fn test_reencode_keeps_level_and_value() {
        let ctx = ckks_ctx();
        let mut p = ctx.encode_frac(&[1.5, -2.0]).unwrap();
        p.mod_switch_to_next().unwrap();
        p.reencode(2f64.powi(25)).unwrap();
        assert_eq!(p.chain_level(), 1);
        assert_eq!(p.scale(), Some(2f64.powi(25)));
        let v = p.decode_frac().unwrap();
        assert!((v[0] - 1.5).abs() < 1e-6 && (v[1] + 2.0).abs() < 1e-6);
    }

    #[test]
    fn test_rejected_scale_override_keeps_metadata() {
        let ctx = bfv_ctx();
        let mut p = ctx.encode_batch(&[4, 5]).unwrap();
        let before = p.info();
        assert!(matches!(p.override_scale(8.0), Err(HeError::Engine { .. })));
        assert_eq!(p.info(), before);
        assert_eq!(p.scale(), None);
    }
}
