//! Ciphertext container.

use crate::context::Context;
use crate::engine::Engine;
use crate::error::{HeError, Result};
use crate::scheme::{EncodingTag, SchemeTag};
use crate::value::{OpaqueValue, ValueMeta};
use std::fmt;

/// (tags, numeric state, size, native ciphertext)
///
/// Deliberately not `PartialEq`: two encryptions of the same message differ.
pub struct Ciphertext<'ctx, E: Engine> {
    pub(crate) meta: ValueMeta,
    pub(crate) size: u32,
    pub(crate) handle: Option<E::Cipher>,
    pub(crate) ctx: Option<&'ctx Context<E>>,
}

impl<'ctx, E: Engine> Ciphertext<'ctx, E> {
    /// Empty, detached ciphertext.
    pub fn empty() -> Self {
        Self { meta: ValueMeta::default(), size: 0, handle: None, ctx: None }
    }

    pub(crate) fn from_parts(ctx: &'ctx Context<E>, meta: ValueMeta, size: u32, handle: E::Cipher) -> Self {
        Self { meta, size, handle: Some(handle), ctx: Some(ctx) }
    }

    /// Bind an empty ciphertext to `ctx`; it adopts the context's scheme.
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
    pub fn handle(&self) -> Option<&E::Cipher> {
        self.handle.as_ref()
    }

    /// Ciphertexts cannot be compared by content.
    pub fn content_eq(&self, _other: &Self) -> Result<bool> {
        Err(HeError::unsupported(
            "content_eq",
            self.info(),
            "ciphertext equality is undefined, decrypt and compare plaintexts",
        ))
    }

    /// Context of a non-empty, attached ciphertext.
    pub(crate) fn require(&self, op: &'static str) -> Result<&'ctx Context<E>> {
        if self.handle.is_none() {
            return Err(HeError::EmptyValue { op });
        }
        self.ctx.ok_or(HeError::DetachedValue { op })
    }

    pub(crate) fn handle_ref(&self, op: &'static str) -> Result<&E::Cipher> {
        self.handle.as_ref().ok_or(HeError::EmptyValue { op })
    }

    pub(crate) fn handle_mut(&mut self, op: &'static str) -> Result<&mut E::Cipher> {
        self.handle.as_mut().ok_or(HeError::EmptyValue { op })
    }

    /// Replace the recorded scale; the metadata follows only once the engine accepted it.
    pub(crate) fn override_scale(&mut self, scale: f64) -> Result<()> {
        let ctx = self.require("override_scale")?;
        let mut state = self.meta.state();
        state.set_scale(scale)?;
        ctx.engine().override_scale(self.handle_mut("override_scale")?, scale)?;
        *self.meta.state_mut() = state;
        Ok(())
    }

    /// Debug check that the tracked metadata agrees with the engine's view.
    pub(crate) fn debug_check_native(&self) {
        if cfg!(debug_assertions) {
            if let (Some(ctx), Some(h)) = (self.ctx, self.handle.as_ref()) {
                let native = ctx.engine().cipher_info(h);
                debug_assert_eq!(native.level, self.chain_level(), "level drift on {}", self.info());
                debug_assert_eq!(native.size, self.size, "size drift on {}", self.info());
                if let (Some(a), Some(b)) = (native.scale, self.scale()) {
                    debug_assert!(
                        crate::state::scales_close(a, b, 1e-9),
                        "scale drift on {}",
                        self.info()
                    );
                }
            }
        }
    }
}

impl<E: Engine> OpaqueValue for Ciphertext<'_, E> {
    fn meta(&self) -> &ValueMeta {
        &self.meta
    }

    fn size(&self) -> u32 {
        self.size
    }

    fn is_empty(&self) -> bool {
        self.handle.is_none()
    }

    /// Transparency test: `true` when the ciphertext trivially encrypts zero.
    fn is_zero(&self) -> Result<bool> {
        let ctx = self.require("is_zero")?;
        Ok(ctx.engine().cipher_is_transparent(self.handle_ref("is_zero")?))
    }

    fn set_scheme(&mut self, scheme: SchemeTag) -> Result<()> {
        self.meta.set_scheme(scheme, self.handle.is_some(), self.size)
    }

    fn set_encoding(&mut self, encoding: EncodingTag) -> Result<()> {
        self.meta.set_encoding(encoding, self.handle.is_some(), self.size)
    }

    fn reset(&mut self) {
        self.handle = None;
        self.size = 0;
        self.meta = ValueMeta::default();
    }
}

impl<E: Engine> Default for Ciphertext<'_, E> {
    fn default() -> Self {
        Self::empty()
    }
}

impl<E: Engine> Clone for Ciphertext<'_, E> {
    fn clone(&self) -> Self {
        Self { meta: self.meta, size: self.size, handle: self.handle.clone(), ctx: self.ctx }
    }
}

impl<E: Engine> fmt::Debug for Ciphertext<'_, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Ciphertext")
            .field("meta", &self.meta)
            .field("size", &self.size)
            .field("handle", &self.handle)
            .field("attached", &self.ctx.is_some())
            .finish()
    }
}
