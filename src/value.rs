//! Metadata shared by plaintexts and ciphertexts.

use crate::engine::NativeInfo;
use crate::error::{HeError, OperandInfo, Result};
use crate::scheme::{EncodingTag, SchemeTag};
use crate::state::NumericState;

/// Scheme, encoding and numeric state of one value.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct ValueMeta {
    scheme: SchemeTag,
    encoding: EncodingTag,
    state: NumericState,
}

impl ValueMeta {
    pub(crate) fn new(scheme: SchemeTag, encoding: EncodingTag, state: NumericState) -> Self {
        Self { scheme, encoding, state }
    }

    /// Metadata for a handle the engine just produced.
    pub(crate) fn from_native(scheme: SchemeTag, encoding: EncodingTag, info: NativeInfo) -> Result<Self> {
        let state = match (scheme, info.scale) {
            (SchemeTag::Ckks, Some(s)) => NumericState::ckks(info.level, s)?,
            (SchemeTag::Ckks, None) => return Err(HeError::InvalidScale(0.0)),
            _ => NumericState::integer(info.level),
        };
        Ok(Self::new(scheme, encoding, state))
    }

    /// Scheme tag.
    pub fn scheme(&self) -> SchemeTag {
        self.scheme
    }

    /// Encoding tag.
    pub fn encoding(&self) -> EncodingTag {
        self.encoding
    }

    /// Level and scale.
    pub fn state(&self) -> NumericState {
        self.state
    }

    pub(crate) fn state_mut(&mut self) -> &mut NumericState {
        &mut self.state
    }

    pub(crate) fn set_encoding_unchecked(&mut self, encoding: EncodingTag) {
        self.encoding = encoding;
    }

    pub(crate) fn info(&self, size: u32) -> OperandInfo {
        OperandInfo {
            scheme: self.scheme,
            encoding: self.encoding,
            state: self.state,
            size,
        }
    }

    pub(crate) fn set_scheme(&mut self, scheme: SchemeTag, occupied: bool, size: u32) -> Result<()> {
        if occupied {
            return Err(HeError::IllegalStateTransition {
                operand: self.info(size),
                reason: "scheme is fixed once the value holds a handle",
            });
        }
        if self.encoding != EncodingTag::Undefined && !scheme.allows(self.encoding) {
            return Err(HeError::IllegalStateTransition {
                operand: self.info(size),
                reason: "encoding is not legal under the requested scheme",
            });
        }
        self.scheme = scheme;
        Ok(())
    }

    pub(crate) fn set_encoding(&mut self, encoding: EncodingTag, occupied: bool, size: u32) -> Result<()> {
        if occupied {
            return Err(HeError::IllegalStateTransition {
                operand: self.info(size),
                reason: "encoding is fixed once the value holds a handle",
            });
        }
        if self.scheme != SchemeTag::None && encoding != EncodingTag::Undefined && !self.scheme.allows(encoding) {
            return Err(HeError::IllegalStateTransition {
                operand: self.info(size),
                reason: "encoding is not legal under the value's scheme",
            });
        }
        self.encoding = encoding;
        Ok(())
    }
}

/// Read surface common to [`crate::Plaintext`] and [`crate::Ciphertext`].
pub trait OpaqueValue {
    /// Tags and numeric state.
    fn meta(&self) -> &ValueMeta;

    /// Polynomial count: 0 for plaintexts, at least 2 for ciphertexts.
    fn size(&self) -> u32;

    /// No native handle.
    fn is_empty(&self) -> bool;

    /// Native zero test; fails on an empty value.
    fn is_zero(&self) -> Result<bool>;

    /// Fix the scheme of an empty value.
    fn set_scheme(&mut self, scheme: SchemeTag) -> Result<()>;

    /// Fix the encoding of an empty value.
    fn set_encoding(&mut self, encoding: EncodingTag) -> Result<()>;

    /// Release the handle and clear every tag, leaving an empty value.
    fn reset(&mut self);

    /// Scheme tag.
    fn scheme(&self) -> SchemeTag {
        self.meta().scheme()
    }

    /// Encoding tag.
    fn encoding(&self) -> EncodingTag {
        self.meta().encoding()
    }

    /// Level and scale.
    fn state(&self) -> NumericState {
        self.meta().state()
    }

    /// Primes dropped so far.
    fn chain_level(&self) -> u32 {
        self.state().chain_level()
    }

    /// `None` outside CKKS.
    fn scale(&self) -> Option<f64> {
        self.state().scale()
    }

    /// Snapshot for diagnostics.
    fn info(&self) -> OperandInfo {
        self.meta().info(self.size())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_scheme_only_while_empty() {
        let mut meta = ValueMeta::default();
        meta.set_scheme(SchemeTag::Bfv, false, 0).unwrap();
        assert_eq!(meta.scheme(), SchemeTag::Bfv);
        let err = meta.set_scheme(SchemeTag::Ckks, true, 2).unwrap_err();
        assert!(matches!(err, HeError::IllegalStateTransition { .. }));
        assert_eq!(meta.scheme(), SchemeTag::Bfv);
    }

    #[test]
    fn test_set_encoding_respects_scheme() {
        let mut meta = ValueMeta::default();
        meta.set_scheme(SchemeTag::Ckks, false, 0).unwrap();
        assert!(meta.set_encoding(EncodingTag::Batched, false, 0).is_err());
        meta.set_encoding(EncodingTag::Complex, false, 0).unwrap();
        assert!(meta.set_scheme(SchemeTag::Bgv, false, 0).is_err());
    }

    #[test]
    fn test_from_native_requires_ckks_scale() {
        let info = NativeInfo { level: 1, scale: Some(8.0), size: 2 };
        let meta = ValueMeta::from_native(SchemeTag::Ckks, EncodingTag::Fractional, info).unwrap();
        assert_eq!(meta.state().chain_level(), 1);
        assert_eq!(meta.state().scale(), Some(8.0));

        let bare = NativeInfo { level: 0, scale: None, size: 2 };
        assert!(ValueMeta::from_native(SchemeTag::Ckks, EncodingTag::Fractional, bare).is_err());
        let int = ValueMeta::from_native(SchemeTag::Bfv, EncodingTag::Integer, bare).unwrap();
        assert!(int.state().scale().is_none());
    }
}
