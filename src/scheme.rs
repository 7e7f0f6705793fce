//! Scheme and encoding tags carried by every plaintext and ciphertext.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Cryptographic scheme a value belongs to.
///
/// `None` is only legal for empty values; it is never a valid operand scheme.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SchemeTag {
    /// No scheme yet.
    #[default]
    None,
    /// Brakerski/Fan-Vercauteren, exact integers modulo t.
    Bfv,
    /// Brakerski-Gentry-Vaikuntanathan, exact integers modulo t.
    Bgv,
    /// Cheon-Kim-Kim-Song, approximate fixed-point arithmetic.
    Ckks,
}

impl SchemeTag {
    /// Anything but `None`.
    pub fn is_defined(self) -> bool {
        self != SchemeTag::None
    }

    /// BFV and BGV work over integers modulo the plain modulus.
    pub fn is_integer(self) -> bool {
        matches!(self, SchemeTag::Bfv | SchemeTag::Bgv)
    }

    /// Whether `encoding` is a legal payload encoding under this scheme.
    pub fn allows(self, encoding: EncodingTag) -> bool {
        match self {
            SchemeTag::None => encoding == EncodingTag::Undefined,
            SchemeTag::Bfv | SchemeTag::Bgv => {
                matches!(encoding, EncodingTag::Integer | EncodingTag::Batched)
            }
            SchemeTag::Ckks => {
                matches!(encoding, EncodingTag::Fractional | EncodingTag::Complex)
            }
        }
    }

    /// Stable one-byte code used in the persisted header.
    pub fn to_byte(self) -> u8 {
        match self {
            SchemeTag::None => 0x0,
            SchemeTag::Bfv => 0x1,
            SchemeTag::Ckks => 0x2,
            SchemeTag::Bgv => 0x3,
        }
    }

    /// Inverse of [`SchemeTag::to_byte`].
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            0x0 => Some(SchemeTag::None),
            0x1 => Some(SchemeTag::Bfv),
            0x2 => Some(SchemeTag::Ckks),
            0x3 => Some(SchemeTag::Bgv),
            _ => None,
        }
    }
}

impl fmt::Display for SchemeTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SchemeTag::None => "none",
            SchemeTag::Bfv => "BFV",
            SchemeTag::Bgv => "BGV",
            SchemeTag::Ckks => "CKKS",
        };
        f.write_str(name)
    }
}

/// How plaintext values are packed into an algebraic plaintext.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EncodingTag {
    /// No encoding yet.
    #[default]
    Undefined,
    /// A single integer (BFV/BGV).
    Integer,
    /// A vector of reals (CKKS).
    Fractional,
    /// A vector of complex numbers (CKKS).
    Complex,
    /// A SIMD slot vector of integers (BFV/BGV).
    Batched,
}

impl EncodingTag {
    /// Set-membership compatibility rule used before any binary operation.
    ///
    /// Equal encodings combine to themselves; Fractional and Complex share the
    /// CKKS canonical embedding and combine to Complex. Everything else is
    /// incompatible.
    pub fn combine(self, other: EncodingTag) -> Option<EncodingTag> {
        use EncodingTag::*;
        match (self, other) {
            (Undefined, _) | (_, Undefined) => None,
            (a, b) if a == b => Some(a),
            (Fractional, Complex) | (Complex, Fractional) => Some(Complex),
            _ => None,
        }
    }

    /// Encodings laid out as slot vectors support rotations.
    pub fn is_vector(self) -> bool {
        matches!(
            self,
            EncodingTag::Fractional | EncodingTag::Complex | EncodingTag::Batched
        )
    }

    /// Stable one-byte code used in the persisted header.
    pub fn to_byte(self) -> u8 {
        match self {
            EncodingTag::Undefined => 0,
            EncodingTag::Integer => 1,
            EncodingTag::Fractional => 2,
            EncodingTag::Complex => 3,
            EncodingTag::Batched => 4,
        }
    }

    /// Inverse of [`EncodingTag::to_byte`].
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            0 => Some(EncodingTag::Undefined),
            1 => Some(EncodingTag::Integer),
            2 => Some(EncodingTag::Fractional),
            3 => Some(EncodingTag::Complex),
            4 => Some(EncodingTag::Batched),
            _ => None,
        }
    }
}

impl fmt::Display for EncodingTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EncodingTag::Undefined => "undefined",
            EncodingTag::Integer => "integer",
            EncodingTag::Fractional => "fractional",
            EncodingTag::Complex => "complex",
            EncodingTag::Batched => "batched",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_undefined() {
        assert_eq!(SchemeTag::default(), SchemeTag::None);
        assert_eq!(EncodingTag::default(), EncodingTag::Undefined);
        assert!(!SchemeTag::None.is_defined());
    }

    #[test]
    fn test_scheme_encoding_legality() {
        assert!(SchemeTag::Bfv.allows(EncodingTag::Batched));
        assert!(SchemeTag::Bgv.allows(EncodingTag::Integer));
        assert!(!SchemeTag::Bfv.allows(EncodingTag::Fractional));
        assert!(SchemeTag::Ckks.allows(EncodingTag::Complex));
        assert!(!SchemeTag::Ckks.allows(EncodingTag::Batched));
        assert!(SchemeTag::None.allows(EncodingTag::Undefined));
    }

    #[test]
    fn test_encoding_combine() {
        use EncodingTag::*;
        assert_eq!(Batched.combine(Batched), Some(Batched));
        assert_eq!(Fractional.combine(Complex), Some(Complex));
        assert_eq!(Integer.combine(Batched), None);
        assert_eq!(Undefined.combine(Undefined), None);
    }

    #[test]
    fn test_byte_codes_are_stable() {
        for s in [SchemeTag::None, SchemeTag::Bfv, SchemeTag::Bgv, SchemeTag::Ckks] {
            assert_eq!(SchemeTag::from_byte(s.to_byte()), Some(s));
        }
        assert_eq!(SchemeTag::Ckks.to_byte(), 0x2);
        assert_eq!(EncodingTag::from_byte(9), None);
    }

    #[test]
    fn test_serde_names() {
        let s: SchemeTag = serde_json::from_str("\"ckks\"").unwrap();
        assert_eq!(s, SchemeTag::Ckks);
        assert_eq!(serde_json::to_string(&EncodingTag::Batched).unwrap(), "\"batched\"");
    }
}
