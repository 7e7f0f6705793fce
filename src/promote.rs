//! Operand promotion: turning whatever sits on the right of an operator into
//! a plaintext or ciphertext that matches the left-hand side.
//!
//! Values that already match are passed through borrowed, so promoting a
//! promoted operand again allocates nothing.

use crate::cipher::Ciphertext;
use crate::context::Context;
use crate::engine::{Engine, SlotValues};
use crate::error::{HeError, OperandInfo, Result};
use crate::plain::Plaintext;
use crate::scheme::{EncodingTag, SchemeTag};
use crate::state::NumericState;
use crate::value::OpaqueValue;
use std::borrow::Cow;
use std::fmt;
use tracing::debug;

/// Right-hand side of a dispatched operation.
pub enum Operand<'o, 'ctx, E: Engine> {
    /// Borrowed ciphertext.
    Cipher(&'o Ciphertext<'ctx, E>),
    /// Borrowed plaintext.
    Plain(&'o Plaintext<'ctx, E>),
    /// Broadcast to every slot.
    Scalar(f64),
    /// Integer broadcast to every slot.
    Int(i64),
    /// Zero-padded to the slot capacity.
    Array(Cow<'o, [f64]>),
    /// Integer array, zero-padded to the slot capacity.
    IntArray(Cow<'o, [i64]>),
}

impl<'o, 'ctx, E: Engine> From<&'o Ciphertext<'ctx, E>> for Operand<'o, 'ctx, E> {
    fn from(c: &'o Ciphertext<'ctx, E>) -> Self {
        Operand::Cipher(c)
    }
}

impl<'o, 'ctx, E: Engine> From<&'o Plaintext<'ctx, E>> for Operand<'o, 'ctx, E> {
    fn from(p: &'o Plaintext<'ctx, E>) -> Self {
        Operand::Plain(p)
    }
}

impl<E: Engine> From<f64> for Operand<'_, '_, E> {
    fn from(x: f64) -> Self {
        Operand::Scalar(x)
    }
}

impl<E: Engine> From<i64> for Operand<'_, '_, E> {
    fn from(x: i64) -> Self {
        Operand::Int(x)
    }
}

impl<E: Engine> From<i32> for Operand<'_, '_, E> {
    fn from(x: i32) -> Self {
        Operand::Int(i64::from(x))
    }
}

impl<'o, E: Engine> From<&'o [f64]> for Operand<'o, '_, E> {
    fn from(v: &'o [f64]) -> Self {
        Operand::Array(Cow::Borrowed(v))
    }
}

impl<E: Engine> From<Vec<f64>> for Operand<'_, '_, E> {
    fn from(v: Vec<f64>) -> Self {
        Operand::Array(Cow::Owned(v))
    }
}

impl<'o, E: Engine> From<&'o [i64]> for Operand<'o, '_, E> {
    fn from(v: &'o [i64]) -> Self {
        Operand::IntArray(Cow::Borrowed(v))
    }
}

impl<E: Engine> From<Vec<i64>> for Operand<'_, '_, E> {
    fn from(v: Vec<i64>) -> Self {
        Operand::IntArray(Cow::Owned(v))
    }
}

impl<E: Engine> Operand<'_, '_, E> {
    pub(crate) fn kind(&self) -> &'static str {
        match self {
            Operand::Cipher(_) => "ciphertext",
            Operand::Plain(_) => "plaintext",
            Operand::Scalar(_) | Operand::Int(_) => "scalar",
            Operand::Array(_) | Operand::IntArray(_) => "array",
        }
    }
}

/// What the caller needs the promoted operand to be.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Requirement {
    /// Plaintext or ciphertext.
    Any,
    /// Plaintexts get encrypted.
    Cipher,
}

/// A promoted operand; `Cow::Borrowed` when the input already matched.
pub enum Promoted<'o, 'ctx, E: Engine> {
    /// Ciphertext operand.
    Cipher(Cow<'o, Ciphertext<'ctx, E>>),
    /// Plaintext operand.
    Plain(Cow<'o, Plaintext<'ctx, E>>),
}

impl<E: Engine> fmt::Debug for Operand<'_, '_, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operand::Cipher(c) => f.debug_tuple("Cipher").field(c).finish(),
            Operand::Plain(p) => f.debug_tuple("Plain").field(p).finish(),
            Operand::Scalar(x) => f.debug_tuple("Scalar").field(x).finish(),
            Operand::Int(x) => f.debug_tuple("Int").field(x).finish(),
            Operand::Array(v) => f.debug_tuple("Array").field(v).finish(),
            Operand::IntArray(v) => f.debug_tuple("IntArray").field(v).finish(),
        }
    }
}

impl<E: Engine> fmt::Debug for Promoted<'_, '_, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (kind, borrowed) = match self {
            Promoted::Cipher(c) => ("Cipher", matches!(c, Cow::Borrowed(_))),
            Promoted::Plain(p) => ("Plain", matches!(p, Cow::Borrowed(_))),
        };
        f.debug_struct(kind).field("info", &self.info()).field("borrowed", &borrowed).finish()
    }
}

impl<'o, 'ctx, E: Engine> Promoted<'o, 'ctx, E> {
    /// Snapshot of the operand's tags.
    pub fn info(&self) -> OperandInfo {
        match self {
            Promoted::Cipher(c) => c.info(),
            Promoted::Plain(p) => p.info(),
        }
    }

    /// Level and scale.
    pub fn state(&self) -> NumericState {
        match self {
            Promoted::Cipher(c) => c.state(),
            Promoted::Plain(p) => p.state(),
        }
    }

    /// Ciphertext side.
    pub fn is_cipher(&self) -> bool {
        matches!(self, Promoted::Cipher(_))
    }

    /// `true` when no new handle was created.
    pub fn is_borrowed(&self) -> bool {
        matches!(self, Promoted::Cipher(Cow::Borrowed(_)) | Promoted::Plain(Cow::Borrowed(_)))
    }

    /// Borrow as an operand again; promoting it allocates nothing.
    pub fn as_operand(&self) -> Operand<'_, 'ctx, E> {
        match self {
            Promoted::Cipher(c) => Operand::Cipher(c.as_ref()),
            Promoted::Plain(p) => Operand::Plain(p.as_ref()),
        }
    }

    /// Encrypt a plaintext side; a ciphertext side is returned unchanged.
    pub(crate) fn into_cipher(self, op: &'static str) -> Result<Promoted<'o, 'ctx, E>> {
        match self {
            Promoted::Plain(p) => {
                let ctx = p.require(op)?;
                Ok(Promoted::Cipher(Cow::Owned(ctx.encrypt(&p)?)))
            }
            c => Ok(c),
        }
    }
}

/// Promote `operand` to the scheme and encoding of `lhs`.
///
/// Values are checked, never converted: a value of another scheme is a
/// `SchemeMismatch`, an incompatible encoding an `EncodingMismatch`. Scalars
/// and arrays are encoded under `lhs`'s encoding at the context's default
/// scale, level 0; alignment moves them afterwards.
pub fn promote<'o, 'ctx, E: Engine>(
    ctx: &'ctx Context<E>,
    operand: Operand<'o, 'ctx, E>,
    lhs: &OperandInfo,
    requirement: Requirement,
) -> Result<Promoted<'o, 'ctx, E>> {
    let promoted = match operand {
        Operand::Cipher(c) => {
            check_value(c, lhs)?;
            Promoted::Cipher(Cow::Borrowed(c))
        }
        Operand::Plain(p) => {
            check_value(p, lhs)?;
            Promoted::Plain(Cow::Borrowed(p))
        }
        Operand::Scalar(x) => {
            let n = ctx.engine().capacity(lhs.encoding);
            Promoted::Plain(Cow::Owned(encode_values(ctx, real_values(vec![x; n], lhs)?, lhs)?))
        }
        Operand::Int(x) => {
            let n = ctx.engine().capacity(lhs.encoding);
            Promoted::Plain(Cow::Owned(encode_values(ctx, int_values(vec![x; n], lhs), lhs)?))
        }
        Operand::Array(v) => {
            check_capacity(ctx, v.len(), lhs)?;
            Promoted::Plain(Cow::Owned(encode_values(ctx, real_values(v.into_owned(), lhs)?, lhs)?))
        }
        Operand::IntArray(v) => {
            check_capacity(ctx, v.len(), lhs)?;
            Promoted::Plain(Cow::Owned(encode_values(ctx, int_values(v.into_owned(), lhs), lhs)?))
        }
    };
    debug!(borrowed = promoted.is_borrowed(), ?requirement, "promoted {}", promoted.info());
    match requirement {
        Requirement::Any => Ok(promoted),
        Requirement::Cipher => promoted.into_cipher("promote"),
    }
}

fn check_value(value: &impl OpaqueValue, lhs: &OperandInfo) -> Result<()> {
    if value.is_empty() {
        return Err(HeError::EmptyValue { op: "promote" });
    }
    if value.scheme() != lhs.scheme {
        return Err(HeError::SchemeMismatch { lhs: lhs.clone(), rhs: value.info() });
    }
    if lhs.encoding.combine(value.encoding()).is_none() {
        return Err(HeError::EncodingMismatch { lhs: lhs.clone(), rhs: value.info() });
    }
    Ok(())
}

fn check_capacity<E: Engine>(ctx: &Context<E>, len: usize, lhs: &OperandInfo) -> Result<()> {
    let capacity = ctx.engine().capacity(lhs.encoding);
    if len > capacity {
        return Err(HeError::CapacityExceeded { len, capacity });
    }
    Ok(())
}

/// Integer schemes only accept integral reals.
fn real_values(values: Vec<f64>, lhs: &OperandInfo) -> Result<SlotValues> {
    if lhs.scheme.is_integer() {
        let ints = values
            .iter()
            .map(|&x| {
                integral(x).ok_or_else(|| {
                    HeError::unsupported("promote", lhs.clone(), format!("{} is not a 64-bit integer", x))
                })
            })
            .collect::<Result<Vec<i64>>>()?;
        return Ok(SlotValues::Int(ints));
    }
    Ok(SlotValues::Real(values))
}

/// `x` as an `i64` when it is integral and in range.
pub(crate) fn integral(x: f64) -> Option<i64> {
    const BOUND: f64 = 9_223_372_036_854_775_808.0;
    if x.is_finite() && x.fract() == 0.0 && (-BOUND..BOUND).contains(&x) {
        Some(x as i64)
    } else {
        None
    }
}

fn int_values(values: Vec<i64>, lhs: &OperandInfo) -> SlotValues {
    match lhs.scheme {
        SchemeTag::Ckks => SlotValues::Real(values.into_iter().map(|x| x as f64).collect()),
        _ => SlotValues::Int(values),
    }
}

fn encode_values<'ctx, E: Engine>(
    ctx: &'ctx Context<E>,
    values: SlotValues,
    lhs: &OperandInfo,
) -> Result<Plaintext<'ctx, E>> {
    if lhs.encoding == EncodingTag::Undefined {
        return Err(HeError::unsupported("promote", lhs.clone(), "left operand has no encoding"));
    }
    let n = ctx.engine().capacity(lhs.encoding);
    ctx.encode(values.resized(n), lhs.encoding)
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
    fn test_promote_matching_value_is_borrowed() {
        let ctx = bfv_ctx();
        let x = ctx.encrypt_batch(&[1, 2]).unwrap();
        let y = ctx.encrypt_batch(&[3]).unwrap();
        let before = ctx.engine().allocations();
        let p = promote(&ctx, Operand::from(&y), &x.info(), Requirement::Any).unwrap();
        assert!(p.is_borrowed());
        match &p {
            Promoted::Cipher(c) => assert!(std::ptr::eq(c.as_ref(), &y)),
            Promoted::Plain(_) => panic!("expected a ciphertext"),
        }
        assert_eq!(ctx.engine().allocations(), before);
    }

    #[test]
    fn test_scalar_broadcasts() {
        let ctx = bfv_ctx();
        let x = ctx.encrypt_batch(&[1]).unwrap();
        let p = promote(&ctx, Operand::Int(4), &x.info(), Requirement::Any).unwrap();
        match p {
            Promoted::Plain(p) => assert_eq!(p.decode_batch().unwrap(), vec![4; 16]),
            Promoted::Cipher(_) => panic!("expected a plaintext"),
        }
    }

    #[test]
    fn test_array_is_zero_padded() {
        let ctx = ckks_ctx();
        let x = ctx.encrypt_frac(&[1.0]).unwrap();
        let p = promote(&ctx, Operand::from(vec![0.5, 1.5]), &x.info(), Requirement::Any).unwrap();
        match p {
            Promoted::Plain(p) => {
                let v = p.decode_frac().unwrap();
                assert_eq!(v.len(), 8);
                assert!((v[1] - 1.5).abs() < 1e-6);
                assert!(v[2..].iter().all(|x| x.abs() < 1e-6));
            }
            Promoted::Cipher(_) => panic!("expected a plaintext"),
        }
    }

    #[test]
    fn test_capacity_and_integrality() {
        let ctx = bfv_ctx();
        let single = ctx.encrypt_int(1).unwrap();
        let err = promote(&ctx, Operand::from(vec![1i64, 2]), &single.info(), Requirement::Any).unwrap_err();
        assert!(matches!(err, HeError::CapacityExceeded { len: 2, capacity: 1 }));
        let err = promote(&ctx, Operand::Scalar(0.5), &single.info(), Requirement::Any).unwrap_err();
        assert!(matches!(err, HeError::UnsupportedOperation { .. }));
        assert!(promote(&ctx, Operand::Scalar(3.0), &single.info(), Requirement::Any).is_ok());
        let err = promote(&ctx, Operand::Scalar(1e19), &single.info(), Requirement::Any).unwrap_err();
        assert!(matches!(err, HeError::UnsupportedOperation { op: "promote", .. }));
    }

    #[test]
    fn test_integral_range() {
        assert_eq!(integral(-4.0), Some(-4));
        assert_eq!(integral(2f64.powi(62)), Some(1i64 << 62));
        assert_eq!(integral(-(2f64.powi(63))), Some(i64::MIN));
        assert_eq!(integral(2f64.powi(63)), None);
        assert_eq!(integral(f64::INFINITY), None);
        assert_eq!(integral(0.5), None);
    }

    #[test]
    fn test_debug_shows_borrowing() {
        let ctx = bfv_ctx();
        let x = ctx.encrypt_batch(&[1]).unwrap();
        let p = promote(&ctx, Operand::from(&x), &x.info(), Requirement::Any).unwrap();
        let text = format!("{:?}", p);
        assert!(text.starts_with("Cipher"), "{}", text);
        assert!(text.contains("borrowed: true"), "{}", text);
    }

    #[test]
    fn test_scheme_and_encoding_checks() {
        let bfv = bfv_ctx();
        let ckks = ckks_ctx();
        let x = bfv.encrypt_int(1).unwrap();
        let y = ckks.encrypt_frac(&[1.0]).unwrap();
        let err = promote(&ckks, Operand::from(&y), &x.info(), Requirement::Any).unwrap_err();
        assert!(matches!(err, HeError::SchemeMismatch { .. }));

        let batch = bfv.encrypt_batch(&[1]).unwrap();
        let err = promote(&bfv, Operand::from(&x), &batch.info(), Requirement::Any).unwrap_err();
        assert!(matches!(err, HeError::EncodingMismatch { .. }));

        let z = ckks.encrypt_complex(&[num_complex::Complex64::new(0.0, 1.0)]).unwrap();
        assert!(promote(&ckks, Operand::from(&z), &y.info(), Requirement::Any).is_ok());
    }

    #[test]
    fn test_cipher_requirement_encrypts() {
        let ctx = ckks_ctx();
        let x = ctx.encrypt_frac(&[1.0]).unwrap();
        let p = promote(&ctx, Operand::Scalar(2.0), &x.info(), Requirement::Cipher).unwrap();
        assert!(p.is_cipher());
        assert!(!p.is_borrowed());
        assert_eq!(p.info().size, 2);
    }
}
