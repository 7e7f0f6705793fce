//! Homomorphic operator dispatch.
//!
//! Every binary operator runs the same pipeline on a ciphertext receiver:
//! validate, promote the right-hand side, align, call the engine, update the
//! metadata. All checks run before the first native call, and the receiver is
//! only replaced once every native call succeeded, so a failed operator leaves
//! it as it was. Each operator comes as an in-place `*_assign` and a new-value
//! form that clones the receiver and runs the in-place path on the copy.
//!
//! Plaintext receivers get the same operators on cleartext slots: the operands
//! are promoted and aligned the same way, then decoded, combined and encoded
//! again at the receiver's level and scale.

use crate::align::{align_with, ScaleRule};
use crate::cipher::Ciphertext;
use crate::context::{Context, CumulativeMode};
use crate::engine::{Engine, KeyKind, SlotValues};
use crate::error::{HeError, OperandInfo, Result};
use crate::plain::Plaintext;
use crate::promote::{integral, promote, Operand, Promoted, Requirement};
use crate::scheme::{EncodingTag, SchemeTag};
use crate::value::OpaqueValue;
use itertools::Itertools;
use num_complex::Complex64;
use num_integer::Integer;
use std::borrow::Cow;
use tracing::{debug, instrument, warn};

/// Binary operators routed through [`Ciphertext::apply_binary`] and
/// [`Plaintext::apply_binary`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BinaryOp {
    /// Slot-wise sum.
    Add,
    /// Slot-wise difference.
    Sub,
    /// Slot-wise product.
    Mul,
}

impl BinaryOp {
    /// Operator name used in errors and spans.
    pub fn name(self) -> &'static str {
        match self {
            BinaryOp::Add => "add",
            BinaryOp::Sub => "sub",
            BinaryOp::Mul => "mul",
        }
    }

    /// Products only need matching levels; CKKS sums also need matching scales.
    fn scale_rule<E: Engine>(self, ctx: &Context<E>, scheme: SchemeTag) -> ScaleRule {
        match (scheme, self) {
            (SchemeTag::Ckks, BinaryOp::Add | BinaryOp::Sub) => ScaleRule::from(ctx.policy().align_mode),
            _ => ScaleRule::Ignore,
        }
    }
}

impl<'ctx, E: Engine> Ciphertext<'ctx, E> {
    /// In-place `self = self <op> rhs`.
    ///
    /// Alignment steps run on a copy of the receiver; `self` is replaced only
    /// after the native call returned.
    #[instrument(level = "debug", skip_all, fields(op = op.name()))]
    pub fn apply_binary<'o>(&mut self, op: BinaryOp, rhs: Operand<'o, 'ctx, E>) -> Result<()> {
        let name = op.name();
        let ctx = self.require(name)?;
        let lhs = self.info();
        debug!(lhs = %lhs, rhs = rhs.kind(), "dispatch");

        let mut rhs = promote(ctx, rhs, &lhs, Requirement::Any)?;
        let zero_factor = match &rhs {
            Promoted::Plain(p) if op == BinaryOp::Mul => p.is_zero()?,
            _ => false,
        };
        if zero_factor {
            debug!("zero plaintext factor, encrypting it");
            rhs = rhs.into_cipher(name)?;
        }
        let encoding = lhs.encoding.combine(rhs.info().encoding).unwrap_or(lhs.encoding);

        let mut receiver = Cow::Borrowed(&*self);
        align_with(ctx, &mut receiver, &mut rhs, op.scale_rule(ctx, lhs.scheme))?;
        let mut out = receiver.into_owned();

        let rhs_info = rhs.info();
        let mut state = out.state();
        let mut size = out.size;
        match (op, rhs.is_cipher()) {
            (BinaryOp::Mul, is_cipher) => {
                if let (Some(a), Some(b)) = (state.scale(), rhs_info.state.scale()) {
                    state.set_scale(a * b)?;
                }
                if is_cipher {
                    size = size + rhs_info.size - 1;
                }
            }
            (_, true) => size = size.max(rhs_info.size),
            (_, false) => {}
        }

        let engine = ctx.engine();
        let handle = out.handle_mut(name)?;
        match &rhs {
            Promoted::Cipher(c) => {
                let other = c.handle_ref(name)?;
                match op {
                    BinaryOp::Add => engine.add(handle, other)?,
                    BinaryOp::Sub => engine.sub(handle, other)?,
                    BinaryOp::Mul => engine.mul(handle, other)?,
                }
            }
            Promoted::Plain(p) => {
                let other = p.handle().ok_or(HeError::EmptyValue { op: name })?;
                match op {
                    BinaryOp::Add => engine.add_plain(handle, other)?,
                    BinaryOp::Sub => engine.sub_plain(handle, other)?,
                    BinaryOp::Mul => engine.mul_plain(handle, other)?,
                }
            }
        }

        *out.meta.state_mut() = state;
        out.size = size;
        out.meta.set_encoding_unchecked(encoding);
        out.debug_check_native();
        debug!(result = %out.info(), "done");
        *self = out;
        Ok(())
    }

    /// In-place sum.
    pub fn add_assign<'o>(&mut self, rhs: impl Into<Operand<'o, 'ctx, E>>) -> Result<()>
    where
        'ctx: 'o,
    {
        self.apply_binary(BinaryOp::Add, rhs.into())
    }

    /// Sum as a new ciphertext.
    pub fn add<'o>(&self, rhs: impl Into<Operand<'o, 'ctx, E>>) -> Result<Self>
    where
        'ctx: 'o,
    {
        let mut out = self.clone();
        out.add_assign(rhs)?;
        Ok(out)
    }

    /// In-place difference.
    pub fn sub_assign<'o>(&mut self, rhs: impl Into<Operand<'o, 'ctx, E>>) -> Result<()>
    where
        'ctx: 'o,
    {
        self.apply_binary(BinaryOp::Sub, rhs.into())
    }

    /// Difference as a new ciphertext.
    pub fn sub<'o>(&self, rhs: impl Into<Operand<'o, 'ctx, E>>) -> Result<Self>
    where
        'ctx: 'o,
    {
        let mut out = self.clone();
        out.sub_assign(rhs)?;
        Ok(out)
    }

    /// In-place product. A ciphertext factor grows the size; relinearize after.
    pub fn mul_assign<'o>(&mut self, rhs: impl Into<Operand<'o, 'ctx, E>>) -> Result<()>
    where
        'ctx: 'o,
    {
        self.apply_binary(BinaryOp::Mul, rhs.into())
    }

    /// Product as a new ciphertext.
    pub fn mul<'o>(&self, rhs: impl Into<Operand<'o, 'ctx, E>>) -> Result<Self>
    where
        'ctx: 'o,
    {
        let mut out = self.clone();
        out.mul_assign(rhs)?;
        Ok(out)
    }

    /// Divide by a cleartext scalar or a full slot array.
    ///
    /// CKKS multiplies by the reciprocal, BFV/BGV by the inverse modulo the
    /// plain modulus. An array must hold exactly one divisor per slot.
    pub fn div_assign<'o>(&mut self, rhs: impl Into<Operand<'o, 'ctx, E>>) -> Result<()>
    where
        'ctx: 'o,
    {
        let ctx = self.require("div")?;
        let info = self.info();
        let rhs: Operand<'o, 'ctx, E> = rhs.into();
        let capacity = ctx.engine().capacity(self.encoding());
        let full = |len: usize| {
            if len == capacity {
                Ok(())
            } else {
                Err(HeError::unsupported(
                    "div",
                    info.clone(),
                    format!("{} divisors for {} slots", len, capacity),
                ))
            }
        };
        let inverse: Operand<'o, 'ctx, E> = match self.scheme() {
            SchemeTag::Ckks => {
                let recip = |x: f64| {
                    if x == 0.0 || !x.is_finite() {
                        return Err(HeError::unsupported("div", info.clone(), format!("cannot divide by {}", x)));
                    }
                    Ok(1.0 / x)
                };
                match rhs {
                    Operand::Scalar(x) => Operand::Scalar(recip(x)?),
                    Operand::Int(x) => Operand::Scalar(recip(x as f64)?),
                    Operand::Array(v) => {
                        full(v.len())?;
                        Operand::Array(Cow::Owned(v.iter().map(|&x| recip(x)).collect::<Result<_>>()?))
                    }
                    Operand::IntArray(v) => {
                        full(v.len())?;
                        Operand::Array(Cow::Owned(v.iter().map(|&x| recip(x as f64)).collect::<Result<_>>()?))
                    }
                    other => return Err(value_divisor(&info, &other)),
                }
            }
            _ => {
                let t = ctx.engine().plain_modulus().ok_or_else(|| {
                    HeError::unsupported("div", info.clone(), "engine reports no plain modulus")
                })?;
                let inv = |x: i64| {
                    mod_inverse(x, t).ok_or_else(|| {
                        HeError::unsupported("div", info.clone(), format!("{} has no inverse modulo {}", x, t))
                    })
                };
                let whole = |x: f64| {
                    integral(x).ok_or_else(|| {
                        HeError::unsupported("div", info.clone(), format!("{} is not a 64-bit integer", x))
                    })
                };
                match rhs {
                    Operand::Scalar(x) => Operand::Int(inv(whole(x)?)?),
                    Operand::Int(x) => Operand::Int(inv(x)?),
                    Operand::Array(v) => {
                        full(v.len())?;
                        Operand::IntArray(Cow::Owned(v.iter().map(|&x| inv(whole(x)?)).collect::<Result<_>>()?))
                    }
                    Operand::IntArray(v) => {
                        full(v.len())?;
                        Operand::IntArray(Cow::Owned(v.iter().map(|&x| inv(x)).collect::<Result<_>>()?))
                    }
                    other => return Err(value_divisor(&info, &other)),
                }
            }
        };
        self.apply_binary(BinaryOp::Mul, inverse)
    }

    /// Quotient as a new ciphertext.
    pub fn div<'o>(&self, rhs: impl Into<Operand<'o, 'ctx, E>>) -> Result<Self>
    where
        'ctx: 'o,
    {
        let mut out = self.clone();
        out.div_assign(rhs)?;
        Ok(out)
    }

    /// In-place slot-wise negation.
    pub fn negate_assign(&mut self) -> Result<()> {
        let ctx = self.require("negate")?;
        ctx.engine().negate(self.handle_mut("negate")?)
    }

    /// Negation as a new ciphertext.
    pub fn negate(&self) -> Result<Self> {
        let mut out = self.clone();
        out.negate_assign()?;
        Ok(out)
    }

    /// Bring the size back to 2. A size-2 ciphertext is left alone.
    pub fn relinearize_assign(&mut self) -> Result<()> {
        let ctx = self.require("relinearize")?;
        if self.size <= 2 {
            return Ok(());
        }
        if !ctx.has_key(KeyKind::Relin) {
            return Err(HeError::MissingKey { key: KeyKind::Relin, op: "relinearize" });
        }
        ctx.engine().relinearize(self.handle_mut("relinearize")?)?;
        self.size = 2;
        Ok(())
    }

    /// Relinearized copy.
    pub fn relinearized(&self) -> Result<Self> {
        let mut out = self.clone();
        out.relinearize_assign()?;
        Ok(out)
    }

    /// Rotate slots left by `steps` (slot `i` receives slot `i + steps`).
    ///
    /// CKKS rotates over all slots, BFV/BGV rotate each batching row. Steps are
    /// reduced modulo that period; a multiple of it is a no-op.
    pub fn rotate_assign(&mut self, steps: i32) -> Result<()> {
        let ctx = self.require("rotate")?;
        self.check_rotatable("rotate")?;
        let period = ctx.engine().rotation_period() as i32;
        let k = steps.rem_euclid(period);
        if k == 0 {
            return Ok(());
        }
        if !ctx.has_key(KeyKind::Rotation(k)) {
            return Err(HeError::MissingKey { key: KeyKind::Rotation(k), op: "rotate" });
        }
        debug!(steps, reduced = k, period, "rotate");
        ctx.engine().rotate(self.handle_mut("rotate")?, k)
    }

    /// Rotated copy.
    pub fn rotate(&self, steps: i32) -> Result<Self> {
        let mut out = self.clone();
        out.rotate_assign(steps)?;
        Ok(out)
    }

    /// Swap the two batching rows of a BFV/BGV vector.
    pub fn flip_assign(&mut self) -> Result<()> {
        let ctx = self.require("flip")?;
        if self.encoding() != EncodingTag::Batched {
            return Err(HeError::unsupported("flip", self.info(), "only batched BFV/BGV values have rows"));
        }
        self.check_rotatable("flip")?;
        if !ctx.has_key(KeyKind::RowSwap) {
            return Err(HeError::MissingKey { key: KeyKind::RowSwap, op: "flip" });
        }
        ctx.engine().swap_rows(self.handle_mut("flip")?)
    }

    /// Row-swapped copy.
    pub fn flip(&self) -> Result<Self> {
        let mut out = self.clone();
        out.flip_assign()?;
        Ok(out)
    }

    /// `self^n`, relinearizing after every product.
    pub fn power_assign(&mut self, n: i64) -> Result<()> {
        *self = self.power(n)?;
        Ok(())
    }

    /// `self^n` as a new ciphertext. CKKS only supports `n = 2`.
    pub fn power(&self, n: i64) -> Result<Self> {
        let ctx = self.require("power")?;
        if n <= 0 {
            return Err(HeError::InvalidExponent { exponent: n, operand: self.info() });
        }
        if self.scheme() == SchemeTag::Ckks && n != 2 {
            return Err(HeError::unsupported("power", self.info(), "CKKS supports squaring only"));
        }
        if n == 1 {
            return Ok(self.clone());
        }
        if !ctx.has_key(KeyKind::Relin) {
            return Err(HeError::MissingKey { key: KeyKind::Relin, op: "power" });
        }

        let mut base = self.relinearized()?;
        let mut acc: Option<Self> = None;
        let mut e = n;
        loop {
            if e & 1 == 1 {
                acc = Some(match acc {
                    None => base.clone(),
                    Some(mut a) => {
                        a.mul_assign(&base)?;
                        a.relinearize_assign()?;
                        a
                    }
                });
            }
            e >>= 1;
            if e == 0 {
                break;
            }
            let b = base.clone();
            base.mul_assign(&b)?;
            base.relinearize_assign()?;
        }
        Ok(acc.unwrap_or(base))
    }

    /// Evaluate `coeffs[0] + coeffs[1]·x + … + coeffs[d]·x^d` slot-wise.
    ///
    /// Horner's rule: one ciphertext product per degree, each relinearized.
    /// CKKS rescales after every product, so degree `d` consumes `d` chain
    /// levels. BFV/BGV coefficients must be integers.
    #[instrument(level = "debug", skip_all, fields(degree = coeffs.len()))]
    pub fn polyval(&self, coeffs: &[f64]) -> Result<Self> {
        self.require("polyval")?;
        if coeffs.is_empty() {
            return Err(HeError::unsupported("polyval", self.info(), "no coefficients"));
        }
        let ckks = self.scheme() == SchemeTag::Ckks;
        let Some(degree) = coeffs.iter().rposition(|&c| c != 0.0) else {
            return self.sub(self);
        };
        if degree == 0 {
            let mut out = self.sub(self)?;
            out.add_assign(coeffs[0])?;
            return Ok(out);
        }

        let mut acc = self.mul(coeffs[degree])?;
        if ckks {
            acc.rescale_to_next()?;
        }
        for i in (0..degree).rev() {
            acc.add_assign(coeffs[i])?;
            if i > 0 {
                acc.mul_assign(self)?;
                acc.relinearize_assign()?;
                if ckks {
                    acc.rescale_to_next()?;
                }
            }
        }
        debug!(result = %acc.info(), "polyval");
        Ok(acc)
    }

    /// In-place [`Ciphertext::polyval`].
    pub fn polyval_assign(&mut self, coeffs: &[f64]) -> Result<()> {
        *self = self.polyval(coeffs)?;
        Ok(())
    }

    /// Leave the sum of all slots in every slot.
    ///
    /// Adds `log2(period)` power-of-two rotations, plus a row swap for BFV/BGV.
    /// Under [`CumulativeMode::AllowPartial`] rotations without a key are skipped.
    pub fn cumulative_add_assign(&mut self) -> Result<()> {
        *self = self.cumulative_add()?;
        Ok(())
    }

    /// Slot sum as a new ciphertext.
    pub fn cumulative_add(&self) -> Result<Self> {
        let ctx = self.require("cumulative_add")?;
        self.check_rotatable("cumulative_add")?;
        let period = ctx.engine().rotation_period() as i32;
        let steps: Vec<i32> = (0..31).map(|i| 1i32 << i).take_while(|&s| s < period).collect();
        let (present, missing): (Vec<i32>, Vec<i32>) =
            steps.into_iter().partition(|&s| ctx.has_key(KeyKind::Rotation(s)));
        let rows = self.scheme().is_integer();
        let can_flip = !rows || ctx.has_key(KeyKind::RowSwap);

        if !missing.is_empty() || !can_flip {
            match ctx.policy().cumulative_mode {
                CumulativeMode::Strict => {
                    let key = missing.first().map_or(KeyKind::RowSwap, |&s| KeyKind::Rotation(s));
                    return Err(HeError::MissingKey { key, op: "cumulative_add" });
                }
                CumulativeMode::AllowPartial => {
                    warn!(?missing, row_swap = can_flip, "cumulative_add skips rotations without keys");
                }
            }
        }

        let mut acc = self.clone();
        for s in present {
            let rotated = acc.rotate(s)?;
            acc.add_assign(&rotated)?;
        }
        if rows && can_flip {
            let flipped = acc.flip()?;
            acc.add_assign(&flipped)?;
        }
        Ok(acc)
    }

    /// Inner product: multiply slot-wise, then sum every slot.
    pub fn scalar_prod_assign<'o>(&mut self, rhs: impl Into<Operand<'o, 'ctx, E>>) -> Result<()>
    where
        'ctx: 'o,
    {
        *self = self.scalar_prod(rhs)?;
        Ok(())
    }

    /// Inner product as a new ciphertext.
    pub fn scalar_prod<'o>(&self, rhs: impl Into<Operand<'o, 'ctx, E>>) -> Result<Self>
    where
        'ctx: 'o,
    {
        let mut out = self.mul(rhs)?;
        out.relinearize_assign()?;
        out.cumulative_add()
    }

    /// Divide by the next chain prime; CKKS only.
    pub fn rescale_to_next(&mut self) -> Result<()> {
        let ctx = self.require("rescale_to_next")?;
        let scale = match (self.scheme(), self.scale()) {
            (SchemeTag::Ckks, Some(s)) => s,
            _ => return Err(HeError::unsupported("rescale_to_next", self.info(), "only CKKS values carry a scale")),
        };
        let q = ctx.engine().chain_prime(self.chain_level()).ok_or(HeError::ChainExhausted {
            operand: self.info(),
            chain_length: ctx.chain_length(),
        })?;
        let mut state = self.state();
        state.bump_level();
        state.set_scale(scale / q as f64)?;
        ctx.engine().rescale_to_next(self.handle_mut("rescale_to_next")?)?;
        *self.meta.state_mut() = state;
        self.debug_check_native();
        Ok(())
    }

    /// Drop the next chain prime without touching the scale.
    pub fn mod_switch_to_next(&mut self) -> Result<()> {
        let ctx = self.require("mod_switch_to_next")?;
        if self.chain_level() + 1 >= ctx.chain_length() {
            return Err(HeError::ChainExhausted { operand: self.info(), chain_length: ctx.chain_length() });
        }
        ctx.engine().mod_switch_to_next(self.handle_mut("mod_switch_to_next")?)?;
        self.meta.state_mut().bump_level();
        Ok(())
    }

    fn check_rotatable(&self, op: &'static str) -> Result<()> {
        if !self.encoding().is_vector() {
            return Err(HeError::unsupported(op, self.info(), "needs a slot-vector encoding"));
        }
        if self.size != 2 {
            return Err(HeError::unsupported(op, self.info(), "relinearize before rotating"));
        }
        Ok(())
    }
}

impl<'ctx, E: Engine> Plaintext<'ctx, E> {
    /// In-place `self = self <op> rhs` on cleartext slots.
    ///
    /// A ciphertext operand is refused: the result would be encrypted, so the
    /// ciphertext has to be the receiver. A product keeps the receiver's scale.
    #[instrument(level = "debug", skip_all, fields(op = op.name()))]
    pub fn apply_binary<'o>(&mut self, op: BinaryOp, rhs: Operand<'o, 'ctx, E>) -> Result<()> {
        let name = op.name();
        let ctx = self.require(name)?;
        let lhs = self.info();
        debug!(lhs = %lhs, rhs = rhs.kind(), "plaintext dispatch");

        let mut rhs = match promote(ctx, rhs, &lhs, Requirement::Any)? {
            Promoted::Plain(p) => p,
            Promoted::Cipher(_) => {
                return Err(HeError::unsupported(name, lhs, "a ciphertext operand needs a ciphertext receiver"));
            }
        };
        let encoding = lhs.encoding.combine(rhs.encoding()).unwrap_or(lhs.encoding);

        let fresh = {
            let mut receiver = Cow::Borrowed(&*self);
            align_with(ctx, &mut receiver, &mut rhs, op.scale_rule(ctx, lhs.scheme))?;
            let a = receiver.decode(receiver.encoding())?;
            let b = rhs.decode(rhs.encoding())?;
            let values = combine_slots(ctx, op, &a, &b, encoding)?;
            let state = receiver.state();
            ctx.encode_at_level(values, encoding, state.scale(), state.chain_level())?
        };
        debug!(result = %fresh.info(), "done");
        *self = fresh;
        Ok(())
    }

    /// In-place sum.
    pub fn add_assign<'o>(&mut self, rhs: impl Into<Operand<'o, 'ctx, E>>) -> Result<()>
    where
        'ctx: 'o,
    {
        self.apply_binary(BinaryOp::Add, rhs.into())
    }

    /// Sum as a new plaintext.
    pub fn add<'o>(&self, rhs: impl Into<Operand<'o, 'ctx, E>>) -> Result<Self>
    where
        'ctx: 'o,
    {
        let mut out = self.clone();
        out.add_assign(rhs)?;
        Ok(out)
    }

    /// In-place difference.
    pub fn sub_assign<'o>(&mut self, rhs: impl Into<Operand<'o, 'ctx, E>>) -> Result<()>
    where
        'ctx: 'o,
    {
        self.apply_binary(BinaryOp::Sub, rhs.into())
    }

    /// Difference as a new plaintext.
    pub fn sub<'o>(&self, rhs: impl Into<Operand<'o, 'ctx, E>>) -> Result<Self>
    where
        'ctx: 'o,
    {
        let mut out = self.clone();
        out.sub_assign(rhs)?;
        Ok(out)
    }

    /// In-place product.
    pub fn mul_assign<'o>(&mut self, rhs: impl Into<Operand<'o, 'ctx, E>>) -> Result<()>
    where
        'ctx: 'o,
    {
        self.apply_binary(BinaryOp::Mul, rhs.into())
    }

    /// Product as a new plaintext.
    pub fn mul<'o>(&self, rhs: impl Into<Operand<'o, 'ctx, E>>) -> Result<Self>
    where
        'ctx: 'o,
    {
        let mut out = self.clone();
        out.mul_assign(rhs)?;
        Ok(out)
    }

    /// In-place slot-wise negation.
    pub fn negate_assign(&mut self) -> Result<()> {
        self.apply_binary(BinaryOp::Mul, Operand::Int(-1))
    }

    /// Negation as a new plaintext.
    pub fn negate(&self) -> Result<Self> {
        let mut out = self.clone();
        out.negate_assign()?;
        Ok(out)
    }
}

/// Slot-wise `a <op> b` in the representation of `encoding`. Integer slots are
/// reduced modulo the plain modulus into the centred range.
fn combine_slots<E: Engine>(
    ctx: &Context<E>,
    op: BinaryOp,
    a: &SlotValues,
    b: &SlotValues,
    encoding: EncodingTag,
) -> Result<SlotValues> {
    match encoding {
        EncodingTag::Integer | EncodingTag::Batched => {
            let t = ctx.engine().plain_modulus().ok_or_else(|| HeError::engine(op.name(), "no plain modulus"))?;
            let t = i128::from(t);
            let ints = |v: &SlotValues| -> Vec<i128> {
                match v {
                    SlotValues::Int(v) => v.iter().map(|&x| i128::from(x)).collect(),
                    other => other.to_reals().into_iter().map(|x| x.round() as i128).collect(),
                }
            };
            let out = ints(a)
                .into_iter()
                .zip_eq(ints(b))
                .map(|(x, y)| {
                    let r = match op {
                        BinaryOp::Add => x + y,
                        BinaryOp::Sub => x - y,
                        BinaryOp::Mul => x * y,
                    }
                    .rem_euclid(t);
                    let centred = if r > t / 2 { r - t } else { r };
                    i64::try_from(centred).map_err(|_| HeError::engine(op.name(), "slot exceeds 64 bits"))
                })
                .collect::<Result<_>>()?;
            Ok(SlotValues::Int(out))
        }
        EncodingTag::Complex => {
            let out: Vec<Complex64> = a
                .to_complex()
                .into_iter()
                .zip_eq(b.to_complex())
                .map(|(x, y)| match op {
                    BinaryOp::Add => x + y,
                    BinaryOp::Sub => x - y,
                    BinaryOp::Mul => x * y,
                })
                .collect();
            Ok(SlotValues::Complex(out))
        }
        _ => {
            let out: Vec<f64> = a
                .to_reals()
                .into_iter()
                .zip_eq(b.to_reals())
                .map(|(x, y)| match op {
                    BinaryOp::Add => x + y,
                    BinaryOp::Sub => x - y,
                    BinaryOp::Mul => x * y,
                })
                .collect();
            Ok(SlotValues::Real(out))
        }
    }
}

/// Error for a ciphertext or plaintext divisor: a scheme mismatch takes
/// precedence over the missing encrypted division.
fn value_divisor<E: Engine>(info: &OperandInfo, rhs: &Operand<'_, '_, E>) -> HeError {
    let other = match rhs {
        Operand::Cipher(c) => Some(c.info()),
        Operand::Plain(p) => Some(p.info()),
        _ => None,
    };
    match other {
        Some(other) if other.scheme != info.scheme => {
            HeError::SchemeMismatch { lhs: info.clone(), rhs: other }
        }
        _ => HeError::unsupported("div", info.clone(), format!("cannot divide by a {}", rhs.kind())),
    }
}

/// Inverse of `x` modulo `t`, if it exists.
fn mod_inverse(x: i64, t: u64) -> Option<i64> {
    let t = i128::from(t);
    let a = i128::from(x).rem_euclid(t);
    let g = a.extended_gcd(&t);
    if g.gcd != 1 {
        return None;
    }
    i64::try_from(g.x.rem_euclid(t)).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{AlignMode, Context, Policy};
    use crate::params::ContextParams;
    use crate::sim::SimEngine;

    fn bfv_ctx() -> Context<SimEngine> {
        let params = ContextParams::bfv(16, 65537, vec![40, 40, 40]);
        Context::new(SimEngine::new(params).unwrap().with_relin_keys().with_rotation_keys())
    }

    fn ckks_ctx() -> Context<SimEngine> {
        let params = ContextParams::ckks(16, 2f64.powi(30), vec![60, 30, 30, 60]);
        Context::new(SimEngine::new(params).unwrap().with_seed(11).with_relin_keys().with_rotation_keys())
    }

    fn close(a: &[f64], b: &[f64]) -> bool {
        a.iter().zip(b).all(|(x, y)| (x - y).abs() < 1e-4)
    }

    #[test]
    fn test_mod_inverse() {
        assert_eq!(mod_inverse(3, 7), Some(5));
        assert_eq!(mod_inverse(-1, 65537), Some(65536));
        assert_eq!(mod_inverse(0, 65537), None);
        assert_eq!(mod_inverse(4, 8), None);
    }

    #[test]
    fn test_bfv_arith() {
        let ctx = bfv_ctx();
        let a = ctx.encrypt_int(127).unwrap();
        let b = ctx.encrypt_int(-2).unwrap();
        assert_eq!(ctx.decrypt_int(&a.add(&b).unwrap()).unwrap(), 125);
        assert_eq!(ctx.decrypt_int(&a.sub(&b).unwrap()).unwrap(), 129);
        assert_eq!(ctx.decrypt_int(&a.mul(&b).unwrap()).unwrap(), -254);
        assert_eq!(ctx.decrypt_int(&a.negate().unwrap()).unwrap(), -127);
    }

    #[test]
    fn test_scalar_operands() {
        let ctx = bfv_ctx();
        let a = ctx.encrypt_batch(&[1, 2, 3]).unwrap();
        let out = a.add(10).unwrap().mul(vec![2i64, 3]).unwrap();
        assert_eq!(&ctx.decrypt_batch(&out).unwrap()[..4], &[22, 36, 0, 0]);
        assert_eq!(out.size(), 2);
    }

    #[test]
    fn test_bfv_division_uses_inverse() {
        let ctx = bfv_ctx();
        let a = ctx.encrypt_int(42).unwrap();
        assert_eq!(ctx.decrypt_int(&a.div(6).unwrap()).unwrap(), 7);
        assert!(matches!(a.div(0), Err(HeError::UnsupportedOperation { op: "div", .. })));
        assert!(matches!(a.div(&a), Err(HeError::UnsupportedOperation { .. })));
    }

    #[test]
    fn test_ckks_division_uses_reciprocal() {
        let ctx = ckks_ctx();
        let a = ctx.encrypt_frac(&[3.0, 1.5]).unwrap();
        let q = a.div(vec![2.0, 0.5, 1.0, 1.0, 1.0, 1.0, 1.0, 1.0]).unwrap();
        assert!(close(&ctx.decrypt_frac(&q).unwrap()[..2], &[1.5, 3.0]));
        assert!(a.div(0.0).is_err());
    }

    #[test]
    fn test_div_rejects_partial_divisor_array() {
        let ckks = ckks_ctx();
        let a = ckks.encrypt_frac(&[3.0, 1.5]).unwrap();
        let calls = ckks.engine().native_calls();
        assert!(matches!(a.div(vec![2.0, 0.5]), Err(HeError::UnsupportedOperation { op: "div", .. })));
        assert_eq!(ckks.engine().native_calls(), calls);

        let bfv = bfv_ctx();
        let b = bfv.encrypt_batch(&[6, 12]).unwrap();
        assert!(matches!(b.div(vec![2i64, 3]), Err(HeError::UnsupportedOperation { op: "div", .. })));
        let mut divisors = vec![1i64; 16];
        divisors[..2].copy_from_slice(&[2, 3]);
        assert_eq!(&bfv.decrypt_batch(&b.div(divisors).unwrap()).unwrap()[..2], &[3, 4]);

        let single = bfv.encrypt_int(42).unwrap();
        assert_eq!(bfv.decrypt_int(&single.div(vec![7i64]).unwrap()).unwrap(), 6);
    }

    #[test]
    fn test_div_rejects_out_of_range_integer() {
        let ctx = bfv_ctx();
        let a = ctx.encrypt_int(42).unwrap();
        assert!(matches!(a.div(1e19), Err(HeError::UnsupportedOperation { op: "div", .. })));
        assert!(matches!(a.div(-1e19), Err(HeError::UnsupportedOperation { op: "div", .. })));
        assert!(matches!(a.div(2.5), Err(HeError::UnsupportedOperation { op: "div", .. })));
    }

    #[test]
    fn test_failed_mul_leaves_receiver_unchanged() {
        let ctx = ckks_ctx();
        let mut x = ctx.encrypt_frac(&[1.5]).unwrap();
        let mut y = ctx.encrypt_frac(&[2.0]).unwrap();
        y.mod_switch_to_next().unwrap();
        y.mod_switch_to_next().unwrap();
        let before = x.info();
        let err = x.mul_assign(&y).unwrap_err();
        assert!(matches!(err, HeError::Engine { .. }), "{}", err);
        assert_eq!(x.info(), before);
        assert_eq!(x.chain_level(), 0);
        assert!(close(&ctx.decrypt_frac(&x).unwrap()[..1], &[1.5]));

        // the same receiver still works once the operands fit
        x.mul_assign(2.0).unwrap();
        assert!(close(&ctx.decrypt_frac(&x).unwrap()[..1], &[3.0]));
    }

    #[test]
    fn test_failed_power_leaves_receiver_unchanged() {
        let bare = Context::new(SimEngine::new(ContextParams::bfv(16, 65537, vec![40, 40])).unwrap());
        let mut a = bare.encrypt_int(3).unwrap();
        let before = a.info();
        assert!(matches!(a.power_assign(3), Err(HeError::MissingKey { .. })));
        assert_eq!(a.info(), before);
        assert_eq!(bare.decrypt_int(&a).unwrap(), 3);
    }

    #[test]
    fn test_polyval_bfv() {
        let ctx = bfv_ctx();
        let x = ctx.encrypt_batch(&[1, 2, 3]).unwrap();
        let y = x.polyval(&[2.0, 0.0, 1.0, 3.0]).unwrap();
        assert_eq!(y.size(), 2);
        let v = ctx.decrypt_batch(&y).unwrap();
        assert_eq!(&v[..3], &[6, 30, 92]);
        assert_eq!(v[3], 2);

        // trailing zeros do not raise the degree
        let lin = x.polyval(&[1.0, 1.0, 0.0, 0.0]).unwrap();
        assert_eq!(&ctx.decrypt_batch(&lin).unwrap()[..3], &[2, 3, 4]);

        let constant = x.polyval(&[5.0]).unwrap();
        assert_eq!(ctx.decrypt_batch(&constant).unwrap(), vec![5; 16]);
        let zero = x.polyval(&[0.0, 0.0]).unwrap();
        assert_eq!(ctx.decrypt_batch(&zero).unwrap(), vec![0; 16]);

        assert!(matches!(x.polyval(&[]), Err(HeError::UnsupportedOperation { op: "polyval", .. })));
        assert!(matches!(x.polyval(&[0.5, 1.0]), Err(HeError::UnsupportedOperation { .. })));
    }

    #[test]
    fn test_polyval_ckks() {
        let ctx = ckks_ctx();
        let x = ctx.encrypt_frac(&[0.5, 1.0, -1.0]).unwrap();
        let mut y = x.clone();
        y.polyval_assign(&[1.0, -2.0, 3.0]).unwrap();
        assert_eq!(y.chain_level(), 2);
        let v = ctx.decrypt_frac(&y).unwrap();
        assert!(v[..3].iter().zip([0.75, 2.0, 6.0]).all(|(a, b)| (a - b).abs() < 1e-3), "{:?}", v);

        // a cubic needs one more level than the chain has left
        let before = x.info();
        assert!(x.polyval(&[0.0, 0.0, 0.0, 1.0]).is_err());
        assert_eq!(x.info(), before);
    }

    #[test]
    fn test_plaintext_arith_bfv() {
        let ctx = bfv_ctx();
        let p = ctx.encode_batch(&[1, 2, 3]).unwrap();
        let q = ctx.encode_batch(&[10, 20, 30]).unwrap();
        assert_eq!(&p.add(&q).unwrap().decode_batch().unwrap()[..3], &[11, 22, 33]);
        assert_eq!(&p.sub(5).unwrap().decode_batch().unwrap()[..3], &[-4, -3, -2]);
        assert_eq!(&p.mul(vec![2i64, 3, 4]).unwrap().decode_batch().unwrap()[..4], &[2, 6, 12, 0]);
        assert_eq!(&p.negate().unwrap().decode_batch().unwrap()[..3], &[-1, -2, -3]);

        // products wrap modulo the plain modulus
        let big = ctx.encode_int(40000).unwrap();
        assert_eq!(big.mul(2).unwrap().decode_int().unwrap(), 14463);
    }

    #[test]
    fn test_plaintext_arith_ckks() {
        let ctx = ckks_ctx();
        let mut p = ctx.encode_frac(&[1.5, 2.0]).unwrap();
        let scale = p.scale();
        p.add_assign(0.5).unwrap();
        assert!(close(&p.decode_frac().unwrap()[..2], &[2.0, 2.5]));

        let q = ctx.encode_frac(&[2.0, 3.0]).unwrap();
        let r = p.mul(&q).unwrap();
        assert_eq!(r.scale(), scale);
        assert!(close(&r.decode_frac().unwrap()[..2], &[4.0, 7.5]));

        let mut low = ctx.encode_frac(&[1.0]).unwrap();
        low.mod_switch_to_next().unwrap();
        let s = q.sub(&low).unwrap();
        assert_eq!(s.chain_level(), 1);
        assert!(close(&s.decode_frac().unwrap()[..2], &[1.0, 3.0]));
    }

    #[test]
    fn test_plaintext_refuses_ciphertext_operand() {
        let ctx = bfv_ctx();
        let mut p = ctx.encode_int(3).unwrap();
        let c = ctx.encrypt_int(4).unwrap();
        let before = p.info();
        let calls = ctx.engine().native_calls();
        assert!(matches!(p.add_assign(&c), Err(HeError::UnsupportedOperation { op: "add", .. })));
        assert_eq!(p.info(), before);
        assert_eq!(ctx.engine().native_calls(), calls);
        assert_eq!(ctx.decrypt_int(&c.add(&p).unwrap()).unwrap(), 7);
    }

    #[test]
    fn test_mul_by_zero_escalates() {
        let ctx = ckks_ctx();
        let a = ctx.encrypt_frac(&[3.0]).unwrap();
        let z = a.mul(0.0).unwrap();
        assert_eq!(z.size(), 3);
        assert!(ctx.decrypt_frac(&z).unwrap()[0].abs() < 1e-4);
    }

    #[test]
    fn test_ckks_add_aligns_plain_scalar_after_mul() {
        let ctx = ckks_ctx();
        let a = ctx.encrypt_frac(&[1.5, 2.0]).unwrap();
        let mut sq = a.mul(&a).unwrap().relinearized().unwrap();
        sq.rescale_to_next().unwrap();
        let out = sq.add(1.0).unwrap();
        assert_eq!(out.chain_level(), 1);
        assert!(close(&ctx.decrypt_frac(&out).unwrap()[..2], &[3.25, 5.0]));
    }

    #[test]
    fn test_relinearize() {
        let ctx = bfv_ctx();
        let a = ctx.encrypt_int(3).unwrap();
        let sq = a.mul(&a).unwrap();
        assert_eq!(sq.size(), 3);
        assert_eq!(sq.relinearized().unwrap().size(), 2);
        assert_eq!(a.relinearized().unwrap().size(), 2);

        let bare = Context::new(SimEngine::new(ContextParams::bfv(16, 65537, vec![40, 40])).unwrap());
        let b = bare.encrypt_int(3).unwrap();
        b.relinearized().unwrap();
        let err = b.mul(&b).unwrap().relinearized().unwrap_err();
        assert!(matches!(err, HeError::MissingKey { key: KeyKind::Relin, .. }));
    }

    #[test]
    fn test_power() {
        let ctx = bfv_ctx();
        let a = ctx.encrypt_int(3).unwrap();
        assert_eq!(ctx.decrypt_int(&a.power(5).unwrap()).unwrap(), 243);
        assert_eq!(ctx.decrypt_int(&a.power(1).unwrap()).unwrap(), 3);
        assert_eq!(a.power(4).unwrap().size(), 2);
        assert!(matches!(a.power(0), Err(HeError::InvalidExponent { exponent: 0, .. })));
        assert!(matches!(a.power(-2), Err(HeError::InvalidExponent { .. })));

        let ckks = ckks_ctx();
        let c = ckks.encrypt_frac(&[1.5]).unwrap();
        assert!((ckks.decrypt_frac(&c.power(2).unwrap()).unwrap()[0] - 2.25).abs() < 1e-4);
        assert!(matches!(c.power(3), Err(HeError::UnsupportedOperation { .. })));
    }

    #[test]
    fn test_rotate_wraps_per_row() {
        let ctx = bfv_ctx();
        let a = ctx.encrypt_batch(&[1, 2, 3, 4, 5, 6]).unwrap();
        let r = a.rotate(2).unwrap();
        assert_eq!(&ctx.decrypt_batch(&r).unwrap()[..8], &[3, 4, 5, 6, 0, 0, 1, 2]);
        let back = r.rotate(-2).unwrap();
        assert_eq!(&ctx.decrypt_batch(&back).unwrap()[..6], &[1, 2, 3, 4, 5, 6]);
        let same = a.rotate(8).unwrap();
        assert_eq!(ctx.decrypt_batch(&same).unwrap(), ctx.decrypt_batch(&a).unwrap());
    }

    #[test]
    fn test_rotate_rejects_integer_encoding() {
        let ctx = bfv_ctx();
        let a = ctx.encrypt_int(1).unwrap();
        assert!(matches!(a.rotate(1), Err(HeError::UnsupportedOperation { op: "rotate", .. })));
    }

    #[test]
    fn test_flip_swaps_rows() {
        let ctx = bfv_ctx();
        let a = ctx.encrypt_batch(&[1, 2]).unwrap();
        let f = a.flip().unwrap();
        let v = ctx.decrypt_batch(&f).unwrap();
        assert_eq!(&v[8..10], &[1, 2]);
        assert_eq!(v[0], 0);
    }

    #[test]
    fn test_cumulative_add_bfv() {
        let ctx = bfv_ctx();
        let a = ctx.encrypt_batch(&[1, 2, 3, 4]).unwrap();
        let s = a.cumulative_add().unwrap();
        assert_eq!(ctx.decrypt_batch(&s).unwrap(), vec![10; 16]);
    }

    #[test]
    fn test_cumulative_add_missing_keys() {
        let params = ContextParams::bfv(16, 65537, vec![40, 40]);
        let engine = SimEngine::new(params).unwrap().with_rotation_steps(&[1, 2]).with_row_swap_key();
        let strict = Context::new(engine);
        let a = strict.encrypt_batch(&[1, 2, 3, 4]).unwrap();
        let calls = strict.engine().native_calls();
        let err = a.cumulative_add().unwrap_err();
        assert!(matches!(err, HeError::MissingKey { key: KeyKind::Rotation(4), .. }));
        assert_eq!(strict.engine().native_calls(), calls);

        let params = ContextParams::bfv(16, 65537, vec![40, 40]);
        let engine = SimEngine::new(params).unwrap().with_rotation_steps(&[1, 2]).with_row_swap_key();
        let policy = Policy { cumulative_mode: CumulativeMode::AllowPartial, ..Policy::default() };
        let partial = Context::new(engine).with_policy(policy);
        let a = partial.encrypt_batch(&[1, 2, 3, 4, 0, 0, 0, 5]).unwrap();
        let v = partial.decrypt_batch(&a.cumulative_add().unwrap()).unwrap();
        // windows of four slots per row, then both rows folded together
        assert_eq!(v[0], 10);
        assert_eq!(v[4], 5);
    }

    #[test]
    fn test_scalar_prod_ckks() {
        let ctx = ckks_ctx();
        let a = ctx.encrypt_frac(&[1.0, 2.0, 3.0]).unwrap();
        let b = ctx.encrypt_frac(&[4.0, 5.0, 6.0]).unwrap();
        let dot = a.scalar_prod(&b).unwrap();
        assert_eq!(dot.size(), 2);
        let v = ctx.decrypt_frac(&dot).unwrap();
        assert!(v.iter().all(|x| (x - 32.0).abs() < 1e-3));
    }

    #[test]
    fn test_rescale_and_mod_switch_limits() {
        let ctx = ckks_ctx();
        let mut a = ctx.encrypt_frac(&[1.0]).unwrap();
        a.rescale_to_next().unwrap();
        a.mod_switch_to_next().unwrap();
        assert_eq!(a.chain_level(), 2);
        assert!(matches!(a.rescale_to_next(), Err(HeError::ChainExhausted { .. })));
        assert!(matches!(a.mod_switch_to_next(), Err(HeError::ChainExhausted { .. })));

        let bfv = bfv_ctx();
        let mut b = bfv.encrypt_int(1).unwrap();
        assert!(matches!(b.rescale_to_next(), Err(HeError::UnsupportedOperation { .. })));
    }

    #[test]
    fn test_only_mod_leaves_scale_mismatch_to_engine() {
        let params = ContextParams::ckks(16, 2f64.powi(30), vec![60, 30, 30, 60]);
        let policy = Policy { align_mode: AlignMode::OnlyMod, ..Policy::default() };
        let ctx = Context::new(SimEngine::new(params).unwrap()).with_policy(policy);
        let a = ctx.encrypt_frac_with_scale(&[1.0], 2f64.powi(30)).unwrap();
        let b = ctx.encrypt_frac_with_scale(&[1.0], 2f64.powi(31)).unwrap();
        assert!(matches!(a.add(&b), Err(HeError::Engine { op: "add", .. })));
    }

    #[test]
    fn test_encoding_combines_to_complex() {
        let ctx = ckks_ctx();
        let a = ctx.encrypt_frac(&[1.0]).unwrap();
        let b = ctx.encrypt_complex(&[num_complex::Complex64::new(0.0, 2.0)]).unwrap();
        let c = a.add(&b).unwrap();
        assert_eq!(c.encoding(), EncodingTag::Complex);
        let z = ctx.decrypt_complex(&c).unwrap()[0];
        assert!((z.re - 1.0).abs() < 1e-4 && (z.im - 2.0).abs() < 1e-4);
    }
}
