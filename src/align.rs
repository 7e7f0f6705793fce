//! CKKS alignment protocol.
//!
//! Two operands of an additive CKKS operation must sit at the same chain level
//! with the same scale. Alignment is done in two phases: [`plan_alignment`]
//! works on metadata only and either produces the full list of steps or fails,
//! then [`execute`] replays the steps against the values. Nothing native runs
//! for a plan that fails.
//!
//! Steps available, in order of preference:
//!
//! * mod-switch the shallower operand (level only, scale untouched);
//! * override the scale when the two agree within tolerance (rounding drift);
//! * re-encode a plaintext side at the other side's exact scale;
//! * rescale the larger-scale ciphertext when the dropped prime does not
//!   push it below the other scale;
//! * lift the smaller-scale ciphertext by an integer factor `k >= 2`
//!   (multiply by `1` encoded at scale `k`, no level consumed).

use crate::cipher::Ciphertext;
use crate::context::{AlignMode, Context};
use crate::engine::{Engine, SlotValues};
use crate::error::{HeError, OperandInfo, Result};
use crate::plain::Plaintext;
use crate::promote::Promoted;
use crate::scheme::SchemeTag;
use crate::state::scales_close;
use crate::value::OpaqueValue;
use std::borrow::Cow;
use tracing::{debug, instrument, warn};

/// Operand an alignment step applies to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Side {
    /// Receiver.
    Lhs,
    /// Right-hand operand.
    Rhs,
}

impl Side {
    fn other(self) -> Side {
        match self {
            Side::Lhs => Side::Rhs,
            Side::Rhs => Side::Lhs,
        }
    }

    fn index(self) -> usize {
        match self {
            Side::Lhs => 0,
            Side::Rhs => 1,
        }
    }
}

/// One planned alignment action.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum AlignStep {
    /// Drop one prime, scale untouched.
    ModSwitch(Side),
    /// Divide the scale by the dropped prime.
    Rescale(Side),
    /// Multiply by 1 encoded at scale `factor`.
    Lift { side: Side, factor: f64 },
    /// Encode the plaintext again at `scale`.
    Reencode { side: Side, scale: f64 },
    /// Record `scale` without touching the payload.
    OverrideScale { side: Side, scale: f64 },
}

/// How far alignment goes after levels agree.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ScaleRule {
    /// Scales must agree; failure is fatal.
    Match,
    /// Levels only; scales are irrelevant (multiplication, integer schemes).
    Ignore,
    /// Levels only; a remaining scale mismatch is reported, not fixed.
    OnlyMod,
}

impl From<AlignMode> for ScaleRule {
    fn from(mode: AlignMode) -> Self {
        match mode {
            AlignMode::Full => ScaleRule::Match,
            AlignMode::OnlyMod => ScaleRule::OnlyMod,
        }
    }
}

/// What planning needs to know about one operand.
#[derive(Clone, Debug)]
pub struct AlignView {
    /// Tags and state.
    pub info: OperandInfo,
    /// Ciphertexts cannot be re-encoded.
    pub is_cipher: bool,
}

/// Steps to replay, in order.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct AlignPlan {
    /// Steps in execution order.
    pub steps: Vec<AlignStep>,
    /// Set only under [`ScaleRule::OnlyMod`] when scales still differ.
    pub scale_mismatch: bool,
}

impl AlignPlan {
    /// Nothing to do and nothing left mismatched.
    pub fn is_noop(&self) -> bool {
        self.steps.is_empty() && !self.scale_mismatch
    }
}

/// Plan the steps that bring `lhs` and `rhs` to a common level and scale.
///
/// `chain_prime(level)` is the prime dropped when rescaling away from `level`.
pub fn plan_alignment(
    lhs: &AlignView,
    rhs: &AlignView,
    chain_length: u32,
    chain_prime: impl Fn(u32) -> Option<u64>,
    rule: ScaleRule,
    tol: f64,
) -> Result<AlignPlan> {
    let views = [lhs, rhs];
    let mut level = [lhs.info.state.chain_level(), rhs.info.state.chain_level()];
    let mut scale = [lhs.info.state.scale(), rhs.info.state.scale()];
    let mut plan = AlignPlan::default();
    let impossible = |reason: String| HeError::ScaleAlignmentImpossible {
        lhs: lhs.info.clone(),
        rhs: rhs.info.clone(),
        reason,
    };

    let rounds = 2 * chain_length + 2;
    for _ in 0..rounds {
        while level[0] != level[1] {
            let shallow = if level[0] < level[1] { Side::Lhs } else { Side::Rhs };
            plan.steps.push(AlignStep::ModSwitch(shallow));
            level[shallow.index()] += 1;
        }

        let (a, b) = match (scale[0], scale[1], rule) {
            (Some(a), Some(b), ScaleRule::Match | ScaleRule::OnlyMod) => (a, b),
            _ => return Ok(plan),
        };
        if a == b {
            return Ok(plan);
        }
        if scales_close(a, b, tol) {
            let side = if !lhs.is_cipher && rhs.is_cipher { Side::Lhs } else { Side::Rhs };
            let target = scale[side.other().index()].unwrap_or(a);
            plan.steps.push(AlignStep::OverrideScale { side, scale: target });
            return Ok(plan);
        }
        if rule == ScaleRule::OnlyMod {
            plan.scale_mismatch = true;
            return Ok(plan);
        }

        if !rhs.is_cipher {
            plan.steps.push(AlignStep::Reencode { side: Side::Rhs, scale: a });
            return Ok(plan);
        }
        if !lhs.is_cipher {
            plan.steps.push(AlignStep::Reencode { side: Side::Lhs, scale: b });
            return Ok(plan);
        }

        let (big, small) = if a > b { (Side::Lhs, Side::Rhs) } else { (Side::Rhs, Side::Lhs) };
        let s_big = scale[big.index()].unwrap_or(1.0);
        let s_small = scale[small.index()].unwrap_or(1.0);

        if let Some(q) = chain_prime(level[big.index()]) {
            let rescaled = s_big / q as f64;
            if rescaled >= s_small * (1.0 - tol) {
                plan.steps.push(AlignStep::Rescale(big));
                scale[big.index()] = Some(rescaled);
                level[big.index()] += 1;
                continue;
            }
        }

        let ratio = s_big / s_small;
        let k = ratio.round();
        if k >= 2.0 && scales_close(ratio, k, tol) {
            plan.steps.push(AlignStep::Lift { side: small, factor: k });
            scale[small.index()] = Some(s_small * k);
            continue;
        }

        let reason = match chain_prime(level[big.index()]) {
            None => format!("modulus chain exhausted at level {}", level[big.index()]),
            Some(q) => format!(
                "scale 2^{:.2} cannot reach 2^{:.2}: rescaling by a {}-bit prime overshoots and the ratio {:.4} is not an integer",
                s_big.log2(),
                s_small.log2(),
                64 - q.leading_zeros(),
                ratio
            ),
        };
        debug!(?views, "alignment impossible");
        return Err(impossible(reason));
    }
    Err(impossible(format!("no fixed point after {} rounds", rounds)))
}

/// A value the alignment steps can be applied to.
pub trait AlignTarget<'ctx, E: Engine> {
    /// Metadata the planner works on.
    fn view(&self) -> AlignView;
    /// Context of a non-empty, attached value.
    fn align_context(&self) -> Result<&'ctx Context<E>>;
    /// See [`AlignStep::ModSwitch`].
    fn mod_switch(&mut self) -> Result<()>;
    /// See [`AlignStep::Rescale`].
    fn rescale(&mut self) -> Result<()>;
    /// See [`AlignStep::Lift`].
    fn lift(&mut self, factor: f64) -> Result<()>;
    /// See [`AlignStep::Reencode`].
    fn reencode(&mut self, scale: f64) -> Result<()>;
    /// See [`AlignStep::OverrideScale`].
    fn override_scale(&mut self, scale: f64) -> Result<()>;
}

impl<'ctx, E: Engine> AlignTarget<'ctx, E> for Ciphertext<'ctx, E> {
    fn view(&self) -> AlignView {
        AlignView { info: self.info(), is_cipher: true }
    }

    fn align_context(&self) -> Result<&'ctx Context<E>> {
        self.require("align")
    }

    fn mod_switch(&mut self) -> Result<()> {
        self.mod_switch_to_next()
    }

    fn rescale(&mut self) -> Result<()> {
        self.rescale_to_next()
    }

    fn lift(&mut self, factor: f64) -> Result<()> {
        let ctx = self.require("lift")?;
        let scale = self.scale().ok_or_else(|| {
            HeError::unsupported("lift", self.info(), "only CKKS values carry a scale")
        })?;
        let n = ctx.engine().capacity(self.encoding());
        let one = ctx.encode_at_level(SlotValues::Real(vec![1.0; n]), self.encoding(), Some(factor), self.chain_level())?;
        let handle = one.handle.as_ref().ok_or(HeError::EmptyValue { op: "lift" })?;
        ctx.engine().mul_plain(self.handle_mut("lift")?, handle)?;
        self.meta.state_mut().set_scale(scale * factor)?;
        self.debug_check_native();
        Ok(())
    }

    fn reencode(&mut self, _scale: f64) -> Result<()> {
        Err(HeError::unsupported("reencode", self.info(), "ciphertexts cannot be re-encoded"))
    }

    fn override_scale(&mut self, scale: f64) -> Result<()> {
        Ciphertext::override_scale(self, scale)
    }
}

impl<'ctx, E: Engine> AlignTarget<'ctx, E> for Plaintext<'ctx, E> {
    fn view(&self) -> AlignView {
        AlignView { info: self.info(), is_cipher: false }
    }

    fn align_context(&self) -> Result<&'ctx Context<E>> {
        self.require("align")
    }

    fn mod_switch(&mut self) -> Result<()> {
        self.mod_switch_to_next()
    }

    fn rescale(&mut self) -> Result<()> {
        Err(HeError::unsupported("rescale", self.info(), "plaintexts are re-encoded, not rescaled"))
    }

    fn lift(&mut self, _factor: f64) -> Result<()> {
        Err(HeError::unsupported("lift", self.info(), "plaintexts are re-encoded, not lifted"))
    }

    fn reencode(&mut self, scale: f64) -> Result<()> {
        Plaintext::reencode(self, scale)
    }

    fn override_scale(&mut self, scale: f64) -> Result<()> {
        Plaintext::override_scale(self, scale)
    }
}

/// A borrowed value is copied on first write, leaving the caller's value untouched.
impl<'ctx, E: Engine, T: AlignTarget<'ctx, E> + Clone> AlignTarget<'ctx, E> for Cow<'_, T> {
    fn view(&self) -> AlignView {
        T::view(self)
    }

    fn align_context(&self) -> Result<&'ctx Context<E>> {
        T::align_context(self)
    }

    fn mod_switch(&mut self) -> Result<()> {
        T::mod_switch(self.to_mut())
    }

    fn rescale(&mut self) -> Result<()> {
        T::rescale(self.to_mut())
    }

    fn lift(&mut self, factor: f64) -> Result<()> {
        T::lift(self.to_mut(), factor)
    }

    fn reencode(&mut self, scale: f64) -> Result<()> {
        T::reencode(self.to_mut(), scale)
    }

    fn override_scale(&mut self, scale: f64) -> Result<()> {
        T::override_scale(self.to_mut(), scale)
    }
}

impl<'o, 'ctx, E: Engine> AlignTarget<'ctx, E> for Promoted<'o, 'ctx, E> {
    fn view(&self) -> AlignView {
        match self {
            Promoted::Cipher(c) => c.view(),
            Promoted::Plain(p) => p.view(),
        }
    }

    fn align_context(&self) -> Result<&'ctx Context<E>> {
        match self {
            Promoted::Cipher(c) => c.align_context(),
            Promoted::Plain(p) => p.align_context(),
        }
    }

    fn mod_switch(&mut self) -> Result<()> {
        match self {
            Promoted::Cipher(c) => AlignTarget::mod_switch(c),
            Promoted::Plain(p) => AlignTarget::mod_switch(p),
        }
    }

    fn rescale(&mut self) -> Result<()> {
        match self {
            Promoted::Cipher(c) => AlignTarget::rescale(c),
            Promoted::Plain(p) => AlignTarget::rescale(p),
        }
    }

    fn lift(&mut self, factor: f64) -> Result<()> {
        match self {
            Promoted::Cipher(c) => AlignTarget::lift(c, factor),
            Promoted::Plain(p) => AlignTarget::lift(p, factor),
        }
    }

    fn reencode(&mut self, scale: f64) -> Result<()> {
        match self {
            Promoted::Cipher(c) => AlignTarget::reencode(c, scale),
            Promoted::Plain(p) => AlignTarget::reencode(p, scale),
        }
    }

    fn override_scale(&mut self, scale: f64) -> Result<()> {
        match self {
            Promoted::Cipher(c) => AlignTarget::override_scale(c, scale),
            Promoted::Plain(p) => AlignTarget::override_scale(p, scale),
        }
    }
}

/// Replay `plan` on `x` (left) and `y` (right).
pub fn execute<'ctx, E, X, Y>(plan: &AlignPlan, x: &mut X, y: &mut Y) -> Result<()>
where
    E: Engine,
    X: AlignTarget<'ctx, E> + ?Sized,
    Y: AlignTarget<'ctx, E> + ?Sized,
{
    fn apply<'ctx, E: Engine, T: AlignTarget<'ctx, E> + ?Sized>(t: &mut T, step: AlignStep) -> Result<()> {
        match step {
            AlignStep::ModSwitch(_) => t.mod_switch(),
            AlignStep::Rescale(_) => t.rescale(),
            AlignStep::Lift { factor, .. } => t.lift(factor),
            AlignStep::Reencode { scale, .. } => t.reencode(scale),
            AlignStep::OverrideScale { scale, .. } => t.override_scale(scale),
        }
    }
    for &step in &plan.steps {
        let side = match step {
            AlignStep::ModSwitch(s) | AlignStep::Rescale(s) => s,
            AlignStep::Lift { side, .. }
            | AlignStep::Reencode { side, .. }
            | AlignStep::OverrideScale { side, .. } => side,
        };
        debug!(?step, "align");
        match side {
            Side::Lhs => apply(x, step)?,
            Side::Rhs => apply(y, step)?,
        }
    }
    Ok(())
}

/// Plan under `rule` with `ctx`'s chain, log the outcome and execute.
pub(crate) fn align_with<'ctx, E, X, Y>(
    ctx: &'ctx Context<E>,
    x: &mut X,
    y: &mut Y,
    rule: ScaleRule,
) -> Result<AlignPlan>
where
    E: Engine,
    X: AlignTarget<'ctx, E> + ?Sized,
    Y: AlignTarget<'ctx, E> + ?Sized,
{
    let (xv, yv) = (x.view(), y.view());
    let engine = ctx.engine();
    let plan = plan_alignment(
        &xv,
        &yv,
        ctx.chain_length(),
        |level| engine.chain_prime(level),
        rule,
        ctx.policy().scale_tolerance,
    )?;
    if plan.scale_mismatch {
        warn!(lhs = %xv.info, rhs = %yv.info, "scales left mismatched (mod-only alignment)");
    }
    execute(&plan, x, y)?;
    Ok(plan)
}

/// Bring `x` and `y` to a common chain level and, for CKKS, a common scale.
///
/// BFV/BGV values only have their levels aligned. Returns the plan that was
/// applied; aligning an already aligned pair is a no-op.
#[instrument(skip_all, fields(mode = ?mode))]
pub fn align_mod_n_scale<'ctx, E, X, Y>(x: &mut X, y: &mut Y, mode: AlignMode) -> Result<AlignPlan>
where
    E: Engine + 'ctx,
    X: AlignTarget<'ctx, E> + ?Sized,
    Y: AlignTarget<'ctx, E> + ?Sized,
{
    let ctx = x.align_context()?;
    y.align_context()?;
    let (xv, yv) = (x.view(), y.view());
    if xv.info.scheme != yv.info.scheme {
        return Err(HeError::SchemeMismatch { lhs: xv.info, rhs: yv.info });
    }
    let rule = match xv.info.scheme {
        SchemeTag::Ckks => ScaleRule::from(mode),
        _ => ScaleRule::Ignore,
    };
    align_with(ctx, x, y, rule)
}
