//! Error type shared by every operation in the crate.

use crate::engine::KeyKind;
use crate::scheme::{EncodingTag, SchemeTag};
use crate::state::NumericState;
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// Metadata snapshot of an offending operand, attached to every operand error.
#[derive(Clone, Debug, PartialEq)]
pub struct OperandInfo {
    /// Scheme tag.
    pub scheme: SchemeTag,
    /// Encoding tag.
    pub encoding: EncodingTag,
    /// Level and scale.
    pub state: NumericState,
    /// 0 for plaintexts.
    pub size: u32,
}

impl fmt::Display for OperandInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{} {} {}", self.scheme, self.encoding, self.state)?;
        if self.size > 0 {
            write!(f, ", size {}", self.size)?;
        }
        f.write_str("]")
    }
}

/// Everything that can go wrong in this crate.
#[derive(Debug, Error)]
pub enum HeError {
    /// Operands of different schemes were combined.
    #[error("scheme mismatch: {lhs} combined with {rhs}")]
    SchemeMismatch { lhs: OperandInfo, rhs: OperandInfo },

    /// Operand encodings cannot be combined.
    #[error("encoding mismatch: {lhs} combined with {rhs}")]
    EncodingMismatch { lhs: OperandInfo, rhs: OperandInfo },

    /// Decode requested under an encoding the value does not carry.
    #[error("cannot decode {operand} as {requested}")]
    UnsupportedDecode {
        requested: EncodingTag,
        operand: OperandInfo,
    },

    /// The context lacks a key the operation needs.
    #[error("missing {key} key for {op}")]
    MissingKey { key: KeyKind, op: &'static str },

    /// Alignment found no sequence of steps reconciling the scales.
    #[error("cannot align {lhs} with {rhs}: {reason}")]
    ScaleAlignmentImpossible {
        lhs: OperandInfo,
        rhs: OperandInfo,
        reason: String,
    },

    /// More values than the encoding has slots.
    #[error("{len} values exceed the capacity of {capacity} slots")]
    CapacityExceeded { len: usize, capacity: usize },

    /// Scale not finite or not positive.
    #[error("invalid scale {0}")]
    InvalidScale(f64),

    /// Exponent outside the supported range.
    #[error("invalid exponent {exponent} for {operand}")]
    InvalidExponent { exponent: i64, operand: OperandInfo },

    /// Tag change on a value that already holds a handle.
    #[error("illegal state transition on {operand}: {reason}")]
    IllegalStateTransition {
        operand: OperandInfo,
        reason: &'static str,
    },

    /// Operation not defined for this operand.
    #[error("unsupported {op} on {operand}: {reason}")]
    UnsupportedOperation {
        op: &'static str,
        operand: OperandInfo,
        reason: String,
    },

    /// No prime left to drop.
    #[error("modulus chain exhausted for {operand} (chain length {chain_length})")]
    ChainExhausted {
        operand: OperandInfo,
        chain_length: u32,
    },

    /// Operation on an empty value.
    #[error("{op} requires a non-empty value")]
    EmptyValue { op: &'static str },

    /// Operation on a value not bound to a context.
    #[error("{op} requires a value attached to a context")]
    DetachedValue { op: &'static str },

    /// Parameter set rejected by validation.
    #[error("invalid parameters: {0}")]
    InvalidParams(String),

    /// Load path does not exist.
    #[error("file not found: {}", .0.display())]
    FileNotFound(PathBuf),

    /// Stored header is malformed or contradicts the caller's tags.
    #[error("header mismatch: {0}")]
    HeaderMismatch(String),

    /// Failure reported by the engine.
    #[error("native engine error in {op}: {reason}")]
    Engine { op: &'static str, reason: String },

    /// Engine blob could not be (de)serialized.
    #[error("codec error: {0}")]
    Codec(#[from] bincode::Error),

    /// Parameter file could not be parsed.
    #[error("config error: {0}")]
    Config(#[from] serde_json::Error),

    /// Underlying I/O failure.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, HeError>;

impl HeError {
    pub(crate) fn engine(op: &'static str, reason: impl Into<String>) -> Self {
        HeError::Engine { op, reason: reason.into() }
    }

    pub(crate) fn unsupported(op: &'static str, operand: OperandInfo, reason: impl Into<String>) -> Self {
        HeError::UnsupportedOperation { op, operand, reason: reason.into() }
    }
}
