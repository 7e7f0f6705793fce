//! he-dispatch: arithmetic dispatch and scale/modulus bookkeeping for BFV/BGV/CKKS
//!
//! Every plaintext and ciphertext carries its scheme, encoding, chain level
//! and (CKKS) scale. Operators check compatibility, promote scalars and arrays,
//! align CKKS operands and only then call into the [`Engine`].

#![forbid(unsafe_code)]
#![warn(clippy::pedantic, missing_docs)]

pub mod scheme;
pub mod state;
pub mod error;
pub mod engine;
pub mod params;
pub mod sim;
pub mod value;
pub mod plain;
pub mod cipher;
pub mod context;
pub mod promote;
pub mod align;
pub mod algebra;
pub mod io;

pub use align::{align_mod_n_scale, AlignPlan, AlignStep};
pub use algebra::BinaryOp;
pub use cipher::Ciphertext;
pub use context::{AlignMode, Context, CumulativeMode, Policy};
pub use engine::{Engine, KeyKind, SlotValues};
pub use error::{HeError, OperandInfo, Result};
pub use io::Tags;
pub use params::ContextParams;
pub use plain::Plaintext;
pub use promote::{promote, Operand, Promoted, Requirement};
pub use scheme::{EncodingTag, SchemeTag};
pub use sim::SimEngine;
pub use state::NumericState;
pub use value::OpaqueValue;
