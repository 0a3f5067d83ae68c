//! The operator surface: attribute defaults, the shape-inference contract and
//! the end-to-end plan → serialize → launch orchestration.

use crate::engine::{self, EngineError};
use crate::plan::{DESCRIPTOR_BYTES, Plan, PlanError, Platform};
use crate::types::Element;
use thiserror::Error;

/// The Minkowski exponent attribute is optional; absent means Euclidean.
pub const DEFAULT_EXPONENT: f32 = 2.0;

/// Graph-construction failures: detected during shape inference, before any
/// planning or data movement.
#[derive(Error, Debug)]
pub enum ShapeError {
    #[error("input must be 2-D, got rank {0}")]
    Rank(usize),

    #[error("row width must be nonzero")]
    ZeroWidth,

    #[error("pair count for {0} rows overflows the output index range")]
    PairCountOverflow(usize),
}

/// Union of everything a full operator invocation can report.
#[derive(Error, Debug)]
pub enum OperatorError {
    #[error(transparent)]
    Shape(#[from] ShapeError),

    #[error(transparent)]
    Plan(#[from] PlanError),

    #[error(transparent)]
    Engine(#[from] EngineError),
}

/// Shape inference: `[n, m]` in, `[n * (n - 1) / 2]` out.
pub fn infer_output_len(shape: &[usize]) -> Result<usize, ShapeError> {
    let &[n, m] = shape else {
        return Err(ShapeError::Rank(shape.len()));
    };
    if m == 0 {
        return Err(ShapeError::ZeroWidth);
    }
    if n < 2 {
        return Ok(0);
    }
    n.checked_mul(n - 1)
        .map(|pairs| pairs / 2)
        .ok_or(ShapeError::PairCountOverflow(n))
}

/// Computes the condensed pairwise distance vector end to end: infers the
/// output shape, plans the tiling, serializes the descriptor and launches the
/// parallel engine into a freshly allocated output.
pub fn run<T: Element>(
    x: &[T],
    n: usize,
    m: usize,
    p: Option<f32>,
    platform: &Platform,
) -> Result<Vec<T>, OperatorError> {
    let out_len = infer_output_len(&[n, m])?;
    let p = p.unwrap_or(DEFAULT_EXPONENT);

    let plan = Plan::compute(n, m, p, T::DTYPE, platform)?;
    let mut descriptor = [0u8; DESCRIPTOR_BYTES];
    plan.serialize_into(&mut descriptor)?;

    let mut y = vec![T::from_f32(0.0); out_len];
    engine::launch(x, &mut y, &mut [], &descriptor)?;
    Ok(y)
}
