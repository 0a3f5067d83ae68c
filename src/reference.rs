//! The scalar reference oracle.
//!
//! A deliberately naive, double-precision pdist used by the verification
//! harness and the parity tests as the source of truth. It shares nothing
//! with the parallel engine beyond the condensed pair ordering: no staging,
//! no alignment, no epsilon guard, and the complete Minkowski formula
//! (including the `^(1/p)` root and the Chebyshev max-loop) throughout.

use crate::types::{Element, condensed_len};

/// Computes the condensed pairwise Minkowski distance vector in scalar f64.
///
/// # Panics
/// Panics if `x.len() != n * m`. The oracle is harness-side code; a shape
/// mismatch here is a bug in the test, not a recoverable condition.
pub fn pdist<T: Element>(x: &[T], n: usize, m: usize, p: f32) -> Vec<T> {
    assert_eq!(x.len(), n * m, "oracle input shape mismatch");

    let mut out = Vec::with_capacity(condensed_len(n));
    let p = p as f64;
    for i in 0..n {
        let row_i = &x[i * m..(i + 1) * m];
        for j in (i + 1)..n {
            let row_j = &x[j * m..(j + 1) * m];
            let result = if p.is_infinite() {
                row_i
                    .iter()
                    .zip(row_j)
                    .map(|(&a, &b)| (a.to_f64() - b.to_f64()).abs())
                    .fold(0.0f64, f64::max)
            } else {
                let sum: f64 = row_i
                    .iter()
                    .zip(row_j)
                    .map(|(&a, &b)| (a.to_f64() - b.to_f64()).abs().powf(p))
                    .sum();
                sum.powf(1.0 / p)
            };
            out.push(T::from_f32(result as f32));
        }
    }
    out
}
