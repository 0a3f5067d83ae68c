// ========================================================================================
//
//                        THE MINKOWSKI REDUCTION KERNEL
//
// ========================================================================================
//
// The pure computational heart of the engine: given two staged rows, produce one
// scalar. Everything here is branch-per-exponent, elementwise-then-reduce, written
// as dense loops over the full aligned row so the compiler can vectorize them.
//
// Padding discipline: staged rows are zero-filled past `m`, which is neutral for
// the sum, square-sum and max reductions. The general-exponent path is the one
// exception, since `(0 + ε)^p` is not negligible for small `p`; that branch zeroes
// the transformed padding region explicitly before reducing. See `reduce_pair`.

/// Additive guard applied before the logarithm on the general-exponent path.
/// Exactly-equal coordinates produce `d = 0`, and `ln(0) = -inf` would poison
/// the reduction with NaN; the guard trades a tiny deterministic bias for
/// keeping the pipeline NaN-free.
pub const LOG_EPSILON: f32 = 1e-20;

/// Reduces a staged row pair to a single scalar.
///
/// For `p == 1`, `p == 2` and `p == +inf` the returned value is the finished
/// distance. For the general finite exponent the value is the *unrooted* sum
/// `Σ|d|^p`, computed via the identity `d^p = exp(p · ln(d))`; the deferred
/// `^(1/p)` root is applied later by [`finalize`] at scalar write-back.
///
/// `row_i`, `row_j` and `scratch` all have the aligned row length; `m` is the
/// raw row width, used only to locate the padding region.
pub fn reduce_pair(row_i: &[f32], row_j: &[f32], m: usize, p: f32, scratch: &mut [f32]) -> f32 {
    debug_assert_eq!(row_i.len(), row_j.len());
    debug_assert_eq!(row_i.len(), scratch.len());
    debug_assert!(m <= row_i.len());

    // d = |row_i - row_j| over the full aligned length.
    for ((d, &a), &b) in scratch.iter_mut().zip(row_i).zip(row_j) {
        *d = (a - b).abs();
    }

    if p == 1.0 {
        reduce_sum(scratch)
    } else if p == 2.0 {
        let sum: f32 = scratch.iter().map(|&d| d * d).sum();
        sum.sqrt()
    } else if p.is_infinite() {
        reduce_max(scratch)
    } else {
        // d^p = exp(p * ln(d + eps)), elementwise.
        for d in scratch.iter_mut() {
            *d = ((*d + LOG_EPSILON).ln() * p).exp();
        }
        // Transformed padding is not zero (eps^p), so neutralize it before
        // the horizontal sum.
        scratch[m..].fill(0.0);
        reduce_sum(scratch)
    }
}

/// Applies the deferred root to a general-exponent reduction. Identity for the
/// exponents whose reductions are already complete distances.
#[inline]
pub fn finalize(reduced: f32, p: f32) -> f32 {
    if p == 1.0 || p == 2.0 || p.is_infinite() {
        reduced
    } else {
        reduced.powf(p.recip())
    }
}

#[inline]
fn reduce_sum(values: &[f32]) -> f32 {
    values.iter().sum()
}

#[inline]
fn reduce_max(values: &[f32]) -> f32 {
    values.iter().fold(0.0f32, |acc, &d| acc.max(d))
}
