// ========================================================================================
//
//                      CORE DATA TYPES FOR THE PAIRDIST ENGINE
//
// ========================================================================================
//
// This module is the canonical dictionary for the types and layout rules shared across
// the architectural boundaries of the crate (`plan`, `engine`, `kernel`, `reference`).
// High-level modules depend on these definitions, never on each other's internals.

use half::f16;

// ========================================================================================
//                              ELEMENT TYPE ABSTRACTION
// ========================================================================================

/// The element type of an input or output tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DType {
    F32,
    F16,
}

impl DType {
    /// Width of one element in bytes, as laid out in the caller's matrix.
    #[inline]
    pub fn element_bytes(self) -> usize {
        match self {
            DType::F32 => 4,
            DType::F16 => 2,
        }
    }
}

/// An element the engine can stage and reduce.
///
/// All arithmetic happens at f32 compute precision regardless of the storage
/// type; conversions live here so the kernel never branches on the dtype.
pub trait Element: Copy + Send + Sync + 'static {
    const DTYPE: DType;

    fn to_f32(self) -> f32;
    fn from_f32(v: f32) -> Self;

    /// Widening used only by the scalar reference oracle.
    #[inline]
    fn to_f64(self) -> f64 {
        self.to_f32() as f64
    }
}

impl Element for f32 {
    const DTYPE: DType = DType::F32;

    #[inline]
    fn to_f32(self) -> f32 {
        self
    }

    #[inline]
    fn from_f32(v: f32) -> Self {
        v
    }
}

impl Element for f16 {
    const DTYPE: DType = DType::F16;

    #[inline]
    fn to_f32(self) -> f32 {
        f16::to_f32(self)
    }

    #[inline]
    fn from_f32(v: f32) -> Self {
        f16::from_f32(v)
    }
}

// ========================================================================================
//                          CONDENSED TRIANGULAR LAYOUT
// ========================================================================================

/// Number of entries in the condensed upper-triangular distance vector for `n` rows.
#[inline]
pub fn condensed_len(n: usize) -> usize {
    if n < 2 { 0 } else { n * (n - 1) / 2 }
}

/// Flat offset of the unordered pair `(i, j)`, `i < j`, within an `n`-row
/// condensed layout.
///
/// The first term counts every pair involving a row `< i`; the second is the
/// pair's position inside row `i`'s own run. This is the single place where
/// row-major pair enumeration maps to a flat array: every writer and every
/// reader of the output vector goes through it.
#[inline]
pub fn condensed_offset(n: usize, i: usize, j: usize) -> usize {
    debug_assert!(i < j && j < n, "invalid condensed pair ({i}, {j}) for n={n}");
    let (n, i, j) = (n as u64, i as u64, j as u64);
    ((2 * n - 1 - i) * i / 2 + (j - i - 1)) as usize
}
