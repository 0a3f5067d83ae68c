//! The tiling planner: derives a deterministic execution plan from shape and
//! dtype metadata alone, before any parallel work is launched.
//!
//! Planning never touches data values. Its product is a small fixed-size
//! [`TilingDescriptor`] record, serialized once on the host side and
//! deserialized by every compute unit; that record is the sole channel by
//! which planning results reach the engine, so its layout is a
//! correctness-critical contract rather than a style choice.

use crate::types::DType;
use log::debug;
use thiserror::Error;

/// Bulk row transfers require address/length alignment on this boundary.
/// Under-aligned transfers either fault or get split inefficiently, so row
/// widths are rounded up to a whole multiple before any staging buffer is
/// sized: 8 f32 elements or 16 f16 elements per 32 bytes.
pub const TRANSFER_ALIGN_BYTES: usize = 32;

/// Per-unit staging budget in bytes. A row must fit the staging buffers in a
/// single pass after alignment; multi-pass tiling of one row is out of scope.
pub const UNIT_STAGING_BYTES: usize = 192 * 1024;

/// Staging allocations per unit that scale with the aligned row length: two
/// slots for the held row, two for the streamed row, one reduction scratch.
const STAGING_BUFFERS_PER_UNIT: usize = 5;

/// Serialized size of a [`TilingDescriptor`]: six little-endian 4-byte fields.
pub const DESCRIPTOR_BYTES: usize = 24;

/// Tag identifying the Minkowski pdist tiling variant.
pub const VARIANT_MINKOWSKI: u32 = 1;

/// A comprehensive error type for configuration failures detected at planning
/// time. These are operator-setup failures: fatal, reported to the caller
/// before any parallel work is launched, never retried.
#[derive(Error, Debug)]
pub enum PlanError {
    #[error("platform capability descriptor unavailable: {0}")]
    PlatformUnavailable(String),

    #[error("compute unit count must be nonzero")]
    NoComputeUnits,

    #[error("Minkowski exponent must be non-negative and not NaN, got {0}")]
    InvalidExponent(f32),

    #[error("dimension {0} exceeds the descriptor's u32 range")]
    DimensionOverflow(usize),

    #[error(
        "aligned row of {aligned_row_len} elements overflows the {budget}-byte per-unit staging budget"
    )]
    RowExceedsStagingBudget {
        aligned_row_len: usize,
        budget: usize,
    },

    #[error("descriptor buffer holds {got} bytes but the tiling record needs {needed}")]
    DescriptorCapacity { needed: usize, got: usize },

    #[error("descriptor truncated: got {got} bytes, expected {expected}")]
    DescriptorTruncated { expected: usize, got: usize },

    #[error("unknown tiling variant tag {0}")]
    UnknownVariant(u32),
}

/// Capability descriptor for the machine the engine will run on.
///
/// Obtained once per operator invocation; a machine that cannot report its
/// compute-unit count is a configuration failure, not a data error.
#[derive(Debug, Clone, Copy)]
pub struct Platform {
    total_units: usize,
}

impl Platform {
    /// Queries the runtime for the number of available compute units.
    pub fn detect() -> Result<Self, PlanError> {
        let total_units = num_cpus::get();
        if total_units == 0 {
            return Err(PlanError::PlatformUnavailable(
                "runtime reported zero hardware compute units".to_string(),
            ));
        }
        Ok(Self { total_units })
    }

    /// Builds a platform descriptor with an explicit unit count, for callers
    /// that pin parallelism (the CLI `--units` override and the test suite).
    pub fn with_units(total_units: usize) -> Result<Self, PlanError> {
        if total_units == 0 {
            return Err(PlanError::NoComputeUnits);
        }
        Ok(Self { total_units })
    }

    #[inline]
    pub fn total_units(&self) -> usize {
        self.total_units
    }
}

/// The static distribution plan: everything a compute unit needs to know,
/// derived once from `(n, m, p, dtype)` and the platform capability.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Plan {
    pub n: u32,
    pub m: u32,
    pub p: f32,
    /// Row width rounded up to the transfer-alignment boundary, in elements
    /// of the input dtype. Invariant: `aligned_row_len >= m` and
    /// `aligned_row_len * element_bytes` is a multiple of 32.
    pub aligned_row_len: u32,
    /// Number of units that will do work. Collapses to 1 when `n` is smaller
    /// than the available unit count: multi-unit dispatch overhead is not
    /// worth paying for fewer rows than units.
    pub active_units: u32,
}

impl Plan {
    pub fn compute(
        n: usize,
        m: usize,
        p: f32,
        dtype: DType,
        platform: &Platform,
    ) -> Result<Self, PlanError> {
        if p.is_nan() || p < 0.0 {
            return Err(PlanError::InvalidExponent(p));
        }

        let n_u32 = u32::try_from(n).map_err(|_| PlanError::DimensionOverflow(n))?;
        let m_u32 = u32::try_from(m).map_err(|_| PlanError::DimensionOverflow(m))?;

        let element_bytes = dtype.element_bytes();
        let row_bytes = m * element_bytes;
        let aligned_row_bytes = row_bytes.div_ceil(TRANSFER_ALIGN_BYTES) * TRANSFER_ALIGN_BYTES;
        let aligned_row_len = aligned_row_bytes / element_bytes;

        // Staging holds rows at f32 compute precision, whatever the input dtype.
        let staging_bytes = STAGING_BUFFERS_PER_UNIT * aligned_row_len * size_of::<f32>();
        if staging_bytes > UNIT_STAGING_BYTES {
            return Err(PlanError::RowExceedsStagingBudget {
                aligned_row_len,
                budget: UNIT_STAGING_BYTES,
            });
        }

        let active_units = if n < platform.total_units {
            1
        } else {
            platform.total_units
        };
        let active_units = u32::try_from(active_units)
            .map_err(|_| PlanError::DimensionOverflow(active_units))?;

        let plan = Self {
            n: n_u32,
            m: m_u32,
            p,
            aligned_row_len: u32::try_from(aligned_row_len)
                .map_err(|_| PlanError::DimensionOverflow(aligned_row_len))?,
            active_units,
        };
        debug!(
            "tiling plan: n={} m={} p={} aligned_row_len={} active_units={}",
            plan.n, plan.m, plan.p, plan.aligned_row_len, plan.active_units
        );
        Ok(plan)
    }

    /// Serializes the plan into the capacity-bounded descriptor buffer.
    /// Returns the number of bytes written.
    pub fn serialize_into(&self, buf: &mut [u8]) -> Result<usize, PlanError> {
        if buf.len() < DESCRIPTOR_BYTES {
            return Err(PlanError::DescriptorCapacity {
                needed: DESCRIPTOR_BYTES,
                got: buf.len(),
            });
        }
        buf[0..4].copy_from_slice(&self.n.to_le_bytes());
        buf[4..8].copy_from_slice(&self.m.to_le_bytes());
        buf[8..12].copy_from_slice(&self.p.to_le_bytes());
        buf[12..16].copy_from_slice(&self.aligned_row_len.to_le_bytes());
        buf[16..20].copy_from_slice(&self.active_units.to_le_bytes());
        buf[20..24].copy_from_slice(&VARIANT_MINKOWSKI.to_le_bytes());
        Ok(DESCRIPTOR_BYTES)
    }
}

/// The engine-side view of the serialized plan. Field order and widths must
/// match [`Plan::serialize_into`] exactly; both sides live in this module so
/// the layout cannot drift apart silently.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TilingDescriptor {
    pub n: u32,
    pub m: u32,
    pub p: f32,
    pub aligned_row_len: u32,
    pub active_units: u32,
    pub variant_tag: u32,
}

impl TilingDescriptor {
    pub fn deserialize(buf: &[u8]) -> Result<Self, PlanError> {
        if buf.len() < DESCRIPTOR_BYTES {
            return Err(PlanError::DescriptorTruncated {
                expected: DESCRIPTOR_BYTES,
                got: buf.len(),
            });
        }
        let descriptor = Self {
            n: read_u32(buf, 0),
            m: read_u32(buf, 4),
            p: f32::from_le_bytes(buf[8..12].try_into().expect("4-byte field")),
            aligned_row_len: read_u32(buf, 12),
            active_units: read_u32(buf, 16),
            variant_tag: read_u32(buf, 20),
        };
        if descriptor.variant_tag != VARIANT_MINKOWSKI {
            return Err(PlanError::UnknownVariant(descriptor.variant_tag));
        }
        Ok(descriptor)
    }
}

#[inline]
fn read_u32(buf: &[u8], offset: usize) -> u32 {
    // Callers have already checked `buf.len() >= DESCRIPTOR_BYTES`.
    u32::from_le_bytes(buf[offset..offset + 4].try_into().expect("4-byte field"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plan(n: usize, m: usize, p: f32, dtype: DType, units: usize) -> Plan {
        Plan::compute(n, m, p, dtype, &Platform::with_units(units).unwrap()).unwrap()
    }

    #[test]
    fn row_alignment_rounds_up_to_the_transfer_boundary() {
        // 5 f32 elements are 20 bytes; one 32-byte transfer holds 8 elements.
        assert_eq!(plan(10, 5, 2.0, DType::F32, 4).aligned_row_len, 8);
        // 5 f16 elements are 10 bytes; one 32-byte transfer holds 16 elements.
        assert_eq!(plan(10, 5, 2.0, DType::F16, 4).aligned_row_len, 16);
        // 8 f32 elements are exactly 32 bytes: already aligned, no padding.
        assert_eq!(plan(10, 8, 2.0, DType::F32, 4).aligned_row_len, 8);
    }

    #[test]
    fn small_row_counts_collapse_to_a_single_unit() {
        assert_eq!(plan(3, 64, 2.0, DType::F32, 8).active_units, 1);
        assert_eq!(plan(3, 1, 0.5, DType::F16, 8).active_units, 1);
        assert_eq!(plan(7, 16, 1.0, DType::F32, 8).active_units, 1);
        // At or above the unit count, every unit participates.
        assert_eq!(plan(8, 16, 2.0, DType::F32, 8).active_units, 8);
        assert_eq!(plan(100, 16, 2.0, DType::F32, 8).active_units, 8);
    }

    #[test]
    fn malformed_exponents_are_configuration_failures() {
        let platform = Platform::with_units(4).unwrap();
        assert!(matches!(
            Plan::compute(4, 4, f32::NAN, DType::F32, &platform),
            Err(PlanError::InvalidExponent(_))
        ));
        assert!(matches!(
            Plan::compute(4, 4, -1.0, DType::F32, &platform),
            Err(PlanError::InvalidExponent(_))
        ));
        // Infinity is a legal exponent (Chebyshev).
        assert!(Plan::compute(4, 4, f32::INFINITY, DType::F32, &platform).is_ok());
    }

    #[test]
    fn rows_wider_than_the_staging_budget_are_rejected() {
        let platform = Platform::with_units(4).unwrap();
        let too_wide = UNIT_STAGING_BYTES; // 192Ki f32 elements, far past the budget
        assert!(matches!(
            Plan::compute(4, too_wide, 2.0, DType::F32, &platform),
            Err(PlanError::RowExceedsStagingBudget { .. })
        ));
    }

    #[test]
    fn descriptor_round_trips_through_the_wire_layout() {
        let plan = plan(100, 37, 3.5, DType::F16, 8);
        let mut buf = [0u8; DESCRIPTOR_BYTES];
        assert_eq!(plan.serialize_into(&mut buf).unwrap(), DESCRIPTOR_BYTES);

        let descriptor = TilingDescriptor::deserialize(&buf).unwrap();
        assert_eq!(descriptor.n, plan.n);
        assert_eq!(descriptor.m, plan.m);
        assert_eq!(descriptor.p, plan.p);
        assert_eq!(descriptor.aligned_row_len, plan.aligned_row_len);
        assert_eq!(descriptor.active_units, plan.active_units);
        assert_eq!(descriptor.variant_tag, VARIANT_MINKOWSKI);
    }

    #[test]
    fn undersized_buffers_fail_on_both_sides_of_the_contract() {
        let plan = plan(10, 5, 2.0, DType::F32, 2);
        let mut short = [0u8; DESCRIPTOR_BYTES - 1];
        assert!(matches!(
            plan.serialize_into(&mut short),
            Err(PlanError::DescriptorCapacity { .. })
        ));
        assert!(matches!(
            TilingDescriptor::deserialize(&short),
            Err(PlanError::DescriptorTruncated { .. })
        ));
    }

    #[test]
    fn unknown_variant_tags_are_rejected() {
        let plan = plan(10, 5, 2.0, DType::F32, 2);
        let mut buf = [0u8; DESCRIPTOR_BYTES];
        plan.serialize_into(&mut buf).unwrap();
        buf[20..24].copy_from_slice(&7u32.to_le_bytes());
        assert!(matches!(
            TilingDescriptor::deserialize(&buf),
            Err(PlanError::UnknownVariant(7))
        ));
    }

    #[test]
    fn zero_unit_platforms_are_rejected() {
        assert!(matches!(
            Platform::with_units(0),
            Err(PlanError::NoComputeUnits)
        ));
        assert!(Platform::detect().unwrap().total_units() >= 1);
    }
}
