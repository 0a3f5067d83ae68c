// ========================================================================================
//
//              THE PARALLEL, WRITE-DISJOINT DISTANCE COMPUTATION ENGINE
//
// ========================================================================================
//
// This module runs the pdist work plan on a fixed-size pool of independent compute
// units. The partition is embarrassingly parallel by construction: unit `u` owns the
// cyclically assigned rows `{u, u + active_units, ...}` and enumerates every partner
// `j > i` for each owned row `i`, so each unordered pair (and therefore each slot of
// the condensed output) is produced by exactly one unit. No locks, no inter-unit
// channels, no shared mutable state.
//
// Within a unit, row `i` is staged once and held while row `j` streams through two
// staging slots cycling through a bounded ring (strict ping-pong, never more than
// one fetch ahead), the software shape of a double-buffered fetch/compute pipeline.

use crate::kernel;
use crate::plan::{PlanError, TilingDescriptor};
use crate::types::{Element, condensed_len, condensed_offset};
use crossbeam_channel::{Receiver, Sender, bounded};
use log::info;
use rayon::ThreadPoolBuilder;
use std::marker::PhantomData;
use thiserror::Error;

/// Physical staging slots per row stream. Two slots make the fetch/compute
/// handoff a strict ping-pong: preparing row `j+1` can only ever be one step
/// ahead of the reduction still consuming row `j`.
const STAGING_SLOTS: usize = 2;

/// Launch-contract failures. Everything here is detected before any compute
/// unit starts; once the pool is running there is no data-dependent failure
/// path and no partial-result model.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("engine configuration rejected: {0}")]
    Config(#[from] PlanError),

    #[error("descriptor invariant violated: aligned_row_len {aligned_row_len} < m {m}")]
    DescriptorInvariant { aligned_row_len: u32, m: u32 },

    #[error("input holds {got} elements but the descriptor implies {expected}")]
    InputLength { expected: usize, got: usize },

    #[error("output holds {got} elements but the descriptor implies {expected}")]
    OutputLength { expected: usize, got: usize },

    #[error("compute-unit pool construction failed: {0}")]
    Pool(String),
}

// ========================================================================================
//                         WRITE-DISJOINT OUTPUT VIEW
// ========================================================================================

/// A write-only view of the condensed output vector, shared by every unit.
///
/// The cyclic partition assigns each condensed offset to exactly one unit, so
/// concurrent writes can never alias; each write is a single scalar to a
/// uniquely owned address and needs no synchronization or buffered queue.
struct OutputPairs<'a, T> {
    ptr: *mut T,
    len: usize,
    _owner: PhantomData<&'a mut [T]>,
}

// SAFETY: shared access only ever performs writes to disjoint offsets (one
// writer per condensed slot, enforced by the partition and asserted per write),
// so handing `&OutputPairs` to multiple threads cannot race.
unsafe impl<T: Send> Sync for OutputPairs<'_, T> {}

impl<'a, T> OutputPairs<'a, T> {
    fn new(output: &'a mut [T]) -> Self {
        Self {
            ptr: output.as_mut_ptr(),
            len: output.len(),
            _owner: PhantomData,
        }
    }

    #[inline]
    fn write(&self, offset: usize, value: T) {
        assert!(
            offset < self.len,
            "condensed offset {offset} out of bounds for output of {}",
            self.len
        );
        // SAFETY: in bounds per the assert above; disjointness per the type's
        // contract makes this write race-free.
        unsafe { self.ptr.add(offset).write(value) }
    }
}

// ========================================================================================
//                        DOUBLE-BUFFERED ROW STAGING
// ========================================================================================

/// Streams rows of the input matrix through a small fixed set of staging
/// buffers recycled over a bounded channel: the free/filled buffer-cycling
/// pattern, collapsed to a single thread that plays both producer and
/// consumer. Fetching converts elements to f32 compute precision and
/// zero-fills the alignment padding, which keeps the padding neutral for
/// every reduction downstream.
struct RowStream<'a, T> {
    matrix: &'a [T],
    m: usize,
    slots: Receiver<Vec<f32>>,
    recycle: Sender<Vec<f32>>,
}

impl<'a, T: Element> RowStream<'a, T> {
    fn new(matrix: &'a [T], m: usize, aligned_row_len: usize) -> Self {
        let (recycle, slots) = bounded(STAGING_SLOTS);
        for _ in 0..STAGING_SLOTS {
            // Priming exactly `STAGING_SLOTS` buffers into a channel of that
            // capacity cannot fail.
            recycle
                .send(vec![0.0f32; aligned_row_len])
                .expect("staging ring rejected a priming slot");
        }
        Self {
            matrix,
            m,
            slots,
            recycle,
        }
    }

    /// Loads row `row` into the next free staging slot and hands it out.
    fn fetch(&self, row: usize) -> Vec<f32> {
        // Both channel ends live in `self` and at most `STAGING_SLOTS` slots
        // are ever outstanding, so a free slot is always recoverable.
        let mut slot = self
            .slots
            .recv()
            .expect("staging ring disconnected mid-stream");
        let src = &self.matrix[row * self.m..(row + 1) * self.m];
        for (dst, &e) in slot[..self.m].iter_mut().zip(src) {
            *dst = e.to_f32();
        }
        slot[self.m..].fill(0.0);
        slot
    }

    /// Returns a consumed slot to the ring for the next fetch.
    fn release(&self, slot: Vec<f32>) {
        self.recycle
            .send(slot)
            .expect("staging ring rejected a recycled slot");
    }
}

// ========================================================================================
//                               ENGINE ENTRY POINT
// ========================================================================================

/// Runs the distance computation described by the serialized tiling
/// descriptor. This is the launch contract: raw slices for input, output and
/// a scratch workspace (accepted for interface parity, unused by this core),
/// plus the descriptor bytes; compute-unit identity comes from the pool at
/// entry.
pub fn launch<T: Element>(
    x: &[T],
    y: &mut [T],
    _workspace: &mut [u8],
    descriptor: &[u8],
) -> Result<(), EngineError> {
    let desc = TilingDescriptor::deserialize(descriptor)?;
    if desc.active_units == 0 {
        return Err(EngineError::Config(PlanError::NoComputeUnits));
    }
    if desc.aligned_row_len < desc.m {
        return Err(EngineError::DescriptorInvariant {
            aligned_row_len: desc.aligned_row_len,
            m: desc.m,
        });
    }

    let n = desc.n as usize;
    let m = desc.m as usize;
    let expected_in = n * m;
    if x.len() != expected_in {
        return Err(EngineError::InputLength {
            expected: expected_in,
            got: x.len(),
        });
    }
    let expected_out = condensed_len(n);
    if y.len() != expected_out {
        return Err(EngineError::OutputLength {
            expected: expected_out,
            got: y.len(),
        });
    }
    if expected_out == 0 {
        // Fewer than two rows: nothing to compute, nothing to launch.
        return Ok(());
    }

    let pool = ThreadPoolBuilder::new()
        .num_threads(desc.active_units as usize)
        .build()
        .map_err(|e| EngineError::Pool(e.to_string()))?;

    info!(
        "launching {} compute unit(s): n={} m={} p={} aligned_row_len={}",
        desc.active_units, desc.n, desc.m, desc.p, desc.aligned_row_len
    );

    let out = OutputPairs::new(y);
    // The descriptor is broadcast read-only to every unit; each unit then
    // runs to completion with no further coordination.
    let _ = pool.broadcast(|ctx| run_unit::<T>(ctx.index(), &desc, x, &out));
    Ok(())
}

/// The per-unit engine loop: cyclic row ownership, full inner sweep over
/// `j > i`, direct scalar write-back.
fn run_unit<T: Element>(unit: usize, desc: &TilingDescriptor, matrix: &[T], out: &OutputPairs<T>) {
    let n = desc.n as usize;
    let m = desc.m as usize;
    let aligned = desc.aligned_row_len as usize;
    let stride = desc.active_units as usize;

    // Units past the active count (or past the row count) own nothing.
    // Unreachable by construction, checked anyway.
    if unit >= stride || unit >= n {
        return;
    }

    let stream_i = RowStream::new(matrix, m, aligned);
    let stream_j = RowStream::new(matrix, m, aligned);
    let mut scratch = vec![0.0f32; aligned];

    let mut i = unit;
    while i < n {
        let row_i = stream_i.fetch(i);
        for j in (i + 1)..n {
            let row_j = stream_j.fetch(j);
            let reduced = kernel::reduce_pair(&row_i, &row_j, m, desc.p, &mut scratch);
            let value = kernel::finalize(reduced, desc.p);
            out.write(condensed_offset(n, i, j), T::from_f32(value));
            stream_j.release(row_j);
        }
        stream_i.release(row_i);
        i += stride;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::{DESCRIPTOR_BYTES, Plan, Platform};
    use crate::types::DType;
    use approx::assert_relative_eq;
    use half::f16;

    /// Replays the engine's cyclic ownership loops and records every pair a
    /// given unit layout would produce, in write order.
    fn enumerate_pairs(n: usize, active_units: usize) -> Vec<(usize, usize)> {
        let mut pairs = Vec::new();
        for unit in 0..active_units {
            if unit >= n {
                continue;
            }
            let mut i = unit;
            while i < n {
                for j in (i + 1)..n {
                    pairs.push((i, j));
                }
                i += active_units;
            }
        }
        pairs
    }

    #[test]
    fn cyclic_assignment_covers_every_pair_exactly_once() {
        for (n, units) in [(7, 3), (1, 4), (100, 8), (4, 1), (9, 9), (3, 8)] {
            let pairs = enumerate_pairs(n, units);
            assert_eq!(pairs.len(), condensed_len(n), "pair count for n={n}, units={units}");

            // Each pair maps to a unique offset and the offsets exactly tile
            // [0, condensed_len): complete, non-overlapping cover.
            let mut seen = vec![false; condensed_len(n)];
            for (i, j) in pairs {
                let offset = condensed_offset(n, i, j);
                assert!(!seen[offset], "offset {offset} written twice (n={n}, units={units})");
                seen[offset] = true;
            }
            assert!(seen.iter().all(|&hit| hit), "uncovered offsets for n={n}, units={units}");
        }
    }

    #[test]
    fn row_stream_converts_and_zero_pads() {
        let matrix: Vec<f16> = [1.0f32, 2.0, 3.0, 4.0, 5.0, 6.0]
            .iter()
            .map(|&v| f16::from_f32(v))
            .collect();
        let stream = RowStream::new(matrix.as_slice(), 3, 16);

        let row = stream.fetch(1);
        assert_eq!(&row[..3], &[4.0, 5.0, 6.0]);
        assert!(row[3..].iter().all(|&pad| pad == 0.0));
        stream.release(row);

        // Both slots may be outstanding at once (ping-pong), never more.
        let first = stream.fetch(0);
        let second = stream.fetch(1);
        assert_eq!(&first[..3], &[1.0, 2.0, 3.0]);
        assert_eq!(&second[..3], &[4.0, 5.0, 6.0]);
        stream.release(first);
        stream.release(second);
    }

    fn descriptor_for(n: usize, m: usize, p: f32, units: usize) -> Vec<u8> {
        let platform = Platform::with_units(units).unwrap();
        let plan = Plan::compute(n, m, p, DType::F32, &platform).unwrap();
        let mut buf = vec![0u8; DESCRIPTOR_BYTES];
        plan.serialize_into(&mut buf).unwrap();
        buf
    }

    #[test]
    fn launch_computes_the_condensed_vector_in_place() {
        let x = vec![0.0f32, 0.0, 3.0, 4.0, 0.0, 0.0, 6.0, 8.0];
        let mut y = vec![0.0f32; 6];
        let descriptor = descriptor_for(4, 2, 2.0, 2);
        launch(&x, &mut y, &mut [], &descriptor).unwrap();
        for (got, want) in y.iter().zip([5.0, 0.0, 10.0, 5.0, 10.0, 5.0]) {
            assert_relative_eq!(*got, want);
        }
    }

    #[test]
    fn launch_rejects_mismatched_buffers() {
        let descriptor = descriptor_for(4, 2, 2.0, 2);
        let x = vec![0.0f32; 8];

        let mut y_short = vec![0.0f32; 5];
        assert!(matches!(
            launch(&x, &mut y_short, &mut [], &descriptor),
            Err(EngineError::OutputLength { expected: 6, got: 5 })
        ));

        let x_short = vec![0.0f32; 7];
        let mut y = vec![0.0f32; 6];
        assert!(matches!(
            launch(&x_short, &mut y, &mut [], &descriptor),
            Err(EngineError::InputLength { expected: 8, got: 7 })
        ));

        assert!(matches!(
            launch(&x, &mut y, &mut [], &descriptor[..10]),
            Err(EngineError::Config(PlanError::DescriptorTruncated { .. }))
        ));
    }

    #[test]
    fn launch_is_a_no_op_below_two_rows() {
        let descriptor = descriptor_for(1, 4, 2.0, 2);
        let x = vec![1.0f32; 4];
        let mut y: Vec<f32> = Vec::new();
        launch(&x, &mut y, &mut [], &descriptor).unwrap();
        assert!(y.is_empty());
    }
}
