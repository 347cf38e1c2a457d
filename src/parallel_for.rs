//! The parallel-for driver: a self-similar job whose body either splits its
//! range in half and spawns two child drivers, or invokes the user's
//! per-range function at a leaf.
//!
//! Splitting is what makes parallel-for compose with stealing: a thief that
//! grabs a non-leaf driver splits it locally, producing new stealable work on
//! its own deque. The leaves cover `[0, element_count)` contiguously and
//! without overlap.

use core::mem::{size_of, MaybeUninit};

use crate::job::JobParams;

/// Bytes available for auxiliary per-loop arguments, alongside the range
/// bookkeeping in the driver payload.
pub const PARALLEL_FOR_ARGS_SIZE: usize = 24;

/// Packed auxiliary arguments handed to every leaf invocation.
#[derive(Clone, Copy)]
pub struct ForArgs {
    bytes: [MaybeUninit<u8>; PARALLEL_FOR_ARGS_SIZE],
}

impl ForArgs {
    pub(crate) fn pack<T: Copy>(args: T) -> ForArgs {
        const { assert!(size_of::<T>() <= PARALLEL_FOR_ARGS_SIZE, "parallel-for arguments exceed the auxiliary area") };
        let mut bytes = [MaybeUninit::uninit(); PARALLEL_FOR_ARGS_SIZE];
        // SAFETY: `T` fits the byte area; the write is unaligned by design.
        unsafe { bytes.as_mut_ptr().cast::<T>().write_unaligned(args) };
        ForArgs { bytes }
    }

    /// Reads the packed auxiliary arguments back out.
    ///
    /// # Safety
    ///
    /// `T` must be the exact type passed to `parallel_for`.
    pub unsafe fn unpack<T: Copy>(&self) -> T {
        const { assert!(size_of::<T>() <= PARALLEL_FOR_ARGS_SIZE) };
        // SAFETY: The caller promises a `T` was packed here.
        unsafe { self.bytes.as_ptr().cast::<T>().read_unaligned() }
    }
}

/// The per-range function invoked at each leaf of the split tree, with the
/// range `[offset, offset + count)`, the packed auxiliary arguments, and the
/// executing thread's index.
pub type ParallelForFunction = fn(offset: usize, count: usize, args: &ForArgs, thread_index: usize);

/// The driver job's packed payload.
#[derive(Clone, Copy)]
pub(crate) struct ParallelForData {
    pub(crate) function: ParallelForFunction,
    pub(crate) split_threshold: u32,
    pub(crate) offset: u32,
    pub(crate) count: u32,
    pub(crate) args: ForArgs,
}

/// Whether a range should be split further. A zero threshold means "never
/// split": the whole range runs as a single leaf.
#[inline(always)]
fn should_split(count: u32, split_threshold: u32) -> bool {
    split_threshold > 0 && count > split_threshold
}

/// The body of every driver job in the split tree.
pub(crate) fn parallel_for_driver(prm: &JobParams<'_>) {
    // SAFETY: Driver jobs are only ever created with `ParallelForData` packed
    // into their payload.
    let data: ParallelForData = unsafe { prm.unpack() };
    if should_split(data.count, data.split_threshold) {
        // Split in two. Both halves are children of this driver, so the
        // parent-for node is not finished until the whole subtree is.
        let left_count = data.count / 2;
        let left = ParallelForData {
            count: left_count,
            ..data
        };
        let right = ParallelForData {
            offset: data.offset + left_count,
            count: data.count - left_count,
            ..data
        };
        crate::start_child_job(prm.job, parallel_for_driver, left);
        crate::start_child_job(prm.job, parallel_for_driver, right);
    } else {
        // Leaf: run the user's function on the range.
        (data.function)(
            data.offset as usize,
            data.count as usize,
            &data.args,
            prm.thread_index,
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::JOB_PAYLOAD_SIZE;

    #[test]
    fn driver_payload_fits_a_job() {
        assert!(size_of::<ParallelForData>() <= JOB_PAYLOAD_SIZE);
    }

    #[test]
    fn aux_args_round_trip() {
        let args = ForArgs::pack((0x1000_usize as *mut u8, 1.5f32));
        let (ptr, dt) = unsafe { args.unpack::<(*mut u8, f32)>() };
        assert_eq!(ptr as usize, 0x1000);
        assert_eq!(dt, 1.5);
    }

    #[test]
    fn zero_threshold_never_splits() {
        assert!(!should_split(1, 0));
        assert!(!should_split(u32::MAX, 0));
    }

    #[test]
    fn split_covers_every_element() {
        // Walk the split tree arithmetic: halves always sum to the whole.
        fn leaves(offset: u32, count: u32, threshold: u32, out: &mut Vec<(u32, u32)>) {
            if should_split(count, threshold) {
                let left = count / 2;
                leaves(offset, left, threshold, out);
                leaves(offset + left, count - left, threshold, out);
            } else {
                out.push((offset, count));
            }
        }

        for (count, threshold) in [(2048, 256), (2047, 256), (1, 1), (0, 16), (300, 256)] {
            let mut ranges = Vec::new();
            leaves(0, count, threshold, &mut ranges);
            let mut expected = 0;
            for (offset, leaf_count) in ranges {
                assert_eq!(offset, expected, "leaves must be contiguous");
                assert!(threshold == 0 || leaf_count <= threshold);
                expected += leaf_count;
            }
            assert_eq!(expected, count, "leaves must cover the range");
        }
    }
}
