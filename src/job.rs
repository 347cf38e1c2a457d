//! This module defines the [`Job`] record, the stable identifiers used to
//! refer to jobs, and the packed-argument payload that travels with each job.
//!
//! A job is a fixed-size, cache-line-aligned slot in a pre-allocated pool.
//! The slot holds a function pointer (or an in-place closure), the atomic
//! counter that tracks completion of the job and its children, the links that
//! wire jobs into parent/child/continuation trees, and a small byte area for
//! trivially-copyable arguments.
//!
//! When using a job slot, one must be careful to ensure that:
//! (a) All link and payload fields are written only by the owning thread,
//!     before the job is started.
//! (b) After the job is started, those fields are frozen until the job's
//!     `unfinished` counter reaches zero; cross-thread reads rely on this.
//! (c) An installed closure is executed (and thereby dropped) exactly once.

use core::cell::UnsafeCell;
use core::mem::{align_of, size_of, MaybeUninit};
use core::sync::atomic::{AtomicI32, Ordering};
use std::alloc::Layout;

use crate::util::align_up;
use crate::JOB_ALIGNMENT;

// -----------------------------------------------------------------------------
// Identifiers

/// A stable identifier for a job slot.
///
/// Identifiers are dense: the owning worker of a job can be recovered from the
/// identifier alone, without a lookup table. The value 0 is reserved as
/// [`NULL_JOB_ID`], so at most `u16::MAX - 1` jobs can be live at once.
pub type JobId = u16;

/// The reserved null identifier. No job ever has this id.
pub const NULL_JOB_ID: JobId = 0;

// -----------------------------------------------------------------------------
// Payload geometry

/// Bytes reserved at the front of each job slot for the header and the
/// `unfinished` counter. The remainder of the slot is payload.
const JOB_HEADER_AREA: usize = 32;

/// Number of payload bytes available to packed arguments or an in-place
/// closure in each job.
pub const JOB_PAYLOAD_SIZE: usize = JOB_ALIGNMENT - JOB_HEADER_AREA;

/// The byte area embedded in each job slot. Aligned so that a function
/// pointer can be stored at offset zero without adjustment.
#[repr(C, align(8))]
#[derive(Clone, Copy)]
pub(crate) struct Payload {
    bytes: [MaybeUninit<u8>; JOB_PAYLOAD_SIZE],
}

impl Payload {
    fn uninit() -> Payload {
        Payload {
            bytes: [MaybeUninit::uninit(); JOB_PAYLOAD_SIZE],
        }
    }
}

// -----------------------------------------------------------------------------
// Job functions and parameters

/// The parameters passed to a job function when it executes.
///
/// `job` can be used to attach child jobs on the fly, and `thread_index` to
/// address per-thread buffers.
pub struct JobParams<'a> {
    /// The id of the executing job.
    pub job: JobId,
    /// The index of the worker executing the job.
    pub thread_index: usize,
    args: &'a Payload,
}

impl JobParams<'_> {
    /// Reads the packed arguments back out of the job payload.
    ///
    /// # Safety
    ///
    /// `T` must be the exact type that was packed into the job at creation.
    pub unsafe fn unpack<T: Copy>(&self) -> T {
        const { assert!(size_of::<T>() <= JOB_PAYLOAD_SIZE) };
        // SAFETY: The caller promises a value of type `T` was packed here, so
        // the first `size_of::<T>()` bytes are initialized. The read is
        // unaligned because packing does not align.
        unsafe { self.args.bytes.as_ptr().cast::<T>().read_unaligned() }
    }
}

/// A plain job function. Arguments arrive packed inside the [`JobParams`].
pub type JobFunction = fn(&JobParams<'_>);

/// The type-erased entry point stored ahead of an in-place closure. Mirrors
/// how a job function pointer dispatches a plain job, but for a payload that
/// owns a closure.
type ClosureInvoker = unsafe fn(*mut u8, usize);

/// Runs (and thereby consumes) the closure stored in a job payload.
///
/// # Safety
///
/// `base` must point to the payload of a job in which [`Job::install_closure`]
/// previously stored a closure of exactly type `F`, and that closure must not
/// have been run before.
unsafe fn run_closure<F>(base: *mut u8, thread_index: usize)
where
    F: FnOnce(usize) + Send + 'static,
{
    // Recompute the aligned closure offset the same way `install_closure` did.
    let slot = unsafe { base.add(size_of::<ClosureInvoker>()) };
    let offset = align_up(slot as usize, align_of::<F>()) - slot as usize;
    // SAFETY: The caller guarantees a live `F` sits at this address. Reading
    // it by value moves it out of the slot; it is dropped when the call ends,
    // which is what makes the closure run and drop exactly once.
    let f = unsafe { slot.add(offset).cast::<F>().read() };
    f(thread_index);
}

// -----------------------------------------------------------------------------
// The job record

/// Link and dispatch state for one job. Kept in a single `UnsafeCell` because
/// every field follows the same access protocol: written by the owning thread
/// before start, frozen afterwards (`is_closure` is additionally cleared by
/// the executing thread, which has exclusive access at that point).
struct JobHeader {
    func: Option<JobFunction>,
    parent: JobId,
    continuation: JobId,
    next: JobId,
    is_closure: bool,
    started: bool,
    is_continuation: bool,
}

/// One slot in the job pool.
///
/// A slot is *vacant* while `unfinished == 0` and *live* otherwise. Ring
/// allocation re-uses vacant slots in place; re-using a live slot means the
/// caller exceeded the per-thread concurrent-job budget.
#[repr(C, align(128))]
pub(crate) struct Job {
    header: UnsafeCell<JobHeader>,
    unfinished: AtomicI32,
    data: UnsafeCell<Payload>,
}

const _: () = assert!(size_of::<Job>() == JOB_ALIGNMENT);
const _: () = assert!(JOB_ALIGNMENT >= 128 && JOB_ALIGNMENT.is_power_of_two());

// SAFETY: `unfinished` is atomic. The `UnsafeCell` fields are governed by the
// freeze protocol described on the type and module: mutation happens only on
// the owning thread before the job is published (or on the executing thread,
// which holds the job exclusively), and every publication point (deque mutex,
// parent counter) provides the necessary ordering.
unsafe impl Sync for Job {}

impl Job {
    /// A vacant slot, ready for the pool.
    pub(crate) fn vacant() -> Job {
        Job {
            header: UnsafeCell::new(JobHeader {
                func: None,
                parent: NULL_JOB_ID,
                continuation: NULL_JOB_ID,
                next: NULL_JOB_ID,
                is_closure: false,
                started: false,
                is_continuation: false,
            }),
            unfinished: AtomicI32::new(0),
            data: UnsafeCell::new(Payload::uninit()),
        }
    }

    /// Number of completions this job still waits on: its own function plus
    /// one per attached child. The job is finished when this reaches zero.
    ///
    /// The acquire load pairs with the release decrement in [`finish_one`],
    /// making writes performed inside the job body visible to any thread that
    /// observes zero.
    ///
    /// [`finish_one`]: Job::finish_one
    #[inline(always)]
    pub(crate) fn pending(&self) -> i32 {
        self.unfinished.load(Ordering::Acquire)
    }

    /// Records one completion and returns the remaining count.
    #[inline(always)]
    pub(crate) fn finish_one(&self) -> i32 {
        self.unfinished.fetch_sub(1, Ordering::AcqRel) - 1
    }

    /// Registers a child with this job, which must not have finished.
    #[inline(always)]
    pub(crate) fn attach_child(&self) {
        let previous = self.unfinished.fetch_add(1, Ordering::Relaxed);
        debug_assert!(previous > 0, "parent job has already finished");
    }

    /// Re-initializes the slot for a new tenant.
    ///
    /// # Safety
    ///
    /// The caller must be the slot's owning thread, and the previous tenant
    /// must have finished (`pending() == 0`).
    pub(crate) unsafe fn reset(&self, func: Option<JobFunction>) {
        // SAFETY: A vacant slot has no other readers or writers; the owning
        // thread has exclusive access until the job is started.
        let header = unsafe { &mut *self.header.get() };
        *header = JobHeader {
            func,
            parent: NULL_JOB_ID,
            continuation: NULL_JOB_ID,
            next: NULL_JOB_ID,
            is_closure: false,
            started: false,
            is_continuation: false,
        };
        self.unfinished.store(1, Ordering::Relaxed);
    }

    // Reads below are plain loads through the cell. SAFETY for each: header
    // fields are frozen from `start_job` until the job finishes, and the
    // reading thread either owns the unstarted job or is executing/finishing
    // it, so no write can race.

    #[inline(always)]
    pub(crate) fn parent(&self) -> JobId {
        unsafe { (*self.header.get()).parent }
    }

    #[inline(always)]
    pub(crate) fn continuation(&self) -> JobId {
        unsafe { (*self.header.get()).continuation }
    }

    #[inline(always)]
    pub(crate) fn next(&self) -> JobId {
        unsafe { (*self.header.get()).next }
    }

    #[inline(always)]
    pub(crate) fn started(&self) -> bool {
        unsafe { (*self.header.get()).started }
    }

    #[inline(always)]
    pub(crate) fn is_continuation(&self) -> bool {
        unsafe { (*self.header.get()).is_continuation }
    }

    /// # Safety
    ///
    /// Owner thread only, before the job is started.
    pub(crate) unsafe fn set_parent(&self, parent: JobId) {
        unsafe { (*self.header.get()).parent = parent };
    }

    /// # Safety
    ///
    /// Owner thread only; the job must not have been started. Starting a
    /// marked continuation is rejected by `start_job`.
    pub(crate) unsafe fn mark_continuation(&self) {
        unsafe { (*self.header.get()).is_continuation = true };
    }

    /// # Safety
    ///
    /// Must be called exactly once, by the thread about to publish the job.
    pub(crate) unsafe fn mark_started(&self) {
        unsafe { (*self.header.get()).started = true };
    }

    /// # Safety
    ///
    /// Owner thread only, while the antecedent owning this list has not been
    /// started.
    pub(crate) unsafe fn set_continuation(&self, id: JobId) {
        unsafe { (*self.header.get()).continuation = id };
    }

    /// # Safety
    ///
    /// Owner thread only, while the antecedent owning this list has not been
    /// started.
    pub(crate) unsafe fn set_next(&self, id: JobId) {
        unsafe { (*self.header.get()).next = id };
    }

    /// Copies packed arguments into the payload area.
    ///
    /// The size check is a compile-time error, mirroring the static payload
    /// budget: arguments that do not fit the slot cannot be expressed.
    ///
    /// # Safety
    ///
    /// Owner thread only, before the job is started.
    pub(crate) unsafe fn write_args<T: Copy>(&self, args: T) {
        const { assert!(size_of::<T>() <= JOB_PAYLOAD_SIZE, "job arguments exceed the payload area") };
        // SAFETY: The payload area is at least `size_of::<T>()` bytes and the
        // owning thread has exclusive access before start.
        unsafe { self.data.get().cast::<T>().write_unaligned(args) };
    }

    /// Moves a closure into the payload area behind a type-erased invoker.
    ///
    /// Layout: the invoker function pointer sits at offset zero, followed by
    /// the closure at its natural alignment. Closures that cannot fit in the
    /// payload (worst-case alignment slack included) are a compile-time error.
    ///
    /// # Safety
    ///
    /// Owner thread only, before the job is started. The job must not already
    /// hold a closure.
    pub(crate) unsafe fn install_closure<F>(&self, f: F)
    where
        F: FnOnce(usize) + Send + 'static,
    {
        const {
            assert!(
                size_of::<ClosureInvoker>() + size_of::<F>() + align_of::<F>() <= JOB_PAYLOAD_SIZE,
                "closure exceeds the job payload area"
            )
        };
        let base = self.data.get().cast::<u8>();
        // SAFETY: The payload base is 8-aligned, so the invoker pointer can be
        // stored directly; the closure lands at its own alignment within the
        // budget checked above. The owning thread has exclusive access.
        unsafe {
            base.cast::<ClosureInvoker>().write(run_closure::<F>);
            let slot = base.add(size_of::<ClosureInvoker>());
            let offset = align_up(slot as usize, align_of::<F>()) - slot as usize;
            slot.add(offset).cast::<F>().write(f);
            (*self.header.get()).is_closure = true;
        }
    }

    /// Runs the job body on the executing thread: the in-place closure if one
    /// is installed, otherwise the job function. Sentinel jobs (no function)
    /// do nothing here; their purpose is the counter.
    ///
    /// # Safety
    ///
    /// The job must be live and must be executed exactly once, by the thread
    /// that dequeued it.
    pub(crate) unsafe fn run(&self, id: JobId, thread_index: usize) {
        // SAFETY for the header reads and write below: the executing thread
        // holds the job exclusively; the header is frozen for everyone else.
        let header = self.header.get();
        if unsafe { (*header).is_closure } {
            let base = self.data.get().cast::<u8>();
            // SAFETY: `install_closure` stored the invoker at offset zero.
            // The invoker moves the closure out, so it runs and drops once.
            unsafe {
                let invoker = base.cast::<ClosureInvoker>().read();
                invoker(base, thread_index);
                (*header).is_closure = false;
            }
        } else if let Some(func) = unsafe { (*header).func } {
            let params = JobParams {
                job: id,
                thread_index,
                // SAFETY: Packed arguments are frozen once the job starts.
                args: unsafe { &*self.data.get() },
            };
            func(&params);
        }
    }
}

// -----------------------------------------------------------------------------
// Allocation

/// The allocator used for the job pool.
///
/// Defaults to the global allocator. The function-pointer form keeps the pair
/// trivially copyable and free of captured state, which is all a fixed,
/// init-time allocation needs.
#[derive(Clone, Copy)]
pub struct PoolAllocator {
    pub alloc: fn(Layout) -> *mut u8,
    pub free: fn(*mut u8, Layout),
}

fn global_alloc(layout: Layout) -> *mut u8 {
    // SAFETY: The pool layout always has non-zero size.
    unsafe { std::alloc::alloc(layout) }
}

fn global_free(ptr: *mut u8, layout: Layout) {
    // SAFETY: `ptr` was returned by `global_alloc` with the same layout.
    unsafe { std::alloc::dealloc(ptr, layout) }
}

impl Default for PoolAllocator {
    fn default() -> Self {
        PoolAllocator {
            alloc: global_alloc,
            free: global_free,
        }
    }
}

/// The contiguous array of job slots shared by all workers, plus the backing
/// block for the per-worker deque index arrays. Both come from the
/// user-supplied allocator.
///
/// Each worker owns the slice `[index * jobs_per_thread, (index + 1) *
/// jobs_per_thread)` for allocation; lookup by id is open to every thread.
pub(crate) struct JobPool {
    slots: *mut Job,
    slots_layout: Layout,
    ids: *mut JobId,
    ids_layout: Layout,
    capacity: usize,
    allocator: PoolAllocator,
}

// SAFETY: The pool is a plain allocation of `Job` slots, each of which is
// `Sync`; the raw pointers are never aliased mutably after construction (the
// id block is handed out in disjoint per-queue slices).
unsafe impl Send for JobPool {}
unsafe impl Sync for JobPool {}

impl JobPool {
    pub(crate) fn new(capacity: usize, allocator: PoolAllocator) -> JobPool {
        debug_assert!(capacity > 0 && capacity < JobId::MAX as usize);
        let slots_layout = Layout::array::<Job>(capacity).expect("job pool layout overflow");
        let memory = (allocator.alloc)(slots_layout);
        assert!(!memory.is_null(), "job pool allocation failed");
        let slots = memory.cast::<Job>();
        for i in 0..capacity {
            // SAFETY: `i` is within the freshly allocated array.
            unsafe { slots.add(i).write(Job::vacant()) };
        }

        let ids_layout = Layout::array::<JobId>(capacity).expect("id pool layout overflow");
        let ids = (allocator.alloc)(ids_layout).cast::<JobId>();
        assert!(!ids.is_null(), "deque index allocation failed");

        JobPool {
            slots,
            slots_layout,
            ids,
            ids_layout,
            capacity,
            allocator,
        }
    }

    /// Resolves an id to its slot. O(1); ids are slot indices plus one.
    #[inline(always)]
    pub(crate) fn job(&self, id: JobId) -> &Job {
        debug_assert_ne!(id, NULL_JOB_ID);
        debug_assert!(id as usize <= self.capacity);
        // SAFETY: Valid ids map to slots inside the allocation, and slots are
        // only accessed through shared references after construction.
        unsafe { &*self.slots.add(id as usize - 1) }
    }

    /// Hands out one worker's slice of the deque index block.
    pub(crate) fn id_block(&self, offset: usize, len: usize) -> *mut JobId {
        debug_assert!(offset + len <= self.capacity);
        // SAFETY: The slice stays inside the id allocation.
        unsafe { self.ids.add(offset) }
    }
}

impl Drop for JobPool {
    fn drop(&mut self) {
        // Job slots have no drop glue; releasing the memory is enough. A
        // closure installed but never executed is leaked, as in any pool that
        // never reclaims unfinished work.
        (self.allocator.free)(self.slots.cast(), self.slots_layout);
        (self.allocator.free)(self.ids.cast(), self.ids_layout);
    }
}

// -----------------------------------------------------------------------------
// Tests
