//! A fork-join job scheduler for CPU-bound, data-parallel workloads.
//!
//! Presto distributes trees of small *jobs* (game-frame stages, physics
//! updates, particle batches) across a fixed pool of worker threads. Each
//! worker drains its own deque newest-first and steals oldest-first from the
//! others, so load balancing emerges without central coordination. Jobs
//! compose three ways: parent/child (a parent is not finished until all its
//! children are), continuations (run after an antecedent finishes), and
//! parallel-for (a recursively split range).
//!
//! Jobs live in a fixed pool allocated at [`init`]; creating one never
//! allocates. Arguments are packed by value into the job record, and small
//! closures are stored in place. Overrunning the per-thread job budget is a
//! programming error, caught by debug assertions, not a recoverable
//! condition.
//!
//! # Example
//!
//! ```no_run
//! use presto as jobs;
//!
//! jobs::init(jobs::DEFAULT_MAX_JOBS, jobs::DEFAULT_NUM_WORKER_THREADS);
//!
//! let root = jobs::create_job();
//! for i in 0..8 {
//!     jobs::start_function(root, move |thread_index| {
//!         println!("task {i} ran on worker {thread_index}");
//!     });
//! }
//! jobs::start_and_wait_for_job(root);
//!
//! jobs::destroy();
//! ```
//!
//! The thread that calls [`init`] becomes worker 0 and participates in
//! scheduling whenever it waits: [`wait_for_job`] executes pending work
//! instead of blocking, which is what makes `start → wait` deadlock-free.

// -----------------------------------------------------------------------------
// Modules

mod job;
mod parallel_for;
mod queue;
mod stats;
mod system;
mod util;

// -----------------------------------------------------------------------------
// Top-level exports

pub use job::JobFunction;
pub use job::JobId;
pub use job::JobParams;
pub use job::PoolAllocator;
pub use job::JOB_PAYLOAD_SIZE;
pub use job::NULL_JOB_ID;
pub use parallel_for::ForArgs;
pub use parallel_for::ParallelForFunction;
pub use parallel_for::PARALLEL_FOR_ARGS_SIZE;
pub use stats::ThreadStats;
pub use system::add_continuation;
pub use system::add_continuation_closure;
pub use system::add_continuation_with;
pub use system::create_child_job;
pub use system::create_child_job_with;
pub use system::create_job;
pub use system::create_job_with;
pub use system::destroy;
pub use system::init;
pub use system::init_with_allocator;
pub use system::parallel_for;
pub use system::start_and_wait_for_job;
pub use system::start_child_job;
pub use system::start_function;
pub use system::start_job;
pub use system::this_thread_index;
pub use system::thread_stats;
pub use system::wait_for_job;
pub use system::worker_thread_count;

// -----------------------------------------------------------------------------
// Configuration

/// Default per-worker cap on concurrently live jobs.
pub const DEFAULT_MAX_JOBS: usize = 4096;

/// Upper bound on scheduler threads (worker 0 included). Together with the
/// per-thread job cap this keeps every job addressable by a 16-bit id.
pub const MAX_THREADS: usize = 64;

/// Default split threshold for [`parallel_for`], in elements.
pub const DEFAULT_PARALLEL_FOR_SPLIT_THRESHOLD: usize = 256;

/// Size and alignment of a job record. The payload area for packed arguments
/// is what remains after the job header.
pub const JOB_ALIGNMENT: usize = 128;

/// Pass as `num_worker_threads` to [`init`] to use hardware concurrency
/// minus one (the calling thread fills the remaining core).
pub const DEFAULT_NUM_WORKER_THREADS: usize = usize::MAX;
