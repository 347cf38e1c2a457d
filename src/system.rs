//! This module contains the scheduler singleton, the worker loop, and the
//! public scheduling operations.
//!
//! The scheduler owns a fixed pool of job slots and one deque per thread
//! (worker 0 is the thread that called [`init`]; the rest are spawned). Work
//! distribution is pull-based: each worker drains its own deque newest-first
//! and steals oldest-first from a random other worker when it runs dry.
//! Completion is tracked by each job's `unfinished` counter; the finish
//! cascade enqueues continuations and notifies parents.

use core::cell::Cell;
use core::mem;
use core::num::NonZero;
use core::ptr;
use core::sync::atomic::{AtomicI32, AtomicPtr, Ordering};
use std::sync::{Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, trace};

use crate::job::{JobFunction, JobId, JobPool, PoolAllocator, NULL_JOB_ID};
use crate::parallel_for::{parallel_for_driver, ForArgs, ParallelForData, ParallelForFunction};
use crate::queue::WorkerQueue;
use crate::stats::ThreadStats;
use crate::util::{AbortOnDrop, XorShift64Star};
use crate::{DEFAULT_NUM_WORKER_THREADS, MAX_THREADS};

/// How long an idle thread naps when a wakeup finds nothing to pop or steal.
/// Avoids a tight spin when producers briefly stall.
const IDLE_SLEEP: Duration = Duration::from_micros(1);

/// Ids are 16-bit with 0 reserved, so this many jobs can be live at once.
const MAX_JOBS: usize = JobId::MAX as usize - 1;

// -----------------------------------------------------------------------------
// Thread-local worker context

thread_local! {
    /// The index of the queue owned by this thread. Worker threads set this
    /// on entry; the thread that called `init` is worker 0.
    static THREAD_INDEX: Cell<usize> = const { Cell::new(0) };

    /// Steal-target randomness. Thread-local so victim selection never
    /// contends between workers.
    static STEAL_RNG: XorShift64Star = XorShift64Star::new();
}

// -----------------------------------------------------------------------------
// The scheduler singleton

struct WakeState {
    is_running: bool,
}

pub(crate) struct JobSystem {
    /// Declared before `pool`: the deques hold slices of the pool's deque
    /// index block and must be dropped first.
    queues: Box<[WorkerQueue]>,
    pool: JobPool,
    workers: Mutex<Vec<JoinHandle<()>>>,
    /// Guards `is_running` and orders `active_jobs` increments against a
    /// sleeper's predicate check.
    wake: Mutex<WakeState>,
    job_is_ready: Condvar,
    /// Number of job ids currently sitting in deques, across all workers.
    active_jobs: AtomicI32,
    thread_count: usize,
    jobs_per_thread: usize,
}

static JOB_SYSTEM: AtomicPtr<JobSystem> = AtomicPtr::new(ptr::null_mut());

/// Resolves the singleton, panicking if the scheduler is not initialized.
#[inline]
fn system() -> &'static JobSystem {
    let ptr = JOB_SYSTEM.load(Ordering::Acquire);
    assert!(!ptr.is_null(), "the job system is not initialized");
    // SAFETY: A non-null pointer was published by `init` and stays valid
    // until `destroy`, which the caller must not overlap with scheduling.
    unsafe { &*ptr }
}

impl JobSystem {
    #[inline(always)]
    fn this_queue(&self) -> &WorkerQueue {
        &self.queues[THREAD_INDEX.with(Cell::get)]
    }

    /// The queue owning a job id. The dense id encoding makes this O(1).
    #[inline(always)]
    fn owner_queue(&self, id: JobId) -> &WorkerQueue {
        debug_assert_ne!(id, NULL_JOB_ID);
        &self.queues[(id as usize - 1) / self.jobs_per_thread]
    }

    /// Takes a fresh slot from the calling worker's ring and re-initializes
    /// it. Re-using a slot whose previous tenant has not finished means the
    /// caller exceeded the per-thread concurrent-job budget.
    fn alloc_job(&self, func: Option<JobFunction>) -> JobId {
        let queue = self.this_queue();
        let id = queue.allocate_id();
        let job = self.pool.job(id);
        debug_assert!(
            job.pending() == 0,
            "job ring full: slot {id} is still live"
        );
        // SAFETY: The slot is vacant and this thread owns it.
        unsafe { job.reset(func) };
        id
    }

    fn create_child(&self, parent: JobId, func: Option<JobFunction>) -> JobId {
        let id = self.alloc_job(func);
        if parent != NULL_JOB_ID {
            self.pool.job(parent).attach_child();
            // SAFETY: Owner thread, job not yet started.
            unsafe { self.pool.job(id).set_parent(parent) };
        }
        id
    }

    fn add_continuation_impl(&self, antecedent: JobId, func: Option<JobFunction>) -> JobId {
        assert_ne!(antecedent, NULL_JOB_ID);
        let prior = self.pool.job(antecedent);
        debug_assert!(
            !prior.started(),
            "cannot add a continuation to a job that has been started"
        );

        // A continuation is a child of the antecedent's parent, not of the
        // antecedent itself: it must be able to start the moment the
        // antecedent finishes, while still holding the shared parent open.
        let id = self.create_child(prior.parent(), func);
        // SAFETY: Owner thread, job not yet started.
        unsafe { self.pool.job(id).mark_continuation() };

        // Append to the antecedent's list, preserving insertion order.
        if prior.continuation() == NULL_JOB_ID {
            // SAFETY: The antecedent has not started; its links are only
            // touched by setup code on this thread.
            unsafe { prior.set_continuation(id) };
        } else {
            let mut tail = prior.continuation();
            while self.pool.job(tail).next() != NULL_JOB_ID {
                tail = self.pool.job(tail).next();
            }
            // SAFETY: As above; the listed continuations are unstarted too.
            unsafe { self.pool.job(tail).set_next(id) };
        }
        id
    }

    /// Publishes a job id on a deque and wakes a sleeping worker.
    fn push_job(&self, queue: &WorkerQueue, id: JobId) {
        queue.push(id);
        self.active_jobs.fetch_add(1, Ordering::Relaxed);
        // Taking the wake lock (even empty) orders the increment before any
        // sleeper's predicate re-check, so the notification cannot be missed.
        drop(self.wake.lock().unwrap());
        self.job_is_ready.notify_all();
    }

    /// Finds the next job for `queue`: newest local work first, then one
    /// steal attempt against a uniformly random other worker.
    fn next_job(&self, queue: &WorkerQueue) -> Option<JobId> {
        if let Some(id) = queue.pop() {
            self.active_jobs.fetch_sub(1, Ordering::Relaxed);
            return Some(id);
        }
        if self.thread_count <= 1 {
            return None;
        }
        queue.counters.count_attempted_stealing();
        let mut victim = STEAL_RNG.with(|rng| rng.next_usize(self.thread_count - 1));
        if victim >= queue.index() {
            victim += 1;
        }
        let victim = &self.queues[victim];
        if let Some(id) = victim.steal() {
            self.active_jobs.fetch_sub(1, Ordering::Relaxed);
            queue.counters.count_stolen();
            victim.counters.count_given();
            return Some(id);
        }
        None
    }

    /// Runs a job body to completion and cascades the finish.
    fn execute_job(&self, id: JobId, queue: &WorkerQueue) {
        #[cfg(feature = "profile")]
        let started = std::time::Instant::now();

        let job = self.pool.job(id);
        debug_assert!(job.pending() > 0);
        // A panic escaping a job body would strand its waiters; turn it into
        // an abort.
        let abort_guard = AbortOnDrop;
        // SAFETY: This thread dequeued the id, so it holds the job
        // exclusively, and each queued id is dequeued once.
        unsafe { job.run(id, queue.index()) };
        mem::forget(abort_guard);
        // Count before the finish cascade publishes completion, so a waiter
        // that observes the job as finished also observes the count.
        queue.counters.count_executed();
        self.finish(id);

        #[cfg(feature = "profile")]
        queue.counters.add_running_time(started.elapsed());
    }

    /// Records one completion for `id`. When the job's counter reaches zero
    /// the job is finished: its continuations are enqueued on the executing
    /// thread's deque (relocating them to whichever thread finished the
    /// antecedent), and the finish propagates to the parent. Recursion depth
    /// is bounded by the tree depth.
    fn finish(&self, id: JobId) {
        let job = self.pool.job(id);
        let remaining = job.finish_one();
        debug_assert!(remaining >= 0, "job {id} finished more times than it was attached");
        if remaining > 0 {
            return;
        }

        let mut continuation = job.continuation();
        while continuation != NULL_JOB_ID {
            // Read the link before the push: once published, the continuation
            // can execute and its slot's links are no longer ours to read.
            let next = self.pool.job(continuation).next();
            self.push_job(self.this_queue(), continuation);
            continuation = next;
        }

        let parent = job.parent();
        if parent != NULL_JOB_ID {
            self.finish(parent);
        }
    }
}

// -----------------------------------------------------------------------------
// Worker threads

/// The main loop of a spawned worker: pop local work, steal when dry, sleep
/// on the wake condvar when the whole pool is dry.
fn worker_main(js: &'static JobSystem, index: usize) {
    THREAD_INDEX.with(|cell| cell.set(index));
    let queue = &js.queues[index];
    queue.register_current_thread();
    trace!(index, "worker started");

    loop {
        {
            let mut wake = js.wake.lock().unwrap();
            while wake.is_running && js.active_jobs.load(Ordering::Relaxed) <= 0 {
                wake = js.job_is_ready.wait(wake).unwrap();
            }
            if !wake.is_running {
                break;
            }
        }
        if let Some(id) = js.next_job(queue) {
            js.execute_job(id, queue);
        } else {
            // Woken but beaten to the work; nap instead of spinning.
            thread::sleep(IDLE_SLEEP);
        }
    }

    trace!(index, "worker exiting");
}

// -----------------------------------------------------------------------------
// Lifecycle

/// Initializes the job system with the default allocator.
///
/// `jobs_per_thread` bounds how many jobs each thread can have live at once;
/// it is rounded up to a power of two. `num_worker_threads` is the number of
/// threads to spawn in addition to the calling thread, which becomes worker 0;
/// pass [`DEFAULT_NUM_WORKER_THREADS`] to use the hardware concurrency.
///
/// # Panics
///
/// Panics if the system is already initialized or if `jobs_per_thread` is 0.
pub fn init(jobs_per_thread: usize, num_worker_threads: usize) {
    init_with_allocator(jobs_per_thread, num_worker_threads, PoolAllocator::default());
}

/// Initializes the job system with a custom pool allocator. See [`init`].
pub fn init_with_allocator(
    jobs_per_thread: usize,
    num_worker_threads: usize,
    allocator: PoolAllocator,
) {
    assert!(jobs_per_thread > 0);

    let num_worker_threads = if num_worker_threads == DEFAULT_NUM_WORKER_THREADS {
        // The calling thread participates, so leave one core for it.
        thread::available_parallelism()
            .map(NonZero::get)
            .unwrap_or(1)
            .saturating_sub(1)
    } else {
        num_worker_threads
    };

    let mut jobs_per_thread = jobs_per_thread.next_power_of_two();
    while jobs_per_thread > MAX_JOBS {
        jobs_per_thread /= 2;
    }

    let thread_count = (num_worker_threads + 1)
        .min(MAX_THREADS)
        .min(MAX_JOBS / jobs_per_thread);
    let capacity = thread_count * jobs_per_thread;

    debug!(thread_count, jobs_per_thread, "initializing job system");

    let pool = JobPool::new(capacity, allocator);
    let queues: Box<[WorkerQueue]> = (0..thread_count)
        .map(|index| {
            let offset = index * jobs_per_thread;
            WorkerQueue::new(index, offset, jobs_per_thread, pool.id_block(offset, jobs_per_thread))
        })
        .collect();
    // The initializing thread is worker 0.
    queues[0].register_current_thread();
    THREAD_INDEX.with(|cell| cell.set(0));

    let system = Box::new(JobSystem {
        queues,
        pool,
        workers: Mutex::new(Vec::with_capacity(thread_count - 1)),
        wake: Mutex::new(WakeState { is_running: true }),
        job_is_ready: Condvar::new(),
        active_jobs: AtomicI32::new(0),
        thread_count,
        jobs_per_thread,
    });

    let ptr = Box::into_raw(system);
    if JOB_SYSTEM
        .compare_exchange(ptr::null_mut(), ptr, Ordering::AcqRel, Ordering::Acquire)
        .is_err()
    {
        // SAFETY: The pointer we just created was never published.
        drop(unsafe { Box::from_raw(ptr) });
        panic!("the job system is already initialized");
    }

    // SAFETY: Published above; stays valid until `destroy` joins all workers.
    let js: &'static JobSystem = unsafe { &*ptr };
    let mut workers = js.workers.lock().unwrap();
    for index in 1..thread_count {
        let handle = thread::Builder::new()
            .name(format!("worker {index}"))
            .spawn(move || worker_main(js, index))
            .expect("failed to spawn worker thread");
        workers.push(handle);
    }
}

/// Tears down the job system: stops and joins all workers, then releases the
/// pool memory. Callers must have waited on every outstanding root job first;
/// pending work is not drained. Calling this again (or before `init`) is a
/// no-op.
pub fn destroy() {
    let ptr = JOB_SYSTEM.swap(ptr::null_mut(), Ordering::AcqRel);
    if ptr.is_null() {
        return;
    }
    // SAFETY: The pointer was published by `init` and unpublished just now;
    // it stays valid until the box is reclaimed below.
    let js = unsafe { &*ptr };

    debug!("destroying job system");
    js.wake.lock().unwrap().is_running = false;
    js.job_is_ready.notify_all();

    let handles: Vec<JoinHandle<()>> = js.workers.lock().unwrap().drain(..).collect();
    for handle in handles {
        let _ = handle.join();
    }

    // SAFETY: Every worker has exited, so no references to the system remain.
    drop(unsafe { Box::from_raw(ptr) });
}

/// Returns the number of spawned worker threads (the calling thread, worker
/// 0, is not counted).
pub fn worker_thread_count() -> usize {
    system().thread_count - 1
}

/// Returns the index of the worker bound to the calling thread.
pub fn this_thread_index() -> usize {
    let _ = system();
    THREAD_INDEX.with(Cell::get)
}

/// Returns a snapshot of a worker thread's scheduling counters.
pub fn thread_stats(thread_index: usize) -> ThreadStats {
    let js = system();
    assert!(thread_index < js.thread_count);
    js.queues[thread_index].counters.snapshot()
}

// -----------------------------------------------------------------------------
// Job creation

/// Creates an empty job. It does nothing when executed; its purpose is to
/// act as a join point for children and continuations.
pub fn create_job() -> JobId {
    system().alloc_job(None)
}

/// Creates a job executing `function` with packed arguments.
///
/// `args` must be trivially copyable (`Copy`); it is stored by value in the
/// job's payload and read back inside the function with
/// [`JobParams::unpack`](crate::JobParams::unpack). Pass a tuple to supply
/// several values, or `()` for none.
pub fn create_job_with<T: Copy>(function: JobFunction, args: T) -> JobId {
    let js = system();
    let id = js.alloc_job(Some(function));
    // SAFETY: Owner thread, job not yet started.
    unsafe { js.pool.job(id).write_args(args) };
    id
}

/// Creates an empty child job of `parent`. The parent is not considered
/// finished until the child has finished.
pub fn create_child_job(parent: JobId) -> JobId {
    system().create_child(parent, None)
}

/// Creates a child job of `parent` executing `function` with packed
/// arguments. See [`create_job_with`].
pub fn create_child_job_with<T: Copy>(parent: JobId, function: JobFunction, args: T) -> JobId {
    let js = system();
    let id = js.create_child(parent, Some(function));
    // SAFETY: Owner thread, job not yet started.
    unsafe { js.pool.job(id).write_args(args) };
    id
}

/// Creates and immediately starts a child job of `parent`.
pub fn start_child_job<T: Copy>(parent: JobId, function: JobFunction, args: T) {
    start_job(create_child_job_with(parent, function, args));
}

/// Creates, attaches, and starts a child job of `parent` executing `closure`.
/// The closure receives the executing thread's index, and must be
/// self-contained: it is moved into the job and may run on any worker.
pub fn start_function<F>(parent: JobId, closure: F)
where
    F: FnOnce(usize) + Send + 'static,
{
    let js = system();
    let id = js.create_child(parent, None);
    // SAFETY: Owner thread, job not yet started; the slot was just reset.
    unsafe { js.pool.job(id).install_closure(closure) };
    start_job(id);
}

/// Adds a continuation to `antecedent`: a job that runs after the antecedent
/// finishes, as a child of the antecedent's parent. The antecedent must not
/// have been started yet. Continuations run in insertion order relative to
/// their enqueueing, and are never started directly.
pub fn add_continuation(antecedent: JobId, function: JobFunction) -> JobId {
    system().add_continuation_impl(antecedent, Some(function))
}

/// Adds a continuation with packed arguments. See [`add_continuation`] and
/// [`create_job_with`].
pub fn add_continuation_with<T: Copy>(
    antecedent: JobId,
    function: JobFunction,
    args: T,
) -> JobId {
    let js = system();
    let id = js.add_continuation_impl(antecedent, Some(function));
    // SAFETY: Owner thread, job not yet started.
    unsafe { js.pool.job(id).write_args(args) };
    id
}

/// Adds a closure continuation. See [`add_continuation`] and
/// [`start_function`].
pub fn add_continuation_closure<F>(antecedent: JobId, closure: F) -> JobId
where
    F: FnOnce(usize) + Send + 'static,
{
    let js = system();
    let id = js.add_continuation_impl(antecedent, None);
    // SAFETY: Owner thread, job not yet started.
    unsafe { js.pool.job(id).install_closure(closure) };
    id
}

// -----------------------------------------------------------------------------
// Starting and waiting

/// Starts a job: pushes it onto the deque of the thread that created it. Only
/// that thread may start it, and continuations may not be started manually.
pub fn start_job(id: JobId) {
    let js = system();
    let job = js.pool.job(id);
    debug_assert!(!job.started(), "job {id} has already been started");
    debug_assert!(
        !job.is_continuation(),
        "continuations are started by their antecedent's finish"
    );
    let queue = js.owner_queue(id);
    queue.assert_owner();
    // SAFETY: This is the owning thread and the job has not been published.
    unsafe { job.mark_started() };
    js.push_job(queue, id);
}

/// Blocks until `id` has finished, helping with scheduled work in the
/// meantime. Only the thread that created the job may wait on it. The wait
/// is deadlock-free because the waiting thread executes pending jobs,
/// including the ones the target is made of.
pub fn wait_for_job(id: JobId) {
    assert_ne!(id, NULL_JOB_ID);
    let js = system();
    let queue = js.owner_queue(id);
    queue.assert_owner();
    while js.pool.job(id).pending() > 0 {
        if let Some(next) = js.next_job(queue) {
            js.execute_job(next, queue);
        } else {
            thread::sleep(IDLE_SLEEP);
        }
    }
}

/// Starts a job and waits for it to finish. See [`start_job`] and
/// [`wait_for_job`].
pub fn start_and_wait_for_job(id: JobId) {
    start_job(id);
    wait_for_job(id);
}

// -----------------------------------------------------------------------------
// Parallel for

/// Creates (but does not start) a parallel-for over `[0, element_count)` as a
/// child of `parent`.
///
/// The returned driver job recursively halves the range until pieces are no
/// larger than `split_threshold` elements (a threshold of 0 keeps the whole
/// range as one piece), then invokes `function` on each leaf range. Load
/// balancing falls out of stealing: a stolen non-leaf driver splits on the
/// thief, producing new stealable work there.
///
/// `args` is packed alongside the range and handed to every leaf invocation;
/// it must fit [`PARALLEL_FOR_ARGS_SIZE`](crate::PARALLEL_FOR_ARGS_SIZE)
/// bytes.
pub fn parallel_for<T: Copy>(
    parent: JobId,
    split_threshold: usize,
    function: ParallelForFunction,
    element_count: usize,
    args: T,
) -> JobId {
    debug_assert!(element_count <= u32::MAX as usize);
    debug_assert!(split_threshold <= u32::MAX as usize);
    let data = ParallelForData {
        function,
        split_threshold: split_threshold as u32,
        offset: 0,
        count: element_count as u32,
        args: ForArgs::pack(args),
    };
    create_child_job_with(parent, parallel_for_driver, data)
}

// -----------------------------------------------------------------------------
// Tests
