//! End-to-end scheduler scenarios: job trees, continuations, closures, and
//! parallel-for loops, each run single-threaded and at hardware concurrency.
//! Both runs must observe the same results; only sibling ordering may differ.

use std::alloc::Layout;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::thread;
use std::time::Duration;

use presto as jobs;
use presto::JobParams;

// -----------------------------------------------------------------------------
// Harness

/// The scheduler is process-wide, so tests take turns.
static EXCLUSIVE: Mutex<()> = Mutex::new(());

fn exclusive() -> MutexGuard<'static, ()> {
    EXCLUSIVE.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Worker counts to exercise: none (the calling thread does everything) and
/// the hardware concurrency.
fn worker_counts() -> [usize; 2] {
    let hardware = thread::available_parallelism().map(|n| n.get()).unwrap_or(2);
    [0, hardware.saturating_sub(1).max(1)]
}

fn with_scheduler(num_workers: usize, scenario: impl FnOnce()) {
    jobs::init(jobs::DEFAULT_MAX_JOBS, num_workers);
    scenario();
    jobs::destroy();
}

fn executed_total() -> u64 {
    (0..=jobs::worker_thread_count())
        .map(|index| jobs::thread_stats(index).num_executed_jobs)
        .sum()
}

fn enqueued_total() -> u64 {
    (0..=jobs::worker_thread_count())
        .map(|index| jobs::thread_stats(index).num_enqueued_jobs)
        .sum()
}

// -----------------------------------------------------------------------------
// Empty parent

#[test]
fn empty_parent_completes_immediately() {
    let _guard = exclusive();
    for workers in worker_counts() {
        with_scheduler(workers, || {
            let root = jobs::create_job();
            jobs::start_and_wait_for_job(root);
            assert_eq!(executed_total(), 1);
        });
    }
}

// -----------------------------------------------------------------------------
// Closure fan-out

static CLOSURE_RUNS: AtomicUsize = AtomicUsize::new(0);
static CLOSURE_DROPS: AtomicUsize = AtomicUsize::new(0);

struct DropTracker;

impl Drop for DropTracker {
    fn drop(&mut self) {
        CLOSURE_DROPS.fetch_add(1, Ordering::SeqCst);
    }
}

#[test]
fn a_hundred_closures_each_run_and_drop_once() {
    let _guard = exclusive();
    for workers in worker_counts() {
        CLOSURE_RUNS.store(0, Ordering::SeqCst);
        CLOSURE_DROPS.store(0, Ordering::SeqCst);
        with_scheduler(workers, || {
            let root = jobs::create_job();
            for _ in 0..100 {
                let tracker = DropTracker;
                jobs::start_function(root, move |_thread_index| {
                    CLOSURE_RUNS.fetch_add(1, Ordering::SeqCst);
                    drop(tracker);
                });
            }
            jobs::start_and_wait_for_job(root);
            assert_eq!(CLOSURE_RUNS.load(Ordering::SeqCst), 100);
            assert_eq!(CLOSURE_DROPS.load(Ordering::SeqCst), 100);
            // Every created job ran exactly once: the 100 closures plus root.
            assert_eq!(executed_total(), 101);
            assert_eq!(enqueued_total(), executed_total());
        });
    }
}

// -----------------------------------------------------------------------------
// Parallel-for over particles

#[derive(Clone, Copy, Default)]
struct Particle {
    x: f32,
    y: f32,
    vx: f32,
    vy: f32,
}

fn update_particles(offset: usize, count: usize, args: &jobs::ForArgs, _thread_index: usize) {
    let (particles, dt) = unsafe { args.unpack::<(*mut Particle, f32)>() };
    for i in offset..offset + count {
        // SAFETY: Leaf ranges are disjoint, and the buffer outlives the wait.
        unsafe {
            let p = &mut *particles.add(i);
            p.x += p.vx * dt;
            p.y += p.vy * dt;
        }
    }
}

#[test]
fn parallel_for_updates_every_particle() {
    let _guard = exclusive();
    for workers in worker_counts() {
        with_scheduler(workers, || {
            let mut particles = vec![Particle::default(); 2048];
            for (i, p) in particles.iter_mut().enumerate() {
                p.vx = i as f32 * 0.05;
                p.vy = i as f32 * 0.05;
            }

            let root = jobs::create_job();
            let update = jobs::parallel_for(
                root,
                1024,
                update_particles,
                particles.len(),
                (particles.as_mut_ptr(), 1.0f32),
            );
            jobs::start_job(update);
            jobs::start_and_wait_for_job(root);

            for (i, p) in particles.iter().enumerate() {
                assert_eq!(p.x, i as f32 * 0.05);
                assert_eq!(p.y, i as f32 * 0.05);
            }
        });
    }
}

static LEAVES: Mutex<Vec<(usize, usize)>> = Mutex::new(Vec::new());

fn record_leaf(offset: usize, count: usize, _args: &jobs::ForArgs, _thread_index: usize) {
    LEAVES.lock().unwrap().push((offset, count));
}

#[test]
fn parallel_for_leaves_cover_the_range_exactly_once() {
    let _guard = exclusive();
    for workers in worker_counts() {
        with_scheduler(workers, || {
            LEAVES.lock().unwrap().clear();
            let root = jobs::create_job();
            let split = jobs::parallel_for(root, 256, record_leaf, 2047, ());
            jobs::start_job(split);
            jobs::start_and_wait_for_job(root);

            let mut leaves = LEAVES.lock().unwrap().clone();
            leaves.sort_unstable();
            let mut covered = 0;
            for (offset, count) in leaves {
                assert_eq!(offset, covered, "leaf ranges must not overlap or leave gaps");
                assert!(count <= 256);
                covered += count;
            }
            assert_eq!(covered, 2047);
        });
    }
}

#[test]
fn parallel_for_over_an_empty_range_is_one_empty_leaf() {
    let _guard = exclusive();
    with_scheduler(0, || {
        LEAVES.lock().unwrap().clear();
        let root = jobs::create_job();
        let split = jobs::parallel_for(root, 16, record_leaf, 0, ());
        jobs::start_job(split);
        jobs::start_and_wait_for_job(root);
        assert_eq!(*LEAVES.lock().unwrap(), vec![(0, 0)]);
    });
}

// -----------------------------------------------------------------------------
// Continuation chain

static STAGE: AtomicUsize = AtomicUsize::new(0);

fn stage_a(_prm: &JobParams) {
    assert_eq!(STAGE.swap(1, Ordering::SeqCst), 0);
}

fn stage_b(_prm: &JobParams) {
    assert_eq!(STAGE.swap(2, Ordering::SeqCst), 1);
}

fn stage_c(_prm: &JobParams) {
    assert_eq!(STAGE.swap(3, Ordering::SeqCst), 2);
}

#[test]
fn continuations_run_strictly_after_their_antecedent() {
    let _guard = exclusive();
    for workers in worker_counts() {
        STAGE.store(0, Ordering::SeqCst);
        with_scheduler(workers, || {
            let root = jobs::create_job();
            let a = jobs::create_child_job_with(root, stage_a, ());
            let b = jobs::add_continuation(a, stage_b);
            let c = jobs::add_continuation(b, stage_c);
            let _ = c;
            jobs::start_job(a);
            jobs::start_and_wait_for_job(root);
            assert_eq!(STAGE.load(Ordering::SeqCst), 3);
            // The root waited for the whole chain: itself, a, b and c.
            assert_eq!(executed_total(), 4);
        });
    }
}

// -----------------------------------------------------------------------------
// Nested fan-out from inside a job body

static BODIES: AtomicUsize = AtomicUsize::new(0);

fn update_rigid_body(prm: &JobParams) {
    let _body_index = unsafe { prm.unpack::<usize>() };
    thread::sleep(Duration::from_micros(20));
    BODIES.fetch_add(1, Ordering::SeqCst);
}

fn physics_broad_phase(prm: &JobParams) {
    let body_count = unsafe { prm.unpack::<usize>() };
    for i in 0..body_count {
        jobs::start_child_job(prm.job, update_rigid_body, i);
    }
}

#[test]
fn children_spawned_inside_a_job_are_waited_for() {
    let _guard = exclusive();
    for workers in worker_counts() {
        BODIES.store(0, Ordering::SeqCst);
        with_scheduler(workers, || {
            let root = jobs::create_job();
            let physics = jobs::create_child_job_with(root, physics_broad_phase, 64usize);
            jobs::start_job(physics);
            jobs::start_and_wait_for_job(root);
            assert_eq!(BODIES.load(Ordering::SeqCst), 64);
        });
    }
}

// -----------------------------------------------------------------------------
// A whole game frame

const NUM_RIGID_BODIES: usize = 64;
const NUM_SKELETONS: usize = 128;
const NUM_MODELS: usize = 300;

static EVENTS: Mutex<Vec<&'static str>> = Mutex::new(Vec::new());
static SKELETONS: AtomicUsize = AtomicUsize::new(0);

fn record(event: &'static str) {
    EVENTS.lock().unwrap().push(event);
}

fn event_index(events: &[&'static str], event: &str) -> usize {
    let mut found = events.iter().enumerate().filter(|(_, e)| **e == event);
    let (index, _) = found.next().unwrap_or_else(|| panic!("stage {event} never ran"));
    assert!(found.next().is_none(), "stage {event} ran more than once");
    index
}

fn frame_simulate(_prm: &JobParams) {
    record("simulate");
}

fn frame_physics(prm: &JobParams) {
    record("physics");
    let body_count = unsafe { prm.unpack::<usize>() };
    for i in 0..body_count {
        jobs::start_child_job(prm.job, update_rigid_body, i);
    }
}

fn frame_animation(prm: &JobParams) {
    record("animation");
    let skeleton_count = unsafe { prm.unpack::<usize>() };
    for _ in 0..skeleton_count {
        jobs::start_function(prm.job, |_thread_index| {
            thread::sleep(Duration::from_micros(20));
            SKELETONS.fetch_add(1, Ordering::SeqCst);
        });
    }
}

fn frame_sync(_prm: &JobParams) {
    record("sync");
}

fn cull_models(_offset: usize, _count: usize, _args: &jobs::ForArgs, _thread_index: usize) {}

fn draw_models(_offset: usize, _count: usize, _args: &jobs::ForArgs, _thread_index: usize) {}

fn frame_cull(prm: &JobParams) {
    record("cull");
    let model_count = unsafe { prm.unpack::<usize>() };
    let cull_loop = jobs::parallel_for(
        prm.job,
        jobs::DEFAULT_PARALLEL_FOR_SPLIT_THRESHOLD,
        cull_models,
        model_count,
        (),
    );
    jobs::start_job(cull_loop);
}

fn frame_draw(prm: &JobParams) {
    record("draw");
    let model_count = unsafe { prm.unpack::<usize>() };
    let draw_loop = jobs::parallel_for(
        prm.job,
        jobs::DEFAULT_PARALLEL_FOR_SPLIT_THRESHOLD,
        draw_models,
        model_count,
        (),
    );
    jobs::start_job(draw_loop);
}

fn frame_submit(_prm: &JobParams) {
    record("submit");
}

fn frame_render(prm: &JobParams) {
    record("render");
    let model_count = unsafe { prm.unpack::<usize>() };
    // cull -> draw -> submit
    let cull = jobs::create_child_job_with(prm.job, frame_cull, model_count);
    let draw = jobs::add_continuation_with(cull, frame_draw, model_count);
    let _submit = jobs::add_continuation(draw, frame_submit);
    jobs::start_job(cull);
}

#[test]
fn game_frame_stages_run_once_in_topological_order() {
    let _guard = exclusive();
    for workers in worker_counts() {
        BODIES.store(0, Ordering::SeqCst);
        SKELETONS.store(0, Ordering::SeqCst);
        with_scheduler(workers, || {
            EVENTS.lock().unwrap().clear();
            let mut particles = vec![Particle::default(); 2048];
            for (i, p) in particles.iter_mut().enumerate() {
                p.vx = i as f32 * 0.05;
                p.vy = i as f32 * 0.025;
            }

            /*
            root
                simulate
                    physics -> animation
                    particles
                sync
                render
                    cull -> draw -> submit
                vsync
            */
            let root = jobs::create_job();
            let simulate = jobs::create_child_job_with(root, frame_simulate, ());
            let physics = jobs::create_child_job_with(simulate, frame_physics, NUM_RIGID_BODIES);
            let _animation = jobs::add_continuation_with(physics, frame_animation, NUM_SKELETONS);
            let particle_update = jobs::parallel_for(
                simulate,
                1024,
                update_particles,
                particles.len(),
                (particles.as_mut_ptr(), 1.0f32),
            );
            jobs::start_job(particle_update);
            let sync = jobs::add_continuation_with(simulate, frame_sync, ());
            let render = jobs::add_continuation_with(sync, frame_render, NUM_MODELS);
            let _vsync = jobs::add_continuation_closure(render, |_thread_index| record("vsync"));

            jobs::start_job(physics);
            jobs::start_job(simulate);
            jobs::start_and_wait_for_job(root);

            assert_eq!(BODIES.load(Ordering::SeqCst), NUM_RIGID_BODIES);
            assert_eq!(SKELETONS.load(Ordering::SeqCst), NUM_SKELETONS);

            let events = EVENTS.lock().unwrap().clone();
            let simulate = event_index(&events, "simulate");
            let physics = event_index(&events, "physics");
            let animation = event_index(&events, "animation");
            let sync = event_index(&events, "sync");
            let render = event_index(&events, "render");
            let cull = event_index(&events, "cull");
            let draw = event_index(&events, "draw");
            let submit = event_index(&events, "submit");
            let vsync = event_index(&events, "vsync");

            // Continuations run after their antecedent's whole subtree.
            assert!(physics < animation);
            assert!(simulate < sync && physics < sync && animation < sync);
            assert!(sync < render);
            assert!(render < cull && cull < draw && draw < submit);
            assert!(submit < vsync);
            assert_eq!(vsync, events.len() - 1, "vsync must be the last stage");

            // Every job pushed was executed, and vice versa.
            assert_eq!(enqueued_total(), executed_total());

            for (i, p) in particles.iter().enumerate() {
                assert_eq!(p.x, i as f32 * 0.05);
                assert_eq!(p.y, i as f32 * 0.025);
            }
        });
    }
}

// -----------------------------------------------------------------------------
// Stats and allocator plumbing

#[test]
fn steal_counters_balance_between_thief_and_victim() {
    let _guard = exclusive();
    with_scheduler(worker_counts()[1], || {
        let root = jobs::create_job();
        for _ in 0..256 {
            jobs::start_function(root, |_thread_index| {
                thread::sleep(Duration::from_micros(5));
            });
        }
        jobs::start_and_wait_for_job(root);

        let stats: Vec<_> = (0..=jobs::worker_thread_count())
            .map(jobs::thread_stats)
            .collect();
        let stolen: u64 = stats.iter().map(|s| s.num_stolen_jobs).sum();
        let given: u64 = stats.iter().map(|s| s.num_given_jobs).sum();
        let attempted: u64 = stats.iter().map(|s| s.num_attempted_stealings).sum();
        assert_eq!(stolen, given);
        assert!(attempted >= stolen);
        assert_eq!(executed_total(), 257);
    });
}

static POOL_BYTES: AtomicUsize = AtomicUsize::new(0);

fn counting_alloc(layout: Layout) -> *mut u8 {
    POOL_BYTES.fetch_add(layout.size(), Ordering::SeqCst);
    unsafe { std::alloc::alloc(layout) }
}

fn counting_free(ptr: *mut u8, layout: Layout) {
    unsafe { std::alloc::dealloc(ptr, layout) }
}

#[test]
fn custom_allocator_provides_the_job_pool() {
    let _guard = exclusive();
    POOL_BYTES.store(0, Ordering::SeqCst);
    jobs::init_with_allocator(
        64,
        0,
        jobs::PoolAllocator {
            alloc: counting_alloc,
            free: counting_free,
        },
    );
    let root = jobs::create_job();
    jobs::start_and_wait_for_job(root);
    jobs::destroy();
    // One slice of 64 jobs at 128 bytes each, plus the 64-entry deque index
    // block at 2 bytes per id.
    assert_eq!(
        POOL_BYTES.load(Ordering::SeqCst),
        64 * jobs::JOB_ALIGNMENT + 64 * std::mem::size_of::<jobs::JobId>()
    );
}
