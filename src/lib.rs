//! # Cooperative fibers with explicit context swaps
//!
//! `fiber-context` is a minimal building block for suspending and resuming a call stack in the
//! middle of execution. A [`Fiber`] is an execution context with its own stack; control moves
//! between fibers only when the running code calls [`swap`]. There is no scheduler and no
//! preemption: exactly one fiber runs at a time, and everything else is frozen in its
//! `Fiber` record.
//!
//! Higher level constructs such as generators are expected to be built on top: prepare a fiber
//! with a trampoline that runs the body, and swap in and out whenever the body yields or is
//! resumed.
//!
//! Creating and destroying fibers in a loop is cheap: a released fiber's stack is kept in a
//! single-slot [`StackCache`] and handed to the next fiber that is prepared.
//!
//! ## Usage
//! ```
//! use fiber_context::{Fiber, prepare, release, swap};
//! use std::cell::Cell;
//!
//! struct Shared {
//!     caller: Fiber,
//!     worker: Fiber,
//!     hits: Cell<u32>,
//! }
//!
//! extern "C" fn work(arg: usize) {
//!     let shared = unsafe { &*(arg as *const Shared) };
//!     loop {
//!         shared.hits.set(shared.hits.get() + 1);
//!         unsafe { swap(&shared.caller, &shared.worker) };
//!     }
//! }
//!
//! // The worker reaches this through a raw pointer, so all access goes through it too.
//! let shared = Box::into_raw(Box::new(Shared {
//!     caller: Fiber::new(),
//!     worker: Fiber::new(),
//!     hits: Cell::new(0),
//! }));
//! unsafe {
//!     prepare(&mut (*shared).worker, work, shared as usize);
//!     for _ in 0..3 {
//!         swap(&(*shared).worker, &(*shared).caller);
//!     }
//!     assert_eq!((*shared).hits.get(), 3);
//!     release(&mut (*shared).worker);
//!     drop(Box::from_raw(shared));
//! }
//! ```
//!
//! ## Failures
//! Usage errors, such as swapping into a fiber that was never prepared, are undefined
//! behaviour and only checked by debug assertions. If the OS refuses to map a stack or to
//! capture or switch a context, the error is logged through `tracing` and the process aborts:
//! execution state can no longer be trusted at that point.
//!
//! ## Threads
//! Fibers and caches are neither `Send` nor `Sync`. The free functions in this crate use a
//! per-thread [`StackCache`]; use [`Fiber::prepare`] and [`Fiber::release`] to supply your own.

mod cache;
mod context;
mod error;
mod fiber;
mod page_size;
mod stack;

pub use cache::{with_thread_cache, CacheStats, StackCache};
pub use context::EntryFn;
pub use fiber::{swap, Fiber, FiberState};
pub use stack::{Stack, STACK_SIZE};

/// Reset `fiber` to the uninitialized state.
pub fn initialize(fiber: &mut Fiber) {
    fiber.initialize();
}

/// Prepare `fiber` to run `entry(arg)`, reusing this thread's cached stack if there is one.
pub fn prepare(fiber: &mut Fiber, entry: EntryFn, arg: usize) {
    with_thread_cache(|cache| fiber.prepare(cache, entry, arg));
}

/// Release `fiber`, keeping its stack in this thread's cache if the cache is empty.
pub fn release(fiber: &mut Fiber) {
    with_thread_cache(|cache| fiber.release(cache));
}

/// Counters of this thread's stack cache.
pub fn thread_cache_stats() -> CacheStats {
    with_thread_cache(StackCache::stats)
}

#[test]
fn thread_cache_amortizes() {
    extern "C" fn never_run(_: usize) {}

    let before = thread_cache_stats();
    for _ in 0..4 {
        let mut fiber = Fiber::new();
        initialize(&mut fiber);
        prepare(&mut fiber, never_run, 0);
        release(&mut fiber);
    }
    let after = thread_cache_stats();
    assert!(after.allocated - before.allocated <= 1);
    assert_eq!(
        (after.allocated - before.allocated) + (after.reused - before.reused),
        4
    );
    assert_eq!(after.freed, before.freed);
}
