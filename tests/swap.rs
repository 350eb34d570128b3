use fiber_context::{
    prepare, release, swap, thread_cache_stats, with_thread_cache, Fiber, FiberState, Stack,
    StackCache,
};
use std::cell::Cell;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// State reachable from fiber entry points through a raw pointer.
///
/// Suspended fibers keep a shared reference derived from that pointer, so the test side
/// reaches the state through the same pointer and only takes `&mut` while no fiber that will
/// run again is using it.
struct Shared<T>(*mut T);

impl<T> Shared<T> {
    fn new(value: T) -> Self {
        Self(Box::into_raw(Box::new(value)))
    }

    fn arg(&self) -> usize {
        self.0 as usize
    }

    fn get(&self) -> &T {
        unsafe { &*self.0 }
    }

    fn get_mut(&mut self) -> &mut T {
        unsafe { &mut *self.0 }
    }
}

impl<T> Drop for Shared<T> {
    fn drop(&mut self) {
        drop(unsafe { Box::from_raw(self.0) });
    }
}

struct Harness {
    caller: Fiber,
    worker: Fiber,
    counter: Cell<u32>,
}

impl Harness {
    fn new() -> Shared<Self> {
        Shared::new(Self {
            caller: Fiber::new(),
            worker: Fiber::new(),
            counter: Cell::new(0),
        })
    }
}

extern "C" fn bump(arg: usize) {
    let h = unsafe { &*(arg as *const Harness) };
    loop {
        h.counter.set(h.counter.get() + 1);
        unsafe { swap(&h.caller, &h.worker) };
    }
}

#[test]
fn five_cycles_allocate_once() {
    init_tracing();
    let cache = StackCache::new();
    let mut total = 0;
    for _ in 0..5 {
        let mut h = Harness::new();
        let arg = h.arg();
        h.get_mut().worker.prepare(&cache, bump, arg);
        unsafe { swap(&h.get().worker, &h.get().caller) };
        h.get_mut().worker.release(&cache);
        total += h.get().counter.get();
    }
    assert_eq!(total, 5);

    let stats = cache.stats();
    assert_eq!(stats.allocated, 1);
    assert_eq!(stats.reused, 4);
    assert_eq!(stats.freed, 0);
    assert!(!cache.is_empty());
}

#[test]
fn thread_cache_cycles_allocate_at_most_once() {
    init_tracing();
    let before = thread_cache_stats();
    let mut total = 0;
    for _ in 0..5 {
        let mut h = Harness::new();
        let arg = h.arg();
        prepare(&mut h.get_mut().worker, bump, arg);
        unsafe { swap(&h.get().worker, &h.get().caller) };
        release(&mut h.get_mut().worker);
        total += h.get().counter.get();
    }
    assert_eq!(total, 5);
    assert!(thread_cache_stats().allocated - before.allocated <= 1);
}

#[test]
fn release_unstarted_fiber_fills_cache() {
    init_tracing();
    let cache = StackCache::new();
    let mut h = Harness::new();
    let arg = h.arg();
    let worker = &mut h.get_mut().worker;
    worker.prepare(&cache, bump, arg);
    let bottom = worker.stack().map(Stack::bottom);
    worker.release(&cache);

    assert_eq!(h.get().counter.get(), 0);
    assert_eq!(h.get().worker.state(), FiberState::Released);
    assert!(!cache.is_empty());
    assert_eq!(Some(cache.acquire().bottom()), bottom);
}

#[test]
fn caller_locals_survive_swaps() {
    init_tracing();
    let cache = StackCache::new();
    let mut h = Harness::new();
    let arg = h.arg();
    h.get_mut().worker.prepare(&cache, bump, arg);

    let mut acc = 0u64;
    let mut ratio = 1.0f64;
    let words = vec![String::from("alpha"), String::from("beta")];
    for i in 0..100u64 {
        acc = acc.wrapping_mul(31).wrapping_add(i);
        ratio *= 1.5;
        unsafe { swap(&h.get().worker, &h.get().caller) };
        ratio /= 1.5;
    }

    let mut expected = 0u64;
    for i in 0..100u64 {
        expected = expected.wrapping_mul(31).wrapping_add(i);
    }
    assert_eq!(acc, expected);
    assert_eq!(ratio, 1.0);
    assert_eq!(words.join(" "), "alpha beta");
    assert_eq!(h.get().counter.get(), 100);
    h.get_mut().worker.release(&cache);
}

#[test]
fn live_fibers_have_distinct_stacks() {
    extern "C" fn never_run(_: usize) {}

    let cache = StackCache::new();
    cache.recycle(cache.acquire());

    let mut a = Fiber::new();
    let mut b = Fiber::new();
    a.prepare(&cache, never_run, 0);
    b.prepare(&cache, never_run, 0);
    let a_bottom = a.stack().map(Stack::bottom).unwrap();
    let b_bottom = b.stack().map(Stack::bottom).unwrap();
    assert_ne!(a_bottom, b_bottom);

    a.release(&cache);
    b.release(&cache);
    let stats = cache.stats();
    assert_eq!(stats.reused, 1);
    assert_eq!(stats.freed, 1);
}

struct Ring {
    main: Fiber,
    left: Fiber,
    right: Fiber,
    trace: Cell<u64>,
}

impl Ring {
    fn push(&self, digit: u64) {
        self.trace.set(self.trace.get() * 10 + digit);
    }
}

extern "C" fn left(arg: usize) {
    let r = unsafe { &*(arg as *const Ring) };
    loop {
        r.push(1);
        unsafe { swap(&r.right, &r.left) };
        r.push(3);
        unsafe { swap(&r.main, &r.left) };
    }
}

extern "C" fn right(arg: usize) {
    let r = unsafe { &*(arg as *const Ring) };
    loop {
        r.push(2);
        unsafe { swap(&r.left, &r.right) };
    }
}

#[test]
fn fibers_hand_off_between_each_other() {
    init_tracing();
    let cache = StackCache::new();
    let mut r = Shared::new(Ring {
        main: Fiber::new(),
        left: Fiber::new(),
        right: Fiber::new(),
        trace: Cell::new(0),
    });
    let arg = r.arg();
    r.get_mut().left.prepare(&cache, left, arg);
    r.get_mut().right.prepare(&cache, right, arg);

    unsafe { swap(&r.get().left, &r.get().main) };
    assert_eq!(r.get().trace.get(), 123);
    assert_eq!(r.get().left.state(), FiberState::Suspended);
    assert_eq!(r.get().right.state(), FiberState::Suspended);

    unsafe { swap(&r.get().left, &r.get().main) };
    assert_eq!(r.get().trace.get(), 123_123);

    r.get_mut().left.release(&cache);
    r.get_mut().right.release(&cache);
}

struct Nested {
    main: Fiber,
    outer: Fiber,
    inner: Cell<Option<*const Fiber>>,
    depth: Cell<u32>,
}

extern "C" fn inner_body(arg: usize) {
    let n = unsafe { &*(arg as *const Nested) };
    n.depth.set(n.depth.get() + 10);
    let inner = n.inner.get().unwrap();
    unsafe { swap(&n.outer, &*inner) };
    unreachable!();
}

extern "C" fn outer_body(arg: usize) {
    let n = unsafe { &*(arg as *const Nested) };
    loop {
        // A fiber can itself prepare, run and release another fiber.
        let mut inner = Fiber::new();
        prepare(&mut inner, inner_body, arg);
        n.inner.set(Some(&inner as *const Fiber));
        unsafe { swap(&inner, &n.outer) };
        n.inner.set(None);
        release(&mut inner);

        n.depth.set(n.depth.get() + 1);
        unsafe { swap(&n.main, &n.outer) };
    }
}

#[test]
fn fiber_runs_nested_fiber() {
    init_tracing();
    let mut n = Shared::new(Nested {
        main: Fiber::new(),
        outer: Fiber::new(),
        inner: Cell::new(None),
        depth: Cell::new(0),
    });
    let arg = n.arg();
    prepare(&mut n.get_mut().outer, outer_body, arg);

    for round in 1..=3 {
        unsafe { swap(&n.get().outer, &n.get().main) };
        assert_eq!(n.get().depth.get(), 11 * round);
    }
    release(&mut n.get_mut().outer);
    with_thread_cache(|cache| assert!(!cache.is_empty()));
}
