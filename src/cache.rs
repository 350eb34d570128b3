use crate::stack::{Stack, STACK_SIZE};
use core::cell::Cell;
use tracing::{debug, trace};

/// Counters describing what a [`StackCache`] has done so far.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    /// Stacks freshly mapped because the cache was empty.
    pub allocated: usize,
    /// Stacks handed out from the cache instead of being mapped.
    pub reused: usize,
    /// Stacks kept in the cache on recycle.
    pub retained: usize,
    /// Stacks unmapped on recycle because the cache was already full.
    pub freed: usize,
}

/// Single-slot pool of spare stacks.
///
/// Creating and destroying fibers in a tight loop is the common pattern, so keeping one
/// stack around means that pattern maps memory exactly once. The cache never holds more
/// than one stack, which bounds its overhead to one stack's worth of memory.
///
/// A cache is not `Sync`. Use one per thread; the crate-level functions use
/// [`with_thread_cache`].
pub struct StackCache {
    slot: Cell<Option<Stack>>,
    stack_size: usize,
    stats: Cell<CacheStats>,
}

impl StackCache {
    /// Create an empty cache handing out [`STACK_SIZE`] stacks.
    pub fn new() -> Self {
        Self::with_stack_size(STACK_SIZE)
    }

    /// Create an empty cache handing out stacks of `stack_size` usable bytes.
    pub fn with_stack_size(stack_size: usize) -> Self {
        debug!(stack_size, "creating stack cache");
        Self {
            slot: Cell::new(None),
            stack_size,
            stats: Cell::new(CacheStats::default()),
        }
    }

    pub fn stack_size(&self) -> usize {
        self.stack_size
    }

    pub fn stats(&self) -> CacheStats {
        self.stats.get()
    }

    /// Whether no spare stack is currently held.
    pub fn is_empty(&self) -> bool {
        let stack = self.slot.take();
        let empty = stack.is_none();
        self.slot.set(stack);
        empty
    }

    /// Take the cached stack, or map a new one if there is none.
    pub fn acquire(&self) -> Stack {
        let mut stats = self.stats.get();
        let stack = match self.slot.take() {
            Some(stack) => {
                trace!(bottom = ?stack.bottom(), "reusing cached stack");
                stats.reused += 1;
                stack
            }
            None => {
                let stack = Stack::allocate(self.stack_size);
                trace!(bottom = ?stack.bottom(), size = stack.size(), "allocated stack");
                stats.allocated += 1;
                stack
            }
        };
        self.stats.set(stats);
        stack
    }

    /// Give a stack back. It is kept if the cache is empty and unmapped otherwise.
    pub fn recycle(&self, stack: Stack) {
        let mut stats = self.stats.get();
        match self.slot.take() {
            None => {
                trace!(bottom = ?stack.bottom(), "retaining stack");
                stats.retained += 1;
                self.slot.set(Some(stack));
            }
            Some(cached) => {
                trace!(bottom = ?stack.bottom(), "freeing stack");
                stats.freed += 1;
                self.slot.set(Some(cached));
                drop(stack);
            }
        }
        self.stats.set(stats);
    }

    /// Unmap the spare stack, if any.
    ///
    /// The cache otherwise keeps its stack until it is dropped; for the thread cache of
    /// the main thread that is never.
    pub fn clear(&self) {
        if let Some(stack) = self.slot.take() {
            debug!(bottom = ?stack.bottom(), "clearing stack cache");
        }
    }
}

impl Default for StackCache {
    fn default() -> Self {
        Self::new()
    }
}

thread_local! {
    static THREAD_CACHE: StackCache = StackCache::new();
}

/// Run `f` with the calling thread's stack cache.
pub fn with_thread_cache<R>(f: impl FnOnce(&StackCache) -> R) -> R {
    THREAD_CACHE.with(f)
}

#[test]
fn acquire_from_empty_allocates() {
    let cache = StackCache::with_stack_size(64 * 1024);
    assert!(cache.is_empty());
    let stack = cache.acquire();
    assert_eq!(stack.size(), 64 * 1024);
    assert!(cache.is_empty());
    assert_eq!(
        cache.stats(),
        CacheStats {
            allocated: 1,
            ..CacheStats::default()
        }
    );
}

#[test]
fn recycle_then_acquire_reuses() {
    let cache = StackCache::with_stack_size(64 * 1024);
    let stack = cache.acquire();
    let bottom = stack.bottom();
    cache.recycle(stack);
    assert!(!cache.is_empty());

    let stack = cache.acquire();
    assert_eq!(stack.bottom(), bottom);
    assert!(cache.is_empty());

    let stats = cache.stats();
    assert_eq!(stats.allocated, 1);
    assert_eq!(stats.reused, 1);
    assert_eq!(stats.retained, 1);
}

#[test]
fn holds_at_most_one_stack() {
    let cache = StackCache::with_stack_size(64 * 1024);
    let a = cache.acquire();
    let b = cache.acquire();
    let c = cache.acquire();
    let kept = a.bottom();
    cache.recycle(a);
    cache.recycle(b);
    cache.recycle(c);

    let stats = cache.stats();
    assert_eq!(stats.allocated, 3);
    assert_eq!(stats.retained, 1);
    assert_eq!(stats.freed, 2);

    // The first stack returned is the one kept.
    assert_eq!(cache.acquire().bottom(), kept);
    assert!(cache.is_empty());
}

#[test]
fn clear_empties_slot() {
    let cache = StackCache::with_stack_size(64 * 1024);
    cache.recycle(cache.acquire());
    cache.clear();
    assert!(cache.is_empty());
    cache.acquire();
    assert_eq!(cache.stats().allocated, 2);
}

#[test]
fn thread_cache_uses_default_size() {
    with_thread_cache(|cache| assert_eq!(cache.stack_size(), STACK_SIZE));
}
