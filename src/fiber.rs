use crate::cache::StackCache;
use crate::context::{EntryFn, ExecutionState};
use crate::error::fatal;
use crate::stack::Stack;
use core::cell::Cell;
use core::fmt;
use tracing::trace;

/// Lifecycle of a [`Fiber`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FiberState {
    /// No stack, not runnable. Can still be swapped *from* to save the running context.
    Uninitialized,
    /// Has a stack and an entry point, never swapped into.
    Prepared,
    /// Currently executing.
    Running,
    /// Saved by a swap and waiting to be resumed.
    Suspended,
    /// Stack given back; the fiber is terminal.
    Released,
}

impl FiberState {
    /// Whether [`swap`] may name a fiber in this state as its target.
    pub fn is_resumable(self) -> bool {
        matches!(self, FiberState::Prepared | FiberState::Suspended)
    }
}

/// An independently schedulable execution context with its own stack.
///
/// Control only ever moves between fibers through [`swap`]. A fiber used to record the
/// thread's original context never needs a stack of its own: create it with
/// [`Fiber::new`] and pass it as the `from` side of the first swap.
pub struct Fiber {
    context: Box<ExecutionState>,
    stack: Option<Stack>,
    state: Cell<FiberState>,
}

impl Fiber {
    pub fn new() -> Self {
        Self {
            context: ExecutionState::new(),
            stack: None,
            state: Cell::new(FiberState::Uninitialized),
        }
    }

    /// Reset to the uninitialized state: no stack and no return link.
    ///
    /// A stack still held is unmapped rather than cached. Calling this on a fiber that
    /// some other context intends to resume is a usage error.
    pub fn initialize(&mut self) {
        debug_assert_ne!(self.state.get(), FiberState::Running);
        self.context.reset();
        self.stack = None;
        self.state.set(FiberState::Uninitialized);
    }

    /// Arm the fiber to run `entry(arg)` on a stack taken from `cache`.
    ///
    /// `entry` starts running at the first [`swap`] into this fiber and must leave by
    /// swapping elsewhere; it has no return target.
    pub fn prepare(&mut self, cache: &StackCache, entry: EntryFn, arg: usize) {
        debug_assert_eq!(
            self.state.get(),
            FiberState::Uninitialized,
            "only an uninitialized fiber can be prepared"
        );

        let stack = cache.acquire();
        // SAFETY: the fiber is not running or suspended, and the stack is owned by the
        // fiber from here on.
        if let Err(err) = unsafe { self.context.arm(&stack, entry, arg) } {
            fatal(err);
        }
        trace!(fiber = ?self.context_ptr(), bottom = ?stack.bottom(), "prepared fiber");
        self.stack = Some(stack);
        self.state.set(FiberState::Prepared);
    }

    /// Hand the stack back to `cache`. The fiber must not be swapped into again.
    pub fn release(&mut self, cache: &StackCache) {
        debug_assert_ne!(
            self.state.get(),
            FiberState::Running,
            "cannot release the running fiber"
        );

        if let Some(stack) = self.stack.take() {
            trace!(fiber = ?self.context_ptr(), "released fiber");
            cache.recycle(stack);
        }
        self.state.set(FiberState::Released);
    }

    pub fn state(&self) -> FiberState {
        self.state.get()
    }

    /// The stack owned by this fiber, if it has one.
    pub fn stack(&self) -> Option<&Stack> {
        self.stack.as_ref()
    }

    fn context_ptr(&self) -> *const ExecutionState {
        &*self.context
    }
}

impl Default for Fiber {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Fiber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Fiber")
            .field("state", &self.state.get())
            .field("stack", &self.stack)
            .finish()
    }
}

/// Save the running context into `from` and resume `to`.
///
/// Returns when some later swap names `from` as its target. This is the only way control
/// moves between fibers.
///
/// Aborts the process if the context switch itself fails.
///
/// # Safety
///
/// `from` must describe the context that is actually running, and `to` must be
/// [prepared](FiberState::Prepared) or [suspended](FiberState::Suspended). Both fibers must
/// stay where they are and must not be released until control has left them. Swapping into
/// a fiber in any other state is undefined behaviour.
pub unsafe fn swap(to: &Fiber, from: &Fiber) {
    debug_assert!(
        to.state.get().is_resumable(),
        "swapping into a fiber in state {:?}",
        to.state.get()
    );
    debug_assert!(!core::ptr::eq(to, from), "swapping a fiber into itself");

    from.state.set(FiberState::Suspended);
    to.state.set(FiberState::Running);
    if let Err(err) = ExecutionState::switch(&from.context, &to.context) {
        fatal(err);
    }
}

#[test]
fn new_fiber_is_uninitialized() {
    let fiber = Fiber::new();
    assert_eq!(fiber.state(), FiberState::Uninitialized);
    assert!(fiber.stack().is_none());
    assert!(fiber.context.stack_pointer().is_null());
}

#[test]
fn prepare_takes_a_stack() {
    extern "C" fn never_run(_: usize) {}

    let cache = StackCache::with_stack_size(64 * 1024);
    let mut fiber = Fiber::new();
    fiber.prepare(&cache, never_run, 0);
    assert_eq!(fiber.state(), FiberState::Prepared);
    let bottom = fiber.stack().map(Stack::bottom).unwrap();
    assert_eq!(fiber.context.stack_pointer(), bottom);

    fiber.release(&cache);
    assert_eq!(fiber.state(), FiberState::Released);
    assert!(fiber.stack().is_none());
    assert!(!cache.is_empty());
}

#[test]
fn initialize_is_idempotent() {
    extern "C" fn never_run(_: usize) {}

    let cache = StackCache::with_stack_size(64 * 1024);
    let mut fiber = Fiber::new();
    fiber.prepare(&cache, never_run, 0);
    fiber.initialize();
    fiber.initialize();
    assert_eq!(fiber.state(), FiberState::Uninitialized);
    assert!(fiber.stack().is_none());
    assert!(fiber.context.stack_pointer().is_null());
    // The dropped stack went back to the OS, not to the cache.
    assert!(cache.is_empty());
}

#[test]
fn resumable_states() {
    assert!(FiberState::Prepared.is_resumable());
    assert!(FiberState::Suspended.is_resumable());
    assert!(!FiberState::Uninitialized.is_resumable());
    assert!(!FiberState::Running.is_resumable());
    assert!(!FiberState::Released.is_resumable());
}

#[test]
fn swap_updates_states() {
    struct Pair {
        main: Fiber,
        child: Fiber,
        observed: Cell<Option<(FiberState, FiberState)>>,
    }

    extern "C" fn child(arg: usize) {
        let pair = unsafe { &*(arg as *const Pair) };
        pair.observed
            .set(Some((pair.main.state(), pair.child.state())));
        unsafe { swap(&pair.main, &pair.child) };
        unreachable!();
    }

    let cache = StackCache::with_stack_size(64 * 1024);
    // Shared with the child through this pointer only.
    let pair = Box::into_raw(Box::new(Pair {
        main: Fiber::new(),
        child: Fiber::new(),
        observed: Cell::new(None),
    }));
    unsafe {
        (*pair).child.prepare(&cache, child, pair as usize);

        swap(&(*pair).child, &(*pair).main);
        assert_eq!(
            (*pair).observed.get(),
            Some((FiberState::Suspended, FiberState::Running))
        );
        assert_eq!((*pair).main.state(), FiberState::Running);
        assert_eq!((*pair).child.state(), FiberState::Suspended);

        (*pair).child.release(&cache);
        drop(Box::from_raw(pair));
    }
}
