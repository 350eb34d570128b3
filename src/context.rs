//! Saved machine state, backed by the OS `ucontext` facility.

use crate::error::{fatal, ContextError};
use crate::stack::Stack;
use core::cell::UnsafeCell;
use core::{mem, ptr};
use libc::{c_int, ucontext_t};

/// Entry point of a fiber. Receives the word passed to [`Fiber::prepare`](crate::Fiber::prepare).
///
/// The function must never return: it has to leave by swapping to another fiber. Returning
/// aborts the process.
pub type EntryFn = extern "C" fn(usize);

extern "C" {
    fn getcontext(ucp: *mut ucontext_t) -> c_int;
    fn makecontext(ucp: *mut ucontext_t, func: extern "C" fn(), argc: c_int, ...);
    fn swapcontext(oucp: *mut ucontext_t, ucp: *const ucontext_t) -> c_int;
}

// First frame on every fiber stack.
extern "C" fn trampoline(entry: usize, arg: usize) {
    // SAFETY: `arm` passes an `EntryFn` cast to usize.
    let entry = unsafe { mem::transmute::<usize, EntryFn>(entry) };
    entry(arg);
    fatal(ContextError::EntryReturned)
}

/// Register set and stack description of one context.
///
/// glibc's `ucontext_t` holds a pointer into itself once captured, so an `ExecutionState`
/// is only ever handed out boxed and must not be moved out of its box.
pub(crate) struct ExecutionState(UnsafeCell<ucontext_t>);

impl ExecutionState {
    pub(crate) fn new() -> Box<Self> {
        // SAFETY: ucontext_t is plain old data.
        let state = Box::new(Self(UnsafeCell::new(unsafe { mem::zeroed() })));
        state.reset();
        state
    }

    fn get(&self) -> *mut ucontext_t {
        self.0.get()
    }

    /// Forget the stack and the return link.
    pub(crate) fn reset(&self) {
        unsafe {
            let uc = self.get();
            (*uc).uc_stack.ss_sp = ptr::null_mut();
            (*uc).uc_stack.ss_size = 0;
            (*uc).uc_link = ptr::null_mut();
        }
    }

    /// Lowest address of the stack this context is anchored to, null if none.
    pub(crate) fn stack_pointer(&self) -> *mut u8 {
        unsafe { (*self.get()).uc_stack.ss_sp as *mut u8 }
    }

    /// Capture a baseline context on `stack` that starts at `entry(arg)` when switched to.
    ///
    /// # Safety
    ///
    /// The state must not be the one currently executing or a suspended one that something
    /// still intends to resume, and `stack` must outlive every switch into this state.
    pub(crate) unsafe fn arm(
        &self,
        stack: &Stack,
        entry: EntryFn,
        arg: usize,
    ) -> Result<(), ContextError> {
        let uc = self.get();
        if getcontext(uc) != 0 {
            return Err(ContextError::last_os(ContextError::Capture));
        }

        (*uc).uc_stack.ss_sp = stack.bottom() as *mut libc::c_void;
        (*uc).uc_stack.ss_size = stack.size();
        (*uc).uc_stack.ss_flags = 0;
        (*uc).uc_link = ptr::null_mut();

        let start = mem::transmute::<extern "C" fn(usize, usize), extern "C" fn()>(trampoline);
        makecontext(uc, start, 2, entry as usize, arg);
        Ok(())
    }

    /// Save the running context into `from` and resume `to`.
    ///
    /// Returns once something switches back into `from`.
    ///
    /// # Safety
    ///
    /// `to` must have been armed or saved by an earlier switch, and its stack must still be
    /// alive.
    pub(crate) unsafe fn switch(from: &Self, to: &Self) -> Result<(), ContextError> {
        if swapcontext(from.get(), to.get()) != 0 {
            return Err(ContextError::last_os(ContextError::Switch));
        }
        Ok(())
    }
}

#[test]
fn reset_clears_stack() {
    let stack = Stack::allocate(64 * 1024);
    let state = ExecutionState::new();
    assert!(state.stack_pointer().is_null());

    extern "C" fn never_run(_: usize) {}
    unsafe { state.arm(&stack, never_run, 0).unwrap() };
    assert_eq!(state.stack_pointer(), stack.bottom());

    state.reset();
    assert!(state.stack_pointer().is_null());
}

#[test]
fn switch_round_trip() {
    struct Pair {
        main: Box<ExecutionState>,
        child: Box<ExecutionState>,
        seen: core::cell::Cell<usize>,
    }

    extern "C" fn child(arg: usize) {
        let pair = unsafe { &*(arg as *const Pair) };
        loop {
            pair.seen.set(pair.seen.get() + 1);
            unsafe { ExecutionState::switch(&pair.child, &pair.main).unwrap() };
        }
    }

    let stack = Stack::allocate(64 * 1024);
    let pair = Pair {
        main: ExecutionState::new(),
        child: ExecutionState::new(),
        seen: core::cell::Cell::new(0),
    };
    unsafe {
        pair.child
            .arm(&stack, child, &pair as *const Pair as usize)
            .unwrap();
        for i in 1..=3 {
            ExecutionState::switch(&pair.main, &pair.child).unwrap();
            assert_eq!(pair.seen.get(), i);
        }
    }
}
