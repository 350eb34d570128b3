use crate::error::{fatal, ContextError};
use crate::page_size;
use core::ptr::{self, NonNull};

/// Usable size of every fiber stack.
pub const STACK_SIZE: usize = 1024 * 1024;

/// An owned, fixed-size region of memory used as a fiber's call stack.
///
/// A `Stack` cannot be copied or cloned. At any time it belongs to exactly one of a live
/// [`Fiber`](crate::Fiber) or a [`StackCache`](crate::StackCache); dropping it returns the
/// memory to the OS.
///
/// Layout (addresses grow to the right):
///
/// ```text
/// map .. map+guard: guard page (only with the `guard-page` feature)
/// map+guard .. map+len: usable stack, grows down from the top
/// ```
pub struct Stack {
    map: NonNull<u8>,
    len: usize,
    guard: usize,
}

impl Stack {
    /// Map a new stack with at least `size` usable bytes.
    ///
    /// Aborts the process if `size` does not fit in the address space or the memory cannot
    /// be mapped.
    pub fn allocate(size: usize) -> Self {
        let guard = if cfg!(feature = "guard-page") {
            page_size::get()
        } else {
            0
        };
        let len = match page_size::round_up(size.max(1))
            .and_then(|usable| usable.checked_add(guard))
        {
            Some(len) => len,
            None => fatal(ContextError::StackTooLarge { size }),
        };

        unsafe {
            let ptr = libc::mmap(
                ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_STACK,
                -1,
                0,
            );
            if ptr == libc::MAP_FAILED {
                fatal(ContextError::last_os(|source| ContextError::StackMap {
                    size: len,
                    source,
                }));
            }

            // Guard page to turn an overflow into a fault
            if guard != 0 && libc::mprotect(ptr, guard, libc::PROT_NONE) != 0 {
                fatal(ContextError::last_os(ContextError::GuardPage));
            }

            Self {
                map: NonNull::new_unchecked(ptr as *mut u8),
                len,
                guard,
            }
        }
    }

    /// Lowest usable address.
    pub fn bottom(&self) -> *mut u8 {
        unsafe { self.map.as_ptr().add(self.guard) }
    }

    /// One past the highest usable address. The stack grows down from here.
    pub fn top(&self) -> *mut u8 {
        unsafe { self.map.as_ptr().add(self.len) }
    }

    /// Number of usable bytes.
    pub fn size(&self) -> usize {
        self.len - self.guard
    }
}

impl Drop for Stack {
    fn drop(&mut self) {
        unsafe { libc::munmap(self.map.as_ptr() as _, self.len) };
    }
}

impl core::fmt::Debug for Stack {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Stack")
            .field("bottom", &self.bottom())
            .field("size", &self.size())
            .finish()
    }
}

#[test]
fn stack_geometry() {
    let stack = Stack::allocate(STACK_SIZE);
    assert_eq!(stack.size(), STACK_SIZE);
    assert_eq!(stack.top() as usize - stack.bottom() as usize, STACK_SIZE);
    assert_eq!(stack.top() as usize % 16, 0);
}

#[test]
fn stack_rounds_to_pages() {
    let stack = Stack::allocate(1);
    assert_eq!(stack.size(), page_size::get());
}

#[test]
fn stack_size_is_at_least_requested() {
    let page = page_size::get();
    let stack = Stack::allocate(3 * page + 1);
    assert_eq!(stack.size(), 4 * page);
}

#[test]
fn stack_is_writable_end_to_end() {
    let stack = Stack::allocate(64 * 1024);
    unsafe {
        stack.bottom().write(0xa5);
        stack.top().sub(1).write(0x5a);
        assert_eq!(stack.bottom().read(), 0xa5);
        assert_eq!(stack.top().sub(1).read(), 0x5a);
    }
}
