use std::sync::atomic::{AtomicUsize, Ordering};

static PAGE_SIZE: AtomicUsize = AtomicUsize::new(0);

pub fn get() -> usize {
    let mut ret = PAGE_SIZE.load(Ordering::Relaxed);
    if ret == 0 {
        ret = unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize };
        assert!(ret >= 4096, "page size must be no smaller than 4KiB");
        PAGE_SIZE.store(ret, Ordering::Relaxed);
    }
    ret
}

/// Round `len` up to a whole number of pages, `None` on overflow.
pub fn round_up(len: usize) -> Option<usize> {
    let page = get();
    Some(len.checked_add(page - 1)? & !(page - 1))
}

#[test]
fn page_size_is_power_of_two() {
    assert!(get().is_power_of_two());
}

#[test]
fn round_up_to_pages() {
    let page = get();
    assert_eq!(round_up(0), Some(0));
    assert_eq!(round_up(1), Some(page));
    assert_eq!(round_up(page), Some(page));
    assert_eq!(round_up(page + 1), Some(2 * page));
}

#[test]
fn round_up_overflow() {
    let page = get();
    let last = usize::MAX & !(page - 1);
    assert_eq!(round_up(last), Some(last));
    assert_eq!(round_up(last + 1), None);
    assert_eq!(round_up(usize::MAX), None);
}
