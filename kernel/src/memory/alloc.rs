//! The kernel's `#[global_allocator]`: a thin `GlobalAlloc` wrapper that routes every allocation
//! straight into whichever [`crate::memory::vmpool::VmPool`] is current, rather than running a
//! separate heap algorithm (buddy, slab, ...) over a pre-reserved arena the way the original
//! kernel's `smallheap`-backed `KernelAllocator` did. Heap allocation isn't a distinct subsystem
//! here: it's just another consumer of a VM pool's `allocate`/`release`.

use core::alloc::{GlobalAlloc, Layout};

use spin::Mutex;

use crate::memory::paging;
use crate::memory::vmpool::VmPool;

static CURRENT_POOL: Mutex<Option<&'static Mutex<VmPool>>> = Mutex::new(None);

/// Point the global allocator at `pool`. Called once the kernel's own VM pool has been
/// constructed and registered with the kernel page table during boot, and temporarily by
/// `sched::thread` while it populates a new thread's own VM pool.
pub fn set_current_pool(pool: &'static Mutex<VmPool>) {
    *CURRENT_POOL.lock() = Some(pool);
}

/// Whichever pool `set_current_pool` last pointed at, if any. `sched::thread` saves this before
/// swapping to a new thread's pool and restores it afterward.
pub fn current_pool() -> Option<&'static Mutex<VmPool>> {
    *CURRENT_POOL.lock()
}

pub struct KernelAllocator;

unsafe impl GlobalAlloc for KernelAllocator {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        let pool = match *CURRENT_POOL.lock() {
            Some(p) => p,
            None => return core::ptr::null_mut(),
        };
        // VmPool hands out whole pages; `Layout::align` beyond PAGE_SIZE is not a case any
        // allocation here needs, so it is not accounted for.
        match pool.lock().allocate(layout.size() as u32) {
            Ok(addr) => addr as *mut u8,
            Err(e) => {
                crate::printk!("alloc: VMP allocation of {} bytes failed: {:?}\n", layout.size(), e);
                core::ptr::null_mut()
            }
        }
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        let pool = match *CURRENT_POOL.lock() {
            Some(p) => p,
            None => return,
        };
        let pt = paging::current_page_table();
        if let Err(e) = pool.lock().release(ptr as u32, pt) {
            crate::printk!("alloc: VMP release of {:#x} failed: {:?}\n", ptr as u32, e);
        }
    }
}

#[global_allocator]
static ALLOCATOR: KernelAllocator = KernelAllocator;

#[alloc_error_handler]
fn oom(layout: Layout) -> ! {
    panic!("out of memory: requested {} bytes (align {})", layout.size(), layout.align());
}
