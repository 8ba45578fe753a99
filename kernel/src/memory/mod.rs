//! The memory management subsystem: physical frames, page tables, VM pools, and the global
//! allocator that routes through whichever VM pool is current.
//!
//! `init` runs the boot-time construction order: kernel and process frame pools, the memory hole
//! reservation, the kernel page table, paging itself, and finally the kernel's own VM pool (which
//! doubles as the backing store for every later heap allocation). Every singleton it builds is
//! written once into a `static mut` (the same pattern `interrupts::idt`'s `IDT` table uses) rather
//! than boxed onto the heap, since the heap itself does not exist until this function is most of
//! the way through running.

pub mod alloc;
pub mod frame;
pub mod layout;
pub mod paging;
pub mod pte;
pub mod vmpool;

use spin::Mutex;

use crate::memory::frame::ContFramePool;
use crate::memory::layout::{
    KERNEL_POOL_N_FRAMES, KERNEL_POOL_START_FRAME, KERNEL_VMPOOL_TEST_BASE, KERNEL_VMPOOL_TEST_SIZE,
    MEM_HOLE_N_FRAMES, MEM_HOLE_START_FRAME, PROCESS_POOL_N_FRAMES, PROCESS_POOL_START_FRAME,
};
use crate::memory::paging::PageTable;
use crate::memory::vmpool::VmPool;

static mut KERNEL_CFP_STORAGE: Option<Mutex<ContFramePool>> = None;
static mut PROCESS_CFP_STORAGE: Option<Mutex<ContFramePool>> = None;
static mut KERNEL_PT_STORAGE: Option<PageTable> = None;
static mut KERNEL_VMP_STORAGE: Option<Mutex<VmPool>> = None;

/// Run the memory subsystem's boot sequence. Must run with paging disabled and before any other
/// kernel subsystem touches a frame, a page table, or the heap.
///
/// # Safety
///
/// Must be called exactly once, this early in boot: it assumes every physical frame in the kernel
/// and process pool ranges is otherwise unused, and that paging is not yet enabled (every frame it
/// touches is still reachable by its bare physical address).
#[allow(static_mut_refs)]
pub unsafe fn init() {
    KERNEL_CFP_STORAGE = Some(Mutex::new(ContFramePool::new(
        KERNEL_POOL_START_FRAME,
        KERNEL_POOL_N_FRAMES,
        0,
    )));
    let kernel_cfp = KERNEL_CFP_STORAGE.as_ref().unwrap();
    frame::register_pool(kernel_cfp);

    // The process pool's own bitmap has to live somewhere; storing it in the process pool's own
    // first frame(s) (info_frame_no == 0) would consume PROCESS_POOL_START_FRAME itself before
    // the first real get_frames() ever runs. Draw the bitmap frame(s) from the kernel pool instead
    // (a caller-provided frame number in another pool), so the process pool's entire range starts
    // out actually free.
    let process_info_frame = kernel_cfp
        .lock()
        .get_frames(frame::needed_info_frames(PROCESS_POOL_N_FRAMES))
        .expect("out of kernel frames for the process pool's bitmap");

    let mut process_cfp =
        ContFramePool::new(PROCESS_POOL_START_FRAME, PROCESS_POOL_N_FRAMES, process_info_frame);
    process_cfp.mark_inaccessible(MEM_HOLE_START_FRAME, MEM_HOLE_N_FRAMES);
    PROCESS_CFP_STORAGE = Some(Mutex::new(process_cfp));
    let process_cfp = PROCESS_CFP_STORAGE.as_ref().unwrap();
    frame::register_pool(process_cfp);

    paging::init(kernel_cfp, process_cfp);

    KERNEL_PT_STORAGE = Some(PageTable::new_kernel());
    let kernel_pt = KERNEL_PT_STORAGE.as_mut().unwrap();
    kernel_pt.load();
    paging::enable_paging();

    KERNEL_VMP_STORAGE = Some(Mutex::new(VmPool::empty()));
    let kernel_vmp_cell = KERNEL_VMP_STORAGE.as_ref().unwrap();
    let kernel_vmp = VmPool::new(KERNEL_VMPOOL_TEST_BASE, KERNEL_VMPOOL_TEST_SIZE, kernel_pt, kernel_vmp_cell);
    *kernel_vmp_cell.lock() = kernel_vmp;

    let kernel_pt_ref: &'static PageTable = KERNEL_PT_STORAGE.as_ref().unwrap();
    paging::set_kernel_page_table(kernel_pt_ref);

    alloc::set_current_pool(kernel_vmp_cell);
    crate::sched::set_kernel_vmp(kernel_vmp_cell);
}
