//! The two-level page table subsystem: kernel and per-thread page directories, the recursive
//! self-map, and the page-fault handler that backs VM-pool allocations on demand.
//!
//! The recursive self-map trick (directory entry `RECURSIVE_PDE_INDEX` points at its own
//! directory frame) makes every live PTE of the *currently loaded* page table addressable as plain
//! memory at `RECURSIVE_BASE | (va >> 10)`, and the directory's own entries addressable at
//! `RECURSIVE_BASE | (RECURSIVE_PDE_INDEX << 12) | (pde_index * 4)`. Both addresses fall out of
//! reading the MMU's two-level walk as data instead of as a translation.
//!
//! That trick only reaches the page table that is *actually loaded in `cr3` right now*. Building a
//! brand new directory (for a non-kernel `PageTable`) or a brand new secondary page table (for the
//! fault handler) needs to write into a physical frame before it is reachable that way. Two escape
//! hatches handle this, both grounded in the shared low-memory window every address space keeps
//! mapped:
//!
//! - Any frame below [`crate::memory::layout::SHARED_SIZE`] is identity-mapped in *every* address
//!   space (PDE 0 is copied verbatim into every directory), so it can be dereferenced directly by
//!   its physical address regardless of which page table is current.
//! - Any other frame is reached through [`PageTable::with_scratch_mapping`], which borrows one
//!   fixed virtual page inside the eagerly-provisioned shared kernel range (whose PDE is therefore
//!   always present in every directory) to install a throwaway mapping just long enough to
//!   initialize the frame's contents.

use spin::Mutex;

use crate::machine;
use crate::memory::frame::ContFramePool;
use crate::memory::layout::{
    KERNEL_PDE_COUNT, PAGE_SIZE, RECURSIVE_BASE, RECURSIVE_PDE_INDEX, SHARED_SIZE,
};
use crate::memory::pte::{Entry, EntryFlags};
use crate::memory::vmpool::VmPool;

/// One fixed virtual page, inside the shared kernel range but above the identity-mapped 4MiB,
/// reserved for `with_scratch_mapping`. Its PDE is always present (eager provisioning); only its
/// PTE ever changes.
const SCRATCH_VA: u32 = RECURSIVE_BASE - PAGE_SIZE;

/// Process-wide list of VM pools visible from *every* address space (the kernel's own VM pool(s)),
/// walked by the fault handler before it falls back to the faulting page table's own list.
const MAX_KERNEL_VMPOOLS: usize = 4;
/// Per-`PageTable` list of VM pools registered against that one address space.
const MAX_VMPOOLS_PER_PT: usize = 4;

static KERNEL_CFP: Mutex<Option<&'static Mutex<ContFramePool>>> = Mutex::new(None);
static PROCESS_CFP: Mutex<Option<&'static Mutex<ContFramePool>>> = Mutex::new(None);
static PAGING_ENABLED: Mutex<bool> = Mutex::new(false);

/// Physical address of the directory currently loaded in `cr3`, mirrored here so `PageTable::load`
/// can make itself idempotent without reading `cr3` back.
static CURRENT_DIRECTORY_PHYS: Mutex<u32> = Mutex::new(0);

/// Raw pointer to the currently-loaded `PageTable`, so the fault handler can reach its VM pool
/// list. Set by `PageTable::load`. Stored as a `usize` to sidestep `Send`/`Sync` on a raw pointer;
/// every reader runs with interrupts disabled (the fault handler itself, or code holding an
/// `InterruptGuard`), so there is no concurrent mutation to race against.
static CURRENT_PT_PTR: Mutex<usize> = Mutex::new(0);

static KERNEL_VMPOOLS: Mutex<[Option<&'static Mutex<VmPool>>; MAX_KERNEL_VMPOOLS]> =
    Mutex::new([None; MAX_KERNEL_VMPOOLS]);

/// Raw pointer to the kernel's own `PageTable`, distinct from [`CURRENT_PT_PTR`] (whichever table
/// happens to be loaded right now). `sched::thread` needs this to build a new thread's address
/// space off the kernel directory and to reload the kernel table once it is done.
static KERNEL_PT_PTR: Mutex<usize> = Mutex::new(0);

/// Wire the two frame pools the page table subsystem draws from. Must be called once, before any
/// `PageTable` is constructed.
pub fn init(kernel_cfp: &'static Mutex<ContFramePool>, process_cfp: &'static Mutex<ContFramePool>) {
    *KERNEL_CFP.lock() = Some(kernel_cfp);
    *PROCESS_CFP.lock() = Some(process_cfp);
}

/// Promote a VM pool onto the kernel-wide list, visible from every address space's fault
/// handler rather than just the page table it was constructed against. Only reached through
/// `PageTable::register_pool` when that page table is the kernel one.
fn register_kernel_wide(vmp: &'static Mutex<VmPool>) {
    let mut pools = KERNEL_VMPOOLS.lock();
    let slot = pools
        .iter_mut()
        .find(|p| p.is_none())
        .expect("too many kernel-wide VM pools registered");
    *slot = Some(vmp);
}

fn process_frame() -> u32 {
    PROCESS_CFP
        .lock()
        .expect("paging::init not called")
        .lock()
        .get_frames(1)
        .expect("out of process frames while building page tables")
}

fn kernel_frame() -> u32 {
    KERNEL_CFP
        .lock()
        .expect("paging::init not called")
        .lock()
        .get_frames(1)
        .expect("out of kernel frames while building page tables")
}

/// A single address space's page directory, plus the VM pools registered against it.
pub struct PageTable {
    directory_frame: u32,
    is_kernel: bool,
    vmpools: [Option<&'static Mutex<VmPool>>; MAX_VMPOOLS_PER_PT],
}

impl PageTable {
    /// Build the very first (kernel) page table. Called once at boot, before paging is enabled, so
    /// every frame touched here is still reachable by its bare physical address.
    pub fn new_kernel() -> Self {
        assert!(!*PAGING_ENABLED.lock(), "kernel page table must be built before paging is enabled");

        let directory_frame = kernel_frame();
        let directory = unsafe { directory_ptr(directory_frame) };

        for pde_index in 0..KERNEL_PDE_COUNT {
            let pt_frame = process_frame();
            let pt = unsafe { table_ptr(pt_frame) };
            for pte_index in 0..1024usize {
                unsafe { *pt.add(pte_index) = Entry::not_present_rw() };
            }

            if pde_index == 0 {
                // Identity-map the first 4MiB: this is what lets every later frame below
                // SHARED_SIZE be dereferenced directly by its own physical address, in any
                // address space, whether or not paging is on.
                for pte_index in 0..1024usize {
                    let frame_no = pte_index as u32;
                    unsafe {
                        *pt.add(pte_index) =
                            Entry::new(frame_no, EntryFlags::PRESENT | EntryFlags::WRITABLE);
                    }
                }
            }

            unsafe {
                *directory.add(pde_index) =
                    Entry::new(pt_frame, EntryFlags::PRESENT | EntryFlags::WRITABLE);
            }
        }

        for pde_index in KERNEL_PDE_COUNT..1024 {
            unsafe { *directory.add(pde_index) = Entry::not_present_rw() };
        }
        unsafe {
            *directory.add(RECURSIVE_PDE_INDEX) =
                Entry::new(directory_frame, EntryFlags::PRESENT | EntryFlags::WRITABLE);
        }

        PageTable {
            directory_frame,
            is_kernel: true,
            vmpools: [None; MAX_VMPOOLS_PER_PT],
        }
    }

    /// Build a fresh, non-kernel page table: the first 256 PDEs are copied verbatim from the
    /// kernel directory (so the shared range, and its identity-mapped first 4MiB, are reachable
    /// the same way in every address space), its own recursive entry is installed, and the
    /// remaining PDEs start out not-present.
    ///
    /// Unlike `new_kernel`, this runs with paging already enabled, so the new directory frame (a
    /// kernel-pool frame, but not necessarily below `SHARED_SIZE`) is populated through
    /// `with_scratch_mapping` rather than a bare physical pointer.
    pub fn new_user(kernel_directory_frame: u32) -> Self {
        let directory_frame = kernel_frame();

        Self::with_scratch_mapping(directory_frame, |directory| {
            let kernel_directory = unsafe { directory_ptr(kernel_directory_frame) };
            for pde_index in 0..KERNEL_PDE_COUNT {
                unsafe { *directory.add(pde_index) = *kernel_directory.add(pde_index) };
            }
            for pde_index in KERNEL_PDE_COUNT..1024 {
                unsafe { *directory.add(pde_index) = Entry::not_present_rw() };
            }
            unsafe {
                *directory.add(RECURSIVE_PDE_INDEX) =
                    Entry::new(directory_frame, EntryFlags::PRESENT | EntryFlags::WRITABLE);
            }
        });

        PageTable {
            directory_frame,
            is_kernel: false,
            vmpools: [None; MAX_VMPOOLS_PER_PT],
        }
    }

    /// Temporarily map physical frame `frame_no` into [`SCRATCH_VA`] of the *currently loaded*
    /// address space, run `f` against it, then tear the mapping back down.
    ///
    /// Frames below `SHARED_SIZE` are identity-mapped already and don't need this; `f` is run
    /// directly against the frame's own physical address in that case.
    fn with_scratch_mapping<R>(frame_no: u32, f: impl FnOnce(*mut Entry) -> R) -> R {
        if frame_no * PAGE_SIZE < SHARED_SIZE {
            return f((frame_no * PAGE_SIZE) as *mut Entry);
        }

        let pte_va = pte_address(SCRATCH_VA);
        unsafe {
            *(pte_va as *mut Entry) = Entry::new(frame_no, EntryFlags::PRESENT | EntryFlags::WRITABLE);
            machine::write_cr3(machine::read_cr3());

            let result = f(SCRATCH_VA as *mut Entry);

            *(pte_va as *mut Entry) = Entry::not_present_rw();
            machine::write_cr3(machine::read_cr3());
            result
        }
    }

    /// Load this page table into `cr3` and mark it as the one the fault handler should consult.
    /// Idempotent: loading the already-current table is a no-op.
    pub fn load(&self) {
        let phys = self.directory_frame * PAGE_SIZE;
        if *CURRENT_DIRECTORY_PHYS.lock() == phys {
            return;
        }
        unsafe { machine::write_cr3(phys) };
        *CURRENT_DIRECTORY_PHYS.lock() = phys;
        *CURRENT_PT_PTR.lock() = self as *const PageTable as usize;
    }

    /// Register a VM pool against this address space. If this is the kernel page table, the pool
    /// is promoted onto the kernel-wide list instead, so the fault handler recognizes it no matter
    /// which page table happens to be loaded; otherwise it is kept private to this page table's
    /// own list.
    pub fn register_pool(&mut self, vmp: &'static Mutex<VmPool>) {
        if self.is_kernel {
            register_kernel_wide(vmp);
            return;
        }
        let slot = self
            .vmpools
            .iter_mut()
            .find(|p| p.is_none())
            .expect("too many VM pools registered against this page table");
        *slot = Some(vmp);
    }

    fn owns_legitimate(&self, va: u32) -> bool {
        self.vmpools
            .iter()
            .flatten()
            .any(|vmp| vmp.lock().is_legitimate(va))
    }

    /// Remove the mapping for `page_no` (if any) in this table and return its frame to the process
    /// pool. Called by `VmPool::release`.
    pub fn free_page(&self, page_no: u32) {
        let va = page_no * PAGE_SIZE;
        let pte_va = pte_address(va) as *mut Entry;
        unsafe {
            let entry = *pte_va;
            if entry.is_present() {
                crate::memory::frame::release_frames(entry.frame_no());
                *pte_va = Entry::not_present_rw();
                machine::write_cr3(machine::read_cr3());
            }
        }
    }

    /// Tear this page table down: reclaim every secondary page table frame it privately owns
    /// (PDEs 256..1024; the shared kernel range's page tables are never touched, since other
    /// address spaces still reference them) and its own directory frame, then make sure the
    /// currently active table isn't left pointing at freed memory.
    pub fn destroy(self) {
        let directory = unsafe { directory_ptr(self.directory_frame) };
        for pde_index in KERNEL_PDE_COUNT..1024 {
            if pde_index == RECURSIVE_PDE_INDEX {
                continue;
            }
            let entry = unsafe { *directory.add(pde_index) };
            if entry.is_present() {
                crate::memory::frame::release_frames(entry.frame_no());
            }
        }
        crate::memory::frame::release_frames(self.directory_frame);

        let mut current = CURRENT_DIRECTORY_PHYS.lock();
        if *current == self.directory_frame * PAGE_SIZE {
            // The active directory was just reclaimed; the caller is responsible for loading a
            // replacement thread's table before relying on memory access again. We still flush
            // here so stale TLB entries for this table's private mappings don't survive it.
            unsafe { machine::write_cr3(machine::read_cr3()) };
            *current = 0;
        }
    }

    pub fn directory_frame(&self) -> u32 {
        self.directory_frame
    }
}

unsafe fn directory_ptr(directory_frame: u32) -> *mut Entry {
    (directory_frame * PAGE_SIZE) as *mut Entry
}

unsafe fn table_ptr(table_frame: u32) -> *mut Entry {
    (table_frame * PAGE_SIZE) as *mut Entry
}

/// `RECURSIVE_BASE | (va >> 10)`, 4-byte aligned: the virtual address at which the PTE that
/// translates `va` is reachable in the *currently loaded* page table, via the recursive self-map.
/// Requires the PDE covering `va` to already be present.
fn pte_address(va: u32) -> u32 {
    (RECURSIVE_BASE | (va >> 10)) & !0x3
}

/// The virtual address at which the PDE covering `va` is reachable in the currently loaded page
/// table, via the recursive self-map (the directory read back as its own page table).
fn pde_address(va: u32) -> u32 {
    (RECURSIVE_BASE | ((RECURSIVE_PDE_INDEX as u32) << 12) | (((va >> 22) & 0x3FF) * 4)) & !0x3
}

/// Flip the paging-enable bit. After this, `pte_address`/`pde_address` are live and every access
/// to a not-yet-backed virtual address raises a page fault.
pub fn enable_paging() {
    unsafe { machine::enable_paging_bit() };
    *PAGING_ENABLED.lock() = true;
}

/// The page table backing whichever address space is currently loaded. Used by
/// `memory::alloc`'s `GlobalAlloc` impl to find a `PageTable` to pass to `VmPool::release`.
pub fn current_page_table() -> &'static PageTable {
    let ptr = *CURRENT_PT_PTR.lock();
    assert!(ptr != 0, "page fault before any page table was loaded");
    unsafe { &*(ptr as *const PageTable) }
}

/// Record `pt` as *the* kernel page table, for `kernel_page_table()`. Called once, right after
/// `PageTable::new_kernel` and `load` in the boot sequence.
pub fn set_kernel_page_table(pt: &'static PageTable) {
    *KERNEL_PT_PTR.lock() = pt as *const PageTable as usize;
}

/// The kernel's own page table, regardless of whatever happens to be loaded right now. Used by
/// `sched::thread` to build new address spaces off the shared kernel range and to restore `cr3`
/// once it is done setting one up.
pub fn kernel_page_table() -> &'static PageTable {
    let ptr = *KERNEL_PT_PTR.lock();
    assert!(ptr != 0, "kernel page table not yet registered (set_kernel_page_table)");
    unsafe { &*(ptr as *const PageTable) }
}

pub(crate) fn is_legitimate_anywhere(va: u32) -> bool {
    if KERNEL_VMPOOLS.lock().iter().flatten().any(|vmp| vmp.lock().is_legitimate(va)) {
        return true;
    }
    current_page_table().owns_legitimate(va)
}

/// True once at least one VM pool has been registered somewhere: either kernel-wide, or against
/// whatever page table is currently loaded. Distinguishes an ordinary stray fault (logged and
/// otherwise ignored) from one taken before the memory subsystem has finished booting, when no
/// VM pool exists anywhere to even be wrong about.
fn any_vmpool_registered() -> bool {
    if KERNEL_VMPOOLS.lock().iter().any(|p| p.is_some()) {
        return true;
    }
    let ptr = *CURRENT_PT_PTR.lock();
    if ptr == 0 {
        return false;
    }
    unsafe { &*(ptr as *const PageTable) }.vmpools.iter().any(|p| p.is_some())
}

/// The page fault handler. Expected to be wired up by the out-of-scope interrupt dispatcher for
/// vector 14; reads the faulting address from `cr2` itself, as the hardware leaves it there rather
/// than passing it as an argument.
///
/// A protection violation (`error_code` bit 0 set: the page was present, so this is a write to a
/// read-only page or similar) and a fault against an address no VM pool claims are both logged and
/// otherwise ignored; the faulting thread simply takes the same fault again, which is preferable
/// to taking the whole kernel down over one bad access. The sole exception is a fault against an
/// unclaimed address before any VM pool has been registered anywhere yet: nothing could possibly
/// resolve it, and it signals the boot sequence itself is broken.
pub fn handle_page_fault(error_code: u32) {
    let fault_va = unsafe { machine::read_cr2() };

    if error_code & 0x1 != 0 {
        crate::printk!("page fault: protection violation at {:#x} (error code {:#x})\n", fault_va, error_code);
        return;
    }

    if !is_legitimate_anywhere(fault_va) {
        if !any_vmpool_registered() {
            panic!("page fault at {:#x} before any VM pool was registered", fault_va);
        }
        crate::printk!("page fault at {:#x}: not part of any registered VM pool\n", fault_va);
        return;
    }

    let pde_va = pde_address(fault_va);
    let pde = unsafe { *(pde_va as *const Entry) };
    if !pde.is_present() {
        let pt_frame = process_frame();
        let pde_index = ((fault_va >> 22) & 0x3FF) as usize;
        // Install the PDE first, then zero the new table's entries through the recursive window
        // that the install just opened up; this sequencing (PDE before PTE contents) only works
        // because the recursive trick resolves through whatever the PDE currently says, so once
        // it points at the new frame the 4KiB at `RECURSIVE_BASE | (pde_index << 12)` already
        // reads and writes straight through to it.
        unsafe {
            *(pde_va as *mut Entry) = Entry::new(pt_frame, EntryFlags::PRESENT | EntryFlags::WRITABLE);
            machine::write_cr3(machine::read_cr3());
        }
        let table_window = (RECURSIVE_BASE | ((pde_index as u32) << 12)) as *mut Entry;
        for i in 0..1024usize {
            unsafe { *table_window.add(i) = Entry::not_present_rw() };
        }
    }

    let pte_va = pte_address(fault_va);
    let pte = unsafe { *(pte_va as *const Entry) };
    if !pte.is_present() {
        let frame_no = process_frame();
        unsafe {
            *(pte_va as *mut Entry) = Entry::new(frame_no, EntryFlags::PRESENT | EntryFlags::WRITABLE);
            machine::write_cr3(machine::read_cr3());
        }
    }
}
