//! Thread / TCB: stack ownership inside a per-thread VM pool, initial context fabrication, and
//! the two construction variants (own address space, or shared kernel PT).
//!
//! A `Thread` is always reached through `Box<Thread>` so that its address (and therefore the
//! `esp` field [`context::switch`] reads and writes directly) never moves once constructed.
//! Ownership while queued is expressed the same way the frame pool list threads its nodes
//! (`memory::frame::PoolListNode`): the scheduler holds the queue as raw pointers rather than
//! `Box`es, reconstructing the `Box` only when a thread is actually destroyed, since a singly
//! linked list cannot otherwise give every node both an owner and a `next` pointer.

use core::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

use spin::Mutex;

use crate::memory::layout::{PAGE_SIZE, USER_WINDOW_BASE, USER_WINDOW_SIZE};
use crate::memory::paging::{self, PageTable};
use crate::memory::vmpool::VmPool;
use crate::memory::alloc as kalloc;

/// Default stack size handed to threads that don't ask for a specific one.
pub const DEFAULT_STACK_SIZE: u32 = 4 * PAGE_SIZE;

static NEXT_THREAD_ID: AtomicU32 = AtomicU32::new(1);

/// Either a private address space or a reference to the shared kernel one.
enum ThreadPt {
    Owned(PageTable),
    Shared(&'static PageTable),
}

impl ThreadPt {
    fn get(&self) -> &PageTable {
        match self {
            ThreadPt::Owned(pt) => pt,
            ThreadPt::Shared(pt) => pt,
        }
    }
}

/// Either a VM pool owned by this thread (its private address space's window, freed alongside the
/// thread in `destroy`) or a reference to one a caller keeps alive itself (the kernel's own pool,
/// shared by every thread built with [`Thread::new_with_kernel_pt`]).
enum ThreadVmp {
    Owned(alloc::boxed::Box<Mutex<VmPool>>),
    Shared(&'static Mutex<VmPool>),
}

impl ThreadVmp {
    /// Every use site needs a `'static` reference regardless of ownership: a `Thread` is always
    /// reached through raw pointers reinterpreted as `'static` for its whole life (the same
    /// treatment the scheduler gives the `Thread` itself), and an owned `Box`'s heap address does
    /// not move when the `Box` is moved by value, so this is no less sound than that.
    fn as_static(&self) -> &'static Mutex<VmPool> {
        match self {
            ThreadVmp::Owned(b) => unsafe { &*(b.as_ref() as *const Mutex<VmPool>) },
            ThreadVmp::Shared(r) => r,
        }
    }
}

/// A kernel thread: a stack living inside a VM pool, an address space, and the saved context
/// needed to resume it.
#[repr(C)]
pub struct Thread {
    /// Saved stack pointer. Offset 0: [`super::context::switch`] reads and writes this field
    /// directly and nothing else in this struct, so it must never move.
    esp: u32,
    id: u32,
    stack_base: u32,
    stack_size: u32,
    /// Single-slot mailbox from `Scheduler::terminate` to the termination trampoline. Holds a
    /// `*mut Thread` as a `usize`, 0 = empty.
    cargo: AtomicUsize,
    pt: ThreadPt,
    vmp: ThreadVmp,
    /// Next thread in the scheduler's ready queue; 0 = end of queue. Not used while a thread is
    /// running or while it sits in the termination trampoline's cargo slot.
    pub(super) next: AtomicUsize,
}

impl Thread {
    /// Construct a thread with a fresh, private address space: a new `PageTable` copying the
    /// shared kernel range, and a new `VmPool` over the per-thread user window
    /// `[USER_WINDOW_BASE, USER_WINDOW_BASE + USER_WINDOW_SIZE)`, backed by the process frame
    /// pool. The new page table is loaded (switching `cr3`) for the duration of construction so
    /// the stack it allocates can be reached and initialized.
    pub fn new(entry: extern "C" fn(), stack_size: u32) -> alloc::boxed::Box<Thread> {
        let kernel_pt = paging::kernel_page_table();

        let mut pt = PageTable::new_user(kernel_pt.directory_frame());
        pt.load();

        let vmp_box = alloc::boxed::Box::new(Mutex::new(VmPool::empty()));
        let vmp_cell: &'static Mutex<VmPool> = unsafe { &*(vmp_box.as_ref() as *const Mutex<VmPool>) };
        let vmp_value = VmPool::new(USER_WINDOW_BASE, USER_WINDOW_SIZE, &mut pt, vmp_cell);
        *vmp_cell.lock() = vmp_value;

        let thread = Self::build(ThreadPt::Owned(pt), ThreadVmp::Owned(vmp_box), entry, stack_size);

        kernel_pt.load();
        thread
    }

    /// Construct a thread that shares the kernel's own page table and a caller-provided VM pool,
    /// used for the kernel's own helper threads (the termination trampoline, any kernel-side
    /// worker that doesn't need isolation). Unlike [`Thread::new`], `vmp` is never freed by this
    /// thread's `destroy` — the caller keeps owning it.
    pub fn new_with_kernel_pt(
        vmp: &'static Mutex<VmPool>,
        entry: extern "C" fn(),
        stack_size: u32,
    ) -> alloc::boxed::Box<Thread> {
        let kernel_pt = paging::kernel_page_table();
        Self::build(ThreadPt::Shared(kernel_pt), ThreadVmp::Shared(vmp), entry, stack_size)
    }

    fn build(
        pt: ThreadPt,
        vmp: ThreadVmp,
        entry: extern "C" fn(),
        stack_size: u32,
    ) -> alloc::boxed::Box<Thread> {
        let vmp_static = vmp.as_static();

        // Temporarily route allocation through this thread's own VM pool while its stack is
        // carved out, then restore the kernel pool so that boxing the TCB itself below lands in
        // kernel-reachable memory, not this thread's private window.
        let previous_pool = kalloc::current_pool();
        kalloc::set_current_pool(vmp_static);
        let stack_base = vmp_static
            .lock()
            .allocate(stack_size)
            .expect("thread stack allocation failed");
        if let Some(p) = previous_pool {
            kalloc::set_current_pool(p);
        }

        let top = stack_base + round_up_to_page(stack_size);
        let esp = unsafe { fabricate_initial_context(top, entry) };

        alloc::boxed::Box::new(Thread {
            esp,
            id: NEXT_THREAD_ID.fetch_add(1, Ordering::Relaxed),
            stack_base,
            stack_size: round_up_to_page(stack_size),
            cargo: AtomicUsize::new(0),
            pt,
            vmp,
            next: AtomicUsize::new(0),
        })
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub(super) fn esp_slot(&self) -> *mut u32 {
        &self.esp as *const u32 as *mut u32
    }

    pub(super) fn esp(&self) -> u32 {
        self.esp
    }

    pub(super) fn pt_ref(&self) -> &PageTable {
        self.pt.get()
    }

    pub(super) fn vmp(&self) -> &'static Mutex<VmPool> {
        self.vmp.as_static()
    }

    /// Stash `victim` in this thread's cargo slot, for the termination trampoline to pick up and
    /// destroy once dispatched to.
    pub(super) fn set_cargo(&self, victim: usize) {
        self.cargo.store(victim, Ordering::SeqCst);
    }

    /// Take and clear this thread's cargo slot.
    pub(super) fn take_cargo(&self) -> usize {
        self.cargo.swap(0, Ordering::SeqCst)
    }

    /// Tear this thread down: load its page table so its stack is reachable, release every
    /// still-allocated region in its VM pool (ordinarily just the stack, but nothing relies on
    /// that being the only one), reclaim a private page table's frames, then reload the kernel
    /// page table and VM pool. If this thread owned its VM pool's container (`Thread::new`'s
    /// private-address-space path), it is dropped — and its heap allocation reclaimed — once this
    /// function returns and `self` itself is dropped, by which point the kernel pool/page table are
    /// current again; a caller-provided (`ThreadVmp::Shared`) VM pool is left untouched.
    ///
    /// Must be called from a different thread's stack (the termination trampoline); a thread
    /// cannot destroy itself while running on the stack being freed.
    pub(super) fn destroy(self: alloc::boxed::Box<Self>) {
        self.pt_ref().load();
        let vmp_static = self.vmp.as_static();
        kalloc::set_current_pool(vmp_static);

        vmp_static.lock().release_all(self.pt_ref());

        if let ThreadPt::Owned(pt) = self.pt {
            pt.destroy();
        }

        let kernel_pt = paging::kernel_page_table();
        kernel_pt.load();
        kalloc::set_current_pool(kernel_vmp());
    }
}

fn round_up_to_page(size: u32) -> u32 {
    (size + PAGE_SIZE - 1) & !(PAGE_SIZE - 1)
}

/// The kernel's own VM pool (registered once at boot against the kernel window,
/// `KERNEL_VMPOOL_TEST_BASE`/`_SIZE`), used to restore the global "current pool" once a thread
/// operation that borrowed another pool is done.
static KERNEL_VMP: Mutex<usize> = Mutex::new(0);

pub fn set_kernel_vmp(vmp: &'static Mutex<VmPool>) {
    *KERNEL_VMP.lock() = vmp as *const Mutex<VmPool> as usize;
}

pub(super) fn kernel_vmp() -> &'static Mutex<VmPool> {
    let ptr = *KERNEL_VMP.lock();
    assert!(ptr != 0, "kernel VM pool not yet registered (thread::set_kernel_vmp)");
    unsafe { &*(ptr as *const Mutex<VmPool>) }
}

/// Lay out the synthetic interrupt frame a thread's stack must start with, pushed from the bottom
/// of the stack upward, so the context-switch trampoline can resume a thread that has never run
/// with the exact same `popad`/segment-pop/`iretd` sequence it uses for one that has. Returns the
/// resulting stack pointer (the saved `esp` for this never-yet-run thread).
///
/// # Safety
///
/// `top` must be the top (highest address) of a mapped, writable stack at least a few hundred
/// bytes deep.
unsafe fn fabricate_initial_context(top: u32, entry: extern "C" fn()) -> u32 {
    use crate::interrupts::{KERNEL_CS, KERNEL_DS};

    let mut sp = top;

    macro_rules! push {
        ($val:expr) => {{
            sp -= 4;
            *(sp as *mut u32) = $val as u32;
        }};
    }

    // 1. dummy argument word
    push!(0u32);
    // 2. shutdown routine: what `entry` returns to via `ret`
    push!(thread_shutdown as u32);
    // 3. the thread function itself
    push!(entry as u32);
    // 4. EFLAGS, interrupt-enable bit clear; the start shim re-enables it
    push!(0x0000_0002u32);
    // 5. CS + start shim address
    push!(KERNEL_CS as u32);
    push!(thread_start as u32);
    // 6. fake error code and interrupt number
    push!(0u32); // error code
    push!(0xffu32); // vector
    // 7. pushad pushes eax, ecx, edx, ebx, esp, ebp, esi, edi in that order (eax lands highest,
    // edi lowest); fabricate the same layout so popad restores it identically.
    push!(0u32); // eax
    push!(0u32); // ecx
    push!(0u32); // edx
    push!(0u32); // ebx
    push!(0u32); // esp (popad discards this slot)
    push!(0u32); // ebp
    push!(0u32); // esi
    push!(0u32); // edi
    // 8. context::switch pushes ds, es, fs, gs in that order and pops gs, fs, es, ds; push the
    // same order here so gs ends up lowest (popped first) and ds highest.
    push!(KERNEL_DS as u32); // ds
    push!(KERNEL_DS as u32); // es
    push!(0u32); // fs
    push!(0u32); // gs

    sp
}

/// Falls through into the thread function after a fresh thread is first dispatched to: enables
/// interrupts (they start clear in the fabricated context) then lets the fabricated `ret`-chain
/// fall into the real entry point.
#[naked]
unsafe extern "C" fn thread_start() -> ! {
    core::arch::asm!("sti", "ret", options(noreturn));
}

/// Where a thread's function lands when it returns normally (the fabricated stack's word 2): a
/// thread cannot tear itself down on its own stack, so it asks the scheduler to terminate it.
extern "C" fn thread_shutdown() -> ! {
    super::terminate_self();
}
