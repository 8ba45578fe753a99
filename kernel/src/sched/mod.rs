//! FIFO kernel thread scheduler, plus an optional round-robin preemption variant layered on top
//! of it.
//!
//! The ready queue is a singly-linked list threaded through each `Thread`'s own `next` field, the
//! same arena-by-raw-pointer technique `memory::frame`'s pool list uses, for the same reason: once
//! a thread is queued it has no single `Box` owner, since the scheduler itself needs to hand it
//! back and forth between "queued" and "running" without an intermediate allocation. A thread is
//! reachable as a `Box` only at the moments nothing else holds a pointer to it: right after
//! construction, right before `add`, and from `terminate`/the termination trampoline on the way to
//! `destroy`.

mod context;
mod thread;

use core::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};

use spin::Mutex;

use crate::interrupts;
use crate::machine;
use crate::memory::alloc as kalloc;

pub use thread::{set_kernel_vmp, Thread, DEFAULT_STACK_SIZE};

/// Disable-on-construct, restore-on-`Drop` guard implementing the interrupt-masking discipline
/// every scheduler-visible mutation needs: a thread that voluntarily yields must never observe
/// itself on the queue half-mutated, and the timer IRQ must never fire mid-mutation either.
///
/// The guard only re-enables interrupts if they were enabled when it was constructed, so nesting
/// (an `InterruptGuard` taken while already inside one) is harmless.
pub struct InterruptGuard {
    was_enabled: bool,
}

impl InterruptGuard {
    pub fn new() -> Self {
        let was_enabled = unsafe { machine::disable_interrupts() };
        InterruptGuard { was_enabled }
    }
}

impl Default for InterruptGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for InterruptGuard {
    fn drop(&mut self) {
        if self.was_enabled {
            unsafe { machine::enable_interrupts() };
        }
    }
}

struct Queue {
    head: usize,
    tail: usize,
}

static QUEUE: Mutex<Queue> = Mutex::new(Queue { head: 0, tail: 0 });

/// The running thread, as a raw `Thread` pointer; 0 until `start` makes the first dispatch.
static CURRENT: AtomicUsize = AtomicUsize::new(0);
/// Set once `start` has made the first dispatch, so the round-robin tick handler knows not to
/// act on ticks that land before there is anything to preempt.
static RUNNING: AtomicBool = AtomicBool::new(false);
/// The termination trampoline, built once by `init` and never enqueued.
static TERMINATION_THREAD: Mutex<usize> = Mutex::new(0);

/// Round-robin quantum in ticks; 0 means round-robin preemption is off.
static RR_QUANTUM: AtomicU32 = AtomicU32::new(0);
static RR_TICKS: AtomicU32 = AtomicU32::new(0);

fn current_thread_ref() -> &'static Thread {
    let ptr = CURRENT.load(Ordering::SeqCst);
    assert!(ptr != 0, "no thread is currently running");
    unsafe { &*(ptr as *const Thread) }
}

/// The id of whichever thread is currently running.
pub fn current_thread_id() -> u32 {
    current_thread_ref().id()
}

fn enqueue(ptr: usize) {
    let thread = unsafe { &*(ptr as *const Thread) };
    thread.next.store(0, Ordering::SeqCst);

    let mut q = QUEUE.lock();
    if q.tail == 0 {
        q.head = ptr;
    } else {
        unsafe { &*(q.tail as *const Thread) }.next.store(ptr, Ordering::SeqCst);
    }
    q.tail = ptr;
}

fn dequeue() -> Option<usize> {
    let mut q = QUEUE.lock();
    if q.head == 0 {
        return None;
    }
    let ptr = q.head;
    let next = unsafe { &*(ptr as *const Thread) }.next.load(Ordering::SeqCst);
    q.head = next;
    if q.head == 0 {
        q.tail = 0;
    }
    Some(ptr)
}

/// Remove the ready thread with the given id from the queue, wherever it sits, and hand its
/// pointer back. `None` if no such thread is currently queued (it may be running, or may not
/// exist).
fn unlink(id: u32) -> Option<usize> {
    let mut q = QUEUE.lock();
    let mut prev = 0usize;
    let mut cur = q.head;
    while cur != 0 {
        let node = unsafe { &*(cur as *const Thread) };
        let next = node.next.load(Ordering::SeqCst);
        if node.id() == id {
            if prev == 0 {
                q.head = next;
            } else {
                unsafe { &*(prev as *const Thread) }.next.store(next, Ordering::SeqCst);
            }
            if q.tail == cur {
                q.tail = prev;
            }
            return Some(cur);
        }
        prev = cur;
        cur = next;
    }
    None
}

/// Build the termination trampoline. Must run once, after the kernel's own VM pool and page table
/// are live (the trampoline shares both), and before `add`/`terminate` are used.
pub fn init() {
    let vmp = thread::kernel_vmp();
    let term = Thread::new_with_kernel_pt(vmp, termination_main, DEFAULT_STACK_SIZE);
    *TERMINATION_THREAD.lock() = alloc::boxed::Box::into_raw(term) as usize;
}

/// Add a constructed thread to the tail of the ready queue.
pub fn add(t: alloc::boxed::Box<Thread>) {
    let _guard = InterruptGuard::new();
    enqueue(alloc::boxed::Box::into_raw(t) as usize);
}

/// Make the very first dispatch of the kernel's life, handing control to `first` and never
/// returning. Unlike every later switch, there is no running `Thread` whose `esp` the outgoing
/// context needs saved into — the boot stack this runs on is simply abandoned.
pub fn start(first: alloc::boxed::Box<Thread>) -> ! {
    let ptr = alloc::boxed::Box::into_raw(first) as usize;
    CURRENT.store(ptr, Ordering::SeqCst);
    RUNNING.store(true, Ordering::SeqCst);

    let next = unsafe { &*(ptr as *const Thread) };
    next.pt_ref().load();
    kalloc::set_current_pool(next.vmp());

    let mut discard_esp: u32 = 0;
    unsafe { context::switch(&mut discard_esp as *mut u32, next.esp()) };

    unreachable!("the boot stack was resumed after dispatching the first thread");
}

/// Save the current thread's context, resume `next_ptr`, and — once some later switch resumes
/// this call in turn — reload this thread's own page table and VM pool: the page table/VM pool
/// that should be current is always whichever thread is actually running.
fn dispatch_to(next_ptr: usize) {
    let prev_ptr = CURRENT.load(Ordering::SeqCst);
    if next_ptr == prev_ptr {
        // Only reachable from the round-robin path re-enqueuing and immediately re-dequeuing the
        // same thread because the ready queue was otherwise empty; there is no other thread to
        // hand the CPU to, and switching to ourselves would resume our stale saved `esp` instead
        // of just continuing to run.
        return;
    }
    let prev = unsafe { &*(prev_ptr as *const Thread) };
    let next = unsafe { &*(next_ptr as *const Thread) };

    CURRENT.store(next_ptr, Ordering::SeqCst);
    next.pt_ref().load();
    kalloc::set_current_pool(next.vmp());

    unsafe { context::switch(prev.esp_slot(), next.esp()) };

    prev.pt_ref().load();
    kalloc::set_current_pool(prev.vmp());
}

/// Dequeue the next ready thread and switch to it. If the queue is empty, returns immediately and
/// the caller keeps running. Resets the round-robin tick counter either way, so a thread that
/// yields voluntarily does not forfeit the quantum it was mid-way through.
pub fn yield_now() {
    let _guard = InterruptGuard::new();
    RR_TICKS.store(0, Ordering::SeqCst);
    if let Some(next_ptr) = dequeue() {
        dispatch_to(next_ptr);
    }
}

/// Terminate the thread with the given id. If it is the currently running thread, control never
/// returns to the caller: see `terminate_self`. Otherwise the thread is unlinked from the ready
/// queue (if present — terminating a thread that has already finished or was never added is
/// logged and otherwise ignored) and destroyed directly, since the caller is not executing on the
/// victim's stack.
pub fn terminate(id: u32) {
    if id == current_thread_id() {
        terminate_self();
    }

    let _guard = InterruptGuard::new();
    match unlink(id) {
        Some(ptr) => unsafe { alloc::boxed::Box::from_raw(ptr as *mut Thread) }.destroy(),
        None => crate::printk!("sched: terminate({}): no such ready thread\n", id),
    }
}

/// Terminate the calling thread. A thread cannot free its own stack while running on it, so this
/// stashes `self` in the termination trampoline's cargo slot and dispatches to it; the trampoline
/// destroys the stashed thread from its own stack once it is running. Never returns: unlike a
/// normal `dispatch_to`, nothing will ever switch back into the caller's suspended context to
/// reload its (about-to-be-freed) page table and VM pool, so this does not follow the usual
/// dispatch_to path. Interrupts are left masked on the way out — re-enabling them would be
/// pointless on a stack that is about to be destroyed.
pub fn terminate_self() -> ! {
    unsafe { machine::disable_interrupts() };

    let current_ptr = CURRENT.load(Ordering::SeqCst);
    let term_ptr = *TERMINATION_THREAD.lock();
    assert!(term_ptr != 0, "sched::init was never called");
    let term = unsafe { &*(term_ptr as *const Thread) };
    term.set_cargo(current_ptr);

    CURRENT.store(term_ptr, Ordering::SeqCst);
    term.pt_ref().load();
    kalloc::set_current_pool(term.vmp());

    let prev = unsafe { &*(current_ptr as *const Thread) };
    unsafe { context::switch(prev.esp_slot(), term.esp()) };

    unreachable!("a terminated thread was resumed");
}

/// The termination trampoline's entry point: forever, take whatever thread was stashed in this
/// thread's own cargo slot (if any) and destroy it, then yield. Never enqueued, so it only ever
/// runs when explicitly dispatched to by `terminate_self`.
extern "C" fn termination_main() -> ! {
    loop {
        let victim_ptr = current_thread_ref().take_cargo();
        if victim_ptr != 0 {
            unsafe { alloc::boxed::Box::from_raw(victim_ptr as *mut Thread) }.destroy();
        }
        yield_now();
    }
}

/// Turn on round-robin preemption at `hz` ticks per quantum, by registering a handler on the
/// timer IRQ. `interrupts::init_irq` must already have programmed the PIT to this same rate.
pub fn enable_round_robin(hz: u32) {
    RR_QUANTUM.store(hz, Ordering::SeqCst);
    RR_TICKS.store(0, Ordering::SeqCst);
    interrupts::register_irq(interrupts::VECTOR_TIMER, rr_tick);
}

/// The timer IRQ handler. Runs with interrupts already masked (the IDT gates are interrupt gates,
/// not trap gates), so unlike `yield_now` this needs no `InterruptGuard` of its own.
///
/// Dispatching away from here is safe for the same reason preempting inside any interrupt handler
/// is: `context::switch` pushes its synthetic frame on top of the hardware frame `isr_common_tail`
/// already pushed. The synthetic frame's own `iretd` (inside `context::switch`) just returns
/// control up through this call chain and back into `isr_common_tail`'s *own* `iretd`, which is
/// the one that actually restores the preempted thread's real `EFLAGS` (interrupts enabled) when
/// some later switch resumes it. The `EFLAGS` value `context::switch`'s `pushfd` captures here —
/// with interrupts masked — is only ever consumed by that inner, transient `iretd`/`ret` pair.
fn rr_tick() {
    if !RUNNING.load(Ordering::SeqCst) {
        return;
    }
    let quantum = RR_QUANTUM.load(Ordering::SeqCst);
    if quantum == 0 {
        return;
    }
    if RR_TICKS.fetch_add(1, Ordering::SeqCst) + 1 < quantum {
        return;
    }
    RR_TICKS.store(0, Ordering::SeqCst);

    enqueue(CURRENT.load(Ordering::SeqCst));
    if let Some(next_ptr) = dequeue() {
        dispatch_to(next_ptr);
    }
}
