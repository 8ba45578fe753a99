//! The low-level context-switch trampoline: a single assembly routine exposed through one call.
//! Everything above this line in `sched::thread`/`sched` only ever touches a `Thread`'s saved
//! `esp`; this is the one place that actually swaps stacks.
//!
//! `switch` treats a suspended thread's saved context as the *same* shape regardless of whether
//! the thread has ever run: a synthetic interrupt frame (vector, fake error code, EFLAGS/CS/EIP)
//! under a `pushad` and four segment pushes. A thread that has run before was parked here by an
//! earlier call to `switch` itself, which builds that frame out of the real machine state before
//! swapping stacks; a thread that has never run had the identical frame fabricated directly onto
//! its stack by `sched::thread::Thread::new` (see the layout there). Either way, resuming a thread
//! is just: load its `esp`, pop the frame back off, `iretd`. For an already-started thread, the
//! `EIP` half of that frame is `resume_point` below — plain `ret` back into whatever called
//! `switch` the last time this thread yielded. For a fresh thread, it's the address of
//! `sched::thread::thread_start`.

use core::arch::global_asm;

extern "C" {
    fn context_switch(prev_esp_slot: *mut u32, next_esp: u32);
}

/// Save the calling thread's context, stash the resulting stack pointer through
/// `prev_esp_slot`, and resume whatever thread owns `next_esp`. Does not return until some other
/// thread switches back to the caller by the same mechanism.
///
/// # Safety
///
/// `prev_esp_slot` must point at the `esp` field of the currently running thread's `Thread`, and
/// `next_esp` must be a value this routine itself previously saved (or a stack `Thread::new`
/// fabricated) — anything else corrupts the machine on the next `iretd`.
pub unsafe fn switch(prev_esp_slot: *mut u32, next_esp: u32) {
    context_switch(prev_esp_slot, next_esp);
}

global_asm!(
    ".global context_switch",
    "context_switch:",
    "pushfd",
    "push cs",
    "lea eax, [2f]",
    "push eax",
    "push 0",    // fake error code
    "push 0xff", // fake vector
    "pushad",
    "push ds",
    "push es",
    "push fs",
    "push gs",
    // Args sit above our 68 bytes of pushes (20 for the fake interrupt frame + 32 pushad + 16
    // segment pushes), then the return address `call` left behind.
    "mov eax, [esp + 72]", // prev_esp_slot
    "mov ecx, [esp + 76]", // next_esp
    "mov [eax], esp",
    "mov esp, ecx",
    "pop gs",
    "pop fs",
    "pop es",
    "pop ds",
    "popad",
    "add esp, 8", // discard vector/error_code
    "iretd",
    "2:",
    "ret",
);
