#![feature(lang_items, naked_functions, alloc_error_handler)]
// Compile without libstd
#![no_std]
#![no_main]
#![crate_type = "staticlib"]
#![crate_name = "kernel"]

extern crate alloc;
extern crate rlibc;

#[macro_use]
mod debug;
mod bare_bones;
mod interrupts;
mod machine;
mod memory;
mod sched;

use sched::Thread;

/// This is the entry point to the kernel. The very first stage of boot (multiboot header, real
/// mode to protected mode, initial stack setup) is a bootstrap stub outside this crate's scope;
/// it hands off here with paging and interrupts both still off and nothing else initialized.
#[no_mangle]
pub extern "C" fn kernel_main() -> ! {
    unsafe { machine::disable_interrupts() };

    printk!("\nkernel_main: starting up\n");

    printk!("gdt/idt...\n");
    interrupts::init_gdt_and_idt();

    printk!("pic/pit...\n");
    interrupts::init_irq(TIMER_HZ);

    interrupts::register_exception(interrupts::VECTOR_DIVIDE_BY_ZERO, handle_divide_by_zero);
    interrupts::register_exception(interrupts::VECTOR_PAGE_FAULT, memory::paging::handle_page_fault);

    printk!("memory...\n");
    unsafe { memory::init() };
    printk!("memory ok\n");

    printk!("scheduler...\n");
    sched::init();
    sched::enable_round_robin(TIMER_HZ);

    sched::add(Thread::new(worker_main, sched::DEFAULT_STACK_SIZE));
    sched::add(Thread::new(worker_main, sched::DEFAULT_STACK_SIZE));
    let first = Thread::new(worker_main, sched::DEFAULT_STACK_SIZE);

    unsafe { machine::enable_interrupts() };

    sched::start(first);
}

/// A timer rate that is slow enough to read on a serial console, used both for the round-robin
/// quantum and as the PIT's own programmed frequency.
const TIMER_HZ: u32 = 50;

fn handle_divide_by_zero(error_code: u32) {
    panic!("divide-by-zero exception (error code {:#x})", error_code);
}

/// A small demo workload: each worker counts down, yielding between counts, then returns normally,
/// falling through the fabricated return chain into the termination trampoline the same way any
/// thread that finishes does. Identifies itself by its own TCB id rather than a passed argument —
/// a thread's entry point takes none.
extern "C" fn worker_main() {
    let id = sched::current_thread_id();
    for i in (1..=3).rev() {
        printk!("worker {}: {}\n", id, i);
        sched::yield_now();
    }
    printk!("worker {}: done\n", id);
}
