//! GDT, IDT, exception dispatch, IRQ wiring: the low-level x86 collaborators the rest of the
//! kernel treats as external hardware setup, kept to the thin interface it actually calls through
//! (`register_exception`, `register_irq`, `enable`/`disable`).

mod gdt;
mod idt;
mod pic;
mod pit;

pub use gdt::{KERNEL_CS, KERNEL_DS};
pub use idt::{register_exception, register_irq, VECTOR_DIVIDE_BY_ZERO, VECTOR_PAGE_FAULT, VECTOR_TIMER};

/// GDT -> IDT (gates reference the GDT's code selector, so order matters). Does not touch the
/// PIC/PIT or enable interrupts; those come later in the boot sequence once the exception and
/// page-fault handlers are registered.
pub fn init_gdt_and_idt() {
    gdt::init();
    idt::init();
}

/// Remap the PIC and program the PIT at `hz`. Interrupts are still masked at the CPU
/// (`machine::enable_interrupts` hasn't run yet) when this returns.
pub fn init_irq(hz: u32) {
    pic::init();
    pit::init(hz);
}
