//! The Interrupt Descriptor Table: 256 gate descriptors, a handful of small `global_asm!` stubs
//! that save the caller-saved state and hand off to a single Rust dispatcher, and a table of
//! function pointers the rest of the kernel registers handlers into.
//!
//! Exactly two vectors matter to the subsystems this crate implements (divide-by-zero, as a
//! canary exception, and the page fault), plus the timer IRQ the round-robin scheduler needs for
//! preemption; every other vector gets a default stub that just reports the vector and halts.

use core::arch::{asm, global_asm};
use core::mem::size_of;

use spin::Mutex;

use crate::interrupts::gdt::KERNEL_CS;

pub const VECTOR_DIVIDE_BY_ZERO: u8 = 0;
pub const VECTOR_PAGE_FAULT: u8 = 14;
/// IRQ0 (the PIT) is remapped to this vector by `pic::init`.
pub const VECTOR_TIMER: u8 = 32;

pub type ExceptionHandler = fn(error_code: u32);
pub type IrqHandler = fn();

const N_VECTORS: usize = 256;

static EXCEPTION_HANDLERS: Mutex<[Option<ExceptionHandler>; N_VECTORS]> = Mutex::new([None; N_VECTORS]);
static IRQ_HANDLERS: Mutex<[Option<IrqHandler>; N_VECTORS]> = Mutex::new([None; N_VECTORS]);

/// Register the handler for a CPU exception vector (e.g. divide-by-zero, page fault). `handler`
/// receives the hardware error code (0 for exceptions that don't push one).
pub fn register_exception(vector: u8, handler: ExceptionHandler) {
    EXCEPTION_HANDLERS.lock()[vector as usize] = Some(handler);
}

/// Register the handler for a remapped IRQ vector (see `pic::init`'s vector offset).
pub fn register_irq(vector: u8, handler: IrqHandler) {
    IRQ_HANDLERS.lock()[vector as usize] = Some(handler);
}

#[repr(C, packed)]
#[derive(Clone, Copy)]
struct Entry(u64);

impl Entry {
    const fn missing() -> Self {
        Entry(0)
    }

    fn new(handler: u32, selector: u16, type_attr: u8) -> Self {
        let low = (handler as u64 & 0xFFFF)
            | ((selector as u64) << 16)
            | ((type_attr as u64) << 40)
            | (((handler as u64 >> 16) & 0xFFFF) << 48);
        Entry(low)
    }
}

/// Interrupt gate, present, ring 0.
const GATE_INTERRUPT: u8 = 0b1000_1110;

static mut IDT: [Entry; N_VECTORS] = [Entry::missing(); N_VECTORS];

#[repr(C, packed)]
struct IdtPointer {
    limit: u16,
    base: u32,
}

/// Build every gate description and `lidt`. Must run after `gdt::init` (gate descriptors embed
/// the kernel code selector).
pub fn init() {
    macro_rules! stub_addr {
        ($name:ident) => {{
            extern "C" {
                fn $name();
            }
            $name as u32
        }};
    }

    unsafe {
        for v in 0..N_VECTORS {
            let addr = stub_no_error_addr(v as u8).unwrap_or(stub_addr!(isr_stub_unhandled));
            IDT[v] = Entry::new(addr, KERNEL_CS, GATE_INTERRUPT);
        }
        // The vectors that push a hardware error code need the matching stub variant.
        IDT[8] = Entry::new(stub_addr!(isr_stub_with_error_8), KERNEL_CS, GATE_INTERRUPT);
        IDT[10] = Entry::new(stub_addr!(isr_stub_with_error_10), KERNEL_CS, GATE_INTERRUPT);
        IDT[11] = Entry::new(stub_addr!(isr_stub_with_error_11), KERNEL_CS, GATE_INTERRUPT);
        IDT[12] = Entry::new(stub_addr!(isr_stub_with_error_12), KERNEL_CS, GATE_INTERRUPT);
        IDT[13] = Entry::new(stub_addr!(isr_stub_with_error_13), KERNEL_CS, GATE_INTERRUPT);
        IDT[14] = Entry::new(stub_addr!(isr_stub_with_error_14), KERNEL_CS, GATE_INTERRUPT);

        let ptr = IdtPointer {
            limit: (size_of::<[Entry; N_VECTORS]>() - 1) as u16,
            #[allow(static_mut_refs)]
            base: IDT.as_ptr() as u32,
        };
        asm!("lidt [{0}]", in(reg) &ptr, options(readonly, nostack));
    }
}

/// Per-vector stub entry points for the vectors the hardware does not push an error code for.
/// Generated rather than hand-written 256 times over; each one pushes a dummy error code of 0 and
/// its own vector number before jumping to the common tail.
macro_rules! define_no_error_stubs {
    ($($n:literal => $name:ident),* $(,)?) => {
        global_asm!(
            $(
                concat!(".global ", stringify!($name)),
                concat!(stringify!($name), ":"),
                "push 0",
                concat!("push ", stringify!($n)),
                "jmp isr_common_tail",
            ),*
        );

        fn stub_no_error_addr(vector: u8) -> Option<u32> {
            extern "C" {
                $(fn $name();)*
            }
            match vector {
                $($n => Some($name as u32),)*
                _ => None,
            }
        }
    };
}

// Catch-all for every vector with no dedicated stub above: reports an unknown vector (0xFF)
// rather than the real one, which is an acceptable loss of detail for a vector this kernel never
// expects to take (no FPU, no APIC, no ring 3).
global_asm!(
    ".global isr_stub_unhandled",
    "isr_stub_unhandled:",
    "push 0",
    "push 0xFF",
    "jmp isr_common_tail",
);

define_no_error_stubs! {
    0 => isr_stub_0, 1 => isr_stub_1, 2 => isr_stub_2, 3 => isr_stub_3,
    4 => isr_stub_4, 5 => isr_stub_5, 6 => isr_stub_6, 7 => isr_stub_7,
    9 => isr_stub_9, 15 => isr_stub_15, 16 => isr_stub_16, 17 => isr_stub_17,
    18 => isr_stub_18, 19 => isr_stub_19,
    32 => isr_stub_32, 33 => isr_stub_33, 34 => isr_stub_34, 35 => isr_stub_35,
    36 => isr_stub_36, 37 => isr_stub_37, 38 => isr_stub_38, 39 => isr_stub_39,
    40 => isr_stub_40, 41 => isr_stub_41, 42 => isr_stub_42, 43 => isr_stub_43,
    44 => isr_stub_44, 45 => isr_stub_45, 46 => isr_stub_46, 47 => isr_stub_47,
}

global_asm!(
    ".global isr_stub_with_error_8",
    "isr_stub_with_error_8:",
    "push 8",
    "jmp isr_common_tail",
    ".global isr_stub_with_error_10",
    "isr_stub_with_error_10:",
    "push 10",
    "jmp isr_common_tail",
    ".global isr_stub_with_error_11",
    "isr_stub_with_error_11:",
    "push 11",
    "jmp isr_common_tail",
    ".global isr_stub_with_error_12",
    "isr_stub_with_error_12:",
    "push 12",
    "jmp isr_common_tail",
    ".global isr_stub_with_error_13",
    "isr_stub_with_error_13:",
    "push 13",
    "jmp isr_common_tail",
    ".global isr_stub_with_error_14",
    "isr_stub_with_error_14:",
    "push 14",
    "jmp isr_common_tail",
);

// The stubs above leave `[vector, error_code]` on top of the hardware-pushed frame (error code
// first for the vectors that have one, the fake 0 otherwise, with the vector always on top).
// `isr_common_tail` saves every general-purpose register, calls into `isr_dispatch` with the C
// calling convention, restores, and pops the vector/error-code pair before `iretd`.
global_asm!(
    "isr_common_tail:",
    "pushad",
    "mov eax, [esp + 32]", // vector
    "mov edx, [esp + 36]", // error code
    "push edx",
    "push eax",
    "call isr_dispatch",
    "add esp, 8",
    "popad",
    "add esp, 8", // discard vector/error_code
    "iretd",
);

/// The single landing point for every interrupt/exception. Dispatches to whichever handler was
/// registered for `vector`, or halts on an unhandled exception.
#[no_mangle]
extern "C" fn isr_dispatch(vector: u32, error_code: u32) {
    if vector < 32 {
        if let Some(handler) = EXCEPTION_HANDLERS.lock()[vector as usize] {
            handler(error_code);
        } else {
            panic!("unhandled CPU exception {} (error code {:#x})", vector, error_code);
        }
        return;
    }

    if let Some(handler) = IRQ_HANDLERS.lock()[vector as usize] {
        handler();
    }
    crate::interrupts::pic::eoi((vector - 32) as u8);
}
