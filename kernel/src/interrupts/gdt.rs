//! A flat Global Descriptor Table: one code segment and one data segment, both ring 0, both
//! spanning the full 4GiB linear address space. Every thread here runs in ring 0, so unlike a
//! general-purpose kernel's GDT there is no user segment pair and no TSS-based ring transition to
//! wire up.

use core::arch::asm;
use core::mem::size_of;

/// Selector of the kernel code segment, as installed by `init`.
pub const KERNEL_CS: u16 = 0x08;
/// Selector of the kernel data segment, as installed by `init`.
pub const KERNEL_DS: u16 = 0x10;

#[repr(C, packed)]
#[derive(Clone, Copy)]
struct Descriptor(u64);

impl Descriptor {
    const fn null() -> Self {
        Descriptor(0)
    }

    /// A flat 4GiB segment: base 0, limit 0xFFFFF with the 4KiB-granularity bit set.
    const fn flat(access_byte: u8) -> Self {
        let limit = 0xFFFFFu32;
        let flags = 0b1100u8; // 32-bit, page granularity
        let low = (limit & 0xFFFF) as u64
            | ((access_byte as u64) << 40)
            | (((limit >> 16) as u64 & 0xF) << 48)
            | ((flags as u64) << 52);
        Descriptor(low)
    }
}

const CODE_ACCESS: u8 = 0b1001_1010; // present, ring0, code, executable, readable
const DATA_ACCESS: u8 = 0b1001_0010; // present, ring0, data, writable

static GDT: [Descriptor; 3] = [Descriptor::null(), Descriptor::flat(CODE_ACCESS), Descriptor::flat(DATA_ACCESS)];

#[repr(C, packed)]
struct GdtPointer {
    limit: u16,
    base: u32,
}

/// Install the flat GDT and reload every segment register to point at it.
pub fn init() {
    let ptr = GdtPointer {
        limit: (size_of::<[Descriptor; 3]>() - 1) as u16,
        base: GDT.as_ptr() as u32,
    };

    unsafe {
        asm!("lgdt [{0}]", in(reg) &ptr, options(readonly, nostack));
        reload_segments();
    }
}

/// Reload `cs` via a far return and the data segment registers via plain moves. `cs` can't be
/// loaded with `mov`, so a `retf` to the same instruction stream under the new selector is the
/// standard trick.
#[inline(never)]
unsafe fn reload_segments() {
    asm!(
        "mov ax, {ds}",
        "mov ds, ax",
        "mov es, ax",
        "mov fs, ax",
        "mov gs, ax",
        "mov ss, ax",
        "push {cs}",
        "lea eax, [2f]",
        "push eax",
        "retf",
        "2:",
        ds = const KERNEL_DS,
        cs = const KERNEL_CS,
        out("ax") _,
        out("eax") _,
        options(nostack),
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flat_descriptor_encodes_full_limit() {
        let d = Descriptor::flat(CODE_ACCESS);
        let limit_low = d.0 & 0xFFFF;
        let limit_high = (d.0 >> 48) & 0xF;
        assert_eq!(limit_low, 0xFFFF);
        assert_eq!(limit_high, 0xF);
    }
}
