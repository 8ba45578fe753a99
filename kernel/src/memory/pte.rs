//! The 32-bit page directory/page table entry encoding.
//!
//! Low bits: `P` (present), `R/W`, `U/S`. High 20 bits: physical frame number. Modeled as a
//! `bitflags` set over a `u32` newtype, the way other 32-bit kernels in this vein reach for
//! `bitflags` to describe hardware bit-packed flag words, in place of a 64-bit-only `x86_64`
//! crate's `PageTableFlags`, which doesn't apply to 32-bit two-level paging.

use crate::memory::layout::PAGE_SIZE;

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct EntryFlags: u32 {
        const PRESENT        = 1 << 0;
        const WRITABLE       = 1 << 1;
        const USER_ACCESSIBLE = 1 << 2;
    }
}

/// "Not present, read/write, supervisor": the value every freshly-provisioned PDE/PTE is
/// initialized to before it backs real memory.
pub const NOT_PRESENT_RW: u32 = 0x2;

/// A single 32-bit page directory or page table entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct Entry(pub u32);

impl Entry {
    pub const fn not_present_rw() -> Self {
        Entry(NOT_PRESENT_RW)
    }

    pub fn new(frame_no: u32, flags: EntryFlags) -> Self {
        Entry((frame_no * PAGE_SIZE) | flags.bits())
    }

    pub fn flags(self) -> EntryFlags {
        EntryFlags::from_bits_truncate(self.0 & 0xFFF)
    }

    pub fn is_present(self) -> bool {
        self.flags().contains(EntryFlags::PRESENT)
    }

    pub fn frame_no(self) -> u32 {
        (self.0 & !0xFFF) / PAGE_SIZE
    }

    pub fn phys_addr(self) -> u32 {
        self.0 & !0xFFF
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_frame_number_and_flags() {
        let e = Entry::new(1234, EntryFlags::PRESENT | EntryFlags::WRITABLE);
        assert_eq!(e.frame_no(), 1234);
        assert!(e.is_present());
        assert!(e.flags().contains(EntryFlags::WRITABLE));
        assert!(!e.flags().contains(EntryFlags::USER_ACCESSIBLE));
    }

    #[test]
    fn not_present_rw_encodes_writable_not_present() {
        assert_eq!(Entry::not_present_rw().0, 0x2);
        assert!(!Entry::not_present_rw().is_present());
    }
}
