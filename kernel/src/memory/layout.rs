//! The fixed physical and virtual memory layout of the machine.
//!
//! Unlike a general-purpose kernel that discovers memory from a bootloader-provided map, this
//! kernel assumes a fixed layout decided at build time, so every pool/window boundary below is a
//! constant rather than something probed at boot.

/// Size of a single page/frame.
pub const PAGE_SIZE: u32 = 4096;

/// Each byte of a frame-state bitmap holds 4 two-bit states, so one info frame covers this many
/// data frames.
pub const INFO_FRAME_CAPACITY: u32 = PAGE_SIZE * 4;

/// Kernel physical frame pool: `[2MiB, 4MiB)`.
pub const KERNEL_POOL_START_FRAME: u32 = (2 << 20) / PAGE_SIZE;
pub const KERNEL_POOL_N_FRAMES: u32 = ((4 << 20) - (2 << 20)) / PAGE_SIZE;

/// Process physical frame pool: `[4MiB, 32MiB)`.
pub const PROCESS_POOL_START_FRAME: u32 = (4 << 20) / PAGE_SIZE;
pub const PROCESS_POOL_N_FRAMES: u32 = ((32 << 20) - (4 << 20)) / PAGE_SIZE;

/// Hole in the process pool marked inaccessible at boot: `[15MiB, 16MiB)`.
pub const MEM_HOLE_START_FRAME: u32 = (15 << 20) / PAGE_SIZE;
pub const MEM_HOLE_N_FRAMES: u32 = (1 << 20) / PAGE_SIZE;

/// Size of the low-memory region shared (identity-mapped / eagerly provisioned) across every
/// address space.
pub const SHARED_SIZE: u32 = 4 << 20;

/// Number of page directory entries devoted to the shared kernel range (`SHARED_SIZE` covers
/// `KERNEL_PDE_COUNT` page tables worth of 4MiB each, i.e. the first 1GiB).
pub const KERNEL_PDE_COUNT: usize = 256;

/// Page directory index of the recursive self-map.
pub const RECURSIVE_PDE_INDEX: usize = 255;

/// Virtual address at which the recursive mapping makes every PTE reachable.
pub const RECURSIVE_BASE: u32 = 0x3FC0_0000;

/// Beginning of the per-thread user virtual memory window.
pub const USER_WINDOW_BASE: u32 = 1 << 30;
/// Size of the per-thread user virtual memory window.
pub const USER_WINDOW_SIZE: u32 = 64 << 20;

/// Base and size of the kernel VM-pool test window used by the single-PT variant.
pub const KERNEL_VMPOOL_TEST_BASE: u32 = 512 << 20;
pub const KERNEL_VMPOOL_TEST_SIZE: u32 = 256 << 20;

/// Fixed capacity of the `alloc[]`/`free[]` region arrays in a [`crate::memory::vmpool::VmPool`].
///
/// `Region` is 8 bytes (`{base: u32, size: u32}`), so 128 entries is 1KiB, a quarter of one
/// management page.
pub const MAX_REGIONS: usize = 128;
