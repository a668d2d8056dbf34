//! Hypervisor configuration
//!
//! Compile-time constants for the scheduler, memory layout and the guest
//! images started at boot.

use log::LevelFilter;

/// Page size used by the physical page allocator
pub const PAGE_SIZE: usize = 4096;

/// Scheduling quantum in system timer ticks (1 MHz counter, 200 ms)
pub const TICK_INTERVAL: u32 = 200_000;

/// Maximum number of live tasks (task table capacity)
pub const MAX_TASKS: usize = 16;

/// Length of a task name, including the NUL terminator
pub const TASK_NAME_LEN: usize = 16;

/// Start of ARM-visible RAM
pub const RAM_START: usize = 0x0000_0000;

/// End of ARM-visible RAM (peripherals start here)
pub const RAM_END: usize = 0x3f00_0000;

/// Hypervisor heap window
pub const HEAP_START: usize = 0x0100_0000;
pub const HEAP_SIZE: usize = 8 * 1024 * 1024;

/// Guest image store preloaded by the firmware
/// (`initramfs guests.img 0x02000000` in config.txt)
pub const RAMDISK_START: usize = 0x0200_0000;
pub const RAMDISK_SIZE: usize = 16 * 1024 * 1024;

/// Maximum level passed to the `log` facade
pub const LOG_LEVEL: LevelFilter = LevelFilter::Info;

/// How a raw guest binary is laid out in its own regions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GuestImage {
    /// File name in the image store
    pub filename: &'static str,
    /// Offset of the first image byte inside the code region
    pub load_offset: usize,
    /// Offset of the first instruction inside the code region
    pub entry_offset: usize,
    /// Size of the code region (image, bss and guest heap)
    pub image_size: usize,
    /// Size of the stack region
    pub stack_size: usize,
}

impl GuestImage {
    pub const fn raw(filename: &'static str) -> Self {
        Self {
            filename,
            load_offset: 0,
            entry_offset: 0,
            image_size: 1024 * 1024,
            stack_size: 64 * 1024,
        }
    }
}

/// Guests started at boot, in creation (and first dispatch) order.
pub const GUEST_IMAGES: &[GuestImage] = &[
    GuestImage::raw("mini-os.bin"),
    GuestImage::raw("echo.bin"),
    GuestImage::raw("mini-os.bin"),
    GuestImage::raw("echo.bin"),
    GuestImage::raw("mini-os.bin"),
];

const _: () = assert!(GUEST_IMAGES.len() <= MAX_TASKS);
const _: () = assert!(HEAP_START + HEAP_SIZE <= RAMDISK_START);
