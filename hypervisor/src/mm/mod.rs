// =============================================================================
// raspvisor - Memory Management
// =============================================================================

pub mod heap;
pub mod pmm;

pub use pmm::{FrameAllocator, PageAllocator};

#[cfg(target_os = "none")]
use crate::config::{HEAP_SIZE, HEAP_START, RAMDISK_SIZE, RAMDISK_START, RAM_START};

/// Bring up the page allocator and the heap.
///
/// # Safety
/// Must be called once on boot, before any allocation and before interrupts
/// are unmasked.
#[cfg(target_os = "none")]
pub unsafe fn init() {
    // Comes from the linker script: end of the image, BSS and boot stack
    extern "C" {
        static __hypervisor_end: u8;
    }
    let hypervisor_end = core::ptr::addr_of!(__hypervisor_end) as usize;

    pmm::init(&[
        // Firmware spin tables, the hypervisor image and its stack
        (RAM_START, hypervisor_end),
        (HEAP_START, HEAP_START + HEAP_SIZE),
        (RAMDISK_START, RAMDISK_START + RAMDISK_SIZE),
    ]);
    heap::init();
}
