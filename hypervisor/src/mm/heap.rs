// =============================================================================
// raspvisor - Heap Allocator
// =============================================================================
// Initializes the Global Allocator so we can use Box, Vec, String, etc.
// Uses linked_list_allocator crate for stability. Only the image store and
// the loader allocate; the trap path never does.
// =============================================================================

use linked_list_allocator::LockedHeap;

use crate::config::{HEAP_SIZE, HEAP_START};

#[cfg_attr(not(test), global_allocator)]
static ALLOCATOR: LockedHeap = LockedHeap::empty();

/// Hand the fixed heap window to the allocator.
///
/// # Safety
/// Must be called once, before the first allocation, and the window must be
/// RAM nothing else uses.
pub unsafe fn init() {
    ALLOCATOR.lock().init(HEAP_START as *mut u8, HEAP_SIZE);
    log::info!(
        "heap: {:#x} ({} MiB)",
        HEAP_START,
        HEAP_SIZE / 1024 / 1024
    );
}

/// Bytes currently free on the heap.
pub fn free() -> usize {
    ALLOCATOR.lock().free()
}
