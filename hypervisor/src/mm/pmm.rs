// =============================================================================
// raspvisor - Physical Memory Manager (PMM)
// =============================================================================
// Tracks usage of physical RAM using a bitmap, one bit per 4 KiB page.
// Guest image and stack regions are carved out of it as contiguous runs.
// =============================================================================

use spin::Mutex;

use crate::config::{PAGE_SIZE, RAM_END, RAM_START};
use crate::error::{HvError, Resource};
use crate::task::MemRegion;

/// Something that hands out contiguous physical regions.
pub trait FrameAllocator {
    /// Allocate at least `size` bytes, page aligned.
    fn allocate(&mut self, size: usize) -> Result<MemRegion, HvError>;
    /// Give a region back.
    fn release(&mut self, region: MemRegion);
}

/// Bitmap page allocator over `WORDS * 64` pages starting at `base`.
pub struct PageAllocator<const WORDS: usize> {
    base: usize,
    pages: usize,
    bitmap: [u64; WORDS],
    /// No free page below this index
    hint: usize,
}

impl<const WORDS: usize> PageAllocator<WORDS> {
    /// Every page starts out free.
    pub const fn new(base: usize, pages: usize) -> Self {
        assert!(pages <= WORDS * 64);
        Self { base, pages, bitmap: [0; WORDS], hint: 0 }
    }

    /// Mark `[start, end)` as used. Addresses outside the managed range are ignored.
    pub fn reserve(&mut self, start: usize, end: usize) {
        let first = start.saturating_sub(self.base) / PAGE_SIZE;
        let last = end.saturating_sub(self.base).div_ceil(PAGE_SIZE).min(self.pages);
        for page in first..last {
            self.set(page);
        }
        while self.hint < self.pages && self.is_set(self.hint) {
            self.hint += 1;
        }
    }

    /// First-fit run of `count` free pages.
    pub fn alloc_pages(&mut self, count: usize) -> Option<usize> {
        if count == 0 {
            return None;
        }

        let mut start = self.hint;
        while start + count <= self.pages {
            match (start..start + count).find(|&page| self.is_set(page)) {
                // Skip past the used page
                Some(used) => start = used + 1,
                None => {
                    for page in start..start + count {
                        self.set(page);
                    }
                    if start == self.hint {
                        self.hint = start + count;
                    }
                    return Some(self.base + start * PAGE_SIZE);
                }
            }
        }
        None
    }

    /// Free `count` pages starting at `addr`.
    pub fn free_pages(&mut self, addr: usize, count: usize) {
        if addr < self.base {
            return;
        }
        let first = (addr - self.base) / PAGE_SIZE;
        for page in first..(first + count).min(self.pages) {
            self.clear(page);
        }
        self.hint = self.hint.min(first);
    }

    pub fn free_count(&self) -> usize {
        (0..self.pages).filter(|&page| !self.is_set(page)).count()
    }

    pub fn total_pages(&self) -> usize {
        self.pages
    }

    // Bitmap helpers
    fn set(&mut self, idx: usize) {
        self.bitmap[idx / 64] |= 1 << (idx % 64);
    }

    fn clear(&mut self, idx: usize) {
        self.bitmap[idx / 64] &= !(1 << (idx % 64));
    }

    fn is_set(&self, idx: usize) -> bool {
        self.bitmap[idx / 64] & (1 << (idx % 64)) != 0
    }
}

impl<const WORDS: usize> FrameAllocator for PageAllocator<WORDS> {
    fn allocate(&mut self, size: usize) -> Result<MemRegion, HvError> {
        let count = size.div_ceil(PAGE_SIZE);
        let base = self
            .alloc_pages(count)
            .ok_or(HvError::ResourceExhausted(Resource::Memory))?;
        Ok(MemRegion::new(base, count * PAGE_SIZE))
    }

    fn release(&mut self, region: MemRegion) {
        self.free_pages(region.base, region.size.div_ceil(PAGE_SIZE));
    }
}

// =============================================================================
// Global Allocator Instance
// =============================================================================

const TOTAL_PAGES: usize = (RAM_END - RAM_START) / PAGE_SIZE;
const BITMAP_WORDS: usize = TOTAL_PAGES.div_ceil(64);

/// All ARM-visible RAM.
pub static FRAMES: Mutex<PageAllocator<BITMAP_WORDS>> =
    Mutex::new(PageAllocator::new(RAM_START, TOTAL_PAGES));

/// Reserve everything the hypervisor itself occupies.
pub fn init(reserved: &[(usize, usize)]) {
    let mut frames = FRAMES.lock();
    for &(start, end) in reserved {
        frames.reserve(start, end);
    }
    log::info!(
        "pmm: {} of {} pages free",
        frames.free_count(),
        frames.total_pages()
    );
}

/// Return a task region to the global allocator.
pub fn release(region: MemRegion) {
    FRAMES.lock().release(region);
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASE: usize = 0x10_0000;

    fn allocator() -> PageAllocator<2> {
        PageAllocator::new(BASE, 100)
    }

    #[test]
    fn allocations_are_contiguous_and_disjoint() {
        let mut pmm = allocator();
        let a = pmm.allocate(3 * PAGE_SIZE).unwrap();
        let b = pmm.allocate(PAGE_SIZE + 1).unwrap();

        assert_eq!(a, MemRegion::new(BASE, 3 * PAGE_SIZE));
        assert_eq!(b, MemRegion::new(BASE + 3 * PAGE_SIZE, 2 * PAGE_SIZE));
        assert!(!a.overlaps(&b));
        assert_eq!(pmm.free_count(), 95);
    }

    #[test]
    fn reserved_ranges_are_never_handed_out() {
        let mut pmm = allocator();
        pmm.reserve(0, BASE + 10 * PAGE_SIZE);
        pmm.reserve(BASE + 12 * PAGE_SIZE, BASE + 13 * PAGE_SIZE);

        // Pages 10-11 are too small for three, so the run starts at 13
        let r = pmm.allocate(3 * PAGE_SIZE).unwrap();
        assert_eq!(r.base, BASE + 13 * PAGE_SIZE);
        let r = pmm.allocate(2 * PAGE_SIZE).unwrap();
        assert_eq!(r.base, BASE + 10 * PAGE_SIZE);
    }

    #[test]
    fn exhaustion_is_reported() {
        let mut pmm = allocator();
        pmm.allocate(90 * PAGE_SIZE).unwrap();
        assert_eq!(
            pmm.allocate(11 * PAGE_SIZE),
            Err(HvError::ResourceExhausted(Resource::Memory))
        );
        assert!(pmm.allocate(10 * PAGE_SIZE).is_ok());
        assert_eq!(pmm.free_count(), 0);
    }

    #[test]
    fn released_regions_are_reused() {
        let mut pmm = allocator();
        let a = pmm.allocate(4 * PAGE_SIZE).unwrap();
        let _b = pmm.allocate(4 * PAGE_SIZE).unwrap();
        pmm.release(a);

        let c = pmm.allocate(2 * PAGE_SIZE).unwrap();
        assert_eq!(c.base, a.base);
        assert_eq!(pmm.free_count(), 100 - 6);
    }
}
