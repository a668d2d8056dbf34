// =============================================================================
// raspvisor - Raw Binary Loader
// =============================================================================
// Turns a named guest image into a task: reads the bytes from an image
// source, places them in a freshly allocated region, gives the task its own
// stack region and registers it with the scheduler.
//
// There is no stage-2 translation, so each guest runs at the physical
// address of its region. Guest images must be position independent.
// =============================================================================

use alloc::vec::Vec;
use core::fmt;
use core::ptr;

use raspvisor_arch_arm64::cpu;

use crate::config::GuestImage;
use crate::error::HvError;
use crate::mm::FrameAllocator;
use crate::sched::Scheduler;
use crate::task::{MemRegion, TaskId, TaskSeed};

/// Why an image could not be started.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadError {
    /// No file with that name in the store
    NotFound,
    /// The store could not be read
    Storage,
    /// The image does not fit its region
    TooLarge { size: usize, capacity: usize },
    /// Out of task slots or pages
    Hv(HvError),
}

impl From<HvError> for LoadError {
    fn from(err: HvError) -> Self {
        LoadError::Hv(err)
    }
}

impl fmt::Display for LoadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LoadError::NotFound => write!(f, "image not found"),
            LoadError::Storage => write!(f, "storage error"),
            LoadError::TooLarge { size, capacity } => {
                write!(f, "image of {} bytes does not fit {} bytes", size, capacity)
            }
            LoadError::Hv(err) => write!(f, "{}", err),
        }
    }
}

/// Bytes for a named image.
pub trait ImageSource {
    fn read_image(&mut self, name: &str) -> Result<Vec<u8>, LoadError>;
}

/// Loads raw (headerless) guest binaries.
pub struct RawBinaryLoader<'a, S, A> {
    source: &'a mut S,
    frames: &'a mut A,
}

impl<'a, S: ImageSource, A: FrameAllocator> RawBinaryLoader<'a, S, A> {
    pub fn new(source: &'a mut S, frames: &'a mut A) -> Self {
        Self { source, frames }
    }

    /// Load `image` and create its task.
    ///
    /// On any failure every region allocated so far is released and the
    /// scheduler is left untouched.
    pub fn load(&mut self, image: &GuestImage, scheduler: &mut Scheduler) -> Result<TaskId, LoadError> {
        let bytes = self.source.read_image(image.filename)?;

        let needed = image.load_offset + bytes.len();
        if needed > image.image_size || image.entry_offset >= image.image_size {
            return Err(LoadError::TooLarge { size: needed, capacity: image.image_size });
        }

        let code = self.frames.allocate(image.image_size)?;
        let stack = match self.frames.allocate(image.stack_size) {
            Ok(stack) => stack,
            Err(err) => {
                self.frames.release(code);
                return Err(err.into());
            }
        };

        // SAFETY: `code` was just handed to us by the allocator and is at
        // least `image_size` bytes, which covers `load_offset + len`.
        unsafe {
            place(code, image.load_offset, &bytes);
        }

        let seed = TaskSeed {
            name: image.filename,
            entry: (code.base + image.entry_offset) as u64,
            stack_pointer: stack.end() as u64,
            args: code.base as u64,
            image: code,
            stack,
        };

        match scheduler.create_task(&seed) {
            Ok(id) => {
                log::info!(
                    "loaded '{}' ({} bytes) at {:#x}, stack {:#x}-{:#x}",
                    image.filename,
                    bytes.len(),
                    code.base,
                    stack.base,
                    stack.end()
                );
                Ok(id)
            }
            Err(err) => {
                self.frames.release(stack);
                self.frames.release(code);
                Err(err.into())
            }
        }
    }
}

/// Zero the region, copy the image in and make it visible to instruction
/// fetch.
unsafe fn place(region: MemRegion, offset: usize, bytes: &[u8]) {
    let base = region.base as *mut u8;
    ptr::write_bytes(base, 0, region.size);
    ptr::copy_nonoverlapping(bytes.as_ptr(), base.add(offset), bytes.len());

    cpu::clean_dcache_range(region.base, region.size);
    cpu::flush_instruction_cache();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{MAX_TASKS, PAGE_SIZE};
    use crate::error::Resource;
    use crate::mm::PageAllocator;
    use crate::task::TaskState;

    /// In-memory image store.
    struct MapSource(Vec<(&'static str, Vec<u8>)>);

    impl ImageSource for MapSource {
        fn read_image(&mut self, name: &str) -> Result<Vec<u8>, LoadError> {
            self.0
                .iter()
                .find(|(n, _)| *n == name)
                .map(|(_, bytes)| bytes.clone())
                .ok_or(LoadError::NotFound)
        }
    }

    /// Page-aligned host memory posing as guest RAM.
    struct Arena {
        mem: Vec<u8>,
        pages: usize,
    }

    impl Arena {
        fn new(pages: usize) -> Self {
            Self { mem: vec![0xaa; (pages + 1) * PAGE_SIZE], pages }
        }

        fn allocator(&mut self) -> PageAllocator<4> {
            let base = (self.mem.as_mut_ptr() as usize).next_multiple_of(PAGE_SIZE);
            PageAllocator::new(base, self.pages)
        }
    }

    fn image(name: &'static str, pages: usize) -> GuestImage {
        GuestImage {
            filename: name,
            load_offset: 0x100,
            entry_offset: 0x100,
            image_size: pages * PAGE_SIZE,
            stack_size: PAGE_SIZE,
        }
    }

    #[test]
    fn image_is_placed_and_task_seeded() {
        let mut arena = Arena::new(16);
        let mut frames = arena.allocator();
        let mut source = MapSource(vec![("echo.bin", vec![1, 2, 3, 4])]);
        let mut scheduler = Scheduler::new();

        let img = image("echo.bin", 2);
        let id = RawBinaryLoader::new(&mut source, &mut frames)
            .load(&img, &mut scheduler)
            .unwrap();

        let task = scheduler.task(id).unwrap();
        assert_eq!(task.state, TaskState::New);
        assert_eq!(task.context.pc(), (task.image.base + 0x100) as u64);
        assert_eq!(task.context.sp_el1, task.stack.end() as u64);
        assert_eq!(task.context.gpr[0], task.image.base as u64);
        assert!(!task.image.overlaps(&task.stack));

        // SAFETY: the region lies inside `arena.mem`
        let placed = unsafe { core::slice::from_raw_parts(task.image.base as *const u8, task.image.size) };
        assert!(placed[..0x100].iter().all(|&b| b == 0));
        assert_eq!(&placed[0x100..0x104], &[1, 2, 3, 4]);
        assert!(placed[0x104..].iter().all(|&b| b == 0));
    }

    #[test]
    fn tasks_get_disjoint_regions() {
        let mut arena = Arena::new(32);
        let mut frames = arena.allocator();
        let mut source = MapSource(vec![("a.bin", vec![0; 64])]);
        let mut scheduler = Scheduler::new();
        let mut loader = RawBinaryLoader::new(&mut source, &mut frames);

        let a = loader.load(&image("a.bin", 2), &mut scheduler).unwrap();
        let b = loader.load(&image("a.bin", 2), &mut scheduler).unwrap();

        let (ta, tb) = (scheduler.task(a).unwrap(), scheduler.task(b).unwrap());
        for r in [ta.image, ta.stack] {
            assert!(!r.overlaps(&tb.image));
            assert!(!r.overlaps(&tb.stack));
        }
    }

    #[test]
    fn missing_image_is_not_found() {
        let mut arena = Arena::new(8);
        let mut frames = arena.allocator();
        let mut source = MapSource(vec![]);
        let mut scheduler = Scheduler::new();

        let err = RawBinaryLoader::new(&mut source, &mut frames)
            .load(&image("mini-os.bin", 2), &mut scheduler)
            .unwrap_err();
        assert_eq!(err, LoadError::NotFound);
        assert_eq!(frames.free_count(), 8);
    }

    #[test]
    fn oversized_image_is_rejected_before_allocating() {
        let mut arena = Arena::new(8);
        let mut frames = arena.allocator();
        let mut source = MapSource(vec![("big.bin", vec![0; 2 * PAGE_SIZE])]);
        let mut scheduler = Scheduler::new();

        let err = RawBinaryLoader::new(&mut source, &mut frames)
            .load(&image("big.bin", 2), &mut scheduler)
            .unwrap_err();
        assert!(matches!(err, LoadError::TooLarge { .. }));
        assert_eq!(frames.free_count(), 8);
    }

    #[test]
    fn out_of_pages_releases_the_image_region() {
        let mut arena = Arena::new(3);
        let mut frames = arena.allocator();
        let mut source = MapSource(vec![("a.bin", vec![0; 16])]);
        let mut scheduler = Scheduler::new();

        // Image takes all three pages, the stack cannot be allocated
        let err = RawBinaryLoader::new(&mut source, &mut frames)
            .load(&image("a.bin", 3), &mut scheduler)
            .unwrap_err();
        assert_eq!(err, LoadError::Hv(HvError::ResourceExhausted(Resource::Memory)));
        assert_eq!(frames.free_count(), 3);
        assert_eq!(scheduler.live_count(), 0);
    }

    #[test]
    fn full_task_table_releases_both_regions() {
        let mut arena = Arena::new(4);
        let mut frames = arena.allocator();
        let mut source = MapSource(vec![("a.bin", vec![0; 16])]);
        let mut scheduler = Scheduler::new();
        for _ in 0..MAX_TASKS {
            scheduler.create_task(&TaskSeed::bare("filler", 0x1000, 0x2000, 0)).unwrap();
        }

        let err = RawBinaryLoader::new(&mut source, &mut frames)
            .load(&image("a.bin", 1), &mut scheduler)
            .unwrap_err();
        assert_eq!(err, LoadError::Hv(HvError::ResourceExhausted(Resource::TaskTable)));
        assert_eq!(frames.free_count(), 4);
    }
}
