// =============================================================================
// raspvisor - Tasks
// =============================================================================
// A task is one guest: its saved processor context, its lifecycle state and
// the two memory regions it owns exclusively (image and stack).
//
// Tasks live in a fixed-size arena. Handles carry the slot generation, so a
// handle to a reaped task never resolves to whatever reuses the slot later.
// =============================================================================

use core::fmt;

use raspvisor_arch_arm64::context::ProcessorContext;

use crate::config::{MAX_TASKS, TASK_NAME_LEN};
use crate::error::{HvError, Resource};

// =============================================================================
// Handles and States
// =============================================================================

/// Generation-checked task handle.
///
/// A slot's generation wraps after 2^32 reuses; only a handle kept across
/// that many reaps of the same slot could resolve to the wrong task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskId {
    index: u16,
    generation: u32,
}

impl TaskId {
    const fn new(index: usize, generation: u32) -> Self {
        Self { index: index as u16, generation }
    }

    pub const fn index(&self) -> usize {
        self.index as usize
    }

    pub const fn generation(&self) -> u32 {
        self.generation
    }

    /// Handle as handed to guests (`generation << 32 | index`).
    pub const fn as_raw(&self) -> u64 {
        ((self.generation as u64) << 32) | self.index as u64
    }

    pub const fn from_raw(raw: u64) -> Self {
        Self {
            index: raw as u16,
            generation: (raw >> 32) as u32,
        }
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.index, self.generation)
    }
}

/// Task lifecycle.
///
/// `New -> Running -> Ready -> Running -> ... -> Terminated`. A task stays
/// `New` while it waits in the ready queue for its first dispatch, and
/// `Terminated` is absorbing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    New,
    Running,
    Ready,
    Terminated,
}

impl TaskState {
    /// Waiting in the ready queue.
    pub const fn is_runnable(&self) -> bool {
        matches!(self, Self::New | Self::Ready)
    }
}

/// Fixed-size, NUL-padded task name.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct TaskName([u8; TASK_NAME_LEN]);

impl TaskName {
    /// Truncates to `TASK_NAME_LEN - 1` bytes on a character boundary.
    pub fn new(name: &str) -> Self {
        let mut len = name.len().min(TASK_NAME_LEN - 1);
        while !name.is_char_boundary(len) {
            len -= 1;
        }
        let mut bytes = [0u8; TASK_NAME_LEN];
        bytes[..len].copy_from_slice(&name.as_bytes()[..len]);
        Self(bytes)
    }

    pub fn as_str(&self) -> &str {
        let len = self.0.iter().position(|&c| c == 0).unwrap_or(TASK_NAME_LEN);
        core::str::from_utf8(&self.0[..len]).unwrap_or("?")
    }
}

impl fmt::Debug for TaskName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self.as_str(), f)
    }
}

impl fmt::Display for TaskName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A physical memory region owned by a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MemRegion {
    pub base: usize,
    pub size: usize,
}

impl MemRegion {
    pub const EMPTY: Self = Self { base: 0, size: 0 };

    pub const fn new(base: usize, size: usize) -> Self {
        Self { base, size }
    }

    /// One past the last byte; the initial SP of a stack region.
    pub const fn end(&self) -> usize {
        self.base + self.size
    }

    pub const fn is_empty(&self) -> bool {
        self.size == 0
    }

    pub const fn overlaps(&self, other: &MemRegion) -> bool {
        !self.is_empty() && !other.is_empty() && self.base < other.end() && other.base < self.end()
    }
}

// =============================================================================
// Task
// =============================================================================

/// Everything the loader hands over to create a task.
#[derive(Debug, Clone, Copy)]
pub struct TaskSeed<'a> {
    pub name: &'a str,
    pub entry: u64,
    pub stack_pointer: u64,
    pub args: u64,
    pub image: MemRegion,
    pub stack: MemRegion,
}

impl<'a> TaskSeed<'a> {
    /// Seed with no owned regions, for tasks whose memory is managed elsewhere.
    pub const fn bare(name: &'a str, entry: u64, stack_pointer: u64, args: u64) -> Self {
        Self {
            name,
            entry,
            stack_pointer,
            args,
            image: MemRegion::EMPTY,
            stack: MemRegion::EMPTY,
        }
    }
}

/// Task control block
#[derive(Debug, Clone)]
pub struct Task {
    pub id: TaskId,
    pub name: TaskName,
    pub state: TaskState,
    /// Saved context. Valid whenever the task is not running.
    pub context: ProcessorContext,
    pub image: MemRegion,
    pub stack: MemRegion,
    /// Number of times the task has been given the processor.
    pub dispatches: u64,
}

impl Task {
    fn from_seed(id: TaskId, seed: &TaskSeed<'_>) -> Self {
        Self {
            id,
            name: TaskName::new(seed.name),
            state: TaskState::New,
            context: ProcessorContext::new_guest(seed.entry, seed.stack_pointer, seed.args),
            image: seed.image,
            stack: seed.stack,
            dispatches: 0,
        }
    }
}

// =============================================================================
// Task Table
// =============================================================================

#[derive(Clone)]
struct Slot {
    generation: u32,
    task: Option<Task>,
}

impl Slot {
    const VACANT: Slot = Slot { generation: 0, task: None };
}

/// Fixed-capacity arena of tasks.
pub struct TaskTable {
    slots: [Slot; MAX_TASKS],
}

impl TaskTable {
    pub const fn new() -> Self {
        Self { slots: [Slot::VACANT; MAX_TASKS] }
    }

    /// Create a `New` task in the first free slot.
    pub fn insert(&mut self, seed: &TaskSeed<'_>) -> Result<TaskId, HvError> {
        let (index, slot) = self
            .slots
            .iter_mut()
            .enumerate()
            .find(|(_, slot)| slot.task.is_none())
            .ok_or(HvError::ResourceExhausted(Resource::TaskTable))?;

        let id = TaskId::new(index, slot.generation);
        slot.task = Some(Task::from_seed(id, seed));
        Ok(id)
    }

    pub fn get(&self, id: TaskId) -> Option<&Task> {
        let slot = self.slots.get(id.index())?;
        if slot.generation != id.generation {
            return None;
        }
        slot.task.as_ref()
    }

    pub fn get_mut(&mut self, id: TaskId) -> Option<&mut Task> {
        let slot = self.slots.get_mut(id.index())?;
        if slot.generation != id.generation {
            return None;
        }
        slot.task.as_mut()
    }

    /// Free a slot. Every outstanding handle to it goes stale.
    pub fn remove(&mut self, id: TaskId) -> Option<Task> {
        let slot = self.slots.get_mut(id.index())?;
        if slot.generation != id.generation {
            return None;
        }
        let task = slot.task.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        Some(task)
    }

    /// Remove every task matching `pred`, handing each to `removed`.
    pub fn remove_if(&mut self, mut pred: impl FnMut(&Task) -> bool, mut removed: impl FnMut(Task)) {
        for slot in self.slots.iter_mut() {
            if !slot.task.as_ref().is_some_and(&mut pred) {
                continue;
            }
            if let Some(task) = slot.task.take() {
                slot.generation = slot.generation.wrapping_add(1);
                removed(task);
            }
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &Task> {
        self.slots.iter().filter_map(|slot| slot.task.as_ref())
    }

    /// Occupied slots, terminated tasks included.
    pub fn len(&self) -> usize {
        self.iter().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub const fn capacity(&self) -> usize {
        MAX_TASKS
    }
}

impl Default for TaskTable {
    fn default() -> Self {
        Self::new()
    }
}
