// =============================================================================
// raspvisor - Guest Scheduler
// =============================================================================
// Preemptive round-robin over the tasks in the task table.
//
// The scheduler never transfers control itself. `tick()` takes the context
// that was interrupted and returns the context to resume; the trap path
// copies it into the exception frame and `eret`s into it.
//
// All state lives in one `Scheduler` value. The global instance is only
// touched with IRQs masked (see `with_scheduler`).
// =============================================================================

mod queue;

pub use queue::{QueueFull, ReadyQueue};

use raspvisor_arch_arm64::context::ProcessorContext;
use raspvisor_arch_arm64::cpu::IrqGuard;
use spin::Mutex;

use crate::error::HvError;
use crate::task::{MemRegion, Task, TaskId, TaskSeed, TaskState, TaskTable};

pub struct Scheduler {
    tasks: TaskTable,
    ready: ReadyQueue,
    current: Option<TaskId>,
    /// Whatever ran before the first dispatch (the hypervisor idle loop).
    /// Resumed whenever no task is runnable.
    idle: Option<ProcessorContext>,
    ticks: u64,
    switches: u64,
}

impl Scheduler {
    pub const fn new() -> Self {
        Self {
            tasks: TaskTable::new(),
            ready: ReadyQueue::new(),
            current: None,
            idle: None,
            ticks: 0,
            switches: 0,
        }
    }

    /// Register a task and queue it for its first dispatch.
    ///
    /// On `ResourceExhausted` nothing changes.
    pub fn create_task(&mut self, seed: &TaskSeed<'_>) -> Result<TaskId, HvError> {
        let id = self.tasks.insert(seed)?;
        if self.ready.push(id).is_err() {
            self.tasks.remove(id);
            return Err(HvError::ContextCorruption("ready queue overflow"));
        }
        log::info!(
            "task {} '{}' created: entry={:#x} sp={:#x}",
            id,
            seed.name,
            seed.entry,
            seed.stack_pointer
        );
        Ok(id)
    }

    /// Timer tick: requeue the running task and dispatch the next one.
    pub fn tick(&mut self, interrupted: &ProcessorContext) -> Result<&ProcessorContext, HvError> {
        self.ticks += 1;
        self.park_current(interrupted)?;
        self.dispatch_next()
    }

    /// The running task gives up the rest of its slice.
    pub fn yield_current(&mut self, interrupted: &ProcessorContext) -> Result<&ProcessorContext, HvError> {
        if self.current.is_none() {
            return Err(HvError::ContextCorruption("yield with no running task"));
        }
        self.park_current(interrupted)?;
        self.dispatch_next()
    }

    /// Terminate the running task and dispatch the next one.
    ///
    /// The final register state is kept in the task for diagnostics until the
    /// task is reaped.
    pub fn exit_current(&mut self, interrupted: &ProcessorContext) -> Result<&ProcessorContext, HvError> {
        let id = self
            .current
            .take()
            .ok_or(HvError::ContextCorruption("exit with no running task"))?;
        let task = self
            .tasks
            .get_mut(id)
            .ok_or(HvError::ContextCorruption("running task missing from table"))?;
        task.context = *interrupted;
        task.state = TaskState::Terminated;
        log::info!("task {} '{}' terminated", id, task.name);

        self.dispatch_next()
    }

    /// Save the interrupted context and move the running task to the tail.
    fn park_current(&mut self, interrupted: &ProcessorContext) -> Result<(), HvError> {
        let Some(id) = self.current.take() else {
            // Nothing dispatched yet, or every task is gone: we interrupted idle.
            self.idle = Some(*interrupted);
            return Ok(());
        };

        if self.ready.contains(id) {
            return Err(HvError::ContextCorruption("running task found in ready queue"));
        }
        let task = self
            .tasks
            .get_mut(id)
            .ok_or(HvError::ContextCorruption("running task missing from table"))?;
        if task.state != TaskState::Running {
            return Err(HvError::ContextCorruption("current task not running"));
        }
        task.context = *interrupted;
        task.state = TaskState::Ready;
        self.ready
            .push(id)
            .map_err(|_| HvError::ContextCorruption("ready queue overflow"))
    }

    /// Pop the queue head and make it the running task. Falls back to the
    /// idle context when nothing is runnable.
    fn dispatch_next(&mut self) -> Result<&ProcessorContext, HvError> {
        let next = loop {
            let Some(id) = self.ready.pop() else {
                break None;
            };
            match self.tasks.get(id).map(|task| task.state) {
                Some(TaskState::Running) => {
                    return Err(HvError::ContextCorruption("queued task already running"))
                }
                Some(state) if state.is_runnable() => break Some(id),
                // Stale handle or terminated while queued: never run again
                _ => continue,
            }
        };

        let Some(id) = next else {
            self.current = None;
            return self
                .idle
                .as_ref()
                .ok_or(HvError::ContextCorruption("no context to resume"));
        };

        self.switches += 1;
        self.current = Some(id);
        let task = self
            .tasks
            .get_mut(id)
            .ok_or(HvError::ContextCorruption("queued task missing from table"))?;
        if task.state == TaskState::New {
            log::debug!("task {} '{}' first dispatch at {:#x}", id, task.name, task.context.pc());
        }
        task.state = TaskState::Running;
        task.dispatches += 1;
        Ok(&task.context)
    }

    /// Release the slots of terminated tasks.
    ///
    /// `release` is called for every owned region; after that the slot is
    /// free and old handles to it go stale. Must only run once the switch
    /// away from the terminated task is complete.
    pub fn reap(&mut self, mut release: impl FnMut(MemRegion)) -> usize {
        let current = self.current;
        let mut reaped = 0;
        self.tasks.remove_if(
            |task| task.state == TaskState::Terminated && Some(task.id) != current,
            |task| {
                for region in [task.image, task.stack] {
                    if !region.is_empty() {
                        release(region);
                    }
                }
                log::debug!("task {} '{}' reaped", task.id, task.name);
                reaped += 1;
            },
        );
        reaped
    }

    pub fn current(&self) -> Option<TaskId> {
        self.current
    }

    pub fn state(&self, id: TaskId) -> Option<TaskState> {
        self.tasks.get(id).map(|task| task.state)
    }

    pub fn task(&self, id: TaskId) -> Option<&Task> {
        self.tasks.get(id)
    }

    pub fn tasks(&self) -> impl Iterator<Item = &Task> {
        self.tasks.iter()
    }

    /// Head to tail.
    pub fn queued(&self) -> impl Iterator<Item = TaskId> + '_ {
        self.ready.iter()
    }

    /// Tasks that have not terminated.
    pub fn live_count(&self) -> usize {
        self.tasks
            .iter()
            .filter(|task| task.state != TaskState::Terminated)
            .count()
    }

    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    pub fn switches(&self) -> u64 {
        self.switches
    }

    /// Check the queue/state invariants.
    ///
    /// At most one task is running and it is `current`; the running task is
    /// not queued; every runnable task is queued exactly once; no terminated
    /// task is queued.
    pub fn check_invariants(&self) -> Result<(), HvError> {
        let mut running = 0;
        for task in self.tasks.iter() {
            let queued = self.ready.count(task.id);
            match task.state {
                TaskState::Running => {
                    running += 1;
                    if self.current != Some(task.id) {
                        return Err(HvError::ContextCorruption("running task is not current"));
                    }
                    if queued != 0 {
                        return Err(HvError::ContextCorruption("running task found in ready queue"));
                    }
                }
                state if state.is_runnable() => {
                    if queued != 1 {
                        return Err(HvError::ContextCorruption("runnable task not queued exactly once"));
                    }
                }
                _ => {
                    if queued != 0 {
                        return Err(HvError::ContextCorruption("terminated task in ready queue"));
                    }
                }
            }
        }

        match (running, self.current) {
            (0, None) | (1, Some(_)) => Ok(()),
            _ => Err(HvError::ContextCorruption("current task is not running")),
        }
    }

    /// Log the task table.
    pub fn dump(&self) {
        log::info!(
            "scheduler: {} ticks, {} switches, current {:?}, {}/{} slots",
            self.ticks,
            self.switches,
            self.current,
            self.tasks.len(),
            self.tasks.capacity()
        );
        log::info!("ID     STATE       DISPATCHES  PC                  NAME");
        for task in self.tasks.iter() {
            log::info!(
                "{:<6} {:<11?} {:<11} {:#018x}  {}",
                task.id,
                task.state,
                task.dispatches,
                task.context.pc(),
                task.name
            );
        }
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Global Scheduler
// =============================================================================

/// The process-wide scheduler.
pub static SCHEDULER: Mutex<Scheduler> = Mutex::new(Scheduler::new());

/// Run `f` on the global scheduler with IRQs masked.
pub fn with_scheduler<R>(f: impl FnOnce(&mut Scheduler) -> R) -> R {
    let _irq = IrqGuard::new();
    f(&mut SCHEDULER.lock())
}
