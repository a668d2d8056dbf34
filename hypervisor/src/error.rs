//! Error types for the hypervisor core

use core::fmt;

use raspvisor_arch_arm64::exception::{ExceptionKind, SyndromeClass};

use crate::task::TaskId;

/// Which resource ran out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resource {
    /// Every task slot is in use
    TaskTable,
    /// Not enough contiguous physical pages
    Memory,
}

/// Errors raised by the task/scheduler/trap core
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HvError {
    /// Task table or backing memory full. Returned to the caller, never fatal.
    ResourceExhausted(Resource),
    /// A guest did something the hypervisor does not handle. Only that task
    /// is terminated.
    UnhandledSynchronousException {
        task: TaskId,
        kind: ExceptionKind,
        class: SyndromeClass,
        esr: u64,
        elr: u64,
        far: u64,
    },
    /// Exception taken while the hypervisor itself was running. Fatal.
    HypervisorFault {
        kind: ExceptionKind,
        esr: u64,
        elr: u64,
        far: u64,
    },
    /// Internal scheduler invariant broken. Fatal.
    ContextCorruption(&'static str),
}

impl HvError {
    /// The system cannot continue after this error.
    pub const fn is_fatal(&self) -> bool {
        matches!(self, Self::HypervisorFault { .. } | Self::ContextCorruption(_))
    }
}

impl fmt::Display for HvError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ResourceExhausted(Resource::TaskTable) => write!(f, "task table full"),
            Self::ResourceExhausted(Resource::Memory) => write!(f, "out of physical memory"),
            Self::UnhandledSynchronousException { task, kind, class, esr, elr, far } => write!(
                f,
                "unhandled {:?} in task {}, {}: ESR={:#x} ELR={:#x} FAR={:#x}",
                class, task, kind, esr, elr, far
            ),
            Self::HypervisorFault { kind, esr, elr, far } => write!(
                f,
                "hypervisor fault, {}: ESR={:#x} ELR={:#x} FAR={:#x}",
                kind, esr, elr, far
            ),
            Self::ContextCorruption(what) => write!(f, "context corruption: {}", what),
        }
    }
}
