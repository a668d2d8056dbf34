// =============================================================================
// raspvisor - Hypervisor Core
// =============================================================================
// Everything above the hardware layer:
// - Task table and lifecycle
// - Round-robin scheduler
// - Trap dispatcher and hypercalls
// - Physical page allocator and heap
// - Guest image store and loader
// - Logging
//
// SPDX-License-Identifier: GPL-2.0
// =============================================================================

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod config;
pub mod error;
pub mod fs;
pub mod hypercall;
pub mod loader;
pub mod logger;
pub mod mm;
pub mod sched;
pub mod task;
pub mod trap;

pub use error::{HvError, Resource};
pub use task::{TaskId, TaskState};
