//! Core Kernel Services
//!
//! - Task table and lifecycle
//! - Round-robin scheduler
//! - Trap frame layout and context switching
//! - System call dispatch

pub mod context;
pub mod scheduler;
pub mod syscall;
pub mod task;

pub use context::TrapFrame;
pub use scheduler::Scheduler;
pub use task::{Pid, TaskState, TaskTable, Tcb};
