//! Task Management
//!
//! A task is the unit of scheduling and isolation:
//! - One fixed slot in the task table, reused across task lifetimes
//! - Saved machine context (stack pointer into the saved trap frame,
//!   page-table root)
//! - Per-slot user stack carved out below `USER_STACK_TOP`
//!
//! PIDs are issued monotonically and never reused within a boot; slots are.
//! PID 0 is reserved and never names a live task.

use crate::{KernelError, KernelResult, MAX_TASKS, USER_STACK_SIZE, USER_STACK_TOP};
use alloc::string::String;

/// Process ID type
pub type Pid = u32;

/// Longest task name stored in a TCB
pub const MAX_NAME_LEN: usize = 31;

/// Task state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    /// Eligible to run, present in the ready queue exactly once
    Ready,
    /// Currently executing; never present in any queue
    Running,
    /// Waiting for a message, present in the IPC blocked set
    Blocked,
    /// Slot is free for reuse
    Zombie,
}

/// Task control block
#[derive(Debug)]
pub struct Tcb {
    /// Process ID (0 while the slot is vacant)
    pub pid: Pid,
    /// Task name, truncated to `MAX_NAME_LEN` characters
    pub name: String,
    /// Lifecycle state
    pub state: TaskState,
    /// Priority level (stored; the round-robin policy ignores it)
    pub priority: u8,
    /// Saved stack pointer; points at the task's saved trap frame
    pub rsp: u64,
    /// Entry point the task was created with
    pub rip: u64,
    /// Flags register at creation (interrupts enabled, IOPL 0)
    pub rflags: u64,
    /// Page-table root (CR3)
    pub cr3: u64,
    /// Base of the task's user stack
    pub stack_base: u64,
    /// Size of the task's user stack
    pub stack_size: u64,
}

impl Tcb {
    /// A vacant slot: Zombie state, PID 0
    pub const fn vacant() -> Self {
        Self {
            pid: 0,
            name: String::new(),
            state: TaskState::Zombie,
            priority: 0,
            rsp: 0,
            rip: 0,
            rflags: 0,
            cr3: 0,
            stack_base: 0,
            stack_size: 0,
        }
    }
}

/// Top of the user stack owned by a task slot. Slot 0's stack ends at
/// `USER_STACK_TOP`; each further slot sits one stack below the previous.
pub fn user_stack_top(slot: usize) -> u64 {
    USER_STACK_TOP - slot as u64 * USER_STACK_SIZE
}

/// Fixed-size task table with monotonic PID issue
pub struct TaskTable {
    slots: [Tcb; MAX_TASKS],
    next_pid: Pid,
}

impl TaskTable {
    /// Create a table of vacant slots
    pub const fn new() -> Self {
        const VACANT: Tcb = Tcb::vacant();
        Self {
            slots: [VACANT; MAX_TASKS],
            next_pid: 1,
        }
    }

    /// Claim a vacant slot for a new task. Initializes identity, context
    /// and stack geometry; the caller installs the initial trap frame and
    /// records the resulting stack pointer.
    pub fn claim(
        &mut self,
        name: &str,
        entry: u64,
        priority: u8,
        cr3: u64,
    ) -> KernelResult<(usize, Pid)> {
        let slot = self
            .slots
            .iter()
            .position(|t| t.state == TaskState::Zombie)
            .ok_or(KernelError::NoSlot)?;

        let pid = self.next_pid;
        self.next_pid += 1;

        let top = user_stack_top(slot);
        let tcb = &mut self.slots[slot];
        tcb.pid = pid;
        tcb.name = name.chars().take(MAX_NAME_LEN).collect();
        tcb.state = TaskState::Ready;
        tcb.priority = priority;
        tcb.rsp = 0;
        tcb.rip = entry;
        tcb.rflags = crate::sys::context::INITIAL_RFLAGS;
        tcb.cr3 = cr3;
        tcb.stack_base = top - USER_STACK_SIZE;
        tcb.stack_size = USER_STACK_SIZE;

        Ok((slot, pid))
    }

    /// Mark a slot vacant again. The PID is retired, never reissued.
    pub fn release(&mut self, slot: usize) {
        let tcb = &mut self.slots[slot];
        tcb.state = TaskState::Zombie;
        tcb.name.clear();
    }

    /// Task by slot index
    pub fn get(&self, slot: usize) -> &Tcb {
        &self.slots[slot]
    }

    /// Mutable task by slot index
    pub fn get_mut(&mut self, slot: usize) -> &mut Tcb {
        &mut self.slots[slot]
    }

    /// Resolve a PID to its slot, ignoring vacant slots
    pub fn slot_of(&self, pid: Pid) -> Option<usize> {
        if pid == 0 {
            return None;
        }
        self.slots
            .iter()
            .position(|t| t.pid == pid && t.state != TaskState::Zombie)
    }

    /// Iterate over (slot, tcb) pairs
    pub fn iter(&self) -> impl Iterator<Item = (usize, &Tcb)> {
        self.slots.iter().enumerate()
    }

    /// Number of live (non-Zombie) tasks
    pub fn live_count(&self) -> usize {
        self.slots
            .iter()
            .filter(|t| t.state != TaskState::Zombie)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn claim(table: &mut TaskTable, name: &str) -> KernelResult<(usize, Pid)> {
        table.claim(name, 0x40_0000, 1, 0x1000)
    }

    #[test]
    fn test_claim_until_full() {
        let mut table = TaskTable::new();

        for i in 0..MAX_TASKS {
            let (slot, pid) = claim(&mut table, "t").unwrap();
            assert_eq!(slot, i);
            assert_eq!(pid, i as Pid + 1);
        }

        assert_eq!(claim(&mut table, "t"), Err(KernelError::NoSlot));
    }

    #[test]
    fn test_slot_reuse_pid_not_reused() {
        let mut table = TaskTable::new();

        let (slot, pid) = claim(&mut table, "first").unwrap();
        table.release(slot);

        let (slot2, pid2) = claim(&mut table, "second").unwrap();
        assert_eq!(slot2, slot); // Same slot
        assert!(pid2 > pid); // Fresh PID
        assert!(table.slot_of(pid).is_none());
    }

    #[test]
    fn test_name_truncation() {
        let mut table = TaskTable::new();
        let long = "x".repeat(64);

        let (slot, _) = table.claim(&long, 0x40_0000, 1, 0).unwrap();
        assert_eq!(table.get(slot).name.len(), MAX_NAME_LEN);
    }

    #[test]
    fn test_slot_of_skips_zombies() {
        let mut table = TaskTable::new();

        assert_eq!(table.slot_of(0), None);
        assert_eq!(table.slot_of(1), None);

        let (slot, pid) = claim(&mut table, "t").unwrap();
        assert_eq!(table.slot_of(pid), Some(slot));

        table.release(slot);
        assert_eq!(table.slot_of(pid), None);
    }

    #[test]
    fn test_stack_regions_disjoint() {
        for slot in 0..MAX_TASKS {
            let top = user_stack_top(slot);
            assert!(top <= USER_STACK_TOP);
            assert!(top - USER_STACK_SIZE >= crate::USER_BASE);
            if slot > 0 {
                assert_eq!(top, user_stack_top(slot - 1) - USER_STACK_SIZE);
            }
        }
    }
}
