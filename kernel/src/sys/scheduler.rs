//! Scheduler
//!
//! Strict round-robin over Ready tasks:
//! - Bounded FIFO ready queue, insertion order preserved
//! - Preemption at every timer tick; voluntary yield is the same operation
//! - A Running task demoted by preemption re-enters at the tail; Blocked and
//!   Zombie tasks are never re-enqueued
//!
//! The `Scheduler` itself is a pure state machine: it hands back a
//! [`Switch`] decision and the trap layer performs the actual frame switch
//! after the lock is released. Holding the lock across the switch would
//! leave it stuck for the incoming task.

use crate::sys::context::{self, Switch, TrapFrame};
use crate::sys::task::{Pid, TaskState, TaskTable, Tcb};
use crate::{KernelResult, MAX_TASKS};
use heapless::Deque;
use spin::Mutex;

/// Global scheduler
static SCHEDULER: Mutex<Scheduler> = Mutex::new(Scheduler::new());

/// Scheduler state: the task table, the ready queue, and the slot of the
/// task currently on the CPU (None while idling).
pub struct Scheduler {
    tasks: TaskTable,
    ready: Deque<usize, MAX_TASKS>,
    current: Option<usize>,
}

impl Scheduler {
    /// Create an empty scheduler
    pub const fn new() -> Self {
        Self {
            tasks: TaskTable::new(),
            ready: Deque::new(),
            current: None,
        }
    }

    /// Admit a new task: claim a table slot and enqueue it Ready.
    ///
    /// The caller is responsible for installing the initial trap frame and
    /// recording the resulting stack pointer in the TCB.
    pub fn admit(
        &mut self,
        name: &str,
        entry: u64,
        priority: u8,
        cr3: u64,
    ) -> KernelResult<(usize, Pid)> {
        let (slot, pid) = self.tasks.claim(name, entry, priority, cr3)?;
        self.enqueue_ready(slot);
        Ok((slot, pid))
    }

    /// Preemption / yield policy. `cur_rsp` is the interrupted task's saved
    /// frame pointer.
    ///
    /// Returns the switch to perform, or None when the current task simply
    /// continues (ready queue empty) or there is nothing to run at all.
    pub fn rotate(&mut self, cur_rsp: u64) -> Option<Switch> {
        match self.current {
            Some(cur) if self.tasks.get(cur).state == TaskState::Running => {
                if self.ready.is_empty() {
                    // Nobody else wants the CPU; keep running.
                    return None;
                }
                let tcb = self.tasks.get_mut(cur);
                tcb.rsp = cur_rsp;
                tcb.state = TaskState::Ready;
                self.enqueue_ready(cur);
                self.dispatch_next()
            }
            _ => self.dispatch_next(),
        }
    }

    /// Demote the current task to Blocked and pick the next one. The caller
    /// has already registered the task in the relevant wait set.
    ///
    /// Returns None when nothing is runnable; the CPU should idle.
    pub fn block_current(&mut self, cur_rsp: u64) -> Option<Switch> {
        if let Some(cur) = self.current.take() {
            let tcb = self.tasks.get_mut(cur);
            tcb.rsp = cur_rsp;
            tcb.state = TaskState::Blocked;
        }
        self.dispatch_next()
    }

    /// Retire the current task (slot becomes reusable) and pick the next
    /// one. Returns None when nothing is runnable.
    pub fn exit_current(&mut self) -> Option<Switch> {
        if let Some(cur) = self.current.take() {
            self.tasks.release(cur);
        }
        self.dispatch_next()
    }

    /// Move a Blocked task back to Ready, at the tail of the queue.
    /// No-op for any other state.
    pub fn unblock(&mut self, slot: usize) {
        if self.tasks.get(slot).state == TaskState::Blocked {
            self.tasks.get_mut(slot).state = TaskState::Ready;
            self.enqueue_ready(slot);
        }
    }

    /// Slot of the task currently on the CPU
    pub fn current_slot(&self) -> Option<usize> {
        self.current
    }

    /// TCB of the task currently on the CPU
    pub fn current(&self) -> Option<&Tcb> {
        self.current.map(|slot| self.tasks.get(slot))
    }

    /// Shared task table
    pub fn tasks(&self) -> &TaskTable {
        &self.tasks
    }

    /// Mutable task table access (trap-context callers only)
    pub fn tasks_mut(&mut self) -> &mut TaskTable {
        &mut self.tasks
    }

    fn enqueue_ready(&mut self, slot: usize) {
        let state = self.tasks.get(slot).state;
        if state != TaskState::Ready {
            panic!("scheduler: {:?} task enqueued on ready queue", state);
        }
        if self.ready.iter().any(|&s| s == slot) {
            panic!("scheduler: slot {} already on ready queue", slot);
        }
        if self.ready.push_back(slot).is_err() {
            panic!("scheduler: ready queue overflow");
        }
    }

    fn dispatch_next(&mut self) -> Option<Switch> {
        let slot = self.ready.pop_front()?;
        let tcb = self.tasks.get_mut(slot);
        if tcb.state != TaskState::Ready {
            panic!("scheduler: dispatched {:?} task from ready queue", tcb.state);
        }
        tcb.state = TaskState::Running;
        self.current = Some(slot);
        Some(Switch {
            rsp: tcb.rsp,
            cr3: tcb.cr3,
        })
    }
}

// ============================================================================
// Trap-context entry points
// ============================================================================

/// Initialize the scheduler subsystem
pub fn init() {
    log::debug!("Scheduler initialized ({} task slots)", MAX_TASKS);
}

/// Run a closure against the global scheduler state
pub fn with<R>(f: impl FnOnce(&mut Scheduler) -> R) -> R {
    f(&mut SCHEDULER.lock())
}

/// Create a task and preconstruct its first trap frame on its user stack.
/// Fails with `NoSlot` when the task table is full.
pub fn create_task(name: &str, entry: u64, priority: u8) -> KernelResult<Pid> {
    let cr3 = crate::mm::kernel_root();
    let mut sched = SCHEDULER.lock();

    let (slot, pid) = sched.admit(name, entry, priority, cr3)?;

    let tcb = sched.tasks.get(slot);
    let stack_top = tcb.stack_base + tcb.stack_size;
    // The write below may demand-fault the stack page in; that is the
    // one place the kernel touches another task's stack.
    let rsp = unsafe { context::build_initial_frame(stack_top, entry) };
    sched.tasks.get_mut(slot).rsp = rsp;

    Ok(pid)
}

/// Preemption entry, invoked from the timer interrupt: acknowledge the
/// interrupt controller, then rotate exactly as a voluntary yield.
pub fn preempt(frame: &mut TrapFrame) {
    crate::drivers::interrupts::pic_eoi(crate::drivers::interrupts::TIMER_IRQ);
    yield_now(frame);
}

/// Voluntary yield from trap context. Returns normally when the current
/// task keeps the CPU; otherwise control re-enters through the next task's
/// saved frame and this call never returns.
pub fn yield_now(frame: &mut TrapFrame) {
    let decision = SCHEDULER.lock().rotate(frame as *mut TrapFrame as u64);
    if let Some(sw) = decision {
        unsafe { context::resume(sw) }
    }
}

/// Retire the current task and dispatch the next one, idling if none.
pub fn exit_current(code: u64) -> ! {
    let decision = {
        let mut sched = SCHEDULER.lock();
        if let Some(tcb) = sched.current() {
            log::debug!("task {} ({}) exited with code {}", tcb.pid, tcb.name, code);
        }
        sched.exit_current()
    };

    match decision {
        Some(sw) => unsafe { context::resume(sw) },
        None => {
            log::info!("no runnable tasks; idling");
            unsafe { context::enter_idle() }
        }
    }
}
