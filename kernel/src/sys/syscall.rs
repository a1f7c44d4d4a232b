//! System Call Interface
//!
//! The syscall ABI:
//! - RAX: syscall number
//! - RDI, RSI, RDX: arguments in order
//! - RAX: return value; negative values are errors
//!
//! `int 0x80` is the entry vector; the trap stub delivers the caller's full
//! register file as a [`TrapFrame`] and results are written back into it.
//! A receive that finds the mailbox empty parks the caller and rewinds the
//! saved instruction pointer over the `int` instruction, so the syscall is
//! replayed — and the mailbox re-checked — when the task is dispatched
//! again.

use crate::ipc;
use crate::sys::context::{self, TrapFrame};
use crate::sys::scheduler;
use crate::sys::task::Pid;
use crate::{KernelError, KernelResult, MAX_MESSAGE_SIZE, USER_BASE, USER_STACK_TOP};

/// System call numbers
#[repr(u64)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Syscall {
    /// Send a message: (dst_pid, buffer_ptr, length) -> bytes sent
    Send = 1,
    /// Receive a message: (buffer_ptr, capacity) -> bytes received
    Recv = 2,
    /// Give up the CPU voluntarily -> 0
    Yield = 3,
    /// Terminate the calling task: (exit_code); does not return
    Exit = 4,
}

impl TryFrom<u64> for Syscall {
    type Error = KernelError;

    fn try_from(value: u64) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Syscall::Send),
            2 => Ok(Syscall::Recv),
            3 => Ok(Syscall::Yield),
            4 => Ok(Syscall::Exit),
            _ => Err(KernelError::InvalidSyscall),
        }
    }
}

/// Width of the `int 0x80` instruction (`cd 80`), for replaying a blocking
/// syscall on wakeup.
const INT80_LEN: u64 = 2;

/// Convert an error to its negative syscall return code
pub fn error_code(err: KernelError) -> i64 {
    match err {
        KernelError::InvalidLength => -1,
        KernelError::UnknownDestination => -2,
        KernelError::MailboxFull => -3,
        KernelError::NoCurrentTask => -4,
        KernelError::NoSlot => -5,
        KernelError::BadAddress => -6,
        KernelError::Exhausted => -7,
        KernelError::AlreadyMapped => -8,
        KernelError::InvalidSyscall => -9,
    }
}

/// Check that `[ptr, ptr + len)` lies entirely inside the user window
/// before the kernel dereferences it on the caller's behalf.
fn user_range_ok(ptr: u64, len: u64) -> bool {
    let Some(end) = ptr.checked_add(len) else {
        return false;
    };
    ptr >= USER_BASE && end <= USER_STACK_TOP
}

/// Syscall dispatcher, called from the `int 0x80` trap with the caller's
/// saved frame. Writes the result into `frame.rax`; Exit and a parked Recv
/// leave through the scheduler instead of returning.
pub fn handle(frame: &mut TrapFrame) {
    match Syscall::try_from(frame.rax) {
        Ok(Syscall::Send) => {
            frame.rax = ret(sys_send(frame.rdi, frame.rsi, frame.rdx));
        }
        Ok(Syscall::Recv) => sys_recv(frame),
        Ok(Syscall::Yield) => {
            frame.rax = 0;
            scheduler::yield_now(frame);
        }
        Ok(Syscall::Exit) => scheduler::exit_current(frame.rdi),
        Err(e) => {
            log::debug!("unknown syscall {}", frame.rax);
            frame.rax = error_code(e) as u64;
        }
    }
}

fn ret(result: KernelResult<usize>) -> u64 {
    match result {
        Ok(n) => n as u64,
        Err(e) => error_code(e) as u64,
    }
}

fn sys_send(dst: u64, ptr: u64, len: u64) -> KernelResult<usize> {
    if len as usize > MAX_MESSAGE_SIZE {
        return Err(KernelError::InvalidLength);
    }
    if !user_range_ok(ptr, len) {
        return Err(KernelError::BadAddress);
    }
    let dst = Pid::try_from(dst).map_err(|_| KernelError::UnknownDestination)?;

    let data = unsafe { core::slice::from_raw_parts(ptr as *const u8, len as usize) };
    ipc::send(dst, data)
}

enum RecvFlow {
    Done(usize),
    Fail(KernelError),
    Parked(Option<context::Switch>),
}

fn sys_recv(frame: &mut TrapFrame) {
    let (ptr, capacity) = (frame.rdi, frame.rsi);
    if !user_range_ok(ptr, capacity) {
        frame.rax = error_code(KernelError::BadAddress) as u64;
        return;
    }
    let frame_ptr = frame as *mut TrapFrame as u64;

    let flow = scheduler::with(|sched| {
        ipc::with(|ipc| {
            let Some(slot) = sched.current_slot() else {
                return RecvFlow::Fail(KernelError::NoCurrentTask);
            };
            match ipc.try_recv(slot) {
                Some(msg) => {
                    let buf = unsafe {
                        core::slice::from_raw_parts_mut(ptr as *mut u8, capacity as usize)
                    };
                    RecvFlow::Done(msg.copy_out(buf))
                }
                None => {
                    // Park the caller and arrange for the syscall to be
                    // replayed when a send wakes it.
                    ipc.block(slot);
                    frame.rip -= INT80_LEN;
                    RecvFlow::Parked(sched.block_current(frame_ptr))
                }
            }
        })
    });

    match flow {
        RecvFlow::Done(n) => frame.rax = n as u64,
        RecvFlow::Fail(e) => frame.rax = error_code(e) as u64,
        RecvFlow::Parked(Some(sw)) => unsafe { context::resume(sw) },
        RecvFlow::Parked(None) => unsafe { context::enter_idle() },
    }
}
