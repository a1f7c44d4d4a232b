//! Inter-Process Communication (IPC)
//!
//! Bounded message-passing between tasks:
//! - One mailbox per task slot, a FIFO ring of at most `MAX_IPC_MESSAGES`
//! - Fixed-size message records with up to `MAX_MESSAGE_SIZE` payload bytes
//! - Non-blocking send, blocking receive (the dispatcher parks the caller
//!   until a message arrives)
//!
//! # Message Record
//!
//! ```text
//! ┌──────────────┬──────────────┬───────────────────────────────┐
//! │  Sender PID  │ Receiver PID │  Payload (up to 256 bytes)    │
//! └──────────────┴──────────────┴───────────────────────────────┘
//! ```
//!
//! Delivery to a single mailbox is observed strictly in send order. A send
//! that finds its receiver Blocked moves it back to Ready but never
//! switches immediately; preemption stays timer-driven.

use crate::sys::scheduler::Scheduler;
use crate::sys::task::{Pid, TaskState};
use crate::{KernelError, KernelResult, MAX_IPC_MESSAGES, MAX_MESSAGE_SIZE, MAX_TASKS};
use heapless::{Deque, Vec};
use spin::Mutex;

/// Global IPC state
static IPC: Mutex<Ipc> = Mutex::new(Ipc::new());

/// Initialize the IPC subsystem
pub fn init() {
    log::debug!(
        "IPC initialized ({} slots per mailbox, {} byte payloads)",
        MAX_IPC_MESSAGES,
        MAX_MESSAGE_SIZE
    );
}

/// Run a closure against the global IPC state
pub fn with<R>(f: impl FnOnce(&mut Ipc) -> R) -> R {
    f(&mut IPC.lock())
}

/// Send `data` to the task identified by `dst` on behalf of the current
/// task. Returns the byte count written into the destination mailbox.
pub fn send(dst: Pid, data: &[u8]) -> KernelResult<usize> {
    crate::sys::scheduler::with(|sched| with(|ipc| ipc.send(sched, dst, data)))
}

/// Send `data` to every live task except the caller. Returns the number of
/// mailboxes that accepted the message; partial success is not rolled back.
pub fn broadcast(data: &[u8]) -> KernelResult<usize> {
    crate::sys::scheduler::with(|sched| with(|ipc| ipc.broadcast(sched, data)))
}

/// IPC message
#[derive(Debug, Clone)]
pub struct Message {
    /// PID of the sending task
    pub sender: Pid,
    /// PID of the destination task
    pub receiver: Pid,
    /// Payload bytes
    data: Vec<u8, MAX_MESSAGE_SIZE>,
}

impl Message {
    /// Build a message record, copying the payload.
    /// Fails with `InvalidLength` when the payload is oversized.
    pub fn new(sender: Pid, receiver: Pid, payload: &[u8]) -> KernelResult<Self> {
        let data =
            Vec::from_slice(payload).map_err(|_| KernelError::InvalidLength)?;
        Ok(Self {
            sender,
            receiver,
            data,
        })
    }

    /// Payload bytes
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Payload length
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Whether the payload is empty
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Copy the payload into `buf`, truncating to the buffer's capacity.
    /// Returns the number of bytes copied; excess payload is discarded with
    /// the message.
    pub fn copy_out(&self, buf: &mut [u8]) -> usize {
        let n = self.data.len().min(buf.len());
        buf[..n].copy_from_slice(&self.data[..n]);
        n
    }
}

/// Per-task bounded mailbox ring
pub struct Mailbox {
    queue: Deque<Message, MAX_IPC_MESSAGES>,
}

impl Mailbox {
    const fn new() -> Self {
        Self {
            queue: Deque::new(),
        }
    }

    fn push(&mut self, msg: Message) -> KernelResult<()> {
        self.queue
            .push_back(msg)
            .map_err(|_| KernelError::MailboxFull)
    }

    fn pop(&mut self) -> Option<Message> {
        self.queue.pop_front()
    }

    /// Queued message count
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// Whether the mailbox holds no messages
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Whether the mailbox is at capacity
    pub fn is_full(&self) -> bool {
        self.queue.is_full()
    }
}

/// Counters mirrored to the serial log on demand
#[derive(Debug, Clone, Copy, Default)]
pub struct IpcStats {
    /// Messages accepted into a mailbox
    pub sent: u64,
    /// Messages handed to a receiver
    pub received: u64,
    /// Sends rejected because the mailbox was full
    pub dropped: u64,
    /// Times a receiver had to block
    pub blocked: u64,
}

/// IPC state: one mailbox per task slot plus the set of tasks blocked on an
/// empty mailbox. Indexed by slot, not PID; both the scheduler and IPC refer
/// to tasks by table index.
pub struct Ipc {
    mailboxes: [Mailbox; MAX_TASKS],
    blocked: Vec<usize, MAX_TASKS>,
    last_sender: [Option<Pid>; MAX_TASKS],
    stats: IpcStats,
}

impl Ipc {
    /// Create empty IPC state
    pub const fn new() -> Self {
        const EMPTY: Mailbox = Mailbox::new();
        Self {
            mailboxes: [EMPTY; MAX_TASKS],
            blocked: Vec::new(),
            last_sender: [None; MAX_TASKS],
            stats: IpcStats {
                sent: 0,
                received: 0,
                dropped: 0,
                blocked: 0,
            },
        }
    }

    /// Deliver `data` to the mailbox of the task identified by `dst`.
    ///
    /// Validates the length, resolves the destination to a live task and
    /// rejects when its mailbox is full. If the destination was blocked on
    /// its mailbox it becomes Ready (enqueued at the tail); there is no
    /// immediate switch. Returns the byte count written.
    pub fn send(
        &mut self,
        sched: &mut Scheduler,
        dst: Pid,
        data: &[u8],
    ) -> KernelResult<usize> {
        if data.len() > MAX_MESSAGE_SIZE {
            return Err(KernelError::InvalidLength);
        }

        let sender = sched
            .current()
            .map(|t| t.pid)
            .ok_or(KernelError::NoCurrentTask)?;
        let dst_slot = sched
            .tasks()
            .slot_of(dst)
            .ok_or(KernelError::UnknownDestination)?;

        let msg = Message::new(sender, dst, data)?;
        let mailbox = &mut self.mailboxes[dst_slot];
        if mailbox.is_full() {
            self.stats.dropped += 1;
            return Err(KernelError::MailboxFull);
        }
        mailbox.push(msg)?;
        self.stats.sent += 1;

        // A receiver parked on this mailbox has its message now.
        if let Some(pos) = self.blocked.iter().position(|&s| s == dst_slot) {
            self.blocked.swap_remove(pos);
            sched.unblock(dst_slot);
        }

        Ok(data.len())
    }

    /// Attempt to dequeue the head message for a task slot.
    pub fn try_recv(&mut self, slot: usize) -> Option<Message> {
        let msg = self.mailboxes[slot].pop()?;
        self.stats.received += 1;
        self.last_sender[slot] = Some(msg.sender);
        Some(msg)
    }

    /// Register a task slot as waiting for a message. The caller demotes
    /// the task to Blocked afterwards.
    pub fn block(&mut self, slot: usize) {
        if self.blocked.iter().any(|&s| s == slot) {
            panic!("ipc: slot {} blocked twice", slot);
        }
        if self.blocked.push(slot).is_err() {
            panic!("ipc: blocked set overflow");
        }
        self.stats.blocked += 1;
    }

    /// Send to every live task other than the caller; returns how many
    /// mailboxes accepted the message.
    pub fn broadcast(
        &mut self,
        sched: &mut Scheduler,
        data: &[u8],
    ) -> KernelResult<usize> {
        let sender = sched
            .current()
            .map(|t| t.pid)
            .ok_or(KernelError::NoCurrentTask)?;

        let mut targets: Vec<Pid, MAX_TASKS> = Vec::new();
        for (_, tcb) in sched.tasks().iter() {
            if tcb.state != TaskState::Zombie && tcb.pid != sender {
                let _ = targets.push(tcb.pid);
            }
        }

        let mut delivered = 0;
        for pid in targets {
            if self.send(sched, pid, data).is_ok() {
                delivered += 1;
            }
        }
        Ok(delivered)
    }

    /// Messages pending in a slot's mailbox
    pub fn pending(&self, slot: usize) -> usize {
        self.mailboxes[slot].len()
    }

    /// Sender of the message most recently received by a slot
    pub fn last_sender(&self, slot: usize) -> Option<Pid> {
        self.last_sender[slot]
    }

    /// Whether a slot is registered in the blocked set
    pub fn is_blocked(&self, slot: usize) -> bool {
        self.blocked.iter().any(|&s| s == slot)
    }

    /// Counter snapshot
    pub fn stats(&self) -> IpcStats {
        self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A scheduler with `n` admitted tasks and the first one dispatched.
    fn setup(n: usize) -> (Scheduler, Ipc) {
        let mut sched = Scheduler::new();
        for _ in 0..n {
            sched.admit("t", 0x40_0000, 1, 0).unwrap();
        }
        sched.rotate(0x2000);
        (sched, Ipc::new())
    }

    fn in_flight(ipc: &Ipc) -> usize {
        (0..MAX_TASKS).map(|s| ipc.pending(s)).sum()
    }

    #[test]
    fn test_send_recv_roundtrip() {
        let (mut sched, mut ipc) = setup(2);
        let dst_slot = sched.tasks().slot_of(2).unwrap();

        let sent = ipc.send(&mut sched, 2, b"PING").unwrap();
        assert_eq!(sent, 4);

        // Sender's own mailbox is untouched.
        let src_slot = sched.current_slot().unwrap();
        assert_eq!(ipc.pending(src_slot), 0);

        let msg = ipc.try_recv(dst_slot).unwrap();
        assert_eq!(msg.data(), b"PING");
        assert_eq!(msg.sender, 1);
        assert_eq!(msg.receiver, 2);
        assert_eq!(ipc.last_sender(dst_slot), Some(1));

        let mut buf = [0u8; 16];
        assert_eq!(msg.copy_out(&mut buf), 4);
        assert_eq!(&buf[..4], b"PING");
    }

    #[test]
    fn test_fifo_per_mailbox() {
        let (mut sched, mut ipc) = setup(2);
        let dst_slot = sched.tasks().slot_of(2).unwrap();

        for payload in [b"a", b"b", b"c"] {
            ipc.send(&mut sched, 2, payload).unwrap();
        }

        assert_eq!(ipc.try_recv(dst_slot).unwrap().data(), b"a");
        assert_eq!(ipc.try_recv(dst_slot).unwrap().data(), b"b");
        assert_eq!(ipc.try_recv(dst_slot).unwrap().data(), b"c");
        assert!(ipc.try_recv(dst_slot).is_none());
    }

    #[test]
    fn test_blocked_receiver_unblocks_on_send() {
        let (mut sched, mut ipc) = setup(2);

        // Hand the CPU to task 2, which then blocks on its empty mailbox.
        sched.rotate(0x2000);
        let recv_slot = sched.current_slot().unwrap();
        assert_eq!(sched.tasks().get(recv_slot).pid, 2);

        assert!(ipc.try_recv(recv_slot).is_none());
        ipc.block(recv_slot);
        assert!(sched.block_current(0x3000).is_some());
        assert!(ipc.is_blocked(recv_slot));

        // Task 1 runs again and sends; task 2 wakes at the queue tail.
        ipc.send(&mut sched, 2, b"HI").unwrap();
        assert!(!ipc.is_blocked(recv_slot));
        assert_eq!(sched.tasks().get(recv_slot).state, TaskState::Ready);

        // When task 2 is next dispatched its retried receive succeeds.
        sched.rotate(0x4000);
        assert_eq!(sched.current_slot(), Some(recv_slot));
        let msg = ipc.try_recv(recv_slot).unwrap();
        assert_eq!(msg.data(), b"HI");
        assert_eq!(msg.len(), 2);
    }

    #[test]
    fn test_mailbox_overflow_and_drain() {
        let (mut sched, mut ipc) = setup(2);
        let dst_slot = sched.tasks().slot_of(2).unwrap();

        for _ in 0..MAX_IPC_MESSAGES {
            ipc.send(&mut sched, 2, b"x").unwrap();
        }
        assert_eq!(
            ipc.send(&mut sched, 2, b"x"),
            Err(KernelError::MailboxFull)
        );
        assert_eq!(ipc.stats().dropped, 1);

        // One receive frees a slot; the next send is accepted again.
        assert!(ipc.try_recv(dst_slot).is_some());
        assert_eq!(ipc.send(&mut sched, 2, b"y").unwrap(), 1);
        assert_eq!(ipc.pending(dst_slot), MAX_IPC_MESSAGES);
    }

    #[test]
    fn test_length_boundaries() {
        let (mut sched, mut ipc) = setup(2);

        let max = [0u8; MAX_MESSAGE_SIZE];
        assert_eq!(ipc.send(&mut sched, 2, &max).unwrap(), MAX_MESSAGE_SIZE);

        let oversized = [0u8; MAX_MESSAGE_SIZE + 1];
        assert_eq!(
            ipc.send(&mut sched, 2, &oversized),
            Err(KernelError::InvalidLength)
        );
    }

    #[test]
    fn test_truncating_receive_discards_excess() {
        let (mut sched, mut ipc) = setup(2);
        let dst_slot = sched.tasks().slot_of(2).unwrap();

        ipc.send(&mut sched, 2, b"0123456789").unwrap();
        let msg = ipc.try_recv(dst_slot).unwrap();

        let mut small = [0u8; 4];
        assert_eq!(msg.copy_out(&mut small), 4);
        assert_eq!(&small, b"0123");

        // The slot is consumed; nothing remains to re-read.
        assert!(ipc.try_recv(dst_slot).is_none());
    }

    #[test]
    fn test_send_error_taxonomy() {
        let (mut sched, mut ipc) = setup(2);

        assert_eq!(
            ipc.send(&mut sched, 99, b"hi"),
            Err(KernelError::UnknownDestination)
        );
        assert_eq!(
            ipc.send(&mut sched, 0, b"hi"),
            Err(KernelError::UnknownDestination)
        );

        // No current task at all.
        let mut idle_sched = Scheduler::new();
        idle_sched.admit("t", 0x40_0000, 1, 0).unwrap();
        assert_eq!(
            ipc.send(&mut idle_sched, 1, b"hi"),
            Err(KernelError::NoCurrentTask)
        );
    }

    #[test]
    fn test_broadcast_skips_caller_and_zombies() {
        let (mut sched, mut ipc) = setup(4);

        let delivered = ipc.broadcast(&mut sched, b"all").unwrap();
        assert_eq!(delivered, 3);

        let caller_slot = sched.current_slot().unwrap();
        for (slot, tcb) in sched.tasks().iter() {
            if tcb.state == TaskState::Zombie || slot == caller_slot {
                assert_eq!(ipc.pending(slot), 0);
            } else {
                assert_eq!(ipc.pending(slot), 1);
            }
        }
    }

    #[test]
    fn test_messages_in_flight_matches_counters() {
        let (mut sched, mut ipc) = setup(3);
        let slot2 = sched.tasks().slot_of(2).unwrap();

        ipc.send(&mut sched, 2, b"a").unwrap();
        ipc.send(&mut sched, 3, b"b").unwrap();
        ipc.send(&mut sched, 2, b"c").unwrap();
        ipc.try_recv(slot2).unwrap();

        let stats = ipc.stats();
        assert_eq!(stats.sent - stats.received, in_flight(&ipc) as u64);
    }
}
