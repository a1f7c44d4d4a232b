//! nanokern: Preemptive Microkernel Core for x86_64
//!
//! A minimal microkernel implementing:
//! - Round-robin scheduling with timer-driven preemption
//! - Message-passing IPC with blocking receive
//! - Demand-paged virtual memory with LRU eviction
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     User Tasks (up to 8)                    │
//! │  ┌──────────┐ ┌──────────┐ ┌──────────┐ ┌──────────────────┐│
//! │  │  task 0  │ │  task 1  │ │  task 2  │ │       ...        ││
//! │  └────┬─────┘ └────┬─────┘ └────┬─────┘ └────────┬─────────┘│
//! │       │            │            │                 │          │
//! │  ═════╪════ int 0x80 / timer IRQ / page fault ════╪═════════ │
//! │       ▼            ▼            ▼                 ▼          │
//! ├─────────────────────────────────────────────────────────────┤
//! │                       nanokern                              │
//! │  ┌──────────────┐  ┌──────────────┐  ┌──────────────────┐   │
//! │  │  Scheduler   │  │     IPC      │  │   Demand Pager   │   │
//! │  │ (round-robin)│  │ (mailboxes)  │  │  (LRU eviction)  │   │
//! │  └──────────────┘  └──────────────┘  └──────────────────┘   │
//! │  ┌──────────────┐  ┌──────────────┐  ┌──────────────────┐   │
//! │  │  Task Table  │  │   Drivers    │  │    Page Tables   │   │
//! │  │              │  │ (PIT, PIC,   │  │   / Frame Pool   │   │
//! │  │              │  │  UART, VGA)  │  │                  │   │
//! │  └──────────────┘  └──────────────┘  └──────────────────┘   │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! Traps are the only entry points into the kernel: the timer interrupt
//! drives preemption, `int 0x80` carries system calls, and page faults feed
//! the demand pager. All handlers run through interrupt gates with
//! interrupts masked, which is the whole concurrency story on a single CPU.

#![cfg_attr(not(test), no_std)]
#![warn(missing_docs)]

extern crate alloc;

pub mod boot;
pub mod drivers;
pub mod ipc;
pub mod mm;
pub mod sys;

/// Kernel version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Kernel name
pub const NAME: &str = "nanokern";

/// Page size (4KB)
pub const PAGE_SIZE: usize = 4096;

/// Maximum number of concurrent tasks
pub const MAX_TASKS: usize = 8;

/// Maximum messages queued per mailbox
pub const MAX_IPC_MESSAGES: usize = 32;

/// Maximum payload bytes per IPC message
pub const MAX_MESSAGE_SIZE: usize = 256;

/// Maximum page frames tracked by the demand pager
pub const MAX_PHYSICAL_PAGES: usize = 1024;

/// Physical load address of the kernel image
pub const KERNEL_BASE: u64 = 0x10_0000;

/// Top of the boot kernel stack (also reused by the idle loop)
pub const KERNEL_STACK_TOP: u64 = 0x20_0000;

/// Start of the kernel heap region
pub const KERNEL_HEAP_BASE: u64 = 0x20_0000;

/// Size of the kernel heap region
pub const KERNEL_HEAP_SIZE: usize = 1024 * 1024;

/// Lowest valid user-space address
pub const USER_BASE: u64 = 0x40_0000;

/// Exclusive upper bound of user space; user stacks grow down from here
pub const USER_STACK_TOP: u64 = 0x60_0000;

/// Per-task user stack size (16 KB)
pub const USER_STACK_SIZE: u64 = 16 * 1024;

/// Bytes of the user window mapped for task images at boot
pub const USER_IMAGE_SIZE: u64 = 0x8_0000;

/// First physical address handed out by the frame pool (past the kernel)
pub const FRAME_POOL_BASE: u64 = 0x100_0000;

/// Kernel result type
pub type KernelResult<T> = Result<T, KernelError>;

/// Kernel error types
///
/// Errors that reach the syscall boundary are reported to user space as
/// negative integers (see `sys::syscall`); internally every failure is one
/// of these variants, never a sentinel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelError {
    /// Message length exceeds `MAX_MESSAGE_SIZE`
    InvalidLength,
    /// Destination PID does not name a live task
    UnknownDestination,
    /// Destination mailbox is at capacity
    MailboxFull,
    /// The operation requires a current task and none is running
    NoCurrentTask,
    /// Task table has no free slot
    NoSlot,
    /// User pointer outside the legal user window
    BadAddress,
    /// Pager descriptor set is full
    Exhausted,
    /// Page already mapped at this virtual address
    AlreadyMapped,
    /// Unrecognized syscall number
    InvalidSyscall,
}

/// Panic handler: report on the text framebuffer and the serial log, then
/// mask interrupts and spin.
#[cfg(not(test))]
#[panic_handler]
fn panic(info: &core::panic::PanicInfo) -> ! {
    drivers::vga::panic_banner(info);

    if let Some(location) = info.location() {
        log::error!(
            "KERNEL PANIC at {}:{}: {}",
            location.file(),
            location.line(),
            info.message()
        );
    } else {
        log::error!("KERNEL PANIC: {}", info.message());
    }

    unsafe {
        core::arch::asm!("cli");
    }
    halt_loop();
}

/// Halt the CPU until the next interrupt
#[inline]
pub fn hlt() {
    unsafe {
        core::arch::asm!("hlt", options(nomem, nostack));
    }
}

/// Halt loop - halt and loop forever
pub fn halt_loop() -> ! {
    loop {
        hlt();
    }
}

// ============================================================================
// Kernel Entry Point
// ============================================================================

/// Kernel entry point (called from the boot environment)
///
/// The boot environment delivers the CPU in 64-bit long mode with a minimal
/// GDT loaded and interrupts disabled; the user task images have been placed
/// at `USER_BASE` by the loader. Boot sequence from here:
/// 1. Bring up VGA and serial output
/// 2. Install the identity page tables and the kernel heap
/// 3. Install the IDT, remap the PIC, program the PIT
/// 4. Create the initial user tasks
/// 5. Enable interrupts; the first timer tick dispatches the first task
#[no_mangle]
pub extern "C" fn kernel_main() -> ! {
    drivers::vga::init();
    drivers::serial::init();
    drivers::serial::init_logger();

    log::info!("{} v{} starting...", NAME, VERSION);

    kernel_init();

    log::info!("Kernel initialization complete");
    drivers::vga::print("nanokern: scheduler online\n");

    unsafe {
        core::arch::asm!("sti");
    }

    // The timer takes over from here; this context is abandoned at the
    // first dispatch and its stack is reclaimed by the idle loop.
    halt_loop();
}

/// Initialize all kernel subsystems
fn kernel_init() {
    log::info!("Initializing paging...");
    boot::early_paging_init();

    log::info!("Initializing memory management...");
    mm::init();

    log::info!("Mapping user image window...");
    boot::map_user_image();

    log::info!("Initializing interrupts...");
    drivers::interrupts::init();

    log::info!("Initializing timer...");
    drivers::timer::init();

    log::info!("Initializing scheduler...");
    sys::scheduler::init();

    log::info!("Initializing IPC...");
    ipc::init();

    log::info!("Creating initial tasks...");
    create_initial_tasks();

    let stats = mm::stats();
    log::info!(
        "memory: {}/{} pager frames resident, heap {} bytes used / {} free",
        stats.vm.used_pages,
        stats.vm.total_pages,
        stats.heap.used,
        stats.heap.free
    );
}

/// Create the initial user tasks, one entry point per 64 KB of the image
/// window (the layout the loader uses).
fn create_initial_tasks() {
    for i in 0..MAX_TASKS as u64 {
        let entry = USER_BASE + i * 0x1_0000;
        match sys::scheduler::create_task("user", entry, 1) {
            Ok(pid) => log::debug!("created task pid={} entry={:#x}", pid, entry),
            Err(e) => log::error!("task creation failed: {:?}", e),
        }
    }
}
