//! Timer Driver (PIT 8253/8254)
//!
//! Channel 0 in mode 3 at 100 Hz drives preemption via IRQ0.

use spin::Mutex;

/// PIT input frequency (Hz)
const PIT_FREQUENCY: u32 = 1_193_180;

/// Scheduler tick rate (Hz)
pub const TICK_RATE: u32 = 100;

/// PIT ports
const PIT_CHANNEL0: u16 = 0x40;
const PIT_COMMAND: u16 = 0x43;

/// Timer state
struct Timer {
    ticks: u64,
}

static TIMER: Mutex<Timer> = Mutex::new(Timer { ticks: 0 });

/// Program the PIT: channel 0, lobyte/hibyte, mode 3 (square wave).
pub fn init() {
    let divisor = PIT_FREQUENCY / TICK_RATE;

    unsafe {
        outb(PIT_COMMAND, 0x36);
        outb(PIT_CHANNEL0, (divisor & 0xFF) as u8);
        outb(PIT_CHANNEL0, ((divisor >> 8) & 0xFF) as u8);
    }

    log::debug!("PIT initialized at {} Hz (divisor {})", TICK_RATE, divisor);
}

/// Ticks since boot
pub fn ticks() -> u64 {
    TIMER.lock().ticks
}

/// Uptime in milliseconds
pub fn uptime_ms() -> u64 {
    (ticks() * 1000) / TICK_RATE as u64
}

/// Called from the timer interrupt
pub fn on_tick() {
    let mut timer = TIMER.lock();
    timer.ticks = timer.ticks.wrapping_add(1);
}

// Port I/O

#[inline]
pub(crate) unsafe fn outb(port: u16, value: u8) {
    core::arch::asm!(
        "out dx, al",
        in("dx") port,
        in("al") value,
        options(nomem, nostack, preserves_flags)
    );
}
