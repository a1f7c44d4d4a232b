//! VGA Text Output
//!
//! Minimal writer over the 0xB8000 text framebuffer: 80x25 cells of
//! `[attr:8][char:8]`. Used for the boot banner and for panic diagnostics,
//! which must not depend on the serial port being alive.

use core::fmt::{self, Write};
use spin::Mutex;

const BUFFER_WIDTH: usize = 80;
const BUFFER_HEIGHT: usize = 25;
const VGA_BUFFER: u64 = 0xB8000;

/// Light gray on black
const ATTR_NORMAL: u8 = 0x07;
/// White on red, for panics
const ATTR_PANIC: u8 = 0x4F;

/// Cursor-tracking writer over the text framebuffer
pub struct Writer {
    col: usize,
    row: usize,
    attr: u8,
}

impl Writer {
    const fn new() -> Self {
        Self {
            col: 0,
            row: 0,
            attr: ATTR_NORMAL,
        }
    }

    fn cell(&self, row: usize, col: usize) -> *mut u16 {
        (VGA_BUFFER + 2 * (row * BUFFER_WIDTH + col) as u64) as *mut u16
    }

    fn put(&self, row: usize, col: usize, byte: u8, attr: u8) {
        let value = ((attr as u16) << 8) | byte as u16;
        unsafe {
            core::ptr::write_volatile(self.cell(row, col), value);
        }
    }

    /// Blank the screen and home the cursor
    pub fn clear(&mut self) {
        for row in 0..BUFFER_HEIGHT {
            for col in 0..BUFFER_WIDTH {
                self.put(row, col, b' ', ATTR_NORMAL);
            }
        }
        self.col = 0;
        self.row = 0;
    }

    fn write_byte(&mut self, byte: u8) {
        match byte {
            b'\n' => self.new_line(),
            byte => {
                if self.col >= BUFFER_WIDTH {
                    self.new_line();
                }
                self.put(self.row, self.col, byte, self.attr);
                self.col += 1;
            }
        }
    }

    fn new_line(&mut self) {
        self.col = 0;
        self.row += 1;
        if self.row >= BUFFER_HEIGHT {
            self.row = 0;
        }
    }
}

impl Write for Writer {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        for byte in s.bytes() {
            self.write_byte(byte);
        }
        Ok(())
    }
}

static WRITER: Mutex<Writer> = Mutex::new(Writer::new());

/// Clear the screen and print the boot banner
pub fn init() {
    let mut writer = WRITER.lock();
    writer.clear();
    let _ = writer.write_str("nanokern booting...\n");
}

/// Write a string to the framebuffer
pub fn print(s: &str) {
    let _ = WRITER.lock().write_str(s);
}

/// Formatted write to the framebuffer
pub fn print_fmt(args: fmt::Arguments) {
    let _ = WRITER.lock().write_fmt(args);
}

/// Panic path: bypass the normal lock (the panicking context may hold it)
/// and write the diagnostic in the panic attribute.
pub fn panic_banner(info: &core::panic::PanicInfo) {
    let mut writer = Writer::new();
    writer.attr = ATTR_PANIC;
    let _ = writer.write_str("\nKERNEL PANIC: ");
    let _ = write!(writer, "{}", info.message());
    if let Some(location) = info.location() {
        let _ = write!(writer, " at {}:{}", location.file(), location.line());
    }
    let _ = writer.write_str("\n");
}
