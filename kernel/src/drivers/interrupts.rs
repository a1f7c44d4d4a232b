//! Interrupt Handling
//!
//! Owns the IDT, the 8259 PIC, and the trap stubs. Every installed vector
//! funnels through a naked stub that pushes the uniform `TrapFrame` layout
//! (see `sys::context`) and hands it to a Rust handler, so a scheduler
//! switch taken inside any trap returns cleanly into the chosen task.
//!
//! Three vectors do real work: the timer drives preemption, `int 0x80`
//! carries syscalls, and vector 14 feeds the demand pager. Everything else
//! is fatal.

use crate::sys::context::TrapFrame;
use crate::sys::{scheduler, syscall};
use crate::drivers::timer::outb;
use crate::{drivers::timer, mm};
use spin::Mutex;

/// Interrupt vector numbers
pub mod vectors {
    /// Divide error
    pub const DIVIDE_ERROR: u8 = 0;
    /// Invalid opcode
    pub const INVALID_OPCODE: u8 = 6;
    /// Double fault
    pub const DOUBLE_FAULT: u8 = 8;
    /// General protection fault
    pub const GENERAL_PROTECTION: u8 = 13;
    /// Page fault
    pub const PAGE_FAULT: u8 = 14;
    /// Timer (IRQ0 after PIC remap)
    pub const PIC_TIMER: u8 = 32;
    /// System call
    pub const SYSCALL: u8 = 0x80;
}

/// IRQ line of the PIT on the primary PIC
pub const TIMER_IRQ: u8 = 0;

/// IDT entry
#[repr(C, packed)]
#[derive(Clone, Copy)]
pub struct IdtEntry {
    offset_low: u16,
    selector: u16,
    ist: u8,
    type_attr: u8,
    offset_mid: u16,
    offset_high: u32,
    reserved: u32,
}

impl IdtEntry {
    const fn empty() -> Self {
        Self {
            offset_low: 0,
            selector: 0,
            ist: 0,
            type_attr: 0,
            offset_mid: 0,
            offset_high: 0,
            reserved: 0,
        }
    }

    fn set_handler(&mut self, handler: u64, selector: u16, dpl: u8) {
        self.offset_low = handler as u16;
        self.offset_mid = (handler >> 16) as u16;
        self.offset_high = (handler >> 32) as u32;
        self.selector = selector;
        self.ist = 0;
        // Present, interrupt gate (interrupts stay masked in handlers), DPL
        self.type_attr = 0x80 | (dpl << 5) | 0x0E;
        self.reserved = 0;
    }
}

/// IDT
#[repr(C, align(16))]
struct Idt {
    entries: [IdtEntry; 256],
}

impl Idt {
    const fn new() -> Self {
        Self {
            entries: [IdtEntry::empty(); 256],
        }
    }

    fn set_handler(&mut self, vector: u8, handler: usize, dpl: u8) {
        self.entries[vector as usize].set_handler(
            handler as u64,
            crate::sys::context::KERNEL_CODE_SELECTOR as u16,
            dpl,
        );
    }

    fn load(&self) {
        #[repr(C, packed)]
        struct IdtPtr {
            limit: u16,
            base: u64,
        }

        let ptr = IdtPtr {
            limit: (core::mem::size_of::<Idt>() - 1) as u16,
            base: self as *const _ as u64,
        };

        unsafe {
            core::arch::asm!("lidt [{}]", in(reg) &ptr, options(readonly, nostack));
        }
    }
}

static IDT: Mutex<Idt> = Mutex::new(Idt::new());

/// Stub for a vector where the CPU pushes no error code: push a zero slot
/// and the vector number, then spill the register file into a `TrapFrame`.
macro_rules! trap_stub {
    ($name:ident, $vector:expr, $handler:path) => {
        #[unsafe(naked)]
        extern "C" fn $name() -> ! {
            core::arch::naked_asm!(
                "push 0",
                "push {vector}",
                "push rax",
                "push rbx",
                "push rcx",
                "push rdx",
                "push rsi",
                "push rdi",
                "push rbp",
                "push r8",
                "push r9",
                "push r10",
                "push r11",
                "push r12",
                "push r13",
                "push r14",
                "push r15",
                "mov rdi, rsp",
                "call {handler}",
                "jmp {ret}",
                vector = const $vector,
                handler = sym $handler,
                ret = sym crate::sys::context::trap_return,
            )
        }
    };
}

/// Stub for a vector where the CPU pushed an error code already.
macro_rules! trap_stub_err {
    ($name:ident, $vector:expr, $handler:path) => {
        #[unsafe(naked)]
        extern "C" fn $name() -> ! {
            core::arch::naked_asm!(
                "push {vector}",
                "push rax",
                "push rbx",
                "push rcx",
                "push rdx",
                "push rsi",
                "push rdi",
                "push rbp",
                "push r8",
                "push r9",
                "push r10",
                "push r11",
                "push r12",
                "push r13",
                "push r14",
                "push r15",
                "mov rdi, rsp",
                "call {handler}",
                "jmp {ret}",
                vector = const $vector,
                handler = sym $handler,
                ret = sym crate::sys::context::trap_return,
            )
        }
    };
}

trap_stub!(divide_error_stub, 0u8, divide_error_handler);
trap_stub!(invalid_opcode_stub, 6u8, invalid_opcode_handler);
trap_stub_err!(double_fault_stub, 8u8, double_fault_handler);
trap_stub_err!(general_protection_stub, 13u8, general_protection_handler);
trap_stub_err!(page_fault_stub, 14u8, page_fault_handler);
trap_stub!(timer_stub, 32u8, timer_handler);
trap_stub!(syscall_stub, 0x80u8, syscall_handler);
trap_stub!(unexpected_stub, 0xFFu8, unexpected_handler);

/// Build the IDT, remap the PIC and load the table. Interrupts stay
/// disabled until `kernel_main` is done initializing.
pub fn init() {
    init_pic();

    let mut idt = IDT.lock();

    // Anything not explicitly handled is fatal.
    for vector in 0..=255u8 {
        idt.set_handler(vector, unexpected_stub as usize, 0);
    }

    idt.set_handler(vectors::DIVIDE_ERROR, divide_error_stub as usize, 0);
    idt.set_handler(vectors::INVALID_OPCODE, invalid_opcode_stub as usize, 0);
    idt.set_handler(vectors::DOUBLE_FAULT, double_fault_stub as usize, 0);
    idt.set_handler(
        vectors::GENERAL_PROTECTION,
        general_protection_stub as usize,
        0,
    );
    idt.set_handler(vectors::PAGE_FAULT, page_fault_stub as usize, 0);
    idt.set_handler(vectors::PIC_TIMER, timer_stub as usize, 0);
    idt.set_handler(vectors::SYSCALL, syscall_stub as usize, 3);

    idt.load();

    log::debug!("IDT loaded");
}

/// Initialize PIC (8259): remap IRQs to vectors 32..47, mask everything
/// except the timer.
fn init_pic() {
    const PIC1_CMD: u16 = 0x20;
    const PIC1_DATA: u16 = 0x21;
    const PIC2_CMD: u16 = 0xA0;
    const PIC2_DATA: u16 = 0xA1;

    unsafe {
        // ICW1: initialize
        outb(PIC1_CMD, 0x11);
        outb(PIC2_CMD, 0x11);

        // ICW2: vector offsets
        outb(PIC1_DATA, 32);
        outb(PIC2_DATA, 40);

        // ICW3: cascade wiring
        outb(PIC1_DATA, 4);
        outb(PIC2_DATA, 2);

        // ICW4: 8086 mode
        outb(PIC1_DATA, 0x01);
        outb(PIC2_DATA, 0x01);

        // Mask all except IRQ0 (timer)
        outb(PIC1_DATA, 0xFE);
        outb(PIC2_DATA, 0xFF);
    }
}

/// Send end-of-interrupt for an IRQ line
pub fn pic_eoi(irq: u8) {
    const PIC1_CMD: u16 = 0x20;
    const PIC2_CMD: u16 = 0xA0;

    unsafe {
        if irq >= 8 {
            outb(PIC2_CMD, 0x20);
        }
        outb(PIC1_CMD, 0x20);
    }
}

// Trap handlers

extern "C" fn timer_handler(frame: &mut TrapFrame) {
    timer::on_tick();
    // preempt acknowledges the PIC, then rotates; it does not return when
    // another task is dispatched.
    scheduler::preempt(frame);
}

extern "C" fn syscall_handler(frame: &mut TrapFrame) {
    syscall::handle(frame);
}

extern "C" fn page_fault_handler(frame: &mut TrapFrame) {
    let cr2: u64;
    unsafe {
        core::arch::asm!("mov {}, cr2", out(reg) cr2, options(nomem, nostack));
    }
    mm::handle_page_fault(cr2, frame.error_code);
}

extern "C" fn divide_error_handler(frame: &mut TrapFrame) {
    panic!("divide error at {:#x}", frame.rip);
}

extern "C" fn invalid_opcode_handler(frame: &mut TrapFrame) {
    panic!("invalid opcode at {:#x}", frame.rip);
}

extern "C" fn double_fault_handler(frame: &mut TrapFrame) {
    panic!(
        "double fault at {:#x} (error code {:#x})",
        frame.rip, frame.error_code
    );
}

extern "C" fn general_protection_handler(frame: &mut TrapFrame) {
    panic!(
        "general protection fault at {:#x} (error code {:#x})",
        frame.rip, frame.error_code
    );
}

extern "C" fn unexpected_handler(frame: &mut TrapFrame) {
    panic!("unexpected interrupt (rip {:#x})", frame.rip);
}
