//! Interrupt Descriptor Table and the common dispatch fabric.
//!
//! All 256 gates point at the per-vector stubs; the stubs funnel into
//! [`common_interrupt_handler`], which routes to whatever handler is
//! registered for the vector. The gate array and the handler table are
//! written during bring-up and only read afterwards, so a handler must be
//! registered before the first interrupt that could use its slot.

use core::mem::size_of;
use core::ptr::{addr_of, addr_of_mut};

use bitflags::bitflags;
use x86_64::instructions::interrupts;
use x86_64::instructions::tables::lidt;
use x86_64::registers::control::Cr2;
use x86_64::structures::DescriptorTablePointer;
use x86_64::VirtAddr;

use crate::constants::gdt::KERNEL_CODE_SELECTOR;
use crate::constants::idt::{
    GATE_INTERRUPT, GATE_PRESENT, IDT_ENTRIES, VEC_BREAKPOINT, VEC_DEBUG, VEC_DIVIDE_ERROR,
    VEC_NMI, VEC_PAGE_FAULT,
};
use crate::interrupts::stubs;
use crate::{halt_loop, serial_println};

/// Register frame as laid down by the interrupt stubs, low addresses first.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct InterruptFrame {
    pub rax: u64,
    pub rbx: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rsi: u64,
    pub rdi: u64,
    pub rbp: u64,
    pub r8: u64,
    pub r9: u64,
    pub r10: u64,
    pub r11: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
    pub interrupt_number: u64,
    pub error_code: u64,
    pub rip: u64,
    pub cs: u64,
    pub rflags: u64,
    pub rsp: u64,
    pub ss: u64,
}

bitflags! {
    /// Page-fault error-code bits as pushed by the CPU.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PageFaultErrorCode: u64 {
        const PROTECTION_VIOLATION = 1 << 0;
        const CAUSED_BY_WRITE = 1 << 1;
        const USER_MODE = 1 << 2;
        const RESERVED_WRITE = 1 << 3;
        const INSTRUCTION_FETCH = 1 << 4;
    }
}

/// One 16-byte interrupt gate.
#[repr(C, packed)]
#[derive(Clone, Copy)]
pub struct IdtEntry {
    offset_low: u16,
    selector: u16,
    ist: u8,
    type_attr: u8,
    offset_middle: u16,
    offset_high: u32,
    reserved: u32,
}

impl IdtEntry {
    pub const fn empty() -> Self {
        Self {
            offset_low: 0,
            selector: 0,
            ist: 0,
            type_attr: 0,
            offset_middle: 0,
            offset_high: 0,
            reserved: 0,
        }
    }

    /// Present interrupt gate at DPL 0 on the kernel code segment, no IST.
    pub fn interrupt_gate(handler: u64) -> Self {
        Self {
            offset_low: (handler & 0xFFFF) as u16,
            selector: KERNEL_CODE_SELECTOR,
            ist: 0,
            type_attr: GATE_PRESENT | GATE_INTERRUPT,
            offset_middle: ((handler >> 16) & 0xFFFF) as u16,
            offset_high: (handler >> 32) as u32,
            reserved: 0,
        }
    }

    pub fn handler(&self) -> u64 {
        (self.offset_low as u64)
            | ((self.offset_middle as u64) << 16)
            | ((self.offset_high as u64) << 32)
    }

    pub const fn selector(&self) -> u16 {
        self.selector
    }

    pub const fn is_present(&self) -> bool {
        self.type_attr & GATE_PRESENT != 0
    }

    pub const fn gate_type(&self) -> u8 {
        self.type_attr & 0x0F
    }

    pub const fn dpl(&self) -> u8 {
        (self.type_attr >> 5) & 0x3
    }

    pub const fn ist(&self) -> u8 {
        self.ist & 0x7
    }
}

#[repr(C, align(16))]
pub struct Idt {
    entries: [IdtEntry; IDT_ENTRIES],
}

impl Idt {
    pub const fn new() -> Self {
        Self {
            entries: [IdtEntry::empty(); IDT_ENTRIES],
        }
    }

    /// Points every gate at its vector's stub.
    pub fn populate(&mut self) {
        for (vector, entry) in self.entries.iter_mut().enumerate() {
            *entry = IdtEntry::interrupt_gate(stubs::stub_address(vector));
        }
    }

    pub fn entry(&self, vector: usize) -> IdtEntry {
        self.entries[vector]
    }
}

impl Default for Idt {
    fn default() -> Self {
        Self::new()
    }
}

const _: () = assert!(size_of::<IdtEntry>() == 16);
const _: () = assert!(size_of::<Idt>() == 256 * 16);

/// A registered interrupt handler. Handlers must not allocate or block; they
/// either return (resuming via `iretq`) or park the core.
pub type HandlerFn = fn(&mut InterruptFrame);

static mut IDT: Idt = Idt::new();
static mut HANDLERS: [Option<HandlerFn>; IDT_ENTRIES] = [None; IDT_ENTRIES];

/// Builds the shared IDT, installs the default exception handlers, and loads
/// the table on the calling core.
pub fn init() {
    unsafe {
        (*addr_of_mut!(IDT)).populate();
    }
    register_handler(VEC_DIVIDE_ERROR, divide_error_handler);
    register_handler(VEC_DEBUG, debug_handler);
    register_handler(VEC_NMI, nmi_handler);
    register_handler(VEC_BREAKPOINT, breakpoint_handler);
    register_handler(VEC_PAGE_FAULT, page_fault_handler);
    load();
}

/// Loads the shared IDT on the calling core.
pub fn load() {
    let pointer = DescriptorTablePointer {
        limit: (size_of::<Idt>() - 1) as u16,
        base: VirtAddr::new(addr_of!(IDT) as u64),
    };
    unsafe { lidt(&pointer) };
}

/// Installs `handler` for `vector`, replacing any previous handler.
///
/// Callers must order registration before the first interrupt that could hit
/// the slot; there is no synchronization against a concurrent dispatch.
pub fn register_handler(vector: u8, handler: HandlerFn) {
    unsafe {
        (*addr_of_mut!(HANDLERS))[vector as usize] = Some(handler);
    }
}

/// Name of an architectural exception vector, for diagnostics.
pub const fn vector_name(vector: usize) -> &'static str {
    match vector {
        0 => "Divide Error (#DE)",
        1 => "Debug (#DB)",
        2 => "Non-Maskable Interrupt (NMI)",
        3 => "Breakpoint (#BP)",
        4 => "Overflow (#OF)",
        5 => "BOUND Range Exceeded (#BR)",
        6 => "Invalid Opcode (#UD)",
        7 => "Device Not Available (#NM)",
        8 => "Double Fault (#DF)",
        9 => "Coprocessor Segment Overrun",
        10 => "Invalid TSS (#TS)",
        11 => "Segment Not Present (#NP)",
        12 => "Stack Segment Fault (#SS)",
        13 => "General Protection Fault (#GP)",
        14 => "Page Fault (#PF)",
        16 => "x87 FP Exception (#MF)",
        17 => "Alignment Check (#AC)",
        18 => "Machine Check (#MC)",
        19 => "SIMD FP Exception (#XM)",
        20 => "Virtualization Exception (#VE)",
        21 => "Control Protection (#CP)",
        15 | 22..=31 => "Reserved Exception",
        _ => "External Interrupt",
    }
}

/// Routes a normalized frame to the vector's registered handler.
///
/// Called from the shared stub epilogue with interrupts masked. An
/// unregistered vector is fatal for the core.
#[no_mangle]
pub extern "C" fn common_interrupt_handler(frame: &mut InterruptFrame) {
    let vector = frame.interrupt_number as usize;
    let handler = unsafe { (*addr_of!(HANDLERS))[vector] };
    match handler {
        Some(handler) => handler(frame),
        None => {
            serial_println!(
                "UNHANDLED INTERRUPT: vector {} [{}] error code {:#x} rip {:#x}",
                vector,
                vector_name(vector),
                frame.error_code,
                frame.rip
            );
            halt_loop();
        }
    }
}

pub fn enable() {
    interrupts::enable();
}

pub fn disable() {
    interrupts::disable();
}

pub fn are_enabled() -> bool {
    interrupts::are_enabled()
}

pub fn without_interrupts<F, R>(f: F) -> R
where
    F: FnOnce() -> R,
{
    interrupts::without_interrupts(f)
}

fn divide_error_handler(frame: &mut InterruptFrame) {
    serial_println!("EXCEPTION: DIVIDE ERROR at rip {:#x}", frame.rip);
    halt_loop();
}

fn debug_handler(frame: &mut InterruptFrame) {
    serial_println!("EXCEPTION: DEBUG at rip {:#x}", frame.rip);
    halt_loop();
}

fn nmi_handler(frame: &mut InterruptFrame) {
    serial_println!("EXCEPTION: NON-MASKABLE INTERRUPT at rip {:#x}", frame.rip);
    halt_loop();
}

/// The one recoverable default: log and resume at the next instruction.
fn breakpoint_handler(frame: &mut InterruptFrame) {
    serial_println!("EXCEPTION: BREAKPOINT at rip {:#x}", frame.rip);
}

fn page_fault_handler(frame: &mut InterruptFrame) {
    let error = PageFaultErrorCode::from_bits_truncate(frame.error_code);
    serial_println!(
        "EXCEPTION: PAGE FAULT at rip {:#x}\nFaulting address: {:#x}\nError code: {:?}",
        frame.rip,
        Cr2::read_raw(),
        error
    );
    halt_loop();
}

#[cfg(test)]
mod tests {
    use super::*;

    fn blank_frame(vector: u64) -> InterruptFrame {
        InterruptFrame {
            rax: 0,
            rbx: 0,
            rcx: 0,
            rdx: 0,
            rsi: 0,
            rdi: 0,
            rbp: 0,
            r8: 0,
            r9: 0,
            r10: 0,
            r11: 0,
            r12: 0,
            r13: 0,
            r14: 0,
            r15: 0,
            interrupt_number: vector,
            error_code: 0,
            rip: 0x1000,
            cs: 0x08,
            rflags: 0x202,
            rsp: 0,
            ss: 0x10,
        }
    }

    #[test]
    fn gate_encoding_is_architectural() {
        assert_eq!(size_of::<IdtEntry>(), 16);

        let entry = IdtEntry::interrupt_gate(0x1234_5678_9ABC_DEF0);
        assert!(entry.is_present());
        assert_eq!(entry.handler(), 0x1234_5678_9ABC_DEF0);
        assert_eq!(entry.selector(), 0x08);
        assert_eq!(entry.gate_type(), 0xE);
        assert_eq!(entry.dpl(), 0);
        assert_eq!(entry.ist(), 0);

        let empty = IdtEntry::empty();
        assert!(!empty.is_present());
        assert_eq!(empty.handler(), 0);
    }

    #[test]
    fn populated_table_points_every_gate_at_its_stub() {
        let mut idt = Idt::new();
        idt.populate();

        for vector in 0..IDT_ENTRIES {
            let entry = idt.entry(vector);
            assert!(entry.is_present());
            assert_eq!(entry.selector(), 0x08);
            assert_eq!(entry.gate_type(), 0xE);
            assert_eq!(entry.dpl(), 0);
            assert_eq!(entry.ist(), 0);
            assert_eq!(entry.handler(), stubs::stub_address(vector));
        }
    }

    #[test]
    fn dispatcher_invokes_the_registered_handler_once() {
        use core::sync::atomic::{AtomicU64, Ordering};

        static CALLS: AtomicU64 = AtomicU64::new(0);
        static SEEN_VECTOR: AtomicU64 = AtomicU64::new(u64::MAX);

        fn probe(frame: &mut InterruptFrame) {
            CALLS.fetch_add(1, Ordering::Relaxed);
            SEEN_VECTOR.store(frame.interrupt_number, Ordering::Relaxed);
        }

        register_handler(200, probe);
        let mut frame = blank_frame(200);
        common_interrupt_handler(&mut frame);

        assert_eq!(CALLS.load(Ordering::Relaxed), 1);
        assert_eq!(SEEN_VECTOR.load(Ordering::Relaxed), 200);
    }

    #[test]
    fn handlers_can_be_replaced() {
        use core::sync::atomic::{AtomicU64, Ordering};

        static FIRST: AtomicU64 = AtomicU64::new(0);
        static SECOND: AtomicU64 = AtomicU64::new(0);

        fn first(_: &mut InterruptFrame) {
            FIRST.fetch_add(1, Ordering::Relaxed);
        }
        fn second(_: &mut InterruptFrame) {
            SECOND.fetch_add(1, Ordering::Relaxed);
        }

        register_handler(201, first);
        register_handler(201, second);
        common_interrupt_handler(&mut blank_frame(201));

        assert_eq!(FIRST.load(Ordering::Relaxed), 0);
        assert_eq!(SECOND.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn vector_names_cover_the_architectural_range() {
        assert_eq!(vector_name(0), "Divide Error (#DE)");
        assert_eq!(vector_name(8), "Double Fault (#DF)");
        assert_eq!(vector_name(14), "Page Fault (#PF)");
        assert_eq!(vector_name(25), "Reserved Exception");
        assert_eq!(vector_name(33), "External Interrupt");
    }

    #[test]
    fn page_fault_error_code_decodes_bit_exactly() {
        let error = PageFaultErrorCode::from_bits_truncate(0b10101);
        assert!(error.contains(PageFaultErrorCode::PROTECTION_VIOLATION));
        assert!(!error.contains(PageFaultErrorCode::CAUSED_BY_WRITE));
        assert!(error.contains(PageFaultErrorCode::USER_MODE));
        assert!(!error.contains(PageFaultErrorCode::RESERVED_WRITE));
        assert!(error.contains(PageFaultErrorCode::INSTRUCTION_FETCH));
    }
}
