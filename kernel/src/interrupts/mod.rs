//! CPU descriptor tables and interrupt handling.
//!
//! Covers the Global Descriptor Table with one Task State Segment per core,
//! the shared Interrupt Descriptor Table, and the assembly stubs that funnel
//! every vector into the common dispatcher.

pub mod gdt;
pub mod idt;
pub mod stubs;

/// Loads this core's descriptor tables, with interrupts still disabled.
///
/// The BSP (`cpu_id` 0) also builds the shared IDT; application processors
/// only load it.
pub fn init(cpu_id: u32) {
    gdt::init(cpu_id);
    if cpu_id == 0 {
        idt::init();
    } else {
        idt::load();
    }
}
