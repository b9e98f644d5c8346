//! Boot wiring: Limine requests and CPU bring-up.
//!
//! The BSP builds the physical memory manager and the shared IDT, loads its
//! own GDT/TSS, enables interrupts, and then releases the application
//! processors. Each AP loads per-core descriptor tables and the shared IDT
//! before its `sti`, then parks awaiting work.

use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use limine::request::{RequestsEndMarker, RequestsStartMarker, SmpRequest};
use limine::smp::Cpu;
use limine::BaseRevision;
use x86_64::instructions::interrupts::int3;

use crate::interrupts::{self, idt};
use crate::{debug, devices, info, logging, memory, serial_println, trace};

#[used]
#[link_section = ".requests"]
static BASE_REVISION: BaseRevision = BaseRevision::new();

#[used]
#[link_section = ".requests"]
static SMP_REQUEST: SmpRequest = SmpRequest::new();

#[used]
#[link_section = ".requests_start_marker"]
static _START_MARKER: RequestsStartMarker = RequestsStartMarker::new();

#[used]
#[link_section = ".requests_end_marker"]
static _END_MARKER: RequestsEndMarker = RequestsEndMarker::new();

static BOOT_COMPLETE: AtomicBool = AtomicBool::new(false);
static BOOTED_CPUS: AtomicU64 = AtomicU64::new(0);

/// Brings the machine up and returns the BSP's local-APIC id.
pub fn init() -> u32 {
    assert!(BASE_REVISION.is_supported());

    serial_println!("Booting BSP...");

    logging::init(0);
    memory::init(0);
    interrupts::init(0);
    devices::init(0);

    idt::enable();

    let (kernel_start, kernel_end) = memory::kernel_image_bounds();
    debug!(
        "Kernel image spans {:#x}..{:#x}",
        kernel_start.as_u64(),
        kernel_end.as_u64()
    );

    // Breakpoint round trip: proves gates, stubs and dispatch work before
    // the other cores come up.
    int3();

    if let Some(frame) = memory::allocate_frame() {
        debug!("First free frame sits at {:#x}", frame.start_address());
        memory::deallocate_frame(frame);
    }

    let bsp_id = wake_cores();
    info!(
        "{} core(s) online, BSP is LAPIC {}",
        BOOTED_CPUS.load(Ordering::Relaxed) + 1,
        bsp_id
    );
    bsp_id
}

/// Entry point for every application processor.
#[no_mangle]
unsafe extern "C" fn secondary_cpu_main(cpu: &Cpu) -> ! {
    BOOTED_CPUS.fetch_add(1, Ordering::Relaxed);

    interrupts::init(cpu.id);

    while !BOOT_COMPLETE.load(Ordering::SeqCst) {
        core::hint::spin_loop();
    }

    idt::enable();
    debug!("AP {} (LAPIC {}) initialized", cpu.id, cpu.lapic_id);

    crate::idle_loop()
}

fn wake_cores() -> u32 {
    let smp_response = SMP_REQUEST.get_response().expect("SMP request failed");
    let cpu_count = smp_response.cpus().len() as u64;
    let bsp_lapic_id = smp_response.bsp_lapic_id();

    trace!("Detected {} CPU cores", cpu_count);

    for cpu in smp_response.cpus() {
        if cpu.lapic_id != bsp_lapic_id {
            cpu.goto_address.write(secondary_cpu_main);
        }
    }

    while BOOTED_CPUS.load(Ordering::Relaxed) < cpu_count - 1 {
        core::hint::spin_loop();
    }

    BOOT_COMPLETE.store(true, Ordering::SeqCst);

    debug!("All CPUs initialized");
    bsp_lapic_id
}
