#![cfg_attr(target_os = "none", no_std)]
#![cfg_attr(target_os = "none", no_main)]

#[cfg(target_os = "none")]
mod kernel {
    use lumen::serial_println;

    #[no_mangle]
    extern "C" fn kmain() -> ! {
        let bsp_id = lumen::init::init();
        lumen::info!("BSP (LAPIC {}) entering idle loop", bsp_id);
        lumen::idle_loop()
    }

    #[panic_handler]
    fn rust_panic(info: &core::panic::PanicInfo) -> ! {
        serial_println!("Kernel panic: {}", info);
        lumen::halt_loop()
    }
}

/// The kernel only runs on the bare-metal target; host builds stop at the
/// library and its tests.
#[cfg(not(target_os = "none"))]
fn main() {}
