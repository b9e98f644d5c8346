//! Physical memory management.

pub mod bitmap;
pub mod frame_allocator;

use self::frame_allocator::BitmapFrameAllocator;
use lazy_static::lazy_static;
use limine::request::HhdmRequest;
use spin::Mutex;
use x86_64::structures::paging::{FrameAllocator, FrameDeallocator, PhysFrame};
use x86_64::VirtAddr;

#[used]
#[link_section = ".requests"]
pub static HHDM_REQUEST: HhdmRequest = HhdmRequest::new();

lazy_static! {
    /// Base of the higher-half direct map; physical address P is readable at
    /// P + this offset.
    pub static ref HHDM_OFFSET: VirtAddr = VirtAddr::new(
        HHDM_REQUEST
            .get_response()
            .expect("HHDM request failed")
            .offset()
    );
}

/// The one frame allocator. Callers on any core serialize through the lock.
pub static FRAME_ALLOCATOR: Mutex<Option<BitmapFrameAllocator>> = Mutex::new(None);

/// Brings up physical memory management.
///
/// Only the BSP constructs the allocator; it must run before anything asks
/// for a frame.
pub fn init(cpu_id: u32) {
    if cpu_id == 0 {
        *FRAME_ALLOCATOR.lock() = Some(unsafe { BitmapFrameAllocator::init() });
    }
}

/// Allocates one frame from the global allocator.
pub fn allocate_frame() -> Option<PhysFrame> {
    FRAME_ALLOCATOR
        .lock()
        .as_mut()
        .and_then(|allocator| allocator.allocate_frame())
}

/// Returns a frame previously handed out by [`allocate_frame`].
pub fn deallocate_frame(frame: PhysFrame) {
    if let Some(allocator) = FRAME_ALLOCATOR.lock().as_mut() {
        unsafe { allocator.deallocate_frame(frame) };
    }
}

#[cfg(target_os = "none")]
extern "C" {
    static _kernel_start: u8;
    static _kernel_end: u8;
}

/// Virtual bounds of the kernel image, as laid out by the linker script.
#[cfg(target_os = "none")]
pub fn kernel_image_bounds() -> (VirtAddr, VirtAddr) {
    unsafe {
        (
            VirtAddr::from_ptr(core::ptr::addr_of!(_kernel_start)),
            VirtAddr::from_ptr(core::ptr::addr_of!(_kernel_end)),
        )
    }
}
