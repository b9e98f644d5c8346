//! Physical frame allocator.
//!
//! Owns a page-granular bitmap covering physical memory up to the top usable
//! address and hands out 4 KiB frames. The bitmap itself is placed in the
//! first usable region large enough to hold it, reached through the HHDM, and
//! its own frames are accounted as allocated.

use limine::memory_map::{Entry, EntryType};
use limine::request::{KernelAddressRequest, MemoryMapRequest};
use x86_64::structures::paging::{FrameAllocator, FrameDeallocator, PhysFrame, Size4KiB};
use x86_64::{PhysAddr, VirtAddr};

use crate::constants::memory::{BITMAP_ENTRY_SIZE, FRAME_SIZE, PAGE_SIZE};
use crate::memory::bitmap::{words_for, BitState, Bitmap};
use crate::memory::HHDM_OFFSET;

#[used]
#[link_section = ".requests"]
static MEMORY_MAP_REQUEST: MemoryMapRequest = MemoryMapRequest::new();

#[used]
#[link_section = ".requests"]
static KERNEL_ADDRESS_REQUEST: KernelAddressRequest = KernelAddressRequest::new();

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameAllocatorError {
    /// No frame, or no region able to host the bitmap, is available.
    OutOfMemory,
}

impl FrameAllocatorError {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::OutOfMemory => "out of physical memory",
        }
    }
}

impl core::fmt::Display for FrameAllocatorError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One memory-map entry, reduced to what frame accounting needs.
#[derive(Debug, Clone, Copy)]
pub struct MemoryRegion {
    pub base: u64,
    pub length: u64,
    pub usable: bool,
}

impl From<&Entry> for MemoryRegion {
    fn from(entry: &Entry) -> Self {
        Self {
            base: entry.base,
            length: entry.length,
            usable: entry.entry_type == EntryType::USABLE,
        }
    }
}

pub struct BitmapFrameAllocator {
    /// Byte address of the first usable frame.
    physical_usable_memory_start: u64,
    /// Exclusive upper bound on the tracked physical address space.
    physical_memory_size: u64,
    /// Virtual base the kernel image is linked at, from the boot protocol.
    virtual_kernel_space_start: VirtAddr,
    /// One bit per 4 KiB frame below `physical_memory_size`.
    bitmap: Bitmap<&'static mut [u64]>,
    /// Frame index expected to be free; refreshed after every allocation.
    next_available_frame: usize,
}

impl BitmapFrameAllocator {
    /// Builds the allocator from the Limine boot responses.
    ///
    /// Absence of a required response, or a memory map without a region able
    /// to host the frame bitmap, is a fatal startup error.
    ///
    /// # Safety
    /// Must run once, on the BSP, while the boot-provided memory map still
    /// describes reality. The chosen placement region is claimed for the
    /// bitmap for the lifetime of the kernel.
    pub unsafe fn init() -> Self {
        let memory_map = MEMORY_MAP_REQUEST
            .get_response()
            .expect("Memory map request failed");
        let kernel_address = KERNEL_ADDRESS_REQUEST
            .get_response()
            .expect("Kernel address request failed");

        let regions = memory_map
            .entries()
            .iter()
            .map(|entry| MemoryRegion::from(*entry));
        Self::from_regions(regions, HHDM_OFFSET.as_u64(), kernel_address.virtual_base())
            .expect("no usable region can host the frame bitmap")
    }

    /// Core construction over an arbitrary region list.
    ///
    /// Every frame starts out allocated; usable regions are then released and
    /// the bitmap's own frames re-claimed. Map holes and non-usable entries
    /// therefore read as allocated without a second walk.
    ///
    /// # Safety
    /// `hhdm_offset` must map the chosen placement region to writable virtual
    /// memory for the lifetime of the allocator.
    pub unsafe fn from_regions(
        regions: impl Iterator<Item = MemoryRegion> + Clone,
        hhdm_offset: u64,
        kernel_virtual_base: u64,
    ) -> Result<Self, FrameAllocatorError> {
        let usable = |region: &MemoryRegion| region.usable;

        let max_physical_address = regions
            .clone()
            .filter(usable)
            .map(|region| region.base + region.length - 1)
            .max()
            .ok_or(FrameAllocatorError::OutOfMemory)?;
        let physical_usable_memory_start = regions
            .clone()
            .filter(usable)
            .map(|region| region.base)
            .min()
            .ok_or(FrameAllocatorError::OutOfMemory)?;

        let physical_memory_size = max_physical_address + 1;
        let total_frames = physical_memory_size.div_ceil(PAGE_SIZE) as usize;
        let bitmap_words = words_for(total_frames);
        let bitmap_bytes = bitmap_words * (BITMAP_ENTRY_SIZE / 8);

        // The first usable region large enough hosts the bitmap, through the
        // HHDM window.
        let host = regions
            .clone()
            .filter(usable)
            .find(|region| region.length >= bitmap_bytes as u64)
            .ok_or(FrameAllocatorError::OutOfMemory)?;
        let storage =
            core::slice::from_raw_parts_mut((host.base + hhdm_offset) as *mut u64, bitmap_words);

        let mut bitmap =
            Bitmap::new(total_frames, storage).map_err(|_| FrameAllocatorError::OutOfMemory)?;
        bitmap
            .set_contiguous(0, total_frames, BitState::Allocated)
            .expect("frame bitmap covers every tracked frame");

        for region in regions.clone().filter(usable) {
            let first = (region.base / PAGE_SIZE) as usize;
            let last = ((region.base + region.length) / PAGE_SIZE) as usize;
            bitmap
                .set_contiguous(first, last - first, BitState::Free)
                .expect("usable region lies below the tracked top of memory");
        }

        let bitmap_first_frame = (host.base / PAGE_SIZE) as usize;
        let bitmap_frames = bitmap_bytes.div_ceil(FRAME_SIZE);
        bitmap
            .set_contiguous(bitmap_first_frame, bitmap_frames, BitState::Allocated)
            .expect("bitmap frames lie below the tracked top of memory");

        let next_available_frame = bitmap
            .find_first_free()
            .map_err(|_| FrameAllocatorError::OutOfMemory)?;

        Ok(Self {
            physical_usable_memory_start,
            physical_memory_size,
            virtual_kernel_space_start: VirtAddr::new(kernel_virtual_base),
            bitmap,
            next_available_frame,
        })
    }

    /// Hands out one 4 KiB frame and returns its physical address.
    ///
    /// The returned address is page-aligned, was free immediately before the
    /// call, and is not handed out again until freed.
    pub fn get_page(&mut self) -> Result<u64, FrameAllocatorError> {
        let hint = self.next_available_frame;
        let hint_taken = self
            .bitmap
            .is_set(hint)
            .map_err(|_| FrameAllocatorError::OutOfMemory)?;
        let frame = if hint_taken {
            // The hint goes stale when the map fills up and a frame is freed
            // afterwards; fall back to a full search.
            self.bitmap
                .find_first_free()
                .map_err(|_| FrameAllocatorError::OutOfMemory)?
        } else {
            hint
        };
        self.bitmap
            .set(frame, BitState::Allocated)
            .map_err(|_| FrameAllocatorError::OutOfMemory)?;
        // On a now-full bitmap the stale hint stays and triggers the search
        // above on the next call.
        self.next_available_frame = self.bitmap.find_first_free().unwrap_or(frame);
        Ok(frame as u64 * PAGE_SIZE)
    }

    /// Returns `phys_addr` to the free pool.
    ///
    /// The address must be page-aligned and must have been handed out by
    /// [`Self::get_page`]; anything else is a kernel bug.
    pub fn free_page(&mut self, phys_addr: u64) {
        assert!(
            phys_addr % PAGE_SIZE == 0,
            "freeing an unaligned physical address"
        );
        let frame = (phys_addr / PAGE_SIZE) as usize;
        assert!(
            self.bitmap.is_set(frame).unwrap_or(false),
            "freeing a frame that is not allocated"
        );
        self.bitmap
            .set(frame, BitState::Free)
            .expect("freed frame lies below the tracked top of memory");
    }

    /// Whether the frame containing `frame`'s start address is allocated.
    pub fn is_frame_used(&self, frame: PhysFrame) -> bool {
        let index = (frame.start_address().as_u64() / PAGE_SIZE) as usize;
        self.bitmap.is_set(index).unwrap_or(true)
    }

    pub fn free_frames(&self) -> usize {
        self.bitmap.free_entries()
    }

    pub fn total_frames(&self) -> usize {
        self.bitmap.total_entries()
    }

    /// Virtual base address of the kernel image.
    pub fn kernel_space_start(&self) -> VirtAddr {
        self.virtual_kernel_space_start
    }
}

unsafe impl FrameAllocator<Size4KiB> for BitmapFrameAllocator {
    fn allocate_frame(&mut self) -> Option<PhysFrame> {
        self.get_page()
            .ok()
            .map(|addr| PhysFrame::containing_address(PhysAddr::new(addr)))
    }
}

impl FrameDeallocator<Size4KiB> for BitmapFrameAllocator {
    unsafe fn deallocate_frame(&mut self, frame: PhysFrame<Size4KiB>) {
        self.free_page(frame.start_address().as_u64());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KERNEL_BASE: u64 = 0xFFFF_FFFF_8000_0000;

    /// The two-usable-region map exercised throughout: 9 usable frames from
    /// 0x1000, a reserved page at 0xA000, then usable memory up to 0x10AFFF.
    const TWO_REGION_MAP: [MemoryRegion; 3] = [
        MemoryRegion {
            base: 0x1000,
            length: 0x9000,
            usable: true,
        },
        MemoryRegion {
            base: 0xA000,
            length: 0x1000,
            usable: false,
        },
        MemoryRegion {
            base: 0xB000,
            length: 0x100000,
            usable: true,
        },
    ];

    /// Fakes the HHDM so that physical address `base` resolves to `buffer`.
    fn hhdm_for<T>(buffer: *mut T, base: u64) -> u64 {
        (buffer as u64).wrapping_sub(base)
    }

    #[test]
    fn construction_covers_holes_reserved_and_bitmap_frames() {
        static mut STORAGE: [u64; 8] = [0; 8];
        let hhdm = hhdm_for(unsafe { core::ptr::addr_of_mut!(STORAGE) }, 0x1000);

        let allocator = unsafe {
            BitmapFrameAllocator::from_regions(TWO_REGION_MAP.iter().copied(), hhdm, KERNEL_BASE)
        }
        .unwrap();

        assert_eq!(allocator.physical_memory_size, 0x10B000);
        assert_eq!(allocator.physical_usable_memory_start, 0x1000);
        assert_eq!(allocator.total_frames(), 0x10B);
        assert_eq!(allocator.kernel_space_start(), VirtAddr::new(KERNEL_BASE));

        // Frame 0 is a map hole, frame 1 hosts the bitmap, frame 0xA is
        // reserved; everything else below the top is usable.
        assert!(allocator.bitmap.is_set(0).unwrap());
        assert!(allocator.bitmap.is_set(1).unwrap());
        assert!(allocator.bitmap.is_set(0xA).unwrap());
        for frame in 2..0xA {
            assert!(!allocator.bitmap.is_set(frame).unwrap());
        }
        for frame in 0xB..0x10B {
            assert!(!allocator.bitmap.is_set(frame).unwrap());
        }
        assert_eq!(allocator.next_available_frame, 2);
    }

    #[test]
    fn first_page_after_boot_is_the_lowest_free_frame() {
        static mut STORAGE: [u64; 8] = [0; 8];
        let hhdm = hhdm_for(unsafe { core::ptr::addr_of_mut!(STORAGE) }, 0x1000);

        let mut allocator = unsafe {
            BitmapFrameAllocator::from_regions(TWO_REGION_MAP.iter().copied(), hhdm, KERNEL_BASE)
        }
        .unwrap();

        assert_eq!(allocator.get_page(), Ok(0x2000));
        assert!(allocator.bitmap.is_set(2).unwrap());
        assert_ne!(allocator.next_available_frame, 2);
    }

    #[test]
    fn handed_out_pages_are_distinct_and_aligned() {
        static mut STORAGE: [u64; 8] = [0; 8];
        let hhdm = hhdm_for(unsafe { core::ptr::addr_of_mut!(STORAGE) }, 0x1000);

        let mut allocator = unsafe {
            BitmapFrameAllocator::from_regions(TWO_REGION_MAP.iter().copied(), hhdm, KERNEL_BASE)
        }
        .unwrap();

        let mut seen = std::collections::BTreeSet::new();
        for _ in 0..32 {
            let addr = allocator.get_page().unwrap();
            assert_eq!(addr % PAGE_SIZE, 0);
            assert_ne!(addr, 0xA000, "reserved frame must never be handed out");
            assert!(seen.insert(addr), "frame {addr:#x} handed out twice");
        }
    }

    #[test]
    fn freed_page_becomes_allocatable_again() {
        static mut STORAGE: [u64; 8] = [0; 8];
        let hhdm = hhdm_for(unsafe { core::ptr::addr_of_mut!(STORAGE) }, 0x1000);

        let mut allocator = unsafe {
            BitmapFrameAllocator::from_regions(TWO_REGION_MAP.iter().copied(), hhdm, KERNEL_BASE)
        }
        .unwrap();

        let free_before = allocator.free_frames();
        let addr = allocator.get_page().unwrap();
        assert_eq!(allocator.free_frames(), free_before - 1);

        allocator.free_page(addr);
        assert_eq!(allocator.free_frames(), free_before);
        assert!(!allocator
            .bitmap
            .is_set((addr / PAGE_SIZE) as usize)
            .unwrap());
    }

    #[test]
    fn exhaustion_reports_out_of_memory() {
        // Four frames of memory at zero; frame 0 ends up hosting the bitmap.
        static mut STORAGE: [u64; 1] = [0; 1];
        let hhdm = hhdm_for(unsafe { core::ptr::addr_of_mut!(STORAGE) }, 0);
        let map = [MemoryRegion {
            base: 0,
            length: 0x4000,
            usable: true,
        }];

        let mut allocator =
            unsafe { BitmapFrameAllocator::from_regions(map.iter().copied(), hhdm, KERNEL_BASE) }
                .unwrap();

        assert_eq!(allocator.get_page(), Ok(0x1000));
        assert_eq!(allocator.get_page(), Ok(0x2000));
        assert_eq!(allocator.get_page(), Ok(0x3000));
        assert_eq!(allocator.get_page(), Err(FrameAllocatorError::OutOfMemory));

        allocator.free_page(0x2000);
        assert_eq!(allocator.get_page(), Ok(0x2000));
    }

    #[test]
    #[should_panic(expected = "not allocated")]
    fn freeing_a_free_frame_is_a_kernel_bug() {
        static mut STORAGE: [u64; 8] = [0; 8];
        let hhdm = hhdm_for(unsafe { core::ptr::addr_of_mut!(STORAGE) }, 0x1000);

        let mut allocator = unsafe {
            BitmapFrameAllocator::from_regions(TWO_REGION_MAP.iter().copied(), hhdm, KERNEL_BASE)
        }
        .unwrap();

        let addr = allocator.get_page().unwrap();
        allocator.free_page(addr);
        allocator.free_page(addr);
    }

    #[test]
    fn map_without_usable_region_is_rejected() {
        let map = [MemoryRegion {
            base: 0x1000,
            length: 0x4000,
            usable: false,
        }];
        let result = unsafe { BitmapFrameAllocator::from_regions(map.iter().copied(), 0, 0) };
        assert!(matches!(result, Err(FrameAllocatorError::OutOfMemory)));
    }
}
