//! Global Descriptor Table and Task State Segment, one of each per core.
//!
//! Long mode ignores segment bases and limits for ordinary segments; what
//! matters is the access byte and flags nibble of each descriptor, plus the
//! TSS descriptor pointing at the core's own task state. Each record here has
//! an architecturally fixed layout, so everything is `repr(C, packed)` with
//! its size pinned by a static assertion.

use core::mem::size_of;
use core::ptr::{addr_of, addr_of_mut};

use x86_64::instructions::segmentation::{Segment, CS, DS, ES, FS, GS, SS};
use x86_64::instructions::tables::{lgdt, load_tss};
use x86_64::structures::gdt::SegmentSelector;
use x86_64::structures::DescriptorTablePointer;
use x86_64::VirtAddr;

use crate::constants::gdt::{
    ACCESS_CODE_DATA, ACCESS_DPL_RING3, ACCESS_EXECUTABLE, ACCESS_PRESENT, ACCESS_READ_WRITE,
    FLAG_GRANULARITY, FLAG_LONG_MODE, FLAG_SIZE_32, KERNEL_CODE_SELECTOR, KERNEL_DATA_SELECTOR,
    KERNEL_STACK_SIZE, TSS_SELECTOR, TSS_TYPE_AVAILABLE_64,
};
use crate::constants::MAX_CORES;

/// One ordinary 8-byte segment descriptor.
#[repr(C, packed)]
#[derive(Clone, Copy)]
pub struct GdtEntry {
    limit_low: u16,
    base_low: u16,
    base_middle: u8,
    access: u8,
    limit_high_flags: u8,
    base_high: u8,
}

impl GdtEntry {
    pub const fn null() -> Self {
        Self {
            limit_low: 0,
            base_low: 0,
            base_middle: 0,
            access: 0,
            limit_high_flags: 0,
            base_high: 0,
        }
    }

    /// Flat segment with the given access byte and flags nibble.
    const fn flat(access: u8, flags: u8) -> Self {
        Self {
            limit_low: 0xFFFF,
            base_low: 0,
            base_middle: 0,
            access,
            limit_high_flags: (flags << 4) | 0x0F,
            base_high: 0,
        }
    }

    pub const fn kernel_code() -> Self {
        Self::flat(
            ACCESS_PRESENT | ACCESS_CODE_DATA | ACCESS_EXECUTABLE | ACCESS_READ_WRITE,
            FLAG_GRANULARITY | FLAG_LONG_MODE,
        )
    }

    pub const fn kernel_data() -> Self {
        Self::flat(
            ACCESS_PRESENT | ACCESS_CODE_DATA | ACCESS_READ_WRITE,
            FLAG_GRANULARITY | FLAG_SIZE_32,
        )
    }

    pub const fn user_code() -> Self {
        Self::flat(
            ACCESS_PRESENT | ACCESS_DPL_RING3 | ACCESS_CODE_DATA | ACCESS_EXECUTABLE
                | ACCESS_READ_WRITE,
            FLAG_GRANULARITY | FLAG_LONG_MODE,
        )
    }

    pub const fn user_data() -> Self {
        Self::flat(
            ACCESS_PRESENT | ACCESS_DPL_RING3 | ACCESS_CODE_DATA | ACCESS_READ_WRITE,
            FLAG_GRANULARITY | FLAG_SIZE_32,
        )
    }

    pub const fn access(&self) -> u8 {
        self.access
    }

    /// High nibble of the sixth byte: granularity, size, long-mode, available.
    pub const fn flags(&self) -> u8 {
        self.limit_high_flags >> 4
    }
}

/// TSS descriptor: a 16-byte system descriptor spanning two GDT slots, the
/// upper one holding bits 63:32 of the base.
#[repr(C, packed)]
#[derive(Clone, Copy)]
pub struct TssEntry {
    limit_low: u16,
    base_low: u16,
    base_middle: u8,
    access: u8,
    limit_high_flags: u8,
    base_high: u8,
    base_upper: u32,
    reserved: u32,
}

impl TssEntry {
    pub const fn empty() -> Self {
        Self {
            limit_low: 0,
            base_low: 0,
            base_middle: 0,
            access: 0,
            limit_high_flags: 0,
            base_high: 0,
            base_upper: 0,
            reserved: 0,
        }
    }

    pub fn new(base: u64, limit: u32) -> Self {
        Self {
            limit_low: (limit & 0xFFFF) as u16,
            base_low: (base & 0xFFFF) as u16,
            base_middle: ((base >> 16) & 0xFF) as u8,
            access: ACCESS_PRESENT | TSS_TYPE_AVAILABLE_64,
            limit_high_flags: ((limit >> 16) & 0x0F) as u8,
            base_high: ((base >> 24) & 0xFF) as u8,
            base_upper: (base >> 32) as u32,
            reserved: 0,
        }
    }

    pub fn base(&self) -> u64 {
        (self.base_low as u64)
            | ((self.base_middle as u64) << 16)
            | ((self.base_high as u64) << 24)
            | ((self.base_upper as u64) << 32)
    }

    pub fn limit(&self) -> u32 {
        (self.limit_low as u32) | (((self.limit_high_flags & 0x0F) as u32) << 16)
    }

    pub const fn access(&self) -> u8 {
        self.access
    }

    pub const fn flags(&self) -> u8 {
        self.limit_high_flags >> 4
    }
}

/// 64-bit Task State Segment: three privilege stacks, seven IST stacks, and
/// the I/O permission bitmap offset.
#[repr(C, packed)]
#[derive(Clone, Copy)]
pub struct Tss {
    reserved_low: u32,
    rsp: [u64; 3],
    reserved_middle: u64,
    ist: [u64; 7],
    reserved_high: u64,
    reserved_iopb: u16,
    iopb: u16,
}

impl Tss {
    /// Empty TSS with the I/O bitmap pushed past the segment limit, meaning
    /// no ports are reachable from user mode.
    pub const fn new() -> Self {
        Self {
            reserved_low: 0,
            rsp: [0; 3],
            reserved_middle: 0,
            ist: [0; 7],
            reserved_high: 0,
            reserved_iopb: 0,
            iopb: size_of::<Tss>() as u16,
        }
    }

    pub fn set_rsp0(&mut self, stack_top: u64) {
        self.rsp[0] = stack_top;
    }

    pub fn rsp0(&self) -> u64 {
        self.rsp[0]
    }

    pub fn iopb(&self) -> u16 {
        self.iopb
    }
}

impl Default for Tss {
    fn default() -> Self {
        Self::new()
    }
}

/// One core's descriptor table: null, kernel code/data, user code/data, TSS.
#[repr(C, packed)]
#[derive(Clone, Copy)]
pub struct Gdt {
    null: GdtEntry,
    kernel_code: GdtEntry,
    kernel_data: GdtEntry,
    user_code: GdtEntry,
    user_data: GdtEntry,
    tss: TssEntry,
}

impl Gdt {
    pub const fn new() -> Self {
        Self {
            null: GdtEntry::null(),
            kernel_code: GdtEntry::kernel_code(),
            kernel_data: GdtEntry::kernel_data(),
            user_code: GdtEntry::user_code(),
            user_data: GdtEntry::user_data(),
            tss: TssEntry::empty(),
        }
    }

    /// Points the TSS descriptor at the task state segment at `base`.
    pub fn set_tss(&mut self, base: u64) {
        self.tss = TssEntry::new(base, (size_of::<Tss>() - 1) as u32);
    }
}

impl Default for Gdt {
    fn default() -> Self {
        Self::new()
    }
}

const _: () = assert!(size_of::<GdtEntry>() == 8);
const _: () = assert!(size_of::<TssEntry>() == 16);
const _: () = assert!(size_of::<Tss>() == 104);
const _: () = assert!(size_of::<Gdt>() == 7 * 8);

#[repr(C, align(16))]
#[derive(Clone, Copy)]
struct KernelStack([u8; KERNEL_STACK_SIZE]);

static mut GDTS: [Gdt; MAX_CORES] = [Gdt::new(); MAX_CORES];
static mut TSSS: [Tss; MAX_CORES] = [Tss::new(); MAX_CORES];
static mut KERNEL_STACKS: [KernelStack; MAX_CORES] =
    [KernelStack([0; KERNEL_STACK_SIZE]); MAX_CORES];

/// Builds this core's GDT and TSS in place and loads them.
///
/// Runs on the core named by `cpu_id`, before that core enables interrupts.
/// The register loads take effect in source order: GDTR, then the task
/// register, then the data selectors, and finally CS through the far-return
/// trampoline (the only sanctioned way to change CS outside an IRET).
pub fn init(cpu_id: u32) {
    let cpu = cpu_id as usize;
    assert!(cpu < MAX_CORES, "CPU ID exceeds MAX_CORES");

    unsafe {
        let stack_top =
            (*addr_of!(KERNEL_STACKS))[cpu].0.as_ptr() as u64 + KERNEL_STACK_SIZE as u64;

        let tss = addr_of_mut!((*addr_of_mut!(TSSS))[cpu]);
        *tss = Tss::new();
        (*tss).set_rsp0(stack_top);

        let gdt = addr_of_mut!((*addr_of_mut!(GDTS))[cpu]);
        *gdt = Gdt::new();
        (*gdt).set_tss(tss as u64);

        let pointer = DescriptorTablePointer {
            limit: (size_of::<Gdt>() - 1) as u16,
            base: VirtAddr::new(gdt as u64),
        };
        lgdt(&pointer);

        // Each core loads its own GDT, so the TSS descriptor always sits at
        // the same selector.
        load_tss(SegmentSelector(TSS_SELECTOR));

        DS::set_reg(SegmentSelector(KERNEL_DATA_SELECTOR));
        ES::set_reg(SegmentSelector(KERNEL_DATA_SELECTOR));
        FS::set_reg(SegmentSelector(KERNEL_DATA_SELECTOR));
        GS::set_reg(SegmentSelector(KERNEL_DATA_SELECTOR));
        SS::set_reg(SegmentSelector(KERNEL_DATA_SELECTOR));
        CS::set_reg(SegmentSelector(KERNEL_CODE_SELECTOR));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::gdt::{USER_CODE_SELECTOR, USER_DATA_SELECTOR};

    #[test]
    fn descriptor_sizes_are_architectural() {
        assert_eq!(size_of::<GdtEntry>(), 8);
        assert_eq!(size_of::<TssEntry>(), 16);
        assert_eq!(size_of::<Tss>(), 104);
        assert_eq!(size_of::<Gdt>(), 56);
    }

    #[test]
    fn gdt_matches_the_literal_access_and_flag_table() {
        let gdt = Gdt::new();

        let entries = [
            (gdt.null.access(), gdt.null.flags()),
            (gdt.kernel_code.access(), gdt.kernel_code.flags()),
            (gdt.kernel_data.access(), gdt.kernel_data.flags()),
            (gdt.user_code.access(), gdt.user_code.flags()),
            (gdt.user_data.access(), gdt.user_data.flags()),
        ];
        assert_eq!(
            entries,
            [(0, 0), (0x9A, 0xA), (0x92, 0xC), (0xFA, 0xA), (0xF2, 0xC)]
        );

        // The TSS slots stay empty until a task state segment is attached.
        assert_eq!(gdt.tss.access(), 0);
        assert_eq!(gdt.tss.flags(), 0);
    }

    #[test]
    fn tss_descriptor_round_trips_base_and_limit() {
        let mut gdt = Gdt::new();
        let base = 0xFFFF_8000_DEAD_B000u64;
        gdt.set_tss(base);

        assert_eq!(gdt.tss.access(), 0x89);
        assert_eq!(gdt.tss.flags(), 0x0);
        assert_eq!(gdt.tss.limit(), 103);
        assert_eq!(gdt.tss.base(), base);
    }

    #[test]
    fn tss_starts_with_an_empty_io_bitmap() {
        let tss = Tss::new();
        assert_eq!(tss.iopb(), 104);
        assert_eq!(tss.rsp0(), 0);
    }

    #[test]
    fn selectors_index_the_fixed_layout() {
        assert_eq!(KERNEL_CODE_SELECTOR, 0x08);
        assert_eq!(KERNEL_DATA_SELECTOR, 0x10);
        assert_eq!(USER_CODE_SELECTOR, 0x18);
        assert_eq!(USER_DATA_SELECTOR, 0x20);
        assert_eq!(TSS_SELECTOR, 0x28);
    }
}
