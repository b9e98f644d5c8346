//! Global Descriptor Table selectors, descriptor bits and stack configuration.

/// Selector for the kernel code segment (GDT entry 1).
pub const KERNEL_CODE_SELECTOR: u16 = 0x08;

/// Selector for the kernel data segment (GDT entry 2).
pub const KERNEL_DATA_SELECTOR: u16 = 0x10;

/// Selector for the user code segment (GDT entry 3).
pub const USER_CODE_SELECTOR: u16 = 0x18;

/// Selector for the user data segment (GDT entry 4).
pub const USER_DATA_SELECTOR: u16 = 0x20;

/// Selector for the TSS descriptor (GDT entries 5 and 6 together).
pub const TSS_SELECTOR: u16 = 0x28;

/// Size of each core's kernel stack in bytes.
pub const KERNEL_STACK_SIZE: usize = 4096 * 2;

// Access-byte bits. The positions are architecturally fixed.
pub const ACCESS_PRESENT: u8 = 1 << 7;
pub const ACCESS_DPL_RING3: u8 = 3 << 5;
pub const ACCESS_CODE_DATA: u8 = 1 << 4;
pub const ACCESS_EXECUTABLE: u8 = 1 << 3;
pub const ACCESS_READ_WRITE: u8 = 1 << 1;

/// Access type of a 64-bit available TSS system segment.
pub const TSS_TYPE_AVAILABLE_64: u8 = 0x9;

// Flags nibble of a descriptor's sixth byte.
pub const FLAG_GRANULARITY: u8 = 1 << 3;
pub const FLAG_SIZE_32: u8 = 1 << 2;
pub const FLAG_LONG_MODE: u8 = 1 << 1;
