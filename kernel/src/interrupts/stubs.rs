//! Per-vector interrupt entry stubs.
//!
//! Every vector gets a tiny trampoline that normalizes the stack into one
//! frame shape: vectors the CPU pushes no error code for (everything except
//! 8, 10-14, 17, 21, 29 and 30) first push a zero placeholder, then all of
//! them push their vector number and fall into a shared epilogue. The
//! epilogue saves the general-purpose registers so the frame reads
//! rax-first from low addresses, hands the stack pointer to
//! `common_interrupt_handler`, restores everything, drops the vector and
//! error code, and returns with `iretq`.
//!
//! The stubs and the `interrupt_stubs` address table are generated rather
//! than hand-written; the assembler macro below is instantiated once per
//! vector.

use core::arch::global_asm;

global_asm!(
    r#"
.altmacro

.macro vector_stub n
vector_stub_\n:
    .if (\n == 8) || (\n == 10) || (\n == 11) || (\n == 12) || (\n == 13) || (\n == 14) || (\n == 17) || (\n == 21) || (\n == 29) || (\n == 30)
    .else
    push 0
    .endif
    push \n
    jmp interrupt_common
.endm

.macro vector_stub_address n
    .quad vector_stub_\n
.endm

.section .text.interrupt_stubs, "ax"

interrupt_common:
    push r15
    push r14
    push r13
    push r12
    push r11
    push r10
    push r9
    push r8
    push rbp
    push rdi
    push rsi
    push rdx
    push rcx
    push rbx
    push rax
    mov rdi, rsp
    call {dispatch}
    pop rax
    pop rbx
    pop rcx
    pop rdx
    pop rsi
    pop rdi
    pop rbp
    pop r8
    pop r9
    pop r10
    pop r11
    pop r12
    pop r13
    pop r14
    pop r15
    add rsp, 16
    iretq

.set vector, 0
.rept 256
    vector_stub %vector
    .set vector, vector + 1
.endr

.section .rodata.interrupt_stubs, "a"
.global interrupt_stubs
.p2align 3
interrupt_stubs:
.set vector, 0
.rept 256
    vector_stub_address %vector
    .set vector, vector + 1
.endr

.noaltmacro
.text
"#,
    dispatch = sym crate::interrupts::idt::common_interrupt_handler,
);

extern "C" {
    /// Entry address of each vector's stub.
    #[link_name = "interrupt_stubs"]
    static INTERRUPT_STUBS: [u64; 256];
}

/// Address of the stub serving `vector`.
pub fn stub_address(vector: usize) -> u64 {
    unsafe { INTERRUPT_STUBS[vector] }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_vector_has_a_distinct_stub() {
        let mut seen = std::collections::BTreeSet::new();
        for vector in 0..256 {
            let address = stub_address(vector);
            assert_ne!(address, 0);
            assert!(seen.insert(address), "vector {vector} shares a stub");
        }
    }

    #[test]
    fn stubs_normalize_the_missing_error_code() {
        // A no-error stub opens with `push 0`; an error-code stub pushes its
        // vector number immediately. Both encode as `push imm8` below 128.
        for vector in [0usize, 3, 32, 64, 127] {
            let opening = unsafe { *(stub_address(vector) as *const [u8; 2]) };
            assert_eq!(opening, [0x6A, 0x00], "vector {vector}");
        }
        for vector in [8usize, 10, 11, 12, 13, 14, 17, 21, 29, 30] {
            let opening = unsafe { *(stub_address(vector) as *const [u8; 2]) };
            assert_eq!(opening, [0x6A, vector as u8], "vector {vector}");
        }
    }
}
