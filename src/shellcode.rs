//! Builds the position-dependent trampolines the injection strategies and the manual mapper run
//! on a remote thread: a `DllMain` caller (x64 and x86) and a thread-hijack resume stub.
//!
//! Every trampoline is produced by [`iced_x86::CodeAssembler`] rather than a hand-encoded byte
//! table, and every builder re-assembles its own instructions at a second, different hypothetical
//! base and asserts the bytes are identical — these trampolines bake in absolute addresses, so a
//! silent base-dependent encoding bug would otherwise only show up as a crash in the target.

use iced_x86::code_asm::*;

use crate::error::SyringeError;

/// The conventional `DLL_PROCESS_ATTACH` reason code passed to `DllMain`.
pub const DLL_PROCESS_ATTACH: u32 = 1;

fn assemble_at(asm: &mut CodeAssembler, base: u64) -> Result<Vec<u8>, SyringeError> {
    asm.assemble(base)
        .map_err(|_| SyringeError::InvalidArgument("shellcode failed to assemble".into()))
}

/// Builds the 64-bit `DllMain` caller: `DllMain(image_base, DLL_PROCESS_ATTACH, NULL)`.
///
/// Reserves 32 bytes of shadow space per the x64 calling convention, loads `image_base` into
/// `rcx`, `DLL_PROCESS_ATTACH` into `edx`, zero into `r8`, calls the entry point (materialised
/// into `rax`), restores the stack and returns; the entry point's return value is left in `rax`
/// as the thread's exit code.
pub fn build_dll_main_caller_x64(
    image_base: u64,
    entry_point: u64,
) -> Result<Vec<u8>, SyringeError> {
    let mut asm = CodeAssembler::new(64)
        .map_err(|_| SyringeError::InvalidArgument("failed to create assembler".into()))?;

    asm.sub(rsp, 0x28i32)
        .map_err(|_| SyringeError::Unknown)?;
    asm.mov(rcx, image_base).map_err(|_| SyringeError::Unknown)?;
    asm.mov(edx, DLL_PROCESS_ATTACH).map_err(|_| SyringeError::Unknown)?;
    asm.xor(r8, r8).map_err(|_| SyringeError::Unknown)?;
    asm.mov(rax, entry_point).map_err(|_| SyringeError::Unknown)?;
    asm.call(rax).map_err(|_| SyringeError::Unknown)?;
    asm.add(rsp, 0x28i32).map_err(|_| SyringeError::Unknown)?;
    asm.ret().map_err(|_| SyringeError::Unknown)?;

    let code = assemble_at(&mut asm, 0x1234_5678)?;
    debug_assert_eq!(
        code,
        assemble_at(&mut asm, 0x1111_2222)?,
        "DllMain x64 caller stub is not location independent"
    );
    Ok(code)
}

/// Builds the 32-bit `DllMain` caller: `stdcall DllMain(image_base, DLL_PROCESS_ATTACH, NULL)`.
///
/// Pushes arguments right-to-left per `stdcall`, calls through `eax`, and `ret`s — the callee
/// pops its own arguments, so no epilogue is required on the caller's side.
pub fn build_dll_main_caller_x86(
    image_base: u32,
    entry_point: u32,
) -> Result<Vec<u8>, SyringeError> {
    let mut asm = CodeAssembler::new(32)
        .map_err(|_| SyringeError::InvalidArgument("failed to create assembler".into()))?;

    asm.push(0u32).map_err(|_| SyringeError::Unknown)?; // lpvReserved
    asm.push(DLL_PROCESS_ATTACH).map_err(|_| SyringeError::Unknown)?;
    asm.push(image_base).map_err(|_| SyringeError::Unknown)?;
    asm.mov(eax, entry_point).map_err(|_| SyringeError::Unknown)?;
    asm.call(eax).map_err(|_| SyringeError::Unknown)?;
    asm.ret().map_err(|_| SyringeError::Unknown)?;

    let code = assemble_at(&mut asm, 0x1234_5678)?;
    debug_assert_eq!(
        code,
        assemble_at(&mut asm, 0x1111_2222)?,
        "DllMain x86 caller stub is not location independent"
    );
    Ok(code)
}

/// Builds the thread-hijack resume stub: saves the full integer register set, calls
/// `LoadLibraryW(path_ptr)`, restores every register, then jumps back to `original_rip`.
///
/// Leaves the stack pointer exactly as the hijacked thread had it on entry — the push/pop pairs
/// below are symmetric and the final jump is a direct `jmp`, not a `call`, so no return address
/// is left behind.
pub fn build_thread_hijack_resume_x64(
    load_library_w: u64,
    path_ptr: u64,
    original_rip: u64,
) -> Result<Vec<u8>, SyringeError> {
    let mut asm = CodeAssembler::new(64)
        .map_err(|_| SyringeError::InvalidArgument("failed to create assembler".into()))?;

    for reg in [rax, rcx, rdx, rbx, rbp, rsi, rdi, r8, r9, r10, r11, r12, r13, r14, r15] {
        asm.push(reg).map_err(|_| SyringeError::Unknown)?;
    }

    asm.sub(rsp, 0x28i32).map_err(|_| SyringeError::Unknown)?;
    asm.mov(rcx, path_ptr).map_err(|_| SyringeError::Unknown)?;
    asm.mov(rax, load_library_w).map_err(|_| SyringeError::Unknown)?;
    asm.call(rax).map_err(|_| SyringeError::Unknown)?;
    asm.add(rsp, 0x28i32).map_err(|_| SyringeError::Unknown)?;

    for reg in [r15, r14, r13, r12, r11, r10, r9, r8, rdi, rsi, rbp, rbx, rdx, rcx, rax] {
        asm.pop(reg).map_err(|_| SyringeError::Unknown)?;
    }

    asm.mov(rax, original_rip).map_err(|_| SyringeError::Unknown)?;
    asm.jmp(rax).map_err(|_| SyringeError::Unknown)?;

    let code = assemble_at(&mut asm, 0x1234_5678)?;
    debug_assert_eq!(
        code,
        assemble_at(&mut asm, 0x1111_2222)?,
        "thread-hijack resume stub is not location independent"
    );
    Ok(code)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dll_main_caller_x64_is_nonempty_and_ret_terminated() {
        let code = build_dll_main_caller_x64(0x1000_0000, 0x1000_1000).unwrap();
        assert!(!code.is_empty());
        assert_eq!(*code.last().unwrap(), 0xC3); // `ret`
    }

    #[test]
    fn dll_main_caller_x86_is_nonempty_and_ret_terminated() {
        let code = build_dll_main_caller_x86(0x0040_0000, 0x0040_1000).unwrap();
        assert!(!code.is_empty());
        assert_eq!(*code.last().unwrap(), 0xC3);
    }

    #[test]
    fn thread_hijack_resume_pushes_and_pops_are_balanced() {
        let code =
            build_thread_hijack_resume_x64(0x7FFE_0000, 0x0020_0000, 0x0000_7FF6_1234_5678)
                .unwrap();
        let push_count = code.iter().filter(|&&b| (0x50..=0x57).contains(&b)).count();
        let pop_count = code.iter().filter(|&&b| (0x58..=0x5F).contains(&b)).count();
        assert!(push_count >= 8);
        assert!(pop_count >= 8);
    }
}
