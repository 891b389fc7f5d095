//! S1: the classic `CreateRemoteThread` + `LoadLibraryW` strategy.

use std::path::Path;

use widestring::U16CString;
use winapi::{
    shared::minwindef::HMODULE,
    um::libloaderapi::{GetModuleHandleW, GetProcAddress},
};

use crate::{
    error::SyringeError,
    process_ref::ProcessRef,
    strategies::{check_arch_support, InjectionMethod, InjectionOutcome, ProgressSink, StrategyKind},
    utils::ForeignProcessWideString,
};

/// Resolves the current process's own `kernel32!LoadLibraryW` address.
///
/// # Limitation (kept intentionally, see `SPEC_FULL.md` §9)
/// This is the **local** address, used as-is as the remote start routine. It is correct whenever
/// `kernel32.dll` loads at the same base in both processes, which holds for same-bitness
/// processes under ASLR in the overwhelming majority of real-world cases but is not a guarantee.
/// A caller that needs a strategy without this assumption should use S2 or S4.
fn local_load_library_w() -> Result<unsafe extern "system" fn(*mut u16) -> u32, SyringeError> {
    let module_name = U16CString::from_str("kernel32.dll").unwrap();
    let handle = unsafe { GetModuleHandleW(module_name.as_ptr()) };
    if handle.is_null() {
        return Err(SyringeError::ModuleNotFound);
    }
    let proc = unsafe { GetProcAddress(handle, c"LoadLibraryW".as_ptr().cast()) };
    if proc.is_null() {
        return Err(SyringeError::ModuleNotFound);
    }
    Ok(unsafe { std::mem::transmute(proc) })
}

pub struct ClassicThread;

impl InjectionMethod for ClassicThread {
    fn name(&self) -> &'static str {
        "classic_thread"
    }

    fn description(&self) -> &'static str {
        "CreateRemoteThread targeting kernel32!LoadLibraryW"
    }

    fn requires_admin(&self) -> bool {
        false
    }

    fn supports_x86(&self) -> bool {
        true
    }

    fn supports_x64(&self) -> bool {
        true
    }

    fn inject(
        &self,
        process: ProcessRef<'_>,
        dll_path: &Path,
        sink: &dyn ProgressSink,
    ) -> Result<InjectionOutcome, SyringeError> {
        check_arch_support(self, process)?;

        let path_string = U16CString::from_os_str(dll_path)?;
        let mut remote_path = ForeignProcessWideString::allocate_in_process(process, path_string)?;
        sink.on_checkpoint("allocated");

        let load_library_w = local_load_library_w()?;
        sink.on_checkpoint("resolved_loadlibraryw");

        let exit_code = process.run_remote_thread(
            unsafe { std::mem::transmute(load_library_w) },
            remote_path.as_mut_ptr(),
        )?;
        sink.on_checkpoint("thread_joined");

        if exit_code == 0 {
            return Err(SyringeError::ModuleLoadFailed);
        }

        Ok(InjectionOutcome {
            remote_module: Some(exit_code as HMODULE),
            base_address: exit_code as u64,
            mapped_size: 0,
            strategy_used: StrategyKind::ClassicThread,
        })
    }

    fn eject(
        &self,
        process: ProcessRef<'_>,
        module: HMODULE,
    ) -> Result<InjectionOutcome, SyringeError> {
        let free_library = unsafe {
            let handle = GetModuleHandleW(U16CString::from_str("kernel32.dll").unwrap().as_ptr());
            GetProcAddress(handle, c"FreeLibrary".as_ptr().cast())
        };
        if free_library.is_null() {
            return Err(SyringeError::ModuleNotFound);
        }
        let start_routine: unsafe extern "system" fn(*mut std::ffi::c_void) -> u32 =
            unsafe { std::mem::transmute(free_library) };
        let exit_code = process.run_remote_thread(start_routine, module.cast())?;
        if exit_code == 0 {
            return Err(SyringeError::RemoteOperationFailed);
        }
        Ok(InjectionOutcome {
            remote_module: None,
            base_address: module as u64,
            mapped_size: 0,
            strategy_used: StrategyKind::ClassicThread,
        })
    }
}
