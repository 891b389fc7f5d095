//! S2: `NtCreateThreadEx` targeting `kernel32!LoadLibraryW`, bypassing the more heavily monitored
//! `CreateRemoteThread` entry point.

use std::{ffi::c_void, mem, path::Path, ptr};

use widestring::U16CString;
use winapi::{
    shared::{minwindef::HMODULE, ntdef::NTSTATUS},
    um::{
        handleapi::CloseHandle,
        libloaderapi::{GetModuleHandleW, GetProcAddress},
        minwinbase::STILL_ACTIVE,
        processthreadsapi::GetExitCodeThread,
        synchapi::WaitForSingleObject,
        winbase::{INFINITE, WAIT_FAILED},
        winnt::HANDLE,
    },
};

use crate::{
    error::{OsErrorContext, SyringeError, Win32Error},
    process_ref::ProcessRef,
    strategies::{check_arch_support, InjectionMethod, InjectionOutcome, ProgressSink, StrategyKind},
    utils::ForeignProcessWideString,
};

// `NtCreateThreadEx` has no `winapi` 0.3 binding; declared here the same way
// `loader.rs` declares `NtQueryInformationProcess`.
extern "system" {
    fn NtCreateThreadEx(
        thread_handle: *mut HANDLE,
        desired_access: u32,
        object_attributes: *mut c_void,
        process_handle: HANDLE,
        start_routine: *mut c_void,
        argument: *mut c_void,
        create_flags: u32,
        zero_bits: usize,
        stack_size: usize,
        maximum_stack_size: usize,
        attribute_list: *mut c_void,
    ) -> NTSTATUS;
}

const THREAD_ALL_ACCESS: u32 = 0x001F_FFFF;

fn local_load_library_w() -> Result<u64, SyringeError> {
    let module_name = U16CString::from_str("kernel32.dll").unwrap();
    let handle = unsafe { GetModuleHandleW(module_name.as_ptr()) };
    if handle.is_null() {
        return Err(SyringeError::ModuleNotFound);
    }
    let proc = unsafe { GetProcAddress(handle, c"LoadLibraryW".as_ptr().cast()) };
    if proc.is_null() {
        return Err(SyringeError::ModuleNotFound);
    }
    Ok(proc as u64)
}

pub struct NativeThread;

impl InjectionMethod for NativeThread {
    fn name(&self) -> &'static str {
        "native_thread"
    }

    fn description(&self) -> &'static str {
        "NtCreateThreadEx targeting kernel32!LoadLibraryW"
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

        let start_routine = local_load_library_w()?;
        sink.on_checkpoint("resolved_loadlibraryw");

        let mut thread_handle: HANDLE = ptr::null_mut();
        let status = unsafe {
            NtCreateThreadEx(
                &mut thread_handle,
                THREAD_ALL_ACCESS,
                ptr::null_mut(),
                process.handle(),
                start_routine as *mut c_void,
                remote_path.as_mut_ptr(),
                0,
                0,
                0,
                0,
                ptr::null_mut(),
            )
        };
        if status != 0 || thread_handle.is_null() {
            return Err(SyringeError::ThreadCreationFailed(Win32Error::from_code(
                status as u32,
            )));
        }
        let _guard = dispose::defer(|| unsafe {
            CloseHandle(thread_handle);
        });
        sink.on_checkpoint("thread_created");

        let wait = unsafe { WaitForSingleObject(thread_handle, INFINITE) };
        if wait == WAIT_FAILED {
            return Err(SyringeError::from_os_error(
                OsErrorContext::Process,
                Win32Error::new(),
            ));
        }

        let mut exit_code = mem::MaybeUninit::uninit();
        let ok = unsafe { GetExitCodeThread(thread_handle, exit_code.as_mut_ptr()) };
        if ok == 0 {
            return Err(SyringeError::from_os_error(
                OsErrorContext::Process,
                Win32Error::new(),
            ));
        }
        let exit_code = unsafe { exit_code.assume_init() };
        assert_ne!(exit_code, STILL_ACTIVE as u32);
        sink.on_checkpoint("thread_joined");

        if exit_code == 0 {
            return Err(SyringeError::ModuleLoadFailed);
        }

        Ok(InjectionOutcome {
            remote_module: Some(exit_code as HMODULE),
            base_address: exit_code as u64,
            mapped_size: 0,
            strategy_used: StrategyKind::NativeThread,
        })
    }

    fn eject(
        &self,
        process: ProcessRef<'_>,
        module: HMODULE,
    ) -> Result<InjectionOutcome, SyringeError> {
        // `FreeLibrary` ejection goes through the same classic-thread primitive; native thread
        // creation buys covertness only for the load, not the unload.
        crate::strategies::method(StrategyKind::ClassicThread).eject(process, module)
    }
}
