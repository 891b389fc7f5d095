//! S5: suspends an existing thread in the target, redirects it through a small resume stub that
//! calls `LoadLibraryW` and then jumps back to the thread's original instruction pointer.
//!
//! Only implemented for x64 targets: the resume stub ([`crate::shellcode::build_thread_hijack_resume_x64`])
//! only has a 64-bit encoding.

use std::{mem, path::Path};

use widestring::U16CString;
use winapi::{
    shared::minwindef::HMODULE,
    um::{
        handleapi::{CloseHandle, INVALID_HANDLE_VALUE},
        libloaderapi::{GetModuleHandleW, GetProcAddress},
        processthreadsapi::{GetThreadContext, OpenThread, ResumeThread, SetThreadContext, SuspendThread},
        tlhelp32::{CreateToolhelp32Snapshot, Thread32First, Thread32Next, TH32CS_SNAPTHREAD, THREADENTRY32},
        winnt::{CONTEXT, CONTEXT_FULL, THREAD_ALL_ACCESS},
    },
};

use crate::{
    error::{OsErrorContext, SyringeError, Win32Error},
    process_ref::ProcessRef,
    remote_memory::{protection, RemoteAllocation},
    shellcode,
    strategies::{InjectionMethod, InjectionOutcome, ProgressSink, StrategyKind},
};

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

/// Picks an arbitrary thread belonging to `pid` via a Toolhelp32 snapshot.
fn find_suitable_thread(pid: u32) -> Result<u32, SyringeError> {
    let snapshot = unsafe { CreateToolhelp32Snapshot(TH32CS_SNAPTHREAD, 0) };
    if snapshot == INVALID_HANDLE_VALUE {
        return Err(SyringeError::from_os_error(
            OsErrorContext::Process,
            Win32Error::new(),
        ));
    }
    let _guard = dispose::defer(|| unsafe {
        CloseHandle(snapshot);
    });

    let mut entry: THREADENTRY32 = unsafe { mem::zeroed() };
    entry.dwSize = mem::size_of::<THREADENTRY32>() as u32;

    let mut ok = unsafe { Thread32First(snapshot, &mut entry) };
    while ok != 0 {
        if entry.th32OwnerProcessID == pid {
            return Ok(entry.th32ThreadID);
        }
        ok = unsafe { Thread32Next(snapshot, &mut entry) };
    }
    Err(SyringeError::ProcessInaccessible)
}

pub struct ThreadHijack;

impl InjectionMethod for ThreadHijack {
    fn name(&self) -> &'static str {
        "thread_hijack"
    }

    fn description(&self) -> &'static str {
        "suspends a target thread and redirects it through a LoadLibraryW resume stub"
    }

    fn requires_admin(&self) -> bool {
        false
    }

    fn supports_x86(&self) -> bool {
        false
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
        if process.is_x86()? {
            return Err(SyringeError::UnsupportedTarget);
        }

        let tid = find_suitable_thread(process.pid())?;
        let thread_handle = unsafe { OpenThread(THREAD_ALL_ACCESS, 0, tid) };
        if thread_handle.is_null() {
            return Err(SyringeError::from_os_error(
                OsErrorContext::Process,
                Win32Error::new(),
            ));
        }
        let _thread_guard = dispose::defer(|| unsafe {
            CloseHandle(thread_handle);
        });
        sink.on_checkpoint("thread_opened");

        let suspend_count = unsafe { SuspendThread(thread_handle) };
        if suspend_count == u32::MAX {
            return Err(SyringeError::from_os_error(
                OsErrorContext::Process,
                Win32Error::new(),
            ));
        }
        sink.on_checkpoint("thread_suspended");

        let mut ctx: CONTEXT = unsafe { mem::zeroed() };
        ctx.ContextFlags = CONTEXT_FULL;
        let ok = unsafe { GetThreadContext(thread_handle, &mut ctx) };
        if ok == 0 {
            unsafe { ResumeThread(thread_handle) };
            return Err(SyringeError::from_os_error(
                OsErrorContext::Process,
                Win32Error::new(),
            ));
        }
        let original_rip = ctx.Rip;
        sink.on_checkpoint("context_saved");

        let path_string = U16CString::from_os_str(dll_path)?;
        let path_bytes: &[u8] = unsafe {
            std::slice::from_raw_parts(
                path_string.as_ptr().cast::<u8>(),
                (path_string.len() + 1) * 2,
            )
        };
        let path_alloc = RemoteAllocation::alloc_rw(process, path_bytes.len())?;
        path_alloc.write(0, path_bytes)?;
        let path_ptr = path_alloc.as_raw_ptr() as u64;

        let load_library_w = local_load_library_w()?;
        let stub = shellcode::build_thread_hijack_resume_x64(load_library_w, path_ptr, original_rip)?;

        let stub_alloc = RemoteAllocation::alloc_with_protection(
            process,
            stub.len(),
            protection::PAGE_EXECUTE_READWRITE,
        )?;
        stub_alloc.write(0, &stub)?;
        let stub_ptr = stub_alloc.as_raw_ptr() as u64;
        sink.on_checkpoint("stub_written");

        ctx.Rip = stub_ptr;
        let ok = unsafe { SetThreadContext(thread_handle, &ctx) };
        if ok == 0 {
            unsafe { ResumeThread(thread_handle) };
            return Err(SyringeError::from_os_error(
                OsErrorContext::Process,
                Win32Error::new(),
            ));
        }

        let resume = unsafe { ResumeThread(thread_handle) };
        if resume == u32::MAX {
            return Err(SyringeError::from_os_error(
                OsErrorContext::Process,
                Win32Error::new(),
            ));
        }
        sink.on_checkpoint("thread_resumed");

        // Ownership of both allocations now belongs to the hijacked thread until the stub jumps
        // back to `original_rip`; they are deliberately not freed here.
        let _ = path_alloc.release();
        let _ = stub_alloc.release();

        Ok(InjectionOutcome {
            remote_module: None,
            base_address: 0,
            mapped_size: 0,
            strategy_used: StrategyKind::ThreadHijack,
        })
    }

    fn eject(
        &self,
        process: ProcessRef<'_>,
        module: HMODULE,
    ) -> Result<InjectionOutcome, SyringeError> {
        // This strategy never observes a module handle itself (it doesn't synchronise on the
        // hijacked thread's `LoadLibraryW` call completing), but a caller who later resolved one
        // independently (e.g. via the loader table) can still ask to unload it. Per the spec,
        // ejection for S5 reuses the same `FreeLibrary`-on-a-remote-thread recipe as S1/S2.
        let outcome = crate::strategies::method(StrategyKind::ClassicThread).eject(process, module)?;
        Ok(InjectionOutcome {
            strategy_used: StrategyKind::ThreadHijack,
            ..outcome
        })
    }
}
