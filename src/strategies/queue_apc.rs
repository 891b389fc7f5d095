//! S3: `QueueUserAPC` against every thread of the target process, targeting
//! `kernel32!LoadLibraryW`.
//!
//! Unlike S1/S2, this strategy does not synchronise on the load completing: an APC only runs once
//! its owning thread enters an alertable wait, which may never happen for a given thread. Success
//! here means at least one APC was *queued*, not that the module finished loading.

use std::{mem, path::Path};

use widestring::U16CString;
use winapi::{
    shared::minwindef::HMODULE,
    um::{
        handleapi::{CloseHandle, INVALID_HANDLE_VALUE},
        libloaderapi::{GetModuleHandleW, GetProcAddress},
        processthreadsapi::{OpenThread, QueueUserAPC},
        tlhelp32::{CreateToolhelp32Snapshot, Thread32First, Thread32Next, TH32CS_SNAPTHREAD, THREADENTRY32},
        winnt::THREAD_SET_CONTEXT,
    },
};

use crate::{
    error::{OsErrorContext, SyringeError, Win32Error},
    process_ref::ProcessRef,
    strategies::{check_arch_support, InjectionMethod, InjectionOutcome, ProgressSink, StrategyKind},
    utils::ForeignProcessWideString,
};

fn local_load_library_w() -> Result<unsafe extern "system" fn(*mut u32) -> usize, SyringeError> {
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

/// Enumerates the thread ids currently owned by `pid` via a Toolhelp32 snapshot.
fn enumerate_thread_ids(pid: u32) -> Result<Vec<u32>, SyringeError> {
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

    let mut tids = Vec::new();
    let mut ok = unsafe { Thread32First(snapshot, &mut entry) };
    while ok != 0 {
        if entry.th32OwnerProcessID == pid {
            tids.push(entry.th32ThreadID);
        }
        ok = unsafe { Thread32Next(snapshot, &mut entry) };
    }
    Ok(tids)
}

pub struct QueueApc;

impl InjectionMethod for QueueApc {
    fn name(&self) -> &'static str {
        "queue_apc"
    }

    fn description(&self) -> &'static str {
        "QueueUserAPC against every thread, targeting kernel32!LoadLibraryW"
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

        let tids = enumerate_thread_ids(process.pid())?;
        if tids.is_empty() {
            return Err(SyringeError::ProcessInaccessible);
        }

        let mut queued = 0u32;
        for tid in tids {
            let thread_handle = unsafe { OpenThread(THREAD_SET_CONTEXT, 0, tid) };
            if thread_handle.is_null() {
                continue;
            }
            let _guard = dispose::defer(|| unsafe {
                CloseHandle(thread_handle);
            });
            let result = unsafe {
                QueueUserAPC(
                    Some(mem::transmute(load_library_w)),
                    thread_handle,
                    remote_path.as_mut_ptr() as usize,
                )
            };
            if result != 0 {
                queued += 1;
            }
        }
        sink.on_checkpoint("apcs_queued");

        if queued == 0 {
            return Err(SyringeError::from_os_error(
                OsErrorContext::Process,
                Win32Error::new(),
            ));
        }

        // We cannot own the allocation past this call: it may be read by an APC at an
        // arbitrary future time, so it must outlive this function rather than be freed on drop.
        std::mem::forget(remote_path);

        Ok(InjectionOutcome {
            remote_module: None,
            base_address: 0,
            mapped_size: 0,
            strategy_used: StrategyKind::QueueApc,
        })
    }

    fn eject(
        &self,
        process: ProcessRef<'_>,
        module: HMODULE,
    ) -> Result<InjectionOutcome, SyringeError> {
        // This strategy never observes a module handle itself (an APC only runs once its thread
        // reaches an alertable wait, so `inject` cannot synchronise on completion), but per the
        // spec it still reuses the classic-thread `FreeLibrary`-on-a-remote-thread recipe once a
        // caller has resolved a handle some other way (e.g. a subsequent loader-table lookup).
        let outcome = crate::strategies::method(StrategyKind::ClassicThread).eject(process, module)?;
        Ok(InjectionOutcome {
            strategy_used: StrategyKind::QueueApc,
            ..outcome
        })
    }
}
