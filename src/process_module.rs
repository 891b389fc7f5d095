//! A single loaded module inside a process, as seen through a Toolhelp32 snapshot or a local
//! `GetModuleHandle` lookup.

use std::{ffi::CString, path::PathBuf};

use widestring::U16CStr;
use winapi::{
    shared::minwindef::{FARPROC, HMODULE},
    um::{
        libloaderapi::{GetModuleHandleW, GetProcAddress},
        tlhelp32::MODULEENTRY32W,
    },
};

use crate::{error::SyringeError, process_ref::ProcessRef};

/// A module loaded into some process, identified by its base address ("module handle").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessModule<'a> {
    handle: HMODULE,
    process: ProcessRef<'a>,
    name: [u16; 260],
    name_len: usize,
}

unsafe impl Send for ProcessModule<'_> {}
unsafe impl Sync for ProcessModule<'_> {}

impl<'a> ProcessModule<'a> {
    pub(crate) fn from_entry(process: ProcessRef<'a>, entry: &MODULEENTRY32W) -> Self {
        let len = entry
            .szModule
            .iter()
            .position(|&c| c == 0)
            .unwrap_or(entry.szModule.len());
        let mut name = [0u16; 260];
        name[..len].copy_from_slice(&entry.szModule[..len]);
        Self {
            handle: entry.hModule,
            process,
            name,
            name_len: len,
        }
    }

    pub(crate) fn from_handle(process: ProcessRef<'a>, handle: HMODULE, name: &str) -> Self {
        let wide: Vec<u16> = name.encode_utf16().collect();
        let len = wide.len().min(259);
        let mut buf = [0u16; 260];
        buf[..len].copy_from_slice(&wide[..len]);
        Self {
            handle,
            process,
            name: buf,
            name_len: len,
        }
    }

    /// The module's base address, a.k.a. its "module handle".
    pub fn handle(&self) -> HMODULE {
        self.handle
    }

    /// The process this module is loaded into.
    pub fn process(&self) -> ProcessRef<'a> {
        self.process
    }

    /// The module's base file name (e.g. `"kernel32.dll"`), without the directory part.
    pub fn name(&self) -> String {
        widestring::U16Str::from_slice(&self.name[..self.name_len]).to_string_lossy()
    }

    /// The module's full on-disk path, as reported by the OS for the owning process.
    pub fn path(&self) -> Result<PathBuf, SyringeError> {
        self.process.module_path(self.handle)
    }

    /// Looks up an exported function's address in this module, *as loaded in the current
    /// process*.
    ///
    /// # Safety note
    /// This only returns a meaningful address when `self.process()` and the current process
    /// have loaded the named module at a comparable layout (true for the same system DLL loaded
    /// at its usual base in both). See the manual mapper's import-resolution documentation for
    /// the limitation this implies.
    pub(crate) fn __get_procedure(&self, name: &std::ffi::CStr) -> Option<FARPROC> {
        let proc = unsafe { GetProcAddress(self.handle, name.as_ptr()) };
        if proc.is_null() {
            None
        } else {
            Some(proc)
        }
    }

    /// Resolves a module by name or absolute path in the *current* (local) process, without
    /// touching any foreign process. Used to compute export offsets for the classic-thread
    /// strategy's `InjectHelpData`.
    pub(crate) fn __get_local_from_name_or_abs_path(
        name: &U16CStr,
    ) -> Result<Option<LocalModule>, SyringeError> {
        let handle = unsafe { GetModuleHandleW(name.as_ptr()) };
        if handle.is_null() {
            Ok(None)
        } else {
            Ok(Some(LocalModule { handle }))
        }
    }
}

/// A module loaded in the *current* process, used only to resolve export offsets locally.
#[derive(Debug, Clone, Copy)]
pub(crate) struct LocalModule {
    handle: HMODULE,
}

impl LocalModule {
    pub fn handle(&self) -> HMODULE {
        self.handle
    }

    pub fn __get_procedure(&self, name: &std::ffi::CStr) -> Option<FARPROC> {
        let proc = unsafe { GetProcAddress(self.handle, name.as_ptr()) };
        if proc.is_null() {
            None
        } else {
            Some(proc)
        }
    }
}

#[allow(dead_code)]
fn _assert_cstring_usable(s: &str) -> CString {
    CString::new(s).expect("module or function name must not contain an embedded NUL")
}
