//! A borrowed view of a process handle, used by the rest of the crate so that components never
//! need to take ownership of (and worry about closing) a process handle themselves.

use std::{marker::PhantomData, mem, path::PathBuf, ptr};

use winapi::{
    shared::minwindef::{DWORD, FALSE, HMODULE, LPVOID},
    um::{
        handleapi::INVALID_HANDLE_VALUE,
        minwinbase::STILL_ACTIVE,
        processthreadsapi::{GetExitCodeProcess, GetExitCodeThread, GetProcessId, TerminateProcess},
        psapi::{EnumProcessModulesEx, GetModuleFileNameExW, LIST_MODULES_ALL},
        synchapi::WaitForSingleObject,
        tlhelp32::{
            CreateToolhelp32Snapshot, Module32FirstW, Module32NextW, MODULEENTRY32W,
            TH32CS_SNAPMODULE, TH32CS_SNAPMODULE32,
        },
        winbase::{INFINITE, WAIT_FAILED},
        winnt::HANDLE,
        wow64apiset::IsWow64Process,
    },
};

use crate::{
    error::{OsErrorContext, SyringeError, Win32Error},
    process_module::ProcessModule,
};

/// A borrowed handle to a process, with no ownership over the handle's lifetime.
///
/// Every component that needs to talk to a foreign process takes a `ProcessRef<'a>` rather than
/// a raw `HANDLE` or an owned [`crate::Process`], so the borrow checker ties the validity of any
/// derived allocation or remote pointer to the lifetime of the process that owns the handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessRef<'a> {
    handle: HANDLE,
    phantom: PhantomData<&'a ()>,
}

unsafe impl Send for ProcessRef<'_> {}
unsafe impl Sync for ProcessRef<'_> {}

impl<'a> ProcessRef<'a> {
    pub(crate) fn from_handle(handle: HANDLE) -> Self {
        Self {
            handle,
            phantom: PhantomData,
        }
    }

    /// The underlying Win32 handle. Valid only for the lifetime `'a`.
    pub fn handle(&self) -> HANDLE {
        self.handle
    }

    /// The process id behind this handle.
    pub fn pid(&self) -> u32 {
        unsafe { GetProcessId(self.handle) }
    }

    /// Whether this process is running under WoW64 (i.e. is a 32-bit process on a 64-bit OS).
    pub fn is_wow64(&self) -> Result<bool, SyringeError> {
        let mut is_wow64 = FALSE;
        let result = unsafe { IsWow64Process(self.handle, &mut is_wow64) };
        if result == 0 {
            return Err(SyringeError::from_os_error(
                OsErrorContext::Process,
                Win32Error::new(),
            ));
        }
        Ok(is_wow64 != FALSE)
    }

    /// Whether this process's bitness matches the current (32-bit) build.
    ///
    /// On a 64-bit build, a process is 64-bit iff it is *not* running under WoW64. On a 32-bit
    /// build every process this build can open a full-access handle to is effectively 32-bit
    /// from this process's point of view, but `IsWow64Process` itself still reports correctly
    /// for the *target*, so this resolves the target's real bitness rather than the "always
    /// false" stub the system this was ported from used on 32-bit builds.
    #[cfg(target_pointer_width = "64")]
    pub fn is_x86(&self) -> Result<bool, SyringeError> {
        self.is_wow64()
    }

    #[cfg(target_pointer_width = "32")]
    pub fn is_x86(&self) -> Result<bool, SyringeError> {
        // A 32-bit build can only ever open non-WoW64 (i.e. also 32-bit) or WoW64 processes;
        // either way the target is 32-bit from here.
        Ok(true)
    }

    /// Runs `start_routine(parameter)` on a new thread in this process and waits for it to
    /// finish, returning its exit code.
    pub(crate) fn run_remote_thread(
        &self,
        start_routine: unsafe extern "system" fn(LPVOID) -> DWORD,
        parameter: LPVOID,
    ) -> Result<DWORD, SyringeError> {
        use winapi::um::processthreadsapi::CreateRemoteThread;

        let thread_handle = unsafe {
            CreateRemoteThread(
                self.handle,
                ptr::null_mut(),
                0,
                Some(start_routine),
                parameter,
                0,
                ptr::null_mut(),
            )
        };
        if thread_handle.is_null() {
            return Err(SyringeError::ThreadCreationFailed(Win32Error::new()));
        }
        let _guard = dispose::defer(|| unsafe {
            winapi::um::handleapi::CloseHandle(thread_handle);
        });

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
        assert_ne!(exit_code, STILL_ACTIVE as DWORD);
        Ok(exit_code)
    }

    /// Enumerates the modules currently loaded in this process via Toolhelp32.
    pub fn modules(&self) -> Result<Vec<ProcessModule<'a>>, SyringeError> {
        let snapshot = unsafe {
            CreateToolhelp32Snapshot(TH32CS_SNAPMODULE | TH32CS_SNAPMODULE32, self.pid())
        };
        if snapshot == INVALID_HANDLE_VALUE {
            return Err(SyringeError::from_os_error(
                OsErrorContext::Process,
                Win32Error::new(),
            ));
        }
        let _guard = dispose::defer(|| unsafe {
            winapi::um::handleapi::CloseHandle(snapshot);
        });

        let mut entry: MODULEENTRY32W = unsafe { mem::zeroed() };
        entry.dwSize = mem::size_of::<MODULEENTRY32W>() as u32;

        let mut modules = Vec::new();
        let mut ok = unsafe { Module32FirstW(snapshot, &mut entry) };
        while ok != 0 {
            modules.push(ProcessModule::from_entry(*self, &entry));
            ok = unsafe { Module32NextW(snapshot, &mut entry) };
        }
        Ok(modules)
    }

    /// Finds a loaded module by case-insensitive base name.
    pub fn find_module_by_name(
        &self,
        name: &str,
    ) -> Result<Option<ProcessModule<'a>>, SyringeError> {
        let folded = crate::utils::fold_name(name);
        Ok(self
            .modules()?
            .into_iter()
            .find(|m| crate::utils::fold_name(&m.name()) == folded))
    }

    /// Finds a loaded module by its full on-disk path.
    pub fn find_module_by_path(
        &self,
        path: &std::path::Path,
    ) -> Result<Option<ProcessModule<'a>>, SyringeError> {
        Ok(self
            .modules()?
            .into_iter()
            .find(|m| m.path().ok().as_deref() == Some(path)))
    }

    /// Returns the raw module handles currently loaded in this process.
    pub fn get_module_handles(&self) -> Result<Vec<HMODULE>, SyringeError> {
        let mut needed: u32 = 0;
        let mut buf: Vec<HMODULE> = vec![ptr::null_mut(); 256];
        let ok = unsafe {
            EnumProcessModulesEx(
                self.handle,
                buf.as_mut_ptr(),
                (buf.len() * mem::size_of::<HMODULE>()) as u32,
                &mut needed,
                LIST_MODULES_ALL,
            )
        };
        if ok == 0 {
            return Err(SyringeError::from_os_error(
                OsErrorContext::Process,
                Win32Error::new(),
            ));
        }
        let count = needed as usize / mem::size_of::<HMODULE>();
        buf.truncate(count.min(buf.len()));
        Ok(buf)
    }

    pub(crate) fn module_path(&self, handle: HMODULE) -> Result<PathBuf, SyringeError> {
        let mut buf = [0u16; 1024];
        let len =
            unsafe { GetModuleFileNameExW(self.handle, handle, buf.as_mut_ptr(), buf.len() as u32) };
        if len == 0 {
            return Err(SyringeError::from_os_error(
                OsErrorContext::Process,
                Win32Error::new(),
            ));
        }
        Ok(PathBuf::from(widestring::U16Str::from_slice(&buf[..len as usize]).to_os_string()))
    }

    /// Whether the process is still running, i.e. its handle is still valid and its exit code
    /// is `STILL_ACTIVE`. Used up front by strategies so a process that has already exited is
    /// reported as [`SyringeError::ProcessInaccessible`] rather than failing deeper inside an
    /// allocation or thread-creation call with a less specific error.
    pub(crate) fn is_alive(&self) -> bool {
        let mut exit_code: DWORD = 0;
        let ok = unsafe { GetExitCodeProcess(self.handle, &mut exit_code) };
        ok != 0 && exit_code == STILL_ACTIVE as DWORD
    }

    /// Forcefully terminates the process. Used by tests to simulate a crashed target.
    pub fn terminate(&self, exit_code: u32) -> Result<(), SyringeError> {
        let ok = unsafe { TerminateProcess(self.handle, exit_code) };
        if ok == 0 {
            return Err(SyringeError::from_os_error(
                OsErrorContext::Process,
                Win32Error::new(),
            ));
        }
        Ok(())
    }
}
