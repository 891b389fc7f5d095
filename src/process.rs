//! Process enumeration, classification and handle management.

use std::{
    mem,
    path::PathBuf,
    ptr,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
};

use winapi::{
    shared::minwindef::{DWORD, FALSE, MAX_PATH},
    um::{
        handleapi::{CloseHandle, INVALID_HANDLE_VALUE},
        processthreadsapi::{
            GetCurrentProcess, OpenProcess, OpenProcessToken, QueryFullProcessImageNameW,
        },
        securitybaseapi::{AllocateAndInitializeSid, CheckTokenMembership, FreeSid},
        tlhelp32::{
            CreateToolhelp32Snapshot, Process32FirstW, Process32NextW, PROCESSENTRY32W,
            TH32CS_SNAPPROCESS,
        },
        winbase::LookupPrivilegeValueW,
        winnt::{
            AdjustTokenPrivileges, DOMAIN_ALIAS_RID_ADMINS, HANDLE, LUID_AND_ATTRIBUTES,
            PROCESS_QUERY_LIMITED_INFORMATION, SECURITY_BUILTIN_DOMAIN_RID,
            SECURITY_NT_AUTHORITY, SE_DEBUG_NAME, SE_PRIVILEGE_ENABLED, TOKEN_ADJUST_PRIVILEGES,
            TOKEN_PRIVILEGES, TOKEN_QUERY,
        },
    },
};

use crate::{
    error::{OsErrorContext, SyringeError, Win32Error},
    process_ref::ProcessRef,
    utils::fold_name,
};

/// A snapshot of one entry in the process table.
///
/// Constructed during a directory refresh; immutable thereafter and discarded on the next
/// refresh. Identity is the pid within a single refresh cycle only — pids are reused by the OS.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessDescriptor {
    /// The process id.
    pub pid: u32,
    /// The image file name (e.g. `"notepad.exe"`), without the directory part.
    pub name: String,
    /// Best-effort full image path; empty if it could not be resolved.
    pub path: String,
    /// Whether the process is a native 64-bit process.
    pub is_64_bit: bool,
}

/// An owned handle to a process, closed on drop.
///
/// Cheaply [`Clone`]-able: clones share the same underlying handle via reference counting, they
/// do not duplicate it at the OS level.
#[derive(Debug, Clone)]
pub struct Process {
    inner: Arc<OwnedHandle>,
}

#[derive(Debug)]
struct OwnedHandle(HANDLE);

unsafe impl Send for OwnedHandle {}
unsafe impl Sync for OwnedHandle {}

impl Drop for OwnedHandle {
    fn drop(&mut self) {
        unsafe {
            CloseHandle(self.0);
        }
    }
}

impl Process {
    /// Opens a process by pid with the given access mask. The returned handle is owned by the
    /// caller (i.e. by this `Process` value) and closed when the last clone is dropped.
    pub fn open(pid: u32, desired_access: DWORD) -> Result<Self, SyringeError> {
        let handle = unsafe { OpenProcess(desired_access, FALSE, pid) };
        if handle.is_null() {
            return Err(SyringeError::from_os_error(
                OsErrorContext::Process,
                Win32Error::new(),
            ));
        }
        Ok(Self {
            inner: Arc::new(OwnedHandle(handle)),
        })
    }

    /// Finds the first live process whose image file name matches `name` (case-insensitive),
    /// and opens it with a reasonably broad access mask suitable for injection.
    pub fn find_first_by_name(name: &str) -> Result<Option<Self>, SyringeError> {
        let folded = fold_name(name);
        for descriptor in enumerate()? {
            if fold_name(&descriptor.name) == folded {
                return Self::open(descriptor.pid, access::INJECT_ACCESS).map(Some);
            }
        }
        Ok(None)
    }

    /// A borrowed view of this process usable by every other component in the crate.
    pub fn as_ref(&self) -> ProcessRef<'_> {
        ProcessRef::from_handle(self.inner.0)
    }

    /// The process id behind this handle.
    pub fn pid(&self) -> u32 {
        self.as_ref().pid()
    }

    /// Forcefully terminates the process. Primarily useful in tests that need a crashed target.
    pub fn kill(self) -> Result<(), SyringeError> {
        self.as_ref().terminate(1)
    }
}

/// Process-handle access masks this crate asks for, named for their purpose rather than their
/// raw bits (mirrors the rights each C6 strategy actually needs).
pub mod access {
    use winapi::um::winnt::{
        PROCESS_CREATE_THREAD, PROCESS_QUERY_INFORMATION, PROCESS_VM_OPERATION, PROCESS_VM_READ,
        PROCESS_VM_WRITE,
    };

    /// Rights needed to allocate, write and run a remote thread: the common case for every
    /// strategy except thread-hijack (which additionally needs thread-suspend rights).
    pub const INJECT_ACCESS: u32 = PROCESS_CREATE_THREAD
        | PROCESS_QUERY_INFORMATION
        | PROCESS_VM_OPERATION
        | PROCESS_VM_WRITE
        | PROCESS_VM_READ;
}

/// Enumerates the current process table via a Toolhelp32 snapshot.
///
/// Filtering by substring should be done on the returned list rather than during enumeration
/// (matching the ported system's "refresh, then filter" split).
pub fn enumerate() -> Result<Vec<ProcessDescriptor>, SyringeError> {
    let snapshot = unsafe { CreateToolhelp32Snapshot(TH32CS_SNAPPROCESS, 0) };
    if snapshot == INVALID_HANDLE_VALUE {
        return Err(SyringeError::from_os_error(
            OsErrorContext::Process,
            Win32Error::new(),
        ));
    }
    let _guard = dispose::defer(|| unsafe {
        CloseHandle(snapshot);
    });

    let mut entry: PROCESSENTRY32W = unsafe { mem::zeroed() };
    entry.dwSize = mem::size_of::<PROCESSENTRY32W>() as u32;

    let mut processes = Vec::new();
    let mut ok = unsafe { Process32FirstW(snapshot, &mut entry) };
    while ok != 0 {
        if entry.th32ProcessID != 0 {
            processes.push(describe(&entry));
        }
        ok = unsafe { Process32NextW(snapshot, &mut entry) };
    }

    processes.sort_by(|a, b| fold_name(&a.name).cmp(&fold_name(&b.name)));
    Ok(processes)
}

fn describe(entry: &PROCESSENTRY32W) -> ProcessDescriptor {
    let len = entry
        .szExeFile
        .iter()
        .position(|&c| c == 0)
        .unwrap_or(entry.szExeFile.len());
    let name = widestring::U16Str::from_slice(&entry.szExeFile[..len]).to_string_lossy();
    let path = process_path(entry.th32ProcessID).unwrap_or_default();
    let is_64_bit = is_process_64_bit(entry.th32ProcessID).unwrap_or(false);
    ProcessDescriptor {
        pid: entry.th32ProcessID,
        name,
        path,
        is_64_bit,
    }
}

/// Best-effort full image path for a pid, empty string if it cannot be resolved (the process may
/// be protected, already gone, or a system process this user cannot query).
fn process_path(pid: u32) -> Option<String> {
    let handle = unsafe { OpenProcess(PROCESS_QUERY_LIMITED_INFORMATION, FALSE, pid) };
    if handle.is_null() {
        return None;
    }
    let _guard = dispose::defer(|| unsafe {
        CloseHandle(handle);
    });

    let mut buf = [0u16; MAX_PATH];
    let mut size = buf.len() as u32;
    let ok = unsafe { QueryFullProcessImageNameW(handle, 0, buf.as_mut_ptr(), &mut size) };
    if ok == 0 {
        return None;
    }
    Some(widestring::U16Str::from_slice(&buf[..size as usize]).to_string_lossy())
}

/// Classifies a pid as running a native 64-bit image, using a WoW64 probe.
///
/// Unlike the system this was ported from (which hard-codes `false` on 32-bit builds), this
/// resolves correctly in both build flavours: see `SPEC_FULL.md` §9's Open Questions.
pub fn is_process_64_bit(pid: u32) -> Result<bool, SyringeError> {
    let handle = unsafe { OpenProcess(PROCESS_QUERY_LIMITED_INFORMATION, FALSE, pid) };
    if handle.is_null() {
        return Err(SyringeError::from_os_error(
            OsErrorContext::Process,
            Win32Error::new(),
        ));
    }
    let _guard = dispose::defer(|| unsafe {
        CloseHandle(handle);
    });
    ProcessRef::from_handle(handle).is_x86().map(|is_x86| {
        #[cfg(target_pointer_width = "64")]
        {
            !is_x86
        }
        #[cfg(target_pointer_width = "32")]
        {
            let _ = is_x86;
            false
        }
    })
}

/// True for pid 0/4 (System Idle / System) or any process whose image lives under the Windows
/// install directory.
pub fn is_system_process(pid: u32) -> bool {
    if pid == 0 || pid == 4 {
        return true;
    }
    let Some(path) = process_path(pid) else {
        return false;
    };
    let windir = std::env::var("WINDIR").unwrap_or_else(|_| r"C:\Windows".to_string());
    fold_name(&path).starts_with(&fold_name(&windir))
}

/// Whether the current process is running elevated (member of the builtin Administrators group).
pub fn is_running_as_admin() -> bool {
    unsafe {
        let mut authority = SECURITY_NT_AUTHORITY;
        let mut admin_group: HANDLE = ptr::null_mut();
        let allocated = AllocateAndInitializeSid(
            &mut authority,
            2,
            SECURITY_BUILTIN_DOMAIN_RID as u32,
            DOMAIN_ALIAS_RID_ADMINS as u32,
            0,
            0,
            0,
            0,
            0,
            0,
            &mut admin_group as *mut _ as *mut _,
        );
        if allocated == 0 {
            return false;
        }
        let _guard = dispose::defer(|| {
            FreeSid(admin_group);
        });

        let mut is_member = FALSE;
        CheckTokenMembership(ptr::null_mut(), admin_group, &mut is_member);
        is_member != FALSE
    }
}

/// Enables `SeDebugPrivilege` for the current process, required to open handles to processes
/// running at a higher integrity level or in a different session.
pub fn enable_debug_privilege() -> Result<(), SyringeError> {
    let mut token: HANDLE = ptr::null_mut();
    let ok = unsafe {
        OpenProcessToken(
            GetCurrentProcess(),
            TOKEN_ADJUST_PRIVILEGES | TOKEN_QUERY,
            &mut token,
        )
    };
    if ok == 0 {
        return Err(SyringeError::from_os_error(
            OsErrorContext::Process,
            Win32Error::new(),
        ));
    }
    let _guard = dispose::defer(|| unsafe {
        CloseHandle(token);
    });

    let mut luid = unsafe { mem::zeroed() };
    let name: Vec<u16> = SE_DEBUG_NAME.encode_utf16().chain(Some(0)).collect();
    let ok = unsafe { LookupPrivilegeValueW(ptr::null(), name.as_ptr(), &mut luid) };
    if ok == 0 {
        return Err(SyringeError::from_os_error(
            OsErrorContext::Process,
            Win32Error::new(),
        ));
    }

    let privileges = TOKEN_PRIVILEGES {
        PrivilegeCount: 1,
        Privileges: [LUID_AND_ATTRIBUTES {
            Luid: luid,
            Attributes: SE_PRIVILEGE_ENABLED,
        }],
    };
    let ok = unsafe {
        AdjustTokenPrivileges(
            token,
            FALSE,
            &privileges as *const _ as *mut _,
            0,
            ptr::null_mut(),
            ptr::null_mut(),
        )
    };
    if ok == 0 {
        return Err(SyringeError::InsufficientPrivileges(Win32Error::new()));
    }
    Ok(())
}

/// One-in-flight process directory refresh: a second concurrent call returns `Ok(false)`
/// immediately instead of queueing behind the first (matching the ported system's behaviour).
#[derive(Debug, Default)]
pub struct ProcessDirectory {
    refreshing: AtomicBool,
    processes: Mutex<Vec<ProcessDescriptor>>,
}

impl ProcessDirectory {
    /// Creates an empty directory; call [`Self::refresh`] to populate it.
    pub fn new() -> Self {
        Self::default()
    }

    /// Re-enumerates the process table. Returns `Ok(false)` without doing any work if another
    /// refresh is already in progress.
    pub fn refresh(&self) -> Result<bool, SyringeError> {
        if self.refreshing.swap(true, Ordering::SeqCst) {
            return Ok(false);
        }
        let result = enumerate();
        self.refreshing.store(false, Ordering::SeqCst);
        *self.processes.lock().unwrap() = result?;
        Ok(true)
    }

    /// The process list as of the last successful refresh.
    pub fn processes(&self) -> Vec<ProcessDescriptor> {
        self.processes.lock().unwrap().clone()
    }

    /// Case-insensitive substring filter over the last refresh's results.
    pub fn filter_by_name(&self, filter: &str) -> Vec<ProcessDescriptor> {
        if filter.is_empty() {
            return self.processes();
        }
        let folded_filter = fold_name(filter);
        self.processes()
            .into_iter()
            .filter(|p| fold_name(&p.name).contains(&folded_filter))
            .collect()
    }

    /// Looks up a single descriptor by pid from the last refresh's results.
    pub fn find_by_pid(&self, pid: u32) -> Option<ProcessDescriptor> {
        self.processes().into_iter().find(|p| p.pid == pid)
    }
}
