//! Error types used throughout this crate.

use std::{fmt, io};

use winapi::{
    shared::{
        minwindef::DWORD,
        winerror::{
            ERROR_ACCESS_DENIED, ERROR_BAD_EXE_FORMAT, ERROR_FILE_NOT_FOUND,
            ERROR_INVALID_HANDLE, ERROR_MOD_NOT_FOUND, ERROR_NOT_ENOUGH_MEMORY,
            ERROR_OUTOFMEMORY, ERROR_PATH_NOT_FOUND, ERROR_PRIVILEGE_NOT_HELD,
            ERROR_WRITE_FAULT,
        },
    },
    um::errhandlingapi::GetLastError,
};

/// A captured `GetLastError()` code, with a human-readable rendering.
///
/// This unifies the two OS-error wrapper shapes this crate's lineage used to carry side by
/// side; everything downstream now deals in exactly one error-wrapper type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Win32Error {
    code: DWORD,
}

impl Win32Error {
    /// Captures the calling thread's current `GetLastError()` value.
    pub fn new() -> Self {
        Self {
            code: unsafe { GetLastError() },
        }
    }

    /// Wraps an already-known error code without consulting `GetLastError()`.
    pub const fn from_code(code: DWORD) -> Self {
        Self { code }
    }

    /// The raw Win32 error code.
    pub const fn code(&self) -> DWORD {
        self.code
    }
}

impl Default for Win32Error {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for Win32Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // A full FormatMessageW round trip is avoided here deliberately: it requires a
        // scratch buffer and locale handling that add nothing a test or log line needs.
        write!(f, "os error {}", self.code)
    }
}

impl std::error::Error for Win32Error {}

impl From<Win32Error> for io::Error {
    fn from(err: Win32Error) -> Self {
        io::Error::from_raw_os_error(err.code() as i32)
    }
}

/// The closed error taxonomy produced by this crate's components.
///
/// Source names are retained for continuity with the system this was ported from; the variant
/// set is intentionally small and flat rather than nested per-component.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum SyringeError {
    /// An argument was invalid for the requested operation.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The DLL path did not exist or could not be read.
    #[error("file not found or unreadable")]
    FileNotFound,

    /// The OS denied read/write access to the DLL file.
    #[error("file access denied")]
    FileAccessDenied,

    /// The DLL file's headers are not a well-formed PE image.
    #[error("invalid PE file format")]
    InvalidFileFormat,

    /// The DLL's machine type does not match the target process's bitness.
    #[error("DLL architecture does not match the target process")]
    DllArchMismatch,

    /// The target process could not be found.
    #[error("target process not found")]
    ProcessNotFound,

    /// The OS denied the requested access to the target process.
    #[error("target process access denied")]
    ProcessAccessDenied,

    /// The target process exited during the operation.
    #[error("target process is not accessible (likely terminated)")]
    ProcessInaccessible,

    /// A remote memory allocation failed.
    #[error("remote memory allocation failed: {0}")]
    MemoryAllocationFailed(Win32Error),

    /// A remote memory write failed.
    #[error("remote memory write failed: {0}")]
    MemoryWriteFailed(Win32Error),

    /// Remote thread creation failed.
    #[error("remote thread creation failed: {0}")]
    ThreadCreationFailed(Win32Error),

    /// The module failed to load in the target (zero exit code from `LoadLibraryW`).
    #[error("module failed to load in target process")]
    ModuleLoadFailed,

    /// A named module could not be found in the target's loader table.
    #[error("module not found in target process")]
    ModuleNotFound,

    /// The calling process lacks the privileges the operation requires.
    #[error("insufficient privileges: {0}")]
    InsufficientPrivileges(Win32Error),

    /// The requested strategy does not support the target's architecture.
    #[error("injection strategy does not support the target architecture")]
    UnsupportedTarget,

    /// A remote operation completed but reported failure (non-zero `NTSTATUS`/zero `BOOL`).
    #[error("remote operation failed")]
    RemoteOperationFailed,

    /// An I/O-flavoured failure, typically surfaced while resolving or validating paths.
    #[error("remote io error: {0}")]
    RemoteIo(#[source] io::Error),

    /// Wraps a bare OS error for operations without a more specific taxonomy entry.
    #[error("operating system error: {0}")]
    Os(#[from] Win32Error),

    /// Any other unclassified failure.
    #[error("unknown error")]
    Unknown,
}

impl SyringeError {
    /// Maps a captured OS error code onto this crate's taxonomy, following the same table the
    /// ported system used (`ERROR_ACCESS_DENIED -> ProcessAccessDenied`, and so on).
    pub fn from_os_error(context: OsErrorContext, err: Win32Error) -> Self {
        match (context, err.code()) {
            (OsErrorContext::Process, ERROR_ACCESS_DENIED) => Self::ProcessAccessDenied,
            (OsErrorContext::Process, ERROR_INVALID_HANDLE) => Self::ProcessNotFound,
            (OsErrorContext::File, ERROR_FILE_NOT_FOUND) | (OsErrorContext::File, ERROR_PATH_NOT_FOUND) => {
                Self::FileNotFound
            }
            (OsErrorContext::File, ERROR_ACCESS_DENIED) => Self::FileAccessDenied,
            (OsErrorContext::Dll, ERROR_BAD_EXE_FORMAT) => Self::DllArchMismatch,
            (OsErrorContext::Module, ERROR_MOD_NOT_FOUND) => Self::ModuleNotFound,
            (OsErrorContext::Memory, ERROR_NOT_ENOUGH_MEMORY) | (OsErrorContext::Memory, ERROR_OUTOFMEMORY) => {
                Self::MemoryAllocationFailed(err)
            }
            (OsErrorContext::Memory, ERROR_WRITE_FAULT) => Self::MemoryWriteFailed(err),
            (_, ERROR_PRIVILEGE_NOT_HELD) => Self::InsufficientPrivileges(err),
            _ => Self::Os(err),
        }
    }
}

/// Which subsystem an OS error occurred in, used to disambiguate the taxonomy mapping above
/// (the same numeric code means something different depending on where it was observed).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OsErrorContext {
    /// A process handle / enumeration operation.
    Process,
    /// A file-system operation against the DLL path.
    File,
    /// PE/DLL validation.
    Dll,
    /// Module lookup in a loader table.
    Module,
    /// A remote memory operation.
    Memory,
}

impl From<widestring::error::ContainsNul<u16>> for SyringeError {
    fn from(_: widestring::error::ContainsNul<u16>) -> Self {
        Self::InvalidArgument("path contains an embedded NUL".into())
    }
}

impl From<io::Error> for SyringeError {
    fn from(err: io::Error) -> Self {
        Self::RemoteIo(err)
    }
}
