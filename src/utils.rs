//! Small helpers shared across components: wide-string marshalling and a generic retry loop.

use std::{thread, time::{Duration, Instant}};

use widestring::U16CString;

use crate::{error::SyringeError, process_ref::ProcessRef, remote_memory::RemoteAllocation};

/// A NUL-terminated UTF-16 string allocated in a foreign process's address space.
///
/// Used to marshal DLL paths for `LoadLibraryW`-family calls. The allocation is owned: dropping
/// this value frees the foreign memory unless the caller has already handed the pointer off to
/// a strategy that takes ownership of the region itself.
#[derive(Debug)]
pub(crate) struct ForeignProcessWideString<'a> {
    allocation: RemoteAllocation<'a>,
}

impl<'a> ForeignProcessWideString<'a> {
    /// Allocates and writes `string` into `process`'s address space.
    pub fn allocate_in_process(
        process: ProcessRef<'a>,
        string: U16CString,
    ) -> Result<Self, SyringeError> {
        let bytes = string.into_vec_with_nul();
        let byte_len = bytes.len() * std::mem::size_of::<u16>();
        let byte_slice = unsafe {
            std::slice::from_raw_parts(bytes.as_ptr().cast::<u8>(), byte_len)
        };

        let allocation = RemoteAllocation::alloc_rw(process, byte_len)?;
        allocation.write(0, byte_slice)?;

        Ok(Self { allocation })
    }

    pub fn as_mut_ptr(&mut self) -> *mut std::ffi::c_void {
        self.allocation.as_raw_ptr()
    }
}

/// Repeatedly calls `f` until `predicate(&result)` holds or `timeout` elapses, sleeping a short
/// fixed interval between attempts.
///
/// Grounded on the same polling idiom the manual mapper and the classic-thread strategy both
/// need: "ask the target to load a dependency, then wait for it to show up in the loader table".
pub(crate) fn retry_with_filter<T, E>(
    mut f: impl FnMut() -> Result<T, E>,
    predicate: impl Fn(&T) -> bool,
    timeout: Duration,
) -> Result<T, E> {
    let start = Instant::now();
    loop {
        let result = f()?;
        if predicate(&result) || start.elapsed() >= timeout {
            return Ok(result);
        }
        thread::sleep(Duration::from_millis(20));
    }
}

/// Lower-cases an ASCII/Unicode string for case-insensitive name comparisons (process and
/// module names are compared this way throughout the process directory, monitor and
/// auto-injector).
pub(crate) fn fold_name(name: &str) -> String {
    name.to_lowercase()
}
