//! Remote memory allocation, read/write and protection primitives.

use std::{ffi::c_void, marker::PhantomData, mem, ptr};

use winapi::um::{
    memoryapi::{ReadProcessMemory, VirtualAllocEx, VirtualFreeEx, VirtualProtectEx, WriteProcessMemory},
    winnt::{
        MEM_COMMIT, MEM_RELEASE, MEM_RESERVE, PAGE_EXECUTE_READ, PAGE_EXECUTE_READWRITE,
        PAGE_NOACCESS, PAGE_READONLY, PAGE_READWRITE,
    },
};

use crate::{
    error::{OsErrorContext, SyringeError, Win32Error},
    process_ref::ProcessRef,
};

/// A region of memory owned by this process inside a foreign process's address space.
///
/// Allocated with `VirtualAllocEx` and freed with `VirtualFreeEx` on drop, unless [`Self::release`]
/// has handed ownership of the raw pointer to the caller (used when a strategy needs the region to
/// outlive this wrapper, e.g. a manually mapped image).
#[derive(Debug)]
pub(crate) struct RemoteAllocation<'a> {
    process: ProcessRef<'a>,
    ptr: *mut c_void,
    size: usize,
    owned: bool,
}

unsafe impl Send for RemoteAllocation<'_> {}
unsafe impl Sync for RemoteAllocation<'_> {}

impl<'a> RemoteAllocation<'a> {
    /// Reserves and commits `size` bytes of read-write memory in `process`.
    pub fn alloc_rw(process: ProcessRef<'a>, size: usize) -> Result<Self, SyringeError> {
        Self::alloc_with_protection(process, size, PAGE_READWRITE)
    }

    /// Reserves and commits `size` bytes with an explicit initial page protection.
    pub fn alloc_with_protection(
        process: ProcessRef<'a>,
        size: usize,
        protection: u32,
    ) -> Result<Self, SyringeError> {
        if size == 0 {
            return Err(SyringeError::InvalidArgument(
                "cannot allocate a zero-sized remote region".into(),
            ));
        }
        let ptr = unsafe {
            VirtualAllocEx(
                process.handle(),
                ptr::null_mut(),
                size,
                MEM_COMMIT | MEM_RESERVE,
                protection,
            )
        };
        if ptr.is_null() {
            return Err(SyringeError::MemoryAllocationFailed(Win32Error::new()));
        }
        Ok(Self {
            process,
            ptr,
            size,
            owned: true,
        })
    }

    /// Wraps a region at a caller-chosen address, typically one reserved by a preceding call
    /// that needed to pick the base itself (the manual mapper's preferred-base retry loop).
    pub fn alloc_at(
        process: ProcessRef<'a>,
        preferred: *mut c_void,
        size: usize,
        protection: u32,
    ) -> Result<Self, SyringeError> {
        let ptr = unsafe {
            VirtualAllocEx(
                process.handle(),
                preferred,
                size,
                MEM_COMMIT | MEM_RESERVE,
                protection,
            )
        };
        if ptr.is_null() {
            return Err(SyringeError::MemoryAllocationFailed(Win32Error::new()));
        }
        Ok(Self {
            process,
            ptr,
            size,
            owned: true,
        })
    }

    /// The region's base address in the foreign process.
    pub fn as_raw_ptr(&self) -> *mut c_void {
        self.ptr
    }

    /// The region's size in bytes.
    pub fn len(&self) -> usize {
        self.size
    }

    /// Writes `data` at `offset` bytes into the region.
    pub fn write(&self, offset: usize, data: &[u8]) -> Result<(), SyringeError> {
        if offset + data.len() > self.size {
            return Err(SyringeError::InvalidArgument(
                "write exceeds remote allocation bounds".into(),
            ));
        }
        let dest = unsafe { self.ptr.add(offset) };
        let mut written = 0usize;
        let ok = unsafe {
            WriteProcessMemory(
                self.process.handle(),
                dest,
                data.as_ptr().cast(),
                data.len(),
                &mut written,
            )
        };
        if ok == 0 || written != data.len() {
            return Err(SyringeError::MemoryWriteFailed(Win32Error::new()));
        }
        Ok(())
    }

    /// Reads `buf.len()` bytes starting at `offset` bytes into the region.
    pub fn read(&self, offset: usize, buf: &mut [u8]) -> Result<(), SyringeError> {
        if offset + buf.len() > self.size {
            return Err(SyringeError::InvalidArgument(
                "read exceeds remote allocation bounds".into(),
            ));
        }
        let src = unsafe { self.ptr.add(offset) };
        let mut read = 0usize;
        let ok = unsafe {
            ReadProcessMemory(
                self.process.handle(),
                src,
                buf.as_mut_ptr().cast(),
                buf.len(),
                &mut read,
            )
        };
        if ok == 0 || read != buf.len() {
            return Err(SyringeError::from_os_error(
                OsErrorContext::Memory,
                Win32Error::new(),
            ));
        }
        Ok(())
    }

    /// Changes the region's page protection, returning the previous value.
    pub fn protect(&self, protection: u32) -> Result<u32, SyringeError> {
        self.protect_range(0, self.size, protection)
    }

    /// Changes `[offset, offset+size)`'s page protection, returning the previous value. Used to
    /// set per-section protections over a subrange of a larger allocation, rather than clobbering
    /// the whole region.
    pub fn protect_range(&self, offset: usize, size: usize, protection: u32) -> Result<u32, SyringeError> {
        if offset + size > self.size {
            return Err(SyringeError::InvalidArgument(
                "protect_range exceeds remote allocation bounds".into(),
            ));
        }
        let addr = unsafe { self.ptr.add(offset) };
        let mut old = 0u32;
        let ok = unsafe { VirtualProtectEx(self.process.handle(), addr, size, protection, &mut old) };
        if ok == 0 {
            return Err(SyringeError::from_os_error(
                OsErrorContext::Memory,
                Win32Error::new(),
            ));
        }
        Ok(old)
    }

    /// Hands ownership of the raw region to the caller: it will not be freed when this value is
    /// dropped. Used once a manually mapped image's memory has to outlive the mapper's stack
    /// frame.
    pub fn release(mut self) -> *mut c_void {
        self.owned = false;
        self.ptr
    }

    /// Reinterprets this allocation as a typed remote box of `T`, asserting the size matches.
    pub(crate) fn into_typed<T>(self) -> RemoteBox<'a, T> {
        debug_assert!(self.size >= mem::size_of::<T>());
        RemoteBox {
            allocation: self,
            phantom: PhantomData,
        }
    }
}

impl Drop for RemoteAllocation<'_> {
    fn drop(&mut self) {
        if self.owned {
            unsafe {
                VirtualFreeEx(self.process.handle(), self.ptr, 0, MEM_RELEASE);
            }
        }
    }
}

/// A [`RemoteAllocation`] known to hold exactly one `T`.
#[derive(Debug)]
pub(crate) struct RemoteBox<'a, T> {
    allocation: RemoteAllocation<'a>,
    phantom: PhantomData<T>,
}

impl<'a, T: Copy> RemoteBox<'a, T> {
    pub fn as_ptr(&self) -> *mut c_void {
        self.allocation.as_raw_ptr()
    }

    pub fn write_value(&self, value: &T) -> Result<(), SyringeError> {
        let bytes =
            unsafe { std::slice::from_raw_parts((value as *const T).cast::<u8>(), mem::size_of::<T>()) };
        self.allocation.write(0, bytes)
    }

    pub fn read_value(&self) -> Result<T, SyringeError> {
        let mut value = mem::MaybeUninit::<T>::uninit();
        let buf = unsafe {
            std::slice::from_raw_parts_mut(value.as_mut_ptr().cast::<u8>(), mem::size_of::<T>())
        };
        self.allocation.read(0, buf)?;
        Ok(unsafe { value.assume_init() })
    }
}

/// Named page-protection constants, as accepted by [`RemoteAllocation::protect`].
pub mod protection {
    pub use winapi::um::winnt::{
        PAGE_EXECUTE_READ, PAGE_EXECUTE_READWRITE, PAGE_NOACCESS, PAGE_READONLY, PAGE_READWRITE,
    };
}

/// A temporary page-protection change over a foreign region, restored to its original value on
/// drop. Used around writes into sections that are not normally writable (e.g. `.text` during
/// manual mapping, or a hijacked thread's restore stub).
pub(crate) struct ScopedProtection<'a, 'p> {
    process: ProcessRef<'p>,
    addr: *mut c_void,
    size: usize,
    previous: u32,
    phantom: PhantomData<&'a ()>,
}

impl<'a, 'p> ScopedProtection<'a, 'p> {
    /// Changes `[addr, addr+size)`'s protection to `new_protection`, remembering the old value.
    pub fn new(
        process: ProcessRef<'p>,
        addr: *mut c_void,
        size: usize,
        new_protection: u32,
    ) -> Result<Self, SyringeError> {
        let mut previous = 0u32;
        let ok =
            unsafe { VirtualProtectEx(process.handle(), addr, size, new_protection, &mut previous) };
        if ok == 0 {
            return Err(SyringeError::from_os_error(
                OsErrorContext::Memory,
                Win32Error::new(),
            ));
        }
        Ok(Self {
            process,
            addr,
            size,
            previous,
            phantom: PhantomData,
        })
    }
}

impl Drop for ScopedProtection<'_, '_> {
    fn drop(&mut self) {
        let mut discard = 0u32;
        unsafe {
            VirtualProtectEx(
                self.process.handle(),
                self.addr,
                self.size,
                self.previous,
                &mut discard,
            );
        }
    }
}

#[allow(dead_code)]
fn _assert_protection_constants_distinct() {
    let all = [
        PAGE_NOACCESS,
        PAGE_READONLY,
        PAGE_READWRITE,
        PAGE_EXECUTE_READ,
        PAGE_EXECUTE_READWRITE,
    ];
    debug_assert_eq!(all.len(), 5);
}
