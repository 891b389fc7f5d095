//! Low-level building blocks for packing many small remote allocations into a handful of
//! `VirtualAllocEx` regions, instead of paying one syscall pair per allocation.
//!
//! [`RemoteBoxAllocator`] (in [`remote_box`]) is the type most callers want; this module holds
//! the allocator machinery underneath it.

mod remote_box;
pub use remote_box::{RemoteBox, RemoteBoxAllocator};

use std::{mem, ptr::NonNull};

use crate::{
    error::Win32Error,
    process_ref::ProcessRef,
    remote_memory::{protection::PAGE_READWRITE, RemoteAllocation},
};

/// One buffer's worth of capacity, grown in units of this size (rounded up to hold larger
/// single allocations).
const DEFAULT_BUFFER_SIZE: usize = 0x1000;

/// A single allocation handed out by a [`RawAllocator`].
///
/// Carries enough information for the allocator to reclaim it later: the absolute remote
/// address, its length, and which backing buffer it came from.
#[derive(Debug, Clone, Copy)]
pub struct Allocation {
    ptr: *mut u8,
    pub(crate) len: usize,
    buffer_index: usize,
}

impl Allocation {
    /// The allocation's address in the foreign process.
    pub fn as_raw_ptr(&self) -> *mut u8 {
        self.ptr
    }

    /// The allocation's address in the foreign process, as a [`NonNull`].
    pub fn as_ptr(&self) -> NonNull<u8> {
        NonNull::new(self.ptr).expect("allocation pointer is never null")
    }
}

/// Something that can hand out and reclaim [`Allocation`]s inside a single target process.
pub(crate) trait RawAllocator {
    /// The process allocations from this allocator live in.
    fn process(&self) -> ProcessRef<'_>;

    /// Allocates at least `size` bytes, suitably aligned for any value that small.
    fn alloc(&mut self, size: usize) -> Result<Allocation, Win32Error>;

    /// Returns `allocation` to the allocator. `allocation` must have come from `self.alloc`.
    fn free(&mut self, allocation: &Allocation);
}

/// A buffer backing zero or more live [`Allocation`]s, bump-allocated from the front.
#[derive(Debug)]
struct Buffer<'a> {
    region: RemoteAllocation<'a>,
    cursor: usize,
    live_allocations: usize,
}

/// A [`RawAllocator`] that grows a pool of remote buffers on demand and bump-allocates within
/// each one, freeing a whole buffer once every allocation carved out of it has been freed.
///
/// This trades perfect reuse of freed space for simplicity: a buffer is never compacted or
/// reused for a smaller allocation after a bump past it, only ever released in full. In
/// exchange, short-lived helper values (stub parameters, result scratch space, DLL path strings)
/// stop paying one `VirtualAllocEx`/`VirtualFreeEx` round trip apiece.
#[derive(Debug)]
pub struct DynamicMultiBufferAllocator<'a> {
    process: ProcessRef<'a>,
    buffers: Vec<Buffer<'a>>,
}

impl<'a> DynamicMultiBufferAllocator<'a> {
    /// Creates an allocator with no buffers yet; the first call to [`RawAllocator::alloc`]
    /// allocates the first one.
    pub fn new(process: ProcessRef<'a>) -> Self {
        Self {
            process,
            buffers: Vec::new(),
        }
    }

    /// The process this allocator's buffers live in.
    pub fn process(&self) -> ProcessRef<'a> {
        self.process
    }

    fn buffer_capacity_for(size: usize) -> usize {
        size.max(DEFAULT_BUFFER_SIZE)
    }
}

impl<'a> RawAllocator for DynamicMultiBufferAllocator<'a> {
    fn process(&self) -> ProcessRef<'_> {
        self.process
    }

    fn alloc(&mut self, size: usize) -> Result<Allocation, Win32Error> {
        let size = size.max(mem::size_of::<usize>());

        for (index, buffer) in self.buffers.iter_mut().enumerate() {
            let remaining = buffer.region.len() - buffer.cursor;
            if remaining >= size {
                let ptr = unsafe { buffer.region.as_raw_ptr().add(buffer.cursor).cast::<u8>() };
                buffer.cursor += size;
                buffer.live_allocations += 1;
                return Ok(Allocation {
                    ptr,
                    len: size,
                    buffer_index: index,
                });
            }
        }

        let capacity = Self::buffer_capacity_for(size);
        let region = RemoteAllocation::alloc_with_protection(self.process, capacity, PAGE_READWRITE)
            .map_err(|err| match err {
                crate::error::SyringeError::MemoryAllocationFailed(win32) => win32,
                _ => Win32Error::new(),
            })?;
        let ptr = region.as_raw_ptr().cast::<u8>();
        self.buffers.push(Buffer {
            region,
            cursor: size,
            live_allocations: 1,
        });
        Ok(Allocation {
            ptr,
            len: size,
            buffer_index: self.buffers.len() - 1,
        })
    }

    fn free(&mut self, allocation: &Allocation) {
        if let Some(buffer) = self.buffers.get_mut(allocation.buffer_index) {
            debug_assert!(buffer.live_allocations > 0);
            buffer.live_allocations -= 1;
        }
        // Buffers whose last allocation was just freed are reclaimed lazily on the next `alloc`
        // pass rather than eagerly here, so a `free` immediately followed by an `alloc` of
        // similar size does not thrash a `VirtualFreeEx`/`VirtualAllocEx` pair.
        self.buffers.retain(|b| b.live_allocations > 0 || b.cursor < b.region.len());
    }
}

/// A typed, borrowed view over a range of a foreign process's address space, used to read and
/// write structured values without going through a [`RawAllocator`].
#[derive(Debug, Clone, Copy)]
pub struct ProcessMemorySlice<'a> {
    ptr: *mut u8,
    len: usize,
    process: ProcessRef<'a>,
}

unsafe impl Send for ProcessMemorySlice<'_> {}
unsafe impl Sync for ProcessMemorySlice<'_> {}

impl<'a> ProcessMemorySlice<'a> {
    /// Wraps an existing remote range. The caller vouches that `[ptr, ptr+len)` is valid,
    /// accessible memory in `process` for the lifetime `'a`.
    pub unsafe fn from_raw_parts(ptr: *mut u8, len: usize, process: ProcessRef<'a>) -> Self {
        Self { ptr, len, process }
    }

    /// The slice's base address in the foreign process.
    pub fn as_raw_ptr(&self) -> *mut u8 {
        self.ptr
    }

    /// The slice's length in bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the slice is empty.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Writes `value` at `offset` bytes into the slice.
    pub fn write_struct<T: ?Sized>(&self, offset: usize, value: &T) -> Result<(), Win32Error> {
        let size = mem::size_of_val(value);
        assert!(offset + size <= self.len, "write exceeds process memory slice bounds");
        let bytes = unsafe { std::slice::from_raw_parts((value as *const T).cast::<u8>(), size) };
        let dest = unsafe { self.ptr.add(offset) };
        let mut written = 0usize;
        let ok = unsafe {
            winapi::um::memoryapi::WriteProcessMemory(
                self.process.handle(),
                dest.cast(),
                bytes.as_ptr().cast(),
                bytes.len(),
                &mut written,
            )
        };
        if ok == 0 || written != bytes.len() {
            return Err(Win32Error::new());
        }
        Ok(())
    }

    /// Reads a `T` from `offset` bytes into the slice.
    ///
    /// # Safety
    /// The caller must ensure the remote bytes are a valid bit pattern for `T`.
    pub unsafe fn read_struct<T>(&self, offset: usize) -> Result<T, Win32Error> {
        assert!(
            offset + mem::size_of::<T>() <= self.len,
            "read exceeds process memory slice bounds"
        );
        let mut value = mem::MaybeUninit::<T>::uninit();
        let src = unsafe { self.ptr.add(offset) };
        let mut read = 0usize;
        let ok = unsafe {
            winapi::um::memoryapi::ReadProcessMemory(
                self.process.handle(),
                src.cast(),
                value.as_mut_ptr().cast(),
                mem::size_of::<T>(),
                &mut read,
            )
        };
        if ok == 0 || read != mem::size_of::<T>() {
            return Err(Win32Error::new());
        }
        Ok(unsafe { value.assume_init() })
    }
}
