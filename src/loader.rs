//! Reads a foreign process's loader module list directly out of its address space, without
//! ever writing to it (writes belong exclusively to [`crate::anti_detection`]).

use std::mem;

use winapi::{
    shared::{minwindef::ULONG, ntdef::NTSTATUS},
    um::winnt::HANDLE,
};

use crate::{
    error::{OsErrorContext, SyringeError, Win32Error},
    process_ref::ProcessRef,
};

#[cfg(target_pointer_width = "64")]
const LDR_OFFSET_IN_PEB: usize = 0x18;
#[cfg(target_pointer_width = "32")]
const LDR_OFFSET_IN_PEB: usize = 0x0C;

// `InMemoryOrderModuleList`'s offset within `PEB_LDR_DATA`, and the offset of
// `InMemoryOrderLinks` within `LDR_DATA_TABLE_ENTRY` (used for the `CONTAINING_RECORD`
// subtraction below). These match the documented, stable layout on all supported Windows
// versions for the fields this crate reads.
#[cfg(target_pointer_width = "64")]
mod layout {
    pub const IN_MEMORY_ORDER_MODULE_LIST_OFFSET: usize = 0x20;
    pub const IN_MEMORY_ORDER_LINKS_OFFSET: usize = 0x10;
    pub const DLL_BASE_OFFSET: usize = 0x30;
    pub const ENTRY_POINT_OFFSET: usize = 0x38;
    pub const SIZE_OF_IMAGE_OFFSET: usize = 0x40;
    pub const FULL_DLL_NAME_OFFSET: usize = 0x48; // UNICODE_STRING
    pub const BASE_DLL_NAME_OFFSET: usize = 0x58; // UNICODE_STRING
    pub const TIME_DATE_STAMP_OFFSET: usize = 0x74;
}

#[cfg(target_pointer_width = "32")]
mod layout {
    pub const IN_MEMORY_ORDER_MODULE_LIST_OFFSET: usize = 0x14;
    pub const IN_MEMORY_ORDER_LINKS_OFFSET: usize = 0x08;
    pub const DLL_BASE_OFFSET: usize = 0x18;
    pub const ENTRY_POINT_OFFSET: usize = 0x1C;
    pub const SIZE_OF_IMAGE_OFFSET: usize = 0x20;
    pub const FULL_DLL_NAME_OFFSET: usize = 0x24;
    pub const BASE_DLL_NAME_OFFSET: usize = 0x2C;
    pub const TIME_DATE_STAMP_OFFSET: usize = 0x44;
}

#[repr(C)]
#[allow(non_snake_case)]
struct ProcessBasicInformation {
    ExitStatus: NTSTATUS,
    PebBaseAddress: *mut u8,
    AffinityMask: usize,
    BasePriority: i32,
    UniqueProcessId: usize,
    InheritedFromUniqueProcessId: usize,
}

extern "system" {
    fn NtQueryInformationProcess(
        process_handle: HANDLE,
        information_class: u32,
        information: *mut std::ffi::c_void,
        information_length: ULONG,
        return_length: *mut ULONG,
    ) -> NTSTATUS;
}

const PROCESS_BASIC_INFORMATION_CLASS: u32 = 0;

#[repr(C)]
struct ListEntry {
    flink: u64,
    blink: u64,
}

#[repr(C)]
struct UnicodeString {
    length: u16,
    maximum_length: u16,
    _padding: u32,
    buffer: u64,
}

/// A fully-read snapshot of one module's loader bookkeeping record.
#[derive(Debug, Clone)]
pub struct LoaderEntry {
    /// Address of the `InLoadOrderLinks` field within the remote `LDR_DATA_TABLE_ENTRY`.
    pub in_load_links: u64,
    /// Address of the `InMemoryOrderLinks` field.
    pub in_memory_links: u64,
    /// Address of the `InInitializationOrderLinks` field.
    pub in_init_links: u64,
    /// Address of the hash-bucket links field (`HashLinks` on modern loaders).
    pub hash_links: u64,
    pub dll_base: u64,
    pub entry_point: u64,
    pub size_of_image: u32,
    pub full_dll_name: String,
    pub base_dll_name: String,
    pub timestamp: u32,
    /// Address of the owning `LDR_DATA_TABLE_ENTRY` itself.
    pub entry_address: u64,
}

/// Reads the remote PEB address for `process` via `NtQueryInformationProcess`.
pub fn remote_peb_address(process: ProcessRef<'_>) -> Result<u64, SyringeError> {
    let mut info: ProcessBasicInformation = unsafe { mem::zeroed() };
    let mut return_length: ULONG = 0;
    let status = unsafe {
        NtQueryInformationProcess(
            process.handle(),
            PROCESS_BASIC_INFORMATION_CLASS,
            &mut info as *mut _ as *mut _,
            mem::size_of::<ProcessBasicInformation>() as ULONG,
            &mut return_length,
        )
    };
    if status != 0 {
        return Err(SyringeError::from_os_error(
            OsErrorContext::Process,
            Win32Error::new(),
        ));
    }
    Ok(info.PebBaseAddress as u64)
}

fn read_u64(process: ProcessRef<'_>, addr: u64) -> Result<u64, SyringeError> {
    let mut buf = [0u8; 8];
    read_remote(process, addr, &mut buf)?;
    Ok(u64::from_ne_bytes(buf))
}

fn read_u32(process: ProcessRef<'_>, addr: u64) -> Result<u32, SyringeError> {
    let mut buf = [0u8; 4];
    read_remote(process, addr, &mut buf)?;
    Ok(u32::from_ne_bytes(buf))
}

fn read_remote(process: ProcessRef<'_>, addr: u64, buf: &mut [u8]) -> Result<(), SyringeError> {
    use winapi::um::memoryapi::ReadProcessMemory;
    let mut read = 0usize;
    let ok = unsafe {
        ReadProcessMemory(
            process.handle(),
            addr as *const _,
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

fn read_unicode_string(process: ProcessRef<'_>, addr: u64) -> Result<String, SyringeError> {
    let mut buf = [0u8; mem::size_of::<UnicodeString>()];
    read_remote(process, addr, &mut buf)?;
    let us = unsafe { &*(buf.as_ptr() as *const UnicodeString) };
    if us.length == 0 || us.buffer == 0 {
        return Ok(String::new());
    }
    let char_count = (us.length / 2) as usize;
    let mut chars = vec![0u16; char_count];
    let byte_slice =
        unsafe { std::slice::from_raw_parts_mut(chars.as_mut_ptr().cast::<u8>(), us.length as usize) };
    read_remote(process, us.buffer, byte_slice)?;
    Ok(String::from_utf16_lossy(&chars))
}

fn read_entry_at(process: ProcessRef<'_>, entry_address: u64) -> Result<LoaderEntry, SyringeError> {
    Ok(LoaderEntry {
        in_load_links: entry_address, // `InLoadOrderLinks` is the entry's first field
        in_memory_links: entry_address + layout::IN_MEMORY_ORDER_LINKS_OFFSET as u64,
        in_init_links: entry_address + layout::IN_MEMORY_ORDER_LINKS_OFFSET as u64 + 0x10,
        hash_links: entry_address + layout::TIME_DATE_STAMP_OFFSET as u64 + 4,
        dll_base: read_u64(process, entry_address + layout::DLL_BASE_OFFSET as u64)?,
        entry_point: read_u64(process, entry_address + layout::ENTRY_POINT_OFFSET as u64)?,
        size_of_image: read_u32(process, entry_address + layout::SIZE_OF_IMAGE_OFFSET as u64)?,
        full_dll_name: read_unicode_string(
            process,
            entry_address + layout::FULL_DLL_NAME_OFFSET as u64,
        )?,
        base_dll_name: read_unicode_string(
            process,
            entry_address + layout::BASE_DLL_NAME_OFFSET as u64,
        )?,
        timestamp: read_u32(process, entry_address + layout::TIME_DATE_STAMP_OFFSET as u64)?,
        entry_address,
    })
}

/// Walks `InMemoryOrderModuleList` in `process`'s PEB, returning every loaded module's
/// [`LoaderEntry`] in load order.
pub fn walk_loaded_modules(process: ProcessRef<'_>) -> Result<Vec<LoaderEntry>, SyringeError> {
    let peb = remote_peb_address(process)?;
    let ldr = read_u64(process, peb + LDR_OFFSET_IN_PEB as u64)?;
    let list_head = ldr + layout::IN_MEMORY_ORDER_MODULE_LIST_OFFSET as u64;

    let mut entries = Vec::new();
    let mut current = read_u64(process, list_head)?; // Flink of the head
    let mut guard = 0;
    while current != list_head && guard < 4096 {
        // `current` points at the module's `InMemoryOrderLinks` field; the owning
        // `LDR_DATA_TABLE_ENTRY` starts `IN_MEMORY_ORDER_LINKS_OFFSET` bytes earlier
        // (the `CONTAINING_RECORD` pattern).
        let entry_address = current - layout::IN_MEMORY_ORDER_LINKS_OFFSET as u64;
        entries.push(read_entry_at(process, entry_address)?);
        current = read_u64(process, current)?; // follow Flink
        guard += 1;
    }
    Ok(entries)
}

/// Finds the loader entry whose `DllBase` equals `base`.
pub fn find_by_base(process: ProcessRef<'_>, base: u64) -> Result<Option<LoaderEntry>, SyringeError> {
    Ok(walk_loaded_modules(process)?
        .into_iter()
        .find(|e| e.dll_base == base))
}

/// Finds the loader entry whose `BaseDllName` matches `name`, case-insensitively.
pub fn find_by_name(
    process: ProcessRef<'_>,
    name: &str,
) -> Result<Option<LoaderEntry>, SyringeError> {
    let folded = crate::utils::fold_name(name);
    Ok(walk_loaded_modules(process)?
        .into_iter()
        .find(|e| crate::utils::fold_name(&e.base_dll_name) == folded))
}

#[allow(dead_code)]
fn _assert_list_entry_size() {
    debug_assert_eq!(mem::size_of::<ListEntry>(), 16);
}
