//! C8: post-injection passes that reduce a manually mapped (or otherwise injected) module's
//! visibility to common enumeration techniques.

use bitflags::bitflags;

use crate::{
    error::{OsErrorContext, SyringeError, Win32Error},
    loader,
    process_ref::ProcessRef,
    remote_memory::{protection, ScopedProtection},
};

bitflags! {
    /// Which anti-detection passes [`AntiDetection::apply`] should run.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct AntiDetectTechnique: u32 {
        /// Unlink the module's `LDR_DATA_TABLE_ENTRY` from all four loader-table lists.
        const UNLINK_FROM_PEB = 1 << 0;
        /// Zero the module's PE header region in the target.
        const ERASE_HEADERS = 1 << 1;
        /// Accepted for profile/config round-trip stability; `apply` does not act on this bit,
        /// matching upstream (a Toolhelp32 snapshot walks the same loader list this crate can
        /// already unlink from — hiding from it specifically has no separate implementation).
        const HIDE_FROM_TOOLHELP = 1 << 2;
        /// Accepted; `spoof_module_name` is a standalone method, not dispatched from this bitmask
        /// (matching upstream, where the enum carries the bit but `Apply`'s switch never tests it).
        const SPOOF_MODULE_NAME = 1 << 3;
        /// Accepted; not implemented, matching upstream.
        const RANDOMIZE_TIMESTAMP = 1 << 4;
        /// Blank the debug data directory entry and the debug directory's own data.
        const CLEAR_DEBUG_INFO = 1 << 5;
    }
}

impl AntiDetectTechnique {
    /// `UNLINK_FROM_PEB | ERASE_HEADERS`.
    pub const BASIC: Self =
        Self::from_bits_truncate(Self::UNLINK_FROM_PEB.bits() | Self::ERASE_HEADERS.bits());
    /// `UNLINK_FROM_PEB | ERASE_HEADERS | HIDE_FROM_TOOLHELP | CLEAR_DEBUG_INFO`.
    pub const ADVANCED: Self = Self::from_bits_truncate(
        Self::BASIC.bits() | Self::HIDE_FROM_TOOLHELP.bits() | Self::CLEAR_DEBUG_INFO.bits(),
    );
    /// `UNLINK_FROM_PEB | ERASE_HEADERS | HIDE_FROM_TOOLHELP | SPOOF_MODULE_NAME |
    /// RANDOMIZE_TIMESTAMP | CLEAR_DEBUG_INFO`.
    pub const MAXIMUM: Self = Self::from_bits_truncate(
        Self::ADVANCED.bits() | Self::SPOOF_MODULE_NAME.bits() | Self::RANDOMIZE_TIMESTAMP.bits(),
    );
}

#[cfg(target_pointer_width = "64")]
const WORD_SIZE: usize = 8;
#[cfg(target_pointer_width = "32")]
const WORD_SIZE: usize = 4;

fn read_word(process: ProcessRef<'_>, addr: u64) -> Result<u64, SyringeError> {
    let mut buf = [0u8; WORD_SIZE];
    read_remote(process, addr, &mut buf)?;
    let mut padded = [0u8; 8];
    padded[..WORD_SIZE].copy_from_slice(&buf);
    Ok(u64::from_ne_bytes(padded))
}

fn write_word(process: ProcessRef<'_>, addr: u64, value: u64) -> Result<(), SyringeError> {
    let bytes = value.to_ne_bytes();
    write_remote(process, addr, &bytes[..WORD_SIZE])
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

fn write_remote(process: ProcessRef<'_>, addr: u64, buf: &[u8]) -> Result<(), SyringeError> {
    use winapi::um::memoryapi::WriteProcessMemory;
    let mut written = 0usize;
    let ok = unsafe {
        WriteProcessMemory(
            process.handle(),
            addr as *mut _,
            buf.as_ptr().cast(),
            buf.len(),
            &mut written,
        )
    };
    if ok == 0 || written != buf.len() {
        return Err(SyringeError::from_os_error(
            OsErrorContext::Memory,
            Win32Error::new(),
        ));
    }
    Ok(())
}

/// Unlinks the Flink/Blink pair at `entry_addr` from its doubly-linked list, the way
/// `RemoveEntryList` would if it could run remotely.
fn unlink_list_entry(process: ProcessRef<'_>, entry_addr: u64) -> Result<(), SyringeError> {
    let flink = read_word(process, entry_addr)?;
    let blink = read_word(process, entry_addr + WORD_SIZE as u64)?;
    write_word(process, blink, flink)?; // blink->Flink = flink
    write_word(process, flink + WORD_SIZE as u64, blink)?; // flink->Blink = blink
    Ok(())
}

/// Post-injection passes over a module already mapped into a foreign process.
#[derive(Debug, Default)]
pub struct AntiDetection;

impl AntiDetection {
    /// Dispatches every bit in `techniques` that has an implementation: `UNLINK_FROM_PEB`,
    /// `ERASE_HEADERS`, `CLEAR_DEBUG_INFO`. Other bits are accepted but have no effect, matching
    /// upstream.
    pub fn apply(
        &self,
        process: ProcessRef<'_>,
        module_base: u64,
        techniques: AntiDetectTechnique,
    ) -> Result<(), SyringeError> {
        let mut last_err = None;

        if techniques.contains(AntiDetectTechnique::UNLINK_FROM_PEB) {
            if let Err(err) = self.unlink_from_peb(process, module_base) {
                log::warn!("anti-detect: failed to unlink from PEB: {}", err);
                last_err = Some(err);
            } else {
                log::debug!("anti-detect: module unlinked from PEB");
            }
        }

        if techniques.contains(AntiDetectTechnique::ERASE_HEADERS) {
            if let Err(err) = self.erase_headers(process, module_base) {
                log::warn!("anti-detect: failed to erase headers: {}", err);
                last_err = Some(err);
            } else {
                log::debug!("anti-detect: PE headers erased");
            }
        }

        if techniques.contains(AntiDetectTechnique::CLEAR_DEBUG_INFO) {
            if let Err(err) = self.clear_debug_directory(process, module_base) {
                log::warn!("anti-detect: failed to clear debug directory: {}", err);
                last_err = Some(err);
            } else {
                log::debug!("anti-detect: debug directory cleared");
            }
        }

        match last_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Unlinks `module_base`'s loader-table entry from all four lists it participates in.
    pub fn unlink_from_peb(&self, process: ProcessRef<'_>, module_base: u64) -> Result<(), SyringeError> {
        let entry = loader::find_by_base(process, module_base)?.ok_or(SyringeError::ModuleNotFound)?;
        unlink_list_entry(process, entry.in_load_links)?;
        unlink_list_entry(process, entry.in_memory_links)?;
        unlink_list_entry(process, entry.in_init_links)?;
        unlink_list_entry(process, entry.hash_links)?;
        Ok(())
    }

    /// Zeroes the PE header region (DOS header through the end of the optional header and
    /// section table) at `module_base`.
    pub fn erase_headers(&self, process: ProcessRef<'_>, module_base: u64) -> Result<(), SyringeError> {
        let mut dos_header = [0u8; 64];
        read_remote(process, module_base, &mut dos_header)?;
        if &dos_header[0..2] != b"MZ" {
            return Err(SyringeError::InvalidFileFormat);
        }
        let e_lfanew = u32::from_le_bytes(dos_header[60..64].try_into().unwrap()) as u64;

        let mut size_of_headers_buf = [0u8; 4];
        // `SizeOfHeaders` sits at a fixed offset from the NT header start that is the same for
        // both PE32 and PE32+ (0x18 signature/file-header + 0x3C into the optional header).
        read_remote(process, module_base + e_lfanew + 0x54, &mut size_of_headers_buf)?;
        let size_of_headers = u32::from_le_bytes(size_of_headers_buf) as usize;

        let region = (module_base) as *mut std::ffi::c_void;
        let _guard = ScopedProtection::new(process, region, size_of_headers, protection::PAGE_READWRITE)?;
        let zeros = vec![0u8; size_of_headers];
        write_remote(process, module_base, &zeros)
    }

    /// Blanks the `IMAGE_DIRECTORY_ENTRY_DEBUG` data directory slot and the debug directory data
    /// it pointed at.
    pub fn clear_debug_directory(&self, process: ProcessRef<'_>, module_base: u64) -> Result<(), SyringeError> {
        let mut dos_header = [0u8; 64];
        read_remote(process, module_base, &mut dos_header)?;
        let e_lfanew = u32::from_le_bytes(dos_header[60..64].try_into().unwrap()) as u64;

        // Data directory entries are 8 bytes each; DEBUG is index 6. The optional header's data
        // directory starts at a different fixed offset for PE32 vs PE32+; we only support the
        // PE32+ (x64) layout here, matching the thread-hijack strategy's x64-only scope.
        let data_dir_offset = e_lfanew + 0x18 + 0x70;
        let debug_dir_addr = module_base + data_dir_offset + 6 * 8;

        let mut entry = [0u8; 8];
        read_remote(process, debug_dir_addr, &mut entry)?;
        let virtual_address = u32::from_le_bytes(entry[0..4].try_into().unwrap());
        let size = u32::from_le_bytes(entry[4..8].try_into().unwrap());
        if size == 0 {
            return Ok(());
        }

        {
            let _guard = ScopedProtection::new(
                process,
                debug_dir_addr as *mut std::ffi::c_void,
                8,
                protection::PAGE_READWRITE,
            )?;
            write_remote(process, debug_dir_addr, &[0u8; 8])?;
        }

        if virtual_address != 0 {
            let debug_data_addr = module_base + virtual_address as u64;
            let _guard = ScopedProtection::new(
                process,
                debug_data_addr as *mut std::ffi::c_void,
                size as usize,
                protection::PAGE_READWRITE,
            )?;
            write_remote(process, debug_data_addr, &vec![0u8; size as usize])?;
        }

        Ok(())
    }

    /// Replaces the `BaseDllName` the loader reports for `module_base` with `new_name`.
    ///
    /// # Limitation (kept intentionally)
    /// The buffer this replaces is never freed: the original implementation this was ported from
    /// also leaks it, since the previous `UNICODE_STRING.Buffer` may still be referenced by other
    /// loader bookkeeping and freeing it would be unsound without knowing every reader has moved
    /// on.
    pub fn spoof_module_name(
        &self,
        process: ProcessRef<'_>,
        module_base: u64,
        new_name: &str,
    ) -> Result<(), SyringeError> {
        use crate::remote_memory::RemoteAllocation;

        let entry = loader::find_by_base(process, module_base)?.ok_or(SyringeError::ModuleNotFound)?;

        let wide: Vec<u16> = new_name.encode_utf16().chain(std::iter::once(0)).collect();
        let bytes: &[u8] =
            unsafe { std::slice::from_raw_parts(wide.as_ptr().cast(), wide.len() * 2) };

        let allocation = RemoteAllocation::alloc_rw(process, bytes.len())?;
        allocation.write(0, bytes)?;
        let buffer_ptr = allocation.release() as u64;

        let length = (new_name.encode_utf16().count() * 2) as u16;
        let maximum_length = bytes.len() as u16;

        // `UNICODE_STRING`: Length: u16, MaximumLength: u16, padding: u32, Buffer: u64.
        let mut unicode_string = [0u8; 16];
        unicode_string[0..2].copy_from_slice(&length.to_ne_bytes());
        unicode_string[2..4].copy_from_slice(&maximum_length.to_ne_bytes());
        unicode_string[8..16].copy_from_slice(&buffer_ptr.to_ne_bytes());

        // `BaseDllName` sits right after `FullDllName` in `LDR_DATA_TABLE_ENTRY`; `entry_address`
        // plus the fixed offset used when this entry was read gives us the field's address.
        let base_dll_name_addr = entry.entry_address + base_dll_name_offset();
        write_remote(process, base_dll_name_addr, &unicode_string)
    }

    /// Whether `module_base` is absent from the loader's `InLoadOrderModuleList`.
    pub fn is_module_hidden(&self, process: ProcessRef<'_>, module_base: u64) -> Result<bool, SyringeError> {
        Ok(loader::find_by_base(process, module_base)?.is_none())
    }
}

#[cfg(target_pointer_width = "64")]
const fn base_dll_name_offset() -> u64 {
    0x58
}
#[cfg(target_pointer_width = "32")]
const fn base_dll_name_offset() -> u64 {
    0x2C
}
