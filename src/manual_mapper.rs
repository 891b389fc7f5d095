//! C7: a user-mode PE loader that maps a DLL into a foreign process without ever calling
//! `LoadLibrary` on the target, so the module never appears in its loader tables unless something
//! later re-links it in (see [`crate::anti_detection`]).

use std::{path::Path, time::Duration};

use bitflags::bitflags;
use widestring::U16CString;
use winapi::{
    um::{
        handleapi::CloseHandle,
        libloaderapi::{GetModuleHandleA, GetModuleHandleW, GetProcAddress, LoadLibraryA},
        processthreadsapi::{CreateRemoteThread, GetExitCodeThread},
        synchapi::WaitForSingleObject,
        winbase::WAIT_TIMEOUT,
        winnt::IMAGE_SCN_MEM_EXECUTE,
    },
};
use winapi::um::winnt::IMAGE_SCN_MEM_WRITE;

use crate::{
    error::{OsErrorContext, SyringeError, Win32Error},
    loader,
    pe_image::{ImportThunk, Machine, PeImage},
    process_ref::ProcessRef,
    remote_memory::{protection, RemoteAllocation},
    shellcode,
};

bitflags! {
    /// Tunable behaviours for [`ManualMapper::map`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ManualMapFlags: u32 {
        /// Zero the PE header region in the target after mapping completes.
        const CLEAR_HEADER = 1 << 0;
        /// Accepted for on-disk/profile round-trip stability; not implemented, matching upstream
        /// (which declares the bit without acting on it anywhere in its mapper).
        const CLEAR_NON_NEEDED = 1 << 1;
        /// Apply per-section page protections matching each section's characteristics.
        const ADJUST_PROTECTIONS = 1 << 2;
        /// Inspect the TLS directory and warn if callbacks are present, without invoking them
        /// (see SPEC_FULL §9 — tolerate-and-warn is the intended behaviour, not a stub).
        const HANDLE_TLS = 1 << 3;
        /// Accepted; registering exception tables has no effect here, matching upstream.
        const HANDLE_EXCEPTIONS = 1 << 4;
        /// Accepted; no-op, matching upstream.
        const RUN_UNDER_LDR = 1 << 5;
        /// Accepted; no-op, matching upstream.
        const SHIFT_MODULE = 1 << 6;
        /// Accepted; no-op, matching upstream.
        const CLEAN_DATA_DIRS = 1 << 7;
    }
}

impl ManualMapFlags {
    /// `CLEAR_HEADER | ADJUST_PROTECTIONS | HANDLE_TLS | HANDLE_EXCEPTIONS`.
    pub const DEFAULT: Self = Self::from_bits_truncate(
        Self::CLEAR_HEADER.bits()
            | Self::ADJUST_PROTECTIONS.bits()
            | Self::HANDLE_TLS.bits()
            | Self::HANDLE_EXCEPTIONS.bits(),
    );
    /// `DEFAULT | CLEAR_NON_NEEDED | CLEAN_DATA_DIRS`.
    pub const STEALTH: Self = Self::from_bits_truncate(
        Self::DEFAULT.bits() | Self::CLEAR_NON_NEEDED.bits() | Self::CLEAN_DATA_DIRS.bits(),
    );
    /// `STEALTH | SHIFT_MODULE`.
    pub const MAXIMUM: Self = Self::from_bits_truncate(Self::STEALTH.bits() | Self::SHIFT_MODULE.bits());
}

impl Default for ManualMapFlags {
    fn default() -> Self {
        Self::DEFAULT
    }
}

/// Result of a successful manual map.
#[derive(Debug, Clone, Copy)]
pub struct ManualMapOutcome {
    /// The address the image ended up mapped at in the target.
    pub base_address: u64,
    /// The image's `SizeOfImage`, i.e. the size of the mapped region.
    pub mapped_size: u64,
}

const ENTRY_POINT_TIMEOUT: Duration = Duration::from_millis(5000);

/// The twelve-stage user-mode PE mapper.
#[derive(Debug, Default)]
pub struct ManualMapper;

impl ManualMapper {
    /// Reads `dll_path` and maps it into `process`.
    pub fn map(
        &self,
        process: ProcessRef<'_>,
        dll_path: &Path,
        flags: ManualMapFlags,
    ) -> Result<ManualMapOutcome, SyringeError> {
        let image = PeImage::from_path(dll_path)?;
        self.map_image(process, &image, flags)
    }

    /// Maps an already-parsed [`PeImage`] into `process`.
    pub fn map_image(
        &self,
        process: ProcessRef<'_>,
        image: &PeImage,
        flags: ManualMapFlags,
    ) -> Result<ManualMapOutcome, SyringeError> {
        // Stage: arch gate.
        let target_is_x86 = process.is_x86()?;
        let image_is_x86 = matches!(image.machine(), Machine::X86);
        if target_is_x86 != image_is_x86 {
            return Err(SyringeError::DllArchMismatch);
        }

        // Stage: allocate (preferred base first, falling back to an OS-chosen address).
        let preferred_base = image.preferred_base() as *mut std::ffi::c_void;
        let allocation = RemoteAllocation::alloc_at(
            process,
            preferred_base,
            image.image_size() as usize,
            protection::PAGE_EXECUTE_READWRITE,
        )
        .or_else(|_| {
            RemoteAllocation::alloc_with_protection(
                process,
                image.image_size() as usize,
                protection::PAGE_EXECUTE_READWRITE,
            )
        })?;
        let remote_base = allocation.as_raw_ptr() as u64;

        // Stage: stage headers.
        allocation.write(0, image.header_bytes())?;

        // Stage: copy sections.
        for section in image.sections() {
            if section.raw_size == 0 {
                continue;
            }
            let start = section.raw_pointer as usize;
            let end = start + section.raw_size as usize;
            let bytes = image
                .raw_bytes()
                .get(start..end)
                .ok_or(SyringeError::InvalidFileFormat)?;
            allocation.write(section.virtual_address as usize, bytes)?;
        }

        // Stage: relocate.
        let delta = remote_base.wrapping_sub(image.preferred_base());
        if delta != 0 {
            for reloc in image.relocations() {
                match *reloc {
                    crate::pe_image::RelocationEntry::HighLow(rva) => {
                        let mut buf = [0u8; 4];
                        allocation.read(rva as usize, &mut buf)?;
                        let patched = (u32::from_ne_bytes(buf) as u64).wrapping_add(delta) as u32;
                        allocation.write(rva as usize, &patched.to_ne_bytes())?;
                    }
                    crate::pe_image::RelocationEntry::Dir64(rva) => {
                        let mut buf = [0u8; 8];
                        allocation.read(rva as usize, &mut buf)?;
                        let patched = u64::from_ne_bytes(buf).wrapping_add(delta);
                        allocation.write(rva as usize, &patched.to_ne_bytes())?;
                    }
                }
            }
        }

        // Stage: resolve imports.
        //
        // # Limitation (kept intentionally, see SPEC_FULL §9)
        // The function address written into the remote IAT is resolved via a *local*
        // `GetProcAddress` against a locally loaded copy of the same system DLL, not by reading
        // the remote module's export table. This is sound only when the dependency loads at an
        // address with the same export layout in both processes, which holds for ordinary system
        // DLLs but is not a guarantee this crate can check. This is the one place the port is
        // knowingly unsound, carried over unchanged from the implementation it was ported from.
        for import in image.imports() {
            self.ensure_module_loaded(process, &import.module_name)?;
            let local_module = unsafe {
                let name = std::ffi::CString::new(import.module_name.as_str())
                    .map_err(|_| SyringeError::InvalidFileFormat)?;
                let mut handle = GetModuleHandleA(name.as_ptr());
                if handle.is_null() {
                    handle = LoadLibraryA(name.as_ptr());
                }
                handle
            };
            if local_module.is_null() {
                log::warn!("manual map: could not resolve import module {}", import.module_name);
                continue;
            }

            for (iat_slot_rva, thunk) in &import.thunks {
                let addr = match thunk {
                    ImportThunk::Name(name) => {
                        let cname = std::ffi::CString::new(name.as_str())
                            .map_err(|_| SyringeError::InvalidFileFormat)?;
                        unsafe { GetProcAddress(local_module, cname.as_ptr()) }
                    }
                    ImportThunk::Ordinal(ordinal) => {
                        unsafe { GetProcAddress(local_module, *ordinal as *const i8) }
                    }
                };
                if addr.is_null() {
                    log::warn!(
                        "manual map: failed to resolve import from {}",
                        import.module_name
                    );
                    continue;
                }
                allocation.write(*iat_slot_rva as usize, &(addr as u64).to_ne_bytes())?;
            }
        }

        // Stage: TLS (soft — tolerate and warn, do not invoke callbacks).
        if flags.contains(ManualMapFlags::HANDLE_TLS) {
            if let Some(tls) = image.tls() {
                if tls.address_of_callbacks != 0 {
                    log::warn!(
                        "manual map: TLS callbacks present at 0x{:x}; not invoked",
                        tls.address_of_callbacks
                    );
                }
            }
        }

        // Stage: protect.
        if flags.contains(ManualMapFlags::ADJUST_PROTECTIONS) {
            for section in image.sections() {
                let protect = section_protection(section.characteristics);
                let result = allocation.protect_range(
                    section.virtual_address as usize,
                    section.virtual_size as usize,
                    protect,
                );
                if let Err(err) = result {
                    log::warn!("manual map: failed to protect section {}: {}", section.name, err);
                }
            }
        }

        // Stage: invoke entry.
        if image.entry_point_rva() != 0 {
            let entry_point = remote_base + image.entry_point_rva() as u64;
            self.invoke_entry(process, remote_base, entry_point, image.machine())?;
        }

        // Stage: clean headers.
        if flags.contains(ManualMapFlags::CLEAR_HEADER) {
            let zeros = vec![0u8; image.size_of_headers() as usize];
            if let Err(err) = allocation.write(0, &zeros) {
                log::warn!("manual map: failed to clear headers: {}", err);
            }
        }

        let mapped_size = image.image_size() as u64;
        allocation.release();

        Ok(ManualMapOutcome {
            base_address: remote_base,
            mapped_size,
        })
    }

    /// Frees a manually mapped image's memory. Does not run any unload routine first: a manually
    /// mapped module has no loader bookkeeping to walk back through.
    pub fn unmap(&self, process: ProcessRef<'_>, base_address: u64) -> Result<(), SyringeError> {
        use winapi::um::memoryapi::VirtualFreeEx;
        let ok = unsafe {
            VirtualFreeEx(
                process.handle(),
                base_address as *mut std::ffi::c_void,
                0,
                winapi::um::winnt::MEM_RELEASE,
            )
        };
        if ok == 0 {
            return Err(SyringeError::from_os_error(
                OsErrorContext::Memory,
                Win32Error::new(),
            ));
        }
        Ok(())
    }

    fn ensure_module_loaded(&self, process: ProcessRef<'_>, module_name: &str) -> Result<(), SyringeError> {
        if loader::find_by_name(process, module_name)?.is_some() {
            return Ok(());
        }

        let kernel32 = unsafe { GetModuleHandleW(U16CString::from_str("kernel32.dll").unwrap().as_ptr()) };
        if kernel32.is_null() {
            return Err(SyringeError::ModuleNotFound);
        }
        let load_library_a = unsafe { GetProcAddress(kernel32, c"LoadLibraryA".as_ptr().cast()) };
        if load_library_a.is_null() {
            return Err(SyringeError::ModuleNotFound);
        }

        let mut name_bytes = module_name.as_bytes().to_vec();
        name_bytes.push(0);
        let remote_name = RemoteAllocation::alloc_rw(process, name_bytes.len())?;
        remote_name.write(0, &name_bytes)?;

        let start_routine: unsafe extern "system" fn(*mut std::ffi::c_void) -> u32 =
            unsafe { std::mem::transmute(load_library_a) };
        let thread_handle = unsafe {
            CreateRemoteThread(
                process.handle(),
                std::ptr::null_mut(),
                0,
                Some(start_routine),
                remote_name.as_raw_ptr(),
                0,
                std::ptr::null_mut(),
            )
        };
        if thread_handle.is_null() {
            return Err(SyringeError::ThreadCreationFailed(Win32Error::new()));
        }
        let _guard = dispose::defer(|| unsafe {
            CloseHandle(thread_handle);
        });
        unsafe { WaitForSingleObject(thread_handle, ENTRY_POINT_TIMEOUT.as_millis() as u32) };

        let mut exit_code = 0u32;
        unsafe { GetExitCodeThread(thread_handle, &mut exit_code) };
        if exit_code == 0 {
            return Err(SyringeError::ModuleLoadFailed);
        }
        Ok(())
    }

    fn invoke_entry(
        &self,
        process: ProcessRef<'_>,
        image_base: u64,
        entry_point: u64,
        machine: Machine,
    ) -> Result<(), SyringeError> {
        let stub = match machine {
            Machine::X64 => shellcode::build_dll_main_caller_x64(image_base, entry_point)?,
            Machine::X86 => shellcode::build_dll_main_caller_x86(image_base as u32, entry_point as u32)?,
        };

        let stub_alloc =
            RemoteAllocation::alloc_with_protection(process, stub.len(), protection::PAGE_EXECUTE_READWRITE)?;
        stub_alloc.write(0, &stub)?;

        let start_routine: unsafe extern "system" fn(*mut std::ffi::c_void) -> u32 =
            unsafe { std::mem::transmute(stub_alloc.as_raw_ptr()) };
        let thread_handle = unsafe {
            CreateRemoteThread(
                process.handle(),
                std::ptr::null_mut(),
                0,
                Some(start_routine),
                std::ptr::null_mut(),
                0,
                std::ptr::null_mut(),
            )
        };
        if thread_handle.is_null() {
            return Err(SyringeError::ThreadCreationFailed(Win32Error::new()));
        }
        let _guard = dispose::defer(|| unsafe {
            CloseHandle(thread_handle);
        });

        let wait = unsafe { WaitForSingleObject(thread_handle, ENTRY_POINT_TIMEOUT.as_millis() as u32) };
        if wait == WAIT_TIMEOUT {
            return Err(SyringeError::RemoteOperationFailed);
        }
        if wait == winapi::um::winbase::WAIT_FAILED {
            return Err(SyringeError::from_os_error(
                OsErrorContext::Process,
                Win32Error::new(),
            ));
        }

        let mut exit_code = 0u32;
        let ok = unsafe { GetExitCodeThread(thread_handle, &mut exit_code) };
        if ok == 0 {
            return Err(SyringeError::from_os_error(
                OsErrorContext::Process,
                Win32Error::new(),
            ));
        }
        if exit_code == 0 {
            return Err(SyringeError::ModuleLoadFailed);
        }
        Ok(())
    }
}

fn section_protection(characteristics: u32) -> u32 {
    let exec = characteristics & IMAGE_SCN_MEM_EXECUTE != 0;
    let write = characteristics & IMAGE_SCN_MEM_WRITE != 0;
    match (exec, write) {
        (true, true) => protection::PAGE_EXECUTE_READWRITE,
        (true, false) => protection::PAGE_EXECUTE_READ,
        (false, true) => protection::PAGE_READWRITE,
        (false, false) => protection::PAGE_READONLY,
    }
}

