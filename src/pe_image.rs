//! Parses a DLL's bytes into a typed view over its headers, sections, imports, relocations, TLS
//! and debug directories, plus signature verification and version-info extraction.

use std::{
    collections::HashMap,
    ffi::OsStr,
    fs,
    mem,
    os::windows::ffi::OsStrExt,
    path::{Path, PathBuf},
    sync::Mutex,
};

use once_cell::sync::Lazy;
use winapi::{
    shared::ntdef::{IMAGE_FILE_MACHINE_AMD64, IMAGE_FILE_MACHINE_I386},
    um::winnt::{
        IMAGE_BASE_RELOCATION, IMAGE_DATA_DIRECTORY, IMAGE_DEBUG_DIRECTORY,
        IMAGE_DIRECTORY_ENTRY_BASERELOC, IMAGE_DIRECTORY_ENTRY_DEBUG,
        IMAGE_DIRECTORY_ENTRY_EXPORT, IMAGE_DIRECTORY_ENTRY_IMPORT, IMAGE_DIRECTORY_ENTRY_TLS,
        IMAGE_DOS_HEADER, IMAGE_EXPORT_DIRECTORY, IMAGE_FILE_DLL, IMAGE_IMPORT_DESCRIPTOR,
        IMAGE_NT_HEADERS32, IMAGE_NT_HEADERS64, IMAGE_REL_BASED_ABSOLUTE, IMAGE_REL_BASED_DIR64,
        IMAGE_REL_BASED_HIGHLOW, IMAGE_SECTION_HEADER, IMAGE_TLS_DIRECTORY32,
        IMAGE_TLS_DIRECTORY64,
    },
};

use crate::error::SyringeError;

const DOS_SIGNATURE: u16 = 0x5A4D; // "MZ"
const NT_SIGNATURE: u32 = 0x0000_4550; // "PE\0\0"

/// The target machine a [`PeImage`] was built for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Machine {
    /// 32-bit x86.
    X86,
    /// 64-bit x86-64.
    X64,
}

/// One `IMAGE_SECTION_HEADER`, decoded into owned fields.
#[derive(Debug, Clone)]
pub struct SectionDescriptor {
    /// The section's 8-byte name, trimmed of trailing NULs (not necessarily valid UTF-8, but
    /// always ASCII in practice for the sections this crate inspects).
    pub name: String,
    pub virtual_address: u32,
    pub virtual_size: u32,
    pub raw_pointer: u32,
    pub raw_size: u32,
    pub characteristics: u32,
}

/// One resolved import thunk: either an ordinal or a name, plus the IAT slot RVA to patch.
#[derive(Debug, Clone)]
pub enum ImportThunk {
    /// Import by ordinal.
    Ordinal(u16),
    /// Import by name (the hint/name table entry, hint discarded).
    Name(String),
}

/// One `IMAGE_IMPORT_DESCRIPTOR`, with its thunk list resolved to offsets into the IAT.
#[derive(Debug, Clone)]
pub struct ImportDescriptor {
    pub module_name: String,
    /// `(iat_slot_rva, thunk)` pairs, in thunk-table order.
    pub thunks: Vec<(u32, ImportThunk)>,
}

/// One base-relocation fix-up: an RVA to patch and how to patch it.
#[derive(Debug, Clone, Copy)]
pub enum RelocationEntry {
    /// Add the relocation delta to the 32-bit value at this RVA.
    HighLow(u32),
    /// Add the relocation delta to the 64-bit value at this RVA.
    Dir64(u32),
}

/// The parsed TLS directory, kept only for the soft TLS-handling stage in the manual mapper.
#[derive(Debug, Clone, Copy)]
pub struct TlsInfo {
    pub start_address_of_raw_data: u64,
    pub end_address_of_raw_data: u64,
    pub address_of_callbacks: u64,
}

/// The parsed debug directory, used by the anti-detection pass to wipe it.
#[derive(Debug, Clone, Copy)]
pub struct DebugInfo {
    pub directory_rva: u32,
    pub directory_size: u32,
}

/// An owned, fully-parsed DLL image.
#[derive(Debug, Clone)]
pub struct PeImage {
    raw_bytes: Vec<u8>,
    machine: Machine,
    image_size: u32,
    preferred_base: u64,
    entry_point_rva: u32,
    size_of_headers: u32,
    sections: Vec<SectionDescriptor>,
    imports: Vec<ImportDescriptor>,
    relocations: Vec<RelocationEntry>,
    tls: Option<TlsInfo>,
    debug: Option<DebugInfo>,
}

impl PeImage {
    /// Reads and parses the DLL at `path`.
    pub fn from_path(path: &Path) -> Result<Self, SyringeError> {
        let bytes = fs::read(path).map_err(|_| SyringeError::FileNotFound)?;
        Self::parse(bytes)
    }

    /// Parses an already-read DLL image.
    pub fn parse(raw_bytes: Vec<u8>) -> Result<Self, SyringeError> {
        if raw_bytes.len() < mem::size_of::<IMAGE_DOS_HEADER>() {
            return Err(SyringeError::InvalidFileFormat);
        }
        let dos_header = unsafe { &*(raw_bytes.as_ptr() as *const IMAGE_DOS_HEADER) };
        if dos_header.e_magic != DOS_SIGNATURE {
            return Err(SyringeError::InvalidFileFormat);
        }

        let nt_offset = dos_header.e_lfanew as usize;
        if nt_offset + mem::size_of::<u32>() > raw_bytes.len() {
            return Err(SyringeError::InvalidFileFormat);
        }
        let signature = unsafe { *(raw_bytes.as_ptr().add(nt_offset) as *const u32) };
        if signature != NT_SIGNATURE {
            return Err(SyringeError::InvalidFileFormat);
        }

        let machine_field =
            unsafe { *(raw_bytes.as_ptr().add(nt_offset + 4) as *const u16) };
        let machine = match machine_field as u32 {
            IMAGE_FILE_MACHINE_I386 => Machine::X86,
            IMAGE_FILE_MACHINE_AMD64 => Machine::X64,
            _ => return Err(SyringeError::InvalidFileFormat),
        };

        let (
            characteristics,
            image_size,
            preferred_base,
            entry_point_rva,
            size_of_headers,
            num_sections,
            section_table_offset,
            data_directories,
        ) = match machine {
            Machine::X64 => {
                if nt_offset + mem::size_of::<IMAGE_NT_HEADERS64>() > raw_bytes.len() {
                    return Err(SyringeError::InvalidFileFormat);
                }
                let nt = unsafe {
                    &*(raw_bytes.as_ptr().add(nt_offset) as *const IMAGE_NT_HEADERS64)
                };
                (
                    nt.FileHeader.Characteristics,
                    nt.OptionalHeader.SizeOfImage,
                    nt.OptionalHeader.ImageBase,
                    nt.OptionalHeader.AddressOfEntryPoint,
                    nt.OptionalHeader.SizeOfHeaders,
                    nt.FileHeader.NumberOfSections,
                    nt_offset + mem::size_of::<IMAGE_NT_HEADERS64>(),
                    nt.OptionalHeader.DataDirectory,
                )
            }
            Machine::X86 => {
                if nt_offset + mem::size_of::<IMAGE_NT_HEADERS32>() > raw_bytes.len() {
                    return Err(SyringeError::InvalidFileFormat);
                }
                let nt = unsafe {
                    &*(raw_bytes.as_ptr().add(nt_offset) as *const IMAGE_NT_HEADERS32)
                };
                (
                    nt.FileHeader.Characteristics,
                    nt.OptionalHeader.SizeOfImage,
                    nt.OptionalHeader.ImageBase as u64,
                    nt.OptionalHeader.AddressOfEntryPoint,
                    nt.OptionalHeader.SizeOfHeaders,
                    nt.FileHeader.NumberOfSections,
                    nt_offset + mem::size_of::<IMAGE_NT_HEADERS32>(),
                    nt.OptionalHeader.DataDirectory,
                )
            }
        };

        if characteristics as u32 & IMAGE_FILE_DLL == 0 {
            return Err(SyringeError::InvalidFileFormat);
        }

        let sections =
            parse_sections(&raw_bytes, section_table_offset, num_sections as usize)?;

        for section in &sections {
            let end = section.raw_pointer as usize + section.raw_size as usize;
            if end > raw_bytes.len() {
                return Err(SyringeError::InvalidFileFormat);
            }
        }

        let imports = parse_imports(&raw_bytes, &sections, &data_directories, machine)?;
        let relocations = parse_relocations(&raw_bytes, &sections, &data_directories, machine)?;
        let tls = parse_tls(&raw_bytes, &sections, &data_directories, machine, preferred_base);
        let debug = parse_debug(&data_directories);

        Ok(Self {
            raw_bytes,
            machine,
            image_size,
            preferred_base,
            entry_point_rva,
            size_of_headers,
            sections,
            imports,
            relocations,
            tls,
            debug,
        })
    }

    pub fn machine(&self) -> Machine {
        self.machine
    }

    pub fn image_size(&self) -> u32 {
        self.image_size
    }

    pub fn preferred_base(&self) -> u64 {
        self.preferred_base
    }

    pub fn entry_point_rva(&self) -> u32 {
        self.entry_point_rva
    }

    pub fn size_of_headers(&self) -> u32 {
        self.size_of_headers
    }

    pub fn sections(&self) -> &[SectionDescriptor] {
        &self.sections
    }

    pub fn imports(&self) -> &[ImportDescriptor] {
        &self.imports
    }

    pub fn relocations(&self) -> &[RelocationEntry] {
        &self.relocations
    }

    pub fn tls(&self) -> Option<TlsInfo> {
        self.tls
    }

    pub fn debug(&self) -> Option<DebugInfo> {
        self.debug
    }

    pub fn raw_bytes(&self) -> &[u8] {
        &self.raw_bytes
    }

    /// Header bytes, i.e. `raw_bytes[..size_of_headers]`.
    pub fn header_bytes(&self) -> &[u8] {
        &self.raw_bytes[..(self.size_of_headers as usize).min(self.raw_bytes.len())]
    }

    /// Walks the export directory, returning `(name, rva)` pairs. Used by the manual mapper's
    /// import-resolution stage as the local-proxy export source (see its module doc comment).
    pub fn exports(&self) -> Vec<(String, u32)> {
        let Some(dir) = self.data_directory(IMAGE_DIRECTORY_ENTRY_EXPORT) else {
            return Vec::new();
        };
        if dir.VirtualAddress == 0 {
            return Vec::new();
        }
        let Some(offset) = self.rva_to_offset(dir.VirtualAddress) else {
            return Vec::new();
        };
        if offset + mem::size_of::<IMAGE_EXPORT_DIRECTORY>() > self.raw_bytes.len() {
            return Vec::new();
        }
        let export_dir =
            unsafe { &*(self.raw_bytes.as_ptr().add(offset) as *const IMAGE_EXPORT_DIRECTORY) };

        let Some(names_offset) = self.rva_to_offset(export_dir.AddressOfNames) else {
            return Vec::new();
        };
        let Some(ordinals_offset) = self.rva_to_offset(export_dir.AddressOfNameOrdinals) else {
            return Vec::new();
        };
        let Some(functions_offset) = self.rva_to_offset(export_dir.AddressOfFunctions) else {
            return Vec::new();
        };

        let mut result = Vec::with_capacity(export_dir.NumberOfNames as usize);
        for i in 0..export_dir.NumberOfNames as usize {
            let name_rva_offset = names_offset + i * mem::size_of::<u32>();
            if name_rva_offset + 4 > self.raw_bytes.len() {
                break;
            }
            let name_rva =
                unsafe { *(self.raw_bytes.as_ptr().add(name_rva_offset) as *const u32) };
            let Some(name_offset) = self.rva_to_offset(name_rva) else {
                continue;
            };
            let name = read_c_str(&self.raw_bytes, name_offset);

            let ordinal_offset = ordinals_offset + i * mem::size_of::<u16>();
            if ordinal_offset + 2 > self.raw_bytes.len() {
                break;
            }
            let ordinal =
                unsafe { *(self.raw_bytes.as_ptr().add(ordinal_offset) as *const u16) } as usize;

            let function_offset = functions_offset + ordinal * mem::size_of::<u32>();
            if function_offset + 4 > self.raw_bytes.len() {
                continue;
            }
            let function_rva =
                unsafe { *(self.raw_bytes.as_ptr().add(function_offset) as *const u32) };
            result.push((name, function_rva));
        }
        result
    }

    fn data_directory(&self, index: usize) -> Option<IMAGE_DATA_DIRECTORY> {
        // The caller only ever re-derives this from the already-validated headers, so a second
        // light-weight re-parse here keeps `PeImage` itself free of a self-referential pointer.
        let dos_header = unsafe { &*(self.raw_bytes.as_ptr() as *const IMAGE_DOS_HEADER) };
        let nt_offset = dos_header.e_lfanew as usize;
        match self.machine {
            Machine::X64 => {
                let nt = unsafe {
                    &*(self.raw_bytes.as_ptr().add(nt_offset) as *const IMAGE_NT_HEADERS64)
                };
                nt.OptionalHeader.DataDirectory.get(index).copied()
            }
            Machine::X86 => {
                let nt = unsafe {
                    &*(self.raw_bytes.as_ptr().add(nt_offset) as *const IMAGE_NT_HEADERS32)
                };
                nt.OptionalHeader.DataDirectory.get(index).copied()
            }
        }
    }

    /// Translates an RVA to a file offset by linear scan of the section table, falling back to
    /// identity mapping within the header region (RVAs below the first section's virtual
    /// address, e.g. directory entries that point into the header itself).
    pub fn rva_to_offset(&self, rva: u32) -> Option<usize> {
        if rva == 0 {
            return None;
        }
        if (rva as usize) < self.size_of_headers as usize {
            return Some(rva as usize);
        }
        for section in &self.sections {
            let start = section.virtual_address;
            let end = start + section.virtual_size.max(section.raw_size);
            if rva >= start && rva < end {
                let within = rva - start;
                return Some(section.raw_pointer as usize + within as usize);
            }
        }
        None
    }
}

fn parse_sections(
    raw_bytes: &[u8],
    offset: usize,
    count: usize,
) -> Result<Vec<SectionDescriptor>, SyringeError> {
    let mut sections = Vec::with_capacity(count);
    for i in 0..count {
        let entry_offset = offset + i * mem::size_of::<IMAGE_SECTION_HEADER>();
        if entry_offset + mem::size_of::<IMAGE_SECTION_HEADER>() > raw_bytes.len() {
            return Err(SyringeError::InvalidFileFormat);
        }
        let header = unsafe {
            &*(raw_bytes.as_ptr().add(entry_offset) as *const IMAGE_SECTION_HEADER)
        };
        let name_len = header.Name.iter().position(|&c| c == 0).unwrap_or(8);
        let name = String::from_utf8_lossy(&header.Name[..name_len]).into_owned();
        sections.push(SectionDescriptor {
            name,
            virtual_address: header.VirtualAddress,
            virtual_size: unsafe { *header.Misc.VirtualSize() },
            raw_pointer: header.PointerToRawData,
            raw_size: header.SizeOfRawData,
            characteristics: header.Characteristics,
        });
    }
    Ok(sections)
}

fn read_c_str(bytes: &[u8], offset: usize) -> String {
    let end = bytes[offset..]
        .iter()
        .position(|&b| b == 0)
        .map(|p| offset + p)
        .unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[offset..end]).into_owned()
}

fn rva_to_offset_with(sections: &[SectionDescriptor], size_of_headers: u32, rva: u32) -> Option<usize> {
    if rva == 0 {
        return None;
    }
    if (rva as usize) < size_of_headers as usize {
        return Some(rva as usize);
    }
    for section in sections {
        let start = section.virtual_address;
        let end = start + section.virtual_size.max(section.raw_size);
        if rva >= start && rva < end {
            return Some(section.raw_pointer as usize + (rva - start) as usize);
        }
    }
    None
}

fn parse_imports(
    raw_bytes: &[u8],
    sections: &[SectionDescriptor],
    data_directories: &[IMAGE_DATA_DIRECTORY],
    machine: Machine,
) -> Result<Vec<ImportDescriptor>, SyringeError> {
    let Some(dir) = data_directories.get(IMAGE_DIRECTORY_ENTRY_IMPORT) else {
        return Ok(Vec::new());
    };
    if dir.VirtualAddress == 0 {
        return Ok(Vec::new());
    }
    let size_of_headers = headers_bound(sections);
    let Some(mut offset) = rva_to_offset_with(sections, size_of_headers, dir.VirtualAddress) else {
        return Ok(Vec::new());
    };

    let mut descriptors = Vec::new();
    loop {
        if offset + mem::size_of::<IMAGE_IMPORT_DESCRIPTOR>() > raw_bytes.len() {
            break;
        }
        let descriptor = unsafe {
            &*(raw_bytes.as_ptr().add(offset) as *const IMAGE_IMPORT_DESCRIPTOR)
        };
        let name_rva = descriptor.Name;
        if name_rva == 0 {
            break; // null descriptor terminates the array
        }
        let Some(name_offset) = rva_to_offset_with(sections, size_of_headers, name_rva) else {
            break;
        };
        let module_name = read_c_str(raw_bytes, name_offset);

        let thunk_rva = unsafe { *descriptor.u.OriginalFirstThunk() };
        let thunk_rva = if thunk_rva != 0 {
            thunk_rva
        } else {
            descriptor.FirstThunk
        };
        let mut thunks = Vec::new();
        let mut thunk_offset = rva_to_offset_with(sections, size_of_headers, thunk_rva);
        let mut iat_rva = descriptor.FirstThunk;
        let thunk_size: usize = if matches!(machine, Machine::X64) { 8 } else { 4 };

        while let Some(to) = thunk_offset {
            if to + thunk_size > raw_bytes.len() {
                break;
            }
            let raw_thunk: u64 = if thunk_size == 8 {
                unsafe { *(raw_bytes.as_ptr().add(to) as *const u64) }
            } else {
                unsafe { *(raw_bytes.as_ptr().add(to) as *const u32) as u64 }
            };
            if raw_thunk == 0 {
                break;
            }
            let is_ordinal = raw_thunk & (1 << (thunk_size * 8 - 1)) != 0;
            let thunk = if is_ordinal {
                ImportThunk::Ordinal((raw_thunk & 0xFFFF) as u16)
            } else {
                let name_rva = (raw_thunk & 0x7FFF_FFFF) as u32;
                // skip the 2-byte "hint" field preceding the name
                match rva_to_offset_with(sections, size_of_headers, name_rva) {
                    Some(o) if o + 2 <= raw_bytes.len() => {
                        ImportThunk::Name(read_c_str(raw_bytes, o + 2))
                    }
                    _ => break,
                }
            };
            thunks.push((iat_rva, thunk));
            iat_rva += thunk_size as u32;
            thunk_offset = Some(to + thunk_size);
        }

        descriptors.push(ImportDescriptor {
            module_name,
            thunks,
        });
        offset += mem::size_of::<IMAGE_IMPORT_DESCRIPTOR>();
    }
    Ok(descriptors)
}

fn headers_bound(sections: &[SectionDescriptor]) -> u32 {
    sections
        .iter()
        .map(|s| s.virtual_address)
        .min()
        .unwrap_or(0x1000)
}

fn parse_relocations(
    raw_bytes: &[u8],
    sections: &[SectionDescriptor],
    data_directories: &[IMAGE_DATA_DIRECTORY],
    machine: Machine,
) -> Result<Vec<RelocationEntry>, SyringeError> {
    let Some(dir) = data_directories.get(IMAGE_DIRECTORY_ENTRY_BASERELOC) else {
        return Ok(Vec::new());
    };
    if dir.VirtualAddress == 0 || dir.Size == 0 {
        return Ok(Vec::new());
    }
    let size_of_headers = headers_bound(sections);
    let Some(start) = rva_to_offset_with(sections, size_of_headers, dir.VirtualAddress) else {
        return Ok(Vec::new());
    };
    let end = (start + dir.Size as usize).min(raw_bytes.len());

    let mut entries = Vec::new();
    let mut offset = start;
    while offset + mem::size_of::<IMAGE_BASE_RELOCATION>() <= end {
        let block =
            unsafe { &*(raw_bytes.as_ptr().add(offset) as *const IMAGE_BASE_RELOCATION) };
        if block.SizeOfBlock == 0 {
            break;
        }
        let entry_count =
            (block.SizeOfBlock as usize - mem::size_of::<IMAGE_BASE_RELOCATION>()) / 2;
        let mut entry_offset = offset + mem::size_of::<IMAGE_BASE_RELOCATION>();
        for _ in 0..entry_count {
            if entry_offset + 2 > end {
                break;
            }
            let value = unsafe { *(raw_bytes.as_ptr().add(entry_offset) as *const u16) };
            let kind = (value >> 12) as u32;
            let field_offset = (value & 0x0FFF) as u32;
            let rva = block.VirtualAddress + field_offset;
            match kind {
                IMAGE_REL_BASED_ABSOLUTE => {}
                IMAGE_REL_BASED_HIGHLOW => entries.push(RelocationEntry::HighLow(rva)),
                IMAGE_REL_BASED_DIR64 if matches!(machine, Machine::X64) => {
                    entries.push(RelocationEntry::Dir64(rva))
                }
                _ => {}
            }
            entry_offset += 2;
        }
        offset += block.SizeOfBlock as usize;
    }
    Ok(entries)
}

fn parse_tls(
    raw_bytes: &[u8],
    sections: &[SectionDescriptor],
    data_directories: &[IMAGE_DATA_DIRECTORY],
    machine: Machine,
    _preferred_base: u64,
) -> Option<TlsInfo> {
    let dir = data_directories.get(IMAGE_DIRECTORY_ENTRY_TLS)?;
    if dir.VirtualAddress == 0 {
        return None;
    }
    let size_of_headers = headers_bound(sections);
    let offset = rva_to_offset_with(sections, size_of_headers, dir.VirtualAddress)?;
    match machine {
        Machine::X64 => {
            if offset + mem::size_of::<IMAGE_TLS_DIRECTORY64>() > raw_bytes.len() {
                return None;
            }
            let tls = unsafe {
                &*(raw_bytes.as_ptr().add(offset) as *const IMAGE_TLS_DIRECTORY64)
            };
            Some(TlsInfo {
                start_address_of_raw_data: tls.StartAddressOfRawData,
                end_address_of_raw_data: tls.EndAddressOfRawData,
                address_of_callbacks: tls.AddressOfCallBacks,
            })
        }
        Machine::X86 => {
            if offset + mem::size_of::<IMAGE_TLS_DIRECTORY32>() > raw_bytes.len() {
                return None;
            }
            let tls = unsafe {
                &*(raw_bytes.as_ptr().add(offset) as *const IMAGE_TLS_DIRECTORY32)
            };
            Some(TlsInfo {
                start_address_of_raw_data: tls.StartAddressOfRawData as u64,
                end_address_of_raw_data: tls.EndAddressOfRawData as u64,
                address_of_callbacks: tls.AddressOfCallBacks as u64,
            })
        }
    }
}

fn parse_debug(data_directories: &[IMAGE_DATA_DIRECTORY]) -> Option<DebugInfo> {
    let dir = data_directories.get(IMAGE_DIRECTORY_ENTRY_DEBUG)?;
    if dir.VirtualAddress == 0 {
        return None;
    }
    Some(DebugInfo {
        directory_rva: dir.VirtualAddress,
        directory_size: dir.Size,
    })
}

#[allow(dead_code)]
fn _assert_debug_directory_layout() {
    debug_assert_eq!(mem::size_of::<IMAGE_DEBUG_DIRECTORY>() % 4, 0);
}

/// Caches parsed [`PeImage`]s by canonical path so repeated injections against the same DLL do
/// not re-parse it from disk each time.
static CACHE: Lazy<Mutex<HashMap<PathBuf, PeImage>>> = Lazy::new(|| Mutex::new(HashMap::new()));

/// Loads and parses `path`, reusing a cached parse if this exact path has been seen before.
pub fn load_cached(path: &Path) -> Result<PeImage, SyringeError> {
    let canonical = fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());
    if let Some(cached) = CACHE.lock().unwrap().get(&canonical) {
        return Ok(cached.clone());
    }
    let image = PeImage::from_path(path)?;
    CACHE.lock().unwrap().insert(canonical, image.clone());
    Ok(image)
}

/// Drops a single path from the parse cache, or the whole cache when `path` is `None`.
pub fn invalidate_cache(path: Option<&Path>) {
    match path {
        Some(path) => {
            let canonical = fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());
            CACHE.lock().unwrap().remove(&canonical);
        }
        None => CACHE.lock().unwrap().clear(),
    }
}

/// Verifies a file's digital signature via the OS trust provider (`WinVerifyTrust`).
pub fn verify_signature(path: &Path) -> bool {
    use winapi::{
        shared::guiddef::GUID,
        um::{
            wincrypt::WTD_CHOICE_FILE,
            wintrust::{
                WinVerifyTrust, WINTRUST_ACTION_GENERIC_VERIFY_V2, WINTRUST_DATA,
                WINTRUST_FILE_INFO, WTD_REVOKE_NONE, WTD_STATEACTION_CLOSE,
                WTD_STATEACTION_VERIFY, WTD_UI_NONE,
            },
        },
    };

    let wide: Vec<u16> = OsStr::new(path)
        .encode_wide()
        .chain(std::iter::once(0))
        .collect();

    unsafe {
        let mut file_info: WINTRUST_FILE_INFO = mem::zeroed();
        file_info.cbStruct = mem::size_of::<WINTRUST_FILE_INFO>() as u32;
        file_info.pcwszFilePath = wide.as_ptr();

        let mut trust_data: WINTRUST_DATA = mem::zeroed();
        trust_data.cbStruct = mem::size_of::<WINTRUST_DATA>() as u32;
        trust_data.dwUIChoice = WTD_UI_NONE;
        trust_data.fdwRevocationChecks = WTD_REVOKE_NONE;
        trust_data.dwUnionChoice = WTD_CHOICE_FILE;
        trust_data.dwStateAction = WTD_STATEACTION_VERIFY;
        trust_data.u.pFile = &mut file_info;

        let mut action_id: GUID = WINTRUST_ACTION_GENERIC_VERIFY_V2;
        let result = WinVerifyTrust(
            std::ptr::null_mut::<winapi::shared::windef::HWND__>() as *mut _,
            &mut action_id,
            &mut trust_data as *mut _ as *mut _,
        );

        trust_data.dwStateAction = WTD_STATEACTION_CLOSE;
        WinVerifyTrust(
            std::ptr::null_mut::<winapi::shared::windef::HWND__>() as *mut _,
            &mut action_id,
            &mut trust_data as *mut _ as *mut _,
        );

        result == 0
    }
}

/// Version-info strings pulled from a DLL's resource section.
#[derive(Debug, Clone, Default)]
pub struct VersionInfo {
    pub file_description: Option<String>,
    pub file_version: Option<String>,
    pub company_name: Option<String>,
}

/// Extracts `FileDescription`/`FileVersion`/`CompanyName` via
/// `GetFileVersionInfoW`/`VerQueryValueW`.
pub fn version_info(path: &Path) -> VersionInfo {
    use winapi::um::winver::{GetFileVersionInfoSizeW, GetFileVersionInfoW, VerQueryValueW};

    let wide: Vec<u16> = OsStr::new(path)
        .encode_wide()
        .chain(std::iter::once(0))
        .collect();

    let mut info = VersionInfo::default();
    unsafe {
        let size = GetFileVersionInfoSizeW(wide.as_ptr(), std::ptr::null_mut());
        if size == 0 {
            return info;
        }
        let mut buffer = vec![0u8; size as usize];
        if GetFileVersionInfoW(wide.as_ptr(), 0, size, buffer.as_mut_ptr().cast()) == 0 {
            return info;
        }

        // `040904B0` (US English, Unicode codepage) is the common case; a thorough
        // implementation would enumerate `\VarFileInfo\Translation` first.
        for (field, slot) in [
            ("FileDescription", &mut info.file_description),
            ("FileVersion", &mut info.file_version),
            ("CompanyName", &mut info.company_name),
        ] {
            let sub_block: Vec<u16> = format!("\\StringFileInfo\\040904B0\\{field}")
                .encode_utf16()
                .chain(std::iter::once(0))
                .collect();
            let mut value_ptr: *mut winapi::ctypes::c_void = std::ptr::null_mut();
            let mut value_len: u32 = 0;
            let ok = VerQueryValueW(
                buffer.as_ptr().cast(),
                sub_block.as_ptr(),
                &mut value_ptr,
                &mut value_len,
            );
            if ok != 0 && !value_ptr.is_null() && value_len > 0 {
                let slice =
                    std::slice::from_raw_parts(value_ptr.cast::<u16>(), value_len as usize - 1);
                *slot = Some(String::from_utf16_lossy(slice));
            }
        }
    }
    info
}
