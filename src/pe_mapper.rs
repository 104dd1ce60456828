use std::ffi::{c_void, CStr};
use std::mem::size_of;
use std::ptr;

use log::{debug, error, info, trace, warn};
use windows_sys::core::PCSTR;
use windows_sys::Win32::Foundation::HMODULE;
use windows_sys::Win32::System::Diagnostics::Debug::{
    IMAGE_DATA_DIRECTORY, IMAGE_DIRECTORY_ENTRY_BASERELOC, IMAGE_DIRECTORY_ENTRY_IMPORT,
    IMAGE_FILE_HEADER, IMAGE_SCN_CNT_INITIALIZED_DATA, IMAGE_SCN_CNT_UNINITIALIZED_DATA,
    IMAGE_SCN_MEM_DISCARDABLE, IMAGE_SCN_MEM_EXECUTE, IMAGE_SCN_MEM_NOT_CACHED,
    IMAGE_SCN_MEM_READ, IMAGE_SCN_MEM_WRITE, IMAGE_SECTION_HEADER,
};
use windows_sys::Win32::System::Memory::{
    PAGE_EXECUTE, PAGE_EXECUTE_READ, PAGE_EXECUTE_READWRITE, PAGE_EXECUTE_WRITECOPY,
    PAGE_NOACCESS, PAGE_NOCACHE, PAGE_READONLY, PAGE_READWRITE, PAGE_WRITECOPY,
};
use windows_sys::Win32::System::SystemServices::{
    IMAGE_BASE_RELOCATION, IMAGE_IMPORT_BY_NAME, IMAGE_IMPORT_DESCRIPTOR,
    IMAGE_REL_BASED_ABSOLUTE, IMAGE_REL_BASED_DIR64, IMAGE_REL_BASED_HIGHLOW,
};

use crate::arch::{native, HOST_ARCH};
use crate::errors::LoadError;
use crate::pe_parser::{align_down, align_up, PeImage};
use crate::platform::{is_valid_handle, Platform};

/// A PE image laid out in virtual-address form inside the current process.
///
/// Owns the backing reservation; dropping the value releases it.
pub(crate) struct MappedImage {
    platform: &'static Platform,
    base: *mut u8,
    size: usize,
    preferred_base: usize,
    nt_offset: usize,
    section_alignment: usize,
    page_size: usize,
    section_count: usize,
    is_dll: bool,
    entry_rva: u32,
}

impl MappedImage {
    pub fn base(&self) -> *mut u8 {
        self.base
    }

    pub fn is_dll(&self) -> bool {
        self.is_dll
    }

    /// Absolute address of the image entry point.
    pub fn entry_va(&self) -> *const c_void {
        unsafe { self.base.add(self.entry_rva as usize) as *const c_void }
    }

    /// Difference between the actual and the preferred load address.
    pub fn delta(&self) -> isize {
        (self.base as usize).wrapping_sub(self.preferred_base) as isize
    }

    /// Pointer to the NT headers of the mapped copy.
    pub unsafe fn nt_headers(&self) -> *mut native::NtHeaders {
        self.base.add(self.nt_offset) as *mut native::NtHeaders
    }

    /// Pointer to the first entry of the mapped section table.
    ///
    /// The table starts right after the optional header, as sized by the
    /// file header.
    pub unsafe fn first_section(&self) -> *mut IMAGE_SECTION_HEADER {
        let nt = self.nt_headers();
        let optional_size = (*nt).FileHeader.SizeOfOptionalHeader as usize;

        (nt as *mut u8).add(size_of::<u32>() + size_of::<IMAGE_FILE_HEADER>() + optional_size)
            as *mut IMAGE_SECTION_HEADER
    }

    /// Returns a data directory entry of the mapped copy, or an empty entry
    /// when the optional header does not carry that many directories.
    pub unsafe fn directory(&self, index: usize) -> IMAGE_DATA_DIRECTORY {
        let optional = &(*self.nt_headers()).OptionalHeader;
        if (index as u32) < optional.NumberOfRvaAndSizes && index < optional.DataDirectory.len() {
            optional.DataDirectory[index]
        } else {
            IMAGE_DATA_DIRECTORY {
                VirtualAddress: 0,
                Size: 0,
            }
        }
    }
}

impl Drop for MappedImage {
    fn drop(&mut self) {
        if !self.base.is_null() {
            debug!("map: releasing image at {:p} (0x{:X} bytes)", self.base, self.size);
            self.platform.release(self.base);
            self.base = ptr::null_mut();
        }
    }
}

/// Maps a PE image into the current process the way the Windows loader
/// lays it out.
///
/// Steps:
/// 1. Validate the layout against the host
/// 2. Reserve and commit `SizeOfImage` bytes, preferably at `ImageBase`
/// 3. Keep 64-bit images inside a single 4 GiB window
/// 4. Commit and copy the headers (`SizeOfHeaders`)
/// 5. Commit and copy each section to `base + VirtualAddress`
pub(crate) fn map_image(
    pe: &PeImage<'_>,
    platform: &'static Platform,
) -> Result<MappedImage, LoadError> {
    if pe.arch() != HOST_ARCH || pe.machine() != native::HOST_MACHINE {
        return Err(LoadError::BadImageFormat(
            "image architecture does not match the host process",
        ));
    }

    let headers = pe.nt_headers();

    let section_alignment = headers.section_alignment() as usize;
    if section_alignment & 1 != 0 {
        return Err(LoadError::BadImageFormat("odd section alignment"));
    }

    if headers.entry_point_rva() == 0 {
        return Err(LoadError::NoEntryPoint);
    }

    let page_size = platform.page_size();
    let aligned_size = align_up(headers.size_of_image(), page_size);

    // Sections without raw data still occupy one alignment unit in memory.
    let mut last_section_end = 0usize;
    for index in 0..pe.section_count() {
        let section = pe
            .section_header(index)
            .ok_or(LoadError::BadImageFormat("section table truncated"))?;
        let end = section.VirtualAddress as usize
            + if section.SizeOfRawData == 0 {
                section_alignment
            } else {
                section.SizeOfRawData as usize
            };
        last_section_end = last_section_end.max(end);
    }

    if aligned_size != align_up(last_section_end, page_size) {
        return Err(LoadError::BadImageFormat(
            "section layout does not match SizeOfImage",
        ));
    }

    let size_of_headers = headers.size_of_headers();
    if size_of_headers > pe.as_bytes().len() || size_of_headers > aligned_size {
        return Err(LoadError::BadImageFormat("SizeOfHeaders out of bounds"));
    }

    let preferred_base = pe.image_base() as usize;

    debug!(
        "map: SizeOfImage=0x{:X}, SizeOfHeaders=0x{:X}, preferred base 0x{:X}",
        aligned_size, size_of_headers, preferred_base
    );

    let mut base = platform.reserve_commit(preferred_base, aligned_size);
    if base.is_null() {
        debug!("map: preferred base unavailable, letting the OS choose");
        base = platform.reserve_commit(0, aligned_size);
    }
    if base.is_null() {
        return Err(LoadError::OutOfMemory);
    }

    #[cfg(target_pointer_width = "64")]
    {
        // Thunks hold 32-bit offsets in some images; the whole mapping must
        // stay inside one 4 GiB window. Park offenders so the allocator
        // cannot hand the same range back, then release them all.
        let mut parked: Vec<*mut u8> = Vec::new();
        while spans_4gib_boundary(base as usize, aligned_size) {
            trace!("map: allocation at {:p} spans a 4 GiB boundary, retrying", base);
            parked.push(base);

            base = platform.reserve_commit(0, aligned_size);
            if base.is_null() {
                for blocked in &parked {
                    platform.release(*blocked);
                }
                return Err(LoadError::OutOfMemory);
            }
        }
        for blocked in parked {
            platform.release(blocked);
        }
    }

    let image = MappedImage {
        platform,
        base,
        size: aligned_size,
        preferred_base,
        nt_offset: pe.nt_headers_offset(),
        section_alignment,
        page_size,
        section_count: pe.section_count(),
        is_dll: pe.is_dll(),
        entry_rva: headers.entry_point_rva(),
    };

    if platform.commit(base, size_of_headers).is_null() {
        return Err(LoadError::OutOfMemory);
    }

    unsafe {
        ptr::copy_nonoverlapping(pe.as_bytes().as_ptr(), base, size_of_headers);

        // The mapped copy must report where it actually lives.
        if image.delta() != 0 {
            (*image.nt_headers()).OptionalHeader.ImageBase = base as usize as _;
        }

        copy_sections(&image, pe)?;
    }

    info!(
        "map: image mapped at {:p} ({} section(s))",
        base, image.section_count
    );
    Ok(image)
}

unsafe fn copy_sections(image: &MappedImage, pe: &PeImage<'_>) -> Result<(), LoadError> {
    let raw = pe.as_bytes();
    let base = image.base;
    let sections = image.first_section();

    for index in 0..image.section_count {
        let section = &mut *sections.add(index);
        let dest = base.add(section.VirtualAddress as usize);

        if section.SizeOfRawData == 0 {
            if image.section_alignment > 0 {
                // No data in the file, but the section may define
                // uninitialized data. One alignment unit of zeroes.
                if image.platform.commit(dest, image.section_alignment).is_null() {
                    return Err(LoadError::OutOfMemory);
                }
                ptr::write_bytes(dest, 0, image.section_alignment);
                trace!("map: section {} zero-filled at {:p}", index, dest);
            }
        } else {
            if image
                .platform
                .commit(dest, section.SizeOfRawData as usize)
                .is_null()
            {
                return Err(LoadError::OutOfMemory);
            }

            let src = raw.as_ptr().add(section.PointerToRawData as usize);
            ptr::copy_nonoverlapping(src, dest, section.SizeOfRawData as usize);
            trace!("map: section {} copied to {:p}", index, dest);
        }

        // The finalize pass recovers the full address from these low bits.
        section.Misc.PhysicalAddress = (dest as usize & 0xFFFF_FFFF) as u32;
    }

    Ok(())
}

/// Applies base relocations to a mapped image.
///
/// Returns whether the image is usable at its current base: either no move
/// was needed, or every absolute address was adjusted by `delta`. A moved
/// image without a relocation table cannot run.
pub(crate) unsafe fn apply_relocations(image: &MappedImage, delta: isize) -> bool {
    let dir = image.directory(IMAGE_DIRECTORY_ENTRY_BASERELOC as usize);
    if dir.Size == 0 {
        return delta == 0;
    }
    if delta == 0 {
        debug!("reloc: image loaded at preferred base");
        return true;
    }

    debug!("reloc: applying relocations, delta=0x{:X}", delta);

    let base = image.base;
    let reloc_base = base.add(dir.VirtualAddress as usize);
    let reloc_size = dir.Size as usize;

    let mut offset = 0usize;
    while offset < reloc_size {
        let block = ptr::read_unaligned(reloc_base.add(offset) as *const IMAGE_BASE_RELOCATION);
        if block.VirtualAddress == 0 || block.SizeOfBlock == 0 {
            break;
        }

        let entry_count =
            (block.SizeOfBlock as usize - size_of::<IMAGE_BASE_RELOCATION>()) / size_of::<u16>();
        let entries = reloc_base.add(offset + size_of::<IMAGE_BASE_RELOCATION>()) as *const u16;

        for i in 0..entry_count {
            let raw = ptr::read_unaligned(entries.add(i));
            let reloc_type = (raw >> 12) as u32;
            let reloc_offset = (raw & 0x0FFF) as usize;

            let patch = base.add(block.VirtualAddress as usize + reloc_offset);

            match reloc_type {
                IMAGE_REL_BASED_ABSOLUTE => {}
                IMAGE_REL_BASED_HIGHLOW => {
                    let value = ptr::read_unaligned(patch as *const u32);
                    ptr::write_unaligned(patch as *mut u32, value.wrapping_add(delta as u32));
                }
                IMAGE_REL_BASED_DIR64 => {
                    let value = ptr::read_unaligned(patch as *const u64);
                    ptr::write_unaligned(patch as *mut u64, value.wrapping_add(delta as u64));
                }
                other => {
                    debug!(
                        "reloc: ignoring relocation type {} at RVA 0x{:X}",
                        other,
                        block.VirtualAddress as usize + reloc_offset
                    );
                }
            }
        }

        offset += block.SizeOfBlock as usize;
    }

    true
}

/// Resolves the import address table of a mapped image.
///
/// Walks the import descriptor list, loads each referenced module, and
/// writes the resolved function addresses into the IAT. On failure every
/// module loaded by this call is freed before the error is returned.
///
/// Returns the loaded module handles in descriptor order.
pub(crate) unsafe fn bind_imports(
    image: &MappedImage,
    platform: &'static Platform,
) -> Result<Vec<HMODULE>, LoadError> {
    let mut handles: Vec<HMODULE> = Vec::new();

    let dir = image.directory(IMAGE_DIRECTORY_ENTRY_IMPORT as usize);
    if dir.VirtualAddress == 0 || dir.Size == 0 {
        debug!("imports: no import directory present");
        return Ok(handles);
    }

    let base = image.base;
    let descriptors = base.add(dir.VirtualAddress as usize) as *const IMAGE_IMPORT_DESCRIPTOR;
    let descriptor_count = dir.Size as usize / size_of::<IMAGE_IMPORT_DESCRIPTOR>();

    for index in 0..descriptor_count {
        let descriptor = ptr::read_unaligned(descriptors.add(index));
        if descriptor.Name == 0 {
            break;
        }

        let name_ptr = base.add(descriptor.Name as usize) as *const i8;
        let module_name = CStr::from_ptr(name_ptr).to_string_lossy().into_owned();
        trace!("imports: loading '{module_name}'");

        let module = platform.load_library(name_ptr as PCSTR);
        if !is_valid_handle(module) {
            error!("imports: failed to load '{module_name}'");
            unwind_imports(platform, &handles);
            return Err(LoadError::ImportLoadFailed(module_name));
        }
        handles.push(module);

        let oft_rva = descriptor.Anonymous.OriginalFirstThunk;
        let ft_rva = descriptor.FirstThunk;

        if ft_rva == 0 {
            unwind_imports(platform, &handles);
            return Err(LoadError::ImportResolution {
                module: module_name,
                symbol: "<empty address table>".to_owned(),
            });
        }

        let lookup = if oft_rva != 0 {
            base.add(oft_rva as usize) as *const native::ThunkData
        } else {
            warn!("imports: '{module_name}' has no import name table, reading the address table");
            base.add(ft_rva as usize) as *const native::ThunkData
        };
        let write = base.add(ft_rva as usize) as *mut native::ThunkData;

        if let Err(err) = resolve_thunks(platform, module, &module_name, lookup, write, base) {
            unwind_imports(platform, &handles);
            return Err(err);
        }
    }

    info!("imports: bound {} module(s)", handles.len());
    Ok(handles)
}

fn unwind_imports(platform: &Platform, handles: &[HMODULE]) {
    for &handle in handles {
        if is_valid_handle(handle) {
            platform.free_library(handle);
        }
    }
}

unsafe fn resolve_thunks(
    platform: &Platform,
    module: HMODULE,
    module_name: &str,
    mut lookup: *const native::ThunkData,
    mut write: *mut native::ThunkData,
    base: *mut u8,
) -> Result<(), LoadError> {
    loop {
        let value = ptr::read_unaligned(lookup).u1.AddressOfData;
        if value == 0 {
            break;
        }

        let address = if value & native::ORDINAL_FLAG != 0 {
            let ordinal = (value & 0xFFFF) as u16;
            platform
                .proc_by_ordinal(module, ordinal)
                .ok_or_else(|| LoadError::ImportResolution {
                    module: module_name.to_owned(),
                    symbol: format!("#{ordinal}"),
                })?
        } else {
            // An RVA to a hint/name record; the name follows the 2-byte hint.
            let record = base.add(value as usize) as *const IMAGE_IMPORT_BY_NAME;
            let name_ptr = ptr::addr_of!((*record).Name) as *const i8;

            platform
                .proc_by_name(module, name_ptr as PCSTR)
                .ok_or_else(|| LoadError::ImportResolution {
                    module: module_name.to_owned(),
                    symbol: CStr::from_ptr(name_ptr).to_string_lossy().into_owned(),
                })?
        };

        (*write).u1.Function = address as native::ThunkValue;

        lookup = lookup.add(1);
        write = write.add(1);
    }

    Ok(())
}

/// One contiguous run of sections whose pages are finalized together.
struct SectionRun {
    address: usize,
    aligned_address: usize,
    size: usize,
    characteristics: u32,
    last: bool,
}

/// Assigns final page protections and decommits discardable regions.
///
/// Distinct sections may share a page. Such sections are coalesced into a
/// run whose characteristics permit every access any resident member
/// needs; the run is decommitted only if every member is discardable.
pub(crate) unsafe fn finalize_sections(
    image: &MappedImage,
    platform: &'static Platform,
) -> Result<(), LoadError> {
    if image.section_count == 0 {
        return Ok(());
    }

    // The mapper stored each destination's low half; the base supplies the
    // upper half. The mask is all-ones on 32-bit hosts.
    let upper = image.base as usize & !0xFFFF_FFFFusize;

    let optional = &(*image.nt_headers()).OptionalHeader;
    let sections = image.first_section();
    let page_size = image.page_size;

    let first = &*sections;
    let address = first.Misc.PhysicalAddress as usize | upper;
    let mut run = SectionRun {
        address,
        aligned_address: align_down(address, page_size),
        size: real_section_size(first, optional),
        characteristics: first.Characteristics,
        last: false,
    };

    for index in 1..image.section_count {
        let section = &*sections.add(index);
        let address = section.Misc.PhysicalAddress as usize | upper;
        let aligned_address = align_down(address, page_size);
        let size = real_section_size(section, optional);

        // Extend the run while this section starts on a page the run
        // already touches.
        if run.aligned_address == aligned_address || run.address + run.size > aligned_address {
            run.characteristics = merge_characteristics(run.characteristics, section.Characteristics);
            run.size = address + size - run.address;
            continue;
        }

        finalize_run(image, platform, &run)?;
        run = SectionRun {
            address,
            aligned_address,
            size,
            characteristics: section.Characteristics,
            last: false,
        };
    }

    run.last = true;
    finalize_run(image, platform, &run)
}

unsafe fn finalize_run(
    image: &MappedImage,
    platform: &Platform,
    run: &SectionRun,
) -> Result<(), LoadError> {
    if run.size == 0 {
        return Ok(());
    }

    if run.characteristics & IMAGE_SCN_MEM_DISCARDABLE != 0 {
        // Only whole pages no other section lives on can go away.
        if run.address == run.aligned_address
            && (run.last
                || image.section_alignment == image.page_size
                || run.size % image.page_size == 0)
        {
            debug!(
                "protect: decommitting discardable run at 0x{:X} ({} bytes)",
                run.address, run.size
            );
            platform.decommit(run.address as *mut u8, run.size);
        }
        return Ok(());
    }

    let executable = run.characteristics & IMAGE_SCN_MEM_EXECUTE != 0;
    let readable = run.characteristics & IMAGE_SCN_MEM_READ != 0;
    let writable = run.characteristics & IMAGE_SCN_MEM_WRITE != 0;

    let mut protection = protection_flags(executable, readable, writable);
    if run.characteristics & IMAGE_SCN_MEM_NOT_CACHED != 0 {
        protection |= PAGE_NOCACHE;
    }

    trace!(
        "protect: 0x{:X} +0x{:X} -> 0x{:X}",
        run.address,
        run.size,
        protection
    );

    if !platform.protect(run.address as *mut u8, run.size, protection) {
        error!("protect: VirtualProtect failed at 0x{:X}", run.address);
        return Err(LoadError::ProtectionFailed);
    }

    Ok(())
}

/// Merges the characteristics of two sections sharing a page.
///
/// A page stays resident unless every section on it is discardable.
fn merge_characteristics(current: u32, incoming: u32) -> u32 {
    if current & IMAGE_SCN_MEM_DISCARDABLE == 0 || incoming & IMAGE_SCN_MEM_DISCARDABLE == 0 {
        (current | incoming) & !IMAGE_SCN_MEM_DISCARDABLE
    } else {
        current | incoming
    }
}

/// Maps R/W/X section flags to the Win32 page protection.
fn protection_flags(executable: bool, readable: bool, writable: bool) -> u32 {
    match (executable, readable, writable) {
        (false, false, false) => PAGE_NOACCESS,
        (false, false, true) => PAGE_WRITECOPY,
        (false, true, false) => PAGE_READONLY,
        (false, true, true) => PAGE_READWRITE,
        (true, false, false) => PAGE_EXECUTE,
        (true, false, true) => PAGE_EXECUTE_WRITECOPY,
        (true, true, false) => PAGE_EXECUTE_READ,
        (true, true, true) => PAGE_EXECUTE_READWRITE,
    }
}

/// Finalize-time size of a section.
///
/// The mapper overwrote `Misc` with the destination address, so a section
/// without raw data falls back to the optional header's data sizes.
fn real_section_size(section: &IMAGE_SECTION_HEADER, optional: &native::OptionalHeader) -> usize {
    if section.SizeOfRawData != 0 {
        return section.SizeOfRawData as usize;
    }
    if section.Characteristics & IMAGE_SCN_CNT_INITIALIZED_DATA != 0 {
        optional.SizeOfInitializedData as usize
    } else if section.Characteristics & IMAGE_SCN_CNT_UNINITIALIZED_DATA != 0 {
        optional.SizeOfUninitializedData as usize
    } else {
        0
    }
}

#[cfg(target_pointer_width = "64")]
fn spans_4gib_boundary(base: usize, size: usize) -> bool {
    (base >> 32) != ((base + size - 1) >> 32)
}
