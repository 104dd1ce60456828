//! End-to-end tests over synthetic PE images built in memory.
//!
//! The builder lays out a minimal but well-formed PE32+ file: DOS and NT
//! headers, a section table, and whatever payload sections a test needs.
//! Entry points and exports are a few bytes of hand-assembled x64 code,
//! so these tests execute real mapped code and are gated on 64-bit
//! Windows hosts.

#![cfg(all(windows, target_pointer_width = "64"))]

use std::ffi::c_void;
use std::mem::size_of;
use std::ptr;

use pe_loader::{ExportError, LoadError, LoadedModule};
use windows_sys::Win32::System::Diagnostics::Debug::{
    IMAGE_DIRECTORY_ENTRY_BASERELOC, IMAGE_DIRECTORY_ENTRY_EXPORT, IMAGE_DIRECTORY_ENTRY_IMPORT,
    IMAGE_DIRECTORY_ENTRY_TLS, IMAGE_FILE_HEADER, IMAGE_NT_HEADERS64, IMAGE_OPTIONAL_HEADER64,
    IMAGE_SCN_CNT_CODE, IMAGE_SCN_CNT_INITIALIZED_DATA, IMAGE_SCN_MEM_DISCARDABLE,
    IMAGE_SCN_MEM_EXECUTE, IMAGE_SCN_MEM_READ, IMAGE_SCN_MEM_WRITE, IMAGE_SECTION_HEADER,
};
use windows_sys::Win32::System::Memory::{
    VirtualAlloc, VirtualFree, VirtualQuery, MEMORY_BASIC_INFORMATION, MEM_COMMIT, MEM_RELEASE,
    MEM_RESERVE, PAGE_EXECUTE_READ, PAGE_NOACCESS,
};
use windows_sys::Win32::System::SystemServices::{IMAGE_DOS_HEADER, IMAGE_EXPORT_DIRECTORY};

const PAGE: usize = 0x1000;
const FILE_ALIGN: usize = 0x200;
const NT_OFFSET: usize = 0x80;
const HEADERS_SIZE: usize = 0x400;

const IMAGE_FILE_MACHINE_AMD64: u16 = 0x8664;
const IMAGE_FILE_EXECUTABLE_IMAGE: u16 = 0x0002;
const IMAGE_FILE_DLL: u16 = 0x2000;

/// `mov eax, 42; ret`
const RET_42: &[u8] = &[0xB8, 0x2A, 0x00, 0x00, 0x00, 0xC3];
/// `mov eax, 1; ret`
const DLLMAIN_TRUE: &[u8] = &[0xB8, 0x01, 0x00, 0x00, 0x00, 0xC3];
/// `xor eax, eax; ret`
const DLLMAIN_FALSE: &[u8] = &[0x31, 0xC0, 0xC3];
/// `lea eax, [rcx + rdx]; ret`
const ADD_FIRST_TWO_ARGS: &[u8] = &[0x8D, 0x04, 0x11, 0xC3];

struct SectionSpec {
    name: &'static [u8],
    rva: u32,
    data: Vec<u8>,
    characteristics: u32,
}

struct ImageSpec {
    dll: bool,
    image_base: u64,
    entry_rva: u32,
    section_alignment: u32,
    sections: Vec<SectionSpec>,
    directories: Vec<(usize, u32, u32)>,
}

impl ImageSpec {
    fn new(dll: bool, image_base: u64, entry_rva: u32) -> Self {
        Self {
            dll,
            image_base,
            entry_rva,
            section_alignment: PAGE as u32,
            sections: Vec::new(),
            directories: Vec::new(),
        }
    }
}

fn align_up(value: usize, alignment: usize) -> usize {
    (value + alignment - 1) & !(alignment - 1)
}

fn put<T: Copy>(buf: &mut [u8], offset: usize, value: T) {
    unsafe {
        ptr::write_unaligned(buf.as_mut_ptr().add(offset) as *mut T, value);
    }
}

fn build_image(spec: &ImageSpec) -> Vec<u8> {
    let mut placements = Vec::new();
    let mut file_offset = HEADERS_SIZE;
    for section in &spec.sections {
        let raw_size = align_up(section.data.len(), FILE_ALIGN);
        placements.push((file_offset, raw_size));
        file_offset += raw_size;
    }

    let mut buf = vec![0u8; file_offset];

    let mut dos: IMAGE_DOS_HEADER = unsafe { std::mem::zeroed() };
    dos.e_magic = 0x5A4D;
    dos.e_lfanew = NT_OFFSET as i32;
    put(&mut buf, 0, dos);

    let mut nt: IMAGE_NT_HEADERS64 = unsafe { std::mem::zeroed() };
    nt.Signature = 0x0000_4550;
    nt.FileHeader.Machine = IMAGE_FILE_MACHINE_AMD64;
    nt.FileHeader.NumberOfSections = spec.sections.len() as u16;
    nt.FileHeader.SizeOfOptionalHeader = size_of::<IMAGE_OPTIONAL_HEADER64>() as u16;
    nt.FileHeader.Characteristics =
        IMAGE_FILE_EXECUTABLE_IMAGE | if spec.dll { IMAGE_FILE_DLL } else { 0 };

    nt.OptionalHeader.Magic = 0x20B;
    nt.OptionalHeader.AddressOfEntryPoint = spec.entry_rva;
    nt.OptionalHeader.ImageBase = spec.image_base;
    nt.OptionalHeader.SectionAlignment = spec.section_alignment;
    nt.OptionalHeader.FileAlignment = FILE_ALIGN as u32;
    nt.OptionalHeader.MajorSubsystemVersion = 6;
    nt.OptionalHeader.SizeOfHeaders = HEADERS_SIZE as u32;
    nt.OptionalHeader.Subsystem = 3; // console
    nt.OptionalHeader.NumberOfRvaAndSizes = 16;

    let mut last_end = 0usize;
    for (section, (_, raw_size)) in spec.sections.iter().zip(&placements) {
        last_end = last_end.max(section.rva as usize + raw_size);
    }
    nt.OptionalHeader.SizeOfImage = align_up(last_end, PAGE) as u32;

    for &(index, rva, size) in &spec.directories {
        nt.OptionalHeader.DataDirectory[index].VirtualAddress = rva;
        nt.OptionalHeader.DataDirectory[index].Size = size;
    }
    put(&mut buf, NT_OFFSET, nt);

    let table_offset = NT_OFFSET
        + size_of::<u32>()
        + size_of::<IMAGE_FILE_HEADER>()
        + size_of::<IMAGE_OPTIONAL_HEADER64>();

    for (index, (section, &(file_off, raw_size))) in
        spec.sections.iter().zip(&placements).enumerate()
    {
        let mut header: IMAGE_SECTION_HEADER = unsafe { std::mem::zeroed() };
        header.Name[..section.name.len()].copy_from_slice(section.name);
        header.Misc.VirtualSize = section.data.len() as u32;
        header.VirtualAddress = section.rva;
        header.SizeOfRawData = raw_size as u32;
        header.PointerToRawData = file_off as u32;
        header.Characteristics = section.characteristics;
        put(
            &mut buf,
            table_offset + index * size_of::<IMAGE_SECTION_HEADER>(),
            header,
        );

        buf[file_off..file_off + section.data.len()].copy_from_slice(&section.data);
    }

    buf
}

fn text_section(code_blocks: &[(usize, &[u8])]) -> SectionSpec {
    let mut data = vec![0u8; FILE_ALIGN];
    for &(offset, code) in code_blocks {
        data[offset..offset + code.len()].copy_from_slice(code);
    }
    SectionSpec {
        name: b".text",
        rva: 0x1000,
        data,
        characteristics: IMAGE_SCN_CNT_CODE | IMAGE_SCN_MEM_EXECUTE | IMAGE_SCN_MEM_READ,
    }
}

/// A relocation section holding one block with no entries. Keeps images
/// runnable at any base without patching anything.
fn empty_reloc_section(rva: u32) -> SectionSpec {
    let mut data = vec![0u8; FILE_ALIGN];
    put(&mut data, 0, 0x1000u32); // page RVA
    put(&mut data, 4, 8u32); // block size, header only
    SectionSpec {
        name: b".reloc",
        rva,
        data,
        characteristics: IMAGE_SCN_CNT_INITIALIZED_DATA
            | IMAGE_SCN_MEM_READ
            | IMAGE_SCN_MEM_DISCARDABLE,
    }
}

/// An EXE whose entry point returns 42, movable to any base.
fn simple_exe(image_base: u64) -> Vec<u8> {
    let mut spec = ImageSpec::new(false, image_base, 0x1000);
    spec.sections.push(text_section(&[(0, RET_42)]));
    spec.sections.push(empty_reloc_section(0x2000));
    spec.directories
        .push((IMAGE_DIRECTORY_ENTRY_BASERELOC as usize, 0x2000, 8));
    build_image(&spec)
}

/// A DLL exporting `Add(a, b) -> a + b`, with a DllMain that accepts attach.
fn dll_with_add_export(image_base: u64, dll_main: &[u8]) -> Vec<u8> {
    let mut spec = ImageSpec::new(true, image_base, 0x1000);
    spec.sections
        .push(text_section(&[(0, dll_main), (0x10, ADD_FIRST_TWO_ARGS)]));

    let mut edata = vec![0u8; FILE_ALIGN];
    let mut edt: IMAGE_EXPORT_DIRECTORY = unsafe { std::mem::zeroed() };
    edt.Base = 1;
    edt.NumberOfFunctions = 1;
    edt.NumberOfNames = 1;
    edt.AddressOfFunctions = 0x2028;
    edt.AddressOfNames = 0x2030;
    edt.AddressOfNameOrdinals = 0x2038;
    edt.Name = 0x2048;
    put(&mut edata, 0, edt);
    put(&mut edata, 0x28, 0x1010u32); // Add
    put(&mut edata, 0x30, 0x2040u32); // name RVA
    put(&mut edata, 0x38, 0u16);
    edata[0x40..0x44].copy_from_slice(b"Add\0");
    edata[0x48..0x51].copy_from_slice(b"demo.dll\0");
    spec.sections.push(SectionSpec {
        name: b".edata",
        rva: 0x2000,
        data: edata,
        characteristics: IMAGE_SCN_CNT_INITIALIZED_DATA | IMAGE_SCN_MEM_READ,
    });

    spec.sections.push(empty_reloc_section(0x3000));
    spec.directories
        .push((IMAGE_DIRECTORY_ENTRY_EXPORT as usize, 0x2000, 0x60));
    spec.directories
        .push((IMAGE_DIRECTORY_ENTRY_BASERELOC as usize, 0x3000, 8));
    build_image(&spec)
}

type AddFn = unsafe extern "system" fn(i32, i32) -> i32;

#[test]
fn exe_entry_point_returns_its_value() {
    let bytes = simple_exe(0x2_4000_0000);
    let module = LoadedModule::load(&bytes).unwrap();

    assert!(!module.is_dll());
    assert!(module.is_relocated());
    assert!(!module.base().is_null());
    assert_eq!(module.call_entry().unwrap(), 42);
}

#[test]
fn dll_export_round_trips_across_reload() {
    let bytes = dll_with_add_export(0x2_4100_0000, DLLMAIN_TRUE);

    let mut module = LoadedModule::load(&bytes).unwrap();
    assert!(module.is_dll());
    assert!(module.is_initialized());

    let add: AddFn = unsafe { module.get_function_typed("Add") }.unwrap();
    assert_eq!(unsafe { add(2, 3) }, 5);

    module.dispose();

    // The same bytes load again into a fresh module.
    let second = LoadedModule::load(&bytes).unwrap();
    let add: AddFn = unsafe { second.get_function_typed("Add") }.unwrap();
    assert_eq!(unsafe { add(2, 3) }, 5);
}

#[test]
fn export_lookup_is_case_sensitive() {
    let bytes = dll_with_add_export(0x2_4200_0000, DLLMAIN_TRUE);
    let module = LoadedModule::load(&bytes).unwrap();

    let err = module.get_function("add").unwrap_err();
    assert!(matches!(
        err,
        LoadError::ExportLookup(ExportError::NotFound(_))
    ));

    let err = module.get_function("Sub").unwrap_err();
    assert!(matches!(
        err,
        LoadError::ExportLookup(ExportError::NotFound(_))
    ));
}

#[test]
fn rejecting_dll_main_aborts_the_load() {
    let bytes = dll_with_add_export(0x2_4300_0000, DLLMAIN_FALSE);

    let err = LoadedModule::load(&bytes).unwrap_err();
    assert!(matches!(err, LoadError::AttachRejected));
}

#[test]
fn relocations_are_applied_when_the_preferred_base_is_taken() {
    let image_base = 0x2_4400_0000u64;

    // A data slot holding an absolute pointer to the .text section,
    // covered by one DIR64 relocation entry.
    let mut spec = ImageSpec::new(false, image_base, 0x1000);
    spec.sections.push(text_section(&[(0, RET_42)]));

    let mut data = vec![0u8; FILE_ALIGN];
    put(&mut data, 0, image_base + 0x1000);
    spec.sections.push(SectionSpec {
        name: b".data",
        rva: 0x2000,
        data,
        characteristics: IMAGE_SCN_CNT_INITIALIZED_DATA
            | IMAGE_SCN_MEM_READ
            | IMAGE_SCN_MEM_WRITE,
    });

    let mut reloc = vec![0u8; FILE_ALIGN];
    put(&mut reloc, 0, 0x2000u32); // page RVA
    put(&mut reloc, 4, 12u32); // block size
    put(&mut reloc, 8, (10u16 << 12) | 0); // DIR64 at offset 0
    put(&mut reloc, 10, 0u16); // padding entry, absolute
    spec.sections.push(SectionSpec {
        name: b".reloc",
        rva: 0x3000,
        data: reloc,
        characteristics: IMAGE_SCN_CNT_INITIALIZED_DATA
            | IMAGE_SCN_MEM_READ
            | IMAGE_SCN_MEM_DISCARDABLE,
    });
    spec.directories
        .push((IMAGE_DIRECTORY_ENTRY_BASERELOC as usize, 0x3000, 12));
    let bytes = build_image(&spec);

    // Occupy the preferred base so the mapper must pick another one. If
    // something else already lives there the effect is the same.
    let blocker = unsafe {
        VirtualAlloc(
            image_base as *const c_void,
            PAGE,
            MEM_RESERVE,
            PAGE_NOACCESS,
        )
    };

    let module = LoadedModule::load(&bytes).unwrap();
    let base = module.base();
    assert_ne!(base as u64, image_base);
    assert!(module.is_relocated());

    // The patched slot must point at the moved .text section.
    let patched = unsafe { ptr::read_unaligned(base.add(0x2000) as *const u64) };
    assert_eq!(patched, base as u64 + 0x1000);

    assert_eq!(module.call_entry().unwrap(), 42);

    drop(module);
    if !blocker.is_null() {
        unsafe { VirtualFree(blocker, 0, MEM_RELEASE) };
    }
}

#[test]
fn imports_resolve_against_kernel32() {
    let image_base = 0x2_4500_0000u64;
    let mut spec = ImageSpec::new(false, image_base, 0x1000);
    spec.sections.push(text_section(&[(0, RET_42)]));

    // One descriptor importing kernel32!GetTickCount by name.
    let mut idata = vec![0u8; FILE_ALIGN];
    put(&mut idata, 0x00, 0x2030u32); // OriginalFirstThunk
    put(&mut idata, 0x0C, 0x2050u32); // Name
    put(&mut idata, 0x10, 0x2040u32); // FirstThunk
    put(&mut idata, 0x30, 0x2060u64); // INT entry
    put(&mut idata, 0x40, 0x2060u64); // IAT entry
    idata[0x50..0x5D].copy_from_slice(b"kernel32.dll\0");
    put(&mut idata, 0x60, 0u16); // hint
    idata[0x62..0x6F].copy_from_slice(b"GetTickCount\0");
    spec.sections.push(SectionSpec {
        name: b".idata",
        rva: 0x2000,
        data: idata,
        characteristics: IMAGE_SCN_CNT_INITIALIZED_DATA
            | IMAGE_SCN_MEM_READ
            | IMAGE_SCN_MEM_WRITE,
    });

    spec.sections.push(empty_reloc_section(0x3000));
    spec.directories
        .push((IMAGE_DIRECTORY_ENTRY_IMPORT as usize, 0x2000, 40));
    spec.directories
        .push((IMAGE_DIRECTORY_ENTRY_BASERELOC as usize, 0x3000, 8));
    let bytes = build_image(&spec);

    let mut module = LoadedModule::load(&bytes).unwrap();
    assert_eq!(module.imported_modules().len(), 1);

    // The thunk now holds a resolved address instead of the name RVA.
    let thunk = unsafe { ptr::read_unaligned(module.base().add(0x2040) as *const u64) };
    assert_ne!(thunk, 0);
    assert_ne!(thunk, 0x2060);

    module.dispose();
    assert!(module.imported_modules().is_empty());
}

#[test]
fn missing_import_module_fails_the_load() {
    let image_base = 0x2_4600_0000u64;
    let mut spec = ImageSpec::new(false, image_base, 0x1000);
    spec.sections.push(text_section(&[(0, RET_42)]));

    let mut idata = vec![0u8; FILE_ALIGN];
    put(&mut idata, 0x00, 0x2030u32);
    put(&mut idata, 0x0C, 0x2050u32);
    put(&mut idata, 0x10, 0x2040u32);
    put(&mut idata, 0x30, 0x2060u64);
    put(&mut idata, 0x40, 0x2060u64);
    idata[0x50..0x6A].copy_from_slice(b"pe_loader_no_such_mod.dll\0");
    put(&mut idata, 0x70, 0u16);
    idata[0x72..0x77].copy_from_slice(b"Func\0");
    spec.sections.push(SectionSpec {
        name: b".idata",
        rva: 0x2000,
        data: idata,
        characteristics: IMAGE_SCN_CNT_INITIALIZED_DATA
            | IMAGE_SCN_MEM_READ
            | IMAGE_SCN_MEM_WRITE,
    });
    spec.directories
        .push((IMAGE_DIRECTORY_ENTRY_IMPORT as usize, 0x2000, 40));
    let bytes = build_image(&spec);

    let err = LoadedModule::load(&bytes).unwrap_err();
    assert!(matches!(err, LoadError::ImportLoadFailed(_)));
}

#[test]
fn tls_callbacks_run_before_the_entry_point() {
    let image_base = 0x2_4700_0000u64;
    let mut spec = ImageSpec::new(false, image_base, 0x1000);

    // Callback at RVA 0x1020 sets the flag byte at RVA 0x2060:
    //   mov byte [rip + 0x1039], 1; ret
    let callback = &[0xC6, 0x05, 0x39, 0x10, 0x00, 0x00, 0x01, 0xC3];
    spec.sections
        .push(text_section(&[(0, RET_42), (0x20, callback)]));

    let mut data = vec![0u8; FILE_ALIGN];
    put(&mut data, 0x18, image_base + 0x2040); // AddressOfCallBacks
    put(&mut data, 0x10, image_base + 0x2030); // AddressOfIndex
    put(&mut data, 0x40, image_base + 0x1020); // first callback
    spec.sections.push(SectionSpec {
        name: b".data",
        rva: 0x2000,
        data,
        characteristics: IMAGE_SCN_CNT_INITIALIZED_DATA
            | IMAGE_SCN_MEM_READ
            | IMAGE_SCN_MEM_WRITE,
    });

    // The TLS directory's pointers need relocating when the image moves.
    let mut reloc = vec![0u8; FILE_ALIGN];
    put(&mut reloc, 0, 0x2000u32);
    put(&mut reloc, 4, 14u32);
    put(&mut reloc, 8, (10u16 << 12) | 0x18);
    put(&mut reloc, 10, (10u16 << 12) | 0x10);
    put(&mut reloc, 12, (10u16 << 12) | 0x40);
    spec.sections.push(SectionSpec {
        name: b".reloc",
        rva: 0x3000,
        data: reloc,
        characteristics: IMAGE_SCN_CNT_INITIALIZED_DATA
            | IMAGE_SCN_MEM_READ
            | IMAGE_SCN_MEM_DISCARDABLE,
    });

    spec.directories
        .push((IMAGE_DIRECTORY_ENTRY_TLS as usize, 0x2000, 40));
    spec.directories
        .push((IMAGE_DIRECTORY_ENTRY_BASERELOC as usize, 0x3000, 14));
    let bytes = build_image(&spec);

    let module = LoadedModule::load(&bytes).unwrap();

    let flag = unsafe { ptr::read_volatile(module.base().add(0x2060)) };
    assert_eq!(flag, 1);
    assert_eq!(module.call_entry().unwrap(), 42);
}

#[test]
fn discardable_sections_are_decommitted_and_code_stays_resident() {
    let bytes = simple_exe(0x2_4800_0000);
    let module = LoadedModule::load(&bytes).unwrap();
    let base = module.base();

    let query = |address: *const u8| -> MEMORY_BASIC_INFORMATION {
        let mut info: MEMORY_BASIC_INFORMATION = unsafe { std::mem::zeroed() };
        let written = unsafe {
            VirtualQuery(
                address as *const c_void,
                &mut info,
                size_of::<MEMORY_BASIC_INFORMATION>(),
            )
        };
        assert_ne!(written, 0);
        info
    };

    // .text pages carry their final protection.
    let text = query(unsafe { base.add(0x1000) });
    assert_eq!(text.State, MEM_COMMIT);
    assert_eq!(text.Protect, PAGE_EXECUTE_READ);

    // The discardable .reloc page is gone.
    let reloc = query(unsafe { base.add(0x2000) });
    assert_eq!(reloc.State, MEM_RESERVE);

    assert_eq!(module.call_entry().unwrap(), 42);
}

#[test]
fn disposal_is_idempotent() {
    let bytes = simple_exe(0x2_4900_0000);
    let mut module = LoadedModule::load(&bytes).unwrap();
    assert!(!module.base().is_null());

    module.dispose();
    assert!(module.base().is_null());
    assert!(module.imported_modules().is_empty());

    module.dispose();
    assert!(module.base().is_null());

    let err = module.call_entry().unwrap_err();
    assert!(matches!(err, LoadError::InvalidState(_)));
}

#[test]
fn operations_reject_the_wrong_image_kind() {
    let exe = LoadedModule::load(&simple_exe(0x2_4A00_0000)).unwrap();
    let err = exe.get_function("Add").unwrap_err();
    assert!(matches!(err, LoadError::InvalidState(_)));

    let dll = LoadedModule::load(&dll_with_add_export(0x2_4B00_0000, DLLMAIN_TRUE)).unwrap();
    let err = dll.call_entry().unwrap_err();
    assert!(matches!(err, LoadError::InvalidState(_)));
}

#[test]
fn malformed_headers_are_rejected() {
    let bytes = simple_exe(0x2_4C00_0000);

    // Truncated before the DOS header completes.
    let err = LoadedModule::load(&bytes[..0x20]).unwrap_err();
    assert!(matches!(err, LoadError::BadImageFormat(_)));

    // Truncated inside the NT headers.
    let err = LoadedModule::load(&bytes[..NT_OFFSET + 0x10]).unwrap_err();
    assert!(matches!(err, LoadError::BadImageFormat(_)));

    // Wrong DOS magic.
    let mut bad = bytes.clone();
    bad[0] = b'Y';
    let err = LoadedModule::load(&bad).unwrap_err();
    assert!(matches!(err, LoadError::BadImageFormat(_)));

    // Wrong NT signature.
    let mut bad = bytes.clone();
    bad[NT_OFFSET] = b'X';
    let err = LoadedModule::load(&bad).unwrap_err();
    assert!(matches!(err, LoadError::BadImageFormat(_)));

    // x86 machine in a 64-bit process.
    let mut bad = bytes.clone();
    put(&mut bad, NT_OFFSET + 4, 0x014Cu16);
    let err = LoadedModule::load(&bad).unwrap_err();
    assert!(matches!(err, LoadError::BadImageFormat(_)));

    // SizeOfImage no longer matches the section layout.
    let opt_offset = NT_OFFSET + size_of::<u32>() + size_of::<IMAGE_FILE_HEADER>();
    let mut bad = bytes.clone();
    let size_of_image_offset = opt_offset + 56;
    let inflated = u32::from_le_bytes(bad[size_of_image_offset..size_of_image_offset + 4].try_into().unwrap()) + PAGE as u32;
    put(&mut bad, size_of_image_offset, inflated);
    let err = LoadedModule::load(&bad).unwrap_err();
    assert!(matches!(err, LoadError::BadImageFormat(_)));
}

#[test]
fn zero_entry_point_is_rejected() {
    let mut spec = ImageSpec::new(false, 0x2_4D00_0000, 0);
    spec.sections.push(text_section(&[(0, RET_42)]));
    let bytes = build_image(&spec);

    let err = LoadedModule::load(&bytes).unwrap_err();
    assert!(matches!(err, LoadError::NoEntryPoint));
}

#[test]
fn odd_section_alignment_is_rejected() {
    let mut spec = ImageSpec::new(false, 0x2_4E00_0000, 0x1000);
    spec.sections.push(text_section(&[(0, RET_42)]));
    spec.section_alignment = 0x1001;
    let bytes = build_image(&spec);

    let err = LoadedModule::load(&bytes).unwrap_err();
    assert!(matches!(err, LoadError::BadImageFormat(_)));
}
