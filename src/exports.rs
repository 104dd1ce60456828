use std::collections::HashMap;
use std::ffi::{c_void, CStr};
use std::ptr;

use log::trace;
use windows_sys::Win32::System::Diagnostics::Debug::IMAGE_DIRECTORY_ENTRY_EXPORT;
use windows_sys::Win32::System::SystemServices::{IMAGE_DOS_HEADER, IMAGE_EXPORT_DIRECTORY};

use crate::arch::native;
use crate::errors::ExportError;

/// One export of an in-memory module.
pub struct ExportEntry<'m> {
    /// Export name, if the function is exported by name.
    pub name: Option<&'m CStr>,
    /// Biased ordinal (function-table index plus the directory's ordinal base).
    pub ordinal: u32,
    /// Absolute address of the exported function.
    pub address: *const c_void,
}

/// Decoded export directory of an in-memory module.
///
/// All RVAs have been rebased against the module's load address; the
/// array pointers point straight into the module.
struct ExportDirectory {
    module_base: usize,
    ordinal_base: u32,
    number_of_functions: u32,
    number_of_names: u32,
    functions: *const u32,
    names: *const u32,
    name_ordinals: *const u16,
}

/// Reads the export directory of a module mapped at `module`.
///
/// # Safety
///
/// `module` must point to a PE image laid out in virtual-address form
/// (headers at offset 0, directories reachable via their RVAs).
unsafe fn read_export_directory(module: *const c_void) -> Result<ExportDirectory, ExportError> {
    let base = module as usize;

    let dos = ptr::read_unaligned(base as *const IMAGE_DOS_HEADER);
    let nt = ptr::read_unaligned((base + dos.e_lfanew as usize) as *const native::NtHeaders);

    let dir = nt.OptionalHeader.DataDirectory[IMAGE_DIRECTORY_ENTRY_EXPORT as usize];
    if dir.VirtualAddress == 0 || dir.Size == 0 {
        return Err(ExportError::NoExportTable);
    }

    let edt =
        ptr::read_unaligned((base + dir.VirtualAddress as usize) as *const IMAGE_EXPORT_DIRECTORY);

    Ok(ExportDirectory {
        module_base: base,
        ordinal_base: edt.Base,
        number_of_functions: edt.NumberOfFunctions,
        number_of_names: edt.NumberOfNames,
        functions: (base + edt.AddressOfFunctions as usize) as *const u32,
        names: (base + edt.AddressOfNames as usize) as *const u32,
        name_ordinals: (base + edt.AddressOfNameOrdinals as usize) as *const u16,
    })
}

/// Enumerates the named exports of a module, in name-table order.
///
/// The callback is invoked once per export and may stop the walk early by
/// returning `true`.
///
/// # Safety
///
/// See [`read_export_directory`].
pub unsafe fn walk_exports<F>(module: *const c_void, mut visit: F) -> Result<(), ExportError>
where
    F: FnMut(&ExportEntry<'_>) -> bool,
{
    let dir = read_export_directory(module)?;
    if dir.number_of_functions == 0 || dir.number_of_names == 0 {
        return Err(ExportError::NoExports);
    }

    for i in 0..dir.number_of_names as usize {
        let name_rva = ptr::read_unaligned(dir.names.add(i));
        let name = CStr::from_ptr((dir.module_base + name_rva as usize) as *const i8);

        let index = ptr::read_unaligned(dir.name_ordinals.add(i)) as u32;
        if index >= dir.number_of_functions {
            continue;
        }

        let func_rva = ptr::read_unaligned(dir.functions.add(index as usize));
        if func_rva == 0 {
            continue;
        }

        let entry = ExportEntry {
            name: Some(name),
            ordinal: index + dir.ordinal_base,
            address: (dir.module_base + func_rva as usize) as *const c_void,
        };

        if visit(&entry) {
            break;
        }
    }

    Ok(())
}

/// Resolves an export by name.
///
/// The loaded-module lookup path uses exact, case-sensitive comparison;
/// system-module resolution passes `case_insensitive = true`.
///
/// # Safety
///
/// See [`read_export_directory`].
pub unsafe fn find_by_name(
    module: *const c_void,
    name: &str,
    case_insensitive: bool,
) -> Result<*const c_void, ExportError> {
    let dir = read_export_directory(module)?;
    if dir.number_of_functions == 0 || dir.number_of_names == 0 {
        return Err(ExportError::NoExports);
    }

    for i in 0..dir.number_of_names as usize {
        let name_rva = ptr::read_unaligned(dir.names.add(i));
        let symbol = CStr::from_ptr((dir.module_base + name_rva as usize) as *const i8);

        let matched = if case_insensitive {
            symbol.to_bytes().eq_ignore_ascii_case(name.as_bytes())
        } else {
            symbol.to_bytes() == name.as_bytes()
        };
        if !matched {
            continue;
        }

        let index = ptr::read_unaligned(dir.name_ordinals.add(i)) as u32;
        if index >= dir.number_of_functions {
            return Err(ExportError::InvalidOrdinal);
        }

        let func_rva = ptr::read_unaligned(dir.functions.add(index as usize));
        if func_rva == 0 {
            break;
        }

        return Ok((dir.module_base + func_rva as usize) as *const c_void);
    }

    Err(ExportError::NotFound(name.to_owned()))
}

/// Resolves an export by its biased ordinal.
///
/// `ordinal - ordinal_base` indexes the function table directly; the name
/// table is not consulted.
///
/// # Safety
///
/// See [`read_export_directory`].
pub unsafe fn find_by_ordinal(
    module: *const c_void,
    ordinal: u32,
) -> Result<*const c_void, ExportError> {
    let dir = read_export_directory(module)?;
    if dir.number_of_functions == 0 {
        return Err(ExportError::NoExports);
    }

    let index = ordinal.wrapping_sub(dir.ordinal_base);
    if index >= dir.number_of_functions {
        return Err(ExportError::InvalidOrdinal);
    }

    let func_rva = ptr::read_unaligned(dir.functions.add(index as usize));
    if func_rva == 0 {
        return Err(ExportError::NotFound(format!("#{ordinal}")));
    }

    Ok((dir.module_base + func_rva as usize) as *const c_void)
}

/// Name-to-address dictionary built from one walk over a module's exports.
///
/// Keys are stored lowercased; lookups are case-insensitive. Intended for
/// repeat queries against the same module (e.g. kernel32).
pub struct ExportCache {
    names: HashMap<String, usize>,
}

impl ExportCache {
    /// Walks the module's exports once and indexes them by lowercased name.
    ///
    /// # Safety
    ///
    /// See [`read_export_directory`].
    pub unsafe fn build(module: *const c_void) -> Result<Self, ExportError> {
        let mut names = HashMap::new();

        walk_exports(module, |entry| {
            if let Some(name) = entry.name {
                if let Ok(text) = name.to_str() {
                    names.insert(text.to_ascii_lowercase(), entry.address as usize);
                }
            }
            false
        })?;

        trace!("exports: cached {} names", names.len());
        Ok(Self { names })
    }

    /// Case-insensitive cached lookup.
    pub fn get(&self, name: &str) -> Option<usize> {
        self.names.get(&name.to_ascii_lowercase()).copied()
    }
}
