use std::ffi::c_void;
use std::mem;

use log::debug;
use once_cell::sync::OnceCell;
use windows_sys::core::PCSTR;
use windows_sys::Win32::Foundation::{BOOL, FARPROC, HMODULE};
use windows_sys::Win32::System::LibraryLoader::GetModuleHandleA;
use windows_sys::Win32::System::Memory::{
    MEM_COMMIT, MEM_DECOMMIT, MEM_RELEASE, MEM_RESERVE, PAGE_PROTECTION_FLAGS, PAGE_READWRITE,
    VIRTUAL_ALLOCATION_TYPE, VIRTUAL_FREE_TYPE,
};
use windows_sys::Win32::System::SystemInformation::SYSTEM_INFO;

use crate::errors::LoadError;
use crate::exports::ExportCache;

type VirtualAllocFn = unsafe extern "system" fn(
    lpaddress: *const c_void,
    dwsize: usize,
    flallocationtype: VIRTUAL_ALLOCATION_TYPE,
    flprotect: PAGE_PROTECTION_FLAGS,
) -> *mut c_void;

type VirtualFreeFn = unsafe extern "system" fn(
    lpaddress: *mut c_void,
    dwsize: usize,
    dwfreetype: VIRTUAL_FREE_TYPE,
) -> BOOL;

type VirtualProtectFn = unsafe extern "system" fn(
    lpaddress: *const c_void,
    dwsize: usize,
    flnewprotect: PAGE_PROTECTION_FLAGS,
    lpfloldprotect: *mut PAGE_PROTECTION_FLAGS,
) -> BOOL;

type LoadLibraryAFn = unsafe extern "system" fn(lplibfilename: PCSTR) -> HMODULE;

type FreeLibraryFn = unsafe extern "system" fn(hlibmodule: HMODULE) -> BOOL;

type GetProcAddressFn = unsafe extern "system" fn(hmodule: HMODULE, lpprocname: PCSTR) -> FARPROC;

type GetNativeSystemInfoFn = unsafe extern "system" fn(lpsysteminfo: *mut SYSTEM_INFO);

const KERNEL32: &[u8] = b"kernel32.dll\0";

static PLATFORM: OnceCell<Platform> = OnceCell::new();

/// Resolved OS bindings for virtual memory and library loading.
///
/// Function pointers are resolved once per process by walking kernel32's
/// export directory in memory rather than calling `GetProcAddress`, then
/// cached behind a single initialization barrier.
pub struct Platform {
    virtual_alloc: VirtualAllocFn,
    virtual_free: VirtualFreeFn,
    virtual_protect: VirtualProtectFn,
    load_library_a: LoadLibraryAFn,
    free_library: FreeLibraryFn,
    get_proc_address: GetProcAddressFn,
    page_size: usize,
}

impl Platform {
    /// Returns the process-wide bindings, resolving them on first use.
    pub fn get() -> Result<&'static Platform, LoadError> {
        PLATFORM.get_or_try_init(Platform::init)
    }

    fn init() -> Result<Platform, LoadError> {
        let kernel32 = unsafe { GetModuleHandleA(KERNEL32.as_ptr()) };
        if kernel32.is_null() {
            return Err(LoadError::ImportLoadFailed("kernel32.dll".to_owned()));
        }

        let cache = unsafe { ExportCache::build(kernel32 as *const c_void) }
            .map_err(|_| LoadError::ImportLoadFailed("kernel32.dll".to_owned()))?;

        let resolve = |symbol: &str| -> Result<usize, LoadError> {
            cache.get(symbol).ok_or_else(|| LoadError::ImportResolution {
                module: "kernel32.dll".to_owned(),
                symbol: symbol.to_owned(),
            })
        };

        unsafe {
            let get_native_system_info: GetNativeSystemInfoFn =
                mem::transmute(resolve("GetNativeSystemInfo")?);

            let mut info: SYSTEM_INFO = mem::zeroed();
            get_native_system_info(&mut info);
            debug!("platform: page size 0x{:X}", info.dwPageSize);

            Ok(Platform {
                virtual_alloc: mem::transmute::<usize, VirtualAllocFn>(resolve("VirtualAlloc")?),
                virtual_free: mem::transmute::<usize, VirtualFreeFn>(resolve("VirtualFree")?),
                virtual_protect: mem::transmute::<usize, VirtualProtectFn>(resolve(
                    "VirtualProtect",
                )?),
                load_library_a: mem::transmute::<usize, LoadLibraryAFn>(resolve("LoadLibraryA")?),
                free_library: mem::transmute::<usize, FreeLibraryFn>(resolve("FreeLibrary")?),
                get_proc_address: mem::transmute::<usize, GetProcAddressFn>(resolve(
                    "GetProcAddress",
                )?),
                page_size: info.dwPageSize as usize,
            })
        }
    }

    /// Size of a virtual-memory page on this host.
    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Reserves and commits `size` bytes at `address` (0 lets the OS choose),
    /// read-write. Returns null on failure.
    pub fn reserve_commit(&self, address: usize, size: usize) -> *mut u8 {
        unsafe {
            (self.virtual_alloc)(
                address as *const c_void,
                size,
                MEM_RESERVE | MEM_COMMIT,
                PAGE_READWRITE,
            ) as *mut u8
        }
    }

    /// Commits `size` bytes inside an existing reservation, read-write.
    /// Returns null on failure.
    pub fn commit(&self, address: *mut u8, size: usize) -> *mut u8 {
        unsafe { (self.virtual_alloc)(address as *const c_void, size, MEM_COMMIT, PAGE_READWRITE) as *mut u8 }
    }

    /// Changes the protection of a committed range. All-or-nothing.
    pub fn protect(&self, address: *mut u8, size: usize, protection: u32) -> bool {
        let mut old: PAGE_PROTECTION_FLAGS = 0;
        unsafe { (self.virtual_protect)(address as *const c_void, size, protection, &mut old) != 0 }
    }

    /// Decommits a range without releasing the reservation.
    pub fn decommit(&self, address: *mut u8, size: usize) -> bool {
        unsafe { (self.virtual_free)(address as *mut c_void, size, MEM_DECOMMIT) != 0 }
    }

    /// Releases an entire reservation previously returned by
    /// [`Platform::reserve_commit`].
    pub fn release(&self, address: *mut u8) -> bool {
        unsafe { (self.virtual_free)(address as *mut c_void, 0, MEM_RELEASE) != 0 }
    }

    /// Loads a system library by ANSI name. Returns an invalid handle on
    /// failure.
    pub fn load_library(&self, name: PCSTR) -> HMODULE {
        unsafe { (self.load_library_a)(name) }
    }

    /// Drops one reference on a loaded library handle.
    pub fn free_library(&self, module: HMODULE) -> bool {
        unsafe { (self.free_library)(module) != 0 }
    }

    /// Resolves a function in a loaded library by ANSI name.
    pub fn proc_by_name(&self, module: HMODULE, name: PCSTR) -> Option<usize> {
        unsafe { (self.get_proc_address)(module, name).map(|f| f as usize) }
    }

    /// Resolves a function in a loaded library by export ordinal.
    pub fn proc_by_ordinal(&self, module: HMODULE, ordinal: u16) -> Option<usize> {
        // The low word of the name pointer carries the ordinal.
        let name = ordinal as usize as PCSTR;
        unsafe { (self.get_proc_address)(module, name).map(|f| f as usize) }
    }
}

/// Module handles equal to zero or -1 are invalid.
pub fn is_valid_handle(module: HMODULE) -> bool {
    !module.is_null() && module as isize != -1
}
