use std::ffi::c_void;
use std::mem;
use std::ptr;

use log::debug;
use windows_sys::Win32::System::Diagnostics::Debug::IMAGE_DIRECTORY_ENTRY_TLS;
use windows_sys::Win32::System::SystemServices::{DLL_PROCESS_ATTACH, PIMAGE_TLS_CALLBACK};

use crate::arch::native;
use crate::pe_mapper::MappedImage;

/// DLL entry point type (`DllMain`).
pub type DllMainFn =
    unsafe extern "system" fn(hinst_dll: *mut c_void, reason: u32, reserved: *mut c_void) -> i32;

/// EXE entry point type (CRT startup).
pub type ExeEntryFn = unsafe extern "system" fn() -> i32;

/// Executes TLS callbacks for the mapped image.
///
/// TLS callbacks (if present) must run before the entry point. The
/// callback array is null-terminated and already holds absolute addresses
/// once relocations have been applied.
pub(crate) unsafe fn run_tls_callbacks(image: &MappedImage) {
    let dir = image.directory(IMAGE_DIRECTORY_ENTRY_TLS as usize);
    if dir.VirtualAddress == 0 {
        return;
    }

    let base = image.base();
    let tls = base.add(dir.VirtualAddress as usize) as *const native::TlsDirectory;

    let mut callback = (*tls).AddressOfCallBacks as *const PIMAGE_TLS_CALLBACK;
    if callback.is_null() {
        return;
    }

    while let Some(func) = *callback {
        debug!("tls: executing callback");
        func(base as *mut c_void, DLL_PROCESS_ATTACH, ptr::null_mut());
        callback = callback.add(1);
    }
}

/// Invokes the DLL entry point with the given reason and returns its
/// BOOL result.
pub(crate) unsafe fn call_dll_entry(image: &MappedImage, reason: u32) -> i32 {
    let entry: DllMainFn = mem::transmute(image.entry_va());
    entry(image.base() as *mut c_void, reason, ptr::null_mut())
}

/// Transfers execution to the EXE entry point and returns its exit value.
pub(crate) unsafe fn call_exe_entry(image: &MappedImage) -> i32 {
    let entry: ExeEntryFn = mem::transmute(image.entry_va());
    debug!("exec: calling EXE entry point");
    entry()
}
