#![allow(unsafe_op_in_unsafe_fn)]
//! In-memory PE loader.
//!
//! This crate maps and executes PE images (EXE or DLL) inside the current
//! process without writing them to disk and without the operating-system
//! image loader: it reserves virtual memory, lays out sections, applies
//! base relocations, binds imports against system modules, fixes page
//! protections, runs TLS callbacks, and invokes the entry point.
//!
//! [`LoadedModule`] is the main entry: load from bytes, look up exports,
//! call the entry point, dispose deterministically. The [`run`] and
//! [`run_with_export`] helpers cover the common load-from-disk case.

use std::ffi::c_void;
use std::fs;
use std::path::Path;
use std::ptr;

use log::info;

pub mod arch;
pub mod errors;
pub mod exports;
pub mod module;
pub mod platform;

mod pe_executor;
mod pe_mapper;
mod pe_parser;

pub use crate::errors::{AppError, ExportError, LoadError};
pub use crate::module::LoadedModule;
pub use crate::pe_parser::{NtHeaders, PeImage};

/// Loads and executes a PE image from disk.
///
/// If the image is an EXE, its entry point is invoked and the exit value
/// logged. If it is a DLL, it is attached via `DllMain(DLL_PROCESS_ATTACH)`.
pub fn run(path: impl AsRef<Path>) -> Result<(), AppError> {
    run_internal(path.as_ref(), None)
}

/// Loads a DLL from disk, attaches it, and executes a named export.
pub fn run_with_export(path: impl AsRef<Path>, export: impl Into<String>) -> Result<(), AppError> {
    run_internal(path.as_ref(), Some(export.into()))
}

fn run_internal(path: &Path, export: Option<String>) -> Result<(), AppError> {
    let bytes = fs::read(path)?;
    let mut module = LoadedModule::load(&bytes)?;

    if module.is_dll() {
        if let Some(name) = export {
            // Exports are executed with the conventional worker signature.
            let func: unsafe extern "system" fn(*mut c_void) -> u32 =
                unsafe { module.get_function_typed(&name)? };

            info!("executing exported function '{name}'");
            let code = unsafe { func(ptr::null_mut()) };
            info!("export '{name}' returned {code}");
        }
    } else {
        let code = module.call_entry()?;
        info!("entry point returned {code}");
    }

    module.dispose();
    Ok(())
}
