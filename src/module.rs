use std::ffi::c_void;
use std::mem;
use std::ptr;

use log::{debug, info, warn};
use windows_sys::Win32::Foundation::HMODULE;
use windows_sys::Win32::System::SystemServices::{DLL_PROCESS_ATTACH, DLL_PROCESS_DETACH};

use crate::errors::LoadError;
use crate::exports;
use crate::pe_executor::{call_dll_entry, call_exe_entry, run_tls_callbacks};
use crate::pe_mapper::{
    apply_relocations, bind_imports, finalize_sections, map_image, MappedImage,
};
use crate::pe_parser::PeImage;
use crate::platform::{is_valid_handle, Platform};

/// A PE image loaded and initialized inside the current process.
///
/// The module exclusively owns its image reservation and the system
/// libraries loaded on its behalf; both are released by
/// [`LoadedModule::dispose`] or on drop. Instances are not safe for
/// concurrent access; callers must serialize externally.
pub struct LoadedModule {
    platform: &'static Platform,
    image: Option<MappedImage>,
    imported_modules: Vec<HMODULE>,
    initialized: bool,
    relocated: bool,
}

impl LoadedModule {
    /// Loads a PE image from raw bytes and prepares it for execution.
    ///
    /// The pipeline maps the image, applies base relocations, binds
    /// imports, fixes section page protections, runs TLS callbacks, and
    /// for DLLs invokes `DllMain(DLL_PROCESS_ATTACH)`. EXE entry points
    /// are stored, not invoked; call [`LoadedModule::call_entry`].
    ///
    /// Any failure releases every resource acquired so far before the
    /// error is returned.
    pub fn load(bytes: &[u8]) -> Result<Self, LoadError> {
        let pe = PeImage::parse(bytes)?;
        let platform = Platform::get()?;

        let image = map_image(&pe, platform)?;

        let relocated = unsafe { apply_relocations(&image, image.delta()) };
        if !relocated {
            warn!("load: image moved but carries no relocation table");
        }

        let imported_modules = unsafe { bind_imports(&image, platform)? };

        let mut module = LoadedModule {
            platform,
            image: Some(image),
            imported_modules,
            initialized: false,
            relocated,
        };

        if let Err(err) = module.finish_load() {
            module.dispose();
            return Err(err);
        }

        Ok(module)
    }

    /// Fixes page protections, runs TLS callbacks, and attaches DLLs.
    fn finish_load(&mut self) -> Result<(), LoadError> {
        let is_dll;
        {
            let Some(image) = &self.image else {
                return Err(LoadError::InvalidState("module has been disposed"));
            };
            is_dll = image.is_dll();

            unsafe {
                finalize_sections(image, self.platform)?;
                run_tls_callbacks(image);

                if is_dll {
                    debug!("load: calling DllMain(DLL_PROCESS_ATTACH)");
                    if call_dll_entry(image, DLL_PROCESS_ATTACH) == 0 {
                        return Err(LoadError::AttachRejected);
                    }
                }
            }
        }

        if is_dll {
            self.initialized = true;
            info!("load: DLL attached");
        }

        Ok(())
    }

    /// Returns `true` if the loaded image is a DLL.
    pub fn is_dll(&self) -> bool {
        self.image.as_ref().map_or(false, |image| image.is_dll())
    }

    /// Base address of the mapped image; null after disposal.
    pub fn base(&self) -> *mut u8 {
        self.image
            .as_ref()
            .map_or(ptr::null_mut(), |image| image.base())
    }

    /// `true` once the DLL entry point accepted process attach.
    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// `true` when the image runs at a usable base, either because it
    /// loaded at its preferred address or because relocations were applied.
    pub fn is_relocated(&self) -> bool {
        self.relocated
    }

    /// System modules loaded to satisfy this image's imports, in import
    /// descriptor order.
    pub fn imported_modules(&self) -> &[HMODULE] {
        &self.imported_modules
    }

    /// Calls the EXE entry point and returns its exit value.
    pub fn call_entry(&self) -> Result<i32, LoadError> {
        let Some(image) = &self.image else {
            return Err(LoadError::InvalidState("module has been disposed"));
        };
        if image.is_dll() {
            return Err(LoadError::InvalidState(
                "entry-point execution requires an EXE image",
            ));
        }
        if !self.relocated {
            return Err(LoadError::InvalidState("image could not be relocated"));
        }

        Ok(unsafe { call_exe_entry(image) })
    }

    /// Resolves an exported function of the loaded DLL by exact name.
    ///
    /// Comparison is case-sensitive. Valid only after the DLL attached
    /// successfully.
    pub fn get_function(&self, name: &str) -> Result<*const c_void, LoadError> {
        let Some(image) = &self.image else {
            return Err(LoadError::InvalidState("module has been disposed"));
        };
        if !image.is_dll() {
            return Err(LoadError::InvalidState(
                "exported functions require a DLL image",
            ));
        }
        if !self.initialized {
            return Err(LoadError::InvalidState("module is not initialized"));
        }

        let address = unsafe { exports::find_by_name(image.base() as *const c_void, name, false)? };
        Ok(address)
    }

    /// Resolves an exported function and casts it to the given signature.
    ///
    /// # Safety
    ///
    /// `F` must be a bare function-pointer type matching the export's
    /// actual signature and calling convention.
    pub unsafe fn get_function_typed<F: Copy>(&self, name: &str) -> Result<F, LoadError> {
        assert_eq!(
            mem::size_of::<F>(),
            mem::size_of::<*const c_void>(),
            "signature type must be a bare function pointer",
        );

        let address = self.get_function(name)?;
        Ok(mem::transmute_copy(&address))
    }

    /// Detaches the image and releases every owned resource.
    ///
    /// Teardown order is the reverse of loading: DLL detach, then the
    /// imported module handles, then the image reservation. Safe to call
    /// more than once; later calls do nothing.
    pub fn dispose(&mut self) {
        let Some(image) = self.image.take() else {
            return;
        };

        if self.initialized {
            debug!("dispose: calling DllMain(DLL_PROCESS_DETACH)");
            unsafe {
                let _ = call_dll_entry(&image, DLL_PROCESS_DETACH);
            }
            self.initialized = false;
        }

        for handle in self.imported_modules.drain(..) {
            if is_valid_handle(handle) {
                self.platform.free_library(handle);
            }
        }

        drop(image);
        info!("dispose: module released");
    }
}

impl Drop for LoadedModule {
    fn drop(&mut self) {
        self.dispose();
    }
}
