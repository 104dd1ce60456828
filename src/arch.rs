/// Host architecture of the current process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeArch {
    X86,
    X64,
}

impl std::fmt::Display for PeArch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PeArch::X86 => write!(f, "x86"),
            PeArch::X64 => write!(f, "x64"),
        }
    }
}

#[cfg(target_pointer_width = "64")]
pub const HOST_ARCH: PeArch = PeArch::X64;

#[cfg(target_pointer_width = "32")]
pub const HOST_ARCH: PeArch = PeArch::X86;

/// Native (host) architecture specific PE definitions.
///
/// Everything in this module is selected at compile time via `cfg`,
/// so no runtime branching is involved.
pub mod native {
    #[cfg(target_pointer_width = "64")]
    mod imp {
        use windows_sys::Win32::System::Diagnostics::Debug::{
            IMAGE_NT_HEADERS64,
            IMAGE_OPTIONAL_HEADER64,
        };
        use windows_sys::Win32::System::SystemServices::{
            IMAGE_ORDINAL_FLAG64,
            IMAGE_TLS_DIRECTORY64,
        };
        use windows_sys::Win32::System::WindowsProgramming::IMAGE_THUNK_DATA64;

        pub type NtHeaders = IMAGE_NT_HEADERS64;
        pub type OptionalHeader = IMAGE_OPTIONAL_HEADER64;
        pub type ThunkData = IMAGE_THUNK_DATA64;
        pub type ThunkValue = u64;
        pub type TlsDirectory = IMAGE_TLS_DIRECTORY64;

        pub const ORDINAL_FLAG: ThunkValue = IMAGE_ORDINAL_FLAG64;
        pub const HOST_MACHINE: u16 = 0x8664; // IMAGE_FILE_MACHINE_AMD64
    }

    #[cfg(target_pointer_width = "32")]
    mod imp {
        use windows_sys::Win32::System::Diagnostics::Debug::{
            IMAGE_NT_HEADERS32,
            IMAGE_OPTIONAL_HEADER32,
        };
        use windows_sys::Win32::System::SystemServices::{
            IMAGE_ORDINAL_FLAG32,
            IMAGE_TLS_DIRECTORY32,
        };
        use windows_sys::Win32::System::WindowsProgramming::IMAGE_THUNK_DATA32;

        pub type NtHeaders = IMAGE_NT_HEADERS32;
        pub type OptionalHeader = IMAGE_OPTIONAL_HEADER32;
        pub type ThunkData = IMAGE_THUNK_DATA32;
        pub type ThunkValue = u32;
        pub type TlsDirectory = IMAGE_TLS_DIRECTORY32;

        pub const ORDINAL_FLAG: ThunkValue = IMAGE_ORDINAL_FLAG32;
        pub const HOST_MACHINE: u16 = 0x014C; // IMAGE_FILE_MACHINE_I386
    }

    pub use imp::*;
}
