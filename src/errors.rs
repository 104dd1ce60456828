use thiserror::Error;

/// Loader pipeline errors.
///
/// These represent failures while parsing, mapping, fixing up, or
/// executing a PE image inside the current process.
#[derive(Debug, Error)]
pub enum LoadError {
    #[error("invalid PE image: {0}")]
    BadImageFormat(&'static str),

    #[error("image has no entry point")]
    NoEntryPoint,

    #[error("failed to reserve memory for the image")]
    OutOfMemory,

    #[error("failed to load imported module '{0}'")]
    ImportLoadFailed(String),

    #[error("failed to resolve import '{symbol}' from '{module}'")]
    ImportResolution { module: String, symbol: String },

    #[error("failed to change page protection")]
    ProtectionFailed,

    #[error("DLL entry point rejected process attach")]
    AttachRejected,

    #[error("export lookup failed")]
    ExportLookup(#[from] ExportError),

    #[error("invalid module state: {0}")]
    InvalidState(&'static str),
}

/// Export directory lookup errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExportError {
    #[error("module has no export table")]
    NoExportTable,

    #[error("module exports no functions")]
    NoExports,

    #[error("export ordinal is out of range")]
    InvalidOrdinal,

    #[error("exported function not found: {0}")]
    NotFound(String),
}

/// Top-level application errors.
///
/// This enum represents failures that occur during orchestration
/// (file I/O, loading, execution).
#[derive(Debug, Error)]
pub enum AppError {
    #[error("I/O error while reading PE file")]
    Io(#[from] std::io::Error),

    #[error("failed to load PE image")]
    Load(#[from] LoadError),
}
