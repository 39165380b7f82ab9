//! Sandboxed filesystem access for the file API.
//!
//! Every user-supplied path goes through [`PathSandbox::resolve`] before any
//! syscall touches it. Directory downloads are zipped on the fly and uploaded
//! zip archives are extracted in place.

pub mod archive;
pub mod detection;
pub mod sandbox;
pub mod store;

pub use archive::{unzip, zip_directory};
pub use detection::{detect_content_type, is_text_content};
pub use sandbox::PathSandbox;
pub use store::{DownloadSource, FileEntry, FileStore, UploadOutcome};

/// Errors from file API operations.
#[derive(Debug, thiserror::Error)]
pub enum FileError {
    /// The requested path resolves outside the sandbox root.
    #[error("Access denied: {path}")]
    AccessDenied { path: String },

    #[error("Path not found: {path}")]
    NotFound { path: String },

    #[error("Invalid request: {0}")]
    InvalidInput(String),

    /// Text read requested on a binary file.
    #[error("cannot read binary file")]
    Binary { mime: String },

    #[error("Archive error: {0}")]
    Archive(#[from] zip::result::ZipError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<walkdir::Error> for FileError {
    fn from(e: walkdir::Error) -> Self {
        FileError::Io(e.into())
    }
}

/// Result type for file operations.
pub type Result<T> = std::result::Result<T, FileError>;
