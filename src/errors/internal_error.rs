use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
#[allow(clippy::enum_variant_names)]
pub enum InternalError {
    #[error("Failed to create directory {path:?}")]
    CreateDirectoryError { path: PathBuf },
    #[error("Failed to write to file {path:?}")]
    WriteFileError { path: PathBuf },

    #[error("Failed to access file {path:?}")]
    AccessFileError { path: PathBuf },
    #[error("Failed to read file {path:?}")]
    ReadFileError { path: PathBuf },

    #[error("Failed to rename file from {from_path:?} to {to_path:?}")]
    RenameFileError {
        from_path: PathBuf,
        to_path: PathBuf,
    },

    #[error("Failed to delete file {path:?}")]
    DeleteFileError { path: PathBuf },

    #[error("Failed to seek in file {path:?}")]
    FileSeekError { path: PathBuf },

    #[error("Failed to read metadata from {path:?}")]
    ReadMetadataError { path: PathBuf },

    #[error("Failed to broadcast engine event: {0}")]
    BroadcastEventError(String),
}
