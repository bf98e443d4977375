use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CoriumError {
    #[error("missing configuration source")]
    MissingConfiguration,

    #[error("{message}: {source}")]
    PermissionDenied {
        message: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid instance id: {0}")]
    InvalidInstance(i32),

    #[error("unknown package: {0}")]
    UnknownPackage(String),

    #[error("unknown platform: {0}:{1}")]
    UnknownPlatform(String, String),

    #[error("unknown board: {0}")]
    UnknownBoard(String),

    #[error("invalid FQBN: {0}")]
    InvalidFqbn(String),

    #[error("invalid config option: {0}")]
    InvalidConfigOption(String),

    #[error("platform {0}:{1} is not installed")]
    PlatformNotInstalled(String, String),

    #[error("invalid URL: {0}")]
    InvalidUrl(String),

    #[error("downloading {url}: {message}")]
    FailedDownload { url: String, message: String },

    #[error("checksum mismatch for {}", file.display())]
    ChecksumMismatch { file: PathBuf },

    #[error("invalid checksum: {0}")]
    InvalidChecksum(String),

    #[error("signature verification failed for {file}")]
    SignatureVerificationFailed { file: String },

    #[error("bad archive layout in {}: {message}", archive.display())]
    ArchiveLayout { archive: PathBuf, message: String },

    #[error("installing {what}: {message}")]
    FailedInstall { what: String, message: String },

    #[error("uninstalling {what}: {message}")]
    FailedUninstall { what: String, message: String },

    /// The uninstall of a superseded release failed and the follow-up
    /// uninstall of the freshly installed release failed too. The installed
    /// set now holds both versions and needs manual repair.
    #[error(
        "rollback of {platform} failed while replacing {old_version} with {new_version}: {message}"
    )]
    RollbackFailed {
        platform: String,
        old_version: String,
        new_version: String,
        message: String,
    },

    #[error("invalid package index {path}: {source}")]
    InvalidIndex {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Error: {0}")]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, CoriumError>;
