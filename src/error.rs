use crate::android::apk::ApkZipError;
use crate::android::manifest::ManifestError;
use crate::dex::error::DexError;
use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Result type for protection runs
pub type ProtectResult<T> = std::result::Result<T, ProtectError>;

/// Everything that can stop a protection run. None of these are retried.
#[derive(Error, Debug)]
pub enum ProtectError {
    /// A DEX container could not be decoded or encoded
    #[error("DEX error: {0}")]
    Parse(#[from] DexError),

    #[error("manifest error: {0}")]
    Manifest(#[from] ManifestError),

    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("archive error: {0}")]
    Archive(#[from] ApkZipError),

    /// A structural guarantee of the pipeline does not hold
    #[error("invariant violated: {0}")]
    Invariant(String),

    /// The primary container was deleted but its replacement could not be moved in place
    #[error("primary container {} lost while replacing it", path.display())]
    PrimaryContainerLost {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("native build for {abi} failed: {message}")]
    NativeBuild { abi: String, message: String },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("invalid pattern {pattern:?}: {source}")]
    Pattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },
}

impl ProtectError {
    pub fn invariant(msg: impl Into<String>) -> Self {
        Self::Invariant(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }
}

/// Attach the path an I/O operation was working on.
pub trait IoResultExt<T> {
    fn at_path(self, path: impl Into<PathBuf>) -> ProtectResult<T>;
}

impl<T> IoResultExt<T> for io::Result<T> {
    fn at_path(self, path: impl Into<PathBuf>) -> ProtectResult<T> {
        self.map_err(|source| ProtectError::Io {
            path: path.into(),
            source,
        })
    }
}
