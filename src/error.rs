//! Error kinds for the update engine.
//!
//! Mirrors the seven kinds called out by the design: configuration,
//! network, integrity, path, resource, state and filesystem-fault errors.
//! Library code returns `OtaError`; the CLI binary wraps it in `anyhow`.

use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum OtaError {
    #[error("config error: {0}")]
    Config(String),

    #[error("network error: {0}")]
    Network(String),

    #[error("integrity error: {0}")]
    Integrity(String),

    #[error("path error: {0}: {1}")]
    Path(String, PathBuf),

    #[error("resource error: {0}")]
    Resource(String),

    #[error("state error: {0}")]
    State(String),

    #[error("filesystem fault at {path}: {source}")]
    IoFault {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl OtaError {
    pub fn io_fault(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        OtaError::IoFault {
            path: path.into(),
            source,
        }
    }

    /// True for kinds that mean "this artifact or the target filesystem is
    /// untrustworthy", which the engine treats as a validation abort rather
    /// than propagating as an unexpected failure.
    pub fn is_swap_fatal(&self) -> bool {
        matches!(
            self,
            OtaError::Integrity(_) | OtaError::IoFault { .. } | OtaError::Path(_, _)
        )
    }
}

pub type Result<T> = std::result::Result<T, OtaError>;
