//! Error taxonomy shared by every harness component.

use std::path::PathBuf;

/// Errors produced by topology generation, launching, and trial driving.
#[derive(Debug, thiserror::Error)]
pub enum HarnessError {
    /// Malformed CLI input, inconsistent configuration, or non-positive counts.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The external build step failed or never produced its artifact.
    #[error("build failed: {0}")]
    BuildFailure(String),

    /// A multiplexer or remote-shell invocation failed.
    #[error("launch failed: {0}")]
    LaunchFailure(String),

    /// A workload HTTP call failed or timed out.
    #[error("request failed: {0}")]
    RequestFailure(String),

    /// The sweep was cancelled before it completed.
    #[error("cancelled")]
    Cancelled,

    #[error("io error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl HarnessError {
    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

pub type Result<T, E = HarnessError> = std::result::Result<T, E>;
