use std::fmt::Formatter;
use std::{fmt, result};

/// Result type for operations that could result in [CanopyError]
pub type Result<T> = result::Result<T, CanopyError>;

#[derive(Debug)]
pub enum CanopyError {
    /// Canopy has internal invariants that we are unable to ask the
    /// compiler to check for us. This error is raised when one of those
    /// invariants is not verified during execution.
    Internal(String),
    Node(NodeError),
    Io(std::io::Error),
    /// Errors originating from outside Canopy's codebase.
    External(String),
}

#[derive(Debug)]
pub enum NodeError {
    /// The entry cannot fit into half a page, so no split can ever
    /// accommodate it. The caller must treat this as a data error.
    TooLargeEntry { size: usize, max: usize },
    /// The on-page encoders version is not known to the provider.
    VersionMismatch { version: u8 },
}

impl fmt::Display for NodeError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::TooLargeEntry { size, max } => {
                write!(f, "entry of {} bytes exceeds the maximum of {}", size, max)
            }
            Self::VersionMismatch { version } => {
                write!(f, "unsupported encoders version {}", version)
            }
        }
    }
}

impl From<NodeError> for CanopyError {
    fn from(e: NodeError) -> Self {
        CanopyError::Node(e)
    }
}

impl From<std::io::Error> for CanopyError {
    fn from(e: std::io::Error) -> Self {
        CanopyError::Io(e)
    }
}

impl fmt::Display for CanopyError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            CanopyError::Internal(desc) => {
                write!(
                    f,
                    "Internal error: {}. This was likely caused by a bug",
                    desc
                )
            }
            CanopyError::Node(e) => write!(f, "Node error: {}", e),
            CanopyError::Io(e) => write!(f, "Io error: {}", e),
            CanopyError::External(e) => write!(f, "external error: {}", e),
        }
    }
}

impl std::error::Error for CanopyError {}
