#![forbid(unsafe_code)]

//! Error type shared by the acquisition pipeline.

use std::fmt;

/// Failure categories surfaced by the pipeline. The HTTP and CLI layers only
/// ever show `message`, but the kind lets tests and callers distinguish a
/// timeout from a missing tool without parsing strings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Missing or invalid required input (empty URL, bad username).
    Validation,
    /// Directory creation, permission, or disk-space failure.
    Storage,
    /// External tool missing or exited non-zero.
    Process,
    /// Wall-clock budget exceeded.
    Timeout,
    /// Both audio extraction strategies failed.
    Extraction,
    /// Sidecar/description/thumbnail write failure.
    Io,
    /// Requested media, description, or download output absent.
    NotFound,
}

#[derive(Debug, Clone)]
pub struct PipelineError {
    pub kind: ErrorKind,
    pub message: String,
}

impl PipelineError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Validation, message)
    }

    pub fn storage(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Storage, message)
    }

    pub fn process(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Process, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Timeout, message)
    }

    pub fn extraction(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Extraction, message)
    }

    pub fn io(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Io, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, message)
    }
}

impl fmt::Display for PipelineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for PipelineError {}

pub type Result<T> = std::result::Result<T, PipelineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_shows_message_only() {
        let err = PipelineError::timeout("download exceeded 1800 seconds");
        assert_eq!(err.to_string(), "download exceeded 1800 seconds");
        assert_eq!(err.kind, ErrorKind::Timeout);
    }

    #[test]
    fn constructors_set_kind() {
        assert_eq!(PipelineError::process("x").kind, ErrorKind::Process);
        assert_eq!(PipelineError::not_found("x").kind, ErrorKind::NotFound);
        assert_eq!(PipelineError::extraction("x").kind, ErrorKind::Extraction);
    }
}
