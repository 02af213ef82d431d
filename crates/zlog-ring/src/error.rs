//! Session-level errors.

use std::io;
use std::path::PathBuf;

use crate::claim::{AckError, ClaimError};
use crate::layout::LayoutError;
use crate::record::DecodeError;

/// Errors surfaced by [`RingSession`](crate::RingSession).
#[derive(Debug)]
pub enum SessionError {
    /// The device node could not be opened.
    Open { path: PathBuf, source: io::Error },
    /// `mmap` failed.
    Map(io::Error),
    /// The system reported a nonsensical page size.
    InvalidPageSize,
    /// The mapping order yields a zero or overflowing size.
    InvalidMemOrder(usize),
    /// Header validation failed, including declared/mapped size mismatch.
    Layout(LayoutError),
    /// The claim exchange failed.
    Claim(ClaimError),
    /// Acknowledge was refused.
    Ack(AckError),
    /// A slot could not be decoded.
    Decode(DecodeError),
    /// The session has been closed.
    Closed,
}

impl SessionError {
    /// Whether this is a fatal configuration problem: wrong path, wrong
    /// mapping size, or a ring this crate does not understand. These are
    /// never worth retrying.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            Self::Open { .. }
                | Self::Map(_)
                | Self::InvalidPageSize
                | Self::InvalidMemOrder(_)
                | Self::Layout(_)
        )
    }

    /// Whether this is the declared-vs-mapped size check.
    pub fn is_size_mismatch(&self) -> bool {
        matches!(self, Self::Layout(LayoutError::SizeMismatch { .. }))
    }
}

impl std::fmt::Display for SessionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Open { path, source } => {
                write!(f, "cannot open {}: {}", path.display(), source)
            }
            Self::Map(e) => write!(f, "mmap failed: {}", e),
            Self::InvalidPageSize => write!(f, "invalid system page size"),
            Self::InvalidMemOrder(order) => write!(f, "invalid mapping order {}", order),
            Self::Layout(e) => write!(f, "layout error: {}", e),
            Self::Claim(e) => write!(f, "claim error: {}", e),
            Self::Ack(e) => write!(f, "acknowledge error: {}", e),
            Self::Decode(e) => write!(f, "decode error: {}", e),
            Self::Closed => write!(f, "session is closed"),
        }
    }
}

impl std::error::Error for SessionError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Open { source, .. } => Some(source),
            Self::Map(e) => Some(e),
            Self::Layout(e) => Some(e),
            Self::Claim(e) => Some(e),
            Self::Ack(e) => Some(e),
            Self::Decode(e) => Some(e),
            _ => None,
        }
    }
}

impl From<LayoutError> for SessionError {
    fn from(e: LayoutError) -> Self {
        Self::Layout(e)
    }
}

impl From<ClaimError> for SessionError {
    fn from(e: ClaimError) -> Self {
        Self::Claim(e)
    }
}

impl From<AckError> for SessionError {
    fn from(e: AckError) -> Self {
        Self::Ack(e)
    }
}

impl From<DecodeError> for SessionError {
    fn from(e: DecodeError) -> Self {
        Self::Decode(e)
    }
}
