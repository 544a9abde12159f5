use crate::parsers::BlendParseError;
use std::io;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, BlendError>;

/// Status of a successful read.
pub const STATUS_OK: i32 = 0;

/// Everything that stops a file from loading. Each variant maps to one negative status code.
#[derive(Debug, Error)]
pub enum BlendError {
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
    /// The reader was asked to do something its state doesn't allow.
    #[error("reader cannot {0} in its current state")]
    InvalidState(&'static str),
    #[error("chunk at {0:#x} could not be added to the chunk map")]
    InvalidInsert(u64),
    #[error("could not allocate {0} bytes")]
    BadAlloc(usize),
    #[error("unexpected end of data")]
    InvalidRead,
    #[error("chunk header has a corrupt length")]
    InvalidLength,
    #[error("unrecognized file header")]
    InvalidHeader,
    #[error("schema could not be read or linked: {0}")]
    LinkFailed(#[source] BlendParseError),
    #[error("file has no schema chunk")]
    MissingSchema,
}

impl BlendError {
    /// The status code of this error, always negative.
    pub fn status(&self) -> i32 {
        match self {
            BlendError::Io(_) | BlendError::InvalidState(_) => -1,
            BlendError::InvalidInsert(_) => -2,
            BlendError::BadAlloc(_) => -3,
            BlendError::InvalidRead => -4,
            BlendError::InvalidLength => -5,
            BlendError::InvalidHeader => -6,
            BlendError::LinkFailed(_) | BlendError::MissingSchema => -7,
        }
    }
}

/// Allocates a zeroed buffer, reporting failure instead of aborting.
pub(crate) fn try_zeroed(len: usize) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    buf.try_reserve_exact(len).map_err(|_| BlendError::BadAlloc(len))?;
    buf.resize(len, 0);
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes() {
        assert_eq!(BlendError::InvalidHeader.status(), -6);
        assert_eq!(BlendError::InvalidRead.status(), -4);
        assert_eq!(BlendError::InvalidLength.status(), -5);
        assert_eq!(BlendError::MissingSchema.status(), -7);
        assert_eq!(BlendError::LinkFailed(BlendParseError::NoStructs).status(), -7);
        assert!(BlendError::BadAlloc(1).status() < STATUS_OK);
    }

    #[test]
    fn huge_allocation_is_reported() {
        assert!(matches!(try_zeroed(usize::MAX), Err(BlendError::BadAlloc(_))));
        assert_eq!(try_zeroed(4).unwrap(), vec![0; 4]);
    }
}
