//! Error types for buffer operations.

use std::fmt;

/// Errors that can occur during buffer operations.
///
/// Only metadata-allocation exhaustion is reported through `Result`; every
/// other misuse (invalid positions, sealed-layer resizes, releasing unowned
/// memory) is a precondition violation and panics. A well-formed caller can
/// check preconditions ahead of time with `is_removable`, `is_releasable`,
/// and friends, so propagating them as errors would only add overhead.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// Metadata storage for the operation could not be allocated.
    /// The buffer is unmodified; the caller may retry after freeing memory
    /// elsewhere or shrinking the request.
    ResourceExhausted,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ResourceExhausted => write!(f, "entry metadata allocation failed"),
        }
    }
}

impl std::error::Error for Error {}

impl From<std::collections::TryReserveError> for Error {
    fn from(_: std::collections::TryReserveError) -> Self {
        Self::ResourceExhausted
    }
}

/// Result type for buffer operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        assert_eq!(
            Error::ResourceExhausted.to_string(),
            "entry metadata allocation failed"
        );
    }

    #[test]
    fn test_from_try_reserve() {
        let mut v: Vec<u8> = Vec::new();
        let err = v.try_reserve(usize::MAX).unwrap_err();
        assert_eq!(Error::from(err), Error::ResourceExhausted);
    }
}
