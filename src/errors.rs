//! Crate-wide error type.
use std::fmt;

#[derive(Debug)]
pub enum Error {
    Io(std::io::Error),
    /// A page's stored bytes failed to decode (bad UTF-8 or malformed
    /// JSON). Non-propagating: callers recover by treating the page as
    /// empty, but the failure is still logged under this variant.
    Corrupt(String),
    /// `max_keys_per_node` (or another constructor argument) failed validation.
    Validation(String),
    /// A node's serialized form did not fit in a page, or could not be encoded.
    Encoding(String),
    /// Any other storage-layer failure (lock, missing page, bad cache state).
    Storage(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::Io(e) => write!(f, "IO error: {}", e),
            Error::Corrupt(msg) => write!(f, "Corrupt page: {}", msg),
            Error::Validation(msg) => write!(f, "Validation error: {}", msg),
            Error::Encoding(msg) => write!(f, "Encoding error: {}", msg),
            Error::Storage(msg) => write!(f, "Storage error: {}", msg),
        }
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Error {
        Error::Io(err)
    }
}

/// Builds an [`Error`] the way the rest of the crate constructs one: pick a
/// variant, format a message.
macro_rules! err {
    ($variant:ident, $($arg:tt)*) => {
        $crate::errors::Error::$variant(format!($($arg)*))
    };
}

pub(crate) use err;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_messages_include_context() {
        let e = err!(Validation, "max_keys_per_node must be >= 3, got {}", 2);
        assert_eq!(
            e.to_string(),
            "Validation error: max_keys_per_node must be >= 3, got 2"
        );
    }

    #[test]
    fn io_error_converts_via_from() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        let e: Error = io_err.into();
        assert!(matches!(e, Error::Io(_)));
    }

    #[test]
    fn corrupt_variant_formats_with_context() {
        let e = err!(Corrupt, "page {} failed to parse as JSON", 4);
        assert_eq!(e.to_string(), "Corrupt page: page 4 failed to parse as JSON");
    }
}
