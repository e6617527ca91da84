//! Runtime error handling
//!
//! The variant runtime never panics across API boundaries. Fallible entry
//! points return `Result<T, Error>` and additionally record the failure in
//! thread-local storage, so that interpreter-facing callers which only see a
//! distinguished return value (`false`, an invalid variant, `-1`) can still
//! retrieve the reason afterwards.
//!
//! ```ignore
//! if divisor.is_zero() {
//!     return Err(set_last_error(Error::DivideByZero));
//! }
//! ```

use std::cell::Cell;

/// Error kinds shared by the variant runtime and the stream core.
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    #[error("allocation failure")]
    OutOfMemory,
    #[error("invalid value")]
    InvalidValue,
    #[error("argument missed")]
    ArgumentMissed,
    #[error("wrong data type")]
    WrongDataType,
    #[error("out of range")]
    OutOfRange,
    #[error("not implemented")]
    NotImplemented,
    #[error("not supported")]
    NotSupported,
    #[error("duplicated")]
    Duplicated,
    #[error("not found")]
    NotFound,
    #[error("overflow")]
    Overflow,
    #[error("divide by zero")]
    DivideByZero,
    #[error("entity gone")]
    EntityGone,
    #[error("I/O failure")]
    IoFailure,
    #[error("broken pipe")]
    BrokenPipe,
    #[error("connection aborted")]
    ConnAborted,
    #[error("connection refused")]
    ConnRefused,
    #[error("TLS failure")]
    TlsFailure,
    #[error("protocol violation")]
    ProtocolViolation,
    #[error("too long")]
    TooLong,
    #[error("too large entity")]
    TooLargeEntity,
    #[error("access denied")]
    AccessDenied,
    #[error("timeout")]
    Timeout,
    #[error("resource temporarily unavailable")]
    Again,
}

thread_local! {
    /// The last error recorded on this thread.
    static LAST_ERROR: Cell<Option<Error>> = const { Cell::new(None) };
}

/// Record `err` as the thread's last error and hand it back, so call sites
/// can write `return Err(set_last_error(Error::NotFound))`.
pub fn set_last_error(err: Error) -> Error {
    LAST_ERROR.with(|e| e.set(Some(err)));
    err
}

/// Peek at the last error without clearing it.
pub fn last_error() -> Option<Error> {
    LAST_ERROR.with(|e| e.get())
}

/// Take (and clear) the last error.
pub fn take_last_error() -> Option<Error> {
    LAST_ERROR.with(|e| e.take())
}

/// Clear any pending error.
pub fn clear_last_error() {
    LAST_ERROR.with(|e| e.set(None));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_and_take_error() {
        clear_last_error();
        assert!(last_error().is_none());

        set_last_error(Error::Duplicated);
        assert_eq!(last_error(), Some(Error::Duplicated));

        assert_eq!(take_last_error(), Some(Error::Duplicated));
        assert!(last_error().is_none());
    }

    #[test]
    fn test_set_returns_its_argument() {
        clear_last_error();
        let e = set_last_error(Error::OutOfRange);
        assert_eq!(e, Error::OutOfRange);
        clear_last_error();
    }

    #[test]
    fn test_display_messages() {
        assert_eq!(Error::Again.to_string(), "resource temporarily unavailable");
        assert_eq!(Error::DivideByZero.to_string(), "divide by zero");
    }
}
