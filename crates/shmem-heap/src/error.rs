use std::fmt;

/// Error raised by region, heap and accessor operations.
#[derive(Debug)]
pub struct Error {
    kind: ErrorKind,
}

impl Error {
    #[inline]
    pub(crate) const fn new(kind: ErrorKind) -> Self {
        Self { kind }
    }

    /// The kind of error that occurred.
    #[inline]
    pub fn kind(&self) -> &ErrorKind {
        &self.kind
    }

    /// Build an [`ErrorKind::Os`] error from the calling thread's current OS
    /// error value.
    pub(crate) fn os(call: &'static str) -> Self {
        let errno = std::io::Error::last_os_error().raw_os_error().unwrap_or(0);
        Self::new(ErrorKind::Os { call, errno })
    }
}

impl fmt::Display for Error {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.kind.fmt(f)
    }
}

impl std::error::Error for Error {}

/// The kind of an [`Error`].
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ErrorKind {
    /// An operation was attempted on a region that was never created or
    /// connected, or that has been closed.
    NotConnected,
    /// The region name is empty or contains bytes the OS rejects.
    InvalidName { name: String },
    /// A resize would shrink the region, or bring the static area below the
    /// minimum needed for the header slots.
    InvalidResize { requested: usize, current: usize },
    /// No free block large enough to satisfy an allocation.
    OutOfMemory { requested: usize },
    /// A free or realloc target that is misaligned, out of range, or not
    /// currently allocated.
    InvalidPointer { offset: usize },
    /// An index outside the addressable range of a list or primitive array.
    IndexOutOfBounds { index: i64, len: usize },
    /// A map lookup or deletion missed.
    KeyNotFound { key: String },
    /// A value or path element of the wrong type for the object it is
    /// applied to.
    TypeMismatch {
        expected: &'static str,
        found: &'static str,
    },
    /// A busy-bit wait timed out. Retryable.
    Busy,
    /// A semaphore wait was aborted by its callback.
    Interrupted { name: String },
    /// A resize failed partway; the region was restored to its previous
    /// state as far as the OS allowed.
    ResizeFailed { detail: String },
    /// The in-region data failed a consistency check.
    Corrupt { detail: String },
    /// A shared-memory or semaphore primitive failed.
    Os { call: &'static str, errno: i32 },
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::NotConnected => {
                write!(f, "Region is not connected; create or connect it first")
            }
            ErrorKind::InvalidName { name } => {
                write!(f, "Invalid region name {name:?}")
            }
            ErrorKind::InvalidResize { requested, current } => {
                write!(
                    f,
                    "Cannot resize from {current} to {requested} bytes; shrinking is not supported"
                )
            }
            ErrorKind::OutOfMemory { requested } => {
                write!(f, "No free block can hold {requested} bytes")
            }
            ErrorKind::InvalidPointer { offset } => {
                write!(f, "Offset {offset} is not an allocated payload")
            }
            ErrorKind::IndexOutOfBounds { index, len } => {
                write!(f, "Index {index} out of bounds 0-{len}")
            }
            ErrorKind::KeyNotFound { key } => {
                write!(f, "Key {key} not found")
            }
            ErrorKind::TypeMismatch { expected, found } => {
                write!(f, "Type mismatch, expected {expected} but found {found}")
            }
            ErrorKind::Busy => {
                write!(f, "Timed out waiting for a busy block")
            }
            ErrorKind::Interrupted { name } => {
                write!(f, "Wait on semaphore {name} was interrupted")
            }
            ErrorKind::ResizeFailed { detail } => {
                write!(f, "Resize failed: {detail}")
            }
            ErrorKind::Corrupt { detail } => {
                write!(f, "Region data is corrupt: {detail}")
            }
            ErrorKind::Os { call, errno } => {
                let err = std::io::Error::from_raw_os_error(*errno);
                write!(f, "{call} failed: {err}")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_carries_context() {
        let err = Error::new(ErrorKind::IndexOutOfBounds { index: 5, len: 3 });
        assert_eq!(err.to_string(), "Index 5 out of bounds 0-3");

        let err = Error::new(ErrorKind::KeyNotFound {
            key: "\"a\"".to_owned(),
        });
        assert_eq!(err.to_string(), "Key \"a\" not found");
    }
}
