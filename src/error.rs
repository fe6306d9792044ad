use std::io;

/// The crate's fallible-result alias for every registration/removal entry
/// point on [`EventLoop`](crate::EventLoop).
pub type Result<T> = std::result::Result<T, LoopError>;

/// Failure modes for the event loop's public registration API.
///
/// OS-level failures (`EBADF` on a bad descriptor, a failed `kevent(2)`
/// delete, ...) are wrapped verbatim as [`LoopError::Os`] so callers can
/// still inspect `raw_os_error()`/`kind()`. The remaining variants are
/// library-rule violations with no OS provenance at all: a "sentinel
/// error" in the terms this design uses elsewhere.
#[derive(Debug, thiserror::Error)]
pub enum LoopError {
    /// An OS-level syscall (`kevent`, `fcntl`, ...) failed.
    #[error("kernel queue operation failed: {0}")]
    Os(#[from] io::Error),

    /// `register_fd_eof` was called for a descriptor that has neither a
    /// read nor a write callback registered.
    #[error("cannot register an EOF callback without a prior read or write registration")]
    EofWithoutDirection,

    /// A `remove_fd_*`/`remove_timer` call targeted an entry that isn't
    /// currently registered.
    #[error("no such entry registered")]
    NotRegistered,

    /// `register_timer` was called with the reserved shutdown id (`19`).
    #[error("timer id 19 is reserved for shutdown")]
    ReservedTimerId,
}

impl LoopError {
    /// The OS error this failure wraps, if it originated from a syscall.
    pub fn as_os_error(&self) -> Option<&io::Error> {
        match self {
            LoopError::Os(err) => Some(err),
            _ => None,
        }
    }
}
