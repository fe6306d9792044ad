mod kqueue;

pub(crate) use kqueue::{trigger_shutdown, EventKind, RawEvent, Selector, SHUTDOWN_ID};

use std::io;

/// Maps a libc call returning `-1` on error into an `io::Result`, the way
/// the rest of this crate's syscall-adjacent code is written.
pub(crate) fn cvt(ret: libc::c_int) -> io::Result<libc::c_int> {
    if ret == -1 {
        Err(io::Error::last_os_error())
    } else {
        Ok(ret)
    }
}

/// Same as [`cvt`] but for calls (`read(2)`/`write(2)`) that return
/// `ssize_t`.
pub(crate) fn cvt_isize(ret: isize) -> io::Result<isize> {
    if ret == -1 {
        Err(io::Error::last_os_error())
    } else {
        Ok(ret)
    }
}
