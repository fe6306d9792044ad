//! Thin wrapper around `kqueue(2)`/`kevent(2)`.
//!
//! This intentionally does not generalize over epoll or any other readiness
//! backend — the design this crate implements is built on the BSD unified
//! event queue's read/write/timer/user-event model verbatim.

#![cfg(any(
    target_os = "macos",
    target_os = "ios",
    target_os = "freebsd",
    target_os = "netbsd",
    target_os = "openbsd",
    target_os = "dragonfly",
))]

use std::io;
use std::mem;
use std::os::unix::io::RawFd;
use std::ptr;

use crate::sys::cvt;

#[cfg(not(target_os = "netbsd"))]
type Filter = std::os::raw::c_short;
#[cfg(target_os = "netbsd")]
type Filter = u32;

/// The reserved id `register_timer`/`shutdown` use for the shutdown user
/// event; callers may not register a timer under this id.
pub(crate) const SHUTDOWN_ID: u64 = 19;

/// What kind of filter a [`RawEvent`] came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum EventKind {
    Read,
    Write,
    Timer,
    User,
    Unknown,
}

/// A single dispatched `kevent`, translated into the fields the event loop
/// cares about.
#[derive(Debug, Clone, Copy)]
pub(crate) struct RawEvent {
    pub kind: EventKind,
    pub ident: u64,
    pub error: bool,
    pub eof: bool,
    pub fflags: u32,
    pub data: i64,
}

fn kevent(ident: u64, filter: Filter, flags: u16, fflags: u32, data: isize) -> libc::kevent {
    libc::kevent {
        ident: ident as libc::uintptr_t,
        filter: filter as Filter,
        flags,
        fflags: fflags as _,
        data: data as _,
        udata: ptr::null_mut(),
    }
}

/// Owns the kqueue descriptor and exposes the add/delete/wait vocabulary
/// the event loop is built on.
#[derive(Debug)]
pub(crate) struct Selector {
    kq: RawFd,
}

impl Selector {
    pub(crate) fn new() -> io::Result<Selector> {
        let kq = cvt(unsafe { libc::kqueue() })?;
        let selector = Selector { kq };
        selector.submit(&kevent(
            SHUTDOWN_ID,
            libc::EVFILT_USER,
            libc::EV_ADD,
            0,
            0,
        ))?;
        Ok(selector)
    }

    pub(crate) fn as_raw_fd(&self) -> RawFd {
        self.kq
    }

    fn submit(&self, ev: &libc::kevent) -> io::Result<()> {
        cvt(unsafe { libc::kevent(self.kq, ev, 1, ptr::null_mut(), 0, ptr::null()) })?;
        Ok(())
    }

    pub(crate) fn add_read(&self, fd: RawFd) -> io::Result<()> {
        self.submit(&kevent(fd as u64, libc::EVFILT_READ, libc::EV_ADD, 0, 0))
    }

    pub(crate) fn add_write(&self, fd: RawFd) -> io::Result<()> {
        self.submit(&kevent(fd as u64, libc::EVFILT_WRITE, libc::EV_ADD, 0, 0))
    }

    pub(crate) fn delete_read(&self, fd: RawFd) -> io::Result<()> {
        self.submit(&kevent(fd as u64, libc::EVFILT_READ, libc::EV_DELETE, 0, 0))
    }

    pub(crate) fn delete_write(&self, fd: RawFd) -> io::Result<()> {
        self.submit(&kevent(fd as u64, libc::EVFILT_WRITE, libc::EV_DELETE, 0, 0))
    }

    /// `timeout_ns` is delivered to the kernel via `NOTE_NSECONDS`; a
    /// non-periodic timer is registered `EV_ONESHOT`.
    pub(crate) fn add_timer(&self, id: u64, timeout_ns: u64, periodic: bool) -> io::Result<()> {
        let oneshot = if periodic { 0 } else { libc::EV_ONESHOT };
        self.submit(&kevent(
            id,
            libc::EVFILT_TIMER,
            libc::EV_ADD | oneshot,
            libc::NOTE_NSECONDS,
            timeout_ns as isize,
        ))
    }

    pub(crate) fn delete_timer(&self, id: u64) -> io::Result<()> {
        self.submit(&kevent(id, libc::EVFILT_TIMER, libc::EV_DELETE, 0, 0))
    }

    /// Enqueues the shutdown user event.
    pub(crate) fn trigger_shutdown(&self) -> io::Result<()> {
        trigger_shutdown(self.kq)
    }

    /// Blocks for exactly one event (the design asks for "at least one";
    /// batching to a capacity-64 buffer and draining it is an equally valid
    /// reading, but dispatching one event per `wait` keeps `run`'s
    /// single-event-per-iteration contract explicit).
    pub(crate) fn wait(&self) -> io::Result<RawEvent> {
        let mut ev: libc::kevent = unsafe { mem::zeroed() };
        let timeout: *const libc::timespec = ptr::null();
        let n = unsafe { libc::kevent(self.kq, ptr::null(), 0, &mut ev, 1, timeout) };
        if n == -1 {
            return Err(io::Error::last_os_error());
        }
        Ok(translate(ev))
    }
}

/// Enqueues the shutdown user event against a raw kqueue descriptor.
///
/// This is the one operation this module exposes outside of [`Selector`]:
/// [`crate::event_loop::ShutdownHandle`] is `Send`/`Sync` and needs to
/// trigger shutdown from a thread that does not own the `Selector`.
pub(crate) fn trigger_shutdown(kq: RawFd) -> io::Result<()> {
    let ev = kevent(SHUTDOWN_ID, libc::EVFILT_USER, 0, libc::NOTE_TRIGGER, 0);
    cvt(unsafe { libc::kevent(kq, &ev, 1, ptr::null_mut(), 0, ptr::null()) })?;
    Ok(())
}

fn translate(ev: libc::kevent) -> RawEvent {
    let kind = if ev.filter == libc::EVFILT_USER as Filter {
        EventKind::User
    } else if ev.filter == libc::EVFILT_TIMER as Filter {
        EventKind::Timer
    } else if ev.filter == libc::EVFILT_READ as Filter {
        EventKind::Read
    } else if ev.filter == libc::EVFILT_WRITE as Filter {
        EventKind::Write
    } else {
        EventKind::Unknown
    };

    RawEvent {
        kind,
        ident: ev.ident as u64,
        error: (ev.flags & (libc::EV_ERROR as u16)) != 0,
        eof: (ev.flags & (libc::EV_EOF as u16)) != 0,
        fflags: ev.fflags as u32,
        data: ev.data as i64,
    }
}

impl Drop for Selector {
    fn drop(&mut self) {
        if unsafe { libc::close(self.kq) } == -1 {
            let err = io::Error::last_os_error();
            log::warn!("failed to close kqueue fd: {}", err);
        }
    }
}
