use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::mem;
use std::os::unix::io::{AsRawFd, RawFd};
use std::rc::Rc;

use log::{error, trace, warn};

use crate::error::{LoopError, Result};
use crate::sys::{self, EventKind, Selector};

type ReadCallback = Box<dyn FnMut(std::result::Result<i64, u32>)>;
type WriteCallback = Box<dyn FnMut(std::result::Result<i64, u32>)>;
type EofCallback = Box<dyn FnMut()>;
type TimerCallback = Box<dyn FnMut(std::result::Result<(), i64>)>;

/// Holds a registered callback while it isn't being dispatched.
///
/// A callback is taken out of its slot for the duration of its own
/// invocation so it may freely re-register or remove itself (or any other
/// fd/timer) without re-entering a borrowed [`RefCell`]. `InUse` marks that
/// in-flight state; a `remove_*` call made while a slot is `InUse`
/// overwrites it with `Vacant` so the dispatcher knows not to restore it.
enum Slot<T> {
    Vacant,
    InUse,
    Present(T),
}

impl<T> Slot<T> {
    fn is_vacant(&self) -> bool {
        matches!(self, Slot::Vacant)
    }

    fn take_for_dispatch(&mut self) -> Option<T> {
        match mem::replace(self, Slot::InUse) {
            Slot::Present(cb) => Some(cb),
            other => {
                *self = other;
                None
            }
        }
    }

    fn restore_after_dispatch(&mut self, cb: T) {
        if matches!(self, Slot::InUse) {
            *self = Slot::Present(cb);
        }
    }
}

#[derive(Default)]
struct FdHandlers {
    read: Slot<ReadCallback>,
    write: Slot<WriteCallback>,
    eof: Slot<EofCallback>,
}

impl<T> Default for Slot<T> {
    fn default() -> Slot<T> {
        Slot::Vacant
    }
}

struct Timer {
    periodic: bool,
    callback: Slot<TimerCallback>,
}

/// A single-threaded, kqueue-backed readiness event loop.
///
/// Registration methods take `&self`: every callback table is stored behind
/// its own [`RefCell`], so a callback invoked from [`EventLoop::run`] can
/// freely register or remove handlers — including its own — without
/// panicking on a re-entrant borrow. Share one `EventLoop` across the parts
/// of a program that need it with `Rc<EventLoop>`.
pub struct EventLoop {
    selector: Selector,
    fds: RefCell<HashMap<RawFd, Rc<RefCell<FdHandlers>>>>,
    timers: RefCell<HashMap<u64, Rc<RefCell<Timer>>>>,
    done: Cell<bool>,
}

impl std::fmt::Debug for EventLoop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventLoop")
            .field("fd", &self.selector.as_raw_fd())
            .field("registered_fds", &self.fds.borrow().len())
            .field("registered_timers", &self.timers.borrow().len())
            .finish()
    }
}

impl EventLoop {
    /// Creates a new event loop, backed by a fresh `kqueue(2)` descriptor.
    pub fn new() -> Result<EventLoop> {
        Ok(EventLoop {
            selector: Selector::new()?,
            fds: RefCell::new(HashMap::new()),
            timers: RefCell::new(HashMap::new()),
            done: Cell::new(false),
        })
    }

    /// A handle that can trigger [`EventLoop::shutdown`] from another
    /// thread.
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            kq: self.selector.as_raw_fd(),
        }
    }

    /// Registers `callback` to run whenever `fd` has data available to
    /// read. `callback` receives `Ok(n)` with the number of bytes the
    /// kernel reports as available, or `Err(fflags)` if the kernel
    /// delivered the event with `EV_ERROR` set.
    pub fn register_fd_read<F>(&self, fd: RawFd, callback: F) -> Result<()>
    where
        F: FnMut(std::result::Result<i64, u32>) + 'static,
    {
        self.selector.add_read(fd)?;
        self.handlers_for(fd).borrow_mut().read = Slot::Present(Box::new(callback));
        Ok(())
    }

    /// Registers `callback` to run whenever `fd` is writable. Same
    /// `Ok`/`Err` convention as [`register_fd_read`](Self::register_fd_read).
    pub fn register_fd_write<F>(&self, fd: RawFd, callback: F) -> Result<()>
    where
        F: FnMut(std::result::Result<i64, u32>) + 'static,
    {
        self.selector.add_write(fd)?;
        self.handlers_for(fd).borrow_mut().write = Slot::Present(Box::new(callback));
        Ok(())
    }

    /// Registers `callback` to run once `fd` reports `EV_EOF` on a read or
    /// write event. `fd` must already have a read or write callback
    /// registered.
    pub fn register_fd_eof<F>(&self, fd: RawFd, callback: F) -> Result<()>
    where
        F: FnMut() + 'static,
    {
        let fds = self.fds.borrow();
        let handlers = fds.get(&fd).ok_or(LoopError::EofWithoutDirection)?;
        let mut h = handlers.borrow_mut();
        if h.read.is_vacant() && h.write.is_vacant() {
            return Err(LoopError::EofWithoutDirection);
        }
        h.eof = Slot::Present(Box::new(callback));
        Ok(())
    }

    /// Unregisters `fd`'s read callback. The in-process entry is cleared
    /// before the kernel-side `EV_DELETE`; if that `kevent(2)` call fails,
    /// the entry is *not* restored.
    pub fn remove_fd_read(&self, fd: RawFd) -> Result<()> {
        self.clear_slot(fd, |h| &mut h.read)?;
        self.selector.delete_read(fd)?;
        self.drop_fd_if_idle(fd);
        Ok(())
    }

    /// Unregisters `fd`'s write callback. Same ordering guarantee as
    /// [`remove_fd_read`](Self::remove_fd_read).
    pub fn remove_fd_write(&self, fd: RawFd) -> Result<()> {
        self.clear_slot(fd, |h| &mut h.write)?;
        self.selector.delete_write(fd)?;
        self.drop_fd_if_idle(fd);
        Ok(())
    }

    /// Unregisters `fd`'s EOF callback. Unlike [`remove_fd_read`] and
    /// [`remove_fd_write`](Self::remove_fd_write), this touches only the
    /// in-process table — EOF was never a kernel filter of its own.
    pub fn remove_fd_eof(&self, fd: RawFd) -> Result<()> {
        self.clear_slot(fd, |h| &mut h.eof)?;
        self.drop_fd_if_idle(fd);
        Ok(())
    }

    /// Registers a timer under `id`. `timeout` is delivered to the kernel
    /// with nanosecond resolution (`NOTE_NSECONDS`); if `periodic` is
    /// false the timer fires once (`EV_ONESHOT`) and its in-process entry
    /// is dropped automatically after firing.
    pub fn register_timer<F>(
        &self,
        id: u64,
        timeout: std::time::Duration,
        periodic: bool,
        callback: F,
    ) -> Result<()>
    where
        F: FnMut(std::result::Result<(), i64>) + 'static,
    {
        if id == sys::SHUTDOWN_ID {
            return Err(LoopError::ReservedTimerId);
        }
        self.selector
            .add_timer(id, timeout.as_nanos() as u64, periodic)?;
        self.timers.borrow_mut().insert(
            id,
            Rc::new(RefCell::new(Timer {
                periodic,
                callback: Slot::Present(Box::new(callback)),
            })),
        );
        Ok(())
    }

    /// Unregisters the timer `id`. Same ordering guarantee as
    /// [`remove_fd_read`](Self::remove_fd_read).
    pub fn remove_timer(&self, id: u64) -> Result<()> {
        let timer = self
            .timers
            .borrow()
            .get(&id)
            .cloned()
            .ok_or(LoopError::NotRegistered)?;
        {
            let mut t = timer.borrow_mut();
            if t.callback.is_vacant() {
                return Err(LoopError::NotRegistered);
            }
            t.callback = Slot::Vacant;
        }
        self.timers.borrow_mut().remove(&id);
        self.selector.delete_timer(id)?;
        Ok(())
    }

    /// Requests shutdown from within the thread running [`run`](Self::run).
    pub fn shutdown(&self) -> Result<()> {
        self.selector.trigger_shutdown()?;
        Ok(())
    }

    /// Runs the dispatch loop until [`shutdown`](Self::shutdown) (or a
    /// [`ShutdownHandle`]) is triggered.
    ///
    /// A failed `kevent(2)` wait is logged and retried rather than treated
    /// as fatal — mirroring the reactor this design is modelled on, which
    /// never exits its `run` loop on a transient OS error.
    pub fn run(&self) -> Result<()> {
        self.done.set(false);
        while !self.done.get() {
            match self.selector.wait() {
                Ok(raw) => self.dispatch(raw),
                Err(err) => error!("kevent wait failed, retrying: {}", err),
            }
        }
        Ok(())
    }

    fn handlers_for(&self, fd: RawFd) -> Rc<RefCell<FdHandlers>> {
        self.fds
            .borrow_mut()
            .entry(fd)
            .or_insert_with(|| Rc::new(RefCell::new(FdHandlers::default())))
            .clone()
    }

    fn clear_slot<G, T>(&self, fd: RawFd, slot_of: G) -> Result<()>
    where
        G: FnOnce(&mut FdHandlers) -> &mut Slot<T>,
    {
        let handlers = self
            .fds
            .borrow()
            .get(&fd)
            .cloned()
            .ok_or(LoopError::NotRegistered)?;
        let mut h = handlers.borrow_mut();
        let slot = slot_of(&mut h);
        if slot.is_vacant() {
            return Err(LoopError::NotRegistered);
        }
        *slot = Slot::Vacant;
        Ok(())
    }

    /// Drops the whole per-fd entry once nothing references it any more.
    ///
    /// Checks all three slots, not just `read`/`write`: removing the last
    /// direction must not silently take an still-registered EOF callback
    /// with it — the design requires callers to clean up EOF explicitly
    /// via [`remove_fd_eof`](Self::remove_fd_eof).
    fn drop_fd_if_idle(&self, fd: RawFd) {
        let idle = self
            .fds
            .borrow()
            .get(&fd)
            .map(|h| {
                let h = h.borrow();
                h.read.is_vacant() && h.write.is_vacant() && h.eof.is_vacant()
            })
            .unwrap_or(false);
        if idle {
            self.fds.borrow_mut().remove(&fd);
        }
    }

    fn dispatch(&self, raw: sys::RawEvent) {
        match raw.kind {
            EventKind::User => {
                trace!("shutdown event received");
                self.done.set(true);
            }
            EventKind::Timer => self.dispatch_timer(raw),
            EventKind::Read => self.dispatch_fd(raw, true),
            EventKind::Write => self.dispatch_fd(raw, false),
            EventKind::Unknown => warn!("kevent returned an unrecognized filter"),
        }
    }

    fn dispatch_timer(&self, raw: sys::RawEvent) {
        let id = raw.ident;
        let timer = match self.timers.borrow().get(&id).cloned() {
            Some(timer) => timer,
            None => return,
        };

        let cb = timer.borrow_mut().callback.take_for_dispatch();
        if let Some(mut cb) = cb {
            let result = if raw.error { Err(raw.data) } else { Ok(()) };
            cb(result);
            timer.borrow_mut().callback.restore_after_dispatch(cb);
        }

        // The callback may have re-registered `id` (legal per
        // `register_timer`'s "replaces both the kernel entry and the
        // callback" contract); in that case `self.timers` now holds a
        // different `Rc` than the one dispatched above, and removing by key
        // alone would delete the freshly-registered timer's in-process
        // entry out from under it. Only remove if the map still points at
        // the exact `Timer` just dispatched.
        let still_current = self
            .timers
            .borrow()
            .get(&id)
            .map(|current| Rc::ptr_eq(current, &timer))
            .unwrap_or(false);
        if still_current && !timer.borrow().periodic {
            self.timers.borrow_mut().remove(&id);
        }
    }

    fn dispatch_fd(&self, raw: sys::RawEvent, is_read: bool) {
        let fd = raw.ident as RawFd;
        let handlers = match self.fds.borrow().get(&fd).cloned() {
            Some(handlers) => handlers,
            None => return,
        };

        let cb = if is_read {
            handlers.borrow_mut().read.take_for_dispatch()
        } else {
            handlers.borrow_mut().write.take_for_dispatch()
        };
        if let Some(mut cb) = cb {
            let result = if raw.error { Err(raw.fflags) } else { Ok(raw.data) };
            cb(result);
            if is_read {
                handlers.borrow_mut().read.restore_after_dispatch(cb);
            } else {
                handlers.borrow_mut().write.restore_after_dispatch(cb);
            }
        }

        if raw.eof {
            self.dispatch_eof(&handlers);
        }
    }

    fn dispatch_eof(&self, handlers: &Rc<RefCell<FdHandlers>>) {
        let cb = handlers.borrow_mut().eof.take_for_dispatch();
        if let Some(mut cb) = cb {
            cb();
            handlers.borrow_mut().eof.restore_after_dispatch(cb);
        }
    }
}

/// A `Send + Sync` handle that can trigger [`EventLoop::shutdown`] from a
/// thread other than the one running [`EventLoop::run`].
///
/// Holds nothing but the raw kqueue descriptor: triggering the shutdown
/// user event is just a `kevent(2)` call and needs no access to the event
/// loop's (non-`Send`) callback tables.
#[derive(Debug, Clone, Copy)]
pub struct ShutdownHandle {
    kq: RawFd,
}

unsafe impl Send for ShutdownHandle {}
unsafe impl Sync for ShutdownHandle {}

impl ShutdownHandle {
    /// Triggers shutdown of the event loop this handle was created from.
    pub fn shutdown(&self) -> Result<()> {
        sys::trigger_shutdown(self.kq)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell as StdRefCell;
    use std::rc::Rc as StdRc;

    #[test]
    fn register_and_remove_timer_round_trip() {
        let event_loop = EventLoop::new().unwrap();
        event_loop
            .register_timer(1, std::time::Duration::from_secs(60), false, |_| {})
            .unwrap();
        event_loop.remove_timer(1).unwrap();
        assert!(matches!(
            event_loop.remove_timer(1).unwrap_err(),
            LoopError::NotRegistered
        ));
    }

    #[test]
    fn remove_fd_read_without_registration_fails() {
        let event_loop = EventLoop::new().unwrap();
        assert!(matches!(
            event_loop.remove_fd_read(999).unwrap_err(),
            LoopError::NotRegistered
        ));
    }

    #[test]
    fn eof_requires_prior_direction() {
        let event_loop = EventLoop::new().unwrap();
        assert!(matches!(
            event_loop.register_fd_eof(999, || {}).unwrap_err(),
            LoopError::EofWithoutDirection
        ));
    }

    #[test]
    fn callback_can_remove_itself_without_panicking() {
        let event_loop = StdRc::new(EventLoop::new().unwrap());
        let socket = crate::socket::Socket::new().unwrap();
        let fd = socket.as_raw_fd();
        socket.set_non_blocking().unwrap();

        let removed = StdRc::new(StdRefCell::new(false));
        let removed_clone = removed.clone();
        let loop_clone = event_loop.clone();
        event_loop
            .register_fd_read(fd, move |_| {
                loop_clone.remove_fd_read(fd).unwrap();
                *removed_clone.borrow_mut() = true;
            })
            .unwrap();

        event_loop.dispatch_fd(
            sys::RawEvent {
                kind: sys::EventKind::Read,
                ident: fd as u64,
                error: false,
                eof: false,
                fflags: 0,
                data: 0,
            },
            true,
        );

        assert!(*removed.borrow());
    }

    #[test]
    fn timer_reregistered_from_within_its_own_callback_survives_dispatch_cleanup() {
        let event_loop = StdRc::new(EventLoop::new().unwrap());
        let new_calls = StdRc::new(StdRefCell::new(0));

        let new_calls_clone = new_calls.clone();
        let loop_clone = event_loop.clone();
        event_loop
            .register_timer(1, std::time::Duration::from_secs(60), false, move |_| {
                // Re-register under the same id from within the one-shot
                // callback's own invocation.
                let new_calls_inner = new_calls_clone.clone();
                loop_clone
                    .register_timer(1, std::time::Duration::from_secs(60), false, move |_| {
                        *new_calls_inner.borrow_mut() += 1;
                    })
                    .unwrap();
            })
            .unwrap();

        // Dispatch the original (one-shot) timer's firing directly, the way
        // `run` would for a real `EVFILT_TIMER` event.
        event_loop.dispatch_timer(sys::RawEvent {
            kind: sys::EventKind::Timer,
            ident: 1,
            error: false,
            eof: false,
            fflags: 0,
            data: 0,
        });

        // The post-dispatch one-shot cleanup must not have deleted the
        // timer the callback just re-registered.
        assert!(event_loop.timers.borrow().contains_key(&1));

        event_loop.dispatch_timer(sys::RawEvent {
            kind: sys::EventKind::Timer,
            ident: 1,
            error: false,
            eof: false,
            fflags: 0,
            data: 0,
        });
        assert_eq!(*new_calls.borrow(), 1);
    }
}
