//! A generic TCP server template: binds a listener into an [`EventLoop`] and
//! wires accept/read/write/EOF notifications into per-connection sessions.

use std::cell::RefCell;
use std::os::unix::io::AsRawFd;
use std::rc::{Rc, Weak};
use std::sync::atomic::{AtomicBool, Ordering};

use log::{error, warn};

use crate::event_loop::EventLoop;
use crate::socket::{ServerSocket, Socket};

/// The contract a per-connection object must satisfy to be driven by
/// [`TcpServer`].
///
/// The server never decides how much data to buffer or how to frame a
/// protocol on top of the byte stream; it only asks the session for a
/// window to fill or drain and reports back how much of that window was
/// actually used. Returning an empty window from [`recv_buf`](Session::recv_buf)
/// or [`send_buf`](Session::send_buf) tells the server "skip this
/// readiness signal" — there is no other way for a session to decline.
pub trait Session {
    /// Returns a writable window of at most `max_len` bytes for the server
    /// to fill from the socket, or an empty slice if the session has no
    /// room right now.
    fn recv_buf(&mut self, max_len: usize) -> &mut [u8];

    /// Reports how many bytes of the window last returned by
    /// [`recv_buf`](Session::recv_buf) were actually filled.
    fn post_recv(&mut self, filled: usize);

    /// Returns a readable window of at most `max_len` bytes for the server
    /// to write to the socket, or an empty slice if the session has
    /// nothing to send right now.
    fn send_buf(&mut self, max_len: usize) -> &[u8];

    /// Reports how many bytes of the window last returned by
    /// [`send_buf`](Session::send_buf) were actually written.
    fn post_send(&mut self, sent: usize);

    /// Called exactly once when the peer's end of the stream is reached.
    fn end(&mut self);
}

const BACKLOG: i32 = 128;

/// A generic TCP acceptor, parameterized over a per-connection session type
/// `S` and a session factory `F`.
///
/// Constructing a `TcpServer` does nothing observable; call
/// [`start`](Self::start) to bind, listen, and register the accept
/// callback with the event loop.
pub struct TcpServer<S, F> {
    port: u16,
    event_loop: Rc<EventLoop>,
    socket: ServerSocket,
    running: AtomicBool,
    factory: F,
    _session: std::marker::PhantomData<S>,
}

impl<S, F> std::fmt::Debug for TcpServer<S, F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpServer")
            .field("port", &self.port)
            .field("running", &self.running.load(Ordering::Relaxed))
            .finish()
    }
}

impl<S, F> TcpServer<S, F>
where
    S: Session + 'static,
    F: Fn() -> S + 'static,
{
    /// Creates a server that will listen on `port` once [`start`](Self::start)
    /// is called, constructing a new `S` via `factory` for each accepted
    /// connection.
    pub fn new(event_loop: Rc<EventLoop>, port: u16, factory: F) -> crate::Result<TcpServer<S, F>> {
        Ok(TcpServer {
            port,
            event_loop,
            socket: ServerSocket::new()?,
            running: AtomicBool::new(false),
            factory,
            _session: std::marker::PhantomData,
        })
    }

    /// Binds, listens (backlog `128`), switches the listener to
    /// non-blocking mode, and registers its accept callback with the event
    /// loop. Any failure along the way is logged and leaves
    /// [`running`](Self::running) `false` — there is no other surfaced
    /// failure state, matching the source this is modelled on.
    pub fn start(self: Rc<Self>) {
        if let Err(err) = self.socket.listen(self.port, BACKLOG) {
            error!("tcp server: failed to bind/listen on port {}: {}", self.port, err);
            return;
        }
        if let Err(err) = self.socket.set_non_blocking() {
            error!("tcp server: failed to set listener non-blocking: {}", err);
            return;
        }

        let fd = self.socket.as_raw_fd();
        // A weak reference: the event loop's callback table must not keep
        // the server alive, or the two would hold strong references to
        // each other (`TcpServer` -> `Rc<EventLoop>`, `EventLoop`'s fds map
        // -> this closure -> `TcpServer`) and neither would ever drop.
        let this = Rc::downgrade(&self);
        let registered = self.event_loop.register_fd_read(fd, move |result| {
            if let Some(this) = this.upgrade() {
                this.on_acceptable(result);
            }
        });
        if let Err(err) = registered {
            error!("tcp server: failed to register listener with event loop: {}", err);
            return;
        }

        self.running.store(true, Ordering::Relaxed);
    }

    /// A liveness hint for external observers. The event loop itself never
    /// consults this flag.
    pub fn running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    /// Clears the liveness flag. Does not itself tear down the listener
    /// registration; drop the server (or the event loop) for that.
    pub fn stop(&self) {
        self.running.store(false, Ordering::Relaxed);
    }

    fn on_acceptable(&self, result: std::result::Result<i64, u32>) {
        if result.is_err() {
            error!("tcp server: listener reported an error on readiness");
            return;
        }

        // Bounded by MAX_ACCEPT_FAILURES rather than looping on
        // non-`WouldBlock` errors indefinitely: a persistent failure (fd
        // exhaustion, `EMFILE`/`ENFILE`) would otherwise spin this single
        // reactor thread forever on one listener, starving every other
        // descriptor and timer registered on the same event loop. Give up
        // for this dispatch and let the next read-readiness event retry.
        const MAX_ACCEPT_FAILURES: u32 = 16;
        let mut failures = 0;
        loop {
            match self.socket.accept() {
                Ok(peer) => self.setup_handlers(peer),
                Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(err) => {
                    error!("tcp server: accept failed: {}", err);
                    failures += 1;
                    if failures >= MAX_ACCEPT_FAILURES {
                        error!(
                            "tcp server: giving up accepting after {} consecutive failures",
                            failures
                        );
                        break;
                    }
                }
            }
        }
    }

    fn setup_handlers(&self, peer: Socket) {
        let fd = peer.as_raw_fd();
        let socket = Rc::new(RefCell::new(peer));
        let session = Rc::new(RefCell::new((self.factory)()));

        let event_loop = self.event_loop.clone();

        {
            let socket = socket.clone();
            let session = session.clone();
            let result = self.event_loop.register_fd_read(fd, move |result| {
                handle_readable(&socket, &session, result);
            });
            if let Err(err) = result {
                warn!("tcp server: failed to register read callback for fd {}: {}", fd, err);
                return;
            }
        }

        {
            let socket = socket.clone();
            let session = session.clone();
            let result = self.event_loop.register_fd_write(fd, move |result| {
                handle_writable(&socket, &session, result);
            });
            if let Err(err) = result {
                warn!("tcp server: failed to register write callback for fd {}: {}", fd, err);
                return;
            }
        }

        {
            let socket = socket.clone();
            let session = session.clone();
            let event_loop = event_loop.clone();
            let result = self.event_loop.register_fd_eof(fd, move || {
                handle_eof(&event_loop, fd, &socket, &session);
            });
            if let Err(err) = result {
                warn!("tcp server: failed to register EOF callback for fd {}: {}", fd, err);
            }
        }
    }
}

impl<S, F> Drop for TcpServer<S, F> {
    fn drop(&mut self) {
        if let Err(err) = self.socket.close() {
            warn!("tcp server: failed to close listener: {}", err);
        }
    }
}

fn handle_readable<S: Session>(
    socket: &Rc<RefCell<Socket>>,
    session: &Rc<RefCell<S>>,
    result: std::result::Result<i64, u32>,
) {
    let available = match result {
        Ok(n) => n,
        Err(fflags) => {
            error!("tcp server: read-readiness reported an error (fflags {:#x})", fflags);
            return;
        }
    };
    if available < 0 {
        return;
    }

    let mut session = session.borrow_mut();
    let window = session.recv_buf(available as usize);
    if window.is_empty() {
        return;
    }

    match socket.borrow().recv_some(window) {
        Ok(filled) => session.post_recv(filled),
        Err(err) => error!("tcp server: recv failed: {}", err),
    }
}

fn handle_writable<S: Session>(
    socket: &Rc<RefCell<Socket>>,
    session: &Rc<RefCell<S>>,
    result: std::result::Result<i64, u32>,
) {
    let available = match result {
        Ok(n) => n,
        Err(fflags) => {
            error!("tcp server: write-readiness reported an error (fflags {:#x})", fflags);
            return;
        }
    };
    if available < 0 {
        return;
    }

    let mut session = session.borrow_mut();
    let window = session.send_buf(available as usize);
    if window.is_empty() {
        return;
    }

    match socket.borrow().send_all(window) {
        Ok(()) => {
            let sent = window.len();
            session.post_send(sent);
        }
        Err(err) => error!("tcp server: send failed: {}", err),
    }
}

fn handle_eof<S: Session>(
    event_loop: &Rc<EventLoop>,
    fd: std::os::unix::io::RawFd,
    _socket: &Rc<RefCell<Socket>>,
    session: &Rc<RefCell<S>>,
) {
    session.borrow_mut().end();

    if let Err(err) = event_loop.remove_fd_write(fd) {
        warn!("tcp server: failed to remove write callback for fd {}: {}", fd, err);
    }
    if let Err(err) = event_loop.remove_fd_read(fd) {
        warn!("tcp server: failed to remove read callback for fd {}: {}", fd, err);
    }
    if let Err(err) = event_loop.remove_fd_eof(fd) {
        warn!("tcp server: failed to remove EOF callback for fd {}: {}", fd, err);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Null;

    impl Session for Null {
        fn recv_buf(&mut self, _max_len: usize) -> &mut [u8] {
            &mut []
        }
        fn post_recv(&mut self, _filled: usize) {}
        fn send_buf(&mut self, _max_len: usize) -> &[u8] {
            &[]
        }
        fn post_send(&mut self, _sent: usize) {}
        fn end(&mut self) {}
    }

    #[test]
    fn start_sets_running_on_success() {
        let event_loop = Rc::new(EventLoop::new().unwrap());
        let server = Rc::new(TcpServer::new(event_loop, 0, Null::default).unwrap());
        assert!(!server.running());
        server.clone().start();
        assert!(server.running());
    }

    #[test]
    fn stop_clears_running_flag() {
        let event_loop = Rc::new(EventLoop::new().unwrap());
        let server = Rc::new(TcpServer::new(event_loop, 0, Null::default).unwrap());
        server.clone().start();
        server.stop();
        assert!(!server.running());
    }
}
