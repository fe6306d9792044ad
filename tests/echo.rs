//! End-to-end transfer-correctness scenario from SPEC_FULL.md §8: a peer
//! server increments every byte it receives and echoes it back; a client
//! drives the event loop with a write-then-read state machine and checks
//! the reply against the sent buffer incremented by one.

use std::cell::RefCell;
use std::os::unix::io::AsRawFd;
use std::rc::Rc;
use std::time::Duration;

use kqreact::{ClientSocket, EventLoop, Session, TcpServer};

const MSG_LEN: usize = 512;

struct IncrementingEcho {
    buf: Vec<u8>,
    head: usize,
    tail: usize,
}

impl Default for IncrementingEcho {
    fn default() -> IncrementingEcho {
        IncrementingEcho {
            buf: vec![0; MSG_LEN],
            head: 0,
            tail: 0,
        }
    }
}

impl Session for IncrementingEcho {
    fn recv_buf(&mut self, max_len: usize) -> &mut [u8] {
        if self.tail == self.buf.len() {
            return &mut [];
        }
        let end = (self.tail + max_len).min(self.buf.len());
        &mut self.buf[self.tail..end]
    }

    fn post_recv(&mut self, filled: usize) {
        for byte in &mut self.buf[self.tail..self.tail + filled] {
            *byte = byte.wrapping_add(1);
        }
        self.tail += filled;
    }

    fn send_buf(&mut self, max_len: usize) -> &[u8] {
        if self.head == self.tail {
            return &[];
        }
        let end = (self.head + max_len).min(self.tail);
        &self.buf[self.head..end]
    }

    fn post_send(&mut self, sent: usize) {
        self.head += sent;
    }

    fn end(&mut self) {}
}

/// Binds an ephemeral port with `std` and immediately drops the listener.
/// There's a narrow window for reuse before the server below rebinds it,
/// but it's good enough for a single-threaded test harness.
fn free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

/// Installs the `log` facade's default backend so the library's
/// `log::warn!`/`log::error!` diagnostics are visible instead of silently
/// dropped by the no-op default logger. Ignored if another test in this
/// binary already installed it.
fn init_logging() {
    let _ = env_logger::try_init();
}

#[test]
fn echo_scenario_increments_every_byte() {
    init_logging();
    let port = free_port();
    let event_loop = Rc::new(EventLoop::new().unwrap());

    let server = Rc::new(
        TcpServer::new(event_loop.clone(), port, IncrementingEcho::default).unwrap(),
    );
    server.clone().start();
    assert!(server.running());

    let send_buf: Vec<u8> = (0..MSG_LEN).map(|i| (b'a' as usize + i) as u8).collect();
    let expect: Vec<u8> = send_buf.iter().map(|b| b.wrapping_add(1)).collect();

    let client = ClientSocket::default();
    client.set_non_blocking().unwrap();
    let client_fd = client.as_raw_fd();
    match client.connect("127.0.0.1", port) {
        Ok(()) => {}
        Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {}
        Err(err) if err.raw_os_error() == Some(libc::EINPROGRESS) => {}
        Err(err) => panic!("connect failed: {}", err),
    }
    // Shared so both the read and write callbacks below can reach the same
    // connected socket; neither needs `&mut` since `recv_some`/`send_all`
    // only need `&self`.
    let client = Rc::new(client);

    let sent_all = Rc::new(RefCell::new(false));
    let received = Rc::new(RefCell::new(Vec::<u8>::new()));

    {
        let sent_all = sent_all.clone();
        let send_buf = send_buf.clone();
        let client = client.clone();
        event_loop
            .register_fd_write(client_fd, move |result| {
                if result.is_err() || *sent_all.borrow() {
                    return;
                }
                if client.send_all(&send_buf).is_ok() {
                    *sent_all.borrow_mut() = true;
                }
            })
            .unwrap();
    }

    {
        let received = received.clone();
        let loop_clone = event_loop.clone();
        let client = client.clone();
        event_loop
            .register_fd_read(client_fd, move |result| {
                if result.is_err() {
                    return;
                }
                let mut buf = [0u8; MSG_LEN];
                if let Ok(n) = client.recv_some(&mut buf) {
                    received.borrow_mut().extend_from_slice(&buf[..n]);
                }
                if received.borrow().len() >= MSG_LEN {
                    loop_clone.shutdown().unwrap();
                }
            })
            .unwrap();
    }

    // Safety net: if something goes wrong, don't hang the test suite
    // forever waiting on a kqueue event that never comes.
    let watchdog_loop = event_loop.clone();
    event_loop
        .register_timer(42, Duration::from_secs(5), false, move |_| {
            watchdog_loop.shutdown().unwrap();
        })
        .unwrap();

    event_loop.run().unwrap();

    assert_eq!(&received.borrow()[..], &expect[..]);
}
