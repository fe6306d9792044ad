//! A tiny consumer of `kqreact`: a single-buffer echo server.
//!
//! Each connection gets its own ring buffer; bytes read from the socket
//! are queued verbatim for send back to the same peer.
//!
//! Run with `cargo run --example echo_server -- 8081`, then e.g.
//! `nc 127.0.0.1 8081`.

use std::env;
use std::rc::Rc;

use kqreact::{EventLoop, Session, TcpServer};

const BUF_SIZE: usize = 4096;

struct Echo {
    buf: Vec<u8>,
    /// Read cursor: bytes before this have been sent.
    head: usize,
    /// Write cursor: bytes before this have been received (and bumped).
    tail: usize,
}

impl Default for Echo {
    fn default() -> Echo {
        Echo {
            buf: vec![0; BUF_SIZE],
            head: 0,
            tail: 0,
        }
    }
}

impl Session for Echo {
    fn recv_buf(&mut self, max_len: usize) -> &mut [u8] {
        if self.tail == self.buf.len() {
            return &mut [];
        }
        let end = (self.tail + max_len).min(self.buf.len());
        &mut self.buf[self.tail..end]
    }

    fn post_recv(&mut self, filled: usize) {
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
        if self.head == self.tail && self.head == self.buf.len() {
            self.head = 0;
            self.tail = 0;
        }
    }

    fn end(&mut self) {
        log::info!("connection closed");
    }
}

fn main() -> kqreact::Result<()> {
    env_logger::init();

    let port: u16 = env::args()
        .nth(1)
        .and_then(|arg| arg.parse().ok())
        .unwrap_or(8081);

    let event_loop = Rc::new(EventLoop::new()?);
    let server = Rc::new(TcpServer::new(event_loop.clone(), port, Echo::default)?);
    server.clone().start();
    if !server.running() {
        log::error!("failed to start server on port {}; see prior log lines", port);
        return Ok(());
    }
    log::info!("listening on 0.0.0.0:{}", port);

    event_loop.run()
}
