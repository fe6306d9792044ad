use std::io;
use std::mem;
use std::net::Ipv4Addr;
use std::ops::{Deref, DerefMut};
use std::os::unix::io::{AsRawFd, RawFd};
use std::str::FromStr;

use log::warn;

use crate::sys::{cvt, cvt_isize};

/// A thin, scope-owning wrapper around a kernel stream-socket descriptor.
///
/// A `Socket` either owns a valid descriptor or holds the sentinel "no
/// descriptor" (`-1`). Moving a `Socket` leaves the source holding the
/// sentinel; dropping a `Socket` that owns a descriptor closes it exactly
/// once.
#[derive(Debug)]
pub struct Socket {
    fd: RawFd,
}

const NO_FD: RawFd = -1;

impl Socket {
    /// Creates a new `AF_INET`/`SOCK_STREAM` socket.
    pub fn new() -> io::Result<Socket> {
        let fd = cvt(unsafe { libc::socket(libc::AF_INET, libc::SOCK_STREAM, 0) })?;
        Ok(Socket { fd })
    }

    /// Takes ownership of an already-open descriptor.
    pub(crate) fn from_raw_fd(fd: RawFd) -> Socket {
        Socket { fd }
    }

    /// Puts the socket into non-blocking mode.
    pub fn set_non_blocking(&self) -> io::Result<()> {
        let flags = cvt(unsafe { libc::fcntl(self.fd, libc::F_GETFL, 0) })?;
        cvt(unsafe { libc::fcntl(self.fd, libc::F_SETFL, flags | libc::O_NONBLOCK) })?;
        Ok(())
    }

    /// Reads up to `buf.len()` bytes, returning the number of bytes
    /// actually read (`0` on EOF).
    pub fn recv_some(&self, buf: &mut [u8]) -> io::Result<usize> {
        let len =
            cvt_isize(unsafe { libc::read(self.fd, buf.as_mut_ptr().cast(), buf.len()) as isize })?;
        Ok(len as usize)
    }

    /// Writes the entire buffer, retrying short writes, or fails.
    pub fn send_all(&self, mut buf: &[u8]) -> io::Result<()> {
        while !buf.is_empty() {
            let written = cvt_isize(unsafe {
                libc::write(self.fd, buf.as_ptr().cast(), buf.len()) as isize
            })?;
            buf = &buf[written as usize..];
        }
        Ok(())
    }

    /// Closes the underlying descriptor. Safe to call more than once.
    pub fn close(&mut self) -> io::Result<()> {
        let fd = self.fd;
        self.fd = NO_FD;
        if fd != NO_FD {
            cvt(unsafe { libc::close(fd) })?;
        }
        Ok(())
    }
}

impl AsRawFd for Socket {
    fn as_raw_fd(&self) -> RawFd {
        self.fd
    }
}

impl Drop for Socket {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            warn!("failed to close socket fd: {}", err);
        }
    }
}

/// A [`Socket`] that additionally offers `connect`.
#[derive(Debug)]
pub struct ClientSocket(Socket);

impl Default for ClientSocket {
    fn default() -> ClientSocket {
        ClientSocket(Socket::new().expect("failed to create client socket"))
    }
}

impl ClientSocket {
    /// Connects to `address:port`.
    pub fn connect(&self, address: &str, port: u16) -> io::Result<()> {
        let ip = Ipv4Addr::from_str(address)
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidInput, err))?;
        let addr = sockaddr_in(ip, port);

        cvt(unsafe {
            libc::connect(
                self.0.as_raw_fd(),
                (&addr as *const libc::sockaddr_in).cast(),
                mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
            )
        })?;
        Ok(())
    }
}

impl Deref for ClientSocket {
    type Target = Socket;
    fn deref(&self) -> &Socket {
        &self.0
    }
}

impl DerefMut for ClientSocket {
    fn deref_mut(&mut self) -> &mut Socket {
        &mut self.0
    }
}

/// A [`Socket`] with `SO_REUSEADDR` set at construction, plus `listen` and
/// `accept`.
#[derive(Debug)]
pub struct ServerSocket(Socket);

impl Default for ServerSocket {
    fn default() -> ServerSocket {
        ServerSocket::new().expect("failed to create server socket")
    }
}

impl ServerSocket {
    /// Creates a listening-socket candidate with `SO_REUSEADDR` enabled.
    pub fn new() -> io::Result<ServerSocket> {
        let socket = Socket::new()?;
        let enable: libc::c_int = 1;
        cvt(unsafe {
            libc::setsockopt(
                socket.as_raw_fd(),
                libc::SOL_SOCKET,
                libc::SO_REUSEADDR,
                (&enable as *const libc::c_int).cast(),
                mem::size_of::<libc::c_int>() as libc::socklen_t,
            )
        })?;
        Ok(ServerSocket(socket))
    }

    /// Binds to `0.0.0.0:port` and starts listening with the given backlog.
    pub fn listen(&self, port: u16, backlog: i32) -> io::Result<()> {
        let addr = sockaddr_in(Ipv4Addr::UNSPECIFIED, port);

        cvt(unsafe {
            libc::bind(
                self.0.as_raw_fd(),
                (&addr as *const libc::sockaddr_in).cast(),
                mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
            )
        })?;
        cvt(unsafe { libc::listen(self.0.as_raw_fd(), backlog) })?;
        Ok(())
    }

    /// Accepts one pending connection. Non-blocking: returns
    /// `ErrorKind::WouldBlock` if none are pending.
    pub fn accept(&self) -> io::Result<Socket> {
        let peer_fd = cvt(unsafe { libc::accept(self.0.as_raw_fd(), std::ptr::null_mut(), std::ptr::null_mut()) })?;
        Ok(Socket::from_raw_fd(peer_fd))
    }
}

impl Deref for ServerSocket {
    type Target = Socket;
    fn deref(&self) -> &Socket {
        &self.0
    }
}

impl DerefMut for ServerSocket {
    fn deref_mut(&mut self) -> &mut Socket {
        &mut self.0
    }
}

fn sockaddr_in(ip: Ipv4Addr, port: u16) -> libc::sockaddr_in {
    libc::sockaddr_in {
        sin_family: libc::AF_INET as libc::sa_family_t,
        sin_port: port.to_be(),
        sin_addr: libc::in_addr {
            s_addr: u32::from_ne_bytes(ip.octets()),
        },
        sin_zero: [0; 8],
        #[cfg(any(target_os = "macos", target_os = "ios", target_os = "freebsd", target_os = "netbsd", target_os = "openbsd", target_os = "dragonfly"))]
        sin_len: mem::size_of::<libc::sockaddr_in>() as u8,
    }
}
