//! Byte transports the connection state machine polls.
//!
//! A transport never blocks in `try_read`/`try_write`; when no progress is
//! possible it fails with `ErrorKind::WouldBlock`. Blocking happens only in
//! `wait`, which sync-mode callers use between polls.

use std::io::{self, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;

#[cfg(unix)]
use std::os::unix::net::UnixStream;

use tracing::debug;

/// What the state machine is waiting for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interest {
    Read,
    Write,
}

/// Non-blocking byte stream to the server.
pub trait Transport: Send {
    /// Read available bytes; `Ok(0)` is end of stream.
    fn try_read(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Write as much of `buf` as possible without blocking.
    fn try_write(&mut self, buf: &[u8]) -> io::Result<usize>;

    /// Block until the transport is ready for `interest` or `timeout` expires
    /// (`ErrorKind::TimedOut`).
    fn wait(&mut self, interest: Interest, timeout: Option<Duration>) -> io::Result<()>;

    /// Whether the transport buffers outgoing bytes of its own (TLS records).
    fn has_pending_output(&self) -> bool {
        false
    }

    /// Push transport-level buffered output.
    fn flush_output(&mut self) -> io::Result<()> {
        Ok(())
    }

    /// Close the underlying socket.
    fn shutdown(&mut self) -> io::Result<()>;

    /// OS handle for callers that register the socket with their own poller.
    fn raw_fd(&self) -> Option<i64> {
        None
    }

    /// A second handle on the socket that can shut it down while another
    /// thread is blocked in `wait`.
    fn shutdown_handle(&self) -> Option<ShutdownHandle> {
        None
    }
}

/// Shuts a socket down from outside the connection lock.
pub struct ShutdownHandle(Socket);

impl ShutdownHandle {
    /// Wake any blocked reader or writer; they see end of stream.
    pub fn shutdown(&self) -> io::Result<()> {
        self.0.shutdown()
    }
}

/// Placeholder left behind while a transport is being upgraded or after close.
pub struct Detached;

impl Transport for Detached {
    fn try_read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
        Err(io::ErrorKind::NotConnected.into())
    }

    fn try_write(&mut self, _buf: &[u8]) -> io::Result<usize> {
        Err(io::ErrorKind::NotConnected.into())
    }

    fn wait(&mut self, _interest: Interest, _timeout: Option<Duration>) -> io::Result<()> {
        Err(io::ErrorKind::NotConnected.into())
    }

    fn shutdown(&mut self) -> io::Result<()> {
        Ok(())
    }
}

// ============================================================================
// Sockets
// ============================================================================

enum Socket {
    Tcp(TcpStream),
    #[cfg(unix)]
    Unix(UnixStream),
}

impl Socket {
    fn set_nonblocking(&self, nonblocking: bool) -> io::Result<()> {
        match self {
            Socket::Tcp(s) => s.set_nonblocking(nonblocking),
            #[cfg(unix)]
            Socket::Unix(s) => s.set_nonblocking(nonblocking),
        }
    }

    fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        match self {
            Socket::Tcp(s) => s.set_read_timeout(timeout),
            #[cfg(unix)]
            Socket::Unix(s) => s.set_read_timeout(timeout),
        }
    }

    fn try_clone(&self) -> io::Result<Socket> {
        Ok(match self {
            Socket::Tcp(s) => Socket::Tcp(s.try_clone()?),
            #[cfg(unix)]
            Socket::Unix(s) => Socket::Unix(s.try_clone()?),
        })
    }

    fn shutdown(&self) -> io::Result<()> {
        let result = match self {
            Socket::Tcp(s) => s.shutdown(std::net::Shutdown::Both),
            #[cfg(unix)]
            Socket::Unix(s) => s.shutdown(std::net::Shutdown::Both),
        };
        match result {
            Err(e) if e.kind() == io::ErrorKind::NotConnected => Ok(()),
            other => other,
        }
    }

    fn set_write_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        match self {
            Socket::Tcp(s) => s.set_write_timeout(timeout),
            #[cfg(unix)]
            Socket::Unix(s) => s.set_write_timeout(timeout),
        }
    }
}

impl Read for Socket {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Socket::Tcp(s) => s.read(buf),
            #[cfg(unix)]
            Socket::Unix(s) => s.read(buf),
        }
    }
}

impl Write for Socket {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Socket::Tcp(s) => s.write(buf),
            #[cfg(unix)]
            Socket::Unix(s) => s.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Blocking-socket transport switched to non-blocking mode, for TCP and
/// Unix-domain connections.
pub struct SocketTransport {
    socket: Socket,
    /// Byte consumed by `wait(Read)`, returned by the next `try_read`.
    lookahead: Option<u8>,
    /// `wait(Read)` observed end of stream.
    eof: bool,
    /// Set by `wait(Write)`: the next write blocks instead of failing.
    block_next_write: Option<Option<Duration>>,
}

impl SocketTransport {
    /// Connect over TCP, honouring the connect timeout for each resolved address.
    pub fn connect_tcp(host: &str, port: u16, timeout: Option<Duration>) -> io::Result<Self> {
        let mut last_err = None;
        for addr in (host, port).to_socket_addrs()? {
            let attempt = match timeout {
                Some(t) => TcpStream::connect_timeout(&addr, t),
                None => TcpStream::connect(addr),
            };
            match attempt {
                Ok(stream) => {
                    debug!(%addr, "tcp connection established");
                    stream.set_nodelay(true)?;
                    return Self::new(Socket::Tcp(stream));
                }
                Err(e) => {
                    debug!(%addr, error = %e, "tcp connect attempt failed");
                    last_err = Some(e);
                }
            }
        }
        Err(last_err.unwrap_or_else(|| {
            io::Error::new(
                io::ErrorKind::NotFound,
                format!("could not resolve host \"{}\"", host),
            )
        }))
    }

    /// Connect to the server's Unix socket `<dir>/.s.PGSQL.<port>`.
    #[cfg(unix)]
    pub fn connect_unix(dir: &str, port: u16) -> io::Result<Self> {
        let path = format!("{}/.s.PGSQL.{}", dir.trim_end_matches('/'), port);
        let stream = UnixStream::connect(&path)?;
        debug!(%path, "unix socket connection established");
        Self::new(Socket::Unix(stream))
    }

    /// Wrap an already connected TCP stream.
    pub fn from_tcp(stream: TcpStream) -> io::Result<Self> {
        Self::new(Socket::Tcp(stream))
    }

    fn new(socket: Socket) -> io::Result<Self> {
        socket.set_nonblocking(true)?;
        Ok(Self {
            socket,
            lookahead: None,
            eof: false,
            block_next_write: None,
        })
    }

    fn blocking<T>(
        &mut self,
        op: impl FnOnce(&mut Socket) -> io::Result<T>,
    ) -> io::Result<T> {
        self.socket.set_nonblocking(false)?;
        let result = op(&mut self.socket);
        self.socket.set_nonblocking(true)?;
        result
    }
}

fn timed_out(e: io::Error) -> io::Error {
    // Socket timeouts surface as WouldBlock on Unix and TimedOut on Windows.
    if e.kind() == io::ErrorKind::WouldBlock {
        io::ErrorKind::TimedOut.into()
    } else {
        e
    }
}

impl Transport for SocketTransport {
    fn try_read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        if let Some(byte) = self.lookahead.take() {
            buf[0] = byte;
            return match self.socket.read(&mut buf[1..]) {
                Ok(n) => Ok(n + 1),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(1),
                Err(e) => Err(e),
            };
        }
        if self.eof {
            return Ok(0);
        }
        self.socket.read(buf)
    }

    fn try_write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self.block_next_write.take() {
            None => self.socket.write(buf),
            Some(timeout) => self.blocking(|socket| {
                socket.set_write_timeout(timeout)?;
                let n = socket.write(buf).map_err(timed_out);
                socket.set_write_timeout(None)?;
                n
            }),
        }
    }

    fn wait(&mut self, interest: Interest, timeout: Option<Duration>) -> io::Result<()> {
        match interest {
            Interest::Read => {
                if self.lookahead.is_some() || self.eof {
                    return Ok(());
                }
                let mut peek = [0u8; 1];
                let n = self.blocking(|socket| {
                    socket.set_read_timeout(timeout)?;
                    let n = socket.read(&mut peek).map_err(timed_out);
                    socket.set_read_timeout(None)?;
                    n
                })?;
                if n == 0 {
                    self.eof = true;
                } else {
                    self.lookahead = Some(peek[0]);
                }
                Ok(())
            }
            Interest::Write => {
                self.block_next_write = Some(timeout);
                Ok(())
            }
        }
    }

    fn shutdown(&mut self) -> io::Result<()> {
        self.socket.shutdown()
    }

    fn shutdown_handle(&self) -> Option<ShutdownHandle> {
        match self.socket.try_clone() {
            Ok(socket) => Some(ShutdownHandle(socket)),
            Err(e) => {
                debug!(error = %e, "could not clone socket");
                None
            }
        }
    }

    #[cfg(unix)]
    fn raw_fd(&self) -> Option<i64> {
        use std::os::fd::AsRawFd;
        Some(match &self.socket {
            Socket::Tcp(s) => s.as_raw_fd() as i64,
            Socket::Unix(s) => s.as_raw_fd() as i64,
        })
    }
}
