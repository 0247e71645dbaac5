//! Tokio driver for async-mode connections.
//!
//! [`AsyncConnection`] owns the socket readiness side of an async
//! [`Connection`]: it polls the state machine and awaits whatever the
//! machine asks for, so every operation becomes a future.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::Interest as TokioInterest;
use tokio::net::TcpStream;
#[cfg(unix)]
use tokio::net::UnixStream;
use tracing::{debug, info};

use crate::config::Config;
use crate::connection::{Connection, Notify, PollResult};
use crate::cursor::Cursor;
use crate::error::{Error, Result};
use crate::pg::transport::{Interest, Transport};
use crate::sql::Params;

enum Stream {
    Tcp(TcpStream),
    #[cfg(unix)]
    Unix(UnixStream),
}

impl Stream {
    fn try_read(&self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Stream::Tcp(s) => s.try_read(buf),
            #[cfg(unix)]
            Stream::Unix(s) => s.try_read(buf),
        }
    }

    fn try_write(&self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Stream::Tcp(s) => s.try_write(buf),
            #[cfg(unix)]
            Stream::Unix(s) => s.try_write(buf),
        }
    }

    async fn ready(&self, interest: TokioInterest) -> io::Result<()> {
        match self {
            Stream::Tcp(s) => s.ready(interest).await.map(|_| ()),
            #[cfg(unix)]
            Stream::Unix(s) => s.ready(interest).await.map(|_| ()),
        }
    }

    #[cfg(unix)]
    fn raw_fd(&self) -> i64 {
        use std::os::unix::io::AsRawFd;
        match self {
            Stream::Tcp(s) => s.as_raw_fd() as i64,
            Stream::Unix(s) => s.as_raw_fd() as i64,
        }
    }
}

/// Transport over a tokio socket. Readiness is awaited by
/// [`AsyncConnection`], never by the transport itself.
struct TokioTransport {
    stream: Arc<Stream>,
}

impl Transport for TokioTransport {
    fn try_read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.stream.try_read(buf)
    }

    fn try_write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.stream.try_write(buf)
    }

    fn wait(&mut self, _interest: Interest, _timeout: Option<Duration>) -> io::Result<()> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "drive the connection with AsyncConnection",
        ))
    }

    fn shutdown(&mut self) -> io::Result<()> {
        Ok(())
    }

    fn raw_fd(&self) -> Option<i64> {
        #[cfg(unix)]
        {
            Some(self.stream.raw_fd())
        }
        #[cfg(not(unix))]
        {
            None
        }
    }
}

/// An async-mode connection driven by tokio.
#[derive(Clone)]
pub struct AsyncConnection {
    conn: Connection,
    stream: Arc<Stream>,
}

impl AsyncConnection {
    /// Connect and complete the handshake.
    pub async fn connect(config: Config) -> Result<Self> {
        info!(host = %config.host, port = config.port, database = config.database(), "connecting (async)");
        let stream = open_stream(&config).await.map_err(|e| {
            Error::operational(format!(
                "could not connect to server at \"{}\", port {}: {}",
                config.host, config.port, e
            ))
        })?;
        let stream = Arc::new(stream);
        let transport = TokioTransport {
            stream: Arc::clone(&stream),
        };
        let timeout = config.connect_timeout;
        let conn = Connection::start_with_transport(Box::new(transport), config)?;
        let this = Self { conn, stream };

        let handshake = this.drive();
        let result = match timeout {
            Some(timeout) => tokio::time::timeout(timeout, handshake)
                .await
                .map_err(|_| Error::operational("timeout expired"))?,
            None => handshake.await,
        };
        if let Err(err) = result {
            this.conn.abort();
            return Err(err);
        }
        debug!("async connection established");
        Ok(this)
    }

    /// The underlying async-mode connection.
    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    pub fn cursor(&self) -> Cursor {
        self.conn.cursor()
    }

    /// Poll the connection until the current operation is done.
    pub async fn drive(&self) -> Result<()> {
        loop {
            match self.conn.poll()? {
                PollResult::Done => return Ok(()),
                PollResult::Ready => tokio::task::yield_now().await,
                result => self.wait(result).await?,
            }
        }
    }

    /// Await the socket readiness `result` asks for.
    pub async fn wait(&self, result: PollResult) -> Result<()> {
        let interest = match result {
            PollResult::NeedRead => TokioInterest::READABLE,
            PollResult::NeedWrite => TokioInterest::WRITABLE,
            PollResult::Ready | PollResult::Done => return Ok(()),
        };
        self.stream
            .ready(interest)
            .await
            .map_err(|e| Error::operational(format!("socket wait failed: {}", e)))
    }

    /// Run `execute` on `cursor` and await its result.
    pub async fn execute<'a>(
        &self,
        cursor: &mut Cursor,
        sql: &str,
        params: impl Into<Params<'a>>,
    ) -> Result<()> {
        cursor.execute(sql, params)?;
        self.complete(cursor).await
    }

    /// Run `execute_binary` on `cursor` and await its result.
    pub async fn execute_binary<'a>(
        &self,
        cursor: &mut Cursor,
        sql: &str,
        params: impl Into<Params<'a>>,
    ) -> Result<()> {
        cursor.execute_binary(sql, params)?;
        self.complete(cursor).await
    }

    async fn complete(&self, cursor: &mut Cursor) -> Result<()> {
        loop {
            match cursor.poll()? {
                PollResult::Done => return Ok(()),
                PollResult::Ready => tokio::task::yield_now().await,
                result => self.wait(result).await?,
            }
        }
    }

    /// Wait for at least one notification.
    pub async fn notifies(&self) -> Result<Vec<Notify>> {
        loop {
            if self.conn.poll()? != PollResult::Done {
                return Err(Error::programming(
                    "notifies cannot be awaited while a command is in progress",
                ));
            }
            let notifies = self.conn.notifies();
            if !notifies.is_empty() {
                return Ok(notifies);
            }
            self.wait(PollResult::NeedRead).await?;
        }
    }

    /// Cancel the command in flight without blocking the runtime.
    pub async fn cancel(&self) -> Result<()> {
        let token = self
            .conn
            .cancel_token()
            .ok_or_else(|| Error::interface("no cancel key available for this connection"))?;
        tokio::task::spawn_blocking(move || token.cancel())
            .await
            .map_err(|e| Error::operational(format!("cancel task failed: {}", e)))?
    }

    pub fn close(&self) {
        self.conn.close();
    }
}

async fn open_stream(config: &Config) -> io::Result<Stream> {
    if config.is_unix_socket() {
        #[cfg(unix)]
        {
            let path = format!("{}/.s.PGSQL.{}", config.host, config.port);
            return UnixStream::connect(path).await.map(Stream::Unix);
        }
        #[cfg(not(unix))]
        {
            return Err(io::ErrorKind::Unsupported.into());
        }
    }
    let connect = TcpStream::connect((config.host.as_str(), config.port));
    let stream = match config.connect_timeout {
        Some(timeout) => tokio::time::timeout(timeout, connect)
            .await
            .map_err(|_| io::Error::from(io::ErrorKind::TimedOut))??,
        None => connect.await?,
    };
    stream.set_nodelay(true)?;
    Ok(Stream::Tcp(stream))
}
