//! Out-of-band query cancellation.

use std::io::{self, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;

#[cfg(unix)]
use std::os::unix::net::UnixStream;

use tracing::debug;

use super::machine::BackendKey;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::pg::protocol::{CancelRequestMessage, FrontendMessage};
use crate::pg::PgError;

const DEFAULT_CANCEL_TIMEOUT: Duration = Duration::from_secs(10);

/// Everything needed to cancel the running query of one backend.
///
/// The token is detached from the connection's lock, so another thread can
/// use it while the connection is blocked in a command. Cancellation is best
/// effort: the command may still complete normally, or fail with
/// `QueryCanceled` (SQLSTATE 57014).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CancelToken {
    host: String,
    port: u16,
    key: BackendKey,
    timeout: Duration,
}

impl CancelToken {
    pub(crate) fn new(config: &Config, key: BackendKey) -> Self {
        Self {
            host: config.host.clone(),
            port: config.port,
            key,
            timeout: config.connect_timeout.unwrap_or(DEFAULT_CANCEL_TIMEOUT),
        }
    }

    /// Backend process whose query this token cancels.
    pub fn backend_pid(&self) -> i32 {
        self.key.process_id
    }

    pub(crate) fn request(&self) -> CancelRequestMessage {
        CancelRequestMessage {
            process_id: self.key.process_id,
            secret_key: self.key.secret_key,
        }
    }

    /// Open a short-lived connection and send the cancel request.
    pub fn cancel(&self) -> Result<()> {
        debug!(pid = self.key.process_id, host = %self.host, "sending cancel request");
        self.send().map_err(|e| {
            Error::operational(format!("could not send cancel request: {}", PgError::Io(e)))
        })
    }

    fn send(&self) -> io::Result<()> {
        let packet = self.request().encode();
        if self.host.starts_with('/') {
            #[cfg(unix)]
            {
                let path = format!("{}/.s.PGSQL.{}", self.host.trim_end_matches('/'), self.port);
                let mut stream = UnixStream::connect(path)?;
                stream.set_read_timeout(Some(self.timeout))?;
                return exchange(&mut stream, &packet);
            }
            #[cfg(not(unix))]
            return Err(io::ErrorKind::Unsupported.into());
        }

        let mut last_err = None;
        for addr in (self.host.as_str(), self.port).to_socket_addrs()? {
            match TcpStream::connect_timeout(&addr, self.timeout) {
                Ok(mut stream) => {
                    stream.set_read_timeout(Some(self.timeout))?;
                    return exchange(&mut stream, &packet);
                }
                Err(e) => last_err = Some(e),
            }
        }
        Err(last_err.unwrap_or_else(|| io::ErrorKind::NotFound.into()))
    }
}

/// Write the request and wait for the server to hang up.
fn exchange<S: Read + Write>(stream: &mut S, packet: &[u8]) -> io::Result<()> {
    stream.write_all(packet)?;
    stream.flush()?;
    let mut sink = [0u8; 16];
    loop {
        match stream.read(&mut sink) {
            Ok(0) => return Ok(()),
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            // The request is already out; a slow hang-up is not a failure.
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {
                return Ok(())
            }
            Err(e) => return Err(e),
        }
    }
}
