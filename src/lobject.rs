//! Large objects through the fastpath function interface.
//!
//! A large object descriptor lives only as long as the transaction that
//! opened it; the handle notices when that transaction has ended and refuses
//! further I/O.

use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::str::FromStr;

use bytes::Bytes;
use tracing::{debug, trace};

use crate::connection::{ConnInner, Connection, Step};
use crate::error::{Error, Result};
use crate::pg::types::Oid;
use crate::pg::TransactionStatus;

/// Bytes sent or requested per loread/lowrite call.
pub const LO_CHUNK_SIZE: usize = 8192;

pub const INV_WRITE: i32 = 0x0002_0000;
pub const INV_READ: i32 = 0x0004_0000;

const LO_FUNCTIONS: &[&str] = &[
    "lo_open",
    "lo_close",
    "loread",
    "lowrite",
    "lo_lseek64",
    "lo_tell64",
    "lo_truncate64",
    "lo_creat",
    "lo_create",
    "lo_unlink",
];

/// Access mode of a large object handle.
///
/// Parsed from `r`, `w`, `rw` or `n` (create or reference without opening),
/// optionally followed by `b` (binary, the default) or `t` (text).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoMode {
    pub read: bool,
    pub write: bool,
    pub binary: bool,
}

impl LoMode {
    fn opens(self) -> bool {
        self.read || self.write
    }

    fn flags(self) -> i32 {
        let mut flags = 0;
        if self.read {
            flags |= INV_READ;
        }
        if self.write {
            flags |= INV_WRITE;
        }
        flags
    }

    pub fn as_str(self) -> &'static str {
        match (self.read, self.write, self.binary) {
            (true, true, true) => "rwb",
            (true, true, false) => "rwt",
            (true, false, true) => "rb",
            (true, false, false) => "rt",
            (false, true, true) => "wb",
            (false, true, false) => "wt",
            (false, false, true) => "nb",
            (false, false, false) => "nt",
        }
    }
}

impl Default for LoMode {
    fn default() -> Self {
        Self {
            read: true,
            write: false,
            binary: true,
        }
    }
}

impl FromStr for LoMode {
    type Err = Error;

    fn from_str(mode: &str) -> Result<Self> {
        let (access, kind) = match mode.strip_suffix('b') {
            Some(rest) => (rest, Some(true)),
            None => match mode.strip_suffix('t') {
                Some(rest) => (rest, Some(false)),
                None => (mode, None),
            },
        };
        let (read, write) = match access {
            "" | "r" => (true, false),
            "w" => (false, true),
            "rw" => (true, true),
            "n" => (false, false),
            _ => return Err(Error::interface(format!("bad mode for lobject: '{}'", mode))),
        };
        Ok(Self {
            read,
            write,
            binary: kind.unwrap_or(true),
        })
    }
}

/// Origin for [`LargeObject::seek`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Whence {
    #[default]
    Set = 0,
    Current = 1,
    End = 2,
}

fn int4(value: i32) -> Option<Vec<u8>> {
    Some(value.to_be_bytes().to_vec())
}

fn int8(value: i64) -> Option<Vec<u8>> {
    Some(value.to_be_bytes().to_vec())
}

fn oid_arg(oid: Oid) -> Option<Vec<u8>> {
    Some(oid.0.to_be_bytes().to_vec())
}

fn fixed<const N: usize>(name: &str, result: &Option<Bytes>) -> Result<[u8; N]> {
    result
        .as_deref()
        .and_then(|bytes| <[u8; N]>::try_from(bytes).ok())
        .ok_or_else(|| Error::operational(format!("unexpected result from {}", name)))
}

/// Resolve the large object functions once per connection.
fn function_oid(inner: &mut ConnInner, name: &str) -> Result<Oid> {
    if inner.lo_functions.is_none() {
        let names = LO_FUNCTIONS
            .iter()
            .map(|f| format!("'{}'", f))
            .collect::<Vec<_>>()
            .join(",");
        let sql = format!(
            "SELECT proname, oid FROM pg_catalog.pg_proc WHERE proname IN ({}) \
             AND pronamespace = (SELECT oid FROM pg_catalog.pg_namespace \
             WHERE nspname = 'pg_catalog')",
            names
        );
        let outcome = inner.simple_query(&sql)?;
        let mut functions = HashMap::new();
        for row in outcome.result.map(|r| r.rows).unwrap_or_default() {
            let (Some(Some(proname)), Some(Some(oid))) = (row.first(), row.get(1)) else {
                continue;
            };
            let proname = String::from_utf8_lossy(proname).into_owned();
            let oid = std::str::from_utf8(oid)
                .ok()
                .and_then(|s| s.parse::<u32>().ok())
                .ok_or_else(|| Error::operational("invalid oid in pg_proc"))?;
            functions.insert(proname, Oid(oid));
        }
        debug!(count = functions.len(), "resolved large object functions");
        inner.lo_functions = Some(functions);
    }
    inner
        .lo_functions
        .as_ref()
        .and_then(|functions| functions.get(name).copied())
        .ok_or_else(|| Error::operational(format!("cannot determine OID of function {}", name)))
}

/// Call a large object function inside the current transaction.
fn call(inner: &mut ConnInner, name: &str, args: Vec<Option<Vec<u8>>>) -> Result<Option<Bytes>> {
    let function = function_oid(inner, name)?;
    trace!(function = name, "large object call");
    let steps = inner.with_begin(Step::function_call(function, args));
    let outcome = inner.run(steps)?.into_result()?;
    outcome
        .function_result
        .ok_or_else(|| Error::operational(format!("no result from {}", name)))
}

fn call_int4(inner: &mut ConnInner, name: &str, args: Vec<Option<Vec<u8>>>) -> Result<i32> {
    let result = call(inner, name, args)?;
    Ok(i32::from_be_bytes(fixed::<4>(name, &result)?))
}

fn call_int8(inner: &mut ConnInner, name: &str, args: Vec<Option<Vec<u8>>>) -> Result<i64> {
    let result = call(inner, name, args)?;
    Ok(i64::from_be_bytes(fixed::<8>(name, &result)?))
}

fn call_oid(inner: &mut ConnInner, name: &str, args: Vec<Option<Vec<u8>>>) -> Result<Oid> {
    let result = call(inner, name, args)?;
    Ok(Oid(u32::from_be_bytes(fixed::<4>(name, &result)?)))
}

fn check_usable(inner: &ConnInner) -> Result<()> {
    inner.ensure_sync("lobject")?;
    if inner.autocommit() {
        return Err(Error::programming(
            "can't use a lobject outside of transactions",
        ));
    }
    Ok(())
}

/// Handle on a server-side large object.
#[derive(Debug)]
pub struct LargeObject {
    conn: Connection,
    oid: Oid,
    fd: Option<i32>,
    mode: LoMode,
    epoch: u64,
}

impl Connection {
    /// Open the large object `oid`, or create one when `oid` is `None`.
    pub fn lobject(&self, oid: Option<Oid>, mode: &str) -> Result<LargeObject> {
        self.lobject_with(oid, mode, None, None)
    }

    /// Like [`lobject`](Self::lobject), creating the new object with a
    /// chosen OID and filling it from a local file.
    pub fn lobject_with(
        &self,
        oid: Option<Oid>,
        mode: &str,
        new_oid: Option<Oid>,
        new_file: Option<&Path>,
    ) -> Result<LargeObject> {
        let mode: LoMode = mode.parse()?;
        let mut inner = self.lock();
        check_usable(&inner)?;

        let oid = match oid {
            Some(oid) => oid,
            None => match new_oid {
                Some(requested) => call_oid(&mut inner, "lo_create", vec![oid_arg(requested)])?,
                None => call_oid(&mut inner, "lo_creat", vec![int4(INV_READ | INV_WRITE)])?,
            },
        };
        debug!(oid = %oid, mode = mode.as_str(), "opening large object");

        if let Some(path) = new_file {
            let data = fs::read(path).map_err(|e| {
                Error::operational(format!("could not open file \"{}\": {}", path.display(), e))
            })?;
            let fd = call_int4(&mut inner, "lo_open", vec![oid_arg(oid), int4(INV_WRITE)])?;
            write_chunks(&mut inner, fd, &data)?;
            call_int4(&mut inner, "lo_close", vec![int4(fd)])?;
        }

        let fd = if mode.opens() {
            Some(call_int4(
                &mut inner,
                "lo_open",
                vec![oid_arg(oid), int4(mode.flags())],
            )?)
        } else {
            None
        };
        let epoch = inner.machine.tx_epoch();
        drop(inner);

        Ok(LargeObject {
            conn: self.clone(),
            oid,
            fd,
            mode,
            epoch,
        })
    }
}

fn write_chunks(inner: &mut ConnInner, fd: i32, data: &[u8]) -> Result<usize> {
    let mut written = 0;
    for chunk in data.chunks(LO_CHUNK_SIZE) {
        let n = call_int4(inner, "lowrite", vec![int4(fd), Some(chunk.to_vec())])?;
        if n < 0 || n as usize != chunk.len() {
            return Err(Error::operational(format!(
                "lowrite wrote {} of {} bytes",
                n,
                chunk.len()
            )));
        }
        written += chunk.len();
    }
    Ok(written)
}

fn read_chunks(inner: &mut ConnInner, fd: i32, limit: Option<usize>) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    loop {
        let want = match limit {
            Some(limit) if out.len() >= limit => break,
            Some(limit) => (limit - out.len()).min(LO_CHUNK_SIZE),
            None => LO_CHUNK_SIZE,
        };
        let chunk = call(inner, "loread", vec![int4(fd), int4(want as i32)])?.unwrap_or_default();
        out.extend_from_slice(&chunk);
        if chunk.len() < want {
            break;
        }
    }
    Ok(out)
}

impl LargeObject {
    pub fn oid(&self) -> Oid {
        self.oid
    }

    pub fn mode(&self) -> LoMode {
        self.mode
    }

    /// Closed explicitly, or its transaction has ended.
    pub fn closed(&self) -> bool {
        self.fd.is_none() || self.conn.closed() || self.conn.lock().machine.tx_epoch() != self.epoch
    }

    /// The open descriptor, if its transaction is still the current one.
    fn descriptor(&self, inner: &ConnInner) -> Result<i32> {
        check_usable(inner)?;
        let Some(fd) = self.fd else {
            return Err(Error::interface("lobject already closed"));
        };
        if inner.machine.tx_epoch() != self.epoch
            || inner.machine.transaction_status() == TransactionStatus::Idle
        {
            return Err(Error::interface("lobject isn't valid anymore"));
        }
        Ok(fd)
    }

    /// Read up to `size` bytes from the current position.
    pub fn read(&mut self, size: usize) -> Result<Vec<u8>> {
        let conn = self.conn.clone();
        let mut inner = conn.lock();
        let fd = self.descriptor(&inner)?;
        if !self.mode.read {
            return Err(Error::programming("lobject not opened for reading"));
        }
        read_chunks(&mut inner, fd, Some(size))
    }

    /// Read from the current position to the end.
    pub fn read_all(&mut self) -> Result<Vec<u8>> {
        let conn = self.conn.clone();
        let mut inner = conn.lock();
        let fd = self.descriptor(&inner)?;
        if !self.mode.read {
            return Err(Error::programming("lobject not opened for reading"));
        }
        read_chunks(&mut inner, fd, None)
    }

    /// Read up to `size` bytes as UTF-8 text.
    pub fn read_text(&mut self, size: usize) -> Result<String> {
        let bytes = self.read(size)?;
        String::from_utf8(bytes).map_err(|e| Error::data(format!("invalid UTF-8 in lobject: {}", e)))
    }

    /// Write all of `data`; returns the number of bytes written.
    pub fn write(&mut self, data: &[u8]) -> Result<usize> {
        let conn = self.conn.clone();
        let mut inner = conn.lock();
        let fd = self.descriptor(&inner)?;
        if !self.mode.write {
            return Err(Error::programming("lobject not opened for writing"));
        }
        write_chunks(&mut inner, fd, data)
    }

    /// Move the position; returns the new offset.
    pub fn seek(&mut self, offset: i64, whence: Whence) -> Result<i64> {
        let conn = self.conn.clone();
        let mut inner = conn.lock();
        let fd = self.descriptor(&inner)?;
        call_int8(
            &mut inner,
            "lo_lseek64",
            vec![int4(fd), int8(offset), int4(whence as i32)],
        )
    }

    pub fn tell(&self) -> Result<i64> {
        let conn = self.conn.clone();
        let mut inner = conn.lock();
        let fd = self.descriptor(&inner)?;
        call_int8(&mut inner, "lo_tell64", vec![int4(fd)])
    }

    /// Cut or extend the object to `len` bytes.
    pub fn truncate(&mut self, len: i64) -> Result<()> {
        let conn = self.conn.clone();
        let mut inner = conn.lock();
        let fd = self.descriptor(&inner)?;
        call_int4(&mut inner, "lo_truncate64", vec![int4(fd), int8(len)])?;
        Ok(())
    }

    /// Close the descriptor. A no-op once the transaction has ended.
    pub fn close(&mut self) -> Result<()> {
        let Some(fd) = self.fd.take() else {
            return Ok(());
        };
        let conn = self.conn.clone();
        let mut inner = conn.lock();
        if inner.ensure_open().is_err()
            || inner.machine.tx_epoch() != self.epoch
            || inner.machine.transaction_status() != TransactionStatus::InTransaction
        {
            return Ok(());
        }
        call_int4(&mut inner, "lo_close", vec![int4(fd)])?;
        Ok(())
    }

    /// Close the handle and delete the object from the database.
    pub fn unlink(&mut self) -> Result<()> {
        self.close()?;
        let conn = self.conn.clone();
        let mut inner = conn.lock();
        check_usable(&inner)?;
        debug!(oid = %self.oid, "unlinking large object");
        call_int4(&mut inner, "lo_unlink", vec![oid_arg(self.oid)])?;
        Ok(())
    }

    /// Copy the whole object into a local file.
    pub fn export(&self, path: &Path) -> Result<()> {
        let conn = self.conn.clone();
        let mut inner = conn.lock();
        check_usable(&inner)?;
        let fd = call_int4(&mut inner, "lo_open", vec![oid_arg(self.oid), int4(INV_READ)])?;
        let data = read_chunks(&mut inner, fd, None)?;
        call_int4(&mut inner, "lo_close", vec![int4(fd)])?;
        fs::write(path, data).map_err(|e| {
            Error::operational(format!("could not write file \"{}\": {}", path.display(), e))
        })
    }
}
