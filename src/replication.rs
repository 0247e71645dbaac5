//! Logical and physical replication over a replication connection.
//!
//! After [`ReplicationCursor::start_replication`] the connection stays busy
//! streaming until the server ends the stream or the connection is closed.
//! The server keeps WAL until the client confirms it with
//! [`send_feedback`](ReplicationCursor::send_feedback): a consumer that never
//! acknowledges makes the server retain WAL without bound and can fill its
//! disk. Nothing here acknowledges on the caller's behalf beyond echoing the
//! positions the caller has already reported.

use std::ops::ControlFlow;
use std::time::{Duration, Instant};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use tracing::{debug, trace};

use crate::config::ReplicationMode;
use crate::connection::{CommandMode, ConnInner, Connection, CopyState, PollResult, Step};
use crate::error::{Error, Result};
use crate::pg::replication::{
    encode_standby_status_update, parse_copy_data, pg_now, ReplicationCopyData, PG_EPOCH_MICROS,
};
use crate::pg::Lsn;
use crate::sql::{quote_ident, quote_literal};

/// Default interval between automatic status updates.
pub const DEFAULT_STATUS_INTERVAL: Duration = Duration::from_secs(10);

/// One XLogData message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicationMessage {
    /// WAL position of the start of `payload`.
    pub data_start: Lsn,
    /// Server's current end of WAL.
    pub wal_end: Lsn,
    /// Microseconds since 2000-01-01 at which the server sent the message.
    pub send_time: i64,
    pub payload: Bytes,
}

impl ReplicationMessage {
    pub fn data_size(&self) -> usize {
        self.payload.len()
    }

    pub fn send_time_utc(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp_micros(self.send_time + PG_EPOCH_MICROS)
    }
}

/// Result row of `CREATE_REPLICATION_SLOT`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicationSlot {
    pub slot_name: String,
    pub consistent_point: Option<Lsn>,
    pub snapshot_name: Option<String>,
    pub output_plugin: Option<String>,
}

pub struct ReplicationCursor {
    conn: Connection,
    streaming: bool,
    command: Option<u64>,
    status_interval: Duration,
    write_lsn: Lsn,
    flush_lsn: Lsn,
    apply_lsn: Lsn,
    wal_end: Lsn,
    last_feedback: Option<Instant>,
    feedback_timestamp: Option<DateTime<Utc>>,
    io_timestamp: Option<DateTime<Utc>>,
}

impl Connection {
    /// Cursor for replication commands; needs a connection opened with
    /// `replication=database` or `replication=true`.
    pub fn replication_cursor(&self) -> Result<ReplicationCursor> {
        if self.config().replication.is_none() {
            return Err(Error::programming(
                "replication cursors need a replication connection",
            ));
        }
        Ok(ReplicationCursor {
            conn: self.clone(),
            streaming: false,
            command: None,
            status_interval: DEFAULT_STATUS_INTERVAL,
            write_lsn: Lsn::ZERO,
            flush_lsn: Lsn::ZERO,
            apply_lsn: Lsn::ZERO,
            wal_end: Lsn::ZERO,
            last_feedback: None,
            feedback_timestamp: None,
            io_timestamp: None,
        })
    }
}

fn default_kind(conn: &Connection) -> ReplicationMode {
    conn.config().replication.unwrap_or(ReplicationMode::Physical)
}

impl ReplicationCursor {
    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    /// Whether `start_replication` has begun a stream that has not ended.
    pub fn is_streaming(&self) -> bool {
        self.streaming
    }

    /// Server's end of WAL as of the last message received.
    pub fn wal_end(&self) -> Lsn {
        self.wal_end
    }

    /// When the last status update was sent.
    pub fn feedback_timestamp(&self) -> Option<DateTime<Utc>> {
        self.feedback_timestamp
    }

    /// When the last message was received.
    pub fn io_timestamp(&self) -> Option<DateTime<Utc>> {
        self.io_timestamp
    }

    pub fn status_interval(&self) -> Duration {
        self.status_interval
    }

    pub fn set_status_interval(&mut self, interval: Duration) -> Result<()> {
        if interval < Duration::from_millis(1) {
            return Err(Error::programming("status_interval must be >= 1ms"));
        }
        self.status_interval = interval;
        Ok(())
    }

    fn check_idle(&self) -> Result<()> {
        if self.streaming {
            return Err(Error::programming(
                "replication is already in progress on this cursor",
            ));
        }
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Slots
    // ------------------------------------------------------------------------

    /// Create a slot; logical slots need an output plugin, physical ones
    /// must not have one.
    pub fn create_replication_slot(
        &mut self,
        slot_name: &str,
        kind: Option<ReplicationMode>,
        output_plugin: Option<&str>,
    ) -> Result<ReplicationSlot> {
        self.check_idle()?;
        let kind = kind.unwrap_or_else(|| default_kind(&self.conn));
        let mut sql = format!("CREATE_REPLICATION_SLOT {} ", quote_ident(slot_name)?);
        match (kind, output_plugin) {
            (ReplicationMode::Logical, Some(plugin)) => {
                sql.push_str("LOGICAL ");
                sql.push_str(&quote_ident(plugin)?);
            }
            (ReplicationMode::Logical, None) => {
                return Err(Error::programming(
                    "output plugin name is required to create logical replication slot",
                ));
            }
            (ReplicationMode::Physical, None) => sql.push_str("PHYSICAL"),
            (ReplicationMode::Physical, Some(_)) => {
                return Err(Error::programming(
                    "cannot specify output plugin name when creating physical replication slot",
                ));
            }
        }
        debug!(slot = slot_name, "creating replication slot");

        let mut inner = self.conn.lock();
        inner.ensure_sync("create_replication_slot")?;
        let outcome = inner.run(vec![Step::query(sql.as_bytes())])?.into_result()?;
        let row = outcome
            .result
            .and_then(|result| result.rows.into_iter().next())
            .unwrap_or_default();
        let text = |index: usize| -> Option<String> {
            row.get(index)
                .and_then(|value| value.as_ref())
                .map(|bytes| String::from_utf8_lossy(bytes).into_owned())
        };
        Ok(ReplicationSlot {
            slot_name: text(0).unwrap_or_else(|| slot_name.to_string()),
            consistent_point: text(1).and_then(|lsn| lsn.parse().ok()),
            snapshot_name: text(2),
            output_plugin: text(3),
        })
    }

    pub fn drop_replication_slot(&mut self, slot_name: &str) -> Result<()> {
        self.check_idle()?;
        let sql = format!("DROP_REPLICATION_SLOT {}", quote_ident(slot_name)?);
        debug!(slot = slot_name, "dropping replication slot");
        let mut inner = self.conn.lock();
        inner.ensure_sync("drop_replication_slot")?;
        inner.run(vec![Step::query(sql.as_bytes())])?.into_result()?;
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Streaming
    // ------------------------------------------------------------------------

    /// `START_REPLICATION` for `slot_name`.
    ///
    /// `timeline` applies to physical replication only (0 means the current
    /// one) and `options` to logical replication only.
    pub fn start_replication(
        &mut self,
        slot_name: Option<&str>,
        kind: Option<ReplicationMode>,
        start_lsn: Lsn,
        timeline: u32,
        options: &[(&str, &str)],
    ) -> Result<()> {
        self.check_idle()?;
        let kind = kind.unwrap_or_else(|| default_kind(&self.conn));
        let conn = self.conn.clone();
        let mut inner = conn.lock();
        inner.ensure_open()?;
        let sql = start_replication_sql(&inner, slot_name, kind, start_lsn, timeline, options)?;
        debug!(%sql, "starting replication");

        let id = inner
            .machine
            .begin_command(vec![Step::query(sql.as_bytes())], CommandMode::Streaming)?;
        self.command = Some(id);
        self.streaming = true;
        self.write_lsn = start_lsn;
        self.flush_lsn = start_lsn;
        self.apply_lsn = start_lsn;
        self.last_feedback = Some(Instant::now());
        if inner.is_async() {
            return Ok(());
        }

        loop {
            match inner.machine.drive(None)? {
                PollResult::Ready if inner.machine.copy_state() == CopyState::Both => return Ok(()),
                PollResult::Ready => {}
                _ => return self.finish(&mut inner),
            }
        }
    }

    /// Collect the end of the stream; the server's error, if any, surfaces.
    fn finish(&mut self, inner: &mut ConnInner) -> Result<()> {
        self.streaming = false;
        let Some(id) = self.command.take() else {
            return Ok(());
        };
        match inner.machine.take_outcome(id) {
            Some(outcome) => outcome.into_result().map(|_| ()),
            None => Ok(()),
        }
    }

    /// Next XLogData message, without blocking; `None` when nothing is
    /// available yet or the stream has ended.
    ///
    /// Keepalives are consumed here, answered when the server asks, and a
    /// status update goes out whenever `status_interval` has elapsed.
    pub fn read_message(&mut self) -> Result<Option<ReplicationMessage>> {
        if !self.streaming {
            return Err(Error::programming("replication is not in progress"));
        }
        let conn = self.conn.clone();
        let mut inner = conn.lock();
        loop {
            while let Some(data) = inner.machine.take_copy_data() {
                self.io_timestamp = Some(Utc::now());
                match parse_copy_data(data)? {
                    ReplicationCopyData::XLogData {
                        wal_start,
                        wal_end,
                        server_time,
                        data,
                    } => {
                        trace!(%wal_start, len = data.len(), "xlog data");
                        self.wal_end = wal_end;
                        return Ok(Some(ReplicationMessage {
                            data_start: wal_start,
                            wal_end,
                            send_time: server_time,
                            payload: data,
                        }));
                    }
                    ReplicationCopyData::KeepAlive {
                        wal_end,
                        reply_requested,
                        ..
                    } => {
                        trace!(%wal_end, reply_requested, "keepalive");
                        self.wal_end = wal_end;
                        if reply_requested {
                            self.send_status(&mut inner, false)?;
                        }
                    }
                }
            }

            match inner.machine.poll()? {
                PollResult::Ready => continue,
                PollResult::Done => {
                    debug!("replication stream ended");
                    self.finish(&mut inner)?;
                    return Ok(None);
                }
                PollResult::NeedRead | PollResult::NeedWrite => {
                    if self.feedback_due() {
                        self.send_status(&mut inner, false)?;
                    }
                    return Ok(None);
                }
            }
        }
    }

    /// Record processed positions; positions only move forward.
    ///
    /// The update is sent right away when `reply` or `force` is set, and
    /// otherwise with the next periodic status update.
    pub fn send_feedback(
        &mut self,
        write: Option<Lsn>,
        flush: Option<Lsn>,
        apply: Option<Lsn>,
        reply: bool,
        force: bool,
    ) -> Result<()> {
        if let Some(lsn) = write {
            self.write_lsn = self.write_lsn.max(lsn);
        }
        if let Some(lsn) = flush {
            self.flush_lsn = self.flush_lsn.max(lsn);
        }
        if let Some(lsn) = apply {
            self.apply_lsn = self.apply_lsn.max(lsn);
        }
        if !(reply || force) {
            return Ok(());
        }
        if !self.streaming {
            return Err(Error::programming("replication is not in progress"));
        }
        let conn = self.conn.clone();
        let mut inner = conn.lock();
        self.send_status(&mut inner, reply)
    }

    fn feedback_due(&self) -> bool {
        self.last_feedback
            .map_or(true, |sent| sent.elapsed() >= self.status_interval)
    }

    fn send_status(&mut self, inner: &mut ConnInner, reply: bool) -> Result<()> {
        trace!(
            write = %self.write_lsn,
            flush = %self.flush_lsn,
            apply = %self.apply_lsn,
            "sending standby status update"
        );
        let update = encode_standby_status_update(
            self.write_lsn,
            self.flush_lsn,
            self.apply_lsn,
            pg_now(),
            reply,
        );
        inner.machine.put_copy_data(&update)?;
        if !inner.is_async() {
            inner.machine.flush_blocking()?;
        }
        self.last_feedback = Some(Instant::now());
        self.feedback_timestamp = Some(Utc::now());
        Ok(())
    }

    /// Feed every message to `consume` until it breaks or the stream ends.
    ///
    /// Blocks between messages, waking up to send status updates every
    /// `status_interval`. Sync connections only.
    pub fn consume_stream<F>(&mut self, mut consume: F) -> Result<()>
    where
        F: FnMut(&mut ReplicationCursor, ReplicationMessage) -> Result<ControlFlow<()>>,
    {
        if self.conn.is_async() {
            return Err(Error::programming(
                "consume_stream cannot be used in asynchronous mode",
            ));
        }
        loop {
            if let Some(message) = self.read_message()? {
                if consume(self, message)?.is_break() {
                    return Ok(());
                }
                continue;
            }
            if !self.streaming {
                return Ok(());
            }

            let next_feedback = self
                .last_feedback
                .map_or_else(Instant::now, |sent| sent + self.status_interval);
            let conn = self.conn.clone();
            let mut inner = conn.lock();
            if let Err(err) = inner.machine.wait(PollResult::NeedRead, Some(next_feedback)) {
                if Instant::now() < next_feedback {
                    return Err(err);
                }
                self.send_status(&mut inner, false)?;
            }
        }
    }
}

fn start_replication_sql(
    inner: &ConnInner,
    slot_name: Option<&str>,
    kind: ReplicationMode,
    start_lsn: Lsn,
    timeline: u32,
    options: &[(&str, &str)],
) -> Result<String> {
    let mut sql = String::from("START_REPLICATION ");
    if let Some(slot) = slot_name {
        sql.push_str("SLOT ");
        sql.push_str(&quote_ident(slot)?);
        sql.push(' ');
    }
    match kind {
        ReplicationMode::Logical => {
            if slot_name.is_none() {
                return Err(Error::programming(
                    "slot name is required for logical replication",
                ));
            }
            if timeline != 0 {
                return Err(Error::programming(
                    "cannot specify timeline for logical replication",
                ));
            }
            sql.push_str(&format!("LOGICAL {}", start_lsn));
            if !options.is_empty() {
                let rendered = options
                    .iter()
                    .map(|(name, value)| {
                        Ok(format!(
                            "{} {}",
                            quote_ident(name)?,
                            quote_literal(value, inner.quoting())?
                        ))
                    })
                    .collect::<Result<Vec<_>>>()?;
                sql.push_str(&format!(" ({})", rendered.join(", ")));
            }
        }
        ReplicationMode::Physical => {
            if !options.is_empty() {
                return Err(Error::programming(
                    "cannot specify output plugin options for physical replication",
                ));
            }
            sql.push_str(&format!("PHYSICAL {}", start_lsn));
            if timeline != 0 {
                sql.push_str(&format!(" TIMELINE {}", timeline));
            }
        }
    }
    Ok(sql)
}
