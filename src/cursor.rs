//! Cursors: execute statements and fetch their rows.
//!
//! Rows are kept raw as received and typecast only when fetched. A cursor
//! created with a name declares a server-side cursor and fetches from it in
//! batches.

use std::io::{self, Read, Write};
use std::ops::Index;
use std::sync::Arc;

use tracing::{debug, trace};

use crate::connection::{
    CommandMode, ConnInner, Connection, CopyState, Machine, Outcome, PollResult, QueryResult,
    Step,
};
use crate::error::{Error, Result, TypecastError};
use crate::pg::protocol::{FieldDescription, RawRow};
use crate::pg::statement::SharedColumns;
use crate::pg::types::{Oid, PgValue};
use crate::registry::{CasterMap, Casters, FromValue, SharedRegistry};
use crate::sql::{bind_params, build_query, convert_placeholders, quote_ident, quote_literal, Params};

/// Rows fetched per round trip when iterating a named cursor.
pub const DEFAULT_ITERSIZE: usize = 2000;

/// Bytes read from the source per CopyData message.
pub const DEFAULT_COPY_SIZE: usize = 8192;

/// Largest count sent in `FETCH FORWARD n`; bigger requests fetch `ALL`.
const MAX_FETCH: usize = i32::MAX as usize;

// ============================================================================
// Columns and rows
// ============================================================================

/// Description of one result column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Column {
    pub name: String,
    pub type_code: Oid,
    pub display_size: Option<i32>,
    pub internal_size: Option<i32>,
    pub precision: Option<i32>,
    pub scale: Option<i32>,
    /// The protocol does not report nullability.
    pub null_ok: Option<bool>,
    pub table_oid: Option<Oid>,
    pub table_column: Option<i16>,
}

impl Column {
    fn from_field(field: &FieldDescription) -> Self {
        let modifier = field.type_modifier;
        let (precision, scale) = if field.type_oid == Oid::NUMERIC && modifier >= 4 {
            let packed = modifier - 4;
            (Some((packed >> 16) & 0xffff), Some(packed & 0xffff))
        } else {
            (None, None)
        };
        let display_size = match field.type_oid {
            Oid::VARCHAR | Oid::BPCHAR if modifier >= 4 => Some(modifier - 4),
            Oid::NUMERIC => precision.map(|p| p + i32::from(scale.unwrap_or(0) > 0) + 1),
            _ => None,
        };
        Self {
            name: field.name.clone(),
            type_code: field.type_oid,
            display_size,
            internal_size: (field.type_size >= 0).then_some(i32::from(field.type_size)),
            precision,
            scale,
            null_ok: None,
            table_oid: (field.table_oid != 0).then_some(Oid(field.table_oid)),
            table_column: (field.column_attr != 0).then_some(field.column_attr),
        }
    }
}

/// One fetched row.
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    columns: SharedColumns,
    values: Vec<PgValue>,
}

impl Row {
    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn values(&self) -> &[PgValue] {
        &self.values
    }

    pub fn into_values(self) -> Vec<PgValue> {
        self.values
    }

    pub fn column_names(&self) -> impl Iterator<Item = &str> {
        self.columns.iter().map(|c| c.name.as_str())
    }

    /// Convert column `index` to `T`.
    pub fn get<T: FromValue>(&self, index: usize) -> Result<T> {
        let value = self.values.get(index).ok_or_else(|| {
            Error::programming(format!(
                "column index {} out of range for a row of {} columns",
                index,
                self.values.len()
            ))
        })?;
        T::from_value(value)
    }

    /// Convert the column called `name` to `T`.
    pub fn get_by_name<T: FromValue>(&self, name: &str) -> Result<T> {
        let index = self
            .columns
            .iter()
            .position(|c| c.name == name)
            .ok_or_else(|| Error::programming(format!("no column named \"{}\"", name)))?;
        self.get(index)
    }
}

impl Index<usize> for Row {
    type Output = PgValue;

    fn index(&self, index: usize) -> &PgValue {
        &self.values[index]
    }
}

/// Reference point for [`Cursor::scroll`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ScrollMode {
    #[default]
    Relative,
    Absolute,
}

/// Source or destination of a COPY.
pub enum CopyFile<'f> {
    /// Data for `COPY ... FROM STDIN`.
    Read(&'f mut dyn Read),
    /// Receives `COPY ... TO STDOUT` output.
    Write(&'f mut dyn Write),
}

/// Format options for [`Cursor::copy_from`] and [`Cursor::copy_to`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CopyOptions {
    pub sep: String,
    pub null: String,
    pub columns: Option<Vec<String>>,
    /// Bytes per CopyData message when sending.
    pub size: usize,
}

impl Default for CopyOptions {
    fn default() -> Self {
        Self {
            sep: "\t".to_string(),
            null: "\\N".to_string(),
            columns: None,
            size: DEFAULT_COPY_SIZE,
        }
    }
}

/// Row count carried by a command tag, if the command reports one.
fn tag_row_count(tag: &str) -> Option<i64> {
    let mut words = tag.split_whitespace();
    let command = words.next()?;
    match command {
        "INSERT" | "UPDATE" | "DELETE" | "MERGE" | "SELECT" | "FETCH" | "MOVE" | "COPY" => {
            tag.rsplit(' ').next()?.parse().ok()
        }
        _ => None,
    }
}

/// OID of the row inserted by `INSERT 0 <oid> 1`, when there is one.
fn tag_oid(tag: &str) -> Option<Oid> {
    let mut words = tag.split_whitespace();
    if words.next()? != "INSERT" {
        return None;
    }
    let oid: u32 = words.next()?.parse().ok()?;
    (oid != 0).then_some(Oid(oid))
}

// ============================================================================
// Cursor
// ============================================================================

pub struct Cursor {
    conn: Connection,
    name: Option<String>,
    scrollable: Option<bool>,
    withhold: bool,
    declared: bool,
    closed: bool,
    /// Rows returned by a bare `fetchmany()`.
    pub arraysize: usize,
    /// Rows per FETCH when iterating a named cursor.
    pub itersize: usize,
    columns: Option<SharedColumns>,
    description: Option<Vec<Column>>,
    rows: Vec<RawRow>,
    pos: usize,
    /// Rows consumed by earlier batches of a named cursor.
    row_offset: usize,
    rowcount: i64,
    lastrowid: Option<Oid>,
    statusmessage: Option<String>,
    query: Option<Vec<u8>>,
    pending: Option<u64>,
    casters: Arc<CasterMap>,
    registry: SharedRegistry,
}

impl Cursor {
    pub(crate) fn new(conn: Connection, name: Option<String>) -> Self {
        let (casters, registry) = {
            let inner = conn.lock();
            (Arc::clone(&inner.casters), inner.registry.clone())
        };
        Self {
            conn,
            name,
            scrollable: None,
            withhold: false,
            declared: false,
            closed: false,
            arraysize: 1,
            itersize: DEFAULT_ITERSIZE,
            columns: None,
            description: None,
            rows: Vec::new(),
            pos: 0,
            row_offset: 0,
            rowcount: -1,
            lastrowid: None,
            statusmessage: None,
            query: None,
            pending: None,
            casters,
            registry,
        }
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn closed(&self) -> bool {
        self.closed || self.conn.closed()
    }

    pub fn description(&self) -> Option<&[Column]> {
        self.description.as_deref()
    }

    /// Rows produced or affected by the last command; -1 when unknown.
    pub fn rowcount(&self) -> i64 {
        self.rowcount
    }

    /// Index of the next row to fetch.
    pub fn rownumber(&self) -> Option<usize> {
        self.columns.as_ref().map(|_| self.row_offset + self.pos)
    }

    pub fn lastrowid(&self) -> Option<Oid> {
        self.lastrowid
    }

    /// Command tag of the last command, such as `INSERT 0 1`.
    pub fn statusmessage(&self) -> Option<&str> {
        self.statusmessage.as_deref()
    }

    /// Query text last sent to the server.
    pub fn query(&self) -> Option<&[u8]> {
        self.query.as_deref()
    }

    /// Declare the server-side cursor `SCROLL` or `NO SCROLL`.
    pub fn set_scrollable(&mut self, scrollable: Option<bool>) -> Result<()> {
        self.check_not_declared("scrollable")?;
        self.scrollable = scrollable;
        Ok(())
    }

    /// Declare the server-side cursor `WITH HOLD`, usable after commit.
    pub fn set_withhold(&mut self, withhold: bool) -> Result<()> {
        self.check_not_declared("withhold")?;
        self.withhold = withhold;
        Ok(())
    }

    fn check_not_declared(&self, what: &str) -> Result<()> {
        if self.name.is_none() {
            return Err(Error::programming(format!(
                "trying to set .{} on unnamed cursor",
                what
            )));
        }
        if self.declared {
            return Err(Error::programming(format!(
                "can't set .{} after the cursor is declared",
                what
            )));
        }
        Ok(())
    }

    fn check_open(&self) -> Result<()> {
        if self.closed {
            return Err(Error::interface("cursor already closed"));
        }
        if self.conn.closed() {
            return Err(Error::interface("connection already closed"));
        }
        Ok(())
    }

    fn reset_result(&mut self) {
        self.columns = None;
        self.description = None;
        self.rows.clear();
        self.pos = 0;
        self.row_offset = 0;
        self.rowcount = -1;
        self.lastrowid = None;
        self.statusmessage = None;
    }

    fn set_result(&mut self, result: QueryResult) {
        self.statusmessage = result.tag.clone();
        self.lastrowid = result.tag.as_deref().and_then(tag_oid);
        self.rowcount = match (&result.columns, result.tag.as_deref()) {
            (Some(_), _) => result.rows.len() as i64,
            (None, Some(tag)) => tag_row_count(tag).unwrap_or(-1),
            (None, None) => -1,
        };
        self.description = result
            .columns
            .as_ref()
            .map(|columns| columns.iter().map(Column::from_field).collect());
        self.columns = result.columns;
        self.rows = result.rows;
        self.pos = 0;
    }

    fn load(&mut self, inner: &ConnInner, outcome: Outcome) -> Result<()> {
        self.casters = Arc::clone(&inner.casters);
        self.registry = inner.registry.clone();
        let outcome = outcome.into_result()?;
        if let Some(result) = outcome.result {
            self.set_result(result);
        }
        Ok(())
    }

    /// Run `steps`, synchronously or by queueing them in async mode.
    fn submit(&mut self, inner: &mut ConnInner, steps: Vec<Step>) -> Result<()> {
        if inner.is_async() {
            self.pending = Some(inner.machine.begin_command(steps, CommandMode::Normal)?);
            return Ok(());
        }
        let outcome = inner.run(steps)?;
        self.load(inner, outcome)
    }

    // ------------------------------------------------------------------------
    // Execution
    // ------------------------------------------------------------------------

    /// Execute `sql` with `%s` or `%(name)s` placeholders filled client-side.
    ///
    /// In async mode this only sends the query; drive [`poll`](Self::poll)
    /// until it returns `Done`.
    pub fn execute<'a>(&mut self, sql: &str, params: impl Into<Params<'a>>) -> Result<()> {
        let params = params.into();
        self.check_open()?;
        if self.pending.is_some() {
            return Err(Error::programming(
                "execute cannot be used while an asynchronous query is underway",
            ));
        }
        let conn = self.conn.clone();
        let mut inner = conn.lock();
        inner.ensure_open()?;
        let query = {
            let registry = inner.registry.read();
            build_query(sql, &params, &registry, inner.quoting())?
        };
        trace!(query = %String::from_utf8_lossy(&query), "execute");

        if self.name.is_some() {
            return self.declare(&mut inner, query);
        }

        self.reset_result();
        self.query = Some(query.clone());
        let steps = inner.with_begin(Step::query(&query));
        self.submit(&mut inner, steps)
    }

    /// Alias of [`execute`](Self::execute) for async connections.
    pub fn execute_async<'a>(&mut self, sql: &str, params: impl Into<Params<'a>>) -> Result<()> {
        if !self.conn.is_async() {
            return Err(Error::programming(
                "execute_async needs an asynchronous connection",
            ));
        }
        self.execute(sql, params)
    }

    /// Execute through Parse/Bind/Execute with binary parameters and
    /// results, reusing the connection's prepared statements.
    pub fn execute_binary<'a>(&mut self, sql: &str, params: impl Into<Params<'a>>) -> Result<()> {
        let params = params.into();
        self.check_open()?;
        if self.name.is_some() {
            return Err(Error::programming(
                "execute_binary is not available on named cursors",
            ));
        }
        if self.pending.is_some() {
            return Err(Error::programming(
                "execute cannot be used while an asynchronous query is underway",
            ));
        }
        let server_query = convert_placeholders(sql)?;
        let bound = bind_params(&server_query, &params)?;

        let conn = self.conn.clone();
        let mut inner = conn.lock();
        inner.ensure_open()?;
        let values = {
            let registry = inner.registry.read();
            bound
                .into_iter()
                .map(|value| registry.adapt(value))
                .collect::<Result<Vec<_>>>()?
        };
        trace!(query = %server_query.sql, params = values.len(), "execute_binary");

        self.reset_result();
        self.query = Some(server_query.sql.clone().into_bytes());
        let step = inner.machine.extended_step(&server_query.sql, &values)?;
        let steps = inner.with_begin(step);
        self.submit(&mut inner, steps)
    }

    /// Execute `sql` once per parameter set. `rowcount` is the total.
    pub fn executemany<'a, I, P>(&mut self, sql: &str, params: I) -> Result<()>
    where
        I: IntoIterator<Item = P>,
        P: Into<Params<'a>>,
    {
        self.check_open()?;
        if self.name.is_some() {
            return Err(Error::programming(
                "can't call .executemany() on named cursors",
            ));
        }
        if self.conn.is_async() {
            return Err(Error::programming(
                "executemany cannot be used in asynchronous mode",
            ));
        }
        let mut total = 0;
        let mut counted = false;
        for set in params {
            self.execute(sql, set)?;
            if self.rowcount >= 0 {
                total += self.rowcount;
                counted = true;
            }
        }
        self.columns = None;
        self.description = None;
        self.rows.clear();
        self.rowcount = if counted { total } else { -1 };
        Ok(())
    }

    /// The query `execute` would send.
    pub fn mogrify<'a>(&self, sql: &str, params: impl Into<Params<'a>>) -> Result<Vec<u8>> {
        self.check_open()?;
        let inner = self.conn.lock();
        let registry = inner.registry.read();
        build_query(sql, &params.into(), &registry, inner.quoting())
    }

    /// Call a set-returning or scalar function: `SELECT * FROM name(...)`.
    ///
    /// Named parameters are passed with `name := value` notation.
    pub fn callproc<'a>(&mut self, procname: &str, params: impl Into<Params<'a>>) -> Result<()> {
        let params = params.into();
        let args = match &params {
            Params::None => String::new(),
            Params::Positional(values) => vec!["%s"; values.len()].join(","),
            Params::Named(values) => values
                .iter()
                .map(|(name, _)| Ok(format!("{} := %({})s", quote_ident(name)?, name)))
                .collect::<Result<Vec<_>>>()?
                .join(","),
        };
        let sql = format!("SELECT * FROM {}({})", procname, args);
        self.execute(&sql, params)
    }

    /// Advance an async command; loads the result once it is `Done`.
    pub fn poll(&mut self) -> Result<PollResult> {
        let conn = self.conn.clone();
        let Some(id) = self.pending else {
            return conn.poll();
        };
        let mut inner = conn.lock();
        let result = inner.machine.poll()?;
        if result == PollResult::Done {
            if let Some(outcome) = inner.machine.take_outcome(id) {
                self.pending = None;
                self.load(&inner, outcome)?;
            }
        }
        Ok(result)
    }

    // ------------------------------------------------------------------------
    // Named cursors
    // ------------------------------------------------------------------------

    fn declare(&mut self, inner: &mut ConnInner, query: Vec<u8>) -> Result<()> {
        let name = self.name.clone().unwrap_or_default();
        if self.declared {
            return Err(Error::programming(
                "can't call .execute() on named cursors more than once",
            ));
        }
        if inner.is_async() {
            return Err(Error::programming(
                "named cursors are not available in asynchronous mode",
            ));
        }
        if inner.autocommit() && !self.withhold {
            return Err(Error::programming(
                "can't use a named cursor outside of transactions",
            ));
        }

        let scroll = match self.scrollable {
            Some(true) => " SCROLL",
            Some(false) => " NO SCROLL",
            None => "",
        };
        let hold = if self.withhold { " WITH HOLD" } else { "" };
        let mut sql = format!("DECLARE {}{} CURSOR{} FOR ", quote_ident(&name)?, scroll, hold)
            .into_bytes();
        sql.extend_from_slice(&query);
        debug!(cursor = %name, "declaring server-side cursor");

        self.reset_result();
        self.query = Some(sql.clone());
        let steps = inner.with_begin(Step::query(&sql));
        let outcome = inner.run(steps)?;
        self.load(inner, outcome)?;
        self.declared = true;
        self.statusmessage = None;
        self.rowcount = -1;
        Ok(())
    }

    /// Fetch the next batch of a named cursor; `None` fetches all rows.
    fn fetch_server(&mut self, count: Option<usize>) -> Result<()> {
        let name = self.name.clone().unwrap_or_default();
        if !self.declared {
            return Err(Error::programming("no results to fetch"));
        }
        let amount = match count {
            Some(n) if n <= MAX_FETCH => n.to_string(),
            _ => "ALL".to_string(),
        };
        let sql = format!("FETCH FORWARD {} FROM {}", amount, quote_ident(&name)?);
        let consumed = self.row_offset + self.pos;
        let conn = self.conn.clone();
        let mut inner = conn.lock();
        inner.ensure_open()?;
        let outcome = inner.run(vec![Step::query(sql.as_bytes())])?;
        self.load(&inner, outcome)?;
        self.row_offset = consumed;
        self.rowcount = (self.row_offset + self.rows.len()) as i64;
        Ok(())
    }

    fn buffered(&self) -> usize {
        self.rows.len().saturating_sub(self.pos)
    }

    // ------------------------------------------------------------------------
    // Fetching
    // ------------------------------------------------------------------------

    fn check_fetch(&self) -> Result<()> {
        self.check_open()?;
        if self.pending.is_some() {
            return Err(Error::programming(
                "fetch cannot be used while an asynchronous query is underway",
            ));
        }
        if self.columns.is_none() && !self.declared {
            return Err(Error::programming("no results to fetch"));
        }
        Ok(())
    }

    fn decode_row(&self, casters: &Casters<'_>, raw: &RawRow) -> Result<Row> {
        let columns = self
            .columns
            .clone()
            .ok_or_else(|| Error::programming("no results to fetch"))?;
        let mut values = Vec::with_capacity(raw.len());
        for (field, value) in columns.iter().zip(raw.iter()) {
            let value = match value {
                None => PgValue::Null,
                Some(bytes) => casters
                    .cast(field.type_oid, bytes, field.format)
                    .map_err(|e| TypecastError {
                        column: Some(field.name.clone()),
                        oid: field.type_oid,
                        raw: bytes.to_vec(),
                        message: e.to_string(),
                    })?,
            };
            values.push(value);
        }
        Ok(Row { columns, values })
    }

    /// Typecast up to `n` buffered rows; the position moves only on success.
    fn take_rows(&mut self, n: usize) -> Result<Vec<Row>> {
        let end = self.pos.saturating_add(n).min(self.rows.len());
        let rows = {
            let registry = self.registry.read();
            let casters = Casters::new(Some(&self.casters), &registry);
            self.rows[self.pos..end]
                .iter()
                .map(|raw| self.decode_row(&casters, raw))
                .collect::<Result<Vec<_>>>()?
        };
        self.pos = end;
        Ok(rows)
    }

    pub fn fetchone(&mut self) -> Result<Option<Row>> {
        self.check_fetch()?;
        if self.name.is_some() && self.buffered() == 0 {
            self.fetch_server(Some(1))?;
        }
        Ok(self.take_rows(1)?.pop())
    }

    /// Fetch up to `size` rows, `arraysize` when `None`.
    pub fn fetchmany(&mut self, size: Option<usize>) -> Result<Vec<Row>> {
        self.check_fetch()?;
        let size = size.unwrap_or(self.arraysize);
        let buffered = self.buffered();
        if self.name.is_some() && buffered < size {
            let mut rows = self.take_rows(buffered)?;
            self.fetch_server(Some(size - buffered))?;
            rows.extend(self.take_rows(size - buffered)?);
            return Ok(rows);
        }
        self.take_rows(size)
    }

    pub fn fetchall(&mut self) -> Result<Vec<Row>> {
        self.check_fetch()?;
        let mut rows = self.take_rows(self.buffered())?;
        if self.name.is_some() {
            self.fetch_server(None)?;
            rows.extend(self.take_rows(self.buffered())?);
        }
        Ok(rows)
    }

    /// Move the position. Named cursors move within the fetched batch when
    /// they can and send `MOVE` otherwise.
    pub fn scroll(&mut self, value: i64, mode: ScrollMode) -> Result<()> {
        self.check_fetch()?;
        if let Some(name) = self.name.clone() {
            let current = (self.row_offset + self.pos) as i64;
            let target = match mode {
                ScrollMode::Relative => current + value,
                ScrollMode::Absolute => value,
            };
            let batch_start = self.row_offset as i64;
            let server_pos = batch_start + self.rows.len() as i64;
            if (batch_start..=server_pos).contains(&target) {
                self.pos = (target - batch_start) as usize;
                return Ok(());
            }
            // The server sits after the last fetched row, not at our position.
            let sql = match mode {
                ScrollMode::Relative => {
                    format!("MOVE {} FROM {}", target - server_pos, quote_ident(&name)?)
                }
                ScrollMode::Absolute => {
                    format!("MOVE ABSOLUTE {} FROM {}", value, quote_ident(&name)?)
                }
            };
            let conn = self.conn.clone();
            let mut inner = conn.lock();
            inner.run(vec![Step::query(sql.as_bytes())])?.into_result()?;
            self.rows.clear();
            self.pos = 0;
            self.row_offset = target.max(0) as usize;
            return Ok(());
        }

        let target = match mode {
            ScrollMode::Relative => self.pos as i64 + value,
            ScrollMode::Absolute => value,
        };
        if target < 0 || target > self.rows.len() as i64 {
            return Err(Error::programming("scroll destination out of bounds"));
        }
        self.pos = target as usize;
        Ok(())
    }

    // ------------------------------------------------------------------------
    // COPY
    // ------------------------------------------------------------------------

    /// Run a `COPY ... FROM STDIN` or `COPY ... TO STDOUT` statement.
    pub fn copy_expert(&mut self, sql: &str, file: CopyFile<'_>) -> Result<()> {
        self.copy(sql.as_bytes().to_vec(), file, DEFAULT_COPY_SIZE)
    }

    /// Load `table` from a text-format source.
    pub fn copy_from(&mut self, file: &mut dyn Read, table: &str, options: &CopyOptions) -> Result<()> {
        let sql = self.copy_sql(table, "FROM stdin", options)?;
        self.copy(sql.into_bytes(), CopyFile::Read(file), options.size.max(1))
    }

    /// Write `table` in text format to `file`.
    pub fn copy_to(&mut self, file: &mut dyn Write, table: &str, options: &CopyOptions) -> Result<()> {
        let sql = self.copy_sql(table, "TO stdout", options)?;
        self.copy(sql.into_bytes(), CopyFile::Write(file), options.size.max(1))
    }

    fn copy_sql(&self, table: &str, direction: &str, options: &CopyOptions) -> Result<String> {
        let quoting = self.conn.lock().quoting();
        let columns = match &options.columns {
            Some(columns) => format!(
                " ({})",
                columns
                    .iter()
                    .map(|c| quote_ident(c))
                    .collect::<Result<Vec<_>>>()?
                    .join(",")
            ),
            None => String::new(),
        };
        Ok(format!(
            "COPY {}{} {} WITH DELIMITER AS {} NULL AS {}",
            table,
            columns,
            direction,
            quote_literal(&options.sep, quoting)?,
            quote_literal(&options.null, quoting)?
        ))
    }

    fn copy(&mut self, sql: Vec<u8>, mut file: CopyFile<'_>, size: usize) -> Result<()> {
        self.check_open()?;
        let conn = self.conn.clone();
        let mut inner = conn.lock();
        inner.ensure_sync("COPY")?;
        self.reset_result();
        self.query = Some(sql.clone());
        debug!(query = %String::from_utf8_lossy(&sql), "starting COPY");

        let steps = inner.with_begin(Step::query(&sql));
        let id = inner.machine.begin_command(steps, CommandMode::Copy)?;
        let mut io_error: Option<io::Error> = None;
        let mut misuse: Option<&'static str> = None;

        loop {
            let event = inner.machine.drive(None)?;
            while let Some(chunk) = inner.machine.take_copy_data() {
                match &mut file {
                    CopyFile::Write(writer) if io_error.is_none() => {
                        if let Err(e) = writer.write_all(&chunk) {
                            io_error = Some(e);
                        }
                    }
                    CopyFile::Write(_) => {}
                    CopyFile::Read(_) => {
                        misuse.get_or_insert("COPY TO STDOUT needs a writable destination");
                    }
                }
            }
            if event == PollResult::Done {
                break;
            }
            if inner.machine.copy_state() != CopyState::In {
                continue;
            }
            match &mut file {
                CopyFile::Read(reader) => match send_copy_data(&mut inner.machine, &mut **reader, size)? {
                    Ok(()) => inner.machine.end_copy(None)?,
                    Err(e) => {
                        inner
                            .machine
                            .end_copy(Some(&format!("error reading COPY data: {}", e)))?;
                        io_error = Some(e);
                    }
                },
                CopyFile::Write(_) => {
                    misuse = Some("COPY FROM STDIN needs a readable source");
                    inner.machine.end_copy(Some("no COPY source"))?;
                }
            }
        }

        let outcome = inner
            .machine
            .take_outcome(id)
            .ok_or_else(|| Error::interface("the command's result was lost"))?;
        if let Some(e) = io_error {
            return Err(Error::operational(format!("COPY failed: {}", e)));
        }
        if let Some(message) = misuse {
            return Err(Error::programming(message));
        }
        self.load(&inner, outcome)
    }

    // ------------------------------------------------------------------------
    // Close
    // ------------------------------------------------------------------------

    /// Close the cursor; a declared named cursor is closed on the server
    /// while its transaction is still alive.
    pub fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.rows.clear();
        let (Some(name), true) = (self.name.as_deref(), self.declared) else {
            return Ok(());
        };
        let conn = self.conn.clone();
        let mut inner = conn.lock();
        let alive = match inner.machine.transaction_status() {
            crate::pg::TransactionStatus::InTransaction => true,
            crate::pg::TransactionStatus::Idle => self.withhold,
            crate::pg::TransactionStatus::Failed => false,
        };
        if inner.ensure_open().is_err() || !alive || !inner.machine.is_idle() {
            return Ok(());
        }
        let sql = format!("CLOSE {}", quote_ident(name)?);
        inner.run(vec![Step::query(sql.as_bytes())])?.into_result()?;
        Ok(())
    }
}

/// Stream `reader` to the server as CopyData; the inner error is a read
/// failure of the source.
fn send_copy_data(
    machine: &mut Machine,
    reader: &mut dyn Read,
    size: usize,
) -> Result<std::result::Result<(), io::Error>> {
    let mut buf = vec![0u8; size];
    loop {
        let n = match reader.read(&mut buf) {
            Ok(0) => return Ok(Ok(())),
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Ok(Err(e)),
        };
        machine.put_copy_data(&buf[..n])?;
        machine.flush_blocking()?;
    }
}

impl Iterator for Cursor {
    type Item = Result<Row>;

    /// Named cursors fetch `itersize` rows per round trip. A row that fails
    /// to typecast is reported once and then skipped.
    fn next(&mut self) -> Option<Self::Item> {
        if let Err(e) = self.check_fetch() {
            return Some(Err(e));
        }
        if self.name.is_some() && self.buffered() == 0 {
            if let Err(e) = self.fetch_server(Some(self.itersize.max(1))) {
                return Some(Err(e));
            }
        }
        match self.take_rows(1) {
            Ok(mut rows) => rows.pop().map(Ok),
            Err(e) => {
                self.pos += 1;
                Some(Err(e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pg::protocol::Format;

    fn field(name: &str, oid: Oid, size: i16, modifier: i32) -> FieldDescription {
        FieldDescription {
            name: name.to_string(),
            table_oid: 16384,
            column_attr: 2,
            type_oid: oid,
            type_size: size,
            type_modifier: modifier,
            format: Format::Text,
        }
    }

    #[test]
    fn test_column_from_numeric_field() {
        // numeric(10, 2)
        let column = Column::from_field(&field("price", Oid::NUMERIC, -1, ((10 << 16) | 2) + 4));
        assert_eq!(column.precision, Some(10));
        assert_eq!(column.scale, Some(2));
        assert_eq!(column.display_size, Some(12));
        assert_eq!(column.internal_size, None);
        assert_eq!(column.table_oid, Some(Oid(16384)));
        assert_eq!(column.table_column, Some(2));
    }

    #[test]
    fn test_column_from_varchar_and_int_fields() {
        let name = Column::from_field(&field("name", Oid::VARCHAR, -1, 36));
        assert_eq!(name.display_size, Some(32));
        assert_eq!(name.precision, None);

        let id = Column::from_field(&field("id", Oid::INT4, 4, -1));
        assert_eq!(id.internal_size, Some(4));
        assert_eq!(id.display_size, None);
    }

    #[test]
    fn test_tag_row_count() {
        assert_eq!(tag_row_count("INSERT 0 3"), Some(3));
        assert_eq!(tag_row_count("UPDATE 7"), Some(7));
        assert_eq!(tag_row_count("SELECT 2"), Some(2));
        assert_eq!(tag_row_count("COPY 10"), Some(10));
        assert_eq!(tag_row_count("CREATE TABLE"), None);
        assert_eq!(tag_row_count("BEGIN"), None);
    }

    #[test]
    fn test_tag_oid() {
        assert_eq!(tag_oid("INSERT 0 1"), None);
        assert_eq!(tag_oid("INSERT 16390 1"), Some(Oid(16390)));
        assert_eq!(tag_oid("UPDATE 1"), None);
    }

    #[test]
    fn test_row_accessors() {
        let columns: SharedColumns = Arc::new(vec![
            field("id", Oid::INT4, 4, -1),
            field("name", Oid::TEXT, -1, -1),
        ]);
        let row = Row {
            columns,
            values: vec![PgValue::Int4(7), PgValue::Null],
        };
        assert_eq!(row.len(), 2);
        assert_eq!(row.get::<i64>(0).unwrap(), 7);
        assert_eq!(row.get_by_name::<Option<String>>("name").unwrap(), None);
        assert!(matches!(row.get::<i32>(5), Err(Error::Programming(_))));
        assert!(matches!(row.get_by_name::<i32>("missing"), Err(Error::Programming(_))));
        assert!(matches!(row.get::<String>(1), Err(Error::Data(_))));
        assert_eq!(row[0], PgValue::Int4(7));
        assert_eq!(row.column_names().collect::<Vec<_>>(), vec!["id", "name"]);
    }
}
