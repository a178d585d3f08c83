use rusqlite::ffi;
use rusqlite::vtab::{Context, VTabCursor, Values};
use std::ffi::c_int;

use super::table::ForeignTable;
use crate::db::{row_identity, BackendConnection, BoundValue, Command, RowReader};
use crate::error::{AdapterError, AdapterResult};

/// One scan over a remote table, owning its own connection.
#[repr(C)]
pub struct ForeignCursor<'vtab> {
    base: ffi::sqlite3_vtab_cursor,
    table: &'vtab ForeignTable,
    reader: Option<Box<dyn RowReader>>,
    command: Option<Command>,
    connection: Option<Box<dyn BackendConnection>>,
    is_at_end: bool,
}

impl<'vtab> ForeignCursor<'vtab> {
    pub(crate) fn new(table: &'vtab ForeignTable) -> AdapterResult<Self> {
        let connection = table.open_connection()?;
        Ok(Self {
            base: ffi::sqlite3_vtab_cursor::default(),
            table,
            reader: None,
            command: None,
            connection: Some(connection),
            is_at_end: true,
        })
    }

    /// Release reader, command and connection, in that order.
    fn release(&mut self) {
        self.is_at_end = true;
        drop(self.reader.take());
        drop(self.command.take());
        drop(self.connection.take());
    }

    /// Tear down an active scan and reconnect before a new one.
    fn reset(&mut self) -> AdapterResult<()> {
        tracing::warn!(
            table = %self.table.descriptor().remote_table_name,
            "Filter on a cursor with an active command, reopening its connection"
        );
        if let Some(conn) = self.connection.as_mut() {
            if let Err(e) = conn.cancel() {
                tracing::warn!(error = format!("{e:#}"), "Failed to cancel the active command");
            }
        }
        self.release();
        self.connection = Some(self.table.open_connection()?);
        Ok(())
    }

    fn start_scan(&mut self, sql: &str, args: &Values<'_>) -> AdapterResult<()> {
        if self.command.is_some() {
            self.reset()?;
        }
        self.is_at_end = true;

        let connection = match self.connection.take() {
            Some(conn) => conn,
            None => self.table.open_connection()?,
        };
        let connection = self.connection.insert(connection);

        let mut command = connection.create_command(sql);
        for (i, value) in args.iter().enumerate() {
            command.bind(format!("@arg{}", i + 1), BoundValue::from_host(value)?);
        }
        tracing::debug!(sql = %sql, params = command.parameters.len(), "Starting remote scan");

        let mut reader = connection
            .execute_reader(&command)
            .map_err(AdapterError::Query)?;
        let has_row = reader.read().map_err(AdapterError::Query)?;

        self.command = Some(command);
        self.reader = Some(reader);
        self.is_at_end = !has_row;
        Ok(())
    }

    fn current_row(&self) -> AdapterResult<&dyn RowReader> {
        if self.is_at_end {
            return Err(AdapterError::Eof);
        }
        self.reader.as_deref().ok_or(AdapterError::Eof)
    }
}

impl Drop for ForeignCursor<'_> {
    fn drop(&mut self) {
        self.release();
    }
}

unsafe impl VTabCursor for ForeignCursor<'_> {
    fn filter(
        &mut self,
        _idx_num: c_int,
        idx_str: Option<&str>,
        args: &Values<'_>,
    ) -> rusqlite::Result<()> {
        let sql = idx_str.ok_or(AdapterError::MissingPlan)?;
        self.start_scan(sql, args)?;
        Ok(())
    }

    fn next(&mut self) -> rusqlite::Result<()> {
        if self.is_at_end {
            return Ok(());
        }
        let reader = self.reader.as_mut().ok_or(AdapterError::Eof)?;
        let has_row = reader.read().map_err(AdapterError::Query)?;
        self.is_at_end = !has_row;
        Ok(())
    }

    fn eof(&self) -> bool {
        self.is_at_end
    }

    fn column(&self, ctx: &mut Context, i: c_int) -> rusqlite::Result<()> {
        let reader = self.current_row()?;
        let value = usize::try_from(i)
            .map_err(|_| anyhow::anyhow!("negative column index"))
            .and_then(|index| reader.value(index))
            .map_err(|source| AdapterError::Column { index: i, source })?;
        ctx.set_result(&value.to_host())
    }

    fn rowid(&self) -> rusqlite::Result<i64> {
        let reader = self.current_row()?;
        let values = (0..reader.field_count())
            .map(|index| reader.value(index))
            .collect::<anyhow::Result<Vec<_>>>()
            .map_err(AdapterError::Query)?;
        Ok(row_identity(&values))
    }
}
