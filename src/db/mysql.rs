//! MySQL driver built on mysql_async.
//!
//! Sessions switch on `ANSI_QUOTES` so the double-quoted identifiers in
//! generated SQL are read as names. Results are read through the pump in
//! [`super::pump`].

use anyhow::{anyhow, Context, Result};
use chrono::NaiveDate;
use mysql_async::consts::{ColumnFlags, ColumnType};
use mysql_async::prelude::Queryable;
use mysql_async::{Conn, Opts, Params, Row, Value};
use std::fmt::Write as _;
use std::time::Duration;
use tokio::runtime::Runtime;

use super::connection::{
    runtime, BackendConnection, BackendKind, Command, ConnectionFactory, FieldInfo,
    PlaceholderStyle, RowReader,
};
use super::pump::{self, Cell, PumpSlot, RowSink};
use super::value::{BoundValue, FieldType, FieldValue};

const ANSI_QUOTES: &str = "SET SESSION sql_mode = CONCAT(@@SESSION.sql_mode, ',ANSI_QUOTES')";

/// Collation id MySQL reports for binary strings.
const BINARY_CHARSET: u16 = 63;

pub struct MysqlFactory {
    connect_timeout: Duration,
}

impl MysqlFactory {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

impl ConnectionFactory for MysqlFactory {
    fn kind(&self) -> BackendKind {
        BackendKind::Mysql
    }

    fn open(&self, connection_string: &str) -> Result<Box<dyn BackendConnection>> {
        let runtime = runtime()?;
        let opts = Opts::from_url(connection_string).context("Invalid MySQL connection URL")?;
        let timeout = self.connect_timeout;
        let conn = runtime.block_on(async move {
            let mut conn = tokio::time::timeout(timeout, Conn::new(opts))
                .await
                .map_err(|_| anyhow!("Connection timed out after {}s", timeout.as_secs()))?
                .context("Failed to connect to MySQL")?;
            conn.query_drop(ANSI_QUOTES)
                .await
                .context("Failed to enable ANSI_QUOTES")?;
            Ok::<_, anyhow::Error>(conn)
        })?;
        tracing::debug!(connection_id = conn.id(), "Opened MySQL connection");
        Ok(Box::new(MysqlConnection {
            runtime,
            slot: PumpSlot::Idle(conn),
        }))
    }
}

fn to_params(values: Vec<BoundValue>) -> Params {
    if values.is_empty() {
        return Params::Empty;
    }
    Params::Positional(
        values
            .into_iter()
            .map(|v| match v {
                BoundValue::Null => Value::NULL,
                BoundValue::Int(i) => Value::Int(i),
                BoundValue::Real(f) => Value::Double(f),
                BoundValue::Text(s) => Value::Bytes(s.into_bytes()),
            })
            .collect(),
    )
}

fn field_type_for(ty: ColumnType, flags: ColumnFlags, charset: u16) -> FieldType {
    let unsigned = flags.contains(ColumnFlags::UNSIGNED_FLAG);
    match ty {
        ColumnType::MYSQL_TYPE_TINY if unsigned => FieldType::Byte,
        ColumnType::MYSQL_TYPE_TINY | ColumnType::MYSQL_TYPE_YEAR => FieldType::Int16,
        ColumnType::MYSQL_TYPE_SHORT if unsigned => FieldType::Int32,
        ColumnType::MYSQL_TYPE_SHORT => FieldType::Int16,
        ColumnType::MYSQL_TYPE_INT24 => FieldType::Int32,
        ColumnType::MYSQL_TYPE_LONG if unsigned => FieldType::Int64,
        ColumnType::MYSQL_TYPE_LONG => FieldType::Int32,
        ColumnType::MYSQL_TYPE_LONGLONG | ColumnType::MYSQL_TYPE_BIT => FieldType::Int64,
        ColumnType::MYSQL_TYPE_FLOAT => FieldType::Float32,
        ColumnType::MYSQL_TYPE_DOUBLE => FieldType::Float64,
        ColumnType::MYSQL_TYPE_DECIMAL | ColumnType::MYSQL_TYPE_NEWDECIMAL => FieldType::Decimal,
        ColumnType::MYSQL_TYPE_DATE | ColumnType::MYSQL_TYPE_NEWDATE => FieldType::Date,
        ColumnType::MYSQL_TYPE_DATETIME
        | ColumnType::MYSQL_TYPE_DATETIME2
        | ColumnType::MYSQL_TYPE_TIMESTAMP
        | ColumnType::MYSQL_TYPE_TIMESTAMP2 => FieldType::DateTime,
        ColumnType::MYSQL_TYPE_TIME | ColumnType::MYSQL_TYPE_TIME2 => {
            FieldType::Other("time".into())
        }
        ColumnType::MYSQL_TYPE_JSON => FieldType::Other("json".into()),
        ColumnType::MYSQL_TYPE_VARCHAR
        | ColumnType::MYSQL_TYPE_VAR_STRING
        | ColumnType::MYSQL_TYPE_STRING
        | ColumnType::MYSQL_TYPE_ENUM
        | ColumnType::MYSQL_TYPE_SET
        | ColumnType::MYSQL_TYPE_TINY_BLOB
        | ColumnType::MYSQL_TYPE_MEDIUM_BLOB
        | ColumnType::MYSQL_TYPE_LONG_BLOB
        | ColumnType::MYSQL_TYPE_BLOB => {
            if charset == BINARY_CHARSET {
                FieldType::Other("binary".into())
            } else {
                FieldType::String
            }
        }
        other => FieldType::Other(
            format!("{other:?}")
                .trim_start_matches("MYSQL_TYPE_")
                .to_lowercase(),
        ),
    }
}

fn integer(i: i64, field_type: &FieldType) -> FieldValue {
    match field_type {
        FieldType::Int16 => i16::try_from(i).map_or(FieldValue::Int64(i), FieldValue::Int16),
        FieldType::Int32 => i32::try_from(i).map_or(FieldValue::Int64(i), FieldValue::Int32),
        FieldType::Byte => u8::try_from(i).map_or(FieldValue::Int64(i), FieldValue::Byte),
        _ => FieldValue::Int64(i),
    }
}

fn hex_string(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(2 + bytes.len() * 2);
    out.push_str("0x");
    for b in bytes {
        let _ = write!(out, "{b:02x}");
    }
    out
}

fn from_bytes(bytes: Vec<u8>, field_type: &FieldType) -> Cell {
    match field_type {
        FieldType::Int64 if bytes.len() <= 8 => {
            // BIT(n) arrives as big-endian bytes
            let bits = bytes.iter().fold(0u64, |acc, b| (acc << 8) | u64::from(*b));
            Ok(FieldValue::Int64(bits as i64))
        }
        FieldType::Decimal | FieldType::Float32 | FieldType::Float64 => {
            let text = String::from_utf8(bytes).map_err(|e| e.to_string())?;
            text.trim()
                .parse::<f64>()
                .map(FieldValue::Decimal)
                .map_err(|e| format!("invalid decimal {text:?}: {e}"))
        }
        FieldType::Other(name) if name == "binary" => Ok(FieldValue::Other(hex_string(&bytes))),
        FieldType::Other(_) => Ok(match String::from_utf8(bytes) {
            Ok(s) => FieldValue::Other(s),
            Err(e) => FieldValue::Other(hex_string(e.as_bytes())),
        }),
        _ => String::from_utf8(bytes)
            .map(FieldValue::String)
            .map_err(|e| format!("text is not valid UTF-8: {e}")),
    }
}

fn format_time(negative: bool, days: u32, hours: u8, minutes: u8, seconds: u8, micros: u32) -> String {
    let total_hours = days * 24 + u32::from(hours);
    let sign = if negative { "-" } else { "" };
    let mut out = format!("{sign}{total_hours:02}:{minutes:02}:{seconds:02}");
    if micros > 0 {
        let _ = write!(out, ".{micros:06}");
    }
    out
}

/// Convert one binary-protocol value using its column's field type.
fn convert(value: Value, field_type: &FieldType) -> Cell {
    match value {
        Value::NULL => Ok(FieldValue::Null),
        Value::Int(i) => Ok(integer(i, field_type)),
        Value::UInt(u) => i64::try_from(u)
            .map(|i| integer(i, field_type))
            .map_err(|_| format!("unsigned value {u} does not fit a 64-bit integer")),
        Value::Float(f) => Ok(FieldValue::Float32(f)),
        Value::Double(d) => Ok(FieldValue::Float64(d)),
        Value::Bytes(bytes) => from_bytes(bytes, field_type),
        Value::Date(0, 0, 0, 0, 0, 0, 0) => Ok(FieldValue::Null),
        Value::Date(year, month, day, hour, minute, second, micros) => {
            let date = NaiveDate::from_ymd_opt(i32::from(year), u32::from(month), u32::from(day))
                .ok_or_else(|| format!("invalid date {year}-{month}-{day}"))?;
            if *field_type == FieldType::Date {
                return Ok(FieldValue::Date(date));
            }
            date.and_hms_micro_opt(
                u32::from(hour),
                u32::from(minute),
                u32::from(second),
                micros,
            )
            .map(FieldValue::DateTime)
            .ok_or_else(|| format!("invalid time {hour}:{minute}:{second}.{micros}"))
        }
        Value::Time(negative, days, hours, minutes, seconds, micros) => Ok(FieldValue::Other(
            format_time(negative, days, hours, minutes, seconds, micros),
        )),
    }
}

async fn pump_query(conn: &mut Conn, sql: String, values: Vec<BoundValue>, mut sink: RowSink) {
    let mut result = match conn.exec_iter(sql, to_params(values)).await {
        Ok(result) => result,
        Err(e) => return sink.fail(anyhow!(e)).await,
    };
    let fields: Vec<FieldInfo> = result
        .columns_ref()
        .iter()
        .map(|c| {
            FieldInfo::new(
                c.name_str(),
                field_type_for(c.column_type(), c.flags(), c.character_set()),
            )
        })
        .collect();
    sink.describe(fields.clone());

    loop {
        match result.next().await {
            Ok(Some(row)) => {
                let cells = row
                    .unwrap()
                    .into_iter()
                    .zip(&fields)
                    .map(|(value, field)| convert(value, &field.field_type))
                    .collect();
                if !sink.row(cells).await {
                    if let Err(e) = result.drop_result().await {
                        tracing::warn!(error = %e, "Failed to discard unread MySQL rows");
                    }
                    return;
                }
            }
            Ok(None) => return,
            Err(e) => return sink.fail(anyhow!(e)).await,
        }
    }
}

async fn scalar(conn: &mut Conn, sql: String, values: Vec<BoundValue>) -> Result<FieldValue> {
    let row: Option<Row> = conn.exec_first(sql, to_params(values)).await?;
    let Some(row) = row else {
        return Ok(FieldValue::Null);
    };
    let field_type = match row.columns_ref().first() {
        Some(c) => field_type_for(c.column_type(), c.flags(), c.character_set()),
        None => return Ok(FieldValue::Null),
    };
    let Some(value) = row.unwrap().into_iter().next() else {
        return Ok(FieldValue::Null);
    };
    convert(value, &field_type).map_err(|e| anyhow!(e))
}

pub struct MysqlConnection {
    runtime: &'static Runtime,
    slot: PumpSlot<Conn>,
}

impl BackendConnection for MysqlConnection {
    fn execute_scalar(&mut self, command: &Command) -> Result<FieldValue> {
        let (sql, values) = command.prepare(PlaceholderStyle::Question)?;
        let mut conn = self.slot.acquire(self.runtime)?;
        let result = self.runtime.block_on(scalar(&mut conn, sql, values));
        self.slot = PumpSlot::Idle(conn);
        result
    }

    fn execute_reader(&mut self, command: &Command) -> Result<Box<dyn RowReader>> {
        let (sql, values) = command.prepare(PlaceholderStyle::Question)?;
        tracing::debug!(sql = %sql, params = values.len(), "MySQL query");
        let mut conn = self.slot.acquire(self.runtime)?;
        let (handle, reader) = pump::start(self.runtime, move |sink| async move {
            pump_query(&mut conn, sql, values, sink).await;
            conn
        });
        self.slot = PumpSlot::Busy(handle);
        Ok(Box::new(reader?))
    }

    fn cancel(&mut self) -> Result<()> {
        if self.slot.abort() {
            tracing::debug!("Abandoned MySQL connection with a pending result");
        }
        Ok(())
    }
}

impl Drop for MysqlConnection {
    fn drop(&mut self) {
        match std::mem::replace(&mut self.slot, PumpSlot::Lost) {
            PumpSlot::Idle(conn) => {
                self.runtime.spawn(async move {
                    if let Err(e) = conn.disconnect().await {
                        tracing::debug!(error = %e, "MySQL disconnect failed");
                    }
                });
            }
            PumpSlot::Busy(handle) => {
                self.runtime.spawn(async move {
                    if let Ok(conn) = handle.await {
                        let _ = conn.disconnect().await;
                    }
                });
            }
            PumpSlot::Lost => {}
        }
    }
}
