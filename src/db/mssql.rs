//! SQL Server driver built on tiberius.
//!
//! A tiberius result stream borrows its client, so rows are read through the
//! pump in [`super::pump`].

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, NaiveTime};
use futures_util::StreamExt;
use std::fmt::Write as _;
use std::time::Duration;
use tiberius::numeric::Numeric;
use tiberius::{Client, ColumnData, ColumnType, Config, FromSql, Query};
use tokio::net::TcpStream;
use tokio::runtime::Runtime;
use tokio_util::compat::{Compat, TokioAsyncWriteCompatExt};

use super::connection::{
    runtime, BackendConnection, BackendKind, Command, ConnectionFactory, FieldInfo,
    PlaceholderStyle, RowReader,
};
use super::pump::{self, Cell, PumpSlot, RowSink};
use super::value::{BoundValue, FieldType, FieldValue};

type MssqlClient = Client<Compat<TcpStream>>;

pub struct MssqlFactory {
    connect_timeout: Duration,
}

impl MssqlFactory {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

impl ConnectionFactory for MssqlFactory {
    fn kind(&self) -> BackendKind {
        BackendKind::Mssql
    }

    fn open(&self, connection_string: &str) -> Result<Box<dyn BackendConnection>> {
        let runtime = runtime()?;
        let config = Config::from_ado_string(connection_string)
            .context("Invalid SQL Server connection string")?;
        let client = runtime.block_on(create_client(config, self.connect_timeout))?;
        Ok(Box::new(MssqlConnection {
            runtime,
            slot: PumpSlot::Idle(client),
        }))
    }
}

async fn create_client(config: Config, timeout: Duration) -> Result<MssqlClient> {
    let secs = timeout.as_secs();
    let addr = config.get_addr();
    let tcp = tokio::time::timeout(timeout, TcpStream::connect(&addr))
        .await
        .map_err(|_| anyhow!("Connection timed out after {secs}s"))?
        .with_context(|| format!("Failed to reach SQL Server at {addr}"))?;
    tcp.set_nodelay(true)?;
    let client = tokio::time::timeout(timeout, Client::connect(config, tcp.compat_write()))
        .await
        .map_err(|_| anyhow!("Connection timed out after {secs}s"))?
        .context("Failed to connect to SQL Server")?;
    tracing::debug!(addr = %addr, "Opened SQL Server connection");
    Ok(client)
}

fn build_query(sql: String, values: Vec<BoundValue>) -> Query<'static> {
    let mut query = Query::new(sql);
    for value in values {
        match value {
            BoundValue::Null => query.bind(Option::<String>::None),
            BoundValue::Int(i) => query.bind(i),
            BoundValue::Real(f) => query.bind(f),
            BoundValue::Text(s) => query.bind(s),
        }
    }
    query
}

fn field_type_for(ty: ColumnType) -> FieldType {
    match ty {
        ColumnType::Int1 => FieldType::Byte,
        ColumnType::Int2 => FieldType::Int16,
        ColumnType::Int4 => FieldType::Int32,
        ColumnType::Int8 | ColumnType::Intn => FieldType::Int64,
        ColumnType::Bit | ColumnType::Bitn => FieldType::Boolean,
        ColumnType::Float4 => FieldType::Float32,
        ColumnType::Float8 | ColumnType::Floatn => FieldType::Float64,
        ColumnType::Decimaln
        | ColumnType::Numericn
        | ColumnType::Money
        | ColumnType::Money4 => FieldType::Decimal,
        ColumnType::BigVarChar
        | ColumnType::BigChar
        | ColumnType::NVarchar
        | ColumnType::NChar
        | ColumnType::Text
        | ColumnType::NText => FieldType::String,
        ColumnType::Daten => FieldType::Date,
        ColumnType::Datetime
        | ColumnType::Datetime4
        | ColumnType::Datetimen
        | ColumnType::Datetime2 => FieldType::DateTime,
        ColumnType::DatetimeOffsetn => FieldType::DateTimeOffset,
        ColumnType::Guid => FieldType::Other("uniqueidentifier".into()),
        ColumnType::Timen => FieldType::Other("time".into()),
        ColumnType::Xml => FieldType::Other("xml".into()),
        ColumnType::BigVarBin | ColumnType::BigBinary | ColumnType::Image => {
            FieldType::Other("varbinary".into())
        }
        other => FieldType::Other(format!("{other:?}").to_lowercase()),
    }
}

fn numeric_to_f64(n: Numeric) -> f64 {
    n.value() as f64 / 10f64.powi(i32::from(n.scale()))
}

fn hex_string(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(2 + bytes.len() * 2);
    out.push_str("0x");
    for b in bytes {
        let _ = write!(out, "{b:02X}");
    }
    out
}

fn temporal<'a, T: FromSql<'a>>(
    data: &'a ColumnData<'static>,
    wrap: impl FnOnce(T) -> FieldValue,
) -> Cell {
    T::from_sql(data)
        .map(|v| v.map(wrap).unwrap_or(FieldValue::Null))
        .map_err(|e| e.to_string())
}

/// Convert one column of a tiberius row.
fn convert(data: ColumnData<'static>) -> Cell {
    let value = match data {
        ColumnData::U8(v) => v.map(FieldValue::Byte),
        ColumnData::I16(v) => v.map(FieldValue::Int16),
        ColumnData::I32(v) => v.map(FieldValue::Int32),
        ColumnData::I64(v) => v.map(FieldValue::Int64),
        ColumnData::F32(v) => v.map(FieldValue::Float32),
        ColumnData::F64(v) => v.map(FieldValue::Float64),
        ColumnData::Bit(v) => v.map(FieldValue::Boolean),
        ColumnData::String(v) => v.map(|s| FieldValue::String(s.into_owned())),
        ColumnData::Guid(v) => v.map(|g| FieldValue::Other(g.to_string())),
        ColumnData::Binary(v) => v.map(|b| FieldValue::Other(hex_string(&b))),
        ColumnData::Numeric(v) => v.map(|n| FieldValue::Decimal(numeric_to_f64(n))),
        ColumnData::Xml(v) => v.map(|x| FieldValue::Other(x.into_owned().into_string())),
        ColumnData::Date(_) => return temporal::<NaiveDate>(&data, FieldValue::Date),
        ColumnData::Time(_) => {
            return temporal::<NaiveTime>(&data, |t| FieldValue::Other(t.to_string()))
        }
        ColumnData::DateTime(_) | ColumnData::SmallDateTime(_) | ColumnData::DateTime2(_) => {
            return temporal::<NaiveDateTime>(&data, FieldValue::DateTime)
        }
        ColumnData::DateTimeOffset(_) => {
            return temporal::<DateTime<FixedOffset>>(&data, FieldValue::DateTimeOffset)
        }
    };
    Ok(value.unwrap_or(FieldValue::Null))
}

/// Run a query on `client` and feed its first result set into `sink`.
async fn pump_query(
    client: &mut MssqlClient,
    sql: String,
    values: Vec<BoundValue>,
    mut sink: RowSink,
) {
    let mut stream = match build_query(sql, values).query(client).await {
        Ok(stream) => stream,
        Err(e) => return sink.fail(anyhow!(e)).await,
    };
    let fields = match stream.columns().await {
        Ok(columns) => columns
            .unwrap_or_default()
            .iter()
            .map(|c| FieldInfo::new(c.name(), field_type_for(c.column_type())))
            .collect(),
        Err(e) => return sink.fail(anyhow!(e)).await,
    };
    sink.describe(fields);

    let mut rows = stream.into_row_stream();
    while let Some(item) = rows.next().await {
        match item {
            Ok(row) => {
                let cells = row.into_iter().map(convert).collect();
                if !sink.row(cells).await {
                    break;
                }
            }
            Err(e) => return sink.fail(anyhow!(e)).await,
        }
    }
}

async fn scalar(client: &mut MssqlClient, sql: String, values: Vec<BoundValue>) -> Result<FieldValue> {
    let row = build_query(sql, values)
        .query(client)
        .await?
        .into_row()
        .await?;
    let Some(first) = row.and_then(|r| r.into_iter().next()) else {
        return Ok(FieldValue::Null);
    };
    convert(first).map_err(|e| anyhow!(e))
}

pub struct MssqlConnection {
    runtime: &'static Runtime,
    slot: PumpSlot<MssqlClient>,
}

impl BackendConnection for MssqlConnection {
    fn execute_scalar(&mut self, command: &Command) -> Result<FieldValue> {
        let (sql, values) = command.prepare(PlaceholderStyle::AtP)?;
        let mut client = self.slot.acquire(self.runtime)?;
        let result = self.runtime.block_on(scalar(&mut client, sql, values));
        self.slot = PumpSlot::Idle(client);
        result
    }

    fn execute_reader(&mut self, command: &Command) -> Result<Box<dyn RowReader>> {
        let (sql, values) = command.prepare(PlaceholderStyle::AtP)?;
        tracing::debug!(sql = %sql, params = values.len(), "SQL Server query");
        let mut client = self.slot.acquire(self.runtime)?;
        let (handle, reader) = pump::start(self.runtime, move |sink| async move {
            pump_query(&mut client, sql, values, sink).await;
            client
        });
        self.slot = PumpSlot::Busy(handle);
        Ok(Box::new(reader?))
    }

    fn cancel(&mut self) -> Result<()> {
        // No out-of-band cancel; stopping the pump abandons the connection.
        if self.slot.abort() {
            tracing::debug!("Abandoned SQL Server connection with a pending result");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::borrow::Cow;

    #[test]
    fn test_field_type_mapping() {
        assert_eq!(field_type_for(ColumnType::Intn), FieldType::Int64);
        assert_eq!(field_type_for(ColumnType::Int1), FieldType::Byte);
        assert_eq!(field_type_for(ColumnType::Bitn), FieldType::Boolean);
        assert_eq!(field_type_for(ColumnType::Numericn), FieldType::Decimal);
        assert_eq!(field_type_for(ColumnType::NVarchar), FieldType::String);
        assert_eq!(field_type_for(ColumnType::Datetime2), FieldType::DateTime);
        assert_eq!(
            field_type_for(ColumnType::DatetimeOffsetn),
            FieldType::DateTimeOffset
        );
        assert_eq!(
            field_type_for(ColumnType::Guid),
            FieldType::Other("uniqueidentifier".into())
        );
    }

    #[test]
    fn test_convert_scalars() {
        assert_eq!(convert(ColumnData::I32(Some(7))), Ok(FieldValue::Int32(7)));
        assert_eq!(convert(ColumnData::I32(None)), Ok(FieldValue::Null));
        assert_eq!(convert(ColumnData::U8(Some(200))), Ok(FieldValue::Byte(200)));
        assert_eq!(convert(ColumnData::Bit(Some(true))), Ok(FieldValue::Boolean(true)));
        assert_eq!(
            convert(ColumnData::String(Some(Cow::Borrowed("Zoë")))),
            Ok(FieldValue::String("Zoë".into()))
        );
        assert_eq!(
            convert(ColumnData::Binary(Some(Cow::Owned(vec![0xAB, 0x01])))),
            Ok(FieldValue::Other("0xAB01".into()))
        );
    }

    #[test]
    fn test_convert_numeric() {
        let n = Numeric::new_with_scale(1225, 2);
        assert_eq!(convert(ColumnData::Numeric(Some(n))), Ok(FieldValue::Decimal(12.25)));
        let neg = Numeric::new_with_scale(-35, 1);
        assert_eq!(numeric_to_f64(neg), -3.5);
    }

    #[test]
    fn test_placeholders_use_at_p() {
        let mut command = Command::new(r#"SELECT * FROM "t" WHERE "id" = @arg1"#);
        command.bind("@arg1", BoundValue::Int(2));
        let (sql, values) = command.prepare(PlaceholderStyle::AtP).unwrap();
        assert_eq!(sql, r#"SELECT * FROM "t" WHERE "id" = @P1"#);
        assert_eq!(values, vec![BoundValue::Int(2)]);
    }
}
