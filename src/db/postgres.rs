//! PostgreSQL driver built on tokio-postgres.

use anyhow::{anyhow, Context, Result};
use bytes::BytesMut;
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use futures_util::StreamExt;
use postgres_native_tls::MakeTlsConnector;
use std::error::Error as StdError;
use std::fmt;
use std::fmt::Write as _;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::pin::Pin;
use std::str::FromStr;
use std::time::Duration;
use tokio::runtime::{Handle, Runtime};
use tokio_postgres::config::SslMode;
use tokio_postgres::types::{to_sql_checked, Format, FromSql, IsNull, Kind, ToSql, Type};
use tokio_postgres::{CancelToken, Client, Config, NoTls, Row, RowStream};

use super::connection::{
    runtime, BackendConnection, BackendKind, Command, ConnectionFactory, FieldInfo,
    PlaceholderStyle, RowReader,
};
use super::value::{BoundValue, FieldType, FieldValue};
use crate::config::PostgresTlsConfig;

pub struct PostgresFactory {
    connect_timeout: Duration,
    tls: PostgresTlsConfig,
}

impl PostgresFactory {
    pub fn new(connect_timeout: Duration, tls: PostgresTlsConfig) -> Self {
        Self {
            connect_timeout,
            tls,
        }
    }
}

impl ConnectionFactory for PostgresFactory {
    fn kind(&self) -> BackendKind {
        BackendKind::Postgres
    }

    fn open(&self, connection_string: &str) -> Result<Box<dyn BackendConnection>> {
        let runtime = runtime()?;
        let config =
            Config::from_str(connection_string).context("Invalid PostgreSQL connection string")?;
        let tls = match config.get_ssl_mode() {
            SslMode::Disable => None,
            _ => Some(build_tls_connector(&self.tls)?),
        };
        let client = runtime.block_on(create_client(&config, tls.clone(), self.connect_timeout))?;
        tracing::debug!(hosts = ?config.get_hosts(), "Opened PostgreSQL connection");
        Ok(Box::new(PostgresConnection {
            runtime,
            cancel: client.cancel_token(),
            client,
            tls,
        }))
    }
}

/// Connect and spawn the connection task on the current runtime.
async fn create_client(
    config: &Config,
    tls: Option<MakeTlsConnector>,
    timeout: Duration,
) -> Result<Client> {
    let secs = timeout.as_secs();
    let client = match tls {
        None => {
            let (client, connection) = tokio::time::timeout(timeout, config.connect(NoTls))
                .await
                .map_err(|_| anyhow!("Connection timed out after {secs}s"))?
                .context("Failed to connect to PostgreSQL")?;
            tokio::spawn(async move {
                if let Err(e) = connection.await {
                    tracing::error!(error = %e, "PostgreSQL connection error");
                }
            });
            client
        }
        Some(tls) => {
            let (client, connection) = tokio::time::timeout(timeout, config.connect(tls))
                .await
                .map_err(|_| anyhow!("Connection timed out after {secs}s"))?
                .context("Failed to connect to PostgreSQL")?;
            tokio::spawn(async move {
                if let Err(e) = connection.await {
                    tracing::error!(error = %e, "PostgreSQL connection error");
                }
            });
            client
        }
    };
    Ok(client)
}

fn build_tls_connector(config: &PostgresTlsConfig) -> Result<MakeTlsConnector> {
    let mut builder = native_tls::TlsConnector::builder();

    if config.accept_invalid_certs {
        builder.danger_accept_invalid_certs(true);
        builder.danger_accept_invalid_hostnames(true);
    } else if let Some(ca_path) = &config.ca_cert_path {
        let pem = std::fs::read_to_string(ca_path).with_context(|| {
            format!("Failed to read CA certificate file: {}", ca_path.display())
        })?;
        let blocks = split_pem_certificates(&pem);
        if blocks.is_empty() {
            anyhow::bail!("No certificates found in {}", ca_path.display());
        }
        for block in blocks {
            let cert = native_tls::Certificate::from_pem(block.as_bytes())
                .context("Failed to parse certificate")?;
            builder.add_root_certificate(cert);
        }
    }

    let connector = builder.build().context("Failed to build TLS connector")?;
    Ok(MakeTlsConnector::new(connector))
}

/// Split a PEM bundle into one string per certificate block.
fn split_pem_certificates(pem: &str) -> Vec<String> {
    let mut certs = Vec::new();
    let mut current = String::new();
    let mut in_cert = false;

    for line in pem.lines() {
        let line = line.trim();
        if line == "-----BEGIN CERTIFICATE-----" {
            in_cert = true;
            current.clear();
            current.push_str(line);
            current.push('\n');
        } else if line == "-----END CERTIFICATE-----" {
            if in_cert {
                current.push_str(line);
                current.push('\n');
                certs.push(std::mem::take(&mut current));
            }
            in_cert = false;
        } else if in_cert && !line.is_empty() {
            current.push_str(line);
            current.push('\n');
        }
    }

    certs
}

#[derive(Debug, Clone, PartialEq)]
enum ErrorCategory {
    Syntax,
    Semantic,
    Execution,
    Transaction,
    Connection,
    Unknown,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCategory::Syntax => write!(f, "Syntax Error"),
            ErrorCategory::Semantic => write!(f, "Semantic Error"),
            ErrorCategory::Execution => write!(f, "Execution Error"),
            ErrorCategory::Transaction => write!(f, "Transaction Error"),
            ErrorCategory::Connection => write!(f, "Connection Error"),
            ErrorCategory::Unknown => write!(f, "Error"),
        }
    }
}

fn categorize_sqlstate(code: &str) -> ErrorCategory {
    if code.len() < 2 {
        return ErrorCategory::Unknown;
    }
    match &code[..2] {
        "42" if code == "42601" || code == "42000" => ErrorCategory::Syntax,
        // undefined_table, undefined_column, undefined_function, ...
        "42" => ErrorCategory::Semantic,
        "22" | "23" | "53" | "54" | "55" | "57" => ErrorCategory::Execution,
        "25" | "40" => ErrorCategory::Transaction,
        "08" => ErrorCategory::Connection,
        _ => ErrorCategory::Unknown,
    }
}

/// Render a driver error with the server's SQLSTATE, detail and hint.
fn describe_error(err: &tokio_postgres::Error) -> anyhow::Error {
    let Some(db) = err.as_db_error() else {
        return anyhow!("{err}");
    };
    let code = db.code().code();
    let mut msg = format!(
        "{}: {} (SQLSTATE {code})",
        categorize_sqlstate(code),
        db.message()
    );
    if let Some(detail) = db.detail() {
        let _ = write!(msg, "\nDETAIL: {detail}");
    }
    if let Some(hint) = db.hint() {
        let _ = write!(msg, "\nHINT: {hint}");
    }
    anyhow!(msg)
}

/// Cast appended to a placeholder so the server types it by the bound value
/// instead of inferring it from the compared column. Text stays untyped.
fn parameter_cast(value: &BoundValue) -> &'static str {
    match value {
        BoundValue::Int(_) => "::int8",
        BoundValue::Real(_) => "::float8",
        BoundValue::Null | BoundValue::Text(_) => "",
    }
}

/// A bound value. Integers and reals go in binary as int8/float8, matching
/// [`parameter_cast`]; anything else goes in text format.
#[derive(Debug)]
struct PgParam(BoundValue);

impl PgParam {
    fn is_binary(&self, ty: &Type) -> bool {
        matches!(
            (&self.0, ty),
            (BoundValue::Int(_), &Type::INT8) | (BoundValue::Real(_), &Type::FLOAT8)
        )
    }
}

impl ToSql for PgParam {
    fn to_sql(
        &self,
        ty: &Type,
        out: &mut BytesMut,
    ) -> std::result::Result<IsNull, Box<dyn StdError + Sync + Send>> {
        match (&self.0, self.is_binary(ty)) {
            (BoundValue::Null, _) => return Ok(IsNull::Yes),
            (BoundValue::Int(i), true) => return i.to_sql(ty, out),
            (BoundValue::Real(f), true) => return f.to_sql(ty, out),
            _ => {}
        }
        let text = match &self.0 {
            BoundValue::Int(i) => i.to_string(),
            BoundValue::Real(f) => format_float(*f),
            BoundValue::Text(s) => s.clone(),
            BoundValue::Null => return Ok(IsNull::Yes),
        };
        out.extend_from_slice(text.as_bytes());
        Ok(IsNull::No)
    }

    fn accepts(_ty: &Type) -> bool {
        true
    }

    fn encode_format(&self, ty: &Type) -> Format {
        if self.is_binary(ty) {
            Format::Binary
        } else {
            Format::Text
        }
    }

    to_sql_checked!();
}

fn format_float(f: f64) -> String {
    if f == f64::INFINITY {
        "Infinity".to_string()
    } else if f == f64::NEG_INFINITY {
        "-Infinity".to_string()
    } else {
        f.to_string()
    }
}

/// NUMERIC narrowed to `f64`.
struct PgNumeric(f64);

impl<'a> FromSql<'a> for PgNumeric {
    fn from_sql(
        _ty: &Type,
        raw: &'a [u8],
    ) -> std::result::Result<Self, Box<dyn StdError + Sync + Send>> {
        decode_numeric(raw).map(PgNumeric)
    }

    fn accepts(ty: &Type) -> bool {
        *ty == Type::NUMERIC
    }
}

const NUMERIC_NEG: u16 = 0x4000;
const NUMERIC_NAN: u16 = 0xC000;
const NUMERIC_PINF: u16 = 0xD000;
const NUMERIC_NINF: u16 = 0xF000;

/// Decode the binary NUMERIC layout: digit count, weight, sign and display
/// scale, followed by base-10000 digits.
fn decode_numeric(raw: &[u8]) -> std::result::Result<f64, Box<dyn StdError + Sync + Send>> {
    if raw.len() < 8 {
        return Err("numeric value is truncated".into());
    }
    let word = |i: usize| u16::from_be_bytes([raw[i], raw[i + 1]]);
    let ndigits = word(0) as usize;
    let weight = i32::from(word(2) as i16);
    let sign = word(4);
    if raw.len() < 8 + ndigits * 2 {
        return Err("numeric value is truncated".into());
    }
    match sign {
        NUMERIC_NAN => return Ok(f64::NAN),
        NUMERIC_PINF => return Ok(f64::INFINITY),
        NUMERIC_NINF => return Ok(f64::NEG_INFINITY),
        _ => {}
    }

    let digit_at = |exp: i32| -> u16 {
        let i = weight - exp;
        if i >= 0 && (i as usize) < ndigits {
            word(8 + 2 * i as usize)
        } else {
            0
        }
    };

    let mut text = String::new();
    if sign == NUMERIC_NEG {
        text.push('-');
    }
    let top = weight.max(0);
    for exp in (0..=top).rev() {
        let digit = digit_at(exp);
        if exp == top {
            let _ = write!(text, "{digit}");
        } else {
            let _ = write!(text, "{digit:04}");
        }
    }
    let lowest = weight - ndigits as i32 + 1;
    if lowest < 0 {
        text.push('.');
        for exp in (lowest..0).rev() {
            let _ = write!(text, "{:04}", digit_at(exp));
        }
    }
    Ok(text.parse::<f64>()?)
}

/// Any value, kept as the raw bytes the server sent.
struct RawBytes(Vec<u8>);

impl<'a> FromSql<'a> for RawBytes {
    fn from_sql(
        _ty: &Type,
        raw: &'a [u8],
    ) -> std::result::Result<Self, Box<dyn StdError + Sync + Send>> {
        Ok(RawBytes(raw.to_vec()))
    }

    fn accepts(_ty: &Type) -> bool {
        true
    }
}

fn hex_string(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(2 + bytes.len() * 2);
    out.push_str("\\x");
    for b in bytes {
        let _ = write!(out, "{b:02x}");
    }
    out
}

fn field_type_for(ty: &Type) -> FieldType {
    match *ty {
        Type::INT2 => FieldType::Int16,
        Type::INT4 => FieldType::Int32,
        Type::INT8 => FieldType::Int64,
        Type::BOOL => FieldType::Boolean,
        Type::FLOAT4 => FieldType::Float32,
        Type::FLOAT8 => FieldType::Float64,
        Type::NUMERIC => FieldType::Decimal,
        Type::TEXT | Type::VARCHAR | Type::BPCHAR | Type::NAME => FieldType::String,
        Type::CHAR => FieldType::Char,
        Type::DATE => FieldType::Date,
        Type::TIMESTAMP => FieldType::DateTime,
        Type::TIMESTAMPTZ => FieldType::DateTimeOffset,
        _ => FieldType::Other(ty.name().to_string()),
    }
}

fn extract(row: &Row, idx: usize, field_type: &FieldType) -> Result<FieldValue> {
    let value = match field_type {
        FieldType::Int16 => row.try_get::<_, Option<i16>>(idx)?.map(FieldValue::Int16),
        FieldType::Int32 => row.try_get::<_, Option<i32>>(idx)?.map(FieldValue::Int32),
        FieldType::Int64 => row.try_get::<_, Option<i64>>(idx)?.map(FieldValue::Int64),
        FieldType::Byte => row
            .try_get::<_, Option<i8>>(idx)?
            .map(|b| FieldValue::Byte(b as u8)),
        FieldType::Boolean => row.try_get::<_, Option<bool>>(idx)?.map(FieldValue::Boolean),
        FieldType::Float32 => row.try_get::<_, Option<f32>>(idx)?.map(FieldValue::Float32),
        FieldType::Float64 => row.try_get::<_, Option<f64>>(idx)?.map(FieldValue::Float64),
        FieldType::Decimal => row
            .try_get::<_, Option<PgNumeric>>(idx)?
            .map(|n| FieldValue::Decimal(n.0)),
        FieldType::String => row.try_get::<_, Option<String>>(idx)?.map(FieldValue::String),
        FieldType::Char => row
            .try_get::<_, Option<i8>>(idx)?
            .map(|c| FieldValue::Char(char::from(c as u8))),
        FieldType::Date => row.try_get::<_, Option<NaiveDate>>(idx)?.map(FieldValue::Date),
        FieldType::DateTime => row
            .try_get::<_, Option<NaiveDateTime>>(idx)?
            .map(FieldValue::DateTime),
        FieldType::DateTimeOffset => row
            .try_get::<_, Option<DateTime<Utc>>>(idx)?
            .map(|dt| FieldValue::DateTimeOffset(dt.fixed_offset())),
        FieldType::Other(_) => extract_other(row, idx)?.map(FieldValue::Other),
    };
    Ok(value.unwrap_or(FieldValue::Null))
}

/// Text rendering for types with no closer mapping.
fn extract_other(row: &Row, idx: usize) -> Result<Option<String>> {
    let ty = row.columns()[idx].type_();
    let Some(raw) = row.try_get::<_, Option<RawBytes>>(idx)? else {
        return Ok(None);
    };
    render_other(ty, &raw.0)
        .map(Some)
        .map_err(|e| anyhow!("Failed to decode {} value: {e}", ty.name()))
}

type DecodeError = Box<dyn StdError + Sync + Send>;

/// Render a binary-format value the way the server's text output would.
/// Types with no known layout come out as hex.
fn render_other(ty: &Type, raw: &[u8]) -> std::result::Result<String, DecodeError> {
    if let Kind::Domain(base) = ty.kind() {
        return render_other(base, raw);
    }
    if matches!(ty.kind(), Kind::Enum(_)) || is_text_shaped(ty) {
        return Ok(std::str::from_utf8(raw)?.to_string());
    }
    let text = match *ty {
        Type::INT2 => i16::from_sql(ty, raw)?.to_string(),
        Type::INT4 => i32::from_sql(ty, raw)?.to_string(),
        Type::INT8 => i64::from_sql(ty, raw)?.to_string(),
        Type::FLOAT4 => f32::from_sql(ty, raw)?.to_string(),
        Type::FLOAT8 => f64::from_sql(ty, raw)?.to_string(),
        Type::NUMERIC => decode_numeric(raw)?.to_string(),
        Type::BOOL => String::from(if bool::from_sql(ty, raw)? { "t" } else { "f" }),
        Type::JSON | Type::JSONB => serde_json::Value::from_sql(ty, raw)?.to_string(),
        Type::TIME => NaiveTime::from_sql(ty, raw)?.to_string(),
        Type::OID => u32::from_sql(ty, raw)?.to_string(),
        Type::UUID => uuid::Uuid::from_sql(ty, raw)?.to_string(),
        Type::INTERVAL => decode_interval(raw)?,
        Type::TIMETZ => decode_timetz(raw)?,
        Type::INET | Type::CIDR => decode_inet(raw)?,
        Type::MACADDR => decode_macaddr(raw)?,
        _ => hex_string(raw),
    };
    Ok(text)
}

/// Types whose binary form is their text form.
fn is_text_shaped(ty: &Type) -> bool {
    matches!(
        *ty,
        Type::TEXT | Type::VARCHAR | Type::BPCHAR | Type::NAME | Type::XML | Type::UNKNOWN
    ) || ty.name() == "citext"
}

fn be_i64(raw: &[u8]) -> i64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&raw[..8]);
    i64::from_be_bytes(buf)
}

fn be_i32(raw: &[u8]) -> i32 {
    let mut buf = [0u8; 4];
    buf.copy_from_slice(&raw[..4]);
    i32::from_be_bytes(buf)
}

/// `HH:MM:SS[.ffffff]` with trailing fraction zeros dropped. Hours may
/// exceed 24.
fn format_clock(micros: i64) -> String {
    let micros = micros.unsigned_abs();
    let secs = micros / 1_000_000;
    let frac = micros % 1_000_000;
    let mut out = format!("{:02}:{:02}:{:02}", secs / 3600, secs / 60 % 60, secs % 60);
    if frac != 0 {
        let digits = format!("{frac:06}");
        out.push('.');
        out.push_str(digits.trim_end_matches('0'));
    }
    out
}

/// Interval layout: microseconds (i64), days (i32), months (i32), rendered in
/// the `postgres` interval style.
fn decode_interval(raw: &[u8]) -> std::result::Result<String, DecodeError> {
    if raw.len() != 16 {
        return Err("interval value must be 16 bytes".into());
    }
    let micros = be_i64(raw);
    let days = be_i32(&raw[8..]);
    let months = be_i32(&raw[12..]);

    let mut parts = Vec::new();
    let mut unit = |n: i32, singular: &str, plural: &str| {
        if n != 0 {
            parts.push(format!("{n} {}", if n == 1 { singular } else { plural }));
        }
    };
    unit(months / 12, "year", "years");
    unit(months % 12, "mon", "mons");
    unit(days, "day", "days");

    let any_negative = months / 12 < 0 || months % 12 < 0 || days < 0;
    if micros != 0 || parts.is_empty() {
        let sign = if micros < 0 {
            "-"
        } else if any_negative {
            "+"
        } else {
            ""
        };
        parts.push(format!("{sign}{}", format_clock(micros)));
    }
    Ok(parts.join(" "))
}

/// Time of day (i64 microseconds) plus zone offset in seconds west of UTC.
fn decode_timetz(raw: &[u8]) -> std::result::Result<String, DecodeError> {
    if raw.len() != 12 {
        return Err("timetz value must be 12 bytes".into());
    }
    let micros = be_i64(raw);
    let east = -be_i32(&raw[8..]);
    let sign = if east < 0 { '-' } else { '+' };
    let offset = east.unsigned_abs();
    let mut out = format!("{}{sign}{:02}", format_clock(micros), offset / 3600);
    if offset % 3600 != 0 {
        let _ = write!(out, ":{:02}", offset / 60 % 60);
        if offset % 60 != 0 {
            let _ = write!(out, ":{:02}", offset % 60);
        }
    }
    Ok(out)
}

const PGSQL_AF_INET: u8 = 2;
const PGSQL_AF_INET6: u8 = 3;

/// Family, prefix bits, cidr flag, address length, address bytes.
fn decode_inet(raw: &[u8]) -> std::result::Result<String, DecodeError> {
    let [family, bits, is_cidr, len, addr @ ..] = raw else {
        return Err("inet value is truncated".into());
    };
    if addr.len() != usize::from(*len) {
        return Err("inet address length mismatch".into());
    }
    let (address, max_bits) = match (*family, addr) {
        (PGSQL_AF_INET, [a, b, c, d]) => (Ipv4Addr::new(*a, *b, *c, *d).to_string(), 32),
        (PGSQL_AF_INET6, _) => {
            let octets: [u8; 16] = addr.try_into()?;
            (Ipv6Addr::from(octets).to_string(), 128)
        }
        _ => return Err(format!("unknown inet family {family}").into()),
    };
    if *is_cidr != 0 || *bits != max_bits {
        Ok(format!("{address}/{bits}"))
    } else {
        Ok(address)
    }
}

fn decode_macaddr(raw: &[u8]) -> std::result::Result<String, DecodeError> {
    if raw.len() != 6 {
        return Err("macaddr value must be 6 bytes".into());
    }
    let parts: Vec<String> = raw.iter().map(|b| format!("{b:02x}")).collect();
    Ok(parts.join(":"))
}

pub struct PostgresConnection {
    runtime: &'static Runtime,
    client: Client,
    cancel: CancelToken,
    tls: Option<MakeTlsConnector>,
}

impl PostgresConnection {
    fn params(values: Vec<BoundValue>) -> Vec<PgParam> {
        values.into_iter().map(PgParam).collect()
    }
}

impl BackendConnection for PostgresConnection {
    fn execute_scalar(&mut self, command: &Command) -> Result<FieldValue> {
        let (sql, values) =
            command.prepare_with(PlaceholderStyle::Dollar, parameter_cast)?;
        let params = Self::params(values);
        let client = &self.client;
        let rows = self.runtime.block_on(async {
            let refs: Vec<&(dyn ToSql + Sync)> =
                params.iter().map(|p| p as &(dyn ToSql + Sync)).collect();
            client.query(sql.as_str(), &refs).await
        });
        let rows = rows.map_err(|e| describe_error(&e))?;
        let Some(row) = rows.first() else {
            return Ok(FieldValue::Null);
        };
        let Some(column) = row.columns().first() else {
            return Ok(FieldValue::Null);
        };
        extract(row, 0, &field_type_for(column.type_()))
    }

    fn execute_reader(&mut self, command: &Command) -> Result<Box<dyn RowReader>> {
        let (sql, values) =
            command.prepare_with(PlaceholderStyle::Dollar, parameter_cast)?;
        tracing::debug!(sql = %sql, params = values.len(), "PostgreSQL query");
        let params = Self::params(values);
        let client = &self.client;
        let (statement, stream) = self
            .runtime
            .block_on(async {
                let statement = client.prepare(&sql).await?;
                let refs = params.iter().map(|p| p as &(dyn ToSql + Sync));
                let stream = client.query_raw(&statement, refs).await?;
                Ok::<_, tokio_postgres::Error>((statement, stream))
            })
            .map_err(|e| describe_error(&e))?;

        let fields = statement
            .columns()
            .iter()
            .map(|c| FieldInfo::new(c.name(), field_type_for(c.type_())))
            .collect();
        Ok(Box::new(PostgresReader {
            runtime: self.runtime.handle().clone(),
            fields,
            stream: Box::pin(stream),
            current: None,
        }))
    }

    fn cancel(&mut self) -> Result<()> {
        let token = &self.cancel;
        let result = match &self.tls {
            Some(tls) => self.runtime.block_on(token.cancel_query(tls.clone())),
            None => self.runtime.block_on(token.cancel_query(NoTls)),
        };
        result.map_err(|e| describe_error(&e))
    }
}

struct PostgresReader {
    runtime: Handle,
    fields: Vec<FieldInfo>,
    stream: Pin<Box<RowStream>>,
    current: Option<Row>,
}

impl RowReader for PostgresReader {
    fn fields(&self) -> &[FieldInfo] {
        &self.fields
    }

    fn read(&mut self) -> Result<bool> {
        match self.runtime.block_on(self.stream.next()) {
            Some(Ok(row)) => {
                self.current = Some(row);
                Ok(true)
            }
            Some(Err(e)) => {
                self.current = None;
                Err(describe_error(&e))
            }
            None => {
                self.current = None;
                Ok(false)
            }
        }
    }

    fn value(&self, index: usize) -> Result<FieldValue> {
        let row = self
            .current
            .as_ref()
            .ok_or_else(|| anyhow!("No current row"))?;
        let field = self
            .fields
            .get(index)
            .ok_or_else(|| anyhow!("Field index {index} is out of range"))?;
        extract(row, index, &field.field_type)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn numeric(weight: i16, sign: u16, dscale: u16, digits: &[u16]) -> Vec<u8> {
        let mut raw = Vec::new();
        raw.extend_from_slice(&(digits.len() as u16).to_be_bytes());
        raw.extend_from_slice(&weight.to_be_bytes());
        raw.extend_from_slice(&sign.to_be_bytes());
        raw.extend_from_slice(&dscale.to_be_bytes());
        for d in digits {
            raw.extend_from_slice(&d.to_be_bytes());
        }
        raw
    }

    #[test]
    fn test_decode_numeric() {
        assert_eq!(decode_numeric(&numeric(0, 0, 2, &[12, 2500])).unwrap(), 12.25);
        assert_eq!(decode_numeric(&numeric(1, 0, 0, &[100])).unwrap(), 1_000_000.0);
        assert_eq!(decode_numeric(&numeric(-1, 0, 4, &[1])).unwrap(), 0.0001);
        assert_eq!(decode_numeric(&numeric(-2, 0, 8, &[5])).unwrap(), 0.00000005);
        assert_eq!(decode_numeric(&numeric(0, NUMERIC_NEG, 1, &[3, 5000])).unwrap(), -3.5);
        assert_eq!(decode_numeric(&numeric(0, 0, 0, &[])).unwrap(), 0.0);
        assert!(decode_numeric(&numeric(0, NUMERIC_NAN, 0, &[])).unwrap().is_nan());
        assert_eq!(
            decode_numeric(&numeric(0, NUMERIC_NINF, 0, &[])).unwrap(),
            f64::NEG_INFINITY
        );
    }

    #[test]
    fn test_decode_numeric_truncated() {
        assert!(decode_numeric(&[0, 1]).is_err());
        let mut raw = numeric(0, 0, 0, &[7, 7]);
        raw.truncate(raw.len() - 1);
        assert!(decode_numeric(&raw).is_err());
    }

    fn param_bytes(value: BoundValue, ty: &Type) -> Option<Vec<u8>> {
        let mut out = BytesMut::new();
        match PgParam(value).to_sql(ty, &mut out).unwrap() {
            IsNull::Yes => None,
            IsNull::No => Some(out.to_vec()),
        }
    }

    #[test]
    fn test_numeric_params_are_cast() {
        let mut command = Command::new(r#"SELECT * FROM "t" WHERE "id" > @arg1 AND "n" = @arg2"#);
        command.bind("@arg1", BoundValue::Real(5.5));
        command.bind("@arg2", BoundValue::Int(5));
        let (sql, _) = command
            .prepare_with(PlaceholderStyle::Dollar, parameter_cast)
            .unwrap();
        assert_eq!(sql, r#"SELECT * FROM "t" WHERE "id" > $1::float8 AND "n" = $2::int8"#);

        let mut command = Command::new(r#"SELECT * FROM "t" WHERE "s" LIKE @arg1"#);
        command.bind("@arg1", BoundValue::Text("9%".into()));
        let (sql, _) = command
            .prepare_with(PlaceholderStyle::Dollar, parameter_cast)
            .unwrap();
        assert_eq!(sql, r#"SELECT * FROM "t" WHERE "s" LIKE $1"#);
    }

    #[test]
    fn test_real_param_is_float8_binary() {
        // A real compared with an int4 column is typed float8 by its cast.
        let param = PgParam(BoundValue::Real(5.5));
        assert!(matches!(param.encode_format(&Type::FLOAT8), Format::Binary));
        assert_eq!(
            param_bytes(BoundValue::Real(5.5), &Type::FLOAT8),
            Some(5.5f64.to_be_bytes().to_vec())
        );
        assert_eq!(
            param_bytes(BoundValue::Int(-42), &Type::INT8),
            Some((-42i64).to_be_bytes().to_vec())
        );
    }

    #[test]
    fn test_text_params_stay_text() {
        let text = |v: BoundValue, ty: &Type| {
            param_bytes(v, ty).map(|b| String::from_utf8(b).unwrap())
        };
        assert_eq!(text(BoundValue::Text("9%".into()), &Type::TEXT), Some("9%".to_string()));
        assert_eq!(
            text(BoundValue::Real(f64::NEG_INFINITY), &Type::TEXT),
            Some("-Infinity".to_string())
        );
        assert_eq!(text(BoundValue::Int(7), &Type::NUMERIC), Some("7".to_string()));
        assert_eq!(param_bytes(BoundValue::Null, &Type::INT8), None);
        assert!(matches!(
            PgParam(BoundValue::Text("x".into())).encode_format(&Type::TEXT),
            Format::Text
        ));
    }

    #[test]
    fn test_categorize_sqlstate() {
        assert_eq!(categorize_sqlstate("42601"), ErrorCategory::Syntax);
        assert_eq!(categorize_sqlstate("42P01"), ErrorCategory::Semantic);
        assert_eq!(categorize_sqlstate("22012"), ErrorCategory::Execution);
        assert_eq!(categorize_sqlstate("40001"), ErrorCategory::Transaction);
        assert_eq!(categorize_sqlstate("08006"), ErrorCategory::Connection);
        assert_eq!(categorize_sqlstate("XX000"), ErrorCategory::Unknown);
        assert_eq!(categorize_sqlstate("4"), ErrorCategory::Unknown);
    }

    #[test]
    fn test_field_type_mapping() {
        assert_eq!(field_type_for(&Type::INT2), FieldType::Int16);
        assert_eq!(field_type_for(&Type::NUMERIC), FieldType::Decimal);
        assert_eq!(field_type_for(&Type::BPCHAR), FieldType::String);
        assert_eq!(field_type_for(&Type::CHAR), FieldType::Char);
        assert_eq!(field_type_for(&Type::TIMESTAMPTZ), FieldType::DateTimeOffset);
        assert_eq!(field_type_for(&Type::UUID), FieldType::Other("uuid".into()));
    }

    #[test]
    fn test_split_pem_certificates() {
        let pem = "junk\n-----BEGIN CERTIFICATE-----\nAAAA\nBBBB\n-----END CERTIFICATE-----\n\
                   -----BEGIN CERTIFICATE-----\nCCCC\n-----END CERTIFICATE-----\n";
        let certs = split_pem_certificates(pem);
        assert_eq!(certs.len(), 2);
        assert!(certs[0].contains("AAAA\nBBBB\n"));
        assert!(certs[1].starts_with("-----BEGIN CERTIFICATE-----\nCCCC"));
    }

    fn interval(micros: i64, days: i32, months: i32) -> Vec<u8> {
        let mut raw = micros.to_be_bytes().to_vec();
        raw.extend_from_slice(&days.to_be_bytes());
        raw.extend_from_slice(&months.to_be_bytes());
        raw
    }

    #[test]
    fn test_render_uuid_and_interval() {
        assert_eq!(
            render_other(&Type::UUID, b"0123456789abcdef").unwrap(),
            "30313233-3435-3637-3839-616263646566"
        );
        assert_eq!(render_other(&Type::INTERVAL, &interval(0, 1, 0)).unwrap(), "1 day");
        assert_eq!(render_other(&Type::INTERVAL, &interval(0, 0, 0)).unwrap(), "00:00:00");
        assert_eq!(
            render_other(&Type::INTERVAL, &interval(14_706_500_000, 3, 14)).unwrap(),
            "1 year 2 mons 3 days 04:05:06.5"
        );
        assert_eq!(
            render_other(&Type::INTERVAL, &interval(3_600_000_000, -1, 0)).unwrap(),
            "-1 days +01:00:00"
        );
        assert!(render_other(&Type::INTERVAL, &[0; 4]).is_err());
    }

    #[test]
    fn test_render_network_and_time_types() {
        assert_eq!(render_other(&Type::INET, &[2, 32, 0, 4, 192, 168, 0, 1]).unwrap(), "192.168.0.1");
        assert_eq!(render_other(&Type::CIDR, &[2, 8, 1, 4, 10, 0, 0, 0]).unwrap(), "10.0.0.0/8");
        let mut v6 = vec![3, 64, 0, 16, 0x20, 0x01, 0x0d, 0xb8];
        v6.extend_from_slice(&[0; 12]);
        assert_eq!(render_other(&Type::INET, &v6).unwrap(), "2001:db8::/64");
        assert_eq!(
            render_other(&Type::MACADDR, &[8, 0, 0x2b, 1, 2, 3]).unwrap(),
            "08:00:2b:01:02:03"
        );

        let mut timetz = 36_000_000_000i64.to_be_bytes().to_vec();
        timetz.extend_from_slice(&(-19_800i32).to_be_bytes());
        assert_eq!(render_other(&Type::TIMETZ, &timetz).unwrap(), "10:00:00+05:30");
    }

    #[test]
    fn test_render_text_shaped_and_unknown() {
        let mood = Type::new(
            "mood".into(),
            90_001,
            Kind::Enum(vec!["happy".into(), "sad".into()]),
            "public".into(),
        );
        assert_eq!(render_other(&mood, b"happy").unwrap(), "happy");
        let email = Type::new("email".into(), 90_002, Kind::Domain(Type::TEXT), "public".into());
        assert_eq!(render_other(&email, b"a@b.c").unwrap(), "a@b.c");
        let port = Type::new("port".into(), 90_003, Kind::Domain(Type::INT4), "public".into());
        assert_eq!(render_other(&port, &[0, 0, 0x1f, 0x90]).unwrap(), "8080");
        assert_eq!(render_other(&Type::BYTEA, &[0xde, 0xad]).unwrap(), "\\xdead");
        assert_eq!(render_other(&Type::INT4_ARRAY, &[0, 1]).unwrap(), "\\x0001");
    }

    #[test]
    fn test_hex_string() {
        assert_eq!(hex_string(&[0xde, 0xad, 0x01]), "\\xdead01");
    }

    #[test]
    fn test_invalid_connection_string() {
        let factory = PostgresFactory::new(Duration::from_secs(1), PostgresTlsConfig::default());
        let err = factory.open("host=localhost port=notaport").err().unwrap();
        assert!(format!("{err:#}").contains("Invalid PostgreSQL connection string"));
    }
}
