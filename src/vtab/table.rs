use anyhow::{anyhow, Context as _};
use rusqlite::ffi;
use rusqlite::types::Value;
use rusqlite::vtab::{CreateVTab, IndexInfo, VTab, VTabConnection, VTabKind};
use std::sync::Arc;

use super::cursor::ForeignCursor;
use super::plan::{compile, ScanRequest};
use super::parse_arguments;
use crate::db::{BackendConnection, ConnectionFactory, FieldType, FieldValue};
use crate::error::{AdapterError, AdapterResult};

/// Quote an identifier with double quotes, doubling embedded quotes.
pub fn quote_identifier(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Identity and discovered shape of one attached remote table.
///
/// Snapshotted when the table is attached and never refreshed.
#[derive(Debug, Clone, PartialEq)]
pub struct TableDescriptor {
    pub connection_string: String,
    pub remote_table_name: String,
    /// Canonical column index space for the lifetime of the attach.
    pub column_names: Vec<String>,
    pub column_types: Vec<FieldType>,
    /// Cardinality estimate, only used for planning costs.
    pub initial_row_count: i64,
}

impl TableDescriptor {
    /// Probe the remote table for its columns and row count.
    ///
    /// The connection opened here is dropped before returning, on every path.
    pub fn discover(
        factory: &dyn ConnectionFactory,
        connection_string: &str,
        remote_table_name: &str,
    ) -> anyhow::Result<Self> {
        let mut conn = factory
            .open(connection_string)
            .with_context(|| format!("Failed to open {} connection", factory.kind()))?;
        let quoted = quote_identifier(remote_table_name);

        let probe = conn.create_command(&format!("SELECT * FROM {quoted} WHERE 1 = 0"));
        let fields = {
            let reader = conn
                .execute_reader(&probe)
                .with_context(|| format!("Failed to read the columns of {quoted}"))?;
            reader.fields().to_vec()
        };
        if fields.is_empty() {
            return Err(anyhow!("{quoted} has no columns"));
        }

        let count = conn.create_command(&format!("SELECT COUNT(*) FROM {quoted}"));
        let initial_row_count = row_count(
            conn.execute_scalar(&count)
                .with_context(|| format!("Failed to count the rows of {quoted}"))?,
        );

        let (column_names, column_types): (Vec<String>, Vec<FieldType>) = fields
            .into_iter()
            .map(|f| (f.name, f.field_type))
            .unzip();
        Ok(Self {
            connection_string: connection_string.to_string(),
            remote_table_name: remote_table_name.to_string(),
            column_names,
            column_types,
            initial_row_count,
        })
    }

    /// The `CREATE TABLE` statement declared to SQLite.
    pub fn declared_schema(&self) -> String {
        let columns: Vec<String> = self
            .column_names
            .iter()
            .zip(&self.column_types)
            .map(|(name, ty)| format!("{} {}", quote_identifier(name), ty.host_type().as_sql()))
            .collect();
        format!("CREATE TABLE a ({})", columns.join(", "))
    }

    pub fn base_select(&self) -> String {
        format!("SELECT * FROM {}", quote_identifier(&self.remote_table_name))
    }
}

fn row_count(value: FieldValue) -> i64 {
    match value.to_host() {
        Value::Integer(n) => n,
        Value::Real(f) => f as i64,
        Value::Text(s) => s.trim().parse().unwrap_or(0),
        _ => 0,
    }
}

/// SQLite virtual table over one remote table.
#[repr(C)]
pub struct ForeignTable {
    base: ffi::sqlite3_vtab,
    descriptor: TableDescriptor,
    factory: Arc<dyn ConnectionFactory>,
}

impl ForeignTable {
    pub fn new(descriptor: TableDescriptor, factory: Arc<dyn ConnectionFactory>) -> Self {
        Self {
            base: ffi::sqlite3_vtab::default(),
            descriptor,
            factory,
        }
    }

    pub fn descriptor(&self) -> &TableDescriptor {
        &self.descriptor
    }

    /// A fresh connection for one cursor.
    pub(crate) fn open_connection(&self) -> AdapterResult<Box<dyn BackendConnection>> {
        self.factory
            .open(&self.descriptor.connection_string)
            .map_err(AdapterError::Connect)
    }
}

unsafe impl<'vtab> VTab<'vtab> for ForeignTable {
    type Aux = Arc<dyn ConnectionFactory>;
    type Cursor = ForeignCursor<'vtab>;

    fn connect(
        _db: &mut VTabConnection,
        aux: Option<&Self::Aux>,
        args: &[&[u8]],
    ) -> rusqlite::Result<(String, Self)> {
        let (module, connection_string, table_name) = parse_arguments(args)?;
        let factory = aux
            .cloned()
            .ok_or_else(|| AdapterError::Create(anyhow!("module {module} has no backend")))?;

        let descriptor = TableDescriptor::discover(factory.as_ref(), &connection_string, &table_name)
            .map_err(|e| {
                tracing::error!(
                    module = %module,
                    table = %table_name,
                    error = format!("{e:#}"),
                    "Failed to attach remote table"
                );
                AdapterError::Create(e)
            })?;
        tracing::info!(
            module = %module,
            table = %table_name,
            columns = descriptor.column_names.len(),
            rows = descriptor.initial_row_count,
            "Attached remote table"
        );

        let schema = descriptor.declared_schema();
        Ok((schema, Self::new(descriptor, factory)))
    }

    fn best_index(&self, info: &mut IndexInfo) -> rusqlite::Result<()> {
        let request = ScanRequest::from_index_info(info);
        let plan = compile(&self.descriptor, &request);
        tracing::debug!(
            sql = %plan.sql,
            claimed = plan.claimed(),
            order_by = plan.order_by_consumed,
            "Compiled scan"
        );
        plan.apply(info);
        Ok(())
    }

    fn open(&'vtab mut self) -> rusqlite::Result<ForeignCursor<'vtab>> {
        Ok(ForeignCursor::new(self)?)
    }
}

impl CreateVTab<'_> for ForeignTable {
    const KIND: VTabKind = VTabKind::Default;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn orders() -> TableDescriptor {
        TableDescriptor {
            connection_string: "host=x;db=y".to_string(),
            remote_table_name: "orders".to_string(),
            column_names: vec!["id".into(), "total".into(), "placed".into()],
            column_types: vec![FieldType::Int32, FieldType::Decimal, FieldType::DateTime],
            initial_row_count: 3,
        }
    }

    #[test]
    fn test_declared_schema() {
        assert_eq!(
            orders().declared_schema(),
            r#"CREATE TABLE a ("id" integer, "total" real, "placed" text)"#
        );
    }

    #[test]
    fn test_declared_schema_escapes_names() {
        let table = TableDescriptor {
            column_names: vec![r#"say "hi""#.into()],
            column_types: vec![FieldType::Other("uuid".into())],
            ..orders()
        };
        assert_eq!(table.declared_schema(), r#"CREATE TABLE a ("say ""hi""" text)"#);
    }

    #[test]
    fn test_quote_identifier() {
        assert_eq!(quote_identifier("orders"), r#""orders""#);
        assert_eq!(quote_identifier(r#"a"b"#), r#""a""b""#);
        assert_eq!(quote_identifier(""), r#""""#);
    }

    #[test]
    fn test_row_count_conversions() {
        assert_eq!(row_count(FieldValue::Int64(42)), 42);
        assert_eq!(row_count(FieldValue::Int32(7)), 7);
        assert_eq!(row_count(FieldValue::Decimal(12.0)), 12);
        assert_eq!(row_count(FieldValue::String(" 9 ".into())), 9);
        assert_eq!(row_count(FieldValue::Null), 0);
    }
}
