//! SQLite virtual-table modules over remote tables.
//!
//! Each module is attached with
//! `CREATE VIRTUAL TABLE <name> USING <module> ('<connection string>', '<table name>')`
//! and serves read-only scans, pushing supported predicates and orderings
//! down to the backend.

pub mod cursor;
pub mod plan;
pub mod table;

use rusqlite::vtab::read_only_module;
use rusqlite::Connection;
use std::sync::Arc;

use crate::db::ConnectionFactory;
use crate::error::{AdapterError, AdapterResult};

pub use cursor::ForeignCursor;
pub use plan::{compile, ConstraintOp, ConstraintSpec, OrderTerm, ScanPlan, ScanRequest};
pub use table::{quote_identifier, ForeignTable, TableDescriptor};

/// Install one module backed by `factory`.
pub fn register_module(
    conn: &Connection,
    name: &str,
    factory: Arc<dyn ConnectionFactory>,
) -> rusqlite::Result<()> {
    conn.create_module(name, read_only_module::<ForeignTable>(), Some(factory))?;
    tracing::debug!(module = name, "Registered virtual table module");
    Ok(())
}

/// Strip surrounding whitespace and one layer of single quotes.
fn trim_argument(raw: &[u8]) -> String {
    let text = String::from_utf8_lossy(raw);
    let text = text.trim();
    let text = text.strip_prefix('\'').unwrap_or(text);
    let text = text.strip_suffix('\'').unwrap_or(text);
    text.to_string()
}

/// Split module arguments into `(module, connection string, table name)`.
///
/// SQLite passes the module, database and table names ahead of the two
/// arguments written in the `USING` clause.
pub(crate) fn parse_arguments(args: &[&[u8]]) -> AdapterResult<(String, String, String)> {
    let module = args
        .first()
        .map(|m| String::from_utf8_lossy(m).into_owned())
        .unwrap_or_default();
    match args {
        [_, _, _, connection_string, table_name] => Ok((
            module,
            trim_argument(connection_string),
            trim_argument(table_name),
        )),
        _ => Err(AdapterError::Arguments { module }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_arguments() {
        let args: [&[u8]; 5] = [b"pgsql", b"main", b"o", b"'host=x;db=y'", b" 'orders'"];
        let (module, conn, table) = parse_arguments(&args).unwrap();
        assert_eq!(module, "pgsql");
        assert_eq!(conn, "host=x;db=y");
        assert_eq!(table, "orders");
    }

    #[test]
    fn test_parse_arguments_unquoted() {
        let args: [&[u8]; 5] = [b"mysql", b"main", b"o", b"mysql://u@h/db", b"orders"];
        let (_, conn, table) = parse_arguments(&args).unwrap();
        assert_eq!(conn, "mysql://u@h/db");
        assert_eq!(table, "orders");
    }

    #[test]
    fn test_only_one_quote_layer_is_removed() {
        assert_eq!(trim_argument(b"''quoted''"), "'quoted'");
        assert_eq!(trim_argument(b"'"), "");
    }

    #[test]
    fn test_wrong_argument_count() {
        let args: [&[u8]; 4] = [b"mssql", b"main", b"o", b"'server=x'"];
        let err = parse_arguments(&args).unwrap_err();
        assert_eq!(
            err.to_string(),
            "Syntax: CREATE VIRTUAL TABLE <name> USING mssql ('<connection string>', '<table name>');"
        );

        let args: [&[u8]; 6] = [b"pgsql", b"main", b"o", b"a", b"b", b"c"];
        assert!(matches!(
            parse_arguments(&args),
            Err(AdapterError::Arguments { .. })
        ));
    }
}
