//! SQLite virtual tables backed by tables in PostgreSQL, SQL Server and MySQL.
//!
//! ```no_run
//! let conn = rusqlite::Connection::open_in_memory()?;
//! remote_vtab::register_modules(&conn)?;
//! conn.execute_batch(
//!     "CREATE VIRTUAL TABLE orders USING pgsql ('host=db user=report', 'orders');",
//! )?;
//! # Ok::<(), rusqlite::Error>(())
//! ```

pub mod config;
pub mod db;
pub mod error;
pub mod vtab;

pub use error::{AdapterError, AdapterResult};
pub use vtab::register_module;

use db::{BackendKind, BackendRegistry};

/// Install the `pgsql`, `mssql` and `mysql` modules on `conn`, using the
/// process-wide registry.
pub fn register_modules(conn: &rusqlite::Connection) -> rusqlite::Result<()> {
    register_modules_with(conn, BackendRegistry::global())
}

/// Install one module per backend from `registry`.
pub fn register_modules_with(
    conn: &rusqlite::Connection,
    registry: &BackendRegistry,
) -> rusqlite::Result<()> {
    for kind in BackendKind::ALL {
        register_module(conn, registry.module_name(kind), registry.factory(kind))?;
    }
    Ok(())
}
