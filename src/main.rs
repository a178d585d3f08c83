use anyhow::{Context, Result};
use clap::Parser;
use remote_vtab::config::AdapterConfig;
use remote_vtab::db::BackendRegistry;
use remote_vtab::vtab::quote_identifier;
use rusqlite::types::ValueRef;
use rusqlite::Connection;
use std::path::PathBuf;

/// Query remote PostgreSQL, SQL Server and MySQL tables through SQLite
#[derive(Parser)]
#[command(version, about)]
struct Cli {
    /// Configuration file to use instead of the default location
    #[arg(long)]
    config: Option<PathBuf>,

    /// Attach a saved connection by name
    #[arg(long = "connect")]
    connect: Option<String>,

    /// Local name for the attached table (defaults to the remote table name)
    #[arg(long = "as", requires = "connect")]
    alias: Option<String>,

    /// SQL statements to run, in order
    statements: Vec<String>,
}

fn main() -> Result<()> {
    // Rows go to stdout, so logs go to stderr
    tracing_subscriber::fmt().with_writer(std::io::stderr).init();

    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => AdapterConfig::load_from(path)?,
        None => AdapterConfig::load()?,
    };
    let registry = BackendRegistry::from_config(&config);

    let conn = Connection::open_in_memory()?;
    remote_vtab::register_modules_with(&conn, &registry)?;

    if let Some(ref name) = cli.connect {
        let Some(saved) = config.find_connection(name) else {
            eprintln!("Error: no saved connection named {:?}", name);
            eprintln!("Saved connections:");
            for c in &config.connections {
                eprintln!("  - {}", c.name);
            }
            std::process::exit(1);
        };
        let alias = cli.alias.as_deref().unwrap_or(&saved.table);
        let attach = format!(
            "CREATE VIRTUAL TABLE {} USING {} ({}, {})",
            quote_identifier(alias),
            registry.module_name(saved.backend),
            sql_literal(&saved.connection_string),
            sql_literal(&saved.table),
        );
        conn.execute_batch(&attach)
            .with_context(|| format!("Failed to attach saved connection {:?}", saved.name))?;
    }

    for statement in &cli.statements {
        run_statement(&conn, statement)?;
    }
    Ok(())
}

fn sql_literal(text: &str) -> String {
    format!("'{}'", text.replace('\'', "''"))
}

/// Run one statement, printing any result rows tab-separated with a header.
fn run_statement(conn: &Connection, sql: &str) -> Result<()> {
    let mut stmt = conn
        .prepare(sql)
        .with_context(|| format!("Failed to prepare: {sql}"))?;
    let column_count = stmt.column_count();
    if column_count == 0 {
        stmt.execute([])?;
        return Ok(());
    }

    let header: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();
    println!("{}", header.join("\t"));

    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let cells = (0..column_count)
            .map(|i| row.get_ref(i).map(render))
            .collect::<rusqlite::Result<Vec<_>>>()?;
        println!("{}", cells.join("\t"));
    }
    Ok(())
}

fn render(value: ValueRef<'_>) -> String {
    match value {
        ValueRef::Null => "NULL".to_string(),
        ValueRef::Integer(i) => i.to_string(),
        ValueRef::Real(f) => f.to_string(),
        ValueRef::Text(t) => String::from_utf8_lossy(t).into_owned(),
        ValueRef::Blob(b) => format!("<{} bytes>", b.len()),
    }
}
