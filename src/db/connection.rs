use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::runtime::Runtime;

use super::value::{BoundValue, FieldType, FieldValue};
use crate::config::{AdapterConfig, ModuleNames};

// Shared runtime used to drive the async drivers from SQLite's synchronous callbacks.
static RUNTIME: OnceLock<Runtime> = OnceLock::new();

/// The process-wide tokio runtime.
///
/// Protocol callbacks block on it, so they must not be invoked from inside
/// another tokio runtime.
pub fn runtime() -> Result<&'static Runtime> {
    if let Some(rt) = RUNTIME.get() {
        return Ok(rt);
    }
    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("remote-vtab")
        .build()
        .context("Failed to start the tokio runtime")?;
    Ok(RUNTIME.get_or_init(|| rt))
}

/// Backend families with an installed module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Postgres,
    Mssql,
    Mysql,
}

impl BackendKind {
    pub const ALL: [BackendKind; 3] = [BackendKind::Postgres, BackendKind::Mssql, BackendKind::Mysql];

    pub fn label(&self) -> &'static str {
        match self {
            BackendKind::Postgres => "PostgreSQL",
            BackendKind::Mssql => "SQL Server",
            BackendKind::Mysql => "MySQL",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.label())
    }
}

/// Name and native type of one result column.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldInfo {
    pub name: String,
    pub field_type: FieldType,
}

impl FieldInfo {
    pub fn new(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
        }
    }
}

/// A statement plus its named parameters, ready to run on a connection.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Command {
    pub text: String,
    pub parameters: Vec<(String, BoundValue)>,
}

impl Command {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            parameters: Vec::new(),
        }
    }

    pub fn bind(&mut self, name: impl Into<String>, value: BoundValue) {
        self.parameters.push((name.into(), value));
    }

    fn parameter(&self, name: &str) -> Option<&BoundValue> {
        self.parameters
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v)
    }

    /// Rewrite `@argN` placeholders into the backend's syntax and return the
    /// parameter values in the order the rewritten text expects them.
    pub fn prepare(&self, style: PlaceholderStyle) -> Result<(String, Vec<BoundValue>)> {
        self.prepare_with(style, |_| "")
    }

    /// Like [`Command::prepare`], appending `suffix(value)` after each
    /// placeholder, e.g. a type cast chosen from the bound value.
    pub fn prepare_with(
        &self,
        style: PlaceholderStyle,
        suffix: impl Fn(&BoundValue) -> &'static str,
    ) -> Result<(String, Vec<BoundValue>)> {
        let (text, order) = rewrite_placeholders_with(&self.text, style, |n| {
            self.parameter(&format!("@arg{n}")).map_or("", &suffix)
        });
        let values = order
            .iter()
            .map(|n| {
                let name = format!("@arg{n}");
                self.parameter(&name)
                    .cloned()
                    .ok_or_else(|| anyhow!("No value bound for {name}"))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok((text, values))
    }
}

/// Native placeholder syntax of a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaceholderStyle {
    /// `$1`, `$2`, ...
    Dollar,
    /// `@P1`, `@P2`, ...
    AtP,
    /// `?`, positional by occurrence
    Question,
}

/// Rewrite `@argN` markers outside quoted regions.
///
/// Returns the rewritten text and the placeholder numbers the backend will
/// consume, in parameter order: one entry per distinct number for numbered
/// styles, one per occurrence for `?`.
pub fn rewrite_placeholders(sql: &str, style: PlaceholderStyle) -> (String, Vec<usize>) {
    rewrite_placeholders_with(sql, style, |_| "")
}

fn rewrite_placeholders_with<'s>(
    sql: &str,
    style: PlaceholderStyle,
    suffix: impl Fn(usize) -> &'s str,
) -> (String, Vec<usize>) {
    const MARKER: &str = "@arg";

    let mut out = String::with_capacity(sql.len());
    let mut order: Vec<usize> = Vec::new();
    let mut quote: Option<char> = None;
    let mut rest = sql;

    while let Some(ch) = rest.chars().next() {
        if let Some(q) = quote {
            if ch == q {
                quote = None;
            }
            out.push(ch);
            rest = &rest[ch.len_utf8()..];
            continue;
        }
        if ch == '\'' || ch == '"' || ch == '`' {
            quote = Some(ch);
            out.push(ch);
            rest = &rest[1..];
            continue;
        }
        if let Some(after) = rest.strip_prefix(MARKER) {
            let digits = after.chars().take_while(|c| c.is_ascii_digit()).count();
            if let Ok(n) = after[..digits].parse::<usize>() {
                match style {
                    PlaceholderStyle::Dollar => out.push_str(&format!("${n}")),
                    PlaceholderStyle::AtP => out.push_str(&format!("@P{n}")),
                    PlaceholderStyle::Question => out.push('?'),
                }
                out.push_str(suffix(n));
                if style == PlaceholderStyle::Question || !order.contains(&n) {
                    order.push(n);
                }
                rest = &after[digits..];
                continue;
            }
        }
        out.push(ch);
        rest = &rest[ch.len_utf8()..];
    }

    if style != PlaceholderStyle::Question {
        order.sort_unstable();
    }
    (out, order)
}

/// Builds live connections for one backend family.
pub trait ConnectionFactory: Send + Sync {
    fn kind(&self) -> BackendKind;

    /// Open a new connection. Connections are never pooled.
    fn open(&self, connection_string: &str) -> Result<Box<dyn BackendConnection>>;
}

/// An open backend connection, owned by exactly one table operation or cursor.
pub trait BackendConnection: Send {
    fn create_command(&self, text: &str) -> Command {
        Command::new(text)
    }

    /// Run a command and return the first column of the first row.
    fn execute_scalar(&mut self, command: &Command) -> Result<FieldValue>;

    /// Run a command and stream its rows.
    fn execute_reader(&mut self, command: &Command) -> Result<Box<dyn RowReader>>;

    /// Ask the server to abandon the command currently in flight, if any.
    fn cancel(&mut self) -> Result<()>;
}

/// Forward-only stream over one command's result rows.
pub trait RowReader: Send {
    fn fields(&self) -> &[FieldInfo];

    fn field_count(&self) -> usize {
        self.fields().len()
    }

    fn name(&self, index: usize) -> Option<&str> {
        self.fields().get(index).map(|f| f.name.as_str())
    }

    fn field_type(&self, index: usize) -> Option<&FieldType> {
        self.fields().get(index).map(|f| &f.field_type)
    }

    /// Advance to the next row. Returns `false` once the stream is exhausted.
    fn read(&mut self) -> Result<bool>;

    /// Value of a field of the current row.
    fn value(&self, index: usize) -> Result<FieldValue>;

    fn is_null(&self, index: usize) -> Result<bool> {
        Ok(self.value(index)?.is_null())
    }
}

/// Connection factories for every installed backend, built once per process.
pub struct BackendRegistry {
    postgres: Arc<dyn ConnectionFactory>,
    mssql: Arc<dyn ConnectionFactory>,
    mysql: Arc<dyn ConnectionFactory>,
    modules: ModuleNames,
}

static REGISTRY: OnceLock<BackendRegistry> = OnceLock::new();

impl BackendRegistry {
    pub fn from_config(config: &AdapterConfig) -> Self {
        let timeout = Duration::from_secs(config.connect_timeout_secs);
        Self {
            postgres: Arc::new(super::postgres::PostgresFactory::new(
                timeout,
                config.postgres.clone(),
            )),
            mssql: Arc::new(super::mssql::MssqlFactory::new(timeout)),
            mysql: Arc::new(super::mysql::MysqlFactory::new(timeout)),
            modules: config.modules.clone(),
        }
    }

    /// The registry built from the on-disk configuration on first use.
    pub fn global() -> &'static BackendRegistry {
        REGISTRY.get_or_init(|| {
            let config = AdapterConfig::load().unwrap_or_else(|e| {
                tracing::warn!(error = %e, "Failed to load configuration, using defaults");
                AdapterConfig::default()
            });
            Self::from_config(&config)
        })
    }

    pub fn factory(&self, kind: BackendKind) -> Arc<dyn ConnectionFactory> {
        match kind {
            BackendKind::Postgres => Arc::clone(&self.postgres),
            BackendKind::Mssql => Arc::clone(&self.mssql),
            BackendKind::Mysql => Arc::clone(&self.mysql),
        }
    }

    /// SQLite module name the backend is installed under.
    pub fn module_name(&self, kind: BackendKind) -> &str {
        self.modules.name(kind)
    }
}
