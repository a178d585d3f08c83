use thiserror::Error;

/// Errors surfaced by the virtual-table modules.
#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("Syntax: CREATE VIRTUAL TABLE <name> USING {module} ('<connection string>', '<table name>');")]
    Arguments { module: String },

    #[error("create: {0:#}")]
    Create(anyhow::Error),

    #[error("Connection error: {0:#}")]
    Connect(anyhow::Error),

    #[error("Query error: {0:#}")]
    Query(anyhow::Error),

    #[error("Data type not supported: {0}")]
    UnsupportedArgument(&'static str),

    #[error("Column {index} could not be read: {source:#}")]
    Column { index: i32, source: anyhow::Error },

    #[error("No current row: the cursor is at end of data")]
    Eof,

    #[error("Missing scan plan for filter")]
    MissingPlan,
}

pub type AdapterResult<T> = Result<T, AdapterError>;

impl From<AdapterError> for rusqlite::Error {
    fn from(err: AdapterError) -> Self {
        rusqlite::Error::ModuleError(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_argument_error_message() {
        let err = AdapterError::Arguments {
            module: "pgsql".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Syntax: CREATE VIRTUAL TABLE <name> USING pgsql ('<connection string>', '<table name>');"
        );
    }

    #[test]
    fn test_create_error_includes_context_chain() {
        let inner = anyhow::anyhow!("relation \"orders\" does not exist").context("schema discovery");
        let err = AdapterError::Create(inner);
        let msg = err.to_string();
        assert!(msg.starts_with("create: schema discovery"));
        assert!(msg.contains("does not exist"));
    }

    #[test]
    fn test_into_rusqlite_error() {
        let err: rusqlite::Error = AdapterError::Eof.into();
        match err {
            rusqlite::Error::ModuleError(msg) => assert!(msg.contains("end of data")),
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
