mod connection;
mod mssql;
mod mysql;
mod postgres;
mod pump;
mod value;

pub use connection::*;
pub use mssql::MssqlFactory;
pub use mysql::MysqlFactory;
pub use postgres::PostgresFactory;
pub use value::*;
