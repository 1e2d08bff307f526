//! SQLite-backed database driver.

use std::path::{Path, PathBuf};
use std::time::Duration;

use rusqlite::hooks::{AuthAction, AuthContext, Authorization};
use rusqlite::types::{Value, ValueRef};
use rusqlite::{params_from_iter, Batch, Connection, ErrorCode, Statement};

use crate::driver::{DatabaseConnection, DatabaseConnector, DriverError, QueryResult, SqlValue};

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

type Authorizer = fn(AuthContext<'_>) -> Authorization;

/// Opens one SQLite connection per transaction against a database file.
///
/// Statements passed to `execute`/`query` must be a single statement and may
/// not issue `BEGIN`, `END`, `COMMIT`, `ROLLBACK`, `SAVEPOINT` or `RELEASE`;
/// transaction control stays with the connection's own `begin`/`commit`/
/// `rollback`.
#[derive(Debug, Clone)]
pub struct SqliteConnector {
    path: PathBuf,
}

impl SqliteConnector {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }
}

impl DatabaseConnector for SqliteConnector {
    fn connect(&self) -> Result<Box<dyn DatabaseConnection>, DriverError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|error| {
                    DriverError::new(format!(
                        "failed to create database directory {}: {error}",
                        parent.display()
                    ))
                })?;
            }
        }
        let connection = Connection::open(&self.path)?;
        connection.busy_timeout(BUSY_TIMEOUT)?;
        connection.execute_batch(
            r#"
            PRAGMA journal_mode = WAL;
            PRAGMA foreign_keys = ON;
            "#,
        )?;
        Ok(Box::new(SqliteConnection {
            connection: Some(connection),
        }))
    }

    fn describe(&self) -> String {
        format!("sqlite:{}", self.path.display())
    }
}

struct SqliteConnection {
    connection: Option<Connection>,
}

impl SqliteConnection {
    fn connection(&self) -> Result<&Connection, DriverError> {
        self.connection
            .as_ref()
            .ok_or_else(|| DriverError::new("connection is closed"))
    }
}

fn deny_transaction_control(context: AuthContext<'_>) -> Authorization {
    match context.action {
        AuthAction::Transaction { .. } | AuthAction::Savepoint { .. } => Authorization::Deny,
        _ => Authorization::Allow,
    }
}

/// Prepares exactly one statement with transaction control denied.
fn prepare_single<'conn>(
    connection: &'conn Connection,
    statement: &str,
) -> Result<Statement<'conn>, DriverError> {
    connection.authorizer(Some(deny_transaction_control as Authorizer));
    let prepared = prepare_first(connection, statement);
    connection.authorizer(None::<Authorizer>);
    prepared
}

fn prepare_first<'conn>(
    connection: &'conn Connection,
    statement: &str,
) -> Result<Statement<'conn>, DriverError> {
    let mut batch = Batch::new(connection, statement);
    let first = batch
        .next()
        .map_err(|error| denied_or(error, statement))?
        .ok_or_else(|| DriverError::new("statement is empty"))?;
    match batch.next() {
        Ok(None) => Ok(first),
        _ => Err(DriverError::new(format!(
            "only one SQL statement may be executed per call: {statement}"
        ))),
    }
}

fn denied_or(error: rusqlite::Error, statement: &str) -> DriverError {
    if error.sqlite_error_code() == Some(ErrorCode::AuthorizationForStatementDenied) {
        DriverError::new(format!(
            "transaction control is not allowed inside an operation: {statement}"
        ))
    } else {
        error.into()
    }
}

fn to_sqlite_value(value: &SqlValue) -> Value {
    match value {
        SqlValue::Null => Value::Null,
        SqlValue::Bool(value) => Value::Integer(i64::from(*value)),
        SqlValue::Integer(value) => Value::Integer(*value),
        SqlValue::Real(value) => Value::Real(*value),
        SqlValue::Text(value) => Value::Text(value.clone()),
    }
}

fn from_sqlite_value(value: ValueRef<'_>) -> SqlValue {
    match value {
        ValueRef::Null => SqlValue::Null,
        ValueRef::Integer(value) => SqlValue::Integer(value),
        ValueRef::Real(value) => SqlValue::Real(value),
        ValueRef::Text(bytes) | ValueRef::Blob(bytes) => {
            SqlValue::Text(String::from_utf8_lossy(bytes).into_owned())
        }
    }
}

impl DatabaseConnection for SqliteConnection {
    fn begin(&mut self) -> Result<(), DriverError> {
        self.connection()?.execute_batch("BEGIN")?;
        Ok(())
    }

    fn execute(&mut self, statement: &str, params: &[SqlValue]) -> Result<u64, DriverError> {
        let connection = self.connection()?;
        let mut prepared = prepare_single(connection, statement)?;
        let affected = prepared.execute(params_from_iter(params.iter().map(to_sqlite_value)))?;
        Ok(affected as u64)
    }

    fn query(&mut self, statement: &str, params: &[SqlValue]) -> Result<QueryResult, DriverError> {
        let connection = self.connection()?;
        let mut prepared = prepare_single(connection, statement)?;
        let columns = prepared
            .column_names()
            .into_iter()
            .map(str::to_string)
            .collect::<Vec<_>>();
        let width = columns.len();
        let mut rows = prepared.query(params_from_iter(params.iter().map(to_sqlite_value)))?;
        let mut collected = Vec::new();
        while let Some(row) = rows.next()? {
            let mut cells = Vec::with_capacity(width);
            for index in 0..width {
                cells.push(from_sqlite_value(row.get_ref(index)?));
            }
            collected.push(cells);
        }
        Ok(QueryResult {
            columns,
            rows: collected,
        })
    }

    fn commit(&mut self) -> Result<(), DriverError> {
        self.connection()?.execute_batch("COMMIT")?;
        Ok(())
    }

    fn rollback(&mut self) -> Result<(), DriverError> {
        self.connection()?.execute_batch("ROLLBACK")?;
        Ok(())
    }

    fn close(&mut self) -> Result<(), DriverError> {
        match self.connection.take() {
            Some(connection) => connection.close().map_err(|(_, error)| error.into()),
            None => Ok(()),
        }
    }
}
