//! Database driver seam consumed by transaction contexts and the BucketFS scanner.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error reported by a database driver.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct DriverError {
    pub message: String,
}

impl DriverError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl From<rusqlite::Error> for DriverError {
    fn from(error: rusqlite::Error) -> Self {
        Self::new(error.to_string())
    }
}

/// Positional statement parameter or result cell.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SqlValue {
    Null,
    Bool(bool),
    Integer(i64),
    Real(f64),
    Text(String),
}

impl SqlValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Text(value) => Some(value),
            _ => None,
        }
    }
}

impl fmt::Display for SqlValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => f.write_str("NULL"),
            Self::Bool(value) => write!(f, "{value}"),
            Self::Integer(value) => write!(f, "{value}"),
            Self::Real(value) => write!(f, "{value}"),
            Self::Text(value) => f.write_str(value),
        }
    }
}

impl From<&str> for SqlValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for SqlValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<i64> for SqlValue {
    fn from(value: i64) -> Self {
        Self::Integer(value)
    }
}

/// Tabular result of a row-returning statement.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryResult {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<SqlValue>>,
}

/// One open connection to the target database.
///
/// Transaction control lives here and is only reachable from
/// [`crate::TransactionContext`]; guest code never sees a connection.
pub trait DatabaseConnection: Send {
    fn begin(&mut self) -> Result<(), DriverError>;
    fn execute(&mut self, statement: &str, params: &[SqlValue]) -> Result<u64, DriverError>;
    fn query(&mut self, statement: &str, params: &[SqlValue]) -> Result<QueryResult, DriverError>;
    fn commit(&mut self) -> Result<(), DriverError>;
    fn rollback(&mut self) -> Result<(), DriverError>;
    fn close(&mut self) -> Result<(), DriverError>;
}

/// Opens fresh connections to one target database.
pub trait DatabaseConnector: Send + Sync {
    fn connect(&self) -> Result<Box<dyn DatabaseConnection>, DriverError>;

    /// Human-readable target description used in logs.
    fn describe(&self) -> String {
        "database".to_string()
    }
}

/// Connector shared between an operation and the resources it opens lazily.
pub type SharedConnector = Arc<dyn DatabaseConnector>;
