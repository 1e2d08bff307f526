//! Database coordinates carried in request query parameters.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use extman_core::{ControllerResult, SharedConnector, SqliteConnector};
use thiserror::Error;

pub const DB_HOST_PARAMETER: &str = "dbHost";
pub const DB_PORT_PARAMETER: &str = "dbPort";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConnectionParamsError {
    #[error("missing parameter {0}")]
    Missing(&'static str),
    #[error("invalid value '{value}' for parameter {parameter}")]
    Invalid {
        parameter: &'static str,
        value: String,
    },
}

/// Target database named by the `dbHost` / `dbPort` query parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DbConnectionParams {
    pub host: String,
    pub port: u16,
}

impl DbConnectionParams {
    pub fn from_query(query: &HashMap<String, String>) -> Result<Self, ConnectionParamsError> {
        let host = query
            .get(DB_HOST_PARAMETER)
            .map(|value| value.trim())
            .filter(|value| !value.is_empty())
            .ok_or(ConnectionParamsError::Missing(DB_HOST_PARAMETER))?;
        let raw_port = query
            .get(DB_PORT_PARAMETER)
            .ok_or(ConnectionParamsError::Missing(DB_PORT_PARAMETER))?;
        let port = raw_port
            .trim()
            .parse::<u16>()
            .ok()
            .filter(|port| *port > 0)
            .ok_or_else(|| ConnectionParamsError::Invalid {
                parameter: DB_PORT_PARAMETER,
                value: raw_port.clone(),
            })?;
        Ok(Self {
            host: host.to_string(),
            port,
        })
    }
}

/// Produces a connector for the database a request targets.
pub trait ConnectorProvider: Send + Sync {
    fn connector(&self, params: &DbConnectionParams) -> ControllerResult<SharedConnector>;
}

/// Maps every `host:port` pair onto one SQLite file below a directory.
#[derive(Debug, Clone)]
pub struct SqliteConnectorProvider {
    database_dir: PathBuf,
}

impl SqliteConnectorProvider {
    pub fn new(database_dir: impl AsRef<Path>) -> Self {
        Self {
            database_dir: database_dir.as_ref().to_path_buf(),
        }
    }

    pub fn database_path(&self, params: &DbConnectionParams) -> PathBuf {
        let host = params
            .host
            .chars()
            .map(|ch| {
                if ch.is_ascii_alphanumeric() || ch == '.' || ch == '-' {
                    ch
                } else {
                    '_'
                }
            })
            .collect::<String>();
        self.database_dir
            .join(format!("{host}_{}.sqlite", params.port))
    }
}

impl ConnectorProvider for SqliteConnectorProvider {
    fn connector(&self, params: &DbConnectionParams) -> ControllerResult<SharedConnector> {
        Ok(Arc::new(SqliteConnector::new(self.database_path(params))))
    }
}

#[cfg(test)]
mod tests {
    use super::{ConnectionParamsError, DbConnectionParams, SqliteConnectorProvider};
    use std::collections::HashMap;

    fn query(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect()
    }

    #[test]
    fn unit_connection_params_require_host_and_valid_port() {
        assert_eq!(
            DbConnectionParams::from_query(&query(&[("dbPort", "8563")])),
            Err(ConnectionParamsError::Missing("dbHost"))
        );
        let error = DbConnectionParams::from_query(&query(&[("dbHost", "db"), ("dbPort", "abc")]))
            .expect_err("invalid port");
        assert_eq!(error.to_string(), "invalid value 'abc' for parameter dbPort");
        let error = DbConnectionParams::from_query(&query(&[("dbHost", "db")]))
            .expect_err("missing port");
        assert_eq!(error.to_string(), "missing parameter dbPort");

        let params = DbConnectionParams::from_query(&query(&[("dbHost", "db"), ("dbPort", "8563")]))
            .expect("params");
        assert_eq!(params.host, "db");
        assert_eq!(params.port, 8563);
    }

    #[test]
    fn unit_sqlite_provider_sanitizes_host_into_file_name() {
        let provider = SqliteConnectorProvider::new("/var/lib/extman");
        let path = provider.database_path(&DbConnectionParams {
            host: "../db/host".to_string(),
            port: 8563,
        });
        assert_eq!(
            path,
            std::path::Path::new("/var/lib/extman").join(".._db_host_8563.sqlite")
        );
    }
}
