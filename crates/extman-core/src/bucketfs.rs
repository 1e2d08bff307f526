//! BucketFS file discovery through a temporary, never-committed scan routine.
//!
//! The scanner deploys a schema and a Python scalar script inside its own
//! transaction, queries it, and rolls everything back on [`BucketFsScanner::close`].

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::driver::SqlValue;
use crate::error::{ControllerError, ControllerResult};
use crate::transaction::TransactionContext;

const LIST_FILES_SCRIPT: &str = include_str!("bucketfs/list_files_udf.py");
const MAX_EXACT_REAL: f64 = 9_007_199_254_740_992.0;

static NEXT_SCHEMA_SEQUENCE: AtomicU64 = AtomicU64::new(0);

/// A file stored in BucketFS.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BfsFile {
    /// Absolute path, starting with the configured base path.
    pub path: String,
    pub name: String,
    pub size: u64,
}

/// Lists and resolves BucketFS files below a base path.
#[derive(Debug)]
pub struct BucketFsScanner {
    base_path: String,
    schema_name: String,
    script_name: String,
    transaction: TransactionContext,
}

impl BucketFsScanner {
    /// Deploys the scan routine inside `transaction`, which the scanner then owns.
    pub fn create(base_path: &str, transaction: TransactionContext) -> ControllerResult<Self> {
        let schema_name = next_schema_name();
        let script_name = format!("\"{schema_name}\".\"LIST_RECURSIVELY\"");
        let deployed = if base_path.is_empty() {
            Err(ControllerError::invalid_argument("BucketFS base path is empty"))
        } else {
            deploy_scan_routine(&transaction, &schema_name, &script_name)
        };
        if let Err(error) = deployed {
            return Err(match transaction.rollback() {
                Ok(()) => error,
                Err(cleanup) => error.with_cleanup_failure(cleanup),
            });
        }
        tracing::debug!(
            transaction = transaction.id(),
            schema = %schema_name,
            base_path,
            "deployed BucketFS scan routine"
        );
        Ok(Self {
            base_path: base_path.to_string(),
            schema_name,
            script_name,
            transaction,
        })
    }

    pub fn schema_name(&self) -> &str {
        &self.schema_name
    }

    /// Lists every file below the base path, ordered by full path.
    pub fn list_files(&self) -> ControllerResult<Vec<BfsFile>> {
        let statement = format!("SELECT {}(?) ORDER BY FULL_PATH", self.script_name);
        let result = self
            .transaction
            .query(&statement, &[SqlValue::from(self.base_path.as_str())])?;
        result.rows.iter().map(|row| parse_file_row(row)).collect()
    }

    /// Returns the absolute path of the first file named `file_name`, ordered by path.
    pub fn find_absolute_path(&self, file_name: &str) -> ControllerResult<String> {
        let statement = format!(
            "SELECT FULL_PATH FROM (SELECT {}(?)) WHERE FILE_NAME = ? ORDER BY FULL_PATH LIMIT 1",
            self.script_name
        );
        let result = self.transaction.query(
            &statement,
            &[
                SqlValue::from(self.base_path.as_str()),
                SqlValue::from(file_name),
            ],
        )?;
        let Some(row) = result.rows.first() else {
            return Err(ControllerError::FileNotFound {
                file_name: file_name.to_string(),
            });
        };
        text_cell(row, 0, "FULL_PATH").map(str::to_string)
    }

    /// Rolls back the scan transaction, removing the routine. Fails with
    /// `TransactionClosed` when called twice.
    pub fn close(&mut self) -> ControllerResult<()> {
        self.transaction.rollback()
    }
}

fn next_schema_name() -> String {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis())
        .unwrap_or_default();
    let sequence = NEXT_SCHEMA_SEQUENCE.fetch_add(1, Ordering::Relaxed);
    format!("INTERNAL_{millis}_{sequence}")
}

fn deploy_scan_routine(
    transaction: &TransactionContext,
    schema_name: &str,
    script_name: &str,
) -> ControllerResult<()> {
    transaction.run_query(&format!("CREATE SCHEMA {schema_name}"), &[])?;
    let script = format!(
        "CREATE OR REPLACE PYTHON3 SCALAR SCRIPT {script_name} (\"path\" VARCHAR(100)) \
         EMITS (\"FILE_NAME\" VARCHAR(250), \"FULL_PATH\" VARCHAR(500), \"SIZE\" DECIMAL(18,0)) AS\n\
         {LIST_FILES_SCRIPT}\n/"
    );
    transaction.run_query(&script, &[])?;
    Ok(())
}

fn parse_file_row(row: &[SqlValue]) -> ControllerResult<BfsFile> {
    let name = text_cell(row, 0, "FILE_NAME")?;
    let path = text_cell(row, 1, "FULL_PATH")?;
    let size = row.get(2).ok_or_else(|| ControllerError::InvalidScanRow {
        message: "missing SIZE column".to_string(),
    })?;
    Ok(BfsFile {
        path: path.to_string(),
        name: name.to_string(),
        size: decimal_to_u64(size)?,
    })
}

fn text_cell<'a>(row: &'a [SqlValue], index: usize, column: &str) -> ControllerResult<&'a str> {
    row.get(index)
        .and_then(SqlValue::as_str)
        .ok_or_else(|| ControllerError::InvalidScanRow {
            message: format!("expected text in column {column}, got {:?}", row.get(index)),
        })
}

/// Converts a `DECIMAL(18,0)` cell to a byte count without losing precision.
fn decimal_to_u64(value: &SqlValue) -> ControllerResult<u64> {
    let invalid = || ControllerError::InvalidScanRow {
        message: format!("file size {value} is not a non-negative whole number"),
    };
    match value {
        SqlValue::Integer(size) => u64::try_from(*size).map_err(|_| invalid()),
        SqlValue::Real(size) => {
            if size.is_finite() && *size >= 0.0 && size.fract() == 0.0 && *size <= MAX_EXACT_REAL
            {
                Ok(*size as u64)
            } else {
                Err(invalid())
            }
        }
        SqlValue::Text(text) => {
            let text = text.trim();
            let (whole, fraction) = text.split_once('.').unwrap_or((text, ""));
            if whole.is_empty()
                || !whole.bytes().all(|byte| byte.is_ascii_digit())
                || !fraction.bytes().all(|byte| byte == b'0')
            {
                return Err(invalid());
            }
            whole.parse::<u64>().map_err(|_| invalid())
        }
        SqlValue::Null | SqlValue::Bool(_) => Err(invalid()),
    }
}
