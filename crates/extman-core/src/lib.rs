//! Transaction-scoped SQL execution primitives for the extension manager.
//!
//! Provides the error taxonomy, the database driver seam (with a SQLite
//! driver), the guarded SQL handle handed to guest code, per-operation
//! transaction contexts, the BucketFS scanner, and the parameter validator.

pub mod bucketfs;
pub mod driver;
pub mod error;
pub mod guard;
pub mod operation;
pub mod parameters;
pub mod sqlite;
#[cfg(any(test, feature = "test-support"))]
pub mod testing;
pub mod transaction;

pub use bucketfs::{BfsFile, BucketFsScanner};
pub use driver::{
    DatabaseConnection, DatabaseConnector, DriverError, QueryResult, SharedConnector, SqlValue,
};
pub use error::{ControllerError, ControllerResult, ErrorKind, GuestFailure, ParameterViolation};
pub use guard::{check_statement, normalize_statement, FORBIDDEN_COMMANDS};
pub use operation::{CancellationToken, OperationContext};
pub use parameters::{validate_parameters, ParameterDefinition, ParameterValue};
pub use sqlite::SqliteConnector;
pub use transaction::{run_in_transaction, SqlClient, TransactionContext, TransactionState};
