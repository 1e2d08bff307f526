//! Capability surface handed to guest code for one operation.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use extman_core::{
    BfsFile, BucketFsScanner, ControllerResult, OperationContext, SharedConnector, SqlClient,
    TransactionContext,
};

/// Guarded SQL handle plus BucketFS access for one controller operation.
#[derive(Clone)]
pub struct ExtensionContext {
    sql: SqlClient,
    bucketfs: BucketFsAccess,
}

impl fmt::Debug for ExtensionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExtensionContext")
            .field("sql", &self.sql)
            .finish_non_exhaustive()
    }
}

impl ExtensionContext {
    pub fn new(sql: SqlClient, bucketfs: BucketFsAccess) -> Self {
        Self { sql, bucketfs }
    }

    pub fn sql(&self) -> &SqlClient {
        &self.sql
    }

    pub fn bucketfs(&self) -> &BucketFsAccess {
        &self.bucketfs
    }
}

struct BucketFsState {
    base_path: String,
    connector: SharedConnector,
    operation: OperationContext,
    scanner: Option<BucketFsScanner>,
}

impl BucketFsState {
    fn scanner(&mut self) -> ControllerResult<&BucketFsScanner> {
        let scanner = match self.scanner.take() {
            Some(scanner) => scanner,
            None => {
                let transaction =
                    TransactionContext::begin(self.connector.as_ref(), &self.operation)?;
                BucketFsScanner::create(&self.base_path, transaction)?
            }
        };
        Ok(&*self.scanner.insert(scanner))
    }
}

/// Lazily created BucketFS scanner, running on its own connection and transaction.
///
/// The scan routine is only deployed when a guest first asks for files.
/// [`BucketFsAccess::close`] must be called before the operation transaction
/// reaches its terminal state.
#[derive(Clone)]
pub struct BucketFsAccess {
    state: Arc<Mutex<BucketFsState>>,
}

impl BucketFsAccess {
    pub fn new(
        base_path: impl Into<String>,
        connector: SharedConnector,
        operation: OperationContext,
    ) -> Self {
        Self {
            state: Arc::new(Mutex::new(BucketFsState {
                base_path: base_path.into(),
                connector,
                operation,
                scanner: None,
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BucketFsState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn list_files(&self) -> ControllerResult<Vec<BfsFile>> {
        self.lock().scanner()?.list_files()
    }

    pub fn find_absolute_path(&self, file_name: &str) -> ControllerResult<String> {
        self.lock().scanner()?.find_absolute_path(file_name)
    }

    /// True once a guest has triggered deployment of the scan routine.
    pub fn is_open(&self) -> bool {
        self.lock().scanner.is_some()
    }

    /// Removes the scan routine, if one was deployed. Idempotent.
    pub fn close(&self) -> ControllerResult<()> {
        match self.lock().scanner.take() {
            Some(mut scanner) => scanner.close(),
            None => Ok(()),
        }
    }
}
