//! Per-operation transaction ownership and the guarded SQL handle.
//!
//! A [`TransactionContext`] owns exactly one connection with one open
//! transaction. Guest code only ever receives a [`SqlClient`], which runs the
//! statement guard before touching the connection and cannot reach
//! commit/rollback. The context reaches exactly one terminal state; dropping
//! an open context rolls it back.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::driver::{DatabaseConnection, DatabaseConnector, DriverError, QueryResult, SqlValue};
use crate::error::{ControllerError, ControllerResult};
use crate::guard::check_statement;
use crate::operation::OperationContext;

static NEXT_TRANSACTION_ID: AtomicU64 = AtomicU64::new(1);

/// Lifecycle state of a [`TransactionContext`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Open,
    Committed,
    RolledBack,
}

impl fmt::Display for TransactionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Open => "open",
            Self::Committed => "committed",
            Self::RolledBack => "rolled back",
        })
    }
}

#[derive(Debug, Clone, Copy)]
enum TerminalAction {
    Commit,
    Rollback,
}

impl TerminalAction {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Commit => "commit",
            Self::Rollback => "rollback",
        }
    }

    fn state(&self) -> TransactionState {
        match self {
            Self::Commit => TransactionState::Committed,
            Self::Rollback => TransactionState::RolledBack,
        }
    }
}

struct TransactionInner {
    id: u64,
    connection: Option<Box<dyn DatabaseConnection>>,
    state: TransactionState,
    operation: OperationContext,
    violation: Option<ControllerError>,
}

impl TransactionInner {
    fn ensure_open(&self) -> ControllerResult<()> {
        match self.state {
            TransactionState::Open => Ok(()),
            state => Err(ControllerError::TransactionClosed { state }),
        }
    }

    fn record_violation(&mut self, error: &ControllerError) {
        if self.violation.is_none() {
            self.violation = Some(error.clone());
        }
    }
}

fn lock(inner: &Mutex<TransactionInner>) -> MutexGuard<'_, TransactionInner> {
    inner.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Owner of one open database transaction for one controller operation.
pub struct TransactionContext {
    id: u64,
    inner: Arc<Mutex<TransactionInner>>,
}

impl fmt::Debug for TransactionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransactionContext")
            .field("id", &self.id)
            .field("state", &self.state())
            .finish()
    }
}

impl TransactionContext {
    /// Opens a fresh connection from `connector` and begins a transaction on it.
    pub fn begin(
        connector: &dyn DatabaseConnector,
        operation: &OperationContext,
    ) -> ControllerResult<Self> {
        operation.check()?;
        let mut connection = connector
            .connect()
            .map_err(|source| ControllerError::Database {
                action: "open",
                source,
            })?;
        if let Err(source) = connection.begin() {
            let error = ControllerError::Database {
                action: "begin",
                source,
            };
            return Err(match connection.close() {
                Ok(()) => error,
                Err(source) => error.with_cleanup_failure(ControllerError::Database {
                    action: "close",
                    source,
                }),
            });
        }
        let id = NEXT_TRANSACTION_ID.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(
            transaction = id,
            database = %connector.describe(),
            "began transaction"
        );
        Ok(Self {
            id,
            inner: Arc::new(Mutex::new(TransactionInner {
                id,
                connection: Some(connection),
                state: TransactionState::Open,
                operation: operation.clone(),
                violation: None,
            })),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn state(&self) -> TransactionState {
        lock(&self.inner).state
    }

    /// Guarded statement handle bound to this transaction.
    pub fn sql_client(&self) -> SqlClient {
        SqlClient {
            inner: Arc::clone(&self.inner),
        }
    }

    pub fn run_query(&self, statement: &str, params: &[SqlValue]) -> ControllerResult<u64> {
        self.sql_client().run_query(statement, params)
    }

    pub fn query(&self, statement: &str, params: &[SqlValue]) -> ControllerResult<QueryResult> {
        self.sql_client().query(statement, params)
    }

    /// Removes and returns the first guard violation recorded by any handle.
    pub fn take_violation(&self) -> Option<ControllerError> {
        lock(&self.inner).violation.take()
    }

    pub fn commit(&self) -> ControllerResult<()> {
        self.finish(TerminalAction::Commit)
    }

    pub fn rollback(&self) -> ControllerResult<()> {
        self.finish(TerminalAction::Rollback)
    }

    fn finish(&self, action: TerminalAction) -> ControllerResult<()> {
        let mut inner = lock(&self.inner);
        inner.ensure_open()?;
        inner.state = action.state();
        let Some(mut connection) = inner.connection.take() else {
            return Err(ControllerError::TransactionClosed { state: inner.state });
        };
        drop(inner);

        let outcome = match action {
            TerminalAction::Commit => connection.commit(),
            TerminalAction::Rollback => connection.rollback(),
        }
        .map_err(|source| ControllerError::Database {
            action: action.as_str(),
            source,
        });
        if outcome.is_err() {
            // the connection is closed below without having committed anything
            lock(&self.inner).state = TransactionState::RolledBack;
        }
        let closed = connection.close();
        tracing::debug!(
            transaction = self.id,
            action = action.as_str(),
            succeeded = outcome.is_ok(),
            "finished transaction"
        );
        match (outcome, closed) {
            (Ok(()), Ok(())) => Ok(()),
            (Ok(()), Err(error)) => {
                tracing::warn!(
                    transaction = self.id,
                    error = %error,
                    "failed to close connection after {}",
                    action.as_str()
                );
                Ok(())
            }
            (Err(error), Ok(())) => Err(error),
            (Err(error), Err(source)) => {
                Err(error.with_cleanup_failure(ControllerError::Database {
                    action: "close",
                    source,
                }))
            }
        }
    }
}

impl Drop for TransactionContext {
    fn drop(&mut self) {
        if self.state() != TransactionState::Open {
            return;
        }
        tracing::warn!(
            transaction = self.id,
            "rolling back transaction released without a terminal action"
        );
        if let Err(error) = self.rollback() {
            tracing::warn!(
                transaction = self.id,
                error = %error,
                "rollback of released transaction failed"
            );
        }
    }
}

/// Restricted statement execution capability handed to guest code.
///
/// Cloning is cheap; every clone targets the same transaction and shares its
/// closed/violation state.
#[derive(Clone)]
pub struct SqlClient {
    inner: Arc<Mutex<TransactionInner>>,
}

impl fmt::Debug for SqlClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = lock(&self.inner);
        f.debug_struct("SqlClient")
            .field("transaction", &inner.id)
            .field("state", &inner.state)
            .finish()
    }
}

impl SqlClient {
    /// Executes a statement and returns the number of affected rows.
    pub fn run_query(&self, statement: &str, params: &[SqlValue]) -> ControllerResult<u64> {
        self.with_connection(statement, |connection| {
            connection.execute(statement, params)
        })
    }

    /// Executes a row-returning statement.
    pub fn query(&self, statement: &str, params: &[SqlValue]) -> ControllerResult<QueryResult> {
        self.with_connection(statement, |connection| connection.query(statement, params))
    }

    pub fn take_violation(&self) -> Option<ControllerError> {
        lock(&self.inner).violation.take()
    }

    pub fn has_violation(&self) -> bool {
        lock(&self.inner).violation.is_some()
    }

    fn with_connection<T>(
        &self,
        statement: &str,
        action: impl FnOnce(&mut dyn DatabaseConnection) -> Result<T, DriverError>,
    ) -> ControllerResult<T> {
        let mut inner = lock(&self.inner);
        let admitted = check_statement(statement)
            .and_then(|()| inner.ensure_open())
            .and_then(|()| inner.operation.check());
        if let Err(error) = admitted {
            tracing::warn!(transaction = inner.id, error = %error, "rejected guarded statement");
            inner.record_violation(&error);
            return Err(error);
        }
        let transaction = inner.id;
        tracing::debug!(transaction, statement, "executing guarded statement");
        let state = inner.state;
        let connection = inner
            .connection
            .as_mut()
            .ok_or(ControllerError::TransactionClosed { state })?;
        action(&mut **connection).map_err(|source| ControllerError::StatementExecution {
            statement: statement.to_string(),
            source,
        })
    }
}

/// Runs `body` inside a fresh transaction: commit on success, rollback otherwise.
///
/// Guard violations recorded during `body` and cancellation observed before
/// commit both turn a successful body into a rollback. A failed rollback is
/// attached to the original error, never substituted for it.
pub fn run_in_transaction<T>(
    connector: &dyn DatabaseConnector,
    operation: &OperationContext,
    body: impl FnOnce(&TransactionContext) -> ControllerResult<T>,
) -> ControllerResult<T> {
    let transaction = TransactionContext::begin(connector, operation)?;
    let outcome = body(&transaction).and_then(|value| {
        if let Some(violation) = transaction.take_violation() {
            return Err(violation);
        }
        operation.check()?;
        Ok(value)
    });
    match outcome {
        Ok(value) => {
            transaction.commit()?;
            Ok(value)
        }
        Err(error) => match transaction.rollback() {
            Ok(()) => Err(error),
            Err(cleanup) => {
                tracing::warn!(
                    transaction = transaction.id(),
                    error = %error,
                    cleanup = %cleanup,
                    "rollback after failed operation also failed"
                );
                Err(error.with_cleanup_failure(cleanup))
            }
        },
    }
}
