//! Scriptable in-memory driver that records every call it receives.
//!
//! Used by the unit tests of this crate and, through the `test-support`
//! feature, by the extension bridge, controller, and gateway tests.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::driver::{DatabaseConnection, DatabaseConnector, DriverError, QueryResult, SqlValue};

/// One driver call observed by a [`RecordingConnector`].
#[derive(Debug, Clone, PartialEq)]
pub enum DriverCall {
    Connect,
    Begin,
    Execute {
        statement: String,
        params: Vec<SqlValue>,
    },
    Query {
        statement: String,
        params: Vec<SqlValue>,
    },
    Commit,
    Rollback,
    Close,
}

/// A [`DriverCall`] tagged with the connection it happened on.
#[derive(Debug, Clone, PartialEq)]
pub struct DriverEvent {
    pub connection: u64,
    pub call: DriverCall,
}

#[derive(Debug, Default)]
struct Script {
    query_responses: Vec<(String, QueryResult)>,
    statement_failures: Vec<(String, String)>,
    fail_connect: Option<String>,
    fail_begin: Option<String>,
    fail_commit: Option<String>,
    fail_rollback: Option<String>,
    fail_close: Option<String>,
}

impl Script {
    fn statement_failure(&self, statement: &str) -> Option<DriverError> {
        self.statement_failures
            .iter()
            .find(|(fragment, _)| statement.contains(fragment.as_str()))
            .map(|(_, message)| DriverError::new(message.clone()))
    }

    fn query_response(&self, statement: &str) -> QueryResult {
        self.query_responses
            .iter()
            .find(|(fragment, _)| statement.contains(fragment.as_str()))
            .map(|(_, result)| result.clone())
            .unwrap_or_default()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Connector whose connections log calls into a shared event list.
#[derive(Debug, Clone, Default)]
pub struct RecordingConnector {
    events: Arc<Mutex<Vec<DriverEvent>>>,
    script: Arc<Mutex<Script>>,
    next_connection: Arc<AtomicU64>,
}

impl RecordingConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answers queries containing `fragment` with `result`. Other queries return no rows.
    pub fn respond_to_query(&self, fragment: &str, result: QueryResult) -> &Self {
        lock(&self.script)
            .query_responses
            .push((fragment.to_string(), result));
        self
    }

    /// Fails any execute or query whose statement contains `fragment`.
    pub fn fail_statement(&self, fragment: &str, message: &str) -> &Self {
        lock(&self.script)
            .statement_failures
            .push((fragment.to_string(), message.to_string()));
        self
    }

    pub fn fail_connect(&self, message: &str) -> &Self {
        lock(&self.script).fail_connect = Some(message.to_string());
        self
    }

    pub fn fail_begin(&self, message: &str) -> &Self {
        lock(&self.script).fail_begin = Some(message.to_string());
        self
    }

    pub fn fail_commit(&self, message: &str) -> &Self {
        lock(&self.script).fail_commit = Some(message.to_string());
        self
    }

    pub fn fail_rollback(&self, message: &str) -> &Self {
        lock(&self.script).fail_rollback = Some(message.to_string());
        self
    }

    pub fn fail_close(&self, message: &str) -> &Self {
        lock(&self.script).fail_close = Some(message.to_string());
        self
    }

    pub fn events(&self) -> Vec<DriverEvent> {
        lock(&self.events).clone()
    }

    /// Calls made on one connection, in order.
    pub fn calls_for(&self, connection: u64) -> Vec<DriverCall> {
        lock(&self.events)
            .iter()
            .filter(|event| event.connection == connection)
            .map(|event| event.call.clone())
            .collect()
    }

    /// Distinct connection ids in the order they were opened.
    pub fn connection_ids(&self) -> Vec<u64> {
        let mut ids = Vec::new();
        for event in lock(&self.events).iter() {
            if !ids.contains(&event.connection) {
                ids.push(event.connection);
            }
        }
        ids
    }

    /// Statements passed to execute or query across all connections.
    pub fn statements(&self) -> Vec<String> {
        lock(&self.events)
            .iter()
            .filter_map(|event| match &event.call {
                DriverCall::Execute { statement, .. } | DriverCall::Query { statement, .. } => {
                    Some(statement.clone())
                }
                _ => None,
            })
            .collect()
    }

    fn record(&self, connection: u64, call: DriverCall) {
        lock(&self.events).push(DriverEvent { connection, call });
    }
}

impl DatabaseConnector for RecordingConnector {
    fn connect(&self) -> Result<Box<dyn DatabaseConnection>, DriverError> {
        let id = self.next_connection.fetch_add(1, Ordering::SeqCst) + 1;
        self.record(id, DriverCall::Connect);
        if let Some(message) = lock(&self.script).fail_connect.clone() {
            return Err(DriverError::new(message));
        }
        Ok(Box::new(RecordingConnection {
            id,
            connector: self.clone(),
        }))
    }

    fn describe(&self) -> String {
        "recording".to_string()
    }
}

struct RecordingConnection {
    id: u64,
    connector: RecordingConnector,
}

impl RecordingConnection {
    fn scripted(&self, call: DriverCall, failure: Option<String>) -> Result<(), DriverError> {
        self.connector.record(self.id, call);
        match failure {
            Some(message) => Err(DriverError::new(message)),
            None => Ok(()),
        }
    }
}

impl DatabaseConnection for RecordingConnection {
    fn begin(&mut self) -> Result<(), DriverError> {
        let failure = lock(&self.connector.script).fail_begin.clone();
        self.scripted(DriverCall::Begin, failure)
    }

    fn execute(&mut self, statement: &str, params: &[SqlValue]) -> Result<u64, DriverError> {
        self.connector.record(
            self.id,
            DriverCall::Execute {
                statement: statement.to_string(),
                params: params.to_vec(),
            },
        );
        match lock(&self.connector.script).statement_failure(statement) {
            Some(error) => Err(error),
            None => Ok(0),
        }
    }

    fn query(&mut self, statement: &str, params: &[SqlValue]) -> Result<QueryResult, DriverError> {
        self.connector.record(
            self.id,
            DriverCall::Query {
                statement: statement.to_string(),
                params: params.to_vec(),
            },
        );
        let script = lock(&self.connector.script);
        match script.statement_failure(statement) {
            Some(error) => Err(error),
            None => Ok(script.query_response(statement)),
        }
    }

    fn commit(&mut self) -> Result<(), DriverError> {
        let failure = lock(&self.connector.script).fail_commit.clone();
        self.scripted(DriverCall::Commit, failure)
    }

    fn rollback(&mut self) -> Result<(), DriverError> {
        let failure = lock(&self.connector.script).fail_rollback.clone();
        self.scripted(DriverCall::Rollback, failure)
    }

    fn close(&mut self) -> Result<(), DriverError> {
        let failure = lock(&self.connector.script).fail_close.clone();
        self.scripted(DriverCall::Close, failure)
    }
}

/// Builds a [`QueryResult`] from column names and rows.
pub fn query_result(columns: &[&str], rows: Vec<Vec<SqlValue>>) -> QueryResult {
    QueryResult {
        columns: columns.iter().map(|column| column.to_string()).collect(),
        rows,
    }
}
