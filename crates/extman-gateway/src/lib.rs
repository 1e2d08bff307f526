//! REST boundary of the extension manager.
//!
//! Exposes the controller operations under `/api/v1/extensionmanager`, resolves
//! the target database from the `dbHost` / `dbPort` query parameters, runs each
//! operation on the blocking pool, and renders controller errors as
//! `{"code", "message"}` bodies.

pub mod api_error;
pub mod connection;
pub mod routes;
pub mod server;

pub use api_error::{ApiError, ApiErrorBody};
pub use connection::{
    ConnectionParamsError, ConnectorProvider, DbConnectionParams, SqliteConnectorProvider,
};
pub use routes::{build_router, GatewayState, API_BASE_PATH};
pub use server::{GatewayConfig, RestServer, RunningServer, DEFAULT_BIND_ADDRESS};
