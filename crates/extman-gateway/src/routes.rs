//! REST endpoints and their handlers.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path as AxumPath, Query, State};
use axum::http::StatusCode;
use axum::routing::{delete, get, post, put};
use axum::{Json, Router};
use extman_controller::ExtensionController;
use extman_core::{
    CancellationToken, ControllerResult, OperationContext, ParameterDefinition, ParameterValue,
    SharedConnector,
};
use extman_extensions::{Extension, Installation, Instance, UpgradeResult};
use serde::{Deserialize, Serialize};

use crate::api_error::ApiError;
use crate::connection::{ConnectorProvider, DbConnectionParams};

pub const API_BASE_PATH: &str = "/api/v1/extensionmanager";
pub const EXTENSIONS_ENDPOINT: &str = "/api/v1/extensionmanager/extensions";
pub const EXTENSION_DETAILS_ENDPOINT: &str =
    "/api/v1/extensionmanager/extensions/{extensionId}/{version}";
pub const EXTENSION_INSTALL_ENDPOINT: &str =
    "/api/v1/extensionmanager/extensions/{extensionId}/{version}/install";
pub const INSTALLATIONS_ENDPOINT: &str = "/api/v1/extensionmanager/installations";
pub const INSTALLATION_ENDPOINT: &str =
    "/api/v1/extensionmanager/installations/{extensionId}/{version}";
pub const INSTALLATION_UPGRADE_ENDPOINT: &str =
    "/api/v1/extensionmanager/installations/{extensionId}/upgrade";
pub const INSTANCES_ENDPOINT: &str =
    "/api/v1/extensionmanager/installations/{extensionId}/{version}/instances";
pub const INSTANCE_ENDPOINT: &str =
    "/api/v1/extensionmanager/installations/{extensionId}/{version}/instances/{instanceId}";

/// Shared state handed to every handler.
pub struct GatewayState {
    pub(crate) controller: ExtensionController,
    pub(crate) connectors: Arc<dyn ConnectorProvider>,
    pub(crate) request_timeout: Option<Duration>,
}

impl GatewayState {
    pub fn new(
        controller: ExtensionController,
        connectors: Arc<dyn ConnectorProvider>,
        request_timeout: Option<Duration>,
    ) -> Self {
        Self {
            controller,
            connectors,
            request_timeout,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ExtensionsResponse {
    pub extensions: Vec<Extension>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtensionDetailsResponse {
    pub id: String,
    pub version: String,
    pub parameter_definitions: Vec<ParameterDefinition>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct InstallationsResponse {
    pub installations: Vec<Installation>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct InstancesResponse {
    pub instances: Vec<Instance>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateInstanceRequest {
    #[serde(default)]
    pub parameter_values: Vec<ParameterValue>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateInstanceResponse {
    pub instance_id: String,
    pub instance_name: String,
}

pub fn build_router(state: Arc<GatewayState>) -> Router {
    Router::new()
        .route(EXTENSIONS_ENDPOINT, get(handle_list_extensions))
        .route(EXTENSION_DETAILS_ENDPOINT, get(handle_extension_details))
        .route(EXTENSION_INSTALL_ENDPOINT, put(handle_install_extension))
        .route(INSTALLATIONS_ENDPOINT, get(handle_list_installations))
        .route(INSTALLATION_ENDPOINT, delete(handle_uninstall_extension))
        .route(INSTALLATION_UPGRADE_ENDPOINT, post(handle_upgrade_extension))
        .route(
            INSTANCES_ENDPOINT,
            get(handle_list_instances).post(handle_create_instance),
        )
        .route(INSTANCE_ENDPOINT, delete(handle_delete_instance))
        .with_state(state)
}

/// Cancels the operation if the request future is dropped before it finishes.
struct CancelOnDrop(CancellationToken);

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        self.0.cancel();
    }
}

/// Runs a blocking controller operation off the async executor.
async fn run_operation<T, F>(state: &GatewayState, operation: F) -> Result<T, ApiError>
where
    T: Send + 'static,
    F: FnOnce(&ExtensionController, &OperationContext) -> ControllerResult<T> + Send + 'static,
{
    let context = match state.request_timeout {
        Some(timeout) => OperationContext::with_timeout(timeout),
        None => OperationContext::new(),
    };
    let _cancel_on_drop = CancelOnDrop(context.token().clone());
    let controller = state.controller.clone();
    let task = tokio::task::spawn_blocking(move || operation(&controller, &context));
    match task.await {
        Ok(result) => result.map_err(ApiError::from),
        Err(error) => Err(ApiError::internal(format!("operation task failed: {error}"))),
    }
}

fn resolve_connector(
    state: &GatewayState,
    query: &HashMap<String, String>,
) -> Result<SharedConnector, ApiError> {
    let params = DbConnectionParams::from_query(query)
        .map_err(|error| ApiError::bad_request(error.to_string()))?;
    tracing::debug!(host = %params.host, port = params.port, "resolved target database");
    state.connectors.connector(&params).map_err(ApiError::from)
}

async fn handle_list_extensions(
    State(state): State<Arc<GatewayState>>,
) -> Result<Json<ExtensionsResponse>, ApiError> {
    let extensions = run_operation(&state, |controller, operation| {
        controller.get_all_extensions(operation)
    })
    .await?;
    Ok(Json(ExtensionsResponse { extensions }))
}

async fn handle_extension_details(
    State(state): State<Arc<GatewayState>>,
    AxumPath((extension_id, version)): AxumPath<(String, String)>,
    Query(query): Query<HashMap<String, String>>,
) -> Result<Json<ExtensionDetailsResponse>, ApiError> {
    let db = resolve_connector(&state, &query)?;
    let (id, requested) = (extension_id.clone(), version.clone());
    let parameter_definitions = run_operation(&state, move |controller, operation| {
        controller.get_parameter_definitions(operation, &db, &id, &requested)
    })
    .await?;
    Ok(Json(ExtensionDetailsResponse {
        id: extension_id,
        version,
        parameter_definitions,
    }))
}

async fn handle_install_extension(
    State(state): State<Arc<GatewayState>>,
    AxumPath((extension_id, version)): AxumPath<(String, String)>,
    Query(query): Query<HashMap<String, String>>,
) -> Result<StatusCode, ApiError> {
    let db = resolve_connector(&state, &query)?;
    run_operation(&state, move |controller, operation| {
        controller.install_extension(operation, &db, &extension_id, &version)
    })
    .await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn handle_list_installations(
    State(state): State<Arc<GatewayState>>,
    Query(query): Query<HashMap<String, String>>,
) -> Result<Json<InstallationsResponse>, ApiError> {
    let db = resolve_connector(&state, &query)?;
    let installations = run_operation(&state, move |controller, operation| {
        controller.get_all_installations(operation, &db)
    })
    .await?;
    Ok(Json(InstallationsResponse { installations }))
}

async fn handle_uninstall_extension(
    State(state): State<Arc<GatewayState>>,
    AxumPath((extension_id, version)): AxumPath<(String, String)>,
    Query(query): Query<HashMap<String, String>>,
) -> Result<StatusCode, ApiError> {
    let db = resolve_connector(&state, &query)?;
    run_operation(&state, move |controller, operation| {
        controller.uninstall_extension(operation, &db, &extension_id, &version)
    })
    .await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn handle_upgrade_extension(
    State(state): State<Arc<GatewayState>>,
    AxumPath(extension_id): AxumPath<String>,
    Query(query): Query<HashMap<String, String>>,
) -> Result<Json<UpgradeResult>, ApiError> {
    let db = resolve_connector(&state, &query)?;
    let result = run_operation(&state, move |controller, operation| {
        controller.upgrade_extension(operation, &db, &extension_id)
    })
    .await?;
    Ok(Json(result))
}

async fn handle_list_instances(
    State(state): State<Arc<GatewayState>>,
    AxumPath((extension_id, version)): AxumPath<(String, String)>,
    Query(query): Query<HashMap<String, String>>,
) -> Result<Json<InstancesResponse>, ApiError> {
    let db = resolve_connector(&state, &query)?;
    let instances = run_operation(&state, move |controller, operation| {
        controller.find_instances(operation, &db, &extension_id, &version)
    })
    .await?;
    Ok(Json(InstancesResponse { instances }))
}

async fn handle_create_instance(
    State(state): State<Arc<GatewayState>>,
    AxumPath((extension_id, version)): AxumPath<(String, String)>,
    Query(query): Query<HashMap<String, String>>,
    payload: Result<Json<CreateInstanceRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<CreateInstanceResponse>), ApiError> {
    let db = resolve_connector(&state, &query)?;
    let Json(request) = payload
        .map_err(|rejection| ApiError::bad_request(format!("invalid request: {}", rejection.body_text())))?;
    let instance = run_operation(&state, move |controller, operation| {
        controller.create_instance(
            operation,
            &db,
            &extension_id,
            &version,
            &request.parameter_values,
        )
    })
    .await?;
    Ok((
        StatusCode::CREATED,
        Json(CreateInstanceResponse {
            instance_id: instance.id,
            instance_name: instance.name,
        }),
    ))
}

async fn handle_delete_instance(
    State(state): State<Arc<GatewayState>>,
    AxumPath((extension_id, version, instance_id)): AxumPath<(String, String, String)>,
    Query(query): Query<HashMap<String, String>>,
) -> Result<StatusCode, ApiError> {
    let db = resolve_connector(&state, &query)?;
    run_operation(&state, move |controller, operation| {
        controller.delete_instance(operation, &db, &extension_id, &version, &instance_id)
    })
    .await?;
    Ok(StatusCode::NO_CONTENT)
}
