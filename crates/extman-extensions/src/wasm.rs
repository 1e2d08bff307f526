//! Wasmtime-backed guest modules.
//!
//! Every entry-point call compiles and instantiates the module in a fresh
//! engine and store with fuel and memory limits. The only capabilities linked
//! into the instance are the `extman` host imports, which forward to the
//! [`ExtensionContext`] of the current operation.
//!
//! Guest ABI: the module exports `memory`, `extman_alloc(len) -> ptr` and one
//! function per entry point taking `(ptr, len)` of a JSON request and
//! returning `ptr << 32 | len` of a JSON response envelope.

use std::fmt;
use std::path::Path;
use std::sync::Arc;

use anyhow::{anyhow, Context};
use extman_core::{
    ControllerError, ErrorKind, ParameterDefinition, ParameterValue, QueryResult, SqlValue,
};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use wasmparser::{Parser, Payload};
use wasmtime::{
    Caller, Config, Engine, Extern, Instance as WasmInstance, Linker, Memory, Module, Store,
    StoreLimits, StoreLimitsBuilder,
};

use crate::context::ExtensionContext;
use crate::guest::{EntryPoint, GuestError, GuestModule, GuestResult};
use crate::manifest::LoadedManifest;
use crate::model::{Extension, Installation, Instance, UpgradeResult};

const WASM_PAGE_SIZE_BYTES: u64 = 65_536;
const WASM_MEMORY_EXPORT_NAME: &str = "memory";
const WASM_ALLOC_EXPORT_NAME: &str = "extman_alloc";
const HOST_MODULE_NAME: &str = "extman";

/// Default fuel budget for one entry-point call.
pub const WASM_GUEST_FUEL_LIMIT_DEFAULT: u64 = 50_000_000;
/// Default memory ceiling for one entry-point call.
pub const WASM_GUEST_MEMORY_LIMIT_BYTES_DEFAULT: u64 = 32 * 1024 * 1024;
/// Default ceiling for guest responses.
pub const WASM_GUEST_MAX_RESPONSE_BYTES_DEFAULT: usize = 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
/// Resource limits applied to every guest invocation.
pub struct WasmGuestLimits {
    pub fuel_limit: u64,
    pub memory_limit_bytes: u64,
    pub max_response_bytes: usize,
}

impl Default for WasmGuestLimits {
    fn default() -> Self {
        Self {
            fuel_limit: WASM_GUEST_FUEL_LIMIT_DEFAULT,
            memory_limit_bytes: WASM_GUEST_MEMORY_LIMIT_BYTES_DEFAULT,
            max_response_bytes: WASM_GUEST_MAX_RESPONSE_BYTES_DEFAULT,
        }
    }
}

struct GuestStoreState {
    limits: StoreLimits,
    context: ExtensionContext,
    max_response_bytes: usize,
}

/// Guest module compiled from a wasm binary.
pub struct WasmGuestModule {
    extension: Extension,
    module_bytes: Arc<Vec<u8>>,
    limits: WasmGuestLimits,
}

impl fmt::Debug for WasmGuestModule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WasmGuestModule")
            .field("id", &self.extension.id)
            .field("module_bytes", &self.module_bytes.len())
            .field("limits", &self.limits)
            .finish()
    }
}

impl WasmGuestModule {
    /// Builds a module from raw wasm bytes after checking them against `limits`.
    pub fn from_bytes(
        extension: Extension,
        module_bytes: Vec<u8>,
        limits: WasmGuestLimits,
    ) -> anyhow::Result<Self> {
        validate_limits(&limits)?;
        validate_wasm_module_for_limits(&module_bytes, limits.memory_limit_bytes)?;
        Ok(Self {
            extension,
            module_bytes: Arc::new(module_bytes),
            limits,
        })
    }

    pub fn from_manifest(loaded: &LoadedManifest) -> anyhow::Result<Self> {
        let module_bytes = read_module(&loaded.module_path)?;
        Self::from_bytes(
            loaded.manifest.extension(),
            module_bytes,
            loaded.manifest.wasm_limits(),
        )
        .with_context(|| {
            format!(
                "invalid wasm module for extension '{}'",
                loaded.manifest.id
            )
        })
    }

    fn call<T: DeserializeOwned>(
        &self,
        context: &ExtensionContext,
        entry_point: EntryPoint,
        request: Value,
    ) -> GuestResult<T> {
        let response = self.invoke(context, entry_point, &request)?;
        parse_response(entry_point, &response)
    }

    fn invoke(
        &self,
        context: &ExtensionContext,
        entry_point: EntryPoint,
        request: &Value,
    ) -> GuestResult<String> {
        let mut config = Config::new();
        config.consume_fuel(true);
        let engine = Engine::new(&config)
            .map_err(|error| GuestError::new(format!("failed to initialize wasm engine: {error}")))?;
        let module = Module::new(&engine, self.module_bytes.as_slice())
            .map_err(|error| GuestError::new(format!("failed to compile wasm module: {error}")))?;

        let mut store = Store::new(
            &engine,
            GuestStoreState {
                limits: StoreLimitsBuilder::new()
                    .memory_size(self.limits.memory_limit_bytes as usize)
                    .build(),
                context: context.clone(),
                max_response_bytes: self.limits.max_response_bytes,
            },
        );
        store.limiter(|state| &mut state.limits);
        store.set_fuel(self.limits.fuel_limit).map_err(|error| {
            GuestError::new(format!("failed to configure wasm fuel limit: {error}"))
        })?;

        let mut linker = Linker::<GuestStoreState>::new(&engine);
        link_host_functions(&mut linker)
            .map_err(|error| GuestError::new(format!("failed to link host functions: {error}")))?;
        let instance = linker.instantiate(&mut store, &module).map_err(|error| {
            GuestError::new(format!("failed to instantiate wasm module: {error}"))
        })?;

        if instance.get_export(&mut store, entry_point.as_str()).is_none() {
            return Err(GuestError::missing_entry_point(entry_point));
        }
        let invoke = instance
            .get_typed_func::<(i32, i32), i64>(&mut store, entry_point.as_str())
            .map_err(|error| {
                GuestError::new(format!(
                    "export '{entry_point}' has an unexpected signature: {error}"
                ))
            })?;
        let memory = guest_memory(&instance, &mut store)?;

        let request_json = request.to_string();
        let (request_ptr, request_len) =
            write_guest_bytes(&instance, &mut store, memory, request_json.as_bytes())
                .map_err(|error| GuestError::new(format!("failed to pass request: {error}")))?;

        let packed = invoke
            .call(&mut store, (request_ptr, request_len))
            .map_err(|error| {
                let remaining_fuel = store.get_fuel().unwrap_or_default();
                GuestError::new(format!(
                    "wasm entry point '{entry_point}' trapped: {error:#} (fuel_consumed={})",
                    self.limits.fuel_limit.saturating_sub(remaining_fuel)
                ))
            })?;
        let response = read_packed_response(memory, &store, packed, self.limits.max_response_bytes)
            .map_err(|error| GuestError::new(format!("invalid guest response: {error}")))?;
        tracing::debug!(
            extension = %self.extension.id,
            entry_point = entry_point.as_str(),
            fuel_consumed = self
                .limits
                .fuel_limit
                .saturating_sub(store.get_fuel().unwrap_or_default()),
            "wasm entry point returned"
        );
        Ok(response)
    }
}

impl GuestModule for WasmGuestModule {
    fn id(&self) -> &str {
        &self.extension.id
    }

    fn describe(&self) -> GuestResult<Extension> {
        Ok(self.extension.clone())
    }

    fn find_installations(&self, context: &ExtensionContext) -> GuestResult<Vec<Installation>> {
        self.call(context, EntryPoint::FindInstallations, json!({}))
    }

    fn install(&self, context: &ExtensionContext, version: &str) -> GuestResult<()> {
        self.call::<Option<Value>>(context, EntryPoint::Install, json!({ "version": version }))
            .map(|_| ())
    }

    fn uninstall(&self, context: &ExtensionContext, version: &str) -> GuestResult<()> {
        self.call::<Option<Value>>(context, EntryPoint::Uninstall, json!({ "version": version }))
            .map(|_| ())
    }

    fn upgrade(&self, context: &ExtensionContext) -> GuestResult<UpgradeResult> {
        self.call(context, EntryPoint::Upgrade, json!({}))
    }

    fn parameter_definitions(
        &self,
        context: &ExtensionContext,
        version: &str,
    ) -> GuestResult<Vec<ParameterDefinition>> {
        self.call(
            context,
            EntryPoint::GetParameterDefinitions,
            json!({ "version": version }),
        )
    }

    fn add_instance(
        &self,
        context: &ExtensionContext,
        version: &str,
        parameters: &[ParameterValue],
    ) -> GuestResult<Instance> {
        self.call(
            context,
            EntryPoint::AddInstance,
            json!({ "version": version, "parameterValues": parameters }),
        )
    }

    fn find_instances(
        &self,
        context: &ExtensionContext,
        version: &str,
    ) -> GuestResult<Vec<Instance>> {
        self.call(context, EntryPoint::FindInstances, json!({ "version": version }))
    }

    fn delete_instance(
        &self,
        context: &ExtensionContext,
        version: &str,
        instance_id: &str,
    ) -> GuestResult<()> {
        self.call::<Option<Value>>(
            context,
            EntryPoint::DeleteInstance,
            json!({ "version": version, "instanceId": instance_id }),
        )
        .map(|_| ())
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ResponseEnvelope {
    #[serde(default)]
    ok: Option<Value>,
    #[serde(default)]
    error: Option<ResponseError>,
}

#[derive(Debug, Deserialize)]
struct ResponseError {
    message: String,
    #[serde(default)]
    status: Option<u16>,
}

fn parse_response<T: DeserializeOwned>(entry_point: EntryPoint, response: &str) -> GuestResult<T> {
    let envelope: ResponseEnvelope = serde_json::from_str(response).map_err(|error| {
        GuestError::new(format!(
            "malformed response from '{entry_point}': {error}"
        ))
    })?;
    if let Some(error) = envelope.error {
        let failure = GuestError::new(error.message);
        return Err(match error.status {
            Some(status) => failure.with_status(status),
            None => failure,
        });
    }
    serde_json::from_value(envelope.ok.unwrap_or(Value::Null)).map_err(|error| {
        GuestError::new(format!(
            "unexpected result from '{entry_point}': {error}"
        ))
    })
}

fn read_module(path: &Path) -> anyhow::Result<Vec<u8>> {
    std::fs::read(path)
        .with_context(|| format!("failed to read wasm module '{}'", path.display()))
}

fn validate_limits(limits: &WasmGuestLimits) -> anyhow::Result<()> {
    if limits.fuel_limit == 0 {
        return Err(anyhow!("wasm fuel limit must be greater than 0"));
    }
    if limits.memory_limit_bytes == 0 {
        return Err(anyhow!("wasm memory limit must be greater than 0"));
    }
    if limits.max_response_bytes == 0 {
        return Err(anyhow!("wasm max response bytes must be greater than 0"));
    }
    Ok(())
}

fn validate_wasm_module_for_limits(
    module_bytes: &[u8],
    memory_limit_bytes: u64,
) -> anyhow::Result<()> {
    for payload in Parser::new(0).parse_all(module_bytes) {
        let payload = payload.context("failed to parse wasm module bytes")?;
        if let Payload::MemorySection(section) = payload {
            for memory in section {
                let memory = memory.context("failed to parse wasm memory section")?;
                let min_bytes = memory.initial.saturating_mul(WASM_PAGE_SIZE_BYTES);
                if min_bytes > memory_limit_bytes {
                    return Err(anyhow!(
                        "wasm module declares minimum memory {} bytes above limit {} bytes",
                        min_bytes,
                        memory_limit_bytes
                    ));
                }
            }
        }
    }
    Ok(())
}

fn guest_memory(
    instance: &WasmInstance,
    store: &mut Store<GuestStoreState>,
) -> GuestResult<Memory> {
    instance
        .get_memory(&mut *store, WASM_MEMORY_EXPORT_NAME)
        .ok_or_else(|| {
            GuestError::new(format!(
                "wasm module missing required memory export '{WASM_MEMORY_EXPORT_NAME}'"
            ))
        })
}

fn validate_memory_range(memory_size: usize, offset: usize, len: usize) -> anyhow::Result<()> {
    let end = offset
        .checked_add(len)
        .ok_or_else(|| anyhow!("memory range overflow"))?;
    if end > memory_size {
        return Err(anyhow!(
            "offset={} len={} end={} exceeds memory_size={}",
            offset,
            len,
            end,
            memory_size
        ));
    }
    Ok(())
}

/// Reserves guest memory through `extman_alloc` and copies `bytes` into it.
fn write_guest_bytes(
    instance: &WasmInstance,
    store: &mut Store<GuestStoreState>,
    memory: Memory,
    bytes: &[u8],
) -> anyhow::Result<(i32, i32)> {
    let alloc = instance
        .get_typed_func::<i32, i32>(&mut *store, WASM_ALLOC_EXPORT_NAME)
        .with_context(|| format!("missing alloc export '{WASM_ALLOC_EXPORT_NAME}'"))?;
    let len = i32::try_from(bytes.len()).context("payload exceeds wasm i32 length boundary")?;
    let ptr = alloc.call(&mut *store, len)?;
    let offset = usize::try_from(ptr).context("alloc export returned a negative pointer")?;
    validate_memory_range(memory.data_size(&*store), offset, bytes.len())?;
    memory.write(&mut *store, offset, bytes)?;
    Ok((ptr, len))
}

fn read_packed_response(
    memory: Memory,
    store: &Store<GuestStoreState>,
    packed: i64,
    max_response_bytes: usize,
) -> anyhow::Result<String> {
    let packed = packed as u64;
    let ptr = (packed >> 32) as usize;
    let len = (packed & 0xFFFF_FFFF) as usize;
    if len > max_response_bytes {
        return Err(anyhow!(
            "response length {} exceeds limit {}",
            len,
            max_response_bytes
        ));
    }
    validate_memory_range(memory.data_size(store), ptr, len)?;
    let mut bytes = vec![0u8; len];
    memory.read(store, ptr, &mut bytes)?;
    let response = String::from_utf8(bytes).context("response is not valid UTF-8")?;
    if response.trim().is_empty() {
        return Err(anyhow!("response payload is empty"));
    }
    Ok(response)
}

#[derive(Debug, Deserialize)]
struct SqlRequest {
    statement: String,
    #[serde(default)]
    params: Vec<SqlValue>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FindPathRequest {
    file_name: String,
}

fn link_host_functions(linker: &mut Linker<GuestStoreState>) -> anyhow::Result<()> {
    linker.func_wrap(
        HOST_MODULE_NAME,
        "sql_execute",
        |caller: Caller<'_, GuestStoreState>, ptr: i32, len: i32| {
            host_call(caller, ptr, len, |context, request| {
                let request: SqlRequest = serde_json::from_slice(request)?;
                let affected = context
                    .sql()
                    .run_query(&request.statement, &request.params);
                Ok(affected.map(|rows| json!({ "rowsAffected": rows })))
            })
        },
    )?;
    linker.func_wrap(
        HOST_MODULE_NAME,
        "sql_query",
        |caller: Caller<'_, GuestStoreState>, ptr: i32, len: i32| {
            host_call(caller, ptr, len, |context, request| {
                let request: SqlRequest = serde_json::from_slice(request)?;
                let result = context.sql().query(&request.statement, &request.params);
                Ok(result.map(|result: QueryResult| json!(result)))
            })
        },
    )?;
    linker.func_wrap(
        HOST_MODULE_NAME,
        "bucketfs_list_files",
        |caller: Caller<'_, GuestStoreState>, ptr: i32, len: i32| {
            host_call(caller, ptr, len, |context, _request| {
                Ok(context.bucketfs().list_files().map(|files| json!(files)))
            })
        },
    )?;
    linker.func_wrap(
        HOST_MODULE_NAME,
        "bucketfs_find_path",
        |caller: Caller<'_, GuestStoreState>, ptr: i32, len: i32| {
            host_call(caller, ptr, len, |context, request| {
                let request: FindPathRequest = serde_json::from_slice(request)?;
                Ok(context
                    .bucketfs()
                    .find_absolute_path(&request.file_name)
                    .map(Value::String))
            })
        },
    )?;
    Ok(())
}

/// Shared plumbing of every host import: read the request, run `handler`,
/// and hand the JSON envelope back to the guest.
///
/// Guard violations, closed transactions, and cancellation trap the guest.
/// Every other failure is returned as an error envelope the guest may handle.
fn host_call(
    mut caller: Caller<'_, GuestStoreState>,
    ptr: i32,
    len: i32,
    handler: impl FnOnce(&ExtensionContext, &[u8]) -> anyhow::Result<Result<Value, ControllerError>>,
) -> anyhow::Result<i64> {
    let memory = match caller.get_export(WASM_MEMORY_EXPORT_NAME) {
        Some(Extern::Memory(memory)) => memory,
        _ => return Err(anyhow!("guest does not export '{WASM_MEMORY_EXPORT_NAME}'")),
    };
    let offset = usize::try_from(ptr).context("negative request pointer")?;
    let length = usize::try_from(len).context("negative request length")?;
    let data = memory.data(&caller);
    validate_memory_range(data.len(), offset, length)?;
    let request = data[offset..offset + length].to_vec();

    let context = caller.data().context.clone();
    let envelope = match handler(&context, &request) {
        Ok(Ok(value)) => json!({ "ok": value }),
        Ok(Err(error)) if error.is_guard_violation() => {
            return Err(anyhow!(error).context("host call rejected"));
        }
        Ok(Err(error)) => error_envelope(&error),
        Err(error) => json!({ "error": { "message": format!("invalid host call request: {error}") } }),
    };
    let response = envelope.to_string();
    if response.len() > caller.data().max_response_bytes {
        return Err(anyhow!(
            "host response length {} exceeds limit {}",
            response.len(),
            caller.data().max_response_bytes
        ));
    }

    let alloc = match caller.get_export(WASM_ALLOC_EXPORT_NAME) {
        Some(Extern::Func(func)) => func.typed::<i32, i32>(&caller)?,
        _ => return Err(anyhow!("guest does not export '{WASM_ALLOC_EXPORT_NAME}'")),
    };
    let response_len = i32::try_from(response.len()).context("host response too large")?;
    let response_ptr = alloc.call(&mut caller, response_len)?;
    let response_offset =
        usize::try_from(response_ptr).context("alloc export returned a negative pointer")?;
    validate_memory_range(memory.data_size(&caller), response_offset, response.len())?;
    memory.write(&mut caller, response_offset, response.as_bytes())?;
    Ok(((response_offset as u64) << 32 | response.len() as u64) as i64)
}

fn error_envelope(error: &ControllerError) -> Value {
    let status = match error.kind() {
        ErrorKind::FileNotFound => Some(404),
        ErrorKind::InvalidArgument => Some(400),
        _ => None,
    };
    json!({ "error": { "message": error.to_string(), "status": status } })
}
