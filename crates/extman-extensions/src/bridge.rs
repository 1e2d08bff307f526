//! Resolves guest modules and runs their entry points under the error taxonomy.

use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use extman_core::{ControllerError, ControllerResult, GuestFailure};

use crate::context::ExtensionContext;
use crate::guest::{EntryPoint, GuestError, GuestModule, GuestResult};
use crate::model::Extension;
use crate::repository::ModuleRepository;

/// Guest module together with the metadata it was resolved against.
#[derive(Clone)]
pub struct ResolvedExtension {
    pub module: Arc<dyn GuestModule>,
    pub extension: Extension,
}

/// Bridge between the controller and guest modules.
#[derive(Clone)]
pub struct ExecutionBridge {
    repository: Arc<dyn ModuleRepository>,
}

impl ExecutionBridge {
    pub fn new(repository: Arc<dyn ModuleRepository>) -> Self {
        Self { repository }
    }

    /// Metadata of every available extension, ordered by id.
    pub fn list_extensions(&self) -> ControllerResult<Vec<Extension>> {
        self.repository
            .list_modules()
            .iter()
            .map(|module| describe(module.as_ref()))
            .collect()
    }

    /// Every available module with its metadata, from a single repository listing.
    pub fn resolve_all(&self) -> ControllerResult<Vec<ResolvedExtension>> {
        self.repository
            .list_modules()
            .into_iter()
            .map(|module| {
                let extension = describe(module.as_ref())?;
                Ok(ResolvedExtension { module, extension })
            })
            .collect()
    }

    /// Finds the module for `extension_id`. For version-bound entry points the
    /// version must be one of the extension's installable versions.
    pub fn resolve(
        &self,
        extension_id: &str,
        version: Option<&str>,
        entry_point: EntryPoint,
    ) -> ControllerResult<ResolvedExtension> {
        let not_found = || ControllerError::ExtensionNotFound {
            extension_id: extension_id.to_string(),
            version: version.map(str::to_string),
        };
        let module = self.repository.find_module(extension_id).ok_or_else(not_found)?;
        let extension = describe(module.as_ref())?;
        if entry_point.is_version_bound() {
            if let Some(version) = version {
                if !extension.has_version(version) {
                    return Err(not_found());
                }
            }
        }
        Ok(ResolvedExtension { module, extension })
    }

    /// Runs `call` against `resolved`, translating failures.
    ///
    /// A guard violation recorded on the context's SQL handle wins over
    /// whatever the guest returned. Panics are caught and reported as
    /// execution failures.
    pub fn invoke<T>(
        &self,
        resolved: &ResolvedExtension,
        version: Option<&str>,
        entry_point: EntryPoint,
        context: &ExtensionContext,
        call: impl FnOnce(&dyn GuestModule, &ExtensionContext) -> GuestResult<T>,
    ) -> ControllerResult<T> {
        let extension_id = resolved.extension.id.as_str();
        tracing::debug!(
            extension = extension_id,
            version,
            entry_point = entry_point.as_str(),
            "invoking guest entry point"
        );
        let outcome = catch_unwind(AssertUnwindSafe(|| {
            call(resolved.module.as_ref(), context)
        }));
        if let Some(violation) = context.sql().take_violation() {
            tracing::warn!(
                extension = extension_id,
                entry_point = entry_point.as_str(),
                error = %violation,
                "guest triggered a guard violation"
            );
            return Err(violation);
        }
        match outcome {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(error)) => Err(translate_guest_error(
                extension_id,
                version,
                entry_point,
                error,
            )),
            Err(panic) => Err(ControllerError::ExtensionExecution {
                extension_id: extension_id.to_string(),
                version: version.map(str::to_string),
                entry_point: entry_point.as_str().to_string(),
                source: GuestFailure {
                    message: format!("guest panicked: {}", panic_message(panic.as_ref())),
                    status: None,
                },
            }),
        }
    }
}

fn describe(module: &dyn GuestModule) -> ControllerResult<Extension> {
    module.describe().map_err(|error| {
        translate_guest_error(module.id(), None, EntryPoint::ListExtensions, error)
    })
}

fn translate_guest_error(
    extension_id: &str,
    version: Option<&str>,
    entry_point: EntryPoint,
    error: GuestError,
) -> ControllerError {
    if error.is_missing_entry_point() {
        return ControllerError::EntryPointMissing {
            extension_id: extension_id.to_string(),
            entry_point: entry_point.as_str().to_string(),
        };
    }
    ControllerError::ExtensionExecution {
        extension_id: extension_id.to_string(),
        version: version.map(str::to_string),
        entry_point: entry_point.as_str().to_string(),
        source: GuestFailure {
            message: error.message,
            status: error.status,
        },
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::ExecutionBridge;
    use crate::context::{BucketFsAccess, ExtensionContext};
    use crate::guest::{EntryPoint, GuestError, GuestModule, GuestResult};
    use crate::model::{Extension, ExtensionVersion};
    use crate::repository::{ModuleRepository, StaticModuleRepository};
    use extman_core::testing::RecordingConnector;
    use extman_core::{ControllerError, ErrorKind, OperationContext, TransactionContext};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    /// Wraps a repository and counts how often it is read.
    struct CountingRepository {
        inner: StaticModuleRepository,
        list_calls: AtomicUsize,
        find_calls: AtomicUsize,
    }

    impl ModuleRepository for CountingRepository {
        fn list_modules(&self) -> Vec<Arc<dyn GuestModule>> {
            self.list_calls.fetch_add(1, Ordering::SeqCst);
            self.inner.list_modules()
        }

        fn find_module(&self, extension_id: &str) -> Option<Arc<dyn GuestModule>> {
            self.find_calls.fetch_add(1, Ordering::SeqCst);
            self.inner.find_module(extension_id)
        }
    }

    struct TestGuest;

    impl GuestModule for TestGuest {
        fn id(&self) -> &str {
            "test-ext"
        }

        fn describe(&self) -> GuestResult<Extension> {
            Ok(Extension {
                id: "test-ext".to_string(),
                name: "Test".to_string(),
                description: String::new(),
                category: String::new(),
                installable_versions: vec![ExtensionVersion {
                    name: "1.0.0".to_string(),
                    latest: true,
                    deprecated: false,
                }],
                bucket_fs_uploads: Vec::new(),
            })
        }

        fn install(&self, context: &ExtensionContext, version: &str) -> GuestResult<()> {
            match version {
                "panic" => panic!("install exploded"),
                "swallow" => {
                    let _ignored = context.sql().run_query("COMMIT", &[]);
                    Ok(())
                }
                _ => Err(GuestError::new("not supported").with_status(404)),
            }
        }
    }

    fn bridge() -> ExecutionBridge {
        ExecutionBridge::new(Arc::new(
            StaticModuleRepository::new().with_module(Arc::new(TestGuest)),
        ))
    }

    fn context(connector: &RecordingConnector) -> (TransactionContext, ExtensionContext) {
        let transaction =
            TransactionContext::begin(connector, &OperationContext::new()).expect("begin");
        let context = ExtensionContext::new(
            transaction.sql_client(),
            BucketFsAccess::new("/buckets/", Arc::new(connector.clone()), OperationContext::new()),
        );
        (transaction, context)
    }

    #[test]
    fn unit_resolve_rejects_unknown_id_and_version() {
        let bridge = bridge();
        let error = bridge
            .resolve("missing", Some("1.0.0"), EntryPoint::Install)
            .err()
            .expect("unknown id");
        assert_eq!(error.kind(), ErrorKind::ExtensionNotFound);

        let error = bridge
            .resolve("test-ext", Some("2.0.0"), EntryPoint::Install)
            .err()
            .expect("unknown version");
        assert_eq!(
            error.to_string(),
            "extension 'test-ext' in version '2.0.0' not found"
        );

        bridge
            .resolve("test-ext", Some("0.9.0"), EntryPoint::Uninstall)
            .expect("uninstall is not version bound");
    }

    #[test]
    fn regression_resolve_all_reads_repository_once() {
        let repository = Arc::new(CountingRepository {
            inner: StaticModuleRepository::new().with_module(Arc::new(TestGuest)),
            list_calls: AtomicUsize::new(0),
            find_calls: AtomicUsize::new(0),
        });
        let bridge = ExecutionBridge::new(repository.clone());
        let resolved = bridge.resolve_all().expect("resolve all");
        assert_eq!(resolved.len(), 1);
        assert_eq!(resolved[0].extension.id, "test-ext");
        assert_eq!(repository.list_calls.load(Ordering::SeqCst), 1);
        assert_eq!(repository.find_calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn unit_guest_error_becomes_extension_execution_with_status() {
        let bridge = bridge();
        let connector = RecordingConnector::new();
        let (transaction, context) = context(&connector);
        let resolved = bridge
            .resolve("test-ext", Some("1.0.0"), EntryPoint::Install)
            .expect("resolve");
        let error = bridge
            .invoke(&resolved, Some("1.0.0"), EntryPoint::Install, &context, |module, context| {
                module.install(context, "1.0.0")
            })
            .expect_err("guest error");
        match error {
            ControllerError::ExtensionExecution {
                entry_point,
                source,
                ..
            } => {
                assert_eq!(entry_point, "install");
                assert_eq!(source.status, Some(404));
                assert_eq!(source.message, "not supported");
            }
            other => panic!("unexpected {other:?}"),
        }
        transaction.rollback().expect("rollback");
    }

    #[test]
    fn unit_missing_entry_point_is_reported() {
        let bridge = bridge();
        let connector = RecordingConnector::new();
        let (transaction, context) = context(&connector);
        let resolved = bridge
            .resolve("test-ext", None, EntryPoint::Upgrade)
            .expect("resolve");
        let error = bridge
            .invoke(&resolved, None, EntryPoint::Upgrade, &context, |module, context| {
                module.upgrade(context)
            })
            .expect_err("missing");
        assert_eq!(error.kind(), ErrorKind::EntryPointMissing);
        transaction.rollback().expect("rollback");
    }

    #[test]
    fn regression_guest_panic_is_contained() {
        let bridge = bridge();
        let connector = RecordingConnector::new();
        let (transaction, context) = context(&connector);
        let resolved = bridge
            .resolve("test-ext", None, EntryPoint::Install)
            .expect("resolve");
        let error = bridge
            .invoke(&resolved, None, EntryPoint::Install, &context, |module, context| {
                module.install(context, "panic")
            })
            .expect_err("panic");
        assert_eq!(error.kind(), ErrorKind::ExtensionExecution);
        assert!(error.to_string().contains("install exploded"));
        transaction.rollback().expect("rollback");
    }

    #[test]
    fn regression_swallowed_guard_violation_takes_precedence() {
        let bridge = bridge();
        let connector = RecordingConnector::new();
        let (transaction, context) = context(&connector);
        let resolved = bridge
            .resolve("test-ext", None, EntryPoint::Install)
            .expect("resolve");
        let error = bridge
            .invoke(&resolved, None, EntryPoint::Install, &context, |module, context| {
                module.install(context, "swallow")
            })
            .expect_err("violation");
        assert_eq!(error.kind(), ErrorKind::ForbiddenStatement);
        assert!(connector.statements().is_empty());
        transaction.rollback().expect("rollback");
    }

    #[test]
    fn unit_list_extensions_describes_every_module() {
        let extensions = bridge().list_extensions().expect("list");
        assert_eq!(extensions.len(), 1);
        assert_eq!(extensions[0].installable_versions[0].name, "1.0.0");
    }
}
