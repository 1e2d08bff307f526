use super::{ControllerConfig, ExtensionController};
use extman_core::testing::{DriverCall, RecordingConnector};
use extman_core::{
    CancellationToken, ControllerError, ErrorKind, OperationContext, ParameterDefinition,
    ParameterValue, SharedConnector, SqlValue, SqliteConnector,
};
use extman_extensions::{
    Extension, ExtensionContext, ExtensionVersion, GuestError, GuestModule, GuestResult,
    Installation, Instance, StaticModuleRepository, UpgradeResult,
};
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tempfile::tempdir;

fn extension(id: &str, versions: &[&str]) -> Extension {
    Extension {
        id: id.to_string(),
        name: format!("{id} extension"),
        description: String::new(),
        category: "testing".to_string(),
        installable_versions: versions
            .iter()
            .map(|name| ExtensionVersion {
                name: name.to_string(),
                latest: false,
                deprecated: false,
            })
            .collect(),
        bucket_fs_uploads: Vec::new(),
    }
}

/// Guest with a fixed set of installed versions that counts `addInstance` calls.
struct SpyGuest {
    id: &'static str,
    installed: Vec<&'static str>,
    install_statement: &'static str,
    list_bucketfs_on_install: bool,
    add_instance_calls: AtomicUsize,
}

impl SpyGuest {
    fn new(id: &'static str, installed: Vec<&'static str>) -> Self {
        Self {
            id,
            installed,
            install_statement: "CREATE SCHEMA EXT",
            list_bucketfs_on_install: false,
            add_instance_calls: AtomicUsize::new(0),
        }
    }
}

impl GuestModule for SpyGuest {
    fn id(&self) -> &str {
        self.id
    }

    fn describe(&self) -> GuestResult<Extension> {
        Ok(extension(self.id, &["1.0.0", "2.0.0"]))
    }

    fn find_installations(&self, _context: &ExtensionContext) -> GuestResult<Vec<Installation>> {
        Ok(self
            .installed
            .iter()
            .map(|version| Installation {
                id: String::new(),
                name: format!("{} extension", self.id),
                version: version.to_string(),
                instance_parameters: Vec::new(),
            })
            .collect())
    }

    fn install(&self, context: &ExtensionContext, _version: &str) -> GuestResult<()> {
        if self.list_bucketfs_on_install {
            context.bucketfs().list_files()?;
        }
        context.sql().run_query(self.install_statement, &[])?;
        Ok(())
    }

    fn uninstall(&self, context: &ExtensionContext, version: &str) -> GuestResult<()> {
        context
            .sql()
            .run_query("DROP SCRIPT EXT.IMPORT", &[SqlValue::from(version)])?;
        Ok(())
    }

    fn upgrade(&self, _context: &ExtensionContext) -> GuestResult<UpgradeResult> {
        Ok(UpgradeResult {
            previous_version: "1.0.0".to_string(),
            new_version: "2.0.0".to_string(),
        })
    }

    fn parameter_definitions(
        &self,
        _context: &ExtensionContext,
        _version: &str,
    ) -> GuestResult<Vec<ParameterDefinition>> {
        Ok(vec![ParameterDefinition {
            id: "vs-name".to_string(),
            name: "Virtual Schema name".to_string(),
            raw_definition: json!({"id": "vs-name", "type": "string", "required": true}),
        }])
    }

    fn add_instance(
        &self,
        _context: &ExtensionContext,
        _version: &str,
        parameters: &[ParameterValue],
    ) -> GuestResult<Instance> {
        self.add_instance_calls.fetch_add(1, Ordering::SeqCst);
        let name = parameters
            .iter()
            .find(|parameter| parameter.name == "vs-name")
            .map(|parameter| parameter.value.clone())
            .ok_or_else(|| GuestError::new("missing vs-name"))?;
        Ok(Instance {
            id: name.clone(),
            name,
        })
    }

    fn find_instances(
        &self,
        _context: &ExtensionContext,
        _version: &str,
    ) -> GuestResult<Vec<Instance>> {
        Ok(vec![Instance {
            id: "vs1".to_string(),
            name: "vs1".to_string(),
        }])
    }
}

fn controller_with(guests: Vec<Arc<dyn GuestModule>>) -> ExtensionController {
    let repository = StaticModuleRepository::new();
    for guest in guests {
        repository.register(guest);
    }
    ExtensionController::new(Arc::new(repository), ControllerConfig::default())
}

fn recording_db() -> (RecordingConnector, SharedConnector) {
    let connector = RecordingConnector::new();
    let shared: SharedConnector = Arc::new(connector.clone());
    (connector, shared)
}

#[test]
fn unit_get_all_extensions_lists_repository_without_database() {
    let controller = controller_with(vec![
        Arc::new(SpyGuest::new("b-ext", vec![])),
        Arc::new(SpyGuest::new("a-ext", vec![])),
    ]);
    let extensions = controller
        .get_all_extensions(&OperationContext::new())
        .expect("extensions");
    let ids = extensions
        .iter()
        .map(|extension| extension.id.as_str())
        .collect::<Vec<_>>();
    assert_eq!(ids, vec!["a-ext", "b-ext"]);
}

#[test]
fn functional_install_commits_single_transaction() {
    let controller = controller_with(vec![Arc::new(SpyGuest::new("ext", vec![]))]);
    let (connector, db) = recording_db();
    controller
        .install_extension(&OperationContext::new(), &db, "ext", "1.0.0")
        .expect("install");
    assert_eq!(connector.connection_ids(), vec![1]);
    assert_eq!(
        connector.calls_for(1),
        vec![
            DriverCall::Connect,
            DriverCall::Begin,
            DriverCall::Execute {
                statement: "CREATE SCHEMA EXT".to_string(),
                params: Vec::new(),
            },
            DriverCall::Commit,
            DriverCall::Close,
        ]
    );
}

#[test]
fn unit_unknown_extension_or_version_never_opens_a_transaction() {
    let controller = controller_with(vec![Arc::new(SpyGuest::new("ext", vec![]))]);
    let (connector, db) = recording_db();
    let error = controller
        .install_extension(&OperationContext::new(), &db, "missing", "1.0.0")
        .expect_err("unknown id");
    assert_eq!(error.kind(), ErrorKind::ExtensionNotFound);
    let error = controller
        .install_extension(&OperationContext::new(), &db, "ext", "9.9.9")
        .expect_err("unknown version");
    assert_eq!(error.kind(), ErrorKind::ExtensionNotFound);
    assert!(connector.events().is_empty());
}

#[test]
fn regression_forbidden_statement_propagates_unchanged_and_rolls_back() {
    let mut guest = SpyGuest::new("ext", vec![]);
    guest.install_statement = "\t\r\n ; COMMIT \t\r\n ; ";
    let controller = controller_with(vec![Arc::new(guest)]);
    let (connector, db) = recording_db();
    let error = controller
        .install_extension(&OperationContext::new(), &db, "ext", "1.0.0")
        .expect_err("forbidden");
    match error {
        ControllerError::ForbiddenStatement { statement, command } => {
            assert_eq!(statement, "\t\r\n ; COMMIT \t\r\n ; ");
            assert_eq!(command, "commit");
        }
        other => panic!("unexpected {other:?}"),
    }
    let calls = connector.calls_for(1);
    assert!(connector.statements().is_empty());
    assert!(!calls.contains(&DriverCall::Commit));
    assert_eq!(&calls[calls.len() - 2..], &[DriverCall::Rollback, DriverCall::Close]);
}

#[test]
fn regression_create_instance_validation_failure_never_reaches_add_instance() {
    let guest = Arc::new(SpyGuest::new("ext", vec!["1.0.0"]));
    let controller = controller_with(vec![guest.clone()]);
    let (connector, db) = recording_db();
    let error = controller
        .create_instance(&OperationContext::new(), &db, "ext", "1.0.0", &[])
        .expect_err("validation");
    assert_eq!(error.kind(), ErrorKind::Validation);
    assert_eq!(
        error.to_string(),
        "invalid parameters: Failed to validate parameter 'Virtual Schema name' (vs-name): This is a required parameter."
    );
    assert_eq!(guest.add_instance_calls.load(Ordering::SeqCst), 0);
    let calls = connector.calls_for(1);
    assert!(calls.contains(&DriverCall::Rollback));
    assert!(!calls.contains(&DriverCall::Commit));
}

#[test]
fn functional_create_instance_returns_guest_instance() {
    let guest = Arc::new(SpyGuest::new("ext", vec!["1.0.0"]));
    let controller = controller_with(vec![guest.clone()]);
    let (connector, db) = recording_db();
    let instance = controller
        .create_instance(
            &OperationContext::new(),
            &db,
            "ext",
            "1.0.0",
            &[ParameterValue::new("vs-name", "MY_VS")],
        )
        .expect("instance");
    assert_eq!(instance.name, "MY_VS");
    assert_eq!(guest.add_instance_calls.load(Ordering::SeqCst), 1);
    assert!(connector.calls_for(1).contains(&DriverCall::Commit));
}

#[test]
fn unit_operations_on_missing_installation_report_not_installed() {
    let guest = Arc::new(SpyGuest::new("ext", vec!["1.0.0"]));
    let controller = controller_with(vec![guest.clone()]);
    let (_connector, db) = recording_db();
    let operation = OperationContext::new();

    let error = controller
        .uninstall_extension(&operation, &db, "ext", "2.0.0")
        .expect_err("not installed");
    assert_eq!(error.kind(), ErrorKind::NotInstalled);
    assert_eq!(
        error.to_string(),
        "extension 'ext' is not installed in version '2.0.0'"
    );

    let error = controller
        .create_instance(
            &operation,
            &db,
            "ext",
            "2.0.0",
            &[ParameterValue::new("vs-name", "MY_VS")],
        )
        .expect_err("not installed");
    assert_eq!(error.kind(), ErrorKind::NotInstalled);
    assert_eq!(guest.add_instance_calls.load(Ordering::SeqCst), 0);

    let error = controller
        .find_instances(&operation, &db, "ext", "2.0.0")
        .expect_err("not installed");
    assert_eq!(error.kind(), ErrorKind::NotInstalled);

    let error = controller
        .delete_instance(&operation, &db, "ext", "2.0.0", "vs1")
        .expect_err("not installed");
    assert_eq!(error.kind(), ErrorKind::NotInstalled);

    let untouched = controller_with(vec![Arc::new(SpyGuest::new("ext", vec![]))]);
    let error = untouched
        .upgrade_extension(&operation, &db, "ext")
        .expect_err("nothing installed");
    assert_eq!(error.to_string(), "extension 'ext' is not installed");
}

#[test]
fn functional_upgrade_and_find_instances_return_guest_results() {
    let controller = controller_with(vec![Arc::new(SpyGuest::new("ext", vec!["1.0.0"]))]);
    let (_connector, db) = recording_db();
    let operation = OperationContext::new();
    let upgrade = controller
        .upgrade_extension(&operation, &db, "ext")
        .expect("upgrade");
    assert_eq!(upgrade.previous_version, "1.0.0");
    assert_eq!(upgrade.new_version, "2.0.0");
    let instances = controller
        .find_instances(&operation, &db, "ext", "1.0.0")
        .expect("instances");
    assert_eq!(instances[0].id, "vs1");
}

#[test]
fn unit_delete_instance_without_entry_point_is_entry_point_missing() {
    let controller = controller_with(vec![Arc::new(SpyGuest::new("ext", vec!["1.0.0"]))]);
    let (connector, db) = recording_db();
    let error = controller
        .delete_instance(&OperationContext::new(), &db, "ext", "1.0.0", "vs1")
        .expect_err("missing entry point");
    assert_eq!(error.kind(), ErrorKind::EntryPointMissing);
    assert!(!connector.calls_for(1).contains(&DriverCall::Commit));
}

#[test]
fn functional_get_all_installations_fills_extension_ids() {
    let controller = controller_with(vec![
        Arc::new(SpyGuest::new("a-ext", vec!["1.0.0"])),
        Arc::new(SpyGuest::new("b-ext", vec!["2.0.0"])),
    ]);
    let (connector, db) = recording_db();
    let installations = controller
        .get_all_installations(&OperationContext::new(), &db)
        .expect("installations");
    let summary = installations
        .iter()
        .map(|installation| (installation.id.as_str(), installation.version.as_str()))
        .collect::<Vec<_>>();
    assert_eq!(summary, vec![("a-ext", "1.0.0"), ("b-ext", "2.0.0")]);
    assert_eq!(connector.connection_ids(), vec![1]);
}

#[test]
fn functional_get_parameter_definitions_passes_definition_through() {
    let controller = controller_with(vec![Arc::new(SpyGuest::new("ext", vec![]))]);
    let (_connector, db) = recording_db();
    let definitions = controller
        .get_parameter_definitions(&OperationContext::new(), &db, "ext", "1.0.0")
        .expect("definitions");
    assert_eq!(definitions[0].raw_definition["type"], "string");
}

#[test]
fn regression_bucketfs_scanner_is_closed_before_operation_commits() {
    let mut guest = SpyGuest::new("ext", vec![]);
    guest.list_bucketfs_on_install = true;
    let controller = controller_with(vec![Arc::new(guest)]);
    let (connector, db) = recording_db();
    controller
        .install_extension(&OperationContext::new(), &db, "ext", "1.0.0")
        .expect("install");

    let events = connector.events();
    let position = |connection: u64, call: DriverCall| {
        events
            .iter()
            .position(|event| event.connection == connection && event.call == call)
            .expect("event present")
    };
    assert_eq!(connector.connection_ids(), vec![1, 2]);
    assert!(position(2, DriverCall::Rollback) < position(1, DriverCall::Commit));
    assert!(!connector.calls_for(2).contains(&DriverCall::Commit));
}

#[test]
fn unit_cancelled_operation_does_not_touch_database() {
    let controller = controller_with(vec![Arc::new(SpyGuest::new("ext", vec![]))]);
    let (connector, db) = recording_db();
    let token = CancellationToken::new();
    token.cancel();
    let error = controller
        .install_extension(&OperationContext::new().with_token(token), &db, "ext", "1.0.0")
        .expect_err("cancelled");
    assert_eq!(error.kind(), ErrorKind::Cancelled);
    assert!(connector.events().is_empty());
}

#[test]
fn integration_concurrent_operations_keep_per_connection_order() {
    let controller = controller_with(vec![Arc::new(SpyGuest::new("ext", vec![]))]);
    let (connector, db) = recording_db();
    let handles = (0..8)
        .map(|_| {
            let controller = controller.clone();
            let db = Arc::clone(&db);
            std::thread::spawn(move || {
                controller.install_extension(&OperationContext::new(), &db, "ext", "1.0.0")
            })
        })
        .collect::<Vec<_>>();
    for handle in handles {
        handle.join().expect("join").expect("install");
    }

    let ids = connector.connection_ids();
    assert_eq!(ids.len(), 8);
    for id in ids {
        assert_eq!(
            connector.calls_for(id),
            vec![
                DriverCall::Connect,
                DriverCall::Begin,
                DriverCall::Execute {
                    statement: "CREATE SCHEMA EXT".to_string(),
                    params: Vec::new(),
                },
                DriverCall::Commit,
                DriverCall::Close,
            ],
            "connection {id}"
        );
    }
}

/// Guest keeping its installation state in a SQLite table.
struct SqliteGuest;

impl SqliteGuest {
    fn ensure_table(context: &ExtensionContext) -> GuestResult<()> {
        context.sql().run_query(
            "CREATE TABLE IF NOT EXISTS ext_installations (version TEXT NOT NULL)",
            &[],
        )?;
        Ok(())
    }
}

impl GuestModule for SqliteGuest {
    fn id(&self) -> &str {
        "sqlite-ext"
    }

    fn describe(&self) -> GuestResult<Extension> {
        Ok(extension("sqlite-ext", &["1.0.0"]))
    }

    fn find_installations(&self, context: &ExtensionContext) -> GuestResult<Vec<Installation>> {
        Self::ensure_table(context)?;
        let result = context
            .sql()
            .query("SELECT version FROM ext_installations ORDER BY version", &[])?;
        Ok(result
            .rows
            .iter()
            .filter_map(|row| row.first().and_then(SqlValue::as_str))
            .map(|version| Installation {
                id: String::new(),
                name: "SQLite extension".to_string(),
                version: version.to_string(),
                instance_parameters: Vec::new(),
            })
            .collect())
    }

    fn install(&self, context: &ExtensionContext, version: &str) -> GuestResult<()> {
        Self::ensure_table(context)?;
        context.sql().run_query(
            "INSERT INTO ext_installations (version) VALUES (?)",
            &[SqlValue::from(version)],
        )?;
        Ok(())
    }

    fn uninstall(&self, context: &ExtensionContext, version: &str) -> GuestResult<()> {
        context.sql().run_query(
            "DELETE FROM ext_installations WHERE version = ?",
            &[SqlValue::from(version)],
        )?;
        Ok(())
    }
}

#[test]
fn integration_install_list_uninstall_round_trip_on_sqlite() {
    let temp = tempdir().expect("tempdir");
    let db: SharedConnector = Arc::new(SqliteConnector::new(temp.path().join("target.sqlite")));
    let controller = controller_with(vec![Arc::new(SqliteGuest)]);
    let operation = OperationContext::new();

    assert!(controller
        .get_all_installations(&operation, &db)
        .expect("empty")
        .is_empty());

    controller
        .install_extension(&operation, &db, "sqlite-ext", "1.0.0")
        .expect("install");
    let installations = controller
        .get_all_installations(&operation, &db)
        .expect("installations");
    assert_eq!(installations.len(), 1);
    assert_eq!(installations[0].id, "sqlite-ext");
    assert_eq!(installations[0].version, "1.0.0");

    controller
        .uninstall_extension(&operation, &db, "sqlite-ext", "1.0.0")
        .expect("uninstall");
    assert!(controller
        .get_all_installations(&operation, &db)
        .expect("after uninstall")
        .is_empty());

    let error = controller
        .uninstall_extension(&operation, &db, "sqlite-ext", "1.0.0")
        .expect_err("second uninstall");
    assert_eq!(error.kind(), ErrorKind::NotInstalled);
}

#[test]
fn regression_failed_install_leaves_no_trace_on_sqlite() {
    struct FailingGuest;

    impl GuestModule for FailingGuest {
        fn id(&self) -> &str {
            "sqlite-ext"
        }

        fn describe(&self) -> GuestResult<Extension> {
            SqliteGuest.describe()
        }

        fn find_installations(
            &self,
            context: &ExtensionContext,
        ) -> GuestResult<Vec<Installation>> {
            SqliteGuest.find_installations(context)
        }

        fn install(&self, context: &ExtensionContext, version: &str) -> GuestResult<()> {
            SqliteGuest.install(context, version)?;
            Err(GuestError::new("adapter jar missing"))
        }
    }

    let temp = tempdir().expect("tempdir");
    let db: SharedConnector = Arc::new(SqliteConnector::new(temp.path().join("target.sqlite")));
    let operation = OperationContext::new();
    let failing = controller_with(vec![Arc::new(FailingGuest)]);
    let error = failing
        .install_extension(&operation, &db, "sqlite-ext", "1.0.0")
        .expect_err("guest failure");
    assert_eq!(error.kind(), ErrorKind::ExtensionExecution);

    let controller = controller_with(vec![Arc::new(SqliteGuest)]);
    assert!(controller
        .get_all_installations(&operation, &db)
        .expect("installations")
        .is_empty());
}
