//! Extension controller: the public operation surface of the extension manager.
//!
//! Every operation that touches the database opens exactly one transaction,
//! runs the guest entry points inside it, and commits only when everything
//! succeeded. Errors are returned unchanged from the layer that raised them.

use std::sync::Arc;

use extman_core::{
    run_in_transaction, validate_parameters, ControllerError, ControllerResult,
    OperationContext, ParameterDefinition, ParameterValue, SharedConnector,
};
use extman_extensions::{
    BucketFsAccess, EntryPoint, ExecutionBridge, Extension, ExtensionContext, Installation,
    Instance, ModuleRepository, ResolvedExtension, UpgradeResult,
};
use serde::{Deserialize, Serialize};

/// Default BucketFS location scanned for extension artifacts.
pub const DEFAULT_BUCKETFS_BASE_PATH: &str = "/buckets/bfsdefault/default/";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControllerConfig {
    pub bucketfs_base_path: String,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            bucketfs_base_path: DEFAULT_BUCKETFS_BASE_PATH.to_string(),
        }
    }
}

/// Lifecycle operations over the extensions of one module repository.
#[derive(Clone)]
pub struct ExtensionController {
    bridge: ExecutionBridge,
    config: ControllerConfig,
}

impl ExtensionController {
    pub fn new(repository: Arc<dyn ModuleRepository>, config: ControllerConfig) -> Self {
        Self {
            bridge: ExecutionBridge::new(repository),
            config,
        }
    }

    /// Lists every available extension. Does not touch the database.
    #[tracing::instrument(name = "extman.controller.get_all_extensions", skip_all)]
    pub fn get_all_extensions(
        &self,
        operation: &OperationContext,
    ) -> ControllerResult<Vec<Extension>> {
        operation.check()?;
        self.bridge.list_extensions()
    }

    /// Collects the installations of every extension in one transaction.
    #[tracing::instrument(name = "extman.controller.get_all_installations", skip_all)]
    pub fn get_all_installations(
        &self,
        operation: &OperationContext,
        db: &SharedConnector,
    ) -> ControllerResult<Vec<Installation>> {
        let resolved = self.bridge.resolve_all()?;
        let installations = self.in_transaction(operation, db, |context| {
            let mut installations = Vec::new();
            for extension in &resolved {
                installations.extend(self.find_installations(extension, context)?);
            }
            Ok(installations)
        })?;
        tracing::debug!(installations = installations.len(), "listed installations");
        Ok(installations)
    }

    #[tracing::instrument(
        name = "extman.controller.get_parameter_definitions",
        skip_all,
        fields(extension_id = %extension_id, version = %version)
    )]
    pub fn get_parameter_definitions(
        &self,
        operation: &OperationContext,
        db: &SharedConnector,
        extension_id: &str,
        version: &str,
    ) -> ControllerResult<Vec<ParameterDefinition>> {
        let resolved = self.bridge.resolve(
            extension_id,
            Some(version),
            EntryPoint::GetParameterDefinitions,
        )?;
        self.in_transaction(operation, db, |context| {
            self.parameter_definitions(&resolved, context, version)
        })
    }

    #[tracing::instrument(
        name = "extman.controller.install_extension",
        skip_all,
        fields(extension_id = %extension_id, version = %version)
    )]
    pub fn install_extension(
        &self,
        operation: &OperationContext,
        db: &SharedConnector,
        extension_id: &str,
        version: &str,
    ) -> ControllerResult<()> {
        let resolved = self
            .bridge
            .resolve(extension_id, Some(version), EntryPoint::Install)?;
        self.in_transaction(operation, db, |context| {
            self.bridge.invoke(
                &resolved,
                Some(version),
                EntryPoint::Install,
                context,
                |module, context| module.install(context, version),
            )
        })?;
        tracing::info!(extension_id, version, "installed extension");
        Ok(())
    }

    /// Uninstalls `version`; fails with `NotInstalled` when it is not installed.
    #[tracing::instrument(
        name = "extman.controller.uninstall_extension",
        skip_all,
        fields(extension_id = %extension_id, version = %version)
    )]
    pub fn uninstall_extension(
        &self,
        operation: &OperationContext,
        db: &SharedConnector,
        extension_id: &str,
        version: &str,
    ) -> ControllerResult<()> {
        let resolved = self
            .bridge
            .resolve(extension_id, Some(version), EntryPoint::Uninstall)?;
        self.in_transaction(operation, db, |context| {
            self.ensure_installed(&resolved, context, Some(version))?;
            self.bridge.invoke(
                &resolved,
                Some(version),
                EntryPoint::Uninstall,
                context,
                |module, context| module.uninstall(context, version),
            )
        })?;
        tracing::info!(extension_id, version, "uninstalled extension");
        Ok(())
    }

    /// Upgrades the installed version to the latest one the guest supports.
    #[tracing::instrument(
        name = "extman.controller.upgrade_extension",
        skip_all,
        fields(extension_id = %extension_id)
    )]
    pub fn upgrade_extension(
        &self,
        operation: &OperationContext,
        db: &SharedConnector,
        extension_id: &str,
    ) -> ControllerResult<UpgradeResult> {
        let resolved = self
            .bridge
            .resolve(extension_id, None, EntryPoint::Upgrade)?;
        let result = self.in_transaction(operation, db, |context| {
            self.ensure_installed(&resolved, context, None)?;
            self.bridge
                .invoke(&resolved, None, EntryPoint::Upgrade, context, |module, context| {
                    module.upgrade(context)
                })
        })?;
        tracing::info!(
            extension_id,
            previous_version = %result.previous_version,
            new_version = %result.new_version,
            "upgraded extension"
        );
        Ok(result)
    }

    /// Validates `parameters` against the guest's definitions, then creates the instance.
    ///
    /// A validation failure never reaches the guest's `addInstance` entry point.
    #[tracing::instrument(
        name = "extman.controller.create_instance",
        skip_all,
        fields(extension_id = %extension_id, version = %version, parameters = parameters.len())
    )]
    pub fn create_instance(
        &self,
        operation: &OperationContext,
        db: &SharedConnector,
        extension_id: &str,
        version: &str,
        parameters: &[ParameterValue],
    ) -> ControllerResult<Instance> {
        let resolved = self
            .bridge
            .resolve(extension_id, Some(version), EntryPoint::AddInstance)?;
        let instance = self.in_transaction(operation, db, |context| {
            self.ensure_installed(&resolved, context, Some(version))?;
            let definitions = self.parameter_definitions(&resolved, context, version)?;
            validate_parameters(&definitions, parameters)?;
            self.bridge.invoke(
                &resolved,
                Some(version),
                EntryPoint::AddInstance,
                context,
                |module, context| module.add_instance(context, version, parameters),
            )
        })?;
        tracing::info!(extension_id, version, instance_id = %instance.id, "created instance");
        Ok(instance)
    }

    #[tracing::instrument(
        name = "extman.controller.find_instances",
        skip_all,
        fields(extension_id = %extension_id, version = %version)
    )]
    pub fn find_instances(
        &self,
        operation: &OperationContext,
        db: &SharedConnector,
        extension_id: &str,
        version: &str,
    ) -> ControllerResult<Vec<Instance>> {
        let resolved = self
            .bridge
            .resolve(extension_id, Some(version), EntryPoint::FindInstances)?;
        self.in_transaction(operation, db, |context| {
            self.ensure_installed(&resolved, context, Some(version))?;
            self.bridge.invoke(
                &resolved,
                Some(version),
                EntryPoint::FindInstances,
                context,
                |module, context| module.find_instances(context, version),
            )
        })
    }

    #[tracing::instrument(
        name = "extman.controller.delete_instance",
        skip_all,
        fields(extension_id = %extension_id, version = %version, instance_id = %instance_id)
    )]
    pub fn delete_instance(
        &self,
        operation: &OperationContext,
        db: &SharedConnector,
        extension_id: &str,
        version: &str,
        instance_id: &str,
    ) -> ControllerResult<()> {
        let resolved = self
            .bridge
            .resolve(extension_id, Some(version), EntryPoint::DeleteInstance)?;
        self.in_transaction(operation, db, |context| {
            self.ensure_installed(&resolved, context, Some(version))?;
            self.bridge.invoke(
                &resolved,
                Some(version),
                EntryPoint::DeleteInstance,
                context,
                |module, context| module.delete_instance(context, version, instance_id),
            )
        })?;
        tracing::info!(extension_id, version, instance_id, "deleted instance");
        Ok(())
    }

    /// Runs `body` in a fresh transaction with a guest context bound to it.
    ///
    /// The BucketFS scanner, if a guest opened one, is closed before the
    /// transaction commits or rolls back.
    fn in_transaction<T>(
        &self,
        operation: &OperationContext,
        db: &SharedConnector,
        body: impl FnOnce(&ExtensionContext) -> ControllerResult<T>,
    ) -> ControllerResult<T> {
        run_in_transaction(db.as_ref(), operation, |transaction| {
            let bucketfs = BucketFsAccess::new(
                self.config.bucketfs_base_path.clone(),
                Arc::clone(db),
                operation.clone(),
            );
            let context = ExtensionContext::new(transaction.sql_client(), bucketfs.clone());
            let outcome = body(&context);
            match (outcome, bucketfs.close()) {
                (outcome, Ok(())) => outcome,
                (Ok(value), Err(error)) => {
                    tracing::warn!(error = %error, "failed to remove BucketFS scan routine");
                    Ok(value)
                }
                (Err(error), Err(cleanup)) => Err(error.with_cleanup_failure(cleanup)),
            }
        })
    }

    fn find_installations(
        &self,
        resolved: &ResolvedExtension,
        context: &ExtensionContext,
    ) -> ControllerResult<Vec<Installation>> {
        let mut installations = self.bridge.invoke(
            resolved,
            None,
            EntryPoint::FindInstallations,
            context,
            |module, context| module.find_installations(context),
        )?;
        for installation in &mut installations {
            installation.id = resolved.extension.id.clone();
        }
        Ok(installations)
    }

    fn ensure_installed(
        &self,
        resolved: &ResolvedExtension,
        context: &ExtensionContext,
        version: Option<&str>,
    ) -> ControllerResult<()> {
        let installations = self.find_installations(resolved, context)?;
        let installed = installations.iter().any(|installation| {
            version.map_or(true, |version| installation.version == version)
        });
        if installed {
            Ok(())
        } else {
            Err(ControllerError::NotInstalled {
                extension_id: resolved.extension.id.clone(),
                version: version.map(str::to_string),
            })
        }
    }

    fn parameter_definitions(
        &self,
        resolved: &ResolvedExtension,
        context: &ExtensionContext,
        version: &str,
    ) -> ControllerResult<Vec<ParameterDefinition>> {
        self.bridge.invoke(
            resolved,
            Some(version),
            EntryPoint::GetParameterDefinitions,
            context,
            |module, context| module.parameter_definitions(context, version),
        )
    }
}

#[cfg(test)]
mod tests;
