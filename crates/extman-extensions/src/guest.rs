//! Guest module abstraction: the lifecycle entry points every extension provides.

use std::fmt;

use extman_core::{ControllerError, ParameterDefinition, ParameterValue};
use thiserror::Error;

use crate::context::ExtensionContext;
use crate::model::{Extension, Installation, Instance, UpgradeResult};

/// Result type returned by guest entry points.
pub type GuestResult<T> = Result<T, GuestError>;

/// Lifecycle entry point of a guest module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntryPoint {
    ListExtensions,
    FindInstallations,
    Install,
    Uninstall,
    Upgrade,
    GetParameterDefinitions,
    AddInstance,
    FindInstances,
    DeleteInstance,
}

impl EntryPoint {
    /// Export name guests use for this entry point.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ListExtensions => "listExtensions",
            Self::FindInstallations => "findInstallations",
            Self::Install => "install",
            Self::Uninstall => "uninstall",
            Self::Upgrade => "upgrade",
            Self::GetParameterDefinitions => "getParameterDefinitions",
            Self::AddInstance => "addInstance",
            Self::FindInstances => "findInstances",
            Self::DeleteInstance => "deleteInstance",
        }
    }

    /// Entry points whose version argument must be one of the installable versions.
    pub fn is_version_bound(&self) -> bool {
        matches!(
            self,
            Self::Install | Self::GetParameterDefinitions | Self::AddInstance
        )
    }
}

impl fmt::Display for EntryPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failure raised by guest code.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct GuestError {
    pub message: String,
    /// HTTP-style status attached by the guest, if any.
    pub status: Option<u16>,
    missing_entry_point: Option<EntryPoint>,
}

impl GuestError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            status: None,
            missing_entry_point: None,
        }
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }

    /// The guest does not implement `entry_point`.
    pub fn missing_entry_point(entry_point: EntryPoint) -> Self {
        Self {
            message: format!("entry point '{entry_point}' is not implemented"),
            status: None,
            missing_entry_point: Some(entry_point),
        }
    }

    pub fn is_missing_entry_point(&self) -> bool {
        self.missing_entry_point.is_some()
    }
}

impl From<ControllerError> for GuestError {
    fn from(error: ControllerError) -> Self {
        Self::new(error.to_string())
    }
}

/// Extension logic supplied by a third party.
///
/// Every call receives the [`ExtensionContext`] of the current operation and
/// nothing else. Entry points a guest does not implement keep the default
/// body, which reports [`GuestError::missing_entry_point`].
pub trait GuestModule: Send + Sync {
    /// Extension id this module is registered under.
    fn id(&self) -> &str;

    /// Metadata listed by `GET /extensions`.
    fn describe(&self) -> GuestResult<Extension>;

    fn find_installations(&self, _context: &ExtensionContext) -> GuestResult<Vec<Installation>> {
        Err(GuestError::missing_entry_point(EntryPoint::FindInstallations))
    }

    fn install(&self, _context: &ExtensionContext, _version: &str) -> GuestResult<()> {
        Err(GuestError::missing_entry_point(EntryPoint::Install))
    }

    fn uninstall(&self, _context: &ExtensionContext, _version: &str) -> GuestResult<()> {
        Err(GuestError::missing_entry_point(EntryPoint::Uninstall))
    }

    fn upgrade(&self, _context: &ExtensionContext) -> GuestResult<UpgradeResult> {
        Err(GuestError::missing_entry_point(EntryPoint::Upgrade))
    }

    fn parameter_definitions(
        &self,
        _context: &ExtensionContext,
        _version: &str,
    ) -> GuestResult<Vec<ParameterDefinition>> {
        Err(GuestError::missing_entry_point(
            EntryPoint::GetParameterDefinitions,
        ))
    }

    fn add_instance(
        &self,
        _context: &ExtensionContext,
        _version: &str,
        _parameters: &[ParameterValue],
    ) -> GuestResult<Instance> {
        Err(GuestError::missing_entry_point(EntryPoint::AddInstance))
    }

    fn find_instances(
        &self,
        _context: &ExtensionContext,
        _version: &str,
    ) -> GuestResult<Vec<Instance>> {
        Err(GuestError::missing_entry_point(EntryPoint::FindInstances))
    }

    fn delete_instance(
        &self,
        _context: &ExtensionContext,
        _version: &str,
        _instance_id: &str,
    ) -> GuestResult<()> {
        Err(GuestError::missing_entry_point(EntryPoint::DeleteInstance))
    }
}
