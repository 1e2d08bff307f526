//! Extension data model, guest modules, and the execution bridge.
//!
//! Guest modules are looked up in a [`ModuleRepository`] and invoked through
//! the [`ExecutionBridge`], which only ever hands them an [`ExtensionContext`].

pub mod bridge;
pub mod context;
pub mod guest;
pub mod manifest;
pub mod model;
pub mod repository;
pub mod wasm;

pub use bridge::{ExecutionBridge, ResolvedExtension};
pub use context::{BucketFsAccess, ExtensionContext};
pub use guest::{EntryPoint, GuestError, GuestModule, GuestResult};
pub use manifest::{load_and_validate_manifest, ExtensionManifest, LoadedManifest};
pub use model::{BucketFsUpload, Extension, ExtensionVersion, Installation, Instance, UpgradeResult};
pub use repository::{DirectoryModuleRepository, ModuleRepository, StaticModuleRepository};
pub use wasm::{WasmGuestLimits, WasmGuestModule};
