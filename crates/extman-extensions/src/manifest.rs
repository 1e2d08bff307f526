//! On-disk extension manifests and their validation.

use std::collections::HashSet;
use std::fs;
use std::hash::Hash;
use std::path::{Component, Path, PathBuf};

use anyhow::{anyhow, bail, Context, Result};
use serde::{Deserialize, Serialize};

use crate::model::{BucketFsUpload, Extension, ExtensionVersion};
use crate::wasm::WasmGuestLimits;

const EXTENSION_MANIFEST_SCHEMA_VERSION: u32 = 1;
const EXTENSION_MANIFEST_FILE_NAME: &str = "extension.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
/// Manifest describing one wasm-backed extension.
pub struct ExtensionManifest {
    pub schema_version: u32,
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub category: String,
    pub versions: Vec<ManifestVersion>,
    pub entrypoint: String,
    #[serde(default)]
    pub bucketfs_uploads: Vec<ManifestUpload>,
    #[serde(default)]
    pub wasm: ManifestWasmConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ManifestVersion {
    pub name: String,
    #[serde(default)]
    pub latest: bool,
    #[serde(default)]
    pub deprecated: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ManifestUpload {
    pub name: String,
    pub file_name: String,
    #[serde(default)]
    pub file_size: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct ManifestWasmConfig {
    #[serde(default)]
    pub fuel_limit: Option<u64>,
    #[serde(default)]
    pub memory_limit_bytes: Option<u64>,
    #[serde(default)]
    pub max_response_bytes: Option<usize>,
}

impl ExtensionManifest {
    pub fn extension(&self) -> Extension {
        Extension {
            id: self.id.clone(),
            name: self.name.clone(),
            description: self.description.clone(),
            category: self.category.clone(),
            installable_versions: self
                .versions
                .iter()
                .map(|version| ExtensionVersion {
                    name: version.name.clone(),
                    latest: version.latest,
                    deprecated: version.deprecated,
                })
                .collect(),
            bucket_fs_uploads: self
                .bucketfs_uploads
                .iter()
                .map(|upload| BucketFsUpload {
                    name: upload.name.clone(),
                    file_name: upload.file_name.clone(),
                    file_size: upload.file_size,
                })
                .collect(),
        }
    }

    pub fn wasm_limits(&self) -> WasmGuestLimits {
        let defaults = WasmGuestLimits::default();
        WasmGuestLimits {
            fuel_limit: self.wasm.fuel_limit.unwrap_or(defaults.fuel_limit),
            memory_limit_bytes: self
                .wasm
                .memory_limit_bytes
                .unwrap_or(defaults.memory_limit_bytes),
            max_response_bytes: self
                .wasm
                .max_response_bytes
                .unwrap_or(defaults.max_response_bytes),
        }
    }
}

/// Manifest that passed validation, with its entrypoint resolved on disk.
#[derive(Debug, Clone)]
pub struct LoadedManifest {
    pub manifest_path: PathBuf,
    pub manifest: ExtensionManifest,
    pub module_path: PathBuf,
}

pub fn load_extension_manifest(path: &Path) -> Result<ExtensionManifest> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read extension manifest {}", path.display()))?;
    serde_json::from_str(&raw)
        .with_context(|| format!("failed to parse extension manifest {}", path.display()))
}

/// Loads, validates, and resolves the manifest at `path`.
pub fn load_and_validate_manifest(path: &Path) -> Result<LoadedManifest> {
    let manifest = load_extension_manifest(path)?;
    validate_manifest(&manifest)?;
    let module_path = resolve_extension_entrypoint(path, &manifest.entrypoint)?;
    Ok(LoadedManifest {
        manifest_path: path.to_path_buf(),
        manifest,
        module_path,
    })
}

pub fn validate_manifest(manifest: &ExtensionManifest) -> Result<()> {
    if manifest.schema_version != EXTENSION_MANIFEST_SCHEMA_VERSION {
        bail!(
            "unsupported extension manifest schema '{}': expected {}",
            manifest.schema_version,
            EXTENSION_MANIFEST_SCHEMA_VERSION
        );
    }
    validate_non_empty_field("id", &manifest.id)?;
    validate_non_empty_field("name", &manifest.name)?;
    if manifest.versions.is_empty() {
        bail!("extension manifest 'versions' must not be empty");
    }
    for version in &manifest.versions {
        validate_non_empty_field("versions.name", &version.name)?;
    }
    let version_names = manifest
        .versions
        .iter()
        .map(|version| version.name.as_str())
        .collect::<Vec<_>>();
    validate_unique(&version_names, "versions")?;
    validate_entrypoint_path(&manifest.entrypoint)?;
    validate_wasm_config(&manifest.wasm)?;
    Ok(())
}

fn validate_non_empty_field(name: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        bail!("extension manifest '{}' must not be empty", name);
    }
    Ok(())
}

fn validate_entrypoint_path(entrypoint: &str) -> Result<()> {
    let trimmed = entrypoint.trim();
    if trimmed.is_empty() {
        bail!("extension manifest 'entrypoint' must not be empty");
    }
    let path = Path::new(trimmed);
    if path.extension().and_then(|extension| extension.to_str()) != Some("wasm") {
        bail!(
            "extension manifest entrypoint '{}' must be a .wasm module",
            trimmed
        );
    }
    for component in path.components() {
        match component {
            Component::ParentDir => {
                bail!(
                    "extension manifest entrypoint '{}' must not contain parent traversals",
                    trimmed
                );
            }
            Component::Prefix(_) | Component::RootDir => {
                bail!(
                    "extension manifest entrypoint '{}' must be relative",
                    trimmed
                );
            }
            Component::CurDir | Component::Normal(_) => {}
        }
    }
    Ok(())
}

fn validate_unique<T>(entries: &[T], field_name: &str) -> Result<()>
where
    T: Eq + Hash,
{
    let mut seen = HashSet::new();
    for entry in entries {
        if !seen.insert(entry) {
            bail!(
                "extension manifest '{}' contains duplicate entries",
                field_name
            );
        }
    }
    Ok(())
}

fn validate_wasm_config(config: &ManifestWasmConfig) -> Result<()> {
    if config.fuel_limit == Some(0) {
        bail!("extension manifest wasm 'fuel_limit' must be greater than 0");
    }
    if config.memory_limit_bytes == Some(0) {
        bail!("extension manifest wasm 'memory_limit_bytes' must be greater than 0");
    }
    if config.max_response_bytes == Some(0) {
        bail!("extension manifest wasm 'max_response_bytes' must be greater than 0");
    }
    Ok(())
}

fn resolve_extension_entrypoint(manifest_path: &Path, entrypoint: &str) -> Result<PathBuf> {
    let manifest_dir = manifest_path.parent().ok_or_else(|| {
        anyhow!(
            "extension manifest path '{}' has no parent directory",
            manifest_path.display()
        )
    })?;
    let manifest_dir = manifest_dir.canonicalize().with_context(|| {
        format!(
            "failed to resolve manifest directory {}",
            manifest_dir.display()
        )
    })?;
    let candidate = manifest_dir.join(entrypoint.trim());
    let resolved = candidate.canonicalize().with_context(|| {
        format!(
            "failed to resolve extension entrypoint {}",
            candidate.display()
        )
    })?;
    if !resolved.starts_with(&manifest_dir) {
        bail!(
            "extension entrypoint '{}' resolves outside manifest directory",
            entrypoint
        );
    }
    if !resolved.is_file() {
        bail!(
            "extension entrypoint '{}' is not a regular file",
            resolved.display()
        );
    }
    Ok(resolved)
}

/// Finds `<root>/<dir>/extension.json` and `<root>/<name>.json`, sorted by path.
pub fn discover_manifest_paths(root: &Path) -> Result<Vec<PathBuf>> {
    let mut paths = Vec::new();
    let read_dir = fs::read_dir(root)
        .with_context(|| format!("failed to read extension root {}", root.display()))?;
    for entry in read_dir {
        let entry = entry
            .with_context(|| format!("failed to inspect extension root {}", root.display()))?;
        let path = entry.path();
        if path.is_dir() {
            let manifest_path = path.join(EXTENSION_MANIFEST_FILE_NAME);
            if manifest_path.is_file() {
                paths.push(manifest_path);
            }
            continue;
        }
        if path.extension().and_then(|extension| extension.to_str()) == Some("json")
            && path.is_file()
        {
            paths.push(path);
        }
    }
    paths.sort();
    Ok(paths)
}
