//! Guest module repositories keyed by extension id.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};

use crate::guest::GuestModule;
use crate::manifest::{discover_manifest_paths, load_and_validate_manifest};
use crate::wasm::WasmGuestModule;

/// Source of guest modules. Implementations reflect their backing store at call time.
pub trait ModuleRepository: Send + Sync {
    /// All modules, ordered by extension id.
    fn list_modules(&self) -> Vec<Arc<dyn GuestModule>>;

    fn find_module(&self, extension_id: &str) -> Option<Arc<dyn GuestModule>>;
}

/// In-memory repository of registered modules.
#[derive(Default)]
pub struct StaticModuleRepository {
    modules: RwLock<BTreeMap<String, Arc<dyn GuestModule>>>,
}

impl StaticModuleRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `module`, replacing any module with the same id.
    pub fn register(&self, module: Arc<dyn GuestModule>) {
        self.modules
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(module.id().to_string(), module);
    }

    pub fn with_module(self, module: Arc<dyn GuestModule>) -> Self {
        self.register(module);
        self
    }
}

impl ModuleRepository for StaticModuleRepository {
    fn list_modules(&self) -> Vec<Arc<dyn GuestModule>> {
        self.modules
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    fn find_module(&self, extension_id: &str) -> Option<Arc<dyn GuestModule>> {
        self.modules
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(extension_id)
            .cloned()
    }
}

/// Repository backed by a directory of wasm extension manifests.
///
/// Manifests are re-read on every call, so added or removed extensions are
/// visible without a restart. Invalid manifests are logged and skipped.
#[derive(Debug, Clone)]
pub struct DirectoryModuleRepository {
    root: PathBuf,
}

impl DirectoryModuleRepository {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    fn load_modules(&self) -> BTreeMap<String, Arc<dyn GuestModule>> {
        let mut modules: BTreeMap<String, Arc<dyn GuestModule>> = BTreeMap::new();
        if !self.root.is_dir() {
            tracing::warn!(root = %self.root.display(), "extension directory does not exist");
            return modules;
        }
        let manifest_paths = match discover_manifest_paths(&self.root) {
            Ok(paths) => paths,
            Err(error) => {
                tracing::warn!(root = %self.root.display(), error = %format!("{error:#}"), "failed to scan extension directory");
                return modules;
            }
        };
        for manifest_path in manifest_paths {
            let loaded = load_and_validate_manifest(&manifest_path)
                .and_then(|loaded| WasmGuestModule::from_manifest(&loaded));
            match loaded {
                Ok(module) => {
                    let id = module.id().to_string();
                    if modules.contains_key(&id) {
                        tracing::warn!(
                            manifest = %manifest_path.display(),
                            extension = %id,
                            "skipping manifest with duplicate extension id"
                        );
                        continue;
                    }
                    modules.insert(id, Arc::new(module));
                }
                Err(error) => {
                    tracing::warn!(
                        manifest = %manifest_path.display(),
                        error = %format!("{error:#}"),
                        "skipping invalid extension manifest"
                    );
                }
            }
        }
        modules
    }
}

impl ModuleRepository for DirectoryModuleRepository {
    fn list_modules(&self) -> Vec<Arc<dyn GuestModule>> {
        self.load_modules().into_values().collect()
    }

    fn find_module(&self, extension_id: &str) -> Option<Arc<dyn GuestModule>> {
        self.load_modules().remove(extension_id)
    }
}

#[cfg(test)]
mod tests {
    use super::{DirectoryModuleRepository, ModuleRepository, StaticModuleRepository};
    use crate::guest::{GuestModule, GuestResult};
    use crate::model::Extension;
    use serde_json::json;
    use std::fs;
    use std::path::Path;
    use std::sync::Arc;
    use tempfile::tempdir;

    struct NamedModule(&'static str);

    impl GuestModule for NamedModule {
        fn id(&self) -> &str {
            self.0
        }

        fn describe(&self) -> GuestResult<Extension> {
            Ok(Extension {
                id: self.0.to_string(),
                name: self.0.to_string(),
                description: String::new(),
                category: String::new(),
                installable_versions: Vec::new(),
                bucket_fs_uploads: Vec::new(),
            })
        }
    }

    fn write_extension(root: &Path, dir: &str, id: &str) {
        let dir = root.join(dir);
        fs::create_dir_all(&dir).expect("create dir");
        let wasm = wat::parse_str(r#"(module (memory (export "memory") 1))"#).expect("wat");
        fs::write(dir.join("guest.wasm"), wasm).expect("write wasm");
        let manifest = json!({
            "schema_version": 1,
            "id": id,
            "name": format!("{id} extension"),
            "versions": [{"name": "1.0.0", "latest": true}],
            "entrypoint": "guest.wasm"
        });
        fs::write(
            dir.join("extension.json"),
            serde_json::to_vec(&manifest).expect("json"),
        )
        .expect("write manifest");
    }

    #[test]
    fn unit_static_repository_orders_by_id_and_replaces_duplicates() {
        let repository = StaticModuleRepository::new()
            .with_module(Arc::new(NamedModule("b")))
            .with_module(Arc::new(NamedModule("a")));
        repository.register(Arc::new(NamedModule("a")));
        let ids = repository
            .list_modules()
            .iter()
            .map(|module| module.id().to_string())
            .collect::<Vec<_>>();
        assert_eq!(ids, vec!["a", "b"]);
        assert!(repository.find_module("a").is_some());
        assert!(repository.find_module("c").is_none());
    }

    #[test]
    fn functional_directory_repository_reflects_directory_contents_per_call() {
        let temp = tempdir().expect("tempdir");
        let repository = DirectoryModuleRepository::new(temp.path());
        assert!(repository.list_modules().is_empty());

        write_extension(temp.path(), "first", "first-ext");
        assert_eq!(repository.list_modules().len(), 1);

        write_extension(temp.path(), "second", "second-ext");
        let module = repository.find_module("second-ext").expect("second");
        let extension = module.describe().expect("describe");
        assert_eq!(extension.name, "second-ext extension");
        assert_eq!(repository.list_modules().len(), 2);

        fs::remove_dir_all(temp.path().join("first")).expect("remove");
        assert!(repository.find_module("first-ext").is_none());
    }

    #[test]
    fn regression_invalid_manifest_is_skipped() {
        let temp = tempdir().expect("tempdir");
        write_extension(temp.path(), "good", "good-ext");
        fs::write(temp.path().join("broken.json"), "{not json").expect("write");
        let repository = DirectoryModuleRepository::new(temp.path());
        let ids = repository
            .list_modules()
            .iter()
            .map(|module| module.id().to_string())
            .collect::<Vec<_>>();
        assert_eq!(ids, vec!["good-ext"]);
    }

    #[test]
    fn unit_missing_root_yields_no_modules() {
        let temp = tempdir().expect("tempdir");
        let repository = DirectoryModuleRepository::new(temp.path().join("absent"));
        assert!(repository.list_modules().is_empty());
    }
}
