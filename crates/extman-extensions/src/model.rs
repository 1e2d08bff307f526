//! Extension metadata and the records guests report back to the controller.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Installable database extension as described by its guest module.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Extension {
    pub id: String,
    pub name: String,
    pub description: String,
    #[serde(default)]
    pub category: String,
    pub installable_versions: Vec<ExtensionVersion>,
    #[serde(default)]
    pub bucket_fs_uploads: Vec<BucketFsUpload>,
}

impl Extension {
    pub fn has_version(&self, version: &str) -> bool {
        self.installable_versions
            .iter()
            .any(|candidate| candidate.name == version)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtensionVersion {
    pub name: String,
    #[serde(default)]
    pub latest: bool,
    #[serde(default)]
    pub deprecated: bool,
}

/// File an extension expects to find in BucketFS. Informational only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BucketFsUpload {
    pub name: String,
    pub file_name: String,
    #[serde(default)]
    pub file_size: u64,
}

/// Installed extension version found in the target database.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Installation {
    /// Extension id. Filled in by the controller, guests may leave it empty.
    #[serde(default)]
    pub id: String,
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub instance_parameters: Vec<Value>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Instance {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpgradeResult {
    pub previous_version: String,
    pub new_version: String,
}
