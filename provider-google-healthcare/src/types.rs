//! Healthcare API response types

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Study Instance UID attribute tag.
pub const STUDY_INSTANCE_UID_TAG: &str = "0020000D";

/// A study available for download.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RemoteObjectRef {
    /// Study Instance UID
    pub remote_id: String,
    /// WADO-RS URL of the whole study
    pub url: String,
}

/// `dicomStores.list` response.
///
/// See: https://cloud.google.com/healthcare-api/docs/reference/rest/v1/projects.locations.datasets.dicomStores/list
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DicomStoreList {
    #[serde(default)]
    pub dicom_stores: Vec<DicomStore>,
    #[serde(default)]
    pub next_page_token: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DicomStore {
    /// Full resource name, `projects/.../dicomStores/{id}`
    pub name: String,
}

impl DicomStore {
    /// Last path segment of the resource name.
    pub fn short_name(&self) -> &str {
        self.name.rsplit('/').next().unwrap_or(&self.name)
    }
}

/// Study Instance UID of one QIDO-RS result, if present.
///
/// Results are DICOM JSON objects: `{"0020000D": {"vr": "UI", "Value": ["1.2.3"]}}`.
pub fn study_instance_uid(result: &Value) -> Option<&str> {
    result
        .get(STUDY_INSTANCE_UID_TAG)?
        .get("Value")?
        .get(0)?
        .as_str()
        .filter(|uid| !uid.is_empty())
}
