use std::collections::HashSet;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::store::BlobStore;
use crate::volume::{RetryPolicy, download_with_retry, upload_with_retry};

/// The single authoritative record of a checkpoint. Present in the store
/// only when every volume it lists was uploaded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckpointManifest {
    pub base_name: String,
    pub volume_count: u32,
    /// Blob names, in restore order.
    pub volumes: Vec<String>,
    /// RFC 3339, UTC when written here. Informational only.
    pub created_at: String,
    /// Volume size as written in the config, e.g. `5G`. Never parsed back.
    pub volume_size_nominal: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compression: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub paths: Vec<String>,
}

pub fn manifest_blob_name(base_name: &str) -> String {
    format!("{base_name}.manifest.json")
}

impl CheckpointManifest {
    pub fn new(
        base_name: &str,
        volumes: Vec<String>,
        volume_size_nominal: &str,
        compression: Option<String>,
        paths: Vec<String>,
    ) -> Self {
        Self {
            base_name: base_name.to_string(),
            volume_count: volumes.len() as u32,
            volumes,
            created_at: chrono::Utc::now().to_rfc3339(),
            volume_size_nominal: volume_size_nominal.trim().to_string(),
            compression,
            paths,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.volume_count as usize != self.volumes.len() {
            return Err(Error::manifest_corrupt(format!(
                "manifest for '{}' declares {} volume(s) but lists {}",
                self.base_name,
                self.volume_count,
                self.volumes.len()
            )));
        }
        let mut seen = HashSet::new();
        for name in &self.volumes {
            if name.trim().is_empty() {
                return Err(Error::manifest_corrupt(format!(
                    "manifest for '{}' lists an empty volume name",
                    self.base_name
                )));
            }
            if !seen.insert(name.as_str()) {
                return Err(Error::manifest_corrupt(format!(
                    "manifest for '{}' lists volume '{name}' twice",
                    self.base_name
                )));
            }
        }
        if self.created_at.trim().is_empty() {
            return Err(Error::manifest_corrupt(format!(
                "manifest for '{}' has an empty createdAt",
                self.base_name
            )));
        }
        if chrono::DateTime::parse_from_rfc3339(&self.created_at).is_err()
            && chrono::NaiveDateTime::parse_from_str(&self.created_at, "%Y-%m-%dT%H:%M:%S%.f").is_err()
        {
            tracing::warn!(
                base = %self.base_name,
                created_at = %self.created_at,
                "manifest createdAt is not an ISO-8601 timestamp"
            );
        }
        Ok(())
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self)
            .map_err(|e| Error::msg(format!("failed to encode manifest: {e}")))
    }

    pub fn from_json(raw: &str) -> Result<Self> {
        let m: Self = serde_json::from_str(raw)
            .map_err(|e| Error::manifest_corrupt(format!("failed to parse manifest: {e}")))?;
        m.validate()?;
        Ok(m)
    }
}

pub struct ManifestManager<'a> {
    store: &'a dyn BlobStore,
    retry: RetryPolicy,
    scratch_dir: PathBuf,
}

impl<'a> ManifestManager<'a> {
    pub fn new(store: &'a dyn BlobStore, retry: RetryPolicy, scratch_dir: impl Into<PathBuf>) -> Self {
        Self {
            store,
            retry,
            scratch_dir: scratch_dir.into(),
        }
    }

    pub fn build(&self, base_name: &str, volumes: Vec<String>, size_nominal: &str) -> CheckpointManifest {
        CheckpointManifest::new(base_name, volumes, size_nominal, None, Vec::new())
    }

    /// Uploads the manifest. This is the commit point of a create.
    pub fn publish(&self, manifest: &CheckpointManifest) -> Result<()> {
        manifest.validate()?;
        let body = manifest.to_json()?;
        let name = manifest_blob_name(&manifest.base_name);

        fs::create_dir_all(&self.scratch_dir).map_err(|e| {
            Error::msg(format!("failed to create {}: {e}", self.scratch_dir.display()))
        })?;
        let mut tmp = tempfile::Builder::new()
            .prefix(".manifest.")
            .suffix(".json")
            .tempfile_in(&self.scratch_dir)
            .map_err(|e| Error::msg(format!("failed to create manifest temp file: {e}")))?;
        tmp.write_all(body.as_bytes())
            .and_then(|_| tmp.as_file().sync_all())
            .map_err(|e| Error::msg(format!("failed to write manifest temp file: {e}")))?;

        upload_with_retry(self.store, &self.retry, &name, tmp.path())?;
        tracing::info!(
            manifest = %name,
            volumes = manifest.volume_count,
            store = %self.store.describe(),
            "manifest published"
        );
        Ok(())
    }

    /// Fetches and validates the manifest for `base_name`. An absent manifest
    /// is `NotFound`; anything unreadable is `ManifestCorrupt`.
    pub fn load(&self, base_name: &str) -> Result<CheckpointManifest> {
        let name = manifest_blob_name(base_name);
        fs::create_dir_all(&self.scratch_dir).map_err(|e| {
            Error::msg(format!("failed to create {}: {e}", self.scratch_dir.display()))
        })?;
        let dl_dir = tempfile::Builder::new()
            .prefix(".manifest-dl.")
            .tempdir_in(&self.scratch_dir)
            .map_err(|e| Error::msg(format!("failed to create manifest scratch dir: {e}")))?;

        let local = download_with_retry(self.store, &self.retry, &name, dl_dir.path())?;
        let raw = read_manifest_file(&local)?;
        let manifest = CheckpointManifest::from_json(&raw)?;
        if manifest.base_name != base_name {
            return Err(Error::manifest_corrupt(format!(
                "manifest {name} names base '{}'",
                manifest.base_name
            )));
        }
        Ok(manifest)
    }

    /// Deletes the manifest blob. Absent is fine.
    pub fn remove(&self, base_name: &str) -> Result<()> {
        self.store.delete(&manifest_blob_name(base_name))
    }
}

fn read_manifest_file(path: &Path) -> Result<String> {
    let bytes = fs::read(path)
        .map_err(|e| Error::msg(format!("failed to read {}: {e}", path.display())))?;
    String::from_utf8(bytes)
        .map_err(|_| Error::manifest_corrupt(format!("manifest {} is not UTF-8", path.display())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::store::LocalStore;
    use std::time::Duration;

    fn instant() -> RetryPolicy {
        RetryPolicy {
            attempts: 2,
            delay: Duration::ZERO,
        }
    }

    fn sample() -> CheckpointManifest {
        CheckpointManifest::new(
            "web",
            vec!["web.vol0001.tar.zst".into(), "web.vol0002.tar.zst".into()],
            "5G",
            Some("zstd".into()),
            vec!["build".into()],
        )
    }

    #[test]
    fn json_uses_camel_case_fields() {
        let json = sample().to_json().expect("json");
        let v: serde_json::Value = serde_json::from_str(&json).expect("parse");
        assert_eq!(v["baseName"], "web");
        assert_eq!(v["volumeCount"], 2);
        assert_eq!(v["volumes"][1], "web.vol0002.tar.zst");
        assert_eq!(v["volumeSizeNominal"], "5G");
        assert!(v["createdAt"].as_str().is_some());
    }

    #[test]
    fn minimal_manifest_without_optional_fields_parses() {
        let raw = r#"{
            "baseName": "web",
            "volumeCount": 1,
            "volumes": ["web.vol0001.tar.zst"],
            "createdAt": "2026-01-02T03:04:05Z",
            "volumeSizeNominal": "1K"
        }"#;
        let m = CheckpointManifest::from_json(raw).expect("parse");
        assert_eq!(m.volume_size_nominal, "1K");
        assert_eq!(m.compression, None);
        assert!(m.paths.is_empty());
    }

    #[test]
    fn created_at_without_offset_is_accepted() {
        let raw = r#"{
            "baseName": "web",
            "volumeCount": 0,
            "volumes": [],
            "createdAt": "2026-01-02T03:04:05",
            "volumeSizeNominal": "5G"
        }"#;
        let m = CheckpointManifest::from_json(raw).expect("parse");
        assert_eq!(m.created_at, "2026-01-02T03:04:05");
    }

    #[test]
    fn empty_created_at_is_corrupt() {
        let mut m = sample();
        m.created_at = "  ".into();
        assert_eq!(m.validate().expect_err("empty").kind(), ErrorKind::ManifestCorrupt);
    }

    #[test]
    fn numeric_size_is_corrupt() {
        let raw = r#"{"baseName":"web","volumeCount":0,"volumes":[],"createdAt":"x","volumeSizeNominal":1024}"#;
        let err = CheckpointManifest::from_json(raw).expect_err("number");
        assert_eq!(err.kind(), ErrorKind::ManifestCorrupt);
    }

    #[test]
    fn count_mismatch_is_corrupt() {
        let mut m = sample();
        m.volume_count = 3;
        assert_eq!(m.validate().expect_err("mismatch").kind(), ErrorKind::ManifestCorrupt);
    }

    #[test]
    fn duplicate_volume_is_corrupt() {
        let mut m = sample();
        m.volumes[1] = m.volumes[0].clone();
        assert_eq!(m.validate().expect_err("dup").kind(), ErrorKind::ManifestCorrupt);
    }

    #[test]
    fn publish_then_load_through_a_store() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let store = LocalStore::new(tmp.path().join("store"));
        let mgr = ManifestManager::new(&store, instant(), tmp.path().join("scratch"));
        let m = sample();
        mgr.publish(&m).expect("publish");
        assert!(tmp.path().join("store/web.manifest.json").is_file());
        assert_eq!(mgr.load("web").expect("load"), m);
    }

    #[test]
    fn missing_manifest_is_not_found() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let store = LocalStore::new(tmp.path().join("store"));
        let mgr = ManifestManager::new(&store, instant(), tmp.path().join("scratch"));
        assert!(mgr.load("web").expect_err("absent").is_not_found());
    }

    #[test]
    fn garbage_manifest_is_corrupt() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let root = tmp.path().join("store");
        fs::create_dir_all(&root).expect("mkdir");
        fs::write(root.join("web.manifest.json"), "{not json").expect("write");
        let store = LocalStore::new(&root);
        let mgr = ManifestManager::new(&store, instant(), tmp.path().join("scratch"));
        let err = mgr.load("web").expect_err("corrupt");
        assert_eq!(err.kind(), ErrorKind::ManifestCorrupt);
    }
}
