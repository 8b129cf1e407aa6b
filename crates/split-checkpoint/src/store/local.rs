use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use super::{BlobStore, check_blob_name, required_setting};
use crate::config::ConfigDoc;
use crate::error::{Error, Result};

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct LocalBackendConfig {
    pub dir: String,
    pub dir_env: Option<String>,
}

/// A plain directory standing in for remote storage (a mounted share, or a
/// scratch directory in tests).
#[derive(Debug, Clone)]
pub struct LocalStore {
    root: PathBuf,
}

impl LocalStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn from_config(doc: &ConfigDoc, cfg_name: &str, cfg: &LocalBackendConfig) -> Result<Self> {
        let dir = required_setting(
            &format!("store.local.{cfg_name}.dir"),
            Some(cfg.dir.as_str()),
            cfg.dir_env.as_deref(),
        )?;
        Ok(Self::new(doc.resolve_path(&dir)))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn blob_path(&self, name: &str) -> Result<PathBuf> {
        check_blob_name(name)?;
        Ok(self.root.join(name))
    }
}

impl BlobStore for LocalStore {
    fn describe(&self) -> String {
        format!("local:{}", self.root.display())
    }

    fn upload(&self, name: &str, local_path: &Path) -> Result<()> {
        let dst = self.blob_path(name)?;
        fs::create_dir_all(&self.root)
            .map_err(|e| Error::msg(format!("failed to create {}: {e}", self.root.display())))?;
        // Copy under a temp name first so a reader never sees a half-written blob.
        let tmp = self.root.join(format!(".{name}.partial.{}", std::process::id()));
        fs::copy(local_path, &tmp).map_err(|e| {
            Error::msg(format!(
                "failed to copy {} -> {}: {e}",
                local_path.display(),
                tmp.display()
            ))
        })?;
        fs::rename(&tmp, &dst).map_err(|e| {
            let _ = fs::remove_file(&tmp);
            Error::msg(format!("failed to publish {}: {e}", dst.display()))
        })?;
        Ok(())
    }

    fn download(&self, name: &str, dest_dir: &Path) -> Result<PathBuf> {
        let src = self.blob_path(name)?;
        if !src.is_file() {
            return Err(Error::not_found(format!(
                "blob '{name}' not found in {}",
                self.root.display()
            )));
        }
        fs::create_dir_all(dest_dir)
            .map_err(|e| Error::msg(format!("failed to create {}: {e}", dest_dir.display())))?;
        let out = dest_dir.join(name);
        fs::copy(&src, &out).map_err(|e| {
            Error::msg(format!(
                "failed to copy {} -> {}: {e}",
                src.display(),
                out.display()
            ))
        })?;
        Ok(out)
    }

    fn delete(&self, name: &str) -> Result<()> {
        let path = self.blob_path(name)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::msg(format!("failed to delete {}: {e}", path.display()))),
        }
    }
}
