//! Top-level create/restore flows for one named checkpoint.

use std::fs;
use std::path::{Path, PathBuf};

use crate::archive::ArchiveEngine;
use crate::codec::{Codec, ZstdCli};
use crate::config::{CheckpointConfig, ConfigDoc};
use crate::error::{Error, Result};
use crate::manifest::{CheckpointManifest, ManifestManager};
use crate::process::ProcessRunner;
use crate::store::{self, BlobStore};
use crate::volume::{RetryPolicy, VolumeProcessor, volume_blob_name};

/// Holds configuration and backends only; no state survives between calls.
pub struct Checkpointer {
    cfg: CheckpointConfig,
    store: Box<dyn BlobStore>,
    codec: Box<dyn Codec>,
    runner: ProcessRunner,
    engine: ArchiveEngine,
}

impl Checkpointer {
    pub fn new(cfg: CheckpointConfig, store: Box<dyn BlobStore>, codec: Box<dyn Codec>) -> Result<Self> {
        cfg.validate()?;
        let engine = ArchiveEngine::new(cfg.tar_program.clone(), cfg.remove_source_files);
        Ok(Self {
            cfg,
            store,
            codec,
            runner: ProcessRunner::new(),
            engine,
        })
    }

    pub fn from_config(doc: &ConfigDoc) -> Result<Self> {
        let cfg = doc.checkpoint()?;
        let store = store::from_config(doc)?;
        let codec: Box<dyn Codec> = Box::new(ZstdCli::from_config(&cfg.compression));
        Self::new(cfg, store, codec)
    }

    pub fn config(&self) -> &CheckpointConfig {
        &self.cfg
    }

    pub fn base_name(&self) -> &str {
        self.cfg.base_name.trim()
    }

    pub fn store(&self) -> &dyn BlobStore {
        self.store.as_ref()
    }

    fn retry(&self) -> RetryPolicy {
        RetryPolicy::from(&self.cfg.retry)
    }

    fn volume_dir(&self) -> PathBuf {
        self.cfg.volume_dir_path()
    }

    // Only the default scratch dir is ours to remove; a configured one is left.
    fn release_volume_dir(&self, volume_dir: &Path) {
        if self.cfg.volume_dir.is_none() {
            let _ = fs::remove_dir(volume_dir);
        }
    }

    fn manifests(&self) -> ManifestManager<'_> {
        ManifestManager::new(self.store.as_ref(), self.retry(), self.volume_dir())
    }

    /// Verifies every external program this checkpointer shells out to.
    pub fn preflight(&self) -> Result<()> {
        self.engine.check_available(&self.runner)?;
        self.codec.check_available()?;
        for tool in self.store.required_tools() {
            self.runner.require_present(tool)?;
        }
        Ok(())
    }

    /// Archives `paths` (relative to `working_dir`) into a new checkpoint,
    /// replacing any previous checkpoint under the same base name.
    pub fn create_checkpoint(&self, paths: &[String], working_dir: &Path) -> Result<CheckpointManifest> {
        self.preflight()?;
        let base = self.base_name().to_string();
        let bound = self.cfg.volume_size_bytes()?;
        let volume_dir = self.volume_dir();
        self.engine
            .check_request(paths, working_dir, &volume_dir, bound)?;

        let source_bytes = tree_size(working_dir, paths);
        tracing::info!(
            base = %base,
            working_dir = %working_dir.display(),
            source_bytes,
            estimated_volumes = source_bytes.div_ceil(bound).max(1),
            volume_size = bound,
            store = %self.store.describe(),
            "creating checkpoint"
        );
        self.cleanup_previous();
        clear_local_volumes(&volume_dir, &base);

        let mut processor = VolumeProcessor::new(
            self.store.as_ref(),
            self.codec.as_ref(),
            self.retry(),
            base.clone(),
            volume_dir.clone(),
        );
        let raw_names = self
            .engine
            .create_archive(paths, working_dir, &volume_dir, bound, &mut processor)?;
        let uploaded = processor.into_uploaded();
        if uploaded.len() != raw_names.len() {
            return Err(Error::msg(format!(
                "archived {} volume(s) but uploaded {}",
                raw_names.len(),
                uploaded.len()
            )));
        }

        let manifests = self.manifests();
        let mut manifest = manifests.build(&base, uploaded, &self.cfg.volume_size);
        manifest.compression = Some(self.codec.name().to_string());
        manifest.paths = paths.to_vec();
        manifests.publish(&manifest)?;
        self.release_volume_dir(&volume_dir);

        tracing::info!(base = %base, volumes = manifest.volume_count, "checkpoint created");
        Ok(manifest)
    }

    /// Recreates the checkpointed tree under `working_dir`.
    pub fn restore_checkpoint(&self, working_dir: &Path) -> Result<CheckpointManifest> {
        self.preflight()?;
        let base = self.base_name().to_string();
        let manifest = self.load_manifest()?;
        if let Some(c) = manifest.compression.as_deref()
            && c != self.codec.name()
        {
            return Err(Error::config(format!(
                "checkpoint '{base}' was compressed with {c}, but {} is configured",
                self.codec.name()
            )));
        }

        tracing::info!(
            base = %base,
            volumes = manifest.volume_count,
            created_at = %manifest.created_at,
            dest = %working_dir.display(),
            "restoring checkpoint"
        );
        let volume_dir = self.volume_dir();
        let mut processor = VolumeProcessor::new(
            self.store.as_ref(),
            self.codec.as_ref(),
            self.retry(),
            base.clone(),
            volume_dir.clone(),
        );
        self.engine
            .restore_archive(&manifest.volumes, working_dir, &mut processor)?;
        self.release_volume_dir(&volume_dir);

        tracing::info!(base = %base, "checkpoint restored");
        Ok(manifest)
    }

    pub fn load_manifest(&self) -> Result<CheckpointManifest> {
        self.manifests().load(self.base_name())
    }

    /// Removes the checkpoint from the store. Failures are logged, not raised.
    pub fn discard_checkpoint(&self) {
        self.cleanup_previous();
    }

    // Manifest goes first so a half-deleted checkpoint is never restorable.
    fn cleanup_previous(&self) {
        let base = self.base_name();
        let manifests = self.manifests();
        let previous = match manifests.load(base) {
            Ok(m) => m.volume_count,
            Err(e) if e.is_not_found() => 0,
            Err(e) => {
                tracing::warn!(base = %base, error = %e, "previous manifest unreadable");
                0
            }
        };
        if let Err(e) = manifests.remove(base) {
            tracing::warn!(base = %base, error = %e, "failed to delete previous manifest");
        }

        let upper = self.cfg.cleanup_max_volumes.max(previous);
        let ext = self.codec.extension();
        let mut failed = 0u32;
        for index in 1..=upper {
            let name = volume_blob_name(base, index, ext);
            if let Err(e) = self.store.delete(&name) {
                failed += 1;
                tracing::warn!(blob = %name, error = %e, "failed to delete previous volume");
            }
        }
        tracing::info!(base = %base, swept = upper, failed, "previous checkpoint cleaned up");
    }
}

/// Apparent size of the regular files under `paths`; only used for logging.
fn tree_size(working_dir: &Path, paths: &[String]) -> u64 {
    paths
        .iter()
        .flat_map(|p| walkdir::WalkDir::new(working_dir.join(p)).follow_links(false))
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .filter_map(|e| e.metadata().ok())
        .map(|m| m.len())
        .sum()
}

/// Drops raw or compressed volume files an interrupted run left behind.
fn clear_local_volumes(volume_dir: &Path, base: &str) {
    let Ok(entries) = fs::read_dir(volume_dir) else {
        return;
    };
    let prefix = format!("{base}.vol");
    for entry in entries.flatten() {
        let name = entry.file_name();
        let Some(name) = name.to_str() else {
            continue;
        };
        if name.starts_with(&prefix)
            && let Err(e) = fs::remove_file(entry.path())
        {
            tracing::warn!(file = %entry.path().display(), error = %e, "failed to remove stale volume");
        }
    }
}
