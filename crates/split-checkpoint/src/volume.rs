use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::archive::{VolumeBoundaryHandler, VolumeInfo, VolumeSource};
use crate::codec::Codec;
use crate::config::RetryConfig;
use crate::error::{Error, ErrorKind, Result};
use crate::store::BlobStore;

/// Local (uncompressed) file name of volume `index`.
pub fn raw_volume_name(base_name: &str, index: u32) -> String {
    format!("{base_name}.vol{index:04}.tar")
}

/// Remote blob name of volume `index`, derived only from `(base_name, index)`
/// and the codec extension.
pub fn volume_blob_name(base_name: &str, index: u32, extension: &str) -> String {
    format!("{}.{extension}", raw_volume_name(base_name, index))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 5,
            delay: Duration::from_secs(10),
        }
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(cfg: &RetryConfig) -> Self {
        Self {
            attempts: cfg.attempts.max(1),
            delay: Duration::from_secs(cfg.delay_secs),
        }
    }
}

impl RetryPolicy {
    /// Runs `op` until it succeeds, the attempts run out, or it fails with an
    /// error `give_up` accepts.
    pub fn run<T>(
        &self,
        what: &str,
        mut op: impl FnMut() -> Result<T>,
        give_up: impl Fn(&Error) -> bool,
    ) -> Result<T> {
        let attempts = self.attempts.max(1);
        let mut attempt = 1;
        loop {
            match op() {
                Ok(v) => {
                    if attempt > 1 {
                        tracing::info!(attempt, "{what} succeeded after retry");
                    }
                    return Ok(v);
                }
                Err(e) if give_up(&e) => return Err(e),
                Err(e) if attempt >= attempts => {
                    return Err(e.with_kind(
                        ErrorKind::Transfer,
                        &format!("{what} failed after {attempts} attempt(s)"),
                    ));
                }
                Err(e) => {
                    tracing::warn!(attempt, max = attempts, error = %e, "{what} failed, retrying");
                    if !self.delay.is_zero() {
                        std::thread::sleep(self.delay);
                    }
                    attempt += 1;
                }
            }
        }
    }
}

pub fn upload_with_retry(
    store: &dyn BlobStore,
    retry: &RetryPolicy,
    name: &str,
    local: &Path,
) -> Result<()> {
    retry.run(&format!("upload of {name}"), || store.upload(name, local), |_| false)
}

/// `NotFound` is final: a missing blob will not appear by waiting.
pub fn download_with_retry(
    store: &dyn BlobStore,
    retry: &RetryPolicy,
    name: &str,
    dest_dir: &Path,
) -> Result<PathBuf> {
    retry.run(
        &format!("download of {name}"),
        || store.download(name, dest_dir),
        Error::is_not_found,
    )
}

fn remove_if_present(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(Error::msg(format!("failed to delete {}: {e}", path.display()))),
    }
}

/// Turns each volume boundary into a settled remote blob (create) or a
/// settled local raw file (restore). Holds at most one volume on disk.
pub struct VolumeProcessor<'a> {
    store: &'a dyn BlobStore,
    codec: &'a dyn Codec,
    retry: RetryPolicy,
    base_name: String,
    volume_dir: PathBuf,
    next_index: u32,
    uploaded: Vec<String>,
}

impl<'a> VolumeProcessor<'a> {
    pub fn new(
        store: &'a dyn BlobStore,
        codec: &'a dyn Codec,
        retry: RetryPolicy,
        base_name: impl Into<String>,
        volume_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            store,
            codec,
            retry,
            base_name: base_name.into(),
            volume_dir: volume_dir.into(),
            next_index: 1,
            uploaded: Vec::new(),
        }
    }

    pub fn blob_name(&self, index: u32) -> String {
        volume_blob_name(&self.base_name, index, self.codec.extension())
    }

    /// Blob names confirmed uploaded, in creation order.
    pub fn uploaded(&self) -> &[String] {
        &self.uploaded
    }

    pub fn into_uploaded(self) -> Vec<String> {
        self.uploaded
    }

    fn settle_volume(&mut self, info: &VolumeInfo) -> Result<()> {
        let blob = self.blob_name(info.index);
        let compressed = self.volume_dir.join(&blob);

        tracing::info!(volume = %info.name, index = info.index, bytes = info.bytes, "compressing volume");
        if let Err(e) = self.codec.compress(&info.path, &compressed) {
            let _ = remove_if_present(&compressed);
            return Err(e);
        }
        remove_if_present(&info.path)?;

        let size = fs::metadata(&compressed).map(|m| m.len()).unwrap_or(0);
        tracing::info!(blob = %blob, compressed_bytes = size, store = %self.store.describe(), "uploading volume");
        let uploaded = upload_with_retry(self.store, &self.retry, &blob, &compressed);
        remove_if_present(&compressed)?;
        uploaded?;

        self.uploaded.push(blob);
        Ok(())
    }
}

impl VolumeBoundaryHandler for VolumeProcessor<'_> {
    fn on_volume_boundary(&mut self, prior: Option<&VolumeInfo>) -> Result<String> {
        if let Some(info) = prior {
            if info.index != self.next_index - 1 {
                return Err(Error::msg(format!(
                    "volume {} completed out of sequence (expected {})",
                    info.index,
                    self.next_index - 1
                )));
            }
            self.settle_volume(info)?;
        }
        let name = raw_volume_name(&self.base_name, self.next_index);
        self.next_index += 1;
        Ok(name)
    }
}

impl VolumeSource for VolumeProcessor<'_> {
    fn fetch(&mut self, index: u32, name: &str) -> Result<PathBuf> {
        fs::create_dir_all(&self.volume_dir).map_err(|e| {
            Error::msg(format!("failed to create {}: {e}", self.volume_dir.display()))
        })?;

        tracing::info!(blob = %name, index, store = %self.store.describe(), "downloading volume");
        let compressed = download_with_retry(self.store, &self.retry, name, &self.volume_dir)
            .map_err(|e| {
                if e.is_not_found() {
                    e.with_kind(
                        ErrorKind::Transfer,
                        &format!("volume {index} ({name}) is missing; checkpoint is unusable"),
                    )
                } else {
                    e
                }
            })?;

        let stem = name
            .strip_suffix(&format!(".{}", self.codec.extension()))
            .unwrap_or(name);
        let raw = self.volume_dir.join(format!("{stem}.raw"));
        let decoded = self.codec.decompress(&compressed, &raw);
        remove_if_present(&compressed)?;
        if let Err(e) = decoded {
            let _ = remove_if_present(&raw);
            return Err(e);
        }
        Ok(raw)
    }

    fn release(&mut self, index: u32, raw: &Path) -> Result<()> {
        tracing::debug!(index, raw = %raw.display(), "releasing volume");
        remove_if_present(raw)
    }
}
