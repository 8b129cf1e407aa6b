//! Bounded-size multi-volume split/join of a directory tree.
//!
//! The tree is serialized by a single `tar` stream. On creation the engine
//! cuts that stream into volume files of at most `bound` bytes; on restore it
//! pipes the volumes back into `tar --extract` in manifest order. Because the
//! volumes are plain byte slices of one stream, order is load-bearing.

use std::fs::{self, File};
use std::io::{self, BufWriter, Read, Write};
use std::path::{Component, Path, PathBuf};
use std::process::{Child, Command, Stdio};

use crate::error::{Error, Result};
use crate::process::{ProcessRunner, exit_code, forward_child_output};

const READ_CHUNK: usize = 1 << 20;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeInfo {
    /// 1-based position in the volume sequence.
    pub index: u32,
    pub name: String,
    pub path: PathBuf,
    pub bytes: u64,
}

/// Called by the engine at every volume boundary of a create operation.
///
/// The first call carries `None` and happens before any data exists; it only
/// asks for the name of volume 1. Every later call carries the volume that was
/// just completed, and must not return until that volume is settled. The engine
/// produces nothing while the handler runs. After the final volume the
/// returned name is not used.
pub trait VolumeBoundaryHandler {
    fn on_volume_boundary(&mut self, prior: Option<&VolumeInfo>) -> Result<String>;
}

/// Supplies raw volumes to a restore, one at a time.
pub trait VolumeSource {
    /// Materialize volume `index` (named `name`) as a raw local file.
    fn fetch(&mut self, index: u32, name: &str) -> Result<PathBuf>;
    /// The engine has consumed the raw file; it may be deleted.
    fn release(&mut self, index: u32, raw: &Path) -> Result<()>;
}

#[derive(Debug, Clone)]
pub struct ArchiveEngine {
    tar_program: String,
    remove_source_files: bool,
}

struct OpenVolume {
    info: VolumeInfo,
    out: BufWriter<File>,
}

impl OpenVolume {
    fn create(dir: &Path, index: u32, name: String) -> Result<Self> {
        if name.is_empty() || name.contains('/') || name.contains('\\') || name.starts_with('.') {
            return Err(Error::msg(format!("invalid volume name '{name}'")));
        }
        let path = dir.join(&name);
        let file = File::create(&path)
            .map_err(|e| Error::msg(format!("failed to create volume {}: {e}", path.display())))?;
        Ok(Self {
            info: VolumeInfo {
                index,
                name,
                path,
                bytes: 0,
            },
            out: BufWriter::with_capacity(READ_CHUNK, file),
        })
    }

    fn seal(self) -> Result<VolumeInfo> {
        let OpenVolume { info, out } = self;
        let file = out.into_inner().map_err(|e| {
            Error::msg(format!(
                "failed to flush volume {}: {}",
                info.path.display(),
                e.error()
            ))
        })?;
        file.sync_all()
            .map_err(|e| Error::msg(format!("failed to sync volume {}: {e}", info.path.display())))?;
        Ok(info)
    }

    fn discard(self) {
        let OpenVolume { info, out } = self;
        drop(out);
        if let Err(e) = fs::remove_file(&info.path) {
            tracing::warn!(file = %info.path.display(), error = %e, "failed to remove partial volume");
        }
    }
}

impl ArchiveEngine {
    pub fn new(tar_program: impl Into<String>, remove_source_files: bool) -> Self {
        Self {
            tar_program: tar_program.into(),
            remove_source_files,
        }
    }

    /// The stream is only portable between GNU tar builds, so insist on it.
    pub fn check_available(&self, runner: &ProcessRunner) -> Result<()> {
        let banner = runner.require_tool(&self.tar_program, "--version", Some("GNU tar"))?;
        tracing::debug!(program = %self.tar_program, %banner, "archiver available");
        Ok(())
    }

    /// Rejects a create that cannot succeed before anything remote is
    /// touched. Creates `volume_dir`.
    pub fn check_request(
        &self,
        source_paths: &[String],
        working_dir: &Path,
        volume_dir: &Path,
        bound: u64,
    ) -> Result<()> {
        if bound == 0 {
            return Err(Error::config("volume size bound must be greater than zero"));
        }
        fs::create_dir_all(volume_dir)
            .map_err(|e| Error::msg(format!("failed to create {}: {e}", volume_dir.display())))?;
        validate_sources(source_paths, working_dir, volume_dir)
    }

    /// Archives `source_paths` (relative to `working_dir`) into volumes under
    /// `volume_dir` and returns the volume names in creation order.
    pub fn create_archive(
        &self,
        source_paths: &[String],
        working_dir: &Path,
        volume_dir: &Path,
        bound: u64,
        handler: &mut dyn VolumeBoundaryHandler,
    ) -> Result<Vec<String>> {
        self.check_request(source_paths, working_dir, volume_dir, bound)?;

        let mut cmd = Command::new(&self.tar_program);
        cmd.arg("--create").arg("--file=-");
        if self.remove_source_files {
            cmd.arg("--remove-files");
        }
        cmd.arg("--directory")
            .arg(working_dir)
            .arg("--")
            .args(source_paths)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        tracing::info!(
            working_dir = %working_dir.display(),
            paths = ?source_paths,
            bound,
            "starting archive stream"
        );
        let mut child = cmd
            .spawn()
            .map_err(|e| Error::archive_tool(format!("failed to spawn {}: {e}", self.tar_program)))?;
        let Some(mut stdout) = child.stdout.take() else {
            return Err(Error::archive_tool("tar stdout was not captured"));
        };
        let readers = forward_child_output(&mut child, &self.tar_program);

        let split = split_stream(&mut stdout, volume_dir, bound, handler);
        drop(stdout);
        let names = match split {
            Ok(names) => names,
            Err(e) => {
                stop_child(&mut child);
                for r in readers {
                    let _ = r.join();
                }
                return Err(e);
            }
        };

        let status = child
            .wait()
            .map_err(|e| Error::archive_tool(format!("failed to wait for tar: {e}")))?;
        for r in readers {
            let _ = r.join();
        }
        if !status.success() {
            return Err(Error::archive_tool(format!(
                "tar --create exited with code {} after {} volume(s)",
                exit_code(status),
                names.len()
            )));
        }
        tracing::info!(volumes = names.len(), "archive stream complete");
        Ok(names)
    }

    /// Feeds `volume_names`, strictly in the given order, into
    /// `tar --extract` running in `dest_dir`.
    pub fn restore_archive(
        &self,
        volume_names: &[String],
        dest_dir: &Path,
        source: &mut dyn VolumeSource,
    ) -> Result<()> {
        fs::create_dir_all(dest_dir)
            .map_err(|e| Error::msg(format!("failed to create {}: {e}", dest_dir.display())))?;
        if volume_names.is_empty() {
            tracing::info!(dest = %dest_dir.display(), "checkpoint has no volumes, nothing to extract");
            return Ok(());
        }

        let mut cmd = Command::new(&self.tar_program);
        cmd.arg("--extract")
            .arg("--file=-")
            .arg("--preserve-permissions")
            .arg("--directory")
            .arg(dest_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        tracing::info!(
            dest = %dest_dir.display(),
            volumes = volume_names.len(),
            "starting restore stream"
        );
        let mut child = cmd
            .spawn()
            .map_err(|e| Error::archive_tool(format!("failed to spawn {}: {e}", self.tar_program)))?;
        let Some(mut stdin) = child.stdin.take() else {
            return Err(Error::archive_tool("tar stdin was not captured"));
        };
        let readers = forward_child_output(&mut child, &self.tar_program);

        let fed = feed_volumes(volume_names, &mut stdin, source);
        drop(stdin);
        if let Err(e) = fed {
            stop_child(&mut child);
            for r in readers {
                let _ = r.join();
            }
            return Err(e);
        }

        let status = child
            .wait()
            .map_err(|e| Error::archive_tool(format!("failed to wait for tar: {e}")))?;
        for r in readers {
            let _ = r.join();
        }
        if !status.success() {
            return Err(Error::archive_tool(format!(
                "tar --extract exited with code {}",
                exit_code(status)
            )));
        }
        tracing::info!(volumes = volume_names.len(), "restore stream complete");
        Ok(())
    }
}

fn validate_sources(source_paths: &[String], working_dir: &Path, volume_dir: &Path) -> Result<()> {
    if source_paths.is_empty() {
        return Err(Error::config("no paths given to archive"));
    }
    if !working_dir.is_dir() {
        return Err(Error::msg(format!(
            "working directory {} does not exist",
            working_dir.display()
        )));
    }
    let canonical_volumes = volume_dir
        .canonicalize()
        .unwrap_or_else(|_| volume_dir.to_path_buf());
    for raw in source_paths {
        let rel = Path::new(raw);
        if raw.trim().is_empty()
            || rel.is_absolute()
            || rel
                .components()
                .any(|c| matches!(c, Component::ParentDir | Component::RootDir))
        {
            return Err(Error::config(format!(
                "archive path '{raw}' must be relative to the working directory without '..'"
            )));
        }
        let full = working_dir.join(rel);
        fs::symlink_metadata(&full)
            .map_err(|e| Error::msg(format!("archive path {} is not usable: {e}", full.display())))?;
        if let Ok(canonical) = full.canonicalize()
            && canonical_volumes.starts_with(&canonical)
        {
            return Err(Error::config(format!(
                "volume directory {} lies inside archived path {}",
                volume_dir.display(),
                full.display()
            )));
        }
    }
    Ok(())
}

// A volume still open when the split fails is incomplete and is removed.
fn split_stream(
    stream: &mut dyn Read,
    volume_dir: &Path,
    bound: u64,
    handler: &mut dyn VolumeBoundaryHandler,
) -> Result<Vec<String>> {
    let mut current: Option<OpenVolume> = None;
    let res = fill_volumes(stream, volume_dir, bound, handler, &mut current);
    if res.is_err()
        && let Some(partial) = current.take()
    {
        partial.discard();
    }
    res
}

fn fill_volumes(
    stream: &mut dyn Read,
    volume_dir: &Path,
    bound: u64,
    handler: &mut dyn VolumeBoundaryHandler,
    current: &mut Option<OpenVolume>,
) -> Result<Vec<String>> {
    let mut names = Vec::<String>::new();
    let mut next_name = Some(handler.on_volume_boundary(None)?);
    let mut buf = vec![0u8; READ_CHUNK];

    loop {
        let n = match stream.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(Error::archive_tool(format!("reading tar stream failed: {e}"))),
        };
        let mut chunk = &buf[..n];

        while !chunk.is_empty() {
            if current.is_none() {
                let name = next_name
                    .take()
                    .ok_or_else(|| Error::msg("volume handler did not provide a name"))?;
                let index =
                    u32::try_from(names.len() + 1).map_err(|_| Error::msg("too many volumes"))?;
                *current = Some(OpenVolume::create(volume_dir, index, name.clone())?);
                names.push(name);
            }
            let Some(vol) = current.as_mut() else {
                return Err(Error::msg("no open volume"));
            };

            let room = bound - vol.info.bytes;
            let take = chunk.len().min(usize::try_from(room).unwrap_or(usize::MAX));
            vol.out.write_all(&chunk[..take]).map_err(|e| {
                Error::msg(format!("failed to write volume {}: {e}", vol.info.path.display()))
            })?;
            vol.info.bytes += take as u64;
            chunk = &chunk[take..];

            if vol.info.bytes == bound
                && let Some(full) = current.take()
            {
                let info = full.seal()?;
                tracing::debug!(volume = %info.name, bytes = info.bytes, "volume full");
                next_name = Some(handler.on_volume_boundary(Some(&info))?);
            }
        }
    }

    if let Some(last) = current.take() {
        let info = last.seal()?;
        tracing::debug!(volume = %info.name, bytes = info.bytes, "final volume");
        handler.on_volume_boundary(Some(&info))?;
    }
    Ok(names)
}

fn feed_volumes(
    volume_names: &[String],
    sink: &mut dyn Write,
    source: &mut dyn VolumeSource,
) -> Result<()> {
    for (i, name) in volume_names.iter().enumerate() {
        let index = u32::try_from(i + 1).map_err(|_| Error::msg("too many volumes"))?;
        let raw = source.fetch(index, name)?;
        let mut file = File::open(&raw)
            .map_err(|e| Error::msg(format!("failed to open volume {}: {e}", raw.display())))?;
        io::copy(&mut file, sink).map_err(|e| {
            if e.kind() == io::ErrorKind::BrokenPipe {
                Error::archive_tool(format!("tar stopped reading while consuming volume {name}"))
            } else {
                Error::archive_tool(format!("failed to stream volume {name} into tar: {e}"))
            }
        })?;
        drop(file);
        source.release(index, &raw)?;
        tracing::debug!(volume = %name, index, "volume consumed");
    }
    sink.flush()
        .map_err(|e| Error::archive_tool(format!("failed to flush tar input: {e}")))?;
    Ok(())
}

fn stop_child(child: &mut Child) {
    let _ = child.kill();
    let _ = child.wait();
}
