use std::path::Path;
use std::process::Command;

use crate::config::CompressionConfig;
use crate::error::{Error, Result};
use crate::process::{ProcessRunner, RunOptions};

/// Streaming compressor used for one volume at a time.
pub trait Codec {
    /// Short name recorded in the manifest, e.g. `zstd`.
    fn name(&self) -> &str;
    /// File extension appended to a raw volume name, without the dot.
    fn extension(&self) -> &str;
    /// Precondition check for whatever the codec needs on the host.
    fn check_available(&self) -> Result<()>;
    fn compress(&self, raw: &Path, out: &Path) -> Result<()>;
    fn decompress(&self, compressed: &Path, out: &Path) -> Result<()>;
}

/// Shells out to the `zstd` CLI, which does its own multi-threading.
#[derive(Debug, Clone)]
pub struct ZstdCli {
    program: String,
    level: i32,
    threads: usize,
    runner: ProcessRunner,
}

impl ZstdCli {
    pub fn new(program: impl Into<String>, level: i32, threads: usize) -> Self {
        Self {
            program: program.into(),
            level: level.clamp(1, 22),
            threads,
            runner: ProcessRunner::new(),
        }
    }

    pub fn from_config(cfg: &CompressionConfig) -> Self {
        Self::new(cfg.program.clone(), cfg.level, cfg.threads)
    }

    fn effective_threads(&self) -> usize {
        if self.threads == 0 {
            num_cpus::get().max(1)
        } else {
            self.threads
        }
    }

    fn run_checked(&self, cmd: Command, what: &str, path: &Path) -> Result<()> {
        let code = self.runner.run_command(cmd, &RunOptions::default())?;
        if code != 0 {
            return Err(Error::msg(format!(
                "{} {what} of {} failed with exit code {code}",
                self.program,
                path.display()
            )));
        }
        Ok(())
    }
}

impl Codec for ZstdCli {
    fn name(&self) -> &str {
        "zstd"
    }

    fn extension(&self) -> &str {
        "zst"
    }

    fn check_available(&self) -> Result<()> {
        let banner = self.runner.require_tool(&self.program, "--version", None)?;
        tracing::debug!(program = %self.program, %banner, "compressor available");
        Ok(())
    }

    fn compress(&self, raw: &Path, out: &Path) -> Result<()> {
        let mut cmd = Command::new(&self.program);
        cmd.arg("-q").arg("-f");
        if self.level > 19 {
            cmd.arg("--ultra");
        }
        cmd.arg(format!("-{}", self.level))
            .arg(format!("-T{}", self.effective_threads()))
            .arg(raw)
            .arg("-o")
            .arg(out);
        self.run_checked(cmd, "compression", raw)
    }

    fn decompress(&self, compressed: &Path, out: &Path) -> Result<()> {
        let mut cmd = Command::new(&self.program);
        cmd.arg("-q")
            .arg("-f")
            .arg("-d")
            .arg(compressed)
            .arg("-o")
            .arg(out);
        self.run_checked(cmd, "decompression", compressed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn have_zstd() -> bool {
        Command::new("zstd")
            .arg("--version")
            .output()
            .map(|o| o.status.success())
            .unwrap_or(false)
    }

    #[test]
    fn level_is_clamped() {
        assert_eq!(ZstdCli::new("zstd", 0, 1).level, 1);
        assert_eq!(ZstdCli::new("zstd", 40, 1).level, 22);
    }

    #[test]
    fn zstd_roundtrip_when_installed() {
        if !have_zstd() {
            eprintln!("skipping: zstd not installed");
            return;
        }
        let tmp = tempfile::tempdir().expect("tempdir");
        let raw = tmp.path().join("vol.tar");
        let packed = tmp.path().join("vol.tar.zst");
        let back = tmp.path().join("vol.out");
        let body = b"abcabcabc".repeat(10_000);
        std::fs::write(&raw, &body).expect("write");

        let codec = ZstdCli::new("zstd", 3, 2);
        codec.compress(&raw, &packed).expect("compress");
        assert!(std::fs::metadata(&packed).expect("meta").len() < body.len() as u64);
        codec.decompress(&packed, &back).expect("decompress");
        assert_eq!(std::fs::read(&back).expect("read"), body);
    }
}
