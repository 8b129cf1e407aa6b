use std::path::{Path, PathBuf};
use std::process::Command;

use serde::Deserialize;

use super::{BlobStore, check_blob_name, env_value, required_setting, setting};
use crate::error::{Error, Result};
use crate::process::{ProcessRunner, command_summary};

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct SshBackendConfig {
    // "user@host:/base/path"
    pub target: String,
    pub target_env: Option<String>,
    pub port: Option<u16>,
    pub port_env: Option<String>,
    pub identity_file: Option<String>,
    pub identity_file_env: Option<String>,
    pub known_hosts_file: Option<String>,
    pub strict_host_key_checking: Option<bool>,
}

#[derive(Debug, Clone)]
pub struct SshStore {
    host: String,
    base_path: String,
    port: Option<u16>,
    identity_file: Option<String>,
    known_hosts_file: Option<String>,
    strict_host_key_checking: Option<bool>,
    runner: ProcessRunner,
}

fn sh_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', "'\\''"))
}

impl SshStore {
    pub fn from_config(cfg_name: &str, cfg: &SshBackendConfig, runner: ProcessRunner) -> Result<Self> {
        let target = required_setting(
            &format!("store.ssh.{cfg_name}.target"),
            Some(cfg.target.as_str()),
            cfg.target_env.as_deref(),
        )?;
        let (host, base_path) = target.split_once(':').ok_or_else(|| {
            Error::config(format!(
                "store.ssh.{cfg_name}.target must be 'host:/path'"
            ))
        })?;

        let port = match cfg.port {
            Some(p) => Some(p),
            None => env_value(cfg.port_env.as_deref())
                .map(|s| {
                    s.parse::<u16>().map_err(|e| {
                        Error::config(format!("store.ssh.{cfg_name}.port_env parse failed: {e}"))
                    })
                })
                .transpose()?,
        };

        Ok(Self {
            host: host.trim().to_string(),
            base_path: base_path.trim().trim_end_matches('/').to_string(),
            port,
            identity_file: setting(
                cfg.identity_file.as_deref(),
                cfg.identity_file_env.as_deref(),
            ),
            known_hosts_file: cfg
                .known_hosts_file
                .as_deref()
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(ToOwned::to_owned),
            strict_host_key_checking: cfg.strict_host_key_checking,
            runner,
        })
    }

    fn remote_path(&self, name: &str) -> String {
        format!("{}/{name}", self.base_path)
    }

    // ssh takes `-p`, scp takes `-P`; everything else is shared.
    fn command(&self, program: &str) -> Command {
        let scp_style = program == "scp";
        let mut cmd = Command::new(program);
        cmd.arg("-o").arg("BatchMode=yes");
        if let Some(port) = self.port {
            cmd.arg(if scp_style { "-P" } else { "-p" }).arg(port.to_string());
        }
        if let Some(id) = self.identity_file.as_deref() {
            cmd.arg("-i").arg(id);
        }
        if let Some(kh) = self.known_hosts_file.as_deref() {
            cmd.arg("-o").arg(format!("UserKnownHostsFile={kh}"));
        }
        if matches!(self.strict_host_key_checking, Some(false)) {
            cmd.arg("-o").arg("StrictHostKeyChecking=no");
            if self.known_hosts_file.is_none() {
                cmd.arg("-o").arg("UserKnownHostsFile=/dev/null");
            }
        }
        cmd
    }

    fn remote_shell(&self, script: String) -> Result<std::process::Output> {
        let mut cmd = self.command("ssh");
        cmd.arg(&self.host).arg(script);
        self.runner.capture(&mut cmd)
    }
}

impl BlobStore for SshStore {
    fn describe(&self) -> String {
        format!("{}:{}", self.host, self.base_path)
    }

    fn upload(&self, name: &str, local_path: &Path) -> Result<()> {
        check_blob_name(name)?;
        let out = self.remote_shell(format!("mkdir -p {}", sh_quote(&self.base_path)))?;
        if !out.status.success() {
            return Err(Error::transfer(format!(
                "SSH mkdir on {} failed: {}",
                self.host,
                command_summary(&out)
            )));
        }

        // Copy to a partial name and rename so a reader never sees a torn blob.
        let remote = self.remote_path(name);
        let partial = format!("{remote}.partial");
        let mut scp = self.command("scp");
        scp.arg(local_path).arg(format!("{}:{partial}", self.host));
        let out = self.runner.capture(&mut scp)?;
        if !out.status.success() {
            return Err(Error::transfer(format!(
                "SSH upload of {name} failed: {}",
                command_summary(&out)
            )));
        }
        let out = self.remote_shell(format!("mv -f {} {}", sh_quote(&partial), sh_quote(&remote)))?;
        if !out.status.success() {
            return Err(Error::transfer(format!(
                "SSH rename of {name} failed: {}",
                command_summary(&out)
            )));
        }
        Ok(())
    }

    fn download(&self, name: &str, dest_dir: &Path) -> Result<PathBuf> {
        check_blob_name(name)?;
        let remote = self.remote_path(name);
        let exists = self.remote_shell(format!("test -f {}", sh_quote(&remote)))?;
        if !exists.status.success() {
            if exists.status.code() == Some(1) {
                return Err(Error::not_found(format!("blob '{name}' not found on {}", self.describe())));
            }
            return Err(Error::transfer(format!(
                "SSH existence check for {name} failed: {}",
                command_summary(&exists)
            )));
        }

        std::fs::create_dir_all(dest_dir)
            .map_err(|e| Error::msg(format!("failed to create {}: {e}", dest_dir.display())))?;
        let local = dest_dir.join(name);
        let mut scp = self.command("scp");
        scp.arg(format!("{}:{remote}", self.host)).arg(&local);
        let out = self.runner.capture(&mut scp)?;
        if !out.status.success() {
            return Err(Error::transfer(format!(
                "SSH download of {name} failed: {}",
                command_summary(&out)
            )));
        }
        Ok(local)
    }

    fn delete(&self, name: &str) -> Result<()> {
        check_blob_name(name)?;
        let out = self.remote_shell(format!("rm -f {}", sh_quote(&self.remote_path(name))))?;
        if !out.status.success() {
            return Err(Error::transfer(format!(
                "SSH delete of {name} failed: {}",
                command_summary(&out)
            )));
        }
        Ok(())
    }

    fn required_tools(&self) -> Vec<&'static str> {
        vec!["ssh", "scp"]
    }
}
