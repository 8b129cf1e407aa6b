use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Command;

use serde::Deserialize;

use super::{
    BlobStore, check_blob_name, env_value, reports_missing_object, required_setting, setting,
};
use crate::error::{Error, Result};
use crate::process::{ProcessRunner, command_summary};

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct S3BackendConfig {
    pub bucket: String,
    pub bucket_env: Option<String>,
    pub region: Option<String>,
    pub region_env: Option<String>,
    pub prefix: Option<String>,
    pub prefix_env: Option<String>,
    pub endpoint_url: Option<String>,
    pub endpoint_url_env: Option<String>,
    pub profile: Option<String>,
    pub profile_env: Option<String>,
    pub aws_access_key_id_env: Option<String>,
    pub aws_secret_access_key_env: Option<String>,
    pub aws_session_token_env: Option<String>,
}

/// Objects live at `s3://<bucket>/<prefix>/<name>`; transfers go through the
/// `aws` CLI so multipart uploads of multi-GB volumes come for free.
#[derive(Debug, Clone)]
pub struct S3Store {
    bucket: String,
    region: Option<String>,
    prefix: Option<String>,
    endpoint_url: Option<String>,
    profile: Option<String>,
    command_env: BTreeMap<String, String>,
    runner: ProcessRunner,
}

impl S3Store {
    pub fn from_config(cfg_name: &str, cfg: &S3BackendConfig, runner: ProcessRunner) -> Result<Self> {
        let bucket = required_setting(
            &format!("store.s3.{cfg_name}.bucket"),
            Some(cfg.bucket.as_str()),
            cfg.bucket_env.as_deref(),
        )?;

        let mut command_env = BTreeMap::<String, String>::new();
        for (dst, src) in [
            ("AWS_ACCESS_KEY_ID", cfg.aws_access_key_id_env.as_deref()),
            ("AWS_SECRET_ACCESS_KEY", cfg.aws_secret_access_key_env.as_deref()),
            ("AWS_SESSION_TOKEN", cfg.aws_session_token_env.as_deref()),
        ] {
            if let Some(v) = env_value(src) {
                command_env.insert(dst.to_string(), v);
            }
        }

        Ok(Self {
            bucket,
            region: setting(cfg.region.as_deref(), cfg.region_env.as_deref()),
            prefix: setting(cfg.prefix.as_deref(), cfg.prefix_env.as_deref()),
            endpoint_url: setting(
                cfg.endpoint_url.as_deref(),
                cfg.endpoint_url_env.as_deref(),
            ),
            profile: setting(cfg.profile.as_deref(), cfg.profile_env.as_deref()),
            command_env,
            runner,
        })
    }

    fn key(&self, name: &str) -> String {
        match self
            .prefix
            .as_deref()
            .map(|p| p.trim_matches('/'))
            .filter(|p| !p.is_empty())
        {
            Some(prefix) => format!("{prefix}/{name}"),
            None => name.to_string(),
        }
    }

    fn uri(&self, name: &str) -> String {
        format!("s3://{}/{}", self.bucket, self.key(name))
    }

    fn aws(&self) -> Command {
        let mut cmd = Command::new("aws");
        if let Some(profile) = self.profile.as_deref() {
            cmd.arg("--profile").arg(profile);
        }
        if let Some(region) = self.region.as_deref() {
            cmd.arg("--region").arg(region);
        }
        if let Some(endpoint) = self.endpoint_url.as_deref() {
            cmd.arg("--endpoint-url").arg(endpoint);
        }
        for (k, v) in &self.command_env {
            cmd.env(k, v);
        }
        cmd
    }
}

impl BlobStore for S3Store {
    fn describe(&self) -> String {
        self.uri("")
    }

    fn upload(&self, name: &str, local_path: &Path) -> Result<()> {
        check_blob_name(name)?;
        let mut cmd = self.aws();
        cmd.arg("s3")
            .arg("cp")
            .arg("--only-show-errors")
            .arg(local_path)
            .arg(self.uri(name));
        let out = self.runner.capture(&mut cmd)?;
        if !out.status.success() {
            return Err(Error::transfer(format!(
                "S3 upload of {name} failed: {}",
                command_summary(&out)
            )));
        }
        Ok(())
    }

    fn download(&self, name: &str, dest_dir: &Path) -> Result<PathBuf> {
        check_blob_name(name)?;
        std::fs::create_dir_all(dest_dir)
            .map_err(|e| Error::msg(format!("failed to create {}: {e}", dest_dir.display())))?;
        let local = dest_dir.join(name);
        let mut cmd = self.aws();
        cmd.arg("s3")
            .arg("cp")
            .arg("--only-show-errors")
            .arg(self.uri(name))
            .arg(&local);
        let out = self.runner.capture(&mut cmd)?;
        if !out.status.success() {
            let msg = command_summary(&out);
            if reports_missing_object(&msg) {
                return Err(Error::not_found(format!("S3 object {} not found", self.uri(name))));
            }
            return Err(Error::transfer(format!("S3 download of {name} failed: {msg}")));
        }
        Ok(local)
    }

    fn delete(&self, name: &str) -> Result<()> {
        check_blob_name(name)?;
        let mut cmd = self.aws();
        cmd.arg("s3").arg("rm").arg(self.uri(name));
        let out = self.runner.capture(&mut cmd)?;
        if out.status.success() {
            return Ok(());
        }
        let msg = command_summary(&out);
        if reports_missing_object(&msg) {
            return Ok(());
        }
        Err(Error::transfer(format!("S3 delete of {name} failed: {msg}")))
    }

    fn required_tools(&self) -> Vec<&'static str> {
        vec!["aws"]
    }
}
