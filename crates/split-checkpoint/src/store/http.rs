use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use super::{BlobStore, check_blob_name, required_setting, setting};
use crate::error::{Error, Result};

fn default_timeout_secs() -> u64 {
    3600
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HttpBackendConfig {
    pub base_url: String,
    pub base_url_env: Option<String>,
    pub token: Option<String>,
    pub token_env: Option<String>,
    /// Whole-request timeout; volumes are large, so this is generous.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for HttpBackendConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            base_url_env: None,
            token: None,
            token_env: None,
            timeout_secs: default_timeout_secs(),
        }
    }
}

/// `PUT`/`GET`/`DELETE <base_url>/<name>` with optional bearer auth.
pub struct HttpStore {
    base_url: String,
    token: Option<String>,
    client: reqwest::blocking::Client,
}

impl HttpStore {
    pub fn from_config(cfg_name: &str, cfg: &HttpBackendConfig) -> Result<Self> {
        let base_url = required_setting(
            &format!("store.http.{cfg_name}.base_url"),
            Some(cfg.base_url.as_str()),
            cfg.base_url_env.as_deref(),
        )?;
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(cfg.timeout_secs.max(1)))
            .build()
            .map_err(|e| Error::msg(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            token: setting(cfg.token.as_deref(), cfg.token_env.as_deref()),
            client,
        })
    }

    fn url(&self, name: &str) -> String {
        format!("{}/{}", self.base_url, name)
    }

    fn authed(&self, req: reqwest::blocking::RequestBuilder) -> reqwest::blocking::RequestBuilder {
        match self.token.as_deref() {
            Some(t) => req.bearer_auth(t),
            None => req,
        }
    }
}

impl BlobStore for HttpStore {
    fn describe(&self) -> String {
        self.base_url.clone()
    }

    fn upload(&self, name: &str, local_path: &Path) -> Result<()> {
        check_blob_name(name)?;
        let file = fs::File::open(local_path)
            .map_err(|e| Error::msg(format!("failed to open {}: {e}", local_path.display())))?;
        let len = file
            .metadata()
            .map_err(|e| Error::msg(format!("failed to stat {}: {e}", local_path.display())))?
            .len();
        let body = reqwest::blocking::Body::sized(file, len);
        let res = self
            .authed(self.client.put(self.url(name)).body(body))
            .send()
            .map_err(|e| Error::transfer(format!("HTTP upload of {name} failed: {e}")))?;
        if res.status().is_success() {
            return Ok(());
        }
        Err(Error::transfer(format!(
            "HTTP upload of {name} failed with status {}",
            res.status()
        )))
    }

    fn download(&self, name: &str, dest_dir: &Path) -> Result<PathBuf> {
        check_blob_name(name)?;
        let mut res = self
            .authed(self.client.get(self.url(name)))
            .send()
            .map_err(|e| Error::transfer(format!("HTTP download of {name} failed: {e}")))?;
        if res.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(Error::not_found(format!("blob '{name}' not found at {}", self.base_url)));
        }
        if !res.status().is_success() {
            return Err(Error::transfer(format!(
                "HTTP download of {name} failed with status {}",
                res.status()
            )));
        }

        fs::create_dir_all(dest_dir)
            .map_err(|e| Error::msg(format!("failed to create {}: {e}", dest_dir.display())))?;
        let out = dest_dir.join(name);
        let mut file = fs::File::create(&out)
            .map_err(|e| Error::msg(format!("failed to create {}: {e}", out.display())))?;
        if let Err(e) = res.copy_to(&mut file) {
            drop(file);
            let _ = fs::remove_file(&out);
            return Err(Error::transfer(format!("HTTP body read for {name} failed: {e}")));
        }
        Ok(out)
    }

    fn delete(&self, name: &str) -> Result<()> {
        check_blob_name(name)?;
        let res = self
            .authed(self.client.delete(self.url(name)))
            .send()
            .map_err(|e| Error::transfer(format!("HTTP delete of {name} failed: {e}")))?;
        if res.status().is_success() || res.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(());
        }
        Err(Error::transfer(format!(
            "HTTP delete of {name} failed with status {}",
            res.status()
        )))
    }
}
