//! Remote blob storage addressed by exact name.
//!
//! Every backend performs a single attempt per call; retry policy lives in
//! the volume processor. `delete` of an absent blob is a success.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::config::ConfigDoc;
use crate::error::{Error, Result};
use crate::process::ProcessRunner;

pub mod http;
pub mod local;
pub mod s3;
pub mod ssh;

pub use http::{HttpBackendConfig, HttpStore};
pub use local::{LocalBackendConfig, LocalStore};
pub use s3::{S3BackendConfig, S3Store};
pub use ssh::{SshBackendConfig, SshStore};

pub trait BlobStore {
    /// Human-readable description for logs, e.g. `s3://bucket/prefix`.
    fn describe(&self) -> String;
    fn upload(&self, name: &str, local_path: &Path) -> Result<()>;
    /// Downloads `name` into `dest_dir` (as `dest_dir/name`) and returns the
    /// local path. Fails with `ErrorKind::NotFound` if the blob is absent.
    fn download(&self, name: &str, dest_dir: &Path) -> Result<PathBuf>;
    fn delete(&self, name: &str) -> Result<()>;
    /// Names of external programs this backend shells out to.
    fn required_tools(&self) -> Vec<&'static str> {
        Vec::new()
    }
}

impl<T: BlobStore + ?Sized> BlobStore for Box<T> {
    fn describe(&self) -> String {
        (**self).describe()
    }
    fn upload(&self, name: &str, local_path: &Path) -> Result<()> {
        (**self).upload(name, local_path)
    }
    fn download(&self, name: &str, dest_dir: &Path) -> Result<PathBuf> {
        (**self).download(name, dest_dir)
    }
    fn delete(&self, name: &str) -> Result<()> {
        (**self).delete(name)
    }
    fn required_tools(&self) -> Vec<&'static str> {
        (**self).required_tools()
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct StoreConfig {
    /// `kind:name`, or a bare name if it is unique across kinds.
    pub backend: String,
    pub local: BTreeMap<String, LocalBackendConfig>,
    pub s3: BTreeMap<String, S3BackendConfig>,
    pub http: BTreeMap<String, HttpBackendConfig>,
    pub ssh: BTreeMap<String, SshBackendConfig>,
}

#[derive(Debug, Clone)]
enum BackendResolved<'a> {
    Local(String, &'a LocalBackendConfig),
    S3(String, &'a S3BackendConfig),
    Http(String, &'a HttpBackendConfig),
    Ssh(String, &'a SshBackendConfig),
}

fn resolve_backend<'a>(cfg: &'a StoreConfig, backend_ref: &str) -> Result<BackendResolved<'a>> {
    let backend_ref = backend_ref.trim();
    if backend_ref.is_empty() {
        return Err(Error::config("store.backend is empty"));
    }

    if let Some((kind, name)) = backend_ref.split_once(':') {
        let (k, n) = (kind.trim(), name.trim());
        let unknown = || Error::config(format!("unknown store backend '{k}:{n}'"));
        return match k {
            "local" => cfg
                .local
                .get(n)
                .map(|v| BackendResolved::Local(n.to_string(), v))
                .ok_or_else(unknown),
            "s3" => cfg
                .s3
                .get(n)
                .map(|v| BackendResolved::S3(n.to_string(), v))
                .ok_or_else(unknown),
            "http" => cfg
                .http
                .get(n)
                .map(|v| BackendResolved::Http(n.to_string(), v))
                .ok_or_else(unknown),
            "ssh" => cfg
                .ssh
                .get(n)
                .map(|v| BackendResolved::Ssh(n.to_string(), v))
                .ok_or_else(unknown),
            _ => Err(Error::config(format!(
                "unknown store backend kind '{k}'; expected local/s3/http/ssh"
            ))),
        };
    }

    let mut hits = Vec::<BackendResolved<'a>>::new();
    let name = backend_ref.to_string();
    if let Some(v) = cfg.local.get(backend_ref) {
        hits.push(BackendResolved::Local(name.clone(), v));
    }
    if let Some(v) = cfg.s3.get(backend_ref) {
        hits.push(BackendResolved::S3(name.clone(), v));
    }
    if let Some(v) = cfg.http.get(backend_ref) {
        hits.push(BackendResolved::Http(name.clone(), v));
    }
    if let Some(v) = cfg.ssh.get(backend_ref) {
        hits.push(BackendResolved::Ssh(name, v));
    }
    match hits.len() {
        0 => Err(Error::config(format!("unknown store backend '{backend_ref}'"))),
        1 => Ok(hits.remove(0)),
        _ => Err(Error::config(format!(
            "ambiguous store backend '{backend_ref}'; use kind:name"
        ))),
    }
}

/// Builds the configured backend from the `[store]` table.
pub fn from_config(doc: &ConfigDoc) -> Result<Box<dyn BlobStore>> {
    let cfg: StoreConfig = doc.deserialize_path("store")?.unwrap_or_default();
    let runner = ProcessRunner::new();
    let store: Box<dyn BlobStore> = match resolve_backend(&cfg, &cfg.backend)? {
        BackendResolved::Local(name, b) => Box::new(LocalStore::from_config(doc, &name, b)?),
        BackendResolved::S3(name, b) => Box::new(S3Store::from_config(&name, b, runner)?),
        BackendResolved::Http(name, b) => Box::new(HttpStore::from_config(&name, b)?),
        BackendResolved::Ssh(name, b) => Box::new(SshStore::from_config(&name, b, runner)?),
    };
    tracing::debug!(backend = %cfg.backend, store = %store.describe(), "blob store resolved");
    Ok(store)
}

fn non_blank(s: &str) -> Option<&str> {
    Some(s.trim()).filter(|t| !t.is_empty())
}

/// Value of the environment variable named by `var`, if set and non-blank.
pub(crate) fn env_value(var: Option<&str>) -> Option<String> {
    let value = std::env::var(var.and_then(non_blank)?).ok()?;
    non_blank(&value).map(str::to_string)
}

/// A config setting: the literal wins, the named variable is the fallback.
pub(crate) fn setting(literal: Option<&str>, var: Option<&str>) -> Option<String> {
    match literal.and_then(non_blank) {
        Some(v) => Some(v.to_string()),
        None => env_value(var),
    }
}

pub(crate) fn required_setting(key: &str, literal: Option<&str>, var: Option<&str>) -> Result<String> {
    if let Some(v) = setting(literal, var) {
        return Ok(v);
    }
    let reason = match var.and_then(non_blank) {
        Some(name) => format!("{key} is not set and ${name} is unset or blank"),
        None => format!("{key} is not set"),
    };
    Err(Error::config(reason))
}

// Substrings CLI tools use when the remote object is absent.
const MISSING_OBJECT_MARKERS: [&str; 5] = ["not found", "404", "no such", "does not exist", "nosuchkey"];

pub(crate) fn reports_missing_object(stderr: &str) -> bool {
    let lower = stderr.to_ascii_lowercase();
    MISSING_OBJECT_MARKERS.iter().any(|m| lower.contains(m))
}

/// Blob names end up in URLs, object keys and remote shell commands.
pub(crate) fn check_blob_name(name: &str) -> Result<()> {
    if name.is_empty()
        || name.starts_with('.')
        || !name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-')
    {
        return Err(Error::msg(format!("invalid blob name '{name}'")));
    }
    Ok(())
}
