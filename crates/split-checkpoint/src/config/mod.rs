use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use serde::de::DeserializeOwned;
use toml::Value;

use crate::error::{Error, Result};

pub const DEFAULT_CONFIG_FILE: &str = "splitck.toml";

#[derive(Debug, Clone)]
pub struct ConfigDoc {
    pub path: PathBuf,
    pub value: Value,
}

impl ConfigDoc {
    pub fn from_toml_str(path: impl Into<PathBuf>, raw: &str) -> Result<Self> {
        let path = path.into();
        let value: Value = toml::from_str(raw)
            .map_err(|e| Error::config(format!("TOML parse error in {}: {e}", path.display())))?;
        Ok(Self { path, value })
    }

    pub fn value_path(&self, path: &str) -> Option<&Value> {
        let path = path.trim();
        if path.is_empty() {
            return Some(&self.value);
        }
        let mut cur = &self.value;
        for seg in path.split('.') {
            cur = cur.as_table()?.get(seg)?;
        }
        Some(cur)
    }

    pub fn deserialize_path<T: DeserializeOwned>(&self, path: &str) -> Result<Option<T>> {
        let Some(v) = self.value_path(path) else {
            return Ok(None);
        };
        let parsed = v
            .clone()
            .try_into()
            .map_err(|e| Error::config(format!("invalid config at '{path}': {e}")))?;
        Ok(Some(parsed))
    }

    /// Relative paths in the config are rooted at the config file's directory.
    pub fn resolve_path(&self, raw: &str) -> PathBuf {
        let p = PathBuf::from(raw.trim());
        if p.is_absolute() {
            return p;
        }
        self.path
            .parent()
            .unwrap_or_else(|| Path::new("."))
            .join(p)
    }

    pub fn checkpoint(&self) -> Result<CheckpointConfig> {
        let mut cfg: CheckpointConfig = self.deserialize_path("checkpoint")?.unwrap_or_default();
        if let Some(dir) = cfg.volume_dir.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
            cfg.volume_dir = Some(self.resolve_path(dir).to_string_lossy().into_owned());
        }
        cfg.validate()?;
        Ok(cfg)
    }
}

fn merge_values(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (Value::Table(base_tbl), Value::Table(overlay_tbl)) => {
            for (k, v) in overlay_tbl {
                match base_tbl.get_mut(&k) {
                    Some(existing) => merge_values(existing, v),
                    None => {
                        base_tbl.insert(k, v);
                    }
                }
            }
        }
        (slot, v) => *slot = v,
    }
}

fn load_value(path: &Path, seen: &mut HashSet<PathBuf>) -> Result<Value> {
    let canonical = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
    if !seen.insert(canonical.clone()) {
        return Err(Error::config(format!(
            "config extends cycle at {}",
            canonical.display()
        )));
    }

    let raw = fs::read_to_string(path)
        .map_err(|e| Error::config(format!("failed to read config {}: {e}", path.display())))?;
    let mut value: Value = toml::from_str(&raw)
        .map_err(|e| Error::config(format!("TOML parse error in {}: {e}", path.display())))?;

    // `extends = "base.toml"` at the root: the base is loaded first, this file overlays it.
    let mut out = Value::Table(Default::default());
    if let Some(tbl) = value.as_table_mut()
        && let Some(ext) = tbl.remove("extends")
    {
        let Some(ext) = ext.as_str() else {
            return Err(Error::config(format!(
                "'extends' in {} must be a string",
                path.display()
            )));
        };
        let base = path.parent().unwrap_or_else(|| Path::new(".")).join(ext);
        out = load_value(&base, seen)?;
    }
    merge_values(&mut out, value);
    seen.remove(&canonical);
    Ok(out)
}

pub fn load(path: &Path) -> Result<ConfigDoc> {
    let mut seen = HashSet::new();
    let value = load_value(path, &mut seen)?;
    Ok(ConfigDoc {
        path: path.to_path_buf(),
        value,
    })
}

fn default_base_name() -> String {
    "checkpoint".into()
}

fn default_volume_size() -> String {
    "5G".into()
}

fn default_cleanup_max_volumes() -> u32 {
    64
}

fn default_true() -> bool {
    true
}

fn default_tar_program() -> String {
    "tar".into()
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CompressionConfig {
    pub program: String,
    pub level: i32,
    /// 0 means one thread per core.
    pub threads: usize,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            program: "zstd".into(),
            level: 3,
            threads: 0,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub attempts: u32,
    pub delay_secs: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            attempts: 5,
            delay_secs: 10,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CheckpointConfig {
    #[serde(default = "default_base_name")]
    pub base_name: String,
    #[serde(default = "default_volume_size")]
    pub volume_size: String,
    pub volume_dir: Option<String>,
    #[serde(default = "default_cleanup_max_volumes")]
    pub cleanup_max_volumes: u32,
    #[serde(default = "default_true")]
    pub remove_source_files: bool,
    #[serde(default = "default_tar_program")]
    pub tar_program: String,
    pub compression: CompressionConfig,
    pub retry: RetryConfig,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            base_name: default_base_name(),
            volume_size: default_volume_size(),
            volume_dir: None,
            cleanup_max_volumes: default_cleanup_max_volumes(),
            remove_source_files: true,
            tar_program: default_tar_program(),
            compression: CompressionConfig::default(),
            retry: RetryConfig::default(),
        }
    }
}

impl CheckpointConfig {
    pub fn validate(&self) -> Result<()> {
        safe_name(&self.base_name)?;
        self.volume_size_bytes()?;
        if self.retry.attempts == 0 {
            return Err(Error::config("checkpoint.retry.attempts must be at least 1"));
        }
        Ok(())
    }

    pub fn volume_size_bytes(&self) -> Result<u64> {
        parse_size(&self.volume_size)
            .map_err(|e| Error::config(format!("checkpoint.volume_size: {e}")))
    }

    pub fn volume_dir_path(&self) -> PathBuf {
        match self
            .volume_dir
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
        {
            Some(dir) => PathBuf::from(dir),
            None => std::env::temp_dir().join(format!("splitck-{}", self.base_name.trim())),
        }
    }
}

/// Base names become blob names, so keep them to a filename-safe alphabet.
pub fn safe_name(name: &str) -> Result<&str> {
    let name = name.trim();
    if name.is_empty() {
        return Err(Error::config("checkpoint base name is empty"));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-')
        || name.starts_with('.')
    {
        return Err(Error::config(format!(
            "checkpoint base name '{name}' contains invalid characters"
        )));
    }
    Ok(name)
}

/// Parses `5G`, `512M`, `64k`, `1GiB` or a plain byte count. Units are binary.
pub fn parse_size(raw: &str) -> std::result::Result<u64, String> {
    let s = raw.trim();
    let split = s
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(s.len());
    let (digits, unit) = s.split_at(split);
    if digits.is_empty() {
        return Err(format!("'{raw}' does not start with a number"));
    }
    let n: u64 = digits
        .parse()
        .map_err(|e| format!("'{raw}' is not a valid size: {e}"))?;
    let shift = match unit.trim().to_ascii_lowercase().as_str() {
        "" | "b" => 0,
        "k" | "kb" | "kib" => 10,
        "m" | "mb" | "mib" => 20,
        "g" | "gb" | "gib" => 30,
        "t" | "tb" | "tib" => 40,
        other => return Err(format!("unknown size unit '{other}' in '{raw}'")),
    };
    let bytes = n
        .checked_mul(1u64 << shift)
        .ok_or_else(|| format!("'{raw}' overflows"))?;
    if bytes == 0 {
        return Err("size must be greater than zero".into());
    }
    Ok(bytes)
}

/// Parses `5h30m`, `90s`, `45m` or a plain number of seconds.
pub fn parse_duration(raw: &str) -> std::result::Result<Duration, String> {
    let s = raw.trim();
    if s.is_empty() {
        return Err("empty duration".into());
    }
    if let Ok(secs) = s.parse::<u64>() {
        return Ok(Duration::from_secs(secs));
    }
    let mut total = 0u64;
    let mut num = String::new();
    for c in s.chars() {
        if c.is_ascii_digit() {
            num.push(c);
            continue;
        }
        let mult = match c {
            'h' => 3600,
            'm' => 60,
            's' => 1,
            _ => return Err(format!("unknown duration unit '{c}' in '{raw}'")),
        };
        let n: u64 = num
            .parse()
            .map_err(|_| format!("missing number before '{c}' in '{raw}'"))?;
        total += n * mult;
        num.clear();
    }
    if !num.is_empty() {
        return Err(format!("trailing number without unit in '{raw}'"));
    }
    Ok(Duration::from_secs(total))
}
