#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::{Arc, Mutex};

use sha2::{Digest, Sha256};
use split_checkpoint::codec::Codec;
use split_checkpoint::config::{CheckpointConfig, RetryConfig};
use split_checkpoint::store::{BlobStore, LocalStore};
use split_checkpoint::{Checkpointer, Error, Result};

pub const BOUND: u64 = 16 * 1024;

pub fn have_gnu_tar() -> bool {
    Command::new("tar")
        .arg("--version")
        .output()
        .map(|o| o.status.success() && String::from_utf8_lossy(&o.stdout).contains("GNU tar"))
        .unwrap_or(false)
}

/// Writes an executable stand-in for GNU tar into `dir`. It passes the
/// version check, emits 40000 bytes for `--create`, swallows its input for
/// `--extract`, and exits with the given codes.
pub fn fake_tar(dir: &Path, create_exit: i32, extract_exit: i32) -> PathBuf {
    let path = dir.join("fake-tar");
    let script = format!(
        "#!/bin/sh\n\
         case \"$1\" in\n\
         --version) echo 'tar (GNU tar) 1.35'; exit 0 ;;\n\
         --create) head -c 40000 /dev/zero; exit {create_exit} ;;\n\
         --extract) cat >/dev/null; exit {extract_exit} ;;\n\
         esac\n\
         exit 64\n"
    );
    fs::write(&path, script).expect("write fake tar");
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).expect("chmod fake tar");
    path
}

/// Deterministic filler so volume contents differ from one another.
pub fn pseudo_random(len: usize, seed: u64) -> Vec<u8> {
    let mut x = seed.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
    (0..len)
        .map(|_| {
            x = x.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            (x >> 33) as u8
        })
        .collect()
}

/// Builds `<root>/out` with nested dirs, an empty file, an executable, an
/// empty dir, and a file exactly one volume long.
pub fn populate_tree(root: &Path) {
    let out = root.join("out");
    fs::create_dir_all(out.join("a/b/c")).expect("mkdir nested");
    fs::create_dir_all(out.join("empty_dir")).expect("mkdir empty");
    fs::create_dir_all(out.join("bin")).expect("mkdir bin");
    fs::create_dir_all(out.join("many")).expect("mkdir many");

    fs::write(out.join("a/b/c/deep.bin"), pseudo_random(40_000, 1)).expect("deep");
    fs::write(out.join("empty.txt"), b"").expect("empty");
    fs::write(out.join("boundary.bin"), pseudo_random(BOUND as usize, 2)).expect("boundary");
    let tool = out.join("bin/tool.sh");
    fs::write(&tool, b"#!/bin/sh\necho hi\n").expect("tool");
    fs::set_permissions(&tool, fs::Permissions::from_mode(0o755)).expect("chmod");
    for i in 0..20 {
        fs::write(out.join(format!("many/file{i:02}.txt")), format!("line {i}\n")).expect("many");
    }
}

/// Path -> kind, mode and content hash for everything under `root/rel`.
pub fn snapshot(root: &Path, rel: &str) -> BTreeMap<String, String> {
    let mut out = BTreeMap::new();
    for entry in walkdir::WalkDir::new(root.join(rel)).sort_by_file_name() {
        let entry = entry.expect("walk");
        let path = entry.path();
        let key = path
            .strip_prefix(root)
            .expect("prefix")
            .to_string_lossy()
            .into_owned();
        let meta = fs::symlink_metadata(path).expect("meta");
        let mode = meta.permissions().mode() & 0o7777;
        let value = if meta.is_dir() {
            format!("dir:{mode:o}")
        } else {
            let body = fs::read(path).expect("read");
            format!("file:{mode:o}:{}", hex::encode(Sha256::digest(&body)))
        };
        out.insert(key, value);
    }
    out
}

pub fn dir_bytes(dir: &Path) -> u64 {
    walkdir::WalkDir::new(dir)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .filter_map(|e| e.metadata().ok())
        .map(|m| m.len())
        .sum()
}

#[derive(Debug, Default)]
pub struct CodecLog {
    pub peak_volume_dir_bytes: u64,
    pub compressed: Vec<String>,
    pub decompressed: Vec<String>,
}

/// Identity "compression" that records what it was asked to do and how much
/// the volume directory held at the time.
#[derive(Clone)]
pub struct RecordingCodec {
    pub volume_dir: PathBuf,
    pub log: Arc<Mutex<CodecLog>>,
}

impl RecordingCodec {
    pub fn new(volume_dir: &Path) -> Self {
        Self {
            volume_dir: volume_dir.to_path_buf(),
            log: Arc::new(Mutex::new(CodecLog::default())),
        }
    }
}

fn file_name(p: &Path) -> String {
    p.file_name()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default()
}

impl Codec for RecordingCodec {
    fn name(&self) -> &str {
        "copy"
    }

    fn extension(&self) -> &str {
        "cp"
    }

    fn check_available(&self) -> Result<()> {
        Ok(())
    }

    fn compress(&self, raw: &Path, out: &Path) -> Result<()> {
        fs::copy(raw, out)?;
        let used = dir_bytes(&self.volume_dir);
        let mut log = self.log.lock().expect("lock");
        log.peak_volume_dir_bytes = log.peak_volume_dir_bytes.max(used);
        log.compressed.push(file_name(raw));
        Ok(())
    }

    fn decompress(&self, compressed: &Path, out: &Path) -> Result<()> {
        self.log.lock().expect("lock").decompressed.push(file_name(compressed));
        fs::copy(compressed, out)?;
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct FaultState {
    /// Blob-name substring -> remaining upload failures.
    pub fail_uploads: HashMap<String, u32>,
    pub upload_attempts: HashMap<String, u32>,
}

/// A directory-backed store whose uploads can be made to fail on demand.
pub struct FaultyStore {
    pub inner: LocalStore,
    pub state: Arc<Mutex<FaultState>>,
}

impl FaultyStore {
    pub fn new(root: &Path) -> (Self, Arc<Mutex<FaultState>>) {
        let state = Arc::new(Mutex::new(FaultState::default()));
        (
            Self {
                inner: LocalStore::new(root),
                state: state.clone(),
            },
            state,
        )
    }
}

impl BlobStore for FaultyStore {
    fn describe(&self) -> String {
        format!("faulty {}", self.inner.describe())
    }

    fn upload(&self, name: &str, local_path: &Path) -> Result<()> {
        {
            let mut st = self.state.lock().expect("lock");
            *st.upload_attempts.entry(name.to_string()).or_default() += 1;
            if let Some(left) = st
                .fail_uploads
                .iter_mut()
                .find(|(k, _)| name.contains(k.as_str()))
                .map(|(_, v)| v)
                && *left > 0
            {
                *left -= 1;
                return Err(Error::transfer(format!("injected upload failure for {name}")));
            }
        }
        self.inner.upload(name, local_path)
    }

    fn download(&self, name: &str, dest_dir: &Path) -> Result<PathBuf> {
        self.inner.download(name, dest_dir)
    }

    fn delete(&self, name: &str) -> Result<()> {
        self.inner.delete(name)
    }
}

pub fn test_config(volume_dir: &Path) -> CheckpointConfig {
    CheckpointConfig {
        base_name: "web".into(),
        volume_size: "16K".into(),
        volume_dir: Some(volume_dir.to_string_lossy().into_owned()),
        cleanup_max_volumes: 8,
        retry: RetryConfig {
            attempts: 5,
            delay_secs: 0,
        },
        ..Default::default()
    }
}

pub struct Harness {
    pub tmp: tempfile::TempDir,
    pub work: PathBuf,
    pub store_dir: PathBuf,
    pub volume_dir: PathBuf,
    pub codec_log: Arc<Mutex<CodecLog>>,
    pub faults: Arc<Mutex<FaultState>>,
    pub checkpointer: Checkpointer,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(|_| {})
    }

    pub fn with_config(tweak: impl FnOnce(&mut CheckpointConfig)) -> Self {
        let tmp = tempfile::tempdir().expect("tempdir");
        let work = tmp.path().join("work");
        let store_dir = tmp.path().join("store");
        let volume_dir = tmp.path().join("volumes");
        fs::create_dir_all(&work).expect("work dir");

        let mut cfg = test_config(&volume_dir);
        tweak(&mut cfg);
        let (store, faults) = FaultyStore::new(&store_dir);
        let codec = RecordingCodec::new(&volume_dir);
        let codec_log = codec.log.clone();
        let checkpointer =
            Checkpointer::new(cfg, Box::new(store), Box::new(codec)).expect("checkpointer");
        Self {
            tmp,
            work,
            store_dir,
            volume_dir,
            codec_log,
            faults,
            checkpointer,
        }
    }

    /// A second checkpointer over the same store and volume directory.
    pub fn reopen(&self, tweak: impl FnOnce(&mut CheckpointConfig)) -> Checkpointer {
        let mut cfg = test_config(&self.volume_dir);
        tweak(&mut cfg);
        let codec = RecordingCodec::new(&self.volume_dir);
        Checkpointer::new(cfg, Box::new(LocalStore::new(&self.store_dir)), Box::new(codec))
            .expect("checkpointer")
    }

    pub fn store_view(&self) -> LocalStore {
        LocalStore::new(&self.store_dir)
    }

    pub fn blob_names(&self) -> Vec<String> {
        let Ok(entries) = fs::read_dir(&self.store_dir) else {
            return Vec::new();
        };
        let mut names: Vec<_> = entries
            .flatten()
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .filter(|n| !n.starts_with('.'))
            .collect();
        names.sort();
        names
    }
}
