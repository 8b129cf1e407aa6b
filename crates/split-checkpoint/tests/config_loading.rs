use std::fs;

use split_checkpoint::config;
use split_checkpoint::{Checkpointer, ErrorKind};

#[test]
fn extends_overlays_the_base_file() {
    let tmp = tempfile::tempdir().expect("tempdir");
    fs::write(
        tmp.path().join("base.toml"),
        r#"
[checkpoint]
base_name = "browser"
volume_size = "5G"
cleanup_max_volumes = 32

[checkpoint.retry]
attempts = 3

[store]
backend = "local:dev"

[store.local.dev]
dir = "blobs"
"#,
    )
    .expect("write base");
    fs::write(
        tmp.path().join("ci.toml"),
        r#"
extends = "base.toml"

[checkpoint]
volume_size = "512M"
volume_dir = "scratch"
"#,
    )
    .expect("write overlay");

    let doc = config::load(&tmp.path().join("ci.toml")).expect("load");
    let cfg = doc.checkpoint().expect("checkpoint section");
    assert_eq!(cfg.base_name, "browser");
    assert_eq!(cfg.volume_size_bytes().expect("size"), 512 << 20);
    assert_eq!(cfg.cleanup_max_volumes, 32);
    assert_eq!(cfg.retry.attempts, 3);
    assert_eq!(cfg.retry.delay_secs, 10);
    assert_eq!(cfg.volume_dir_path(), tmp.path().join("scratch"));

    let ck = Checkpointer::from_config(&doc).expect("checkpointer");
    assert_eq!(ck.base_name(), "browser");
}

#[test]
fn extends_cycles_are_rejected() {
    let tmp = tempfile::tempdir().expect("tempdir");
    fs::write(tmp.path().join("a.toml"), "extends = \"b.toml\"\n").expect("write a");
    fs::write(tmp.path().join("b.toml"), "extends = \"a.toml\"\n").expect("write b");
    let err = config::load(&tmp.path().join("a.toml")).expect_err("cycle");
    assert_eq!(err.kind(), ErrorKind::Config);
    assert!(err.to_string().contains("cycle"));
}

#[test]
fn invalid_base_name_is_rejected() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let path = tmp.path().join("splitck.toml");
    fs::write(&path, "[checkpoint]\nbase_name = \"../escape\"\n").expect("write");
    let doc = config::load(&path).expect("load");
    let err = doc.checkpoint().expect_err("bad name");
    assert_eq!(err.kind(), ErrorKind::Config);
}

#[test]
fn missing_config_file_is_a_config_error() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let err = config::load(&tmp.path().join("nope.toml")).expect_err("missing");
    assert_eq!(err.kind(), ErrorKind::Config);
}
