mod common;

use std::fs;

use common::{BOUND, Harness, have_gnu_tar, populate_tree, snapshot};
use split_checkpoint::manifest::{ManifestManager, manifest_blob_name};
use split_checkpoint::volume::RetryPolicy;

#[test]
fn restore_reproduces_the_archived_tree() {
    if !have_gnu_tar() {
        eprintln!("skipping: GNU tar not found");
        return;
    }
    let h = Harness::new();
    populate_tree(&h.work);
    let before = snapshot(&h.work, "out");

    let manifest = h
        .checkpointer
        .create_checkpoint(&["out".to_string()], &h.work)
        .expect("create");
    assert!(manifest.volume_count >= 3, "got {} volume(s)", manifest.volume_count);
    assert_eq!(manifest.volumes.len(), manifest.volume_count as usize);
    assert_eq!(manifest.volumes[0], "web.vol0001.tar.cp");
    assert_eq!(manifest.compression.as_deref(), Some("copy"));
    assert_eq!(manifest.paths, vec!["out".to_string()]);
    assert_eq!(manifest.volume_size_nominal, "16K");

    // Sources were consumed by the archive step.
    assert!(!h.work.join("out").exists());
    for name in &manifest.volumes {
        assert!(h.store_dir.join(name).is_file(), "{name} missing from store");
    }
    assert!(h.store_dir.join(manifest_blob_name("web")).is_file());

    let restored = h.checkpointer.restore_checkpoint(&h.work).expect("restore");
    assert_eq!(restored, manifest);
    assert_eq!(snapshot(&h.work, "out"), before);
    assert_eq!(common::dir_bytes(&h.volume_dir), 0);
}

#[test]
fn restore_into_a_fresh_directory() {
    if !have_gnu_tar() {
        eprintln!("skipping: GNU tar not found");
        return;
    }
    let h = Harness::with_config(|cfg| cfg.remove_source_files = false);
    populate_tree(&h.work);
    h.checkpointer
        .create_checkpoint(&["out".to_string()], &h.work)
        .expect("create");
    assert!(h.work.join("out/boundary.bin").is_file());

    let fresh = h.tmp.path().join("fresh");
    h.checkpointer.restore_checkpoint(&fresh).expect("restore");
    assert_eq!(snapshot(&fresh, "out"), snapshot(&h.work, "out"));
}

#[test]
fn volume_dir_never_holds_more_than_two_volumes() {
    if !have_gnu_tar() {
        eprintln!("skipping: GNU tar not found");
        return;
    }
    let h = Harness::new();
    populate_tree(&h.work);
    let manifest = h
        .checkpointer
        .create_checkpoint(&["out".to_string()], &h.work)
        .expect("create");

    let log = h.codec_log.lock().expect("lock");
    assert_eq!(log.compressed.len(), manifest.volume_count as usize);
    assert!(
        log.peak_volume_dir_bytes <= 2 * BOUND,
        "peak {} exceeds two volumes",
        log.peak_volume_dir_bytes
    );
    // Each raw volume is gone before the next one is started.
    assert_eq!(
        log.compressed,
        (1..=manifest.volume_count)
            .map(|i| format!("web.vol{i:04}.tar"))
            .collect::<Vec<_>>()
    );
}

#[test]
fn volumes_fed_out_of_order_do_not_restore_the_tree() {
    if !have_gnu_tar() {
        eprintln!("skipping: GNU tar not found");
        return;
    }
    let h = Harness::new();
    populate_tree(&h.work);
    let before = snapshot(&h.work, "out");
    let mut manifest = h
        .checkpointer
        .create_checkpoint(&["out".to_string()], &h.work)
        .expect("create");

    manifest.volumes.reverse();
    let view = h.store_view();
    let retry = RetryPolicy {
        attempts: 1,
        delay: std::time::Duration::ZERO,
    };
    ManifestManager::new(&view, retry, h.tmp.path().join("scratch"))
        .publish(&manifest)
        .expect("republish");

    let dest = h.tmp.path().join("reordered");
    let res = h.checkpointer.restore_checkpoint(&dest);
    let same = dest.join("out").exists() && snapshot(&dest, "out") == before;
    assert!(res.is_err() || !same, "reordered volumes restored the original tree");
}

#[test]
fn a_new_checkpoint_replaces_the_previous_one() {
    if !have_gnu_tar() {
        eprintln!("skipping: GNU tar not found");
        return;
    }
    let h = Harness::with_config(|cfg| cfg.cleanup_max_volumes = 1);
    populate_tree(&h.work);
    let first = h
        .checkpointer
        .create_checkpoint(&["out".to_string()], &h.work)
        .expect("first create");
    assert!(first.volume_count > 1);

    fs::create_dir_all(h.work.join("small")).expect("mkdir");
    fs::write(h.work.join("small/only.txt"), b"tiny").expect("write");
    let second = h
        .checkpointer
        .create_checkpoint(&["small".to_string()], &h.work)
        .expect("second create");
    assert_eq!(second.volume_count, 1);

    // Volumes past cleanup_max_volumes are still swept via the old volumeCount.
    let mut expected = second.volumes.clone();
    expected.push(manifest_blob_name("web"));
    expected.sort();
    assert_eq!(h.blob_names(), expected);
}

#[test]
fn discard_removes_every_blob() {
    if !have_gnu_tar() {
        eprintln!("skipping: GNU tar not found");
        return;
    }
    let h = Harness::new();
    populate_tree(&h.work);
    h.checkpointer
        .create_checkpoint(&["out".to_string()], &h.work)
        .expect("create");
    assert!(!h.blob_names().is_empty());

    h.checkpointer.discard_checkpoint();
    assert!(h.blob_names().is_empty());
    let err = h.checkpointer.load_manifest().expect_err("gone");
    assert!(err.is_not_found());
}
