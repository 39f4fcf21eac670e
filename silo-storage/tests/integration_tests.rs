//! End-to-end flows over the public API: configuration CRUD with digest
//! guards, the dir base/clone lineage, and ZFS snapshot ordering — all over
//! a scripted command runner and an isolated config store.

use silo_core::{CommandOutput, FakeRunner, ImageFormat, SiloError, StorageLocker, VolumeFeature};
use silo_storage::{ConfigApi, FileStore, MemoryStore, PluginRegistry, StorageManager};
use std::collections::BTreeMap;
use std::os::unix::fs::PermissionsExt;
use std::sync::Arc;

fn params(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

fn scripted() -> (Arc<PluginRegistry>, Arc<FakeRunner>) {
    let runner = Arc::new(FakeRunner::new());
    let registry = Arc::new(PluginRegistry::with_defaults(runner.clone()));
    (registry, runner)
}

#[tokio::test]
async fn dir_storage_lifecycle_with_digest_guard() {
    let (registry, runner) = scripted();
    let dir = tempfile::tempdir().unwrap();
    let cfg_dir = tempfile::tempdir().unwrap();
    let store = Arc::new(FileStore::new(cfg_dir.path().join("storage.cfg")));
    let api = ConfigApi::new(
        registry,
        store,
        Arc::new(StorageLocker::in_process()),
        runner,
    );

    // Create, then read back what was stored.
    api.create(&params(&[
        ("storage", "mydir"),
        ("type", "dir"),
        ("path", &dir.path().display().to_string()),
        ("content", "images,iso"),
    ]))
    .await
    .unwrap();

    let (scfg, digest) = api.read("mydir").await.unwrap();
    assert_eq!(scfg.ty, "dir");
    assert_eq!(
        scfg.content.iter().map(|c| c.to_string()).collect::<Vec<_>>(),
        vec!["images", "iso"]
    );

    let (index, _) = api.list(None).await.unwrap();
    assert!(index.iter().any(|s| s.storage == "mydir"));

    // A stale digest is rejected; the one we just read is accepted and the
    // digest moves.
    let stale = format!("{:0>64}", "1");
    let err = api
        .update("mydir", &params(&[("maxfiles", "5")]), Some(&stale))
        .await
        .unwrap_err();
    assert!(matches!(err, SiloError::DigestMismatch(_)));

    let new_digest = api
        .update("mydir", &params(&[("maxfiles", "5")]), Some(&digest))
        .await
        .unwrap();
    assert_ne!(new_digest, digest);

    // The moved digest is what a fresh read reports, and feeding it back
    // with unchanged params is accepted.
    let (_, read_digest) = api.read("mydir").await.unwrap();
    assert_eq!(read_digest, new_digest);
    api.update("mydir", &params(&[("maxfiles", "5")]), Some(&new_digest))
        .await
        .unwrap();
}

#[tokio::test]
async fn dir_base_clone_lineage() {
    let (registry, runner) = scripted();
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(MemoryStore::new(format!(
        "dir: mydir\n\tpath {}\n\tcontent images\n",
        dir.path().display()
    )));
    let manager = StorageManager::new(
        registry,
        store,
        Arc::new(StorageLocker::in_process()),
        None,
    );

    let volid = manager
        .alloc_image("mydir", 100, Some(ImageFormat::Qcow2), None, 1048576)
        .await
        .unwrap();
    assert_eq!(volid, "mydir:100/vm-100-disk-1.qcow2");
    assert_eq!(
        runner.call_lines().last().unwrap(),
        &format!(
            "qemu-img create -o preallocation=metadata -f qcow2 {}/images/100/vm-100-disk-1.qcow2 1048576K",
            dir.path().display()
        )
    );

    // The scripted runner does not create files; place the image by hand
    // before converting it.
    let file = dir.path().join("images/100/vm-100-disk-1.qcow2");
    std::fs::write(&file, b"qcow2").unwrap();
    runner.enqueue(CommandOutput::ok(
        serde_json::json!({ "virtual-size": 1073741824u64, "actual-size": 512 }).to_string(),
    ));

    let base_volid = manager.create_base(&volid).await.unwrap();
    assert_eq!(base_volid, "mydir:100/base-100-disk-1.qcow2");

    let base_file = dir.path().join("images/100/base-100-disk-1.qcow2");
    assert!(base_file.exists());
    let mode = std::fs::metadata(&base_file).unwrap().permissions().mode();
    assert_eq!(mode & 0o777, 0o444);

    assert!(manager
        .volume_has_feature(VolumeFeature::Clone, &base_volid, None)
        .await
        .unwrap());

    let clone_volid = manager.clone_image(&base_volid, 200, None).await.unwrap();
    assert_eq!(
        clone_volid,
        "mydir:100/base-100-disk-1.qcow2/200/vm-200-disk-1.qcow2"
    );

    let clone_call = runner.calls().into_iter().last().unwrap();
    assert_eq!(
        clone_call.argv,
        vec![
            "qemu-img",
            "create",
            "-b",
            "../100/base-100-disk-1.qcow2",
            "-f",
            "qcow2",
            "vm-200-disk-1.qcow2",
        ]
    );
    assert_eq!(
        clone_call.cwd.as_deref(),
        Some(dir.path().join("images/200").as_path())
    );

    let path = manager.volume_path(&clone_volid, None).await.unwrap();
    assert_eq!(
        path.path,
        dir.path().join("images/200/vm-200-disk-1.qcow2").display().to_string()
    );
    assert_eq!(path.vmid, Some(200));
}

#[tokio::test]
async fn zfs_alloc_snapshot_rollback_ordering() {
    let (registry, runner) = scripted();
    let store = Arc::new(MemoryStore::new(
        "zfspool: tank1\n\tpool tank\n\tcontent images\n\tsparse 1\n",
    ));
    let manager = StorageManager::new(
        registry,
        store,
        Arc::new(StorageLocker::in_process()),
        None,
    );

    let pool_listed = || CommandOutput::ok("tank\n");

    // alloc: activate, free-name scan, existence probe, create, udev.
    runner.enqueue(pool_listed());
    runner.enqueue(CommandOutput::ok(""));
    runner.enqueue(CommandOutput::fail(1, "dataset does not exist\n"));
    let volid = manager
        .alloc_image("tank1", 7, None, None, 2097152)
        .await
        .unwrap();
    assert_eq!(volid, "tank1:vm-7-disk-1");
    assert!(runner
        .call_lines()
        .contains(&"zfs create -s -V 2097152k tank/vm-7-disk-1".to_string()));

    // Two snapshots.
    runner.enqueue(pool_listed());
    manager.volume_snapshot(&volid, "a").await.unwrap();
    runner.enqueue(pool_listed());
    manager.volume_snapshot(&volid, "b").await.unwrap();

    // Rolling back past @b is refused.
    let both = "tank/vm-7-disk-1@a\ntank/vm-7-disk-1@b\n";
    runner.enqueue(pool_listed());
    runner.enqueue(CommandOutput::ok(both));
    let err = manager
        .volume_snapshot_rollback(&volid, "a")
        .await
        .unwrap_err();
    assert!(matches!(err, SiloError::MoreRecentSnapshots));

    // Delete @b, then the rollback goes through.
    runner.enqueue(pool_listed());
    manager.volume_snapshot_delete(&volid, "b").await.unwrap();

    runner.enqueue(pool_listed());
    runner.enqueue(CommandOutput::ok("tank/vm-7-disk-1@a\n"));
    manager.volume_snapshot_rollback(&volid, "a").await.unwrap();
    assert_eq!(
        runner.call_lines().last().unwrap(),
        "zfs rollback tank/vm-7-disk-1@a"
    );
}

#[tokio::test(start_paused = true)]
async fn zfs_free_retries_busy_datasets() {
    let (registry, runner) = scripted();
    let store = Arc::new(MemoryStore::new(
        "zfspool: tank1\n\tpool tank\n\tcontent images\n",
    ));
    let manager = StorageManager::new(
        registry,
        store,
        Arc::new(StorageLocker::in_process()),
        None,
    );

    runner.enqueue(CommandOutput::ok("tank\n")); // activation
    for _ in 0..5 {
        runner.enqueue(CommandOutput::fail(1, "dataset is busy\n"));
    }
    runner.enqueue(CommandOutput::ok(""));

    manager.free_image("tank1:vm-7-disk-1").await.unwrap();
    let destroys = runner
        .call_lines()
        .into_iter()
        .filter(|line| line == "zfs destroy -r tank/vm-7-disk-1")
        .count();
    assert_eq!(destroys, 6);
}

#[tokio::test]
async fn delete_with_dependent_base_storage() {
    let (registry, runner) = scripted();
    let api = ConfigApi::new(
        registry,
        Arc::new(MemoryStore::default()),
        Arc::new(StorageLocker::in_process()),
        runner,
    );

    api.create(&params(&[
        ("storage", "iscsi1"),
        ("type", "iscsi"),
        ("portal", "192.168.1.9"),
        ("target", "iqn.2024-01.org.example:storage"),
    ]))
    .await
    .unwrap();
    api.create(&params(&[
        ("storage", "vg1"),
        ("type", "lvm"),
        ("vgname", "vg1"),
        ("base", "iscsi1:lun1"),
    ]))
    .await
    .unwrap();

    let err = api.delete("iscsi1").await.unwrap_err();
    assert_eq!(
        err.to_string(),
        "storage 'iscsi1' is used as base of another storage"
    );

    api.delete("vg1").await.unwrap();
    api.delete("iscsi1").await.unwrap();
}

#[tokio::test]
async fn disabled_and_node_restricted_storages_are_gated() {
    let (registry, _runner) = scripted();
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(MemoryStore::new(format!(
        "dir: offline\n\tpath {p}\n\tdisable 1\n\ndir: elsewhere\n\tpath {p}\n\tnodes other1\n",
        p = dir.path().display()
    )));
    let manager = StorageManager::new(
        registry,
        store,
        Arc::new(StorageLocker::in_process()),
        Some("node1".to_string()),
    );

    assert!(matches!(
        manager.resolve("offline").await.unwrap_err(),
        SiloError::StorageDisabled(_)
    ));
    assert!(matches!(
        manager.resolve("elsewhere").await.unwrap_err(),
        SiloError::NodeRestricted { .. }
    ));
    assert!(manager.resolve_opt("offline", true).await.unwrap().is_none());
    assert!(manager
        .resolve_opt("elsewhere", true)
        .await
        .unwrap()
        .is_none());

    // Both still show up in the aggregate status, inactive.
    let all = manager.status_all().await.unwrap();
    assert!(all.iter().any(|(id, _, st)| id == "offline" && !st.active));
    assert!(!all.iter().any(|(id, _, _)| id == "elsewhere"));
}
