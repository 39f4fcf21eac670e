use super::scripted_registry;
use crate::plugins::DirPlugin;
use crate::section::StorageConfig;
use crate::StoragePlugin;
use silo_core::{CommandOutput, FakeRunner, ImageFormat, VolumeFeature};
use std::collections::BTreeMap;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::sync::Arc;

fn dir_scfg(storeid: &str, path: &Path, content: &str) -> StorageConfig {
    let (registry, _) = scripted_registry();
    let params: BTreeMap<String, String> = [
        ("type".to_string(), "dir".to_string()),
        ("path".to_string(), path.display().to_string()),
        ("content".to_string(), content.to_string()),
    ]
    .into();
    registry.check_config(storeid, &params, true, true).unwrap()
}

fn setup() -> (tempfile::TempDir, Arc<FakeRunner>, DirPlugin, StorageConfig) {
    let dir = tempfile::tempdir().unwrap();
    let runner = Arc::new(FakeRunner::new());
    let plugin = DirPlugin::new(runner.clone());
    let scfg = dir_scfg("store1", dir.path(), "images,iso");
    (dir, runner, plugin, scfg)
}

fn touch(path: &Path) {
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(path, b"x").unwrap();
}

fn info_json(size: u64, backing: Option<&str>) -> CommandOutput {
    let mut info = serde_json::json!({
        "virtual-size": size,
        "actual-size": 1536,
        "format": "qcow2",
    });
    if let Some(backing) = backing {
        info["backing-filename"] = serde_json::json!(backing);
    }
    CommandOutput::ok(info.to_string())
}

#[tokio::test]
async fn alloc_picks_next_free_name() {
    let (dir, runner, plugin, scfg) = setup();
    touch(&dir.path().join("images/100/vm-100-disk-1.raw"));
    touch(&dir.path().join("images/100/base-100-disk-2.qcow2"));

    let volname = plugin
        .alloc_image(&scfg, 100, ImageFormat::Qcow2, None, 4194304)
        .await
        .unwrap();
    assert_eq!(volname, "100/vm-100-disk-3.qcow2");

    let expected = format!(
        "qemu-img create -o preallocation=metadata -f qcow2 {}/images/100/vm-100-disk-3.qcow2 4194304K",
        dir.path().display()
    );
    assert_eq!(runner.call_lines(), vec![expected]);
}

#[tokio::test]
async fn alloc_raw_has_no_preallocation() {
    let (dir, runner, plugin, scfg) = setup();
    let volname = plugin
        .alloc_image(&scfg, 7, ImageFormat::Raw, None, 1024)
        .await
        .unwrap();
    assert_eq!(volname, "7/vm-7-disk-1.raw");
    let expected = format!(
        "qemu-img create -f raw {}/images/7/vm-7-disk-1.raw 1024K",
        dir.path().display()
    );
    assert_eq!(runner.call_lines(), vec![expected]);
}

#[tokio::test]
async fn alloc_rejects_name_format_mismatch() {
    let (_dir, runner, plugin, scfg) = setup();
    let err = plugin
        .alloc_image(&scfg, 100, ImageFormat::Qcow2, Some("vm-100-disk-1.raw"), 1024)
        .await
        .unwrap_err();
    assert!(err.to_string().contains("wrong extension"), "{err}");
    // Fails before anything is spawned.
    assert!(runner.calls().is_empty());

    let err = plugin
        .alloc_image(&scfg, 100, ImageFormat::Raw, Some("vm-101-disk-1.raw"), 1024)
        .await
        .unwrap_err();
    assert!(err.to_string().contains("illegal image name"), "{err}");
}

#[tokio::test]
async fn alloc_rejects_existing_image() {
    let (dir, runner, plugin, scfg) = setup();
    touch(&dir.path().join("images/100/vm-100-disk-1.raw"));
    let err = plugin
        .alloc_image(&scfg, 100, ImageFormat::Raw, Some("vm-100-disk-1.raw"), 1024)
        .await
        .unwrap_err();
    assert!(err.to_string().contains("already exists"), "{err}");
    assert!(runner.calls().is_empty());
}

#[tokio::test]
async fn clone_runs_relative_to_image_dir() {
    let (dir, runner, plugin, scfg) = setup();
    let cloned = plugin
        .clone_image(&scfg, "100/base-100-disk-1.qcow2", 200, None)
        .await
        .unwrap();
    assert_eq!(cloned, "100/base-100-disk-1.qcow2/200/vm-200-disk-1.qcow2");

    let calls = runner.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(
        calls[0].argv,
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
        calls[0].cwd.as_deref(),
        Some(dir.path().join("images/200").as_path())
    );
}

#[tokio::test]
async fn clone_requires_base_image() {
    let (_dir, _runner, plugin, scfg) = setup();
    let err = plugin
        .clone_image(&scfg, "100/vm-100-disk-1.qcow2", 200, None)
        .await
        .unwrap_err();
    assert!(err.to_string().contains("requires a base image"), "{err}");
}

#[tokio::test]
async fn create_base_renames_and_protects() {
    let (dir, runner, plugin, scfg) = setup();
    let file = dir.path().join("images/100/vm-100-disk-1.qcow2");
    touch(&file);
    runner.enqueue(info_json(1073741824, None));

    let newname = plugin
        .create_base(&scfg, "100/vm-100-disk-1.qcow2")
        .await
        .unwrap();
    assert_eq!(newname, "100/base-100-disk-1.qcow2");

    let newfile = dir.path().join("images/100/base-100-disk-1.qcow2");
    assert!(!file.exists());
    assert!(newfile.exists());
    let mode = std::fs::metadata(&newfile).unwrap().permissions().mode();
    assert_eq!(mode & 0o777, 0o444);

    let lines = runner.call_lines();
    assert!(lines[0].starts_with("qemu-img info --output=json"), "{lines:?}");
    assert_eq!(lines[1], format!("chattr +i {}", newfile.display()));
}

#[tokio::test]
async fn create_base_verifies_backing_reference() {
    let (dir, runner, plugin, scfg) = setup();
    touch(&dir.path().join("images/100/vm-100-disk-1.qcow2"));
    // A plain volume must not have a backing file.
    runner.enqueue(info_json(1024, Some("../99/base-99-disk-1.qcow2")));
    let err = plugin
        .create_base(&scfg, "100/vm-100-disk-1.qcow2")
        .await
        .unwrap_err();
    assert!(err.to_string().contains("backing file check failed"), "{err}");

    // A linked clone must reference exactly its named parent.
    touch(&dir.path().join("images/200/vm-200-disk-1.qcow2"));
    runner.enqueue(info_json(1024, Some("../100/base-100-disk-1.qcow2")));
    let newname = plugin
        .create_base(&scfg, "100/base-100-disk-1.qcow2/200/vm-200-disk-1.qcow2")
        .await
        .unwrap();
    assert_eq!(newname, "100/base-100-disk-1.qcow2/200/base-200-disk-1.qcow2");
}

#[tokio::test]
async fn snapshots_require_qcow2() {
    let (dir, runner, plugin, scfg) = setup();
    let err = plugin
        .volume_snapshot(&scfg, "100/vm-100-disk-1.raw", "snap1")
        .await
        .unwrap_err();
    assert!(err.to_string().contains("not supported for image format"), "{err}");
    assert!(runner.calls().is_empty());

    plugin
        .volume_snapshot(&scfg, "100/vm-100-disk-1.qcow2", "snap1")
        .await
        .unwrap();
    plugin
        .volume_snapshot_delete(&scfg, "100/vm-100-disk-1.qcow2", "snap1")
        .await
        .unwrap();
    plugin
        .volume_snapshot_rollback(&scfg, "100/vm-100-disk-1.qcow2", "snap1")
        .await
        .unwrap();

    let file = dir.path().join("images/100/vm-100-disk-1.qcow2");
    let expected: Vec<String> = ["-c", "-d", "-a"]
        .iter()
        .map(|op| format!("qemu-img snapshot {op} snap1 {}", file.display()))
        .collect();
    assert_eq!(runner.call_lines(), expected);
}

#[tokio::test]
async fn resize_rejects_vmdk() {
    let (dir, runner, plugin, scfg) = setup();
    assert!(plugin
        .volume_resize(&scfg, "100/vm-100-disk-1.vmdk", 1 << 30)
        .await
        .is_err());
    assert!(runner.calls().is_empty());

    let size = plugin
        .volume_resize(&scfg, "100/vm-100-disk-1.raw", 1 << 30)
        .await
        .unwrap();
    assert_eq!(size, 1 << 30);
    let file = dir.path().join("images/100/vm-100-disk-1.raw");
    assert_eq!(
        runner.call_lines(),
        vec![format!("qemu-img resize {} 1073741824", file.display())]
    );
}

#[tokio::test]
async fn feature_matrix() {
    let (_dir, _runner, plugin, scfg) = setup();
    let cases = [
        (VolumeFeature::Snapshot, "100/vm-100-disk-1.qcow2", None, true),
        (VolumeFeature::Snapshot, "100/vm-100-disk-1.raw", None, false),
        (VolumeFeature::Snapshot, "100/base-100-disk-1.qcow2", None, false),
        (VolumeFeature::Clone, "100/base-100-disk-1.qcow2", None, true),
        (VolumeFeature::Clone, "100/base-100-disk-1.raw", None, true),
        (VolumeFeature::Clone, "100/vm-100-disk-1.qcow2", None, false),
        (VolumeFeature::Template, "100/vm-100-disk-1.raw", None, true),
        (VolumeFeature::Template, "100/base-100-disk-1.raw", None, false),
        (VolumeFeature::Copy, "100/vm-100-disk-1.qcow2", Some("s"), true),
        (VolumeFeature::Copy, "100/vm-100-disk-1.raw", Some("s"), false),
        (VolumeFeature::Copy, "100/base-100-disk-1.vmdk", None, true),
    ];
    for (feature, volname, snap, expected) in cases {
        let got = plugin
            .volume_has_feature(&scfg, feature, volname, snap)
            .unwrap();
        assert_eq!(got, expected, "{feature} {volname} {snap:?}");
    }
}

#[tokio::test]
async fn activate_creates_content_directories() {
    let dir = tempfile::tempdir().unwrap();
    let runner = Arc::new(FakeRunner::new());
    let plugin = DirPlugin::new(runner);
    let scfg = dir_scfg("store1", dir.path(), "images,iso,backup,rootdir");

    plugin.activate_storage(&scfg).await.unwrap();
    for sub in ["images", "template/iso", "dump", "private"] {
        assert!(dir.path().join(sub).is_dir(), "{sub}");
    }

    // Idempotent.
    plugin.activate_storage(&scfg).await.unwrap();

    let missing = dir_scfg("store2", Path::new("/nonexistent/silo-test"), "images");
    assert!(plugin.activate_storage(&missing).await.is_err());
}

#[tokio::test]
async fn status_reports_filesystem_usage() {
    let (_dir, _runner, plugin, scfg) = setup();
    let status = plugin.status(&scfg).await.unwrap();
    assert!(status.active);
    assert!(status.total > 0);
    assert!(status.total >= status.used);

    let missing = dir_scfg("store2", Path::new("/nonexistent/silo-test"), "images");
    let status = plugin.status(&missing).await.unwrap();
    assert!(!status.active);
    assert_eq!(status.total, 0);
}

#[tokio::test]
async fn list_images_reports_lineage() {
    let (dir, runner, plugin, scfg) = setup();
    touch(&dir.path().join("images/100/base-100-disk-1.qcow2"));
    touch(&dir.path().join("images/100/vm-100-disk-2.raw"));
    touch(&dir.path().join("images/200/vm-200-disk-1.qcow2"));
    touch(&dir.path().join("images/100/README"));

    // Owners ascending, names sorted within one owner.
    runner.enqueue(info_json(1 << 30, None));
    runner.enqueue(info_json(2 << 30, None));
    runner.enqueue(info_json(1 << 30, Some("../100/base-100-disk-1.qcow2")));

    let entries = plugin.list_images(&scfg, None, None).await.unwrap();
    let volids: Vec<&str> = entries.iter().map(|e| e.volid.as_str()).collect();
    assert_eq!(
        volids,
        vec![
            "store1:100/base-100-disk-1.qcow2",
            "store1:100/vm-100-disk-2.raw",
            "store1:100/base-100-disk-1.qcow2/200/vm-200-disk-1.qcow2",
        ]
    );
    assert_eq!(entries[2].parent.as_deref(), Some("../100/base-100-disk-1.qcow2"));
    assert_eq!(entries[0].vmid, Some(100));
    assert_eq!(entries[1].size, 2 << 30);
}

#[tokio::test]
async fn list_images_covers_declared_content_namespaces() {
    let dir = tempfile::tempdir().unwrap();
    let runner = Arc::new(FakeRunner::new());
    let plugin = DirPlugin::new(runner);
    let scfg = dir_scfg("store1", dir.path(), "images,iso,vztmpl,backup,rootdir");

    touch(&dir.path().join("template/iso/debian-12.iso"));
    touch(&dir.path().join("template/cache/debian-12-standard.tar.gz"));
    touch(&dir.path().join("dump/vzdump-qemu-100-test.vma.gz"));
    touch(&dir.path().join("dump/notes.txt"));
    std::fs::create_dir_all(dir.path().join("private/105")).unwrap();

    let entries = plugin.list_images(&scfg, None, None).await.unwrap();
    let volids: Vec<&str> = entries.iter().map(|e| e.volid.as_str()).collect();
    assert_eq!(
        volids,
        vec![
            "store1:iso/debian-12.iso",
            "store1:vztmpl/debian-12-standard.tar.gz",
            "store1:backup/vzdump-qemu-100-test.vma.gz",
            "store1:rootdir/105",
        ]
    );
    assert_eq!(entries[2].vmid, Some(100));
    assert_eq!(entries[3].vmid, Some(105));
    assert_eq!(entries[0].size, 1);

    // The owner filter keeps owned content only.
    let entries = plugin.list_images(&scfg, Some(100), None).await.unwrap();
    let volids: Vec<&str> = entries.iter().map(|e| e.volid.as_str()).collect();
    assert_eq!(volids, vec!["store1:backup/vzdump-qemu-100-test.vma.gz"]);

    // Undeclared namespaces stay hidden even when their files exist.
    let images_only = dir_scfg("store1", dir.path(), "images");
    assert!(plugin
        .list_images(&images_only, None, None)
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn list_images_filters_by_owner() {
    let (dir, runner, plugin, scfg) = setup();
    touch(&dir.path().join("images/100/vm-100-disk-1.raw"));
    touch(&dir.path().join("images/200/vm-200-disk-1.raw"));
    runner.enqueue(info_json(1 << 20, None));

    let entries = plugin.list_images(&scfg, Some(200), None).await.unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].volid, "store1:200/vm-200-disk-1.raw");
}
