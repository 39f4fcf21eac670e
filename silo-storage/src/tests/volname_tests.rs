use crate::volname::*;
use silo_core::{ContentType, ImageFormat};

#[test]
fn owned_image_names() {
    let (is_base, vmid, format) = parse_dir_image_name("vm-100-disk-1.raw").unwrap();
    assert!(!is_base);
    assert_eq!(vmid, 100);
    assert_eq!(format, ImageFormat::Raw);

    let (is_base, vmid, format) = parse_dir_image_name("base-9000-disk-2.qcow2").unwrap();
    assert!(is_base);
    assert_eq!(vmid, 9000);
    assert_eq!(format, ImageFormat::Qcow2);

    assert!(parse_dir_image_name("vm-100-disk-1").is_err());
    assert!(parse_dir_image_name("vm-100-disk-1.qed").is_err());
    assert!(parse_dir_image_name("vm-abc-disk-1.raw").is_err());
    assert!(parse_dir_image_name("vm-100-.raw").is_err());
    assert!(parse_dir_image_name("disk-100-1.raw").is_err());
    assert!(parse_dir_image_name("vm-100-disk-1.subvol").is_err());
}

#[test]
fn zfs_dataset_names() {
    let (is_base, vmid, format) = parse_zfs_dataset_name("vm-7-disk-1").unwrap();
    assert!(!is_base);
    assert_eq!(vmid, 7);
    assert_eq!(format, ImageFormat::Raw);

    let (is_base, vmid, format) = parse_zfs_dataset_name("subvol-200-disk-1").unwrap();
    assert!(!is_base);
    assert_eq!(vmid, 200);
    assert_eq!(format, ImageFormat::Subvol);

    assert!(parse_zfs_dataset_name("base-100-disk-1").unwrap().0);
    assert!(parse_zfs_dataset_name("vm-100").is_err());
    assert!(parse_zfs_dataset_name("tank").is_err());
}

#[test]
fn dir_volname_images() {
    let parsed = parse_dir_volname("100/vm-100-disk-1.qcow2").unwrap();
    assert_eq!(parsed.vtype, ContentType::Images);
    assert_eq!(parsed.vmid, Some(100));
    assert_eq!(parsed.name, "vm-100-disk-1.qcow2");
    assert!(!parsed.is_base);
    assert_eq!(parsed.format, Some(ImageFormat::Qcow2));
    assert_eq!(parsed.basename, None);

    // Directory segment and owner in the name must agree.
    assert!(parse_dir_volname("101/vm-100-disk-1.qcow2").is_err());
}

#[test]
fn dir_volname_linked_clone() {
    let parsed = parse_dir_volname("100/base-100-disk-1.qcow2/200/vm-200-disk-1.qcow2").unwrap();
    assert_eq!(parsed.vmid, Some(200));
    assert_eq!(parsed.base_vmid, Some(100));
    assert_eq!(parsed.basename.as_deref(), Some("base-100-disk-1.qcow2"));
    assert!(!parsed.is_base);

    // The first segment must name a base image.
    assert!(parse_dir_volname("100/vm-100-disk-1.qcow2/200/vm-200-disk-1.qcow2").is_err());
    assert!(parse_dir_volname("101/base-100-disk-1.qcow2/200/vm-200-disk-1.qcow2").is_err());
}

#[test]
fn dir_volname_other_content() {
    let parsed = parse_dir_volname("iso/debian-12.iso").unwrap();
    assert_eq!(parsed.vtype, ContentType::Iso);
    assert_eq!(parsed.vmid, None);

    let parsed = parse_dir_volname("vztmpl/debian-12-standard.tar.gz").unwrap();
    assert_eq!(parsed.vtype, ContentType::Vztmpl);

    let parsed = parse_dir_volname("rootdir/105").unwrap();
    assert_eq!(parsed.vtype, ContentType::Rootdir);
    assert_eq!(parsed.vmid, Some(105));

    let parsed = parse_dir_volname("backup/vzdump-qemu-100-2024_01_01-12_00_00.vma.lzo").unwrap();
    assert_eq!(parsed.vtype, ContentType::Backup);
    assert_eq!(parsed.vmid, Some(100));

    assert!(parse_dir_volname("iso/.iso").is_err());
    assert!(parse_dir_volname("iso/dir/x.iso").is_err());
    assert!(parse_dir_volname("rootdir/abc").is_err());
    assert!(parse_dir_volname("backup/backup.tar").is_err());
    assert!(parse_dir_volname("template/foo").is_err());
}

#[test]
fn backup_names() {
    assert_eq!(parse_backup_name("vzdump-qemu-100-x.vma.gz").unwrap(), 100);
    assert_eq!(parse_backup_name("vzdump-openvz-7-x.tar.lzo").unwrap(), 7);
    assert_eq!(parse_backup_name("vzdump-qemu-12-a-b.tgz").unwrap(), 12);
    assert!(parse_backup_name("vzdump-qemu-100.vma").is_err());
    assert!(parse_backup_name("vzdump-lxc-100-x.tar").is_err());
    assert!(parse_backup_name("dump-qemu-100-x.tar").is_err());
    assert!(parse_backup_name("vzdump-qemu-100-x.zip").is_err());
}

#[test]
fn zfs_volname_lineage() {
    let parsed = parse_zfs_volname("vm-7-disk-1").unwrap();
    assert_eq!(parsed.vmid, Some(7));
    assert_eq!(parsed.basename, None);

    let parsed = parse_zfs_volname("base-100-disk-1/vm-200-disk-1").unwrap();
    assert_eq!(parsed.vmid, Some(200));
    assert_eq!(parsed.base_vmid, Some(100));
    assert_eq!(parsed.basename.as_deref(), Some("base-100-disk-1"));

    let parsed = parse_zfs_volname("subvol-300-disk-1").unwrap();
    assert_eq!(parsed.vtype, ContentType::Rootdir);
    assert_eq!(parsed.format, Some(ImageFormat::Subvol));

    // Lineage prefix must itself be a base volume.
    assert!(parse_zfs_volname("vm-100-disk-1/vm-200-disk-1").is_err());
    assert!(parse_zfs_volname("a/b/c").is_err());
}

#[test]
fn volname_round_trips() {
    for volname in [
        "100/vm-100-disk-1.raw",
        "100/base-100-disk-1.qcow2",
        "100/base-100-disk-1.qcow2/200/vm-200-disk-1.qcow2",
    ] {
        let parsed = parse_dir_volname(volname).unwrap();
        assert_eq!(format_dir_volname(&parsed), volname);
    }
    for volname in [
        "vm-7-disk-1",
        "base-100-disk-2",
        "subvol-300-disk-1",
        "base-100-disk-1/vm-200-disk-1",
    ] {
        let parsed = parse_zfs_volname(volname).unwrap();
        assert_eq!(format_zfs_volname(&parsed), volname);
    }
}

#[test]
fn free_disk_index_search() {
    assert_eq!(find_free_disk_index(&[]), Some(1));
    assert_eq!(find_free_disk_index(&[1, 2, 4]), Some(3));
    let all: Vec<u32> = (1..=MAX_DISK_INDEX).collect();
    assert_eq!(find_free_disk_index(&all), None);

    assert_eq!(disk_index("vm-100-disk-7", 100), Some(7));
    assert_eq!(disk_index("base-100-disk-2", 100), Some(2));
    assert_eq!(disk_index("subvol-100-disk-3", 100), Some(3));
    assert_eq!(disk_index("vm-101-disk-7", 100), None);
    assert_eq!(disk_index("vm-100-cloudinit", 100), None);
    assert_eq!(disk_index("vm-100-disk-x", 100), None);
}
