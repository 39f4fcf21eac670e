//! Backend volume-name grammars.
//!
//! File backends name images `(vm|base)-<vmid>-<suffix>.<ext>` under a
//! per-owner directory; ZFS pools name datasets `(vm|base|subvol)-<vmid>-
//! <suffix>`. Linked clones carry their lineage in the volume name itself:
//! `<basevmid>/<basename>/<vmid>/<name>` (files) or `<basename>/<name>`
//! (datasets). Parsers here are total and perform no I/O.

use silo_core::{ContentType, ImageFormat, ParsedVolname, Result, SiloError};

/// Highest disk index probed by the free-name search.
pub const MAX_DISK_INDEX: u32 = 99;

/// A vmid is a plain decimal number.
pub fn parse_vmid(s: &str) -> Option<u32> {
    if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    s.parse().ok()
}

/// Decode `(vm|base)-<vmid>-<suffix>.<ext>` into (is_base, vmid, format).
pub fn parse_dir_image_name(name: &str) -> Result<(bool, u32, ImageFormat)> {
    let err = || SiloError::InvalidVolname(name.to_string());

    let (stem, ext) = name.rsplit_once('.').ok_or_else(err)?;
    let format: ImageFormat = ext.parse().map_err(|_| err())?;
    if format == ImageFormat::Subvol {
        return Err(err());
    }
    let (is_base, vmid) = parse_owned_stem(stem).ok_or_else(err)?;
    Ok((is_base, vmid, format))
}

/// Decode `(vm|base|subvol)-<vmid>-<suffix>` into (is_base, vmid, format).
pub fn parse_zfs_dataset_name(name: &str) -> Result<(bool, u32, ImageFormat)> {
    let err = || SiloError::InvalidVolname(name.to_string());

    if let Some(rest) = name.strip_prefix("subvol-") {
        let (vmid, suffix) = split_vmid(rest).ok_or_else(err)?;
        if suffix.is_empty() {
            return Err(err());
        }
        return Ok((false, vmid, ImageFormat::Subvol));
    }
    let (is_base, vmid) = parse_owned_stem(name).ok_or_else(err)?;
    Ok((is_base, vmid, ImageFormat::Raw))
}

fn parse_owned_stem(stem: &str) -> Option<(bool, u32)> {
    let (is_base, rest) = if let Some(rest) = stem.strip_prefix("vm-") {
        (false, rest)
    } else if let Some(rest) = stem.strip_prefix("base-") {
        (true, rest)
    } else {
        return None;
    };
    let (vmid, suffix) = split_vmid(rest)?;
    if suffix.is_empty() {
        return None;
    }
    Some((is_base, vmid))
}

fn split_vmid(rest: &str) -> Option<(u32, &str)> {
    let (vmid_s, suffix) = rest.split_once('-')?;
    Some((parse_vmid(vmid_s)?, suffix))
}

/// Index N of a `…-<vmid>-disk-N` name (any of the vm/base/subvol prefixes,
/// extension already stripped for files). Names owned by other vmids or with
/// different suffix shapes yield `None`.
pub fn disk_index(stem: &str, vmid: u32) -> Option<u32> {
    let rest = stem
        .strip_prefix("vm-")
        .or_else(|| stem.strip_prefix("base-"))
        .or_else(|| stem.strip_prefix("subvol-"))?;
    let rest = rest.strip_prefix(&format!("{vmid}-disk-"))?;
    if rest.is_empty() || !rest.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    rest.parse().ok()
}

/// Smallest free index in 1..=[`MAX_DISK_INDEX`].
pub fn find_free_disk_index(used: &[u32]) -> Option<u32> {
    (1..=MAX_DISK_INDEX).find(|n| !used.contains(n))
}

const BACKUP_EXTENSIONS: [&str; 7] = [
    ".tar.gz", ".tar.lzo", ".vma.gz", ".vma.lzo", ".tar", ".tgz", ".vma",
];

/// Decode a `vzdump-(openvz|qemu)-<vmid>-…` backup file name; returns the
/// owning vmid.
pub fn parse_backup_name(file: &str) -> Result<u32> {
    let err = || SiloError::InvalidVolname(file.to_string());

    let stem = BACKUP_EXTENSIONS
        .iter()
        .find_map(|ext| file.strip_suffix(ext))
        .ok_or_else(err)?;
    let rest = stem.strip_prefix("vzdump-").ok_or_else(err)?;
    let rest = rest
        .strip_prefix("openvz-")
        .or_else(|| rest.strip_prefix("qemu-"))
        .ok_or_else(err)?;
    let (vmid_s, tail) = rest.split_once('-').ok_or_else(err)?;
    if tail.is_empty() {
        return Err(err());
    }
    parse_vmid(vmid_s).ok_or_else(err)
}

/// Decode a file-backend volume name (§ images, iso, vztmpl, backup,
/// rootdir namespaces).
pub fn parse_dir_volname(volname: &str) -> Result<ParsedVolname> {
    let err = || SiloError::InvalidVolname(volname.to_string());

    if let Some(file) = volname.strip_prefix("iso/") {
        if file.contains('/') || !file.ends_with(".iso") || file.len() == ".iso".len() {
            return Err(err());
        }
        return Ok(ParsedVolname {
            vtype: ContentType::Iso,
            name: file.to_string(),
            vmid: None,
            basename: None,
            base_vmid: None,
            is_base: false,
            format: None,
        });
    }

    if let Some(file) = volname.strip_prefix("vztmpl/") {
        if file.contains('/') || !file.ends_with(".tar.gz") || file.len() == ".tar.gz".len() {
            return Err(err());
        }
        return Ok(ParsedVolname {
            vtype: ContentType::Vztmpl,
            name: file.to_string(),
            vmid: None,
            basename: None,
            base_vmid: None,
            is_base: false,
            format: None,
        });
    }

    if let Some(rest) = volname.strip_prefix("rootdir/") {
        let vmid = parse_vmid(rest).ok_or_else(err)?;
        return Ok(ParsedVolname {
            vtype: ContentType::Rootdir,
            name: rest.to_string(),
            vmid: Some(vmid),
            basename: None,
            base_vmid: None,
            is_base: false,
            format: None,
        });
    }

    if let Some(file) = volname.strip_prefix("backup/") {
        if file.contains('/') {
            return Err(err());
        }
        let vmid = parse_backup_name(file)?;
        return Ok(ParsedVolname {
            vtype: ContentType::Backup,
            name: file.to_string(),
            vmid: Some(vmid),
            basename: None,
            base_vmid: None,
            is_base: false,
            format: None,
        });
    }

    let parts: Vec<&str> = volname.split('/').collect();
    match parts[..] {
        [vmid_s, name] => {
            let vmid = parse_vmid(vmid_s).ok_or_else(err)?;
            let (is_base, owner, format) = parse_dir_image_name(name)?;
            if owner != vmid {
                return Err(err());
            }
            Ok(ParsedVolname {
                vtype: ContentType::Images,
                name: name.to_string(),
                vmid: Some(vmid),
                basename: None,
                base_vmid: None,
                is_base,
                format: Some(format),
            })
        }
        [base_vmid_s, basename, vmid_s, name] => {
            let base_vmid = parse_vmid(base_vmid_s).ok_or_else(err)?;
            let vmid = parse_vmid(vmid_s).ok_or_else(err)?;
            let (base_is_base, base_owner, _) = parse_dir_image_name(basename)?;
            if !base_is_base || base_owner != base_vmid {
                return Err(err());
            }
            let (is_base, owner, format) = parse_dir_image_name(name)?;
            if owner != vmid {
                return Err(err());
            }
            Ok(ParsedVolname {
                vtype: ContentType::Images,
                name: name.to_string(),
                vmid: Some(vmid),
                basename: Some(basename.to_string()),
                base_vmid: Some(base_vmid),
                is_base,
                format: Some(format),
            })
        }
        _ => Err(err()),
    }
}

/// Decode a ZFS-pool volume name, optionally prefixed by the base dataset of
/// a linked clone.
pub fn parse_zfs_volname(volname: &str) -> Result<ParsedVolname> {
    let err = || SiloError::InvalidVolname(volname.to_string());

    let (lineage, name) = match volname.split_once('/') {
        Some((base, name)) => {
            if name.contains('/') {
                return Err(err());
            }
            (Some(base), name)
        }
        None => (None, volname),
    };

    let (is_base, vmid, format) = parse_zfs_dataset_name(name)?;

    let (basename, base_vmid) = match lineage {
        Some(base) => {
            let (base_is_base, base_owner, base_format) = parse_zfs_dataset_name(base)?;
            if !base_is_base || base_format == ImageFormat::Subvol {
                return Err(err());
            }
            (Some(base.to_string()), Some(base_owner))
        }
        None => (None, None),
    };

    let vtype = if format == ImageFormat::Subvol {
        ContentType::Rootdir
    } else {
        ContentType::Images
    };

    Ok(ParsedVolname {
        vtype,
        name: name.to_string(),
        vmid: Some(vmid),
        basename,
        base_vmid,
        is_base,
        format: Some(format),
    })
}

/// Re-encode a parsed file-backend image volname; inverse of
/// [`parse_dir_volname`] for the images namespace.
pub fn format_dir_volname(parsed: &ParsedVolname) -> String {
    match (parsed.vmid, &parsed.basename, parsed.base_vmid) {
        (Some(vmid), Some(basename), Some(base_vmid)) => {
            format!("{base_vmid}/{basename}/{vmid}/{}", parsed.name)
        }
        (Some(vmid), ..) => format!("{vmid}/{}", parsed.name),
        _ => parsed.name.clone(),
    }
}

/// Re-encode a parsed ZFS volname; inverse of [`parse_zfs_volname`].
pub fn format_zfs_volname(parsed: &ParsedVolname) -> String {
    match &parsed.basename {
        Some(basename) => format!("{basename}/{}", parsed.name),
        None => parsed.name.clone(),
    }
}
