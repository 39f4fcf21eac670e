use super::scripted_registry;
use silo_core::{ContentType, SiloError};
use std::collections::BTreeMap;

fn params(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

#[test]
fn create_schema_shape() {
    let (registry, _) = scripted_registry();
    let schema = registry.create_schema();

    assert_eq!(schema["additionalProperties"], false);
    assert_eq!(schema["required"][0], "storage");
    assert_eq!(schema["required"][1], "type");
    let types: Vec<&str> = schema["properties"]["type"]["enum"]
        .as_array()
        .unwrap()
        .iter()
        .map(|v| v.as_str().unwrap())
        .collect();
    assert_eq!(types, vec!["dir", "iscsi", "lvm", "zfspool"]);

    assert_eq!(schema["properties"]["path"]["fixed"], true);
    assert_eq!(schema["properties"]["pool"]["fixed"], true);
    assert_eq!(schema["properties"]["disable"]["type"], "boolean");
    assert_eq!(schema["properties"]["maxfiles"]["type"], "integer");
}

#[test]
fn update_schema_excludes_fixed_options() {
    let (registry, _) = scripted_registry();
    let schema = registry.update_schema();

    assert!(schema["properties"]["path"].is_null());
    assert!(schema["properties"]["pool"].is_null());
    assert!(schema["properties"]["digest"].is_object());
    assert!(schema["properties"]["content"].is_object());
}

#[test]
fn check_config_validates_and_fills_defaults() {
    let (registry, _) = scripted_registry();

    let scfg = registry
        .check_config("d1", &params(&[("type", "dir"), ("path", "/srv/x")]), true, true)
        .unwrap();
    assert_eq!(scfg.ty, "dir");
    // Default content applied.
    assert_eq!(scfg.content.len(), 1);
    assert!(scfg.content.contains(&ContentType::Images));
    assert!(!scfg.shared);

    // Networked types are implicitly shared.
    let scfg = registry
        .check_config(
            "i1",
            &params(&[("type", "iscsi"), ("portal", "10.0.0.1"), ("target", "iqn.x")]),
            true,
            true,
        )
        .unwrap();
    assert!(scfg.shared);
    assert!(scfg.content.contains(&ContentType::None));
}

#[test]
fn check_config_rejects_bad_input() {
    let (registry, _) = scripted_registry();

    // Unknown type.
    assert!(matches!(
        registry.check_config("x1", &params(&[("type", "floppy")]), true, true),
        Err(SiloError::UnknownStorageType(_))
    ));

    // Missing fixed option.
    assert!(registry
        .check_config("d1", &params(&[("type", "dir")]), true, true)
        .is_err());

    // Unknown key in strict mode.
    assert!(registry
        .check_config(
            "d1",
            &params(&[("type", "dir"), ("path", "/x"), ("bogus", "1")]),
            true,
            true,
        )
        .is_err());

    // Content not allowed for the type.
    assert!(registry
        .check_config(
            "z1",
            &params(&[("type", "zfspool"), ("pool", "tank"), ("content", "iso")]),
            true,
            true,
        )
        .is_err());

    // 'none' cannot be combined.
    assert!(registry
        .check_config(
            "d1",
            &params(&[("type", "dir"), ("path", "/x"), ("content", "none,images")]),
            true,
            true,
        )
        .is_err());

    // Format must come from the type's allowed set.
    assert!(registry
        .check_config(
            "d1",
            &params(&[("type", "dir"), ("path", "/x"), ("format", "subvol")]),
            true,
            true,
        )
        .is_err());

    // Bad storage id.
    assert!(registry
        .check_config("X", &params(&[("type", "dir"), ("path", "/x")]), true, true)
        .is_err());
}

#[test]
fn check_update_merges_key_wise() {
    let (registry, _) = scripted_registry();
    let mut scfg = registry
        .check_config(
            "d1",
            &params(&[("type", "dir"), ("path", "/srv/x"), ("content", "images,iso")]),
            true,
            true,
        )
        .unwrap();

    registry
        .check_update(&mut scfg, &params(&[("content", "images"), ("disable", "1")]))
        .unwrap();
    assert_eq!(scfg.content.len(), 1);
    assert!(scfg.disable);
    // Untouched keys keep their values.
    assert_eq!(scfg.path.as_deref().unwrap().to_str(), Some("/srv/x"));

    // Fixed options cannot be updated.
    let err = registry
        .check_update(&mut scfg, &params(&[("path", "/srv/y")]))
        .unwrap_err();
    assert!(matches!(err, SiloError::InvalidOption { .. }));

    // The type is never updatable.
    assert!(registry
        .check_update(&mut scfg, &params(&[("type", "zfspool")]))
        .is_err());
}
