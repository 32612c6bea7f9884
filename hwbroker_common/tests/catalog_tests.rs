//! Board discovery tests.
//!
//! `BoardCatalog::discover()` against a descriptor directory and a fake
//! device-tree model file: prefix matching, NUL-terminated model strings,
//! file-name ordering, and the fatal cases.

use hwbroker_common::catalog::{BoardCatalog, CatalogError};
use hwbroker_common::types::DeviceFamily;
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

const PI3: &str = r#"
model = "Raspberry Pi 3"

[gpio]
gpio4 = "7"
gpio17 = "11"

[i2c]
i2c-1 = "3, 5"
"#;

const BEAGLE: &str = r#"
model = "TI AM335x BeagleBone Black"

[gpio]
gpio60 = "12"
"#;

/// Write the descriptor set into `dir/boards`.
fn write_boards(dir: &Path, boards: &[(&str, &str)]) -> PathBuf {
    let boards_dir = dir.join("boards");
    fs::create_dir_all(&boards_dir).unwrap();
    for (name, text) in boards {
        fs::write(boards_dir.join(name), text).unwrap();
    }
    boards_dir
}

/// Write a device-tree style model (NUL terminated).
fn write_model(dir: &Path, model: &str) -> PathBuf {
    let path = dir.join("model");
    let mut raw = model.as_bytes().to_vec();
    raw.push(0);
    fs::write(&path, raw).unwrap();
    path
}

#[test]
fn discover_matches_model_prefix() {
    let temp = TempDir::new().unwrap();
    let boards = write_boards(temp.path(), &[("rpi3.toml", PI3)]);
    let model = write_model(temp.path(), "Raspberry Pi 3 Model B Rev 1.2");

    let catalog = BoardCatalog::discover(&boards, &model).unwrap();
    assert_eq!(catalog.model(), Some("Raspberry Pi 3"));
    assert!(catalog.find(DeviceFamily::Gpio, 17, None).is_some());
    assert!(catalog.find(DeviceFamily::I2c, 1, None).is_some());
    assert!(catalog.find(DeviceFamily::Gpio, 18, None).is_none());
}

#[test]
fn discover_skips_non_matching_and_non_toml() {
    let temp = TempDir::new().unwrap();
    let boards = write_boards(
        temp.path(),
        &[
            ("a-beagle.toml", BEAGLE),
            ("b-rpi3.toml", PI3),
            ("notes.txt", "model = \"Raspberry Pi 3\""),
        ],
    );
    let model = write_model(temp.path(), "Raspberry Pi 3 Model B Plus Rev 1.3");

    let catalog = BoardCatalog::discover(&boards, &model).unwrap();
    assert_eq!(catalog.model(), Some("Raspberry Pi 3"));
}

#[test]
fn discover_without_match_is_fatal() {
    let temp = TempDir::new().unwrap();
    let boards = write_boards(temp.path(), &[("rpi3.toml", PI3)]);
    let model = write_model(temp.path(), "Pine64 RockPro64");

    let err = BoardCatalog::discover(&boards, &model).unwrap_err();
    assert_eq!(err, CatalogError::NoMatchingBoard("Pine64 RockPro64".to_string()));
}

#[test]
fn discover_propagates_broken_descriptor() {
    let temp = TempDir::new().unwrap();
    let boards = write_boards(
        temp.path(),
        &[("broken.toml", "model = \"X\"\n[can]\ncan0 = \"1\"\n")],
    );
    let model = write_model(temp.path(), "X");

    let err = BoardCatalog::discover(&boards, &model).unwrap_err();
    assert_eq!(err, CatalogError::UnknownSection("can".to_string()));
}

#[test]
fn discover_missing_model_or_dir() {
    let temp = TempDir::new().unwrap();
    let boards = write_boards(temp.path(), &[("rpi3.toml", PI3)]);

    let err = BoardCatalog::discover(&boards, &temp.path().join("no-model")).unwrap_err();
    assert!(matches!(err, CatalogError::Read { .. }));

    let model = write_model(temp.path(), "Raspberry Pi 3");
    let err = BoardCatalog::discover(&temp.path().join("no-boards"), &model).unwrap_err();
    assert!(matches!(err, CatalogError::NotFound(_)));
}

#[test]
fn shipped_descriptors_load() {
    let boards = Path::new(env!("CARGO_MANIFEST_DIR")).join("../config/boards");
    let mut loaded = 0;
    for entry in fs::read_dir(&boards).unwrap() {
        let path = entry.unwrap().path();
        let catalog = BoardCatalog::load(&path)
            .unwrap_or_else(|e| panic!("{}: {e}", path.display()));
        assert!(catalog.model().is_some(), "{} has no model", path.display());
        assert!(!catalog.is_empty());
        loaded += 1;
    }
    assert!(loaded >= 2);
}
