//! Board capability catalog.
//!
//! Loaded once at startup from a board descriptor and immutable
//! afterwards. Lookup is a deterministic first-match scan in descriptor
//! order; duplicates are rejected by the loader, so there is never a
//! tie to break.
//!
//! # Descriptor format
//!
//! ```toml
//! model = "Raspberry Pi 3 Model B"
//!
//! [gpio]
//! gpio4 = "7"
//!
//! [i2c]
//! i2c-1 = "3, 5"
//!
//! [pwm]
//! pwm0-0 = "12"
//!
//! [spi]
//! spi0-0 = "19 21 23 24"
//! ```
//!
//! Key names encode the lookup arguments (`gpio<pin>`, `i2c-<bus>`,
//! `pwm<chip>-<pin>`, `adc<device>-<channel>`, `uart<port>`,
//! `spi<bus>-<cs>`); values list up to four header pins.

use crate::consts::{MAX_CATALOG_ARGS, MAX_CATALOG_PINS};
use crate::types::DeviceFamily;
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info};

/// Error raised while loading a board descriptor.
///
/// Every variant is fatal to broker startup.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CatalogError {
    /// Descriptor file does not exist.
    #[error("Board descriptor not found: {0}")]
    NotFound(PathBuf),

    /// Descriptor file exists but could not be read.
    #[error("Failed to read board descriptor {path:?}: {reason}")]
    Read { path: PathBuf, reason: String },

    /// Descriptor is not valid TOML.
    #[error("Failed to parse board descriptor: {0}")]
    Parse(String),

    /// Section name is not a device family.
    #[error("Unknown section '{0}' in board descriptor")]
    UnknownSection(String),

    /// Key does not match the family's argument pattern.
    #[error("Invalid {family} key '{key}'")]
    InvalidKey { family: DeviceFamily, key: String },

    /// Pin list contains a non-numeric token or has the wrong type.
    #[error("Invalid pin list for '{key}': {value}")]
    InvalidPins { key: String, value: String },

    /// Pin list exceeds the per-entry limit.
    #[error("Too many pins for '{key}': {count} (max {MAX_CATALOG_PINS})")]
    TooManyPins { key: String, count: usize },

    /// Same `(family, args)` listed twice.
    #[error("Duplicate {family} entry '{key}'")]
    Duplicate { family: DeviceFamily, key: String },

    /// Model discovery found no matching descriptor.
    #[error("No board descriptor matches model '{0}'")]
    NoMatchingBoard(String),
}

/// Lookup arguments of one entry (one or two numbers).
pub type CatalogArgs = heapless::Vec<u32, MAX_CATALOG_ARGS>;

/// Header pins wired to one entry.
pub type PinList = heapless::Vec<u32, MAX_CATALOG_PINS>;

/// One resource instance present on the board.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapabilityEntry {
    /// Device family of this entry.
    pub family: DeviceFamily,
    /// Numeric arguments decoded from the key name.
    pub args: CatalogArgs,
    /// Header pins listed in the value.
    pub pins: PinList,
}

impl CapabilityEntry {
    fn matches(&self, family: DeviceFamily, arg1: u32, arg2: Option<u32>) -> bool {
        self.family == family
            && self.args.first() == Some(&arg1)
            && self.args.get(1).copied() == arg2
    }
}

/// Immutable per-board capability table.
#[derive(Debug, Clone, Default)]
pub struct BoardCatalog {
    model: Option<String>,
    entries: Vec<CapabilityEntry>,
}

impl BoardCatalog {
    /// Build a catalog from descriptor text.
    pub fn from_descriptor(text: &str) -> Result<Self, CatalogError> {
        let table: toml::Table =
            toml::from_str(text).map_err(|e| CatalogError::Parse(e.to_string()))?;

        let mut model = None;
        let mut entries = Vec::new();
        let mut seen: HashSet<(DeviceFamily, CatalogArgs)> = HashSet::new();

        for (section, body) in &table {
            if section == "model" {
                let name = body.as_str().ok_or_else(|| {
                    CatalogError::Parse("'model' must be a string".to_string())
                })?;
                model = Some(name.to_string());
                continue;
            }

            let family: DeviceFamily = section
                .parse()
                .map_err(|_| CatalogError::UnknownSection(section.clone()))?;
            let keys = body.as_table().ok_or_else(|| {
                CatalogError::Parse(format!("section '{section}' must be a table"))
            })?;

            for (key, value) in keys {
                let args = parse_key(family, key)?;
                let pins = parse_pins(key, value)?;

                if !seen.insert((family, args.clone())) {
                    return Err(CatalogError::Duplicate {
                        family,
                        key: key.clone(),
                    });
                }
                entries.push(CapabilityEntry { family, args, pins });
            }
        }

        debug!("Parsed board descriptor: {} entries", entries.len());
        Ok(Self { model, entries })
    }

    /// Load a descriptor file.
    pub fn load(path: &Path) -> Result<Self, CatalogError> {
        let text = fs::read_to_string(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                CatalogError::NotFound(path.to_path_buf())
            } else {
                CatalogError::Read {
                    path: path.to_path_buf(),
                    reason: e.to_string(),
                }
            }
        })?;
        let catalog = Self::from_descriptor(&text)?;
        info!(
            "Loaded board catalog {:?} ({} entries, model={:?})",
            path,
            catalog.entries.len(),
            catalog.model
        );
        Ok(catalog)
    }

    /// Pick the descriptor whose `model` prefixes the running board's model.
    ///
    /// Candidates are `*.toml` files in `dir`, tried in file-name order.
    pub fn discover(dir: &Path, model_path: &Path) -> Result<Self, CatalogError> {
        let raw = fs::read(model_path).map_err(|e| CatalogError::Read {
            path: model_path.to_path_buf(),
            reason: e.to_string(),
        })?;
        let detected = String::from_utf8_lossy(&raw)
            .trim_end_matches(['\0', '\n', ' ', '\t', '\r'])
            .to_string();
        info!("Detected board model '{}'", detected);

        let listing = fs::read_dir(dir).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                CatalogError::NotFound(dir.to_path_buf())
            } else {
                CatalogError::Read {
                    path: dir.to_path_buf(),
                    reason: e.to_string(),
                }
            }
        })?;
        let mut candidates: Vec<PathBuf> = listing
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| p.extension().is_some_and(|ext| ext == "toml"))
            .collect();
        candidates.sort();

        for path in candidates {
            let catalog = Self::load(&path)?;
            if catalog
                .model
                .as_deref()
                .is_some_and(|model| !model.is_empty() && detected.starts_with(model))
            {
                return Ok(catalog);
            }
        }
        Err(CatalogError::NoMatchingBoard(detected))
    }

    /// First entry matching `(family, arg1, arg2)`, or `None` if the board
    /// does not provide that resource.
    pub fn find(
        &self,
        family: DeviceFamily,
        arg1: u32,
        arg2: Option<u32>,
    ) -> Option<&CapabilityEntry> {
        self.entries.iter().find(|e| e.matches(family, arg1, arg2))
    }

    /// Board model declared by the descriptor.
    pub fn model(&self) -> Option<&str> {
        self.model.as_deref()
    }

    /// All entries in descriptor order.
    pub fn entries(&self) -> &[CapabilityEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Decode the lookup arguments encoded in a key name.
fn parse_key(family: DeviceFamily, key: &str) -> Result<CatalogArgs, CatalogError> {
    let invalid = || CatalogError::InvalidKey {
        family,
        key: key.to_string(),
    };

    let (prefix, pair) = match family {
        DeviceFamily::Gpio => ("gpio", false),
        DeviceFamily::I2c => ("i2c-", false),
        DeviceFamily::Uart => ("uart", false),
        DeviceFamily::Pwm => ("pwm", true),
        DeviceFamily::Adc => ("adc", true),
        DeviceFamily::Spi => ("spi", true),
    };
    let rest = key.strip_prefix(prefix).ok_or_else(invalid)?;

    let mut args = CatalogArgs::new();
    if pair {
        let (a, b) = rest.split_once('-').ok_or_else(invalid)?;
        for part in [a, b] {
            let n = parse_number(part).ok_or_else(invalid)?;
            args.push(n).map_err(|_| invalid())?;
        }
    } else {
        let n = parse_number(rest).ok_or_else(invalid)?;
        args.push(n).map_err(|_| invalid())?;
    }
    Ok(args)
}

/// Parse the comma/space separated pin list of an entry.
fn parse_pins(key: &str, value: &toml::Value) -> Result<PinList, CatalogError> {
    let invalid = || CatalogError::InvalidPins {
        key: key.to_string(),
        value: value.to_string(),
    };

    let text = match value {
        toml::Value::String(s) => s.clone(),
        toml::Value::Integer(n) => n.to_string(),
        _ => return Err(invalid()),
    };

    let tokens: Vec<&str> = text
        .split([',', ' ', '\t'])
        .filter(|t| !t.is_empty())
        .collect();
    if tokens.len() > MAX_CATALOG_PINS {
        return Err(CatalogError::TooManyPins {
            key: key.to_string(),
            count: tokens.len(),
        });
    }

    let mut pins = PinList::new();
    for token in tokens {
        let pin = parse_number(token).ok_or_else(invalid)?;
        pins.push(pin).map_err(|_| invalid())?;
    }
    Ok(pins)
}

fn parse_number(s: &str) -> Option<u32> {
    if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    s.parse().ok()
}
