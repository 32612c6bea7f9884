//! Prelude module for common re-exports.
//!
//! ```rust
//! use hwbroker_common::prelude::*;
//! ```

// ─── Errors ─────────────────────────────────────────────────────────
pub use crate::error::{BrokerError, BrokerResult, Status};

// ─── Catalog ────────────────────────────────────────────────────────
pub use crate::catalog::{BoardCatalog, CapabilityEntry, CatalogError};

// ─── Configuration ──────────────────────────────────────────────────
pub use crate::config::{BrokerConfig, ConfigError, ConfigLoader, LogLevel};

// ─── Domain types ───────────────────────────────────────────────────
pub use crate::types::{
    Caller, ClientId, Credentials, DeviceFamily, EdgeMode, GpioDirection, GpioEvent, HandleId,
    ResourceKey,
};
