//! hwbroker Common Library
//!
//! Shared types, the board capability catalog, configuration loading and
//! the wire protocol for the hwbroker workspace.
//!
//! # Module Structure
//!
//! - [`types`] - Device families, resource keys, identities, parameters
//! - [`error`] - `BrokerError` taxonomy and wire `Status`
//! - [`catalog`] - Board descriptor loader and capability lookup
//! - [`config`] - `broker.toml` types and the `ConfigLoader` trait
//! - [`proto`] - Request/response/event messages
//! - [`consts`] - Defaults and limits
//! - [`prelude`] - Common re-exports for convenience

pub mod catalog;
pub mod config;
pub mod consts;
pub mod error;
pub mod prelude;
pub mod proto;
pub mod types;
