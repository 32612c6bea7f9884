//! # hwbroker Library
//!
//! Privileged broker that multiplexes exclusive access to the board's
//! GPIO, I2C, PWM, ADC, UART and SPI resources among unprivileged
//! clients over a Unix socket.
//!
//! # Module Structure
//!
//! - [`adapter`] - Kernel interfaces per device family (sysfs, `/dev` ioctls)
//! - [`registry`] - Handle store: exclusivity, ownership, teardown
//! - [`policy`] - Acquisition authorization with an LRU decision cache
//! - [`lifecycle`] - One liveness watch per client holding handles
//! - [`irq`] - GPIO interrupt state and edge filtering
//! - [`broker`] - Request coordination and family operation dispatch
//! - [`reactor`] - Tokio interrupt watches and readiness waits
//! - [`transport`] - Connections, line framing, `SCM_RIGHTS` passing
//! - [`service`] - The event loop
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────────┐
//! │                          hwbroker                                 │
//! │  ┌─────────────┐  LoopEvent  ┌────────────┐    ┌──────────────┐   │
//! │  │  transport  │────────────►│ EventLoop  │───►│    Broker    │   │
//! │  │  reactor    │  (mpsc)     │ (1 thread) │    │              │   │
//! │  └─────────────┘             └────────────┘    └──────┬───────┘   │
//! │                                                       │           │
//! │                 ┌──────────────┬──────────────┬───────┴──────┐    │
//! │                 ▼              ▼              ▼              ▼    │
//! │          ┌────────────┐ ┌────────────┐ ┌────────────┐ ┌─────────┐ │
//! │          │  Registry  │ │   Policy   │ │ Lifecycle  │ │   IRQ   │ │
//! │          └─────┬──────┘ └────────────┘ └────────────┘ └─────────┘ │
//! │                ▼                                                  │
//! │        ┌───────────────┐                                          │
//! │        │ DeviceAdapter │ (trait object)                           │
//! │        └───────────────┘                                          │
//! └───────────────────────────────────────────────────────────────────┘
//! ```

pub mod adapter;
pub mod broker;
pub mod irq;
pub mod lifecycle;
pub mod policy;
pub mod reactor;
pub mod registry;
pub mod service;
pub mod transport;

#[cfg(test)]
mod testing;

pub use crate::broker::{Broker, Outcome, Reply};
pub use crate::registry::ResourceRegistry;
pub use crate::service::{EventLoop, LoopEvent};
