//! Core domain types shared by the broker and its clients.
//!
//! `ResourceKey` is the family-specific identity of a physical resource;
//! `(family, key)` uniqueness among live handles is enforced by the
//! registry, so the enum itself carries the family discriminator.

use core::fmt;
use core::str::FromStr;
use serde::{Deserialize, Serialize};

// ─── DeviceFamily ───────────────────────────────────────────────────

/// Device family discriminator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceFamily {
    Gpio,
    I2c,
    Pwm,
    Adc,
    Uart,
    Spi,
}

impl DeviceFamily {
    /// All families in descriptor section order.
    pub const ALL: [DeviceFamily; 6] = [
        Self::Gpio,
        Self::I2c,
        Self::Pwm,
        Self::Adc,
        Self::Uart,
        Self::Spi,
    ];

    /// Section name used in board descriptors.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Gpio => "gpio",
            Self::I2c => "i2c",
            Self::Pwm => "pwm",
            Self::Adc => "adc",
            Self::Uart => "uart",
            Self::Spi => "spi",
        }
    }
}

impl fmt::Display for DeviceFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeviceFamily {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|family| family.as_str() == s)
            .ok_or_else(|| format!("unknown device family: {s:?}"))
    }
}

// ─── ResourceKey ────────────────────────────────────────────────────

/// Family-specific identity of one physical resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "family", rename_all = "lowercase")]
pub enum ResourceKey {
    Gpio { pin: u32 },
    I2c { bus: u32, address: u16 },
    Pwm { chip: u32, pin: u32 },
    Adc { device: u32, channel: u32 },
    Uart { port: u32 },
    Spi { bus: u32, cs: u32 },
}

impl ResourceKey {
    /// Family of this key.
    pub const fn family(&self) -> DeviceFamily {
        match self {
            Self::Gpio { .. } => DeviceFamily::Gpio,
            Self::I2c { .. } => DeviceFamily::I2c,
            Self::Pwm { .. } => DeviceFamily::Pwm,
            Self::Adc { .. } => DeviceFamily::Adc,
            Self::Uart { .. } => DeviceFamily::Uart,
            Self::Spi { .. } => DeviceFamily::Spi,
        }
    }

    /// Arguments used for the board capability lookup.
    ///
    /// I2C entries are keyed by bus only; any address on a listed bus
    /// is acceptable.
    pub const fn catalog_args(&self) -> (u32, Option<u32>) {
        match *self {
            Self::Gpio { pin } => (pin, None),
            Self::I2c { bus, .. } => (bus, None),
            Self::Pwm { chip, pin } => (chip, Some(pin)),
            Self::Adc { device, channel } => (device, Some(channel)),
            Self::Uart { port } => (port, None),
            Self::Spi { bus, cs } => (bus, Some(cs)),
        }
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Gpio { pin } => write!(f, "gpio:{pin}"),
            Self::I2c { bus, address } => write!(f, "i2c:{bus}:{address:#04x}"),
            Self::Pwm { chip, pin } => write!(f, "pwm:{chip}:{pin}"),
            Self::Adc { device, channel } => write!(f, "adc:{device}:{channel}"),
            Self::Uart { port } => write!(f, "uart:{port}"),
            Self::Spi { bus, cs } => write!(f, "spi:{bus}:{cs}"),
        }
    }
}

// ─── Identities ─────────────────────────────────────────────────────

/// Opaque handle token handed to clients. Unique while live.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HandleId(pub u32);

impl fmt::Display for HandleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Transport-level identity of a connected client.
///
/// Assigned once per connection and never reused during the broker
/// lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClientId(pub u64);

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, ":1.{}", self.0)
    }
}

/// Kernel-reported peer credentials of a client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Credentials {
    pub pid: i32,
    pub uid: u32,
    pub gid: u32,
}

/// Caller of a broker operation: identity plus optional credentials.
///
/// Credentials are `None` when the transport could not resolve them;
/// such callers can still release handles but never acquire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Caller {
    pub id: ClientId,
    pub credentials: Option<Credentials>,
}

impl Caller {
    pub const fn new(id: ClientId, credentials: Option<Credentials>) -> Self {
        Self { id, credentials }
    }
}

// ─── GPIO ───────────────────────────────────────────────────────────

/// GPIO direction.
///
/// `OutHigh`/`OutLow` set the initial level atomically with the
/// direction change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GpioDirection {
    In,
    Out,
    OutHigh,
    OutLow,
}

impl GpioDirection {
    /// Value written to the sysfs `direction` attribute.
    pub const fn sysfs_value(self) -> &'static str {
        match self {
            Self::In => "in",
            Self::Out => "out",
            Self::OutHigh => "high",
            Self::OutLow => "low",
        }
    }

    pub const fn is_input(self) -> bool {
        matches!(self, Self::In)
    }
}

/// GPIO interrupt edge filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EdgeMode {
    #[default]
    None,
    Rising,
    Falling,
    Both,
}

impl EdgeMode {
    /// Value written to the sysfs `edge` attribute.
    pub const fn sysfs_value(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Rising => "rising",
            Self::Falling => "falling",
            Self::Both => "both",
        }
    }
}

/// Asynchronous GPIO change notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GpioEvent {
    pub pin: u32,
    pub value: u8,
    pub timestamp_us: u64,
}

// ─── PWM ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PwmPolarity {
    #[default]
    Normal,
    Inversed,
}

impl PwmPolarity {
    pub const fn sysfs_value(self) -> &'static str {
        match self {
            Self::Normal => "normal",
            Self::Inversed => "inversed",
        }
    }
}

// ─── UART ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UartParity {
    None,
    Even,
    Odd,
}

/// Line framing parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UartMode {
    /// Data bits, 5 through 8.
    pub byte_size: u8,
    pub parity: UartParity,
    /// Stop bits, 1 or 2.
    pub stop_bits: u8,
}

/// Software and hardware flow control switches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct UartFlowControl {
    pub xonxoff: bool,
    pub rtscts: bool,
}

// ─── SPI ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SpiBitOrder {
    #[default]
    Msb,
    Lsb,
}
