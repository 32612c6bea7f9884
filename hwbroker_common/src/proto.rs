//! Wire protocol messages.
//!
//! One JSON object per line. Requests carry a client-chosen `seq` which
//! the matching response echoes; events are unsolicited and carry an
//! `event` tag instead.
//!
//! ```text
//! -> {"seq":1,"op":"gpio_open","pin":5}
//! <- {"seq":1,"status":"ok","payload":{"handle":1}}      (+ SCM_RIGHTS)
//! -> {"seq":2,"op":"gpio_set_edge","handle":1,"edge":"rising"}
//! <- {"seq":2,"status":"ok"}
//! <- {"event":"gpio_changed","handle":1,"pin":5,"value":1,"timestamp_us":81234567}
//! ```

use crate::error::{BrokerError, Status};
use crate::types::{
    EdgeMode, GpioDirection, GpioEvent, HandleId, PwmPolarity, ResourceKey, SpiBitOrder,
    UartFlowControl, UartMode,
};
use serde::{Deserialize, Serialize};

/// SMBus transaction size (kernel `I2C_SMBUS_*` protocol selectors).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u32)]
pub enum SmbusSize {
    Quick = 0,
    Byte = 1,
    ByteData = 2,
    WordData = 3,
    BlockData = 5,
}

/// One SMBus transaction passed through to the adapter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SmbusTransaction {
    /// `true` for a read, `false` for a write.
    pub read: bool,
    pub command: u8,
    pub size: SmbusSize,
    /// Outgoing data for writes (1 byte, 2 bytes little-endian, or a block).
    #[serde(default)]
    pub data: Vec<u8>,
}

/// Request envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestFrame {
    pub seq: u64,
    #[serde(flatten)]
    pub request: Request,
}

/// Client request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Request {
    // ── Acquisition ─────────────
    GpioOpen { pin: u32 },
    I2cOpen { bus: u32, address: u16 },
    PwmOpen { chip: u32, pin: u32 },
    AdcOpen { device: u32, channel: u32 },
    UartOpen { port: u32 },
    SpiOpen { bus: u32, cs: u32 },
    Close { handle: HandleId },

    // ── GPIO ────────────────────
    GpioGetDirection { handle: HandleId },
    GpioSetDirection { handle: HandleId, direction: GpioDirection },
    GpioGetEdge { handle: HandleId },
    GpioSetEdge { handle: HandleId, edge: EdgeMode },
    GpioRead { handle: HandleId },
    GpioWrite { handle: HandleId, value: u8 },
    GpioRegisterIrq { handle: HandleId },
    GpioUnregisterIrq { handle: HandleId },

    // ── I2C ─────────────────────
    I2cRead { handle: HandleId, length: usize },
    I2cWrite { handle: HandleId, data: Vec<u8> },
    I2cSmbus { handle: HandleId, transaction: SmbusTransaction },

    // ── PWM ─────────────────────
    PwmSetPeriod { handle: HandleId, period_ns: u64 },
    PwmSetDutyCycle { handle: HandleId, duty_cycle_ns: u64 },
    PwmSetPolarity { handle: HandleId, polarity: PwmPolarity },
    PwmSetEnabled { handle: HandleId, enabled: bool },

    // ── UART ────────────────────
    UartFlush { handle: HandleId },
    UartSetBaudRate { handle: HandleId, baud: u32 },
    UartSetMode { handle: HandleId, mode: UartMode },
    UartSetFlowControl { handle: HandleId, flow: UartFlowControl },
    UartRead { handle: HandleId, length: usize },
    UartWrite { handle: HandleId, data: Vec<u8> },

    // ── SPI ─────────────────────
    SpiSetMode { handle: HandleId, mode: u8 },
    SpiSetBitOrder { handle: HandleId, order: SpiBitOrder },
    SpiSetBitsPerWord { handle: HandleId, bits: u8 },
    SpiSetFrequency { handle: HandleId, hz: u32 },
    SpiRead { handle: HandleId, length: usize },
    SpiWrite { handle: HandleId, data: Vec<u8> },
    SpiTransfer { handle: HandleId, data: Vec<u8> },

    // ── ADC ─────────────────────
    AdcRead { handle: HandleId },
}

impl Request {
    /// Resource key requested by an open call.
    pub fn open_key(&self) -> Option<ResourceKey> {
        match *self {
            Self::GpioOpen { pin } => Some(ResourceKey::Gpio { pin }),
            Self::I2cOpen { bus, address } => Some(ResourceKey::I2c { bus, address }),
            Self::PwmOpen { chip, pin } => Some(ResourceKey::Pwm { chip, pin }),
            Self::AdcOpen { device, channel } => Some(ResourceKey::Adc { device, channel }),
            Self::UartOpen { port } => Some(ResourceKey::Uart { port }),
            Self::SpiOpen { bus, cs } => Some(ResourceKey::Spi { bus, cs }),
            _ => None,
        }
    }
}

/// Successful response body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Payload {
    Handle(HandleId),
    Value(u32),
    Data(Vec<u8>),
    Direction(GpioDirection),
    Edge(EdgeMode),
}

/// Response to exactly one request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
    pub seq: u64,
    pub status: Status,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Payload>,
}

impl Response {
    pub fn ok(seq: u64, payload: Option<Payload>) -> Self {
        Self {
            seq,
            status: Status::Ok,
            payload,
        }
    }

    pub fn error(seq: u64, err: &BrokerError) -> Self {
        Self {
            seq,
            status: err.status(),
            payload: None,
        }
    }

    pub fn from_result(seq: u64, result: Result<Option<Payload>, BrokerError>) -> Self {
        match result {
            Ok(payload) => Self::ok(seq, payload),
            Err(err) => Self::error(seq, &err),
        }
    }
}

/// Unsolicited notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum Event {
    GpioChanged {
        handle: HandleId,
        pin: u32,
        value: u8,
        timestamp_us: u64,
    },
}

impl Event {
    pub fn gpio_changed(handle: HandleId, event: GpioEvent) -> Self {
        Self::GpioChanged {
            handle,
            pin: event.pin,
            value: event.value,
            timestamp_us: event.timestamp_us,
        }
    }
}
