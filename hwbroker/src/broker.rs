//! Request coordinator.
//!
//! Sequences acquisition (catalog, exclusivity, policy, adapter open,
//! liveness watch), dispatches family operations to the owning handle's
//! device, and drives revocation when a client vanishes.

use crate::adapter::{
    AdcDevice, Device, GpioDevice, I2cDevice, PwmDevice, ReadinessProbe, SpiDevice, UartDevice,
};
use crate::irq::WatchId;
use crate::lifecycle::ClientLifecycleMonitor;
use crate::policy::{AccessPolicy, Decision};
use crate::registry::{Acquisition, Completion, ReservationId, ResourceRegistry};
use hwbroker_common::consts::MAX_TRANSFER_LEN;
use hwbroker_common::error::{BrokerError, BrokerResult};
use hwbroker_common::proto::{Payload, Request, RequestFrame, Response};
use hwbroker_common::types::{Caller, ClientId, HandleId, ResourceKey};
use nix::errno::Errno;
use std::collections::HashMap;
use std::os::fd::OwnedFd;
use tracing::{debug, info, warn};

/// Response plus descriptors to pass alongside it.
#[derive(Debug)]
pub struct Reply {
    pub response: Response,
    pub fds: Vec<OwnedFd>,
}

impl Reply {
    pub fn new(response: Response) -> Self {
        Self {
            response,
            fds: Vec::new(),
        }
    }
}

/// What the loop should do with a request.
#[derive(Debug)]
pub enum Outcome {
    Reply(Reply),
    /// Answer later, once `probe` is ready or has timed out.
    Deferred {
        reservation: ReservationId,
        probe: ReadinessProbe,
    },
}

enum Opened {
    Now(HandleId),
    Later(ReservationId, ReadinessProbe),
}

type OpResult = BrokerResult<Option<Payload>>;

/// Zeroed buffer of `len` bytes, bounded by `MAX_TRANSFER_LEN`.
fn transfer_buffer(len: usize) -> BrokerResult<Vec<u8>> {
    if len > MAX_TRANSFER_LEN {
        return Err(BrokerError::from_errno(Errno::EINVAL));
    }
    let mut buf = Vec::new();
    buf.try_reserve_exact(len)
        .map_err(|_| BrokerError::OutOfMemory)?;
    buf.resize(len, 0);
    Ok(buf)
}

fn check_len(data: &[u8]) -> BrokerResult<()> {
    if data.len() > MAX_TRANSFER_LEN {
        return Err(BrokerError::from_errno(Errno::EINVAL));
    }
    Ok(())
}

macro_rules! family_device {
    ($name:ident, $variant:ident, $ty:ty) => {
        fn $name(&mut self, handle: HandleId, owner: ClientId) -> BrokerResult<&mut $ty> {
            match self.registry.validate_mut(handle, owner)?.device_mut() {
                Device::$variant(device) => Ok(device),
                _ => Err(BrokerError::InvalidHandle),
            }
        }
    };
}

pub struct Broker {
    registry: ResourceRegistry,
    policy: Box<dyn AccessPolicy>,
    lifecycle: ClientLifecycleMonitor,
    /// `seq` of the open request behind each pending reservation.
    pending: HashMap<ReservationId, u64>,
}

impl Broker {
    pub fn new(
        registry: ResourceRegistry,
        policy: Box<dyn AccessPolicy>,
        lifecycle: ClientLifecycleMonitor,
    ) -> Self {
        Self {
            registry,
            policy,
            lifecycle,
            pending: HashMap::new(),
        }
    }

    pub fn registry(&self) -> &ResourceRegistry {
        &self.registry
    }

    pub fn lifecycle(&self) -> &ClientLifecycleMonitor {
        &self.lifecycle
    }

    /// Handle one request from `caller`.
    pub fn handle(&mut self, caller: &Caller, frame: RequestFrame) -> Outcome {
        let seq = frame.seq;
        if let Some(key) = frame.request.open_key() {
            return match self.open(caller, key) {
                Ok(Opened::Now(handle)) => Outcome::Reply(self.open_reply(seq, caller.id, handle)),
                Ok(Opened::Later(reservation, probe)) => {
                    self.pending.insert(reservation, seq);
                    Outcome::Deferred { reservation, probe }
                }
                Err(err) => Outcome::Reply(Reply::new(Response::error(seq, &err))),
            };
        }

        let result = self.dispatch(caller.id, frame.request);
        if let Err(err) = &result {
            debug!(client = %caller.id, seq, error = %err, "request failed");
        }
        Outcome::Reply(Reply::new(Response::from_result(seq, result)))
    }

    // ── Acquisition ─────────────────────────────────────────────────

    fn open(&mut self, caller: &Caller, key: ResourceKey) -> BrokerResult<Opened> {
        let client = caller.id;
        let reservation = self.registry.reserve(key, client)?;

        match self.policy.check(caller) {
            Ok(Decision::Allow) => {}
            Ok(Decision::Deny) => {
                self.registry.abandon(reservation);
                warn!(%client, %key, "acquisition denied by policy");
                return Err(BrokerError::PermissionDenied);
            }
            Err(err) => {
                self.registry.abandon(reservation);
                return Err(err);
            }
        }

        match self.registry.open_reserved(reservation)? {
            Acquisition::Ready(handle) => {
                self.commit(client, handle)?;
                Ok(Opened::Now(handle))
            }
            Acquisition::Pending { reservation, probe } => Ok(Opened::Later(reservation, probe)),
        }
    }

    /// Bind a freshly inserted handle to its owner's liveness watch.
    fn commit(&mut self, owner: ClientId, handle: HandleId) -> BrokerResult<()> {
        if let Err(err) = self.lifecycle.watch(owner) {
            warn!(client = %owner, %handle, error = %err, "liveness watch failed, releasing");
            if let Err(release_err) = self.registry.release(handle, owner) {
                warn!(%handle, error = %release_err, "release after watch failure");
            }
            return Err(err);
        }
        Ok(())
    }

    fn open_reply(&mut self, seq: u64, owner: ClientId, handle: HandleId) -> Reply {
        let fds = self.registry.validate(handle, owner).and_then(|h| {
            h.device()
                .client_fds()
                .into_iter()
                .map(|fd| fd.try_clone_to_owned().map_err(BrokerError::from))
                .collect::<BrokerResult<Vec<OwnedFd>>>()
        });
        match fds {
            Ok(fds) => Reply {
                response: Response::ok(seq, Some(Payload::Handle(handle))),
                fds,
            },
            Err(err) => {
                warn!(%handle, error = %err, "descriptor duplication failed");
                self.close(handle, owner).ok();
                Reply::new(Response::error(seq, &err))
            }
        }
    }

    /// Finish a deferred open. Returns the reply and who to send it to,
    /// or `None` if the requester is gone.
    pub fn on_gpio_ready(
        &mut self,
        reservation: ReservationId,
        readiness: BrokerResult<()>,
    ) -> Option<(ClientId, Reply)> {
        let seq = self.pending.remove(&reservation).unwrap_or_default();
        match self.registry.complete(reservation, readiness) {
            Completion::Opened { owner, handle } => {
                if let Err(err) = self.commit(owner, handle) {
                    return Some((owner, Reply::new(Response::error(seq, &err))));
                }
                Some((owner, self.open_reply(seq, owner, handle)))
            }
            Completion::Failed { owner, error } => {
                Some((owner, Reply::new(Response::error(seq, &error))))
            }
            Completion::Orphaned => None,
        }
    }

    // ── Release and revocation ──────────────────────────────────────

    fn close(&mut self, handle: HandleId, owner: ClientId) -> BrokerResult<()> {
        let result = self.registry.release(handle, owner);
        if !self.registry.has_handles(owner) {
            self.lifecycle.unwatch(owner);
        }
        result
    }

    /// The transport lost `client`.
    pub fn client_disconnected(&mut self, client: ClientId) {
        if self.lifecycle.vanished(client) {
            self.registry.release_all_for(client);
        }
        let orphaned = self.registry.orphan_pending(client);
        if orphaned > 0 {
            debug!(%client, orphaned, "pending opens orphaned");
        }
        self.policy.forget(client);
    }

    /// Release everything, for shutdown.
    pub fn shutdown(&mut self) {
        let owners = self.registry.owners();
        let mut released = 0;
        for owner in owners {
            self.lifecycle.unwatch(owner);
            released += self.registry.release_all_for(owner);
        }
        info!(released, "all handles released");
    }

    // ── Interrupts ──────────────────────────────────────────────────

    pub fn on_gpio_wake(&mut self, handle: HandleId, watch: WatchId, timestamp_us: u64) {
        if let Err(err) = self.registry.on_gpio_wake(handle, watch, timestamp_us) {
            warn!(%handle, error = %err, "gpio wake handling failed");
        }
    }

    // ── Family operations ───────────────────────────────────────────

    family_device!(gpio, Gpio, GpioDevice);
    family_device!(i2c, I2c, I2cDevice);
    family_device!(pwm, Pwm, PwmDevice);
    family_device!(adc, Adc, AdcDevice);
    family_device!(uart, Uart, UartDevice);
    family_device!(spi, Spi, SpiDevice);

    fn dispatch(&mut self, owner: ClientId, request: Request) -> OpResult {
        match request {
            Request::Close { handle } => self.close(handle, owner).map(|()| None),

            Request::GpioGetDirection { handle } => {
                let direction = self.gpio(handle, owner)?.direction();
                Ok(Some(Payload::Direction(direction)))
            }
            Request::GpioSetDirection { handle, direction } => {
                self.gpio(handle, owner)?.set_direction(direction)?;
                Ok(None)
            }
            Request::GpioGetEdge { handle } => {
                let edge = self.gpio(handle, owner)?.edge();
                Ok(Some(Payload::Edge(edge)))
            }
            Request::GpioSetEdge { handle, edge } => {
                self.gpio(handle, owner)?.set_edge(edge)?;
                Ok(None)
            }
            Request::GpioRead { handle } => {
                let value = self.gpio(handle, owner)?.read()?;
                Ok(Some(Payload::Value(u32::from(value))))
            }
            Request::GpioWrite { handle, value } => {
                self.gpio(handle, owner)?.write(value)?;
                Ok(None)
            }
            Request::GpioRegisterIrq { handle } => {
                self.registry.register_irq(handle, owner)?;
                Ok(None)
            }
            Request::GpioUnregisterIrq { handle } => {
                self.registry.unregister_irq(handle, owner)?;
                Ok(None)
            }

            Request::I2cRead { handle, length } => {
                let device = self.i2c(handle, owner)?;
                let mut buf = transfer_buffer(length)?;
                let n = device.read(&mut buf)?;
                buf.truncate(n);
                Ok(Some(Payload::Data(buf)))
            }
            Request::I2cWrite { handle, data } => {
                check_len(&data)?;
                self.i2c(handle, owner)?.write(&data)?;
                Ok(None)
            }
            Request::I2cSmbus {
                handle,
                transaction,
            } => {
                let data = self.i2c(handle, owner)?.smbus(&transaction)?;
                Ok(transaction.read.then_some(Payload::Data(data)))
            }

            Request::PwmSetPeriod { handle, period_ns } => {
                self.pwm(handle, owner)?.set_period(period_ns)?;
                Ok(None)
            }
            Request::PwmSetDutyCycle {
                handle,
                duty_cycle_ns,
            } => {
                self.pwm(handle, owner)?.set_duty_cycle(duty_cycle_ns)?;
                Ok(None)
            }
            Request::PwmSetPolarity { handle, polarity } => {
                self.pwm(handle, owner)?.set_polarity(polarity)?;
                Ok(None)
            }
            Request::PwmSetEnabled { handle, enabled } => {
                self.pwm(handle, owner)?.set_enabled(enabled)?;
                Ok(None)
            }

            Request::UartFlush { handle } => {
                self.uart(handle, owner)?.flush()?;
                Ok(None)
            }
            Request::UartSetBaudRate { handle, baud } => {
                self.uart(handle, owner)?.set_baud_rate(baud)?;
                Ok(None)
            }
            Request::UartSetMode { handle, mode } => {
                self.uart(handle, owner)?.set_mode(mode)?;
                Ok(None)
            }
            Request::UartSetFlowControl { handle, flow } => {
                self.uart(handle, owner)?.set_flow_control(flow)?;
                Ok(None)
            }
            Request::UartRead { handle, length } => {
                let device = self.uart(handle, owner)?;
                let mut buf = transfer_buffer(length)?;
                let n = device.read(&mut buf)?;
                buf.truncate(n);
                Ok(Some(Payload::Data(buf)))
            }
            Request::UartWrite { handle, data } => {
                check_len(&data)?;
                self.uart(handle, owner)?.write(&data)?;
                Ok(None)
            }

            Request::SpiSetMode { handle, mode } => {
                self.spi(handle, owner)?.set_mode(mode)?;
                Ok(None)
            }
            Request::SpiSetBitOrder { handle, order } => {
                self.spi(handle, owner)?.set_bit_order(order)?;
                Ok(None)
            }
            Request::SpiSetBitsPerWord { handle, bits } => {
                self.spi(handle, owner)?.set_bits_per_word(bits)?;
                Ok(None)
            }
            Request::SpiSetFrequency { handle, hz } => {
                self.spi(handle, owner)?.set_frequency(hz)?;
                Ok(None)
            }
            Request::SpiRead { handle, length } => {
                let device = self.spi(handle, owner)?;
                let mut buf = transfer_buffer(length)?;
                let n = device.read(&mut buf)?;
                buf.truncate(n);
                Ok(Some(Payload::Data(buf)))
            }
            Request::SpiWrite { handle, data } => {
                check_len(&data)?;
                self.spi(handle, owner)?.write(&data)?;
                Ok(None)
            }
            Request::SpiTransfer { handle, data } => {
                let device = self.spi(handle, owner)?;
                let mut rx = transfer_buffer(data.len())?;
                device.transfer(&data, &mut rx)?;
                Ok(Some(Payload::Data(rx)))
            }

            Request::AdcRead { handle } => {
                let value = self.adc(handle, owner)?.read()?;
                Ok(Some(Payload::Value(value)))
            }

            Request::GpioOpen { .. }
            | Request::I2cOpen { .. }
            | Request::PwmOpen { .. }
            | Request::AdcOpen { .. }
            | Request::UartOpen { .. }
            | Request::SpiOpen { .. } => Err(BrokerError::Unknown("open routed to dispatch".into())),
        }
    }
}
