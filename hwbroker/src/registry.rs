//! Resource registry: the handle store.
//!
//! Owns exclusivity (one live handle or pending reservation per
//! [`ResourceKey`]), ownership validation and teardown ordering. Every
//! call carries the caller's [`ClientId`] explicitly.
//!
//! Acquisition is two-phase so that GPIO opens can wait for their value
//! node without blocking the loop:
//!
//! ```text
//! reserve ──> open_reserved ──> Ready(handle)
//!                   └─────────> Pending ──(readiness)──> complete
//! ```
//!
//! A reservation holds the key exactly like a live handle does, so a
//! competing `reserve` sees `Busy` for the whole window.

use crate::adapter::{Device, DeviceAdapter, Opening, ReadinessProbe};
use crate::irq::{GpioInterruptEngine, WatchId};
use hwbroker_common::catalog::BoardCatalog;
use hwbroker_common::error::{BrokerError, BrokerResult};
use hwbroker_common::types::{ClientId, HandleId, ResourceKey};
use std::collections::{BTreeSet, HashMap};
use tracing::{debug, info, warn};

/// Identity of an in-flight acquisition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ReservationId(pub u64);

/// One client's exclusive lease on one resource.
#[derive(Debug)]
pub struct Handle {
    id: HandleId,
    key: ResourceKey,
    owner: ClientId,
    device: Device,
}

impl Handle {
    pub fn id(&self) -> HandleId {
        self.id
    }

    pub fn key(&self) -> ResourceKey {
        self.key
    }

    pub fn owner(&self) -> ClientId {
        self.owner
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn device_mut(&mut self) -> &mut Device {
        &mut self.device
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Slot {
    Live(HandleId),
    Pending(ReservationId),
}

#[derive(Debug)]
struct PendingEntry {
    key: ResourceKey,
    /// `None` once the requesting client has vanished.
    owner: Option<ClientId>,
}

/// Outcome of the adapter open step.
#[derive(Debug)]
pub enum Acquisition {
    Ready(HandleId),
    Pending {
        reservation: ReservationId,
        probe: ReadinessProbe,
    },
}

/// Outcome of finishing a pending acquisition.
#[derive(Debug)]
pub enum Completion {
    Opened { owner: ClientId, handle: HandleId },
    Failed { owner: ClientId, error: BrokerError },
    /// The requester vanished (or the reservation was unknown); the
    /// reservation has been dropped.
    Orphaned,
}

fn owned(
    handles: &HashMap<HandleId, Handle>,
    id: HandleId,
    owner: ClientId,
) -> BrokerResult<&Handle> {
    handles
        .get(&id)
        .filter(|h| h.owner == owner)
        .ok_or(BrokerError::InvalidHandle)
}

fn owned_mut(
    handles: &mut HashMap<HandleId, Handle>,
    id: HandleId,
    owner: ClientId,
) -> BrokerResult<&mut Handle> {
    handles
        .get_mut(&id)
        .filter(|h| h.owner == owner)
        .ok_or(BrokerError::InvalidHandle)
}

pub struct ResourceRegistry {
    catalog: BoardCatalog,
    adapter: Box<dyn DeviceAdapter>,
    irq: GpioInterruptEngine,
    handles: HashMap<HandleId, Handle>,
    slots: HashMap<ResourceKey, Slot>,
    pending: HashMap<ReservationId, PendingEntry>,
    by_owner: HashMap<ClientId, BTreeSet<HandleId>>,
    last_handle: u32,
    last_reservation: u64,
}

impl ResourceRegistry {
    pub fn new(
        catalog: BoardCatalog,
        adapter: Box<dyn DeviceAdapter>,
        irq: GpioInterruptEngine,
    ) -> Self {
        Self {
            catalog,
            adapter,
            irq,
            handles: HashMap::new(),
            slots: HashMap::new(),
            pending: HashMap::new(),
            by_owner: HashMap::new(),
            last_handle: 0,
            last_reservation: 0,
        }
    }

    pub fn catalog(&self) -> &BoardCatalog {
        &self.catalog
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// `true` if a live handle or a reservation holds `key`.
    pub fn is_held(&self, key: &ResourceKey) -> bool {
        self.slots.contains_key(key)
    }

    pub fn has_handles(&self, owner: ClientId) -> bool {
        self.by_owner.get(&owner).is_some_and(|set| !set.is_empty())
    }

    pub fn handles_of(&self, owner: ClientId) -> Vec<HandleId> {
        self.by_owner
            .get(&owner)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default()
    }

    // ── Acquisition ─────────────────────────────────────────────────

    /// Claim `key` for `owner` without touching the adapter.
    pub fn reserve(&mut self, key: ResourceKey, owner: ClientId) -> BrokerResult<ReservationId> {
        let (arg1, arg2) = key.catalog_args();
        if self.catalog.find(key.family(), arg1, arg2).is_none() {
            debug!(%key, client = %owner, "resource not on this board");
            return Err(BrokerError::Unsupported);
        }
        if self.slots.contains_key(&key) {
            debug!(%key, client = %owner, "resource busy");
            return Err(BrokerError::Busy);
        }
        self.pending
            .try_reserve(1)
            .map_err(|_| BrokerError::OutOfMemory)?;
        self.slots
            .try_reserve(1)
            .map_err(|_| BrokerError::OutOfMemory)?;

        self.last_reservation += 1;
        let reservation = ReservationId(self.last_reservation);
        self.slots.insert(key, Slot::Pending(reservation));
        self.pending.insert(
            reservation,
            PendingEntry {
                key,
                owner: Some(owner),
            },
        );
        Ok(reservation)
    }

    /// Drop a reservation that never reached the adapter.
    pub fn abandon(&mut self, reservation: ReservationId) {
        if let Some(entry) = self.pending.remove(&reservation) {
            self.free_slot(&entry.key, Slot::Pending(reservation));
        }
    }

    /// Run the adapter open for a reservation. On adapter failure the
    /// reservation is dropped and nothing is inserted.
    pub fn open_reserved(&mut self, reservation: ReservationId) -> BrokerResult<Acquisition> {
        let (key, owner) = match self.pending.get(&reservation) {
            Some(PendingEntry {
                key,
                owner: Some(owner),
            }) => (*key, *owner),
            _ => return Err(BrokerError::Unknown("unknown reservation".into())),
        };

        match self.adapter.open(&key) {
            Ok(Opening::Ready(device)) => {
                self.pending.remove(&reservation);
                self.slots.remove(&key);
                let handle = self.insert(key, owner, device)?;
                Ok(Acquisition::Ready(handle))
            }
            Ok(Opening::Deferred(probe)) => {
                debug!(%key, client = %owner, ?reservation, "open deferred");
                Ok(Acquisition::Pending { reservation, probe })
            }
            Err(err) => {
                warn!(%key, client = %owner, error = %err, "adapter open failed");
                self.abandon(reservation);
                Err(err)
            }
        }
    }

    /// Reserve and open in one step.
    pub fn acquire(&mut self, key: ResourceKey, owner: ClientId) -> BrokerResult<Acquisition> {
        let reservation = self.reserve(key, owner)?;
        self.open_reserved(reservation)
    }

    /// Finish a pending acquisition once its readiness wait is over.
    pub fn complete(
        &mut self,
        reservation: ReservationId,
        readiness: BrokerResult<()>,
    ) -> Completion {
        let Some(entry) = self.pending.remove(&reservation) else {
            debug!(?reservation, "completion for unknown reservation");
            return Completion::Orphaned;
        };
        let key = entry.key;
        self.free_slot(&key, Slot::Pending(reservation));

        let Some(owner) = entry.owner else {
            debug!(%key, ?reservation, "dropping orphaned reservation");
            self.adapter.cancel_open(&key);
            return Completion::Orphaned;
        };

        let opened = match readiness {
            Ok(()) => self.adapter.finish_open(&key),
            Err(err) => {
                self.adapter.cancel_open(&key);
                Err(err)
            }
        };
        match opened.and_then(|device| self.insert(key, owner, device)) {
            Ok(handle) => Completion::Opened { owner, handle },
            Err(error) => {
                warn!(%key, client = %owner, %error, "deferred open failed");
                Completion::Failed { owner, error }
            }
        }
    }

    /// Forget who asked for `owner`'s pending reservations. Returns the
    /// number orphaned.
    pub fn orphan_pending(&mut self, owner: ClientId) -> usize {
        let mut count = 0;
        for entry in self.pending.values_mut() {
            if entry.owner == Some(owner) {
                entry.owner = None;
                count += 1;
            }
        }
        count
    }

    fn next_handle_id(&mut self) -> HandleId {
        loop {
            self.last_handle = self.last_handle.wrapping_add(1);
            let id = HandleId(self.last_handle);
            if id.0 != 0 && !self.handles.contains_key(&id) {
                return id;
            }
        }
    }

    fn insert(
        &mut self,
        key: ResourceKey,
        owner: ClientId,
        device: Device,
    ) -> BrokerResult<HandleId> {
        let reserved = self
            .handles
            .try_reserve(1)
            .and_then(|()| self.slots.try_reserve(1))
            .and_then(|()| self.by_owner.try_reserve(1));
        if reserved.is_err() {
            if let Err(err) = self.adapter.close(device) {
                warn!(%key, error = %err, "close after allocation failure");
            }
            return Err(BrokerError::OutOfMemory);
        }

        let id = self.next_handle_id();
        self.handles.insert(
            id,
            Handle {
                id,
                key,
                owner,
                device,
            },
        );
        self.slots.insert(key, Slot::Live(id));
        self.by_owner.entry(owner).or_default().insert(id);
        info!(handle = %id, %key, client = %owner, "handle opened");
        Ok(id)
    }

    fn free_slot(&mut self, key: &ResourceKey, expected: Slot) {
        if self.slots.get(key) == Some(&expected) {
            self.slots.remove(key);
        }
    }

    // ── Validation ──────────────────────────────────────────────────

    /// The handle, if it exists and belongs to `owner`. Unknown handles
    /// and foreign handles are the same error.
    pub fn validate(&self, id: HandleId, owner: ClientId) -> BrokerResult<&Handle> {
        owned(&self.handles, id, owner)
    }

    pub fn validate_mut(&mut self, id: HandleId, owner: ClientId) -> BrokerResult<&mut Handle> {
        owned_mut(&mut self.handles, id, owner)
    }

    // ── Release ─────────────────────────────────────────────────────

    /// Tear down one handle: interrupt watch first, then the adapter
    /// close. The entry is gone afterwards even if the close failed; the
    /// close error is returned.
    pub fn release(&mut self, id: HandleId, owner: ClientId) -> BrokerResult<()> {
        owned(&self.handles, id, owner)?;
        let Some(handle) = self.handles.remove(&id) else {
            return Err(BrokerError::InvalidHandle);
        };

        self.irq.unregister(id);
        self.free_slot(&handle.key, Slot::Live(id));
        if let Some(set) = self.by_owner.get_mut(&owner) {
            set.remove(&id);
            if set.is_empty() {
                self.by_owner.remove(&owner);
            }
        }

        let key = handle.key;
        let result = self.adapter.close(handle.device);
        info!(handle = %id, %key, client = %owner, ok = result.is_ok(), "handle released");
        result
    }

    /// Release every handle of `owner`, logging and skipping individual
    /// failures, and orphan its pending reservations. Returns the number
    /// of handles destroyed.
    pub fn release_all_for(&mut self, owner: ClientId) -> usize {
        let ids = self.handles_of(owner);
        for &id in &ids {
            if let Err(err) = self.release(id, owner) {
                warn!(handle = %id, client = %owner, error = %err, "release during revocation failed");
            }
        }
        let orphaned = self.orphan_pending(owner);
        if !ids.is_empty() || orphaned > 0 {
            info!(client = %owner, released = ids.len(), orphaned, "client resources revoked");
        }
        ids.len()
    }

    /// Clients currently owning at least one handle.
    pub fn owners(&self) -> Vec<ClientId> {
        self.by_owner.keys().copied().collect()
    }

    // ── GPIO interrupts ─────────────────────────────────────────────

    pub fn register_irq(&mut self, id: HandleId, owner: ClientId) -> BrokerResult<()> {
        let handle = owned(&self.handles, id, owner)?;
        let Device::Gpio(gpio) = &handle.device else {
            return Err(BrokerError::InvalidHandle);
        };
        self.irq.register(id, gpio)
    }

    pub fn unregister_irq(&mut self, id: HandleId, owner: ClientId) -> BrokerResult<()> {
        let handle = owned(&self.handles, id, owner)?;
        if !matches!(handle.device, Device::Gpio(_)) {
            return Err(BrokerError::InvalidHandle);
        }
        self.irq.unregister(id);
        Ok(())
    }

    pub fn irq_armed(&self, id: HandleId) -> bool {
        self.irq.is_armed(id)
    }

    /// Reactor wake for `id`. Wakes for destroyed handles are dropped.
    pub fn on_gpio_wake(
        &mut self,
        id: HandleId,
        watch: WatchId,
        timestamp_us: u64,
    ) -> BrokerResult<()> {
        let Some(handle) = self.handles.get(&id) else {
            debug!(handle = %id, "wake for released handle");
            return Ok(());
        };
        let Device::Gpio(gpio) = &handle.device else {
            return Ok(());
        };
        self.irq
            .on_wake(id, watch, timestamp_us, gpio, handle.owner)
    }
}
