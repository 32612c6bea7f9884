//! Tokio glue for the event loop: GPIO interrupt watches and deferred
//! readiness waits. Both run as tasks that only post [`LoopEvent`]s
//! back; no broker state is touched off the loop.

use crate::adapter::{ReadinessProbe, sysfs};
use crate::irq::{IrqReactor, WatchId};
use crate::registry::ReservationId;
use crate::service::LoopEvent;
use hwbroker_common::error::{BrokerError, BrokerResult};
use hwbroker_common::types::HandleId;
use nix::time::{ClockId, clock_gettime};
use std::collections::HashMap;
use std::os::fd::{BorrowedFd, OwnedFd};
use std::path::Path;
use std::time::Duration;
use tokio::io::Interest;
use tokio::io::unix::AsyncFd;
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Microseconds on `CLOCK_MONOTONIC`.
pub fn monotonic_us() -> u64 {
    match clock_gettime(ClockId::CLOCK_MONOTONIC) {
        Ok(ts) => {
            let secs = u64::try_from(ts.tv_sec()).unwrap_or(0);
            let nanos = u64::try_from(ts.tv_nsec()).unwrap_or(0);
            secs * 1_000_000 + nanos / 1_000
        }
        Err(_) => 0,
    }
}

/// [`IrqReactor`] over `AsyncFd` priority readiness.
pub struct TokioIrqReactor {
    events: UnboundedSender<LoopEvent>,
    tasks: HashMap<WatchId, JoinHandle<()>>,
    last_watch: u64,
}

impl TokioIrqReactor {
    pub fn new(events: UnboundedSender<LoopEvent>) -> Self {
        Self {
            events,
            tasks: HashMap::new(),
            last_watch: 0,
        }
    }
}

async fn watch_priority(
    fd: AsyncFd<OwnedFd>,
    handle: HandleId,
    watch: WatchId,
    events: UnboundedSender<LoopEvent>,
) {
    loop {
        let mut guard = match fd.ready(Interest::PRIORITY).await {
            Ok(guard) => guard,
            Err(err) => {
                warn!(%handle, error = %err, "gpio watch failed");
                return;
            }
        };
        let timestamp_us = monotonic_us();
        guard.clear_ready();
        let wake = LoopEvent::GpioWake {
            handle,
            watch,
            timestamp_us,
        };
        if events.send(wake).is_err() {
            return;
        }
    }
}

impl IrqReactor for TokioIrqReactor {
    fn arm(&mut self, handle: HandleId, fd: BorrowedFd<'_>) -> BrokerResult<WatchId> {
        let owned = fd.try_clone_to_owned()?;
        let async_fd = AsyncFd::with_interest(owned, Interest::PRIORITY)?;

        self.last_watch += 1;
        let watch = WatchId(self.last_watch);
        let task = tokio::spawn(watch_priority(async_fd, handle, watch, self.events.clone()));
        self.tasks.insert(watch, task);
        debug!(%handle, ?watch, "priority watch armed");
        Ok(watch)
    }

    fn disarm(&mut self, watch: WatchId) {
        if let Some(task) = self.tasks.remove(&watch) {
            task.abort();
        }
    }
}

impl Drop for TokioIrqReactor {
    fn drop(&mut self) {
        for (_, task) in self.tasks.drain() {
            task.abort();
        }
    }
}

/// Poll `path` for accessibility: up to `attempts` checks, `interval`
/// apart. Gives up with `TryAgain`.
pub async fn wait_for_node(path: &Path, attempts: u32, interval: Duration) -> BrokerResult<()> {
    for attempt in 1..=attempts {
        if sysfs::is_accessible(path) {
            debug!(path = %path.display(), attempt, "node ready");
            return Ok(());
        }
        if attempt < attempts {
            tokio::time::sleep(interval).await;
        }
    }
    warn!(path = %path.display(), attempts, "node never became accessible");
    Err(BrokerError::TryAgain)
}

/// Spawns readiness waits for deferred opens.
#[derive(Clone)]
pub struct ReadinessWaiter {
    events: UnboundedSender<LoopEvent>,
    attempts: u32,
    interval: Duration,
}

impl ReadinessWaiter {
    pub fn new(events: UnboundedSender<LoopEvent>, attempts: u32, interval: Duration) -> Self {
        Self {
            events,
            attempts,
            interval,
        }
    }

    pub fn spawn(&self, reservation: ReservationId, probe: ReadinessProbe) {
        let events = self.events.clone();
        let (attempts, interval) = (self.attempts, self.interval);
        tokio::spawn(async move {
            let result = wait_for_node(&probe.path, attempts, interval).await;
            let _ = events.send(LoopEvent::GpioReady {
                reservation,
                result,
            });
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;
    use tokio::sync::mpsc;

    #[test]
    fn test_monotonic_clock_advances() {
        let a = monotonic_us();
        std::thread::sleep(Duration::from_millis(2));
        assert!(monotonic_us() > a);
    }

    #[tokio::test]
    async fn test_wait_for_existing_node() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("value");
        fs::write(&path, "0").unwrap();
        wait_for_node(&path, 3, Duration::from_millis(1)).await.unwrap();
    }

    #[tokio::test]
    async fn test_wait_times_out_with_try_again() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("value");
        let err = wait_for_node(&path, 3, Duration::from_millis(1))
            .await
            .unwrap_err();
        assert_eq!(err, BrokerError::TryAgain);
    }

    #[tokio::test]
    async fn test_waiter_posts_ready_event() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("value");
        let (tx, mut rx) = mpsc::unbounded_channel();
        let waiter = ReadinessWaiter::new(tx, 50, Duration::from_millis(2));

        waiter.spawn(ReservationId(4), ReadinessProbe { path: path.clone() });
        fs::write(&path, "0").unwrap();

        match rx.recv().await {
            Some(LoopEvent::GpioReady {
                reservation,
                result,
            }) => {
                assert_eq!(reservation, ReservationId(4));
                assert!(result.is_ok());
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
