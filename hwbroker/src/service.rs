//! The single-threaded event loop.
//!
//! Connection tasks, interrupt watches and readiness waits all post
//! [`LoopEvent`]s into one channel; [`EventLoop::dispatch`] applies them to
//! the broker in arrival order. Per-client ordering follows from that:
//! a client's `Connected` precedes its requests, which precede its
//! `Disconnected`.

use crate::adapter::SysfsAdapter;
use crate::broker::{Broker, Outcome, Reply};
use crate::irq::{GpioInterruptEngine, WatchId};
use crate::lifecycle::ClientLifecycleMonitor;
use crate::policy;
use crate::reactor::{ReadinessWaiter, TokioIrqReactor};
use crate::registry::{ReservationId, ResourceRegistry};
use crate::transport::{self, ClientLinks, ClientSink, ConnectionLink, ConnectionLiveness};
use hwbroker_common::catalog::BoardCatalog;
use hwbroker_common::config::BrokerConfig;
use hwbroker_common::error::BrokerResult;
use hwbroker_common::proto::RequestFrame;
use hwbroker_common::types::{Caller, ClientId, HandleId};
use std::rc::Rc;
use tokio::net::UnixListener;
use tokio::signal;
use tokio::signal::unix::{SignalKind, signal as unix_signal};
use tokio::sync::mpsc::{self, UnboundedSender};
use tracing::{debug, error, info};

/// Everything the loop reacts to.
#[derive(Debug)]
pub enum LoopEvent {
    Connected {
        client: ClientId,
        link: ConnectionLink,
    },
    Request {
        caller: Caller,
        frame: RequestFrame,
    },
    Disconnected {
        client: ClientId,
    },
    GpioWake {
        handle: HandleId,
        watch: WatchId,
        timestamp_us: u64,
    },
    GpioReady {
        reservation: ReservationId,
        result: BrokerResult<()>,
    },
}

pub struct EventLoop {
    broker: Broker,
    links: ClientLinks,
    readiness: ReadinessWaiter,
}

impl EventLoop {
    /// Wire the production broker: sysfs adapter, tokio interrupt
    /// reactor, connection liveness and the configured policy.
    pub fn build(
        config: &BrokerConfig,
        catalog: BoardCatalog,
        events: UnboundedSender<LoopEvent>,
    ) -> Self {
        let links = ClientLinks::default();

        let irq = GpioInterruptEngine::new(
            Box::new(TokioIrqReactor::new(events.clone())),
            Box::new(ClientSink::new(Rc::clone(&links))),
        );
        let adapter = SysfsAdapter::new(config.sysfs.clone());
        let registry = ResourceRegistry::new(catalog, Box::new(adapter), irq);
        let lifecycle =
            ClientLifecycleMonitor::new(Box::new(ConnectionLiveness::new(Rc::clone(&links))));
        let broker = Broker::new(
            registry,
            Box::new(policy::from_config(&config.policy)),
            lifecycle,
        );

        let readiness = ReadinessWaiter::new(
            events,
            config.gpio.ready_attempts,
            config.gpio.ready_interval(),
        );

        Self {
            broker,
            links,
            readiness,
        }
    }

    pub fn broker(&self) -> &Broker {
        &self.broker
    }

    pub fn connected(&self) -> usize {
        self.links.borrow().len()
    }

    pub fn dispatch(&mut self, event: LoopEvent) {
        match event {
            LoopEvent::Connected { client, link } => {
                debug!(%client, "client registered");
                self.links.borrow_mut().insert(client, link);
            }
            LoopEvent::Request { caller, frame } => match self.broker.handle(&caller, frame) {
                Outcome::Reply(reply) => self.send(caller.id, reply),
                Outcome::Deferred { reservation, probe } => {
                    debug!(client = %caller.id, ?reservation, "open deferred");
                    self.readiness.spawn(reservation, probe);
                }
            },
            LoopEvent::Disconnected { client } => {
                self.broker.client_disconnected(client);
                self.links.borrow_mut().remove(&client);
            }
            LoopEvent::GpioWake {
                handle,
                watch,
                timestamp_us,
            } => self.broker.on_gpio_wake(handle, watch, timestamp_us),
            LoopEvent::GpioReady {
                reservation,
                result,
            } => {
                if let Some((client, reply)) = self.broker.on_gpio_ready(reservation, result) {
                    self.send(client, reply);
                }
            }
        }
    }

    fn send(&self, client: ClientId, reply: Reply) {
        let links = self.links.borrow();
        let delivered = links
            .get(&client)
            .is_some_and(|link| link.send_response(&reply.response, reply.fds));
        if !delivered {
            debug!(%client, seq = reply.response.seq, "response for closed connection dropped");
        }
    }

    /// Release every handle ahead of exit.
    pub fn shutdown(&mut self) {
        self.broker.shutdown();
        self.links.borrow_mut().clear();
    }
}

async fn shutdown_signal() {
    let terminate = async {
        match unix_signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(err) => {
                error!("Unable to listen for SIGTERM: {}", err);
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        result = signal::ctrl_c() => match result {
            Ok(()) => info!("Received shutdown signal (Ctrl+C)"),
            Err(err) => error!("Unable to listen for shutdown signal: {}", err),
        },
        () = terminate => info!("Received shutdown signal (SIGTERM)"),
    }
}

/// Serve `listener` until SIGINT or SIGTERM, then release everything.
pub async fn run(
    config: &BrokerConfig,
    catalog: BoardCatalog,
    listener: UnixListener,
) -> BrokerResult<()> {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut event_loop = EventLoop::build(config, catalog, tx.clone());
    let accept = tokio::spawn(transport::accept_loop(listener, tx));

    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            () = &mut shutdown => {
                info!("Initiating graceful shutdown...");
                break;
            }
            event = rx.recv() => match event {
                Some(event) => event_loop.dispatch(event),
                None => break,
            },
        }
    }

    accept.abort();
    event_loop.shutdown();
    info!("Broker stopped");
    Ok(())
}
