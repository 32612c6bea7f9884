//! Unix socket transport.
//!
//! Each accepted connection is one client. A reader task turns request
//! lines into [`LoopEvent::Request`]s, a writer task drains the
//! connection's outbox and attaches descriptors as `SCM_RIGHTS`. Neither
//! task touches broker state; the loop owns the link table.

use crate::irq::EventSink;
use crate::lifecycle::{LivenessWatcher, WatchToken};
use crate::service::LoopEvent;
use hwbroker_common::consts::MAX_REQUEST_LINE;
use hwbroker_common::error::{BrokerError, BrokerResult};
use hwbroker_common::proto::{Event, RequestFrame, Response};
use hwbroker_common::types::{Caller, ClientId, Credentials, GpioEvent, HandleId};
use nix::sys::socket::{ControlMessage, MsgFlags, sendmsg};
use serde::Serialize;
use std::cell::RefCell;
use std::collections::HashMap;
use std::io::{self, IoSlice};
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::rc::Rc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader, Interest};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::{debug, info, warn};

/// One encoded line plus descriptors to pass with it.
#[derive(Debug)]
pub struct Outgoing {
    pub line: Vec<u8>,
    pub fds: Vec<OwnedFd>,
}

fn encode_line<T: Serialize>(message: &T) -> Option<Vec<u8>> {
    match serde_json::to_vec(message) {
        Ok(mut line) => {
            line.push(b'\n');
            Some(line)
        }
        Err(err) => {
            warn!(error = %err, "message encoding failed");
            None
        }
    }
}

/// Sending side of one client connection.
#[derive(Debug, Clone)]
pub struct ConnectionLink {
    outbox: UnboundedSender<Outgoing>,
}

impl ConnectionLink {
    pub fn new(outbox: UnboundedSender<Outgoing>) -> Self {
        Self { outbox }
    }

    /// Queue a response; `false` if the connection is gone.
    pub fn send_response(&self, response: &Response, fds: Vec<OwnedFd>) -> bool {
        match encode_line(response) {
            Some(line) => self.outbox.send(Outgoing { line, fds }).is_ok(),
            None => false,
        }
    }

    pub fn send_event(&self, event: &Event) -> bool {
        match encode_line(event) {
            Some(line) => self
                .outbox
                .send(Outgoing {
                    line,
                    fds: Vec::new(),
                })
                .is_ok(),
            None => false,
        }
    }
}

/// Live connections, owned by the loop.
pub type ClientLinks = Rc<RefCell<HashMap<ClientId, ConnectionLink>>>;

/// [`LivenessWatcher`] over connection presence.
pub struct ConnectionLiveness {
    links: ClientLinks,
    watched: HashMap<WatchToken, ClientId>,
    last_token: u64,
}

impl ConnectionLiveness {
    pub fn new(links: ClientLinks) -> Self {
        Self {
            links,
            watched: HashMap::new(),
            last_token: 0,
        }
    }

    pub fn is_watching(&self, client: ClientId) -> bool {
        self.watched.values().any(|&c| c == client)
    }
}

impl LivenessWatcher for ConnectionLiveness {
    fn watch(&mut self, client: ClientId) -> BrokerResult<WatchToken> {
        if !self.links.borrow().contains_key(&client) {
            return Err(BrokerError::Unknown(format!("client {client} not connected")));
        }
        self.last_token += 1;
        let token = WatchToken(self.last_token);
        self.watched.insert(token, client);
        Ok(token)
    }

    fn unwatch(&mut self, token: WatchToken) {
        self.watched.remove(&token);
    }
}

/// [`EventSink`] routing events to the owner's connection.
pub struct ClientSink {
    links: ClientLinks,
}

impl ClientSink {
    pub fn new(links: ClientLinks) -> Self {
        Self { links }
    }
}

impl EventSink for ClientSink {
    fn emit(&mut self, owner: ClientId, handle: HandleId, event: GpioEvent) {
        let links = self.links.borrow();
        let Some(link) = links.get(&owner) else {
            debug!(client = %owner, %handle, "event for disconnected client dropped");
            return;
        };
        if !link.send_event(&Event::gpio_changed(handle, event)) {
            debug!(client = %owner, %handle, "event send failed");
        }
    }
}

fn peer_credentials(stream: &UnixStream) -> Option<Credentials> {
    let cred = stream.peer_cred().ok()?;
    Some(Credentials {
        pid: cred.pid()?,
        uid: cred.uid(),
        gid: cred.gid(),
    })
}

/// Accept clients until the loop goes away.
pub async fn accept_loop(listener: UnixListener, events: UnboundedSender<LoopEvent>) {
    let mut last_client = 0u64;
    loop {
        let stream = match listener.accept().await {
            Ok((stream, _)) => stream,
            Err(err) => {
                warn!(error = %err, "accept failed");
                tokio::time::sleep(Duration::from_millis(100)).await;
                continue;
            }
        };

        last_client += 1;
        let client = ClientId(last_client);
        let credentials = peer_credentials(&stream);
        let (read_half, write_half) = stream.into_split();
        let (outbox, outbox_rx) = mpsc::unbounded_channel();
        let link = ConnectionLink::new(outbox);

        if events
            .send(LoopEvent::Connected {
                client,
                link: link.clone(),
            })
            .is_err()
        {
            return;
        }
        info!(%client, ?credentials, "client connected");

        tokio::spawn(write_loop(client, write_half, outbox_rx));
        tokio::spawn(read_loop(
            Caller::new(client, credentials),
            read_half,
            link,
            events.clone(),
        ));
    }
}

/// Best-effort `seq` of a line that failed to parse as a request.
fn salvage_seq(line: &[u8]) -> u64 {
    serde_json::from_slice::<serde_json::Value>(line)
        .ok()
        .and_then(|v| v.get("seq").and_then(serde_json::Value::as_u64))
        .unwrap_or(0)
}

async fn read_loop(
    caller: Caller,
    read_half: OwnedReadHalf,
    link: ConnectionLink,
    events: UnboundedSender<LoopEvent>,
) {
    let client = caller.id;
    let mut reader = BufReader::new(read_half);
    let mut line = Vec::new();
    let limit = MAX_REQUEST_LINE as u64 + 1;

    loop {
        line.clear();
        match (&mut reader).take(limit).read_until(b'\n', &mut line).await {
            Ok(0) => break,
            Ok(_) => {}
            Err(err) => {
                debug!(%client, error = %err, "read failed");
                break;
            }
        }
        if line.last() != Some(&b'\n') && line.len() as u64 >= limit {
            warn!(%client, "request line too long, dropping client");
            break;
        }
        let body = line.trim_ascii();
        if body.is_empty() {
            continue;
        }

        match serde_json::from_slice::<RequestFrame>(body) {
            Ok(frame) => {
                if events.send(LoopEvent::Request { caller, frame }).is_err() {
                    return;
                }
            }
            Err(err) => {
                debug!(%client, error = %err, "malformed request");
                let error = BrokerError::Unknown(format!("malformed request: {err}"));
                link.send_response(&Response::error(salvage_seq(body), &error), Vec::new());
            }
        }
    }

    info!(%client, "client disconnected");
    let _ = events.send(LoopEvent::Disconnected { client });
}

fn send_with_fds(socket: RawFd, data: &[u8], fds: &[OwnedFd]) -> io::Result<usize> {
    let raw: Vec<RawFd> = fds.iter().map(AsRawFd::as_raw_fd).collect();
    let iov = [IoSlice::new(data)];
    let cmsg = [ControlMessage::ScmRights(&raw)];
    sendmsg::<()>(socket, &iov, &cmsg, MsgFlags::MSG_NOSIGNAL, None).map_err(io::Error::from)
}

async fn write_message(half: &mut OwnedWriteHalf, message: Outgoing) -> io::Result<()> {
    if message.fds.is_empty() {
        return half.write_all(&message.line).await;
    }

    let sent = {
        let stream: &UnixStream = half.as_ref();
        loop {
            stream.writable().await?;
            match stream.try_io(Interest::WRITABLE, || {
                send_with_fds(stream.as_raw_fd(), &message.line, &message.fds)
            }) {
                Ok(n) => break n,
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => continue,
                Err(err) => return Err(err),
            }
        }
    };
    // The descriptors went with the first chunk; the rest is plain data.
    half.write_all(&message.line[sent..]).await
}

async fn write_loop(
    client: ClientId,
    mut half: OwnedWriteHalf,
    mut outbox: UnboundedReceiver<Outgoing>,
) {
    while let Some(message) = outbox.recv().await {
        if let Err(err) = write_message(&mut half, message).await {
            debug!(%client, error = %err, "write failed");
            break;
        }
    }
}
