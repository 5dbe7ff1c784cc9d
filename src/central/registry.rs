use log::*;
use std::collections::HashMap;
use std::mem;
use std::sync::{Arc, Mutex};
use std::sync::mpsc;
use std::time::Duration;

use crate::error::{Error, ErrorKind};
use crate::timer::Deadline;
use crate::transport::{ConnectionHandle, Dispatch, Transport};
use crate::util::lock;
use crate::uuid::Uuid;
use super::command::{Completion, Outcome, Response};
use super::event::{EventBus, StatusEvent, StatusKind};
use super::peripheral::PeerAddress;
use super::pipeline::{Job, PeerSignal, Worker};
use super::service::{self, Service};

const CONNECTION_LOST: &str = "connection lost";

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum ConnectionState {
    /// The link is being established or its services discovered.
    Connecting,

    /// Services are known and commands are accepted.
    Connected,

    /// Teardown was requested and hasn't been confirmed yet.
    Disconnecting,

    /// No connection.
    Disconnected,
}

struct PeerConnection {
    address: PeerAddress,
    handle: ConnectionHandle,
    state: ConnectionState,
    services: Vec<Service>,
    connect_waiters: Vec<Completion>,
    disconnect_waiters: Vec<Completion>,
    deadline: Option<Deadline>,
    worker: Option<Worker>,
}

impl PeerConnection {
    fn new(address: PeerAddress, handle: ConnectionHandle) -> Self {
        Self {
            address,
            handle,
            state: ConnectionState::Connecting,
            services: Vec::new(),
            connect_waiters: Vec::new(),
            disconnect_waiters: Vec::new(),
            deadline: None,
            worker: None,
        }
    }
}

/// Work to do once the registry lock is released: completions may call back into the registry
/// and closing a worker waits for its thread.
#[derive(Default)]
struct Aftermath {
    completions: Vec<(Completion, Outcome)>,
    workers: Vec<Worker>,
}

impl Aftermath {
    fn complete(&mut self, completion: Completion, outcome: Outcome) {
        self.completions.push((completion, outcome));
    }

    fn complete_all(&mut self, completions: Vec<Completion>, outcome: &Outcome) {
        for c in completions {
            self.complete(c, outcome.clone());
        }
    }

    fn run(self) {
        for worker in self.workers {
            worker.close();
        }
        for (completion, outcome) in self.completions {
            completion(outcome);
        }
    }
}

#[derive(Default)]
struct Peers {
    by_address: HashMap<PeerAddress, PeerConnection>,
    by_handle: HashMap<ConnectionHandle, PeerAddress>,
}

impl Peers {
    fn get_by_handle(&mut self, handle: ConnectionHandle) -> Option<&mut PeerConnection> {
        let address = self.by_handle.get(&handle)?;
        self.by_address.get_mut(address)
    }

    fn remove(&mut self, handle: ConnectionHandle) -> Option<PeerConnection> {
        let address = self.by_handle.remove(&handle)?;
        self.by_address.remove(&address)
    }
}

/// One entry per peer address, owning the peer's connection lifecycle and its pipeline worker.
///
/// All mutation goes through one lock. Transport calls are made while holding it, so a signal can
/// never be processed before the bookkeeping for the request that caused it is in place.
pub(in crate) struct Registry {
    peers: Mutex<Peers>,
    transport: Arc<dyn Transport>,
    bus: EventBus,
    dispatch: Mutex<mpsc::Sender<Dispatch>>,
    chunk_delay: Duration,
}

impl Registry {
    pub fn new(transport: Arc<dyn Transport>, bus: EventBus, dispatch: mpsc::Sender<Dispatch>,
        chunk_delay: Duration) -> Self
    {
        Self {
            peers: Mutex::new(Peers::default()),
            transport,
            bus,
            dispatch: Mutex::new(dispatch),
            chunk_delay,
        }
    }

    pub fn state(&self, address: &PeerAddress) -> ConnectionState {
        lock(&self.peers).by_address.get(address)
            .map(|p| p.state)
            .unwrap_or(ConnectionState::Disconnected)
    }

    pub fn services(&self, address: &PeerAddress) -> Option<Vec<Service>> {
        lock(&self.peers).by_address.get(address)
            .filter(|p| p.state == ConnectionState::Connected)
            .map(|p| p.services.clone())
    }

    pub fn connected(&self) -> Vec<PeerAddress> {
        let mut r: Vec<_> = lock(&self.peers).by_address.values()
            .filter(|p| p.state == ConnectionState::Connected)
            .map(|p| p.address.clone())
            .collect();
        r.sort();
        r
    }

    /// `timeout` of `None` waits indefinitely.
    pub fn connect(&self, address: PeerAddress, timeout: Option<Duration>, completion: Completion) {
        let mut after = Aftermath::default();
        {
            let mut peers = lock(&self.peers);
            match peers.by_address.get(&address).map(|p| p.state) {
                Some(ConnectionState::Connected) => {
                    debug!("{}: already connected", address);
                    self.bus.publish(StatusEvent::peer(StatusKind::Connected, &address));
                    after.complete(completion, Ok(Response::Connected));
                }
                Some(ConnectionState::Connecting) => {
                    debug!("{}: joining pending connection attempt", address);
                    if let Some(p) = peers.by_address.get_mut(&address) {
                        p.connect_waiters.push(completion);
                    }
                }
                Some(_) => {
                    after.complete(completion, Err(Error::new(ErrorKind::NotConnected,
                        "disconnect in progress")));
                }
                None => self.open(&mut peers, address, timeout, completion, &mut after),
            }
        }
        after.run();
    }

    fn open(&self, peers: &mut Peers, address: PeerAddress, timeout: Option<Duration>,
        completion: Completion, after: &mut Aftermath)
    {
        if let Some(other) = peers.by_address.values().find(|p| p.state == ConnectionState::Connecting) {
            warn!("{}: connection attempt to {} still pending, the radio serializes attempts",
                address, other.address);
        }
        self.bus.publish(StatusEvent::peer(StatusKind::Connecting, &address));

        let handle = match self.transport.open_connection(&address) {
            Ok(v) => v,
            Err(e) => {
                warn!("{}: couldn't connect: {}", address, e);
                self.bus.publish(StatusEvent::peer(StatusKind::Disconnected, &address).with_error(&e));
                after.complete(completion, Err(e));
                return;
            }
        };
        info!("{}: connecting as {}", address, handle);

        let mut peer = PeerConnection::new(address.clone(), handle);
        peer.connect_waiters.push(completion);
        peer.deadline = timeout.map(|t| {
            let dispatch = lock(&self.dispatch).clone();
            Deadline::after(t, "connect-timeout", move || {
                let _ = dispatch.send(Dispatch::ConnectTimedOut(handle));
            })
        });
        peers.by_handle.insert(handle, address.clone());
        peers.by_address.insert(address, peer);
    }

    pub fn on_connected(&self, handle: ConnectionHandle) {
        let mut after = Aftermath::default();
        {
            let mut peers = lock(&self.peers);
            let result = match peers.get_by_handle(handle) {
                Some(p) if p.state == ConnectionState::Connecting => {
                    debug!("{}: link up, discovering services", p.address);
                    self.transport.discover_services(handle)
                }
                _ => {
                    debug!("ignoring stray connected signal for {}", handle);
                    return;
                }
            };
            if let Err(e) = result {
                self.fail_attempt(&mut peers, handle, e, true, &mut after);
            }
        }
        after.run();
    }

    pub fn on_services_discovered(&self, handle: ConnectionHandle,
        services: Result<Vec<Service>, Error>)
    {
        let mut after = Aftermath::default();
        {
            let mut peers = lock(&self.peers);
            let p = match peers.get_by_handle(handle) {
                Some(p) if p.state == ConnectionState::Connecting => p,
                _ => {
                    debug!("ignoring stray services signal for {}", handle);
                    return;
                }
            };
            let services = services.and_then(|services| {
                let worker = Worker::spawn(p.address.clone(), handle, self.transport.clone(),
                    self.chunk_delay)?;
                Ok((services, worker))
            });
            match services {
                Ok((services, worker)) => {
                    info!("{}: connected, {} services", p.address, services.len());
                    p.state = ConnectionState::Connected;
                    p.services = services;
                    p.worker = Some(worker);
                    if let Some(deadline) = p.deadline.take() {
                        deadline.cancel();
                    }
                    self.bus.publish(StatusEvent::peer(StatusKind::Connected, &p.address));
                    after.complete_all(mem::replace(&mut p.connect_waiters, Vec::new()),
                        &Ok(Response::Connected));
                }
                Err(e) => self.fail_attempt(&mut peers, handle, e, true, &mut after),
            }
        }
        after.run();
    }

    pub fn connect_timed_out(&self, handle: ConnectionHandle) {
        let mut after = Aftermath::default();
        {
            let mut peers = lock(&self.peers);
            match peers.get_by_handle(handle) {
                Some(p) if p.state == ConnectionState::Connecting => {}
                _ => return,
            }
            self.fail_attempt(&mut peers, handle, Error::timeout(), true, &mut after);
        }
        after.run();
    }

    /// Drops a pending attempt, failing its waiters with `error`.
    fn fail_attempt(&self, peers: &mut Peers, handle: ConnectionHandle, error: Error,
        close: bool, after: &mut Aftermath)
    {
        let p = match peers.remove(handle) {
            Some(p) => p,
            None => return,
        };
        warn!("{}: connection attempt failed: {}", p.address, error);
        if close {
            self.transport.close_connection(handle);
        }
        self.bus.publish(StatusEvent::peer(StatusKind::Disconnected, &p.address).with_error(&error));
        after.complete_all(p.connect_waiters, &Err(error));
        after.complete_all(p.disconnect_waiters, &Ok(Response::Disconnected));
        after.workers.extend(p.worker);
    }

    pub fn on_disconnected(&self, handle: ConnectionHandle, error: Option<Error>) {
        let mut after = Aftermath::default();
        {
            let mut peers = lock(&self.peers);
            let state = match peers.get_by_handle(handle) {
                Some(p) => p.state,
                None => {
                    debug!("ignoring disconnected signal for unknown {}", handle);
                    return;
                }
            };
            match state {
                ConnectionState::Connecting => {
                    let error = error.unwrap_or_else(||
                        Error::new(ErrorKind::Transport, "connection failed"));
                    self.fail_attempt(&mut peers, handle, error, false, &mut after);
                }
                _ => {
                    if let Some(p) = peers.remove(handle) {
                        let mut event = StatusEvent::peer(StatusKind::Disconnected, &p.address);
                        if p.state == ConnectionState::Disconnecting {
                            info!("{}: disconnected", p.address);
                        } else {
                            let reason = error.as_ref().map(|e| e.description())
                                .unwrap_or(CONNECTION_LOST);
                            warn!("{}: {}", p.address, reason);
                            event = event.with_error_message(reason);
                        }
                        self.bus.publish(event);
                        after.complete_all(p.disconnect_waiters, &Ok(Response::Disconnected));
                        after.workers.extend(p.worker);
                    }
                }
            }
        }
        after.run();
    }

    /// Succeeds right away unless the peer is connected.
    pub fn disconnect(&self, address: &PeerAddress, completion: Completion) {
        let mut after = Aftermath::default();
        {
            let mut peers = lock(&self.peers);
            match peers.by_address.get_mut(address) {
                Some(p) if p.state == ConnectionState::Connected => {
                    info!("{}: disconnecting", address);
                    p.state = ConnectionState::Disconnecting;
                    p.disconnect_waiters.push(completion);
                    self.transport.close_connection(p.handle);
                }
                Some(p) if p.state == ConnectionState::Disconnecting => {
                    p.disconnect_waiters.push(completion);
                }
                _ => {
                    debug!("{}: not connected, nothing to disconnect", address);
                    after.complete(completion, Ok(Response::Disconnected));
                }
            }
        }
        after.run();
    }

    /// Rejects the job if the peer isn't connected or lacks the characteristic.
    pub fn submit(&self, address: &PeerAddress, job: Job) {
        let rejected = {
            let peers = lock(&self.peers);
            match peers.by_address.get(address) {
                Some(p) if p.state == ConnectionState::Connected => {
                    match check_characteristic(&p.services, &job) {
                        Ok(notify) => {
                            let job = job.with_notifications(notify);
                            match &p.worker {
                                Some(w) => w.submit(job).err().map(|job| (job, Error::connection_closed())),
                                None => Some((job, Error::connection_closed())),
                            }
                        }
                        Err(e) => Some((job, e)),
                    }
                }
                _ => Some((job, Error::new(ErrorKind::NotConnected,
                    format!("{} is not connected", address)))),
            }
        };
        if let Some((job, e)) = rejected {
            debug!("{}: rejecting command: {}", address, e);
            job.complete(Err(e));
        }
    }

    pub fn on_peer_signal(&self, handle: ConnectionHandle, signal: PeerSignal) {
        let peers = lock(&self.peers);
        match peers.by_handle.get(&handle).and_then(|a| peers.by_address.get(a)) {
            Some(PeerConnection { worker: Some(worker), .. }) => worker.signal(signal),
            _ => debug!("discarding {:?} for {}: no pipeline", signal, handle),
        }
    }

    /// Publishes the value and hands it to the pipeline, which may be reassembling a read.
    pub fn on_characteristic_changed(&self, handle: ConnectionHandle, characteristic: Uuid,
        value: Vec<u8>)
    {
        let peers = lock(&self.peers);
        let p = match peers.by_handle.get(&handle).and_then(|a| peers.by_address.get(a)) {
            Some(p) if p.state != ConnectionState::Connecting => p,
            _ => {
                debug!("discarding notification of {} for {}", characteristic, handle);
                return;
            }
        };
        self.bus.publish(StatusEvent::peer(StatusKind::CharacteristicChanged, &p.address)
            .with_payload(value.clone()));
        if let Some(worker) = &p.worker {
            worker.signal(PeerSignal::Changed { characteristic, value });
        }
    }

    /// Tears down every entry without waiting for the transport. `reason` ends up in the
    /// `Disconnected` events.
    pub fn close_all(&self, reason: Option<&str>) {
        let mut after = Aftermath::default();
        {
            let mut peers = lock(&self.peers);
            peers.by_handle.clear();
            let mut all: Vec<_> = peers.by_address.drain().map(|(_, p)| p).collect();
            all.sort_by(|a, b| a.address.cmp(&b.address));
            for p in all {
                info!("{}: force closing", p.address);
                self.transport.close_connection(p.handle);
                let mut event = StatusEvent::peer(StatusKind::Disconnected, &p.address);
                if let Some(reason) = reason {
                    event = event.with_error_message(reason);
                }
                self.bus.publish(event);
                after.complete_all(p.connect_waiters, &Err(Error::connection_closed()));
                after.complete_all(p.disconnect_waiters, &Ok(Response::Disconnected));
                after.workers.extend(p.worker);
            }
        }
        after.run();
    }
}

/// Returns whether the characteristic notifies or indicates.
fn check_characteristic(services: &[Service], job: &Job) -> Result<bool, Error> {
    let id = match job.characteristic() {
        Some(v) => v,
        None => return Ok(false),
    };
    let c = service::find_characteristic(services, id).ok_or_else(||
        Error::new(ErrorKind::CharacteristicNotFound, format!("characteristic {} not found", id)))?;
    let props = c.properties();
    let notify = props.is_notify() || props.is_indicate();
    let ok = if job.is_write() {
        props.is_writable() && (notify || !job.awaits_reply())
    } else {
        props.is_readable()
    };
    if ok {
        Ok(notify)
    } else {
        Err(Error::new(ErrorKind::CharacteristicNotFound,
            format!("characteristic {} doesn't support the operation", id)))
    }
}
