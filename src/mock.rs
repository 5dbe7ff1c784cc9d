//! In-memory [`Transport`](../transport/trait.Transport.html) for tests and demos.
//!
//! A responsive mock answers every request the way a well-behaved peripheral would: connections
//! come up, services are reported, reads return the configured value and writes are acknowledged.
//! Notifications are only sent for characteristics they were enabled for.
//! A scripted mock only records calls; the test feeds signals through
//! [`signal`](struct.MockTransport.html#method.signal) itself.

use static_assertions::assert_impl_all;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::central::characteristic::{Characteristic, Properties};
use crate::central::peripheral::{DiscoveredDevice, PeerAddress};
use crate::central::scan::ScanStrategy;
use crate::central::service::Service;
use crate::error::{Error, ErrorKind};
use crate::transport::*;
use crate::util::lock;
use crate::uuid::Uuid;

/// Service the responsive mock exposes unless told otherwise.
pub const DEFAULT_SERVICE: Uuid = Uuid::from_u16(0xffe0);

/// Readable, writable and notifying characteristic of [`DEFAULT_SERVICE`](constant.DEFAULT_SERVICE.html).
pub const DEFAULT_CHARACTERISTIC: Uuid = Uuid::from_u16(0xffe1);

/// A request the mock received.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Call {
    AdapterStatus,
    StartDiscovery,
    StopDiscovery,
    OpenConnection {
        address: PeerAddress,
        handle: ConnectionHandle,
    },
    DiscoverServices {
        handle: ConnectionHandle,
    },
    CloseConnection {
        handle: ConnectionHandle,
    },
    Read {
        handle: ConnectionHandle,
        characteristic: Uuid,
        request: RequestId,
    },
    Write {
        handle: ConnectionHandle,
        characteristic: Uuid,
        value: Vec<u8>,
        request: RequestId,
    },
    NegotiateTransferUnit {
        handle: ConnectionHandle,
        size: u16,
        request: RequestId,
    },
    SetNotify {
        handle: ConnectionHandle,
        characteristic: Uuid,
        enabled: bool,
    },
    Detach,
}

struct State {
    sink: Option<SignalSink>,
    calls: Vec<Call>,
    next_handle: u64,
    responsive: bool,
    adapter_status: AdapterStatus,
    services: Vec<Service>,
    reads: HashMap<Uuid, Vec<Vec<u8>>>,
    write_replies: HashMap<Uuid, Vec<Vec<u8>>>,
    notifying: HashSet<(ConnectionHandle, Uuid)>,
    notifications: bool,
    transfer_unit: bool,
    discovery_error: Option<Error>,
    silent_peers: HashSet<PeerAddress>,
    open: HashSet<ConnectionHandle>,
}

#[derive(Clone)]
pub struct MockTransport {
    shared: Arc<(Mutex<State>, Condvar)>,
}

assert_impl_all!(MockTransport: Send, Sync);

impl MockTransport {
    /// Answers every request.
    pub fn new() -> Self {
        Self::with_mode(true)
    }

    /// Records requests and answers none of them.
    pub fn scripted() -> Self {
        Self::with_mode(false)
    }

    fn with_mode(responsive: bool) -> Self {
        let props = Properties::from_bits_truncate(0x02 | 0x04 | 0x08 | 0x10);
        Self {
            shared: Arc::new((Mutex::new(State {
                sink: None,
                calls: Vec::new(),
                next_handle: 1,
                responsive,
                adapter_status: AdapterStatus::Enabled,
                services: vec![Service::new(DEFAULT_SERVICE, true,
                    vec![Characteristic::new(DEFAULT_CHARACTERISTIC, props)])],
                reads: HashMap::new(),
                write_replies: HashMap::new(),
                notifying: HashSet::new(),
                notifications: true,
                transfer_unit: true,
                discovery_error: None,
                silent_peers: HashSet::new(),
                open: HashSet::new(),
            }), Condvar::new())),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<State> {
        lock(&self.shared.0)
    }

    pub fn with_adapter_status(self, v: AdapterStatus) -> Self {
        self.state().adapter_status = v;
        self
    }

    pub fn with_services(self, v: Vec<Service>) -> Self {
        self.state().services = v;
        self
    }

    /// The read response followed by notifications, one per extra packet.
    pub fn with_read_response(self, characteristic: Uuid, packets: Vec<Vec<u8>>) -> Self {
        self.state().reads.insert(characteristic, packets);
        self
    }

    /// Notifications sent once, right after the next write to `characteristic`.
    pub fn with_write_response(self, characteristic: Uuid, packets: Vec<Vec<u8>>) -> Self {
        self.state().write_replies.insert(characteristic, packets);
        self
    }

    /// Enabling notifications fails.
    pub fn without_notifications(self) -> Self {
        self.state().notifications = false;
        self
    }

    pub fn without_transfer_unit(self) -> Self {
        self.state().transfer_unit = false;
        self
    }

    pub fn with_discovery_error(self, v: Error) -> Self {
        self.state().discovery_error = Some(v);
        self
    }

    /// Connection attempts to `address` never complete, even when responsive.
    pub fn with_silent_peer(self, address: impl Into<PeerAddress>) -> Self {
        self.state().silent_peers.insert(address.into());
        self
    }

    /// Delivers `signal` as if the radio sent it. Returns `false` when not attached.
    pub fn signal(&self, signal: TransportSignal) -> bool {
        let sink = self.state().sink.clone();
        sink.map(|s| s.send(signal)).unwrap_or(false)
    }

    /// Flips the radio and reports it.
    pub fn power(&self, on: bool) {
        self.state().adapter_status = if on { AdapterStatus::Enabled } else { AdapterStatus::Disabled };
        self.signal(TransportSignal::RadioStateChanged { powered_on: on });
    }

    pub fn advertise(&self, device: DiscoveredDevice) {
        self.signal(TransportSignal::DeviceDiscovered(device));
    }

    pub fn calls(&self) -> Vec<Call> {
        self.state().calls.clone()
    }

    /// Waits until at least `count` recorded calls satisfy `pred` and returns those calls. On
    /// timeout returns every call recorded so far as the error.
    pub fn wait_for_calls<F>(&self, pred: F, count: usize, timeout: Duration)
        -> Result<Vec<Call>, Vec<Call>>
        where F: Fn(&Call) -> bool
    {
        let deadline = Instant::now() + timeout;
        let mut state = self.state();
        loop {
            let matching: Vec<_> = state.calls.iter().filter(|c| pred(c)).cloned().collect();
            if matching.len() >= count {
                return Ok(matching);
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(state.calls.clone());
            }
            state = self.shared.1.wait_timeout(state, deadline - now)
                .unwrap_or_else(|e| e.into_inner()).0;
        }
    }

    /// Records `call` and sends whatever `respond` yields once the lock is released.
    fn record<F>(&self, call: Call, respond: F)
        where F: FnOnce(&mut State) -> Vec<TransportSignal>
    {
        let (sink, signals) = {
            let mut state = self.state();
            state.calls.push(call);
            self.shared.1.notify_all();
            let signals = if state.responsive {
                respond(&mut *state)
            } else {
                Vec::new()
            };
            (state.sink.clone(), signals)
        };
        if let Some(sink) = sink {
            for s in signals {
                sink.send(s);
            }
        }
    }
}

impl Transport for MockTransport {
    fn attach(&mut self, sink: SignalSink) {
        self.state().sink = Some(sink);
    }

    fn adapter_status(&self) -> AdapterStatus {
        let status = self.state().adapter_status;
        self.record(Call::AdapterStatus, |_| Vec::new());
        status
    }

    fn start_discovery(&self, _strategy: &ScanStrategy) -> Result<(), Error> {
        let err = self.state().discovery_error.clone();
        self.record(Call::StartDiscovery, |_| Vec::new());
        match err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn stop_discovery(&self, _strategy: &ScanStrategy) {
        self.record(Call::StopDiscovery, |_| Vec::new());
    }

    fn open_connection(&self, address: &PeerAddress) -> Result<ConnectionHandle, Error> {
        let handle = {
            let mut state = self.state();
            let handle = ConnectionHandle(state.next_handle);
            state.next_handle += 1;
            handle
        };
        let address = address.clone();
        self.record(Call::OpenConnection { address: address.clone(), handle }, move |state| {
            if state.silent_peers.contains(&address) {
                return Vec::new();
            }
            state.open.insert(handle);
            vec![TransportSignal::Connected { handle }]
        });
        Ok(handle)
    }

    fn discover_services(&self, handle: ConnectionHandle) -> Result<(), Error> {
        self.record(Call::DiscoverServices { handle }, |state| {
            vec![TransportSignal::ServicesDiscovered {
                handle,
                services: Ok(state.services.clone()),
            }]
        });
        Ok(())
    }

    fn close_connection(&self, handle: ConnectionHandle) {
        self.record(Call::CloseConnection { handle }, |state| {
            if state.open.remove(&handle) {
                vec![TransportSignal::Disconnected { handle, error: None }]
            } else {
                Vec::new()
            }
        });
    }

    fn read_characteristic(&self, handle: ConnectionHandle, characteristic: Uuid, request: RequestId)
        -> Result<(), Error>
    {
        self.record(Call::Read { handle, characteristic, request }, |state| {
            let packets = match state.reads.get(&characteristic) {
                Some(v) if !v.is_empty() => v.clone(),
                _ => return vec![TransportSignal::CharacteristicRead {
                    handle,
                    request,
                    characteristic,
                    value: Err(Error::new(ErrorKind::Transport, "no value")),
                }],
            };
            let mut packets = packets.into_iter();
            let mut signals = Vec::new();
            if let Some(first) = packets.next() {
                signals.push(TransportSignal::CharacteristicRead {
                    handle,
                    request,
                    characteristic,
                    value: Ok(first),
                });
            }
            if state.notifying.contains(&(handle, characteristic)) {
                signals.extend(packets.map(|value| TransportSignal::CharacteristicChanged {
                    handle,
                    characteristic,
                    value,
                }));
            }
            signals
        });
        Ok(())
    }

    fn write_characteristic(&self, handle: ConnectionHandle, characteristic: Uuid, value: &[u8],
        request: RequestId) -> Result<(), Error>
    {
        let call = Call::Write { handle, characteristic, value: value.to_vec(), request };
        self.record(call, |state| {
            let mut signals = vec![TransportSignal::CharacteristicWritten {
                handle,
                request,
                characteristic,
                result: Ok(()),
            }];
            if state.notifying.contains(&(handle, characteristic)) {
                let reply = state.write_replies.remove(&characteristic).unwrap_or_default();
                signals.extend(reply.into_iter().map(|value| TransportSignal::CharacteristicChanged {
                    handle,
                    characteristic,
                    value,
                }));
            }
            signals
        });
        Ok(())
    }

    fn set_notify(&self, handle: ConnectionHandle, characteristic: Uuid, enabled: bool)
        -> Result<(), Error>
    {
        let supported = {
            let mut state = self.state();
            if state.notifications {
                if enabled {
                    state.notifying.insert((handle, characteristic));
                } else {
                    state.notifying.remove(&(handle, characteristic));
                }
            }
            state.notifications
        };
        self.record(Call::SetNotify { handle, characteristic, enabled }, |_| Vec::new());
        if supported {
            Ok(())
        } else {
            Err(Error::new(ErrorKind::OperationNotSupported, "notifications are not supported"))
        }
    }

    fn negotiate_transfer_unit(&self, handle: ConnectionHandle, size: u16, request: RequestId)
        -> Result<(), Error>
    {
        if !self.state().transfer_unit {
            return Err(Error::new(ErrorKind::OperationNotSupported,
                "transfer unit negotiation is not supported"));
        }
        self.record(Call::NegotiateTransferUnit { handle, size, request }, |_| {
            vec![TransportSignal::TransferUnitChanged {
                handle,
                request,
                result: Ok(size),
            }]
        });
        Ok(())
    }

    fn detach(&self) {
        self.record(Call::Detach, |_| Vec::new());
        self.state().sink = None;
    }
}
