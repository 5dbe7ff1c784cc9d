//! The seam between the central logic and the radio.
//!
//! A [`Transport`](trait.Transport.html) issues requests and reports their completion
//! asynchronously by sending [`TransportSignal`](enum.TransportSignal.html)s through the
//! [`SignalSink`](struct.SignalSink.html) handed to it on attach. Every request that expects a
//! matching completion carries a [`RequestId`](struct.RequestId.html) which must be echoed back
//! verbatim in the signal.

use static_assertions::assert_impl_all;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc;

use crate::central::peripheral::{DiscoveredDevice, PeerAddress};
use crate::central::scan::ScanStrategy;
use crate::central::service::Service;
use crate::error::{Error, ErrorKind};
use crate::uuid::Uuid;

/// Transport-level identity of an open link. Chosen by the transport.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct ConnectionHandle(pub u64);

impl fmt::Display for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Correlates a transport request with its completion signal.
///
/// Ids are never reused within a process, so a completion that arrives after its command gave up
/// can't be mistaken for the completion of a later command.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct RequestId(u64);

impl RequestId {
    pub(in crate) fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "r{}", self.0)
    }
}

/// What the platform reports about its Bluetooth LE capability.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum AdapterStatus {
    /// No Bluetooth LE support at all.
    Unsupported,

    /// Bluetooth LE is supported but the adapter couldn't be obtained.
    Unavailable,

    /// The adapter is present and switched off.
    Disabled,

    /// The adapter is present and powered on.
    Enabled,
}

#[derive(Debug)]
#[non_exhaustive]
pub enum TransportSignal {
    RadioStateChanged {
        powered_on: bool,
    },

    DeviceDiscovered(DiscoveredDevice),

    /// The link is up. Services aren't known yet.
    Connected {
        handle: ConnectionHandle,
    },

    ServicesDiscovered {
        handle: ConnectionHandle,
        services: Result<Vec<Service>, Error>,
    },

    /// The link went down, either as requested or on its own. `error` is `None` for a requested
    /// teardown.
    Disconnected {
        handle: ConnectionHandle,
        error: Option<Error>,
    },

    CharacteristicRead {
        handle: ConnectionHandle,
        request: RequestId,
        characteristic: Uuid,
        value: Result<Vec<u8>, Error>,
    },

    /// Unsolicited value update (notification or indication).
    CharacteristicChanged {
        handle: ConnectionHandle,
        characteristic: Uuid,
        value: Vec<u8>,
    },

    CharacteristicWritten {
        handle: ConnectionHandle,
        request: RequestId,
        characteristic: Uuid,
        result: Result<(), Error>,
    },

    TransferUnitChanged {
        handle: ConnectionHandle,
        request: RequestId,
        result: Result<u16, Error>,
    },
}

assert_impl_all!(TransportSignal: Send);

impl TransportSignal {
    pub fn handle(&self) -> Option<ConnectionHandle> {
        use TransportSignal::*;
        match self {
            | Connected { handle }
            | ServicesDiscovered { handle, .. }
            | Disconnected { handle, .. }
            | CharacteristicRead { handle, .. }
            | CharacteristicChanged { handle, .. }
            | CharacteristicWritten { handle, .. }
            | TransferUnitChanged { handle, .. }
            => Some(*handle),
            RadioStateChanged { .. } | DeviceDiscovered(_) => None,
        }
    }
}

pub(in crate) enum Dispatch {
    Signal(TransportSignal),

    /// The connect deadline of the attempt with this handle elapsed.
    ConnectTimedOut(ConnectionHandle),

    Shutdown,
}

/// Where a transport delivers its signals.
///
/// Cheap to clone and safe to use from any thread, including from inside a transport call.
#[derive(Clone)]
pub struct SignalSink(mpsc::Sender<Dispatch>);

assert_impl_all!(SignalSink: Send);

impl SignalSink {
    pub(in crate) fn new(sender: mpsc::Sender<Dispatch>) -> Self {
        Self(sender)
    }

    /// Returns `false` once the manager has been closed.
    pub fn send(&self, signal: TransportSignal) -> bool {
        self.0.send(Dispatch::Signal(signal)).is_ok()
    }
}

impl fmt::Debug for SignalSink {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("SignalSink")
    }
}

/// The radio.
///
/// Calls must not block waiting for completions: the result of every request that has one comes
/// back later as a [`TransportSignal`](enum.TransportSignal.html). An `Err` return means the
/// request wasn't issued and no signal will follow.
pub trait Transport: Send + Sync + 'static {
    /// Called once, before any other method.
    fn attach(&mut self, sink: SignalSink);

    fn adapter_status(&self) -> AdapterStatus;

    fn start_discovery(&self, strategy: &ScanStrategy) -> Result<(), Error>;

    fn stop_discovery(&self, strategy: &ScanStrategy);

    /// Starts connecting. Success is reported with `TransportSignal::Connected`, failure with
    /// `TransportSignal::Disconnected`.
    fn open_connection(&self, address: &PeerAddress) -> Result<ConnectionHandle, Error>;

    fn discover_services(&self, handle: ConnectionHandle) -> Result<(), Error>;

    /// Tears the link down or cancels a pending connection attempt. Completion is reported with
    /// `TransportSignal::Disconnected` unless the link is already gone.
    fn close_connection(&self, handle: ConnectionHandle);

    fn read_characteristic(&self, handle: ConnectionHandle, characteristic: Uuid, request: RequestId)
        -> Result<(), Error>;

    fn write_characteristic(&self, handle: ConnectionHandle, characteristic: Uuid, value: &[u8],
        request: RequestId) -> Result<(), Error>;

    /// Turns notifications and indications of a characteristic on or off. While on, value updates
    /// arrive as `TransportSignal::CharacteristicChanged`. Takes effect before the call returns;
    /// no signal follows.
    fn set_notify(&self, handle: ConnectionHandle, characteristic: Uuid, enabled: bool)
        -> Result<(), Error>;

    /// Requests a new transfer unit (ATT MTU). Platforms that can't negotiate keep the default.
    fn negotiate_transfer_unit(&self, _handle: ConnectionHandle, _size: u16, _request: RequestId)
        -> Result<(), Error>
    {
        Err(Error::new(ErrorKind::OperationNotSupported,
            "transfer unit negotiation is not supported"))
    }

    /// Called when the manager closes. No signals are accepted afterwards.
    fn detach(&self) {}
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn request_ids_are_unique() {
        let a = RequestId::next();
        let b = RequestId::next();
        assert_ne!(a, b);
        assert!(b.as_u64() > a.as_u64());
    }

    #[test]
    fn sink_reports_closed_manager() {
        let (tx, rx) = mpsc::channel();
        let sink = SignalSink::new(tx);
        assert!(sink.send(TransportSignal::RadioStateChanged { powered_on: true }));
        drop(rx);
        assert!(!sink.send(TransportSignal::RadioStateChanged { powered_on: false }));
    }

    #[test]
    fn signal_handle() {
        let s = TransportSignal::Connected { handle: ConnectionHandle(7) };
        assert_eq!(s.handle(), Some(ConnectionHandle(7)));
        let s = TransportSignal::RadioStateChanged { powered_on: false };
        assert_eq!(s.handle(), None);
    }
}
