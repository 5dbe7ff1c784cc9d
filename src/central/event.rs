use log::*;
use static_assertions::assert_impl_all;
use std::sync::mpsc;
use std::thread;

use crate::error::Error;
use crate::sync;
use super::peripheral::PeerAddress;

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum StatusKind {
    /// The radio was switched on.
    AdapterOn,

    /// The radio was switched off. Every connection has been closed.
    AdapterOff,

    InitStarted,
    InitSucceeded,

    /// Initialization failed, the reason is in the error message.
    InitFailed,

    ScanStarted,
    ScanStopped,

    /// Discovery couldn't be started, the reason is in the error message.
    ScanFailed,

    Connecting,
    Connected,

    /// The peer is gone or the connection attempt failed. The reason, if any, is in the error
    /// message.
    Disconnected,

    /// A peer notified a new characteristic value. The value is in the payload.
    CharacteristicChanged,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Category {
    Adapter,
    Scan,
    Connection,
    Data,
}

impl StatusKind {
    fn category(self) -> Category {
        use StatusKind::*;
        match self {
            AdapterOn | AdapterOff | InitStarted | InitSucceeded | InitFailed => Category::Adapter,
            ScanStarted | ScanStopped | ScanFailed => Category::Scan,
            Connecting | Connected | Disconnected => Category::Connection,
            CharacteristicChanged => Category::Data,
        }
    }

    /// Whether the kind belongs to the long-lived adapter, scan and connection state that
    /// [`CentralManager::status`](../struct.CentralManager.html#method.status) carries.
    pub fn is_broadcast(self) -> bool {
        self.category() != Category::Data
    }
}

/// Immutable record of a state change.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct StatusEvent {
    kind: StatusKind,
    address: Option<PeerAddress>,
    payload: Option<Vec<u8>>,
    error_message: Option<String>,
}

assert_impl_all!(StatusEvent: Send, Sync);

impl StatusEvent {
    pub fn new(kind: StatusKind) -> Self {
        Self {
            kind,
            address: None,
            payload: None,
            error_message: None,
        }
    }

    pub(in crate) fn peer(kind: StatusKind, address: &PeerAddress) -> Self {
        Self::new(kind).with_address(address.clone())
    }

    pub fn with_address(mut self, v: PeerAddress) -> Self {
        self.address = Some(v);
        self
    }

    pub fn with_payload(mut self, v: Vec<u8>) -> Self {
        self.payload = Some(v);
        self
    }

    pub fn with_error_message(mut self, v: impl Into<String>) -> Self {
        self.error_message = Some(v.into());
        self
    }

    pub(in crate) fn with_error(self, v: &Error) -> Self {
        self.with_error_message(v.description())
    }

    pub fn kind(&self) -> StatusKind {
        self.kind
    }

    pub fn address(&self) -> Option<&PeerAddress> {
        self.address.as_ref()
    }

    pub fn payload(&self) -> Option<&[u8]> {
        self.payload.as_ref().map(|v| v.as_slice())
    }

    pub fn error_message(&self) -> Option<&str> {
        self.error_message.as_ref().map(|v| v.as_str())
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(in crate) enum Filter {
    /// Every event.
    All,

    /// Broadcast kinds only, preceded by the retained latest state.
    Status,
}

enum BusMessage {
    Publish(StatusEvent),
    Subscribe(Filter, sync::Sender<StatusEvent>),
    Shutdown,
}

/// Single ordered stream of status events fanned out to subscribers.
///
/// Publishing and subscribing go through the same channel into the bus thread, so every subscriber
/// observes events in publish order. Subscribers whose receiver is gone are dropped on the next
/// delivery.
#[derive(Clone)]
pub(in crate) struct EventBus {
    sender: mpsc::Sender<BusMessage>,
}

impl EventBus {
    pub fn start() -> Result<(Self, thread::JoinHandle<()>), Error> {
        let (sender, receiver) = mpsc::channel();
        let thread = thread::Builder::new()
            .name("ble-bus".into())
            .spawn(move || Bus::default().run(receiver))?;
        Ok((Self { sender }, thread))
    }

    /// Silently dropped once the bus has shut down.
    pub fn publish(&self, event: StatusEvent) {
        trace!("publishing {:?}", event);
        let _ = self.sender.send(BusMessage::Publish(event));
    }

    /// The receiver disconnects immediately if the bus has shut down.
    pub fn subscribe(&self, filter: Filter) -> sync::Receiver<StatusEvent> {
        let (sender, receiver) = sync::channel();
        let _ = self.sender.send(BusMessage::Subscribe(filter, sender));
        receiver
    }

    /// Events published before this call are still delivered.
    pub fn shutdown(&self) {
        let _ = self.sender.send(BusMessage::Shutdown);
    }
}

#[derive(Default)]
struct Bus {
    subscribers: Vec<(Filter, sync::Sender<StatusEvent>)>,
    adapter: Option<StatusEvent>,
    scan: Option<StatusEvent>,
    connection: Option<StatusEvent>,
}

impl Bus {
    fn run(mut self, receiver: mpsc::Receiver<BusMessage>) {
        while let Ok(msg) = receiver.recv() {
            match msg {
                BusMessage::Publish(event) => self.publish(event),
                BusMessage::Subscribe(filter, sender) => self.subscribe(filter, sender),
                BusMessage::Shutdown => break,
            }
        }
        debug!("event bus stopped");
    }

    fn publish(&mut self, event: StatusEvent) {
        let retained = match event.kind.category() {
            Category::Adapter => Some(&mut self.adapter),
            Category::Scan => Some(&mut self.scan),
            Category::Connection => Some(&mut self.connection),
            Category::Data => None,
        };
        if let Some(retained) = retained {
            *retained = Some(event.clone());
        }

        let broadcast = event.kind.is_broadcast();
        self.subscribers.retain(|(filter, sender)| {
            if *filter == Filter::Status && !broadcast {
                return true;
            }
            sender.send(event.clone())
        });
    }

    fn subscribe(&mut self, filter: Filter, sender: sync::Sender<StatusEvent>) {
        if filter == Filter::Status {
            let retained = [&self.adapter, &self.scan, &self.connection];
            for event in retained.iter().filter_map(|e| e.as_ref()) {
                if !sender.send(event.clone()) {
                    return;
                }
            }
        }
        self.subscribers.push((filter, sender));
    }
}

#[cfg(all(test, not(feature = "async")))]
mod test {
    use super::*;
    use std::time::Duration;

    const WAIT: Duration = Duration::from_secs(2);

    fn recv_all(r: &sync::Receiver<StatusEvent>) -> Vec<StatusKind> {
        let mut r_ = Vec::new();
        while let Ok(e) = r.recv_timeout(Duration::from_millis(100)) {
            r_.push(e.kind());
        }
        r_
    }

    #[test]
    fn status_skips_characteristic_data() {
        let (bus, thread) = EventBus::start().unwrap();
        let all = bus.subscribe(Filter::All);
        let status = bus.subscribe(Filter::Status);
        bus.publish(StatusEvent::new(StatusKind::InitSucceeded));
        bus.publish(StatusEvent::peer(StatusKind::CharacteristicChanged, &"A".into())
            .with_payload(vec![1, 2]));
        bus.publish(StatusEvent::peer(StatusKind::Connected, &"A".into()));
        bus.shutdown();
        thread.join().unwrap();

        assert_eq!(recv_all(&all), vec![StatusKind::InitSucceeded,
            StatusKind::CharacteristicChanged, StatusKind::Connected]);
        assert_eq!(recv_all(&status), vec![StatusKind::InitSucceeded, StatusKind::Connected]);
    }

    #[test]
    fn late_subscriber_gets_latest_state() {
        let (bus, thread) = EventBus::start().unwrap();
        bus.publish(StatusEvent::new(StatusKind::InitStarted));
        bus.publish(StatusEvent::new(StatusKind::InitSucceeded));
        bus.publish(StatusEvent::new(StatusKind::ScanStarted));
        bus.publish(StatusEvent::new(StatusKind::ScanStopped));
        bus.publish(StatusEvent::peer(StatusKind::Connecting, &"A".into()));
        bus.publish(StatusEvent::peer(StatusKind::CharacteristicChanged, &"A".into()));

        let status = bus.subscribe(Filter::Status);
        let first = status.recv_timeout(WAIT).unwrap();
        assert_eq!(first.kind(), StatusKind::InitSucceeded);
        assert_eq!(status.recv_timeout(WAIT).unwrap().kind(), StatusKind::ScanStopped);
        let conn = status.recv_timeout(WAIT).unwrap();
        assert_eq!(conn.kind(), StatusKind::Connecting);
        assert_eq!(conn.address().map(|a| a.as_str()), Some("A"));

        bus.shutdown();
        thread.join().unwrap();
        assert!(recv_all(&status).is_empty());
    }

    #[test]
    fn dropped_subscribers_are_pruned() {
        let (bus, thread) = EventBus::start().unwrap();
        let gone = bus.subscribe(Filter::All);
        let kept = bus.subscribe(Filter::All);
        drop(gone);
        bus.publish(StatusEvent::new(StatusKind::AdapterOn));
        bus.publish(StatusEvent::new(StatusKind::AdapterOff));
        assert_eq!(kept.recv_timeout(WAIT).unwrap().kind(), StatusKind::AdapterOn);
        assert_eq!(kept.recv_timeout(WAIT).unwrap().kind(), StatusKind::AdapterOff);
        bus.shutdown();
        thread.join().unwrap();
    }

    #[test]
    fn subscribe_after_shutdown_disconnects() {
        let (bus, thread) = EventBus::start().unwrap();
        bus.shutdown();
        thread.join().unwrap();
        let r = bus.subscribe(Filter::All);
        assert!(r.recv_timeout(WAIT).is_err());
    }
}
