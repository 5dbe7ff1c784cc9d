mod adapter;
pub mod characteristic;
pub mod command;
pub mod event;
mod frame;
pub mod peripheral;
mod pipeline;
mod registry;
pub mod scan;
pub mod service;

use log::*;
use static_assertions::*;
use std::sync::{Arc, Mutex};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::error::{Error, ErrorKind};
use crate::sync;
use crate::transport::*;
use crate::util::lock;

pub use adapter::{AdapterInput, AdapterState};
pub use command::{Command, Completion, Outcome, ReadCharacteristic, Response, WriteCharacteristic};
pub use event::{StatusEvent, StatusKind};
pub use frame::{chunk_count, split};
pub use peripheral::{DiscoveredDevice, PeerAddress};
pub use registry::ConnectionState;
pub use scan::{ScanMode, ScanStrategy};
pub use service::Service;

use adapter::Adapter;
use event::{EventBus, Filter};
use pipeline::{Job, PeerSignal};
use registry::Registry;
use scan::Scanner;

const RADIO_OFF: &str = "bluetooth is turned off";

#[derive(Clone, Debug)]
pub(in crate) struct Config {
    pub scan_debounce: Duration,
    pub write_chunk_delay: Duration,
    pub connect_timeout: Duration,
    pub command_timeout: Duration,
    pub read_max_frame_size: usize,
    pub write_chunk_size: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            scan_debounce: Duration::from_millis(100),
            write_chunk_delay: Duration::from_millis(30),
            connect_timeout: Duration::from_secs(20),
            command_timeout: Duration::from_secs(5),
            read_max_frame_size: 300,
            write_chunk_size: 20,
        }
    }
}

pub struct CentralManagerBuilder {
    config: Config,
}

impl CentralManagerBuilder {
    pub fn new() -> Self {
        Self {
            config: Config::default(),
        }
    }

    /// Delay between a scan request and discovery actually starting. Defaults to 100 ms.
    pub fn scan_debounce(&mut self, v: Duration) -> &mut Self {
        self.config.scan_debounce = v;
        self
    }

    /// Pause between consecutive chunks of a write. Defaults to 30 ms.
    pub fn write_chunk_delay(&mut self, v: Duration) -> &mut Self {
        self.config.write_chunk_delay = v;
        self
    }

    /// Used by connect requests that don't specify a timeout. Zero disables the deadline.
    /// Defaults to 20 s.
    pub fn connect_timeout(&mut self, v: Duration) -> &mut Self {
        self.config.connect_timeout = v;
        self
    }

    /// Used by pipeline commands that don't specify a timeout. Zero disables the deadline.
    /// Defaults to 5 s.
    pub fn command_timeout(&mut self, v: Duration) -> &mut Self {
        self.config.command_timeout = v;
        self
    }

    /// Reassembly buffer of reads that don't specify one. Defaults to 300 bytes.
    pub fn read_max_frame_size(&mut self, v: usize) -> &mut Self {
        self.config.read_max_frame_size = v;
        self
    }

    /// Chunk size of writes that don't specify one. Defaults to 20 bytes, the payload of the
    /// default transfer unit.
    pub fn write_chunk_size(&mut self, v: usize) -> &mut Self {
        self.config.write_chunk_size = v;
        self
    }

    pub fn build<T: Transport>(&self, transport: T) -> Result<CentralManager, Error> {
        CentralManager::build(self.config.clone(), transport)
    }
}

assert_impl_all!(CentralManagerBuilder: Send, Sync);

struct Core {
    config: Config,
    transport: Arc<dyn Transport>,
    bus: EventBus,
    adapter: Adapter,
    scanner: Scanner,
    registry: Registry,
    dispatch: Mutex<mpsc::Sender<Dispatch>>,
    closed: AtomicBool,
}

impl Core {
    fn dispatch(&self, signal: TransportSignal) {
        trace!("dispatching {:?}", signal);
        match signal {
            TransportSignal::RadioStateChanged { powered_on: false } => self.radio_off(),
            TransportSignal::RadioStateChanged { powered_on: true } => self.radio_on(),
            TransportSignal::DeviceDiscovered(device) => self.scanner.deliver(&device),
            TransportSignal::Connected { handle } => self.registry.on_connected(handle),
            TransportSignal::ServicesDiscovered { handle, services } =>
                self.registry.on_services_discovered(handle, services),
            TransportSignal::Disconnected { handle, error } =>
                self.registry.on_disconnected(handle, error),
            TransportSignal::CharacteristicRead { handle, request, characteristic, value } =>
                self.registry.on_peer_signal(handle,
                    PeerSignal::Read { request, characteristic, value }),
            TransportSignal::CharacteristicChanged { handle, characteristic, value } =>
                self.registry.on_characteristic_changed(handle, characteristic, value),
            TransportSignal::CharacteristicWritten { handle, request, result, .. } =>
                self.registry.on_peer_signal(handle, PeerSignal::Written { request, result }),
            TransportSignal::TransferUnitChanged { handle, request, result } =>
                self.registry.on_peer_signal(handle, PeerSignal::TransferUnit { request, result }),
        }
    }

    fn radio_off(&self) {
        if !self.adapter.radio_off() {
            debug!("radio off before initialization");
            return;
        }
        warn!("{}", RADIO_OFF);
        self.registry.close_all(Some(RADIO_OFF));
        self.scanner.stop();
        self.bus.publish(StatusEvent::new(StatusKind::AdapterOff));
    }

    fn radio_on(&self) {
        info!("radio on");
        self.bus.publish(StatusEvent::new(StatusKind::AdapterOn));
        if let AdapterState::Unavailable(_) = self.adapter.state() {
            let _ = self.initialize();
        }
    }

    fn initialize(&self) -> Result<(), Error> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::new(ErrorKind::NotReady, "manager is closed"));
        }
        self.adapter.initialize(&*self.transport, &self.bus)
    }

    fn submit(&self, command: Command, completion: Completion) {
        if let Command::Connect { address, .. } = &command {
            if address.is_empty() {
                self.bus.publish(StatusEvent::peer(StatusKind::Disconnected, address)
                    .with_error_message("empty address"));
            }
        }
        let routed = self.adapter.require_ready()
            .and_then(|_| command.route(&self.config));
        let routed = match routed {
            Ok(v) => v,
            Err(e) => {
                debug!("rejecting command: {}", e);
                completion(Err(e));
                return;
            }
        };
        match routed {
            command::Routed::Connect { address, timeout } =>
                self.registry.connect(address, timeout, completion),
            command::Routed::Disconnect { address } =>
                self.registry.disconnect(&address, completion),
            command::Routed::Pipeline { address, operation, timeout, description } =>
                self.registry.submit(&address,
                    Job::new(operation, timeout, description, completion)),
        }
    }
}

struct Inner {
    core: Arc<Core>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
    bus_thread: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.close();
    }
}

impl Inner {
    fn close(&self) {
        let core = &self.core;
        if core.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("closing central manager");
        core.scanner.stop();
        core.registry.close_all(None);
        core.transport.detach();

        let _ = lock(&core.dispatch).send(Dispatch::Shutdown);
        if let Some(thread) = lock(&self.dispatcher).take() {
            if thread::current().id() != thread.thread().id() {
                let _ = thread.join();
            }
        }

        core.bus.shutdown();
        if let Some(thread) = lock(&self.bus_thread).take() {
            let _ = thread.join();
        }
        core.adapter.reset();
    }
}

/// Entry point to the central role.
///
/// Owns the transport and every thread the central role runs on. Cloning is cheap and all clones
/// refer to the same manager. The manager closes when the last clone is dropped.
#[derive(Clone)]
pub struct CentralManager(Arc<Inner>);

assert_impl_all!(CentralManager: Send, Sync);

impl CentralManager {
    pub fn new<T: Transport>(transport: T) -> Result<Self, Error> {
        Self::builder().build(transport)
    }

    pub fn builder() -> CentralManagerBuilder {
        CentralManagerBuilder::new()
    }

    fn build<T: Transport>(config: Config, mut transport: T) -> Result<Self, Error> {
        let (dispatch, dispatched) = mpsc::channel();
        transport.attach(SignalSink::new(dispatch.clone()));
        let transport: Arc<dyn Transport> = Arc::new(transport);

        let (bus, bus_thread) = EventBus::start()?;
        let core = Arc::new(Core {
            adapter: Adapter::new(),
            scanner: Scanner::new(transport.clone(), bus.clone(), config.scan_debounce),
            registry: Registry::new(transport.clone(), bus.clone(), dispatch.clone(),
                config.write_chunk_delay),
            config,
            transport,
            bus,
            dispatch: Mutex::new(dispatch),
            closed: AtomicBool::new(false),
        });

        let dispatcher = {
            let core = core.clone();
            thread::Builder::new()
                .name("ble-dispatch".into())
                .spawn(move || {
                    while let Ok(msg) = dispatched.recv() {
                        match msg {
                            Dispatch::Signal(signal) => core.dispatch(signal),
                            Dispatch::ConnectTimedOut(handle) => core.registry.connect_timed_out(handle),
                            Dispatch::Shutdown => break,
                        }
                    }
                    debug!("dispatcher stopped");
                })
        };
        let dispatcher = match dispatcher {
            Ok(v) => v,
            Err(e) => {
                core.bus.shutdown();
                return Err(e.into());
            }
        };

        Ok(Self(Arc::new(Inner {
            core,
            dispatcher: Mutex::new(Some(dispatcher)),
            bus_thread: Mutex::new(Some(bus_thread)),
        })))
    }

    fn core(&self) -> &Core {
        &self.0.core
    }

    /// Initializes the adapter, publishing `InitStarted` followed by `InitSucceeded` or `InitFailed`.
    /// Does nothing if the adapter is ready already.
    pub fn initialize(&self) -> Result<(), Error> {
        self.core().initialize()
    }

    pub fn adapter_state(&self) -> AdapterState {
        self.core().adapter.state()
    }

    /// Starts discovery after a short debounce and stops it after `timeout` (zero for no limit).
    /// Does nothing if a scan is running already.
    pub fn start_scan(&self, strategy: ScanStrategy, timeout: Duration) -> Result<(), Error> {
        self.core().adapter.require_ready()?;
        self.core().scanner.start(strategy, timeout);
        Ok(())
    }

    pub fn stop_scan(&self) {
        self.core().scanner.stop();
    }

    pub fn is_scanning(&self) -> bool {
        self.core().scanner.is_running()
    }

    /// Connects to `address`, with `timeout` of zero waiting indefinitely. The outcome is only
    /// reported through status events; use [`submit`](#method.submit) with
    /// `Command::Connect` to get it directly.
    pub fn connect(&self, address: impl Into<PeerAddress>, timeout: Duration) {
        let command = Command::Connect {
            address: address.into(),
            timeout: Some(timeout),
        };
        self.submit(command, |_| {});
    }

    /// Disconnects from `address`. The outcome is only reported through status events.
    pub fn disconnect(&self, address: impl Into<PeerAddress>) {
        self.submit(Command::disconnect(address), |_| {});
    }

    /// Runs `command`, calling `on_complete` exactly once with its outcome.
    ///
    /// Malformed commands, commands for peers that aren't connected and commands naming a missing
    /// characteristic are rejected before this returns. Otherwise `on_complete` runs on an
    /// internal thread and must not block on another command for the same peer.
    pub fn submit<F>(&self, command: Command, on_complete: F)
        where F: FnOnce(Outcome) + Send + 'static
    {
        self.core().submit(command, Box::new(on_complete));
    }

    /// Runs `command` and waits for its outcome. Must not be called from a completion.
    pub fn execute(&self, command: Command) -> Outcome {
        let (tx, rx) = mpsc::channel();
        self.submit(command, move |outcome| {
            let _ = tx.send(outcome);
        });
        rx.recv().unwrap_or_else(|_| Err(Error::connection_closed()))
    }

    pub fn connection_state(&self, address: &PeerAddress) -> ConnectionState {
        self.core().registry.state(address)
    }

    /// Services of a connected peer.
    pub fn services(&self, address: &PeerAddress) -> Option<Vec<Service>> {
        self.core().registry.services(address)
    }

    /// Addresses of connected peers, sorted.
    pub fn connected_peers(&self) -> Vec<PeerAddress> {
        self.core().registry.connected()
    }

    /// Drops every connection without waiting for the peers. In-flight and queued commands fail
    /// with `ConnectionClosed`.
    pub fn disconnect_all(&self) {
        self.core().registry.close_all(None);
    }

    /// Stops scanning, drops every connection and stops all threads. Further commands fail with
    /// `NotReady`. Idempotent.
    pub fn close(&self) {
        self.0.close();
    }

    /// Every status event, characteristic notifications included.
    pub fn events(&self) -> sync::Receiver<StatusEvent> {
        self.core().bus.subscribe(Filter::All)
    }

    /// Adapter, scan and connection events. Starts with the latest event of each of those that
    /// was published before subscribing.
    pub fn status(&self) -> sync::Receiver<StatusEvent> {
        self.core().bus.subscribe(Filter::Status)
    }
}
