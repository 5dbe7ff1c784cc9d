use log::*;
use static_assertions::assert_impl_all;
use std::fmt;
use std::sync::{Arc, Mutex, Weak};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crate::timer::Deadline;
use crate::transport::Transport;
use crate::util::lock;
use crate::uuid::Uuid;
use super::event::{EventBus, StatusEvent, StatusKind};
use super::peripheral::DiscoveredDevice;

/// Trade-off between discovery latency and power draw.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum ScanMode {
    LowPower,
    Balanced,
    LowLatency,
}

impl Default for ScanMode {
    fn default() -> Self {
        Self::LowLatency
    }
}

pub type DiscoveryCallback = Arc<dyn Fn(&DiscoveredDevice) + Send + Sync>;

/// How to run discovery and where discovered devices go.
///
/// The callback sees every advertisement the transport reports. Deduplicating by address is up to
/// the caller.
#[derive(Clone, Default)]
pub struct ScanStrategy {
    mode: ScanMode,
    services: Vec<Uuid>,
    allow_duplicates: bool,
    on_discovered: Option<DiscoveryCallback>,
}

assert_impl_all!(ScanStrategy: Send, Sync);

impl ScanStrategy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mode(mut self, v: ScanMode) -> Self {
        self.mode = v;
        self
    }

    /// Only report peripherals advertising any of these services.
    pub fn services(mut self, uuids: &[Uuid]) -> Self {
        self.services.extend_from_slice(uuids);
        self
    }

    /// Whether the transport should report the same peripheral more than once.
    pub fn allow_duplicates(mut self, v: bool) -> Self {
        self.allow_duplicates = v;
        self
    }

    pub fn on_discovered<F>(mut self, f: F) -> Self
        where F: Fn(&DiscoveredDevice) + Send + Sync + 'static
    {
        self.on_discovered = Some(Arc::new(f));
        self
    }

    pub fn scan_mode(&self) -> ScanMode {
        self.mode
    }

    pub fn service_filter(&self) -> &[Uuid] {
        &self.services
    }

    pub fn allows_duplicates(&self) -> bool {
        self.allow_duplicates
    }
}

impl fmt::Debug for ScanStrategy {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("ScanStrategy")
            .field("mode", &self.mode)
            .field("services", &self.services)
            .field("allow_duplicates", &self.allow_duplicates)
            .field("on_discovered", &self.on_discovered.is_some())
            .finish()
    }
}

struct Session {
    generation: u64,
    strategy: ScanStrategy,

    /// Discovery was actually started on the transport.
    started: bool,

    _debounce: Option<Deadline>,
    _expiry: Option<Deadline>,
}

struct Shared {
    running: AtomicBool,
    session: Mutex<Option<Session>>,
    generation: Mutex<u64>,
    transport: Arc<dyn Transport>,
    bus: EventBus,
    debounce: Duration,
}

/// Starts and stops discovery.
///
/// `running` flips with compare-and-set while holding the session lock, so concurrent start/stop
/// calls collapse into one transition each way. Both starting discovery and the scan deadline are
/// deferred to timer threads; a timer belonging to an older session is a no-op.
pub(in crate) struct Scanner {
    shared: Arc<Shared>,
}

impl Scanner {
    pub fn new(transport: Arc<dyn Transport>, bus: EventBus, debounce: Duration) -> Self {
        Self {
            shared: Arc::new(Shared {
                running: AtomicBool::new(false),
                session: Mutex::new(None),
                generation: Mutex::new(0),
                transport,
                bus,
                debounce,
            }),
        }
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    /// Returns `false` if a scan was already running. `timeout` of zero never expires.
    pub fn start(&self, strategy: ScanStrategy, timeout: Duration) -> bool {
        let shared = &self.shared;
        let mut session = lock(&shared.session);
        if shared.running.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst).is_err() {
            debug!("scan already running");
            return false;
        }

        let generation = {
            let mut g = lock(&shared.generation);
            *g += 1;
            *g
        };
        info!("scheduling scan #{} with {:?}, timeout {:?}", generation, strategy, timeout);

        let debounce = {
            let weak = Arc::downgrade(shared);
            Deadline::after(shared.debounce, "scan-start", move || {
                if let Some(shared) = weak.upgrade() {
                    shared.begin(generation);
                }
            })
        };
        let expiry = if timeout > Duration::from_secs(0) {
            let weak: Weak<Shared> = Arc::downgrade(shared);
            Some(Deadline::after(shared.debounce + timeout, "scan-timeout", move || {
                if let Some(shared) = weak.upgrade() {
                    debug!("scan #{} timed out", generation);
                    shared.stop(Some(generation));
                }
            }))
        } else {
            None
        };

        *session = Some(Session {
            generation,
            strategy,
            started: false,
            _debounce: Some(debounce),
            _expiry: expiry,
        });
        true
    }

    /// Returns `false` if no scan was running.
    pub fn stop(&self) -> bool {
        self.shared.stop(None)
    }

    /// Hands a discovered device to the running scan's callback.
    pub fn deliver(&self, device: &DiscoveredDevice) {
        let callback = lock(&self.shared.session).as_ref()
            .filter(|s| s.started)
            .and_then(|s| s.strategy.on_discovered.clone());
        match callback {
            Some(f) => f(device),
            None => trace!("dropping discovered device {:?}: no scan running", device.address()),
        }
    }
}

impl Shared {
    fn begin(&self, generation: u64) {
        let mut session = lock(&self.session);
        let s = match session.as_mut() {
            Some(s) if s.generation == generation => s,
            _ => return,
        };
        s._debounce = None;

        self.bus.publish(StatusEvent::new(StatusKind::ScanStarted));
        match self.transport.start_discovery(&s.strategy) {
            Ok(()) => {
                s.started = true;
                info!("scan #{} started", generation);
            }
            Err(e) => {
                warn!("scan #{} failed to start: {}", generation, e);
                *session = None;
                self.running.store(false, Ordering::SeqCst);
                self.bus.publish(StatusEvent::new(StatusKind::ScanFailed).with_error(&e));
            }
        }
    }

    /// With `generation` given, only stops that particular session.
    fn stop(&self, generation: Option<u64>) -> bool {
        let mut session = lock(&self.session);
        if let (Some(g), Some(s)) = (generation, session.as_ref()) {
            if s.generation != g {
                return false;
            }
        }
        if self.running.compare_exchange(true, false, Ordering::SeqCst, Ordering::SeqCst).is_err() {
            return false;
        }
        if let Some(s) = session.take() {
            if s.started {
                self.transport.stop_discovery(&s.strategy);
            }
            info!("scan #{} stopped", s.generation);
        }
        self.bus.publish(StatusEvent::new(StatusKind::ScanStopped));
        true
    }
}
