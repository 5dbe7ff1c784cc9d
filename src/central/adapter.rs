use log::*;
use std::sync::Mutex;

use crate::error::{Error, ErrorKind};
use crate::transport::{AdapterStatus, Transport};
use crate::util::lock;
use super::event::{EventBus, StatusEvent, StatusKind};

const NOT_SUPPORTED: &str = "bluetooth low energy is not supported";
const NO_ADAPTER: &str = "failed to get bluetooth adapter";
const NOT_ENABLED: &str = "bluetooth is not enabled";
const TURNED_OFF: &str = "bluetooth is turned off";

/// Lifecycle of the local adapter.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub enum AdapterState {
    Uninitialized,
    Initializing,
    Ready,

    /// The adapter can't be used, for the given reason. Left by initializing again.
    Unavailable(String),
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum AdapterInput {
    InitRequested,
    StatusReported(AdapterStatus),
    RadioOff,
    RadioOn,
}

impl AdapterState {
    /// Transition function. Inputs that make no sense in the current state leave it unchanged.
    pub fn next(self, input: AdapterInput) -> Self {
        use AdapterInput::*;
        use AdapterState::*;
        match (self, input) {
            (Ready, InitRequested) => Ready,
            (_, InitRequested) => Initializing,

            (Initializing, StatusReported(AdapterStatus::Enabled)) => Ready,
            (Initializing, StatusReported(AdapterStatus::Disabled)) => Unavailable(NOT_ENABLED.into()),
            (Initializing, StatusReported(AdapterStatus::Unavailable)) => Unavailable(NO_ADAPTER.into()),
            (Initializing, StatusReported(AdapterStatus::Unsupported)) => Unavailable(NOT_SUPPORTED.into()),
            (s, StatusReported(_)) => s,

            (Uninitialized, RadioOff) => Uninitialized,
            (_, RadioOff) => Unavailable(TURNED_OFF.into()),

            // Coming back is an explicit initialization.
            (s, RadioOn) => s,
        }
    }

    pub fn is_ready(&self) -> bool {
        *self == AdapterState::Ready
    }
}

fn init_error(status: AdapterStatus, reason: &str) -> Error {
    let kind = match status {
        AdapterStatus::Unsupported => ErrorKind::Unsupported,
        AdapterStatus::Unavailable => ErrorKind::AdapterUnavailable,
        AdapterStatus::Disabled => ErrorKind::AdapterDisabled,
        AdapterStatus::Enabled => ErrorKind::NotReady,
    };
    Error::new(kind, reason)
}

pub(in crate) struct Adapter {
    state: Mutex<AdapterState>,
}

impl Adapter {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(AdapterState::Uninitialized),
        }
    }

    pub fn state(&self) -> AdapterState {
        lock(&self.state).clone()
    }

    fn apply(&self, input: AdapterInput) -> AdapterState {
        let mut state = lock(&self.state);
        let next = state.clone().next(input);
        if *state != next {
            debug!("adapter: {:?} -> {:?}", *state, next);
        }
        *state = next.clone();
        next
    }

    /// Initializes the adapter. Does nothing if it's ready or initializing already.
    pub fn initialize(&self, transport: &dyn Transport, bus: &EventBus) -> Result<(), Error> {
        {
            let mut state = lock(&self.state);
            match *state {
                AdapterState::Ready | AdapterState::Initializing => return Ok(()),
                _ => {}
            }
            *state = state.clone().next(AdapterInput::InitRequested);
        }
        bus.publish(StatusEvent::new(StatusKind::InitStarted));

        let status = transport.adapter_status();
        match self.apply(AdapterInput::StatusReported(status)) {
            AdapterState::Ready => {
                info!("adapter ready");
                bus.publish(StatusEvent::new(StatusKind::InitSucceeded));
                Ok(())
            }
            AdapterState::Unavailable(reason) => {
                warn!("adapter init failed: {}", reason);
                bus.publish(StatusEvent::new(StatusKind::InitFailed).with_error_message(&reason[..]));
                Err(init_error(status, &reason))
            }
            s => Err(Error::new(ErrorKind::NotReady, format!("adapter is {:?}", s))),
        }
    }

    /// Returns `false` if the adapter was never initialized.
    pub fn radio_off(&self) -> bool {
        self.apply(AdapterInput::RadioOff) != AdapterState::Uninitialized
    }

    pub fn require_ready(&self) -> Result<(), Error> {
        match &*lock(&self.state) {
            AdapterState::Ready => Ok(()),
            AdapterState::Unavailable(reason) => Err(Error::new(ErrorKind::NotReady,
                format!("adapter is unavailable: {}", reason))),
            s => Err(Error::new(ErrorKind::NotReady, format!("adapter is {:?}", s))),
        }
    }

    pub fn reset(&self) {
        *lock(&self.state) = AdapterState::Uninitialized;
    }
}
