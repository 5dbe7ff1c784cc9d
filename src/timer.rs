use log::*;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread;
use std::time::Duration;

/// A one-shot timer that runs a callback on its own thread once the delay elapses.
///
/// Dropping the `Deadline` cancels it: the sleeping thread wakes up immediately and exits without
/// running the callback.
#[derive(Debug)]
pub(in crate) struct Deadline {
    _cancel: mpsc::Sender<()>,
}

impl Deadline {
    pub fn after<F>(delay: Duration, name: &str, f: F) -> Self
        where F: FnOnce() + Send + 'static
    {
        let (cancel, cancelled) = mpsc::channel::<()>();
        let spawned = thread::Builder::new()
            .name(format!("ble-{}", name))
            .spawn(move || {
                if let Err(RecvTimeoutError::Timeout) = cancelled.recv_timeout(delay) {
                    f();
                }
            });
        if let Err(e) = spawned {
            error!("couldn't spawn {} timer thread: {}", name, e);
        }
        Self {
            _cancel: cancel,
        }
    }

    pub fn cancel(self) {}
}
