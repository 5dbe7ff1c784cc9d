//! Channels handed out to status subscribers.
//!
//! Internal plumbing (signals, worker inboxes, the bus) always runs on `std::sync::mpsc`.
//! Only the subscriber side switches to `async-std` when the `async` feature is enabled.

#[cfg(not(feature = "async"))]
mod imp {
    use std::sync::mpsc;

    pub type Receiver<T> = mpsc::Receiver<T>;

    pub struct Sender<T>(mpsc::Sender<T>);

    impl<T> Sender<T> {
        /// Returns `false` once the receiving side is gone.
        pub fn send(&self, v: T) -> bool {
            self.0.send(v).is_ok()
        }
    }

    pub fn channel<T>() -> (Sender<T>, Receiver<T>) {
        let (sender, receiver) = mpsc::channel();
        (Sender(sender), receiver)
    }
}

#[cfg(feature = "async")]
mod imp {
    use async_std::channel;

    pub type Receiver<T> = channel::Receiver<T>;

    pub struct Sender<T>(channel::Sender<T>);

    impl<T> Sender<T> {
        /// Returns `false` once the receiving side is gone.
        pub fn send(&self, v: T) -> bool {
            self.0.try_send(v).is_ok()
        }
    }

    pub fn channel<T>() -> (Sender<T>, Receiver<T>) {
        let (sender, receiver) = channel::unbounded();
        (Sender(sender), receiver)
    }
}

pub use imp::Receiver;
pub(in crate) use imp::{channel, Sender};
