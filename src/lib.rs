//! Bluetooth low energy central role on top of a pluggable radio
//! [`Transport`](transport/trait.Transport.html).
//!
//! The [`CentralManager`](central/struct.CentralManager.html) tracks the adapter, runs scans,
//! keeps one connection per peer address and executes commands against connected peers. Commands
//! for the same peer run strictly one after another; writes are split into chunks and reads can be
//! reassembled from a response followed by notifications. Everything that happens is reported as a
//! [`StatusEvent`](central/event/struct.StatusEvent.html).
//!
//! ## Example
//!
//! The following example connects to a peer, reads a characteristic and prints the status events.
//!
//! ```no_run
//! use ble_central::central::*;
//! use ble_central::mock::*;
//! use std::time::Duration;
//!
//! let central = CentralManager::new(MockTransport::new()).unwrap();
//! let receiver = central.status();
//! central.initialize().unwrap();
//!
//! let address = PeerAddress::from("AA:BB:CC:DD:EE:FF");
//! central.execute(Command::connect(address.clone())).unwrap();
//! let value = central.execute(ReadCharacteristic::new(address, DEFAULT_CHARACTERISTIC)
//!     .timeout(Duration::from_secs(2))
//!     .into());
//! println!("{:?}", value);
//!
//! let handle_event = |event: StatusEvent| {
//!     println!("{:?} {:?} {:?}", event.kind(), event.address(), event.error_message());
//! };
#![cfg_attr(not(feature = "async"), doc =r#"
while let Ok(event) = receiver.recv() {
    handle_event(event);
}
"#)]
#![cfg_attr(feature = "async", doc =r#"
async_std::task::block_on(async move {
    while let Ok(event) = receiver.recv().await {
        handle_event(event);
    }
})
"#)]
//! ```
//!
//! `demos/simulated_peer.rs` drives a complete session against the in-memory transport.
#![deny(non_snake_case)]
#![deny(unused_must_use)]

pub mod central;
pub mod error;
pub mod mock;
mod sync;
mod timer;
pub mod transport;
pub mod uuid;
mod util;

pub use sync::Receiver;
