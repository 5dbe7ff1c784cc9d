use static_assertions::assert_impl_all;
use std::fmt;

use crate::uuid::Uuid;

/// Address of a remote peripheral.
///
/// Whatever the platform uses to name a peer: a `AA:BB:CC:DD:EE:FF` MAC string on most stacks,
/// an opaque UUID on others. Compared verbatim. An empty address is representable so it can be
/// rejected with a proper status event rather than at construction.
#[derive(Clone, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct PeerAddress(String);

assert_impl_all!(PeerAddress: Send, Sync);

impl PeerAddress {
    pub fn new(address: impl Into<String>) -> Self {
        Self(address.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "PeerAddress({})", self.0)
    }
}

impl From<&str> for PeerAddress {
    fn from(v: &str) -> Self {
        Self::new(v)
    }
}

impl From<String> for PeerAddress {
    fn from(v: String) -> Self {
        Self(v)
    }
}

/// A peripheral reported by discovery, together with what it advertised.
///
/// Reported once per advertisement; the same peer shows up many times while a scan runs.
#[derive(Clone, Debug)]
pub struct DiscoveredDevice {
    address: PeerAddress,
    rssi: i32,
    local_name: Option<String>,
    connectable: Option<bool>,
    service_uuids: Vec<Uuid>,
    manufacturer_data: Option<Vec<u8>>,
}

assert_impl_all!(DiscoveredDevice: Send, Sync);

impl DiscoveredDevice {
    pub fn new(address: impl Into<PeerAddress>, rssi: i32) -> Self {
        Self {
            address: address.into(),
            rssi,
            local_name: None,
            connectable: None,
            service_uuids: Vec::new(),
            manufacturer_data: None,
        }
    }

    pub fn local_name(mut self, v: impl Into<String>) -> Self {
        self.local_name = Some(v.into());
        self
    }

    pub fn connectable(mut self, v: bool) -> Self {
        self.connectable = Some(v);
        self
    }

    pub fn service_uuids(mut self, uuids: &[Uuid]) -> Self {
        self.service_uuids.extend_from_slice(uuids);
        self
    }

    pub fn manufacturer_data(mut self, v: &[u8]) -> Self {
        self.manufacturer_data = Some(v.to_vec());
        self
    }

    pub fn address(&self) -> &PeerAddress {
        &self.address
    }

    /// Received signal strength in dBm.
    pub fn rssi(&self) -> i32 {
        self.rssi
    }

    /// The local name of a peripheral.
    pub fn name(&self) -> Option<&str> {
        self.local_name.as_ref().map(|v| v.as_str())
    }

    /// Indicates whether the advertising event type is connectable.
    pub fn is_connectable(&self) -> Option<bool> {
        self.connectable
    }

    /// Advertised service UUIDs.
    pub fn advertised_services(&self) -> &[Uuid] {
        &self.service_uuids
    }

    /// The manufacturer data of a peripheral.
    pub fn manufacturer_specific_data(&self) -> Option<&[u8]> {
        self.manufacturer_data.as_ref().map(|v| v.as_slice())
    }
}
