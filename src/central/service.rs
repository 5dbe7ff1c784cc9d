use static_assertions::assert_impl_all;

use crate::uuid::Uuid;
use super::characteristic::Characteristic;

/// A GATT service reported by service discovery.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Service {
    id: Uuid,
    primary: bool,
    characteristics: Vec<Characteristic>,
}

assert_impl_all!(Service: Send, Sync);

impl Service {
    pub fn new(id: Uuid, primary: bool, characteristics: Vec<Characteristic>) -> Self {
        Self {
            id,
            primary,
            characteristics,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Indicates whether the type of service is primary or secondary.
    ///
    /// A primary service describes the primary function of a device. A secondary service is only
    /// relevant in the context of another service that references it.
    pub fn is_primary(&self) -> bool {
        self.primary
    }

    pub fn characteristics(&self) -> &[Characteristic] {
        &self.characteristics
    }
}

/// Looks `id` up across all services. The first match wins when several services carry the same
/// characteristic.
pub(in crate) fn find_characteristic(services: &[Service], id: Uuid) -> Option<&Characteristic> {
    services.iter()
        .flat_map(|s| s.characteristics.iter())
        .find(|c| c.id() == id)
}
