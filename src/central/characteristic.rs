use enumflags2::BitFlags;
use static_assertions::assert_impl_all;
use std::fmt;

use crate::uuid::Uuid;

#[derive(BitFlags, Copy, Clone, Debug, Eq, Hash, PartialEq)]
#[repr(u32)]
enum Property {
    Broadcast                       = 0x01,
    Read                            = 0x02,
    WriteWithoutResponse            = 0x04,
    Write                           = 0x08,
    Notify                          = 0x10,
    Indicate                        = 0x20,
    AuthenticatedSignedWrites       = 0x40,
    ExtendedProperties              = 0x80,
}

/// GATT characteristic properties, bit-compatible with the Characteristic Properties field of
/// the characteristic declaration.
#[derive(Clone, Copy, Eq, Hash, PartialEq)]
pub struct Properties(BitFlags<Property>);

impl Properties {
    /// Unknown bits are dropped.
    pub fn from_bits_truncate(bits: u32) -> Self {
        Self(BitFlags::from_bits_truncate(bits))
    }

    /// Every property set. Transports that can't report properties use this.
    pub fn all() -> Self {
        Self(BitFlags::all())
    }

    pub fn bits(&self) -> u32 {
        self.0.bits()
    }

    /// The value can be fetched by a read request or delivered by a notification.
    pub fn is_readable(&self) -> bool {
        self.is_read() || self.is_notify() || self.is_indicate()
    }

    pub fn is_writable(&self) -> bool {
        self.is_write() || self.is_write_without_response()
    }
}

macro_rules! properties {
    ($($(#[$attr:meta])* $f:ident => $e:ident,)*) => {
        impl Properties {
            $(
                $(#[$attr])*
                pub fn $f(&self) -> bool {
                    self.0.contains(Property::$e)
                }
            )*
        }
    };
}

properties!(
    #[doc="The value can be broadcast using the server characteristic configuration descriptor."]
    is_broadcast => Broadcast,

    #[doc="The value can be read."]
    is_read => Read,

    #[doc="The value can be written without the peer acknowledging the write."]
    is_write_without_response => WriteWithoutResponse,

    #[doc="The value can be written and every write is acknowledged."]
    is_write => Write,

    #[doc="The peer can notify value changes without expecting a confirmation."]
    is_notify => Notify,

    #[doc="The peer can indicate value changes and expects a confirmation."]
    is_indicate => Indicate,

    #[doc="Signed writes are permitted."]
    is_authenticated_signed_writes => AuthenticatedSignedWrites,

    #[doc="Additional properties live in the extended properties descriptor."]
    is_extended_properties => ExtendedProperties,
);

assert_impl_all!(Properties: Send, Sync);

impl fmt::Debug for Properties {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_tuple("Properties")
            .field(&crate::util::BitFlagsDebug(self.0))
            .finish()
    }
}

/// A characteristic exposed by a connected peer, as reported by service discovery.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Characteristic {
    id: Uuid,
    properties: Properties,
}

assert_impl_all!(Characteristic: Send, Sync);

impl Characteristic {
    pub fn new(id: Uuid, properties: Properties) -> Self {
        Self {
            id,
            properties,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn properties(&self) -> &Properties {
        &self.properties
    }
}
