use static_assertions::assert_impl_all;
use std::fmt;
use std::str::FromStr;

/// `00000000-0000-1000-8000-00805F9B34FB`
const BASE_UUID: u128 = 0x0000_0000_0000_1000_8000_0080_5f9b_34fb;

/// Bits that are free in a 16/32-bit alias of the base UUID.
const ALIAS_MASK: u128 = 0xffff_ffff << 96;

/// Bluetooth-tailored UUID.
///
/// Identifies services and characteristics. The 16 and 32-bit forms assigned by the Bluetooth SIG
/// are aliases of the Bluetooth Base UUID and expand to the same 128-bit value.
#[derive(Clone, Copy, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct Uuid(u128);

impl Uuid {
    /// Returns UUID with all bits set to zero.
    pub const fn zeroed() -> Self {
        Self(0)
    }

    /// Returns the Base UUID (`00000000-0000-1000-8000-00805F9B34FB`) as defined by the specs.
    pub const fn base() -> Self {
        Self(BASE_UUID)
    }

    pub const fn from_u128(v: u128) -> Self {
        Self(v)
    }

    /// Expands a SIG-assigned 16-bit UUID, e.g. `0x2a37` for Heart Rate Measurement.
    pub const fn from_u16(v: u16) -> Self {
        Self(BASE_UUID | (v as u128) << 96)
    }

    /// Expands a SIG-assigned 32-bit UUID.
    pub const fn from_u32(v: u32) -> Self {
        Self(BASE_UUID | (v as u128) << 96)
    }

    /// Constructs instance from a big-endian slice of 2, 4 or 16 bytes.
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        Some(match bytes.len() {
            2 => Self::from_u16(u16::from_be_bytes([bytes[0], bytes[1]])),
            4 => Self::from_u32(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])),
            16 => {
                let mut buf = [0; 16];
                buf.copy_from_slice(bytes);
                Self(u128::from_be_bytes(buf))
            }
            _ => return None,
        })
    }

    pub const fn as_u128(&self) -> u128 {
        self.0
    }

    /// Big-endian bytes, as they appear in the textual form.
    pub fn to_bytes(&self) -> [u8; 16] {
        self.0.to_be_bytes()
    }

    /// Returns the 16-bit alias if this UUID has one.
    pub fn as_u16(&self) -> Option<u16> {
        self.as_u32()
            .filter(|&v| v <= u16::max_value() as u32)
            .map(|v| v as u16)
    }

    /// Returns the 32-bit alias if this UUID has one.
    pub fn as_u32(&self) -> Option<u32> {
        if self.0 & !ALIAS_MASK == BASE_UUID {
            Some((self.0 >> 96) as u32)
        } else {
            None
        }
    }
}

assert_impl_all!(Uuid: Send, Sync);

impl fmt::Display for Uuid {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let v = self.0;
        write!(f, "{:08x}-{:04x}-{:04x}-{:04x}-{:012x}",
            v >> 96,
            (v >> 80) & 0xffff,
            (v >> 64) & 0xffff,
            (v >> 48) & 0xffff,
            v & 0xffff_ffff_ffff)
    }
}

impl fmt::Debug for Uuid {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Uuid({})", self)
    }
}

impl From<u16> for Uuid {
    fn from(v: u16) -> Self {
        Self::from_u16(v)
    }
}

impl From<u128> for Uuid {
    fn from(v: u128) -> Self {
        Self::from_u128(v)
    }
}

impl FromStr for Uuid {
    type Err = UuidParseError;

    /// Accepts the hyphenated 36-character form as well as bare 4 and 8 digit aliases.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        fn hex(digits: &str) -> Result<u128, UuidParseError> {
            if digits.is_empty() || !digits.bytes().all(|c| c.is_ascii_hexdigit()) {
                return Err(UuidParseError(()));
            }
            u128::from_str_radix(digits, 16).map_err(|_| UuidParseError(()))
        }

        match s.len() {
            4 => Ok(Self::from_u16(hex(s)? as u16)),
            8 => Ok(Self::from_u32(hex(s)? as u32)),
            36 => {
                const HYPHENS: [usize; 4] = [8, 13, 18, 23];
                let bytes = s.as_bytes();
                if HYPHENS.iter().any(|&i| bytes[i] != b'-') {
                    return Err(UuidParseError(()));
                }
                let digits: String = s.split('-').collect();
                if digits.len() != 32 {
                    return Err(UuidParseError(()));
                }
                Ok(Self(hex(&digits)?))
            }
            _ => Err(UuidParseError(())),
        }
    }
}

#[derive(Debug)]
pub struct UuidParseError(());

impl fmt::Display for UuidParseError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "invalid UUID string")
    }
}

impl std::error::Error for UuidParseError {}
