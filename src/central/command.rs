use static_assertions::assert_impl_all;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::error::Error;
use crate::uuid::Uuid;
use super::Config;
use super::frame;
use super::peripheral::PeerAddress;

/// Smallest transfer unit a link may use (ATT default MTU).
pub const MIN_TRANSFER_UNIT: u16 = 23;

/// Largest transfer unit a link may negotiate.
pub const MAX_TRANSFER_UNIT: u16 = 517;

/// Successful result of a [`Command`](enum.Command.html).
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Response {
    Connected,
    Disconnected,
    Read(Vec<u8>),
    Written,
    TransferUnit(u16),
}

pub type Outcome = Result<Response, Error>;

/// Invoked exactly once with the terminal outcome of a command. Runs on an internal thread, so it
/// must not block waiting for another command of the same peer.
pub type Completion = Box<dyn FnOnce(Outcome) + Send>;

/// Decides whether the bytes accumulated so far form a whole frame.
pub type FramePredicate = Arc<dyn Fn(&[u8]) -> bool + Send + Sync>;

/// Reads a characteristic, reassembling the response from one or more packets.
///
/// Every value that arrives for the characteristic while the read is in flight, whether as the
/// read response or as a notification, is appended to the frame. The read completes once the
/// frame predicate accepts the bytes accumulated so far. By default any non-empty value is a whole
/// frame.
#[derive(Clone)]
pub struct ReadCharacteristic {
    address: PeerAddress,
    characteristic: Uuid,
    timeout: Option<Duration>,
    max_frame_size: Option<usize>,
    whole_frame: Option<FramePredicate>,
    description: Option<String>,
}

impl ReadCharacteristic {
    pub fn new(address: impl Into<PeerAddress>, characteristic: Uuid) -> Self {
        Self {
            address: address.into(),
            characteristic,
            timeout: None,
            max_frame_size: None,
            whole_frame: None,
            description: None,
        }
    }

    /// Zero disables the deadline. Defaults to the manager's command timeout.
    pub fn timeout(mut self, v: Duration) -> Self {
        self.timeout = Some(v);
        self
    }

    /// Reassembly buffer size. Defaults to the manager's read frame size.
    pub fn max_frame_size(mut self, v: usize) -> Self {
        self.max_frame_size = Some(v);
        self
    }

    pub fn whole_frame<F>(mut self, f: F) -> Self
        where F: Fn(&[u8]) -> bool + Send + Sync + 'static
    {
        self.whole_frame = Some(Arc::new(f));
        self
    }

    /// Shown in log lines.
    pub fn description(mut self, v: impl Into<String>) -> Self {
        self.description = Some(v.into());
        self
    }
}

impl fmt::Debug for ReadCharacteristic {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("ReadCharacteristic")
            .field("address", &self.address)
            .field("characteristic", &self.characteristic)
            .field("timeout", &self.timeout)
            .field("max_frame_size", &self.max_frame_size)
            .field("description", &self.description)
            .finish()
    }
}

/// Writes a payload to a characteristic in chunks of at most `chunk_size` bytes.
///
/// With [`response`](#method.response) set, the peer's reply is collected from notifications of
/// the same characteristic. Collecting starts with the first chunk, and the write completes with
/// `Response::Read` once every chunk is acknowledged and the reply is a whole frame.
#[derive(Clone)]
pub struct WriteCharacteristic {
    address: PeerAddress,
    characteristic: Uuid,
    payload: Vec<u8>,
    chunk_size: Option<usize>,
    timeout: Option<Duration>,
    response: Option<FramePredicate>,
    max_frame_size: Option<usize>,
    description: Option<String>,
}

impl WriteCharacteristic {
    pub fn new(address: impl Into<PeerAddress>, characteristic: Uuid, payload: impl Into<Vec<u8>>)
        -> Self
    {
        Self {
            address: address.into(),
            characteristic,
            payload: payload.into(),
            chunk_size: None,
            timeout: None,
            response: None,
            max_frame_size: None,
            description: None,
        }
    }

    /// Defaults to the manager's write chunk size.
    pub fn chunk_size(mut self, v: usize) -> Self {
        self.chunk_size = Some(v);
        self
    }

    /// Zero disables the deadline. Defaults to the manager's command timeout.
    pub fn timeout(mut self, v: Duration) -> Self {
        self.timeout = Some(v);
        self
    }

    /// Awaits a reply frame accepted by `whole_frame`.
    pub fn response<F>(mut self, whole_frame: F) -> Self
        where F: Fn(&[u8]) -> bool + Send + Sync + 'static
    {
        self.response = Some(Arc::new(whole_frame));
        self
    }

    /// Reply reassembly buffer size. Defaults to the manager's read frame size.
    pub fn max_frame_size(mut self, v: usize) -> Self {
        self.max_frame_size = Some(v);
        self
    }

    /// Shown in log lines.
    pub fn description(mut self, v: impl Into<String>) -> Self {
        self.description = Some(v.into());
        self
    }
}

impl fmt::Debug for WriteCharacteristic {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("WriteCharacteristic")
            .field("address", &self.address)
            .field("characteristic", &self.characteristic)
            .field("payload", &self.payload.len())
            .field("chunk_size", &self.chunk_size)
            .field("timeout", &self.timeout)
            .field("response", &self.response.is_some())
            .field("max_frame_size", &self.max_frame_size)
            .field("description", &self.description)
            .finish()
    }
}

/// A request against a peer.
///
/// `Connect` and `Disconnect` drive the peer's connection. Everything else runs through the peer's
/// command pipeline, one command at a time in submission order.
#[derive(Clone, Debug)]
pub enum Command {
    Connect {
        address: PeerAddress,

        /// Zero disables the deadline. `None` means the manager's connect timeout.
        timeout: Option<Duration>,
    },

    Disconnect {
        address: PeerAddress,
    },

    ReadCharacteristic(ReadCharacteristic),

    WriteCharacteristic(WriteCharacteristic),

    SetTransferUnit {
        address: PeerAddress,
        size: u16,

        /// Zero disables the deadline. `None` means the manager's command timeout.
        timeout: Option<Duration>,
    },
}

assert_impl_all!(Command: Send, Sync);

impl Command {
    pub fn connect(address: impl Into<PeerAddress>) -> Self {
        Self::Connect {
            address: address.into(),
            timeout: None,
        }
    }

    pub fn disconnect(address: impl Into<PeerAddress>) -> Self {
        Self::Disconnect {
            address: address.into(),
        }
    }

    pub fn set_transfer_unit(address: impl Into<PeerAddress>, size: u16) -> Self {
        Self::SetTransferUnit {
            address: address.into(),
            size,
            timeout: None,
        }
    }

    pub fn address(&self) -> &PeerAddress {
        match self {
            Self::Connect { address, .. }
            | Self::Disconnect { address }
            | Self::SetTransferUnit { address, .. }
            => address,
            Self::ReadCharacteristic(c) => &c.address,
            Self::WriteCharacteristic(c) => &c.address,
        }
    }

    /// Resolves defaults from `config` and rejects malformed commands.
    pub(in crate) fn route(self, config: &Config) -> Result<Routed, Error> {
        if self.address().is_empty() {
            return Err(Error::invalid_argument("empty address"));
        }
        Ok(match self {
            Self::Connect { address, timeout } => Routed::Connect {
                address,
                timeout: deadline_timeout(timeout, config.connect_timeout),
            },
            Self::Disconnect { address } => Routed::Disconnect { address },
            Self::ReadCharacteristic(c) => {
                let max_frame_size = c.max_frame_size.unwrap_or(config.read_max_frame_size);
                if max_frame_size == 0 {
                    return Err(Error::invalid_argument("max frame size must be positive"));
                }
                let description = match c.description {
                    Some(v) => v,
                    None => format!("read {}", c.characteristic),
                };
                Routed::Pipeline {
                    address: c.address,
                    operation: Operation::Read {
                        characteristic: c.characteristic,
                        max_frame_size,
                        whole_frame: c.whole_frame
                            .unwrap_or_else(|| Arc::new(|b: &[u8]| !b.is_empty())),
                    },
                    timeout: deadline_timeout(c.timeout, config.command_timeout),
                    description,
                }
            }
            Self::WriteCharacteristic(c) => {
                let chunk_size = c.chunk_size.unwrap_or(config.write_chunk_size);
                if chunk_size == 0 {
                    return Err(Error::invalid_argument("chunk size must be positive"));
                }
                if c.payload.is_empty() {
                    return Err(Error::invalid_argument("empty payload"));
                }
                let response = match c.response {
                    Some(whole_frame) => {
                        let max_frame_size = c.max_frame_size.unwrap_or(config.read_max_frame_size);
                        if max_frame_size == 0 {
                            return Err(Error::invalid_argument("max frame size must be positive"));
                        }
                        Some(FrameSpec { max_frame_size, whole_frame })
                    }
                    None => None,
                };
                let description = match c.description {
                    Some(v) => v,
                    None if response.is_some() => format!("write {} bytes to {} and await reply",
                        c.payload.len(), c.characteristic),
                    None => format!("write {} bytes to {}", c.payload.len(), c.characteristic),
                };
                Routed::Pipeline {
                    address: c.address,
                    operation: Operation::Write {
                        characteristic: c.characteristic,
                        chunks: frame::split(&c.payload, chunk_size),
                        response,
                    },
                    timeout: deadline_timeout(c.timeout, config.command_timeout),
                    description,
                }
            }
            Self::SetTransferUnit { address, size, timeout } => {
                if size < MIN_TRANSFER_UNIT || size > MAX_TRANSFER_UNIT {
                    return Err(Error::invalid_argument(format!(
                        "transfer unit {} is outside of {}..={}",
                        size, MIN_TRANSFER_UNIT, MAX_TRANSFER_UNIT)));
                }
                Routed::Pipeline {
                    address,
                    operation: Operation::SetTransferUnit { size },
                    timeout: deadline_timeout(timeout, config.command_timeout),
                    description: format!("set transfer unit to {}", size),
                }
            }
        })
    }
}

impl From<ReadCharacteristic> for Command {
    fn from(v: ReadCharacteristic) -> Self {
        Self::ReadCharacteristic(v)
    }
}

impl From<WriteCharacteristic> for Command {
    fn from(v: WriteCharacteristic) -> Self {
        Self::WriteCharacteristic(v)
    }
}

/// `None` means no deadline.
fn deadline_timeout(timeout: Option<Duration>, default: Duration) -> Option<Duration> {
    let v = timeout.unwrap_or(default);
    if v == Duration::from_secs(0) {
        None
    } else {
        Some(v)
    }
}

/// A command with its defaults resolved, headed for the registry or a peer pipeline.
pub(in crate) enum Routed {
    Connect {
        address: PeerAddress,
        timeout: Option<Duration>,
    },
    Disconnect {
        address: PeerAddress,
    },
    Pipeline {
        address: PeerAddress,
        operation: Operation,
        timeout: Option<Duration>,
        description: String,
    },
}

pub(in crate) enum Operation {
    Read {
        characteristic: Uuid,
        max_frame_size: usize,
        whole_frame: FramePredicate,
    },
    Write {
        characteristic: Uuid,
        chunks: Vec<Vec<u8>>,
        response: Option<FrameSpec>,
    },
    SetTransferUnit {
        size: u16,
    },
}

/// How to reassemble the reply to a write.
pub(in crate) struct FrameSpec {
    pub max_frame_size: usize,
    pub whole_frame: FramePredicate,
}

impl Operation {
    pub fn characteristic(&self) -> Option<Uuid> {
        match self {
            Self::Read { characteristic, .. } | Self::Write { characteristic, .. }
                => Some(*characteristic),
            Self::SetTransferUnit { .. } => None,
        }
    }

    /// The characteristic whose notifications this operation collects.
    pub fn notified_characteristic(&self) -> Option<Uuid> {
        match self {
            Self::Read { characteristic, .. }
            | Self::Write { characteristic, response: Some(_), .. }
                => Some(*characteristic),
            _ => None,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::error::ErrorKind;

    const ADDR: &str = "AA:BB:CC:DD:EE:FF";

    fn config() -> Config {
        Config::default()
    }

    fn uuid() -> Uuid {
        Uuid::from_u16(0xffe1)
    }

    #[test]
    fn empty_address_rejected() {
        for cmd in vec![
            Command::connect(""),
            Command::disconnect(""),
            ReadCharacteristic::new("", uuid()).into(),
            WriteCharacteristic::new("", uuid(), vec![1]).into(),
            Command::set_transfer_unit("", 185),
        ] {
            let err = cmd.route(&config()).err().unwrap();
            assert_eq!(err.kind(), ErrorKind::InvalidArgument);
            assert_eq!(err.description(), "empty address");
        }
    }

    #[test]
    fn write_is_chunked() {
        let cmd: Command = WriteCharacteristic::new(ADDR, uuid(), vec![7; 61]).chunk_size(20).into();
        match cmd.route(&config()).unwrap() {
            Routed::Pipeline { operation: Operation::Write { chunks, .. }, timeout, .. } => {
                let lens: Vec<_> = chunks.iter().map(|c| c.len()).collect();
                assert_eq!(lens, vec![20, 20, 20, 1]);
                assert_eq!(timeout, Some(config().command_timeout));
            }
            _ => panic!(),
        }
    }

    #[test]
    fn malformed_writes_rejected() {
        let cmd: Command = WriteCharacteristic::new(ADDR, uuid(), vec![]).into();
        assert_eq!(cmd.route(&config()).err().unwrap().kind(), ErrorKind::InvalidArgument);
        let cmd: Command = WriteCharacteristic::new(ADDR, uuid(), vec![1]).chunk_size(0).into();
        assert_eq!(cmd.route(&config()).err().unwrap().kind(), ErrorKind::InvalidArgument);
    }

    #[test]
    fn write_with_response() {
        let cmd: Command = WriteCharacteristic::new(ADDR, uuid(), vec![1, 2])
            .response(|b| b.len() >= 3)
            .into();
        match cmd.route(&config()).unwrap() {
            Routed::Pipeline { operation, description, .. } => {
                assert_eq!(operation.notified_characteristic(), Some(uuid()));
                match operation {
                    Operation::Write { response: Some(FrameSpec { max_frame_size, whole_frame }), .. } => {
                        assert_eq!(max_frame_size, 300);
                        assert!(!whole_frame(&[1, 2]));
                        assert!(whole_frame(&[1, 2, 3]));
                    }
                    _ => panic!(),
                }
                assert_eq!(description, format!("write 2 bytes to {} and await reply", uuid()));
            }
            _ => panic!(),
        }

        let cmd: Command = WriteCharacteristic::new(ADDR, uuid(), vec![1]).into();
        match cmd.route(&config()).unwrap() {
            Routed::Pipeline { operation, .. } => assert_eq!(operation.notified_characteristic(), None),
            _ => panic!(),
        }

        let cmd: Command = WriteCharacteristic::new(ADDR, uuid(), vec![1])
            .response(|_| true)
            .max_frame_size(0)
            .into();
        assert_eq!(cmd.route(&config()).err().unwrap().kind(), ErrorKind::InvalidArgument);
    }

    #[test]
    fn custom_description_is_kept() {
        let cmd: Command = WriteCharacteristic::new(ADDR, uuid(), vec![1]).description("unlock").into();
        match cmd.route(&config()).unwrap() {
            Routed::Pipeline { description, .. } => assert_eq!(description, "unlock"),
            _ => panic!(),
        }
        let cmd: Command = ReadCharacteristic::new(ADDR, uuid()).description("battery").into();
        match cmd.route(&config()).unwrap() {
            Routed::Pipeline { description, .. } => assert_eq!(description, "battery"),
            _ => panic!(),
        }
    }

    #[test]
    fn transfer_unit_bounds() {
        assert!(Command::set_transfer_unit(ADDR, 22).route(&config()).is_err());
        assert!(Command::set_transfer_unit(ADDR, 518).route(&config()).is_err());
        assert!(Command::set_transfer_unit(ADDR, 23).route(&config()).is_ok());
        assert!(Command::set_transfer_unit(ADDR, 517).route(&config()).is_ok());
    }

    #[test]
    fn zero_timeout_means_no_deadline() {
        let cmd = Command::Connect {
            address: ADDR.into(),
            timeout: Some(Duration::from_secs(0)),
        };
        match cmd.route(&config()).unwrap() {
            Routed::Connect { timeout, .. } => assert_eq!(timeout, None),
            _ => panic!(),
        }
        match Command::connect(ADDR).route(&config()).unwrap() {
            Routed::Connect { timeout, .. } => assert_eq!(timeout, Some(config().connect_timeout)),
            _ => panic!(),
        }
    }

    #[test]
    fn read_defaults() {
        let cmd: Command = ReadCharacteristic::new(ADDR, uuid()).into();
        match cmd.route(&config()).unwrap() {
            Routed::Pipeline { operation: Operation::Read { max_frame_size, whole_frame, .. },
                    description, .. } => {
                assert_eq!(max_frame_size, 300);
                assert!(!whole_frame(&[]));
                assert!(whole_frame(&[1]));
                assert_eq!(description, format!("read {}", uuid()));
            }
            _ => panic!(),
        }
    }
}
