use std::fmt;
use std::io;

#[derive(Clone, Debug)]
pub struct Error {
    kind: ErrorKind,
    description: String,
}

impl Error {
    pub fn new(kind: ErrorKind, description: impl Into<String>) -> Self {
        Self {
            kind,
            description: description.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn is_timeout(&self) -> bool {
        self.kind == ErrorKind::Timeout
    }

    pub(in crate) fn timeout() -> Self {
        Self::new(ErrorKind::Timeout, "timeout")
    }

    pub(in crate) fn connection_closed() -> Self {
        Self::new(ErrorKind::ConnectionClosed, "connection closed")
    }

    pub(in crate) fn invalid_argument(description: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidArgument, description)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.description)
    }
}

impl std::error::Error for Error {}

impl From<io::Error> for Error {
    fn from(v: io::Error) -> Self {
        Self::new(ErrorKind::Io, v.to_string())
    }
}

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
#[non_exhaustive]
pub enum ErrorKind {
    /// The platform has no Bluetooth LE capability.
    Unsupported,

    /// The Bluetooth adapter couldn't be obtained.
    AdapterUnavailable,

    /// The adapter is present but switched off.
    AdapterDisabled,

    /// The adapter hasn't been initialized or went away.
    NotReady,

    /// The operation didn't reach a terminal state before its deadline.
    Timeout,

    /// The radio reported a failure for the request.
    Transport,

    /// An incoming frame didn't fit into the reassembly buffer.
    FrameOverflow,

    /// The request was rejected before reaching the transport.
    InvalidArgument,

    /// The peer doesn't expose the characteristic, or not with the needed property.
    CharacteristicNotFound,

    /// There's no usable connection to the peer.
    NotConnected,

    /// The connection went away while the command was queued or in flight.
    ConnectionClosed,

    /// The transport lacks the capability, e.g. transfer unit negotiation.
    OperationNotSupported,

    /// An OS resource couldn't be obtained, e.g. a thread couldn't be spawned.
    Io,
}

impl ErrorKind {
    /// Capability errors are fatal to initialization and are never retried automatically.
    pub fn is_capability(self) -> bool {
        use ErrorKind::*;
        match self {
            Unsupported | AdapterUnavailable | AdapterDisabled => true,
            _ => false,
        }
    }

    /// Misuse is rejected synchronously at submission time.
    pub fn is_misuse(self) -> bool {
        use ErrorKind::*;
        match self {
            InvalidArgument | CharacteristicNotFound | NotConnected | NotReady => true,
            _ => false,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn display_is_description() {
        let err = Error::new(ErrorKind::AdapterDisabled, "bluetooth is not enabled");
        assert_eq!(err.to_string(), "bluetooth is not enabled");
        assert_eq!(err.kind(), ErrorKind::AdapterDisabled);
        assert!(err.kind().is_capability());
        assert!(!err.kind().is_misuse());
    }

    #[test]
    fn classification() {
        assert!(Error::timeout().is_timeout());
        assert!(ErrorKind::CharacteristicNotFound.is_misuse());
        assert!(!ErrorKind::ConnectionClosed.is_misuse());
        assert!(!ErrorKind::Transport.is_capability());
    }
}
