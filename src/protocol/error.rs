//! Unified error taxonomy for the ADS client.

use std::io;
use thiserror::Error as ThisError;

use super::command::CommandId;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, Error>;

/// Every way an ADS operation can fail.
///
/// Failures surface to the nearest caller; nothing is retried automatically.
/// The only cascading failure is a transport loss, which resolves every
/// pending request and subscription on the connection.
#[derive(Debug, ThisError)]
pub enum Error {
    /// Underlying socket error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The peer closed or reset the connection while requests were pending.
    #[error("connection lost")]
    ConnectionLost,

    /// The connection was already closed when the operation was attempted.
    #[error("connection closed")]
    ConnectionClosed,

    /// The request deadline expired before a response arrived.
    #[error("request timeout")]
    RequestTimeout,

    /// Framing or field-level decoding failed.
    #[error("frame error: {context}")]
    Frame { context: &'static str },

    /// A well-formed frame arrived that does not fit the expected exchange.
    #[error("unexpected response: {context}")]
    UnexpectedResponse { context: &'static str },

    /// The device answered with a non-zero ADS result code.
    #[error("device error {code} on {command:?}")]
    Device {
        code: AdsErrorCode,
        command: CommandId,
    },

    /// No symbol with this name exists in the enumerated catalog.
    #[error("unknown symbol {name:?}")]
    UnknownSymbol { name: String },

    /// A symbol table entry carried a datatype code this client cannot map.
    #[error("unsupported ADS datatype code {code}")]
    UnsupportedDataType { code: u32 },

    /// A facade method was called in a lifecycle state that does not admit it.
    #[error("operation {operation:?} not valid in state {state:?}")]
    InvalidState {
        operation: &'static str,
        state: &'static str,
    },

    /// The notification backlog for a handle exceeded its buffer; the oldest
    /// samples were dropped.
    #[error("notification overflow on handle {handle}: {dropped} samples dropped")]
    NotificationOverflow { handle: u32, dropped: u64 },

    /// The peer rejected the add-route request.
    #[error("route refused by peer (status {status:#x})")]
    RouteRefused { status: u32 },

    /// No reply to a route request within the deadline.
    #[error("route negotiation timed out")]
    RouteTimeout,

    /// The route socket could not reach the peer.
    #[error("route peer unreachable: {0}")]
    RouteUnreachable(io::Error),

    /// The facade registry has no handler under this name.
    #[error("unknown operation {name:?}")]
    UnknownOperation { name: String },

    /// A facade operation was called with arguments it cannot use.
    #[error("invalid argument: {context}")]
    InvalidArgument { context: &'static str },
}

impl Error {
    /// Whether the failure tears down the whole connection.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::Io(_) | Error::ConnectionLost | Error::ConnectionClosed
        )
    }
}

/// ADS return codes as carried in the header `error_code` field and in
/// response `result` fields.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum AdsErrorCode {
    NoError,
    /// 0x1..0x1E general errors (target port/machine not found, invalid
    /// length, TCP send failure, ...).
    General(u32),
    /// 0x500..0x50D router errors.
    Router(u32),
    /// 0x700..0x73F device errors.
    Device(DeviceError),
    /// 0x740..0x756 client errors.
    Client(u32),
    /// 0x1000.. real-time subsystem errors.
    Realtime(u32),
    /// Anything outside the documented ranges.
    Other(u32),
}

/// The device error range, the codes a healthy server actually returns.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum DeviceError {
    GeneralError,
    ServiceNotSupported,
    InvalidGroup,
    InvalidOffset,
    InvalidAccess,
    InvalidSize,
    InvalidData,
    NotReady,
    Busy,
    InvalidContext,
    NoMemory,
    InvalidParam,
    NotFound,
    SymbolNotFound,
    SymbolVersionInvalid,
    InvalidState,
    TransModeNotSupported,
    NotifyHandleInvalid,
    ClientUnknown,
    NoMoreHandles,
    InvalidWatchSize,
    NotInitialized,
    Timeout,
    Other(u32),
}

impl DeviceError {
    fn from_u32(raw: u32) -> Self {
        match raw {
            0x700 => DeviceError::GeneralError,
            0x701 => DeviceError::ServiceNotSupported,
            0x702 => DeviceError::InvalidGroup,
            0x703 => DeviceError::InvalidOffset,
            0x704 => DeviceError::InvalidAccess,
            0x705 => DeviceError::InvalidSize,
            0x706 => DeviceError::InvalidData,
            0x707 => DeviceError::NotReady,
            0x708 => DeviceError::Busy,
            0x709 => DeviceError::InvalidContext,
            0x70A => DeviceError::NoMemory,
            0x70B => DeviceError::InvalidParam,
            0x70C => DeviceError::NotFound,
            0x710 => DeviceError::SymbolNotFound,
            0x711 => DeviceError::SymbolVersionInvalid,
            0x712 => DeviceError::InvalidState,
            0x713 => DeviceError::TransModeNotSupported,
            0x714 => DeviceError::NotifyHandleInvalid,
            0x715 => DeviceError::ClientUnknown,
            0x716 => DeviceError::NoMoreHandles,
            0x717 => DeviceError::InvalidWatchSize,
            0x718 => DeviceError::NotInitialized,
            0x719 => DeviceError::Timeout,
            other => DeviceError::Other(other),
        }
    }

    fn as_u32(&self) -> u32 {
        match self {
            DeviceError::GeneralError => 0x700,
            DeviceError::ServiceNotSupported => 0x701,
            DeviceError::InvalidGroup => 0x702,
            DeviceError::InvalidOffset => 0x703,
            DeviceError::InvalidAccess => 0x704,
            DeviceError::InvalidSize => 0x705,
            DeviceError::InvalidData => 0x706,
            DeviceError::NotReady => 0x707,
            DeviceError::Busy => 0x708,
            DeviceError::InvalidContext => 0x709,
            DeviceError::NoMemory => 0x70A,
            DeviceError::InvalidParam => 0x70B,
            DeviceError::NotFound => 0x70C,
            DeviceError::SymbolNotFound => 0x710,
            DeviceError::SymbolVersionInvalid => 0x711,
            DeviceError::InvalidState => 0x712,
            DeviceError::TransModeNotSupported => 0x713,
            DeviceError::NotifyHandleInvalid => 0x714,
            DeviceError::ClientUnknown => 0x715,
            DeviceError::NoMoreHandles => 0x716,
            DeviceError::InvalidWatchSize => 0x717,
            DeviceError::NotInitialized => 0x718,
            DeviceError::Timeout => 0x719,
            DeviceError::Other(raw) => *raw,
        }
    }
}

impl AdsErrorCode {
    pub fn from_u32(raw: u32) -> Self {
        match raw {
            0 => AdsErrorCode::NoError,
            0x1..=0x1E => AdsErrorCode::General(raw),
            0x500..=0x50D => AdsErrorCode::Router(raw),
            0x700..=0x73F => AdsErrorCode::Device(DeviceError::from_u32(raw)),
            0x740..=0x756 => AdsErrorCode::Client(raw),
            0x1000..=0x101A => AdsErrorCode::Realtime(raw),
            other => AdsErrorCode::Other(other),
        }
    }

    pub fn as_u32(&self) -> u32 {
        match self {
            AdsErrorCode::NoError => 0,
            AdsErrorCode::General(raw)
            | AdsErrorCode::Router(raw)
            | AdsErrorCode::Client(raw)
            | AdsErrorCode::Realtime(raw)
            | AdsErrorCode::Other(raw) => *raw,
            AdsErrorCode::Device(dev) => dev.as_u32(),
        }
    }

    #[inline]
    pub fn is_ok(&self) -> bool {
        matches!(self, AdsErrorCode::NoError)
    }
}

impl std::fmt::Display for AdsErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AdsErrorCode::NoError => write!(f, "no error"),
            AdsErrorCode::Device(dev) => write!(f, "{dev:?} ({:#x})", dev.as_u32()),
            other => write!(f, "{:?} ({:#x})", other, other.as_u32()),
        }
    }
}
