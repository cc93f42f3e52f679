//! Addressing primitives and protocol-level scalar types.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use super::error::Error;

/// Reserved AMS port of the I/O server on a TwinCAT host.
pub const IO_SERVER_PORT: u16 = 300;
/// Reserved AMS port of the EtherCAT master on a device.
pub const ECAT_MASTER_PORT: u16 = 0xFFFF;
/// Reserved AMS port of the TwinCAT system service.
pub const SYSTEM_SERVICE_PORT: u16 = 10_000;
/// Reserved AMS port of the first PLC runtime.
pub const PLC_RUNTIME_PORT: u16 = 851;
/// Lowest AMS port a client may pick for itself.
pub const CLIENT_BASE_PORT: u16 = 8000;

/// TCP port of the unencrypted ADS transport.
pub const ADS_TCP_PORT: u16 = 48_898;
/// UDP port of the ADS discovery and route service.
pub const ADS_UDP_PORT: u16 = 48_899;

/// Six-byte AMS network identifier in `a.b.c.d.e.f` notation.
///
/// The net id names an endpoint on the AMS network; it is not an IP address,
/// although hosts conventionally derive it from one by appending `.1.1`.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct AmsNetId(pub [u8; 6]);

impl AmsNetId {
    /// Build a net id from its six octets.
    pub const fn new(octets: [u8; 6]) -> Self {
        Self(octets)
    }

    /// Parse a net id from a 6-byte wire slice.
    pub fn from_slice(raw: &[u8]) -> Result<Self, Error> {
        let octets: [u8; 6] = raw.try_into().map_err(|_| Error::Frame {
            context: "AMS net id must be exactly 6 bytes",
        })?;
        Ok(Self(octets))
    }

    /// Wire representation.
    #[inline]
    pub fn as_bytes(&self) -> &[u8; 6] {
        &self.0
    }
}

impl FromStr for AmsNetId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut octets = [0u8; 6];
        let mut count = 0;
        for part in s.split('.') {
            if count == 6 {
                count += 1;
                break;
            }
            octets[count] = part.parse::<u8>().map_err(|_| Error::Frame {
                context: "AMS net id octet out of range",
            })?;
            count += 1;
        }
        if count != 6 {
            return Err(Error::Frame {
                context: "AMS net id must have 6 dot-separated octets",
            });
        }
        Ok(Self(octets))
    }
}

impl fmt::Display for AmsNetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{a}.{b}.{c}.{d}.{e}.{g}")
    }
}

impl fmt::Debug for AmsNetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AmsNetId({self})")
    }
}

impl Serialize for AmsNetId {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for AmsNetId {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// An AMS endpoint: net id plus reserved port.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Serialize, Deserialize)]
pub struct AmsAddr {
    pub net_id: AmsNetId,
    pub port: u16,
}

impl AmsAddr {
    pub const fn new(net_id: AmsNetId, port: u16) -> Self {
        Self { net_id, port }
    }

    /// Same net id, different reserved port.
    pub const fn with_port(&self, port: u16) -> Self {
        Self {
            net_id: self.net_id,
            port,
        }
    }
}

impl fmt::Display for AmsAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.net_id, self.port)
    }
}

/// AMS header state flags.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct StateFlags(pub u16);

impl StateFlags {
    /// The frame is a response to a request.
    pub const RESPONSE: u16 = 0x0001;
    /// The frame carries an ADS command.
    pub const ADS_COMMAND: u16 = 0x0004;

    /// Flags for an outgoing request.
    pub const fn request() -> Self {
        Self(Self::ADS_COMMAND)
    }

    /// Flags for a response frame.
    pub const fn response() -> Self {
        Self(Self::ADS_COMMAND | Self::RESPONSE)
    }

    #[inline]
    pub fn is_response(&self) -> bool {
        self.0 & Self::RESPONSE != 0
    }
}

/// ADS device state machine values reported by ReadState.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum AdsState {
    Invalid,
    Idle,
    Reset,
    Init,
    Start,
    Run,
    Stop,
    SaveConfig,
    LoadConfig,
    /// Value outside the documented state machine.
    Other(u16),
}

impl AdsState {
    pub fn from_u16(raw: u16) -> Self {
        match raw {
            0 => AdsState::Invalid,
            1 => AdsState::Idle,
            2 => AdsState::Reset,
            3 => AdsState::Init,
            4 => AdsState::Start,
            5 => AdsState::Run,
            6 => AdsState::Stop,
            7 => AdsState::SaveConfig,
            8 => AdsState::LoadConfig,
            other => AdsState::Other(other),
        }
    }

    pub fn as_u16(&self) -> u16 {
        match self {
            AdsState::Invalid => 0,
            AdsState::Idle => 1,
            AdsState::Reset => 2,
            AdsState::Init => 3,
            AdsState::Start => 4,
            AdsState::Run => 5,
            AdsState::Stop => 6,
            AdsState::SaveConfig => 7,
            AdsState::LoadConfig => 8,
            AdsState::Other(raw) => *raw,
        }
    }
}

/// EtherCAT state machine values for masters and slaves.
pub mod ecat_state {
    pub const INIT: u8 = 0x01;
    pub const PREOP: u8 = 0x02;
    pub const BOOT: u8 = 0x03;
    pub const SAFEOP: u8 = 0x04;
    pub const OP: u8 = 0x08;
}

/// Link status values reported alongside the EtherCAT state.
pub mod link_state {
    pub const OK: u8 = 0x00;
}

/// When the server generates notification samples for a subscription.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TransmissionMode {
    NoTrans = 0,
    ClientCycle = 1,
    ClientOnChange = 2,
    ServerCycle = 3,
    ServerOnChange = 4,
}

impl TransmissionMode {
    pub fn from_u32(raw: u32) -> Option<Self> {
        Some(match raw {
            0 => TransmissionMode::NoTrans,
            1 => TransmissionMode::ClientCycle,
            2 => TransmissionMode::ClientOnChange,
            3 => TransmissionMode::ServerCycle,
            4 => TransmissionMode::ServerOnChange,
            _ => return None,
        })
    }
}

/// Convert a duration to the protocol's 100 ns tick unit, saturating.
pub fn duration_to_filetime_ticks(d: Duration) -> u32 {
    (d.as_nanos() / 100).min(u32::MAX as u128) as u32
}

/// ADS datatype codes carried in symbol table entries.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum AdsDataType {
    Int16,
    Int32,
    Real32,
    Real64,
    UInt8,
    UInt16,
    UInt32,
    Int64,
    UInt64,
    String,
    Bit,
    /// Composite structure read as an opaque byte range.
    BigType,
}

impl AdsDataType {
    pub fn from_u32(raw: u32) -> Option<Self> {
        Some(match raw {
            2 => AdsDataType::Int16,
            3 => AdsDataType::Int32,
            4 => AdsDataType::Real32,
            5 => AdsDataType::Real64,
            17 => AdsDataType::UInt8,
            18 => AdsDataType::UInt16,
            19 => AdsDataType::UInt32,
            20 => AdsDataType::Int64,
            21 => AdsDataType::UInt64,
            30 => AdsDataType::String,
            33 => AdsDataType::Bit,
            65 => AdsDataType::BigType,
            _ => return None,
        })
    }

    pub fn as_u32(&self) -> u32 {
        match self {
            AdsDataType::Int16 => 2,
            AdsDataType::Int32 => 3,
            AdsDataType::Real32 => 4,
            AdsDataType::Real64 => 5,
            AdsDataType::UInt8 => 17,
            AdsDataType::UInt16 => 18,
            AdsDataType::UInt32 => 19,
            AdsDataType::Int64 => 20,
            AdsDataType::UInt64 => 21,
            AdsDataType::String => 30,
            AdsDataType::Bit => 33,
            AdsDataType::BigType => 65,
        }
    }

    /// Byte width of one element, `None` for variable-width types.
    pub fn byte_len(&self) -> Option<usize> {
        Some(match self {
            AdsDataType::Bit | AdsDataType::UInt8 => 1,
            AdsDataType::Int16 | AdsDataType::UInt16 => 2,
            AdsDataType::Int32 | AdsDataType::UInt32 | AdsDataType::Real32 => 4,
            AdsDataType::Int64 | AdsDataType::UInt64 | AdsDataType::Real64 => 8,
            AdsDataType::String | AdsDataType::BigType => return None,
        })
    }
}
