//! The 32-byte AMS header.

use bytes::{BufMut, BytesMut};

use crate::protocol::command::CommandId;
use crate::protocol::error::Error;
use crate::protocol::types::{AmsAddr, AmsNetId, StateFlags};

/// AMS routing and correlation header preceding every command payload.
///
/// Fixed little-endian layout: target net id (6) + target port (2) + source
/// net id (6) + source port (2) + command id (2) + state flags (2) + payload
/// length (4) + error code (4) + invoke id (4).
#[derive(Clone, Copy, Debug)]
pub struct AmsHeader {
    pub target: AmsAddr,
    pub source: AmsAddr,
    pub command: CommandId,
    pub state_flags: StateFlags,
    /// Payload length in bytes, excluding this header.
    pub length: u32,
    pub error_code: u32,
    pub invoke_id: u32,
}

impl AmsHeader {
    pub const BYTE_LEN: usize = 32;

    /// Header for an outgoing request.
    pub fn request(
        target: AmsAddr,
        source: AmsAddr,
        command: CommandId,
        payload_len: usize,
        invoke_id: u32,
    ) -> Self {
        Self {
            target,
            source,
            command,
            state_flags: StateFlags::request(),
            length: payload_len as u32,
            error_code: 0,
            invoke_id,
        }
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        buf.reserve(Self::BYTE_LEN);
        buf.put_slice(self.target.net_id.as_bytes());
        buf.put_u16_le(self.target.port);
        buf.put_slice(self.source.net_id.as_bytes());
        buf.put_u16_le(self.source.port);
        buf.put_u16_le(self.command.as_u16());
        buf.put_u16_le(self.state_flags.0);
        buf.put_u32_le(self.length);
        buf.put_u32_le(self.error_code);
        buf.put_u32_le(self.invoke_id);
    }

    pub fn decode(buf: &[u8]) -> Result<Self, Error> {
        if buf.len() < Self::BYTE_LEN {
            return Err(Error::Frame {
                context: "AMS header shorter than 32 bytes",
            });
        }
        let target = AmsAddr::new(
            AmsNetId::from_slice(&buf[0..6])?,
            u16::from_le_bytes([buf[6], buf[7]]),
        );
        let source = AmsAddr::new(
            AmsNetId::from_slice(&buf[8..14])?,
            u16::from_le_bytes([buf[14], buf[15]]),
        );
        let raw_command = u16::from_le_bytes([buf[16], buf[17]]);
        let command = CommandId::from_u16(raw_command).ok_or(Error::Frame {
            context: "unknown AMS command id",
        })?;
        let state_flags = StateFlags(u16::from_le_bytes([buf[18], buf[19]]));
        let length = u32::from_le_bytes([buf[20], buf[21], buf[22], buf[23]]);
        let error_code = u32::from_le_bytes([buf[24], buf[25], buf[26], buf[27]]);
        let invoke_id = u32::from_le_bytes([buf[28], buf[29], buf[30], buf[31]]);
        Ok(Self {
            target,
            source,
            command,
            state_flags,
            length,
            error_code,
            invoke_id,
        })
    }
}
