//! AMS/TCP framing codec.
//!
//! Every packet is `[0x00, 0x00]`, a u32 little-endian total length (AMS
//! header plus payload, excluding the six prefix bytes), the 32-byte AMS
//! header and the payload. The decoder is streaming: it peeks the prefix,
//! waits for the full packet, then splits it off zero-copy.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::io;
use tokio_util::codec::{Decoder, Encoder};

use super::frame::{AmsFrame, AmsHeader};

const PREFIX_LEN: usize = 6;

/// Largest packet this client will accept before treating the stream as
/// corrupt. The symbol table of a fully loaded server stays well below this.
const MAX_PACKET_LEN: usize = 16 * 1024 * 1024;

#[derive(Debug, Clone, Default)]
pub struct AmsTcpCodec;

impl Decoder for AmsTcpCodec {
    type Item = AmsFrame;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < PREFIX_LEN {
            return Ok(None);
        }
        if src[0] != 0 || src[1] != 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "AMS/TCP reserved prefix is not zero",
            ));
        }
        let total = u32::from_le_bytes([src[2], src[3], src[4], src[5]]) as usize;
        if total < AmsHeader::BYTE_LEN || total > MAX_PACKET_LEN {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "AMS/TCP packet length out of range",
            ));
        }
        if src.len() < PREFIX_LEN + total {
            src.reserve(PREFIX_LEN + total - src.len());
            return Ok(None);
        }

        src.advance(PREFIX_LEN);
        let packet = src.split_to(total).freeze();
        let header = AmsHeader::decode(&packet)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;
        let payload = packet.slice(AmsHeader::BYTE_LEN..);
        if header.length as usize != payload.len() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "AMS header length disagrees with packet length",
            ));
        }
        Ok(Some(AmsFrame { header, payload }))
    }
}

impl Encoder<AmsFrame> for AmsTcpCodec {
    type Error = io::Error;

    fn encode(&mut self, frame: AmsFrame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let total = frame.wire_len();
        dst.reserve(PREFIX_LEN + total);
        dst.put_slice(&[0, 0]);
        dst.put_u32_le(total as u32);
        frame.header.encode(dst);
        dst.put_slice(&frame.payload);
        Ok(())
    }
}

/// Encode a frame into a standalone buffer (route agent and tests).
pub fn encode_packet(frame: &AmsFrame) -> Bytes {
    let mut buf = BytesMut::with_capacity(PREFIX_LEN + frame.wire_len());
    let mut codec = AmsTcpCodec;
    codec
        .encode(frame.clone(), &mut buf)
        .expect("in-memory encode cannot fail");
    buf.freeze()
}
