//! AMS frame model: header plus opaque command payload.

pub mod header;
pub mod notification;
pub mod request;
pub mod response;

use bytes::Bytes;

pub use header::AmsHeader;

/// One fully delimited AMS packet as carried over the TCP transport.
///
/// The payload is kept opaque at this layer; the command dispatcher decodes it
/// under the type implied by `header.command` and the response slot that the
/// invoke id resolves to.
#[derive(Clone, Debug)]
pub struct AmsFrame {
    pub header: AmsHeader,
    pub payload: Bytes,
}

impl AmsFrame {
    pub fn new(header: AmsHeader, payload: Bytes) -> Self {
        Self { header, payload }
    }

    /// Total encoded length excluding the 6-byte AMS/TCP prefix.
    #[inline]
    pub fn wire_len(&self) -> usize {
        AmsHeader::BYTE_LEN + self.payload.len()
    }
}
