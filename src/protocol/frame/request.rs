//! Request payload builders, one per ADS command family.
//!
//! Builders return the payload bytes only; the session prepends the AMS
//! header after allocating the invoke id.

use bytes::{BufMut, Bytes, BytesMut};

use crate::protocol::types::{duration_to_filetime_ticks, TransmissionMode};
use std::time::Duration;

/// Characters strings travel to the server NUL-terminated.
fn put_cstr(buf: &mut BytesMut, s: &str) {
    buf.put_slice(s.as_bytes());
    buf.put_u8(0);
}

/// ReadDeviceInfo and ReadState carry no payload.
pub fn empty() -> Bytes {
    Bytes::new()
}

/// Read `length` bytes at `(group, offset)`.
pub fn read(group: u32, offset: u32, length: u32) -> Bytes {
    let mut buf = BytesMut::with_capacity(12);
    buf.put_u32_le(group);
    buf.put_u32_le(offset);
    buf.put_u32_le(length);
    buf.freeze()
}

/// Write `data` at `(group, offset)`.
pub fn write(group: u32, offset: u32, data: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(12 + data.len());
    buf.put_u32_le(group);
    buf.put_u32_le(offset);
    buf.put_u32_le(data.len() as u32);
    buf.put_slice(data);
    buf.freeze()
}

/// Move the target to `(ads_state, device_state)`, with optional command data.
pub fn write_control(ads_state: u16, device_state: u16, data: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(8 + data.len());
    buf.put_u16_le(ads_state);
    buf.put_u16_le(device_state);
    buf.put_u32_le(data.len() as u32);
    buf.put_slice(data);
    buf.freeze()
}

/// Combined write of `write_data` then read of `read_length` bytes at
/// `(group, offset)`.
pub fn read_write(group: u32, offset: u32, read_length: u32, write_data: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(16 + write_data.len());
    buf.put_u32_le(group);
    buf.put_u32_le(offset);
    buf.put_u32_le(read_length);
    buf.put_u32_le(write_data.len() as u32);
    buf.put_slice(write_data);
    buf.freeze()
}

/// Resolve a symbol handle for `name` (ReadWrite on the handle service).
pub fn handle_by_name(name: &str) -> Bytes {
    let mut data = BytesMut::with_capacity(name.len() + 1);
    put_cstr(&mut data, name);
    read_write(
        crate::protocol::index::SYM_HANDLE_BY_NAME,
        0,
        4,
        &data.freeze(),
    )
}

/// Release a previously resolved symbol handle (Write on the release service).
pub fn release_handle(handle: u32) -> Bytes {
    write(
        crate::protocol::index::SYM_RELEASE_HANDLE,
        0,
        &handle.to_le_bytes(),
    )
}

/// Register a device notification on `length` bytes at `(group, offset)`.
///
/// `max_delay` and `cycle_time` are converted to 100 ns ticks. The trailing
/// 16 reserved bytes are always zero.
pub fn add_notification(
    group: u32,
    offset: u32,
    length: u32,
    mode: TransmissionMode,
    max_delay: Duration,
    cycle_time: Duration,
) -> Bytes {
    let mut buf = BytesMut::with_capacity(40);
    buf.put_u32_le(group);
    buf.put_u32_le(offset);
    buf.put_u32_le(length);
    buf.put_u32_le(mode as u32);
    buf.put_u32_le(duration_to_filetime_ticks(max_delay));
    buf.put_u32_le(duration_to_filetime_ticks(cycle_time));
    buf.put_slice(&[0u8; 16]);
    buf.freeze()
}

/// Remove a device notification by its server-assigned handle.
pub fn delete_notification(handle: u32) -> Bytes {
    Bytes::copy_from_slice(&handle.to_le_bytes())
}

/// One sub-request of a batched sum-read.
#[derive(Clone, Copy, Debug)]
pub struct SumReadItem {
    pub group: u32,
    pub offset: u32,
    pub length: u32,
}

/// Batched reads in a single ReadWrite round trip. The index offset carries
/// the sub-request count; each sub-request is 12 bytes of write data.
pub fn sum_read(items: &[SumReadItem]) -> Bytes {
    let mut data = BytesMut::with_capacity(items.len() * 12);
    let mut read_length = 0u32;
    for item in items {
        data.put_u32_le(item.group);
        data.put_u32_le(item.offset);
        data.put_u32_le(item.length);
        read_length += 4 + item.length;
    }
    read_write(
        crate::protocol::index::SUMUP_READ,
        items.len() as u32,
        read_length,
        &data.freeze(),
    )
}

/// One sub-request of a batched sum-write.
#[derive(Clone, Debug)]
pub struct SumWriteItem {
    pub group: u32,
    pub offset: u32,
    pub data: Bytes,
}

/// Batched writes in a single ReadWrite round trip. The response carries one
/// u32 result per sub-request.
pub fn sum_write(items: &[SumWriteItem]) -> Bytes {
    let headers_len = items.len() * 12;
    let data_len: usize = items.iter().map(|i| i.data.len()).sum();
    let mut data = BytesMut::with_capacity(headers_len + data_len);
    for item in items {
        data.put_u32_le(item.group);
        data.put_u32_le(item.offset);
        data.put_u32_le(item.data.len() as u32);
    }
    for item in items {
        data.put_slice(&item.data);
    }
    read_write(
        crate::protocol::index::SUMUP_WRITE,
        items.len() as u32,
        (items.len() * 4) as u32,
        &data.freeze(),
    )
}
