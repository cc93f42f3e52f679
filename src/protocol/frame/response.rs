//! Typed response bodies and their decoders.
//!
//! Every response opens with a u32 result code. Decoders return
//! [`Error::Device`] when it is non-zero, so callers only ever see a typed
//! body for a successful exchange.

use bytes::Bytes;
use serde::Serialize;

use crate::protocol::command::CommandId;
use crate::protocol::error::{AdsErrorCode, Error, Result};
use crate::protocol::types::AdsState;

fn need(buf: &[u8], len: usize, context: &'static str) -> Result<()> {
    if buf.len() < len {
        return Err(Error::Frame { context });
    }
    Ok(())
}

fn u16_at(buf: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([buf[at], buf[at + 1]])
}

fn u32_at(buf: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]])
}

/// Check the leading result code, failing with the originating command.
fn take_result(buf: &[u8], command: CommandId) -> Result<()> {
    need(buf, 4, "response missing result code")?;
    let code = AdsErrorCode::from_u32(u32_at(buf, 0));
    if code.is_ok() {
        Ok(())
    } else {
        Err(Error::Device { code, command })
    }
}

/// Name and version of an ADS device.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceInfo {
    pub major_version: u8,
    pub minor_version: u8,
    pub build: u16,
    pub name: String,
}

impl DeviceInfo {
    /// `result u32, major u8, minor u8, build u16, name [u8;16]`.
    pub fn decode(payload: &Bytes) -> Result<Self> {
        take_result(payload, CommandId::ReadDeviceInfo)?;
        need(payload, 24, "device info response truncated")?;
        Ok(Self {
            major_version: payload[4],
            minor_version: payload[5],
            build: u16_at(payload, 6),
            name: decode_device_string(&payload[8..24]),
        })
    }

    /// Dotted `major-minor` form used in the server record.
    pub fn version(&self) -> String {
        format!("{}-{}", self.major_version, self.minor_version)
    }
}

/// Read response: `result u32, length u32, data`.
pub fn decode_read(payload: &Bytes) -> Result<Bytes> {
    take_result(payload, CommandId::Read)?;
    need(payload, 8, "read response truncated")?;
    let length = u32_at(payload, 4) as usize;
    need(payload, 8 + length, "read response shorter than its length")?;
    Ok(payload.slice(8..8 + length))
}

/// Write response: `result u32`.
pub fn decode_write(payload: &Bytes) -> Result<()> {
    take_result(payload, CommandId::Write)
}

/// WriteControl response: `result u32`.
pub fn decode_write_control(payload: &Bytes) -> Result<()> {
    take_result(payload, CommandId::WriteControl)
}

/// ReadState response body.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StateResponse {
    pub ads_state: AdsState,
    pub device_state: u16,
}

impl StateResponse {
    /// `result u32, ads_state u16, device_state u16`.
    pub fn decode(payload: &Bytes) -> Result<Self> {
        take_result(payload, CommandId::ReadState)?;
        need(payload, 8, "read state response truncated")?;
        Ok(Self {
            ads_state: AdsState::from_u16(u16_at(payload, 4)),
            device_state: u16_at(payload, 6),
        })
    }
}

/// AddDeviceNotification response: `result u32, handle u32`.
pub fn decode_add_notification(payload: &Bytes) -> Result<u32> {
    take_result(payload, CommandId::AddDeviceNotification)?;
    need(payload, 8, "add notification response truncated")?;
    Ok(u32_at(payload, 4))
}

/// DeleteDeviceNotification response: `result u32`.
pub fn decode_delete_notification(payload: &Bytes) -> Result<()> {
    take_result(payload, CommandId::DeleteDeviceNotification)
}

/// ReadWrite response: `result u32, length u32, data`.
pub fn decode_read_write(payload: &Bytes) -> Result<Bytes> {
    take_result(payload, CommandId::ReadWrite)?;
    need(payload, 8, "read-write response truncated")?;
    let length = u32_at(payload, 4) as usize;
    need(
        payload,
        8 + length,
        "read-write response shorter than its length",
    )?;
    Ok(payload.slice(8..8 + length))
}

/// One result of a batched sum-read: per-item code and data slice.
#[derive(Clone, Debug)]
pub struct SumReadResult {
    pub code: AdsErrorCode,
    pub data: Option<Bytes>,
}

/// Split a sum-read response body: `count` u32 result codes, then the data of
/// every successful item concatenated in request order.
pub fn split_sum_read(data: &Bytes, lengths: &[u32]) -> Result<Vec<SumReadResult>> {
    let codes_len = lengths.len() * 4;
    need(data, codes_len, "sum read response truncated")?;
    let mut results = Vec::with_capacity(lengths.len());
    let mut cursor = codes_len;
    for (i, length) in lengths.iter().enumerate() {
        let code = AdsErrorCode::from_u32(u32_at(data, i * 4));
        let length = *length as usize;
        let payload = if code.is_ok() {
            need(data, cursor + length, "sum read data truncated")?;
            let slice = data.slice(cursor..cursor + length);
            cursor += length;
            Some(slice)
        } else {
            None
        };
        results.push(SumReadResult {
            code,
            data: payload,
        });
    }
    Ok(results)
}

/// Split a sum-write response body into per-item result codes.
pub fn split_sum_write(data: &Bytes, count: usize) -> Result<Vec<AdsErrorCode>> {
    need(data, count * 4, "sum write response truncated")?;
    Ok((0..count)
        .map(|i| AdsErrorCode::from_u32(u32_at(data, i * 4)))
        .collect())
}

/// Device strings are NUL-padded, cp1252-compatible byte arrays; anything
/// beyond ASCII is preserved lossily.
pub fn decode_device_string(raw: &[u8]) -> String {
    let end = raw.iter().position(|b| *b == 0).unwrap_or(raw.len());
    String::from_utf8_lossy(&raw[..end]).into_owned()
}
