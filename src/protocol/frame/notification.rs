//! Device notification stream decoding.
//!
//! A notification payload carries one or more stamps, each with a FILETIME
//! timestamp and a run of `(handle, size, data)` samples. Sample data stays an
//! opaque `Bytes` slice here; value decoding happens at the subscriber.

use bytes::Bytes;
use chrono::{DateTime, TimeZone, Utc};

use crate::protocol::error::{Error, Result};

/// 100 ns ticks between 1601-01-01 and the Unix epoch.
const FILETIME_UNIX_OFFSET: u64 = 116_444_736_000_000_000;

/// One tagged sample inside a stamp.
#[derive(Clone, Debug)]
pub struct NotificationSample {
    pub handle: u32,
    pub data: Bytes,
}

/// A run of samples that share a server timestamp.
#[derive(Clone, Debug)]
pub struct NotificationStamp {
    /// Raw FILETIME value (100 ns ticks since 1601-01-01).
    pub timestamp_raw: u64,
    pub samples: Vec<NotificationSample>,
}

impl NotificationStamp {
    /// Server timestamp as UTC wall-clock time.
    pub fn timestamp(&self) -> DateTime<Utc> {
        filetime_to_datetime(self.timestamp_raw)
    }
}

/// Fully walked notification payload.
#[derive(Clone, Debug)]
pub struct NotificationStream {
    pub stamps: Vec<NotificationStamp>,
}

impl NotificationStream {
    /// Walk `length u32, stamp_count u32`, then per stamp
    /// `timestamp u64, sample_count u32` and per sample
    /// `handle u32, size u32, data [size]`.
    pub fn decode(payload: &Bytes) -> Result<Self> {
        if payload.len() < 8 {
            return Err(Error::Frame {
                context: "notification stream header truncated",
            });
        }
        let declared = u32::from_le_bytes([payload[0], payload[1], payload[2], payload[3]]) as usize;
        // declared length covers the stamp count field and everything after it
        if declared + 4 != payload.len() {
            return Err(Error::Frame {
                context: "notification stream length mismatch",
            });
        }
        let stamp_count =
            u32::from_le_bytes([payload[4], payload[5], payload[6], payload[7]]) as usize;

        let mut stamps = Vec::with_capacity(stamp_count);
        let mut at = 8usize;
        for _ in 0..stamp_count {
            if payload.len() < at + 12 {
                return Err(Error::Frame {
                    context: "notification stamp header truncated",
                });
            }
            let timestamp_raw = u64::from_le_bytes(payload[at..at + 8].try_into().unwrap());
            let sample_count =
                u32::from_le_bytes(payload[at + 8..at + 12].try_into().unwrap()) as usize;
            at += 12;

            let mut samples = Vec::with_capacity(sample_count);
            for _ in 0..sample_count {
                if payload.len() < at + 8 {
                    return Err(Error::Frame {
                        context: "notification sample header truncated",
                    });
                }
                let handle = u32::from_le_bytes(payload[at..at + 4].try_into().unwrap());
                let size = u32::from_le_bytes(payload[at + 4..at + 8].try_into().unwrap()) as usize;
                at += 8;
                if payload.len() < at + size {
                    return Err(Error::Frame {
                        context: "notification sample data truncated",
                    });
                }
                samples.push(NotificationSample {
                    handle,
                    data: payload.slice(at..at + size),
                });
                at += size;
            }
            stamps.push(NotificationStamp {
                timestamp_raw,
                samples,
            });
        }
        if at != payload.len() {
            return Err(Error::Frame {
                context: "trailing bytes after notification stream",
            });
        }
        Ok(Self { stamps })
    }

    /// Shape of the delivery: `(handle, size)` per sample, in stream order.
    /// Used to validate later deliveries of the same coalesced stream.
    pub fn template(&self) -> Vec<(u32, usize)> {
        self.stamps
            .iter()
            .flat_map(|s| s.samples.iter().map(|smp| (smp.handle, smp.data.len())))
            .collect()
    }
}

/// Convert a FILETIME value to UTC; values before the Unix epoch clamp to it.
pub fn filetime_to_datetime(raw: u64) -> DateTime<Utc> {
    let unix_ticks = raw.saturating_sub(FILETIME_UNIX_OFFSET);
    let secs = (unix_ticks / 10_000_000) as i64;
    let nanos = ((unix_ticks % 10_000_000) * 100) as u32;
    Utc.timestamp_opt(secs, nanos)
        .single()
        .unwrap_or_else(|| Utc.timestamp_opt(0, 0).unwrap())
}
