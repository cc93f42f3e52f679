//! ADS command identifiers.

use serde::{Deserialize, Serialize};

/// Command id field of the AMS header.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[repr(u16)]
pub enum CommandId {
    /// Read name and version of the target device.
    ReadDeviceInfo = 0x01,
    /// Read data addressed by index group/offset.
    Read = 0x02,
    /// Write data addressed by index group/offset.
    Write = 0x03,
    /// Read the ADS and device state of the target.
    ReadState = 0x04,
    /// Change the ADS and device state of the target.
    WriteControl = 0x05,
    /// Register a device notification.
    AddDeviceNotification = 0x06,
    /// Remove a device notification.
    DeleteDeviceNotification = 0x07,
    /// Server-initiated notification delivery.
    DeviceNotification = 0x08,
    /// Combined write-then-read in one round trip.
    ReadWrite = 0x09,
}

impl CommandId {
    pub fn from_u16(raw: u16) -> Option<Self> {
        Some(match raw {
            0x01 => CommandId::ReadDeviceInfo,
            0x02 => CommandId::Read,
            0x03 => CommandId::Write,
            0x04 => CommandId::ReadState,
            0x05 => CommandId::WriteControl,
            0x06 => CommandId::AddDeviceNotification,
            0x07 => CommandId::DeleteDeviceNotification,
            0x08 => CommandId::DeviceNotification,
            0x09 => CommandId::ReadWrite,
            _ => return None,
        })
    }

    #[inline]
    pub fn as_u16(&self) -> u16 {
        *self as u16
    }
}
