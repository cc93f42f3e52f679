//! Typed ADS command dispatcher.
//!
//! [`Client`] is a cheap handle over one [`Session`]. Every operation builds
//! its request, awaits the response slot, checks the header error code and the
//! body result code, and returns the typed response. Reads, device info and
//! state reads are idempotent; writes and read-writes are never retried here.

use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;

use crate::protocol::command::CommandId;
use crate::protocol::error::{AdsErrorCode, Error, Result};
use crate::protocol::frame::{request, response, AmsFrame};
use crate::protocol::index;
use crate::protocol::session::Session;
use crate::protocol::types::{AmsAddr, TransmissionMode};

pub use crate::protocol::frame::request::{SumReadItem, SumWriteItem};
pub use crate::protocol::frame::response::{DeviceInfo, StateResponse, SumReadResult};

/// Notification subscription parameters in wall-clock units.
#[derive(Clone, Copy, Debug)]
pub struct NotificationRequest {
    pub group: u32,
    pub offset: u32,
    pub length: u32,
    pub mode: TransmissionMode,
    pub max_delay: Duration,
    pub cycle_time: Duration,
}

/// Typed command surface over one ADS session.
#[derive(Clone, Debug)]
pub struct Client {
    session: Arc<Session>,
}

impl Client {
    pub fn new(session: Arc<Session>) -> Self {
        Self { session }
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    /// Default target from the session config.
    pub fn target(&self) -> AmsAddr {
        self.session.config().target_addr
    }

    /// Default unary deadline from the session config.
    fn unary_timeout(&self) -> Duration {
        self.session.config().request_timeout
    }

    /// Issue a command and check the header-level error code.
    async fn exchange(
        &self,
        target: AmsAddr,
        command: CommandId,
        payload: Bytes,
        timeout: Duration,
    ) -> Result<AmsFrame> {
        let frame = self
            .session
            .request(target, command, payload, timeout)
            .await?;
        let code = AdsErrorCode::from_u32(frame.header.error_code);
        if !code.is_ok() {
            return Err(Error::Device { code, command });
        }
        if frame.header.command != command {
            return Err(Error::UnexpectedResponse {
                context: "response command id differs from request",
            });
        }
        Ok(frame)
    }

    /// Read name, version and build of the device behind `target`.
    pub async fn read_device_info(&self, target: AmsAddr) -> Result<DeviceInfo> {
        let frame = self
            .exchange(
                target,
                CommandId::ReadDeviceInfo,
                request::empty(),
                self.unary_timeout(),
            )
            .await?;
        DeviceInfo::decode(&frame.payload)
    }

    /// Read `length` bytes at `(group, offset)` on `target`.
    pub async fn read(&self, target: AmsAddr, group: u32, offset: u32, length: u32) -> Result<Bytes> {
        let frame = self
            .exchange(
                target,
                CommandId::Read,
                request::read(group, offset, length),
                self.unary_timeout(),
            )
            .await?;
        response::decode_read(&frame.payload)
    }

    /// Like [`Client::read`] with a caller-chosen deadline (introspection
    /// phases use the longer one).
    pub async fn read_with_timeout(
        &self,
        target: AmsAddr,
        group: u32,
        offset: u32,
        length: u32,
        timeout: Duration,
    ) -> Result<Bytes> {
        let frame = self
            .exchange(
                target,
                CommandId::Read,
                request::read(group, offset, length),
                timeout,
            )
            .await?;
        response::decode_read(&frame.payload)
    }

    /// Write `data` at `(group, offset)` on `target`.
    pub async fn write(&self, target: AmsAddr, group: u32, offset: u32, data: &[u8]) -> Result<()> {
        let frame = self
            .exchange(
                target,
                CommandId::Write,
                request::write(group, offset, data),
                self.unary_timeout(),
            )
            .await?;
        response::decode_write(&frame.payload)
    }

    /// Read the ADS and device state of `target`.
    pub async fn read_state(&self, target: AmsAddr) -> Result<StateResponse> {
        let frame = self
            .exchange(
                target,
                CommandId::ReadState,
                request::empty(),
                self.unary_timeout(),
            )
            .await?;
        StateResponse::decode(&frame.payload)
    }

    /// Move `target` to `(ads_state, device_state)`.
    pub async fn write_control(
        &self,
        target: AmsAddr,
        ads_state: u16,
        device_state: u16,
        data: &[u8],
    ) -> Result<()> {
        let frame = self
            .exchange(
                target,
                CommandId::WriteControl,
                request::write_control(ads_state, device_state, data),
                self.unary_timeout(),
            )
            .await?;
        response::decode_write_control(&frame.payload)
    }

    /// Combined write-then-read at `(group, offset)` on `target`.
    pub async fn read_write(
        &self,
        target: AmsAddr,
        group: u32,
        offset: u32,
        read_length: u32,
        write_data: &[u8],
    ) -> Result<Bytes> {
        let frame = self
            .exchange(
                target,
                CommandId::ReadWrite,
                request::read_write(group, offset, read_length, write_data),
                self.unary_timeout(),
            )
            .await?;
        response::decode_read_write(&frame.payload)
    }

    /// Register a device notification, returning the server-assigned handle.
    pub async fn add_device_notification(
        &self,
        target: AmsAddr,
        req: NotificationRequest,
    ) -> Result<u32> {
        let frame = self
            .exchange(
                target,
                CommandId::AddDeviceNotification,
                request::add_notification(
                    req.group,
                    req.offset,
                    req.length,
                    req.mode,
                    req.max_delay,
                    req.cycle_time,
                ),
                self.unary_timeout(),
            )
            .await?;
        response::decode_add_notification(&frame.payload)
    }

    /// Remove a device notification by handle.
    pub async fn delete_device_notification(&self, target: AmsAddr, handle: u32) -> Result<()> {
        let frame = self
            .exchange(
                target,
                CommandId::DeleteDeviceNotification,
                request::delete_notification(handle),
                self.unary_timeout(),
            )
            .await?;
        response::decode_delete_notification(&frame.payload)
    }

    /// Batched reads in one round trip; results align with `items`.
    pub async fn sum_read(
        &self,
        target: AmsAddr,
        items: &[SumReadItem],
    ) -> Result<Vec<SumReadResult>> {
        if items.is_empty() {
            return Ok(Vec::new());
        }
        let frame = self
            .exchange(
                target,
                CommandId::ReadWrite,
                request::sum_read(items),
                self.unary_timeout(),
            )
            .await?;
        let data = response::decode_read_write(&frame.payload)?;
        let lengths: Vec<u32> = items.iter().map(|i| i.length).collect();
        response::split_sum_read(&data, &lengths)
    }

    /// Batched writes in one round trip; one result code per item.
    pub async fn sum_write(
        &self,
        target: AmsAddr,
        items: &[SumWriteItem],
    ) -> Result<Vec<AdsErrorCode>> {
        if items.is_empty() {
            return Ok(Vec::new());
        }
        let frame = self
            .exchange(
                target,
                CommandId::ReadWrite,
                request::sum_write(items),
                self.unary_timeout(),
            )
            .await?;
        let data = response::decode_read_write(&frame.payload)?;
        response::split_sum_write(&data, items.len())
    }

    /// Resolve a symbol handle for `name` on the default target.
    pub async fn handle_by_name(&self, name: &str) -> Result<u32> {
        let frame = self
            .exchange(
                self.target(),
                CommandId::ReadWrite,
                request::handle_by_name(name),
                self.unary_timeout(),
            )
            .await?;
        let data = response::decode_read_write(&frame.payload)?;
        if data.len() < 4 {
            return Err(Error::Frame {
                context: "symbol handle response shorter than 4 bytes",
            });
        }
        Ok(u32::from_le_bytes([data[0], data[1], data[2], data[3]]))
    }

    /// Release a symbol handle on the default target.
    pub async fn release_handle(&self, handle: u32) -> Result<()> {
        let frame = self
            .exchange(
                self.target(),
                CommandId::Write,
                request::release_handle(handle),
                self.unary_timeout(),
            )
            .await?;
        response::decode_write(&frame.payload)
    }

    /// Read a symbol value through a previously resolved handle.
    pub async fn read_by_handle(&self, handle: u32, length: u32) -> Result<Bytes> {
        self.read(self.target(), index::SYM_VALUE_BY_HANDLE, handle, length)
            .await
    }

    /// Write a symbol value through a previously resolved handle.
    pub async fn write_by_handle(&self, handle: u32, data: &[u8]) -> Result<()> {
        self.write(self.target(), index::SYM_VALUE_BY_HANDLE, handle, data)
            .await
    }
}
