//! EtherCAT topology reconstruction.
//!
//! The I/O server exposes its devices through the 0x5000 window on port 300;
//! each device is itself an ADS endpoint whose EtherCAT master answers on
//! port 0xFFFF. The introspector runs the scripted command sequence against
//! both and composes the result into plain records: one [`IoServer`], its
//! [`IoDevice`]s, and per device a flat arena of [`IoSlave`]s whose coupler
//! hierarchy is expressed with indices, not references.

use bytes::Bytes;
use serde::Serialize;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::client::Client;
use crate::protocol::error::{Error, Result};
use crate::protocol::frame::response::decode_device_string;
use crate::protocol::index;
use crate::protocol::types::{AmsAddr, AmsNetId, ECAT_MASTER_PORT, IO_SERVER_PORT};

fn u16_at(buf: &[u8], at: usize) -> Result<u16> {
    if buf.len() < at + 2 {
        return Err(Error::Frame {
            context: "topology record truncated at u16",
        });
    }
    Ok(u16::from_le_bytes([buf[at], buf[at + 1]]))
}

fn u32_at(buf: &[u8], at: usize) -> Result<u32> {
    if buf.len() < at + 4 {
        return Err(Error::Frame {
            context: "topology record truncated at u32",
        });
    }
    Ok(u32::from_le_bytes([
        buf[at],
        buf[at + 1],
        buf[at + 2],
        buf[at + 3],
    ]))
}

/// CANopen identity object of a device or slave.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Identity {
    pub vendor_id: u32,
    pub product_code: u32,
    pub revision_number: u32,
    pub serial_number: u32,
}

impl Identity {
    /// Four u32 fields, 16 bytes.
    pub fn decode(raw: &[u8]) -> Result<Self> {
        Ok(Self {
            vendor_id: u32_at(raw, 0)?,
            product_code: u32_at(raw, 4)?,
            revision_number: u32_at(raw, 8)?,
            serial_number: u32_at(raw, 12)?,
        })
    }
}

/// Cyclic and acyclic frame counters of an EtherCAT master.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FrameCounters {
    pub time: u32,
    pub cyclic_sent: u32,
    pub cyclic_lost: u32,
    pub acyclic_sent: u32,
    pub acyclic_lost: u32,
}

impl FrameCounters {
    /// Five u32 fields, 20 bytes.
    pub fn decode(raw: &[u8]) -> Result<Self> {
        Ok(Self {
            time: u32_at(raw, 0)?,
            cyclic_sent: u32_at(raw, 4)?,
            cyclic_lost: u32_at(raw, 8)?,
            acyclic_sent: u32_at(raw, 12)?,
            acyclic_lost: u32_at(raw, 16)?,
        })
    }
}

/// Per-port CRC error counters of a slave. Unused ports read as zero.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SlaveCrc {
    pub port_a: u32,
    pub port_b: u32,
    pub port_c: u32,
    pub port_d: u32,
}

impl SlaveCrc {
    /// Up to four u32 counters; short responses pad with zero.
    pub fn decode(raw: &[u8]) -> Self {
        let mut padded = [0u8; 16];
        let n = raw.len().min(16);
        padded[..n].copy_from_slice(&raw[..n]);
        Self {
            port_a: u32::from_le_bytes(padded[0..4].try_into().unwrap()),
            port_b: u32::from_le_bytes(padded[4..8].try_into().unwrap()),
            port_c: u32::from_le_bytes(padded[8..12].try_into().unwrap()),
            port_d: u32::from_le_bytes(padded[12..16].try_into().unwrap()),
        }
    }
}

/// EtherCAT state machine value and link status of a slave.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SlaveStatus {
    pub ecat_state: u8,
    pub link_status: u8,
}

impl SlaveStatus {
    pub fn decode(raw: &[u8]) -> Result<Self> {
        if raw.len() < 2 {
            return Err(Error::Frame {
                context: "slave status shorter than 2 bytes",
            });
        }
        Ok(Self {
            ecat_state: raw[0],
            link_status: raw[1],
        })
    }
}

/// Position of a slave in the wired chain: coupler node and offset within it.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChainLocation {
    pub node: u32,
    pub position: u32,
}

/// One slave terminal on a device.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IoSlave {
    /// CANopen type string, e.g. `EL1014`.
    pub type_name: String,
    /// CANopen name string; blank names become `Term <address>`.
    pub name: String,
    /// Fixed EtherCAT address.
    pub address: u16,
    /// Index of this slave in the device arena, equal to its chain order.
    pub position: usize,
    pub identity: Identity,
    /// Address of the coupler this slave hangs off, 0 for the device root.
    pub parent_address: u16,
    /// Arena index of the parent coupler, `None` when parented to the root.
    pub parent: Option<usize>,
    /// Set when `parent_address` named a slave the device does not have; the
    /// slave is then linked under the root.
    pub orphaned: bool,
    pub location: ChainLocation,
    pub status: SlaveStatus,
    /// Summed CRC error counter as reported by the device-level list.
    pub crc_counter: u32,
}

impl IoSlave {
    /// Couplers start a new node in the chain and parent the terminals that
    /// follow them.
    pub fn is_coupler(&self) -> bool {
        self.type_name.starts_with("EK11") || self.type_name.starts_with("EK12")
    }
}

/// One EtherCAT master device registered on the I/O server.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IoDevice {
    pub id: u16,
    /// Numeric device type code (EtherCAT masters report 94).
    pub device_type: u16,
    pub name: String,
    pub net_id: AmsNetId,
    pub identity: Identity,
    pub slave_count: u16,
    pub frame_counters: FrameCounters,
    /// One summed CRC counter per slave, in chain order.
    pub slave_crc_counters: Vec<u32>,
    pub slaves: Vec<IoSlave>,
}

impl IoDevice {
    /// AMS address of this device's EtherCAT master.
    pub fn master_addr(&self) -> AmsAddr {
        AmsAddr::new(self.net_id, ECAT_MASTER_PORT)
    }

    pub fn slave_by_address(&self, address: u16) -> Option<&IoSlave> {
        self.slaves.iter().find(|s| s.address == address)
    }
}

/// Root record of the topology.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IoServer {
    pub name: String,
    pub version: String,
    pub build: u16,
    pub device_count: u32,
}

/// The reconstructed tree: server plus devices plus their slave arenas.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Topology {
    pub server: IoServer,
    pub devices: Vec<IoDevice>,
}

impl Topology {
    pub fn device(&self, id: u16) -> Option<&IoDevice> {
        self.devices.iter().find(|d| d.id == id)
    }

    pub fn device_mut(&mut self, id: u16) -> Option<&mut IoDevice> {
        self.devices.iter_mut().find(|d| d.id == id)
    }
}

/// Scripted topology scanner over a [`Client`].
#[derive(Clone, Debug)]
pub struct Introspector {
    client: Client,
    /// I/O server endpoint (port 300 on the target).
    server_addr: AmsAddr,
    timeout: Duration,
}

impl Introspector {
    pub fn new(client: Client) -> Self {
        let server_addr = client.target().with_port(IO_SERVER_PORT);
        let timeout = client.session().config().introspect_timeout;
        Self {
            client,
            server_addr,
            timeout,
        }
    }

    async fn read_server(&self, group: u32, offset: u32, length: u32) -> Result<Bytes> {
        self.client
            .read_with_timeout(self.server_addr, group, offset, length, self.timeout)
            .await
    }

    async fn read_master(
        &self,
        net_id: AmsNetId,
        group: u32,
        offset: u32,
        length: u32,
    ) -> Result<Bytes> {
        self.client
            .read_with_timeout(
                AmsAddr::new(net_id, ECAT_MASTER_PORT),
                group,
                offset,
                length,
                self.timeout,
            )
            .await
    }

    /// Server name, version and device count.
    pub async fn read_server_info(&self) -> Result<IoServer> {
        let info = self.client.read_device_info(self.server_addr).await?;
        let count_raw = self
            .read_server(
                index::IO_DEVICE_STATE_BASE,
                index::IO_DEVICE_OFFSET_COUNT,
                4,
            )
            .await?;
        let device_count = u32_at(&count_raw, 0)?;
        Ok(IoServer {
            name: info.name.clone(),
            version: info.version(),
            build: info.build,
            device_count,
        })
    }

    /// Registered device ids; the response repeats the count first.
    pub async fn device_ids(&self, expected: u32) -> Result<Vec<u16>> {
        let raw = self
            .read_server(
                index::IO_DEVICE_STATE_BASE,
                index::IO_DEVICE_OFFSET_IDS,
                2 + 2 * expected.max(1),
            )
            .await?;
        let count = u16_at(&raw, 0)? as u32;
        if count != expected {
            return Err(Error::UnexpectedResponse {
                context: "device id list count disagrees with device count",
            });
        }
        let mut ids = Vec::with_capacity(count as usize);
        for i in 0..count as usize {
            ids.push(u16_at(&raw, 2 + 2 * i)?);
        }
        Ok(ids)
    }

    async fn device_field(&self, id: u16, offset: u32, length: u32) -> Result<Bytes> {
        self.read_server(index::IO_DEVICE_STATE_BASE + id as u32, offset, length)
            .await
    }

    /// CANopen identity assembled from the four 0x1018 subindex reads.
    pub async fn device_identity(&self, net_id: AmsNetId) -> Result<Identity> {
        let mut raw = Vec::with_capacity(16);
        for subindex in 1..=4u8 {
            let chunk = self
                .read_master(
                    net_id,
                    index::COE_LINK,
                    index::coe_offset(index::COE_IDENTITY_INDEX, subindex),
                    4,
                )
                .await?;
            raw.extend_from_slice(&chunk);
        }
        Identity::decode(&raw)
    }

    pub async fn frame_counters(&self, net_id: AmsNetId) -> Result<FrameCounters> {
        let raw = self
            .read_master(net_id, index::MASTER_FRAME_COUNTERS, 0, 20)
            .await?;
        FrameCounters::decode(&raw)
    }

    pub async fn slave_count(&self, net_id: AmsNetId) -> Result<u16> {
        let raw = self
            .read_master(net_id, index::MASTER_SLAVE_COUNT, 0, 2)
            .await?;
        u16_at(&raw, 0)
    }

    /// Summed CRC counter per slave, chain order.
    pub async fn slave_crc_counters(&self, net_id: AmsNetId, count: u16) -> Result<Vec<u32>> {
        if count == 0 {
            return Ok(Vec::new());
        }
        let raw = self
            .read_master(net_id, index::SLAVE_CRC_COUNTERS, 0, 4 * count as u32)
            .await?;
        (0..count as usize).map(|i| u32_at(&raw, 4 * i)).collect()
    }

    /// Per-port CRC counters of one slave.
    pub async fn slave_crc(&self, net_id: AmsNetId, address: u16) -> Result<SlaveCrc> {
        let raw = self
            .read_master(net_id, index::SLAVE_CRC_COUNTERS, address as u32, 16)
            .await?;
        Ok(SlaveCrc::decode(&raw))
    }

    pub async fn slave_addresses(&self, net_id: AmsNetId, count: u16) -> Result<Vec<u16>> {
        if count == 0 {
            return Ok(Vec::new());
        }
        let raw = self
            .read_master(net_id, index::MASTER_SLAVE_ADDRESSES, 0, 2 * count as u32)
            .await?;
        (0..count as usize).map(|i| u16_at(&raw, 2 * i)).collect()
    }

    pub async fn slave_identity(&self, net_id: AmsNetId, address: u16) -> Result<Identity> {
        let raw = self
            .read_master(net_id, index::MASTER_SLAVE_IDENTITY, address as u32, 16)
            .await?;
        Identity::decode(&raw)
    }

    /// CANopen type string of the slave at `chain_index`.
    pub async fn slave_type(&self, net_id: AmsNetId, chain_index: u16) -> Result<String> {
        let raw = self
            .read_master(
                net_id,
                index::COE_LINK,
                index::coe_offset(
                    index::COE_OPERATIONAL_PARAMS_BASE + chain_index,
                    index::COE_SUBINDEX_TYPE,
                ),
                32,
            )
            .await?;
        Ok(decode_device_string(&raw))
    }

    /// CANopen name string of the slave at `chain_index`.
    pub async fn slave_name(&self, net_id: AmsNetId, chain_index: u16) -> Result<String> {
        let raw = self
            .read_master(
                net_id,
                index::COE_LINK,
                index::coe_offset(
                    index::COE_OPERATIONAL_PARAMS_BASE + chain_index,
                    index::COE_SUBINDEX_NAME,
                ),
                32,
            )
            .await?;
        Ok(decode_device_string(&raw))
    }

    pub async fn slave_status(&self, net_id: AmsNetId, address: u16) -> Result<SlaveStatus> {
        let raw = self
            .read_master(net_id, index::SLAVE_STATE_MACHINE, address as u32, 2)
            .await?;
        SlaveStatus::decode(&raw)
    }

    /// `(state, link)` pairs for every slave in chain order (offset 0 form).
    pub async fn all_slave_statuses(&self, net_id: AmsNetId, count: u16) -> Result<Vec<SlaveStatus>> {
        if count == 0 {
            return Ok(Vec::new());
        }
        let raw = self
            .read_master(net_id, index::SLAVE_STATE_MACHINE, 0, 2 * count as u32)
            .await?;
        (0..count as usize)
            .map(|i| SlaveStatus::decode(&raw[2 * i..]))
            .collect()
    }

    /// Run the full scripted scan and compose the tree.
    pub async fn introspect(&self) -> Result<Topology> {
        let server = self.read_server_info().await?;
        info!(
            name = %server.name,
            version = %server.version,
            build = server.build,
            devices = server.device_count,
            "introspecting I/O server"
        );

        let ids = self.device_ids(server.device_count).await?;
        debug!(?ids, "device ids");

        let mut devices = Vec::with_capacity(ids.len());
        for id in ids {
            let name_raw = self
                .device_field(id, index::IO_DEVICE_OFFSET_NAME, 64)
                .await?;
            let name = decode_device_string(&name_raw);
            let netid_raw = self
                .device_field(id, index::IO_DEVICE_OFFSET_NETID, 6)
                .await?;
            let net_id = AmsNetId::from_slice(&netid_raw[..6.min(netid_raw.len())])?;
            let type_raw = self
                .device_field(id, index::IO_DEVICE_OFFSET_TYPE, 2)
                .await?;
            let device_type = u16_at(&type_raw, 0)?;

            let identity = self.device_identity(net_id).await?;
            let frame_counters = self.frame_counters(net_id).await?;
            let slave_count = self.slave_count(net_id).await?;
            let slave_crc_counters = self.slave_crc_counters(net_id, slave_count).await?;
            let addresses = self.slave_addresses(net_id, slave_count).await?;

            let mut slaves = Vec::with_capacity(slave_count as usize);
            for (chain_index, address) in addresses.iter().copied().enumerate() {
                let identity = self.slave_identity(net_id, address).await?;
                let type_name = self.slave_type(net_id, chain_index as u16).await?;
                let mut name = self.slave_name(net_id, chain_index as u16).await?;
                if name.trim().is_empty() {
                    name = format!("Term {address}");
                }
                let status = self.slave_status(net_id, address).await?;
                slaves.push(IoSlave {
                    type_name,
                    name,
                    address,
                    position: chain_index,
                    identity,
                    parent_address: 0,
                    parent: None,
                    orphaned: false,
                    location: ChainLocation::default(),
                    status,
                    crc_counter: slave_crc_counters.get(chain_index).copied().unwrap_or(0),
                });
            }
            compose_chain(&mut slaves);

            let device = IoDevice {
                id,
                device_type,
                name,
                net_id,
                identity,
                slave_count,
                frame_counters,
                slave_crc_counters,
                slaves,
            };
            debug!(
                id = device.id,
                name = %device.name,
                net_id = %device.net_id,
                slaves = device.slave_count,
                "introspected device"
            );
            devices.push(device);
        }

        Ok(Topology { server, devices })
    }

    /// Re-read EtherCAT states of every slave, mutating the records in place.
    pub async fn refresh_states(&self, topology: &mut Topology) -> Result<()> {
        for device in &mut topology.devices {
            let statuses = self
                .all_slave_statuses(device.net_id, device.slave_count)
                .await?;
            for (slave, status) in device.slaves.iter_mut().zip(statuses) {
                if slave.status != status {
                    warn!(
                        slave = %slave.name,
                        state = status.ecat_state,
                        link = status.link_status,
                        "slave status changed"
                    );
                    slave.status = status;
                }
            }
        }
        Ok(())
    }

    /// Re-read frame counters of every device, mutating the records in place.
    pub async fn refresh_frame_counters(&self, topology: &mut Topology) -> Result<()> {
        for device in &mut topology.devices {
            device.frame_counters = self.frame_counters(device.net_id).await?;
        }
        Ok(())
    }

    /// Re-read summed CRC counters; returns ids of devices whose counters
    /// changed since the last scan.
    pub async fn refresh_crc_counters(&self, topology: &mut Topology) -> Result<Vec<u16>> {
        let mut changed = Vec::new();
        for device in &mut topology.devices {
            let counters = self
                .slave_crc_counters(device.net_id, device.slave_count)
                .await?;
            if counters != device.slave_crc_counters {
                warn!(device = %device.name, "slave CRC counters changed");
                for (slave, counter) in device.slaves.iter_mut().zip(counters.iter()) {
                    slave.crc_counter = *counter;
                }
                device.slave_crc_counters = counters;
                changed.push(device.id);
            }
        }
        Ok(changed)
    }

    /// Command a device to reset its frame and lost-frame counters.
    pub async fn reset_frame_counters(&self, device: &IoDevice) -> Result<()> {
        self.client
            .write(device.master_addr(), index::MASTER_FRAME_COUNTERS, 0, &[])
            .await
    }
}

/// Link every slave to its coupler and assign chain locations.
///
/// Couplers parent to the device root and open a new node; terminals parent
/// to the coupler most recently seen before them. A slave carrying a parent
/// address with no match in the arena falls back to the root and is flagged.
pub fn compose_chain(slaves: &mut [IoSlave]) {
    derive_parent_addresses(slaves);
    resolve_chain(slaves);
}

/// Derive parent addresses from chain order.
fn derive_parent_addresses(slaves: &mut [IoSlave]) {
    let mut last_coupler: Option<u16> = None;
    for slave in slaves.iter_mut() {
        if slave.is_coupler() {
            slave.parent_address = 0;
            last_coupler = Some(slave.address);
        } else {
            slave.parent_address = last_coupler.unwrap_or(0);
        }
    }
}

/// Resolve parent addresses to arena indices and assign chain locations.
pub(crate) fn resolve_chain(slaves: &mut [IoSlave]) {
    let mut node = 0u32;
    let mut node_position = 0u32;
    for i in 0..slaves.len() {
        if slaves[i].is_coupler() {
            node += 1;
            node_position = 0;
        }
        slaves[i].location = ChainLocation {
            node,
            position: node_position,
        };
        node_position += 1;

        let parent_address = slaves[i].parent_address;
        if parent_address == 0 {
            slaves[i].parent = None;
            continue;
        }
        match slaves
            .iter()
            .position(|s| s.address == parent_address && s.is_coupler())
        {
            Some(parent_index) => slaves[i].parent = Some(parent_index),
            None => {
                warn!(
                    address = slaves[i].address,
                    parent_address, "slave parent not present, linking under device root"
                );
                slaves[i].parent = None;
                slaves[i].orphaned = true;
            }
        }
    }
}
