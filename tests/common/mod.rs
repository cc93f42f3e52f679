//! In-process ADS simulation server for integration tests.
//!
//! Speaks the same wire contract as a TwinCAT host: AMS/TCP framing on an
//! ephemeral TCP port, the discovery/route service on an ephemeral UDP port,
//! a configurable EtherCAT chain behind the introspection index groups, a
//! symbol table built from terminal definitions, and a cyclic notification
//! streamer. Replies can be delayed per address and connections killed on
//! demand, so failure paths are scriptable.

#![allow(dead_code)]

use bytes::{BufMut, Bytes, BytesMut};
use futures::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Once};
use std::time::Duration;
use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::{mpsc, Mutex};
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::Level;

use catio_ads::client::Client;
use catio_ads::protocol::codec::AmsTcpCodec;
use catio_ads::protocol::command::CommandId;
use catio_ads::protocol::frame::{AmsFrame, AmsHeader};
use catio_ads::protocol::session::{self, Session, SessionConfig};
use catio_ads::protocol::types::{AmsAddr, AmsNetId, StateFlags, ECAT_MASTER_PORT, IO_SERVER_PORT};

static INIT_TRACING: Once = Once::new();

pub fn init_tracing() {
    INIT_TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_max_level(Level::DEBUG)
            .with_target(false)
            .without_time()
            .try_init();
    });
}

pub const SERVER_NET_ID: [u8; 6] = [10, 0, 0, 1, 3, 1];
pub const CLIENT_NET_ID: [u8; 6] = [10, 0, 0, 2, 1, 1];

// Index groups the simulator serves, mirroring the client's map.
const MASTER_STATE_MACHINE: u32 = 0x0003;
const MASTER_SLAVE_COUNT: u32 = 0x0006;
const MASTER_SLAVE_ADDRESSES: u32 = 0x0007;
const SLAVE_STATE_MACHINE: u32 = 0x0009;
const MASTER_FRAME_COUNTERS: u32 = 0x000C;
const MASTER_SLAVE_IDENTITY: u32 = 0x0011;
const SLAVE_CRC_COUNTERS: u32 = 0x0012;
const IO_DEVICE_STATE_BASE: u32 = 0x5000;
const SYM_HANDLE_BY_NAME: u32 = 0xF003;
const SYM_VALUE_BY_HANDLE: u32 = 0xF005;
const SYM_RELEASE_HANDLE: u32 = 0xF006;
const SYM_UPLOAD: u32 = 0xF00B;
const SYM_UPLOAD_INFO2: u32 = 0xF00F;
const SUMUP_READ: u32 = 0xF080;
const SUMUP_WRITE: u32 = 0xF081;
const COE_LINK: u32 = 0xF302;

const ERR_NOERROR: u32 = 0;
const ERR_INVALIDGRP: u32 = 0x702;
const ERR_INVALIDOFFSET: u32 = 0x703;
const ERR_INVALIDSIZE: u32 = 0x705;
const ERR_NOTIFYHNDINVALID: u32 = 0x714;

const UDP_COOKIE: u32 = 0x7114_6603;
const SVC_READ_SERVICE_INFO: u32 = 0x1;
const SVC_ADD_ROUTE: u32 = 0x6;
const SVC_DEL_ROUTE: u32 = 0xB001;
const SVC_RESPONSE: u32 = 0x8000_0000;

/// One symbol node served in the upload blob.
#[derive(Clone, Debug)]
pub struct SimSymbol {
    pub name: String,
    pub type_name: String,
    pub comment: String,
    pub ads_type: u32,
    pub index_group: u32,
    pub index_offset: u32,
    pub size: u32,
}

#[derive(Clone, Debug)]
pub struct SimSlave {
    pub type_name: String,
    pub name: String,
    pub address: u16,
    pub identity: [u32; 4],
    pub ecat_state: u8,
    pub link_status: u8,
    pub crc: [u32; 4],
}

impl SimSlave {
    pub fn new(type_name: &str, name: &str) -> Self {
        Self {
            type_name: type_name.to_string(),
            name: name.to_string(),
            address: 0,
            identity: [2, 0, 0, 0],
            ecat_state: 0x08,
            link_status: 0x00,
            crc: [0; 4],
        }
    }

    /// Symbols this terminal contributes, following the hardware naming.
    fn symbols(&self) -> Vec<SimSymbol> {
        let term = &self.name;
        let base = self.address as u32;
        match self.type_name.as_str() {
            "EL1014" | "EL1004" => (1..=4)
                .map(|ch| SimSymbol {
                    name: format!("{term}.Channel {ch}.Input"),
                    type_name: "BIT".into(),
                    comment: format!("{term} Channel {ch}.Input"),
                    ads_type: 33,
                    index_group: 0xF021,
                    index_offset: base * 32 + (ch - 1),
                    size: 1,
                })
                .collect(),
            "EL2024" | "EL2004" => (1..=4)
                .map(|ch| SimSymbol {
                    name: format!("{term}.Channel {ch}.Output"),
                    type_name: "BIT".into(),
                    comment: format!("{term} Channel {ch}.Output"),
                    ads_type: 33,
                    index_group: 0xF031,
                    index_offset: base * 32 + (ch - 1),
                    size: 1,
                })
                .collect(),
            "EL1502" => vec![SimSymbol {
                name: format!("{term}.CNT Inputs"),
                type_name: "CNT Inputs_TYPE".into(),
                comment: format!("{term} counter block"),
                ads_type: 65,
                index_group: 0xF030,
                index_offset: base * 64,
                size: 6,
            }],
            // A made-up terminal whose node carries a datatype code no client
            // maps; used to exercise the diagnostic path.
            "EL9999" => vec![SimSymbol {
                name: format!("{term}.Exotic"),
                type_name: "Exotic_TYPE".into(),
                comment: String::new(),
                ads_type: 99,
                index_group: 0xF030,
                index_offset: base * 64,
                size: 2,
            }],
            _ => Vec::new(),
        }
    }
}

#[derive(Clone, Debug)]
pub struct SimDevice {
    pub id: u16,
    pub name: String,
    pub device_type: u16,
    pub net_id: AmsNetId,
    pub identity: [u32; 4],
    pub frame_counters: [u32; 5],
    pub slaves: Vec<SimSlave>,
}

impl SimDevice {
    fn slave_by_address(&self, address: u16) -> Option<&SimSlave> {
        self.slaves.iter().find(|s| s.address == address)
    }

    /// Device-level symbols of the EtherCAT master process image.
    fn device_symbols(&self) -> Vec<SimSymbol> {
        let base = 0x5F0u32;
        let mk = |name: &str, group: u32, shift: u32, type_name: &str, ads_type: u32, size: u32| {
            SimSymbol {
                name: format!("{}.{}", self.name, name),
                type_name: type_name.into(),
                comment: format!("{} symbol of the EtherCAT master", name),
                ads_type,
                index_group: group,
                index_offset: base + shift,
                size,
            }
        };
        vec![
            mk("Inputs", 0xF030, 0, "Inputs_TYPE", 65, 16),
            mk("Outputs", 0xF020, 0, "Outputs_TYPE", 65, 6),
        ]
    }

    fn all_symbols(&self) -> Vec<SimSymbol> {
        let mut symbols = self.device_symbols();
        for slave in &self.slaves {
            symbols.extend(slave.symbols());
        }
        symbols
    }
}

#[derive(Clone, Debug)]
pub struct SimChain {
    pub server_name: String,
    pub major: u8,
    pub minor: u8,
    pub build: u16,
    pub devices: Vec<SimDevice>,
}

impl SimChain {
    fn device_by_net_id(&self, net_id: &AmsNetId) -> Option<&SimDevice> {
        self.devices.iter().find(|d| d.net_id == *net_id)
    }

    fn device_by_id(&self, id: u16) -> Option<&SimDevice> {
        self.devices.iter().find(|d| d.id == id)
    }

    fn all_symbols(&self) -> Vec<SimSymbol> {
        self.devices.iter().flat_map(|d| d.all_symbols()).collect()
    }
}

/// The default chain used across the suites: one device, a coupler, digital
/// in, digital out and a counter terminal.
pub fn default_chain() -> SimChain {
    let mut slaves = vec![
        SimSlave::new("EK1100", "Term 1 (EK1100)"),
        SimSlave::new("EL1014", "Term 2 (EL1014)"),
        SimSlave::new("EL2024", "Term 3 (EL2024)"),
        SimSlave::new("EL1502", "Term 4 (EL1502)"),
    ];
    for (i, slave) in slaves.iter_mut().enumerate() {
        slave.address = 1001 + i as u16;
    }
    SimChain {
        server_name: "I/O Server".into(),
        major: 3,
        minor: 1,
        build: 4024,
        devices: vec![SimDevice {
            id: 1,
            name: "Device 1 (EtherCAT)".into(),
            device_type: 94,
            net_id: AmsNetId::new(SERVER_NET_ID),
            identity: [2, 0x11, 0x100, 7],
            frame_counters: [5, 1000, 0, 200, 0],
            slaves,
        }],
    }
}

#[derive(Default)]
struct Behavior {
    /// Extra delay before answering a Read at `(group, offset)`.
    read_delays: HashMap<(u32, u32), Duration>,
    /// Fixed Read replies at `(group, offset)`, served before anything else.
    canned_reads: HashMap<(u32, u32), Vec<u8>>,
    /// Non-zero status returned for add-route requests.
    refuse_route_status: Option<u32>,
}

struct NotificationInfo {
    length: u32,
}

struct SimState {
    chain: SimChain,
    behavior: Mutex<Behavior>,
    notifications: Mutex<HashMap<u32, NotificationInfo>>,
    next_notification_handle: AtomicU32,
    symbol_handles: Mutex<HashMap<u32, String>>,
    next_symbol_handle: AtomicU32,
    /// Backing store for writes, keyed by `(group, offset)`.
    image: Mutex<HashMap<(u32, u32), Vec<u8>>>,
    /// Per-connection outbound channels for the notification streamer.
    writers: Mutex<Vec<mpsc::Sender<AmsFrame>>>,
    symbol_blob: Bytes,
    symbol_count: u32,
}

/// Handle on a running simulator.
pub struct SimServer {
    pub tcp_addr: SocketAddr,
    pub udp_addr: SocketAddr,
    state: Arc<SimState>,
    kill: CancellationToken,
    shutdown: CancellationToken,
}

impl SimServer {
    pub async fn start(chain: SimChain) -> SimServer {
        let symbols = chain.all_symbols();
        let (symbol_blob, symbol_count) = build_symbol_blob(&symbols);
        let state = Arc::new(SimState {
            chain,
            behavior: Mutex::new(Behavior::default()),
            notifications: Mutex::new(HashMap::new()),
            next_notification_handle: AtomicU32::new(1),
            symbol_handles: Mutex::new(HashMap::new()),
            next_symbol_handle: AtomicU32::new(0x1000),
            image: Mutex::new(HashMap::new()),
            writers: Mutex::new(Vec::new()),
            symbol_blob,
            symbol_count,
        });

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let tcp_addr = listener.local_addr().unwrap();
        let udp = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let udp_addr = udp.local_addr().unwrap();

        let kill = CancellationToken::new();
        let shutdown = CancellationToken::new();

        tokio::spawn(accept_loop(
            listener,
            Arc::clone(&state),
            kill.clone(),
            shutdown.clone(),
        ));
        tokio::spawn(udp_loop(udp, Arc::clone(&state), shutdown.clone()));
        tokio::spawn(notification_streamer(Arc::clone(&state), shutdown.clone()));

        SimServer {
            tcp_addr,
            udp_addr,
            state,
            kill,
            shutdown,
        }
    }

    /// Drop every active TCP connection, simulating a dying peer.
    pub fn kill_connections(&self) {
        self.kill.cancel();
    }

    pub async fn notification_handle_count(&self) -> usize {
        self.state.notifications.lock().await.len()
    }

    pub async fn set_read_delay(&self, group: u32, offset: u32, delay: Duration) {
        self.state
            .behavior
            .lock()
            .await
            .read_delays
            .insert((group, offset), delay);
    }

    pub async fn set_canned_read(&self, group: u32, offset: u32, data: Vec<u8>) {
        self.state
            .behavior
            .lock()
            .await
            .canned_reads
            .insert((group, offset), data);
    }

    pub async fn set_route_refusal(&self, status: u32) {
        self.state.behavior.lock().await.refuse_route_status = Some(status);
    }

    pub fn symbol_node_count(&self) -> u32 {
        self.state.symbol_count
    }
}

impl Drop for SimServer {
    fn drop(&mut self) {
        self.shutdown.cancel();
        self.kill.cancel();
    }
}

/// Session config aimed at a running simulator.
pub fn client_config(sim: &SimServer) -> SessionConfig {
    let mut config = SessionConfig::default();
    config.socket_addr = sim.tcp_addr;
    config.local_addr = AmsAddr::new(AmsNetId::new(CLIENT_NET_ID), 8000);
    config.target_addr = AmsAddr::new(AmsNetId::new(SERVER_NET_ID), 10_000);
    config
}

/// Connect a client to the simulator and wait until the session is active.
pub async fn connect(sim: &SimServer) -> (Client, Arc<Session>) {
    connect_with(client_config(sim)).await
}

pub async fn connect_with(config: SessionConfig) -> (Client, Arc<Session>) {
    let (session, event_loop) = session::create(config);
    event_loop.spawn();
    assert!(session.wait_for_active().await, "session failed to connect");
    (Client::new(Arc::clone(&session)), session)
}

// ---------------------------------------------------------------------------
// TCP side
// ---------------------------------------------------------------------------

async fn accept_loop(
    listener: TcpListener,
    state: Arc<SimState>,
    kill: CancellationToken,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => {
                let Ok((stream, _peer)) = accepted else { break };
                tokio::spawn(serve_connection(
                    stream,
                    Arc::clone(&state),
                    kill.clone(),
                ));
            }
        }
    }
}

async fn serve_connection(
    stream: tokio::net::TcpStream,
    state: Arc<SimState>,
    kill: CancellationToken,
) {
    let framed = Framed::new(stream, AmsTcpCodec);
    let (mut sink, mut source) = framed.split();
    let (reply_tx, mut reply_rx) = mpsc::channel::<AmsFrame>(256);
    state.writers.lock().await.push(reply_tx.clone());

    let writer = tokio::spawn(async move {
        while let Some(frame) = reply_rx.recv().await {
            if sink.send(frame).await.is_err() {
                break;
            }
        }
    });

    loop {
        tokio::select! {
            _ = kill.cancelled() => break,
            incoming = source.next() => {
                match incoming {
                    Some(Ok(frame)) => {
                        let state = Arc::clone(&state);
                        let reply_tx = reply_tx.clone();
                        // Each request is served concurrently so scripted
                        // delays produce out-of-order replies.
                        tokio::spawn(async move {
                            if let Some(reply) = handle_frame(&state, frame).await {
                                let _ = reply_tx.send(reply).await;
                            }
                        });
                    }
                    _ => break,
                }
            }
        }
    }
    drop(reply_tx);
    writer.abort();
}

fn response_header(request: &AmsHeader, payload_len: usize) -> AmsHeader {
    AmsHeader {
        target: request.source,
        source: request.target,
        command: request.command,
        state_flags: StateFlags::response(),
        length: payload_len as u32,
        error_code: 0,
        invoke_id: request.invoke_id,
    }
}

fn reply(request: &AmsHeader, payload: Bytes) -> AmsFrame {
    AmsFrame::new(response_header(request, payload.len()), payload)
}

fn result_only(code: u32) -> Bytes {
    Bytes::copy_from_slice(&code.to_le_bytes())
}

fn read_reply(code: u32, data: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(8 + data.len());
    buf.put_u32_le(code);
    buf.put_u32_le(data.len() as u32);
    buf.put_slice(data);
    buf.freeze()
}

async fn handle_frame(state: &Arc<SimState>, frame: AmsFrame) -> Option<AmsFrame> {
    let header = frame.header;
    let payload = frame.payload;
    let body = match header.command {
        CommandId::ReadDeviceInfo => handle_device_info(state),
        CommandId::ReadState => {
            let mut buf = BytesMut::new();
            buf.put_u32_le(ERR_NOERROR);
            buf.put_u16_le(5); // run
            buf.put_u16_le(0);
            buf.freeze()
        }
        CommandId::Read => handle_read(state, &header, &payload).await,
        CommandId::Write => handle_write(state, &header, &payload).await,
        CommandId::WriteControl => result_only(ERR_NOERROR),
        CommandId::ReadWrite => handle_read_write(state, &header, &payload).await,
        CommandId::AddDeviceNotification => handle_add_notification(state, &payload).await,
        CommandId::DeleteDeviceNotification => handle_delete_notification(state, &payload).await,
        CommandId::DeviceNotification => return None,
    };
    Some(reply(&header, body))
}

fn handle_device_info(state: &Arc<SimState>) -> Bytes {
    let chain = &state.chain;
    let mut buf = BytesMut::with_capacity(24);
    buf.put_u32_le(ERR_NOERROR);
    buf.put_u8(chain.major);
    buf.put_u8(chain.minor);
    buf.put_u16_le(chain.build);
    let mut name = [0u8; 16];
    let raw = chain.server_name.as_bytes();
    let n = raw.len().min(16);
    name[..n].copy_from_slice(&raw[..n]);
    buf.put_slice(&name);
    buf.freeze()
}

async fn handle_read(state: &Arc<SimState>, header: &AmsHeader, payload: &Bytes) -> Bytes {
    if payload.len() < 12 {
        return read_reply(ERR_INVALIDSIZE, &[]);
    }
    let group = u32::from_le_bytes(payload[0..4].try_into().unwrap());
    let offset = u32::from_le_bytes(payload[4..8].try_into().unwrap());
    let length = u32::from_le_bytes(payload[8..12].try_into().unwrap());

    // Scripted behaviour first: delay, then canned data.
    let (delay, canned) = {
        let behavior = state.behavior.lock().await;
        (
            behavior.read_delays.get(&(group, offset)).copied(),
            behavior.canned_reads.get(&(group, offset)).cloned(),
        )
    };
    if let Some(delay) = delay {
        tokio::time::sleep(delay).await;
    }
    if let Some(data) = canned {
        return read_reply(ERR_NOERROR, &data);
    }

    // Symbol services answer on any port.
    match group {
        SYM_UPLOAD_INFO2 => {
            let mut data = BytesMut::with_capacity(20);
            data.put_u32_le(state.symbol_count);
            data.put_u32_le(state.symbol_blob.len() as u32);
            data.put_slice(&[0u8; 12]);
            return read_reply(ERR_NOERROR, &data);
        }
        SYM_UPLOAD => return read_reply(ERR_NOERROR, &state.symbol_blob),
        SYM_VALUE_BY_HANDLE => {
            let name = state.symbol_handles.lock().await.get(&offset).cloned();
            let Some(name) = name else {
                return read_reply(ERR_INVALIDOFFSET, &[]);
            };
            let data = read_symbol_value(state, &name, length).await;
            return read_reply(ERR_NOERROR, &data);
        }
        _ => {}
    }

    if header.target.port == IO_SERVER_PORT {
        return handle_io_server_read(state, group, offset);
    }
    if header.target.port == ECAT_MASTER_PORT {
        if let Some(device) = state.chain.device_by_net_id(&header.target.net_id) {
            return handle_master_read(device, group, offset, length);
        }
    }

    // Anything else reads from the backing image.
    let stored = state.image.lock().await.get(&(group, offset)).cloned();
    match stored {
        Some(data) => read_reply(ERR_NOERROR, &data),
        None => read_reply(ERR_NOERROR, &vec![0u8; length as usize]),
    }
}

fn handle_io_server_read(state: &Arc<SimState>, group: u32, offset: u32) -> Bytes {
    let chain = &state.chain;
    if group == IO_DEVICE_STATE_BASE && offset == 0x2 {
        return read_reply(ERR_NOERROR, &(chain.devices.len() as u32).to_le_bytes());
    }
    if group == IO_DEVICE_STATE_BASE && offset == 0x1 {
        let mut data = BytesMut::new();
        data.put_u16_le(chain.devices.len() as u16);
        for device in &chain.devices {
            data.put_u16_le(device.id);
        }
        return read_reply(ERR_NOERROR, &data);
    }
    if group > IO_DEVICE_STATE_BASE {
        let id = (group - IO_DEVICE_STATE_BASE) as u16;
        let Some(device) = chain.device_by_id(id) else {
            return read_reply(ERR_INVALIDGRP, &[]);
        };
        return match offset {
            0x1 => {
                let mut data = BytesMut::from(device.name.as_bytes());
                data.put_u8(0);
                read_reply(ERR_NOERROR, &data)
            }
            0x5 => read_reply(ERR_NOERROR, device.net_id.as_bytes()),
            0x7 => read_reply(ERR_NOERROR, &device.device_type.to_le_bytes()),
            _ => read_reply(ERR_INVALIDOFFSET, &[]),
        };
    }
    read_reply(ERR_INVALIDGRP, &[])
}

fn handle_master_read(device: &SimDevice, group: u32, offset: u32, length: u32) -> Bytes {
    match group {
        MASTER_SLAVE_COUNT => read_reply(ERR_NOERROR, &(device.slaves.len() as u16).to_le_bytes()),
        MASTER_SLAVE_ADDRESSES => {
            let mut data = BytesMut::new();
            for slave in &device.slaves {
                data.put_u16_le(slave.address);
            }
            read_reply(ERR_NOERROR, &data)
        }
        MASTER_SLAVE_IDENTITY => match device.slave_by_address(offset as u16) {
            Some(slave) => {
                let mut data = BytesMut::new();
                for v in slave.identity {
                    data.put_u32_le(v);
                }
                read_reply(ERR_NOERROR, &data)
            }
            None => read_reply(ERR_INVALIDOFFSET, &[]),
        },
        MASTER_STATE_MACHINE => read_reply(ERR_NOERROR, &8u16.to_le_bytes()),
        SLAVE_STATE_MACHINE => {
            if offset == 0 {
                let mut data = BytesMut::new();
                for slave in &device.slaves {
                    data.put_u8(slave.ecat_state);
                    data.put_u8(slave.link_status);
                }
                read_reply(ERR_NOERROR, &data)
            } else {
                match device.slave_by_address(offset as u16) {
                    Some(slave) => {
                        read_reply(ERR_NOERROR, &[slave.ecat_state, slave.link_status])
                    }
                    None => read_reply(ERR_INVALIDOFFSET, &[]),
                }
            }
        }
        MASTER_FRAME_COUNTERS => {
            let mut data = BytesMut::new();
            for v in device.frame_counters {
                data.put_u32_le(v);
            }
            read_reply(ERR_NOERROR, &data)
        }
        SLAVE_CRC_COUNTERS => {
            if offset == 0 {
                let mut data = BytesMut::new();
                for slave in &device.slaves {
                    data.put_u32_le(slave.crc.iter().sum());
                }
                read_reply(ERR_NOERROR, &data)
            } else {
                match device.slave_by_address(offset as u16) {
                    Some(slave) => {
                        let mut data = BytesMut::new();
                        for v in slave.crc {
                            data.put_u32_le(v);
                        }
                        read_reply(ERR_NOERROR, &data)
                    }
                    None => read_reply(ERR_INVALIDOFFSET, &[]),
                }
            }
        }
        COE_LINK => handle_coe_read(device, offset, length),
        _ => read_reply(ERR_INVALIDGRP, &[]),
    }
}

fn handle_coe_read(device: &SimDevice, offset: u32, length: u32) -> Bytes {
    let coe_index = ((offset >> 16) & 0xFFFF) as u16;
    let subindex = (offset & 0xFF) as u8;

    if coe_index == 0x1018 {
        let value = match subindex {
            0x01 => device.identity[0],
            0x02 => device.identity[1],
            0x03 => device.identity[2],
            0x04 => device.identity[3],
            _ => return read_reply(ERR_INVALIDOFFSET, &[]),
        };
        return read_reply(ERR_NOERROR, &value.to_le_bytes());
    }
    if coe_index >= 0x8000 {
        let chain_index = (coe_index - 0x8000) as usize;
        let Some(slave) = device.slaves.get(chain_index) else {
            return read_reply(ERR_INVALIDOFFSET, &[]);
        };
        let text = match subindex {
            0x02 => &slave.type_name,
            0x03 => &slave.name,
            _ => return read_reply(ERR_NOERROR, &vec![0u8; length as usize]),
        };
        let mut data = text.as_bytes().to_vec();
        data.resize(length as usize, 0);
        return read_reply(ERR_NOERROR, &data);
    }
    read_reply(ERR_INVALIDOFFSET, &[])
}

async fn read_symbol_value(state: &Arc<SimState>, name: &str, length: u32) -> Vec<u8> {
    let symbol = state
        .chain
        .all_symbols()
        .into_iter()
        .find(|s| s.name == name);
    if let Some(symbol) = symbol {
        let stored = state
            .image
            .lock()
            .await
            .get(&(symbol.index_group, symbol.index_offset))
            .cloned();
        if let Some(mut data) = stored {
            data.resize(length.max(1) as usize, 0);
            return data;
        }
    }
    vec![0u8; length.max(1) as usize]
}

async fn handle_write(state: &Arc<SimState>, header: &AmsHeader, payload: &Bytes) -> Bytes {
    if payload.len() < 12 {
        return result_only(ERR_INVALIDSIZE);
    }
    let group = u32::from_le_bytes(payload[0..4].try_into().unwrap());
    let offset = u32::from_le_bytes(payload[4..8].try_into().unwrap());
    let length = u32::from_le_bytes(payload[8..12].try_into().unwrap()) as usize;
    let data = payload
        .get(12..12 + length)
        .map(|d| d.to_vec())
        .unwrap_or_default();

    match group {
        MASTER_FRAME_COUNTERS if header.target.port == ECAT_MASTER_PORT => {
            // Frame counter reset is acknowledged, counters stay simulated.
            result_only(ERR_NOERROR)
        }
        SYM_RELEASE_HANDLE => {
            if data.len() >= 4 {
                let handle = u32::from_le_bytes(data[0..4].try_into().unwrap());
                state.symbol_handles.lock().await.remove(&handle);
            }
            result_only(ERR_NOERROR)
        }
        SYM_VALUE_BY_HANDLE => {
            let name = state.symbol_handles.lock().await.get(&offset).cloned();
            let Some(name) = name else {
                return result_only(ERR_INVALIDOFFSET);
            };
            let symbol = state
                .chain
                .all_symbols()
                .into_iter()
                .find(|s| s.name == name);
            if let Some(symbol) = symbol {
                state
                    .image
                    .lock()
                    .await
                    .insert((symbol.index_group, symbol.index_offset), data);
            }
            result_only(ERR_NOERROR)
        }
        _ => {
            state.image.lock().await.insert((group, offset), data);
            result_only(ERR_NOERROR)
        }
    }
}

async fn handle_read_write(state: &Arc<SimState>, _header: &AmsHeader, payload: &Bytes) -> Bytes {
    if payload.len() < 16 {
        return read_reply(ERR_INVALIDSIZE, &[]);
    }
    let group = u32::from_le_bytes(payload[0..4].try_into().unwrap());
    let offset = u32::from_le_bytes(payload[4..8].try_into().unwrap());
    let read_length = u32::from_le_bytes(payload[8..12].try_into().unwrap());
    let write_length = u32::from_le_bytes(payload[12..16].try_into().unwrap()) as usize;
    let write_data = payload.get(16..16 + write_length).unwrap_or(&[]);

    match group {
        SYM_HANDLE_BY_NAME => {
            let name = String::from_utf8_lossy(
                write_data.split(|b| *b == 0).next().unwrap_or_default(),
            )
            .into_owned();
            let handle = state.next_symbol_handle.fetch_add(1, Ordering::Relaxed);
            state.symbol_handles.lock().await.insert(handle, name);
            read_reply(ERR_NOERROR, &handle.to_le_bytes())
        }
        SUMUP_READ => {
            let count = offset as usize;
            let mut codes = BytesMut::new();
            let mut data = BytesMut::new();
            let image = state.image.lock().await;
            for i in 0..count {
                let at = i * 12;
                let Some(spec) = write_data.get(at..at + 12) else {
                    break;
                };
                let sub_group = u32::from_le_bytes(spec[0..4].try_into().unwrap());
                let sub_offset = u32::from_le_bytes(spec[4..8].try_into().unwrap());
                let sub_length = u32::from_le_bytes(spec[8..12].try_into().unwrap()) as usize;
                codes.put_u32_le(ERR_NOERROR);
                match image.get(&(sub_group, sub_offset)) {
                    Some(stored) => {
                        let mut chunk = stored.clone();
                        chunk.resize(sub_length, 0);
                        data.put_slice(&chunk);
                    }
                    None => data.put_slice(&vec![0u8; sub_length]),
                }
            }
            codes.put_slice(&data);
            read_reply(ERR_NOERROR, &codes)
        }
        SUMUP_WRITE => {
            let count = offset as usize;
            let mut specs = Vec::with_capacity(count);
            for i in 0..count {
                let at = i * 12;
                let Some(spec) = write_data.get(at..at + 12) else {
                    break;
                };
                specs.push((
                    u32::from_le_bytes(spec[0..4].try_into().unwrap()),
                    u32::from_le_bytes(spec[4..8].try_into().unwrap()),
                    u32::from_le_bytes(spec[8..12].try_into().unwrap()) as usize,
                ));
            }
            let mut at = count * 12;
            let mut image = state.image.lock().await;
            let mut codes = BytesMut::new();
            for (sub_group, sub_offset, sub_length) in specs {
                let chunk = write_data
                    .get(at..at + sub_length)
                    .map(|d| d.to_vec())
                    .unwrap_or_default();
                at += sub_length;
                image.insert((sub_group, sub_offset), chunk);
                codes.put_u32_le(ERR_NOERROR);
            }
            read_reply(ERR_NOERROR, &codes)
        }
        _ => read_reply(ERR_NOERROR, &vec![0u8; read_length as usize]),
    }
}

async fn handle_add_notification(state: &Arc<SimState>, payload: &Bytes) -> Bytes {
    if payload.len() < 40 {
        return read_reply(ERR_INVALIDSIZE, &[]);
    }
    let length = u32::from_le_bytes(payload[8..12].try_into().unwrap());
    let handle = state.next_notification_handle.fetch_add(1, Ordering::Relaxed);
    state
        .notifications
        .lock()
        .await
        .insert(handle, NotificationInfo { length });
    let mut buf = BytesMut::with_capacity(8);
    buf.put_u32_le(ERR_NOERROR);
    buf.put_u32_le(handle);
    buf.freeze()
}

async fn handle_delete_notification(state: &Arc<SimState>, payload: &Bytes) -> Bytes {
    if payload.len() < 4 {
        return result_only(ERR_INVALIDSIZE);
    }
    let handle = u32::from_le_bytes(payload[0..4].try_into().unwrap());
    match state.notifications.lock().await.remove(&handle) {
        Some(_) => result_only(ERR_NOERROR),
        None => result_only(ERR_NOTIFYHNDINVALID),
    }
}

// ---------------------------------------------------------------------------
// Notification streamer
// ---------------------------------------------------------------------------

async fn notification_streamer(state: Arc<SimState>, shutdown: CancellationToken) {
    let mut tick = tokio::time::interval(Duration::from_millis(100));
    // 100 ns ticks between 1601-01-01 and the Unix epoch.
    const FILETIME_UNIX_OFFSET: u64 = 116_444_736_000_000_000;

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = tick.tick() => {}
        }

        let samples: Vec<(u32, u32)> = state
            .notifications
            .lock()
            .await
            .iter()
            .map(|(handle, info)| (*handle, info.length))
            .collect();
        if samples.is_empty() {
            continue;
        }

        let timestamp = FILETIME_UNIX_OFFSET
            + std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .map(|d| (d.as_nanos() / 100) as u64)
                .unwrap_or(0);

        let mut body = BytesMut::new();
        body.put_u64_le(timestamp);
        body.put_u32_le(samples.len() as u32);
        for (handle, length) in &samples {
            body.put_u32_le(*handle);
            body.put_u32_le(*length);
            body.put_slice(&vec![0u8; *length as usize]);
        }
        let mut payload = BytesMut::new();
        payload.put_u32_le(4 + body.len() as u32);
        payload.put_u32_le(1);
        payload.put_slice(&body);
        let payload = payload.freeze();

        let header = AmsHeader {
            target: AmsAddr::new(AmsNetId::new(CLIENT_NET_ID), 8000),
            source: AmsAddr::new(AmsNetId::new(SERVER_NET_ID), 10_000),
            command: CommandId::DeviceNotification,
            state_flags: StateFlags::request(),
            length: payload.len() as u32,
            error_code: 0,
            invoke_id: 0,
        };
        let frame = AmsFrame::new(header, payload);

        let mut writers = state.writers.lock().await;
        writers.retain(|tx| tx.try_send(frame.clone()).is_ok() || !tx.is_closed());
    }
}

// ---------------------------------------------------------------------------
// UDP side
// ---------------------------------------------------------------------------

async fn udp_loop(socket: UdpSocket, state: Arc<SimState>, shutdown: CancellationToken) {
    let mut buf = vec![0u8; 2048];
    loop {
        let (len, peer) = tokio::select! {
            _ = shutdown.cancelled() => break,
            received = socket.recv_from(&mut buf) => {
                match received {
                    Ok(pair) => pair,
                    Err(_) => break,
                }
            }
        };
        let datagram = &buf[..len];
        if datagram.len() < 12 {
            continue;
        }
        let cookie = u32::from_le_bytes(datagram[0..4].try_into().unwrap());
        if cookie != UDP_COOKIE {
            continue;
        }
        let invoke_id = u32::from_le_bytes(datagram[4..8].try_into().unwrap());
        let service_id = u32::from_le_bytes(datagram[8..12].try_into().unwrap());

        let reply = match service_id {
            SVC_READ_SERVICE_INFO => Some(udp_reply(invoke_id, SVC_READ_SERVICE_INFO, &[])),
            SVC_ADD_ROUTE => {
                let status = state
                    .behavior
                    .lock()
                    .await
                    .refuse_route_status
                    .unwrap_or(ERR_NOERROR);
                let mut tag = BytesMut::new();
                tag.put_u16_le(1); // status tag
                tag.put_u16_le(4);
                tag.put_u32_le(status);
                Some(udp_reply_with_items(invoke_id, SVC_ADD_ROUTE, 1, &tag))
            }
            SVC_DEL_ROUTE => Some(udp_reply(invoke_id, SVC_DEL_ROUTE, &[])),
            _ => None,
        };
        if let Some(reply) = reply {
            let _ = socket.send_to(&reply, peer).await;
        }
    }
}

fn udp_reply(invoke_id: u32, service_id: u32, items: &[u8]) -> Vec<u8> {
    udp_reply_with_items(invoke_id, service_id, 0, items)
}

fn udp_reply_with_items(invoke_id: u32, service_id: u32, count: u32, items: &[u8]) -> Vec<u8> {
    let mut buf = BytesMut::new();
    buf.put_u32_le(UDP_COOKIE);
    buf.put_u32_le(invoke_id);
    buf.put_u32_le(service_id | SVC_RESPONSE);
    buf.put_slice(&SERVER_NET_ID);
    buf.put_u16_le(10_000);
    buf.put_u32_le(count);
    buf.put_slice(items);
    buf.to_vec()
}

// ---------------------------------------------------------------------------
// Symbol table blob
// ---------------------------------------------------------------------------

fn build_symbol_blob(symbols: &[SimSymbol]) -> (Bytes, u32) {
    let mut blob = BytesMut::new();
    for symbol in symbols {
        let name = symbol.name.as_bytes();
        let type_name = symbol.type_name.as_bytes();
        let comment = symbol.comment.as_bytes();
        let entry_length = 30 + name.len() + type_name.len() + comment.len() + 3;
        blob.put_u32_le(entry_length as u32);
        blob.put_u32_le(symbol.index_group);
        blob.put_u32_le(symbol.index_offset);
        blob.put_u32_le(symbol.size);
        blob.put_u32_le(symbol.ads_type);
        blob.put_u32_le(0);
        blob.put_u16_le(name.len() as u16);
        blob.put_u16_le(type_name.len() as u16);
        blob.put_u16_le(comment.len() as u16);
        for s in [name, type_name, comment] {
            blob.put_slice(s);
            blob.put_u8(0);
        }
    }
    (blob.freeze(), symbols.len() as u32)
}
