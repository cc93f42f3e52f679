//! Name-dispatch query surface for external controller layers.
//!
//! The facade owns one connection end to end: route negotiation, session,
//! introspection, symbol catalog and notification engine. External layers
//! talk to it through `query(name, args)` and `command(name, args)`, which
//! resolve `get_<name>` / `set_<name>` in a registry of typed handlers built
//! at construction. Arguments and results are JSON values, so the controller
//! contract stays narrow and serializable.

use serde_json::{json, Value};
use std::collections::HashMap;
use std::future::Future;
use std::net::{IpAddr, SocketAddr};
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info};

use crate::client::Client;
use crate::notify::{
    NotificationAttributes, NotificationEngine, NotificationEngineConfig, Subscription,
};
use crate::protocol::error::{Error, Result};
use crate::protocol::route::{RouteClient, RouteSpec};
use crate::protocol::session::{self, SessionConfig};
use crate::protocol::types::{
    AdsDataType, AmsAddr, AmsNetId, ADS_TCP_PORT, ADS_UDP_PORT, ECAT_MASTER_PORT, IO_SERVER_PORT,
    SYSTEM_SERVICE_PORT,
};
use crate::symbols::{Symbol, SymbolCatalog};
use crate::topology::{Introspector, Topology};

/// Facade lifecycle; every entry point validates the current state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FacadeState {
    Unopened,
    Connected,
    Introspected,
    Closed,
}

impl FacadeState {
    fn name(&self) -> &'static str {
        match self {
            FacadeState::Unopened => "unopened",
            FacadeState::Connected => "connected",
            FacadeState::Introspected => "introspected",
            FacadeState::Closed => "closed",
        }
    }
}

/// Optional route registration performed before connecting.
#[derive(Clone, Debug)]
pub struct RouteSettings {
    pub route_name: String,
    pub host: String,
    pub user_name: String,
    pub password: String,
}

/// Everything needed to open a facade connection.
#[derive(Clone, Debug)]
pub struct FacadeSettings {
    /// IP of the TwinCAT host.
    pub peer_ip: IpAddr,
    /// TCP port of the ADS transport (48898 on real hosts).
    pub peer_tcp_port: u16,
    /// UDP port of the discovery service (48899 on real hosts).
    pub peer_udp_port: u16,
    /// Net id of the target; discovered over UDP when `None`.
    pub target_net_id: Option<AmsNetId>,
    /// AMS port symbol services are addressed at.
    pub target_port: u16,
    /// This client's net id.
    pub local_net_id: AmsNetId,
    /// Register a route before connecting when set.
    pub route: Option<RouteSettings>,
    /// Notification engine tuning.
    pub notification: NotificationEngineConfig,
}

impl FacadeSettings {
    pub fn new(peer_ip: IpAddr, local_net_id: AmsNetId) -> Self {
        Self {
            peer_ip,
            peer_tcp_port: ADS_TCP_PORT,
            peer_udp_port: ADS_UDP_PORT,
            target_net_id: None,
            target_port: SYSTEM_SERVICE_PORT,
            local_net_id,
            route: None,
            notification: NotificationEngineConfig::default(),
        }
    }
}

struct FacadeShared {
    client: Client,
    introspector: Introspector,
    engine: NotificationEngine,
    topology: RwLock<Option<Topology>>,
    catalog: RwLock<SymbolCatalog>,
    subscriptions: Mutex<HashMap<String, Subscription>>,
}

type HandlerFuture = Pin<Box<dyn Future<Output = Result<Value>> + Send>>;
type Handler = fn(Arc<FacadeShared>, Vec<Value>) -> HandlerFuture;

/// Connection facade with a name-dispatch operation registry.
pub struct Facade {
    shared: Arc<FacadeShared>,
    handlers: HashMap<&'static str, Handler>,
    state: RwLock<FacadeState>,
}

impl Facade {
    /// Negotiate the route if requested, connect the session and start the
    /// notification engine. Leaves the facade in `Connected`.
    pub async fn connect(settings: FacadeSettings) -> Result<Self> {
        let udp_peer: SocketAddr = SocketAddr::new(settings.peer_ip, settings.peer_udp_port);
        let target_net_id = match settings.target_net_id {
            Some(id) => id,
            None => {
                let mut route = RouteClient::bind(udp_peer, settings.local_net_id).await?;
                route.discover().await?.net_id
            }
        };
        if let Some(route_settings) = &settings.route {
            let mut route = RouteClient::bind(udp_peer, settings.local_net_id).await?;
            route
                .add_route(&RouteSpec {
                    route_name: route_settings.route_name.clone(),
                    net_id: settings.local_net_id,
                    host: route_settings.host.clone(),
                    user_name: route_settings.user_name.clone(),
                    password: route_settings.password.clone(),
                })
                .await?;
        }

        let mut config = SessionConfig::new(
            settings.peer_ip,
            settings.local_net_id,
            AmsAddr::new(target_net_id, settings.target_port),
        );
        config.socket_addr = SocketAddr::new(settings.peer_ip, settings.peer_tcp_port);
        let (session, event_loop) = session::create(config);
        event_loop.spawn();
        if !session.wait_for_active().await {
            return Err(Error::ConnectionClosed);
        }
        info!(target = %target_net_id, "facade connected");

        let client = Client::new(session);
        let engine = NotificationEngine::start(client.clone(), settings.notification).await;
        let shared = Arc::new(FacadeShared {
            introspector: Introspector::new(client.clone()),
            catalog: RwLock::new(SymbolCatalog::new(client.clone())),
            client,
            engine,
            topology: RwLock::new(None),
            subscriptions: Mutex::new(HashMap::new()),
        });

        Ok(Self {
            shared,
            handlers: build_registry(),
            state: RwLock::new(FacadeState::Connected),
        })
    }

    pub async fn state(&self) -> FacadeState {
        *self.state.read().await
    }

    async fn expect_state(&self, expected: FacadeState, operation: &'static str) -> Result<()> {
        let state = *self.state.read().await;
        if state != expected {
            return Err(Error::InvalidState {
                operation,
                state: state.name(),
            });
        }
        Ok(())
    }

    /// Introspect the I/O server and enumerate the symbol catalog. Moves the
    /// facade to `Introspected`.
    pub async fn initialise(&self) -> Result<()> {
        self.expect_state(FacadeState::Connected, "initialise").await?;
        let topology = self.shared.introspector.introspect().await?;
        let first_device = topology.devices.first().map(|d| d.id);
        *self.shared.topology.write().await = Some(topology);
        if let Some(device_id) = first_device {
            self.shared
                .catalog
                .write()
                .await
                .enumerate_device(device_id)
                .await?;
        }
        *self.state.write().await = FacadeState::Introspected;
        Ok(())
    }

    /// Dispatch a read-only operation: resolves `get_<name>`.
    pub async fn query(&self, name: &str, args: Vec<Value>) -> Result<Value> {
        self.expect_state(FacadeState::Introspected, "query").await?;
        self.dispatch("get", name, args).await
    }

    /// Dispatch a mutating operation: resolves `set_<name>`.
    pub async fn command(&self, name: &str, args: Vec<Value>) -> Result<Value> {
        self.expect_state(FacadeState::Introspected, "command").await?;
        self.dispatch("set", name, args).await
    }

    async fn dispatch(&self, prefix: &str, name: &str, args: Vec<Value>) -> Result<Value> {
        let full = format!("{prefix}_{name}");
        let handler = self
            .handlers
            .get(full.as_str())
            .ok_or_else(|| Error::UnknownOperation { name: full.clone() })?;
        debug!(operation = %full, "dispatching facade operation");
        handler(Arc::clone(&self.shared), args).await
    }

    /// Delete every subscription, tear the session down and move to `Closed`.
    pub async fn close(&self) -> Result<()> {
        {
            let mut state = self.state.write().await;
            if *state == FacadeState::Closed {
                return Ok(());
            }
            *state = FacadeState::Closed;
        }
        self.shared.subscriptions.lock().await.clear();
        self.shared.engine.shutdown().await?;
        self.shared.client.session().shutdown();
        info!("facade closed");
        Ok(())
    }
}

fn build_registry() -> HashMap<&'static str, Handler> {
    let mut handlers: HashMap<&'static str, Handler> = HashMap::new();
    handlers.insert("get_server_info", get_server_info);
    handlers.insert("get_device_ids", get_device_ids);
    handlers.insert("get_device_info", get_device_info);
    handlers.insert("get_slave_info", get_slave_info);
    handlers.insert("get_chain", get_chain);
    handlers.insert("get_states", get_states);
    handlers.insert("get_frame_counters", get_frame_counters);
    handlers.insert("get_crc_counters", get_crc_counters);
    handlers.insert("get_symbols", get_symbols);
    handlers.insert("get_symbol_value", get_symbol_value);
    handlers.insert("get_notifications", get_notifications);
    handlers.insert("set_symbol_value", set_symbol_value);
    handlers.insert("set_frame_counters_reset", set_frame_counters_reset);
    handlers.insert("set_notifications", set_notifications);
    handlers
}

fn arg_str(args: &[Value], at: usize, context: &'static str) -> Result<String> {
    args.get(at)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or(Error::InvalidArgument { context })
}

fn arg_u16(args: &[Value], at: usize, context: &'static str) -> Result<u16> {
    args.get(at)
        .and_then(Value::as_u64)
        .and_then(|v| u16::try_from(v).ok())
        .ok_or(Error::InvalidArgument { context })
}

/// Decode raw symbol bytes under the symbol's datatype into a JSON value.
fn decode_value(symbol: &Symbol, data: &[u8]) -> Value {
    let elem = symbol.data_type.byte_len().unwrap_or(data.len().max(1));
    let count = symbol.count.max(1) as usize;
    let one = |chunk: &[u8]| -> Value {
        match symbol.data_type {
            AdsDataType::Bit | AdsDataType::UInt8 => json!(chunk.first().copied().unwrap_or(0)),
            AdsDataType::Int16 => json!(i16::from_le_bytes(pad(chunk))),
            AdsDataType::UInt16 => json!(u16::from_le_bytes(pad(chunk))),
            AdsDataType::Int32 => json!(i32::from_le_bytes(pad(chunk))),
            AdsDataType::UInt32 => json!(u32::from_le_bytes(pad(chunk))),
            AdsDataType::Int64 => json!(i64::from_le_bytes(pad(chunk))),
            AdsDataType::UInt64 => json!(u64::from_le_bytes(pad(chunk))),
            AdsDataType::Real32 => json!(f32::from_le_bytes(pad(chunk))),
            AdsDataType::Real64 => json!(f64::from_le_bytes(pad(chunk))),
            AdsDataType::String => {
                json!(crate::protocol::frame::response::decode_device_string(chunk))
            }
            AdsDataType::BigType => json!(chunk.to_vec()),
        }
    };
    if count <= 1 {
        one(&data[..elem.min(data.len())])
    } else {
        Value::Array(
            data.chunks(elem)
                .take(count)
                .map(one)
                .collect(),
        )
    }
}

fn pad<const N: usize>(chunk: &[u8]) -> [u8; N] {
    let mut out = [0u8; N];
    let n = chunk.len().min(N);
    out[..n].copy_from_slice(&chunk[..n]);
    out
}

/// Encode a JSON value into the wire bytes of the symbol's datatype.
fn encode_value(symbol: &Symbol, value: &Value) -> Result<Vec<u8>> {
    let bad = Error::InvalidArgument {
        context: "value does not fit the symbol datatype",
    };
    Ok(match symbol.data_type {
        AdsDataType::Bit | AdsDataType::UInt8 => {
            let v = value
                .as_u64()
                .or_else(|| value.as_bool().map(u64::from))
                .ok_or(bad)?;
            vec![u8::try_from(v).map_err(|_| Error::InvalidArgument {
                context: "value out of range for a byte symbol",
            })?]
        }
        AdsDataType::Int16 => (value.as_i64().ok_or(bad)? as i16).to_le_bytes().to_vec(),
        AdsDataType::UInt16 => (value.as_u64().ok_or(bad)? as u16).to_le_bytes().to_vec(),
        AdsDataType::Int32 => (value.as_i64().ok_or(bad)? as i32).to_le_bytes().to_vec(),
        AdsDataType::UInt32 => (value.as_u64().ok_or(bad)? as u32).to_le_bytes().to_vec(),
        AdsDataType::Int64 => value.as_i64().ok_or(bad)?.to_le_bytes().to_vec(),
        AdsDataType::UInt64 => value.as_u64().ok_or(bad)?.to_le_bytes().to_vec(),
        AdsDataType::Real32 => (value.as_f64().ok_or(bad)? as f32).to_le_bytes().to_vec(),
        AdsDataType::Real64 => value.as_f64().ok_or(bad)?.to_le_bytes().to_vec(),
        AdsDataType::String => {
            let mut bytes = value.as_str().ok_or(bad)?.as_bytes().to_vec();
            bytes.push(0);
            bytes
        }
        AdsDataType::BigType => value
            .as_array()
            .ok_or(bad)?
            .iter()
            .map(|v| {
                v.as_u64()
                    .and_then(|b| u8::try_from(b).ok())
                    .ok_or(Error::InvalidArgument {
                        context: "byte array element out of range",
                    })
            })
            .collect::<Result<Vec<u8>>>()?,
    })
}

async fn topology_snapshot(shared: &FacadeShared) -> Result<Topology> {
    shared
        .topology
        .read()
        .await
        .clone()
        .ok_or(Error::InvalidState {
            operation: "topology access",
            state: "connected",
        })
}

fn get_server_info(shared: Arc<FacadeShared>, _args: Vec<Value>) -> HandlerFuture {
    Box::pin(async move {
        let topology = topology_snapshot(&shared).await?;
        Ok(serde_json::to_value(&topology.server).expect("server record serializes"))
    })
}

fn get_device_ids(shared: Arc<FacadeShared>, _args: Vec<Value>) -> HandlerFuture {
    Box::pin(async move {
        let topology = topology_snapshot(&shared).await?;
        Ok(json!(topology
            .devices
            .iter()
            .map(|d| d.id)
            .collect::<Vec<u16>>()))
    })
}

fn get_device_info(shared: Arc<FacadeShared>, args: Vec<Value>) -> HandlerFuture {
    Box::pin(async move {
        let id = arg_u16(&args, 0, "get_device_info expects a device id")?;
        let topology = topology_snapshot(&shared).await?;
        let device = topology.device(id).ok_or(Error::InvalidArgument {
            context: "no device with this id",
        })?;
        Ok(serde_json::to_value(device).expect("device record serializes"))
    })
}

fn get_slave_info(shared: Arc<FacadeShared>, args: Vec<Value>) -> HandlerFuture {
    Box::pin(async move {
        let id = arg_u16(&args, 0, "get_slave_info expects a device id")?;
        let address = arg_u16(&args, 1, "get_slave_info expects a slave address")?;
        let topology = topology_snapshot(&shared).await?;
        let slave = topology
            .device(id)
            .and_then(|d| d.slave_by_address(address))
            .ok_or(Error::InvalidArgument {
                context: "no slave at this address",
            })?;
        Ok(serde_json::to_value(slave).expect("slave record serializes"))
    })
}

fn get_chain(shared: Arc<FacadeShared>, args: Vec<Value>) -> HandlerFuture {
    Box::pin(async move {
        let id = arg_u16(&args, 0, "get_chain expects a device id")?;
        let topology = topology_snapshot(&shared).await?;
        let device = topology.device(id).ok_or(Error::InvalidArgument {
            context: "no device with this id",
        })?;
        Ok(Value::Array(
            device
                .slaves
                .iter()
                .map(|s| {
                    json!({
                        "name": s.name,
                        "type": s.type_name,
                        "address": s.address,
                        "node": s.location.node,
                        "position": s.location.position,
                        "parentAddress": s.parent_address,
                        "orphaned": s.orphaned,
                    })
                })
                .collect(),
        ))
    })
}

fn get_states(shared: Arc<FacadeShared>, _args: Vec<Value>) -> HandlerFuture {
    Box::pin(async move {
        let topology = topology_snapshot(&shared).await?;
        let server_addr = shared.client.target().with_port(IO_SERVER_PORT);
        let server_state = shared.client.read_state(server_addr).await?;
        let mut devices = Vec::with_capacity(topology.devices.len());
        for device in &topology.devices {
            let state = shared
                .client
                .read_state(AmsAddr::new(device.net_id, ECAT_MASTER_PORT))
                .await?;
            devices.push(json!({
                "id": device.id,
                "adsState": state.ads_state.as_u16(),
                "deviceState": state.device_state,
            }));
        }
        Ok(json!({
            "server": {
                "adsState": server_state.ads_state.as_u16(),
                "deviceState": server_state.device_state,
            },
            "devices": devices,
        }))
    })
}

fn get_frame_counters(shared: Arc<FacadeShared>, args: Vec<Value>) -> HandlerFuture {
    Box::pin(async move {
        let id = arg_u16(&args, 0, "get_frame_counters expects a device id")?;
        let mut guard = shared.topology.write().await;
        let topology = guard.as_mut().ok_or(Error::InvalidState {
            operation: "get_frame_counters",
            state: "connected",
        })?;
        let device = topology.device(id).ok_or(Error::InvalidArgument {
            context: "no device with this id",
        })?;
        let counters = shared.introspector.frame_counters(device.net_id).await?;
        if let Some(device) = topology.device_mut(id) {
            device.frame_counters = counters;
        }
        Ok(serde_json::to_value(counters).expect("frame counters serialize"))
    })
}

fn get_crc_counters(shared: Arc<FacadeShared>, args: Vec<Value>) -> HandlerFuture {
    Box::pin(async move {
        let id = arg_u16(&args, 0, "get_crc_counters expects a device id")?;
        let mut guard = shared.topology.write().await;
        let topology = guard.as_mut().ok_or(Error::InvalidState {
            operation: "get_crc_counters",
            state: "connected",
        })?;
        let (net_id, count) = {
            let device = topology.device(id).ok_or(Error::InvalidArgument {
                context: "no device with this id",
            })?;
            (device.net_id, device.slave_count)
        };
        let counters = shared.introspector.slave_crc_counters(net_id, count).await?;
        if let Some(device) = topology.device_mut(id) {
            device.slave_crc_counters = counters.clone();
            for (slave, counter) in device.slaves.iter_mut().zip(counters.iter()) {
                slave.crc_counter = *counter;
            }
        }
        Ok(json!(counters))
    })
}

fn get_symbols(shared: Arc<FacadeShared>, _args: Vec<Value>) -> HandlerFuture {
    Box::pin(async move {
        let catalog = shared.catalog.read().await;
        Ok(Value::Array(
            catalog
                .all()
                .map(|s| serde_json::to_value(s).expect("symbol serializes"))
                .collect(),
        ))
    })
}

fn get_symbol_value(shared: Arc<FacadeShared>, args: Vec<Value>) -> HandlerFuture {
    Box::pin(async move {
        let name = arg_str(&args, 0, "get_symbol_value expects a symbol name")?;
        let catalog = shared.catalog.read().await;
        let symbol = catalog
            .find(&name)
            .ok_or_else(|| Error::UnknownSymbol { name: name.clone() })?
            .clone();
        let data = catalog.read_by_name(&name).await?;
        Ok(decode_value(&symbol, &data))
    })
}

fn get_notifications(shared: Arc<FacadeShared>, args: Vec<Value>) -> HandlerFuture {
    Box::pin(async move {
        let name = arg_str(&args, 0, "get_notifications expects a symbol name")?;
        let symbol = {
            let catalog = shared.catalog.read().await;
            catalog
                .find(&name)
                .ok_or_else(|| Error::UnknownSymbol { name: name.clone() })?
                .clone()
        };
        let mut subscriptions = shared.subscriptions.lock().await;
        let subscription = subscriptions
            .get_mut(&name)
            .ok_or_else(|| Error::UnknownSymbol { name: name.clone() })?;
        let mut samples = Vec::new();
        while let Some(sample) = subscription.try_recv() {
            samples.push(json!({
                "timestamp": sample.timestamp.to_rfc3339(),
                "value": decode_value(&symbol, &sample.data),
            }));
        }
        Ok(json!({
            "symbol": name,
            "samples": samples,
            "dropped": subscription.overflow_count(),
        }))
    })
}

fn set_symbol_value(shared: Arc<FacadeShared>, args: Vec<Value>) -> HandlerFuture {
    Box::pin(async move {
        let name = arg_str(&args, 0, "set_symbol_value expects a symbol name")?;
        let value = args
            .get(1)
            .cloned()
            .ok_or(Error::InvalidArgument {
                context: "set_symbol_value expects a value",
            })?;
        let catalog = shared.catalog.read().await;
        let symbol = catalog
            .find(&name)
            .ok_or_else(|| Error::UnknownSymbol { name: name.clone() })?
            .clone();
        let bytes = encode_value(&symbol, &value)?;
        catalog.write_by_name(&name, &bytes).await?;
        Ok(Value::Null)
    })
}

fn set_frame_counters_reset(shared: Arc<FacadeShared>, args: Vec<Value>) -> HandlerFuture {
    Box::pin(async move {
        let id = arg_u16(&args, 0, "set_frame_counters_reset expects a device id")?;
        let topology = topology_snapshot(&shared).await?;
        let device = topology.device(id).ok_or(Error::InvalidArgument {
            context: "no device with this id",
        })?;
        shared.introspector.reset_frame_counters(device).await?;
        Ok(Value::Null)
    })
}

fn set_notifications(shared: Arc<FacadeShared>, args: Vec<Value>) -> HandlerFuture {
    Box::pin(async move {
        let action = arg_str(&args, 0, "set_notifications expects add/delete")?;
        match action.as_str() {
            "add" => {
                let name = arg_str(&args, 1, "set_notifications add expects a symbol name")?;
                let cycle_ms = args.get(2).and_then(Value::as_u64).unwrap_or(100);
                let symbol = {
                    let catalog = shared.catalog.read().await;
                    catalog
                        .find(&name)
                        .ok_or_else(|| Error::UnknownSymbol { name: name.clone() })?
                        .clone()
                };
                let subscription = shared
                    .engine
                    .subscribe(
                        &symbol,
                        NotificationAttributes::server_cycle(std::time::Duration::from_millis(
                            cycle_ms,
                        )),
                    )
                    .await?;
                let handle = subscription.handle;
                if let Some(symbol) = shared.catalog.write().await.find_mut(&name) {
                    symbol.notification_handle = Some(handle);
                }
                shared
                    .subscriptions
                    .lock()
                    .await
                    .insert(name, subscription);
                Ok(json!({ "handle": handle }))
            }
            "delete" => {
                let name = arg_str(&args, 1, "set_notifications delete expects a symbol name")?;
                let subscription = shared
                    .subscriptions
                    .lock()
                    .await
                    .remove(&name)
                    .ok_or_else(|| Error::UnknownSymbol { name: name.clone() })?;
                shared.engine.unsubscribe(subscription).await?;
                if let Some(symbol) = shared.catalog.write().await.find_mut(&name) {
                    symbol.notification_handle = None;
                }
                Ok(Value::Null)
            }
            _ => Err(Error::InvalidArgument {
                context: "set_notifications action must be add or delete",
            }),
        }
    })
}
