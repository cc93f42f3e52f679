//! Server-side symbol table: upload, entry parsing, node expansion.
//!
//! The server describes its named data items in a packed table uploaded in
//! two steps: a metadata read gives the entry count and blob length, then the
//! blob itself is read and walked entry by entry. Plain entries map to one
//! [`Symbol`]; composite `BIGTYPE` entries expand into several symbols whose
//! layout is known from the terminal family named in the entry's type string.
//! Entries this client cannot map are diagnosed and counted, never fatal.

use bytes::Bytes;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use tracing::{debug, info, warn};

use crate::client::Client;
use crate::protocol::error::{Error, Result};
use crate::protocol::frame::response::decode_device_string;
use crate::protocol::index;
use crate::protocol::types::AdsDataType;

/// Metadata of the symbol table blob.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SymbolTableInfo {
    pub symbol_count: u32,
    pub table_length: u32,
}

impl SymbolTableInfo {
    /// `symbol_count u32, table_length u32, reserved`. Current servers send
    /// 16 reserved bytes, legacy builds 12; both are tolerated.
    pub fn decode(raw: &[u8]) -> Result<Self> {
        if raw.len() < 8 {
            return Err(Error::Frame {
                context: "symbol table info shorter than 8 bytes",
            });
        }
        Ok(Self {
            symbol_count: u32::from_le_bytes(raw[0..4].try_into().unwrap()),
            table_length: u32::from_le_bytes(raw[4..8].try_into().unwrap()),
        })
    }
}

/// One raw entry of the uploaded symbol table.
#[derive(Clone, Debug)]
pub struct SymbolNode {
    pub name: String,
    pub type_name: String,
    pub comment: String,
    pub data_type: u32,
    pub index_group: u32,
    pub index_offset: u32,
    pub size: u32,
    pub flags: u32,
}

/// Fixed part of a table entry before the three strings.
const ENTRY_HEADER_LEN: usize = 30;

/// Walk the uploaded blob into raw nodes.
///
/// Entry layout: `entry_length u32, index_group u32, index_offset u32,
/// size u32, data_type u32, flags u32, name_len u16, type_len u16,
/// comment_len u16`, then the three strings, each NUL-terminated. The entry
/// length advances the cursor, so alignment padding after the strings is
/// skipped implicitly. String lengths are little-endian; an entry whose
/// declared lengths overrun its bounds is dropped with a diagnostic instead
/// of guessing at a byte order.
pub fn parse_symbol_table(count: u32, blob: &Bytes) -> Result<(Vec<SymbolNode>, u32)> {
    let mut nodes = Vec::with_capacity(count as usize);
    let mut dropped = 0u32;
    let mut at = 0usize;

    for _ in 0..count {
        if blob.len() < at + ENTRY_HEADER_LEN {
            return Err(Error::Frame {
                context: "symbol table entry header truncated",
            });
        }
        let entry = &blob[at..];
        let entry_length =
            u32::from_le_bytes(entry[0..4].try_into().unwrap()) as usize;
        if entry_length < ENTRY_HEADER_LEN || blob.len() < at + entry_length {
            return Err(Error::Frame {
                context: "symbol table entry length out of bounds",
            });
        }
        let entry = &blob[at..at + entry_length];
        at += entry_length;

        let index_group = u32::from_le_bytes(entry[4..8].try_into().unwrap());
        let index_offset = u32::from_le_bytes(entry[8..12].try_into().unwrap());
        let size = u32::from_le_bytes(entry[12..16].try_into().unwrap());
        let data_type = u32::from_le_bytes(entry[16..20].try_into().unwrap());
        let flags = u32::from_le_bytes(entry[20..24].try_into().unwrap());
        let name_len = u16::from_le_bytes(entry[24..26].try_into().unwrap()) as usize;
        let type_len = u16::from_le_bytes(entry[26..28].try_into().unwrap()) as usize;
        let comment_len = u16::from_le_bytes(entry[28..30].try_into().unwrap()) as usize;

        // Three strings plus their NUL terminators must fit the entry.
        let strings_len = name_len + type_len + comment_len + 3;
        if ENTRY_HEADER_LEN + strings_len > entry_length {
            warn!(
                index_group,
                index_offset, "symbol entry string lengths overrun the entry, dropping"
            );
            dropped += 1;
            continue;
        }
        let name_at = ENTRY_HEADER_LEN;
        let type_at = name_at + name_len + 1;
        let comment_at = type_at + type_len + 1;
        nodes.push(SymbolNode {
            name: decode_device_string(&entry[name_at..name_at + name_len]),
            type_name: decode_device_string(&entry[type_at..type_at + type_len]),
            comment: decode_device_string(&entry[comment_at..comment_at + comment_len]),
            data_type,
            index_group,
            index_offset,
            size,
            flags,
        });
    }
    if at != blob.len() {
        return Err(Error::Frame {
            context: "unprocessed bytes after the last symbol table entry",
        });
    }
    Ok((nodes, dropped))
}

/// A typed, addressable symbol derived from one table node.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Symbol {
    /// Id of the device whose table produced this symbol.
    pub device_id: u16,
    /// Fully qualified name, unique within the device.
    pub name: String,
    pub data_type: AdsDataType,
    /// Element count; greater than one for sample arrays.
    pub count: u32,
    pub index_group: u32,
    pub index_offset: u32,
    pub comment: String,
    /// Server-assigned notification handle while a subscription is active.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notification_handle: Option<u32>,
}

impl Symbol {
    /// Total byte size of the value this symbol addresses.
    pub fn byte_len(&self) -> u32 {
        let elem = self.data_type.byte_len().unwrap_or(1) as u32;
        elem * self.count.max(1)
    }
}

/// One value slot inside an expanded composite node.
struct GroupParam {
    suffix: &'static str,
    data_type: AdsDataType,
    offset_shift: u32,
    count: u32,
}

impl GroupParam {
    const fn plain(data_type: AdsDataType) -> Self {
        Self {
            suffix: "",
            data_type,
            offset_shift: 0,
            count: 1,
        }
    }

    const fn named(suffix: &'static str, data_type: AdsDataType, offset_shift: u32) -> Self {
        Self {
            suffix,
            data_type,
            offset_shift,
            count: 1,
        }
    }
}

/// Match a composite type name of the form `<base>` or `<base><digits>_`
/// followed by `TYPE`, e.g. `CNT Inputs_TYPE` and `CNT Inputs_2_TYPE`.
fn matches_composite(type_name: &str, base: &str) -> bool {
    let Some(rest) = type_name.strip_prefix(base) else {
        return false;
    };
    let rest = rest.trim_start_matches(|c: char| c.is_ascii_digit());
    let rest = rest.strip_prefix('_').unwrap_or(rest);
    rest.starts_with("TYPE")
}

/// Layout of a composite node, decided by the terminal family named in its
/// type string.
fn composite_params(type_name: &str) -> Option<Vec<GroupParam>> {
    if type_name.starts_with("BIT") {
        // WcState / InputToggle style single bits.
        return Some(vec![GroupParam::plain(AdsDataType::UInt8)]);
    }
    if type_name.starts_with("ID_TYPE") {
        // Extension coupler id word.
        return Some(vec![GroupParam::plain(AdsDataType::UInt16)]);
    }
    if type_name.starts_with("Status Uo_TYPE") || type_name.starts_with("Status Us_TYPE") {
        // Power supply status bytes.
        return Some(vec![GroupParam::plain(AdsDataType::UInt8)]);
    }
    if type_name.starts_with("Inputs_TYPE") {
        // EtherCAT master device input block.
        return Some(vec![
            GroupParam::named("Frm0State", AdsDataType::UInt16, 0),
            GroupParam::named("Frm0WcState", AdsDataType::UInt16, 2),
            GroupParam::named("Frm0InputToggle", AdsDataType::UInt16, 4),
            GroupParam::named("SlaveCount", AdsDataType::UInt16, 10),
            GroupParam::named("DevState", AdsDataType::UInt16, 14),
        ]);
    }
    if type_name.starts_with("Outputs_TYPE") {
        // EtherCAT master device output block.
        return Some(vec![
            GroupParam::named("Frm0Ctrl", AdsDataType::UInt16, 0),
            GroupParam::named("Frm0WcCtrl", AdsDataType::UInt16, 2),
            GroupParam::named("DevCtrl", AdsDataType::UInt16, 4),
        ]);
    }
    if matches_composite(type_name, "CNT Inputs_") {
        // Counter terminal inputs: status word plus counter value.
        return Some(vec![
            GroupParam::plain(AdsDataType::UInt16),
            GroupParam::named("Counter value", AdsDataType::UInt32, 2),
        ]);
    }
    if matches_composite(type_name, "CNT Outputs_") {
        return Some(vec![
            GroupParam::plain(AdsDataType::UInt16),
            GroupParam::named("Set counter value", AdsDataType::UInt32, 2),
        ]);
    }
    if matches_composite(type_name, "Channel 1_") {
        // Digital input channel byte.
        return Some(vec![GroupParam::plain(AdsDataType::UInt8)]);
    }
    if matches_composite(type_name, "AI Standard Channel 1_") {
        // 16-bit analog input: status word plus value word.
        return Some(vec![
            GroupParam::named("Status", AdsDataType::UInt16, 0),
            GroupParam::named("Value", AdsDataType::UInt16, 2),
        ]);
    }
    if matches_composite(type_name, "AO Output Channel 1_") {
        return Some(vec![GroupParam::named(
            "Analog output",
            AdsDataType::Int16,
            0,
        )]);
    }
    if matches_composite(type_name, "AI Inputs Channel 1_") {
        // 24-bit analog input: status word plus 32-bit value.
        return Some(vec![
            GroupParam::plain(AdsDataType::UInt16),
            GroupParam::named("Value", AdsDataType::Int32, 2),
        ]);
    }
    None
}

/// Expand one raw node into its symbols. Returns an empty vector (and logs)
/// for nodes whose datatype or composite layout is unknown.
pub fn expand_node(device_id: u16, node: &SymbolNode) -> Vec<Symbol> {
    let make = |suffix: &str, data_type: AdsDataType, shift: u32, count: u32| {
        let name = if suffix.is_empty() {
            node.name.clone()
        } else {
            format!("{}.{}", node.name, suffix)
        };
        Symbol {
            device_id,
            name,
            data_type,
            count,
            index_group: node.index_group,
            index_offset: node.index_offset + shift,
            comment: node.comment.clone(),
            notification_handle: None,
        }
    };

    match AdsDataType::from_u32(node.data_type) {
        Some(AdsDataType::BigType) => match composite_params(&node.type_name) {
            Some(params) => params
                .iter()
                .map(|p| make(p.suffix, p.data_type, p.offset_shift, p.count))
                .collect(),
            None => {
                warn!(
                    node = %node.name,
                    type_name = %node.type_name,
                    "no layout for composite symbol node, skipping"
                );
                Vec::new()
            }
        },
        Some(data_type) => vec![make("", data_type, 0, 1)],
        None => {
            warn!(
                node = %node.name,
                code = node.data_type,
                "unsupported datatype code in symbol node, skipping"
            );
            Vec::new()
        }
    }
}

/// Enumerated symbols of one device plus enumeration diagnostics.
#[derive(Clone, Debug, Default)]
pub struct DeviceSymbols {
    pub symbols: Vec<Symbol>,
    /// Table nodes that produced no symbol (unknown datatype or layout).
    pub dropped_nodes: u32,
}

/// Symbol catalog over one connection: per-device enumeration plus by-name
/// handle access.
#[derive(Debug)]
pub struct SymbolCatalog {
    client: Client,
    devices: HashMap<u16, DeviceSymbols>,
}

impl SymbolCatalog {
    pub fn new(client: Client) -> Self {
        Self {
            client,
            devices: HashMap::new(),
        }
    }

    /// Enumerate the symbol table of `device_id` and cache the result.
    ///
    /// Uniqueness of names within the device is enforced here; a duplicate
    /// entry is dropped with a diagnostic.
    pub async fn enumerate_device(&mut self, device_id: u16) -> Result<&DeviceSymbols> {
        let target = self.client.target();
        let info_raw = self
            .client
            .read(target, index::SYM_UPLOAD_INFO2, 0, 24)
            .await?;
        let info = SymbolTableInfo::decode(&info_raw)?;
        debug!(
            device_id,
            entries = info.symbol_count,
            bytes = info.table_length,
            "uploading symbol table"
        );

        let blob = self
            .client
            .read(target, index::SYM_UPLOAD, 0, info.table_length)
            .await?;
        let (nodes, mut dropped) = parse_symbol_table(info.symbol_count, &blob)?;

        let mut symbols: Vec<Symbol> = Vec::with_capacity(nodes.len());
        let mut seen: HashSet<String> = HashSet::with_capacity(nodes.len());
        for node in &nodes {
            let expanded = expand_node(device_id, node);
            if expanded.is_empty() {
                dropped += 1;
                continue;
            }
            for symbol in expanded {
                if !seen.insert(symbol.name.clone()) {
                    warn!(name = %symbol.name, "duplicate symbol name, dropping");
                    dropped += 1;
                    continue;
                }
                symbols.push(symbol);
            }
        }
        info!(
            device_id,
            entries = info.symbol_count,
            symbols = symbols.len(),
            dropped,
            "symbol table enumerated"
        );

        let entry = self.devices.entry(device_id).or_default();
        *entry = DeviceSymbols {
            symbols,
            dropped_nodes: dropped,
        };
        Ok(entry)
    }

    /// Cached symbols of one device.
    pub fn device_symbols(&self, device_id: u16) -> Option<&DeviceSymbols> {
        self.devices.get(&device_id)
    }

    /// Look a cached symbol up by name across all devices.
    pub fn find(&self, name: &str) -> Option<&Symbol> {
        self.devices
            .values()
            .flat_map(|d| d.symbols.iter())
            .find(|s| s.name == name)
    }

    /// Mutable lookup, used by the notification layer to pin handles.
    pub fn find_mut(&mut self, name: &str) -> Option<&mut Symbol> {
        self.devices
            .values_mut()
            .flat_map(|d| d.symbols.iter_mut())
            .find(|s| s.name == name)
    }

    /// All cached symbols across devices.
    pub fn all(&self) -> impl Iterator<Item = &Symbol> {
        self.devices.values().flat_map(|d| d.symbols.iter())
    }

    /// Read a symbol's value by name without caching a handle: resolve,
    /// read by handle, release.
    pub async fn read_by_name(&self, name: &str) -> Result<Bytes> {
        let symbol = self.find(name).ok_or_else(|| Error::UnknownSymbol {
            name: name.to_string(),
        })?;
        let handle = self.client.handle_by_name(name).await?;
        let result = self.client.read_by_handle(handle, symbol.byte_len()).await;
        // Handle release is part of the read contract even on failure.
        let release = self.client.release_handle(handle).await;
        let data = result?;
        release?;
        Ok(data)
    }

    /// Write a symbol's value by name: resolve, write by handle, release.
    pub async fn write_by_name(&self, name: &str, data: &[u8]) -> Result<()> {
        if self.find(name).is_none() {
            return Err(Error::UnknownSymbol {
                name: name.to_string(),
            });
        }
        let handle = self.client.handle_by_name(name).await?;
        let result = self.client.write_by_handle(handle, data).await;
        let release = self.client.release_handle(handle).await;
        result?;
        release
    }

    /// Read a symbol by its `(group, offset, size)` address directly.
    pub async fn read_by_address(&self, symbol: &Symbol) -> Result<Bytes> {
        self.client
            .read(
                self.client.target(),
                symbol.index_group,
                symbol.index_offset,
                symbol.byte_len(),
            )
            .await
    }
}
