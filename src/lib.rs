//! Async ADS/AMS client for Beckhoff TwinCAT I/O servers.
//!
//! This crate talks the ADS protocol over AMS/TCP (port 48898) and the ADS
//! discovery/route service over UDP (port 48899). On top of the raw command
//! surface it reconstructs the EtherCAT topology of an I/O server (devices,
//! couplers, terminals), enumerates the server-side symbol table into typed
//! handles, and demultiplexes device notification streams to subscribers.
//!
//! The layering, bottom up:
//!
//! - [`protocol`] — wire model: AMS headers, per-command request/response
//!   bodies, the AMS/TCP framing codec, the UDP route agent and the session
//!   (one background IO driver per connection, responses correlated by
//!   invoke id).
//! - [`client`] — typed command dispatcher: one async operation per ADS
//!   command family, addressed at an explicit `(net id, port)` target.
//! - [`topology`] — scripted introspection of the I/O server into
//!   [`topology::Topology`] records, plus in-place refresh of counters and
//!   states.
//! - [`symbols`] — symbol table upload, entry parsing and node expansion into
//!   addressable [`symbols::Symbol`] values.
//! - [`notify`] — notification subscriptions: server push frames are buffered
//!   per handle and flushed to subscribers on an interval.
//! - [`facade`] — a name-dispatch `query`/`command` surface for external
//!   controller layers.
//!
//! A connection is fully transient: nothing is persisted, and dropping the
//! session tears down every subscription and pending request.

pub mod protocol;

pub mod client;
pub mod facade;
pub mod notify;
pub mod symbols;
pub mod topology;

pub use crate::client::Client;
pub use crate::facade::{Facade, FacadeSettings, FacadeState};
pub use crate::notify::{NotificationAttributes, NotificationEngine, Sample, Subscription};
pub use crate::protocol::error::{Error, Result};
pub use crate::protocol::route::{RouteClient, RouteSpec};
pub use crate::protocol::session::{Session, SessionConfig, SessionEvent, SessionLifecycleState};
pub use crate::protocol::types::{AmsAddr, AmsNetId, TransmissionMode};
pub use crate::symbols::{Symbol, SymbolCatalog};
pub use crate::topology::{Introspector, IoDevice, IoServer, IoSlave, Topology};
