//! Session configuration, lifecycle states and observable events.

use std::net::SocketAddr;
use std::time::Duration;

use crate::protocol::types::{AmsAddr, AmsNetId, ADS_TCP_PORT, CLIENT_BASE_PORT};

/// Session lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionLifecycleState {
    /// Initial idle state before any connection attempt.
    Idle,
    /// Transport connecting.
    Connecting,
    /// Fully established, requests accepted.
    Active,
    /// Graceful close in progress.
    Closing,
    /// Fully closed.
    Closed,
    /// Connect failed or the transport died.
    Failed,
}

/// Public session events for observability.
#[derive(Debug, Clone, Copy)]
pub enum SessionEvent {
    /// Lifecycle changed notification.
    LifecycleChanged(SessionLifecycleState),
    /// Transport level error occurred (connect/reset/IO).
    TransportError,
    /// A notification frame was dropped because the engine queue was full.
    NotificationQueueFull,
    /// A response arrived whose invoke id had no pending slot.
    OrphanResponse,
}

/// ADS session configuration.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// TCP endpoint of the peer (usually port 48898).
    pub socket_addr: SocketAddr,
    /// This client's AMS address; the port must be at least 8000.
    pub local_addr: AmsAddr,
    /// Default target of operations that do not name one explicitly.
    pub target_addr: AmsAddr,
    /// Transport establishment deadline.
    pub connect_timeout: Duration,
    /// Deadline for unary operations.
    pub request_timeout: Duration,
    /// Deadline for the longer introspection phases.
    pub introspect_timeout: Duration,
    /// Outbound queue capacity.
    pub send_queue_capacity: usize,
    /// Maximum concurrently outstanding requests.
    pub max_concurrent_requests: usize,
    /// Queue depth between the receiver and the notification engine.
    pub notification_queue_capacity: usize,
    /// TCP_NODELAY; on by default for small command frames.
    pub tcp_nodelay: bool,
}

impl SessionConfig {
    /// Config for a peer at `ip:48898` with the given net ids.
    pub fn new(ip: std::net::IpAddr, local_net_id: AmsNetId, target: AmsAddr) -> Self {
        Self {
            socket_addr: SocketAddr::new(ip, ADS_TCP_PORT),
            local_addr: AmsAddr::new(local_net_id, CLIENT_BASE_PORT),
            target_addr: target,
            ..Self::default()
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            socket_addr: "127.0.0.1:48898".parse().unwrap(),
            local_addr: AmsAddr::new(AmsNetId::default(), CLIENT_BASE_PORT),
            target_addr: AmsAddr::new(AmsNetId::default(), 0),
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(10),
            introspect_timeout: Duration::from_secs(30),
            send_queue_capacity: 256,
            max_concurrent_requests: 64,
            notification_queue_capacity: 1024,
            tcp_nodelay: true,
        }
    }
}
