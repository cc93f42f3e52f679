//! UDP discovery and route negotiation.
//!
//! Before a TCP session can carry ADS traffic the peer's router must hold a
//! route entry naming this client's net id. The agent binds a UDP socket,
//! discovers the peer's net id with a ReadServiceInfo exchange, then registers
//! the route with an AddRoute exchange. Credentials travel in clear text; that
//! is inherited protocol behaviour, not a choice of this client.

use bytes::{BufMut, Bytes, BytesMut};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::time::timeout;
use tracing::debug;

use super::error::{Error, Result};
use super::types::{AmsAddr, AmsNetId};

/// Magic cookie opening every service datagram.
pub const UDP_COOKIE: u32 = 0x7114_6603;

/// Service ids of the discovery protocol.
pub mod service {
    /// Query the peer's net id and service port.
    pub const READ_SERVICE_INFO: u32 = 0x1;
    /// Register a route entry on the peer.
    pub const ADD_ROUTE: u32 = 0x6;
    /// Remove a route entry from the peer.
    pub const DEL_ROUTE: u32 = 0xB001;
    /// OR-ed into the service id of replies.
    pub const RESPONSE: u32 = 0x8000_0000;
}

/// Tag ids of the packed key-value items in route payloads.
pub mod tag {
    /// Reply status code (u32) of an add-route request.
    pub const STATUS: u16 = 1;
    pub const PASSWORD: u16 = 2;
    pub const HOST: u16 = 5;
    pub const NET_ID: u16 = 7;
    pub const ROUTE_NAME: u16 = 12;
    pub const USER_NAME: u16 = 13;
}

/// Everything the peer needs to create a route back to this client.
#[derive(Clone, Debug)]
pub struct RouteSpec {
    /// Name the route appears under in the peer's routing table.
    pub route_name: String,
    /// This client's net id.
    pub net_id: AmsNetId,
    /// This client's host name or IP, as the peer should dial it.
    pub host: String,
    pub user_name: String,
    pub password: String,
}

/// One UDP service datagram: 12-byte header plus payload.
fn build_datagram(invoke_id: u32, service_id: u32, payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(12 + payload.len());
    buf.put_u32_le(UDP_COOKIE);
    buf.put_u32_le(invoke_id);
    buf.put_u32_le(service_id);
    buf.put_slice(payload);
    buf.freeze()
}

fn put_tag(buf: &mut BytesMut, id: u16, data: &[u8]) {
    buf.put_u16_le(id);
    buf.put_u16_le(data.len() as u16);
    buf.put_slice(data);
}

/// Strings travel NUL-terminated inside tag items.
fn cstr(value: &str) -> Bytes {
    let mut data = BytesMut::with_capacity(value.len() + 1);
    data.put_slice(value.as_bytes());
    data.put_u8(0);
    data.freeze()
}

/// Identity payload sent with discovery and add-route requests:
/// `netid [6], port u16, item_count u32`, then the tagged items.
fn build_identity_payload(net_id: AmsNetId, port: u16, items: &[(u16, Bytes)]) -> Bytes {
    let mut buf = BytesMut::new();
    buf.put_slice(net_id.as_bytes());
    buf.put_u16_le(port);
    buf.put_u32_le(items.len() as u32);
    for (id, data) in items {
        put_tag(&mut buf, *id, data);
    }
    buf.freeze()
}

/// A decoded service reply.
#[derive(Clone, Debug)]
struct ServiceReply {
    invoke_id: u32,
    service_id: u32,
    net_id: AmsNetId,
    port: u16,
    items: Vec<(u16, Bytes)>,
}

fn parse_reply(raw: &[u8]) -> Result<ServiceReply> {
    if raw.len() < 12 {
        return Err(Error::Frame {
            context: "UDP reply shorter than its header",
        });
    }
    let cookie = u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]);
    if cookie != UDP_COOKIE {
        return Err(Error::Frame {
            context: "UDP reply carries a wrong cookie",
        });
    }
    let invoke_id = u32::from_le_bytes([raw[4], raw[5], raw[6], raw[7]]);
    let service_id = u32::from_le_bytes([raw[8], raw[9], raw[10], raw[11]]);
    let body = &raw[12..];
    if body.len() < 12 {
        return Err(Error::Frame {
            context: "UDP reply body truncated",
        });
    }
    let net_id = AmsNetId::from_slice(&body[0..6])?;
    let port = u16::from_le_bytes([body[6], body[7]]);
    let count = u32::from_le_bytes([body[8], body[9], body[10], body[11]]) as usize;

    let mut items = Vec::with_capacity(count);
    let mut at = 12usize;
    for _ in 0..count {
        if body.len() < at + 4 {
            return Err(Error::Frame {
                context: "UDP reply item header truncated",
            });
        }
        let id = u16::from_le_bytes([body[at], body[at + 1]]);
        let len = u16::from_le_bytes([body[at + 2], body[at + 3]]) as usize;
        at += 4;
        if body.len() < at + len {
            return Err(Error::Frame {
                context: "UDP reply item data truncated",
            });
        }
        items.push((id, Bytes::copy_from_slice(&body[at..at + len])));
        at += len;
    }
    Ok(ServiceReply {
        invoke_id,
        service_id,
        net_id,
        port,
        items,
    })
}

/// Route negotiation agent over one bound UDP socket.
pub struct RouteClient {
    socket: UdpSocket,
    peer: SocketAddr,
    local_net_id: AmsNetId,
    reply_timeout: Duration,
    invoke_id: u32,
}

impl RouteClient {
    /// Bind an ephemeral local socket aimed at the peer's discovery endpoint.
    pub async fn bind(peer: SocketAddr, local_net_id: AmsNetId) -> Result<Self> {
        let bind_addr: SocketAddr = if peer.is_ipv4() {
            "0.0.0.0:0".parse().unwrap()
        } else {
            "[::]:0".parse().unwrap()
        };
        let socket = UdpSocket::bind(bind_addr)
            .await
            .map_err(Error::RouteUnreachable)?;
        Ok(Self {
            socket,
            peer,
            local_net_id,
            reply_timeout: Duration::from_secs(5),
            invoke_id: 0,
        })
    }

    /// Override the reply deadline (default 5 s).
    pub fn with_timeout(mut self, reply_timeout: Duration) -> Self {
        self.reply_timeout = reply_timeout;
        self
    }

    async fn exchange(&mut self, service_id: u32, payload: &[u8]) -> Result<ServiceReply> {
        self.invoke_id = self.invoke_id.wrapping_add(1);
        let datagram = build_datagram(self.invoke_id, service_id, payload);
        self.socket
            .send_to(&datagram, self.peer)
            .await
            .map_err(Error::RouteUnreachable)?;

        let mut buf = vec![0u8; 2048];
        loop {
            let (len, from) = timeout(self.reply_timeout, self.socket.recv_from(&mut buf))
                .await
                .map_err(|_| Error::RouteTimeout)?
                .map_err(Error::RouteUnreachable)?;
            let reply = parse_reply(&buf[..len])?;
            // Stale or foreign datagrams are skipped, not fatal.
            if reply.invoke_id != self.invoke_id
                || reply.service_id != (service_id | service::RESPONSE)
            {
                debug!(%from, service = reply.service_id, "skipping unrelated UDP reply");
                continue;
            }
            return Ok(reply);
        }
    }

    /// Ask the peer for its net id and system service port.
    pub async fn discover(&mut self) -> Result<AmsAddr> {
        let payload = build_identity_payload(self.local_net_id, 0, &[]);
        let reply = self.exchange(service::READ_SERVICE_INFO, &payload).await?;
        debug!(peer = %reply.net_id, port = reply.port, "discovered ADS peer");
        Ok(AmsAddr::new(reply.net_id, reply.port))
    }

    /// Register a route entry on the peer. Succeeds iff the peer confirms
    /// with a zero status tag.
    pub async fn add_route(&mut self, spec: &RouteSpec) -> Result<()> {
        let items = [
            (tag::ROUTE_NAME, cstr(&spec.route_name)),
            (tag::NET_ID, Bytes::copy_from_slice(spec.net_id.as_bytes())),
            (tag::USER_NAME, cstr(&spec.user_name)),
            (tag::PASSWORD, cstr(&spec.password)),
            (tag::HOST, cstr(&spec.host)),
        ];
        let payload = build_identity_payload(self.local_net_id, 0, &items);
        let reply = self.exchange(service::ADD_ROUTE, &payload).await?;
        let status = reply
            .items
            .iter()
            .find(|(id, _)| *id == tag::STATUS)
            .and_then(|(_, data)| {
                data.get(0..4)
                    .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            })
            .unwrap_or(0);
        if status != 0 {
            return Err(Error::RouteRefused { status });
        }
        debug!(route = %spec.route_name, "route registered on peer");
        Ok(())
    }

    /// Remove the route entry again. Best-effort teardown: the reply status
    /// is not inspected beyond frame validity.
    pub async fn delete_route(&mut self, route_name: &str) -> Result<()> {
        let items = [(tag::ROUTE_NAME, cstr(route_name))];
        let payload = build_identity_payload(self.local_net_id, 0, &items);
        self.exchange(service::DEL_ROUTE, &payload).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn datagram_layout() {
        let dg = build_datagram(3, service::ADD_ROUTE, &[0xAB]);
        assert_eq!(&dg[0..4], &[0x03, 0x66, 0x14, 0x71]);
        assert_eq!(&dg[4..8], &3u32.to_le_bytes());
        assert_eq!(&dg[8..12], &service::ADD_ROUTE.to_le_bytes());
        assert_eq!(dg[12], 0xAB);
    }

    #[test]
    fn reply_parse_round_trip() {
        let net_id: AmsNetId = "10.0.0.1.3.1".parse().unwrap();
        let mut body = BytesMut::new();
        body.put_slice(net_id.as_bytes());
        body.put_u16_le(10_000);
        body.put_u32_le(1);
        put_tag(&mut body, tag::STATUS, &0u32.to_le_bytes());
        let dg = build_datagram(7, service::ADD_ROUTE | service::RESPONSE, &body);

        let reply = parse_reply(&dg).unwrap();
        assert_eq!(reply.invoke_id, 7);
        assert_eq!(reply.net_id, net_id);
        assert_eq!(reply.port, 10_000);
        assert_eq!(reply.items.len(), 1);
        assert_eq!(reply.items[0].0, tag::STATUS);
    }

    #[test]
    fn reply_rejects_wrong_cookie() {
        let mut dg = BytesMut::from(&build_datagram(1, service::RESPONSE, &[0u8; 12])[..]);
        dg[0] = 0;
        assert!(parse_reply(&dg).is_err());
    }

    #[test]
    fn reply_rejects_truncated_item() {
        let net_id: AmsNetId = "10.0.0.1.3.1".parse().unwrap();
        let mut body = BytesMut::new();
        body.put_slice(net_id.as_bytes());
        body.put_u16_le(10_000);
        body.put_u32_le(1);
        body.put_u16_le(tag::STATUS);
        body.put_u16_le(4);
        body.put_u8(0); // 1 of 4 declared bytes
        let dg = build_datagram(1, service::RESPONSE, &body);
        assert!(parse_reply(&dg).is_err());
    }
}
