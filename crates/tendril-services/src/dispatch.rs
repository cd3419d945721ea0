//! Routes datagrams arriving on the mesh socket to handlers by type tag.
//!
//! The handler table can change while the receive loop runs. A handler is
//! cloned out of the table before it is invoked, so registering or removing
//! handlers from inside a handler never blocks the loop.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;
use std::time::SystemTime;

use anyhow::{Context, Result};
use dashmap::DashMap;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::broadcast;

use tendril_core::wire::{unix_nanos, PacketType, PingPacket};

/// Receive buffer size. Every datagram the mesh produces fits in one MTU.
pub const RECV_BUFFER: usize = 1500;

/// A consumer of one packet type.
///
/// Handlers run on the receive task and must not block; anything slow
/// belongs in a spawned task.
pub trait PacketHandler: Send + Sync {
    fn handle(&self, socket: &UdpSocket, from: SocketAddrV4, datagram: &[u8]);
}

impl<F> PacketHandler for F
where
    F: Fn(&UdpSocket, SocketAddrV4, &[u8]) + Send + Sync,
{
    fn handle(&self, socket: &UdpSocket, from: SocketAddrV4, datagram: &[u8]) {
        self(socket, from, datagram)
    }
}

/// What happened to one received datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatched {
    Handled(PacketType),
    TooShort,
    UnknownType(u8),
    NoHandler(PacketType),
}

pub struct Dispatcher {
    socket: Arc<UdpSocket>,
    handlers: DashMap<PacketType, Arc<dyn PacketHandler>>,
}

impl Dispatcher {
    /// Bind the mesh socket and start with an empty handler table.
    pub fn bind(addr: SocketAddr) -> Result<Self> {
        let socket = make_mesh_socket(addr).context("failed to create mesh socket")?;
        let socket = UdpSocket::from_std(socket).context("failed to convert to tokio UdpSocket")?;
        Ok(Self::from_socket(Arc::new(socket)))
    }

    pub fn from_socket(socket: Arc<UdpSocket>) -> Self {
        Self {
            socket,
            handlers: DashMap::new(),
        }
    }

    pub fn socket(&self) -> Arc<UdpSocket> {
        self.socket.clone()
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.socket.local_addr().context("mesh socket has no local address")
    }

    /// Install (or replace) the handler for `packet_type`.
    pub fn register(&self, packet_type: PacketType, handler: Arc<dyn PacketHandler>) {
        self.handlers.insert(packet_type, handler);
    }

    /// Returns true if a handler was removed.
    pub fn remove(&self, packet_type: PacketType) -> bool {
        self.handlers.remove(&packet_type).is_some()
    }

    /// Route one datagram. The table entry is released before the handler runs.
    pub fn dispatch(&self, from: SocketAddrV4, datagram: &[u8]) -> Dispatched {
        if datagram.len() <= 1 {
            tracing::trace!(%from, len = datagram.len(), "dropping runt datagram");
            return Dispatched::TooShort;
        }

        let packet_type = match PacketType::try_from(datagram[0]) {
            Ok(t) => t,
            Err(e) => {
                tracing::warn!(%from, error = %e, "dropping datagram");
                return Dispatched::UnknownType(datagram[0]);
            }
        };

        let handler = match self.handlers.get(&packet_type) {
            Some(entry) => entry.value().clone(),
            None => {
                tracing::debug!(%from, ?packet_type, "no handler registered");
                return Dispatched::NoHandler(packet_type);
            }
        };

        handler.handle(&self.socket, from, datagram);
        Dispatched::Handled(packet_type)
    }

    /// Receive loop. Returns when `shutdown` fires.
    pub async fn run(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) -> Result<()> {
        let mut buf = vec![0u8; RECV_BUFFER];

        tracing::info!(addr = ?self.socket.local_addr().ok(), "mesh dispatcher starting");

        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    tracing::info!("mesh dispatcher shutting down");
                    return Ok(());
                }
                received = self.socket.recv_from(&mut buf) => {
                    let (len, from) = match received {
                        Ok(r) => r,
                        Err(e) => {
                            tracing::warn!(error = %e, "recv_from failed");
                            continue;
                        }
                    };

                    let from = match from {
                        SocketAddr::V4(v4) => v4,
                        SocketAddr::V6(_) => {
                            tracing::trace!(%from, "ignoring IPv6 sender");
                            continue;
                        }
                    };

                    self.dispatch(from, &buf[..len]);
                }
            }
        }
    }
}

// ── Stateless responder ───────────────────────────────────────────────────────

/// Answer a ping request by echoing it with our current time. Keeps no state.
pub fn respond_to_ping(socket: &UdpSocket, from: SocketAddrV4, datagram: &[u8]) {
    let request = match PingPacket::decode(datagram) {
        Ok((PacketType::PingRequest, p)) => p,
        Ok((other, _)) => {
            tracing::debug!(%from, ?other, "ping responder got a non-request");
            return;
        }
        Err(e) => {
            tracing::warn!(%from, error = %e, "dropping malformed ping request");
            return;
        }
    };

    let reply = request.respond(unix_nanos(SystemTime::now())).encode_response();
    if let Err(e) = socket.try_send_to(&reply, SocketAddr::V4(from)) {
        tracing::debug!(%from, error = %e, "ping response not sent");
    }
}

/// Create the IPv4 UDP socket the whole mesh shares.
fn make_mesh_socket(addr: SocketAddr) -> Result<std::net::UdpSocket> {
    let addr = match addr {
        SocketAddr::V4(v4) => v4,
        SocketAddr::V6(_) => SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, addr.port()),
    };

    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP)).context("socket()")?;
    socket.set_reuse_address(true).context("SO_REUSEADDR")?;
    socket.set_nonblocking(true).context("set_nonblocking")?;
    socket.bind(&SocketAddr::V4(addr).into()).context("bind()")?;

    Ok(socket.into())
}
