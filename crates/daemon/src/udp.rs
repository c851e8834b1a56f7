//! Non-blocking UDP endpoint for framed negotiation packets.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Mutex;
use std::time::Duration;

use log::info;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;

use crate::error::{NegotioError, Result};
use crate::negotiate::PacketSink;
use crate::packet::Packet;

/// Receive buffer size; comfortably above the largest valid packet.
pub const RECV_BUFFER_SIZE: usize = 4096;

/// Datagram endpoint owning the UDP socket.
///
/// Sends serialize into one shared encode buffer guarded by a mutex, so
/// concurrent senders are ordered and the buffer is reused across packets.
/// The mutex is only ever held around the encode and the single non-blocking
/// send syscall.
pub struct UdpEndpoint {
    socket: UdpSocket,
    send_buf: Mutex<Vec<u8>>,
}

impl UdpEndpoint {
    /// Bind the endpoint on all interfaces at `port` (0 picks an ephemeral
    /// port). The raw socket gets address reuse and non-blocking mode
    /// before it is handed to tokio.
    pub async fn bind(port: u16) -> Result<Self> {
        let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port);
        let raw = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
        raw.set_reuse_address(true)?;
        raw.set_nonblocking(true)?;
        raw.bind(&addr.into())?;
        let socket = UdpSocket::from_std(raw.into())?;
        info!("UDP endpoint bound on {}", socket.local_addr()?);
        Ok(Self {
            socket,
            send_buf: Mutex::new(Vec::with_capacity(RECV_BUFFER_SIZE)),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// Serialize and transmit one packet in a single syscall.
    pub fn send(&self, packet: &Packet, peer: SocketAddr) -> Result<()> {
        let mut buf = self.send_buf.lock().expect("send buffer mutex poisoned");
        packet.encode_into(&mut buf);
        self.socket.try_send_to(&buf, peer)?;
        Ok(())
    }

    /// Wait up to `timeout` for a datagram and decode it.
    ///
    /// Returns `Timeout` when the wait elapses, `Socket` on a recv failure,
    /// and `InvalidParameter` for a malformed datagram.
    pub async fn recv(&self, timeout: Duration) -> Result<(Packet, SocketAddr)> {
        let mut buf = [0u8; RECV_BUFFER_SIZE];
        let (len, peer) = tokio::time::timeout(timeout, self.socket.recv_from(&mut buf))
            .await
            .map_err(|_| NegotioError::Timeout)??;
        let packet = Packet::decode(&buf[..len])?;
        Ok((packet, peer))
    }
}

impl PacketSink for UdpEndpoint {
    fn send_packet(&self, packet: &Packet, peer: SocketAddr) -> Result<()> {
        self.send(packet, peer)
    }
}
