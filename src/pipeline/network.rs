//! Packet transports used by pipeline workers.
//!
//! [`UdpNetwork`] is the real thing: multicast membership, interface
//! selection and loopback control through `socket2`, I/O through tokio.
//! [`MemoryNetwork`] is an in-process multicast bus with the same
//! semantics, used to run whole pipelines without touching the host network.

use std::collections::HashMap;
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::atomic::{AtomicU16, AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::broadcast;

use crate::config::MediaAddress;

/// Receiving socket.
#[async_trait]
pub trait RxSocket: Send {
    /// Receives one datagram into `buf`.
    async fn recv(&mut self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)>;
}

/// Transmitting socket bound to one destination.
#[async_trait]
pub trait TxSocket: Send + Sync {
    /// Sends one datagram.
    async fn send(&self, packet: &[u8]) -> io::Result<()>;
}

/// Opens sockets. Called from inside a worker's runtime.
#[async_trait]
pub trait Network: Send + Sync {
    /// Opens a socket receiving from `addr`, joining the group if multicast.
    async fn open_rx(
        &self,
        addr: MediaAddress,
        interface: Option<Ipv4Addr>,
    ) -> io::Result<Box<dyn RxSocket>>;

    /// Opens a socket sending to `addr`.
    async fn open_tx(
        &self,
        addr: MediaAddress,
        interface: Option<Ipv4Addr>,
        multicast_loop: bool,
    ) -> io::Result<Box<dyn TxSocket>>;
}

/// Host UDP networking.
#[derive(Debug, Clone, Copy, Default)]
pub struct UdpNetwork;

struct UdpRx(UdpSocket);

#[async_trait]
impl RxSocket for UdpRx {
    async fn recv(&mut self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        self.0.recv_from(buf).await
    }
}

struct UdpTx(UdpSocket);

#[async_trait]
impl TxSocket for UdpTx {
    async fn send(&self, packet: &[u8]) -> io::Result<()> {
        self.0.send(packet).await.map(|_| ())
    }
}

fn ipv4_only(addr: MediaAddress) -> io::Result<Ipv4Addr> {
    match addr.ip {
        IpAddr::V4(ip) => Ok(ip),
        IpAddr::V6(_) => Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "only IPv4 streams are supported",
        )),
    }
}

#[async_trait]
impl Network for UdpNetwork {
    async fn open_rx(
        &self,
        addr: MediaAddress,
        interface: Option<Ipv4Addr>,
    ) -> io::Result<Box<dyn RxSocket>> {
        let ip = ipv4_only(addr)?;
        let iface = interface.unwrap_or(Ipv4Addr::UNSPECIFIED);

        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
        // Several streams and the backup observer may share a port.
        socket.set_reuse_address(true)?;
        socket.bind(&SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, addr.port).into())?;
        if ip.is_multicast() {
            socket.join_multicast_v4(&ip, &iface)?;
        }
        socket.set_nonblocking(true)?;

        let socket: std::net::UdpSocket = socket.into();
        Ok(Box::new(UdpRx(UdpSocket::from_std(socket)?)))
    }

    async fn open_tx(
        &self,
        addr: MediaAddress,
        interface: Option<Ipv4Addr>,
        multicast_loop: bool,
    ) -> io::Result<Box<dyn TxSocket>> {
        let ip = ipv4_only(addr)?;
        let local = interface.unwrap_or(Ipv4Addr::UNSPECIFIED);

        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
        if ip.is_multicast() {
            socket.set_multicast_loop_v4(multicast_loop)?;
            // Some platforms refuse TTL/iface tweaks; the defaults still work.
            let _ = socket.set_multicast_ttl_v4(32);
            if let Some(iface) = interface {
                let _ = socket.set_multicast_if_v4(&iface);
            }
        }
        socket.bind(&SocketAddrV4::new(local, 0).into())?;
        socket.set_nonblocking(true)?;

        let socket: std::net::UdpSocket = socket.into();
        let socket = UdpSocket::from_std(socket)?;
        socket.connect(addr.socket_addr()).await?;
        Ok(Box::new(UdpTx(socket)))
    }
}

/// Depth of each group's broadcast channel.
const BUS_DEPTH: usize = 512;

/// Host id used for packets injected from outside any host.
const EXTERNAL_HOST: u32 = u32::MAX;

#[derive(Clone)]
struct Datagram {
    data: Arc<[u8]>,
    from: SocketAddr,
    host: u32,
    looped: bool,
    poison: bool,
}

#[derive(Default)]
struct Bus {
    groups: Mutex<HashMap<SocketAddr, broadcast::Sender<Datagram>>>,
    next_host: AtomicU32,
    next_port: AtomicU16,
}

impl Bus {
    fn group(&self, addr: SocketAddr) -> broadcast::Sender<Datagram> {
        self.groups
            .lock()
            .entry(addr)
            .or_insert_with(|| broadcast::channel(BUS_DEPTH).0)
            .clone()
    }
}

/// In-process multicast bus.
///
/// Every clone shares the bus and acts as the same host. Use
/// [`host`](Self::host) to get a handle acting as a different host; packets
/// sent with multicast loop disabled are only delivered to other hosts.
///
/// # Example
///
/// ```
/// use aes67_mux::MemoryNetwork;
///
/// let primary = MemoryNetwork::new();
/// let backup = primary.host();
/// # let _ = backup;
/// ```
#[derive(Clone)]
pub struct MemoryNetwork {
    bus: Arc<Bus>,
    host: u32,
}

impl MemoryNetwork {
    /// Creates an empty bus and a handle for its first host.
    pub fn new() -> Self {
        let bus = Arc::new(Bus::default());
        let host = bus.next_host.fetch_add(1, Ordering::Relaxed);
        Self { bus, host }
    }

    /// Returns a handle on the same bus acting as a new host.
    #[must_use]
    pub fn host(&self) -> Self {
        Self {
            bus: self.bus.clone(),
            host: self.bus.next_host.fetch_add(1, Ordering::Relaxed),
        }
    }

    /// Delivers `packet` to every receiver of `to`, as if sent by `from`
    /// on a remote host.
    pub fn inject(&self, to: SocketAddr, from: SocketAddr, packet: &[u8]) {
        let _ = self.bus.group(to).send(Datagram {
            data: packet.into(),
            from,
            host: EXTERNAL_HOST,
            looped: true,
            poison: false,
        });
    }

    /// Makes every receiver of `to` fail its next receive.
    pub fn break_group(&self, to: SocketAddr) {
        let _ = self.bus.group(to).send(Datagram {
            data: Arc::from(&[][..]),
            from: to,
            host: EXTERNAL_HOST,
            looped: true,
            poison: true,
        });
    }

    fn local_addr(&self) -> SocketAddr {
        let port = 40000 + self.bus.next_port.fetch_add(1, Ordering::Relaxed) % 20000;
        let host = self.host.to_be_bytes();
        SocketAddr::from(([10, host[2], host[3], 1], port))
    }
}

impl Default for MemoryNetwork {
    fn default() -> Self {
        Self::new()
    }
}

struct MemoryRx {
    rx: broadcast::Receiver<Datagram>,
    host: u32,
}

#[async_trait]
impl RxSocket for MemoryRx {
    async fn recv(&mut self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        loop {
            let datagram = match self.rx.recv().await {
                Ok(d) => d,
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => {
                    return Err(io::Error::new(io::ErrorKind::BrokenPipe, "bus closed"))
                }
            };
            if datagram.poison {
                return Err(io::Error::new(
                    io::ErrorKind::ConnectionReset,
                    "group broken",
                ));
            }
            if datagram.host == self.host && !datagram.looped {
                continue;
            }
            let n = datagram.data.len().min(buf.len());
            buf[..n].copy_from_slice(&datagram.data[..n]);
            return Ok((n, datagram.from));
        }
    }
}

struct MemoryTx {
    group: broadcast::Sender<Datagram>,
    from: SocketAddr,
    host: u32,
    looped: bool,
}

#[async_trait]
impl TxSocket for MemoryTx {
    async fn send(&self, packet: &[u8]) -> io::Result<()> {
        // No receivers is not an error on a multicast group.
        let _ = self.group.send(Datagram {
            data: packet.into(),
            from: self.from,
            host: self.host,
            looped: self.looped,
            poison: false,
        });
        Ok(())
    }
}

#[async_trait]
impl Network for MemoryNetwork {
    async fn open_rx(
        &self,
        addr: MediaAddress,
        _interface: Option<Ipv4Addr>,
    ) -> io::Result<Box<dyn RxSocket>> {
        Ok(Box::new(MemoryRx {
            rx: self.bus.group(addr.socket_addr()).subscribe(),
            host: self.host,
        }))
    }

    async fn open_tx(
        &self,
        addr: MediaAddress,
        _interface: Option<Ipv4Addr>,
        multicast_loop: bool,
    ) -> io::Result<Box<dyn TxSocket>> {
        Ok(Box::new(MemoryTx {
            group: self.bus.group(addr.socket_addr()),
            from: self.local_addr(),
            host: self.host,
            looped: multicast_loop,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn group() -> MediaAddress {
        MediaAddress::new(Ipv4Addr::new(239, 69, 0, 9), 5004)
    }

    #[tokio::test]
    async fn test_memory_multicast_reaches_all_receivers() {
        let net = MemoryNetwork::new();
        let mut a = net.open_rx(group(), None).await.unwrap();
        let mut b = net.open_rx(group(), None).await.unwrap();
        let tx = net.open_tx(group(), None, true).await.unwrap();

        tx.send(&[1, 2, 3]).await.unwrap();
        let mut buf = [0u8; 16];
        assert_eq!(a.recv(&mut buf).await.unwrap().0, 3);
        assert_eq!(b.recv(&mut buf).await.unwrap().0, 3);
        assert_eq!(&buf[..3], &[1, 2, 3]);
    }

    #[tokio::test]
    async fn test_memory_loop_disabled_skips_own_host() {
        let net = MemoryNetwork::new();
        let other = net.host();
        let mut local = net.open_rx(group(), None).await.unwrap();
        let mut remote = other.open_rx(group(), None).await.unwrap();
        let tx = net.open_tx(group(), None, false).await.unwrap();

        tx.send(&[9]).await.unwrap();
        let mut buf = [0u8; 4];
        assert_eq!(remote.recv(&mut buf).await.unwrap().0, 1);

        // The local receiver only sees the next packet from elsewhere
        other.inject(group().socket_addr(), "10.9.9.9:5004".parse().unwrap(), &[4, 4]);
        let (n, from) = local.recv(&mut buf).await.unwrap();
        assert_eq!(n, 2);
        assert_eq!(from, "10.9.9.9:5004".parse::<SocketAddr>().unwrap());
    }

    #[tokio::test]
    async fn test_memory_break_group() {
        let net = MemoryNetwork::new();
        let mut rx = net.open_rx(group(), None).await.unwrap();
        net.break_group(group().socket_addr());
        let mut buf = [0u8; 4];
        assert!(rx.recv(&mut buf).await.is_err());
    }
}
