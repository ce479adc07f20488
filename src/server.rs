//! UDP packet reader.
//!
//! One socket, one receive loop. Each datagram is parsed and fanned out to
//! every registered handler on its own task, so one slow backend call never
//! blocks the next datagram. Shutdown is a watch-channel flip; in-flight
//! handlers finish at their own pace.

use std::ffi::CStr;
use std::io::{self, IoSliceMut};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::os::fd::AsRawFd;
use std::sync::Arc;

use async_trait::async_trait;
use nix::sys::socket::{self, sockopt, ControlMessageOwned, MsgFlags, SockaddrIn};
use socket2::{Domain, Protocol, Socket, Type};
use tokio::io::Interest;
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tracing::{error, info};

use crate::error::{DhcpError, Result};
use crate::packet::{self, Message};

/// Per-datagram scratch size.
const RECV_BUF_SIZE: usize = 4096;

/// DHCP client port, the broadcast reply destination.
const DHCP_CLIENT_PORT: u16 = 68;

/// Receiving-interface metadata for one datagram.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InterfaceInfo {
    /// Kernel interface index the datagram arrived on; 0 when unknown.
    pub index: u32,
    /// Interface name resolved from the index, best effort.
    pub name: Option<String>,
}

/// One parsed datagram as handed to packet handlers.
#[derive(Debug, Clone)]
pub struct Packet {
    pub message: Message,
    /// Reply destination. A nil or 0.0.0.0 peer (a DISCOVER from an
    /// unconfigured client) is rewritten to 255.255.255.255 before handlers
    /// see it, so replies are broadcast.
    pub peer: SocketAddrV4,
    pub interface: InterfaceInfo,
}

/// Responds to DHCP messages. Registered handlers run concurrently and
/// independently per datagram; one handler's failure never affects a
/// sibling.
#[async_trait]
pub trait PacketHandler: Send + Sync {
    async fn on_packet(&self, socket: Arc<UdpSocket>, packet: Packet);
}

/// DHCPv4 listener owning the UDP socket and the handler collection.
pub struct Server {
    socket: Arc<UdpSocket>,
    handlers: Vec<Arc<dyn PacketHandler>>,
}

impl Server {
    /// Binds a broadcast-capable socket with per-packet interface metadata
    /// enabled, optionally pinned to a named interface. Binding 0.0.0.0
    /// captures broadcast traffic.
    pub fn bind(listen_addr: SocketAddrV4, interface: Option<&str>) -> Result<Self> {
        let socket = create_socket(listen_addr, interface)?;
        Self::from_std(socket)
    }

    /// Wraps a preconfigured socket. The socket must already be
    /// non-blocking; SO_BROADCAST and IP_PKTINFO are the caller's choice.
    pub fn from_std(socket: std::net::UdpSocket) -> Result<Self> {
        let socket = UdpSocket::from_std(socket)?;
        Ok(Self {
            socket: Arc::new(socket),
            handlers: Vec::new(),
        })
    }

    /// Registers a packet handler. Handlers form an ordered collection and
    /// each receives every datagram.
    pub fn register(&mut self, handler: Arc<dyn PacketHandler>) {
        self.handlers.push(handler);
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// Reads datagrams until `shutdown` flips to true (or its sender is
    /// dropped). A parse failure drops the datagram and continues; one bad
    /// packet never stops the loop.
    pub async fn serve(&self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        info!(addr = ?self.socket.local_addr().ok(), "DHCP server listening");
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("DHCP server shutting down");
                        return Ok(());
                    }
                }
                received = self.recv() => {
                    let (data, peer, if_index) = match received {
                        Ok(r) => r,
                        Err(err) => {
                            if *shutdown.borrow() {
                                info!("DHCP server shutting down");
                                return Ok(());
                            }
                            error!(error = %err, "error reading from socket");
                            continue;
                        }
                    };
                    let message = match packet::parse(&data) {
                        Ok(m) => m,
                        Err(err) => {
                            info!(error = %err, "failed to parse DHCPv4 packet");
                            continue;
                        }
                    };
                    let peer = match peer {
                        Some(p) if !p.ip().is_unspecified() => p,
                        Some(p) => SocketAddrV4::new(Ipv4Addr::BROADCAST, p.port()),
                        None => SocketAddrV4::new(Ipv4Addr::BROADCAST, DHCP_CLIENT_PORT),
                    };
                    let interface = InterfaceInfo {
                        index: if_index,
                        name: interface_name(if_index),
                    };
                    let pkt = Packet { message, peer, interface };
                    for handler in &self.handlers {
                        let handler = Arc::clone(handler);
                        let socket = Arc::clone(&self.socket);
                        let pkt = pkt.clone();
                        tokio::spawn(async move {
                            handler.on_packet(socket, pkt).await;
                        });
                    }
                }
            }
        }
    }

    /// One `recvmsg` with the arrival interface pulled from IP_PKTINFO.
    async fn recv(&self) -> io::Result<(Vec<u8>, Option<SocketAddrV4>, u32)> {
        loop {
            self.socket.readable().await?;
            let mut buf = vec![0u8; RECV_BUF_SIZE];
            let result = self.socket.try_io(Interest::READABLE, || {
                let mut cmsg = nix::cmsg_space!(libc::in_pktinfo);
                let mut iov = [IoSliceMut::new(&mut buf)];
                let msg = socket::recvmsg::<SockaddrIn>(
                    self.socket.as_raw_fd(),
                    &mut iov,
                    Some(&mut cmsg),
                    MsgFlags::empty(),
                )
                .map_err(io::Error::from)?;
                let len = msg.bytes;
                let peer = msg
                    .address
                    .as_ref()
                    .map(|sa| SocketAddrV4::new(sa.ip(), sa.port()));
                let if_index = msg
                    .cmsgs()
                    .ok()
                    .and_then(|cmsgs| {
                        cmsgs
                            .filter_map(|c| match c {
                                ControlMessageOwned::Ipv4PacketInfo(pi) => {
                                    Some(pi.ipi_ifindex as u32)
                                }
                                _ => None,
                            })
                            .next()
                    })
                    .unwrap_or(0);
                Ok((len, peer, if_index))
            });
            match result {
                Ok((len, peer, if_index)) => {
                    buf.truncate(len);
                    return Ok((buf, peer, if_index));
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => continue,
                Err(err) => return Err(err),
            }
        }
    }
}

fn create_socket(
    listen_addr: SocketAddrV4,
    interface: Option<&str>,
) -> Result<std::net::UdpSocket> {
    let bind_err = |source: io::Error| DhcpError::BindFailed {
        addr: SocketAddr::V4(listen_addr),
        source,
    };
    let sock = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP)).map_err(bind_err)?;
    sock.set_reuse_address(true).map_err(bind_err)?;
    sock.set_broadcast(true).map_err(bind_err)?;
    socket::setsockopt(&sock, sockopt::Ipv4PacketInfo, &true)
        .map_err(|errno| bind_err(io::Error::from(errno)))?;
    if let Some(name) = interface {
        #[cfg(target_os = "linux")]
        {
            sock.bind_device(Some(name.as_bytes())).map_err(bind_err)?;
            info!(interface = name, "bound socket to interface");
        }
        #[cfg(not(target_os = "linux"))]
        tracing::warn!(
            interface = name,
            "binding to a named interface is not supported on this platform"
        );
    }
    sock.set_nonblocking(true).map_err(bind_err)?;
    sock.bind(&listen_addr.into()).map_err(bind_err)?;
    Ok(sock.into())
}

/// Best-effort interface name lookup from an interface index.
fn interface_name(index: u32) -> Option<String> {
    if index == 0 {
        return None;
    }
    let mut buf = [0 as libc::c_char; libc::IF_NAMESIZE];
    let name = unsafe { libc::if_indextoname(index, buf.as_mut_ptr()) };
    if name.is_null() {
        return None;
    }
    let name = unsafe { CStr::from_ptr(name) };
    name.to_str().ok().map(str::to_owned)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::{opt, MessageType};
    use std::sync::Mutex;
    use std::time::Duration;

    /// Records every packet it sees.
    struct RecordingHandler {
        seen: Mutex<Vec<Packet>>,
        notify: tokio::sync::Notify,
    }

    impl RecordingHandler {
        fn new() -> Self {
            Self {
                seen: Mutex::new(Vec::new()),
                notify: tokio::sync::Notify::new(),
            }
        }
    }

    #[async_trait]
    impl PacketHandler for RecordingHandler {
        async fn on_packet(&self, _socket: Arc<UdpSocket>, packet: Packet) {
            self.seen.lock().unwrap().push(packet);
            self.notify.notify_one();
        }
    }

    fn discover_bytes() -> Vec<u8> {
        let mut msg = Message::default();
        msg.chaddr[..6].copy_from_slice(&[0x01, 0x02, 0x03, 0x04, 0x05, 0x06]);
        msg.options
            .insert(opt::MESSAGE_TYPE, [MessageType::Discover as u8]);
        msg.to_bytes()
    }

    #[test]
    fn test_interface_name_unknown_index() {
        assert_eq!(interface_name(0), None);
        // indices are small; this one should not exist
        assert_eq!(interface_name(u32::MAX - 1), None);
    }

    #[tokio::test]
    async fn test_serve_delivers_parsed_packets() {
        let loopback = SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0);
        let mut server = Server::bind(loopback, None).unwrap();
        let handler = Arc::new(RecordingHandler::new());
        server.register(handler.clone());
        let server_addr = server.local_addr().unwrap();

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let serve = tokio::spawn(async move { server.serve(shutdown_rx).await });

        let client = tokio::net::UdpSocket::bind((Ipv4Addr::LOCALHOST, 0))
            .await
            .unwrap();
        // garbage first: must be dropped without killing the loop
        client.send_to(&[0xff; 10], server_addr).await.unwrap();
        client.send_to(&discover_bytes(), server_addr).await.unwrap();

        tokio::time::timeout(Duration::from_secs(5), handler.notify.notified())
            .await
            .expect("handler never saw the packet");

        {
            let seen = handler.seen.lock().unwrap();
            assert_eq!(seen.len(), 1);
            let pkt = &seen[0];
            assert_eq!(pkt.message.message_type(), Some(MessageType::Discover));
            // loopback peer is a real address, not rewritten to broadcast
            assert_eq!(*pkt.peer.ip(), Ipv4Addr::LOCALHOST);
            assert_eq!(
                pkt.peer.port(),
                match client.local_addr().unwrap() {
                    SocketAddr::V4(a) => a.port(),
                    _ => unreachable!(),
                }
            );
            // loopback delivery carries the lo interface index
            assert_ne!(pkt.interface.index, 0);
        }

        shutdown_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), serve)
            .await
            .expect("serve did not stop")
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_serve_stops_when_sender_dropped() {
        let loopback = SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0);
        let server = Server::bind(loopback, None).unwrap();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let serve = tokio::spawn(async move { server.serve(shutdown_rx).await });
        drop(shutdown_tx);
        tokio::time::timeout(Duration::from_secs(5), serve)
            .await
            .expect("serve did not stop")
            .unwrap()
            .unwrap();
    }
}
