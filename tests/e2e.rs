//! End-to-end scenarios over loopback UDP sockets: a running server, a real
//! client socket, and the reservation handler wired to a fixture backend.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use macaddr::MacAddr6;
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use url::Url;

use netboot_dhcp::packet::{self, opt};
use netboot_dhcp::{
    BackendError, BackendReader, DhcpRecord, Handler, Message, MessageType, NetbootRecord,
    Server, ServerConfig,
};

const TEST_MAC: MacAddr6 = MacAddr6::new(0x01, 0x02, 0x03, 0x04, 0x05, 0x06);

struct FixtureBackend;

#[async_trait]
impl BackendReader for FixtureBackend {
    async fn read(&self, mac: MacAddr6) -> Result<(DhcpRecord, NetbootRecord), BackendError> {
        if mac != TEST_MAC {
            return Err(BackendError::NotFound { mac });
        }
        let dhcp = DhcpRecord {
            mac_address: TEST_MAC,
            ip_address: Ipv4Addr::new(192, 168, 1, 100),
            subnet_mask: Some(Ipv4Addr::new(255, 255, 255, 0)),
            default_gateway: Some(Ipv4Addr::new(192, 168, 1, 1)),
            name_servers: vec![Ipv4Addr::new(1, 1, 1, 1)],
            hostname: Some("test-host".to_string()),
            domain_name: Some("mydomain.com".to_string()),
            broadcast_address: Some(Ipv4Addr::new(192, 168, 1, 255)),
            ntp_servers: vec![Ipv4Addr::new(132, 163, 96, 2)],
            lease_time: 60,
            domain_search: vec!["mydomain.com".to_string()],
        };
        let netboot = NetbootRecord {
            allow_netboot: true,
            ipxe_script_url: Some(Url::parse("http://localhost:8181/auto.ipxe").unwrap()),
        };
        Ok((dhcp, netboot))
    }
}

struct TestServer {
    addr: SocketAddr,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<netboot_dhcp::Result<()>>,
}

impl TestServer {
    async fn stop(self) {
        let _ = self.shutdown.send(true);
        let _ = tokio::time::timeout(Duration::from_secs(5), self.task).await;
    }
}

async fn start_server() -> TestServer {
    let config = Arc::new(
        ServerConfig::builder(Ipv4Addr::new(127, 0, 0, 1), Arc::new(FixtureBackend))
            .with_listen_addr(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0))
            .with_ipxe_bin_server_tftp(SocketAddrV4::new(Ipv4Addr::new(192, 168, 6, 5), 69))
            .with_ipxe_bin_server_http(Url::parse("http://192.168.1.34:8080").unwrap())
            .with_ipxe_script_url(Url::parse("http://localhost:8181/auto.ipxe").unwrap())
            .build(),
    );
    let mut server = Server::bind(config.listen_addr, None).unwrap();
    server.register(Arc::new(Handler::new(config)));
    let addr = server.local_addr().unwrap();
    let (shutdown, shutdown_rx) = watch::channel(false);
    let task = tokio::spawn(async move { server.serve(shutdown_rx).await });
    TestServer {
        addr,
        shutdown,
        task,
    }
}

fn base_request(message_type: MessageType) -> Message {
    let mut msg = Message {
        xid: 0x5ee0_b007,
        ..Message::default()
    };
    msg.chaddr[..6].copy_from_slice(TEST_MAC.as_bytes());
    msg.options.insert(opt::MESSAGE_TYPE, [message_type as u8]);
    msg
}

fn netboot_request(message_type: MessageType, arch: u16, opt60: &str) -> Message {
    let mut msg = base_request(message_type);
    msg.options.insert(opt::CLASS_IDENTIFIER, opt60.as_bytes());
    msg.options
        .insert(opt::CLIENT_SYSTEM_ARCHITECTURE, arch.to_be_bytes());
    msg.options
        .insert(opt::CLIENT_NETWORK_INTERFACE_ID, [1u8, 3, 0]);
    msg.options
        .insert(opt::CLIENT_MACHINE_IDENTIFIER, Vec::<u8>::new());
    msg
}

async fn exchange(server: &TestServer, request: &Message) -> Message {
    let client = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
    client
        .send_to(&request.to_bytes(), server.addr)
        .await
        .unwrap();
    let mut buf = vec![0u8; 4096];
    let (len, _) = tokio::time::timeout(Duration::from_secs(5), client.recv_from(&mut buf))
        .await
        .expect("no reply from server")
        .unwrap();
    packet::parse(&buf[..len]).unwrap()
}

#[tokio::test]
async fn scenario_plain_discover() {
    let server = start_server().await;
    let reply = exchange(&server, &base_request(MessageType::Discover)).await;

    assert_eq!(reply.message_type(), Some(MessageType::Offer));
    assert_eq!(reply.xid, 0x5ee0_b007);
    assert_eq!(reply.yiaddr, Ipv4Addr::new(192, 168, 1, 100));
    assert_eq!(reply.siaddr, Ipv4Addr::new(127, 0, 0, 1));
    assert_eq!(reply.server_identifier(), Some(Ipv4Addr::new(127, 0, 0, 1)));
    assert_eq!(reply.subnet_mask(), Some(Ipv4Addr::new(255, 255, 255, 0)));
    assert_eq!(reply.routers(), vec![Ipv4Addr::new(192, 168, 1, 1)]);
    assert_eq!(reply.name_servers(), vec![Ipv4Addr::new(1, 1, 1, 1)]);
    assert_eq!(reply.hostname().as_deref(), Some("test-host"));
    assert_eq!(reply.domain_name().as_deref(), Some("mydomain.com"));
    assert_eq!(
        reply.broadcast_address(),
        Some(Ipv4Addr::new(192, 168, 1, 255))
    );
    assert_eq!(reply.ntp_servers(), vec![Ipv4Addr::new(132, 163, 96, 2)]);
    assert_eq!(reply.lease_time(), Some(60));
    assert_eq!(reply.domain_search(), Some(vec!["mydomain.com".to_string()]));
    assert!(reply.class_identifier().is_none());
    assert!(reply.vendor_specific().is_none());
    assert_eq!(reply.boot_file(), "");

    server.stop().await;
}

#[tokio::test]
async fn scenario_uefi_http_client() {
    let server = start_server().await;
    let request = netboot_request(
        MessageType::Discover,
        19, // EFI ARM64 HTTP
        "HTTPClient:Arch:00016:UNDI:003001",
    );
    let reply = exchange(&server, &request).await;

    assert_eq!(reply.message_type(), Some(MessageType::Offer));
    assert_eq!(reply.boot_file(), "http://192.168.1.34:8080/snp.efi");
    assert_eq!(reply.class_identifier(), Some(&b"HTTPClient"[..]));
    let vendor = reply.vendor_specific().expect("option 43 missing");
    assert_eq!(&vendor[..3], &[6, 1, 8]);
    assert_eq!(vendor[3], 69);
    assert_eq!(vendor[4], 26);
    assert_eq!(vendor[5], 0x00); // traceparent version

    server.stop().await;
}

#[tokio::test]
async fn scenario_stock_ipxe_request() {
    let server = start_server().await;
    let mut request = netboot_request(
        MessageType::Request,
        7, // EFI x86-64
        "PXEClient:Arch:00007:UNDI:003001",
    );
    request.options.insert(opt::USER_CLASS, &b"iPXE"[..]);
    let reply = exchange(&server, &request).await;

    assert_eq!(reply.message_type(), Some(MessageType::Ack));
    assert_eq!(reply.boot_file(), "tftp://192.168.6.5:69/ipxe.efi");
    assert_eq!(reply.siaddr, Ipv4Addr::new(192, 168, 6, 5));

    server.stop().await;
}

#[tokio::test]
async fn scenario_tinkerbell_ipxe_request() {
    let server = start_server().await;
    let mut request = netboot_request(
        MessageType::Request,
        7,
        "PXEClient:Arch:00007:UNDI:003001",
    );
    request.options.insert(opt::USER_CLASS, &b"Tinkerbell"[..]);
    let reply = exchange(&server, &request).await;

    assert_eq!(reply.message_type(), Some(MessageType::Ack));
    assert_eq!(reply.boot_file(), "http://localhost:8181/auto.ipxe");
    assert_eq!(reply.siaddr, Ipv4Addr::UNSPECIFIED);

    server.stop().await;
}

#[tokio::test]
async fn scenario_first_contact_discover() {
    let server = start_server().await;
    let request = netboot_request(
        MessageType::Discover,
        0, // Intel x86PC
        "PXEClient:Arch:00000:UNDI:002001",
    );
    let reply = exchange(&server, &request).await;

    assert_eq!(reply.message_type(), Some(MessageType::Offer));
    assert_eq!(reply.boot_file(), "undionly.kpxe");
    assert_eq!(reply.siaddr, Ipv4Addr::new(192, 168, 6, 5));
    assert!(reply.vendor_specific().is_some());

    server.stop().await;
}

#[tokio::test]
async fn scenario_release_is_silent() {
    let server = start_server().await;
    let client = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
    client
        .send_to(&base_request(MessageType::Release).to_bytes(), server.addr)
        .await
        .unwrap();

    let mut buf = vec![0u8; 4096];
    let outcome =
        tokio::time::timeout(Duration::from_millis(750), client.recv_from(&mut buf)).await;
    assert!(outcome.is_err(), "RELEASE must not produce a reply");

    // server is still alive afterwards
    let reply = exchange(&server, &base_request(MessageType::Discover)).await;
    assert_eq!(reply.message_type(), Some(MessageType::Offer));

    server.stop().await;
}

#[tokio::test]
async fn scenario_unknown_mac_is_silent() {
    let server = start_server().await;
    let client = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
    let mut request = base_request(MessageType::Discover);
    request.chaddr[..6].copy_from_slice(&[0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff]);
    client
        .send_to(&request.to_bytes(), server.addr)
        .await
        .unwrap();

    let mut buf = vec![0u8; 4096];
    let outcome =
        tokio::time::timeout(Duration::from_millis(750), client.recv_from(&mut buf)).await;
    assert!(outcome.is_err(), "unknown MAC must not produce a reply");

    server.stop().await;
}

#[tokio::test]
async fn reply_is_relay_compatible() {
    let server = start_server().await;
    let client = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
    client
        .send_to(&base_request(MessageType::Discover).to_bytes(), server.addr)
        .await
        .unwrap();
    let mut buf = vec![0u8; 4096];
    let (len, _) = tokio::time::timeout(Duration::from_secs(5), client.recv_from(&mut buf))
        .await
        .expect("no reply")
        .unwrap();
    // padded to the BOOTP floor, cookie intact
    assert!(len >= 300);
    assert_eq!(&buf[236..240], &[0x63, 0x82, 0x53, 0x63]);

    server.stop().await;
}
