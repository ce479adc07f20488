//! DHCPv4 server library for PXE/iPXE network boot provisioning.
//!
//! Every IP this server hands out is a host reservation keyed by client MAC
//! address. There is no lease pool, no allocation algorithm and no lease
//! database: a pluggable backend answers `MAC -> (DhcpRecord, NetbootRecord)`
//! and the server turns that into conformant OFFER/ACK replies with the
//! right boot file and next-server for the client's architecture, firmware
//! family and progress through the iPXE chainload sequence.
//!
//! # Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────┐
//! │                    Server                          │
//! │   UDP socket + receive loop (IP_PKTINFO)           │
//! │            │ one task per handler per packet       │
//! │            ▼                                       │
//! │ ┌────────────────────────────────────────────────┐ │
//! │ │                  Handler                       │ │
//! │ │  DISCOVER→OFFER  REQUEST→ACK  RELEASE→drop     │ │
//! │ └────────────────────────────────────────────────┘ │
//! │            │                                       │
//! │            ▼                                       │
//! │ ┌────────────────────────────────────────────────┐ │
//! │ │               BackendReader                    │ │
//! │ │   MAC → DhcpRecord + NetbootRecord             │ │
//! │ └────────────────────────────────────────────────┘ │
//! │            │                                       │
//! │            ▼                                       │
//! │ ┌────────────────────────────────────────────────┐ │
//! │ │        ReplyBuilder + netboot decider          │ │
//! │ │   options, boot file, next-server, option 43   │ │
//! │ └────────────────────────────────────────────────┘ │
//! └────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```ignore
//! use std::net::{Ipv4Addr, SocketAddrV4};
//! use std::sync::Arc;
//! use netboot_dhcp::{Handler, Server, ServerConfig};
//!
//! let backend = Arc::new(MyBackend::new());
//! let config = Arc::new(
//!     ServerConfig::builder(Ipv4Addr::new(192, 168, 1, 1), backend)
//!         .with_ipxe_bin_server_tftp(SocketAddrV4::new(Ipv4Addr::new(192, 168, 1, 1), 69))
//!         .build(),
//! );
//!
//! let mut server = Server::bind(config.listen_addr, None)?;
//! server.register(Arc::new(Handler::new(config)));
//!
//! let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
//! server.serve(shutdown_rx).await?;
//! ```

pub mod backend;
pub mod config;
pub mod error;
pub mod handler;
pub mod netboot;
pub mod otel;
pub mod packet;
pub mod record;
pub mod server;

pub use backend::{BackendError, BackendReader};
pub use config::{ServerConfig, ServerConfigBuilder};
pub use error::{DhcpError, ParseError, Result};
pub use handler::Handler;
pub use netboot::{Arch, NetbootOptions};
pub use packet::{DhcpOptions, Message, MessageType, Opcode, ReplyBuilder};
pub use record::{DhcpRecord, NetbootRecord};
pub use server::{InterfaceInfo, Packet, PacketHandler, Server};
