//! Reservation-mode request dispatcher.
//!
//! Every IP handed out is a host reservation keyed by MAC: the backend is
//! the single source of truth and nothing is allocated. The dispatcher is a
//! pure message-type switch; a request either yields exactly one reply or is
//! dropped with a log, so clients of an unhealthy backend simply time out
//! and retry.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use opentelemetry::trace::{Status, TraceContextExt, Tracer};
use opentelemetry::{global, Context, KeyValue};
use tokio::net::UdpSocket;
use tracing::{error, info};

use crate::backend::BackendError;
use crate::config::ServerConfig;
use crate::netboot::{self, NetbootOptions};
use crate::otel;
use crate::packet::{Message, MessageType, ReplyBuilder};
use crate::record::{DhcpRecord, NetbootRecord};
use crate::server::{Packet, PacketHandler};

const TRACER_NAME: &str = "netboot-dhcp";

/// Handles DHCPv4 packets against a backend of host reservations.
#[derive(Debug, Clone)]
pub struct Handler {
    config: Arc<ServerConfig>,
}

impl Handler {
    pub fn new(config: Arc<ServerConfig>) -> Self {
        Self { config }
    }

    /// Runs the message-type state machine. Returns the reply to send, or
    /// `None` when the request is dropped.
    ///
    /// | request  | reply |
    /// |----------|-------|
    /// | DISCOVER | OFFER |
    /// | REQUEST  | ACK   |
    /// | RELEASE  | none (reservations have nothing to release) |
    /// | other    | none  |
    async fn reply_for(&self, cx: &Context, msg: &Message) -> Option<Message> {
        let mac = msg.chaddr_mac();
        let reply_type = match msg.message_type() {
            Some(MessageType::Discover) => MessageType::Offer,
            Some(MessageType::Request) => MessageType::Ack,
            Some(MessageType::Release) => {
                info!(%mac, "received RELEASE, no response required");
                cx.span().set_status(Status::Ok);
                return None;
            }
            other => {
                info!(%mac, message_type = ?other, "received unknown message type");
                cx.span()
                    .set_status(Status::error("received unknown message type"));
                return None;
            }
        };

        let (dhcp, netboot) = match self.read_backend(cx, mac).await {
            Ok(records) => records,
            Err(err) => {
                cx.span().set_status(Status::error(err.to_string()));
                return None;
            }
        };
        Some(self.build_reply(cx, msg, &dhcp, &netboot, reply_type))
    }

    /// Backend read wrapped in its own span, with the record invariants
    /// checked before anything is built from the data.
    async fn read_backend(
        &self,
        cx: &Context,
        mac: macaddr::MacAddr6,
    ) -> Result<(DhcpRecord, NetbootRecord), BackendError> {
        let tracer = global::tracer(TRACER_NAME);
        let span = tracer.start_with_context("backend read", cx);
        let cx = cx.with_span(span);

        let result = match self.config.backend.read(mac).await {
            Ok((dhcp, netboot)) => dhcp
                .validate(mac)
                .and_then(|()| netboot.validate())
                .map(|()| (dhcp, netboot))
                .map_err(BackendError::Malformed),
            Err(err) => Err(err),
        };

        match &result {
            Ok((dhcp, netboot)) => {
                cx.span().set_attributes(dhcp.encode_to_attributes());
                cx.span().set_attributes(netboot.encode_to_attributes());
                cx.span().set_status(Status::Ok);
            }
            Err(err) => {
                match err {
                    BackendError::NotFound { .. } => {
                        info!(%mac, error = %err, "no reservation for client")
                    }
                    _ => error!(%mac, error = %err, "error reading from backend"),
                }
                cx.span().set_status(Status::error(err.to_string()));
            }
        }
        cx.span().end();
        result
    }

    fn build_reply(
        &self,
        cx: &Context,
        msg: &Message,
        dhcp: &DhcpRecord,
        netboot_record: &NetbootRecord,
        reply_type: MessageType,
    ) -> Message {
        let mut reply =
            ReplyBuilder::new(msg, reply_type, self.config.server_ip).dhcp_record(dhcp);
        if self.config.netboot_enabled && netboot::is_netboot_client(msg) {
            let boot = NetbootOptions::evaluate(cx, msg, netboot_record, &self.config);
            reply = reply
                .boot_file(&boot.boot_file)
                .next_server(boot.next_server);
            if let Some(class) = boot.class_identifier {
                reply = reply.class_identifier(class.as_bytes());
            }
            if let Some(vendor) = boot.vendor_options {
                reply = reply.vendor_options(vendor);
            }
        }
        reply.build()
    }
}

#[async_trait]
impl PacketHandler for Handler {
    async fn on_packet(&self, socket: Arc<UdpSocket>, packet: Packet) {
        let msg = &packet.message;
        let mac = msg.chaddr_mac();
        let message_type = msg
            .message_type()
            .map(|mt| mt.to_string())
            .unwrap_or_else(|| "UNKNOWN".to_string());
        info!(
            %mac,
            message_type = %message_type,
            interface = ?packet.interface.name,
            "received DHCP packet"
        );

        let tracer = global::tracer(TRACER_NAME);
        let mut attributes = otel::encode(msg, "request", otel::all_encoders());
        attributes.push(KeyValue::new("DHCP.peer", packet.peer.to_string()));
        let span = tracer
            .span_builder(format!("DHCP Packet Received: {message_type}"))
            .with_attributes(attributes)
            .start(&tracer);
        let cx = Context::current_with_span(span);

        if let Some(reply) = self.reply_for(&cx, msg).await {
            let dest = SocketAddr::V4(packet.peer);
            match socket.send_to(&reply.to_bytes(), dest).await {
                Ok(_) => {
                    info!(
                        %mac,
                        message_type = %reply
                            .message_type()
                            .map(|mt| mt.to_string())
                            .unwrap_or_else(|| "UNKNOWN".to_string()),
                        peer = %dest,
                        "sent DHCP reply"
                    );
                    cx.span()
                        .set_attributes(otel::encode(&reply, "reply", otel::all_encoders()));
                    cx.span().set_status(Status::Ok);
                }
                Err(err) => {
                    error!(%mac, error = %err, "failed to send DHCP reply");
                    cx.span().set_status(Status::error(err.to_string()));
                }
            }
        }
        cx.span().end();
    }
}
