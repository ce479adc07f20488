//! OpenTelemetry plumbing.
//!
//! Two jobs: lifting packet headers and options into span attributes, and
//! encoding the active span context as the 26-byte binary traceparent that
//! rides in PXE vendor sub-option 69 so downstream TFTP/HTTP servers can
//! correlate boot artifact fetches with the DHCP exchange.

use opentelemetry::trace::TraceContextExt;
use opentelemetry::{Context, KeyValue};
use thiserror::Error;
use tracing::{debug, trace};

use crate::packet::{opt, Message};

/// Length of the binary traceparent carried in option 43 sub-option 69.
pub const TRACEPARENT_LEN: usize = 26;

/// Failure to lift one packet field into a span attribute.
///
/// `Absent` is the normal case for optional options and is not a failure;
/// `Failure` means the data was present but unusable.
#[derive(Debug, Error)]
pub enum EncodeError {
    #[error("{key}: not present in packet")]
    Absent { key: String },
    #[error("{key}: {reason}")]
    Failure { key: String, reason: String },
}

impl EncodeError {
    pub fn key(&self) -> &str {
        match self {
            EncodeError::Absent { key } | EncodeError::Failure { key, .. } => key,
        }
    }
}

/// One packet field lifted into a span attribute.
pub type EncoderFn = fn(&Message, &str) -> Result<KeyValue, EncodeError>;

/// Runs `encoders` against a packet under a key namespace (typically
/// `request` or `reply`). Absent options are skipped quietly; encoding
/// failures are logged but never fail the caller.
pub fn encode(msg: &Message, namespace: &str, encoders: &[EncoderFn]) -> Vec<KeyValue> {
    let mut attributes = Vec::with_capacity(encoders.len());
    for encoder in encoders {
        match encoder(msg, namespace) {
            Ok(kv) => attributes.push(kv),
            Err(err @ EncodeError::Absent { .. }) => {
                trace!(key = err.key(), "span attribute not added")
            }
            Err(err) => debug!(key = err.key(), error = %err, "span attribute not added"),
        }
    }
    attributes
}

/// The encoder set used for request and reply packet spans.
pub fn all_encoders() -> &'static [EncoderFn] {
    &[
        encode_opt1,
        encode_opt3,
        encode_opt6,
        encode_opt12,
        encode_opt15,
        encode_opt28,
        encode_opt42,
        encode_opt51,
        encode_opt53,
        encode_opt54,
        encode_opt119,
        encode_yiaddr,
        encode_siaddr,
        encode_chaddr,
        encode_file,
    ]
}

fn join_ips(ips: &[std::net::Ipv4Addr]) -> String {
    ips.iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(",")
}

fn encode_opt1(msg: &Message, ns: &str) -> Result<KeyValue, EncodeError> {
    let key = format!("DHCP.{ns}.Opt1.SubnetMask");
    match msg.subnet_mask() {
        Some(mask) => Ok(KeyValue::new(key, mask.to_string())),
        None => Err(EncodeError::Absent { key }),
    }
}

fn encode_opt3(msg: &Message, ns: &str) -> Result<KeyValue, EncodeError> {
    let key = format!("DHCP.{ns}.Opt3.DefaultGateway");
    let routers = msg.routers();
    if routers.is_empty() {
        return Err(EncodeError::Absent { key });
    }
    Ok(KeyValue::new(key, join_ips(&routers)))
}

fn encode_opt6(msg: &Message, ns: &str) -> Result<KeyValue, EncodeError> {
    let key = format!("DHCP.{ns}.Opt6.NameServers");
    let servers = msg.name_servers();
    if servers.is_empty() {
        return Err(EncodeError::Absent { key });
    }
    Ok(KeyValue::new(key, join_ips(&servers)))
}

fn encode_opt12(msg: &Message, ns: &str) -> Result<KeyValue, EncodeError> {
    let key = format!("DHCP.{ns}.Opt12.Hostname");
    match msg.hostname() {
        Some(hostname) => Ok(KeyValue::new(key, hostname)),
        None => Err(EncodeError::Absent { key }),
    }
}

fn encode_opt15(msg: &Message, ns: &str) -> Result<KeyValue, EncodeError> {
    let key = format!("DHCP.{ns}.Opt15.DomainName");
    match msg.domain_name() {
        Some(domain) => Ok(KeyValue::new(key, domain)),
        None => Err(EncodeError::Absent { key }),
    }
}

fn encode_opt28(msg: &Message, ns: &str) -> Result<KeyValue, EncodeError> {
    let key = format!("DHCP.{ns}.Opt28.BroadcastAddress");
    match msg.broadcast_address() {
        Some(addr) => Ok(KeyValue::new(key, addr.to_string())),
        None => Err(EncodeError::Absent { key }),
    }
}

fn encode_opt42(msg: &Message, ns: &str) -> Result<KeyValue, EncodeError> {
    let key = format!("DHCP.{ns}.Opt42.NTPServers");
    let servers = msg.ntp_servers();
    if servers.is_empty() {
        return Err(EncodeError::Absent { key });
    }
    Ok(KeyValue::new(key, join_ips(&servers)))
}

fn encode_opt51(msg: &Message, ns: &str) -> Result<KeyValue, EncodeError> {
    let key = format!("DHCP.{ns}.Opt51.LeaseTime");
    match msg.lease_time() {
        Some(lease) => Ok(KeyValue::new(key, i64::from(lease))),
        None => Err(EncodeError::Absent { key }),
    }
}

fn encode_opt53(msg: &Message, ns: &str) -> Result<KeyValue, EncodeError> {
    let key = format!("DHCP.{ns}.Opt53.MessageType");
    if !msg.options.has(opt::MESSAGE_TYPE) {
        return Err(EncodeError::Absent { key });
    }
    match msg.message_type() {
        Some(mt) => Ok(KeyValue::new(key, mt.to_string())),
        None => Err(EncodeError::Failure {
            key,
            reason: "unrecognized message type".to_string(),
        }),
    }
}

fn encode_opt54(msg: &Message, ns: &str) -> Result<KeyValue, EncodeError> {
    let key = format!("DHCP.{ns}.Opt54.ServerIdentifier");
    match msg.server_identifier() {
        Some(id) => Ok(KeyValue::new(key, id.to_string())),
        None => Err(EncodeError::Absent { key }),
    }
}

fn encode_opt119(msg: &Message, ns: &str) -> Result<KeyValue, EncodeError> {
    let key = format!("DHCP.{ns}.Opt119.DomainSearch");
    if !msg.options.has(opt::DOMAIN_SEARCH) {
        return Err(EncodeError::Absent { key });
    }
    match msg.domain_search() {
        Some(domains) => Ok(KeyValue::new(key, domains.join(","))),
        None => Err(EncodeError::Failure {
            key,
            reason: "undecodable domain search data".to_string(),
        }),
    }
}

fn encode_yiaddr(msg: &Message, ns: &str) -> Result<KeyValue, EncodeError> {
    let key = format!("DHCP.{ns}.Header.yiaddr");
    Ok(KeyValue::new(key, msg.yiaddr.to_string()))
}

fn encode_siaddr(msg: &Message, ns: &str) -> Result<KeyValue, EncodeError> {
    let key = format!("DHCP.{ns}.Header.siaddr");
    Ok(KeyValue::new(key, msg.siaddr.to_string()))
}

fn encode_chaddr(msg: &Message, ns: &str) -> Result<KeyValue, EncodeError> {
    let key = format!("DHCP.{ns}.Header.chaddr");
    Ok(KeyValue::new(key, msg.chaddr_mac().to_string()))
}

fn encode_file(msg: &Message, ns: &str) -> Result<KeyValue, EncodeError> {
    let key = format!("DHCP.{ns}.Header.file");
    let file = msg.boot_file();
    if file.is_empty() {
        return Err(EncodeError::Absent { key });
    }
    Ok(KeyValue::new(key, file))
}

/// Encodes the active span context as the 26-byte binary traceparent:
/// version 0x00, 16-byte trace id, 8-byte span id, sampled flag. With no
/// active span the buffer is all zero except the version byte.
pub fn binary_traceparent(cx: &Context) -> [u8; TRACEPARENT_LEN] {
    let span = cx.span();
    let sc = span.span_context();
    let mut tp = [0u8; TRACEPARENT_LEN];
    // tp[0] is the traceparent version, 0x00
    tp[1..17].copy_from_slice(&sc.trace_id().to_bytes());
    tp[17..25].copy_from_slice(&sc.span_id().to_bytes());
    if sc.is_sampled() {
        tp[25] = 0x01;
    }
    tp
}

/// Appends `-00-<trace id>-<span id>-<flags>` to an iPXE binary name so
/// downstream artifact fetches can be correlated with this DHCP exchange.
/// Returns the name unchanged when no sampled span is active.
pub fn decorate_boot_file(binary: &str, cx: &Context) -> String {
    let span = cx.span();
    let sc = span.span_context();
    if !sc.is_sampled() {
        return binary.to_string();
    }
    format!(
        "{}-00-{:032x}-{:016x}-{:02x}",
        binary,
        sc.trace_id(),
        sc.span_id(),
        sc.trace_flags()
    )
}
