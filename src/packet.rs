//! DHCPv4 wire codec.
//!
//! A message is the fixed 236-byte header (RFC 2131), the 4-byte magic
//! cookie, and a TLV option stream terminated by End (RFC 2132). Parsing
//! concatenates repeated instances of one option code in packet order;
//! serialization is canonical: option 53 first, option 54 second when
//! present, the rest in ascending code order, then End and zero padding up
//! to the 300-byte BOOTP floor.

use std::collections::BTreeMap;
use std::fmt;
use std::net::Ipv4Addr;

use macaddr::MacAddr6;

use crate::error::ParseError;
use crate::record::DhcpRecord;

/// DHCP magic cookie (RFC 2131 section 3).
pub const MAGIC_COOKIE: [u8; 4] = [0x63, 0x82, 0x53, 0x63];

/// Emitted messages are padded to this size for BOOTP relay compatibility.
pub const MIN_PACKET_SIZE: usize = 300;

const HEADER_SIZE: usize = 236;
const OPTIONS_OFFSET: usize = HEADER_SIZE + MAGIC_COOKIE.len();
const MAX_OPTION_CHUNK: usize = 255;

/// Option codes used by the server.
pub mod opt {
    pub const PAD: u8 = 0;
    pub const SUBNET_MASK: u8 = 1;
    pub const ROUTER: u8 = 3;
    pub const DOMAIN_NAME_SERVER: u8 = 6;
    pub const HOST_NAME: u8 = 12;
    pub const DOMAIN_NAME: u8 = 15;
    pub const BROADCAST_ADDRESS: u8 = 28;
    pub const NTP_SERVERS: u8 = 42;
    pub const VENDOR_SPECIFIC: u8 = 43;
    pub const ADDRESS_LEASE_TIME: u8 = 51;
    pub const MESSAGE_TYPE: u8 = 53;
    pub const SERVER_IDENTIFIER: u8 = 54;
    pub const CLASS_IDENTIFIER: u8 = 60;
    pub const USER_CLASS: u8 = 77;
    pub const CLIENT_SYSTEM_ARCHITECTURE: u8 = 93;
    pub const CLIENT_NETWORK_INTERFACE_ID: u8 = 94;
    pub const CLIENT_MACHINE_IDENTIFIER: u8 = 97;
    pub const DOMAIN_SEARCH: u8 = 119;
    pub const END: u8 = 255;
}

/// BOOTP op header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    BootRequest = 1,
    BootReply = 2,
}

impl TryFrom<u8> for Opcode {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, u8> {
        match value {
            1 => Ok(Opcode::BootRequest),
            2 => Ok(Opcode::BootReply),
            other => Err(other),
        }
    }
}

/// DHCP message type (option 53).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Discover = 1,
    Offer = 2,
    Request = 3,
    Decline = 4,
    Ack = 5,
    Nak = 6,
    Release = 7,
    Inform = 8,
}

impl TryFrom<u8> for MessageType {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, u8> {
        match value {
            1 => Ok(MessageType::Discover),
            2 => Ok(MessageType::Offer),
            3 => Ok(MessageType::Request),
            4 => Ok(MessageType::Decline),
            5 => Ok(MessageType::Ack),
            6 => Ok(MessageType::Nak),
            7 => Ok(MessageType::Release),
            8 => Ok(MessageType::Inform),
            other => Err(other),
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MessageType::Discover => "DISCOVER",
            MessageType::Offer => "OFFER",
            MessageType::Request => "REQUEST",
            MessageType::Decline => "DECLINE",
            MessageType::Ack => "ACK",
            MessageType::Nak => "NAK",
            MessageType::Release => "RELEASE",
            MessageType::Inform => "INFORM",
        };
        f.write_str(name)
    }
}

/// Option stream keyed by code.
///
/// Values are the concatenation of every instance of the code, in packet
/// order (RFC 3396). Values longer than 255 bytes are re-chunked into
/// consecutive instances on serialization.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DhcpOptions {
    entries: BTreeMap<u8, Vec<u8>>,
}

impl DhcpOptions {
    /// Concatenated value for `code`, if present.
    pub fn get(&self, code: u8) -> Option<&[u8]> {
        self.entries.get(&code).map(Vec::as_slice)
    }

    pub fn has(&self, code: u8) -> bool {
        self.entries.contains_key(&code)
    }

    /// Sets `code` to `value`, replacing any existing value.
    pub fn insert(&mut self, code: u8, value: impl Into<Vec<u8>>) {
        self.entries.insert(code, value.into());
    }

    pub fn remove(&mut self, code: u8) -> Option<Vec<u8>> {
        self.entries.remove(&code)
    }

    /// Appends bytes to `code`, used while parsing split options.
    fn append(&mut self, code: u8, data: &[u8]) {
        self.entries.entry(code).or_default().extend_from_slice(data);
    }

    /// Options in ascending code order.
    pub fn iter(&self) -> impl Iterator<Item = (u8, &[u8])> {
        self.entries.iter().map(|(code, value)| (*code, value.as_slice()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// One DHCPv4 message, request or reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub op: Opcode,
    pub htype: u8,
    pub hlen: u8,
    pub hops: u8,
    pub xid: u32,
    pub secs: u16,
    pub flags: u16,
    pub ciaddr: Ipv4Addr,
    pub yiaddr: Ipv4Addr,
    pub siaddr: Ipv4Addr,
    pub giaddr: Ipv4Addr,
    pub chaddr: [u8; 16],
    pub sname: [u8; 64],
    pub file: [u8; 128],
    pub options: DhcpOptions,
}

impl Default for Message {
    fn default() -> Self {
        Self {
            op: Opcode::BootRequest,
            htype: 1, // ethernet
            hlen: 6,
            hops: 0,
            xid: 0,
            secs: 0,
            flags: 0,
            ciaddr: Ipv4Addr::UNSPECIFIED,
            yiaddr: Ipv4Addr::UNSPECIFIED,
            siaddr: Ipv4Addr::UNSPECIFIED,
            giaddr: Ipv4Addr::UNSPECIFIED,
            chaddr: [0; 16],
            sname: [0; 64],
            file: [0; 128],
            options: DhcpOptions::default(),
        }
    }
}

/// Parses a datagram as a DHCPv4 message.
///
/// Rejects truncated headers, a missing magic cookie, option TLVs running
/// past the buffer, and messages without option 53.
pub fn parse(buf: &[u8]) -> Result<Message, ParseError> {
    if buf.len() < OPTIONS_OFFSET {
        return Err(ParseError::Truncated { len: buf.len() });
    }
    if buf[HEADER_SIZE..OPTIONS_OFFSET] != MAGIC_COOKIE {
        return Err(ParseError::BadMagicCookie);
    }
    let op = Opcode::try_from(buf[0]).map_err(ParseError::InvalidOpcode)?;

    let mut chaddr = [0u8; 16];
    chaddr.copy_from_slice(&buf[28..44]);
    let mut sname = [0u8; 64];
    sname.copy_from_slice(&buf[44..108]);
    let mut file = [0u8; 128];
    file.copy_from_slice(&buf[108..236]);

    let mut options = DhcpOptions::default();
    let mut i = OPTIONS_OFFSET;
    while i < buf.len() {
        let code = buf[i];
        match code {
            opt::PAD => i += 1,
            opt::END => break,
            _ => {
                if i + 1 >= buf.len() {
                    return Err(ParseError::OptionOverrun { code });
                }
                let len = buf[i + 1] as usize;
                let end = i + 2 + len;
                if end > buf.len() {
                    return Err(ParseError::OptionOverrun { code });
                }
                options.append(code, &buf[i + 2..end]);
                i = end;
            }
        }
    }
    if !options.has(opt::MESSAGE_TYPE) {
        return Err(ParseError::MissingMessageType);
    }

    Ok(Message {
        op,
        htype: buf[1],
        hlen: buf[2],
        hops: buf[3],
        xid: u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]),
        secs: u16::from_be_bytes([buf[8], buf[9]]),
        flags: u16::from_be_bytes([buf[10], buf[11]]),
        ciaddr: Ipv4Addr::new(buf[12], buf[13], buf[14], buf[15]),
        yiaddr: Ipv4Addr::new(buf[16], buf[17], buf[18], buf[19]),
        siaddr: Ipv4Addr::new(buf[20], buf[21], buf[22], buf[23]),
        giaddr: Ipv4Addr::new(buf[24], buf[25], buf[26], buf[27]),
        chaddr,
        sname,
        file,
        options,
    })
}

fn write_option(buf: &mut Vec<u8>, code: u8, value: &[u8]) {
    if value.is_empty() {
        buf.push(code);
        buf.push(0);
        return;
    }
    for chunk in value.chunks(MAX_OPTION_CHUNK) {
        buf.push(code);
        buf.push(chunk.len() as u8);
        buf.extend_from_slice(chunk);
    }
}

impl Message {
    /// Serializes to the canonical wire form.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(MIN_PACKET_SIZE);
        buf.push(self.op as u8);
        buf.push(self.htype);
        buf.push(self.hlen);
        buf.push(self.hops);
        buf.extend_from_slice(&self.xid.to_be_bytes());
        buf.extend_from_slice(&self.secs.to_be_bytes());
        buf.extend_from_slice(&self.flags.to_be_bytes());
        buf.extend_from_slice(&self.ciaddr.octets());
        buf.extend_from_slice(&self.yiaddr.octets());
        buf.extend_from_slice(&self.siaddr.octets());
        buf.extend_from_slice(&self.giaddr.octets());
        buf.extend_from_slice(&self.chaddr);
        buf.extend_from_slice(&self.sname);
        buf.extend_from_slice(&self.file);
        buf.extend_from_slice(&MAGIC_COOKIE);

        if let Some(value) = self.options.get(opt::MESSAGE_TYPE) {
            write_option(&mut buf, opt::MESSAGE_TYPE, value);
        }
        if let Some(value) = self.options.get(opt::SERVER_IDENTIFIER) {
            write_option(&mut buf, opt::SERVER_IDENTIFIER, value);
        }
        for (code, value) in self.options.iter() {
            if code == opt::MESSAGE_TYPE || code == opt::SERVER_IDENTIFIER {
                continue;
            }
            write_option(&mut buf, code, value);
        }
        buf.push(opt::END);
        buf.resize(buf.len().max(MIN_PACKET_SIZE), opt::PAD);
        buf
    }

    /// Client hardware address from the chaddr header.
    pub fn chaddr_mac(&self) -> MacAddr6 {
        let mut mac = [0u8; 6];
        mac.copy_from_slice(&self.chaddr[..6]);
        MacAddr6::from(mac)
    }

    pub fn message_type(&self) -> Option<MessageType> {
        self.options
            .get(opt::MESSAGE_TYPE)
            .and_then(|v| v.first())
            .and_then(|b| MessageType::try_from(*b).ok())
    }

    fn opt_ipv4(&self, code: u8) -> Option<Ipv4Addr> {
        self.options.get(code).and_then(|v| {
            let octets: [u8; 4] = v.get(..4)?.try_into().ok()?;
            Some(Ipv4Addr::from(octets))
        })
    }

    fn opt_ipv4_list(&self, code: u8) -> Vec<Ipv4Addr> {
        self.options
            .get(code)
            .map(|v| {
                v.chunks_exact(4)
                    .map(|c| Ipv4Addr::new(c[0], c[1], c[2], c[3]))
                    .collect()
            })
            .unwrap_or_default()
    }

    fn opt_string(&self, code: u8) -> Option<String> {
        self.options
            .get(code)
            .and_then(|v| std::str::from_utf8(v).ok())
            .map(|s| s.trim_end_matches('\0').to_string())
            .filter(|s| !s.is_empty())
    }

    pub fn subnet_mask(&self) -> Option<Ipv4Addr> {
        self.opt_ipv4(opt::SUBNET_MASK)
    }

    pub fn routers(&self) -> Vec<Ipv4Addr> {
        self.opt_ipv4_list(opt::ROUTER)
    }

    pub fn name_servers(&self) -> Vec<Ipv4Addr> {
        self.opt_ipv4_list(opt::DOMAIN_NAME_SERVER)
    }

    pub fn hostname(&self) -> Option<String> {
        self.opt_string(opt::HOST_NAME)
    }

    pub fn domain_name(&self) -> Option<String> {
        self.opt_string(opt::DOMAIN_NAME)
    }

    pub fn broadcast_address(&self) -> Option<Ipv4Addr> {
        self.opt_ipv4(opt::BROADCAST_ADDRESS)
    }

    pub fn ntp_servers(&self) -> Vec<Ipv4Addr> {
        self.opt_ipv4_list(opt::NTP_SERVERS)
    }

    pub fn lease_time(&self) -> Option<u32> {
        self.options.get(opt::ADDRESS_LEASE_TIME).and_then(|v| {
            let bytes: [u8; 4] = v.get(..4)?.try_into().ok()?;
            Some(u32::from_be_bytes(bytes))
        })
    }

    pub fn server_identifier(&self) -> Option<Ipv4Addr> {
        self.opt_ipv4(opt::SERVER_IDENTIFIER)
    }

    /// Option 60 raw bytes.
    pub fn class_identifier(&self) -> Option<&[u8]> {
        self.options.get(opt::CLASS_IDENTIFIER)
    }

    /// Option 77 raw bytes.
    pub fn user_class(&self) -> Option<&[u8]> {
        self.options.get(opt::USER_CLASS)
    }

    /// Option 93 as 16-bit architecture codes.
    pub fn client_arch_list(&self) -> Vec<u16> {
        self.options
            .get(opt::CLIENT_SYSTEM_ARCHITECTURE)
            .map(|v| {
                v.chunks_exact(2)
                    .map(|c| u16::from_be_bytes([c[0], c[1]]))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Option 97 raw bytes.
    pub fn client_machine_identifier(&self) -> Option<&[u8]> {
        self.options.get(opt::CLIENT_MACHINE_IDENTIFIER)
    }

    /// Option 43 raw bytes.
    pub fn vendor_specific(&self) -> Option<&[u8]> {
        self.options.get(opt::VENDOR_SPECIFIC)
    }

    /// Option 119 decoded as domain names. Compressed data is treated as
    /// absent; the server only ever emits uncompressed labels.
    pub fn domain_search(&self) -> Option<Vec<String>> {
        self.options
            .get(opt::DOMAIN_SEARCH)
            .and_then(decode_domain_search)
    }

    /// Boot file name from the `file` header, NUL-trimmed.
    pub fn boot_file(&self) -> String {
        let end = self
            .file
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(self.file.len());
        String::from_utf8_lossy(&self.file[..end]).into_owned()
    }

    /// Writes the boot file name into the `file` header, truncating to fit.
    pub fn set_boot_file(&mut self, name: &str) {
        self.file = [0; 128];
        let bytes = name.as_bytes();
        let n = bytes.len().min(self.file.len());
        self.file[..n].copy_from_slice(&bytes[..n]);
    }
}

/// RFC 1035 label encoding for option 119, uncompressed.
pub(crate) fn encode_domain_search(domains: &[String]) -> Vec<u8> {
    let mut out = Vec::new();
    for domain in domains {
        for label in domain.split('.').filter(|l| !l.is_empty()) {
            let bytes = label.as_bytes();
            let len = bytes.len().min(63);
            out.push(len as u8);
            out.extend_from_slice(&bytes[..len]);
        }
        out.push(0);
    }
    out
}

fn decode_domain_search(data: &[u8]) -> Option<Vec<String>> {
    let mut names = Vec::new();
    let mut labels: Vec<String> = Vec::new();
    let mut i = 0;
    while i < data.len() {
        let len = data[i] as usize;
        if len == 0 {
            if !labels.is_empty() {
                names.push(labels.join("."));
                labels.clear();
            }
            i += 1;
            continue;
        }
        if len & 0xc0 != 0 {
            // compression pointer
            return None;
        }
        if i + 1 + len > data.len() {
            return None;
        }
        labels.push(String::from_utf8(data[i + 1..i + 1 + len].to_vec()).ok()?);
        i += 1 + len;
    }
    if !labels.is_empty() {
        names.push(labels.join("."));
    }
    Some(names)
}

/// Builds a reply from a request.
///
/// Construction copies xid, flags, giaddr, chaddr, hlen and htype, sets
/// op=BootReply, and clears sname, file, yiaddr, siaddr and ciaddr. Typed
/// setters accumulate the rest; serialization of the result is canonical,
/// so the order setters run in does not matter.
#[derive(Debug, Clone)]
pub struct ReplyBuilder {
    reply: Message,
}

impl ReplyBuilder {
    pub fn new(request: &Message, message_type: MessageType, server_ip: Ipv4Addr) -> Self {
        let mut reply = Message {
            op: Opcode::BootReply,
            htype: request.htype,
            hlen: request.hlen,
            xid: request.xid,
            flags: request.flags,
            giaddr: request.giaddr,
            chaddr: request.chaddr,
            siaddr: server_ip,
            ..Message::default()
        };
        reply
            .options
            .insert(opt::MESSAGE_TYPE, [message_type as u8]);
        reply
            .options
            .insert(opt::SERVER_IDENTIFIER, server_ip.octets());
        Self { reply }
    }

    /// Applies a backend record: yiaddr and option 51 always, every other
    /// field only when non-empty.
    pub fn dhcp_record(mut self, d: &DhcpRecord) -> Self {
        let opts = &mut self.reply.options;
        self.reply.yiaddr = d.ip_address;
        opts.insert(opt::ADDRESS_LEASE_TIME, d.lease_time.to_be_bytes());
        if let Some(mask) = d.subnet_mask.filter(|m| !m.is_unspecified()) {
            opts.insert(opt::SUBNET_MASK, mask.octets());
        }
        if let Some(gw) = d.default_gateway.filter(|g| !g.is_unspecified()) {
            opts.insert(opt::ROUTER, gw.octets());
        }
        if !d.name_servers.is_empty() {
            opts.insert(opt::DOMAIN_NAME_SERVER, ipv4_bytes(&d.name_servers));
        }
        if let Some(hostname) = d.hostname.as_deref().filter(|h| !h.is_empty()) {
            opts.insert(opt::HOST_NAME, hostname.as_bytes());
        }
        if let Some(domain) = d.domain_name.as_deref().filter(|n| !n.is_empty()) {
            opts.insert(opt::DOMAIN_NAME, domain.as_bytes());
        }
        if let Some(bcast) = d.broadcast_address.filter(|b| !b.is_unspecified()) {
            opts.insert(opt::BROADCAST_ADDRESS, bcast.octets());
        }
        if !d.ntp_servers.is_empty() {
            opts.insert(opt::NTP_SERVERS, ipv4_bytes(&d.ntp_servers));
        }
        if !d.domain_search.is_empty() {
            opts.insert(opt::DOMAIN_SEARCH, encode_domain_search(&d.domain_search));
        }
        self
    }

    /// Sets the `file` header.
    pub fn boot_file(mut self, name: &str) -> Self {
        self.reply.set_boot_file(name);
        self
    }

    /// Sets siaddr, the next bootstrap server.
    pub fn next_server(mut self, ip: Ipv4Addr) -> Self {
        self.reply.siaddr = ip;
        self
    }

    /// Sets option 60 on the reply.
    pub fn class_identifier(mut self, id: &[u8]) -> Self {
        self.reply.options.insert(opt::CLASS_IDENTIFIER, id);
        self
    }

    /// Sets option 43 on the reply.
    pub fn vendor_options(mut self, data: Vec<u8>) -> Self {
        self.reply.options.insert(opt::VENDOR_SPECIFIC, data);
        self
    }

    pub fn build(self) -> Message {
        self.reply
    }
}

fn ipv4_bytes(ips: &[Ipv4Addr]) -> Vec<u8> {
    let mut out = Vec::with_capacity(ips.len() * 4);
    for ip in ips {
        out.extend_from_slice(&ip.octets());
    }
    out
}
