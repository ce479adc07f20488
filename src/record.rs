//! Reply data handed over by backends.
//!
//! `DhcpRecord` and `NetbootRecord` are the API between the server and a
//! backend: the backend says what the client should get, the server turns it
//! into wire options. Records are owned by the dispatcher for the duration of
//! one request.

use std::net::Ipv4Addr;

use ipnetwork::ipv4_mask_to_prefix;
use macaddr::MacAddr6;
use opentelemetry::KeyValue;
use url::Url;

/// DHCP headers and options a backend wants in the server reply.
///
/// Every address handed out is a host reservation keyed by MAC; there is no
/// pool and no allocator behind this type.
#[derive(Debug, Clone, PartialEq)]
pub struct DhcpRecord {
    /// Client hardware address (chaddr header). Must equal the request's.
    pub mac_address: MacAddr6,
    /// Reserved address for this client (yiaddr header).
    pub ip_address: Ipv4Addr,
    /// Option 1.
    pub subnet_mask: Option<Ipv4Addr>,
    /// Option 3.
    pub default_gateway: Option<Ipv4Addr>,
    /// Option 6, in order.
    pub name_servers: Vec<Ipv4Addr>,
    /// Option 12.
    pub hostname: Option<String>,
    /// Option 15.
    pub domain_name: Option<String>,
    /// Option 28.
    pub broadcast_address: Option<Ipv4Addr>,
    /// Option 42, in order.
    pub ntp_servers: Vec<Ipv4Addr>,
    /// Option 51, seconds. Must be non-zero.
    pub lease_time: u32,
    /// Option 119, RFC 1035 encoded on the wire.
    pub domain_search: Vec<String>,
}

impl Default for DhcpRecord {
    fn default() -> Self {
        Self {
            mac_address: MacAddr6::nil(),
            ip_address: Ipv4Addr::UNSPECIFIED,
            subnet_mask: None,
            default_gateway: None,
            name_servers: Vec::new(),
            hostname: None,
            domain_name: None,
            broadcast_address: None,
            ntp_servers: Vec::new(),
            lease_time: 0,
            domain_search: Vec::new(),
        }
    }
}

impl DhcpRecord {
    /// Checks the record against the request it answers. A violation means
    /// the backend data is malformed and the request is dropped; the server
    /// never sends a reply built from bad data.
    pub fn validate(&self, chaddr: MacAddr6) -> Result<(), String> {
        if self.mac_address != chaddr {
            return Err(format!(
                "record MAC {} does not match request chaddr {}",
                self.mac_address, chaddr
            ));
        }
        if self.ip_address.is_unspecified() {
            return Err("record has no IP address".to_string());
        }
        if let Some(mask) = self.subnet_mask {
            ipv4_mask_to_prefix(mask)
                .map_err(|_| format!("subnet mask {mask} is not a contiguous netmask"))?;
        }
        if self.lease_time == 0 {
            return Err("lease time must be greater than zero".to_string());
        }
        Ok(())
    }

    /// Span attributes describing this record.
    pub fn encode_to_attributes(&self) -> Vec<KeyValue> {
        let join = |ips: &[Ipv4Addr]| {
            ips.iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(",")
        };
        vec![
            KeyValue::new("DHCP.MACAddress", self.mac_address.to_string()),
            KeyValue::new("DHCP.IPAddress", self.ip_address.to_string()),
            KeyValue::new(
                "DHCP.SubnetMask",
                self.subnet_mask.map(|m| m.to_string()).unwrap_or_default(),
            ),
            KeyValue::new(
                "DHCP.DefaultGateway",
                self.default_gateway
                    .map(|g| g.to_string())
                    .unwrap_or_default(),
            ),
            KeyValue::new("DHCP.NameServers", join(&self.name_servers)),
            KeyValue::new("DHCP.Hostname", self.hostname.clone().unwrap_or_default()),
            KeyValue::new(
                "DHCP.DomainName",
                self.domain_name.clone().unwrap_or_default(),
            ),
            KeyValue::new(
                "DHCP.BroadcastAddress",
                self.broadcast_address
                    .map(|b| b.to_string())
                    .unwrap_or_default(),
            ),
            KeyValue::new("DHCP.NTPServers", join(&self.ntp_servers)),
            KeyValue::new("DHCP.LeaseTime", i64::from(self.lease_time)),
            KeyValue::new("DHCP.DomainSearch", self.domain_search.join(",")),
        ]
    }
}

/// Netboot instructions for one client.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NetbootRecord {
    /// When false the client still gets an address but no boot options.
    pub allow_netboot: bool,
    /// Overrides the server-wide default iPXE script URL.
    pub ipxe_script_url: Option<Url>,
}

impl NetbootRecord {
    /// A script URL must be absolute with a host, or the record is malformed.
    pub fn validate(&self) -> Result<(), String> {
        if let Some(url) = &self.ipxe_script_url {
            if !url.has_host() {
                return Err(format!("iPXE script URL {url} has no host"));
            }
        }
        Ok(())
    }

    /// Span attributes describing this record.
    pub fn encode_to_attributes(&self) -> Vec<KeyValue> {
        vec![
            KeyValue::new("Netboot.AllowNetboot", self.allow_netboot),
            KeyValue::new(
                "Netboot.IPXEScriptURL",
                self.ipxe_script_url
                    .as_ref()
                    .map(ToString::to_string)
                    .unwrap_or_default(),
            ),
        ]
    }
}
