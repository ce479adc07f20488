//! Netboot client classification and iPXE chainload selection.
//!
//! The chainload sequence: a first-contact PXE ROM gets the bare iPXE binary
//! name and fetches it over TFTP discovery; the stock iPXE ROM announces
//! itself via option 77 and gets a full TFTP URL (option 43 disables PXE
//! discovery, so it needs an explicit next hop); UEFI HTTP Boot firmware gets
//! an HTTP URL; and once our own iPXE build is running it announces its user
//! class and gets the script URL, which breaks the loop.

use std::net::Ipv4Addr;

use opentelemetry::Context;
use tracing::{error, info};

use crate::config::ServerConfig;
use crate::otel;
use crate::packet::{opt, Message, MessageType};
use crate::record::NetbootRecord;

/// Option 60 prefix sent by TFTP-era PXE ROMs.
pub const PXE_CLIENT: &str = "PXEClient";

/// Option 60 prefix sent by UEFI HTTP Boot firmware.
pub const HTTP_CLIENT: &str = "HTTPClient";

/// Option 77 value sent by a stock iPXE ROM.
pub const USER_CLASS_IPXE: &str = "iPXE";

/// Option 77 value sent by our own full-featured iPXE build.
pub const USER_CLASS_TINKERBELL: &str = "Tinkerbell";

/// Boot file handed to clients whose record disallows netboot or whose
/// architecture has no published binary. The client will not boot from it.
pub const NETBOOT_NOT_ALLOWED: &str = "/netboot-not-allowed";

const NO_SCRIPT_DEFINED: &str = "/no-ipxe-script-defined";

/// Client system architecture, DHCP option 93 (RFC 4578 / IANA processor
/// architecture registry).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arch {
    IntelX86Pc,
    NecPc98,
    EfiItanium,
    DecAlpha,
    ArcX86,
    IntelLeanClient,
    EfiIa32,
    EfiX8664,
    EfiXscale,
    EfiBc,
    EfiArm32,
    EfiArm64,
    EfiX86Http,
    EfiX8664Http,
    EfiArm32Http,
    EfiArm64Http,
    /// Raspberry Pi boot, architecture code 41.
    Rpiboot,
    Unknown,
}

impl From<u16> for Arch {
    fn from(value: u16) -> Self {
        match value {
            0 => Arch::IntelX86Pc,
            1 => Arch::NecPc98,
            2 => Arch::EfiItanium,
            3 => Arch::DecAlpha,
            4 => Arch::ArcX86,
            5 => Arch::IntelLeanClient,
            6 => Arch::EfiIa32,
            7 => Arch::EfiX8664,
            8 => Arch::EfiXscale,
            9 => Arch::EfiBc,
            10 => Arch::EfiArm32,
            11 => Arch::EfiArm64,
            15 => Arch::EfiX86Http,
            16 => Arch::EfiX8664Http,
            18 => Arch::EfiArm32Http,
            19 => Arch::EfiArm64Http,
            41 => Arch::Rpiboot,
            _ => Arch::Unknown,
        }
    }
}

impl Arch {
    /// First recognized architecture from option 93; `Unknown` when the
    /// option is absent or carries only unrecognized codes.
    pub fn from_message(msg: &Message) -> Arch {
        msg.client_arch_list()
            .into_iter()
            .map(Arch::from)
            .find(|a| *a != Arch::Unknown)
            .unwrap_or(Arch::Unknown)
    }

    /// The iPXE binary published for this architecture, if any.
    pub fn boot_file(self) -> Option<&'static str> {
        match self {
            Arch::IntelX86Pc
            | Arch::NecPc98
            | Arch::EfiItanium
            | Arch::DecAlpha
            | Arch::ArcX86
            | Arch::IntelLeanClient => Some("undionly.kpxe"),
            Arch::EfiIa32
            | Arch::EfiX8664
            | Arch::EfiXscale
            | Arch::EfiBc
            | Arch::EfiX86Http
            | Arch::EfiX8664Http => Some("ipxe.efi"),
            Arch::EfiArm32
            | Arch::EfiArm64
            | Arch::EfiArm32Http
            | Arch::EfiArm64Http
            | Arch::Rpiboot => Some("snp.efi"),
            Arch::Unknown => None,
        }
    }
}

/// Returns true if the request is a valid netboot client.
///
/// A valid netboot client (PXE spec, RFC 4578):
/// 1. is a DISCOVER or REQUEST;
/// 2. option 60 starts with "PXEClient" or "HTTPClient";
/// 3. option 93 is set;
/// 4. option 94 is set;
/// 5. option 97 is absent, empty, or exactly 17 bytes starting with 0x00.
pub fn is_netboot_client(msg: &Message) -> bool {
    let mac = msg.chaddr_mac();
    match msg.message_type() {
        Some(MessageType::Discover) | Some(MessageType::Request) => {}
        other => {
            info!(
                %mac,
                message_type = ?other,
                reason = "message type must be DISCOVER or REQUEST",
                "not a netboot client"
            );
            return false;
        }
    }
    let Some(opt60) = msg.class_identifier() else {
        info!(%mac, reason = "option 60 not set", "not a netboot client");
        return false;
    };
    if !opt60.starts_with(PXE_CLIENT.as_bytes()) && !opt60.starts_with(HTTP_CLIENT.as_bytes()) {
        info!(
            %mac,
            option60 = %String::from_utf8_lossy(opt60),
            reason = "option 60 not PXEClient or HTTPClient",
            "not a netboot client"
        );
        return false;
    }
    if !msg.options.has(opt::CLIENT_SYSTEM_ARCHITECTURE) {
        info!(%mac, reason = "option 93 not set", "not a netboot client");
        return false;
    }
    if !msg.options.has(opt::CLIENT_NETWORK_INTERFACE_ID) {
        info!(%mac, reason = "option 94 not set", "not a netboot client");
        return false;
    }
    match msg.client_machine_identifier() {
        // A missing GUID is invalid according to the PXE spec, but ROMs in
        // the wild omit it and still expect to boot. We only ever mirror the
        // GUID, so accept those ROMs.
        None => {}
        Some(guid) => match guid.len() {
            0 => {}
            17 if guid[0] == 0 => {}
            17 => {
                info!(
                    %mac,
                    reason = "option 97 does not start with 0x00",
                    "not a netboot client"
                );
                return false;
            }
            len => {
                info!(
                    %mac,
                    length = len,
                    reason = "option 97 must be empty or 17 bytes",
                    "not a netboot client"
                );
                return false;
            }
        },
    }
    true
}

/// Boot options chosen for one netboot client.
#[derive(Debug, Clone, PartialEq)]
pub struct NetbootOptions {
    /// Goes into the reply's `file` header.
    pub boot_file: String,
    /// Goes into the reply's siaddr header.
    pub next_server: Ipv4Addr,
    /// Option 60 echo; only ever "HTTPClient".
    pub class_identifier: Option<&'static str>,
    /// Option 43 payload, when boot sources were selected.
    pub vendor_options: Option<Vec<u8>>,
}

impl NetbootOptions {
    /// Decides the boot options for a classified netboot client.
    ///
    /// When the record disallows netboot or the architecture has no binary,
    /// the client still gets a reply, just one it cannot boot from.
    pub fn evaluate(
        cx: &Context,
        msg: &Message,
        netboot: &NetbootRecord,
        config: &ServerConfig,
    ) -> Self {
        let mac = msg.chaddr_mac();
        let client_is_http = msg
            .class_identifier()
            .is_some_and(|v| v.starts_with(HTTP_CLIENT.as_bytes()));
        let mut options = NetbootOptions {
            boot_file: NETBOOT_NOT_ALLOWED.to_string(),
            next_server: Ipv4Addr::UNSPECIFIED,
            class_identifier: client_is_http.then_some(HTTP_CLIENT),
            vendor_options: None,
        };
        if !netboot.allow_netboot {
            return options;
        }

        let arch = Arch::from_message(msg);
        let Some(binary) = arch.boot_file() else {
            error!(%mac, ?arch, "no iPXE binary for client architecture");
            return options;
        };
        let binary = if config.otel_enabled {
            otel::decorate_boot_file(binary, cx)
        } else {
            binary.to_string()
        };

        let user_class = msg
            .user_class()
            .and_then(|v| std::str::from_utf8(v).ok())
            .unwrap_or("");
        let script = netboot
            .ipxe_script_url
            .as_ref()
            .or(config.ipxe_script_url.as_ref());

        let (boot_file, next_server) =
            bootfile_and_next_server(user_class, client_is_http, &binary, script, config);
        options.boot_file = boot_file;
        options.next_server = next_server.unwrap_or(Ipv4Addr::UNSPECIFIED);
        options.vendor_options = Some(pxe_vendor_options(cx));
        options
    }
}

/// Picks `(boot file, next server)` for a netboot client. The first matching
/// rule wins, and the order is load-bearing:
///
/// 1. our own iPXE build (or the configured custom user class) gets the
///    script URL, which breaks the chainload loop;
/// 2. UEFI HTTP Boot clients get an HTTP URL to the binary;
/// 3. a stock iPXE ROM gets a full TFTP URL, because the option 43 we set
///    disables PXE discovery and the ROM needs an explicit next hop;
/// 4. everyone else gets the bare binary name and does PXE discovery.
fn bootfile_and_next_server(
    user_class: &str,
    client_is_http: bool,
    binary: &str,
    script: Option<&url::Url>,
    config: &ServerConfig,
) -> (String, Option<Ipv4Addr>) {
    let custom_class_matches = config
        .user_class
        .as_deref()
        .is_some_and(|c| !c.is_empty() && c == user_class);
    if user_class == USER_CLASS_TINKERBELL || custom_class_matches {
        let boot_file = script
            .map(ToString::to_string)
            .unwrap_or_else(|| NO_SCRIPT_DEFINED.to_string());
        return (boot_file, None);
    }

    if client_is_http {
        if let Some(base) = &config.ipxe_bin_server_http {
            let boot_file = format!("{}/{}", base.as_str().trim_end_matches('/'), binary);
            let next_server = match base.host_str().and_then(|h| h.parse::<Ipv4Addr>().ok()) {
                Some(ip) => ip,
                None => {
                    error!(host = ?base.host_str(), "unable to parse an IPv4 next-server from the HTTP boot URL");
                    Ipv4Addr::UNSPECIFIED
                }
            };
            return (boot_file, Some(next_server));
        }
        error!("HTTPClient request but no HTTP boot URL is configured");
    }

    let tftp = config.ipxe_bin_server_tftp;
    if user_class == USER_CLASS_IPXE {
        return (format!("tftp://{tftp}/{binary}"), Some(*tftp.ip()));
    }
    (binary.to_string(), Some(*tftp.ip()))
}

/// Option 43 payload: sub-option 6 (boot server discovery control: bypass,
/// just boot from the filename) and sub-option 69 (binary traceparent for
/// downstream artifact-fetch correlation), End-terminated.
fn pxe_vendor_options(cx: &Context) -> Vec<u8> {
    let traceparent = otel::binary_traceparent(cx);
    let mut out = Vec::with_capacity(3 + 2 + traceparent.len() + 1);
    out.extend_from_slice(&[6, 1, 8]);
    out.push(69);
    out.push(traceparent.len() as u8);
    out.extend_from_slice(&traceparent);
    out.push(0xff);
    out
}
