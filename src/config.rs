//! Server configuration.
//!
//! `ServerConfig` is immutable once the server is running and shared
//! read-only across handlers. `ServerConfigBuilder` takes the required
//! fields up front and supplies typed defaults for the rest.

use std::fmt;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::Arc;

use url::Url;

use crate::backend::BackendReader;

/// Default DHCP server port.
pub const DHCP_SERVER_PORT: u16 = 67;

/// Default TFTP port for the iPXE binary server.
pub const TFTP_PORT: u16 = 69;

/// Process-wide DHCP server configuration.
#[derive(Clone)]
pub struct ServerConfig {
    /// UDP endpoint to listen on. Binding 0.0.0.0 captures broadcast
    /// traffic; the IP identifies an interface for reply sourcing.
    pub listen_addr: SocketAddrV4,

    /// Server identifier (option 54) and siaddr in plain replies. May differ
    /// from the listen address.
    pub server_ip: Ipv4Addr,

    /// TFTP endpoint serving iPXE binaries.
    pub ipxe_bin_server_tftp: SocketAddrV4,

    /// HTTP base URL serving iPXE binaries, for UEFI HTTP Boot clients.
    pub ipxe_bin_server_http: Option<Url>,

    /// Default iPXE script URL for clients already running our iPXE build.
    /// A netboot record's own URL takes precedence.
    pub ipxe_script_url: Option<Url>,

    /// When false, replies never carry boot options.
    pub netboot_enabled: bool,

    /// Custom option 77 value that also breaks the iPXE chainload loop.
    pub user_class: Option<String>,

    /// Gates the trace-id suffix appended to boot file names.
    pub otel_enabled: bool,

    /// Source of truth for per-MAC reservations.
    pub backend: Arc<dyn BackendReader>,
}

impl ServerConfig {
    /// Starts a builder from the two fields without sensible defaults.
    pub fn builder(server_ip: Ipv4Addr, backend: Arc<dyn BackendReader>) -> ServerConfigBuilder {
        ServerConfigBuilder {
            config: ServerConfig {
                listen_addr: SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, DHCP_SERVER_PORT),
                server_ip,
                ipxe_bin_server_tftp: SocketAddrV4::new(server_ip, TFTP_PORT),
                ipxe_bin_server_http: None,
                ipxe_script_url: None,
                netboot_enabled: true,
                user_class: None,
                otel_enabled: false,
                backend,
            },
        }
    }
}

impl fmt::Debug for ServerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerConfig")
            .field("listen_addr", &self.listen_addr)
            .field("server_ip", &self.server_ip)
            .field("ipxe_bin_server_tftp", &self.ipxe_bin_server_tftp)
            .field("ipxe_bin_server_http", &self.ipxe_bin_server_http)
            .field("ipxe_script_url", &self.ipxe_script_url)
            .field("netboot_enabled", &self.netboot_enabled)
            .field("user_class", &self.user_class)
            .field("otel_enabled", &self.otel_enabled)
            .finish_non_exhaustive()
    }
}

/// Builder for [`ServerConfig`].
#[derive(Debug, Clone)]
pub struct ServerConfigBuilder {
    config: ServerConfig,
}

impl ServerConfigBuilder {
    /// Set the UDP endpoint to listen on.
    pub fn with_listen_addr(mut self, addr: SocketAddrV4) -> Self {
        self.config.listen_addr = addr;
        self
    }

    /// Set the TFTP endpoint serving iPXE binaries.
    pub fn with_ipxe_bin_server_tftp(mut self, addr: SocketAddrV4) -> Self {
        self.config.ipxe_bin_server_tftp = addr;
        self
    }

    /// Set the HTTP base URL serving iPXE binaries.
    pub fn with_ipxe_bin_server_http(mut self, url: Url) -> Self {
        self.config.ipxe_bin_server_http = Some(url);
        self
    }

    /// Set the default iPXE script URL.
    pub fn with_ipxe_script_url(mut self, url: Url) -> Self {
        self.config.ipxe_script_url = Some(url);
        self
    }

    /// Enable or disable netboot options in replies.
    pub fn with_netboot_enabled(mut self, enabled: bool) -> Self {
        self.config.netboot_enabled = enabled;
        self
    }

    /// Set a custom option 77 value that breaks the chainload loop.
    pub fn with_user_class(mut self, user_class: impl Into<String>) -> Self {
        self.config.user_class = Some(user_class.into());
        self
    }

    /// Enable the trace-id suffix on boot file names.
    pub fn with_otel_enabled(mut self, enabled: bool) -> Self {
        self.config.otel_enabled = enabled;
        self
    }

    pub fn build(self) -> ServerConfig {
        self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::BackendError;
    use crate::record::{DhcpRecord, NetbootRecord};
    use async_trait::async_trait;
    use macaddr::MacAddr6;

    struct NoBackend;

    #[async_trait]
    impl BackendReader for NoBackend {
        async fn read(
            &self,
            mac: MacAddr6,
        ) -> Result<(DhcpRecord, NetbootRecord), BackendError> {
            Err(BackendError::NotFound { mac })
        }
    }

    #[test]
    fn test_builder_defaults() {
        let config =
            ServerConfig::builder(Ipv4Addr::new(192, 168, 1, 1), Arc::new(NoBackend)).build();

        assert_eq!(
            config.listen_addr,
            SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 67)
        );
        assert_eq!(config.server_ip, Ipv4Addr::new(192, 168, 1, 1));
        assert_eq!(
            config.ipxe_bin_server_tftp,
            SocketAddrV4::new(Ipv4Addr::new(192, 168, 1, 1), 69)
        );
        assert!(config.ipxe_bin_server_http.is_none());
        assert!(config.ipxe_script_url.is_none());
        assert!(config.netboot_enabled);
        assert!(config.user_class.is_none());
        assert!(!config.otel_enabled);
    }

    #[test]
    fn test_builder_overrides() {
        let config = ServerConfig::builder(Ipv4Addr::new(127, 0, 0, 1), Arc::new(NoBackend))
            .with_listen_addr(SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 2), 6767))
            .with_ipxe_bin_server_tftp(SocketAddrV4::new(Ipv4Addr::new(192, 168, 6, 5), 69))
            .with_ipxe_bin_server_http(Url::parse("http://192.168.1.34:8080").unwrap())
            .with_ipxe_script_url(Url::parse("http://localhost:8181/auto.ipxe").unwrap())
            .with_netboot_enabled(false)
            .with_user_class("acme-installer")
            .with_otel_enabled(true)
            .build();

        assert_eq!(
            config.listen_addr,
            SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 2), 6767)
        );
        assert_eq!(
            config.ipxe_bin_server_tftp,
            SocketAddrV4::new(Ipv4Addr::new(192, 168, 6, 5), 69)
        );
        assert_eq!(
            config.ipxe_bin_server_http.as_ref().unwrap().as_str(),
            "http://192.168.1.34:8080/"
        );
        assert!(!config.netboot_enabled);
        assert_eq!(config.user_class.as_deref(), Some("acme-installer"));
        assert!(config.otel_enabled);
    }

    #[test]
    fn test_debug_skips_backend() {
        let config =
            ServerConfig::builder(Ipv4Addr::new(192, 168, 1, 1), Arc::new(NoBackend)).build();
        let out = format!("{config:?}");
        assert!(out.contains("server_ip"));
        assert!(!out.contains("backend"));
    }
}
