//! Backend contract: the single plug-in surface of the core.
//!
//! A backend resolves a client MAC to the DHCP parameters and netboot
//! instructions for that host. File watchers, cluster-object caches and
//! remote RPC clients all sit behind this one trait.

use async_trait::async_trait;
use macaddr::MacAddr6;
use thiserror::Error;

use crate::record::{DhcpRecord, NetbootRecord};

/// Why a backend read produced no usable reservation.
///
/// The dispatcher distinguishes these only by kind: `NotFound` drops the
/// request silently, the other two drop it loudly. A missing or unhealthy
/// backend causes silence, never a wrong reply.
#[derive(Debug, Error)]
pub enum BackendError {
    /// No reservation exists for this MAC.
    #[error("no reservation for {mac}")]
    NotFound { mac: MacAddr6 },

    /// The backend is temporarily unavailable.
    #[error("backend unavailable: {reason}")]
    Transient { reason: String },

    /// The backend answered with data violating the record invariants.
    #[error("malformed backend data: {0}")]
    Malformed(String),
}

/// Read DHCP and netboot data for one client MAC.
///
/// Called at most once per DHCP transaction; the server never retries within
/// a transaction. Cancellation rides on future drop, so long-running
/// implementations should be cancel-safe.
#[async_trait]
pub trait BackendReader: Send + Sync {
    async fn read(&self, mac: MacAddr6) -> Result<(DhcpRecord, NetbootRecord), BackendError>;
}
