//! Core protocol types used across the wire.
//!
//! Handles are opaque integers. Requests and WebSocket connections draw from
//! independent namespaces, so the two id types are kept distinct at the type
//! level - a `RequestId` can never index the connection registry.

use std::fmt;
use std::os::fd::{FromRawFd, OwnedFd, RawFd};

use serde::{Deserialize, Serialize};

/// Handle identifying one outstanding request.
///
/// Issued by the client-side allocator, strictly increasing, never reused
/// while an entry with this handle is registered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(pub i32);

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Handle identifying one WebSocket connection.
///
/// Assigned by the remote service in the `websocket_connect` reply. A
/// negative value means the connect was refused and no connection exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(pub i32);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Connection-cache hint for [`EnsureConnection`](crate::payloads::EnsureConnection).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheLevel {
    /// Resolve the host and open a connection ahead of time.
    CreateConnection,
    /// Only warm the DNS cache.
    ResolveOnly,
}

/// Proxy configuration for a request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProxyConfig {
    /// No proxy (default).
    #[default]
    Direct,
    /// SOCKS5 proxy.
    Socks5 {
        /// Proxy server host.
        server: String,
        /// Proxy server port.
        port: u16,
    },
}

/// A file descriptor received from the remote service.
///
/// The descriptor itself travels out-of-band (SCM_RIGHTS over the IPC
/// socket); the wire message carries its number. The receiving dispatch
/// converts it into an [`OwnedFd`] exactly once, after which the descriptor
/// is owned by the target entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FileHandle(RawFd);

impl FileHandle {
    /// Wraps a raw descriptor number.
    pub fn new(fd: RawFd) -> Self {
        Self(fd)
    }

    /// Returns the raw descriptor number without taking ownership.
    pub fn raw(self) -> RawFd {
        self.0
    }

    /// Takes ownership of the descriptor.
    ///
    /// # Safety
    ///
    /// The caller must guarantee the descriptor is open, owned by this
    /// process, and not owned by any other `OwnedFd`. For descriptors
    /// delivered by the IPC layer's fd transfer this holds by construction.
    pub unsafe fn into_owned(self) -> OwnedFd {
        unsafe { OwnedFd::from_raw_fd(self.0) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_id_serializes_transparent() {
        let id = RequestId(7);
        assert_eq!(serde_json::to_value(id).unwrap(), serde_json::json!(7));
        let back: RequestId = serde_json::from_value(serde_json::json!(7)).unwrap();
        assert_eq!(back, id);
    }

    #[test]
    fn proxy_config_defaults_to_direct() {
        assert_eq!(ProxyConfig::default(), ProxyConfig::Direct);
        let json = serde_json::to_value(ProxyConfig::Socks5 {
            server: "127.0.0.1".to_string(),
            port: 1080,
        })
        .unwrap();
        assert_eq!(json["type"], "socks5");
        assert_eq!(json["port"], 1080);
    }

    #[test]
    fn cache_level_wire_names() {
        assert_eq!(
            serde_json::to_value(CacheLevel::CreateConnection).unwrap(),
            serde_json::json!("create_connection")
        );
        assert_eq!(
            serde_json::to_value(CacheLevel::ResolveOnly).unwrap(),
            serde_json::json!("resolve_only")
        );
    }

    #[test]
    fn file_handle_round_trips_number() {
        let handle = FileHandle::new(7);
        assert_eq!(handle.raw(), 7);
        assert_eq!(serde_json::to_value(handle).unwrap(), serde_json::json!(7));
    }
}
