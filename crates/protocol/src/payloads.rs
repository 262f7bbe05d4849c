//! Call and notification payloads.
//!
//! One struct per outbound call (client to service) and per inbound
//! notification (service to client). Binary fields travel base64-encoded
//! inside the JSON frame; file descriptors travel out-of-band and appear
//! here only as [`FileHandle`] numbers.

use serde::{Deserialize, Serialize};

use crate::headers::{CaseInsensitive, CasePolicy, HeaderMap};
use crate::types::{CacheLevel, ConnectionId, FileHandle, ProxyConfig, RequestId};

/// Method names used on the wire.
pub mod methods {
    pub const ENSURE_CONNECTION: &str = "ensure_connection";
    pub const START_REQUEST: &str = "start_request";
    pub const STOP_REQUEST: &str = "stop_request";
    pub const SET_CERTIFICATE: &str = "set_certificate";
    pub const WEBSOCKET_CONNECT: &str = "websocket_connect";

    pub const REQUEST_STARTED: &str = "request_started";
    pub const REQUEST_PROGRESS: &str = "request_progress";
    pub const HEADERS_AVAILABLE: &str = "headers_available";
    pub const CERTIFICATE_REQUESTED: &str = "certificate_requested";
    pub const REQUEST_FINISHED: &str = "request_finished";
    pub const WEBSOCKET_CONNECTED: &str = "websocket_connected";
    pub const WEBSOCKET_RECEIVED: &str = "websocket_received";
    pub const WEBSOCKET_ERRORED: &str = "websocket_errored";
    pub const WEBSOCKET_CLOSED: &str = "websocket_closed";
    pub const WEBSOCKET_CERTIFICATE_REQUESTED: &str = "websocket_certificate_requested";
}

/// Serde helper encoding `Vec<u8>` as a base64 string.
pub mod base64_bytes {
    use base64::Engine as _;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }
}

// Outbound calls.

/// Preconnect hint: warm the connection cache for a host.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnsureConnection {
    pub url: String,
    pub cache_level: CacheLevel,
}

/// Start an HTTP-like exchange. Fire-and-forget; all results arrive as
/// notifications carrying `id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartRequest<C: CasePolicy = CaseInsensitive> {
    pub id: RequestId,
    pub method: String,
    pub url: String,
    #[serde(bound = "")]
    pub headers: HeaderMap<C>,
    #[serde(with = "base64_bytes")]
    pub body: Vec<u8>,
    pub proxy: ProxyConfig,
}

/// Request best-effort cancellation. Replied with an acknowledgment bool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StopRequest {
    pub id: RequestId,
}

/// Supply a client certificate/key pair for a request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SetCertificate {
    pub id: RequestId,
    pub certificate: String,
    pub key: String,
}

/// Open a WebSocket session. Replied with the connection id (negative on
/// refusal).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebSocketConnect<C: CasePolicy = CaseInsensitive> {
    pub url: String,
    pub origin: String,
    pub protocols: Vec<String>,
    pub extensions: Vec<String>,
    #[serde(bound = "")]
    pub headers: HeaderMap<C>,
}

// Inbound notifications.

/// The service accepted the request and transferred the response descriptor.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RequestStarted {
    pub id: RequestId,
    pub fd: FileHandle,
}

/// Download progress snapshot.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RequestProgress {
    pub id: RequestId,
    pub total_size: Option<u64>,
    pub downloaded_size: u64,
}

/// Response headers (and optional status code) became available.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeadersAvailable {
    pub id: RequestId,
    pub headers: HeaderMap,
    pub status_code: Option<u32>,
}

/// The peer asked for a client certificate.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct CertificateRequested {
    pub id: RequestId,
}

/// Terminal notification for a request.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RequestFinished {
    pub id: RequestId,
    pub success: bool,
    pub total_size: u64,
}

/// The WebSocket handshake completed.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct WebSocketConnected {
    pub id: ConnectionId,
}

/// A WebSocket message arrived.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebSocketReceived {
    pub id: ConnectionId,
    pub is_text: bool,
    #[serde(with = "base64_bytes")]
    pub data: Vec<u8>,
}

/// The WebSocket failed; terminal.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct WebSocketErrored {
    pub id: ConnectionId,
    pub code: i32,
}

/// The WebSocket closed; terminal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebSocketClosed {
    pub id: ConnectionId,
    pub code: u16,
    pub reason: String,
    pub clean: bool,
}

/// The peer asked the WebSocket side for a client certificate.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct WebSocketCertificateRequested {
    pub id: ConnectionId,
}
