//! requestd client - Session management for the network service
//!
//! This crate provides the client-side runtime for talking to the privileged
//! out-of-process network service:
//!
//! - **Transport**: Length-prefixed JSON frames over a bidirectional pipe
//! - **Session**: Call/reply correlation and notification dispatch
//! - **Requests**: HTTP-like exchange handles with response fd handoff
//! - **WebSockets**: Connection handles with an explicit state machine
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐
//! │ application  │  start_request / websocket_connect
//! └──────┬───────┘
//!        │ Arc<Request>, Arc<WebSocketConnection>
//! ┌──────▼───────┐
//! │ requestd-    │  This crate
//! │ client       │
//! │  ┌─────────┐ │
//! │  │ Session │ │  call correlation, handle registries
//! │  └─────────┘ │
//! │  ┌─────────┐ │
//! │  │ Trans   │ │  framed pipe transport
//! │  └─────────┘ │
//! └──────┬───────┘
//!        │ IPC (frames + fd transfer)
//! ┌──────▼───────┐
//! │ requestd     │  privileged network service process
//! └──────────────┘
//! ```
//!
//! # Handle lifecycle
//!
//! Request handles are allocated locally and registered before the starting
//! call reaches the transport, so notifications can never race an
//! unregistered handle. WebSocket handles are assigned by the service and
//! registered once its reply arrives; notifications arriving for handles the
//! registry does not know are dropped with a log line, never an error.

pub mod alloc;
pub mod error;
pub mod events;
pub mod request;
pub mod session;
pub mod transport;
pub mod websocket;

// Re-export key types at crate root
pub use error::{Error, Result};
pub use events::EventStream;
pub use request::{Progress, Request, RequestEvent, RequestOutcome};
pub use session::SessionClient;
pub use transport::{
    PipeTransport, PipeTransportReceiver, PipeTransportSender, Transport, TransportParts,
    TransportReceiver,
};
pub use websocket::{ConnectionState, WebSocketConnection, WebSocketEvent};

// The protocol crate is the wire-format source of truth; surface it so
// callers do not need a separate dependency for header maps and ids.
pub use requestd_protocol as protocol;
