//! Wire types for the requestd network-service protocol.
//!
//! This crate contains the serde-serializable types exchanged with the
//! out-of-process network service. These types represent the "protocol
//! layer" - the shapes of data as they appear on the wire.
//!
//! # Design Philosophy
//!
//! Types in this crate are:
//! - **Pure data**: No behavior beyond serialization/deserialization and
//!   small accessors
//! - **1:1 with protocol**: One struct per outbound call and per inbound
//!   notification
//! - **Stable**: Changes only when the wire protocol changes
//!
//! The session manager, registries, and transport live in `requestd-client`.

pub mod headers;
pub mod payloads;
pub mod types;

pub use headers::{CaseInsensitive, CasePolicy, CaseSensitive, HeaderMap};
pub use payloads::*;
pub use types::{CacheLevel, ConnectionId, FileHandle, ProxyConfig, RequestId};
