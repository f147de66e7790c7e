//! qrtc - Low-Latency Voice-over-QUIC Relay Server
//!
//! Authenticated clients connect, join a logical channel, and send
//! Opus-encoded audio frames; the server fans each frame out to every other
//! client on the same channel, or echoes it back to the sender when the
//! connection was authenticated in echo mode. Channel 0 is a quarantine
//! channel that relays nothing.
//!
//! ## Architecture
//!
//! Each connection carries exactly two client-opened streams:
//!
//! - **Control stream** (unidirectional): one authentication message, then
//!   channel joins
//! - **Data stream** (bidirectional): length-prefixed Opus frames inbound,
//!   sender-tagged frames outbound
//!
//! One task per connection runs the protocol state machine; a per-client
//! writer task drains a bounded outbound queue so a slow receiver can never
//! block a sender. The shared [`server::ClientRegistry`] maps clients to
//! channels and is the only shared mutable state in the process.
//!
//! Clients are authorized by POSTing their credentials to an external web
//! service; a set of HTTP endpoints exposes read-only snapshots of the
//! registry for introspection.

pub mod auth;
pub mod config;
pub mod error;
pub mod http;
pub mod protocol;
pub mod server;

pub use error::{RelayError, Result};

pub use config::{Config, LogLevel, DEFAULT_CONFIG_PATH};

pub use protocol::{
    ControlMessage, FRAME_BUF, MAX_CREDENTIAL_BYTES, MAX_PAYLOAD, QUARANTINE_CHANNEL, RELAY_HEADER,
};

pub use server::{
    client_config, ClientInfo, ClientRegistry, ConnectionHandler, RelayClient, RelayServer,
    StoreInfo, ALPN,
};

pub use auth::AuthClient;

pub use http::{AppInfo, AppState};
