//! Core proxy engine
//!
//! This module contains the protocol-facing parts of a node:
//! - Wire codecs for every inbound protocol
//! - Credential checks and the Shadowsocks stream cipher
//! - Per-connection handling and the bidirectional relay
//! - Server instances (listener + accept loop)

pub mod address;
pub mod auth;
pub mod cipher;
mod connection;
pub mod handler;
pub mod hooks;
pub mod protocol;
pub mod relay;
mod server;
pub mod stats;
pub mod tls;

pub use address::Destination;
pub use connection::{ConnectionId, ConnectionManager};
pub use handler::{ConnState, ConnectionHandler, InboundProtocol};
pub use hooks::{Dialer, DirectDialer, StatsCollector, UserId};
pub use relay::{relay, CloseReason, RelayOptions, RelayResult};
pub use server::{ServerBuilder, ServerInstance};
pub use stats::{InstanceStats, TrafficSnapshot};
