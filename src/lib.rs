//! Multi-tenant proxy node
//!
//! Architecture:
//! - `core/`: Wire codecs, credential checks, connection handling, relay and
//!   server instances
//! - `settings`: Per-protocol instance settings
//! - `manager/`: Registry and lifecycle of server instances
//! - `storage/`: Persistence port and its backends
//! - `collector`: Periodic traffic flush and quota enforcement

pub mod collector;
pub mod config;
pub mod core;
pub mod error;
pub mod logger;
pub mod manager;
pub mod settings;
pub mod storage;

pub use collector::{TrafficCollector, TrafficCollectorHandle};
pub use error::{CodecError, ProxyError, Result, StorageError};
pub use manager::{InstanceId, ProxyInstance, ProxyManager, User};
pub use settings::{Protocol, ProxySettings};
