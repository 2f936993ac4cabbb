//! Per-protocol wire codecs
//!
//! Every decoder reads only the bytes its header needs and reports malformed
//! or truncated input as a [`CodecError`](crate::error::CodecError).

pub mod dokodemo;
pub mod http;
pub mod shadowsocks;
pub mod socks;
pub mod trojan;
pub mod vmess;

pub use dokodemo::DokodemoTarget;
pub use http::HttpProxyRequest;
pub use socks::{Socks4Reply, Socks4Request, Socks5Reply, Socks5Request};
pub use trojan::{TrojanCmd, TrojanRequest};
pub use vmess::{VMessCmd, VMessRequest, VLESS_VERSION, VMESS_VERSION};
