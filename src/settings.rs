//! Per-protocol instance settings
//!
//! Settings arrive as JSON at the storage/admin boundary using the field
//! names of the panel (`alterId`, `targetAddr`, ...). They are a closed sum
//! type, validated once before an instance is built.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use uuid::Uuid;

use crate::core::cipher::CipherMethod;
use crate::error::{ProxyError, Result};

/// Supported inbound protocols
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Vmess,
    Vless,
    Trojan,
    Shadowsocks,
    Socks,
    Http,
    Dokodemo,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Vmess => "vmess",
            Protocol::Vless => "vless",
            Protocol::Trojan => "trojan",
            Protocol::Shadowsocks => "shadowsocks",
            Protocol::Socks => "socks",
            Protocol::Http => "http",
            Protocol::Dokodemo => "dokodemo",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn default_network() -> String {
    "tcp".to_string()
}

/// Listener TLS material
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TlsSettings {
    pub cert_file: PathBuf,
    pub key_file: PathBuf,
    #[serde(default)]
    pub server_name: String,
    #[serde(default)]
    pub allow_insecure: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VMessSettings {
    pub id: Uuid,
    #[serde(default)]
    pub alter_id: u32,
    #[serde(default)]
    pub security: String,
    #[serde(default = "default_network")]
    pub network: String,
    #[serde(default)]
    pub host: String,
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub tls: bool,
    #[serde(default)]
    pub allow_insecure: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls_settings: Option<TlsSettings>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VLessSettings {
    pub id: Uuid,
    #[serde(default)]
    pub flow: String,
    #[serde(default = "default_network")]
    pub network: String,
    #[serde(default)]
    pub host: String,
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub tls: bool,
    #[serde(default)]
    pub allow_insecure: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls_settings: Option<TlsSettings>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrojanSettings {
    pub password: String,
    #[serde(default = "default_network")]
    pub network: String,
    #[serde(default)]
    pub host: String,
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub tls: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls_settings: Option<TlsSettings>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShadowsocksSettings {
    pub method: String,
    pub password: String,
    #[serde(default = "default_network")]
    pub network: String,
    #[serde(default)]
    pub host: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plugin: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plugin_opts: Option<String>,
}

/// SOCKS authentication mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SocksAuthMode {
    #[default]
    None,
    Password,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SocksSettings {
    #[serde(default)]
    pub auth: SocksAuthMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(default)]
    pub udp: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HttpSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(default)]
    pub tls: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls_settings: Option<TlsSettings>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DokodemoSettings {
    pub target_addr: String,
    pub target_port: u16,
    #[serde(default = "default_network")]
    pub network: String,
    /// Idle timeout in seconds, 0 keeps the node default
    #[serde(default)]
    pub timeout: u64,
}

/// Protocol-specific settings of one proxy instance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "protocol", content = "settings", rename_all = "lowercase")]
pub enum ProxySettings {
    Vmess(VMessSettings),
    Vless(VLessSettings),
    Trojan(TrojanSettings),
    Shadowsocks(ShadowsocksSettings),
    Socks(SocksSettings),
    Http(HttpSettings),
    Dokodemo(DokodemoSettings),
}

fn invalid(msg: impl Into<String>) -> ProxyError {
    ProxyError::InvalidSettings(msg.into())
}

fn check_network(network: &str) -> Result<()> {
    match network {
        "" | "tcp" => Ok(()),
        other => Err(invalid(format!("unsupported network: {}", other))),
    }
}

fn check_tls(enabled: bool, tls: &Option<TlsSettings>) -> Result<()> {
    if !enabled {
        return Ok(());
    }
    match tls {
        Some(t) if !t.cert_file.as_os_str().is_empty() && !t.key_file.as_os_str().is_empty() => {
            Ok(())
        }
        _ => Err(invalid("tls enabled without certFile/keyFile")),
    }
}

impl ProxySettings {
    pub fn protocol(&self) -> Protocol {
        match self {
            ProxySettings::Vmess(_) => Protocol::Vmess,
            ProxySettings::Vless(_) => Protocol::Vless,
            ProxySettings::Trojan(_) => Protocol::Trojan,
            ProxySettings::Shadowsocks(_) => Protocol::Shadowsocks,
            ProxySettings::Socks(_) => Protocol::Socks,
            ProxySettings::Http(_) => Protocol::Http,
            ProxySettings::Dokodemo(_) => Protocol::Dokodemo,
        }
    }

    /// TLS material when the listener must be TLS-wrapped
    pub fn tls(&self) -> Option<&TlsSettings> {
        let (enabled, tls) = match self {
            ProxySettings::Vmess(s) => (s.tls, &s.tls_settings),
            ProxySettings::Vless(s) => (s.tls, &s.tls_settings),
            ProxySettings::Trojan(s) => (s.tls, &s.tls_settings),
            ProxySettings::Http(s) => (s.tls, &s.tls_settings),
            _ => return None,
        };
        if enabled {
            tls.as_ref()
        } else {
            None
        }
    }

    /// Reject settings this node cannot serve
    pub fn validate(&self) -> Result<()> {
        match self {
            ProxySettings::Vmess(s) => {
                check_network(&s.network)?;
                check_tls(s.tls, &s.tls_settings)
            }
            ProxySettings::Vless(s) => {
                check_network(&s.network)?;
                if !s.flow.is_empty() {
                    return Err(invalid(format!("unsupported vless flow: {}", s.flow)));
                }
                check_tls(s.tls, &s.tls_settings)
            }
            ProxySettings::Trojan(s) => {
                check_network(&s.network)?;
                if s.password.is_empty() {
                    return Err(invalid("trojan password must not be empty"));
                }
                check_tls(s.tls, &s.tls_settings)
            }
            ProxySettings::Shadowsocks(s) => {
                check_network(&s.network)?;
                s.method.parse::<CipherMethod>().map_err(invalid)?;
                if s.password.is_empty() {
                    return Err(invalid("shadowsocks password must not be empty"));
                }
                if s.plugin.as_deref().is_some_and(|p| !p.is_empty()) {
                    return Err(invalid("shadowsocks plugins are not supported"));
                }
                Ok(())
            }
            ProxySettings::Socks(s) => {
                if s.auth == SocksAuthMode::Password {
                    let user = s.username.as_deref().unwrap_or_default();
                    let pass = s.password.as_deref().unwrap_or_default();
                    if user.is_empty() || pass.is_empty() {
                        return Err(invalid("socks password auth needs username and password"));
                    }
                }
                Ok(())
            }
            ProxySettings::Http(s) => {
                if s.username.is_some() != s.password.is_some() {
                    return Err(invalid("http auth needs both username and password"));
                }
                check_tls(s.tls, &s.tls_settings)
            }
            ProxySettings::Dokodemo(s) => {
                check_network(&s.network)?;
                if s.target_addr.is_empty() || s.target_port == 0 {
                    return Err(invalid("dokodemo needs targetAddr and targetPort"));
                }
                Ok(())
            }
        }
    }
}
