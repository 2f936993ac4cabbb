//! Persisted records: proxy instances and their owning users

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::core::UserId;
use crate::settings::{Protocol, ProxySettings};

/// Proxy instance identifier
pub type InstanceId = Uuid;

/// One configured proxy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProxyInstance {
    pub id: InstanceId,
    #[serde(rename = "userID")]
    pub user_id: UserId,
    pub protocol: Protocol,
    pub port: u16,
    pub settings: ProxySettings,
    pub enabled: bool,
    /// Cumulative bytes client -> upstream
    #[serde(default)]
    pub upload: u64,
    /// Cumulative bytes upstream -> client
    #[serde(default)]
    pub download: u64,
    #[serde(default)]
    pub last_active_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub expire_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ProxyInstance {
    /// New enabled record with zeroed counters
    pub fn new(user_id: UserId, port: u16, settings: ProxySettings) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            user_id,
            protocol: settings.protocol(),
            port,
            settings,
            enabled: true,
            upload: 0,
            download: 0,
            last_active_at: None,
            expire_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expire_at.is_some_and(|at| now >= at)
    }
}

/// Account owning proxy instances
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: UserId,
    /// Byte quota, 0 = unlimited
    #[serde(default)]
    pub traffic_limit: u64,
    #[serde(default)]
    pub traffic_used: u64,
    #[serde(default)]
    pub expire_at: Option<DateTime<Utc>>,
    pub enabled: bool,
}

impl User {
    pub fn new(id: UserId) -> Self {
        Self {
            id,
            traffic_limit: 0,
            traffic_used: 0,
            expire_at: None,
            enabled: true,
        }
    }

    pub fn is_over_quota(&self) -> bool {
        self.traffic_limit > 0 && self.traffic_used >= self.traffic_limit
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expire_at.is_some_and(|at| now >= at)
    }

    /// Whether this user's instances may keep serving
    pub fn may_serve(&self, now: DateTime<Utc>) -> bool {
        self.enabled && !self.is_over_quota() && !self.is_expired(now)
    }
}
