//! In-process storage backend

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::RwLock;

use super::{Storage, StorageResult};
use crate::core::UserId;
use crate::error::StorageError;
use crate::manager::{InstanceId, ProxyInstance, User};

/// Everything a storage backend holds
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub(crate) struct StorageState {
    #[serde(default)]
    pub proxies: HashMap<InstanceId, ProxyInstance>,
    #[serde(default)]
    pub users: HashMap<UserId, User>,
}

#[derive(Debug, Default)]
pub struct MemoryStorage {
    state: RwLock<StorageState>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn from_state(state: StorageState) -> Self {
        Self {
            state: RwLock::new(state),
        }
    }

    pub(crate) async fn snapshot(&self) -> StorageState {
        self.state.read().await.clone()
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn save_proxy(&self, proxy: &ProxyInstance) -> StorageResult<()> {
        self.state
            .write()
            .await
            .proxies
            .insert(proxy.id, proxy.clone());
        Ok(())
    }

    async fn load_proxy(&self, id: InstanceId) -> StorageResult<Option<ProxyInstance>> {
        Ok(self.state.read().await.proxies.get(&id).cloned())
    }

    async fn list_proxies(&self, user_id: Option<UserId>) -> StorageResult<Vec<ProxyInstance>> {
        let state = self.state.read().await;
        let mut proxies: Vec<_> = state
            .proxies
            .values()
            .filter(|p| user_id.map_or(true, |uid| p.user_id == uid))
            .cloned()
            .collect();
        proxies.sort_by_key(|p| p.created_at);
        Ok(proxies)
    }

    async fn delete_proxy(&self, id: InstanceId) -> StorageResult<()> {
        match self.state.write().await.proxies.remove(&id) {
            Some(_) => Ok(()),
            None => Err(StorageError::NotFound(id.to_string())),
        }
    }

    async fn save_traffic_delta(
        &self,
        id: InstanceId,
        upload: u64,
        download: u64,
    ) -> StorageResult<()> {
        let mut state = self.state.write().await;
        let proxy = state
            .proxies
            .get_mut(&id)
            .ok_or_else(|| StorageError::NotFound(id.to_string()))?;
        proxy.upload = proxy.upload.saturating_add(upload);
        proxy.download = proxy.download.saturating_add(download);
        proxy.updated_at = Utc::now();
        let owner = proxy.user_id;

        if let Some(user) = state.users.get_mut(&owner) {
            user.traffic_used = user
                .traffic_used
                .saturating_add(upload)
                .saturating_add(download);
        }
        Ok(())
    }

    async fn get_user(&self, id: UserId) -> StorageResult<Option<User>> {
        Ok(self.state.read().await.users.get(&id).cloned())
    }

    async fn save_user(&self, user: &User) -> StorageResult<()> {
        self.state.write().await.users.insert(user.id, user.clone());
        Ok(())
    }

    async fn list_users(&self) -> StorageResult<Vec<User>> {
        let mut users: Vec<_> = self.state.read().await.users.values().cloned().collect();
        users.sort_by_key(|u| u.id);
        Ok(users)
    }

    async fn disable_user_proxies(&self, user_id: UserId) -> StorageResult<Vec<InstanceId>> {
        let mut state = self.state.write().await;
        let now = Utc::now();
        let ids = state
            .proxies
            .values_mut()
            .filter(|p| p.user_id == user_id && p.enabled)
            .map(|p| {
                p.enabled = false;
                p.updated_at = now;
                p.id
            })
            .collect();
        Ok(ids)
    }
}
