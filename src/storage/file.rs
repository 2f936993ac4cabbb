//! JSON state file backend
//!
//! Holds the state in memory and rewrites `<data_dir>/state.json` after each
//! mutation. The file is replaced through a rename so a crash mid-write
//! leaves the previous state intact.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;

use super::memory::{MemoryStorage, StorageState};
use super::{Storage, StorageResult};
use crate::core::UserId;
use crate::logger::log;
use crate::manager::{InstanceId, ProxyInstance, User};

/// State file name
const STATE_FILE: &str = "state.json";

pub struct JsonFileStorage {
    path: PathBuf,
    inner: MemoryStorage,
    /// Serializes file rewrites
    write_lock: Mutex<()>,
}

impl JsonFileStorage {
    /// Open (or create) the state file under `data_dir`
    pub async fn open(data_dir: &Path) -> StorageResult<Self> {
        tokio::fs::create_dir_all(data_dir).await?;
        let path = data_dir.join(STATE_FILE);

        let state = match tokio::fs::read_to_string(&path).await {
            Ok(content) => {
                let state: StorageState = serde_json::from_str(&content)?;
                log::info!(
                    path = %path.display(),
                    proxies = state.proxies.len(),
                    users = state.users.len(),
                    "Loaded state from file"
                );
                state
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => StorageState::default(),
            Err(e) => return Err(e.into()),
        };

        Ok(Self {
            path,
            inner: MemoryStorage::from_state(state),
            write_lock: Mutex::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn persist(&self) -> StorageResult<()> {
        let _guard = self.write_lock.lock().await;
        let state = self.inner.snapshot().await;
        let content = serde_json::to_vec_pretty(&state)?;

        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, content).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        log::trace!(path = %self.path.display(), "Saved state to file");
        Ok(())
    }
}

#[async_trait]
impl Storage for JsonFileStorage {
    async fn save_proxy(&self, proxy: &ProxyInstance) -> StorageResult<()> {
        self.inner.save_proxy(proxy).await?;
        self.persist().await
    }

    async fn load_proxy(&self, id: InstanceId) -> StorageResult<Option<ProxyInstance>> {
        self.inner.load_proxy(id).await
    }

    async fn list_proxies(&self, user_id: Option<UserId>) -> StorageResult<Vec<ProxyInstance>> {
        self.inner.list_proxies(user_id).await
    }

    async fn delete_proxy(&self, id: InstanceId) -> StorageResult<()> {
        self.inner.delete_proxy(id).await?;
        self.persist().await
    }

    async fn save_traffic_delta(
        &self,
        id: InstanceId,
        upload: u64,
        download: u64,
    ) -> StorageResult<()> {
        self.inner.save_traffic_delta(id, upload, download).await?;
        self.persist().await
    }

    async fn get_user(&self, id: UserId) -> StorageResult<Option<User>> {
        self.inner.get_user(id).await
    }

    async fn save_user(&self, user: &User) -> StorageResult<()> {
        self.inner.save_user(user).await?;
        self.persist().await
    }

    async fn list_users(&self) -> StorageResult<Vec<User>> {
        self.inner.list_users().await
    }

    async fn disable_user_proxies(&self, user_id: UserId) -> StorageResult<Vec<InstanceId>> {
        let ids = self.inner.disable_user_proxies(user_id).await?;
        if !ids.is_empty() {
            self.persist().await?;
        }
        Ok(ids)
    }
}
