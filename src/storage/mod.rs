//! Persistence port
//!
//! The manager and collector only see the [`Storage`] trait. `MemoryStorage`
//! keeps everything in process, `JsonFileStorage` mirrors it to a state file.

mod file;
mod memory;

pub use file::JsonFileStorage;
pub use memory::MemoryStorage;

use async_trait::async_trait;

use crate::core::UserId;
use crate::error::StorageError;
use crate::manager::{InstanceId, ProxyInstance, User};

pub type StorageResult<T> = std::result::Result<T, StorageError>;

#[async_trait]
pub trait Storage: Send + Sync {
    /// Insert or replace a proxy record
    async fn save_proxy(&self, proxy: &ProxyInstance) -> StorageResult<()>;

    async fn load_proxy(&self, id: InstanceId) -> StorageResult<Option<ProxyInstance>>;

    /// All proxies, or only those owned by `user_id`
    async fn list_proxies(&self, user_id: Option<UserId>) -> StorageResult<Vec<ProxyInstance>>;

    /// Fails with `NotFound` when no such record exists
    async fn delete_proxy(&self, id: InstanceId) -> StorageResult<()>;

    /// Add a traffic delta to the proxy and to its owner's usage
    async fn save_traffic_delta(
        &self,
        id: InstanceId,
        upload: u64,
        download: u64,
    ) -> StorageResult<()>;

    async fn get_user(&self, id: UserId) -> StorageResult<Option<User>>;

    async fn save_user(&self, user: &User) -> StorageResult<()>;

    async fn list_users(&self) -> StorageResult<Vec<User>>;

    /// Mark every proxy of `user_id` disabled, returns the affected ids
    async fn disable_user_proxies(&self, user_id: UserId) -> StorageResult<Vec<InstanceId>>;
}
