//! Proxy manager: registry and lifecycle of every server instance
//!
//! One `tokio::sync::RwLock` guards the registry. Mutations hold the write
//! lock across listener bind/close so two callers can never race for the
//! same port. Traffic counters live in each instance's atomics and never
//! touch the registry lock on the connection hot path.

mod model;

pub use model::{InstanceId, ProxyInstance, User};

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

use crate::config::ConnConfig;
use crate::core::{Dialer, DirectDialer, InstanceStats, ServerInstance, UserId};
use crate::error::{ProxyError, Result};
use crate::logger::log;
use crate::settings::ProxySettings;
use crate::storage::Storage;

/// How long `delete` waits for kicked connections to report their bytes
const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Registry slot: persisted record plus its (possibly stopped) listener
struct Entry {
    record: ProxyInstance,
    server: ServerInstance,
}

impl Entry {
    /// Record with live counters folded in
    fn snapshot(&self) -> ProxyInstance {
        let stats = self.server.stats();
        let pending = stats.peek();
        let mut record = self.record.clone();
        record.upload = record.upload.saturating_add(pending.upload);
        record.download = record.download.saturating_add(pending.download);
        record.last_active_at = stats.last_active_at().or(record.last_active_at);
        record
    }
}

/// Counters of one instance, as seen by the traffic collector
#[derive(Clone)]
pub struct TrafficSource {
    pub id: InstanceId,
    pub user_id: UserId,
    pub stats: Arc<InstanceStats>,
}

pub struct ProxyManager {
    registry: RwLock<HashMap<InstanceId, Entry>>,
    storage: Arc<dyn Storage>,
    conn_config: ConnConfig,
    dialer: Arc<dyn Dialer>,
}

fn port_in_use(registry: &HashMap<InstanceId, Entry>, port: u16, exclude: Option<InstanceId>) -> bool {
    registry
        .values()
        .any(|e| Some(e.record.id) != exclude && e.record.enabled && e.record.port == port)
}

impl ProxyManager {
    pub fn new(storage: Arc<dyn Storage>, conn_config: ConnConfig) -> Self {
        let dialer = Arc::new(DirectDialer::new(
            conn_config.connect_timeout,
            conn_config.tcp_nodelay,
        ));
        Self::with_dialer(storage, conn_config, dialer)
    }

    pub fn with_dialer(
        storage: Arc<dyn Storage>,
        conn_config: ConnConfig,
        dialer: Arc<dyn Dialer>,
    ) -> Self {
        Self {
            registry: RwLock::new(HashMap::new()),
            storage,
            conn_config,
            dialer,
        }
    }

    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.storage
    }

    fn build_server(
        &self,
        record: &ProxyInstance,
        stats: Option<Arc<InstanceStats>>,
    ) -> Result<ServerInstance> {
        let stats = stats.unwrap_or_else(|| {
            let stats = InstanceStats::new();
            stats.set_last_active_at(record.last_active_at);
            Arc::new(stats)
        });
        ServerInstance::builder()
            .port(record.port)
            .settings(record.settings.clone())
            .conn_config(self.conn_config.clone())
            .stats(stats)
            .dialer(Arc::clone(&self.dialer))
            .expire_at(record.expire_at)
            .build()
    }

    /// Create, start and persist a new instance
    pub async fn create(
        &self,
        user_id: UserId,
        port: u16,
        settings: ProxySettings,
        expire_at: Option<DateTime<Utc>>,
    ) -> Result<ProxyInstance> {
        settings.validate()?;

        let mut registry = self.registry.write().await;
        if port_in_use(&registry, port, None) {
            return Err(ProxyError::PortInUse(port));
        }

        let mut record = ProxyInstance::new(user_id, port, settings);
        record.expire_at = expire_at;
        let server = self.build_server(&record, None)?;
        server.start().await?;

        if let Err(e) = self.storage.save_proxy(&record).await {
            let _ = server.stop().await;
            return Err(e.into());
        }

        log::info!(
            instance = %record.id,
            user_id = user_id,
            protocol = %record.protocol,
            port = port,
            "Proxy instance created"
        );
        let entry = Entry { record, server };
        let snapshot = entry.snapshot();
        registry.insert(snapshot.id, entry);
        Ok(snapshot)
    }

    /// Replace settings (and optionally the port) of an instance.
    ///
    /// The old listener is closed before the new one binds, so the port is
    /// briefly unserved.
    pub async fn update(
        &self,
        id: InstanceId,
        port: Option<u16>,
        settings: ProxySettings,
    ) -> Result<ProxyInstance> {
        settings.validate()?;

        let mut registry = self.registry.write().await;
        let entry = registry.get(&id).ok_or(ProxyError::NotFound(id))?;

        let new_port = port.unwrap_or(entry.record.port);
        if entry.record.enabled && port_in_use(&registry, new_port, Some(id)) {
            return Err(ProxyError::PortInUse(new_port));
        }

        let mut record = entry.record.clone();
        record.port = new_port;
        record.protocol = settings.protocol();
        record.settings = settings;
        record.updated_at = Utc::now();
        let server = self.build_server(&record, Some(Arc::clone(entry.server.stats())))?;

        let was_running = entry.server.is_running();
        if was_running {
            entry.server.stop().await?;
        }
        let old = registry.remove(&id).ok_or(ProxyError::NotFound(id))?;

        let restore_old = |old: Entry| async move {
            if was_running {
                if let Err(e) = old.server.start().await {
                    log::error!(instance = %id, error = %e, "Failed to restart previous listener");
                }
            }
            old
        };

        if let Err(e) = self.storage.save_proxy(&record).await {
            let old = restore_old(old).await;
            registry.insert(id, old);
            return Err(e.into());
        }

        if record.enabled {
            if let Err(e) = server.start().await {
                if let Err(se) = self.storage.save_proxy(&old.record).await {
                    log::error!(instance = %id, error = %se, "Failed to roll back stored settings");
                }
                let old = restore_old(old).await;
                registry.insert(id, old);
                return Err(e);
            }
        }

        log::info!(instance = %id, port = new_port, protocol = %record.protocol, "Proxy instance updated");
        let entry = Entry { record, server };
        let snapshot = entry.snapshot();
        registry.insert(id, entry);
        Ok(snapshot)
    }

    /// Stop and remove an instance; its in-flight connections are closed
    pub async fn delete(&self, id: InstanceId) -> Result<()> {
        let mut registry = self.registry.write().await;
        let entry = registry.get_mut(&id).ok_or(ProxyError::NotFound(id))?;

        let was_running = entry.server.is_running();
        if was_running {
            entry.server.stop().await?;
        }
        let kicked = entry.server.kick_connections();
        let left = entry.server.drain(DRAIN_TIMEOUT).await;
        if left > 0 {
            log::warn!(instance = %id, connections = left, "Connections still open after kick");
        }

        // Bill what the closed connections carried before the record disappears
        let pending = entry.server.stats().take();
        let flushed = if pending.is_empty() {
            Ok(())
        } else {
            self.storage
                .save_traffic_delta(id, pending.upload, pending.download)
                .await
        };
        if let Err(e) = flushed {
            entry.server.stats().restore(pending);
            if was_running {
                if let Err(se) = entry.server.start().await {
                    log::error!(instance = %id, error = %se, "Failed to restart listener");
                }
            }
            return Err(e.into());
        }
        entry.record.upload = entry.record.upload.saturating_add(pending.upload);
        entry.record.download = entry.record.download.saturating_add(pending.download);

        if let Err(e) = self.storage.delete_proxy(id).await {
            if was_running {
                if let Err(se) = entry.server.start().await {
                    log::error!(instance = %id, error = %se, "Failed to restart listener");
                }
            }
            return Err(e.into());
        }

        registry.remove(&id);
        log::info!(
            instance = %id,
            kicked = kicked,
            upload = pending.upload,
            download = pending.download,
            "Proxy instance deleted"
        );
        Ok(())
    }

    /// Start the listener and mark the instance enabled
    pub async fn enable(&self, id: InstanceId) -> Result<ProxyInstance> {
        let mut registry = self.registry.write().await;
        let port = {
            let entry = registry.get(&id).ok_or(ProxyError::NotFound(id))?;
            if entry.record.enabled && entry.server.is_running() {
                return Ok(entry.snapshot());
            }
            entry.record.port
        };
        if port_in_use(&registry, port, Some(id)) {
            return Err(ProxyError::PortInUse(port));
        }

        let entry = registry.get_mut(&id).ok_or(ProxyError::NotFound(id))?;
        if !entry.server.is_running() {
            entry.server.start().await?;
        }

        let mut record = entry.record.clone();
        record.enabled = true;
        record.updated_at = Utc::now();
        if let Err(e) = self.storage.save_proxy(&record).await {
            let _ = entry.server.stop().await;
            return Err(e.into());
        }
        entry.record = record;

        log::info!(instance = %id, port = port, "Proxy instance enabled");
        Ok(entry.snapshot())
    }

    /// Close the listener and mark the instance disabled
    pub async fn disable(&self, id: InstanceId) -> Result<ProxyInstance> {
        let mut registry = self.registry.write().await;
        let entry = registry.get_mut(&id).ok_or(ProxyError::NotFound(id))?;
        if !entry.record.enabled && !entry.server.is_running() {
            return Ok(entry.snapshot());
        }

        let was_running = entry.server.is_running();
        if was_running {
            entry.server.stop().await?;
        }

        let mut record = entry.record.clone();
        record.enabled = false;
        record.updated_at = Utc::now();
        if let Err(e) = self.storage.save_proxy(&record).await {
            if was_running {
                if let Err(se) = entry.server.start().await {
                    log::error!(instance = %id, error = %se, "Failed to restart listener");
                }
            }
            return Err(e.into());
        }
        entry.record = record;

        log::info!(instance = %id, "Proxy instance disabled");
        Ok(entry.snapshot())
    }

    /// Disable every instance of a user, closing listeners and live connections
    pub async fn disable_user(&self, user_id: UserId) -> Result<Vec<InstanceId>> {
        let mut registry = self.registry.write().await;
        self.storage.disable_user_proxies(user_id).await?;

        let mut disabled = Vec::new();
        for entry in registry.values_mut().filter(|e| e.record.user_id == user_id) {
            if entry.server.is_running() {
                let _ = entry.server.stop().await;
            }
            let kicked = entry.server.kick_connections();
            if entry.record.enabled {
                entry.record.enabled = false;
                entry.record.updated_at = Utc::now();
                disabled.push(entry.record.id);
            }
            log::debug!(instance = %entry.record.id, kicked = kicked, "Instance stopped for user");
        }

        if !disabled.is_empty() {
            log::warn!(user_id = user_id, instances = disabled.len(), "User proxies disabled");
        }
        Ok(disabled)
    }

    /// Persist a traffic delta and add it to the stored totals.
    ///
    /// The write lock is held across the storage call so no concurrent
    /// `save_proxy` can store a record that predates the delta.
    pub async fn update_traffic(&self, id: InstanceId, upload: u64, download: u64) -> Result<()> {
        let mut registry = self.registry.write().await;
        let entry = registry.get_mut(&id).ok_or(ProxyError::NotFound(id))?;

        self.storage
            .save_traffic_delta(id, upload, download)
            .await?;

        entry.record.upload = entry.record.upload.saturating_add(upload);
        entry.record.download = entry.record.download.saturating_add(download);
        if let Some(at) = entry.server.stats().last_active_at() {
            entry.record.last_active_at = Some(at);
        }
        Ok(())
    }

    pub async fn get(&self, id: InstanceId) -> Result<ProxyInstance> {
        self.registry
            .read()
            .await
            .get(&id)
            .map(Entry::snapshot)
            .ok_or(ProxyError::NotFound(id))
    }

    pub async fn is_running(&self, id: InstanceId) -> Result<bool> {
        self.registry
            .read()
            .await
            .get(&id)
            .map(|e| e.server.is_running())
            .ok_or(ProxyError::NotFound(id))
    }

    /// All instances, or only those owned by `user_id`, oldest first
    pub async fn list(&self, user_id: Option<UserId>) -> Vec<ProxyInstance> {
        let registry = self.registry.read().await;
        let mut proxies: Vec<_> = registry
            .values()
            .filter(|e| user_id.map_or(true, |uid| e.record.user_id == uid))
            .map(Entry::snapshot)
            .collect();
        proxies.sort_by_key(|p| p.created_at);
        proxies
    }

    /// Counters of every registered instance
    pub async fn traffic_sources(&self) -> Vec<TrafficSource> {
        self.registry
            .read()
            .await
            .values()
            .map(|e| TrafficSource {
                id: e.record.id,
                user_id: e.record.user_id,
                stats: Arc::clone(e.server.stats()),
            })
            .collect()
    }

    /// Enabled instances whose expiry has passed
    pub async fn expired_instances(&self, now: DateTime<Utc>) -> Vec<InstanceId> {
        self.registry
            .read()
            .await
            .values()
            .filter(|e| e.record.enabled && e.record.is_expired(now))
            .map(|e| e.record.id)
            .collect()
    }

    /// Load every stored instance and start the enabled ones
    pub async fn restore(&self) -> Result<usize> {
        let records = self.storage.list_proxies(None).await?;
        let now = Utc::now();
        let mut registry = self.registry.write().await;
        let mut started = 0;

        for record in records {
            let server = match self.build_server(&record, None) {
                Ok(server) => server,
                Err(e) => {
                    log::error!(instance = %record.id, error = %e, "Skipping stored instance");
                    continue;
                }
            };

            if record.enabled && !record.is_expired(now) {
                if port_in_use(&registry, record.port, None) {
                    log::warn!(instance = %record.id, port = record.port, "Port already taken, instance left stopped");
                } else {
                    match server.start().await {
                        Ok(()) => started += 1,
                        Err(e) => {
                            log::error!(instance = %record.id, error = %e, "Failed to start stored instance")
                        }
                    }
                }
            }
            registry.insert(record.id, Entry { record, server });
        }

        log::info!(total = registry.len(), started = started, "Proxy instances restored");
        Ok(started)
    }

    /// Stop every listener
    pub async fn shutdown(&self) {
        let registry = self.registry.read().await;
        for entry in registry.values() {
            if entry.server.is_running() {
                if let Err(e) = entry.server.stop().await {
                    log::warn!(instance = %entry.record.id, error = %e, "Failed to stop instance");
                }
            }
        }
        log::info!("All proxy instances stopped");
    }
}
