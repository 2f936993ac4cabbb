//! Traffic collector background task
//!
//! Every tick drains each instance's counters into storage, then disables
//! instances whose owner ran out of quota or expired, and instances that
//! expired themselves.

use chrono::Utc;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};

use crate::core::UserId;
use crate::logger::log;
use crate::manager::ProxyManager;

/// Format bytes into human-readable string (KB, MB, GB)
pub fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.2}GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2}MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2}KB", bytes as f64 / KB as f64)
    } else {
        format!("{}B", bytes)
    }
}

/// Outcome of one collection pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CollectReport {
    /// Instances whose delta was persisted
    pub flushed: usize,
    /// Instances whose delta failed and was put back
    pub failed: usize,
    pub upload: u64,
    pub download: u64,
    /// Users whose instances were disabled this pass
    pub disabled_users: Vec<UserId>,
    /// Instances disabled for their own expiry
    pub expired_instances: usize,
}

/// Drain counters once and enforce quotas
pub async fn collect_once(manager: &ProxyManager) -> CollectReport {
    let mut report = CollectReport::default();
    let mut owners = HashSet::new();

    for source in manager.traffic_sources().await {
        owners.insert(source.user_id);

        let delta = source.stats.take();
        if delta.upload == 0 && delta.download == 0 {
            continue;
        }

        match manager
            .update_traffic(source.id, delta.upload, delta.download)
            .await
        {
            Ok(()) => {
                report.flushed += 1;
                report.upload += delta.upload;
                report.download += delta.download;
            }
            Err(e) => {
                // Keep the bytes for the next tick
                source.stats.restore(delta);
                report.failed += 1;
                log::warn!(instance = %source.id, error = %e, "Failed to persist traffic");
            }
        }
    }

    let now = Utc::now();
    for user_id in owners {
        let user = match manager.storage().get_user(user_id).await {
            Ok(Some(user)) => user,
            Ok(None) => continue,
            Err(e) => {
                log::warn!(user_id = user_id, error = %e, "Failed to load user");
                continue;
            }
        };
        if user.may_serve(now) {
            continue;
        }

        match manager.disable_user(user_id).await {
            Ok(ids) if !ids.is_empty() => {
                log::warn!(
                    user_id = user_id,
                    used = %format_bytes(user.traffic_used),
                    limit = %format_bytes(user.traffic_limit),
                    expired = user.is_expired(now),
                    instances = ids.len(),
                    "User over quota or expired, instances disabled"
                );
                report.disabled_users.push(user_id);
            }
            Ok(_) => {}
            Err(e) => log::warn!(user_id = user_id, error = %e, "Failed to disable user"),
        }
    }

    for id in manager.expired_instances(now).await {
        match manager.disable(id).await {
            Ok(_) => {
                log::info!(instance = %id, "Instance expired, disabled");
                report.expired_instances += 1;
            }
            Err(e) => log::warn!(instance = %id, error = %e, "Failed to disable expired instance"),
        }
    }

    if report.flushed > 0 {
        log::info!(
            instances = report.flushed,
            upload = %format_bytes(report.upload),
            download = %format_bytes(report.download),
            "Traffic collected"
        );
    }
    report
}

/// Periodic collector
pub struct TrafficCollector {
    interval: Duration,
    manager: Arc<ProxyManager>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

/// Handle for the spawned collector task
pub struct TrafficCollectorHandle {
    shutdown_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl TrafficCollectorHandle {
    /// Stop the collector after one final flush
    pub async fn shutdown(self) {
        log::info!("Stopping traffic collector...");
        let _ = self.shutdown_tx.send(true);

        match tokio::time::timeout(Duration::from_secs(5), self.handle).await {
            Ok(Ok(())) => log::debug!("Traffic collector stopped"),
            Ok(Err(e)) => log::warn!(error = %e, "Traffic collector panicked"),
            Err(_) => log::warn!("Traffic collector shutdown timeout"),
        }
    }
}

impl TrafficCollector {
    pub fn new(interval: Duration, manager: Arc<ProxyManager>) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Self {
            interval,
            manager,
            shutdown_tx,
            shutdown_rx,
        }
    }

    pub fn start(self) -> TrafficCollectorHandle {
        let manager = Arc::clone(&self.manager);
        let interval_duration = self.interval;
        let mut shutdown_rx = self.shutdown_rx.clone();

        let handle = tokio::spawn(async move {
            let mut interval = interval(interval_duration);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            // The first tick completes immediately
            interval.tick().await;

            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        collect_once(&manager).await;
                    }
                    _ = shutdown_rx.changed() => {
                        log::debug!("Traffic collector shutting down");
                        // Final flush before shutdown
                        collect_once(&manager).await;
                        break;
                    }
                }
            }
        });

        log::info!(interval = ?self.interval, "Traffic collector started");
        TrafficCollectorHandle {
            shutdown_tx: self.shutdown_tx,
            handle,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConnConfig;
    use crate::core::StatsCollector;
    use crate::manager::User;
    use crate::settings::{DokodemoSettings, ProxySettings};
    use crate::storage::{MemoryStorage, Storage};
    use tokio::net::TcpListener;

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(0), "0B");
        assert_eq!(format_bytes(1023), "1023B");
        assert_eq!(format_bytes(1024), "1.00KB");
        assert_eq!(format_bytes(1536), "1.50KB");
        assert_eq!(format_bytes(1024 * 1024), "1.00MB");
        assert_eq!(format_bytes(1024 * 1024 * 1024), "1.00GB");
    }

    async fn free_port() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    }

    fn settings() -> ProxySettings {
        ProxySettings::Dokodemo(DokodemoSettings {
            target_addr: "127.0.0.1".to_string(),
            target_port: 9,
            network: "tcp".to_string(),
            timeout: 0,
        })
    }

    fn setup() -> (Arc<ProxyManager>, Arc<MemoryStorage>) {
        let storage = Arc::new(MemoryStorage::new());
        let config = ConnConfig {
            listen_host: "127.0.0.1".to_string(),
            ..ConnConfig::default()
        };
        (
            Arc::new(ProxyManager::new(storage.clone(), config)),
            storage,
        )
    }

    #[tokio::test]
    async fn test_ticks_sum_without_loss() {
        let (manager, storage) = setup();
        storage.save_user(&User::new(1)).await.unwrap();
        let proxy = manager.create(1, free_port().await, settings(), None).await.unwrap();
        let source = manager.traffic_sources().await.remove(0);

        for _ in 0..5 {
            source.stats.record_upload(100);
            source.stats.record_download(300);
            collect_once(&manager).await;
        }

        let stored = storage.load_proxy(proxy.id).await.unwrap().unwrap();
        assert_eq!(stored.upload, 500);
        assert_eq!(stored.download, 1500);
        assert_eq!(storage.get_user(1).await.unwrap().unwrap().traffic_used, 2000);
        assert_eq!(manager.get(proxy.id).await.unwrap().upload, 500);

        // an idle tick adds nothing
        let report = collect_once(&manager).await;
        assert_eq!(report.flushed, 0);
        assert_eq!(storage.load_proxy(proxy.id).await.unwrap().unwrap().upload, 500);
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_quota_crossing_disables_all_user_instances() {
        let (manager, storage) = setup();
        let mut user = User::new(1);
        user.traffic_limit = 1000;
        storage.save_user(&user).await.unwrap();
        storage.save_user(&User::new(2)).await.unwrap();

        let a = manager.create(1, free_port().await, settings(), None).await.unwrap();
        let b = manager.create(1, free_port().await, settings(), None).await.unwrap();
        let other = manager.create(2, free_port().await, settings(), None).await.unwrap();

        let sources = manager.traffic_sources().await;
        let source_a = sources.iter().find(|s| s.id == a.id).unwrap();
        source_a.stats.record_upload(600);
        source_a.stats.record_download(600);

        let report = collect_once(&manager).await;
        assert_eq!(report.disabled_users, vec![1]);
        for id in [a.id, b.id] {
            assert!(!manager.get(id).await.unwrap().enabled);
            assert!(!manager.is_running(id).await.unwrap());
            assert!(!storage.load_proxy(id).await.unwrap().unwrap().enabled);
        }
        assert!(manager.get(other.id).await.unwrap().enabled);
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_expired_user_is_disabled() {
        let (manager, storage) = setup();
        let mut user = User::new(3);
        user.expire_at = Some(Utc::now() - chrono::Duration::minutes(5));
        storage.save_user(&user).await.unwrap();
        let proxy = manager.create(3, free_port().await, settings(), None).await.unwrap();

        let report = collect_once(&manager).await;
        assert_eq!(report.disabled_users, vec![3]);
        assert!(!manager.get(proxy.id).await.unwrap().enabled);
    }

    #[tokio::test]
    async fn test_expired_instance_is_disabled() {
        let (manager, _) = setup();
        let soon = Utc::now() + chrono::Duration::milliseconds(50);
        let proxy = manager
            .create(1, free_port().await, settings(), Some(soon))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        let report = collect_once(&manager).await;
        assert_eq!(report.expired_instances, 1);
        assert!(!manager.get(proxy.id).await.unwrap().enabled);
    }

    #[tokio::test]
    async fn test_failed_flush_keeps_counters() {
        let (manager, storage) = setup();
        let proxy = manager.create(1, free_port().await, settings(), None).await.unwrap();
        let source = manager.traffic_sources().await.remove(0);
        source.stats.record_upload(42);

        // record vanishes from storage behind the manager's back
        storage.delete_proxy(proxy.id).await.unwrap();
        let report = collect_once(&manager).await;
        assert_eq!(report.failed, 1);
        assert_eq!(source.stats.peek().upload, 42);
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_performs_final_flush() {
        let (manager, storage) = setup();
        let proxy = manager.create(1, free_port().await, settings(), None).await.unwrap();
        let source = manager.traffic_sources().await.remove(0);

        let handle = TrafficCollector::new(Duration::from_secs(3600), Arc::clone(&manager)).start();
        source.stats.record_download(77);
        handle.shutdown().await;

        let stored = storage.load_proxy(proxy.id).await.unwrap().unwrap();
        assert_eq!(stored.download, 77);
        manager.shutdown().await;
    }
}
