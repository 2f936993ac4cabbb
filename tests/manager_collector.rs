//! Manager port guard and collector quota enforcement through the public API

use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use multiproxy_node::collector::collect_once;
use multiproxy_node::config::ConnConfig;
use multiproxy_node::settings::DokodemoSettings;
use multiproxy_node::storage::{MemoryStorage, Storage};
use multiproxy_node::{ProxyError, ProxyManager, ProxySettings, User};

async fn free_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

async fn sink_server() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        while let Ok((mut sock, _)) = listener.accept().await {
            tokio::spawn(async move {
                let mut buf = [0u8; 4096];
                while let Ok(n) = sock.read(&mut buf).await {
                    if n == 0 {
                        break;
                    }
                }
            });
        }
    });
    port
}

fn dokodemo(target_port: u16) -> ProxySettings {
    ProxySettings::Dokodemo(DokodemoSettings {
        target_addr: "127.0.0.1".to_string(),
        target_port,
        network: "tcp".to_string(),
        timeout: 0,
    })
}

fn setup() -> (ProxyManager, Arc<MemoryStorage>) {
    let storage = Arc::new(MemoryStorage::new());
    let config = ConnConfig {
        listen_host: "127.0.0.1".to_string(),
        ..ConnConfig::default()
    };
    (ProxyManager::new(storage.clone(), config), storage)
}

#[tokio::test]
async fn test_port_guard_and_reuse_after_disable() {
    let (manager, _) = setup();
    let port = free_port().await;

    let first = manager.create(1, port, dokodemo(9), None).await.unwrap();
    for _ in 0..3 {
        assert!(matches!(
            manager.create(2, port, dokodemo(9), None).await,
            Err(ProxyError::PortInUse(p)) if p == port
        ));
    }
    assert_eq!(manager.list(None).await.len(), 1);

    manager.disable(first.id).await.unwrap();
    let second = manager.create(2, port, dokodemo(9), None).await.unwrap();
    assert!(manager.is_running(second.id).await.unwrap());
    assert_eq!(manager.list(Some(2)).await.len(), 1);
    manager.shutdown().await;
}

#[tokio::test]
async fn test_quota_enforced_on_real_traffic() {
    let target = sink_server().await;
    let (manager, storage) = setup();
    let mut user = User::new(9);
    user.traffic_limit = 4096;
    storage.save_user(&user).await.unwrap();

    let port = free_port().await;
    let proxy = manager.create(9, port, dokodemo(target), None).await.unwrap();

    let mut client = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    client.write_all(&[0u8; 8192]).await.unwrap();
    drop(client);

    // wait for the relay to finish and count its bytes
    for _ in 0..50 {
        if manager.get(proxy.id).await.unwrap().upload >= 8192 {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    }

    let report = collect_once(&manager).await;
    assert_eq!(report.upload, 8192);
    assert_eq!(report.disabled_users, vec![9]);

    let stored = storage.load_proxy(proxy.id).await.unwrap().unwrap();
    assert!(!stored.enabled);
    assert_eq!(stored.upload, 8192);
    assert!(!manager.is_running(proxy.id).await.unwrap());
    assert!(TcpStream::connect(("127.0.0.1", port)).await.is_err());
    assert!(storage.get_user(9).await.unwrap().unwrap().traffic_used >= 8192);
}
